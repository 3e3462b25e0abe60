use clap::{Parser, Subcommand};

use crate::supervisor::ServeCliArgs;

/// Supervisor for the external object detector, with a prerecorded simulation mode.
#[derive(Debug, Parser)]
#[command(name = "detector-supervisor", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Initialize the detector (or emulator), start it, and serve the control API.
    Serve(ServeCliArgs),
}
