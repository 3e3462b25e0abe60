//! Detector process supervision.
//!
//! - `config` parses the deployment file and CLI flags.
//! - `state` is the lifecycle state machine and its status snapshot.
//! - `handle` wraps the process monitor or the stream emulator behind one event feed.
//! - `lifecycle` is the `Supervisor` facade driving either handle.
//! - `control` exposes the facade over HTTP.

mod config;
pub(crate) mod control;
mod handle;
mod lifecycle;
mod state;

pub use config::{
    EmulatorSettings, FrameWindow, ServeCliArgs, ServeConfig, SupervisorSettings,
    TelemetryOptions,
};
pub use lifecycle::Supervisor;
