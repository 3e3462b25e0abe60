//! Synthetic stand-in for the detector used in simulation mode.
//!
//! The emulator replays a window of prerecorded JPEG frames over an MJPEG
//! endpoint and, on a second endpoint, the detections recorded for each frame
//! converted to absolute pixel boxes. Both streams are driven by one cursor so
//! a metadata record always describes the frame written on the same tick.
//!
//! - `assets` loads the frames and canned detections.
//! - `cursor` walks the looping frame window.
//! - `session` keeps at most one image session alive.
//! - `stream` ties the above together and produces the wire payloads.
//! - `server` exposes both streams over HTTP.

mod assets;
mod cursor;
mod server;
mod session;
mod stream;

pub(crate) use assets::EmulatorAssets;
pub(crate) use server::{EmulatorServers, spawn_emulator_servers};
pub(crate) use stream::EmulatorCore;

#[cfg(test)]
pub(crate) use stream::tests::fixture_assets;
