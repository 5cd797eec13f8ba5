//! Starts, stops and supervises project processes.
//!
//! The launcher detects what kind of project it is looking at, allocates ports, merges the
//! project's environment, spawns the process with its output redirected to a per-environment log,
//! and keeps polling it until it is stopped.

mod detect;
mod health;
mod model;
mod ports;
mod process_launcher;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use detect::*;
pub use model::*;
pub use ports::*;
pub use process_launcher::*;
