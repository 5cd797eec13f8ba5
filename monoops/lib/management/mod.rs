//! Wiring of every component into one handle, used by the CLI and by embedders.

mod services;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use services::*;
