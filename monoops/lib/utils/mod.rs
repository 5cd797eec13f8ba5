//! Utility functions and types.

mod command;
mod env;
mod file;
mod path;
mod process;
mod slots;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use command::*;
pub use env::*;
pub use file::*;
pub use path::*;
pub use process::*;
pub use slots::*;
