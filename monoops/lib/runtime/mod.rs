//! Process supervision and OS inspection shared by the launcher and the allocator.

mod probe;
mod supervisor;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use probe::*;
pub use supervisor::*;
