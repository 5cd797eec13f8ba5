//! Project backups: full and incremental archives, chain restore, verification, retention and
//! cron scheduling.

mod archive;
mod coordinator;
mod database;
mod model;
mod schedule;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use archive::*;
pub use coordinator::*;
pub use database::*;
pub use model::*;
pub use schedule::*;
