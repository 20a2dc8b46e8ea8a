//! Persistence layer: job store contract plus in-memory and libSQL backends.

pub mod libsql_backend;
pub mod memory;
mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlJobStore;
pub use memory::MemoryJobStore;
pub use traits::{JobFilter, JobOrder, JobStore, JobUpdate};
