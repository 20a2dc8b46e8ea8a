//! Job queue: data model plus the handler registry and polling dispatcher.

pub mod dispatcher;
pub mod model;
pub mod registry;

pub use dispatcher::{CycleReport, Dispatcher, DispatcherHandle};
pub use model::{JobId, JobRecord, JobStatus, JobType, NewJob};
pub use registry::{FnHandler, HandlerRegistry, JobHandler};
