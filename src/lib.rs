//! AI Queue: rate-limited background dispatcher for AI analysis jobs.

pub mod clock;
pub mod config;
pub mod error;
pub mod handlers;
pub mod limiter;
pub mod queue;
pub mod store;
