//! Durable store backends for jobs, usage history and materialised events.

pub mod file;
pub(crate) mod materialized;
pub mod memory;

pub use file::{FileEventRepository, FileUsageRepository};
pub use memory::{InMemoryEventRepository, InMemoryJobRepository, InMemoryUsageRepository};
