//! Runtime surface: job API, background tasks and server assembly.

pub mod api;
pub mod server;
pub mod tasks;

pub use api::{JobService, JobStatusResponse, JobSubmission};
pub use server::{register_cluster_reporting, start, start_with, Repositories, ServerHandle};
pub use tasks::BackgroundTaskManager;
