//! Configuration models for leases, scheduling and event backends.

pub mod scheduler;

pub use scheduler::{
    EventBackendConfig, LeaseConfig, LogBackendConfig, SchedulerConfig, SchedulingConfig,
    StreamBackendConfig,
};
