//! Builders to construct scheduler components from configuration.

pub mod event_log_builder;

pub use event_log_builder::{
    build_event_backend, in_memory_log, in_memory_stream, EventBackend, Replication,
};
