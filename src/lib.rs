//! # Batchlease
//!
//! Scheduler core for running batch jobs across several compute clusters.
//!
//! Cluster agents push periodic usage reports. The scheduler turns them into
//! a decayed, fair-share ranking of queues and leases queued jobs to clusters
//! with spare capacity. Every lifecycle change is recorded in a job event log
//! that can sit directly on the read store or behind a log or pub/sub broker.
//!
//! ## Key pieces
//!
//! - **Resource accounting** ([`core::accounting`]): capacity, per-queue usage
//!   and available capacity from node and pod snapshots.
//! - **Fair share** ([`core::priority`]): exponentially decayed usage folded
//!   from report history, ranked against each queue's share of capacity.
//! - **Leases** ([`core::lease`]): grants, progress renewals and expiry, all
//!   optimistic compare-and-swap updates paired with event appends.
//! - **Event log** ([`core::events`], [`infra::transport`],
//!   [`infra::replication`]): direct, log and stream backends with
//!   idempotent replication keyed by `(job id, sequence)`.
//! - **Background tasks** ([`runtime::tasks`]): independent periodic loops
//!   with bounded graceful shutdown.
//!
//! ## Quick start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use batchlease::config::SchedulerConfig;
//! use batchlease::core::{ComputeResources, Queue, QueueRepository};
//! use batchlease::infra::{InMemoryEventRepository, InMemoryJobRepository, InMemoryUsageRepository};
//! use batchlease::runtime::{start, JobSubmission, Repositories};
//! use batchlease::util::{init_tracing, now_ms};
//!
//! init_tracing();
//! let jobs = Arc::new(InMemoryJobRepository::new());
//! jobs.create_queue(Queue::new("research")).await?;
//! let server = start(&SchedulerConfig::default(), Repositories {
//!     jobs: jobs.clone(),
//!     queues: jobs,
//!     usage: Arc::new(InMemoryUsageRepository::new()),
//!     events: Arc::new(InMemoryEventRepository::new()),
//! }).await?;
//!
//! server.jobs.submit_jobs("alice", "research", "batch-1", vec![JobSubmission {
//!     priority: 0,
//!     requests: ComputeResources::parse([("cpu", "500m"), ("memory", "1Gi")])?,
//! }]).await?;
//! let leased = server.leases
//!     .lease_jobs("cluster-a", &ComputeResources::from_units([("cpu", 8)]), now_ms())
//!     .await?;
//! server.shutdown().await;
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

/// Builders to construct scheduler components from configuration.
pub mod builders;
/// Configuration models for leases, scheduling and event backends.
pub mod config;
/// Core scheduling model: resources, accounting, fair share, leases and events.
pub mod core;
/// Infrastructure adapters: durable stores, broker transports and replication.
pub mod infra;
/// Runtime surface: job API, background tasks and server assembly.
pub mod runtime;
/// Shared utilities.
pub mod util;
