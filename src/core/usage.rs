//! Cluster usage reports and the repository that keeps their history.

use std::collections::HashSet;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::core::{ComputeResources, PrioritySnapshot, SchedulerError};

/// Aggregated resource usage of one queue within one cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueReport {
    /// Queue name.
    pub name: String,
    /// Summed requests of the queue's active pods.
    pub resources: ComputeResources,
}

/// One reporting cycle of one cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterUsageReport {
    /// Reporting cluster.
    pub cluster_id: String,
    /// When the snapshot was taken (ms since epoch).
    pub report_time_ms: u128,
    /// Allocatable capacity of the cluster's available processing nodes.
    pub cluster_capacity: ComputeResources,
    /// Per-queue usage, ordered by queue name.
    pub queues: Vec<QueueReport>,
}

impl ClusterUsageReport {
    /// Reject reports that can never be applied.
    pub fn validate(&self) -> Result<(), SchedulerError> {
        if self.cluster_id.trim().is_empty() {
            return Err(SchedulerError::invalid("cluster_id", "must not be empty"));
        }
        let mut seen = HashSet::new();
        for queue in &self.queues {
            if queue.name.is_empty() {
                return Err(SchedulerError::invalid("queues.name", "must not be empty"));
            }
            if !seen.insert(queue.name.as_str()) {
                return Err(SchedulerError::invalid(
                    "queues.name",
                    format!("queue `{}` reported twice", queue.name),
                ));
            }
            if queue.resources.is_negative_anywhere() {
                return Err(SchedulerError::invalid(
                    "queues.resources",
                    format!("queue `{}` reports negative usage", queue.name),
                ));
            }
        }
        Ok(())
    }

    /// Usage of one queue, empty when the queue is not in this report.
    pub fn queue_usage(&self, queue: &str) -> Option<&ComputeResources> {
        self.queues
            .iter()
            .find(|q| q.name == queue)
            .map(|q| &q.resources)
    }
}

/// A value read together with the version it must be written back against.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Versioned<T> {
    /// The value.
    pub value: T,
    /// Version to pass as `expected_version` on write.
    pub version: u64,
}

/// Durable store of usage history and the derived priority snapshot.
#[async_trait]
pub trait UsageRepository: Send + Sync {
    /// Persist a report. Re-appending the same `(cluster_id, report_time_ms)` overwrites.
    async fn append_report(&self, report: &ClusterUsageReport) -> Result<(), SchedulerError>;
    /// Full history ordered by `(report_time_ms, cluster_id)`.
    async fn history(&self) -> Result<Vec<ClusterUsageReport>, SchedulerError>;
    /// Current priority snapshot and its version.
    async fn load_priorities(&self) -> Result<Versioned<PrioritySnapshot>, SchedulerError>;
    /// Write the snapshot only if nobody else wrote since `expected_version`.
    /// Returns `false` on a version conflict.
    async fn store_priorities(
        &self,
        snapshot: &PrioritySnapshot,
        expected_version: u64,
    ) -> Result<bool, SchedulerError>;
}

/// Transport delivering reports from a cluster agent to the accounting sink.
#[async_trait]
pub trait UsageClient: Send + Sync {
    /// Deliver one report.
    async fn report_usage(&self, report: &ClusterUsageReport) -> Result<(), SchedulerError>;
}
