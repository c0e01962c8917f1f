//! Read-only node and pod snapshots as seen by a cluster agent.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::core::{ComputeResources, SchedulerError};

/// Label carrying the job id on every pod this scheduler creates.
pub const JOB_ID_LABEL: &str = "batchlease.io/job-id";
/// Label carrying the owning queue name.
pub const QUEUE_LABEL: &str = "batchlease.io/queue";

/// Effect of a node taint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaintEffect {
    /// New pods are not scheduled onto the node.
    NoSchedule,
    /// Scheduler avoids the node if it can.
    PreferNoSchedule,
    /// Running pods are evicted.
    NoExecute,
}

/// Node taint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Taint {
    /// Taint key.
    pub key: String,
    /// Taint effect.
    pub effect: TaintEffect,
}

/// Snapshot of one node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    /// Node name, referenced by [`Pod::node_name`].
    pub name: String,
    /// Cordoned by an operator.
    pub unschedulable: bool,
    /// Taints applied to the node.
    pub taints: Vec<Taint>,
    /// Allocatable resources.
    pub allocatable: ComputeResources,
}

impl Node {
    /// An available processing node accepts new work: not cordoned and free of
    /// any `NoSchedule` taint.
    pub fn is_available_for_processing(&self) -> bool {
        !self.unschedulable
            && !self
                .taints
                .iter()
                .any(|t| t.effect == TaintEffect::NoSchedule)
    }
}

/// Lifecycle phase of a pod.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PodPhase {
    /// Accepted but not all containers started.
    Pending,
    /// Bound and running.
    Running,
    /// All containers exited successfully.
    Succeeded,
    /// At least one container failed.
    Failed,
    /// State could not be determined.
    Unknown,
}

/// Snapshot of one pod.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pod {
    /// Pod name.
    pub name: String,
    /// Node the pod is bound to; `None` while pending admission.
    pub node_name: Option<String>,
    /// Pod labels.
    pub labels: HashMap<String, String>,
    /// Summed resource requests of the pod's containers.
    pub requests: ComputeResources,
    /// Current phase.
    pub phase: PodPhase,
}

impl Pod {
    /// Pods created by this scheduler carry the job id label.
    pub fn is_managed(&self) -> bool {
        self.labels.contains_key(JOB_ID_LABEL)
    }

    /// Succeeded or failed pods hold no resources.
    pub const fn is_completed(&self) -> bool {
        matches!(self.phase, PodPhase::Succeeded | PodPhase::Failed)
    }

    /// Owning queue from the queue label.
    pub fn queue(&self) -> Option<&str> {
        self.labels.get(QUEUE_LABEL).map(String::as_str)
    }
}

/// Source of node and pod snapshots for one cluster.
#[async_trait]
pub trait ClusterSnapshotProvider: Send + Sync {
    /// All nodes currently known.
    async fn list_nodes(&self) -> Result<Vec<Node>, SchedulerError>;
    /// All pods currently known, managed or not.
    async fn list_pods(&self) -> Result<Vec<Pod>, SchedulerError>;
}

/// Fixed snapshot, useful for tests and for agents that poll on their own.
#[derive(Debug, Clone, Default)]
pub struct StaticSnapshot {
    /// Nodes returned by [`ClusterSnapshotProvider::list_nodes`].
    pub nodes: Vec<Node>,
    /// Pods returned by [`ClusterSnapshotProvider::list_pods`].
    pub pods: Vec<Pod>,
}

#[async_trait]
impl ClusterSnapshotProvider for StaticSnapshot {
    async fn list_nodes(&self) -> Result<Vec<Node>, SchedulerError> {
        Ok(self.nodes.clone())
    }

    async fn list_pods(&self) -> Result<Vec<Pod>, SchedulerError> {
        Ok(self.pods.clone())
    }
}
