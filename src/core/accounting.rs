//! Resource accounting: turns node/pod snapshots into capacity and per-queue usage.
//!
//! Everything here except the two service entry points is a pure transform over
//! the snapshot; no state is kept between cycles.

use std::collections::{BTreeMap, HashSet};

use crate::core::{
    ClusterSnapshotProvider, ClusterUsageReport, ComputeResources, Node, Pod, QueueReport,
    SchedulerError, UsageClient,
};
use crate::util::clock::now_ms;

/// Nodes that can receive new work.
pub fn filter_available_processing_nodes(nodes: &[Node]) -> Vec<&Node> {
    nodes
        .iter()
        .filter(|n| n.is_available_for_processing())
        .collect()
}

/// Summed allocatable resources of the given nodes.
pub fn total_allocatable<'a>(nodes: impl IntoIterator<Item = &'a Node>) -> ComputeResources {
    ComputeResources::total(nodes.into_iter().map(|n| &n.allocatable))
}

/// Summed requests of the given pods.
pub fn total_requests<'a>(pods: impl IntoIterator<Item = &'a Pod>) -> ComputeResources {
    ComputeResources::total(pods.into_iter().map(|p| &p.requests))
}

/// Pods holding (or about to hold) resources on the processing nodes: bound to
/// one of them, or managed and not yet bound anywhere.
pub fn pods_requiring_resource_on_processing_nodes<'a>(
    pods: &'a [Pod],
    processing_nodes: &[&Node],
) -> Vec<&'a Pod> {
    let names: HashSet<&str> = processing_nodes.iter().map(|n| n.name.as_str()).collect();
    pods.iter()
        .filter(|pod| match pod.node_name.as_deref() {
            Some(node) if !node.is_empty() => names.contains(node),
            _ => pod.is_managed(),
        })
        .collect()
}

/// Capacity of processing nodes minus requests of their non-completed pods.
/// The result is not floored at zero.
pub fn available_capacity(nodes: &[Node], pods: &[Pod]) -> ComputeResources {
    let processing = filter_available_processing_nodes(nodes);
    let consuming: Vec<&Pod> = pods_requiring_resource_on_processing_nodes(pods, &processing)
        .into_iter()
        .filter(|p| !p.is_completed())
        .collect();
    total_allocatable(processing).minus(&total_requests(consuming))
}

/// Per-queue usage of managed, non-completed pods. Pods without a queue label
/// are logged and left out.
pub fn usage_by_queue<'a>(pods: impl IntoIterator<Item = &'a Pod>) -> BTreeMap<String, ComputeResources> {
    let mut usage: BTreeMap<String, ComputeResources> = BTreeMap::new();
    for pod in pods {
        if !pod.is_managed() || pod.is_completed() {
            continue;
        }
        let Some(queue) = pod.queue() else {
            tracing::error!(pod = %pod.name, "pod found not belonging to a queue, not reporting its usage");
            continue;
        };
        match usage.get_mut(queue) {
            Some(total) => total.add(&pod.requests),
            None => {
                usage.insert(queue.to_string(), pod.requests.clone());
            }
        }
    }
    usage
}

/// Build the per-queue report list, ordered by queue name.
pub fn queue_reports(pods: &[Pod]) -> Vec<QueueReport> {
    usage_by_queue(pods)
        .into_iter()
        .map(|(name, resources)| QueueReport { name, resources })
        .collect()
}

/// Cluster-side service computing and pushing usage reports.
pub struct ClusterUtilisationService<P, U> {
    cluster_id: String,
    snapshots: P,
    usage_client: U,
}

impl<P, U> ClusterUtilisationService<P, U>
where
    P: ClusterSnapshotProvider,
    U: UsageClient,
{
    /// Create a service for one cluster.
    pub fn new(cluster_id: impl Into<String>, snapshots: P, usage_client: U) -> Self {
        Self {
            cluster_id: cluster_id.into(),
            snapshots,
            usage_client,
        }
    }

    /// Identity stamped on every report.
    pub fn cluster_id(&self) -> &str {
        &self.cluster_id
    }

    /// Snapshot the cluster and build a report. Any snapshot failure aborts
    /// the whole report.
    pub async fn build_usage_report(&self) -> Result<ClusterUsageReport, SchedulerError> {
        let nodes = self.snapshots.list_nodes().await?;
        let pods = self.snapshots.list_pods().await?;
        let capacity = total_allocatable(filter_available_processing_nodes(&nodes));

        Ok(ClusterUsageReport {
            cluster_id: self.cluster_id.clone(),
            report_time_ms: now_ms(),
            cluster_capacity: capacity,
            queues: queue_reports(&pods),
        })
    }

    /// Build a report and push it to the usage sink.
    pub async fn try_report_cluster_utilisation(
        &self,
    ) -> Result<ClusterUsageReport, SchedulerError> {
        let report = self.build_usage_report().await?;
        self.usage_client.report_usage(&report).await?;
        tracing::debug!(
            cluster_id = %self.cluster_id,
            capacity = %report.cluster_capacity,
            queues = report.queues.len(),
            "reported cluster usage"
        );
        Ok(report)
    }

    /// Periodic entry point: failures are logged and the cycle is skipped.
    pub async fn report_cluster_utilisation(&self) {
        if let Err(e) = self.try_report_cluster_utilisation().await {
            tracing::error!(cluster_id = %self.cluster_id, error = %e, "failed to report cluster usage");
        }
    }

    /// Capacity left for new leases right now.
    pub async fn available_cluster_capacity(&self) -> Result<ComputeResources, SchedulerError> {
        let nodes = self.snapshots.list_nodes().await?;
        let pods = self.snapshots.list_pods().await?;
        Ok(available_capacity(&nodes, &pods))
    }
}
