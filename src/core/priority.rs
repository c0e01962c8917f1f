//! Fair-share priority: exponentially decayed queue usage turned into a lease order.
//!
//! On every usage report each queue's decayed usage moves toward its current
//! usage:
//!
//! ```text
//! f       = 0.5 ^ (elapsed / half_time)
//! decayed = decayed * f + current * (1 - f)
//! ```
//!
//! The persisted [`PrioritySnapshot`] is a pure fold over the report history
//! taken in `(report time, cluster id)` order, so it can be rebuilt after a
//! restart with [`FairShareEngine::recompute`]. A report that arrives after a
//! later one was already folded is not folded on top; the snapshot is
//! recomputed from history instead, which keeps the result independent of
//! arrival order.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::core::{ClusterUsageReport, Queue, SchedulerError, UsageClient, UsageRepository};

/// Optimistic-concurrency attempts before giving up on a snapshot write.
const MAX_UPDATE_ATTEMPTS: usize = 8;

/// Decayed usage of one queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct QueueUsageState {
    /// Exponentially decayed usage, in scarcity-weighted units.
    pub decayed_usage: f64,
    /// Report time of the last update (ms since epoch).
    pub last_update_ms: u128,
}

/// Everything needed to rank queues, derived from usage history.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PrioritySnapshot {
    /// Decayed usage per queue.
    pub queues: BTreeMap<String, QueueUsageState>,
    /// Latest report received from each cluster.
    pub clusters: BTreeMap<String, ClusterUsageReport>,
    /// Fold position of the last report applied: `(report time, cluster id)`.
    #[serde(default)]
    pub folded_through: Option<(u128, String)>,
}

/// Ranking entry for one queue. Lower `priority` leases first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuePriority {
    /// Queue name.
    pub queue: String,
    /// Decayed usage relative to the queue's fair share of capacity.
    pub priority: f64,
}

fn fold_position(report: &ClusterUsageReport) -> (u128, String) {
    (report.report_time_ms, report.cluster_id.clone())
}

/// `0.5 ^ (elapsed / half_time)`; 1.0 when no time has passed.
pub fn decay_factor(elapsed: Duration, half_time: Duration) -> f64 {
    if half_time.is_zero() {
        return 0.0;
    }
    0.5_f64.powf(elapsed.as_secs_f64() / half_time.as_secs_f64())
}

/// Pure priority computations parameterised by half time and resource scarcity.
#[derive(Debug, Clone)]
pub struct FairShareEngine {
    half_time: Duration,
    scarcity: HashMap<String, f64>,
}

impl FairShareEngine {
    /// Create an engine.
    pub const fn new(half_time: Duration, scarcity: HashMap<String, f64>) -> Self {
        Self {
            half_time,
            scarcity,
        }
    }

    /// Configured half time.
    pub const fn half_time(&self) -> Duration {
        self.half_time
    }

    /// Fold one report into the snapshot. Returns `false` (and leaves the
    /// snapshot unchanged) when the cluster already reported at or after this time.
    pub fn apply_report(&self, snapshot: &mut PrioritySnapshot, report: &ClusterUsageReport) -> bool {
        if let Some(previous) = snapshot.clusters.get(&report.cluster_id) {
            if previous.report_time_ms >= report.report_time_ms {
                return false;
            }
        }
        snapshot
            .clusters
            .insert(report.cluster_id.clone(), report.clone());
        let position = fold_position(report);
        if snapshot.folded_through.as_ref().is_none_or(|p| *p < position) {
            snapshot.folded_through = Some(position);
        }

        let current = self.current_usage(snapshot);
        let names: BTreeSet<String> = snapshot
            .queues
            .keys()
            .chain(current.keys())
            .cloned()
            .collect();
        let now = report.report_time_ms;

        for name in names {
            let usage = current.get(&name).copied().unwrap_or(0.0);
            match snapshot.queues.get_mut(&name) {
                Some(state) => {
                    let elapsed = now.saturating_sub(state.last_update_ms);
                    let elapsed = Duration::from_millis(u64::try_from(elapsed).unwrap_or(u64::MAX));
                    let f = decay_factor(elapsed, self.half_time);
                    state.decayed_usage = state.decayed_usage * f + usage * (1.0 - f);
                    state.last_update_ms = state.last_update_ms.max(now);
                }
                None => {
                    snapshot.queues.insert(
                        name,
                        QueueUsageState {
                            decayed_usage: usage,
                            last_update_ms: now,
                        },
                    );
                }
            }
        }
        true
    }

    /// Whether `report` sorts before something already folded into
    /// `snapshot`, so folding it on top would not match [`Self::recompute`].
    pub fn is_late(snapshot: &PrioritySnapshot, report: &ClusterUsageReport) -> bool {
        snapshot
            .folded_through
            .as_ref()
            .is_some_and(|folded| fold_position(report) < *folded)
    }

    /// Rebuild a snapshot from persisted history.
    pub fn recompute(&self, history: &[ClusterUsageReport]) -> PrioritySnapshot {
        let mut ordered: Vec<&ClusterUsageReport> = history.iter().collect();
        ordered.sort_by_key(|r| fold_position(r));
        let mut snapshot = PrioritySnapshot::default();
        for report in ordered {
            self.apply_report(&mut snapshot, report);
        }
        snapshot
    }

    /// Current (undecayed) usage per queue summed over each cluster's latest report.
    fn current_usage(&self, snapshot: &PrioritySnapshot) -> BTreeMap<String, f64> {
        let mut usage = BTreeMap::new();
        for report in snapshot.clusters.values() {
            for queue in &report.queues {
                *usage.entry(queue.name.clone()).or_insert(0.0) +=
                    queue.resources.scalar(&self.scarcity);
            }
        }
        usage
    }

    /// Total capacity across clusters, scarcity-weighted.
    pub fn total_capacity(&self, snapshot: &PrioritySnapshot) -> f64 {
        snapshot
            .clusters
            .values()
            .map(|r| r.cluster_capacity.scalar(&self.scarcity))
            .sum()
    }

    /// Order queues for leasing, most under-served first; ties broken by name.
    ///
    /// Each queue's fair share is an equal split of total capacity. A queue's
    /// priority is `decayed_usage * priority_factor / fair_share`, so a queue
    /// at half its share ranks twice as favourably as one at its full share.
    pub fn rank(&self, snapshot: &PrioritySnapshot, queues: &[Queue]) -> Vec<QueuePriority> {
        if queues.is_empty() {
            return Vec::new();
        }
        #[allow(clippy::cast_precision_loss)]
        let fair_share = self.total_capacity(snapshot) / queues.len() as f64;
        let mut ranked: Vec<QueuePriority> = queues
            .iter()
            .map(|q| {
                let decayed = snapshot
                    .queues
                    .get(&q.name)
                    .map_or(0.0, |s| s.decayed_usage);
                let weighted = decayed * q.priority_factor;
                let priority = if fair_share > 0.0 {
                    weighted / fair_share
                } else {
                    weighted
                };
                QueuePriority {
                    queue: q.name.clone(),
                    priority,
                }
            })
            .collect();
        ranked.sort_by(|a, b| {
            a.priority
                .total_cmp(&b.priority)
                .then_with(|| a.queue.cmp(&b.queue))
        });
        ranked
    }
}

/// Server-side usage sink: persists reports and keeps the priority snapshot current.
#[derive(Clone)]
pub struct UsageService {
    repository: Arc<dyn UsageRepository>,
    engine: FairShareEngine,
}

impl UsageService {
    /// Create the service.
    pub fn new(repository: Arc<dyn UsageRepository>, engine: FairShareEngine) -> Self {
        Self { repository, engine }
    }

    /// Engine used for decay and ranking.
    pub const fn engine(&self) -> &FairShareEngine {
        &self.engine
    }

    /// Validate, persist and fold a report into the stored snapshot.
    pub async fn record_report(&self, report: &ClusterUsageReport) -> Result<(), SchedulerError> {
        report.validate()?;
        self.repository.append_report(report).await?;

        for attempt in 1..=MAX_UPDATE_ATTEMPTS {
            let current = self.repository.load_priorities().await?;
            let mut snapshot = current.value;
            if FairShareEngine::is_late(&snapshot, report) {
                tracing::debug!(
                    cluster_id = %report.cluster_id,
                    report_time_ms = %report.report_time_ms,
                    "late usage report, recomputing priorities from history"
                );
                let history = self.repository.history().await?;
                snapshot = self.engine.recompute(&history);
            } else if !self.engine.apply_report(&mut snapshot, report) {
                return Ok(());
            }
            if self
                .repository
                .store_priorities(&snapshot, current.version)
                .await?
            {
                return Ok(());
            }
            tracing::debug!(cluster_id = %report.cluster_id, attempt, "priority snapshot changed underneath, retrying");
        }
        Err(SchedulerError::Conflict(format!(
            "priority update for cluster {} lost {MAX_UPDATE_ATTEMPTS} races",
            report.cluster_id
        )))
    }

    /// Current ranking of the given queues.
    pub async fn queue_priorities(&self, queues: &[Queue]) -> Result<Vec<QueuePriority>, SchedulerError> {
        let snapshot = self.repository.load_priorities().await?;
        Ok(self.engine.rank(&snapshot.value, queues))
    }

    /// Recompute the snapshot from history and store it, replacing whatever is there.
    pub async fn rebuild_from_history(&self) -> Result<PrioritySnapshot, SchedulerError> {
        let history = self.repository.history().await?;
        let rebuilt = self.engine.recompute(&history);
        for _ in 0..MAX_UPDATE_ATTEMPTS {
            let current = self.repository.load_priorities().await?;
            if self
                .repository
                .store_priorities(&rebuilt, current.version)
                .await?
            {
                tracing::info!(reports = history.len(), queues = rebuilt.queues.len(), "rebuilt priorities from usage history");
                return Ok(rebuilt);
            }
        }
        Err(SchedulerError::Conflict("priority rebuild kept losing races".into()))
    }
}

#[async_trait]
impl UsageClient for UsageService {
    async fn report_usage(&self, report: &ClusterUsageReport) -> Result<(), SchedulerError> {
        self.record_report(report).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{ComputeResources, QueueReport};

    const MINUTE: u128 = 60_000;

    fn engine() -> FairShareEngine {
        FairShareEngine::new(
            Duration::from_secs(600),
            HashMap::from([("cpu".to_string(), 1.0)]),
        )
    }

    fn report(cluster: &str, at: u128, usage: &[(&str, i64)]) -> ClusterUsageReport {
        ClusterUsageReport {
            cluster_id: cluster.into(),
            report_time_ms: at,
            cluster_capacity: ComputeResources::from_units([("cpu", 10)]),
            queues: usage
                .iter()
                .map(|(name, cpu)| QueueReport {
                    name: (*name).to_string(),
                    resources: ComputeResources::from_units([("cpu", *cpu)]),
                })
                .collect(),
        }
    }

    #[test]
    fn test_decay_factor_halves_per_half_time() {
        let h = Duration::from_secs(60);
        assert!((decay_factor(Duration::ZERO, h) - 1.0).abs() < 1e-12);
        assert!((decay_factor(h, h) - 0.5).abs() < 1e-12);
        assert!((decay_factor(h * 3, h) - 0.125).abs() < 1e-12);
    }

    #[test]
    fn test_usage_decays_after_queue_goes_idle() {
        let e = engine();
        let mut s = PrioritySnapshot::default();
        e.apply_report(&mut s, &report("c1", 0, &[("a", 8)]));
        assert!((s.queues["a"].decayed_usage - 8.0).abs() < 1e-9);

        // one half time of zero usage halves the estimate
        e.apply_report(&mut s, &report("c1", 10 * MINUTE, &[]));
        assert!((s.queues["a"].decayed_usage - 4.0).abs() < 1e-9);

        // ten more half times: negligible
        e.apply_report(&mut s, &report("c1", 110 * MINUTE, &[]));
        assert!(s.queues["a"].decayed_usage < 8.0 / 1000.0);
    }

    #[test]
    fn test_stale_or_duplicate_report_ignored() {
        let e = engine();
        let mut s = PrioritySnapshot::default();
        assert!(e.apply_report(&mut s, &report("c1", 5, &[("a", 1)])));
        let before = s.clone();
        assert!(!e.apply_report(&mut s, &report("c1", 5, &[("a", 9)])));
        assert!(!e.apply_report(&mut s, &report("c1", 3, &[("a", 9)])));
        assert_eq!(s, before);
    }

    #[test]
    fn test_rank_prefers_under_served_queue() {
        let e = engine();
        let mut s = PrioritySnapshot::default();
        e.apply_report(&mut s, &report("c1", 0, &[("a", 2), ("b", 4)]));
        let queues = vec![Queue::new("b"), Queue::new("a"), Queue::new("c")];
        let ranked = e.rank(&s, &queues);
        let order: Vec<_> = ranked.iter().map(|p| p.queue.as_str()).collect();
        assert_eq!(order, vec!["c", "a", "b"]);
        // a uses half of what b uses against the same share
        assert!((ranked[2].priority / ranked[1].priority - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_rank_ties_broken_by_name() {
        let e = engine();
        let s = PrioritySnapshot::default();
        let ranked = e.rank(&s, &[Queue::new("z"), Queue::new("m"), Queue::new("a")]);
        let order: Vec<_> = ranked.iter().map(|p| p.queue.as_str()).collect();
        assert_eq!(order, vec!["a", "m", "z"]);
    }

    #[test]
    fn test_recompute_matches_incremental() {
        let e = engine();
        let history = vec![
            report("c2", 2 * MINUTE, &[("b", 3)]),
            report("c1", 0, &[("a", 4)]),
            report("c1", 7 * MINUTE, &[("a", 1), ("b", 2)]),
            report("c2", 9 * MINUTE, &[]),
        ];
        let mut incremental = PrioritySnapshot::default();
        let mut sorted = history.clone();
        sorted.sort_by_key(|r| r.report_time_ms);
        for r in &sorted {
            e.apply_report(&mut incremental, r);
        }
        assert_eq!(e.recompute(&history), incremental);
    }

    #[test]
    fn test_report_behind_fold_position_is_late() {
        let e = engine();
        let mut s = PrioritySnapshot::default();
        e.apply_report(&mut s, &report("c1", 10 * MINUTE, &[("a", 8)]));
        assert!(FairShareEngine::is_late(&s, &report("c2", 2 * MINUTE, &[])));
        assert!(!FairShareEngine::is_late(&s, &report("c2", 10 * MINUTE, &[])));
        assert!(!FairShareEngine::is_late(&s, &report("c0", 11 * MINUTE, &[])));
        assert!(FairShareEngine::is_late(&s, &report("c0", 10 * MINUTE, &[])));
    }

    #[tokio::test]
    async fn test_late_report_gives_same_snapshot_as_rebuild() {
        let repo = Arc::new(crate::infra::InMemoryUsageRepository::new());
        let usage = UsageService::new(repo.clone(), engine());
        usage.record_report(&report("c1", 10 * MINUTE, &[("a", 8)])).await.unwrap();
        usage.record_report(&report("c2", 2 * MINUTE, &[("a", 0)])).await.unwrap();
        usage.record_report(&report("c1", 20 * MINUTE, &[("a", 8)])).await.unwrap();

        let live = repo.load_priorities().await.unwrap().value;
        let rebuilt = engine().recompute(&repo.history().await.unwrap());
        assert_eq!(live, rebuilt);
        assert_eq!(live.folded_through, Some((20 * MINUTE, "c1".to_string())));
    }
}
