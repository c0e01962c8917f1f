//! Scheduler, lease and event backend configuration structures.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Lease lifetime and expiry scan cadence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LeaseConfig {
    /// Seconds a lease lives without progress before it is reclaimed.
    pub expire_after_secs: u64,
    /// Milliseconds between expiry scans.
    pub expiry_loop_interval_ms: u64,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            expire_after_secs: 300,
            expiry_loop_interval_ms: 5_000,
        }
    }
}

/// Lease grant tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulingConfig {
    /// Queued jobs considered per queue in one lease cycle.
    pub queue_lease_batch_size: usize,
    /// Weight per resource name when collapsing usage to a scalar.
    pub resource_scarcity: HashMap<String, f64>,
}

impl Default for SchedulingConfig {
    fn default() -> Self {
        Self {
            queue_lease_batch_size: 100,
            resource_scarcity: HashMap::from([("cpu".to_string(), 1.0)]),
        }
    }
}

/// Partitioned log broker settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogBackendConfig {
    /// Broker addresses; at least one is required.
    pub brokers: Vec<String>,
    /// Topic events are published to.
    pub topic: String,
    /// Consumer group of the replication pipeline.
    pub consumer_group: String,
    /// Number of partitions.
    #[serde(default = "default_partitions")]
    pub partitions: usize,
    /// Milliseconds between replication polls.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

const fn default_partitions() -> usize {
    4
}

const fn default_poll_interval_ms() -> u64 {
    100
}

/// Pub/sub broker settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamBackendConfig {
    /// Server addresses; at least one is required.
    pub servers: Vec<String>,
    /// Subject events are published on.
    pub subject: String,
    /// Queue group shared by replication consumers.
    pub queue_group: String,
}

/// Event log backend selection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventBackendConfig {
    /// Append straight into the read store.
    #[default]
    Direct,
    /// Publish to a partitioned log, replicate by polling.
    Log(LogBackendConfig),
    /// Publish to pub/sub, replicate by push subscription.
    Stream(StreamBackendConfig),
}

/// Root scheduler configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Identity of the cluster this process reports for, if it runs an agent.
    pub cluster_id: String,
    /// Milliseconds between usage reports.
    pub reporting_interval_ms: u64,
    /// Half time of the usage decay, in seconds.
    pub priority_half_time_secs: u64,
    /// Lease settings.
    pub lease: LeaseConfig,
    /// Grant settings.
    pub scheduling: SchedulingConfig,
    /// Event backend.
    pub events: EventBackendConfig,
    /// Milliseconds to wait for background tasks on shutdown.
    pub shutdown_timeout_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            cluster_id: String::new(),
            reporting_interval_ms: 10_000,
            priority_half_time_secs: 20 * 60,
            lease: LeaseConfig::default(),
            scheduling: SchedulingConfig::default(),
            events: EventBackendConfig::default(),
            shutdown_timeout_ms: 2_000,
        }
    }
}

impl EventBackendConfig {
    /// Validate backend settings.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            Self::Direct => Ok(()),
            Self::Log(log) => {
                if log.brokers.iter().all(|b| b.trim().is_empty()) {
                    return Err("log backend needs at least one broker".into());
                }
                if log.topic.is_empty() || log.consumer_group.is_empty() {
                    return Err("log backend needs a topic and a consumer group".into());
                }
                if log.partitions == 0 || log.poll_interval_ms == 0 {
                    return Err("log partitions and poll_interval_ms must be greater than 0".into());
                }
                Ok(())
            }
            Self::Stream(stream) => {
                if stream.servers.iter().all(|s| s.trim().is_empty()) {
                    return Err("stream backend needs at least one server".into());
                }
                if stream.subject.is_empty() || stream.queue_group.is_empty() {
                    return Err("stream backend needs a subject and a queue group".into());
                }
                Ok(())
            }
        }
    }
}

impl SchedulerConfig {
    /// Validate all settings.
    pub fn validate(&self) -> Result<(), String> {
        if self.priority_half_time_secs == 0 {
            return Err("priority_half_time_secs must be greater than 0".into());
        }
        if self.reporting_interval_ms == 0 {
            return Err("reporting_interval_ms must be greater than 0".into());
        }
        if self.lease.expire_after_secs == 0 || self.lease.expiry_loop_interval_ms == 0 {
            return Err("lease durations must be greater than 0".into());
        }
        if self.scheduling.queue_lease_batch_size == 0 {
            return Err("queue_lease_batch_size must be greater than 0".into());
        }
        if let Some((name, _)) = self
            .scheduling
            .resource_scarcity
            .iter()
            .find(|(_, w)| !w.is_finite() || **w < 0.0)
        {
            return Err(format!("resource_scarcity `{name}` must be a non-negative number"));
        }
        self.events
            .validate()
            .map_err(|e| format!("events invalid: {e}"))
    }

    /// Parse scheduler configuration from a JSON string and validate.
    pub fn from_json_str(input: &str) -> Result<Self, String> {
        let cfg: Self = serde_json::from_str(input).map_err(|e| format!("parse error: {e}"))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Usage decay half time.
    pub const fn priority_half_time(&self) -> Duration {
        Duration::from_secs(self.priority_half_time_secs)
    }

    /// Lease lifetime without progress.
    pub const fn lease_expiry(&self) -> Duration {
        Duration::from_secs(self.lease.expire_after_secs)
    }

    /// Pause between expiry scans.
    pub const fn expiry_interval(&self) -> Duration {
        Duration::from_millis(self.lease.expiry_loop_interval_ms)
    }

    /// Pause between usage reports.
    pub const fn reporting_interval(&self) -> Duration {
        Duration::from_millis(self.reporting_interval_ms)
    }

    /// Grace period for background tasks on shutdown.
    pub const fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}
