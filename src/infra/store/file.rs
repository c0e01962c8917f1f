//! File-backed read stores using JSON lines for durability.
//!
//! Both stores keep their working set in memory and reload it from disk on
//! open, so a restarted scheduler sees the same history it wrote.

use std::collections::BTreeMap;
use std::fs::{self, create_dir_all, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::core::{
    ClusterUsageReport, EventPage, EventPosition, EventRepository, EventScope, EventSequence,
    PrioritySnapshot, SchedulerError, UsageRepository, Versioned,
};
use crate::infra::store::materialized::MaterializedEvents;

fn read_lines<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>, SchedulerError> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let file = OpenOptions::new().read(true).open(path)?;
    let mut out = Vec::new();
    for line in BufReader::new(file).lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        out.push(serde_json::from_str(&line)?);
    }
    Ok(out)
}

fn append_line<T: Serialize>(path: &Path, value: &T) -> Result<(), SchedulerError> {
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    let line = serde_json::to_string(value)?;
    writeln!(file, "{line}")?;
    file.sync_data()?;
    Ok(())
}

/// Materialised event store persisted as one JSON line per applied sequence.
pub struct FileEventRepository {
    path: PathBuf,
    events: Mutex<MaterializedEvents>,
}

impl FileEventRepository {
    /// Open (or create) the store at `dir/<stream>.jsonl` and replay it.
    pub fn open(dir: impl AsRef<Path>, stream: &str) -> Result<Self, SchedulerError> {
        let dir = dir.as_ref();
        create_dir_all(dir)?;
        let path = dir.join(format!("{stream}.jsonl"));
        let mut events = MaterializedEvents::default();
        for sequence in read_lines::<EventSequence>(&path)? {
            events.apply(&sequence)?;
        }
        tracing::debug!(path = %path.display(), events = events.len(), "event store loaded");
        Ok(Self {
            path,
            events: Mutex::new(events),
        })
    }

    /// Number of distinct events held.
    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    /// Whether nothing was applied yet.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl EventRepository for FileEventRepository {
    async fn apply(&self, sequence: &EventSequence) -> Result<usize, SchedulerError> {
        let mut events = self.events.lock();
        sequence.validate()?;
        let mut fresh = sequence.clone();
        fresh.events.retain(|e| {
            e.kind
                .as_ref()
                .is_some_and(|k| !events.contains(k.job_id(), e.sequence))
        });
        if fresh.events.is_empty() {
            return Ok(0);
        }
        // Persist before indexing so a failed write leaves memory untouched.
        append_line(&self.path, &fresh)?;
        events.apply(&fresh)
    }

    async fn read(
        &self,
        scope: &EventScope,
        from: EventPosition,
        limit: usize,
    ) -> Result<EventPage, SchedulerError> {
        Ok(self.events.lock().read(scope, from, limit))
    }
}

#[derive(Serialize, Deserialize)]
struct PersistedPriorities {
    version: u64,
    snapshot: PrioritySnapshot,
}

struct UsageFiles {
    history: BTreeMap<(u128, String), ClusterUsageReport>,
    priorities: Versioned<PrioritySnapshot>,
}

/// Usage history (`reports.jsonl`) and priority snapshot (`priorities.json`)
/// kept in a directory.
pub struct FileUsageRepository {
    dir: PathBuf,
    state: Mutex<UsageFiles>,
}

impl FileUsageRepository {
    /// Open (or create) the store in `dir` and reload it.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, SchedulerError> {
        let dir = dir.as_ref().to_path_buf();
        create_dir_all(&dir)?;
        let history = read_lines::<ClusterUsageReport>(&dir.join("reports.jsonl"))?
            .into_iter()
            .map(|r| ((r.report_time_ms, r.cluster_id.clone()), r))
            .collect();
        let priorities_path = dir.join("priorities.json");
        let priorities = if priorities_path.exists() {
            let persisted: PersistedPriorities =
                serde_json::from_slice(&fs::read(&priorities_path)?)?;
            Versioned {
                value: persisted.snapshot,
                version: persisted.version,
            }
        } else {
            Versioned::default()
        };
        Ok(Self {
            dir,
            state: Mutex::new(UsageFiles {
                history,
                priorities,
            }),
        })
    }

    fn write_priorities(&self, persisted: &PersistedPriorities) -> Result<(), SchedulerError> {
        let tmp = self.dir.join("priorities.json.tmp");
        fs::write(&tmp, serde_json::to_vec(persisted)?)?;
        fs::rename(&tmp, self.dir.join("priorities.json"))?;
        Ok(())
    }
}

#[async_trait]
impl UsageRepository for FileUsageRepository {
    async fn append_report(&self, report: &ClusterUsageReport) -> Result<(), SchedulerError> {
        let mut state = self.state.lock();
        append_line(&self.dir.join("reports.jsonl"), report)?;
        state.history.insert(
            (report.report_time_ms, report.cluster_id.clone()),
            report.clone(),
        );
        Ok(())
    }

    async fn history(&self) -> Result<Vec<ClusterUsageReport>, SchedulerError> {
        Ok(self.state.lock().history.values().cloned().collect())
    }

    async fn load_priorities(&self) -> Result<Versioned<PrioritySnapshot>, SchedulerError> {
        Ok(self.state.lock().priorities.clone())
    }

    async fn store_priorities(
        &self,
        snapshot: &PrioritySnapshot,
        expected_version: u64,
    ) -> Result<bool, SchedulerError> {
        let mut state = self.state.lock();
        if state.priorities.version != expected_version {
            return Ok(false);
        }
        let persisted = PersistedPriorities {
            version: expected_version + 1,
            snapshot: snapshot.clone(),
        };
        self.write_priorities(&persisted)?;
        state.priorities = Versioned {
            value: persisted.snapshot,
            version: persisted.version,
        };
        Ok(true)
    }
}
