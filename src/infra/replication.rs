//! Replication of broker-delivered event sequences into the read store.
//!
//! Both broker backends feed [`apply_idempotently`]; they differ only in how
//! messages arrive (polled from a log, pushed by a subscription) and how
//! consumption is acknowledged.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use crate::core::{EventRepository, EventSequence, SchedulerError};
use crate::infra::transport::{LogTopic, Subscription};

/// Upper bound on the pause between attempts to apply a pushed batch.
const MAX_RETRY_BACKOFF: Duration = Duration::from_secs(5);

fn retry_backoff(attempt: u32) -> Duration {
    Duration::from_millis(100)
        .saturating_mul(attempt)
        .min(MAX_RETRY_BACKOFF)
}

/// Tally of one replication batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplicationOutcome {
    /// Events that were new to the read store.
    pub applied: usize,
    /// Events already present (redeliveries).
    pub duplicates: usize,
    /// Messages that could not be decoded or validated.
    pub rejected: usize,
}

/// Decode each payload and apply it to `repository`, keyed by
/// `(job id, sequence)` so redeliveries change nothing.
///
/// Malformed messages are logged and counted, never retried. A store failure
/// stops the batch and is returned so the caller can redeliver.
pub async fn apply_idempotently<I>(
    repository: &dyn EventRepository,
    messages: I,
) -> Result<ReplicationOutcome, SchedulerError>
where
    I: IntoIterator<Item = Vec<u8>> + Send,
    I::IntoIter: Send,
{
    let mut outcome = ReplicationOutcome::default();
    for payload in messages {
        let sequence = match serde_json::from_slice::<EventSequence>(&payload)
            .map_err(|e| SchedulerError::invalid("payload", e.to_string()))
            .and_then(|s| s.validate().map(|()| s))
        {
            Ok(sequence) => sequence,
            Err(e) => {
                tracing::error!(error = %e, bytes = payload.len(), "rejecting undecodable event sequence");
                outcome.rejected += 1;
                continue;
            }
        };
        let fresh = repository.apply(&sequence).await?;
        outcome.applied += fresh;
        outcome.duplicates += sequence.events.len() - fresh;
    }
    Ok(outcome)
}

/// Polls a log topic on a fixed cadence and commits offsets only after the
/// batch was applied.
#[derive(Clone)]
pub struct LogReplicator {
    topic: Arc<dyn LogTopic>,
    group: String,
    repository: Arc<dyn EventRepository>,
    batch_size: usize,
}

impl LogReplicator {
    /// Consume `topic` as `group` into `repository`.
    pub fn new(
        topic: Arc<dyn LogTopic>,
        group: impl Into<String>,
        repository: Arc<dyn EventRepository>,
        batch_size: usize,
    ) -> Self {
        Self {
            topic,
            group: group.into(),
            repository,
            batch_size: batch_size.max(1),
        }
    }

    /// Drain everything currently available, one batch at a time.
    pub async fn try_process_events(&self) -> Result<ReplicationOutcome, SchedulerError> {
        let mut total = ReplicationOutcome::default();
        loop {
            let records = self.topic.fetch(&self.group, self.batch_size).await?;
            if records.is_empty() {
                return Ok(total);
            }
            let outcome = apply_idempotently(
                self.repository.as_ref(),
                records.iter().map(|r| r.payload.clone()).collect::<Vec<_>>(),
            )
            .await?;
            self.topic.commit(&self.group, &records).await?;
            total.applied += outcome.applied;
            total.duplicates += outcome.duplicates;
            total.rejected += outcome.rejected;
        }
    }

    /// Periodic entry point; failures leave offsets uncommitted for the next tick.
    pub async fn process_events(&self) {
        match self.try_process_events().await {
            Ok(outcome) if outcome.applied > 0 || outcome.rejected > 0 => {
                tracing::debug!(group = %self.group, ?outcome, "replicated log batch");
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(group = %self.group, error = %e, "log replication failed, retrying next tick"),
        }
    }
}

/// Applies pushed messages from a subscription until stopped.
pub struct StreamReplicator {
    subscription: Subscription,
    repository: Arc<dyn EventRepository>,
    batch_size: usize,
}

impl StreamReplicator {
    /// Replicate `subscription` into `repository`.
    pub fn new(subscription: Subscription, repository: Arc<dyn EventRepository>, batch_size: usize) -> Self {
        Self {
            subscription,
            repository,
            batch_size: batch_size.max(1),
        }
    }

    /// Run until `stop` flips or the subscription ends. A batch already taken
    /// off the subscription is retried until it is applied or the stop signal
    /// arrives. On the way out the subscription is closed and whatever it
    /// still buffered gets one last attempt.
    pub async fn run(mut self, mut stop: watch::Receiver<bool>) {
        tracing::info!(subject = %self.subscription.subject(), "stream replication started");
        let mut stopping = false;
        while !stopping {
            if *stop.borrow() {
                break;
            }
            let first = tokio::select! {
                biased;
                changed = stop.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
                message = self.subscription.recv() => message,
            };
            let Some(first) = first else {
                tracing::warn!("stream subscription ended");
                break;
            };
            let mut batch = vec![first];
            while batch.len() < self.batch_size {
                match self.subscription.try_recv() {
                    Some(message) => batch.push(message),
                    None => break,
                }
            }
            stopping = self.apply_until_stopped(batch, &mut stop).await;
        }
        self.subscription.close();
        let mut leftover = Vec::new();
        while let Some(message) = self.subscription.try_recv() {
            leftover.push(message);
        }
        if !leftover.is_empty() {
            self.apply_until_stopped(leftover, &mut stop).await;
        }
        tracing::info!(subject = %self.subscription.subject(), "stream replication stopped");
    }

    /// Apply `batch`, backing off between failures. Once stopping, a failure
    /// is final and logged with the number of messages lost. Returns whether
    /// the stop signal was seen.
    async fn apply_until_stopped(&self, batch: Vec<Vec<u8>>, stop: &mut watch::Receiver<bool>) -> bool {
        let mut stopping = *stop.borrow();
        let mut attempt: u32 = 0;
        loop {
            attempt = attempt.saturating_add(1);
            match apply_idempotently(self.repository.as_ref(), batch.clone()).await {
                Ok(outcome) => {
                    tracing::debug!(?outcome, attempt, "replicated stream batch");
                    return stopping;
                }
                Err(e) if stopping => {
                    tracing::error!(messages = batch.len(), attempt, error = %e, "stream batch not applied before shutdown");
                    return true;
                }
                Err(e) => {
                    let backoff = retry_backoff(attempt);
                    tracing::warn!(attempt, ?backoff, error = %e, "stream batch failed, retrying");
                    tokio::select! {
                        () = tokio::time::sleep(backoff) => {}
                        changed = stop.changed() => stopping = changed.is_err() || *stop.borrow(),
                    }
                }
            }
        }
    }
}
