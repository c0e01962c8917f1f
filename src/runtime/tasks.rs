//! Background task manager for periodic and long-running scheduler work.

use std::future::Future;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

/// Runs named periodic actions on their own cadence and stops them together.
///
/// A stop request never interrupts an iteration in progress: the action's
/// future runs to completion and the loop exits before the next tick.
pub struct BackgroundTaskManager {
    stop_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<(String, JoinHandle<()>)>>,
}

impl BackgroundTaskManager {
    /// Create an empty manager.
    pub fn new() -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            stop_tx,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Run `action` every `interval` until [`BackgroundTaskManager::stop_all`].
    /// The first iteration starts immediately.
    pub fn register<F, Fut>(&self, name: impl Into<String>, interval: Duration, action: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let name = name.into();
        let mut stop = self.stop_tx.subscribe();
        let task_name = name.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            tracing::debug!(task = %task_name, ?interval, "periodic task started");
            loop {
                if *stop.borrow() {
                    break;
                }
                tokio::select! {
                    biased;
                    changed = stop.changed() => {
                        if changed.is_err() || *stop.borrow() {
                            break;
                        }
                    }
                    _ = ticker.tick() => action().await,
                }
            }
            tracing::debug!(task = %task_name, "periodic task stopped");
        });
        self.tasks.lock().push((name, handle));
    }

    /// Run a long-lived service. `make` receives the stop signal and must
    /// return once it flips to `true`, after closing whatever it holds open.
    pub fn spawn_service<F, Fut>(&self, name: impl Into<String>, make: F)
    where
        F: FnOnce(watch::Receiver<bool>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let name = name.into();
        let handle = tokio::spawn(make(self.stop_tx.subscribe()));
        tracing::debug!(task = %name, "service started");
        self.tasks.lock().push((name, handle));
    }

    /// Names of everything registered, in registration order.
    pub fn names(&self) -> Vec<String> {
        self.tasks.lock().iter().map(|(n, _)| n.clone()).collect()
    }

    /// Signal every task to stop and wait up to `timeout` for them to finish
    /// their current iteration. Returns `false` if any task had to be detached.
    pub async fn stop_all(&self, timeout: Duration) -> bool {
        self.stop_tx.send_replace(true);
        let handles: Vec<_> = std::mem::take(&mut *self.tasks.lock());
        let deadline = Instant::now() + timeout;
        let mut clean = true;
        for (name, handle) in handles {
            match tokio::time::timeout_at(deadline, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::error!(task = %name, error = %e, "task ended abnormally");
                    clean = false;
                }
                Err(_) => {
                    tracing::warn!(task = %name, "task did not stop within timeout - detaching");
                    clean = false;
                }
            }
        }
        tracing::info!(clean, "background tasks stopped");
        clean
    }
}

impl Default for BackgroundTaskManager {
    fn default() -> Self {
        Self::new()
    }
}
