//! Tests for the background task manager

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use batchlease::runtime::BackgroundTaskManager;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_tasks_run_on_independent_cadences() {
    let manager = BackgroundTaskManager::new();
    let fast = Arc::new(AtomicUsize::new(0));
    let slow = Arc::new(AtomicUsize::new(0));

    let counter = Arc::clone(&fast);
    manager.register("fast", Duration::from_millis(5), move || {
        let counter = Arc::clone(&counter);
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
        }
    });
    let counter = Arc::clone(&slow);
    manager.register("slow", Duration::from_secs(60), move || {
        let counter = Arc::clone(&counter);
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
        }
    });

    tokio::time::sleep(Duration::from_millis(60)).await;
    assert!(manager.stop_all(Duration::from_secs(1)).await);
    assert!(fast.load(Ordering::SeqCst) > slow.load(Ordering::SeqCst));
    assert_eq!(slow.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_service_sees_stop_signal() {
    let manager = BackgroundTaskManager::new();
    let (tx, rx) = tokio::sync::oneshot::channel();
    manager.spawn_service("watcher", move |mut stop| async move {
        while !*stop.borrow() {
            if stop.changed().await.is_err() {
                break;
            }
        }
        let _ = tx.send(());
    });
    assert!(manager.stop_all(Duration::from_secs(1)).await);
    rx.await.expect("service observed stop");
}
