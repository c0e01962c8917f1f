//! Tests for utility functions

use std::time::Duration;

use batchlease::core::{ComputeResources, Quantity};
use batchlease::util::{add_ms, init_tracing, now_ms, JobId, RunId};

#[test]
fn test_job_id_wire_halves() {
    let id = JobId::new();
    let (high, low) = id.as_u64_pair();
    assert_eq!(JobId::from_u64_pair(high, low), id);
    assert_ne!(JobId::new(), id);
}

#[test]
fn test_run_ids_are_unique() {
    assert_ne!(RunId::new(), RunId::new());
}

#[test]
fn test_add_ms_saturates() {
    assert_eq!(add_ms(1_000, Duration::from_secs(2)), 3_000);
    assert_eq!(add_ms(u128::MAX, Duration::from_secs(1)), u128::MAX);
    assert!(now_ms() > 0);
}

#[test]
fn test_parse_kubernetes_quantities() {
    let resources = ComputeResources::parse([("cpu", "1500m"), ("memory", "1Gi")]).unwrap();
    assert_eq!(resources.get("cpu"), Quantity::from_millis(1_500));
    assert_eq!(resources.get("memory"), Quantity::from_units(1 << 30));
    assert!("12x".parse::<Quantity>().is_err());
}

#[test]
fn test_init_tracing_is_repeatable() {
    init_tracing();
    assert!(!init_tracing());
    tracing::info!(cluster_id = "c1", "tracing installed");
}
