//! Tests for configuration validation

use batchlease::config::{EventBackendConfig, LogBackendConfig, SchedulerConfig, StreamBackendConfig};

#[test]
fn test_default_config_is_valid() {
    let cfg = SchedulerConfig::default();
    assert!(cfg.validate().is_ok());
    assert_eq!(cfg.events, EventBackendConfig::Direct);
    assert_eq!(cfg.scheduling.queue_lease_batch_size, 100);
    assert_eq!(cfg.reporting_interval_ms, 10_000);
}

#[test]
fn test_zero_half_time_rejected() {
    let cfg = SchedulerConfig {
        priority_half_time_secs: 0,
        ..SchedulerConfig::default()
    };
    assert!(cfg.validate().is_err());
}

#[test]
fn test_negative_scarcity_rejected() {
    let mut cfg = SchedulerConfig::default();
    cfg.scheduling.resource_scarcity.insert("gpu".into(), -1.0);
    let err = cfg.validate().unwrap_err();
    assert!(err.contains("gpu"), "{err}");
}

#[test]
fn test_stream_backend_needs_servers() {
    let backend = EventBackendConfig::Stream(StreamBackendConfig {
        servers: vec![],
        subject: "events".into(),
        queue_group: "replicator".into(),
    });
    assert!(backend.validate().is_err());
}

#[test]
fn test_from_json_str_parses_log_backend() {
    let json = r#"
    {
        "cluster_id": "gpu-east",
        "priority_half_time_secs": 600,
        "lease": { "expire_after_secs": 120 },
        "events": {
            "log": {
                "brokers": ["kafka-1:9092", "kafka-2:9092"],
                "topic": "job-events",
                "consumer_group": "replicator"
            }
        }
    }
    "#;
    let cfg = SchedulerConfig::from_json_str(json).unwrap();
    assert_eq!(cfg.cluster_id, "gpu-east");
    assert_eq!(cfg.lease.expire_after_secs, 120);
    assert_eq!(cfg.lease.expiry_loop_interval_ms, 5_000);
    let EventBackendConfig::Log(LogBackendConfig {
        brokers,
        partitions,
        poll_interval_ms,
        ..
    }) = cfg.events
    else {
        panic!("expected log backend");
    };
    assert_eq!(brokers.len(), 2);
    assert_eq!(partitions, 4);
    assert_eq!(poll_interval_ms, 100);
}

#[test]
fn test_from_json_str_reports_parse_errors() {
    let err = SchedulerConfig::from_json_str("{ not json").unwrap_err();
    assert!(err.starts_with("parse error"), "{err}");
}
