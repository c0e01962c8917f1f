//! Tests for error types

use batchlease::core::SchedulerError;
use batchlease::util::JobId;

#[test]
fn test_invalid_argument_error() {
    let err = SchedulerError::invalid("event.kind", "event doesn't contain a job id");
    assert_eq!(
        format!("{err}"),
        "invalid argument `event.kind`: event doesn't contain a job id"
    );
    assert!(!err.is_transient());
}

#[test]
fn test_job_not_found_error() {
    let id = JobId::from_u64_pair(7, 42);
    let err = SchedulerError::JobNotFound(id);
    assert_eq!(format!("{err}"), format!("job not found: {id}"));
}

#[test]
fn test_backend_error_is_transient() {
    let err = SchedulerError::Backend("connection failed".to_string());
    assert_eq!(format!("{err}"), "backend error: connection failed");
    assert!(err.is_transient());
    assert!(SchedulerError::Timeout.is_transient());
    assert!(SchedulerError::Conflict("job".into()).is_transient());
}

#[test]
fn test_startup_error_is_fatal() {
    let err = SchedulerError::Startup("no brokers".into());
    assert_eq!(format!("{err}"), "startup failure: no brokers");
    assert!(!err.is_transient());
}

#[test]
fn test_io_error_converts_to_backend() {
    let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
    let err: SchedulerError = io.into();
    assert!(matches!(err, SchedulerError::Backend(_)));
}
