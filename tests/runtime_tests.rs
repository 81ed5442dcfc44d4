//! Tests for runtime trait types.
//!
//! Validates task status, exit status and signal handling.

use stepexec::{ExitStatus, ProcessIo, Signal, TaskStatus, UNKNOWN_EXIT_STATUS};

// =============================================================================
// TaskStatus Tests
// =============================================================================

#[test]
fn test_task_status_display() {
    assert_eq!(TaskStatus::Created.to_string(), "created");
    assert_eq!(TaskStatus::Running.to_string(), "running");
    assert_eq!(TaskStatus::Stopped.to_string(), "stopped");
    assert_eq!(TaskStatus::Paused.to_string(), "paused");
}

#[test]
fn test_task_status_serialization() {
    let json = serde_json::to_string(&TaskStatus::Running).unwrap();
    assert_eq!(json, "\"running\"");

    let status: TaskStatus = serde_json::from_str("\"pausing\"").unwrap();
    assert_eq!(status, TaskStatus::Pausing);
}

#[test]
fn test_task_status_copy() {
    let status = TaskStatus::Running;
    let copied: TaskStatus = status;
    assert_eq!(status, copied);
}

// =============================================================================
// ExitStatus Tests
// =============================================================================

#[test]
fn test_exit_status_success() {
    assert!(ExitStatus::new(0).success());
    assert!(!ExitStatus::new(1).success());
    assert!(ExitStatus::new(0).error.is_none());
}

#[test]
fn test_exit_status_unknown() {
    let status = ExitStatus::unknown("task vanished");
    assert_eq!(status.code, UNKNOWN_EXIT_STATUS);
    assert_eq!(status.error.as_deref(), Some("task vanished"));
    assert!(!status.success());
}

// =============================================================================
// Signal Tests
// =============================================================================

#[test]
fn test_signal_numbers() {
    assert_eq!(Signal::Term.as_i32(), libc::SIGTERM);
    assert_eq!(Signal::Kill.as_i32(), libc::SIGKILL);
    assert_eq!(Signal::Int.as_i32(), libc::SIGINT);
}

#[test]
fn test_signal_display() {
    assert_eq!(Signal::Kill.to_string(), "SIGKILL");
    assert_eq!(Signal::Term.to_string(), "SIGTERM");
}

// =============================================================================
// ProcessIo Tests
// =============================================================================

#[test]
fn test_process_io_default_has_no_streams() {
    let io = ProcessIo::default();
    assert!(io.stdin.is_none());
    assert!(io.stdout.is_none());
    assert!(io.stderr.is_none());
    assert!(!io.terminal);
    assert!(format!("{io:?}").contains("terminal: false"));
}
