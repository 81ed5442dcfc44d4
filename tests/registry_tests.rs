//! Tests for the execution registry.
//!
//! Validates registration atomicity under concurrency and completion
//! channel semantics.

use std::sync::Arc;
use std::time::Duration;
use stepexec::{Error, ExecutionRegistry, Termination};

// =============================================================================
// Registration Tests
// =============================================================================

#[test]
fn test_registry_starts_empty() {
    let registry = ExecutionRegistry::new();
    assert!(registry.is_empty());
    assert_eq!(registry.len(), 0);
    assert!(registry.lookup("a").is_none());
}

#[test]
fn test_register_then_lookup() {
    let registry = ExecutionRegistry::new();
    let handle = registry.register("a").unwrap();
    assert_eq!(handle.id(), "a");

    let found = registry.lookup("a").unwrap();
    assert_eq!(found.id(), "a");
    assert!(!found.is_closed());
    assert!(found.final_error().is_none());
}

#[test]
fn test_duplicate_register_keeps_owner() {
    let registry = ExecutionRegistry::new();
    let owner = registry.register("a").unwrap();
    assert!(matches!(
        registry.register("a"),
        Err(Error::ContainerAlreadyExists(_))
    ));
    assert!(!owner.is_closed());
    assert!(registry.contains("a"));
}

#[test]
fn test_identity_reusable_after_unregister() {
    let registry = ExecutionRegistry::new();
    let first = registry.register("a").unwrap();
    registry.unregister("a");
    let second = registry.register("a").unwrap();
    assert!(first.is_closed());
    assert!(!second.is_closed());
}

#[test]
fn test_report_failure_requires_live_entry() {
    let registry = ExecutionRegistry::new();
    assert!(!registry.report_failure("a", "boom"));
    let handle = registry.register("a").unwrap();
    assert!(registry.report_failure("a", "boom"));
    assert_eq!(handle.final_error().as_deref(), Some("boom"));
    assert!(!handle.is_closed(), "reporting must not close the channel");
}

// =============================================================================
// Concurrency Tests
// =============================================================================

#[tokio::test]
async fn test_concurrent_register_single_winner() {
    let registry = Arc::new(ExecutionRegistry::new());
    let mut tasks = Vec::new();
    for _ in 0..16 {
        let registry = registry.clone();
        tasks.push(tokio::spawn(async move { registry.register("same").map(|_| ()) }));
    }
    let mut winners = 0;
    for task in tasks {
        if task.await.unwrap().is_ok() {
            winners += 1;
        }
    }
    assert_eq!(winners, 1);
    assert_eq!(registry.len(), 1);
}

#[tokio::test]
async fn test_concurrent_distinct_registrations() {
    let registry = Arc::new(ExecutionRegistry::new());
    let mut tasks = Vec::new();
    for i in 0..32 {
        let registry = registry.clone();
        tasks.push(tokio::spawn(async move {
            let id = format!("run{i}");
            registry.register(&id).unwrap();
            tokio::task::yield_now().await;
            assert!(registry.unregister(&id));
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }
    assert!(registry.is_empty());
}

// =============================================================================
// Completion Channel Tests
// =============================================================================

#[tokio::test]
async fn test_every_handle_observes_closure() {
    let registry = Arc::new(ExecutionRegistry::new());
    registry.register("a").unwrap();

    let waiters: Vec<_> = (0..4)
        .map(|_| {
            let mut handle = registry.lookup("a").unwrap();
            tokio::spawn(async move { handle.terminated().await })
        })
        .collect();

    tokio::time::sleep(Duration::from_millis(10)).await;
    registry.unregister("a");

    for waiter in waiters {
        assert_eq!(waiter.await.unwrap(), Termination::Stopped);
    }
}

#[tokio::test]
async fn test_lookup_after_failure_report_sees_error() {
    let registry = ExecutionRegistry::new();
    registry.register("a").unwrap();
    registry.report_failure("a", "exit 3");

    let mut late = registry.lookup("a").unwrap();
    assert_eq!(
        late.terminated().await,
        Termination::Failed("exit 3".to_string())
    );
}
