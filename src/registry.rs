//! Registry of live executions.
//!
//! Maps each execution identity to a completion channel. The channel is
//! open for exactly as long as the identity is registered: the entry is
//! created before a run acquires anything and removed after its teardown,
//! which drops the sending half and closes the channel for every
//! [`ExecutionHandle`] observing it.
//!
//! ```text
//!   register(id) ──► [open] ──report_failure(id, e)──► [open, error=e]
//!                      │                                   │
//!                      └──────────── unregister(id) ───────┴──► [closed]
//! ```
//!
//! All mutation, including channel closure, happens under one mutex that is
//! never held across an `.await`.

use crate::error::{Error, Result};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use tokio::sync::watch;

type Completion = watch::Sender<Option<String>>;

/// How an execution ended, as seen from a handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Termination {
    /// The execution was unregistered without reporting an error.
    Stopped,
    /// The execution reported a final error.
    Failed(String),
}

/// Observer of one execution's completion channel.
#[derive(Debug, Clone)]
pub struct ExecutionHandle {
    id: String,
    rx: watch::Receiver<Option<String>>,
}

impl ExecutionHandle {
    /// Returns the execution identity.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Returns true once the execution has been unregistered.
    pub fn is_closed(&self) -> bool {
        self.rx.has_changed().is_err()
    }

    /// Returns the final error reported so far, if any.
    pub fn final_error(&self) -> Option<String> {
        self.rx.borrow().clone()
    }

    /// Waits until the execution reports an error or is unregistered.
    ///
    /// Cancel-safe: may be raced in `tokio::select!` repeatedly.
    pub async fn terminated(&mut self) -> Termination {
        loop {
            let reported = self.rx.borrow_and_update().clone();
            if let Some(reason) = reported {
                return Termination::Failed(reason);
            }
            if self.rx.changed().await.is_err() {
                let last = self.rx.borrow().clone();
                return match last {
                    Some(reason) => Termination::Failed(reason),
                    None => Termination::Stopped,
                };
            }
        }
    }
}

/// Process-local table of live executions.
#[derive(Debug, Default)]
pub struct ExecutionRegistry {
    entries: Mutex<HashMap<String, Completion>>,
}

impl ExecutionRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    // The map is only mutated by single insert/remove calls, so a poisoned
    // lock still guards a consistent map.
    fn entries(&self) -> MutexGuard<'_, HashMap<String, Completion>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Registers `id` as a live execution.
    ///
    /// # Errors
    ///
    /// [`Error::ContainerAlreadyExists`] if `id` is already live.
    pub fn register(&self, id: &str) -> Result<ExecutionHandle> {
        let mut entries = self.entries();
        if entries.contains_key(id) {
            return Err(Error::ContainerAlreadyExists(id.to_string()));
        }
        let (tx, rx) = watch::channel(None);
        entries.insert(id.to_string(), tx);
        Ok(ExecutionHandle {
            id: id.to_string(),
            rx,
        })
    }

    /// Returns a handle for `id` if it is live.
    pub fn lookup(&self, id: &str) -> Option<ExecutionHandle> {
        self.entries().get(id).map(|tx| ExecutionHandle {
            id: id.to_string(),
            rx: tx.subscribe(),
        })
    }

    /// Records the final error of `id` without closing its channel.
    ///
    /// Returns false if `id` is not live.
    pub fn report_failure(&self, id: &str, reason: impl Into<String>) -> bool {
        match self.entries().get(id) {
            Some(tx) => {
                tx.send_replace(Some(reason.into()));
                true
            }
            None => false,
        }
    }

    /// Removes `id`, closing its completion channel.
    ///
    /// Returns false if `id` was not live.
    pub fn unregister(&self, id: &str) -> bool {
        let mut entries = self.entries();
        // Dropped while the lock is held so closure is ordered with lookups.
        entries.remove(id).is_some()
    }

    /// Returns true if `id` is live.
    pub fn contains(&self, id: &str) -> bool {
        self.entries().contains_key(id)
    }

    /// Returns the number of live executions.
    pub fn len(&self) -> usize {
        self.entries().len()
    }

    /// Returns true if no execution is live.
    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }
}
