//! In-memory runtime and providers shared by the integration tests.
//!
//! Every fake appends to a shared [`Journal`] so tests can assert on the
//! order in which resources were acquired and released.

#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use stepexec::spec::ProcessSpec;
use stepexec::{
    Container, ContainerRuntime, Error, ExitReceiver, ExitStatus, LocalMount, LocalMounter, Mount,
    MountRef, Mountable, Namespace, NetMode, NetworkProvider, Process, ProcessIo, ReleaseFn,
    Result, RuntimeSpec, Signal, Task, TaskStatus,
};
use tokio::sync::{oneshot, Notify};

/// Exit code the fake task reports when killed.
pub const KILLED_EXIT_CODE: u32 = 137;

// =============================================================================
// Journal
// =============================================================================

#[derive(Debug, Default)]
pub struct Journal(Mutex<Vec<String>>);

impl Journal {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn record(&self, event: impl Into<String>) {
        self.0.lock().unwrap().push(event.into());
    }

    pub fn events(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    pub fn contains(&self, event: &str) -> bool {
        self.events().iter().any(|e| e == event)
    }

    /// Position of `event`, panicking if it was never recorded.
    pub fn position(&self, event: &str) -> usize {
        let events = self.events();
        events
            .iter()
            .position(|e| e == event)
            .unwrap_or_else(|| panic!("event '{event}' not recorded in {events:?}"))
    }
}

// =============================================================================
// Runtime
// =============================================================================

#[derive(Debug, Clone, Copy, Default)]
pub struct Faults {
    /// Fail `Container::new_task`.
    pub task_create: bool,
    /// Fail `Container::delete`.
    pub container_delete: bool,
    /// Task status stays `created` after start.
    pub never_running: bool,
}

pub struct FakeRuntime {
    journal: Arc<Journal>,
    faults: Faults,
    /// Exit code reported right after start, if set.
    auto_exit: Option<u32>,
    containers: Arc<Mutex<HashMap<String, Arc<FakeContainer>>>>,
    specs: Mutex<HashMap<String, RuntimeSpec>>,
}

impl FakeRuntime {
    pub fn new(journal: Arc<Journal>) -> Self {
        Self {
            journal,
            faults: Faults::default(),
            auto_exit: None,
            containers: Arc::default(),
            specs: Mutex::default(),
        }
    }

    pub fn with_faults(mut self, faults: Faults) -> Self {
        self.faults = faults;
        self
    }

    pub fn with_auto_exit(mut self, code: u32) -> Self {
        self.auto_exit = Some(code);
        self
    }

    pub fn container(&self, id: &str) -> Option<Arc<FakeContainer>> {
        self.containers.lock().unwrap().get(id).cloned()
    }

    /// Spec a container was created with, kept after its deletion.
    pub fn created_spec(&self, id: &str) -> Option<RuntimeSpec> {
        self.specs.lock().unwrap().get(id).cloned()
    }

    pub fn task(&self, id: &str) -> Option<Arc<FakeTask>> {
        self.container(id)
            .and_then(|c| c.task.lock().unwrap().clone())
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    fn name(&self) -> &str {
        "fake"
    }

    async fn new_container(&self, id: &str, spec: &RuntimeSpec) -> Result<Arc<dyn Container>> {
        self.journal.record(format!("container.new {id}"));
        self.specs
            .lock()
            .unwrap()
            .insert(id.to_string(), spec.clone());
        let container = Arc::new(FakeContainer {
            id: id.to_string(),
            spec: Mutex::new(spec.clone()),
            task: Mutex::new(None),
            journal: self.journal.clone(),
            faults: self.faults,
            auto_exit: self.auto_exit,
            containers: self.containers.clone(),
        });
        self.containers
            .lock()
            .unwrap()
            .insert(id.to_string(), container.clone());
        Ok(container)
    }

    async fn load_container(&self, id: &str) -> Result<Arc<dyn Container>> {
        match self.container(id) {
            Some(c) => Ok(c),
            None => Err(Error::ContainerNotFound(id.to_string())),
        }
    }
}

pub struct FakeContainer {
    id: String,
    spec: Mutex<RuntimeSpec>,
    task: Mutex<Option<Arc<FakeTask>>>,
    journal: Arc<Journal>,
    faults: Faults,
    auto_exit: Option<u32>,
    containers: Arc<Mutex<HashMap<String, Arc<FakeContainer>>>>,
}

impl FakeContainer {
    pub fn stored_spec(&self) -> RuntimeSpec {
        self.spec.lock().unwrap().clone()
    }
}

#[async_trait]
impl Container for FakeContainer {
    fn id(&self) -> &str {
        &self.id
    }

    async fn spec(&self) -> Result<RuntimeSpec> {
        Ok(self.stored_spec())
    }

    async fn new_task(&self, rootfs: &[Mount], _io: ProcessIo) -> Result<Arc<dyn Task>> {
        if self.faults.task_create {
            self.journal.record(format!("task.new.failed {}", self.id));
            return Err(Error::Internal("injected task create failure".to_string()));
        }
        self.journal.record(format!("task.new {}", self.id));
        let (tx, rx) = oneshot::channel();
        let task = Arc::new(FakeTask {
            id: self.id.clone(),
            rootfs: rootfs.to_vec(),
            status: Mutex::new(TaskStatus::Created),
            exit_tx: Mutex::new(Some(tx)),
            exit_rx: Mutex::new(Some(rx)),
            execs: Mutex::new(Vec::new()),
            journal: self.journal.clone(),
            never_running: self.faults.never_running,
            auto_exit: self.auto_exit,
        });
        *self.task.lock().unwrap() = Some(task.clone());
        Ok(task)
    }

    async fn task(&self) -> Result<Arc<dyn Task>> {
        match self.task.lock().unwrap().clone() {
            Some(task) => Ok(task),
            None => Err(Error::Internal(format!("no task for {}", self.id))),
        }
    }

    async fn delete(&self) -> Result<()> {
        self.journal.record(format!("container.delete {}", self.id));
        self.containers.lock().unwrap().remove(&self.id);
        if self.faults.container_delete {
            return Err(Error::Internal("injected container delete failure".to_string()));
        }
        Ok(())
    }
}

pub struct FakeTask {
    id: String,
    rootfs: Vec<Mount>,
    status: Mutex<TaskStatus>,
    exit_tx: Mutex<Option<oneshot::Sender<ExitStatus>>>,
    exit_rx: Mutex<Option<oneshot::Receiver<ExitStatus>>>,
    execs: Mutex<Vec<(String, ProcessSpec)>>,
    journal: Arc<Journal>,
    never_running: bool,
    auto_exit: Option<u32>,
}

impl FakeTask {
    /// Terminates the task's process with `code`.
    pub fn exit(&self, code: u32) {
        *self.status.lock().unwrap() = TaskStatus::Stopped;
        if let Some(tx) = self.exit_tx.lock().unwrap().take() {
            let _ = tx.send(ExitStatus::new(code));
        }
    }

    /// Terminates the task with the runtime's unknown status.
    pub fn lose(&self, reason: &str) {
        *self.status.lock().unwrap() = TaskStatus::Unknown;
        if let Some(tx) = self.exit_tx.lock().unwrap().take() {
            let _ = tx.send(ExitStatus::unknown(reason));
        }
    }

    pub fn rootfs(&self) -> Vec<Mount> {
        self.rootfs.clone()
    }

    pub fn execs(&self) -> Vec<(String, ProcessSpec)> {
        self.execs.lock().unwrap().clone()
    }
}

#[async_trait]
impl Task for FakeTask {
    fn id(&self) -> &str {
        &self.id
    }

    async fn start(&self) -> Result<()> {
        self.journal.record(format!("task.start {}", self.id));
        if !self.never_running {
            *self.status.lock().unwrap() = TaskStatus::Running;
        }
        if let Some(code) = self.auto_exit {
            self.exit(code);
        }
        Ok(())
    }

    async fn wait(&self) -> Result<ExitReceiver> {
        self.exit_rx
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| Error::Internal("exit status already taken".to_string()))
    }

    async fn kill(&self, signal: Signal) -> Result<()> {
        self.journal.record(format!("task.kill {} {signal}", self.id));
        self.exit(KILLED_EXIT_CODE);
        Ok(())
    }

    async fn status(&self) -> Result<TaskStatus> {
        Ok(*self.status.lock().unwrap())
    }

    async fn exec(
        &self,
        exec_id: &str,
        process: &ProcessSpec,
        _io: ProcessIo,
    ) -> Result<Box<dyn Process>> {
        self.journal.record(format!("task.exec {}", self.id));
        self.execs
            .lock()
            .unwrap()
            .push((exec_id.to_string(), process.clone()));
        Ok(Box::new(FakeProcess {
            id: exec_id.to_string(),
            journal: self.journal.clone(),
        }))
    }

    async fn delete(&self) -> Result<()> {
        self.journal.record(format!("task.delete {}", self.id));
        Ok(())
    }
}

pub struct FakeProcess {
    id: String,
    journal: Arc<Journal>,
}

#[async_trait]
impl Process for FakeProcess {
    fn id(&self) -> &str {
        &self.id
    }

    async fn start(&self) -> Result<()> {
        self.journal.record("process.start");
        Ok(())
    }
}

// =============================================================================
// Mounts
// =============================================================================

/// Root filesystem backed by a host directory whose lease release is
/// journaled. Mounting can be held back with [`FakeMountable::gated`].
pub struct FakeMountable {
    path: PathBuf,
    journal: Arc<Journal>,
    gate: Option<Arc<Notify>>,
}

impl FakeMountable {
    pub fn new(path: impl Into<PathBuf>, journal: Arc<Journal>) -> Self {
        Self {
            path: path.into(),
            journal,
            gate: None,
        }
    }

    /// Blocks `mount` until the returned gate is notified.
    pub fn gated(mut self) -> (Self, Arc<Notify>) {
        let gate = Arc::new(Notify::new());
        self.gate = Some(gate.clone());
        (self, gate)
    }
}

#[async_trait]
impl Mountable for FakeMountable {
    async fn mount(&self, readonly: bool) -> Result<Box<dyn MountRef>> {
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        self.journal.record(format!("root.mount readonly={readonly}"));
        let mut mount = Mount::bind(self.path.to_string_lossy());
        if readonly {
            mount.options.push("ro".to_string());
        }
        Ok(Box::new(FakeLease {
            mount,
            journal: self.journal.clone(),
        }))
    }
}

struct FakeLease {
    mount: Mount,
    journal: Arc<Journal>,
}

impl MountRef for FakeLease {
    fn mount(&self) -> Result<(Vec<Mount>, Option<ReleaseFn>)> {
        let journal = self.journal.clone();
        let release: ReleaseFn = Box::new(move || {
            journal.record("root.release");
            Ok(())
        });
        Ok((vec![self.mount.clone()], Some(release)))
    }
}

/// Local mounter that exposes a fixed directory and journals unmounts.
pub struct FakeLocalMounter {
    path: PathBuf,
    journal: Arc<Journal>,
}

impl FakeLocalMounter {
    pub fn new(path: impl Into<PathBuf>, journal: Arc<Journal>) -> Self {
        Self {
            path: path.into(),
            journal,
        }
    }
}

#[async_trait]
impl LocalMounter for FakeLocalMounter {
    async fn mount(&self, _mounts: &[Mount]) -> Result<Box<dyn LocalMount>> {
        self.journal.record("local.mount");
        Ok(Box::new(FakeLocalMount {
            path: self.path.clone(),
            journal: self.journal.clone(),
        }))
    }
}

struct FakeLocalMount {
    path: PathBuf,
    journal: Arc<Journal>,
}

#[async_trait]
impl LocalMount for FakeLocalMount {
    fn path(&self) -> &Path {
        &self.path
    }

    async fn unmount(self: Box<Self>) -> Result<()> {
        self.journal.record("local.unmount");
        Ok(())
    }
}

// =============================================================================
// Network
// =============================================================================

pub struct FakeNetwork {
    journal: Arc<Journal>,
}

#[async_trait]
impl NetworkProvider for FakeNetwork {
    async fn new_namespace(&self) -> Result<Arc<dyn Namespace>> {
        self.journal.record("netns.new");
        Ok(Arc::new(FakeNamespace {
            path: PathBuf::from("/var/run/netns/fake"),
            journal: self.journal.clone(),
            closed: AtomicBool::new(false),
        }))
    }
}

struct FakeNamespace {
    path: PathBuf,
    journal: Arc<Journal>,
    closed: AtomicBool,
}

#[async_trait]
impl Namespace for FakeNamespace {
    fn path(&self) -> Option<&Path> {
        Some(&self.path)
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            self.journal.record("netns.close.again");
        } else {
            self.journal.record("netns.close");
        }
        Ok(())
    }
}

/// Journaled providers for the isolated modes; host mode is left out.
pub fn fake_providers(journal: &Arc<Journal>) -> HashMap<NetMode, Arc<dyn NetworkProvider>> {
    let provider: Arc<dyn NetworkProvider> = Arc::new(FakeNetwork {
        journal: journal.clone(),
    });
    HashMap::from([(NetMode::Unset, provider.clone()), (NetMode::None, provider)])
}

// =============================================================================
// Helpers
// =============================================================================

/// Polls `cond` every few milliseconds until it holds or a second passes.
pub async fn eventually(mut cond: impl FnMut() -> bool) {
    for _ in 0..200 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}
