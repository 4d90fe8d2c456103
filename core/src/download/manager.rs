//! Bounded worker pool that downloads full-resolution wallpapers into the asset store.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver};
use std::thread::{self, JoinHandle};

use anyhow::Context;
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::error::{CoreError, OperationError};
use crate::net::{Transport, fetch_bytes};
use crate::store::AssetStore;
use crate::types::{AssetKey, CatalogEntry, EntryId};

use super::retry::{RetryPolicy, Sleeper, ThreadSleeper};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloadConfig {
    pub concurrency: usize,
    /// Pending tasks allowed before `enqueue` blocks.
    pub queue_depth: usize,
    pub retry: RetryPolicy,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self { concurrency: 3, queue_depth: 32, retry: RetryPolicy::default() }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u64);

impl TaskId {
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskHandle {
    pub id: TaskId,
    pub entry: EntryId,
    /// Where the asset will live once the task succeeds.
    pub target: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Queued,
    Running,
    Succeeded,
    Failed,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Succeeded | TaskState::Failed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskStatus {
    pub handle: TaskHandle,
    pub state: TaskState,
    pub attempts: u32,
    pub last_error: Option<CoreError>,
}

/// Terminal notification, delivered once per task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadEvent {
    Succeeded { task: TaskHandle, path: PathBuf, attempts: u32 },
    Failed { task: TaskHandle, error: OperationError },
}

impl DownloadEvent {
    pub fn task(&self) -> &TaskHandle {
        match self {
            DownloadEvent::Succeeded { task, .. } | DownloadEvent::Failed { task, .. } => task,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum EnqueueError {
    #[error("download queue is full")]
    QueueFull,
    #[error("download manager is shutting down")]
    ShuttingDown,
}

pub type EventSink = Box<dyn Fn(DownloadEvent) + Send + Sync>;

struct TaskRecord {
    entry: CatalogEntry,
    status: TaskStatus,
}

#[derive(Default)]
struct QueueState {
    pending: VecDeque<TaskId>,
    tasks: HashMap<TaskId, TaskRecord>,
    /// Non-terminal task per entry, for enqueue-time dedup.
    live: HashMap<EntryId, TaskId>,
    next_id: u64,
    shutdown: bool,
}

struct Shared {
    state: Mutex<QueueState>,
    work_ready: Condvar,
    space_ready: Condvar,
    queue_depth: usize,
    retry: RetryPolicy,
    transport: Arc<dyn Transport>,
    store: AssetStore,
    sleeper: Arc<dyn Sleeper>,
    sink: EventSink,
}

/// Dropping the manager stops intake, drains the queue, and joins the workers.
pub struct DownloadManager {
    shared: Arc<Shared>,
    workers: Vec<JoinHandle<()>>,
}

impl std::fmt::Debug for DownloadManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadManager")
            .field("workers", &self.workers.len())
            .field("queue_depth", &self.shared.queue_depth)
            .field("store", &self.shared.store.root())
            .finish()
    }
}

impl DownloadManager {
    /// Start the pool and return the channel on which terminal events arrive.
    pub fn spawn(
        config: DownloadConfig,
        transport: Arc<dyn Transport>,
        store: AssetStore,
    ) -> anyhow::Result<(Self, Receiver<DownloadEvent>)> {
        let (tx, rx) = mpsc::channel();
        let sink: EventSink = Box::new(move |event| {
            let _ = tx.send(event);
        });
        let manager = Self::spawn_with(config, transport, store, Arc::new(ThreadSleeper), sink)?;
        Ok((manager, rx))
    }

    pub fn spawn_with(
        config: DownloadConfig,
        transport: Arc<dyn Transport>,
        store: AssetStore,
        sleeper: Arc<dyn Sleeper>,
        sink: EventSink,
    ) -> anyhow::Result<Self> {
        let shared = Arc::new(Shared {
            state: Mutex::new(QueueState::default()),
            work_ready: Condvar::new(),
            space_ready: Condvar::new(),
            queue_depth: config.queue_depth.max(1),
            retry: config.retry,
            transport,
            store,
            sleeper,
            sink,
        });

        let mut manager = Self { shared, workers: Vec::new() };
        for index in 0..config.concurrency.max(1) {
            let shared = Arc::clone(&manager.shared);
            let worker = thread::Builder::new()
                .name(format!("wselector-download-{index}"))
                .spawn(move || worker_loop(&shared))
                .context("spawning download worker")?;
            manager.workers.push(worker);
        }
        debug!(workers = manager.workers.len(), "download pool started");
        Ok(manager)
    }

    /// Queue a download, blocking while the queue is full. An entry that is already queued or
    /// running yields its existing handle.
    pub fn enqueue(&self, entry: &CatalogEntry) -> Result<TaskHandle, EnqueueError> {
        self.submit(entry, true)
    }

    /// Like [`enqueue`](Self::enqueue) but fails with `QueueFull` instead of blocking.
    pub fn try_enqueue(&self, entry: &CatalogEntry) -> Result<TaskHandle, EnqueueError> {
        self.submit(entry, false)
    }

    pub fn status(&self, id: TaskId) -> Option<TaskStatus> {
        self.shared.state.lock().tasks.get(&id).map(|record| record.status.clone())
    }

    /// Forget a terminal task. Returns `false` for unknown or still-active tasks.
    pub fn acknowledge(&self, id: TaskId) -> bool {
        let mut state = self.shared.state.lock();
        match state.tasks.get(&id) {
            Some(record) if record.status.state.is_terminal() => {
                state.tasks.remove(&id);
                true
            }
            _ => false,
        }
    }

    pub fn pending(&self) -> usize {
        self.shared.state.lock().pending.len()
    }

    fn submit(&self, entry: &CatalogEntry, block: bool) -> Result<TaskHandle, EnqueueError> {
        let shared = &self.shared;
        let mut state = shared.state.lock();
        loop {
            if state.shutdown {
                return Err(EnqueueError::ShuttingDown);
            }
            if let Some(record) = state.live.get(&entry.id).and_then(|id| state.tasks.get(id)) {
                debug!(entry = %entry.id, task = record.status.handle.id.0, "download already active");
                return Ok(record.status.handle.clone());
            }
            if state.pending.len() < shared.queue_depth {
                break;
            }
            if !block {
                return Err(EnqueueError::QueueFull);
            }
            shared.space_ready.wait(&mut state);
        }

        state.next_id += 1;
        let id = TaskId(state.next_id);
        let handle = TaskHandle {
            id,
            entry: entry.id.clone(),
            target: shared.store.path_for(&AssetKey::full(entry)),
        };
        let status =
            TaskStatus { handle: handle.clone(), state: TaskState::Queued, attempts: 0, last_error: None };
        state.tasks.insert(id, TaskRecord { entry: entry.clone(), status });
        state.live.insert(entry.id.clone(), id);
        state.pending.push_back(id);
        drop(state);

        shared.work_ready.notify_one();
        info!(entry = %entry.id, task = id.0, "download queued");
        Ok(handle)
    }
}

impl Drop for DownloadManager {
    fn drop(&mut self) {
        self.shared.state.lock().shutdown = true;
        self.shared.work_ready.notify_all();
        self.shared.space_ready.notify_all();
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                warn!("download worker panicked");
            }
        }
    }
}

fn worker_loop(shared: &Shared) {
    loop {
        let (id, entry) = {
            let mut state = shared.state.lock();
            while state.pending.is_empty() && !state.shutdown {
                shared.work_ready.wait(&mut state);
            }
            let Some(id) = state.pending.pop_front() else {
                break;
            };
            let Some(record) = state.tasks.get_mut(&id) else {
                continue;
            };
            record.status.state = TaskState::Running;
            (id, record.entry.clone())
        };
        shared.space_ready.notify_one();

        let outcome = run_task(shared, id, &entry);
        finish(shared, id, outcome);
    }
}

fn run_task(shared: &Shared, id: TaskId, entry: &CatalogEntry) -> Result<(PathBuf, u32), OperationError> {
    let key = AssetKey::full(entry);
    if shared.store.contains(&key) {
        debug!(entry = %entry.id, "asset already stored");
        return Ok((shared.store.path_for(&key), 0));
    }

    let mut attempt = 0;
    loop {
        attempt += 1;
        if let Some(record) = shared.state.lock().tasks.get_mut(&id) {
            record.status.attempts = attempt;
        }

        let error = match attempt_once(shared, entry, &key) {
            Ok(path) => return Ok((path, attempt)),
            Err(error) => error,
        };

        match shared.retry.next_delay(attempt, &error) {
            Some(delay) => {
                warn!(entry = %entry.id, attempt, ?delay, %error, "download attempt failed, retrying");
                if let Some(record) = shared.state.lock().tasks.get_mut(&id) {
                    record.status.last_error = Some(error);
                }
                shared.sleeper.sleep(delay);
            }
            None => return Err(OperationError::new("download", entry.id.as_str(), attempt, error)),
        }
    }
}

fn attempt_once(shared: &Shared, entry: &CatalogEntry, key: &AssetKey) -> Result<PathBuf, CoreError> {
    let bytes = fetch_bytes(shared.transport.as_ref(), &entry.full_url)?;
    if bytes.is_empty() {
        return Err(CoreError::MalformedResponse(format!("empty body for {}", entry.id)));
    }
    if let Some(expected) = entry.file_size {
        let actual = bytes.len() as u64;
        if actual != expected {
            return Err(CoreError::ChecksumMismatch { expected, actual });
        }
    }
    shared.store.write(key, &bytes)
}

fn finish(shared: &Shared, id: TaskId, outcome: Result<(PathBuf, u32), OperationError>) {
    let event = {
        let mut state = shared.state.lock();
        let Some(record) = state.tasks.get_mut(&id) else {
            return;
        };
        let task = record.status.handle.clone();
        let event = match outcome {
            Ok((path, attempts)) => {
                record.status.state = TaskState::Succeeded;
                record.status.attempts = attempts;
                info!(entry = %task.entry, attempts, "download finished");
                DownloadEvent::Succeeded { task, path, attempts }
            }
            Err(error) => {
                record.status.state = TaskState::Failed;
                record.status.attempts = error.attempts;
                record.status.last_error = Some(error.source.clone());
                warn!(entry = %task.entry, %error, "download failed");
                DownloadEvent::Failed { task, error }
            }
        };
        let entry = event.task().entry.clone();
        if state.live.get(&entry) == Some(&id) {
            state.live.remove(&entry);
        }
        event
    };
    (shared.sink)(event);
}
