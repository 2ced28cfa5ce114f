use std::collections::{BTreeSet, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Mutable per-worker state: what it can run and what it currently holds.
#[derive(Debug, Default)]
pub struct WorkerState {
    pub funcs: BTreeSet<String>,
    pub leased: HashSet<i64>,
}

/// Shared view of a connected worker.
///
/// Owned by the worker's connection task; the dispatcher holds clones inside
/// grab entries and pushes assignments through `outbound`.
#[derive(Debug)]
pub struct WorkerHandle {
    pub id: u64,
    outbound: mpsc::Sender<Vec<u8>>,
    alive: AtomicBool,
    retired: AtomicBool,
    closed: CancellationToken,
    state: Mutex<WorkerState>,
}

impl WorkerHandle {
    pub fn new(id: u64, outbound: mpsc::Sender<Vec<u8>>) -> Self {
        Self {
            id,
            outbound,
            alive: AtomicBool::new(true),
            retired: AtomicBool::new(false),
            closed: CancellationToken::new(),
            state: Mutex::new(WorkerState::default()),
        }
    }

    pub fn state(&self) -> MutexGuard<'_, WorkerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// Stop offering work to this worker and signal its connection to close.
    pub fn mark_dead(&self) {
        self.alive.store(false, Ordering::Release);
        self.closed.cancel();
    }

    /// Resolves once the worker has been marked dead.
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }

    /// Claim the one-time teardown of this worker. Only the first caller gets `true`.
    pub fn begin_retire(&self) -> bool {
        self.mark_dead();
        !self.retired.swap(true, Ordering::AcqRel)
    }

    pub fn can_do(&self, func: &str) -> bool {
        self.state().funcs.contains(func)
    }

    /// Add a function; returns `false` if it was already announced.
    pub fn add_func(&self, func: &str) -> bool {
        self.state().funcs.insert(func.to_string())
    }

    /// Remove a function; returns `false` if it was not announced.
    pub fn remove_func(&self, func: &str) -> bool {
        self.state().funcs.remove(func)
    }

    pub fn funcs(&self) -> Vec<String> {
        self.state().funcs.iter().cloned().collect()
    }

    pub fn lease(&self, job_id: i64) {
        self.state().leased.insert(job_id);
    }

    pub fn release(&self, job_id: i64) -> bool {
        self.state().leased.remove(&job_id)
    }

    pub fn leased(&self) -> Vec<i64> {
        self.state().leased.iter().copied().collect()
    }

    /// Queue a frame for the worker without waiting on the socket.
    ///
    /// Fails when the worker is dead, its writer is gone, or its outbound
    /// buffer is full.
    pub fn deliver(&self, body: Vec<u8>) -> bool {
        self.is_alive() && self.outbound.try_send(body).is_ok()
    }
}

/// A worker waiting for work, and the message id to answer on.
#[derive(Debug, Clone)]
pub struct GrabItem {
    pub worker: Arc<WorkerHandle>,
    pub msg_id: Vec<u8>,
}

/// FIFO of pending grab requests.
#[derive(Debug, Default)]
pub struct GrabQueue {
    items: VecDeque<GrabItem>,
}

impl GrabQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, item: GrabItem) {
        self.items.push_back(item);
    }

    /// Put an entry back at the head, e.g. when its assignment was abandoned.
    pub fn push_front(&mut self, item: GrabItem) {
        self.items.push_front(item);
    }

    /// Take the front-most live entry whose worker can run `func`.
    /// Entries behind it keep their position.
    pub fn take_for(&mut self, func: &str) -> Option<GrabItem> {
        let pos = self
            .items
            .iter()
            .position(|item| item.worker.is_alive() && item.worker.can_do(func))?;
        self.items.remove(pos)
    }

    /// Purge every entry belonging to a worker. Returns how many were dropped.
    pub fn remove_worker(&mut self, worker_id: u64) -> usize {
        let before = self.items.len();
        self.items.retain(|item| item.worker.id != worker_id);
        before - self.items.len()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}
