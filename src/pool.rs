//! Bounded pool of worker threads, each owning a private engine.
//!
//! A request goes straight to an idle worker; when none is idle it waits in a
//! bounded FIFO channel of at most `queue_capacity` entries. A worker that
//! finishes a task claims the oldest queued request, or marks itself idle,
//! before it replies. A caller that has seen a reply can therefore always
//! submit one more request without overflowing the queue.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use bytes::Bytes;
use crossbeam_channel::{Receiver, Sender, TrySendError};
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, trace};

use crate::engine::{EmitMode, Engine, EngineOptions, RawMatch};
use crate::error::{PoolError, QueryError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolConfig {
    pub size: usize,
    pub queue_capacity: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        let size = thread::available_parallelism().map(|n| n.get()).unwrap_or(4);
        Self { size, queue_capacity: 1024 }
    }
}

/// One document to project.
#[derive(Debug, Clone)]
pub struct WorkRequest {
    /// Echoed in the response.
    pub id: u64,
    pub line: Bytes,
    pub query: String,
    pub emit_mode: EmitMode,
}

/// Outcome of a [`WorkRequest`]. Document and query errors are reported in
/// `error`; pool failures are reported as [`PoolError`] instead.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkResponse {
    pub id: u64,
    pub result: Option<Value>,
    pub raw: Vec<RawMatch>,
    pub error: Option<String>,
}

type Reply = oneshot::Sender<Result<WorkResponse, PoolError>>;

struct Task {
    request: WorkRequest,
    reply: Reply,
}

struct State {
    idle: Vec<usize>,
    senders: Vec<Sender<Task>>,
    terminated: bool,
}

struct Shared {
    state: Mutex<State>,
    queue: Receiver<Task>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Oldest queued task, or `None` after marking `index` idle.
    fn claim_next(&self, index: usize) -> Option<Task> {
        let mut state = self.lock();
        if !state.terminated {
            if let Ok(task) = self.queue.try_recv() {
                return Some(task);
            }
        }
        state.idle.push(index);
        None
    }
}

struct Cached {
    query: String,
    engine: Engine,
}

/// Per-thread state: the last compiled query and its engine.
#[derive(Default)]
struct WorkerContext {
    cached: Option<Cached>,
}

impl WorkerContext {
    fn engine_for(&mut self, query: &str, mode: EmitMode) -> Result<&mut Engine, QueryError> {
        let cached = match self.cached.take() {
            Some(c) if c.query == query && c.engine.emit_mode() == mode => c,
            _ => {
                let options = EngineOptions { emit_mode: mode, ..EngineOptions::default() };
                Cached { query: query.to_owned(), engine: Engine::from_query(query, options)? }
            }
        };
        Ok(&mut self.cached.insert(cached).engine)
    }

    fn handle(&mut self, request: &WorkRequest) -> WorkResponse {
        let outcome = self
            .engine_for(&request.query, request.emit_mode)
            .and_then(|engine| engine.run_bytes(&request.line));
        match outcome {
            Ok(document) => {
                let raw = document.raw_matches().cloned().collect();
                WorkResponse { id: request.id, result: document.into_value(), raw, error: None }
            }
            Err(e) => WorkResponse { id: request.id, result: None, raw: Vec::new(), error: Some(e.to_string()) },
        }
    }
}

fn worker_loop(index: usize, tasks: Receiver<Task>, shared: Arc<Shared>) {
    let mut context = WorkerContext::default();
    let mut next = tasks.recv().ok();
    while let Some(task) = next {
        trace!(target: "jql::pool", worker = index, id = task.request.id, "task start");
        let response = context.handle(&task.request);

        next = shared.claim_next(index);
        // The requester may have gone away; nothing to do then.
        let _ = task.reply.send(Ok(response));
        if next.is_none() {
            next = tasks.recv().ok();
        }
    }
    debug!(target: "jql::pool", worker = index, "worker exiting");
}

/// Fixed-size set of worker threads with a bounded FIFO overflow queue.
///
/// Dropping the pool stops it without waiting: queued requests fail with
/// [`PoolError::Terminated`] and the threads exit after their current task.
/// Call [`WorkerPool::terminate`] to wait for them.
pub struct WorkerPool {
    shared: Arc<Shared>,
    overflow: Sender<Task>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    config: PoolConfig,
}

impl WorkerPool {
    pub fn new(config: PoolConfig) -> std::io::Result<Self> {
        let config = PoolConfig { size: config.size.max(1), ..config };
        let (overflow, queue) = crossbeam_channel::bounded(config.queue_capacity);
        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                idle: (0..config.size).rev().collect(),
                senders: Vec::with_capacity(config.size),
                terminated: false,
            }),
            queue,
        });

        let mut threads = Vec::with_capacity(config.size);
        for index in 0..config.size {
            let (tx, rx) = crossbeam_channel::unbounded();
            let worker_shared = Arc::clone(&shared);
            let spawned = thread::Builder::new()
                .name(format!("jql-worker-{}", index))
                .spawn(move || worker_loop(index, rx, worker_shared));
            let handle = match spawned {
                Ok(handle) => handle,
                Err(e) => {
                    // Dropping the senders lets the workers already started exit.
                    shared.lock().senders.clear();
                    return Err(e);
                }
            };
            shared.lock().senders.push(tx);
            threads.push(handle);
        }
        debug!(target: "jql::pool", size = config.size, queue_capacity = config.queue_capacity, "worker pool started");
        Ok(Self { shared, overflow, threads: Mutex::new(threads), config })
    }

    pub fn size(&self) -> usize {
        self.config.size
    }

    /// Requests that can be in the pool at once: running plus queued.
    pub fn capacity(&self) -> usize {
        self.config.size + self.config.queue_capacity
    }

    /// Hands a request to an idle worker or queues it. The returned receiver
    /// resolves with the response, or with the reason it was refused.
    pub fn submit(&self, request: WorkRequest) -> oneshot::Receiver<Result<WorkResponse, PoolError>> {
        let (reply, rx) = oneshot::channel();
        let mut state = self.shared.lock();
        if state.terminated {
            let _ = reply.send(Err(PoolError::Terminated));
            return rx;
        }

        let task = Task { request, reply };
        if let Some(index) = state.idle.pop() {
            if let Err(crossbeam_channel::SendError(task)) = state.senders[index].send(task) {
                let _ = task.reply.send(Err(PoolError::WorkerLost));
            }
            return rx;
        }
        match self.overflow.try_send(task) {
            Ok(()) => {}
            Err(TrySendError::Full(task)) => {
                let _ = task.reply.send(Err(PoolError::QueueFull { capacity: self.config.queue_capacity }));
            }
            Err(TrySendError::Disconnected(task)) => {
                let _ = task.reply.send(Err(PoolError::Terminated));
            }
        }
        rx
    }

    pub async fn execute(&self, request: WorkRequest) -> Result<WorkResponse, PoolError> {
        settle(self.submit(request)).await
    }

    /// Requests waiting for a worker.
    pub fn queue_size(&self) -> usize {
        self.shared.queue.len()
    }

    pub fn active_workers(&self) -> usize {
        self.config.size - self.shared.lock().idle.len()
    }

    /// Fails every queued request with [`PoolError::Terminated`], lets running
    /// tasks finish, then joins the worker threads.
    ///
    /// This blocks the calling thread until the running tasks are done.
    pub fn terminate(&self) {
        self.stop();
        let threads = std::mem::take(&mut *self.threads.lock().unwrap_or_else(PoisonError::into_inner));
        for handle in threads {
            let _ = handle.join();
        }
    }

    fn stop(&self) {
        let dropped: Vec<Task> = {
            let mut state = self.shared.lock();
            if state.terminated {
                return;
            }
            state.terminated = true;
            state.senders.clear();
            self.shared.queue.try_iter().collect()
        };
        let failed = dropped.len();
        for task in dropped {
            let _ = task.reply.send(Err(PoolError::Terminated));
        }
        debug!(target: "jql::pool", failed, "worker pool terminated");
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Awaits a receiver from [`WorkerPool::submit`].
pub async fn settle(rx: oneshot::Receiver<Result<WorkResponse, PoolError>>) -> Result<WorkResponse, PoolError> {
    rx.await.unwrap_or(Err(PoolError::WorkerLost))
}
