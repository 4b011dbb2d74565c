//! Partitioned worker pool on tokio tasks.
//!
//! Each partition owns one unbounded queue shared by its workers. A
//! submission goes to `hint % partitions`, or to the next partition with an
//! idle worker when that one is saturated. Every worker publishes a
//! `WorkerContext` that shutdown inspects through `map_running_contexts`.

use crate::connection::ConnectionHandle;
use crate::error::ConnError;
use futures::FutureExt;
use parking_lot::Mutex;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

pub type TaskFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;
type TaskFn = Box<dyn FnOnce(Arc<WorkerContext>) -> TaskFuture + Send>;

/// Shutdown drains ordinary work before log writers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    Normal,
    LogWriter,
}

/// Which running contexts a query counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerFilter {
    All,
    ExceptLogWriter,
    LogWriterOnly,
}

impl WorkerFilter {
    pub fn matches(self, kind: TaskKind) -> bool {
        match self {
            WorkerFilter::All => true,
            WorkerFilter::ExceptLogWriter => kind != TaskKind::LogWriter,
            WorkerFilter::LogWriterOnly => kind == TaskKind::LogWriter,
        }
    }
}

pub struct Task {
    kind: TaskKind,
    connection: Option<ConnectionHandle>,
    run: TaskFn,
}

impl Task {
    pub fn new<F, Fut>(kind: TaskKind, f: F) -> Self
    where
        F: FnOnce(Arc<WorkerContext>) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Task {
            kind,
            connection: None,
            run: Box::new(move |ctx| Box::pin(f(ctx))),
        }
    }

    /// Bind the task to a connection for the duration of its run.
    pub fn for_connection(mut self, handle: ConnectionHandle) -> Self {
        self.connection = Some(handle);
        self
    }

    pub fn kind(&self) -> TaskKind {
        self.kind
    }
}

#[derive(Debug, Clone, Copy)]
struct Running {
    kind: TaskKind,
    connection: Option<ConnectionHandle>,
}

/// Per-worker record. Only the owning worker writes it.
#[derive(Debug)]
pub struct WorkerContext {
    id: usize,
    partition: usize,
    busy: AtomicBool,
    running: Mutex<Option<Running>>,
    abort: Mutex<CancellationToken>,
}

impl WorkerContext {
    fn new(id: usize, partition: usize) -> Self {
        WorkerContext {
            id,
            partition,
            busy: AtomicBool::new(false),
            running: Mutex::new(None),
            abort: Mutex::new(CancellationToken::new()),
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn partition(&self) -> usize {
        self.partition
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    /// Kind of the task currently running, if any.
    pub fn running_kind(&self) -> Option<TaskKind> {
        let running = *self.running.lock();
        running.map(|r| r.kind)
    }

    /// Connection bound to the running task.
    pub fn connection(&self) -> Option<ConnectionHandle> {
        let running = *self.running.lock();
        running.and_then(|r| r.connection)
    }

    /// Token cancelled when this task is force-terminated.
    pub fn abort_token(&self) -> CancellationToken {
        self.abort.lock().clone()
    }

    fn begin(&self, kind: TaskKind, connection: Option<ConnectionHandle>) -> CancellationToken {
        let token = CancellationToken::new();
        *self.abort.lock() = token.clone();
        *self.running.lock() = Some(Running { kind, connection });
        self.busy.store(true, Ordering::Release);
        token
    }

    fn finish(&self) {
        *self.running.lock() = None;
        self.busy.store(false, Ordering::Release);
    }

    fn abort(&self) {
        self.abort.lock().cancel();
    }
}

/// Worker pool seam used by the dispatch bridge and shutdown.
pub trait WorkerPool: Send + Sync {
    fn submit(&self, partition_hint: usize, task: Task) -> Result<(), ConnError>;

    fn map_running_contexts(&self, f: &mut dyn FnMut(&WorkerContext));

    fn max_worker_count(&self) -> usize;

    fn start_all(&self);

    fn busy_count(&self, filter: WorkerFilter) -> usize {
        let mut n = 0;
        self.map_running_contexts(&mut |ctx| {
            if ctx.running_kind().is_some_and(|kind| filter.matches(kind)) {
                n += 1;
            }
        });
        n
    }

    /// Force-terminate running tasks matching `filter`. Returns how many.
    fn abort_running(&self, filter: WorkerFilter) -> usize;

    /// Stop all workers once their current task ends.
    fn stop(&self);
}

struct Partition {
    tx: mpsc::UnboundedSender<Task>,
    rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Task>>>,
    queued: Arc<AtomicUsize>,
}

pub struct TaskPool {
    name: &'static str,
    partitions: Vec<Partition>,
    contexts: Vec<Arc<WorkerContext>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
    shutdown: CancellationToken,
}

impl TaskPool {
    /// `workers` are spread over `partitions`; every partition gets at least one.
    pub fn new(name: &'static str, workers: usize, partitions: usize) -> Self {
        let partitions = partitions.max(1);
        let workers = workers.max(partitions);

        let queues: Vec<Partition> = (0..partitions)
            .map(|_| {
                let (tx, rx) = mpsc::unbounded_channel();
                Partition {
                    tx,
                    rx: Arc::new(tokio::sync::Mutex::new(rx)),
                    queued: Arc::new(AtomicUsize::new(0)),
                }
            })
            .collect();
        let contexts = (0..workers)
            .map(|id| Arc::new(WorkerContext::new(id, id % partitions)))
            .collect();

        TaskPool {
            name,
            partitions: queues,
            contexts,
            handles: Mutex::new(Vec::with_capacity(workers)),
            started: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn partition_count(&self) -> usize {
        self.partitions.len()
    }

    /// Tasks submitted but not yet picked up.
    pub fn queued(&self) -> usize {
        self.partitions
            .iter()
            .map(|p| p.queued.load(Ordering::Acquire))
            .sum()
    }

    /// Workers neither running nor about to run a task.
    pub fn idle_count(&self) -> usize {
        let busy = self.contexts.iter().filter(|c| c.is_busy()).count();
        self.contexts.len().saturating_sub(busy + self.queued())
    }

    fn has_idle_worker(&self, partition: usize) -> bool {
        let idle = self
            .contexts
            .iter()
            .filter(|c| c.partition == partition && !c.is_busy())
            .count();
        idle > self.partitions[partition].queued.load(Ordering::Acquire)
    }

    fn pick_partition(&self, hint: usize) -> usize {
        let n = self.partitions.len();
        let home = hint % n;
        (0..n)
            .map(|step| (home + step) % n)
            .find(|&p| self.has_idle_worker(p))
            .unwrap_or(home)
    }

    async fn run_worker(
        ctx: Arc<WorkerContext>,
        rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Task>>>,
        queued: Arc<AtomicUsize>,
        shutdown: CancellationToken,
        pool: &'static str,
    ) {
        loop {
            let next = {
                let mut rx = rx.lock().await;
                tokio::select! {
                    _ = shutdown.cancelled() => None,
                    task = rx.recv() => task,
                }
            };
            let Some(task) = next else { break };
            queued.fetch_sub(1, Ordering::AcqRel);

            let abort = ctx.begin(task.kind, task.connection);
            let run = AssertUnwindSafe((task.run)(ctx.clone())).catch_unwind();
            tokio::select! {
                res = run => {
                    if res.is_err() {
                        error!(pool, worker = ctx.id, "task panicked");
                    }
                }
                _ = abort.cancelled() => {
                    warn!(pool, worker = ctx.id, "task terminated");
                }
            }
            ctx.finish();
        }
        debug!(pool, worker = ctx.id, "worker stopped");
    }
}

impl WorkerPool for TaskPool {
    fn submit(&self, partition_hint: usize, task: Task) -> Result<(), ConnError> {
        if self.shutdown.is_cancelled() {
            return Err(ConnError::PoolExhausted);
        }
        let partition = self.pick_partition(partition_hint);
        let queue = &self.partitions[partition];
        queue.queued.fetch_add(1, Ordering::AcqRel);
        if queue.tx.send(task).is_err() {
            queue.queued.fetch_sub(1, Ordering::AcqRel);
            return Err(ConnError::PoolExhausted);
        }
        Ok(())
    }

    fn map_running_contexts(&self, f: &mut dyn FnMut(&WorkerContext)) {
        for ctx in self.contexts.iter().filter(|c| c.is_busy()) {
            f(ctx);
        }
    }

    fn max_worker_count(&self) -> usize {
        self.contexts.len()
    }

    /// Spawn every worker. Must run inside a tokio runtime; later calls are no-ops.
    fn start_all(&self) {
        if self.started.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut handles = self.handles.lock();
        for ctx in &self.contexts {
            let partition = &self.partitions[ctx.partition];
            handles.push(tokio::spawn(Self::run_worker(
                ctx.clone(),
                partition.rx.clone(),
                partition.queued.clone(),
                self.shutdown.clone(),
                self.name,
            )));
        }
        debug!(pool = self.name, workers = self.contexts.len(), "worker pool started");
    }

    fn abort_running(&self, filter: WorkerFilter) -> usize {
        let mut n = 0;
        self.map_running_contexts(&mut |ctx| {
            if ctx.running_kind().is_some_and(|kind| filter.matches(kind)) {
                ctx.abort();
                n += 1;
            }
        });
        n
    }

    fn stop(&self) {
        self.shutdown.cancel();
    }
}

impl Drop for TaskPool {
    fn drop(&mut self) {
        self.shutdown.cancel();
        for handle in self.handles.lock().drain(..) {
            handle.abort();
        }
    }
}
