//! Pool scheduler.
//!
//! A [`Pool`] keeps `process_count` worker processes busy with units of work
//! taken from one shared inbound queue. Each worker slot has a supervisor task
//! that feeds its worker one unit at a time, forwards results to the gather
//! loop and replaces the worker when it retires or dies. The gather loop
//! resolves the caller waiting on each task id.
//!
//! ```text
//!  submit ──► inbound queue ──► slot supervisor ──► worker stdin
//!                                      │
//!  TaskHandle ◄── gather loop ◄── outbound queue ◄── worker stdout
//! ```

use super::proc::Proc;
use super::protocol::{Call, ParentMessage, TaskId, UnitOfWork, WorkerMessage};
use super::signals::{TerminationReason, analyze_exit_status};
use super::spawn::{WorkerCommand, spawn_worker};
use crate::error::{PoolError, Result};
use futures::FutureExt;
use futures::future::try_join_all;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, trace, warn};

/// How long a dead worker gets to be reaped before it is killed outright.
const REAP_TIMEOUT: Duration = Duration::from_millis(500);

/// Pause before replacing a worker that died without ever becoming ready.
const RESPAWN_BACKOFF: Duration = Duration::from_millis(50);

/// Consecutive workers in one slot that may die before becoming ready
/// before the pool gives up.
const MAX_STARTUP_FAILURES: u32 = 3;

/// What `close` does with work that has not finished yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum CloseMode {
    /// Stop accepting work, finish everything already queued, then let
    /// workers exit.
    #[default]
    Drain,
    /// Kill workers immediately and fail every pending caller with
    /// [`PoolError::PoolClosed`].
    Terminate,
}

impl FromStr for CloseMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "drain" => Ok(Self::Drain),
            "terminate" | "kill" => Ok(Self::Terminate),
            _ => Err(format!("Unknown close mode: {}", s)),
        }
    }
}

impl fmt::Display for CloseMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Drain => write!(f, "drain"),
            Self::Terminate => write!(f, "terminate"),
        }
    }
}

/// Configuration for a [`Pool`].
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Number of worker processes kept alive.
    pub process_count: usize,
    /// Units a worker runs before it is replaced. `None` keeps workers forever.
    pub max_tasks_per_worker: Option<u64>,
    /// Inbound queue bound. 0 means unbounded.
    pub queue_capacity: usize,
    /// Behaviour of [`Pool::close`].
    pub close_mode: CloseMode,
    /// How worker processes are launched.
    pub worker: WorkerCommand,
    /// How long a worker gets to exit after being asked to.
    pub join_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        const DEFAULT_PROCESSES: usize = 4;
        Self {
            process_count: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(DEFAULT_PROCESSES),
            max_tasks_per_worker: None,
            queue_capacity: 0,
            close_mode: CloseMode::default(),
            worker: WorkerCommand::default(),
            join_timeout: Duration::from_secs(5),
        }
    }
}

impl PoolConfig {
    pub fn new(worker: WorkerCommand) -> Self {
        Self {
            worker,
            ..Self::default()
        }
    }

    pub fn with_processes(mut self, count: usize) -> Self {
        self.process_count = count;
        self
    }

    pub fn with_max_tasks(mut self, max_tasks: Option<u64>) -> Self {
        self.max_tasks_per_worker = max_tasks;
        self
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    pub fn with_close_mode(mut self, mode: CloseMode) -> Self {
        self.close_mode = mode;
        self
    }

    pub fn with_join_timeout(mut self, timeout: Duration) -> Self {
        self.join_timeout = timeout;
        self
    }

    /// Apply overrides from `PROCPOOL_*` environment variables.
    ///
    /// Unparseable values are logged and ignored.
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides_from(|key| std::env::var(key).ok())
    }

    fn with_overrides_from(mut self, var: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(count) = parse_var(&var, "PROCPOOL_PROCESSES") {
            self.process_count = count;
        }
        if let Some(max) = var("PROCPOOL_MAX_TASKS") {
            match max.to_lowercase().as_str() {
                "" | "none" | "unlimited" => self.max_tasks_per_worker = None,
                _ => {
                    if let Some(max) = parse_var(&var, "PROCPOOL_MAX_TASKS") {
                        self.max_tasks_per_worker = Some(max);
                    }
                }
            }
        }
        if let Some(capacity) = parse_var(&var, "PROCPOOL_QUEUE_CAPACITY") {
            self.queue_capacity = capacity;
        }
        if let Some(mode) = parse_var(&var, "PROCPOOL_CLOSE_MODE") {
            self.close_mode = mode;
        }
        self
    }

    /// Check the configuration before any process is spawned.
    pub fn validate(&self) -> Result<()> {
        if self.process_count == 0 {
            return Err(PoolError::InvalidConfig(
                "process_count must be greater than 0".into(),
            ));
        }
        if self.max_tasks_per_worker == Some(0) {
            return Err(PoolError::InvalidConfig(
                "max_tasks_per_worker must be greater than 0 (use None for unlimited)".into(),
            ));
        }
        Ok(())
    }
}

fn parse_var<T>(var: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    let raw = var(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(key, value = %raw, error = %e, "Ignoring invalid environment override");
            None
        }
    }
}

/// Pool lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolState {
    Created,
    Running,
    Closing,
    Closed,
    /// A worker could not be replaced; the pool accepts no more work.
    Failed,
}

impl fmt::Display for PoolState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Closing => "closing",
            Self::Closed => "closed",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// State of one worker slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// Spawned, not yet ready.
    Starting,
    /// Ready and waiting for work.
    Idle,
    /// Running a unit.
    Busy,
    /// Budget spent, exiting before replacement.
    Retiring,
    /// Gone for good.
    Exited,
}

/// Snapshot of one worker slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerInfo {
    pub slot: usize,
    pub pid: Option<u32>,
    pub state: WorkerState,
    /// Units completed by the current process in this slot.
    pub tasks_completed: u64,
    /// Times this slot's process has been replaced.
    pub restarts: u64,
}

/// Pool statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub tasks_submitted: u64,
    pub tasks_completed: u64,
    pub worker_restarts: u64,
    /// Tasks whose callers are still waiting.
    pub pending: usize,
}

/// A result on its way from a slot supervisor to the gather loop.
struct Delivery {
    task_id: TaskId,
    result: Result<Value>,
}

enum InboundSender {
    Bounded(mpsc::Sender<UnitOfWork>),
    Unbounded(mpsc::UnboundedSender<UnitOfWork>),
}

impl InboundSender {
    async fn send(&self, unit: UnitOfWork) -> bool {
        match self {
            Self::Bounded(tx) => tx.send(unit).await.is_ok(),
            Self::Unbounded(tx) => tx.send(unit).is_ok(),
        }
    }
}

impl Clone for InboundSender {
    fn clone(&self) -> Self {
        match self {
            Self::Bounded(tx) => Self::Bounded(tx.clone()),
            Self::Unbounded(tx) => Self::Unbounded(tx.clone()),
        }
    }
}

enum InboundReceiver {
    Bounded(mpsc::Receiver<UnitOfWork>),
    Unbounded(mpsc::UnboundedReceiver<UnitOfWork>),
}

impl InboundReceiver {
    async fn recv(&mut self) -> Option<UnitOfWork> {
        match self {
            Self::Bounded(rx) => rx.recv().await,
            Self::Unbounded(rx) => rx.recv().await,
        }
    }

    /// No unit is queued and none can arrive.
    fn is_drained(&self) -> bool {
        match self {
            Self::Bounded(rx) => rx.is_closed() && rx.is_empty(),
            Self::Unbounded(rx) => rx.is_closed() && rx.is_empty(),
        }
    }
}

fn inbound_channel(capacity: usize) -> (InboundSender, InboundReceiver) {
    if capacity == 0 {
        let (tx, rx) = mpsc::unbounded_channel();
        (InboundSender::Unbounded(tx), InboundReceiver::Unbounded(rx))
    } else {
        let (tx, rx) = mpsc::channel(capacity);
        (InboundSender::Bounded(tx), InboundReceiver::Bounded(rx))
    }
}

/// Shared inbound queue. Idle supervisors take turns waiting on it.
type SharedInbound = Arc<tokio::sync::Mutex<InboundReceiver>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// State shared by the pool handle, its background tasks and task handles.
struct Shared {
    state: Mutex<PoolState>,
    pending: Mutex<HashMap<TaskId, oneshot::Sender<Result<Value>>>>,
    workers: Mutex<Vec<WorkerInfo>>,
    /// Set when the pool failed; the reason handed to callers.
    failure: Mutex<Option<String>>,
    shutdown: watch::Sender<bool>,
    next_id: AtomicU64,
    tasks_submitted: AtomicU64,
    tasks_completed: AtomicU64,
    worker_restarts: AtomicU64,
}

impl Shared {
    fn state(&self) -> PoolState {
        *lock(&self.state)
    }

    fn set_state(&self, state: PoolState) {
        let mut current = lock(&self.state);
        // Failed is terminal.
        if *current != PoolState::Failed {
            *current = state;
        }
    }

    /// Error handed to callers whose work will never run.
    fn closed_error(&self) -> PoolError {
        match lock(&self.failure).as_ref() {
            Some(reason) => PoolError::PoolFailed(reason.clone()),
            None => PoolError::PoolClosed,
        }
    }

    fn update_worker(&self, slot: usize, update: impl FnOnce(&mut WorkerInfo)) {
        if let Some(info) = lock(&self.workers).get_mut(slot) {
            update(info);
        }
    }

    /// Fail every caller still waiting.
    fn fail_pending(&self) {
        let drained: Vec<_> = lock(&self.pending).drain().collect();
        for (task_id, tx) in drained {
            trace!(task_id, "Failing pending task");
            let _ = tx.send(Err(self.closed_error()));
        }
    }

    /// Mark the pool as failed and stop all slots.
    fn fail(&self, reason: String) {
        error!(reason = %reason, "Pool failed");
        lock(&self.failure).get_or_insert(reason);
        *lock(&self.state) = PoolState::Failed;
        self.shutdown.send_replace(true);
        self.fail_pending();
    }

    /// Resolve the caller waiting on `delivery`, if any.
    fn resolve(&self, delivery: Delivery) {
        let Delivery { task_id, result } = delivery;
        let waiting = lock(&self.pending).remove(&task_id);
        match waiting {
            Some(tx) => {
                self.tasks_completed.fetch_add(1, Ordering::Relaxed);
                // The receiver may have been dropped after we removed the entry.
                let _ = tx.send(result);
            }
            None if task_id < self.next_id.load(Ordering::SeqCst) => {
                debug!(task_id, "Discarding result of abandoned task");
            }
            None => {
                error!(task_id, "Worker returned a result for a task id that was never issued");
            }
        }
    }
}

struct Tasks {
    supervisors: Vec<JoinHandle<()>>,
    gather: JoinHandle<()>,
}

struct PoolInner {
    config: PoolConfig,
    shared: Arc<Shared>,
    /// Dropped on close so supervisors see the queue end.
    inbound: Mutex<Option<InboundSender>>,
    /// Taken by the first `close`.
    tasks: tokio::sync::Mutex<Option<Tasks>>,
}

/// An asynchronous pool of worker processes.
///
/// Cloning a `Pool` is cheap and yields another handle to the same pool.
/// When the last handle is dropped without `close`, the queue is closed and
/// workers finish the queued work in the background.
#[derive(Clone)]
pub struct Pool {
    inner: Arc<PoolInner>,
}

impl Pool {
    /// Spawn the workers and start scheduling.
    ///
    /// Must be called from within a tokio runtime.
    pub async fn new(config: PoolConfig) -> Result<Self> {
        config.validate()?;

        let mut procs = Vec::with_capacity(config.process_count);
        for slot in 0..config.process_count {
            match spawn_worker(&config.worker, config.max_tasks_per_worker) {
                Ok(proc) => procs.push(proc),
                Err(e) => {
                    error!(slot, error = %e, "Failed to spawn worker");
                    for proc in &mut procs {
                        let _ = proc.kill().await;
                    }
                    return Err(e);
                }
            }
        }

        let workers = procs
            .iter()
            .enumerate()
            .map(|(slot, proc)| WorkerInfo {
                slot,
                pid: Some(proc.pid()),
                state: WorkerState::Starting,
                tasks_completed: 0,
                restarts: 0,
            })
            .collect();

        let (shutdown, _) = watch::channel(false);
        let shared = Arc::new(Shared {
            state: Mutex::new(PoolState::Created),
            pending: Mutex::new(HashMap::new()),
            workers: Mutex::new(workers),
            failure: Mutex::new(None),
            shutdown,
            next_id: AtomicU64::new(1),
            tasks_submitted: AtomicU64::new(0),
            tasks_completed: AtomicU64::new(0),
            worker_restarts: AtomicU64::new(0),
        });

        let (inbound_tx, inbound_rx) = inbound_channel(config.queue_capacity);
        let inbound_rx: SharedInbound = Arc::new(tokio::sync::Mutex::new(inbound_rx));
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Delivery>();

        let supervisors = procs
            .into_iter()
            .enumerate()
            .map(|(slot, proc)| {
                let supervisor = Supervisor {
                    slot,
                    config: config.clone(),
                    shared: Arc::clone(&shared),
                    inbound: Arc::clone(&inbound_rx),
                    outbound: outbound_tx.clone(),
                    shutdown: shared.shutdown.subscribe(),
                };
                tokio::spawn(supervisor.run(proc))
            })
            .collect();
        // Only supervisors hold outbound senders, so the gather loop ends with them.
        drop(outbound_tx);

        let gather_shared = Arc::clone(&shared);
        let gather = tokio::spawn(async move {
            while let Some(delivery) = outbound_rx.recv().await {
                gather_shared.resolve(delivery);
            }
            trace!("Gather loop finished");
        });

        shared.set_state(PoolState::Running);
        info!(
            processes = config.process_count,
            max_tasks = ?config.max_tasks_per_worker,
            queue_capacity = config.queue_capacity,
            close_mode = %config.close_mode,
            "Pool started"
        );

        Ok(Self {
            inner: Arc::new(PoolInner {
                config,
                shared,
                inbound: Mutex::new(Some(inbound_tx)),
                tasks: tokio::sync::Mutex::new(Some(Tasks {
                    supervisors,
                    gather,
                })),
            }),
        })
    }

    /// Run `body` with a fresh pool and close the pool afterwards.
    ///
    /// The pool is closed on every exit path, including an error or a panic
    /// inside `body`. The body's error (or panic) takes precedence over a
    /// close failure.
    pub async fn scoped<F, Fut, T, E>(config: PoolConfig, body: F) -> std::result::Result<T, E>
    where
        F: FnOnce(Pool) -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: From<PoolError>,
    {
        let pool = Pool::new(config).await?;
        let handle = pool.clone();
        let outcome = AssertUnwindSafe(async move { body(handle).await })
            .catch_unwind()
            .await;
        let closed = pool.close().await;

        match outcome {
            Err(panic) => std::panic::resume_unwind(panic),
            Ok(Err(e)) => Err(e),
            Ok(Ok(value)) => {
                closed?;
                Ok(value)
            }
        }
    }

    /// Queue a call and return a handle resolving to its result.
    ///
    /// Waits for room when the inbound queue is bounded and full.
    pub async fn submit(&self, call: Call) -> Result<TaskHandle> {
        let sender = self.inbound_sender()?;
        let shared = &self.inner.shared;

        let task_id = shared.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        // The entry must exist before a worker can possibly answer.
        lock(&shared.pending).insert(task_id, tx);
        let handle = TaskHandle {
            task_id,
            rx,
            shared: Arc::clone(shared),
            done: false,
        };

        trace!(task_id, task = %call.task, "Submitting task");
        if !sender.send(UnitOfWork::new(task_id, call)).await {
            // Dropping the handle removes the entry.
            return Err(shared.closed_error());
        }
        if shared.state() == PoolState::Failed {
            // Failed while queueing; no slot is left to run it.
            return Err(shared.closed_error());
        }
        shared.tasks_submitted.fetch_add(1, Ordering::Relaxed);
        Ok(handle)
    }

    fn inbound_sender(&self) -> Result<InboundSender> {
        if self.inner.shared.state() != PoolState::Running {
            return Err(self.inner.shared.closed_error());
        }
        lock(&self.inner.inbound)
            .clone()
            .ok_or_else(|| self.inner.shared.closed_error())
    }

    /// Run `task` with positional `args` (a tuple, array or `()`) and wait
    /// for its result.
    pub async fn apply(&self, task: &str, args: impl Serialize) -> Result<Value> {
        self.submit(Call::with_args(task, args)?).await?.await
    }

    /// Like [`apply`](Self::apply) with keyword arguments.
    pub async fn apply_with(
        &self,
        task: &str,
        args: impl Serialize,
        kwargs: Map<String, Value>,
    ) -> Result<Value> {
        let mut call = Call::with_args(task, args)?;
        call.kwargs = kwargs;
        self.submit(call).await?.await
    }

    /// Run `task` once per item, each item being its single argument.
    ///
    /// Results come back in input order. The first failure is returned and
    /// the remaining tasks are abandoned.
    pub async fn map<T, I>(&self, task: &str, items: I) -> Result<Vec<Value>>
    where
        T: Serialize,
        I: IntoIterator<Item = T>,
    {
        let mut handles = Vec::new();
        for item in items {
            handles.push(self.submit(Call::new(task).arg(item)?).await?);
        }
        try_join_all(handles).await
    }

    /// Run `task` once per item, each item being unpacked as the positional
    /// argument list.
    pub async fn starmap<T, I>(&self, task: &str, items: I) -> Result<Vec<Value>>
    where
        T: Serialize,
        I: IntoIterator<Item = T>,
    {
        let mut handles = Vec::new();
        for item in items {
            handles.push(self.submit(Call::with_args(task, item)?).await?);
        }
        try_join_all(handles).await
    }

    /// Number of worker slots.
    pub fn process_count(&self) -> usize {
        self.inner.config.process_count
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Snapshot of every worker slot.
    pub fn processes(&self) -> Vec<WorkerInfo> {
        lock(&self.inner.shared.workers).clone()
    }

    pub fn state(&self) -> PoolState {
        self.inner.shared.state()
    }

    pub fn stats(&self) -> PoolStats {
        let shared = &self.inner.shared;
        PoolStats {
            tasks_submitted: shared.tasks_submitted.load(Ordering::Relaxed),
            tasks_completed: shared.tasks_completed.load(Ordering::Relaxed),
            worker_restarts: shared.worker_restarts.load(Ordering::Relaxed),
            pending: lock(&shared.pending).len(),
        }
    }

    /// Close the pool according to its [`CloseMode`] and wait for every
    /// worker to exit.
    ///
    /// Safe to call more than once and from several handles; later calls
    /// wait for the first to finish. Returns [`PoolError::PoolFailed`] if the
    /// pool failed while running.
    pub async fn close(&self) -> Result<()> {
        let mut tasks = self.inner.tasks.lock().await;
        let Some(Tasks {
            supervisors,
            gather,
        }) = tasks.take()
        else {
            return self.failure_result();
        };

        let shared = &self.inner.shared;
        shared.set_state(PoolState::Closing);
        lock(&self.inner.inbound).take();
        if self.inner.config.close_mode == CloseMode::Terminate {
            shared.shutdown.send_replace(true);
        }
        debug!(mode = %self.inner.config.close_mode, "Closing pool");

        for handle in supervisors {
            if let Err(e) = handle.await {
                error!(error = %e, "Slot supervisor panicked");
            }
        }
        if let Err(e) = gather.await {
            error!(error = %e, "Gather loop panicked");
        }

        // Anything still pending was queued but never reached a worker.
        shared.fail_pending();
        shared.set_state(PoolState::Closed);
        info!(stats = ?self.stats(), "Pool closed");

        self.failure_result()
    }

    fn failure_result(&self) -> Result<()> {
        match lock(&self.inner.shared.failure).as_ref() {
            Some(reason) => Err(PoolError::PoolFailed(reason.clone())),
            None => Ok(()),
        }
    }
}

impl fmt::Debug for Pool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("state", &self.state())
            .field("processes", &self.process_count())
            .field("stats", &self.stats())
            .finish()
    }
}

/// Handle to a submitted task. Resolves to the task's result.
///
/// Dropping an unresolved handle abandons the task: it still runs, and its
/// result is discarded when it arrives.
pub struct TaskHandle {
    task_id: TaskId,
    rx: oneshot::Receiver<Result<Value>>,
    shared: Arc<Shared>,
    done: bool,
}

impl TaskHandle {
    pub fn id(&self) -> TaskId {
        self.task_id
    }
}

impl Future for TaskHandle {
    type Output = Result<Value>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(result) => {
                self.done = true;
                Poll::Ready(result.unwrap_or_else(|_| Err(self.shared.closed_error())))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for TaskHandle {
    fn drop(&mut self) {
        if !self.done && lock(&self.shared.pending).remove(&self.task_id).is_some() {
            trace!(task_id = self.task_id, "Task abandoned by caller");
        }
    }
}

impl fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle")
            .field("task_id", &self.task_id)
            .field("done", &self.done)
            .finish()
    }
}

/// Why a worker stopped being driven.
enum SlotExit {
    /// Budget spent; replace it.
    Retired,
    /// Died or misbehaved; replace it.
    Crashed { was_ready: bool },
    /// Queue closed and empty; stop the worker and the slot.
    Drained,
    /// Shutdown signalled; the worker has been killed.
    Shutdown,
}

enum Event {
    Message(Result<Option<WorkerMessage>>),
    Work(Option<UnitOfWork>),
    Shutdown,
}

/// Owns one worker slot for the life of the pool.
struct Supervisor {
    slot: usize,
    config: PoolConfig,
    shared: Arc<Shared>,
    inbound: SharedInbound,
    outbound: mpsc::UnboundedSender<Delivery>,
    shutdown: watch::Receiver<bool>,
}

impl Supervisor {
    #[instrument(level = "debug", skip_all, fields(slot = self.slot))]
    async fn run(mut self, first: Proc) {
        let mut proc = first;
        let mut startup_failures = 0;
        loop {
            let exit = self.drive(&mut proc).await;
            match exit {
                SlotExit::Drained => {
                    self.set_state(WorkerState::Retiring);
                    if let Err(e) = proc.stop(self.config.join_timeout).await {
                        warn!(pid = proc.pid(), error = %e, "Failed to stop worker");
                    }
                    break;
                }
                SlotExit::Shutdown => break,
                SlotExit::Retired => {
                    debug!(pid = proc.pid(), "Worker retired");
                    startup_failures = 0;
                    if self.queue_drained().await {
                        debug!("Queue drained, not replacing retired worker");
                        break;
                    }
                }
                SlotExit::Crashed { was_ready: true } => startup_failures = 0,
                SlotExit::Crashed { was_ready: false } => {
                    startup_failures += 1;
                    if startup_failures >= MAX_STARTUP_FAILURES {
                        self.shared.fail(format!(
                            "worker in slot {} exited {} times before becoming ready",
                            self.slot, startup_failures
                        ));
                        break;
                    }
                    tokio::time::sleep(RESPAWN_BACKOFF).await;
                }
            }

            if *self.shutdown.borrow() {
                break;
            }
            match spawn_worker(&self.config.worker, self.config.max_tasks_per_worker) {
                Ok(replacement) => {
                    self.shared.worker_restarts.fetch_add(1, Ordering::Relaxed);
                    let pid = replacement.pid();
                    self.shared.update_worker(self.slot, |info| {
                        info.pid = Some(pid);
                        info.state = WorkerState::Starting;
                        info.tasks_completed = 0;
                        info.restarts += 1;
                    });
                    debug!(old_pid = proc.pid(), new_pid = pid, "Replaced worker");
                    proc = replacement;
                }
                Err(e) => {
                    self.shared
                        .fail(format!("cannot replace worker in slot {}: {}", self.slot, e));
                    break;
                }
            }
        }
        self.set_state(WorkerState::Exited);
        trace!("Slot supervisor finished");
    }

    /// Feed one worker until it retires, dies, or the slot stops.
    async fn drive(&mut self, proc: &mut Proc) -> SlotExit {
        let mut ready = false;
        let mut was_ready = false;
        let mut in_flight: Option<TaskId> = None;

        loop {
            let idle = ready && in_flight.is_none();
            let event = if idle {
                tokio::select! {
                    biased;
                    _ = stopped(&mut self.shutdown) => Event::Shutdown,
                    message = proc.recv() => Event::Message(message),
                    unit = next_unit(&self.inbound) => Event::Work(unit),
                }
            } else {
                tokio::select! {
                    biased;
                    _ = stopped(&mut self.shutdown) => Event::Shutdown,
                    message = proc.recv() => Event::Message(message),
                }
            };

            match event {
                Event::Shutdown => {
                    let _ = proc.kill().await;
                    if let Some(task_id) = in_flight {
                        self.deliver(task_id, Err(self.shared.closed_error()));
                    }
                    return SlotExit::Shutdown;
                }
                Event::Work(None) => return SlotExit::Drained,
                Event::Work(Some(unit)) => {
                    let task_id = unit.task_id;
                    trace!(task_id, pid = proc.pid(), "Dispatching unit");
                    in_flight = Some(task_id);
                    ready = false;
                    self.set_state(WorkerState::Busy);
                    if let Err(e) = proc.send(&ParentMessage::Work(unit)).await {
                        warn!(pid = proc.pid(), error = %e, "Failed to send work to worker");
                        self.crashed(proc, in_flight).await;
                        return SlotExit::Crashed { was_ready };
                    }
                }
                Event::Message(Ok(Some(WorkerMessage::Ready))) => {
                    ready = true;
                    was_ready = true;
                    self.set_state(WorkerState::Idle);
                }
                Event::Message(Ok(Some(WorkerMessage::Result(envelope)))) => {
                    if in_flight == Some(envelope.task_id) {
                        in_flight = None;
                    } else {
                        warn!(
                            task_id = envelope.task_id,
                            expected = ?in_flight,
                            "Worker returned a result for a unit it was not given"
                        );
                    }
                    self.shared
                        .update_worker(self.slot, |info| info.tasks_completed += 1);
                    self.deliver(envelope.task_id, envelope.outcome.into_result());
                }
                Event::Message(Ok(Some(WorkerMessage::Retiring { tasks_completed }))) => {
                    debug!(pid = proc.pid(), tasks_completed, "Worker retiring");
                    self.set_state(WorkerState::Retiring);
                    if let Some(task_id) = in_flight {
                        // A retiring worker must have answered everything it was given.
                        error!(task_id, "Worker retired with a unit in flight");
                        self.crashed(proc, in_flight).await;
                        return SlotExit::Crashed { was_ready };
                    }
                    self.reap(proc).await;
                    return SlotExit::Retired;
                }
                Event::Message(Ok(None)) => {
                    self.crashed(proc, in_flight).await;
                    return SlotExit::Crashed { was_ready };
                }
                Event::Message(Err(e)) => {
                    error!(pid = proc.pid(), error = %e, "Worker protocol failure");
                    let _ = proc.kill().await;
                    self.crashed(proc, in_flight).await;
                    return SlotExit::Crashed { was_ready };
                }
            }
        }
    }

    /// Whether a closing pool has nothing left for this slot to run.
    async fn queue_drained(&self) -> bool {
        // The inbound sender is dropped right after the state changes, so
        // slots holding the queue lock release it promptly.
        self.shared.state() == PoolState::Closing && self.inbound.lock().await.is_drained()
    }

    /// Wait for a worker that said it is leaving.
    async fn reap(&self, proc: &mut Proc) {
        match tokio::time::timeout(self.config.join_timeout, proc.wait()).await {
            Ok(Ok(status)) if status.success() => {}
            Ok(Ok(status)) => {
                warn!(pid = proc.pid(), reason = %analyze_exit_status(status), "Retired worker exited abnormally");
            }
            Ok(Err(e)) => warn!(pid = proc.pid(), error = %e, "Failed to reap worker"),
            Err(_) => {
                warn!(pid = proc.pid(), "Retired worker did not exit, killing");
                let _ = proc.kill().await;
            }
        }
    }

    /// Reap a dead worker and fail the unit it was running.
    async fn crashed(&self, proc: &mut Proc, in_flight: Option<TaskId>) {
        let reason = match tokio::time::timeout(REAP_TIMEOUT, proc.wait()).await {
            Ok(Ok(status)) => analyze_exit_status(status),
            _ => proc
                .kill()
                .await
                .map(analyze_exit_status)
                .unwrap_or(TerminationReason::Unknown),
        };
        warn!(pid = proc.pid(), reason = %reason, task_id = ?in_flight, "Worker died");
        if let Some(task_id) = in_flight {
            self.deliver(
                task_id,
                Err(PoolError::WorkerCrashed {
                    pid: proc.pid(),
                    reason,
                }),
            );
        }
    }

    fn deliver(&self, task_id: TaskId, result: Result<Value>) {
        if self.outbound.send(Delivery { task_id, result }).is_err() {
            error!(task_id, "Gather loop is gone, dropping result");
        }
    }

    fn set_state(&self, state: WorkerState) {
        self.shared.update_worker(self.slot, |info| info.state = state);
    }
}

async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    // Errors only if the sender is gone, which also means stop.
    let _ = shutdown.wait_for(|stop| *stop).await;
}

async fn next_unit(inbound: &SharedInbound) -> Option<UnitOfWork> {
    inbound.lock().await.recv().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    /// A stand-in worker: announces ready, reads one line, then exits with 3.
    fn crashing_worker() -> WorkerCommand {
        WorkerCommand::new("sh")
            .arg("-c")
            .arg("printf '{\"type\":\"ready\"}\\n'; read line; exit 3")
    }

    /// A stand-in worker that never announces ready.
    fn silent_worker() -> WorkerCommand {
        WorkerCommand::new("sh").arg("-c").arg("exec sleep 30")
    }

    /// A stand-in worker that exits before announcing ready.
    fn stillborn_worker() -> WorkerCommand {
        WorkerCommand::new("sh").arg("-c").arg("exit 1")
    }

    fn vars(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_pool_config_default() {
        let config = PoolConfig::default();
        assert!(config.process_count > 0);
        assert_eq!(config.max_tasks_per_worker, None);
        assert_eq!(config.queue_capacity, 0);
        assert_eq!(config.close_mode, CloseMode::Drain);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_processes() {
        let config = PoolConfig::default().with_processes(0);
        assert!(matches!(config.validate(), Err(PoolError::InvalidConfig(_))));
    }

    #[test]
    fn test_validate_rejects_zero_budget() {
        let config = PoolConfig::default().with_max_tasks(Some(0));
        assert!(matches!(config.validate(), Err(PoolError::InvalidConfig(_))));
    }

    #[test]
    fn test_env_overrides() {
        let config = PoolConfig::default().with_overrides_from(vars(&[
            ("PROCPOOL_PROCESSES", "3"),
            ("PROCPOOL_MAX_TASKS", "10"),
            ("PROCPOOL_QUEUE_CAPACITY", "64"),
            ("PROCPOOL_CLOSE_MODE", "Terminate"),
        ]));
        assert_eq!(config.process_count, 3);
        assert_eq!(config.max_tasks_per_worker, Some(10));
        assert_eq!(config.queue_capacity, 64);
        assert_eq!(config.close_mode, CloseMode::Terminate);
    }

    #[test]
    fn test_env_overrides_ignore_garbage() {
        let config = PoolConfig::default()
            .with_processes(2)
            .with_max_tasks(Some(5))
            .with_overrides_from(vars(&[
                ("PROCPOOL_PROCESSES", "many"),
                ("PROCPOOL_CLOSE_MODE", "explode"),
            ]));
        assert_eq!(config.process_count, 2);
        assert_eq!(config.max_tasks_per_worker, Some(5));
        assert_eq!(config.close_mode, CloseMode::Drain);
    }

    #[test]
    fn test_env_override_unlimited_budget() {
        let config = PoolConfig::default()
            .with_max_tasks(Some(5))
            .with_overrides_from(vars(&[("PROCPOOL_MAX_TASKS", "none")]));
        assert_eq!(config.max_tasks_per_worker, None);
    }

    #[test]
    fn test_close_mode_from_str() {
        assert_eq!("drain".parse::<CloseMode>().unwrap(), CloseMode::Drain);
        assert_eq!("TERMINATE".parse::<CloseMode>().unwrap(), CloseMode::Terminate);
        assert_eq!("kill".parse::<CloseMode>().unwrap(), CloseMode::Terminate);
        assert!("later".parse::<CloseMode>().is_err());
        assert_eq!(CloseMode::Terminate.to_string(), "terminate");
    }

    #[tokio::test]
    async fn test_new_rejects_invalid_config() {
        let config = PoolConfig::new(crashing_worker()).with_processes(0);
        assert!(matches!(
            Pool::new(config).await,
            Err(PoolError::InvalidConfig(_))
        ));
    }

    #[tokio::test]
    async fn test_new_surfaces_spawn_failure() {
        let config = PoolConfig::new(WorkerCommand::new("/nonexistent/procpool-worker"))
            .with_processes(2);
        assert!(matches!(Pool::new(config).await, Err(PoolError::Spawn(_))));
    }

    #[tokio::test]
    async fn test_crashed_worker_fails_its_task_and_is_replaced() {
        let config = PoolConfig::new(crashing_worker())
            .with_processes(1)
            .with_join_timeout(Duration::from_secs(2));
        let pool = Pool::new(config).await.unwrap();
        assert_eq!(pool.state(), PoolState::Running);

        let result = pool.apply("anything", ()).await;
        match result {
            Err(PoolError::WorkerCrashed { reason, .. }) => {
                assert_eq!(reason, TerminationReason::Exited(3));
            }
            other => panic!("expected WorkerCrashed, got {:?}", other),
        }

        pool.close().await.unwrap();
        assert_eq!(pool.state(), PoolState::Closed);
        assert!(pool.stats().worker_restarts >= 1);
        assert_eq!(pool.processes().len(), 1);
        assert_eq!(pool.processes()[0].state, WorkerState::Exited);
    }

    #[tokio::test]
    async fn test_workers_that_never_start_fail_the_pool() {
        let config = PoolConfig::new(stillborn_worker()).with_processes(2);
        let pool = Pool::new(config).await.unwrap();

        let result = tokio::time::timeout(Duration::from_secs(5), pool.apply("double", (1,)))
            .await
            .expect("caller was never answered");
        assert!(matches!(result, Err(PoolError::PoolFailed(_))));
        assert_eq!(pool.state(), PoolState::Failed);
        assert_eq!(pool.stats().pending, 0);

        let closed = tokio::time::timeout(Duration::from_secs(5), pool.close())
            .await
            .expect("close did not return");
        assert!(matches!(closed, Err(PoolError::PoolFailed(_))));
        assert_eq!(pool.state(), PoolState::Failed);
        assert!(matches!(
            pool.apply("double", (1,)).await,
            Err(PoolError::PoolFailed(_))
        ));
        // Each slot gives up after a bounded number of attempts.
        assert!(pool.stats().worker_restarts <= 2 * u64::from(MAX_STARTUP_FAILURES));
    }

    #[tokio::test]
    async fn test_submit_after_close_fails() {
        let config = PoolConfig::new(crashing_worker()).with_processes(1);
        let pool = Pool::new(config).await.unwrap();
        pool.close().await.unwrap();
        // Second close is a no-op.
        pool.close().await.unwrap();

        let err = pool.submit(Call::new("double")).await.unwrap_err();
        assert!(matches!(err, PoolError::PoolClosed));
        assert!(matches!(
            pool.apply("double", (1,)).await,
            Err(PoolError::PoolClosed)
        ));
    }

    #[tokio::test]
    async fn test_terminate_fails_queued_work() {
        // Nothing is ever dispatched to a worker that is not ready.
        let config = PoolConfig::new(silent_worker())
            .with_processes(1)
            .with_close_mode(CloseMode::Terminate);
        let pool = Pool::new(config).await.unwrap();

        let handle = pool.submit(Call::new("double").arg(1).unwrap()).await.unwrap();
        assert_eq!(pool.stats().pending, 1);

        pool.close().await.unwrap();
        assert!(matches!(handle.await, Err(PoolError::PoolClosed)));
        assert_eq!(pool.stats().pending, 0);
    }

    #[tokio::test]
    async fn test_dropped_handle_is_abandoned() {
        let config = PoolConfig::new(silent_worker())
            .with_processes(1)
            .with_close_mode(CloseMode::Terminate);
        let pool = Pool::new(config).await.unwrap();

        let handle = pool.submit(Call::new("double").arg(1).unwrap()).await.unwrap();
        assert_eq!(handle.id(), 1);
        drop(handle);
        assert_eq!(pool.stats().pending, 0);
        assert_eq!(pool.stats().tasks_submitted, 1);

        pool.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_scoped_closes_pool() {
        let config = PoolConfig::new(silent_worker())
            .with_processes(1)
            .with_close_mode(CloseMode::Terminate);
        let mut kept = None;
        let value = Pool::scoped(config, |pool| {
            kept = Some(pool.clone());
            async move { Ok::<_, PoolError>(json!(pool.process_count())) }
        })
        .await
        .unwrap();

        assert_eq!(value, json!(1));
        assert_eq!(kept.map(|p| p.state()), Some(PoolState::Closed));
    }

    #[tokio::test]
    async fn test_gather_discards_unknown_ids() {
        let (shutdown, _) = watch::channel(false);
        let shared = Shared {
            state: Mutex::new(PoolState::Running),
            pending: Mutex::new(HashMap::new()),
            workers: Mutex::new(Vec::new()),
            failure: Mutex::new(None),
            shutdown,
            next_id: AtomicU64::new(5),
            tasks_submitted: AtomicU64::new(0),
            tasks_completed: AtomicU64::new(0),
            worker_restarts: AtomicU64::new(0),
        };

        let (tx, rx) = oneshot::channel();
        lock(&shared.pending).insert(3, tx);

        // Abandoned and never-issued ids are no-ops.
        shared.resolve(Delivery {
            task_id: 2,
            result: Ok(json!(0)),
        });
        shared.resolve(Delivery {
            task_id: 99,
            result: Ok(json!(0)),
        });
        shared.resolve(Delivery {
            task_id: 3,
            result: Ok(json!(42)),
        });

        assert_eq!(rx.await.unwrap().unwrap(), json!(42));
        assert_eq!(shared.tasks_completed.load(Ordering::Relaxed), 1);
        assert!(lock(&shared.pending).is_empty());
    }
}
