//! Task dispatcher.
//!
//! Runs one scheduling loop per queue. Each pass takes eligible tasks in
//! eligibility order and starts an attempt only once it holds both a
//! concurrency permit and a rate token; a task that gets neither stays
//! pending and is not charged an attempt. Attempt outcomes flow to the retry
//! scheduler, to completion, or to the dead letter sink.
//!
//! ```text
//! Pending ─► Dispatching ─┬─► Succeeded
//!    ▲                    ├─► Retrying ─┐
//!    └────────────────────┼─────────────┘
//!                         └─► Failed (dead letter)
//! ```

use std::collections::{BTreeMap, HashMap};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use futures::FutureExt;
use relay_common::{DispatcherConfig, IdGenerator, Metrics, QueueMetrics};
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::dead_letter::{DeadLetterEntry, DeadLetterSink, FailureReason, MemoryDeadLetterQueue};
use crate::error::{QueueError, QueueResult};
use crate::gate::{ConcurrencyGate, Permit};
use crate::handler::{HandlerError, TaskContext, TaskHandler};
use crate::rate_limit::RateLimiter;
use crate::registry::{QueueDefinition, QueueRegistry};
use crate::retry::{RetryConfig, RetryDecision, RetryScheduler};
use crate::task::{Task, TaskId, TaskSnapshot, TaskState};

/// Shortest sleep between passes, so a nearly-full bucket cannot spin a loop.
const MIN_WAIT: Duration = Duration::from_millis(1);

/// Far-future stand-in for delays that overflow [`Instant`].
const NEVER: Duration = Duration::from_secs(100 * 365 * 86400);

/// Dispatcher tuning.
#[derive(Debug, Clone)]
pub struct DispatcherOptions {
    /// Default upper bound on one handler invocation.
    pub handler_timeout: Duration,
    /// Longest a queue loop sleeps between passes.
    pub poll_interval: Duration,
    /// How long shutdown waits for in-flight attempts before cancelling them.
    pub shutdown_grace: Duration,
    /// Run handlers inside `enqueue` instead of queueing.
    pub inline: bool,
    /// Capacity of the default in-memory dead letter queue.
    pub dead_letter_capacity: usize,
}

impl Default for DispatcherOptions {
    fn default() -> Self {
        Self::from(&DispatcherConfig::default())
    }
}

impl From<&DispatcherConfig> for DispatcherOptions {
    fn from(config: &DispatcherConfig) -> Self {
        Self {
            handler_timeout: config.handler_timeout(),
            poll_interval: config.poll_interval(),
            shutdown_grace: config.shutdown_grace(),
            inline: config.inline,
            dead_letter_capacity: config.dead_letter_capacity,
        }
    }
}

/// Pending tasks of one queue, ordered by eligibility then submission.
#[derive(Debug, Default)]
struct PendingSet {
    order: BTreeMap<(Instant, u64), Task>,
    index: HashMap<TaskId, (Instant, u64)>,
}

impl PendingSet {
    fn insert(&mut self, seq: u64, task: Task) {
        let key = (task.next_eligible, seq);
        self.index.insert(task.id.clone(), key);
        self.order.insert(key, task);
    }

    fn next_eligible(&self) -> Option<Instant> {
        self.order.first_key_value().map(|((at, _), _)| *at)
    }

    fn pop_eligible(&mut self, now: Instant) -> Option<Task> {
        let entry = self.order.first_entry()?;
        if !entry.get().is_eligible(now) {
            return None;
        }
        let task = entry.remove();
        self.index.remove(&task.id);
        Some(task)
    }

    fn remove(&mut self, id: &TaskId) -> Option<Task> {
        let key = self.index.remove(id)?;
        self.order.remove(&key)
    }

    fn get(&self, id: &TaskId) -> Option<&Task> {
        self.index.get(id).and_then(|key| self.order.get(key))
    }

    fn len(&self) -> usize {
        self.order.len()
    }
}

#[derive(Debug)]
struct InFlight {
    cancel: CancellationToken,
    snapshot: TaskSnapshot,
}

/// Runtime state of one queue.
struct QueueState {
    definition: Arc<QueueDefinition>,
    retry: RetryConfig,
    timeout: Duration,
    metrics: Arc<QueueMetrics>,
    pending: Mutex<PendingSet>,
    in_flight: Mutex<HashMap<TaskId, InFlight>>,
    wake: Notify,
}

impl QueueState {
    fn name(&self) -> &str {
        &self.definition.name
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct Inner {
    registry: Arc<QueueRegistry>,
    queues: HashMap<String, Arc<QueueState>>,
    limiter: RateLimiter,
    gate: ConcurrencyGate,
    retry: RetryScheduler,
    handler: Arc<dyn TaskHandler>,
    dead_letters: Arc<dyn DeadLetterSink>,
    metrics: Arc<Metrics>,
    options: DispatcherOptions,
    ids: IdGenerator,
    seq: AtomicU64,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

/// Builder for [`Dispatcher`].
pub struct DispatcherBuilder {
    registry: Arc<QueueRegistry>,
    handler: Arc<dyn TaskHandler>,
    dead_letters: Option<Arc<dyn DeadLetterSink>>,
    options: DispatcherOptions,
}

impl DispatcherBuilder {
    /// Send terminal failures to `sink` instead of an in-memory queue.
    #[must_use]
    pub fn dead_letters(mut self, sink: Arc<dyn DeadLetterSink>) -> Self {
        self.dead_letters = Some(sink);
        self
    }

    /// Set dispatcher options.
    #[must_use]
    pub fn options(mut self, options: DispatcherOptions) -> Self {
        self.options = options;
        self
    }

    /// Build the dispatcher. Call [`Dispatcher::run`] to start dispatching.
    #[must_use]
    pub fn build(self) -> Dispatcher {
        let Self {
            registry,
            handler,
            dead_letters,
            options,
        } = self;

        let metrics = Arc::new(Metrics::new(registry.names()));
        let queues = registry
            .iter()
            .map(|definition| {
                let state = QueueState {
                    definition: Arc::clone(definition),
                    retry: RetryConfig::from(&definition.retry_parameters),
                    timeout: definition.handler_timeout(options.handler_timeout),
                    metrics: metrics.queue(&definition.name).unwrap_or_default(),
                    pending: Mutex::new(PendingSet::default()),
                    in_flight: Mutex::new(HashMap::new()),
                    wake: Notify::new(),
                };
                (definition.name.clone(), Arc::new(state))
            })
            .collect();

        let dead_letters: Arc<dyn DeadLetterSink> = match dead_letters {
            Some(sink) => sink,
            None => Arc::new(MemoryDeadLetterQueue::new(options.dead_letter_capacity)),
        };

        Dispatcher {
            inner: Arc::new(Inner {
                limiter: RateLimiter::new(&registry),
                gate: ConcurrencyGate::new(&registry),
                registry,
                queues,
                retry: RetryScheduler,
                handler,
                dead_letters,
                metrics,
                options,
                ids: IdGenerator::new(),
                seq: AtomicU64::new(0),
                shutdown: CancellationToken::new(),
                tracker: TaskTracker::new(),
            }),
        }
    }
}

/// Reliable task dispatcher with per-queue rate, concurrency and retry control.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

impl Dispatcher {
    /// Start building a dispatcher over `registry` delivering through `handler`.
    pub fn builder(registry: Arc<QueueRegistry>, handler: Arc<dyn TaskHandler>) -> DispatcherBuilder {
        DispatcherBuilder {
            registry,
            handler,
            dead_letters: None,
            options: DispatcherOptions::default(),
        }
    }

    /// The queue registry.
    #[must_use]
    pub fn registry(&self) -> &Arc<QueueRegistry> {
        &self.inner.registry
    }

    /// Per-queue counters.
    #[must_use]
    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.inner.metrics
    }

    /// Submit a task that is eligible immediately.
    pub async fn enqueue(&self, queue: &str, payload: impl Into<Bytes>) -> QueueResult<TaskId> {
        self.enqueue_with_delay(queue, payload, Duration::ZERO).await
    }

    /// Submit a task that becomes eligible after `delay`.
    ///
    /// In inline mode the handler runs before this returns and its failure is
    /// returned as [`QueueError::Handler`].
    pub async fn enqueue_with_delay(
        &self,
        queue: &str,
        payload: impl Into<Bytes>,
        delay: Duration,
    ) -> QueueResult<TaskId> {
        let state = self.inner.state(queue)?;
        if self.inner.shutdown.is_cancelled() {
            return Err(QueueError::ShuttingDown);
        }

        let id = TaskId::new(self.inner.ids.generate());
        let eligible = Instant::now().checked_add(delay).unwrap_or_else(|| Instant::now() + NEVER);
        let task = Task::new(id.clone(), queue, payload.into(), eligible);
        state.metrics.record_enqueued();

        if self.inner.options.inline {
            info!(queue, task_id = %id, "Running task inline");
            self.inner.run_inline(&state, &task).await?;
            return Ok(id);
        }

        self.inner.push_pending(&state, task);
        state.wake.notify_one();
        info!(queue, task_id = %id, delay_secs = delay.as_secs_f64(), "Added task");
        Ok(id)
    }

    /// Cancel a live task.
    ///
    /// A pending task is dropped at once. A dispatching task has its
    /// attempt cancelled; its permit is released when the attempt unwinds.
    pub fn cancel(&self, id: &TaskId) -> QueueResult<()> {
        for state in self.inner.queues.values() {
            let mut pending = lock(&state.pending);
            if pending.remove(id).is_some() {
                state.metrics.record_cancelled();
                info!(queue = state.name(), task_id = %id, "Cancelled pending task");
                return Ok(());
            }
            if let Some(in_flight) = lock(&state.in_flight).get(id) {
                in_flight.cancel.cancel();
                info!(queue = state.name(), task_id = %id, "Cancelling dispatching task");
                return Ok(());
            }
        }
        Err(QueueError::TaskNotFound(id.to_string()))
    }

    /// State of a live task; `None` once it has completed, failed or been cancelled.
    #[must_use]
    pub fn status(&self, id: &TaskId) -> Option<TaskSnapshot> {
        let now = Instant::now();
        self.inner.queues.values().find_map(|state| {
            let pending = lock(&state.pending);
            if let Some(task) = pending.get(id) {
                return Some(TaskSnapshot::of(task, TaskState::Pending, now));
            }
            lock(&state.in_flight).get(id).map(|f| f.snapshot.clone())
        })
    }

    /// Number of pending tasks in `queue`.
    pub fn pending(&self, queue: &str) -> QueueResult<usize> {
        let state = self.inner.state(queue)?;
        let count = lock(&state.pending).len();
        Ok(count)
    }

    /// Number of attempts running in `queue`.
    pub fn in_flight(&self, queue: &str) -> QueueResult<usize> {
        self.inner.state(queue)?;
        Ok(self.inner.gate.in_flight(queue))
    }

    /// Rate tokens `queue` could spend right now.
    pub fn available_tokens(&self, queue: &str) -> QueueResult<u32> {
        self.inner
            .limiter
            .available(queue)
            .ok_or_else(|| QueueError::UnknownQueue(queue.to_string()))
    }

    /// Run every queue's loop until [`Dispatcher::shutdown`], then drain.
    pub async fn run(&self) {
        let handles: Vec<_> = self
            .inner
            .queues
            .values()
            .map(|state| tokio::spawn(Arc::clone(&self.inner).queue_loop(Arc::clone(state))))
            .collect();
        info!(queues = handles.len(), "Dispatcher started");

        for handle in handles {
            if let Err(e) = handle.await {
                error!(error = %e, "Queue worker terminated abnormally");
            }
        }

        self.inner.drain().await;
    }

    /// Stop accepting tasks and stop every queue loop.
    pub fn shutdown(&self) {
        info!("Dispatcher shutdown requested");
        self.inner.shutdown.cancel();
    }

    /// Whether [`Dispatcher::shutdown`] has been called.
    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }
}

impl Inner {
    fn state(&self, queue: &str) -> QueueResult<Arc<QueueState>> {
        self.queues
            .get(queue)
            .cloned()
            .ok_or_else(|| QueueError::UnknownQueue(queue.to_string()))
    }

    fn push_pending(&self, state: &QueueState, task: Task) {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        lock(&state.pending).insert(seq, task);
    }

    async fn queue_loop(self: Arc<Self>, state: Arc<QueueState>) {
        debug!(queue = state.name(), "Queue worker started");
        loop {
            let wait = self.dispatch_pass(&state);
            tokio::select! {
                () = self.shutdown.cancelled() => break,
                () = state.wake.notified() => {}
                () = tokio::time::sleep(wait) => {}
            }
        }
        debug!(queue = state.name(), "Queue worker stopped");
    }

    /// Start every attempt the queue can afford right now.
    ///
    /// Returns how long the loop may sleep before something could change.
    fn dispatch_pass(self: &Arc<Self>, state: &Arc<QueueState>) -> Duration {
        let poll = self.options.poll_interval;
        let name = state.name();

        loop {
            if self.shutdown.is_cancelled() {
                return poll;
            }

            let now = Instant::now();
            let mut pending = lock(&state.pending);
            let Some(next) = pending.next_eligible() else {
                return poll;
            };
            if next > now {
                return (next - now).clamp(MIN_WAIT, poll.max(MIN_WAIT));
            }

            let Ok(permit) = self.gate.try_enter(name) else {
                state.metrics.record_busy();
                return poll;
            };

            if !self.limiter.try_acquire(name) {
                self.gate.release(permit);
                state.metrics.record_rate_limited();
                let wait = self.limiter.time_until_available(name).unwrap_or(poll);
                return wait.clamp(MIN_WAIT, poll.max(MIN_WAIT));
            }

            let Some(task) = pending.pop_eligible(now) else {
                return MIN_WAIT;
            };
            self.start_attempt(state, task, permit);
        }
    }

    fn start_attempt(self: &Arc<Self>, state: &Arc<QueueState>, mut task: Task, permit: Permit) {
        let cancel = CancellationToken::new();
        let ctx = TaskContext {
            id: task.id.clone(),
            queue: task.queue.clone(),
            payload: task.payload.clone(),
            retry_count: task.attempts,
            execution_count: task.executions,
            cancel: cancel.clone(),
        };
        task.executions += 1;

        lock(&state.in_flight).insert(
            task.id.clone(),
            InFlight {
                cancel,
                snapshot: TaskSnapshot::of(&task, TaskState::Dispatching, Instant::now()),
            },
        );
        state.metrics.start_dispatch();
        debug!(
            queue = state.name(),
            task_id = %task.id,
            attempt = task.executions,
            "Dispatching task"
        );

        let inner = Arc::clone(self);
        let state = Arc::clone(state);
        self.tracker.spawn(async move {
            let result = inner.invoke(&state, &ctx).await;
            inner.gate.release(permit);
            state.metrics.end_dispatch();
            inner.finish_attempt(&state, task, result).await;
        });
    }

    /// One bounded, cancellable, panic-isolated handler call.
    async fn invoke(&self, state: &QueueState, ctx: &TaskContext) -> Result<(), HandlerError> {
        let call = AssertUnwindSafe(self.handler.deliver(&state.definition.target, ctx)).catch_unwind();

        tokio::select! {
            biased;
            () = ctx.cancel.cancelled() => Err(HandlerError::Cancelled),
            outcome = tokio::time::timeout(state.timeout, call) => match outcome {
                Err(_) => Err(HandlerError::Timeout(state.timeout)),
                Ok(Err(_)) => Err(HandlerError::Failed("handler panicked".to_string())),
                Ok(Ok(result)) => result,
            },
        }
    }

    async fn finish_attempt(&self, state: &QueueState, mut task: Task, result: Result<(), HandlerError>) {
        // A cancel that landed after the handler returned still wins over a retry
        let cancelled = lock(&state.in_flight)
            .remove(&task.id)
            .is_some_and(|in_flight| in_flight.cancel.is_cancelled());
        let result = match result {
            Err(_) if cancelled => Err(HandlerError::Cancelled),
            other => other,
        };
        let queue = state.name();

        match result {
            Ok(()) => {
                state.metrics.record_succeeded();
                info!(queue, task_id = %task.id, executions = task.executions, "Task succeeded");
            }
            Err(HandlerError::Cancelled) => {
                state.metrics.record_cancelled();
                info!(queue, task_id = %task.id, "Task cancelled while dispatching");
            }
            Err(e) if !e.is_retryable() => {
                task.attempts = task.attempts.saturating_add(1);
                self.dead_letter(state, &task, FailureReason::Rejected, &e).await;
            }
            Err(e) => {
                if matches!(e, HandlerError::Timeout(_)) {
                    state.metrics.record_timeout();
                }
                match self.retry.on_failure(&state.retry, &mut task) {
                    RetryDecision::Retry { delay, attempts } => {
                        state.metrics.record_retried();
                        warn!(
                            queue,
                            task_id = %task.id,
                            attempts,
                            delay_secs = delay.as_secs_f64(),
                            error = %e,
                            "Task failed, retrying"
                        );
                        let now = Instant::now();
                        task.next_eligible = now.checked_add(delay).unwrap_or(now + NEVER);
                        self.push_pending(state, task);
                    }
                    RetryDecision::Exhausted { .. } => {
                        self.dead_letter(state, &task, FailureReason::Exhausted, &e).await;
                    }
                }
            }
        }

        state.wake.notify_one();
    }

    async fn dead_letter(
        &self,
        state: &QueueState,
        task: &Task,
        reason: FailureReason,
        error: &HandlerError,
    ) {
        state.metrics.record_failed();
        error!(
            queue = state.name(),
            task_id = %task.id,
            attempts = task.attempts,
            reason = ?reason,
            error = %error,
            "Task permanently failed"
        );
        self.dead_letters
            .record(DeadLetterEntry::new(task, reason, error.to_string()))
            .await;
    }

    async fn run_inline(&self, state: &QueueState, task: &Task) -> QueueResult<()> {
        let ctx = TaskContext {
            id: task.id.clone(),
            queue: task.queue.clone(),
            payload: task.payload.clone(),
            retry_count: 0,
            execution_count: 0,
            cancel: self.shutdown.child_token(),
        };

        state.metrics.start_dispatch();
        let result = self.invoke(state, &ctx).await;
        state.metrics.end_dispatch();

        match result {
            Ok(()) => {
                state.metrics.record_succeeded();
                Ok(())
            }
            Err(e) => {
                state.metrics.record_failed();
                warn!(queue = state.name(), task_id = %task.id, error = %e, "Inline task failed");
                Err(e.into())
            }
        }
    }

    async fn drain(&self) {
        self.tracker.close();
        let grace = self.options.shutdown_grace;

        if tokio::time::timeout(grace, self.tracker.wait()).await.is_err() {
            warn!(grace_secs = grace.as_secs_f64(), "Grace period elapsed, cancelling in-flight tasks");
            for state in self.queues.values() {
                for in_flight in lock(&state.in_flight).values() {
                    in_flight.cancel.cancel();
                }
            }
            self.tracker.wait().await;
        }

        let left: usize = self.queues.values().map(|s| lock(&s.pending).len()).sum();
        if left > 0 {
            warn!(pending = left, "Dropping pending tasks on shutdown");
        }
        info!("Dispatcher stopped");
    }
}
