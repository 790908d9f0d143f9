//! Dispatcher integration tests.
//!
//! These run on a paused clock, so backoff schedules of several minutes
//! finish instantly and deterministically.

#![allow(clippy::unwrap_used)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use relay_queue::{
    DeadLetterSink, Dispatcher, DispatcherOptions, FailureReason, HandlerError,
    MemoryDeadLetterQueue, QueueError, QueueRegistry, TaskContext, TaskHandler, TaskId, TaskState,
};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep};

const QUEUE_YAML: &str = r"
queue:
- name: webmention
  target: router
  rate: 100/s
  max_concurrent_requests: 10
  retry_parameters:
    task_retry_limit: 2
    min_backoff_seconds: 300
    max_doublings: 2

- name: poll-feed
  target: router
  rate: 5/s
  max_concurrent_requests: 1
  retry_parameters:
    task_retry_limit: 0

- name: atproto-commit
  target: hub
  rate: 300/s
  max_concurrent_requests: 1

- name: slow
  target: router
  rate: 10/s
  handler_timeout_seconds: 5
  retry_parameters:
    task_retry_limit: 1
    min_backoff_seconds: 10

- name: trickle
  target: router
  rate: 1/s
  max_concurrent_requests: 10
";

/// What the mock handler does with one task.
#[derive(Debug, Clone, Copy)]
enum Behaviour {
    Succeed(Duration),
    Fail,
    /// Fails, with a cancel arriving before the dispatcher sees the result.
    FailThenCancel,
    Reject,
    Hang,
    Panic,
}

/// Observations made by the mock handler.
#[derive(Default)]
struct Probe {
    calls: AtomicUsize,
    running: AtomicUsize,
    max_running: AtomicUsize,
    started: Mutex<Vec<(String, Instant)>>,
    finished: Mutex<Vec<(String, Instant)>>,
}

impl Probe {
    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn max_running(&self) -> usize {
        self.max_running.load(Ordering::SeqCst)
    }

    fn starts(&self, queue: &str) -> Vec<Instant> {
        self.started
            .lock()
            .unwrap()
            .iter()
            .filter(|(q, _)| q == queue)
            .map(|(_, at)| *at)
            .collect()
    }

    fn finishes(&self, queue: &str) -> Vec<Instant> {
        self.finished
            .lock()
            .unwrap()
            .iter()
            .filter(|(q, _)| q == queue)
            .map(|(_, at)| *at)
            .collect()
    }
}

/// Decrements the running count however the handler future ends.
struct Running<'a>(&'a Probe);

impl Drop for Running<'_> {
    fn drop(&mut self) {
        self.0.running.fetch_sub(1, Ordering::SeqCst);
    }
}

struct MockHandler {
    probe: Arc<Probe>,
    behaviour: Box<dyn Fn(&TaskContext) -> Behaviour + Send + Sync>,
}

impl MockHandler {
    fn new(behaviour: impl Fn(&TaskContext) -> Behaviour + Send + Sync + 'static) -> (Arc<Self>, Arc<Probe>) {
        let probe = Arc::new(Probe::default());
        let handler = Arc::new(Self {
            probe: Arc::clone(&probe),
            behaviour: Box::new(behaviour),
        });
        (handler, probe)
    }
}

#[async_trait]
impl TaskHandler for MockHandler {
    async fn deliver(&self, _target: &str, task: &TaskContext) -> Result<(), HandlerError> {
        let probe = &self.probe;
        probe.calls.fetch_add(1, Ordering::SeqCst);
        let now_running = probe.running.fetch_add(1, Ordering::SeqCst) + 1;
        probe.max_running.fetch_max(now_running, Ordering::SeqCst);
        let _running = Running(probe);
        probe
            .started
            .lock()
            .unwrap()
            .push((task.queue.clone(), Instant::now()));

        let result = match (self.behaviour)(task) {
            Behaviour::Succeed(work) => {
                sleep(work).await;
                Ok(())
            }
            Behaviour::Fail => Err(HandlerError::Failed("503 Service Unavailable".into())),
            Behaviour::FailThenCancel => {
                task.cancel.cancel();
                Err(HandlerError::Failed("503 Service Unavailable".into()))
            }
            Behaviour::Reject => Err(HandlerError::Rejected("400 Bad Request".into())),
            Behaviour::Hang => {
                std::future::pending::<()>().await;
                Ok(())
            }
            Behaviour::Panic => panic!("handler blew up"),
        };

        probe
            .finished
            .lock()
            .unwrap()
            .push((task.queue.clone(), Instant::now()));
        result
    }
}

fn registry() -> Arc<QueueRegistry> {
    Arc::new(QueueRegistry::from_yaml_str(QUEUE_YAML).unwrap())
}

fn options() -> DispatcherOptions {
    DispatcherOptions {
        poll_interval: Duration::from_secs(60),
        ..DispatcherOptions::default()
    }
}

fn dispatcher(handler: Arc<MockHandler>) -> (Dispatcher, Arc<MemoryDeadLetterQueue>) {
    let dead_letters = Arc::new(MemoryDeadLetterQueue::new(100));
    let dispatcher = Dispatcher::builder(registry(), handler)
        .dead_letters(Arc::clone(&dead_letters) as Arc<dyn DeadLetterSink>)
        .options(options())
        .build();
    (dispatcher, dead_letters)
}

fn start(dispatcher: &Dispatcher) -> JoinHandle<()> {
    let dispatcher = dispatcher.clone();
    tokio::spawn(async move { dispatcher.run().await })
}

fn snapshot(dispatcher: &Dispatcher, queue: &str) -> relay_common::QueueMetricsSnapshot {
    dispatcher.metrics().queue(queue).unwrap().snapshot(queue)
}

#[tokio::test(start_paused = true)]
async fn test_poll_feed_dispatches_one_at_a_time() {
    let (handler, probe) = MockHandler::new(|_| Behaviour::Succeed(Duration::from_millis(200)));
    let (dispatcher, _) = dispatcher(handler);

    for i in 0..10 {
        dispatcher.enqueue("poll-feed", format!("feed={i}")).await.unwrap();
    }
    let _run = start(&dispatcher);

    sleep(Duration::from_millis(50)).await;
    assert_eq!(dispatcher.in_flight("poll-feed").unwrap(), 1);
    assert_eq!(dispatcher.pending("poll-feed").unwrap(), 9);

    sleep(Duration::from_secs(10)).await;
    assert_eq!(probe.calls(), 10);
    assert_eq!(probe.max_running(), 1);
    assert_eq!(dispatcher.pending("poll-feed").unwrap(), 0);

    let metrics = snapshot(&dispatcher, "poll-feed");
    assert_eq!(metrics.succeeded, 10);
    assert_eq!(metrics.in_flight, 0);
    assert!(metrics.busy > 0);
}

#[tokio::test(start_paused = true)]
async fn test_atproto_commit_never_overlaps() {
    let (handler, probe) = MockHandler::new(|_| Behaviour::Succeed(Duration::from_secs(1)));
    let (dispatcher, _) = dispatcher(handler);

    dispatcher.enqueue("atproto-commit", "seq=1").await.unwrap();
    dispatcher.enqueue("atproto-commit", "seq=2").await.unwrap();
    let _run = start(&dispatcher);

    sleep(Duration::from_secs(5)).await;
    assert_eq!(probe.calls(), 2);
    assert_eq!(probe.max_running(), 1);

    let starts = probe.starts("atproto-commit");
    let finishes = probe.finishes("atproto-commit");
    assert!(starts[1] >= finishes[0]);
}

#[tokio::test(start_paused = true)]
async fn test_webmention_retries_then_dead_letters() {
    let (handler, probe) = MockHandler::new(|_| Behaviour::Fail);
    let (dispatcher, dead_letters) = dispatcher(handler);

    let id = dispatcher
        .enqueue("webmention", "source=https://a.example&target=https://b.example")
        .await
        .unwrap();
    let _run = start(&dispatcher);

    sleep(Duration::from_secs(60)).await;
    let status = dispatcher.status(&id).unwrap();
    assert_eq!(status.state, TaskState::Pending);
    assert_eq!(status.attempts, 1);

    sleep(Duration::from_secs(1000)).await;
    assert_eq!(probe.calls(), 3);

    let starts = probe.starts("webmention");
    let first_gap = starts[1] - starts[0];
    let second_gap = starts[2] - starts[1];
    assert!(first_gap >= Duration::from_secs(300) && first_gap < Duration::from_secs(301));
    assert!(second_gap >= Duration::from_secs(600) && second_gap < Duration::from_secs(601));

    assert!(dispatcher.status(&id).is_none());
    let entries = dead_letters.entries().await;
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].task_id, id);
    assert_eq!(entries[0].attempts, 3);
    assert_eq!(entries[0].reason, FailureReason::Exhausted);

    let metrics = snapshot(&dispatcher, "webmention");
    assert_eq!(metrics.retried, 2);
    assert_eq!(metrics.failed, 1);
    assert_eq!(metrics.dispatched, 3);
}

#[tokio::test(start_paused = true)]
async fn test_rejected_task_is_not_retried() {
    let (handler, probe) = MockHandler::new(|_| Behaviour::Reject);
    let (dispatcher, dead_letters) = dispatcher(handler);

    dispatcher.enqueue("webmention", "source=x").await.unwrap();
    let _run = start(&dispatcher);

    sleep(Duration::from_secs(3600)).await;
    assert_eq!(probe.calls(), 1);

    let entries = dead_letters.entries().await;
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].reason, FailureReason::Rejected);
    assert_eq!(entries[0].attempts, 1);
    assert_eq!(snapshot(&dispatcher, "webmention").retried, 0);
}

#[tokio::test(start_paused = true)]
async fn test_unknown_queue_is_rejected() {
    let (handler, probe) = MockHandler::new(|_| Behaviour::Succeed(Duration::ZERO));
    let (dispatcher, _) = dispatcher(handler);

    let err = dispatcher.enqueue("send", "obj=1").await.unwrap_err();
    assert!(matches!(err, QueueError::UnknownQueue(name) if name == "send"));
    assert!(matches!(dispatcher.pending("send"), Err(QueueError::UnknownQueue(_))));
    assert_eq!(probe.calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_queues_are_isolated() {
    let (handler, probe) = MockHandler::new(|task| {
        if task.queue == "poll-feed" {
            Behaviour::Hang
        } else {
            Behaviour::Succeed(Duration::from_millis(10))
        }
    });
    let (dispatcher, _) = dispatcher(handler);

    for i in 0..3 {
        dispatcher.enqueue("poll-feed", format!("feed={i}")).await.unwrap();
        dispatcher.enqueue("atproto-commit", format!("seq={i}")).await.unwrap();
    }
    let _run = start(&dispatcher);

    sleep(Duration::from_secs(10)).await;
    assert_eq!(snapshot(&dispatcher, "atproto-commit").succeeded, 3);
    assert_eq!(dispatcher.in_flight("poll-feed").unwrap(), 1);
    assert_eq!(dispatcher.pending("poll-feed").unwrap(), 2);
    assert_eq!(probe.starts("poll-feed").len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_pending_and_dispatching() {
    let (handler, _probe) = MockHandler::new(|_| Behaviour::Hang);
    let (dispatcher, dead_letters) = dispatcher(handler);

    let first = dispatcher.enqueue("poll-feed", "feed=1").await.unwrap();
    let second = dispatcher.enqueue("poll-feed", "feed=2").await.unwrap();
    let _run = start(&dispatcher);
    sleep(Duration::from_millis(10)).await;

    assert_eq!(dispatcher.status(&first).unwrap().state, TaskState::Dispatching);
    assert_eq!(dispatcher.status(&second).unwrap().state, TaskState::Pending);

    dispatcher.cancel(&second).unwrap();
    assert_eq!(dispatcher.pending("poll-feed").unwrap(), 0);

    dispatcher.cancel(&first).unwrap();
    sleep(Duration::from_millis(10)).await;
    assert_eq!(dispatcher.in_flight("poll-feed").unwrap(), 0);
    assert!(dispatcher.status(&first).is_none());

    assert!(matches!(
        dispatcher.cancel(&first),
        Err(QueueError::TaskNotFound(_))
    ));
    assert!(matches!(
        dispatcher.cancel(&TaskId::new("missing")),
        Err(QueueError::TaskNotFound(_))
    ));

    assert_eq!(snapshot(&dispatcher, "poll-feed").cancelled, 2);
    assert!(dead_letters.is_empty().await);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_after_failure_is_not_retried() {
    let (handler, probe) = MockHandler::new(|_| Behaviour::FailThenCancel);
    let (dispatcher, dead_letters) = dispatcher(handler);

    let id = dispatcher.enqueue("webmention", "source=a").await.unwrap();
    let _run = start(&dispatcher);

    sleep(Duration::from_secs(3600)).await;
    assert_eq!(probe.calls(), 1);
    assert!(dispatcher.status(&id).is_none());
    assert_eq!(dispatcher.pending("webmention").unwrap(), 0);

    let metrics = snapshot(&dispatcher, "webmention");
    assert_eq!(metrics.cancelled, 1);
    assert_eq!(metrics.retried, 0);
    assert!(dead_letters.is_empty().await);
}

#[tokio::test(start_paused = true)]
async fn test_timeout_counts_as_failure() {
    let (handler, probe) = MockHandler::new(|_| Behaviour::Hang);
    let (dispatcher, dead_letters) = dispatcher(handler);

    dispatcher.enqueue("slow", "job=1").await.unwrap();
    let _run = start(&dispatcher);

    sleep(Duration::from_secs(100)).await;
    assert_eq!(probe.calls(), 2);
    assert_eq!(dispatcher.in_flight("slow").unwrap(), 0);

    let metrics = snapshot(&dispatcher, "slow");
    assert_eq!(metrics.timeouts, 2);
    assert_eq!(metrics.retried, 1);

    let entries = dead_letters.entries().await;
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].reason, FailureReason::Exhausted);
    assert!(entries[0].last_error.contains("timed out"));
}

#[tokio::test(start_paused = true)]
async fn test_panicking_handler_releases_permit() {
    let (handler, probe) = MockHandler::new(|task| {
        if task.payload.as_ref() == b"boom" {
            Behaviour::Panic
        } else {
            Behaviour::Succeed(Duration::ZERO)
        }
    });
    let (dispatcher, dead_letters) = dispatcher(handler);

    dispatcher.enqueue("poll-feed", "boom").await.unwrap();
    dispatcher.enqueue("poll-feed", "feed=ok").await.unwrap();
    let _run = start(&dispatcher);

    sleep(Duration::from_secs(5)).await;
    assert_eq!(probe.calls(), 2);
    assert_eq!(dispatcher.in_flight("poll-feed").unwrap(), 0);
    assert_eq!(snapshot(&dispatcher, "poll-feed").succeeded, 1);

    let entries = dead_letters.entries().await;
    assert_eq!(entries.len(), 1);
    assert!(entries[0].last_error.contains("panicked"));
}

#[tokio::test(start_paused = true)]
async fn test_delayed_task_waits() {
    let (handler, probe) = MockHandler::new(|_| Behaviour::Succeed(Duration::ZERO));
    let (dispatcher, _) = dispatcher(handler);

    let id = dispatcher
        .enqueue_with_delay("atproto-commit", "seq=1", Duration::from_secs(30))
        .await
        .unwrap();
    let _run = start(&dispatcher);

    sleep(Duration::from_secs(10)).await;
    assert_eq!(probe.calls(), 0);
    let status = dispatcher.status(&id).unwrap();
    assert_eq!(status.state, TaskState::Pending);
    assert_eq!(status.eligible_in_ms, 20_000);

    sleep(Duration::from_secs(25)).await;
    assert_eq!(probe.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_rate_limit_spaces_dispatches() {
    let (handler, probe) = MockHandler::new(|_| Behaviour::Succeed(Duration::ZERO));
    let (dispatcher, _) = dispatcher(handler);

    for i in 0..3 {
        dispatcher.enqueue("trickle", format!("n={i}")).await.unwrap();
    }
    let _run = start(&dispatcher);

    sleep(Duration::from_millis(500)).await;
    assert_eq!(probe.calls(), 1);
    sleep(Duration::from_secs(1)).await;
    assert_eq!(probe.calls(), 2);
    sleep(Duration::from_secs(1)).await;
    assert_eq!(probe.calls(), 3);

    assert!(snapshot(&dispatcher, "trickle").rate_limited > 0);
}

#[tokio::test(start_paused = true)]
async fn test_inline_mode_runs_on_enqueue() {
    let (handler, probe) = MockHandler::new(|task| {
        if task.payload.as_ref() == b"bad" {
            Behaviour::Fail
        } else {
            Behaviour::Succeed(Duration::from_millis(5))
        }
    });
    let dispatcher = Dispatcher::builder(registry(), handler)
        .options(DispatcherOptions {
            inline: true,
            ..options()
        })
        .build();

    dispatcher.enqueue("webmention", "good").await.unwrap();
    assert_eq!(probe.calls(), 1);
    assert_eq!(dispatcher.pending("webmention").unwrap(), 0);

    let err = dispatcher.enqueue("webmention", "bad").await.unwrap_err();
    assert!(matches!(err, QueueError::Handler(HandlerError::Failed(_))));
    assert_eq!(probe.calls(), 2);

    let metrics = snapshot(&dispatcher, "webmention");
    assert_eq!(metrics.succeeded, 1);
    assert_eq!(metrics.failed, 1);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_drains_in_flight() {
    let (handler, probe) = MockHandler::new(|_| Behaviour::Succeed(Duration::from_secs(2)));
    let (dispatcher, _) = dispatcher(handler);

    dispatcher.enqueue("poll-feed", "feed=1").await.unwrap();
    let run = start(&dispatcher);
    sleep(Duration::from_millis(10)).await;

    dispatcher.shutdown();
    assert!(dispatcher.is_shutting_down());
    assert!(matches!(
        dispatcher.enqueue("poll-feed", "feed=2").await,
        Err(QueueError::ShuttingDown)
    ));

    run.await.unwrap();
    assert_eq!(probe.calls(), 1);
    assert_eq!(snapshot(&dispatcher, "poll-feed").succeeded, 1);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_grace_cancels_stragglers() {
    let (handler, _probe) = MockHandler::new(|_| Behaviour::Hang);
    let dispatcher = Dispatcher::builder(registry(), handler)
        .options(DispatcherOptions {
            shutdown_grace: Duration::from_secs(5),
            ..options()
        })
        .build();

    dispatcher.enqueue("atproto-commit", "seq=1").await.unwrap();
    let run = start(&dispatcher);
    sleep(Duration::from_millis(10)).await;

    let begin = Instant::now();
    dispatcher.shutdown();
    run.await.unwrap();

    assert!(Instant::now() - begin >= Duration::from_secs(5));
    let metrics = snapshot(&dispatcher, "atproto-commit");
    assert_eq!(metrics.cancelled, 1);
    assert_eq!(metrics.in_flight, 0);
}
