//! Task queue dispatcher for relay.
//!
//! This crate turns named, declaratively configured queues into reliable
//! background execution:
//!
//! - **Registry**: queue definitions loaded from `queue.yaml`
//! - **Rate limiting**: per-queue token buckets
//! - **Gate**: per-queue concurrency caps
//! - **Retry**: exponential backoff with a retry limit
//! - **Dispatcher**: scheduling loops, timeouts, cancellation and shutdown
//! - **Handlers**: HTTP callbacks to `/_ah/queue/{queue}`
//! - **Dead letters**: terminal failures, kept for inspection

pub mod dead_letter;
pub mod dispatcher;
pub mod error;
pub mod gate;
pub mod handler;
pub mod rate_limit;
pub mod registry;
pub mod retry;
pub mod task;

pub use dead_letter::{DeadLetterEntry, DeadLetterSink, FailureReason, MemoryDeadLetterQueue};
pub use dispatcher::{Dispatcher, DispatcherBuilder, DispatcherOptions};
pub use error::{QueueError, QueueResult};
pub use gate::{ConcurrencyGate, GateError, Permit};
pub use handler::{HandlerError, HttpTaskHandler, TaskContext, TaskHandler, headers};
pub use rate_limit::{RateLimiter, TokenBucket};
pub use registry::{QueueDefinition, QueueManifest, QueueRegistry, Rate, RateUnit, RetryParameters};
pub use retry::{RetryConfig, RetryDecision, RetryScheduler};
pub use task::{Task, TaskId, TaskSnapshot, TaskState};
