//! Per-queue concurrency gate.
//!
//! Bounds in-flight tasks with one semaphore per queue. A [`Permit`] returns
//! its slot when dropped, so the slot comes back exactly once however the
//! guarded work ends: success, error, panic or cancellation.

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};

use crate::registry::QueueRegistry;

/// Why a permit was not handed out.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GateError {
    /// Every permit for the queue is taken.
    #[error("queue {0} is at its concurrency limit")]
    Busy(String),
    /// The queue is not registered.
    #[error("unknown queue: {0}")]
    UnknownQueue(String),
}

/// The right to run one task within a queue's cap.
#[derive(Debug)]
pub struct Permit {
    _permit: OwnedSemaphorePermit,
}

#[derive(Debug)]
struct Slot {
    semaphore: Arc<Semaphore>,
    limit: usize,
}

/// Concurrency gate keyed by queue name.
#[derive(Debug, Default)]
pub struct ConcurrencyGate {
    slots: HashMap<String, Slot>,
}

impl ConcurrencyGate {
    /// Create a gate sized by each queue's `max_concurrent_requests`.
    #[must_use]
    pub fn new(registry: &QueueRegistry) -> Self {
        let slots = registry
            .iter()
            .map(|queue| {
                let limit = queue.max_concurrent_requests as usize;
                let slot = Slot {
                    semaphore: Arc::new(Semaphore::new(limit)),
                    limit,
                };
                (queue.name.clone(), slot)
            })
            .collect();

        Self { slots }
    }

    fn slot(&self, queue: &str) -> Result<&Slot, GateError> {
        self.slots
            .get(queue)
            .ok_or_else(|| GateError::UnknownQueue(queue.to_string()))
    }

    /// Take a permit without waiting.
    pub fn try_enter(&self, queue: &str) -> Result<Permit, GateError> {
        let slot = self.slot(queue)?;
        match slot.semaphore.clone().try_acquire_owned() {
            Ok(permit) => Ok(Permit { _permit: permit }),
            Err(TryAcquireError::NoPermits | TryAcquireError::Closed) => {
                Err(GateError::Busy(queue.to_string()))
            }
        }
    }

    /// Give a permit back. Same as dropping it.
    pub fn release(&self, permit: Permit) {
        drop(permit);
    }

    /// Permits currently held for `queue`.
    #[must_use]
    pub fn in_flight(&self, queue: &str) -> usize {
        self.slot(queue)
            .map_or(0, |slot| slot.limit - slot.semaphore.available_permits())
    }
}
