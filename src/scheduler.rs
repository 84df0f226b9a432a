//! Priority admission control.
//!
//! At most `max_concurrent` permits are out at once. Waiters are ordered by
//! priority, then arrival. Strict priority means low-priority work can starve
//! under sustained high-priority load.

use parking_lot::Mutex;
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::oneshot;

use crate::error::RequestError;
use crate::request::{Priority, RequestDescriptor, ResponseEnvelope};
use crate::utils::now_ms;

struct Waiter {
    priority: Priority,
    seq: u64,
    request_id: String,
    enqueued_at_ms: i64,
    tx: oneshot::Sender<SchedulerPermit>,
}

impl PartialEq for Waiter {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Waiter {}

impl PartialOrd for Waiter {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Waiter {
    // Max-heap: higher priority first, then lower sequence number
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct State {
    running: usize,
    queue: BinaryHeap<Waiter>,
    next_seq: u64,
}

struct Shared {
    max_concurrent: usize,
    max_queue_size: usize,
    state: Mutex<State>,
}

impl Shared {
    /// Hand free slots to the best waiters. Called with the state lock held.
    fn dispatch(self: &Arc<Self>, state: &mut State) {
        while state.running < self.max_concurrent {
            let Some(waiter) = state.queue.pop() else {
                break;
            };

            state.running += 1;
            let permit = SchedulerPermit {
                shared: Some(Arc::clone(self)),
            };
            match waiter.tx.send(permit) {
                Ok(()) => tracing::debug!(
                    "Dispatched queued request: id={}, priority={:?}, waited_ms={}",
                    waiter.request_id,
                    waiter.priority,
                    now_ms() - waiter.enqueued_at_ms
                ),
                Err(mut permit) => {
                    // Waiter went away; the slot was never handed out
                    permit.shared = None;
                    state.running -= 1;
                }
            }
        }
    }
}

/// A running slot. Dropping it frees the slot for the next waiter.
pub struct SchedulerPermit {
    shared: Option<Arc<Shared>>,
}

impl Drop for SchedulerPermit {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.take() {
            let mut state = shared.state.lock();
            state.running = state.running.saturating_sub(1);
            shared.dispatch(&mut state);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SchedulerStats {
    pub running: usize,
    pub pending: usize,
}

#[derive(Clone)]
pub struct Scheduler {
    shared: Arc<Shared>,
}

impl Scheduler {
    pub fn new(max_concurrent: usize, max_queue_size: usize) -> Self {
        Scheduler {
            shared: Arc::new(Shared {
                max_concurrent: max_concurrent.max(1),
                max_queue_size,
                state: Mutex::new(State {
                    running: 0,
                    queue: BinaryHeap::new(),
                    next_seq: 0,
                }),
            }),
        }
    }

    pub fn stats(&self) -> SchedulerStats {
        let state = self.shared.state.lock();
        SchedulerStats {
            running: state.running,
            pending: state.queue.iter().filter(|w| !w.tx.is_closed()).count(),
        }
    }

    /// Wait for a running slot.
    ///
    /// Fails immediately with [`RequestError::QueueFull`] when
    /// `max_queue_size` requests are already waiting. Dropping the returned
    /// future gives up the place in the queue.
    pub async fn acquire(
        &self,
        descriptor: &RequestDescriptor,
    ) -> Result<SchedulerPermit, RequestError> {
        let rx = {
            let mut state = self.shared.state.lock();
            state.queue.retain(|w| !w.tx.is_closed());

            if state.running < self.shared.max_concurrent && state.queue.is_empty() {
                state.running += 1;
                return Ok(SchedulerPermit {
                    shared: Some(Arc::clone(&self.shared)),
                });
            }

            let capacity = self.shared.max_queue_size;
            if state.queue.len() >= capacity {
                tracing::warn!(
                    "Request queue full: id={}, capacity={}",
                    descriptor.id,
                    capacity
                );
                return Err(RequestError::QueueFull { capacity });
            }

            let (tx, rx) = oneshot::channel();
            let seq = state.next_seq;
            state.next_seq += 1;
            state.queue.push(Waiter {
                priority: descriptor.priority,
                seq,
                request_id: descriptor.id.clone(),
                enqueued_at_ms: now_ms(),
                tx,
            });
            tracing::debug!(
                "Queued request: id={}, priority={:?}, running={}, pending={}",
                descriptor.id,
                descriptor.priority,
                state.running,
                state.queue.len()
            );
            rx
        };

        rx.await.map_err(|_| RequestError::Cancelled)
    }

    /// Run `executor` once a slot is free.
    pub async fn enqueue<F, Fut>(
        &self,
        descriptor: &RequestDescriptor,
        executor: F,
    ) -> Result<ResponseEnvelope, RequestError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<ResponseEnvelope, RequestError>>,
    {
        let _permit = self.acquire(descriptor).await?;
        executor().await
    }
}
