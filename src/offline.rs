//! Connectivity tracking and the offline replay queue.

use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;

use crate::config::OfflineConfig;
use crate::error::RequestError;
use crate::request::{RequestDescriptor, ResponseEnvelope};
use crate::utils::now_ms;

/// A captured, re-invocable operation replayed when connectivity returns.
pub type ReplayFn =
    Arc<dyn Fn() -> BoxFuture<'static, Result<ResponseEnvelope, RequestError>> + Send + Sync>;

/// Online/offline signal shared between the host application and the client.
#[derive(Clone)]
pub struct Connectivity {
    tx: Arc<watch::Sender<bool>>,
}

impl Connectivity {
    pub fn new(online: bool) -> Self {
        let (tx, _) = watch::channel(online);
        Connectivity { tx: Arc::new(tx) }
    }

    pub fn set_online(&self, online: bool) {
        let previous = self.tx.send_replace(online);
        if previous != online {
            tracing::info!("Connectivity changed: online={}", online);
        }
    }

    pub fn is_online(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

impl Default for Connectivity {
    fn default() -> Self {
        Self::new(true)
    }
}

struct OfflineEntry {
    request_id: String,
    replay: ReplayFn,
    enqueued_at_ms: i64,
    replay_attempts: u32,
    responder: oneshot::Sender<Result<ResponseEnvelope, RequestError>>,
}

struct Inner {
    config: OfflineConfig,
    connectivity: Connectivity,
    entries: Mutex<VecDeque<OfflineEntry>>,
    syncing: AtomicBool,
}

struct SyncGuard<'a>(&'a AtomicBool);

impl Drop for SyncGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Holds operations submitted while offline and replays them FIFO.
///
/// The caller that parked an operation is the one whose future settles when
/// it is replayed.
#[derive(Clone)]
pub struct OfflineQueue {
    inner: Arc<Inner>,
}

impl OfflineQueue {
    pub fn new(config: OfflineConfig, connectivity: Connectivity) -> Self {
        OfflineQueue {
            inner: Arc::new(Inner {
                config,
                connectivity,
                entries: Mutex::new(VecDeque::new()),
                syncing: AtomicBool::new(false),
            }),
        }
    }

    pub fn is_online(&self) -> bool {
        self.inner.connectivity.is_online()
    }

    pub fn connectivity(&self) -> &Connectivity {
        &self.inner.connectivity
    }

    pub fn len(&self) -> usize {
        self.inner.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.entries.lock().is_empty()
    }

    /// Park `replay` until the next sync and wait for its outcome.
    ///
    /// Fails immediately with [`RequestError::OfflineQueueFull`] when
    /// `queue_size` entries are already parked.
    pub async fn enqueue(
        &self,
        descriptor: &RequestDescriptor,
        replay: ReplayFn,
    ) -> Result<ResponseEnvelope, RequestError> {
        let rx = {
            let mut entries = self.inner.entries.lock();
            // Callers that gave up no longer hold a place
            entries.retain(|e| !e.responder.is_closed());

            let capacity = self.inner.config.queue_size;
            if entries.len() >= capacity {
                tracing::warn!(
                    "Offline queue full: id={}, capacity={}",
                    descriptor.id,
                    capacity
                );
                return Err(RequestError::OfflineQueueFull { capacity });
            }

            let (tx, rx) = oneshot::channel();
            entries.push_back(OfflineEntry {
                request_id: descriptor.id.clone(),
                replay,
                enqueued_at_ms: now_ms(),
                replay_attempts: 0,
                responder: tx,
            });
            tracing::debug!(
                "Parked offline request: id={}, queued={}",
                descriptor.id,
                entries.len()
            );
            rx
        };

        // Connectivity may have come back after the caller checked it, with
        // the reconnect sync already done
        if self.is_online() {
            let queue = self.clone();
            tokio::spawn(async move {
                queue.sync().await;
            });
        }

        rx.await.unwrap_or(Err(RequestError::Cancelled))
    }

    /// Replay parked entries in FIFO order. Returns how many callers were settled.
    ///
    /// A failed replay goes to the back of the queue until it has failed
    /// `max_replay_attempts` times, after which its caller receives the last
    /// error. Replay stops early if connectivity drops again. Concurrent calls
    /// while a sync is running return 0.
    pub async fn sync(&self) -> usize {
        let mut settled = 0;
        loop {
            if self.inner.syncing.swap(true, Ordering::AcqRel) {
                return settled;
            }
            {
                let _guard = SyncGuard(&self.inner.syncing);
                settled += self.drain().await;
            }

            // Entries pushed between the last pop and the flag reset
            if !self.is_online() || self.is_empty() {
                return settled;
            }
        }
    }

    async fn drain(&self) -> usize {
        let mut settled = 0;
        while self.is_online() {
            let Some(mut entry) = self.inner.entries.lock().pop_front() else {
                break;
            };
            if entry.responder.is_closed() {
                continue;
            }

            match (entry.replay)().await {
                Ok(response) => {
                    tracing::debug!(
                        "Replayed offline request: id={}, waited_ms={}",
                        entry.request_id,
                        now_ms() - entry.enqueued_at_ms
                    );
                    let _ = entry.responder.send(Ok(response));
                    settled += 1;
                }
                Err(e) => {
                    entry.replay_attempts += 1;
                    if entry.replay_attempts < self.inner.config.max_replay_attempts
                        && !e.is_cancellation()
                    {
                        tracing::warn!(
                            "Offline replay failed, requeueing: id={}, replay_attempts={}, error={}",
                            entry.request_id,
                            entry.replay_attempts,
                            e
                        );
                        self.inner.entries.lock().push_back(entry);
                    } else {
                        tracing::warn!(
                            "Offline replay gave up: id={}, replay_attempts={}, error={}",
                            entry.request_id,
                            entry.replay_attempts,
                            e
                        );
                        let _ = entry.responder.send(Err(e));
                        settled += 1;
                    }
                }
            }
        }
        settled
    }

    /// Spawn a task that syncs on every offline to online transition.
    ///
    /// The task ends once the queue or its connectivity signal is dropped.
    pub fn spawn_listener(&self) -> JoinHandle<()> {
        let queue: Weak<Inner> = Arc::downgrade(&self.inner);
        let mut rx = self.inner.connectivity.subscribe();
        let mut was_online = *rx.borrow_and_update();

        tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let online = *rx.borrow_and_update();
                if online && !was_online {
                    let Some(inner) = queue.upgrade() else {
                        break;
                    };
                    let settled = OfflineQueue { inner }.sync().await;
                    tracing::debug!("Reconnect sync finished: settled={}", settled);
                }
                was_online = online;
            }
        })
    }
}
