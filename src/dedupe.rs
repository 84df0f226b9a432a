//! Collapsing of identical concurrent requests.

use futures::FutureExt;
use futures::future::{BoxFuture, Shared, WeakShared};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;

use crate::error::RequestError;
use crate::request::{RequestDescriptor, ResponseEnvelope};

type ResponseFuture = BoxFuture<'static, Result<ResponseEnvelope, RequestError>>;

struct InFlight {
    // Weak so that an operation every caller abandoned is dropped, not kept alive by the table
    future: WeakShared<ResponseFuture>,
    started_at: Instant,
    generation: u64,
}

/// Shares one in-flight operation between every caller with the same
/// [`RequestDescriptor::dedupe_signature`].
///
/// A registration is dropped as soon as its operation settles, or ignored
/// and replaced once it is older than `max_age` or no caller awaits it.
#[derive(Clone)]
pub struct Deduplicator {
    inflight: Arc<Mutex<HashMap<String, InFlight>>>,
    max_age: Duration,
    next_generation: Arc<AtomicU64>,
}

impl Deduplicator {
    pub fn new(max_age: Duration) -> Self {
        Deduplicator {
            inflight: Arc::new(Mutex::new(HashMap::new())),
            max_age,
            next_generation: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Number of registrations some caller is still awaiting.
    pub fn in_flight(&self) -> usize {
        self.inflight
            .lock()
            .values()
            .filter(|e| e.future.upgrade().is_some())
            .count()
    }

    /// Run `executor` unless an identical request is already in flight, in
    /// which case wait for and return its outcome.
    pub async fn dedupe<F, Fut>(
        &self,
        descriptor: &RequestDescriptor,
        executor: F,
    ) -> Result<ResponseEnvelope, RequestError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<ResponseEnvelope, RequestError>> + Send + 'static,
    {
        let signature = descriptor.dedupe_signature();

        let shared: Shared<ResponseFuture> = {
            let mut map = self.inflight.lock();
            let max_age = self.max_age;
            map.retain(|_, entry| {
                entry.started_at.elapsed() < max_age && entry.future.upgrade().is_some()
            });

            match map.get(&signature).and_then(|e| e.future.upgrade()) {
                Some(existing) => {
                    tracing::debug!(
                        "Joining in-flight request: id={}, signature={}",
                        descriptor.id,
                        signature
                    );
                    existing
                }
                None => {
                    let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
                    let inflight = Arc::clone(&self.inflight);
                    let key = signature.clone();
                    let operation = executor();

                    let future = async move {
                        let result = operation.await;
                        let mut map = inflight.lock();
                        if map.get(&key).is_some_and(|e| e.generation == generation) {
                            map.remove(&key);
                        }
                        result
                    }
                    .boxed()
                    .shared();

                    if let Some(weak) = future.downgrade() {
                        map.insert(
                            signature,
                            InFlight {
                                future: weak,
                                started_at: Instant::now(),
                                generation,
                            },
                        );
                    }
                    future
                }
            }
        };

        shared.await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::ResponseBody;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::Notify;

    fn ok(text: &str) -> ResponseEnvelope {
        ResponseEnvelope::new(200, "OK", ResponseBody::Text(text.into()))
    }

    #[tokio::test]
    async fn test_concurrent_identical_requests_share_one_call() {
        let dedupe = Deduplicator::new(Duration::from_millis(5_000));
        let calls = Arc::new(AtomicUsize::new(0));
        let gate = Arc::new(Notify::new());

        let mut handles = Vec::new();
        for _ in 0..5 {
            let dedupe = dedupe.clone();
            let calls = calls.clone();
            let gate = gate.clone();
            handles.push(tokio::spawn(async move {
                let req = RequestDescriptor::get("/notes");
                dedupe
                    .dedupe(&req, move || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        gate.notified().await;
                        Ok(ok("shared"))
                    })
                    .await
            }));
        }

        tokio::task::yield_now().await;
        while dedupe.in_flight() == 0 {
            tokio::task::yield_now().await;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        gate.notify_one();

        for handle in handles {
            let res = handle.await.unwrap().unwrap();
            assert_eq!(res.data, ResponseBody::Text("shared".into()));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(dedupe.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_errors_are_shared_and_registration_cleared() {
        let dedupe = Deduplicator::new(Duration::from_millis(5_000));
        let calls = Arc::new(AtomicUsize::new(0));
        let req = RequestDescriptor::get("/flaky");

        let make = |calls: Arc<AtomicUsize>| {
            move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::task::yield_now().await;
                Err::<ResponseEnvelope, _>(RequestError::http(502, "Bad Gateway"))
            }
        };

        let (a, b) = tokio::join!(
            dedupe.dedupe(&req, make(calls.clone())),
            dedupe.dedupe(&req, make(calls.clone()))
        );
        assert_eq!(a, b);
        assert_eq!(a.unwrap_err(), RequestError::http(502, "Bad Gateway"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(dedupe.in_flight(), 0);

        // Settled: the next call runs again
        let _ = dedupe.dedupe(&req, make(calls.clone())).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_different_signatures_do_not_collapse() {
        let dedupe = Deduplicator::new(Duration::from_millis(5_000));
        let calls = Arc::new(AtomicUsize::new(0));

        let run = |target: &'static str| {
            let calls = calls.clone();
            let dedupe = dedupe.clone();
            async move {
                dedupe
                    .dedupe(&RequestDescriptor::get(target), move || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::task::yield_now().await;
                        Ok(ok(target))
                    })
                    .await
            }
        };

        let (a, b) = tokio::join!(run("/a"), run("/b"));
        assert_eq!(a.unwrap().data, ResponseBody::Text("/a".into()));
        assert_eq!(b.unwrap().data, ResponseBody::Text("/b".into()));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_abandoned_operation_is_dropped() {
        let dedupe = Deduplicator::new(Duration::from_millis(5_000));
        let req = RequestDescriptor::get("/hang");

        let waiter = {
            let dedupe = dedupe.clone();
            let req = req.clone();
            tokio::spawn(async move {
                dedupe
                    .dedupe(&req, || async {
                        futures::future::pending::<()>().await;
                        Ok(ok("never"))
                    })
                    .await
            })
        };
        while dedupe.in_flight() == 0 {
            tokio::task::yield_now().await;
        }
        waiter.abort();
        let _ = waiter.await;

        // Nobody awaits the old operation any more, so a new caller starts fresh
        let res = dedupe
            .dedupe(&req, || async { Ok(ok("fresh")) })
            .await
            .unwrap();
        assert_eq!(res.data, ResponseBody::Text("fresh".into()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_registration_older_than_max_age_is_replaced() {
        let dedupe = Deduplicator::new(Duration::from_millis(100));
        let calls = Arc::new(AtomicUsize::new(0));
        let req = RequestDescriptor::get("/slow");

        let slow = {
            let dedupe = dedupe.clone();
            let calls = calls.clone();
            let req = req.clone();
            tokio::spawn(async move {
                dedupe
                    .dedupe(&req, move || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(1_000)).await;
                        Ok(ok("slow"))
                    })
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(200)).await;

        let calls2 = calls.clone();
        let fresh = dedupe
            .dedupe(&req, move || async move {
                calls2.fetch_add(1, Ordering::SeqCst);
                Ok(ok("fresh"))
            })
            .await
            .unwrap();

        assert_eq!(fresh.data, ResponseBody::Text("fresh".into()));
        assert_eq!(slow.await.unwrap().unwrap().data, ResponseBody::Text("slow".into()));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
