//! The request orchestrator.
//!
//! Every request runs through one fixed pipeline:
//!
//! ```text
//! dedupe -> cache strategy -> scheduler -> circuit breaker -> retry loop
//!        -> (offline: park until reconnect) -> interceptor -> transport
//! ```
//!
//! The cache strategy only participates for requests that carry
//! [`CacheOptions`](crate::CacheOptions); it decides whether the network part
//! of the pipeline runs at all and stores what it returns.
//!
//! A request parked offline gives its scheduler slot back, so the offline
//! queue rather than `max_concurrent` bounds how many requests can park.
//! Replay takes a slot again before calling the transport.

use futures::FutureExt;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use tokio::task::JoinHandle;

use crate::breaker::{BreakerRegistry, CircuitBreakerState};
use crate::builder::ClientBuilder;
use crate::cache::CacheManager;
use crate::cancel::{CancellationRegistry, RequestToken};
use crate::config::ClientConfig;
use crate::dedupe::Deduplicator;
use crate::error::{CacheError, ErrorInfo, RequestError};
use crate::offline::{Connectivity, OfflineQueue, ReplayFn};
use crate::request::{RequestDescriptor, ResponseEnvelope};
use crate::retry::RetryManager;
use crate::scheduler::{Scheduler, SchedulerPermit, SchedulerStats};
use crate::transport::{Interceptor, Transport, TransportRequest};

pub(crate) struct ClientInner {
    pub(crate) config: ClientConfig,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) interceptor: Option<Arc<dyn Interceptor>>,
    pub(crate) dedupe: Option<Deduplicator>,
    pub(crate) scheduler: Scheduler,
    pub(crate) breakers: BreakerRegistry,
    pub(crate) retry: RetryManager,
    pub(crate) offline: OfflineQueue,
    pub(crate) cache: CacheManager,
    pub(crate) cancellation: CancellationRegistry,
    pub(crate) listener: Option<JoinHandle<()>>,
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        if let Some(listener) = self.listener.take() {
            listener.abort();
        }
    }
}

/// Removes a request's token from the registry however the request ends.
struct TokenGuard<'a> {
    registry: &'a CancellationRegistry,
    id: &'a str,
}

impl Drop for TokenGuard<'_> {
    fn drop(&mut self) {
        self.registry.cleanup(self.id);
    }
}

/// The scheduler slot of one request. A request parked offline is not a
/// transport call in flight, so it hands its slot back until it sends again.
struct Admission<'a> {
    scheduler: &'a Scheduler,
    descriptor: &'a RequestDescriptor,
    permit: Mutex<Option<SchedulerPermit>>,
}

impl<'a> Admission<'a> {
    fn new(scheduler: &'a Scheduler, descriptor: &'a RequestDescriptor) -> Self {
        Admission {
            scheduler,
            descriptor,
            permit: Mutex::new(None),
        }
    }

    async fn hold(&self) -> Result<(), RequestError> {
        if self.permit.lock().is_some() {
            return Ok(());
        }
        let permit = self.scheduler.acquire(self.descriptor).await?;
        *self.permit.lock() = Some(permit);
        Ok(())
    }

    fn release(&self) {
        let permit = self.permit.lock().take();
        drop(permit);
    }
}

/// Cheaply cloneable handle to one orchestrator instance.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    pub fn builder(transport: Arc<dyn Transport>) -> ClientBuilder {
        ClientBuilder::new(transport)
    }

    pub(crate) fn from_inner(inner: ClientInner) -> Self {
        Client {
            inner: Arc::new(inner),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// Execute a request through the full pipeline.
    ///
    /// The request can be cancelled with [`Client::cancel`] using its id
    /// while this future is pending. When identical requests are collapsed,
    /// they all share the first caller's outcome; cancelling that first
    /// caller cancels the shared operation, while cancelling any other caller
    /// only detaches it.
    pub async fn execute(
        &self,
        descriptor: RequestDescriptor,
    ) -> Result<ResponseEnvelope, RequestError> {
        let descriptor = Arc::new(descriptor);
        let registry = &self.inner.cancellation;
        let token = registry.get_token(&descriptor.id);
        let _guard = TokenGuard {
            registry,
            id: &descriptor.id,
        };

        let run = {
            let client = self.clone();
            let descriptor = Arc::clone(&descriptor);
            let token = token.clone();
            move || async move { client.resolve(descriptor, token).await }
        };

        let outcome = match &self.inner.dedupe {
            Some(dedupe) => token.run(dedupe.dedupe(&descriptor, run)).await,
            None => token.run(run()).await,
        };

        if let Err(e) = &outcome {
            tracing::debug!(
                "Request failed: id={}, method={}, target={}, error={}",
                descriptor.id,
                descriptor.method,
                descriptor.target,
                e
            );
        }
        outcome
    }

    /// Shorthand for a plain GET.
    pub async fn get(&self, target: &str) -> Result<ResponseEnvelope, RequestError> {
        self.execute(RequestDescriptor::get(target)).await
    }

    /// Cache strategy boundary.
    async fn resolve(
        &self,
        descriptor: Arc<RequestDescriptor>,
        token: RequestToken,
    ) -> Result<ResponseEnvelope, RequestError> {
        let Some(options) = descriptor.cache.clone() else {
            return self.network(descriptor, token).await;
        };

        let key = descriptor.cache_key();
        let client = self.clone();
        self.inner
            .cache
            .fetch(&key, &options, move || async move {
                client.network(descriptor, token).await
            })
            .await
    }

    /// Scheduler, breaker and retry loop around single attempts.
    async fn network(
        &self,
        descriptor: Arc<RequestDescriptor>,
        token: RequestToken,
    ) -> Result<ResponseEnvelope, RequestError> {
        let admission = &Admission::new(&self.inner.scheduler, &descriptor);
        admission.hold().await?;

        let breaker = self.inner.breakers.breaker_for(descriptor.endpoint());
        let retry = self.inner.retry.for_request(descriptor.retry.as_ref());

        breaker
            .execute(|| {
                retry.execute(&descriptor, &token, |_attempt| {
                    self.attempt(Arc::clone(&descriptor), token.clone(), admission)
                })
            })
            .await
    }

    /// One attempt: straight to the transport when online, parked otherwise.
    async fn attempt(
        &self,
        descriptor: Arc<RequestDescriptor>,
        token: RequestToken,
        admission: &Admission<'_>,
    ) -> Result<ResponseEnvelope, RequestError> {
        if self.inner.offline.is_online() {
            admission.hold().await?;
            return send_once(&self.inner, &descriptor, &token).await;
        }
        admission.release();

        let weak: Weak<ClientInner> = Arc::downgrade(&self.inner);
        let parked = Arc::clone(&descriptor);
        let replay: ReplayFn = Arc::new(move || {
            let weak = weak.clone();
            let descriptor = Arc::clone(&parked);
            let token = token.clone();
            async move {
                let Some(inner) = weak.upgrade() else {
                    return Err(RequestError::Cancelled);
                };
                let _permit = inner.scheduler.acquire(&descriptor).await?;
                send_once(&inner, &descriptor, &token).await
            }
            .boxed()
        });

        self.inner.offline.enqueue(&descriptor, replay).await
    }

    /// Cancel a pending request by id. Returns false if no such request is live.
    pub fn cancel(&self, id: &str) -> bool {
        self.inner.cancellation.cancel(id)
    }

    /// Cancel every pending request. Returns how many were cancelled.
    pub fn cancel_all(&self) -> usize {
        self.inner.cancellation.cancel_all()
    }

    /// Replay parked offline requests now. Returns how many callers were settled.
    pub async fn sync(&self) -> usize {
        self.inner.offline.sync().await
    }

    pub fn connectivity(&self) -> &Connectivity {
        self.inner.offline.connectivity()
    }

    pub async fn invalidate_by_tags(&self, tags: &[String]) -> Result<Vec<String>, CacheError> {
        self.inner.cache.invalidate_by_tags(tags).await
    }

    pub async fn clear_cache(&self) -> Result<(), CacheError> {
        self.inner.cache.clear().await
    }

    /// State of the breaker guarding `endpoint`.
    pub fn breaker_state(&self, endpoint: &str) -> CircuitBreakerState {
        self.inner.breakers.state_of(endpoint)
    }

    pub fn scheduler_stats(&self) -> SchedulerStats {
        self.inner.scheduler.stats()
    }

    pub fn offline_len(&self) -> usize {
        self.inner.offline.len()
    }

    /// Distinct operations currently shared through deduplication.
    pub fn in_flight(&self) -> usize {
        self.inner.dedupe.as_ref().map_or(0, Deduplicator::in_flight)
    }

    /// Flatten an error using this client's retry classification.
    pub fn error_info(&self, error: &RequestError) -> ErrorInfo {
        self.inner.retry.error_info(error)
    }
}

/// A single transport call with the interceptor hooks and the request deadline.
async fn send_once(
    inner: &ClientInner,
    descriptor: &RequestDescriptor,
    token: &RequestToken,
) -> Result<ResponseEnvelope, RequestError> {
    let mut request = TransportRequest::from_descriptor(
        &inner.config.base_url,
        &inner.config.default_headers,
        descriptor,
    )?;
    if let Some(interceptor) = &inner.interceptor {
        interceptor.before_send(&mut request).await?;
    }

    let raw = match descriptor.timeout_ms.or(inner.config.timeout_ms) {
        Some(timeout_ms) => {
            let deadline = token.child_with_deadline(timeout_ms);
            let cancel = deadline.as_cancellation_token().clone();
            deadline.run(inner.transport.send(request, cancel)).await?
        }
        None => {
            let cancel = token.as_cancellation_token().clone();
            token.run(inner.transport.send(request, cancel)).await?
        }
    };

    let envelope = raw.into_envelope()?;
    match &inner.interceptor {
        Some(interceptor) => interceptor.after_receive(envelope).await,
        None => Ok(envelope),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CacheOptions, CacheStrategy, RetryOverrides};
    use crate::request::ResponseBody;
    use crate::transport::{FnTransport, RawResponse};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    fn counting_transport(calls: Arc<AtomicUsize>) -> Arc<dyn Transport> {
        Arc::new(FnTransport(move |req: TransportRequest, _cancel: CancellationToken| {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(RawResponse::new(200, req.url))
            }
        }))
    }

    #[tokio::test]
    async fn test_plain_request_reaches_transport() {
        let calls = Arc::new(AtomicUsize::new(0));
        let client = Client::builder(counting_transport(calls.clone()))
            .base_url("https://api.example.com")
            .build();

        let res = client.get("/ping").await.unwrap();
        assert_eq!(
            res.data,
            ResponseBody::Text("https://api.example.com/ping".into())
        );
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(client.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_cached_request_skips_transport_on_second_call() {
        let calls = Arc::new(AtomicUsize::new(0));
        let client = Client::builder(counting_transport(calls.clone())).build();
        let request = || {
            RequestDescriptor::get("/notes").cache(CacheOptions::new(CacheStrategy::CacheFirst))
        };

        let first = client.execute(request()).await.unwrap();
        let second = client.execute(request()).await.unwrap();
        assert!(!first.served_from_cache);
        assert!(second.served_from_cache);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_interceptor_sees_request_and_response() {
        struct Auth;

        #[async_trait]
        impl Interceptor for Auth {
            async fn before_send(&self, request: &mut TransportRequest) -> Result<(), RequestError> {
                request
                    .headers
                    .insert("authorization".into(), "Bearer t0k3n".into());
                Ok(())
            }

            async fn after_receive(
                &self,
                mut response: ResponseEnvelope,
            ) -> Result<ResponseEnvelope, RequestError> {
                response.headers.insert("x-decrypted".into(), "1".into());
                Ok(response)
            }
        }

        let transport = Arc::new(FnTransport(|req: TransportRequest, _cancel: CancellationToken| async move {
            let auth = req.headers.get("authorization").cloned().unwrap_or_default();
            Ok(RawResponse::new(200, auth))
        }));
        let client = Client::builder(transport).interceptor(Arc::new(Auth)).build();

        let res = client.get("/me").await.unwrap();
        assert_eq!(res.data, ResponseBody::Text("Bearer t0k3n".into()));
        assert_eq!(res.headers["x-decrypted"], "1");
    }

    #[tokio::test]
    async fn test_interceptor_error_passes_through() {
        struct Broken;

        #[async_trait]
        impl Interceptor for Broken {
            async fn after_receive(
                &self,
                _response: ResponseEnvelope,
            ) -> Result<ResponseEnvelope, RequestError> {
                Err(RequestError::collaborator("crypto", "bad key"))
            }
        }

        let calls = Arc::new(AtomicUsize::new(0));
        let client = Client::builder(counting_transport(calls.clone()))
            .interceptor(Arc::new(Broken))
            .build();

        let err = client.get("/secret").await.unwrap_err();
        assert_eq!(err, RequestError::collaborator("crypto", "bad key"));
        // Collaborator failures are neither retried nor breaker failures
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(client.breaker_state("/secret").consecutive_failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_reports_timeout() {
        let transport = Arc::new(FnTransport(
            |_req: TransportRequest, cancel: CancellationToken| async move {
                tokio::select! {
                    _ = cancel.cancelled() => Err(RequestError::transport("aborted")),
                    _ = tokio::time::sleep(Duration::from_secs(60)) => Ok(RawResponse::new(200, "late")),
                }
            },
        ));
        let client = Client::builder(transport).build();

        let err = client
            .execute(RequestDescriptor::get("/slow").timeout_ms(500))
            .await
            .unwrap_err();
        assert_eq!(err, RequestError::Timeout { timeout_ms: 500 });
        assert_eq!(client.breaker_state("/slow").consecutive_failures, 0);
    }

    #[tokio::test]
    async fn test_cancel_by_id() {
        let transport = Arc::new(FnTransport(
            |_req: TransportRequest, cancel: CancellationToken| async move {
                cancel.cancelled().await;
                Err(RequestError::transport("aborted"))
            },
        ));
        let client = Client::builder(transport).build();

        let pending = {
            let client = client.clone();
            tokio::spawn(async move {
                client
                    .execute(RequestDescriptor::get("/hang").id("hang-1"))
                    .await
            })
        };
        while !client.cancel("hang-1") {
            tokio::task::yield_now().await;
        }

        assert_eq!(pending.await.unwrap(), Err(RequestError::Cancelled));
        assert!(!client.cancel("hang-1"));
    }

    #[tokio::test]
    async fn test_error_info_uses_client_retry_policy() {
        let calls = Arc::new(AtomicUsize::new(0));
        let client = Client::builder(counting_transport(calls)).build();

        let info = client.error_info(&RequestError::http(503, "Service Unavailable"));
        assert_eq!(info.status, Some(503));
        assert!(info.retryable);

        let info = client.error_info(&RequestError::Timeout { timeout_ms: 10 });
        assert_eq!(info.status, Some(408));
        assert!(!info.retryable);
    }

    #[tokio::test]
    async fn test_error_info_follows_custom_retry_condition() {
        let calls = Arc::new(AtomicUsize::new(0));
        let client = Client::builder(counting_transport(calls))
            .retry_condition(Arc::new(|error: &RequestError, _attempt: u32| {
                matches!(error, RequestError::Transport { .. })
            }))
            .build();

        assert!(client.error_info(&RequestError::transport("reset")).retryable);
        assert!(!client.error_info(&RequestError::http(503, "Service Unavailable")).retryable);
        assert!(!client.error_info(&RequestError::Cancelled).retryable);
    }

    #[tokio::test]
    async fn test_per_request_retry_override() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let transport = Arc::new(FnTransport(move |_req: TransportRequest, _cancel: CancellationToken| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(RawResponse::new(503, ""))
            }
        }));
        let client = Client::builder(transport).build();

        let err = client
            .execute(RequestDescriptor::post("/orders", serde_json::json!({"n": 1})).retry(
                RetryOverrides {
                    max_attempts: Some(1),
                    ..Default::default()
                },
            ))
            .await
            .unwrap_err();
        assert_eq!(err.status(), Some(503));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
