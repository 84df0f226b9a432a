//! Per-request cancellation tokens.
//!
//! A timeout is a token that cancels itself after a deadline; the only
//! observable difference from a caller cancel is the error it reports.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::ops::Deref;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::RequestError;

/// Why a token fired. The first reason recorded wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    Cancelled,
    Timeout { timeout_ms: u64 },
}

/// Cancellation token for one request, threaded through every layer.
#[derive(Debug, Clone, Default)]
pub struct RequestToken {
    token: CancellationToken,
    reason: Arc<OnceLock<CancelReason>>,
}

impl RequestToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancel_with(CancelReason::Cancelled);
    }

    pub fn cancel_with(&self, reason: CancelReason) {
        let _ = self.reason.set(reason);
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn reason(&self) -> Option<CancelReason> {
        self.reason.get().copied()
    }

    /// Resolves once the token fires.
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    /// Underlying token, for transports that accept a `CancellationToken`.
    pub fn as_cancellation_token(&self) -> &CancellationToken {
        &self.token
    }

    /// The error a caller observes for this token.
    pub fn error(&self) -> RequestError {
        match self.reason() {
            Some(CancelReason::Timeout { timeout_ms }) => RequestError::Timeout { timeout_ms },
            _ => RequestError::Cancelled,
        }
    }

    /// Drive `fut` unless the token fires first.
    pub async fn run<T, Fut>(&self, fut: Fut) -> Result<T, RequestError>
    where
        Fut: Future<Output = Result<T, RequestError>>,
    {
        if self.is_cancelled() {
            return Err(self.error());
        }
        tokio::select! {
            biased;
            _ = self.token.cancelled() => Err(self.error()),
            res = fut => res,
        }
    }

    /// Sleep for `delay`, returning early with the cancellation error if the token fires.
    pub async fn sleep(&self, delay: Duration) -> Result<(), RequestError> {
        self.run(async {
            tokio::time::sleep(delay).await;
            Ok(())
        })
        .await
    }

    /// Child token that fires with this one, or on its own with
    /// [`CancelReason::Timeout`] once `timeout_ms` elapses.
    pub fn child_with_deadline(&self, timeout_ms: u64) -> DeadlineToken {
        let token = RequestToken {
            token: self.token.child_token(),
            reason: Arc::new(OnceLock::new()),
        };

        let timer_token = token.clone();
        let timer = tokio::spawn(async move {
            tokio::select! {
                _ = timer_token.cancelled() => {}
                _ = tokio::time::sleep(Duration::from_millis(timeout_ms)) => {
                    timer_token.cancel_with(CancelReason::Timeout { timeout_ms });
                }
            }
        });

        DeadlineToken { token, timer }
    }
}

/// A child of a [`RequestToken`] that also fires as a timeout after a deadline.
///
/// The deadline timer stops when this value drops.
pub struct DeadlineToken {
    token: RequestToken,
    timer: JoinHandle<()>,
}

impl Deref for DeadlineToken {
    type Target = RequestToken;

    fn deref(&self) -> &RequestToken {
        &self.token
    }
}

impl Drop for DeadlineToken {
    fn drop(&mut self) {
        self.timer.abort();
    }
}

/// Issues and tracks tokens by request id.
#[derive(Clone, Default)]
pub struct CancellationRegistry {
    tokens: Arc<Mutex<HashMap<String, RequestToken>>>,
}

impl CancellationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the token for `id`, creating it if absent.
    pub fn get_token(&self, id: &str) -> RequestToken {
        self.tokens.lock().entry(id.to_string()).or_default().clone()
    }

    /// Cancel the request with `id`. Returns false if no token is registered.
    pub fn cancel(&self, id: &str) -> bool {
        match self.tokens.lock().get(id) {
            Some(token) => {
                tracing::debug!("Cancelling request: id={}", id);
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel every outstanding request. Returns how many tokens were triggered.
    pub fn cancel_all(&self) -> usize {
        let tokens = self.tokens.lock();
        for token in tokens.values() {
            token.cancel();
        }
        tokens.len()
    }

    /// Forget the token for a settled request.
    pub fn cleanup(&self, id: &str) {
        self.tokens.lock().remove(id);
    }

    pub fn len(&self) -> usize {
        self.tokens.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.lock().is_empty()
    }
}
