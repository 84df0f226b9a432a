//! Three-state circuit breaker.
//!
//! ```text
//! closed --(failure_threshold consecutive failures)--> open
//! open   --(first call at/after next_attempt_time)---> half-open
//! half-open --(successes_required_to_close)----------> closed
//! half-open --(any failure)--------------------------> open
//! ```
//!
//! Only errors for which [`RequestError::counts_as_breaker_failure`] holds
//! are failures. Cancellations, timeouts and client errors leave the state
//! untouched.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::config::{BreakerScope, CircuitBreakerConfig};
use crate::error::RequestError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Snapshot of a breaker's state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitBreakerState {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    /// Consecutive successes while half-open.
    pub consecutive_successes: u32,
    pub last_failure_time: Option<Instant>,
    pub next_attempt_time: Option<Instant>,
}

impl Default for CircuitBreakerState {
    fn default() -> Self {
        CircuitBreakerState {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            consecutive_successes: 0,
            last_failure_time: None,
            next_attempt_time: None,
        }
    }
}

pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    state: Mutex<CircuitBreakerState>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        CircuitBreaker {
            name: name.into(),
            config,
            state: Mutex::new(CircuitBreakerState::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn snapshot(&self) -> CircuitBreakerState {
        self.state.lock().clone()
    }

    pub fn state(&self) -> CircuitState {
        self.state.lock().state
    }

    fn reset_timeout(&self) -> Duration {
        Duration::from_millis(self.config.reset_timeout_ms)
    }

    /// Admit or reject a call. An expired open circuit moves to half-open here.
    fn try_acquire(&self) -> Result<(), RequestError> {
        let mut state = self.state.lock();
        if state.state != CircuitState::Open {
            return Ok(());
        }

        let now = Instant::now();
        match state.next_attempt_time {
            Some(next) if now < next => Err(RequestError::CircuitOpen {
                retry_after_ms: (next - now).as_millis() as u64,
            }),
            _ => {
                tracing::info!("Circuit half-open: breaker={}", self.name);
                state.state = CircuitState::HalfOpen;
                state.consecutive_successes = 0;
                Ok(())
            }
        }
    }

    fn open(&self, state: &mut CircuitBreakerState, now: Instant) {
        state.state = CircuitState::Open;
        state.consecutive_successes = 0;
        state.next_attempt_time = Some(now + self.reset_timeout());
        tracing::warn!(
            "Circuit opened: breaker={}, consecutive_failures={}, reset_timeout_ms={}",
            self.name,
            state.consecutive_failures,
            self.config.reset_timeout_ms
        );
    }

    fn on_success(&self) {
        let mut state = self.state.lock();
        match state.state {
            CircuitState::Closed => state.consecutive_failures = 0,
            CircuitState::HalfOpen => {
                state.consecutive_successes += 1;
                if state.consecutive_successes >= self.config.successes_required_to_close {
                    tracing::info!("Circuit closed: breaker={}", self.name);
                    *state = CircuitBreakerState::default();
                }
            }
            // A call admitted before the circuit opened; it does not close it
            CircuitState::Open => {}
        }
    }

    fn on_failure(&self) {
        let mut state = self.state.lock();
        let now = Instant::now();
        state.last_failure_time = Some(now);
        state.consecutive_failures = state.consecutive_failures.saturating_add(1);

        match state.state {
            CircuitState::Closed => {
                if state.consecutive_failures >= self.config.failure_threshold {
                    self.open(&mut state, now);
                }
            }
            CircuitState::HalfOpen => self.open(&mut state, now),
            CircuitState::Open => {}
        }
    }

    /// Run `f` through the breaker.
    ///
    /// While open, fails with [`RequestError::CircuitOpen`] without calling `f`.
    pub async fn execute<T, F, Fut>(&self, f: F) -> Result<T, RequestError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, RequestError>>,
    {
        self.try_acquire()?;

        let result = f().await;
        match &result {
            Ok(_) => self.on_success(),
            Err(e) if e.counts_as_breaker_failure() => self.on_failure(),
            Err(_) => {}
        }
        result
    }
}

/// Hands out breakers according to the configured [`BreakerScope`].
pub struct BreakerRegistry {
    scope: BreakerScope,
    config: CircuitBreakerConfig,
    global: Arc<CircuitBreaker>,
    per_endpoint: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
}

impl BreakerRegistry {
    pub fn new(scope: BreakerScope, config: CircuitBreakerConfig) -> Self {
        BreakerRegistry {
            scope,
            global: Arc::new(CircuitBreaker::new("global", config.clone())),
            config,
            per_endpoint: Mutex::new(HashMap::new()),
        }
    }

    pub fn scope(&self) -> BreakerScope {
        self.scope
    }

    /// Breaker guarding `endpoint`.
    pub fn breaker_for(&self, endpoint: &str) -> Arc<CircuitBreaker> {
        match self.scope {
            BreakerScope::Global => Arc::clone(&self.global),
            BreakerScope::PerEndpoint => Arc::clone(
                self.per_endpoint
                    .lock()
                    .entry(endpoint.to_string())
                    .or_insert_with(|| Arc::new(CircuitBreaker::new(endpoint, self.config.clone()))),
            ),
        }
    }

    /// State of the breaker guarding `endpoint`; a never-used endpoint reads as closed.
    pub fn state_of(&self, endpoint: &str) -> CircuitBreakerState {
        match self.scope {
            BreakerScope::Global => self.global.snapshot(),
            BreakerScope::PerEndpoint => self
                .per_endpoint
                .lock()
                .get(endpoint)
                .map(|b| b.snapshot())
                .unwrap_or_default(),
        }
    }
}
