//! Per-dependency circuit breaker.
//!
//! Three states: Closed (calls pass), Open (calls rejected until the recovery
//! window elapses), HalfOpen (one probe decides).  Transitions are evaluated
//! lazily on the next `call`; the breaker owns no timers.
//!
//! The critical section guards only the state record; the downstream call
//! always happens outside the lock.

use serde::Serialize;
use std::future::Future;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

/// Breaker state, exposed for the health surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

/// Error returned by [`CircuitBreaker::call`].
///
/// `Open` is the distinguished fail-fast rejection: the protected function
/// was never invoked.  `Service` wraps the original downstream error.
#[derive(Debug, thiserror::Error)]
pub enum BreakerError<E> {
    #[error("circuit breaker '{0}' is open")]
    Open(&'static str),
    #[error("{0}")]
    Service(E),
}

#[derive(Debug)]
struct BreakerInner {
    state: BreakerState,
    failure_count: u32,
    last_failure_at: Option<Instant>,
}

/// A fail-fast gate for one downstream dependency.
///
/// Two instances exist per client (`websocket` and `broker`); they are owned
/// by the client rather than process-wide so tests can instantiate isolated
/// cores.  There is no cross-breaker locking.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: &'static str,
    /// Consecutive matched failures before opening; 0 means never trip.
    failure_threshold: u32,
    recovery_timeout: Duration,
    inner: Mutex<BreakerInner>,
}

/// Serializable breaker metrics for the external health endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub name: &'static str,
    pub state: BreakerState,
    pub failure_count: u32,
    pub failure_threshold: u32,
    pub recovery_timeout_s: f64,
    pub seconds_since_last_failure: Option<f64>,
}

impl CircuitBreaker {
    pub fn new(name: &'static str, failure_threshold: u32, recovery_timeout: Duration) -> Self {
        CircuitBreaker {
            name,
            failure_threshold,
            recovery_timeout,
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                failure_count: 0,
                last_failure_at: None,
            }),
        }
    }

    /// Run `f` under the breaker, counting every `Err` as a failure.
    pub async fn call<T, E, F, Fut>(&self, f: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.call_matching(f, |_| true).await
    }

    /// Run `f` under the breaker, counting only failures matched by
    /// `is_expected`.  Unmatched failures propagate without touching state
    /// or counters.
    pub async fn call_matching<T, E, F, Fut, P>(
        &self,
        f: F,
        is_expected: P,
    ) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: FnOnce(&E) -> bool,
    {
        self.check_open()?;
        match f().await {
            Ok(value) => {
                self.on_success();
                Ok(value)
            }
            Err(e) => {
                if is_expected(&e) {
                    self.on_failure();
                }
                Err(BreakerError::Service(e))
            }
        }
    }

    pub fn state(&self) -> BreakerState {
        self.lock().state
    }

    pub fn failure_count(&self) -> u32 {
        self.lock().failure_count
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.lock();
        BreakerSnapshot {
            name: self.name,
            state: inner.state,
            failure_count: inner.failure_count,
            failure_threshold: self.failure_threshold,
            recovery_timeout_s: self.recovery_timeout.as_secs_f64(),
            seconds_since_last_failure: inner.last_failure_at.map(|at| at.elapsed().as_secs_f64()),
        }
    }

    // -----------------------------------------------------------------------
    // State transitions (all under the breaker-local lock, never awaiting)
    // -----------------------------------------------------------------------

    fn check_open<E>(&self) -> Result<(), BreakerError<E>> {
        let mut inner = self.lock();
        if inner.state != BreakerState::Open {
            return Ok(());
        }
        let recovered = inner
            .last_failure_at
            .is_none_or(|at| at.elapsed() >= self.recovery_timeout);
        if recovered {
            inner.state = BreakerState::HalfOpen;
            info!(breaker = self.name, "circuit breaker transitioning to half-open");
            Ok(())
        } else {
            Err(BreakerError::Open(self.name))
        }
    }

    fn on_success(&self) {
        let mut inner = self.lock();
        if inner.state == BreakerState::HalfOpen {
            inner.state = BreakerState::Closed;
            info!(breaker = self.name, "circuit breaker closed after successful call");
        }
        inner.failure_count = 0;
    }

    fn on_failure(&self) {
        let mut inner = self.lock();
        inner.failure_count += 1;
        inner.last_failure_at = Some(Instant::now());
        warn!(
            breaker = self.name,
            failure_count = inner.failure_count,
            threshold = self.failure_threshold,
            "circuit breaker failure recorded"
        );
        if self.failure_threshold > 0
            && inner.failure_count >= self.failure_threshold
            && inner.state != BreakerState::Open
        {
            inner.state = BreakerState::Open;
            error!(
                breaker = self.name,
                failure_count = inner.failure_count,
                "circuit breaker opened"
            );
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BreakerInner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
