//! Circuit breaker for protecting handlers (and any other async operation).
//!
//! States:
//! - Closed: normal operation, calls pass through
//! - Open: failures reached the threshold, calls are rejected without running
//! - HalfOpen: the reset timeout elapsed, a single trial call decides the next state

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use courier_core::{HandlerError, SharedClock, SystemClock};

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation
    Closed,
    /// Requests blocked
    Open,
    /// Testing recovery
    HalfOpen,
}

/// Circuit breaker configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before opening
    pub failure_threshold: u32,

    /// Time to wait before letting a trial call through
    pub reset_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(30),
        }
    }
}

/// Point-in-time view of a breaker.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CircuitBreakerState {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub last_state_change_at: DateTime<Utc>,
    pub failure_threshold: u32,
    pub reset_timeout: Duration,
}

/// Errors a breaker should let through without counting them as failures.
pub trait ExpectedError {
    fn is_expected(&self) -> bool;
}

impl ExpectedError for HandlerError {
    fn is_expected(&self) -> bool {
        HandlerError::is_expected(self)
    }
}

/// Result of a call made through a breaker.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CircuitBreakerError<E> {
    /// The breaker rejected the call without running it.
    #[error("circuit breaker '{name}' is open (retry in {retry_after:?})")]
    Open { name: String, retry_after: Duration },

    /// The operation ran and failed.
    #[error(transparent)]
    Inner(E),
}

impl<E> CircuitBreakerError<E> {
    pub fn is_open(&self) -> bool {
        matches!(self, CircuitBreakerError::Open { .. })
    }

    pub fn into_inner(self) -> Option<E> {
        match self {
            CircuitBreakerError::Inner(e) => Some(e),
            CircuitBreakerError::Open { .. } => None,
        }
    }
}

impl From<CircuitBreakerError<HandlerError>> for HandlerError {
    fn from(err: CircuitBreakerError<HandlerError>) -> Self {
        match err {
            CircuitBreakerError::Open { name, .. } => HandlerError::CircuitOpen(name),
            CircuitBreakerError::Inner(e) => e,
        }
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    last_failure_at: Option<DateTime<Utc>>,
    last_state_change_at: DateTime<Utc>,
    trial_in_flight: bool,
}

/// Failure-isolation state machine guarding one operation.
///
/// All transitions happen under a single mutex, so concurrent callers observe a
/// consistent state and exactly one of them gets the half-open trial. The lock is
/// never held while the protected operation runs.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    clock: SharedClock,
    inner: Mutex<BreakerInner>,
    open_count: AtomicU64,
}

impl CircuitBreaker {
    /// Create a breaker using the system clock.
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self::with_clock(name, config, SystemClock::shared())
    }

    pub fn with_clock(
        name: impl Into<String>,
        config: CircuitBreakerConfig,
        clock: SharedClock,
    ) -> Self {
        let now = clock.now();
        Self {
            name: name.into(),
            config,
            clock,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                last_failure_at: None,
                last_state_change_at: now,
                trial_in_flight: false,
            }),
            open_count: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Get current state.
    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    pub fn is_open(&self) -> bool {
        self.state() == CircuitState::Open
    }

    /// Get consecutive failure count.
    pub fn failure_count(&self) -> u32 {
        self.lock().consecutive_failures
    }

    /// Get total times the breaker has opened.
    pub fn open_count(&self) -> u64 {
        self.open_count.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> CircuitBreakerState {
        let inner = self.lock();
        CircuitBreakerState {
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            last_failure_at: inner.last_failure_at,
            last_state_change_at: inner.last_state_change_at,
            failure_threshold: self.config.failure_threshold,
            reset_timeout: self.config.reset_timeout,
        }
    }

    /// Force the breaker back to closed (operator action).
    pub fn reset(&self) {
        let mut inner = self.lock();
        inner.consecutive_failures = 0;
        inner.trial_in_flight = false;
        self.transition(&mut inner, CircuitState::Closed);
    }

    /// Run `op` through the breaker, using [`ExpectedError`] to skip business errors.
    pub async fn execute<T, E, F, Fut>(&self, op: F) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: ExpectedError,
    {
        self.execute_with(op, E::is_expected).await
    }

    /// Run `op` through the breaker with a custom expected-error predicate.
    pub async fn execute_with<T, E, F, Fut, P>(
        &self,
        op: F,
        is_expected: P,
    ) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: Fn(&E) -> bool,
    {
        let permit = self.try_acquire()?;

        match op().await {
            Ok(value) => {
                permit.settle(Outcome::Success);
                Ok(value)
            }
            Err(err) => {
                let outcome = if is_expected(&err) {
                    Outcome::Expected
                } else {
                    Outcome::Failure
                };
                permit.settle(outcome);
                Err(CircuitBreakerError::Inner(err))
            }
        }
    }

    fn try_acquire<E>(&self) -> Result<Permit<'_>, CircuitBreakerError<E>> {
        let mut inner = self.lock();

        match inner.state {
            CircuitState::Closed => Ok(Permit::new(self, false)),
            CircuitState::Open => {
                let elapsed = (self.clock.now() - inner.last_state_change_at)
                    .to_std()
                    .unwrap_or_default();
                if elapsed >= self.config.reset_timeout {
                    self.transition(&mut inner, CircuitState::HalfOpen);
                    inner.trial_in_flight = true;
                    Ok(Permit::new(self, true))
                } else {
                    Err(CircuitBreakerError::Open {
                        name: self.name.clone(),
                        retry_after: self.config.reset_timeout - elapsed,
                    })
                }
            }
            CircuitState::HalfOpen if !inner.trial_in_flight => {
                inner.trial_in_flight = true;
                Ok(Permit::new(self, true))
            }
            CircuitState::HalfOpen => Err(CircuitBreakerError::Open {
                name: self.name.clone(),
                retry_after: Duration::ZERO,
            }),
        }
    }

    fn record(&self, outcome: Outcome, trial: bool) {
        let mut inner = self.lock();
        if trial {
            inner.trial_in_flight = false;
        }

        match (outcome, inner.state) {
            (Outcome::Success, CircuitState::Closed) => {
                inner.consecutive_failures = 0;
            }
            (Outcome::Success, CircuitState::HalfOpen) if trial => {
                inner.consecutive_failures = 0;
                self.transition(&mut inner, CircuitState::Closed);
            }
            (Outcome::Failure, CircuitState::Closed) => {
                inner.last_failure_at = Some(self.clock.now());
                inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
                if inner.consecutive_failures >= self.config.failure_threshold {
                    self.transition(&mut inner, CircuitState::Open);
                }
            }
            (Outcome::Failure, CircuitState::HalfOpen) if trial => {
                inner.last_failure_at = Some(self.clock.now());
                inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
                self.transition(&mut inner, CircuitState::Open);
            }
            (Outcome::Failure, _) => {
                inner.last_failure_at = Some(self.clock.now());
            }
            // Late results from calls admitted before the state changed, and
            // expected errors, leave the state machine alone.
            _ => {}
        }
    }

    fn transition(&self, inner: &mut BreakerInner, to: CircuitState) {
        if inner.state == to {
            return;
        }
        inner.state = to;
        inner.last_state_change_at = self.clock.now();

        match to {
            CircuitState::Open => {
                self.open_count.fetch_add(1, Ordering::Relaxed);
                warn!(
                    breaker = %self.name,
                    failures = inner.consecutive_failures,
                    "circuit breaker opened"
                );
            }
            CircuitState::HalfOpen => debug!(breaker = %self.name, "circuit breaker half-open"),
            CircuitState::Closed => info!(breaker = %self.name, "circuit breaker closed"),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BreakerInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Success,
    Failure,
    Expected,
}

/// Admission to run one call. Dropping it unsettled (cancelled future) frees the
/// half-open trial slot so the breaker cannot get stuck.
struct Permit<'a> {
    breaker: &'a CircuitBreaker,
    trial: bool,
    settled: bool,
}

impl<'a> Permit<'a> {
    fn new(breaker: &'a CircuitBreaker, trial: bool) -> Self {
        Self {
            breaker,
            trial,
            settled: false,
        }
    }

    fn settle(mut self, outcome: Outcome) {
        self.settled = true;
        self.breaker.record(outcome, self.trial);
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if !self.settled && self.trial {
            self.breaker.record(Outcome::Expected, true);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicU32;

    use courier_core::{Clock, ManualClock};

    fn breaker(clock: Arc<ManualClock>) -> CircuitBreaker {
        CircuitBreaker::with_clock(
            "billing",
            CircuitBreakerConfig {
                failure_threshold: 3,
                reset_timeout: Duration::from_secs(10),
            },
            clock,
        )
    }

    async fn fail(cb: &CircuitBreaker, calls: &AtomicU32) -> Result<(), CircuitBreakerError<HandlerError>> {
        cb.execute(|| async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(HandlerError::failed("downstream unavailable"))
        })
        .await
    }

    async fn succeed(cb: &CircuitBreaker, calls: &AtomicU32) -> Result<(), CircuitBreakerError<HandlerError>> {
        cb.execute(|| async {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok::<(), HandlerError>(())
        })
        .await
    }

    #[tokio::test]
    async fn opens_after_threshold_and_rejects_without_invoking() {
        let clock = ManualClock::starting_now();
        let cb = breaker(clock.clone());
        let calls = AtomicU32::new(0);

        for _ in 0..3 {
            assert!(matches!(fail(&cb, &calls).await, Err(CircuitBreakerError::Inner(_))));
        }
        assert_eq!(cb.state(), CircuitState::Open);
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        clock.advance_std(Duration::from_secs(9));
        let err = succeed(&cb, &calls).await.unwrap_err();
        assert!(err.is_open());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(cb.open_count(), 1);
    }

    #[tokio::test]
    async fn successful_trial_closes_and_resets_counter() {
        let clock = ManualClock::starting_now();
        let cb = breaker(clock.clone());
        let calls = AtomicU32::new(0);

        for _ in 0..3 {
            let _ = fail(&cb, &calls).await;
        }
        clock.advance_std(Duration::from_secs(10));

        succeed(&cb, &calls).await.unwrap();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.failure_count(), 0);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn failed_trial_reopens_and_restarts_timer() {
        let clock = ManualClock::starting_now();
        let cb = breaker(clock.clone());
        let calls = AtomicU32::new(0);

        for _ in 0..3 {
            let _ = fail(&cb, &calls).await;
        }
        clock.advance_std(Duration::from_secs(10));
        let reopened_at = clock.now();

        assert!(matches!(fail(&cb, &calls).await, Err(CircuitBreakerError::Inner(_))));
        assert_eq!(cb.state(), CircuitState::Open);
        assert_eq!(cb.snapshot().last_state_change_at, reopened_at);

        clock.advance_std(Duration::from_secs(5));
        assert!(succeed(&cb, &calls).await.unwrap_err().is_open());
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn only_one_trial_runs_while_half_open() {
        let clock = ManualClock::starting_now();
        let cb = Arc::new(breaker(clock.clone()));
        let calls = AtomicU32::new(0);

        for _ in 0..3 {
            let _ = fail(&cb, &calls).await;
        }
        clock.advance_std(Duration::from_secs(10));

        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let trial_cb = cb.clone();
        let trial = tokio::spawn(async move {
            trial_cb
                .execute(|| async {
                    let _ = release_rx.await;
                    Ok::<(), HandlerError>(())
                })
                .await
        });

        // Let the trial task take the slot.
        while cb.state() != CircuitState::HalfOpen {
            tokio::task::yield_now().await;
        }
        let second = succeed(&cb, &calls).await;
        assert!(second.unwrap_err().is_open());

        release_tx.send(()).unwrap();
        trial.await.unwrap().unwrap();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn expected_errors_do_not_count() {
        let cb = breaker(ManualClock::starting_now());

        for _ in 0..10 {
            let result = cb
                .execute(|| async { Err::<(), _>(HandlerError::validation("bad email")) })
                .await;
            assert!(matches!(result, Err(CircuitBreakerError::Inner(HandlerError::Validation(_)))));
        }

        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.failure_count(), 0);
    }

    #[tokio::test]
    async fn custom_predicate_overrides_classification() {
        let cb = breaker(ManualClock::starting_now());

        for _ in 0..5 {
            let _ = cb
                .execute_with(|| async { Err::<(), &str>("404") }, |e| *e == "404")
                .await;
        }
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn success_in_closed_state_resets_failures() {
        let cb = breaker(ManualClock::starting_now());
        let calls = AtomicU32::new(0);

        let _ = fail(&cb, &calls).await;
        let _ = fail(&cb, &calls).await;
        succeed(&cb, &calls).await.unwrap();
        let _ = fail(&cb, &calls).await;

        assert_eq!(cb.failure_count(), 1);
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn open_error_converts_to_handler_error() {
        let err: HandlerError = CircuitBreakerError::<HandlerError>::Open {
            name: "billing".into(),
            retry_after: Duration::from_secs(1),
        }
        .into();
        assert_eq!(err, HandlerError::CircuitOpen("billing".into()));
    }
}
