use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tokio::time::Instant;

pub const DEFAULT_THRESHOLD: u32 = 5;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BreakerError<E> {
    /// Rejected without calling the wrapped operation.
    #[error("Circuit open")]
    Open,
    #[error("{0}")]
    Inner(E),
}

impl<E> BreakerError<E> {
    pub fn is_open(&self) -> bool {
        matches!(self, BreakerError::Open)
    }
}

/// Receives state transitions. Runs on its own task, never on the caller's.
pub trait BreakerObserver: Send + Sync {
    fn on_state_change(&self, breaker: &str, from: BreakerState, to: BreakerState);
}

#[derive(Debug, Clone)]
pub struct BreakerSnapshot {
    pub state: BreakerState,
    pub consecutive_failures: u32,
    pub last_failure_at: Option<Instant>,
    pub last_state_change_at: Instant,
}

struct Inner {
    state: BreakerState,
    consecutive_failures: u32,
    last_failure_at: Option<Instant>,
    last_state_change_at: Instant,
    probe_in_flight: bool,
}

enum Admission {
    Normal,
    Probe,
}

/// Three-state failure guard around calls to an unreliable dependency.
///
/// While half-open exactly one call is admitted as the probe; concurrent
/// callers are rejected as if the circuit were still open.
pub struct CircuitBreaker {
    name: String,
    threshold: u32,
    timeout: Duration,
    inner: Mutex<Inner>,
    observers: Mutex<Vec<Arc<dyn BreakerObserver>>>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, threshold: u32, timeout: Duration) -> Self {
        Self {
            name: name.into(),
            threshold: threshold.max(1),
            timeout,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                last_failure_at: None,
                last_state_change_at: Instant::now(),
                probe_in_flight: false,
            }),
            observers: Mutex::new(Vec::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn add_observer(&self, observer: Arc<dyn BreakerObserver>) {
        self.observers.lock().push(observer);
    }

    pub fn state(&self) -> BreakerState {
        self.inner.lock().state
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.inner.lock();
        BreakerSnapshot {
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            last_failure_at: inner.last_failure_at,
            last_state_change_at: inner.last_state_change_at,
        }
    }

    /// Runs `operation` unless the circuit is open.
    pub async fn call<F, Fut, T, E>(&self, operation: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let admission = self.admit::<E>()?;
        let mut guard = ProbeGuard {
            breaker: self,
            armed: matches!(admission, Admission::Probe),
        };
        let result = operation().await;
        guard.armed = false;
        match &result {
            Ok(_) => self.on_success(),
            Err(_) => self.on_failure(),
        }
        result.map_err(BreakerError::Inner)
    }

    /// Forces the circuit closed and clears the failure history.
    pub fn reset(&self) {
        let transition = {
            let mut inner = self.inner.lock();
            inner.consecutive_failures = 0;
            inner.last_failure_at = None;
            inner.probe_in_flight = false;
            self.transition(&mut inner, BreakerState::Closed)
        };
        tracing::info!(breaker = %self.name, "Circuit breaker reset");
        self.notify(transition);
    }

    fn admit<E>(&self) -> Result<Admission, BreakerError<E>> {
        let (admission, transition) = {
            let mut inner = self.inner.lock();
            match inner.state {
                BreakerState::Closed => (Admission::Normal, None),
                BreakerState::HalfOpen => return Err(BreakerError::Open),
                BreakerState::Open => {
                    let elapsed = inner
                        .last_failure_at
                        .map_or(self.timeout, |at| at.elapsed());
                    if elapsed < self.timeout || inner.probe_in_flight {
                        return Err(BreakerError::Open);
                    }
                    inner.probe_in_flight = true;
                    let transition = self.transition(&mut inner, BreakerState::HalfOpen);
                    (Admission::Probe, transition)
                }
            }
        };
        self.notify(transition);
        Ok(admission)
    }

    fn on_success(&self) {
        let transition = {
            let mut inner = self.inner.lock();
            inner.consecutive_failures = 0;
            if inner.state == BreakerState::HalfOpen {
                inner.probe_in_flight = false;
                self.transition(&mut inner, BreakerState::Closed)
            } else {
                None
            }
        };
        self.notify(transition);
    }

    fn on_failure(&self) {
        let transition = {
            let mut inner = self.inner.lock();
            inner.consecutive_failures += 1;
            inner.last_failure_at = Some(Instant::now());
            match inner.state {
                BreakerState::HalfOpen => {
                    inner.probe_in_flight = false;
                    self.transition(&mut inner, BreakerState::Open)
                }
                BreakerState::Closed if inner.consecutive_failures >= self.threshold => {
                    self.transition(&mut inner, BreakerState::Open)
                }
                _ => None,
            }
        };
        self.notify(transition);
    }

    fn transition(
        &self,
        inner: &mut Inner,
        to: BreakerState,
    ) -> Option<(BreakerState, BreakerState)> {
        let from = inner.state;
        if from == to {
            return None;
        }
        inner.state = to;
        inner.last_state_change_at = Instant::now();
        match to {
            BreakerState::Open => tracing::warn!(
                breaker = %self.name,
                failures = inner.consecutive_failures,
                "Circuit opened"
            ),
            BreakerState::HalfOpen => tracing::info!(breaker = %self.name, "Circuit half-open, probing"),
            BreakerState::Closed => tracing::info!(breaker = %self.name, outcome = "success", "Circuit closed"),
        }
        Some((from, to))
    }

    fn notify(&self, transition: Option<(BreakerState, BreakerState)>) {
        let Some((from, to)) = transition else {
            return;
        };
        let observers = self.observers.lock().clone();
        if observers.is_empty() {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::debug!(breaker = %self.name, "No runtime for state-change notification");
            return;
        };
        let name = self.name.clone();
        runtime.spawn(async move {
            for observer in observers {
                observer.on_state_change(&name, from, to);
            }
        });
    }
}

/// Reopens the circuit when a probe is dropped before it finishes.
struct ProbeGuard<'a> {
    breaker: &'a CircuitBreaker,
    armed: bool,
}

impl Drop for ProbeGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.breaker.on_failure();
        }
    }
}
