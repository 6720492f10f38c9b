use std::{future::Future, time::Duration};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::{error::ApiError, settings::CircuitBreakerConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
enum State {
    Closed,
    Open,
    // Only one trial call may be in flight while half open.
    HalfOpen { trial_in_flight: bool },
}

#[derive(Debug)]
struct Inner {
    state: State,
    failure_count: u32,
    last_failure: Option<Instant>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CircuitSnapshot {
    pub state: CircuitState,
    pub failure_count: u32,
    pub failure_threshold: u32,
    pub seconds_since_last_failure: Option<f64>,
    pub recovery_timeout_seconds: f64,
}

type TripPredicate = Box<dyn Fn(&ApiError) -> bool + Send + Sync>;

pub struct CircuitBreaker {
    name: String,
    failure_threshold: u32,
    recovery_timeout: Duration,
    trips_on: TripPredicate,
    inner: Mutex<Inner>,
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("failure_threshold", &self.failure_threshold)
            .field("recovery_timeout", &self.recovery_timeout)
            .field("inner", &self.inner)
            .finish()
    }
}

impl CircuitBreaker {
    /// Breaker that counts every error as a tripping failure.
    pub fn new(name: impl Into<String>, failure_threshold: u32, recovery_timeout: Duration) -> Self {
        Self {
            name: name.into(),
            failure_threshold: failure_threshold.max(1),
            recovery_timeout,
            trips_on: Box::new(|_| true),
            inner: Mutex::new(Inner {
                state: State::Closed,
                failure_count: 0,
                last_failure: None,
            }),
        }
    }

    pub fn from_config(name: impl Into<String>, config: &CircuitBreakerConfig) -> Self {
        Self::new(
            name,
            config.failure_threshold,
            Duration::from_millis(config.recovery_timeout_ms),
        )
    }

    /// Restricts which errors count against the breaker. Other errors pass through and
    /// neither trip nor reset it.
    pub fn trips_on<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&ApiError) -> bool + Send + Sync + 'static,
    {
        self.trips_on = Box::new(predicate);
        self
    }

    pub fn state(&self) -> CircuitState {
        match self.inner.lock().state {
            State::Closed => CircuitState::Closed,
            State::Open => CircuitState::Open,
            State::HalfOpen { .. } => CircuitState::HalfOpen,
        }
    }

    pub async fn call<F, Fut, T>(&self, operation: F) -> Result<T, ApiError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, ApiError>>,
    {
        let trial = self.before_call()?;
        // Dropping the future mid-trial must hand the slot back.
        let mut guard = TrialGuard {
            breaker: self,
            armed: trial,
        };

        let result = operation().await;
        guard.armed = false;

        match result {
            Ok(value) => {
                self.on_success();
                Ok(value)
            }
            Err(err) => {
                if (self.trips_on)(&err) {
                    self.on_failure();
                } else {
                    self.release_trial();
                }
                Err(err)
            }
        }
    }

    // Ok(true) when the caller holds the half-open trial slot.
    fn before_call(&self) -> Result<bool, ApiError> {
        let mut inner = self.inner.lock();
        match inner.state {
            State::Closed => Ok(false),
            State::Open => {
                let elapsed = inner
                    .last_failure
                    .map(|at| at.elapsed())
                    .unwrap_or(self.recovery_timeout);
                if elapsed >= self.recovery_timeout {
                    info!(breaker = %self.name, "circuit half open, allowing trial call");
                    inner.state = State::HalfOpen {
                        trial_in_flight: true,
                    };
                    Ok(true)
                } else {
                    Err(self.open_error(self.recovery_timeout - elapsed))
                }
            }
            State::HalfOpen { trial_in_flight } => {
                if trial_in_flight {
                    Err(self.open_error(Duration::ZERO))
                } else {
                    inner.state = State::HalfOpen {
                        trial_in_flight: true,
                    };
                    Ok(true)
                }
            }
        }
    }

    fn open_error(&self, remaining: Duration) -> ApiError {
        ApiError::CircuitOpen {
            service: self.name.clone(),
            retry_after_ms: Some(remaining.as_millis() as u64),
        }
    }

    fn on_success(&self) {
        let mut inner = self.inner.lock();
        if !matches!(inner.state, State::Closed) {
            info!(breaker = %self.name, "circuit closed after successful call");
        }
        inner.failure_count = 0;
        inner.state = State::Closed;
    }

    fn on_failure(&self) {
        let mut inner = self.inner.lock();
        inner.failure_count += 1;
        inner.last_failure = Some(Instant::now());

        let reopen = matches!(inner.state, State::HalfOpen { .. });
        if reopen || inner.failure_count >= self.failure_threshold {
            if !matches!(inner.state, State::Open) {
                warn!(
                    breaker = %self.name,
                    failure_count = inner.failure_count,
                    "circuit opened"
                );
            }
            inner.state = State::Open;
        }
    }

    // A non-tripping error during the trial leaves the breaker half open for the next caller.
    fn release_trial(&self) {
        let mut inner = self.inner.lock();
        if let State::HalfOpen { .. } = inner.state {
            inner.state = State::HalfOpen {
                trial_in_flight: false,
            };
        }
    }

    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.state = State::Closed;
        inner.failure_count = 0;
        inner.last_failure = None;
    }

    pub fn snapshot(&self) -> CircuitSnapshot {
        let inner = self.inner.lock();
        CircuitSnapshot {
            state: match inner.state {
                State::Closed => CircuitState::Closed,
                State::Open => CircuitState::Open,
                State::HalfOpen { .. } => CircuitState::HalfOpen,
            },
            failure_count: inner.failure_count,
            failure_threshold: self.failure_threshold,
            seconds_since_last_failure: inner.last_failure.map(|at| at.elapsed().as_secs_f64()),
            recovery_timeout_seconds: self.recovery_timeout.as_secs_f64(),
        }
    }
}

struct TrialGuard<'a> {
    breaker: &'a CircuitBreaker,
    armed: bool,
}

impl Drop for TrialGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.breaker.release_trial();
        }
    }
}
