use coterie_core::{CoterieError, CoterieResult};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// State of a [`CircuitBreaker`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Calls pass through; failures are counted.
    Closed,
    /// Calls are short-circuited until the recovery timeout elapses.
    Open,
    /// One probe call is allowed through to test recovery.
    HalfOpen,
}

/// Configuration for a [`CircuitBreaker`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Consecutive failures before the breaker opens.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Cooldown after the last failure before a probe call is allowed.
    #[serde(default = "default_recovery_timeout_ms")]
    pub recovery_timeout_ms: u64,
}

fn default_failure_threshold() -> u32 {
    3
}

fn default_recovery_timeout_ms() -> u64 {
    60_000
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            recovery_timeout_ms: default_recovery_timeout_ms(),
        }
    }
}

struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    last_failure: Option<Instant>,
}

/// Guards calls to one unreliable dependency.
///
/// After `failure_threshold` consecutive failures the breaker opens and
/// every call fails fast with [`CoterieError::Unavailable`] — without
/// invoking the operation — until `recovery_timeout_ms` has elapsed since
/// the last failure. The next call is then attempted as a probe: success
/// closes the breaker, failure reopens it and restarts the cooldown.
///
/// The breaker never retries on its own; retry policy belongs to the
/// coordinator and workflow layers that wrap it.
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    state: Mutex<BreakerState>,
}

impl CircuitBreaker {
    /// Create a breaker for the named dependency.
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            state: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                failure_count: 0,
                last_failure: None,
            }),
        }
    }

    /// Create a breaker with default thresholds.
    pub fn with_defaults(name: impl Into<String>) -> Self {
        Self::new(name, BreakerConfig::default())
    }

    /// The name of the protected dependency.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current state. An elapsed cooldown is only observed by the next call.
    pub fn state(&self) -> CircuitState {
        self.state.lock().state
    }

    /// Current consecutive-failure count.
    pub fn failure_count(&self) -> u32 {
        self.state.lock().failure_count
    }

    /// Run `operation` under the breaker.
    ///
    /// Returns [`CoterieError::Unavailable`] without invoking the operation
    /// while the breaker is open and the cooldown has not elapsed.
    pub async fn call<T, F, Fut>(&self, operation: F) -> CoterieResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = CoterieResult<T>>,
    {
        // Admission check: lock is released before the operation runs.
        {
            let mut guard = self.state.lock();
            if guard.state == CircuitState::Open {
                let cooled_down = guard
                    .last_failure
                    .map(|at| at.elapsed() >= Duration::from_millis(self.config.recovery_timeout_ms))
                    .unwrap_or(true);
                if cooled_down {
                    info!(breaker = %self.name, "circuit half-open, probing");
                    guard.state = CircuitState::HalfOpen;
                } else {
                    debug!(breaker = %self.name, "circuit open, short-circuiting call");
                    return Err(CoterieError::Unavailable(self.name.clone()));
                }
            }
        }

        match operation().await {
            Ok(value) => {
                self.on_success();
                Ok(value)
            }
            Err(e) => {
                self.on_failure();
                Err(e)
            }
        }
    }

    fn on_success(&self) {
        let mut guard = self.state.lock();
        if guard.state != CircuitState::Closed {
            info!(breaker = %self.name, "circuit closed after successful probe");
        }
        guard.failure_count = 0;
        guard.state = CircuitState::Closed;
    }

    fn on_failure(&self) {
        let mut guard = self.state.lock();
        guard.failure_count += 1;
        guard.last_failure = Some(Instant::now());

        let should_open = guard.state == CircuitState::HalfOpen
            || guard.failure_count >= self.config.failure_threshold;
        if should_open && guard.state != CircuitState::Open {
            warn!(
                breaker = %self.name,
                failures = guard.failure_count,
                "circuit opened"
            );
            guard.state = CircuitState::Open;
        }
    }
}
