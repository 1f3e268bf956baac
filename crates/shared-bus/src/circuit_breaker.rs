//! Circuit breaker for broker-facing operations.
//!
//! One breaker exists per named operation: `publish`, and one per
//! `stream:group` consumer. It serves two purposes at once:
//!
//! - **Transient backoff**: every failure returns an exponential delay
//!   (base 100ms, doubling, capped at 30s) with up to 30% jitter.
//! - **Sustained-outage protection**: failures past the attempt threshold
//!   are counted; enough of them open the circuit, and while open every
//!   failure returns a long fixed delay without counting.
//!
//! # Circuit Breaker States
//!
//! ```text
//!                 attempt > max_attempts, failures >= max_failures
//!      ┌──────────┐ ───────────────────────────────► ┌──────────┐
//!      │  CLOSED  │                                  │   OPEN   │
//!      │ (backoff)│ ◄─────────────────────────────── │(long wait)│
//!      └──────────┘    reset() or open window ends   └──────────┘
//! ```

use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rand::Rng;
use tracing::{debug, warn};

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation - failures get exponential backoff
    Closed,
    /// Sustained failure - failures get the long fixed delay
    Open,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
        }
    }
}

/// Circuit breaker configuration
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Attempts after which failures start counting toward opening
    pub max_attempts: u32,
    /// Counted failures that open the circuit
    pub max_failures: u32,
    /// How long the circuit stays open
    pub open_duration: Duration,
    /// Delay returned while the circuit is open
    pub open_delay: Duration,
    /// First backoff step
    pub base_delay: Duration,
    /// Backoff cap
    pub max_delay: Duration,
    /// Maximum jitter as a fraction of the delay
    pub jitter_ratio: f64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            max_failures: 5,
            open_duration: Duration::from_secs(60),
            open_delay: Duration::from_secs(60),
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            jitter_ratio: 0.3,
        }
    }
}

#[derive(Debug, Default)]
struct BreakerState {
    failures: u32,
    open_until: Option<Instant>,
}

/// Failure tracker for one named operation.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    state: Mutex<BreakerState>,
}

impl CircuitBreaker {
    /// Create a closed breaker.
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            state: Mutex::new(BreakerState::default()),
        }
    }

    /// Operation this breaker guards.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Record a failure of the given attempt and return how long to wait.
    pub fn on_failure(&self, attempt: u32) -> Duration {
        let now = Instant::now();
        let mut state = self.state.lock();

        if let Some(open_until) = state.open_until {
            if now < open_until {
                debug!(
                    operation = %self.name,
                    remaining_ms = (open_until - now).as_millis() as u64,
                    "Circuit open, returning long delay"
                );
                return self.config.open_delay;
            }
            state.open_until = None;
        }

        if attempt > self.config.max_attempts {
            state.failures += 1;
            if state.failures >= self.config.max_failures {
                warn!(
                    operation = %self.name,
                    failures = state.failures,
                    open_secs = self.config.open_duration.as_secs(),
                    "Circuit breaker opening due to sustained failures"
                );
                state.open_until = Some(now + self.config.open_duration);
                return self.config.open_delay;
            }
        }

        with_jitter(
            backoff_delay(attempt, self.config.base_delay, self.config.max_delay),
            self.config.jitter_ratio,
        )
    }

    /// Zero the failure count and close the circuit.
    pub fn reset(&self) {
        let mut state = self.state.lock();
        if state.open_until.is_some() || state.failures > 0 {
            debug!(operation = %self.name, "Circuit breaker reset");
        }
        state.failures = 0;
        state.open_until = None;
    }

    /// Returns true while the open window has not elapsed.
    pub fn is_open(&self) -> bool {
        self.state
            .lock()
            .open_until
            .is_some_and(|until| Instant::now() < until)
    }

    /// Current state.
    pub fn state(&self) -> CircuitState {
        if self.is_open() {
            CircuitState::Open
        } else {
            CircuitState::Closed
        }
    }

    /// Failures counted toward opening.
    pub fn failures(&self) -> u32 {
        self.state.lock().failures
    }
}

/// Exponential delay for `attempt` (1-based): `base * 2^(attempt-1)`, capped.
pub fn backoff_delay(attempt: u32, base: Duration, cap: Duration) -> Duration {
    let exponent = attempt.saturating_sub(1).min(31);
    base.saturating_mul(1u32 << exponent).min(cap)
}

/// Add up to `ratio * delay` of random jitter.
pub fn with_jitter(delay: Duration, ratio: f64) -> Duration {
    if ratio <= 0.0 || delay.is_zero() {
        return delay;
    }
    let factor = rand::thread_rng().gen_range(0.0..=ratio);
    delay + delay.mul_f64(factor)
}
