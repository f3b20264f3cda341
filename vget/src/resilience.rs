//! Retry backoff and circuit breaking for flaky download targets.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use rand::Rng;
use rand::RngExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::OperationError;

/// Exponential backoff with a jitter band and a hard cap.
///
/// The ideal delay for attempt `n` is `initial * multiplier^n`; the actual
/// delay multiplies it by a factor drawn uniformly from
/// `[jitter_min, jitter_max]` and is then clamped to `max_delay_ms`. Pure and
/// stateless; [`BackoffPolicy::delay_with_rng`] makes it reproducible.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    /// Initial delay in milliseconds.
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    /// Hard cap on any single delay in milliseconds.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Multiplier applied per attempt.
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    /// Lower bound of the jitter band.
    #[serde(default = "default_jitter_min")]
    pub jitter_min: f64,
    /// Upper bound of the jitter band.
    #[serde(default = "default_jitter_max")]
    pub jitter_max: f64,
}

fn default_initial_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    30000
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_jitter_min() -> f64 {
    0.5
}

fn default_jitter_max() -> f64 {
    1.5
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            multiplier: default_multiplier(),
            jitter_min: default_jitter_min(),
            jitter_max: default_jitter_max(),
        }
    }
}

impl BackoffPolicy {
    /// Delay before re-running attempt `attempt + 1` (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let jitter = self.jitter_min + (self.jitter_max - self.jitter_min) * rand::random::<f64>();
        self.delay_with_jitter(attempt, jitter)
    }

    /// Same as [`delay_for_attempt`](Self::delay_for_attempt) but drawing the
    /// jitter factor from the supplied RNG, for reproducible tests.
    pub fn delay_with_rng<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let jitter = self.jitter_min + (self.jitter_max - self.jitter_min) * rng.random::<f64>();
        self.delay_with_jitter(attempt, jitter)
    }

    /// Ideal (jitter-free) delay for an attempt, clamped to the cap.
    pub fn ideal_delay(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.ideal_delay_ms(attempt).min(self.max_delay_ms as f64) as u64)
    }

    fn ideal_delay_ms(&self, attempt: u32) -> f64 {
        self.initial_delay_ms as f64 * self.multiplier.powi(attempt as i32)
    }

    fn delay_with_jitter(&self, attempt: u32, jitter: f64) -> Duration {
        let delay_ms = (self.ideal_delay_ms(attempt) * jitter).min(self.max_delay_ms as f64);
        Duration::from_millis(delay_ms.max(0.0) as u64)
    }
}

/// The retry contract handed to the supervisor: how many attempts, how long
/// between them, and which failures qualify.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the first one.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Backoff applied between attempts.
    #[serde(default)]
    pub backoff: BackoffPolicy,
}

fn default_max_attempts() -> u32 {
    3
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff: BackoffPolicy::default(),
        }
    }
}

impl RetryPolicy {
    /// A policy that runs the operation exactly once.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Whether `error` on 0-indexed `attempt` leaves budget for another try.
    pub fn permits_retry(&self, error: &OperationError, attempt: u32) -> bool {
        error.is_retryable() && attempt + 1 < self.max_attempts.max(1)
    }
}

/// State of a circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation.
    Closed,
    /// Fast-failing, nothing is spawned.
    Open,
    /// One trial attempt is permitted.
    HalfOpen,
}

/// Per-target failure gate.
///
/// Closed → Open after `failure_threshold` consecutive failures; Open →
/// HalfOpen once the cooldown has elapsed since the last failure (evaluated
/// on read); in HalfOpen a single failure reopens the circuit immediately and
/// a success closes it with the failure count reset.
pub struct CircuitBreaker {
    state: RwLock<CircuitState>,
    failure_count: AtomicU32,
    failure_threshold: u32,
    opened_at: RwLock<Option<Instant>>,
    cooldown: Duration,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, cooldown: Duration) -> Self {
        Self {
            state: RwLock::new(CircuitState::Closed),
            failure_count: AtomicU32::new(0),
            failure_threshold: failure_threshold.max(1),
            opened_at: RwLock::new(None),
            cooldown,
        }
    }

    /// Current state, after applying the Open → HalfOpen cooldown transition.
    pub fn state(&self) -> CircuitState {
        self.check_cooldown();
        *self.state.read()
    }

    /// Whether an attempt may be issued right now.
    pub fn is_allowed(&self) -> bool {
        !matches!(self.state(), CircuitState::Open)
    }

    /// Remaining cooldown while open, zero otherwise.
    pub fn retry_after(&self) -> Duration {
        if self.state() != CircuitState::Open {
            return Duration::ZERO;
        }
        self.opened_at
            .read()
            .map(|at| self.cooldown.saturating_sub(at.elapsed()))
            .unwrap_or(Duration::ZERO)
    }

    pub fn record_success(&self) {
        let previous = *self.state.read();
        *self.state.write() = CircuitState::Closed;
        self.failure_count.store(0, Ordering::SeqCst);
        *self.opened_at.write() = None;
        if previous != CircuitState::Closed {
            debug!("circuit closed after successful attempt");
        }
    }

    pub fn record_failure(&self) {
        let state = self.state();
        match state {
            CircuitState::Closed => {
                let failures = self.failure_count.fetch_add(1, Ordering::SeqCst) + 1;
                if failures >= self.failure_threshold {
                    *self.state.write() = CircuitState::Open;
                    *self.opened_at.write() = Some(Instant::now());
                    warn!(failures, "circuit opened after consecutive failures");
                }
            }
            CircuitState::HalfOpen => {
                // The single trial failed; the cooldown clock starts over.
                *self.state.write() = CircuitState::Open;
                *self.opened_at.write() = Some(Instant::now());
                warn!("circuit reopened after failed trial attempt");
            }
            CircuitState::Open => {
                *self.opened_at.write() = Some(Instant::now());
            }
        }
    }

    fn check_cooldown(&self) {
        let state = *self.state.read();
        if state == CircuitState::Open
            && let Some(opened_at) = *self.opened_at.read()
            && opened_at.elapsed() >= self.cooldown
        {
            *self.state.write() = CircuitState::HalfOpen;
            debug!("circuit half-open, one trial attempt permitted");
        }
    }
}

/// Shares one [`CircuitBreaker`] per logical target (remote host) across the
/// lifetime of the orchestrating process.
pub struct CircuitBreakerRegistry {
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
    failure_threshold: u32,
    cooldown: Duration,
}

impl CircuitBreakerRegistry {
    pub fn new(failure_threshold: u32, cooldown: Duration) -> Self {
        Self {
            breakers: RwLock::new(HashMap::new()),
            failure_threshold,
            cooldown,
        }
    }

    /// Get or create the breaker for a target.
    pub fn get(&self, target: &str) -> Arc<CircuitBreaker> {
        {
            let breakers = self.breakers.read();
            if let Some(breaker) = breakers.get(target) {
                return breaker.clone();
            }
        }

        let mut breakers = self.breakers.write();
        breakers
            .entry(target.to_string())
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::new(self.failure_threshold, self.cooldown))
            })
            .clone()
    }
}
