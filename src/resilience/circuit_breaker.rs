//! Circuit breaker for upstream protection
//!
//! # States
//! - Closed: normal operation, calls pass through
//! - Open: upstream assumed down, calls fail fast
//! - HalfOpen: testing if the upstream recovered
//!
//! # State Transitions
//! ```text
//! Closed → Open:     consecutive failures >= failure_threshold
//! Open → HalfOpen:   recovery_timeout elapsed since last failure
//! HalfOpen → Closed: consecutive probe successes >= success_threshold
//! HalfOpen → Open:   any probe failure
//! ```
//!
//! The check in [`CircuitBreaker::can_execute`] and the transition it may
//! perform are one critical section under a single write lock, so two
//! concurrent callers can never both observe an expired recovery window and
//! both transition to HalfOpen. While HalfOpen, at most
//! `half_open_max_probes` calls are in flight at once; each admitted probe
//! holds a [`ProbeGuard`], and the slot comes back when the guard drops -
//! whether the outcome was recorded, the call errored out early, or the
//! caller's future was cancelled.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::RwLock;

use crate::error::CallError;

/// Circuit breaker state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Circuit is closed - calls flow through
    Closed,
    /// Circuit is open - calls fail fast
    Open,
    /// Testing if upstream recovered - limited probes allowed
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

/// A state change performed by the breaker, reported back to the caller
/// so alerts can be fanned out without the breaker knowing about sinks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateTransition {
    pub from: CircuitState,
    pub to: CircuitState,
}

/// Outcome of a [`CircuitBreaker::can_execute`] check
#[must_use]
#[derive(Debug)]
pub enum Verdict<'a> {
    /// The call may proceed; carries the Open→HalfOpen transition if this
    /// check performed one, and the probe slot guard if one was taken
    Allow(Option<StateTransition>, Option<ProbeGuard<'a>>),
    /// The call must fail fast without touching the transport
    Reject,
}

/// Holds one half-open probe slot; the slot is released when the guard
/// drops.
///
/// A probe whose outcome never reaches the breaker (a client error, an
/// early validation failure, a cancelled caller) frees its slot instead of
/// wedging the breaker in HalfOpen. The epoch ties the guard to the
/// half-open episode it was issued in; a guard that outlives its episode
/// releases nothing.
pub struct ProbeGuard<'a> {
    breaker: &'a CircuitBreaker,
    epoch: u64,
}

impl Drop for ProbeGuard<'_> {
    fn drop(&mut self) {
        self.breaker.release_probe(self.epoch);
    }
}

impl fmt::Debug for ProbeGuard<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProbeGuard")
            .field("target", &self.breaker.target)
            .field("epoch", &self.epoch)
            .finish()
    }
}

/// Configuration for circuit breaker behavior
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures to open the circuit
    pub failure_threshold: u32,
    /// Time to wait before transitioning from Open to HalfOpen
    pub recovery_timeout: Duration,
    /// Consecutive successes in HalfOpen to close the circuit
    pub success_threshold: u32,
    /// Maximum concurrent probes allowed while HalfOpen
    pub half_open_max_probes: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(30),
            success_threshold: 2,
            half_open_max_probes: 1,
        }
    }
}

impl CircuitBreakerConfig {
    /// Validate invariants; called by the client builder
    pub fn validate(&self) -> Result<(), CallError> {
        if self.failure_threshold == 0 {
            return Err(CallError::Config(
                "breaker failure_threshold must be > 0".into(),
            ));
        }
        if self.success_threshold == 0 {
            return Err(CallError::Config(
                "breaker success_threshold must be > 0".into(),
            ));
        }
        if self.recovery_timeout.is_zero() {
            return Err(CallError::Config(
                "breaker recovery_timeout must be > 0".into(),
            ));
        }
        if self.half_open_max_probes == 0 {
            return Err(CallError::Config(
                "breaker half_open_max_probes must be > 0".into(),
            ));
        }
        Ok(())
    }
}

/// Internal state tracking
struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    last_failure_time: Option<Instant>,
    probes_in_flight: u32,
    /// Bumped on every Open→HalfOpen transition; guards from an earlier
    /// half-open episode must not release a later episode's slot
    probe_epoch: u64,
}

impl BreakerState {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            consecutive_successes: 0,
            last_failure_time: None,
            probes_in_flight: 0,
            probe_epoch: 0,
        }
    }
}

/// Per-target circuit breaker
///
/// Lives for the whole process; only [`CircuitBreaker::reset`] (an operator
/// action, never called by the engine) returns it to a fresh Closed state.
pub struct CircuitBreaker {
    target: String,
    config: CircuitBreakerConfig,
    state: RwLock<BreakerState>,
    /// Metrics: times the circuit opened
    open_count: AtomicU64,
    /// Metrics: calls rejected while open
    rejected_count: AtomicU64,
}

impl CircuitBreaker {
    pub fn new(target: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            target: target.into(),
            config,
            state: RwLock::new(BreakerState::new()),
            open_count: AtomicU64::new(0),
            rejected_count: AtomicU64::new(0),
        }
    }

    /// The upstream target this breaker guards
    pub fn target(&self) -> &str {
        &self.target
    }

    /// Current state (for monitoring)
    pub fn current_state(&self) -> CircuitState {
        self.state.read().state
    }

    /// Current consecutive failure count (for monitoring and tests)
    pub fn failure_count(&self) -> u32 {
        self.state.read().consecutive_failures
    }

    /// Times the circuit has opened
    pub fn open_count(&self) -> u64 {
        self.open_count.load(Ordering::Relaxed)
    }

    /// Calls rejected by the open circuit
    pub fn rejected_count(&self) -> u64 {
        self.rejected_count.load(Ordering::Relaxed)
    }

    /// Check whether a call may proceed, performing the timed
    /// Open→HalfOpen transition when the recovery window has elapsed.
    pub fn can_execute(&self) -> Verdict<'_> {
        let mut state = self.state.write();

        match state.state {
            CircuitState::Closed => Verdict::Allow(None, None),

            CircuitState::Open => {
                // Note: clippy suggests `if let ... &&` but that's unstable (RFC 2497)
                #[allow(clippy::collapsible_if)]
                if let Some(last_failure) = state.last_failure_time {
                    if last_failure.elapsed() > self.config.recovery_timeout {
                        state.state = CircuitState::HalfOpen;
                        state.consecutive_successes = 0;
                        state.probe_epoch += 1;
                        state.probes_in_flight = 1; // This call is the probe
                        let guard = ProbeGuard {
                            breaker: self,
                            epoch: state.probe_epoch,
                        };
                        tracing::info!(
                            upstream = %self.target,
                            "circuit breaker transitioning to half-open"
                        );
                        return Verdict::Allow(
                            Some(StateTransition {
                                from: CircuitState::Open,
                                to: CircuitState::HalfOpen,
                            }),
                            Some(guard),
                        );
                    }
                }
                self.rejected_count.fetch_add(1, Ordering::Relaxed);
                Verdict::Reject
            }

            CircuitState::HalfOpen => {
                if state.probes_in_flight < self.config.half_open_max_probes {
                    state.probes_in_flight += 1;
                    let guard = ProbeGuard {
                        breaker: self,
                        epoch: state.probe_epoch,
                    };
                    Verdict::Allow(None, Some(guard))
                } else {
                    self.rejected_count.fetch_add(1, Ordering::Relaxed);
                    Verdict::Reject
                }
            }
        }
    }

    /// Give a probe slot back; called from [`ProbeGuard::drop`] only.
    fn release_probe(&self, epoch: u64) {
        let mut state = self.state.write();
        if state.state == CircuitState::HalfOpen && state.probe_epoch == epoch {
            state.probes_in_flight = state.probes_in_flight.saturating_sub(1);
        }
    }

    /// Record a successful call
    pub fn record_success(&self) -> Option<StateTransition> {
        let mut state = self.state.write();
        state.consecutive_failures = 0;

        if state.state == CircuitState::HalfOpen {
            // The probe slot itself comes back when its ProbeGuard drops
            state.consecutive_successes += 1;
            if state.consecutive_successes >= self.config.success_threshold {
                state.state = CircuitState::Closed;
                state.consecutive_successes = 0;
                state.probes_in_flight = 0;
                tracing::info!(
                    upstream = %self.target,
                    "circuit breaker closed - upstream recovered"
                );
                return Some(StateTransition {
                    from: CircuitState::HalfOpen,
                    to: CircuitState::Closed,
                });
            }
        }
        None
    }

    /// Record a failed call
    pub fn record_failure(&self) -> Option<StateTransition> {
        let mut state = self.state.write();
        state.consecutive_successes = 0;
        state.consecutive_failures += 1;
        state.last_failure_time = Some(Instant::now());

        match state.state {
            CircuitState::Closed => {
                if state.consecutive_failures >= self.config.failure_threshold {
                    state.state = CircuitState::Open;
                    self.open_count.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(
                        upstream = %self.target,
                        failures = state.consecutive_failures,
                        "circuit breaker opened - too many failures"
                    );
                    return Some(StateTransition {
                        from: CircuitState::Closed,
                        to: CircuitState::Open,
                    });
                }
                None
            }
            CircuitState::HalfOpen => {
                // Any probe failure immediately re-opens the circuit
                state.state = CircuitState::Open;
                state.probes_in_flight = 0;
                self.open_count.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    upstream = %self.target,
                    "circuit breaker re-opened - probe failed"
                );
                Some(StateTransition {
                    from: CircuitState::HalfOpen,
                    to: CircuitState::Open,
                })
            }
            CircuitState::Open => {
                // Already open; the refreshed failure time extends the window
                None
            }
        }
    }

    /// Operator action: return the breaker to a fresh Closed state.
    ///
    /// The engine never calls this.
    pub fn reset(&self) {
        let mut state = self.state.write();
        let epoch = state.probe_epoch;
        *state = BreakerState::new();
        // Keep advancing so guards issued before the reset stay stale
        state.probe_epoch = epoch + 1;
        tracing::info!(upstream = %self.target, "circuit breaker reset by operator");
    }
}

/// Breaker granularity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BreakerScope {
    /// One breaker per target host (default): failures against one upstream
    /// never poison calls to another
    #[default]
    PerHost,
    /// A single breaker shared by every call through the client
    Global,
}

const GLOBAL_TARGET: &str = "upstream";

/// Lazily-populated map of target → breaker
///
/// Breakers are created on first use and live for the process lifetime.
pub struct BreakerRegistry {
    scope: BreakerScope,
    config: CircuitBreakerConfig,
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
}

impl BreakerRegistry {
    pub fn new(scope: BreakerScope, config: CircuitBreakerConfig) -> Self {
        Self {
            scope,
            config,
            breakers: RwLock::new(HashMap::new()),
        }
    }

    pub fn scope(&self) -> BreakerScope {
        self.scope
    }

    /// Get or create the breaker guarding `target`
    ///
    /// In [`BreakerScope::Global`] mode every target maps to the same
    /// breaker.
    pub fn breaker_for(&self, target: &str) -> Arc<CircuitBreaker> {
        let key = match self.scope {
            BreakerScope::PerHost => target,
            BreakerScope::Global => GLOBAL_TARGET,
        };

        if let Some(breaker) = self.breakers.read().get(key) {
            return Arc::clone(breaker);
        }

        let mut breakers = self.breakers.write();
        Arc::clone(
            breakers
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(CircuitBreaker::new(key, self.config.clone()))),
        )
    }

    /// Snapshot of all known breakers (for monitoring)
    pub fn all(&self) -> Vec<Arc<CircuitBreaker>> {
        self.breakers.read().values().cloned().collect()
    }
}
