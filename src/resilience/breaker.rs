use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// Circuit breaker states representing the current operational mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CircuitState {
    /// Normal operation, calls pass through
    Closed,
    /// Failing fast, calls rejected without touching the upstream
    Open,
    /// Cool-down elapsed, a single probe call is allowed through
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub cool_down: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cool_down: Duration::from_secs(30),
        }
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
}

/// Per-upstream circuit breaker. All transitions happen under one mutex so
/// they are serialized; nothing here blocks on I/O.
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(name: String, config: BreakerConfig) -> Self {
        Self {
            name,
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                probe_in_flight: false,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> CircuitState {
        let mut inner = self.inner.lock();
        // surface HalfOpen once the cool-down has elapsed, even before the
        // next call arrives
        if inner.state == CircuitState::Open && self.cool_down_elapsed(&inner) {
            inner.state = CircuitState::HalfOpen;
            inner.probe_in_flight = false;
        }
        inner.state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.inner.lock().consecutive_failures
    }

    pub fn opened_at(&self) -> Option<Instant> {
        self.inner.lock().opened_at
    }

    /// Decide whether a call may proceed. While Open this fails fast with
    /// `CircuitOpen`; after the cool-down exactly one probe is admitted.
    pub fn try_acquire(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open => {
                if self.cool_down_elapsed(&inner) {
                    inner.state = CircuitState::HalfOpen;
                    inner.probe_in_flight = true;
                    info!(breaker = %self.name, "circuit half-open, admitting probe");
                    Ok(())
                } else {
                    Err(Error::CircuitOpen(self.name.clone()))
                }
            }
            CircuitState::HalfOpen => {
                if inner.probe_in_flight {
                    Err(Error::CircuitOpen(format!("{} (probe in flight)", self.name)))
                } else {
                    inner.probe_in_flight = true;
                    Ok(())
                }
            }
        }
    }

    /// Record an upstream response that signals health. In HalfOpen this
    /// closes the circuit and resets the failure count.
    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Closed;
                inner.consecutive_failures = 0;
                inner.opened_at = None;
                inner.probe_in_flight = false;
                info!(breaker = %self.name, "circuit closed (recovered)");
            }
            CircuitState::Closed => {
                inner.consecutive_failures = 0;
            }
            CircuitState::Open => {
                debug!(breaker = %self.name, "success recorded while circuit open");
            }
        }
    }

    /// Record a transient upstream failure. Reaching the threshold while
    /// Closed, or any failure of the HalfOpen probe, opens the circuit.
    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.config.failure_threshold {
                    Self::open_locked(&mut inner, &self.name, &self.config);
                }
            }
            CircuitState::HalfOpen => {
                inner.consecutive_failures += 1;
                Self::open_locked(&mut inner, &self.name, &self.config);
            }
            CircuitState::Open => {}
        }
    }

    /// Force the circuit open (operational escape hatch).
    pub fn force_open(&self) {
        let mut inner = self.inner.lock();
        warn!(breaker = %self.name, "circuit forced open");
        Self::open_locked(&mut inner, &self.name, &self.config);
    }

    /// Force the circuit closed.
    pub fn force_closed(&self) {
        let mut inner = self.inner.lock();
        warn!(breaker = %self.name, "circuit forced closed");
        inner.state = CircuitState::Closed;
        inner.consecutive_failures = 0;
        inner.opened_at = None;
        inner.probe_in_flight = false;
    }

    fn open_locked(inner: &mut BreakerInner, name: &str, config: &BreakerConfig) {
        inner.state = CircuitState::Open;
        inner.opened_at = Some(Instant::now());
        inner.probe_in_flight = false;
        warn!(
            breaker = %name,
            consecutive_failures = inner.consecutive_failures,
            cool_down_secs = config.cool_down.as_secs(),
            "circuit opened (failing fast)"
        );
    }

    fn cool_down_elapsed(&self, inner: &BreakerInner) -> bool {
        inner
            .opened_at
            .map(|at| at.elapsed() >= self.config.cool_down)
            .unwrap_or(true)
    }
}

/// Process-wide registry holding one breaker per upstream identity.
pub struct BreakerRegistry {
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    config: BreakerConfig,
}

impl BreakerRegistry {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            breakers: DashMap::new(),
            config,
        }
    }

    /// The breaker for an upstream identity, created on first use.
    pub fn breaker(&self, id: &str) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(id.to_string())
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::new(id.to_string(), self.config.clone()))
            })
            .clone()
    }

    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.breakers.is_empty()
    }
}
