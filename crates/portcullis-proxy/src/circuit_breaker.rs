//! Circuit breaker guarding forwarded calls.
//!
//! ```text
//! Closed --(failures >= threshold)--> Open
//! Open --(reset window elapsed, one probe admitted)--> HalfOpen
//! HalfOpen --(probe succeeds)--> Closed
//! HalfOpen --(probe fails)--> Open
//! HalfOpen --(probe abandoned)--> HalfOpen, next caller probes
//! ```

use parking_lot::Mutex;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerSettings {
    /// Consecutive failures that trip the breaker.
    pub failure_threshold: u32,
    /// Time spent open before a single probe is admitted.
    pub reset_after: Duration,
}

/// Observable breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
enum State {
    Closed { failures: u32 },
    Open { since: Instant },
    HalfOpen { probing: bool },
}

#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    settings: BreakerSettings,
    state: Mutex<State>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, settings: BreakerSettings) -> Self {
        Self {
            name: name.into(),
            settings,
            state: Mutex::new(State::Closed { failures: 0 }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn settings(&self) -> BreakerSettings {
        self.settings
    }

    pub fn state(&self) -> BreakerState {
        match *self.state.lock() {
            State::Closed { .. } => BreakerState::Closed,
            State::Open { .. } => BreakerState::Open,
            State::HalfOpen { .. } => BreakerState::HalfOpen,
        }
    }

    /// Ask to send one call through.
    ///
    /// Once the reset window has elapsed exactly one caller is admitted as the
    /// probe; everyone else gets `None` until the probe reports back. A probe
    /// permit dropped without an outcome hands the probe slot to the next
    /// caller.
    pub fn acquire(&self) -> Option<BreakerPermit<'_>> {
        let mut state = self.state.lock();
        let probe = match *state {
            State::Closed { .. } => false,
            State::Open { since } => {
                if since.elapsed() < self.settings.reset_after {
                    return None;
                }
                info!(breaker = %self.name, "Circuit breaker half-open, admitting probe");
                *state = State::HalfOpen { probing: true };
                true
            }
            State::HalfOpen { ref mut probing } => {
                if *probing {
                    return None;
                }
                *probing = true;
                true
            }
        };
        Some(BreakerPermit {
            breaker: self,
            probe,
            settled: false,
        })
    }

    pub fn success(&self) {
        let mut state = self.state.lock();
        match *state {
            State::Closed { ref mut failures } => *failures = 0,
            State::HalfOpen { .. } => {
                info!(breaker = %self.name, "Circuit breaker reset");
                *state = State::Closed { failures: 0 };
            }
            // A call admitted before the breaker tripped finished late.
            State::Open { .. } => {}
        }
    }

    pub fn fail(&self) {
        let mut state = self.state.lock();
        match *state {
            State::Closed { ref mut failures } => {
                *failures += 1;
                if *failures >= self.settings.failure_threshold {
                    warn!(
                        breaker = %self.name,
                        failures = *failures,
                        "Circuit breaker tripped"
                    );
                    *state = State::Open {
                        since: Instant::now(),
                    };
                }
            }
            State::HalfOpen { .. } => {
                warn!(breaker = %self.name, "Circuit breaker probe failed, re-opening");
                *state = State::Open {
                    since: Instant::now(),
                };
            }
            State::Open { .. } => {}
        }
    }
}

/// Admission to one call through a [`CircuitBreaker`].
#[must_use = "a permit dropped without an outcome records nothing"]
#[derive(Debug)]
pub struct BreakerPermit<'a> {
    breaker: &'a CircuitBreaker,
    probe: bool,
    settled: bool,
}

impl BreakerPermit<'_> {
    pub fn is_probe(&self) -> bool {
        self.probe
    }

    pub fn success(mut self) {
        self.settled = true;
        self.breaker.success();
    }

    pub fn fail(mut self) {
        self.settled = true;
        self.breaker.fail();
    }
}

impl Drop for BreakerPermit<'_> {
    fn drop(&mut self) {
        if self.settled || !self.probe {
            return;
        }
        let mut state = self.breaker.state.lock();
        if let State::HalfOpen { ref mut probing } = *state {
            debug!(breaker = %self.breaker.name, "Probe abandoned, releasing probe slot");
            *probing = false;
        }
    }
}
