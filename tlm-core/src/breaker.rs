//! Three-state circuit breaker guarding the output.
//!
//! Closed lets every export through. After `failure_threshold` consecutive
//! failures it opens and refuses exports for `open_timeout_ms`. The next
//! request after that moves it to half-open, where one trial request at a time goes
//! through. `success_threshold` successful trials close it again and any
//! failure reopens it.

use std::{
    sync::{
        atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering},
        Mutex,
    },
    time::{Duration, Instant},
};

use serde::Deserialize;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CircuitState {
    Closed = 0,
    Open = 1,
    HalfOpen = 2,
}

impl From<u8> for CircuitState {
    fn from(val: u8) -> Self {
        match val {
            1 => CircuitState::Open,
            2 => CircuitState::HalfOpen,
            _ => CircuitState::Closed,
        }
    }
}

#[derive(Deserialize, Debug, Clone, Copy)]
pub struct BreakerConfig {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,
    #[serde(default = "default_open_timeout_ms")]
    pub open_timeout_ms: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            success_threshold: default_success_threshold(),
            open_timeout_ms: default_open_timeout_ms(),
        }
    }
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_success_threshold() -> u32 {
    1
}

fn default_open_timeout_ms() -> u64 {
    5_000
}

#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    state: AtomicU8,
    consecutive_failures: AtomicU32,
    half_open_successes: AtomicU32,
    trial: AtomicBool,
    opened_at: Mutex<Option<Instant>>,
    config: BreakerConfig,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            name: name.into(),
            state: AtomicU8::new(CircuitState::Closed as u8),
            consecutive_failures: AtomicU32::new(0),
            half_open_successes: AtomicU32::new(0),
            trial: AtomicBool::new(false),
            opened_at: Mutex::new(None),
            config,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> CircuitState {
        self.state.load(Ordering::Acquire).into()
    }

    /// Whether a request may go through now. An open breaker whose timeout
    /// elapsed moves to half-open. While half-open only the single caller
    /// holding the trial slot is let through, until it reports back with
    /// [`record_success`](Self::record_success),
    /// [`record_failure`](Self::record_failure) or
    /// [`release_trial`](Self::release_trial).
    pub fn allow_request(&self) -> bool {
        match self.state() {
            CircuitState::Closed => true,
            CircuitState::HalfOpen => self.take_trial(),
            CircuitState::Open => {
                if self.remaining_open().is_some() {
                    return false;
                }
                if self
                    .state
                    .compare_exchange(
                        CircuitState::Open as u8,
                        CircuitState::HalfOpen as u8,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok()
                {
                    self.half_open_successes.store(0, Ordering::Release);
                    self.trial.store(false, Ordering::Release);
                    info!("circuit {} is half-open, trying the target", self.name);
                }
                self.take_trial()
            }
        }
    }

    fn take_trial(&self) -> bool {
        self.trial
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Gives the trial slot back when a request ended without telling
    /// anything about the target's health.
    pub fn release_trial(&self) {
        self.trial.store(false, Ordering::Release);
    }

    /// Read-only check used for admission control: true while the breaker is
    /// open and still cooling down.
    pub fn is_rejecting(&self) -> bool {
        self.state() == CircuitState::Open && self.remaining_open().is_some()
    }

    /// Time left before an open breaker lets a trial request through.
    pub fn remaining_open(&self) -> Option<Duration> {
        if self.state() != CircuitState::Open {
            return None;
        }
        let opened_at = (*self.opened_at.lock().unwrap_or_else(|e| e.into_inner()))?;
        let timeout = Duration::from_millis(self.config.open_timeout_ms);
        let elapsed = opened_at.elapsed();
        (elapsed < timeout).then(|| timeout - elapsed)
    }

    pub fn record_success(&self) {
        self.consecutive_failures.store(0, Ordering::Release);
        if self.state() == CircuitState::HalfOpen {
            let successes = self.half_open_successes.fetch_add(1, Ordering::AcqRel) + 1;
            if successes >= self.config.success_threshold {
                self.state
                    .store(CircuitState::Closed as u8, Ordering::Release);
                info!("circuit {} is closed again", self.name);
            }
        }
        self.release_trial();
    }

    pub fn record_failure(&self) {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;
        let should_open = match self.state() {
            CircuitState::HalfOpen => true,
            CircuitState::Closed => failures >= self.config.failure_threshold,
            CircuitState::Open => false,
        };
        if should_open {
            *self.opened_at.lock().unwrap_or_else(|e| e.into_inner()) = Some(Instant::now());
            self.state.store(CircuitState::Open as u8, Ordering::Release);
            warn!(
                "circuit {} is open after {failures} consecutive failures",
                self.name
            );
        }
        self.release_trial();
    }
}
