use log::warn;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Process-wide "do not call" switch for an exhausted error budget.
///
/// A 420 engages it; until the reset window elapses every request is refused
/// before it reaches the network, since any call made during the window keeps
/// the penalty alive.
#[derive(Debug, Default)]
pub struct LockoutGate {
    until: Mutex<Option<Instant>>,
}

impl LockoutGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Locks for `window`. An existing lockout that ends later is kept.
    pub fn engage(&self, window: Duration) {
        let candidate = Instant::now() + window;
        let mut until = self.until.lock().unwrap_or_else(|e| e.into_inner());
        match *until {
            Some(current) if current >= candidate => {}
            _ => {
                warn!("error budget exhausted; refusing calls for {}s", window.as_secs());
                *until = Some(candidate);
            }
        }
    }

    /// Time left on the lockout, or `None` when calls are allowed.
    pub fn remaining(&self) -> Option<Duration> {
        let mut until = self.until.lock().unwrap_or_else(|e| e.into_inner());
        let deadline = (*until)?;
        let now = Instant::now();
        if now >= deadline {
            *until = None;
            return None;
        }
        Some(deadline - now)
    }

    pub fn is_locked(&self) -> bool {
        self.remaining().is_some()
    }

    pub fn release(&self) {
        *self.until.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }
}
