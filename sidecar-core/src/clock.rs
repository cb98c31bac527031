//! Explicit clock dependency (spec §9 Design Note: "Replace [the process-wide
//! clock] with an explicit dependency record passed at construction; tests
//! inject a fixed clock.")

use chrono::{DateTime, Utc};
use std::sync::{Arc, RwLock};

/// Anything that can report the current time. Production code uses
/// [`SystemClock`]; tests use [`FixedClock`] to assert exact timer behavior
/// (settle windows, cache staleness, heartbeat cadence) without sleeping.
pub trait Clock: Send + Sync + std::fmt::Debug {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock tests can advance deterministically.
#[derive(Debug, Clone)]
pub struct FixedClock {
    now: Arc<RwLock<DateTime<Utc>>>,
}

impl FixedClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(RwLock::new(start)),
        }
    }

    pub fn advance(&self, duration: chrono::Duration) {
        let mut guard = self.now.write().expect("clock lock poisoned");
        *guard += duration;
    }

    pub fn set(&self, at: DateTime<Utc>) {
        *self.now.write().expect("clock lock poisoned") = at;
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.read().expect("clock lock poisoned")
    }
}

pub type SharedClock = Arc<dyn Clock>;
