//! The single source of non-determinism in the freshness math: every "now"
//! reading in this crate goes through a [`Clock`] instead of calling
//! [`SystemTime::now`] directly, so tests can pin time exactly.

use std::sync::Arc;
use std::time::SystemTime;

/// A replaceable source of the current UTC instant.
pub trait Clock: Send + Sync {
    fn now(&self) -> SystemTime;
}

/// The default clock: real UTC wall time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }
}

/// A clock pinned to a fixed instant, for deterministic tests.
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub SystemTime);

impl Clock for FixedClock {
    fn now(&self) -> SystemTime {
        self.0
    }
}

pub fn system_clock() -> Arc<dyn Clock> {
    Arc::new(SystemClock)
}
