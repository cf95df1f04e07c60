//! Monotonic host clock shared by both stream directions

use std::fmt;
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;

/// Process-wide origin of the host clock.
static HOST_EPOCH: Lazy<Instant> = Lazy::new(Instant::now);

/// A point on the host clock, in nanoseconds since the clock origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct HostTime(u64);

impl HostTime {
    pub const ZERO: HostTime = HostTime(0);

    /// Current host time.
    pub fn now() -> Self {
        Self::from_duration(HOST_EPOCH.elapsed())
    }

    pub const fn from_nanos(nanos: u64) -> Self {
        Self(nanos)
    }

    pub fn from_duration(d: Duration) -> Self {
        // u64 nanoseconds covers ~584 years of uptime
        Self(d.as_nanos().min(u64::MAX as u128) as u64)
    }

    pub const fn as_nanos(self) -> u64 {
        self.0
    }

    pub fn as_duration(self) -> Duration {
        Duration::from_nanos(self.0)
    }

    /// Time elapsed on the host clock since `self`, zero if `self` is in the future.
    pub fn elapsed(self) -> Duration {
        Self::now().as_duration().saturating_sub(self.as_duration())
    }
}

impl fmt::Display for HostTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.6}s", self.as_duration().as_secs_f64())
    }
}
