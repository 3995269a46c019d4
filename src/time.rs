//! Time sources and delay arithmetic.
//!
//! All backends work in whole unix seconds. The clock is injected everywhere a
//! timestamp is taken so that delay and lease behaviour can be driven
//! deterministically.

use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};

/// A source of the current unix timestamp, in seconds.
pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> i64;
}

/// Wall-clock time.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> i64 {
        Utc::now().timestamp()
    }
}

/// A clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    pub fn new(now: i64) -> Self {
        Self {
            now: AtomicI64::new(now),
        }
    }

    pub fn set(&self, now: i64) {
        self.now.store(now, Ordering::SeqCst);
    }

    pub fn advance(&self, seconds: i64) {
        self.now.fetch_add(seconds, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// When a delayed job should become available.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Delay {
    /// Relative to now.
    Seconds(u64),
    /// An absolute point in time.
    At(DateTime<Utc>),
}

impl Delay {
    /// Resolves this delay into the unix timestamp at which the job becomes
    /// available.
    pub fn available_at(&self, now: i64) -> i64 {
        match self {
            Delay::Seconds(seconds) => {
                now.saturating_add(i64::try_from(*seconds).unwrap_or(i64::MAX))
            },
            Delay::At(at) => at.timestamp(),
        }
    }

    pub fn is_immediate(&self, now: i64) -> bool {
        self.available_at(now) <= now
    }
}

impl From<u64> for Delay {
    fn from(seconds: u64) -> Self {
        Delay::Seconds(seconds)
    }
}

impl From<Duration> for Delay {
    fn from(duration: Duration) -> Self {
        Delay::Seconds(duration.as_secs())
    }
}

impl From<DateTime<Utc>> for Delay {
    fn from(at: DateTime<Utc>) -> Self {
        Delay::At(at)
    }
}

impl fmt::Display for Delay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Delay::Seconds(seconds) => write!(f, "{seconds}s"),
            Delay::At(at) => write!(f, "{}", at.to_rfc3339()),
        }
    }
}
