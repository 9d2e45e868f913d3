// SPDX-License-Identifier: MIT OR Apache-2.0

//! The only time source inside the engine.
//!
//! Deterministic mode (`ZEO_FIXED_TIME`) swaps [`SystemClock`] for a
//! [`FixedClock`], which makes event timestamps, lease arithmetic, and
//! backoff windows reproducible across replays.

use chrono::{DateTime, TimeZone, Utc};
use std::sync::Arc;

/// A monotonic source of wall-clock timestamps.
pub trait Clock: Send + Sync {
    /// The current instant.
    fn now(&self) -> DateTime<Utc>;
}

/// The real system clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock pinned to a fixed instant.
#[derive(Debug, Clone, Copy)]
pub struct FixedClock {
    instant: DateTime<Utc>,
}

impl FixedClock {
    /// Pin the clock to the given instant.
    #[must_use]
    pub fn new(instant: DateTime<Utc>) -> Self {
        Self { instant }
    }

    /// Pin the clock to `epoch + secs`.
    ///
    /// This is the shape `ZEO_FIXED_TIME=<secs>` takes.
    #[must_use]
    pub fn from_epoch_secs(secs: i64) -> Self {
        Self {
            instant: Utc.timestamp_opt(secs, 0).single().unwrap_or_default(),
        }
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.instant
    }
}

/// Shared clock handle passed through constructors.
pub type SharedClock = Arc<dyn Clock>;

/// A clock tests can step forward explicitly.
#[derive(Debug, Default)]
pub struct ManualClock {
    instant: std::sync::Mutex<DateTime<Utc>>,
}

impl ManualClock {
    /// Start the clock at the given instant.
    #[must_use]
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            instant: std::sync::Mutex::new(start),
        }
    }

    /// Start the clock at `epoch + secs`.
    #[must_use]
    pub fn from_epoch_secs(secs: i64) -> Self {
        Self::new(Utc.timestamp_opt(secs, 0).single().unwrap_or_default())
    }

    /// Step the clock forward.
    pub fn advance(&self, delta: chrono::Duration) {
        let mut guard = self.instant.lock().expect("manual clock lock poisoned");
        *guard += delta;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.instant.lock().expect("manual clock lock poisoned")
    }
}
