//! Staleness evaluation for fetched data.
//!
//! Data is stale once `now - last_updated > stale_time`. Data that has never
//! been fetched is neither fresh nor stale: automatic refetch triggers leave
//! it alone and wait for the first explicit or mount-time fetch.

use chrono::{DateTime, Utc};
use std::time::Duration;

/// Freshness of a query's data at a point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    /// No successful fetch has been recorded.
    Unknown,
    /// Within the staleness window.
    Fresh {
        /// How long ago the data was fetched.
        age: Duration,
    },
    /// Past the staleness window.
    Stale {
        /// How long ago the data was fetched.
        age: Duration,
    },
}

impl Freshness {
    /// Classify data last updated at `last_updated` against `stale_time`.
    pub fn evaluate(
        last_updated: Option<DateTime<Utc>>,
        stale_time: Duration,
        now: DateTime<Utc>,
    ) -> Self {
        let Some(last_updated) = last_updated else {
            return Self::Unknown;
        };
        // Clock skew clamps to zero age.
        let age = (now - last_updated).to_std().unwrap_or(Duration::ZERO);
        if age > stale_time {
            Self::Stale { age }
        } else {
            Self::Fresh { age }
        }
    }

    pub fn is_stale(&self) -> bool {
        matches!(self, Self::Stale { .. })
    }

    pub fn is_fresh(&self) -> bool {
        matches!(self, Self::Fresh { .. })
    }

    pub fn age(&self) -> Option<Duration> {
        match self {
            Self::Unknown => None,
            Self::Fresh { age } | Self::Stale { age } => Some(*age),
        }
    }
}

/// Shorthand for `Freshness::evaluate(..).is_stale()`.
pub fn is_stale(
    last_updated: Option<DateTime<Utc>>,
    stale_time: Duration,
    now: DateTime<Utc>,
) -> bool {
    Freshness::evaluate(last_updated, stale_time, now).is_stale()
}
