use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// A time window for metrics queries.
///
/// Callers may use one of the supported named ranges or supply explicit
/// bounds. Named ranges are anchored to the moment the query is evaluated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeRange {
    /// The last hour.
    LastHour,
    /// The last six hours.
    LastSixHours,
    /// The last twenty-four hours.
    LastDay,
    /// The last seven days.
    LastWeek,
    /// An explicit half-open window `[start, end)`.
    Custom {
        /// Inclusive start of the window.
        start: DateTime<Utc>,
        /// Exclusive end of the window.
        end: DateTime<Utc>,
    },
}

impl TimeRange {
    /// Resolve the range to concrete `(start, end)` bounds as of `now`.
    pub fn bounds(&self, now: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
        match self {
            TimeRange::LastHour => (now - Duration::hours(1), now),
            TimeRange::LastSixHours => (now - Duration::hours(6), now),
            TimeRange::LastDay => (now - Duration::hours(24), now),
            TimeRange::LastWeek => (now - Duration::days(7), now),
            TimeRange::Custom { start, end } => (*start, *end),
        }
    }

    /// Whether `at` falls inside this range as of `now`.
    pub fn contains(&self, at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        let (start, end) = self.bounds(now);
        at >= start && at < end
    }

    /// Parse a named range string as used by the query interface.
    ///
    /// Recognized names: `1h`, `6h`, `24h`, `7d`.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "1h" => Some(TimeRange::LastHour),
            "6h" => Some(TimeRange::LastSixHours),
            "24h" => Some(TimeRange::LastDay),
            "7d" => Some(TimeRange::LastWeek),
            _ => None,
        }
    }
}
