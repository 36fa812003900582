//! Cache validity windows per horoscope period

use chrono::{DateTime, Duration, Utc};

use crate::data::Period;

/// How long a freshly fetched entry for `period` stays valid
pub fn validity_window(period: &Period) -> Duration {
    match period {
        Period::Daily | Period::Tomorrow => Duration::hours(6),
        Period::Weekly => Duration::days(1),
        Period::Monthly => Duration::weeks(1),
        Period::Yearly => Duration::days(30),
        Period::Other(_) => Duration::days(1),
    }
}

/// Returns true once an entry fetched at `fetched_at` has outlived its window
pub fn is_stale(period: &Period, fetched_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    now - fetched_at >= validity_window(period)
}
