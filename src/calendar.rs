//! Calendar rollover detection and the engine clock
//!
//! Horoscopes are published per day, week, month and year. When the calendar
//! crosses one of those boundaries the matching cached periods are outdated
//! regardless of their age. Everything here takes the current time as a
//! parameter so rollovers can be simulated deterministically.

use std::collections::BTreeSet;
use std::sync::{PoisonError, RwLock};

use chrono::{DateTime, Datelike, Duration, Local, NaiveDate, NaiveDateTime, TimeZone};

use crate::data::Period;

/// Format accepted for simulated dates, e.g. `01312025 23:59:00`
pub const SIMULATED_DATE_FORMAT: &str = "%m%d%Y %H:%M:%S";

/// First day of the week for weekly horoscopes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WeekStart {
    #[default]
    Sunday,
    Monday,
}

impl WeekStart {
    pub fn from_str(s: &str) -> Option<WeekStart> {
        match s.trim().to_lowercase().as_str() {
            "sunday" | "sun" => Some(WeekStart::Sunday),
            "monday" | "mon" => Some(WeekStart::Monday),
            _ => None,
        }
    }

    /// Days elapsed since the most recent week start, 0..=6
    pub fn days_into_week(&self, date: NaiveDate) -> u32 {
        match self {
            WeekStart::Sunday => date.weekday().num_days_from_sunday(),
            WeekStart::Monday => date.weekday().num_days_from_monday(),
        }
    }

    /// The date on which the week containing `date` began
    pub fn week_of(&self, date: NaiveDate) -> NaiveDate {
        date - Duration::days(i64::from(self.days_into_week(date)))
    }
}

/// Periods whose calendar boundary lies between `last_checked_at` and `now`
///
/// Both instants are local wall-clock times. A new day outdates `daily` and
/// `tomorrow`; a new week (relative to `week_start`), month or year outdates
/// the matching period. Periods without a calendar rule never appear.
///
/// A new week means the two dates fall in different weeks, so any gap of
/// seven days or more counts even when the day offset is the same.
pub fn changed_periods(
    last_checked_at: NaiveDateTime,
    now: NaiveDateTime,
    week_start: WeekStart,
) -> BTreeSet<Period> {
    let (last, today) = (last_checked_at.date(), now.date());
    let mut changed = BTreeSet::new();

    if today != last {
        changed.insert(Period::Daily);
        changed.insert(Period::Tomorrow);
    }
    // Also catches gaps of a whole week or more, where the day offset repeats.
    if week_start.week_of(today) != week_start.week_of(last) {
        changed.insert(Period::Weekly);
    }
    if (today.year(), today.month()) != (last.year(), last.month()) {
        changed.insert(Period::Monthly);
    }
    if today.year() != last.year() {
        changed.insert(Period::Yearly);
    }

    changed
}

/// Parses a simulated date in `MMDDYYYY HH:MM:SS` form
pub fn parse_simulated_date(s: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(s.trim(), SIMULATED_DATE_FORMAT).ok()
}

/// Interprets a wall-clock time in the local timezone
pub fn to_local(naive: NaiveDateTime) -> Option<DateTime<Local>> {
    Local.from_local_datetime(&naive).earliest()
}

#[derive(Debug, Clone, Copy)]
enum ClockMode {
    System,
    /// Wall clock shifted by a fixed amount; time keeps moving
    Shifted(Duration),
    /// Frozen at an instant until moved explicitly
    Fixed(DateTime<Local>),
}

/// Source of "now" for the refresh engine
///
/// Defaults to the system clock. A simulated time can be injected at any
/// point, which shifts every later reading by the same amount.
#[derive(Debug)]
pub struct Clock {
    mode: RwLock<ClockMode>,
}

impl Default for Clock {
    fn default() -> Self {
        Self::system()
    }
}

impl Clock {
    pub fn system() -> Self {
        Self {
            mode: RwLock::new(ClockMode::System),
        }
    }

    /// A clock frozen at `at`
    pub fn fixed(at: DateTime<Local>) -> Self {
        Self {
            mode: RwLock::new(ClockMode::Fixed(at)),
        }
    }

    pub fn now(&self) -> DateTime<Local> {
        match *self.mode.read().unwrap_or_else(PoisonError::into_inner) {
            ClockMode::System => Local::now(),
            ClockMode::Shifted(offset) => Local::now() + offset,
            ClockMode::Fixed(at) => at,
        }
    }

    /// Makes `now()` report `at`
    ///
    /// A frozen clock stays frozen at the new instant; otherwise the clock
    /// keeps ticking from there.
    pub fn set_simulated_now(&self, at: DateTime<Local>) {
        let mut mode = self.mode.write().unwrap_or_else(PoisonError::into_inner);
        *mode = match *mode {
            ClockMode::Fixed(_) => ClockMode::Fixed(at),
            _ => ClockMode::Shifted(at - Local::now()),
        };
    }

    /// Moves the clock forward by `by`
    pub fn advance(&self, by: Duration) {
        let now = self.now();
        self.set_simulated_now(now + by);
    }

    pub fn is_simulated(&self) -> bool {
        !matches!(
            *self.mode.read().unwrap_or_else(PoisonError::into_inner),
            ClockMode::System
        )
    }
}
