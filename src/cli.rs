//! Command-line interface parsing for SunSigns
//!
//! This module handles parsing of CLI arguments using clap and validates them
//! into a `StartupConfig` for the refresh engine and the display loop.

use std::path::PathBuf;
use std::time::Duration;

use chrono::NaiveDateTime;
use clap::Parser;
use thiserror::Error;

use crate::calendar::{parse_simulated_date, WeekStart};
use crate::data::{Period, Sign};
use crate::refresh::RefreshConfig;

/// Error types for CLI argument parsing
#[derive(Debug, Error)]
pub enum CliError {
    /// The specified sign name is not recognized
    #[error("Invalid sign: '{0}'. Use one of the twelve sun signs, e.g. aries or pisces")]
    InvalidSign(String),

    /// The specified period is not a usable name
    #[error("Invalid period: '{0}'. Use daily, tomorrow, weekly, monthly or yearly")]
    InvalidPeriod(String),

    /// The week start is neither Sunday nor Monday
    #[error("Invalid week start: '{0}'. Valid values: sunday, monday")]
    InvalidWeekStart(String),

    /// The simulated date does not match `MMDDYYYY HH:MM:SS`
    #[error("Invalid simulated date: '{0}'. Expected MMDDYYYY HH:MM:SS")]
    InvalidSimulatedDate(String),
}

/// SunSigns - cached horoscopes for a display front-end
#[derive(Parser, Debug)]
#[command(name = "sunsigns")]
#[command(about = "Fetch, cache and refresh sun sign horoscopes")]
#[command(version)]
pub struct Cli {
    /// Zodiac sign to show (repeatable, default: taurus)
    #[arg(long = "sign", value_name = "SIGN")]
    pub signs: Vec<String>,

    /// Horoscope period to show (repeatable, default: daily and tomorrow)
    #[arg(long = "period", value_name = "PERIOD")]
    pub periods: Vec<String>,

    /// First day of the week for weekly horoscopes
    #[arg(long, value_name = "DAY", default_value = "sunday")]
    pub week_start: String,

    /// Seconds to wait between failed fetch attempts
    #[arg(long, value_name = "SECS", default_value_t = 900)]
    pub retry_delay_secs: u64,

    /// Retries before a key is reported as failing
    #[arg(long, value_name = "COUNT", default_value_t = 3)]
    pub max_retries: u32,

    /// Seconds to pause a failing key after it exhausts its retries
    #[arg(long, value_name = "SECS", default_value_t = 3600)]
    pub cooldown_secs: u64,

    /// Per-request timeout in seconds
    #[arg(long, value_name = "SECS", default_value_t = 10)]
    pub timeout_secs: u64,

    /// Pretend the current time is this, for testing rollovers
    ///
    /// Example: --simulate-date "01012025 00:01:00"
    #[arg(long, value_name = "MMDDYYYY HH:MM:SS")]
    pub simulate_date: Option<String>,

    /// Directory for the cache file and images (default: XDG cache dir)
    #[arg(long, value_name = "DIR")]
    pub cache_dir: Option<PathBuf>,

    /// Keep running and refresh on calendar rollover
    #[arg(long)]
    pub watch: bool,

    /// Seconds between rollover checks in watch mode
    #[arg(long, value_name = "SECS", default_value_t = 60)]
    pub tick_secs: u64,

    /// Enable debug logging
    #[arg(long)]
    pub debug: bool,
}

/// Configuration derived from CLI arguments for application startup
#[derive(Debug, Clone)]
pub struct StartupConfig {
    pub signs: Vec<Sign>,
    pub periods: Vec<Period>,
    pub refresh: RefreshConfig,
    pub simulate_date: Option<NaiveDateTime>,
    pub cache_dir: Option<PathBuf>,
    pub watch: bool,
    pub tick: Duration,
}

impl Default for StartupConfig {
    fn default() -> Self {
        Self {
            signs: vec![Sign::Taurus],
            periods: vec![Period::Daily, Period::Tomorrow],
            refresh: RefreshConfig::default(),
            simulate_date: None,
            cache_dir: None,
            watch: false,
            tick: Duration::from_secs(60),
        }
    }
}

/// Parses a sign argument
pub fn parse_sign_arg(s: &str) -> Result<Sign, CliError> {
    Sign::from_str(s).ok_or_else(|| CliError::InvalidSign(s.to_string()))
}

/// Parses a period argument
pub fn parse_period_arg(s: &str) -> Result<Period, CliError> {
    Period::from_str(s).ok_or_else(|| CliError::InvalidPeriod(s.to_string()))
}

/// Keeps the first occurrence of each item
fn dedup<T: PartialEq>(items: Vec<T>) -> Vec<T> {
    let mut unique = Vec::with_capacity(items.len());
    for item in items {
        if !unique.contains(&item) {
            unique.push(item);
        }
    }
    unique
}

impl StartupConfig {
    /// Creates a StartupConfig from parsed CLI arguments.
    ///
    /// # Returns
    /// * `Ok(StartupConfig)` with defaults filled in for omitted lists
    /// * `Err(CliError)` for the first invalid value found
    pub fn from_cli(cli: &Cli) -> Result<Self, CliError> {
        let defaults = StartupConfig::default();

        let signs = cli
            .signs
            .iter()
            .map(|s| parse_sign_arg(s))
            .collect::<Result<Vec<_>, _>>()?;
        let periods = cli
            .periods
            .iter()
            .map(|s| parse_period_arg(s))
            .collect::<Result<Vec<_>, _>>()?;

        let week_start = WeekStart::from_str(&cli.week_start)
            .ok_or_else(|| CliError::InvalidWeekStart(cli.week_start.clone()))?;

        let simulate_date = match &cli.simulate_date {
            Some(raw) => Some(
                parse_simulated_date(raw)
                    .ok_or_else(|| CliError::InvalidSimulatedDate(raw.clone()))?,
            ),
            None => None,
        };

        Ok(StartupConfig {
            signs: if signs.is_empty() { defaults.signs } else { dedup(signs) },
            periods: if periods.is_empty() { defaults.periods } else { dedup(periods) },
            refresh: RefreshConfig {
                week_start,
                retry_delay: Duration::from_secs(cli.retry_delay_secs),
                max_retries: cli.max_retries,
                cooldown: Duration::from_secs(cli.cooldown_secs),
                request_timeout: Duration::from_secs(cli.timeout_secs),
            },
            simulate_date,
            cache_dir: cli.cache_dir.clone(),
            watch: cli.watch,
            tick: Duration::from_secs(cli.tick_secs.max(1)),
        })
    }
}
