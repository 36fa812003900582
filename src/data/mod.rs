//! Core data models for SunSigns
//!
//! This module contains the key types used throughout the application for
//! addressing cached horoscopes: zodiac signs, horoscope periods, and the
//! (sign, period) cache key.

pub mod sunsigns;

pub use sunsigns::{
    ContentExtractor, ContentSource, FetchError, ParagraphExtractor, SunSignsClient,
};

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// One of the twelve zodiac sun signs
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sign {
    Aries,
    Taurus,
    Gemini,
    Cancer,
    Leo,
    Virgo,
    Libra,
    Scorpio,
    Sagittarius,
    Capricorn,
    Aquarius,
    Pisces,
}

impl Sign {
    /// All twelve signs in zodiac order
    pub const ALL: [Sign; 12] = [
        Sign::Aries,
        Sign::Taurus,
        Sign::Gemini,
        Sign::Cancer,
        Sign::Leo,
        Sign::Virgo,
        Sign::Libra,
        Sign::Scorpio,
        Sign::Sagittarius,
        Sign::Capricorn,
        Sign::Aquarius,
        Sign::Pisces,
    ];

    /// Lowercase name, as used in URLs and in the snapshot file
    pub fn as_str(&self) -> &'static str {
        match self {
            Sign::Aries => "aries",
            Sign::Taurus => "taurus",
            Sign::Gemini => "gemini",
            Sign::Cancer => "cancer",
            Sign::Leo => "leo",
            Sign::Virgo => "virgo",
            Sign::Libra => "libra",
            Sign::Scorpio => "scorpio",
            Sign::Sagittarius => "sagittarius",
            Sign::Capricorn => "capricorn",
            Sign::Aquarius => "aquarius",
            Sign::Pisces => "pisces",
        }
    }

    /// Parses a sign name, ignoring case and surrounding whitespace
    pub fn from_str(s: &str) -> Option<Sign> {
        let name = s.trim().to_lowercase();
        Sign::ALL.iter().copied().find(|sign| sign.as_str() == name)
    }
}

impl fmt::Display for Sign {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A horoscope timeframe
///
/// The five well-known periods have dedicated variants. Any other lowercase
/// slug is kept as `Other` so that sources exposing additional timeframes
/// can be cached without changing this type.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Period {
    Daily,
    Tomorrow,
    Weekly,
    Monthly,
    Yearly,
    Other(String),
}

impl Period {
    /// The five built-in periods
    pub const BUILTIN: [Period; 5] = [
        Period::Daily,
        Period::Tomorrow,
        Period::Weekly,
        Period::Monthly,
        Period::Yearly,
    ];

    pub fn as_str(&self) -> &str {
        match self {
            Period::Daily => "daily",
            Period::Tomorrow => "tomorrow",
            Period::Weekly => "weekly",
            Period::Monthly => "monthly",
            Period::Yearly => "yearly",
            Period::Other(name) => name,
        }
    }

    /// Parses a period name
    ///
    /// Returns `None` for empty input or for names containing anything other
    /// than lowercase ASCII letters, digits, `-` or `_`.
    pub fn from_str(s: &str) -> Option<Period> {
        let name = s.trim().to_lowercase();
        match name.as_str() {
            "daily" => Some(Period::Daily),
            "tomorrow" => Some(Period::Tomorrow),
            "weekly" => Some(Period::Weekly),
            "monthly" => Some(Period::Monthly),
            "yearly" => Some(Period::Yearly),
            "" => None,
            other if is_slug(other) => Some(Period::Other(other.to_string())),
            _ => None,
        }
    }
}

fn is_slug(s: &str) -> bool {
    s.chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_')
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for Period {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Period {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let name = String::deserialize(deserializer)?;
        Period::from_str(&name)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid period: {:?}", name)))
    }
}

/// Address of one cached horoscope
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CacheKey {
    pub sign: Sign,
    pub period: Period,
}

impl CacheKey {
    pub fn new(sign: Sign, period: Period) -> Self {
        Self { sign, period }
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.sign, self.period)
    }
}
