//! SunSigns Library
//!
//! Horoscope cache and refresh engine. The binary in `main.rs` is a thin
//! display loop over this library; integration tests drive it directly.

pub mod cache;
pub mod calendar;
pub mod cli;
pub mod data;
pub mod refresh;
