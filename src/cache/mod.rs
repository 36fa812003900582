//! Cache module for horoscope text and sign images
//!
//! This module provides the cache store, which keeps every fetched horoscope
//! in memory and persists the whole set as a single JSON snapshot, and the
//! validity policy deciding when a cached entry should be fetched again.
//! Stale entries are still served so the display keeps working while the
//! source site is unavailable.

mod manager;
pub mod policy;

pub use manager::{CacheEntry, CacheSnapshot, CacheStore, ImageEntry, StoreError};
pub use policy::{is_stale, validity_window};
