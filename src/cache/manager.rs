//! Cache store for horoscope text and sign images
//!
//! Provides a `CacheStore` that keeps every cached horoscope in memory and
//! mirrors the whole set to a single JSON snapshot on disk, supporting
//! graceful degradation when the source site is unavailable.

use chrono::{DateTime, Utc};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use thiserror::Error;

use crate::data::{CacheKey, Period, Sign};

/// Name of the snapshot file inside the cache directory
const SNAPSHOT_FILE: &str = "horoscope_cache.json";

/// Subdirectory holding downloaded sign images
const IMAGE_DIR: &str = "images";

/// Errors raised while reading or writing the snapshot
#[derive(Debug, Error)]
pub enum StoreError {
    /// The snapshot file could not be read
    #[error("failed to read cache file: {0}")]
    Read(#[source] std::io::Error),

    /// The snapshot file exists but is not a valid snapshot
    #[error("cache file is malformed: {0}")]
    Parse(#[source] serde_json::Error),

    /// The snapshot or an image could not be written
    #[error("failed to write cache file: {0}")]
    Write(#[source] std::io::Error),

    /// The in-memory snapshot could not be serialized
    #[error("failed to serialize cache: {0}")]
    Serialize(#[source] serde_json::Error),
}

/// One cached horoscope
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Horoscope text, or a failure notice for placeholders
    pub content: String,
    /// When the content was fetched
    #[serde(rename = "timestamp")]
    pub fetched_at: DateTime<Utc>,
    /// Set when `content` is a failure notice rather than a real horoscope
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub placeholder: bool,
}

impl CacheEntry {
    pub fn new(content: impl Into<String>, fetched_at: DateTime<Utc>) -> Self {
        Self {
            content: content.into(),
            fetched_at,
            placeholder: false,
        }
    }

    /// Builds the notice stored when a key has never been fetched successfully
    pub fn placeholder(key: &CacheKey, now: DateTime<Utc>) -> Self {
        Self {
            content: format!(
                "Unable to fetch {} horoscope for {}. Please try again later.",
                key.period, key.sign
            ),
            fetched_at: now,
            placeholder: true,
        }
    }
}

/// Cached image location for one sign
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageEntry {
    pub sign: Sign,
    /// `None` records a failed download
    pub path: Option<PathBuf>,
}

/// Full durable state of the cache
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheSnapshot {
    /// When the cache was built or last checked for calendar rollover
    #[serde(rename = "timestamp")]
    pub checked_at: DateTime<Utc>,
    #[serde(default)]
    pub horoscopes: BTreeMap<Sign, BTreeMap<Period, CacheEntry>>,
    #[serde(default)]
    pub images: BTreeMap<Sign, Option<PathBuf>>,
}

impl CacheSnapshot {
    /// An empty snapshot stamped with `now`
    pub fn empty(now: DateTime<Utc>) -> Self {
        Self {
            checked_at: now,
            horoscopes: BTreeMap::new(),
            images: BTreeMap::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.horoscopes.is_empty() && self.images.is_empty()
    }

    pub fn get(&self, key: &CacheKey) -> Option<&CacheEntry> {
        self.horoscopes.get(&key.sign)?.get(&key.period)
    }
}

/// Owns all reads and writes of cached horoscopes and images
///
/// The in-memory snapshot is authoritative. `persist` copies it to
/// `<cache_dir>/horoscope_cache.json`; a failed write leaves memory untouched
/// and the next successful persist catches the file up.
#[derive(Debug)]
pub struct CacheStore {
    /// Directory where the snapshot and images are stored
    cache_dir: PathBuf,
    snapshot: RwLock<CacheSnapshot>,
    /// Whether a snapshot was found on disk when the store was opened
    restored: bool,
    /// Serializes overlapping persists
    persist_lock: tokio::sync::Mutex<()>,
}

impl CacheStore {
    /// Opens the store in the XDG-compliant cache directory
    ///
    /// Uses `~/.cache/sunsigns/` on Linux, or the equivalent path on other
    /// platforms. Returns `None` if the directory cannot be determined.
    pub fn new() -> Option<Self> {
        let project_dirs = ProjectDirs::from("", "", "sunsigns")?;
        Some(Self::with_dir(project_dirs.cache_dir().to_path_buf()))
    }

    /// Opens the store in a specific directory, loading any existing snapshot
    pub fn with_dir(cache_dir: PathBuf) -> Self {
        let loaded = read_snapshot(&cache_dir.join(SNAPSHOT_FILE));
        let restored = loaded.is_ok();
        let snapshot = loaded.unwrap_or_else(|_| CacheSnapshot::empty(Utc::now()));

        Self {
            cache_dir,
            snapshot: RwLock::new(snapshot),
            restored,
            persist_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    pub fn snapshot_path(&self) -> PathBuf {
        self.cache_dir.join(SNAPSHOT_FILE)
    }

    pub fn image_dir(&self) -> PathBuf {
        self.cache_dir.join(IMAGE_DIR)
    }

    /// Whether the store started from a snapshot found on disk
    pub fn was_restored(&self) -> bool {
        self.restored
    }

    /// Reads the durable snapshot
    ///
    /// A missing or malformed file is logged and reported as an empty
    /// snapshot; it is never an error for the caller.
    pub fn load(&self) -> CacheSnapshot {
        match read_snapshot(&self.snapshot_path()) {
            Ok(snapshot) => snapshot,
            Err(_) => CacheSnapshot::empty(Utc::now()),
        }
    }

    fn read_guard(&self) -> RwLockReadGuard<'_, CacheSnapshot> {
        self.snapshot.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_guard(&self) -> RwLockWriteGuard<'_, CacheSnapshot> {
        self.snapshot.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Looks up a cached entry without triggering any fetch
    pub fn get(&self, key: &CacheKey) -> Option<CacheEntry> {
        self.read_guard().get(key).cloned()
    }

    /// Replaces the entry for `key`
    pub fn put(&self, key: &CacheKey, entry: CacheEntry) {
        self.write_guard()
            .horoscopes
            .entry(key.sign)
            .or_default()
            .insert(key.period.clone(), entry);
    }

    /// Looks up the cached image for a sign
    pub fn image(&self, sign: Sign) -> Option<ImageEntry> {
        self.read_guard()
            .images
            .get(&sign)
            .map(|path| ImageEntry {
                sign,
                path: path.clone(),
            })
    }

    /// Records the image path for a sign, or `None` after a failed download
    pub fn put_image(&self, sign: Sign, path: Option<PathBuf>) {
        self.write_guard().images.insert(sign, path);
    }

    /// Writes downloaded image bytes to `images/<sign>.png`
    pub async fn write_image(&self, sign: Sign, bytes: &[u8]) -> Result<PathBuf, StoreError> {
        let dir = self.image_dir();
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(StoreError::Write)?;

        let path = dir.join(format!("{}.png", sign));
        tokio::fs::write(&path, bytes)
            .await
            .map_err(StoreError::Write)?;
        Ok(path)
    }

    /// Signs that have at least one cached horoscope
    pub fn signs(&self) -> Vec<Sign> {
        self.read_guard().horoscopes.keys().copied().collect()
    }

    /// Periods cached for a sign
    pub fn periods(&self, sign: Sign) -> Vec<Period> {
        self.read_guard()
            .horoscopes
            .get(&sign)
            .map(|periods| periods.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn checked_at(&self) -> DateTime<Utc> {
        self.read_guard().checked_at
    }

    pub fn set_checked_at(&self, at: DateTime<Utc>) {
        self.write_guard().checked_at = at;
    }

    /// A copy of the current in-memory snapshot
    pub fn snapshot(&self) -> CacheSnapshot {
        self.read_guard().clone()
    }

    /// Writes the full snapshot to disk
    ///
    /// The file is written next to the target and renamed into place, so a
    /// reader never sees a partially written snapshot. Concurrent calls wait
    /// for each other.
    ///
    /// # Returns
    /// * `Ok(())` once the snapshot file is in place
    /// * `Err` if serializing, writing or renaming fails; memory is unchanged
    pub async fn persist(&self) -> Result<(), StoreError> {
        let _guard = self.persist_lock.lock().await;

        let json = {
            let snapshot = self.read_guard();
            serde_json::to_string_pretty(&*snapshot).map_err(StoreError::Serialize)?
        };

        tokio::fs::create_dir_all(&self.cache_dir)
            .await
            .map_err(StoreError::Write)?;

        let target = self.snapshot_path();
        let staging = target.with_extension("json.tmp");
        tokio::fs::write(&staging, json)
            .await
            .map_err(StoreError::Write)?;
        tokio::fs::rename(&staging, &target)
            .await
            .map_err(StoreError::Write)?;

        tracing::info!("Cache file updated at {}", target.display());
        Ok(())
    }
}

/// Reads and parses a snapshot file, logging why it could not be used
fn read_snapshot(path: &Path) -> Result<CacheSnapshot, StoreError> {
    let content = fs::read_to_string(path).map_err(|err| {
        if err.kind() == ErrorKind::NotFound {
            tracing::info!(
                "Cache file {} does not exist, a new cache will be built",
                path.display()
            );
        } else {
            tracing::warn!("Error reading cache file {}: {}", path.display(), err);
        }
        StoreError::Read(err)
    })?;

    let snapshot: CacheSnapshot = serde_json::from_str(&content).map_err(|err| {
        tracing::warn!(
            "Cache file {} is malformed, starting empty: {}",
            path.display(),
            err
        );
        StoreError::Parse(err)
    })?;

    tracing::info!("Cache file loaded from {}", snapshot.checked_at);
    Ok(snapshot)
}
