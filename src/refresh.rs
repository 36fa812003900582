//! Background horoscope refresh engine
//!
//! The engine sits between the cache store and the content source. Queries
//! are answered from the cache immediately; anything stale or missing is
//! refreshed on a spawned task and announced through the event channel.
//! Failed fetches are retried with a fixed delay and, after too many
//! failures, reported and paused for a cool-down.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Local, Months, Utc};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::cache::{is_stale, CacheEntry, CacheStore};
use crate::calendar::{changed_periods, Clock, WeekStart};
use crate::data::{CacheKey, ContentSource, FetchError, Period, Sign};

/// Messages sent from the engine to the presentation layer
#[derive(Debug, Clone, PartialEq)]
pub enum RefreshMessage {
    /// Content for a key, either freshly fetched or the best cached value
    HoroscopeResult {
        sign: Sign,
        period: Period,
        content: String,
        /// True when `content` came from an earlier fetch
        from_cache: bool,
        /// Why a fetch failed, when this result follows a failure
        error: Option<FetchError>,
    },
    /// Image location for a sign, `None` if it could not be downloaded
    ImageResult { sign: Sign, path: Option<PathBuf> },
    /// A key failed more than `max_retries` times in a row
    TerminalFailure {
        sign: Sign,
        period: Period,
        attempts: u32,
        cause: FetchError,
    },
    /// Initial data has been sent for every configured key
    CacheBuilt,
    /// A calendar rollover refreshed these periods
    RolloverApplied { periods: Vec<Period> },
    /// The snapshot could not be written; memory is still current
    PersistFailed(String),
}

/// Engine settings
#[derive(Debug, Clone)]
pub struct RefreshConfig {
    /// First day of the week for weekly rollover
    pub week_start: WeekStart,
    /// Wait between failed attempts for a key
    pub retry_delay: Duration,
    /// Retries allowed before a terminal failure is reported
    pub max_retries: u32,
    /// Wait after a terminal failure before trying again
    pub cooldown: Duration,
    /// Upper bound on a single fetch
    pub request_timeout: Duration,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            week_start: WeekStart::Sunday,
            retry_delay: Duration::from_secs(900),   // 15 minutes
            max_retries: 3,
            cooldown: Duration::from_secs(3600),     // 1 hour
            request_timeout: Duration::from_secs(10),
        }
    }
}

/// What the engine is doing with a key right now
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyStatus {
    /// Cached content is within its validity window
    Fresh,
    /// Cached content is outdated; it is served until a refresh lands
    StaleServeCached,
    /// A fetch is in flight
    Refreshing,
    /// No usable content; a failure notice is served instead
    FailedUseFallback,
    /// Never fetched
    Missing,
}

/// Answer to a query
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryResult {
    pub content: String,
    /// True when `content` is a real horoscope from the cache
    pub from_cache: bool,
    /// True when no refresh was needed
    pub fresh: bool,
}

/// Outcome of an explicit refresh
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// New content was stored
    Updated,
    /// The fetch failed; a retry has been scheduled
    RetryScheduled(FetchError),
    /// Another refresh for the key is already running or waiting to retry
    AlreadyInFlight,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KeyActivity {
    Fetching,
    AwaitingRetry,
}

struct Inner {
    store: Arc<CacheStore>,
    source: Arc<dyn ContentSource>,
    clock: Arc<Clock>,
    config: RefreshConfig,
    events: mpsc::UnboundedSender<RefreshMessage>,
    /// Keys with a fetch in flight or a retry pending
    busy: Mutex<HashMap<CacheKey, KeyActivity>>,
    images_busy: Mutex<HashSet<Sign>>,
    signs: Mutex<BTreeSet<Sign>>,
    periods: Mutex<BTreeSet<Period>>,
    shutdown: watch::Sender<bool>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Orchestrates cache queries, background fetches, retries and rollovers
///
/// Cloning is cheap; clones share the same state.
#[derive(Clone)]
pub struct RefreshEngine {
    inner: Arc<Inner>,
}

impl RefreshEngine {
    /// Creates an engine and the receiver for its messages
    pub fn new(
        store: Arc<CacheStore>,
        source: Arc<dyn ContentSource>,
        clock: Arc<Clock>,
        config: RefreshConfig,
    ) -> (Self, mpsc::UnboundedReceiver<RefreshMessage>) {
        let (events, receiver) = mpsc::unbounded_channel();
        let (shutdown, _) = watch::channel(false);

        let engine = Self {
            inner: Arc::new(Inner {
                store,
                source,
                clock,
                config,
                events,
                busy: Mutex::new(HashMap::new()),
                images_busy: Mutex::new(HashSet::new()),
                signs: Mutex::new(BTreeSet::new()),
                periods: Mutex::new(BTreeSet::new()),
                shutdown,
            }),
        };
        (engine, receiver)
    }

    pub fn store(&self) -> &Arc<CacheStore> {
        &self.inner.store
    }

    pub fn clock(&self) -> &Arc<Clock> {
        &self.inner.clock
    }

    fn now_utc(&self) -> DateTime<Utc> {
        self.inner.clock.now().with_timezone(&Utc)
    }

    fn emit(&self, message: RefreshMessage) {
        let _ = self.inner.events.send(message);
    }

    /// Marks a key as fetching; false if it is already busy
    fn claim(&self, key: &CacheKey) -> bool {
        let mut busy = lock(&self.inner.busy);
        if busy.contains_key(key) {
            return false;
        }
        busy.insert(key.clone(), KeyActivity::Fetching);
        true
    }

    fn mark(&self, key: &CacheKey, activity: KeyActivity) {
        lock(&self.inner.busy).insert(key.clone(), activity);
    }

    fn release(&self, key: &CacheKey) {
        lock(&self.inner.busy).remove(key);
    }

    /// Loads the initial data set and replays it to the presentation layer
    ///
    /// Without a snapshot on disk every (sign, period) pair and one image
    /// per sign are fetched as a single batch; failures are independent and
    /// go on to retry in the background. With a snapshot, any calendar
    /// rollover since it was written is applied instead. Either way a result
    /// is sent for every key and image, followed by `CacheBuilt`. Entries
    /// still stale at that point are then refreshed in the background as one
    /// batch.
    ///
    /// # Arguments
    /// * `signs` - Signs to track from now on
    /// * `periods` - Periods to track for every sign
    pub async fn initialize(&self, signs: &[Sign], periods: &[Period]) {
        lock(&self.inner.signs).extend(signs.iter().copied());
        lock(&self.inner.periods).extend(periods.iter().cloned());

        if self.inner.store.was_restored() {
            tracing::debug!("Cache found, checking for calendar rollover");
            self.detect_and_apply_rollover(self.inner.clock.now()).await;
        } else {
            tracing::info!("Cache not found, building new cache");
            self.build(signs, periods).await;
        }

        let mut pending = Vec::new();
        for &sign in signs {
            for period in periods {
                let key = CacheKey::new(sign, period.clone());
                let (result, needs_refresh) = self.lookup(&key);
                if needs_refresh && self.claim(&key) {
                    pending.push(key);
                }
                self.emit(RefreshMessage::HoroscopeResult {
                    sign,
                    period: period.clone(),
                    content: result.content,
                    from_cache: result.from_cache,
                    error: None,
                });
            }
            let path = self.image(sign);
            self.emit(RefreshMessage::ImageResult { sign, path });
        }

        self.emit(RefreshMessage::CacheBuilt);
        tracing::debug!("Sent initial data for {} signs", signs.len());

        if !pending.is_empty() {
            tracing::debug!("Refreshing {} stale keys after startup", pending.len());
            let engine = self.clone();
            tokio::spawn(async move {
                engine.refresh_batch(pending).await;
                engine.persist().await;
            });
        }
    }

    async fn build(&self, signs: &[Sign], periods: &[Period]) {
        let keys: Vec<CacheKey> = signs
            .iter()
            .flat_map(|&sign| periods.iter().map(move |p| CacheKey::new(sign, p.clone())))
            .filter(|key| self.claim(key))
            .collect();

        let image_futures = signs.iter().map(|&sign| self.fetch_image(sign));

        let (outcomes, _) = futures::future::join(
            self.refresh_batch(keys),
            futures::future::join_all(image_futures),
        )
        .await;

        let failed = outcomes
            .iter()
            .filter(|outcome| !matches!(outcome, RefreshOutcome::Updated))
            .count();
        self.inner.store.set_checked_at(self.now_utc());
        self.persist().await;
        tracing::info!(
            "Cache built at {} ({} of {} horoscopes failed)",
            self.inner.store.checked_at(),
            failed,
            outcomes.len()
        );
    }

    /// Returns the best available content without waiting on the network
    ///
    /// Fresh entries are returned as-is. Stale entries are still returned,
    /// and a missing entry yields an "updating" notice; in both cases a
    /// background refresh is started unless one is already running.
    pub fn query(&self, sign: Sign, period: Period) -> QueryResult {
        let key = CacheKey::new(sign, period);
        let (result, needs_refresh) = self.lookup(&key);
        if needs_refresh {
            self.spawn_refresh(key);
        }
        result
    }

    /// Best available content for a key, and whether it should be refreshed
    fn lookup(&self, key: &CacheKey) -> (QueryResult, bool) {
        let entry = self.inner.store.get(key);

        let needs_refresh = match &entry {
            Some(entry) => {
                entry.placeholder || is_stale(&key.period, entry.fetched_at, self.now_utc())
            }
            None => true,
        };

        let result = match entry {
            Some(entry) if !entry.placeholder => {
                if needs_refresh {
                    tracing::debug!("Serving stale {} while it refreshes", key);
                }
                QueryResult {
                    content: entry.content,
                    from_cache: true,
                    fresh: !needs_refresh,
                }
            }
            Some(entry) => QueryResult {
                content: entry.content,
                from_cache: false,
                fresh: false,
            },
            None => QueryResult {
                content: format!("Updating {} horoscope for {}...", key.period, key.sign),
                from_cache: false,
                fresh: false,
            },
        };
        (result, needs_refresh)
    }

    /// Starts a background refresh on demand
    ///
    /// Returns false when the key is already being refreshed.
    pub fn request_refresh(&self, sign: Sign, period: Period) -> bool {
        self.spawn_refresh(CacheKey::new(sign, period))
    }

    fn spawn_refresh(&self, key: CacheKey) -> bool {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!("No async runtime available, cannot refresh {}", key);
            return false;
        };
        if !self.claim(&key) {
            tracing::debug!("Refresh for {} already in flight", key);
            return false;
        }

        let engine = self.clone();
        runtime.spawn(async move {
            engine.refresh_claimed(key).await;
            engine.persist().await;
        });
        true
    }

    /// Fetches one key now, storing the result and persisting the cache
    ///
    /// A failed fetch leaves any previous content in place and schedules a
    /// retry.
    ///
    /// # Arguments
    /// * `sign` - Sign to fetch
    /// * `period` - Period to fetch; `tomorrow` also fills `daily`
    ///
    /// # Returns
    /// * `RefreshOutcome::Updated` when new content was stored
    /// * `RefreshOutcome::RetryScheduled` with the cause when the fetch failed
    /// * `RefreshOutcome::AlreadyInFlight` when the key is already busy
    pub async fn refresh_key(&self, sign: Sign, period: Period) -> RefreshOutcome {
        let key = CacheKey::new(sign, period);
        if !self.claim(&key) {
            return RefreshOutcome::AlreadyInFlight;
        }
        let outcome = self.refresh_claimed(key).await;
        self.persist().await;
        outcome
    }

    /// Refreshes claimed keys concurrently
    ///
    /// A sign's `daily` and `tomorrow` run one after the other, daily first,
    /// so what `daily` holds afterwards does not depend on network timing.
    async fn refresh_batch(&self, keys: Vec<CacheKey>) -> Vec<RefreshOutcome> {
        let mut groups: Vec<Vec<CacheKey>> = Vec::new();
        let mut days: BTreeMap<Sign, Vec<CacheKey>> = BTreeMap::new();
        for key in keys {
            match key.period {
                Period::Daily | Period::Tomorrow => days.entry(key.sign).or_default().push(key),
                _ => groups.push(vec![key]),
            }
        }
        for (_, mut pair) in days {
            pair.sort_by_key(|key| key.period != Period::Daily);
            groups.push(pair);
        }

        let chains = groups.into_iter().map(|group| async move {
            let mut outcomes = Vec::with_capacity(group.len());
            for key in group {
                outcomes.push(self.refresh_claimed(key).await);
            }
            outcomes
        });
        futures::future::join_all(chains)
            .await
            .into_iter()
            .flatten()
            .collect()
    }

    /// Runs one attempt for a claimed key and hands failures to the retry loop
    async fn refresh_claimed(&self, key: CacheKey) -> RefreshOutcome {
        match self.attempt(&key).await {
            Ok(()) => {
                self.release(&key);
                RefreshOutcome::Updated
            }
            Err(err) => {
                self.spawn_retry(key, err.clone());
                RefreshOutcome::RetryScheduled(err)
            }
        }
    }

    async fn attempt(&self, key: &CacheKey) -> Result<(), FetchError> {
        tracing::debug!("Fetching {}", key);
        let fetch = self.inner.source.fetch(key.sign, &key.period);
        let result = match tokio::time::timeout(self.inner.config.request_timeout, fetch).await {
            Ok(result) => result,
            Err(_) => Err(FetchError::Timeout),
        };

        match result {
            Ok(content) => {
                let entry = CacheEntry::new(content, self.now_utc());
                self.inner.store.put(key, entry.clone());

                // Today's daily is yesterday's tomorrow.
                if key.period == Period::Tomorrow {
                    let daily = CacheKey::new(key.sign, Period::Daily);
                    self.inner.store.put(&daily, entry.clone());
                    self.emit(RefreshMessage::HoroscopeResult {
                        sign: key.sign,
                        period: Period::Daily,
                        content: entry.content.clone(),
                        from_cache: true,
                        error: None,
                    });
                }

                tracing::debug!("Refreshed {}", key);
                self.emit(RefreshMessage::HoroscopeResult {
                    sign: key.sign,
                    period: key.period.clone(),
                    content: entry.content,
                    from_cache: false,
                    error: None,
                });
                Ok(())
            }
            Err(err) => {
                tracing::error!("Error fetching {}: {}", key, err);

                let (content, from_cache) = match self.inner.store.get(key) {
                    Some(previous) if !previous.placeholder => {
                        tracing::info!("Using outdated cached data for {}", key);
                        (previous.content, true)
                    }
                    _ => {
                        let placeholder = CacheEntry::placeholder(key, self.now_utc());
                        self.inner.store.put(key, placeholder.clone());
                        (placeholder.content, false)
                    }
                };

                self.emit(RefreshMessage::HoroscopeResult {
                    sign: key.sign,
                    period: key.period.clone(),
                    content,
                    from_cache,
                    error: Some(err.clone()),
                });
                Err(err)
            }
        }
    }

    fn spawn_retry(&self, key: CacheKey, first_error: FetchError) {
        self.mark(&key, KeyActivity::AwaitingRetry);
        let engine = self.clone();
        tokio::spawn(async move { engine.retry_loop(key, first_error).await });
    }

    /// Retries a key until it succeeds or the engine shuts down
    async fn retry_loop(self, key: CacheKey, first_error: FetchError) {
        let config = &self.inner.config;
        let mut shutdown = self.inner.shutdown.subscribe();
        let mut failures: u32 = 1;
        let mut last_error = first_error;

        loop {
            let delay = if failures > config.max_retries {
                tracing::warn!(
                    "Giving up on {} for {:?} after {} attempts: {}",
                    key,
                    config.cooldown,
                    failures,
                    last_error
                );
                self.emit(RefreshMessage::TerminalFailure {
                    sign: key.sign,
                    period: key.period.clone(),
                    attempts: failures,
                    cause: last_error.clone(),
                });
                failures = 0;
                config.cooldown
            } else {
                tracing::info!(
                    "Retrying {} in {:?} (failure {})",
                    key,
                    config.retry_delay,
                    failures
                );
                config.retry_delay
            };

            self.mark(&key, KeyActivity::AwaitingRetry);
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => break,
            }

            self.mark(&key, KeyActivity::Fetching);
            let result = self.attempt(&key).await;
            self.persist().await;
            match result {
                Ok(()) => break,
                Err(err) => {
                    failures += 1;
                    last_error = err;
                }
            }
        }

        self.release(&key);
    }

    /// Returns the cached image path, fetching it in the background if absent
    pub fn image(&self, sign: Sign) -> Option<PathBuf> {
        if let Some(path) = self.inner.store.image(sign).and_then(|entry| entry.path) {
            return Some(path);
        }

        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let engine = self.clone();
                runtime.spawn(async move {
                    engine.fetch_image(sign).await;
                    engine.persist().await;
                });
            }
            Err(_) => tracing::warn!("No async runtime available, cannot fetch image for {}", sign),
        }
        None
    }

    async fn fetch_image(&self, sign: Sign) {
        if !lock(&self.inner.images_busy).insert(sign) {
            return;
        }

        let fetch = self.inner.source.fetch_image(sign);
        let result = match tokio::time::timeout(self.inner.config.request_timeout, fetch).await {
            Ok(result) => result,
            Err(_) => Err(FetchError::Timeout),
        };

        let path = match result {
            Ok(bytes) => match self.inner.store.write_image(sign, &bytes).await {
                Ok(path) => {
                    tracing::debug!("Image for {} saved to {}", sign, path.display());
                    Some(path)
                }
                Err(err) => {
                    tracing::error!("Error saving image for {}: {}", sign, err);
                    None
                }
            },
            Err(err) => {
                tracing::error!("Error fetching image for {}: {}", sign, err);
                None
            }
        };

        self.inner.store.put_image(sign, path.clone());
        lock(&self.inner.images_busy).remove(&sign);
        self.emit(RefreshMessage::ImageResult { sign, path });
    }

    /// Refreshes every period whose calendar boundary passed since the last check
    ///
    /// All tracked signs are covered. On a new day `daily` is fetched before
    /// `tomorrow`, whose content then replaces it through the mirror; if the
    /// tomorrow fetch fails, the fresh daily page stays.
    ///
    /// # Arguments
    /// * `now` - Current instant; the last check is read from the store
    ///
    /// # Returns
    /// The periods whose calendar boundary was crossed, empty if none
    pub async fn detect_and_apply_rollover(&self, now: DateTime<Local>) -> BTreeSet<Period> {
        let store = &self.inner.store;
        let last = store.checked_at().with_timezone(&Local);
        let changed = changed_periods(
            last.naive_local(),
            now.naive_local(),
            self.inner.config.week_start,
        );
        store.set_checked_at(now.with_timezone(&Utc));

        if changed.is_empty() {
            return changed;
        }
        tracing::info!("Calendar rollover since {}: {:?}", last, changed);

        let mut signs = lock(&self.inner.signs).clone();
        signs.extend(store.signs());
        let tracked_periods = lock(&self.inner.periods).clone();

        let mut keys = Vec::new();
        for sign in signs {
            let mut periods: BTreeSet<Period> = store.periods(sign).into_iter().collect();
            periods.extend(tracked_periods.iter().cloned());
            periods.retain(|period| changed.contains(period));
            keys.extend(periods.into_iter().map(|period| CacheKey::new(sign, period)));
        }

        let claimed: Vec<CacheKey> = keys.into_iter().filter(|key| self.claim(key)).collect();
        self.refresh_batch(claimed).await;
        self.persist().await;

        let periods: Vec<Period> = changed.iter().cloned().collect();
        self.emit(RefreshMessage::RolloverApplied {
            periods: periods.clone(),
        });
        tracing::info!("Cache updated after rollover: {:?}", periods);
        changed
    }

    /// Overrides the engine's notion of "now"
    pub fn set_simulated_now(&self, at: DateTime<Local>) {
        tracing::debug!("Simulated time set to {}", at);
        self.inner.clock.set_simulated_now(at);
    }

    /// Moves the clock one `period` ahead and applies the resulting rollover
    ///
    /// Returns `None` for periods without a calendar length.
    pub async fn simulate_advance(&self, period: &Period) -> Option<BTreeSet<Period>> {
        let now = self.inner.clock.now();
        let target = match period {
            Period::Daily | Period::Tomorrow => now + chrono::Duration::days(1),
            Period::Weekly => now + chrono::Duration::days(7),
            Period::Monthly => now.checked_add_months(Months::new(1))?,
            Period::Yearly => now.checked_add_months(Months::new(12))?,
            Period::Other(name) => {
                tracing::error!("Invalid test period: {}", name);
                return None;
            }
        };

        tracing::debug!("Simulating date change for testing: {}", period);
        self.set_simulated_now(target);
        Some(self.detect_and_apply_rollover(target).await)
    }

    /// Reports the current state of a key
    pub fn status(&self, sign: Sign, period: Period) -> KeyStatus {
        let key = CacheKey::new(sign, period);
        let activity = lock(&self.inner.busy).get(&key).copied();
        if activity == Some(KeyActivity::Fetching) {
            return KeyStatus::Refreshing;
        }

        match self.inner.store.get(&key) {
            None => KeyStatus::Missing,
            Some(entry) if entry.placeholder => KeyStatus::FailedUseFallback,
            Some(entry)
                if activity.is_some()
                    || is_stale(&key.period, entry.fetched_at, self.now_utc()) =>
            {
                KeyStatus::StaleServeCached
            }
            Some(_) => KeyStatus::Fresh,
        }
    }

    /// True when no fetch is in flight; keys waiting to retry do not count
    pub fn is_idle(&self) -> bool {
        let fetching = lock(&self.inner.busy)
            .values()
            .any(|activity| *activity == KeyActivity::Fetching);
        !fetching && lock(&self.inner.images_busy).is_empty()
    }

    async fn persist(&self) {
        if let Err(err) = self.inner.store.persist().await {
            tracing::error!("Error writing cache file: {}", err);
            self.emit(RefreshMessage::PersistFailed(err.to_string()));
        }
    }

    /// Periodically checks for calendar rollover using the engine clock
    pub fn spawn_scheduler(&self, tick: Duration) -> SchedulerHandle {
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        let engine = self.clone();

        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(tick);
            // Skip the first tick (immediate)
            interval.tick().await;

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let now = engine.inner.clock.now();
                        engine.detect_and_apply_rollover(now).await;
                    }
                    _ = shutdown_rx.recv() => {
                        break;
                    }
                }
            }
        });

        SchedulerHandle { shutdown_tx, task }
    }

    /// Stops pending retries; fetches already in flight still complete
    pub fn shutdown(&self) {
        let _ = self.inner.shutdown.send(true);
    }
}

/// Handle for the rollover scheduler task
pub struct SchedulerHandle {
    shutdown_tx: mpsc::Sender<()>,
    task: JoinHandle<()>,
}

impl SchedulerHandle {
    /// Stops the scheduler and waits for it to exit
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(()).await;
        let _ = self.task.await;
    }
}
