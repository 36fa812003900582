//! End-to-end tests for the refresh engine against a mock sunsigns.com
//!
//! These wire the real HTTP client, cache store and engine together and
//! check what ends up on disk and what gets fetched again after a restart.

use std::sync::Arc;
use std::time::Duration;

use chrono::{Datelike, Local, NaiveDate, Utc};
use httpmock::prelude::*;
use tempfile::TempDir;
use tokio::sync::mpsc;

use sunsigns::cache::CacheStore;
use sunsigns::calendar::{to_local, Clock};
use sunsigns::data::{CacheKey, Period, Sign, SunSignsClient};
use sunsigns::refresh::{RefreshConfig, RefreshEngine, RefreshMessage};

fn client_for(server: &MockServer) -> SunSignsClient {
    SunSignsClient::new().with_base_urls(server.url("/horoscopes"), server.url("/images"))
}

fn config() -> RefreshConfig {
    RefreshConfig {
        retry_delay: Duration::from_secs(3600),
        request_timeout: Duration::from_secs(5),
        ..Default::default()
    }
}

fn engine_in(
    dir: &TempDir,
    server: &MockServer,
    clock: Clock,
) -> (RefreshEngine, mpsc::UnboundedReceiver<RefreshMessage>) {
    let store = Arc::new(CacheStore::with_dir(dir.path().to_path_buf()));
    RefreshEngine::new(store, Arc::new(client_for(server)), Arc::new(clock), config())
}

async fn wait_for_cache_built(
    events: &mut mpsc::UnboundedReceiver<RefreshMessage>,
) -> Vec<RefreshMessage> {
    tokio::time::timeout(Duration::from_secs(10), async {
        let mut seen = Vec::new();
        while let Some(message) = events.recv().await {
            let done = message == RefreshMessage::CacheBuilt;
            seen.push(message);
            if done {
                break;
            }
        }
        seen
    })
    .await
    .expect("timed out waiting for CacheBuilt")
}

#[tokio::test]
async fn test_first_run_builds_and_persists_cache() {
    let server = MockServer::start_async().await;
    let tomorrow = server
        .mock_async(|when, then| {
            when.method(GET).path("/horoscopes/daily/leo/tomorrow");
            then.status(200).body("<p>Tomorrow, roar.</p>");
        })
        .await;
    let weekly = server
        .mock_async(|when, then| {
            when.method(GET).path("/horoscopes/weekly/leo");
            then.status(200).body("<p>A week of sunshine.</p><p>Rest on Sunday.</p>");
        })
        .await;
    let image = server
        .mock_async(|when, then| {
            when.method(GET).path("/images/leo/wrappable.png");
            then.status(200).body(vec![1u8, 2, 3]);
        })
        .await;
    let dir = TempDir::new().unwrap();
    let (engine, mut events) = engine_in(&dir, &server, Clock::system());

    engine
        .initialize(&[Sign::Leo], &[Period::Tomorrow, Period::Weekly])
        .await;
    let messages = wait_for_cache_built(&mut events).await;

    tomorrow.assert_hits_async(1).await;
    weekly.assert_hits_async(1).await;
    image.assert_hits_async(1).await;
    assert!(messages.contains(&RefreshMessage::HoroscopeResult {
        sign: Sign::Leo,
        period: Period::Weekly,
        content: "A week of sunshine.\n\nRest on Sunday.".to_string(),
        from_cache: true,
        error: None,
    }));

    let on_disk = CacheStore::with_dir(dir.path().to_path_buf()).snapshot();
    let daily = on_disk.get(&CacheKey::new(Sign::Leo, Period::Daily)).unwrap();
    assert_eq!(daily.content, "Tomorrow, roar.");
    assert!(on_disk.images.get(&Sign::Leo).unwrap().is_some());
}

#[tokio::test]
async fn test_restart_serves_cache_without_fetching() {
    let server = MockServer::start_async().await;
    let monthly = server
        .mock_async(|when, then| {
            when.method(GET).path("/horoscopes/monthly/aries");
            then.status(200).body("<p>March is yours.</p>");
        })
        .await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/images/aries/wrappable.png");
            then.status(200).body(vec![9u8]);
        })
        .await;
    let dir = TempDir::new().unwrap();

    {
        let (engine, mut events) = engine_in(&dir, &server, Clock::system());
        engine.initialize(&[Sign::Aries], &[Period::Monthly]).await;
        wait_for_cache_built(&mut events).await;
    }
    monthly.assert_hits_async(1).await;

    let (engine, mut events) = engine_in(&dir, &server, Clock::system());
    assert!(engine.store().was_restored());
    engine.initialize(&[Sign::Aries], &[Period::Monthly]).await;
    let messages = wait_for_cache_built(&mut events).await;

    monthly.assert_hits_async(1).await;
    assert!(messages.iter().any(|m| matches!(
        m,
        RefreshMessage::HoroscopeResult { content, from_cache: true, .. }
            if content == "March is yours."
    )));
}

#[tokio::test]
async fn test_failed_source_leaves_readable_cache() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/horoscopes/weekly/leo");
            then.status(500);
        })
        .await;
    let dir = TempDir::new().unwrap();
    let (engine, mut events) = engine_in(&dir, &server, Clock::system());

    engine.initialize(&[Sign::Leo], &[Period::Weekly]).await;
    wait_for_cache_built(&mut events).await;

    let result = engine.query(Sign::Leo, Period::Weekly);
    assert!(result.content.contains("leo"));
    assert!(result.content.contains("weekly"));
    assert!(!result.from_cache);

    let on_disk = CacheStore::with_dir(dir.path().to_path_buf()).snapshot();
    assert!(on_disk.get(&CacheKey::new(Sign::Leo, Period::Weekly)).unwrap().placeholder);
    engine.shutdown();
}

#[tokio::test]
async fn test_simulated_new_year_refreshes_yearly_page() {
    let server = MockServer::start_async().await;
    let yearly_path = format!("/horoscopes/yearly{}/taurus", Local::now().year());
    let yearly = server
        .mock_async(|when, then| {
            when.method(GET).path(yearly_path.as_str());
            then.status(200).body("<p>The year ahead.</p>");
        })
        .await;
    let dir = TempDir::new().unwrap();
    let eve = to_local(
        NaiveDate::from_ymd_opt(2024, 12, 31)
            .unwrap()
            .and_hms_opt(23, 59, 0)
            .unwrap(),
    )
    .unwrap();
    let (engine, _events) = engine_in(&dir, &server, Clock::fixed(eve));
    engine.store().set_checked_at(eve.with_timezone(&Utc));
    engine.refresh_key(Sign::Taurus, Period::Yearly).await;
    yearly.assert_hits_async(1).await;

    let changed = engine
        .detect_and_apply_rollover(eve + chrono::Duration::minutes(2))
        .await;

    assert!(changed.contains(&Period::Yearly));
    yearly.assert_hits_async(2).await;
    assert_eq!(
        engine.query(Sign::Taurus, Period::Yearly).content,
        "The year ahead."
    );
}
