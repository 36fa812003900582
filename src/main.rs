//! SunSigns - cached horoscopes on the terminal
//!
//! Prints the configured horoscopes from the local cache, fetching whatever
//! is missing or outdated. With `--watch` it keeps running and prints
//! updates as calendar rollovers refresh the cache.

use std::process::ExitCode;
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::Parser;
use tokio::sync::mpsc;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use sunsigns::cache::CacheStore;
use sunsigns::calendar::{to_local, Clock};
use sunsigns::cli::{Cli, StartupConfig};
use sunsigns::data::SunSignsClient;
use sunsigns::refresh::{RefreshEngine, RefreshMessage};

/// Initialize the tracing subscriber for logging.
///
/// Log level is controlled by:
/// 1. `--debug` flag sets level to DEBUG
/// 2. `RUST_LOG` environment variable (if set)
/// 3. Default is INFO
fn init_tracing(debug: bool) {
    let filter = if debug {
        EnvFilter::new("sunsigns=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("sunsigns=info"))
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(filter)
        .init();
}

/// Prints one engine message to stdout
fn render_message(message: &RefreshMessage) {
    match message {
        RefreshMessage::HoroscopeResult {
            sign,
            period,
            content,
            from_cache,
            error,
        } => {
            let source = if *from_cache { " (cached)" } else { "" };
            println!("== {} / {}{} ==", sign, period, source);
            println!("{}", content);
            if let Some(err) = error {
                println!("   [fetch failed: {}]", err);
            }
            println!();
        }
        RefreshMessage::ImageResult { sign, path } => match path {
            Some(path) => println!("image {}: {}", sign, path.display()),
            None => println!("image {}: unavailable", sign),
        },
        RefreshMessage::TerminalFailure {
            sign,
            period,
            attempts,
            cause,
        } => {
            println!(
                "!! {} / {} failed {} times, pausing: {}",
                sign, period, attempts, cause
            );
        }
        RefreshMessage::CacheBuilt => println!("-- cache ready --"),
        RefreshMessage::RolloverApplied { periods } => {
            let names: Vec<&str> = periods.iter().map(|p| p.as_str()).collect();
            println!("-- new {} --", names.join(", "));
        }
        RefreshMessage::PersistFailed(reason) => println!("!! cache not saved: {}", reason),
    }
}

fn drain(events: &mut mpsc::UnboundedReceiver<RefreshMessage>) {
    while let Ok(message) = events.try_recv() {
        render_message(&message);
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode, Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    init_tracing(cli.debug);

    let config = match StartupConfig::from_cli(&cli) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("Error: {}", err);
            return Ok(ExitCode::from(2));
        }
    };
    tracing::debug!("Starting with {:?}", config);

    let store = match &config.cache_dir {
        Some(dir) => CacheStore::with_dir(dir.clone()),
        None => CacheStore::new().ok_or("could not determine a cache directory")?,
    };
    let source = SunSignsClient::new().with_timeout(config.refresh.request_timeout);
    let clock = Arc::new(Clock::system());
    if let Some(naive) = config.simulate_date {
        let at = to_local(naive).ok_or("simulated date does not exist in the local timezone")?;
        clock.set_simulated_now(at);
    }

    let (engine, mut events) = RefreshEngine::new(
        Arc::new(store),
        Arc::new(source),
        clock,
        config.refresh.clone(),
    );

    engine.initialize(&config.signs, &config.periods).await;
    drain(&mut events);

    if !config.watch {
        // Let background refreshes started by the replay land before exiting.
        let deadline = Instant::now() + config.refresh.request_timeout + Duration::from_secs(1);
        while !engine.is_idle() && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        drain(&mut events);
        engine.shutdown();
        return Ok(ExitCode::SUCCESS);
    }

    let scheduler = engine.spawn_scheduler(config.tick);
    loop {
        tokio::select! {
            message = events.recv() => match message {
                Some(message) => render_message(&message),
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Shutting down");
                break;
            }
        }
    }

    scheduler.shutdown().await;
    engine.shutdown();
    Ok(ExitCode::SUCCESS)
}
