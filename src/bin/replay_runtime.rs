//! Replay runtime: fetch a session (cache-aware) and play its timeline
//! to the log at a chosen speed.
//!
//! Usage: replay_runtime <session-path> [speed]
//!   e.g. replay_runtime 2024/2024-05-26_Monaco_Grand_Prix/2024-05-26_Race 10

use gridflow::config::Config;
use gridflow::fetcher::HttpFeedSource;
use gridflow::replay::{ReplayDriver, ReplayEngine, ReplayStatus};
use gridflow::session::SessionService;
use gridflow::timeline::TimelineBuilder;
use std::sync::Arc;

#[tokio::main]
async fn main() {
    dotenv::dotenv().ok();

    // Logs to stderr so piped output stays clean
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .target(env_logger::Target::Stderr)
        .init();

    if let Err(e) = run().await {
        log::error!("❌ {}", e);
        if let Some(hint) = e.retry_hint() {
            log::error!("   hint: {}", hint);
        }
        std::process::exit(1);
    }
}

async fn run() -> Result<(), gridflow::error::PipelineError> {
    let mut args = std::env::args().skip(1);
    let Some(session_id) = args.next() else {
        eprintln!("usage: replay_runtime <session-path> [speed]");
        std::process::exit(2);
    };
    let speed: f64 = args.next().and_then(|s| s.parse().ok()).unwrap_or(1.0);

    let config = Config::from_env();

    log::info!("🚀 Starting gridflow replay runtime");
    log::info!("📊 Configuration:");
    log::info!("   Base URL: {}", config.base_url);
    log::info!("   Cache dir: {}", config.cache_dir);
    log::info!(
        "   Cache capacity: {} memory / {} disk sessions",
        config.memory_capacity,
        config.disk_capacity
    );

    let source = HttpFeedSource::new(&config)?;
    let service = SessionService::new(source, config.clone())?;

    let session = service.fetch_and_cache(&session_id).await?;
    let stats = service.cache_stats();
    log::info!(
        "💾 Cache: {}/{} sessions, {:.1} MB",
        stats.total_sessions,
        stats.max_sessions,
        stats.total_size_mb
    );

    let report = service.validate_quality(&session_id).await?;
    log::info!(
        "⭐ Quality: {} position snapshots, {} star(s)",
        report.snapshot_count,
        report.stars
    );
    if !report.valid {
        log::warn!("⚠️  Position data too thin for a meaningful replay");
    }

    let (context, timeline) = TimelineBuilder::new().build(&session);
    log::info!(
        "🧭 {} ({}, {}): {} events over {}s with {} drivers",
        context.meta.name,
        context.meta.circuit,
        context.meta.session_type,
        timeline.len(),
        timeline.duration_ms() / 1_000,
        context.drivers.len()
    );

    let engine = ReplayEngine::new(context, Arc::new(timeline));
    let driver = ReplayDriver::spawn(engine, config.tick_interval_ms);
    driver.set_speed(speed);
    driver.play();
    log::info!("▶️  Playing at {}x", speed);

    let mut updates = driver.subscribe();
    let mut last_logged_pct = -10i64;
    loop {
        if updates.changed().await.is_err() {
            break;
        }
        let snapshot = updates.borrow_and_update().clone();

        let pct = snapshot.progress as i64;
        if pct / 10 > last_logged_pct / 10 {
            log::info!(
                "   {:>3}% | {} drivers placed | track status {}",
                pct,
                snapshot.state.positions.len(),
                snapshot
                    .state
                    .track_status
                    .as_ref()
                    .map(|t| t.label.as_str())
                    .unwrap_or("-")
            );
            last_logged_pct = pct;
        }

        if snapshot.status == ReplayStatus::Paused && snapshot.progress >= 100.0 {
            log::info!(
                "🏁 Replay complete: {} race-control messages, {} laps recorded",
                snapshot.state.race_control_log.len(),
                snapshot.state.laps.len()
            );
            break;
        }
    }

    driver.destroy();
    Ok(())
}
