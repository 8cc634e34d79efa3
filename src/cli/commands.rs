//! CLI command implementations

use anyhow::{Context, Result};
use std::path::Path;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::{Config, DropPolicy};
use crate::engine::{Engine, EngineReport};
use crate::stats::persistence::SnapshotStore;
use crate::stream::pumpportal::{PumpPortalClient, SubscriptionSet};
use crate::stream::replay::ReplaySource;

/// Trade the live PumpPortal feed until interrupted
pub async fn run(mut config: Config, dry_run: bool) -> Result<()> {
    if dry_run {
        warn!("Running in DRY-RUN mode - snapshots are neither restored nor written");
        config.persistence.enabled = false;
    }

    info!("Starting pump.fun trader...");
    info!(
        "Simulated wallet: {} SOL, simulation_mode: {}",
        config.wallet.initial_balance_sol, config.transaction.simulation_mode.enabled
    );

    let cancel = CancellationToken::new();
    let (subscriptions, commands) = SubscriptionSet::new();
    let engine = Engine::new(config.clone(), subscriptions.clone(), cancel.clone(), true)
        .await
        .context("Failed to start engine")?;

    if let Some(url) = &config.price.refresh_url {
        engine.context().price().spawn_refresh(
            url.clone(),
            Duration::from_secs(config.price.refresh_interval_secs.max(1)),
            cancel.clone(),
        );
    }

    info!("Connecting to PumpPortal WebSocket...");
    let client = PumpPortalClient::new(
        config.feed.clone(),
        subscriptions,
        commands,
        engine.intake(),
        cancel.clone(),
    );
    let mut feed = tokio::spawn(client.run());
    let router = tokio::spawn(engine.run());

    info!("Trader started. Listening for new tokens...");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Interrupt received, shutting down..."),
        _ = cancel.cancelled() => warn!("Engine requested shutdown"),
        result = &mut feed => match result {
            Ok(Ok(())) => info!("Feed stopped"),
            Ok(Err(e)) => error!("Feed failed: {}", e),
            Err(e) => error!("Feed task panicked: {}", e),
        },
    }
    cancel.cancel();

    let report = router.await.context("Engine task panicked")??;
    print_report(&report);
    Ok(())
}

/// Backtest against a newline-delimited JSON capture
pub async fn replay(mut config: Config, file: &Path, seed: Option<u64>) -> Result<()> {
    if let Some(seed) = seed {
        config.transaction.simulation_mode.seed = Some(seed);
    }
    // a backtest must see every event and must not touch live snapshots
    config.backpressure.drop_policy = DropPolicy::Block;
    config.persistence.enabled = false;

    let cancel = CancellationToken::new();
    let (subscriptions, _commands) = SubscriptionSet::new();
    let engine = Engine::new(config, subscriptions, cancel.clone(), false)
        .await
        .context("Failed to start engine")?;
    let intake = engine.intake();
    let router = tokio::spawn(engine.run());

    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Interrupt received, stopping replay...");
                cancel.cancel();
            }
        });
    }

    let stats = ReplaySource::new(file)
        .run(intake.clone(), cancel.clone())
        .await
        .with_context(|| format!("Replay of {} failed", file.display()))?;
    intake.close();

    let report = router.await.context("Engine task panicked")??;

    println!("\n=== REPLAY ===\n");
    println!("File: {}", file.display());
    println!(
        "Lines: {}  Delivered: {}  Unparseable: {}",
        stats.lines, stats.delivered, stats.malformed
    );
    print_report(&report);
    Ok(())
}

/// Print what the last snapshot holds
pub async fn status(config: &Config) -> Result<()> {
    let store = SnapshotStore::new(&config.persistence.dir);
    info!("Loading snapshots from {}...", store.dir().display());

    let positions = store.load_positions().await.context("Failed to load positions snapshot")?;
    let analytics = store.load_analytics().await.context("Failed to load analytics snapshot")?;

    println!("\n=== TRADER STATUS ===\n");
    match &positions {
        Some(snapshot) => {
            println!(
                "Balance: {:.4} SOL (started with {:.4}, P&L {:+.4})",
                snapshot.wallet.balance_sol,
                snapshot.wallet.initial_balance_sol,
                snapshot.wallet.pnl_sol()
            );
            if let Some(closed_at) = snapshot.last_closed_at {
                println!("Last close: {}", format_ms(closed_at));
            }
            println!("Saved at: {}", format_ms(snapshot.saved_at));
        }
        None => println!("No positions snapshot found."),
    }

    if let Some(analytics) = &analytics {
        println!("\nTrades: {}", analytics.total_trades);
        println!("  Wins: {}", analytics.profitable_trades);
        println!("  Losses: {}", analytics.unprofitable_trades);
        println!("  Win rate: {:.1}%", analytics.win_rate());
        println!("  Total P&L: {:+.4} SOL", analytics.total_pnl_sol);
    }

    println!("\n=== OPEN POSITION ===\n");
    match positions.and_then(|s| s.position) {
        Some(position) => {
            println!("{} ({})", position.symbol, position.mint);
            println!(
                "  Entry: {:.10} SOL at {}",
                position.entry_price,
                format_ms(position.entry_time)
            );
            println!(
                "  Size: {:.4} SOL, remaining {:.0}%",
                position.size,
                position.remaining_size * 100.0
            );
            println!("  Realized: {:+.4} SOL", position.realized_pnl_sol);
            println!("  Unrealized: {:+.4} SOL", position.unrealized_pnl_sol);
        }
        None => println!("No open position."),
    }

    Ok(())
}

/// Show the effective configuration
pub fn show_config(config: &Config) -> Result<()> {
    println!("{}", config.summary());
    Ok(())
}

fn print_report(report: &EngineReport) {
    let analytics = &report.analytics;
    println!("\n=== SESSION SUMMARY ===\n");
    println!(
        "Balance: {:.4} SOL (P&L {:+.4})",
        report.wallet.balance_sol,
        report.wallet.pnl_sol()
    );
    println!(
        "Trades: {}  Wins: {}  Losses: {}  Win rate: {:.1}%",
        analytics.total_trades,
        analytics.profitable_trades,
        analytics.unprofitable_trades,
        analytics.win_rate()
    );
    println!(
        "Largest win: {:+.4} SOL  Largest loss: {:+.4} SOL",
        analytics.largest_win_sol, analytics.largest_loss_sol
    );
    println!(
        "Tokens admitted: {}  Safety passes: {}  failures: {}  Missed: {}",
        analytics.tokens_admitted,
        analytics.safety_passes,
        analytics.safety_failures,
        analytics.missed_opportunities
    );
    println!(
        "Events dropped: {}  malformed: {}  duplicate: {}",
        analytics.dropped_events, analytics.malformed_events, analytics.duplicate_events
    );
    if !analytics.trade_execution_latency.is_empty() {
        println!(
            "Execution latency: mean {:.0}ms  p95 {}ms",
            analytics.trade_execution_latency.mean(),
            analytics.trade_execution_latency.percentile(95.0)
        );
    }
    if let Some(position) = &report.open_position {
        println!(
            "\nStill holding {} ({:.0}% of {:.4} SOL)",
            position.symbol,
            position.remaining_size * 100.0,
            position.size
        );
    }
    println!("Tokens still tracked: {}", report.tracked_tokens);
}

fn format_ms(ms: i64) -> String {
    chrono::DateTime::from_timestamp_millis(ms)
        .map(|t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| ms.to_string())
}
