// =============================================================================
// perp-signal-engine — Main Entry Point
// =============================================================================
//
// Wires the data-decision pipeline together: SourceManager keeps DataStore
// fresh, each tick builds a SignalContext per symbol, runs every registered
// strategy, arbitrates the candidates down to at most one winner, gates it
// through RiskEngine, and hands a surviving card to the notifier. Per-symbol
// failures are caught and logged (spec.md §7); only fatal init errors abort
// the process.
// =============================================================================

mod arbitrator;
mod calculations;
mod exchange;
mod market_data;
mod notifier;
mod risk;
mod runtime_config;
mod signal_context;
mod source_manager;
mod strategies;
mod types;

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::arbitrator::Arbitrator;
use crate::exchange::ExchangeClientREST;
use crate::market_data::{Ages, DataStore};
use crate::notifier::{LoggingNotifier, Notifier};
use crate::risk::{RiskDecision, RiskEngine};
use crate::runtime_config::RuntimeConfig;
use crate::signal_context::build_signal_context;
use crate::source_manager::SourceManager;
use crate::strategies::{default_registry, Strategy};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("perp-signal-engine starting");

    let cfg = RuntimeConfig::from_env();
    info!(symbols = ?cfg.symbols, poll_seconds = cfg.poll_seconds, data_source_preferred = ?cfg.data_source_preferred, "configuration loaded");

    let datastore = Arc::new(DataStore::new());
    let rest = ExchangeClientREST::new();
    let source_manager = Arc::new(SourceManager::new(cfg.symbols.clone(), datastore.clone(), rest, cfg.clone()));
    let arbitrator = Arc::new(Arbitrator::new());
    let risk_engine = Arc::new(RiskEngine::new(&cfg, now_ms()));
    let strategies = default_registry();
    let notifier: Arc<dyn Notifier> = Arc::new(LoggingNotifier);

    info!("signal service tick loop starting");
    run_tick_loop(&cfg, &datastore, &source_manager, &arbitrator, &risk_engine, &strategies, notifier.as_ref()).await;

    source_manager.close().await;
    info!("perp-signal-engine shut down complete");
    Ok(())
}

/// Drives one tick per `poll_seconds`, refreshing `SourceManager` and then
/// evaluating every configured symbol, until Ctrl+C (spec.md §4.9, §5
/// "Cancellation").
async fn run_tick_loop(
    cfg: &RuntimeConfig,
    datastore: &Arc<DataStore>,
    source_manager: &Arc<SourceManager>,
    arbitrator: &Arc<Arbitrator>,
    risk_engine: &Arc<RiskEngine>,
    strategies: &[Box<dyn Strategy>],
    notifier: &dyn Notifier,
) {
    let mut interval = tokio::time::interval(Duration::from_secs(cfg.poll_seconds.max(1)));
    let mut shutdown = Box::pin(tokio::signal::ctrl_c());

    loop {
        tokio::select! {
            _ = interval.tick() => {
                let now = now_ms();
                let ages = source_manager.refresh(now).await;

                for symbol in &cfg.symbols {
                    let symbol_ages = ages.get(symbol).copied().unwrap_or_default();
                    if let Err(err) = run_symbol_tick(
                        symbol,
                        now,
                        symbol_ages,
                        datastore,
                        source_manager,
                        cfg,
                        strategies,
                        arbitrator,
                        risk_engine,
                        notifier,
                    ) {
                        error!(symbol = %symbol, phase = "tick", reason = %err, "symbol tick failed");
                    }
                }
            }
            result = &mut shutdown => {
                if let Err(err) = result {
                    warn!(error = %err, "ctrl_c listener failed, stopping anyway");
                } else {
                    warn!("shutdown signal received, stopping gracefully");
                }
                break;
            }
        }
    }
}

/// One symbol's worth of the pipeline: build context, run strategies,
/// arbitrate, gate through risk, dispatch. Synchronous and infallible in
/// practice (every step already maps failure to `None`/log-and-continue);
/// returns `Result` only so the caller's per-symbol `{symbol, phase}`
/// logging stays in one place regardless of which step might one day grow
/// a real error path.
#[allow(clippy::too_many_arguments)]
fn run_symbol_tick(
    symbol: &str,
    now: i64,
    ages: Ages,
    datastore: &Arc<DataStore>,
    source_manager: &Arc<SourceManager>,
    cfg: &RuntimeConfig,
    strategies: &[Box<dyn Strategy>],
    arbitrator: &Arc<Arbitrator>,
    risk_engine: &Arc<RiskEngine>,
    notifier: &dyn Notifier,
) -> anyhow::Result<()> {
    let state = datastore.snapshot(symbol);
    let clock_state = source_manager.clock_state();
    let ctx = build_signal_context(symbol, now, &state, ages, clock_state, cfg);

    if !ctx.has_price() {
        return Ok(());
    }

    let candidates: Vec<_> = strategies.iter().filter_map(|s| s.generate(&ctx, cfg)).collect();
    if candidates.is_empty() {
        return Ok(());
    }

    let winner = match arbitrator.choose_best(&candidates, cfg, now) {
        Some(card) => card,
        None => return Ok(()),
    };

    match risk_engine.evaluate(&winner, now) {
        RiskDecision::Allowed => {
            risk_engine.record_trigger(&winner.symbol, now);
            arbitrator.record_dispatch(&winner.symbol, now);
            notifier.send_card(&winner);
        }
        RiskDecision::Blocked(reason) => {
            info!(symbol = %symbol, reason, "risk engine blocked candidate");
        }
    }

    Ok(())
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
