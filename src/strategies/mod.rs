// =============================================================================
// Strategies — pluggable pure predicates producing ProposalCard candidates
// =============================================================================

mod fake_breakout_reversal;
mod funding_oi_skew;
mod liquidation_follow;
mod vol_breakout;

pub use fake_breakout_reversal::FakeBreakoutReversal;
pub use funding_oi_skew::FundingOiSkew;
pub use liquidation_follow::LiquidationFollow;
pub use vol_breakout::VolBreakoutCard;

use crate::runtime_config::RuntimeConfig;
use crate::signal_context::SignalContext;
use crate::types::{ProposalCard, Side};

/// Shared interface every strategy implements. `generate` must be pure over
/// `ctx` and self-gate: any missing or stale required indicator yields
/// `None` rather than a best-effort guess (spec.md §4.6).
pub trait Strategy: Send + Sync {
    fn name(&self) -> &'static str;
    fn generate(&self, ctx: &SignalContext, cfg: &RuntimeConfig) -> Option<ProposalCard>;
}

/// Default stop distance from ATR, used by every strategy except
/// fake_breakout_reversal, which derives its own stop from the sweep candle.
pub fn atr_stop(side: Side, entry: f64, atr_15m: f64) -> f64 {
    match side {
        Side::Long => entry - 1.2 * atr_15m,
        Side::Short => entry + 1.2 * atr_15m,
    }
}

/// Assembles a `ProposalCard`, returning `None` if the implied position
/// size is undefined (entry == stop) rather than emitting a broken card.
pub fn make_card(
    ctx: &SignalContext,
    cfg: &RuntimeConfig,
    strategy: &'static str,
    side: Side,
    entry: f64,
    stop: f64,
    priority: i32,
    confidence: u8,
    rationale: String,
) -> Option<ProposalCard> {
    let position_usdt = crate::signal_context::sized_position(entry, stop, cfg.max_risk_usdt)?;
    Some(ProposalCard {
        symbol: ctx.symbol.clone(),
        strategy: strategy.to_string(),
        side,
        entry,
        stop,
        leverage_suggest: cfg.leverage_suggest,
        position_usdt,
        max_risk_usdt: cfg.max_risk_usdt,
        ttl_minutes: cfg.ttl_minutes,
        rationale,
        priority,
        confidence: confidence.min(100),
        created_at_ms: ctx.now_ms,
    })
}

/// Registration order only matters for the arbitrator's final lexicographic
/// tie-break; it has no bearing on which strategies run.
pub fn default_registry() -> Vec<Box<dyn Strategy>> {
    vec![
        Box::new(FakeBreakoutReversal),
        Box::new(FundingOiSkew),
        Box::new(LiquidationFollow),
        Box::new(VolBreakoutCard),
    ]
}
