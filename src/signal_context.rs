// =============================================================================
// SignalContext — the immutable, per-tick view strategies compute over
// =============================================================================

use crate::calculations::{
    aggregate_15m, atr_15m_series, atr_baseline, oi_delta_15m_pct, oi_zscore, position_usdt, ret_5m,
    window_high_low,
};
use crate::market_data::{Ages, Candle1m, SymbolState};
use crate::runtime_config::RuntimeConfig;
use crate::types::ClockState;

const ATR_PERIOD: usize = 14;
const H20_MINUTES: i64 = 20;

/// Immutable per-symbol, per-tick view built from a `DataStore` snapshot.
/// Every derived field is `None` when the data to compute it is missing or
/// insufficient — strategies self-gate on that rather than the caller
/// deciding for them (spec.md §9: "exceptions-as-control" becomes absent
/// values here).
#[derive(Debug, Clone)]
pub struct SignalContext {
    pub symbol: String,
    pub now_ms: i64,

    pub price: Option<f64>,
    pub ret_5m: Option<f64>,
    pub atr_15m: Option<f64>,
    pub atr_15m_baseline: Option<f64>,
    pub funding_rate: Option<f64>,
    pub mark_price: Option<f64>,
    pub oi: Option<f64>,
    pub oi_zscore: Option<f64>,
    pub oi_delta_15m_pct: Option<f64>,
    pub last_20m_high: Option<f64>,
    pub last_20m_low: Option<f64>,
    pub recent_closed_candles: Vec<Candle1m>,

    pub price_fresh: bool,
    pub kline_fresh: bool,
    pub funding_fresh: bool,
    pub oi_fresh: bool,

    /// Raw ages backing the `*_fresh` flags above, kept around for
    /// strategies that apply a stricter threshold than the global staleness
    /// configuration (e.g. fake_breakout_reversal's 90s kline-age gate).
    pub ages: Ages,

    pub clock_state: ClockState,
}

impl SignalContext {
    /// All fields a strategy would need for a basic entry are present and
    /// the symbol isn't globally stale. Individual strategies still check
    /// their own specific indicators.
    pub fn has_price(&self) -> bool {
        self.price.is_some() && self.price_fresh
    }
}

/// Builds a `SignalContext` from a `DataStore` snapshot. Pure: no I/O, no
/// mutation. `ages` and `clock_state` are supplied by the caller
/// (`SourceManager`/`SignalService`), which owns freshness policy.
pub fn build_signal_context(
    symbol: &str,
    now_ms: i64,
    state: &SymbolState,
    ages: Ages,
    clock_state: ClockState,
    cfg: &RuntimeConfig,
) -> SignalContext {
    let price_fresh = ages
        .price_age_ms
        .map(|age| age <= cfg.stale_seconds * 1000)
        .unwrap_or(false);
    let kline_fresh = ages
        .kline_age_ms
        .map(|age| age <= cfg.kline_stale_ms)
        .unwrap_or(false);
    let funding_fresh = ages
        .funding_age_ms
        .map(|age| age <= cfg.rest_premiumindex_poll_seconds as i64 * 1000 * 3)
        .unwrap_or(false);
    let oi_fresh = ages
        .oi_age_ms
        .map(|age| age <= cfg.rest_oi_poll_seconds as i64 * 1000 * 3)
        .unwrap_or(false);

    let windows_15m = aggregate_15m(&state.candles);
    let atr_series = atr_15m_series(&windows_15m, ATR_PERIOD);
    let (last_20m_high, last_20m_low) = window_high_low(&state.candles, H20_MINUTES);

    SignalContext {
        symbol: symbol.to_string(),
        now_ms,
        price: state.price.map(|p| p.price),
        ret_5m: ret_5m(&state.candles),
        atr_15m: atr_series.last().copied(),
        atr_15m_baseline: atr_baseline(&atr_series),
        funding_rate: state.funding.map(|f| f.last_funding_rate),
        mark_price: state.funding.map(|f| f.mark_price),
        oi: state.open_interest.map(|o| o.oi_value),
        oi_zscore: oi_zscore(&state.oi_history),
        oi_delta_15m_pct: oi_delta_15m_pct(&state.oi_history, now_ms),
        last_20m_high,
        last_20m_low,
        recent_closed_candles: state.candles.clone(),

        price_fresh,
        kline_fresh,
        funding_fresh,
        oi_fresh,
        ages,

        clock_state,
    }
}

/// Convenience used by strategies: stop-distance-derived position size,
/// or `None` if the risk budget can't be expressed (entry == stop).
pub fn sized_position(entry: f64, stop: f64, max_risk_usdt: f64) -> Option<f64> {
    position_usdt(entry, stop, max_risk_usdt)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market_data::PriceTick;

    fn base_state() -> SymbolState {
        SymbolState { price: None, ..Default::default() }
    }

    #[test]
    fn price_not_fresh_when_absent() {
        let cfg = RuntimeConfig::default();
        let ctx = build_signal_context("BTCUSDT", 1000, &base_state(), Ages::default(), ClockState::Ok, &cfg);
        assert!(!ctx.has_price());
    }

    #[test]
    fn price_fresh_within_stale_seconds() {
        let cfg = RuntimeConfig::default();
        let mut state = base_state();
        state.price = Some(PriceTick { price: 100.0, event_time_ms: 0, received_time_ms: 0 });
        let ages = Ages { price_age_ms: Some(1000), ..Ages::default() };
        let ctx = build_signal_context("BTCUSDT", 1000, &state, ages, ClockState::Ok, &cfg);
        assert!(ctx.has_price());
        assert_eq!(ctx.price, Some(100.0));
    }
}
