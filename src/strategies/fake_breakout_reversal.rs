// =============================================================================
// fake_breakout_reversal — fades a liquidity sweep against the 20m range
// =============================================================================

use crate::runtime_config::RuntimeConfig;
use crate::signal_context::SignalContext;
use crate::types::{ProposalCard, Side};

use super::make_card;

const KLINE_MAX_AGE_MS: i64 = 90_000;

pub struct FakeBreakoutReversal;

impl super::Strategy for FakeBreakoutReversal {
    fn name(&self) -> &'static str {
        "fake_breakout_reversal"
    }

    fn generate(&self, ctx: &SignalContext, cfg: &RuntimeConfig) -> Option<ProposalCard> {
        if !ctx.price_fresh {
            return None;
        }
        if ctx.ages.kline_age_ms.map(|age| age > KLINE_MAX_AGE_MS).unwrap_or(true) {
            return None;
        }

        let price = ctx.price?;
        let atr = ctx.atr_15m?;
        if atr / price < cfg.min_atr_pct {
            return None;
        }

        let candle = ctx.recent_closed_candles.last()?;
        let h20 = ctx.last_20m_high?;
        let l20 = ctx.last_20m_low?;

        let body = (candle.close - candle.open).abs();
        if body <= 0.0 {
            return None;
        }
        let upper_wick = candle.high - candle.open.max(candle.close);
        let lower_wick = candle.open.min(candle.close) - candle.low;

        let upward_sweep = candle.high > h20 * (1.0 + cfg.sweep_pct)
            && candle.close < h20
            && upper_wick / body >= cfg.wick_body_ratio;
        let downward_sweep = candle.low < l20 * (1.0 - cfg.sweep_pct)
            && candle.close > l20
            && lower_wick / body >= cfg.wick_body_ratio;

        let (side, stop, excess_pct) = if upward_sweep {
            (
                Side::Short,
                candle.high + cfg.stop_buffer_atr * atr,
                (candle.high - h20) / h20,
            )
        } else if downward_sweep {
            (
                Side::Long,
                candle.low - cfg.stop_buffer_atr * atr,
                (l20 - candle.low) / l20,
            )
        } else {
            return None;
        };

        let confidence = confidence_from_excess(excess_pct, cfg.sweep_pct);
        let rationale = format!(
            "sweep of {} range with rejection, wick/body {:.2}",
            if side == Side::Short { "upper" } else { "lower" },
            upper_wick.max(lower_wick) / body
        );

        make_card(ctx, cfg, self.name(), side, price, stop, cfg.priority_fake_breakout_reversal, confidence, rationale)
    }
}

fn confidence_from_excess(excess_pct: f64, sweep_pct: f64) -> u8 {
    if sweep_pct <= 0.0 {
        return 60;
    }
    let ratio = (excess_pct / sweep_pct).max(0.0);
    (60.0 + ratio.min(4.0) * 10.0) as u8
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market_data::{Ages, Candle1m};
    use crate::strategies::Strategy;
    use crate::types::ClockState;

    fn candle(open_time: i64, open: f64, high: f64, low: f64, close: f64) -> Candle1m {
        Candle1m { open_time, open, high, low, close, volume: 1.0, close_time: open_time + 59_999, is_closed: true }
    }

    fn ctx_with_sweep(upward: bool) -> SignalContext {
        // 20 minutes of flat range, then one sweeping candle.
        let mut candles: Vec<Candle1m> = (0..20).map(|i| candle(i * 60_000, 100.0, 100.5, 99.5, 100.0)).collect();
        let sweep = if upward {
            candle(20 * 60_000, 100.0, 105.0, 99.9, 100.2)
        } else {
            candle(20 * 60_000, 100.0, 100.1, 95.0, 99.8)
        };
        candles.push(sweep);

        SignalContext {
            symbol: "BTCUSDT".to_string(),
            now_ms: 20 * 60_000 + 59_999,
            price: Some(100.1),
            ret_5m: Some(0.0),
            atr_15m: Some(1.0),
            atr_15m_baseline: Some(1.0),
            funding_rate: Some(0.0),
            mark_price: Some(100.0),
            oi: Some(1000.0),
            oi_zscore: None,
            oi_delta_15m_pct: None,
            last_20m_high: Some(100.5),
            last_20m_low: Some(99.5),
            recent_closed_candles: candles,
            price_fresh: true,
            kline_fresh: true,
            funding_fresh: true,
            oi_fresh: true,
            ages: Ages { kline_age_ms: Some(1000), ..Ages::default() },
            clock_state: ClockState::Ok,
        }
    }

    #[test]
    fn upward_sweep_yields_short() {
        let ctx = ctx_with_sweep(true);
        let cfg = RuntimeConfig::default();
        let card = FakeBreakoutReversal.generate(&ctx, &cfg).expect("expected a card");
        assert_eq!(card.side, Side::Short);
        assert!(card.is_risk_coherent());
    }

    #[test]
    fn downward_sweep_yields_long() {
        let ctx = ctx_with_sweep(false);
        let cfg = RuntimeConfig::default();
        let card = FakeBreakoutReversal.generate(&ctx, &cfg).expect("expected a card");
        assert_eq!(card.side, Side::Long);
        assert!(card.is_risk_coherent());
    }

    #[test]
    fn stale_kline_self_gates() {
        let mut ctx = ctx_with_sweep(true);
        ctx.ages.kline_age_ms = Some(KLINE_MAX_AGE_MS + 1);
        let cfg = RuntimeConfig::default();
        assert!(FakeBreakoutReversal.generate(&ctx, &cfg).is_none());
    }
}
