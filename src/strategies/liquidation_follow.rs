// =============================================================================
// liquidation_follow — trend-follow on a funding-confirmed OI surge
// =============================================================================

use crate::runtime_config::RuntimeConfig;
use crate::signal_context::SignalContext;
use crate::types::{ProposalCard, Side};

use super::{atr_stop, make_card};

pub struct LiquidationFollow;

impl super::Strategy for LiquidationFollow {
    fn name(&self) -> &'static str {
        "liquidation_follow"
    }

    fn generate(&self, ctx: &SignalContext, cfg: &RuntimeConfig) -> Option<ProposalCard> {
        if !ctx.price_fresh || !ctx.funding_fresh || !ctx.oi_fresh {
            return None;
        }

        let price = ctx.price?;
        let atr = ctx.atr_15m?;
        let funding = ctx.funding_rate?;
        let ret_5m = ctx.ret_5m?;
        let oi_delta = ctx.oi_delta_15m_pct?;

        if oi_delta < cfg.oi_delta_pct {
            return None;
        }
        if ret_5m.abs() < cfg.return_threshold {
            return None;
        }
        if funding.signum() != ret_5m.signum() {
            return None;
        }

        let side = if ret_5m >= 0.0 { Side::Long } else { Side::Short };
        let stop = atr_stop(side, price, atr);

        let confidence = confidence_from_trend(oi_delta, cfg.oi_delta_pct, ret_5m.abs(), cfg.return_threshold);
        let rationale = format!(
            "oi surged {:.2}% in 15m with ret_5m {:.4} and confirming funding, following trend",
            oi_delta * 100.0,
            ret_5m
        );

        make_card(ctx, cfg, self.name(), side, price, stop, cfg.priority_liquidation_follow, confidence, rationale)
    }
}

fn confidence_from_trend(oi_delta: f64, oi_delta_pct: f64, ret_abs: f64, return_threshold: f64) -> u8 {
    let oi_ratio = if oi_delta_pct > 0.0 { oi_delta / oi_delta_pct } else { 1.0 };
    let ret_ratio = if return_threshold > 0.0 { ret_abs / return_threshold } else { 1.0 };
    let blended = (oi_ratio + ret_ratio) / 2.0;
    (50.0 + blended.clamp(0.0, 5.0) * 10.0) as u8
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market_data::Ages;
    use crate::strategies::Strategy;
    use crate::types::ClockState;

    fn base_ctx() -> SignalContext {
        SignalContext {
            symbol: "ETHUSDT".to_string(),
            now_ms: 0,
            price: Some(100.0),
            ret_5m: Some(0.02),
            atr_15m: Some(1.0),
            atr_15m_baseline: Some(1.0),
            funding_rate: Some(0.0005),
            mark_price: Some(100.0),
            oi: Some(1000.0),
            oi_zscore: None,
            oi_delta_15m_pct: Some(0.08),
            last_20m_high: None,
            last_20m_low: None,
            recent_closed_candles: Vec::new(),
            price_fresh: true,
            kline_fresh: true,
            funding_fresh: true,
            oi_fresh: true,
            ages: Ages::default(),
            clock_state: ClockState::Ok,
        }
    }

    #[test]
    fn positive_return_follows_long() {
        let ctx = base_ctx();
        let cfg = RuntimeConfig::default();
        let card = LiquidationFollow.generate(&ctx, &cfg).expect("expected a card");
        assert_eq!(card.side, Side::Long);
        assert!(card.is_risk_coherent());
    }

    #[test]
    fn negative_return_follows_short() {
        let mut ctx = base_ctx();
        ctx.ret_5m = Some(-0.02);
        ctx.funding_rate = Some(-0.0005);
        let cfg = RuntimeConfig::default();
        let card = LiquidationFollow.generate(&ctx, &cfg).expect("expected a card");
        assert_eq!(card.side, Side::Short);
    }

    #[test]
    fn weak_oi_surge_self_gates() {
        let mut ctx = base_ctx();
        ctx.oi_delta_15m_pct = Some(0.001);
        let cfg = RuntimeConfig::default();
        assert!(LiquidationFollow.generate(&ctx, &cfg).is_none());
    }
}
