// =============================================================================
// vol_breakout_card — momentum or ATR-spike breakout follow
// =============================================================================

use crate::runtime_config::RuntimeConfig;
use crate::signal_context::SignalContext;
use crate::types::{ProposalCard, Side};

use super::{atr_stop, make_card};

pub struct VolBreakoutCard;

impl super::Strategy for VolBreakoutCard {
    fn name(&self) -> &'static str {
        "vol_breakout_card"
    }

    fn generate(&self, ctx: &SignalContext, cfg: &RuntimeConfig) -> Option<ProposalCard> {
        if !ctx.price_fresh || !ctx.kline_fresh {
            return None;
        }

        let price = ctx.price?;
        let atr = ctx.atr_15m?;
        // Side is read off ret_5m, so it must be present even when the
        // trigger condition is the ATR-spike branch alone.
        let ret_5m = ctx.ret_5m?;

        let return_trigger = ret_5m.abs() > cfg.return_threshold;
        let atr_spike_trigger = ctx
            .atr_15m_baseline
            .map(|baseline| atr > baseline * cfg.atr_spike_multiplier)
            .unwrap_or(false);

        if !return_trigger && !atr_spike_trigger {
            return None;
        }

        let side = if ret_5m >= 0.0 { Side::Long } else { Side::Short };
        let stop = atr_stop(side, price, atr);

        let confidence = confidence_from_trigger(ret_5m.abs(), cfg.return_threshold, atr_spike_trigger);
        let rationale = if atr_spike_trigger {
            format!("atr_15m {:.4} spiked above baseline*{:.1}", atr, cfg.atr_spike_multiplier)
        } else {
            format!("ret_5m {:.4} exceeded threshold {:.4}", ret_5m, cfg.return_threshold)
        };

        make_card(ctx, cfg, self.name(), side, price, stop, cfg.priority_vol_breakout_card, confidence, rationale)
    }
}

fn confidence_from_trigger(ret_abs: f64, return_threshold: f64, atr_spike_trigger: bool) -> u8 {
    let ret_ratio = if return_threshold > 0.0 { ret_abs / return_threshold } else { 1.0 };
    let base = 40.0 + ret_ratio.clamp(0.0, 4.0) * 10.0;
    let base = if atr_spike_trigger { base + 10.0 } else { base };
    base.min(100.0) as u8
}
