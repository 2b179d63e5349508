// =============================================================================
// funding_oi_skew — counter-trend fade of an extreme, crowded funding skew
// =============================================================================

use crate::runtime_config::RuntimeConfig;
use crate::signal_context::SignalContext;
use crate::types::{ProposalCard, Side};

use super::{atr_stop, make_card};

pub struct FundingOiSkew;

impl super::Strategy for FundingOiSkew {
    fn name(&self) -> &'static str {
        "funding_oi_skew"
    }

    fn generate(&self, ctx: &SignalContext, cfg: &RuntimeConfig) -> Option<ProposalCard> {
        if !ctx.price_fresh || !ctx.funding_fresh || !ctx.oi_fresh {
            return None;
        }

        let price = ctx.price?;
        let atr = ctx.atr_15m?;
        let funding = ctx.funding_rate?;
        let oi_z = ctx.oi_zscore?;
        let ret_5m = ctx.ret_5m?;

        if funding.abs() < cfg.funding_extreme {
            return None;
        }
        if oi_z < cfg.oi_zscore_threshold {
            return None;
        }
        if funding.signum() != ret_5m.signum() {
            return None;
        }

        // Crowded-long (positive funding paid by longs) fades short;
        // crowded-short fades long.
        let side = if funding > 0.0 { Side::Short } else { Side::Long };
        let stop = atr_stop(side, price, atr);

        let confidence = confidence_from_skew(funding.abs(), cfg.funding_extreme, oi_z, cfg.oi_zscore_threshold);
        let rationale = format!(
            "funding {:.4} crowded with oi_zscore {:.2}, fading {}",
            funding, oi_z, if side == Side::Short { "longs" } else { "shorts" }
        );

        make_card(ctx, cfg, self.name(), side, price, stop, cfg.priority_funding_oi_skew, confidence, rationale)
    }
}

fn confidence_from_skew(funding_abs: f64, funding_extreme: f64, oi_z: f64, oi_threshold: f64) -> u8 {
    let funding_ratio = if funding_extreme > 0.0 { funding_abs / funding_extreme } else { 1.0 };
    let oi_ratio = if oi_threshold > 0.0 { oi_z / oi_threshold } else { 1.0 };
    let blended = (funding_ratio + oi_ratio) / 2.0;
    (50.0 + blended.clamp(0.0, 5.0) * 10.0) as u8
}
