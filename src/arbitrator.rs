// =============================================================================
// Arbitrator — collapses candidates to at most one winner per symbol/tick
// =============================================================================

use std::collections::HashMap;

use parking_lot::Mutex;

use crate::runtime_config::RuntimeConfig;
use crate::types::{ProposalCard, Side};

/// Per-symbol record of the last dispatched card, used for the dedupe
/// window (spec.md §4.7 step 1).
#[derive(Default)]
struct DispatchRegistry {
    last_dispatched_at_ms: HashMap<String, i64>,
}

pub struct Arbitrator {
    registry: Mutex<DispatchRegistry>,
}

impl Arbitrator {
    pub fn new() -> Self {
        Self { registry: Mutex::new(DispatchRegistry::default()) }
    }

    /// Picks the single winner among `candidates` (already filtered to one
    /// symbol, one tick), or `None`. Does not mutate the dedupe registry —
    /// call `record_dispatch` once the winner actually clears risk, so a
    /// risk-blocked winner doesn't consume the dedupe window.
    pub fn choose_best(&self, candidates: &[ProposalCard], cfg: &RuntimeConfig, now_ms: i64) -> Option<ProposalCard> {
        if candidates.is_empty() {
            return None;
        }
        let symbol = &candidates[0].symbol;

        if let Some(last) = self.registry.lock().last_dispatched_at_ms.get(symbol) {
            if now_ms - last < cfg.dedupe_window_seconds * 1000 {
                return None;
            }
        }

        let clusters = collapse_similar(candidates, cfg);
        clusters.into_iter().max_by(|a, b| tie_break_order(a, b))
    }

    pub fn record_dispatch(&self, symbol: &str, now_ms: i64) {
        self.registry.lock().last_dispatched_at_ms.insert(symbol.to_string(), now_ms);
    }
}

impl Default for Arbitrator {
    fn default() -> Self {
        Self::new()
    }
}

/// Groups candidates by side, collapses each group's similar cards to the
/// best one (by tie-break order), returns the survivors across both sides.
fn collapse_similar(candidates: &[ProposalCard], cfg: &RuntimeConfig) -> Vec<ProposalCard> {
    let mut long_group: Vec<ProposalCard> = Vec::new();
    let mut short_group: Vec<ProposalCard> = Vec::new();
    for c in candidates {
        match c.side {
            Side::Long => long_group.push(c.clone()),
            Side::Short => short_group.push(c.clone()),
        }
    }

    let mut survivors = Vec::new();
    for group in [long_group, short_group] {
        survivors.extend(collapse_group(group, cfg));
    }
    survivors
}

fn collapse_group(mut group: Vec<ProposalCard>, cfg: &RuntimeConfig) -> Vec<ProposalCard> {
    let mut clusters: Vec<Vec<ProposalCard>> = Vec::new();
    'outer: while let Some(card) = group.pop() {
        for cluster in clusters.iter_mut() {
            if is_similar(&cluster[0], &card, cfg) {
                cluster.push(card);
                continue 'outer;
            }
        }
        clusters.push(vec![card]);
    }

    clusters
        .into_iter()
        .map(|cluster| {
            cluster
                .into_iter()
                .max_by(|a, b| tie_break_order(a, b))
                .expect("cluster is non-empty by construction")
        })
        .collect()
}

fn is_similar(a: &ProposalCard, b: &ProposalCard, cfg: &RuntimeConfig) -> bool {
    let entry_close = ((a.entry - b.entry).abs() / a.entry) <= cfg.entry_similar_pct;
    let stop_close = ((a.stop - b.stop).abs() / a.stop) <= cfg.stop_similar_pct;
    entry_close && stop_close
}

/// Higher priority wins; then higher confidence; then shorter ttl; then
/// lexicographically smaller strategy name (spec.md §4.7 step 3). Returns
/// `Greater` when `a` should win over `b`, matching `Iterator::max_by`.
fn tie_break_order(a: &ProposalCard, b: &ProposalCard) -> std::cmp::Ordering {
    a.priority
        .cmp(&b.priority)
        .then(a.confidence.cmp(&b.confidence))
        .then(b.ttl_minutes.cmp(&a.ttl_minutes)) // shorter ttl wins => reverse
        .then(b.strategy.cmp(&a.strategy)) // lexicographically smaller wins => reverse
}

#[cfg(test)]
mod tests {
    use super::*;

    fn card(strategy: &str, side: Side, priority: i32, confidence: u8, ttl: u32, entry: f64, stop: f64) -> ProposalCard {
        ProposalCard {
            symbol: "BTCUSDT".to_string(),
            strategy: strategy.to_string(),
            side,
            entry,
            stop,
            leverage_suggest: 5,
            position_usdt: 100.0,
            max_risk_usdt: 10.0,
            ttl_minutes: ttl,
            rationale: String::new(),
            priority,
            confidence,
            created_at_ms: 0,
        }
    }

    #[test]
    fn higher_priority_wins_dedupe_scenario() {
        let cfg = RuntimeConfig::default();
        let arb = Arbitrator::new();
        let candidates = vec![
            card("fake_breakout_reversal", Side::Long, 100, 70, 10, 100.0, 98.0),
            card("vol_breakout_card", Side::Long, 40, 90, 15, 100.0, 98.0),
        ];
        let winner = arb.choose_best(&candidates, &cfg, 0).unwrap();
        assert_eq!(winner.strategy, "fake_breakout_reversal");
    }

    #[test]
    fn dedupe_window_blocks_repeat_within_interval() {
        let cfg = RuntimeConfig::default();
        let arb = Arbitrator::new();
        arb.record_dispatch("BTCUSDT", 0);
        let candidates = vec![card("vol_breakout_card", Side::Long, 40, 90, 15, 100.0, 98.0)];
        let winner = arb.choose_best(&candidates, &cfg, (cfg.dedupe_window_seconds - 1) * 1000);
        assert!(winner.is_none());
    }

    #[test]
    fn dedupe_window_clears_after_interval() {
        let cfg = RuntimeConfig::default();
        let arb = Arbitrator::new();
        arb.record_dispatch("BTCUSDT", 0);
        let candidates = vec![card("vol_breakout_card", Side::Long, 40, 90, 15, 100.0, 98.0)];
        let winner = arb.choose_best(&candidates, &cfg, (cfg.dedupe_window_seconds + 1) * 1000);
        assert!(winner.is_some());
    }

    #[test]
    fn similar_cards_in_same_direction_collapse() {
        let cfg = RuntimeConfig::default();
        let arb = Arbitrator::new();
        let candidates = vec![
            card("vol_breakout_card", Side::Long, 40, 50, 15, 100.0, 98.0),
            card("liquidation_follow", Side::Long, 60, 55, 10, 100.05, 98.02),
        ];
        let winner = arb.choose_best(&candidates, &cfg, 0).unwrap();
        assert_eq!(winner.strategy, "liquidation_follow");
    }

    #[test]
    fn choose_best_returns_element_of_input_or_none() {
        let cfg = RuntimeConfig::default();
        let arb = Arbitrator::new();
        let candidates = vec![card("vol_breakout_card", Side::Long, 40, 50, 15, 100.0, 98.0)];
        let winner = arb.choose_best(&candidates, &cfg, 0);
        assert!(winner.map(|w| w.strategy == "vol_breakout_card").unwrap_or(true));
    }
}
