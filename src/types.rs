// =============================================================================
// Shared types used across the signal engine
// =============================================================================

use serde::{Deserialize, Serialize};

/// Trade direction a strategy proposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Long,
    Short,
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Long => write!(f, "LONG"),
            Self::Short => write!(f, "SHORT"),
        }
    }
}

/// Whether `SourceManager` currently trusts its local-vs-server clock skew
/// estimate (spec.md §4.4 "Clock sanity").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClockState {
    Ok,
    Degraded,
}

impl Default for ClockState {
    fn default() -> Self {
        Self::Ok
    }
}

impl std::fmt::Display for ClockState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ok => write!(f, "ok"),
            Self::Degraded => write!(f, "degraded"),
        }
    }
}

/// The structured decision artifact emitted per symbol, at most one per tick
/// (spec.md §3, invariant f).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProposalCard {
    pub symbol: String,
    pub strategy: String,
    pub side: Side,
    pub entry: f64,
    pub stop: f64,
    pub leverage_suggest: u32,
    pub position_usdt: f64,
    pub max_risk_usdt: f64,
    pub ttl_minutes: u32,
    pub rationale: String,
    pub priority: i32,
    pub confidence: u8,
    pub created_at_ms: i64,
}

impl ProposalCard {
    /// `side=LONG => stop < entry`; `side=SHORT => stop > entry` (spec.md §3,
    /// invariant d; §8 testable property).
    pub fn is_risk_coherent(&self) -> bool {
        match self.side {
            Side::Long => self.stop < self.entry,
            Side::Short => self.stop > self.entry,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn card(side: Side, entry: f64, stop: f64) -> ProposalCard {
        ProposalCard {
            symbol: "BTCUSDT".into(),
            strategy: "test".into(),
            side,
            entry,
            stop,
            leverage_suggest: 5,
            position_usdt: 100.0,
            max_risk_usdt: 10.0,
            ttl_minutes: 10,
            rationale: String::new(),
            priority: 0,
            confidence: 50,
            created_at_ms: 0,
        }
    }

    #[test]
    fn long_is_coherent_when_stop_below_entry() {
        assert!(card(Side::Long, 100.0, 98.0).is_risk_coherent());
        assert!(!card(Side::Long, 100.0, 102.0).is_risk_coherent());
    }

    #[test]
    fn short_is_coherent_when_stop_above_entry() {
        assert!(card(Side::Short, 100.0, 102.0).is_risk_coherent());
        assert!(!card(Side::Short, 100.0, 98.0).is_risk_coherent());
    }
}
