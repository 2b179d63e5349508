// =============================================================================
// RiskEngine — gates dispatch by kill-switch, daily limits, and cooldown
// =============================================================================
//
// Gate checks run in a fixed order; the first failure blocks and reports
// its reason (spec.md §4.8). State is small enough to keep entirely in
// memory behind one lock, and is persisted to `risk_state_path` with the
// same write-tmp-then-rename pattern used elsewhere in this codebase for
// crash-safe config writes.
// =============================================================================

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::Write as _;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::runtime_config::RuntimeConfig;
use crate::types::ProposalCard;

/// Structured, non-exceptional gate outcome (spec.md §7: `RiskBlocked` is
/// not an error).
#[derive(Debug, Clone, PartialEq)]
pub enum RiskDecision {
    Allowed,
    Blocked(&'static str),
}

impl RiskDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed)
    }
}

/// Persisted risk state, rewritten atomically on every update (spec.md §3, §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskState {
    pub day_key: String,
    #[serde(default)]
    pub cards_today: u32,
    #[serde(default)]
    pub realized_pnl_today: f64,
    #[serde(default)]
    pub last_trigger_at_ms: HashMap<String, i64>,
}

impl RiskState {
    fn fresh(day_key: String) -> Self {
        Self { day_key, cards_today: 0, realized_pnl_today: 0.0, last_trigger_at_ms: HashMap::new() }
    }
}

pub struct RiskEngine {
    state: RwLock<RiskState>,
    state_path: PathBuf,
    pnl_csv_path: PathBuf,
    max_cards_per_day: u32,
    max_daily_loss_usdt: f64,
    cooldown_after_trigger_minutes: i64,
    kill_switch: bool,
}

impl RiskEngine {
    /// Loads `RiskState` from `cfg.risk_state_path`; a missing file
    /// initializes defaults for today rather than failing (spec.md §6).
    pub fn new(cfg: &RuntimeConfig, now_ms: i64) -> Self {
        let state_path = PathBuf::from(&cfg.risk_state_path);
        let state = load_state(&state_path, now_ms);
        Self {
            state: RwLock::new(state),
            state_path,
            pnl_csv_path: PathBuf::from(&cfg.pnl_csv_path),
            max_cards_per_day: cfg.max_cards_per_day,
            max_daily_loss_usdt: cfg.max_daily_loss_usdt,
            cooldown_after_trigger_minutes: cfg.cooldown_after_trigger_minutes,
            kill_switch: cfg.kill_switch,
        }
    }

    /// Runs the ordered gate checks against a single candidate card.
    /// Does not mutate state beyond the day rollover — callers must follow
    /// an `Allowed` result with `record_trigger`.
    pub fn evaluate(&self, card: &ProposalCard, now_ms: i64) -> RiskDecision {
        if self.kill_switch {
            return RiskDecision::Blocked("kill_switch");
        }

        self.maybe_roll_day(now_ms);
        let s = self.state.read();

        if s.cards_today >= self.max_cards_per_day {
            return RiskDecision::Blocked("max_cards_per_day");
        }
        if s.realized_pnl_today <= -self.max_daily_loss_usdt {
            return RiskDecision::Blocked("max_daily_loss");
        }
        if let Some(last) = s.last_trigger_at_ms.get(&card.symbol) {
            if now_ms - last < self.cooldown_after_trigger_minutes * 60_000 {
                return RiskDecision::Blocked("cooldown");
            }
        }
        RiskDecision::Allowed
    }

    /// Records a dispatched trigger: increments the daily count, updates
    /// the per-symbol cooldown clock, and persists atomically.
    pub fn record_trigger(&self, symbol: &str, now_ms: i64) {
        self.maybe_roll_day(now_ms);
        let mut s = self.state.write();
        s.cards_today += 1;
        s.last_trigger_at_ms.insert(symbol.to_string(), now_ms);
        if let Err(err) = persist_state(&self.state_path, &s) {
            warn!(?err, path = %self.state_path.display(), "failed to persist risk state");
        }
    }

    /// Append-only ledger of realized PnL, driven by an external collaborator
    /// (out of scope here; interface only per spec.md §4.8).
    pub fn record_pnl(&self, symbol: &str, usdt: f64, now_ms: i64) -> Result<()> {
        self.maybe_roll_day(now_ms);
        {
            let mut s = self.state.write();
            s.realized_pnl_today += usdt;
            persist_state(&self.state_path, &s).context("failed to persist risk state after pnl update")?;
        }
        append_pnl_csv(&self.pnl_csv_path, symbol, usdt, now_ms)
    }

    pub fn snapshot(&self) -> RiskState {
        self.state.read().clone()
    }

    fn maybe_roll_day(&self, now_ms: i64) {
        let today = day_key_for(now_ms);
        {
            let s = self.state.read();
            if s.day_key == today {
                return;
            }
        }
        let mut s = self.state.write();
        if s.day_key != today {
            info!(old_day = %s.day_key, new_day = %today, "risk state day rollover");
            *s = RiskState::fresh(today);
            if let Err(err) = persist_state(&self.state_path, &s) {
                warn!(?err, "failed to persist risk state after day rollover");
            }
        }
    }
}

fn day_key_for(now_ms: i64) -> String {
    DateTime::<Utc>::from_timestamp_millis(now_ms)
        .unwrap_or_else(Utc::now)
        .format("%Y-%m-%d")
        .to_string()
}

fn load_state(path: &Path, now_ms: i64) -> RiskState {
    match std::fs::read_to_string(path) {
        Ok(content) => match serde_json::from_str(&content) {
            Ok(state) => state,
            Err(err) => {
                warn!(?err, path = %path.display(), "risk state file unreadable, starting fresh");
                RiskState::fresh(day_key_for(now_ms))
            }
        },
        Err(_) => RiskState::fresh(day_key_for(now_ms)),
    }
}

fn persist_state(path: &Path, state: &RiskState) -> Result<()> {
    let content = serde_json::to_string_pretty(state).context("failed to serialize risk state")?;
    let tmp_path = path.with_extension("json.tmp");
    std::fs::write(&tmp_path, &content)
        .with_context(|| format!("failed to write tmp risk state to {}", tmp_path.display()))?;
    std::fs::rename(&tmp_path, path)
        .with_context(|| format!("failed to rename tmp risk state to {}", path.display()))?;
    Ok(())
}

fn append_pnl_csv(path: &Path, symbol: &str, usdt: f64, now_ms: i64) -> Result<()> {
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("failed to open pnl ledger at {}", path.display()))?;
    writeln!(file, "{now_ms},{symbol},{usdt}").context("failed to append pnl ledger row")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn card(symbol: &str) -> ProposalCard {
        use crate::types::Side;
        ProposalCard {
            symbol: symbol.to_string(),
            strategy: "test".to_string(),
            side: Side::Long,
            entry: 100.0,
            stop: 98.0,
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

    fn temp_paths(tag: &str) -> (PathBuf, PathBuf) {
        let dir = std::env::temp_dir();
        (
            dir.join(format!("risk_state_test_{tag}.json")),
            dir.join(format!("pnl_ledger_test_{tag}.csv")),
        )
    }

    fn engine_with(tag: &str, mutate: impl FnOnce(&mut RuntimeConfig)) -> RiskEngine {
        let (state_path, pnl_path) = temp_paths(tag);
        let _ = std::fs::remove_file(&state_path);
        let _ = std::fs::remove_file(&pnl_path);
        let mut cfg = RuntimeConfig::default();
        cfg.risk_state_path = state_path.to_string_lossy().to_string();
        cfg.pnl_csv_path = pnl_path.to_string_lossy().to_string();
        mutate(&mut cfg);
        RiskEngine::new(&cfg, 0)
    }

    #[test]
    fn kill_switch_blocks_and_does_not_increment() {
        let engine = engine_with("kill_switch", |cfg| cfg.kill_switch = true);
        let decision = engine.evaluate(&card("BTCUSDT"), 0);
        assert_eq!(decision, RiskDecision::Blocked("kill_switch"));
        assert_eq!(engine.snapshot().cards_today, 0);
    }

    #[test]
    fn cooldown_blocks_within_window() {
        let engine = engine_with("cooldown", |cfg| cfg.cooldown_after_trigger_minutes = 30);
        engine.record_trigger("BTCUSDT", 0);
        let decision = engine.evaluate(&card("BTCUSDT"), 29 * 60_000);
        assert_eq!(decision, RiskDecision::Blocked("cooldown"));
    }

    #[test]
    fn cooldown_clears_after_window() {
        let engine = engine_with("cooldown_clear", |cfg| cfg.cooldown_after_trigger_minutes = 30);
        engine.record_trigger("BTCUSDT", 0);
        let decision = engine.evaluate(&card("BTCUSDT"), 31 * 60_000);
        assert!(decision.is_allowed());
    }

    #[test]
    fn max_cards_per_day_blocks_once_reached() {
        let engine = engine_with("max_cards", |cfg| cfg.max_cards_per_day = 1);
        engine.record_trigger("BTCUSDT", 0);
        let decision = engine.evaluate(&card("ETHUSDT"), 1000);
        assert_eq!(decision, RiskDecision::Blocked("max_cards_per_day"));
    }

    #[test]
    fn max_daily_loss_blocks() {
        let engine = engine_with("max_loss", |cfg| cfg.max_daily_loss_usdt = 50.0);
        engine.record_pnl("BTCUSDT", -60.0, 0).unwrap();
        let decision = engine.evaluate(&card("ETHUSDT"), 1000);
        assert_eq!(decision, RiskDecision::Blocked("max_daily_loss"));
    }

    #[test]
    fn day_rollover_resets_counters() {
        let engine = engine_with("rollover", |_| {});
        engine.record_trigger("BTCUSDT", 0);
        assert_eq!(engine.snapshot().cards_today, 1);

        let next_day_ms = 2 * 86_400_000; // two days after epoch, guaranteed new day_key
        let decision = engine.evaluate(&card("BTCUSDT"), next_day_ms);
        assert!(decision.is_allowed());
        assert_eq!(engine.snapshot().cards_today, 0);
    }
}
