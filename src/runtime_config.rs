// =============================================================================
// Runtime Configuration — environment-driven engine settings
// =============================================================================
//
// Every tunable lives here so strategies, the arbitrator, the risk engine
// and the source manager all read from one place. Loading from the
// environment is deliberately shallow: each var has a hardcoded default,
// `from_env()` never fails, and a bad value just falls back with a warning
// instead of aborting startup.
// =============================================================================

use std::str::FromStr;

use tracing::warn;

/// Which transport `SourceManager` starts in before any failover/recovery
/// has been observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataSourcePreference {
    Ws,
    Rest,
}

impl Default for DataSourcePreference {
    fn default() -> Self {
        Self::Ws
    }
}

impl FromStr for DataSourcePreference {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ws" | "websocket" => Ok(Self::Ws),
            "rest" => Ok(Self::Rest),
            other => Err(format!("unknown data source preference: {other}")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    // --- Universe & cadence --------------------------------------------------
    pub symbols: Vec<String>,
    pub poll_seconds: u64,
    pub data_source_preferred: DataSourcePreference,
    pub kline_limit: u32,

    // --- Strategy thresholds --------------------------------------------------
    pub return_threshold: f64,
    pub atr_spike_multiplier: f64,
    pub funding_extreme: f64,
    pub oi_zscore_threshold: f64,
    pub oi_delta_pct: f64,
    pub sweep_pct: f64,
    pub wick_body_ratio: f64,
    pub stop_buffer_atr: f64,
    pub min_atr_pct: f64,

    // --- Card shaping --------------------------------------------------
    pub max_risk_usdt: f64,
    pub leverage_suggest: u32,
    pub ttl_minutes: u32,
    pub priority_fake_breakout_reversal: i32,
    pub priority_funding_oi_skew: i32,
    pub priority_liquidation_follow: i32,
    pub priority_vol_breakout_card: i32,

    // --- Arbitration --------------------------------------------------
    pub dedupe_window_seconds: i64,
    pub entry_similar_pct: f64,
    pub stop_similar_pct: f64,

    // --- Risk --------------------------------------------------
    pub max_daily_loss_usdt: f64,
    pub max_cards_per_day: u32,
    pub cooldown_after_trigger_minutes: i64,
    pub kill_switch: bool,
    pub risk_state_path: String,
    pub pnl_csv_path: String,

    // --- Freshness / failover --------------------------------------------------
    pub stale_seconds: i64,
    pub kline_stale_ms: i64,
    pub ws_backoff_min_ms: u64,
    pub ws_backoff_max_ms: u64,
    pub ws_recover_good_ticks: u32,
    pub state_sync_klines: u32,
    pub rest_price_poll_seconds: u64,
    pub rest_kline_poll_seconds: u64,
    pub rest_premiumindex_poll_seconds: u64,
    pub rest_funding_poll_seconds: u64,
    pub rest_oi_poll_seconds: u64,

    // --- Clock sanity --------------------------------------------------
    pub server_time_refresh_sec: u64,
    pub max_clock_error_ms: i64,
    pub clock_degraded_ttl_ms: i64,
    pub server_time_degraded_retry_sec: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            symbols: vec!["BTCUSDT".to_string(), "ETHUSDT".to_string()],
            poll_seconds: 1,
            data_source_preferred: DataSourcePreference::Ws,
            kline_limit: 500,

            return_threshold: 0.01,
            atr_spike_multiplier: 2.0,
            funding_extreme: 0.001,
            oi_zscore_threshold: 2.0,
            oi_delta_pct: 0.05,
            sweep_pct: 0.001,
            wick_body_ratio: 1.5,
            stop_buffer_atr: 0.3,
            min_atr_pct: 0.0005,

            max_risk_usdt: 10.0,
            leverage_suggest: 5,
            ttl_minutes: 10,
            priority_fake_breakout_reversal: 100,
            priority_funding_oi_skew: 80,
            priority_liquidation_follow: 60,
            priority_vol_breakout_card: 40,

            dedupe_window_seconds: 60,
            entry_similar_pct: 0.002,
            stop_similar_pct: 0.005,

            max_daily_loss_usdt: 200.0,
            max_cards_per_day: 20,
            cooldown_after_trigger_minutes: 30,
            kill_switch: false,
            risk_state_path: "risk_state.json".to_string(),
            pnl_csv_path: "pnl_ledger.csv".to_string(),

            stale_seconds: 5,
            kline_stale_ms: 90_000,
            ws_backoff_min_ms: 1_000,
            ws_backoff_max_ms: 30_000,
            ws_recover_good_ticks: 3,
            state_sync_klines: 500,
            rest_price_poll_seconds: 5,
            rest_kline_poll_seconds: 60,
            rest_premiumindex_poll_seconds: 30,
            rest_funding_poll_seconds: 60,
            rest_oi_poll_seconds: 60,

            server_time_refresh_sec: 300,
            max_clock_error_ms: 2_000,
            clock_degraded_ttl_ms: 60_000,
            server_time_degraded_retry_sec: 30,
        }
    }
}

impl RuntimeConfig {
    /// Reads every tunable from the environment, falling back to the
    /// default for anything missing or unparseable.
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            symbols: env_symbols("SYMBOLS", d.symbols),
            poll_seconds: env_parse("POLL_SECONDS", d.poll_seconds),
            data_source_preferred: env_parse("DATA_SOURCE_PREFERRED", d.data_source_preferred),
            kline_limit: env_parse("KLINE_LIMIT", d.kline_limit),

            return_threshold: env_parse("RETURN_THRESHOLD", d.return_threshold),
            atr_spike_multiplier: env_parse("ATR_SPIKE_MULTIPLIER", d.atr_spike_multiplier),
            funding_extreme: env_parse("FUNDING_EXTREME", d.funding_extreme),
            oi_zscore_threshold: env_parse("OI_ZSCORE", d.oi_zscore_threshold),
            oi_delta_pct: env_parse("OI_DELTA_PCT", d.oi_delta_pct),
            sweep_pct: env_parse("SWEEP_PCT", d.sweep_pct),
            wick_body_ratio: env_parse("WICK_BODY_RATIO", d.wick_body_ratio),
            stop_buffer_atr: env_parse("STOP_BUFFER_ATR", d.stop_buffer_atr),
            min_atr_pct: env_parse("MIN_ATR_PCT", d.min_atr_pct),

            max_risk_usdt: env_parse("MAX_RISK_USDT", d.max_risk_usdt),
            leverage_suggest: env_parse("LEVERAGE_SUGGEST", d.leverage_suggest),
            ttl_minutes: env_parse("TTL_MINUTES", d.ttl_minutes),
            priority_fake_breakout_reversal: env_parse(
                "PRIORITY_FAKE_BREAKOUT_REVERSAL",
                d.priority_fake_breakout_reversal,
            ),
            priority_funding_oi_skew: env_parse("PRIORITY_FUNDING_OI_SKEW", d.priority_funding_oi_skew),
            priority_liquidation_follow: env_parse(
                "PRIORITY_LIQUIDATION_FOLLOW",
                d.priority_liquidation_follow,
            ),
            priority_vol_breakout_card: env_parse("PRIORITY_VOL_BREAKOUT_CARD", d.priority_vol_breakout_card),

            dedupe_window_seconds: env_parse("DEDUPE_WINDOW_SECONDS", d.dedupe_window_seconds),
            entry_similar_pct: env_parse("ENTRY_SIMILAR_PCT", d.entry_similar_pct),
            stop_similar_pct: env_parse("STOP_SIMILAR_PCT", d.stop_similar_pct),

            max_daily_loss_usdt: env_parse("MAX_DAILY_LOSS_USDT", d.max_daily_loss_usdt),
            max_cards_per_day: env_parse("MAX_CARDS_PER_DAY", d.max_cards_per_day),
            cooldown_after_trigger_minutes: env_parse(
                "COOLDOWN_AFTER_TRIGGER_MINUTES",
                d.cooldown_after_trigger_minutes,
            ),
            kill_switch: env_bool("KILL_SWITCH", d.kill_switch),
            risk_state_path: env_string("RISK_STATE_PATH", &d.risk_state_path),
            pnl_csv_path: env_string("PNL_CSV_PATH", &d.pnl_csv_path),

            stale_seconds: env_parse("STALE_SECONDS", d.stale_seconds),
            kline_stale_ms: env_parse("KLINE_STALE_MS", d.kline_stale_ms),
            ws_backoff_min_ms: env_parse("WS_BACKOFF_MIN", d.ws_backoff_min_ms),
            ws_backoff_max_ms: env_parse("WS_BACKOFF_MAX", d.ws_backoff_max_ms),
            ws_recover_good_ticks: env_parse("WS_RECOVER_GOOD_TICKS", d.ws_recover_good_ticks),
            state_sync_klines: env_parse("STATE_SYNC_KLINES", d.state_sync_klines),
            rest_price_poll_seconds: env_parse("REST_PRICE_POLL_SECONDS", d.rest_price_poll_seconds),
            rest_kline_poll_seconds: env_parse("REST_KLINE_POLL_SECONDS", d.rest_kline_poll_seconds),
            rest_premiumindex_poll_seconds: env_parse(
                "REST_PREMIUMINDEX_POLL_SECONDS",
                d.rest_premiumindex_poll_seconds,
            ),
            rest_funding_poll_seconds: env_parse("REST_FUNDING_POLL_SECONDS", d.rest_funding_poll_seconds),
            rest_oi_poll_seconds: env_parse("REST_OI_POLL_SECONDS", d.rest_oi_poll_seconds),

            server_time_refresh_sec: env_parse("SERVER_TIME_REFRESH_SEC", d.server_time_refresh_sec),
            max_clock_error_ms: env_parse("MAX_CLOCK_ERROR_MS", d.max_clock_error_ms),
            clock_degraded_ttl_ms: env_parse("CLOCK_DEGRADED_TTL_MS", d.clock_degraded_ttl_ms),
            server_time_degraded_retry_sec: env_parse(
                "SERVER_TIME_DEGRADED_RETRY_SEC",
                d.server_time_degraded_retry_sec,
            ),
        }
    }
}

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => raw.parse().unwrap_or_else(|_| {
            warn!(key, raw, "failed to parse env var, using default");
            default
        }),
        Err(_) => default,
    }
}

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(raw) => matches!(raw.as_str(), "1" | "true" | "TRUE" | "yes"),
        Err(_) => default,
    }
}

fn env_symbols(key: &str, default: Vec<String>) -> Vec<String> {
    match std::env::var(key) {
        Ok(raw) => raw
            .split(',')
            .map(|s| s.trim().to_uppercase())
            .filter(|s| !s.is_empty())
            .collect(),
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_baseline() {
        let cfg = RuntimeConfig::default();
        assert_eq!(cfg.symbols, vec!["BTCUSDT", "ETHUSDT"]);
        assert_eq!(cfg.max_cards_per_day, 20);
        assert!(!cfg.kill_switch);
        assert_eq!(cfg.priority_fake_breakout_reversal, 100);
        assert_eq!(cfg.priority_vol_breakout_card, 40);
    }

    #[test]
    fn data_source_preference_parses_case_insensitively() {
        assert_eq!("ws".parse::<DataSourcePreference>().unwrap(), DataSourcePreference::Ws);
        assert_eq!("REST".parse::<DataSourcePreference>().unwrap(), DataSourcePreference::Rest);
        assert!("tcp".parse::<DataSourcePreference>().is_err());
    }
}
