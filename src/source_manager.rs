// =============================================================================
// SourceManager — dual-mode WS/REST controller with failover and recovery
// =============================================================================
//
// Drives a single shared `ExchangeClientWS` session while it is healthy and
// falls back to `ExchangeClientREST` polling when it isn't (spec.md §4.4).
// All scalar state (current mode, backoff clock, poll cadences, clock-sanity
// bookkeeping) lives behind one `parking_lot::RwLock<Inner>`, matching the
// rest of this codebase's convention of one lock per logical unit of state;
// the socket itself lives behind a `tokio::sync::Mutex` because reading from
// it holds the guard across an `.await` point.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, instrument, warn};

use crate::exchange::{ExchangeClientREST, ExchangeClientWS, ExchangeEvent, StreamError};
use crate::market_data::{Ages, DataStore};
use crate::runtime_config::{DataSourcePreference, RuntimeConfig};
use crate::types::ClockState;

/// Which transport is currently authoritative for price/kline data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Ws,
    Rest,
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ws => write!(f, "ws"),
            Self::Rest => write!(f, "rest"),
        }
    }
}

/// Per-symbol, per-endpoint REST poll cadence tracker key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum PollKind {
    Price,
    Kline,
    PremiumIndex,
    Funding,
    Oi,
}

/// Emitted every 60s (spec.md §4.4 "Health summary").
#[derive(Debug, Clone)]
pub struct SymbolHealth {
    pub symbol: String,
    pub mode: Mode,
    pub price_age_ms: Option<i64>,
    pub kline_age_ms: Option<i64>,
    pub funding_age_ms: Option<i64>,
    pub oi_age_ms: Option<i64>,
    pub buffer_size: usize,
    pub clock_state: ClockState,
    pub last_server_sync_age_ms: Option<i64>,
}

struct Inner {
    mode: Mode,
    ws_backoff_ms: u64,
    next_ws_attempt_ms: i64,
    consecutive_good_ticks: u32,
    last_poll_ms: HashMap<(String, PollKind), i64>,
    clock_state: ClockState,
    clock_offset_ms: i64,
    clock_degraded_until_ms: i64,
    next_clock_check_ms: i64,
    last_server_sync_ms: Option<i64>,
    last_health_log_ms: i64,
}

impl Inner {
    fn new(cfg: &RuntimeConfig, preferred: DataSourcePreference) -> Self {
        Self {
            mode: match preferred {
                DataSourcePreference::Ws => Mode::Ws,
                DataSourcePreference::Rest => Mode::Rest,
            },
            ws_backoff_ms: cfg.ws_backoff_min_ms,
            next_ws_attempt_ms: 0,
            consecutive_good_ticks: 0,
            last_poll_ms: HashMap::new(),
            clock_state: ClockState::Ok,
            clock_offset_ms: 0,
            clock_degraded_until_ms: 0,
            next_clock_check_ms: 0,
            last_server_sync_ms: None,
            last_health_log_ms: 0,
        }
    }
}

pub struct SourceManager {
    symbols: Vec<String>,
    datastore: Arc<DataStore>,
    rest: ExchangeClientREST,
    cfg: RuntimeConfig,
    ws: tokio::sync::Mutex<Option<ExchangeClientWS>>,
    inner: parking_lot::RwLock<Inner>,
}

impl SourceManager {
    pub fn new(symbols: Vec<String>, datastore: Arc<DataStore>, rest: ExchangeClientREST, cfg: RuntimeConfig) -> Self {
        let preferred = cfg.data_source_preferred;
        Self {
            symbols,
            datastore,
            rest,
            ws: tokio::sync::Mutex::new(None),
            inner: parking_lot::RwLock::new(Inner::new(&cfg, preferred)),
            cfg,
        }
    }

    pub fn mode(&self) -> Mode {
        self.inner.read().mode
    }

    pub fn clock_state(&self) -> ClockState {
        self.inner.read().clock_state
    }

    /// Closes the WS session, if any (spec.md §5 "Cancellation": "the WS
    /// session is closed" on graceful stop).
    pub async fn close(&self) {
        if let Some(mut client) = self.ws.lock().await.take() {
            client.close().await;
        }
    }

    /// The local-wall-clock estimate of "now", shifted by the server offset
    /// while degraded (spec.md §4.4: "age computations use server-time
    /// offset estimate" while `clock_state=degraded`).
    fn effective_now(&self, now_ms: i64) -> i64 {
        let inner = self.inner.read();
        if inner.clock_state == ClockState::Degraded {
            now_ms + inner.clock_offset_ms
        } else {
            now_ms
        }
    }

    /// One tick's worth of work: services the WS session or REST polls
    /// depending on mode, polls derivative data on its own cadence in both
    /// modes, checks clock sanity, and logs the 60s health summary.
    /// Returns freshness ages for every configured symbol as of `now_ms`.
    pub async fn refresh(&self, now_ms: i64) -> HashMap<String, Ages> {
        self.clock_sanity(now_ms).await;

        match self.mode() {
            Mode::Ws => self.service_ws_mode(now_ms).await,
            Mode::Rest => {
                self.poll_price_and_klines(now_ms).await;
                self.service_ws_recovery_probe(now_ms).await;
            }
        }

        self.poll_derivatives(now_ms).await;
        self.maybe_log_health(now_ms);

        let eff_now = self.effective_now(now_ms);
        self.symbols
            .iter()
            .map(|s| (s.clone(), clamp_ages(self.datastore.ages(s, eff_now), s)))
            .collect()
    }

    // ── WS mode: authoritative, drains events, watches for failover ────────

    async fn service_ws_mode(&self, now_ms: i64) {
        if !self.ensure_ws_connected(now_ms).await {
            self.failover("stream_error", "*", now_ms);
            return;
        }

        match self.drain_one_event(now_ms).await {
            Ok(Some(())) | Ok(None) => {}
            Err(_) => {
                self.failover("stream_error", "*", now_ms);
                return;
            }
        }

        let eff_now = self.effective_now(now_ms);
        for symbol in self.symbols.clone() {
            let ages = self.datastore.ages(&symbol, eff_now);
            if let Some(reason) = should_failover_for_staleness(ages, &self.cfg) {
                self.failover(reason, &symbol, now_ms);
                return;
            }
        }
    }

    // ── REST mode: polls price/klines on cadence, probes WS for recovery ──

    async fn poll_price_and_klines(&self, now_ms: i64) {
        for symbol in self.symbols.clone() {
            if self.due(&symbol, PollKind::Price, self.cfg.rest_price_poll_seconds, now_ms) {
                match self.rest.get_price(&symbol).await {
                    Ok(tick) => self.datastore.update_price(&symbol, tick),
                    Err(err) => warn!(symbol, error = %err, "rest price poll failed"),
                }
            }
            if self.due(&symbol, PollKind::Kline, self.cfg.rest_kline_poll_seconds, now_ms) {
                match self.rest.get_klines(&symbol, self.cfg.kline_limit).await {
                    Ok(candles) => self.datastore.merge_klines(&symbol, &candles),
                    Err(err) => warn!(symbol, error = %err, "rest kline poll failed"),
                }
            }
        }
    }

    async fn service_ws_recovery_probe(&self, now_ms: i64) {
        if !self.ensure_ws_connected(now_ms).await {
            return;
        }

        let event = match self.drain_one_event(now_ms).await {
            Ok(Some(())) => true,
            Ok(None) => false,
            Err(_) => {
                // Lost the probe connection; next attempt is governed by backoff.
                return;
            }
        };
        if !event {
            return;
        }

        let eff_now = self.effective_now(now_ms);
        let mut all_fresh = true;
        for symbol in &self.symbols {
            let age = self.datastore.ages(symbol, eff_now).price_age_ms;
            if !age.map(|a| a <= self.cfg.stale_seconds * 1000).unwrap_or(false) {
                all_fresh = false;
                break;
            }
        }

        let count = {
            let mut inner = self.inner.write();
            if all_fresh {
                inner.consecutive_good_ticks += 1;
            } else {
                inner.consecutive_good_ticks = 0;
            }
            inner.consecutive_good_ticks
        };

        if count >= self.cfg.ws_recover_good_ticks {
            self.attempt_recovery(now_ms).await;
        }
    }

    /// State-sync then mode flip (spec.md §4.4 "Recovery"). Failure aborts
    /// this attempt and resets the good-tick counter so it must rebuild.
    #[instrument(skip(self))]
    async fn attempt_recovery(&self, now_ms: i64) {
        for symbol in self.symbols.clone() {
            match self.rest.get_klines(&symbol, self.cfg.state_sync_klines).await {
                Ok(candles) => self.datastore.merge_klines(&symbol, &candles),
                Err(err) => {
                    warn!(symbol, error = %err, "state-sync failed, aborting ws recovery attempt");
                    self.inner.write().consecutive_good_ticks = 0;
                    return;
                }
            }
        }

        let mut inner = self.inner.write();
        inner.mode = Mode::Ws;
        inner.consecutive_good_ticks = 0;
        inner.ws_backoff_ms = self.cfg.ws_backoff_min_ms;
        drop(inner);
        info!(from = %Mode::Rest, to = %Mode::Ws, reason = "state_sync_complete", now = now_ms, "source manager recovered to ws");
    }

    // ── Derivative polling (mark/funding/OI), independent of mode ──────────

    async fn poll_derivatives(&self, now_ms: i64) {
        for symbol in self.symbols.clone() {
            if self.due(&symbol, PollKind::PremiumIndex, self.cfg.rest_premiumindex_poll_seconds, now_ms) {
                match self.rest.get_premium_index(&symbol).await {
                    Ok(funding) => self.datastore.set_funding(&symbol, funding),
                    Err(err) => warn!(symbol, error = %err, "premium index poll failed"),
                }
            }
            if self.due(&symbol, PollKind::Oi, self.cfg.rest_oi_poll_seconds, now_ms) {
                match self.rest.get_open_interest(&symbol).await {
                    Ok(oi) => self.datastore.set_open_interest(&symbol, oi),
                    Err(err) => warn!(symbol, error = %err, "open interest poll failed"),
                }
            }
            // funding_history isn't retained in DataStore (only the latest
            // premium-index funding rate is, per spec.md §3); polled on its
            // own cadence only to surface transport errors early.
            if self.due(&symbol, PollKind::Funding, self.cfg.rest_funding_poll_seconds, now_ms) {
                if let Err(err) = self.rest.get_funding_history(&symbol, 1).await {
                    warn!(symbol, error = %err, "funding history poll failed");
                }
            }
        }
    }

    fn due(&self, symbol: &str, kind: PollKind, interval_seconds: u64, now_ms: i64) -> bool {
        let key = (symbol.to_string(), kind);
        let mut inner = self.inner.write();
        let last = inner.last_poll_ms.get(&key).copied().unwrap_or(0);
        if now_ms - last >= interval_seconds as i64 * 1000 {
            inner.last_poll_ms.insert(key, now_ms);
            true
        } else {
            false
        }
    }

    // ── Clock sanity ─────────────────────────────────────────────────────

    async fn clock_sanity(&self, now_ms: i64) {
        let due = { now_ms >= self.inner.read().next_clock_check_ms };
        if !due {
            return;
        }

        match self.rest.get_server_time().await {
            Ok(server_ms) => {
                let skew = server_ms - now_ms;
                let mut inner = self.inner.write();
                inner.clock_offset_ms = skew;
                inner.last_server_sync_ms = Some(now_ms);

                if skew.abs() > self.cfg.max_clock_error_ms {
                    if inner.clock_state == ClockState::Ok {
                        warn!(skew_ms = skew, "clock skew exceeds threshold, entering degraded state");
                    }
                    inner.clock_state = ClockState::Degraded;
                    inner.clock_degraded_until_ms = now_ms + self.cfg.clock_degraded_ttl_ms;
                    inner.next_clock_check_ms = now_ms + self.cfg.server_time_degraded_retry_sec as i64 * 1000;
                } else if inner.clock_state == ClockState::Degraded && now_ms >= inner.clock_degraded_until_ms {
                    inner.clock_state = ClockState::Ok;
                    inner.next_clock_check_ms = now_ms + self.cfg.server_time_refresh_sec as i64 * 1000;
                    info!("clock sanity restored");
                } else {
                    let retry_sec = if inner.clock_state == ClockState::Degraded {
                        self.cfg.server_time_degraded_retry_sec
                    } else {
                        self.cfg.server_time_refresh_sec
                    };
                    inner.next_clock_check_ms = now_ms + retry_sec as i64 * 1000;
                }
            }
            Err(err) => warn!(error = %err, "server time fetch failed"),
        }
    }

    // ── Health summary ──────────────────────────────────────────────────

    fn maybe_log_health(&self, now_ms: i64) {
        let due = {
            let inner = self.inner.read();
            now_ms - inner.last_health_log_ms >= 60_000
        };
        if !due {
            return;
        }
        self.inner.write().last_health_log_ms = now_ms;

        let eff_now = self.effective_now(now_ms);
        let mode = self.mode();
        let clock_state = self.clock_state();
        let last_server_sync_age_ms = self.inner.read().last_server_sync_ms.map(|t| now_ms - t);

        for symbol in &self.symbols {
            let ages = clamp_ages(self.datastore.ages(symbol, eff_now), symbol);
            let buffer_size = self.datastore.snapshot(symbol).candles.len();
            let health = SymbolHealth {
                symbol: symbol.clone(),
                mode,
                price_age_ms: ages.price_age_ms,
                kline_age_ms: ages.kline_age_ms,
                funding_age_ms: ages.funding_age_ms,
                oi_age_ms: ages.oi_age_ms,
                buffer_size,
                clock_state,
                last_server_sync_age_ms,
            };
            info!(
                symbol = %health.symbol,
                mode = %health.mode,
                price_age_ms = ?health.price_age_ms,
                kline_age_ms = ?health.kline_age_ms,
                funding_age_ms = ?health.funding_age_ms,
                oi_age_ms = ?health.oi_age_ms,
                buffer_size = health.buffer_size,
                clock_state = %health.clock_state,
                last_server_sync_age_ms = ?health.last_server_sync_age_ms,
                "source manager health summary"
            );
        }
    }

    // ── WS connection lifecycle ─────────────────────────────────────────

    /// Ensures a WS session exists, respecting the exponential backoff
    /// schedule. Returns `false` if not connected (either not yet due for a
    /// retry, or the connect attempt itself failed).
    async fn ensure_ws_connected(&self, now_ms: i64) -> bool {
        {
            let guard = self.ws.lock().await;
            if guard.is_some() {
                return true;
            }
        }

        let next_attempt = self.inner.read().next_ws_attempt_ms;
        if now_ms < next_attempt {
            return false;
        }

        let mut client = ExchangeClientWS::new(self.symbols.clone());
        match client.start().await {
            Ok(()) => {
                *self.ws.lock().await = Some(client);
                self.inner.write().ws_backoff_ms = self.cfg.ws_backoff_min_ms;
                true
            }
            Err(err) => {
                warn!(error = %err, "ws connect attempt failed");
                let mut inner = self.inner.write();
                inner.next_ws_attempt_ms = now_ms + inner.ws_backoff_ms as i64;
                inner.ws_backoff_ms = (inner.ws_backoff_ms * 2).min(self.cfg.ws_backoff_max_ms);
                false
            }
        }
    }

    /// Reads and applies one event with a short read deadline so the tick
    /// loop never blocks waiting on the socket. `Ok(None)` means nothing was
    /// ready within the deadline; `Err` surfaces a `StreamError` and closes
    /// the socket so the caller can decide on failover/backoff.
    async fn drain_one_event(&self, now_ms: i64) -> Result<Option<()>, StreamError> {
        let mut guard = self.ws.lock().await;
        let client = match guard.as_mut() {
            Some(c) => c,
            None => return Ok(None),
        };

        match tokio::time::timeout(Duration::from_millis(200), client.read_event()).await {
            Ok(Ok(event)) => {
                self.apply_event(event, now_ms);
                Ok(Some(()))
            }
            Ok(Err(err)) => {
                client.close().await;
                *guard = None;
                Err(err)
            }
            Err(_elapsed) => Ok(None),
        }
    }

    fn apply_event(&self, event: ExchangeEvent, _now_ms: i64) {
        match event {
            ExchangeEvent::Price(symbol, tick) => self.datastore.update_price(&symbol, tick),
            ExchangeEvent::Candle(symbol, candle) => self.datastore.append_candle(&symbol, candle),
        }
    }

    /// Transitions `Ws -> Rest`, logging the structured reason (spec.md
    /// §4.4 "Failover"). `symbol` is `"*"` for session-wide reasons
    /// (`stream_error`) and the specific symbol for per-symbol staleness.
    fn failover(&self, reason: &'static str, symbol: &str, now_ms: i64) {
        let mut inner = self.inner.write();
        if inner.mode == Mode::Rest {
            return;
        }
        inner.mode = Mode::Rest;
        inner.consecutive_good_ticks = 0;
        inner.next_ws_attempt_ms = now_ms + inner.ws_backoff_ms as i64;
        drop(inner);
        warn!(from = %Mode::Ws, to = %Mode::Rest, reason, symbol, now = now_ms, "source manager failed over to rest");
    }
}

/// Negative ages mean a timestamp arrived from the future (clock skew or a
/// misbehaving upstream); clamp to zero and warn rather than propagate a
/// negative freshness age into `SignalContext` (spec.md §4.4 "Health
/// summary": "Ages in the future are clamped at 0 and emit a
/// `timestamp_in_future` warning").
fn clamp_ages(ages: Ages, symbol: &str) -> Ages {
    let clamp = |label: &'static str, age: Option<i64>| -> Option<i64> {
        age.map(|a| {
            if a < 0 {
                warn!(symbol, field = label, age_ms = a, "timestamp_in_future");
                0
            } else {
                a
            }
        })
    };
    Ages {
        price_age_ms: clamp("price", ages.price_age_ms),
        kline_age_ms: clamp("kline", ages.kline_age_ms),
        funding_age_ms: clamp("funding", ages.funding_age_ms),
        oi_age_ms: clamp("oi", ages.oi_age_ms),
    }
}

/// Pure staleness check factored out of `service_ws_mode` so failover
/// conditions (spec.md §4.4 "Failover", triggers 2 and 3) are unit-testable
/// without a live socket.
fn should_failover_for_staleness(ages: Ages, cfg: &RuntimeConfig) -> Option<&'static str> {
    if ages.price_age_ms.map(|a| a > cfg.stale_seconds * 1000).unwrap_or(false) {
        return Some("price_stale");
    }
    if ages.kline_age_ms.map(|a| a > cfg.kline_stale_ms).unwrap_or(false) {
        return Some("kline_stale");
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn staleness_absent_ages_do_not_trigger_failover() {
        let cfg = RuntimeConfig::default();
        assert!(should_failover_for_staleness(Ages::default(), &cfg).is_none());
    }

    #[test]
    fn price_stale_triggers_failover_past_threshold() {
        let cfg = RuntimeConfig::default();
        let ages = Ages { price_age_ms: Some(cfg.stale_seconds * 1000 + 1), ..Ages::default() };
        assert_eq!(should_failover_for_staleness(ages, &cfg), Some("price_stale"));
    }

    #[test]
    fn price_within_stale_seconds_does_not_fail_over() {
        let cfg = RuntimeConfig::default();
        let ages = Ages { price_age_ms: Some(cfg.stale_seconds * 1000), ..Ages::default() };
        assert!(should_failover_for_staleness(ages, &cfg).is_none());
    }

    #[test]
    fn kline_stale_triggers_failover_past_threshold() {
        let cfg = RuntimeConfig::default();
        let ages = Ages { kline_age_ms: Some(cfg.kline_stale_ms + 1), ..Ages::default() };
        assert_eq!(should_failover_for_staleness(ages, &cfg), Some("kline_stale"));
    }

    #[test]
    fn clamp_ages_zeroes_future_timestamps() {
        let ages = Ages { price_age_ms: Some(-500), kline_age_ms: Some(1000), funding_age_ms: None, oi_age_ms: None };
        let clamped = clamp_ages(ages, "BTCUSDT");
        assert_eq!(clamped.price_age_ms, Some(0));
        assert_eq!(clamped.kline_age_ms, Some(1000));
    }

    #[test]
    fn mode_starts_from_configured_preference() {
        let cfg = RuntimeConfig::default();
        let datastore = Arc::new(DataStore::new());
        let rest = ExchangeClientREST::new();
        let mgr = SourceManager::new(vec!["BTCUSDT".to_string()], datastore, rest, cfg);
        assert_eq!(mgr.mode(), Mode::Ws);
    }

    #[test]
    fn rest_preference_starts_in_rest_mode() {
        let mut cfg = RuntimeConfig::default();
        cfg.data_source_preferred = DataSourcePreference::Rest;
        let datastore = Arc::new(DataStore::new());
        let rest = ExchangeClientREST::new();
        let mgr = SourceManager::new(vec!["BTCUSDT".to_string()], datastore, rest, cfg);
        assert_eq!(mgr.mode(), Mode::Rest);
    }
}
