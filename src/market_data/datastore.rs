// =============================================================================
// DataStore — per-symbol thread-safe market data, with freshness ages
// =============================================================================
//
// One `Inner` per symbol, guarded by its own lock so that a slow reader on
// one symbol never blocks writers on another. Every write is applied in
// event-time order; a write whose timestamp is older than what is already
// stored is dropped (spec.md §3 invariant a, §5 "Ordering guarantees").
//
// `snapshot()` hands back an owned, detached copy: callers can hold it for
// as long as they like without observing later mutation (spec.md §4.3).
// =============================================================================

use std::collections::{HashMap, VecDeque};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use super::candle::Candle1m;

/// Minimum closed 1m candles retained per symbol (spec.md §3: "at least 500").
pub const CANDLE_CAPACITY: usize = 500;
/// Minimum open-interest samples retained per symbol (spec.md §3: "capacity
/// >= 24 windows for a 15m derivative").
pub const OI_HISTORY_CAPACITY: usize = 24;

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PriceTick {
    pub price: f64,
    pub event_time_ms: i64,
    pub received_time_ms: i64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct FundingSnapshot {
    pub mark_price: f64,
    pub last_funding_rate: f64,
    pub next_funding_time_ms: i64,
    pub event_time_ms: i64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct OpenInterestSnapshot {
    pub oi_value: f64,
    pub event_time_ms: i64,
}

/// A deep, detached copy of one symbol's market state.
#[derive(Debug, Clone, Default)]
pub struct SymbolState {
    pub price: Option<PriceTick>,
    pub candles: Vec<Candle1m>,
    pub in_progress_candle: Option<Candle1m>,
    pub funding: Option<FundingSnapshot>,
    pub open_interest: Option<OpenInterestSnapshot>,
    pub oi_history: Vec<OpenInterestSnapshot>,
    pub last_kline_close_ts_ms: i64,
}

/// Freshness ages (milliseconds) for one symbol, relative to `now_ms`.
/// `None` means no data has ever been recorded for that field.
#[derive(Debug, Clone, Copy, Default)]
pub struct Ages {
    pub price_age_ms: Option<i64>,
    pub kline_age_ms: Option<i64>,
    pub funding_age_ms: Option<i64>,
    pub oi_age_ms: Option<i64>,
}

/// Internal per-symbol mutable state.
struct Inner {
    price: Option<PriceTick>,
    candles: VecDeque<Candle1m>,
    in_progress_candle: Option<Candle1m>,
    funding: Option<FundingSnapshot>,
    oi: Option<OpenInterestSnapshot>,
    oi_history: VecDeque<OpenInterestSnapshot>,
    last_kline_close_ts_ms: i64,
}

impl Default for Inner {
    fn default() -> Self {
        Self {
            price: None,
            candles: VecDeque::with_capacity(CANDLE_CAPACITY),
            in_progress_candle: None,
            funding: None,
            oi: None,
            oi_history: VecDeque::with_capacity(OI_HISTORY_CAPACITY),
            last_kline_close_ts_ms: 0,
        }
    }
}

/// Thread-safe, per-symbol market data store. Each symbol's lock is
/// independent so contention on one symbol never stalls another.
pub struct DataStore {
    symbols: RwLock<HashMap<String, RwLock<Inner>>>,
    candle_capacity: usize,
    oi_history_capacity: usize,
}

impl DataStore {
    pub fn new() -> Self {
        Self::with_capacity(CANDLE_CAPACITY, OI_HISTORY_CAPACITY)
    }

    pub fn with_capacity(candle_capacity: usize, oi_history_capacity: usize) -> Self {
        Self {
            symbols: RwLock::new(HashMap::new()),
            candle_capacity,
            oi_history_capacity,
        }
    }

    fn with_symbol<R>(&self, symbol: &str, f: impl FnOnce(&mut Inner) -> R) -> R {
        {
            let symbols = self.symbols.read();
            if let Some(lock) = symbols.get(symbol) {
                return f(&mut lock.write());
            }
        }
        let mut symbols = self.symbols.write();
        let lock = symbols.entry(symbol.to_string()).or_default();
        f(&mut lock.write())
    }

    // ── Writers ──────────────────────────────────────────────────────────

    /// Update the latest price. Dropped if older than the currently stored
    /// tick (spec.md §4.3, monotonic).
    pub fn update_price(&self, symbol: &str, tick: PriceTick) {
        self.with_symbol(symbol, |s| {
            if let Some(existing) = s.price {
                if tick.event_time_ms < existing.event_time_ms {
                    return;
                }
            }
            s.price = Some(tick);
        });
    }

    /// Append (or replace the in-progress slot for) one candle.
    ///
    /// Closed candles are inserted in `open_time` order with dedupe; the
    /// buffer is trimmed to capacity and `last_kline_close_ts_ms` advances.
    /// Non-closed candles replace the in-progress slot without touching
    /// `last_kline_close_ts_ms` (spec.md §4.3, §9 open question #2: a
    /// re-emitted non-closed candle never advances the close timestamp).
    pub fn append_candle(&self, symbol: &str, candle: Candle1m) {
        self.with_symbol(symbol, |s| {
            if candle.is_closed {
                Self::insert_closed(s, candle, self.candle_capacity);
                if candle.open_time == s.in_progress_candle.map(|c| c.open_time).unwrap_or(-1) {
                    s.in_progress_candle = None;
                }
            } else {
                s.in_progress_candle = Some(candle);
            }
        });
    }

    fn insert_closed(s: &mut Inner, candle: Candle1m, capacity: usize) {
        if let Some(pos) = s.candles.iter().position(|c| c.open_time == candle.open_time) {
            s.candles[pos] = candle;
        } else {
            let pos = s
                .candles
                .iter()
                .position(|c| c.open_time > candle.open_time)
                .unwrap_or(s.candles.len());
            s.candles.insert(pos, candle);
        }
        if candle.close_time > s.last_kline_close_ts_ms {
            s.last_kline_close_ts_ms = candle.close_time;
        }
        while s.candles.len() > capacity {
            s.candles.pop_front();
        }
    }

    /// Bulk merge used by state-sync; idempotent (applying the same sequence
    /// twice yields the same buffer content, spec.md §8).
    pub fn merge_klines(&self, symbol: &str, candles: &[Candle1m]) {
        self.with_symbol(symbol, |s| {
            for candle in candles {
                if candle.is_closed {
                    Self::insert_closed(s, *candle, self.candle_capacity);
                }
            }
        });
    }

    /// Set the latest funding snapshot. Dropped if older than stored.
    pub fn set_funding(&self, symbol: &str, funding: FundingSnapshot) {
        self.with_symbol(symbol, |s| {
            if let Some(existing) = s.funding {
                if funding.event_time_ms < existing.event_time_ms {
                    return;
                }
            }
            s.funding = Some(funding);
        });
    }

    /// Set the latest open-interest snapshot and push it to the history ring.
    pub fn set_open_interest(&self, symbol: &str, oi: OpenInterestSnapshot) {
        self.with_symbol(symbol, |s| {
            if let Some(existing) = s.oi {
                if oi.event_time_ms < existing.event_time_ms {
                    return;
                }
            }
            s.oi = Some(oi);
            s.oi_history.push_back(oi);
            while s.oi_history.len() > self.oi_history_capacity {
                s.oi_history.pop_front();
            }
        });
    }

    // ── Readers ──────────────────────────────────────────────────────────

    /// A deep, detached snapshot of one symbol's state.
    pub fn snapshot(&self, symbol: &str) -> SymbolState {
        self.with_symbol(symbol, |s| SymbolState {
            price: s.price,
            candles: s.candles.iter().copied().collect(),
            in_progress_candle: s.in_progress_candle,
            funding: s.funding,
            open_interest: s.oi,
            oi_history: s.oi_history.iter().copied().collect(),
            last_kline_close_ts_ms: s.last_kline_close_ts_ms,
        })
    }

    /// Freshness ages relative to `now_ms`. Ages in the future are clamped
    /// to 0 by the caller (SourceManager), which also emits the
    /// `timestamp_in_future` warning — DataStore itself reports raw deltas.
    pub fn ages(&self, symbol: &str, now_ms: i64) -> Ages {
        self.with_symbol(symbol, |s| Ages {
            price_age_ms: s.price.map(|p| now_ms - p.event_time_ms),
            kline_age_ms: if s.last_kline_close_ts_ms > 0 {
                Some(now_ms - s.last_kline_close_ts_ms)
            } else {
                None
            },
            funding_age_ms: s.funding.map(|f| now_ms - f.event_time_ms),
            oi_age_ms: s.oi.map(|o| now_ms - o.event_time_ms),
        })
    }
}

impl Default for DataStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candle(open_time: i64, close: f64, is_closed: bool) -> Candle1m {
        Candle1m {
            open_time,
            open: close,
            high: close + 1.0,
            low: close - 1.0,
            close,
            volume: 10.0,
            close_time: open_time + 59_999,
            is_closed,
        }
    }

    #[test]
    fn price_updates_are_monotonic() {
        let store = DataStore::new();
        store.update_price(
            "BTCUSDT",
            PriceTick { price: 100.0, event_time_ms: 1000, received_time_ms: 1000 },
        );
        store.update_price(
            "BTCUSDT",
            PriceTick { price: 90.0, event_time_ms: 500, received_time_ms: 500 },
        );
        let snap = store.snapshot("BTCUSDT");
        assert_eq!(snap.price.unwrap().price, 100.0);

        store.update_price(
            "BTCUSDT",
            PriceTick { price: 110.0, event_time_ms: 2000, received_time_ms: 2000 },
        );
        assert_eq!(store.snapshot("BTCUSDT").price.unwrap().price, 110.0);
    }

    #[test]
    fn closed_candles_stay_ordered_and_deduped() {
        let store = DataStore::new();
        store.append_candle("BTCUSDT", candle(0, 100.0, true));
        store.append_candle("BTCUSDT", candle(60_000, 101.0, true));
        store.append_candle("BTCUSDT", candle(0, 999.0, true)); // duplicate open_time, should replace

        let snap = store.snapshot("BTCUSDT");
        assert_eq!(snap.candles.len(), 2);
        assert_eq!(snap.candles[0].open_time, 0);
        assert_eq!(snap.candles[0].close, 999.0);
        assert_eq!(snap.candles[1].open_time, 60_000);
    }

    #[test]
    fn in_progress_candle_does_not_advance_close_ts() {
        let store = DataStore::new();
        store.append_candle("BTCUSDT", candle(0, 100.0, true));
        let ts_after_closed = store.snapshot("BTCUSDT").last_kline_close_ts_ms;

        store.append_candle("BTCUSDT", candle(60_000, 101.0, false));
        let snap = store.snapshot("BTCUSDT");
        assert_eq!(snap.last_kline_close_ts_ms, ts_after_closed);
        assert_eq!(snap.in_progress_candle.unwrap().close, 101.0);
        assert_eq!(snap.candles.len(), 1);
    }

    #[test]
    fn ring_buffer_trims_to_capacity() {
        let store = DataStore::with_capacity(3, OI_HISTORY_CAPACITY);
        for i in 0..5 {
            store.append_candle("ETHUSDT", candle(i * 60_000, 100.0 + i as f64, true));
        }
        let snap = store.snapshot("ETHUSDT");
        assert_eq!(snap.candles.len(), 3);
        assert_eq!(snap.candles[0].open_time, 2 * 60_000);
    }

    #[test]
    fn merge_klines_is_idempotent() {
        let store = DataStore::new();
        let batch: Vec<Candle1m> = (0..10).map(|i| candle(i * 60_000, 100.0 + i as f64, true)).collect();

        store.merge_klines("BTCUSDT", &batch);
        let once = store.snapshot("BTCUSDT").candles;

        store.merge_klines("BTCUSDT", &batch);
        let twice = store.snapshot("BTCUSDT").candles;

        assert_eq!(once, twice);
    }

    #[test]
    fn oi_history_capped_and_ordered() {
        let store = DataStore::with_capacity(CANDLE_CAPACITY, 3);
        for i in 0..5 {
            store.set_open_interest(
                "BTCUSDT",
                OpenInterestSnapshot { oi_value: 1000.0 + i as f64, event_time_ms: i * 900_000 },
            );
        }
        let snap = store.snapshot("BTCUSDT");
        assert_eq!(snap.oi_history.len(), 3);
        assert_eq!(snap.open_interest.unwrap().oi_value, 1004.0);
    }

    #[test]
    fn ages_absent_before_any_data() {
        let store = DataStore::new();
        let ages = store.ages("BTCUSDT", 1_000_000);
        assert!(ages.price_age_ms.is_none());
        assert!(ages.kline_age_ms.is_none());
        assert!(ages.funding_age_ms.is_none());
        assert!(ages.oi_age_ms.is_none());
    }

    #[test]
    fn ages_computed_relative_to_now() {
        let store = DataStore::new();
        store.update_price(
            "BTCUSDT",
            PriceTick { price: 100.0, event_time_ms: 1000, received_time_ms: 1000 },
        );
        let ages = store.ages("BTCUSDT", 6000);
        assert_eq!(ages.price_age_ms, Some(5000));
    }
}
