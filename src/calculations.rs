// =============================================================================
// Calculations — pure indicator functions over DataStore snapshots
// =============================================================================
//
// Every function here is side-effect free and total: absent/insufficient
// data returns `None` rather than NaN or infinity (spec.md §4.5). The ATR
// smoothing loop mirrors the Wilder recurrence used elsewhere in this
// codebase for single-timeframe ATR, generalized here to run over
// aggregated 15-minute candles instead of the exchange's native timeframe.
// =============================================================================

use std::collections::BTreeMap;

use crate::market_data::{Candle1m, Candle15m, OpenInterestSnapshot, FIFTEEN_MIN_MS};

/// 5-minute return from the last six closed 1m candles. Absent if fewer
/// than six are available or the reference close is zero.
pub fn ret_5m(candles_1m: &[Candle1m]) -> Option<f64> {
    let closed: Vec<&Candle1m> = candles_1m.iter().filter(|c| c.is_closed).collect();
    if closed.len() < 6 {
        return None;
    }
    let close_n = closed[closed.len() - 1].close;
    let close_n_minus_5 = closed[closed.len() - 6].close;
    if close_n_minus_5 == 0.0 {
        return None;
    }
    Some((close_n - close_n_minus_5) / close_n_minus_5)
}

/// Aggregates closed 1m candles into 15m windows aligned to 15-minute epoch
/// boundaries. A bucket can never hold more than 15 one-minute candles, so
/// the `group.len() < 15` filter below is both necessary and sufficient to
/// drop partial buckets — the newest bucket (still accumulating in real
/// time) and any other incomplete bucket (a gap in the feed) alike.
pub fn aggregate_15m(candles_1m: &[Candle1m]) -> Vec<Candle15m> {
    let mut buckets: BTreeMap<i64, Vec<Candle1m>> = BTreeMap::new();
    for c in candles_1m.iter().filter(|c| c.is_closed) {
        let key = c.open_time.div_euclid(FIFTEEN_MIN_MS);
        buckets.entry(key).or_default().push(*c);
    }

    let mut out = Vec::with_capacity(buckets.len());
    for (key, mut group) in buckets {
        if group.len() < 15 {
            continue;
        }
        group.sort_by_key(|c| c.open_time);
        let open = group[0].open;
        let close = group[group.len() - 1].close;
        let high = group.iter().fold(f64::MIN, |acc, c| acc.max(c.high));
        let low = group.iter().fold(f64::MAX, |acc, c| acc.min(c.low));
        out.push(Candle15m { window_start_ms: key * FIFTEEN_MIN_MS, open, high, low, close });
    }
    out
}

fn true_range(prev: Candle15m, cur: Candle15m) -> f64 {
    let range = cur.high - cur.low;
    let up = (cur.high - prev.close).abs();
    let down = (cur.low - prev.close).abs();
    range.max(up).max(down)
}

/// The full Wilder-smoothed ATR series over 15-minute windows: one value
/// per window beyond the `period`-sized seed. Empty if fewer than
/// `period + 1` windows are available. `atr_15m` and `atr_baseline` are
/// both derived from this series so they agree on what "recent" means.
pub fn atr_15m_series(candles_15m: &[Candle15m], period: usize) -> Vec<f64> {
    if period == 0 || candles_15m.len() < period + 1 {
        return Vec::new();
    }
    let true_ranges: Vec<f64> = candles_15m
        .windows(2)
        .map(|w| true_range(w[0], w[1]))
        .collect();

    let seed: f64 = true_ranges[..period].iter().sum::<f64>() / period as f64;
    let mut series = Vec::with_capacity(true_ranges.len() - period + 1);
    series.push(seed);
    let mut atr = seed;
    for tr in &true_ranges[period..] {
        atr = (atr * (period as f64 - 1.0) + tr) / period as f64;
        series.push(atr);
    }
    series
}

/// Wilder-smoothed ATR over 15-minute windows. Requires `period + 1`
/// windows (one to seed the first true-range delta).
pub fn atr_15m(candles_15m: &[Candle15m], period: usize) -> Option<f64> {
    atr_15m_series(candles_15m, period).last().copied()
}

/// Arithmetic mean of the most recent `<= 96` ATR values (24h of 15m bars).
pub fn atr_baseline(recent_atr_values: &[f64]) -> Option<f64> {
    if recent_atr_values.is_empty() {
        return None;
    }
    let take = recent_atr_values.len().min(96);
    let window = &recent_atr_values[recent_atr_values.len() - take..];
    Some(window.iter().sum::<f64>() / window.len() as f64)
}

/// Z-score of the latest OI sample against the mean/stddev of the history.
/// Absent below 10 samples or when the population has zero variance.
pub fn oi_zscore(history: &[OpenInterestSnapshot]) -> Option<f64> {
    if history.len() < 10 {
        return None;
    }
    let values: Vec<f64> = history.iter().map(|s| s.oi_value).collect();
    let mean = values.iter().sum::<f64>() / values.len() as f64;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / values.len() as f64;
    let stddev = variance.sqrt();
    if stddev == 0.0 {
        return None;
    }
    let current = *values.last().expect("non-empty, checked above");
    Some((current - mean) / stddev)
}

/// Percent change of OI over the last 15 minutes, against the nearest
/// sample at least 15 minutes old.
pub fn oi_delta_15m_pct(history: &[OpenInterestSnapshot], now_ms: i64) -> Option<f64> {
    let current = history.last()?;
    let cutoff = now_ms - FIFTEEN_MIN_MS;
    let reference = history
        .iter()
        .filter(|s| s.event_time_ms <= cutoff)
        .max_by_key(|s| s.event_time_ms)?;
    if reference.oi_value == 0.0 {
        return None;
    }
    Some((current.oi_value - reference.oi_value) / reference.oi_value)
}

/// Position size in USDT implied by a stop distance and a risk budget.
/// Absent when entry == stop (zero risk distance, undefined sizing).
pub fn position_usdt(entry: f64, stop: f64, max_risk_usdt: f64) -> Option<f64> {
    let risk_pct = (entry - stop).abs() / entry;
    if risk_pct == 0.0 || !risk_pct.is_finite() {
        return None;
    }
    let size = max_risk_usdt / risk_pct;
    if size.is_finite() && size > 0.0 {
        Some(size)
    } else {
        None
    }
}

/// High/low over the last `minutes` of closed 1m candles, excluding the
/// most recent (current) candle. Used by strategies looking for sweeps
/// against a recent range (spec.md §4.6, H20/L20).
pub fn window_high_low(candles_1m: &[Candle1m], minutes: i64) -> (Option<f64>, Option<f64>) {
    let closed: Vec<&Candle1m> = candles_1m.iter().filter(|c| c.is_closed).collect();
    if closed.len() < 2 {
        return (None, None);
    }
    let without_current = &closed[..closed.len() - 1];
    let cutoff = closed[closed.len() - 1].open_time - minutes * 60_000;
    let window: Vec<&&Candle1m> = without_current
        .iter()
        .filter(|c| c.open_time >= cutoff)
        .collect();
    if window.is_empty() {
        return (None, None);
    }
    let high = window.iter().fold(f64::MIN, |acc, c| acc.max(c.high));
    let low = window.iter().fold(f64::MAX, |acc, c| acc.min(c.low));
    (Some(high), Some(low))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candle(open_time: i64, close: f64) -> Candle1m {
        Candle1m {
            open_time,
            open: close,
            high: close + 0.5,
            low: close - 0.5,
            close,
            volume: 1.0,
            close_time: open_time + 59_999,
            is_closed: true,
        }
    }

    #[test]
    fn ret_5m_absent_below_six_candles() {
        let candles: Vec<Candle1m> = (0..5).map(|i| candle(i * 60_000, 100.0 + i as f64)).collect();
        assert!(ret_5m(&candles).is_none());
    }

    #[test]
    fn ret_5m_computes_over_six_candles() {
        let candles: Vec<Candle1m> = (0..6).map(|i| candle(i * 60_000, 100.0 + i as f64)).collect();
        let r = ret_5m(&candles).unwrap();
        assert!((r - 0.05).abs() < 1e-9);
    }

    #[test]
    fn aggregate_15m_drops_newest_and_partial_buckets() {
        // 30 minutes = two full 15m windows plus would-be third partial one.
        let candles: Vec<Candle1m> = (0..32).map(|i| candle(i * 60_000, 100.0 + i as f64)).collect();
        let windows = aggregate_15m(&candles);
        assert_eq!(windows.len(), 2);
        assert_eq!(windows[0].open, 100.0);
        assert_eq!(windows[0].close, 114.0);
        assert_eq!(windows[1].open, 115.0);
        assert_eq!(windows[1].close, 129.0);
    }

    #[test]
    fn aggregate_15m_keeps_newest_window_when_fully_observed() {
        // Exactly two full 15m windows (30 candles), no trailing partial data:
        // spec.md §8 requires exactly k Candle15m out, including the newest.
        let candles: Vec<Candle1m> = (0..30).map(|i| candle(i * 60_000, 100.0 + i as f64)).collect();
        let windows = aggregate_15m(&candles);
        assert_eq!(windows.len(), 2);
        assert_eq!(windows[0].open, 100.0);
        assert_eq!(windows[0].close, 114.0);
        assert_eq!(windows[1].open, 115.0);
        assert_eq!(windows[1].close, 129.0);
    }

    #[test]
    fn atr_15m_requires_period_plus_one_windows() {
        let windows: Vec<Candle15m> = (0..14)
            .map(|i| Candle15m {
                window_start_ms: i * FIFTEEN_MIN_MS,
                open: 100.0,
                high: 101.0,
                low: 99.0,
                close: 100.0,
            })
            .collect();
        assert!(atr_15m(&windows, 14).is_none());
    }

    #[test]
    fn atr_15m_computes_with_enough_windows() {
        let windows: Vec<Candle15m> = (0..15)
            .map(|i| Candle15m {
                window_start_ms: i * FIFTEEN_MIN_MS,
                open: 100.0,
                high: 102.0,
                low: 99.0,
                close: 100.5,
            })
            .collect();
        let atr = atr_15m(&windows, 14).unwrap();
        assert!(atr > 0.0);
    }

    #[test]
    fn oi_zscore_absent_below_ten_samples() {
        let history: Vec<OpenInterestSnapshot> = (0..9)
            .map(|i| OpenInterestSnapshot { oi_value: 1000.0 + i as f64, event_time_ms: i * 60_000 })
            .collect();
        assert!(oi_zscore(&history).is_none());
    }

    #[test]
    fn position_usdt_undefined_when_entry_equals_stop() {
        assert!(position_usdt(100.0, 100.0, 10.0).is_none());
    }

    #[test]
    fn position_usdt_matches_expected_scenario() {
        let pos = position_usdt(100.0, 98.8, 10.0).unwrap();
        assert!((pos - 833.333).abs() < 0.01);
    }
}
