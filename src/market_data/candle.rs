// =============================================================================
// Candle types — 1-minute exchange candles and derived 15-minute windows
// =============================================================================

use serde::{Deserialize, Serialize};

/// A single 1-minute OHLCV candle from the exchange kline stream.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Candle1m {
    pub open_time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub close_time: i64,
    pub is_closed: bool,
}

/// A 15-minute candle aggregated from five (well, fifteen) closed 1-minute
/// candles. Fields follow spec.md §3: `open` of the first minute in the
/// window, `close` of the last, `high`/`low` across the window.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Candle15m {
    pub window_start_ms: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
}

/// Length of one 15-minute window in milliseconds.
pub const FIFTEEN_MIN_MS: i64 = 15 * 60 * 1000;
