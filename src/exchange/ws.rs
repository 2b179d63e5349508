// =============================================================================
// ExchangeClientWS — single combined-stream session for bookTicker + kline_1m
// =============================================================================
//
// One socket, subscribed once at connect time to every configured symbol's
// `bookTicker` and `kline_1m` streams via Binance's combined-stream path.
// Reconnection policy lives in `SourceManager`; this type only owns the
// socket and turns frames into typed events.
// =============================================================================

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::instrument;

use crate::market_data::{Candle1m, PriceTick};

use super::errors::StreamError;

const WS_BASE_URL: &str = "wss://fstream.binance.com/stream";

/// One event surfaced from the combined stream.
#[derive(Debug, Clone)]
pub enum ExchangeEvent {
    Price(String, PriceTick),
    Candle(String, Candle1m),
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub struct ExchangeClientWS {
    socket: Option<WsStream>,
    symbols: Vec<String>,
}

impl ExchangeClientWS {
    pub fn new(symbols: Vec<String>) -> Self {
        Self { socket: None, symbols }
    }

    fn stream_url(&self) -> String {
        let streams = self
            .symbols
            .iter()
            .flat_map(|s| {
                let lower = s.to_lowercase();
                vec![format!("{}@bookTicker", lower), format!("{}@kline_1m", lower)]
            })
            .collect::<Vec<_>>()
            .join("/");
        format!("{}?streams={}", WS_BASE_URL, streams)
    }

    /// Opens the session. Must be called before `read_event`.
    #[instrument(skip(self))]
    pub async fn start(&mut self) -> Result<(), StreamError> {
        let url = self.stream_url();
        let (socket, _response) = connect_async(&url)
            .await
            .map_err(|e| StreamError::Connect(e.to_string()))?;
        self.socket = Some(socket);
        Ok(())
    }

    /// Reads the next event from the session. Returns `StreamError` on
    /// disconnect, malformed frame, or parse failure — `SourceManager`
    /// treats any `Err` here as a failover trigger.
    pub async fn read_event(&mut self) -> Result<ExchangeEvent, StreamError> {
        loop {
            let socket = self.socket.as_mut().ok_or(StreamError::Closed)?;
            let msg = socket
                .next()
                .await
                .ok_or(StreamError::Closed)?
                .map_err(|e| StreamError::Malformed(e.to_string()))?;

            match msg {
                Message::Text(text) => {
                    if let Some(event) = parse_combined_frame(&text)? {
                        return Ok(event);
                    }
                    // Unrecognized stream payload (schema drift): skip, keep reading.
                }
                Message::Ping(payload) => {
                    socket
                        .send(Message::Pong(payload))
                        .await
                        .map_err(|e| StreamError::Malformed(e.to_string()))?;
                }
                Message::Close(_) => return Err(StreamError::Closed),
                _ => {}
            }
        }
    }

    /// Scoped release; owner is responsible for calling this on shutdown or
    /// before reconnecting.
    pub async fn close(&mut self) {
        if let Some(mut socket) = self.socket.take() {
            let _ = socket.close(None).await;
        }
    }
}

/// Parses one combined-stream text frame: `{"stream": "...", "data": {...}}`.
/// Returns `Ok(None)` for a recognized-but-irrelevant payload so the caller
/// keeps reading instead of erroring on schema drift.
fn parse_combined_frame(text: &str) -> Result<Option<ExchangeEvent>, StreamError> {
    let envelope: Value =
        serde_json::from_str(text).map_err(|e| StreamError::Malformed(e.to_string()))?;

    let stream = envelope
        .get("stream")
        .and_then(Value::as_str)
        .ok_or_else(|| StreamError::Malformed("missing stream field".into()))?;
    let data = envelope
        .get("data")
        .ok_or_else(|| StreamError::Malformed("missing data field".into()))?;

    if stream.ends_with("@bookTicker") {
        Ok(Some(parse_book_ticker(data)?))
    } else if stream.contains("@kline_") {
        Ok(Some(parse_kline(data)?))
    } else {
        Ok(None)
    }
}

fn parse_book_ticker(data: &Value) -> Result<ExchangeEvent, StreamError> {
    let symbol = data
        .get("s")
        .and_then(Value::as_str)
        .ok_or_else(|| StreamError::Malformed("bookTicker missing symbol".into()))?
        .to_string();
    let bid = parse_str_f64(data, "b")?;
    let ask = parse_str_f64(data, "a")?;
    let price = (bid + ask) / 2.0;
    let event_time_ms = data
        .get("E")
        .and_then(Value::as_i64)
        .unwrap_or_else(now_ms);

    Ok(ExchangeEvent::Price(
        symbol,
        PriceTick { price, event_time_ms, received_time_ms: now_ms() },
    ))
}

fn parse_kline(data: &Value) -> Result<ExchangeEvent, StreamError> {
    let symbol = data
        .get("s")
        .and_then(Value::as_str)
        .ok_or_else(|| StreamError::Malformed("kline missing symbol".into()))?
        .to_string();
    let k = data
        .get("k")
        .ok_or_else(|| StreamError::Malformed("kline missing k object".into()))?;

    let open_time = k
        .get("t")
        .and_then(Value::as_i64)
        .ok_or_else(|| StreamError::Malformed("kline missing open time".into()))?;
    let close_time = k
        .get("T")
        .and_then(Value::as_i64)
        .ok_or_else(|| StreamError::Malformed("kline missing close time".into()))?;
    let is_closed = k.get("x").and_then(Value::as_bool).unwrap_or(false);

    let candle = Candle1m {
        open_time,
        open: parse_str_f64(k, "o")?,
        high: parse_str_f64(k, "h")?,
        low: parse_str_f64(k, "l")?,
        close: parse_str_f64(k, "c")?,
        volume: parse_str_f64(k, "v")?,
        close_time,
        is_closed,
    };

    Ok(ExchangeEvent::Candle(symbol, candle))
}

fn parse_str_f64(object: &Value, field: &'static str) -> Result<f64, StreamError> {
    let value = object
        .get(field)
        .ok_or_else(|| StreamError::Malformed(format!("missing field {field}")))?;
    match value {
        Value::String(s) => s
            .parse::<f64>()
            .map_err(|_| StreamError::Malformed(format!("bad numeric string in {field}: {s}"))),
        Value::Number(n) => n
            .as_f64()
            .ok_or_else(|| StreamError::Malformed(format!("bad number in {field}"))),
        other => Err(StreamError::Malformed(format!("unexpected type in {field}: {other}"))),
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn book_ticker_frame_parses_to_price_event() {
        let frame = serde_json::json!({
            "stream": "btcusdt@bookTicker",
            "data": {"s": "BTCUSDT", "b": "100.0", "a": "100.2", "E": 1_700_000_000_000i64}
        })
        .to_string();

        match parse_combined_frame(&frame).unwrap().unwrap() {
            ExchangeEvent::Price(symbol, tick) => {
                assert_eq!(symbol, "BTCUSDT");
                assert_eq!(tick.price, 100.1);
            }
            other => panic!("expected Price event, got {other:?}"),
        }
    }

    #[test]
    fn kline_frame_parses_closed_flag() {
        let frame = serde_json::json!({
            "stream": "btcusdt@kline_1m",
            "data": {
                "s": "BTCUSDT",
                "k": {
                    "t": 0, "T": 59_999, "o": "100.0", "h": "101.0",
                    "l": "99.0", "c": "100.5", "v": "10.0", "x": true
                }
            }
        })
        .to_string();

        match parse_combined_frame(&frame).unwrap().unwrap() {
            ExchangeEvent::Candle(symbol, candle) => {
                assert_eq!(symbol, "BTCUSDT");
                assert!(candle.is_closed);
                assert_eq!(candle.close, 100.5);
            }
            other => panic!("expected Candle event, got {other:?}"),
        }
    }

    #[test]
    fn unrecognized_stream_is_skipped_not_errored() {
        let frame = serde_json::json!({
            "stream": "btcusdt@markPrice",
            "data": {"s": "BTCUSDT"}
        })
        .to_string();
        assert!(parse_combined_frame(&frame).unwrap().is_none());
    }
}
