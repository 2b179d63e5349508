// =============================================================================
// ExchangeClientREST — request/response fetches against Binance USDⓈ-M futures
// =============================================================================
//
// Every method is a pure fetch-and-decode: no caching, no retry, no state.
// `SourceManager` owns cadence and backoff. Numeric fields in Binance's
// futures API are frequently sent as JSON strings (`"62345.10"`), so every
// parse goes through `parse_num`, which accepts either representation —
// the exchange is free to drift on this without breaking us.
// =============================================================================

use std::time::Duration;

use serde_json::Value;
use tracing::instrument;

use crate::market_data::{Candle1m, FundingSnapshot, OpenInterestSnapshot, PriceTick};

use super::errors::{DecodeError, TransportError};

const DEFAULT_BASE_URL: &str = "https://fapi.binance.com";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

pub struct ExchangeClientREST {
    http: reqwest::Client,
    base_url: String,
}

impl ExchangeClientREST {
    pub fn new() -> Self {
        Self::with_base_url(DEFAULT_BASE_URL.to_string())
    }

    pub fn with_base_url(base_url: String) -> Self {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .expect("reqwest client builder should never fail on default TLS config");
        Self { http, base_url }
    }

    #[instrument(skip(self))]
    pub async fn get_price(&self, symbol: &str) -> Result<PriceTick, TransportError> {
        let url = format!("{}/fapi/v1/ticker/price", self.base_url);
        let received_time_ms = now_ms();
        let body: Value = self
            .http
            .get(&url)
            .query(&[("symbol", symbol)])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let price = parse_num(&body, "price")?;
        let event_time_ms = body
            .get("time")
            .and_then(Value::as_i64)
            .unwrap_or(received_time_ms);

        Ok(PriceTick { price, event_time_ms, received_time_ms })
    }

    #[instrument(skip(self))]
    pub async fn get_klines(&self, symbol: &str, limit: u32) -> Result<Vec<Candle1m>, TransportError> {
        let url = format!("{}/fapi/v1/klines", self.base_url);
        let body: Value = self
            .http
            .get(&url)
            .query(&[
                ("symbol", symbol.to_string()),
                ("interval", "1m".to_string()),
                ("limit", limit.to_string()),
            ])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let rows = body
            .as_array()
            .ok_or_else(|| DecodeError::UnexpectedShape("klines response is not an array".into()))?;

        let now = now_ms();
        let mut candles = Vec::with_capacity(rows.len());
        for row in rows {
            candles.push(decode_kline_row(row, now)?);
        }
        Ok(candles)
    }

    #[instrument(skip(self))]
    pub async fn get_premium_index(&self, symbol: &str) -> Result<FundingSnapshot, TransportError> {
        let url = format!("{}/fapi/v1/premiumIndex", self.base_url);
        let body: Value = self
            .http
            .get(&url)
            .query(&[("symbol", symbol)])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let mark_price = parse_num(&body, "markPrice")?;
        let last_funding_rate = parse_num(&body, "lastFundingRate")?;
        let next_funding_time_ms = body
            .get("nextFundingTime")
            .and_then(Value::as_i64)
            .ok_or(DecodeError::MissingField("nextFundingTime"))?;
        let event_time_ms = body.get("time").and_then(Value::as_i64).unwrap_or_else(now_ms);

        Ok(FundingSnapshot {
            mark_price,
            last_funding_rate,
            next_funding_time_ms,
            event_time_ms,
        })
    }

    /// Recent funding rates, most recent last.
    #[instrument(skip(self))]
    pub async fn get_funding_history(&self, symbol: &str, n: u32) -> Result<Vec<f64>, TransportError> {
        let url = format!("{}/fapi/v1/fundingRate", self.base_url);
        let body: Value = self
            .http
            .get(&url)
            .query(&[("symbol", symbol.to_string()), ("limit", n.to_string())])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let rows = body
            .as_array()
            .ok_or_else(|| DecodeError::UnexpectedShape("fundingRate response is not an array".into()))?;

        rows.iter()
            .map(|row| parse_num(row, "fundingRate").map_err(TransportError::from))
            .collect::<Result<Vec<_>, _>>()
    }

    #[instrument(skip(self))]
    pub async fn get_open_interest(&self, symbol: &str) -> Result<OpenInterestSnapshot, TransportError> {
        let url = format!("{}/fapi/v1/openInterest", self.base_url);
        let received_time_ms = now_ms();
        let body: Value = self
            .http
            .get(&url)
            .query(&[("symbol", symbol)])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let oi_value = parse_num(&body, "openInterest")?;
        let event_time_ms = body
            .get("time")
            .and_then(Value::as_i64)
            .unwrap_or(received_time_ms);

        Ok(OpenInterestSnapshot { oi_value, event_time_ms })
    }

    /// Used for clock sanity in `SourceManager`.
    #[instrument(skip(self))]
    pub async fn get_server_time(&self) -> Result<i64, TransportError> {
        let url = format!("{}/fapi/v1/time", self.base_url);
        let body: Value = self.http.get(&url).send().await?.error_for_status()?.json().await?;
        body.get("serverTime")
            .and_then(Value::as_i64)
            .ok_or_else(|| DecodeError::MissingField("serverTime").into())
    }
}

impl Default for ExchangeClientREST {
    fn default() -> Self {
        Self::new()
    }
}

fn decode_kline_row(row: &Value, received_time_ms: i64) -> Result<Candle1m, DecodeError> {
    let arr = row
        .as_array()
        .ok_or_else(|| DecodeError::UnexpectedShape("kline row is not an array".into()))?;
    if arr.len() < 7 {
        return Err(DecodeError::UnexpectedShape(format!(
            "kline row has {} fields, expected >= 7",
            arr.len()
        )));
    }

    let open_time = arr[0]
        .as_i64()
        .ok_or(DecodeError::MissingField("kline[0] open_time"))?;
    let open = parse_num_value(&arr[1], "kline.open")?;
    let high = parse_num_value(&arr[2], "kline.high")?;
    let low = parse_num_value(&arr[3], "kline.low")?;
    let close = parse_num_value(&arr[4], "kline.close")?;
    let volume = parse_num_value(&arr[5], "kline.volume")?;
    let close_time = arr[6]
        .as_i64()
        .ok_or(DecodeError::MissingField("kline[6] close_time"))?;

    // REST backfill only ever returns fully closed windows.
    let _ = received_time_ms;
    Ok(Candle1m {
        open_time,
        open,
        high,
        low,
        close,
        volume,
        close_time,
        is_closed: true,
    })
}

/// Coerce an object field that Binance may send as either a JSON string or a number.
fn parse_num(object: &Value, field: &'static str) -> Result<f64, DecodeError> {
    let value = object.get(field).ok_or(DecodeError::MissingField(field))?;
    parse_num_value(value, field)
}

/// Coerce a bare JSON value (e.g. an array element) to f64, string-or-number.
fn parse_num_value(value: &Value, field: &'static str) -> Result<f64, DecodeError> {
    match value {
        Value::String(s) => s.parse::<f64>().map_err(|_| DecodeError::NumericParse {
            field,
            value: s.clone(),
        }),
        Value::Number(n) => n.as_f64().ok_or_else(|| DecodeError::NumericParse {
            field,
            value: n.to_string(),
        }),
        other => Err(DecodeError::NumericParse { field, value: other.to_string() }),
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
