// Kraken public REST market data: OHLC candles and ticker prices

use async_trait::async_trait;
use chrono::DateTime;
use serde_json::Value;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::time::sleep;
use tracing::debug;

use crate::clients::{MarketDataError, MarketDataSource};
use crate::core::clock::{Clock, SystemClock};
use crate::core::types::Candle;

pub const KRAKEN_API_URL: &str = "https://api.kraken.com";

/// Candles older than this many intervals are treated as stale
const STALE_INTERVALS: i64 = 3;

pub struct KrakenMarketData {
    client: reqwest::Client,
    base_url: String,
    interval_minutes: u32,
    rate_limiter: Mutex<RateLimiter>,
    clock: Arc<dyn Clock>,
}

impl KrakenMarketData {
    pub fn new(interval_minutes: u32) -> Self {
        Self::with_base_url(KRAKEN_API_URL, interval_minutes)
    }

    pub fn with_base_url(base_url: &str, interval_minutes: u32) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            interval_minutes,
            rate_limiter: Mutex::new(RateLimiter::new(60, Duration::from_secs(60))), // 60 calls per minute
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    async fn public_get(&self, endpoint: &str, params: &[(&str, String)]) -> Result<Value, MarketDataError> {
        let wait = self
            .rate_limiter
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .reserve();
        if !wait.is_zero() {
            sleep(wait).await;
        }

        let url = format!("{}/0/public/{}", self.base_url, endpoint);
        let response = self
            .client
            .get(&url)
            .query(params)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    MarketDataError::Timeout(e.to_string())
                } else {
                    MarketDataError::Unavailable(e.to_string())
                }
            })?;

        if !response.status().is_success() {
            return Err(MarketDataError::Unavailable(format!("HTTP {} from {}", response.status().as_u16(), endpoint)));
        }

        let json: Value = response
            .json()
            .await
            .map_err(|e| MarketDataError::Unavailable(format!("invalid JSON: {}", e)))?;

        check_api_errors(&json)?;
        Ok(json)
    }
}

#[async_trait]
impl MarketDataSource for KrakenMarketData {
    async fn get_candles(&self, pair: &str, window: usize) -> Result<Vec<Candle>, MarketDataError> {
        let params = [
            ("pair", normalize_pair_name(pair)),
            ("interval", self.interval_minutes.to_string()),
        ];
        let json = self.public_get("OHLC", &params).await?;
        let mut candles = parse_ohlc_response(&json)?;
        if candles.is_empty() {
            return Err(MarketDataError::Unavailable(format!("no candles returned for {}", pair)));
        }

        let last = candles[candles.len() - 1].timestamp;
        let age_secs = (self.clock.now() - last).num_seconds();
        if age_secs > STALE_INTERVALS * self.interval_minutes as i64 * 60 {
            return Err(MarketDataError::Stale { pair: pair.to_string(), age_secs });
        }

        if candles.len() > window {
            candles.drain(..candles.len() - window);
        }
        debug!("Fetched {} candles for {}", candles.len(), pair);
        Ok(candles)
    }

    async fn get_current_price(&self, pair: &str) -> Result<f64, MarketDataError> {
        let json = self.public_get("Ticker", &[("pair", normalize_pair_name(pair))]).await?;
        let ticker = json["result"]
            .as_object()
            .and_then(|result| result.values().next())
            .ok_or_else(|| MarketDataError::Unavailable("missing ticker result".to_string()))?;

        // "c" is [last trade price, lot volume]
        ticker["c"][0]
            .as_str()
            .and_then(|s| s.parse::<f64>().ok())
            .filter(|price| price.is_finite() && *price > 0.0)
            .ok_or_else(|| MarketDataError::Unavailable(format!("invalid last trade price for {}", pair)))
    }
}

fn check_api_errors(json: &Value) -> Result<(), MarketDataError> {
    let Some(errors) = json["error"].as_array() else {
        return Ok(());
    };
    let messages: Vec<&str> = errors.iter().filter_map(Value::as_str).collect();
    if messages.is_empty() {
        return Ok(());
    }
    if messages.iter().any(|m| m.contains("Unknown asset pair")) {
        return Err(MarketDataError::UnknownPair(messages.join(", ")));
    }
    Err(MarketDataError::Unavailable(messages.join(", ")))
}

/// Parse `[time, open, high, low, close, vwap, volume, count]` rows into candles
pub fn parse_ohlc_response(json: &Value) -> Result<Vec<Candle>, MarketDataError> {
    let result = json["result"]
        .as_object()
        .ok_or_else(|| MarketDataError::Unavailable("missing result field".to_string()))?;

    // The result also carries a "last" cursor next to the pair data
    let rows = result
        .iter()
        .filter(|(key, _)| key.as_str() != "last")
        .find_map(|(_, value)| value.as_array())
        .ok_or_else(|| MarketDataError::Unavailable("invalid OHLC data format".to_string()))?;

    let field = |row: &[Value], index: usize, name: &str| -> Result<f64, MarketDataError> {
        row[index]
            .as_str()
            .and_then(|s| s.parse::<f64>().ok())
            .ok_or_else(|| MarketDataError::Unavailable(format!("invalid {} field", name)))
    };

    let mut candles = Vec::with_capacity(rows.len());
    for row in rows {
        let Some(row) = row.as_array() else {
            return Err(MarketDataError::Unavailable("invalid candle format".to_string()));
        };
        let row = row.as_slice();
        if row.len() < 7 {
            continue; // Skip malformed candles
        }

        let timestamp = row[0]
            .as_i64()
            .and_then(|secs| DateTime::from_timestamp(secs, 0))
            .ok_or_else(|| MarketDataError::Unavailable("invalid timestamp".to_string()))?;

        candles.push(Candle::new(
            timestamp,
            field(row, 1, "open")?,
            field(row, 2, "high")?,
            field(row, 3, "low")?,
            field(row, 4, "close")?,
            field(row, 6, "volume")?,
        ));
    }

    candles.sort_by_key(|candle| candle.timestamp);
    Ok(candles)
}

/// Kraken spells bitcoin XBT and takes pairs without a separator ("BTC/USDT" -> "XBTUSDT")
pub fn normalize_pair_name(pair: &str) -> String {
    let mut parts = pair.split('/');
    match (parts.next(), parts.next()) {
        (Some(base), Some(quote)) => {
            let rename = |asset: &str| if asset.eq_ignore_ascii_case("BTC") { "XBT".to_string() } else { asset.to_uppercase() };
            format!("{}{}", rename(base), rename(quote))
        }
        _ => pair.to_uppercase(),
    }
}

#[derive(Debug)]
struct RateLimiter {
    max_calls: u32,
    window_duration: Duration,
    calls: Vec<Instant>,
}

impl RateLimiter {
    fn new(max_calls: u32, window_duration: Duration) -> Self {
        Self { max_calls, window_duration, calls: Vec::new() }
    }

    /// Record a call and return how long the caller should wait before making it
    fn reserve(&mut self) -> Duration {
        let now = Instant::now();
        self.calls.retain(|&call_time| now.duration_since(call_time) <= self.window_duration);

        let wait = if self.calls.len() >= self.max_calls as usize {
            self.calls
                .first()
                .map(|&oldest| self.window_duration.saturating_sub(now.duration_since(oldest)))
                .unwrap_or_default()
        } else {
            Duration::ZERO
        };

        self.calls.push(now + wait);
        wait
    }
}
