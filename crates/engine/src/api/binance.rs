//! Binance public API client for market data (no authentication required)
//!
//! Only used to load a price series before an optimization starts; nothing in
//! the optimizer calls out to the network.

use anyhow::{Context, Result};
use chrono::{Duration, Utc};
use reqwest::Client;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::str::FromStr;
use tracing::{debug, info, warn};

use crate::types::Kline;

const DEFAULT_BASE_URL: &str = "https://api.binance.com";
const MAX_KLINES_PER_REQUEST: u32 = 1000;

/// Binance public market data client
#[derive(Clone)]
pub struct BinanceClient {
    client: Client,
    base_url: String,
}

/// Raw kline data from Binance API (array of arrays)
#[derive(Debug, Deserialize)]
#[allow(dead_code)]
struct RawKline(
    i64,    // 0: Open time
    String, // 1: Open
    String, // 2: High
    String, // 3: Low
    String, // 4: Close
    String, // 5: Volume
    i64,    // 6: Close time
    String, // 7: Quote asset volume
    u64,    // 8: Number of trades
    String, // 9: Taker buy base
    String, // 10: Taker buy quote
    String, // 11: Ignore
);

impl RawKline {
    fn into_kline(self) -> Option<Kline> {
        Some(Kline {
            open_time: self.0,
            open: Decimal::from_str(&self.1).ok()?,
            high: Decimal::from_str(&self.2).ok()?,
            low: Decimal::from_str(&self.3).ok()?,
            close: Decimal::from_str(&self.4).ok()?,
            volume: Decimal::from_str(&self.5).ok()?,
            close_time: self.6,
        })
    }
}

/// Parse a `/api/v3/klines` response body. Rows with unparseable prices are dropped.
pub fn parse_klines(body: &str) -> Result<Vec<Kline>> {
    let raw: Vec<RawKline> = serde_json::from_str(body).context("malformed kline response")?;
    let total = raw.len();
    let klines: Vec<Kline> = raw.into_iter().filter_map(RawKline::into_kline).collect();
    if klines.len() < total {
        warn!(dropped = total - klines.len(), "Dropped klines with invalid prices");
    }
    Ok(klines)
}

impl BinanceClient {
    /// Create a new Binance client with default base URL
    pub fn new() -> Result<Self> {
        Self::with_base_url(DEFAULT_BASE_URL)
    }

    pub fn with_base_url(base_url: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            client,
            base_url: base_url.into(),
        })
    }

    /// Fetch klines (candlestick data) for a symbol
    pub async fn get_klines(
        &self,
        symbol: &str,
        interval: &str,
        start_time: Option<i64>,
        end_time: Option<i64>,
        limit: Option<u32>,
    ) -> Result<Vec<Kline>> {
        let mut url = format!(
            "{}/api/v3/klines?symbol={}&interval={}",
            self.base_url, symbol, interval
        );

        if let Some(start) = start_time {
            url.push_str(&format!("&startTime={}", start));
        }
        if let Some(end) = end_time {
            url.push_str(&format!("&endTime={}", end));
        }

        let limit = limit.unwrap_or(500).min(MAX_KLINES_PER_REQUEST);
        url.push_str(&format!("&limit={}", limit));

        debug!(symbol, interval, "Fetching klines from Binance");

        let response = self.client.get(&url).send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Binance API error {}: {}", status, body);
        }

        let klines = parse_klines(&response.text().await?)?;
        debug!(count = klines.len(), "Fetched klines");
        Ok(klines)
    }

    /// Fetch klines with automatic pagination for ranges > 1000 bars
    pub async fn get_klines_paginated(
        &self,
        symbol: &str,
        interval: &str,
        start_time: i64,
        end_time: i64,
    ) -> Result<Vec<Kline>> {
        let mut all_klines = Vec::new();
        let mut current_start = start_time;

        info!(symbol, interval, "Fetching paginated klines from Binance");

        while current_start < end_time {
            let klines = self
                .get_klines(
                    symbol,
                    interval,
                    Some(current_start),
                    Some(end_time),
                    Some(MAX_KLINES_PER_REQUEST),
                )
                .await?;

            let Some(last_close_time) = klines.last().map(|k| k.close_time) else {
                break;
            };
            all_klines.extend(klines);

            // Move start to after the last candle
            current_start = last_close_time + 1;

            // Small delay to respect rate limits
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        }

        info!(total = all_klines.len(), "Paginated kline fetch complete");
        Ok(all_klines)
    }

    /// Fetch the last `days` days of history up to now
    pub async fn fetch_history(&self, symbol: &str, interval: &str, days: u32) -> Result<Vec<Kline>> {
        let end = Utc::now();
        let Some(start) = end.checked_sub_signed(Duration::days(i64::from(days))) else {
            anyhow::bail!("{} days of history reaches past the supported date range", days);
        };
        self.get_klines_paginated(symbol, interval, start.timestamp_millis(), end.timestamp_millis())
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_parse_klines() {
        let body = r#"[
            [1700000000000, "37000.10", "37500.00", "36800.50", "37250.25", "1234.5",
             1700086399999, "0", 100, "0", "0", "0"],
            [1700086400000, "bad", "1", "1", "1", "1",
             1700172799999, "0", 1, "0", "0", "0"]
        ]"#;
        let klines = parse_klines(body).unwrap();
        assert_eq!(klines.len(), 1);
        assert_eq!(klines[0].open_time, 1700000000000);
        assert_eq!(klines[0].close, dec!(37250.25));
        assert_eq!(klines[0].close_time, 1700086399999);
    }

    #[test]
    fn test_parse_rejects_non_array() {
        assert!(parse_klines(r#"{"code": -1121, "msg": "Invalid symbol."}"#).is_err());
    }

    #[tokio::test]
    async fn test_fetch_history_rejects_unrepresentable_range() {
        let client = BinanceClient::with_base_url("http://127.0.0.1:9").unwrap();
        let err = client.fetch_history("BTCUSDT", "1d", u32::MAX).await.unwrap_err();
        assert!(err.to_string().contains("date range"));
    }
}
