//! Public Bybit v5 market-data client used by the scan binary.

use std::future::Future;
use std::time::Duration;

use thiserror::Error;

use smc_trader::candles::from_wire_rows;
use smc_trader::config::BYBIT_REST_URL;
use smc_trader::types::{Candle, Interval};

/// Bybit caps a kline page at 1000 rows.
pub const MAX_KLINE_LIMIT: usize = 1000;

// ── Error types ───────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum BybitError {
    /// Rate limited (retCode=10006 or HTTP 429). retry_after in seconds.
    #[error("rate limited (retry after {retry_after}s)")]
    RateLimit { retry_after: u64 },
    /// Network, timeout, HTTP 5xx, server overload (retCode=10016).
    #[error("transient error: {0}")]
    Transient(String),
    /// Invalid symbol/interval, HTTP 4xx, malformed payload.
    #[error("permanent error: {0}")]
    Permanent(String),
}

fn classify_error(ret_code: i64, http_status: u16, msg: &str) -> BybitError {
    match (ret_code, http_status) {
        (10006, _) | (_, 429) => BybitError::RateLimit { retry_after: 10 },
        (10016, _) | (_, 500..=599) => BybitError::Transient(msg.to_string()),
        _ => BybitError::Permanent(format!("retCode={} msg={}", ret_code, msg)),
    }
}

/// Retries rate limits and transient failures with exponential backoff.
async fn with_retry<F, Fut, T>(operation: F, max_retries: u32) -> Result<T, BybitError>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, BybitError>>,
{
    let mut retries = 0;
    let mut delay: u64 = 1;
    loop {
        match operation().await {
            Ok(r) => return Ok(r),
            Err(BybitError::RateLimit { retry_after }) if retries < max_retries => {
                log::warn!("Rate limited, sleeping {}s (attempt {}/{})", retry_after, retries + 1, max_retries);
                tokio::time::sleep(Duration::from_secs(retry_after)).await;
            }
            Err(BybitError::Transient(msg)) if retries < max_retries => {
                log::warn!("Transient error: {}, retry in {}s ({}/{})", msg, delay, retries + 1, max_retries);
                tokio::time::sleep(Duration::from_secs(delay)).await;
                delay = (delay * 2).min(60);
            }
            Err(e) => return Err(e),
        }
        retries += 1;
    }
}

// ── Client ────────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct BybitClient {
    client: reqwest::Client,
    base_url: String,
}

impl BybitClient {
    pub fn new() -> Result<Self, BybitError> {
        let client = reqwest::Client::builder()
            .pool_max_idle_per_host(10)
            .timeout(Duration::from_secs(10))
            .connect_timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| BybitError::Permanent(format!("HTTP client build failed: {}", e)))?;
        Ok(BybitClient { client, base_url: BYBIT_REST_URL.to_string() })
    }

    async fn fetch_klines_raw(
        &self,
        symbol: &str,
        interval: Interval,
        limit: usize,
    ) -> Result<Vec<Candle>, BybitError> {
        let url = format!(
            "{}/v5/market/kline?category=linear&symbol={}&interval={}&limit={}",
            self.base_url,
            symbol,
            interval.code(),
            limit
        );
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| BybitError::Transient(format!("HTTP error: {}", e)))?;

        let http_status = resp.status().as_u16();
        let json: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| BybitError::Transient(format!("Parse error: {}", e)))?;

        let ret_code = json["retCode"].as_i64().unwrap_or(-1);
        if ret_code != 0 {
            let msg = json["retMsg"].as_str().unwrap_or("unknown");
            return Err(classify_error(ret_code, http_status, msg));
        }

        let list = json["result"]["list"]
            .as_array()
            .ok_or_else(|| BybitError::Transient("missing result.list".into()))?;

        // Rows arrive newest-first; from_wire_rows returns them oldest-first.
        from_wire_rows(list).map_err(|e| BybitError::Permanent(e.to_string()))
    }

    /// Last `limit` klines for a linear symbol, oldest first.
    pub async fn fetch_klines(
        &self,
        symbol: &str,
        interval: Interval,
        limit: usize,
    ) -> Result<Vec<Candle>, BybitError> {
        let limit = limit.clamp(1, MAX_KLINE_LIMIT);
        with_retry(|| self.fetch_klines_raw(symbol, interval, limit), 3).await
    }
}
