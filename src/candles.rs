//! Candle wire format, symbol normalisation and the candle-fetch seam.

use std::collections::HashMap;

use serde_json::Value;

use crate::error::AnalysisError;
use crate::types::{Candle, Interval};

/// Capability to fetch chronological candles for an instrument.
///
/// Implementations must return oldest-first sequences and fail with
/// [`AnalysisError::DataUnavailable`] for unknown symbols or intervals.
pub trait CandleSource {
    fn fetch_candles(
        &self,
        symbol: &str,
        interval: Interval,
        limit: usize,
    ) -> Result<Vec<Candle>, AnalysisError>;
}

/// Candles already fetched and held in memory, keyed by symbol and interval.
#[derive(Clone, Debug, Default)]
pub struct MemoryCandleSource {
    series: HashMap<(String, Interval), Vec<Candle>>,
}

impl MemoryCandleSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a chronological series, replacing any previous one.
    pub fn insert(&mut self, symbol: &str, interval: Interval, candles: Vec<Candle>) {
        self.series.insert((normalize_symbol(symbol), interval), candles);
    }

    pub fn len(&self) -> usize {
        self.series.len()
    }

    pub fn is_empty(&self) -> bool {
        self.series.is_empty()
    }
}

impl CandleSource for MemoryCandleSource {
    fn fetch_candles(
        &self,
        symbol: &str,
        interval: Interval,
        limit: usize,
    ) -> Result<Vec<Candle>, AnalysisError> {
        let key = (normalize_symbol(symbol), interval);
        match self.series.get(&key) {
            Some(candles) if !candles.is_empty() => {
                let start = candles.len().saturating_sub(limit);
                Ok(candles[start..].to_vec())
            }
            _ => Err(AnalysisError::DataUnavailable {
                symbol: key.0,
                interval,
                reason: "no candles loaded".into(),
            }),
        }
    }
}

/// `BTC/USDT:USDT`, `btc-usdt` and `BTC` all become `BTCUSDT`.
pub fn normalize_symbol(raw: &str) -> String {
    let mut s = raw.trim().to_ascii_uppercase().replace(":USDT", "");
    s.retain(|c| c != '/' && c != '-');
    if !s.ends_with("USDT") {
        s.push_str("USDT");
    }
    s
}

/// Parses exchange kline rows `[ts, open, high, low, close, volume]`.
///
/// The exchange returns rows newest-first; the result is reversed to
/// chronological order. Fields may be JSON strings or numbers.
pub fn from_wire_rows(rows: &[Value]) -> Result<Vec<Candle>, AnalysisError> {
    let mut candles = rows
        .iter()
        .enumerate()
        .map(|(i, row)| parse_row(row).ok_or_else(|| {
            AnalysisError::invalid(format!("malformed kline row {i}: {row}"))
        }))
        .collect::<Result<Vec<_>, _>>()?;
    candles.reverse(); // newest-first → oldest-first
    Ok(candles)
}

fn parse_row(row: &Value) -> Option<Candle> {
    let arr = row.as_array()?;
    if arr.len() < 6 {
        return None;
    }
    let timestamp = match &arr[0] {
        Value::String(s) => s.parse().ok()?,
        v => v.as_i64()?,
    };
    Some(Candle {
        timestamp,
        open: field(&arr[1])?,
        high: field(&arr[2])?,
        low: field(&arr[3])?,
        close: field(&arr[4])?,
        volume: field(&arr[5])?,
    })
}

fn field(v: &Value) -> Option<f64> {
    let x = match v {
        Value::String(s) => s.parse().ok()?,
        v => v.as_f64()?,
    };
    x.is_finite().then_some(x)
}

/// Fails with `InsufficientData` when fewer than `needed` candles are present.
pub fn require(candles: &[Candle], needed: usize, context: &'static str) -> Result<(), AnalysisError> {
    if candles.len() < needed {
        Err(AnalysisError::insufficient(context, needed, candles.len()))
    } else {
        Ok(())
    }
}
