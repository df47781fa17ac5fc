//! First-4H-candle range and its breakout/retest on the 5m chart.

use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::candles::{require, CandleSource};
use crate::error::{AnalysisError, ErrorReport};
use crate::types::{Candle, Direction, Interval};

/// New York midnight is taken as 05:00 UTC all year (no DST).
const NY_UTC_OFFSET_HOURS: i64 = 5;
const RANGE_CANDLE_HOURS: i64 = 4;
const MIN_BREAKOUT_CANDLES: usize = 10;
const BREAKOUT_SCAN_CANDLES: usize = 50;
const BREAKOUT_EXTREME_SPAN: usize = 5;
const RANGE_RR: f64 = 2.0;
const RANGE_FETCH_4H: usize = 10;
const RANGE_FETCH_5M: usize = 100;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RangeLevels {
    pub candle_start: DateTime<Utc>,
    pub high: f64,
    pub low: f64,
    pub size: f64,
    pub size_pct: f64,
    pub is_closed: bool,
}

/// NY midnight (in UTC) of the trading day containing `now`.
pub fn ny_midnight(now: DateTime<Utc>) -> DateTime<Utc> {
    let offset = Duration::hours(NY_UTC_OFFSET_HOURS);
    let day_ms = Duration::days(1).num_milliseconds();
    let shifted = (now - offset).timestamp_millis();
    let midnight_ms = shifted.div_euclid(day_ms) * day_ms + offset.num_milliseconds();
    DateTime::from_timestamp_millis(midnight_ms).unwrap_or(now)
}

/// Range of the first 4H candle opening at or after NY midnight. When the day
/// has no such candle yet, the second-to-last candle stands in.
pub fn first_range_candle(candles_4h: &[Candle], now: DateTime<Utc>) -> Result<RangeLevels, AnalysisError> {
    require(candles_4h, 2, "4H range")?;
    let start_ms = ny_midnight(now).timestamp_millis();

    let candle = candles_4h
        .iter()
        .find(|c| c.timestamp >= start_ms)
        .unwrap_or(&candles_4h[candles_4h.len() - 2]);

    if !(candle.low > 0.0 && candle.high >= candle.low) {
        return Err(AnalysisError::Computation(format!(
            "degenerate range candle high={} low={}",
            candle.high, candle.low
        )));
    }
    let candle_start = DateTime::from_timestamp_millis(candle.timestamp)
        .ok_or_else(|| AnalysisError::invalid(format!("timestamp {} out of range", candle.timestamp)))?;
    let size = candle.high - candle.low;

    Ok(RangeLevels {
        candle_start,
        high: candle.high,
        low: candle.low,
        size,
        size_pct: size / candle.low * 100.0,
        is_closed: now >= candle_start + Duration::hours(RANGE_CANDLE_HOURS),
    })
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BreakoutSignal {
    Long,
    Short,
    BreakingHigh,
    BreakingLow,
    NoSignal,
}

impl fmt::Display for BreakoutSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BreakoutSignal::Long => "LONG",
            BreakoutSignal::Short => "SHORT",
            BreakoutSignal::BreakingHigh => "BREAKING_HIGH",
            BreakoutSignal::BreakingLow => "BREAKING_LOW",
            BreakoutSignal::NoSignal => "NO_SIGNAL",
        };
        f.write_str(s)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RangeSetup {
    pub direction: Direction,
    pub entry_price: f64,
    pub stop_loss: f64,
    pub take_profit: f64,
    pub sl_pct: f64,
    pub rr_ratio: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BreakoutCheck {
    pub signal: BreakoutSignal,
    pub current_price: f64,
    pub range_high: f64,
    pub range_low: f64,
    pub inside_range: bool,
    pub setup: Option<RangeSetup>,
}

/// Close-outside-then-close-back-inside check on 5m candles.
///
/// The last 50 closed candles are scanned for closes outside the range; the
/// latest such breakout on each side wins, and its extreme (over the next
/// five candles) becomes the stop. A setup needs the current close back
/// inside and the previous close still outside. Target is 2R.
pub fn check_range_breakout(
    candles_5m: &[Candle],
    range_high: f64,
    range_low: f64,
) -> Result<BreakoutCheck, AnalysisError> {
    require(candles_5m, MIN_BREAKOUT_CANDLES, "range breakout")?;
    if !(range_low > 0.0 && range_high > range_low) {
        return Err(AnalysisError::invalid(format!(
            "range_high {range_high} must be above range_low {range_low} > 0"
        )));
    }

    let n = candles_5m.len();
    let current_price = candles_5m[n - 1].close;
    let prev_close = candles_5m[n - 2].close;

    let mut stop_above: Option<f64> = None;
    let mut stop_below: Option<f64> = None;
    for i in n.saturating_sub(BREAKOUT_SCAN_CANDLES)..n - 1 {
        let close = candles_5m[i].close;
        let span = if i + BREAKOUT_EXTREME_SPAN <= n {
            &candles_5m[i..i + BREAKOUT_EXTREME_SPAN]
        } else {
            &candles_5m[i..=i]
        };
        if close > range_high {
            stop_above = Some(span.iter().map(|c| c.high).fold(f64::MIN, f64::max));
        }
        if close < range_low {
            stop_below = Some(span.iter().map(|c| c.low).fold(f64::MAX, f64::min));
        }
    }

    let inside_range = (range_low..=range_high).contains(&current_price);
    let (signal, setup) = match (stop_above, stop_below) {
        (Some(stop), _) if inside_range && prev_close > range_high => {
            (BreakoutSignal::Short, Some(range_setup(Direction::Short, current_price, stop)))
        }
        (_, Some(stop)) if inside_range && prev_close < range_low => {
            (BreakoutSignal::Long, Some(range_setup(Direction::Long, current_price, stop)))
        }
        _ if current_price > range_high => (BreakoutSignal::BreakingHigh, None),
        _ if current_price < range_low => (BreakoutSignal::BreakingLow, None),
        _ => (BreakoutSignal::NoSignal, None),
    };

    Ok(BreakoutCheck {
        signal,
        current_price,
        range_high,
        range_low,
        inside_range,
        setup,
    })
}

fn range_setup(direction: Direction, entry_price: f64, stop_loss: f64) -> RangeSetup {
    let sl_distance = (entry_price - stop_loss).abs();
    RangeSetup {
        direction,
        entry_price,
        stop_loss,
        take_profit: entry_price + direction.sign() * sl_distance * RANGE_RR,
        sl_pct: sl_distance / entry_price * 100.0,
        rr_ratio: RANGE_RR,
    }
}

// ─── Multi-symbol scan ────────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RangeScanEntry {
    Checked { symbol: String, range: RangeLevels, check: BreakoutCheck },
    RangeForming { symbol: String, range: RangeLevels },
    Failed { symbol: String, error: ErrorReport },
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RangeScan {
    pub entries: Vec<RangeScanEntry>,
}

impl RangeScan {
    pub fn setups(&self) -> impl Iterator<Item = (&str, &RangeSetup)> {
        self.entries.iter().filter_map(|e| match e {
            RangeScanEntry::Checked { symbol, check, .. } => {
                check.setup.as_ref().map(|s| (symbol.as_str(), s))
            }
            _ => None,
        })
    }
}

/// Range + breakout check for every symbol; a failing symbol is recorded
/// and the scan moves on.
pub fn scan_range_setups<S: CandleSource + ?Sized>(
    source: &S,
    symbols: &[String],
    now: DateTime<Utc>,
) -> RangeScan {
    let mut scan = RangeScan::default();
    for symbol in symbols {
        let entry = match scan_one(source, symbol, now) {
            Ok(entry) => entry,
            Err(e) => {
                log::warn!("[{}] range scan failed: {}", symbol, e);
                RangeScanEntry::Failed { symbol: symbol.clone(), error: ErrorReport::from(&e) }
            }
        };
        scan.entries.push(entry);
    }
    scan
}

fn scan_one<S: CandleSource + ?Sized>(
    source: &S,
    symbol: &str,
    now: DateTime<Utc>,
) -> Result<RangeScanEntry, AnalysisError> {
    let candles_4h = source.fetch_candles(symbol, Interval::H4, RANGE_FETCH_4H)?;
    let range = first_range_candle(&candles_4h, now)?;
    if !range.is_closed {
        return Ok(RangeScanEntry::RangeForming { symbol: symbol.to_string(), range });
    }
    let candles_5m = source.fetch_candles(symbol, Interval::M5, RANGE_FETCH_5M)?;
    let check = check_range_breakout(&candles_5m, range.high, range.low)?;
    if let Some(s) = &check.setup {
        log::info!(
            "[{}] range {} entry={:.4} sl={:.4} tp={:.4}",
            symbol,
            check.signal,
            s.entry_price,
            s.stop_loss,
            s.take_profit
        );
    }
    Ok(RangeScanEntry::Checked { symbol: symbol.to_string(), range, check })
}
