use serde::{Deserialize, Serialize};

use crate::config::{
    ENTRY_ZONE_MAX_DISTANCE_PCT, FVG_MIN_GAP_PCT, MAX_ENTRY_ZONES, MAX_ZONES_KEPT,
    OB_MIN_MOVE_PCT,
};
use crate::types::{Candle, Polarity, Trend, Zone, ZoneType};

/// Order blocks within the last `window` candles; the newest five are kept.
///
/// Bullish OB: bearish candle `i-1` followed by a close-to-close rally of at
/// least 0.3 %  →  zone = [close, open] of `i-1`.
/// Bearish OB: bullish candle `i-1` followed by a drop of at least 0.3 %.
/// The most recent candle is never the confirming candle.
pub fn find_order_blocks(candles: &[Candle], window: usize) -> Vec<Zone> {
    let n = candles.len();
    if n < 3 {
        return Vec::new();
    }
    let start = (n.saturating_sub(window) + 1).max(1);
    let mut blocks = Vec::new();

    for i in start..(n - 1) {
        let prev = &candles[i - 1];
        let cur = &candles[i];
        if prev.close <= 0.0 {
            continue;
        }

        if prev.is_bearish() {
            let move_pct = (cur.close - prev.close) / prev.close * 100.0;
            if move_pct >= OB_MIN_MOVE_PCT {
                blocks.push(Zone {
                    zone_type: ZoneType::OrderBlock,
                    polarity: Polarity::Bullish,
                    top: prev.open,
                    bottom: prev.close,
                    strength_pct: move_pct,
                    source_index: i - 1,
                });
            }
        }

        if prev.is_bullish() {
            let move_pct = (prev.close - cur.close) / prev.close * 100.0;
            if move_pct >= OB_MIN_MOVE_PCT {
                blocks.push(Zone {
                    zone_type: ZoneType::OrderBlock,
                    polarity: Polarity::Bearish,
                    top: prev.close,
                    bottom: prev.open,
                    strength_pct: move_pct,
                    source_index: i - 1,
                });
            }
        }
    }
    keep_recent(blocks)
}

/// Three-candle fair value gaps within the last `window` candles.
///
/// Bullish FVG: c3.low > c1.high  →  zone = [c1.high, c3.low]
/// Bearish FVG: c3.high < c1.low  →  zone = [c3.high, c1.low]
/// The gap must be at least 0.1 % of c1's extreme. `source_index` is c2.
pub fn find_fair_value_gaps(candles: &[Candle], window: usize) -> Vec<Zone> {
    let n = candles.len();
    if n < 3 {
        return Vec::new();
    }
    let start = n.saturating_sub(window);
    let mut gaps = Vec::new();

    for j in start..(n - 2) {
        let c1 = &candles[j];
        let c3 = &candles[j + 2];

        if c3.low > c1.high && c1.high > 0.0 {
            let gap_pct = (c3.low - c1.high) / c1.high * 100.0;
            if gap_pct >= FVG_MIN_GAP_PCT {
                gaps.push(Zone {
                    zone_type: ZoneType::FairValueGap,
                    polarity: Polarity::Bullish,
                    top: c3.low,
                    bottom: c1.high,
                    strength_pct: gap_pct,
                    source_index: j + 1,
                });
            }
        }

        if c3.high < c1.low && c1.low > 0.0 {
            let gap_pct = (c1.low - c3.high) / c1.low * 100.0;
            if gap_pct >= FVG_MIN_GAP_PCT {
                gaps.push(Zone {
                    zone_type: ZoneType::FairValueGap,
                    polarity: Polarity::Bearish,
                    top: c1.low,
                    bottom: c3.high,
                    strength_pct: gap_pct,
                    source_index: j + 1,
                });
            }
        }
    }
    keep_recent(gaps)
}

fn keep_recent(mut zones: Vec<Zone>) -> Vec<Zone> {
    if zones.len() > MAX_ZONES_KEPT {
        zones.drain(..zones.len() - MAX_ZONES_KEPT);
    }
    zones
}

/// A zone that is close enough to price, on the right side of the trend, to
/// trade from.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EntryZone {
    pub zone_type: ZoneType,
    pub polarity: Polarity,
    pub entry: f64,
    pub stop: f64,
    pub distance_pct: f64,
}

/// Ranks trend-aligned zones within 2 % of price, nearest first (top 3).
///
/// Uptrend: bullish zones whose top is below price; entry at the top, stop at
/// the bottom. Downtrend: bearish zones whose bottom is above price; entry at
/// the bottom, stop at the top.
pub fn find_entry_zones(
    current_price: f64,
    trend: Trend,
    order_blocks: &[Zone],
    fvgs: &[Zone],
) -> Vec<EntryZone> {
    if current_price <= 0.0 {
        return Vec::new();
    }
    let mut zones: Vec<EntryZone> = order_blocks
        .iter()
        .chain(fvgs.iter())
        .filter_map(|z| match (trend, z.polarity) {
            (Trend::Uptrend, Polarity::Bullish) if z.top < current_price => Some(EntryZone {
                zone_type: z.zone_type,
                polarity: z.polarity,
                entry: z.top,
                stop: z.bottom,
                distance_pct: (current_price - z.top) / current_price * 100.0,
            }),
            (Trend::Downtrend, Polarity::Bearish) if z.bottom > current_price => Some(EntryZone {
                zone_type: z.zone_type,
                polarity: z.polarity,
                entry: z.bottom,
                stop: z.top,
                distance_pct: (z.bottom - current_price) / current_price * 100.0,
            }),
            _ => None,
        })
        .filter(|z| z.distance_pct < ENTRY_ZONE_MAX_DISTANCE_PCT)
        .collect();

    zones.sort_by(|a, b| a.distance_pct.total_cmp(&b.distance_pct));
    zones.truncate(MAX_ENTRY_ZONES);
    zones
}
