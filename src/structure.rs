use crate::types::{MarketStructure, StructureTag, SwingKind, SwingPoint, Trend};

/// Swing highs and lows, each in chronological order.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Swings {
    pub highs: Vec<SwingPoint>,
    pub lows: Vec<SwingPoint>,
}

/// Finds candles that dominate `lookback` neighbours on both sides.
///
/// Ties count as dominant. The first and last `lookback` candles are never
/// classified.
pub fn find_swings(highs: &[f64], lows: &[f64], lookback: usize) -> Swings {
    let n = highs.len().min(lows.len());
    let mut swings = Swings::default();
    if lookback == 0 || n < 2 * lookback + 1 {
        return swings;
    }

    for i in lookback..(n - lookback) {
        let neighbours = (1..=lookback).flat_map(|j| [i - j, i + j]);

        if neighbours.clone().all(|k| highs[i] >= highs[k]) {
            swings.highs.push(SwingPoint { index: i, price: highs[i], kind: SwingKind::High });
        }
        if neighbours.clone().all(|k| lows[i] <= lows[k]) {
            swings.lows.push(SwingPoint { index: i, price: lows[i], kind: SwingKind::Low });
        }
    }
    swings
}

/// Tags the last two swing highs and lows and derives the trend.
pub fn classify(swings: &Swings) -> MarketStructure {
    if swings.highs.len() < 2 || swings.lows.len() < 2 {
        return MarketStructure {
            trend: Trend::Undefined,
            tags: Vec::new(),
            last_swing_high: swings.highs.last().copied(),
            last_swing_low: swings.lows.last().copied(),
        };
    }

    let [h0, h1] = last_two(&swings.highs);
    let [l0, l1] = last_two(&swings.lows);

    let high_tag = if h1.price > h0.price { StructureTag::HH } else { StructureTag::LH };
    let low_tag = if l1.price > l0.price { StructureTag::HL } else { StructureTag::LL };

    let trend = match (high_tag, low_tag) {
        (StructureTag::HH, StructureTag::HL) => Trend::Uptrend,
        (StructureTag::LH, StructureTag::LL) => Trend::Downtrend,
        _ => Trend::Ranging,
    };

    MarketStructure {
        trend,
        tags: vec![high_tag, low_tag],
        last_swing_high: Some(h1),
        last_swing_low: Some(l1),
    }
}

fn last_two(points: &[SwingPoint]) -> [SwingPoint; 2] {
    let n = points.len();
    [points[n - 2], points[n - 1]]
}
