//! Liquidity pools, market bias, liquidity sweeps and liquidation clusters.

use std::collections::{HashMap, VecDeque};

use serde::{Deserialize, Serialize};

use crate::candles::require;
use crate::config::{
    pool_window, LIQUIDATION_CACHE_DEPTH, LIQUIDATION_CACHE_SYMBOLS, MAX_POOLS_REPORTED,
    MIN_SWEEP_CANDLES, POOL_FETCH_PADDING, SWEEP_FETCH_CANDLES, SWEEP_LEVELS_CHECKED,
    SWEEP_SWING_EXCLUDE, SWING_LOOKBACK,
};
use crate::error::AnalysisError;
use crate::structure::{find_swings, Swings};
use crate::types::{
    Bias, Candle, Direction, Interval, LiquidityPool, PoolSide, Polarity, SweepEvent,
};

// ─── Pools & bias ─────────────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LiquidityMap {
    pub interval: Interval,
    pub price: f64,
    pub bias: Bias,
    /// Pools above price, nearest first.
    pub bsl: Vec<LiquidityPool>,
    /// Pools below price, nearest first.
    pub ssl: Vec<LiquidityPool>,
}

impl LiquidityMap {
    pub fn nearest_bsl(&self) -> Option<&LiquidityPool> {
        self.bsl.first()
    }

    pub fn nearest_ssl(&self) -> Option<&LiquidityPool> {
        self.ssl.first()
    }
}

/// Bias from the last two swing highs and lows: both higher → bullish, both
/// lower → bearish, anything else (or too few swings) → neutral.
pub fn market_bias(swings: &Swings) -> Bias {
    let (h, l) = (&swings.highs, &swings.lows);
    if h.len() < 2 || l.len() < 2 {
        return Bias::Neutral;
    }
    let (h0, h1) = (h[h.len() - 2].price, h[h.len() - 1].price);
    let (l0, l1) = (l[l.len() - 2].price, l[l.len() - 1].price);

    if h1 > h0 && l1 > l0 {
        Bias::Bullish
    } else if h1 < h0 && l1 < l0 {
        Bias::Bearish
    } else {
        Bias::Neutral
    }
}

/// Maps swing points of `candles` into buy-side and sell-side pools around the
/// latest close. Needs at least the timeframe's pool window of candles.
pub fn map_liquidity(candles: &[Candle], interval: Interval) -> Result<LiquidityMap, AnalysisError> {
    let window = pool_window(interval);
    require(candles, window, "liquidity pools")?;

    let tail = &candles[candles.len().saturating_sub(window + POOL_FETCH_PADDING)..];
    let highs: Vec<f64> = tail.iter().map(|c| c.high).collect();
    let lows: Vec<f64> = tail.iter().map(|c| c.low).collect();
    let price = tail[tail.len() - 1].close;
    if price <= 0.0 {
        return Err(AnalysisError::Computation(format!("non-positive close {price}")));
    }

    let swings = find_swings(&highs, &lows, SWING_LOOKBACK);

    let mut bsl: Vec<LiquidityPool> = swings
        .highs
        .iter()
        .filter(|s| s.price > price)
        .map(|s| LiquidityPool {
            price: s.price,
            side: PoolSide::BSL,
            distance_pct: (s.price - price) / price * 100.0,
        })
        .collect();
    let mut ssl: Vec<LiquidityPool> = swings
        .lows
        .iter()
        .filter(|s| s.price < price)
        .map(|s| LiquidityPool {
            price: s.price,
            side: PoolSide::SSL,
            distance_pct: (price - s.price) / price * 100.0,
        })
        .collect();

    bsl.sort_by(|a, b| a.distance_pct.total_cmp(&b.distance_pct));
    ssl.sort_by(|a, b| a.distance_pct.total_cmp(&b.distance_pct));
    bsl.truncate(MAX_POOLS_REPORTED);
    ssl.truncate(MAX_POOLS_REPORTED);

    let bias = market_bias(&swings);
    log::debug!(
        "{} pools: price={:.4} bias={} bsl={} ssl={}",
        interval,
        price,
        bias,
        bsl.len(),
        ssl.len()
    );

    Ok(LiquidityMap { interval, price, bias, bsl, ssl })
}

// ─── Opposing liquidity ───────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OpposingTarget {
    pub direction: Direction,
    pub entry_price: f64,
    pub tp_price: f64,
    pub tp_distance_pct: f64,
    pub side: PoolSide,
}

/// Nearest pool on the far side of `entry`: BSL above for LONG, SSL below for
/// SHORT. `None` when the map has no such pool.
pub fn nearest_opposing(map: &LiquidityMap, direction: Direction, entry: f64) -> Option<OpposingTarget> {
    let pool = match direction {
        Direction::Long => map.bsl.iter().find(|p| p.price > entry),
        Direction::Short => map.ssl.iter().find(|p| p.price < entry),
    }?;
    Some(OpposingTarget {
        direction,
        entry_price: entry,
        tp_price: pool.price,
        tp_distance_pct: (pool.price - entry).abs() / entry * 100.0,
        side: pool.side,
    })
}

/// Like [`nearest_opposing`] but a missing target is an error.
pub fn opposing_liquidity(
    map: &LiquidityMap,
    direction: Direction,
    entry: f64,
) -> Result<OpposingTarget, AnalysisError> {
    crate::error::ensure_positive("entry_price", entry)?;
    nearest_opposing(map, direction, entry).ok_or_else(|| {
        let (side, rel) = match direction {
            Direction::Long => ("BSL", "above"),
            Direction::Short => ("SSL", "below"),
        };
        AnalysisError::invalid(format!("no {side} targets found {rel} entry {entry:.2}"))
    })
}

// ─── Sweeps ───────────────────────────────────────────────────────────────────

/// Scans the newest `lookback_candles` candles (newest first) for a wick
/// beyond one of the last five swing levels that closed back inside.
///
/// Swings are computed without the final three candles so a candle cannot
/// sweep a level it created. Confirmation is always judged on the candle
/// after the sweep; for the newest candle, which has no successor, its own
/// body is used. Returns the first sweep found.
pub fn detect_sweep(candles: &[Candle], lookback_candles: usize) -> Result<Option<SweepEvent>, AnalysisError> {
    require(candles, MIN_SWEEP_CANDLES, "sweep detection")?;
    let candles = &candles[candles.len().saturating_sub(SWEEP_FETCH_CANDLES)..];
    let n = candles.len();
    let price = candles[n - 1].close;

    let reference = &candles[..n - SWEEP_SWING_EXCLUDE];
    let highs: Vec<f64> = reference.iter().map(|c| c.high).collect();
    let lows: Vec<f64> = reference.iter().map(|c| c.low).collect();
    let swings = find_swings(&highs, &lows, SWING_LOOKBACK);

    let recent_highs: Vec<f64> = newest_levels(&swings.highs.iter().map(|s| s.price).collect::<Vec<_>>());
    let recent_lows: Vec<f64> = newest_levels(&swings.lows.iter().map(|s| s.price).collect::<Vec<_>>());

    for offset in 0..lookback_candles {
        if offset + 1 >= n {
            break;
        }
        let idx = n - 1 - offset;
        let candle = &candles[idx];
        let follower = candles.get(idx + 1).unwrap_or(candle);

        if let Some(&level) = recent_highs.iter().find(|&&l| candle.high > l && candle.close < l) {
            return Ok(Some(sweep_event(
                Polarity::Bearish,
                level,
                candle.high,
                offset,
                follower.is_bearish(),
                price,
            )));
        }

        if let Some(&level) = recent_lows.iter().find(|&&l| candle.low < l && candle.close > l) {
            return Ok(Some(sweep_event(
                Polarity::Bullish,
                level,
                candle.low,
                offset,
                follower.is_bullish(),
                price,
            )));
        }
    }
    Ok(None)
}

/// Last five levels, newest first.
fn newest_levels(levels: &[f64]) -> Vec<f64> {
    levels.iter().rev().take(SWEEP_LEVELS_CHECKED).copied().collect()
}

fn sweep_event(
    polarity: Polarity,
    level: f64,
    wick: f64,
    offset: usize,
    confirmed: bool,
    price: f64,
) -> SweepEvent {
    let sl_distance_pct = match polarity {
        Polarity::Bullish => (price - wick) / price * 100.0,
        Polarity::Bearish => (wick - price) / price * 100.0,
    };
    log::debug!(
        "{} sweep of {:.4} (wick {:.4}, {} candles ago, confirmed={})",
        polarity,
        level,
        wick,
        offset + 1,
        confirmed
    );
    SweepEvent {
        polarity,
        level,
        wick_extreme: wick,
        candles_ago: offset + 1,
        confirmed,
        sl_distance_pct,
    }
}

// ─── Liquidation clusters ─────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LiquidationEstimate {
    pub symbol: String,
    pub timestamp: i64,
    /// Long stops/liquidations presumed below price (SSL).
    pub long_liquidations: Vec<LiquidityPool>,
    /// Short stops/liquidations presumed above price (BSL).
    pub short_liquidations: Vec<LiquidityPool>,
}

/// Recent liquidation estimates, bounded in symbols (least recently used is
/// evicted) and in history depth per symbol.
#[derive(Clone, Debug)]
pub struct LiquidationCache {
    max_symbols: usize,
    depth: usize,
    entries: HashMap<String, VecDeque<LiquidationEstimate>>,
    recency: VecDeque<String>,
}

impl Default for LiquidationCache {
    fn default() -> Self {
        Self::new(LIQUIDATION_CACHE_SYMBOLS, LIQUIDATION_CACHE_DEPTH)
    }
}

impl LiquidationCache {
    pub fn new(max_symbols: usize, depth: usize) -> Self {
        LiquidationCache {
            max_symbols: max_symbols.max(1),
            depth: depth.max(1),
            entries: HashMap::new(),
            recency: VecDeque::new(),
        }
    }

    pub fn record(&mut self, estimate: LiquidationEstimate) {
        let symbol = estimate.symbol.clone();
        self.touch(&symbol);

        let history = self.entries.entry(symbol).or_default();
        // Same candle re-estimated: replace instead of stacking duplicates.
        if history.back().map(|e| e.timestamp) == Some(estimate.timestamp) {
            history.pop_back();
        }
        history.push_back(estimate);
        while history.len() > self.depth {
            history.pop_front();
        }

        while self.recency.len() > self.max_symbols {
            if let Some(evicted) = self.recency.pop_front() {
                log::debug!("[{}] evicted from liquidation cache", evicted);
                self.entries.remove(&evicted);
            }
        }
    }

    pub fn latest(&self, symbol: &str) -> Option<&LiquidationEstimate> {
        self.entries.get(symbol).and_then(|h| h.back())
    }

    pub fn history(&self, symbol: &str) -> impl Iterator<Item = &LiquidationEstimate> {
        self.entries.get(symbol).into_iter().flat_map(|h| h.iter())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn touch(&mut self, symbol: &str) {
        if let Some(pos) = self.recency.iter().position(|s| s == symbol) {
            self.recency.remove(pos);
        }
        self.recency.push_back(symbol.to_string());
    }
}

/// Estimates liquidation clusters from swing pools and records them in `cache`.
pub fn estimate_liquidation_levels(
    symbol: &str,
    candles: &[Candle],
    interval: Interval,
    cache: &mut LiquidationCache,
) -> Result<LiquidationEstimate, AnalysisError> {
    let map = map_liquidity(candles, interval)?;
    let estimate = LiquidationEstimate {
        symbol: symbol.to_string(),
        timestamp: candles.last().map(|c| c.timestamp).unwrap_or_default(),
        long_liquidations: map.ssl.iter().take(3).copied().collect(),
        short_liquidations: map.bsl.iter().take(3).copied().collect(),
    };
    cache.record(estimate.clone());
    Ok(estimate)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{SwingKind, SwingPoint};

    fn flat(n: usize, price: f64) -> Vec<Candle> {
        (0..n)
            .map(|i| Candle {
                timestamp: i as i64,
                open: price,
                high: price + 1.0,
                low: price - 1.0,
                close: price,
                volume: 1.0,
            })
            .collect()
    }

    fn swings(highs: &[f64], lows: &[f64]) -> Swings {
        let pt = |i: usize, p: f64, kind| SwingPoint { index: i, price: p, kind };
        Swings {
            highs: highs.iter().enumerate().map(|(i, &p)| pt(i, p, SwingKind::High)).collect(),
            lows: lows.iter().enumerate().map(|(i, &p)| pt(i, p, SwingKind::Low)).collect(),
        }
    }

    /// Strictly rising highs and lows: no swing points on their own.
    fn rising(n: usize) -> Vec<Candle> {
        (0..n)
            .map(|i| {
                let step = i as f64 * 0.001;
                Candle {
                    timestamp: i as i64,
                    open: 99.0 + step,
                    high: 100.0 + step,
                    low: 98.0 + step,
                    close: 99.0 + step,
                    volume: 1.0,
                }
            })
            .collect()
    }

    /// Rising tape with one spike up at `hi_idx` and one spike down at `lo_idx`.
    fn with_spikes(n: usize, hi_idx: usize, hi: f64, lo_idx: usize, lo: f64) -> Vec<Candle> {
        let mut candles = rising(n);
        candles[hi_idx].high = hi;
        candles[lo_idx].low = lo;
        candles
    }

    #[test]
    fn bias_labels() {
        assert_eq!(market_bias(&swings(&[10.0, 11.0], &[5.0, 6.0])), Bias::Bullish);
        assert_eq!(market_bias(&swings(&[11.0, 10.0], &[6.0, 5.0])), Bias::Bearish);
        assert_eq!(market_bias(&swings(&[10.0, 10.0], &[5.0, 6.0])), Bias::Neutral);
        assert_eq!(market_bias(&swings(&[10.0], &[5.0, 6.0])), Bias::Neutral);
    }

    #[test]
    fn pools_split_around_price_and_sort_by_distance() {
        let mut candles = rising(60);
        candles[10].high = 110.0;
        candles[30].high = 104.0;
        candles[20].low = 90.0;
        candles[40].low = 97.0;
        let map = map_liquidity(&candles, Interval::M15).unwrap();
        let bsl: Vec<f64> = map.bsl.iter().map(|p| p.price).collect();
        let ssl: Vec<f64> = map.ssl.iter().map(|p| p.price).collect();
        assert_eq!(bsl, vec![104.0, 110.0]);
        assert_eq!(ssl, vec![97.0, 90.0]);
        let price = 99.0 + 59.0 * 0.001;
        assert_eq!(map.price, price);
        assert!((map.nearest_bsl().unwrap().distance_pct - (104.0 - price) / price * 100.0).abs() < 1e-9);
        assert!(map.bsl.iter().all(|p| p.side == PoolSide::BSL));
    }

    #[test]
    fn pools_need_the_timeframe_window() {
        let err = map_liquidity(&flat(60, 100.0), Interval::H1).unwrap_err();
        assert!(matches!(err, AnalysisError::InsufficientData { needed: 100, got: 60, .. }));
    }

    #[test]
    fn bearish_sweep_requires_close_back_below() {
        let mut candles = with_spikes(30, 10, 105.0, 12, 95.0);
        // Newest candle wicks above 105 and closes below, bearish body.
        let last = candles.len() - 1;
        candles[last] = Candle { timestamp: 99, open: 104.0, high: 106.0, low: 103.0, close: 103.5, volume: 1.0 };
        let sweep = detect_sweep(&candles, 5).unwrap().unwrap();
        assert_eq!(sweep.polarity, Polarity::Bearish);
        assert_eq!(sweep.level, 105.0);
        assert_eq!(sweep.wick_extreme, 106.0);
        assert_eq!(sweep.candles_ago, 1);
        assert!(sweep.confirmed);

        // Close above the level is a breakout, not a sweep.
        candles[last].close = 105.5;
        candles[last].open = 104.0;
        assert!(detect_sweep(&candles, 5).unwrap().is_none());
    }

    #[test]
    fn older_sweep_is_confirmed_by_following_candle() {
        let mut candles = with_spikes(30, 10, 105.0, 12, 95.0);
        let n = candles.len();
        // Sweep two candles ago; the candle after it is bullish.
        candles[n - 2] = Candle { timestamp: 98, open: 96.0, high: 97.0, low: 94.0, close: 96.5, volume: 1.0 };
        candles[n - 1] = Candle { timestamp: 99, open: 96.5, high: 98.0, low: 96.0, close: 97.5, volume: 1.0 };
        let sweep = detect_sweep(&candles, 5).unwrap().unwrap();
        assert_eq!(sweep.polarity, Polarity::Bullish);
        assert_eq!(sweep.level, 95.0);
        assert_eq!(sweep.candles_ago, 2);
        assert!(sweep.confirmed);
        assert!((sweep.sl_distance_pct - (97.5 - 94.0) / 97.5 * 100.0).abs() < 1e-9);

        // Bearish follower leaves it unconfirmed.
        candles[n - 1].close = 96.0;
        let sweep = detect_sweep(&candles, 5).unwrap().unwrap();
        assert!(!sweep.confirmed);
    }

    #[test]
    fn sweep_needs_twenty_candles() {
        let err = detect_sweep(&flat(19, 100.0), 5).unwrap_err();
        assert!(matches!(err, AnalysisError::InsufficientData { needed: 20, .. }));
    }

    #[test]
    fn opposing_target_respects_entry() {
        let map = LiquidityMap {
            interval: Interval::H1,
            price: 100.0,
            bias: Bias::Neutral,
            bsl: vec![
                LiquidityPool { price: 101.0, side: PoolSide::BSL, distance_pct: 1.0 },
                LiquidityPool { price: 103.0, side: PoolSide::BSL, distance_pct: 3.0 },
            ],
            ssl: vec![],
        };
        let t = opposing_liquidity(&map, Direction::Long, 102.0).unwrap();
        assert_eq!(t.tp_price, 103.0);
        assert!(opposing_liquidity(&map, Direction::Short, 100.0).is_err());
    }

    #[test]
    fn cache_is_bounded() {
        let mut cache = LiquidationCache::new(2, 2);
        let est = |sym: &str, ts: i64| LiquidationEstimate {
            symbol: sym.into(),
            timestamp: ts,
            long_liquidations: vec![],
            short_liquidations: vec![],
        };
        cache.record(est("BTCUSDT", 1));
        cache.record(est("BTCUSDT", 2));
        cache.record(est("BTCUSDT", 3));
        assert_eq!(cache.history("BTCUSDT").count(), 2);
        cache.record(est("BTCUSDT", 3));
        assert_eq!(cache.history("BTCUSDT").count(), 2);

        cache.record(est("ETHUSDT", 1));
        cache.record(est("BTCUSDT", 4)); // BTC becomes most recent
        cache.record(est("SOLUSDT", 1)); // evicts ETH
        assert_eq!(cache.len(), 2);
        assert!(cache.latest("ETHUSDT").is_none());
        assert_eq!(cache.latest("BTCUSDT").map(|e| e.timestamp), Some(4));
    }

    #[test]
    fn liquidation_levels_are_recorded() {
        let mut candles = rising(60);
        candles[20].high = 103.0;
        candles[25].low = 96.0;
        let mut cache = LiquidationCache::default();
        let est = estimate_liquidation_levels("BTCUSDT", &candles, Interval::M15, &mut cache).unwrap();
        assert_eq!(est.short_liquidations[0].price, 103.0);
        assert_eq!(est.long_liquidations[0].price, 96.0);
        assert_eq!(cache.latest("BTCUSDT"), Some(&est));
    }
}
