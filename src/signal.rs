//! Single-timeframe market analysis and the weighted entry score.

use serde::{Deserialize, Serialize};

use crate::candles::require;
use crate::config::{
    ATR_FALLBACK_FRACTION, ATR_PERIOD, ATR_STOP_MULT, EMA_FAST, EMA_SLOW, ENTRY_SCORE_THRESHOLD,
    MAX_SCORE, MIN_ANALYSIS_CANDLES, RSI_OVERBOUGHT, RSI_OVERSOLD, RSI_PERIOD,
    SWEEP_LOOKBACK_CANDLES, SWING_LOOKBACK, VOLUME_SPIKE_RATIO, VOL_AVG_PERIOD, ZONE_SCAN_WINDOW,
};
use crate::error::AnalysisError;
use crate::indicators::{atr, ema, latest, rsi, trailing_mean};
use crate::liquidity::detect_sweep;
use crate::structure::{classify, find_swings};
use crate::types::{
    Bias, Candle, Direction, Interval, MarketStructure, SweepEvent, SwingPoint, Trend, Zone,
};
use crate::zones::{find_entry_zones, find_fair_value_gaps, find_order_blocks, EntryZone};

// ─── Market analysis ──────────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MarketAnalysis {
    pub symbol: String,
    pub interval: Interval,
    pub price: f64,
    pub ema20: Option<f64>,
    pub ema50: Option<f64>,
    pub rsi: Option<f64>,
    pub atr: Option<f64>,
    pub atr_pct: Option<f64>,
    /// price > EMA20 > EMA50 bullish, reverse bearish.
    pub ema_trend: Bias,
    /// Last volume over the 20-candle mean; `None` when the mean is zero.
    pub volume_ratio: Option<f64>,
    pub swing_highs: Vec<SwingPoint>,
    pub swing_lows: Vec<SwingPoint>,
    pub structure: MarketStructure,
    pub order_blocks: Vec<Zone>,
    pub fvgs: Vec<Zone>,
    pub sweep: Option<SweepEvent>,
    pub entry_zones: Vec<EntryZone>,
}

pub fn analyze_market(
    symbol: &str,
    interval: Interval,
    candles: &[Candle],
) -> Result<MarketAnalysis, AnalysisError> {
    require(candles, MIN_ANALYSIS_CANDLES, "market structure")?;

    let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
    let highs: Vec<f64> = candles.iter().map(|c| c.high).collect();
    let lows: Vec<f64> = candles.iter().map(|c| c.low).collect();
    let volumes: Vec<f64> = candles.iter().map(|c| c.volume).collect();

    let price = closes[closes.len() - 1];
    if !(price.is_finite() && price > 0.0) {
        return Err(AnalysisError::Computation(format!("invalid last close {price}")));
    }

    let ema20 = latest(&ema(&closes, EMA_FAST));
    let ema50 = latest(&ema(&closes, EMA_SLOW));
    let rsi = latest(&rsi(&closes, RSI_PERIOD));
    let atr = latest(&atr(&highs, &lows, &closes, ATR_PERIOD));

    let ema_trend = match (ema20, ema50) {
        (Some(fast), Some(slow)) if price > fast && fast > slow => Bias::Bullish,
        (Some(fast), Some(slow)) if price < fast && fast < slow => Bias::Bearish,
        _ => Bias::Neutral,
    };

    let avg_volume = trailing_mean(&volumes, VOL_AVG_PERIOD);
    let volume_ratio = (avg_volume > 0.0).then(|| volumes[volumes.len() - 1] / avg_volume);

    let swings = find_swings(&highs, &lows, SWING_LOOKBACK);
    let structure = classify(&swings);
    let order_blocks = find_order_blocks(candles, ZONE_SCAN_WINDOW);
    let fvgs = find_fair_value_gaps(candles, ZONE_SCAN_WINDOW);
    let sweep = detect_sweep(candles, SWEEP_LOOKBACK_CANDLES)?;
    let entry_zones = find_entry_zones(price, structure.trend, &order_blocks, &fvgs);

    log::debug!(
        "[{}] {} trend={} ema={} obs={} fvgs={} zones={}",
        symbol,
        interval,
        structure.trend,
        ema_trend,
        order_blocks.len(),
        fvgs.len(),
        entry_zones.len()
    );

    Ok(MarketAnalysis {
        symbol: symbol.to_string(),
        interval,
        price,
        ema20,
        ema50,
        rsi,
        atr,
        atr_pct: atr.map(|a| a / price * 100.0),
        ema_trend,
        volume_ratio,
        swing_highs: swings.highs,
        swing_lows: swings.lows,
        structure,
        order_blocks,
        fvgs,
        sweep,
        entry_zones,
    })
}

// ─── Scoring ──────────────────────────────────────────────────────────────────

/// The facts the score is built from, already reduced to booleans.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Evidence {
    pub trend: Trend,
    pub ema_confirms: bool,
    pub rsi_ok: bool,
    pub sweep_aligned: bool,
    pub zone_nearby: bool,
    pub volume_spike: bool,
}

impl Evidence {
    pub fn from_analysis(a: &MarketAnalysis) -> Self {
        let trend = a.structure.trend;
        let direction = trend.direction();

        let ema_confirms = matches!(
            (direction, a.ema_trend),
            (Some(Direction::Long), Bias::Bullish) | (Some(Direction::Short), Bias::Bearish)
        );
        let rsi_ok = match (direction, a.rsi) {
            (Some(Direction::Long), Some(r)) => r < RSI_OVERBOUGHT,
            (Some(Direction::Short), Some(r)) => r > RSI_OVERSOLD,
            _ => false,
        };
        let sweep_aligned = match (direction, &a.sweep) {
            (Some(d), Some(s)) => s.confirmed && s.polarity.direction() == d,
            _ => false,
        };

        Evidence {
            trend,
            ema_confirms,
            rsi_ok,
            sweep_aligned,
            zone_nearby: !a.entry_zones.is_empty(),
            volume_spike: a.volume_ratio.is_some_and(|r| r >= VOLUME_SPIKE_RATIO),
        }
    }

    /// Labelled point contributions, in table order.
    pub fn breakdown(&self) -> Vec<(&'static str, u32)> {
        if self.trend.direction().is_none() {
            return Vec::new();
        }
        [
            ("trend", true, 2),
            ("ema_alignment", self.ema_confirms, 1),
            ("rsi_room", self.rsi_ok, 1),
            ("liquidity_sweep", self.sweep_aligned, 3),
            ("entry_zone", self.zone_nearby, 2),
            ("volume_spike", self.volume_spike, 1),
        ]
        .into_iter()
        .filter(|(_, hit, _)| *hit)
        .map(|(label, _, pts)| (label, pts))
        .collect()
    }
}

/// Additive score out of ten; zero when the trend is ranging or undefined.
pub fn score(e: &Evidence) -> u32 {
    e.breakdown().iter().map(|(_, pts)| pts).sum()
}

/// Where the stop of an entry plan came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopPolicy {
    /// Far edge of the nearest entry zone; entry at its near edge.
    NearestZone,
    /// Current price ± 1.5 ATR.
    AtrMultiple,
    /// Current price ± 1.5 × (1 % of price), used when ATR is undefined.
    PriceFraction,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NoEntryReason {
    NoClearTrend,
    ScoreBelowThreshold,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "signal", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SignalDecision {
    Entry {
        direction: Direction,
        entry_price: f64,
        stop_loss: f64,
        stop_policy: StopPolicy,
    },
    NoTrade {
        reason: NoEntryReason,
    },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EntrySignal {
    pub symbol: String,
    pub score: u32,
    pub max_score: u32,
    pub reasons: Vec<String>,
    pub evidence: Evidence,
    pub decision: SignalDecision,
}

impl EntrySignal {
    pub fn is_entry(&self) -> bool {
        matches!(self.decision, SignalDecision::Entry { .. })
    }

    pub fn direction(&self) -> Option<Direction> {
        match self.decision {
            SignalDecision::Entry { direction, .. } => Some(direction),
            SignalDecision::NoTrade { .. } => None,
        }
    }
}

pub fn check_entry_signal(a: &MarketAnalysis) -> Result<EntrySignal, AnalysisError> {
    let evidence = Evidence::from_analysis(a);
    let breakdown = evidence.breakdown();
    let total = score(&evidence);
    let reasons = breakdown.iter().map(|(label, pts)| format!("{label} +{pts}")).collect();

    let decision = match evidence.trend.direction() {
        None => SignalDecision::NoTrade { reason: NoEntryReason::NoClearTrend },
        Some(_) if total < ENTRY_SCORE_THRESHOLD => {
            SignalDecision::NoTrade { reason: NoEntryReason::ScoreBelowThreshold }
        }
        Some(direction) => entry_plan(a, direction)?,
    };

    if let SignalDecision::Entry { direction, entry_price, stop_loss, .. } = &decision {
        log::info!(
            "[{}] ENTRY {} score={}/{} entry={:.4} sl={:.4}",
            a.symbol,
            direction,
            total,
            MAX_SCORE,
            entry_price,
            stop_loss
        );
    } else {
        log::debug!("[{}] no entry, score={}/{} trend={}", a.symbol, total, MAX_SCORE, evidence.trend);
    }

    Ok(EntrySignal {
        symbol: a.symbol.clone(),
        score: total,
        max_score: MAX_SCORE,
        reasons,
        evidence,
        decision,
    })
}

fn entry_plan(a: &MarketAnalysis, direction: Direction) -> Result<SignalDecision, AnalysisError> {
    let (entry_price, stop_loss, stop_policy) = match a.entry_zones.first() {
        Some(zone) => (zone.entry, zone.stop, StopPolicy::NearestZone),
        None => {
            let (atr, policy) = match a.atr {
                Some(atr) if atr > 0.0 => (atr, StopPolicy::AtrMultiple),
                _ => (a.price * ATR_FALLBACK_FRACTION, StopPolicy::PriceFraction),
            };
            (a.price, a.price - direction.sign() * ATR_STOP_MULT * atr, policy)
        }
    };

    if !(stop_loss > 0.0 && (entry_price - stop_loss) * direction.sign() > 0.0) {
        return Err(AnalysisError::Computation(format!(
            "{} stop {stop_loss:.6} is not below/above entry {entry_price:.6}",
            direction
        )));
    }
    Ok(SignalDecision::Entry { direction, entry_price, stop_loss, stop_policy })
}
