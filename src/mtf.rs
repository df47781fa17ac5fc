//! Higher-timeframe bias + mid-timeframe sweep + lower-timeframe price.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::candles::CandleSource;
use crate::config::{
    pool_window, StrategyConfig, FALLBACK_TP_PCT, POOL_FETCH_PADDING, SWEEP_FETCH_CANDLES,
    SWEEP_SL_BUFFER,
};
use crate::error::{ensure_positive, AnalysisError};
use crate::liquidity::{detect_sweep, map_liquidity, nearest_opposing, LiquidityMap};
use crate::types::{Bias, Direction, SweepEvent, TradeSetup};

/// Candles pulled from the entry timeframe; only the last close is used.
const ENTRY_FETCH_CANDLES: usize = 5;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NoTradeReason {
    NoSweep,
    SweepNotConfirmed,
    SweepAgainstBias,
    /// The buffered stop ended up at or beyond the entry price.
    StopOnWrongSide,
}

impl fmt::Display for NoTradeReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NoTradeReason::NoSweep => "no liquidity sweep detected",
            NoTradeReason::SweepNotConfirmed => "sweep detected but not confirmed",
            NoTradeReason::SweepAgainstBias => "sweep direction conflicts with higher-timeframe bias",
            NoTradeReason::StopOnWrongSide => "stop beyond sweep wick is not on the loss side of entry",
        };
        f.write_str(s)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "signal", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MtfOutcome {
    Setup(TradeSetup),
    NoTrade { reason: NoTradeReason },
}

impl MtfOutcome {
    pub fn setup(&self) -> Option<&TradeSetup> {
        match self {
            MtfOutcome::Setup(s) => Some(s),
            MtfOutcome::NoTrade { .. } => None,
        }
    }
}

/// Everything one multi-timeframe pass looked at, plus the outcome.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MtfScan {
    pub symbol: String,
    pub bias: Bias,
    pub htf: LiquidityMap,
    pub sweep: Option<SweepEvent>,
    pub current_price: f64,
    pub outcome: MtfOutcome,
}

/// Builds a setup from already computed pieces.
///
/// Setup conditions: a confirmed sweep whose direction the bias permits.
/// Stop sits 0.2 % beyond the sweep wick; target is the nearest opposing
/// higher-timeframe pool beyond entry, or a flat 2 % when none exists.
pub fn compose(
    htf: &LiquidityMap,
    sweep: Option<&SweepEvent>,
    current_price: f64,
) -> Result<MtfOutcome, AnalysisError> {
    ensure_positive("current_price", current_price)?;

    let Some(sweep) = sweep else {
        return Ok(MtfOutcome::NoTrade { reason: NoTradeReason::NoSweep });
    };
    if !sweep.confirmed {
        return Ok(MtfOutcome::NoTrade { reason: NoTradeReason::SweepNotConfirmed });
    }
    let direction = sweep.polarity.direction();
    if !htf.bias.permits(direction) {
        return Ok(MtfOutcome::NoTrade { reason: NoTradeReason::SweepAgainstBias });
    }

    let entry = current_price;
    let stop_loss = match direction {
        Direction::Long => sweep.wick_extreme * (1.0 - SWEEP_SL_BUFFER),
        Direction::Short => sweep.wick_extreme * (1.0 + SWEEP_SL_BUFFER),
    };
    let sl_pct = (entry - stop_loss) * direction.sign() / entry * 100.0;
    if sl_pct <= 0.0 {
        return Ok(MtfOutcome::NoTrade { reason: NoTradeReason::StopOnWrongSide });
    }

    let (take_profit, tp_pct) = match nearest_opposing(htf, direction, entry) {
        Some(target) => (target.tp_price, target.tp_distance_pct),
        None => (
            entry * (1.0 + direction.sign() * FALLBACK_TP_PCT / 100.0),
            FALLBACK_TP_PCT,
        ),
    };

    Ok(MtfOutcome::Setup(TradeSetup {
        direction,
        entry,
        stop_loss,
        take_profit,
        sl_pct,
        tp_pct,
        rr_ratio: tp_pct / sl_pct,
        sweep_level: sweep.level,
    }))
}

/// Fetches the three timeframes for `symbol` and composes a setup.
pub fn scan_mtf<S: CandleSource + ?Sized>(
    source: &S,
    symbol: &str,
    cfg: &StrategyConfig,
) -> Result<MtfScan, AnalysisError> {
    let htf_candles = source.fetch_candles(
        symbol,
        cfg.bias_interval,
        pool_window(cfg.bias_interval) + POOL_FETCH_PADDING,
    )?;
    let htf = map_liquidity(&htf_candles, cfg.bias_interval)?;

    let mid = source.fetch_candles(symbol, cfg.sweep_interval, SWEEP_FETCH_CANDLES)?;
    let sweep = detect_sweep(&mid, cfg.sweep_lookback_candles)?;

    let ltf = source.fetch_candles(symbol, cfg.entry_interval, ENTRY_FETCH_CANDLES)?;
    let current_price = ltf
        .last()
        .map(|c| c.close)
        .ok_or_else(|| AnalysisError::insufficient("entry price", 1, 0))?;

    let outcome = compose(&htf, sweep.as_ref(), current_price)?;
    match &outcome {
        MtfOutcome::Setup(s) => log::info!(
            "[{}] MTF setup {} entry={:.4} sl={:.4} tp={:.4} rr={:.2}",
            symbol,
            s.direction,
            s.entry,
            s.stop_loss,
            s.take_profit,
            s.rr_ratio
        ),
        MtfOutcome::NoTrade { reason } => log::debug!("[{}] MTF no trade: {}", symbol, reason),
    }

    Ok(MtfScan {
        symbol: symbol.to_string(),
        bias: htf.bias,
        htf,
        sweep,
        current_price,
        outcome,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Interval, LiquidityPool, PoolSide, Polarity};

    fn map(bias: Bias, bsl: &[f64], ssl: &[f64], price: f64) -> LiquidityMap {
        let pool = |p: f64, side| LiquidityPool {
            price: p,
            side,
            distance_pct: (p - price).abs() / price * 100.0,
        };
        LiquidityMap {
            interval: Interval::H1,
            price,
            bias,
            bsl: bsl.iter().map(|&p| pool(p, PoolSide::BSL)).collect(),
            ssl: ssl.iter().map(|&p| pool(p, PoolSide::SSL)).collect(),
        }
    }

    fn sweep(polarity: Polarity, level: f64, wick: f64, confirmed: bool) -> SweepEvent {
        SweepEvent { polarity, level, wick_extreme: wick, candles_ago: 1, confirmed, sl_distance_pct: 0.0 }
    }

    #[test]
    fn bullish_sweep_under_bullish_bias() {
        let htf = map(Bias::Bullish, &[96200.0], &[], 95000.0);
        let sw = sweep(Polarity::Bullish, 94800.0, 94700.0, true);
        let outcome = compose(&htf, Some(&sw), 95200.0).unwrap();
        let s = outcome.setup().unwrap();
        assert_eq!(s.direction, Direction::Long);
        assert!((s.stop_loss - 94510.6).abs() < 1e-6);
        assert_eq!(s.take_profit, 96200.0);
        assert!((s.sl_pct - 0.7242).abs() < 1e-3);
        assert!((s.tp_pct - 1.0504).abs() < 1e-3);
        assert!((s.rr_ratio - 1.45).abs() < 1e-2);
        assert_eq!(s.sweep_level, 94800.0);
    }

    #[test]
    fn missing_pool_falls_back_to_two_percent() {
        let htf = map(Bias::Neutral, &[], &[], 100.0);
        let sw = sweep(Polarity::Bearish, 101.0, 101.5, true);
        let s = compose(&htf, Some(&sw), 100.0).unwrap().setup().cloned().unwrap();
        assert_eq!(s.direction, Direction::Short);
        assert!((s.take_profit - 98.0).abs() < 1e-9);
        assert_eq!(s.tp_pct, 2.0);
        assert!((s.stop_loss - 101.5 * 1.002).abs() < 1e-9);
    }

    #[test]
    fn no_trade_reasons() {
        let htf = map(Bias::Bearish, &[], &[], 100.0);
        let no = |o: MtfOutcome| match o {
            MtfOutcome::NoTrade { reason } => reason,
            MtfOutcome::Setup(_) => panic!("unexpected setup"),
        };
        assert_eq!(no(compose(&htf, None, 100.0).unwrap()), NoTradeReason::NoSweep);

        let unconfirmed = sweep(Polarity::Bearish, 101.0, 101.5, false);
        assert_eq!(
            no(compose(&htf, Some(&unconfirmed), 100.0).unwrap()),
            NoTradeReason::SweepNotConfirmed
        );

        let against = sweep(Polarity::Bullish, 99.0, 98.5, true);
        assert_eq!(
            no(compose(&htf, Some(&against), 100.0).unwrap()),
            NoTradeReason::SweepAgainstBias
        );

        // Price already back below the wick of a bullish sweep.
        let neutral = map(Bias::Neutral, &[], &[], 100.0);
        let stale = sweep(Polarity::Bullish, 99.0, 98.5, true);
        assert_eq!(
            no(compose(&neutral, Some(&stale), 98.0).unwrap()),
            NoTradeReason::StopOnWrongSide
        );
    }

    #[test]
    fn rejects_non_positive_price() {
        let htf = map(Bias::Neutral, &[], &[], 100.0);
        assert!(compose(&htf, None, 0.0).is_err());
    }
}
