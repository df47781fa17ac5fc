use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::AnalysisError;
use crate::sizing::Volatility;
use crate::types::Interval;

// ─── Public market data ───────────────────────────────────────────────────────
pub const BYBIT_REST_URL: &str = "https://api.bybit.com";

// ─── Structure & zones ────────────────────────────────────────────────────────
pub const SWING_LOOKBACK: usize = 3;
pub const MIN_ANALYSIS_CANDLES: usize = 50;
pub const ZONE_SCAN_WINDOW: usize = 50;
pub const OB_MIN_MOVE_PCT: f64 = 0.3;
pub const FVG_MIN_GAP_PCT: f64 = 0.1;
pub const MAX_ZONES_KEPT: usize = 5;
pub const ENTRY_ZONE_MAX_DISTANCE_PCT: f64 = 2.0;
pub const MAX_ENTRY_ZONES: usize = 3;

// ─── Indicators ───────────────────────────────────────────────────────────────
pub const EMA_FAST: usize = 20;
pub const EMA_SLOW: usize = 50;
pub const RSI_PERIOD: usize = 14;
pub const ATR_PERIOD: usize = 14;
pub const VOL_AVG_PERIOD: usize = 20;

// ─── Liquidity & sweeps ───────────────────────────────────────────────────────
pub const MIN_SWEEP_CANDLES: usize = 20;
pub const SWEEP_FETCH_CANDLES: usize = 60;
pub const SWEEP_LOOKBACK_CANDLES: usize = 5;
/// Trailing candles left out of the swing computation used by the sweep scan.
pub const SWEEP_SWING_EXCLUDE: usize = 3;
pub const SWEEP_LEVELS_CHECKED: usize = 5;
pub const MAX_POOLS_REPORTED: usize = 5;
/// Extra candles fetched on top of the pool window.
pub const POOL_FETCH_PADDING: usize = 10;

/// Candles analysed by the liquidity mapper for a given timeframe.
pub fn pool_window(interval: Interval) -> usize {
    match interval {
        Interval::H1 | Interval::H4 => 100,
        Interval::M5 | Interval::M15 => 50,
    }
}

// ─── Multi-timeframe setup ────────────────────────────────────────────────────
pub const SWEEP_SL_BUFFER: f64 = 0.002; // 0.2 % beyond the wick
pub const FALLBACK_TP_PCT: f64 = 2.0;

// ─── Signal scoring ───────────────────────────────────────────────────────────
pub const ENTRY_SCORE_THRESHOLD: u32 = 5;
pub const MAX_SCORE: u32 = 10;
pub const RSI_OVERBOUGHT: f64 = 70.0;
pub const RSI_OVERSOLD: f64 = 30.0;
pub const VOLUME_SPIKE_RATIO: f64 = 1.2;
/// Stop distance used when no zone is found: entry ± this many ATRs.
pub const ATR_STOP_MULT: f64 = 1.5;
/// ATR stand-in (as a fraction of price) when ATR itself is undefined.
pub const ATR_FALLBACK_FRACTION: f64 = 0.01;

// ─── Sizing ───────────────────────────────────────────────────────────────────
pub const MIN_MARGIN_USD: f64 = 5.0;
pub const MAX_MARGIN_FRACTION: f64 = 0.5;
pub const MAX_SL_FRACTION: f64 = 0.05;
pub const MIN_SL_FRACTION: f64 = 0.002;
pub const SELECTOR_LEVERAGE_RANGE: (u32, u32) = (10, 30);
pub const DYNAMIC_LEVERAGE_RANGE: (u32, u32) = (10, 50);
pub const DYNAMIC_LEVERAGE_HEADROOM: u32 = 5;
/// Sized quantity must allow a later 50 % partial close.
pub const MIN_QTY_MULTIPLIER: f64 = 2.0;

// ─── Position management ──────────────────────────────────────────────────────
pub const PARTIAL_CLOSE_RR: f64 = 1.0;
pub const PARTIAL_CLOSE_FRACTION: f64 = 0.5;
pub const TRAIL_LOCK_FRACTION: f64 = 0.5;
pub const PARTIAL_SIZE_RATIO_MIN: f64 = 0.4;
pub const PARTIAL_SIZE_RATIO_MAX: f64 = 0.6;

// ─── Liquidation cache ────────────────────────────────────────────────────────
pub const LIQUIDATION_CACHE_SYMBOLS: usize = 32;
pub const LIQUIDATION_CACHE_DEPTH: usize = 16;

/// Exchange lot constraints for one instrument.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct InstrumentSpec {
    pub min_qty: f64,
    pub qty_step: f64,
}

pub const fn spec(min_qty: f64, qty_step: f64) -> InstrumentSpec {
    InstrumentSpec { min_qty, qty_step }
}

pub fn instrument(symbol: &str) -> InstrumentSpec {
    match symbol {
        "BTCUSDT" => spec(0.001, 0.001),
        "ETHUSDT" => spec(0.01, 0.01),
        "SOLUSDT" => spec(0.1, 0.1),
        "XRPUSDT" => spec(10.0, 1.0),
        "CRVUSDT" => spec(10.0, 1.0),
        "BNBUSDT" => spec(0.01, 0.01),
        _ => spec(1.0, 1.0), // fallback
    }
}

/// Tunables of one analysis cycle. Every field has a default so a partial
/// TOML file is enough.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StrategyConfig {
    pub symbols: Vec<String>,
    pub risk_percent: f64,
    pub min_rr_ratio: f64,
    pub max_positions: usize,
    pub volatility: Volatility,
    pub bias_interval: Interval,
    pub sweep_interval: Interval,
    pub entry_interval: Interval,
    pub signal_interval: Interval,
    pub signal_candles: usize,
    pub sweep_lookback_candles: usize,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        StrategyConfig {
            symbols: ["BTCUSDT", "ETHUSDT", "SOLUSDT", "XRPUSDT", "CRVUSDT"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            risk_percent: 10.0,
            min_rr_ratio: 1.5,
            max_positions: 3,
            volatility: Volatility::Normal,
            bias_interval: Interval::H1,
            sweep_interval: Interval::M15,
            entry_interval: Interval::M5,
            signal_interval: Interval::M15,
            signal_candles: 200,
            sweep_lookback_candles: SWEEP_LOOKBACK_CANDLES,
        }
    }
}

impl StrategyConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self, AnalysisError> {
        let cfg: StrategyConfig = toml::from_str(raw)
            .map_err(|e| AnalysisError::invalid(format!("config parse error: {e}")))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn load(path: &Path) -> Result<Self, AnalysisError> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            AnalysisError::invalid(format!("cannot read config {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&raw)
    }

    pub fn validate(&self) -> Result<(), AnalysisError> {
        if !(self.risk_percent > 0.0 && self.risk_percent <= 100.0) {
            return Err(AnalysisError::invalid(format!(
                "risk_percent must be in (0, 100], got {}",
                self.risk_percent
            )));
        }
        if self.sweep_lookback_candles == 0 {
            return Err(AnalysisError::invalid("sweep_lookback_candles must be at least 1"));
        }
        if self.signal_candles < MIN_ANALYSIS_CANDLES {
            return Err(AnalysisError::invalid(format!(
                "signal_candles must be at least {MIN_ANALYSIS_CANDLES}"
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_toml_keeps_defaults() {
        let cfg = StrategyConfig::from_toml_str(
            r#"
            symbols = ["BTCUSDT"]
            risk_percent = 5.0
            volatility = "high"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.symbols, vec!["BTCUSDT".to_string()]);
        assert_eq!(cfg.risk_percent, 5.0);
        assert_eq!(cfg.volatility, Volatility::High);
        assert_eq!(cfg.max_positions, 3);
        assert_eq!(cfg.bias_interval, Interval::H1);
    }

    #[test]
    fn intervals_parse_from_bybit_codes() {
        let cfg = StrategyConfig::from_toml_str("bias_interval = \"240\"").unwrap();
        assert_eq!(cfg.bias_interval, Interval::H4);
    }

    #[test]
    fn rejects_bad_risk() {
        assert!(StrategyConfig::from_toml_str("risk_percent = 0.0").is_err());
        assert!(StrategyConfig::from_toml_str("risk_percent = 150.0").is_err());
    }

    #[test]
    fn unknown_symbol_falls_back() {
        assert_eq!(instrument("BTCUSDT").min_qty, 0.001);
        assert_eq!(instrument("DOGEUSDT"), spec(1.0, 1.0));
    }
}
