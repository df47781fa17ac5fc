use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::AnalysisError;

/// One OHLCV bar. Sequences are always chronological (oldest first).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub timestamp: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Candle {
    pub fn is_bullish(&self) -> bool {
        self.close > self.open
    }

    pub fn is_bearish(&self) -> bool {
        self.close < self.open
    }
}

// ─── Timeframes ───────────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Interval {
    #[serde(rename = "5")]
    M5,
    #[serde(rename = "15")]
    M15,
    #[serde(rename = "60")]
    H1,
    #[serde(rename = "240")]
    H4,
}

impl Interval {
    /// Bybit kline interval code.
    pub fn code(self) -> &'static str {
        match self {
            Interval::M5 => "5",
            Interval::M15 => "15",
            Interval::H1 => "60",
            Interval::H4 => "240",
        }
    }

    pub fn minutes(self) -> i64 {
        match self {
            Interval::M5 => 5,
            Interval::M15 => 15,
            Interval::H1 => 60,
            Interval::H4 => 240,
        }
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}m", self.minutes())
    }
}

impl FromStr for Interval {
    type Err = AnalysisError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "5" | "5m" => Ok(Interval::M5),
            "15" | "15m" => Ok(Interval::M15),
            "60" | "1h" | "60m" => Ok(Interval::H1),
            "240" | "4h" | "240m" => Ok(Interval::H4),
            other => Err(AnalysisError::InvalidInput(format!(
                "unknown interval '{other}' (use 5, 15, 60 or 240)"
            ))),
        }
    }
}

// ─── Directions & labels ──────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Direction {
    Long,
    Short,
}

impl Direction {
    /// +1 for LONG, -1 for SHORT.
    pub fn sign(self) -> f64 {
        match self {
            Direction::Long => 1.0,
            Direction::Short => -1.0,
        }
    }

    pub fn opposite(self) -> Direction {
        match self {
            Direction::Long => Direction::Short,
            Direction::Short => Direction::Long,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Long => f.write_str("LONG"),
            Direction::Short => f.write_str("SHORT"),
        }
    }
}

impl FromStr for Direction {
    type Err = AnalysisError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "LONG" | "BUY" => Ok(Direction::Long),
            "SHORT" | "SELL" => Ok(Direction::Short),
            other => Err(AnalysisError::InvalidInput(format!(
                "invalid direction '{other}' (use LONG or SHORT)"
            ))),
        }
    }
}

/// Polarity of a zone or a sweep.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Polarity {
    Bullish,
    Bearish,
}

impl Polarity {
    /// Trade direction a zone/sweep of this polarity supports.
    pub fn direction(self) -> Direction {
        match self {
            Polarity::Bullish => Direction::Long,
            Polarity::Bearish => Direction::Short,
        }
    }
}

impl fmt::Display for Polarity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Polarity::Bullish => f.write_str("bullish"),
            Polarity::Bearish => f.write_str("bearish"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Bias {
    Bullish,
    Bearish,
    Neutral,
}

impl Bias {
    /// Whether a setup in `direction` is allowed under this bias.
    pub fn permits(self, direction: Direction) -> bool {
        matches!(
            (self, direction),
            (Bias::Neutral, _) | (Bias::Bullish, Direction::Long) | (Bias::Bearish, Direction::Short)
        )
    }
}

impl fmt::Display for Bias {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Bias::Bullish => f.write_str("bullish"),
            Bias::Bearish => f.write_str("bearish"),
            Bias::Neutral => f.write_str("neutral"),
        }
    }
}

// ─── Swings & structure ───────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SwingKind {
    High,
    Low,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct SwingPoint {
    pub index: usize,
    pub price: f64,
    pub kind: SwingKind,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Trend {
    Uptrend,
    Downtrend,
    Ranging,
    Undefined,
}

impl Trend {
    /// Trade direction for a defined trend; `None` for ranging/undefined.
    pub fn direction(self) -> Option<Direction> {
        match self {
            Trend::Uptrend => Some(Direction::Long),
            Trend::Downtrend => Some(Direction::Short),
            Trend::Ranging | Trend::Undefined => None,
        }
    }
}

impl fmt::Display for Trend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Trend::Uptrend => "uptrend",
            Trend::Downtrend => "downtrend",
            Trend::Ranging => "ranging",
            Trend::Undefined => "undefined",
        };
        f.write_str(s)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum StructureTag {
    HH,
    HL,
    LH,
    LL,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MarketStructure {
    pub trend: Trend,
    pub tags: Vec<StructureTag>,
    pub last_swing_high: Option<SwingPoint>,
    pub last_swing_low: Option<SwingPoint>,
}

// ─── Zones ────────────────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ZoneType {
    OrderBlock,
    FairValueGap,
}

impl fmt::Display for ZoneType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ZoneType::OrderBlock => f.write_str("order_block"),
            ZoneType::FairValueGap => f.write_str("fvg"),
        }
    }
}

/// Order block or fair value gap. `strength_pct` is the move size for an order
/// block and the gap size for an FVG, both in percent.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Zone {
    pub zone_type: ZoneType,
    pub polarity: Polarity,
    pub top: f64,
    pub bottom: f64,
    pub strength_pct: f64,
    pub source_index: usize,
}

// ─── Liquidity ────────────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PoolSide {
    /// Buy-side liquidity, resting above swing highs.
    BSL,
    /// Sell-side liquidity, resting below swing lows.
    SSL,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct LiquidityPool {
    pub price: f64,
    pub side: PoolSide,
    pub distance_pct: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SweepEvent {
    pub polarity: Polarity,
    pub level: f64,
    pub wick_extreme: f64,
    pub candles_ago: usize,
    pub confirmed: bool,
    /// Distance from the current price to the sweep wick, in percent.
    pub sl_distance_pct: f64,
}

// ─── Setups & sizing ──────────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TradeSetup {
    pub direction: Direction,
    pub entry: f64,
    pub stop_loss: f64,
    pub take_profit: f64,
    pub sl_pct: f64,
    pub tp_pct: f64,
    pub rr_ratio: f64,
    pub sweep_level: f64,
}

/// A live position as reported by the exchange side.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OpenPosition {
    pub symbol: String,
    pub size: f64,
    #[serde(default)]
    pub mark_price: Option<f64>,
}
