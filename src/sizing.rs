//! Risk-bounded position sizing and leverage selection.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::config::{
    instrument, DYNAMIC_LEVERAGE_HEADROOM, DYNAMIC_LEVERAGE_RANGE, MAX_MARGIN_FRACTION,
    MAX_SL_FRACTION, MIN_MARGIN_USD, MIN_QTY_MULTIPLIER, MIN_SL_FRACTION, SELECTOR_LEVERAGE_RANGE,
};
use crate::error::{ensure_positive, AnalysisError};
use crate::types::Direction;

// ─── Volatility regime ────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Volatility {
    Low,
    #[default]
    Normal,
    High,
}

impl Volatility {
    pub fn factor(self) -> f64 {
        match self {
            Volatility::Low => 1.2,
            Volatility::Normal => 1.0,
            Volatility::High => 0.7,
        }
    }
}

impl fmt::Display for Volatility {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Volatility::Low => f.write_str("low"),
            Volatility::Normal => f.write_str("normal"),
            Volatility::High => f.write_str("high"),
        }
    }
}

impl FromStr for Volatility {
    type Err = AnalysisError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Ok(Volatility::Low),
            "normal" => Ok(Volatility::Normal),
            "high" => Ok(Volatility::High),
            other => Err(AnalysisError::invalid(format!(
                "unknown volatility '{other}' (use low, normal or high)"
            ))),
        }
    }
}

// ─── Results ──────────────────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "code", rename_all = "snake_case")]
pub enum SizingWarning {
    MarginBelowMinimum { margin: f64 },
    MarginAboveHalfBalance { margin: f64, balance: f64 },
    StopTooWide { sl_pct: f64 },
    StopTooTight { sl_pct: f64 },
    /// Quantity raised to the instrument floor; realised risk differs.
    QuantityRaisedToFloor { min_quantity: f64, actual_risk_pct: f64 },
}

impl fmt::Display for SizingWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SizingWarning::MarginBelowMinimum { margin } => {
                write!(f, "margin ${margin:.2} is below the ${MIN_MARGIN_USD:.0} minimum")
            }
            SizingWarning::MarginAboveHalfBalance { margin, balance } => {
                write!(f, "margin ${margin:.2} exceeds 50% of balance ${balance:.2}")
            }
            SizingWarning::StopTooWide { sl_pct } => write!(f, "stop distance {sl_pct:.2}% is very wide"),
            SizingWarning::StopTooTight { sl_pct } => write!(f, "stop distance {sl_pct:.2}% is very tight"),
            SizingWarning::QuantityRaisedToFloor { min_quantity, actual_risk_pct } => write!(
                f,
                "quantity raised to minimum {min_quantity}; actual risk {actual_risk_pct:.2}%"
            ),
        }
    }
}

/// Reference targets at fixed 1 % and 2 % moves.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReferenceTargets {
    pub tp1: f64,
    pub tp2: f64,
    pub profit_at_1pct: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PositionSizing {
    pub direction: Direction,
    pub entry_price: f64,
    pub stop_loss: f64,
    pub take_profit: Option<f64>,
    pub leverage: u32,
    pub risk_percent: f64,
    pub risk_amount: f64,
    pub sl_pct: f64,
    pub tp_pct: Option<f64>,
    pub rr_ratio: Option<f64>,
    pub notional: f64,
    pub quantity: f64,
    pub margin_required: f64,
    /// Loss if the stop is hit with `quantity` as sized.
    pub actual_risk_amount: f64,
    pub actual_risk_pct: f64,
    pub reference_targets: Option<ReferenceTargets>,
    pub warnings: Vec<SizingWarning>,
}

// ─── Shared validation ────────────────────────────────────────────────────────

struct Risk {
    direction: Direction,
    risk_amount: f64,
    sl_frac: f64,
}

fn validate(balance: f64, entry: f64, stop: f64, risk_percent: f64) -> Result<Risk, AnalysisError> {
    ensure_positive("balance", balance)?;
    ensure_positive("entry_price", entry)?;
    ensure_positive("stop_loss", stop)?;
    if !(risk_percent > 0.0 && risk_percent <= 100.0) {
        return Err(AnalysisError::invalid(format!(
            "risk_percent must be in (0, 100], got {risk_percent}"
        )));
    }
    let direction = if entry > stop {
        Direction::Long
    } else if entry < stop {
        Direction::Short
    } else {
        return Err(AnalysisError::invalid("entry_price equals stop_loss; direction is undefined"));
    };
    Ok(Risk {
        direction,
        risk_amount: balance * risk_percent / 100.0,
        sl_frac: (entry - stop).abs() / entry,
    })
}

fn margin_and_stop_warnings(margin: f64, balance: f64, sl_frac: f64) -> Vec<SizingWarning> {
    let mut warnings = Vec::new();
    if margin < MIN_MARGIN_USD {
        warnings.push(SizingWarning::MarginBelowMinimum { margin });
    }
    if margin > balance * MAX_MARGIN_FRACTION {
        warnings.push(SizingWarning::MarginAboveHalfBalance { margin, balance });
    }
    if sl_frac > MAX_SL_FRACTION {
        warnings.push(SizingWarning::StopTooWide { sl_pct: sl_frac * 100.0 });
    }
    if sl_frac < MIN_SL_FRACTION {
        warnings.push(SizingWarning::StopTooTight { sl_pct: sl_frac * 100.0 });
    }
    warnings
}

// ─── Fixed risk ───────────────────────────────────────────────────────────────

/// Fixed-risk sizing at an explicit leverage. Direction follows from entry vs stop.
///
/// A quantity below twice the instrument minimum is raised to that floor and
/// margin and realised risk are recomputed from it.
pub fn calculate_position(
    symbol: &str,
    balance: f64,
    entry_price: f64,
    stop_loss: f64,
    risk_percent: f64,
    leverage: u32,
) -> Result<PositionSizing, AnalysisError> {
    let Risk { direction, risk_amount, sl_frac } =
        validate(balance, entry_price, stop_loss, risk_percent)?;
    if leverage == 0 {
        return Err(AnalysisError::invalid("leverage must be at least 1"));
    }

    let lev = leverage as f64;
    let mut margin = risk_amount / (sl_frac * lev);
    let mut notional = margin * lev;
    let mut quantity = notional / entry_price;
    if !quantity.is_finite() {
        return Err(AnalysisError::Computation(format!("non-finite quantity for stop distance {sl_frac}")));
    }

    let min_quantity = quantity_floor(symbol);
    let raised = quantity < min_quantity;
    let mut actual_risk_pct = risk_percent;
    if raised {
        quantity = min_quantity;
        notional = quantity * entry_price;
        margin = notional / lev;
        actual_risk_pct = quantity * (entry_price - stop_loss).abs() / balance * 100.0;
        log::warn!(
            "[{}] fixed-risk quantity below floor, raised to {} (risk {:.2}%)",
            symbol,
            min_quantity,
            actual_risk_pct
        );
    }

    let sign = direction.sign();
    let reference_targets = ReferenceTargets {
        tp1: entry_price * (1.0 + sign * 0.01),
        tp2: entry_price * (1.0 + sign * 0.02),
        profit_at_1pct: notional * 0.01,
    };

    let mut warnings = margin_and_stop_warnings(margin, balance, sl_frac);
    if raised {
        warnings.push(SizingWarning::QuantityRaisedToFloor { min_quantity, actual_risk_pct });
    }

    Ok(PositionSizing {
        direction,
        entry_price,
        stop_loss,
        take_profit: None,
        leverage,
        risk_percent,
        risk_amount,
        sl_pct: sl_frac * 100.0,
        tp_pct: None,
        rr_ratio: None,
        notional,
        quantity,
        margin_required: margin,
        actual_risk_amount: quantity * (entry_price - stop_loss).abs(),
        actual_risk_pct,
        reference_targets: Some(reference_targets),
        warnings,
    })
}

/// Smallest quantity that still leaves an executable half after a 50 % close.
pub fn quantity_floor(symbol: &str) -> f64 {
    let inst = instrument(symbol);
    let steps = (inst.min_qty * MIN_QTY_MULTIPLIER / inst.qty_step - 1e-9).ceil();
    steps * inst.qty_step
}

// ─── Dynamic ──────────────────────────────────────────────────────────────────

/// Sizing from a full entry/stop/target triple with leverage solved for.
///
/// Quantity is rounded down to the instrument's step, then raised to twice
/// its minimum if needed so a 50 % partial close stays executable. Realised
/// risk is recomputed from the final quantity.
pub fn calculate_position_dynamic(
    symbol: &str,
    balance: f64,
    entry_price: f64,
    stop_loss: f64,
    take_profit: f64,
    risk_percent: f64,
) -> Result<PositionSizing, AnalysisError> {
    let Risk { direction, risk_amount, sl_frac } =
        validate(balance, entry_price, stop_loss, risk_percent)?;
    ensure_positive("take_profit", take_profit)?;
    if (take_profit - entry_price) * direction.sign() <= 0.0 {
        return Err(AnalysisError::invalid(format!(
            "take_profit {take_profit} is on the wrong side of entry {entry_price} for {direction}"
        )));
    }

    let tp_frac = (take_profit - entry_price).abs() / entry_price;
    let target_notional = risk_amount / sl_frac;

    let (lo, hi) = DYNAMIC_LEVERAGE_RANGE;
    let needed = (target_notional / (balance * MAX_MARGIN_FRACTION)).ceil();
    let leverage = (needed.min(hi as f64) as u32)
        .saturating_add(DYNAMIC_LEVERAGE_HEADROOM)
        .clamp(lo, hi);

    let inst = instrument(symbol);
    let raw_qty = target_notional / entry_price;
    let mut quantity = (raw_qty / inst.qty_step + 1e-9).floor() * inst.qty_step;

    let min_quantity = quantity_floor(symbol);
    let raised = quantity < min_quantity;
    if raised {
        quantity = min_quantity;
    }

    let notional = quantity * entry_price;
    let margin = notional / leverage as f64;
    let actual_risk_amount = quantity * (entry_price - stop_loss).abs();
    let actual_risk_pct = actual_risk_amount / balance * 100.0;

    let mut warnings = margin_and_stop_warnings(margin, balance, sl_frac);
    if raised {
        log::warn!(
            "[{}] quantity {:.6} below floor, raised to {} (risk {:.2}%)",
            symbol,
            raw_qty,
            min_quantity,
            actual_risk_pct
        );
        warnings.push(SizingWarning::QuantityRaisedToFloor { min_quantity, actual_risk_pct });
    }

    Ok(PositionSizing {
        direction,
        entry_price,
        stop_loss,
        take_profit: Some(take_profit),
        leverage,
        risk_percent,
        risk_amount,
        sl_pct: sl_frac * 100.0,
        tp_pct: Some(tp_frac * 100.0),
        rr_ratio: Some(tp_frac / sl_frac),
        notional,
        quantity,
        margin_required: margin,
        actual_risk_amount,
        actual_risk_pct,
        reference_targets: None,
        warnings,
    })
}

// ─── Leverage selector ────────────────────────────────────────────────────────

fn base_leverage(sl_pct: f64) -> u32 {
    match sl_pct {
        x if x <= 0.5 => 30,
        x if x <= 1.0 => 25,
        x if x <= 1.5 => 20,
        x if x <= 2.0 => 15,
        _ => 10,
    }
}

/// Leverage for a stop distance (in percent) under a volatility regime,
/// always within [10, 30].
pub fn select_leverage(sl_pct: f64, volatility: Volatility) -> Result<u32, AnalysisError> {
    ensure_positive("sl_distance_pct", sl_pct)?;
    let (lo, hi) = SELECTOR_LEVERAGE_RANGE;
    let scaled = (base_leverage(sl_pct) as f64 * volatility.factor()) as u32;
    Ok(scaled.clamp(lo, hi))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_risk_reference_example() {
        let s = calculate_position("BTCUSDT", 100.0, 95000.0, 94050.0, 5.0, 20).unwrap();
        assert_eq!(s.direction, Direction::Long);
        assert_eq!(s.risk_amount, 5.0);
        assert!((s.sl_pct - 1.0).abs() < 1e-9);
        assert!((s.margin_required - 25.0).abs() < 1e-9);
        assert!((s.notional - 500.0).abs() < 1e-9);
        assert!((s.quantity - 0.005263).abs() < 1e-6);
        assert!((s.quantity * s.entry_price - s.notional).abs() < 1e-9);
        assert!(s.warnings.is_empty());
        let t = s.reference_targets.unwrap();
        assert!((t.tp1 - 95950.0).abs() < 1e-6);
        assert!((t.profit_at_1pct - 5.0).abs() < 1e-9);
    }

    #[test]
    fn fixed_risk_short_and_warnings() {
        // 10 % stop on a short: wide stop, tiny margin.
        let s = calculate_position("BTCUSDT", 20.0, 100.0, 110.0, 5.0, 10).unwrap();
        assert_eq!(s.direction, Direction::Short);
        assert!(s.warnings.iter().any(|w| matches!(w, SizingWarning::StopTooWide { .. })));
        assert!(s.warnings.iter().any(|w| matches!(w, SizingWarning::MarginBelowMinimum { .. })));

        // 0.1 % stop: tight, margin far above half the balance.
        let s = calculate_position("BTCUSDT", 100.0, 100.0, 99.9, 10.0, 10).unwrap();
        assert!(s.warnings.iter().any(|w| matches!(w, SizingWarning::StopTooTight { .. })));
        assert!(s.warnings.iter().any(|w| matches!(w, SizingWarning::MarginAboveHalfBalance { .. })));
    }

    #[test]
    fn fixed_risk_rejects_bad_input() {
        assert!(matches!(
            calculate_position("BTCUSDT", 100.0, 100.0, 100.0, 5.0, 10),
            Err(AnalysisError::InvalidInput(_))
        ));
        assert!(calculate_position("BTCUSDT", 0.0, 100.0, 99.0, 5.0, 10).is_err());
        assert!(calculate_position("BTCUSDT", 100.0, -1.0, 99.0, 5.0, 10).is_err());
        assert!(calculate_position("BTCUSDT", 100.0, 100.0, 99.0, 5.0, 0).is_err());
    }

    #[test]
    fn fixed_risk_quantity_floor() {
        // 0.5 % of $100 over a 1 % stop is 0.00053 BTC, below 2 × 0.001.
        let s = calculate_position("BTCUSDT", 100.0, 95000.0, 94050.0, 0.5, 10).unwrap();
        assert_eq!(s.quantity, 0.002);
        assert!((s.notional - 190.0).abs() < 1e-9);
        assert!((s.margin_required - 19.0).abs() < 1e-9);
        assert!((s.actual_risk_amount - 1.9).abs() < 1e-9);
        assert!((s.actual_risk_pct - 1.9).abs() < 1e-9);
        assert!((s.reference_targets.unwrap().profit_at_1pct - 1.9).abs() < 1e-9);
        assert!(s
            .warnings
            .iter()
            .any(|w| matches!(w, SizingWarning::QuantityRaisedToFloor { min_quantity, .. } if *min_quantity == 0.002)));
    }

    #[test]
    fn quantity_floor_follows_step() {
        assert_eq!(quantity_floor("BTCUSDT"), 0.002);
        assert_eq!(quantity_floor("XRPUSDT"), 20.0);
        assert!((quantity_floor("SOLUSDT") - 0.2).abs() < 1e-12);
    }

    #[test]
    fn dynamic_solves_leverage() {
        // risk $10, 1 % stop → $1000 notional; ceil(1000 / 500) + 5 = 7 → clamped to 10.
        let s = calculate_position_dynamic("ETHUSDT", 1000.0, 2000.0, 1980.0, 2040.0, 1.0).unwrap();
        assert_eq!(s.leverage, 10);
        assert!((s.quantity - 0.5).abs() < 1e-9);
        assert!((s.rr_ratio.unwrap() - 2.0).abs() < 1e-9);
        assert!((s.margin_required - 100.0).abs() < 1e-9);
        assert!(s.warnings.is_empty());

        // $50 risk, 0.5 % stop → $10 000 notional on $100: ceil(200) + 5 → 50.
        let s = calculate_position_dynamic("BTCUSDT", 100.0, 100000.0, 99500.0, 101000.0, 50.0).unwrap();
        assert_eq!(s.leverage, 50);
    }

    #[test]
    fn dynamic_quantity_floor() {
        // Raw quantity 0.00052 BTC is below 2 × 0.001.
        let s = calculate_position_dynamic("BTCUSDT", 100.0, 95000.0, 94050.0, 96900.0, 0.5).unwrap();
        assert_eq!(s.quantity, 0.002);
        assert!((s.actual_risk_amount - 1.9).abs() < 1e-9);
        assert!((s.actual_risk_pct - 1.9).abs() < 1e-9);
        assert!(s
            .warnings
            .iter()
            .any(|w| matches!(w, SizingWarning::QuantityRaisedToFloor { .. })));
    }

    #[test]
    fn dynamic_rejects_target_on_wrong_side() {
        let err = calculate_position_dynamic("BTCUSDT", 100.0, 100.0, 99.0, 98.0, 5.0).unwrap_err();
        assert!(matches!(err, AnalysisError::InvalidInput(_)));
    }

    #[test]
    fn leverage_breakpoints() {
        let lev = |sl| select_leverage(sl, Volatility::Normal).unwrap();
        assert_eq!(lev(0.5), 30);
        assert_eq!(lev(1.0), 25);
        assert_eq!(lev(1.5), 20);
        assert_eq!(lev(2.0), 15);
        assert_eq!(lev(2.01), 10);
    }

    #[test]
    fn leverage_volatility_and_clamp() {
        assert_eq!(select_leverage(0.3, Volatility::Low).unwrap(), 30);
        assert_eq!(select_leverage(1.0, Volatility::High).unwrap(), 17);
        assert_eq!(select_leverage(3.0, Volatility::High).unwrap(), 10);
        assert!(select_leverage(0.0, Volatility::Normal).is_err());
        assert_eq!("HIGH".parse::<Volatility>().unwrap(), Volatility::High);
        assert!("extreme".parse::<Volatility>().is_err());
    }
}
