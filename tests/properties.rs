//! Property tests for the analysis invariants.
//!
//! 1. Flat EMA, saturated RSI on monotone closes, non-negative ATR
//! 2. Swing detection is deterministic and never classifies the edges
//! 3. The score is bounded and monotone in its evidence
//! 4. Leverage stays inside its ranges
//! 5. Dynamic sizing never goes below twice the instrument minimum

use proptest::prelude::*;
use smc_trader::config::instrument;
use smc_trader::indicators::{atr, ema, latest, rsi};
use smc_trader::position_manager::get_trail_sl;
use smc_trader::signal::{score, Evidence};
use smc_trader::sizing::{calculate_position_dynamic, select_leverage, Volatility};
use smc_trader::structure::find_swings;
use smc_trader::types::{Direction, Trend};

// ── Strategies (proptest) ────────────────────────────────────────────

fn arb_price() -> impl Strategy<Value = f64> {
    (1.0..100_000.0_f64).prop_map(|p| (p * 100.0).round() / 100.0)
}

fn arb_bars() -> impl Strategy<Value = Vec<(f64, f64)>> {
    prop::collection::vec((50.0..150.0_f64, 0.0..5.0_f64), 0..120)
        .prop_map(|v| v.into_iter().map(|(low, span)| (low + span, low)).collect())
}

fn arb_trend() -> impl Strategy<Value = Trend> {
    prop_oneof![
        Just(Trend::Uptrend),
        Just(Trend::Downtrend),
        Just(Trend::Ranging),
        Just(Trend::Undefined),
    ]
}

fn arb_volatility() -> impl Strategy<Value = Volatility> {
    prop_oneof![Just(Volatility::Low), Just(Volatility::Normal), Just(Volatility::High)]
}

fn evidence(trend: Trend, flags: [bool; 5]) -> Evidence {
    Evidence {
        trend,
        ema_confirms: flags[0],
        rsi_ok: flags[1],
        sweep_aligned: flags[2],
        zone_nearby: flags[3],
        volume_spike: flags[4],
    }
}

// ── 1. Indicators ────────────────────────────────────────────────────

proptest! {
    #[test]
    fn ema_of_flat_series_is_flat(price in arb_price(), len in 1usize..200, period in 1usize..60) {
        let closes = vec![price; len];
        let out = ema(&closes, period);
        if len < period {
            prop_assert!(out.is_empty());
        } else {
            prop_assert_eq!(out.len(), len);
            prop_assert!(out[..period - 1].iter().all(Option::is_none));
            for v in out[period - 1..].iter().flatten() {
                prop_assert!((v - price).abs() <= price * 1e-12);
            }
        }
    }

    #[test]
    fn rsi_saturates_on_monotone_series(start in arb_price(), step in 0.01..10.0_f64, len in 16usize..100) {
        let rising: Vec<f64> = (0..len).map(|i| start + step * i as f64).collect();
        let falling: Vec<f64> = rising.iter().rev().copied().collect();
        prop_assert_eq!(latest(&rsi(&rising, 14)), Some(100.0));
        prop_assert_eq!(latest(&rsi(&falling, 14)), Some(0.0));
    }

    #[test]
    fn atr_is_never_negative(bars in arb_bars()) {
        let highs: Vec<f64> = bars.iter().map(|b| b.0).collect();
        let lows: Vec<f64> = bars.iter().map(|b| b.1).collect();
        let closes: Vec<f64> = bars.iter().map(|b| (b.0 + b.1) / 2.0).collect();
        for v in atr(&highs, &lows, &closes, 14).into_iter().flatten() {
            prop_assert!(v >= 0.0);
        }
    }
}

// ── 2. Swings ────────────────────────────────────────────────────────

proptest! {
    #[test]
    fn swings_are_deterministic_and_interior(bars in arb_bars(), lookback in 1usize..5) {
        let highs: Vec<f64> = bars.iter().map(|b| b.0).collect();
        let lows: Vec<f64> = bars.iter().map(|b| b.1).collect();

        let a = find_swings(&highs, &lows, lookback);
        let b = find_swings(&highs, &lows, lookback);
        prop_assert_eq!(&a, &b);

        let n = bars.len();
        for s in a.highs.iter().chain(a.lows.iter()) {
            prop_assert!(s.index >= lookback);
            prop_assert!(s.index + lookback < n);
        }
        for w in a.highs.windows(2) {
            prop_assert!(w[0].index < w[1].index);
        }
    }
}

// ── 3. Scoring ───────────────────────────────────────────────────────

proptest! {
    #[test]
    fn score_is_bounded_and_monotone(trend in arb_trend(), flags in any::<[bool; 5]>(), flip in 0usize..5) {
        let base = evidence(trend, flags);
        let s = score(&base);
        prop_assert!(s <= 10);
        if trend.direction().is_none() {
            prop_assert_eq!(s, 0);
        } else {
            prop_assert!(s >= 2);
        }

        let mut more = flags;
        more[flip] = true;
        prop_assert!(score(&evidence(trend, more)) >= s);
    }
}

// ── 4. Leverage ──────────────────────────────────────────────────────

proptest! {
    #[test]
    fn selector_leverage_in_range(sl_pct in 0.001..50.0_f64, vol in arb_volatility()) {
        let lev = select_leverage(sl_pct, vol).unwrap();
        prop_assert!((10..=30).contains(&lev));
    }

    #[test]
    fn selector_leverage_never_rises_with_wider_stops(a in 0.001..10.0_f64, b in 0.001..10.0_f64) {
        let (tight, wide) = if a <= b { (a, b) } else { (b, a) };
        let lt = select_leverage(tight, Volatility::Normal).unwrap();
        let lw = select_leverage(wide, Volatility::Normal).unwrap();
        prop_assert!(lt >= lw);
    }
}

// ── 5. Dynamic sizing ────────────────────────────────────────────────

proptest! {
    #[test]
    fn dynamic_sizing_respects_floor_and_leverage(
        balance in 10.0..100_000.0_f64,
        entry in 1_000.0..100_000.0_f64,
        sl_frac in 0.001..0.05_f64,
        rr in 0.5..5.0_f64,
        risk in 0.5..20.0_f64,
        long in any::<bool>(),
    ) {
        let sign = if long { 1.0 } else { -1.0 };
        let stop = entry * (1.0 - sign * sl_frac);
        let tp = entry * (1.0 + sign * sl_frac * rr);

        let s = calculate_position_dynamic("BTCUSDT", balance, entry, stop, tp, risk).unwrap();
        let inst = instrument("BTCUSDT");
        prop_assert!(s.quantity >= inst.min_qty * 2.0 - 1e-12);
        prop_assert!((10..=50).contains(&s.leverage));
        prop_assert_eq!(s.direction, if long { Direction::Long } else { Direction::Short });
        prop_assert!((s.actual_risk_amount - s.quantity * (entry - stop).abs()).abs() < 1e-6);
    }
}

// ── Trailing stop ratchet ────────────────────────────────────────────

proptest! {
    #[test]
    fn trailing_stop_only_tightens(entry in arb_price(), move_pct in -0.2..0.2_f64, stop_pct in -0.1..0.1_f64) {
        let price = entry * (1.0 + move_pct);
        let long_stop = entry * (1.0 + stop_pct);
        prop_assert!(get_trail_sl(Direction::Long, entry, long_stop, price) >= long_stop);
        let short_stop = entry * (1.0 - stop_pct);
        prop_assert!(get_trail_sl(Direction::Short, entry, short_stop, price) <= short_stop);
    }
}
