//! One entry point, many operations: each with typed input and typed output.
//!
//! Operations deserialize from `{"action": "...", ...}` so a caller that
//! speaks JSON can drive the whole core through [`execute_json`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::candles::{normalize_symbol, CandleSource};
use crate::config::{pool_window, StrategyConfig, POOL_FETCH_PADDING, SWEEP_FETCH_CANDLES};
use crate::error::{AnalysisError, ErrorKind};
use crate::liquidity::{
    detect_sweep, estimate_liquidation_levels, map_liquidity, opposing_liquidity, LiquidationCache,
    LiquidationEstimate, LiquidityMap, OpposingTarget,
};
use crate::mtf::{scan_mtf, MtfOutcome, MtfScan};
use crate::position_manager::{
    active_stop, check_exit, check_pnl, check_rr, check_tp, get_trail_sl, partial_close_calc,
    ManagementAction, ManagementDecision, PartialCloseCalc, PnlReport, PositionTracker, RrCheck,
    SyncReport, TpCheck,
};
use crate::range_breakout::{
    check_range_breakout, first_range_candle, scan_range_setups, BreakoutCheck, RangeLevels,
    RangeScan,
};
use crate::signal::{analyze_market, check_entry_signal, EntrySignal, MarketAnalysis, SignalDecision};
use crate::sizing::{
    calculate_position, calculate_position_dynamic, select_leverage, PositionSizing, Volatility,
};
use crate::state_store::{PositionPlan, PositionState, StateStore};
use crate::types::{Direction, Interval, OpenPosition, SweepEvent};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Operation {
    AnalyzeMarket { symbol: String, interval: Option<Interval> },
    CheckEntrySignal { symbol: String, interval: Option<Interval> },
    LiquidityPools { symbol: String, interval: Option<Interval> },
    DetectSweep { symbol: String, interval: Option<Interval>, lookback: Option<usize> },
    OpposingLiquidity { symbol: String, direction: Direction, entry_price: f64 },
    MtfScan { symbol: String },
    LiquidationLevels { symbol: String },
    CalculatePosition {
        symbol: String,
        balance: f64,
        entry_price: f64,
        stop_loss: f64,
        risk_percent: f64,
        leverage: u32,
    },
    CalculatePositionDynamic {
        symbol: String,
        balance: f64,
        entry_price: f64,
        stop_loss: f64,
        take_profit: f64,
        risk_percent: f64,
    },
    SelectLeverage { sl_distance_pct: f64, #[serde(default)] volatility: Volatility },
    RecordEntry { symbol: String, plan: PositionPlan },
    SyncPositions { positions: Vec<OpenPosition> },
    PositionStatus { symbol: String },
    MarkPartialClosed { symbol: String },
    CheckRr { symbol: String, current_price: f64 },
    CheckTp { symbol: String, current_price: f64 },
    CheckExit { symbol: String, current_price: f64 },
    TrailStop { symbol: String, current_price: f64 },
    CheckPnl { direction: Direction, entry_price: f64, current_price: f64 },
    PartialCloseCalc { quantity: f64, current_price: f64 },
    ManagePosition { symbol: String, current_price: f64 },
    RangeLevels { symbol: String },
    RangeBreakout { symbol: String, range_high: f64, range_low: f64 },
    RangeScan { symbols: Option<Vec<String>> },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum Payload {
    Analysis(Box<MarketAnalysis>),
    Signal(Box<EntrySignal>),
    Liquidity(LiquidityMap),
    Sweep(Option<SweepEvent>),
    Opposing(OpposingTarget),
    Mtf(Box<MtfScan>),
    Liquidations(LiquidationEstimate),
    Sizing(Box<PositionSizing>),
    Leverage { sl_distance_pct: f64, volatility: Volatility, leverage: u32 },
    Recorded { symbol: String },
    Sync(SyncReport),
    Status { symbol: String, state: Option<PositionState> },
    Rr(RrCheck),
    Tp(TpCheck),
    Exit(ManagementAction),
    Trail { symbol: String, previous_stop: f64, new_stop: f64 },
    Pnl(PnlReport),
    PartialClose(PartialCloseCalc),
    Managed(ManagementDecision),
    Range(RangeLevels),
    Breakout(BreakoutCheck),
    RangeScan(RangeScan),
}

impl Payload {
    /// Human-readable one-liner; the typed payload is authoritative.
    pub fn summary(&self) -> String {
        match self {
            Payload::Analysis(a) => format!(
                "{} {} @ {:.4}: trend {}, EMA {}, {} OB / {} FVG, {} entry zones",
                a.symbol,
                a.interval,
                a.price,
                a.structure.trend,
                a.ema_trend,
                a.order_blocks.len(),
                a.fvgs.len(),
                a.entry_zones.len()
            ),
            Payload::Signal(s) => match &s.decision {
                SignalDecision::Entry { direction, entry_price, stop_loss, .. } => format!(
                    "ENTRY {} {} score {}/{} entry {:.4} SL {:.4}",
                    direction, s.symbol, s.score, s.max_score, entry_price, stop_loss
                ),
                SignalDecision::NoTrade { reason } => {
                    format!("NO_TRADE {} score {}/{} ({:?})", s.symbol, s.score, s.max_score, reason)
                }
            },
            Payload::Liquidity(m) => format!(
                "{} bias {} | nearest BSL {} | nearest SSL {}",
                m.interval,
                m.bias,
                m.nearest_bsl().map_or("none".into(), |p| format!("{:.4}", p.price)),
                m.nearest_ssl().map_or("none".into(), |p| format!("{:.4}", p.price)),
            ),
            Payload::Sweep(None) => "no sweep".into(),
            Payload::Sweep(Some(s)) => format!(
                "{} sweep of {:.4} ({} candles ago, {})",
                s.polarity,
                s.level,
                s.candles_ago,
                if s.confirmed { "confirmed" } else { "unconfirmed" }
            ),
            Payload::Opposing(t) => {
                format!("{} target {:.4} ({:.2}% away)", t.direction, t.tp_price, t.tp_distance_pct)
            }
            Payload::Mtf(m) => match &m.outcome {
                MtfOutcome::Setup(s) => format!(
                    "{} {} entry {:.4} SL {:.4} TP {:.4} R:R {:.2}",
                    m.symbol, s.direction, s.entry, s.stop_loss, s.take_profit, s.rr_ratio
                ),
                MtfOutcome::NoTrade { reason } => format!("{} NO_TRADE: {}", m.symbol, reason),
            },
            Payload::Liquidations(e) => format!(
                "{}: {} long / {} short liquidation clusters",
                e.symbol,
                e.long_liquidations.len(),
                e.short_liquidations.len()
            ),
            Payload::Sizing(s) => {
                let mut out = format!(
                    "{} qty {:.6} notional ${:.2} margin ${:.2} @ {}x, risk ${:.2}",
                    s.direction, s.quantity, s.notional, s.margin_required, s.leverage, s.actual_risk_amount
                );
                for w in &s.warnings {
                    out.push_str(&format!(" | {w}"));
                }
                out
            }
            Payload::Leverage { sl_distance_pct, volatility, leverage } => {
                format!("{leverage}x for {sl_distance_pct:.2}% stop ({volatility} volatility)")
            }
            Payload::Recorded { symbol } => format!("{symbol} tracked"),
            Payload::Sync(r) => format!(
                "cleared {:?}, partial closes detected {:?}",
                r.cleared, r.partial_detected
            ),
            Payload::Status { symbol, state: None } => format!("{symbol}: not tracked"),
            Payload::Status { symbol, state: Some(s) } => format!(
                "{symbol}: partial_closed={} last_size={:?}",
                s.partial_closed, s.last_known_size
            ),
            Payload::Rr(c) => format!("R:R {:.2} → {:?}", c.rr, c.action),
            Payload::Tp(c) => format!("{:.2}% to target → {:?}", c.distance_pct, c.action),
            Payload::Exit(a) => format!("{a:?}"),
            Payload::Trail { symbol, previous_stop, new_stop } => {
                format!("{symbol} stop {previous_stop:.4} → {new_stop:.4}")
            }
            Payload::Pnl(p) => format!("{:?} {:+.2}%", p.status, p.pnl_pct),
            Payload::PartialClose(c) => format!(
                "close {:.6} (${:.2}), keep {:.6}",
                c.close_quantity, c.close_value, c.remaining_quantity
            ),
            Payload::Managed(d) => format!("{} @ {:.4}: {:?}", d.symbol, d.price, d.action),
            Payload::Range(r) => format!(
                "range {:.4} - {:.4} ({:.2}%) {}",
                r.low,
                r.high,
                r.size_pct,
                if r.is_closed { "CLOSED" } else { "FORMING" }
            ),
            Payload::Breakout(b) => format!(
                "{} @ {:.4} (range {:.4} - {:.4})",
                b.signal, b.current_price, b.range_low, b.range_high
            ),
            Payload::RangeScan(s) => {
                let setups: Vec<String> = s.setups().map(|(sym, st)| format!("{} {}", st.direction, sym)).collect();
                if setups.is_empty() {
                    format!("scanned {} symbols, no setups", s.entries.len())
                } else {
                    format!("scanned {} symbols, setups: {}", s.entries.len(), setups.join(", "))
                }
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ToolResponse {
    Success { summary: String, payload: Payload },
    Error { kind: ErrorKind, reason: String },
}

impl ToolResponse {
    pub fn is_success(&self) -> bool {
        matches!(self, ToolResponse::Success { .. })
    }
}

impl From<Result<Payload, AnalysisError>> for ToolResponse {
    fn from(result: Result<Payload, AnalysisError>) -> Self {
        match result {
            Ok(payload) => ToolResponse::Success { summary: payload.summary(), payload },
            Err(e) => ToolResponse::Error { kind: e.kind(), reason: e.to_string() },
        }
    }
}

/// Everything an operation may touch.
pub struct ToolContext<'a, S: CandleSource + ?Sized, T: StateStore> {
    pub source: &'a S,
    pub tracker: &'a mut PositionTracker<T>,
    pub cache: &'a mut LiquidationCache,
    pub config: &'a StrategyConfig,
    pub now: DateTime<Utc>,
}

pub fn execute_json<S, T>(raw: &str, ctx: &mut ToolContext<'_, S, T>) -> ToolResponse
where
    S: CandleSource + ?Sized,
    T: StateStore,
{
    match serde_json::from_str::<Operation>(raw) {
        Ok(op) => execute(op, ctx),
        Err(e) => ToolResponse::from(Err(AnalysisError::invalid(format!("unrecognised operation: {e}")))),
    }
}

pub fn execute<S, T>(op: Operation, ctx: &mut ToolContext<'_, S, T>) -> ToolResponse
where
    S: CandleSource + ?Sized,
    T: StateStore,
{
    dispatch(op, ctx).into()
}

fn dispatch<S, T>(op: Operation, ctx: &mut ToolContext<'_, S, T>) -> Result<Payload, AnalysisError>
where
    S: CandleSource + ?Sized,
    T: StateStore,
{
    let cfg = ctx.config;
    match op {
        Operation::AnalyzeMarket { symbol, interval } => {
            let a = analysis_for(ctx, &symbol, interval)?;
            Ok(Payload::Analysis(Box::new(a)))
        }
        Operation::CheckEntrySignal { symbol, interval } => {
            let a = analysis_for(ctx, &symbol, interval)?;
            Ok(Payload::Signal(Box::new(check_entry_signal(&a)?)))
        }
        Operation::LiquidityPools { symbol, interval } => {
            let interval = interval.unwrap_or(cfg.bias_interval);
            let candles = ctx.source.fetch_candles(&symbol, interval, pool_window(interval) + POOL_FETCH_PADDING)?;
            Ok(Payload::Liquidity(map_liquidity(&candles, interval)?))
        }
        Operation::DetectSweep { symbol, interval, lookback } => {
            let interval = interval.unwrap_or(cfg.sweep_interval);
            let candles = ctx.source.fetch_candles(&symbol, interval, SWEEP_FETCH_CANDLES)?;
            let lookback = lookback.unwrap_or(cfg.sweep_lookback_candles);
            Ok(Payload::Sweep(detect_sweep(&candles, lookback)?))
        }
        Operation::OpposingLiquidity { symbol, direction, entry_price } => {
            let interval = cfg.bias_interval;
            let candles = ctx.source.fetch_candles(&symbol, interval, pool_window(interval) + POOL_FETCH_PADDING)?;
            let map = map_liquidity(&candles, interval)?;
            Ok(Payload::Opposing(opposing_liquidity(&map, direction, entry_price)?))
        }
        Operation::MtfScan { symbol } => Ok(Payload::Mtf(Box::new(scan_mtf(ctx.source, &symbol, cfg)?))),
        Operation::LiquidationLevels { symbol } => {
            let symbol = normalize_symbol(&symbol);
            let interval = cfg.sweep_interval;
            let candles = ctx.source.fetch_candles(&symbol, interval, pool_window(interval) + POOL_FETCH_PADDING)?;
            Ok(Payload::Liquidations(estimate_liquidation_levels(&symbol, &candles, interval, ctx.cache)?))
        }
        Operation::CalculatePosition { symbol, balance, entry_price, stop_loss, risk_percent, leverage } => {
            let sizing = calculate_position(
                &normalize_symbol(&symbol),
                balance,
                entry_price,
                stop_loss,
                risk_percent,
                leverage,
            )?;
            Ok(Payload::Sizing(Box::new(sizing)))
        }
        Operation::CalculatePositionDynamic { symbol, balance, entry_price, stop_loss, take_profit, risk_percent } => {
            let sizing = calculate_position_dynamic(
                &normalize_symbol(&symbol),
                balance,
                entry_price,
                stop_loss,
                take_profit,
                risk_percent,
            )?;
            Ok(Payload::Sizing(Box::new(sizing)))
        }
        Operation::SelectLeverage { sl_distance_pct, volatility } => Ok(Payload::Leverage {
            sl_distance_pct,
            volatility,
            leverage: select_leverage(sl_distance_pct, volatility)?,
        }),
        Operation::RecordEntry { symbol, plan } => {
            ctx.tracker.record_entry(&symbol, plan)?;
            Ok(Payload::Recorded { symbol: normalize_symbol(&symbol) })
        }
        Operation::SyncPositions { positions } => Ok(Payload::Sync(ctx.tracker.sync(&positions)?)),
        Operation::PositionStatus { symbol } => {
            let state = ctx.tracker.status(&symbol)?;
            Ok(Payload::Status { symbol: normalize_symbol(&symbol), state })
        }
        Operation::MarkPartialClosed { symbol } => {
            ctx.tracker.mark_partial_closed(&symbol)?;
            let state = ctx.tracker.status(&symbol)?;
            Ok(Payload::Status { symbol: normalize_symbol(&symbol), state })
        }
        Operation::CheckRr { symbol, current_price } => {
            let (plan, state) = tracked(ctx.tracker, &symbol)?;
            Ok(Payload::Rr(check_rr(&plan, state.partial_closed, current_price)?))
        }
        Operation::CheckTp { symbol, current_price } => {
            let (plan, _) = tracked(ctx.tracker, &symbol)?;
            Ok(Payload::Tp(check_tp(&plan, current_price)?))
        }
        Operation::CheckExit { symbol, current_price } => {
            let (plan, state) = tracked(ctx.tracker, &symbol)?;
            let stop = active_stop(&state, &plan);
            Ok(Payload::Exit(check_exit(plan.direction, stop, current_price)?))
        }
        Operation::TrailStop { symbol, current_price } => {
            let (plan, state) = tracked(ctx.tracker, &symbol)?;
            let previous_stop = active_stop(&state, &plan);
            let new_stop = get_trail_sl(plan.direction, plan.entry_price, previous_stop, current_price);
            Ok(Payload::Trail { symbol: normalize_symbol(&symbol), previous_stop, new_stop })
        }
        Operation::CheckPnl { direction, entry_price, current_price } => {
            Ok(Payload::Pnl(check_pnl(direction, entry_price, current_price)?))
        }
        Operation::PartialCloseCalc { quantity, current_price } => {
            Ok(Payload::PartialClose(partial_close_calc(quantity, current_price)?))
        }
        Operation::ManagePosition { symbol, current_price } => {
            Ok(Payload::Managed(ctx.tracker.manage(&symbol, current_price)?))
        }
        Operation::RangeLevels { symbol } => {
            let candles = ctx.source.fetch_candles(&symbol, Interval::H4, 10)?;
            Ok(Payload::Range(first_range_candle(&candles, ctx.now)?))
        }
        Operation::RangeBreakout { symbol, range_high, range_low } => {
            let candles = ctx.source.fetch_candles(&symbol, Interval::M5, 100)?;
            Ok(Payload::Breakout(check_range_breakout(&candles, range_high, range_low)?))
        }
        Operation::RangeScan { symbols } => {
            let symbols = symbols.unwrap_or_else(|| cfg.symbols.clone());
            Ok(Payload::RangeScan(scan_range_setups(ctx.source, &symbols, ctx.now)))
        }
    }
}

fn analysis_for<S, T>(
    ctx: &ToolContext<'_, S, T>,
    symbol: &str,
    interval: Option<Interval>,
) -> Result<MarketAnalysis, AnalysisError>
where
    S: CandleSource + ?Sized,
    T: StateStore,
{
    let symbol = normalize_symbol(symbol);
    let interval = interval.unwrap_or(ctx.config.signal_interval);
    let candles = ctx.source.fetch_candles(&symbol, interval, ctx.config.signal_candles)?;
    analyze_market(&symbol, interval, &candles)
}

fn tracked<T: StateStore>(
    tracker: &PositionTracker<T>,
    symbol: &str,
) -> Result<(PositionPlan, PositionState), AnalysisError> {
    let state = tracker.status(symbol)?.unwrap_or_default();
    let plan = state
        .plan
        .ok_or_else(|| AnalysisError::invalid(format!("no tracked plan for {}", normalize_symbol(symbol))))?;
    Ok((plan, state))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::candles::MemoryCandleSource;
    use crate::state_store::MemoryStore;

    fn with_ctx<R>(f: impl FnOnce(&mut ToolContext<'_, MemoryCandleSource, MemoryStore>) -> R) -> R {
        let source = MemoryCandleSource::new();
        let mut tracker = PositionTracker::new(MemoryStore::new());
        let mut cache = LiquidationCache::default();
        let config = StrategyConfig::default();
        let mut ctx = ToolContext {
            source: &source,
            tracker: &mut tracker,
            cache: &mut cache,
            config: &config,
            now: Utc::now(),
        };
        f(&mut ctx)
    }

    #[test]
    fn sizing_through_json() {
        let resp = with_ctx(|ctx| {
            execute_json(
                r#"{"action":"calculate_position","symbol":"BTCUSDT","balance":100,"entry_price":95000,
                    "stop_loss":94050,"risk_percent":5,"leverage":20}"#,
                ctx,
            )
        });
        match resp {
            ToolResponse::Success { payload: Payload::Sizing(s), summary } => {
                assert!((s.notional - 500.0).abs() < 1e-9);
                assert!(summary.starts_with("LONG"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn unknown_action_is_invalid_input() {
        let resp = with_ctx(|ctx| execute_json(r#"{"action":"launch_rocket"}"#, ctx));
        assert!(matches!(resp, ToolResponse::Error { kind: ErrorKind::InvalidInput, .. }));
    }

    #[test]
    fn missing_candles_are_data_unavailable() {
        let resp = with_ctx(|ctx| execute(Operation::MtfScan { symbol: "BTCUSDT".into() }, ctx));
        assert!(matches!(resp, ToolResponse::Error { kind: ErrorKind::DataUnavailable, .. }));
    }

    #[test]
    fn position_lifecycle_through_operations() {
        with_ctx(|ctx| {
            let plan = PositionPlan {
                direction: Direction::Short,
                entry_price: 100.0,
                stop_loss: 102.0,
                take_profit: 95.0,
                quantity: 1.0,
            };
            assert!(execute(Operation::RecordEntry { symbol: "sol".into(), plan }, ctx).is_success());

            let rr = execute(Operation::CheckRr { symbol: "SOLUSDT".into(), current_price: 97.5 }, ctx);
            match rr {
                ToolResponse::Success { payload: Payload::Rr(c), .. } => {
                    assert!((c.rr - 1.25).abs() < 1e-9);
                    assert!(matches!(c.action, ManagementAction::PartialClose { .. }));
                }
                other => panic!("unexpected {other:?}"),
            }

            let trail = execute(Operation::TrailStop { symbol: "SOLUSDT".into(), current_price: 96.0 }, ctx);
            match trail {
                ToolResponse::Success { payload: Payload::Trail { new_stop, .. }, .. } => assert_eq!(new_stop, 98.0),
                other => panic!("unexpected {other:?}"),
            }

            let missing = execute(Operation::CheckTp { symbol: "BTCUSDT".into(), current_price: 1.0 }, ctx);
            assert!(matches!(missing, ToolResponse::Error { kind: ErrorKind::InvalidInput, .. }));
        });
    }

    #[test]
    fn exit_ops_agree_with_manage_after_inferred_partial() {
        use crate::position_manager::ExitReason;

        with_ctx(|ctx| {
            let plan = PositionPlan {
                direction: Direction::Long,
                entry_price: 100.0,
                stop_loss: 90.0,
                take_profit: 130.0,
                quantity: 1.0,
            };
            assert!(execute(Operation::RecordEntry { symbol: "BTCUSDT".into(), plan }, ctx).is_success());
            let halved = vec![OpenPosition { symbol: "BTCUSDT".into(), size: 0.5, mark_price: None }];
            assert!(execute(Operation::SyncPositions { positions: halved }, ctx).is_success());

            // Breakeven is in force even though no stop was persisted.
            let exit = execute(Operation::CheckExit { symbol: "BTCUSDT".into(), current_price: 95.0 }, ctx);
            match exit {
                ToolResponse::Success { payload: Payload::Exit(action), .. } => {
                    assert_eq!(action, ManagementAction::Exit { reason: ExitReason::SlHit })
                }
                other => panic!("unexpected {other:?}"),
            }
            let trail = execute(Operation::TrailStop { symbol: "BTCUSDT".into(), current_price: 95.0 }, ctx);
            match trail {
                ToolResponse::Success { payload: Payload::Trail { previous_stop, new_stop, .. }, .. } => {
                    assert_eq!(previous_stop, 100.0);
                    assert_eq!(new_stop, 100.0);
                }
                other => panic!("unexpected {other:?}"),
            }

            let managed = execute(Operation::ManagePosition { symbol: "BTCUSDT".into(), current_price: 95.0 }, ctx);
            match managed {
                ToolResponse::Success { payload: Payload::Managed(d), .. } => {
                    assert_eq!(d.active_stop, 100.0);
                    assert_eq!(d.action, ManagementAction::Exit { reason: ExitReason::SlHit });
                }
                other => panic!("unexpected {other:?}"),
            }
        });
    }

    #[test]
    fn leverage_defaults_to_normal_volatility() {
        let resp = with_ctx(|ctx| execute_json(r#"{"action":"select_leverage","sl_distance_pct":1.0}"#, ctx));
        match resp {
            ToolResponse::Success { payload: Payload::Leverage { leverage, .. }, .. } => assert_eq!(leverage, 25),
            other => panic!("unexpected {other:?}"),
        }
    }
}
