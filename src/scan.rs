//! One analysis cycle over the configured symbols.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::candles::{normalize_symbol, CandleSource};
use crate::config::StrategyConfig;
use crate::error::{ensure_positive, AnalysisError, ErrorReport};
use crate::mtf::{scan_mtf, MtfScan};
use crate::position_manager::{ManagementDecision, PositionTracker, SyncReport};
use crate::signal::{analyze_market, check_entry_signal, EntrySignal, SignalDecision};
use crate::sizing::{calculate_position, calculate_position_dynamic, select_leverage, PositionSizing};
use crate::state_store::StateStore;
use crate::types::OpenPosition;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    AlreadyPositioned,
    PositionCap,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SizingMode {
    /// Sized on the multi-timeframe setup's stop and target.
    Dynamic,
    /// Sized on the signal's stop with selector leverage.
    FixedRisk,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SizedEntry {
    pub mode: SizingMode,
    pub sizing: PositionSizing,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SymbolReport {
    Analyzed {
        symbol: String,
        signal: EntrySignal,
        mtf: MtfScan,
        entry: Option<SizedEntry>,
    },
    Skipped {
        symbol: String,
        reason: SkipReason,
    },
    Failed {
        symbol: String,
        error: ErrorReport,
    },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ManageReport {
    Managed(ManagementDecision),
    Failed { symbol: String, error: ErrorReport },
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CycleReport {
    pub balance: f64,
    pub sync: Option<SyncReport>,
    pub managed: Vec<ManageReport>,
    pub symbols: Vec<SymbolReport>,
}

impl CycleReport {
    pub fn entries(&self) -> impl Iterator<Item = (&str, &SizedEntry)> {
        self.symbols.iter().filter_map(|r| match r {
            SymbolReport::Analyzed { symbol, entry: Some(e), .. } => Some((symbol.as_str(), e)),
            _ => None,
        })
    }

    pub fn failures(&self) -> usize {
        self.symbols
            .iter()
            .filter(|r| matches!(r, SymbolReport::Failed { .. }))
            .count()
    }
}

/// Runs one cycle.
///
/// With `open_positions` given, tracked state is reconciled and every tracked
/// position with a plan is managed first. Symbols already positioned are
/// skipped, and no more entries are proposed than `max_positions` allows.
/// A symbol's failure is recorded and the cycle moves on; only invalid
/// cycle inputs or a failing state store abort it.
pub fn run_cycle<S, T>(
    source: &S,
    tracker: &mut PositionTracker<T>,
    cfg: &StrategyConfig,
    balance: f64,
    open_positions: Option<&[OpenPosition]>,
) -> Result<CycleReport, AnalysisError>
where
    S: CandleSource + ?Sized,
    T: StateStore,
{
    ensure_positive("balance", balance)?;
    cfg.validate()?;

    let mut report = CycleReport { balance, ..Default::default() };
    let mut positioned: HashSet<String> = HashSet::new();

    if let Some(open) = open_positions {
        report.sync = Some(tracker.sync(open)?);
        for p in open.iter().filter(|p| p.size > 0.0) {
            positioned.insert(normalize_symbol(&p.symbol));
        }
        report.managed = manage_tracked(source, tracker, cfg, open)?;
    }

    let mut slots = cfg.max_positions.saturating_sub(positioned.len());
    for raw in &cfg.symbols {
        let symbol = normalize_symbol(raw);
        if positioned.contains(&symbol) {
            report.symbols.push(SymbolReport::Skipped { symbol, reason: SkipReason::AlreadyPositioned });
            continue;
        }
        if slots == 0 {
            report.symbols.push(SymbolReport::Skipped { symbol, reason: SkipReason::PositionCap });
            continue;
        }

        match evaluate_symbol(source, &symbol, cfg, balance) {
            Ok(r) => {
                if matches!(r, SymbolReport::Analyzed { entry: Some(_), .. }) {
                    slots -= 1;
                }
                report.symbols.push(r);
            }
            Err(e) => {
                log::warn!("[{}] analysis failed: {}", symbol, e);
                report.symbols.push(SymbolReport::Failed { symbol, error: ErrorReport::from(&e) });
            }
        }
    }

    log::info!(
        "cycle done: {} symbols, {} entries, {} failures, {} managed",
        report.symbols.len(),
        report.entries().count(),
        report.failures(),
        report.managed.len()
    );
    Ok(report)
}

fn manage_tracked<S, T>(
    source: &S,
    tracker: &mut PositionTracker<T>,
    cfg: &StrategyConfig,
    open: &[OpenPosition],
) -> Result<Vec<ManageReport>, AnalysisError>
where
    S: CandleSource + ?Sized,
    T: StateStore,
{
    let mut out = Vec::new();
    for symbol in tracker.tracked_symbols()? {
        let has_plan = tracker.status(&symbol)?.is_some_and(|s| s.plan.is_some());
        if !has_plan {
            continue;
        }
        let mark = open
            .iter()
            .find(|p| normalize_symbol(&p.symbol) == symbol)
            .and_then(|p| p.mark_price);

        let result = match mark {
            Some(price) => Ok(price),
            None => last_close(source, &symbol, cfg),
        }
        .and_then(|price| tracker.manage(&symbol, price));

        out.push(match result {
            Ok(decision) => ManageReport::Managed(decision),
            Err(e) => {
                log::warn!("[{}] management failed: {}", symbol, e);
                ManageReport::Failed { symbol, error: ErrorReport::from(&e) }
            }
        });
    }
    Ok(out)
}

fn last_close<S: CandleSource + ?Sized>(
    source: &S,
    symbol: &str,
    cfg: &StrategyConfig,
) -> Result<f64, AnalysisError> {
    source
        .fetch_candles(symbol, cfg.entry_interval, 1)?
        .last()
        .map(|c| c.close)
        .ok_or_else(|| AnalysisError::insufficient("current price", 1, 0))
}

/// Signal + MTF for one symbol, sized when the signal says ENTRY.
pub fn evaluate_symbol<S: CandleSource + ?Sized>(
    source: &S,
    symbol: &str,
    cfg: &StrategyConfig,
    balance: f64,
) -> Result<SymbolReport, AnalysisError> {
    let candles = source.fetch_candles(symbol, cfg.signal_interval, cfg.signal_candles)?;
    let analysis = analyze_market(symbol, cfg.signal_interval, &candles)?;
    let signal = check_entry_signal(&analysis)?;
    let mtf = scan_mtf(source, symbol, cfg)?;

    let entry = match &signal.decision {
        SignalDecision::Entry { direction, entry_price, stop_loss, .. } => {
            let aligned = mtf
                .outcome
                .setup()
                .filter(|s| s.direction == *direction && s.rr_ratio >= cfg.min_rr_ratio);
            Some(match aligned {
                Some(setup) => SizedEntry {
                    mode: SizingMode::Dynamic,
                    sizing: calculate_position_dynamic(
                        symbol,
                        balance,
                        setup.entry,
                        setup.stop_loss,
                        setup.take_profit,
                        cfg.risk_percent,
                    )?,
                },
                None => {
                    let sl_pct = (entry_price - stop_loss).abs() / entry_price * 100.0;
                    let leverage = select_leverage(sl_pct, cfg.volatility)?;
                    SizedEntry {
                        mode: SizingMode::FixedRisk,
                        sizing: calculate_position(
                            symbol,
                            balance,
                            *entry_price,
                            *stop_loss,
                            cfg.risk_percent,
                            leverage,
                        )?,
                    }
                }
            })
        }
        SignalDecision::NoTrade { .. } => None,
    };

    Ok(SymbolReport::Analyzed { symbol: symbol.to_string(), signal, mtf, entry })
}
