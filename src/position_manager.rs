//! Per-symbol position state machine: OPEN → PARTIAL_CLOSED → CLOSED.
//!
//! CLOSED is not stored: a symbol that disappears from the open-position set
//! has its state deleted.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::candles::normalize_symbol;
use crate::config::{
    PARTIAL_CLOSE_FRACTION, PARTIAL_CLOSE_RR, PARTIAL_SIZE_RATIO_MAX, PARTIAL_SIZE_RATIO_MIN,
    TRAIL_LOCK_FRACTION,
};
use crate::error::{ensure_positive, AnalysisError};
use crate::state_store::{PositionPlan, PositionState, StateStore};
use crate::types::{Direction, OpenPosition};

// ─── Actions ──────────────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HoldReason {
    BelowTarget,
    /// Already partially closed; the remainder rides a trailing stop.
    Trailing,
    TargetNotReached,
    StopNotHit,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExitReason {
    SlHit,
    TpHit,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ManagementAction {
    Hold { reason: HoldReason },
    PartialClose { fraction: f64, new_stop: f64 },
    CloseAll { reason: ExitReason },
    Exit { reason: ExitReason },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RrCheck {
    pub rr: f64,
    pub action: ManagementAction,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TpCheck {
    /// Signed distance still to travel to the target, in percent of price.
    pub distance_pct: f64,
    pub action: ManagementAction,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PnlStatus {
    Profit,
    Loss,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct PnlReport {
    pub pnl_pct: f64,
    pub status: PnlStatus,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct PartialCloseCalc {
    pub close_quantity: f64,
    pub close_value: f64,
    pub remaining_quantity: f64,
}

// ─── Stateless checks ─────────────────────────────────────────────────────────

/// Unrealised profit in multiples of the original stop distance.
pub fn check_rr(plan: &PositionPlan, partial_closed: bool, price: f64) -> Result<RrCheck, AnalysisError> {
    ensure_positive("current_price", price)?;
    let risk = (plan.entry_price - plan.stop_loss).abs();
    if risk == 0.0 {
        return Err(AnalysisError::Computation("stop distance is zero".into()));
    }
    let rr = (price - plan.entry_price) * plan.direction.sign() / risk;

    let action = if partial_closed {
        ManagementAction::Hold { reason: HoldReason::Trailing }
    } else if rr >= PARTIAL_CLOSE_RR {
        ManagementAction::PartialClose { fraction: PARTIAL_CLOSE_FRACTION, new_stop: plan.entry_price }
    } else {
        ManagementAction::Hold { reason: HoldReason::BelowTarget }
    };
    Ok(RrCheck { rr, action })
}

pub fn check_tp(plan: &PositionPlan, price: f64) -> Result<TpCheck, AnalysisError> {
    ensure_positive("current_price", price)?;
    let distance_pct = (plan.take_profit - price) * plan.direction.sign() / price * 100.0;
    let action = if distance_pct <= 0.0 {
        ManagementAction::CloseAll { reason: ExitReason::TpHit }
    } else {
        ManagementAction::Hold { reason: HoldReason::TargetNotReached }
    };
    Ok(TpCheck { distance_pct, action })
}

pub fn check_exit(direction: Direction, stop: f64, price: f64) -> Result<ManagementAction, AnalysisError> {
    ensure_positive("current_price", price)?;
    let hit = match direction {
        Direction::Long => price <= stop,
        Direction::Short => price >= stop,
    };
    Ok(if hit {
        ManagementAction::Exit { reason: ExitReason::SlHit }
    } else {
        ManagementAction::Hold { reason: HoldReason::StopNotHit }
    })
}

/// Stop locking in half of the move from entry; never looser than `current_stop`.
pub fn get_trail_sl(direction: Direction, entry: f64, current_stop: f64, price: f64) -> f64 {
    let moved = (price - entry) * direction.sign();
    if moved <= 0.0 {
        return current_stop;
    }
    let candidate = entry + direction.sign() * TRAIL_LOCK_FRACTION * moved;
    match direction {
        Direction::Long => current_stop.max(candidate),
        Direction::Short => current_stop.min(candidate),
    }
}

/// Stop in force for a tracked position: the moved stop when one was
/// persisted, breakeven once partially closed, otherwise the planned stop.
pub fn active_stop(state: &PositionState, plan: &PositionPlan) -> f64 {
    match state.active_stop {
        Some(stop) => stop,
        None if state.partial_closed => plan.entry_price,
        None => plan.stop_loss,
    }
}

pub fn check_pnl(direction: Direction, entry: f64, price: f64) -> Result<PnlReport, AnalysisError> {
    ensure_positive("entry_price", entry)?;
    ensure_positive("current_price", price)?;
    let pnl_pct = (price - entry) / entry * 100.0 * direction.sign();
    let status = if pnl_pct > 0.0 { PnlStatus::Profit } else { PnlStatus::Loss };
    Ok(PnlReport { pnl_pct, status })
}

pub fn partial_close_calc(quantity: f64, price: f64) -> Result<PartialCloseCalc, AnalysisError> {
    ensure_positive("quantity", quantity)?;
    ensure_positive("current_price", price)?;
    let close_quantity = quantity * PARTIAL_CLOSE_FRACTION;
    Ok(PartialCloseCalc {
        close_quantity,
        close_value: close_quantity * price,
        remaining_quantity: quantity - close_quantity,
    })
}

// ─── Tracker ──────────────────────────────────────────────────────────────────

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncReport {
    pub cleared: Vec<String>,
    pub partial_detected: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ManagementDecision {
    pub symbol: String,
    pub price: f64,
    pub rr: f64,
    pub active_stop: f64,
    pub action: ManagementAction,
}

/// Rejects plans whose stop or target sits on the wrong side of entry.
fn validate_plan(plan: &PositionPlan) -> Result<(), AnalysisError> {
    ensure_positive("entry_price", plan.entry_price)?;
    ensure_positive("stop_loss", plan.stop_loss)?;
    ensure_positive("take_profit", plan.take_profit)?;
    ensure_positive("quantity", plan.quantity)?;

    let sign = plan.direction.sign();
    if (plan.entry_price - plan.stop_loss) * sign <= 0.0 {
        return Err(AnalysisError::invalid(format!(
            "{} stop_loss {} must be on the loss side of entry {}",
            plan.direction, plan.stop_loss, plan.entry_price
        )));
    }
    if (plan.take_profit - plan.entry_price) * sign <= 0.0 {
        return Err(AnalysisError::invalid(format!(
            "{} take_profit {} must be on the profit side of entry {}",
            plan.direction, plan.take_profit, plan.entry_price
        )));
    }
    Ok(())
}

pub struct PositionTracker<S: StateStore> {
    store: S,
}

impl<S: StateStore> PositionTracker<S> {
    pub fn new(store: S) -> Self {
        PositionTracker { store }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn into_inner(self) -> S {
        self.store
    }

    pub fn record_entry(&mut self, symbol: &str, plan: PositionPlan) -> Result<(), AnalysisError> {
        validate_plan(&plan)?;
        let symbol = normalize_symbol(symbol);
        log::info!(
            "[{}] tracking {} qty={} entry={:.4} sl={:.4} tp={:.4}",
            symbol,
            plan.direction,
            plan.quantity,
            plan.entry_price,
            plan.stop_loss,
            plan.take_profit
        );
        self.store.put(
            &symbol,
            PositionState {
                plan: Some(plan),
                partial_closed: false,
                last_known_size: Some(plan.quantity),
                active_stop: None,
            },
        )?;
        Ok(())
    }

    /// Reconciles stored state with the positions that are actually open.
    ///
    /// Symbols no longer open are cleared. A size that shrank to 40–60 % of
    /// the last recorded size marks the position partially closed.
    pub fn sync(&mut self, open: &[OpenPosition]) -> Result<SyncReport, AnalysisError> {
        let live: Vec<(String, f64)> = open
            .iter()
            .filter(|p| p.size > 0.0)
            .map(|p| (normalize_symbol(&p.symbol), p.size))
            .collect();
        let live_set: HashSet<&str> = live.iter().map(|(s, _)| s.as_str()).collect();

        let mut report = SyncReport::default();
        for symbol in self.store.symbols()? {
            if !live_set.contains(symbol.as_str()) {
                self.store.delete(&symbol)?;
                log::info!("[{}] position closed, state cleared", symbol);
                report.cleared.push(symbol);
            }
        }

        for (symbol, size) in live {
            let mut state = self.store.get(&symbol)?.unwrap_or_default();
            if !state.partial_closed {
                if let Some(last) = state.last_known_size.filter(|l| *l > 0.0) {
                    let ratio = size / last;
                    if (PARTIAL_SIZE_RATIO_MIN..=PARTIAL_SIZE_RATIO_MAX).contains(&ratio) {
                        log::info!(
                            "[{}] partial close detected: {} → {} ({:.0}%)",
                            symbol,
                            last,
                            size,
                            ratio * 100.0
                        );
                        state.partial_closed = true;
                        report.partial_detected.push(symbol.clone());
                    }
                }
            }
            state.last_known_size = Some(size);
            self.store.put(&symbol, state)?;
        }
        Ok(report)
    }

    pub fn mark_partial_closed(&mut self, symbol: &str) -> Result<(), AnalysisError> {
        let symbol = normalize_symbol(symbol);
        let mut state = self.store.get(&symbol)?.unwrap_or_default();
        state.partial_closed = true;
        self.store.put(&symbol, state)?;
        Ok(())
    }

    pub fn status(&self, symbol: &str) -> Result<Option<PositionState>, AnalysisError> {
        Ok(self.store.get(&normalize_symbol(symbol))?)
    }

    pub fn tracked_symbols(&self) -> Result<Vec<String>, AnalysisError> {
        Ok(self.store.symbols()?)
    }

    /// Exit check, then TP, then R:R for one tracked position at `price`.
    ///
    /// A partial close moves the stop to breakeven; while partially closed the
    /// stop trails and is persisted whenever it tightens.
    pub fn manage(&mut self, symbol: &str, price: f64) -> Result<ManagementDecision, AnalysisError> {
        let symbol = normalize_symbol(symbol);
        let mut state = self.store.get(&symbol)?.unwrap_or_default();
        let plan = state
            .plan
            .ok_or_else(|| AnalysisError::invalid(format!("no tracked plan for {symbol}")))?;

        let stop = active_stop(&state, &plan);
        let rr_check = check_rr(&plan, state.partial_closed, price)?;
        let decide = |action, active_stop| ManagementDecision {
            symbol: symbol.clone(),
            price,
            rr: rr_check.rr,
            active_stop,
            action,
        };

        let exit = check_exit(plan.direction, stop, price)?;
        if matches!(exit, ManagementAction::Exit { .. }) {
            log::warn!("[{}] stop {:.4} hit at {:.4}", symbol, stop, price);
            return Ok(decide(exit, stop));
        }

        let tp = check_tp(&plan, price)?;
        if matches!(tp.action, ManagementAction::CloseAll { .. }) {
            log::info!("[{}] take profit {:.4} reached", symbol, plan.take_profit);
            return Ok(decide(tp.action, stop));
        }

        match rr_check.action {
            ManagementAction::PartialClose { new_stop, .. } => {
                state.partial_closed = true;
                state.active_stop = Some(new_stop);
                self.store.put(&symbol, state)?;
                log::info!("[{}] {:.2}R reached, closing half, stop → {:.4}", symbol, rr_check.rr, new_stop);
                Ok(decide(rr_check.action, new_stop))
            }
            ManagementAction::Hold { reason: HoldReason::Trailing } => {
                let trailed = get_trail_sl(plan.direction, plan.entry_price, stop, price);
                if trailed != stop {
                    state.active_stop = Some(trailed);
                    self.store.put(&symbol, state)?;
                    log::info!("[{}] trailing stop {:.4} → {:.4}", symbol, stop, trailed);
                }
                Ok(decide(rr_check.action, trailed))
            }
            other => Ok(decide(other, stop)),
        }
    }
}
