//! # Margin & Liquidation Evaluator
//!
//! Runs once per cycle, after ordinary fills, against every open position.
//! A position whose margin ratio falls to the maintenance level is force
//! closed through the fill simulator at a penalty-adjusted price.
//! Liquidations execute one position at a time with the margin state
//! re-evaluated between closes, since each close changes the ledger.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::config::SimConfig;
use crate::errors::Result;
use crate::execution::FillSimulator;
use crate::ledger::{Ledger, Position, Side};

/// Record of one forced close, kept distinct from strategy-initiated exits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiquidationEvent {
    pub symbol: String,
    pub side: Side,
    /// Unsigned quantity closed.
    pub qty: f64,
    /// Penalty-adjusted close price.
    pub price: f64,
    pub fee: f64,
    /// Margin ratio at the moment the liquidation triggered.
    pub margin_ratio: f64,
    pub realized_pl: f64,
    pub timestamp: DateTime<Utc>,
}

/// Maintenance-margin sweep over a ledger.
#[derive(Debug, Clone)]
pub struct MarginEvaluator {
    mm: f64,
}

impl MarginEvaluator {
    pub fn new(config: &SimConfig) -> Self {
        Self { mm: config.mm }
    }

    /// Margin ratio of a position at the given mark: allocated margin plus
    /// unrealized P/L over notional. `None` when the ratio cannot be
    /// evaluated (zero notional).
    pub fn margin_ratio(position: &Position, mark: f64) -> Option<f64> {
        let notional = position.notional(mark);
        if notional <= 0.0 {
            return None;
        }
        Some((position.allocated_margin(mark) + position.unrealized_pl(mark)) / notional)
    }

    /// Liquidate every position at or below maintenance margin.
    ///
    /// Positions without a mark price are skipped. Liquidation is
    /// non-negotiable: once triggered it executes unconditionally, and the
    /// sweep re-evaluates the remaining positions after each close.
    pub fn sweep(
        &self,
        ledger: &mut Ledger,
        simulator: &FillSimulator,
        marks: &HashMap<String, f64>,
        now: DateTime<Utc>,
    ) -> Result<Vec<LiquidationEvent>> {
        let mut events = Vec::new();

        loop {
            let candidate = ledger
                .open_positions()
                .filter_map(|position| {
                    let mark = *marks.get(&position.symbol)?;
                    let ratio = Self::margin_ratio(position, mark)?;
                    (ratio <= self.mm).then(|| (position.clone(), mark, ratio))
                })
                .min_by(|a, b| a.0.symbol.cmp(&b.0.symbol));

            let Some((position, mark, ratio)) = candidate else {
                break;
            };

            let fill = simulator.simulate_forced_close(&position, mark, now);
            let outcome = ledger.apply_fill(
                &fill.symbol,
                fill.delta_qty,
                fill.price,
                fill.fee,
                position.leverage,
                now,
            )?;

            warn!(
                symbol = %fill.symbol,
                qty = fill.qty,
                price = fill.price,
                margin_ratio = ratio,
                realized_pl = outcome.realized_pl,
                "position liquidated"
            );
            events.push(LiquidationEvent {
                symbol: fill.symbol.clone(),
                side: fill.side,
                qty: fill.qty,
                price: fill.price,
                fee: fill.fee,
                margin_ratio: ratio,
                realized_pl: outcome.realized_pl,
                timestamp: now,
            });
        }

        Ok(events)
    }
}
