//! # Ledger & Position Store
//!
//! Owns per-symbol position state and the running cash / realized / fee /
//! funding balances for one strategy version. Pure state plus invariant
//! checks; no I/O. All mutation flows through [`Ledger::apply_fill`] and
//! [`Ledger::apply_funding`], keeping every dollar of equity explainable as
//! cash plus unrealized P/L.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::errors::{PerpArenaError, Result};

/// Quantities below this are treated as flat.
pub const QTY_EPSILON: f64 = 1e-9;

/// Direction of a fill.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    /// Side that closes a position of the given signed quantity.
    pub fn closing(qty: f64) -> Self {
        if qty > 0.0 {
            Side::Sell
        } else {
            Side::Buy
        }
    }

    /// Signed sign of the side: +1 for buys, -1 for sells.
    pub fn sign(&self) -> f64 {
        match self {
            Side::Buy => 1.0,
            Side::Sell => -1.0,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Side::Buy => write!(f, "buy"),
            Side::Sell => write!(f, "sell"),
        }
    }
}

/// Advisory exit plan attached to a position. The engine stores it for the
/// decision source and the dashboard; nothing in the engine enforces it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExitPlan {
    pub profit_target: Option<f64>,
    pub stop_loss: Option<f64>,
    pub invalidation_condition: String,
}

/// Signed position for a single symbol.
///
/// `avg_entry`, `leverage` and `entry_time` are meaningful only while
/// `qty != 0`; a full close resets them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    /// Signed quantity: positive = long, negative = short.
    pub qty: f64,
    /// Volume-weighted average entry price.
    pub avg_entry: f64,
    /// Leverage fixed when the position was opened.
    pub leverage: f64,
    /// Set on the transition from flat to non-flat.
    pub entry_time: Option<DateTime<Utc>>,
    pub exit_plan: Option<ExitPlan>,
}

impl Position {
    fn flat(symbol: &str) -> Self {
        Self {
            symbol: symbol.to_string(),
            qty: 0.0,
            avg_entry: 0.0,
            leverage: 1.0,
            entry_time: None,
            exit_plan: None,
        }
    }

    pub fn is_flat(&self) -> bool {
        self.qty.abs() < QTY_EPSILON
    }

    /// Dollar exposure at the given mark price.
    pub fn notional(&self, mark: f64) -> f64 {
        self.qty.abs() * mark
    }

    /// Mark-to-market P/L against the average entry.
    pub fn unrealized_pl(&self, mark: f64) -> f64 {
        self.qty * (mark - self.avg_entry)
    }

    /// Margin backing this position: notional over the entry leverage.
    pub fn allocated_margin(&self, mark: f64) -> f64 {
        if self.leverage > 0.0 {
            self.notional(mark) / self.leverage
        } else {
            0.0
        }
    }
}

/// Realized P/L on a closed (or partially closed) portion of a position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Realization {
    pub symbol: String,
    /// Unsigned quantity closed.
    pub qty: f64,
    pub entry_price: f64,
    pub exit_price: f64,
    /// Signed realized P/L on the closed portion.
    pub pnl: f64,
    pub timestamp: DateTime<Utc>,
}

/// One accounting event produced by a fill. A flip through zero produces a
/// `Closed` followed by an `Opened` entry, never a single merged event.
#[derive(Debug, Clone, PartialEq)]
pub enum LedgerEvent {
    /// Flat to non-flat transition.
    Opened { symbol: String, qty: f64, price: f64 },
    /// Same-direction size increase.
    Increased { symbol: String, qty: f64, price: f64 },
    /// Partial close; average entry unchanged.
    Reduced(Realization),
    /// Full close; entry state cleared.
    Closed(Realization),
}

/// Result of applying one fill to the ledger.
#[derive(Debug, Clone, PartialEq)]
pub struct FillOutcome {
    /// Position state after the fill.
    pub position: Position,
    /// Accounting trail, in order. One entry for plain fills, two for flips.
    pub events: Vec<LedgerEvent>,
    /// Realized P/L summed over the events of this fill.
    pub realized_pl: f64,
}

/// Cash, positions and cumulative totals for one strategy version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ledger {
    cash: f64,
    initial_cash: f64,
    positions: HashMap<String, Position>,
    realized_pl: f64,
    /// Cumulative fees paid (positive).
    fees: f64,
    /// Cumulative funding received (signed; negative when paying).
    funding: f64,
    max_position_notional: Option<f64>,
}

impl Ledger {
    pub fn new(initial_cash: f64, max_position_notional: Option<f64>) -> Self {
        Self {
            cash: initial_cash,
            initial_cash,
            positions: HashMap::new(),
            realized_pl: 0.0,
            fees: 0.0,
            funding: 0.0,
            max_position_notional,
        }
    }

    pub fn cash(&self) -> f64 {
        self.cash
    }

    pub fn realized_pl(&self) -> f64 {
        self.realized_pl
    }

    pub fn fees_paid(&self) -> f64 {
        self.fees
    }

    pub fn funding_net(&self) -> f64 {
        self.funding
    }

    /// Position for a symbol, if one is open.
    pub fn position(&self, symbol: &str) -> Option<&Position> {
        self.positions.get(symbol).filter(|p| !p.is_flat())
    }

    /// Signed quantity for a symbol (zero when flat).
    pub fn qty(&self, symbol: &str) -> f64 {
        self.position(symbol).map(|p| p.qty).unwrap_or(0.0)
    }

    /// All open positions.
    pub fn open_positions(&self) -> impl Iterator<Item = &Position> {
        self.positions.values().filter(|p| !p.is_flat())
    }

    /// Attach or replace the advisory exit plan for an open position.
    pub fn set_exit_plan(&mut self, symbol: &str, plan: Option<ExitPlan>) {
        if let Some(position) = self.positions.get_mut(symbol) {
            if !position.is_flat() {
                position.exit_plan = plan;
            }
        }
    }

    /// Total unrealized P/L across open positions. Symbols without a mark
    /// price contribute at their entry price, i.e. zero.
    pub fn unrealized_pl(&self, marks: &HashMap<String, f64>) -> f64 {
        self.open_positions()
            .map(|p| {
                let mark = marks.get(&p.symbol).copied().unwrap_or(p.avg_entry);
                p.unrealized_pl(mark)
            })
            .sum()
    }

    /// Equity: cash plus unrealized P/L, by construction.
    pub fn equity(&self, marks: &HashMap<String, f64>) -> f64 {
        self.cash + self.unrealized_pl(marks)
    }

    /// Margin locked in open positions.
    pub fn used_margin(&self, marks: &HashMap<String, f64>) -> f64 {
        self.open_positions()
            .map(|p| {
                let mark = marks.get(&p.symbol).copied().unwrap_or(p.avg_entry);
                p.allocated_margin(mark)
            })
            .sum()
    }

    /// Margin available to open new positions.
    pub fn available_margin(&self, marks: &HashMap<String, f64>) -> f64 {
        (self.equity(marks) - self.used_margin(marks)).max(0.0)
    }

    /// Apply a fill to the ledger.
    ///
    /// `delta_qty` is signed (positive buys, negative sells). A fill whose
    /// magnitude exceeds the open quantity on the opposite side is split
    /// deterministically into a full close followed by an open of the
    /// remainder at the same price; both entries land in the accounting
    /// trail. The fee is debited from cash regardless of direction.
    ///
    /// The ledger enforces arithmetic consistency only; policy checks such
    /// as minimum notional belong to the caller.
    pub fn apply_fill(
        &mut self,
        symbol: &str,
        delta_qty: f64,
        fill_price: f64,
        fee: f64,
        leverage: f64,
        now: DateTime<Utc>,
    ) -> Result<FillOutcome> {
        if !delta_qty.is_finite() || delta_qty.abs() < QTY_EPSILON {
            return Err(PerpArenaError::validation(format!(
                "fill quantity delta must be non-zero and finite, got {delta_qty}"
            )));
        }
        if !fill_price.is_finite() || fill_price <= 0.0 {
            return Err(PerpArenaError::validation(format!(
                "fill price must be positive, got {fill_price}"
            )));
        }

        let old_qty = self.qty(symbol);
        let new_qty = old_qty + delta_qty;
        if let Some(limit) = self.max_position_notional {
            let notional = new_qty.abs() * fill_price;
            if notional > limit {
                return Err(PerpArenaError::NotionalLimitExceeded {
                    symbol: symbol.to_string(),
                    notional,
                    limit,
                });
            }
        }

        let position = self
            .positions
            .entry(symbol.to_string())
            .or_insert_with(|| Position::flat(symbol));

        let mut events = Vec::with_capacity(2);
        let mut realized = 0.0;

        if position.is_flat() {
            // Flat to open.
            position.qty = delta_qty;
            position.avg_entry = fill_price;
            position.leverage = leverage;
            position.entry_time = Some(now);
            events.push(LedgerEvent::Opened {
                symbol: symbol.to_string(),
                qty: delta_qty,
                price: fill_price,
            });
        } else if old_qty.signum() == delta_qty.signum() {
            // Increase: quantity-weighted average entry, leverage unchanged.
            let total = old_qty.abs() + delta_qty.abs();
            position.avg_entry =
                (old_qty.abs() * position.avg_entry + delta_qty.abs() * fill_price) / total;
            position.qty = new_qty;
            events.push(LedgerEvent::Increased {
                symbol: symbol.to_string(),
                qty: delta_qty,
                price: fill_price,
            });
        } else {
            // Close against the existing side, possibly flipping through zero.
            let close_qty = delta_qty.abs().min(old_qty.abs());
            let pnl = close_qty * (fill_price - position.avg_entry) * old_qty.signum();
            let realization = Realization {
                symbol: symbol.to_string(),
                qty: close_qty,
                entry_price: position.avg_entry,
                exit_price: fill_price,
                pnl,
                timestamp: now,
            };
            realized += pnl;
            self.realized_pl += pnl;
            self.cash += pnl;

            if new_qty.abs() < QTY_EPSILON {
                // Full close.
                *position = Position::flat(symbol);
                events.push(LedgerEvent::Closed(realization));
            } else if new_qty.signum() == old_qty.signum() {
                // Partial close: average entry and leverage unchanged.
                position.qty = new_qty;
                events.push(LedgerEvent::Reduced(realization));
            } else {
                // Flip: full close of the old side, then open the remainder
                // on the opposite side at the same price.
                events.push(LedgerEvent::Closed(realization));
                position.qty = new_qty;
                position.avg_entry = fill_price;
                position.leverage = leverage;
                position.entry_time = Some(now);
                position.exit_plan = None;
                events.push(LedgerEvent::Opened {
                    symbol: symbol.to_string(),
                    qty: new_qty,
                    price: fill_price,
                });
            }
        }

        self.cash -= fee;
        self.fees += fee;

        let outcome = FillOutcome {
            position: self.positions.get(symbol).cloned().unwrap_or_else(|| Position::flat(symbol)),
            events,
            realized_pl: realized,
        };
        debug!(
            symbol,
            delta_qty,
            fill_price,
            fee,
            realized,
            qty = outcome.position.qty,
            "fill applied"
        );
        self.assert_consistent();
        Ok(outcome)
    }

    /// Settle a funding payment into cash. Positive amounts are received,
    /// negative amounts are paid.
    pub fn apply_funding(&mut self, amount: f64) {
        self.cash += amount;
        self.funding += amount;
        self.assert_consistent();
    }

    /// Cash must always equal initial cash plus realized P/L minus fees plus
    /// funding. Fails loudly in non-production builds if the books drift.
    fn assert_consistent(&self) {
        debug_assert!(
            (self.cash - (self.initial_cash + self.realized_pl - self.fees + self.funding)).abs()
                < 1e-6,
            "ledger cash identity violated: cash={} initial={} realized={} fees={} funding={}",
            self.cash,
            self.initial_cash,
            self.realized_pl,
            self.fees,
            self.funding,
        );
    }
}
