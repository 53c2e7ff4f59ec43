//! # Fill Simulator
//!
//! Turns a target-position decision plus a mark price into a simulated fill
//! under the configured slippage and fee parameters. The simulator never
//! mutates the ledger; the caller applies the returned descriptor, which
//! keeps simulation and bookkeeping independently testable.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::SimConfig;
use crate::errors::{PerpArenaError, Result};
use crate::ledger::{Position, Side};

/// A simulated taker fill ready to be applied to the ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulatedFill {
    pub symbol: String,
    pub side: Side,
    /// Unsigned fill quantity.
    pub qty: f64,
    /// Signed quantity delta this fill applies to the position.
    pub delta_qty: f64,
    /// Execution price after slippage (or liquidation penalty).
    pub price: f64,
    pub fee: f64,
    /// Cost of price adjustment versus the raw mark, for reporting.
    pub slippage_cost: f64,
    pub timestamp: DateTime<Utc>,
}

/// Stateless fill pricing over a frozen configuration.
#[derive(Debug, Clone)]
pub struct FillSimulator {
    slippage_bps: f64,
    fee_bps: f64,
    min_notional: f64,
    max_leverage: f64,
    liq_penalty_bps: f64,
}

impl FillSimulator {
    pub fn new(config: &SimConfig) -> Self {
        Self {
            slippage_bps: config.slippage_bps,
            fee_bps: config.fee_bps,
            min_notional: config.min_notional,
            max_leverage: config.max_leverage,
            liq_penalty_bps: config.liq_penalty_bps,
        }
    }

    /// Simulate the fill that moves `current_qty` to `target_qty`.
    ///
    /// `available_margin` is the margin available to back the resulting
    /// position, including whatever the current position would free up.
    /// Slippage always worsens the taker's price. Rejections are
    /// distinguishable: leverage bounds, minimum notional, and initial
    /// margin each map to their own error kind.
    pub fn simulate(
        &self,
        symbol: &str,
        target_qty: f64,
        current_qty: f64,
        mark_price: f64,
        leverage: f64,
        available_margin: f64,
        now: DateTime<Utc>,
    ) -> Result<SimulatedFill> {
        if !(1.0..=self.max_leverage).contains(&leverage) {
            return Err(PerpArenaError::LeverageOutOfBounds {
                requested: leverage,
                max: self.max_leverage,
            });
        }
        if !mark_price.is_finite() || mark_price <= 0.0 {
            return Err(PerpArenaError::MarketDataNotAvailable(symbol.to_string()));
        }

        let delta = target_qty - current_qty;
        let delta_notional = delta.abs() * mark_price;
        if delta_notional < self.min_notional {
            return Err(PerpArenaError::BelowMinNotional {
                notional: delta_notional,
                min_notional: self.min_notional,
            });
        }

        let required_margin = target_qty.abs() * mark_price / leverage;
        if required_margin > available_margin {
            return Err(PerpArenaError::InsufficientMargin {
                required: required_margin,
                available: available_margin,
            });
        }

        let side = if delta > 0.0 { Side::Buy } else { Side::Sell };
        let price = mark_price * (1.0 + side.sign() * self.slippage_bps / 10_000.0);
        let fee = delta.abs() * price * self.fee_bps / 10_000.0;
        let fill = SimulatedFill {
            symbol: symbol.to_string(),
            side,
            qty: delta.abs(),
            delta_qty: delta,
            price,
            fee,
            slippage_cost: delta.abs() * (price - mark_price).abs(),
            timestamp: now,
        };
        debug!(symbol, delta, price, fee, "fill simulated");
        Ok(fill)
    }

    /// Simulate the forced close of a position at the liquidation price.
    ///
    /// The penalty worsens the close price in the direction unfavorable to
    /// the position holder. Policy checks (minimum notional, margin) do not
    /// apply: a liquidation executes unconditionally.
    pub fn simulate_forced_close(
        &self,
        position: &Position,
        mark_price: f64,
        now: DateTime<Utc>,
    ) -> SimulatedFill {
        let side = Side::closing(position.qty);
        // Longs are closed below the mark, shorts above it.
        let price = mark_price * (1.0 + side.sign() * self.liq_penalty_bps / 10_000.0);
        let qty = position.qty.abs();
        SimulatedFill {
            symbol: position.symbol.clone(),
            side,
            qty,
            delta_qty: -position.qty,
            price,
            fee: qty * price * self.fee_bps / 10_000.0,
            slippage_cost: qty * (price - mark_price).abs(),
            timestamp: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SimConfig;

    fn simulator() -> FillSimulator {
        FillSimulator::new(&SimConfig::default())
    }

    #[test]
    fn slippage_worsens_price_on_both_sides() {
        let sim = simulator();
        let now = Utc::now();

        let buy = sim
            .simulate("BTC-USD", 1.0, 0.0, 10_000.0, 2.0, 1_000_000.0, now)
            .unwrap();
        assert!(buy.price > 10_000.0);
        assert_eq!(buy.side, Side::Buy);

        let sell = sim
            .simulate("BTC-USD", -1.0, 0.0, 10_000.0, 2.0, 1_000_000.0, now)
            .unwrap();
        assert!(sell.price < 10_000.0);
        assert_eq!(sell.side, Side::Sell);
    }

    #[test]
    fn fee_scales_with_fill_notional() {
        let sim = simulator();
        let fill = sim
            .simulate("BTC-USD", 2.0, 0.0, 10_000.0, 2.0, 1_000_000.0, Utc::now())
            .unwrap();
        let expected = 2.0 * fill.price * 2.0 / 10_000.0;
        assert!((fill.fee - expected).abs() < 1e-9);
    }

    #[test]
    fn tiny_deltas_are_rejected_below_min_notional() {
        let sim = simulator();
        let err = sim
            .simulate("BTC-USD", 0.00001, 0.0, 100.0, 2.0, 1_000_000.0, Utc::now())
            .unwrap_err();
        assert!(matches!(err, PerpArenaError::BelowMinNotional { .. }));
    }

    #[test]
    fn leverage_bounds_are_rejected_distinctly() {
        let sim = simulator();
        for leverage in [0.5, 21.0] {
            let err = sim
                .simulate("BTC-USD", 1.0, 0.0, 100.0, leverage, 1_000_000.0, Utc::now())
                .unwrap_err();
            assert!(matches!(err, PerpArenaError::LeverageOutOfBounds { .. }));
        }
    }

    #[test]
    fn margin_shortfall_is_rejected_distinctly() {
        let sim = simulator();
        // 1 BTC at 10k on 2x needs 5k margin; only 1k available.
        let err = sim
            .simulate("BTC-USD", 1.0, 0.0, 10_000.0, 2.0, 1_000.0, Utc::now())
            .unwrap_err();
        assert!(matches!(err, PerpArenaError::InsufficientMargin { .. }));
    }

    #[test]
    fn forced_close_penalizes_against_the_holder() {
        let sim = simulator();
        let now = Utc::now();
        let mut long = Position {
            symbol: "BTC-USD".to_string(),
            qty: 1.0,
            avg_entry: 10_000.0,
            leverage: 2.0,
            entry_time: Some(now),
            exit_plan: None,
        };

        let close = sim.simulate_forced_close(&long, 9_000.0, now);
        assert_eq!(close.side, Side::Sell);
        assert!(close.price < 9_000.0);
        assert_eq!(close.delta_qty, -1.0);

        long.qty = -1.0;
        let close = sim.simulate_forced_close(&long, 9_000.0, now);
        assert_eq!(close.side, Side::Buy);
        assert!(close.price > 9_000.0);
        assert_eq!(close.delta_qty, 1.0);
    }
}
