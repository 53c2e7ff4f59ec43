//! # Funding Settlement
//!
//! Periodic cash transfer simulating a perpetual contract's basis
//! convergence. Rates are quoted per 8h and prorated by the time elapsed
//! since each position's previous settlement, so the cadence can differ
//! from the decision cycle. By convention longs pay when the rate is
//! positive and shorts receive.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::{FundingMode, SimConfig};
use crate::ledger::Ledger;
use crate::market::MarketBoard;

/// Smoothing factor of the 24-period EMA behind the heuristic mode.
const EMA_ALPHA: f64 = 2.0 / 25.0;

const EIGHT_HOURS_SECS: f64 = 8.0 * 3600.0;

/// One settled funding transfer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FundingPayment {
    pub symbol: String,
    /// Signed position quantity at settlement time.
    pub position_qty: f64,
    /// Rate per 8h that was applied.
    pub funding_rate_8h: f64,
    /// Signed amount settled into cash. Positive values are income.
    pub payment_amount: f64,
    /// Mark price when the payment was settled.
    pub mark_price: f64,
    pub timestamp: DateTime<Utc>,
}

/// Funding rate derivation and settlement over one version's ledger.
#[derive(Debug, Clone)]
pub struct FundingEngine {
    mode: FundingMode,
    heuristic_bps: f64,
    ema: HashMap<String, f64>,
    last_settlement: HashMap<String, DateTime<Utc>>,
}

impl FundingEngine {
    pub fn new(config: &SimConfig) -> Self {
        Self {
            mode: config.funding_mode,
            heuristic_bps: config.heuristic_funding_bps,
            ema: HashMap::new(),
            last_settlement: HashMap::new(),
        }
    }

    /// Feed a mark price into the momentum EMA. Call once per cycle per
    /// symbol regardless of mode so a mode switch on the next version does
    /// not start cold.
    pub fn observe_mark(&mut self, symbol: &str, mark: f64) {
        self.ema
            .entry(symbol.to_string())
            .and_modify(|ema| *ema = EMA_ALPHA * mark + (1.0 - EMA_ALPHA) * *ema)
            .or_insert(mark);
    }

    /// Funding rate per 8h for a symbol under the configured mode.
    pub fn rate_8h(&self, symbol: &str, mark: f64, external_rate: Option<f64>) -> f64 {
        match self.mode {
            FundingMode::None => 0.0,
            FundingMode::Heuristic => {
                // Mark above the EMA reads as long pressure: longs pay.
                let ema = self.ema.get(symbol).copied().unwrap_or(mark);
                if mark > ema {
                    self.heuristic_bps / 10_000.0
                } else {
                    -self.heuristic_bps / 10_000.0
                }
            }
            FundingMode::ExternalFeed => external_rate.unwrap_or(0.0),
        }
    }

    /// Settle funding for every open position with a mark price.
    ///
    /// The first settlement for a position only records the baseline
    /// timestamp; subsequent settlements prorate the 8h rate over the
    /// elapsed interval.
    pub fn settle(
        &mut self,
        ledger: &mut Ledger,
        board: &MarketBoard,
        now: DateTime<Utc>,
    ) -> Vec<FundingPayment> {
        let open: Vec<(String, f64)> = ledger
            .open_positions()
            .map(|p| (p.symbol.clone(), p.qty))
            .collect();

        // Baselines for closed positions must not leak into the next open.
        self.last_settlement
            .retain(|symbol, _| open.iter().any(|(s, _)| s == symbol));

        let mut payments = Vec::new();
        for (symbol, qty) in open {
            let Some(view) = board.view(&symbol) else {
                continue;
            };
            let last = match self.last_settlement.insert(symbol.clone(), now) {
                Some(last) => last,
                None => continue,
            };
            let elapsed_secs = (now - last).num_seconds() as f64;
            if elapsed_secs <= 0.0 {
                continue;
            }

            let rate_8h = self.rate_8h(&symbol, view.mark, view.funding_rate_8h);
            if rate_8h == 0.0 {
                continue;
            }

            let notional = qty.abs() * view.mark;
            let payment = -qty.signum() * notional * rate_8h * elapsed_secs / EIGHT_HOURS_SECS;
            ledger.apply_funding(payment);

            info!(
                symbol = %symbol,
                rate_8h,
                payment,
                "funding settled"
            );
            payments.push(FundingPayment {
                symbol,
                position_qty: qty,
                funding_rate_8h: rate_8h,
                payment_amount: payment,
                mark_price: view.mark,
                timestamp: now,
            });
        }
        payments
    }
}
