//! Market data boundary.
//!
//! Ingestion itself lives outside the crate; a feed pushes [`MarketTick`]s
//! and the engine reads derived [`MarketView`]s (mark price, spread, funding
//! rate) from the [`MarketBoard`] cache.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// One top-of-book update delivered by the external feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketTick {
    pub symbol: String,
    pub best_bid: f64,
    pub best_ask: f64,
    pub timestamp: DateTime<Utc>,
}

impl MarketTick {
    pub fn new(symbol: &str, best_bid: f64, best_ask: f64, timestamp: DateTime<Utc>) -> Self {
        Self {
            symbol: symbol.to_string(),
            best_bid,
            best_ask,
            timestamp,
        }
    }
}

/// Cached per-symbol market state derived from the latest tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketView {
    pub symbol: String,
    pub best_bid: f64,
    pub best_ask: f64,
    /// Mid price used as the mark for margining and fills.
    pub mark: f64,
    pub spread_bps: f64,
    /// Funding rate per 8h from the external feed, when one is wired.
    pub funding_rate_8h: Option<f64>,
    pub timestamp: DateTime<Utc>,
}

/// Latest market view per symbol.
#[derive(Debug, Clone, Default)]
pub struct MarketBoard {
    views: HashMap<String, MarketView>,
}

impl MarketBoard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Absorb a tick, deriving mark and spread. Preserves any externally
    /// supplied funding rate for the symbol.
    pub fn update(&mut self, tick: MarketTick) {
        let mark = (tick.best_bid + tick.best_ask) / 2.0;
        let spread_bps = if mark > 0.0 {
            (tick.best_ask - tick.best_bid) / mark * 10_000.0
        } else {
            0.0
        };
        debug!(symbol = %tick.symbol, mark, "market view updated");

        let funding_rate_8h = self
            .views
            .get(&tick.symbol)
            .and_then(|v| v.funding_rate_8h);

        self.views.insert(
            tick.symbol.clone(),
            MarketView {
                symbol: tick.symbol,
                best_bid: tick.best_bid,
                best_ask: tick.best_ask,
                mark,
                spread_bps,
                funding_rate_8h,
                timestamp: tick.timestamp,
            },
        );
    }

    /// Record a funding rate delivered by an external feed.
    pub fn set_funding_rate(&mut self, symbol: &str, rate_8h: f64) {
        if let Some(view) = self.views.get_mut(symbol) {
            view.funding_rate_8h = Some(rate_8h);
        }
    }

    /// Latest view for a symbol, if any tick has arrived.
    pub fn view(&self, symbol: &str) -> Option<&MarketView> {
        self.views.get(symbol)
    }

    /// Mark price for a symbol, if available.
    pub fn mark(&self, symbol: &str) -> Option<f64> {
        self.views.get(symbol).map(|v| v.mark)
    }

    /// Snapshot of all current mark prices.
    pub fn marks(&self) -> HashMap<String, f64> {
        self.views
            .iter()
            .map(|(symbol, view)| (symbol.clone(), view.mark))
            .collect()
    }

    /// All cached views.
    pub fn views(&self) -> impl Iterator<Item = &MarketView> {
        self.views.values()
    }
}
