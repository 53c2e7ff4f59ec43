//! # Simulation Configuration
//!
//! Parameters governing margin, fees, slippage, funding and cycle cadence.
//! A configuration is snapshotted into each deployed version and stays
//! immutable for that version's whole activity interval; changing any value
//! means deploying a new version.

use serde::{Deserialize, Serialize};

use crate::errors::{PerpArenaError, Result};

/// How funding rates are determined each settlement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FundingMode {
    /// No funding: the rate is always zero.
    None,
    /// Sign follows recent price momentum against a 24-period EMA.
    Heuristic,
    /// Rates supplied per symbol by the market-data collaborator.
    ExternalFeed,
}

impl std::fmt::Display for FundingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FundingMode::None => write!(f, "none"),
            FundingMode::Heuristic => write!(f, "heuristic"),
            FundingMode::ExternalFeed => write!(f, "external_feed"),
        }
    }
}

/// Configuration for the perpetual-futures simulator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimConfig {
    /// Initial margin ratio
    pub im: f64,

    /// Maintenance margin ratio; must be strictly below `im`
    pub mm: f64,

    /// Maximum leverage accepted on a decision
    pub max_leverage: f64,

    /// Taker slippage in basis points, always worsening the fill price
    pub slippage_bps: f64,

    /// Taker fee in basis points
    pub fee_bps: f64,

    /// Liquidation penalty in basis points applied to forced closes
    pub liq_penalty_bps: f64,

    /// Minimum order notional in quote currency
    pub min_notional: f64,

    /// Cap on a single position's notional; `None` means unlimited
    pub max_position_notional: Option<f64>,

    /// Funding mode
    pub funding_mode: FundingMode,

    /// Funding rate magnitude for the heuristic mode, in bps per 8h
    pub heuristic_funding_bps: f64,

    /// Starting cash for each freshly deployed version
    pub initial_cash: f64,

    /// Symbol universe the engine trades
    pub symbols: Vec<String>,

    /// Seconds between decision cycles
    pub cycle_interval_secs: u64,

    /// Seconds to wait on the decision source before defaulting to hold
    pub decision_timeout_secs: u64,

    /// Seconds between funding settlements
    pub funding_interval_secs: u64,

    /// Recompute reconciliation and performance every N cycles
    pub analytics_every_n_cycles: u64,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            im: 0.05,                  // 5% initial margin
            mm: 0.03,                  // 3% maintenance margin
            max_leverage: 20.0,
            slippage_bps: 1.0,
            fee_bps: 2.0,
            liq_penalty_bps: 5.0,
            min_notional: 5.0,
            max_position_notional: None,
            funding_mode: FundingMode::None,
            heuristic_funding_bps: 1.0, // +/- 0.01% per 8h
            initial_cash: 10_000.0,
            symbols: vec!["BTC-USD".to_string(), "ETH-USD".to_string()],
            cycle_interval_secs: 60,
            decision_timeout_secs: 30,
            funding_interval_secs: 60,
            analytics_every_n_cycles: 10,
        }
    }
}

impl SimConfig {
    /// Create a configuration with the given starting cash and defaults for
    /// everything else.
    pub fn new(initial_cash: f64) -> Self {
        Self {
            initial_cash,
            ..Self::default()
        }
    }

    /// Set the margin ratios.
    pub fn with_margins(mut self, im: f64, mm: f64) -> Self {
        self.im = im;
        self.mm = mm;
        self
    }

    /// Set the maximum leverage.
    pub fn with_max_leverage(mut self, max_leverage: f64) -> Self {
        self.max_leverage = max_leverage;
        self
    }

    /// Set slippage and taker fee in basis points.
    pub fn with_costs(mut self, slippage_bps: f64, fee_bps: f64) -> Self {
        self.slippage_bps = slippage_bps;
        self.fee_bps = fee_bps;
        self
    }

    /// Set the funding mode.
    pub fn with_funding_mode(mut self, mode: FundingMode) -> Self {
        self.funding_mode = mode;
        self
    }

    /// Replace the symbol universe.
    pub fn with_symbols<S: Into<String>>(mut self, symbols: Vec<S>) -> Self {
        self.symbols = symbols.into_iter().map(Into::into).collect();
        self
    }

    /// Validate the parameter set before it is frozen into a version.
    pub fn validate(&self) -> Result<()> {
        if self.initial_cash <= 0.0 {
            return Err(PerpArenaError::config_error(
                "initial cash must be positive",
            ));
        }
        if !(0.0 < self.mm && self.mm < self.im) {
            return Err(PerpArenaError::config_error(format!(
                "maintenance margin {} must be positive and below initial margin {}",
                self.mm, self.im
            )));
        }
        if self.max_leverage < 1.0 {
            return Err(PerpArenaError::config_error(
                "max leverage must be at least 1",
            ));
        }
        if self.slippage_bps < 0.0 || self.fee_bps < 0.0 || self.liq_penalty_bps < 0.0 {
            return Err(PerpArenaError::config_error(
                "slippage, fee and liquidation penalty must be non-negative",
            ));
        }
        if self.min_notional < 0.0 {
            return Err(PerpArenaError::config_error(
                "minimum notional must be non-negative",
            ));
        }
        if self.symbols.is_empty() {
            return Err(PerpArenaError::config_error("symbol universe is empty"));
        }
        if self.cycle_interval_secs == 0 {
            return Err(PerpArenaError::config_error(
                "cycle interval must be non-zero",
            ));
        }
        if self.analytics_every_n_cycles == 0 {
            return Err(PerpArenaError::config_error(
                "analytics cadence must be non-zero",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(SimConfig::default().validate().is_ok());
    }

    #[test]
    fn margin_ordering_is_enforced() {
        let config = SimConfig::default().with_margins(0.03, 0.05);
        assert!(config.validate().is_err());

        let config = SimConfig::default().with_margins(0.05, 0.05);
        assert!(config.validate().is_err());
    }

    #[test]
    fn builder_chains() {
        let config = SimConfig::new(25_000.0)
            .with_max_leverage(10.0)
            .with_costs(2.0, 5.0)
            .with_funding_mode(FundingMode::Heuristic)
            .with_symbols(vec!["SOL-USD"]);
        assert_eq!(config.initial_cash, 25_000.0);
        assert_eq!(config.max_leverage, 10.0);
        assert_eq!(config.symbols, vec!["SOL-USD"]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn funding_mode_round_trips_through_serde() {
        let json = serde_json::to_string(&FundingMode::ExternalFeed).unwrap();
        assert_eq!(json, "\"external_feed\"");
        let mode: FundingMode = serde_json::from_str(&json).unwrap();
        assert_eq!(mode, FundingMode::ExternalFeed);
    }
}
