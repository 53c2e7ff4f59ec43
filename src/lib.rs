//! Perpetual-futures paper-trading arena.
//!
//! This crate simulates perpetual-futures trading against live market
//! prices: a per-version [`Ledger`](ledger::Ledger) of cash, positions,
//! fees and funding; a [`FillSimulator`](execution::FillSimulator) applying
//! slippage and fees to target-position decisions; a maintenance-margin
//! [`MarginEvaluator`](margin::MarginEvaluator) that force-closes
//! under-margined positions; FIFO trade reconciliation; and per-version
//! performance analytics feeding a leaderboard of strategy deployments.
//!
//! The decision source, market-data feed, dashboard and durable persistence
//! are external collaborators; their boundaries are the
//! [`DecisionSource`](engine::DecisionSource) trait,
//! [`MarketTick`](market::MarketTick) inputs and the
//! [`ArenaStore`](store::ArenaStore) read surface.

pub mod analytics;
pub mod config;
pub mod decision;
pub mod engine;
pub mod errors;
pub mod execution;
pub mod funding;
pub mod leaderboard;
pub mod ledger;
pub mod margin;
pub mod market;
pub mod reconciler;
pub mod store;
pub mod version;


/// Convenient re-export of the most common items used when writing examples or tests.
pub mod prelude {
    pub use crate::analytics::{DailyReturnPolicy, VersionPerformance};
    pub use crate::config::{FundingMode, SimConfig};
    pub use crate::decision::{DecisionKind, PositionDecision};
    pub use crate::engine::{ArenaEngine, CycleReport, DecisionSource, Observation};
    pub use crate::errors::{PerpArenaError, Result};
    pub use crate::execution::{FillSimulator, SimulatedFill};
    pub use crate::funding::{FundingEngine, FundingPayment};
    pub use crate::leaderboard::LeaderboardEntry;
    pub use crate::ledger::{ExitPlan, Ledger, Position, Side};
    pub use crate::margin::{LiquidationEvent, MarginEvaluator};
    pub use crate::market::{MarketBoard, MarketTick};
    pub use crate::reconciler::{reconcile, round_trips, RoundTrip};
    pub use crate::store::{ArenaStore, EquitySnapshot, FillRecord};
    pub use crate::version::{VersionId, VersionRegistry};
}
