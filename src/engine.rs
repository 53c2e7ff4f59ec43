//! # Cycle Engine
//!
//! Drives one strategy version through its decision cycles: build the
//! observation, collect decisions from the external source (timing out to
//! hold), simulate and apply fills serially in decision order, sweep for
//! liquidations, settle funding on its own cadence, write the equity
//! snapshot and periodically recompute reconciliation-backed analytics.
//!
//! Cycles never overlap: `run` awaits each cycle before the next interval
//! tick fires. Within a cycle, one symbol's failure is isolated from the
//! others; fills already applied stay applied and the error text is
//! re-delivered to the decision source on the next observation.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::analytics::{DailyReturnPolicy, VersionPerformance};
use crate::config::SimConfig;
use crate::decision::{DecisionKind, DecisionValidator, PositionDecision};
use crate::errors::{PerpArenaError, Result};
use crate::execution::FillSimulator;
use crate::funding::{FundingEngine, FundingPayment};
use crate::leaderboard::{self, LeaderboardEntry};
use crate::ledger::{Ledger, LedgerEvent, Position, QTY_EPSILON};
use crate::margin::{LiquidationEvent, MarginEvaluator};
use crate::market::{MarketBoard, MarketTick, MarketView};
use crate::reconciler::{round_trips, RoundTrip};
use crate::store::{ArenaStore, EquitySnapshot, ExitReason, FillRecord};
use crate::version::{VersionId, VersionRegistry};

/// Platform limits echoed to the decision source.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Limits {
    pub min_notional: f64,
    pub max_leverage: f64,
    pub im: f64,
    pub mm: f64,
}

/// Read view of one open position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionView {
    pub symbol: String,
    pub qty: f64,
    pub avg_entry: f64,
    pub current_price: f64,
    pub unrealized_pl: f64,
    pub leverage: f64,
    pub entry_time: Option<DateTime<Utc>>,
    pub holding_minutes: Option<i64>,
    pub exit_plan: Option<crate::ledger::ExitPlan>,
}

/// Read view of the account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountView {
    pub equity: f64,
    /// Total collateral balance.
    pub cash: f64,
    pub used_margin: f64,
    pub available_margin: f64,
    pub unrealized_pl: f64,
    pub realized_pl: f64,
    pub fees_paid: f64,
    pub funding_net: f64,
    pub positions: Vec<PositionView>,
}

/// Everything the decision source sees each cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub timestamp: DateTime<Utc>,
    pub cycle: u64,
    pub markets: Vec<MarketView>,
    pub account: AccountView,
    pub limits: Limits,
    /// Errors from the previous cycle, re-delivered as plain text.
    pub last_error: String,
}

/// External decision source, invoked once per cycle.
#[async_trait]
pub trait DecisionSource: Send {
    async fn decide(&mut self, observation: &Observation) -> Result<Vec<PositionDecision>>;
}

/// Outcome summary of one cycle.
#[derive(Debug, Clone)]
pub struct CycleReport {
    pub cycle: u64,
    pub timestamp: DateTime<Utc>,
    pub fills: Vec<FillRecord>,
    pub liquidations: Vec<LiquidationEvent>,
    pub funding_payments: Vec<FundingPayment>,
    /// Per-symbol errors; other symbols' fills stand regardless.
    pub errors: Vec<String>,
    pub equity: f64,
}

/// State for the currently active version.
struct ActiveVersion {
    id: VersionId,
    config: SimConfig,
    ledger: Ledger,
    simulator: FillSimulator,
    margin: MarginEvaluator,
    funding: FundingEngine,
    validator: DecisionValidator,
    cycle_count: u64,
    last_funding_run: Option<DateTime<Utc>>,
}

/// The simulation arena: version registry, record store, market cache and
/// the live state of the active version. Multiple arenas can coexist in one
/// process; there is no global state.
pub struct ArenaEngine {
    registry: VersionRegistry,
    store: ArenaStore,
    board: MarketBoard,
    active: Option<ActiveVersion>,
    last_error: String,
    return_policy: DailyReturnPolicy,
}

impl ArenaEngine {
    pub fn new() -> Self {
        Self {
            registry: VersionRegistry::new(),
            store: ArenaStore::new(),
            board: MarketBoard::new(),
            active: None,
            last_error: String::new(),
            return_policy: DailyReturnPolicy::default(),
        }
    }

    /// Select the daily-return averaging policy used by analytics.
    pub fn with_return_policy(mut self, policy: DailyReturnPolicy) -> Self {
        self.return_policy = policy;
        self
    }

    /// Deploy a new version: finalize the outgoing version's performance,
    /// retire it, and start the new one on a fresh ledger with the frozen
    /// configuration.
    pub fn deploy(
        &mut self,
        tag: &str,
        description: &str,
        config: SimConfig,
        now: DateTime<Utc>,
    ) -> Result<VersionId> {
        let id = self.registry.deploy(tag, description, config.clone(), now)?;
        if let Some(outgoing) = self.active.take() {
            self.recompute_performance(outgoing.id, now);
        }

        self.active = Some(ActiveVersion {
            id,
            ledger: Ledger::new(config.initial_cash, config.max_position_notional),
            simulator: FillSimulator::new(&config),
            margin: MarginEvaluator::new(&config),
            funding: FundingEngine::new(&config),
            validator: DecisionValidator::new(config.max_leverage),
            config,
            cycle_count: 0,
            last_funding_run: None,
        });
        self.last_error.clear();
        info!(tag, "arena switched to new version");
        Ok(id)
    }

    /// Feed one market tick into the engine.
    pub fn on_market_tick(&mut self, tick: MarketTick) {
        if let Some(active) = &mut self.active {
            if let Some(mark) = mark_of(&tick) {
                active.funding.observe_mark(&tick.symbol, mark);
            }
        }
        self.board.update(tick);
    }

    pub fn registry(&self) -> &VersionRegistry {
        &self.registry
    }

    pub fn store(&self) -> &ArenaStore {
        &self.store
    }

    pub fn last_error(&self) -> &str {
        &self.last_error
    }

    /// Open positions of the active version.
    pub fn positions(&self) -> Vec<&Position> {
        self.active
            .as_ref()
            .map(|a| a.ledger.open_positions().collect())
            .unwrap_or_default()
    }

    /// Round trips reconstructed from the active version's fill log up to
    /// `now`. Errors surface as the reconciler reports them.
    pub fn round_trips(&self, now: DateTime<Utc>) -> Result<Vec<RoundTrip>> {
        let active = self.active.as_ref().ok_or(PerpArenaError::NoActiveVersion)?;
        let fills = self.store.fills_up_to(active.id, now);
        round_trips(&fills).collect()
    }

    /// Build the observation for the decision source.
    pub fn observation(&self, now: DateTime<Utc>) -> Result<Observation> {
        let active = self.active.as_ref().ok_or(PerpArenaError::NoActiveVersion)?;
        let marks = self.board.marks();

        let positions = active
            .ledger
            .open_positions()
            .map(|p| {
                let current_price = marks.get(&p.symbol).copied().unwrap_or(p.avg_entry);
                PositionView {
                    symbol: p.symbol.clone(),
                    qty: p.qty,
                    avg_entry: p.avg_entry,
                    current_price,
                    unrealized_pl: p.unrealized_pl(current_price),
                    leverage: p.leverage,
                    entry_time: p.entry_time,
                    holding_minutes: p.entry_time.map(|t| (now - t).num_minutes()),
                    exit_plan: p.exit_plan.clone(),
                }
            })
            .collect();

        let account = AccountView {
            equity: active.ledger.equity(&marks),
            cash: active.ledger.cash(),
            used_margin: active.ledger.used_margin(&marks),
            available_margin: active.ledger.available_margin(&marks),
            unrealized_pl: active.ledger.unrealized_pl(&marks),
            realized_pl: active.ledger.realized_pl(),
            fees_paid: active.ledger.fees_paid(),
            funding_net: active.ledger.funding_net(),
            positions,
        };

        let mut markets: Vec<MarketView> = self
            .board
            .views()
            .filter(|v| active.config.symbols.contains(&v.symbol))
            .cloned()
            .collect();
        markets.sort_by(|a, b| a.symbol.cmp(&b.symbol));

        Ok(Observation {
            timestamp: now,
            cycle: active.cycle_count,
            markets,
            account,
            limits: Limits {
                min_notional: active.config.min_notional,
                max_leverage: active.config.max_leverage,
                im: active.config.im,
                mm: active.config.mm,
            },
            last_error: self.last_error.clone(),
        })
    }

    /// Run one full decision cycle at `now`.
    ///
    /// A decision-source timeout or failure degrades to hold. A validation
    /// failure of the whole batch mutates nothing. Per-symbol execution
    /// errors are collected, isolated, and re-delivered next cycle.
    pub async fn run_cycle(
        &mut self,
        source: &mut (dyn DecisionSource + Send),
        now: DateTime<Utc>,
    ) -> Result<CycleReport> {
        let observation = self.observation(now)?;
        let timeout = std::time::Duration::from_secs(
            self.active
                .as_ref()
                .map(|a| a.config.decision_timeout_secs)
                .unwrap_or(30),
        );

        let mut source_error = None;
        let decisions = match tokio::time::timeout(timeout, source.decide(&observation)).await {
            Ok(Ok(decisions)) => decisions,
            Ok(Err(err)) => {
                warn!(%err, "decision source failed; holding all positions");
                source_error = Some(format!("decision source error: {err}"));
                Vec::new()
            }
            Err(_) => {
                warn!("decision source timed out; holding all positions");
                source_error = Some("decision source timed out".to_string());
                Vec::new()
            }
        };

        let mut report = self.apply_cycle(&decisions, now)?;
        if let Some(message) = source_error {
            report.errors.insert(0, message);
            self.last_error = report.errors.join("; ");
        }
        Ok(report)
    }

    /// Apply an already-collected decision batch (the synchronous core of
    /// [`ArenaEngine::run_cycle`]).
    pub fn apply_cycle(
        &mut self,
        decisions: &[PositionDecision],
        now: DateTime<Utc>,
    ) -> Result<CycleReport> {
        let active = self.active.as_mut().ok_or(PerpArenaError::NoActiveVersion)?;
        let mut errors = Vec::new();
        let mut fills = Vec::new();

        if let Err(err) = active.validator.validate_batch(decisions) {
            errors.push(err.to_string());
        } else {
            // Serial application in decision order: the ledger is a single
            // mutable resource and fills must not reorder.
            for decision in decisions {
                match Self::execute_decision(active, &mut self.store, &self.board, decision, now) {
                    Ok(mut new_fills) => fills.append(&mut new_fills),
                    Err(err) => {
                        warn!(symbol = %decision.symbol, %err, "decision rejected");
                        errors.push(format!("{}: {err}", decision.symbol));
                    }
                }
            }
        }

        // Forced closes run strictly after ordinary fills.
        let marks = self.board.marks();
        let liquidations =
            active
                .margin
                .sweep(&mut active.ledger, &active.simulator, &marks, now)?;
        for event in &liquidations {
            self.store.append_fill(FillRecord {
                version: active.id,
                symbol: event.symbol.clone(),
                side: event.side,
                qty: event.qty,
                price: event.price,
                fee: event.fee,
                timestamp: event.timestamp,
                entry_reason: None,
                exit_reason: Some(ExitReason::Liquidation),
                client_id: None,
            });
        }

        let funding_payments = if due(active.last_funding_run, now, active.config.funding_interval_secs)
        {
            active.last_funding_run = Some(now);
            active.funding.settle(&mut active.ledger, &self.board, now)
        } else {
            Vec::new()
        };

        let equity = active.ledger.equity(&marks);
        self.store.upsert_snapshot(EquitySnapshot {
            version: active.id,
            timestamp: now,
            equity,
            cash: active.ledger.cash(),
            unrealized_pl: active.ledger.unrealized_pl(&marks),
            realized_pl: active.ledger.realized_pl(),
            fees: active.ledger.fees_paid(),
            funding: active.ledger.funding_net(),
        });

        active.cycle_count += 1;
        let cycle = active.cycle_count;
        let id = active.id;
        if cycle % active.config.analytics_every_n_cycles == 0 {
            self.recompute_performance(id, now);
        }

        self.last_error = errors.join("; ");
        info!(
            cycle,
            fills = fills.len(),
            liquidations = liquidations.len(),
            equity,
            "cycle complete"
        );
        Ok(CycleReport {
            cycle,
            timestamp: now,
            fills,
            liquidations,
            funding_payments,
            errors,
            equity,
        })
    }

    /// Execute one validated decision against the active version.
    fn execute_decision(
        active: &mut ActiveVersion,
        store: &mut ArenaStore,
        board: &MarketBoard,
        decision: &PositionDecision,
        now: DateTime<Utc>,
    ) -> Result<Vec<FillRecord>> {
        // Replays of an already-executed idempotency key are a no-op.
        if let Some(client_id) = &decision.client_id {
            if store.client_id_seen(active.id, client_id) {
                return Ok(Vec::new());
            }
        }

        let symbol = decision.symbol.as_str();
        if matches!(decision.kind, DecisionKind::Hold) {
            if decision.exit_plan.is_some() {
                active.ledger.set_exit_plan(symbol, decision.exit_plan.clone());
            }
            return Ok(Vec::new());
        }

        let mark = board
            .mark(symbol)
            .ok_or_else(|| PerpArenaError::MarketDataNotAvailable(symbol.to_string()))?;

        let marks = board.marks();
        let current = active.ledger.position(symbol).cloned();
        let current_qty = current.as_ref().map(|p| p.qty).unwrap_or(0.0);
        if matches!(decision.kind, DecisionKind::Close) && current_qty.abs() < QTY_EPSILON {
            return Ok(Vec::new());
        }

        // Margin freed by replacing the current position backs the target.
        let freed = current.as_ref().map(|p| p.allocated_margin(mark)).unwrap_or(0.0);
        let effective_margin = active.ledger.available_margin(&marks) + freed;
        let equity = active.ledger.equity(&marks);

        let Some(target_qty) = decision.kind.target_qty(equity, effective_margin, mark) else {
            return Ok(Vec::new());
        };
        if (target_qty - current_qty).abs() < QTY_EPSILON {
            return Ok(Vec::new());
        }

        let leverage = decision
            .kind
            .leverage()
            .or(current.as_ref().map(|p| p.leverage))
            .unwrap_or(1.0);

        let fill = active.simulator.simulate(
            symbol,
            target_qty,
            current_qty,
            mark,
            leverage,
            effective_margin,
            now,
        )?;
        let outcome = active.ledger.apply_fill(
            symbol,
            fill.delta_qty,
            fill.price,
            fill.fee,
            leverage,
            now,
        )?;
        if decision.exit_plan.is_some() {
            active.ledger.set_exit_plan(symbol, decision.exit_plan.clone());
        }

        // One record per accounting event: a flip lands as a close and an
        // open, with the fee split by quantity.
        let mut records = Vec::with_capacity(outcome.events.len());
        for (index, event) in outcome.events.iter().enumerate() {
            let (qty, exit_reason) = match event {
                LedgerEvent::Opened { qty, .. } | LedgerEvent::Increased { qty, .. } => {
                    (qty.abs(), None)
                }
                LedgerEvent::Reduced(r) | LedgerEvent::Closed(r) => {
                    (r.qty, Some(ExitReason::Strategy))
                }
            };
            let record = FillRecord {
                version: active.id,
                symbol: symbol.to_string(),
                side: fill.side,
                qty,
                price: fill.price,
                fee: fill.fee * qty / fill.qty,
                timestamp: now,
                entry_reason: (exit_reason.is_none() && !decision.justification.is_empty())
                    .then(|| decision.justification.clone()),
                exit_reason,
                client_id: (index == 0).then(|| decision.client_id.clone()).flatten(),
            };
            store.append_fill(record.clone());
            records.push(record);
        }
        Ok(records)
    }

    /// Recompute and upsert a version's performance from a consistent
    /// snapshot of its records up to `now`. A reconciliation inconsistency
    /// marks the result degraded instead of silently dropping it.
    pub fn recompute_performance(&mut self, version: VersionId, now: DateTime<Utc>) {
        let Some(record) = self.registry.get(version) else {
            return;
        };
        let period_start = record.deployed_at;
        let period_end = record.retired_at.unwrap_or(now);

        let fills = self.store.fills_up_to(version, now);
        let mut trips = Vec::new();
        let mut degraded = false;
        for item in round_trips(&fills) {
            match item {
                Ok(trip) => trips.push(trip),
                Err(err) => {
                    error!(%version, %err, "fill log failed reconciliation; analytics degraded");
                    degraded = true;
                    break;
                }
            }
        }

        let snapshots = self.store.snapshots(version);
        let mut performance = VersionPerformance::compute(
            version,
            period_start,
            period_end,
            &snapshots,
            &trips,
            self.return_policy,
        );
        performance.degraded = degraded;
        self.store.upsert_performance(performance);
    }

    /// Ranked leaderboard over every version with computed performance.
    pub fn leaderboard(&self, min_duration: Duration, now: DateTime<Utc>) -> Vec<LeaderboardEntry> {
        leaderboard::rank(
            &self.registry,
            &self.store.all_performance(),
            min_duration,
            now,
        )
    }

    /// Drive cycles on the configured cadence until `shutdown` flips true.
    ///
    /// Each cycle completes before the next is allowed to start; a missed
    /// tick delays rather than bursts.
    pub async fn run(
        &mut self,
        source: &mut (dyn DecisionSource + Send),
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        let secs = self
            .active
            .as_ref()
            .ok_or(PerpArenaError::NoActiveVersion)?
            .config
            .cycle_interval_secs;
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(secs));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(err) = self.run_cycle(source, Utc::now()).await {
                        error!(%err, "cycle failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("engine shutting down");
                        return Ok(());
                    }
                }
            }
        }
    }
}

impl Default for ArenaEngine {
    fn default() -> Self {
        Self::new()
    }
}

fn mark_of(tick: &MarketTick) -> Option<f64> {
    let mark = (tick.best_bid + tick.best_ask) / 2.0;
    (mark > 0.0).then_some(mark)
}

fn due(last: Option<DateTime<Utc>>, now: DateTime<Utc>, interval_secs: u64) -> bool {
    match last {
        None => true,
        Some(last) => (now - last).num_seconds() >= interval_secs as i64,
    }
}
