//! End-to-end cycle behavior: decision to fill to snapshot, forced closes,
//! partial-failure isolation, timeouts and the leaderboard.

use chrono::{Duration, Utc};

use crate::config::SimConfig;
use crate::engine::ArenaEngine;
use crate::market::MarketTick;
use crate::store::ExitReason;
use crate::tests::mock_data::{
    buy, close, engine_at, sell, FailingSource, ScriptedSource, StalledSource,
};
use crate::version::VersionId;

fn fast_config() -> SimConfig {
    let mut config = SimConfig::default();
    config.decision_timeout_secs = 1;
    config
}

#[tokio::test]
async fn buy_decision_opens_a_position_and_writes_a_snapshot() {
    let now = Utc::now();
    let (mut engine, id) = engine_at("BTC-USD", 100.0, fast_config(), now);
    let mut source = ScriptedSource::new(vec![vec![buy("BTC-USD", 2.0)]]);

    let report = engine.run_cycle(&mut source, now).await.unwrap();
    assert!(report.errors.is_empty());
    assert_eq!(report.fills.len(), 1);
    // The source saw the account and market state before deciding.
    assert_eq!(source.observations.len(), 1);
    assert_eq!(source.observations[0].account.equity, 10_000.0);
    assert_eq!(source.observations[0].markets.len(), 1);

    let position = &engine.positions()[0];
    assert!(position.qty > 0.0);
    assert_eq!(position.leverage, 2.0);
    // Slippage worsened the entry above the mark.
    assert!(position.avg_entry > 100.0);

    let snapshots = engine.store().snapshots(id);
    assert_eq!(snapshots.len(), 1);
    let snapshot = snapshots[0];
    assert!(
        (snapshot.equity - (snapshot.cash + snapshot.unrealized_pl)).abs() < 1e-9,
        "equity must equal cash plus unrealized P/L at write time"
    );
}

#[tokio::test]
async fn one_symbol_error_does_not_roll_back_the_others() {
    let now = Utc::now();
    let (mut engine, _) = engine_at("BTC-USD", 100.0, fast_config(), now);
    // No market data ever arrives for ETH-USD.
    let mut source = ScriptedSource::new(vec![vec![
        buy("BTC-USD", 2.0),
        buy("ETH-USD", 2.0),
    ]]);

    let report = engine.run_cycle(&mut source, now).await.unwrap();
    assert_eq!(report.fills.len(), 1);
    assert_eq!(report.errors.len(), 1);
    assert!(report.errors[0].contains("ETH-USD"));
    assert_eq!(engine.positions().len(), 1);

    // The error text is re-delivered on the next observation.
    let observation = engine.observation(now + Duration::minutes(1)).unwrap();
    assert!(observation.last_error.contains("ETH-USD"));
}

#[tokio::test(start_paused = true)]
async fn stalled_decision_source_defaults_to_hold() {
    let now = Utc::now();
    let (mut engine, _) = engine_at("BTC-USD", 100.0, fast_config(), now);

    let report = engine.run_cycle(&mut StalledSource, now).await.unwrap();
    assert!(report.fills.is_empty());
    assert!(report.errors[0].contains("timed out"));
    assert!(engine.positions().is_empty());
    // The cycle still produced its snapshot.
    assert_eq!(engine.store().snapshots(VersionId(0)).len(), 1);
}

#[tokio::test]
async fn failing_decision_source_defaults_to_hold() {
    let now = Utc::now();
    let (mut engine, _) = engine_at("BTC-USD", 100.0, fast_config(), now);

    let report = engine.run_cycle(&mut FailingSource, now).await.unwrap();
    assert!(report.fills.is_empty());
    assert!(engine.last_error().contains("upstream model unavailable"));
}

#[tokio::test]
async fn flip_through_zero_writes_two_fill_records() {
    let now = Utc::now();
    let (mut engine, id) = engine_at("BTC-USD", 100.0, fast_config(), now);
    let mut source = ScriptedSource::new(vec![
        vec![buy("BTC-USD", 2.0)],
        vec![sell("BTC-USD", 2.0)],
    ]);

    engine.run_cycle(&mut source, now).await.unwrap();
    let report = engine
        .run_cycle(&mut source, now + Duration::minutes(1))
        .await
        .unwrap();

    // The flip is recorded as a close plus an open, not one merged fill.
    assert_eq!(report.fills.len(), 2);
    assert_eq!(report.fills[0].exit_reason, Some(ExitReason::Strategy));
    assert_eq!(report.fills[1].exit_reason, None);
    assert_eq!(engine.store().fills(id).len(), 3);
    assert!(engine.positions()[0].qty < 0.0);

    // The close and the remainder open share one price and timestamp.
    assert_eq!(report.fills[0].price, report.fills[1].price);
    assert_eq!(report.fills[0].timestamp, report.fills[1].timestamp);
}

#[tokio::test]
async fn under_margin_position_is_liquidated_and_tagged() {
    let now = Utc::now();
    let (mut engine, id) = engine_at("BTC-USD", 100.0, fast_config(), now);
    let mut source = ScriptedSource::new(vec![vec![buy("BTC-USD", 20.0)]]);

    engine.run_cycle(&mut source, now).await.unwrap();
    assert_eq!(engine.positions().len(), 1);

    // A 4% slide at 20x leaves the margin ratio under maintenance.
    let later = now + Duration::minutes(1);
    engine.on_market_tick(MarketTick::new("BTC-USD", 96.0, 96.0, later));
    let report = engine.run_cycle(&mut source, later).await.unwrap();

    assert_eq!(report.liquidations.len(), 1);
    assert!(report.liquidations[0].price < 96.0);
    assert!(engine.positions().is_empty());

    let fills = engine.store().fills(id);
    let forced = fills.last().unwrap();
    assert_eq!(forced.exit_reason, Some(ExitReason::Liquidation));
}

#[tokio::test]
async fn replayed_idempotency_key_does_not_double_execute() {
    let now = Utc::now();
    let (mut engine, id) = engine_at("BTC-USD", 100.0, fast_config(), now);

    let mut decision = buy("BTC-USD", 2.0);
    decision.client_id = Some("cycle-1-btc".to_string());
    let mut source = ScriptedSource::new(vec![
        vec![decision.clone()],
        vec![decision],
    ]);

    let first = engine.run_cycle(&mut source, now).await.unwrap();
    let second = engine
        .run_cycle(&mut source, now + Duration::minutes(1))
        .await
        .unwrap();

    assert_eq!(first.fills.len(), 1);
    assert!(second.fills.is_empty());
    assert!(second.errors.is_empty());
    assert_eq!(engine.store().fills(id).len(), 1);
}

#[tokio::test]
async fn round_trip_cycle_feeds_the_reconciler() {
    let now = Utc::now();
    let (mut engine, _) = engine_at("BTC-USD", 100.0, fast_config(), now);
    let mut source = ScriptedSource::new(vec![
        vec![buy("BTC-USD", 2.0)],
        vec![close("BTC-USD")],
    ]);

    engine.run_cycle(&mut source, now).await.unwrap();
    let later = now + Duration::minutes(1);
    engine.run_cycle(&mut source, later).await.unwrap();

    let trips = engine.round_trips(later).unwrap();
    assert_eq!(trips.len(), 1);
    assert!(trips[0].fees > 0.0);
    assert!(engine.positions().is_empty());
}

#[tokio::test]
async fn deploy_finalizes_the_outgoing_version_for_the_leaderboard() {
    let start = Utc::now();
    let (mut engine, first) = engine_at("BTC-USD", 100.0, fast_config(), start);
    let mut source = ScriptedSource::new(vec![
        vec![buy("BTC-USD", 2.0)],
        vec![close("BTC-USD")],
    ]);

    engine.run_cycle(&mut source, start).await.unwrap();
    engine
        .run_cycle(&mut source, start + Duration::minutes(1))
        .await
        .unwrap();

    let redeploy = start + Duration::hours(10);
    let second = engine
        .deploy("v-next", "successor", fast_config(), redeploy)
        .unwrap();
    // The fresh version starts on a clean ledger.
    assert!(engine.positions().is_empty());
    let mut hold = ScriptedSource::new(vec![]);
    engine.run_cycle(&mut hold, redeploy).await.unwrap();
    engine.recompute_performance(second, redeploy + Duration::hours(8));

    let board = engine.leaderboard(Duration::zero(), redeploy + Duration::hours(8));
    assert_eq!(board.len(), 2);
    assert!(board.iter().any(|e| e.version == first && e.trade_count == 1));

    // A 9h minimum filters out the younger deployment.
    let filtered = engine.leaderboard(Duration::hours(9), redeploy + Duration::hours(8));
    assert_eq!(filtered.len(), 1);
    assert_eq!(filtered[0].version, first);
}

#[tokio::test]
async fn frozen_config_requires_a_new_version_to_change() {
    let now = Utc::now();
    let mut engine = ArenaEngine::new();
    let id = engine
        .deploy("v-frozen", "", SimConfig::default(), now)
        .unwrap();

    let stored = engine.registry().get(id).unwrap();
    assert_eq!(stored.config, SimConfig::default());
    // Parameters change only by deploying again, which retires the first.
    let next = engine
        .deploy(
            "v-frozen-2",
            "",
            SimConfig::default().with_max_leverage(5.0),
            now + Duration::hours(1),
        )
        .unwrap();
    assert!(engine.registry().get(id).unwrap().retired_at.is_some());
    assert_eq!(engine.registry().active().unwrap().id, next);
}
