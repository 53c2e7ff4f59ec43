//! # Performance Analytics
//!
//! Per-version statistics derived entirely from equity snapshots and
//! reconstructed round trips; never hand-edited and recomputed as a whole
//! (upsert, not append). Undefined statistics stay `None` instead of
//! degenerating into zeros or infinities.

use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Serialize};

use crate::reconciler::RoundTrip;
use crate::store::EquitySnapshot;
use crate::version::VersionId;

/// Floor for duration-normalized statistics, so very young versions do not
/// divide by zero. One minute, the smallest cycle cadence in use.
pub const MIN_DURATION_DAYS: f64 = 1.0 / (24.0 * 60.0);

/// Averaging convention for daily returns. The choice materially affects
/// Sharpe comparability across versions of different duration, so it is a
/// named policy on the computed record rather than a hard-coded formula.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DailyReturnPolicy {
    /// Simple arithmetic mean of per-day returns.
    #[default]
    SimpleMean,
    /// Geometric mean of per-day growth factors.
    Compounded,
}

impl DailyReturnPolicy {
    /// Average a series of fractional daily returns under this policy.
    pub fn average(&self, returns: &[f64]) -> f64 {
        if returns.is_empty() {
            return 0.0;
        }
        match self {
            DailyReturnPolicy::SimpleMean => {
                returns.iter().sum::<f64>() / returns.len() as f64
            }
            DailyReturnPolicy::Compounded => {
                let growth: f64 = returns.iter().map(|r| 1.0 + r).product();
                growth.powf(1.0 / returns.len() as f64) - 1.0
            }
        }
    }
}

/// Computed statistics for one version over its activity period.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionPerformance {
    pub version: VersionId,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub starting_equity: f64,
    pub ending_equity: f64,
    pub total_return_pct: f64,
    /// Mean per-calendar-day return under `return_policy`, in percent.
    /// `None` with fewer than two days of data.
    pub daily_return_pct: Option<f64>,
    /// Mean over population standard deviation of daily returns. `None`
    /// with fewer than two days of data or zero variance.
    pub sharpe_ratio: Option<f64>,
    pub max_drawdown_pct: f64,
    /// Winning trades over total round trips, in percent. A round trip with
    /// net P/L of exactly zero counts toward the total but is neither a win
    /// nor a loss. `None` with no round trips.
    pub win_rate: Option<f64>,
    /// Gross winnings over absolute gross losses. `None` with no losers.
    pub profit_factor: Option<f64>,
    pub trade_count: usize,
    pub winning_trades: usize,
    pub losing_trades: usize,
    pub trades_per_day: f64,
    pub avg_win: f64,
    pub avg_loss: f64,
    pub largest_win: f64,
    pub largest_loss: f64,
    pub avg_hold_minutes: f64,
    /// Sum of entry notionals across round trips.
    pub total_volume: f64,
    pub fees_paid: f64,
    pub funding_net: f64,
    pub return_policy: DailyReturnPolicy,
    /// Set when the fill log failed reconciliation: the numbers above are
    /// computed from whatever could be reconstructed and must not be
    /// trusted for ranking.
    pub degraded: bool,
}

impl VersionPerformance {
    /// Compute a version's statistics over `[period_start, period_end]`
    /// from its equity snapshots (time-ordered) and reconciled round trips.
    pub fn compute(
        version: VersionId,
        period_start: DateTime<Utc>,
        period_end: DateTime<Utc>,
        snapshots: &[&EquitySnapshot],
        trips: &[RoundTrip],
        policy: DailyReturnPolicy,
    ) -> Self {
        let starting_equity = snapshots.first().map(|s| s.equity).unwrap_or(0.0);
        let ending_equity = snapshots.last().map(|s| s.equity).unwrap_or(0.0);
        let total_return_pct = if starting_equity > 0.0 {
            (ending_equity - starting_equity) / starting_equity * 100.0
        } else {
            0.0
        };

        let daily_returns = daily_returns(snapshots);
        let daily_return_pct = if daily_returns.is_empty() {
            None
        } else {
            Some(policy.average(&daily_returns) * 100.0)
        };
        let sharpe_ratio = sharpe(&daily_returns, policy);
        let max_drawdown_pct = max_drawdown_pct(snapshots);

        let winners: Vec<&RoundTrip> = trips.iter().filter(|t| t.net_pl > 0.0).collect();
        let losers: Vec<&RoundTrip> = trips.iter().filter(|t| t.net_pl < 0.0).collect();
        let trade_count = trips.len();

        let win_rate = (trade_count > 0)
            .then(|| winners.len() as f64 / trade_count as f64 * 100.0);
        let gross_wins: f64 = winners.iter().map(|t| t.net_pl).sum();
        let gross_losses: f64 = losers.iter().map(|t| t.net_pl).sum();
        let profit_factor = (!losers.is_empty()).then(|| gross_wins / gross_losses.abs());

        let duration_days = ((period_end - period_start).num_seconds() as f64 / 86_400.0)
            .max(MIN_DURATION_DAYS);
        let trades_per_day = trade_count as f64 / duration_days;

        let avg_win = if winners.is_empty() {
            0.0
        } else {
            gross_wins / winners.len() as f64
        };
        let avg_loss = if losers.is_empty() {
            0.0
        } else {
            gross_losses / losers.len() as f64
        };
        let largest_win = winners.iter().map(|t| t.net_pl).fold(0.0, f64::max);
        let largest_loss = losers.iter().map(|t| t.net_pl).fold(0.0, f64::min);
        let avg_hold_minutes = if trips.is_empty() {
            0.0
        } else {
            trips
                .iter()
                .map(|t| t.holding_duration().num_seconds() as f64 / 60.0)
                .sum::<f64>()
                / trips.len() as f64
        };
        let total_volume = trips.iter().map(|t| t.qty * t.entry_price).sum();

        Self {
            version,
            period_start,
            period_end,
            starting_equity,
            ending_equity,
            total_return_pct,
            daily_return_pct,
            sharpe_ratio,
            max_drawdown_pct,
            win_rate,
            profit_factor,
            trade_count,
            winning_trades: winners.len(),
            losing_trades: losers.len(),
            trades_per_day,
            avg_win,
            avg_loss,
            largest_win,
            largest_loss,
            avg_hold_minutes,
            total_volume,
            fees_paid: snapshots.last().map(|s| s.fees).unwrap_or(0.0),
            funding_net: snapshots.last().map(|s| s.funding).unwrap_or(0.0),
            return_policy: policy,
            degraded: false,
        }
    }
}

/// Per-calendar-day fractional returns: each day's closing equity against
/// the prior day's. Gap days contribute a single return across the gap.
fn daily_returns(snapshots: &[&EquitySnapshot]) -> Vec<f64> {
    let mut closes: Vec<(i32, u32, f64)> = Vec::new();
    for snapshot in snapshots {
        let date = snapshot.timestamp.date_naive();
        let key = (date.year(), date.ordinal());
        match closes.last_mut() {
            Some((year, ordinal, equity)) if (*year, *ordinal) == key => *equity = snapshot.equity,
            _ => closes.push((key.0, key.1, snapshot.equity)),
        }
    }

    closes
        .windows(2)
        .filter_map(|pair| {
            let prev = pair[0].2;
            (prev != 0.0).then(|| (pair[1].2 - prev) / prev)
        })
        .collect()
}

/// Sharpe ratio: policy-averaged daily return over the population standard
/// deviation of daily returns. Not annualized.
fn sharpe(daily_returns: &[f64], policy: DailyReturnPolicy) -> Option<f64> {
    if daily_returns.is_empty() {
        return None;
    }
    let mean = daily_returns.iter().sum::<f64>() / daily_returns.len() as f64;
    let variance = daily_returns
        .iter()
        .map(|r| (r - mean).powi(2))
        .sum::<f64>()
        / daily_returns.len() as f64;
    let std_dev = variance.sqrt();
    if std_dev == 0.0 {
        return None;
    }
    Some(policy.average(daily_returns) / std_dev)
}

/// Largest peak-to-trough equity decline, in percent of the running peak.
fn max_drawdown_pct(snapshots: &[&EquitySnapshot]) -> f64 {
    let mut peak = f64::MIN;
    let mut max_dd = 0.0;
    for snapshot in snapshots {
        if snapshot.equity > peak {
            peak = snapshot.equity;
        }
        if peak > 0.0 {
            let dd = (peak - snapshot.equity) / peak * 100.0;
            if dd > max_dd {
                max_dd = dd;
            }
        }
    }
    max_dd
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconciler::Direction;
    use chrono::{Duration, TimeZone};

    fn snapshot(version: VersionId, ts: DateTime<Utc>, equity: f64) -> EquitySnapshot {
        EquitySnapshot {
            version,
            timestamp: ts,
            equity,
            cash: equity,
            unrealized_pl: 0.0,
            realized_pl: 0.0,
            fees: 0.0,
            funding: 0.0,
        }
    }

    fn trip(net_pl: f64) -> RoundTrip {
        let now = Utc::now();
        RoundTrip {
            symbol: "BTC-USD".to_string(),
            direction: Direction::Long,
            entry_time: now,
            exit_time: now + Duration::minutes(30),
            entry_price: 100.0,
            exit_price: 100.0 + net_pl,
            qty: 1.0,
            fees: 0.0,
            gross_pl: net_pl,
            net_pl,
        }
    }

    fn day(n: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap() + Duration::days(n)
    }

    #[test]
    fn total_return_uses_first_and_last_snapshot() {
        let version = VersionId(1);
        let snaps = [
            snapshot(version, day(0), 10_000.0),
            snapshot(version, day(1), 11_000.0),
        ];
        let refs: Vec<&EquitySnapshot> = snaps.iter().collect();

        let perf = VersionPerformance::compute(
            version,
            day(0),
            day(1),
            &refs,
            &[],
            DailyReturnPolicy::SimpleMean,
        );
        assert!((perf.total_return_pct - 10.0).abs() < 1e-9);
    }

    #[test]
    fn sharpe_is_none_with_fewer_than_two_days() {
        let version = VersionId(1);
        let snaps = [snapshot(version, day(0), 10_000.0)];
        let refs: Vec<&EquitySnapshot> = snaps.iter().collect();

        let perf = VersionPerformance::compute(
            version,
            day(0),
            day(0),
            &refs,
            &[],
            DailyReturnPolicy::SimpleMean,
        );
        assert_eq!(perf.sharpe_ratio, None);
        assert_eq!(perf.daily_return_pct, None);
    }

    #[test]
    fn sharpe_is_none_with_zero_variance() {
        let version = VersionId(1);
        let snaps = [
            snapshot(version, day(0), 10_000.0),
            snapshot(version, day(1), 10_100.0),
            snapshot(version, day(2), 10_201.0),
        ];
        let refs: Vec<&EquitySnapshot> = snaps.iter().collect();

        let perf = VersionPerformance::compute(
            version,
            day(0),
            day(2),
            &refs,
            &[],
            DailyReturnPolicy::SimpleMean,
        );
        // Both daily returns are exactly 1%: zero variance.
        assert_eq!(perf.sharpe_ratio, None);
        assert!(perf.daily_return_pct.is_some());
    }

    #[test]
    fn intraday_snapshots_collapse_to_the_daily_close() {
        let version = VersionId(1);
        let snaps = [
            snapshot(version, day(0), 10_000.0),
            snapshot(version, day(0) + Duration::hours(3), 12_000.0),
            snapshot(version, day(1), 10_500.0),
        ];
        let refs: Vec<&EquitySnapshot> = snaps.iter().collect();

        let perf = VersionPerformance::compute(
            version,
            day(0),
            day(1),
            &refs,
            &[],
            DailyReturnPolicy::SimpleMean,
        );
        // One return: 12000 -> 10500 = -12.5%.
        assert!((perf.daily_return_pct.unwrap() - (-12.5)).abs() < 1e-9);
    }

    #[test]
    fn drawdown_tracks_the_running_peak() {
        let version = VersionId(1);
        let equities = [10_000.0, 12_000.0, 9_000.0, 11_000.0, 10_000.0];
        let snaps: Vec<EquitySnapshot> = equities
            .iter()
            .enumerate()
            .map(|(i, &equity)| snapshot(version, day(i as i64), equity))
            .collect();
        let refs: Vec<&EquitySnapshot> = snaps.iter().collect();

        let perf = VersionPerformance::compute(
            version,
            day(0),
            day(4),
            &refs,
            &[],
            DailyReturnPolicy::SimpleMean,
        );
        // Worst decline: 12000 -> 9000 = 25%.
        assert!((perf.max_drawdown_pct - 25.0).abs() < 1e-9);
    }

    #[test]
    fn zero_pnl_trades_count_toward_total_but_not_wins() {
        let version = VersionId(1);
        let trips = [trip(5.0), trip(0.0), trip(-3.0), trip(2.0)];

        let perf = VersionPerformance::compute(
            version,
            day(0),
            day(1),
            &[],
            &trips,
            DailyReturnPolicy::SimpleMean,
        );
        assert_eq!(perf.trade_count, 4);
        assert_eq!(perf.winning_trades, 2);
        assert_eq!(perf.losing_trades, 1);
        assert!((perf.win_rate.unwrap() - 50.0).abs() < 1e-9);
    }

    #[test]
    fn profit_factor_is_none_without_losers() {
        let version = VersionId(1);
        let trips = [trip(5.0), trip(2.0)];

        let perf = VersionPerformance::compute(
            version,
            day(0),
            day(1),
            &[],
            &trips,
            DailyReturnPolicy::SimpleMean,
        );
        assert_eq!(perf.profit_factor, None);

        let trips = [trip(6.0), trip(-2.0)];
        let perf = VersionPerformance::compute(
            version,
            day(0),
            day(1),
            &[],
            &trips,
            DailyReturnPolicy::SimpleMean,
        );
        assert!((perf.profit_factor.unwrap() - 3.0).abs() < 1e-9);
    }

    #[test]
    fn young_versions_floor_the_duration() {
        let version = VersionId(1);
        let trips = [trip(1.0)];

        let perf = VersionPerformance::compute(
            version,
            day(0),
            day(0), // zero-length period
            &[],
            &trips,
            DailyReturnPolicy::SimpleMean,
        );
        assert!(perf.trades_per_day.is_finite());
        assert!((perf.trades_per_day - 1.0 / MIN_DURATION_DAYS).abs() < 1e-6);
    }

    #[test]
    fn compounded_policy_differs_from_simple_mean() {
        let returns = [0.5, -0.5];
        assert_eq!(DailyReturnPolicy::SimpleMean.average(&returns), 0.0);
        assert!(DailyReturnPolicy::Compounded.average(&returns) < 0.0);
    }
}
