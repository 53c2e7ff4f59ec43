//! # Leaderboard
//!
//! Ranks strategy versions by risk-adjusted performance. Versions younger
//! than the caller-supplied minimum activity duration are filtered out;
//! the rest sort by Sharpe ratio descending with undefined Sharpes last,
//! ties broken by total return.

use std::cmp::Ordering;
use std::path::Path;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::analytics::VersionPerformance;
use crate::errors::Result;
use crate::version::{VersionId, VersionRegistry};

/// One ranked row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeaderboardEntry {
    pub rank: usize,
    pub version: VersionId,
    pub tag: String,
    pub sharpe_ratio: Option<f64>,
    pub total_return_pct: f64,
    pub max_drawdown_pct: f64,
    pub trade_count: usize,
    pub active_hours: f64,
    /// Degraded analytics are shown but flagged.
    pub degraded: bool,
}

/// Rank all versions with computed performance, filtered by minimum
/// activity duration.
pub fn rank(
    registry: &VersionRegistry,
    performance: &[&VersionPerformance],
    min_duration: Duration,
    now: DateTime<Utc>,
) -> Vec<LeaderboardEntry> {
    let mut entries: Vec<LeaderboardEntry> = performance
        .iter()
        .filter_map(|perf| {
            let version = registry.get(perf.version)?;
            let duration = version.active_duration(now);
            if duration < min_duration {
                return None;
            }
            Some(LeaderboardEntry {
                rank: 0,
                version: perf.version,
                tag: version.tag.clone(),
                sharpe_ratio: perf.sharpe_ratio,
                total_return_pct: perf.total_return_pct,
                max_drawdown_pct: perf.max_drawdown_pct,
                trade_count: perf.trade_count,
                active_hours: duration.num_seconds() as f64 / 3_600.0,
                degraded: perf.degraded,
            })
        })
        .collect();

    entries.sort_by(compare_entries);
    for (index, entry) in entries.iter_mut().enumerate() {
        entry.rank = index + 1;
    }
    entries
}

/// Sharpe descending, `None` sorting last, ties by total return descending.
fn compare_entries(a: &LeaderboardEntry, b: &LeaderboardEntry) -> Ordering {
    match (a.sharpe_ratio, b.sharpe_ratio) {
        (Some(sa), Some(sb)) => sb
            .partial_cmp(&sa)
            .unwrap_or(Ordering::Equal)
            .then_with(|| by_return(a, b)),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => by_return(a, b),
    }
}

fn by_return(a: &LeaderboardEntry, b: &LeaderboardEntry) -> Ordering {
    b.total_return_pct
        .partial_cmp(&a.total_return_pct)
        .unwrap_or(Ordering::Equal)
}

/// Export a ranked leaderboard as CSV.
pub fn export_csv<P: AsRef<Path>>(entries: &[LeaderboardEntry], path: P) -> Result<()> {
    let mut writer = csv::Writer::from_path(path)?;
    for entry in entries {
        writer.serialize(entry)?;
    }
    writer.flush()?;
    Ok(())
}
