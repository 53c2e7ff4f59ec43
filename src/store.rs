//! # Record Store
//!
//! The persistence boundary: an append-only fill log per version, one
//! equity snapshot per version per cycle timestamp, and a per-version
//! performance upsert. Real persistence mechanics live outside the crate;
//! this in-memory implementation keeps the same write semantics the
//! relational layout promises (conflict-ignore on idempotency keys,
//! minute-keyed snapshot upserts) and offers CSV export for reporting.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;

use chrono::{DateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::analytics::VersionPerformance;
use crate::errors::Result;
use crate::ledger::Side;
use crate::version::VersionId;

/// Why a closing fill happened. Liquidations are recorded distinctly from
/// strategy-initiated closes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    Strategy,
    Liquidation,
}

/// Immutable record of one executed fill.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FillRecord {
    pub version: VersionId,
    pub symbol: String,
    pub side: Side,
    /// Unsigned quantity.
    pub qty: f64,
    pub price: f64,
    pub fee: f64,
    pub timestamp: DateTime<Utc>,
    pub entry_reason: Option<String>,
    pub exit_reason: Option<ExitReason>,
    /// Client-assigned idempotency key; replays are ignored.
    pub client_id: Option<String>,
}

impl FillRecord {
    /// Signed quantity: buys positive, sells negative.
    pub fn signed_qty(&self) -> f64 {
        self.side.sign() * self.qty
    }
}

/// Equity snapshot written once per cycle.
///
/// `equity = cash + unrealized_pl` holds by construction at write time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EquitySnapshot {
    pub version: VersionId,
    pub timestamp: DateTime<Utc>,
    pub equity: f64,
    pub cash: f64,
    pub unrealized_pl: f64,
    /// Cumulative realized P/L.
    pub realized_pl: f64,
    /// Cumulative fees paid.
    pub fees: f64,
    /// Cumulative funding, signed.
    pub funding: f64,
}

/// In-memory record store shared by the engine and the reporting surface.
#[derive(Debug, Clone, Default)]
pub struct ArenaStore {
    fills: Vec<FillRecord>,
    seen_client_ids: HashSet<(VersionId, String)>,
    snapshots: BTreeMap<(VersionId, DateTime<Utc>), EquitySnapshot>,
    performance: HashMap<VersionId, VersionPerformance>,
}

impl ArenaStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a fill to the log. Returns `false` without writing when the
    /// record carries an idempotency key that was already used for this
    /// version.
    pub fn append_fill(&mut self, record: FillRecord) -> bool {
        if let Some(client_id) = &record.client_id {
            let key = (record.version, client_id.clone());
            if !self.seen_client_ids.insert(key) {
                debug!(client_id = %client_id, "duplicate idempotency key ignored");
                return false;
            }
        }
        self.fills.push(record);
        true
    }

    /// Whether an idempotency key has already executed for a version.
    pub fn client_id_seen(&self, version: VersionId, client_id: &str) -> bool {
        self.seen_client_ids
            .contains(&(version, client_id.to_string()))
    }

    /// Ordered fill log for a version.
    pub fn fills(&self, version: VersionId) -> Vec<&FillRecord> {
        self.fills.iter().filter(|f| f.version == version).collect()
    }

    /// Ordered fill log for one (version, symbol) pair.
    pub fn fills_for_symbol(&self, version: VersionId, symbol: &str) -> Vec<&FillRecord> {
        self.fills
            .iter()
            .filter(|f| f.version == version && f.symbol == symbol)
            .collect()
    }

    /// Consistent snapshot of the fill log up to an inclusive timestamp, for
    /// background reconciliation running while new fills are appended.
    pub fn fills_up_to(&self, version: VersionId, cutoff: DateTime<Utc>) -> Vec<FillRecord> {
        self.fills
            .iter()
            .filter(|f| f.version == version && f.timestamp <= cutoff)
            .cloned()
            .collect()
    }

    /// Upsert the snapshot for its cycle timestamp (truncated to the
    /// minute, so a same-minute rewrite replaces rather than duplicates).
    pub fn upsert_snapshot(&mut self, mut snapshot: EquitySnapshot) {
        snapshot.timestamp = truncate_to_minute(snapshot.timestamp);
        self.snapshots
            .insert((snapshot.version, snapshot.timestamp), snapshot);
    }

    /// Equity snapshots for a version in time order.
    pub fn snapshots(&self, version: VersionId) -> Vec<&EquitySnapshot> {
        self.snapshots
            .range((version, DateTime::<Utc>::MIN_UTC)..=(version, DateTime::<Utc>::MAX_UTC))
            .map(|(_, snapshot)| snapshot)
            .collect()
    }

    /// Recompute-and-replace write of a version's performance.
    pub fn upsert_performance(&mut self, performance: VersionPerformance) {
        self.performance.insert(performance.version, performance);
    }

    pub fn performance(&self, version: VersionId) -> Option<&VersionPerformance> {
        self.performance.get(&version)
    }

    pub fn all_performance(&self) -> Vec<&VersionPerformance> {
        let mut rows: Vec<&VersionPerformance> = self.performance.values().collect();
        rows.sort_by_key(|p| p.version);
        rows
    }

    /// Export a version's equity curve as CSV.
    pub fn export_equity_csv<P: AsRef<Path>>(&self, version: VersionId, path: P) -> Result<()> {
        let mut writer = csv::Writer::from_path(path)?;
        for snapshot in self.snapshots(version) {
            writer.serialize(snapshot)?;
        }
        writer.flush()?;
        Ok(())
    }

    /// Export a version's fill log as CSV.
    pub fn export_trades_csv<P: AsRef<Path>>(&self, version: VersionId, path: P) -> Result<()> {
        let mut writer = csv::Writer::from_path(path)?;
        for fill in self.fills(version) {
            writer.serialize(fill)?;
        }
        writer.flush()?;
        Ok(())
    }
}

fn truncate_to_minute(ts: DateTime<Utc>) -> DateTime<Utc> {
    ts.with_second(0)
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(ts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn fill(version: VersionId, symbol: &str, client_id: Option<&str>) -> FillRecord {
        FillRecord {
            version,
            symbol: symbol.to_string(),
            side: Side::Buy,
            qty: 1.0,
            price: 100.0,
            fee: 0.1,
            timestamp: Utc::now(),
            entry_reason: None,
            exit_reason: None,
            client_id: client_id.map(str::to_string),
        }
    }

    #[test]
    fn replayed_idempotency_keys_do_not_double_append() {
        let mut store = ArenaStore::new();
        let version = VersionId(1);

        assert!(store.append_fill(fill(version, "BTC-USD", Some("abc"))));
        assert!(!store.append_fill(fill(version, "BTC-USD", Some("abc"))));
        // The same key under a different version is a different fill.
        assert!(store.append_fill(fill(VersionId(2), "BTC-USD", Some("abc"))));

        assert_eq!(store.fills(version).len(), 1);
        assert!(store.client_id_seen(version, "abc"));
    }

    #[test]
    fn snapshots_upsert_on_the_same_minute() {
        let mut store = ArenaStore::new();
        let version = VersionId(1);
        let base = Utc.with_ymd_and_hms(2024, 5, 1, 12, 30, 15).unwrap();

        for (secs, equity) in [(0, 10_000.0), (20, 10_050.0)] {
            store.upsert_snapshot(EquitySnapshot {
                version,
                timestamp: base + chrono::Duration::seconds(secs),
                equity,
                cash: equity,
                unrealized_pl: 0.0,
                realized_pl: 0.0,
                fees: 0.0,
                funding: 0.0,
            });
        }

        let snapshots = store.snapshots(version);
        assert_eq!(snapshots.len(), 1);
        assert_eq!(snapshots[0].equity, 10_050.0);
        assert_eq!(snapshots[0].timestamp.second(), 0);
    }

    #[test]
    fn fill_log_snapshot_is_bounded_by_cutoff() {
        let mut store = ArenaStore::new();
        let version = VersionId(1);
        let t0 = Utc::now();

        let mut early = fill(version, "BTC-USD", None);
        early.timestamp = t0;
        let mut late = fill(version, "BTC-USD", None);
        late.timestamp = t0 + chrono::Duration::minutes(5);
        store.append_fill(early);
        store.append_fill(late);

        let bounded = store.fills_up_to(version, t0 + chrono::Duration::minutes(1));
        assert_eq!(bounded.len(), 1);
    }

    #[test]
    fn csv_export_writes_one_row_per_record() {
        let mut store = ArenaStore::new();
        let version = VersionId(1);
        store.append_fill(fill(version, "BTC-USD", None));
        store.append_fill(fill(version, "ETH-USD", None));

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trades.csv");
        store.export_trades_csv(version, &path).unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        // Header plus two data rows.
        assert_eq!(contents.lines().count(), 3);
    }
}
