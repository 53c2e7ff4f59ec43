//! # Trade Reconciler
//!
//! Reconstructs round-trip trades (entry to exit) from the immutable fill
//! log using oldest-open-first lot matching. A closing fill may consume
//! several opening lots and a single lot may be closed by several fills;
//! either way every unit of closed quantity traces back to a specific
//! opening lot consumed in time order. The reconstruction depends only on
//! the fill log, never on live ledger state, so analytics stay reproducible
//! after positions have long since changed.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::{PerpArenaError, Result};
use crate::ledger::QTY_EPSILON;
use crate::store::FillRecord;

/// Direction of a reconstructed round trip.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Long,
    Short,
}

/// One reconstructed open-to-close pair, used for reporting only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoundTrip {
    pub symbol: String,
    pub direction: Direction,
    pub entry_time: DateTime<Utc>,
    pub exit_time: DateTime<Utc>,
    pub entry_price: f64,
    pub exit_price: f64,
    /// Unsigned quantity matched between the opening lot and the close.
    pub qty: f64,
    /// Entry and exit fees attributed to this round trip, pro-rated by
    /// consumed quantity.
    pub fees: f64,
    pub gross_pl: f64,
    pub net_pl: f64,
}

impl RoundTrip {
    pub fn holding_duration(&self) -> Duration {
        self.exit_time - self.entry_time
    }

    pub fn is_winner(&self) -> bool {
        self.net_pl > 0.0
    }
}

/// Open lot awaiting consumption.
#[derive(Debug, Clone)]
struct Lot {
    qty: f64,
    price: f64,
    time: DateTime<Utc>,
    /// Unattributed entry fee remaining on this lot.
    fee: f64,
}

#[derive(Debug, Default)]
struct SymbolBook {
    /// Open lots in arrival order; all share one sign.
    lots: VecDeque<Lot>,
    /// +1.0 long book, -1.0 short book; meaningless while empty.
    sign: f64,
}

/// Lazy round-trip sequence over a fill log.
///
/// Restartable by construction: build a fresh iterator from the same fills
/// and it replays identically. The iterator fuses after yielding an
/// inconsistency error.
pub struct RoundTrips<'a> {
    fills: std::slice::Iter<'a, FillRecord>,
    books: HashMap<String, SymbolBook>,
    ready: VecDeque<RoundTrip>,
    pending_error: Option<PerpArenaError>,
    failed: bool,
}

/// Reconstruct round trips from an ordered fill log.
pub fn round_trips(fills: &[FillRecord]) -> RoundTrips<'_> {
    RoundTrips {
        fills: fills.iter(),
        books: HashMap::new(),
        ready: VecDeque::new(),
        pending_error: None,
        failed: false,
    }
}

/// Eagerly reconcile a fill log, stopping at the first inconsistency.
pub fn reconcile(fills: &[FillRecord]) -> Result<Vec<RoundTrip>> {
    round_trips(fills).collect()
}

impl RoundTrips<'_> {
    fn absorb(&mut self, fill: &FillRecord) -> Result<()> {
        if !fill.qty.is_finite() || fill.qty <= 0.0 || !fill.price.is_finite() {
            return Err(PerpArenaError::reconciliation(
                &fill.symbol,
                format!("malformed fill qty={} price={}", fill.qty, fill.price),
            ));
        }

        let book = self.books.entry(fill.symbol.clone()).or_default();
        let signed = fill.signed_qty();

        if book.lots.is_empty() || book.sign == signed.signum() {
            book.sign = signed.signum();
            book.lots.push_back(Lot {
                qty: fill.qty,
                price: fill.price,
                time: fill.timestamp,
                fee: fill.fee,
            });
            return Ok(());
        }

        // Closing fill: consume open lots oldest-first.
        let mut remaining = fill.qty;
        let direction = if book.sign > 0.0 {
            Direction::Long
        } else {
            Direction::Short
        };

        while remaining > QTY_EPSILON {
            let Some(lot) = book.lots.front_mut() else {
                // More closed than was ever open: the log does not balance
                // to a closeable state. The ledger records flips as a close
                // plus an open, so a crossing fill means divergence.
                return Err(PerpArenaError::reconciliation(
                    &fill.symbol,
                    format!("closing fill exceeds open quantity by {remaining}"),
                ));
            };

            let consumed = remaining.min(lot.qty);
            let entry_fee = lot.fee * consumed / lot.qty;
            let exit_fee = fill.fee * consumed / fill.qty;
            let gross = match direction {
                Direction::Long => consumed * (fill.price - lot.price),
                Direction::Short => consumed * (lot.price - fill.price),
            };
            let fees = entry_fee + exit_fee;

            self.ready.push_back(RoundTrip {
                symbol: fill.symbol.clone(),
                direction,
                entry_time: lot.time,
                exit_time: fill.timestamp,
                entry_price: lot.price,
                exit_price: fill.price,
                qty: consumed,
                fees,
                gross_pl: gross,
                net_pl: gross - fees,
            });

            lot.qty -= consumed;
            lot.fee -= entry_fee;
            remaining -= consumed;
            if lot.qty <= QTY_EPSILON {
                book.lots.pop_front();
            }
        }
        Ok(())
    }
}

impl Iterator for RoundTrips<'_> {
    type Item = Result<RoundTrip>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            // Round trips completed before a divergence still drain first.
            if let Some(done) = self.ready.pop_front() {
                return Some(Ok(done));
            }
            if let Some(err) = self.pending_error.take() {
                return Some(Err(err));
            }
            if self.failed {
                return None;
            }
            let fill = self.fills.next()?;
            if let Err(err) = self.absorb(fill) {
                self.failed = true;
                self.pending_error = Some(err);
            }
        }
    }
}
