//! # Decision Boundary
//!
//! Typed payloads from the external decision source and the validation that
//! runs before anything reaches the ledger. The payload is a tagged variant
//! over buy / sell / hold / close with per-variant required fields, so a
//! malformed decision fails at the boundary as a recoverable validation
//! error surfaced back to the source as last-error text.

use serde::{Deserialize, Serialize};

use crate::errors::{PerpArenaError, Result};
use crate::ledger::ExitPlan;

/// Longest accepted justification text.
pub const MAX_JUSTIFICATION_LEN: usize = 500;

/// What the decision source wants done with one symbol's position.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "signal", rename_all = "snake_case")]
pub enum DecisionKind {
    /// Target a long sized by the requested leverage.
    Buy { leverage: f64 },
    /// Target a short sized by the requested leverage.
    Sell { leverage: f64 },
    /// Keep the position as is.
    Hold,
    /// Flatten the position.
    Close,
}

impl DecisionKind {
    /// Requested leverage, where the variant carries one.
    pub fn leverage(&self) -> Option<f64> {
        match self {
            DecisionKind::Buy { leverage } | DecisionKind::Sell { leverage } => Some(*leverage),
            DecisionKind::Hold | DecisionKind::Close => None,
        }
    }

    /// Signed target quantity for this decision.
    ///
    /// Sizing follows the margin actually available: the requested notional
    /// is `equity x leverage`, capped by what the effective margin (free
    /// margin plus whatever replacing the current position frees up) can
    /// back at that leverage. `None` means leave the position untouched.
    pub fn target_qty(&self, equity: f64, effective_margin: f64, mark: f64) -> Option<f64> {
        match self {
            DecisionKind::Hold => None,
            DecisionKind::Close => Some(0.0),
            DecisionKind::Buy { leverage } | DecisionKind::Sell { leverage } => {
                if mark <= 0.0 {
                    return None;
                }
                let notional = equity.min(effective_margin).max(0.0) * leverage;
                let qty = notional / mark;
                Some(match self {
                    DecisionKind::Sell { .. } => -qty,
                    _ => qty,
                })
            }
        }
    }
}

/// One symbol's decision for the cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionDecision {
    pub symbol: String,
    #[serde(flatten)]
    pub kind: DecisionKind,
    pub justification: String,
    #[serde(default)]
    pub exit_plan: Option<ExitPlan>,
    /// Client-assigned idempotency key; a replayed key is not re-executed.
    #[serde(default)]
    pub client_id: Option<String>,
}

impl PositionDecision {
    pub fn hold(symbol: &str) -> Self {
        Self {
            symbol: symbol.to_string(),
            kind: DecisionKind::Hold,
            justification: String::new(),
            exit_plan: None,
            client_id: None,
        }
    }
}

/// Parse a raw decision batch. An unparsable payload is a validation error,
/// not a crash.
pub fn parse_decisions(payload: &str) -> Result<Vec<PositionDecision>> {
    serde_json::from_str(payload)
        .map_err(|e| PerpArenaError::validation(format!("unparsable decision payload: {e}")))
}

/// Boundary validation against platform constraints.
#[derive(Debug, Clone)]
pub struct DecisionValidator {
    max_leverage: f64,
}

impl DecisionValidator {
    pub fn new(max_leverage: f64) -> Self {
        Self { max_leverage }
    }

    /// Validate one decision.
    pub fn validate(&self, decision: &PositionDecision) -> Result<()> {
        if decision.symbol.is_empty() {
            return Err(PerpArenaError::validation("decision has an empty symbol"));
        }
        if let Some(leverage) = decision.kind.leverage() {
            if !leverage.is_finite() || !(1.0..=self.max_leverage).contains(&leverage) {
                return Err(PerpArenaError::LeverageOutOfBounds {
                    requested: leverage,
                    max: self.max_leverage,
                });
            }
        }
        if decision.justification.len() > MAX_JUSTIFICATION_LEN {
            return Err(PerpArenaError::validation(format!(
                "{}: justification exceeds {MAX_JUSTIFICATION_LEN} characters",
                decision.symbol
            )));
        }
        if let Some(plan) = &decision.exit_plan {
            for (name, price) in [
                ("profit_target", plan.profit_target),
                ("stop_loss", plan.stop_loss),
            ] {
                if let Some(price) = price {
                    if !price.is_finite() || price <= 0.0 {
                        return Err(PerpArenaError::validation(format!(
                            "{}: {name} must be a positive price",
                            decision.symbol
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    /// Validate a batch: every decision individually, one decision per
    /// symbol, and no duplicated idempotency keys within the batch.
    pub fn validate_batch(&self, decisions: &[PositionDecision]) -> Result<()> {
        let mut symbols = std::collections::HashSet::new();
        let mut client_ids = std::collections::HashSet::new();
        for decision in decisions {
            self.validate(decision)?;
            if !symbols.insert(decision.symbol.as_str()) {
                return Err(PerpArenaError::validation(format!(
                    "duplicate decision for {}",
                    decision.symbol
                )));
            }
            if let Some(client_id) = &decision.client_id {
                if !client_ids.insert(client_id.as_str()) {
                    return Err(PerpArenaError::validation(format!(
                        "duplicate client_id in batch: {client_id}"
                    )));
                }
            }
        }
        Ok(())
    }
}
