//! Error types for perp-arena simulation operations

use thiserror::Error;

/// Result type alias for consistent error handling throughout the crate
pub type Result<T> = std::result::Result<T, PerpArenaError>;

/// Main error type for perp-arena simulation operations
#[derive(Debug, Error)]
pub enum PerpArenaError {
    /// Malformed or out-of-range decision payload
    #[error("Validation error: {0}")]
    Validation(String),

    /// Requested leverage outside the configured bounds
    #[error("Leverage {requested} outside allowed range 1..={max}")]
    LeverageOutOfBounds { requested: f64, max: f64 },

    /// Order notional below the configured minimum
    #[error("Notional {notional:.2} below minimum {min_notional:.2}")]
    BelowMinNotional { notional: f64, min_notional: f64 },

    /// Initial margin for the requested position exceeds available cash
    #[error("Insufficient margin: required {required:.2}, available {available:.2}")]
    InsufficientMargin { required: f64, available: f64 },

    /// No mark price cached for a symbol
    #[error("Market data not available for {0}")]
    MarketDataNotAvailable(String),

    /// Resulting position would exceed the configured notional limit
    #[error("Notional limit exceeded for {symbol}: {notional:.2} > {limit:.2}")]
    NotionalLimitExceeded {
        symbol: String,
        notional: f64,
        limit: f64,
    },

    /// Fill log does not balance to a closeable state
    #[error("Reconciliation inconsistency for {symbol}: {detail}")]
    ReconciliationInconsistency { symbol: String, detail: String },

    /// A version tag was registered twice
    #[error("Version tag already registered: {0}")]
    DuplicateVersionTag(String),

    /// An operation required an active version but none exists
    #[error("No active version")]
    NoActiveVersion,

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// JSON parsing errors
    #[error("JSON parsing error: {0}")]
    JsonParsing(#[from] serde_json::Error),

    /// CSV processing errors
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

// Helper methods for error creation and classification
impl PerpArenaError {
    /// Create a new validation error with context
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Create a new configuration error with context
    pub fn config_error(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    /// Create a new reconciliation inconsistency for a symbol
    pub fn reconciliation(symbol: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::ReconciliationInconsistency {
            symbol: symbol.into(),
            detail: detail.into(),
        }
    }

    /// Check if this error is recoverable: the cycle continues and the
    /// message is surfaced to the decision source as last-error text.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Validation(_)
                | Self::LeverageOutOfBounds { .. }
                | Self::BelowMinNotional { .. }
                | Self::InsufficientMargin { .. }
                | Self::MarketDataNotAvailable(_)
                | Self::NotionalLimitExceeded { .. }
        )
    }

    /// Check if this error indicates ledger/fill-log divergence and must be
    /// surfaced as a hard diagnostic rather than retried.
    pub fn is_integrity_error(&self) -> bool {
        matches!(self, Self::ReconciliationInconsistency { .. })
    }

    /// Get error category for logging/monitoring
    pub fn category(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::LeverageOutOfBounds { .. } => "validation",
            Self::BelowMinNotional { .. } => "validation",
            Self::InsufficientMargin { .. } => "margin",
            Self::MarketDataNotAvailable(_) => "market_data",
            Self::NotionalLimitExceeded { .. } => "limits",
            Self::ReconciliationInconsistency { .. } => "integrity",
            Self::DuplicateVersionTag(_) => "version",
            Self::NoActiveVersion => "version",
            Self::Configuration(_) => "config",
            Self::JsonParsing(_) => "parsing",
            Self::Csv(_) => "csv",
            Self::Io(_) => "io",
        }
    }
}

impl From<std::num::ParseFloatError> for PerpArenaError {
    fn from(err: std::num::ParseFloatError) -> Self {
        PerpArenaError::Validation(err.to_string())
    }
}
