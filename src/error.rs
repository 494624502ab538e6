//! Error types for custody-lineage

use rust_decimal::Decimal;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LineageError {
    #[error("{entity} not found: {id}")]
    NotFound { entity: String, id: String },

    #[error("Insufficient quantity on chain {chain_id}: requested {requested}, available {available}")]
    InsufficientQuantity {
        chain_id: String,
        requested: Decimal,
        available: Decimal,
    },

    #[error("Invalid report type: {0}")]
    InvalidReportType(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Chain {chain_id} was modified concurrently (expected version {expected_version})")]
    ConcurrentModification {
        chain_id: String,
        expected_version: i64,
    },

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl LineageError {
    pub fn not_found(entity: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity: entity.into(),
            id: id.into(),
        }
    }

    /// True when the caller's request was at fault, false when the system is.
    pub fn is_domain_error(&self) -> bool {
        matches!(
            self,
            Self::NotFound { .. }
                | Self::InsufficientQuantity { .. }
                | Self::InvalidReportType(_)
                | Self::InvalidInput(_)
                | Self::ConcurrentModification { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_domain_vs_infrastructure() {
        assert!(LineageError::not_found("custody chain", "CHAIN-1").is_domain_error());
        assert!(LineageError::InvalidReportType("weekly".into()).is_domain_error());
        assert!(!LineageError::Internal("pool closed".into()).is_domain_error());
        assert!(!LineageError::Database(rusqlite::Error::InvalidQuery).is_domain_error());
    }

    #[test]
    fn test_not_found_message() {
        let err = LineageError::not_found("custody chain", "CHAIN-X");
        assert_eq!(err.to_string(), "custody chain not found: CHAIN-X");
    }
}
