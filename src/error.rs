use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::state_store::StoreError;
use crate::types::Interval;

/// Machine-checkable error flag carried next to the human-readable reason.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    InsufficientData,
    InvalidInput,
    ComputationError,
    DataUnavailable,
    StoreError,
}

#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("insufficient data for {context}: need at least {needed} candles, got {got}")]
    InsufficientData {
        context: &'static str,
        needed: usize,
        got: usize,
    },

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("computation error: {0}")]
    Computation(String),

    #[error("no {interval} candles for {symbol}: {reason}")]
    DataUnavailable {
        symbol: String,
        interval: Interval,
        reason: String,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl AnalysisError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AnalysisError::InsufficientData { .. } => ErrorKind::InsufficientData,
            AnalysisError::InvalidInput(_) => ErrorKind::InvalidInput,
            AnalysisError::Computation(_) => ErrorKind::ComputationError,
            AnalysisError::DataUnavailable { .. } => ErrorKind::DataUnavailable,
            AnalysisError::Store(_) => ErrorKind::StoreError,
        }
    }

    pub(crate) fn insufficient(context: &'static str, needed: usize, got: usize) -> Self {
        AnalysisError::InsufficientData { context, needed, got }
    }

    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        AnalysisError::InvalidInput(msg.into())
    }
}

/// Serializable form of an error: flag + reason.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ErrorReport {
    pub kind: ErrorKind,
    pub reason: String,
}

impl From<&AnalysisError> for ErrorReport {
    fn from(e: &AnalysisError) -> Self {
        ErrorReport { kind: e.kind(), reason: e.to_string() }
    }
}

/// Reject NaN/inf and non-positive values before any arithmetic runs.
pub(crate) fn ensure_positive(name: &str, value: f64) -> Result<(), AnalysisError> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(AnalysisError::invalid(format!("{name} must be positive (got {value})")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_map_to_flags() {
        assert_eq!(
            AnalysisError::insufficient("structure", 50, 10).kind(),
            ErrorKind::InsufficientData
        );
        assert_eq!(AnalysisError::invalid("x").kind(), ErrorKind::InvalidInput);
        assert_eq!(AnalysisError::Computation("x".into()).kind(), ErrorKind::ComputationError);
    }

    #[test]
    fn report_carries_reason() {
        let err = AnalysisError::insufficient("sweep detection", 20, 7);
        let report = ErrorReport::from(&err);
        assert_eq!(report.kind, ErrorKind::InsufficientData);
        assert!(report.reason.contains("need at least 20"));
    }

    #[test]
    fn ensure_positive_rejects_zero_and_nan() {
        assert!(ensure_positive("balance", 0.0).is_err());
        assert!(ensure_positive("balance", f64::NAN).is_err());
        assert!(ensure_positive("balance", 1.0).is_ok());
    }
}
