//! Closed error kinds for the ingestion and retrieval pipeline.
//!
//! Every failure the pipeline can surface to a caller is one of these
//! variants. Advisory conditions that do not fail an ingest (near-duplicate
//! overrides, degraded enrichment, gate rejection) travel inside the
//! [`crate::models::IngestReceipt`] instead.

use thiserror::Error;

/// Result alias used throughout the pipeline.
pub type Result<T> = std::result::Result<T, SiftError>;

/// The closed set of pipeline errors.
#[derive(Debug, Error)]
pub enum SiftError {
    /// No text could be recovered from the input bytes.
    #[error("extraction failed: {reason}")]
    ExtractionFailed { reason: String },

    /// Exact content-hash collision with an already-ingested document.
    /// Fatal to this ingest; `of` names the winning document.
    #[error("duplicate of document {of}")]
    Duplicate { of: String },

    /// Fingerprint match within the configured Hamming distance.
    /// Advisory; the ingest call may override it.
    #[error("near-duplicate of document {of} (hamming distance {distance})")]
    NearDuplicate { of: String, distance: u32 },

    /// The daily cost cap is spent; the router refused to dispatch.
    #[error("daily budget exceeded: spent ${spent:.4} of ${cap:.4}")]
    BudgetExceeded { spent: f64, cap: f64 },

    /// Vector store or sparse index write failed after retries.
    #[error("storage failed: {reason}")]
    StorageFailed { reason: String },

    /// Every provider in the router chain failed for this call.
    #[error("all llm providers exhausted: {reason}")]
    ProvidersExhausted { reason: String },

    /// The confidence gate refused synthesis.
    #[error("insufficient evidence to answer")]
    InsufficientEvidence,

    /// A cancellation signal or deadline was observed mid-operation.
    #[error("operation aborted")]
    Aborted,

    /// Malformed arguments at the system boundary.
    #[error("invalid input: {reason}")]
    InvalidInput { reason: String },
}

impl SiftError {
    pub fn extraction(reason: impl Into<String>) -> Self {
        Self::ExtractionFailed {
            reason: reason.into(),
        }
    }

    pub fn storage(reason: impl std::fmt::Display) -> Self {
        Self::StorageFailed {
            reason: reason.to_string(),
        }
    }

    pub fn invalid(reason: impl Into<String>) -> Self {
        Self::InvalidInput {
            reason: reason.into(),
        }
    }

    /// Stable machine-readable kind name, used in receipts and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ExtractionFailed { .. } => "extraction_failed",
            Self::Duplicate { .. } => "duplicate",
            Self::NearDuplicate { .. } => "near_duplicate",
            Self::BudgetExceeded { .. } => "budget_exceeded",
            Self::StorageFailed { .. } => "storage_failed",
            Self::ProvidersExhausted { .. } => "providers_exhausted",
            Self::InsufficientEvidence => "insufficient_evidence",
            Self::Aborted => "aborted",
            Self::InvalidInput { .. } => "invalid_input",
        }
    }

    /// Whether this error fails the ingest outright (vs. advisory kinds the
    /// caller may override or record).
    pub fn is_fatal_for_ingest(&self) -> bool {
        matches!(
            self,
            Self::ExtractionFailed { .. }
                | Self::Duplicate { .. }
                | Self::StorageFailed { .. }
                | Self::InvalidInput { .. }
                | Self::Aborted
        )
    }
}

impl From<sqlx::Error> for SiftError {
    fn from(e: sqlx::Error) -> Self {
        Self::storage(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_names_are_stable() {
        assert_eq!(SiftError::extraction("x").kind(), "extraction_failed");
        assert_eq!(SiftError::Duplicate { of: "d1".into() }.kind(), "duplicate");
        assert_eq!(
            SiftError::NearDuplicate {
                of: "d1".into(),
                distance: 2
            }
            .kind(),
            "near_duplicate"
        );
        assert_eq!(SiftError::Aborted.kind(), "aborted");
    }

    #[test]
    fn near_duplicate_is_not_fatal() {
        let e = SiftError::NearDuplicate {
            of: "d1".into(),
            distance: 1,
        };
        assert!(!e.is_fatal_for_ingest());
        assert!(SiftError::Duplicate { of: "d1".into() }.is_fatal_for_ingest());
    }
}
