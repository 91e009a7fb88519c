//! Request-fatal failures of the matching pipeline.
//!
//! Enrichment and oracle problems never show up here: they degrade result
//! quality and are logged, but the request still succeeds.

use thiserror::Error;

use crate::controls::BudgetError;
use crate::index::IndexError;

/// Why a match request could not produce a result list.
#[derive(Debug, Error)]
pub enum RetrievalError {
    /// The query text could not be turned into a usable vector.
    #[error("query encoding failed: {0:#}")]
    Encoding(anyhow::Error),
    /// The embedding index has not finished building.
    #[error("embedding index is not ready")]
    IndexUnready,
    /// Requested budgets violate `k0 >= k1 >= k2 >= 1` or a ceiling.
    #[error(transparent)]
    InvalidBudget(#[from] BudgetError),
    /// Index search failed.
    #[error("index search failed: {0}")]
    Index(#[from] IndexError),
    /// The catalog store failed or timed out.
    #[error("catalog lookup failed: {0:#}")]
    Catalog(anyhow::Error),
    /// The profile text was blank.
    #[error("profile text must not be empty")]
    EmptyProfile,
}

impl RetrievalError {
    /// Whether the caller supplied a bad request rather than hitting a server fault.
    pub fn is_client_error(&self) -> bool {
        matches!(self, Self::InvalidBudget(_) | Self::EmptyProfile)
    }
}
