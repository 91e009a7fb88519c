#![warn(missing_docs)]
//! Profile-to-catalog matching: ANN retrieval followed by a two-stage oracle cascade.
//!
//! Text flows through [`enricher`] and [`embedder`] into an [`index`] search,
//! the hits are resolved through the [`catalog`], and the [`cascade`] narrows
//! them with a [`oracle`] in two passes. [`pipeline::MatchPipeline`] wires it
//! together for direct and gap-closing requests.

pub mod cascade;
pub mod catalog;
pub mod controls;
pub mod embedder;
pub mod enricher;
pub mod error;
pub mod gap;
mod http;
pub mod index;
pub mod llm;
pub mod oracle;
pub mod pipeline;
pub mod seniority;
pub mod telemetry;
pub mod vector;

pub use cascade::{Candidate, CascadeOutcome, CascadeRanker, Fallback, RankedCandidate};
pub use catalog::{CatalogItem, CatalogStore, Idx, MemoryCatalog};
pub use controls::{
    BudgetCeilings, BudgetError, Budgets, CallTimeouts, RetryPolicy, ShortfallPolicy,
};
pub use error::RetrievalError;
pub use index::{EmbeddingIndex, HnswConfig, IndexCell, IndexError, IndexStats, ScoredIdx};
pub use oracle::{OracleError, RankingOracle, Stage};
pub use pipeline::{
    GapMatchRequest, GapMatchResponse, MatchPipeline, MatchRequest, MatchResponse, MatchResult,
};
pub use vector::{NormalizeError, UnitVector};
