//! Read-only approximate nearest-neighbour index over catalog embeddings.
//!
//! The index is built once at startup from on-disk shards and never mutated
//! afterwards, so concurrent searches need no locking. Every stored vector and
//! every query is a [`UnitVector`]; the HNSW graph uses cosine distance, which
//! on unit vectors is a monotone transform of the inner product, and scores
//! are reported as `1 - distance` (i.e. cosine similarity).

pub mod npy;
pub mod shard;

use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use hnsw_rs::prelude::*;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};

use crate::catalog::Idx;
use crate::vector::{NormalizeError, UnitVector};

pub use shard::{EmbeddingRecord, ShardPaths};

/// HNSW layer cap imposed by `hnsw_rs`.
const MAX_LAYERS: usize = 16;

/// Failures while building or querying the index.
#[derive(Debug, Error)]
pub enum IndexError {
    /// Filesystem failure while reading or writing shards.
    #[error("io error on {path}: {source}")]
    Io {
        /// File or directory involved.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },
    /// A shard file is not a valid `.npy` array of the expected kind.
    #[error("invalid array in {path}: {source}")]
    Npy {
        /// Offending file.
        path: PathBuf,
        /// Decoder error.
        source: npy::NpyError,
    },
    /// A vector file has no matching identifier file.
    #[error("shard {shard} has no identifier file at {path}")]
    MissingIds {
        /// Shard label.
        shard: String,
        /// Expected identifier path.
        path: PathBuf,
    },
    /// Vector and identifier arrays disagree in length.
    #[error("shard {shard} has {vectors} vectors but {ids} identifiers")]
    RowMismatch {
        /// Shard label.
        shard: String,
        /// Vector rows.
        vectors: usize,
        /// Identifier count.
        ids: usize,
    },
    /// Vectors of different widths were mixed.
    #[error("shard {shard} has dimension {actual}, expected {expected}")]
    DimensionMismatch {
        /// Shard label.
        shard: String,
        /// Dimension fixed by earlier data.
        expected: usize,
        /// Dimension found.
        actual: usize,
    },
    /// The same catalog identifier appeared twice.
    #[error("idx {0} appears in more than one embedding row")]
    DuplicateIdx(Idx),
    /// A stored vector could not be normalised.
    #[error("vector for idx {idx} cannot be normalised: {source}")]
    Normalize {
        /// Catalog identifier of the row.
        idx: Idx,
        /// Why normalisation failed.
        source: NormalizeError,
    },
    /// Query width differs from the indexed vectors.
    #[error("query has dimension {actual}, index has dimension {expected}")]
    QueryDimension {
        /// Index dimension.
        expected: usize,
        /// Query dimension.
        actual: usize,
    },
    /// [`IndexCell::fill`] was called twice.
    #[error("index was already built")]
    AlreadyBuilt,
}

/// HNSW construction and search parameters.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HnswConfig {
    /// Graph degree (`M`).
    pub max_connections: usize,
    /// Candidate list size while inserting.
    pub ef_construction: usize,
    /// Minimum candidate list size while searching (raised to `k` when smaller).
    pub ef_search: usize,
}

impl Default for HnswConfig {
    fn default() -> Self {
        Self {
            max_connections: 32,
            ef_construction: 200,
            ef_search: 128,
        }
    }
}

/// One search hit.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ScoredIdx {
    /// Catalog identifier.
    pub idx: Idx,
    /// Cosine similarity to the query.
    pub score: f32,
}

/// Introspection used by health reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct IndexStats {
    /// Indexed items.
    pub item_count: usize,
    /// Vector dimension (0 when empty or not built).
    pub dimension: usize,
    /// Whether the build has completed.
    pub ready: bool,
}

/// Immutable HNSW index mapping query vectors to catalog identifiers.
pub struct EmbeddingIndex {
    graph: Option<Hnsw<'static, f32, DistCosine>>,
    ids: Vec<Idx>,
    dimension: usize,
    ef_search: usize,
}

impl std::fmt::Debug for EmbeddingIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmbeddingIndex")
            .field("items", &self.ids.len())
            .field("dimension", &self.dimension)
            .finish()
    }
}

impl EmbeddingIndex {
    /// Builds the index from records in any order.
    ///
    /// Records are sorted by `idx` first, so the result does not depend on how
    /// shards were enumerated. Duplicate identifiers and mixed dimensions are
    /// rejected.
    pub fn build(
        mut records: Vec<EmbeddingRecord>,
        config: HnswConfig,
    ) -> Result<Self, IndexError> {
        records.sort_by_key(|record| record.idx);
        if let Some(pair) = records.windows(2).find(|pair| pair[0].idx == pair[1].idx) {
            return Err(IndexError::DuplicateIdx(pair[0].idx));
        }
        let dimension = records
            .first()
            .map(|record| record.vector.dimension())
            .unwrap_or(0);
        if let Some(odd) = records
            .iter()
            .find(|record| record.vector.dimension() != dimension)
        {
            return Err(IndexError::DimensionMismatch {
                shard: format!("idx {}", odd.idx),
                expected: dimension,
                actual: odd.vector.dimension(),
            });
        }
        let ids: Vec<Idx> = records.iter().map(|record| record.idx).collect();
        let graph = if records.is_empty() {
            None
        } else {
            let graph = Hnsw::<f32, DistCosine>::new(
                config.max_connections,
                records.len(),
                MAX_LAYERS,
                config.ef_construction,
                DistCosine {},
            );
            for (data_id, record) in records.iter().enumerate() {
                graph.insert_slice((record.vector.as_slice(), data_id));
            }
            Some(graph)
        };
        info!(items = ids.len(), dimension, "embedding index built");
        Ok(Self {
            graph,
            ids,
            dimension,
            ef_search: config.ef_search.max(1),
        })
    }

    /// Loads every shard under `dir` and builds the index.
    pub fn build_from_dir(dir: &Path, config: HnswConfig) -> Result<Self, IndexError> {
        info!(dir = %dir.display(), "building embedding index");
        let records = shard::load_dir(dir)?;
        Self::build(records, config)
    }

    /// Returns up to `k` nearest items, best first.
    ///
    /// `k` larger than the index returns every item; an empty index returns an
    /// empty list. Equal scores are ordered by ascending `idx`.
    pub fn search(&self, query: &UnitVector, k: usize) -> Result<Vec<ScoredIdx>, IndexError> {
        let Some(graph) = &self.graph else {
            return Ok(Vec::new());
        };
        if query.dimension() != self.dimension {
            return Err(IndexError::QueryDimension {
                expected: self.dimension,
                actual: query.dimension(),
            });
        }
        let limit = k.min(self.ids.len());
        if limit == 0 {
            return Ok(Vec::new());
        }
        let ef = self.ef_search.max(limit);
        let mut hits: Vec<ScoredIdx> = graph
            .search(query.as_slice(), limit, ef)
            .into_iter()
            .filter_map(|neighbour| {
                self.ids.get(neighbour.d_id).map(|idx| ScoredIdx {
                    idx: *idx,
                    score: 1.0 - neighbour.distance,
                })
            })
            .collect();
        hits.sort_by(|a, b| b.score.total_cmp(&a.score).then(a.idx.cmp(&b.idx)));
        hits.dedup_by_key(|hit| hit.idx);
        hits.truncate(limit);
        debug!(k, returned = hits.len(), "index search");
        Ok(hits)
    }

    /// Number of indexed items.
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    /// Whether the index holds no items.
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Vector dimension, or 0 for an empty index.
    pub fn dimension(&self) -> usize {
        self.dimension
    }
}

/// Shared slot that becomes ready once the startup build completes.
#[derive(Clone, Default)]
pub struct IndexCell {
    inner: Arc<OnceLock<EmbeddingIndex>>,
}

impl IndexCell {
    /// An empty, not-yet-ready cell.
    pub fn new() -> Self {
        Self::default()
    }

    /// A cell that is ready immediately.
    pub fn ready(index: EmbeddingIndex) -> Self {
        let cell = Self::new();
        // freshly created cell, cannot already be filled
        let _ = cell.inner.set(index);
        cell
    }

    /// Publishes the built index. Fails if already filled.
    pub fn fill(&self, index: EmbeddingIndex) -> Result<(), IndexError> {
        self.inner.set(index).map_err(|_| IndexError::AlreadyBuilt)
    }

    /// The index, if the build has completed.
    pub fn get(&self) -> Option<&EmbeddingIndex> {
        self.inner.get()
    }

    /// Item count, dimension and readiness.
    pub fn stats(&self) -> IndexStats {
        match self.inner.get() {
            Some(index) => IndexStats {
                item_count: index.len(),
                dimension: index.dimension(),
                ready: true,
            },
            None => IndexStats {
                item_count: 0,
                dimension: 0,
                ready: false,
            },
        }
    }
}
