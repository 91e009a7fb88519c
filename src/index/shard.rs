//! Discovery and loading of on-disk embedding shards.
//!
//! A shard is a pair of files in one directory:
//! `embeddings_batch_<n>.npy` (vectors) and `indices_batch_<n>.npy` (the
//! catalog `idx` of each row). The suffix is kept exactly as written on disk,
//! so `embeddings_batch_01.npy` pairs with `indices_batch_01.npy`. Shards are
//! listed by the numeric value of the suffix, but the
//! index sorts every record by `idx` before insertion, so the listing order
//! only affects how fast loading fails, never what ends up indexed.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use super::npy;
use super::IndexError;
use crate::catalog::Idx;
use crate::vector::UnitVector;

const EMBEDDINGS_PREFIX: &str = "embeddings_batch_";
const INDICES_PREFIX: &str = "indices_batch_";
const SHARD_EXTENSION: &str = "npy";

/// Paths of one shard pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardPaths {
    /// Numeric shard suffix.
    pub number: u64,
    /// Vector array path.
    pub embeddings: PathBuf,
    /// Identifier array path.
    pub indices: PathBuf,
}

impl ShardPaths {
    /// Paths for shard `number` inside `dir`, written without zero padding.
    pub fn in_dir(dir: &Path, number: u64) -> Self {
        Self::with_suffix(dir, number, &number.to_string())
    }

    fn with_suffix(dir: &Path, number: u64, suffix: &str) -> Self {
        Self {
            number,
            embeddings: dir.join(format!("{EMBEDDINGS_PREFIX}{suffix}.{SHARD_EXTENSION}")),
            indices: dir.join(format!("{INDICES_PREFIX}{suffix}.{SHARD_EXTENSION}")),
        }
    }

    fn label(&self) -> String {
        self.embeddings.display().to_string()
    }
}

/// One catalog item's normalised vector.
#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddingRecord {
    /// Catalog identifier.
    pub idx: Idx,
    /// Unit-length embedding.
    pub vector: UnitVector,
}

/// Lists shard pairs in `dir`, ordered by shard number.
pub fn discover(dir: &Path) -> Result<Vec<ShardPaths>, IndexError> {
    let entries = fs::read_dir(dir).map_err(|err| IndexError::Io {
        path: dir.to_path_buf(),
        source: err,
    })?;
    let mut shards = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|err| IndexError::Io {
            path: dir.to_path_buf(),
            source: err,
        })?;
        let name = entry.file_name();
        let Some((suffix, number)) = name.to_str().and_then(shard_suffix) else {
            continue;
        };
        let paths = ShardPaths::with_suffix(dir, number, suffix);
        if !paths.indices.is_file() {
            return Err(IndexError::MissingIds {
                shard: paths.label(),
                path: paths.indices,
            });
        }
        shards.push(paths);
    }
    shards.sort_by(|a, b| {
        a.number
            .cmp(&b.number)
            .then_with(|| a.embeddings.cmp(&b.embeddings))
    });
    debug!(dir = %dir.display(), shards = shards.len(), "discovered embedding shards");
    Ok(shards)
}

/// Literal suffix of an embeddings file name and its numeric value.
fn shard_suffix(file_name: &str) -> Option<(&str, u64)> {
    let suffix = file_name
        .strip_prefix(EMBEDDINGS_PREFIX)?
        .strip_suffix(".npy")?;
    let number = suffix.parse().ok()?;
    Some((suffix, number))
}

/// Reads and normalises one shard. `expected_dim` is the dimension fixed by earlier shards.
pub fn load_shard(
    shard: &ShardPaths,
    expected_dim: Option<usize>,
) -> Result<Vec<EmbeddingRecord>, IndexError> {
    let matrix = npy::read_matrix(&read_file(&shard.embeddings)?).map_err(|err| {
        IndexError::Npy {
            path: shard.embeddings.clone(),
            source: err,
        }
    })?;
    let ids = npy::read_ids(&read_file(&shard.indices)?).map_err(|err| IndexError::Npy {
        path: shard.indices.clone(),
        source: err,
    })?;
    if matrix.rows != ids.len() {
        return Err(IndexError::RowMismatch {
            shard: shard.label(),
            vectors: matrix.rows,
            ids: ids.len(),
        });
    }
    if let Some(expected) = expected_dim {
        if matrix.rows > 0 && matrix.cols != expected {
            return Err(IndexError::DimensionMismatch {
                shard: shard.label(),
                expected,
                actual: matrix.cols,
            });
        }
    }
    let mut records = Vec::with_capacity(ids.len());
    for (row, idx) in matrix.rows().zip(ids) {
        let vector = UnitVector::normalize(row.to_vec())
            .map_err(|source| IndexError::Normalize { idx, source })?;
        records.push(EmbeddingRecord { idx, vector });
    }
    info!(
        shard = %shard.embeddings.display(),
        rows = records.len(),
        dim = matrix.cols,
        "loaded embedding shard"
    );
    Ok(records)
}

/// Loads every shard in `dir`, enforcing one dimension across all of them.
pub fn load_dir(dir: &Path) -> Result<Vec<EmbeddingRecord>, IndexError> {
    let shards = discover(dir)?;
    let mut records = Vec::new();
    let mut dimension: Option<usize> = None;
    for shard in &shards {
        let batch = load_shard(shard, dimension)?;
        if dimension.is_none() {
            dimension = batch.first().map(|record| record.vector.dimension());
        }
        records.extend(batch);
    }
    Ok(records)
}

/// Writes one shard pair; used by the offline embedder and by fixtures.
pub fn write_shard(
    dir: &Path,
    number: u64,
    records: &[(Idx, Vec<f32>)],
) -> Result<ShardPaths, IndexError> {
    let paths = ShardPaths::in_dir(dir, number);
    let cols = records.first().map(|(_, v)| v.len()).unwrap_or(0);
    let mut values = Vec::with_capacity(records.len() * cols);
    let mut ids = Vec::with_capacity(records.len());
    for (idx, vector) in records {
        if vector.len() != cols {
            return Err(IndexError::DimensionMismatch {
                shard: paths.label(),
                expected: cols,
                actual: vector.len(),
            });
        }
        values.extend_from_slice(vector);
        ids.push(*idx);
    }
    let mut vec_buf = Vec::new();
    npy::write_matrix(&mut vec_buf, records.len(), cols, &values).map_err(|err| {
        IndexError::Npy {
            path: paths.embeddings.clone(),
            source: err,
        }
    })?;
    let mut id_buf = Vec::new();
    npy::write_ids(&mut id_buf, &ids).map_err(|err| IndexError::Npy {
        path: paths.indices.clone(),
        source: err,
    })?;
    write_file(&paths.embeddings, &vec_buf)?;
    write_file(&paths.indices, &id_buf)?;
    Ok(paths)
}

fn read_file(path: &Path) -> Result<Vec<u8>, IndexError> {
    fs::read(path).map_err(|err| IndexError::Io {
        path: path.to_path_buf(),
        source: err,
    })
}

fn write_file(path: &Path, bytes: &[u8]) -> Result<(), IndexError> {
    fs::write(path, bytes).map_err(|err| IndexError::Io {
        path: path.to_path_buf(),
        source: err,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn discovers_shards_in_numeric_order() {
        let dir = tempfile::tempdir().unwrap();
        write_shard(dir.path(), 10, &[(1, vec![1.0, 0.0])]).unwrap();
        write_shard(dir.path(), 2, &[(2, vec![0.0, 1.0])]).unwrap();
        fs::write(dir.path().join("README.txt"), "ignored").unwrap();

        let numbers: Vec<u64> = discover(dir.path())
            .unwrap()
            .into_iter()
            .map(|s| s.number)
            .collect();
        assert_eq!(numbers, vec![2, 10]);
    }

    #[test]
    fn zero_padded_suffixes_pair_with_their_own_files() {
        let dir = tempfile::tempdir().unwrap();
        let padded = write_shard(dir.path(), 1, &[(1, vec![1.0, 0.0])]).unwrap();
        fs::rename(&padded.embeddings, dir.path().join("embeddings_batch_01.npy")).unwrap();
        fs::rename(&padded.indices, dir.path().join("indices_batch_01.npy")).unwrap();
        write_shard(dir.path(), 1, &[(2, vec![0.0, 1.0])]).unwrap();

        let shards = discover(dir.path()).unwrap();
        assert_eq!(shards.len(), 2);
        assert!(shards
            .iter()
            .any(|s| s.indices.ends_with("indices_batch_01.npy")));

        let mut ids: Vec<Idx> = load_dir(dir.path())
            .unwrap()
            .into_iter()
            .map(|record| record.idx)
            .collect();
        ids.sort_unstable();
        assert_eq!(ids, vec![1, 2]);
    }

    #[test]
    fn missing_identifier_file_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let paths = write_shard(dir.path(), 0, &[(1, vec![1.0, 0.0])]).unwrap();
        fs::remove_file(&paths.indices).unwrap();
        assert!(matches!(
            discover(dir.path()),
            Err(IndexError::MissingIds { .. })
        ));
    }

    #[test]
    fn loaded_vectors_are_normalised() {
        let dir = tempfile::tempdir().unwrap();
        write_shard(dir.path(), 0, &[(5, vec![3.0, 4.0]), (6, vec![0.0, 2.0])]).unwrap();
        let records = load_dir(dir.path()).unwrap();
        assert_eq!(records.len(), 2);
        for record in &records {
            assert!((record.vector.norm() - 1.0).abs() < 1e-6);
        }
        assert_eq!(records[0].idx, 5);
    }

    #[test]
    fn dimension_mismatch_across_shards_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        write_shard(dir.path(), 0, &[(1, vec![1.0, 0.0])]).unwrap();
        write_shard(dir.path(), 1, &[(2, vec![1.0, 0.0, 0.0])]).unwrap();
        match load_dir(dir.path()) {
            Err(IndexError::DimensionMismatch {
                expected, actual, ..
            }) => assert_eq!((expected, actual), (2, 3)),
            other => panic!("expected dimension mismatch, got {other:?}"),
        }
    }

    #[test]
    fn zero_vector_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        write_shard(dir.path(), 0, &[(9, vec![0.0, 0.0])]).unwrap();
        assert!(matches!(
            load_dir(dir.path()),
            Err(IndexError::Normalize { idx: 9, .. })
        ));
    }
}
