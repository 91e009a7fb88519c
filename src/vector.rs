//! Unit-length embedding vectors.
//!
//! Index vectors and query vectors are compared by inner product, which only
//! equals cosine similarity when both sides have unit L2 norm. Rather than
//! trusting every producer to normalise, the index and the search path only
//! accept [`UnitVector`], which can only be built by [`UnitVector::normalize`].

use serde::Serialize;
use thiserror::Error;

/// Allowed deviation of `‖v‖₂` from 1.0 for a vector to count as normalised.
pub const NORM_TOLERANCE: f32 = 1e-3;

/// Reasons a raw vector cannot be turned into a [`UnitVector`].
#[derive(Debug, Clone, PartialEq, Error)]
pub enum NormalizeError {
    /// The vector has no components.
    #[error("vector is empty")]
    Empty,
    /// At least one component is NaN or infinite.
    #[error("vector contains a non-finite component at position {0}")]
    NonFinite(usize),
    /// The vector has zero length and therefore no direction.
    #[error("vector has zero norm")]
    Zero,
    /// A buffer claimed to be normalised was not.
    #[error("vector norm {0} is not within tolerance of 1.0")]
    NotUnit(f32),
}

/// A dense vector with L2 norm 1 (within [`NORM_TOLERANCE`]).
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(transparent)]
pub struct UnitVector(Vec<f32>);

impl UnitVector {
    /// Scales `raw` to unit length.
    pub fn normalize(mut raw: Vec<f32>) -> Result<Self, NormalizeError> {
        if raw.is_empty() {
            return Err(NormalizeError::Empty);
        }
        if let Some(pos) = raw.iter().position(|v| !v.is_finite()) {
            return Err(NormalizeError::NonFinite(pos));
        }
        let norm = l2_norm(&raw);
        if norm == 0.0 || !norm.is_finite() {
            return Err(NormalizeError::Zero);
        }
        for value in raw.iter_mut() {
            *value /= norm;
        }
        let unit = Self(raw);
        unit.check()?;
        Ok(unit)
    }

    fn check(&self) -> Result<(), NormalizeError> {
        let norm = l2_norm(&self.0);
        if is_unit_norm(norm) {
            Ok(())
        } else {
            Err(NormalizeError::NotUnit(norm))
        }
    }

    /// Number of components.
    pub fn dimension(&self) -> usize {
        self.0.len()
    }

    /// Borrow the components.
    pub fn as_slice(&self) -> &[f32] {
        &self.0
    }

    /// L2 norm of the vector (≈ 1.0 by construction).
    pub fn norm(&self) -> f32 {
        l2_norm(&self.0)
    }
}

impl AsRef<[f32]> for UnitVector {
    fn as_ref(&self) -> &[f32] {
        &self.0
    }
}

/// Euclidean norm accumulated in f64 to keep 1e-3 tolerance meaningful for wide vectors.
pub fn l2_norm(values: &[f32]) -> f32 {
    values
        .iter()
        .map(|v| f64::from(*v) * f64::from(*v))
        .sum::<f64>()
        .sqrt() as f32
}

/// Whether `norm` counts as unit length.
pub fn is_unit_norm(norm: f32) -> bool {
    (norm - 1.0).abs() <= NORM_TOLERANCE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_to_unit_length() {
        let unit = UnitVector::normalize(vec![3.0, 4.0]).expect("normalizable");
        assert!((unit.norm() - 1.0).abs() < 1e-6);
        assert!((unit.as_slice()[0] - 0.6).abs() < 1e-6);
        assert!((unit.as_slice()[1] - 0.8).abs() < 1e-6);
    }

    #[test]
    fn rejects_degenerate_vectors() {
        assert_eq!(UnitVector::normalize(Vec::new()), Err(NormalizeError::Empty));
        assert_eq!(
            UnitVector::normalize(vec![0.0, 0.0]),
            Err(NormalizeError::Zero)
        );
        assert_eq!(
            UnitVector::normalize(vec![1.0, f32::NAN]),
            Err(NormalizeError::NonFinite(1))
        );
    }

    #[test]
    fn wide_vectors_stay_within_tolerance() {
        let unit = UnitVector::normalize(vec![0.001; 3072]).unwrap();
        assert!(is_unit_norm(unit.norm()));
        assert_eq!(unit.dimension(), 3072);
    }
}
