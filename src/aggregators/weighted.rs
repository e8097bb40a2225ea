//! Example-weighted mean of weight vectors.
//!
//! Standard federated averaging as described by McMahan et al. (2017): every
//! tensor position is the mean of the client tensors at that position,
//! weighted by a non-negative scalar (usually the client's example count).
//! Accumulation happens in `f64` so the result does not depend on input order
//! beyond final rounding.

use std::borrow::Borrow;

use ndarray::ArrayD;
use rayon::prelude::*;

use crate::error::FedvalError;
use crate::weights::WeightVector;

/// Weight-normalized element-wise mean: `Σ(w_i × weight_i) / Σ(weight_i)`.
///
/// # Arguments
///
/// * `pairs` - `(weights, scalar weight)` pairs; every vector must be
///   structurally identical to the first
///
/// # Errors
///
/// * [`FedvalError::EmptyUpdates`] when `pairs` is empty
/// * [`FedvalError::InvalidWeight`] for a negative or non-finite scalar
/// * [`FedvalError::ShapeMismatch`] when tensor shapes differ
/// * [`FedvalError::DegenerateWeights`] when the scalars sum to zero
pub fn aggregate<W>(pairs: &[(W, f64)]) -> Result<WeightVector, FedvalError>
where
    W: Borrow<WeightVector> + Sync,
{
    let (first, _) = pairs.first().ok_or(FedvalError::EmptyUpdates)?;
    let first = first.borrow();

    for (weights, scalar) in pairs {
        if !scalar.is_finite() || *scalar < 0.0 {
            return Err(FedvalError::InvalidWeight(*scalar));
        }
        first.check_compatible(weights.borrow())?;
    }

    let total: f64 = pairs.iter().map(|(_, scalar)| scalar).sum();
    if total == 0.0 {
        return Err(FedvalError::DegenerateWeights);
    }

    let tensors: Vec<ArrayD<f32>> = (0..first.len())
        .into_par_iter()
        .map(|pos| {
            let mut acc = ArrayD::<f64>::zeros(first.tensors()[pos].raw_dim());
            for (weights, scalar) in pairs {
                acc.zip_mut_with(&weights.borrow().tensors()[pos], |a, &x| {
                    *a += f64::from(x) * scalar
                });
            }
            acc.mapv(|a| (a / total) as f32)
        })
        .collect();

    Ok(WeightVector::new(tensors))
}
