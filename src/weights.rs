//! Core value types shared by every component.
//!
//! A [`WeightVector`] is an ordered list of dense tensors. The core never
//! looks inside the tensors beyond element-wise arithmetic, so the only
//! structural property it checks is that two vectors have the same tensor
//! shapes in the same order.

use std::collections::BTreeMap;
use std::fmt;

use ndarray::{ArrayD, IxDyn};
use serde::{Deserialize, Serialize};

use crate::error::FedvalError;

/// Named scalar metrics as reported by training or evaluation.
pub type Metrics = BTreeMap<String, f64>;

/// Stable identifier of a participant for the lifetime of a session.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(String);

impl ClientId {
    /// Create a client identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ClientId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for ClientId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Model parameters as an ordered sequence of tensors.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WeightVector {
    tensors: Vec<ArrayD<f32>>,
}

impl WeightVector {
    /// Wrap a list of tensors.
    pub fn new(tensors: Vec<ArrayD<f32>>) -> Self {
        Self { tensors }
    }

    /// Build a weight vector from `(shape, row-major values)` pairs.
    pub fn from_parts(parts: Vec<(Vec<usize>, Vec<f32>)>) -> Result<Self, FedvalError> {
        let tensors = parts
            .into_iter()
            .map(|(shape, values)| ArrayD::from_shape_vec(IxDyn(&shape), values))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { tensors })
    }

    /// A vector with the same structure as `self`, every element set to `value`.
    pub fn filled_like(&self, value: f32) -> Self {
        Self {
            tensors: self
                .tensors
                .iter()
                .map(|t| ArrayD::from_elem(t.raw_dim(), value))
                .collect(),
        }
    }

    /// The tensors in order.
    pub fn tensors(&self) -> &[ArrayD<f32>] {
        &self.tensors
    }

    /// Consume into the underlying tensors.
    pub fn into_tensors(self) -> Vec<ArrayD<f32>> {
        self.tensors
    }

    /// Number of tensors.
    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    /// Whether the vector holds no tensors.
    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    /// Total number of scalar parameters.
    pub fn num_params(&self) -> usize {
        self.tensors.iter().map(|t| t.len()).sum()
    }

    /// Tensor shapes in order.
    pub fn shapes(&self) -> Vec<Vec<usize>> {
        self.tensors.iter().map(|t| t.shape().to_vec()).collect()
    }

    /// Whether `other` has identical tensor shapes in identical order.
    pub fn is_compatible(&self, other: &WeightVector) -> bool {
        self.tensors.len() == other.tensors.len()
            && self
                .tensors
                .iter()
                .zip(other.tensors.iter())
                .all(|(a, b)| a.shape() == b.shape())
    }

    /// Like [`is_compatible`](Self::is_compatible) but returns a descriptive error.
    pub fn check_compatible(&self, other: &WeightVector) -> Result<(), FedvalError> {
        if self.tensors.len() != other.tensors.len() {
            return Err(FedvalError::ShapeMismatch(format!(
                "expected {} tensors, got {}",
                self.tensors.len(),
                other.tensors.len()
            )));
        }
        for (pos, (a, b)) in self.tensors.iter().zip(other.tensors.iter()).enumerate() {
            if a.shape() != b.shape() {
                return Err(FedvalError::ShapeMismatch(format!(
                    "tensor {}: expected shape {:?}, got {:?}",
                    pos,
                    a.shape(),
                    b.shape()
                )));
            }
        }
        Ok(())
    }
}

impl From<Vec<ArrayD<f32>>> for WeightVector {
    fn from(tensors: Vec<ArrayD<f32>>) -> Self {
        Self::new(tensors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn two_tensor(a: f32, b: f32) -> WeightVector {
        WeightVector::new(vec![
            array![[a, a], [a, a]].into_dyn(),
            array![b, b, b].into_dyn(),
        ])
    }

    #[test]
    fn test_compatible_same_shapes() {
        assert!(two_tensor(1.0, 2.0).is_compatible(&two_tensor(3.0, 4.0)));
    }

    #[test]
    fn test_incompatible_tensor_count() {
        let a = two_tensor(1.0, 2.0);
        let b = WeightVector::new(vec![array![[1.0, 1.0], [1.0, 1.0]].into_dyn()]);
        assert!(!a.is_compatible(&b));
        assert!(matches!(
            a.check_compatible(&b),
            Err(FedvalError::ShapeMismatch(_))
        ));
    }

    #[test]
    fn test_incompatible_shape_order() {
        let a = WeightVector::new(vec![array![1.0f32, 2.0].into_dyn(), array![[1.0f32]].into_dyn()]);
        let b = WeightVector::new(vec![array![[1.0f32]].into_dyn(), array![1.0f32, 2.0].into_dyn()]);
        assert!(!a.is_compatible(&b));
    }

    #[test]
    fn test_from_parts_and_counts() {
        let w = WeightVector::from_parts(vec![(vec![2, 3], vec![0.0; 6]), (vec![4], vec![1.0; 4])])
            .unwrap();
        assert_eq!(w.len(), 2);
        assert_eq!(w.num_params(), 10);
        assert_eq!(w.shapes(), vec![vec![2, 3], vec![4]]);
    }

    #[test]
    fn test_from_parts_bad_length() {
        let result = WeightVector::from_parts(vec![(vec![2, 2], vec![0.0; 3])]);
        assert!(matches!(result, Err(FedvalError::ShapeMismatch(_))));
    }

    #[test]
    fn test_filled_like() {
        let w = two_tensor(1.0, 2.0).filled_like(7.0);
        assert!(w.tensors().iter().all(|t| t.iter().all(|&x| x == 7.0)));
        assert!(w.is_compatible(&two_tensor(0.0, 0.0)));
    }

    #[test]
    fn test_client_id_serde_transparent() {
        let id = ClientId::new("client_7");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"client_7\"");
        assert_eq!(id.to_string(), "client_7");
    }
}
