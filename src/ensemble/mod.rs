//! Rotating ensemble of reference models.
//!
//! The ensemble holds `N` snapshots of past global weights (`N` always odd,
//! so majority votes over the slots never tie). After round `r` the new
//! global weights replace slot `r mod N`; over any window of `N` consecutive
//! rounds every slot is rewritten exactly once, in round order.

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::FedvalError;
use crate::transport::Evaluator;
use crate::weights::{Metrics, WeightVector};

/// Ensemble size used when none is configured.
pub const DEFAULT_ENSEMBLE_SIZE: usize = 3;

/// Round the configured ensemble size up to the next odd number.
///
/// `0` becomes `1`, even sizes gain one slot, odd sizes are unchanged.
pub fn effective_ensemble_size(configured: usize) -> usize {
    if configured % 2 == 0 {
        configured + 1
    } else {
        configured
    }
}

/// One reference slot.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReferenceModel {
    /// Slot position in `[0, N)`
    pub slot: usize,
    /// Snapshot weights
    pub weights: WeightVector,
    /// Round that last wrote this slot (`None` while still holding the initial weights)
    pub last_updated_round: Option<u64>,
}

/// Fixed-size rotating buffer of reference models.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReferenceEnsemble {
    slots: Vec<ReferenceModel>,
}

impl ReferenceEnsemble {
    /// Create an ensemble with every slot holding `initial`.
    ///
    /// `configured_size` is forced odd with [`effective_ensemble_size`].
    pub fn new(configured_size: usize, initial: &WeightVector) -> Self {
        let size = effective_ensemble_size(configured_size);
        let slots = (0..size)
            .map(|slot| ReferenceModel {
                slot,
                weights: initial.clone(),
                last_updated_round: None,
            })
            .collect();
        Self { slots }
    }

    /// Number of slots (always odd).
    pub fn size(&self) -> usize {
        self.slots.len()
    }

    /// All slots in slot order.
    pub fn slots(&self) -> &[ReferenceModel] {
        &self.slots
    }

    /// A single slot.
    pub fn slot(&self, index: usize) -> Option<&ReferenceModel> {
        self.slots.get(index)
    }

    /// Slot written by round `round`.
    pub fn slot_for_round(&self, round: u64) -> usize {
        (round % self.slots.len() as u64) as usize
    }

    /// Evaluate every slot against the held-out set, in slot order.
    ///
    /// Slots are independent, so they are scored in parallel.
    pub fn evaluate_all<E: Evaluator + ?Sized>(
        &self,
        evaluator: &E,
    ) -> Result<Vec<Metrics>, FedvalError> {
        self.slots
            .par_iter()
            .map(|slot| evaluator.evaluate(&slot.weights))
            .collect()
    }

    /// Write `weights` into slot `round mod N`.
    ///
    /// # Errors
    ///
    /// [`FedvalError::ShapeMismatch`] if `weights` is not structurally
    /// identical to the slot it replaces; the ensemble is left unchanged.
    pub fn update_slot(&mut self, round: u64, weights: WeightVector) -> Result<usize, FedvalError> {
        let index = self.slot_for_round(round);
        let slot = &mut self.slots[index];
        slot.weights.check_compatible(&weights)?;
        slot.weights = weights;
        slot.last_updated_round = Some(round);
        Ok(index)
    }
}
