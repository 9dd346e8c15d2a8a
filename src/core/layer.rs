//! Processing-layer capability.
//!
//! A layer owns one excitatory and one inhibitory state map plus its
//! feedforward/feedback weights. The network only chains layers together;
//! how a layer spikes and learns is up to the implementation.

use std::sync::Arc;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::backend::{BackendError, ComputeBackend, ImageId};
use crate::config::{ConfigError, LayerConfig};
use crate::prng::Prng;

/// Random-initialization ranges and targets shared by every layer.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct LayerInit {
    pub min_e_weight: f32,
    pub max_e_weight: f32,
    pub min_i_weight: f32,
    pub max_i_weight: f32,
    pub init_e_threshold: f32,
    pub init_i_threshold: f32,
    pub sparsity_e: f32,
    pub sparsity_i: f32,
}

impl Default for LayerInit {
    fn default() -> Self {
        Self {
            min_e_weight: -0.1,
            max_e_weight: 0.1,
            min_i_weight: -0.1,
            max_i_weight: 0.1,
            init_e_threshold: 0.5,
            init_i_threshold: 0.5,
            sparsity_e: 0.02,
            sparsity_i: 0.04,
        }
    }
}

impl LayerInit {
    pub fn with_e_weights(mut self, min: f32, max: f32) -> Self {
        self.min_e_weight = min;
        self.max_e_weight = max;
        self
    }

    pub fn with_i_weights(mut self, min: f32, max: f32) -> Self {
        self.min_i_weight = min;
        self.max_i_weight = max;
        self
    }

    pub fn with_sparsity(mut self, e: f32, i: f32) -> Self {
        self.sparsity_e = e;
        self.sparsity_i = i;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (min, max) in [
            (self.min_e_weight, self.max_e_weight),
            (self.min_i_weight, self.max_i_weight),
        ] {
            if !min.is_finite() || !max.is_finite() || min > max {
                return Err(ConfigError::WeightRange { min, max });
            }
        }
        for value in [self.sparsity_e, self.sparsity_i] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::Sparsity(value));
            }
        }
        Ok(())
    }
}

/// Per-tick activation coefficients.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct ActivationParams {
    pub eta: f32,
    pub homeo_decay: f32,
    /// Blend factor of the spike-sum kernels. Ignored by variants without
    /// spike accumulation.
    pub sum_spike_scalar: f32,
}

impl Default for ActivationParams {
    fn default() -> Self {
        Self {
            eta: 0.1,
            homeo_decay: 0.01,
            sum_spike_scalar: 0.125,
        }
    }
}

/// Per-tick synaptic learning coefficients.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct LearnParams {
    pub e_alpha: f32,
    pub e_beta: f32,
    pub e_delta: f32,
    pub i_alpha: f32,
    pub i_beta: f32,
    pub i_gamma: f32,
    pub i_delta: f32,
    pub sparsity_e: f32,
    pub sparsity_i: f32,
}

impl Default for LearnParams {
    fn default() -> Self {
        Self {
            e_alpha: 0.01,
            e_beta: 0.01,
            e_delta: 0.01,
            i_alpha: 0.01,
            i_beta: 0.01,
            i_gamma: 0.01,
            i_delta: 0.01,
            sparsity_e: 0.02,
            sparsity_i: 0.04,
        }
    }
}

/// One excitatory/inhibitory processing stage of the hierarchy.
///
/// Every method enqueues work on the backend's in-order queue and returns
/// without waiting for it.
pub trait ProcessingLayer<B: ComputeBackend + ?Sized>: Sized {
    /// Device kernels the layer dispatches, bound once and shared.
    type Kernels;

    fn create_random(
        config: &LayerConfig,
        init: &LayerInit,
        backend: &mut B,
        kernels: &Arc<Self::Kernels>,
        rng: &mut Prng,
    ) -> Result<Self, BackendError>;

    /// Excitatory activation from the feedforward map.
    fn e_activate(
        &mut self,
        backend: &mut B,
        feed_forward: ImageId,
        params: &ActivationParams,
    ) -> Result<(), BackendError>;

    /// Inhibitory activation from the feedback map.
    fn i_activate(
        &mut self,
        backend: &mut B,
        feed_back: ImageId,
        params: &ActivationParams,
    ) -> Result<(), BackendError>;

    /// Synaptic update given the map below (feedforward context) and the
    /// map above (feedback context).
    fn learn(
        &mut self,
        backend: &mut B,
        below: ImageId,
        above: ImageId,
        params: &LearnParams,
    ) -> Result<(), BackendError>;

    /// Commit this tick: rotate the layer's own double buffers.
    fn step_end(&mut self);

    /// Free every device image the layer owns.
    fn release(self, backend: &mut B) -> Result<(), BackendError>;

    fn config(&self) -> &LayerConfig;

    fn e_states(&self) -> ImageId;

    fn e_states_prev(&self) -> ImageId;

    fn i_states(&self) -> ImageId;

    fn i_states_prev(&self) -> ImageId;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_spike_scalar() {
        assert_eq!(ActivationParams::default().sum_spike_scalar, 0.125);
    }

    #[test]
    fn inverted_weight_range_is_rejected() {
        let init = LayerInit::default().with_e_weights(1.0, -1.0);
        assert!(matches!(
            init.validate(),
            Err(ConfigError::WeightRange { .. })
        ));
    }

    #[test]
    fn sparsity_outside_unit_interval_is_rejected() {
        let init = LayerInit::default().with_sparsity(0.1, 1.5);
        assert!(matches!(init.validate(), Err(ConfigError::Sparsity(_))));
        assert!(LayerInit::default().validate().is_ok());
    }
}
