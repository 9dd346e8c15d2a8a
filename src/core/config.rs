//! Layer configuration chains and the top-level network configuration.

#[cfg(feature = "serde")]
use std::path::Path;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use thiserror::Error;

use crate::backend::Dims2;
use crate::layer::LayerInit;
use crate::network::NetworkKind;

/// Map sizes of one layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct LayerConfig {
    /// Input the excitatory population reads (the layer below's excitatory map).
    pub feed_forward: Dims2,
    pub excitatory: Dims2,
    pub inhibitory: Dims2,
    /// Input the inhibitory population reads (the layer above's inhibitory
    /// map, or 1x1 at the top).
    pub feed_back: Dims2,
}

/// Excitatory and inhibitory sizes requested for one layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct LayerSizes {
    pub excitatory: Dims2,
    pub inhibitory: Dims2,
}

impl LayerSizes {
    pub fn new(excitatory: Dims2, inhibitory: Dims2) -> Self {
        Self {
            excitatory,
            inhibitory,
        }
    }
}

/// Largest accepted prediction radius: a 129x129 footprint per pixel.
pub const MAX_PREDICTION_RADIUS: i32 = 64;

/// Receptive-field radii of the prediction head.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct PredictionRadii {
    pub from_e: i32,
    pub from_i: i32,
}

impl PredictionRadii {
    pub fn new(from_e: i32, from_i: i32) -> Self {
        Self { from_e, from_i }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for radius in [self.from_e, self.from_i] {
            if radius < 0 {
                return Err(ConfigError::NegativeRadius(radius));
            }
            if radius > MAX_PREDICTION_RADIUS {
                return Err(ConfigError::RadiusTooLarge {
                    radius,
                    max: MAX_PREDICTION_RADIUS,
                });
            }
        }
        Ok(())
    }
}

impl Default for PredictionRadii {
    fn default() -> Self {
        Self::new(2, 2)
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{excitatory} excitatory sizes but {inhibitory} inhibitory sizes")]
    SizeListMismatch {
        excitatory: usize,
        inhibitory: usize,
    },

    #[error("a network needs at least one layer")]
    NoLayers,

    #[error("layer {layer}: {map} map is empty ({dims})")]
    EmptyMap {
        layer: usize,
        map: &'static str,
        dims: Dims2,
    },

    #[error("layer {layer}: feedforward {found} does not match {expected} from the layer below")]
    FeedForwardChain {
        layer: usize,
        expected: Dims2,
        found: Dims2,
    },

    #[error("layer {layer}: feedback {found} does not match {expected} from the layer above")]
    FeedBackChain {
        layer: usize,
        expected: Dims2,
        found: Dims2,
    },

    #[error("prediction radius {0} is negative")]
    NegativeRadius(i32),

    #[error("prediction radius {radius} exceeds the maximum of {max}")]
    RadiusTooLarge { radius: i32, max: i32 },

    #[error("weight range [{min}, {max}] is empty or not finite")]
    WeightRange { min: f32, max: f32 },

    #[error("sparsity {0} is outside [0, 1]")]
    Sparsity(f32),

    #[error("config wants a {wanted:?} network but the kernel set was bound for {bound:?}")]
    KindMismatch {
        wanted: NetworkKind,
        bound: NetworkKind,
    },

    #[cfg(feature = "serde")]
    #[error("config json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("config io: {0}")]
    Io(#[from] std::io::Error),
}

/// Derive the chained per-layer configuration from map sizes.
///
/// Layer 0 reads `input`; layer `k > 0` reads layer `k - 1`'s excitatory
/// map. Each layer's feedback is the next layer's inhibitory map, and the top
/// layer's feedback is 1x1.
pub fn generate_configs_from_sizes(
    input: Dims2,
    e_sizes: &[Dims2],
    i_sizes: &[Dims2],
) -> Result<Vec<LayerConfig>, ConfigError> {
    if e_sizes.len() != i_sizes.len() {
        return Err(ConfigError::SizeListMismatch {
            excitatory: e_sizes.len(),
            inhibitory: i_sizes.len(),
        });
    }

    let top = e_sizes.len().saturating_sub(1);
    Ok((0..e_sizes.len())
        .map(|li| LayerConfig {
            feed_forward: if li == 0 { input } else { e_sizes[li - 1] },
            excitatory: e_sizes[li],
            inhibitory: i_sizes[li],
            feed_back: if li == top {
                Dims2::new(1, 1)
            } else {
                i_sizes[li + 1]
            },
        })
        .collect())
}

/// Check that `configs` form a valid chain.
pub fn validate_chain(configs: &[LayerConfig]) -> Result<(), ConfigError> {
    if configs.is_empty() {
        return Err(ConfigError::NoLayers);
    }

    let top = configs.len() - 1;
    for (li, config) in configs.iter().enumerate() {
        for (map, dims) in [
            ("feedforward", config.feed_forward),
            ("excitatory", config.excitatory),
            ("inhibitory", config.inhibitory),
            ("feedback", config.feed_back),
        ] {
            if dims.is_empty() {
                return Err(ConfigError::EmptyMap {
                    layer: li,
                    map,
                    dims,
                });
            }
        }

        if li > 0 && config.feed_forward != configs[li - 1].excitatory {
            return Err(ConfigError::FeedForwardChain {
                layer: li,
                expected: configs[li - 1].excitatory,
                found: config.feed_forward,
            });
        }

        let expected = if li == top {
            Dims2::new(1, 1)
        } else {
            configs[li + 1].inhibitory
        };
        if config.feed_back != expected {
            return Err(ConfigError::FeedBackChain {
                layer: li,
                expected,
                found: config.feed_back,
            });
        }
    }
    Ok(())
}

/// Everything needed to build a network, loadable from JSON.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct NetworkConfig {
    pub kind: NetworkKind,
    pub input: Dims2,
    pub layers: Vec<LayerSizes>,
    pub radii: PredictionRadii,
    pub init: LayerInit,
    /// Seed for layer initialization and the prediction-head seed draw.
    pub seed: u64,
}

impl Default for NetworkConfig {
    /// A single 16x16 layer over a 16x16 input with an 8x8 inhibitory map.
    fn default() -> Self {
        Self {
            kind: NetworkKind::default(),
            input: Dims2::new(16, 16),
            layers: vec![LayerSizes::new(Dims2::new(16, 16), Dims2::new(8, 8))],
            radii: PredictionRadii::default(),
            init: LayerInit::default(),
            seed: 1,
        }
    }
}

impl NetworkConfig {
    /// Config with no layers yet; add them with [`Self::with_layers`] or
    /// [`Self::with_layer`].
    pub fn new(kind: NetworkKind, input: Dims2) -> Self {
        Self {
            kind,
            input,
            layers: Vec::new(),
            ..Self::default()
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Replace the layer stack with paired excitatory/inhibitory sizes.
    pub fn with_layers(
        mut self,
        e_sizes: &[Dims2],
        i_sizes: &[Dims2],
    ) -> Result<Self, ConfigError> {
        if e_sizes.len() != i_sizes.len() {
            return Err(ConfigError::SizeListMismatch {
                excitatory: e_sizes.len(),
                inhibitory: i_sizes.len(),
            });
        }
        self.layers = e_sizes
            .iter()
            .zip(i_sizes.iter())
            .map(|(e, i)| LayerSizes::new(*e, *i))
            .collect();
        Ok(self)
    }

    /// Append one layer on top of the current stack.
    pub fn with_layer(mut self, excitatory: Dims2, inhibitory: Dims2) -> Self {
        self.layers.push(LayerSizes::new(excitatory, inhibitory));
        self
    }

    pub fn with_radii(mut self, from_e: i32, from_i: i32) -> Self {
        self.radii = PredictionRadii::new(from_e, from_i);
        self
    }

    pub fn with_init(mut self, init: LayerInit) -> Self {
        self.init = init;
        self
    }

    /// Chained per-layer configuration.
    pub fn layer_configs(&self) -> Result<Vec<LayerConfig>, ConfigError> {
        let e_sizes: Vec<Dims2> = self.layers.iter().map(|l| l.excitatory).collect();
        let i_sizes: Vec<Dims2> = self.layers.iter().map(|l| l.inhibitory).collect();
        generate_configs_from_sizes(self.input, &e_sizes, &i_sizes)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_chain(&self.layer_configs()?)?;
        self.radii.validate()?;
        self.init.validate()
    }

    #[cfg(feature = "serde")]
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    #[cfg(feature = "serde")]
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    #[cfg(feature = "serde")]
    pub fn to_json_string(&self) -> Result<String, ConfigError> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}
