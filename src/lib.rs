//! # heinet
//!
//! Host-side orchestration of hierarchical excitatory/inhibitory
//! predictive-coding networks on a parallel compute device.
//!
//! The network never computes anything itself. It owns the layer stack and a
//! prediction head, and issues kernel dispatches in a fixed order on one
//! in-order queue. Recurrence is handled with role-swapped double buffers
//! (and a triple buffer for spike sums) instead of timestamps.
//!
//! ## Quick Start
//!
//! ```ignore
//! use heinet::prelude::*;
//!
//! let mut backend = CpuBackend::with_reference_kernels();
//! let kernels = Arc::new(KernelSet::load(&mut backend, NetworkKind::HeiNet)?);
//! let config = NetworkConfig::default().with_seed(42);
//! let mut net: Network<_, MyLayer> =
//!     Network::from_config(&config, &mut backend, &layer_kernels, &kernels)?;
//!
//! net.update(&mut backend, input, zero, &ActivationParams::default())?;
//! net.predict(&mut backend)?;
//! net.learn(&mut backend, input, zero, &LearnParams::default())?;
//! net.learn_prediction(&mut backend, next_input, 0.01)?;
//! net.step_end()?;
//! net.prediction_end(&mut backend)?;
//! ```
//!
//! ## Feature Flags
//!
//! - `std` (default): Standard library support
//! - `serde` (default): Serialization of configuration types and JSON loading
//! - `parallel`: Split CPU reference kernels across threads via rayon
//! - `gpu`: wgpu compute backend
//!
//! ## Modules
//!
//! - [`network`]: The orchestrator and its step protocol
//! - [`layer`]: Processing-layer capability consumed by the network
//! - [`backend`]: Compute backend contract
//! - [`cpu`]: In-process reference backend
//! - [`kernels`]: Prediction-head kernel set
//! - [`config`]: Layer chains and network configuration
//! - [`observer`]: Read-only prediction snapshots

#[path = "core/backend.rs"]
pub mod backend;

#[path = "core/buffers.rs"]
pub mod buffers;

#[path = "core/config.rs"]
pub mod config;

#[path = "core/cpu.rs"]
pub mod cpu;

#[path = "core/error.rs"]
pub mod error;

#[path = "core/kernels.rs"]
pub mod kernels;

#[path = "core/layer.rs"]
pub mod layer;

#[path = "core/network.rs"]
pub mod network;

#[path = "core/prng.rs"]
pub mod prng;

#[path = "core/protocol.rs"]
pub mod protocol;

#[path = "core/storage.rs"]
pub mod storage;

#[cfg(feature = "gpu")]
#[path = "core/gpu.rs"]
pub mod gpu;

pub mod observer;

/// Prelude module for convenient imports.
///
/// ```
/// use heinet::prelude::*;
/// ```
pub mod prelude {
    pub use std::sync::Arc;

    pub use crate::backend::{
        BackendError, ComputeBackend, Dims2, Dims3, ImageFormat, ImageId, Kernel, KernelArg,
        KernelSignature,
    };
    pub use crate::buffers::{DoubleBuffer, SpikeAccumulator, WeightPair};
    pub use crate::config::{
        generate_configs_from_sizes, validate_chain, ConfigError, LayerConfig, LayerSizes,
        NetworkConfig, PredictionRadii,
    };
    pub use crate::cpu::{CpuBackend, Dispatch};
    pub use crate::error::NetworkError;
    pub use crate::kernels::KernelSet;
    pub use crate::layer::{ActivationParams, LayerInit, LearnParams, ProcessingLayer};
    pub use crate::network::{Network, NetworkDiagnostics, NetworkKind};
    pub use crate::observer::{PredictionObserver, PredictionSnapshot};
    pub use crate::prng::Prng;
    pub use crate::protocol::{Operation, ProtocolError, TickPhase};
    #[cfg(feature = "gpu")]
    pub use crate::gpu::WgpuBackend;
}
