//! Network orchestrator.
//!
//! Owns the layer stack and the prediction head (weight pairs, prediction
//! maps and, for HEInet, the spike accumulators) and issues every per-tick
//! dispatch in a fixed order on the backend's queue. No host-side waiting
//! happens here; each call only enqueues work.
//!
//! Buffer roles rotate by handle exchange. The only data copies after
//! construction are the spike-sum previous-iteration snapshots taken at the
//! end of each prediction cycle.

use std::marker::PhantomData;
use std::sync::Arc;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::backend::{BackendError, ComputeBackend, Dims2, ImageId, KernelArg};
use crate::buffers::{allocate_images, release_images, DoubleBuffer, SpikeAccumulator, WeightPair};
use crate::config::{validate_chain, ConfigError, LayerConfig, NetworkConfig, PredictionRadii};
use crate::error::NetworkError;
use crate::kernels::{dims_scale, KernelSet};
use crate::layer::{ActivationParams, LayerInit, LearnParams, ProcessingLayer};
use crate::prng::Prng;
use crate::protocol::{Operation, StepProtocol, TickPhase};

/// Which of the two orchestration variants a network runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum NetworkKind {
    /// Layers chain their current states and the prediction head reads
    /// layer 0 directly.
    Htsl,
    /// Layers chain their previous-tick states and the prediction head reads
    /// decayed spike sums of layer 0.
    #[default]
    HeiNet,
}

impl NetworkKind {
    pub fn accumulates_spikes(self) -> bool {
        matches!(self, NetworkKind::HeiNet)
    }

    pub fn chains_previous_states(self) -> bool {
        matches!(self, NetworkKind::HeiNet)
    }
}

/// Spike accumulators of layer 0's two populations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpikeHistory {
    pub e: SpikeAccumulator,
    pub i: SpikeAccumulator,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetworkDiagnostics {
    pub kind: NetworkKind,
    pub layers: usize,
    /// Completed ticks (`step_end` calls).
    pub ticks: u64,
    /// Completed prediction cycles (`prediction_end` calls).
    pub prediction_cycles: u64,
    pub phase: TickPhase,
    pub predicted: bool,
    pub prediction_learned: bool,
    pub faulted: Option<Operation>,
}

/// Coordinate mapping shared by `predict` and `learn_prediction`.
struct HeadGeometry {
    global: [usize; 2],
    scale_e: [f32; 2],
    scale_i: [f32; 2],
    e_dims: [i32; 2],
    i_dims: [i32; 2],
}

pub struct Network<B, L>
where
    B: ComputeBackend + ?Sized,
    L: ProcessingLayer<B>,
{
    pub(crate) kind: NetworkKind,
    pub(crate) layers: Vec<L>,
    /// Configuration of layer 0, which sizes the prediction head.
    pub(crate) base: LayerConfig,
    pub(crate) kernels: Arc<KernelSet>,
    /// `current` is this cycle's prediction, `previous` the last one.
    pub(crate) prediction: DoubleBuffer<ImageId>,
    pub(crate) weights_from_e: WeightPair,
    pub(crate) weights_from_i: WeightPair,
    pub(crate) spikes: Option<SpikeHistory>,
    pub(crate) protocol: StepProtocol,
    pub(crate) faulted: Option<Operation>,
    _backend: PhantomData<fn(&mut B)>,
}

impl<B, L> Network<B, L>
where
    B: ComputeBackend + ?Sized,
    L: ProcessingLayer<B>,
{
    /// Build every layer and the prediction head.
    ///
    /// The variant follows `kernels.kind()`. The configuration chain is
    /// validated before anything is allocated, and a failure part way
    /// releases whatever was already allocated. Both prediction weight pairs
    /// start with identical halves.
    pub fn create_random(
        configs: &[LayerConfig],
        radii: PredictionRadii,
        init: &LayerInit,
        backend: &mut B,
        layer_kernels: &Arc<L::Kernels>,
        kernels: &Arc<KernelSet>,
        rng: &mut Prng,
    ) -> Result<Self, NetworkError> {
        validate_chain(configs)?;
        radii.validate()?;
        init.validate()?;

        let kind = kernels.kind();
        let base = configs[0];
        let feed_forward = base.feed_forward;

        let mut layers = Vec::with_capacity(configs.len());
        for config in configs {
            match L::create_random(config, init, backend, layer_kernels, rng) {
                Ok(layer) => layers.push(layer),
                Err(err) => {
                    Self::discard(backend, layers, &[]);
                    return Err(err.into());
                }
            }
        }

        let mut owned = Vec::new();
        let head = match build_head(kind, &base, radii, init, backend, kernels, rng, &mut owned) {
            Ok(head) => head,
            Err(err) => {
                Self::discard(backend, layers, &owned);
                return Err(err.into());
            }
        };
        let PredictionHead {
            prediction,
            weights_from_e,
            weights_from_i,
            spikes,
        } = head;

        tracing::info!(
            ?kind,
            layers = layers.len(),
            input = %feed_forward,
            radius_from_e = radii.from_e,
            radius_from_i = radii.from_i,
            backend = backend.backend_name(),
            "created network"
        );

        Ok(Self {
            kind,
            layers,
            base,
            kernels: Arc::clone(kernels),
            prediction,
            weights_from_e,
            weights_from_i,
            spikes,
            protocol: StepProtocol::new(),
            faulted: None,
            _backend: PhantomData,
        })
    }

    /// Free every device image held by the network and its layers.
    ///
    /// Dropping a network without calling this leaves its images allocated
    /// on the backend. Release continues past failures and reports the
    /// first one.
    pub fn release(self, backend: &mut B) -> Result<(), NetworkError> {
        let images = self.head_images();
        let count = images.len();
        let mut result = release_images(backend, images);
        for layer in self.layers {
            let released = layer.release(backend);
            if result.is_ok() {
                result = released;
            }
        }
        tracing::debug!(head_images = count, "released network");
        result.map_err(NetworkError::from)
    }

    /// Images owned by the prediction head, layers excluded.
    fn head_images(&self) -> Vec<ImageId> {
        let mut images = vec![*self.prediction.current(), *self.prediction.previous()];
        images.extend(self.weights_from_e.images());
        images.extend(self.weights_from_i.images());
        if let Some(spikes) = self.spikes.as_ref() {
            images.extend(spikes.e.images());
            images.extend(spikes.i.images());
        }
        images
    }

    fn discard(backend: &mut B, layers: Vec<L>, images: &[ImageId]) {
        let mut result = release_images(backend, images.iter().copied());
        for layer in layers {
            let released = layer.release(backend);
            if result.is_ok() {
                result = released;
            }
        }
        if let Err(err) = result {
            tracing::warn!(%err, "could not release a partially built network");
        }
    }

    /// Build from a [`NetworkConfig`], seeding a fresh [`Prng`] from it.
    pub fn from_config(
        config: &NetworkConfig,
        backend: &mut B,
        layer_kernels: &Arc<L::Kernels>,
        kernels: &Arc<KernelSet>,
    ) -> Result<Self, NetworkError> {
        if config.kind != kernels.kind() {
            return Err(ConfigError::KindMismatch {
                wanted: config.kind,
                bound: kernels.kind(),
            }
            .into());
        }
        let configs = config.layer_configs()?;
        let mut rng = Prng::new(config.seed);
        Self::create_random(
            &configs,
            config.radii,
            &config.init,
            backend,
            layer_kernels,
            kernels,
            &mut rng,
        )
    }

    /// Bottom-up excitatory pass, then top-down inhibitory pass, then (HEInet)
    /// spike summation over layer 0.
    pub fn update(
        &mut self,
        backend: &mut B,
        input: ImageId,
        zero: ImageId,
        params: &ActivationParams,
    ) -> Result<(), NetworkError> {
        self.admit(Operation::Update)?;
        self.expect_input(backend, input)?;
        let result = self.run_update(backend, input, zero, params);
        self.settle(Operation::Update, result)
    }

    /// Write the generative estimate of the next input into `prediction()`.
    pub fn predict(&mut self, backend: &mut B) -> Result<(), NetworkError> {
        self.admit(Operation::Predict)?;
        let result = self.run_predict(backend);
        self.settle(Operation::Predict, result)
    }

    /// Per-layer synaptic update. Layer 0 sees `input` below; the top layer
    /// sees `zero` above.
    pub fn learn(
        &mut self,
        backend: &mut B,
        input: ImageId,
        zero: ImageId,
        params: &LearnParams,
    ) -> Result<(), NetworkError> {
        self.admit(Operation::Learn)?;
        self.expect_input(backend, input)?;
        let result = self.run_learn(backend, input, zero, params);
        self.settle(Operation::Learn, result)
    }

    /// Delta-rule update of the prediction weights against the observed
    /// `input`. Writes the `current` halves from the `previous` ones.
    pub fn learn_prediction(
        &mut self,
        backend: &mut B,
        input: ImageId,
        alpha: f32,
    ) -> Result<(), NetworkError> {
        self.admit(Operation::LearnPrediction)?;
        self.expect_input(backend, input)?;
        let result = self.run_learn_prediction(backend, input, alpha);
        self.settle(Operation::LearnPrediction, result)
    }

    /// Commit the tick: every layer rotates its own buffers, then the spike
    /// accumulators swap current and previous.
    pub fn step_end(&mut self) -> Result<(), NetworkError> {
        self.admit(Operation::StepEnd)?;
        for layer in self.layers.iter_mut() {
            layer.step_end();
        }
        if let Some(spikes) = self.spikes.as_mut() {
            spikes.e.rotate();
            spikes.i.rotate();
        }
        self.settle(Operation::StepEnd, Ok(()))
    }

    /// Close the prediction cycle: swap the prediction maps and both weight
    /// pairs, then (HEInet) snapshot and clear the spike sums.
    pub fn prediction_end(&mut self, backend: &mut B) -> Result<(), NetworkError> {
        self.admit(Operation::PredictionEnd)?;
        self.prediction.swap();
        self.weights_from_e.swap();
        self.weights_from_i.swap();
        let result = self.spikes.as_ref().map_or(Ok(()), |spikes| {
            spikes.e.end_prediction(backend)?;
            spikes.i.end_prediction(backend)
        });
        self.settle(Operation::PredictionEnd, result)
    }

    pub fn kind(&self) -> NetworkKind {
        self.kind
    }

    pub fn layers(&self) -> &[L] {
        &self.layers
    }

    pub fn kernels(&self) -> &Arc<KernelSet> {
        &self.kernels
    }

    /// External input size (layer 0's feedforward dims).
    pub fn input_dims(&self) -> Dims2 {
        self.base.feed_forward
    }

    pub fn radii(&self) -> PredictionRadii {
        PredictionRadii::new(self.weights_from_e.radius(), self.weights_from_i.radius())
    }

    pub fn radius_from_e(&self) -> i32 {
        self.weights_from_e.radius()
    }

    pub fn radius_from_i(&self) -> i32 {
        self.weights_from_i.radius()
    }

    pub fn prediction(&self) -> ImageId {
        *self.prediction.current()
    }

    pub fn prediction_prev(&self) -> ImageId {
        *self.prediction.previous()
    }

    pub fn weights_from_e(&self) -> &WeightPair {
        &self.weights_from_e
    }

    pub fn weights_from_i(&self) -> &WeightPair {
        &self.weights_from_i
    }

    pub fn spike_history(&self) -> Option<&SpikeHistory> {
        self.spikes.as_ref()
    }

    pub fn spike_sums_e(&self) -> Option<&SpikeAccumulator> {
        self.spikes.as_ref().map(|s| &s.e)
    }

    pub fn spike_sums_i(&self) -> Option<&SpikeAccumulator> {
        self.spikes.as_ref().map(|s| &s.i)
    }

    pub fn phase(&self) -> TickPhase {
        self.protocol.phase()
    }

    pub fn is_faulted(&self) -> bool {
        self.faulted.is_some()
    }

    pub fn diagnostics(&self) -> NetworkDiagnostics {
        NetworkDiagnostics {
            kind: self.kind,
            layers: self.layers.len(),
            ticks: self.protocol.ticks(),
            prediction_cycles: self.protocol.cycles(),
            phase: self.protocol.phase(),
            predicted: self.protocol.predicted(),
            prediction_learned: self.protocol.prediction_learned(),
            faulted: self.faulted,
        }
    }

    fn admit(&self, operation: Operation) -> Result<(), NetworkError> {
        if let Some(failed) = self.faulted {
            return Err(NetworkError::Faulted(failed));
        }
        self.protocol.check(operation).map_err(|err| {
            tracing::warn!(%err, "step protocol violation");
            NetworkError::from(err)
        })
    }

    fn settle(
        &mut self,
        operation: Operation,
        result: Result<(), BackendError>,
    ) -> Result<(), NetworkError> {
        match result {
            Ok(()) => {
                self.protocol.advance(operation);
                tracing::debug!(
                    %operation,
                    tick = self.protocol.ticks(),
                    cycle = self.protocol.cycles(),
                    "network op"
                );
                Ok(())
            }
            Err(err) => {
                tracing::error!(%operation, %err, "device call failed, network faulted");
                self.faulted = Some(operation);
                Err(err.into())
            }
        }
    }

    fn expect_input(&self, backend: &B, input: ImageId) -> Result<(), NetworkError> {
        let expected = self.base.feed_forward.with_depth(1);
        let actual = backend.image_dims(input)?;
        if actual != expected {
            return Err(BackendError::DimensionMismatch {
                image: input,
                expected,
                actual,
            }
            .into());
        }
        Ok(())
    }

    fn geometry(&self) -> HeadGeometry {
        let ff = self.base.feed_forward.as_i32();
        let e_dims = self.base.excitatory.as_i32();
        let i_dims = self.base.inhibitory.as_i32();
        HeadGeometry {
            global: self.base.feed_forward.global(),
            scale_e: dims_scale(e_dims, ff),
            scale_i: dims_scale(i_dims, ff),
            e_dims,
            i_dims,
        }
    }

    fn run_update(
        &mut self,
        backend: &mut B,
        input: ImageId,
        zero: ImageId,
        params: &ActivationParams,
    ) -> Result<(), BackendError> {
        let chain_prev = self.kind.chains_previous_states();

        let mut feed = input;
        for layer in self.layers.iter_mut() {
            layer.e_activate(backend, feed, params)?;
            feed = if chain_prev {
                layer.e_states_prev()
            } else {
                layer.e_states()
            };
        }

        let mut feed = zero;
        for layer in self.layers.iter_mut().rev() {
            layer.i_activate(backend, feed, params)?;
            feed = if chain_prev {
                layer.i_states_prev()
            } else {
                layer.i_states()
            };
        }

        if let (Some(spikes), Some(sum)) = (self.spikes.as_ref(), self.kernels.sum_spikes()) {
            let first = &self.layers[0];
            backend.enqueue_kernel(
                &sum.e,
                &[
                    KernelArg::Image(first.e_states()),
                    KernelArg::Image(spikes.e.previous()),
                    KernelArg::Image(spikes.e.current()),
                    KernelArg::Float(params.sum_spike_scalar),
                ],
                self.base.excitatory.global(),
            )?;
            backend.enqueue_kernel(
                &sum.i,
                &[
                    KernelArg::Image(first.i_states()),
                    KernelArg::Image(spikes.i.previous()),
                    KernelArg::Image(spikes.i.current()),
                    KernelArg::Float(params.sum_spike_scalar),
                ],
                self.base.inhibitory.global(),
            )?;
        }
        Ok(())
    }

    fn run_predict(&self, backend: &mut B) -> Result<(), BackendError> {
        let geometry = self.geometry();
        let (e_source, i_source) = match self.spikes.as_ref() {
            Some(spikes) => (spikes.e.previous(), spikes.i.previous()),
            None => (self.layers[0].e_states(), self.layers[0].i_states()),
        };

        backend.enqueue_kernel(
            self.kernels.predict(),
            &[
                KernelArg::Image(e_source),
                KernelArg::Image(i_source),
                KernelArg::Image(self.weights_from_e.previous()),
                KernelArg::Image(self.weights_from_i.previous()),
                KernelArg::Image(*self.prediction.current()),
                KernelArg::Float2(geometry.scale_e),
                KernelArg::Float2(geometry.scale_i),
                KernelArg::Int2(geometry.e_dims),
                KernelArg::Int2(geometry.i_dims),
                KernelArg::Int(self.weights_from_e.radius()),
                KernelArg::Int(self.weights_from_i.radius()),
            ],
            geometry.global,
        )
    }

    fn run_learn(
        &mut self,
        backend: &mut B,
        input: ImageId,
        zero: ImageId,
        params: &LearnParams,
    ) -> Result<(), BackendError> {
        let top = self.layers.len() - 1;
        for li in 0..self.layers.len() {
            let below = if li == 0 {
                input
            } else {
                self.layers[li - 1].e_states()
            };
            let above = if li == top {
                zero
            } else {
                self.layers[li + 1].i_states()
            };
            self.layers[li].learn(backend, below, above, params)?;
        }
        Ok(())
    }

    fn run_learn_prediction(
        &self,
        backend: &mut B,
        input: ImageId,
        alpha: f32,
    ) -> Result<(), BackendError> {
        let geometry = self.geometry();
        let (e_source, i_source, predicted) = match self.spikes.as_ref() {
            Some(spikes) => (
                spikes.e.previous_iteration(),
                spikes.i.previous_iteration(),
                *self.prediction.previous(),
            ),
            None => (
                self.layers[0].e_states(),
                self.layers[0].i_states(),
                *self.prediction.current(),
            ),
        };

        backend.enqueue_kernel(
            self.kernels.prediction_learn(),
            &[
                KernelArg::Image(e_source),
                KernelArg::Image(i_source),
                KernelArg::Image(input),
                KernelArg::Image(predicted),
                KernelArg::Image(self.weights_from_e.previous()),
                KernelArg::Image(self.weights_from_i.previous()),
                KernelArg::Image(self.weights_from_e.current()),
                KernelArg::Image(self.weights_from_i.current()),
                KernelArg::Float2(geometry.scale_e),
                KernelArg::Float2(geometry.scale_i),
                KernelArg::Int2(geometry.e_dims),
                KernelArg::Int2(geometry.i_dims),
                KernelArg::Int(self.weights_from_e.radius()),
                KernelArg::Int(self.weights_from_i.radius()),
                KernelArg::Float(alpha),
            ],
            geometry.global,
        )
    }
}

/// Prediction-head buffers, before they are moved into a [`Network`].
struct PredictionHead {
    prediction: DoubleBuffer<ImageId>,
    weights_from_e: WeightPair,
    weights_from_i: WeightPair,
    spikes: Option<SpikeHistory>,
}

/// Allocate and initialize the prediction head. Every image allocated is
/// pushed to `owned` as soon as it exists.
#[allow(clippy::too_many_arguments)]
fn build_head<B: ComputeBackend + ?Sized>(
    kind: NetworkKind,
    base: &LayerConfig,
    radii: PredictionRadii,
    init: &LayerInit,
    backend: &mut B,
    kernels: &KernelSet,
    rng: &mut Prng,
    owned: &mut Vec<ImageId>,
) -> Result<PredictionHead, BackendError> {
    let feed_forward = base.feed_forward;

    let [current, previous] = allocate_images(backend, [feed_forward.with_depth(1); 2])?;
    owned.extend([current, previous]);
    let prediction = DoubleBuffer::new(current, previous);
    backend.enqueue_fill_image(previous, 0.0)?;

    let spikes = if kind.accumulates_spikes() {
        let e = SpikeAccumulator::allocate(backend, base.excitatory)?;
        owned.extend(e.images());
        let i = SpikeAccumulator::allocate(backend, base.inhibitory)?;
        owned.extend(i.images());
        Some(SpikeHistory { e, i })
    } else {
        None
    };

    let weights_from_e = WeightPair::allocate(backend, feed_forward, radii.from_e)?;
    owned.extend(weights_from_e.images());
    let weights_from_i = WeightPair::allocate(backend, feed_forward, radii.from_i)?;
    owned.extend(weights_from_i.images());

    // Both pathways draw from the excitatory range.
    let seed = rng.seed_pair();
    backend.enqueue_kernel(
        kernels.prediction_initialize(),
        &[
            KernelArg::Image(weights_from_e.previous()),
            KernelArg::Image(weights_from_i.previous()),
            KernelArg::Int(weights_from_e.dims().depth as i32),
            KernelArg::Int(weights_from_i.dims().depth as i32),
            KernelArg::Float(init.min_e_weight),
            KernelArg::Float(init.max_e_weight),
            KernelArg::Uint2(seed),
        ],
        feed_forward.global(),
    )?;
    weights_from_e.sync_current(backend)?;
    weights_from_i.sync_current(backend)?;

    Ok(PredictionHead {
        prediction,
        weights_from_e,
        weights_from_i,
        spikes,
    })
}
