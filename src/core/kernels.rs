//! The prediction-head kernel set.
//!
//! Five entry points are bound once at startup and shared (via `Arc`) by
//! every network built on the same backend. Each has a fixed positional
//! argument contract, expressed as a [`KernelSignature`].

use crate::backend::{BackendError, ComputeBackend, Kernel, KernelSignature, ParamKind};
use crate::network::NetworkKind;

use ParamKind::{Float, Float2, Image2d, Image3d, Int, Int2, Uint2};

/// Randomly fill both "previous" prediction weight tensors.
///
/// `(weightsFromE, weightsFromI, sizeE, sizeI, minWeight, maxWeight, seed)`,
/// dispatched over the feedforward dims.
pub static PREDICTION_INITIALIZE: KernelSignature = KernelSignature {
    name: "prediction_initialize",
    params: &[Image3d, Image3d, Int, Int, Float, Float, Uint2],
};

/// Gather a dense estimate of the next input.
///
/// `(eSource, iSource, weightsFromEPrev, weightsFromIPrev, prediction,
/// ffToE, ffToI, eDims, iDims, radiusE, radiusI)`.
pub static PREDICT: KernelSignature = KernelSignature {
    name: "predict",
    params: &[
        Image2d, Image2d, Image3d, Image3d, Image2d, Float2, Float2, Int2, Int2, Int, Int,
    ],
};

/// Delta-rule update of the prediction weights.
///
/// `(eSource, iSource, target, predicted, weightsFromEPrev, weightsFromIPrev,
/// weightsFromE, weightsFromI, ffToE, ffToI, eDims, iDims, radiusE, radiusI,
/// alpha)`.
pub static PREDICTION_LEARN: KernelSignature = KernelSignature {
    name: "prediction_learn",
    params: &[
        Image2d, Image2d, Image2d, Image2d, Image3d, Image3d, Image3d, Image3d, Float2, Float2,
        Int2, Int2, Int, Int, Float,
    ],
};

/// `(states, sumsPrev, sums, scalar)` over the excitatory dims.
pub static SUM_SPIKES_E: KernelSignature = KernelSignature {
    name: "sum_spikes_e",
    params: &[Image2d, Image2d, Image2d, Float],
};

/// `(states, sumsPrev, sums, scalar)` over the inhibitory dims.
pub static SUM_SPIKES_I: KernelSignature = KernelSignature {
    name: "sum_spikes_i",
    params: &[Image2d, Image2d, Image2d, Float],
};

/// Every prediction-head signature, in load order.
pub static ALL_SIGNATURES: [&KernelSignature; 5] = [
    &PREDICTION_INITIALIZE,
    &PREDICT,
    &PREDICTION_LEARN,
    &SUM_SPIKES_E,
    &SUM_SPIKES_I,
];

/// Kernels bound on one backend for one network variant.
#[derive(Debug, Clone)]
pub struct KernelSet {
    kind: NetworkKind,
    prediction_initialize: Kernel,
    predict: Kernel,
    prediction_learn: Kernel,
    sum_spikes: Option<SpikeKernels>,
}

#[derive(Debug, Clone, Copy)]
pub struct SpikeKernels {
    pub e: Kernel,
    pub i: Kernel,
}

impl KernelSet {
    /// Bind the entry points `kind` needs.
    pub fn load<B: ComputeBackend + ?Sized>(
        backend: &mut B,
        kind: NetworkKind,
    ) -> Result<Self, BackendError> {
        let prediction_initialize = backend.kernel(&PREDICTION_INITIALIZE)?;
        let predict = backend.kernel(&PREDICT)?;
        let prediction_learn = backend.kernel(&PREDICTION_LEARN)?;

        let sum_spikes = if kind.accumulates_spikes() {
            Some(SpikeKernels {
                e: backend.kernel(&SUM_SPIKES_E)?,
                i: backend.kernel(&SUM_SPIKES_I)?,
            })
        } else {
            None
        };

        tracing::debug!(
            backend = backend.backend_name(),
            ?kind,
            "bound prediction-head kernels"
        );

        Ok(Self {
            kind,
            prediction_initialize,
            predict,
            prediction_learn,
            sum_spikes,
        })
    }

    /// Variant this set was bound for.
    pub fn kind(&self) -> NetworkKind {
        self.kind
    }

    pub fn prediction_initialize(&self) -> &Kernel {
        &self.prediction_initialize
    }

    pub fn predict(&self) -> &Kernel {
        &self.predict
    }

    pub fn prediction_learn(&self) -> &Kernel {
        &self.prediction_learn
    }

    /// Spike summation, bound only for variants that accumulate spikes.
    pub fn sum_spikes(&self) -> Option<&SpikeKernels> {
        self.sum_spikes.as_ref()
    }
}

// ---------------------------------------------------------------------------
// Shared reference math. The CPU kernels call these directly and the WGSL
// program mirrors them line for line.
// ---------------------------------------------------------------------------

/// Receptive-field footprint for a radius: `(2r + 1)^2`.
#[inline]
pub fn footprint(radius: i32) -> usize {
    let side = 2 * radius.max(0) as usize + 1;
    side.saturating_mul(side)
}

/// Per-axis scale mapping feedforward coordinates into a target grid:
/// `(targetDim + 1) / (feedforwardDim + 1)`.
#[inline]
pub fn dims_scale(target: [i32; 2], feed_forward: [i32; 2]) -> [f32; 2] {
    [
        (target[0] + 1) as f32 / (feed_forward[0] + 1) as f32,
        (target[1] + 1) as f32 / (feed_forward[1] + 1) as f32,
    ]
}

/// Receptive-field centre in the target grid for feedforward coordinate `x`.
#[inline]
pub fn project(x: usize, scale: f32) -> i32 {
    ((x as f32 + 1.0) * scale).round() as i32 - 1
}

/// Tap index of offset `(dx, dy)` inside a radius-`r` footprint.
#[inline]
pub fn tap_index(dx: i32, dy: i32, radius: i32) -> usize {
    ((dx + radius) * (2 * radius + 1) + (dy + radius)) as usize
}

#[inline]
pub fn pcg_hash(v: u32) -> u32 {
    let state = v.wrapping_mul(747_796_405).wrapping_add(2_891_336_453);
    let word = ((state >> ((state >> 28) + 4)) ^ state).wrapping_mul(277_803_737);
    (word >> 22) ^ word
}

/// Stateless uniform draw in `[0, 1)` for one weight tap.
#[inline]
pub fn tap_uniform(seed: [u32; 2], x: u32, y: u32, tap: u32) -> f32 {
    let h = pcg_hash(seed[0] ^ pcg_hash(seed[1] ^ pcg_hash(x ^ pcg_hash(y ^ pcg_hash(tap)))));
    (h >> 8) as f32 / 16_777_216.0
}
