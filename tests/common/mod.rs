//! Mock processing layer and helpers shared by the integration suites.
#![allow(dead_code)]

use std::sync::Arc;

use heinet::backend::{
    BackendError, ComputeBackend, Dims2, ImageFormat, ImageId, Kernel, KernelArg, KernelSignature,
    ParamKind,
};
use heinet::buffers::{release_images, DoubleBuffer};
use heinet::config::{generate_configs_from_sizes, LayerConfig, PredictionRadii};
use heinet::cpu::{CpuBackend, Dispatch, KernelContext};
use heinet::kernels::KernelSet;
use heinet::layer::{ActivationParams, LayerInit, LearnParams, ProcessingLayer};
use heinet::network::{Network, NetworkKind};
use heinet::prng::Prng;

pub static MOCK_E_ACTIVATE: KernelSignature = KernelSignature {
    name: "mock_e_activate",
    params: &[ParamKind::Image2d, ParamKind::Image2d],
};

pub static MOCK_I_ACTIVATE: KernelSignature = KernelSignature {
    name: "mock_i_activate",
    params: &[ParamKind::Image2d, ParamKind::Image2d],
};

pub static MOCK_LEARN: KernelSignature = KernelSignature {
    name: "mock_learn",
    params: &[ParamKind::Image2d, ParamKind::Image2d, ParamKind::Image2d],
};

/// `states` = mean of `input`, broadcast.
fn activate(ctx: &mut KernelContext<'_>) -> Result<(), BackendError> {
    let input = ctx.image(0)?.data();
    let mean = input.iter().sum::<f32>() / input.len() as f32;
    let len = ctx.image(1)?.data().len();
    ctx.store(1, vec![mean; len])
}

pub struct MockKernels {
    pub e_activate: Kernel,
    pub i_activate: Kernel,
    pub learn: Kernel,
}

impl MockKernels {
    pub fn load(backend: &mut CpuBackend) -> Arc<Self> {
        backend.register_kernel(&MOCK_E_ACTIVATE, activate);
        backend.register_kernel(&MOCK_I_ACTIVATE, activate);
        backend.register_kernel(&MOCK_LEARN, |_ctx| Ok(()));
        Arc::new(Self {
            e_activate: backend.kernel(&MOCK_E_ACTIVATE).unwrap(),
            i_activate: backend.kernel(&MOCK_I_ACTIVATE).unwrap(),
            learn: backend.kernel(&MOCK_LEARN).unwrap(),
        })
    }
}

/// Layer whose populations copy the mean of their input.
pub struct MockLayer {
    config: LayerConfig,
    kernels: Arc<MockKernels>,
    e: DoubleBuffer<ImageId>,
    i: DoubleBuffer<ImageId>,
    /// Host-side feedforward weights, drawn but never uploaded.
    pub weights: Vec<f32>,
    pub steps: usize,
}

fn pair(backend: &mut CpuBackend, dims: Dims2) -> Result<DoubleBuffer<ImageId>, BackendError> {
    let current = backend.create_image_2d(ImageFormat::R32Float, dims)?;
    let previous = backend.create_image_2d(ImageFormat::R32Float, dims)?;
    backend.enqueue_fill_image(current, 0.0)?;
    backend.enqueue_fill_image(previous, 0.0)?;
    Ok(DoubleBuffer::new(current, previous))
}

impl ProcessingLayer<CpuBackend> for MockLayer {
    type Kernels = MockKernels;

    fn create_random(
        config: &LayerConfig,
        init: &LayerInit,
        backend: &mut CpuBackend,
        kernels: &Arc<MockKernels>,
        rng: &mut Prng,
    ) -> Result<Self, BackendError> {
        let weights = (0..config.excitatory.area())
            .map(|_| rng.gen_range_f32(init.min_e_weight, init.max_e_weight))
            .collect();
        Ok(Self {
            config: *config,
            kernels: Arc::clone(kernels),
            e: pair(backend, config.excitatory)?,
            i: pair(backend, config.inhibitory)?,
            weights,
            steps: 0,
        })
    }

    fn e_activate(
        &mut self,
        backend: &mut CpuBackend,
        feed_forward: ImageId,
        _params: &ActivationParams,
    ) -> Result<(), BackendError> {
        backend.enqueue_kernel(
            &self.kernels.e_activate,
            &[KernelArg::Image(feed_forward), KernelArg::Image(*self.e.current())],
            self.config.excitatory.global(),
        )
    }

    fn i_activate(
        &mut self,
        backend: &mut CpuBackend,
        feed_back: ImageId,
        _params: &ActivationParams,
    ) -> Result<(), BackendError> {
        backend.enqueue_kernel(
            &self.kernels.i_activate,
            &[KernelArg::Image(feed_back), KernelArg::Image(*self.i.current())],
            self.config.inhibitory.global(),
        )
    }

    fn learn(
        &mut self,
        backend: &mut CpuBackend,
        below: ImageId,
        above: ImageId,
        _params: &LearnParams,
    ) -> Result<(), BackendError> {
        backend.enqueue_kernel(
            &self.kernels.learn,
            &[
                KernelArg::Image(below),
                KernelArg::Image(above),
                KernelArg::Image(*self.e.current()),
            ],
            self.config.excitatory.global(),
        )
    }

    fn step_end(&mut self) {
        self.e.swap();
        self.i.swap();
        self.steps += 1;
    }

    fn release(self, backend: &mut CpuBackend) -> Result<(), BackendError> {
        release_images(
            backend,
            [
                *self.e.current(),
                *self.e.previous(),
                *self.i.current(),
                *self.i.previous(),
            ],
        )
    }

    fn config(&self) -> &LayerConfig {
        &self.config
    }

    fn e_states(&self) -> ImageId {
        *self.e.current()
    }

    fn e_states_prev(&self) -> ImageId {
        *self.e.previous()
    }

    fn i_states(&self) -> ImageId {
        *self.i.current()
    }

    fn i_states_prev(&self) -> ImageId {
        *self.i.previous()
    }
}

pub type MockNetwork = Network<CpuBackend, MockLayer>;

/// A built network plus an input map (filled with 0.5) and a 1x1 zero map.
pub struct Rig {
    pub backend: CpuBackend,
    pub net: MockNetwork,
    pub input: ImageId,
    pub zero: ImageId,
}

pub fn d(w: usize, h: usize) -> Dims2 {
    Dims2::new(w, h)
}

pub fn rig(kind: NetworkKind, input: Dims2, e_sizes: &[Dims2], i_sizes: &[Dims2]) -> Rig {
    rig_with_radii(kind, input, e_sizes, i_sizes, PredictionRadii::new(1, 1))
}

pub fn rig_with_radii(
    kind: NetworkKind,
    input: Dims2,
    e_sizes: &[Dims2],
    i_sizes: &[Dims2],
    radii: PredictionRadii,
) -> Rig {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::WARN)
        .with_test_writer()
        .try_init();

    let mut backend = CpuBackend::with_reference_kernels();
    let layer_kernels = MockKernels::load(&mut backend);
    let kernels = Arc::new(KernelSet::load(&mut backend, kind).unwrap());
    let configs = generate_configs_from_sizes(input, e_sizes, i_sizes).unwrap();
    let mut rng = Prng::new(7);
    let net = Network::create_random(
        &configs,
        radii,
        &LayerInit::default(),
        &mut backend,
        &layer_kernels,
        &kernels,
        &mut rng,
    )
    .unwrap();

    let input_image = backend
        .create_image_2d(ImageFormat::R32Float, input)
        .unwrap();
    backend.enqueue_fill_image(input_image, 0.5).unwrap();
    let zero = backend
        .create_image_2d(ImageFormat::R32Float, Dims2::new(1, 1))
        .unwrap();
    backend.enqueue_fill_image(zero, 0.0).unwrap();

    Rig {
        backend,
        net,
        input: input_image,
        zero,
    }
}

impl Rig {
    /// update -> predict -> learn -> learn_prediction -> step_end -> prediction_end
    pub fn full_tick(&mut self) {
        let Rig {
            backend,
            net,
            input,
            zero,
        } = self;
        net.update(backend, *input, *zero, &ActivationParams::default())
            .unwrap();
        net.predict(backend).unwrap();
        net.learn(backend, *input, *zero, &LearnParams::default())
            .unwrap();
        net.learn_prediction(backend, *input, 0.01).unwrap();
        net.step_end().unwrap();
        net.prediction_end(backend).unwrap();
    }

    pub fn record(&mut self) {
        self.backend.take_dispatches();
        self.backend.set_recording(true);
    }

    pub fn read(&mut self, image: ImageId) -> Vec<f32> {
        self.backend.read_image(image).unwrap()
    }
}

/// Kernel dispatches only, as `(name, args)`.
pub fn kernels_only(log: &[Dispatch]) -> Vec<(&'static str, Vec<KernelArg>)> {
    log.iter()
        .filter_map(|d| match d {
            Dispatch::Kernel { name, args, .. } => Some((*name, args.clone())),
            _ => None,
        })
        .collect()
}

pub fn image_arg(args: &[KernelArg], index: usize) -> ImageId {
    args[index].as_image().unwrap()
}
