//! GPU compute backend using wgpu.
//!
//! Images are flat `f32` storage buffers (x fastest, then y, then z) and
//! every kernel is a WGSL compute pipeline with an 8x8 workgroup. Each enqueue
//! is its own queue submission, so wgpu's submission order gives the in-order
//! semantics the orchestrator relies on.
//!
//! Binding convention: image arguments bind at `@binding(0..n)` in argument
//! order; the launch extent followed by every scalar argument (packed as raw
//! 32-bit words) is a read-only `array<u32>` at the next binding.
//!
//! Enable with the `gpu` feature flag.

use std::borrow::Cow;

use wgpu::util::DeviceExt;

use crate::backend::{
    BackendError, ComputeBackend, Dims2, Dims3, ImageFormat, ImageId, Kernel, KernelArg,
    KernelSignature,
};
use crate::kernels::{PREDICT, PREDICTION_INITIALIZE, PREDICTION_LEARN, SUM_SPIKES_E, SUM_SPIKES_I};

const WORKGROUP: u32 = 8;

/// WGSL source for one entry point.
#[derive(Debug)]
pub struct WgpuKernelSource {
    pub signature: &'static KernelSignature,
    pub entry_point: &'static str,
    pub source: &'static str,
}

/// A set of kernels sharing a common WGSL prelude.
#[derive(Debug)]
pub struct WgpuProgram {
    pub prelude: &'static str,
    pub kernels: &'static [WgpuKernelSource],
}

impl WgpuProgram {
    fn find(&self, name: &str) -> Option<&WgpuKernelSource> {
        self.kernels.iter().find(|k| k.signature.name == name)
    }
}

struct DeviceImage {
    buffer: wgpu::Buffer,
    dims: Dims3,
}

struct BoundPipeline {
    pipeline: wgpu::ComputePipeline,
    layout: wgpu::BindGroupLayout,
}

/// wgpu device plus the images and pipelines created on it.
pub struct WgpuBackend {
    device: wgpu::Device,
    queue: wgpu::Queue,
    adapter_name: String,
    program: &'static WgpuProgram,
    images: Vec<Option<DeviceImage>>,
    free: Vec<u32>,
    pipelines: Vec<BoundPipeline>,
}

impl WgpuBackend {
    /// Backend running the prediction-head program. Blocks until the GPU is ready.
    pub fn new() -> Result<Self, BackendError> {
        Self::with_program(&PREDICTION_HEAD_PROGRAM)
    }

    pub fn with_program(program: &'static WgpuProgram) -> Result<Self, BackendError> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });

        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::HighPerformance,
            compatible_surface: None,
            force_fallback_adapter: false,
        }))
        .ok_or_else(|| BackendError::Device("no compatible GPU adapter".to_string()))?;

        let (device, queue) = pollster::block_on(adapter.request_device(
            &wgpu::DeviceDescriptor {
                label: Some("heinet"),
                required_features: wgpu::Features::empty(),
                required_limits: wgpu::Limits::default(),
                memory_hints: wgpu::MemoryHints::Performance,
            },
            None,
        ))
        .map_err(|e| BackendError::Device(e.to_string()))?;

        let adapter_name = adapter.get_info().name;
        tracing::info!(adapter = %adapter_name, "wgpu backend ready");

        Ok(Self {
            device,
            queue,
            adapter_name,
            program,
            images: Vec::new(),
            free: Vec::new(),
            pipelines: Vec::new(),
        })
    }

    pub fn adapter_name(&self) -> &str {
        &self.adapter_name
    }

    fn image(&self, image: ImageId) -> Result<&DeviceImage, BackendError> {
        self.images
            .get(image.0 as usize)
            .and_then(Option::as_ref)
            .ok_or(BackendError::UnknownImage(image))
    }

    fn allocate(&mut self, dims: Dims3) -> Result<ImageId, BackendError> {
        if dims.volume() == 0 {
            return Err(BackendError::EmptyImage(dims));
        }
        let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("heinet image"),
            size: (dims.volume() * std::mem::size_of::<f32>()) as u64,
            usage: wgpu::BufferUsages::STORAGE
                | wgpu::BufferUsages::COPY_SRC
                | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let image = Some(DeviceImage { buffer, dims });
        if let Some(slot) = self.free.pop() {
            self.images[slot as usize] = image;
            return Ok(ImageId(slot));
        }
        let id = ImageId(self.images.len() as u32);
        self.images.push(image);
        Ok(id)
    }

    fn build_pipeline(
        &self,
        signature: &'static KernelSignature,
        source: &WgpuKernelSource,
    ) -> Result<BoundPipeline, BackendError> {
        let storage = |binding: u32, read_only: bool| wgpu::BindGroupLayoutEntry {
            binding,
            visibility: wgpu::ShaderStages::COMPUTE,
            ty: wgpu::BindingType::Buffer {
                ty: wgpu::BufferBindingType::Storage { read_only },
                has_dynamic_offset: false,
                min_binding_size: None,
            },
            count: None,
        };
        let images = signature.image_params() as u32;
        let mut entries: Vec<_> = (0..images).map(|b| storage(b, false)).collect();
        entries.push(storage(images, true));

        self.device.push_error_scope(wgpu::ErrorFilter::Validation);

        let module = self.device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some(signature.name),
            source: wgpu::ShaderSource::Wgsl(Cow::Owned(format!(
                "{}\n{}",
                self.program.prelude, source.source
            ))),
        });
        let layout = self
            .device
            .create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some(signature.name),
                entries: &entries,
            });
        let pipeline_layout = self
            .device
            .create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some(signature.name),
                bind_group_layouts: &[&layout],
                push_constant_ranges: &[],
            });
        let pipeline = self
            .device
            .create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some(signature.name),
                layout: Some(&pipeline_layout),
                module: &module,
                entry_point: Some(source.entry_point),
                compilation_options: Default::default(),
                cache: None,
            });

        if let Some(err) = pollster::block_on(self.device.pop_error_scope()) {
            return Err(BackendError::Device(format!(
                "kernel `{}` failed to build: {err}",
                signature.name
            )));
        }
        Ok(BoundPipeline { pipeline, layout })
    }

    fn submit(&self, encoder: wgpu::CommandEncoder) {
        self.queue.submit(std::iter::once(encoder.finish()));
    }
}

impl ComputeBackend for WgpuBackend {
    fn backend_name(&self) -> &str {
        "wgpu"
    }

    fn create_image_2d(
        &mut self,
        _format: ImageFormat,
        dims: Dims2,
    ) -> Result<ImageId, BackendError> {
        self.allocate(dims.with_depth(1))
    }

    fn create_image_3d(
        &mut self,
        _format: ImageFormat,
        dims: Dims3,
    ) -> Result<ImageId, BackendError> {
        self.allocate(dims)
    }

    fn image_dims(&self, image: ImageId) -> Result<Dims3, BackendError> {
        Ok(self.image(image)?.dims)
    }

    fn enqueue_fill_image(&mut self, image: ImageId, value: f32) -> Result<(), BackendError> {
        let target = self.image(image)?;
        let data = vec![value; target.dims.volume()];
        self.queue
            .write_buffer(&target.buffer, 0, bytemuck::cast_slice(&data));
        Ok(())
    }

    fn enqueue_copy_image(&mut self, src: ImageId, dst: ImageId) -> Result<(), BackendError> {
        let (from, to) = (self.image(src)?, self.image(dst)?);
        if from.dims != to.dims {
            return Err(BackendError::DimensionMismatch {
                image: dst,
                expected: from.dims,
                actual: to.dims,
            });
        }
        if src == dst {
            return Ok(());
        }
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("copy image"),
            });
        encoder.copy_buffer_to_buffer(&from.buffer, 0, &to.buffer, 0, from.buffer.size());
        self.submit(encoder);
        Ok(())
    }

    fn kernel(&mut self, signature: &'static KernelSignature) -> Result<Kernel, BackendError> {
        let source = self
            .program
            .find(signature.name)
            .ok_or_else(|| BackendError::UnknownKernel(signature.name.to_string()))?;
        if source.signature != signature {
            return Err(BackendError::SignatureMismatch {
                name: signature.name.to_string(),
            });
        }
        let bound = self.build_pipeline(signature, source)?;
        let slot = self.pipelines.len() as u32;
        self.pipelines.push(bound);
        tracing::debug!(kernel = signature.name, slot, "compiled wgpu pipeline");
        Ok(Kernel::new(slot, signature))
    }

    fn enqueue_kernel(
        &mut self,
        kernel: &Kernel,
        args: &[KernelArg],
        global: [usize; 2],
    ) -> Result<(), BackendError> {
        let signature = kernel.signature();
        signature.check(args)?;
        let bound = self
            .pipelines
            .get(kernel.slot() as usize)
            .ok_or_else(|| BackendError::UnknownKernel(kernel.name().to_string()))?;

        let mut words = vec![global[0] as u32, global[1] as u32];
        for arg in args {
            arg.pack_words(&mut words);
        }
        let params = self
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("kernel params"),
                contents: bytemuck::cast_slice(&words),
                usage: wgpu::BufferUsages::STORAGE,
            });

        let mut entries = Vec::with_capacity(args.len() + 1);
        for id in args.iter().filter_map(KernelArg::as_image) {
            entries.push(wgpu::BindGroupEntry {
                binding: entries.len() as u32,
                resource: self.image(id)?.buffer.as_entire_binding(),
            });
        }
        entries.push(wgpu::BindGroupEntry {
            binding: entries.len() as u32,
            resource: params.as_entire_binding(),
        });

        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some(signature.name),
            layout: &bound.layout,
            entries: &entries,
        });

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some(signature.name),
            });
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some(signature.name),
                timestamp_writes: None,
            });
            pass.set_pipeline(&bound.pipeline);
            pass.set_bind_group(0, &bind_group, &[]);
            pass.dispatch_workgroups(
                (global[0] as u32).div_ceil(WORKGROUP),
                (global[1] as u32).div_ceil(WORKGROUP),
                1,
            );
        }
        self.submit(encoder);
        Ok(())
    }

    fn write_image(&mut self, image: ImageId, data: &[f32]) -> Result<(), BackendError> {
        let target = self.image(image)?;
        if data.len() != target.dims.volume() {
            return Err(BackendError::DataLength {
                image,
                expected: target.dims.volume(),
                found: data.len(),
            });
        }
        self.queue
            .write_buffer(&target.buffer, 0, bytemuck::cast_slice(data));
        Ok(())
    }

    fn read_image(&mut self, image: ImageId) -> Result<Vec<f32>, BackendError> {
        let source = self.image(image)?;
        let size = source.buffer.size();
        let staging = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("staging"),
            size,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("readback"),
            });
        encoder.copy_buffer_to_buffer(&source.buffer, 0, &staging, 0, size);
        self.submit(encoder);

        let slice = staging.slice(..);
        let (tx, rx) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });
        self.device.poll(wgpu::Maintain::Wait);

        rx.recv()
            .map_err(|_| BackendError::Readback("map callback dropped".to_string()))?
            .map_err(|e| BackendError::Readback(e.to_string()))?;

        let values = {
            let data = slice.get_mapped_range();
            bytemuck::pod_collect_to_vec::<u8, f32>(&data)
        };
        staging.unmap();
        Ok(values)
    }

    fn finish(&mut self) -> Result<(), BackendError> {
        self.device.poll(wgpu::Maintain::Wait);
        Ok(())
    }

    fn release_image(&mut self, image: ImageId) -> Result<(), BackendError> {
        // Dropping the buffer defers the free until submitted work is done.
        self.images
            .get_mut(image.0 as usize)
            .and_then(Option::take)
            .ok_or(BackendError::UnknownImage(image))?;
        self.free.push(image.0);
        Ok(())
    }
}

/// WGSL ports of the prediction-head kernels.
pub static PREDICTION_HEAD_PROGRAM: WgpuProgram = WgpuProgram {
    prelude: PRELUDE,
    kernels: &[
        WgpuKernelSource {
            signature: &PREDICTION_INITIALIZE,
            entry_point: "prediction_initialize",
            source: PREDICTION_INITIALIZE_WGSL,
        },
        WgpuKernelSource {
            signature: &PREDICT,
            entry_point: "predict",
            source: PREDICT_WGSL,
        },
        WgpuKernelSource {
            signature: &PREDICTION_LEARN,
            entry_point: "prediction_learn",
            source: PREDICTION_LEARN_WGSL,
        },
        WgpuKernelSource {
            signature: &SUM_SPIKES_E,
            entry_point: "sum_spikes",
            source: SUM_SPIKES_WGSL,
        },
        WgpuKernelSource {
            signature: &SUM_SPIKES_I,
            entry_point: "sum_spikes",
            source: SUM_SPIKES_WGSL,
        },
    ],
};

const PRELUDE: &str = r#"
fn pcg_hash(v: u32) -> u32 {
    let state = v * 747796405u + 2891336453u;
    let word = ((state >> ((state >> 28u) + 4u)) ^ state) * 277803737u;
    return (word >> 22u) ^ word;
}

fn tap_uniform(seed: vec2<u32>, x: u32, y: u32, tap: u32) -> f32 {
    let h = pcg_hash(seed.x ^ pcg_hash(seed.y ^ pcg_hash(x ^ pcg_hash(y ^ pcg_hash(tap)))));
    return f32(h >> 8u) / 16777216.0;
}

// round() in WGSL is half-to-even; the coordinate is never negative here.
fn project(x: u32, scale: f32) -> i32 {
    return i32(floor((f32(x) + 1.0) * scale + 0.5)) - 1;
}

fn word_f32(w: u32) -> f32 {
    return bitcast<f32>(w);
}

fn word_i32(w: u32) -> i32 {
    return bitcast<i32>(w);
}
"#;

const PREDICTION_INITIALIZE_WGSL: &str = r#"
@group(0) @binding(0) var<storage, read_write> weights_e: array<f32>;
@group(0) @binding(1) var<storage, read_write> weights_i: array<f32>;
@group(0) @binding(2) var<storage, read> params: array<u32>;

@compute @workgroup_size(8, 8)
fn prediction_initialize(@builtin(global_invocation_id) gid: vec3<u32>) {
    let extent = vec2<u32>(params[0], params[1]);
    if gid.x >= extent.x || gid.y >= extent.y {
        return;
    }
    let size_e = u32(max(word_i32(params[2]), 0));
    let size_i = u32(max(word_i32(params[3]), 0));
    let lo = word_f32(params[4]);
    let hi = word_f32(params[5]);
    let seed_e = vec2<u32>(params[6], params[7]);
    let seed_i = vec2<u32>(params[6], params[7] ^ 0x9E3779B9u);

    let plane = extent.x * extent.y;
    let base = gid.y * extent.x + gid.x;
    for (var t = 0u; t < size_e; t = t + 1u) {
        weights_e[t * plane + base] = lo + (hi - lo) * tap_uniform(seed_e, gid.x, gid.y, t);
    }
    for (var t = 0u; t < size_i; t = t + 1u) {
        weights_i[t * plane + base] = lo + (hi - lo) * tap_uniform(seed_i, gid.x, gid.y, t);
    }
}
"#;

const PREDICT_WGSL: &str = r#"
@group(0) @binding(0) var<storage, read_write> e_source: array<f32>;
@group(0) @binding(1) var<storage, read_write> i_source: array<f32>;
@group(0) @binding(2) var<storage, read_write> weights_e_prev: array<f32>;
@group(0) @binding(3) var<storage, read_write> weights_i_prev: array<f32>;
@group(0) @binding(4) var<storage, read_write> prediction: array<f32>;
@group(0) @binding(5) var<storage, read> params: array<u32>;

@compute @workgroup_size(8, 8)
fn predict(@builtin(global_invocation_id) gid: vec3<u32>) {
    let extent = vec2<u32>(params[0], params[1]);
    if gid.x >= extent.x || gid.y >= extent.y {
        return;
    }
    let scale_e = vec2<f32>(word_f32(params[2]), word_f32(params[3]));
    let scale_i = vec2<f32>(word_f32(params[4]), word_f32(params[5]));
    let e_dims = vec2<i32>(word_i32(params[6]), word_i32(params[7]));
    let i_dims = vec2<i32>(word_i32(params[8]), word_i32(params[9]));
    let radius_e = word_i32(params[10]);
    let radius_i = word_i32(params[11]);

    let plane = extent.x * extent.y;
    let base = gid.y * extent.x + gid.x;
    var sum = 0.0;

    let ce = vec2<i32>(project(gid.x, scale_e.x), project(gid.y, scale_e.y));
    for (var dx = -radius_e; dx <= radius_e; dx = dx + 1) {
        for (var dy = -radius_e; dy <= radius_e; dy = dy + 1) {
            let s = ce + vec2<i32>(dx, dy);
            if s.x < 0 || s.y < 0 || s.x >= e_dims.x || s.y >= e_dims.y {
                continue;
            }
            let tap = u32((dx + radius_e) * (2 * radius_e + 1) + dy + radius_e);
            sum = sum + weights_e_prev[tap * plane + base] * e_source[u32(s.y * e_dims.x + s.x)];
        }
    }

    let ci = vec2<i32>(project(gid.x, scale_i.x), project(gid.y, scale_i.y));
    for (var dx = -radius_i; dx <= radius_i; dx = dx + 1) {
        for (var dy = -radius_i; dy <= radius_i; dy = dy + 1) {
            let s = ci + vec2<i32>(dx, dy);
            if s.x < 0 || s.y < 0 || s.x >= i_dims.x || s.y >= i_dims.y {
                continue;
            }
            let tap = u32((dx + radius_i) * (2 * radius_i + 1) + dy + radius_i);
            sum = sum + weights_i_prev[tap * plane + base] * i_source[u32(s.y * i_dims.x + s.x)];
        }
    }

    prediction[base] = sum;
}
"#;

const PREDICTION_LEARN_WGSL: &str = r#"
@group(0) @binding(0) var<storage, read_write> e_source: array<f32>;
@group(0) @binding(1) var<storage, read_write> i_source: array<f32>;
@group(0) @binding(2) var<storage, read_write> target_map: array<f32>;
@group(0) @binding(3) var<storage, read_write> predicted: array<f32>;
@group(0) @binding(4) var<storage, read_write> weights_e_prev: array<f32>;
@group(0) @binding(5) var<storage, read_write> weights_i_prev: array<f32>;
@group(0) @binding(6) var<storage, read_write> weights_e: array<f32>;
@group(0) @binding(7) var<storage, read_write> weights_i: array<f32>;
@group(0) @binding(8) var<storage, read> params: array<u32>;

@compute @workgroup_size(8, 8)
fn prediction_learn(@builtin(global_invocation_id) gid: vec3<u32>) {
    let extent = vec2<u32>(params[0], params[1]);
    if gid.x >= extent.x || gid.y >= extent.y {
        return;
    }
    let scale_e = vec2<f32>(word_f32(params[2]), word_f32(params[3]));
    let scale_i = vec2<f32>(word_f32(params[4]), word_f32(params[5]));
    let e_dims = vec2<i32>(word_i32(params[6]), word_i32(params[7]));
    let i_dims = vec2<i32>(word_i32(params[8]), word_i32(params[9]));
    let radius_e = word_i32(params[10]);
    let radius_i = word_i32(params[11]);
    let alpha = word_f32(params[12]);

    let plane = extent.x * extent.y;
    let base = gid.y * extent.x + gid.x;
    let step = alpha * (target_map[base] - predicted[base]);

    let ce = vec2<i32>(project(gid.x, scale_e.x), project(gid.y, scale_e.y));
    for (var dx = -radius_e; dx <= radius_e; dx = dx + 1) {
        for (var dy = -radius_e; dy <= radius_e; dy = dy + 1) {
            let s = ce + vec2<i32>(dx, dy);
            var activity = 0.0;
            if s.x >= 0 && s.y >= 0 && s.x < e_dims.x && s.y < e_dims.y {
                activity = e_source[u32(s.y * e_dims.x + s.x)];
            }
            let w = (u32((dx + radius_e) * (2 * radius_e + 1) + dy + radius_e)) * plane + base;
            weights_e[w] = weights_e_prev[w] + step * activity;
        }
    }

    let ci = vec2<i32>(project(gid.x, scale_i.x), project(gid.y, scale_i.y));
    for (var dx = -radius_i; dx <= radius_i; dx = dx + 1) {
        for (var dy = -radius_i; dy <= radius_i; dy = dy + 1) {
            let s = ci + vec2<i32>(dx, dy);
            var activity = 0.0;
            if s.x >= 0 && s.y >= 0 && s.x < i_dims.x && s.y < i_dims.y {
                activity = i_source[u32(s.y * i_dims.x + s.x)];
            }
            let w = (u32((dx + radius_i) * (2 * radius_i + 1) + dy + radius_i)) * plane + base;
            weights_i[w] = weights_i_prev[w] + step * activity;
        }
    }
}
"#;

const SUM_SPIKES_WGSL: &str = r#"
@group(0) @binding(0) var<storage, read_write> states: array<f32>;
@group(0) @binding(1) var<storage, read_write> sums_prev: array<f32>;
@group(0) @binding(2) var<storage, read_write> sums: array<f32>;
@group(0) @binding(3) var<storage, read> params: array<u32>;

@compute @workgroup_size(8, 8)
fn sum_spikes(@builtin(global_invocation_id) gid: vec3<u32>) {
    let extent = vec2<u32>(params[0], params[1]);
    if gid.x >= extent.x || gid.y >= extent.y {
        return;
    }
    let scalar = word_f32(params[2]);
    let i = gid.y * extent.x + gid.x;
    sums[i] = sums_prev[i] * (1.0 - scalar) + scalar * states[i];
}
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::CpuBackend;
    use crate::kernels::{dims_scale, footprint};

    const TOLERANCE: f32 = 1e-4;

    /// Outputs of one initialize, predict and learn pass.
    struct HeadRun {
        init_e: Vec<f32>,
        init_i: Vec<f32>,
        prediction: Vec<f32>,
        learned_e: Vec<f32>,
        learned_i: Vec<f32>,
    }

    fn pattern(len: usize, phase: usize) -> Vec<f32> {
        (0..len).map(|i| ((i * 7 + phase) % 11) as f32 / 10.0).collect()
    }

    // A 7x7 feedforward grid over smaller maps so the projection is not the
    // identity, with both radii reaching past the map borders.
    fn run_prediction_head<B: ComputeBackend>(backend: &mut B) -> HeadRun {
        let ff = Dims2::new(7, 7);
        let (e_dims, i_dims) = (Dims2::new(3, 3), Dims2::new(4, 2));
        let (radius_e, radius_i) = (2, 1);
        let (size_e, size_i) = (footprint(radius_e), footprint(radius_i));
        let (scale_e, scale_i) = (
            dims_scale(e_dims.as_i32(), ff.as_i32()),
            dims_scale(i_dims.as_i32(), ff.as_i32()),
        );

        let f = ImageFormat::R32Float;
        let e_src = backend.create_image_2d(f, e_dims).unwrap();
        let i_src = backend.create_image_2d(f, i_dims).unwrap();
        let target = backend.create_image_2d(f, ff).unwrap();
        let prediction = backend.create_image_2d(f, ff).unwrap();
        let w_e_prev = backend.create_image_3d(f, ff.with_depth(size_e)).unwrap();
        let w_i_prev = backend.create_image_3d(f, ff.with_depth(size_i)).unwrap();
        let w_e = backend.create_image_3d(f, ff.with_depth(size_e)).unwrap();
        let w_i = backend.create_image_3d(f, ff.with_depth(size_i)).unwrap();

        backend.write_image(e_src, &pattern(e_dims.area(), 1)).unwrap();
        backend.write_image(i_src, &pattern(i_dims.area(), 4)).unwrap();
        backend.write_image(target, &pattern(ff.area(), 2)).unwrap();

        let init = backend.kernel(&PREDICTION_INITIALIZE).unwrap();
        backend
            .enqueue_kernel(
                &init,
                &[
                    KernelArg::Image(w_e_prev),
                    KernelArg::Image(w_i_prev),
                    KernelArg::Int(size_e as i32),
                    KernelArg::Int(size_i as i32),
                    KernelArg::Float(-0.25),
                    KernelArg::Float(0.5),
                    KernelArg::Uint2([0xDEAD_BEEF, 17]),
                ],
                ff.global(),
            )
            .unwrap();
        let init_e = backend.read_image(w_e_prev).unwrap();
        let init_i = backend.read_image(w_i_prev).unwrap();

        let predict = backend.kernel(&PREDICT).unwrap();
        backend
            .enqueue_kernel(
                &predict,
                &[
                    KernelArg::Image(e_src),
                    KernelArg::Image(i_src),
                    KernelArg::Image(w_e_prev),
                    KernelArg::Image(w_i_prev),
                    KernelArg::Image(prediction),
                    KernelArg::Float2(scale_e),
                    KernelArg::Float2(scale_i),
                    KernelArg::Int2(e_dims.as_i32()),
                    KernelArg::Int2(i_dims.as_i32()),
                    KernelArg::Int(radius_e),
                    KernelArg::Int(radius_i),
                ],
                ff.global(),
            )
            .unwrap();
        let predicted = backend.read_image(prediction).unwrap();

        let learn = backend.kernel(&PREDICTION_LEARN).unwrap();
        backend
            .enqueue_kernel(
                &learn,
                &[
                    KernelArg::Image(e_src),
                    KernelArg::Image(i_src),
                    KernelArg::Image(target),
                    KernelArg::Image(prediction),
                    KernelArg::Image(w_e_prev),
                    KernelArg::Image(w_i_prev),
                    KernelArg::Image(w_e),
                    KernelArg::Image(w_i),
                    KernelArg::Float2(scale_e),
                    KernelArg::Float2(scale_i),
                    KernelArg::Int2(e_dims.as_i32()),
                    KernelArg::Int2(i_dims.as_i32()),
                    KernelArg::Int(radius_e),
                    KernelArg::Int(radius_i),
                    KernelArg::Float(0.1),
                ],
                ff.global(),
            )
            .unwrap();

        HeadRun {
            init_e,
            init_i,
            prediction: predicted,
            learned_e: backend.read_image(w_e).unwrap(),
            learned_i: backend.read_image(w_i).unwrap(),
        }
    }

    fn assert_close(what: &str, actual: &[f32], expected: &[f32]) {
        assert_eq!(actual.len(), expected.len(), "{what}: length");
        for (i, (a, b)) in actual.iter().zip(expected.iter()).enumerate() {
            assert!((a - b).abs() < TOLERANCE, "{what}[{i}]: {a} vs {b}");
        }
    }

    fn run_sum_spikes<B: ComputeBackend>(backend: &mut B) -> Vec<f32> {
        let dims = Dims2::new(5, 3);
        let states = backend.create_image_2d(ImageFormat::R32Float, dims).unwrap();
        let prev = backend.create_image_2d(ImageFormat::R32Float, dims).unwrap();
        let sums = backend.create_image_2d(ImageFormat::R32Float, dims).unwrap();
        let input: Vec<f32> = (0..dims.area()).map(|i| (i % 2) as f32).collect();
        backend.write_image(states, &input).unwrap();
        backend.enqueue_fill_image(prev, 0.5).unwrap();

        let kernel = backend.kernel(&SUM_SPIKES_E).unwrap();
        backend
            .enqueue_kernel(
                &kernel,
                &[
                    KernelArg::Image(states),
                    KernelArg::Image(prev),
                    KernelArg::Image(sums),
                    KernelArg::Float(0.125),
                ],
                dims.global(),
            )
            .unwrap();
        backend.read_image(sums).unwrap()
    }

    #[test]
    fn wgpu_matches_cpu_reference() {
        // No adapter is expected in some CI environments.
        let Ok(mut gpu) = WgpuBackend::new() else {
            return;
        };
        let mut cpu = CpuBackend::with_reference_kernels();
        let expected = run_sum_spikes(&mut cpu);
        let actual = run_sum_spikes(&mut gpu);
        for (a, b) in actual.iter().zip(expected.iter()) {
            assert!((a - b).abs() < 1e-6, "{a} vs {b}");
        }
    }

    #[test]
    fn prediction_head_matches_cpu_reference() {
        let Ok(mut gpu) = WgpuBackend::new() else {
            return;
        };
        let mut cpu = CpuBackend::with_reference_kernels();
        let expected = run_prediction_head(&mut cpu);
        let actual = run_prediction_head(&mut gpu);

        assert_close("init_e", &actual.init_e, &expected.init_e);
        assert_close("init_i", &actual.init_i, &expected.init_i);
        assert!(expected.init_e.iter().any(|w| *w != 0.0));
        assert_ne!(expected.init_e[..9], expected.init_i[..9]);
        assert_close("prediction", &actual.prediction, &expected.prediction);
        assert!(expected.prediction.iter().any(|p| *p != 0.0));
        assert_close("learned_e", &actual.learned_e, &expected.learned_e);
        assert_close("learned_i", &actual.learned_i, &expected.learned_i);
    }

    #[test]
    fn program_covers_every_signature() {
        for signature in crate::kernels::ALL_SIGNATURES.iter() {
            let source = PREDICTION_HEAD_PROGRAM.find(signature.name).unwrap();
            assert_eq!(source.signature, *signature);
        }
    }
}
