//! In-process compute backend.
//!
//! Images live in host memory and kernels are Rust closures registered by
//! entry-point name. Dispatch is synchronous, which trivially satisfies the
//! in-order queue contract. Any registered kernel can be replaced, so tests
//! substitute deterministic synthetic kernels and inspect the recorded
//! dispatch log.

use std::collections::HashMap;
use std::sync::Arc;

#[cfg(feature = "parallel")]
use rayon::prelude::*;

use crate::backend::{
    BackendError, ComputeBackend, Dims2, Dims3, ImageFormat, ImageId, Kernel, KernelArg,
    KernelSignature, ParamKind,
};
use crate::kernels::{
    self, project, tap_index, tap_uniform, PREDICT, PREDICTION_INITIALIZE, PREDICTION_LEARN,
    SUM_SPIKES_E, SUM_SPIKES_I,
};

/// Host-resident image.
#[derive(Debug, Clone)]
pub struct CpuImage {
    dims: Dims3,
    data: Vec<f32>,
}

impl CpuImage {
    fn new(dims: Dims3) -> Self {
        Self {
            dims,
            data: vec![0.0; dims.volume()],
        }
    }

    pub fn dims(&self) -> Dims3 {
        self.dims
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [f32] {
        &mut self.data
    }

    /// Texel at `(x, y, z)`, or 0 outside the image.
    #[inline]
    pub fn at(&self, x: i32, y: i32, z: usize) -> f32 {
        if x < 0
            || y < 0
            || x as usize >= self.dims.width
            || y as usize >= self.dims.height
            || z >= self.dims.depth
        {
            return 0.0;
        }
        self.data[self.dims.index(x as usize, y as usize, z)]
    }
}

/// One operation observed by the queue, in issue order.
#[derive(Debug, Clone, PartialEq)]
pub enum Dispatch {
    Fill {
        image: ImageId,
        value: f32,
    },
    Copy {
        src: ImageId,
        dst: ImageId,
    },
    Write {
        image: ImageId,
    },
    Release {
        image: ImageId,
    },
    Kernel {
        name: &'static str,
        args: Vec<KernelArg>,
        global: [usize; 2],
    },
}

impl Dispatch {
    pub fn kernel_name(&self) -> Option<&'static str> {
        match self {
            Dispatch::Kernel { name, .. } => Some(name),
            _ => None,
        }
    }

    /// Image handles this dispatch touches, in argument order.
    pub fn images(&self) -> Vec<ImageId> {
        match self {
            Dispatch::Fill { image, .. }
            | Dispatch::Write { image }
            | Dispatch::Release { image } => vec![*image],
            Dispatch::Copy { src, dst } => vec![*src, *dst],
            Dispatch::Kernel { args, .. } => args.iter().filter_map(KernelArg::as_image).collect(),
        }
    }
}

/// View handed to a CPU kernel: resolved arguments plus image storage.
pub struct KernelContext<'a> {
    signature: &'static KernelSignature,
    images: &'a mut [Option<CpuImage>],
    args: &'a [KernelArg],
    global: [usize; 2],
}

impl<'a> KernelContext<'a> {
    pub fn global(&self) -> [usize; 2] {
        self.global
    }

    fn mismatch(&self, index: usize, expected: ParamKind) -> BackendError {
        match self.args.get(index) {
            Some(found) => BackendError::ArgumentType {
                kernel: self.signature.name,
                index,
                expected,
                found: *found,
            },
            None => BackendError::ArgumentCount {
                kernel: self.signature.name,
                expected: index + 1,
                found: self.args.len(),
            },
        }
    }

    fn image_slot(&self, index: usize) -> Result<usize, BackendError> {
        let id = self
            .args
            .get(index)
            .and_then(KernelArg::as_image)
            .ok_or_else(|| self.mismatch(index, ParamKind::Image2d))?;
        let slot = id.0 as usize;
        match self.images.get(slot) {
            Some(Some(_)) => Ok(slot),
            _ => Err(BackendError::UnknownImage(id)),
        }
    }

    /// Handle bound at `index`.
    pub fn image_id(&self, index: usize) -> Result<ImageId, BackendError> {
        let slot = self.image_slot(index)?;
        Ok(ImageId(slot as u32))
    }

    pub fn image(&self, index: usize) -> Result<&CpuImage, BackendError> {
        let slot = self.image_slot(index)?;
        self.images[slot]
            .as_ref()
            .ok_or(BackendError::UnknownImage(ImageId(slot as u32)))
    }

    pub fn image_mut(&mut self, index: usize) -> Result<&mut CpuImage, BackendError> {
        let slot = self.image_slot(index)?;
        self.images[slot]
            .as_mut()
            .ok_or(BackendError::UnknownImage(ImageId(slot as u32)))
    }

    /// Replace the contents of the image bound at `index`.
    pub fn store(&mut self, index: usize, data: Vec<f32>) -> Result<(), BackendError> {
        let id = self.image_id(index)?;
        let image = self.image_mut(index)?;
        if data.len() != image.data.len() {
            return Err(BackendError::DataLength {
                image: id,
                expected: image.data.len(),
                found: data.len(),
            });
        }
        image.data = data;
        Ok(())
    }

    pub fn int(&self, index: usize) -> Result<i32, BackendError> {
        match self.args.get(index) {
            Some(KernelArg::Int(v)) => Ok(*v),
            _ => Err(self.mismatch(index, ParamKind::Int)),
        }
    }

    pub fn float(&self, index: usize) -> Result<f32, BackendError> {
        match self.args.get(index) {
            Some(KernelArg::Float(v)) => Ok(*v),
            _ => Err(self.mismatch(index, ParamKind::Float)),
        }
    }

    pub fn int2(&self, index: usize) -> Result<[i32; 2], BackendError> {
        match self.args.get(index) {
            Some(KernelArg::Int2(v)) => Ok(*v),
            _ => Err(self.mismatch(index, ParamKind::Int2)),
        }
    }

    pub fn float2(&self, index: usize) -> Result<[f32; 2], BackendError> {
        match self.args.get(index) {
            Some(KernelArg::Float2(v)) => Ok(*v),
            _ => Err(self.mismatch(index, ParamKind::Float2)),
        }
    }

    pub fn uint2(&self, index: usize) -> Result<[u32; 2], BackendError> {
        match self.args.get(index) {
            Some(KernelArg::Uint2(v)) => Ok(*v),
            _ => Err(self.mismatch(index, ParamKind::Uint2)),
        }
    }
}

pub type CpuKernelFn =
    Arc<dyn Fn(&mut KernelContext<'_>) -> Result<(), BackendError> + Send + Sync>;

#[derive(Clone)]
struct Registered {
    signature: &'static KernelSignature,
    run: CpuKernelFn,
}

/// Host-memory backend with a replaceable kernel registry.
#[derive(Default)]
pub struct CpuBackend {
    /// Slots of released images are `None` until reused.
    images: Vec<Option<CpuImage>>,
    free: Vec<u32>,
    registry: HashMap<&'static str, Registered>,
    bound: Vec<&'static str>,
    recording: bool,
    log: Vec<Dispatch>,
}

impl CpuBackend {
    /// Backend with an empty kernel registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Backend with the prediction-head reference kernels registered.
    pub fn with_reference_kernels() -> Self {
        let mut backend = Self::new();
        backend.register_kernel(&PREDICTION_INITIALIZE, prediction_initialize);
        backend.register_kernel(&PREDICT, predict);
        backend.register_kernel(&PREDICTION_LEARN, prediction_learn);
        backend.register_kernel(&SUM_SPIKES_E, sum_spikes);
        backend.register_kernel(&SUM_SPIKES_I, sum_spikes);
        backend
    }

    /// Register (or replace) the implementation behind an entry point.
    ///
    /// Already-bound kernels pick up the replacement on their next dispatch.
    pub fn register_kernel<F>(&mut self, signature: &'static KernelSignature, run: F)
    where
        F: Fn(&mut KernelContext<'_>) -> Result<(), BackendError> + Send + Sync + 'static,
    {
        self.registry.insert(
            signature.name,
            Registered {
                signature,
                run: Arc::new(run),
            },
        );
    }

    /// Start or stop appending dispatches to the log.
    pub fn set_recording(&mut self, enabled: bool) {
        self.recording = enabled;
    }

    pub fn dispatches(&self) -> &[Dispatch] {
        &self.log
    }

    pub fn take_dispatches(&mut self) -> Vec<Dispatch> {
        std::mem::take(&mut self.log)
    }

    /// Live (allocated and not yet released) images.
    pub fn image_count(&self) -> usize {
        self.images.iter().filter(|slot| slot.is_some()).count()
    }

    /// Direct host view of an image, bypassing the queue.
    pub fn image(&self, image: ImageId) -> Result<&CpuImage, BackendError> {
        self.images
            .get(image.0 as usize)
            .and_then(Option::as_ref)
            .ok_or(BackendError::UnknownImage(image))
    }

    fn image_mut(&mut self, image: ImageId) -> Result<&mut CpuImage, BackendError> {
        self.images
            .get_mut(image.0 as usize)
            .and_then(Option::as_mut)
            .ok_or(BackendError::UnknownImage(image))
    }

    fn record(&mut self, dispatch: Dispatch) {
        if self.recording {
            self.log.push(dispatch);
        }
    }

    fn allocate(&mut self, dims: Dims3) -> Result<ImageId, BackendError> {
        if dims.volume() == 0 {
            return Err(BackendError::EmptyImage(dims));
        }
        let image = Some(CpuImage::new(dims));
        if let Some(slot) = self.free.pop() {
            self.images[slot as usize] = image;
            return Ok(ImageId(slot));
        }
        let id = ImageId(self.images.len() as u32);
        self.images.push(image);
        Ok(id)
    }
}

impl ComputeBackend for CpuBackend {
    fn backend_name(&self) -> &str {
        "cpu"
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
        self.image_mut(image)?.data.fill(value);
        self.record(Dispatch::Fill { image, value });
        Ok(())
    }

    fn enqueue_copy_image(&mut self, src: ImageId, dst: ImageId) -> Result<(), BackendError> {
        let (src_dims, dst_dims) = (self.image(src)?.dims, self.image(dst)?.dims);
        if src_dims != dst_dims {
            return Err(BackendError::DimensionMismatch {
                image: dst,
                expected: src_dims,
                actual: dst_dims,
            });
        }
        if src != dst {
            let data = self.image(src)?.data.clone();
            self.image_mut(dst)?.data = data;
        }
        self.record(Dispatch::Copy { src, dst });
        Ok(())
    }

    fn kernel(&mut self, signature: &'static KernelSignature) -> Result<Kernel, BackendError> {
        let registered = self
            .registry
            .get(signature.name)
            .ok_or_else(|| BackendError::UnknownKernel(signature.name.to_string()))?;
        if registered.signature != signature {
            return Err(BackendError::SignatureMismatch {
                name: signature.name.to_string(),
            });
        }
        let slot = self.bound.len() as u32;
        self.bound.push(signature.name);
        Ok(Kernel::new(slot, signature))
    }

    fn enqueue_kernel(
        &mut self,
        kernel: &Kernel,
        args: &[KernelArg],
        global: [usize; 2],
    ) -> Result<(), BackendError> {
        kernel.signature().check(args)?;
        let name = self
            .bound
            .get(kernel.slot() as usize)
            .copied()
            .ok_or_else(|| BackendError::UnknownKernel(kernel.name().to_string()))?;
        let registered = self
            .registry
            .get(name)
            .cloned()
            .ok_or_else(|| BackendError::UnknownKernel(name.to_string()))?;

        let mut ctx = KernelContext {
            signature: registered.signature,
            images: &mut self.images,
            args,
            global,
        };
        (registered.run)(&mut ctx)?;

        self.record(Dispatch::Kernel {
            name: registered.signature.name,
            args: args.to_vec(),
            global,
        });
        Ok(())
    }

    fn write_image(&mut self, image: ImageId, data: &[f32]) -> Result<(), BackendError> {
        let target = self.image_mut(image)?;
        if target.data.len() != data.len() {
            return Err(BackendError::DataLength {
                image,
                expected: target.data.len(),
                found: data.len(),
            });
        }
        target.data.copy_from_slice(data);
        self.record(Dispatch::Write { image });
        Ok(())
    }

    fn read_image(&mut self, image: ImageId) -> Result<Vec<f32>, BackendError> {
        Ok(self.image(image)?.data.clone())
    }

    fn finish(&mut self) -> Result<(), BackendError> {
        Ok(())
    }

    fn release_image(&mut self, image: ImageId) -> Result<(), BackendError> {
        let slot = self
            .images
            .get_mut(image.0 as usize)
            .filter(|slot| slot.is_some())
            .ok_or(BackendError::UnknownImage(image))?;
        *slot = None;
        self.free.push(image.0);
        self.record(Dispatch::Release { image });
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Reference kernels
// ---------------------------------------------------------------------------

/// Evaluate `f` for every pixel of a `width x height` grid, row-major.
fn map_pixels<T, F>(width: usize, height: usize, f: F) -> Vec<T>
where
    T: Send,
    F: Fn(usize, usize) -> T + Sync + Send,
{
    #[cfg(feature = "parallel")]
    {
        (0..width * height)
            .into_par_iter()
            .map(|i| f(i % width, i / width))
            .collect()
    }
    #[cfg(not(feature = "parallel"))]
    {
        (0..width * height).map(|i| f(i % width, i / width)).collect()
    }
}

/// Weighted sum over one receptive field.
fn gather(
    source: &CpuImage,
    weights: &CpuImage,
    x: usize,
    y: usize,
    center: [i32; 2],
    dims: [i32; 2],
    radius: i32,
) -> f32 {
    let mut sum = 0.0;
    for dx in -radius..=radius {
        for dy in -radius..=radius {
            let (sx, sy) = (center[0] + dx, center[1] + dy);
            if sx < 0 || sy < 0 || sx >= dims[0] || sy >= dims[1] {
                continue;
            }
            let w = weights.at(x as i32, y as i32, tap_index(dx, dy, radius));
            sum += w * source.at(sx, sy, 0);
        }
    }
    sum
}

/// Delta-rule update of one receptive field's taps.
#[allow(clippy::too_many_arguments)]
fn nudge(
    source: &CpuImage,
    weights_prev: &CpuImage,
    x: usize,
    y: usize,
    center: [i32; 2],
    dims: [i32; 2],
    radius: i32,
    step: f32,
) -> Vec<f32> {
    let mut taps = vec![0.0; kernels::footprint(radius)];
    for dx in -radius..=radius {
        for dy in -radius..=radius {
            let t = tap_index(dx, dy, radius);
            let (sx, sy) = (center[0] + dx, center[1] + dy);
            let activity = if sx < 0 || sy < 0 || sx >= dims[0] || sy >= dims[1] {
                0.0
            } else {
                source.at(sx, sy, 0)
            };
            taps[t] = weights_prev.at(x as i32, y as i32, t) + step * activity;
        }
    }
    taps
}

/// Scatter per-pixel tap vectors into a `(w, h, taps)` tensor.
fn scatter_taps(dims: Dims3, per_pixel: &[Vec<f32>], global: [usize; 2], base: &[f32]) -> Vec<f32> {
    let mut out = base.to_vec();
    for (i, taps) in per_pixel.iter().enumerate() {
        let (x, y) = (i % global[0], i / global[0]);
        if x >= dims.width || y >= dims.height {
            continue;
        }
        for (t, v) in taps.iter().enumerate().take(dims.depth) {
            out[dims.index(x, y, t)] = *v;
        }
    }
    out
}

fn prediction_initialize(ctx: &mut KernelContext<'_>) -> Result<(), BackendError> {
    let [gw, gh] = ctx.global();
    let size_e = ctx.int(2)?.max(0) as usize;
    let size_i = ctx.int(3)?.max(0) as usize;
    let (lo, hi) = (ctx.float(4)?, ctx.float(5)?);
    let seed = ctx.uint2(6)?;

    for (index, size, salt) in [(0usize, size_e, 0u32), (1usize, size_i, 0x9E37_79B9u32)] {
        let image = ctx.image_mut(index)?;
        let dims = image.dims();
        let seed = [seed[0], seed[1] ^ salt];
        for y in 0..gh.min(dims.height) {
            for x in 0..gw.min(dims.width) {
                for t in 0..size.min(dims.depth) {
                    let u = tap_uniform(seed, x as u32, y as u32, t as u32);
                    image.data[dims.index(x, y, t)] = lo + (hi - lo) * u;
                }
            }
        }
    }
    Ok(())
}

fn predict(ctx: &mut KernelContext<'_>) -> Result<(), BackendError> {
    let [gw, gh] = ctx.global();
    let (scale_e, scale_i) = (ctx.float2(5)?, ctx.float2(6)?);
    let (e_dims, i_dims) = (ctx.int2(7)?, ctx.int2(8)?);
    let (radius_e, radius_i) = (ctx.int(9)?, ctx.int(10)?);

    let out_dims = ctx.image(4)?.dims();
    let values = {
        let (e_src, i_src) = (ctx.image(0)?, ctx.image(1)?);
        let (w_e, w_i) = (ctx.image(2)?, ctx.image(3)?);
        map_pixels(gw, gh, |x, y| {
            let ce = [project(x, scale_e[0]), project(y, scale_e[1])];
            let ci = [project(x, scale_i[0]), project(y, scale_i[1])];
            gather(e_src, w_e, x, y, ce, e_dims, radius_e)
                + gather(i_src, w_i, x, y, ci, i_dims, radius_i)
        })
    };

    let mut out = ctx.image(4)?.data().to_vec();
    for (i, v) in values.into_iter().enumerate() {
        let (x, y) = (i % gw, i / gw);
        if x < out_dims.width && y < out_dims.height {
            out[out_dims.index(x, y, 0)] = v;
        }
    }
    ctx.store(4, out)
}

fn prediction_learn(ctx: &mut KernelContext<'_>) -> Result<(), BackendError> {
    let global = ctx.global();
    let (scale_e, scale_i) = (ctx.float2(8)?, ctx.float2(9)?);
    let (e_dims, i_dims) = (ctx.int2(10)?, ctx.int2(11)?);
    let (radius_e, radius_i) = (ctx.int(12)?, ctx.int(13)?);
    let alpha = ctx.float(14)?;

    let (taps_e, taps_i) = {
        let (e_src, i_src) = (ctx.image(0)?, ctx.image(1)?);
        let (target, predicted) = (ctx.image(2)?, ctx.image(3)?);
        let (w_e_prev, w_i_prev) = (ctx.image(4)?, ctx.image(5)?);
        let per_pixel = map_pixels(global[0], global[1], |x, y| {
            let error = target.at(x as i32, y as i32, 0) - predicted.at(x as i32, y as i32, 0);
            let step = alpha * error;
            let ce = [project(x, scale_e[0]), project(y, scale_e[1])];
            let ci = [project(x, scale_i[0]), project(y, scale_i[1])];
            (
                nudge(e_src, w_e_prev, x, y, ce, e_dims, radius_e, step),
                nudge(i_src, w_i_prev, x, y, ci, i_dims, radius_i, step),
            )
        });
        per_pixel.into_iter().unzip::<_, _, Vec<_>, Vec<_>>()
    };

    let out_e = {
        let w_e = ctx.image(6)?;
        scatter_taps(w_e.dims(), &taps_e, global, w_e.data())
    };
    let out_i = {
        let w_i = ctx.image(7)?;
        scatter_taps(w_i.dims(), &taps_i, global, w_i.data())
    };
    ctx.store(6, out_e)?;
    ctx.store(7, out_i)
}

fn sum_spikes(ctx: &mut KernelContext<'_>) -> Result<(), BackendError> {
    let [gw, gh] = ctx.global();
    let scalar = ctx.float(3)?;
    let out = {
        let (states, prev, sums) = (ctx.image(0)?, ctx.image(1)?, ctx.image(2)?);
        let dims = sums.dims();
        let mut out = sums.data().to_vec();
        for y in 0..gh.min(dims.height) {
            for x in 0..gw.min(dims.width) {
                let (xi, yi) = (x as i32, y as i32);
                out[dims.index(x, y, 0)] =
                    prev.at(xi, yi, 0) * (1.0 - scalar) + scalar * states.at(xi, yi, 0);
            }
        }
        out
    };
    ctx.store(2, out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image(backend: &mut CpuBackend, w: usize, h: usize) -> ImageId {
        backend
            .create_image_2d(ImageFormat::R32Float, Dims2::new(w, h))
            .unwrap()
    }

    #[test]
    fn fill_copy_and_readback() {
        let mut backend = CpuBackend::new();
        let a = image(&mut backend, 2, 2);
        let b = image(&mut backend, 2, 2);
        backend.enqueue_fill_image(a, 3.0).unwrap();
        backend.enqueue_copy_image(a, b).unwrap();
        assert_eq!(backend.read_image(b).unwrap(), vec![3.0; 4]);
    }

    #[test]
    fn released_slots_are_reused() {
        let mut backend = CpuBackend::new();
        let a = image(&mut backend, 2, 2);
        let b = image(&mut backend, 2, 2);
        backend.release_image(a).unwrap();
        assert_eq!(backend.image_count(), 1);
        assert!(matches!(
            backend.read_image(a),
            Err(BackendError::UnknownImage(_))
        ));
        assert!(matches!(
            backend.release_image(a),
            Err(BackendError::UnknownImage(_))
        ));

        let c = image(&mut backend, 3, 1);
        assert_eq!(c, a);
        assert_eq!(backend.read_image(c).unwrap(), vec![0.0; 3]);
        assert_eq!(backend.image_count(), 2);
        assert_ne!(b, c);
    }

    #[test]
    fn copy_rejects_mismatched_dims() {
        let mut backend = CpuBackend::new();
        let a = image(&mut backend, 2, 2);
        let b = image(&mut backend, 3, 2);
        assert!(matches!(
            backend.enqueue_copy_image(a, b),
            Err(BackendError::DimensionMismatch { .. })
        ));
    }

    #[test]
    fn empty_images_are_rejected() {
        let mut backend = CpuBackend::new();
        assert!(backend
            .create_image_2d(ImageFormat::R32Float, Dims2::new(0, 4))
            .is_err());
    }

    #[test]
    fn unknown_kernel_is_reported() {
        let mut backend = CpuBackend::new();
        assert!(matches!(
            backend.kernel(&PREDICT),
            Err(BackendError::UnknownKernel(_))
        ));
    }

    #[test]
    fn recording_captures_issue_order() {
        let mut backend = CpuBackend::new();
        let a = image(&mut backend, 1, 1);
        let b = image(&mut backend, 1, 1);
        backend.set_recording(true);
        backend.enqueue_fill_image(a, 1.0).unwrap();
        backend.enqueue_copy_image(a, b).unwrap();
        assert_eq!(
            backend.take_dispatches(),
            vec![
                Dispatch::Fill {
                    image: a,
                    value: 1.0
                },
                Dispatch::Copy { src: a, dst: b },
            ]
        );
        assert!(backend.dispatches().is_empty());
    }

    #[test]
    fn sum_spikes_blends_previous_and_states() {
        let mut backend = CpuBackend::with_reference_kernels();
        let states = image(&mut backend, 2, 1);
        let prev = image(&mut backend, 2, 1);
        let sums = image(&mut backend, 2, 1);
        backend.write_image(states, &[1.0, 0.0]).unwrap();
        backend.write_image(prev, &[0.5, 0.5]).unwrap();

        let kernel = backend.kernel(&SUM_SPIKES_E).unwrap();
        backend
            .enqueue_kernel(
                &kernel,
                &[
                    KernelArg::Image(states),
                    KernelArg::Image(prev),
                    KernelArg::Image(sums),
                    KernelArg::Float(0.25),
                ],
                [2, 1],
            )
            .unwrap();

        let out = backend.read_image(sums).unwrap();
        assert!((out[0] - (0.5 * 0.75 + 0.25)).abs() < 1e-6);
        assert!((out[1] - 0.5 * 0.75).abs() < 1e-6);
    }

    #[test]
    fn replaced_kernel_applies_to_bound_handle() {
        let mut backend = CpuBackend::with_reference_kernels();
        let states = image(&mut backend, 1, 1);
        let prev = image(&mut backend, 1, 1);
        let sums = image(&mut backend, 1, 1);
        let kernel = backend.kernel(&SUM_SPIKES_E).unwrap();

        backend.register_kernel(&SUM_SPIKES_E, |ctx| ctx.store(2, vec![42.0]));
        backend
            .enqueue_kernel(
                &kernel,
                &[
                    KernelArg::Image(states),
                    KernelArg::Image(prev),
                    KernelArg::Image(sums),
                    KernelArg::Float(0.0),
                ],
                [1, 1],
            )
            .unwrap();
        assert_eq!(backend.read_image(sums).unwrap(), vec![42.0]);
    }

    #[test]
    fn predict_with_unit_center_tap_copies_source() {
        let mut backend = CpuBackend::with_reference_kernels();
        let dims = Dims2::new(3, 2);
        let e = image(&mut backend, 3, 2);
        let i = image(&mut backend, 3, 2);
        let out = image(&mut backend, 3, 2);
        let w_e = backend
            .create_image_3d(ImageFormat::R32Float, dims.with_depth(1))
            .unwrap();
        let w_i = backend
            .create_image_3d(ImageFormat::R32Float, dims.with_depth(1))
            .unwrap();
        backend
            .write_image(e, &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0])
            .unwrap();
        backend.enqueue_fill_image(w_e, 1.0).unwrap();

        let kernel = backend.kernel(&PREDICT).unwrap();
        let scale = kernels::dims_scale(dims.as_i32(), dims.as_i32());
        backend
            .enqueue_kernel(
                &kernel,
                &[
                    KernelArg::Image(e),
                    KernelArg::Image(i),
                    KernelArg::Image(w_e),
                    KernelArg::Image(w_i),
                    KernelArg::Image(out),
                    KernelArg::Float2(scale),
                    KernelArg::Float2(scale),
                    KernelArg::Int2(dims.as_i32()),
                    KernelArg::Int2(dims.as_i32()),
                    KernelArg::Int(0),
                    KernelArg::Int(0),
                ],
                dims.global(),
            )
            .unwrap();
        assert_eq!(
            backend.read_image(out).unwrap(),
            vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]
        );
    }
}
