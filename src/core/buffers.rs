//! Role-flag buffers.
//!
//! A pair of device images where one holds last tick's value and the other is
//! being written this tick. Rotation exchanges the handles; no texel moves.

use crate::backend::{BackendError, ComputeBackend, Dims2, Dims3, ImageFormat, ImageId};
use crate::kernels::footprint;

/// Allocate one image per entry of `dims`. On failure the images allocated
/// so far are released before the error is returned.
pub fn allocate_images<B: ComputeBackend + ?Sized, const N: usize>(
    backend: &mut B,
    dims: [Dims3; N],
) -> Result<[ImageId; N], BackendError> {
    let mut images = [ImageId(0); N];
    for (k, dims) in dims.into_iter().enumerate() {
        match backend.create_image_3d(ImageFormat::R32Float, dims) {
            Ok(image) => images[k] = image,
            Err(err) => {
                // The allocation error is the one worth reporting.
                let _ = release_images(backend, images[..k].iter().copied());
                return Err(err);
            }
        }
    }
    Ok(images)
}

/// Release every image, continuing past failures. Returns the first error.
pub fn release_images<B, I>(backend: &mut B, images: I) -> Result<(), BackendError>
where
    B: ComputeBackend + ?Sized,
    I: IntoIterator<Item = ImageId>,
{
    let mut first = Ok(());
    for image in images {
        if let Err(err) = backend.release_image(image) {
            if first.is_ok() {
                first = Err(err);
            }
        }
    }
    first
}

/// Two values in `current` / `previous` roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DoubleBuffer<T> {
    current: T,
    previous: T,
}

impl<T> DoubleBuffer<T> {
    pub fn new(current: T, previous: T) -> Self {
        Self { current, previous }
    }

    #[inline]
    pub fn current(&self) -> &T {
        &self.current
    }

    #[inline]
    pub fn previous(&self) -> &T {
        &self.previous
    }

    /// Exchange roles.
    #[inline]
    pub fn swap(&mut self) {
        std::mem::swap(&mut self.current, &mut self.previous);
    }
}

/// Double-buffered prediction weights for one pathway.
///
/// Shape is `feedforward width x feedforward height x (2r + 1)^2`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WeightPair {
    images: DoubleBuffer<ImageId>,
    dims: Dims3,
    radius: i32,
}

impl WeightPair {
    /// Allocate both halves. Contents are unspecified until initialized.
    pub fn allocate<B: ComputeBackend + ?Sized>(
        backend: &mut B,
        feed_forward: Dims2,
        radius: i32,
    ) -> Result<Self, BackendError> {
        let dims = feed_forward.with_depth(footprint(radius));
        let [current, previous] = allocate_images(backend, [dims; 2])?;
        Ok(Self {
            images: DoubleBuffer::new(current, previous),
            dims,
            radius,
        })
    }

    #[inline]
    pub fn current(&self) -> ImageId {
        *self.images.current()
    }

    #[inline]
    pub fn previous(&self) -> ImageId {
        *self.images.previous()
    }

    pub fn dims(&self) -> Dims3 {
        self.dims
    }

    pub fn radius(&self) -> i32 {
        self.radius
    }

    pub fn images(&self) -> [ImageId; 2] {
        [self.current(), self.previous()]
    }

    /// Make both halves hold the previous half's values.
    pub fn sync_current<B: ComputeBackend + ?Sized>(
        &self,
        backend: &mut B,
    ) -> Result<(), BackendError> {
        backend.enqueue_copy_image(self.previous(), self.current())
    }

    pub fn swap(&mut self) {
        self.images.swap();
    }
}

/// Triple-buffered decayed spike sums for one population.
///
/// `current` accumulates over `previous` each tick. At the end of a
/// prediction cycle `previous` is copied into `previous_iteration`, so the
/// latter lags by one prediction cycle rather than one tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpikeAccumulator {
    sums: DoubleBuffer<ImageId>,
    previous_iteration: ImageId,
    dims: Dims2,
}

impl SpikeAccumulator {
    /// Allocate and zero all three maps.
    pub fn allocate<B: ComputeBackend + ?Sized>(
        backend: &mut B,
        dims: Dims2,
    ) -> Result<Self, BackendError> {
        let images = allocate_images(backend, [dims.with_depth(1); 3])?;
        for image in images {
            if let Err(err) = backend.enqueue_fill_image(image, 0.0) {
                let _ = release_images(backend, images);
                return Err(err);
            }
        }
        let [current, previous, previous_iteration] = images;
        Ok(Self {
            sums: DoubleBuffer::new(current, previous),
            previous_iteration,
            dims,
        })
    }

    #[inline]
    pub fn current(&self) -> ImageId {
        *self.sums.current()
    }

    #[inline]
    pub fn previous(&self) -> ImageId {
        *self.sums.previous()
    }

    #[inline]
    pub fn previous_iteration(&self) -> ImageId {
        self.previous_iteration
    }

    pub fn dims(&self) -> Dims2 {
        self.dims
    }

    pub fn images(&self) -> [ImageId; 3] {
        [self.current(), self.previous(), self.previous_iteration]
    }

    /// Tick boundary: swap current and previous.
    pub fn rotate(&mut self) {
        self.sums.swap();
    }

    /// Prediction-cycle boundary: copy previous into previous-iteration,
    /// then zero current and previous.
    pub fn end_prediction<B: ComputeBackend + ?Sized>(
        &self,
        backend: &mut B,
    ) -> Result<(), BackendError> {
        backend.enqueue_copy_image(self.previous(), self.previous_iteration)?;
        backend.enqueue_fill_image(self.current(), 0.0)?;
        backend.enqueue_fill_image(self.previous(), 0.0)
    }
}
