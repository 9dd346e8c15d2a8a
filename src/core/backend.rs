//! Compute backend abstraction.
//!
//! The orchestrator never touches device memory directly. It allocates
//! images, fills and copies them, and dispatches named kernels through this
//! trait. Every call is enqueued on a single in-order queue: a later
//! enqueue observes the completed effect of every earlier one without an
//! explicit wait.

use std::fmt;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use thiserror::Error;

/// Handle to a device-resident image owned by a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ImageId(pub u32);

impl fmt::Display for ImageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "image#{}", self.0)
    }
}

/// Texel format of a device image.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ImageFormat {
    /// Single 32-bit float channel.
    #[default]
    R32Float,
}

impl ImageFormat {
    pub fn channels(self) -> usize {
        match self {
            ImageFormat::R32Float => 1,
        }
    }
}

/// Width and height of a 2D map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Dims2 {
    pub width: usize,
    pub height: usize,
}

impl Dims2 {
    pub const fn new(width: usize, height: usize) -> Self {
        Self { width, height }
    }

    pub fn area(&self) -> usize {
        self.width * self.height
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    pub fn as_i32(&self) -> [i32; 2] {
        [self.width as i32, self.height as i32]
    }

    pub fn global(&self) -> [usize; 2] {
        [self.width, self.height]
    }

    pub fn with_depth(&self, depth: usize) -> Dims3 {
        Dims3::new(self.width, self.height, depth)
    }
}

impl fmt::Display for Dims2 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Width, height and depth of a 3D tensor. 2D images have depth 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Dims3 {
    pub width: usize,
    pub height: usize,
    pub depth: usize,
}

impl Dims3 {
    pub const fn new(width: usize, height: usize, depth: usize) -> Self {
        Self {
            width,
            height,
            depth,
        }
    }

    pub fn volume(&self) -> usize {
        self.width * self.height * self.depth
    }

    pub fn plane(&self) -> Dims2 {
        Dims2::new(self.width, self.height)
    }

    /// Linear index with x fastest, then y, then z.
    #[inline]
    pub fn index(&self, x: usize, y: usize, z: usize) -> usize {
        (z * self.height + y) * self.width + x
    }
}

impl fmt::Display for Dims3 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}x{}", self.width, self.height, self.depth)
    }
}

/// Declared type of one positional kernel parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    Image2d,
    Image3d,
    Int,
    Float,
    Int2,
    Float2,
    Uint2,
}

impl ParamKind {
    pub fn is_image(self) -> bool {
        matches!(self, ParamKind::Image2d | ParamKind::Image3d)
    }

    /// Number of 32-bit words a scalar parameter occupies when packed.
    pub fn words(self) -> usize {
        match self {
            ParamKind::Image2d | ParamKind::Image3d => 0,
            ParamKind::Int | ParamKind::Float => 1,
            ParamKind::Int2 | ParamKind::Float2 | ParamKind::Uint2 => 2,
        }
    }
}

/// One positional argument passed to a kernel dispatch.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum KernelArg {
    Image(ImageId),
    Int(i32),
    Float(f32),
    Int2([i32; 2]),
    Float2([f32; 2]),
    Uint2([u32; 2]),
}

impl KernelArg {
    pub fn as_image(&self) -> Option<ImageId> {
        match self {
            KernelArg::Image(id) => Some(*id),
            _ => None,
        }
    }

    fn matches(&self, kind: ParamKind) -> bool {
        matches!(
            (self, kind),
            (KernelArg::Image(_), ParamKind::Image2d)
                | (KernelArg::Image(_), ParamKind::Image3d)
                | (KernelArg::Int(_), ParamKind::Int)
                | (KernelArg::Float(_), ParamKind::Float)
                | (KernelArg::Int2(_), ParamKind::Int2)
                | (KernelArg::Float2(_), ParamKind::Float2)
                | (KernelArg::Uint2(_), ParamKind::Uint2)
        )
    }

    /// Append the scalar payload as raw 32-bit words.
    pub fn pack_words(&self, out: &mut Vec<u32>) {
        match *self {
            KernelArg::Image(_) => {}
            KernelArg::Int(v) => out.push(v as u32),
            KernelArg::Float(v) => out.push(v.to_bits()),
            KernelArg::Int2([a, b]) => out.extend([a as u32, b as u32]),
            KernelArg::Float2([a, b]) => out.extend([a.to_bits(), b.to_bits()]),
            KernelArg::Uint2([a, b]) => out.extend([a, b]),
        }
    }
}

/// Name and ordered, typed parameter list of a device kernel.
#[derive(Debug, PartialEq, Eq)]
pub struct KernelSignature {
    pub name: &'static str,
    pub params: &'static [ParamKind],
}

impl KernelSignature {
    /// Reject argument lists whose arity or types disagree with the signature.
    pub fn check(&self, args: &[KernelArg]) -> Result<(), BackendError> {
        if args.len() != self.params.len() {
            return Err(BackendError::ArgumentCount {
                kernel: self.name,
                expected: self.params.len(),
                found: args.len(),
            });
        }
        for (index, (arg, kind)) in args.iter().zip(self.params.iter()).enumerate() {
            if !arg.matches(*kind) {
                return Err(BackendError::ArgumentType {
                    kernel: self.name,
                    index,
                    expected: *kind,
                    found: *arg,
                });
            }
        }
        Ok(())
    }

    pub fn image_params(&self) -> usize {
        self.params.iter().filter(|k| k.is_image()).count()
    }

    pub fn scalar_words(&self) -> usize {
        self.params.iter().map(|k| k.words()).sum()
    }
}

/// A kernel entry point bound on a specific backend.
#[derive(Debug, Clone, Copy)]
pub struct Kernel {
    pub(crate) slot: u32,
    signature: &'static KernelSignature,
}

impl Kernel {
    pub fn new(slot: u32, signature: &'static KernelSignature) -> Self {
        Self { slot, signature }
    }

    pub fn name(&self) -> &'static str {
        self.signature.name
    }

    pub fn slot(&self) -> u32 {
        self.slot
    }

    pub fn signature(&self) -> &'static KernelSignature {
        self.signature
    }
}

/// Errors raised by a compute backend.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("kernel `{0}` is not provided by this backend")]
    UnknownKernel(String),

    #[error("kernel `{name}` is registered with a different parameter list")]
    SignatureMismatch { name: String },

    #[error("{0} does not exist on this backend")]
    UnknownImage(ImageId),

    #[error("kernel `{kernel}` expects {expected} arguments, got {found}")]
    ArgumentCount {
        kernel: &'static str,
        expected: usize,
        found: usize,
    },

    #[error("kernel `{kernel}` argument {index}: expected {expected:?}, got {found:?}")]
    ArgumentType {
        kernel: &'static str,
        index: usize,
        expected: ParamKind,
        found: KernelArg,
    },

    #[error("{image} has dims {actual}, expected {expected}")]
    DimensionMismatch {
        image: ImageId,
        expected: Dims3,
        actual: Dims3,
    },

    #[error("{image} holds {expected} texels, got {found}")]
    DataLength {
        image: ImageId,
        expected: usize,
        found: usize,
    },

    #[error("cannot allocate an empty image ({0})")]
    EmptyImage(Dims3),

    #[error("device failure: {0}")]
    Device(String),

    #[error("readback failed: {0}")]
    Readback(String),
}

/// Device context plus in-order execution queue.
pub trait ComputeBackend {
    /// Backend name for logging.
    fn backend_name(&self) -> &str;

    fn create_image_2d(&mut self, format: ImageFormat, dims: Dims2)
        -> Result<ImageId, BackendError>;

    fn create_image_3d(&mut self, format: ImageFormat, dims: Dims3)
        -> Result<ImageId, BackendError>;

    fn image_dims(&self, image: ImageId) -> Result<Dims3, BackendError>;

    /// Set every texel of `image` to `value`.
    fn enqueue_fill_image(&mut self, image: ImageId, value: f32) -> Result<(), BackendError>;

    /// Copy the whole of `src` into `dst`. Dimensions must match.
    fn enqueue_copy_image(&mut self, src: ImageId, dst: ImageId) -> Result<(), BackendError>;

    /// Bind a named entry point so it can be dispatched.
    fn kernel(&mut self, signature: &'static KernelSignature) -> Result<Kernel, BackendError>;

    /// Dispatch `kernel` over a 2D global work size.
    fn enqueue_kernel(
        &mut self,
        kernel: &Kernel,
        args: &[KernelArg],
        global: [usize; 2],
    ) -> Result<(), BackendError>;

    /// Upload host data into an image (x fastest, then y, then z).
    fn write_image(&mut self, image: ImageId, data: &[f32]) -> Result<(), BackendError>;

    /// Block until all queued work is done and return the image contents.
    fn read_image(&mut self, image: ImageId) -> Result<Vec<f32>, BackendError>;

    /// Block until all queued work is done.
    fn finish(&mut self) -> Result<(), BackendError>;

    /// Free a device image once queued work using it has drained. The
    /// handle becomes invalid and may be handed out again by a later
    /// allocation.
    fn release_image(&mut self, image: ImageId) -> Result<(), BackendError>;
}
