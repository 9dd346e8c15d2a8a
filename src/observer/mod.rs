use crate::backend::{BackendError, ComputeBackend, Dims2, ImageId};
use crate::layer::ProcessingLayer;
use crate::network::{Network, NetworkDiagnostics};

/// A read-only snapshot of what the prediction head currently says.
///
/// Design intent:
/// - Observers cannot mutate or steer the network.
/// - Snapshotting blocks on a device readback; keep it out of the tick loop.
#[derive(Debug, Clone, PartialEq)]
pub struct PredictionSnapshot {
    pub dims: Dims2,
    /// Prediction map, x fastest.
    pub values: Vec<f32>,
    /// Error against the compared input, if one was given.
    pub mean_abs_error: Option<f32>,
    pub max_abs_error: Option<f32>,
    pub diagnostics: NetworkDiagnostics,
}

pub struct PredictionObserver<'a, B, L>
where
    B: ComputeBackend + ?Sized,
    L: ProcessingLayer<B>,
{
    network: &'a Network<B, L>,
}

impl<'a, B, L> PredictionObserver<'a, B, L>
where
    B: ComputeBackend + ?Sized,
    L: ProcessingLayer<B>,
{
    pub fn new(network: &'a Network<B, L>) -> Self {
        Self { network }
    }

    pub fn snapshot(&self, backend: &mut B) -> Result<PredictionSnapshot, BackendError> {
        Ok(PredictionSnapshot {
            dims: self.network.input_dims(),
            values: backend.read_image(self.network.prediction())?,
            mean_abs_error: None,
            max_abs_error: None,
            diagnostics: self.network.diagnostics(),
        })
    }

    /// Snapshot plus absolute error against `input`.
    pub fn compare(
        &self,
        backend: &mut B,
        input: ImageId,
    ) -> Result<PredictionSnapshot, BackendError> {
        let mut snapshot = self.snapshot(backend)?;
        let target = backend.read_image(input)?;
        if target.len() != snapshot.values.len() {
            return Err(BackendError::DataLength {
                image: input,
                expected: snapshot.values.len(),
                found: target.len(),
            });
        }

        let (sum, max) = snapshot
            .values
            .iter()
            .zip(target.iter())
            .map(|(p, t)| (p - t).abs())
            .fold((0.0f32, 0.0f32), |(sum, max), e| (sum + e, max.max(e)));
        snapshot.mean_abs_error = Some(sum / target.len().max(1) as f32);
        snapshot.max_abs_error = Some(max);
        Ok(snapshot)
    }
}
