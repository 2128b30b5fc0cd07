use crate::config::EngineConfig;
use crate::session;
use eyre::{Context, ContextCompat, Result};
use ndarray::{Array1, ArrayView2, Axis};
use ort::Session;
use std::path::Path;

/// Inference backend that maps one feature chunk to a raw embedding.
///
/// Implementations are picked when the verifier is built, so tests and
/// other runtimes can stand in for the ONNX engine.
pub trait EmbeddingEngine {
    fn load(model_path: &Path, config: &EngineConfig) -> Result<Self>
    where
        Self: Sized;

    /// Runs the network on a `frames × feature_dim` chunk.
    fn feed_forward(&mut self, chunk: ArrayView2<f32>) -> Result<Array1<f32>>;
}

/// x-vector network exported to ONNX.
#[derive(Debug)]
pub struct OnnxEngine {
    session: Session,
    input_name: String,
    output_name: String,
}

impl EmbeddingEngine for OnnxEngine {
    fn load(model_path: &Path, config: &EngineConfig) -> Result<Self> {
        let session = session::create_session(model_path, config)?;
        tracing::info!("Loaded embedding model from {}", model_path.display());
        Ok(Self {
            session,
            input_name: config.input_name.clone(),
            output_name: config.output_name.clone(),
        })
    }

    fn feed_forward(&mut self, chunk: ArrayView2<f32>) -> Result<Array1<f32>> {
        let features = chunk.insert_axis(Axis(0)); // Add batch dimension
        let inputs = ort::inputs![self.input_name.as_str() => features]?;

        let ort_outs = self.session.run(inputs)?;
        let ort_out = ort_outs
            .get(self.output_name.as_str())
            .with_context(|| format!("Output tensor {} not found", self.output_name))?
            .try_extract_tensor::<f32>()
            .context("Failed to extract tensor")?;

        Ok(ort_out.iter().copied().collect())
    }
}
