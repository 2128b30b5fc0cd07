use eyre::{ensure, Result};
use ndarray::Array2;

/// Acoustic feature extraction from 16-bit mono samples.
pub trait FeatureFrontend {
    /// Returns a `frames × feature_dim` matrix.
    fn compute_features(&self, samples: &[i16]) -> Result<Array2<f32>>;
}

/// Kaldi-compatible fbank features with per-utterance mean removal.
#[derive(Debug, Default, Clone, Copy)]
pub struct FbankFrontend;

impl FeatureFrontend for FbankFrontend {
    fn compute_features(&self, samples: &[i16]) -> Result<Array2<f32>> {
        ensure!(!samples.is_empty(), "No samples to compute features from");

        // Convert to f32 precisely
        let mut samples_f32 = vec![0.0; samples.len()];
        knf_rs::convert_integer_to_float_audio(samples, &mut samples_f32);

        let features = knf_rs::compute_fbank(&samples_f32)?;
        Ok(features)
    }
}
