//! Verifier settings. Everything has a default, so a model directory
//! without `config.toml` works out of the box.

use crate::error::{Error, Result};
use crate::plda::PldaConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const CONFIG_FILE: &str = "config.toml";

/// How features are cut into chunks for the embedding engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractorConfig {
    /// Frames per inference call.
    pub chunk_size: usize,
    /// Chunks shorter than this are padded (or skipped when `pad_input` is off).
    pub min_chunk_size: usize,
    pub pad_input: bool,
    /// Also process the trailing partial chunk instead of dropping it.
    pub keep_partial_chunk: bool,
}

impl Default for ExtractorConfig {
    fn default() -> Self {
        Self {
            chunk_size: 100,
            min_chunk_size: 20,
            pad_input: true,
            keep_partial_chunk: false,
        }
    }
}

/// ONNX runtime settings for the embedding network.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub input_name: String,
    pub output_name: String,
    pub intra_threads: usize,
    pub inter_threads: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            input_name: "feats".into(),
            output_name: "embs".into(),
            intra_threads: 1,
            inter_threads: 1,
        }
    }
}

/// File names inside the model directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelFiles {
    pub nnet: String,
    pub plda: String,
    pub transform: String,
    pub mean: String,
    /// Optional; created by [`crate::SpeakerVerifier::save_enrollment`].
    pub enrollment: String,
}

impl Default for ModelFiles {
    fn default() -> Self {
        Self {
            nnet: "final.onnx".into(),
            plda: "plda".into(),
            transform: "transform.mat".into(),
            mean: "mean.vec".into(),
            enrollment: "enroll.xvector".into(),
        }
    }
}

/// Resolved paths of the model files.
#[derive(Debug, Clone)]
pub struct ModelPaths {
    pub nnet: PathBuf,
    pub plda: PathBuf,
    pub transform: PathBuf,
    pub mean: PathBuf,
    pub enrollment: PathBuf,
}

impl ModelFiles {
    pub fn resolve(&self, model_dir: &Path) -> ModelPaths {
        ModelPaths {
            nnet: model_dir.join(&self.nnet),
            plda: model_dir.join(&self.plda),
            transform: model_dir.join(&self.transform),
            mean: model_dir.join(&self.mean),
            enrollment: model_dir.join(&self.enrollment),
        }
    }
}

impl ModelPaths {
    /// The four files every model directory must provide.
    pub fn required(&self) -> [(&'static str, &Path); 4] {
        [
            ("embedding network", self.nnet.as_path()),
            ("PLDA model", self.plda.as_path()),
            ("post-processing transform", self.transform.as_path()),
            ("post-processing mean", self.mean.as_path()),
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VerifierConfig {
    /// Accept when the PLDA log-likelihood ratio is at least this.
    pub threshold: f64,
    pub extractor: ExtractorConfig,
    pub plda: PldaConfig,
    pub engine: EngineConfig,
    pub files: ModelFiles,
}

impl Default for VerifierConfig {
    fn default() -> Self {
        Self {
            threshold: 0.0,
            extractor: ExtractorConfig::default(),
            plda: PldaConfig::default(),
            engine: EngineConfig::default(),
            files: ModelFiles::default(),
        }
    }
}

impl VerifierConfig {
    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| Error::Config(format!("invalid config: {e}")))
    }

    /// Reads `config.toml` from the model directory, or the defaults when
    /// there is none.
    pub fn from_model_dir<P: AsRef<Path>>(model_dir: P) -> Result<Self> {
        let path = model_dir.as_ref().join(CONFIG_FILE);
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(&path)
            .map_err(|e| Error::Config(format!("failed to read {}: {e}", path.display())))?;
        Self::from_toml(&text)
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("cannot serialize config: {e}")))
    }
}
