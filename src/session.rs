use crate::config::EngineConfig;
use eyre::{Context, Result};
use ort::{GraphOptimizationLevel, Session};
use std::path::Path;

pub fn create_session(model_path: &Path, config: &EngineConfig) -> Result<Session> {
    let session = Session::builder()?
        .with_optimization_level(GraphOptimizationLevel::Level3)?
        .with_intra_threads(config.intra_threads)?
        .with_inter_threads(config.inter_threads)?
        .commit_from_file(model_path)
        .with_context(|| format!("Failed to load model {}", model_path.display()))?;
    Ok(session)
}
