use crate::config::ExtractorConfig;
use crate::embedding::EmbeddingEngine;
use crate::error::{Error, Result};
use ndarray::{s, Array1, Array2, ArrayView2};
use std::time::Instant;

/// Result of running the engine over every chunk of one utterance.
#[derive(Debug, Clone)]
pub struct Extraction {
    /// Frame-weighted average of the chunk embeddings
    pub embedding: Array1<f32>,
    /// Chunks the engine was run on
    pub num_chunks: usize,
    /// Of those, how many were padded up to `min_chunk_size`
    pub num_padded: usize,
    /// Sum of the unpadded frame counts
    pub total_weight: f32,
}

/// Splits features into fixed-size chunks and averages the per-chunk
/// embeddings, weighting each by the number of real frames it covered.
pub struct ChunkedExtractor<E> {
    engine: E,
    config: ExtractorConfig,
}

impl<E: EmbeddingEngine> ChunkedExtractor<E> {
    pub fn new(engine: E, config: ExtractorConfig) -> Result<Self> {
        if config.chunk_size == 0 || config.min_chunk_size == 0 {
            return Err(Error::Config(
                "chunk_size and min_chunk_size must be positive".into(),
            ));
        }
        Ok(Self { engine, config })
    }

    pub fn config(&self) -> &ExtractorConfig {
        &self.config
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    pub fn extract(&mut self, features: ArrayView2<f32>) -> Result<Array1<f32>> {
        Ok(self.extract_chunks(features)?.embedding)
    }

    pub fn extract_chunks(&mut self, features: ArrayView2<f32>) -> Result<Extraction> {
        let num_rows = features.nrows();
        let chunk_size = self.config.chunk_size;
        let min_chunk_size = self.config.min_chunk_size;

        let num_chunks = if self.config.keep_partial_chunk {
            num_rows.div_ceil(chunk_size)
        } else {
            num_rows / chunk_size
        };
        if num_chunks == 0 {
            return Err(Error::InsufficientFrames {
                frames: num_rows,
                required: if self.config.keep_partial_chunk { 1 } else { chunk_size },
            });
        }

        let mut xvector_avg: Option<Array1<f32>> = None;
        let mut tot_weight = 0.0f32;
        let mut processed = 0;
        let mut padded = 0;

        for chunk_indx in 0..num_chunks {
            let start = chunk_indx * chunk_size;
            let offset = chunk_size.min(num_rows - start);
            if !self.config.pad_input && offset < min_chunk_size {
                continue;
            }
            let sub_features = features.slice(s![start..start + offset, ..]);

            let xvector = if self.config.pad_input && offset < min_chunk_size {
                padded += 1;
                let padded_features = pad_chunk(sub_features, min_chunk_size);
                self.run_engine(padded_features.view())?
            } else {
                self.run_engine(sub_features)?
            };
            processed += 1;

            let weight = offset as f32;
            tot_weight += weight;
            match xvector_avg.as_mut() {
                Some(avg) => {
                    if avg.len() != xvector.len() {
                        return Err(Error::DimensionMismatch(format!(
                            "engine returned embeddings of dimension {} and {}",
                            avg.len(),
                            xvector.len()
                        )));
                    }
                    avg.scaled_add(weight, &xvector);
                }
                None => xvector_avg = Some(xvector * weight),
            }
        }

        let xvector_avg = match xvector_avg {
            Some(avg) if tot_weight > 0.0 => avg,
            _ => return Err(Error::ZeroWeight),
        };

        Ok(Extraction {
            embedding: xvector_avg / tot_weight,
            num_chunks: processed,
            num_padded: padded,
            total_weight: tot_weight,
        })
    }

    fn run_engine(&mut self, chunk: ArrayView2<f32>) -> Result<Array1<f32>> {
        let start = Instant::now();
        let xvector = self.engine.feed_forward(chunk).map_err(Error::Engine)?;
        tracing::debug!(
            frames = chunk.nrows(),
            "nnet compute time: {:.3}s",
            start.elapsed().as_secs_f32()
        );
        Ok(xvector)
    }
}

/// Centers `chunk` in a window of `target` rows, repeating the first row on
/// the left and the last row on the right.
fn pad_chunk(chunk: ArrayView2<f32>, target: usize) -> Array2<f32> {
    let offset = chunk.nrows();
    let left_context = (target - offset) / 2;
    let right_context = target - offset - left_context;

    let mut padded = Array2::<f32>::zeros((target, chunk.ncols()));
    for i in 0..left_context {
        padded.row_mut(i).assign(&chunk.row(0));
    }
    for i in 0..right_context {
        padded.row_mut(target - i - 1).assign(&chunk.row(offset - 1));
    }
    padded
        .slice_mut(s![left_context..left_context + offset, ..])
        .assign(&chunk);
    padded
}
