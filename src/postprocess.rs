use crate::error::{Error, Result};
use crate::tagged;
use ndarray::{s, Array1, Array2, ArrayView1};
use std::path::Path;

/// Mean removal, LDA projection and length normalization applied to raw
/// x-vectors before they reach PLDA.
#[derive(Debug, Clone)]
pub struct PostProcessor {
    /// Global x-vector mean
    mean: Array1<f32>,
    /// Linear (`out × dim`) or affine (`out × (dim + 1)`) projection
    transform: Array2<f32>,
}

impl PostProcessor {
    pub fn new(mean: Array1<f32>, transform: Array2<f32>) -> Result<Self> {
        let dim = mean.len();
        let cols = transform.ncols();
        if cols != dim && cols != dim + 1 {
            return Err(Error::DimensionMismatch(format!(
                "mean has dimension {dim} and transform has {cols} columns"
            )));
        }
        if transform.nrows() == 0 {
            return Err(Error::DimensionMismatch("transform has no rows".into()));
        }
        Ok(Self { mean, transform })
    }

    pub fn load<P: AsRef<Path>>(mean_path: P, transform_path: P) -> Result<Self> {
        let mean = tagged::read_vector_file::<f32, _>(mean_path)?;
        let transform = tagged::read_matrix_file::<f32, _>(transform_path)?;
        Self::new(mean, transform)
    }

    pub fn input_dim(&self) -> usize {
        self.mean.len()
    }

    pub fn output_dim(&self) -> usize {
        self.transform.nrows()
    }

    pub fn apply(&self, xvector: ArrayView1<f32>) -> Result<Array1<f32>> {
        if xvector.len() != self.input_dim() {
            return Err(Error::DimensionMismatch(format!(
                "x-vector has dimension {}, mean has {}",
                xvector.len(),
                self.input_dim()
            )));
        }
        let centered = &xvector - &self.mean;
        let mut projected = self.project(&centered)?;
        normalize_length(&mut projected);
        Ok(projected)
    }

    fn project(&self, xvector: &Array1<f32>) -> Result<Array1<f32>> {
        let vec_dim = xvector.len();
        let transform_cols = self.transform.ncols();
        if transform_cols == vec_dim {
            Ok(self.transform.dot(xvector))
        } else if transform_cols == vec_dim + 1 {
            let linear = self.transform.slice(s![.., ..vec_dim]);
            let bias = self.transform.column(vec_dim);
            Ok(linear.dot(xvector) + bias)
        } else {
            Err(Error::DimensionMismatch(format!(
                "input vector has dimension {vec_dim} and transform has {transform_cols} columns"
            )))
        }
    }
}

/// Scales `vector` to length `sqrt(dim)`. A zero vector is left as is.
pub fn normalize_length(vector: &mut Array1<f32>) {
    let norm = vector.dot(vector).sqrt();
    let ratio = norm / (vector.len() as f32).sqrt();
    if ratio == 0.0 {
        tracing::warn!("DegenerateVector: cannot length-normalize a zero vector");
    } else {
        *vector /= ratio;
    }
}
