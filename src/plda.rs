use crate::error::{Error, Result};
use crate::linalg;
use crate::tagged::{TaggedReader, TaggedWriter};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;
use std::io::{BufRead, Write};
use std::path::Path;

const PLDA_OPEN: &str = "<Plda>";
const PLDA_CLOSE: &str = "</Plda>";

/// How embeddings are length-normalized when they enter PLDA space.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PldaConfig {
    /// Scale the transformed vector by the normalization factor.
    pub normalize_length: bool,
    /// Use `sqrt(dim) / ‖x‖` instead of the factor derived from the model's
    /// expected covariance `Ψ + I/n`.
    pub simple_length_norm: bool,
}

impl Default for PldaConfig {
    fn default() -> Self {
        Self {
            normalize_length: true,
            simple_length_norm: false,
        }
    }
}

/// PLDA model in a space where the within-class covariance is unit and the
/// between-class covariance is `diag(psi)`.
#[derive(Debug, Clone, PartialEq)]
pub struct Plda {
    /// Mean of the training embeddings in the original space
    mean: Array1<f64>,
    /// Whitens within-class and diagonalizes between-class covariance
    transform: Array2<f64>,
    /// Between-class covariance, non-negative, in decreasing order
    psi: Array1<f64>,
    /// Derived: `-transform · mean`
    offset: Array1<f64>,
}

impl Plda {
    pub fn new(mean: Array1<f64>, transform: Array2<f64>, psi: Array1<f64>) -> Result<Self> {
        let dim = mean.len();
        if dim == 0 {
            return Err(Error::DimensionMismatch("PLDA model is empty".into()));
        }
        if transform.dim() != (dim, dim) || psi.len() != dim {
            return Err(Error::DimensionMismatch(format!(
                "PLDA mean has dimension {dim}, transform is {:?}, psi has {}",
                transform.dim(),
                psi.len()
            )));
        }
        let offset = Self::compute_offset(&transform, &mean);
        Ok(Self {
            mean,
            transform,
            psi,
            offset,
        })
    }

    /// Load a model written by [`Plda::write`], binary or text.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut reader = crate::tagged::open(path)?;
        Self::read(&mut reader)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P, binary: bool) -> Result<()> {
        let mut writer = crate::tagged::create(path, binary)?;
        self.write(&mut writer)?;
        writer.flush()
    }

    pub fn read<R: BufRead>(reader: &mut TaggedReader<R>) -> Result<Self> {
        reader.expect_token(PLDA_OPEN)?;
        let mean = reader.read_vector::<f64>()?;
        let transform = reader.read_matrix::<f64>()?;
        let psi = reader.read_vector::<f64>()?;
        reader.expect_token(PLDA_CLOSE)?;
        Self::new(mean, transform, psi)
    }

    pub fn write<W: Write>(&self, writer: &mut TaggedWriter<W>) -> Result<()> {
        writer.write_token(PLDA_OPEN)?;
        writer.write_vector(self.mean.view())?;
        writer.write_matrix(self.transform.view())?;
        writer.write_vector(self.psi.view())?;
        writer.write_token(PLDA_CLOSE)
    }

    fn compute_offset(transform: &Array2<f64>, mean: &Array1<f64>) -> Array1<f64> {
        -transform.dot(mean)
    }

    fn compute_derived_vars(&mut self) {
        self.offset = Self::compute_offset(&self.transform, &self.mean);
    }

    pub fn dim(&self) -> usize {
        self.mean.len()
    }

    pub fn mean(&self) -> ArrayView1<f64> {
        self.mean.view()
    }

    pub fn transform(&self) -> ArrayView2<f64> {
        self.transform.view()
    }

    /// Between-class covariance in PLDA space
    pub fn psi(&self) -> ArrayView1<f64> {
        self.psi.view()
    }

    pub fn offset(&self) -> ArrayView1<f64> {
        self.offset.view()
    }

    /// Moves an embedding into PLDA space, ready for
    /// [`Plda::log_likelihood_ratio`].
    ///
    /// Returns the transformed vector and the length normalization factor.
    /// The factor is computed even when `config.normalize_length` is off, in
    /// which case it is returned but not applied. `num_examples` is the
    /// number of utterances the embedding was averaged over; it sets the
    /// expected covariance `Ψ + I/num_examples` used by the statistical
    /// normalization.
    pub fn transform_ivector(
        &self,
        ivector: ArrayView1<f64>,
        num_examples: usize,
        config: &PldaConfig,
    ) -> Result<(Array1<f64>, f64)> {
        if ivector.len() != self.dim() {
            return Err(Error::DimensionMismatch(format!(
                "embedding has dimension {}, PLDA expects {}",
                ivector.len(),
                self.dim()
            )));
        }
        let mut transformed = &self.offset + &self.transform.dot(&ivector);

        let factor = if config.simple_length_norm {
            let norm = transformed.dot(&transformed).sqrt();
            Self::checked_factor(norm, |norm| (self.dim() as f64).sqrt() / norm)?
        } else {
            self.normalization_factor(transformed.view(), num_examples)?
        };

        if config.normalize_length {
            transformed *= factor;
        }
        Ok((transformed, factor))
    }

    /// Factor that makes `xᵀ (Ψ + I/n)⁻¹ x` equal to the dimension.
    fn normalization_factor(
        &self,
        transformed: ArrayView1<f64>,
        num_examples: usize,
    ) -> Result<f64> {
        if num_examples == 0 {
            return Err(Error::InvalidArgument(
                "normalization needs at least one example".into(),
            ));
        }
        let n = num_examples as f64;
        let dot_prod: f64 = transformed
            .iter()
            .zip(self.psi.iter())
            .map(|(x, psi)| x * x / (psi + 1.0 / n))
            .sum();
        Self::checked_factor(dot_prod, |dot_prod| (self.dim() as f64 / dot_prod).sqrt())
    }

    fn checked_factor(denominator: f64, f: impl Fn(f64) -> f64) -> Result<f64> {
        if denominator == 0.0 || !denominator.is_finite() {
            return Err(Error::DegenerateNormalization);
        }
        let factor = f(denominator);
        if !factor.is_finite() {
            return Err(Error::DegenerateNormalization);
        }
        Ok(factor)
    }

    /// `log p(probe | same speaker) - log p(probe | different speaker)`.
    ///
    /// Both vectors must come from [`Plda::transform_ivector`]; `n` is the
    /// number of utterances averaged into `enrolled`.
    ///
    /// Given `n` enrollment examples with mean `ū`, the probe is distributed
    /// as `N(nΨ/(nΨ+I) ū, I + Ψ/(nΨ+I))`; without a class it is
    /// `N(0, I + Ψ)`. With `n = 0` both coincide and the ratio is zero.
    pub fn log_likelihood_ratio(
        &self,
        enrolled: ArrayView1<f64>,
        n: usize,
        probe: ArrayView1<f64>,
    ) -> f64 {
        debug_assert_eq!(enrolled.len(), self.dim());
        debug_assert_eq!(probe.len(), self.dim());
        let dim = self.dim() as f64;
        let n = n as f64;
        let log_2pi = (2.0 * PI).ln();

        let loglike_given_class = {
            let mut logdet = 0.0;
            let mut sqdiff = 0.0;
            for ((&psi, &train), &test) in self.psi.iter().zip(enrolled.iter()).zip(probe.iter()) {
                let mean = n * psi / (n * psi + 1.0) * train;
                let variance = 1.0 + psi / (n * psi + 1.0);
                logdet += variance.ln();
                sqdiff += (test - mean).powi(2) / variance;
            }
            -0.5 * (logdet + log_2pi * dim + sqdiff)
        };

        let loglike_without_class = {
            let mut logdet = 0.0;
            let mut sqdiff = 0.0;
            for (&psi, &test) in self.psi.iter().zip(probe.iter()) {
                let variance = 1.0 + psi;
                logdet += variance.ln();
                sqdiff += test * test / variance;
            }
            -0.5 * (logdet + log_2pi * dim + sqdiff)
        };

        loglike_given_class - loglike_without_class
    }

    /// Adds `smoothing_factor · Ψ` to the within-class covariance.
    ///
    /// Useful when too few utterances per speaker made the within-class
    /// estimate small and the leading `psi` entries large.
    pub fn smooth_within_class_covariance(&mut self, smoothing_factor: f64) -> Result<()> {
        if !(0.0..=1.0).contains(&smoothing_factor) {
            return Err(Error::InvalidArgument(format!(
                "smoothing factor must be in [0, 1], got {smoothing_factor}"
            )));
        }
        tracing::info!(
            "Smoothing within-class covariance by {smoothing_factor}, psi is initially {}",
            self.psi
        );
        let within_class_covar = self.psi.mapv(|psi| 1.0 + smoothing_factor * psi);
        self.psi /= &within_class_covar;
        tracing::info!("New value of psi is {}", self.psi);

        let row_scale = within_class_covar.mapv(|w| w.powf(-0.5));
        self.transform *= &row_scale.insert_axis(Axis(1));
        self.compute_derived_vars();
        Ok(())
    }

    /// Projects the model through `in_transform` (R×D, R ≤ D), typically a
    /// PCA/LDA reduction. The model dimension becomes R.
    pub fn apply_transform(&mut self, in_transform: ArrayView2<f64>) -> Result<()> {
        let (rows, cols) = in_transform.dim();
        if rows > self.dim() || cols != self.dim() || rows == 0 {
            return Err(Error::DimensionMismatch(format!(
                "projection is {rows}x{cols}, model dimension is {}",
                self.dim()
            )));
        }

        let mean = in_transform.dot(&self.mean);

        // Covariances in the original space, before diagonalization.
        let transform_invert = linalg::invert(self.transform.view())?;
        let within_var = transform_invert.dot(&transform_invert.t());
        let between_var = transform_invert
            .dot(&Array2::from_diag(&self.psi))
            .dot(&transform_invert.t());

        let within_var_new = in_transform.dot(&within_var).dot(&in_transform.t());
        let between_var_new = in_transform.dot(&between_var).dot(&in_transform.t());

        // transform1 makes the projected within-class covariance unit.
        let chol = linalg::cholesky(within_var_new.view())?;
        let transform1 = linalg::invert_lower_triangular(chol.view())?;
        let between_var_proj = transform1.dot(&between_var_new).dot(&transform1.t());

        let (s, u) = linalg::symmetric_eigen(between_var_proj.view())?;
        let floored = s.iter().filter(|&&v| v < 0.0).count();
        if floored > 0 {
            tracing::warn!("Floored {floored} eigenvalues of between-class variance to zero");
        }
        let s = s.mapv(|v| v.max(0.0));
        let (s, u) = linalg::sort_eigen_descending(&s, &u);

        self.mean = mean;
        self.transform = u.t().dot(&transform1);
        self.psi = s;
        self.compute_derived_vars();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use std::io::Cursor;

    fn toy_plda() -> Plda {
        Plda::new(array![0.0, 0.0], Array2::eye(2), array![4.0, 1.0]).unwrap()
    }

    fn raw() -> PldaConfig {
        PldaConfig {
            normalize_length: false,
            simple_length_norm: false,
        }
    }

    #[test]
    fn offset_is_derived_from_mean() {
        let transform = array![[2.0, 0.0], [1.0, 1.0]];
        let plda = Plda::new(array![1.0, 2.0], transform, array![3.0, 1.0]).unwrap();
        assert_eq!(plda.offset(), array![-2.0, -3.0]);
    }

    #[test]
    fn shape_mismatch_is_rejected() {
        let err = Plda::new(array![0.0, 0.0], Array2::eye(3), array![1.0, 1.0]).unwrap_err();
        assert!(matches!(err, Error::DimensionMismatch(_)));
    }

    #[test]
    fn llr_matches_closed_form() {
        let plda = toy_plda();
        let enrolled = array![2.0, 0.0];

        // m = [1.6, 0], v = [1.8, 1.5]; without-class variance = [5, 2].
        let given = |sq: f64| -0.5 * (1.8f64.ln() + 1.5f64.ln() + sq);
        let without = |sq: f64| -0.5 * (5.0f64.ln() + 2.0f64.ln() + sq);

        let same = plda.log_likelihood_ratio(enrolled.view(), 1, array![2.0, 0.0].view());
        let expected_same = given(0.4f64.powi(2) / 1.8) - without(4.0 / 5.0);
        assert!((same - expected_same).abs() < 1e-12);

        let opposite = plda.log_likelihood_ratio(enrolled.view(), 1, array![-2.0, 0.0].view());
        let expected_opposite = given(3.6f64.powi(2) / 1.8) - without(4.0 / 5.0);
        assert!((opposite - expected_opposite).abs() < 1e-12);

        assert!(same > opposite);
    }

    #[test]
    fn llr_without_examples_is_zero() {
        let plda = toy_plda();
        let score = plda.log_likelihood_ratio(array![3.0, -1.0].view(), 0, array![0.5, 2.0].view());
        assert_eq!(score, 0.0);
    }

    #[test]
    fn llr_converges_as_examples_grow() {
        let plda = toy_plda();
        let enrolled = array![1.0f64, -0.5];
        let probe = array![0.7f64, 0.2];

        // With n → ∞ the enrollment mean is exact and the variance is unit.
        let log_2pi = (2.0 * PI).ln();
        let given_limit = -0.5
            * (2.0 * log_2pi + (probe[0] - enrolled[0]).powi(2) + (probe[1] - enrolled[1]).powi(2));
        let without = -0.5
            * (5.0f64.ln()
                + 2.0f64.ln()
                + 2.0 * log_2pi
                + probe[0].powi(2) / 5.0
                + probe[1].powi(2) / 2.0);

        let mut previous = f64::INFINITY;
        for n in [1, 10, 100, 10_000, 1_000_000] {
            let score = plda.log_likelihood_ratio(enrolled.view(), n, probe.view());
            let gap = (score - (given_limit - without)).abs();
            assert!(gap <= previous);
            previous = gap;
        }
        assert!(previous < 1e-5);
    }

    #[test]
    fn transform_applies_offset_and_matrix() {
        let transform = array![[2.0, 0.0], [0.0, 1.0]];
        let plda = Plda::new(array![1.0, 1.0], transform, array![2.0, 1.0]).unwrap();
        let (transformed, _) = plda
            .transform_ivector(array![2.0, 3.0].view(), 1, &raw())
            .unwrap();
        assert_eq!(transformed, array![2.0, 2.0]);
    }

    #[test]
    fn statistical_normalization_matches_expected_covariance() {
        let plda = toy_plda();
        let (transformed, factor) = plda
            .transform_ivector(array![1.0, 1.0].view(), 2, &PldaConfig::default())
            .unwrap();
        // inv_covar = [1/4.5, 1/1.5]
        let expected = (2.0 / (1.0 / 4.5 + 1.0 / 1.5f64)).sqrt();
        assert!((factor - expected).abs() < 1e-12);
        let check: f64 = transformed[0].powi(2) / 4.5 + transformed[1].powi(2) / 1.5;
        assert!((check - 2.0).abs() < 1e-12);
    }

    #[test]
    fn simple_normalization_sets_length() {
        let plda = toy_plda();
        let config = PldaConfig {
            normalize_length: true,
            simple_length_norm: true,
        };
        let (transformed, factor) = plda
            .transform_ivector(array![3.0, 4.0].view(), 1, &config)
            .unwrap();
        assert!((factor - 2f64.sqrt() / 5.0).abs() < 1e-12);
        assert!((transformed.dot(&transformed).sqrt() - 2f64.sqrt()).abs() < 1e-12);
    }

    #[test]
    fn factor_is_returned_without_scaling() {
        let plda = toy_plda();
        let (transformed, factor) = plda
            .transform_ivector(array![3.0, 4.0].view(), 1, &raw())
            .unwrap();
        assert_eq!(transformed, array![3.0, 4.0]);
        assert!(factor > 0.0);
    }

    #[test]
    fn zero_vector_fails_normalization() {
        let plda = toy_plda();
        for config in [
            PldaConfig::default(),
            PldaConfig {
                normalize_length: true,
                simple_length_norm: true,
            },
        ] {
            let err = plda.transform_ivector(array![0.0, 0.0].view(), 1, &config).unwrap_err();
            assert!(matches!(err, Error::DegenerateNormalization));
        }
    }

    #[test]
    fn wrong_dimension_is_rejected() {
        let plda = toy_plda();
        let err = plda
            .transform_ivector(array![1.0, 2.0, 3.0].view(), 1, &raw())
            .unwrap_err();
        assert!(matches!(err, Error::DimensionMismatch(_)));
    }

    #[test]
    fn smoothing_rescales_psi_and_transform() {
        let mut plda = toy_plda();
        plda.smooth_within_class_covariance(0.5).unwrap();
        // within = [3, 1.5]
        assert!((plda.psi()[0] - 4.0 / 3.0).abs() < 1e-12);
        assert!((plda.psi()[1] - 1.0 / 1.5).abs() < 1e-12);
        assert!((plda.transform()[[0, 0]] - 3f64.powf(-0.5)).abs() < 1e-12);
        assert!((plda.transform()[[1, 1]] - 1.5f64.powf(-0.5)).abs() < 1e-12);
        assert!(plda.smooth_within_class_covariance(1.5).is_err());
    }

    #[test]
    fn identity_projection_preserves_model() {
        let transform = array![[1.0, 0.5, 0.0], [0.0, 2.0, 0.3], [0.2, 0.0, 1.5]];
        let mut plda =
            Plda::new(array![0.1, -0.2, 0.3], transform, array![3.0, 1.0, 0.25]).unwrap();
        let before = plda.clone();
        plda.apply_transform(Array2::eye(3).view()).unwrap();

        for (a, b) in plda.psi().iter().zip(before.psi().iter()) {
            assert!((a - b).abs() < 1e-9);
        }
        // Scores are invariant to the sign of each PLDA axis.
        let x = array![0.4, 0.1, -0.6];
        let y = array![0.3, -0.2, -0.5];
        let cfg = raw();
        let (bx, _) = before.transform_ivector(x.view(), 1, &cfg).unwrap();
        let (by, _) = before.transform_ivector(y.view(), 1, &cfg).unwrap();
        let (ax, _) = plda.transform_ivector(x.view(), 1, &cfg).unwrap();
        let (ay, _) = plda.transform_ivector(y.view(), 1, &cfg).unwrap();
        let expected = before.log_likelihood_ratio(bx.view(), 1, by.view());
        let actual = plda.log_likelihood_ratio(ax.view(), 1, ay.view());
        assert!((expected - actual).abs() < 1e-9);
    }

    #[test]
    fn projection_reduces_dimension() {
        let mut plda =
            Plda::new(array![1.0, 2.0, 3.0], Array2::eye(3), array![5.0, 2.0, 1.0]).unwrap();
        let projection = array![[1.0, 0.0, 0.0], [0.0, 1.0, 1.0]];
        plda.apply_transform(projection.view()).unwrap();

        assert_eq!(plda.dim(), 2);
        assert_eq!(plda.mean(), array![1.0, 5.0]);
        assert_eq!(plda.transform().dim(), (2, 2));
        assert!(plda.psi()[0] >= plda.psi()[1]);
        assert!(plda.psi().iter().all(|&v| v >= 0.0));
        // Within [[1,0],[0,2]], between [[5,0],[0,3]] → psi = [5, 1.5].
        assert!((plda.psi()[0] - 5.0).abs() < 1e-9);
        assert!((plda.psi()[1] - 1.5).abs() < 1e-9);
    }

    #[test]
    fn projection_must_not_grow_dimension() {
        let mut plda = toy_plda();
        let err = plda.apply_transform(Array2::eye(3).view()).unwrap_err();
        assert!(matches!(err, Error::DimensionMismatch(_)));
    }

    #[test]
    fn write_read_round_trip() {
        let transform = array![[0.3, -1.25], [2.0, 0.125]];
        let plda = Plda::new(array![0.1, 1.0 / 3.0], transform, array![7.5, 0.01]).unwrap();
        for binary in [true, false] {
            let mut writer = TaggedWriter::new(Vec::new(), binary).unwrap();
            plda.write(&mut writer).unwrap();
            let bytes = writer.into_inner();
            let mut reader = TaggedReader::new(Cursor::new(bytes)).unwrap();
            let read = Plda::read(&mut reader).unwrap();
            assert_eq!(read, plda);
        }
    }

    #[test]
    fn missing_close_tag_is_an_error() {
        let mut writer = TaggedWriter::new(Vec::new(), true).unwrap();
        writer.write_token(PLDA_OPEN).unwrap();
        writer.write_vector(array![0.0f64].view()).unwrap();
        writer.write_matrix(array![[1.0f64]].view()).unwrap();
        writer.write_vector(array![1.0f64].view()).unwrap();
        let bytes = writer.into_inner();
        let mut reader = TaggedReader::new(Cursor::new(bytes)).unwrap();
        assert!(Plda::read(&mut reader).is_err());
    }
}
