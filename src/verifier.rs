use crate::config::{ModelPaths, VerifierConfig};
use crate::embedding::{EmbeddingEngine, OnnxEngine};
use crate::enroll::EnrollmentStore;
use crate::error::{Error, Result};
use crate::extract::ChunkedExtractor;
use crate::frontend::{FbankFrontend, FeatureFrontend};
use crate::plda::Plda;
use crate::postprocess::PostProcessor;
use ndarray::Array1;
use std::fs::File;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    EnrollmentEmpty,
    EnrollmentReady,
}

/// Outcome of scoring one probe utterance.
#[derive(Debug, Clone, PartialEq)]
pub struct Verification {
    /// Log-likelihood ratio against the first enrolled speaker
    pub score: f64,
    /// `score >= threshold`
    pub accepted: bool,
    /// Scores against every enrolled speaker, in id order
    pub scores: Vec<f64>,
}

impl Verification {
    /// Enrolled speaker with the highest score. Ties go to the lower id.
    pub fn best_match(&self) -> Option<(usize, f64)> {
        self.scores
            .iter()
            .copied()
            .enumerate()
            .fold(None, |best, (id, score)| match best {
                Some((_, best_score)) if best_score >= score => best,
                _ => Some((id, score)),
            })
    }
}

/// A loaded speaker verification model plus its enrollments.
///
/// Utterances go through the feature frontend, chunked x-vector
/// extraction, post-processing and the PLDA transform before they are
/// either stored as a speaker template or scored against the stored ones.
pub struct SpeakerVerifier<E = OnnxEngine, F = FbankFrontend> {
    config: VerifierConfig,
    frontend: F,
    extractor: ChunkedExtractor<E>,
    post: PostProcessor,
    plda: Plda,
    store: EnrollmentStore,
    pending: Vec<Array1<f32>>,
    enrollment_path: PathBuf,
}

impl SpeakerVerifier {
    /// Loads the model directory with the ONNX engine and fbank frontend,
    /// reading `config.toml` from the directory when present.
    pub fn from_model_dir<P: AsRef<Path>>(model_dir: P) -> Result<Self> {
        let config = VerifierConfig::from_model_dir(model_dir.as_ref())?;
        Self::init(model_dir, config)
    }

    pub fn init<P: AsRef<Path>>(model_dir: P, config: VerifierConfig) -> Result<Self> {
        Self::init_with(model_dir, config, FbankFrontend)
    }
}

impl<E: EmbeddingEngine, F: FeatureFrontend> SpeakerVerifier<E, F> {
    /// Loads the model directory with an injected engine type and frontend.
    ///
    /// The embedding network, PLDA model, post-processing transform and mean
    /// must all be present. A persisted enrollment store is loaded when it
    /// exists.
    pub fn init_with<P: AsRef<Path>>(
        model_dir: P,
        config: VerifierConfig,
        frontend: F,
    ) -> Result<Self> {
        let model_dir = model_dir.as_ref();
        let paths = config.files.resolve(model_dir);
        check_model_files(&paths)?;

        let post = PostProcessor::load(&paths.mean, &paths.transform)
            .map_err(|e| config_error("post-processing", &paths.transform, e))?;
        let plda = Plda::load(&paths.plda).map_err(|e| config_error("PLDA", &paths.plda, e))?;
        if post.output_dim() != plda.dim() {
            return Err(Error::DimensionMismatch(format!(
                "post-processing outputs dimension {}, PLDA expects {}",
                post.output_dim(),
                plda.dim()
            )));
        }
        let engine = E::load(&paths.nnet, &config.engine)
            .map_err(|e| Error::Config(format!("failed to load {}: {e:#}", paths.nnet.display())))?;
        let extractor = ChunkedExtractor::new(engine, config.extractor.clone())?;
        tracing::info!("Loaded speaker verification model from {}", model_dir.display());

        let mut verifier = Self {
            config,
            frontend,
            extractor,
            post,
            plda,
            store: EnrollmentStore::new(),
            pending: Vec::new(),
            enrollment_path: paths.enrollment,
        };
        if verifier.enrollment_path.exists() {
            let path = verifier.enrollment_path.clone();
            verifier.load_enrollment(path)?;
        }
        Ok(verifier)
    }

    pub fn config(&self) -> &VerifierConfig {
        &self.config
    }

    pub fn threshold(&self) -> f64 {
        self.config.threshold
    }

    pub fn plda(&self) -> &Plda {
        &self.plda
    }

    pub fn enrollments(&self) -> &EnrollmentStore {
        &self.store
    }

    pub fn enrollment_path(&self) -> &Path {
        &self.enrollment_path
    }

    pub fn state(&self) -> SessionState {
        if self.store.is_empty() {
            SessionState::EnrollmentEmpty
        } else {
            SessionState::EnrollmentReady
        }
    }

    pub fn has_enrollment(&self) -> bool {
        !self.store.is_empty()
    }

    /// Utterances fed since the last commit.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// samples → features → chunked x-vector → post-processing.
    pub fn embed(&mut self, samples: &[i16]) -> Result<Array1<f32>> {
        let features = self
            .frontend
            .compute_features(samples)
            .map_err(Error::Frontend)?;
        let xvector = self.extractor.extract(features.view())?;
        self.post.apply(xvector.view())
    }

    /// Moves a post-processed embedding averaged over `num_utts` utterances
    /// into PLDA space.
    fn plda_transform(&self, xvector: &Array1<f32>, num_utts: usize) -> Result<Array1<f64>> {
        let xvector = xvector.mapv(f64::from);
        let (transformed, _) = self
            .plda
            .transform_ivector(xvector.view(), num_utts, &self.config.plda)?;
        Ok(transformed)
    }

    /// Extracts one enrollment utterance and keeps it until
    /// [`SpeakerVerifier::commit_enrollment`].
    pub fn feed_enrolling_wave(&mut self, samples: &[i16]) -> Result<()> {
        let xvector = self.embed(samples)?;
        self.pending.push(xvector);
        tracing::debug!("Fed enrollment utterance {}", self.pending.len());
        Ok(())
    }

    /// Averages the fed utterances into a template for `speaker_id`.
    ///
    /// Every utterance counts once regardless of its length. Returns the id
    /// the template was stored under: `speaker_id` when it already exists,
    /// the next free id otherwise.
    pub fn commit_enrollment(&mut self, speaker_id: usize) -> Result<usize> {
        if self.pending.is_empty() {
            return Err(Error::EmptyEnrollment);
        }
        let num_utts = self.pending.len();
        let mean = mean_vectors(&self.pending)?;
        let transformed = self.plda_transform(&mean, num_utts)?;
        let id = self.store.enroll(transformed, num_utts, speaker_id);
        self.pending.clear();
        tracing::info!("Enrolled speaker {id} from {num_utts} utterance(s)");
        Ok(id)
    }

    /// Drops the fed utterances without enrolling.
    pub fn discard_pending(&mut self) {
        self.pending.clear();
    }

    /// Enrolls a single utterance in one step. Fed utterances waiting for a
    /// commit are left alone.
    pub fn enroll_wave(&mut self, samples: &[i16], speaker_id: usize) -> Result<usize> {
        let xvector = self.embed(samples)?;
        let transformed = self.plda_transform(&xvector, 1)?;
        let id = self.store.enroll(transformed, 1, speaker_id);
        tracing::info!("Enrolled speaker {id} from 1 utterance");
        Ok(id)
    }

    /// Enrolls from several utterances at once. Utterances that are too
    /// short to extract are skipped; at least one has to succeed.
    pub fn enroll_waves(&mut self, utterances: &[&[i16]], speaker_id: usize) -> Result<usize> {
        let mut xvectors = Vec::with_capacity(utterances.len());
        let mut last_error = None;
        for samples in utterances {
            match self.embed(samples) {
                Ok(xvector) => xvectors.push(xvector),
                Err(e) if e.is_recoverable() => {
                    tracing::warn!("Skipping enrollment utterance: {e}");
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        if xvectors.is_empty() {
            return Err(last_error.unwrap_or(Error::EmptyEnrollment));
        }
        let num_utts = xvectors.len();
        let mean = mean_vectors(&xvectors)?;
        let transformed = self.plda_transform(&mean, num_utts)?;
        let id = self.store.enroll(transformed, num_utts, speaker_id);
        tracing::info!("Enrolled speaker {id} from {num_utts} utterance(s)");
        Ok(id)
    }

    /// Scores a probe utterance against every enrolled speaker. The
    /// decision is taken on speaker 0, the device owner.
    ///
    /// Fails with [`Error::NoEnrollment`] before touching the audio when
    /// nobody is enrolled.
    pub fn verify_wave(&mut self, samples: &[i16]) -> Result<Verification> {
        if self.store.is_empty() {
            return Err(Error::NoEnrollment);
        }
        let xvector = self.embed(samples)?;
        let probe = self.plda_transform(&xvector, 1)?;
        let scores = self.store.score(&self.plda, probe.view());
        let score = scores.first().copied().ok_or(Error::NoEnrollment)?;

        let accepted = score >= self.config.threshold;
        tracing::debug!(score, accepted, "Verified probe");
        Ok(Verification {
            score,
            accepted,
            scores,
        })
    }

    /// Replaces the enrolled speakers with the ones stored at `path`.
    pub fn load_enrollment<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        let path = path.as_ref();
        let store = EnrollmentStore::load(path)?;
        if let Some(dim) = store.dim() {
            if dim != self.plda.dim() {
                return Err(Error::DimensionMismatch(format!(
                    "{} holds templates of dimension {dim}, PLDA expects {}",
                    path.display(),
                    self.plda.dim()
                )));
            }
        }
        tracing::info!("Loaded {} enrolled speaker(s) from {}", store.len(), path.display());
        self.store = store;
        Ok(())
    }

    /// Writes the enrolled speakers to the model directory's enrollment file.
    pub fn save_enrollment(&self) -> Result<()> {
        self.save_enrollment_to(&self.enrollment_path)
    }

    pub fn save_enrollment_to<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        self.store.save(path.as_ref())?;
        tracing::info!(
            "Saved {} enrolled speaker(s) to {}",
            self.store.len(),
            path.as_ref().display()
        );
        Ok(())
    }

    pub fn clear_enrollment(&mut self) {
        self.store.clear();
    }
}

fn check_model_files(paths: &ModelPaths) -> Result<()> {
    for (what, path) in paths.required() {
        File::open(path)
            .map_err(|e| Error::Config(format!("cannot open {what} {}: {e}", path.display())))?;
    }
    Ok(())
}

fn config_error(what: &str, path: &Path, err: Error) -> Error {
    match err {
        Error::DimensionMismatch(_) => err,
        err => Error::Config(format!("failed to read {what} model {}: {err}", path.display())),
    }
}

/// Unweighted average of equally sized vectors.
fn mean_vectors(vectors: &[Array1<f32>]) -> Result<Array1<f32>> {
    let first = vectors.first().ok_or(Error::EmptyEnrollment)?;
    let mut sum = Array1::<f32>::zeros(first.len());
    for vector in vectors {
        if vector.len() != sum.len() {
            return Err(Error::DimensionMismatch(format!(
                "cannot average vectors of dimension {} and {}",
                sum.len(),
                vector.len()
            )));
        }
        sum += vector;
    }
    Ok(sum / vectors.len() as f32)
}
