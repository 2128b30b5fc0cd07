mod session;

pub mod config;
mod embedding;
mod enroll;
mod error;
mod extract;
mod frontend;
pub mod linalg;
mod plda;
mod postprocess;
pub mod tagged;
mod verifier;
mod wav;

pub use config::{EngineConfig, ExtractorConfig, ModelFiles, VerifierConfig};
pub use embedding::{EmbeddingEngine, OnnxEngine};
pub use enroll::{EnrollmentStore, SpeakerTemplate};
pub use error::{Error, Result};
pub use extract::{ChunkedExtractor, Extraction};
pub use frontend::{FbankFrontend, FeatureFrontend};
pub use plda::{Plda, PldaConfig};
pub use postprocess::{normalize_length, PostProcessor};
pub use verifier::{SessionState, SpeakerVerifier, Verification};
pub use wav::{pcm16_from_bytes, read_wav, SAMPLE_RATE};
