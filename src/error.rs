use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("config error: {0}")]
    Config(String),

    #[error("not enough frames: got {frames}, need at least {required}")]
    InsufficientFrames { frames: usize, required: usize },

    #[error("every chunk was skipped, total weight is zero")]
    ZeroWeight,

    #[error("dimension mismatch: {0}")]
    DimensionMismatch(String),

    #[error("length normalization denominator is zero")]
    DegenerateNormalization,

    #[error("no enrollment utterances have been fed")]
    EmptyEnrollment,

    #[error("no speaker is enrolled")]
    NoEnrollment,

    #[error("invalid audio: {0}")]
    InvalidAudio(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("malformed stream: {0}")]
    Format(String),

    #[error("linear algebra: {0}")]
    Linalg(String),

    #[error("feature frontend: {0:#}")]
    Frontend(eyre::Report),

    #[error("embedding engine: {0:#}")]
    Engine(eyre::Report),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Errors the caller can recover from by supplying more audio or
    /// enrolling first. Everything else points at broken model files.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::InsufficientFrames { .. }
                | Error::ZeroWeight
                | Error::EmptyEnrollment
                | Error::NoEnrollment
                | Error::InvalidAudio(_)
                | Error::Frontend(_)
                | Error::Io(_)
        )
    }
}
