use thiserror::Error;

/// Errors raised while placing uniform data or driving a uniform batch.
///
/// Bookkeeping in the reaper never fails; only structural misuse of the
/// uniform path is reported.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UniformError {
    #[error("uniform group of {bytes} bytes does not fit in a {alignment}-byte alignment unit")]
    GroupTooLarge { bytes: usize, alignment: usize },

    #[error("uniform placement requested after the frame was flushed; call end_frame first")]
    PlacementAfterFlush,

    #[error("frame was already flushed; call end_frame before flushing again")]
    AlreadyFlushed,

    #[error("minimum uniform alignment must be a non-zero multiple of 4 bytes, got {alignment}")]
    InvalidAlignment { alignment: usize },

    #[error("granularity {granularity} must be a non-zero multiple of the minimum alignment {alignment}")]
    InvalidGranularity { granularity: usize, alignment: usize },

    #[error("uniform arena needs a non-zero initial capacity")]
    EmptyArena,
}

/// Errors raised while loading render settings.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to parse render settings: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("gc frequency must be non-zero (field '{field}')")]
    ZeroFrequency { field: &'static str },

    #[error(transparent)]
    Uniform(#[from] UniformError),
}
