use thiserror::Error;

/// Why a raw wire message produced no event.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// Kinds other than 1/2/3. Callers drop these silently.
    #[error("unknown message kind {0}")]
    UnknownKind(u32),
    #[error("{kind} message truncated: {len} bytes, need at least {need}")]
    Truncated {
        kind: &'static str,
        len: usize,
        need: usize,
    },
    #[error("stream id is not valid utf-8")]
    StreamId,
    #[error("audio payload of {0} bytes is not a whole number of f32 samples")]
    MisalignedAudio(usize),
    #[error("invalid control payload: {0}")]
    Control(#[from] serde_json::Error),
}

impl DecodeError {
    /// Unknown kinds are expected traffic and are not worth a diagnostic.
    pub fn is_silent(&self) -> bool {
        matches!(self, DecodeError::UnknownKind(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScaleError {
    #[error("frame dimensions must be non-zero, got {width}x{height}")]
    ZeroDimensions { width: u32, height: u32 },
    #[error("I420 requires even dimensions, got {width}x{height}")]
    OddDimensions { width: u32, height: u32 },
    #[error("frame buffer too small: {len} bytes, need {need}")]
    ShortBuffer { len: usize, need: usize },
    #[error("aspect-fit produced a degenerate {width}x{height} image")]
    Degenerate { width: u32, height: u32 },
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("invalid pipeline configuration: {0}")]
    Config(String),
    #[error("codec backend failed to open: {0:#}")]
    Backend(anyhow::Error),
    #[error("failed to spawn worker {name}: {source}")]
    Spawn {
        name: String,
        #[source]
        source: std::io::Error,
    },
    #[error("pipeline must be started inside a tokio runtime")]
    NoRuntime,
}
