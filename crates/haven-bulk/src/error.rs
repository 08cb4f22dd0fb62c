use thiserror::Error;

/// Failure reported by a substrate primitive.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubstrateError {
    #[error("unknown source handle {0}")]
    UnknownSource(u64),
    #[error("unknown local buffer {0}")]
    UnknownBuffer(u64),
    #[error("unknown request {0}")]
    UnknownRequest(u64),
    #[error("range {offset}+{length} outside region of {size} bytes")]
    OutOfRange { offset: u64, length: u64, size: u64 },
    #[error("allocation of {0} bytes failed")]
    Allocation(u64),
    #[error("pull at offset {offset} failed: {reason}")]
    Pull { offset: u64, reason: String },
    #[error("substrate is shut down")]
    Shutdown,
    #[error("{0}")]
    Other(String),
}

/// Failure raised by a materialize/verify hook.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SinkError {
    #[error("byte mismatch at {position}: expected {expected}, got {actual}")]
    PatternMismatch { position: u64, expected: u8, actual: u8 },
    #[error("chunk at {offset} hash mismatch: expected {expected}, got {actual}")]
    DigestMismatch {
        offset: u64,
        expected: String,
        actual: String,
    },
    #[error("no expected digest for chunk at {0}")]
    MissingDigest(u64),
    #[error("I/O error: {0}")]
    Io(String),
}

impl From<std::io::Error> for SinkError {
    fn from(e: std::io::Error) -> Self {
        SinkError::Io(e.to_string())
    }
}

/// Errors surfaced by `BulkEngine::begin_transfer`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    #[error("chunk size must be non-zero")]
    InvalidChunkSize,
    #[error("window depth must be non-zero")]
    InvalidWindowDepth,
    #[error("empty transfer rejected")]
    EmptyTransfer,
    #[error("cannot read remote size: {0}")]
    RemoteSize(#[source] SubstrateError),
    #[error("cannot acquire source reference: {0}")]
    SourceAcquire(#[source] SubstrateError),
    #[error("cannot allocate staging buffer: {0}")]
    BufferAllocation(#[source] SubstrateError),
    #[error("pull submission at offset {offset} failed: {source}")]
    PullSubmit {
        offset: u64,
        #[source]
        source: SubstrateError,
    },
}

/// Why a session ended in `Aborted`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AbortReason {
    #[error("pull submission at offset {offset} failed: {source}")]
    Submit { offset: u64, source: SubstrateError },
    #[error("pull at offset {offset} completed with error: {source}")]
    Pull { offset: u64, source: SubstrateError },
    #[error("sink rejected chunk at offset {offset}: {source}")]
    Sink { offset: u64, source: SinkError },
    #[error("response could not be sent: {0}")]
    Respond(SubstrateError),
}

/// A pull the substrate refused to start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SubmitFailure {
    pub offset: u64,
    pub source: SubstrateError,
}

impl From<SubmitFailure> for AbortReason {
    fn from(f: SubmitFailure) -> Self {
        AbortReason::Submit {
            offset: f.offset,
            source: f.source,
        }
    }
}

impl From<SubmitFailure> for EngineError {
    fn from(f: SubmitFailure) -> Self {
        EngineError::PullSubmit {
            offset: f.offset,
            source: f.source,
        }
    }
}
