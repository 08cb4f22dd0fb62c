/// Haven Bulk: pipelined bulk-pull engine.
///
/// Moves a remote memory region into a local staging buffer with a bounded
/// window of concurrent fixed-size chunk pulls:
/// - Chunk planning with a short tail chunk
/// - Sliding window of `D` slots, refilled on each completion
/// - Per-session state machine with a single-fire response
/// - Materialize/verify hooks over every delivered chunk
/// - Structural release of buffer, source reference, and request
/// - In-process loopback substrate with fault injection

pub mod config;
mod dispatcher;
pub mod engine;
pub mod error;
pub mod logging;
pub mod loopback;
pub mod planner;
pub mod session;
pub mod sink;
pub mod substrate;
pub mod window;

// Re-export key types for convenience.
pub use config::{DEFAULT_CHUNK_SIZE, DEFAULT_MAX_WINDOW_DEPTH, EmptyTransferPolicy, EngineConfig};
pub use engine::{BulkEngine, SessionStatus, SessionTable};
pub use error::{AbortReason, EngineError, SinkError, SubstrateError};
pub use logging::{NullLogger, TracingLogger, TransferEvent, TransferLog, TransferLogger};
pub use loopback::{LoopbackStats, LoopbackSubstrate, ProgressThread};
pub use planner::{ChunkDescriptor, ChunkPlan, chunk_count};
pub use session::{SessionId, SessionSnapshot, SessionState, TransferSession};
pub use sink::{
    ChunkSink, DigestVerifier, FileSink, NullSink, PatternVerifier, pattern_byte,
    pattern_payload, sha256_hex,
};
pub use substrate::{
    BufferHandle, BulkSubstrate, ChunkPull, LocalBuffer, PullCallback, PullId, RequestHandle,
    SourceHandle, StagingMemory, TransferResponse,
};
pub use window::{PipelineWindow, SlotId};
