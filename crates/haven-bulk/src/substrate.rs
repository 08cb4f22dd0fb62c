/// Transport/RPC substrate seam.
///
/// The engine only orchestrates which pulls are outstanding. Moving bytes,
/// registering memory, and answering requests all go through
/// [`BulkSubstrate`].

use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::SubstrateError;
use crate::session::SessionId;

macro_rules! handle_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub u64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

handle_type!(
    /// Remote memory region exposed by the requester.
    SourceHandle
);
handle_type!(
    /// Local memory region registered for bulk access.
    BufferHandle
);
handle_type!(
    /// One asynchronous chunk pull.
    PullId
);
handle_type!(
    /// Inbound write request awaiting a response.
    RequestHandle
);

/// Byte storage behind a local buffer.
///
/// Pulls write disjoint ranges, hooks read the range just delivered. The lock
/// is only held for the copy itself.
pub struct StagingMemory {
    bytes: RwLock<Box<[u8]>>,
}

impl StagingMemory {
    /// Allocate `len` zeroed bytes, reporting allocation failure instead of
    /// aborting the process.
    pub fn zeroed(len: u64) -> Result<Self, SubstrateError> {
        let size = usize::try_from(len).map_err(|_| SubstrateError::Allocation(len))?;
        let mut bytes = Vec::new();
        bytes
            .try_reserve_exact(size)
            .map_err(|_| SubstrateError::Allocation(len))?;
        bytes.resize(size, 0);
        Ok(Self {
            bytes: RwLock::new(bytes.into_boxed_slice()),
        })
    }

    #[inline]
    pub fn len(&self) -> u64 {
        self.bytes.read().len() as u64
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy `data` into the buffer at `offset`.
    pub fn write_at(&self, offset: u64, data: &[u8]) -> Result<(), SubstrateError> {
        let mut bytes = self.bytes.write();
        let range = checked_range(offset, data.len() as u64, bytes.len() as u64)?;
        bytes[range].copy_from_slice(data);
        Ok(())
    }

    /// Run `f` over `[offset, offset + length)`.
    pub fn with_range<R>(
        &self,
        offset: u64,
        length: u64,
        f: impl FnOnce(&[u8]) -> R,
    ) -> Result<R, SubstrateError> {
        let bytes = self.bytes.read();
        let range = checked_range(offset, length, bytes.len() as u64)?;
        Ok(f(&bytes[range]))
    }

    /// Run `f` over the whole buffer.
    pub fn with_all<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        f(&self.bytes.read())
    }
}

impl fmt::Debug for StagingMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StagingMemory").field("len", &self.len()).finish()
    }
}

/// Validate `offset + length <= size` and return the matching slice range.
pub(crate) fn checked_range(
    offset: u64,
    length: u64,
    size: u64,
) -> Result<std::ops::Range<usize>, SubstrateError> {
    match offset.checked_add(length) {
        Some(end) if end <= size => Ok(offset as usize..end as usize),
        _ => Err(SubstrateError::OutOfRange {
            offset,
            length,
            size,
        }),
    }
}

/// A registered local buffer: the memory plus the handle pulls target.
#[derive(Debug, Clone)]
pub struct LocalBuffer {
    pub handle: BufferHandle,
    pub memory: Arc<StagingMemory>,
}

/// Parameters of one chunk pull from a remote region into a local buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkPull {
    pub source: SourceHandle,
    pub source_offset: u64,
    pub buffer: BufferHandle,
    pub local_offset: u64,
    pub length: u64,
}

/// Fires exactly once per successfully submitted pull.
pub type PullCallback = Box<dyn FnOnce(PullId, Result<(), SubstrateError>) + Send + 'static>;

/// Payload of the terminal response for a completed transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferResponse {
    pub session_id: SessionId,
    pub total_bytes: u64,
    pub chunks: u64,
    /// Hex SHA-256 of the fully materialized staging buffer.
    pub sha256: String,
}

/// Primitives the engine consumes from the transport.
///
/// Implementations must never run `on_complete` from inside
/// `begin_chunk_pull`; completions are delivered later by the substrate's
/// progress mechanism, on whatever thread it chooses.
pub trait BulkSubstrate: Send + Sync {
    /// Total length of the remote region.
    fn remote_size(&self, source: SourceHandle) -> Result<u64, SubstrateError>;

    /// Start an asynchronous pull of `pull.length` bytes.
    fn begin_chunk_pull(
        &self,
        pull: ChunkPull,
        on_complete: PullCallback,
    ) -> Result<PullId, SubstrateError>;

    fn create_local_buffer(&self, len: u64) -> Result<LocalBuffer, SubstrateError>;
    fn destroy_local_buffer(&self, handle: BufferHandle);

    /// Keep the remote descriptor alive until every pull referencing it is done.
    fn acquire_source_ref(&self, source: SourceHandle) -> Result<(), SubstrateError>;
    fn release_source_ref(&self, source: SourceHandle);

    fn send_response(
        &self,
        request: RequestHandle,
        response: TransferResponse,
    ) -> Result<(), SubstrateError>;
    fn release_request(&self, request: RequestHandle);
}
