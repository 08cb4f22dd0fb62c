/// Transfer session: one inbound write request from creation to response.
///
/// ```text
/// Init ──prime──> Streaming ──total reached──> Finalizing ──> Done
///   │                 │
///   └──────┬──────────┘
///          v
///       Aborted   (outstanding pulls drain, then resources are released)
/// ```
///
/// All mutable state sits behind one mutex. Completion callbacks hold an
/// `Arc` to the session, so a late completion can never touch freed state.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;

use crate::config::EmptyTransferPolicy;
use crate::dispatcher;
use crate::engine::{SessionStatus, SessionTable};
use crate::error::{AbortReason, EngineError, SubmitFailure, SubstrateError};
use crate::logging::{TransferEvent, TransferLog, TransferLogger};
use crate::planner::{ChunkDescriptor, ChunkPlan};
use crate::sink::{ChunkSink, sha256_hex};
use crate::substrate::{
    BulkSubstrate, ChunkPull, LocalBuffer, PullCallback, RequestHandle, SourceHandle,
    TransferResponse,
};
use crate::window::{PipelineWindow, SlotId};

/// Engine-assigned session identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Init,
    Streaming,
    Finalizing,
    Done,
    Aborted,
}

impl SessionState {
    #[inline]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Aborted)
    }
}

/// Point-in-time copy of a session's counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub state: SessionState,
    pub total_size: u64,
    pub chunk_size: u64,
    pub window_depth: usize,
    pub bytes_received: u64,
    pub next_offset: u64,
    pub chunks_issued: u64,
    pub chunks_total: u64,
    pub in_flight: usize,
    pub resources_held: bool,
}

/// Everything a session acquired from the substrate.
///
/// Dropping the guard gives back whatever it holds, so every exit path
/// releases exactly once no matter where it leaves.
pub(crate) struct SessionResources {
    substrate: Arc<dyn BulkSubstrate>,
    request: RequestHandle,
    source: Option<SourceHandle>,
    buffer: Option<LocalBuffer>,
}

impl SessionResources {
    pub(crate) fn new(substrate: Arc<dyn BulkSubstrate>, request: RequestHandle) -> Self {
        Self {
            substrate,
            request,
            source: None,
            buffer: None,
        }
    }

    pub(crate) fn acquire_source(&mut self, source: SourceHandle) -> Result<(), SubstrateError> {
        self.substrate.acquire_source_ref(source)?;
        self.source = Some(source);
        Ok(())
    }

    pub(crate) fn allocate_buffer(&mut self, len: u64) -> Result<(), SubstrateError> {
        self.buffer = Some(self.substrate.create_local_buffer(len)?);
        Ok(())
    }

    pub(crate) fn buffer(&self) -> Option<&LocalBuffer> {
        self.buffer.as_ref()
    }

    pub(crate) fn respond(&self, response: TransferResponse) -> Result<(), SubstrateError> {
        self.substrate.send_response(self.request, response)
    }
}

impl Drop for SessionResources {
    fn drop(&mut self) {
        if let Some(buffer) = self.buffer.take() {
            self.substrate.destroy_local_buffer(buffer.handle);
        }
        if let Some(source) = self.source.take() {
            self.substrate.release_source_ref(source);
        }
        self.substrate.release_request(self.request);
    }
}

pub(crate) struct SessionInner {
    pub(crate) state: SessionState,
    pub(crate) window: PipelineWindow,
    pub(crate) bytes_received: u64,
    pub(crate) resources: Option<SessionResources>,
}

/// Inputs for [`TransferSession::begin`].
pub(crate) struct SessionParams {
    pub id: SessionId,
    pub request: RequestHandle,
    pub source: SourceHandle,
    pub chunk_size: u64,
    pub window_depth: usize,
    pub empty_transfer: EmptyTransferPolicy,
    pub substrate: Arc<dyn BulkSubstrate>,
    pub sink: Arc<dyn ChunkSink>,
    pub logger: Arc<dyn TransferLogger>,
    pub table: Arc<SessionTable>,
}

pub struct TransferSession {
    id: SessionId,
    source: SourceHandle,
    started: Instant,
    pub(crate) sink: Arc<dyn ChunkSink>,
    substrate: Arc<dyn BulkSubstrate>,
    logger: Arc<dyn TransferLogger>,
    table: Arc<SessionTable>,
    pub(crate) inner: Mutex<SessionInner>,
}

impl TransferSession {
    /// Acquire resources, register with `table`, and prime the window.
    ///
    /// Returns once the first `D` pulls are submitted. An empty transfer
    /// completes (or is rejected) here without issuing anything.
    pub(crate) fn begin(params: SessionParams) -> Result<Arc<Self>, EngineError> {
        let mut resources = SessionResources::new(params.substrate.clone(), params.request);
        if params.window_depth == 0 {
            return Err(EngineError::InvalidWindowDepth);
        }

        let total_size = params
            .substrate
            .remote_size(params.source)
            .map_err(EngineError::RemoteSize)?;
        let plan = ChunkPlan::new(total_size, params.chunk_size)?;

        if plan.is_empty() && params.empty_transfer == EmptyTransferPolicy::Reject {
            return Err(EngineError::EmptyTransfer);
        }
        if !plan.is_empty() {
            resources
                .acquire_source(params.source)
                .map_err(EngineError::SourceAcquire)?;
            resources
                .allocate_buffer(total_size)
                .map_err(EngineError::BufferAllocation)?;
        }

        let window = PipelineWindow::new(plan, params.window_depth);
        let depth = window.depth();
        let session = Arc::new(Self {
            id: params.id,
            source: params.source,
            started: Instant::now(),
            sink: params.sink,
            substrate: params.substrate,
            logger: params.logger,
            table: params.table,
            inner: Mutex::new(SessionInner {
                state: SessionState::Init,
                window,
                bytes_received: 0,
                resources: Some(resources),
            }),
        });
        session.table.register(&session);

        session.log(TransferEvent::SessionStarted {
            total_bytes: plan.total_size(),
            chunk_size: plan.chunk_size(),
            chunks: plan.chunk_count(),
            window: depth,
        });

        let mut inner = session.inner.lock();
        if let Err(failure) = session.prime(&mut inner) {
            session.abort(&mut inner, failure.clone().into());
            // The caller hears about this synchronously and never gets an id.
            session.table.remove(session.id);
            drop(inner);
            return Err(failure.into());
        }
        drop(inner);
        Ok(session)
    }

    fn prime(self: &Arc<Self>, inner: &mut SessionInner) -> Result<(), SubmitFailure> {
        if inner.window.plan().is_empty() {
            inner.state = SessionState::Streaming;
            self.finalize(inner);
            return Ok(());
        }
        for slot in 0..inner.window.depth() {
            self.issue(inner, slot)?;
        }
        inner.state = SessionState::Streaming;
        Ok(())
    }

    /// Hand the next chunk to `slot` and submit its pull.
    ///
    /// Returns `Ok(None)` when nothing is left to issue.
    pub(crate) fn issue(
        self: &Arc<Self>,
        inner: &mut SessionInner,
        slot: SlotId,
    ) -> Result<Option<ChunkDescriptor>, SubmitFailure> {
        let Some(chunk) = inner.window.assign(slot) else {
            return Ok(None);
        };
        let Some(buffer) = inner.resources.as_ref().and_then(|r| r.buffer()) else {
            inner.window.cancel(slot);
            return Err(SubmitFailure {
                offset: chunk.offset,
                source: SubstrateError::Other("staging buffer already released".into()),
            });
        };
        let pull = ChunkPull {
            source: self.source,
            source_offset: chunk.offset,
            buffer: buffer.handle,
            local_offset: chunk.offset,
            length: chunk.length,
        };

        let session = Arc::clone(self);
        let on_complete: PullCallback = Box::new(move |pull_id, result| {
            dispatcher::on_pull_complete(&session, slot, chunk, pull_id, result);
        });

        match self.substrate.begin_chunk_pull(pull, on_complete) {
            Ok(_) => {
                self.log(TransferEvent::ChunkIssued {
                    slot,
                    offset: chunk.offset,
                    length: chunk.length,
                });
                Ok(Some(chunk))
            }
            Err(source) => {
                inner.window.cancel(slot);
                Err(SubmitFailure {
                    offset: chunk.offset,
                    source,
                })
            }
        }
    }

    /// Send the response and release everything. Runs at most once.
    pub(crate) fn finalize(&self, inner: &mut SessionInner) {
        if inner.state != SessionState::Streaming {
            return;
        }
        inner.state = SessionState::Finalizing;

        let Some(resources) = inner.resources.take() else {
            inner.state = SessionState::Aborted;
            return;
        };
        let sha256 = match resources.buffer() {
            Some(buffer) => buffer.memory.with_all(sha256_hex),
            None => sha256_hex(&[]),
        };
        let response = TransferResponse {
            session_id: self.id,
            total_bytes: inner.bytes_received,
            chunks: inner.window.chunks_issued(),
            sha256,
        };

        match resources.respond(response.clone()) {
            Ok(()) => {
                inner.state = SessionState::Done;
                drop(resources);
                self.table.finish(self.id, SessionStatus::Completed(response));
                self.log(TransferEvent::SessionFinalized {
                    total_bytes: inner.bytes_received,
                    duration_ms: self.started.elapsed().as_millis() as u64,
                });
            }
            Err(e) => {
                // Nothing is in flight once the total is reached.
                inner.state = SessionState::Aborted;
                drop(resources);
                let reason = AbortReason::Respond(e);
                self.log(TransferEvent::SessionAborted {
                    reason: reason.to_string(),
                    in_flight: 0,
                });
                self.table.finish(self.id, SessionStatus::Aborted(reason));
            }
        }
    }

    /// Move to `Aborted`. Resources go back once the last outstanding pull
    /// has drained; later completions are discarded.
    pub(crate) fn abort(&self, inner: &mut SessionInner, reason: AbortReason) {
        if inner.state.is_terminal() {
            return;
        }
        inner.state = SessionState::Aborted;
        self.log(TransferEvent::SessionAborted {
            reason: reason.to_string(),
            in_flight: inner.window.in_flight(),
        });
        self.table.finish(self.id, SessionStatus::Aborted(reason));
        self.release_if_drained(inner);
    }

    pub(crate) fn release_if_drained(&self, inner: &mut SessionInner) {
        if inner.state == SessionState::Aborted && inner.window.is_drained() {
            inner.resources.take();
        }
    }

    pub(crate) fn log(&self, event: TransferEvent) {
        self.logger.log(TransferLog {
            component: "session",
            session_id: self.id,
            event,
        });
    }

    #[inline]
    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.inner.lock().state
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let inner = self.inner.lock();
        let plan = inner.window.plan();
        SessionSnapshot {
            state: inner.state,
            total_size: plan.total_size(),
            chunk_size: plan.chunk_size(),
            window_depth: inner.window.depth(),
            bytes_received: inner.bytes_received,
            next_offset: inner.window.next_offset(),
            chunks_issued: inner.window.chunks_issued(),
            chunks_total: plan.chunk_count(),
            in_flight: inner.window.in_flight(),
            resources_held: inner.resources.is_some(),
        }
    }
}

impl fmt::Debug for TransferSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransferSession")
            .field("id", &self.id)
            .field("source", &self.source)
            .finish_non_exhaustive()
    }
}
