/// Engine entry point and session outcome table.
///
/// `begin_transfer` is the only call the request-handling layer makes. It
/// returns as soon as the session has primed its window; the response goes
/// out later from whichever completion delivers the last byte.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::config::EngineConfig;
use crate::error::{AbortReason, EngineError};
use crate::logging::{TracingLogger, TransferLogger};
use crate::session::{SessionId, SessionParams, SessionSnapshot, TransferSession};
use crate::sink::{ChunkSink, NullSink};
use crate::substrate::{BulkSubstrate, RequestHandle, SourceHandle, TransferResponse};

/// Where a session stands, as seen from outside.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionStatus {
    Active,
    Completed(TransferResponse),
    Aborted(AbortReason),
}

impl SessionStatus {
    #[inline]
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Active)
    }
}

struct TableEntry {
    session: Weak<TransferSession>,
    status: SessionStatus,
}

/// Session id -> status, sized on demand. Terminal entries stay until a
/// caller takes them.
#[derive(Default)]
pub struct SessionTable {
    entries: Mutex<HashMap<SessionId, TableEntry>>,
}

impl SessionTable {
    pub(crate) fn register(&self, session: &Arc<TransferSession>) {
        self.entries.lock().insert(
            session.id(),
            TableEntry {
                session: Arc::downgrade(session),
                status: SessionStatus::Active,
            },
        );
    }

    pub(crate) fn finish(&self, id: SessionId, status: SessionStatus) {
        if let Some(entry) = self.entries.lock().get_mut(&id) {
            entry.status = status;
        }
    }

    pub(crate) fn remove(&self, id: SessionId) {
        self.entries.lock().remove(&id);
    }

    pub fn status(&self, id: SessionId) -> Option<SessionStatus> {
        self.entries.lock().get(&id).map(|e| e.status.clone())
    }

    /// Remove and return a terminal status. Active sessions stay put.
    pub fn take_outcome(&self, id: SessionId) -> Option<SessionStatus> {
        let mut entries = self.entries.lock();
        if !entries.get(&id)?.status.is_terminal() {
            return None;
        }
        entries.remove(&id).map(|e| e.status)
    }

    pub fn active_sessions(&self) -> usize {
        self.entries
            .lock()
            .values()
            .filter(|e| !e.status.is_terminal())
            .count()
    }

    fn session(&self, id: SessionId) -> Option<Arc<TransferSession>> {
        self.entries.lock().get(&id)?.session.upgrade()
    }
}

pub struct BulkEngine {
    substrate: Arc<dyn BulkSubstrate>,
    config: EngineConfig,
    sink: Arc<dyn ChunkSink>,
    logger: Arc<dyn TransferLogger>,
    table: Arc<SessionTable>,
    next_id: AtomicU64,
}

impl BulkEngine {
    pub fn new(substrate: Arc<dyn BulkSubstrate>, config: EngineConfig) -> Self {
        Self {
            substrate,
            config,
            sink: Arc::new(NullSink),
            logger: Arc::new(TracingLogger),
            table: Arc::new(SessionTable::default()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Default hook for transfers started without their own sink.
    pub fn with_sink(mut self, sink: Arc<dyn ChunkSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn with_logger(mut self, logger: Arc<dyn TransferLogger>) -> Self {
        self.logger = logger;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Start pulling `source` into a fresh staging buffer for `request`.
    ///
    /// Non-blocking. A `chunk_size` of zero selects the configured default;
    /// `window_depth` is capped by `max_window_depth`. On error, whatever was
    /// acquired (including `request`) has already been released.
    pub fn begin_transfer(
        &self,
        request: RequestHandle,
        source: SourceHandle,
        chunk_size: u64,
        window_depth: usize,
    ) -> Result<SessionId, EngineError> {
        self.begin_transfer_with_sink(request, source, chunk_size, window_depth, self.sink.clone())
    }

    /// Like [`begin_transfer`](Self::begin_transfer) with a per-transfer hook.
    pub fn begin_transfer_with_sink(
        &self,
        request: RequestHandle,
        source: SourceHandle,
        chunk_size: u64,
        window_depth: usize,
        sink: Arc<dyn ChunkSink>,
    ) -> Result<SessionId, EngineError> {
        let id = SessionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let chunk_size = if chunk_size == 0 {
            self.config.default_chunk_size
        } else {
            chunk_size
        };
        let window_depth = window_depth.min(self.config.max_window_depth);

        debug!(
            session = %id,
            request = %request,
            source = %source,
            chunk_size,
            window_depth,
            "begin transfer"
        );

        let params = SessionParams {
            id,
            request,
            source,
            chunk_size,
            window_depth,
            empty_transfer: self.config.empty_transfer,
            substrate: self.substrate.clone(),
            sink,
            logger: self.logger.clone(),
            table: self.table.clone(),
        };
        match TransferSession::begin(params) {
            Ok(session) => Ok(session.id()),
            Err(e) => {
                warn!(session = %id, request = %request, "transfer not started: {}", e);
                Err(e)
            }
        }
    }

    pub fn status(&self, id: SessionId) -> Option<SessionStatus> {
        self.table.status(id)
    }

    /// Remove and return the outcome of a finished session.
    pub fn take_outcome(&self, id: SessionId) -> Option<SessionStatus> {
        self.table.take_outcome(id)
    }

    pub fn active_sessions(&self) -> usize {
        self.table.active_sessions()
    }

    /// Counters of a session that is still alive (pulls outstanding or not
    /// yet dropped).
    pub fn snapshot(&self, id: SessionId) -> Option<SessionSnapshot> {
        self.table.session(id).map(|s| s.snapshot())
    }
}
