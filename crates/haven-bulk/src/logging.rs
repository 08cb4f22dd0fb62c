/// Structured transfer logging.
///
/// Sessions report lifecycle and per-chunk events through a
/// [`TransferLogger`], so embedders can route them to tracing, a remote
/// collector, or nowhere.

use std::fmt;

use crate::session::SessionId;

/// Structured log entry for one session.
#[derive(Debug, Clone)]
pub struct TransferLog {
    pub component: &'static str,
    pub session_id: SessionId,
    pub event: TransferEvent,
}

/// Events a session can emit.
#[derive(Debug, Clone, PartialEq)]
pub enum TransferEvent {
    /// Resources acquired and window sized
    SessionStarted {
        total_bytes: u64,
        chunk_size: u64,
        chunks: u64,
        window: usize,
    },
    /// Pull submitted for a slot
    ChunkIssued {
        slot: usize,
        offset: u64,
        length: u64,
    },
    /// Chunk arrived and passed the sink
    ChunkMaterialized {
        slot: usize,
        offset: u64,
        length: u64,
        bytes_received: u64,
    },
    /// Slot has nothing left to pull
    SlotIdle {
        slot: usize,
    },
    /// Response sent, resources released
    SessionFinalized {
        total_bytes: u64,
        duration_ms: u64,
    },
    /// Session gave up
    SessionAborted {
        reason: String,
        in_flight: usize,
    },
    /// Completion drained after the session became terminal
    CompletionDiscarded {
        slot: usize,
        offset: u64,
    },
}

impl fmt::Display for TransferEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SessionStarted { total_bytes, chunk_size, chunks, window } => {
                write!(f, "session_started bytes={} chunk_size={} chunks={} window={}", total_bytes, chunk_size, chunks, window)
            }
            Self::ChunkIssued { slot, offset, length } => {
                write!(f, "chunk_issued slot={} offset={} len={}", slot, offset, length)
            }
            Self::ChunkMaterialized { slot, offset, length, bytes_received } => {
                write!(f, "chunk_materialized slot={} offset={} len={} received={}", slot, offset, length, bytes_received)
            }
            Self::SlotIdle { slot } => {
                write!(f, "slot_idle slot={}", slot)
            }
            Self::SessionFinalized { total_bytes, duration_ms } => {
                write!(f, "session_finalized bytes={} duration_ms={}", total_bytes, duration_ms)
            }
            Self::SessionAborted { reason, in_flight } => {
                write!(f, "session_aborted in_flight={}: {}", in_flight, reason)
            }
            Self::CompletionDiscarded { slot, offset } => {
                write!(f, "completion_discarded slot={} offset={}", slot, offset)
            }
        }
    }
}

/// Sink for transfer log entries.
pub trait TransferLogger: Send + Sync {
    fn log(&self, entry: TransferLog);
}

/// Logger that uses the `tracing` crate.
pub struct TracingLogger;

impl TransferLogger for TracingLogger {
    fn log(&self, entry: TransferLog) {
        match &entry.event {
            TransferEvent::SessionStarted { .. } | TransferEvent::SessionFinalized { .. } => {
                tracing::info!(
                    component = entry.component,
                    session = %entry.session_id,
                    "{}",
                    entry.event,
                );
            }
            TransferEvent::SessionAborted { .. } => {
                tracing::warn!(
                    component = entry.component,
                    session = %entry.session_id,
                    "{}",
                    entry.event,
                );
            }
            _ => {
                tracing::debug!(
                    component = entry.component,
                    session = %entry.session_id,
                    "{}",
                    entry.event,
                );
            }
        }
    }
}

/// No-op logger that discards all log entries.
pub struct NullLogger;

impl TransferLogger for NullLogger {
    fn log(&self, _entry: TransferLog) {}
}
