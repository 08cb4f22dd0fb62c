#![allow(dead_code)]

use std::sync::Arc;

use parking_lot::Mutex;

use haven_bulk::{
    BulkEngine, ChunkDescriptor, ChunkSink, EngineConfig, LoopbackSubstrate, NullLogger,
    SessionId, SinkError,
};

/// Records every chunk handed to the sink.
#[derive(Default)]
pub struct RecordingSink {
    pub chunks: Mutex<Vec<ChunkDescriptor>>,
}

impl RecordingSink {
    pub fn recorded(&self) -> Vec<ChunkDescriptor> {
        self.chunks.lock().clone()
    }

    pub fn total_bytes(&self) -> u64 {
        self.chunks.lock().iter().map(|c| c.length).sum()
    }
}

impl ChunkSink for RecordingSink {
    fn materialize(
        &self,
        _: SessionId,
        chunk: ChunkDescriptor,
        bytes: &[u8],
    ) -> Result<(), SinkError> {
        assert_eq!(bytes.len() as u64, chunk.length);
        self.chunks.lock().push(chunk);
        Ok(())
    }
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("haven_bulk=debug")
        .with_test_writer()
        .try_init();
}

pub struct Harness {
    pub loopback: Arc<LoopbackSubstrate>,
    pub engine: BulkEngine,
    pub sink: Arc<RecordingSink>,
}

pub fn harness(config: EngineConfig) -> Harness {
    init_tracing();
    let loopback = Arc::new(LoopbackSubstrate::new());
    let sink = Arc::new(RecordingSink::default());
    let engine = BulkEngine::new(loopback.clone(), config)
        .with_sink(sink.clone())
        .with_logger(Arc::new(NullLogger));
    Harness {
        loopback,
        engine,
        sink,
    }
}

/// Offsets of the pulls currently queued, in submission order.
pub fn pending_offsets(loopback: &LoopbackSubstrate) -> Vec<u64> {
    loopback
        .pending_pulls()
        .iter()
        .map(|(_, p)| p.source_offset)
        .collect()
}

/// Deliver the queued pull at `offset`. Panics if none is queued there.
pub fn complete_at(loopback: &LoopbackSubstrate, offset: u64) {
    let (id, _) = loopback
        .pending_pulls()
        .into_iter()
        .find(|(_, p)| p.source_offset == offset)
        .unwrap_or_else(|| panic!("no pending pull at offset {}", offset));
    assert!(loopback.trigger_pull(id));
}

/// Assert the chunks tile `[0, total)` exactly.
pub fn assert_partition(chunks: &[ChunkDescriptor], total: u64) {
    let mut sorted = chunks.to_vec();
    sorted.sort_by_key(|c| c.offset);
    let mut expected = 0;
    for c in &sorted {
        assert_eq!(c.offset, expected, "gap or overlap at {}", expected);
        assert!(c.length > 0);
        assert!(c.end() <= total);
        expected = c.end();
    }
    assert_eq!(expected, total);
}
