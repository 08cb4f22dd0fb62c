/// In-process substrate: remote regions and local buffers live in the same
/// address space, and pulls are plain copies run by a progress loop.
///
/// ```text
/// begin_chunk_pull ──> [pending queue] ──trigger()──> copy ──> on_complete
///                                          ^
///                          progress thread (or manual trigger calls)
/// ```
///
/// Completions never run inside `begin_chunk_pull`. Fault hooks let tests
/// fail allocation, reference acquisition, submission, or completion at a
/// chosen chunk offset.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use bytes::Bytes;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded, unbounded};
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::error::SubstrateError;
use crate::substrate::{
    BufferHandle, BulkSubstrate, ChunkPull, LocalBuffer, PullCallback, PullId, RequestHandle,
    SourceHandle, StagingMemory, TransferResponse, checked_range,
};

/// How long the progress thread sleeps waiting for new pulls.
pub const PROGRESS_TIMEOUT_MS: u64 = 100;

struct RemoteRegion {
    data: Bytes,
    refs: u32,
}

struct PendingPull {
    id: PullId,
    pull: ChunkPull,
    on_complete: PullCallback,
}

#[derive(Default)]
struct LoopbackState {
    sources: HashMap<SourceHandle, RemoteRegion>,
    buffers: HashMap<BufferHandle, Arc<StagingMemory>>,
    requests: HashSet<RequestHandle>,
    pending: VecDeque<PendingPull>,
}

#[derive(Default)]
struct Faults {
    submission: HashSet<u64>,
    completion: HashSet<u64>,
    allocation: bool,
    acquire: bool,
}

#[derive(Default)]
struct Counters {
    pulls_submitted: AtomicU64,
    pulls_completed: AtomicU64,
    buffers_created: AtomicU64,
    buffers_destroyed: AtomicU64,
    source_acquires: AtomicU64,
    source_releases: AtomicU64,
    responses_sent: AtomicU64,
    requests_released: AtomicU64,
}

/// Snapshot of loopback counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LoopbackStats {
    pub pulls_submitted: u64,
    pub pulls_completed: u64,
    pub buffers_created: u64,
    pub buffers_destroyed: u64,
    pub source_acquires: u64,
    pub source_releases: u64,
    pub responses_sent: u64,
    pub requests_released: u64,
}

pub struct LoopbackSubstrate {
    state: Mutex<LoopbackState>,
    faults: Mutex<Faults>,
    counters: Counters,
    next_handle: AtomicU64,
    wake_tx: Sender<()>,
    wake_rx: Receiver<()>,
    response_tx: Sender<(RequestHandle, TransferResponse)>,
    response_rx: Receiver<(RequestHandle, TransferResponse)>,
    shutdown: AtomicBool,
}

impl Default for LoopbackSubstrate {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackSubstrate {
    pub fn new() -> Self {
        let (wake_tx, wake_rx) = bounded(1);
        let (response_tx, response_rx) = unbounded();
        Self {
            state: Mutex::new(LoopbackState::default()),
            faults: Mutex::new(Faults::default()),
            counters: Counters::default(),
            next_handle: AtomicU64::new(1),
            wake_tx,
            wake_rx,
            response_tx,
            response_rx,
            shutdown: AtomicBool::new(false),
        }
    }

    fn next_handle(&self) -> u64 {
        self.next_handle.fetch_add(1, Ordering::Relaxed)
    }

    /// Expose `data` as a remote region.
    pub fn expose(&self, data: impl Into<Bytes>) -> SourceHandle {
        let handle = SourceHandle(self.next_handle());
        self.state.lock().sources.insert(
            handle,
            RemoteRegion {
                data: data.into(),
                refs: 0,
            },
        );
        handle
    }

    /// Register a new inbound request.
    pub fn new_request(&self) -> RequestHandle {
        let handle = RequestHandle(self.next_handle());
        self.state.lock().requests.insert(handle);
        handle
    }

    /// Responses in the order they were sent.
    pub fn responses(&self) -> Receiver<(RequestHandle, TransferResponse)> {
        self.response_rx.clone()
    }

    /// References the engine still holds on `source`.
    pub fn source_refs(&self, source: SourceHandle) -> Option<u32> {
        self.state.lock().sources.get(&source).map(|r| r.refs)
    }

    pub fn live_buffers(&self) -> usize {
        self.state.lock().buffers.len()
    }

    pub fn is_request_live(&self, request: RequestHandle) -> bool {
        self.state.lock().requests.contains(&request)
    }

    pub fn pending_pulls(&self) -> Vec<(PullId, ChunkPull)> {
        self.state
            .lock()
            .pending
            .iter()
            .map(|p| (p.id, p.pull))
            .collect()
    }

    pub fn stats(&self) -> LoopbackStats {
        let c = &self.counters;
        LoopbackStats {
            pulls_submitted: c.pulls_submitted.load(Ordering::Relaxed),
            pulls_completed: c.pulls_completed.load(Ordering::Relaxed),
            buffers_created: c.buffers_created.load(Ordering::Relaxed),
            buffers_destroyed: c.buffers_destroyed.load(Ordering::Relaxed),
            source_acquires: c.source_acquires.load(Ordering::Relaxed),
            source_releases: c.source_releases.load(Ordering::Relaxed),
            responses_sent: c.responses_sent.load(Ordering::Relaxed),
            requests_released: c.requests_released.load(Ordering::Relaxed),
        }
    }

    /// Refuse to submit any pull whose source offset is `offset`.
    pub fn fail_submission_at(&self, offset: u64) {
        self.faults.lock().submission.insert(offset);
    }

    /// Accept pulls at `offset` but complete them with an error.
    pub fn fail_completion_at(&self, offset: u64) {
        self.faults.lock().completion.insert(offset);
    }

    pub fn fail_buffer_allocation(&self) {
        self.faults.lock().allocation = true;
    }

    pub fn fail_source_acquire(&self) {
        self.faults.lock().acquire = true;
    }

    pub fn clear_faults(&self) {
        *self.faults.lock() = Faults::default();
    }

    /// Run up to `max` queued completions in submission order. Returns how
    /// many ran.
    pub fn trigger(&self, max: usize) -> usize {
        let mut count = 0;
        while count < max {
            let Some(pending) = self.state.lock().pending.pop_front() else {
                break;
            };
            self.execute(pending);
            count += 1;
        }
        count
    }

    /// Run the completion of one specific pull, out of order.
    pub fn trigger_pull(&self, id: PullId) -> bool {
        let pending = {
            let mut state = self.state.lock();
            let Some(pos) = state.pending.iter().position(|p| p.id == id) else {
                return false;
            };
            state.pending.remove(pos)
        };
        match pending {
            Some(p) => {
                self.execute(p);
                true
            }
            None => false,
        }
    }

    /// Run completions until the queue stays empty.
    pub fn drain(&self) -> usize {
        let mut total = 0;
        loop {
            let n = self.trigger(usize::MAX);
            if n == 0 {
                return total;
            }
            total += n;
        }
    }

    /// Start a thread that triggers completions as pulls arrive.
    pub fn spawn_progress_thread(self: &Arc<Self>) -> ProgressThread {
        let stop = Arc::new(AtomicBool::new(false));
        let substrate = Arc::clone(self);
        let stop_flag = stop.clone();
        let handle = std::thread::spawn(move || {
            debug!("loopback progress thread started");
            while !stop_flag.load(Ordering::Relaxed) {
                if substrate.trigger(usize::MAX) > 0 {
                    continue;
                }
                match substrate
                    .wake_rx
                    .recv_timeout(Duration::from_millis(PROGRESS_TIMEOUT_MS))
                {
                    Ok(()) | Err(RecvTimeoutError::Timeout) => {}
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            }
            debug!("loopback progress thread stopped");
        });
        ProgressThread {
            stop,
            handle: Some(handle),
        }
    }

    /// Refuse all further submissions.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }

    fn execute(&self, pending: PendingPull) {
        let result = self.copy_chunk(&pending.pull);
        trace!(pull = %pending.id, offset = pending.pull.source_offset, ok = result.is_ok(), "pull complete");
        self.counters.pulls_completed.fetch_add(1, Ordering::Relaxed);
        (pending.on_complete)(pending.id, result);
    }

    fn copy_chunk(&self, pull: &ChunkPull) -> Result<(), SubstrateError> {
        if self.faults.lock().completion.contains(&pull.source_offset) {
            return Err(SubstrateError::Pull {
                offset: pull.source_offset,
                reason: "injected completion failure".into(),
            });
        }
        let (data, memory) = {
            let state = self.state.lock();
            let region = state
                .sources
                .get(&pull.source)
                .ok_or(SubstrateError::UnknownSource(pull.source.0))?;
            let memory = state
                .buffers
                .get(&pull.buffer)
                .cloned()
                .ok_or(SubstrateError::UnknownBuffer(pull.buffer.0))?;
            let range = checked_range(pull.source_offset, pull.length, region.data.len() as u64)?;
            (region.data.slice(range), memory)
        };
        memory.write_at(pull.local_offset, &data)
    }
}

impl BulkSubstrate for LoopbackSubstrate {
    fn remote_size(&self, source: SourceHandle) -> Result<u64, SubstrateError> {
        self.state
            .lock()
            .sources
            .get(&source)
            .map(|r| r.data.len() as u64)
            .ok_or(SubstrateError::UnknownSource(source.0))
    }

    fn begin_chunk_pull(
        &self,
        pull: ChunkPull,
        on_complete: PullCallback,
    ) -> Result<PullId, SubstrateError> {
        if self.shutdown.load(Ordering::Relaxed) {
            return Err(SubstrateError::Shutdown);
        }
        if self.faults.lock().submission.contains(&pull.source_offset) {
            return Err(SubstrateError::Pull {
                offset: pull.source_offset,
                reason: "injected submission failure".into(),
            });
        }
        let id = PullId(self.next_handle());
        {
            let mut state = self.state.lock();
            if !state.sources.contains_key(&pull.source) {
                return Err(SubstrateError::UnknownSource(pull.source.0));
            }
            if !state.buffers.contains_key(&pull.buffer) {
                return Err(SubstrateError::UnknownBuffer(pull.buffer.0));
            }
            state.pending.push_back(PendingPull {
                id,
                pull,
                on_complete,
            });
        }
        self.counters.pulls_submitted.fetch_add(1, Ordering::Relaxed);
        let _ = self.wake_tx.try_send(());
        Ok(id)
    }

    fn create_local_buffer(&self, len: u64) -> Result<LocalBuffer, SubstrateError> {
        if self.faults.lock().allocation {
            return Err(SubstrateError::Allocation(len));
        }
        let memory = Arc::new(StagingMemory::zeroed(len)?);
        let handle = BufferHandle(self.next_handle());
        self.state.lock().buffers.insert(handle, memory.clone());
        self.counters.buffers_created.fetch_add(1, Ordering::Relaxed);
        Ok(LocalBuffer { handle, memory })
    }

    fn destroy_local_buffer(&self, handle: BufferHandle) {
        if self.state.lock().buffers.remove(&handle).is_some() {
            self.counters.buffers_destroyed.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn acquire_source_ref(&self, source: SourceHandle) -> Result<(), SubstrateError> {
        if self.faults.lock().acquire {
            return Err(SubstrateError::Other("injected source acquire failure".into()));
        }
        let mut state = self.state.lock();
        let region = state
            .sources
            .get_mut(&source)
            .ok_or(SubstrateError::UnknownSource(source.0))?;
        region.refs += 1;
        self.counters.source_acquires.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn release_source_ref(&self, source: SourceHandle) {
        if let Some(region) = self.state.lock().sources.get_mut(&source) {
            region.refs = region.refs.saturating_sub(1);
            self.counters.source_releases.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn send_response(
        &self,
        request: RequestHandle,
        response: TransferResponse,
    ) -> Result<(), SubstrateError> {
        if !self.state.lock().requests.contains(&request) {
            return Err(SubstrateError::UnknownRequest(request.0));
        }
        self.counters.responses_sent.fetch_add(1, Ordering::Relaxed);
        self.response_tx
            .send((request, response))
            .map_err(|_| SubstrateError::Shutdown)
    }

    fn release_request(&self, request: RequestHandle) {
        if self.state.lock().requests.remove(&request) {
            self.counters.requests_released.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Handle to a running progress thread. Stops and joins on drop.
pub struct ProgressThread {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl ProgressThread {
    pub fn stop(mut self) {
        self.join();
    }

    fn join(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for ProgressThread {
    fn drop(&mut self) {
        self.join();
    }
}
