/// Sliding window of outstanding chunk pulls.
///
/// The window owns `D` slots. Each slot holds at most one in-flight chunk.
/// When a slot's pull completes the slot is handed the next unissued chunk,
/// so up to `D` pulls overlap until the schedule runs dry.

use crate::planner::{ChunkDescriptor, ChunkPlan};

/// Index of a slot within the window.
pub type SlotId = usize;

#[derive(Debug)]
pub struct PipelineWindow {
    plan: ChunkPlan,
    slots: Vec<Option<ChunkDescriptor>>,
    next_offset: u64,
    chunks_issued: u64,
    in_flight: usize,
}

impl PipelineWindow {
    /// Create a window for `plan` with at most `max_depth` slots.
    pub fn new(plan: ChunkPlan, max_depth: usize) -> Self {
        let depth = plan.window_depth(max_depth);
        Self {
            plan,
            slots: vec![None; depth],
            next_offset: 0,
            chunks_issued: 0,
            in_flight: 0,
        }
    }

    #[inline]
    pub fn plan(&self) -> &ChunkPlan {
        &self.plan
    }

    #[inline]
    pub fn depth(&self) -> usize {
        self.slots.len()
    }

    #[inline]
    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    #[inline]
    pub fn next_offset(&self) -> u64 {
        self.next_offset
    }

    #[inline]
    pub fn chunks_issued(&self) -> u64 {
        self.chunks_issued
    }

    /// True while some chunk has not been handed to a slot yet.
    #[inline]
    pub fn has_unissued(&self) -> bool {
        self.next_offset < self.plan.total_size()
    }

    /// True when no pull is outstanding.
    #[inline]
    pub fn is_drained(&self) -> bool {
        self.in_flight == 0
    }

    /// Chunk currently held by `slot`.
    pub fn slot(&self, slot: SlotId) -> Option<ChunkDescriptor> {
        self.slots.get(slot).copied().flatten()
    }

    /// Hand the next unissued chunk to an idle `slot`.
    ///
    /// Returns `None` when the slot is busy, out of range, or nothing is left
    /// to issue; in the last case the slot stays idle for good.
    pub fn assign(&mut self, slot: SlotId) -> Option<ChunkDescriptor> {
        let entry = self.slots.get_mut(slot)?;
        if entry.is_some() {
            return None;
        }
        let chunk = self.plan.descriptor_at(self.next_offset)?;
        *entry = Some(chunk);
        // The tail is the only short chunk and is always issued last, so the
        // delivered length equals the nominal stride everywhere it matters.
        self.next_offset = chunk.end();
        self.chunks_issued += 1;
        self.in_flight += 1;
        Some(chunk)
    }

    /// Release `slot` after its pull completed. Returns the chunk it held.
    pub fn complete(&mut self, slot: SlotId) -> Option<ChunkDescriptor> {
        let chunk = self.slots.get_mut(slot)?.take()?;
        self.in_flight -= 1;
        Some(chunk)
    }

    /// Release `slot` after its pull could not be submitted. No completion
    /// will ever arrive for it, so it no longer counts as in flight.
    pub fn cancel(&mut self, slot: SlotId) -> Option<ChunkDescriptor> {
        self.complete(slot)
    }
}
