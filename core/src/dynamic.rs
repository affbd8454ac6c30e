//! `DynamicBuffer` / `DynamicTexture` (USAGE_DYNAMIC) and `StagingResource`
//! (USAGE_STAGING) -- the two resource wrappers layered on top of
//! `Resource` that add sequence-id-gated recycling.

use std::collections::VecDeque;

use crate::allocation::Allocation;
use crate::handle::SequenceId;

/// A retired allocation waiting to become safe to reuse.
struct Retired {
    alloc: Allocation,
    /// The allocation may be recycled once `coherent_seq_id` reaches this.
    safe_at_seq_id: SequenceId,
}

/// Wraps a resource whose `Allocation` is expected to be replaced
/// frequently. Keeps a FIFO of retired allocations gated by sequence id,
/// plus an "owned by command list" bit that defers recycling until the
/// chunk that captured the allocation has completed.
pub struct DynamicPool {
    retired: VecDeque<Retired>,
    /// Set whenever the most recently renamed-out allocation was captured
    /// by a still-live command chunk; cleared once that chunk retires.
    owned_by_command_list: bool,
}

impl DynamicPool {
    pub fn new() -> DynamicPool {
        DynamicPool {
            retired: VecDeque::new(),
            owned_by_command_list: false,
        }
    }

    pub fn retire(&mut self, alloc: Allocation, safe_at_seq_id: SequenceId, captured_by_chunk: bool) {
        self.owned_by_command_list = captured_by_chunk;
        self.retired.push_back(Retired { alloc, safe_at_seq_id });
    }

    /// Pops the oldest retired allocation that is safe to reuse as of
    /// `coherent_seq_id`, or `None` if the pool is empty or everything is
    /// still in flight (the caller should fall back to a fresh allocation).
    pub fn try_acquire(&mut self, coherent_seq_id: SequenceId) -> Option<Allocation> {
        match self.retired.front() {
            Some(r) if r.safe_at_seq_id <= coherent_seq_id => {
                self.retired.pop_front().map(|r| r.alloc)
            }
            _ => None,
        }
    }

    pub fn is_owned_by_command_list(&self) -> bool {
        self.owned_by_command_list
    }

    pub fn clear_owned_by_command_list(&mut self) {
        self.owned_by_command_list = false;
    }

    pub fn pending_count(&self) -> usize {
        self.retired.len()
    }
}

impl Default for DynamicPool {
    fn default() -> Self {
        DynamicPool::new()
    }
}

/// Result of a `Map` attempt on a `StagingResource`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MapOutcome {
    /// Already coherent; mapping can proceed immediately.
    Mapped,
    /// A fresh allocation can be renamed in to serve a WRITE_DISCARD map.
    Renamable,
    /// A resource not currently touched by any in-flight chunk; CPU access
    /// is safe without waiting.
    Mappable,
    /// DO_NOT_WAIT was set and the resource is not yet ready; the caller
    /// must surface `DXGI_ERROR_WAS_STILL_DRAWING`.
    WouldBlockForSequences(u64),
}

/// CPU-accessible buffer or linear-texture backing for the STAGING path.
/// Tracks the two high-water marks that decide
/// whether a `Map` can proceed without waiting.
#[derive(Debug, Default)]
pub struct StagingResource {
    /// Reads become valid once the GPU has finished writes up to this
    /// sequence id.
    pub cpu_coherent_after_finished_seq_id: SequenceId,
    /// Writes must wait until the GPU has released its last read up to
    /// this sequence id.
    pub gpu_occupied_until_finished_seq_id: SequenceId,
}

impl StagingResource {
    pub fn new() -> StagingResource {
        StagingResource::default()
    }

    /// `coherent_seq_id` is the queue's current `coherent_seq_id` (highest
    /// completed sequence). `do_not_wait` corresponds to
    /// `D3D11_MAP_FLAG_DO_NOT_WAIT`.
    pub fn try_map_read(&self, coherent_seq_id: SequenceId, do_not_wait: bool) -> MapOutcome {
        if coherent_seq_id >= self.cpu_coherent_after_finished_seq_id {
            return MapOutcome::Mapped;
        }
        if do_not_wait {
            let remaining = self.cpu_coherent_after_finished_seq_id.0.saturating_sub(coherent_seq_id.0);
            MapOutcome::WouldBlockForSequences(remaining)
        } else {
            // The caller is expected to wait on the shared event for
            // `cpu_coherent_after_finished_seq_id` and retry; never
            // surfaced to the application.
            MapOutcome::Mappable
        }
    }

    pub fn try_map_write_discard(&self, coherent_seq_id: SequenceId, do_not_wait: bool) -> MapOutcome {
        if coherent_seq_id >= self.gpu_occupied_until_finished_seq_id {
            return MapOutcome::Renamable;
        }
        if do_not_wait {
            let remaining = self.gpu_occupied_until_finished_seq_id.0.saturating_sub(coherent_seq_id.0);
            MapOutcome::WouldBlockForSequences(remaining)
        } else {
            MapOutcome::Mappable
        }
    }

    pub fn mark_written_by(&mut self, seq_id: SequenceId) {
        self.cpu_coherent_after_finished_seq_id = seq_id;
    }

    pub fn mark_read_by(&mut self, seq_id: SequenceId) {
        self.gpu_occupied_until_finished_seq_id = seq_id;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocation::{AllocationFlags, BufferAllocation};
    use std::sync::Arc;

    fn dummy_alloc() -> Allocation {
        Allocation::Buffer(Arc::new(BufferAllocation {
            size: 256,
            flags: AllocationFlags::SHARED,
            cpu_ptr: None,
            debug_label: None,
            creation_frame: 0,
        }))
    }

    #[test]
    fn retired_allocation_is_not_acquirable_before_its_sequence_completes() {
        let mut pool = DynamicPool::new();
        pool.retire(dummy_alloc(), SequenceId(10), false);
        assert!(pool.try_acquire(SequenceId(9)).is_none());
        assert!(pool.try_acquire(SequenceId(10)).is_some());
    }

    #[test]
    fn fifo_order_is_preserved() {
        let mut pool = DynamicPool::new();
        pool.retire(dummy_alloc(), SequenceId(1), false);
        pool.retire(dummy_alloc(), SequenceId(2), false);
        assert_eq!(pool.pending_count(), 2);
        pool.try_acquire(SequenceId(5));
        assert_eq!(pool.pending_count(), 1);
    }

    #[test]
    fn staging_map_would_block_reports_remaining_sequence_count() {
        let mut staging = StagingResource::new();
        staging.mark_written_by(SequenceId(10));
        match staging.try_map_read(SequenceId(7), true) {
            MapOutcome::WouldBlockForSequences(n) => assert_eq!(n, 3),
            other => panic!("expected WouldBlockForSequences, got {:?}", other),
        }
        assert_eq!(staging.try_map_read(SequenceId(10), true), MapOutcome::Mapped);
    }
}
