//! `CommandQueue`: owns the backend queue object, the sequence-id
//! counters, the shared event used to signal chunk completion, the
//! UAV-append/consume `CounterPool`, the staging ring allocator, and the
//! ring of live chunks.
//!
//! `Timeline` generalizes a `VecDeque<SyncPoint>`-style fence queue
//! (elsewhere typically wrapping a hardcoded `GLsync` fence) to any
//! `Backend::Event`.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::backend::Backend;
use crate::chunk::CommandChunk;
use crate::error::{ContextError, Result};
use crate::handle::SequenceId;
use crate::ring::RingBumpAllocator;

struct SyncPoint {
    value: SequenceId,
}

/// Tracks which sequence ids have been signalled on the backend's shared
/// event, and lets the caller wait for a specific one.
pub struct Timeline<B: Backend> {
    event: B::Event,
    points: VecDeque<SyncPoint>,
    current_value: SequenceId,
}

impl<B: Backend> Timeline<B> {
    pub fn new(backend: &B) -> Timeline<B> {
        Timeline {
            event: backend.new_shared_event(),
            points: VecDeque::new(),
            current_value: SequenceId(0),
        }
    }

    pub fn event(&self) -> &B::Event {
        &self.event
    }

    /// Records that `value` will be signalled once the command buffer
    /// currently being built completes.
    pub fn track(&mut self, value: SequenceId) {
        self.points.push_back(SyncPoint { value });
    }

    /// Polls the backend event and advances `current_value` as far as
    /// observed completions allow. Never blocks.
    pub fn poll(&mut self, backend: &B) -> SequenceId {
        let signalled = backend.event_signaled_value(&self.event);
        while let Some(front) = self.points.front() {
            if front.value.0 <= signalled {
                self.current_value = front.value;
                self.points.pop_front();
            } else {
                break;
            }
        }
        self.current_value
    }

    /// Blocks until `value` is reached or `timeout` elapses.
    pub fn wait(&mut self, backend: &B, value: SequenceId, timeout: Duration) -> bool {
        if self.current_value >= value {
            return true;
        }
        let reached = backend.event_wait(&self.event, value.0, timeout);
        if reached {
            self.current_value = value;
            self.points.retain(|p| p.value > value);
        }
        reached
    }

    pub fn current_value(&self) -> SequenceId {
        self.current_value
    }
}

/// Sources for UAV `Append`/`Consume` counters. A `D3D11_USAGE_DEFAULT`
/// UAV-buffer rebind with `APPEND` set silently re-uses the same counter;
/// this is modeled as-is (the same slot is returned on rebind) rather than
/// guessed at.
pub struct CounterPool {
    ring: RingBumpAllocator,
}

impl CounterPool {
    pub fn new(capacity: u32) -> CounterPool {
        CounterPool { ring: RingBumpAllocator::new(capacity) }
    }

    pub fn allocate(&mut self) -> Option<u32> {
        self.ring.alloc(4, 4)
    }

    pub fn reset(&mut self) {
        self.ring.reset();
    }
}

/// Owns the live chunk ring, the queue's sequence-id counters, the shared
/// event, the UAV counter pool, and the staging ring allocator.
pub struct CommandQueue<B: Backend> {
    timeline: Timeline<B>,
    chunks: VecDeque<CommandChunk>,
    chunk_capacity: usize,
    next_seq_id: SequenceId,
    pub counters: CounterPool,
    pub staging_ring: RingBumpAllocator,
    device_lost: AtomicBool,
    argument_heap_capacity: u32,
}

impl<B: Backend> CommandQueue<B> {
    pub fn new(backend: &B, chunk_capacity: usize, argument_heap_capacity: u32, staging_ring_capacity: u32) -> CommandQueue<B> {
        assert!(chunk_capacity >= 2, "chunk ring capacity must be at least 2");
        let mut queue = CommandQueue {
            timeline: Timeline::new(backend),
            chunks: VecDeque::with_capacity(chunk_capacity),
            chunk_capacity,
            next_seq_id: SequenceId(1),
            counters: CounterPool::new(4096),
            staging_ring: RingBumpAllocator::new(staging_ring_capacity),
            device_lost: AtomicBool::new(false),
            argument_heap_capacity,
        };
        queue.chunks.push_back(CommandChunk::new(SequenceId(0), argument_heap_capacity));
        queue
    }

    pub fn is_device_lost(&self) -> bool {
        self.device_lost.load(Ordering::Acquire)
    }

    /// Latches device-lost; idempotent, and only the first observation
    /// logs a structured line -- repeat calls from later failing entry
    /// points stay silent.
    pub fn latch_device_lost(&self, reason: &str) {
        if !self.device_lost.swap(true, Ordering::AcqRel) {
            log::error!("device lost: {}", reason);
        }
    }

    fn check_alive(&self) -> Result<()> {
        if self.is_device_lost() {
            Err(ContextError::DeviceLost)
        } else {
            Ok(())
        }
    }

    pub fn current_chunk(&self) -> &CommandChunk {
        self.chunks.back().expect("queue always has a current chunk")
    }

    pub fn current_chunk_mut(&mut self) -> &mut CommandChunk {
        self.chunks.back_mut().expect("queue always has a current chunk")
    }

    /// Visibility-result buffer of the chunk tagged with `seq_id`, if it is
    /// still live in the ring. `None` once that chunk's storage has been
    /// recycled for a later submission -- occlusion queries must be
    /// resolved before the ring wraps that far.
    pub fn chunk_visibility_results(&self, seq_id: SequenceId) -> Option<&[u64; crate::chunk::OCCLUSION_SAMPLE_COUNT]> {
        self.chunks.iter().find(|c| c.seq_id == seq_id).map(|c| &c.visibility_results)
    }

    /// Backend completion-handler hook: once the GPU's visibility-result
    /// buffer for the chunk tagged `seq_id` has been read back, the
    /// backend binding reports the per-sample counts here. A no-op if that
    /// chunk's storage has already been recycled.
    pub fn report_chunk_visibility_results(
        &mut self,
        seq_id: SequenceId,
        results: [u64; crate::chunk::OCCLUSION_SAMPLE_COUNT],
    ) {
        if let Some(chunk) = self.chunks.iter_mut().find(|c| c.seq_id == seq_id) {
            chunk.visibility_results = results;
        }
    }

    pub fn coherent_seq_id(&self, backend: &B) -> SequenceId {
        self.timeline.poll(backend)
    }

    /// The backend shared event the timeline polls; `Context::flush` signals
    /// this from the command buffer it is about to commit, at the sequence
    /// id `retire_current_chunk` is about to hand out.
    pub fn timeline_event(&self) -> &B::Event {
        self.timeline.event()
    }

    /// The sequence id the next call to `retire_current_chunk` will assign,
    /// without consuming it.
    pub fn peek_next_seq_id(&self) -> SequenceId {
        self.next_seq_id
    }

    /// Retires the current chunk: assigns it the next sequence id, tracks
    /// it on the timeline, and rotates in a fresh chunk reusing the oldest
    /// retired one's storage once the ring is at capacity.
    pub fn retire_current_chunk(&mut self, backend: &B) -> Result<SequenceId> {
        self.check_alive()?;
        let seq_id = self.next_seq_id;
        self.next_seq_id = self.next_seq_id.next();

        {
            let chunk = self.chunks.back_mut().expect("queue always has a current chunk");
            chunk.seq_id = seq_id;
        }
        self.timeline.track(seq_id);

        if self.chunks.len() >= self.chunk_capacity {
            let mut reused = self.chunks.pop_front().expect("non-empty ring");
            reused.reset(SequenceId(0));
            self.chunks.push_back(reused);
        } else {
            self.chunks.push_back(CommandChunk::new(SequenceId(0), self.argument_heap_capacity));
        }

        Ok(seq_id)
    }

    pub fn wait_for_completion(&mut self, backend: &B, seq_id: SequenceId, timeout: Duration) -> bool {
        self.timeline.wait(backend, seq_id, timeout)
    }
}
