//! `CommandChunk`: one arena-allocated recording per submission.
//!
//! Holds three kinds of content: typed command records, deferred closures
//! for late-bound values, and auxiliary reference lists that keep
//! allocations alive for the chunk's lifetime. Records are pushed in
//! emission order and never reordered -- unlike a sort-key based command
//! buffer, D3D11's ordering guarantees require strict emission order within
//! a chunk, so there is no sort pass here.

use smallvec::SmallVec;

use crate::allocation::Allocation;
use crate::backend::{
    ClearColor, IndexType, LoadAction, PrimitiveTopology, ResourceUsage, ShaderStage, StoreAction,
};
use crate::clear::MAX_COLOR_ATTACHMENTS;
use crate::handle::{BufferHandle, SequenceId, TextureHandle, ViewKey};
use crate::ring::RingBumpAllocator;

/// One color attachment as resolved for an "open render pass" record.
#[derive(Copy, Clone, Debug)]
pub struct ColorAttachmentRecord {
    pub texture: TextureHandle,
    pub view: ViewKey,
    pub load_action: LoadAction,
    pub clear_color: ClearColor,
    pub store_action: StoreAction,
    pub resolve_target: Option<TextureHandle>,
}

#[derive(Copy, Clone, Debug)]
pub struct DepthStencilAttachmentRecord {
    pub texture: TextureHandle,
    pub view: ViewKey,
    pub depth_load_action: LoadAction,
    pub depth_clear_value: f32,
    pub depth_store_action: StoreAction,
    pub stencil_load_action: LoadAction,
    pub stencil_clear_value: u32,
    pub stencil_store_action: StoreAction,
}

/// A late-bound patch applied to an already-recorded argument-table entry
/// at encode time -- used when an SRV's backend handle depends on context
/// only available once the encoder actually executes.
#[derive(Copy, Clone, Debug)]
pub enum DeferredPatch {
    ResolveArgumentBufferView {
        heap_offset: u32,
        resource: TextureHandle,
        view: ViewKey,
    },
}

/// A single typed command record: one opcode per record, inline body, no
/// extra indirection -- the encoder driver walks the chunk's records in
/// order and issues the matching backend call for each.
#[derive(Clone, Debug)]
pub enum Command {
    PipelineBarrier,

    OpenRenderPass {
        colors: SmallVec<[ColorAttachmentRecord; MAX_COLOR_ATTACHMENTS]>,
        depth_stencil: Option<DepthStencilAttachmentRecord>,
        width: u32,
        height: u32,
        array_length: u32,
        sample_count: u32,
    },
    CloseRenderPass,
    OpenComputePass,
    CloseComputePass,
    OpenBlitPass,
    CloseBlitPass,

    SetRenderPipeline(crate::handle::PipelineHandle),
    SetComputePipeline(crate::handle::PipelineHandle),
    SetDepthStencilState,

    SetArgumentBufferOffset {
        stage: ShaderStage,
        slot: u32,
        heap_offset: u32,
    },
    SetVertexBufferTable {
        heap_offset: u32,
    },
    UseResource {
        resource: crate::handle::ResourceHandle,
        usage: ResourceUsage,
        stage: ShaderStage,
    },

    SetViewports(SmallVec<[crate::state::Viewport; crate::state::MAX_VIEWPORTS]>),
    SetScissors(SmallVec<[crate::state::ScissorRect; crate::state::MAX_VIEWPORTS]>),
    SetBlendColor([f32; 4]),
    SetStencilRef(u32),

    SetVisibilityResultMode {
        counting: bool,
        offset: u64,
    },

    Draw {
        topology: PrimitiveTopology,
        vertex_start: u32,
        vertex_count: u32,
        instance_count: u32,
    },
    DrawIndexed {
        topology: PrimitiveTopology,
        index_count: u32,
        index_type: IndexType,
        index_buffer: BufferHandle,
        index_buffer_offset: u32,
        instance_count: u32,
        base_vertex: i32,
    },
    Dispatch {
        groups_x: u32,
        groups_y: u32,
        groups_z: u32,
    },

    CopyBufferToBuffer {
        src: BufferHandle,
        src_offset: u64,
        dst: BufferHandle,
        dst_offset: u64,
        size: u64,
    },
    CopyBufferToTexture {
        src: BufferHandle,
        src_offset: u64,
        src_bytes_per_row: u32,
        dst: TextureHandle,
        level: u32,
        slice: u32,
        width: u32,
        height: u32,
        depth: u32,
    },
    CopyTextureToBuffer {
        src: TextureHandle,
        level: u32,
        slice: u32,
        dst: BufferHandle,
        dst_offset: u64,
        dst_bytes_per_row: u32,
        width: u32,
        height: u32,
        depth: u32,
    },
    CopyTextureToTexture {
        src: TextureHandle,
        src_level: u32,
        src_slice: u32,
        dst: TextureHandle,
        dst_level: u32,
        dst_slice: u32,
        width: u32,
        height: u32,
        depth: u32,
    },

    Present,
}

/// Per-chunk GPU-visible heap for argument-buffer data. A thin typed
/// wrapper over `RingBumpAllocator`.
pub struct ChunkArgumentHeap {
    ring: RingBumpAllocator,
    /// CPU-side mirror of the heap's contents. In the real backend this
    /// region is a persistently-mapped upload buffer; the core only needs
    /// to know the bytes it wrote, not how they reach the GPU.
    bytes: Vec<u8>,
}

impl ChunkArgumentHeap {
    pub fn new(capacity: u32) -> ChunkArgumentHeap {
        ChunkArgumentHeap {
            ring: RingBumpAllocator::new(capacity),
            bytes: vec![0u8; capacity as usize],
        }
    }

    pub fn reserve(&mut self, size: u32, align: u32) -> Option<u32> {
        self.ring.alloc(size, align)
    }

    pub fn write(&mut self, offset: u32, data: &[u8]) {
        let start = offset as usize;
        self.bytes[start..start + data.len()].copy_from_slice(data);
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn reset(&mut self) {
        self.ring.reset();
    }
}

pub const OCCLUSION_SAMPLE_COUNT: usize = 256;

/// One recording arena per submission. Owns the command records, deferred
/// patches, reference list keeping allocations alive, the argument heap,
/// and the visibility-query buffer.
pub struct CommandChunk {
    pub seq_id: SequenceId,
    commands: Vec<Command>,
    patches: Vec<(usize, DeferredPatch)>,
    retained: Vec<Allocation>,
    pub argument_heap: ChunkArgumentHeap,
    pub visibility_results: [u64; OCCLUSION_SAMPLE_COUNT],
    pub next_visibility_slot: usize,
}

impl CommandChunk {
    pub fn new(seq_id: SequenceId, argument_heap_capacity: u32) -> CommandChunk {
        CommandChunk {
            seq_id,
            commands: Vec::new(),
            patches: Vec::new(),
            retained: Vec::new(),
            argument_heap: ChunkArgumentHeap::new(argument_heap_capacity),
            visibility_results: [0; OCCLUSION_SAMPLE_COUNT],
            next_visibility_slot: 0,
        }
    }

    pub fn push(&mut self, command: Command) -> usize {
        self.commands.push(command);
        self.commands.len() - 1
    }

    pub fn push_patch(&mut self, command_index: usize, patch: DeferredPatch) {
        self.patches.push((command_index, patch));
    }

    pub fn retain(&mut self, alloc: Allocation) {
        self.retained.push(alloc);
    }

    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    pub fn patches(&self) -> &[(usize, DeferredPatch)] {
        &self.patches
    }

    pub fn allocate_visibility_slot(&mut self) -> u64 {
        let slot = self.next_visibility_slot;
        self.next_visibility_slot = (self.next_visibility_slot + 1) % OCCLUSION_SAMPLE_COUNT;
        (slot * std::mem::size_of::<u64>()) as u64
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn reset(&mut self, new_seq_id: SequenceId) {
        self.seq_id = new_seq_id;
        self.commands.clear();
        self.patches.clear();
        self.retained.clear();
        self.argument_heap.reset();
        self.visibility_results = [0; OCCLUSION_SAMPLE_COUNT];
        self.next_visibility_slot = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commands_are_returned_in_emission_order() {
        let mut chunk = CommandChunk::new(SequenceId(0), 4096);
        chunk.push(Command::PipelineBarrier);
        chunk.push(Command::CloseRenderPass);
        chunk.push(Command::Present);
        assert_eq!(chunk.commands().len(), 3);
        assert!(matches!(chunk.commands()[2], Command::Present));
    }

    #[test]
    fn reset_clears_everything_and_adopts_new_sequence_id() {
        let mut chunk = CommandChunk::new(SequenceId(0), 4096);
        chunk.push(Command::Present);
        chunk.allocate_visibility_slot();
        chunk.reset(SequenceId(7));
        assert!(chunk.is_empty());
        assert_eq!(chunk.seq_id, SequenceId(7));
        assert_eq!(chunk.next_visibility_slot, 0);
    }

    #[test]
    fn visibility_slots_wrap_around_the_sample_count() {
        let mut chunk = CommandChunk::new(SequenceId(0), 4096);
        for _ in 0..OCCLUSION_SAMPLE_COUNT {
            chunk.allocate_visibility_slot();
        }
        assert_eq!(chunk.next_visibility_slot, 0);
    }
}
