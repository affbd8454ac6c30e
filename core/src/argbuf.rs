//! Argument-buffer upload: `PreDraw` / `PreDispatch`.
//!
//! For each stage whose dirty bits intersect the pipeline's slot mask, this
//! reserves a region in the chunk's argument heap sized from the pipeline's
//! reflection, writes one entry per pipeline-required binding, and emits a
//! `SetArgumentBufferOffset` command plus any newly-needed `UseResource`
//! commands. The same mechanism uploads the fixed-layout vertex-buffer
//! table, gated by the input layout's slot mask.

use bytemuck::{Pod, Zeroable};

use crate::backend::{ResourceUsage, ShaderStage};
use crate::binding::{BindingSet, DirtyMask};
use crate::chunk::{ChunkArgumentHeap, Command};
use crate::handle::{BufferHandle, ResourceHandle, ResourceView, SamplerHandle};
use crate::residency::ResidencyTracker;

/// Which slots a pipeline reads, per binding class, for one shader stage.
/// Populated from the pipeline's reflection data when it is compiled.
#[derive(Copy, Clone, Debug, Default)]
pub struct StageReflection {
    pub constant_buffers: DirtyMask,
    pub shader_resources: DirtyMask,
    pub samplers: DirtyMask,
    pub unordered_access: DirtyMask,
}

impl StageReflection {
    fn used_slot_mask(&self) -> DirtyMask {
        self.constant_buffers | self.shader_resources | self.samplers | self.unordered_access
    }

    /// Constant-buffer entries are 8 bytes each; every other argument kind
    /// (SRV, sampler, UAV) is 24 bytes; the whole region is 16-byte
    /// aligned.
    pub fn region_size(&self) -> u32 {
        let cb_count = self.constant_buffers.count_ones();
        let arg_count = (self.shader_resources | self.samplers | self.unordered_access).count_ones();
        align_up(cb_count * 8 + arg_count * 24, 16)
    }
}

fn align_up(v: u32, align: u32) -> u32 {
    (v + align - 1) & !(align - 1)
}

/// 8-byte constant-buffer pointer record: `buffer_gpu_address + (first_constant << 4)`.
#[repr(C)]
#[derive(Copy, Clone, Pod, Zeroable)]
struct ConstantBufferEntry {
    address: u64,
}

/// 24-byte argument record shared by SRV/Sampler/UAV slots: a primary
/// handle (texture id, buffer address, or sampler argument handle), an
/// auxiliary value (element width for typed buffer SRVs, or a counter
/// address for append/consume UAVs), and a reserved word for alignment
/// and future use.
#[repr(C)]
#[derive(Copy, Clone, Pod, Zeroable)]
struct ArgumentEntry {
    handle: u64,
    aux: u64,
    reserved: u64,
}

/// Supplies the backend-specific bytes for one binding; `Context` is the
/// only caller, since resolving a handle into GPU-visible bytes requires
/// talking to the `Backend`.
pub trait ArgumentResolver {
    fn resolve_constant_buffer(&mut self, handle: BufferHandle, offset: u32) -> u64;
    fn resolve_shader_resource(&mut self, view: ResourceView) -> (u64, u64);
    fn resolve_sampler(&mut self, handle: SamplerHandle) -> u64;
    /// Returns `(handle, counter_address)`. A DEFAULT-usage UAV bound with
    /// APPEND silently reuses its existing counter on rebind rather than
    /// allocating a fresh one -- this resolver is where that choice is
    /// made.
    fn resolve_unordered_access(&mut self, view: ResourceView) -> (u64, u64);
}

/// Uploads one stage's argument table if (and only if) its dirty bits
/// intersect the pipeline's used-slot mask. Returns `true` if an upload
/// (and thus a `SetArgumentBufferOffset` record) was emitted.
#[allow(clippy::too_many_arguments)]
pub fn upload_stage(
    chunk_commands_out: &mut Vec<Command>,
    heap: &mut ChunkArgumentHeap,
    residency: &mut ResidencyTracker,
    stage: ShaderStage,
    stage_slot: u32,
    reflection: &StageReflection,
    cb_set: &mut BindingSet<BufferHandle>,
    srv_set: &mut BindingSet<ResourceView>,
    sampler_set: &mut BindingSet<SamplerHandle>,
    uav_set: &mut BindingSet<ResourceView>,
    resolver: &mut impl ArgumentResolver,
) -> bool {
    let used = reflection.used_slot_mask();
    let dirty = cb_set.dirty_mask() | srv_set.dirty_mask() | sampler_set.dirty_mask() | uav_set.dirty_mask();
    if dirty & used == 0 {
        return false;
    }

    let region_size = reflection.region_size();
    let Some(base_offset) = heap.reserve(region_size, 16) else {
        log::warn!("argument heap exhausted uploading stage {:?}; dropping upload", stage);
        return false;
    };

    let mut cursor = base_offset;
    for slot in 0..crate::binding::MAX_BINDING_SLOTS {
        if reflection.constant_buffers & (1 << slot) == 0 {
            continue;
        }
        if let Some(entry) = cb_set.get(slot) {
            let address = resolver.resolve_constant_buffer(entry.handle, entry.offset);
            heap.write(cursor, bytemuck::bytes_of(&ConstantBufferEntry { address }));
            cursor += std::mem::size_of::<ConstantBufferEntry>() as u32;
            if residency.mark_used(handle_id(ResourceHandle::Buffer(entry.handle)), stage, ResourceUsage::Read) {
                chunk_commands_out.push(Command::UseResource {
                    resource: ResourceHandle::Buffer(entry.handle),
                    usage: ResourceUsage::Read,
                    stage,
                });
            }
        }
        cb_set.clear_dirty(slot);
    }

    for slot in 0..crate::binding::MAX_BINDING_SLOTS {
        if reflection.shader_resources & (1 << slot) != 0 {
            if let Some(entry) = srv_set.get(slot) {
                let (handle, aux) = resolver.resolve_shader_resource(entry.handle);
                heap.write(cursor, bytemuck::bytes_of(&ArgumentEntry { handle, aux, reserved: 0 }));
                cursor += std::mem::size_of::<ArgumentEntry>() as u32;
            }
            srv_set.clear_dirty(slot);
        }
        if reflection.samplers & (1 << slot) != 0 {
            if let Some(entry) = sampler_set.get(slot) {
                let handle = resolver.resolve_sampler(entry.handle);
                heap.write(cursor, bytemuck::bytes_of(&ArgumentEntry { handle, aux: 0, reserved: 0 }));
                cursor += std::mem::size_of::<ArgumentEntry>() as u32;
            }
            sampler_set.clear_dirty(slot);
        }
        if reflection.unordered_access & (1 << slot) != 0 {
            if let Some(entry) = uav_set.get(slot) {
                let (handle, counter) = resolver.resolve_unordered_access(entry.handle);
                heap.write(cursor, bytemuck::bytes_of(&ArgumentEntry { handle, aux: counter, reserved: 0 }));
                cursor += std::mem::size_of::<ArgumentEntry>() as u32;
            }
            uav_set.clear_dirty(slot);
        }
    }

    chunk_commands_out.push(Command::SetArgumentBufferOffset {
        stage,
        slot: stage_slot,
        heap_offset: base_offset,
    });

    true
}

fn handle_id(h: ResourceHandle) -> u64 {
    use slotmap::Key;
    match h {
        ResourceHandle::Buffer(b) => b.data().as_ffi(),
        ResourceHandle::Texture(t) => t.data().as_ffi(),
    }
}

/// Fixed-layout vertex-buffer table: `{u64 buffer_handle, u32 stride, u32
/// length}[32]`, gated by the input layout's slot mask.
#[repr(C)]
#[derive(Copy, Clone, Pod, Zeroable)]
pub struct VertexBufferTableEntry {
    pub buffer_handle: u64,
    pub stride: u32,
    pub length: u32,
}

pub fn upload_vertex_buffer_table(
    chunk_commands_out: &mut Vec<Command>,
    heap: &mut ChunkArgumentHeap,
    slot_mask: DirtyMask,
    entries: &[VertexBufferTableEntry; 32],
) -> bool {
    if slot_mask == 0 {
        return false;
    }
    let size = (std::mem::size_of::<VertexBufferTableEntry>() * 32) as u32;
    let Some(offset) = heap.reserve(size, 16) else {
        log::warn!("argument heap exhausted uploading vertex buffer table; dropping upload");
        return false;
    };
    heap.write(offset, bytemuck::cast_slice(entries));
    chunk_commands_out.push(Command::SetVertexBufferTable { heap_offset: offset });
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binding::BindingEntry;
    use crate::handle::ResourceVersion;

    struct StubResolver;
    impl ArgumentResolver for StubResolver {
        fn resolve_constant_buffer(&mut self, _: BufferHandle, _: u32) -> u64 { 0x1000 }
        fn resolve_shader_resource(&mut self, _: ResourceView) -> (u64, u64) { (0x2000, 0) }
        fn resolve_sampler(&mut self, _: SamplerHandle) -> u64 { 0x3000 }
        fn resolve_unordered_access(&mut self, _: ResourceView) -> (u64, u64) { (0x4000, 0) }
    }

    #[test]
    fn clean_stage_skips_upload_entirely() {
        let mut commands = Vec::new();
        let mut heap = ChunkArgumentHeap::new(4096);
        let mut residency = ResidencyTracker::new();
        let mut cb: BindingSet<BufferHandle> = BindingSet::new(14);
        let mut srv: BindingSet<ResourceView> = BindingSet::new(128);
        let mut sampler: BindingSet<SamplerHandle> = BindingSet::new(16);
        let mut uav: BindingSet<ResourceView> = BindingSet::new(8);
        let reflection = StageReflection { constant_buffers: 1, ..Default::default() };
        cb.clear_dirty(0);
        let uploaded = upload_stage(
            &mut commands,
            &mut heap,
            &mut residency,
            ShaderStage::Vertex,
            30,
            &reflection,
            &mut cb,
            &mut srv,
            &mut sampler,
            &mut uav,
            &mut StubResolver,
        );
        assert!(!uploaded);
        assert!(commands.is_empty());
    }

    #[test]
    fn dirty_cb_in_pipeline_mask_triggers_upload_and_clears_dirty() {
        use slotmap::SlotMap;
        let mut commands = Vec::new();
        let mut heap = ChunkArgumentHeap::new(4096);
        let mut residency = ResidencyTracker::new();
        let mut cb: BindingSet<BufferHandle> = BindingSet::new(14);
        let mut srv: BindingSet<ResourceView> = BindingSet::new(128);
        let mut sampler: BindingSet<SamplerHandle> = BindingSet::new(16);
        let mut uav: BindingSet<ResourceView> = BindingSet::new(8);

        let mut map: SlotMap<BufferHandle, ()> = SlotMap::with_key();
        let buffer = map.insert(());
        cb.bind(0, BindingEntry { handle: buffer, seen_version: ResourceVersion(0), offset: 0, size: 16 });

        let reflection = StageReflection { constant_buffers: 1, ..Default::default() };
        let uploaded = upload_stage(
            &mut commands,
            &mut heap,
            &mut residency,
            ShaderStage::Vertex,
            30,
            &reflection,
            &mut cb,
            &mut srv,
            &mut sampler,
            &mut uav,
            &mut StubResolver,
        );
        assert!(uploaded);
        assert!(!cb.any_dirty_masked(1));
        assert!(commands.iter().any(|c| matches!(c, Command::SetArgumentBufferOffset { .. })));
        assert!(commands.iter().any(|c| matches!(c, Command::UseResource { .. })));
    }
}
