//! The immediate context: the orchestrator that ties every other module
//! together.
//!
//! `Context<B, C>` is generic over a `Backend` and a `PipelineCompiler`; it
//! owns the resource tables, the pipeline state, the command queue, and
//! drives the encoder state machine on every draw, dispatch, copy, and
//! clear. It is the one place in the crate where all the leaf components
//! (`resource`, `binding`, `chunk`, `clear`, `argbuf`, `queue`, ...) meet.

use std::sync::Arc;
use std::time::Duration;

use fxhash::FxHashMap;
use slotmap::SlotMap;
use smallvec::SmallVec;

use crate::allocation::{Allocation, AllocationFlags, BufferAllocation, TextureAllocation, TextureExtent};
use crate::argbuf::{self, ArgumentResolver, StageReflection, VertexBufferTableEntry};
use crate::backend::{
    Backend, BufferDesc, ClearColor, ColorAttachment, CommandBufferStatus, DepthStencilAttachment,
    IndexType, LoadAction, PrimitiveTopology, RenderPassDescriptor, ResourceUsage, SamplerDesc,
    ShaderStage, StoreAction, TextureDesc, VisibilityResultMode,
};
use crate::binding::{BindingEntry, BindingSet, DirtyMask};
use crate::chunk::{
    ColorAttachmentRecord, Command, DepthStencilAttachmentRecord, OCCLUSION_SAMPLE_COUNT,
};
use crate::clear::{MAX_COLOR_ATTACHMENTS, PendingColorClear, PendingDepthStencilClear};
use crate::config::RuntimeConfig;
use crate::copy::{self, BlitKind, CopyBox, CopyPlan, ResourceKind};
use crate::encoder_state::{EncoderKind, EncoderStateMachine};
use crate::error::{ContextError, Result};
use crate::format::{PixelFormat, ViewKind};
use crate::handle::{
    BufferHandle, PipelineHandle, QueryHandle, ResourceHandle, ResourceVersion, ResourceView,
    SamplerHandle, SequenceId, TextureHandle, ViewKey,
};
use crate::dynamic::{DynamicPool, MapOutcome, StagingResource};
use crate::pipeline::{ComputePipelineDesc, PipelineCache, PipelineCompiler, RenderPipelineDesc};
use crate::query::OcclusionQuery;
use crate::queue::CommandQueue;
use crate::residency::ResidencyTracker;
use crate::resource::Resource;
use crate::state::{
    ContextState, IndexFormat, RenderTargetBinding, ScissorRect, VertexBufferBinding, Viewport,
};
use crate::view::{AttachmentDescriptor, SubresourceRange, ViewDescriptor};

/// CPU access pattern requested by `Map` (D3D11 `D3D11_MAP`).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MapType {
    Read,
    Write,
    ReadWrite,
    WriteDiscard,
    WriteNoOverwrite,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct MapFlags {
    pub do_not_wait: bool,
}

/// Result of a successful `Map`: a CPU pointer plus the row/depth pitch the
/// application should use to address it.
#[derive(Debug)]
pub struct MappedSubresource {
    pub ptr: std::ptr::NonNull<u8>,
    pub row_pitch: u32,
    pub depth_pitch: u32,
}

/// Resolved compiled render pipeline plus the reflection data PreDraw
/// needs: which slots each stage reads, and the input layout's vertex-
/// buffer slot mask.
struct CompiledRenderPipeline<B: Backend> {
    pso: B::RenderPipelineState,
    vertex_reflection: StageReflection,
    pixel_reflection: StageReflection,
    vertex_buffer_mask: DirtyMask,
    tessellation: bool,
}

struct CompiledComputePipeline<B: Backend> {
    pso: B::ComputePipelineState,
    reflection: StageReflection,
}

/// Vertex-buffer index the fixed-layout vertex-buffer table is bound at,
/// distinct from the per-stage argument-table slot (30) so a pipeline that
/// vertex-pulls through the table can still read its constant-buffer /
/// SRV / sampler / UAV argument table in the same encoder.
const VERTEX_BUFFER_TABLE_SLOT: u32 = 29;

/// A stable identity for an `Allocation`'s backing `Arc`, used to key the
/// live backend object behind it independently of which handle currently
/// names it (see `Context::backend_buffers`/`backend_textures`).
fn alloc_key(alloc: &Allocation) -> usize {
    match alloc {
        Allocation::Buffer(b) => Arc::as_ptr(b) as usize,
        Allocation::Texture(t) => Arc::as_ptr(t) as usize,
    }
}

/// The close record matching whatever encoder kind was actually open.
/// `kind` is `None` only when there was nothing to close, in which case
/// callers never reach here (`transition.close_current` is false).
fn close_command_for_kind(kind: Option<EncoderKind>) -> Command {
    match kind {
        Some(EncoderKind::Render) => Command::CloseRenderPass,
        Some(EncoderKind::Compute) => Command::CloseComputePass,
        Some(EncoderKind::Blit) | Some(EncoderKind::UpdateBlit) | Some(EncoderKind::ReadbackBlit) => {
            Command::CloseBlitPass
        }
        None => Command::CloseRenderPass,
    }
}

/// The immediate context: D3D11's `ID3D11DeviceContext` surface, minus the
/// COM plumbing. Every method here corresponds 1:1 to a D3D11 entry point.
pub struct Context<B: Backend, C: PipelineCompiler<B>> {
    backend: B,
    config: RuntimeConfig,
    queue: CommandQueue<B>,

    buffers: SlotMap<BufferHandle, Resource<B>>,
    textures: SlotMap<TextureHandle, Resource<B>>,
    samplers: SlotMap<SamplerHandle, B::Sampler>,
    queries: SlotMap<QueryHandle, OcclusionQuery>,

    /// Live backend objects, keyed by the `Arc` identity of the `Allocation`
    /// they were created for (`Arc::as_ptr(..) as usize`). `Resource<B>`
    /// and `Allocation` only carry backend-agnostic metadata (size, format,
    /// CPU pointer) so they can be pooled and renamed without depending on
    /// `B`; keying by the allocation's own address rather than by handle
    /// means a `DynamicPool`-recycled `Allocation` naturally resolves back
    /// to the same backend object it was created with, and a handle whose
    /// resource has been renamed resolves through its *current* allocation.
    /// Entries for allocations retired into a pool but never destroyed via
    /// `destroy_buffer`/`destroy_texture` persist until the resource itself
    /// is destroyed (see `destroy_buffer`); accepted for now and noted in
    /// the grounding ledger.
    backend_buffers: FxHashMap<usize, B::Buffer>,
    backend_textures: FxHashMap<usize, B::Texture>,

    dynamic_pools: FxHashMap<ResourceHandle, DynamicPool>,
    staging: FxHashMap<ResourceHandle, StagingResource>,

    /// The CPU-visible backend buffer backing `queue.staging_ring`'s byte
    /// offsets. `None` if the backend failed to allocate it at construction
    /// (contended-path `UpdateSubresource` calls then surface an error
    /// rather than silently dropping the upload).
    staging_buffer: Option<BufferHandle>,

    pipeline_cache: PipelineCache<B, C>,
    render_pipelines: SlotMap<PipelineHandle, CompiledRenderPipeline<B>>,
    compute_pipelines: SlotMap<PipelineHandle, CompiledComputePipeline<B>>,
    current_render_pipeline: Option<PipelineHandle>,
    current_compute_pipeline: Option<PipelineHandle>,

    state: ContextState,
    encoder_sm: EncoderStateMachine,
    clear_pass: crate::clear::ClearPass,
    residency: ResidencyTracker,

    active_query_offset: Option<u64>,
    frame_counter: u64,

    viewports_dirty: bool,
    scissors_dirty: bool,
    blend_color_dirty: bool,
    stencil_ref_dirty: bool,
}

impl<B: Backend, C: PipelineCompiler<B>> Context<B, C> {
    pub fn new(backend: B, compiler: Arc<C>, config: RuntimeConfig) -> Context<B, C> {
        let queue = CommandQueue::new(&backend, config.chunk_ring_capacity.max(2), 1 << 20, 16 << 20);
        let staging_ring_capacity = queue.staging_ring.capacity();
        let pipeline_cache = PipelineCache::new(compiler, config.pipeline_cache_capacity);
        let mut ctx = Context {
            backend,
            config,
            queue,
            buffers: SlotMap::with_key(),
            textures: SlotMap::with_key(),
            samplers: SlotMap::with_key(),
            queries: SlotMap::with_key(),
            backend_buffers: FxHashMap::default(),
            backend_textures: FxHashMap::default(),
            dynamic_pools: FxHashMap::default(),
            staging: FxHashMap::default(),
            staging_buffer: None,
            pipeline_cache,
            render_pipelines: SlotMap::with_key(),
            compute_pipelines: SlotMap::with_key(),
            current_render_pipeline: None,
            current_compute_pipeline: None,
            state: ContextState::new(),
            encoder_sm: EncoderStateMachine::new(),
            clear_pass: crate::clear::ClearPass::new(),
            residency: ResidencyTracker::new(),
            active_query_offset: None,
            frame_counter: 0,
            viewports_dirty: false,
            scissors_dirty: false,
            blend_color_dirty: false,
            stencil_ref_dirty: false,
        };
        ctx.staging_buffer = ctx
            .create_buffer(
                staging_ring_capacity as u64,
                crate::format::BufferUsage::SHADER_READ,
                AllocationFlags::SHARED | AllocationFlags::CPU_WRITE_COMBINED,
                None,
                Some("staging ring".to_string()),
            )
            .ok();
        ctx
    }

    pub fn is_device_lost(&self) -> bool {
        self.queue.is_device_lost()
    }

    /// Read-only access to the queue's current chunk, for capture tooling
    /// and conformance tests that assert on recorded command sequences
    /// rather than on GPU side effects.
    pub fn queue(&self) -> &CommandQueue<B> {
        &self.queue
    }

    fn check_alive(&self) -> Result<()> {
        if self.is_device_lost() {
            Err(ContextError::DeviceLost)
        } else {
            Ok(())
        }
    }

    // -- resource creation --------------------------------------------------

    pub fn create_buffer(
        &mut self,
        size: u64,
        usage: crate::format::BufferUsage,
        flags: AllocationFlags,
        initial_data: Option<&[u8]>,
        debug_name: Option<String>,
    ) -> Result<BufferHandle> {
        let (alloc, backend_buffer) = self.allocate_buffer(size, flags, debug_name.as_deref())?;
        if let Some(data) = initial_data {
            if let Some(ptr) = alloc.as_buffer().and_then(|b| b.cpu_ptr) {
                unsafe { std::ptr::copy_nonoverlapping(data.as_ptr(), ptr.as_ptr(), data.len()) };
            } else {
                self.upload_initial_buffer_data(&alloc, data);
            }
        }
        let _ = usage;
        let key = alloc_key(&alloc);
        self.backend_buffers.insert(key, backend_buffer);
        let resource = Resource::new(alloc, debug_name);
        Ok(self.buffers.insert(resource))
    }

    pub fn create_texture(
        &mut self,
        format: PixelFormat,
        mut extent: TextureExtent,
        sample_count: u32,
        usage: crate::format::TextureUsage,
        flags: AllocationFlags,
        debug_name: Option<String>,
    ) -> Result<TextureHandle> {
        extent.mip_levels =
            TextureExtent::expand_mip_levels(extent.width, extent.height, extent.mip_levels);
        let backend_desc = TextureDesc { format, extent, sample_count, usage, flags };
        let backend_texture = self
            .backend
            .create_texture(&backend_desc)
            .map_err(|_| ContextError::OutOfMemory)?;
        if let Some(name) = &debug_name {
            self.backend.set_texture_label(&backend_texture, name);
        }
        let alloc = Allocation::Texture(Arc::new(TextureAllocation {
            format,
            extent,
            sample_count,
            flags,
            debug_label: debug_name.clone(),
            creation_frame: self.frame_counter,
        }));
        let key = alloc_key(&alloc);
        self.backend_textures.insert(key, backend_texture);
        let resource = Resource::new(alloc, debug_name);
        Ok(self.textures.insert(resource))
    }

    pub fn create_sampler(&mut self, desc: SamplerDesc) -> Result<SamplerHandle> {
        let sampler = self
            .backend
            .create_sampler(&desc)
            .map_err(|_| ContextError::OutOfMemory)?;
        Ok(self.samplers.insert(sampler))
    }

    pub fn destroy_buffer(&mut self, handle: BufferHandle) {
        if let Some(res) = self.buffers.remove(handle) {
            self.backend_buffers.remove(&alloc_key(&res.current_allocation()));
        }
        self.dynamic_pools.remove(&ResourceHandle::Buffer(handle));
        self.staging.remove(&ResourceHandle::Buffer(handle));
    }

    pub fn destroy_texture(&mut self, handle: TextureHandle) {
        if let Some(res) = self.textures.remove(handle) {
            self.backend_textures.remove(&alloc_key(&res.current_allocation()));
        }
        self.dynamic_pools.remove(&ResourceHandle::Texture(handle));
        self.staging.remove(&ResourceHandle::Texture(handle));
    }

    fn allocate_buffer(
        &self,
        size: u64,
        flags: AllocationFlags,
        debug_name: Option<&str>,
    ) -> Result<(Allocation, B::Buffer)> {
        let desc = BufferDesc { size, usage: crate::format::BufferUsage::SHADER_READ, flags };
        let buffer = self
            .backend
            .create_buffer(&desc)
            .map_err(|_| ContextError::OutOfMemory)?;
        if let Some(name) = debug_name {
            self.backend.set_buffer_label(&buffer, name);
        }
        let cpu_ptr = self.backend.buffer_contents_ptr(&buffer);
        let alloc = Allocation::Buffer(Arc::new(BufferAllocation {
            size,
            flags,
            cpu_ptr,
            debug_label: debug_name.map(String::from),
            creation_frame: self.frame_counter,
        }));
        Ok((alloc, buffer))
    }

    fn upload_initial_buffer_data(&mut self, _alloc: &Allocation, _data: &[u8]) {
        // Out-of-band upload: a GPU-private
        // buffer with no CPU mapping stages its initial data through the
        // resource initializer's own queue rather than the immediate
        // context's chunk, so a large `CreateBuffer` does not stall
        // recording. Left as a hook for the resource-initializer module;
        // the immediate context only needs to know it happened out of band.
        log::debug!("initial data upload deferred to resource initializer");
    }

    // -- views ---------------------------------------------------------------

    pub fn create_shader_resource_view(
        &mut self,
        texture: TextureHandle,
        format: PixelFormat,
        kind: ViewKind,
        range: SubresourceRange,
    ) -> Result<ViewKey> {
        let res = self.textures.get(texture).ok_or_else(|| {
            ContextError::invalid_argument("create_shader_resource_view: unknown texture")
        })?;
        Ok(res.create_view(ViewDescriptor { format, kind, range, attachment: None }))
    }

    pub fn create_render_target_view(
        &mut self,
        texture: TextureHandle,
        format: PixelFormat,
        range: SubresourceRange,
        attachment: AttachmentDescriptor,
    ) -> Result<ViewKey> {
        let res = self.textures.get(texture).ok_or_else(|| {
            ContextError::invalid_argument("create_render_target_view: unknown texture")
        })?;
        Ok(res.create_view(ViewDescriptor {
            format,
            kind: ViewKind::Texture2d,
            range,
            attachment: Some(attachment),
        }))
    }

    // -- input assembler -------------------------------------------------------

    pub fn ia_set_primitive_topology(&mut self, topology: PrimitiveTopology) {
        self.state.input_assembler.topology = Some(topology);
    }

    pub fn ia_set_vertex_buffers(&mut self, start_slot: u32, buffers: &[VertexBufferBinding]) {
        let ia = &mut self.state.input_assembler;
        if ia.vertex_buffers.len() < (start_slot as usize + buffers.len()) {
            ia.vertex_buffers.resize(start_slot as usize + buffers.len(), None);
        }
        for (i, vb) in buffers.iter().enumerate() {
            let slot = start_slot as usize + i;
            ia.vertex_buffers[slot] = Some(*vb);
            ia.vertex_buffer_dirty |= 1 << slot;
        }
    }

    pub fn ia_set_index_buffer(&mut self, buffer: BufferHandle, format: IndexFormat, offset: u32) {
        self.state.input_assembler.index_buffer = Some(buffer);
        self.state.input_assembler.index_format = Some(format);
        self.state.input_assembler.index_offset = offset;
    }

    // -- shader stage bindings -------------------------------------------------

    fn stage_bindings_mut(&mut self, stage: ShaderStage) -> &mut crate::state::StageBindings {
        match stage {
            ShaderStage::Vertex => &mut self.state.vertex_stage,
            ShaderStage::Fragment => &mut self.state.pixel_stage,
            ShaderStage::Kernel => &mut self.state.compute_stage,
        }
    }

    pub fn set_constant_buffer(
        &mut self,
        stage: ShaderStage,
        slot: usize,
        buffer: BufferHandle,
        first_constant: u32,
        num_constants: u32,
    ) -> Result<()> {
        let version = self
            .buffers
            .get(buffer)
            .ok_or_else(|| ContextError::invalid_argument("set_constant_buffer: unknown buffer"))?
            .version();
        self.stage_bindings_mut(stage).constant_buffers.bind(
            slot,
            BindingEntry {
                handle: buffer,
                seen_version: version,
                offset: first_constant << 4,
                size: num_constants * 16,
            },
        );
        Ok(())
    }

    pub fn set_shader_resource(
        &mut self,
        stage: ShaderStage,
        slot: usize,
        resource: ResourceView,
        version: ResourceVersion,
    ) {
        self.stage_bindings_mut(stage).shader_resources.bind(
            slot,
            BindingEntry { handle: resource, seen_version: version, offset: 0, size: 0 },
        );
    }

    pub fn set_sampler(&mut self, stage: ShaderStage, slot: usize, sampler: SamplerHandle) {
        self.stage_bindings_mut(stage).samplers.bind(
            slot,
            BindingEntry { handle: sampler, seen_version: ResourceVersion::default(), offset: 0, size: 0 },
        );
    }

    pub fn set_unordered_access(
        &mut self,
        stage: ShaderStage,
        slot: usize,
        resource: ResourceView,
        version: ResourceVersion,
    ) {
        self.stage_bindings_mut(stage).unordered_access.bind(
            slot,
            BindingEntry { handle: resource, seen_version: version, offset: 0, size: 0 },
        );
    }

    // -- rasterizer / output merger ---------------------------------------------

    pub fn rs_set_viewports(&mut self, viewports: &[Viewport]) {
        self.state.rasterizer.viewports = SmallVec::from_slice(viewports);
        self.viewports_dirty = true;
    }

    pub fn rs_set_scissor_rects(&mut self, scissors: &[ScissorRect]) {
        self.state.rasterizer.scissors = SmallVec::from_slice(scissors);
        self.scissors_dirty = true;
    }

    pub fn om_set_blend_factor(&mut self, factor: [f32; 4]) {
        self.state.output_merger.blend_factor = factor;
        self.blend_color_dirty = true;
    }

    pub fn om_set_stencil_ref(&mut self, value: u32) {
        self.state.output_merger.stencil_ref = value;
        self.stencil_ref_dirty = true;
    }

    pub fn om_set_render_targets(
        &mut self,
        render_targets: &[Option<RenderTargetBinding>],
        depth_stencil: Option<RenderTargetBinding>,
    ) {
        self.state.output_merger.render_targets = SmallVec::from_slice(render_targets);
        self.state.output_merger.depth_stencil = depth_stencil;
    }

    // -- pipeline state -----------------------------------------------------------

    pub fn create_render_pipeline(
        &mut self,
        desc: RenderPipelineDesc,
        vertex_reflection: StageReflection,
        pixel_reflection: StageReflection,
        vertex_buffer_mask: DirtyMask,
        tessellation: bool,
    ) -> Result<PipelineHandle> {
        if tessellation {
            return Err(ContextError::Unsupported(
                "tessellation geometry pipeline is not implemented",
            ));
        }
        let pso = self.pipeline_cache.get_or_compile_render(&desc)?;
        Ok(self.render_pipelines.insert(CompiledRenderPipeline {
            pso,
            vertex_reflection,
            pixel_reflection,
            vertex_buffer_mask,
            tessellation,
        }))
    }

    pub fn create_compute_pipeline(
        &mut self,
        desc: ComputePipelineDesc,
        reflection: StageReflection,
    ) -> Result<PipelineHandle> {
        let pso = self.pipeline_cache.get_or_compile_compute(&desc)?;
        Ok(self.compute_pipelines.insert(CompiledComputePipeline { pso, reflection }))
    }

    /// Binds a compiled render pipeline. Marks every stage binding set
    /// dirty against the new pipeline's masks, since a slot clean against
    /// the old pipeline's reflection carries no guarantee against the new
    /// one's.
    pub fn set_render_pipeline(&mut self, handle: PipelineHandle) -> Result<()> {
        if self.current_render_pipeline == Some(handle) {
            return Ok(());
        }
        if !self.render_pipelines.contains_key(handle) {
            return Err(ContextError::invalid_argument("set_render_pipeline: unknown pipeline"));
        }
        self.current_render_pipeline = Some(handle);
        self.state.vertex_stage.constant_buffers.set_all_dirty();
        self.state.vertex_stage.shader_resources.set_all_dirty();
        self.state.vertex_stage.samplers.set_all_dirty();
        self.state.pixel_stage.constant_buffers.set_all_dirty();
        self.state.pixel_stage.shader_resources.set_all_dirty();
        self.state.pixel_stage.samplers.set_all_dirty();
        self.state.input_assembler.vertex_buffer_dirty = DirtyMask::MAX;
        self.encoder_sm.invalidate_pipeline_ready();
        Ok(())
    }

    pub fn set_compute_pipeline(&mut self, handle: PipelineHandle) -> Result<()> {
        if self.current_compute_pipeline == Some(handle) {
            return Ok(());
        }
        if !self.compute_pipelines.contains_key(handle) {
            return Err(ContextError::invalid_argument("set_compute_pipeline: unknown pipeline"));
        }
        self.current_compute_pipeline = Some(handle);
        self.state.compute_stage.constant_buffers.set_all_dirty();
        self.state.compute_stage.shader_resources.set_all_dirty();
        self.state.compute_stage.samplers.set_all_dirty();
        self.state.compute_stage.unordered_access.set_all_dirty();
        self.encoder_sm.invalidate_pipeline_ready();
        Ok(())
    }

    // -- clears ------------------------------------------------------------------

    pub fn clear_render_target_view(&mut self, texture: TextureHandle, view: ViewKey, color: ClearColor) {
        self.clear_pass.clear_color(texture, view, color);
    }

    pub fn clear_depth_stencil_view(
        &mut self,
        texture: TextureHandle,
        view: ViewKey,
        depth: Option<f32>,
        stencil: Option<u32>,
    ) {
        self.clear_pass.clear_depth_stencil(texture, view, depth, stencil);
    }

    // -- render pass setup ------------------------------------------------------

    fn build_render_pass_records(&mut self) -> Result<Command> {
        let mut colors: SmallVec<[ColorAttachmentRecord; MAX_COLOR_ATTACHMENTS]> = SmallVec::new();
        let mut width = 0u32;
        let mut height = 0u32;
        let mut array_length = 1u32;
        let mut sample_count = 1u32;

        for rt in self.state.output_merger.render_targets.iter().flatten() {
            let res = self
                .textures
                .get(rt.texture)
                .ok_or_else(|| ContextError::invalid_argument("render target: unknown texture"))?;
            let descriptor = res
                .view_descriptor(rt.view)
                .ok_or(ContextError::InvalidViewKey(rt.view))?;
            if let Some(att) = descriptor.attachment {
                width = width.max(att.width);
                height = height.max(att.height);
                array_length = array_length.max(att.array_length);
                sample_count = sample_count.max(att.sample_count);
            }
            let (load_action, clear_color) = match self.clear_pass.take_color(rt.texture, rt.view) {
                Some(c) => (LoadAction::Clear, c),
                None => (LoadAction::Load, ClearColor { r: 0.0, g: 0.0, b: 0.0, a: 0.0 }),
            };
            colors.push(ColorAttachmentRecord {
                texture: rt.texture,
                view: rt.view,
                load_action,
                clear_color,
                store_action: StoreAction::Store,
                resolve_target: None,
            });
        }

        let depth_stencil = match self.state.output_merger.depth_stencil {
            Some(ds) => {
                let res = self
                    .textures
                    .get(ds.texture)
                    .ok_or_else(|| ContextError::invalid_argument("depth target: unknown texture"))?;
                let descriptor = res
                    .view_descriptor(ds.view)
                    .ok_or(ContextError::InvalidViewKey(ds.view))?;
                if let Some(att) = descriptor.attachment {
                    width = width.max(att.width);
                    height = height.max(att.height);
                    array_length = array_length.max(att.array_length);
                    sample_count = sample_count.max(att.sample_count);
                }
                let pending = self.clear_pass.take_depth_stencil(ds.texture, ds.view);
                let depth_load = pending.as_ref().and_then(|p| p.clear_depth).map(|_| LoadAction::Clear);
                let stencil_load = pending.as_ref().and_then(|p| p.clear_stencil).map(|_| LoadAction::Clear);
                Some(DepthStencilAttachmentRecord {
                    texture: ds.texture,
                    view: ds.view,
                    depth_load_action: depth_load.unwrap_or(LoadAction::Load),
                    depth_clear_value: pending.as_ref().and_then(|p| p.clear_depth).unwrap_or(1.0),
                    depth_store_action: StoreAction::Store,
                    stencil_load_action: stencil_load.unwrap_or(LoadAction::Load),
                    stencil_clear_value: pending.as_ref().and_then(|p| p.clear_stencil).unwrap_or(0),
                    stencil_store_action: StoreAction::Store,
                })
            }
            None => None,
        };

        Ok(Command::OpenRenderPass { colors, depth_stencil, width, height, array_length, sample_count })
    }

    /// Emits any clears never absorbed by a render pass as a standalone
    /// no-op render pass whose sole purpose is to clear.
    fn flush_orphaned_clears(&mut self) {
        if self.clear_pass.is_empty() {
            return;
        }
        let (colors, depth_stencil) = self.clear_pass.drain();
        let mut width = 0u32;
        let mut height = 0u32;
        let mut color_records: SmallVec<[ColorAttachmentRecord; MAX_COLOR_ATTACHMENTS]> = SmallVec::new();
        for c in colors {
            if let Some(res) = self.textures.get(c.texture) {
                if let Some(descriptor) = res.view_descriptor(c.view) {
                    if let Some(att) = descriptor.attachment {
                        width = width.max(att.width);
                        height = height.max(att.height);
                    }
                }
            }
            color_records.push(ColorAttachmentRecord {
                texture: c.texture,
                view: c.view,
                load_action: LoadAction::Clear,
                clear_color: c.color,
                store_action: StoreAction::Store,
                resolve_target: None,
            });
        }
        let ds_record = depth_stencil.map(|ds: PendingDepthStencilClear| {
            if let Some(res) = self.textures.get(ds.texture) {
                if let Some(descriptor) = res.view_descriptor(ds.view) {
                    if let Some(att) = descriptor.attachment {
                        width = width.max(att.width);
                        height = height.max(att.height);
                    }
                }
            }
            DepthStencilAttachmentRecord {
                texture: ds.texture,
                view: ds.view,
                depth_load_action: if ds.clear_depth.is_some() { LoadAction::Clear } else { LoadAction::Load },
                depth_clear_value: ds.clear_depth.unwrap_or(1.0),
                depth_store_action: StoreAction::Store,
                stencil_load_action: if ds.clear_stencil.is_some() { LoadAction::Clear } else { LoadAction::Load },
                stencil_clear_value: ds.clear_stencil.unwrap_or(0),
                stencil_store_action: StoreAction::Store,
            }
        });
        let transition = self.encoder_sm.request(EncoderKind::Render);
        let chunk = self.queue.current_chunk_mut();
        if transition.close_current {
            chunk.push(close_command_for_kind(transition.close_kind));
        }
        chunk.push(Command::OpenRenderPass {
            colors: color_records,
            depth_stencil: ds_record,
            width,
            height,
            array_length: 1,
            sample_count: 1,
        });
        chunk.push(Command::CloseRenderPass);
        self.encoder_sm.flush();
    }

    /// Ensures a render encoder is active and its render pass reflects the
    /// current output-merger targets, absorbing any pending clears.
    fn ensure_render_encoder(&mut self) -> Result<()> {
        let needs_new_pass = self.encoder_sm.current().kind() != Some(EncoderKind::Render)
            || !self.clear_pass.is_empty();
        let transition = self.encoder_sm.request(EncoderKind::Render);
        if transition.close_current || needs_new_pass {
            let record = self.build_render_pass_records()?;
            let chunk = self.queue.current_chunk_mut();
            if transition.close_current {
                chunk.push(close_command_for_kind(transition.close_kind));
            }
            chunk.push(record);
            self.residency.reset();
            // A fresh encoder starts with backend-default viewport/scissor/
            // blend/stencil state, so whatever the application last set must
            // be re-applied even if it was already pushed to a now-closed
            // encoder.
            self.viewports_dirty = true;
            self.scissors_dirty = true;
            self.blend_color_dirty = true;
            self.stencil_ref_dirty = true;
        }
        Ok(())
    }

    fn ensure_compute_encoder(&mut self) -> Result<()> {
        let transition = self.encoder_sm.request(EncoderKind::Compute);
        if transition.close_current {
            self.queue.current_chunk_mut().push(close_command_for_kind(transition.close_kind));
        }
        if transition.open.is_some() {
            self.queue.current_chunk_mut().push(Command::OpenComputePass);
            self.residency.reset();
        }
        Ok(())
    }

    fn ensure_blit_encoder(&mut self, kind: EncoderKind) -> Result<()> {
        let transition = self.encoder_sm.request(kind);
        if transition.close_current {
            self.queue.current_chunk_mut().push(close_command_for_kind(transition.close_kind));
        }
        if transition.open.is_some() {
            self.queue.current_chunk_mut().push(Command::OpenBlitPass);
            self.residency.reset();
        }
        Ok(())
    }

    // -- PreDraw / PreDispatch ----------------------------------------------------

    fn pre_draw(&mut self) -> Result<()> {
        self.ensure_render_encoder()?;
        let handle = self
            .current_render_pipeline
            .ok_or_else(|| ContextError::invalid_argument("Draw called with no render pipeline bound"))?;

        if !self.encoder_sm.current().is_render_ready() {
            self.queue.current_chunk_mut().push(Command::SetRenderPipeline(handle));
            self.encoder_sm.mark_pipeline_ready(false)?;
        }

        let pipeline = self
            .render_pipelines
            .get(handle)
            .expect("current_render_pipeline always refers to a live pipeline")
            as *const CompiledRenderPipeline<B>;
        // SAFETY: `pipeline` does not alias `self` mutably; we only read
        // its reflection fields through this pointer while mutably
        // borrowing other disjoint fields of `self` below. Avoids cloning
        // the (potentially large) reflection structs per draw.
        let (vertex_reflection, pixel_reflection, vb_mask) = unsafe {
            let p = &*pipeline;
            (p.vertex_reflection, p.pixel_reflection, p.vertex_buffer_mask)
        };

        let mut commands = Vec::new();
        {
            let mut resolver = ContextArgResolver { backend: &self.backend, buffers: &self.buffers, textures: &self.textures, samplers: &self.samplers, backend_buffers: &self.backend_buffers, backend_textures: &self.backend_textures };
            argbuf::upload_stage(
                &mut commands,
                &mut self.queue.current_chunk_mut().argument_heap,
                &mut self.residency,
                ShaderStage::Vertex,
                30,
                &vertex_reflection,
                &mut self.state.vertex_stage.constant_buffers,
                &mut self.state.vertex_stage.shader_resources,
                &mut self.state.vertex_stage.samplers,
                &mut self.state.vertex_stage.unordered_access,
                &mut resolver,
            );
            argbuf::upload_stage(
                &mut commands,
                &mut self.queue.current_chunk_mut().argument_heap,
                &mut self.residency,
                ShaderStage::Fragment,
                30,
                &pixel_reflection,
                &mut self.state.pixel_stage.constant_buffers,
                &mut self.state.pixel_stage.shader_resources,
                &mut self.state.pixel_stage.samplers,
                &mut self.state.pixel_stage.unordered_access,
                &mut resolver,
            );

            if self.state.input_assembler.vertex_buffer_dirty & vb_mask != 0 {
                let mut entries = [VertexBufferTableEntry { buffer_handle: 0, stride: 0, length: 0 }; 32];
                for (slot, vb) in self.state.input_assembler.vertex_buffers.iter().enumerate() {
                    if slot >= 32 {
                        break;
                    }
                    if let Some(vb) = vb {
                        if let Some(res) = self.buffers.get(vb.buffer) {
                            if let Some(buf_alloc) = res.current_allocation().as_buffer() {
                                entries[slot] = VertexBufferTableEntry {
                                    buffer_handle: resolver.resolve_constant_buffer(vb.buffer, vb.offset),
                                    stride: vb.stride,
                                    length: buf_alloc.size as u32,
                                };
                            }
                        }
                    }
                }
                argbuf::upload_vertex_buffer_table(
                    &mut commands,
                    &mut self.queue.current_chunk_mut().argument_heap,
                    vb_mask,
                    &entries,
                );
                self.state.input_assembler.vertex_buffer_dirty &= !vb_mask;
            }
        }
        let chunk = self.queue.current_chunk_mut();
        for c in commands {
            chunk.push(c);
        }
        Ok(())
    }

    fn pre_dispatch(&mut self) -> Result<()> {
        self.ensure_compute_encoder()?;
        let handle = self
            .current_compute_pipeline
            .ok_or_else(|| ContextError::invalid_argument("Dispatch called with no compute pipeline bound"))?;

        let needs_set = self.encoder_sm.current() != crate::encoder_state::EncoderState::ComputePipelineReady;
        if needs_set {
            self.queue.current_chunk_mut().push(Command::SetComputePipeline(handle));
            self.encoder_sm.mark_pipeline_ready(false)?;
        }

        let reflection = self
            .compute_pipelines
            .get(handle)
            .expect("current_compute_pipeline always refers to a live pipeline")
            .reflection;

        let mut commands = Vec::new();
        {
            let mut resolver = ContextArgResolver { backend: &self.backend, buffers: &self.buffers, textures: &self.textures, samplers: &self.samplers, backend_buffers: &self.backend_buffers, backend_textures: &self.backend_textures };
            argbuf::upload_stage(
                &mut commands,
                &mut self.queue.current_chunk_mut().argument_heap,
                &mut self.residency,
                ShaderStage::Kernel,
                0,
                &reflection,
                &mut self.state.compute_stage.constant_buffers,
                &mut self.state.compute_stage.shader_resources,
                &mut self.state.compute_stage.samplers,
                &mut self.state.compute_stage.unordered_access,
                &mut resolver,
            );
        }
        let chunk = self.queue.current_chunk_mut();
        for c in commands {
            chunk.push(c);
        }
        Ok(())
    }

    // -- draw / dispatch ----------------------------------------------------------

    pub fn draw(&mut self, vertex_start: u32, vertex_count: u32, instance_count: u32) -> Result<()> {
        self.check_alive()?;
        self.pre_draw()?;
        let topology = self
            .state
            .input_assembler
            .topology
            .ok_or_else(|| ContextError::invalid_argument("Draw called with no primitive topology set"))?;
        self.queue.current_chunk_mut().push(Command::Draw { topology, vertex_start, vertex_count, instance_count });
        Ok(())
    }

    pub fn draw_indexed(&mut self, index_count: u32, instance_count: u32, base_vertex: i32) -> Result<()> {
        self.check_alive()?;
        self.pre_draw()?;
        let topology = self
            .state
            .input_assembler
            .topology
            .ok_or_else(|| ContextError::invalid_argument("DrawIndexed called with no primitive topology set"))?;
        let index_buffer = self
            .state
            .input_assembler
            .index_buffer
            .ok_or_else(|| ContextError::invalid_argument("DrawIndexed called with no index buffer bound"))?;
        let index_type = match self.state.input_assembler.index_format {
            Some(IndexFormat::U16) => IndexType::U16,
            Some(IndexFormat::U32) | None => IndexType::U32,
        };
        self.queue.current_chunk_mut().push(Command::DrawIndexed {
            topology,
            index_count,
            index_type,
            index_buffer,
            index_buffer_offset: self.state.input_assembler.index_offset,
            instance_count,
            base_vertex,
        });
        Ok(())
    }

    pub fn dispatch(&mut self, groups_x: u32, groups_y: u32, groups_z: u32) -> Result<()> {
        self.check_alive()?;
        self.pre_dispatch()?;
        self.queue.current_chunk_mut().push(Command::Dispatch { groups_x, groups_y, groups_z });
        Ok(())
    }

    // -- copy / update ------------------------------------------------------------

    pub fn copy_resource(
        &mut self,
        dst: ResourceHandle,
        dst_kind: ResourceKind,
        src: ResourceHandle,
        src_kind: ResourceKind,
    ) -> Result<()> {
        self.check_alive()?;
        let dispatch = copy::dispatch_copy(src_kind, dst_kind);
        match dispatch.blit_kind {
            BlitKind::Readback => self.ensure_blit_encoder(EncoderKind::ReadbackBlit)?,
            BlitKind::Update => self.ensure_blit_encoder(EncoderKind::UpdateBlit)?,
            BlitKind::Normal => self.ensure_blit_encoder(EncoderKind::Blit)?,
        }
        match (src, dst) {
            (ResourceHandle::Buffer(s), ResourceHandle::Buffer(d)) => {
                let size = self
                    .buffers
                    .get(s)
                    .and_then(|r| r.current_allocation().as_buffer().map(|b| b.size))
                    .ok_or_else(|| ContextError::invalid_argument("copy_resource: unknown src buffer"))?;
                self.queue.current_chunk_mut().push(Command::CopyBufferToBuffer {
                    src: s,
                    src_offset: 0,
                    dst: d,
                    dst_offset: 0,
                    size,
                });
            }
            (ResourceHandle::Texture(s), ResourceHandle::Texture(d)) => {
                let src_format = self
                    .textures
                    .get(s)
                    .and_then(|r| r.current_allocation().as_texture().map(|t| t.format))
                    .ok_or_else(|| ContextError::invalid_argument("copy_resource: unknown src texture"))?;
                let dst_extent = self
                    .textures
                    .get(d)
                    .and_then(|r| r.current_allocation().as_texture().map(|t| (t.format, t.extent)))
                    .ok_or_else(|| ContextError::invalid_argument("copy_resource: unknown dst texture"))?;
                let plan = copy::plan_texture_copy(src_format, dst_extent.0)?;
                if plan == CopyPlan::StagedThroughBuffer {
                    log::debug!("copy_resource: staging through temporary buffer for format cast");
                }
                self.queue.current_chunk_mut().push(Command::CopyTextureToTexture {
                    src: s,
                    src_level: 0,
                    src_slice: 0,
                    dst: d,
                    dst_level: 0,
                    dst_slice: 0,
                    width: dst_extent.1.width,
                    height: dst_extent.1.height,
                    depth: dst_extent.1.depth_or_array_layers,
                });
            }
            _ => {
                return Err(ContextError::invalid_argument(
                    "copy_resource: src/dst kind mismatch (buffer<->texture requires CopySubresourceRegion)",
                ));
            }
        }
        if dispatch.requires_readback_flush {
            log::debug!("copy_resource into staging: promoting next flush for map coherence");
        }
        Ok(())
    }

    pub fn copy_subresource_region(
        &mut self,
        dst: TextureHandle,
        dst_level: u32,
        dst_slice: u32,
        src: TextureHandle,
        src_level: u32,
        src_slice: u32,
        box_: CopyBox,
    ) -> Result<()> {
        self.check_alive()?;
        let dst_extent = self
            .textures
            .get(dst)
            .and_then(|r| r.current_allocation().as_texture().map(|t| t.extent))
            .ok_or_else(|| ContextError::invalid_argument("copy_subresource_region: unknown dst"))?;
        let clipped = box_.clipped_to(dst_extent.width, dst_extent.height, dst_extent.depth_or_array_layers);
        if clipped.is_empty() {
            return Ok(());
        }
        self.ensure_blit_encoder(EncoderKind::Blit)?;
        self.queue.current_chunk_mut().push(Command::CopyTextureToTexture {
            src,
            src_level,
            src_slice,
            dst,
            dst_level,
            dst_slice,
            width: clipped.width(),
            height: clipped.height(),
            depth: clipped.depth(),
        });
        Ok(())
    }

    pub fn update_subresource(
        &mut self,
        dst: TextureHandle,
        level: u32,
        slice: u32,
        data: &[u8],
        row_pitch: u32,
        required_row_alignment: u32,
        gpu_contended: bool,
    ) -> Result<()> {
        self.check_alive()?;
        let (format, extent) = self
            .textures
            .get(dst)
            .and_then(|r| r.current_allocation().as_texture().map(|t| (t.format, t.extent)))
            .ok_or_else(|| ContextError::invalid_argument("update_subresource: unknown texture"))?;

        if copy::can_replace_region_directly(ResourceKind::Default, gpu_contended) {
            let backend_texture = self.resolve_texture_backend(dst, ViewKey(0))?;
            self.backend.replace_texture_region(&backend_texture, level, slice, data, row_pitch);
            return Ok(());
        }

        let (bytes, src_bytes_per_row) = if copy::needs_row_repack(row_pitch, required_row_alignment) {
            let rows = extent.height.max(1);
            let row_bytes = (extent.width * format.texel_or_block_size()) / format.block_dim().0;
            (copy::repack_rows(data, row_bytes, row_pitch, required_row_alignment, rows), required_row_alignment)
        } else {
            (data.to_vec(), row_pitch)
        };

        let Some(staging_offset) = self.queue.staging_ring.alloc(bytes.len() as u32, 256) else {
            return Err(ContextError::OutOfMemory);
        };
        let staging_handle = self
            .staging_buffer
            .ok_or(ContextError::Unsupported("staging ring buffer was never created"))?;
        let staging_backend_buffer = self
            .resolve_buffer_backend(staging_handle)
            .ok_or(ContextError::Unsupported("staging ring buffer has no live backend object"))?;
        let ptr = self
            .backend
            .buffer_contents_ptr(&staging_backend_buffer)
            .ok_or(ContextError::Unsupported("staging ring buffer is not CPU-visible"))?;
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr.as_ptr().add(staging_offset as usize), bytes.len());
        }

        self.ensure_blit_encoder(EncoderKind::UpdateBlit)?;
        self.queue.current_chunk_mut().push(Command::CopyBufferToTexture {
            src: staging_handle,
            src_offset: staging_offset as u64,
            src_bytes_per_row,
            dst,
            level,
            slice,
            width: extent.width,
            height: extent.height,
            depth: 1,
        });
        log::trace!(
            "update_subresource: staged {} bytes for texture level {} slice {}",
            bytes.len(),
            level,
            slice
        );
        Ok(())
    }

    /// Resolves a texture handle's *base* backend object. `_view` is
    /// retained in the signature for callers that will eventually need
    /// subresource/format-cast view resolution (Metal texture views), which
    /// requires a backend-specific `build` closure analogous to
    /// `Resource::resolve_view` and is left to the Metal backend's own
    /// context wrapper.
    fn resolve_texture_backend(&self, handle: TextureHandle, _view: ViewKey) -> Result<B::Texture> {
        let res = self
            .textures
            .get(handle)
            .ok_or_else(|| ContextError::invalid_argument("resolve_texture_backend: unknown texture"))?;
        let alloc = res.current_allocation();
        let key = alloc_key(&alloc);
        self.backend_textures.get(&key).cloned().ok_or(ContextError::Unsupported(
            "texture has no live backend object (created through a different Context?)",
        ))
    }

    // -- map / unmap / discard ----------------------------------------------------

    pub fn map_write_discard_buffer(&mut self, handle: BufferHandle) -> Result<MappedSubresource> {
        self.check_alive()?;
        let res = self
            .buffers
            .get(handle)
            .ok_or_else(|| ContextError::invalid_argument("Map: unknown buffer"))?;
        let coherent = self.queue.coherent_seq_id(&self.backend);
        let pool = self.dynamic_pools.entry(ResourceHandle::Buffer(handle)).or_default();

        let size = res
            .current_allocation()
            .as_buffer()
            .map(|b| b.size)
            .ok_or_else(|| ContextError::invalid_argument("Map: not a buffer"))?;
        let flags = res.current_allocation().flags();

        let fresh = match pool.try_acquire(coherent) {
            Some(a) => a,
            None => {
                let (alloc, backend_buffer) = self.allocate_buffer(size, flags, res.debug_name.as_deref())?;
                self.backend_buffers.insert(alloc_key(&alloc), backend_buffer);
                alloc
            }
        };
        let ptr = fresh
            .as_buffer()
            .and_then(|b| b.cpu_ptr)
            .ok_or_else(|| ContextError::invalid_argument("Map: buffer is not CPU-visible"))?;
        let prev = res.rename(fresh);
        let captured_by_chunk = !self.queue.current_chunk().is_empty();
        self.dynamic_pools
            .get_mut(&ResourceHandle::Buffer(handle))
            .unwrap()
            .retire(prev, self.queue.coherent_seq_id(&self.backend), captured_by_chunk);

        self.state.vertex_stage.constant_buffers.invalidate_stale(|h, v| *h == handle && v < res.version());
        self.state.pixel_stage.constant_buffers.invalidate_stale(|h, v| *h == handle && v < res.version());
        self.state.compute_stage.constant_buffers.invalidate_stale(|h, v| *h == handle && v < res.version());

        Ok(MappedSubresource { ptr, row_pitch: size as u32, depth_pitch: size as u32 })
    }

    pub fn map_staging(
        &mut self,
        resource: ResourceHandle,
        map_type: MapType,
        flags: MapFlags,
    ) -> Result<MapOutcome> {
        self.check_alive()?;
        let coherent = self.queue.coherent_seq_id(&self.backend);
        let staging = self.staging.entry(resource).or_default();
        let outcome = match map_type {
            MapType::Read | MapType::ReadWrite => staging.try_map_read(coherent, flags.do_not_wait),
            MapType::WriteDiscard => staging.try_map_write_discard(coherent, flags.do_not_wait),
            MapType::Write | MapType::WriteNoOverwrite => MapOutcome::Mapped,
        };
        if let MapOutcome::WouldBlockForSequences(_) = outcome {
            if flags.do_not_wait {
                return Err(ContextError::WouldBlock);
            }
        }
        Ok(outcome)
    }

    pub fn unmap(&mut self, _handle: BufferHandle) {
        // Map/Unmap on non-dynamic, non-staging resources is a no-op at
        // this layer (the CPU-visible pointer was already live); dynamic
        // renaming happened eagerly in `map_write_discard_buffer`.
    }

    // -- occlusion queries --------------------------------------------------------

    pub fn create_query(&mut self) -> QueryHandle {
        self.queries.insert(OcclusionQuery::new())
    }

    pub fn begin_query(&mut self, handle: QueryHandle) -> Result<()> {
        let offset = self.queue.current_chunk_mut().allocate_visibility_slot();
        let seq_id = self.queue.current_chunk().seq_id;
        self.queries
            .get_mut(handle)
            .ok_or_else(|| ContextError::invalid_argument("begin_query: unknown query"))?
            .begin(offset, seq_id)?;
        self.active_query_offset = Some(offset);
        if self.encoder_sm.current().kind() == Some(EncoderKind::Render) {
            self.queue
                .current_chunk_mut()
                .push(Command::SetVisibilityResultMode { counting: true, offset });
        }
        Ok(())
    }

    pub fn end_query(&mut self, handle: QueryHandle) -> Result<()> {
        self.queries
            .get_mut(handle)
            .ok_or_else(|| ContextError::invalid_argument("end_query: unknown query"))?
            .end()?;
        self.active_query_offset = None;
        Ok(())
    }

    pub fn get_query_data(&mut self, handle: QueryHandle) -> Result<Option<u64>> {
        let coherent = self.queue.coherent_seq_id(&self.backend);
        let query = self
            .queries
            .get_mut(handle)
            .ok_or_else(|| ContextError::invalid_argument("get_query_data: unknown query"))?;
        let results = match query.ended_chunk_seq_id() {
            Some(seq_id) => self
                .queue
                .chunk_visibility_results(seq_id)
                .copied()
                .unwrap_or([0; OCCLUSION_SAMPLE_COUNT]),
            None => [0; OCCLUSION_SAMPLE_COUNT],
        };
        Ok(query.get_data(coherent, &results))
    }

    /// Reports the GPU visibility-result buffer read back for a completed
    /// chunk. Called from the backend's command-buffer completion handler;
    /// a no-op if that chunk has already cycled out of the ring.
    pub fn report_query_results(&mut self, seq_id: SequenceId, results: [u64; OCCLUSION_SAMPLE_COUNT]) {
        self.queue.report_chunk_visibility_results(seq_id, results);
    }

    // -- flush / submit ---------------------------------------------------------------

    /// Closes any open encoder, absorbs or flushes pending clears, and
    /// submits the current chunk's commands to the backend, returning the
    /// sequence id that identifies this submission. Never blocks;
    /// completion is observed via event poll.
    pub fn flush(&mut self) -> Result<SequenceId> {
        self.check_alive()?;
        self.flush_orphaned_clears();
        let transition = self.encoder_sm.flush();
        if transition.close_current {
            self.queue.current_chunk_mut().push(close_command_for_kind(transition.close_kind));
        }
        self.residency.reset();

        let cb = self.backend.new_command_buffer();
        self.replay_chunk(&cb)?;
        let pending_seq_id = self.queue.peek_next_seq_id();
        self.backend.encode_signal_event(&cb, self.queue.timeline_event(), pending_seq_id.0);
        self.backend.commit(&cb);

        match self.backend.command_buffer_status(&cb) {
            CommandBufferStatus::Error => {
                self.queue.latch_device_lost("command buffer completed with an error status");
            }
            _ => {}
        }

        let seq_id = self.queue.retire_current_chunk(&self.backend)?;
        self.frame_counter += 1;
        Ok(seq_id)
    }

    pub fn wait_for_completion(&mut self, seq_id: SequenceId, timeout: Duration) -> bool {
        self.queue.wait_for_completion(&self.backend, seq_id, timeout)
    }

    /// Walks the just-recorded chunk's commands, resolving handles to
    /// backend objects and issuing the matching encoder calls. A thin,
    /// backend-agnostic replay loop; the heavy lifting (actual Metal calls)
    /// lives behind `Backend`.
    fn replay_chunk(&mut self, cb: &B::CommandBuffer) -> Result<()> {
        let commands: Vec<Command> = self.queue.current_chunk().commands().to_vec();
        let mut render_encoder: Option<B::RenderEncoder> = None;
        let mut compute_encoder: Option<B::ComputeEncoder> = None;
        let mut blit_encoder: Option<B::BlitEncoder> = None;

        // The argument heap only has a CPU-side mirror until replay time;
        // the commands that bind regions of it need a real backend buffer.
        // Built once per chunk and left for Metal's automatic resource
        // retention to keep alive once this command buffer commits.
        let needs_argument_buffer = commands.iter().any(|c| {
            matches!(c, Command::SetArgumentBufferOffset { .. } | Command::SetVertexBufferTable { .. })
        });
        let argument_heap_buffer: Option<B::Buffer> = if needs_argument_buffer {
            let heap_bytes = self.queue.current_chunk().argument_heap.bytes();
            let desc = BufferDesc {
                size: heap_bytes.len() as u64,
                usage: crate::format::BufferUsage::SHADER_READ,
                flags: AllocationFlags::SHARED,
            };
            self.backend.create_buffer(&desc).ok().map(|buffer| {
                if let Some(ptr) = self.backend.buffer_contents_ptr(&buffer) {
                    unsafe { std::ptr::copy_nonoverlapping(heap_bytes.as_ptr(), ptr.as_ptr(), heap_bytes.len()) };
                }
                buffer
            })
        } else {
            None
        };

        for command in commands {
            match command {
                Command::OpenRenderPass { colors, depth_stencil, width, height, array_length, sample_count } => {
                    let color_textures: Vec<B::Texture> = colors
                        .iter()
                        .map(|c| self.resolve_texture_backend(c.texture, c.view))
                        .collect::<Result<Vec<_>>>()?;
                    let mut color_attachments: SmallVec<[ColorAttachment<'_, B>; MAX_COLOR_ATTACHMENTS]> =
                        SmallVec::new();
                    for (record, texture) in colors.iter().zip(color_textures.iter()) {
                        color_attachments.push(ColorAttachment {
                            texture,
                            level: 0,
                            slice: 0,
                            depth_plane: 0,
                            load_action: record.load_action,
                            clear_color: record.clear_color,
                            store_action: record.store_action,
                            resolve_target: None,
                        });
                    }
                    let depth_texture = match &depth_stencil {
                        Some(ds) => Some(self.resolve_texture_backend(ds.texture, ds.view)?),
                        None => None,
                    };
                    let depth_attachment = match (&depth_stencil, &depth_texture) {
                        (Some(record), Some(texture)) => Some(DepthStencilAttachment {
                            texture,
                            level: 0,
                            slice: 0,
                            depth_load_action: record.depth_load_action,
                            depth_clear_value: record.depth_clear_value,
                            depth_store_action: record.depth_store_action,
                            stencil_load_action: record.stencil_load_action,
                            stencil_clear_value: record.stencil_clear_value,
                            stencil_store_action: record.stencil_store_action,
                        }),
                        _ => None,
                    };
                    let desc = RenderPassDescriptor {
                        colors: color_attachments,
                        depth_stencil: depth_attachment,
                        width,
                        height,
                        array_length,
                        sample_count,
                        visibility_result_buffer: None,
                    };
                    render_encoder = Some(self.backend.begin_render_pass(cb, &desc));
                }
                Command::CloseRenderPass => {
                    if let Some(enc) = render_encoder.take() {
                        self.backend.end_render_encoding(enc);
                    }
                }
                Command::OpenComputePass => {
                    compute_encoder = Some(self.backend.begin_compute_pass(cb));
                }
                Command::CloseComputePass => {
                    if let Some(enc) = compute_encoder.take() {
                        self.backend.end_compute_encoding(enc);
                    }
                }
                Command::OpenBlitPass => {
                    blit_encoder = Some(self.backend.begin_blit_pass(cb));
                }
                Command::CloseBlitPass => {
                    if let Some(enc) = blit_encoder.take() {
                        self.backend.end_blit_encoding(enc);
                    }
                }
                Command::SetRenderPipeline(handle) => {
                    if let (Some(enc), Some(p)) = (render_encoder.as_mut(), self.render_pipelines.get(handle)) {
                        self.backend.set_render_pipeline_state(enc, &p.pso);
                    }
                }
                Command::SetComputePipeline(handle) => {
                    if let (Some(enc), Some(p)) = (compute_encoder.as_mut(), self.compute_pipelines.get(handle)) {
                        self.backend.set_compute_pipeline_state(enc, &p.pso);
                    }
                }
                Command::Draw { topology, vertex_start, vertex_count, instance_count } => {
                    if let Some(enc) = render_encoder.as_mut() {
                        self.backend.draw_primitives(enc, topology, vertex_start, vertex_count, instance_count);
                    }
                }
                Command::DrawIndexed {
                    topology,
                    index_count,
                    index_type,
                    index_buffer,
                    index_buffer_offset,
                    instance_count,
                    base_vertex,
                } => {
                    if let Some(enc) = render_encoder.as_mut() {
                        if let Some(buffer) = self.resolve_buffer_backend(index_buffer) {
                            self.backend.draw_indexed_primitives(
                                enc,
                                topology,
                                index_count,
                                index_type,
                                &buffer,
                                index_buffer_offset as u64,
                                instance_count,
                                base_vertex,
                            );
                        }
                    }
                }
                Command::Dispatch { groups_x, groups_y, groups_z } => {
                    if let Some(enc) = compute_encoder.as_mut() {
                        self.backend.dispatch_threadgroups(enc, groups_x, groups_y, groups_z, 1, 1, 1);
                    }
                }
                Command::CopyBufferToBuffer { src, src_offset, dst, dst_offset, size } => {
                    if let (Some(enc), Some(s), Some(d)) =
                        (blit_encoder.as_mut(), self.resolve_buffer_backend(src), self.resolve_buffer_backend(dst))
                    {
                        self.backend.copy_buffer_to_buffer(enc, &s, src_offset, &d, dst_offset, size);
                    }
                }
                Command::CopyTextureToTexture {
                    src,
                    src_level,
                    src_slice,
                    dst,
                    dst_level,
                    dst_slice,
                    width,
                    height,
                    depth,
                } => {
                    let s = self.resolve_texture_backend(src, ViewKey(0))?;
                    let d = self.resolve_texture_backend(dst, ViewKey(0))?;
                    if let Some(enc) = blit_encoder.as_mut() {
                        self.backend.copy_texture_to_texture(
                            enc, &s, src_level, src_slice, &d, dst_level, dst_slice, width, height, depth,
                        );
                    }
                }
                Command::SetViewports(viewports) => {
                    if let Some(enc) = render_encoder.as_mut() {
                        for vp in &viewports {
                            self.backend.set_viewport(enc, vp.x, vp.y, vp.width, vp.height, vp.min_depth, vp.max_depth);
                        }
                    }
                }
                Command::SetScissors(scissors) => {
                    if let Some(enc) = render_encoder.as_mut() {
                        for sc in &scissors {
                            self.backend.set_scissor_rect(enc, sc.x, sc.y, sc.width, sc.height);
                        }
                    }
                }
                Command::SetBlendColor(c) => {
                    if let Some(enc) = render_encoder.as_mut() {
                        self.backend.set_blend_color(enc, c[0], c[1], c[2], c[3]);
                    }
                }
                Command::SetStencilRef(v) => {
                    if let Some(enc) = render_encoder.as_mut() {
                        self.backend.set_stencil_reference_value(enc, v);
                    }
                }
                Command::SetVisibilityResultMode { counting, offset } => {
                    if let Some(enc) = render_encoder.as_mut() {
                        let mode = if counting { VisibilityResultMode::Counting } else { VisibilityResultMode::Disabled };
                        self.backend.set_visibility_result_mode(enc, mode, offset);
                    }
                }
                Command::SetArgumentBufferOffset { stage, slot, heap_offset } => {
                    if let Some(buffer) = argument_heap_buffer.as_ref() {
                        let offset = heap_offset as u64;
                        match stage {
                            ShaderStage::Vertex => {
                                if let Some(enc) = render_encoder.as_mut() {
                                    self.backend.set_vertex_buffer(enc, slot, buffer, offset);
                                }
                            }
                            ShaderStage::Fragment => {
                                if let Some(enc) = render_encoder.as_mut() {
                                    self.backend.set_fragment_buffer(enc, slot, buffer, offset);
                                }
                            }
                            ShaderStage::Kernel => {
                                if let Some(enc) = compute_encoder.as_mut() {
                                    self.backend.set_compute_buffer(enc, slot, buffer, offset);
                                }
                            }
                        }
                    }
                }
                Command::SetVertexBufferTable { heap_offset } => {
                    if let (Some(enc), Some(buffer)) = (render_encoder.as_mut(), argument_heap_buffer.as_ref()) {
                        self.backend.set_vertex_buffer(enc, VERTEX_BUFFER_TABLE_SLOT, buffer, heap_offset as u64);
                    }
                }
                Command::UseResource { resource, usage, stage } => match resource {
                    ResourceHandle::Buffer(handle) => {
                        if let Some(buffer) = self.resolve_buffer_backend(handle) {
                            if let Some(enc) = render_encoder.as_mut() {
                                self.backend.use_resource_render(enc, &buffer, usage, stage);
                            } else if let Some(enc) = compute_encoder.as_mut() {
                                self.backend.use_resource_compute(enc, &buffer, usage);
                            }
                        }
                    }
                    ResourceHandle::Texture(handle) => {
                        if let Some(texture) = self.resolve_texture_backend_opt(handle) {
                            if let Some(enc) = render_encoder.as_mut() {
                                self.backend.use_texture_render(enc, &texture, usage, stage);
                            } else if let Some(enc) = compute_encoder.as_mut() {
                                self.backend.use_texture_compute(enc, &texture, usage);
                            }
                        }
                    }
                },
                Command::CopyBufferToTexture {
                    src,
                    src_offset,
                    src_bytes_per_row,
                    dst,
                    level,
                    slice,
                    width,
                    height,
                    depth,
                } => {
                    if let Some(source) = self.resolve_buffer_backend(src) {
                        let destination = self.resolve_texture_backend(dst, ViewKey(0))?;
                        if let Some(enc) = blit_encoder.as_mut() {
                            self.backend.copy_buffer_to_texture(
                                enc, &source, src_offset, src_bytes_per_row, &destination, level, slice, width,
                                height, depth,
                            );
                        }
                    }
                }
                Command::CopyTextureToBuffer {
                    src,
                    level,
                    slice,
                    dst,
                    dst_offset,
                    dst_bytes_per_row,
                    width,
                    height,
                    depth,
                } => {
                    let source = self.resolve_texture_backend(src, ViewKey(0))?;
                    if let Some(destination) = self.resolve_buffer_backend(dst) {
                        if let Some(enc) = blit_encoder.as_mut() {
                            self.backend.copy_texture_to_buffer(
                                enc, &source, level, slice, &destination, dst_offset, dst_bytes_per_row, width,
                                height, depth,
                            );
                        }
                    }
                }
                Command::SetDepthStencilState | Command::PipelineBarrier | Command::Present => {}
            }
        }

        if let Some(enc) = render_encoder.take() {
            self.backend.end_render_encoding(enc);
        }
        if let Some(enc) = compute_encoder.take() {
            self.backend.end_compute_encoding(enc);
        }
        if let Some(enc) = blit_encoder.take() {
            self.backend.end_blit_encoding(enc);
        }
        Ok(())
    }

    fn resolve_buffer_backend(&self, handle: BufferHandle) -> Option<B::Buffer> {
        let res = self.buffers.get(handle)?;
        let alloc = res.current_allocation();
        self.backend_buffers.get(&alloc_key(&alloc)).cloned()
    }

    /// As `resolve_texture_backend`, but `None` instead of an error on a
    /// miss -- used by `UseResource`, where a stale residency declaration
    /// for an already-destroyed texture should be dropped, not fatal.
    fn resolve_texture_backend_opt(&self, handle: TextureHandle) -> Option<B::Texture> {
        let res = self.textures.get(handle)?;
        let alloc = res.current_allocation();
        self.backend_textures.get(&alloc_key(&alloc)).cloned()
    }
}

/// Resolves handles bound in a `BindingSet` into the raw bytes the
/// argument-buffer upload writes. Reads straight from the resource
/// tables and the backend; never mutates context state.
struct ContextArgResolver<'a, B: Backend> {
    backend: &'a B,
    buffers: &'a SlotMap<BufferHandle, Resource<B>>,
    textures: &'a SlotMap<TextureHandle, Resource<B>>,
    samplers: &'a SlotMap<SamplerHandle, B::Sampler>,
    backend_buffers: &'a FxHashMap<usize, B::Buffer>,
    backend_textures: &'a FxHashMap<usize, B::Texture>,
}

impl<'a, B: Backend> ArgumentResolver for ContextArgResolver<'a, B> {
    fn resolve_constant_buffer(&mut self, handle: BufferHandle, offset: u32) -> u64 {
        let Some(res) = self.buffers.get(handle) else { return 0 };
        let alloc = res.current_allocation();
        let Some(buffer) = self.backend_buffers.get(&alloc_key(&alloc)) else { return 0 };
        self.backend.buffer_gpu_address(buffer) + offset as u64
    }

    fn resolve_shader_resource(&mut self, view: ResourceView) -> (u64, u64) {
        match view.resource {
            ResourceHandle::Texture(t) => {
                let Some(res) = self.textures.get(t) else { return (0, 0) };
                let alloc = res.current_allocation();
                let id = self
                    .backend_textures
                    .get(&alloc_key(&alloc))
                    .map(|tex| self.backend.texture_gpu_resource_id(tex))
                    .unwrap_or(0);
                (id, 0)
            }
            ResourceHandle::Buffer(b) => {
                let Some(res) = self.buffers.get(b) else { return (0, 0) };
                let alloc = res.current_allocation();
                let size = alloc.as_buffer().map(|a| a.size).unwrap_or(0);
                let addr = self
                    .backend_buffers
                    .get(&alloc_key(&alloc))
                    .map(|buf| self.backend.buffer_gpu_address(buf))
                    .unwrap_or(0);
                (addr, size)
            }
        }
    }

    fn resolve_sampler(&mut self, handle: SamplerHandle) -> u64 {
        self.samplers.get(handle).map(|s| self.backend.sampler_gpu_resource_id(s)).unwrap_or(0)
    }

    fn resolve_unordered_access(&mut self, view: ResourceView) -> (u64, u64) {
        self.resolve_shader_resource(view)
    }
}
