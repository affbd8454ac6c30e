//! The `Backend` trait: a thin `MTL::*` abstraction over the GPU backend.
//! `dxmtl-core` is generic over it; `dxmtl-metal` provides the concrete
//! implementation against Apple's Metal API.
//!
//! Mirrors the shape of a conventional backend-object trait set
//! (`Buffer`, `Image`, ...), but uses associated types
//! rather than `Downcast` trait objects: the core never needs to hold a
//! `Backend`-erased object, only `Context<B>` parameterized over one `B`.

use std::fmt::Debug;
use std::time::Duration;

use crate::allocation::{AllocationFlags, TextureExtent};
use crate::format::{BufferUsage, PixelFormat, TextureUsage};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CommandBufferStatus {
    Enqueued,
    Committed,
    Scheduled,
    Completed,
    Error,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum LoadAction {
    Load,
    Clear,
    DontCare,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum StoreAction {
    Store,
    DontCare,
    MultisampleResolve,
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct ClearColor {
    pub r: f64,
    pub g: f64,
    pub b: f64,
    pub a: f64,
}

#[derive(Copy, Clone, Debug)]
pub struct BufferDesc {
    pub size: u64,
    pub usage: BufferUsage,
    pub flags: AllocationFlags,
}

#[derive(Copy, Clone, Debug)]
pub struct TextureDesc {
    pub format: PixelFormat,
    pub extent: TextureExtent,
    pub sample_count: u32,
    pub usage: TextureUsage,
    pub flags: AllocationFlags,
}

#[derive(Copy, Clone, Debug)]
pub struct SamplerDesc {
    pub clamp_to_edge: bool,
    pub linear_filter: bool,
    pub max_anisotropy: u32,
}

/// One color attachment or the depth/stencil attachment of a render pass,
/// as assembled by the clear-pass-coalescing step.
pub struct ColorAttachment<'a, B: Backend> {
    pub texture: &'a B::Texture,
    pub level: u32,
    pub slice: u32,
    pub depth_plane: u32,
    pub load_action: LoadAction,
    pub clear_color: ClearColor,
    pub store_action: StoreAction,
    pub resolve_target: Option<&'a B::Texture>,
}

pub struct DepthStencilAttachment<'a, B: Backend> {
    pub texture: &'a B::Texture,
    pub level: u32,
    pub slice: u32,
    pub depth_load_action: LoadAction,
    pub depth_clear_value: f32,
    pub depth_store_action: StoreAction,
    pub stencil_load_action: LoadAction,
    pub stencil_clear_value: u32,
    pub stencil_store_action: StoreAction,
}

pub struct RenderPassDescriptor<'a, B: Backend> {
    pub colors: smallvec::SmallVec<[ColorAttachment<'a, B>; 8]>,
    pub depth_stencil: Option<DepthStencilAttachment<'a, B>>,
    pub width: u32,
    pub height: u32,
    pub array_length: u32,
    pub sample_count: u32,
    pub visibility_result_buffer: Option<&'a B::Buffer>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PrimitiveTopology {
    PointList,
    LineList,
    LineStrip,
    TriangleList,
    TriangleStrip,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum IndexType {
    U16,
    U32,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ResourceUsage {
    Read,
    Write,
    ReadWrite,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ShaderStage {
    Vertex,
    Fragment,
    Kernel,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum VisibilityResultMode {
    Disabled,
    Boolean,
    Counting,
}

/// Implemented once per GPU backend. Every associated type is an opaque
/// handle/object owned by the backend; the core never inspects their
/// contents, only passes them back through these methods.
pub trait Backend: Sized + 'static {
    type Error: std::error::Error + Send + Sync + 'static;

    type Buffer: Debug + Clone;
    type Texture: Debug + Clone;
    type Sampler: Debug + Clone;
    type RenderPipelineState: Debug + Clone;
    type ComputePipelineState: Debug + Clone;
    type DepthStencilState: Debug + Clone;
    type CommandBuffer: Debug;
    type RenderEncoder;
    type ComputeEncoder;
    type BlitEncoder;
    /// A shared CPU/GPU event used to signal chunk completion.
    type Event: Clone;

    // -- resource creation -------------------------------------------------
    fn create_buffer(&self, desc: &BufferDesc) -> Result<Self::Buffer, Self::Error>;
    fn create_texture(&self, desc: &TextureDesc) -> Result<Self::Texture, Self::Error>;
    fn create_sampler(&self, desc: &SamplerDesc) -> Result<Self::Sampler, Self::Error>;
    fn set_buffer_label(&self, buffer: &Self::Buffer, label: &str);
    fn set_texture_label(&self, texture: &Self::Texture, label: &str);
    /// Pointer to the start of a CPU-mapped buffer's contents, or `None` if
    /// the buffer was created GPU-private.
    fn buffer_contents_ptr(&self, buffer: &Self::Buffer) -> Option<std::ptr::NonNull<u8>>;
    fn buffer_gpu_address(&self, buffer: &Self::Buffer) -> u64;
    /// The resource id written into an argument-buffer slot that binds a
    /// texture (Metal's `MTLResource.gpuResourceID`, Tier 2 argument
    /// buffers). Opaque to the core.
    fn texture_gpu_resource_id(&self, texture: &Self::Texture) -> u64;
    /// As `texture_gpu_resource_id`, for samplers.
    fn sampler_gpu_resource_id(&self, sampler: &Self::Sampler) -> u64;
    fn replace_texture_region(
        &self,
        texture: &Self::Texture,
        level: u32,
        slice: u32,
        data: &[u8],
        bytes_per_row: u32,
    );

    // -- queue / command buffer --------------------------------------------
    fn new_command_buffer(&self) -> Self::CommandBuffer;
    fn commit(&self, cb: &Self::CommandBuffer);
    fn command_buffer_status(&self, cb: &Self::CommandBuffer) -> CommandBufferStatus;
    fn new_shared_event(&self) -> Self::Event;
    fn encode_signal_event(&self, cb: &Self::CommandBuffer, event: &Self::Event, value: u64);
    fn event_signaled_value(&self, event: &Self::Event) -> u64;
    /// Blocks the calling thread until `event` reaches `value` or `timeout`
    /// elapses. Returns `true` if the value was reached.
    fn event_wait(&self, event: &Self::Event, value: u64, timeout: Duration) -> bool;

    // -- render encoder -----------------------------------------------------
    fn begin_render_pass(
        &self,
        cb: &Self::CommandBuffer,
        desc: &RenderPassDescriptor<'_, Self>,
    ) -> Self::RenderEncoder;
    fn end_render_encoding(&self, enc: Self::RenderEncoder);
    fn set_render_pipeline_state(&self, enc: &mut Self::RenderEncoder, pso: &Self::RenderPipelineState);
    fn set_depth_stencil_state(&self, enc: &mut Self::RenderEncoder, dss: &Self::DepthStencilState);
    fn set_vertex_buffer(&self, enc: &mut Self::RenderEncoder, index: u32, buffer: &Self::Buffer, offset: u64);
    fn set_fragment_buffer(&self, enc: &mut Self::RenderEncoder, index: u32, buffer: &Self::Buffer, offset: u64);
    fn set_viewport(&self, enc: &mut Self::RenderEncoder, x: f32, y: f32, w: f32, h: f32, near: f32, far: f32);
    fn set_scissor_rect(&self, enc: &mut Self::RenderEncoder, x: u32, y: u32, w: u32, h: u32);
    fn set_blend_color(&self, enc: &mut Self::RenderEncoder, r: f32, g: f32, b: f32, a: f32);
    fn set_stencil_reference_value(&self, enc: &mut Self::RenderEncoder, value: u32);
    fn set_visibility_result_mode(&self, enc: &mut Self::RenderEncoder, mode: VisibilityResultMode, offset: u64);
    fn use_resource_render(&self, enc: &mut Self::RenderEncoder, buffer: &Self::Buffer, usage: ResourceUsage, stage: ShaderStage);
    fn use_texture_render(&self, enc: &mut Self::RenderEncoder, texture: &Self::Texture, usage: ResourceUsage, stage: ShaderStage);
    fn draw_primitives(&self, enc: &mut Self::RenderEncoder, topology: PrimitiveTopology, vertex_start: u32, vertex_count: u32, instance_count: u32);
    fn draw_indexed_primitives(
        &self,
        enc: &mut Self::RenderEncoder,
        topology: PrimitiveTopology,
        index_count: u32,
        index_type: IndexType,
        index_buffer: &Self::Buffer,
        index_buffer_offset: u64,
        instance_count: u32,
        base_vertex: i32,
    );

    // -- compute encoder ----------------------------------------------------
    fn begin_compute_pass(&self, cb: &Self::CommandBuffer) -> Self::ComputeEncoder;
    fn end_compute_encoding(&self, enc: Self::ComputeEncoder);
    fn set_compute_pipeline_state(&self, enc: &mut Self::ComputeEncoder, pso: &Self::ComputePipelineState);
    fn set_compute_buffer(&self, enc: &mut Self::ComputeEncoder, index: u32, buffer: &Self::Buffer, offset: u64);
    fn use_resource_compute(&self, enc: &mut Self::ComputeEncoder, buffer: &Self::Buffer, usage: ResourceUsage);
    fn use_texture_compute(&self, enc: &mut Self::ComputeEncoder, texture: &Self::Texture, usage: ResourceUsage);
    fn dispatch_threadgroups(&self, enc: &mut Self::ComputeEncoder, groups_x: u32, groups_y: u32, groups_z: u32, tg_x: u32, tg_y: u32, tg_z: u32);

    // -- blit encoder ---------------------------------------------------------
    fn begin_blit_pass(&self, cb: &Self::CommandBuffer) -> Self::BlitEncoder;
    fn end_blit_encoding(&self, enc: Self::BlitEncoder);
    fn copy_buffer_to_buffer(&self, enc: &mut Self::BlitEncoder, src: &Self::Buffer, src_offset: u64, dst: &Self::Buffer, dst_offset: u64, size: u64);
    fn copy_buffer_to_texture(&self, enc: &mut Self::BlitEncoder, src: &Self::Buffer, src_offset: u64, src_bytes_per_row: u32, dst: &Self::Texture, level: u32, slice: u32, width: u32, height: u32, depth: u32);
    fn copy_texture_to_buffer(&self, enc: &mut Self::BlitEncoder, src: &Self::Texture, level: u32, slice: u32, dst: &Self::Buffer, dst_offset: u64, dst_bytes_per_row: u32, width: u32, height: u32, depth: u32);
    fn copy_texture_to_texture(&self, enc: &mut Self::BlitEncoder, src: &Self::Texture, src_level: u32, src_slice: u32, dst: &Self::Texture, dst_level: u32, dst_slice: u32, width: u32, height: u32, depth: u32);
}
