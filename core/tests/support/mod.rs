//! Shared test-only `Backend` and `PipelineCompiler` used by the
//! integration suites under `core/tests/`. Metal is unavailable in CI,
//! so these scenarios drive `Context` against a backend that keeps real
//! CPU-side storage for buffers and textures and asserts on the command
//! chunk `Context` records, rather than on actual GPU-rendered pixels.
//!
//! Grounded in the `FakeBackend` test doubles already living inside
//! `queue.rs`, `pipeline.rs`, `resource.rs` and `context.rs`'s own
//! `#[cfg(test)]` modules; this version additionally backs buffers and
//! textures with real bytes so scenario tests can assert on upload and
//! copy contents, not just on which `Command` variants were recorded.

#![allow(dead_code)]

use std::collections::HashMap;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dxmtl_core::backend::{
    Backend, BufferDesc, CommandBufferStatus, IndexType, PrimitiveTopology, RenderPassDescriptor,
    ResourceUsage, SamplerDesc, ShaderStage, TextureDesc, VisibilityResultMode,
};
use dxmtl_core::pipeline::{ComputePipelineDesc, PipelineCompiler, RenderPipelineDesc};

#[derive(Clone, Debug)]
pub struct FakeEvent {
    value: Arc<AtomicU64>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FakeBuffer(pub u64);

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FakeTexture(pub u64);

struct BufferStorage {
    bytes: &'static mut [u8],
}

struct TextureStorage {
    bytes: Mutex<Vec<u8>>,
}

/// Records the replaceRegion/copy calls a scenario wants to assert on
/// beyond what the recorded `Command` stream already captures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordedCall {
    ReplaceTextureRegion { texture: u64, level: u32, slice: u32, len: usize },
    CopyTextureToTexture { src: u64, dst: u64 },
}

/// Shared state behind a `FakeBackend`. `Context` takes ownership of the
/// backend by value, so introspection from the test goes through a cloned
/// `Arc` to this instead of through `Context` itself.
#[derive(Default)]
struct FakeBackendState {
    next_id: AtomicU64,
    buffers: Mutex<HashMap<u64, BufferStorage>>,
    textures: Mutex<HashMap<u64, TextureStorage>>,
    calls: Mutex<Vec<RecordedCall>>,
}

/// A cheaply-cloned handle onto a `FakeBackend`'s introspectable state:
/// recorded replaceRegion/copy calls and texture backing bytes.
#[derive(Clone)]
pub struct FakeBackendHandle(Arc<FakeBackendState>);

impl FakeBackendHandle {
    pub fn calls(&self) -> Vec<RecordedCall> {
        self.0.calls.lock().unwrap().clone()
    }

    /// Snapshot of a texture's backing bytes, for scenarios that verify a
    /// device-to-device copy actually moved data.
    pub fn texture_bytes(&self, texture: &FakeTexture) -> Vec<u8> {
        self.0.textures.lock().unwrap()[&texture.0].bytes.lock().unwrap().clone()
    }
}

pub struct FakeBackend {
    state: Arc<FakeBackendState>,
}

impl FakeBackend {
    pub fn new() -> (FakeBackend, FakeBackendHandle) {
        let state = Arc::new(FakeBackendState {
            next_id: AtomicU64::new(1),
            ..Default::default()
        });
        (FakeBackend { state: state.clone() }, FakeBackendHandle(state))
    }

    fn seed_texture(&self, id: u64, size_hint: usize) {
        self.state
            .textures
            .lock()
            .unwrap()
            .insert(id, TextureStorage { bytes: Mutex::new(vec![0u8; size_hint.max(1)]) });
    }
}

impl Backend for FakeBackend {
    type Error = std::convert::Infallible;
    type Buffer = FakeBuffer;
    type Texture = FakeTexture;
    type Sampler = ();
    type RenderPipelineState = ();
    type ComputePipelineState = ();
    type DepthStencilState = ();
    type CommandBuffer = ();
    type RenderEncoder = ();
    type ComputeEncoder = ();
    type BlitEncoder = ();
    type Event = FakeEvent;

    fn create_buffer(&self, desc: &BufferDesc) -> Result<Self::Buffer, Self::Error> {
        let id = self.state.next_id.fetch_add(1, Ordering::SeqCst);
        let boxed: Box<[u8]> = vec![0u8; desc.size as usize].into_boxed_slice();
        let leaked: &'static mut [u8] = Box::leak(boxed);
        self.state.buffers.lock().unwrap().insert(id, BufferStorage { bytes: leaked });
        Ok(FakeBuffer(id))
    }

    fn create_texture(&self, desc: &TextureDesc) -> Result<Self::Texture, Self::Error> {
        let id = self.state.next_id.fetch_add(1, Ordering::SeqCst);
        let texel_size = desc.format.texel_or_block_size() as usize;
        let blocks = desc.extent.width.max(1) as usize * desc.extent.height.max(1) as usize;
        self.seed_texture(id, blocks * texel_size);
        Ok(FakeTexture(id))
    }

    fn create_sampler(&self, _: &SamplerDesc) -> Result<Self::Sampler, Self::Error> {
        Ok(())
    }

    fn set_buffer_label(&self, _: &Self::Buffer, _: &str) {}
    fn set_texture_label(&self, _: &Self::Texture, _: &str) {}

    fn buffer_contents_ptr(&self, buffer: &Self::Buffer) -> Option<NonNull<u8>> {
        let buffers = self.state.buffers.lock().unwrap();
        let storage = buffers.get(&buffer.0)?;
        NonNull::new(storage.bytes.as_ptr() as *mut u8)
    }

    fn buffer_gpu_address(&self, buffer: &Self::Buffer) -> u64 {
        buffer.0
    }

    fn texture_gpu_resource_id(&self, texture: &Self::Texture) -> u64 {
        texture.0
    }

    fn sampler_gpu_resource_id(&self, _: &Self::Sampler) -> u64 {
        0
    }

    fn replace_texture_region(
        &self,
        texture: &Self::Texture,
        level: u32,
        slice: u32,
        data: &[u8],
        _bytes_per_row: u32,
    ) {
        let textures = self.state.textures.lock().unwrap();
        if let Some(storage) = textures.get(&texture.0) {
            let mut bytes = storage.bytes.lock().unwrap();
            if bytes.len() < data.len() {
                bytes.resize(data.len(), 0);
            }
            bytes[..data.len()].copy_from_slice(data);
        }
        self.state.calls.lock().unwrap().push(RecordedCall::ReplaceTextureRegion {
            texture: texture.0,
            level,
            slice,
            len: data.len(),
        });
    }

    fn new_command_buffer(&self) -> Self::CommandBuffer {}
    fn commit(&self, _: &Self::CommandBuffer) {}
    fn command_buffer_status(&self, _: &Self::CommandBuffer) -> CommandBufferStatus {
        CommandBufferStatus::Completed
    }
    fn new_shared_event(&self) -> Self::Event {
        FakeEvent { value: Arc::new(AtomicU64::new(0)) }
    }
    fn encode_signal_event(&self, _: &Self::CommandBuffer, event: &Self::Event, value: u64) {
        event.value.store(value, Ordering::SeqCst);
    }
    fn event_signaled_value(&self, event: &Self::Event) -> u64 {
        event.value.load(Ordering::SeqCst)
    }
    fn event_wait(&self, event: &Self::Event, value: u64, _timeout: Duration) -> bool {
        event.value.load(Ordering::SeqCst) >= value
    }

    fn begin_render_pass(&self, _: &Self::CommandBuffer, _: &RenderPassDescriptor<'_, Self>) -> Self::RenderEncoder {}
    fn end_render_encoding(&self, _: Self::RenderEncoder) {}
    fn set_render_pipeline_state(&self, _: &mut Self::RenderEncoder, _: &Self::RenderPipelineState) {}
    fn set_depth_stencil_state(&self, _: &mut Self::RenderEncoder, _: &Self::DepthStencilState) {}
    fn set_vertex_buffer(&self, _: &mut Self::RenderEncoder, _: u32, _: &Self::Buffer, _: u64) {}
    fn set_fragment_buffer(&self, _: &mut Self::RenderEncoder, _: u32, _: &Self::Buffer, _: u64) {}
    fn set_viewport(&self, _: &mut Self::RenderEncoder, _: f32, _: f32, _: f32, _: f32, _: f32, _: f32) {}
    fn set_scissor_rect(&self, _: &mut Self::RenderEncoder, _: u32, _: u32, _: u32, _: u32) {}
    fn set_blend_color(&self, _: &mut Self::RenderEncoder, _: f32, _: f32, _: f32, _: f32) {}
    fn set_stencil_reference_value(&self, _: &mut Self::RenderEncoder, _: u32) {}
    fn set_visibility_result_mode(&self, _: &mut Self::RenderEncoder, _: VisibilityResultMode, _: u64) {}
    fn use_resource_render(&self, _: &mut Self::RenderEncoder, _: &Self::Buffer, _: ResourceUsage, _: ShaderStage) {}
    fn use_texture_render(&self, _: &mut Self::RenderEncoder, _: &Self::Texture, _: ResourceUsage, _: ShaderStage) {}
    fn draw_primitives(&self, _: &mut Self::RenderEncoder, _: PrimitiveTopology, _: u32, _: u32, _: u32) {}
    fn draw_indexed_primitives(
        &self,
        _: &mut Self::RenderEncoder,
        _: PrimitiveTopology,
        _: u32,
        _: IndexType,
        _: &Self::Buffer,
        _: u64,
        _: u32,
        _: i32,
    ) {
    }

    fn begin_compute_pass(&self, _: &Self::CommandBuffer) -> Self::ComputeEncoder {}
    fn end_compute_encoding(&self, _: Self::ComputeEncoder) {}
    fn set_compute_pipeline_state(&self, _: &mut Self::ComputeEncoder, _: &Self::ComputePipelineState) {}
    fn set_compute_buffer(&self, _: &mut Self::ComputeEncoder, _: u32, _: &Self::Buffer, _: u64) {}
    fn use_resource_compute(&self, _: &mut Self::ComputeEncoder, _: &Self::Buffer, _: ResourceUsage) {}
    fn use_texture_compute(&self, _: &mut Self::ComputeEncoder, _: &Self::Texture, _: ResourceUsage) {}
    fn dispatch_threadgroups(&self, _: &mut Self::ComputeEncoder, _: u32, _: u32, _: u32, _: u32, _: u32, _: u32) {}

    fn begin_blit_pass(&self, _: &Self::CommandBuffer) -> Self::BlitEncoder {}
    fn end_blit_encoding(&self, _: Self::BlitEncoder) {}
    fn copy_buffer_to_buffer(&self, _: &mut Self::BlitEncoder, _: &Self::Buffer, _: u64, _: &Self::Buffer, _: u64, _: u64) {}
    fn copy_buffer_to_texture(
        &self,
        _: &mut Self::BlitEncoder,
        _: &Self::Buffer,
        _: u64,
        _: u32,
        _: &Self::Texture,
        _: u32,
        _: u32,
        _: u32,
        _: u32,
        _: u32,
    ) {
    }
    fn copy_texture_to_buffer(
        &self,
        _: &mut Self::BlitEncoder,
        _: &Self::Texture,
        _: u32,
        _: u32,
        _: &Self::Buffer,
        _: u64,
        _: u32,
        _: u32,
        _: u32,
        _: u32,
    ) {
    }
    fn copy_texture_to_texture(
        &self,
        _: &mut Self::BlitEncoder,
        src: &Self::Texture,
        _: u32,
        _: u32,
        dst: &Self::Texture,
        _: u32,
        _: u32,
        _: u32,
        _: u32,
        _: u32,
    ) {
        let textures = self.state.textures.lock().unwrap();
        let src_bytes = textures[&src.0].bytes.lock().unwrap().clone();
        *textures[&dst.0].bytes.lock().unwrap() = src_bytes;
        drop(textures);
        self.state.calls.lock().unwrap().push(RecordedCall::CopyTextureToTexture { src: src.0, dst: dst.0 });
    }
}

/// Compiler stub: every pipeline "compiles" to the unit PSO. Conformance
/// tests care about what `Context` records and how it drives the backend,
/// not about shader translation.
pub struct FakeCompiler;

impl PipelineCompiler<FakeBackend> for FakeCompiler {
    fn compile_render_pipeline(&self, _: &RenderPipelineDesc) -> Result<(), std::convert::Infallible> {
        Ok(())
    }
    fn compile_compute_pipeline(&self, _: &ComputePipelineDesc) -> Result<(), std::convert::Infallible> {
        Ok(())
    }
}

pub fn new_context() -> (dxmtl_core::Context<FakeBackend, FakeCompiler>, FakeBackendHandle) {
    let (backend, handle) = FakeBackend::new();
    let ctx = dxmtl_core::Context::new(backend, Arc::new(FakeCompiler), dxmtl_core::config::RuntimeConfig::default());
    (ctx, handle)
}

pub fn render_pipeline_desc() -> RenderPipelineDesc {
    RenderPipelineDesc {
        vertex_shader: 1,
        fragment_shader: Some(2),
        input_layout: smallvec::SmallVec::new(),
        render_target_formats: smallvec::SmallVec::new(),
        depth_stencil_format: None,
        blend_states: smallvec::SmallVec::new(),
        sample_mask: u32::MAX,
        sample_count: 1,
        topology_class: dxmtl_core::pipeline::TopologyClass::Triangle,
        rasterizer_flags: 0,
    }
}
