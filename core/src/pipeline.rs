//! Pipeline descriptor cache, bounded by an LRU policy: an unbounded
//! `HashMap` cache grows across the process lifetime, driven by shader
//! hot-reload during development retaining one entry per edited variant
//! forever. Bounding it with an LRU avoids that leak.

use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;
use smallvec::SmallVec;

use crate::backend::{Backend, PrimitiveTopology};
use crate::error::{ContextError, Result};
use crate::format::PixelFormat;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct BlendStateDesc {
    pub enabled: bool,
    pub src_factor: u8,
    pub dst_factor: u8,
    pub op: u8,
    pub src_alpha_factor: u8,
    pub dst_alpha_factor: u8,
    pub alpha_op: u8,
    pub write_mask: u8,
}

/// Dense, hashable descriptor for a render pipeline. Fields mirror exactly
/// what Metal needs to build an `MTLRenderPipelineState` plus the shader
/// reference the external compiler resolves.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct RenderPipelineDesc {
    pub vertex_shader: u64,
    pub fragment_shader: Option<u64>,
    pub input_layout: SmallVec<[VertexElementDesc; 16]>,
    pub render_target_formats: SmallVec<[PixelFormat; 8]>,
    pub depth_stencil_format: Option<PixelFormat>,
    pub blend_states: SmallVec<[BlendStateHash; 8]>,
    pub sample_mask: u32,
    pub sample_count: u32,
    pub topology_class: TopologyClass,
    pub rasterizer_flags: u32,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct VertexElementDesc {
    pub slot: u32,
    pub offset: u32,
    pub format_key: u32,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct BlendStateHash(pub u64);

impl From<BlendStateDesc> for BlendStateHash {
    fn from(b: BlendStateDesc) -> Self {
        let mut h = b.enabled as u64;
        h = (h << 8) | b.src_factor as u64;
        h = (h << 8) | b.dst_factor as u64;
        h = (h << 8) | b.op as u64;
        h = (h << 8) | b.src_alpha_factor as u64;
        h = (h << 8) | b.dst_alpha_factor as u64;
        h = (h << 8) | b.alpha_op as u64;
        h = (h << 8) | b.write_mask as u64;
        BlendStateHash(h)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum TopologyClass {
    Point,
    Line,
    Triangle,
}

impl From<PrimitiveTopology> for TopologyClass {
    fn from(t: PrimitiveTopology) -> Self {
        match t {
            PrimitiveTopology::PointList => TopologyClass::Point,
            PrimitiveTopology::LineList | PrimitiveTopology::LineStrip => TopologyClass::Line,
            PrimitiveTopology::TriangleList | PrimitiveTopology::TriangleStrip => TopologyClass::Triangle,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ComputePipelineDesc {
    pub compute_shader: u64,
    pub threadgroup_size: (u32, u32, u32),
}

/// Implemented by the external shader compiler/pipeline-object builder;
/// the core does not perform shader compilation itself, it only requests
/// already-compiled pipeline objects keyed by descriptor and caches the
/// result.
pub trait PipelineCompiler<B: Backend> {
    fn compile_render_pipeline(
        &self,
        desc: &RenderPipelineDesc,
    ) -> std::result::Result<B::RenderPipelineState, B::Error>;

    fn compile_compute_pipeline(
        &self,
        desc: &ComputePipelineDesc,
    ) -> std::result::Result<B::ComputePipelineState, B::Error>;
}

enum CachedPipeline<B: Backend> {
    Render(B::RenderPipelineState),
    Compute(B::ComputePipelineState),
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
enum CacheKey {
    Render(RenderPipelineDesc),
    Compute(ComputePipelineDesc),
}

/// Thread-safe, descriptor-keyed cache mapping `PipelineDesc -> compiled
/// backend pipeline`. Hot-path lookups on a hit only take the mutex for the
/// duration of an `LruCache::get` (no compiler invocation), which is as
/// close to wait-free as a bounded LRU allows without a lock-free map.
pub struct PipelineCache<B: Backend, C: PipelineCompiler<B>> {
    compiler: Arc<C>,
    entries: Mutex<LruCache<CacheKey, CachedPipeline<B>>>,
}

impl<B: Backend, C: PipelineCompiler<B>> PipelineCache<B, C> {
    pub fn new(compiler: Arc<C>, capacity: usize) -> PipelineCache<B, C> {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap();
        PipelineCache {
            compiler,
            entries: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn get_or_compile_render(&self, desc: &RenderPipelineDesc) -> Result<B::RenderPipelineState> {
        let key = CacheKey::Render(desc.clone());
        {
            let mut entries = self.entries.lock();
            if let Some(CachedPipeline::Render(pso)) = entries.get(&key) {
                return Ok(pso.clone());
            }
        }
        log::debug!("pipeline cache miss (render): compiling {:?}", desc);
        let pso = self
            .compiler
            .compile_render_pipeline(desc)
            .map_err(|_| ContextError::OutOfMemory)?;
        self.entries.lock().put(key, CachedPipeline::Render(pso.clone()));
        Ok(pso)
    }

    pub fn get_or_compile_compute(&self, desc: &ComputePipelineDesc) -> Result<B::ComputePipelineState> {
        let key = CacheKey::Compute(desc.clone());
        {
            let mut entries = self.entries.lock();
            if let Some(CachedPipeline::Compute(pso)) = entries.get(&key) {
                return Ok(pso.clone());
            }
        }
        log::debug!("pipeline cache miss (compute): compiling {:?}", desc);
        let pso = self
            .compiler
            .compile_compute_pipeline(desc)
            .map_err(|_| ContextError::OutOfMemory)?;
        self.entries.lock().put(key, CachedPipeline::Compute(pso.clone()));
        Ok(pso)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Clone, PartialEq)]
    struct FakePso(u64);

    struct CountingCompiler {
        calls: AtomicUsize,
    }

    struct FakeBackend;
    impl Backend for FakeBackend {
        type Error = std::convert::Infallible;
        type Buffer = ();
        type Texture = ();
        type Sampler = ();
        type RenderPipelineState = FakePso;
        type ComputePipelineState = FakePso;
        type DepthStencilState = ();
        type CommandBuffer = ();
        type RenderEncoder = ();
        type ComputeEncoder = ();
        type BlitEncoder = ();
        type Event = ();

        fn create_buffer(&self, _: &crate::backend::BufferDesc) -> std::result::Result<Self::Buffer, Self::Error> { Ok(()) }
        fn create_texture(&self, _: &crate::backend::TextureDesc) -> std::result::Result<Self::Texture, Self::Error> { Ok(()) }
        fn create_sampler(&self, _: &crate::backend::SamplerDesc) -> std::result::Result<Self::Sampler, Self::Error> { Ok(()) }
        fn set_buffer_label(&self, _: &Self::Buffer, _: &str) {}
        fn set_texture_label(&self, _: &Self::Texture, _: &str) {}
        fn buffer_contents_ptr(&self, _: &Self::Buffer) -> Option<std::ptr::NonNull<u8>> { None }
        fn buffer_gpu_address(&self, _: &Self::Buffer) -> u64 { 0 }
        fn texture_gpu_resource_id(&self, _: &Self::Texture) -> u64 { 0 }
        fn sampler_gpu_resource_id(&self, _: &Self::Sampler) -> u64 { 0 }
        fn replace_texture_region(&self, _: &Self::Texture, _: u32, _: u32, _: &[u8], _: u32) {}
        fn new_command_buffer(&self) -> Self::CommandBuffer {}
        fn commit(&self, _: &Self::CommandBuffer) {}
        fn command_buffer_status(&self, _: &Self::CommandBuffer) -> crate::backend::CommandBufferStatus { crate::backend::CommandBufferStatus::Completed }
        fn new_shared_event(&self) -> Self::Event {}
        fn encode_signal_event(&self, _: &Self::CommandBuffer, _: &Self::Event, _: u64) {}
        fn event_signaled_value(&self, _: &Self::Event) -> u64 { 0 }
        fn event_wait(&self, _: &Self::Event, _: u64, _: std::time::Duration) -> bool { true }
        fn begin_render_pass(&self, _: &Self::CommandBuffer, _: &crate::backend::RenderPassDescriptor<'_, Self>) -> Self::RenderEncoder {}
        fn end_render_encoding(&self, _: Self::RenderEncoder) {}
        fn set_render_pipeline_state(&self, _: &mut Self::RenderEncoder, _: &Self::RenderPipelineState) {}
        fn set_depth_stencil_state(&self, _: &mut Self::RenderEncoder, _: &Self::DepthStencilState) {}
        fn set_vertex_buffer(&self, _: &mut Self::RenderEncoder, _: u32, _: &Self::Buffer, _: u64) {}
        fn set_fragment_buffer(&self, _: &mut Self::RenderEncoder, _: u32, _: &Self::Buffer, _: u64) {}
        fn set_viewport(&self, _: &mut Self::RenderEncoder, _: f32, _: f32, _: f32, _: f32, _: f32, _: f32) {}
        fn set_scissor_rect(&self, _: &mut Self::RenderEncoder, _: u32, _: u32, _: u32, _: u32) {}
        fn set_blend_color(&self, _: &mut Self::RenderEncoder, _: f32, _: f32, _: f32, _: f32) {}
        fn set_stencil_reference_value(&self, _: &mut Self::RenderEncoder, _: u32) {}
        fn set_visibility_result_mode(&self, _: &mut Self::RenderEncoder, _: crate::backend::VisibilityResultMode, _: u64) {}
        fn use_resource_render(&self, _: &mut Self::RenderEncoder, _: &Self::Buffer, _: crate::backend::ResourceUsage, _: crate::backend::ShaderStage) {}
        fn use_texture_render(&self, _: &mut Self::RenderEncoder, _: &Self::Texture, _: crate::backend::ResourceUsage, _: crate::backend::ShaderStage) {}
        fn draw_primitives(&self, _: &mut Self::RenderEncoder, _: crate::backend::PrimitiveTopology, _: u32, _: u32, _: u32) {}
        fn draw_indexed_primitives(&self, _: &mut Self::RenderEncoder, _: crate::backend::PrimitiveTopology, _: u32, _: crate::backend::IndexType, _: &Self::Buffer, _: u64, _: u32, _: i32) {}
        fn begin_compute_pass(&self, _: &Self::CommandBuffer) -> Self::ComputeEncoder {}
        fn end_compute_encoding(&self, _: Self::ComputeEncoder) {}
        fn set_compute_pipeline_state(&self, _: &mut Self::ComputeEncoder, _: &Self::ComputePipelineState) {}
        fn set_compute_buffer(&self, _: &mut Self::ComputeEncoder, _: u32, _: &Self::Buffer, _: u64) {}
        fn use_resource_compute(&self, _: &mut Self::ComputeEncoder, _: &Self::Buffer, _: crate::backend::ResourceUsage) {}
        fn use_texture_compute(&self, _: &mut Self::ComputeEncoder, _: &Self::Texture, _: crate::backend::ResourceUsage) {}
        fn dispatch_threadgroups(&self, _: &mut Self::ComputeEncoder, _: u32, _: u32, _: u32, _: u32, _: u32, _: u32) {}
        fn begin_blit_pass(&self, _: &Self::CommandBuffer) -> Self::BlitEncoder {}
        fn end_blit_encoding(&self, _: Self::BlitEncoder) {}
        fn copy_buffer_to_buffer(&self, _: &mut Self::BlitEncoder, _: &Self::Buffer, _: u64, _: &Self::Buffer, _: u64, _: u64) {}
        fn copy_buffer_to_texture(&self, _: &mut Self::BlitEncoder, _: &Self::Buffer, _: u64, _: u32, _: &Self::Texture, _: u32, _: u32, _: u32, _: u32, _: u32) {}
        fn copy_texture_to_buffer(&self, _: &mut Self::BlitEncoder, _: &Self::Texture, _: u32, _: u32, _: &Self::Buffer, _: u64, _: u32, _: u32, _: u32, _: u32) {}
        fn copy_texture_to_texture(&self, _: &mut Self::BlitEncoder, _: &Self::Texture, _: u32, _: u32, _: &Self::Texture, _: u32, _: u32, _: u32, _: u32, _: u32) {}
    }

    impl PipelineCompiler<FakeBackend> for CountingCompiler {
        fn compile_render_pipeline(&self, _: &RenderPipelineDesc) -> std::result::Result<FakePso, std::convert::Infallible> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(FakePso(self.calls.load(Ordering::SeqCst) as u64))
        }
        fn compile_compute_pipeline(&self, _: &ComputePipelineDesc) -> std::result::Result<FakePso, std::convert::Infallible> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(FakePso(self.calls.load(Ordering::SeqCst) as u64))
        }
    }

    fn desc() -> RenderPipelineDesc {
        RenderPipelineDesc {
            vertex_shader: 1,
            fragment_shader: Some(2),
            input_layout: SmallVec::new(),
            render_target_formats: SmallVec::new(),
            depth_stencil_format: None,
            blend_states: SmallVec::new(),
            sample_mask: u32::MAX,
            sample_count: 1,
            topology_class: TopologyClass::Triangle,
            rasterizer_flags: 0,
        }
    }

    #[test]
    fn identical_descriptor_hits_cache_on_second_lookup() {
        let compiler = Arc::new(CountingCompiler { calls: AtomicUsize::new(0) });
        let cache: PipelineCache<FakeBackend, CountingCompiler> = PipelineCache::new(compiler.clone(), 4);
        let d = desc();
        let a = cache.get_or_compile_render(&d).unwrap();
        let b = cache.get_or_compile_render(&d).unwrap();
        assert_eq!(a, b);
        assert_eq!(compiler.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn cache_evicts_least_recently_used_beyond_capacity() {
        let compiler = Arc::new(CountingCompiler { calls: AtomicUsize::new(0) });
        let cache: PipelineCache<FakeBackend, CountingCompiler> = PipelineCache::new(compiler.clone(), 1);
        let mut d1 = desc();
        d1.vertex_shader = 1;
        let mut d2 = desc();
        d2.vertex_shader = 2;
        cache.get_or_compile_render(&d1).unwrap();
        cache.get_or_compile_render(&d2).unwrap();
        assert_eq!(cache.len(), 1);
        // d1 was evicted; requesting it again must recompile.
        cache.get_or_compile_render(&d1).unwrap();
        assert_eq!(compiler.calls.load(Ordering::SeqCst), 3);
    }
}
