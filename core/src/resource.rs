//! Logical resources: `Buffer` and `Texture`.
//!
//! A logical resource is what the application sees. It owns the *current*
//! `Allocation` (its "name"), a monotonically increasing version, the
//! content-addressed view-descriptor table, and a cache of backend view
//! objects built lazily against the current allocation.
//!
//! Views are non-owning: they carry a `ViewKey` and re-resolve whenever the
//! allocation has been renamed since they were last built, breaking the
//! cycle that would otherwise exist between views and resources -- the
//! resource owns both the allocation and the descriptor list; when it
//! drops, both the descriptor list and any cached backend views drop
//! deterministically.

use std::collections::HashMap;

use parking_lot::Mutex;

use crate::allocation::Allocation;
use crate::backend::Backend;
use crate::handle::{ResourceVersion, ViewKey};
use crate::view::{ViewDescriptor, ViewTable};

/// A backend view cached against a specific resource version. Rebuilt when
/// the resource's current version no longer matches.
struct CachedView<B: Backend> {
    built_against_version: ResourceVersion,
    texture: B::Texture,
}

/// Guarded, mutable half of a logical resource: everything that changes
/// under renaming or view construction. Split out from the immutable
/// metadata so callers that only need e.g. the descriptor table don't take
/// the view-cache lock.
struct ResourceInner<B: Backend> {
    current: Allocation,
    version: ResourceVersion,
    view_cache: HashMap<ViewKey, CachedView<B>>,
}

/// A logical GPU resource: the thing D3D11 handles (`ID3D11Buffer`,
/// `ID3D11Texture2D`, ...) refer to. Backed by whichever `Allocation` is
/// current; renaming swaps the allocation without changing this identity.
pub struct Resource<B: Backend> {
    views: Mutex<ViewTable>,
    inner: Mutex<ResourceInner<B>>,
    pub debug_name: Option<String>,
}

impl<B: Backend> Resource<B> {
    pub fn new(initial: Allocation, debug_name: Option<String>) -> Resource<B> {
        Resource {
            views: Mutex::new(ViewTable::new()),
            inner: Mutex::new(ResourceInner {
                current: initial,
                version: ResourceVersion::default(),
                view_cache: HashMap::new(),
            }),
            debug_name,
        }
    }

    /// Pure lookup-or-append on the descriptor array; never touches a
    /// backend view.
    pub fn create_view(&self, descriptor: ViewDescriptor) -> ViewKey {
        self.views.lock().create_view(descriptor)
    }

    pub fn view_descriptor(&self, key: ViewKey) -> Option<ViewDescriptor> {
        self.views.lock().get(key).copied()
    }

    pub fn current_allocation(&self) -> Allocation {
        self.inner.lock().current.clone()
    }

    pub fn version(&self) -> ResourceVersion {
        self.inner.lock().version
    }

    /// Installs `new_alloc` as current, returns the displaced allocation for
    /// pooling, and bumps the version so every cached binding that recorded
    /// a lower version re-resolves.
    pub fn rename(&self, new_alloc: Allocation) -> Allocation {
        let mut inner = self.inner.lock();
        let prev = std::mem::replace(&mut inner.current, new_alloc);
        inner.version.bump();
        prev
    }

    /// Returns the cached backend view for `key` against the current
    /// allocation, building it with `build` if absent or stale.
    pub fn resolve_view(
        &self,
        key: ViewKey,
        build: impl FnOnce(&Allocation, &ViewDescriptor) -> B::Texture,
    ) -> Option<B::Texture> {
        let descriptor = self.views.lock().get(key).copied()?;
        let mut inner = self.inner.lock();
        let current_version = inner.version;
        let current_alloc = inner.current.clone();

        let needs_build = match inner.view_cache.get(&key) {
            Some(cached) => cached.built_against_version != current_version,
            None => true,
        };

        if needs_build {
            let texture = build(&current_alloc, &descriptor);
            inner.view_cache.insert(
                key,
                CachedView {
                    built_against_version: current_version,
                    texture: texture.clone(),
                },
            );
            Some(texture)
        } else {
            inner.view_cache.get(&key).map(|c| c.texture.clone())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocation::{AllocationFlags, BufferAllocation, TextureAllocation, TextureExtent};
    use crate::format::{PixelFormat, ViewKind};
    use crate::view::SubresourceRange;
    use std::sync::Arc;

    #[derive(Debug, Clone, PartialEq)]
    struct FakeTexture(u64);

    struct FakeBackend;
    impl Backend for FakeBackend {
        type Error = std::convert::Infallible;
        type Buffer = ();
        type Texture = FakeTexture;
        type Sampler = ();
        type RenderPipelineState = ();
        type ComputePipelineState = ();
        type DepthStencilState = ();
        type CommandBuffer = ();
        type RenderEncoder = ();
        type ComputeEncoder = ();
        type BlitEncoder = ();
        type Event = ();

        fn create_buffer(&self, _: &crate::backend::BufferDesc) -> Result<Self::Buffer, Self::Error> { Ok(()) }
        fn create_texture(&self, _: &crate::backend::TextureDesc) -> Result<Self::Texture, Self::Error> { Ok(FakeTexture(0)) }
        fn create_sampler(&self, _: &crate::backend::SamplerDesc) -> Result<Self::Sampler, Self::Error> { Ok(()) }
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

    fn texture_alloc() -> Allocation {
        Allocation::Texture(Arc::new(TextureAllocation {
            format: PixelFormat::R8G8B8A8Unorm,
            extent: TextureExtent { width: 4, height: 4, depth_or_array_layers: 1, mip_levels: 1 },
            sample_count: 1,
            flags: AllocationFlags::GPU_PRIVATE | AllocationFlags::TRACKED,
            debug_label: None,
            creation_frame: 0,
        }))
    }

    #[test]
    fn rename_preserves_view_keys_and_invalidates_cache() {
        let res: Resource<FakeBackend> = Resource::new(texture_alloc(), None);
        let key = res.create_view(ViewDescriptor {
            format: PixelFormat::R8G8B8A8Unorm,
            kind: ViewKind::Texture2d,
            range: SubresourceRange::all_mips_all_slices(1, 1),
            attachment: None,
        });

        let mut builds = 0;
        let v1 = res.resolve_view(key, |_, _| {
            builds += 1;
            FakeTexture(builds)
        }).unwrap();
        assert_eq!(v1, FakeTexture(1));

        // Same version: resolving again must not rebuild.
        let v2 = res.resolve_view(key, |_, _| {
            builds += 1;
            FakeTexture(builds)
        }).unwrap();
        assert_eq!(v2, FakeTexture(1));

        res.rename(texture_alloc());

        // Key survives the rename; the cached view must rebuild once.
        let key_after = res.create_view(ViewDescriptor {
            format: PixelFormat::R8G8B8A8Unorm,
            kind: ViewKind::Texture2d,
            range: SubresourceRange::all_mips_all_slices(1, 1),
            attachment: None,
        });
        assert_eq!(key, key_after);

        let v3 = res.resolve_view(key, |_, _| {
            builds += 1;
            FakeTexture(builds)
        }).unwrap();
        assert_eq!(v3, FakeTexture(2));
    }
}
