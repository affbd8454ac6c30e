//! `MetalBackend`: the concrete `Backend` impl this crate exists to provide.
//!
//! Every method here is a direct, mostly mechanical translation of one
//! `Backend` trait method into the matching Metal call. The interesting
//! work -- deciding *when* to call these, what to bind, how to coalesce
//! clears -- all happens in `dxmtl-core`; this file never makes a decision
//! `Context` hasn't already made for it.

use std::ffi::c_void;
use std::fmt;
use std::ptr::NonNull;
use std::time::Duration;

use metal::foreign_types::ForeignType;
use metal::{MTLOrigin, MTLRegion, MTLScissorRect, MTLSize, MTLViewport};
use thiserror::Error;

use dxmtl_core::backend::{
    Backend, BufferDesc, CommandBufferStatus, IndexType, PrimitiveTopology, RenderPassDescriptor,
    ResourceUsage, SamplerDesc, ShaderStage, TextureDesc, VisibilityResultMode,
};

use crate::format::{
    allocation_flags_to_resource_options, index_type_to_mtl, load_action_to_mtl,
    pixel_format_to_mtl, primitive_topology_to_mtl, storage_mode_to_mtl, store_action_to_mtl,
    texture_usage_to_mtl,
};

#[derive(Debug, Error)]
pub enum MetalBackendError {
    #[error("no Metal device available on this system")]
    NoDevice,
    #[error("Metal sampler state creation failed")]
    SamplerCreationFailed,
}

/// Thin `Clone + Debug` wrapper: `metal`'s owned object types retain on
/// clone but don't implement `Debug` themselves, and `Backend` requires it
/// so `Resource<B>` (`resource.rs`) can derive it for diagnostics.
macro_rules! debug_wrapper {
    ($name:ident, $inner:ty) => {
        #[derive(Clone)]
        pub struct $name(pub $inner);

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.debug_tuple(stringify!($name)).field(&(self.0.as_ptr() as usize)).finish()
            }
        }
    };
}

debug_wrapper!(MetalBuffer, metal::Buffer);
debug_wrapper!(MetalTexture, metal::Texture);
debug_wrapper!(MetalSampler, metal::SamplerState);
debug_wrapper!(MetalRenderPipelineState, metal::RenderPipelineState);
debug_wrapper!(MetalComputePipelineState, metal::ComputePipelineState);
debug_wrapper!(MetalDepthStencilState, metal::DepthStencilState);

pub struct MetalBackend {
    device: metal::Device,
    queue: metal::CommandQueue,
}

impl MetalBackend {
    pub fn new() -> Result<MetalBackend, MetalBackendError> {
        let device = metal::Device::system_default().ok_or(MetalBackendError::NoDevice)?;
        let queue = device.new_command_queue();
        Ok(MetalBackend { device, queue })
    }

    pub fn device(&self) -> &metal::DeviceRef {
        &self.device
    }

    fn resource_usage_bits(usage: ResourceUsage) -> metal::MTLResourceUsage {
        match usage {
            ResourceUsage::Read => metal::MTLResourceUsage::Read,
            ResourceUsage::Write => metal::MTLResourceUsage::Write,
            ResourceUsage::ReadWrite => metal::MTLResourceUsage::Read | metal::MTLResourceUsage::Write,
        }
    }

    /// `depth_or_array_layers > 1` is treated as a 2D array rather than a 3D
    /// volume texture: `TextureDesc` does not itself distinguish the two,
    /// and nothing in this repo's scenarios creates a volume texture.
    /// A real volume-texture call site would need `TextureDesc` to carry
    /// that bit explicitly; left as a known gap rather than guessed at.
    fn texture_type_for(desc: &TextureDesc) -> metal::MTLTextureType {
        if desc.sample_count > 1 {
            metal::MTLTextureType::D2Multisample
        } else if desc.extent.depth_or_array_layers > 1 {
            metal::MTLTextureType::D2Array
        } else {
            metal::MTLTextureType::D2
        }
    }
}

impl Backend for MetalBackend {
    type Error = MetalBackendError;

    type Buffer = MetalBuffer;
    type Texture = MetalTexture;
    type Sampler = MetalSampler;
    type RenderPipelineState = MetalRenderPipelineState;
    type ComputePipelineState = MetalComputePipelineState;
    type DepthStencilState = MetalDepthStencilState;
    type CommandBuffer = metal::CommandBuffer;
    type RenderEncoder = metal::RenderCommandEncoder;
    type ComputeEncoder = metal::ComputeCommandEncoder;
    type BlitEncoder = metal::BlitCommandEncoder;
    type Event = metal::SharedEvent;

    // -- resource creation -------------------------------------------------

    fn create_buffer(&self, desc: &BufferDesc) -> Result<Self::Buffer, Self::Error> {
        let options = allocation_flags_to_resource_options(desc.flags);
        let buffer = self.device.new_buffer(desc.size.max(1), options);
        Ok(MetalBuffer(buffer))
    }

    fn create_texture(&self, desc: &TextureDesc) -> Result<Self::Texture, Self::Error> {
        let d = metal::TextureDescriptor::new();
        d.set_texture_type(Self::texture_type_for(desc));
        d.set_pixel_format(pixel_format_to_mtl(desc.format));
        d.set_width(desc.extent.width.max(1) as u64);
        d.set_height(desc.extent.height.max(1) as u64);
        if Self::texture_type_for(desc) == metal::MTLTextureType::D2Array {
            d.set_array_length(desc.extent.depth_or_array_layers.max(1) as u64);
        }
        d.set_mipmap_level_count(desc.extent.mip_levels.max(1) as u64);
        d.set_sample_count(desc.sample_count.max(1) as u64);
        d.set_storage_mode(storage_mode_to_mtl(desc.flags));
        d.set_usage(texture_usage_to_mtl(desc.usage));
        let texture = self.device.new_texture(&d);
        Ok(MetalTexture(texture))
    }

    fn create_sampler(&self, desc: &SamplerDesc) -> Result<Self::Sampler, Self::Error> {
        let d = metal::SamplerDescriptor::new();
        let address_mode = if desc.clamp_to_edge {
            metal::MTLSamplerAddressMode::ClampToEdge
        } else {
            metal::MTLSamplerAddressMode::Repeat
        };
        d.set_address_mode_s(address_mode);
        d.set_address_mode_t(address_mode);
        d.set_address_mode_r(address_mode);
        let filter = if desc.linear_filter {
            metal::MTLSamplerMinMagFilter::Linear
        } else {
            metal::MTLSamplerMinMagFilter::Nearest
        };
        d.set_min_filter(filter);
        d.set_mag_filter(filter);
        d.set_max_anisotropy(desc.max_anisotropy.max(1) as u64);
        let sampler = self
            .device
            .new_sampler(&d);
        Ok(MetalSampler(sampler))
    }

    fn set_buffer_label(&self, buffer: &Self::Buffer, label: &str) {
        buffer.0.set_label(label);
    }

    fn set_texture_label(&self, texture: &Self::Texture, label: &str) {
        texture.0.set_label(label);
    }

    fn buffer_contents_ptr(&self, buffer: &Self::Buffer) -> Option<NonNull<u8>> {
        NonNull::new(buffer.0.contents() as *mut u8)
    }

    fn buffer_gpu_address(&self, buffer: &Self::Buffer) -> u64 {
        buffer.0.gpu_address()
    }

    fn texture_gpu_resource_id(&self, texture: &Self::Texture) -> u64 {
        texture.0.gpu_resource_id()._impl
    }

    fn sampler_gpu_resource_id(&self, sampler: &Self::Sampler) -> u64 {
        sampler.0.gpu_resource_id()._impl
    }

    fn replace_texture_region(
        &self,
        texture: &Self::Texture,
        level: u32,
        slice: u32,
        data: &[u8],
        bytes_per_row: u32,
    ) {
        if slice != 0 {
            log::debug!("replace_texture_region: non-zero slice {} on a non-array upload path", slice);
        }
        let region = MTLRegion {
            origin: MTLOrigin { x: 0, y: 0, z: 0 },
            size: MTLSize {
                width: texture.0.width(),
                height: texture.0.height(),
                depth: 1,
            },
        };
        texture.0.replace_region(
            region,
            level as u64,
            data.as_ptr() as *const c_void,
            bytes_per_row as u64,
        );
    }

    // -- queue / command buffer --------------------------------------------

    fn new_command_buffer(&self) -> Self::CommandBuffer {
        self.queue.new_command_buffer().to_owned()
    }

    fn commit(&self, cb: &Self::CommandBuffer) {
        cb.commit();
    }

    fn command_buffer_status(&self, cb: &Self::CommandBuffer) -> CommandBufferStatus {
        match cb.status() {
            metal::MTLCommandBufferStatus::NotEnqueued | metal::MTLCommandBufferStatus::Enqueued => {
                CommandBufferStatus::Enqueued
            }
            metal::MTLCommandBufferStatus::Committed => CommandBufferStatus::Committed,
            metal::MTLCommandBufferStatus::Scheduled => CommandBufferStatus::Scheduled,
            metal::MTLCommandBufferStatus::Completed => CommandBufferStatus::Completed,
            metal::MTLCommandBufferStatus::Error => CommandBufferStatus::Error,
        }
    }

    fn new_shared_event(&self) -> Self::Event {
        self.device.new_shared_event()
    }

    fn encode_signal_event(&self, cb: &Self::CommandBuffer, event: &Self::Event, value: u64) {
        cb.encode_signal_event(event, value);
    }

    fn event_signaled_value(&self, event: &Self::Event) -> u64 {
        event.signaled_value()
    }

    fn event_wait(&self, event: &Self::Event, value: u64, timeout: Duration) -> bool {
        event.wait_until_signaled_value(value, timeout.as_millis() as u64)
    }

    // -- render encoder -----------------------------------------------------

    fn begin_render_pass(
        &self,
        cb: &Self::CommandBuffer,
        desc: &RenderPassDescriptor<'_, Self>,
    ) -> Self::RenderEncoder {
        let d = metal::RenderPassDescriptor::new();
        for (i, color) in desc.colors.iter().enumerate() {
            let attachment = d.color_attachments().object_at(i as u64);
            attachment.set_texture(Some(&color.texture.0));
            attachment.set_level(color.level as u64);
            attachment.set_slice(color.slice as u64);
            attachment.set_depth_plane(color.depth_plane as u64);
            attachment.set_load_action(load_action_to_mtl(color.load_action));
            attachment.set_clear_color(metal::MTLClearColor::new(
                color.clear_color.r,
                color.clear_color.g,
                color.clear_color.b,
                color.clear_color.a,
            ));
            attachment.set_store_action(store_action_to_mtl(color.store_action));
            if let Some(resolve) = color.resolve_target {
                attachment.set_resolve_texture(Some(&resolve.0));
            }
        }
        if let Some(ds) = &desc.depth_stencil {
            let depth_attachment = d.depth_attachment();
            depth_attachment.set_texture(Some(&ds.texture.0));
            depth_attachment.set_level(ds.level as u64);
            depth_attachment.set_slice(ds.slice as u64);
            depth_attachment.set_load_action(load_action_to_mtl(ds.depth_load_action));
            depth_attachment.set_clear_depth(ds.depth_clear_value as f64);
            depth_attachment.set_store_action(store_action_to_mtl(ds.depth_store_action));

            let stencil_attachment = d.stencil_attachment();
            stencil_attachment.set_texture(Some(&ds.texture.0));
            stencil_attachment.set_level(ds.level as u64);
            stencil_attachment.set_slice(ds.slice as u64);
            stencil_attachment.set_load_action(load_action_to_mtl(ds.stencil_load_action));
            stencil_attachment.set_clear_stencil(ds.stencil_clear_value);
            stencil_attachment.set_store_action(store_action_to_mtl(ds.stencil_store_action));
        }
        if let Some(buf) = desc.visibility_result_buffer {
            d.set_visibility_result_buffer(Some(&buf.0));
        }
        cb.new_render_command_encoder(&d).to_owned()
    }

    fn end_render_encoding(&self, enc: Self::RenderEncoder) {
        enc.end_encoding();
    }

    fn set_render_pipeline_state(&self, enc: &mut Self::RenderEncoder, pso: &Self::RenderPipelineState) {
        enc.set_render_pipeline_state(&pso.0);
    }

    fn set_depth_stencil_state(&self, enc: &mut Self::RenderEncoder, dss: &Self::DepthStencilState) {
        enc.set_depth_stencil_state(&dss.0);
    }

    fn set_vertex_buffer(&self, enc: &mut Self::RenderEncoder, index: u32, buffer: &Self::Buffer, offset: u64) {
        enc.set_vertex_buffer(index as u64, Some(&buffer.0), offset);
    }

    fn set_fragment_buffer(&self, enc: &mut Self::RenderEncoder, index: u32, buffer: &Self::Buffer, offset: u64) {
        enc.set_fragment_buffer(index as u64, Some(&buffer.0), offset);
    }

    fn set_viewport(&self, enc: &mut Self::RenderEncoder, x: f32, y: f32, w: f32, h: f32, near: f32, far: f32) {
        enc.set_viewport(MTLViewport {
            originX: x as f64,
            originY: y as f64,
            width: w as f64,
            height: h as f64,
            znear: near as f64,
            zfar: far as f64,
        });
    }

    fn set_scissor_rect(&self, enc: &mut Self::RenderEncoder, x: u32, y: u32, w: u32, h: u32) {
        enc.set_scissor_rect(MTLScissorRect {
            x: x as u64,
            y: y as u64,
            width: w as u64,
            height: h as u64,
        });
    }

    fn set_blend_color(&self, enc: &mut Self::RenderEncoder, r: f32, g: f32, b: f32, a: f32) {
        enc.set_blend_color(r, g, b, a);
    }

    fn set_stencil_reference_value(&self, enc: &mut Self::RenderEncoder, value: u32) {
        enc.set_stencil_reference_value(value);
    }

    fn set_visibility_result_mode(&self, enc: &mut Self::RenderEncoder, mode: VisibilityResultMode, offset: u64) {
        let mtl_mode = match mode {
            VisibilityResultMode::Disabled => metal::MTLVisibilityResultMode::Disabled,
            VisibilityResultMode::Boolean => metal::MTLVisibilityResultMode::Boolean,
            VisibilityResultMode::Counting => metal::MTLVisibilityResultMode::Counting,
        };
        enc.set_visibility_result_mode(mtl_mode, offset);
    }

    fn use_resource_render(&self, enc: &mut Self::RenderEncoder, buffer: &Self::Buffer, usage: ResourceUsage, _stage: ShaderStage) {
        enc.use_resource(&buffer.0, Self::resource_usage_bits(usage));
    }

    fn use_texture_render(&self, enc: &mut Self::RenderEncoder, texture: &Self::Texture, usage: ResourceUsage, _stage: ShaderStage) {
        enc.use_resource(&texture.0, Self::resource_usage_bits(usage));
    }

    fn draw_primitives(&self, enc: &mut Self::RenderEncoder, topology: PrimitiveTopology, vertex_start: u32, vertex_count: u32, instance_count: u32) {
        enc.draw_primitives_instanced(
            primitive_topology_to_mtl(topology),
            vertex_start as u64,
            vertex_count as u64,
            instance_count as u64,
        );
    }

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
    ) {
        enc.draw_indexed_primitives_instanced_base_instance(
            primitive_topology_to_mtl(topology),
            index_count as u64,
            index_type_to_mtl(index_type),
            &index_buffer.0,
            index_buffer_offset,
            instance_count as u64,
            base_vertex as i64,
            0,
        );
    }

    // -- compute encoder ----------------------------------------------------

    fn begin_compute_pass(&self, cb: &Self::CommandBuffer) -> Self::ComputeEncoder {
        cb.new_compute_command_encoder().to_owned()
    }

    fn end_compute_encoding(&self, enc: Self::ComputeEncoder) {
        enc.end_encoding();
    }

    fn set_compute_pipeline_state(&self, enc: &mut Self::ComputeEncoder, pso: &Self::ComputePipelineState) {
        enc.set_compute_pipeline_state(&pso.0);
    }

    fn set_compute_buffer(&self, enc: &mut Self::ComputeEncoder, index: u32, buffer: &Self::Buffer, offset: u64) {
        enc.set_buffer(index as u64, Some(&buffer.0), offset);
    }

    fn use_resource_compute(&self, enc: &mut Self::ComputeEncoder, buffer: &Self::Buffer, usage: ResourceUsage) {
        enc.use_resource(&buffer.0, Self::resource_usage_bits(usage));
    }

    fn use_texture_compute(&self, enc: &mut Self::ComputeEncoder, texture: &Self::Texture, usage: ResourceUsage) {
        enc.use_resource(&texture.0, Self::resource_usage_bits(usage));
    }

    fn dispatch_threadgroups(&self, enc: &mut Self::ComputeEncoder, groups_x: u32, groups_y: u32, groups_z: u32, tg_x: u32, tg_y: u32, tg_z: u32) {
        enc.dispatch_thread_groups(
            MTLSize { width: groups_x as u64, height: groups_y as u64, depth: groups_z as u64 },
            MTLSize { width: tg_x.max(1) as u64, height: tg_y.max(1) as u64, depth: tg_z.max(1) as u64 },
        );
    }

    // -- blit encoder ---------------------------------------------------------

    fn begin_blit_pass(&self, cb: &Self::CommandBuffer) -> Self::BlitEncoder {
        cb.new_blit_command_encoder().to_owned()
    }

    fn end_blit_encoding(&self, enc: Self::BlitEncoder) {
        enc.end_encoding();
    }

    fn copy_buffer_to_buffer(&self, enc: &mut Self::BlitEncoder, src: &Self::Buffer, src_offset: u64, dst: &Self::Buffer, dst_offset: u64, size: u64) {
        enc.copy_from_buffer(&src.0, src_offset, &dst.0, dst_offset, size);
    }

    fn copy_buffer_to_texture(&self, enc: &mut Self::BlitEncoder, src: &Self::Buffer, src_offset: u64, src_bytes_per_row: u32, dst: &Self::Texture, level: u32, slice: u32, width: u32, height: u32, depth: u32) {
        enc.copy_from_buffer_to_texture(
            &src.0,
            src_offset,
            src_bytes_per_row as u64,
            0,
            MTLSize { width: width as u64, height: height as u64, depth: depth as u64 },
            &dst.0,
            slice as u64,
            level as u64,
            MTLOrigin { x: 0, y: 0, z: 0 },
            metal::MTLBlitOption::None,
        );
    }

    fn copy_texture_to_buffer(&self, enc: &mut Self::BlitEncoder, src: &Self::Texture, level: u32, slice: u32, dst: &Self::Buffer, dst_offset: u64, dst_bytes_per_row: u32, width: u32, height: u32, depth: u32) {
        enc.copy_from_texture_to_buffer(
            &src.0,
            slice as u64,
            level as u64,
            MTLOrigin { x: 0, y: 0, z: 0 },
            MTLSize { width: width as u64, height: height as u64, depth: depth as u64 },
            &dst.0,
            dst_offset,
            dst_bytes_per_row as u64,
            0,
            metal::MTLBlitOption::None,
        );
    }

    fn copy_texture_to_texture(&self, enc: &mut Self::BlitEncoder, src: &Self::Texture, src_level: u32, src_slice: u32, dst: &Self::Texture, dst_level: u32, dst_slice: u32, width: u32, height: u32, depth: u32) {
        enc.copy_from_texture(
            &src.0,
            src_slice as u64,
            src_level as u64,
            MTLOrigin { x: 0, y: 0, z: 0 },
            MTLSize { width: width as u64, height: height as u64, depth: depth as u64 },
            &dst.0,
            dst_slice as u64,
            dst_level as u64,
            MTLOrigin { x: 0, y: 0, z: 0 },
        );
    }
}
