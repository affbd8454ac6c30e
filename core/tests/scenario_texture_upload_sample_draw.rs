//! End-to-end: upload a texture, bind it as a fragment-stage SRV with a
//! sampler, and draw a triangle against it.

mod support;

use dxmtl_core::allocation::{AllocationFlags, TextureExtent};
use dxmtl_core::argbuf::StageReflection;
use dxmtl_core::backend::{PrimitiveTopology, SamplerDesc, ShaderStage};
use dxmtl_core::chunk::Command;
use dxmtl_core::format::{PixelFormat, TextureUsage, ViewKind};
use dxmtl_core::handle::{ResourceHandle, ResourceView};
use dxmtl_core::view::{AttachmentDescriptor, SubresourceRange};

use support::{new_context, render_pipeline_desc, RecordedCall};

#[test]
fn texture_upload_then_sampled_draw_records_srv_binding_and_replaces_region() {
    let (mut ctx, backend_handle) = new_context();

    let sampled = ctx
        .create_texture(
            PixelFormat::R8G8B8A8Unorm,
            TextureExtent { width: 4, height: 4, depth_or_array_layers: 1, mip_levels: 1 },
            1,
            TextureUsage::SAMPLED,
            AllocationFlags::GPU_PRIVATE | AllocationFlags::TRACKED,
            None,
        )
        .unwrap();
    let srv = ctx
        .create_shader_resource_view(
            sampled,
            PixelFormat::R8G8B8A8Unorm,
            ViewKind::Texture2d,
            SubresourceRange::single_mip_single_slice(0, 0),
        )
        .unwrap();

    let texel_data = vec![0xAAu8; 4 * 4 * 4];
    ctx.update_subresource(sampled, 0, 0, &texel_data, 16, 256, false).unwrap();

    let sampler = ctx
        .create_sampler(SamplerDesc { clamp_to_edge: true, linear_filter: true, max_anisotropy: 1 })
        .unwrap();

    let render_target = ctx
        .create_texture(
            PixelFormat::R8G8B8A8Unorm,
            TextureExtent { width: 4, height: 4, depth_or_array_layers: 1, mip_levels: 1 },
            1,
            TextureUsage::RENDER_TARGET,
            AllocationFlags::GPU_PRIVATE | AllocationFlags::TRACKED,
            None,
        )
        .unwrap();
    let rtv = ctx
        .create_render_target_view(
            render_target,
            PixelFormat::R8G8B8A8Unorm,
            SubresourceRange::single_mip_single_slice(0, 0),
            AttachmentDescriptor { array_length: 1, sample_count: 1, depth_plane: 0, width: 4, height: 4 },
        )
        .unwrap();
    ctx.om_set_render_targets(
        &[Some(dxmtl_core::state::RenderTargetBinding { texture: render_target, view: rtv })],
        None,
    );

    let pipeline = ctx
        .create_render_pipeline(
            render_pipeline_desc(),
            StageReflection::default(),
            StageReflection { shader_resources: 1, samplers: 1, ..Default::default() },
            0,
            false,
        )
        .unwrap();
    ctx.set_render_pipeline(pipeline).unwrap();
    ctx.ia_set_primitive_topology(PrimitiveTopology::TriangleList);
    ctx.set_shader_resource(
        ShaderStage::Fragment,
        0,
        ResourceView { resource: ResourceHandle::Texture(sampled), view: srv },
        Default::default(),
    );
    ctx.set_sampler(ShaderStage::Fragment, 0, sampler);
    ctx.draw(0, 3, 1).unwrap();

    let recorded = ctx.queue().current_chunk().commands().to_vec();
    assert!(recorded.iter().any(|c| matches!(c, Command::OpenRenderPass { .. })));
    assert!(recorded.iter().any(|c| matches!(
        c,
        Command::SetArgumentBufferOffset { stage: ShaderStage::Fragment, .. }
    )));
    assert!(recorded.iter().any(|c| matches!(c, Command::Draw { vertex_count: 3, .. })));

    ctx.flush().unwrap();
    let calls = backend_handle.calls();
    assert!(calls.iter().any(|c| matches!(
        c,
        RecordedCall::ReplaceTextureRegion { len, .. } if *len == texel_data.len()
    )));
}
