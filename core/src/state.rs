//! `ContextState`: the D3D11 pipeline state the immediate context stages
//! before a draw or dispatch.

use smallvec::SmallVec;

use crate::backend::PrimitiveTopology;
use crate::binding::BindingSet;
use crate::handle::{BufferHandle, ResourceView, SamplerHandle, TextureHandle, ViewKey};

pub const MAX_VERTEX_BUFFER_SLOTS: usize = 32;
pub const MAX_VIEWPORTS: usize = 16;
pub const MAX_RENDER_TARGETS: usize = 8;

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Viewport {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub min_depth: f32,
    pub max_depth: f32,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ScissorRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum IndexFormat {
    U16,
    U32,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct VertexBufferBinding {
    pub buffer: BufferHandle,
    pub stride: u32,
    pub offset: u32,
}

/// Input assembler state.
#[derive(Default)]
pub struct InputAssemblerState {
    pub topology: Option<PrimitiveTopology>,
    pub vertex_buffers: SmallVec<[Option<VertexBufferBinding>; MAX_VERTEX_BUFFER_SLOTS]>,
    pub index_buffer: Option<BufferHandle>,
    pub index_format: Option<IndexFormat>,
    pub index_offset: u32,
    pub vertex_buffer_dirty: crate::binding::DirtyMask,
}

/// Per-shader-stage binding sets (CB, SRV, Sampler, UAV).
pub struct StageBindings {
    pub constant_buffers: BindingSet<BufferHandle>,
    pub shader_resources: BindingSet<ResourceView>,
    pub samplers: BindingSet<SamplerHandle>,
    pub unordered_access: BindingSet<ResourceView>,
}

impl StageBindings {
    pub fn new() -> StageBindings {
        StageBindings {
            constant_buffers: BindingSet::new(14),
            shader_resources: BindingSet::new(128),
            samplers: BindingSet::new(16),
            unordered_access: BindingSet::new(8),
        }
    }
}

impl Default for StageBindings {
    fn default() -> Self {
        StageBindings::new()
    }
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct RenderTargetBinding {
    pub texture: TextureHandle,
    pub view: ViewKey,
}

/// Output-merger state: render targets, depth/stencil, blend state.
#[derive(Default)]
pub struct OutputMergerState {
    pub render_targets: SmallVec<[Option<RenderTargetBinding>; MAX_RENDER_TARGETS]>,
    pub depth_stencil: Option<RenderTargetBinding>,
    pub unordered_access: BindingSet<ResourceView>,
    pub blend_factor: [f32; 4],
    pub sample_mask: u32,
    pub stencil_ref: u32,
}

impl OutputMergerState {
    pub fn new() -> OutputMergerState {
        OutputMergerState {
            render_targets: SmallVec::new(),
            depth_stencil: None,
            unordered_access: BindingSet::new(8),
            blend_factor: [1.0, 1.0, 1.0, 1.0],
            sample_mask: u32::MAX,
            stencil_ref: 0,
        }
    }
}

/// Rasterizer state: viewports and scissors.
#[derive(Default)]
pub struct RasterizerStageState {
    pub viewports: SmallVec<[Viewport; MAX_VIEWPORTS]>,
    pub scissors: SmallVec<[ScissorRect; MAX_VIEWPORTS]>,
}

/// Aggregates all D3D11 pipeline state the context stages before a draw or
/// dispatch.
pub struct ContextState {
    pub input_assembler: InputAssemblerState,
    pub vertex_stage: StageBindings,
    pub pixel_stage: StageBindings,
    pub compute_stage: StageBindings,
    pub output_merger: OutputMergerState,
    pub rasterizer: RasterizerStageState,
}

impl ContextState {
    pub fn new() -> ContextState {
        ContextState {
            input_assembler: InputAssemblerState::default(),
            vertex_stage: StageBindings::new(),
            pixel_stage: StageBindings::new(),
            compute_stage: StageBindings::new(),
            output_merger: OutputMergerState::new(),
            rasterizer: RasterizerStageState::default(),
        }
    }
}

impl Default for ContextState {
    fn default() -> Self {
        ContextState::new()
    }
}
