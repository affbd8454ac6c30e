//! Translation tables between `dxmtl-core`'s backend-agnostic enums and
//! their Metal equivalents. Kept as small pure functions so they can be
//! unit-tested without a Metal device.

use dxmtl_core::allocation::AllocationFlags;
use dxmtl_core::backend::{IndexType, LoadAction, PrimitiveTopology, StoreAction};
use dxmtl_core::format::{BufferUsage, PixelFormat, TextureUsage};
use metal::{
    MTLIndexType, MTLLoadAction, MTLPixelFormat, MTLPrimitiveType, MTLResourceOptions,
    MTLStorageMode, MTLStoreAction, MTLTextureUsage,
};

/// `Depth24UnormStencil8` only exists on Intel Macs (`isDepth24Stencil8PixelFormatSupported`);
/// Apple Silicon GPUs lack it and callers should prefer `Depth32FloatStencil8`.
/// The core leaves that substitution to the application layer (the DXGI
/// format table is out of scope here); this mapping is a direct, lossless
/// translation and does not second-guess it.
pub fn pixel_format_to_mtl(format: PixelFormat) -> MTLPixelFormat {
    use PixelFormat::*;
    match format {
        R8Unorm => MTLPixelFormat::R8Unorm,
        R8G8B8A8Unorm => MTLPixelFormat::RGBA8Unorm,
        R8G8B8A8UnormSrgb => MTLPixelFormat::RGBA8Unorm_sRGB,
        B8G8R8A8Unorm => MTLPixelFormat::BGRA8Unorm,
        B8G8R8A8UnormSrgb => MTLPixelFormat::BGRA8Unorm_sRGB,
        R16Float => MTLPixelFormat::R16Float,
        R16G16Float => MTLPixelFormat::RG16Float,
        R16G16B16A16Float => MTLPixelFormat::RGBA16Float,
        R32Float => MTLPixelFormat::R32Float,
        R32G32Float => MTLPixelFormat::RG32Float,
        R32G32B32A32Float => MTLPixelFormat::RGBA32Float,
        R10G10B10A2Unorm => MTLPixelFormat::RGB10A2Unorm,
        Depth32Float => MTLPixelFormat::Depth32Float,
        Depth24UnormStencil8 => MTLPixelFormat::Depth24Unorm_Stencil8,
        Depth32FloatStencil8 => MTLPixelFormat::Depth32Float_Stencil8,
        Bc1RgbaUnorm => MTLPixelFormat::BC1_RGBA,
        Bc1RgbaUnormSrgb => MTLPixelFormat::BC1_RGBA_sRGB,
        Bc3RgbaUnorm => MTLPixelFormat::BC3_RGBA,
        Bc5RgUnorm => MTLPixelFormat::BC5_RGUnorm,
        Bc7RgbaUnorm => MTLPixelFormat::BC7_RGBAUnorm,
    }
}

pub fn texture_usage_to_mtl(usage: TextureUsage) -> MTLTextureUsage {
    let mut out = MTLTextureUsage::empty();
    if usage.contains(TextureUsage::SAMPLED) {
        out |= MTLTextureUsage::ShaderRead;
    }
    if usage.contains(TextureUsage::RENDER_TARGET) || usage.contains(TextureUsage::DEPTH_STENCIL) {
        out |= MTLTextureUsage::RenderTarget;
    }
    if usage.contains(TextureUsage::STORAGE) {
        out |= MTLTextureUsage::ShaderRead | MTLTextureUsage::ShaderWrite;
    }
    if usage.contains(TextureUsage::PIXEL_FORMAT_VIEW) {
        out |= MTLTextureUsage::PixelFormatView;
    }
    out
}

/// `AllocationFlags` carries the storage-mode decision the
/// resource-virtualization layer already made; this only transcribes it
/// into `MTLResourceOptions`, it never second-guesses `GPU_PRIVATE` vs.
/// `SHARED` vs. `GPU_MANAGED`.
pub fn allocation_flags_to_resource_options(flags: AllocationFlags) -> MTLResourceOptions {
    let storage = if flags.contains(AllocationFlags::GPU_PRIVATE) {
        MTLResourceOptions::StorageModePrivate
    } else if flags.contains(AllocationFlags::GPU_MANAGED) {
        MTLResourceOptions::StorageModeManaged
    } else {
        MTLResourceOptions::StorageModeShared
    };
    let cache = if flags.contains(AllocationFlags::CPU_WRITE_COMBINED) {
        MTLResourceOptions::CPUCacheModeWriteCombined
    } else {
        MTLResourceOptions::empty()
    };
    let tracking = if flags.contains(AllocationFlags::TRACKED) {
        MTLResourceOptions::empty()
    } else {
        MTLResourceOptions::HazardTrackingModeUntracked
    };
    storage | cache | tracking
}

pub fn storage_mode_to_mtl(flags: AllocationFlags) -> MTLStorageMode {
    if flags.contains(AllocationFlags::GPU_PRIVATE) {
        MTLStorageMode::Private
    } else if flags.contains(AllocationFlags::GPU_MANAGED) {
        MTLStorageMode::Managed
    } else {
        MTLStorageMode::Shared
    }
}

pub fn load_action_to_mtl(action: LoadAction) -> MTLLoadAction {
    match action {
        LoadAction::Load => MTLLoadAction::Load,
        LoadAction::Clear => MTLLoadAction::Clear,
        LoadAction::DontCare => MTLLoadAction::DontCare,
    }
}

pub fn store_action_to_mtl(action: StoreAction) -> MTLStoreAction {
    match action {
        StoreAction::Store => MTLStoreAction::Store,
        StoreAction::DontCare => MTLStoreAction::DontCare,
        StoreAction::MultisampleResolve => MTLStoreAction::MultisampleResolve,
    }
}

pub fn primitive_topology_to_mtl(topology: PrimitiveTopology) -> MTLPrimitiveType {
    match topology {
        PrimitiveTopology::PointList => MTLPrimitiveType::Point,
        PrimitiveTopology::LineList => MTLPrimitiveType::Line,
        PrimitiveTopology::LineStrip => MTLPrimitiveType::LineStrip,
        PrimitiveTopology::TriangleList => MTLPrimitiveType::Triangle,
        PrimitiveTopology::TriangleStrip => MTLPrimitiveType::TriangleStrip,
    }
}

pub fn index_type_to_mtl(index_type: IndexType) -> MTLIndexType {
    match index_type {
        IndexType::U16 => MTLIndexType::UInt16,
        IndexType::U32 => MTLIndexType::UInt32,
    }
}

/// `BufferUsage` does not affect `MTLResourceOptions` (Metal buffers carry
/// no usage-specific creation flag the way textures do); kept as a function
/// anyway so call sites read the same as the texture path and a future
/// usage-dependent distinction (e.g. indirect-command buffers) has a home.
pub fn buffer_usage_is_indirect(usage: BufferUsage) -> bool {
    usage.contains(BufferUsage::INDIRECT)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn srgb_formats_round_trip_to_srgb_mtl_variants() {
        assert_eq!(pixel_format_to_mtl(PixelFormat::R8G8B8A8UnormSrgb), MTLPixelFormat::RGBA8Unorm_sRGB);
        assert_eq!(pixel_format_to_mtl(PixelFormat::B8G8R8A8UnormSrgb), MTLPixelFormat::BGRA8Unorm_sRGB);
    }

    #[test]
    fn gpu_private_allocation_maps_to_private_storage_with_no_tracking_by_default() {
        let opts = allocation_flags_to_resource_options(AllocationFlags::GPU_PRIVATE);
        assert!(opts.contains(MTLResourceOptions::StorageModePrivate));
        assert!(opts.contains(MTLResourceOptions::HazardTrackingModeUntracked));
    }

    #[test]
    fn tracked_shared_allocation_keeps_automatic_hazard_tracking() {
        let opts = allocation_flags_to_resource_options(AllocationFlags::SHARED | AllocationFlags::TRACKED);
        assert!(opts.contains(MTLResourceOptions::StorageModeShared));
        assert!(!opts.contains(MTLResourceOptions::HazardTrackingModeUntracked));
    }

    #[test]
    fn sampled_and_storage_usage_combine_shader_read_and_write() {
        let usage = texture_usage_to_mtl(TextureUsage::SAMPLED | TextureUsage::STORAGE);
        assert!(usage.contains(MTLTextureUsage::ShaderRead));
        assert!(usage.contains(MTLTextureUsage::ShaderWrite));
    }
}
