//! Pixel formats and view-kind/usage flags shared by buffers and textures.
//!
//! A deliberately small subset of the DXGI format table: enough to exercise
//! every path that matters here (render targets, depth/stencil, block-
//! compressed sampling, typed buffer views) without reproducing the full
//! ~120-entry DXGI_FORMAT enumeration, which belongs to the external COM
//! surface, not the core.

use bitflags::bitflags;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    R8Unorm,
    R8G8B8A8Unorm,
    R8G8B8A8UnormSrgb,
    B8G8R8A8Unorm,
    B8G8R8A8UnormSrgb,
    R16Float,
    R16G16Float,
    R16G16B16A16Float,
    R32Float,
    R32G32Float,
    R32G32B32A32Float,
    R10G10B10A2Unorm,
    Depth32Float,
    Depth24UnormStencil8,
    Depth32FloatStencil8,
    Bc1RgbaUnorm,
    Bc1RgbaUnormSrgb,
    Bc3RgbaUnorm,
    Bc5RgUnorm,
    Bc7RgbaUnorm,
}

impl PixelFormat {
    /// Size in bytes of one texel for uncompressed formats, or one block for
    /// block-compressed formats (paired with `block_dim()`).
    pub fn texel_or_block_size(self) -> u32 {
        use PixelFormat::*;
        match self {
            R8Unorm => 1,
            R8G8B8A8Unorm | R8G8B8A8UnormSrgb | B8G8R8A8Unorm | B8G8R8A8UnormSrgb
            | R10G10B10A2Unorm | R16G16Float | Depth32Float | Depth24UnormStencil8 => 4,
            Depth32FloatStencil8 => 8,
            R16Float => 2,
            R16G16B16A16Float | R32G32Float => 8,
            R32Float => 4,
            R32G32B32A32Float => 16,
            Bc1RgbaUnorm | Bc1RgbaUnormSrgb => 8,
            Bc3RgbaUnorm | Bc5RgUnorm | Bc7RgbaUnorm => 16,
        }
    }

    /// Block footprint in texels; `(1, 1)` for every uncompressed format.
    pub fn block_dim(self) -> (u32, u32) {
        use PixelFormat::*;
        match self {
            Bc1RgbaUnorm | Bc1RgbaUnormSrgb | Bc3RgbaUnorm | Bc5RgUnorm | Bc7RgbaUnorm => (4, 4),
            _ => (1, 1),
        }
    }

    pub fn is_block_compressed(self) -> bool {
        self.block_dim() != (1, 1)
    }

    pub fn is_depth_stencil(self) -> bool {
        matches!(
            self,
            PixelFormat::Depth32Float
                | PixelFormat::Depth24UnormStencil8
                | PixelFormat::Depth32FloatStencil8
        )
    }

    /// `true` if `self` and `other` occupy the same number of bits per texel
    /// (or per block), which is what Metal requires to stage a direct
    /// texture-to-texture copy across a format cast.
    pub fn is_cast_compatible_with(self, other: PixelFormat) -> bool {
        self.texel_or_block_size() == other.texel_or_block_size()
            && self.block_dim() == other.block_dim()
    }
}

/// View kind: how a range of a resource's subresources is reinterpreted.
/// Mirrors the D3D11 SRV/RTV/UAV dimension enumeration.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ViewKind {
    Texture1d,
    Texture1dArray,
    Texture2d,
    Texture2dArray,
    Texture2dMultisample,
    Texture2dMultisampleArray,
    Texture3d,
    Cube,
    CubeArray,
    Buffer,
    BufferEx,
}

bitflags! {
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub struct TextureUsage: u32 {
        const SAMPLED         = 0b0000_0001;
        const RENDER_TARGET   = 0b0000_0010;
        const DEPTH_STENCIL   = 0b0000_0100;
        const STORAGE         = 0b0000_1000;
        const PIXEL_FORMAT_VIEW = 0b0001_0000;
    }
}

bitflags! {
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub struct BufferUsage: u32 {
        const SHADER_READ     = 0b0000_0001;
        const SHADER_WRITE    = 0b0000_0010;
        const VERTEX          = 0b0000_0100;
        const INDEX           = 0b0000_1000;
        const INDIRECT        = 0b0001_0000;
    }
}
