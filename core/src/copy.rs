//! Copy and update paths: `CopyResource` / `CopySubresourceRegion`
//! and `UpdateSubresource` / `UpdateSubresource1`.

use crate::error::{ContextError, Result};
use crate::format::PixelFormat;

/// Usage class of a resource, as far as the copy/update dispatch cares.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ResourceKind {
    Default,
    Dynamic,
    Staging,
}

/// An axis-aligned copy region in texels, pre-clip.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct CopyBox {
    pub left: u32,
    pub top: u32,
    pub front: u32,
    pub right: u32,
    pub bottom: u32,
    pub back: u32,
}

impl CopyBox {
    pub fn width(&self) -> u32 {
        self.right.saturating_sub(self.left)
    }
    pub fn height(&self) -> u32 {
        self.bottom.saturating_sub(self.top)
    }
    pub fn depth(&self) -> u32 {
        self.back.saturating_sub(self.front)
    }

    /// Clips `self` to `[0, width) x [0, height) x [0, depth)`, as required
    /// when bridging a block-compressed source against an uncompressed
    /// destination view of the same data.
    pub fn clipped_to(&self, width: u32, height: u32, depth: u32) -> CopyBox {
        CopyBox {
            left: self.left.min(width),
            top: self.top.min(height),
            front: self.front.min(depth),
            right: self.right.min(width),
            bottom: self.bottom.min(height),
            back: self.back.min(depth),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.width() == 0 || self.height() == 0 || self.depth() == 0
    }
}

/// What the encoder-state driver must do to perform a copy: either a
/// direct on-device blit, or a staged copy through a temporary buffer
/// because Metal requires matching pixel formats for direct
/// texture-to-texture copies.
#[derive(Debug, PartialEq, Eq)]
pub enum CopyPlan {
    DirectBlit,
    StagedThroughBuffer,
}

/// Decides how a texture-to-texture copy between `src_format` and
/// `dst_format` must be performed: same format is a direct blit; different
/// format but identical bits-per-texel/block stages through a temporary
/// arena buffer.
pub fn plan_texture_copy(src_format: PixelFormat, dst_format: PixelFormat) -> Result<CopyPlan> {
    if src_format == dst_format {
        return Ok(CopyPlan::DirectBlit);
    }
    if src_format.is_cast_compatible_with(dst_format) {
        return Ok(CopyPlan::StagedThroughBuffer);
    }
    Err(ContextError::invalid_argument(format!(
        "cannot copy between incompatible formats {:?} and {:?}",
        src_format, dst_format
    )))
}

/// Whether a copy between two resource kinds is on-device or must route
/// through a staging/readback path, and whether the context should be
/// flushed early so a subsequent `Map` can observe coherent data.
#[derive(Debug, PartialEq, Eq)]
pub struct CopyDispatch {
    pub requires_readback_flush: bool,
    pub blit_kind: BlitKind,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BlitKind {
    Normal,
    Readback,
    Update,
}

pub fn dispatch_copy(src_kind: ResourceKind, dst_kind: ResourceKind) -> CopyDispatch {
    match (src_kind, dst_kind) {
        (_, ResourceKind::Staging) => CopyDispatch { requires_readback_flush: true, blit_kind: BlitKind::Readback },
        (ResourceKind::Staging, _) => CopyDispatch { requires_readback_flush: false, blit_kind: BlitKind::Update },
        _ => CopyDispatch { requires_readback_flush: false, blit_kind: BlitKind::Normal },
    }
}

/// Row-pitch repacking decision for `UpdateSubresource`: Metal requires a
/// minimum alignment for `replaceRegion`'s source stride; when the
/// application's row pitch does not match, the upload must be repacked row
/// by row into a fresh staging region.
pub fn needs_row_repack(app_row_pitch: u32, required_alignment: u32) -> bool {
    app_row_pitch % required_alignment != 0
}

/// Repacks `src`, whose rows are `src_row_pitch` bytes wide carrying
/// `row_bytes` bytes of real data each, into a tightly-packed destination
/// buffer aligned to `dst_row_pitch`.
pub fn repack_rows(src: &[u8], row_bytes: u32, src_row_pitch: u32, dst_row_pitch: u32, rows: u32) -> Vec<u8> {
    let mut out = vec![0u8; (dst_row_pitch * rows) as usize];
    for row in 0..rows {
        let src_start = (row * src_row_pitch) as usize;
        let dst_start = (row * dst_row_pitch) as usize;
        let n = row_bytes as usize;
        out[dst_start..dst_start + n].copy_from_slice(&src[src_start..src_start + n]);
    }
    out
}

/// `UpdateSubresource`'s first dispatch decision: a live
/// GPU-private default texture with no outstanding GPU contention can take
/// Metal's direct CPU->texture `replaceRegion`; everything else stages
/// through the ring-bump staging buffer.
pub fn can_replace_region_directly(kind: ResourceKind, gpu_contended: bool) -> bool {
    kind == ResourceKind::Default && !gpu_contended
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_formats_plan_a_direct_blit() {
        assert_eq!(
            plan_texture_copy(PixelFormat::Bc1RgbaUnorm, PixelFormat::Bc1RgbaUnorm).unwrap(),
            CopyPlan::DirectBlit
        );
    }

    #[test]
    fn cast_compatible_formats_stage_through_a_buffer() {
        assert_eq!(
            plan_texture_copy(PixelFormat::R8G8B8A8Unorm, PixelFormat::B8G8R8A8Unorm).unwrap(),
            CopyPlan::StagedThroughBuffer
        );
    }

    #[test]
    fn incompatible_formats_are_rejected() {
        assert!(plan_texture_copy(PixelFormat::R8G8B8A8Unorm, PixelFormat::Bc1RgbaUnorm).is_err());
    }

    #[test]
    fn copy_into_staging_requires_a_readback_flush() {
        let d = dispatch_copy(ResourceKind::Default, ResourceKind::Staging);
        assert!(d.requires_readback_flush);
        assert_eq!(d.blit_kind, BlitKind::Readback);
    }

    #[test]
    fn box_clipping_to_virtual_size_caps_each_axis() {
        let b = CopyBox { left: 0, top: 0, front: 0, right: 300, bottom: 300, back: 1 };
        let clipped = b.clipped_to(256, 256, 1);
        assert_eq!(clipped.width(), 256);
        assert_eq!(clipped.height(), 256);
    }

    #[test]
    fn row_repack_preserves_real_bytes_per_row() {
        let src = vec![1u8, 2, 3, 0, 4, 5, 6, 0];
        let packed = repack_rows(&src, 3, 4, 3, 2);
        assert_eq!(packed, vec![1, 2, 3, 4, 5, 6]);
    }
}
