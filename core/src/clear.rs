//! Clear-pass coalescing.
//!
//! `ClearRTV`/`ClearDSV` do not themselves open a render pass. Instead they
//! accumulate into a pending clear pass; when a render pass subsequently
//! opens against overlapping targets, the accumulated clears become that
//! pass's load actions. If nothing ever opens against them, the pending
//! clears are flushed as a standalone no-op render pass whose sole purpose
//! is to clear.

use smallvec::SmallVec;

use crate::backend::ClearColor;
use crate::handle::{TextureHandle, ViewKey};

pub const MAX_COLOR_ATTACHMENTS: usize = 8;

#[derive(Copy, Clone, Debug)]
pub struct PendingColorClear {
    pub texture: TextureHandle,
    pub view: ViewKey,
    pub color: ClearColor,
}

#[derive(Copy, Clone, Debug)]
pub struct PendingDepthStencilClear {
    pub texture: TextureHandle,
    pub view: ViewKey,
    pub clear_depth: Option<f32>,
    pub clear_stencil: Option<u32>,
}

/// Accumulates clears not yet absorbed into a render pass's load actions.
#[derive(Default)]
pub struct ClearPass {
    colors: SmallVec<[PendingColorClear; MAX_COLOR_ATTACHMENTS]>,
    depth_stencil: Option<PendingDepthStencilClear>,
}

impl ClearPass {
    pub fn new() -> ClearPass {
        ClearPass::default()
    }

    pub fn is_empty(&self) -> bool {
        self.colors.is_empty() && self.depth_stencil.is_none()
    }

    /// Records (or coalesces, last-writer-wins) a color clear against
    /// `(texture, view)`.
    pub fn clear_color(&mut self, texture: TextureHandle, view: ViewKey, color: ClearColor) {
        if let Some(existing) = self.colors.iter_mut().find(|c| c.texture == texture && c.view == view) {
            existing.color = color;
            return;
        }
        if self.colors.len() == MAX_COLOR_ATTACHMENTS {
            // The eighth attachment's worth of pending clears is full;
            // drop the oldest rather than silently losing the newest.
            self.colors.remove(0);
        }
        self.colors.push(PendingColorClear { texture, view, color });
    }

    pub fn clear_depth_stencil(
        &mut self,
        texture: TextureHandle,
        view: ViewKey,
        depth: Option<f32>,
        stencil: Option<u32>,
    ) {
        match &mut self.depth_stencil {
            Some(existing) if existing.texture == texture && existing.view == view => {
                if depth.is_some() {
                    existing.clear_depth = depth;
                }
                if stencil.is_some() {
                    existing.clear_stencil = stencil;
                }
            }
            _ => {
                self.depth_stencil = Some(PendingDepthStencilClear {
                    texture,
                    view,
                    clear_depth: depth,
                    clear_stencil: stencil,
                });
            }
        }
    }

    /// Removes and returns the pending color clear for `(texture, view)` if
    /// present, so the render-pass-setup step can absorb it as a Clear load
    /// action.
    pub fn take_color(&mut self, texture: TextureHandle, view: ViewKey) -> Option<ClearColor> {
        let pos = self.colors.iter().position(|c| c.texture == texture && c.view == view)?;
        Some(self.colors.remove(pos).color)
    }

    pub fn take_depth_stencil(
        &mut self,
        texture: TextureHandle,
        view: ViewKey,
    ) -> Option<PendingDepthStencilClear> {
        match &self.depth_stencil {
            Some(ds) if ds.texture == texture && ds.view == view => self.depth_stencil.take(),
            _ => None,
        }
    }

    /// Drains everything still pending, for emission as a standalone no-op
    /// render pass (nothing opened a matching render pass before `Flush`).
    pub fn drain(&mut self) -> (SmallVec<[PendingColorClear; MAX_COLOR_ATTACHMENTS]>, Option<PendingDepthStencilClear>) {
        (std::mem::take(&mut self.colors), self.depth_stencil.take())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use slotmap::KeyData;

    fn tex(i: u64) -> TextureHandle {
        KeyData::from_ffi(i).into()
    }

    fn white() -> ClearColor {
        ClearColor { r: 1.0, g: 1.0, b: 1.0, a: 1.0 }
    }

    #[test]
    fn repeated_clear_on_same_view_coalesces_to_latest_color() {
        let mut pass = ClearPass::new();
        pass.clear_color(tex(1), ViewKey(0), ClearColor { r: 0.0, g: 0.0, b: 0.0, a: 1.0 });
        pass.clear_color(tex(1), ViewKey(0), white());
        assert_eq!(pass.colors.len(), 1);
        assert_eq!(pass.take_color(tex(1), ViewKey(0)).unwrap(), white());
    }

    #[test]
    fn take_color_removes_only_matching_entry() {
        let mut pass = ClearPass::new();
        pass.clear_color(tex(1), ViewKey(0), white());
        pass.clear_color(tex(2), ViewKey(0), white());
        assert!(pass.take_color(tex(1), ViewKey(0)).is_some());
        assert!(!pass.is_empty());
        assert!(pass.take_color(tex(2), ViewKey(0)).is_some());
        assert!(pass.is_empty());
    }

    #[test]
    fn depth_and_stencil_clear_independently_overwrite() {
        let mut pass = ClearPass::new();
        pass.clear_depth_stencil(tex(1), ViewKey(0), Some(1.0), None);
        pass.clear_depth_stencil(tex(1), ViewKey(0), None, Some(0));
        let ds = pass.take_depth_stencil(tex(1), ViewKey(0)).unwrap();
        assert_eq!(ds.clear_depth, Some(1.0));
        assert_eq!(ds.clear_stencil, Some(0));
    }
}
