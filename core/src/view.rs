//! View descriptors and the content-addressed descriptor table each logical
//! resource keeps.

use smallvec::SmallVec;

use crate::format::{PixelFormat, ViewKind};
use crate::handle::ViewKey;

/// Mip levels and array slices addressed by a view.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct SubresourceRange {
    pub base_mip: u32,
    pub mip_count: u32,
    pub base_slice: u32,
    pub slice_count: u32,
}

impl SubresourceRange {
    pub fn single_mip_single_slice(mip: u32, slice: u32) -> SubresourceRange {
        SubresourceRange {
            base_mip: mip,
            mip_count: 1,
            base_slice: slice,
            slice_count: 1,
        }
    }

    pub fn all_mips_all_slices(mip_count: u32, slice_count: u32) -> SubresourceRange {
        SubresourceRange {
            base_mip: 0,
            mip_count,
            base_slice: 0,
            slice_count,
        }
    }
}

/// Extra bookkeeping carried only by render-target/depth-stencil views:
/// the render-pass setup step reads these directly off the view rather
/// than re-deriving them from the texture each time.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct AttachmentDescriptor {
    pub array_length: u32,
    pub sample_count: u32,
    pub depth_plane: u32,
    pub width: u32,
    pub height: u32,
}

/// A small value type, content-addressed: two `createView` calls with
/// identical descriptors on the same resource share one `ViewKey`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct ViewDescriptor {
    pub format: PixelFormat,
    pub kind: ViewKind,
    pub range: SubresourceRange,
    pub attachment: Option<AttachmentDescriptor>,
}

/// Per-resource table of view descriptors, append-only and ordered: the
/// array index doubles as the view's stable key. Does not itself hold any
/// backend view object -- those are cached separately per current
/// `Allocation` and rebuilt on rename (see `resource.rs`).
#[derive(Debug, Default)]
pub struct ViewTable {
    descriptors: SmallVec<[ViewDescriptor; 4]>,
}

impl ViewTable {
    pub fn new() -> ViewTable {
        ViewTable {
            descriptors: SmallVec::new(),
        }
    }

    /// Pure lookup-or-append; never touches a backend view.
    pub fn create_view(&mut self, descriptor: ViewDescriptor) -> ViewKey {
        if let Some(pos) = self.descriptors.iter().position(|d| *d == descriptor) {
            return ViewKey(pos as u32);
        }
        self.descriptors.push(descriptor);
        ViewKey((self.descriptors.len() - 1) as u32)
    }

    pub fn get(&self, key: ViewKey) -> Option<&ViewDescriptor> {
        self.descriptors.get(key.0 as usize)
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn simple_view(format: PixelFormat) -> ViewDescriptor {
        ViewDescriptor {
            format,
            kind: ViewKind::Texture2d,
            range: SubresourceRange::all_mips_all_slices(1, 1),
            attachment: None,
        }
    }

    #[test]
    fn identical_descriptors_share_one_key() {
        let mut table = ViewTable::new();
        let k1 = table.create_view(simple_view(PixelFormat::R8G8B8A8Unorm));
        let k2 = table.create_view(simple_view(PixelFormat::R8G8B8A8Unorm));
        assert_eq!(k1, k2);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn distinct_descriptors_get_distinct_keys_in_creation_order() {
        let mut table = ViewTable::new();
        let k1 = table.create_view(simple_view(PixelFormat::R8G8B8A8Unorm));
        let k2 = table.create_view(simple_view(PixelFormat::B8G8R8A8Unorm));
        assert_ne!(k1, k2);
        assert_eq!(k1, ViewKey(0));
        assert_eq!(k2, ViewKey(1));
    }
}
