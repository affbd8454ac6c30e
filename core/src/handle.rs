//! Typed handles into the resource tables owned by `Context`.
//!
//! The application-facing objects (`ID3D11Buffer`, `ID3D11Texture2D`, ...)
//! are modeled elsewhere as refcounted wrappers; what flows through the
//! core's hot path is the lightweight key that indexes into a `SlotMap`,
//! generation-checked so a stale handle from a destroyed resource can never
//! alias a freshly allocated one.

use std::fmt;

use slotmap::new_key_type;

new_key_type! {
    /// Key into `Context`'s buffer table.
    pub struct BufferHandle;
    /// Key into `Context`'s texture table.
    pub struct TextureHandle;
    /// Key into `Context`'s sampler table.
    pub struct SamplerHandle;
    /// Key into the pipeline descriptor cache.
    pub struct PipelineHandle;
    /// Key into the arena table.
    pub struct ArenaHandle;
    /// Key into `Context`'s occlusion-query table.
    pub struct QueryHandle;
}

/// Either a buffer or a texture handle; several operations (CopyResource,
/// UpdateSubresource) are polymorphic over the two.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ResourceHandle {
    Buffer(BufferHandle),
    Texture(TextureHandle),
}

impl From<BufferHandle> for ResourceHandle {
    fn from(h: BufferHandle) -> Self {
        ResourceHandle::Buffer(h)
    }
}

impl From<TextureHandle> for ResourceHandle {
    fn from(h: TextureHandle) -> Self {
        ResourceHandle::Texture(h)
    }
}

/// A view on a specific resource: the resource it was created against, plus
/// the view key within that resource's own descriptor table. SRV/UAV
/// binding slots store this rather than a bare `ViewKey`, since a view key
/// is only meaningful relative to the resource whose `create_view` produced
/// it (`resource.rs`).
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct ResourceView {
    pub resource: ResourceHandle,
    pub view: ViewKey,
}

/// Stable index into a logical resource's view-descriptor array. Two calls
/// to `createView` with identical descriptors on the same resource return
/// the same key; the key never changes across renames.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ViewKey(pub u32);

impl fmt::Display for ViewKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "view#{}", self.0)
    }
}

/// Monotonically increasing chunk identifier. Also used to gate pool reuse:
/// an allocation retired at sequence id N is safe to recycle once
/// `coherent_seq_id >= N`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct SequenceId(pub u64);

impl SequenceId {
    pub const NEVER: SequenceId = SequenceId(u64::MAX);

    pub fn next(self) -> SequenceId {
        SequenceId(self.0 + 1)
    }
}

impl fmt::Display for SequenceId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "seq#{}", self.0)
    }
}

/// Version counter on a logical resource's current `Allocation`. Any cached
/// binding recorded against a lower version must re-resolve.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct ResourceVersion(pub u64);

impl ResourceVersion {
    pub fn bump(&mut self) -> ResourceVersion {
        self.0 += 1;
        *self
    }
}
