//! Residency tracker: a per-encoder bitset recording which resources have
//! been declared "used" at each stage.
//!
//! Untracked allocations (immutable/read-only shared resources) require an
//! explicit `UseResource` declaration inside the encoder before the GPU
//! may access them; the argument-upload path consults this tracker to
//! emit `UseResource` only for allocations not already declared for the
//! current encoder.

use fxhash::FxHashMap;

use crate::backend::{ResourceUsage, ShaderStage};

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
struct ResidencyKey {
    resource_id: u64,
    stage: ShaderStage,
}

/// Tracks, for the lifetime of one open encoder, which (resource, stage)
/// pairs have already been declared used and with what access.
#[derive(Default)]
pub struct ResidencyTracker {
    declared: FxHashMap<ResidencyKey, ResourceUsage>,
}

impl ResidencyTracker {
    pub fn new() -> ResidencyTracker {
        ResidencyTracker::default()
    }

    /// Returns `true` if this is a newly-needed declaration (the caller
    /// should emit `UseResource`), updating the tracked usage either way.
    /// A read declared after a write (or vice versa) still counts as new,
    /// since the encoder needs the widened access declared.
    pub fn mark_used(&mut self, resource_id: u64, stage: ShaderStage, usage: ResourceUsage) -> bool {
        let key = ResidencyKey { resource_id, stage };
        match self.declared.get(&key) {
            Some(existing) if *existing == usage => false,
            Some(existing) if matches!((existing, usage), (ResourceUsage::Read, ResourceUsage::Read)) => false,
            _ => {
                let widened = widen(self.declared.get(&key).copied(), usage);
                self.declared.insert(key, widened);
                true
            }
        }
    }

    /// Called when an encoder closes; all declarations are scoped to the
    /// encoder that made them.
    pub fn reset(&mut self) {
        self.declared.clear();
    }
}

fn widen(existing: Option<ResourceUsage>, requested: ResourceUsage) -> ResourceUsage {
    match (existing, requested) {
        (None, u) => u,
        (Some(ResourceUsage::ReadWrite), _) | (_, ResourceUsage::ReadWrite) => ResourceUsage::ReadWrite,
        (Some(a), b) if a == b => a,
        _ => ResourceUsage::ReadWrite,
    }
}
