//! `dxmtl-metal`: the concrete Metal implementation of `dxmtl_core::Backend`.
//!
//! Everything here is thin. `dxmtl-core` owns the hard engineering (resource
//! renaming, binding-table assembly, the command-chunk state machine); this
//! crate's job is to translate the `Backend` trait's ~40 methods into calls
//! against Apple's Metal API (`metal`) and nothing more. See
//! `backend::MetalBackend` for the trait impl and `library` for the `MTLB`
//! library-binary container reader used to load precompiled shader
//! binaries.

pub mod backend;
pub mod format;
pub mod library;

pub use backend::{MetalBackend, MetalBackendError};
pub use library::{FunctionRecord, FunctionType, MetalLibrary};
