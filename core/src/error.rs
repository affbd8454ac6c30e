//! Error type.
//!
//! This is the shared error type for the whole crate: every caller-facing
//! entry point on `Context` needs to collapse onto one outcome anyway (the
//! equivalent of an HRESULT), so unlike splitting an error type per module,
//! a single enum keeps call sites uniform.

use thiserror::Error;

use crate::handle::ViewKey;

/// The conceptual error kinds a D3D11-style entry point can report.
#[derive(Debug, Error)]
pub enum ContextError {
    /// A malformed descriptor, out-of-range slot index, or format-incompatible
    /// view request. No state is mutated before this is returned.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A descriptor that is valid in D3D11 but has no Metal equivalent
    /// (tiled resource pool, an unsupported format cast, tessellation).
    #[error("unsupported: {0}")]
    Unsupported(&'static str),

    /// Backend allocation failure. Not retried at this layer.
    #[error("out of device memory")]
    OutOfMemory,

    /// A command buffer completed with an error status. Latched: once this
    /// has been observed, every subsequent call on the same queue reports it.
    #[error("device lost")]
    DeviceLost,

    /// `Map` was called with `MAP_FLAG_DO_NOT_WAIT` on a resource that is
    /// still being written or read by an in-flight chunk.
    #[error("map would block (DXGI_ERROR_WAS_STILL_DRAWING)")]
    WouldBlock,

    /// A view key was presented to a resource that did not create it.
    #[error("view key {0:?} is not valid for this resource")]
    InvalidViewKey(ViewKey),
}

impl ContextError {
    pub fn invalid_argument(msg: impl Into<String>) -> ContextError {
        ContextError::InvalidArgument(msg.into())
    }
}

/// Errors produced while loading a Metal library binary (`MTLB` container).
#[derive(Debug, Error)]
pub enum LibraryError {
    #[error("bad magic number: expected MTLB, found {0:?}")]
    BadMagic([u8; 4]),

    #[error("unsupported MTLB version {0}")]
    UnsupportedVersion(u32),

    #[error("truncated container: expected at least {expected} bytes, found {found}")]
    Truncated { expected: usize, found: usize },

    #[error("function {0:?} not present in this library")]
    FunctionNotFound(String),

    #[error("bitcode checksum mismatch for function {0:?}")]
    ChecksumMismatch(String),
}

pub type Result<T> = ::std::result::Result<T, ContextError>;
