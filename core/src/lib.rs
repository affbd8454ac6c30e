//! `dxmtl-core`: the backend-agnostic command-recording and resource-
//! binding runtime of a D3D11-on-Metal translation layer.
//!
//! This crate owns the hardest engineering in the translation layer:
//! resource virtualization with renaming (`resource`, `allocation`,
//! `dynamic`), binding-table assembly and dirty tracking (`binding`,
//! `argbuf`), the command-chunk/encoder state machine (`chunk`,
//! `encoder_state`), clear-pass coalescing (`clear`), and the immediate
//! context that orchestrates all of it (`context`). It is generic over a
//! `Backend` (see `backend`) so it carries no dependency on Metal itself;
//! `dxmtl-metal` supplies the concrete implementation.
//!
//! Out of scope here, by design: the D3D11/D3D10 COM surface, shader
//! bytecode compilation, the DXGI swap-chain, and window surface glue.
//! Those are external collaborators that call into `Context` through the
//! types this crate exposes.

pub mod allocation;
pub mod argbuf;
pub mod backend;
pub mod binding;
pub mod chunk;
pub mod clear;
pub mod config;
pub mod context;
pub mod copy;
pub mod dynamic;
pub mod encoder_state;
pub mod error;
pub mod format;
pub mod handle;
pub mod pipeline;
pub mod query;
pub mod queue;
pub mod residency;
pub mod resource;
pub mod ring;
pub mod state;
pub mod view;

pub use backend::Backend;
pub use context::Context;
pub use error::{ContextError, Result};
pub use handle::{BufferHandle, PipelineHandle, QueryHandle, SamplerHandle, TextureHandle};
pub use pipeline::PipelineCompiler;
