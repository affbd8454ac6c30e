//! The encoder state machine.

use crate::error::{ContextError, Result};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum EncoderState {
    Idle,
    RenderEncoderActive,
    RenderPipelineReady,
    TessellationRenderPipelineReady,
    ComputeEncoderActive,
    ComputePipelineReady,
    BlitEncoderActive,
    UpdateBlitEncoderActive,
    ReadbackBlitEncoderActive,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum EncoderKind {
    Render,
    Compute,
    Blit,
    UpdateBlit,
    ReadbackBlit,
}

impl EncoderState {
    pub fn kind(self) -> Option<EncoderKind> {
        match self {
            EncoderState::Idle => None,
            EncoderState::RenderEncoderActive | EncoderState::RenderPipelineReady => Some(EncoderKind::Render),
            EncoderState::TessellationRenderPipelineReady => Some(EncoderKind::Render),
            EncoderState::ComputeEncoderActive | EncoderState::ComputePipelineReady => Some(EncoderKind::Compute),
            EncoderState::BlitEncoderActive => Some(EncoderKind::Blit),
            EncoderState::UpdateBlitEncoderActive => Some(EncoderKind::UpdateBlit),
            EncoderState::ReadbackBlitEncoderActive => Some(EncoderKind::ReadbackBlit),
        }
    }

    pub fn is_render_ready(self) -> bool {
        matches!(
            self,
            EncoderState::RenderPipelineReady | EncoderState::TessellationRenderPipelineReady
        )
    }
}

/// A transition the state machine wants to make, and what the driver must
/// do to realize it: close the current encoder (if any) and/or open a new
/// one of a given kind.
#[derive(Debug)]
pub struct Transition {
    pub close_current: bool,
    /// The kind of encoder `close_current` refers to -- the one that was
    /// active before this transition, not the one being opened. `None`
    /// unless `close_current` is set.
    pub close_kind: Option<EncoderKind>,
    pub open: Option<EncoderKind>,
    pub new_state: EncoderState,
}

/// Drives `EncoderState` transitions. Does not itself talk to a `Backend`;
/// `Context` interprets each `Transition` by emitting the matching
/// end-encoding/begin-encoding commands into the current chunk.
pub struct EncoderStateMachine {
    state: EncoderState,
}

impl EncoderStateMachine {
    pub fn new() -> EncoderStateMachine {
        EncoderStateMachine { state: EncoderState::Idle }
    }

    pub fn current(&self) -> EncoderState {
        self.state
    }

    /// Requests that an encoder of `kind` be active. If an encoder of a
    /// different kind is open, it must close first and the state returns
    /// to `Idle` before the new one opens.
    pub fn request(&mut self, kind: EncoderKind) -> Transition {
        let current_kind = self.state.kind();
        if current_kind == Some(kind) {
            return Transition { close_current: false, close_kind: None, open: None, new_state: self.state };
        }

        let new_state = match kind {
            EncoderKind::Render => EncoderState::RenderEncoderActive,
            EncoderKind::Compute => EncoderState::ComputeEncoderActive,
            EncoderKind::Blit => EncoderState::BlitEncoderActive,
            EncoderKind::UpdateBlit => EncoderState::UpdateBlitEncoderActive,
            EncoderKind::ReadbackBlit => EncoderState::ReadbackBlitEncoderActive,
        };
        let close_current = current_kind.is_some();
        self.state = new_state;
        Transition { close_current, close_kind: current_kind, open: Some(kind), new_state }
    }

    /// `SetShader`-family calls invalidate the "pipeline ready" substate
    /// without closing the encoder.
    pub fn invalidate_pipeline_ready(&mut self) {
        self.state = match self.state {
            EncoderState::RenderPipelineReady | EncoderState::TessellationRenderPipelineReady => {
                EncoderState::RenderEncoderActive
            }
            EncoderState::ComputePipelineReady => EncoderState::ComputeEncoderActive,
            other => other,
        };
    }

    pub fn mark_pipeline_ready(&mut self, tessellation: bool) -> Result<()> {
        self.state = match (self.state, tessellation) {
            (EncoderState::RenderEncoderActive, false) | (EncoderState::RenderPipelineReady, false) => {
                EncoderState::RenderPipelineReady
            }
            (EncoderState::RenderEncoderActive, true)
            | (EncoderState::TessellationRenderPipelineReady, true) => {
                return Err(ContextError::Unsupported(
                    "tessellation geometry pipeline is not implemented",
                ));
            }
            (EncoderState::ComputeEncoderActive, _) | (EncoderState::ComputePipelineReady, _) => {
                EncoderState::ComputePipelineReady
            }
            (other, _) => other,
        };
        Ok(())
    }

    /// Forces a close to `Idle`, as `Flush`/`Commit` does.
    pub fn flush(&mut self) -> Transition {
        let close_kind = self.state.kind();
        let close_current = close_kind.is_some();
        let t = Transition { close_current, close_kind, open: None, new_state: EncoderState::Idle };
        self.state = EncoderState::Idle;
        t
    }
}

impl Default for EncoderStateMachine {
    fn default() -> Self {
        EncoderStateMachine::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_kind_request_is_a_no_op() {
        let mut m = EncoderStateMachine::new();
        m.request(EncoderKind::Render);
        let t = m.request(EncoderKind::Render);
        assert!(!t.close_current);
        assert!(t.open.is_none());
    }

    #[test]
    fn switching_kind_closes_then_opens() {
        let mut m = EncoderStateMachine::new();
        m.request(EncoderKind::Render);
        let t = m.request(EncoderKind::Compute);
        assert!(t.close_current);
        assert_eq!(t.open, Some(EncoderKind::Compute));
    }

    #[test]
    fn set_shader_invalidates_ready_without_closing() {
        let mut m = EncoderStateMachine::new();
        m.request(EncoderKind::Render);
        m.mark_pipeline_ready(false).unwrap();
        assert!(m.current().is_render_ready());
        m.invalidate_pipeline_ready();
        assert_eq!(m.current(), EncoderState::RenderEncoderActive);
    }

    #[test]
    fn tessellation_pipeline_is_reported_unsupported() {
        let mut m = EncoderStateMachine::new();
        m.request(EncoderKind::Render);
        let err = m.mark_pipeline_ready(true).unwrap_err();
        assert!(matches!(err, ContextError::Unsupported(_)));
    }

    #[test]
    fn flush_returns_to_idle() {
        let mut m = EncoderStateMachine::new();
        m.request(EncoderKind::Blit);
        let t = m.flush();
        assert!(t.close_current);
        assert_eq!(m.current(), EncoderState::Idle);
    }
}
