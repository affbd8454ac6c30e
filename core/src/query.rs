//! Occlusion queries.
//!
//! A per-chunk visibility-result buffer holds up to `OCCLUSION_SAMPLE_COUNT`
//! counters (`chunk.rs`). `Query` tracks where in that rotation a given
//! Begin/End pair landed, and resolves against the chunk once the GPU has
//! retired it.

use crate::chunk::OCCLUSION_SAMPLE_COUNT;
use crate::error::{ContextError, Result};
use crate::handle::SequenceId;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum QueryState {
    Idle,
    Active { offset: u64, chunk_seq_id: SequenceId },
    Ended { offset: u64, chunk_seq_id: SequenceId },
}

/// An occlusion query. `GetData` only has a meaningful answer once the
/// chunk that recorded `End` has retired.
pub struct OcclusionQuery {
    state: QueryState,
    result: Option<u64>,
}

impl OcclusionQuery {
    pub fn new() -> OcclusionQuery {
        OcclusionQuery { state: QueryState::Idle, result: None }
    }

    /// Starts the query, claiming a rotating slot in the current chunk's
    /// visibility-result buffer.
    pub fn begin(&mut self, offset: u64, chunk_seq_id: SequenceId) -> Result<()> {
        if matches!(self.state, QueryState::Active { .. }) {
            return Err(ContextError::invalid_argument("occlusion query already active"));
        }
        self.state = QueryState::Active { offset, chunk_seq_id };
        self.result = None;
        Ok(())
    }

    pub fn end(&mut self) -> Result<()> {
        match self.state {
            QueryState::Active { offset, chunk_seq_id } => {
                self.state = QueryState::Ended { offset, chunk_seq_id };
                Ok(())
            }
            _ => Err(ContextError::invalid_argument("End called without a matching Begin")),
        }
    }

    /// The chunk whose visibility-result buffer this query's sample landed
    /// in, once `end` has been called. `None` before `end`, or once the
    /// result has already been resolved and cached.
    pub fn ended_chunk_seq_id(&self) -> Option<SequenceId> {
        match self.state {
            QueryState::Ended { chunk_seq_id, .. } => Some(chunk_seq_id),
            _ => None,
        }
    }

    /// Returns the sample count if the owning chunk has retired, or `None`
    /// if the result is not yet available (the caller should poll again).
    pub fn get_data(&mut self, coherent_seq_id: SequenceId, chunk_results: &[u64; OCCLUSION_SAMPLE_COUNT]) -> Option<u64> {
        if let Some(result) = self.result {
            return Some(result);
        }
        match self.state {
            QueryState::Ended { offset, chunk_seq_id } if chunk_seq_id <= coherent_seq_id => {
                let slot = (offset as usize) / std::mem::size_of::<u64>();
                let value = chunk_results[slot % OCCLUSION_SAMPLE_COUNT];
                self.result = Some(value);
                self.state = QueryState::Idle;
                Some(value)
            }
            _ => None,
        }
    }
}

impl Default for OcclusionQuery {
    fn default() -> Self {
        OcclusionQuery::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_data_is_none_until_owning_chunk_retires() {
        let mut q = OcclusionQuery::new();
        q.begin(0, SequenceId(5)).unwrap();
        q.end().unwrap();
        let mut results = [0u64; OCCLUSION_SAMPLE_COUNT];
        results[0] = 400;
        assert!(q.get_data(SequenceId(4), &results).is_none());
        assert_eq!(q.get_data(SequenceId(5), &results), Some(400));
    }

    #[test]
    fn end_without_begin_is_an_error() {
        let mut q = OcclusionQuery::new();
        assert!(q.end().is_err());
    }

    #[test]
    fn double_begin_is_an_error() {
        let mut q = OcclusionQuery::new();
        q.begin(0, SequenceId(1)).unwrap();
        assert!(q.begin(8, SequenceId(1)).is_err());
    }
}
