//! FM/FMM generation handshake.
//!
//! Each authority tracks three generations:
//! - `proposed`: the highest generation proposed to this node
//! - `receive`: the generation whose messages this node accepts
//! - `send`: the generation the authority has confirmed our upload for
//!
//! `receive` only moves forward. A message whose header generation differs
//! from `receive` is dropped before it is queued.

use failover_types::{Authority, Generation};
use serde::{Deserialize, Serialize};

use crate::message::GenerationHeader;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct GenerationState {
    pub send: Generation,
    pub receive: Generation,
    pub proposed: Generation,
}

/// Result of applying a `GenerationUpdate`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerationUpdateOutcome {
    /// Equal to or lower than the receive generation.
    Stale,
    Accepted { previous: Generation },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationStateManager {
    fm: GenerationState,
    fmm: GenerationState,
}

impl GenerationStateManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, authority: Authority) -> &GenerationState {
        match authority {
            Authority::Fm => &self.fm,
            Authority::Fmm => &self.fmm,
        }
    }

    fn get_mut(&mut self, authority: Authority) -> &mut GenerationState {
        match authority {
            Authority::Fm => &mut self.fm,
            Authority::Fmm => &mut self.fmm,
        }
    }

    /// Handles `GenerationProposal`. Returns `(receive, proposed)` for the reply.
    pub fn on_proposal(
        &mut self,
        authority: Authority,
        proposed: Generation,
    ) -> (Generation, Generation) {
        let state = self.get_mut(authority);
        if proposed > state.proposed {
            state.proposed = proposed;
        }
        (state.receive, state.proposed)
    }

    /// Handles `GenerationUpdate`.
    pub fn on_update(
        &mut self,
        authority: Authority,
        generation: Generation,
    ) -> GenerationUpdateOutcome {
        let state = self.get_mut(authority);
        if generation <= state.receive {
            return GenerationUpdateOutcome::Stale;
        }

        let previous = state.receive;
        state.receive = generation;
        if generation > state.proposed {
            state.proposed = generation;
        }
        GenerationUpdateOutcome::Accepted { previous }
    }

    /// Handles `LfumUploadReply`. Returns false when the reply is stale.
    pub fn on_lfum_upload_reply(&mut self, authority: Authority, generation: Generation) -> bool {
        let state = self.get_mut(authority);
        if generation != state.receive {
            return false;
        }
        state.send = generation;
        true
    }

    /// Whether a message stamped with `header` may be accepted.
    pub fn is_current(&self, header: &GenerationHeader) -> bool {
        header.generation == self.get(header.authority).receive
    }
}
