use parking_lot::Mutex;

use crate::error::PipelineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Created,
    Running,
    Draining,
    Closed,
}

impl PipelineState {
    fn can_move_to(self, next: PipelineState) -> bool {
        matches!(
            (self, next),
            (PipelineState::Created, PipelineState::Running)
                | (PipelineState::Running, PipelineState::Draining)
                | (PipelineState::Draining, PipelineState::Closed)
                | (PipelineState::Created, PipelineState::Closed)
        )
    }
}

#[derive(Debug)]
pub struct StateMachine {
    state: Mutex<PipelineState>,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self {
            state: Mutex::new(PipelineState::Created),
        }
    }
}

impl StateMachine {
    pub fn current(&self) -> PipelineState {
        *self.state.lock()
    }

    pub fn transition(&self, next: PipelineState) -> Result<PipelineState, PipelineError> {
        let mut state = self.state.lock();
        let from = *state;
        if !from.can_move_to(next) {
            return Err(PipelineError::InvalidTransition { from, to: next });
        }
        *state = next;
        Ok(from)
    }
}
