use serde::{Deserialize, Serialize};

use crate::{channel::SyncEvent, error::SyncError};

/// Lifecycle phase of one sync session.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum SessionPhase {
    /// Session created, no network work started yet.
    Idle,
    /// Historical fetch per conversation is running.
    Backfilling,
    /// Live subscription is running.
    Live,
    /// Session was superseded or torn down. Terminal.
    Stopped,
    /// Live loop could not be started. Terminal.
    Failed,
}

/// Lifecycle step requested by the session manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionAction {
    BeginBackfill,
    StartLive,
    Fail,
    Stop,
}

#[derive(Debug, Clone)]
pub struct SessionStateMachine {
    generation: u64,
    phase: SessionPhase,
}

impl SessionStateMachine {
    pub fn new(generation: u64) -> Self {
        Self {
            generation,
            phase: SessionPhase::Idle,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.phase, SessionPhase::Stopped | SessionPhase::Failed)
    }

    /// Apply one step, returning the events it produced.
    ///
    /// `Stop` on a terminal session is a no-op so teardown stays idempotent.
    pub fn apply(&mut self, action: SessionAction) -> Result<Vec<SyncEvent>, SyncError> {
        use SessionAction::*;

        match action {
            BeginBackfill => self.transition_from_any_of(
                &[SessionPhase::Idle],
                SessionPhase::Backfilling,
                "begin_backfill",
            ),
            StartLive => self.transition_from_any_of(
                &[SessionPhase::Idle, SessionPhase::Backfilling],
                SessionPhase::Live,
                "start_live",
            ),
            Fail => self.transition_from_any_of(
                &[SessionPhase::Idle, SessionPhase::Backfilling],
                SessionPhase::Failed,
                "fail",
            ),
            Stop => {
                if self.is_terminal() {
                    return Ok(Vec::new());
                }
                self.phase = SessionPhase::Stopped;
                Ok(vec![self.phase_event()])
            }
        }
    }

    fn transition_from_any_of(
        &mut self,
        expected: &[SessionPhase],
        next: SessionPhase,
        action: &str,
    ) -> Result<Vec<SyncEvent>, SyncError> {
        if !expected.contains(&self.phase) {
            return Err(SyncError::invalid_state(self.phase, action));
        }
        self.phase = next;
        Ok(vec![self.phase_event()])
    }

    fn phase_event(&self) -> SyncEvent {
        SyncEvent::PhaseChanged {
            generation: self.generation,
            phase: self.phase,
        }
    }
}
