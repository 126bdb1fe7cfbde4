use funnel_core::types::Session;
use funnel_core::{FunnelError, FunnelResult};
use serde::{Deserialize, Serialize};

/// Lifecycle of a quiz session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Created,
    Active,
    Completed,
    Abandoned,
    Cleared,
}

impl SessionState {
    /// State implied by a persisted session's markers.
    pub fn of(session: &Session) -> Self {
        if session.completed_at.is_some() {
            SessionState::Completed
        } else if session.abandoned_at.is_some() {
            SessionState::Abandoned
        } else if session.started_at.is_some() {
            SessionState::Active
        } else {
            SessionState::Created
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Completed | SessionState::Abandoned)
    }
}

/// A single permitted move between two states.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateTransition {
    pub from: SessionState,
    pub to: SessionState,
    pub trigger: String,
}

/// Guards the session lifecycle. A session reaches a terminal state at most
/// once; clearing is allowed from anywhere except `Cleared` itself.
#[derive(Debug, Clone)]
pub struct SessionStateMachine {
    pub state: SessionState,
    pub transitions: Vec<StateTransition>,
}

impl SessionStateMachine {
    pub fn new() -> Self {
        Self::starting_at(SessionState::Created)
    }

    pub fn starting_at(state: SessionState) -> Self {
        use SessionState::*;

        let transitions = [
            (Created, Active, "quiz_start"),
            (Active, Completed, "quiz_complete"),
            (Active, Abandoned, "quiz_abandon"),
            (Created, Cleared, "clear"),
            (Active, Cleared, "clear"),
            (Completed, Cleared, "clear"),
            (Abandoned, Cleared, "clear"),
        ]
        .into_iter()
        .map(|(from, to, trigger)| StateTransition {
            from,
            to,
            trigger: trigger.to_string(),
        })
        .collect();

        Self { state, transitions }
    }

    pub fn can_transition(&self, from: &SessionState, to: &SessionState) -> bool {
        self.transitions
            .iter()
            .any(|t| t.from == *from && t.to == *to)
    }

    /// Fails with `InvalidTransition` unless the move is permitted.
    pub fn check(&self, to: SessionState) -> FunnelResult<()> {
        if self.can_transition(&self.state, &to) {
            Ok(())
        } else {
            Err(FunnelError::InvalidTransition(format!(
                "{:?} -> {:?}",
                self.state, to
            )))
        }
    }

    pub fn transition(&mut self, to: SessionState) -> FunnelResult<()> {
        self.check(to)?;
        self.state = to;
        Ok(())
    }
}

impl Default for SessionStateMachine {
    fn default() -> Self {
        Self::new()
    }
}
