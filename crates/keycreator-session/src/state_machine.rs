//! Provisioning loop state machine.
//!
//! # States
//!
//! - `Idle`: no session running
//! - `Searching`: polling the reader field
//! - `Detecting`: a UID turned stable, comparing the token's technologies
//!   with the configuration
//! - `ValidatingNumber`: picking and checking the serial number
//! - `Writing`: running the per technology write routines
//! - `VerifyingWriteback`: reading every written transponder back
//! - `Reporting`: registering the key with the ERP backend
//! - `Paused`: a maintenance routine holds the reader
//!
//! # Valid Transitions
//!
//! - Idle → Searching → Detecting → ValidatingNumber → Writing →
//!   VerifyingWriteback → Reporting → Searching
//! - Detecting, ValidatingNumber, Writing, VerifyingWriteback, Reporting →
//!   Searching (token rejected or lifted)
//! - Searching ⇄ Paused
//! - any → Idle through [`StateMachine::reset`]
//!
//! # Examples
//!
//! ```
//! use keycreator_session::{SessionState, StateMachine};
//!
//! let mut machine = StateMachine::new();
//! machine.transition_to(SessionState::Searching).unwrap();
//! machine.transition_to(SessionState::Detecting).unwrap();
//! assert!(machine.transition_to(SessionState::Reporting).is_err());
//! ```

use keycreator_core::constants::MAX_HISTORY_SIZE;
use keycreator_core::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::time::{Duration, Instant};
use tracing::debug;

/// Phase of the provisioning loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Searching,
    Detecting,
    ValidatingNumber,
    Writing,
    VerifyingWriteback,
    Reporting,
    Paused,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state_str = match self {
            SessionState::Idle => "Idle",
            SessionState::Searching => "Searching",
            SessionState::Detecting => "Detecting",
            SessionState::ValidatingNumber => "ValidatingNumber",
            SessionState::Writing => "Writing",
            SessionState::VerifyingWriteback => "VerifyingWriteback",
            SessionState::Reporting => "Reporting",
            SessionState::Paused => "Paused",
        };
        write!(f, "{}", state_str)
    }
}

impl SessionState {
    /// Check if transition to target state is valid from this state.
    ///
    /// ```
    /// use keycreator_session::SessionState;
    ///
    /// assert!(SessionState::Searching.can_transition_to(&SessionState::Paused));
    /// assert!(!SessionState::Paused.can_transition_to(&SessionState::Writing));
    /// ```
    pub fn can_transition_to(&self, target: &SessionState) -> bool {
        matches!(
            (self, target),
            (SessionState::Idle, SessionState::Searching)
                | (SessionState::Searching, SessionState::Detecting | SessionState::Paused)
                | (SessionState::Paused, SessionState::Searching)
                | (SessionState::Detecting, SessionState::ValidatingNumber)
                | (SessionState::ValidatingNumber, SessionState::Writing)
                | (SessionState::Writing, SessionState::VerifyingWriteback)
                | (SessionState::VerifyingWriteback, SessionState::Reporting)
                | (
                    SessionState::Detecting
                        | SessionState::ValidatingNumber
                        | SessionState::Writing
                        | SessionState::VerifyingWriteback
                        | SessionState::Reporting,
                    SessionState::Searching
                )
        )
    }

    /// Whether the loop is between detecting a token and finishing with it.
    pub fn is_busy(&self) -> bool {
        matches!(
            self,
            SessionState::Detecting
                | SessionState::ValidatingNumber
                | SessionState::Writing
                | SessionState::VerifyingWriteback
                | SessionState::Reporting
        )
    }
}

/// One recorded transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateTransition {
    pub from: SessionState,
    pub to: SessionState,
    /// Not serialized; set to the time of deserialization.
    #[serde(skip, default = "Instant::now")]
    pub timestamp: Instant,
}

impl StateTransition {
    pub fn new(from: SessionState, to: SessionState) -> Self {
        Self {
            from,
            to,
            timestamp: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.timestamp.elapsed()
    }
}

/// Enforces the transition rules and keeps the last
/// [`MAX_HISTORY_SIZE`] transitions.
#[derive(Debug)]
pub struct StateMachine {
    current_state: SessionState,
    state_entered_at: Instant,
    history: VecDeque<StateTransition>,
}

impl StateMachine {
    pub fn new() -> Self {
        Self {
            current_state: SessionState::Idle,
            state_entered_at: Instant::now(),
            history: VecDeque::with_capacity(MAX_HISTORY_SIZE),
        }
    }

    pub fn current_state(&self) -> &SessionState {
        &self.current_state
    }

    pub fn time_in_current_state(&self) -> Duration {
        self.state_entered_at.elapsed()
    }

    /// Recent transitions, oldest first.
    pub fn history(&self) -> &VecDeque<StateTransition> {
        &self.history
    }

    /// Whether `state` was entered at any point in the kept history.
    pub fn has_visited(&self, state: SessionState) -> bool {
        self.history.iter().any(|t| t.to == state)
    }

    /// # Errors
    ///
    /// `Error::InvalidStateTransition` if the rules forbid the move.
    pub fn transition_to(&mut self, new_state: SessionState) -> Result<StateTransition> {
        if !self.current_state.can_transition_to(&new_state) {
            return Err(Error::InvalidStateTransition {
                from: self.current_state.to_string(),
                to: new_state.to_string(),
            });
        }

        let transition = StateTransition::new(self.current_state, new_state);
        self.perform_state_change(new_state, transition.clone());
        Ok(transition)
    }

    /// Return to `Searching` from wherever the loop is, unless it is already
    /// there.
    pub fn back_to_searching(&mut self) {
        if self.current_state == SessionState::Searching {
            return;
        }
        let transition = StateTransition::new(self.current_state, SessionState::Searching);
        self.perform_state_change(SessionState::Searching, transition);
    }

    /// Force `Idle`, whatever the current state.
    pub fn reset(&mut self) -> StateTransition {
        let transition = StateTransition::new(self.current_state, SessionState::Idle);
        self.perform_state_change(SessionState::Idle, transition.clone());
        transition
    }

    fn perform_state_change(&mut self, new_state: SessionState, transition: StateTransition) {
        debug!(from = %transition.from, to = %transition.to, "State transition");
        self.current_state = new_state;
        self.state_entered_at = Instant::now();

        self.history.push_back(transition);
        if self.history.len() > MAX_HISTORY_SIZE {
            self.history.pop_front();
        }
    }
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}
