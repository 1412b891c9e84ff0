//! Session state machine
//!
//! The transition table is plain data. It is checked once at construction:
//! no `(state, trigger)` pair appears twice, every live state has a way out,
//! and every live state can fault into [`SessionState::Error`].

use std::collections::{HashMap, HashSet};
use std::fmt;

use crate::{Error, Result};

/// Session mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// Starting up input and tools
    Initial,
    /// Waiting for a button press
    Idle,
    /// Recording the user
    Listening,
    /// Transcribing and generating a reply
    Processing,
    /// Playing the reply
    Speaking,
    /// Clearing the conversation
    Reset,
    /// Terminal failure
    Error,
}

impl SessionState {
    pub const ALL: [Self; 7] = [
        Self::Initial,
        Self::Idle,
        Self::Listening,
        Self::Processing,
        Self::Speaking,
        Self::Reset,
        Self::Error,
    ];

    /// Lowercase name, as published
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Initial => "initial",
            Self::Idle => "idle",
            Self::Listening => "listening",
            Self::Processing => "processing",
            Self::Speaking => "speaking",
            Self::Reset => "reset",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Named event that moves the session between states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Trigger {
    InitComplete,
    StartListening,
    StartReset,
    StartProcessing,
    AbandonRecording,
    StartSpeaking,
    FinishSpeaking,
    ResetComplete,
    Fault,
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::InitComplete => "init_complete",
            Self::StartListening => "start_listening",
            Self::StartReset => "start_reset",
            Self::StartProcessing => "start_processing",
            Self::AbandonRecording => "abandon_recording",
            Self::StartSpeaking => "start_speaking",
            Self::FinishSpeaking => "finish_speaking",
            Self::ResetComplete => "reset_complete",
            Self::Fault => "fault",
        };
        f.write_str(name)
    }
}

/// One row of the transition table
#[derive(Debug, Clone, Copy)]
pub struct Transition {
    pub sources: &'static [SessionState],
    pub trigger: Trigger,
    pub destination: SessionState,
}

const fn row(
    sources: &'static [SessionState],
    trigger: Trigger,
    destination: SessionState,
) -> Transition {
    Transition {
        sources,
        trigger,
        destination,
    }
}

/// Every state that can still fault
const LIVE: &[SessionState] = &[
    SessionState::Initial,
    SessionState::Idle,
    SessionState::Listening,
    SessionState::Processing,
    SessionState::Speaking,
    SessionState::Reset,
];

/// The session's transitions
pub const TRANSITIONS: &[Transition] = &[
    row(&[SessionState::Initial], Trigger::InitComplete, SessionState::Idle),
    row(
        &[SessionState::Idle, SessionState::Speaking],
        Trigger::StartListening,
        SessionState::Listening,
    ),
    row(&[SessionState::Idle], Trigger::StartReset, SessionState::Reset),
    row(
        &[SessionState::Listening],
        Trigger::StartProcessing,
        SessionState::Processing,
    ),
    row(
        &[SessionState::Listening],
        Trigger::AbandonRecording,
        SessionState::Idle,
    ),
    row(
        &[SessionState::Processing],
        Trigger::StartSpeaking,
        SessionState::Speaking,
    ),
    row(&[SessionState::Speaking], Trigger::FinishSpeaking, SessionState::Idle),
    row(&[SessionState::Reset], Trigger::ResetComplete, SessionState::Idle),
    row(LIVE, Trigger::Fault, SessionState::Error),
];

/// Current state plus the validated transition table
#[derive(Debug, Clone)]
pub struct StateMachine {
    state: SessionState,
    table: HashMap<(SessionState, Trigger), SessionState>,
}

impl StateMachine {
    /// Machine over [`TRANSITIONS`], starting in `Initial`
    ///
    /// # Errors
    ///
    /// Returns error if the table is inconsistent
    pub fn new() -> Result<Self> {
        Self::with_transitions(TRANSITIONS)
    }

    /// Machine over a custom table, starting in `Initial`
    ///
    /// # Errors
    ///
    /// Returns error if the table is inconsistent
    pub fn with_transitions(transitions: &[Transition]) -> Result<Self> {
        let mut table = HashMap::new();
        for transition in transitions {
            for &source in transition.sources {
                if table
                    .insert((source, transition.trigger), transition.destination)
                    .is_some()
                {
                    return Err(invalid(format!(
                        "duplicate transition {} from {source}",
                        transition.trigger
                    )));
                }
            }
        }

        validate(&table)?;
        Ok(Self {
            state: SessionState::Initial,
            table,
        })
    }

    #[must_use]
    pub const fn state(&self) -> SessionState {
        self.state
    }

    /// Whether `trigger` is legal in the current state
    #[must_use]
    pub fn can_fire(&self, trigger: Trigger) -> bool {
        self.table.contains_key(&(self.state, trigger))
    }

    /// Apply `trigger`, returning the new state
    ///
    /// # Errors
    ///
    /// Returns `Error::IllegalTransition` and leaves the state unchanged if
    /// the current state has no transition for `trigger`
    pub fn fire(&mut self, trigger: Trigger) -> Result<SessionState> {
        let Some(&next) = self.table.get(&(self.state, trigger)) else {
            return Err(Error::IllegalTransition {
                state: self.state,
                trigger,
            });
        };

        tracing::debug!(from = %self.state, to = %next, %trigger, "state transition");
        self.state = next;
        Ok(next)
    }
}

fn invalid(reason: String) -> Error {
    Error::Config(format!("invalid transition table: {reason}"))
}

fn validate(table: &HashMap<(SessionState, Trigger), SessionState>) -> Result<()> {
    let sources: HashSet<SessionState> = table
        .keys()
        .filter(|(_, trigger)| *trigger != Trigger::Fault)
        .map(|(state, _)| *state)
        .collect();

    for state in SessionState::ALL {
        if state == SessionState::Error {
            if table.keys().any(|(source, _)| *source == SessionState::Error) {
                return Err(invalid("error state must be terminal".to_string()));
            }
            continue;
        }
        if !sources.contains(&state) {
            return Err(invalid(format!("state {state} has no exit")));
        }
        if table.get(&(state, Trigger::Fault)) != Some(&SessionState::Error) {
            return Err(invalid(format!("state {state} cannot fault")));
        }
    }
    Ok(())
}
