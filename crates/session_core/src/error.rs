//! Failure taxonomy surfaced by the session controller.

use thiserror::Error;

use crate::controller::Phase;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("target acquisition failed: {0}")]
    AcquisitionFailure(String),
    #[error("scoring failed: {0}")]
    ScoringFailure(String),
    #[error("coaching failed: {0}")]
    CoachingFailure(String),
    #[error("failed to save session: {0}")]
    PersistenceFailure(String),
    #[error("history feed unavailable: {0}")]
    HistoryUnavailable(String),
    #[error("authentication required")]
    AuthenticationRequired,
    #[error("cannot {operation} while {phase}")]
    InvalidTransition {
        operation: &'static str,
        phase: Phase,
    },
    #[error("cannot {operation} at step {step}; only allowed at step {required}")]
    WrongStep {
        operation: &'static str,
        step: u8,
        required: u8,
    },
    #[error("no target has been acquired for this session")]
    TargetUnavailable,
    #[error("coaching needs at least {required} completed sessions, have {available}")]
    InsufficientHistory { required: usize, available: usize },
    #[error("chat message is empty")]
    EmptyChatMessage,
    #[error("the coach is still answering the previous message")]
    ChatBusy,
    #[error("the session changed before the sketch export finished")]
    SketchDiscarded,
    #[error("session controller is not running")]
    ControllerStopped,
}

impl SessionError {
    pub fn acquisition(err: anyhow::Error) -> Self {
        Self::AcquisitionFailure(format!("{err:#}"))
    }

    pub fn scoring(err: anyhow::Error) -> Self {
        Self::ScoringFailure(format!("{err:#}"))
    }

    pub fn coaching(err: anyhow::Error) -> Self {
        Self::CoachingFailure(format!("{err:#}"))
    }

    pub fn persistence(err: anyhow::Error) -> Self {
        Self::PersistenceFailure(format!("{err:#}"))
    }

    pub fn history(err: anyhow::Error) -> Self {
        Self::HistoryUnavailable(format!("{err:#}"))
    }

    /// Backend faults that the user can retry by repeating the same operation.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::AcquisitionFailure(_)
                | Self::ScoringFailure(_)
                | Self::CoachingFailure(_)
                | Self::PersistenceFailure(_)
                | Self::HistoryUnavailable(_)
        )
    }
}
