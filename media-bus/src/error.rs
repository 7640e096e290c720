//! Error types for the pipeline engine.
//!
//! Transient codec signals ("try again", "need more input") never show up
//! here; they are variants of [`crate::codec::Submit`] and
//! [`crate::codec::Retrieve`] and get absorbed by the stage loops.

use thiserror::Error;

use crate::lifecycle::StageState;

pub type Result<T> = std::result::Result<T, Error>;

/// Main error type of the engine.
#[derive(Error, Debug)]
pub enum Error {
    /// Lifecycle call made in the wrong state. The stage keeps running.
    #[error("precondition failed: {0}")]
    Precondition(#[from] PreconditionError),

    /// Two pads whose negotiated formats cannot be linked.
    #[error("cannot link pad {output} to pad {input}: {reason}")]
    IncompatiblePads {
        output: String,
        input: String,
        reason: String,
    },

    /// Fatal result from a codec engine.
    #[error("{stage}: codec engine failed with code {code}")]
    Codec { stage: String, code: i32 },

    /// Device context, frame pool or surface transfer failure.
    #[error("device error: {0}")]
    Device(String),

    /// Error raised by a demux/mux collaborator.
    #[error("container error: {0:#}")]
    Container(#[from] anyhow::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Worker thread could not be spawned or panicked.
    #[error("worker error: {0}")]
    Worker(String),
}

/// Lifecycle precondition violations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PreconditionError {
    #[error("{stage} is already {state}")]
    AlreadyInState { stage: String, state: StageState },

    #[error("{stage}: cannot {op} while {state}")]
    InvalidState {
        stage: String,
        op: &'static str,
        state: StageState,
    },

    #[error("{stage}: another lifecycle call is in progress")]
    TransitionInProgress { stage: String },

    /// The output trailer was written; only a close and reopen starts a
    /// new run.
    #[error("{stage}: output already finalized")]
    Finalized { stage: String },
}

/// Coarse classification used by orchestrators to pick a reaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Caller error; the stage is unaffected.
    Precondition,
    /// The stage worker cannot continue.
    ResourceFatal,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Precondition(_) | Error::IncompatiblePads { .. } | Error::Config(_) => {
                ErrorKind::Precondition
            }
            Error::Codec { .. }
            | Error::Device(_)
            | Error::Container(_)
            | Error::Io(_)
            | Error::Worker(_) => ErrorKind::ResourceFatal,
        }
    }

    /// True for the "already running" / "not running" family of results.
    pub fn is_already_in_state(&self) -> bool {
        matches!(
            self,
            Error::Precondition(PreconditionError::AlreadyInState { .. })
        )
    }

    pub fn device(msg: impl Into<String>) -> Self {
        Error::Device(msg.into())
    }
}
