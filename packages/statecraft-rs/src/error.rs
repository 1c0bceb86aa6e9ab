//! Structured errors for the store and failure records for epics.
//!
//! `StoreError` covers everything a caller of the store can observe:
//! construction problems, reducer defects, misuse after teardown and
//! undecodable wire actions.
//!
//! `EpicFailure` never reaches a caller. Epics run detached from any
//! dispatch, so their failures are recovered inside the middleware and
//! handed to a [`FailureReporter`](crate::FailureReporter).
//!
//! # Failure taxonomy
//!
//! | Failure                 | Scope         | Outcome                              |
//! |-------------------------|---------------|--------------------------------------|
//! | `ReducerDefect`         | whole store   | abort, or halt the store             |
//! | `EpicFailure`           | one epic      | pipeline terminated, others continue |
//! | `DispatchAfterTeardown` | one call      | returned to the caller               |

use std::any::Any;
use std::fmt;

use chrono::{DateTime, Utc};
use thiserror::Error;

/// Errors returned by store construction and dispatch.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A slice reducer panicked. This is a programming error; the store
    /// never installs the partially computed state.
    #[error("reducer for slice '{slice}' panicked: {message}")]
    ReducerDefect {
        /// Name of the slice whose reducer failed.
        slice: &'static str,
        /// Panic message.
        message: String,
    },

    /// The store was torn down before this dispatch.
    #[error("cannot dispatch {action_type}: store has been torn down")]
    DispatchAfterTeardown {
        /// Tag of the rejected action.
        action_type: &'static str,
    },

    /// Two slice reducers were registered under the same name.
    #[error("slice '{name}' is registered more than once")]
    DuplicateSlice {
        /// The duplicated name.
        name: &'static str,
    },

    /// A slice was registered with an empty name.
    #[error("slice names must not be empty")]
    InvalidSliceName,

    /// Epics were registered but no tokio runtime was available to run them.
    #[error("epics require a running tokio runtime")]
    NoRuntime,

    /// A wire action could not be decoded into the store's action type.
    #[error("invalid action {action_type}: {reason}")]
    InvalidAction {
        /// Tag as received.
        action_type: String,
        /// Decoder message.
        reason: String,
    },
}

/// How an epic pipeline failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// The derived stream yielded an `Err`.
    Error,
    /// The epic panicked while building or polling its stream.
    Panic,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureKind::Error => write!(f, "error"),
            FailureKind::Panic => write!(f, "panic"),
        }
    }
}

/// Record of a terminated epic pipeline.
#[derive(Debug, Clone)]
pub struct EpicFailure {
    /// Name the epic was registered under.
    pub epic: &'static str,
    pub kind: FailureKind,
    /// Error chain or panic message.
    pub message: String,
    pub occurred_at: DateTime<Utc>,
}

impl EpicFailure {
    /// Build a failure from an error yielded by the epic's stream.
    pub fn from_error(epic: &'static str, error: &anyhow::Error) -> Self {
        Self {
            epic,
            kind: FailureKind::Error,
            message: format!("{:#}", error),
            occurred_at: Utc::now(),
        }
    }

    /// Build a failure from a caught panic payload.
    pub fn from_panic(epic: &'static str, payload: &(dyn Any + Send)) -> Self {
        Self {
            epic,
            kind: FailureKind::Panic,
            message: panic_message(payload),
            occurred_at: Utc::now(),
        }
    }
}

impl fmt::Display for EpicFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "epic {} failed ({}): {}", self.epic, self.kind, self.message)
    }
}

/// Extract the message from a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
