//! Actions: immutable, tagged events describing an intent or occurrence.
//!
//! Inside the store every action is a typed value (usually one enum per
//! application) so reducers and epics get exhaustive matching. At the edge,
//! actions travel as [`RawAction`], the `{ "type": ..., "payload": ... }`
//! shape, and are validated into the typed form on the way in.

use std::fmt::Debug;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::StoreError;

/// A value that can be dispatched to a [`Store`](crate::Store).
///
/// Actions must be:
/// - `Clone`: every epic gets its own copy from the action stream
/// - `PartialEq`: equality is by value
/// - `Send + Sync + 'static`: dispatch may happen from any thread or task
///
/// # Example
///
/// ```ignore
/// #[derive(Debug, Clone, PartialEq)]
/// enum CounterAction {
///     Increment,
///     Add(i64),
/// }
///
/// impl Action for CounterAction {
///     fn action_type(&self) -> &'static str {
///         match self {
///             CounterAction::Increment => "INCREMENT",
///             CounterAction::Add(_) => "ADD",
///         }
///     }
/// }
/// ```
pub trait Action: Clone + Debug + PartialEq + Send + Sync + 'static {
    /// The discriminating tag, used for logging and stream filtering.
    fn action_type(&self) -> &'static str;
}

/// Wire form of an action: a type tag plus an optional JSON payload.
///
/// This is the only contract shared with external collaborators. Decoding
/// into a typed action checks the tag and the payload shape; nothing else
/// about the payload is validated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawAction {
    #[serde(rename = "type")]
    pub action_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
}

impl RawAction {
    /// Create a raw action without payload.
    pub fn new(action_type: impl Into<String>) -> Self {
        Self {
            action_type: action_type.into(),
            payload: None,
        }
    }

    /// Attach a payload.
    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = Some(payload);
        self
    }

    /// Decode into a typed action.
    ///
    /// Typed actions are expected to use serde's adjacent tagging
    /// (`#[serde(tag = "type", content = "payload")]`).
    pub fn decode<A>(&self) -> Result<A, StoreError>
    where
        A: Action + DeserializeOwned,
    {
        let value = serde_json::to_value(self).map_err(|e| self.invalid(e))?;
        serde_json::from_value(value).map_err(|e| self.invalid(e))
    }

    /// Encode a typed action into its wire form.
    pub fn encode<A>(action: &A) -> Result<Self, StoreError>
    where
        A: Action + Serialize,
    {
        let value = serde_json::to_value(action).map_err(|e| StoreError::InvalidAction {
            action_type: action.action_type().to_string(),
            reason: e.to_string(),
        })?;
        serde_json::from_value(value).map_err(|e| StoreError::InvalidAction {
            action_type: action.action_type().to_string(),
            reason: e.to_string(),
        })
    }

    fn invalid(&self, err: serde_json::Error) -> StoreError {
        StoreError::InvalidAction {
            action_type: self.action_type.clone(),
            reason: err.to_string(),
        }
    }
}
