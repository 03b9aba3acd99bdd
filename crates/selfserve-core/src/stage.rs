//! Stage trait and related types.

use crate::context::{scoped_key, CorrelationId, ProcessContext};
use crate::error::StageError;
use crate::response::{Requirements, StageResponse};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt::{self, Debug};

/// Tag identifying which stage, or which step inside a stage, a response
/// belongs to.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StageTag(String);

impl StageTag {
    /// Creates a new StageTag.
    pub fn new(tag: impl Into<String>) -> Self {
        Self(tag.into())
    }

    /// Returns the tag as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns `true` for the empty tag.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for StageTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for StageTag {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for StageTag {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl AsRef<str> for StageTag {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// What a stage sees when it is invoked.
#[derive(Debug, Clone, Copy)]
pub struct StageInput<'a> {
    stage_type: &'a str,
    scope: &'a str,
    context: &'a ProcessContext,
    input: &'a Value,
}

impl<'a> StageInput<'a> {
    /// Creates the view for `stage_type` over `context` with caller `input`.
    ///
    /// Private state is looked up under the type name until
    /// [`with_scope`](Self::with_scope) says otherwise.
    pub fn new(stage_type: &'a str, context: &'a ProcessContext, input: &'a Value) -> Self {
        Self {
            stage_type,
            scope: stage_type,
            context,
            input,
        }
    }

    /// Sets the state scope of the invoked stage instance.
    pub fn with_scope(mut self, scope: &'a str) -> Self {
        self.scope = scope;
        self
    }

    /// Returns the type name of the invoked stage.
    pub fn stage_type(&self) -> &'a str {
        self.stage_type
    }

    /// Returns the scope private keys of this stage instance live under.
    pub fn scope(&self) -> &'a str {
        self.scope
    }

    /// Returns the flow identifier.
    pub fn correlation_id(&self) -> &'a CorrelationId {
        self.context.correlation_id()
    }

    /// Returns the tag the flow is currently at.
    pub fn stage_tag(&self) -> &'a StageTag {
        self.context.stage_tag()
    }

    /// Returns the whole accumulated state.
    pub fn state(&self) -> &'a BTreeMap<String, String> {
        self.context.state()
    }

    /// Returns a key previously written by this stage instance with
    /// [`add_state`](crate::StageResponseBuilder::add_state).
    pub fn scoped(&self, key: &str) -> Option<&'a str> {
        self.context.get(&scoped_key(self.scope, key))
    }

    /// Returns a key written by the first stage of another type.
    ///
    /// Later instances of a type are addressed with
    /// [`stage_scope`](crate::stage_scope) and [`state`](Self::state).
    pub fn scoped_of(&self, stage_type: &str, key: &str) -> Option<&'a str> {
        self.context.get(&scoped_key(stage_type, key))
    }

    /// Returns a shared key.
    pub fn shared(&self, key: &str) -> Option<&'a str> {
        self.context.get(key)
    }

    /// Returns the raw caller input.
    pub fn input(&self) -> &'a Value {
        self.input
    }

    /// Returns a string field of the caller input.
    pub fn input_str(&self, field: &str) -> Option<&'a str> {
        self.input.get(field).and_then(Value::as_str)
    }

    /// Returns `true` when the caller submitted nothing.
    pub fn is_empty(&self) -> bool {
        match self.input {
            Value::Null => true,
            Value::Object(map) => map.is_empty(),
            _ => false,
        }
    }
}

/// One step of a self-service flow.
///
/// A stage is a pure function of the accumulated state and the caller input,
/// plus whatever side effects it performs (sending mail, updating a
/// directory). It must not keep memory of its own between requests.
///
/// # Examples
///
/// ```
/// use selfserve_core::{Requirements, Stage, StageError, StageInput, StageResponse};
/// use async_trait::async_trait;
///
/// #[derive(Debug)]
/// struct ConfirmCode;
///
/// #[async_trait]
/// impl Stage for ConfirmCode {
///     async fn gather_initial_requirements(
///         &self,
///         _input: StageInput<'_>,
///     ) -> Result<Requirements, StageError> {
///         Ok(Requirements::builder("Enter the code you received")
///             .required("code", "string", "Confirmation code")
///             .build())
///     }
///
///     async fn advance(&self, input: StageInput<'_>) -> Result<StageResponse, StageError> {
///         match input.input_str("code") {
///             Some("123") => Ok(StageResponse::builder().add_state("confirmed", "true").build()),
///             Some(_) => Err(StageError::validation("wrong code")),
///             None => Err(StageError::validation("code is required")),
///         }
///     }
/// }
/// ```
#[async_trait]
pub trait Stage: Send + Sync + Debug {
    /// Returns what the caller must submit when the flow first reaches this
    /// stage. Empty requirements let the engine advance it immediately.
    async fn gather_initial_requirements(
        &self,
        _input: StageInput<'_>,
    ) -> Result<Requirements, StageError> {
        Ok(Requirements::empty())
    }

    /// Evaluates the caller input.
    ///
    /// # Returns
    ///
    /// - a response with requirements: the stage wants more input
    /// - a response without requirements: the stage is complete
    /// - `Err(StageError::Validation)`: the input was rejected
    async fn advance(&self, input: StageInput<'_>) -> Result<StageResponse, StageError>;
}
