//! Process error types.

use crate::context::CorrelationId;
use crate::stage::StageTag;
use std::fmt;
use thiserror::Error;

/// How a caller is expected to react to a [`ProcessError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recovery {
    /// Resubmit to the same stage, with the correct tag or corrected input.
    RetrySameStage,
    /// Drop the token and start the flow again.
    RestartFlow,
    /// Repeat the identical request later.
    Retry,
    /// The process is misconfigured; retrying will not help.
    Fatal,
}

impl fmt::Display for Recovery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Recovery::RetrySameStage => write!(f, "retry_same_stage"),
            Recovery::RestartFlow => write!(f, "restart_flow"),
            Recovery::Retry => write!(f, "retry"),
            Recovery::Fatal => write!(f, "fatal"),
        }
    }
}

/// Errors raised while validating a process definition.
///
/// These surface when an engine is built, never while a flow is running.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ConfigurationError {
    /// The process declares no stages.
    #[error("Process must declare at least one stage")]
    EmptyStages,

    /// A stage descriptor names a type with no registered implementation.
    #[error("Unknown stage type: {0}")]
    UnknownStageType(String),

    /// Two implementations were registered under the same stage type name.
    #[error("Stage type registered twice: {0}")]
    DuplicateStageType(String),

    /// A stage's parameters could not be turned into its configuration type.
    #[error("Invalid configuration for stage '{stage_type}': {details}")]
    InvalidStageConfig {
        /// The stage type whose parameters were rejected.
        stage_type: String,
        /// Why they were rejected.
        details: String,
    },

    /// Stateless storage was selected without a signing key ring.
    #[error("Stateless storage requires a snapshot key ring")]
    MissingKeyRing,

    /// Stateful storage was selected without a process store.
    #[error("Stateful storage requires a process store")]
    MissingStore,

    /// A snapshot signing key is unusable.
    #[error("Invalid snapshot key: {0}")]
    InvalidKey(String),
}

/// Failures a stage implementation can report.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StageError {
    /// The submitted input was rejected. The message is shown to the caller.
    #[error("{0}")]
    Validation(String),

    /// The stage could not do its work (mail relay down, directory
    /// unreachable, ...).
    #[error("{0}")]
    Failed(String),
}

impl StageError {
    /// Creates a caller-facing validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Creates an internal failure.
    pub fn failed(details: impl Into<String>) -> Self {
        Self::Failed(details.into())
    }
}

/// Errors that can occur while handling a process request.
///
/// Every variant maps to a [`Recovery`] so callers can decide between
/// retrying the same stage, restarting the flow, or giving up. Use
/// [`ProcessError::is_internal`] to separate operator-facing faults from
/// ordinary client mistakes.
///
/// This enum is `#[non_exhaustive]`; always include a wildcard arm:
///
/// ```
/// use selfserve_core::{ProcessError, Recovery};
///
/// fn describe(error: &ProcessError) -> &'static str {
///     match error {
///         ProcessError::StageValidation { .. } => "fix your input",
///         ProcessError::TokenExpired => "start over",
///         _ if error.recovery() == Recovery::Fatal => "contact support",
///         _ => "try again",
///     }
/// }
///
/// assert_eq!(describe(&ProcessError::TokenExpired), "start over");
/// ```
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum ProcessError {
    /// The process definition is invalid.
    #[error("Invalid process configuration: {0}")]
    Configuration(#[from] ConfigurationError),

    /// The snapshot token is malformed, forged or unknown.
    #[error("Invalid snapshot token: {0}")]
    TokenInvalid(String),

    /// The snapshot token outlived its configured lifetime.
    #[error("Snapshot token expired")]
    TokenExpired,

    /// The snapshot token no longer matches the process configuration.
    #[error("Stale snapshot token: {0}")]
    TokenStale(String),

    /// The snapshot token was produced by an unknown payload version.
    #[error("Unsupported snapshot token version: {0}")]
    TokenVersionUnsupported(u32),

    /// The submitted stage tag is not the one the token is waiting for.
    #[error(
        "Stage mismatch: expected {}, got {}",
        display_tag(.expected),
        display_tag(.actual)
    )]
    StageMismatch {
        /// The tag recorded in the token, `None` for a fresh flow.
        expected: Option<StageTag>,
        /// The tag the caller submitted.
        actual: Option<StageTag>,
    },

    /// A stage rejected the submitted input. The flow stays where it was.
    #[error("Stage '{stage}' rejected input: {message}")]
    StageValidation {
        /// The stage type that rejected the input.
        stage: String,
        /// Caller-facing explanation.
        message: String,
        /// Token to resubmit with; it points at the same position.
        token: String,
    },

    /// A stage failed for reasons unrelated to the caller's input.
    #[error("Stage failed: {stage}, details: {details}")]
    StageFailed {
        /// The stage type that failed.
        stage: String,
        /// Details about the failure.
        details: String,
    },

    /// Another request updated the same flow first.
    #[error("Concurrent update of process {0}")]
    StorageConflict(CorrelationId),

    /// The process store could not be reached or misbehaved.
    #[error("Process store failure: {0}")]
    Storage(String),

    /// A snapshot could not be serialized.
    #[error("Snapshot encoding failed: {0}")]
    Encoding(String),
}

fn display_tag(tag: &Option<StageTag>) -> String {
    match tag {
        Some(tag) => format!("'{tag}'"),
        None => "no tag".to_string(),
    }
}

impl ProcessError {
    /// Shorthand for [`ProcessError::TokenInvalid`].
    pub fn invalid_token(reason: impl Into<String>) -> Self {
        Self::TokenInvalid(reason.into())
    }

    /// Returns how the caller should react to this error.
    pub fn recovery(&self) -> Recovery {
        match self {
            ProcessError::Configuration(_) => Recovery::Fatal,
            ProcessError::TokenInvalid(_)
            | ProcessError::TokenExpired
            | ProcessError::TokenStale(_)
            | ProcessError::TokenVersionUnsupported(_) => Recovery::RestartFlow,
            ProcessError::StageMismatch { .. } | ProcessError::StageValidation { .. } => {
                Recovery::RetrySameStage
            }
            ProcessError::StageFailed { .. }
            | ProcessError::StorageConflict(_)
            | ProcessError::Storage(_)
            | ProcessError::Encoding(_) => Recovery::Retry,
        }
    }

    /// Returns `true` for faults an operator should look at, as opposed to
    /// protocol errors caused by the caller.
    pub fn is_internal(&self) -> bool {
        matches!(
            self,
            ProcessError::Configuration(_)
                | ProcessError::StageFailed { .. }
                | ProcessError::Storage(_)
                | ProcessError::Encoding(_)
        )
    }
}
