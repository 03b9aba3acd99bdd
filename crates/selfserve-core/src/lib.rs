//! Core traits and types for the selfserve stage pipeline.
//!
//! This crate holds the abstractions a stage author needs and nothing that
//! runs a flow. Depend on it to implement custom stages; depend on
//! `selfserve` to execute processes.
//!
//! # Core Types
//!
//! - [`Stage`] - One step of a flow
//! - [`StageConfig`] / [`StageType`] - Typed stage configuration
//! - [`StageResponse`] / [`Requirements`] - What a stage hands back
//! - [`ProcessContext`] - The in-flight state carried between requests
//! - [`ProcessInstanceConfig`] - The ordered definition of a flow
//! - [`ProcessRequest`] / [`ProcessResponse`] - The process boundary
//! - [`ProcessError`] - Everything that can go wrong, with a [`Recovery`] hint

mod config;
mod context;
mod error;
mod request;
mod response;
mod stage;
mod stage_type;

pub use config::{
    ProcessInstanceConfig, ProcessInstanceConfigBuilder, SnapshotTokenConfig, StageDescriptor,
    StorageType, DEFAULT_TOKEN_LIFETIME_SECS,
};
pub use context::{scoped_key, stage_scope, CorrelationId, ProcessContext, StateKey};
pub use error::{ConfigurationError, ProcessError, Recovery, StageError};
pub use request::{ProcessRequest, ProcessResponse};
pub use response::{Requirements, RequirementsBuilder, StageResponse, StageResponseBuilder};
pub use stage::{Stage, StageInput, StageTag};
pub use stage_type::{StageConfig, StageType};
