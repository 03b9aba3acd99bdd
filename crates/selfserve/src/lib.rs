//! Resumable multi-stage self-service flows.
//!
//! A flow is an ordered list of stages: verify an email, check a code,
//! reset a password. Each request moves the flow as far as it can go without
//! the caller, then hands back the requirements for the next input together
//! with a snapshot token. The caller returns the token with that input and
//! the flow picks up where it stopped.
//!
//! # Example
//!
//! ```rust,ignore
//! use selfserve::prelude::*;
//! use std::sync::Arc;
//!
//! let mut registry = StageRegistry::new();
//! registry.register(EmailConfig::TYPE, EmailStage::new)?;
//! registry.register(ResetConfig::TYPE, ResetStage::new)?;
//!
//! let config = ProcessInstanceConfig::builder()
//!     .stage(EmailConfig::default())
//!     .stage(ResetConfig::default())
//!     .build()?;
//!
//! let engine = ProcessEngine::builder(config)
//!     .key_ring(SnapshotKeyRing::new(SigningKey::generate("primary")?))
//!     .build(&registry)?;
//!
//! let response = engine.handle(ProcessRequest::start()).await?;
//! let next = ProcessRequest::follow(&response, serde_json::json!({"mail": "a@b.c"}));
//! ```

mod engine;
mod registry;
mod snapshot;
mod storage;

// Re-export core types
pub use selfserve_core::*;

pub use engine::{ProcessEngine, ProcessEngineBuilder};
pub use registry::StageRegistry;
pub use snapshot::{
    ProcessFingerprint, SigningKey, Snapshot, SnapshotKeyRing, SnapshotTokenHandler,
    StatefulTokenHandler, StatelessTokenHandler, MIN_SECRET_LEN, TOKEN_VERSION,
};
pub use storage::{InMemoryProcessStore, ProcessStore, StoreError, StoredProcess};

/// Prelude for convenient imports.
pub mod prelude {
    pub use crate::{
        ConfigurationError, InMemoryProcessStore, ProcessEngine, ProcessError,
        ProcessInstanceConfig, ProcessRequest, ProcessResponse, ProcessStore, Requirements,
        SigningKey, SnapshotKeyRing, Stage, StageConfig, StageError, StageInput, StageRegistry,
        StageResponse, StageType, StorageType,
    };
}
