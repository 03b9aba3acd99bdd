//! Process store contract and an in-memory implementation.

use crate::snapshot::{now_millis, ProcessFingerprint};
use async_trait::async_trait;
use selfserve_core::{CorrelationId, ProcessContext, ProcessError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::Debug;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::debug;

/// What a stateful deployment keeps per flow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredProcess {
    /// The in-flight state.
    pub context: ProcessContext,
    /// Fingerprint of the config the flow runs under.
    pub fingerprint: ProcessFingerprint,
    /// Unix time in milliseconds after which the record is dead.
    pub expires_at: i64,
}

impl StoredProcess {
    /// Returns the flow identifier.
    pub fn correlation_id(&self) -> &CorrelationId {
        self.context.correlation_id()
    }

    /// Returns the stored revision.
    pub fn revision(&self) -> u64 {
        self.context.revision()
    }

    /// Returns `true` once `now` (Unix milliseconds) has reached the expiry.
    pub fn is_expired(&self, now: i64) -> bool {
        now >= self.expires_at
    }
}

/// Errors a [`ProcessStore`] reports.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The record changed since it was read.
    #[error("Conflicting write for process {0}")]
    Conflict(CorrelationId),

    /// The backend could not serve the request.
    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

impl From<StoreError> for ProcessError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::Conflict(id) => ProcessError::StorageConflict(id),
            StoreError::Unavailable(details) => ProcessError::Storage(details),
        }
    }
}

/// Storage backend for stateful processes.
///
/// Writes are conditional on the revision the caller read, which gives at
/// most one writer per correlation id: of two requests racing on the same
/// revision, exactly one succeeds and the other gets
/// [`StoreError::Conflict`].
#[async_trait]
pub trait ProcessStore: Send + Sync + Debug {
    /// Loads a record.
    async fn get(&self, id: &CorrelationId) -> Result<Option<StoredProcess>, StoreError>;

    /// Writes a record.
    ///
    /// With `expected_revision == None` the record must not exist yet;
    /// otherwise the stored revision must equal `expected_revision`.
    async fn put(
        &self,
        record: StoredProcess,
        expected_revision: Option<u64>,
    ) -> Result<(), StoreError>;

    /// Deletes a record if it is still at `expected_revision`.
    ///
    /// Returns `false` if there was nothing to delete.
    async fn remove(&self, id: &CorrelationId, expected_revision: u64) -> Result<bool, StoreError>;
}

/// Thread-safe in-memory store.
///
/// Useful for tests and single-node deployments. Records are lost when the
/// process terminates. Expired records of abandoned flows are dropped on
/// every write and by [`purge_expired`](Self::purge_expired).
#[derive(Debug, Default)]
pub struct InMemoryProcessStore {
    records: RwLock<HashMap<CorrelationId, StoredProcess>>,
}

impl InMemoryProcessStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of live records.
    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    /// Returns `true` if the store holds no records.
    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }

    /// Drops every record expired at `now` (Unix milliseconds) and returns
    /// how many were removed.
    pub async fn purge_expired(&self, now: i64) -> usize {
        let mut records = self.records.write().await;
        let before = records.len();
        records.retain(|_, record| !record.is_expired(now));
        let purged = before - records.len();
        if purged > 0 {
            debug!("Purged {} expired processes", purged);
        }
        purged
    }
}

#[async_trait]
impl ProcessStore for InMemoryProcessStore {
    async fn get(&self, id: &CorrelationId) -> Result<Option<StoredProcess>, StoreError> {
        Ok(self.records.read().await.get(id).cloned())
    }

    async fn put(
        &self,
        record: StoredProcess,
        expected_revision: Option<u64>,
    ) -> Result<(), StoreError> {
        let id = *record.correlation_id();
        let now = now_millis();
        let mut records = self.records.write().await;
        records.retain(|_, stored| !stored.is_expired(now));
        let current = records.get(&id).map(StoredProcess::revision);
        if current != expected_revision {
            return Err(StoreError::Conflict(id));
        }
        records.insert(id, record);
        Ok(())
    }

    async fn remove(&self, id: &CorrelationId, expected_revision: u64) -> Result<bool, StoreError> {
        let mut records = self.records.write().await;
        match records.get(id).map(StoredProcess::revision) {
            None => Ok(false),
            Some(revision) if revision != expected_revision => Err(StoreError::Conflict(*id)),
            Some(_) => Ok(records.remove(id).is_some()),
        }
    }
}
