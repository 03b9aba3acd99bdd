//! Opaque tokens backed by a process store.

use super::{expires_at, now_millis, Snapshot, SnapshotTokenHandler};
use crate::storage::{ProcessStore, StoredProcess};
use async_trait::async_trait;
use selfserve_core::{CorrelationId, ProcessError};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Keeps the process context in a [`ProcessStore`]; the token is just the
/// correlation id.
#[derive(Debug, Clone)]
pub struct StatefulTokenHandler {
    store: Arc<dyn ProcessStore>,
    lifetime: Duration,
}

impl StatefulTokenHandler {
    /// Creates a handler over `store`. Records expire `lifetime` after their
    /// last write.
    pub fn new(store: Arc<dyn ProcessStore>, lifetime: Duration) -> Self {
        Self { store, lifetime }
    }
}

#[async_trait]
impl SnapshotTokenHandler for StatefulTokenHandler {
    async fn issue(
        &self,
        snapshot: &Snapshot,
        expected_revision: Option<u64>,
    ) -> Result<String, ProcessError> {
        let id = *snapshot.context.correlation_id();
        let record = StoredProcess {
            context: snapshot.context.clone(),
            fingerprint: snapshot.fingerprint.clone(),
            expires_at: expires_at(now_millis(), self.lifetime),
        };
        self.store.put(record, expected_revision).await?;
        debug!(
            "Stored process {} at revision {}",
            id,
            snapshot.context.revision()
        );
        Ok(id.to_string())
    }

    async fn restore(&self, token: &str) -> Result<Snapshot, ProcessError> {
        let id: CorrelationId = token
            .parse()
            .map_err(|_| ProcessError::invalid_token("malformed process id"))?;
        let record = self
            .store
            .get(&id)
            .await?
            .ok_or_else(|| ProcessError::invalid_token("unknown process"))?;

        if record.is_expired(now_millis()) {
            if let Err(e) = self.store.remove(&id, record.revision()).await {
                warn!("Failed to evict expired process {}: {}", id, e);
            }
            return Err(ProcessError::TokenExpired);
        }

        Ok(Snapshot {
            context: record.context,
            fingerprint: record.fingerprint,
        })
    }

    async fn discard(
        &self,
        snapshot: &Snapshot,
        expected_revision: Option<u64>,
    ) -> Result<(), ProcessError> {
        let Some(revision) = expected_revision else {
            // Never stored.
            return Ok(());
        };
        self.store
            .remove(snapshot.context.correlation_id(), revision)
            .await?;
        Ok(())
    }
}
