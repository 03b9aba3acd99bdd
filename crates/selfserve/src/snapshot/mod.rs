//! Snapshot tokens: how a flow's progress survives between requests.
//!
//! Two handlers implement [`SnapshotTokenHandler`]:
//!
//! - [`StatelessTokenHandler`] signs the whole context into the token.
//! - [`StatefulTokenHandler`] keeps the context in a
//!   [`ProcessStore`](crate::ProcessStore) and hands out its id.

mod keys;
mod stateful;
mod stateless;

pub use keys::{SigningKey, SnapshotKeyRing, MIN_SECRET_LEN};
pub use stateful::StatefulTokenHandler;
pub use stateless::{StatelessTokenHandler, TOKEN_VERSION};

use async_trait::async_trait;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::Utc;
use selfserve_core::{ProcessContext, ProcessError, ProcessInstanceConfig};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt::{self, Debug};
use std::time::Duration;

/// Hash of a config's ordered stage list.
///
/// Tokens carry the fingerprint of the config they were issued under, so a
/// token from before a stage was added, removed or reordered is rejected as
/// stale instead of being resumed at the wrong stage.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProcessFingerprint(String);

impl ProcessFingerprint {
    /// Computes the fingerprint of `config`.
    pub fn of(config: &ProcessInstanceConfig) -> Self {
        let mut hasher = Sha256::new();
        for name in config.stage_type_names() {
            hasher.update(name.as_bytes());
            hasher.update(b"\n");
        }
        let digest = hasher.finalize();
        Self(URL_SAFE_NO_PAD.encode(&digest[..12]))
    }

    /// Returns the fingerprint as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProcessFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A process context together with the config it belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    /// The in-flight state.
    pub context: ProcessContext,
    /// Fingerprint of the issuing config.
    pub fingerprint: ProcessFingerprint,
}

/// Turns snapshots into tokens and back.
#[async_trait]
pub trait SnapshotTokenHandler: Send + Sync + Debug {
    /// Persists `snapshot` and returns the token referring to it.
    ///
    /// `expected_revision` is the revision the snapshot was loaded at, or
    /// `None` for a flow that has never been issued a token.
    async fn issue(
        &self,
        snapshot: &Snapshot,
        expected_revision: Option<u64>,
    ) -> Result<String, ProcessError>;

    /// Verifies `token` and returns the snapshot it carries.
    async fn restore(&self, token: &str) -> Result<Snapshot, ProcessError>;

    /// Ends the flow. Tokens issued for it must not be resumable afterwards
    /// where the handler can enforce that.
    async fn discard(
        &self,
        snapshot: &Snapshot,
        expected_revision: Option<u64>,
    ) -> Result<(), ProcessError>;
}

pub(crate) fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

pub(crate) fn expires_at(issued_at: i64, lifetime: Duration) -> i64 {
    let lifetime = i64::try_from(lifetime.as_millis()).unwrap_or(i64::MAX);
    issued_at.saturating_add(lifetime)
}
