//! Signed, self-contained snapshot tokens.

use super::keys::SnapshotKeyRing;
use super::{expires_at, now_millis, ProcessFingerprint, Snapshot, SnapshotTokenHandler};
use async_trait::async_trait;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use selfserve_core::{ProcessContext, ProcessError};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// Payload schema version written into every token.
pub const TOKEN_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct SnapshotClaims {
    #[serde(rename = "fp")]
    fingerprint: ProcessFingerprint,
    iat: i64,
    exp: i64,
    ctx: ProcessContext,
}

/// Carries the whole process context inside the token.
///
/// Token layout: `v<version>.<key id>.<payload>.<mac>`, where the payload is
/// the base64url JSON claims and the MAC is HMAC-SHA256 over everything
/// before the last dot. The MAC is checked before anything else is trusted,
/// so a modified token can only ever fail as
/// [`ProcessError::TokenInvalid`].
#[derive(Debug, Clone)]
pub struct StatelessTokenHandler {
    keys: SnapshotKeyRing,
    lifetime: Duration,
}

impl StatelessTokenHandler {
    /// Creates a handler signing with `keys` and issuing tokens valid for
    /// `lifetime`.
    pub fn new(keys: SnapshotKeyRing, lifetime: Duration) -> Self {
        Self { keys, lifetime }
    }

    /// Returns the key ring.
    pub fn keys(&self) -> &SnapshotKeyRing {
        &self.keys
    }

    fn seal(&self, version: u32, claims: &SnapshotClaims) -> Result<String, ProcessError> {
        let payload =
            serde_json::to_vec(claims).map_err(|e| ProcessError::Encoding(e.to_string()))?;
        let key = self.keys.active();
        let signing_input = format!(
            "v{version}.{}.{}",
            key.id(),
            URL_SAFE_NO_PAD.encode(payload)
        );
        let mac = key.sign(signing_input.as_bytes())?;
        Ok(format!("{signing_input}.{}", URL_SAFE_NO_PAD.encode(mac)))
    }

    fn open(&self, token: &str) -> Result<SnapshotClaims, ProcessError> {
        let (signing_input, mac) = token
            .rsplit_once('.')
            .ok_or_else(|| ProcessError::invalid_token("malformed token"))?;
        let mut parts = signing_input.split('.');
        let (version, key_id, payload) = match (parts.next(), parts.next(), parts.next(), parts.next())
        {
            (Some(version), Some(key_id), Some(payload), None) => (version, key_id, payload),
            _ => return Err(ProcessError::invalid_token("malformed token")),
        };

        let key = self
            .keys
            .find(key_id)
            .ok_or_else(|| ProcessError::invalid_token("unknown signing key"))?;
        let mac = URL_SAFE_NO_PAD
            .decode(mac)
            .map_err(|_| ProcessError::invalid_token("malformed signature"))?;
        if !key.verify(signing_input.as_bytes(), &mac)? {
            return Err(ProcessError::invalid_token("signature mismatch"));
        }

        let version = version
            .strip_prefix('v')
            .and_then(|v| v.parse::<u32>().ok())
            .ok_or_else(|| ProcessError::invalid_token("malformed version"))?;
        if version != TOKEN_VERSION {
            return Err(ProcessError::TokenVersionUnsupported(version));
        }

        let payload = URL_SAFE_NO_PAD
            .decode(payload)
            .map_err(|_| ProcessError::invalid_token("malformed payload"))?;
        let claims: SnapshotClaims = serde_json::from_slice(&payload)
            .map_err(|e| ProcessError::invalid_token(format!("unreadable payload: {e}")))?;

        if now_millis() >= claims.exp {
            return Err(ProcessError::TokenExpired);
        }
        Ok(claims)
    }
}

#[async_trait]
impl SnapshotTokenHandler for StatelessTokenHandler {
    async fn issue(
        &self,
        snapshot: &Snapshot,
        _expected_revision: Option<u64>,
    ) -> Result<String, ProcessError> {
        let iat = now_millis();
        let claims = SnapshotClaims {
            fingerprint: snapshot.fingerprint.clone(),
            iat,
            exp: expires_at(iat, self.lifetime),
            ctx: snapshot.context.clone(),
        };
        debug!(
            "Issuing stateless token for process {} with key '{}'",
            snapshot.context.correlation_id(),
            self.keys.active().id()
        );
        self.seal(TOKEN_VERSION, &claims)
    }

    async fn restore(&self, token: &str) -> Result<Snapshot, ProcessError> {
        let claims = self.open(token)?;
        Ok(Snapshot {
            context: claims.ctx,
            fingerprint: claims.fingerprint,
        })
    }

    async fn discard(
        &self,
        _snapshot: &Snapshot,
        _expected_revision: Option<u64>,
    ) -> Result<(), ProcessError> {
        // The token dies with the response; nothing is held server-side.
        Ok(())
    }
}
