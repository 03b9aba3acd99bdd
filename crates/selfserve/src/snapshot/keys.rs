//! Snapshot signing keys.

use hmac::{Hmac, Mac};
use rand::RngCore;
use selfserve_core::{ConfigurationError, ProcessError};
use sha2::Sha256;
use std::fmt;

type HmacSha256 = Hmac<Sha256>;

/// Minimum secret length accepted for a signing key, in bytes.
pub const MIN_SECRET_LEN: usize = 32;

/// An HMAC-SHA256 key with the id stamped on every token it signs.
#[derive(Clone)]
pub struct SigningKey {
    id: String,
    secret: Vec<u8>,
}

impl fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningKey")
            .field("id", &self.id)
            .field("secret", &"[hidden]")
            .finish()
    }
}

impl SigningKey {
    /// Creates a key from an existing secret.
    ///
    /// # Errors
    ///
    /// The id must be non-empty ASCII alphanumerics, `-` or `_`, and the
    /// secret at least [`MIN_SECRET_LEN`] bytes.
    pub fn new(id: impl Into<String>, secret: impl Into<Vec<u8>>) -> Result<Self, ConfigurationError> {
        let id = id.into();
        let secret = secret.into();
        let valid_id = !id.is_empty()
            && id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid_id {
            return Err(ConfigurationError::InvalidKey(format!(
                "key id '{id}' must be non-empty and contain only [A-Za-z0-9_-]"
            )));
        }
        if secret.len() < MIN_SECRET_LEN {
            return Err(ConfigurationError::InvalidKey(format!(
                "secret for key '{id}' must be at least {MIN_SECRET_LEN} bytes"
            )));
        }
        Ok(Self { id, secret })
    }

    /// Creates a key with a random secret.
    pub fn generate(id: impl Into<String>) -> Result<Self, ConfigurationError> {
        let mut secret = vec![0u8; MIN_SECRET_LEN];
        rand::thread_rng().fill_bytes(&mut secret);
        Self::new(id, secret)
    }

    /// Returns the key id.
    pub fn id(&self) -> &str {
        &self.id
    }

    fn mac(&self) -> Result<HmacSha256, ProcessError> {
        HmacSha256::new_from_slice(&self.secret)
            .map_err(|e| ConfigurationError::InvalidKey(e.to_string()).into())
    }

    pub(crate) fn sign(&self, message: &[u8]) -> Result<Vec<u8>, ProcessError> {
        let mut mac = self.mac()?;
        mac.update(message);
        Ok(mac.finalize().into_bytes().to_vec())
    }

    /// Constant-time comparison of `tag` against the MAC of `message`.
    pub(crate) fn verify(&self, message: &[u8], tag: &[u8]) -> Result<bool, ProcessError> {
        let mut mac = self.mac()?;
        mac.update(message);
        Ok(mac.verify_slice(tag).is_ok())
    }
}

/// The keys a deployment signs and verifies snapshot tokens with.
///
/// New tokens are always signed with the active key. Retired keys stay
/// verifiable so flows that started before a rotation can finish.
#[derive(Debug, Clone)]
pub struct SnapshotKeyRing {
    active: SigningKey,
    retired: Vec<SigningKey>,
}

impl SnapshotKeyRing {
    /// Creates a ring with a single active key.
    pub fn new(active: SigningKey) -> Self {
        Self {
            active,
            retired: Vec::new(),
        }
    }

    /// Adds a key that is accepted for verification only.
    pub fn with_retired(mut self, key: SigningKey) -> Result<Self, ConfigurationError> {
        if self.find(key.id()).is_some() {
            return Err(ConfigurationError::InvalidKey(format!(
                "duplicate key id '{}'",
                key.id()
            )));
        }
        self.retired.push(key);
        Ok(self)
    }

    /// Makes `key` the signing key and keeps the previous one verifiable.
    pub fn rotate(self, key: SigningKey) -> Result<Self, ConfigurationError> {
        let Self { active, retired } = self;
        let mut ring = Self { active: key, retired: Vec::new() };
        for old in std::iter::once(active).chain(retired) {
            ring = ring.with_retired(old)?;
        }
        Ok(ring)
    }

    /// Drops a retired key once no token signed by it can still be live.
    pub fn without(mut self, id: &str) -> Self {
        self.retired.retain(|key| key.id() != id);
        self
    }

    /// Returns the signing key.
    pub fn active(&self) -> &SigningKey {
        &self.active
    }

    /// Looks up a key by id, active or retired.
    pub fn find(&self, id: &str) -> Option<&SigningKey> {
        std::iter::once(&self.active)
            .chain(self.retired.iter())
            .find(|key| key.id() == id)
    }
}
