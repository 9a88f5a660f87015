//! Client identity assigned by the server, and its short-lived local cache.
//!
//! The server hands every new connection an id via `notify_id`. When the
//! client reconnects it presents the id back as a `client_id` cookie of the
//! form `<id>:<expiry-millis>`, and the server restores the player's session
//! if the id is still known. The cache keeps that value on disk with a TTL.

use std::path::{Path, PathBuf};

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::IdentityError;

const CACHE_FILE: &str = "client_id";

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(String);

impl ClientId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ClientId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// An identity together with the moment it stops being worth presenting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedIdentity {
    pub id: ClientId,
    pub expires_at: DateTime<Utc>,
}

impl CachedIdentity {
    /// Expires `ttl` after `now`, saturating at the latest representable
    /// instant.
    pub fn new(id: ClientId, ttl: TimeDelta, now: DateTime<Utc>) -> Self {
        Self {
            id,
            expires_at: now
                .checked_add_signed(ttl)
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
        }
    }

    /// `<id>:<expiry-millis>`, the value the server parses.
    pub fn cookie_value(&self) -> String {
        format!("{}:{}", self.id, self.expires_at.timestamp_millis())
    }

    /// Full `Cookie` header value for a reconnect handshake.
    pub fn cookie_header(&self) -> String {
        format!("client_id={}", self.cookie_value())
    }

    pub fn parse_cookie_value(value: &str) -> Result<Self, IdentityError> {
        let (id, millis) = value
            .trim()
            .split_once(':')
            .ok_or_else(|| IdentityError::Malformed(value.to_string()))?;
        if id.is_empty() {
            return Err(IdentityError::Malformed(value.to_string()));
        }
        let millis: i64 = millis
            .parse()
            .map_err(|_| IdentityError::Malformed(value.to_string()))?;
        let expires_at = DateTime::from_timestamp_millis(millis)
            .ok_or_else(|| IdentityError::Malformed(value.to_string()))?;
        Ok(Self {
            id: ClientId::new(id),
            expires_at,
        })
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// File-backed identity cache under the client's data directory.
#[derive(Debug, Clone)]
pub struct IdentityCache {
    path: PathBuf,
    ttl: TimeDelta,
}

impl IdentityCache {
    pub fn new(data_dir: &Path, ttl: TimeDelta) -> Self {
        Self {
            path: data_dir.join(CACHE_FILE),
            ttl,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The cached identity, if one exists and has not expired.
    pub fn load(&self) -> Result<Option<CachedIdentity>, IdentityError> {
        self.load_at(Utc::now())
    }

    pub fn load_at(&self, now: DateTime<Utc>) -> Result<Option<CachedIdentity>, IdentityError> {
        let contents = match std::fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let cached = CachedIdentity::parse_cookie_value(&contents)?;
        if cached.is_expired(now) {
            debug!(id = %cached.id, "cached client id expired");
            return Ok(None);
        }
        Ok(Some(cached))
    }

    /// Cache `id`, valid for the configured TTL from now.
    pub fn store(&self, id: &ClientId) -> Result<CachedIdentity, IdentityError> {
        let cached = CachedIdentity::new(id.clone(), self.ttl, Utc::now());
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, cached.cookie_value())?;
        debug!(id = %cached.id, path = %self.path.display(), "cached client id");
        Ok(cached)
    }

    pub fn clear(&self) -> Result<(), IdentityError> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
