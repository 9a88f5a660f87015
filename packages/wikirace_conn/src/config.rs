use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::command::{CommandDescriptor, TimeoutClass};

// =============================================================================
// File config (figment-deserialized from defaults / config.toml / env vars)
// =============================================================================
//
//   config.toml:     [connection]
//                    request_timeout_ms = 15000
//
//   env var:         WIKIRACE_CONNECTION__REQUEST_TIMEOUT_MS=15000

/// Top-level tunable configuration, deserialized by figment.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub server: ServerFileConfig,
    #[serde(default)]
    pub connection: ConnectionFileConfig,
    #[serde(default)]
    pub identity: IdentityFileConfig,
}

/// Where to connect (lives under `[server]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerFileConfig {
    #[serde(default = "default_server_url")]
    pub url: String,
}

impl Default for ServerFileConfig {
    fn default() -> Self {
        Self {
            url: default_server_url(),
        }
    }
}

/// Correlation tunables (lives under `[connection]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConnectionFileConfig {
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Multiplier applied to session-creation commands.
    #[serde(default = "default_extended_timeout_factor")]
    pub extended_timeout_factor: u32,
    #[serde(default = "default_replay_window_ms")]
    pub replay_window_ms: u64,
    #[serde(default = "default_replay_capacity")]
    pub replay_capacity: usize,
}

impl Default for ConnectionFileConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: default_request_timeout_ms(),
            extended_timeout_factor: default_extended_timeout_factor(),
            replay_window_ms: default_replay_window_ms(),
            replay_capacity: default_replay_capacity(),
        }
    }
}

/// Identity cache tunables (lives under `[identity]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IdentityFileConfig {
    #[serde(default = "default_identity_ttl_mins")]
    pub ttl_mins: i64,
    #[serde(default = "default_persist_identity")]
    pub persist: bool,
}

impl Default for IdentityFileConfig {
    fn default() -> Self {
        Self {
            ttl_mins: default_identity_ttl_mins(),
            persist: default_persist_identity(),
        }
    }
}

fn default_server_url() -> String {
    "ws://localhost:4567/websocket".to_string()
}
fn default_request_timeout_ms() -> u64 {
    10_000
}
fn default_extended_timeout_factor() -> u32 {
    3
}
fn default_replay_window_ms() -> u64 {
    5_000
}
fn default_replay_capacity() -> usize {
    256
}
fn default_identity_ttl_mins() -> i64 {
    60
}
fn default_persist_identity() -> bool {
    true
}

/// Build a figment that layers: defaults → config.toml → WIKIRACE_* env vars.
///
/// Env vars use double-underscore for nesting into sections:
///   `WIKIRACE_SERVER__URL=ws://host/websocket`  →  `server.url`
pub fn load_config(data_dir: &Path) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    Figment::from(Serialized::defaults(FileConfig::default()))
        .merge(Toml::file(data_dir.join("config.toml")))
        .merge(Env::prefixed("WIKIRACE_").split("__"))
}

// =============================================================================
// Runtime config (derived from FileConfig, handed to the connection manager)
// =============================================================================

#[derive(Clone, Debug)]
pub struct ConnConfig {
    /// Budget for an ordinary request.
    pub request_timeout: Duration,
    pub extended_timeout_factor: u32,
    /// How long received messages stay replayable after the latest
    /// ready-to-receive registration.
    pub replay_window: Duration,
    /// Upper bound on buffered messages; oldest are dropped first.
    pub replay_capacity: usize,
}

impl Default for ConnConfig {
    fn default() -> Self {
        Self::from_file(&ConnectionFileConfig::default())
    }
}

impl ConnConfig {
    pub fn from_file(fc: &ConnectionFileConfig) -> Self {
        Self {
            request_timeout: Duration::from_millis(fc.request_timeout_ms),
            extended_timeout_factor: fc.extended_timeout_factor.max(1),
            replay_window: Duration::from_millis(fc.replay_window_ms),
            replay_capacity: fc.replay_capacity,
        }
    }

    pub fn timeout_for(&self, descriptor: &CommandDescriptor) -> Duration {
        match descriptor.timeout {
            TimeoutClass::Standard => self.request_timeout,
            TimeoutClass::Extended => self.request_timeout * self.extended_timeout_factor,
        }
    }
}
