use anyhow::{Context, Result};
use chrono::TimeDelta;
use std::path::PathBuf;
use tracing::info;

use wikirace_conn::{ConnConfig, FileConfig, IdentityCache, load_config};

/// Longest identity TTL honoured from config: one year.
const MAX_IDENTITY_TTL_MINS: i64 = 60 * 24 * 365;

/// Resolved client configuration: data directory plus the figment-layered
/// file config turned into runtime values.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub data_dir: PathBuf,
    pub server_url: String,
    pub conn: ConnConfig,
    pub persist_identity: bool,
    pub identity_ttl: TimeDelta,
}

impl ClientConfig {
    pub fn new(custom_dir: Option<PathBuf>, url_override: Option<String>) -> Result<Self> {
        let data_dir = match custom_dir {
            Some(dir) => dir,
            None => dirs::home_dir()
                .context("Could not find home directory")?
                .join(".wikirace"),
        };

        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("Failed to create data directory: {:?}", data_dir))?;

        let fc: FileConfig = load_config(&data_dir)
            .extract()
            .with_context(|| format!("Invalid configuration in {:?}", data_dir))?;

        info!("Data directory: {}", data_dir.display());

        Ok(Self {
            server_url: url_override.unwrap_or(fc.server.url),
            conn: ConnConfig::from_file(&fc.connection),
            persist_identity: fc.identity.persist,
            identity_ttl: TimeDelta::try_minutes(
                fc.identity.ttl_mins.clamp(1, MAX_IDENTITY_TTL_MINS),
            )
            .context("Identity TTL out of range")?,
            data_dir,
        })
    }

    pub fn identity_cache(&self) -> Option<IdentityCache> {
        self.persist_identity
            .then(|| IdentityCache::new(&self.data_dir, self.identity_ttl))
    }
}
