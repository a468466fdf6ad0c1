//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! The OAuth client secret is loaded from the OAUTH_CLIENT_SECRET env var or
//! client_secret_file, and refresh tokens from per-channel files, never
//! stored in the TOML directly to avoid leaking secrets.

use channel_auth::{Credential, Secret};
use channel_pool::{ChannelConfig, ChannelSettings, PoolSettings};
use serde::Deserialize;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Root configuration
#[derive(Debug, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub store: StoreConfig,
    pub oauth: OAuthConfig,
    #[serde(default)]
    pub maintenance: MaintenanceConfig,
    #[serde(default)]
    pub pool: PoolSettings,
    #[serde(default)]
    pub channels: Vec<ChannelSection>,
}

/// HTTP API settings
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

/// Channel record storage
#[derive(Debug, Deserialize)]
pub struct StoreConfig {
    pub path: PathBuf,
}

/// OAuth token endpoint used to refresh channel credentials
#[derive(Debug, Deserialize)]
pub struct OAuthConfig {
    pub token_endpoint: String,
    pub client_id: String,
    #[serde(skip)]
    pub client_secret: Option<Secret<String>>,
    /// Path to a file containing the client secret (alternative to OAUTH_CLIENT_SECRET)
    #[serde(default)]
    pub client_secret_file: Option<PathBuf>,
}

/// Background task intervals
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MaintenanceConfig {
    pub quota_reset_interval_secs: u64,
    pub refresh_interval_secs: u64,
    /// Tokens expiring within this window are refreshed proactively
    pub refresh_threshold_secs: u64,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            quota_reset_interval_secs: 300,
            refresh_interval_secs: 300,
            refresh_threshold_secs: 900,
        }
    }
}

/// One `[[channels]]` entry
#[derive(Debug, Deserialize)]
pub struct ChannelSection {
    pub id: String,
    pub name: String,
    /// Seeds the credential the first time the channel is seen. Once the
    /// store holds a record, the stored (possibly rotated) token wins.
    #[serde(default)]
    pub refresh_token_file: Option<PathBuf>,
    /// Overrides `[pool.defaults]` for this channel
    #[serde(default)]
    pub settings: Option<ChannelSettings>,
}

fn default_max_connections() -> usize {
    1000
}

impl Config {
    /// Load configuration from a TOML file, then overlay environment variables.
    ///
    /// Client secret resolution order:
    /// 1. OAUTH_CLIENT_SECRET env var
    /// 2. client_secret_file path from config
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;
        config.validate()?;

        if let Ok(secret) = std::env::var("OAUTH_CLIENT_SECRET") {
            config.oauth.client_secret = Some(Secret::new(secret));
        } else if let Some(ref secret_file) = config.oauth.client_secret_file {
            let secret = read_secret_file(secret_file, "client_secret_file")?;
            if !secret.is_empty() {
                config.oauth.client_secret = Some(Secret::new(secret));
            }
        }

        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if !self.oauth.token_endpoint.starts_with("http://")
            && !self.oauth.token_endpoint.starts_with("https://")
        {
            return Err(Error::Config(format!(
                "token_endpoint must start with http:// or https://, got: {}",
                self.oauth.token_endpoint
            )));
        }

        if self.oauth.client_id.trim().is_empty() {
            return Err(Error::Config("client_id must not be empty".into()));
        }

        if self.server.max_connections == 0 {
            return Err(Error::Config(
                "max_connections must be greater than 0".into(),
            ));
        }

        let m = &self.maintenance;
        if m.quota_reset_interval_secs == 0 || m.refresh_interval_secs == 0 {
            return Err(Error::Config(
                "maintenance intervals must be greater than 0".into(),
            ));
        }

        self.pool
            .validate()
            .map_err(|e| Error::Config(format!("[pool.defaults]: {e}")))?;

        let mut seen = HashSet::new();
        for channel in &self.channels {
            if channel.id.trim().is_empty() {
                return Err(Error::Config("channel id must not be empty".into()));
            }
            if !seen.insert(channel.id.as_str()) {
                return Err(Error::Config(format!(
                    "duplicate channel id: {}",
                    channel.id
                )));
            }
            if let Some(settings) = &channel.settings {
                settings
                    .validate()
                    .map_err(|e| Error::Config(format!("channel {}: {e}", channel.id)))?;
            }
        }

        Ok(())
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("channel-manager.toml")
    }
}

impl ChannelSection {
    /// Registration request for the pool.
    ///
    /// A configured refresh token becomes an already-expired credential, so
    /// the first use exchanges it for an access token.
    pub fn to_channel_config(&self) -> Result<ChannelConfig> {
        let credential = match &self.refresh_token_file {
            Some(path) => {
                let refresh = read_secret_file(path, "refresh_token_file")?;
                if refresh.is_empty() {
                    return Err(Error::Config(format!(
                        "refresh_token_file for channel {} is empty",
                        self.id
                    )));
                }
                Some(Credential::new(String::new(), Some(refresh), 0))
            }
            None => None,
        };
        Ok(ChannelConfig {
            id: self.id.clone(),
            name: self.name.clone(),
            credential,
            settings: self.settings.clone(),
        })
    }
}

fn read_secret_file(path: &Path, field: &str) -> Result<String> {
    let value = std::fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("failed to read {field} {}: {e}", path.display())))?;
    Ok(value.trim().to_owned())
}
