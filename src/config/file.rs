//! TOML configuration file loading
//!
//! Supports `~/.config/sous/config.toml` as a persistent config source.
//! All fields are optional; the file is a partial overlay on top of defaults.

use std::path::{Path, PathBuf};

use serde::Deserialize;

/// Top-level TOML configuration file schema
#[derive(Debug, Default, Deserialize)]
pub struct SousConfigFile {
    #[serde(default)]
    pub server: ServerFileConfig,

    #[serde(default)]
    pub upstream: UpstreamFileConfig,

    #[serde(default)]
    pub auth: AuthFileConfig,

    #[serde(default)]
    pub heartbeat: HeartbeatFileConfig,

    /// Settings for `sous talk`
    #[serde(default)]
    pub client: ClientFileConfig,
}

/// Server/runtime configuration
#[derive(Debug, Default, Deserialize)]
pub struct ServerFileConfig {
    pub port: Option<u16>,

    /// Recipe database path
    pub db_path: Option<String>,

    /// Live session upgrades per minute (0 disables limiting)
    pub rate_limit_per_minute: Option<u32>,
}

/// Upstream AI endpoint configuration
#[derive(Debug, Default, Deserialize)]
pub struct UpstreamFileConfig {
    pub url: Option<String>,
    pub model: Option<String>,
    pub voice: Option<String>,
    pub api_key: Option<String>,

    /// Service account JSON key file
    pub service_account: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct AuthFileConfig {
    /// Identity provider base URL for JWT validation
    pub base_url: Option<String>,

    /// Static `token:user` pairs, comma separated
    pub tokens: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct HeartbeatFileConfig {
    pub interval_secs: Option<u64>,
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ClientFileConfig {
    pub relay_url: Option<String>,
    pub token: Option<String>,
}

/// Load the TOML config file from the standard path
///
/// Returns `SousConfigFile::default()` if the file doesn't exist or can't be parsed.
pub fn load_config_file() -> SousConfigFile {
    let Some(path) = config_file_path() else {
        return SousConfigFile::default();
    };
    load_config_file_from(&path)
}

/// Load a TOML config file from `path`
pub fn load_config_file_from(path: &Path) -> SousConfigFile {
    if !path.exists() {
        return SousConfigFile::default();
    }

    match std::fs::read_to_string(path) {
        Ok(content) => match toml::from_str(&content) {
            Ok(config) => {
                tracing::info!(path = %path.display(), "loaded config file");
                config
            }
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "failed to parse config file, using defaults"
                );
                SousConfigFile::default()
            }
        },
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "failed to read config file"
            );
            SousConfigFile::default()
        }
    }
}

/// Return the config file path: `~/.config/sous/config.toml`
pub fn config_file_path() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| d.config_dir().join("sous").join("config.toml"))
}
