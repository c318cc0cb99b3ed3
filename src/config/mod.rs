//! Configuration management for the Sous gateway
//!
//! Priority: env > TOML file > default. CLI flags are applied on top by `main`.

pub mod file;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use secrecy::SecretString;
use url::Url;

use crate::auth::{Authenticator, JwksAuthenticator, StaticTokenAuthenticator};
use crate::relay::HeartbeatConfig;
use crate::upstream::CredentialCache;
use crate::upstream::bridge::{DEFAULT_MODEL, DEFAULT_VOICE};
use crate::upstream::credentials::{ServiceAccountTokenSource, StaticApiKey, TokenSource};
use crate::upstream::{DEFAULT_UPSTREAM_URL, UpstreamBridge};
use crate::{Error, Result};

pub use file::SousConfigFile;

/// Default API server port
pub const DEFAULT_PORT: u16 = 8787;

/// Sous gateway configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub upstream: UpstreamConfig,
    pub auth: AuthConfig,
    pub heartbeat: HeartbeatConfig,
    pub client: ClientConfig,
}

/// HTTP API server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,

    /// Recipe database (`None` keeps recipes in memory)
    pub db_path: Option<PathBuf>,

    /// Live session upgrades per minute, 0 disables limiting
    pub rate_limit_per_minute: u32,
}

/// Upstream AI endpoint configuration
#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    pub url: Url,
    pub model: String,
    pub voice: String,

    /// API key (from `GEMINI_API_KEY`)
    pub api_key: Option<SecretString>,

    /// Service account key file, used when no API key is set
    pub service_account: Option<PathBuf>,
}

/// Token validation configuration
#[derive(Debug, Clone, Default)]
pub struct AuthConfig {
    /// Identity provider base URL for JWT validation
    pub auth_base_url: Option<String>,

    /// Static `token:user` pairs
    pub tokens: Option<SecretString>,
}

/// Settings for `sous talk`
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub relay_url: String,
    pub token: Option<SecretString>,
}

impl Config {
    /// Load configuration from the config file and the process environment
    ///
    /// # Errors
    ///
    /// Returns error if a configured URL is invalid
    pub fn load() -> Result<Self> {
        Self::resolve(file::load_config_file(), |key| std::env::var(key).ok())
    }

    /// Merge a parsed config file with environment lookups
    ///
    /// # Errors
    ///
    /// Returns error if a configured URL is invalid
    pub fn resolve(fc: SousConfigFile, env: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let parse_secs = |key: &str| {
            env(key).and_then(|v| match v.parse::<u64>() {
                Ok(n) => Some(n),
                Err(_) => {
                    tracing::warn!(key, value = %v, "ignoring invalid duration");
                    None
                }
            })
        };

        let server = ServerConfig {
            port: env("SOUS_PORT")
                .or_else(|| env("PORT"))
                .and_then(|s| s.parse().ok())
                .or(fc.server.port)
                .unwrap_or(DEFAULT_PORT),
            db_path: env("SOUS_DB_PATH")
                .or(fc.server.db_path)
                .map(PathBuf::from),
            rate_limit_per_minute: env("SOUS_RATE_LIMIT")
                .and_then(|s| s.parse().ok())
                .or(fc.server.rate_limit_per_minute)
                .unwrap_or(0),
        };

        let raw_url = env("SOUS_UPSTREAM_URL")
            .or(fc.upstream.url)
            .unwrap_or_else(|| DEFAULT_UPSTREAM_URL.to_string());
        let url = Url::parse(&raw_url)
            .map_err(|e| Error::Config(format!("invalid upstream url {raw_url}: {e}")))?;

        let upstream = UpstreamConfig {
            url,
            model: env("SOUS_MODEL")
                .or(fc.upstream.model)
                .unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            voice: env("SOUS_VOICE")
                .or(fc.upstream.voice)
                .unwrap_or_else(|| DEFAULT_VOICE.to_string()),
            api_key: env("GEMINI_API_KEY")
                .or(fc.upstream.api_key)
                .filter(|k| !k.is_empty())
                .map(SecretString::from),
            service_account: env("SOUS_SERVICE_ACCOUNT")
                .or(fc.upstream.service_account)
                .map(PathBuf::from),
        };

        let auth = AuthConfig {
            auth_base_url: env("SOUS_AUTH_BASE_URL").or(fc.auth.base_url),
            tokens: env("SOUS_AUTH_TOKENS")
                .or(fc.auth.tokens)
                .map(SecretString::from),
        };

        let defaults = HeartbeatConfig::default();
        let heartbeat = HeartbeatConfig {
            interval: parse_secs("SOUS_HEARTBEAT_INTERVAL_SECS")
                .or(fc.heartbeat.interval_secs)
                .filter(|s| *s > 0)
                .map_or(defaults.interval, Duration::from_secs),
            timeout: parse_secs("SOUS_HEARTBEAT_TIMEOUT_SECS")
                .or(fc.heartbeat.timeout_secs)
                .filter(|s| *s > 0)
                .map_or(defaults.timeout, Duration::from_secs),
        };

        let client = ClientConfig {
            relay_url: env("SOUS_RELAY_URL")
                .or(fc.client.relay_url)
                .unwrap_or_else(|| format!("ws://127.0.0.1:{}", server.port)),
            token: env("SOUS_TOKEN").or(fc.client.token).map(SecretString::from),
        };

        Ok(Self {
            server,
            upstream,
            auth,
            heartbeat,
            client,
        })
    }

    /// Envelope translator for the configured model and voice
    #[must_use]
    pub fn bridge(&self) -> UpstreamBridge {
        UpstreamBridge::new(&self.upstream.model, &self.upstream.voice)
    }

    /// Shared upstream credential cache, if any credential is configured
    ///
    /// # Errors
    ///
    /// Returns error if the service account file cannot be loaded
    pub fn credential_cache(&self) -> Result<Option<Arc<CredentialCache>>> {
        use secrecy::ExposeSecret;

        let source: Arc<dyn TokenSource> = if let Some(key) = &self.upstream.api_key {
            Arc::new(StaticApiKey::new(key.expose_secret().to_string()))
        } else if let Some(path) = &self.upstream.service_account {
            Arc::new(ServiceAccountTokenSource::from_file(path)?)
        } else {
            tracing::warn!("no upstream credentials configured, live sessions will be refused");
            return Ok(None);
        };
        Ok(Some(Arc::new(CredentialCache::new(source))))
    }

    /// Token validator for live session upgrades
    #[must_use]
    pub fn authenticator(&self) -> Arc<dyn Authenticator> {
        use secrecy::ExposeSecret;

        if let Some(base_url) = &self.auth.auth_base_url {
            tracing::info!(auth_base_url = %base_url, "validating tokens against identity provider");
            return Arc::new(JwksAuthenticator::new(base_url.clone()));
        }

        let pairs = self
            .auth
            .tokens
            .as_ref()
            .map(|t| StaticTokenAuthenticator::parse_pairs(t.expose_secret()))
            .unwrap_or_default();
        if pairs.is_empty() {
            tracing::warn!("no auth configured, every live session will be rejected");
        }
        Arc::new(StaticTokenAuthenticator::new(pairs))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use secrecy::ExposeSecret;

    use super::*;

    fn env_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_without_any_source() {
        let config = Config::resolve(SousConfigFile::default(), env_from(&[])).unwrap();
        assert_eq!(config.server.port, DEFAULT_PORT);
        assert_eq!(config.upstream.url.as_str(), DEFAULT_UPSTREAM_URL);
        assert_eq!(config.upstream.model, DEFAULT_MODEL);
        assert_eq!(config.heartbeat, HeartbeatConfig::default());
        assert!(config.upstream.api_key.is_none());
        assert_eq!(config.client.relay_url, format!("ws://127.0.0.1:{DEFAULT_PORT}"));
        assert!(config.credential_cache().unwrap().is_none());
    }

    #[test]
    fn env_overrides_file() {
        let mut fc = SousConfigFile::default();
        fc.server.port = Some(9000);
        fc.upstream.voice = Some("Puck".to_string());
        fc.heartbeat.timeout_secs = Some(20);

        let config = Config::resolve(
            fc,
            env_from(&[
                ("SOUS_PORT", "9100"),
                ("GEMINI_API_KEY", "secret"),
                ("SOUS_HEARTBEAT_INTERVAL_SECS", "5"),
            ]),
        )
        .unwrap();

        assert_eq!(config.server.port, 9100);
        assert_eq!(config.upstream.voice, "Puck");
        assert_eq!(config.heartbeat.interval, Duration::from_secs(5));
        assert_eq!(config.heartbeat.timeout, Duration::from_secs(20));
        assert_eq!(
            config.upstream.api_key.as_ref().unwrap().expose_secret(),
            "secret"
        );
    }

    #[test]
    fn invalid_values_fall_back() {
        let config = Config::resolve(
            SousConfigFile::default(),
            env_from(&[
                ("SOUS_PORT", "not-a-port"),
                ("SOUS_HEARTBEAT_TIMEOUT_SECS", "0"),
            ]),
        )
        .unwrap();
        assert_eq!(config.server.port, DEFAULT_PORT);
        assert_eq!(config.heartbeat.timeout, HeartbeatConfig::default().timeout);
    }

    #[test]
    fn bad_upstream_url_is_a_config_error() {
        let err = Config::resolve(
            SousConfigFile::default(),
            env_from(&[("SOUS_UPSTREAM_URL", "not a url")]),
        )
        .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
