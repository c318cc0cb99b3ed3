//! Upstream credentials with a shared stale-while-revalidate cache
//!
//! Sessions read the cached credential concurrently. When it nears expiry the
//! first reader kicks off a background refresh and everyone keeps using the
//! stale value meanwhile. Only an empty or long-expired cache blocks.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::{Error, Result};

/// Refresh this long before a credential expires
const REFRESH_MARGIN: Duration = Duration::from_secs(300);

/// Keep serving an expired credential for this long while a refresh runs
const STALE_GRACE: Duration = Duration::from_secs(60);

/// OAuth scope for the service account grant
const SERVICE_ACCOUNT_SCOPE: &str = "https://www.googleapis.com/auth/cloud-platform";

/// How a credential is attached to the upstream request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialKind {
    /// `?key=` query parameter
    ApiKey,
    /// `Authorization: Bearer` header
    Bearer,
}

/// A credential ready to attach
#[derive(Debug)]
pub struct Credential {
    pub kind: CredentialKind,
    pub secret: SecretString,
}

/// Credential plus its expiry
#[derive(Debug)]
pub struct IssuedCredential {
    pub credential: Arc<Credential>,
    /// `None` never expires
    pub expires_at: Option<Instant>,
}

/// Produces fresh credentials
#[async_trait]
pub trait TokenSource: Send + Sync {
    /// Fetch a new credential
    async fn fetch(&self) -> Result<IssuedCredential>;
}

#[derive(Debug, PartialEq, Eq)]
enum Freshness {
    Fresh,
    Stale,
    Expired,
}

fn freshness(expires_at: Option<Instant>, now: Instant) -> Freshness {
    let Some(expires_at) = expires_at else {
        return Freshness::Fresh;
    };
    if now + REFRESH_MARGIN < expires_at {
        Freshness::Fresh
    } else if now < expires_at + STALE_GRACE {
        Freshness::Stale
    } else {
        Freshness::Expired
    }
}

/// Shared cache in front of a [`TokenSource`]
pub struct CredentialCache {
    source: Arc<dyn TokenSource>,
    cached: RwLock<Option<IssuedCredential>>,
    refreshing: AtomicBool,
}

impl CredentialCache {
    #[must_use]
    pub fn new(source: Arc<dyn TokenSource>) -> Self {
        Self {
            source,
            cached: RwLock::new(None),
            refreshing: AtomicBool::new(false),
        }
    }

    /// Get a usable credential
    ///
    /// # Errors
    ///
    /// Returns error if nothing usable is cached and the fetch fails
    pub async fn get(self: &Arc<Self>) -> Result<Arc<Credential>> {
        {
            let cached = self.cached.read().await;
            if let Some(issued) = cached.as_ref() {
                match freshness(issued.expires_at, Instant::now()) {
                    Freshness::Fresh => return Ok(Arc::clone(&issued.credential)),
                    Freshness::Stale => {
                        self.spawn_refresh();
                        return Ok(Arc::clone(&issued.credential));
                    }
                    Freshness::Expired => {}
                }
            }
        }

        let mut cached = self.cached.write().await;
        // Another writer may have refreshed while we waited
        if let Some(issued) = cached.as_ref() {
            if freshness(issued.expires_at, Instant::now()) != Freshness::Expired {
                return Ok(Arc::clone(&issued.credential));
            }
        }

        let issued = self.source.fetch().await?;
        let credential = Arc::clone(&issued.credential);
        *cached = Some(issued);
        tracing::debug!("upstream credential fetched");
        Ok(credential)
    }

    fn spawn_refresh(self: &Arc<Self>) {
        if self.refreshing.swap(true, Ordering::AcqRel) {
            return;
        }
        let this = Arc::clone(self);
        tokio::spawn(async move {
            match this.source.fetch().await {
                Ok(issued) => {
                    *this.cached.write().await = Some(issued);
                    tracing::debug!("upstream credential refreshed in background");
                }
                Err(e) => {
                    tracing::warn!(error = %e, "credential refresh failed, serving stale credential");
                }
            }
            this.refreshing.store(false, Ordering::Release);
        });
    }
}

/// API key that never expires
pub struct StaticApiKey {
    key: String,
}

impl StaticApiKey {
    #[must_use]
    pub const fn new(key: String) -> Self {
        Self { key }
    }
}

#[async_trait]
impl TokenSource for StaticApiKey {
    async fn fetch(&self) -> Result<IssuedCredential> {
        Ok(IssuedCredential {
            credential: Arc::new(Credential {
                kind: CredentialKind::ApiKey,
                secret: SecretString::from(self.key.clone()),
            }),
            expires_at: None,
        })
    }
}

/// Service account key file (partial)
#[derive(Deserialize)]
struct ServiceAccountKey {
    client_email: String,
    private_key: String,
    token_uri: String,
}

#[derive(Serialize)]
struct GrantClaims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
}

/// OAuth access tokens minted from a service account (JWT bearer grant)
pub struct ServiceAccountTokenSource {
    key: ServiceAccountKey,
    client: reqwest::Client,
}

impl ServiceAccountTokenSource {
    /// Load a service account JSON key file
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read or parsed
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let key: ServiceAccountKey = serde_json::from_str(&raw)?;
        Ok(Self {
            key,
            client: reqwest::Client::new(),
        })
    }

    fn signed_assertion(&self) -> Result<String> {
        let iat = chrono::Utc::now().timestamp();
        let claims = GrantClaims {
            iss: &self.key.client_email,
            scope: SERVICE_ACCOUNT_SCOPE,
            aud: &self.key.token_uri,
            iat,
            exp: iat + 3600,
        };
        let key = EncodingKey::from_rsa_pem(self.key.private_key.as_bytes())
            .map_err(|e| Error::Config(format!("invalid service account key: {e}")))?;
        jsonwebtoken::encode(&Header::new(Algorithm::RS256), &claims, &key)
            .map_err(|e| Error::Config(format!("failed to sign grant: {e}")))
    }
}

#[async_trait]
impl TokenSource for ServiceAccountTokenSource {
    async fn fetch(&self) -> Result<IssuedCredential> {
        let assertion = self.signed_assertion()?;
        let response = self
            .client
            .post(&self.key.token_uri)
            .form(&[
                ("grant_type", "urn:ietf:params:oauth:grant-type:jwt-bearer"),
                ("assertion", assertion.as_str()),
            ])
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Error::Upstream(format!(
                "token endpoint returned {}",
                response.status()
            )));
        }

        let token: TokenResponse = response.json().await?;
        Ok(IssuedCredential {
            credential: Arc::new(Credential {
                kind: CredentialKind::Bearer,
                secret: SecretString::from(token.access_token),
            }),
            expires_at: Some(Instant::now() + Duration::from_secs(token.expires_in)),
        })
    }
}
