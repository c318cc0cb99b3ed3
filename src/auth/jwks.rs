//! JWT validation against an OIDC identity provider

use std::time::{Duration, Instant};

use async_trait::async_trait;
use jsonwebtoken::{DecodingKey, Validation, decode, decode_header};
use serde::Deserialize;
use tokio::sync::RwLock;

use super::{AuthenticatedUser, Authenticator};
use crate::{Error, Result};

/// How long fetched keys are trusted
const JWKS_TTL: Duration = Duration::from_secs(3600);

/// Claims read from the token
#[derive(Debug, Deserialize)]
struct Claims {
    sub: String,
}

/// OIDC discovery document (partial)
#[derive(Deserialize)]
struct OidcDiscovery {
    jwks_uri: Option<String>,
}

struct CachedJwks {
    keys: Vec<jsonwebtoken::jwk::Jwk>,
    expires_at: Instant,
}

/// Validates JWTs with keys from the provider's JWKS endpoint
pub struct JwksAuthenticator {
    auth_base_url: String,
    client: reqwest::Client,
    keys: RwLock<Option<CachedJwks>>,
    jwks_uri: RwLock<Option<String>>,
}

impl JwksAuthenticator {
    #[must_use]
    pub fn new(auth_base_url: String) -> Self {
        Self {
            auth_base_url: auth_base_url.trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
            keys: RwLock::new(None),
            jwks_uri: RwLock::new(None),
        }
    }

    /// Resolve the JWKS URI from OIDC discovery (cached)
    async fn resolve_jwks_uri(&self) -> String {
        if let Some(uri) = self.jwks_uri.read().await.as_ref() {
            return uri.clone();
        }

        let discovery_url = format!("{}/.well-known/openid-configuration", self.auth_base_url);
        let discovered = match self.client.get(&discovery_url).send().await {
            Ok(resp) if resp.status().is_success() => resp
                .json::<OidcDiscovery>()
                .await
                .ok()
                .and_then(|doc| doc.jwks_uri),
            _ => None,
        };

        let uri = discovered.unwrap_or_else(|| {
            let fallback = format!("{}/.well-known/jwks.json", self.auth_base_url);
            tracing::debug!(fallback = %fallback, "OIDC discovery unavailable, using fallback");
            fallback
        });

        *self.jwks_uri.write().await = Some(uri.clone());
        uri
    }

    async fn get_jwks(&self) -> Result<Vec<jsonwebtoken::jwk::Jwk>> {
        {
            let cache = self.keys.read().await;
            if let Some(cached) = cache.as_ref().filter(|c| c.expires_at > Instant::now()) {
                return Ok(cached.keys.clone());
            }
        }

        let url = self.resolve_jwks_uri().await;
        let response = self.client.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(Error::Unauthorized(format!(
                "JWKS endpoint returned {}",
                response.status()
            )));
        }

        let jwk_set: jsonwebtoken::jwk::JwkSet = response.json().await?;
        tracing::debug!(url = %url, key_count = jwk_set.keys.len(), "fetched JWKS");

        let keys = jwk_set.keys;
        *self.keys.write().await = Some(CachedJwks {
            keys: keys.clone(),
            expires_at: Instant::now() + JWKS_TTL,
        });

        Ok(keys)
    }
}

#[async_trait]
impl Authenticator for JwksAuthenticator {
    async fn validate_token(&self, token: &str) -> Result<AuthenticatedUser> {
        let header =
            decode_header(token).map_err(|e| Error::Unauthorized(format!("invalid JWT header: {e}")))?;
        let jwks = self.get_jwks().await?;

        // Try each key until one works (key rotation)
        let mut last_error = None;
        for jwk in &jwks {
            let Ok(key) = DecodingKey::from_jwk(jwk) else {
                continue;
            };

            let mut validation = Validation::new(header.alg);
            validation.validate_exp = true;
            validation.validate_aud = false;
            validation.required_spec_claims.remove("aud");

            match decode::<Claims>(token, &key, &validation) {
                Ok(data) => {
                    return Ok(AuthenticatedUser {
                        user_id: data.claims.sub,
                    });
                }
                Err(e) => last_error = Some(e),
            }
        }

        Err(Error::Unauthorized(format!(
            "no key validated token (kid={:?}, last_error={:?})",
            header.kid, last_error
        )))
    }
}
