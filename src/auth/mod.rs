//! Authentication collaborator
//!
//! Validates the bearer credential presented when a client opens a live
//! session. Two modes:
//! - `Jwks`: JWTs signed by an OIDC identity provider
//! - `Static`: fixed `token:user` pairs for local development

mod jwks;

use std::collections::HashMap;

use async_trait::async_trait;
use axum::http::HeaderMap;
use secrecy::{ExposeSecret, SecretString};

use crate::{Error, Result};

pub use jwks::JwksAuthenticator;

/// Identity resolved from a valid credential
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedUser {
    pub user_id: String,
}

/// Validates bearer credentials
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Resolve the user behind a token
    ///
    /// # Errors
    ///
    /// Returns `Error::Unauthorized` if the token is not valid
    async fn validate_token(&self, token: &str) -> Result<AuthenticatedUser>;
}

/// Fixed token table
pub struct StaticTokenAuthenticator {
    tokens: HashMap<String, String>,
}

impl StaticTokenAuthenticator {
    /// Build from `(token, user_id)` pairs
    #[must_use]
    pub fn new<I>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (SecretString, String)>,
    {
        let tokens = pairs
            .into_iter()
            .map(|(token, user)| (token.expose_secret().to_string(), user))
            .collect();
        Self { tokens }
    }

    /// Parse `token:user,token:user` as used by `SOUS_AUTH_TOKENS`
    #[must_use]
    pub fn parse_pairs(raw: &str) -> Vec<(SecretString, String)> {
        raw.split(',')
            .filter_map(|pair| {
                let (token, user) = pair.trim().split_once(':')?;
                if token.is_empty() || user.is_empty() {
                    return None;
                }
                Some((SecretString::from(token.to_string()), user.to_string()))
            })
            .collect()
    }
}

#[async_trait]
impl Authenticator for StaticTokenAuthenticator {
    async fn validate_token(&self, token: &str) -> Result<AuthenticatedUser> {
        self.tokens
            .get(token)
            .map(|user_id| AuthenticatedUser {
                user_id: user_id.clone(),
            })
            .ok_or_else(|| Error::Unauthorized("unknown token".to_string()))
    }
}

/// Extract a bearer token from the Authorization header
#[must_use]
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
}
