use std::{sync::Arc, time::Duration};

use chrono::Utc;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::{
    clients::identity::IdentityStore, config::Config, models::principal::Principal,
    trace::TraceContext,
};

const BEARER_PREFIX: &str = "Bearer ";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub iat: i64,
    pub exp: i64,
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("No credential supplied")]
    MissingCredential,

    #[error("Credential is not a bearer token")]
    MalformedCredential,

    #[error("Invalid token: {0}")]
    InvalidToken(#[from] jsonwebtoken::errors::Error),

    #[error("Identity store lookup failed: {0}")]
    IdentityStore(anyhow::Error),
}

impl AuthError {
    /// Soft failures leave the request anonymous; only store failures abort it.
    pub fn is_soft(&self) -> bool {
        !matches!(self, AuthError::IdentityStore(_))
    }
}

/// Verifies HS256 bearer tokens and resolves their subject to a [`Principal`].
pub struct Authenticator {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
    token_ttl: Duration,
    identity_store: Arc<dyn IdentityStore>,
}

impl Authenticator {
    pub fn new(secret: &[u8], token_ttl: Duration, identity_store: Arc<dyn IdentityStore>) -> Self {
        Self {
            encoding_key: EncodingKey::from_secret(secret),
            decoding_key: DecodingKey::from_secret(secret),
            validation: Validation::new(Algorithm::HS256),
            token_ttl,
            identity_store,
        }
    }

    pub fn from_config(config: &Config, identity_store: Arc<dyn IdentityStore>) -> Self {
        Self::new(
            config.jwt_secret.as_bytes(),
            Duration::from_secs(config.jwt_ttl_seconds),
            identity_store,
        )
    }

    pub fn identity_store(&self) -> &Arc<dyn IdentityStore> {
        &self.identity_store
    }

    pub fn issue_token(&self, subject: &str) -> Result<String, jsonwebtoken::errors::Error> {
        let now = Utc::now().timestamp();
        let ttl = i64::try_from(self.token_ttl.as_secs()).unwrap_or(i64::MAX);

        let claims = Claims {
            sub: subject.to_string(),
            iat: now,
            exp: now.saturating_add(ttl),
        };

        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
    }

    /// Checks signature and expiry and returns the token subject.
    pub fn verify(&self, authorization: Option<&str>) -> Result<String, AuthError> {
        let token = bearer_token(authorization)?;
        let data = decode::<Claims>(token, &self.decoding_key, &self.validation)?;

        if data.claims.sub.is_empty() {
            return Err(AuthError::MalformedCredential);
        }

        Ok(data.claims.sub)
    }

    /// `Ok(None)` for every credential problem; `Err` only when the identity
    /// store could not be queried.
    pub async fn authenticate(
        &self,
        authorization: Option<&str>,
    ) -> Result<Option<Principal>, AuthError> {
        let subject = match self.verify(authorization) {
            Ok(subject) => subject,
            Err(e) => {
                debug!(reason = %e, "Proceeding unauthenticated");
                return Ok(None);
            }
        };

        match self.identity_store.find_principal(&subject).await {
            Ok(Some(principal)) => {
                TraceContext::set_subject(&subject);
                Ok(Some(principal))
            }
            Ok(None) => {
                debug!(subject = %subject, "Token subject unknown, proceeding unauthenticated");
                Ok(None)
            }
            Err(e) => {
                warn!(subject = %subject, error = %e, "Identity lookup failed");
                Err(AuthError::IdentityStore(e))
            }
        }
    }
}

pub fn bearer_token(authorization: Option<&str>) -> Result<&str, AuthError> {
    let header = authorization.ok_or(AuthError::MissingCredential)?;

    let token = header
        .get(..BEARER_PREFIX.len())
        .filter(|prefix| prefix.eq_ignore_ascii_case(BEARER_PREFIX))
        .map(|_| header[BEARER_PREFIX.len()..].trim())
        .ok_or(AuthError::MalformedCredential)?;

    if token.is_empty() {
        return Err(AuthError::MalformedCredential);
    }

    Ok(token)
}
