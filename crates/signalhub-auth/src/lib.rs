//! Token verification hooks.
//!
//! The spec treats "authentication policies" as out of scope beyond a
//! verification hook (§1 Non-goals); this crate defines that hook's
//! contract (grounded on `spacetimedb-core`'s `auth::token_validation`
//! module) plus a ready-to-use JWT-backed implementation.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use signalhub_messages::UserId;

/// The claims a verified token yields: who the caller is and, optionally,
/// when that verification expires (driving the session's token-expiry timer,
/// spec §4.4).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Claims {
    pub user_id: UserId,
    pub expires_at: Option<DateTime<Utc>>,
}

impl Claims {
    pub fn anonymous() -> Self {
        Self {
            user_id: UserId::anonymous(),
            expires_at: None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CredentialsError {
    #[error("missing token")]
    MissingToken,
    #[error("invalid token: {0}")]
    Invalid(#[from] jsonwebtoken::errors::Error),
    #[error("token subject exceeds the maximum allowed length")]
    SubjectTooLong,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// A hook a [`Node`](../signalhub_core/struct.Node.html) consults to turn a
/// bearer token (from `Connect` or `Refresh`) into [`Claims`].
///
/// Mirrors the teacher's `TokenValidator` trait: async, object-safe via
/// `Arc<dyn CredentialsHook>`, and free of any assumption about where keys
/// come from.
#[async_trait]
pub trait CredentialsHook: Send + Sync {
    async fn authenticate(&self, token: &str) -> Result<Claims, CredentialsError>;
}

#[async_trait]
impl<T: CredentialsHook + ?Sized> CredentialsHook for std::sync::Arc<T> {
    async fn authenticate(&self, token: &str) -> Result<Claims, CredentialsError> {
        (**self).authenticate(token).await
    }
}

/// Accepts connections without a token as anonymous, and treats any
/// non-empty token as a bare user id. Useful for local development and
/// as the default in tests; not suitable for production deployments.
pub struct AnonymousCredentialsHook;

#[async_trait]
impl CredentialsHook for AnonymousCredentialsHook {
    async fn authenticate(&self, token: &str) -> Result<Claims, CredentialsError> {
        if token.is_empty() {
            return Ok(Claims::anonymous());
        }
        Ok(Claims {
            user_id: UserId::from(token),
            expires_at: None,
        })
    }
}

const MAX_SUBJECT_LEN: usize = 128;

/// The token payload this crate expects from a signed JWT, once decoded.
#[derive(Debug, Serialize, Deserialize)]
struct SignalhubClaims {
    sub: String,
    #[serde(default)]
    exp: Option<i64>,
}

/// Verifies HMAC/RSA/EC-signed JWTs against a single decoding key and issuer
/// audience, the way `BasicTokenValidator` does in the teacher crate.
pub struct JwtCredentialsHook {
    decoding_key: DecodingKey,
    validation: Validation,
}

impl JwtCredentialsHook {
    pub fn new(decoding_key: DecodingKey, algorithm: Algorithm) -> Self {
        let mut validation = Validation::new(algorithm);
        validation.validate_exp = true;
        // We decode `aud` ourselves if present; don't require the claim.
        validation.validate_aud = false;
        Self {
            decoding_key,
            validation,
        }
    }

    pub fn with_leeway(mut self, leeway: Duration) -> Self {
        self.validation.leeway = leeway.as_secs();
        self
    }
}

#[async_trait]
impl CredentialsHook for JwtCredentialsHook {
    async fn authenticate(&self, token: &str) -> Result<Claims, CredentialsError> {
        if token.is_empty() {
            return Err(CredentialsError::MissingToken);
        }
        let data = decode::<SignalhubClaims>(token, &self.decoding_key, &self.validation)?;
        if data.claims.sub.len() > MAX_SUBJECT_LEN {
            return Err(CredentialsError::SubjectTooLong);
        }
        let expires_at = data
            .claims
            .exp
            .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0));
        Ok(Claims {
            user_id: UserId::from(data.claims.sub),
            expires_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};

    #[tokio::test]
    async fn anonymous_hook_accepts_empty_token() {
        let claims = AnonymousCredentialsHook.authenticate("").await.unwrap();
        assert!(claims.user_id.is_anonymous());
    }

    #[tokio::test]
    async fn anonymous_hook_treats_token_as_user_id() {
        let claims = AnonymousCredentialsHook.authenticate("alice").await.unwrap();
        assert_eq!(claims.user_id, UserId::from("alice"));
    }

    #[tokio::test]
    async fn jwt_hook_round_trips_a_valid_token() {
        let secret = b"test-secret";
        let claims = SignalhubClaims {
            sub: "bob".into(),
            exp: Some((Utc::now() + chrono::Duration::hours(1)).timestamp()),
        };
        let token = encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(secret),
        )
        .unwrap();

        let hook = JwtCredentialsHook::new(DecodingKey::from_secret(secret), Algorithm::HS256);
        let verified = hook.authenticate(&token).await.unwrap();
        assert_eq!(verified.user_id, UserId::from("bob"));
        assert!(verified.expires_at.is_some());
    }

    #[tokio::test]
    async fn jwt_hook_rejects_expired_token() {
        let secret = b"test-secret";
        let claims = SignalhubClaims {
            sub: "bob".into(),
            exp: Some((Utc::now() - chrono::Duration::hours(1)).timestamp()),
        };
        let token = encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(secret),
        )
        .unwrap();

        let hook = JwtCredentialsHook::new(DecodingKey::from_secret(secret), Algorithm::HS256);
        assert!(hook.authenticate(&token).await.is_err());
    }

    #[tokio::test]
    async fn jwt_hook_rejects_missing_token() {
        let hook = JwtCredentialsHook::new(DecodingKey::from_secret(b"s"), Algorithm::HS256);
        assert!(matches!(
            hook.authenticate("").await,
            Err(CredentialsError::MissingToken)
        ));
    }
}
