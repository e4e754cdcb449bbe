//! Identity Resolution
//!
//! Turns the token a client presents into a registered [`Identity`].
//! Tokens are JWTs; the subject claim carries the player handle. A decoded
//! handle is only accepted once the account store confirms it exists.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, TokenData, Validation};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::debug;

use crate::core::Identity;
use crate::store::{StoreError, UserStore};

/// Name of the cookie a browser client carries its token in.
pub const TOKEN_COOKIE: &str = "token";

/// Authentication configuration.
#[derive(Clone, Debug)]
pub struct AuthConfig {
    /// Expected issuer claim ("iss"). If None, any issuer accepted.
    pub issuer: Option<String>,
    /// Expected audience claim ("aud"). If None, any audience accepted.
    pub audience: Option<String>,
    /// RS256 public key in PEM format, for tokens from an external provider.
    pub public_key_pem: Option<String>,
    /// HS256 secret shared with the token issuer.
    pub secret: Option<String>,
    /// Whether to skip expiry validation (for testing only).
    pub skip_expiry: bool,
    /// Lifetime of tokens produced by [`issue_token`].
    pub token_ttl: Duration,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            issuer: None,
            audience: None,
            public_key_pem: None,
            secret: None,
            skip_expiry: false,
            token_ttl: Duration::from_secs(24 * 60 * 60),
        }
    }
}

impl AuthConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        Self {
            issuer: std::env::var("AUTH_ISSUER").ok(),
            audience: std::env::var("AUTH_AUDIENCE").ok(),
            public_key_pem: std::env::var("AUTH_PUBLIC_KEY_PEM").ok(),
            secret: std::env::var("AUTH_SECRET").ok(),
            skip_expiry: std::env::var("AUTH_SKIP_EXPIRY")
                .map(|v| v == "true" || v == "1")
                .unwrap_or(false),
            token_ttl: std::env::var("AUTH_TOKEN_TTL_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(Duration::from_secs(24 * 60 * 60)),
        }
    }

    /// Check if authentication is configured.
    pub fn is_configured(&self) -> bool {
        self.public_key_pem.is_some() || self.secret.is_some()
    }
}

/// Claims carried by an identity token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenClaims {
    /// Subject: the player handle.
    pub sub: String,
    /// Expiry timestamp (Unix seconds).
    #[serde(default)]
    pub exp: u64,
    /// Issued at timestamp.
    #[serde(default)]
    pub iat: u64,
    /// Issuer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iss: Option<String>,
    /// Audience.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aud: Option<serde_json::Value>,
}

impl TokenClaims {
    /// The identity named by the subject claim.
    pub fn identity(&self) -> Identity {
        Identity::new(self.sub.clone())
    }
}

/// Authentication errors.
#[derive(Debug, Error)]
pub enum AuthError {
    /// No token presented.
    #[error("missing token")]
    MissingToken,
    /// No authentication configured on server.
    #[error("authentication not configured")]
    NotConfigured,
    /// Token format is invalid.
    #[error("invalid token format")]
    InvalidFormat,
    /// Token signature verification failed.
    #[error("invalid signature")]
    InvalidSignature,
    /// Token has expired.
    #[error("token expired")]
    Expired,
    /// Issuer claim doesn't match expected value.
    #[error("invalid issuer")]
    InvalidIssuer,
    /// Audience claim doesn't match expected value.
    #[error("invalid audience")]
    InvalidAudience,
    /// Required claim is missing.
    #[error("missing required claim: {0}")]
    MissingClaim(String),
    /// JWT decoding error.
    #[error("decode error: {0}")]
    DecodeError(String),
    /// Token decoded but the account store has no such player.
    #[error("unknown identity: {0}")]
    UnknownIdentity(Identity),
    /// Account store failed during lookup.
    #[error("identity lookup failed: {0}")]
    Storage(StoreError),
    /// Token could not be produced.
    #[error("token encoding failed: {0}")]
    Encode(String),
}

impl AuthError {
    /// Whether the token itself was bad (as opposed to missing, unknown,
    /// or a server-side problem).
    pub fn is_invalid_token(&self) -> bool {
        matches!(
            self,
            AuthError::InvalidFormat
                | AuthError::InvalidSignature
                | AuthError::Expired
                | AuthError::InvalidIssuer
                | AuthError::InvalidAudience
                | AuthError::MissingClaim(_)
                | AuthError::DecodeError(_)
        )
    }
}

/// Validate a JWT token and extract claims.
pub fn validate_token(token: &str, config: &AuthConfig) -> Result<TokenClaims, AuthError> {
    if !config.is_configured() {
        return Err(AuthError::NotConfigured);
    }

    let algorithm = if config.public_key_pem.is_some() {
        Algorithm::RS256
    } else {
        Algorithm::HS256
    };

    let mut validation = Validation::new(algorithm);
    validation.required_spec_claims = std::collections::HashSet::new();

    if let Some(ref issuer) = config.issuer {
        validation.set_issuer(&[issuer]);
    }

    if let Some(ref audience) = config.audience {
        validation.set_audience(&[audience]);
    } else {
        validation.validate_aud = false;
    }

    if config.skip_expiry {
        validation.validate_exp = false;
    }

    let token_data: TokenData<TokenClaims> = if let Some(ref pem) = config.public_key_pem {
        let key = DecodingKey::from_rsa_pem(pem.as_bytes())
            .map_err(|e| AuthError::DecodeError(format!("invalid public key: {}", e)))?;
        decode(token, &key, &validation).map_err(map_jwt_error)?
    } else if let Some(ref secret) = config.secret {
        let key = DecodingKey::from_secret(secret.as_bytes());
        decode(token, &key, &validation).map_err(map_jwt_error)?
    } else {
        return Err(AuthError::NotConfigured);
    };

    let claims = token_data.claims;

    if claims.sub.is_empty() {
        return Err(AuthError::MissingClaim("sub".into()));
    }

    // jsonwebtoken skips exp when the claim is absent; enforce it when present
    if !config.skip_expiry && claims.exp > 0 && unix_now() > claims.exp {
        return Err(AuthError::Expired);
    }

    Ok(claims)
}

/// Produce an HS256 token naming `identity`.
pub fn issue_token(identity: &Identity, config: &AuthConfig) -> Result<String, AuthError> {
    let secret = config.secret.as_ref().ok_or(AuthError::NotConfigured)?;
    let now = unix_now();
    let claims = TokenClaims {
        sub: identity.as_str().to_string(),
        exp: now + config.token_ttl.as_secs(),
        iat: now,
        iss: config.issuer.clone(),
        aud: config.audience.clone().map(serde_json::Value::String),
    };
    encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .map_err(|e| AuthError::Encode(e.to_string()))
}

/// Short stable fingerprint of a token, for logs. Never log the token itself.
pub fn token_fingerprint(token: &str) -> String {
    let digest = Sha256::digest(token.as_bytes());
    hex::encode(&digest[..4])
}

/// Pull a token out of handshake metadata.
///
/// Checked in order: `Authorization: Bearer`, the `token` cookie, a
/// `token` query parameter.
pub fn token_from_parts(
    authorization: Option<&str>,
    cookie: Option<&str>,
    query: Option<&str>,
) -> Option<String> {
    let bearer = authorization
        .and_then(|h| h.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty());
    if let Some(token) = bearer {
        return Some(token.to_string());
    }

    let from_cookie = cookie.and_then(|c| {
        c.split(';')
            .filter_map(|pair| pair.trim().split_once('='))
            .find(|(name, value)| *name == TOKEN_COOKIE && !value.is_empty())
            .map(|(_, value)| value.to_string())
    });
    if from_cookie.is_some() {
        return from_cookie;
    }

    query.and_then(|q| {
        q.split('&')
            .filter_map(|pair| pair.split_once('='))
            .find(|(name, value)| *name == "token" && !value.is_empty())
            .map(|(_, value)| value.to_string())
    })
}

/// Resolves presented tokens to registered identities.
#[derive(Clone)]
pub struct IdentityResolver {
    config: AuthConfig,
    store: Arc<dyn UserStore>,
}

impl IdentityResolver {
    /// Create a resolver backed by `store`.
    pub fn new(config: AuthConfig, store: Arc<dyn UserStore>) -> Self {
        Self { config, store }
    }

    /// Auth configuration in use.
    pub fn config(&self) -> &AuthConfig {
        &self.config
    }

    /// Decode `token` and confirm the identity is registered.
    pub async fn resolve(&self, token: &str) -> Result<Identity, AuthError> {
        let claims = validate_token(token, &self.config)?;
        let identity = claims.identity();

        match self.store.get_user(&identity).await {
            Ok(_) => {
                debug!("Token {} resolved to {}", token_fingerprint(token), identity);
                Ok(identity)
            }
            Err(StoreError::NotFound(_)) => Err(AuthError::UnknownIdentity(identity)),
            Err(e) => Err(AuthError::Storage(e)),
        }
    }

    /// Like [`resolve`](Self::resolve) but fails closed on an absent token.
    pub async fn resolve_optional(&self, token: Option<&str>) -> Result<Identity, AuthError> {
        match token {
            Some(t) if !t.is_empty() => self.resolve(t).await,
            _ => Err(AuthError::MissingToken),
        }
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Map JWT library errors to our error type.
fn map_jwt_error(err: jsonwebtoken::errors::Error) -> AuthError {
    use jsonwebtoken::errors::ErrorKind;
    match err.kind() {
        ErrorKind::ExpiredSignature => AuthError::Expired,
        ErrorKind::InvalidSignature => AuthError::InvalidSignature,
        ErrorKind::InvalidIssuer => AuthError::InvalidIssuer,
        ErrorKind::InvalidAudience => AuthError::InvalidAudience,
        ErrorKind::InvalidToken | ErrorKind::Base64(_) => AuthError::InvalidFormat,
        _ => AuthError::DecodeError(err.to_string()),
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryUserStore, UserRecord};

    const SECRET: &str = "test-secret-key-256-bits-long!!";

    fn create_test_token(claims: &TokenClaims, secret: &str) -> String {
        let header = Header::new(Algorithm::HS256);
        let key = EncodingKey::from_secret(secret.as_bytes());
        encode(&header, claims, &key).unwrap()
    }

    fn test_claims() -> TokenClaims {
        let now = unix_now();
        TokenClaims {
            sub: "alice".into(),
            exp: now + 3600,
            iat: now,
            iss: Some("test-issuer".into()),
            aud: Some(serde_json::json!("test-audience")),
        }
    }

    fn secret_config() -> AuthConfig {
        AuthConfig {
            secret: Some(SECRET.into()),
            ..Default::default()
        }
    }

    async fn resolver_with(names: &[&str]) -> IdentityResolver {
        let store = Arc::new(MemoryUserStore::new());
        for name in names {
            store
                .create_user(UserRecord::new(Identity::new(*name), 600))
                .await
                .unwrap();
        }
        IdentityResolver::new(secret_config(), store)
    }

    #[test]
    fn test_valid_token_validation() {
        let token = create_test_token(&test_claims(), SECRET);
        let result = validate_token(&token, &secret_config());
        assert_eq!(result.unwrap().sub, "alice");
    }

    #[test]
    fn test_expired_token_rejected() {
        let mut claims = test_claims();
        claims.exp = 1;
        let token = create_test_token(&claims, SECRET);

        let result = validate_token(&token, &secret_config());
        assert!(matches!(result, Err(AuthError::Expired)));
    }

    #[test]
    fn test_invalid_signature_rejected() {
        let token = create_test_token(&test_claims(), "correct-secret-key-here!!!!!");
        let config = AuthConfig {
            secret: Some("wrong-secret-key-here!!!!!!".into()),
            ..Default::default()
        };

        let result = validate_token(&token, &config);
        assert!(matches!(result, Err(AuthError::InvalidSignature)));
    }

    #[test]
    fn test_garbage_token_is_invalid_format() {
        let result = validate_token("not-a-jwt", &secret_config());
        let err = result.unwrap_err();
        assert!(err.is_invalid_token());
    }

    #[test]
    fn test_missing_sub_rejected() {
        let mut claims = test_claims();
        claims.sub = String::new();
        let token = create_test_token(&claims, SECRET);

        let result = validate_token(&token, &secret_config());
        assert!(matches!(result, Err(AuthError::MissingClaim(_))));
    }

    #[test]
    fn test_issuer_validation() {
        let token = create_test_token(&test_claims(), SECRET);
        let config = AuthConfig {
            issuer: Some("wrong-issuer".into()),
            ..secret_config()
        };

        let result = validate_token(&token, &config);
        assert!(matches!(result, Err(AuthError::InvalidIssuer)));
    }

    #[test]
    fn test_not_configured_error() {
        let result = validate_token("some.jwt.token", &AuthConfig::default());
        assert!(matches!(result, Err(AuthError::NotConfigured)));
    }

    #[test]
    fn test_skip_expiry_for_testing() {
        let mut claims = test_claims();
        claims.exp = 1;
        let token = create_test_token(&claims, SECRET);
        let config = AuthConfig {
            skip_expiry: true,
            ..secret_config()
        };

        assert!(validate_token(&token, &config).is_ok());
    }

    #[test]
    fn test_issued_token_validates() {
        let config = AuthConfig {
            issuer: Some("duel-relay".into()),
            audience: Some("players".into()),
            ..secret_config()
        };
        let token = issue_token(&Identity::new("bob"), &config).unwrap();

        let claims = validate_token(&token, &config).unwrap();
        assert_eq!(claims.identity(), Identity::new("bob"));
        assert!(claims.exp > claims.iat);
    }

    #[test]
    fn test_issue_requires_secret() {
        let result = issue_token(&Identity::new("bob"), &AuthConfig::default());
        assert!(matches!(result, Err(AuthError::NotConfigured)));
    }

    #[test]
    fn test_fingerprint_is_stable_and_short() {
        assert_eq!(token_fingerprint("abc"), token_fingerprint("abc"));
        assert_ne!(token_fingerprint("abc"), token_fingerprint("abd"));
        assert_eq!(token_fingerprint("abc").len(), 8);
    }

    #[test]
    fn test_token_from_parts_precedence() {
        assert_eq!(
            token_from_parts(Some("Bearer aaa"), Some("token=bbb"), Some("token=ccc")),
            Some("aaa".to_string())
        );
        assert_eq!(
            token_from_parts(None, Some("theme=dark; token=bbb"), Some("token=ccc")),
            Some("bbb".to_string())
        );
        assert_eq!(
            token_from_parts(None, Some("theme=dark"), Some("x=1&token=ccc")),
            Some("ccc".to_string())
        );
        assert_eq!(token_from_parts(Some("Basic zzz"), Some("token="), None), None);
    }

    #[tokio::test]
    async fn test_resolve_registered_identity() {
        let resolver = resolver_with(&["alice"]).await;
        let token = issue_token(&Identity::new("alice"), resolver.config()).unwrap();

        let identity = resolver.resolve(&token).await.unwrap();
        assert_eq!(identity, Identity::new("alice"));
    }

    #[tokio::test]
    async fn test_resolve_unknown_identity() {
        let resolver = resolver_with(&["alice"]).await;
        let token = issue_token(&Identity::new("mallory"), resolver.config()).unwrap();

        let result = resolver.resolve(&token).await;
        assert!(matches!(result, Err(AuthError::UnknownIdentity(id)) if id == Identity::new("mallory")));
    }

    #[tokio::test]
    async fn test_resolve_missing_token() {
        let resolver = resolver_with(&["alice"]).await;
        assert!(matches!(
            resolver.resolve_optional(None).await,
            Err(AuthError::MissingToken)
        ));
        assert!(matches!(
            resolver.resolve_optional(Some("")).await,
            Err(AuthError::MissingToken)
        ));
    }

    #[tokio::test]
    async fn test_resolve_store_down() {
        let store = Arc::new(MemoryUserStore::new());
        store
            .create_user(UserRecord::new(Identity::new("alice"), 600))
            .await
            .unwrap();
        store.set_unavailable(true);
        let resolver = IdentityResolver::new(secret_config(), store);
        let token = issue_token(&Identity::new("alice"), resolver.config()).unwrap();

        assert!(matches!(resolver.resolve(&token).await, Err(AuthError::Storage(_))));
    }
}
