//! JWT Authentication
//!
//! Validates JWTs from external auth providers. The server does NOT issue
//! tokens, it only checks them during the connect handshake.

use jsonwebtoken::{decode, Algorithm, DecodingKey, TokenData, Validation};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::network::session::SessionId;

/// Authentication configuration.
#[derive(Clone, Debug, Default)]
pub struct AuthConfig {
    /// Expected issuer claim ("iss"). If None, any issuer accepted.
    pub issuer: Option<String>,
    /// Expected audience claim ("aud"). If None, any audience accepted.
    pub audience: Option<String>,
    /// RS256 public key in PEM format (preferred for external providers).
    pub public_key_pem: Option<String>,
    /// HS256 secret (fallback for simple setups).
    pub secret: Option<String>,
    /// Whether to skip expiry validation (for testing only).
    pub skip_expiry: bool,
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
        }
    }

    /// Check if authentication is configured.
    pub fn is_configured(&self) -> bool {
        self.public_key_pem.is_some() || self.secret.is_some()
    }
}

/// Claims read from a player token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenClaims {
    /// Subject, the user id at the auth provider.
    pub sub: String,
    /// Expiry timestamp (Unix seconds).
    #[serde(default)]
    pub exp: u64,
    /// Issued at timestamp.
    #[serde(default)]
    pub iat: u64,
    /// Issuer (auth provider).
    #[serde(default)]
    pub iss: Option<String>,
    /// Audience.
    #[serde(default)]
    pub aud: Option<serde_json::Value>,
    /// Display name, overrides the one sent in the handshake.
    #[serde(default)]
    pub name: Option<String>,
}

impl TokenClaims {
    /// Derive a stable session identity from the subject claim.
    ///
    /// The same subject always maps to the same identity, so a second login
    /// replaces the first.
    pub fn session_id(&self) -> SessionId {
        let mut hasher = Sha256::new();
        hasher.update(b"voxel-world-player:");
        hasher.update(self.sub.as_bytes());
        let hash = hasher.finalize();

        let mut id = [0u8; 16];
        id.copy_from_slice(&hash[..16]);
        SessionId::from_bytes(id)
    }
}

/// Authentication errors.
#[derive(Debug, Error)]
pub enum AuthError {
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
}

/// Validate a JWT token and extract claims.
pub fn validate_token(token: &str, config: &AuthConfig) -> Result<TokenClaims, AuthError> {
    let (key, algorithm) = if let Some(ref pem) = config.public_key_pem {
        let key = DecodingKey::from_rsa_pem(pem.as_bytes())
            .map_err(|e| AuthError::DecodeError(format!("invalid public key: {}", e)))?;
        (key, Algorithm::RS256)
    } else if let Some(ref secret) = config.secret {
        (DecodingKey::from_secret(secret.as_bytes()), Algorithm::HS256)
    } else {
        return Err(AuthError::NotConfigured);
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

    let token_data: TokenData<TokenClaims> = decode(token, &key, &validation).map_err(map_jwt_error)?;
    let claims = token_data.claims;

    if claims.sub.is_empty() {
        return Err(AuthError::MissingClaim("sub".into()));
    }

    // exp = 0 means the provider issued no expiry
    if !config.skip_expiry && claims.exp > 0 {
        let now = chrono::Utc::now().timestamp().max(0) as u64;
        if now > claims.exp {
            return Err(AuthError::Expired);
        }
    }

    Ok(claims)
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
    use jsonwebtoken::{encode, EncodingKey, Header};

    const SECRET: &str = "test-secret-key-256-bits-long!!";

    fn sign(claims: &TokenClaims, secret: &str) -> String {
        let key = EncodingKey::from_secret(secret.as_bytes());
        encode(&Header::new(Algorithm::HS256), claims, &key).unwrap()
    }

    fn claims(sub: &str) -> TokenClaims {
        let now = chrono::Utc::now().timestamp() as u64;
        TokenClaims {
            sub: sub.into(),
            exp: now + 3600,
            iat: now,
            iss: Some("test-issuer".into()),
            aud: Some(serde_json::json!("test-audience")),
            name: Some("Steve".into()),
        }
    }

    fn config() -> AuthConfig {
        AuthConfig {
            secret: Some(SECRET.into()),
            ..Default::default()
        }
    }

    #[test]
    fn test_valid_token() {
        let token = sign(&claims("user123"), SECRET);
        let result = validate_token(&token, &config()).unwrap();
        assert_eq!(result.sub, "user123");
        assert_eq!(result.name.as_deref(), Some("Steve"));
    }

    #[test]
    fn test_expired_token_rejected() {
        let mut c = claims("user123");
        c.exp = 1;
        let token = sign(&c, SECRET);
        assert!(matches!(validate_token(&token, &config()), Err(AuthError::Expired)));
    }

    #[test]
    fn test_skip_expiry() {
        let mut c = claims("user123");
        c.exp = 1;
        let token = sign(&c, SECRET);
        let config = AuthConfig { skip_expiry: true, ..config() };
        assert!(validate_token(&token, &config).is_ok());
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let token = sign(&claims("user123"), "some-other-secret-entirely!!");
        assert!(matches!(validate_token(&token, &config()), Err(AuthError::InvalidSignature)));
    }

    #[test]
    fn test_missing_sub_rejected() {
        let token = sign(&claims(""), SECRET);
        assert!(matches!(validate_token(&token, &config()), Err(AuthError::MissingClaim(_))));
    }

    #[test]
    fn test_issuer_and_audience() {
        let token = sign(&claims("user123"), SECRET);

        let wrong_issuer = AuthConfig { issuer: Some("elsewhere".into()), ..config() };
        assert!(matches!(validate_token(&token, &wrong_issuer), Err(AuthError::InvalidIssuer)));

        let wrong_audience = AuthConfig { audience: Some("elsewhere".into()), ..config() };
        assert!(matches!(validate_token(&token, &wrong_audience), Err(AuthError::InvalidAudience)));

        let matching = AuthConfig {
            issuer: Some("test-issuer".into()),
            audience: Some("test-audience".into()),
            ..config()
        };
        assert!(validate_token(&token, &matching).is_ok());
    }

    #[test]
    fn test_garbage_token() {
        assert!(matches!(validate_token("not-a-jwt", &config()), Err(AuthError::InvalidFormat)));
    }

    #[test]
    fn test_not_configured() {
        let result = validate_token("some.jwt.token", &AuthConfig::default());
        assert!(matches!(result, Err(AuthError::NotConfigured)));
    }

    #[test]
    fn test_session_id_is_stable_per_subject() {
        assert_eq!(claims("user123").session_id(), claims("user123").session_id());
        assert_ne!(claims("user123").session_id(), claims("user456").session_id());
    }
}
