//! Connection Authentication
//!
//! Gates every connection on a bearer token passed as the `token` query
//! parameter of the WebSocket upgrade request. Token verification is
//! pluggable; the bundled [`JwtValidator`] validates JWTs from an external
//! auth provider. The server does NOT issue tokens.

use std::collections::BTreeMap;
use std::sync::Arc;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_tungstenite::tungstenite::http::Uri;
use tracing::{debug, warn};
use url::form_urlencoded;

/// Query parameter carrying the bearer token.
pub const TOKEN_PARAM: &str = "token";

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

/// Standard JWT claims we expect from auth providers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenClaims {
    /// Subject - usually the user ID from the auth provider.
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
}

/// Authentication errors.
#[derive(Debug, Error)]
pub enum AuthError {
    /// No token in the upgrade request.
    #[error("no token supplied")]
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
    /// Token rejected by a custom validator.
    #[error("token rejected: {0}")]
    Rejected(String),
    /// JWT decoding error.
    #[error("decode error: {0}")]
    DecodeError(String),
}

impl From<jsonwebtoken::errors::Error> for AuthError {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        use jsonwebtoken::errors::ErrorKind;
        match err.kind() {
            ErrorKind::ExpiredSignature => Self::Expired,
            ErrorKind::InvalidSignature => Self::InvalidSignature,
            ErrorKind::InvalidIssuer => Self::InvalidIssuer,
            ErrorKind::InvalidAudience => Self::InvalidAudience,
            ErrorKind::InvalidToken | ErrorKind::Base64(_) => Self::InvalidFormat,
            _ => Self::DecodeError(err.to_string()),
        }
    }
}

// =============================================================================
// TOKEN VALIDATORS
// =============================================================================

/// Decides whether a bearer token is acceptable.
pub trait TokenValidator: Send + Sync {
    /// Check a token. Any error means the token is rejected.
    fn validate(&self, token: &str) -> Result<(), AuthError>;

    /// Boolean form of [`TokenValidator::validate`].
    fn is_valid(&self, token: &str) -> bool {
        self.validate(token).is_ok()
    }
}

/// JWT validator.
///
/// The decoding key and validation rules are derived from [`AuthConfig`]
/// once, so a malformed public key fails at startup rather than on every
/// connection. Without a configured key every token is rejected with
/// [`AuthError::NotConfigured`].
#[derive(Clone)]
pub struct JwtValidator {
    key: Option<DecodingKey>,
    rules: Validation,
}

impl JwtValidator {
    /// Build a validator from config.
    pub fn new(config: &AuthConfig) -> Result<Self, AuthError> {
        let (key, algorithm) = match (&config.public_key_pem, &config.secret) {
            (Some(pem), _) => {
                let key = DecodingKey::from_rsa_pem(pem.as_bytes())
                    .map_err(|e| AuthError::DecodeError(format!("invalid public key: {}", e)))?;
                (Some(key), Algorithm::RS256)
            }
            (None, Some(secret)) => (Some(DecodingKey::from_secret(secret.as_bytes())), Algorithm::HS256),
            (None, None) => (None, Algorithm::HS256),
        };

        Ok(Self {
            key,
            rules: validation_rules(config, algorithm),
        })
    }

    /// Decode a token and return its claims.
    pub fn claims(&self, token: &str) -> Result<TokenClaims, AuthError> {
        let key = self.key.as_ref().ok_or(AuthError::NotConfigured)?;
        let claims = decode::<TokenClaims>(token, key, &self.rules)?.claims;

        if claims.sub.is_empty() {
            return Err(AuthError::MissingClaim("sub".into()));
        }
        Ok(claims)
    }
}

/// Issuer, audience and expiry rules for `algorithm`.
fn validation_rules(config: &AuthConfig, algorithm: Algorithm) -> Validation {
    let mut rules = Validation::new(algorithm);
    rules.required_spec_claims.clear();
    // Expiry is exact; a token is dead the second after `exp`.
    rules.leeway = 0;
    rules.validate_exp = !config.skip_expiry;

    if let Some(issuer) = &config.issuer {
        rules.set_issuer(&[issuer]);
    }
    match &config.audience {
        Some(audience) => rules.set_audience(&[audience]),
        None => rules.validate_aud = false,
    }
    rules
}

impl TokenValidator for JwtValidator {
    fn validate(&self, token: &str) -> Result<(), AuthError> {
        let claims = self.claims(token)?;
        debug!(sub = %claims.sub, "Token accepted");
        Ok(())
    }
}

impl std::fmt::Debug for JwtValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JwtValidator")
            .field("configured", &self.key.is_some())
            .field("algorithms", &self.rules.algorithms)
            .finish()
    }
}

// =============================================================================
// UPGRADE PARAMETERS
// =============================================================================

/// Query parameters of the upgrade request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpgradeParams {
    params: BTreeMap<String, String>,
}

impl UpgradeParams {
    /// Parse a raw query string (`a=1&b=2`). Keys and values are
    /// percent-decoded; the first occurrence of a key wins.
    pub fn from_query(query: Option<&str>) -> Self {
        let mut params = BTreeMap::new();
        for (key, value) in form_urlencoded::parse(query.unwrap_or_default().as_bytes()) {
            params
                .entry(key.into_owned())
                .or_insert_with(|| value.into_owned());
        }
        Self { params }
    }

    /// Parameters of an upgrade request URI.
    pub fn from_uri(uri: &Uri) -> Self {
        Self::from_query(uri.query())
    }

    /// Parameters carrying only a token.
    pub fn with_token(token: impl Into<String>) -> Self {
        let mut params = BTreeMap::new();
        params.insert(TOKEN_PARAM.to_string(), token.into());
        Self { params }
    }

    /// A parameter's value.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }

    /// The bearer token, if present and non-empty.
    pub fn token(&self) -> Option<&str> {
        self.get(TOKEN_PARAM).filter(|t| !t.is_empty())
    }
}

// =============================================================================
// SESSION AUTHENTICATOR
// =============================================================================

/// Authentication gate run once per connection.
#[derive(Clone)]
pub struct SessionAuthenticator {
    validator: Arc<dyn TokenValidator>,
}

impl SessionAuthenticator {
    /// Create an authenticator around a validator.
    pub fn new(validator: Arc<dyn TokenValidator>) -> Self {
        Self { validator }
    }

    /// Check a token, returning the reason on rejection.
    pub fn check(&self, params: &UpgradeParams) -> Result<(), AuthError> {
        let token = params.token().ok_or(AuthError::MissingToken)?;
        self.validator.validate(token)
    }

    /// Whether the connection may proceed.
    pub fn authenticate(&self, params: &UpgradeParams) -> bool {
        match self.check(params) {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "Connection failed authentication");
                false
            }
        }
    }
}

impl std::fmt::Debug for SessionAuthenticator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionAuthenticator").finish_non_exhaustive()
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use std::time::{SystemTime, UNIX_EPOCH};

    const SECRET: &str = "test-secret-key-256-bits-long!!";

    fn create_test_token(claims: &TokenClaims, secret: &str) -> String {
        let header = Header::new(Algorithm::HS256);
        let key = EncodingKey::from_secret(secret.as_bytes());
        encode(&header, claims, &key).unwrap()
    }

    fn test_claims() -> TokenClaims {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs();
        TokenClaims {
            sub: "user123".into(),
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

    fn claims_with(config: &AuthConfig, token: &str) -> Result<TokenClaims, AuthError> {
        JwtValidator::new(config).unwrap().claims(token)
    }

    #[test]
    fn test_valid_token_validation() {
        let token = create_test_token(&test_claims(), SECRET);
        let result = claims_with(&secret_config(), &token);
        assert_eq!(result.unwrap().sub, "user123");
    }

    #[test]
    fn test_expired_token_rejected() {
        let mut claims = test_claims();
        claims.exp = 1;
        let token = create_test_token(&claims, SECRET);

        let result = claims_with(&secret_config(), &token);
        assert!(matches!(result, Err(AuthError::Expired)));
    }

    #[test]
    fn test_expiry_has_no_leeway() {
        let mut claims = test_claims();
        claims.exp -= 3600 + 5;
        let token = create_test_token(&claims, SECRET);

        let result = claims_with(&secret_config(), &token);
        assert!(matches!(result, Err(AuthError::Expired)));
    }

    #[test]
    fn test_skip_expiry() {
        let mut claims = test_claims();
        claims.exp = 1;
        let token = create_test_token(&claims, SECRET);
        let config = AuthConfig {
            skip_expiry: true,
            ..secret_config()
        };

        assert!(claims_with(&config, &token).is_ok());
    }

    #[test]
    fn test_invalid_signature_rejected() {
        let token = create_test_token(&test_claims(), "correct-secret-key-here!!!!!");
        let config = AuthConfig {
            secret: Some("wrong-secret-key-here!!!!!!".into()),
            ..Default::default()
        };

        let result = claims_with(&config, &token);
        assert!(matches!(result, Err(AuthError::InvalidSignature)));
    }

    #[test]
    fn test_missing_sub_rejected() {
        let mut claims = test_claims();
        claims.sub = String::new();
        let token = create_test_token(&claims, SECRET);

        let result = claims_with(&secret_config(), &token);
        assert!(matches!(result, Err(AuthError::MissingClaim(_))));
    }

    #[test]
    fn test_issuer_and_audience_rules() {
        let token = create_test_token(&test_claims(), SECRET);

        let wrong_issuer = AuthConfig {
            issuer: Some("wrong-issuer".into()),
            ..secret_config()
        };
        assert!(matches!(claims_with(&wrong_issuer, &token), Err(AuthError::InvalidIssuer)));

        let wrong_audience = AuthConfig {
            audience: Some("someone-else".into()),
            ..secret_config()
        };
        assert!(matches!(claims_with(&wrong_audience, &token), Err(AuthError::InvalidAudience)));

        let matching = AuthConfig {
            issuer: Some("test-issuer".into()),
            audience: Some("test-audience".into()),
            ..secret_config()
        };
        assert!(claims_with(&matching, &token).is_ok());
    }

    #[test]
    fn test_not_configured_error() {
        let result = claims_with(&AuthConfig::default(), "some.jwt.token");
        assert!(matches!(result, Err(AuthError::NotConfigured)));
    }

    #[test]
    fn test_bad_public_key_fails_at_construction() {
        let config = AuthConfig {
            public_key_pem: Some("not a pem".into()),
            ..Default::default()
        };
        assert!(matches!(JwtValidator::new(&config), Err(AuthError::DecodeError(_))));
    }

    #[test]
    fn test_garbage_token_rejected() {
        let result = claims_with(&secret_config(), "not-a-jwt");
        assert!(result.is_err());
    }

    #[test]
    fn test_upgrade_params_parsing() {
        let params = UpgradeParams::from_query(Some("foo=bar&token=abc.def&token=second&flag"));
        assert_eq!(params.token(), Some("abc.def"));
        assert_eq!(params.get("foo"), Some("bar"));
        assert_eq!(params.get("flag"), Some(""));

        assert_eq!(UpgradeParams::from_query(None).token(), None);
        assert_eq!(UpgradeParams::from_query(Some("token=")).token(), None);
    }

    #[test]
    fn test_upgrade_params_percent_decoded() {
        let params = UpgradeParams::from_query(Some("token=abc%2Bdef%3D%3D&na%6De=a%20b"));
        assert_eq!(params.token(), Some("abc+def=="));
        assert_eq!(params.get("name"), Some("a b"));
    }

    #[test]
    fn test_upgrade_params_from_uri() {
        let uri: Uri = "/ws?token=xyz".parse().unwrap();
        assert_eq!(UpgradeParams::from_uri(&uri).token(), Some("xyz"));

        let uri: Uri = "/ws".parse().unwrap();
        assert_eq!(UpgradeParams::from_uri(&uri).token(), None);
    }

    #[test]
    fn test_authenticator_with_jwt() {
        let validator = JwtValidator::new(&secret_config()).unwrap();
        let auth = SessionAuthenticator::new(Arc::new(validator));
        let token = create_test_token(&test_claims(), SECRET);

        assert!(auth.authenticate(&UpgradeParams::with_token(token)));
        assert!(!auth.authenticate(&UpgradeParams::with_token("forged")));
        assert!(!auth.authenticate(&UpgradeParams::default()));
        assert!(matches!(
            auth.check(&UpgradeParams::default()),
            Err(AuthError::MissingToken)
        ));
    }
}
