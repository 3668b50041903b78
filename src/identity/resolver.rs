//! Key resolvers.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

/// Cookie carrying the signed identity token.
pub const TOKEN_COOKIE: &str = "JWT_TOKEN";

/// Derives an admission key from request identity evidence.
pub trait KeyResolver: Send + Sync {
    /// Resolve `evidence` to a key. Absent or unusable evidence yields the
    /// resolver's default key.
    fn resolve_key(&self, evidence: Option<&str>) -> String;
}

/// Claims read from a verified identity token.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    /// Subject the token was issued to
    #[serde(default)]
    pub sub: Option<String>,
}

impl Claims {
    /// Decode a verified token payload.
    pub fn from_json(payload: &str) -> Result<Self, VerifyError> {
        serde_json::from_str(payload).map_err(|e| VerifyError::Malformed(e.to_string()))
    }
}

/// Why a token could not be verified.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum VerifyError {
    #[error("malformed token: {0}")]
    Malformed(String),
    #[error("invalid signature")]
    InvalidSignature,
    #[error("token expired")]
    Expired,
}

/// Verifies a signed identity token and returns its claims.
///
/// Signature checking is delegated to whatever token library the embedding
/// service uses.
pub trait TokenVerifier: Send + Sync {
    fn verify(&self, token: &str) -> Result<Claims, VerifyError>;
}

impl<F> TokenVerifier for F
where
    F: Fn(&str) -> Result<Claims, VerifyError> + Send + Sync,
{
    fn verify(&self, token: &str) -> Result<Claims, VerifyError> {
        self(token)
    }
}

/// Resolves keys from the `JWT_TOKEN` cookie of a `Cookie` header.
///
/// The key is the verified token's subject. A missing header, missing cookie,
/// failed verification, or token without a subject all yield the default key.
pub struct CookieKeyResolver<V> {
    verifier: V,
    default_key: String,
}

impl<V: TokenVerifier> CookieKeyResolver<V> {
    pub fn new(verifier: V, default_key: impl Into<String>) -> Self {
        Self {
            verifier,
            default_key: default_key.into(),
        }
    }

    fn subject(&self, cookie_header: &str) -> Option<String> {
        let token = cookie_value(cookie_header, TOKEN_COOKIE)?;
        match self.verifier.verify(token) {
            Ok(claims) => claims.sub.filter(|sub| !sub.trim().is_empty()),
            Err(e) => {
                info!(error = %e, "Identity token rejected, using default key");
                None
            }
        }
    }
}

impl<V: TokenVerifier> KeyResolver for CookieKeyResolver<V> {
    fn resolve_key(&self, evidence: Option<&str>) -> String {
        match evidence.and_then(|header| self.subject(header)) {
            Some(subject) => subject,
            None => {
                debug!(default_key = %self.default_key, "No usable identity");
                self.default_key.clone()
            }
        }
    }
}

/// Uses the evidence itself as the key, for identities already authenticated
/// upstream. Blank evidence yields the default key.
#[derive(Debug, Clone)]
pub struct SubjectKeyResolver {
    default_key: String,
}

impl SubjectKeyResolver {
    pub fn new(default_key: impl Into<String>) -> Self {
        Self {
            default_key: default_key.into(),
        }
    }
}

impl KeyResolver for SubjectKeyResolver {
    fn resolve_key(&self, evidence: Option<&str>) -> String {
        match evidence.map(str::trim) {
            Some(subject) if !subject.is_empty() => subject.to_string(),
            _ => self.default_key.clone(),
        }
    }
}

/// Find `name` in a `Cookie` header (`a=1; b=2`).
fn cookie_value<'a>(header: &'a str, name: &str) -> Option<&'a str> {
    header
        .split(';')
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(key, _)| *key == name)
        .map(|(_, value)| value.trim().trim_matches('"'))
        .filter(|value| !value.is_empty())
}
