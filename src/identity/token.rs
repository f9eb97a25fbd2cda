//! Bearer token verification.
//!
//! Tokens are compact JWS (`header.payload.signature`, base64url without
//! padding). The shipped verifier accepts `EdDSA` (Ed25519) signatures made
//! with the public key listed for the token's issuer in the issuers file.

use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine;
use chrono::{DateTime, Utc};
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use serde::Deserialize;
use thiserror::Error;

use crate::config::IssuerList;

/// Audience every token may carry regardless of configuration.
pub const ANY_AUDIENCE: &str = "https://wlcg.cern.ch/jwt/v1/any";

/// Scope a token needs to publish.
pub const REQUIRED_SCOPE: &str = "compute.create";

/// Token rejections. The display text is what the client sees.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TokenError {
    #[error("Untrusted token issuer")]
    UntrustedIssuer(String),

    #[error("compute.create scope missing from token")]
    MissingScope,

    #[error("Error decoding token: {0}")]
    Malformed(String),

    #[error("Error decoding token: unsupported algorithm {0}")]
    UnsupportedAlgorithm(String),

    #[error("Error decoding token: no public key for issuer {0}")]
    NoIssuerKey(String),

    #[error("Error decoding token: invalid public key for issuer {0}")]
    BadIssuerKey(String),

    #[error("Error decoding token: signature verification failed")]
    BadSignature,

    #[error("Error decoding token: invalid audience")]
    AudienceMismatch,

    #[error("Error decoding token: token expired")]
    Expired,
}

/// `aud` may be a single string or a list.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum Audience {
    One(String),
    Many(Vec<String>),
}

impl Audience {
    fn values(&self) -> Vec<&str> {
        match self {
            Self::One(aud) => vec![aud.as_str()],
            Self::Many(auds) => auds.iter().map(String::as_str).collect(),
        }
    }
}

/// Claims the service reads.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TokenClaims {
    pub iss: String,
    pub sub: String,
    #[serde(default)]
    pub aud: Option<Audience>,
    /// Space-separated scope list.
    #[serde(default)]
    pub scope: String,
    #[serde(default)]
    pub exp: Option<i64>,
}

impl TokenClaims {
    pub fn has_scope(&self, wanted: &str) -> bool {
        self.scope.split(' ').any(|s| s == wanted)
    }
}

/// What a token is checked against.
#[derive(Debug, Clone)]
pub struct TokenPolicy<'a> {
    pub issuers: &'a IssuerList,
    /// Accepted audiences; [`ANY_AUDIENCE`] is always accepted on top.
    pub audiences: Vec<String>,
    pub now: DateTime<Utc>,
}

impl<'a> TokenPolicy<'a> {
    /// The configured audiences, or `https://<hostname>` when none are set.
    pub fn new(issuers: &'a IssuerList, configured: &[String], hostname: &str, now: DateTime<Utc>) -> Self {
        let audiences = if configured.is_empty() {
            vec![format!("https://{}", hostname)]
        } else {
            configured.to_vec()
        };
        Self {
            issuers,
            audiences,
            now,
        }
    }

    fn accepts_audience(&self, aud: &str) -> bool {
        aud == ANY_AUDIENCE || self.audiences.iter().any(|a| a == aud)
    }
}

/// Checks a token's signature, issuer, audience and expiry.
pub trait TokenVerifier: Send + Sync {
    fn verify(&self, token: &str, policy: &TokenPolicy<'_>) -> Result<TokenClaims, TokenError>;
}

#[derive(Debug, Deserialize)]
struct Header {
    alg: String,
}

/// Ed25519 compact-JWS verifier.
#[derive(Debug, Default, Clone, Copy)]
pub struct Ed25519Verifier;

impl TokenVerifier for Ed25519Verifier {
    fn verify(&self, token: &str, policy: &TokenPolicy<'_>) -> Result<TokenClaims, TokenError> {
        let mut parts = token.split('.');
        let (Some(header_b64), Some(payload_b64), Some(signature_b64), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(TokenError::Malformed("expected three dot-separated parts".into()));
        };

        let header: Header = decode_json(header_b64, "header")?;
        if header.alg != "EdDSA" {
            return Err(TokenError::UnsupportedAlgorithm(header.alg));
        }
        let claims: TokenClaims = decode_json(payload_b64, "payload")?;

        if !policy.issuers.is_trusted(&claims.iss) {
            return Err(TokenError::UntrustedIssuer(claims.iss));
        }
        let key = issuer_key(policy.issuers, &claims.iss)?;

        let signature_bytes = URL_SAFE_NO_PAD
            .decode(signature_b64)
            .map_err(|e| TokenError::Malformed(format!("signature: {}", e)))?;
        let signature = Signature::from_slice(&signature_bytes).map_err(|_| TokenError::BadSignature)?;
        let signed = &token[..header_b64.len() + 1 + payload_b64.len()];
        key.verify(signed.as_bytes(), &signature)
            .map_err(|_| TokenError::BadSignature)?;

        let audience_ok = claims
            .aud
            .as_ref()
            .map(|aud| aud.values().into_iter().any(|a| policy.accepts_audience(a)))
            .unwrap_or(false);
        if !audience_ok {
            return Err(TokenError::AudienceMismatch);
        }

        if let Some(exp) = claims.exp {
            if exp <= policy.now.timestamp() {
                return Err(TokenError::Expired);
            }
        }

        Ok(claims)
    }
}

fn decode_json<T: for<'de> Deserialize<'de>>(part: &str, what: &str) -> Result<T, TokenError> {
    let bytes = URL_SAFE_NO_PAD
        .decode(part)
        .map_err(|e| TokenError::Malformed(format!("{}: {}", what, e)))?;
    serde_json::from_slice(&bytes).map_err(|e| TokenError::Malformed(format!("{}: {}", what, e)))
}

fn issuer_key(issuers: &IssuerList, issuer: &str) -> Result<VerifyingKey, TokenError> {
    let encoded = issuers
        .key(issuer)
        .ok_or_else(|| TokenError::NoIssuerKey(issuer.to_string()))?;
    let bytes: [u8; 32] = STANDARD
        .decode(encoded)
        .ok()
        .and_then(|bytes| bytes.try_into().ok())
        .ok_or_else(|| TokenError::BadIssuerKey(issuer.to_string()))?;
    VerifyingKey::from_bytes(&bytes).map_err(|_| TokenError::BadIssuerKey(issuer.to_string()))
}
