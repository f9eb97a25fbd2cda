//! Client identity resolution
//!
//! A request identifies its principal with, in order of preference:
//! 1. an `Authorization: Bearer <token>` header
//! 2. a client certificate subject (DN) listed in the allow-list
//! 3. nothing, which is only allowed from loopback and yields `localhost`

pub mod dn;
pub mod token;

pub use token::{Ed25519Verifier, TokenClaims, TokenError, TokenPolicy, TokenVerifier, ANY_AUDIENCE, REQUIRED_SCOPE};

use std::net::IpAddr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::warn;
use userpub_protocol::LOCAL_PRINCIPAL;

use crate::config::CachedConfig;

/// Identity rejections. The display text is what the client sees; details
/// worth logging travel in the variant.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum IdentityError {
    #[error("Failure to parse Authorization")]
    MalformedAuthorization,

    #[error("Unrecognized authorization scheme")]
    UnsupportedScheme(String),

    #[error(transparent)]
    Token(#[from] TokenError),

    #[error("Malformed DN")]
    MalformedDn,

    #[error("Unrecognized DN")]
    UnrecognizedDn(String),

    #[error("Token or client cert required")]
    CredentialsRequired,
}

/// What the transport knows about the caller.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub remote_addr: IpAddr,
    /// Raw `Authorization` header.
    pub authorization: Option<String>,
    /// Verified client certificate subject.
    pub client_dn: Option<String>,
}

/// Turns credentials into a principal name.
#[derive(Clone)]
pub struct IdentityResolver {
    verifier: Arc<dyn TokenVerifier>,
    hostname: String,
}

impl IdentityResolver {
    pub fn new(verifier: Arc<dyn TokenVerifier>, hostname: impl Into<String>) -> Self {
        Self {
            verifier,
            hostname: hostname.into(),
        }
    }

    pub fn resolve(
        &self,
        credentials: &Credentials,
        config: &CachedConfig,
        now: DateTime<Utc>,
    ) -> Result<String, IdentityError> {
        let ip = credentials.remote_addr;

        if let Some(header) = &credentials.authorization {
            let token = bearer_token(header).map_err(|e| {
                warn!(%ip, "rejecting Authorization header: {:?}", e);
                e
            })?;
            let policy = TokenPolicy::new(&config.issuers, &config.snapshot.audiences, &self.hostname, now);
            let claims = self.verifier.verify(token, &policy).map_err(|e| {
                warn!(%ip, "token rejected: {:?}", e);
                e
            })?;
            if !claims.has_scope(REQUIRED_SCOPE) {
                warn!(%ip, principal = %claims.sub, "compute.create scope missing from token");
                return Err(TokenError::MissingScope.into());
            }
            return Ok(claims.sub);
        }

        if let Some(subject) = &credentials.client_dn {
            return dn::resolve(subject, &config.allowlist).map_err(|e| {
                warn!(%ip, "access denied for {}: {:?}", subject, e);
                e
            });
        }

        if ip.is_loopback() {
            Ok(LOCAL_PRINCIPAL.to_string())
        } else {
            warn!(%ip, "no token or client cert, access denied");
            Err(IdentityError::CredentialsRequired)
        }
    }
}

/// Token from a `Bearer` Authorization header (scheme case-insensitive).
pub fn bearer_token(header: &str) -> Result<&str, IdentityError> {
    let (scheme, token) = header
        .split_once(' ')
        .ok_or(IdentityError::MalformedAuthorization)?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return Err(IdentityError::UnsupportedScheme(scheme.to_string()));
    }
    Ok(token.trim())
}

#[cfg(test)]
mod tests {
    use super::token::testing::{issuer_list, mint};
    use super::*;
    use crate::config::AllowList;
    use ed25519_dalek::SigningKey;
    use rand::rngs::OsRng;
    use serde_json::json;
    use std::net::Ipv4Addr;
    use userpub_protocol::ConfigSnapshot;

    const ISSUER: &str = "https://issuer.example";

    fn resolver() -> IdentityResolver {
        IdentityResolver::new(Arc::new(Ed25519Verifier), "pub.example.org")
    }

    fn credentials(ip: [u8; 4]) -> Credentials {
        Credentials {
            remote_addr: IpAddr::V4(Ipv4Addr::from(ip)),
            authorization: None,
            client_dn: None,
        }
    }

    fn config_with(key: &SigningKey) -> CachedConfig {
        CachedConfig {
            snapshot: Arc::new(ConfigSnapshot::default()),
            allowlist: Arc::new(AllowList::parse("\"/DC=org/CN=UID:carol/CN=Carol\" carol\n")),
            issuers: Arc::new(issuer_list(ISSUER, key)),
        }
    }

    #[test]
    fn test_bearer_scheme_case_insensitive() {
        assert_eq!(bearer_token("bEaReR abc.def.ghi ").unwrap(), "abc.def.ghi");
        assert_eq!(bearer_token("Basic xyz").unwrap_err().to_string(), "Unrecognized authorization scheme");
        assert_eq!(bearer_token("Bearer").unwrap_err(), IdentityError::MalformedAuthorization);
    }

    #[test]
    fn test_token_principal_is_sub() {
        let key = SigningKey::generate(&mut OsRng);
        let token = mint(
            &key,
            &json!({"iss": ISSUER, "sub": "dave", "aud": ANY_AUDIENCE, "scope": "compute.create"}),
        );
        let mut creds = credentials([10, 0, 0, 1]);
        creds.authorization = Some(format!("Bearer {}", token));

        let principal = resolver().resolve(&creds, &config_with(&key), Utc::now()).unwrap();
        assert_eq!(principal, "dave");
    }

    #[test]
    fn test_token_without_scope_rejected() {
        let key = SigningKey::generate(&mut OsRng);
        let token = mint(
            &key,
            &json!({"iss": ISSUER, "sub": "dave", "aud": ANY_AUDIENCE, "scope": "storage.read:/"}),
        );
        let mut creds = credentials([10, 0, 0, 1]);
        creds.authorization = Some(format!("Bearer {}", token));

        let err = resolver().resolve(&creds, &config_with(&key), Utc::now()).unwrap_err();
        assert_eq!(err, IdentityError::Token(TokenError::MissingScope));
        assert_eq!(err.to_string(), "compute.create scope missing from token");
    }

    #[test]
    fn test_certificate_principal() {
        let key = SigningKey::generate(&mut OsRng);
        let mut creds = credentials([10, 0, 0, 1]);
        creds.client_dn = Some("/DC=org/CN=UID:carol/CN=Carol/CN=99".to_string());

        let principal = resolver().resolve(&creds, &config_with(&key), Utc::now()).unwrap();
        assert_eq!(principal, "carol");
    }

    #[test]
    fn test_token_takes_precedence_over_dn() {
        let key = SigningKey::generate(&mut OsRng);
        let mut creds = credentials([10, 0, 0, 1]);
        creds.client_dn = Some("/DC=org/CN=UID:carol/CN=Carol".to_string());
        creds.authorization = Some("Negotiate abc".to_string());

        let err = resolver().resolve(&creds, &config_with(&key), Utc::now()).unwrap_err();
        assert!(matches!(err, IdentityError::UnsupportedScheme(_)));
    }

    #[test]
    fn test_anonymous_only_from_loopback() {
        let key = SigningKey::generate(&mut OsRng);
        let config = config_with(&key);

        let local = resolver().resolve(&credentials([127, 0, 0, 1]), &config, Utc::now()).unwrap();
        assert_eq!(local, LOCAL_PRINCIPAL);

        let remote = resolver()
            .resolve(&credentials([192, 0, 2, 7]), &config, Utc::now())
            .unwrap_err();
        assert_eq!(remote, IdentityError::CredentialsRequired);
    }
}
