//! Session tokens: HS256 JWTs carrying identity, role and store scope.

use std::fmt;
use std::str::FromStr;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{Duration, Utc};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use crate::config::{AppConfig, SigningSecret};
use crate::error::{AuthError, ConfigError};

/// Header `alg` values a token may carry.
pub const ALLOWED_ALGORITHMS: &[&str] = &["HS256"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Manager,
    Staff,
}

impl Role {
    /// Roles allowed to perform destructive or store-level operations.
    pub fn is_privileged(self) -> bool {
        matches!(self, Role::Admin | Role::Manager)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Manager => "manager",
            Role::Staff => "staff",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "admin" => Ok(Role::Admin),
            "manager" => Ok(Role::Manager),
            "staff" => Ok(Role::Staff),
            other => Err(format!("unknown role {other:?}")),
        }
    }
}

/// Who a token is issued for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSubject {
    pub user_id: u64,
    pub name: String,
    pub role: Role,
    pub store_id: u64,
    pub store_name: String,
}

/// Claims embedded in every session token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionClaims {
    /// User id.
    pub sub: u64,
    pub name: String,
    pub role: Role,
    pub store_id: u64,
    pub store_name: String,
    /// Issued-at (Unix seconds).
    pub iat: i64,
    /// Expiry (Unix seconds).
    pub exp: i64,
}

impl SessionClaims {
    pub fn subject(&self) -> SessionSubject {
        SessionSubject {
            user_id: self.sub,
            name: self.name.clone(),
            role: self.role,
            store_id: self.store_id,
            store_name: self.store_name.clone(),
        }
    }
}

#[derive(Clone)]
pub struct TokenIssuer {
    key: EncodingKey,
    ttl: Duration,
}

impl TokenIssuer {
    pub fn new(secret: &SigningSecret, ttl: Duration) -> Result<Self, ConfigError> {
        if ttl <= Duration::zero() {
            return Err(ConfigError::Invalid {
                key: "TOKEN_TTL_HOURS",
                value: ttl.num_hours().to_string(),
            });
        }
        Ok(Self {
            key: EncodingKey::from_secret(secret.as_bytes()),
            ttl,
        })
    }

    pub fn from_config(config: &AppConfig) -> Result<Self, ConfigError> {
        Self::new(&config.jwt_secret, Duration::hours(config.token_ttl_hours))
    }

    /// Sign a token for `subject`, valid from now for the configured window.
    pub fn issue(&self, subject: &SessionSubject) -> Result<String, AuthError> {
        self.issue_at(subject, Utc::now().timestamp())
    }

    pub(crate) fn issue_at(&self, subject: &SessionSubject, now: i64) -> Result<String, AuthError> {
        let claims = SessionClaims {
            sub: subject.user_id,
            name: subject.name.clone(),
            role: subject.role,
            store_id: subject.store_id,
            store_name: subject.store_name.clone(),
            iat: now,
            exp: now + self.ttl.num_seconds(),
        };
        encode(&Header::new(Algorithm::HS256), &claims, &self.key)
            .map_err(|e| AuthError::Signing(e.to_string()))
    }
}

#[derive(Clone)]
pub struct TokenValidator {
    key: DecodingKey,
    validation: Validation,
}

impl TokenValidator {
    pub fn new(secret: &SigningSecret) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        Self {
            key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(&config.jwt_secret)
    }

    /// Verify algorithm, signature and expiry, returning the typed claims.
    pub fn validate(&self, token: &str) -> Result<SessionClaims, AuthError> {
        self.validate_at(token, Utc::now().timestamp())
    }

    pub(crate) fn validate_at(&self, token: &str, now: i64) -> Result<SessionClaims, AuthError> {
        check_algorithm(token)?;

        let claims = decode::<SessionClaims>(token, &self.key, &self.validation)
            .map(|data| data.claims)
            .map_err(|e| match e.kind() {
                ErrorKind::ExpiredSignature => AuthError::Expired,
                ErrorKind::InvalidAlgorithm => AuthError::UnsupportedAlgorithm,
                _ => AuthError::BadSignature,
            })?;

        if claims.exp <= now {
            return Err(AuthError::Expired);
        }
        Ok(claims)
    }
}

#[derive(Deserialize)]
struct RawHeader {
    alg: String,
}

/// Reject anything outside the allow-list before touching the signature.
fn check_algorithm(token: &str) -> Result<(), AuthError> {
    let mut parts = token.split('.');
    let (Some(header), Some(_), Some(_), None) = (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(AuthError::BadSignature);
    };
    let bytes = URL_SAFE_NO_PAD
        .decode(header)
        .map_err(|_| AuthError::BadSignature)?;
    let header: RawHeader = serde_json::from_slice(&bytes).map_err(|_| AuthError::BadSignature)?;
    if ALLOWED_ALGORITHMS.contains(&header.alg.as_str()) {
        Ok(())
    } else {
        Err(AuthError::UnsupportedAlgorithm)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "test-secret-key-that-is-long-enough!!";

    fn secret() -> SigningSecret {
        SigningSecret::new(SECRET).unwrap()
    }

    fn subject() -> SessionSubject {
        SessionSubject {
            user_id: 7,
            name: "Aiko".to_string(),
            role: Role::Manager,
            store_id: 3,
            store_name: "Shibuya".to_string(),
        }
    }

    fn pair() -> (TokenIssuer, TokenValidator) {
        (
            TokenIssuer::new(&secret(), Duration::hours(24)).unwrap(),
            TokenValidator::new(&secret()),
        )
    }

    #[test]
    fn issued_token_validates_to_same_subject() {
        let (issuer, validator) = pair();
        let token = issuer.issue(&subject()).unwrap();
        let claims = validator.validate(&token).unwrap();
        assert_eq!(claims.subject(), subject());
        assert_eq!(claims.exp - claims.iat, 24 * 3600);
        assert!(claims.exp > Utc::now().timestamp());
    }

    #[test]
    fn expired_token_is_rejected() {
        let (issuer, validator) = pair();
        let long_ago = Utc::now().timestamp() - 25 * 3600;
        let token = issuer.issue_at(&subject(), long_ago).unwrap();
        assert_eq!(validator.validate(&token), Err(AuthError::Expired));
    }

    #[test]
    fn expiry_must_be_strictly_in_the_future() {
        let (issuer, validator) = pair();
        let token = issuer.issue(&subject()).unwrap();
        let exp = validator.validate(&token).unwrap().exp;
        assert_eq!(validator.validate_at(&token, exp), Err(AuthError::Expired));
        assert!(validator.validate_at(&token, exp - 1).is_ok());
    }

    #[test]
    fn other_secret_fails_signature() {
        let (issuer, _) = pair();
        let other = TokenValidator::new(
            &SigningSecret::new("a-completely-different-secret-value").unwrap(),
        );
        let token = issuer.issue(&subject()).unwrap();
        assert_eq!(other.validate(&token), Err(AuthError::BadSignature));
    }

    #[test]
    fn other_hmac_algorithm_is_unsupported() {
        let (_, validator) = pair();
        let now = Utc::now().timestamp();
        let claims = SessionClaims {
            sub: 1,
            name: "x".into(),
            role: Role::Admin,
            store_id: 1,
            store_name: "s".into(),
            iat: now,
            exp: now + 60,
        };
        let token = encode(
            &Header::new(Algorithm::HS512),
            &claims,
            &EncodingKey::from_secret(SECRET.as_bytes()),
        )
        .unwrap();
        assert_eq!(validator.validate(&token), Err(AuthError::UnsupportedAlgorithm));
    }

    #[test]
    fn unsigned_token_is_unsupported() {
        let (_, validator) = pair();
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"none","typ":"JWT"}"#);
        let exp = Utc::now().timestamp() + 600;
        let payload = URL_SAFE_NO_PAD.encode(format!(
            r#"{{"sub":1,"name":"x","role":"admin","store_id":1,"store_name":"s","iat":0,"exp":{exp}}}"#
        ));
        let token = format!("{header}.{payload}.");
        assert_eq!(validator.validate(&token), Err(AuthError::UnsupportedAlgorithm));
    }

    #[test]
    fn garbage_is_bad_signature() {
        let (_, validator) = pair();
        assert_eq!(validator.validate("not-a-jwt"), Err(AuthError::BadSignature));
        assert_eq!(validator.validate("a.b.c"), Err(AuthError::BadSignature));
    }

    #[test]
    fn non_positive_ttl_is_a_config_error() {
        assert!(TokenIssuer::new(&secret(), Duration::zero()).is_err());
    }

    #[test]
    fn privileged_roles() {
        assert!(Role::Admin.is_privileged());
        assert!(Role::Manager.is_privileged());
        assert!(!Role::Staff.is_privileged());
        assert_eq!("manager".parse::<Role>(), Ok(Role::Manager));
        assert!("owner".parse::<Role>().is_err());
    }
}
