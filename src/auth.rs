//! Request authentication gate.
//!
//! `Unauthenticated -> header present -> bearer scheme -> allowed
//! algorithm + signature -> not expired -> Authenticated`. Any failed
//! step ends the request with 401 before the protected handler runs.
//! On success the caller's [`Identity`] is placed in request extensions.

use axum::{
    extract::{Request, State},
    http::{header, HeaderMap},
    middleware::Next,
    response::Response,
};
use tracing::debug;

use crate::error::{ApiError, AuthError};
use crate::token::{Role, SessionClaims, TokenValidator};

/// Authenticated caller, as established by the gate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: u64,
    pub name: String,
    pub role: Role,
    pub store_id: u64,
}

impl From<SessionClaims> for Identity {
    fn from(claims: SessionClaims) -> Self {
        Self {
            user_id: claims.sub,
            name: claims.name,
            role: claims.role,
            store_id: claims.store_id,
        }
    }
}

impl Identity {
    /// Only admins and managers pass.
    pub fn require_privileged(&self) -> Result<(), ApiError> {
        if self.role.is_privileged() {
            Ok(())
        } else {
            Err(ApiError::Forbidden)
        }
    }

    /// Admins may act on any store; everyone else only on their own.
    pub fn require_store(&self, store_id: u64) -> Result<(), ApiError> {
        if self.role == Role::Admin || self.store_id == store_id {
            Ok(())
        } else {
            Err(ApiError::Forbidden)
        }
    }
}

/// Pull the token out of an `Authorization: Bearer <token>` header.
pub fn bearer_token(headers: &HeaderMap) -> Result<&str, AuthError> {
    let value = headers
        .get(header::AUTHORIZATION)
        .ok_or(AuthError::MissingHeader)?;
    let value = value.to_str().map_err(|_| AuthError::MalformedScheme)?;
    if value.trim().is_empty() {
        return Err(AuthError::MissingHeader);
    }
    match value.split_once(' ') {
        Some(("Bearer", token)) if !token.trim().is_empty() => Ok(token.trim()),
        _ => Err(AuthError::MalformedScheme),
    }
}

/// Run the whole gate against a header map.
pub fn authenticate(headers: &HeaderMap, validator: &TokenValidator) -> Result<Identity, AuthError> {
    let token = bearer_token(headers)?;
    validator.validate(token).map(Identity::from)
}

/// Axum middleware: authenticate, attach [`Identity`], continue.
pub async fn require_auth(
    State(validator): State<TokenValidator>,
    mut req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let identity = authenticate(req.headers(), &validator).map_err(|e| {
        debug!(error = %e, path = %req.uri().path(), "request rejected by auth gate");
        ApiError::Auth(e)
    })?;
    req.extensions_mut().insert(identity);
    Ok(next.run(req).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SigningSecret;
    use crate::token::{SessionSubject, TokenIssuer};
    use axum::http::HeaderValue;
    use chrono::Duration;

    fn secret() -> SigningSecret {
        SigningSecret::new("gate-test-secret-with-enough-bytes!!").unwrap()
    }

    fn headers(value: &str) -> HeaderMap {
        let mut map = HeaderMap::new();
        map.insert(header::AUTHORIZATION, HeaderValue::from_str(value).unwrap());
        map
    }

    #[test]
    fn missing_header() {
        let validator = TokenValidator::new(&secret());
        assert_eq!(
            authenticate(&HeaderMap::new(), &validator),
            Err(AuthError::MissingHeader)
        );
    }

    #[test]
    fn wrong_scheme() {
        let validator = TokenValidator::new(&secret());
        for value in ["Basic abc", "Bearer", "Bearer ", "bearer abc", "Token"] {
            assert_eq!(
                authenticate(&headers(value), &validator),
                Err(AuthError::MalformedScheme),
                "{value}"
            );
        }
    }

    #[test]
    fn valid_bearer_yields_identity() {
        let issuer = TokenIssuer::new(&secret(), Duration::hours(1)).unwrap();
        let validator = TokenValidator::new(&secret());
        let token = issuer
            .issue(&SessionSubject {
                user_id: 5,
                name: "Ren".into(),
                role: Role::Staff,
                store_id: 2,
                store_name: "Ueno".into(),
            })
            .unwrap();

        let identity = authenticate(&headers(&format!("Bearer {token}")), &validator).unwrap();
        assert_eq!(identity.user_id, 5);
        assert_eq!(identity.role, Role::Staff);
        assert_eq!(identity.store_id, 2);
        assert!(identity.require_privileged().is_err());
        assert!(identity.require_store(2).is_ok());
        assert!(identity.require_store(3).is_err());
    }

    #[test]
    fn admin_crosses_stores() {
        let admin = Identity {
            user_id: 1,
            name: "root".into(),
            role: Role::Admin,
            store_id: 1,
        };
        assert!(admin.require_privileged().is_ok());
        assert!(admin.require_store(99).is_ok());
    }
}
