//! Bearer token inspection.
//!
//! The relay authenticates the WebSocket upgrade with a `?token=` query
//! parameter (browsers can't set headers on WebSocket upgrades). Tokens are
//! JWTs issued elsewhere; this client only peeks at the claims to show who
//! is signed in and to avoid connecting with an expired token. Signatures are
//! not checked, the relay does that.

use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::Deserialize;

#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    #[error("token has expired")]
    Expired,
    #[error(transparent)]
    Jwt(jsonwebtoken::errors::Error),
}

impl From<jsonwebtoken::errors::Error> for TokenError {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        match err.kind() {
            ErrorKind::ExpiredSignature => Self::Expired,
            _ => Self::Jwt(err),
        }
    }
}

#[derive(Debug, Deserialize)]
struct Claims {
    email: Option<String>,
    sub: Option<String>,
    exp: Option<u64>,
}

/// What the client cares about in a token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenInfo {
    /// `email` claim, else `sub`.
    pub subject: Option<String>,
    /// Expiry as seconds since the Unix epoch.
    pub expires_at: Option<u64>,
}

impl TokenInfo {
    /// Decode the claims of an unexpired JWT without checking its signature.
    pub fn inspect(token: &str) -> Result<Self, TokenError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.insecure_disable_signature_validation();
        validation.required_spec_claims.clear();
        validation.validate_aud = false;
        validation.leeway = 0;

        let data = decode::<Claims>(token, &DecodingKey::from_secret(&[]), &validation)?;
        let claims = data.claims;
        Ok(Self {
            subject: claims.email.or(claims.sub),
            expires_at: claims.exp,
        })
    }
}

/// The token to connect with, or `None` when it is missing, empty or expired.
///
/// Opaque (non-JWT) tokens are passed through untouched.
pub fn usable_token(token: Option<&str>) -> Option<&str> {
    let token = token.filter(|t| !t.is_empty())?;
    match TokenInfo::inspect(token) {
        Err(TokenError::Expired) => {
            tracing::warn!("Auth token has expired");
            None
        }
        _ => Some(token),
    }
}
