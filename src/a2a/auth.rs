//! Caller credentials for the A2A surface.
//!
//! Callers present a bearer JWT whose subject is their engine user id.
//! Tokens are minted out-of-band (operator tooling or the external
//! identity registry) and verified here with a shared secret.

use chrono::Utc;
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct A2aClaims {
    /// Engine user id of the caller.
    pub sub: String,
    pub handle: Option<String>,
    pub exp: usize,
}

#[derive(Clone)]
pub struct JwtAuthenticator {
    secret: String,
    expiration_hours: i64,
}

impl JwtAuthenticator {
    pub fn new(secret: String) -> Self {
        Self {
            secret,
            expiration_hours: 24,
        }
    }

    pub fn issue_token(&self, user_id: i64, handle: Option<&str>) -> EngineResult<String> {
        let exp = Utc::now()
            .checked_add_signed(chrono::Duration::hours(self.expiration_hours))
            .ok_or_else(|| EngineError::Unauthorized("invalid expiry".to_string()))?
            .timestamp() as usize;

        let claims = A2aClaims {
            sub: user_id.to_string(),
            handle: handle.map(|h| h.to_string()),
            exp,
        };
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(self.secret.as_bytes()),
        )
        .map_err(|e| EngineError::Unauthorized(e.to_string()))
    }

    /// Validate a token and return the caller's user id.
    pub fn verify(&self, token: &str) -> EngineResult<i64> {
        let decoded = decode::<A2aClaims>(
            token,
            &DecodingKey::from_secret(self.secret.as_bytes()),
            &Validation::default(),
        )
        .map_err(|e| EngineError::Unauthorized(format!("invalid token: {e}")))?;

        decoded
            .claims
            .sub
            .parse::<i64>()
            .map_err(|_| EngineError::Unauthorized("malformed subject".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn issue_and_verify_round_trip() {
        let auth = JwtAuthenticator::new("test-secret".to_string());
        let token = auth.issue_token(42, Some("caller")).unwrap();
        assert_eq!(auth.verify(&token).unwrap(), 42);
    }

    #[test]
    fn wrong_secret_rejected() {
        let issuer = JwtAuthenticator::new("secret-a".to_string());
        let verifier = JwtAuthenticator::new("secret-b".to_string());
        let token = issuer.issue_token(42, None).unwrap();
        let err = verifier.verify(&token).unwrap_err();
        assert_eq!(err.kind_code(), "unauthorized");
    }

    #[test]
    fn garbage_token_rejected() {
        let auth = JwtAuthenticator::new("s".to_string());
        assert!(auth.verify("not.a.token").is_err());
    }
}
