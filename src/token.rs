//! Manage json web tokens.

use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode};
use serde::{Deserialize, Serialize};

use crate::authorization::Principal;
use crate::error::{Result, ServerError};

const BEARER: &str = "Bearer ";

/// Pieces of information asserted on a JWT.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Claims {
    /// Recipients that the JWT is intended for.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aud: Option<String>,
    /// Identifies the expiration time on or after which the JWT must not be
    /// accepted for processing.
    pub exp: u64,
    /// User ID.
    pub sub: String,
}

/// Verify bearer tokens.
#[derive(Clone)]
pub struct TokenManager {
    algorithm: Algorithm,
    key: DecodingKey,
    audience: Option<String>,
}

impl TokenManager {
    /// Tokens signed with a shared HS256 secret.
    pub fn from_secret(secret: &str) -> Self {
        Self {
            algorithm: Algorithm::HS256,
            key: DecodingKey::from_secret(secret.as_bytes()),
            audience: None,
        }
    }

    /// Tokens signed with ES256, checked against a PEM public key.
    pub fn from_ec_pem(
        public_key_pem: &str,
    ) -> std::result::Result<Self, jsonwebtoken::errors::Error> {
        Ok(Self {
            algorithm: Algorithm::ES256,
            key: DecodingKey::from_ec_pem(public_key_pem.as_bytes())?,
            audience: None,
        })
    }

    /// Require `audience` on every token.
    pub fn audience(&mut self, audience: &str) {
        self.audience = Some(audience.to_owned());
    }

    /// Decode and check a token.
    pub fn decode(&self, token: &str) -> Result<Claims> {
        let mut validation = Validation::new(self.algorithm);
        match &self.audience {
            Some(audience) => validation.set_audience(&[audience]),
            None => validation.validate_aud = false,
        }

        decode::<Claims>(token, &self.key, &validation)
            .map(|data| data.claims)
            .map_err(|err| {
                tracing::debug!(error = %err, "rejected bearer token");
                ServerError::Unauthorized
            })
    }

    /// Principal behind an `Authorization` header value.
    ///
    /// No header is the anonymous principal, a malformed or invalid one is
    /// rejected.
    pub fn principal(&self, header: Option<&str>) -> Result<Principal> {
        let Some(header) = header else {
            return Ok(Principal::anonymous());
        };
        let token = header
            .strip_prefix(BEARER)
            .ok_or(ServerError::Unauthorized)?;

        let claims = self.decode(token.trim())?;
        if claims.sub.is_empty() {
            return Err(ServerError::Unauthorized);
        }
        Ok(Principal::new(claims.sub))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use jsonwebtoken::{EncodingKey, Header, encode};

    use super::*;

    pub const SECRET: &str = "test-secret";

    pub fn bearer(sub: &str, aud: Option<&str>) -> String {
        let claims = Claims {
            aud: aud.map(str::to_owned),
            exp: (chrono::Utc::now().timestamp() + 600) as u64,
            sub: sub.to_owned(),
        };
        let token = encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(SECRET.as_bytes()),
        )
        .unwrap();
        format!("{BEARER}{token}")
    }

    #[test]
    fn test_principal_from_header() {
        let manager = TokenManager::from_secret(SECRET);

        assert!(manager.principal(None).unwrap().is_anonymous());
        assert_eq!(
            manager.principal(Some(&bearer("u_alice", None))).unwrap(),
            Principal::new("u_alice")
        );
        assert!(manager.principal(Some("Basic abc")).is_err());
        assert!(
            TokenManager::from_secret("other")
                .principal(Some(&bearer("u_alice", None)))
                .is_err()
        );
    }

    #[test]
    fn test_audience_is_enforced() {
        let mut manager = TokenManager::from_secret(SECRET);
        manager.audience("accounts");

        assert!(manager.principal(Some(&bearer("u_alice", Some("accounts")))).is_ok());
        assert!(manager.principal(Some(&bearer("u_alice", Some("billing")))).is_err());
    }
}
