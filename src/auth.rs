use chrono::{Duration, Utc};
use jsonwebtoken::{
    decode, decode_header, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::AuthConfig;
use crate::error::{GatewayError, GatewayResult};

pub const ADMIN_ROLE: &str = "ROLE_ADMIN";

#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String, // principal name
    #[serde(default)]
    pub roles: Vec<String>,
    pub jti: String, // unique per token
    pub exp: i64,
    pub iat: i64,
    pub iss: String,
}

/// Authenticated identity resolved from a bearer token
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub name: String,
    pub roles: Vec<String>,
    /// Unix seconds; the sweep task closes sessions whose token lapsed
    pub token_expires_at: i64,
}

impl Principal {
    pub fn is_admin(&self) -> bool {
        self.roles.iter().any(|r| r == ADMIN_ROLE)
    }
}

/// Verifies bearer tokens on CONNECT and mints tokens for local tooling.
///
/// HS256 with a shared secret is the primary mode. When an RS256 public key
/// is configured, tokens carrying an RS256 header are verified against it
/// (verify-only; this service never signs RS256 tokens).
pub struct AuthManager {
    encoding_key: EncodingKey,
    hs_decoding_key: DecodingKey,
    rs_decoding_key: Option<DecodingKey>,
    issuer: String,
    access_token_ttl_hours: i64,
}

impl AuthManager {
    pub fn new(config: &AuthConfig) -> anyhow::Result<Self> {
        let rs_decoding_key = match &config.jwt_public_key {
            Some(pem) => {
                tracing::info!("RS256 token verification enabled");
                Some(
                    DecodingKey::from_rsa_pem(pem.as_bytes())
                        .map_err(|e| anyhow::anyhow!("Failed to parse JWT_PUBLIC_KEY: {}", e))?,
                )
            }
            None => None,
        };

        Ok(Self {
            encoding_key: EncodingKey::from_secret(config.jwt_secret.as_bytes()),
            hs_decoding_key: DecodingKey::from_secret(config.jwt_secret.as_bytes()),
            rs_decoding_key,
            issuer: config.jwt_issuer.clone(),
            access_token_ttl_hours: config.access_token_ttl_hours,
        })
    }

    /// Create an HS256 access token for `principal` with the given roles
    pub fn create_token(&self, principal: &str, roles: &[&str]) -> anyhow::Result<String> {
        let now = Utc::now();
        let exp = now + Duration::hours(self.access_token_ttl_hours);

        let claims = Claims {
            sub: principal.to_string(),
            roles: roles.iter().map(|r| r.to_string()).collect(),
            jti: Uuid::new_v4().to_string(),
            exp: exp.timestamp(),
            iat: now.timestamp(),
            iss: self.issuer.clone(),
        };

        let token = encode(&Header::default(), &claims, &self.encoding_key)?;
        Ok(token)
    }

    /// Verify an `Authorization` header value and resolve the principal.
    ///
    /// Expects the `Bearer <token>` form; the algorithm is picked from the
    /// token header so RS256 tokens verify when a public key is configured.
    pub fn verify_bearer(&self, header_value: &str) -> GatewayResult<Principal> {
        let token = header_value
            .strip_prefix("Bearer ")
            .ok_or_else(|| GatewayError::authentication("invalid token format"))?;

        let header = decode_header(token)
            .map_err(|e| GatewayError::authentication(format!("malformed token: {}", e)))?;

        let (algorithm, key) = match header.alg {
            Algorithm::HS256 => (Algorithm::HS256, &self.hs_decoding_key),
            Algorithm::RS256 => match &self.rs_decoding_key {
                Some(key) => (Algorithm::RS256, key),
                None => {
                    return Err(GatewayError::authentication(
                        "RS256 token but no public key configured",
                    ))
                }
            },
            other => {
                return Err(GatewayError::authentication(format!(
                    "unsupported token algorithm: {:?}",
                    other
                )))
            }
        };

        let mut validation = Validation::new(algorithm);
        validation.set_issuer(&[self.issuer.clone()]);

        let data = decode::<Claims>(token, key, &validation)
            .map_err(|e| GatewayError::authentication(format!("token rejected: {}", e)))?;

        Ok(Principal {
            name: data.claims.sub,
            roles: data.claims.roles,
            token_expires_at: data.claims.exp,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> AuthManager {
        AuthManager::new(&AuthConfig {
            jwt_secret: "test_secret_key_for_testing_only_32bytes!".to_string(),
            jwt_public_key: None,
            jwt_issuer: "relay-gateway".to_string(),
            access_token_ttl_hours: 1,
        })
        .unwrap()
    }

    #[test]
    fn roundtrip_resolves_principal_and_roles() {
        let auth = manager();
        let token = auth.create_token("alice", &[ADMIN_ROLE]).unwrap();

        let principal = auth.verify_bearer(&format!("Bearer {}", token)).unwrap();
        assert_eq!(principal.name, "alice");
        assert!(principal.is_admin());
        assert!(principal.token_expires_at > Utc::now().timestamp());
    }

    #[test]
    fn missing_bearer_prefix_is_rejected() {
        let auth = manager();
        let token = auth.create_token("alice", &[]).unwrap();

        let err = auth.verify_bearer(&token).unwrap_err();
        assert_eq!(err.error_code(), "AUTH_FAILED");
    }

    #[test]
    fn garbage_token_is_rejected() {
        let auth = manager();
        let err = auth.verify_bearer("Bearer not.a.token").unwrap_err();
        assert_eq!(err.error_code(), "AUTH_FAILED");
    }

    #[test]
    fn wrong_issuer_is_rejected() {
        let auth = manager();
        let other = AuthManager::new(&AuthConfig {
            jwt_secret: "test_secret_key_for_testing_only_32bytes!".to_string(),
            jwt_public_key: None,
            jwt_issuer: "someone-else".to_string(),
            access_token_ttl_hours: 1,
        })
        .unwrap();

        let token = other.create_token("alice", &[]).unwrap();
        assert!(auth.verify_bearer(&format!("Bearer {}", token)).is_err());
    }

    #[test]
    fn non_admin_principal() {
        let auth = manager();
        let token = auth.create_token("bob", &["ROLE_USER"]).unwrap();
        let principal = auth.verify_bearer(&format!("Bearer {}", token)).unwrap();
        assert!(!principal.is_admin());
    }
}
