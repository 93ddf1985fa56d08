//! JWT validation with nonce-based replay protection.
//!
//! One claim contract: `iss`, `aud`, `call_id`, `iat`, `exp`, `nonce` are
//! all required, signed with HS256. Tokens are short-lived: both the
//! declared lifetime (`exp - iat`) and the observed age (`now - iat`) must
//! stay within the configured maximum.

use crate::config::AuthConfig;
use crate::error::{GatewayError, Result};
use crate::security::nonce::NonceStore;
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Required claim set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub iss: String,
    pub aud: String,
    pub call_id: String,
    pub iat: u64,
    pub exp: u64,
    pub nonce: String,
}

/// Validates bearer tokens for stream connections.
pub struct JwtValidator {
    decoding_key: DecodingKey,
    validation: Validation,
    max_ttl: Duration,
    nonce_ttl: Duration,
    nonces: Arc<NonceStore>,
}

impl JwtValidator {
    /// Build a validator from the auth config and a shared nonce store.
    pub fn new(config: &AuthConfig, nonces: Arc<NonceStore>) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_audience(&[config.jwt_audience.clone()]);
        validation.set_issuer(&[config.jwt_issuer.clone()]);
        validation.set_required_spec_claims(&["exp", "iss", "aud"]);
        validation.leeway = 0;

        Self {
            decoding_key: DecodingKey::from_secret(config.jwt_secret.as_bytes()),
            validation,
            max_ttl: Duration::from_secs(config.jwt_max_ttl_seconds),
            nonce_ttl: Duration::from_secs(config.nonce_ttl_seconds),
            nonces,
        }
    }

    /// Validate a token presented for `call_id`.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Auth`] on any signature, claim, lifetime, or
    /// replay failure. The caller closes the connection with code 1008.
    pub fn validate(&self, token: &str, call_id: &str) -> Result<Claims> {
        let data = decode::<Claims>(token, &self.decoding_key, &self.validation)
            .map_err(|e| GatewayError::Auth(format!("token rejected: {e}")))?;
        let claims = data.claims;

        if claims.call_id != call_id {
            warn!("JWT call_id mismatch: {} != {call_id}", claims.call_id);
            return Err(GatewayError::Auth("call_id mismatch".to_owned()));
        }

        let max_ttl = self.max_ttl.as_secs();
        if claims.exp < claims.iat || claims.exp - claims.iat > max_ttl {
            return Err(GatewayError::Auth(format!(
                "token lifetime exceeds {max_ttl}s"
            )));
        }
        let now = unix_now();
        if now.saturating_sub(claims.iat) > max_ttl {
            return Err(GatewayError::Auth("token too old".to_owned()));
        }

        if claims.nonce.is_empty() {
            return Err(GatewayError::Auth("missing nonce".to_owned()));
        }
        let key = format!("jwt_nonce:{}", claims.nonce);
        if !self.nonces.set_if_absent(&key, self.nonce_ttl) {
            warn!("JWT replay detected: nonce {}", claims.nonce);
            return Err(GatewayError::Auth("nonce replay".to_owned()));
        }

        Ok(claims)
    }
}

fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
