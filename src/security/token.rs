//! Short-lived HS512 access tokens.
//!
//! Verification pins the HMAC-SHA512 family: a token whose header names any
//! other algorithm is rejected before its signature is even considered.

use chrono::Utc;
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::time::Duration;

const SIGNING_ALGORITHM: Algorithm = Algorithm::HS512;

/// Claims embedded in every access token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessClaims {
    #[serde(rename = "uid")]
    pub user_id: String,
    #[serde(rename = "sid")]
    pub session_id: String,
    #[serde(rename = "did")]
    pub device_id: String,
    pub role: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scopes: Option<Vec<String>>,
    pub sub: String,
    pub jti: String,
    #[serde(rename = "iat")]
    pub issued_at: i64,
    #[serde(rename = "exp")]
    pub expires_at: i64,
}

/// Identity a token is issued for.
#[derive(Debug, Clone, Copy)]
pub struct TokenSubject<'a> {
    pub user_id: &'a str,
    pub session_id: &'a str,
    pub device_id: &'a str,
    pub role: &'a str,
    pub scopes: Option<&'a [String]>,
}

#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    #[error("access token expired")]
    Expired,
    #[error("access token signed with an unexpected algorithm")]
    AlgorithmMismatch,
    #[error("access token signature mismatch")]
    BadSignature,
    #[error("malformed access token: {0}")]
    Malformed(String),
    #[error("failed to sign access token: {0}")]
    Signing(String),
}

/// Issues and verifies access tokens with a process-wide symmetric secret.
#[derive(Clone)]
pub struct AccessTokenCodec {
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
    ttl: Duration,
}

impl AccessTokenCodec {
    pub fn new(secret: &str, ttl: Duration) -> Self {
        let mut validation = Validation::new(SIGNING_ALGORITHM);
        validation.leeway = 0;
        validation.validate_exp = true;
        validation.set_required_spec_claims(&["exp", "iat", "sub"]);

        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            validation,
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Issue a token valid from now for the configured TTL.
    pub fn issue(&self, subject: &TokenSubject<'_>) -> Result<String, TokenError> {
        self.issue_at(subject, Utc::now().timestamp())
    }

    /// Issue a token with an explicit issued-at (Unix seconds).
    pub fn issue_at(&self, subject: &TokenSubject<'_>, issued_at: i64) -> Result<String, TokenError> {
        let ttl_secs = i64::try_from(self.ttl.as_secs()).unwrap_or(i64::MAX);
        let claims = AccessClaims {
            user_id: subject.user_id.to_string(),
            session_id: subject.session_id.to_string(),
            device_id: subject.device_id.to_string(),
            role: subject.role.to_string(),
            scopes: subject.scopes.map(<[String]>::to_vec),
            sub: subject.user_id.to_string(),
            jti: subject.session_id.to_string(),
            issued_at,
            expires_at: issued_at.saturating_add(ttl_secs),
        };

        encode(&Header::new(SIGNING_ALGORITHM), &claims, &self.encoding)
            .map_err(|e| TokenError::Signing(e.to_string()))
    }

    /// Verify signature, algorithm and expiry. Never touches storage.
    pub fn verify(&self, token: &str) -> Result<AccessClaims, TokenError> {
        decode::<AccessClaims>(token, &self.decoding, &self.validation)
            .map(|data| data.claims)
            .map_err(|e| match e.kind() {
                ErrorKind::ExpiredSignature => TokenError::Expired,
                ErrorKind::InvalidAlgorithm => TokenError::AlgorithmMismatch,
                ErrorKind::InvalidSignature => TokenError::BadSignature,
                _ => TokenError::Malformed(e.to_string()),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use base64::Engine;

    const SECRET: &str = "test-access-secret-0123456789abcdef";

    fn subject<'a>(scopes: Option<&'a [String]>) -> TokenSubject<'a> {
        TokenSubject {
            user_id: "user-1",
            session_id: "session-1",
            device_id: "device-1",
            role: "user",
            scopes,
        }
    }

    #[test]
    fn issued_claims_round_trip() {
        let codec = AccessTokenCodec::new(SECRET, Duration::from_secs(900));
        let scopes = vec!["media:write".to_string()];
        let token = codec.issue(&subject(Some(&scopes))).unwrap();

        let claims = codec.verify(&token).unwrap();
        assert_eq!(claims.user_id, "user-1");
        assert_eq!(claims.session_id, "session-1");
        assert_eq!(claims.device_id, "device-1");
        assert_eq!(claims.role, "user");
        assert_eq!(claims.scopes, Some(scopes));
        assert_eq!(claims.sub, "user-1");
        assert_eq!(claims.jti, "session-1");
        assert_eq!(claims.expires_at - claims.issued_at, 900);
    }

    #[test]
    fn expired_token_is_rejected() {
        let codec = AccessTokenCodec::new(SECRET, Duration::from_secs(60));
        let issued_at = Utc::now().timestamp() - 120;
        let token = codec.issue_at(&subject(None), issued_at).unwrap();

        assert!(matches!(codec.verify(&token), Err(TokenError::Expired)));
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let codec = AccessTokenCodec::new(SECRET, Duration::from_secs(60));
        let other = AccessTokenCodec::new("another-secret-0123456789abcdefgh", Duration::from_secs(60));
        let token = other.issue(&subject(None)).unwrap();

        assert!(matches!(codec.verify(&token), Err(TokenError::BadSignature)));
    }

    #[test]
    fn other_hmac_algorithm_is_rejected() {
        let codec = AccessTokenCodec::new(SECRET, Duration::from_secs(60));
        let now = Utc::now().timestamp();
        let claims = serde_json::json!({
            "uid": "user-1", "sid": "session-1", "did": "device-1", "role": "admin",
            "sub": "user-1", "jti": "session-1", "iat": now, "exp": now + 60,
        });
        let token = encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(SECRET.as_bytes()),
        )
        .unwrap();

        assert!(matches!(
            codec.verify(&token),
            Err(TokenError::AlgorithmMismatch)
        ));
    }

    #[test]
    fn unsigned_token_is_rejected() {
        let codec = AccessTokenCodec::new(SECRET, Duration::from_secs(60));
        let now = Utc::now().timestamp();
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"none","typ":"JWT"}"#);
        let payload = URL_SAFE_NO_PAD.encode(
            serde_json::json!({
                "uid": "user-1", "sid": "s", "did": "d", "role": "superadmin",
                "sub": "user-1", "jti": "s", "iat": now, "exp": now + 60,
            })
            .to_string(),
        );
        let token = format!("{header}.{payload}.");

        assert!(codec.verify(&token).is_err());
    }

    #[test]
    fn tampered_payload_is_rejected() {
        let codec = AccessTokenCodec::new(SECRET, Duration::from_secs(60));
        let token = codec.issue(&subject(None)).unwrap();
        let mut parts: Vec<&str> = token.split('.').collect();

        let mut claims: serde_json::Value =
            serde_json::from_slice(&URL_SAFE_NO_PAD.decode(parts[1]).unwrap()).unwrap();
        claims["role"] = serde_json::json!("superadmin");
        let forged = URL_SAFE_NO_PAD.encode(claims.to_string());
        parts[1] = &forged;

        assert!(matches!(
            codec.verify(&parts.join(".")),
            Err(TokenError::BadSignature)
        ));
    }
}
