//! Request signing gate.
//!
//! Authenticated requests carry three headers:
//! - `X-Codex-Date`: RFC 3339 timestamp
//! - `X-Codex-Nonce`: unique per request
//! - `X-Codex-Signature`: base64url (no padding) HMAC-SHA256 over the
//!   canonical string
//!
//! The canonical string joins, with `\n`:
//! device ID, upper-cased method, path, raw query, base64url SHA-256 of the
//! body, the date header value and the nonce.

use crate::auth::error::AuthError;
use crate::cache::NonceCache;
use axum::http::HeaderMap;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;

pub const HEADER_DATE: &str = "X-Codex-Date";
pub const HEADER_NONCE: &str = "X-Codex-Nonce";
pub const HEADER_SIGNATURE: &str = "X-Codex-Signature";

pub const DEFAULT_MAX_AGE: Duration = Duration::from_secs(300);
pub const DEFAULT_MAX_FUTURE: Duration = Duration::from_secs(120);

type HmacSha256 = Hmac<Sha256>;

/// Everything the signature covers.
#[derive(Debug, Clone, Copy)]
pub struct SignedRequest<'a> {
    pub device_id: &'a str,
    pub method: &'a str,
    pub path: &'a str,
    /// Raw query string without the leading `?`.
    pub query: &'a str,
    pub body: &'a [u8],
    pub timestamp: &'a str,
    pub nonce: &'a str,
}

impl SignedRequest<'_> {
    pub fn canonical_string(&self) -> String {
        canonical_string(
            self.device_id,
            self.method,
            self.path,
            self.query,
            &body_hash(self.body),
            self.timestamp,
            self.nonce,
        )
    }

    /// Signature a well-behaved client would send for this request.
    pub fn sign(&self, secret: &str) -> String {
        compute_signature(secret, &self.canonical_string())
    }
}

pub fn body_hash(body: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(body))
}

pub fn canonical_string(
    device_id: &str,
    method: &str,
    path: &str,
    query: &str,
    body_hash: &str,
    timestamp: &str,
    nonce: &str,
) -> String {
    [
        device_id,
        &method.to_ascii_uppercase(),
        path,
        query,
        body_hash,
        timestamp,
        nonce,
    ]
    .join("\n")
}

fn mac_for(secret: &str, canonical: &str) -> Option<HmacSha256> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).ok()?;
    mac.update(canonical.as_bytes());
    Some(mac)
}

pub fn compute_signature(secret: &str, canonical: &str) -> String {
    mac_for(secret, canonical)
        .map(|mac| URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes()))
        .unwrap_or_default()
}

/// Pure signature check. Freshness and replay are not considered here.
pub fn validate_signed_request(secret: &str, request: &SignedRequest<'_>, signature: &str) -> bool {
    let Ok(provided) = URL_SAFE_NO_PAD.decode(signature.trim()) else {
        return false;
    };
    let Some(mac) = mac_for(secret, &request.canonical_string()) else {
        return false;
    };

    // Constant-time comparison
    mac.verify_slice(&provided).is_ok()
}

/// The three signing headers, present and non-empty.
#[derive(Debug, Clone)]
pub struct SignatureHeaders {
    pub timestamp: String,
    pub nonce: String,
    pub signature: String,
}

impl SignatureHeaders {
    pub fn from_headers(headers: &HeaderMap) -> Option<Self> {
        let read = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(str::to_owned)
        };
        Some(Self {
            timestamp: read(HEADER_DATE)?,
            nonce: read(HEADER_NONCE)?,
            signature: read(HEADER_SIGNATURE)?,
        })
    }
}

/// Parse the date header and require it within `[now - max_age, now + max_future]`.
pub fn check_timestamp(
    raw: &str,
    now: DateTime<Utc>,
    max_age: Duration,
    max_future: Duration,
) -> Result<DateTime<Utc>, AuthError> {
    let ts = DateTime::parse_from_rfc3339(raw)
        .map_err(|_| AuthError::InvalidTimestamp)?
        .with_timezone(&Utc);

    let too_old = (now - ts).to_std().is_ok_and(|age| age > max_age);
    let too_new = (ts - now).to_std().is_ok_and(|ahead| ahead > max_future);
    if too_old || too_new {
        return Err(AuthError::RequestExpired);
    }
    Ok(ts)
}

/// Stateful gate: signature, freshness window and single-use nonces.
#[derive(Clone)]
pub struct RequestSignatureValidator {
    secret: Arc<str>,
    max_age: Duration,
    max_future: Duration,
    nonces: Arc<dyn NonceCache>,
}

impl RequestSignatureValidator {
    pub fn new(secret: &str, nonces: Arc<dyn NonceCache>) -> Self {
        Self::with_window(secret, nonces, DEFAULT_MAX_AGE, DEFAULT_MAX_FUTURE)
    }

    pub fn with_window(
        secret: &str,
        nonces: Arc<dyn NonceCache>,
        max_age: Duration,
        max_future: Duration,
    ) -> Self {
        Self {
            secret: Arc::from(secret),
            max_age,
            max_future,
            nonces,
        }
    }

    /// How long a consumed nonce is remembered. A request dated `max_future`
    /// ahead stays fresh until `max_age` after that, so the nonce must outlive
    /// both bounds.
    pub fn replay_window(&self) -> Duration {
        self.max_age.saturating_add(self.max_future)
    }

    /// Run the full gate for a request made by `device_id`.
    ///
    /// The nonce is consumed only after the signature verifies, so forged
    /// requests cannot burn a legitimate client's nonces.
    pub fn validate(
        &self,
        headers: Option<&SignatureHeaders>,
        request: &SignedRequestParts<'_>,
    ) -> Result<(), AuthError> {
        self.validate_at(headers, request, Utc::now())
    }

    pub fn validate_at(
        &self,
        headers: Option<&SignatureHeaders>,
        request: &SignedRequestParts<'_>,
        now: DateTime<Utc>,
    ) -> Result<(), AuthError> {
        let headers = headers.ok_or(AuthError::SignatureRequired)?;

        check_timestamp(&headers.timestamp, now, self.max_age, self.max_future)?;

        let signed = SignedRequest {
            device_id: request.device_id,
            method: request.method,
            path: request.path,
            query: request.query,
            body: request.body,
            timestamp: &headers.timestamp,
            nonce: &headers.nonce,
        };
        if !validate_signed_request(&self.secret, &signed, &headers.signature) {
            return Err(AuthError::InvalidSignature);
        }

        let key = format!("sig:{}:{}", request.device_id, headers.nonce);
        if !self.nonces.set_if_absent(&key, "1", self.replay_window())? {
            tracing::warn!(device_id = request.device_id, "replayed request nonce");
            return Err(AuthError::ReplayDetected);
        }
        Ok(())
    }
}

/// Request fields known before the signing headers are read.
#[derive(Debug, Clone, Copy)]
pub struct SignedRequestParts<'a> {
    pub device_id: &'a str,
    pub method: &'a str,
    pub path: &'a str,
    pub query: &'a str,
    pub body: &'a [u8],
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::error::StoreError;
    use crate::cache::MemoryNonceCache;

    const SECRET: &str = "signature-secret-0123456789abcdef";

    fn base_request<'a>(timestamp: &'a str, nonce: &'a str) -> SignedRequest<'a> {
        SignedRequest {
            device_id: "device-1",
            method: "post",
            path: "/api/v1/images",
            query: "a=1&b=2",
            body: br#"{"name":"cat.png"}"#,
            timestamp,
            nonce,
        }
    }

    fn parts<'a>(req: &SignedRequest<'a>) -> SignedRequestParts<'a> {
        SignedRequestParts {
            device_id: req.device_id,
            method: req.method,
            path: req.path,
            query: req.query,
            body: req.body,
        }
    }

    fn headers_for(req: &SignedRequest<'_>) -> SignatureHeaders {
        SignatureHeaders {
            timestamp: req.timestamp.to_string(),
            nonce: req.nonce.to_string(),
            signature: req.sign(SECRET),
        }
    }

    fn validator() -> RequestSignatureValidator {
        RequestSignatureValidator::new(SECRET, Arc::new(MemoryNonceCache::new()))
    }

    #[test]
    fn canonical_string_layout() {
        let canonical = canonical_string("d", "get", "/p", "q=1", "BH", "T", "N");
        assert_eq!(canonical, "d\nGET\n/p\nq=1\nBH\nT\nN");
    }

    #[test]
    fn empty_body_hash_is_base64url_of_sha256() {
        assert_eq!(body_hash(b""), "47DEQpj8HBSa-_TImW-5JCeuQeRkm5NMpJWZG3hSuFU");
    }

    #[test]
    fn correctly_signed_request_verifies() {
        let req = base_request("2026-01-01T00:00:00Z", "n-1");
        assert!(validate_signed_request(SECRET, &req, &req.sign(SECRET)));
    }

    #[test]
    fn method_case_does_not_change_signature() {
        let req = base_request("2026-01-01T00:00:00Z", "n-1");
        let upper = SignedRequest { method: "POST", ..req };
        assert_eq!(req.sign(SECRET), upper.sign(SECRET));
    }

    #[test]
    fn any_covered_field_change_invalidates() {
        let req = base_request("2026-01-01T00:00:00Z", "n-1");
        let signature = req.sign(SECRET);

        let variants = [
            SignedRequest { device_id: "device-2", ..req },
            SignedRequest { method: "PUT", ..req },
            SignedRequest { path: "/api/v1/imageS", ..req },
            SignedRequest { query: "a=1&b=3", ..req },
            SignedRequest { body: br#"{"name":"cat.pnG"}"#, ..req },
            SignedRequest { timestamp: "2026-01-01T00:00:01Z", ..req },
            SignedRequest { nonce: "n-2", ..req },
        ];
        for variant in variants {
            assert!(!validate_signed_request(SECRET, &variant, &signature));
        }
        assert!(!validate_signed_request("other-secret", &req, &signature));
    }

    #[test]
    fn garbage_signature_is_rejected() {
        let req = base_request("2026-01-01T00:00:00Z", "n-1");
        assert!(!validate_signed_request(SECRET, &req, "not base64 !!"));
        assert!(!validate_signed_request(SECRET, &req, ""));
    }

    #[test]
    fn timestamp_window_bounds() {
        let now = Utc::now();
        let fmt = |d: chrono::Duration| (now + d).to_rfc3339();

        for ok in [chrono::Duration::seconds(-299), chrono::Duration::zero(), chrono::Duration::seconds(119)] {
            assert!(check_timestamp(&fmt(ok), now, DEFAULT_MAX_AGE, DEFAULT_MAX_FUTURE).is_ok());
        }
        for stale in [chrono::Duration::seconds(-301), chrono::Duration::seconds(121)] {
            assert!(matches!(
                check_timestamp(&fmt(stale), now, DEFAULT_MAX_AGE, DEFAULT_MAX_FUTURE),
                Err(AuthError::RequestExpired)
            ));
        }
        assert!(matches!(
            check_timestamp("yesterday", now, DEFAULT_MAX_AGE, DEFAULT_MAX_FUTURE),
            Err(AuthError::InvalidTimestamp)
        ));
    }

    #[test]
    fn gate_accepts_once_then_detects_replay() {
        let gate = validator();
        let ts = Utc::now().to_rfc3339();
        let req = base_request(&ts, "nonce-a");
        let headers = headers_for(&req);

        gate.validate(Some(&headers), &parts(&req)).unwrap();
        assert!(matches!(
            gate.validate(Some(&headers), &parts(&req)),
            Err(AuthError::ReplayDetected)
        ));
    }

    #[test]
    fn future_dated_request_cannot_replay_while_still_fresh() {
        let gate = RequestSignatureValidator::with_window(
            SECRET,
            Arc::new(MemoryNonceCache::new()),
            Duration::from_secs(1),
            Duration::from_secs(2),
        );
        assert_eq!(gate.replay_window(), Duration::from_secs(3));

        let ts = (Utc::now() + chrono::Duration::milliseconds(1900)).to_rfc3339();
        let req = base_request(&ts, "nonce-future");
        let headers = headers_for(&req);
        gate.validate(Some(&headers), &parts(&req)).unwrap();

        // Past max_age since first use, but the timestamp is still in window.
        std::thread::sleep(Duration::from_millis(1300));
        assert!(matches!(
            gate.validate(Some(&headers), &parts(&req)),
            Err(AuthError::ReplayDetected)
        ));
    }

    #[test]
    fn gate_requires_headers() {
        let gate = validator();
        let ts = Utc::now().to_rfc3339();
        let req = base_request(&ts, "nonce-a");
        assert!(matches!(
            gate.validate(None, &parts(&req)),
            Err(AuthError::SignatureRequired)
        ));
    }

    #[test]
    fn forged_request_does_not_burn_nonce() {
        let gate = validator();
        let ts = Utc::now().to_rfc3339();
        let req = base_request(&ts, "nonce-b");
        let mut forged = headers_for(&req);
        forged.signature = SignedRequest { path: "/evil", ..req }.sign(SECRET);

        assert!(matches!(
            gate.validate(Some(&forged), &parts(&req)),
            Err(AuthError::InvalidSignature)
        ));
        gate.validate(Some(&headers_for(&req)), &parts(&req)).unwrap();
    }

    #[test]
    fn same_nonce_on_different_devices_is_independent() {
        let gate = validator();
        let ts = Utc::now().to_rfc3339();
        let a = base_request(&ts, "shared");
        let b = SignedRequest { device_id: "device-2", ..a };

        gate.validate(Some(&headers_for(&a)), &parts(&a)).unwrap();
        gate.validate(Some(&headers_for(&b)), &parts(&b)).unwrap();
    }

    #[test]
    fn stale_request_is_rejected_before_nonce_use() {
        let gate = validator();
        let ts = (Utc::now() - chrono::Duration::minutes(10)).to_rfc3339();
        let req = base_request(&ts, "nonce-c");
        assert!(matches!(
            gate.validate(Some(&headers_for(&req)), &parts(&req)),
            Err(AuthError::RequestExpired)
        ));
    }

    struct DownCache;

    impl NonceCache for DownCache {
        fn set_if_absent(&self, _: &str, _: &str, _: Duration) -> Result<bool, StoreError> {
            Err(StoreError::Unavailable("cache offline".into()))
        }
    }

    #[test]
    fn cache_outage_is_storage_unavailable() {
        let gate = RequestSignatureValidator::new(SECRET, Arc::new(DownCache));
        let ts = Utc::now().to_rfc3339();
        let req = base_request(&ts, "nonce-d");
        assert!(matches!(
            gate.validate(Some(&headers_for(&req)), &parts(&req)),
            Err(AuthError::StorageUnavailable(_))
        ));
    }

    #[test]
    fn headers_are_read_and_trimmed() {
        let mut map = HeaderMap::new();
        map.insert(HEADER_DATE, "2026-01-01T00:00:00Z".parse().unwrap());
        map.insert(HEADER_NONCE, " n ".parse().unwrap());
        assert!(SignatureHeaders::from_headers(&map).is_none());

        map.insert(HEADER_SIGNATURE, "abc".parse().unwrap());
        let parsed = SignatureHeaders::from_headers(&map).unwrap();
        assert_eq!(parsed.nonce, "n");
        assert_eq!(parsed.signature, "abc");
    }
}
