//! Opaque refresh secrets.
//!
//! The plaintext secret goes to the client exactly once; only its SHA-256
//! digest is persisted.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::RngCore;
use sha2::{Digest, Sha256};

/// Random bytes drawn per refresh secret when no length is configured.
pub const DEFAULT_REFRESH_TOKEN_BYTES: usize = 64;

/// Generate a refresh secret of `length` random bytes.
///
/// Returns `(secret, hash)`: the base64url secret for the caller and the hex
/// digest for storage.
pub fn generate(length: usize) -> (String, String) {
    let length = if length == 0 {
        DEFAULT_REFRESH_TOKEN_BYTES
    } else {
        length
    };
    let mut bytes = vec![0u8; length];
    rand::rngs::OsRng.fill_bytes(&mut bytes);

    let secret = URL_SAFE_NO_PAD.encode(&bytes);
    let hash = hash_of(&secret);
    (secret, hash)
}

/// One-way lookup key for a presented secret.
pub fn hash_of(secret: &str) -> String {
    hex::encode(Sha256::digest(secret.as_bytes()))
}
