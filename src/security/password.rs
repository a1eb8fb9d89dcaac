//! Argon2id credential hashing.
//!
//! Stored hashes are self-describing:
//!
//! ```text
//! $argon2id$v=19$t=<time>,m=<memory KiB>,p=<lanes>$<salt b64>$<key b64>
//! ```
//!
//! Verification re-derives the key with the parameters embedded in the stored
//! string, never with the currently configured defaults, so raising the cost
//! for new hashes leaves existing credentials valid.

use argon2::{Algorithm, Argon2, Params, Version};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;

const ALGORITHM_ID: &str = "argon2id";
const VERSION_TAG: &str = "v=19";

/// Largest memory cost accepted from a stored hash (4 GiB, in KiB).
const MAX_MEMORY_KIB: u32 = 4 * 1024 * 1024;
const MAX_TIME_COST: u32 = 64;
const MAX_PARALLELISM: u32 = 64;

/// Errors from hashing or parsing a stored credential.
#[derive(Debug, thiserror::Error)]
pub enum HashError {
    #[error("malformed credential hash: {0}")]
    Malformed(&'static str),
    #[error("unsupported credential algorithm or version")]
    Unsupported,
    #[error("invalid argon2 parameters: {0}")]
    Params(String),
}

/// Cost parameters used when creating new hashes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PasswordParams {
    /// Number of passes over memory.
    pub time_cost: u32,
    /// Memory cost in KiB.
    pub memory_kib: u32,
    /// Degree of parallelism (lanes).
    pub parallelism: u32,
    /// Salt length in bytes.
    pub salt_len: usize,
    /// Derived key length in bytes.
    pub key_len: usize,
}

impl Default for PasswordParams {
    fn default() -> Self {
        Self {
            time_cost: 3,
            memory_kib: 64 * 1024,
            parallelism: 2,
            salt_len: 16,
            key_len: 32,
        }
    }
}

impl PasswordParams {
    /// Smallest salt and derived key accepted for new hashes.
    pub const MIN_SALT_LEN: usize = 8;
    pub const MIN_KEY_LEN: usize = 16;

    /// Reject parameters argon2 would refuse, or that are too weak to use.
    /// argon2 needs at least 8 KiB of memory per lane.
    pub fn validate(&self) -> Result<(), HashError> {
        if !(1..=MAX_TIME_COST).contains(&self.time_cost) {
            return Err(HashError::Params(format!(
                "time_cost must be in 1..={MAX_TIME_COST}"
            )));
        }
        if !(1..=MAX_PARALLELISM).contains(&self.parallelism) {
            return Err(HashError::Params(format!(
                "parallelism must be in 1..={MAX_PARALLELISM}"
            )));
        }
        let min_memory = 8 * self.parallelism;
        if !(min_memory..=MAX_MEMORY_KIB).contains(&self.memory_kib) {
            return Err(HashError::Params(format!(
                "memory_kib must be in {min_memory}..={MAX_MEMORY_KIB}"
            )));
        }
        if self.salt_len < Self::MIN_SALT_LEN || self.key_len < Self::MIN_KEY_LEN {
            return Err(HashError::Params(format!(
                "salt_len must be >= {} and key_len >= {}",
                Self::MIN_SALT_LEN,
                Self::MIN_KEY_LEN
            )));
        }
        Ok(())
    }
}

/// Hash a password with a fresh random salt.
pub fn hash_password(password: &str, params: &PasswordParams) -> Result<String, HashError> {
    let mut salt = vec![0u8; params.salt_len];
    rand::rngs::OsRng.fill_bytes(&mut salt);

    let key = derive_key(
        password,
        &salt,
        params.time_cost,
        params.memory_kib,
        params.parallelism,
        params.key_len,
    )?;

    Ok(format!(
        "${ALGORITHM_ID}${VERSION_TAG}$t={},m={},p={}${}${}",
        params.time_cost,
        params.memory_kib,
        params.parallelism,
        STANDARD.encode(&salt),
        STANDARD.encode(&key),
    ))
}

/// Check a password against a stored hash.
///
/// `Ok(false)` means the password is wrong; `Err` means the stored string
/// could not be parsed. Callers fold both into the same rejection.
pub fn verify_password(password: &str, encoded: &str) -> Result<bool, HashError> {
    let stored = ParsedHash::parse(encoded)?;
    let computed = derive_key(
        password,
        &stored.salt,
        stored.time_cost,
        stored.memory_kib,
        stored.parallelism,
        stored.key.len(),
    )?;
    Ok(computed.ct_eq(&stored.key).into())
}

fn derive_key(
    password: &str,
    salt: &[u8],
    time_cost: u32,
    memory_kib: u32,
    parallelism: u32,
    key_len: usize,
) -> Result<Vec<u8>, HashError> {
    let params = Params::new(memory_kib, time_cost, parallelism, Some(key_len))
        .map_err(|e| HashError::Params(e.to_string()))?;
    let mut out = vec![0u8; key_len];
    Argon2::new(Algorithm::Argon2id, Version::V0x13, params)
        .hash_password_into(password.as_bytes(), salt, &mut out)
        .map_err(|e| HashError::Params(e.to_string()))?;
    Ok(out)
}

struct ParsedHash {
    time_cost: u32,
    memory_kib: u32,
    parallelism: u32,
    salt: Vec<u8>,
    key: Vec<u8>,
}

impl ParsedHash {
    fn parse(encoded: &str) -> Result<Self, HashError> {
        let mut fields = encoded.split('$');

        if fields.next() != Some("") {
            return Err(HashError::Malformed("missing leading separator"));
        }
        if fields.next() != Some(ALGORITHM_ID) {
            return Err(HashError::Unsupported);
        }
        if fields.next() != Some(VERSION_TAG) {
            return Err(HashError::Unsupported);
        }

        let costs = fields
            .next()
            .ok_or(HashError::Malformed("missing cost parameters"))?;
        let salt_b64 = fields.next().ok_or(HashError::Malformed("missing salt"))?;
        let key_b64 = fields.next().ok_or(HashError::Malformed("missing key"))?;
        if fields.next().is_some() {
            return Err(HashError::Malformed("trailing fields"));
        }

        let mut costs = costs.split(',');
        let time_cost = cost_field(costs.next(), "t=")?;
        let memory_kib = cost_field(costs.next(), "m=")?;
        let parallelism = cost_field(costs.next(), "p=")?;
        if costs.next().is_some() {
            return Err(HashError::Malformed("unexpected cost parameter"));
        }

        if !(1..=MAX_TIME_COST).contains(&time_cost)
            || !(1..=MAX_PARALLELISM).contains(&parallelism)
            || memory_kib > MAX_MEMORY_KIB
        {
            return Err(HashError::Malformed("cost parameter out of range"));
        }

        let salt = STANDARD
            .decode(salt_b64)
            .map_err(|_| HashError::Malformed("salt is not base64"))?;
        let key = STANDARD
            .decode(key_b64)
            .map_err(|_| HashError::Malformed("key is not base64"))?;

        Ok(Self {
            time_cost,
            memory_kib,
            parallelism,
            salt,
            key,
        })
    }
}

fn cost_field(field: Option<&str>, prefix: &str) -> Result<u32, HashError> {
    field
        .and_then(|f| f.strip_prefix(prefix))
        .filter(|v| !v.is_empty() && v.bytes().all(|b| b.is_ascii_digit()))
        .and_then(|v| v.parse().ok())
        .ok_or(HashError::Malformed("bad cost parameter"))
}
