//! Cryptographic primitives for credentials, tokens and request signing.
//!
//! - `password`: Argon2id hashing with self-describing encoded hashes
//! - `token`: HS512 access tokens
//! - `refresh`: opaque refresh secrets and their storage digests
//! - `signature`: HMAC-SHA256 request signing gate with replay protection

pub mod password;
pub mod refresh;
pub mod signature;
pub mod token;

pub use password::{hash_password, verify_password, HashError, PasswordParams};
pub use signature::{RequestSignatureValidator, SignatureHeaders, SignedRequest, SignedRequestParts};
pub use token::{AccessClaims, AccessTokenCodec, TokenError, TokenSubject};
