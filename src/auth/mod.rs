//! Multi-device user authentication.
//!
//! Provides:
//! - Registration and login with Argon2id password hashes
//! - Short-lived HS512 access tokens bound to a session and device
//! - Rotating opaque refresh secrets (only their SHA-256 digest is stored)
//! - One session per (user, device), capped per user, SQLite-backed
//!
//! ## Design Decisions
//! - Access tokens are verified statelessly; bearer authentication then loads
//!   the session row so logout and revocation take effect immediately.
//! - Refresh rotation is a conditional update on the previous hash, which
//!   makes concurrent refreshes of the same secret yield a single winner.
//! - Capacity eviction and last-seen touches are best-effort and never fail
//!   the request that triggered them.

pub mod best_effort;
pub mod error;
pub mod models;
pub mod service;
pub mod session;
pub mod store;

pub use error::{AuthError, StoreError};
pub use models::{PublicUser, Role, Session, SessionView, User, UserStatus};
pub use service::{AuthResult, AuthService, LoginInput, RefreshInput, RegisterInput, RequestIdentity};
pub use session::{SessionManager, SessionSettings};
pub use store::{SessionStore, SqliteAuthStore, UserStore};
