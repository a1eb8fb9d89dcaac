//! Session lifecycle: create-or-replace, refresh rotation, touch, revoke.
//!
//! A session moves `created -> active -> {rotated | revoked | expired}`.
//! Expiry is enforced lazily: an expired row is removed the next time its
//! refresh secret is presented, and listings filter it out.

use super::best_effort::BestEffort;
use super::error::AuthError;
use super::models::{Session, User};
use super::store::SessionStore;
use crate::security::refresh;
use crate::security::token::{AccessTokenCodec, TokenSubject};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub refresh_ttl: Duration,
    pub max_sessions: usize,
    pub refresh_token_bytes: usize,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            refresh_ttl: Duration::from_secs(30 * 24 * 60 * 60),
            max_sessions: 10,
            refresh_token_bytes: refresh::DEFAULT_REFRESH_TOKEN_BYTES,
        }
    }
}

/// Device metadata supplied at login.
#[derive(Debug, Clone, Copy)]
pub struct DeviceInfo<'a> {
    pub device_id: &'a str,
    pub device_name: &'a str,
    pub ip_address: &'a str,
    pub user_agent: &'a str,
}

/// A persisted session plus the credentials handed to the client.
/// `refresh_token` is the plaintext secret and is never stored.
#[derive(Debug, Clone)]
pub struct IssuedSession {
    pub session: Session,
    pub access_token: String,
    pub refresh_token: String,
}

pub struct SessionManager {
    store: Arc<dyn SessionStore>,
    tokens: AccessTokenCodec,
    settings: SessionSettings,
}

impl SessionManager {
    pub fn new(store: Arc<dyn SessionStore>, tokens: AccessTokenCodec, settings: SessionSettings) -> Self {
        Self {
            store,
            tokens,
            settings,
        }
    }

    pub fn tokens(&self) -> &AccessTokenCodec {
        &self.tokens
    }

    fn expiry_from(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        chrono::Duration::from_std(self.settings.refresh_ttl)
            .ok()
            .and_then(|ttl| now.checked_add_signed(ttl))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    fn sign_for(&self, user: &User, session: &Session) -> Result<String, AuthError> {
        self.tokens
            .issue(&TokenSubject {
                user_id: &user.id,
                session_id: &session.id,
                device_id: &session.device_id,
                role: user.role.as_str(),
                scopes: None,
            })
            .map_err(|e| AuthError::Internal(e.to_string()))
    }

    /// Start a fresh session for `device`, replacing any existing session on
    /// that device, then trim the user's sessions to capacity.
    pub fn create_or_replace(&self, user: &User, device: &DeviceInfo<'_>) -> Result<IssuedSession, AuthError> {
        let (refresh_token, refresh_hash) = refresh::generate(self.settings.refresh_token_bytes);
        let now = Utc::now();
        let session = Session {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user.id.clone(),
            device_id: device.device_id.to_string(),
            device_name: device.device_name.to_string(),
            refresh_token_hash: refresh_hash,
            ip_address: device.ip_address.to_string(),
            user_agent: device.user_agent.to_string(),
            created_at: now,
            last_seen_at: now,
            expires_at: self.expiry_from(now),
        };

        let access_token = self.sign_for(user, &session)?;
        self.store.create_session(&session)?;

        self.enforce_capacity(&user.id)
            .best_effort("enforce_session_capacity");

        tracing::debug!(
            user_id = %user.id,
            device_id = %session.device_id,
            session_id = %session.id,
            "session created"
        );

        Ok(IssuedSession {
            session,
            access_token,
            refresh_token,
        })
    }

    /// Trim the user's sessions to the configured maximum, keeping the most
    /// recently seen.
    pub fn enforce_capacity(&self, user_id: &str) -> Result<usize, AuthError> {
        let count = self.store.count_sessions_by_user(user_id)?;
        if count <= self.settings.max_sessions {
            return Ok(0);
        }
        let evicted = self
            .store
            .delete_oldest_sessions(user_id, self.settings.max_sessions)?;
        if evicted > 0 {
            tracing::info!(user_id, evicted, "evicted sessions over capacity");
        }
        Ok(evicted)
    }

    /// Exchange a refresh secret for a new access token and a new secret.
    ///
    /// Every failure on the credential path is [`AuthError::InvalidCredentials`].
    /// The stored hash is swapped by a conditional update as the final step,
    /// so concurrent callers presenting the same secret see exactly one
    /// winner, and nothing is rotated unless the response can be built.
    pub fn refresh(&self, user: &User, device_id: &str, presented: &str) -> Result<IssuedSession, AuthError> {
        let presented_hash = refresh::hash_of(presented);
        let Some(mut session) = self
            .store
            .find_session_by_refresh_hash(&user.id, &presented_hash)?
        else {
            return Err(AuthError::InvalidCredentials);
        };

        if session.device_id != device_id {
            tracing::warn!(user_id = %user.id, "refresh presented from a different device");
            return Err(AuthError::InvalidCredentials);
        }

        let now = Utc::now();
        if session.is_expired_at(now) {
            self.store
                .delete_session_by_id(&session.id)
                .best_effort("delete_expired_session");
            return Err(AuthError::InvalidCredentials);
        }

        let (refresh_token, new_hash) = refresh::generate(self.settings.refresh_token_bytes);
        let expires_at = self.expiry_from(now);
        let access_token = self.sign_for(user, &session)?;

        if !self
            .store
            .rotate_refresh_hash(&session.id, &presented_hash, &new_hash, expires_at)?
        {
            return Err(AuthError::InvalidCredentials);
        }

        session.refresh_token_hash = new_hash;
        session.expires_at = expires_at;
        session.last_seen_at = now;

        Ok(IssuedSession {
            session,
            access_token,
            refresh_token,
        })
    }

    /// Record activity on a session. Never fails the caller.
    pub fn touch(&self, session_id: &str, ip: &str, user_agent: &str) {
        self.store
            .touch_session(session_id, ip, user_agent)
            .best_effort("touch_session");
    }

    /// Delete the session bound to `device_id`. Returns whether one existed.
    pub fn revoke_by_device(&self, user_id: &str, device_id: &str) -> Result<bool, AuthError> {
        Ok(self.store.delete_session_by_device(user_id, device_id)?)
    }

    /// Live sessions for a user, most recently seen first.
    pub fn list(&self, user_id: &str) -> Result<Vec<Session>, AuthError> {
        let now = Utc::now();
        let mut sessions = self.store.list_sessions_by_user(user_id)?;
        sessions.retain(|s| !s.is_expired_at(now));
        sessions.sort_by(|a, b| b.last_seen_at.cmp(&a.last_seen_at));
        Ok(sessions)
    }

    pub fn get(&self, session_id: &str) -> Result<Option<Session>, AuthError> {
        Ok(self.store.get_session_by_id(session_id)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::models::{Role, UserStatus};
    use crate::auth::store::failing::EvictAndTouchDown;
    use crate::auth::store::{SqliteAuthStore, UserStore};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    const SECRET: &str = "session-test-secret-0123456789abcdef";

    fn setup(settings: SessionSettings) -> (TempDir, Arc<SqliteAuthStore>, SessionManager, User) {
        let tmp = TempDir::new().unwrap();
        let store = Arc::new(SqliteAuthStore::open(&tmp.path().join("auth.db")).unwrap());
        let now = Utc::now();
        let user = User {
            id: "u1".into(),
            email: "a@x.com".into(),
            password_hash: "unused".into(),
            display_name: "Ann".into(),
            role: Role::User,
            status: UserStatus::Active,
            created_at: now,
            updated_at: now,
        };
        store.create_user(&user).unwrap();
        let manager = SessionManager::new(
            store.clone(),
            AccessTokenCodec::new(SECRET, Duration::from_secs(900)),
            settings,
        );
        (tmp, store, manager, user)
    }

    fn device(id: &str) -> DeviceInfo<'_> {
        DeviceInfo {
            device_id: id,
            device_name: "Phone",
            ip_address: "10.0.0.1",
            user_agent: "ua/1",
        }
    }

    #[test]
    fn created_session_token_is_bound_to_session_and_device() {
        let (_tmp, store, manager, user) = setup(SessionSettings::default());
        let issued = manager.create_or_replace(&user, &device("d1")).unwrap();

        let claims = manager.tokens().verify(&issued.access_token).unwrap();
        assert_eq!(claims.session_id, issued.session.id);
        assert_eq!(claims.device_id, "d1");
        assert_eq!(claims.role, "user");

        let stored = store.get_session_by_id(&issued.session.id).unwrap().unwrap();
        assert_eq!(stored.refresh_token_hash, refresh::hash_of(&issued.refresh_token));
        assert_ne!(stored.refresh_token_hash, issued.refresh_token);
    }

    #[test]
    fn relogin_on_same_device_replaces_session_id() {
        let (_tmp, store, manager, user) = setup(SessionSettings::default());
        let first = manager.create_or_replace(&user, &device("d1")).unwrap();
        let second = manager.create_or_replace(&user, &device("d1")).unwrap();

        assert_ne!(first.session.id, second.session.id);
        assert_eq!(store.count_sessions_by_user("u1").unwrap(), 1);
        assert!(store.get_session_by_id(&first.session.id).unwrap().is_none());
    }

    #[test]
    fn capacity_keeps_most_recently_seen() {
        let max = 4;
        let (_tmp, _store, manager, user) = setup(SessionSettings {
            max_sessions: max,
            ..SessionSettings::default()
        });

        let devices: Vec<String> = (0..max + 3).map(|i| format!("d{i}")).collect();
        for id in &devices {
            manager.create_or_replace(&user, &device(id)).unwrap();
        }

        let remaining: Vec<String> = manager
            .list("u1")
            .unwrap()
            .into_iter()
            .map(|s| s.device_id)
            .collect();
        assert_eq!(remaining.len(), max);
        for id in &devices[3..] {
            assert!(remaining.contains(id), "expected {id} to survive eviction");
        }
    }

    #[test]
    fn refresh_rotates_secret() {
        let (_tmp, _store, manager, user) = setup(SessionSettings::default());
        let issued = manager.create_or_replace(&user, &device("d1")).unwrap();

        let rotated = manager.refresh(&user, "d1", &issued.refresh_token).unwrap();
        assert_eq!(rotated.session.id, issued.session.id);
        assert_ne!(rotated.refresh_token, issued.refresh_token);

        assert!(matches!(
            manager.refresh(&user, "d1", &issued.refresh_token),
            Err(AuthError::InvalidCredentials)
        ));
        let again = manager.refresh(&user, "d1", &rotated.refresh_token).unwrap();
        assert!(matches!(
            manager.refresh(&user, "d1", &rotated.refresh_token),
            Err(AuthError::InvalidCredentials)
        ));
        assert_ne!(again.refresh_token, rotated.refresh_token);
    }

    #[test]
    fn refresh_from_other_device_is_rejected() {
        let (_tmp, _store, manager, user) = setup(SessionSettings::default());
        let issued = manager.create_or_replace(&user, &device("d1")).unwrap();

        assert!(matches!(
            manager.refresh(&user, "d2", &issued.refresh_token),
            Err(AuthError::InvalidCredentials)
        ));
        // still valid from the bound device
        manager.refresh(&user, "d1", &issued.refresh_token).unwrap();
    }

    #[test]
    fn expired_session_is_deleted_on_refresh() {
        let (_tmp, store, manager, user) = setup(SessionSettings {
            refresh_ttl: Duration::ZERO,
            ..SessionSettings::default()
        });
        let issued = manager.create_or_replace(&user, &device("d1")).unwrap();

        assert!(matches!(
            manager.refresh(&user, "d1", &issued.refresh_token),
            Err(AuthError::InvalidCredentials)
        ));
        assert!(store.get_session_by_id(&issued.session.id).unwrap().is_none());
    }

    #[test]
    fn concurrent_refresh_has_single_winner() {
        let (_tmp, _store, manager, user) = setup(SessionSettings::default());
        let issued = manager.create_or_replace(&user, &device("d1")).unwrap();
        let wins = AtomicUsize::new(0);
        let rejections = AtomicUsize::new(0);

        std::thread::scope(|scope| {
            for _ in 0..8 {
                scope.spawn(|| match manager.refresh(&user, "d1", &issued.refresh_token) {
                    Ok(_) => {
                        wins.fetch_add(1, Ordering::SeqCst);
                    }
                    Err(AuthError::InvalidCredentials) => {
                        rejections.fetch_add(1, Ordering::SeqCst);
                    }
                    Err(other) => panic!("unexpected error: {other}"),
                });
            }
        });

        assert_eq!(wins.load(Ordering::SeqCst), 1);
        assert_eq!(rejections.load(Ordering::SeqCst), 7);
    }

    #[test]
    fn revoke_by_device_removes_only_that_device() {
        let (_tmp, _store, manager, user) = setup(SessionSettings::default());
        manager.create_or_replace(&user, &device("d1")).unwrap();
        manager.create_or_replace(&user, &device("d2")).unwrap();

        assert!(manager.revoke_by_device("u1", "d1").unwrap());
        assert!(!manager.revoke_by_device("u1", "d1").unwrap());
        let left: Vec<String> = manager.list("u1").unwrap().into_iter().map(|s| s.device_id).collect();
        assert_eq!(left, vec!["d2".to_string()]);
    }

    #[test]
    fn listing_hides_expired_sessions() {
        let (_tmp, _store, manager, user) = setup(SessionSettings {
            refresh_ttl: Duration::ZERO,
            ..SessionSettings::default()
        });
        manager.create_or_replace(&user, &device("d1")).unwrap();
        assert!(manager.list("u1").unwrap().is_empty());
    }

    #[test]
    fn eviction_failure_does_not_fail_login() {
        let (_tmp, store, _manager, user) = setup(SessionSettings::default());
        let manager = SessionManager::new(
            Arc::new(EvictAndTouchDown { inner: store.clone() }),
            AccessTokenCodec::new(SECRET, Duration::from_secs(900)),
            SessionSettings {
                max_sessions: 1,
                ..SessionSettings::default()
            },
        );

        manager.create_or_replace(&user, &device("d1")).unwrap();
        let second = manager.create_or_replace(&user, &device("d2")).unwrap();
        assert!(matches!(
            manager.enforce_capacity("u1"),
            Err(AuthError::StorageUnavailable(_))
        ));

        assert_eq!(second.session.device_id, "d2");
        assert_eq!(store.count_sessions_by_user("u1").unwrap(), 2);
        manager.touch(&second.session.id, "10.0.0.9", "ua/2");
    }
}
