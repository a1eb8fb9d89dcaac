//! User and session persistence.
//!
//! [`UserStore`] and [`SessionStore`] are the contracts the session controller
//! and the protocol service depend on. [`SqliteAuthStore`] implements both.
//!
//! Tables:
//! - `users`: id, email (unique), password_hash, display_name, role, status
//! - `sessions`: id, (user_id, device_id) unique, refresh_token_hash,
//!   ip/user-agent, created/last-seen/expiry timestamps (epoch millis)
//!
//! Lookups return `Ok(None)` when nothing matches so callers can tell a
//! missing row from a storage failure.

use super::error::StoreError;
use super::models::{Role, Session, User, UserStatus};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, OptionalExtension};
use std::path::Path;

pub trait UserStore: Send + Sync {
    /// Insert a new user. A duplicate email is [`StoreError::Conflict`].
    fn create_user(&self, user: &User) -> Result<(), StoreError>;

    fn find_user_by_email(&self, email: &str) -> Result<Option<User>, StoreError>;

    fn get_user_by_id(&self, user_id: &str) -> Result<Option<User>, StoreError>;

    fn update_user_status(&self, user_id: &str, status: UserStatus) -> Result<(), StoreError>;
}

pub trait SessionStore: Send + Sync {
    /// Create-or-replace keyed on `(user_id, device_id)`. An existing row for
    /// the device takes every field of `session`, including its new ID.
    fn create_session(&self, session: &Session) -> Result<(), StoreError>;

    fn count_sessions_by_user(&self, user_id: &str) -> Result<usize, StoreError>;

    /// Delete all but the `keep` most recently seen sessions. Returns the
    /// number of rows removed.
    fn delete_oldest_sessions(&self, user_id: &str, keep: usize) -> Result<usize, StoreError>;

    fn get_session_by_id(&self, session_id: &str) -> Result<Option<Session>, StoreError>;

    fn find_session_by_refresh_hash(
        &self,
        user_id: &str,
        refresh_hash: &str,
    ) -> Result<Option<Session>, StoreError>;

    /// Swap the refresh hash only if the row still holds `current_hash`.
    /// Returns `false` when another caller rotated it first.
    fn rotate_refresh_hash(
        &self,
        session_id: &str,
        current_hash: &str,
        new_hash: &str,
        new_expires_at: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// [`StoreError::NotFound`] when no row has this ID.
    fn delete_session_by_id(&self, session_id: &str) -> Result<(), StoreError>;

    /// Returns whether a row was removed.
    fn delete_session_by_device(&self, user_id: &str, device_id: &str) -> Result<bool, StoreError>;

    /// All sessions for a user, most recently seen first.
    fn list_sessions_by_user(&self, user_id: &str) -> Result<Vec<Session>, StoreError>;

    /// Bump last-seen; empty `ip` / `user_agent` keep the stored values.
    fn touch_session(&self, session_id: &str, ip: &str, user_agent: &str) -> Result<(), StoreError>;
}

const SESSION_COLUMNS: &str = "id, user_id, device_id, device_name, refresh_token_hash, \
     ip_address, user_agent, created_at, last_seen_at, expires_at";

const USER_COLUMNS: &str =
    "id, email, password_hash, display_name, role, status, created_at, updated_at";

/// SQLite-backed user and session store.
pub struct SqliteAuthStore {
    conn: Mutex<rusqlite::Connection>,
}

impl SqliteAuthStore {
    /// Open (or create) the auth database at the given path.
    pub fn open(db_path: &Path) -> Result<Self, StoreError> {
        let conn = rusqlite::Connection::open(db_path)?;

        // WAL mode for concurrent reads + crash safety
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )?;

        Self::from_connection(conn)
    }

    fn from_connection(conn: rusqlite::Connection) -> Result<Self, StoreError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY,
                email TEXT NOT NULL UNIQUE,
                password_hash TEXT NOT NULL,
                display_name TEXT NOT NULL,
                role TEXT NOT NULL,
                status TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS sessions (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                device_id TEXT NOT NULL,
                device_name TEXT NOT NULL,
                refresh_token_hash TEXT NOT NULL,
                ip_address TEXT NOT NULL DEFAULT '',
                user_agent TEXT NOT NULL DEFAULT '',
                created_at INTEGER NOT NULL,
                last_seen_at INTEGER NOT NULL,
                expires_at INTEGER NOT NULL,
                UNIQUE (user_id, device_id)
            );
            CREATE INDEX IF NOT EXISTS idx_sessions_refresh ON sessions(user_id, refresh_token_hash);
            CREATE INDEX IF NOT EXISTS idx_sessions_last_seen ON sessions(user_id, last_seen_at);",
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

impl UserStore for SqliteAuthStore {
    fn create_user(&self, user: &User) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO users (id, email, password_hash, display_name, role, status, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                user.id,
                user.email,
                user.password_hash,
                user.display_name,
                user.role.as_str(),
                user.status.as_str(),
                user.created_at.timestamp_millis(),
                user.updated_at.timestamp_millis(),
            ],
        )?;
        Ok(())
    }

    fn find_user_by_email(&self, email: &str) -> Result<Option<User>, StoreError> {
        let conn = self.conn.lock();
        let user = conn
            .query_row(
                &format!("SELECT {USER_COLUMNS} FROM users WHERE email = ?1"),
                params![email],
                user_from_row,
            )
            .optional()?;
        Ok(user)
    }

    fn get_user_by_id(&self, user_id: &str) -> Result<Option<User>, StoreError> {
        let conn = self.conn.lock();
        let user = conn
            .query_row(
                &format!("SELECT {USER_COLUMNS} FROM users WHERE id = ?1"),
                params![user_id],
                user_from_row,
            )
            .optional()?;
        Ok(user)
    }

    fn update_user_status(&self, user_id: &str, status: UserStatus) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        let updated = conn.execute(
            "UPDATE users SET status = ?2, updated_at = ?3 WHERE id = ?1",
            params![user_id, status.as_str(), Utc::now().timestamp_millis()],
        )?;
        if updated == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }
}

impl SessionStore for SqliteAuthStore {
    fn create_session(&self, session: &Session) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO sessions (id, user_id, device_id, device_name, refresh_token_hash,
                                   ip_address, user_agent, created_at, last_seen_at, expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
             ON CONFLICT(user_id, device_id) DO UPDATE SET
                id = excluded.id,
                device_name = excluded.device_name,
                refresh_token_hash = excluded.refresh_token_hash,
                ip_address = excluded.ip_address,
                user_agent = excluded.user_agent,
                created_at = excluded.created_at,
                last_seen_at = excluded.last_seen_at,
                expires_at = excluded.expires_at",
            params![
                session.id,
                session.user_id,
                session.device_id,
                session.device_name,
                session.refresh_token_hash,
                session.ip_address,
                session.user_agent,
                session.created_at.timestamp_millis(),
                session.last_seen_at.timestamp_millis(),
                session.expires_at.timestamp_millis(),
            ],
        )?;
        Ok(())
    }

    fn count_sessions_by_user(&self, user_id: &str) -> Result<usize, StoreError> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM sessions WHERE user_id = ?1",
            params![user_id],
            |row| row.get(0),
        )?;
        Ok(usize::try_from(count).unwrap_or_default())
    }

    fn delete_oldest_sessions(&self, user_id: &str, keep: usize) -> Result<usize, StoreError> {
        let keep = i64::try_from(keep).unwrap_or(i64::MAX);
        let conn = self.conn.lock();
        // rowid breaks last-seen ties in favour of the newer row
        let deleted = conn.execute(
            "DELETE FROM sessions WHERE id IN (
                SELECT id FROM sessions
                WHERE user_id = ?1
                ORDER BY last_seen_at DESC, rowid DESC
                LIMIT -1 OFFSET ?2
             )",
            params![user_id, keep],
        )?;
        Ok(deleted)
    }

    fn get_session_by_id(&self, session_id: &str) -> Result<Option<Session>, StoreError> {
        let conn = self.conn.lock();
        let session = conn
            .query_row(
                &format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE id = ?1"),
                params![session_id],
                session_from_row,
            )
            .optional()?;
        Ok(session)
    }

    fn find_session_by_refresh_hash(
        &self,
        user_id: &str,
        refresh_hash: &str,
    ) -> Result<Option<Session>, StoreError> {
        let conn = self.conn.lock();
        let session = conn
            .query_row(
                &format!(
                    "SELECT {SESSION_COLUMNS} FROM sessions
                     WHERE user_id = ?1 AND refresh_token_hash = ?2"
                ),
                params![user_id, refresh_hash],
                session_from_row,
            )
            .optional()?;
        Ok(session)
    }

    fn rotate_refresh_hash(
        &self,
        session_id: &str,
        current_hash: &str,
        new_hash: &str,
        new_expires_at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let conn = self.conn.lock();
        let updated = conn.execute(
            "UPDATE sessions
             SET refresh_token_hash = ?3, expires_at = ?4, last_seen_at = ?5
             WHERE id = ?1 AND refresh_token_hash = ?2",
            params![
                session_id,
                current_hash,
                new_hash,
                new_expires_at.timestamp_millis(),
                Utc::now().timestamp_millis(),
            ],
        )?;
        Ok(updated == 1)
    }

    fn delete_session_by_id(&self, session_id: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        let deleted = conn.execute("DELETE FROM sessions WHERE id = ?1", params![session_id])?;
        if deleted == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    fn delete_session_by_device(&self, user_id: &str, device_id: &str) -> Result<bool, StoreError> {
        let conn = self.conn.lock();
        let deleted = conn.execute(
            "DELETE FROM sessions WHERE user_id = ?1 AND device_id = ?2",
            params![user_id, device_id],
        )?;
        Ok(deleted > 0)
    }

    fn list_sessions_by_user(&self, user_id: &str) -> Result<Vec<Session>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {SESSION_COLUMNS} FROM sessions
             WHERE user_id = ?1 ORDER BY last_seen_at DESC, rowid DESC"
        ))?;
        let sessions = stmt
            .query_map(params![user_id], session_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(sessions)
    }

    fn touch_session(&self, session_id: &str, ip: &str, user_agent: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE sessions
             SET last_seen_at = ?2,
                 ip_address = COALESCE(NULLIF(?3, ''), ip_address),
                 user_agent = COALESCE(NULLIF(?4, ''), user_agent)
             WHERE id = ?1",
            params![session_id, Utc::now().timestamp_millis(), ip, user_agent],
        )?;
        Ok(())
    }
}

// ── Row Mapping ─────────────────────────────────────────────────────

fn millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

fn parse_column<T>(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let raw: String = row.get(idx)?;
    raw.parse().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn user_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<User> {
    Ok(User {
        id: row.get(0)?,
        email: row.get(1)?,
        password_hash: row.get(2)?,
        display_name: row.get(3)?,
        role: parse_column::<Role>(row, 4)?,
        status: parse_column::<UserStatus>(row, 5)?,
        created_at: millis(row.get(6)?),
        updated_at: millis(row.get(7)?),
    })
}

fn session_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Session> {
    Ok(Session {
        id: row.get(0)?,
        user_id: row.get(1)?,
        device_id: row.get(2)?,
        device_name: row.get(3)?,
        refresh_token_hash: row.get(4)?,
        ip_address: row.get(5)?,
        user_agent: row.get(6)?,
        created_at: millis(row.get(7)?),
        last_seen_at: millis(row.get(8)?),
        expires_at: millis(row.get(9)?),
    })
}

// ── Tests ───────────────────────────────────────────────────────────
