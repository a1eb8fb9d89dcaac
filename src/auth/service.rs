//! Register, login, refresh, logout and multi-device session management.
//!
//! Every caller-facing operation returns [`AuthError`]. Credential checks are
//! folded into [`AuthError::InvalidCredentials`] regardless of which step
//! failed.

use super::error::{AuthError, StoreError};
use super::models::{PublicUser, Role, SessionView, User, UserStatus};
use super::session::{DeviceInfo, IssuedSession, SessionManager};
use super::store::UserStore;
use crate::security::password::{hash_password, verify_password, PasswordParams};
use crate::security::token::AccessClaims;
use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;

const MIN_PASSWORD_CHARS: usize = 8;
const REGISTER_DEVICE_NAME: &str = "New Device";
const DEFAULT_DEVICE_NAME: &str = "Unknown Device";

#[derive(Debug, Clone, Default)]
pub struct RegisterInput {
    pub email: String,
    pub password: String,
    pub display_name: String,
    pub ip_address: String,
    pub user_agent: String,
}

#[derive(Debug, Clone, Default)]
pub struct LoginInput {
    pub email: String,
    pub password: String,
    pub device_id: Option<String>,
    pub device_name: Option<String>,
    pub ip_address: String,
    pub user_agent: String,
}

#[derive(Debug, Clone, Default)]
pub struct RefreshInput {
    pub user_id: String,
    pub device_id: String,
    pub refresh_token: String,
}

/// Credentials returned by register, login and refresh.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthResult {
    pub access_token: String,
    pub refresh_token: String,
    /// Access token lifetime in seconds.
    pub expires_in: u64,
    pub device_id: String,
    pub user: PublicUser,
}

/// The verified caller of a bearer-protected request.
#[derive(Debug, Clone)]
pub struct RequestIdentity {
    pub claims: AccessClaims,
    pub user: User,
}

pub struct AuthService {
    users: Arc<dyn UserStore>,
    sessions: SessionManager,
    password_params: PasswordParams,
    /// Verified against when the email is unknown so both paths cost the same.
    dummy_hash: String,
}

impl AuthService {
    pub fn new(
        users: Arc<dyn UserStore>,
        sessions: SessionManager,
        password_params: PasswordParams,
    ) -> Result<Self, AuthError> {
        let dummy_hash = hash_password("timing-equalizer", &password_params)
            .map_err(|e| AuthError::Internal(e.to_string()))?;
        Ok(Self {
            users,
            sessions,
            password_params,
            dummy_hash,
        })
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    fn issue_result(&self, issued: IssuedSession, user: &User) -> AuthResult {
        AuthResult {
            access_token: issued.access_token,
            refresh_token: issued.refresh_token,
            expires_in: self.sessions.tokens().ttl().as_secs(),
            device_id: issued.session.device_id,
            user: PublicUser::from(user),
        }
    }

    pub fn register(&self, input: RegisterInput) -> Result<AuthResult, AuthError> {
        let email = normalize_email(&input.email);
        let display_name = input.display_name.trim();
        validate_registration(&email, &input.password, display_name)?;

        if self.users.find_user_by_email(&email)?.is_some() {
            return Err(AuthError::EmailTaken);
        }

        let password_hash = hash_password(&input.password, &self.password_params)
            .map_err(|e| AuthError::Internal(e.to_string()))?;
        let now = Utc::now();
        let user = User {
            id: uuid::Uuid::new_v4().to_string(),
            email,
            password_hash,
            display_name: display_name.to_string(),
            role: Role::User,
            status: UserStatus::Active,
            created_at: now,
            updated_at: now,
        };

        match self.users.create_user(&user) {
            Ok(()) => {}
            // lost a race with a concurrent registration
            Err(StoreError::Conflict(_)) => return Err(AuthError::EmailTaken),
            Err(e) => return Err(e.into()),
        }
        tracing::info!(user_id = %user.id, "user registered");

        let device_id = uuid::Uuid::new_v4().to_string();
        let issued = self.sessions.create_or_replace(
            &user,
            &DeviceInfo {
                device_id: &device_id,
                device_name: REGISTER_DEVICE_NAME,
                ip_address: &input.ip_address,
                user_agent: &input.user_agent,
            },
        )?;
        Ok(self.issue_result(issued, &user))
    }

    pub fn login(&self, input: LoginInput) -> Result<AuthResult, AuthError> {
        let email = normalize_email(&input.email);

        let Some(user) = self.users.find_user_by_email(&email)? else {
            let _ = verify_password(&input.password, &self.dummy_hash);
            return Err(AuthError::InvalidCredentials);
        };

        match verify_password(&input.password, &user.password_hash) {
            Ok(true) => {}
            Ok(false) => return Err(AuthError::InvalidCredentials),
            Err(e) => {
                tracing::warn!(user_id = %user.id, error = %e, "stored credential is unreadable");
                return Err(AuthError::InvalidCredentials);
            }
        }

        if user.status != UserStatus::Active {
            return Err(AuthError::AccountSuspended);
        }

        let device_id = non_empty(input.device_id)
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let device_name =
            non_empty(input.device_name).unwrap_or_else(|| DEFAULT_DEVICE_NAME.to_string());

        let issued = self.sessions.create_or_replace(
            &user,
            &DeviceInfo {
                device_id: &device_id,
                device_name: &device_name,
                ip_address: &input.ip_address,
                user_agent: &input.user_agent,
            },
        )?;
        Ok(self.issue_result(issued, &user))
    }

    pub fn refresh(&self, input: RefreshInput) -> Result<AuthResult, AuthError> {
        if input.user_id.is_empty() || input.device_id.is_empty() || input.refresh_token.is_empty() {
            return Err(AuthError::InvalidCredentials);
        }
        let Some(user) = self.users.get_user_by_id(&input.user_id)? else {
            return Err(AuthError::InvalidCredentials);
        };
        if user.status != UserStatus::Active {
            return Err(AuthError::AccountSuspended);
        }

        let issued = self
            .sessions
            .refresh(&user, &input.device_id, &input.refresh_token)?;
        Ok(self.issue_result(issued, &user))
    }

    /// End the session bound to `device_id`. Idempotent.
    pub fn logout(&self, user_id: &str, device_id: &str) -> Result<(), AuthError> {
        if self.sessions.revoke_by_device(user_id, device_id)? {
            tracing::info!(user_id, device_id, "logged out");
        }
        Ok(())
    }

    pub fn list_sessions(&self, user_id: &str, current_session_id: &str) -> Result<Vec<SessionView>, AuthError> {
        Ok(self
            .sessions
            .list(user_id)?
            .into_iter()
            .map(|s| SessionView::from_session(s, current_session_id))
            .collect())
    }

    /// Revoke another device's session. A session cannot revoke its own
    /// device here; that is what logout is for. Returns whether a session
    /// was removed.
    pub fn revoke_session(&self, identity: &RequestIdentity, device_id: &str) -> Result<bool, AuthError> {
        let device_id = device_id.trim();
        if device_id.is_empty() {
            return Err(AuthError::InvalidInput("device id required".into()));
        }
        if device_id == identity.claims.device_id {
            return Err(AuthError::CannotRevokeCurrentDevice);
        }
        let removed = self.sessions.revoke_by_device(&identity.user.id, device_id)?;
        if removed {
            tracing::info!(user_id = %identity.user.id, device_id, "session revoked");
        }
        Ok(removed)
    }

    /// Resolve an `Authorization` header into a verified identity and record
    /// activity on its session.
    pub fn authenticate_bearer(
        &self,
        authorization: Option<&str>,
        ip: &str,
        user_agent: &str,
    ) -> Result<RequestIdentity, AuthError> {
        let token = bearer_token(authorization).ok_or(AuthError::Unauthenticated("missing_token"))?;
        let claims = self
            .sessions
            .tokens()
            .verify(token)
            .map_err(|_| AuthError::Unauthenticated("invalid_token"))?;

        let session = self
            .sessions
            .get(&claims.session_id)?
            .ok_or(AuthError::Unauthenticated("session_not_found"))?;
        if session.user_id != claims.user_id || session.device_id != claims.device_id {
            return Err(AuthError::Unauthenticated("session_mismatch"));
        }

        let user = self
            .users
            .get_user_by_id(&claims.user_id)?
            .ok_or(AuthError::Unauthenticated("user_not_found"))?;
        if user.status != UserStatus::Active {
            return Err(AuthError::AccountSuspended);
        }

        self.sessions.touch(&session.id, ip, user_agent);
        Ok(RequestIdentity { claims, user })
    }

    pub fn me(&self, identity: &RequestIdentity) -> PublicUser {
        PublicUser::from(&identity.user)
    }

    /// Administrative status change. Suspension takes effect on the user's
    /// next bearer-authenticated request or refresh.
    pub fn set_user_status(&self, user_id: &str, status: UserStatus) -> Result<(), AuthError> {
        self.users.update_user_status(user_id, status)?;
        tracing::info!(user_id, status = status.as_str(), "user status changed");
        Ok(())
    }
}

fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn validate_registration(email: &str, password: &str, display_name: &str) -> Result<(), AuthError> {
    if email.is_empty() || !email.contains('@') {
        return Err(AuthError::InvalidInput("a valid email is required".into()));
    }
    if password.chars().count() < MIN_PASSWORD_CHARS {
        return Err(AuthError::InvalidInput(format!(
            "password must be at least {MIN_PASSWORD_CHARS} characters"
        )));
    }
    if display_name.is_empty() {
        return Err(AuthError::InvalidInput("display name is required".into()));
    }
    Ok(())
}

/// Extract the token from `Bearer <token>`; the scheme is case-insensitive.
pub fn bearer_token(header: Option<&str>) -> Option<&str> {
    let value = header?.trim();
    let (scheme, token) = value.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    (!token.is_empty()).then_some(token)
}
