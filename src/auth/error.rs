//! Error taxonomy for authentication, sessions and the signing gate.

use axum::http::StatusCode;

/// Failures reported by the user/session store and the nonce cache.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("record not found")]
    NotFound,
    #[error("unique constraint violated: {0}")]
    Conflict(String),
    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        match e {
            rusqlite::Error::QueryReturnedNoRows => Self::NotFound,
            rusqlite::Error::SqliteFailure(err, msg)
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Self::Conflict(msg.unwrap_or_else(|| err.to_string()))
            }
            other => Self::Unavailable(other.to_string()),
        }
    }
}

/// Outcome categories surfaced to the HTTP boundary.
///
/// Credential failures are deliberately coarse: a bad email, a bad password,
/// a rotated refresh secret and a device mismatch all become
/// [`AuthError::InvalidCredentials`].
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("invalid credentials")]
    InvalidCredentials,
    #[error("account suspended")]
    AccountSuspended,
    #[error("email already registered")]
    EmailTaken,
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("unauthenticated: {0}")]
    Unauthenticated(&'static str),
    #[error("a session cannot revoke its own device")]
    CannotRevokeCurrentDevice,
    #[error("request signature required")]
    SignatureRequired,
    #[error("request timestamp is not RFC 3339")]
    InvalidTimestamp,
    #[error("request timestamp outside the accepted window")]
    RequestExpired,
    #[error("request signature mismatch")]
    InvalidSignature,
    #[error("request nonce already used")]
    ReplayDetected,
    #[error("storage unavailable")]
    StorageUnavailable(#[from] StoreError),
    #[error("request cancelled")]
    Cancelled,
    #[error("internal error: {0}")]
    Internal(String),
}

impl AuthError {
    /// Stable machine-readable code returned to clients.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidCredentials => "invalid_credentials",
            Self::AccountSuspended => "account_suspended",
            Self::EmailTaken => "email_taken",
            Self::InvalidInput(_) => "invalid_input",
            Self::Unauthenticated(reason) => *reason,
            Self::CannotRevokeCurrentDevice => "cannot_revoke_current_device",
            Self::SignatureRequired => "signature_required",
            Self::InvalidTimestamp => "invalid_date",
            Self::RequestExpired => "request_expired",
            Self::InvalidSignature => "invalid_signature",
            Self::ReplayDetected => "replay_detected",
            Self::StorageUnavailable(_) => "service_unavailable",
            Self::Cancelled => "request_cancelled",
            Self::Internal(_) => "internal_error",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidInput(_) | Self::CannotRevokeCurrentDevice => StatusCode::BAD_REQUEST,
            Self::AccountSuspended => StatusCode::FORBIDDEN,
            Self::EmailTaken => StatusCode::CONFLICT,
            Self::InvalidCredentials
            | Self::Unauthenticated(_)
            | Self::SignatureRequired
            | Self::InvalidTimestamp
            | Self::RequestExpired
            | Self::InvalidSignature
            | Self::ReplayDetected => StatusCode::UNAUTHORIZED,
            Self::StorageUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            // nginx's "client closed request"
            Self::Cancelled => {
                StatusCode::from_u16(499).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
            }
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Signing-gate rejections are terminal; storage failures may be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::StorageUnavailable(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constraint_violation_maps_to_conflict() {
        let conn = rusqlite::Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE t (k TEXT PRIMARY KEY); INSERT INTO t VALUES ('a');")
            .unwrap();
        let err = conn.execute("INSERT INTO t VALUES ('a')", []).unwrap_err();
        assert!(matches!(StoreError::from(err), StoreError::Conflict(_)));
    }

    #[test]
    fn missing_row_maps_to_not_found() {
        assert!(matches!(
            StoreError::from(rusqlite::Error::QueryReturnedNoRows),
            StoreError::NotFound
        ));
    }

    #[test]
    fn only_storage_failures_are_retryable() {
        assert!(AuthError::StorageUnavailable(StoreError::Unavailable("down".into())).is_retryable());
        assert!(!AuthError::ReplayDetected.is_retryable());
        assert!(!AuthError::InvalidCredentials.is_retryable());
    }

    #[test]
    fn status_codes_separate_credentials_from_suspension() {
        assert_eq!(AuthError::InvalidCredentials.status_code(), StatusCode::UNAUTHORIZED);
        assert_eq!(AuthError::AccountSuspended.status_code(), StatusCode::FORBIDDEN);
        assert_eq!(AuthError::EmailTaken.status_code(), StatusCode::CONFLICT);
        assert_eq!(AuthError::ReplayDetected.status_code(), StatusCode::UNAUTHORIZED);
        assert_eq!(AuthError::Cancelled.status_code().as_u16(), 499);
        assert_eq!(
            AuthError::CannotRevokeCurrentDevice.status_code(),
            StatusCode::BAD_REQUEST
        );
    }

    #[test]
    fn storage_detail_is_not_in_the_client_code() {
        let err = AuthError::from(StoreError::Unavailable("disk I/O error at /var/db".into()));
        assert_eq!(err.code(), "service_unavailable");
        assert_eq!(err.to_string(), "storage unavailable");
    }
}
