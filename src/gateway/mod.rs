//! Axum-based HTTP gateway with body limits, timeouts and CORS.
//!
//! Routes (all under `/api`):
//! - `GET  /healthz`: liveness
//! - `POST /v1/auth/register`, `/v1/auth/login`, `/v1/auth/refresh`: public
//! - `POST /v1/auth/logout`, `GET /v1/auth/me`, `GET /v1/auth/sessions`,
//!   `DELETE /v1/auth/sessions/{device_id}`: bearer token plus request signature
//!
//! Bearer authentication runs before the signature gate so the signing key
//! identifier is the device bound to the verified access token.

use crate::auth::{
    AuthError, AuthService, LoginInput, RefreshInput, RegisterInput, RequestIdentity,
    SessionManager, SessionSettings, SqliteAuthStore,
};
use crate::cache::{MemoryNonceCache, NonceCache};
use crate::config::{Config, HttpConfig};
use crate::security::signature::{RequestSignatureValidator, SignatureHeaders, SignedRequestParts};
use crate::security::token::AccessTokenCodec;
use anyhow::{Context, Result};
use axum::{
    body::Body,
    extract::{rejection::JsonRejection, ConnectInfo, FromRequestParts, Path, Request, State},
    http::{header, request::Parts, HeaderMap, HeaderValue, Method, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Json, Response},
    routing::{delete, get, post},
    Extension, Router,
};
use serde::Deserialize;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;

type ApiResponse = (StatusCode, Json<serde_json::Value>);

/// Shared state for all axum handlers
#[derive(Clone)]
pub struct AppState {
    pub auth: Arc<AuthService>,
    pub signatures: RequestSignatureValidator,
    /// Upper bound when buffering a body for signature verification.
    pub max_body_bytes: usize,
}

impl AppState {
    /// Open the SQLite store and wire the auth service from configuration.
    pub fn from_config(config: &Config) -> Result<Self> {
        let store = Arc::new(
            SqliteAuthStore::open(&config.database.path).with_context(|| {
                format!("failed to open database {}", config.database.path.display())
            })?,
        );
        Self::with_store(config, store, Arc::new(MemoryNonceCache::new()))
    }

    pub fn with_store(
        config: &Config,
        store: Arc<SqliteAuthStore>,
        nonces: Arc<dyn NonceCache>,
    ) -> Result<Self> {
        let sec = &config.security;
        let sessions = SessionManager::new(
            store.clone(),
            AccessTokenCodec::new(&sec.access_secret, sec.access_ttl()),
            SessionSettings {
                refresh_ttl: sec.refresh_ttl(),
                max_sessions: sec.max_sessions,
                refresh_token_bytes: sec.refresh_token_bytes,
            },
        );
        let auth = AuthService::new(store, sessions, config.password)
            .map_err(|e| anyhow::anyhow!("failed to initialise auth service: {e}"))?;
        let signatures = RequestSignatureValidator::with_window(
            &sec.signature_secret,
            nonces,
            sec.signature_max_age(),
            sec.signature_max_future(),
        );

        Ok(Self {
            auth: Arc::new(auth),
            signatures,
            max_body_bytes: config.http.max_body_bytes,
        })
    }
}

/// Run the HTTP gateway until Ctrl-C.
pub async fn run_gateway(config: Config) -> Result<()> {
    let state = AppState::from_config(&config)?;
    let app = build_router(state, &config.http);

    let addr = format!("{}:{}", config.http.host, config.http.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    let actual = listener.local_addr()?;
    tracing::info!(%actual, environment = %config.environment, "auth gateway listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    tracing::info!("auth gateway stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!("failed to listen for shutdown signal: {e}");
        std::future::pending::<()>().await;
    }
}

fn cors_layer(http: &HttpConfig) -> CorsLayer {
    let origins: Vec<HeaderValue> = http
        .allowed_origins
        .iter()
        .filter_map(|o| match HeaderValue::from_str(o) {
            Ok(v) => Some(v),
            Err(_) => {
                tracing::warn!(origin = %o, "ignoring invalid CORS origin");
                None
            }
        })
        .collect();

    let allow_origin = if origins.is_empty() {
        AllowOrigin::from(Any)
    } else {
        AllowOrigin::list(origins)
    };

    CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers([
            header::AUTHORIZATION,
            header::CONTENT_TYPE,
            header::HeaderName::from_static("x-codex-date"),
            header::HeaderName::from_static("x-codex-nonce"),
            header::HeaderName::from_static("x-codex-signature"),
        ])
        .max_age(std::time::Duration::from_secs(3600))
}

pub fn build_router(state: AppState, http: &HttpConfig) -> Router {
    let protected = Router::new()
        .route("/api/v1/auth/logout", post(handle_logout))
        .route("/api/v1/auth/me", get(handle_me))
        .route("/api/v1/auth/sessions", get(handle_list_sessions))
        .route(
            "/api/v1/auth/sessions/{device_id}",
            delete(handle_revoke_session),
        )
        // layers run bottom-up: bearer first, then the signature gate
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            require_signature,
        ))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_bearer));

    Router::new()
        .route("/api/healthz", get(handle_health))
        .route("/api/v1/auth/register", post(handle_register))
        .route("/api/v1/auth/login", post(handle_login))
        .route("/api/v1/auth/refresh", post(handle_refresh))
        .merge(protected)
        .with_state(state)
        .layer(cors_layer(http))
        .layer(RequestBodyLimitLayer::new(http.max_body_bytes))
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            http.request_timeout(),
        ))
}

// ══════════════════════════════════════════════════════════════════════════════
// REQUEST PLUMBING
// ══════════════════════════════════════════════════════════════════════════════

/// Caller address and user agent. Proxy headers win over the socket address.
#[derive(Debug, Clone, Default)]
pub struct ClientMeta {
    pub ip: String,
    pub user_agent: String,
}

fn client_ip_from_headers(headers: &HeaderMap) -> Option<String> {
    for header_name in ["X-Forwarded-For", "X-Real-IP"] {
        if let Some(value) = headers.get(header_name).and_then(|v| v.to_str().ok()) {
            let first = value.split(',').next().unwrap_or("").trim();
            if !first.is_empty() {
                return Some(first.to_owned());
            }
        }
    }
    None
}

impl<S: Send + Sync> FromRequestParts<S> for ClientMeta {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let ip = client_ip_from_headers(&parts.headers)
            .or_else(|| {
                parts
                    .extensions
                    .get::<ConnectInfo<SocketAddr>>()
                    .map(|ConnectInfo(addr)| addr.ip().to_string())
            })
            .unwrap_or_default();
        let user_agent = parts
            .headers
            .get(header::USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_owned();
        Ok(Self { ip, user_agent })
    }
}

/// Run a store-backed service call off the async runtime.
///
/// Once started, the blocking work runs to completion even if the client
/// disconnects; dropping the handler future only discards the result.
/// `Cancelled` is reported only when the runtime shuts down before the task
/// runs.
async fn run_blocking<T, F>(f: F) -> Result<T, AuthError>
where
    F: FnOnce() -> Result<T, AuthError> + Send + 'static,
    T: Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(result) => result,
        Err(e) if e.is_cancelled() => Err(AuthError::Cancelled),
        Err(e) => Err(AuthError::Internal(e.to_string())),
    }
}

fn error_response(err: &AuthError) -> ApiResponse {
    match err {
        AuthError::StorageUnavailable(e) => tracing::error!(error = %e, "storage unavailable"),
        AuthError::Internal(msg) => tracing::error!(error = %msg, "internal error"),
        AuthError::Cancelled => tracing::debug!("request cancelled"),
        _ => {}
    }

    let mut body = serde_json::json!({ "error": err.code() });
    if let AuthError::InvalidInput(message) = err {
        body["message"] = serde_json::json!(message);
    }
    (err.status_code(), Json(body))
}

fn rejection_response(rejection: &JsonRejection) -> ApiResponse {
    (
        StatusCode::BAD_REQUEST,
        Json(serde_json::json!({
            "error": "invalid_request",
            "message": rejection.body_text(),
        })),
    )
}

async fn require_bearer(
    State(state): State<AppState>,
    meta: ClientMeta,
    mut req: Request,
    next: Next,
) -> Response {
    let authorization = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned);

    let auth = state.auth.clone();
    let identity = run_blocking(move || {
        auth.authenticate_bearer(authorization.as_deref(), &meta.ip, &meta.user_agent)
    })
    .await;

    match identity {
        Ok(identity) => {
            req.extensions_mut().insert(identity);
            next.run(req).await
        }
        Err(e) => error_response(&e).into_response(),
    }
}

/// Buffer the body, verify the signature against the bearer-bound device,
/// then hand the identical bytes to the handler.
async fn require_signature(State(state): State<AppState>, req: Request, next: Next) -> Response {
    let Some(device_id) = req
        .extensions()
        .get::<RequestIdentity>()
        .map(|identity| identity.claims.device_id.clone())
    else {
        return error_response(&AuthError::Unauthenticated("missing_token")).into_response();
    };

    let Some(signature_headers) = SignatureHeaders::from_headers(req.headers()) else {
        return error_response(&AuthError::SignatureRequired).into_response();
    };

    let (parts, body) = req.into_parts();
    let bytes = match axum::body::to_bytes(body, state.max_body_bytes).await {
        Ok(bytes) => bytes,
        Err(e) => {
            tracing::debug!(error = %e, "failed to buffer request body");
            return (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({ "error": "invalid_body" })),
            )
                .into_response();
        }
    };

    let verdict = state.signatures.validate(
        Some(&signature_headers),
        &SignedRequestParts {
            device_id: &device_id,
            method: parts.method.as_str(),
            path: parts.uri.path(),
            query: parts.uri.query().unwrap_or_default(),
            body: &bytes,
        },
    );
    if let Err(e) = verdict {
        tracing::debug!(device_id = %device_id, reason = e.code(), "signed request rejected");
        return error_response(&e).into_response();
    }

    next.run(Request::from_parts(parts, Body::from(bytes))).await
}

// ══════════════════════════════════════════════════════════════════════════════
// AXUM HANDLERS
// ══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RegisterBody {
    email: String,
    password: String,
    display_name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LoginBody {
    email: String,
    password: String,
    device_id: Option<String>,
    device_name: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RefreshBody {
    user_id: String,
    device_id: String,
    refresh_token: String,
}

/// GET /api/healthz
async fn handle_health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

/// POST /api/v1/auth/register
async fn handle_register(
    State(state): State<AppState>,
    meta: ClientMeta,
    body: Result<Json<RegisterBody>, JsonRejection>,
) -> ApiResponse {
    let body = match body {
        Ok(Json(b)) => b,
        Err(e) => return rejection_response(&e),
    };

    let auth = state.auth.clone();
    let result = run_blocking(move || {
        auth.register(RegisterInput {
            email: body.email,
            password: body.password,
            display_name: body.display_name,
            ip_address: meta.ip,
            user_agent: meta.user_agent,
        })
    })
    .await;

    match result {
        Ok(result) => (StatusCode::CREATED, Json(serde_json::json!(result))),
        Err(e) => error_response(&e),
    }
}

/// POST /api/v1/auth/login
async fn handle_login(
    State(state): State<AppState>,
    meta: ClientMeta,
    body: Result<Json<LoginBody>, JsonRejection>,
) -> ApiResponse {
    let body = match body {
        Ok(Json(b)) => b,
        Err(e) => return rejection_response(&e),
    };

    let auth = state.auth.clone();
    let result = run_blocking(move || {
        auth.login(LoginInput {
            email: body.email,
            password: body.password,
            device_id: body.device_id,
            device_name: body.device_name,
            ip_address: meta.ip,
            user_agent: meta.user_agent,
        })
    })
    .await;

    match result {
        Ok(result) => (StatusCode::OK, Json(serde_json::json!(result))),
        Err(e) => error_response(&e),
    }
}

/// POST /api/v1/auth/refresh
async fn handle_refresh(
    State(state): State<AppState>,
    body: Result<Json<RefreshBody>, JsonRejection>,
) -> ApiResponse {
    let body = match body {
        Ok(Json(b)) => b,
        Err(e) => return rejection_response(&e),
    };

    let auth = state.auth.clone();
    let result = run_blocking(move || {
        auth.refresh(RefreshInput {
            user_id: body.user_id,
            device_id: body.device_id,
            refresh_token: body.refresh_token,
        })
    })
    .await;

    match result {
        Ok(result) => (StatusCode::OK, Json(serde_json::json!(result))),
        Err(e) => error_response(&e),
    }
}

/// POST /api/v1/auth/logout ends the caller's own device session.
async fn handle_logout(
    State(state): State<AppState>,
    Extension(identity): Extension<RequestIdentity>,
) -> Response {
    let auth = state.auth.clone();
    let result = run_blocking(move || {
        auth.logout(&identity.claims.user_id, &identity.claims.device_id)
    })
    .await;

    match result {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => error_response(&e).into_response(),
    }
}

/// GET /api/v1/auth/me
async fn handle_me(
    State(state): State<AppState>,
    Extension(identity): Extension<RequestIdentity>,
) -> ApiResponse {
    let user = state.auth.me(&identity);
    (StatusCode::OK, Json(serde_json::json!({ "user": user })))
}

/// GET /api/v1/auth/sessions
async fn handle_list_sessions(
    State(state): State<AppState>,
    Extension(identity): Extension<RequestIdentity>,
) -> ApiResponse {
    let auth = state.auth.clone();
    let result = run_blocking(move || {
        auth.list_sessions(&identity.user.id, &identity.claims.session_id)
    })
    .await;

    match result {
        Ok(sessions) => (
            StatusCode::OK,
            Json(serde_json::json!({ "sessions": sessions })),
        ),
        Err(e) => error_response(&e),
    }
}

/// DELETE /api/v1/auth/sessions/{device_id}
async fn handle_revoke_session(
    State(state): State<AppState>,
    Extension(identity): Extension<RequestIdentity>,
    Path(device_id): Path<String>,
) -> ApiResponse {
    let auth = state.auth.clone();
    let result = run_blocking(move || auth.revoke_session(&identity, &device_id)).await;

    match result {
        Ok(true) => (
            StatusCode::OK,
            Json(serde_json::json!({ "status": "revoked" })),
        ),
        Ok(false) => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "error": "session_not_found" })),
        ),
        Err(e) => error_response(&e),
    }
}
