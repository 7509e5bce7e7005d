use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Extension, Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::{
    error::{AppError, Result},
    gateway::{ClientCryptoProvider, RequestMetadata},
    models::{session::Session, throttle::ThrottlingContext},
    services::auth::SignInRequest,
    sessions::service::SessionStatus,
    state::AppState,
};

/// The request payload for issuing or refreshing a session.
#[derive(Deserialize, Debug, Default)]
pub struct SessionRequest {
    /// Base64 X25519 public key the server seals outbound fields toward.
    pub client_public_key: Option<String>,
}

/// The request payload for signing in.
#[derive(Deserialize)]
pub struct SignInPayload {
    pub login: String,
    pub secret: String,
    pub client_public_key: Option<String>,
}

impl std::fmt::Debug for SignInPayload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignInPayload")
            .field("login", &self.login)
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// The response payload for a newly issued session.
#[derive(Serialize)]
pub struct SessionResponse {
    pub session_id: String,
    pub expires_at: DateTime<Utc>,
    /// Base64 X25519 public key the client seals inbound fields toward.
    pub server_public_key: Option<String>,
}

impl From<&Session> for SessionResponse {
    fn from(session: &Session) -> Self {
        Self {
            session_id: session.session_id.clone(),
            expires_at: session.expires_at,
            server_public_key: session.server_encryption_key.clone(),
        }
    }
}

/// The response payload for session status.
#[derive(Serialize)]
pub struct StatusResponse {
    #[serde(flatten)]
    pub status: SessionStatus,
    /// Subject id, field-encrypted for the client.
    pub subject: Option<String>,
}

/// One signed-in device of the current identity.
#[derive(Serialize)]
pub struct DeviceSummary {
    pub session_id: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub current: bool,
}

/// The response payload for logout requests.
#[derive(Serialize)]
pub struct LogoutResponse {
    pub success: bool,
    pub removed: usize,
}

/// Issues an anonymous pre-auth session for the calling device.
#[axum::debug_handler]
pub async fn create_session(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<SessionRequest>,
) -> Result<Response> {
    let metadata = RequestMetadata::from_headers(&headers);
    let fingerprint = metadata
        .fingerprint
        .ok_or_else(|| AppError::Validation("Device fingerprint is required".to_string()))?;

    let cancel = CancellationToken::new();
    let context = ThrottlingContext::new(None, &fingerprint);
    if state.throttling.is_locked(&context, &cancel).await? {
        return Err(AppError::RateLimitExceeded(
            "Too many invalid session attempts".to_string(),
        ));
    }

    let session = state
        .session_service
        .issue(None, &fingerprint, payload.client_public_key, &cancel)
        .await?;

    Ok((StatusCode::CREATED, Json(SessionResponse::from(&session))).into_response())
}

/// Throttled sign-in. Issues a session bound to the authenticated identity.
#[axum::debug_handler]
pub async fn sign_in(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<SignInPayload>,
) -> Result<Response> {
    let metadata = RequestMetadata::from_headers(&headers);
    let fingerprint = metadata
        .fingerprint
        .ok_or_else(|| AppError::Validation("Device fingerprint is required".to_string()))?;

    let cancel = CancellationToken::new();
    let session = state
        .authenticator
        .sign_in(
            SignInRequest {
                login: &payload.login,
                secret: &payload.secret,
                fingerprint: &fingerprint,
                client_public_key: payload.client_public_key,
            },
            &cancel,
        )
        .await?;

    Ok((StatusCode::CREATED, Json(SessionResponse::from(&session))).into_response())
}

/// Rotates the current session: new id, expiry and keys.
#[axum::debug_handler]
pub async fn refresh_session(
    State(state): State<AppState>,
    Extension(session): Extension<Session>,
    Json(payload): Json<SessionRequest>,
) -> Result<Response> {
    let cancel = CancellationToken::new();
    let replacement = state
        .session_service
        .refresh(
            &session.session_id,
            &session.fingerprint,
            payload.client_public_key,
            &cancel,
        )
        .await?;

    Ok((StatusCode::OK, Json(SessionResponse::from(&replacement))).into_response())
}

/// Reports remaining lifetime and whether a refresh is due.
#[axum::debug_handler]
pub async fn session_status(
    State(state): State<AppState>,
    Extension(session): Extension<Session>,
    gateway: ClientCryptoProvider,
) -> Result<Response> {
    let cancel = CancellationToken::new();
    let subject = match session.subject_id.as_deref() {
        Some(subject_id) => gateway.encrypt_field(subject_id, &cancel).await,
        None => None,
    };

    let response = StatusResponse {
        status: state.session_service.status(&session),
        subject,
    };

    Ok((StatusCode::OK, Json(response)).into_response())
}

/// Handles single-device logout.
#[axum::debug_handler]
pub async fn logout(
    State(state): State<AppState>,
    Extension(session): Extension<Session>,
) -> Result<Response> {
    let cancel = CancellationToken::new();
    let removed = state.session_service.logout(&session.session_id, &cancel).await?;

    let response = LogoutResponse {
        success: true,
        removed: usize::from(removed),
    };

    Ok((StatusCode::OK, Json(response)).into_response())
}

/// Handles logout from every device of the session's identity.
#[axum::debug_handler]
pub async fn logout_all(
    State(state): State<AppState>,
    Extension(session): Extension<Session>,
) -> Result<Response> {
    let subject_id = session.subject_id.as_deref().ok_or(AppError::Unauthorized)?;

    let cancel = CancellationToken::new();
    let removed = state.session_service.logout_all(subject_id, &cancel).await?;
    tracing::info!(removed, "👋 Logged out of all devices");

    let response = LogoutResponse {
        success: true,
        removed,
    };

    Ok((StatusCode::OK, Json(response)).into_response())
}

/// Lists every live session of the current identity.
#[axum::debug_handler]
pub async fn list_devices(
    State(state): State<AppState>,
    Extension(session): Extension<Session>,
) -> Result<Response> {
    let subject_id = session.subject_id.as_deref().ok_or(AppError::Unauthorized)?;

    let cancel = CancellationToken::new();
    let devices: Vec<DeviceSummary> = state
        .sessions
        .get_by_identity_async(subject_id, &cancel)
        .await?
        .into_iter()
        .map(|device| DeviceSummary {
            current: device.session_id == session.session_id,
            session_id: device.session_id,
            issued_at: device.issued_at,
            expires_at: device.expires_at,
        })
        .collect();

    Ok((StatusCode::OK, Json(devices)).into_response())
}

/// Signs one of the identity's devices out.
#[axum::debug_handler]
pub async fn revoke_device(
    State(state): State<AppState>,
    Extension(session): Extension<Session>,
    Extension(metadata): Extension<RequestMetadata>,
    Path(device_id): Path<String>,
) -> Result<Response> {
    let subject_id = session.subject_id.as_deref().ok_or(AppError::Unauthorized)?;
    let fingerprint = metadata.fingerprint.as_deref().ok_or(AppError::Unauthorized)?;

    // The caller must still own a live session at the moment of revocation.
    let cancel = CancellationToken::new();
    if !state
        .sessions
        .is_user_valid_async(&session.session_id, subject_id, fingerprint, &cancel)
        .await?
    {
        return Err(AppError::Unauthorized);
    }

    if state
        .sessions
        .get_by_identity_session_async(subject_id, &device_id, &cancel)
        .await?
        .is_none()
    {
        return Err(AppError::Validation("Unknown device".to_string()));
    }

    let removed = state
        .sessions
        .remove_by_identity_async(subject_id, &device_id, &cancel)
        .await?;
    tracing::info!(session_id = %device_id, removed, "👋 Device signed out");

    let response = LogoutResponse {
        success: removed,
        removed: usize::from(removed),
    };

    Ok((StatusCode::OK, Json(response)).into_response())
}
