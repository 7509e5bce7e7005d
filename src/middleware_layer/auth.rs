use axum::{
    body::Body,
    extract::State,
    http::Request,
    middleware::Next,
    response::{IntoResponse, Response},
};
use tokio_util::sync::CancellationToken;

use crate::{
    error::AppError,
    gateway::RequestMetadata,
    models::throttle::ThrottlingContext,
    state::AppState,
};

/// A middleware that requires a live session bound to the presented fingerprint.
///
/// Failed validations count against the fingerprint's throttling partitions,
/// so a device cycling through guessed or stolen session ids gets locked out.
/// On success the `Session` and `RequestMetadata` are inserted as extensions.
pub async fn require_session(
    State(state): State<AppState>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    tracing::debug!("🔐 Checking session...");

    let metadata = RequestMetadata::from_headers(request.headers());
    let (Some(session_id), Some(fingerprint)) =
        (metadata.session_id.clone(), metadata.fingerprint.clone())
    else {
        tracing::warn!("❌ Missing session or fingerprint header");
        return AppError::Unauthorized.into_response();
    };

    let cancel = CancellationToken::new();
    let context = ThrottlingContext::new(None, &fingerprint);

    match state.throttling.is_locked(&context, &cancel).await {
        Ok(false) => {}
        Ok(true) => {
            return AppError::RateLimitExceeded("Too many invalid session attempts".to_string())
                .into_response();
        }
        Err(e) => return e.into_response(),
    }

    let session = match state
        .sessions
        .find_valid(&session_id, None, &fingerprint, &cancel)
        .await
    {
        Ok(Some(session)) => session,
        Ok(None) => {
            tracing::warn!(session_id = %session_id, "❌ Invalid or expired session");
            if let Err(e) = state.throttling.register_failure(&context, &cancel).await {
                return e.into_response();
            }
            return AppError::Unauthorized.into_response();
        }
        Err(e) => return e.into_response(),
    };

    tracing::debug!(session_id = %session_id, "✅ Session validated");

    request.extensions_mut().insert(session);
    request.extensions_mut().insert(metadata);

    next.run(request).await
}
