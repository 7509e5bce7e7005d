use axum::{
    Router,
    middleware::from_fn_with_state,
    routing::{delete, get, post},
};

use crate::{handlers, middleware_layer, state::AppState};

/// Builds the session API router without transport-level layers.
pub fn build_router(state: AppState) -> Router {
    let public_routes = Router::new()
        .route("/api/session/issue", post(handlers::session::create_session))
        .route("/api/session/sign-in", post(handlers::session::sign_in))
        .with_state(state.clone());

    let protected_routes = Router::new()
        .route(
            "/api/session",
            get(handlers::session::session_status)
                .delete(handlers::session::logout),
        )
        .route(
            "/api/session/refresh",
            post(handlers::session::refresh_session),
        )
        .route("/api/session/all", delete(handlers::session::logout_all))
        .route("/api/session/devices", get(handlers::session::list_devices))
        .route(
            "/api/session/devices/{session_id}",
            delete(handlers::session::revoke_device),
        )
        .route_layer(from_fn_with_state(
            state.clone(),
            middleware_layer::auth::require_session,
        ))
        .with_state(state);

    Router::new().merge(public_routes).merge(protected_routes)
}
