//! Route modules for the hosting relay

pub mod fichiers;
pub mod health;

use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::state::AppState;

/// Build the full application router
pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health::health_check))
        .nest(
            "/fichiers",
            fichiers::router().layer(middleware::from_fn_with_state(state.clone(), limit_requests)),
        )
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Hold a limiter permit for the lifetime of each upload request
async fn limit_requests(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let permit = match state.request_limiter().clone().acquire_owned().await {
        Ok(permit) => permit,
        Err(_) => return StatusCode::SERVICE_UNAVAILABLE.into_response(),
    };

    let response = next.run(request).await;
    drop(permit);
    response
}
