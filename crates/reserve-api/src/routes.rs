//! # Routes
//!
//! Axum router configuration for the reservation API.

use crate::handlers;
use crate::state::AppState;
use axum::{
    routing::{get, post},
    Router,
};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

/// Create the main application router
///
/// Routes:
/// - API:
///   - POST /api/v1/offerings - Publish an offering
///   - GET  /api/v1/offerings/{offering_id} - Inventory of an offering
///   - POST /api/v1/reservations - Book and push the payment prompt
///   - GET  /api/v1/reservations/{reservation_id} - Reservation state
///
/// - Callbacks:
///   - POST /callback/mpesa - STK push result from Daraja
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let api_routes = Router::new()
        // Offerings
        .route("/offerings", post(handlers::publish_offering))
        .route("/offerings/{offering_id}", get(handlers::get_offering))
        // Reservations
        .route("/reservations", post(handlers::create_reservation))
        .route(
            "/reservations/{reservation_id}",
            get(handlers::get_reservation),
        );

    // Gateway callbacks read the raw body
    let callback_routes = Router::new().route("/mpesa", post(handlers::mpesa_callback));

    Router::new()
        // Health check at root
        .route("/health", get(handlers::health))
        .route("/", get(handlers::health))
        // API v1
        .nest("/api/v1", api_routes)
        // Callbacks
        .nest("/callback", callback_routes)
        // Middleware
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        // State
        .with_state(state)
}
