//! # Request Handlers
//!
//! Axum request handlers for the reservation API and the M-Pesa callback.

use crate::state::AppState;
use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use reserve_core::{
    BookingOutcome, BookingRequest, InventoryEntry, NotificationResult, Offering, Reservation,
    ReserveError,
};
use reserve_mpesa::{acknowledgement, parse_callback, SIGNATURE_HEADER};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

// =============================================================================
// Request/Response Types
// =============================================================================

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>, code: u16) -> Self {
        Self {
            error: error.into(),
            code,
            details: None,
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

/// Query string of the registered callback URL
#[derive(Debug, Default, Deserialize)]
pub struct CallbackQuery {
    #[serde(default)]
    pub token: Option<String>,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn reserve_error_to_response(err: ReserveError) -> ApiError {
    let code = err.status_code();
    let response = ErrorResponse::new(err.to_string(), code);
    (
        StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
        Json(response),
    )
}

/// HTTP status for a booking outcome
pub fn outcome_status(outcome: &BookingOutcome) -> StatusCode {
    match outcome {
        BookingOutcome::Confirmed { .. } => StatusCode::CREATED,
        BookingOutcome::Initiated { .. } | BookingOutcome::PendingConfirmation { .. } => {
            StatusCode::ACCEPTED
        }
        BookingOutcome::Declined { .. } => StatusCode::PAYMENT_REQUIRED,
        BookingOutcome::SoldOut { .. } => StatusCode::CONFLICT,
    }
}

// =============================================================================
// Handlers
// =============================================================================

/// Health check endpoint
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "reserve-pay",
        "version": env!("CARGO_PKG_VERSION"),
        "gateway": state.orchestrator.provider_name()
    }))
}

/// Publish an offering and create its inventory entry
#[instrument(skip(state, offering), fields(offering_id = %offering.id))]
pub async fn publish_offering(
    State(state): State<AppState>,
    Json(offering): Json<Offering>,
) -> Result<(StatusCode, Json<InventoryEntry>), ApiError> {
    if offering.id.trim().is_empty() {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse::new("Offering id is required", 400)),
        ));
    }

    let entry = state
        .orchestrator
        .publish_offering(&offering)
        .await
        .map_err(reserve_error_to_response)?;

    info!("Published offering {} with {} seats", entry.offering_id, entry.total);
    Ok((StatusCode::CREATED, Json(entry)))
}

/// Inventory entry of one offering
pub async fn get_offering(
    State(state): State<AppState>,
    Path(offering_id): Path<String>,
) -> Result<Json<InventoryEntry>, ApiError> {
    state
        .orchestrator
        .inventory(&offering_id)
        .await
        .map(Json)
        .map_err(reserve_error_to_response)
}

/// Book an offering and push the payment prompt
#[instrument(skip(state, request), fields(offering_id = %request.offering_id))]
pub async fn create_reservation(
    State(state): State<AppState>,
    Json(request): Json<BookingRequest>,
) -> Result<(StatusCode, Json<BookingOutcome>), ApiError> {
    let outcome = state.orchestrator.book(request).await.map_err(|e| {
        error!("Booking failed: {}", e);
        reserve_error_to_response(e)
    })?;

    Ok((outcome_status(&outcome), Json(outcome)))
}

/// Current state of one reservation
pub async fn get_reservation(
    State(state): State<AppState>,
    Path(reservation_id): Path<String>,
) -> Result<Json<Reservation>, ApiError> {
    let id = Uuid::parse_str(&reservation_id).map_err(|e| {
        (
            StatusCode::BAD_REQUEST,
            Json(
                ErrorResponse::new(format!("Invalid reservation id: {}", reservation_id), 400)
                    .with_details(e.to_string()),
            ),
        )
    })?;

    state
        .orchestrator
        .reservation(id)
        .await
        .map(Json)
        .map_err(reserve_error_to_response)
}

/// Handle an M-Pesa STK callback.
///
/// Once authenticated and parsed the callback is always acknowledged, so
/// Daraja stops retrying; settlement failures are left to the sweep.
#[instrument(skip(state, query, headers, body))]
pub async fn mpesa_callback(
    State(state): State<AppState>,
    Query(query): Query<CallbackQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok());

    state
        .verifier
        .verify(query.token.as_deref(), signature, &body)
        .map_err(reserve_error_to_response)?;

    let details = parse_callback(&body).map_err(|e| {
        warn!("Malformed callback: {}", e);
        reserve_error_to_response(e)
    })?;

    info!(
        "Received callback: checkout_request_id={}, result_code={}",
        details.notification.correlation_id, details.result_code
    );

    match state
        .orchestrator
        .handle_notification(details.notification)
        .await
    {
        Ok(NotificationResult::Applied(r)) => {
            info!("Reservation {} settled: {}", r.id, r.status)
        }
        Ok(NotificationResult::Duplicate(r)) => {
            info!("Reservation {} already settled: {}", r.id, r.status)
        }
        Ok(NotificationResult::Unmatched { correlation_id }) => {
            warn!("Callback for unknown checkout request {}", correlation_id)
        }
        Err(e) => error!("Failed to apply callback: {}", e),
    }

    Ok(Json(acknowledgement()))
}
