//! # Reservation Error Types
//!
//! Typed error handling for the reservation and payment core.
//! All store, ledger, gateway and orchestrator operations return
//! `Result<T, ReserveError>`.

use thiserror::Error;

/// Core error type for all reservation operations
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ReserveError {
    /// Configuration errors (missing keys, invalid config)
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Invalid request data
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Offering has no inventory entry
    #[error("Offering not found: {offering_id}")]
    OfferingNotFound { offering_id: String },

    /// Offering was already published
    #[error("Offering already exists: {offering_id}")]
    OfferingExists { offering_id: String },

    /// Not enough remaining capacity for the requested amount
    #[error("Insufficient capacity for {offering_id}: requested {requested}, remaining {remaining}")]
    InsufficientCapacity {
        offering_id: String,
        requested: u32,
        remaining: u32,
    },

    /// Reservation id is unknown
    #[error("Reservation not found: {reservation_id}")]
    ReservationNotFound { reservation_id: String },

    /// A booking with the same client idempotency key already exists
    #[error("Duplicate booking: key {key} belongs to reservation {reservation_id}")]
    DuplicateBooking { key: String, reservation_id: String },

    /// Gateway could not be reached or answered with a server error
    #[error("Gateway unavailable: {0}")]
    GatewayUnavailable(String),

    /// Gateway call exceeded its deadline; the request may still have landed
    #[error("Gateway timed out: {0}")]
    GatewayTimeout(String),

    /// Gateway synchronously declined the request
    #[error("Gateway rejected payment: {reason}")]
    GatewayRejected { reason: String },

    /// Callback authentication failed
    #[error("Callback verification failed: {0}")]
    CallbackVerificationFailed(String),

    /// Callback payload is malformed
    #[error("Callback parse error: {0}")]
    CallbackParseError(String),

    /// Persistence layer failure
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Internal error (should not happen)
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ReserveError {
    /// Returns true if this error is retryable.
    ///
    /// A retryable gateway error leaves the payment unresolved: the gateway
    /// may still have received the request.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ReserveError::GatewayUnavailable(_) | ReserveError::GatewayTimeout(_)
        )
    }

    /// Returns the HTTP status code appropriate for this error
    pub fn status_code(&self) -> u16 {
        match self {
            ReserveError::Configuration(_) => 500,
            ReserveError::InvalidRequest(_) => 400,
            ReserveError::OfferingNotFound { .. } => 404,
            ReserveError::OfferingExists { .. } => 409,
            ReserveError::InsufficientCapacity { .. } => 409,
            ReserveError::ReservationNotFound { .. } => 404,
            ReserveError::DuplicateBooking { .. } => 409,
            ReserveError::GatewayUnavailable(_) => 503,
            ReserveError::GatewayTimeout(_) => 504,
            ReserveError::GatewayRejected { .. } => 402,
            ReserveError::CallbackVerificationFailed(_) => 401,
            ReserveError::CallbackParseError(_) => 400,
            ReserveError::Storage(_) => 500,
            ReserveError::Serialization(_) => 500,
            ReserveError::Internal(_) => 500,
        }
    }
}

/// Result type alias for reservation operations
pub type ReserveResult<T> = Result<T, ReserveError>;
