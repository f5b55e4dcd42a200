//! # Reservation Types
//!
//! The reservation record, its two status machines, and the booking request
//! that creates it.

use crate::error::{ReserveError, ReserveResult};
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Payment status of a reservation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    /// Free booking, nothing to collect
    NotRequired,
    /// Row created, gateway not yet acknowledged
    Pending,
    /// Push request sent (or its fate unknown), awaiting settlement
    Processing,
    /// Gateway confirmed the payment
    Completed,
    /// Payment declined, cancelled or expired
    Failed,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::NotRequired => "not_required",
            PaymentStatus::Pending => "pending",
            PaymentStatus::Processing => "processing",
            PaymentStatus::Completed => "completed",
            PaymentStatus::Failed => "failed",
        }
    }

    /// Completed and failed are write-once.
    pub fn is_terminal(&self) -> bool {
        matches!(self, PaymentStatus::Completed | PaymentStatus::Failed)
    }

    /// Statuses a sweep may still resolve
    pub fn awaits_gateway(&self) -> bool {
        matches!(self, PaymentStatus::Pending | PaymentStatus::Processing)
    }
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PaymentStatus {
    type Err = ReserveError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "not_required" => Ok(PaymentStatus::NotRequired),
            "pending" => Ok(PaymentStatus::Pending),
            "processing" => Ok(PaymentStatus::Processing),
            "completed" => Ok(PaymentStatus::Completed),
            "failed" => Ok(PaymentStatus::Failed),
            other => Err(ReserveError::Serialization(format!(
                "unknown payment status: {}",
                other
            ))),
        }
    }
}

/// Overall status of a reservation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReservationStatus {
    Pending,
    Confirmed,
    Cancelled,
    /// Post-fulfillment; set outside the payment flow
    Completed,
}

impl ReservationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReservationStatus::Pending => "pending",
            ReservationStatus::Confirmed => "confirmed",
            ReservationStatus::Cancelled => "cancelled",
            ReservationStatus::Completed => "completed",
        }
    }
}

impl fmt::Display for ReservationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReservationStatus {
    type Err = ReserveError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ReservationStatus::Pending),
            "confirmed" => Ok(ReservationStatus::Confirmed),
            "cancelled" => Ok(ReservationStatus::Cancelled),
            "completed" => Ok(ReservationStatus::Completed),
            other => Err(ReserveError::Serialization(format!(
                "unknown reservation status: {}",
                other
            ))),
        }
    }
}

/// Inbound booking request from the UI
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BookingRequest {
    /// Business or event id
    pub offering_id: String,

    /// Customer making the booking
    pub requester_id: String,

    /// Phone that receives the push prompt (required when amount > 0)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payer_phone: Option<String>,

    /// Whole currency units; 0 means no payment is collected
    pub amount: u64,

    /// `YYYY-MM-DD`
    pub date: NaiveDate,

    /// `HH:MM` or `HH:MM:SS`
    pub time: String,

    /// Number of people / tickets
    pub party_size: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub special_requests: Option<String>,

    /// Client-chosen key; repeated requests with the same key return the
    /// original reservation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
}

impl BookingRequest {
    /// Reject requests that can never produce a valid reservation
    pub fn validate(&self) -> ReserveResult<()> {
        if self.offering_id.trim().is_empty() {
            return Err(ReserveError::InvalidRequest("offering_id is required".into()));
        }
        if self.requester_id.trim().is_empty() {
            return Err(ReserveError::InvalidRequest("requester_id is required".into()));
        }
        if self.party_size == 0 {
            return Err(ReserveError::InvalidRequest(
                "party_size must be at least 1".into(),
            ));
        }
        if NaiveTime::parse_from_str(&self.time, "%H:%M").is_err()
            && NaiveTime::parse_from_str(&self.time, "%H:%M:%S").is_err()
        {
            return Err(ReserveError::InvalidRequest(format!(
                "invalid time: {}",
                self.time
            )));
        }
        if self.requires_payment()
            && self
                .payer_phone
                .as_deref()
                .map(str::trim)
                .unwrap_or_default()
                .is_empty()
        {
            return Err(ReserveError::InvalidRequest(
                "payer_phone is required for paid bookings".into(),
            ));
        }
        Ok(())
    }

    pub fn requires_payment(&self) -> bool {
        self.amount > 0
    }
}

/// Durable record of a booking attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Uuid,
    pub offering_id: String,
    pub requester_id: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub payer_phone: Option<String>,

    pub scheduled_date: NaiveDate,
    pub scheduled_time: String,
    pub party_size: u32,

    /// Whole currency units
    pub amount: u64,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub special_requests: Option<String>,

    /// Client idempotency key (unique)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub booking_key: Option<String>,

    /// Key sent with the current payment attempt
    pub payment_key: String,

    /// 1-based; only one attempt is ever live per reservation
    pub payment_attempt: u32,

    /// Gateway checkout request id (unique)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,

    /// Gateway receipt, set on successful settlement
    #[serde(skip_serializing_if = "Option::is_none")]
    pub receipt_id: Option<String>,

    pub payment_status: PaymentStatus,
    pub status: ReservationStatus,

    /// Last decline, expiry or gateway error description
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_reason: Option<String>,

    /// Set once the decremented inventory has been given back
    pub inventory_released: bool,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Reservation {
    /// Build the initial `pending` row for a booking request
    pub fn from_request(request: &BookingRequest) -> Self {
        let id = Uuid::new_v4();
        let now = Utc::now();
        let payment_status = if request.requires_payment() {
            PaymentStatus::Pending
        } else {
            PaymentStatus::NotRequired
        };

        Self {
            id,
            offering_id: request.offering_id.clone(),
            requester_id: request.requester_id.clone(),
            payer_phone: request.payer_phone.clone(),
            scheduled_date: request.date,
            scheduled_time: request.time.clone(),
            party_size: request.party_size,
            amount: request.amount,
            special_requests: request.special_requests.clone(),
            booking_key: request.idempotency_key.clone(),
            payment_key: payment_key(&id, 1),
            payment_attempt: 1,
            correlation_id: None,
            receipt_id: None,
            payment_status,
            status: ReservationStatus::Pending,
            status_reason: None,
            inventory_released: false,
            created_at: now,
            updated_at: now,
        }
    }

    /// Gateway account reference: `RES` + first 8 chars of the id
    pub fn account_reference(&self) -> String {
        let id = self.id.simple().to_string();
        format!("RES{}", &id[..8]).to_uppercase()
    }

    /// Whether the orchestrator may still apply a settlement
    pub fn is_settleable(&self) -> bool {
        self.status == ReservationStatus::Pending && !self.payment_status.is_terminal()
    }

    /// Cancelled rows still holding inventory
    pub fn needs_release(&self) -> bool {
        self.status == ReservationStatus::Cancelled && !self.inventory_released
    }

    /// Whether `request` describes the booking this row was created from
    pub fn matches_request(&self, request: &BookingRequest) -> bool {
        self.offering_id == request.offering_id
            && self.requester_id == request.requester_id
            && self.amount == request.amount
            && self.party_size == request.party_size
            && self.scheduled_date == request.date
            && self.scheduled_time == request.time
            && self.payer_phone == request.payer_phone
    }
}

/// Derive the payment idempotency key for an attempt
pub fn payment_key(reservation_id: &Uuid, attempt: u32) -> String {
    let mut hasher = Sha256::new();
    hasher.update(reservation_id.as_bytes());
    hasher.update(attempt.to_be_bytes());
    let digest = hex::encode(hasher.finalize());
    digest[..32].to_string()
}

/// Final word on a payment attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum PaymentResolution {
    Succeeded {
        #[serde(skip_serializing_if = "Option::is_none")]
        receipt_id: Option<String>,
    },
    Failed {
        reason: String,
    },
}

impl PaymentResolution {
    pub fn succeeded(receipt_id: impl Into<String>) -> Self {
        PaymentResolution::Succeeded {
            receipt_id: Some(receipt_id.into()),
        }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        PaymentResolution::Failed {
            reason: reason.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, PaymentResolution::Succeeded { .. })
    }

    /// Statuses written when this resolution wins the settlement race
    pub fn target_statuses(&self, current: PaymentStatus) -> (PaymentStatus, ReservationStatus) {
        match self {
            PaymentResolution::Succeeded { .. } if current == PaymentStatus::NotRequired => {
                (PaymentStatus::NotRequired, ReservationStatus::Confirmed)
            }
            PaymentResolution::Succeeded { .. } => {
                (PaymentStatus::Completed, ReservationStatus::Confirmed)
            }
            PaymentResolution::Failed { .. } => {
                (PaymentStatus::Failed, ReservationStatus::Cancelled)
            }
        }
    }
}

/// A gateway notification already authenticated and parsed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentNotification {
    pub correlation_id: String,
    pub resolution: PaymentResolution,
}

/// Result of a guarded settlement
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// This caller won the compare-and-set
    Applied(Reservation),
    /// Another writer settled first; nothing changed
    AlreadySettled(Reservation),
}

impl Transition {
    pub fn reservation(&self) -> &Reservation {
        match self {
            Transition::Applied(r) | Transition::AlreadySettled(r) => r,
        }
    }

    pub fn was_applied(&self) -> bool {
        matches!(self, Transition::Applied(_))
    }
}
