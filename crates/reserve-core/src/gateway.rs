//! # Payment Gateway Trait
//!
//! Seam between the orchestrator and a push-payment provider.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   PaymentGateway (trait)                    │
//! │  ├── initiate()        push prompt to the payer's phone     │
//! │  ├── query_status()    ask about an unresolved attempt      │
//! │  └── provider_name()                                        │
//! └─────────────────────────────────────────────────────────────┘
//!                            ▲
//!                ┌───────────┴───────────┐
//!        ┌───────┴───────┐       ┌───────┴───────┐
//!        │ MpesaGateway  │       │  MockGateway  │
//!        │reserve-mpesa  │       │  (dev/tests)  │
//!        └───────────────┘       └───────────────┘
//! ```

use crate::error::{ReserveError, ReserveResult};
use crate::reservation::Reservation;
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// A push-payment request for one reservation attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentRequest {
    pub reservation_id: Uuid,

    /// Raw phone as entered; the gateway normalizes it
    pub payer_phone: String,

    /// Whole currency units
    pub amount: u64,

    /// Short merchant-side reference shown to the payer
    pub account_reference: String,

    /// Stable per reservation attempt
    pub idempotency_key: String,
}

impl PaymentRequest {
    pub fn for_reservation(reservation: &Reservation) -> ReserveResult<Self> {
        let payer_phone = reservation.payer_phone.clone().ok_or_else(|| {
            ReserveError::InvalidRequest(format!(
                "reservation {} has no payer phone",
                reservation.id
            ))
        })?;

        Ok(Self {
            reservation_id: reservation.id,
            payer_phone,
            amount: reservation.amount,
            account_reference: reservation.account_reference(),
            idempotency_key: reservation.payment_key.clone(),
        })
    }
}

/// Synchronous acknowledgement of an initiate call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayAck {
    /// Id the gateway will echo in its callback
    pub correlation_id: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub merchant_request_id: Option<String>,

    /// Message suitable for the payer
    #[serde(skip_serializing_if = "Option::is_none")]
    pub customer_message: Option<String>,
}

/// Answer of a status query
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum GatewayStatus {
    Succeeded {
        #[serde(skip_serializing_if = "Option::is_none")]
        receipt_id: Option<String>,
    },
    Failed {
        reason: String,
    },
    /// Gateway has not finished with the request
    Pending,
}

/// Core trait for push-payment providers.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Send a push-payment request.
    ///
    /// # Errors
    /// * `GatewayRejected` - synchronous decline; the payment will not happen
    /// * `GatewayUnavailable` / `GatewayTimeout` - fate unknown
    async fn initiate(&self, request: &PaymentRequest) -> ReserveResult<GatewayAck>;

    /// Query the state of a previously acknowledged request.
    async fn query_status(&self, correlation_id: &str) -> ReserveResult<GatewayStatus>;

    /// Get the provider name (for logging and routing).
    fn provider_name(&self) -> &'static str;
}

/// Type alias for a boxed payment gateway (dynamic dispatch)
pub type BoxedPaymentGateway = Arc<dyn PaymentGateway>;

/// How the mock answers `initiate`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockBehavior {
    /// Acknowledge with a fresh correlation id
    Accept,
    /// Acknowledge, but only after the given delay
    AcceptAfter(Duration),
    /// Decline synchronously
    Reject(String),
    /// Fail as if the network were down
    Unavailable,
    /// Never answer within any sensible deadline
    Hang,
}

/// In-process gateway for development and tests.
///
/// Acknowledges initiations with `ws_CO_<n>` ids and answers status queries
/// from a table that tests (or a dev console) fill in.
pub struct MockGateway {
    behavior: Mutex<MockBehavior>,
    statuses: DashMap<String, GatewayStatus>,
    initiated: Mutex<Vec<PaymentRequest>>,
    counter: AtomicUsize,
}

impl MockGateway {
    pub fn new(behavior: MockBehavior) -> Self {
        Self {
            behavior: Mutex::new(behavior),
            statuses: DashMap::new(),
            initiated: Mutex::new(Vec::new()),
            counter: AtomicUsize::new(0),
        }
    }

    pub fn accepting() -> Self {
        Self::new(MockBehavior::Accept)
    }

    pub fn set_behavior(&self, behavior: MockBehavior) {
        *self.behavior.lock() = behavior;
    }

    /// Answer future status queries for `correlation_id` with `status`
    pub fn set_status(&self, correlation_id: impl Into<String>, status: GatewayStatus) {
        self.statuses.insert(correlation_id.into(), status);
    }

    /// Requests seen by `initiate`, in arrival order
    pub fn initiated(&self) -> Vec<PaymentRequest> {
        self.initiated.lock().clone()
    }

    pub fn initiate_count(&self) -> usize {
        self.initiated.lock().len()
    }
}

impl Default for MockGateway {
    fn default() -> Self {
        Self::accepting()
    }
}

#[async_trait]
impl PaymentGateway for MockGateway {
    async fn initiate(&self, request: &PaymentRequest) -> ReserveResult<GatewayAck> {
        self.initiated.lock().push(request.clone());
        let behavior = self.behavior.lock().clone();

        if let MockBehavior::AcceptAfter(delay) = behavior {
            tokio::time::sleep(delay).await;
        }

        match behavior {
            MockBehavior::Accept | MockBehavior::AcceptAfter(_) => {
                let n = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
                Ok(GatewayAck {
                    correlation_id: format!("ws_CO_{:08}", n),
                    merchant_request_id: Some(format!("mock-{}", n)),
                    customer_message: Some("Success. Request accepted for processing".into()),
                })
            }
            MockBehavior::Reject(reason) => Err(ReserveError::GatewayRejected { reason }),
            MockBehavior::Unavailable => Err(ReserveError::GatewayUnavailable(
                "connection refused".into(),
            )),
            MockBehavior::Hang => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Err(ReserveError::GatewayTimeout("mock gateway hung".into()))
            }
        }
    }

    async fn query_status(&self, correlation_id: &str) -> ReserveResult<GatewayStatus> {
        Ok(self
            .statuses
            .get(correlation_id)
            .map(|s| s.clone())
            .unwrap_or(GatewayStatus::Pending))
    }

    fn provider_name(&self) -> &'static str {
        "mock"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> PaymentRequest {
        PaymentRequest {
            reservation_id: Uuid::new_v4(),
            payer_phone: "0712345678".into(),
            amount: 100,
            account_reference: "RES12345678".into(),
            idempotency_key: "key".into(),
        }
    }

    #[tokio::test]
    async fn test_mock_accepts_with_unique_ids() {
        let gateway = MockGateway::accepting();
        let a = gateway.initiate(&request()).await.unwrap();
        let b = gateway.initiate(&request()).await.unwrap();

        assert_ne!(a.correlation_id, b.correlation_id);
        assert_eq!(gateway.initiate_count(), 2);
    }

    #[tokio::test]
    async fn test_mock_behaviors() {
        let gateway = MockGateway::new(MockBehavior::Reject("Invalid PhoneNumber".into()));
        assert_eq!(
            gateway.initiate(&request()).await.unwrap_err(),
            ReserveError::GatewayRejected {
                reason: "Invalid PhoneNumber".into()
            }
        );

        gateway.set_behavior(MockBehavior::Unavailable);
        assert!(gateway.initiate(&request()).await.unwrap_err().is_retryable());
    }

    #[tokio::test]
    async fn test_mock_status_defaults_to_pending() {
        let gateway = MockGateway::accepting();
        assert_eq!(
            gateway.query_status("ws_CO_1").await.unwrap(),
            GatewayStatus::Pending
        );

        gateway.set_status("ws_CO_1", GatewayStatus::Failed { reason: "cancelled".into() });
        assert_eq!(
            gateway.query_status("ws_CO_1").await.unwrap(),
            GatewayStatus::Failed {
                reason: "cancelled".into()
            }
        );
    }
}
