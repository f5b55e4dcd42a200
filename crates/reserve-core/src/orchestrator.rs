//! # Payment Orchestrator
//!
//! Drives a booking through `created → inventory_reserved →
//! payment_requested → {payment_confirmed | payment_declined | timed_out}`.
//!
//! The synchronous booking path, gateway callbacks and the reconciliation
//! sweep run independently and may interleave arbitrarily. They meet only in
//! the store: every terminal transition goes through
//! [`ReservationStore::settle`], a compare-and-set on "still settleable", and
//! only the winner touches inventory.
//!
//! Initiation failures split in two:
//! - a synchronous decline cancels the reservation and restores inventory
//!   before the booking call returns;
//! - an unreachable gateway or a timeout leaves the attempt unresolved
//!   (`processing`). The gateway may still have accepted the request, so
//!   inventory stays reserved until a callback or the sweep decides.

use crate::error::{ReserveError, ReserveResult};
use crate::gateway::{BoxedPaymentGateway, GatewayAck, GatewayStatus, PaymentRequest};
use crate::ledger::SharedLedger;
use crate::offering::{InventoryEntry, Offering};
use crate::reservation::{
    BookingRequest, PaymentNotification, PaymentResolution, PaymentStatus, Reservation,
    ReservationStatus, Transition,
};
use crate::store::SharedReservationStore;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// Timing and batching knobs
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Upper bound on the blocking gateway call in the booking path
    pub initiate_timeout: Duration,
    /// How long an unsettled payment may wait for its callback before the
    /// sweep resolves it
    pub settle_window: Duration,
    /// Upper bound on one status query during a sweep
    pub status_query_timeout: Duration,
    /// Max reservations handled per sweep pass
    pub sweep_batch_size: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            initiate_timeout: Duration::from_secs(10),
            settle_window: Duration::from_secs(300),
            status_query_timeout: Duration::from_secs(10),
            sweep_batch_size: 100,
        }
    }
}

/// What the caller of `book` learns synchronously
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum BookingOutcome {
    /// Push prompt sent; confirmation arrives asynchronously
    Initiated {
        reservation_id: Uuid,
        correlation_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        customer_message: Option<String>,
    },
    /// Gateway unreachable or slow; check the reservation later
    PendingConfirmation { reservation_id: Uuid },
    /// No payment needed (or already paid on replay)
    Confirmed { reservation_id: Uuid },
    /// Gateway or payer declined; inventory was given back
    Declined { reservation_id: Uuid, reason: String },
    /// Not enough capacity; no reservation was created
    SoldOut { offering_id: String },
}

impl BookingOutcome {
    /// Describe an existing reservation as a booking outcome (replays)
    pub fn from_existing(reservation: &Reservation) -> Self {
        let reservation_id = reservation.id;
        match reservation.status {
            ReservationStatus::Confirmed | ReservationStatus::Completed => {
                BookingOutcome::Confirmed { reservation_id }
            }
            ReservationStatus::Cancelled => BookingOutcome::Declined {
                reservation_id,
                reason: reservation
                    .status_reason
                    .clone()
                    .unwrap_or_else(|| "payment failed".to_string()),
            },
            ReservationStatus::Pending => match &reservation.correlation_id {
                Some(correlation_id) => BookingOutcome::Initiated {
                    reservation_id,
                    correlation_id: correlation_id.clone(),
                    customer_message: None,
                },
                None => BookingOutcome::PendingConfirmation { reservation_id },
            },
        }
    }

    pub fn reservation_id(&self) -> Option<Uuid> {
        match self {
            BookingOutcome::Initiated { reservation_id, .. }
            | BookingOutcome::PendingConfirmation { reservation_id }
            | BookingOutcome::Confirmed { reservation_id }
            | BookingOutcome::Declined { reservation_id, .. } => Some(*reservation_id),
            BookingOutcome::SoldOut { .. } => None,
        }
    }
}

/// Result of feeding a gateway notification to the orchestrator
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotificationResult {
    /// First delivery; state changed
    Applied(Reservation),
    /// Reservation was already settled; nothing changed
    Duplicate(Reservation),
    /// No reservation carries this correlation id
    Unmatched { correlation_id: String },
}

/// Counters for one sweep pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub examined: usize,
    pub confirmed: usize,
    pub expired: usize,
    pub already_settled: usize,
    pub released: usize,
    pub errors: usize,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self.examined == 0 && self.released == 0 && self.errors == 0
    }
}

/// Coordinates the store, the ledger and the gateway.
pub struct Orchestrator {
    store: SharedReservationStore,
    ledger: SharedLedger,
    gateway: BoxedPaymentGateway,
    config: OrchestratorConfig,
}

impl Orchestrator {
    pub fn new(
        store: SharedReservationStore,
        ledger: SharedLedger,
        gateway: BoxedPaymentGateway,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            store,
            ledger,
            gateway,
            config,
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn provider_name(&self) -> &'static str {
        self.gateway.provider_name()
    }

    /// Publish an offering into the ledger
    pub async fn publish_offering(&self, offering: &Offering) -> ReserveResult<InventoryEntry> {
        let entry = self.ledger.publish(offering).await?;
        info!(
            "Published offering {}: kind={:?}, capacity={}",
            offering.id, offering.kind, entry.total
        );
        Ok(entry)
    }

    pub async fn inventory(&self, offering_id: &str) -> ReserveResult<InventoryEntry> {
        self.ledger
            .get(offering_id)
            .await?
            .ok_or_else(|| ReserveError::OfferingNotFound {
                offering_id: offering_id.to_string(),
            })
    }

    pub async fn reservation(&self, id: Uuid) -> ReserveResult<Reservation> {
        self.store
            .get(id)
            .await?
            .ok_or_else(|| ReserveError::ReservationNotFound {
                reservation_id: id.to_string(),
            })
    }

    /// Accept a booking: reserve inventory, create the row, request payment.
    ///
    /// Returns as soon as the gateway acknowledges (or fails to). Settlement
    /// happens later through [`Orchestrator::handle_notification`] or the
    /// sweep.
    #[instrument(skip(self, request), fields(offering_id = %request.offering_id, party_size = request.party_size))]
    pub async fn book(&self, request: BookingRequest) -> ReserveResult<BookingOutcome> {
        request.validate()?;

        if let Some(key) = &request.idempotency_key {
            if let Some(existing) = self.store.find_by_booking_key(key).await? {
                return replay(&existing, &request, key);
            }
        }

        match self
            .ledger
            .try_decrement(&request.offering_id, request.party_size)
            .await
        {
            Ok(entry) => debug!("Inventory reserved: remaining={}", entry.remaining),
            Err(ReserveError::InsufficientCapacity { remaining, .. }) => {
                info!(
                    "Sold out: {} requested, {} remaining",
                    request.party_size, remaining
                );
                return Ok(BookingOutcome::SoldOut {
                    offering_id: request.offering_id,
                });
            }
            Err(e) => return Err(e),
        }

        let reservation = Reservation::from_request(&request);
        if let Err(e) = self.store.insert(&reservation).await {
            // the row never existed, so this decrement is ours to undo
            if let Err(restore_err) = self
                .ledger
                .restore(&request.offering_id, request.party_size)
                .await
            {
                error!(
                    "Failed to restore inventory after rejected insert: {}",
                    restore_err
                );
            }

            return match (&e, &request.idempotency_key) {
                (ReserveError::DuplicateBooking { .. }, Some(key)) => {
                    let existing = self
                        .store
                        .find_by_booking_key(key)
                        .await?
                        .ok_or_else(|| e.clone())?;
                    info!("Concurrent duplicate booking resolved to {}", existing.id);
                    replay(&existing, &request, key)
                }
                _ => Err(e),
            };
        }

        info!(
            "Created reservation {}: amount={}, payment_status={}",
            reservation.id, reservation.amount, reservation.payment_status
        );

        if reservation.payment_status == PaymentStatus::NotRequired {
            let transition = self
                .settle(reservation.id, PaymentResolution::Succeeded { receipt_id: None })
                .await?;
            return Ok(BookingOutcome::from_existing(transition.reservation()));
        }

        self.initiate_payment(&reservation).await
    }

    async fn initiate_payment(&self, reservation: &Reservation) -> ReserveResult<BookingOutcome> {
        let id = reservation.id;
        let request = PaymentRequest::for_reservation(reservation)?;

        // Runs on its own task: past the deadline the request may still be
        // accepted, and its correlation id must still reach the store.
        let gateway = self.gateway.clone();
        let store = self.store.clone();
        let mut attempt: InitiateTask = tokio::spawn(async move {
            let ack = gateway.initiate(&request).await?;
            let recorded = store
                .record_initiated(id, &ack.correlation_id, Utc::now())
                .await?;
            Ok::<_, ReserveError>((ack, recorded))
        });

        let joined = match timeout(self.config.initiate_timeout, &mut attempt).await {
            Ok(joined) => joined,
            Err(_) => {
                let reason = format!(
                    "initiate timed out after {}ms",
                    self.config.initiate_timeout.as_millis()
                );
                warn!("Payment initiation for {} unresolved: {}", id, reason);
                tokio::spawn(watch_late_initiation(id, attempt));
                return self.mark_unresolved(id, &reason).await;
            }
        };

        let result = match joined {
            Ok(result) => result,
            Err(e) => {
                error!("Initiate task for {} failed: {}", id, e);
                return self
                    .mark_unresolved(id, &format!("initiate task failed: {}", e))
                    .await;
            }
        };

        match result {
            Ok((ack, true)) => {
                info!(
                    "Payment requested for {}: correlation_id={}",
                    id, ack.correlation_id
                );
                Ok(BookingOutcome::Initiated {
                    reservation_id: id,
                    correlation_id: ack.correlation_id,
                    customer_message: ack.customer_message,
                })
            }
            Ok((ack, false)) => {
                warn!(
                    "Reservation {} moved on before initiation {} was recorded",
                    id, ack.correlation_id
                );
                let current = self.reservation(id).await?;
                Ok(BookingOutcome::from_existing(&current))
            }
            Err(ReserveError::GatewayRejected { reason }) => {
                warn!("Gateway rejected payment for {}: {}", id, reason);
                let transition = self.settle(id, PaymentResolution::failed(reason)).await?;
                Ok(BookingOutcome::from_existing(transition.reservation()))
            }
            Err(e) => {
                warn!("Payment initiation for {} unresolved: {}", id, e);
                self.mark_unresolved(id, &e.to_string()).await
            }
        }
    }

    async fn mark_unresolved(&self, id: Uuid, reason: &str) -> ReserveResult<BookingOutcome> {
        if self.store.mark_unresolved(id, reason, Utc::now()).await? {
            return Ok(BookingOutcome::PendingConfirmation { reservation_id: id });
        }
        let current = self.reservation(id).await?;
        Ok(BookingOutcome::from_existing(&current))
    }

    /// The guarded entry point for every terminal transition.
    ///
    /// Whichever caller wins the store's compare-and-set applies the status
    /// change and, for failures, restores inventory. Every other caller gets
    /// `AlreadySettled` and changes nothing.
    #[instrument(skip(self, resolution), fields(reservation_id = %id, success = resolution.is_success()))]
    pub async fn settle(&self, id: Uuid, resolution: PaymentResolution) -> ReserveResult<Transition> {
        let transition = self.store.settle(id, &resolution, Utc::now()).await?;

        match &transition {
            Transition::Applied(reservation) => {
                info!(
                    "Settled reservation {}: status={}, payment_status={}",
                    reservation.id, reservation.status, reservation.payment_status
                );
                if reservation.status == ReservationStatus::Cancelled {
                    if let Err(e) = self.release_inventory(reservation).await {
                        error!(
                            "Failed to restore inventory for {}: {}",
                            reservation.id, e
                        );
                    }
                }
            }
            Transition::AlreadySettled(reservation) => {
                info!(
                    "Discarding settlement for {}: already {}/{}",
                    reservation.id, reservation.status, reservation.payment_status
                );
            }
        }

        Ok(transition)
    }

    /// Restore a cancelled reservation's inventory, at most once
    async fn release_inventory(&self, reservation: &Reservation) -> ReserveResult<bool> {
        if !self.store.mark_inventory_released(reservation.id).await? {
            debug!("Inventory for {} already released", reservation.id);
            return Ok(false);
        }

        let entry = match self
            .ledger
            .restore(&reservation.offering_id, reservation.party_size)
            .await
        {
            Ok(entry) => entry,
            Err(e) => {
                // hand the row back so the next sweep retries the restore
                if let Err(unmark_err) = self.store.unmark_inventory_released(reservation.id).await {
                    error!(
                        "Failed to clear release marker for {}: {}",
                        reservation.id, unmark_err
                    );
                }
                return Err(e);
            }
        };
        info!(
            "Restored {} units of {} for {}: remaining={}",
            reservation.party_size, reservation.offering_id, reservation.id, entry.remaining
        );
        Ok(true)
    }

    /// Apply an authenticated gateway notification.
    ///
    /// Unknown correlation ids and repeated deliveries are not errors.
    #[instrument(skip(self, notification), fields(correlation_id = %notification.correlation_id))]
    pub async fn handle_notification(
        &self,
        notification: PaymentNotification,
    ) -> ReserveResult<NotificationResult> {
        let Some(reservation) = self
            .store
            .find_by_correlation_id(&notification.correlation_id)
            .await?
        else {
            warn!(
                "No reservation for correlation id {}, dropping notification",
                notification.correlation_id
            );
            return Ok(NotificationResult::Unmatched {
                correlation_id: notification.correlation_id,
            });
        };

        Ok(match self.settle(reservation.id, notification.resolution).await? {
            Transition::Applied(r) => NotificationResult::Applied(r),
            Transition::AlreadySettled(r) => NotificationResult::Duplicate(r),
        })
    }

    /// Run one reconciliation pass against the current time
    pub async fn sweep(&self) -> ReserveResult<SweepReport> {
        self.sweep_at(Utc::now()).await
    }

    /// Resolve every payment left unsettled for longer than the settle
    /// window as of `now`, then give back inventory still held by cancelled
    /// reservations.
    ///
    /// Anything the gateway cannot confirm as paid is failed.
    #[instrument(skip(self))]
    pub async fn sweep_at(&self, now: DateTime<Utc>) -> ReserveResult<SweepReport> {
        let window = chrono::Duration::from_std(self.config.settle_window).map_err(|e| {
            ReserveError::Configuration(format!("settle window out of range: {}", e))
        })?;
        let cutoff = now - window;

        let mut report = SweepReport::default();
        let stale = self
            .store
            .list_stale(cutoff, self.config.sweep_batch_size)
            .await?;

        for reservation in stale {
            report.examined += 1;
            let resolution = self.resolve_stale(&reservation).await;

            match self.settle(reservation.id, resolution).await {
                Ok(Transition::Applied(r)) if r.status == ReservationStatus::Confirmed => {
                    report.confirmed += 1
                }
                Ok(Transition::Applied(_)) => report.expired += 1,
                Ok(Transition::AlreadySettled(_)) => report.already_settled += 1,
                Err(e) => {
                    error!("Sweep failed to settle {}: {}", reservation.id, e);
                    report.errors += 1;
                }
            }
        }

        for reservation in self.store.list_unreleased(self.config.sweep_batch_size).await? {
            match self.release_inventory(&reservation).await {
                Ok(true) => report.released += 1,
                Ok(false) => {}
                Err(e) => {
                    error!("Sweep failed to release {}: {}", reservation.id, e);
                    report.errors += 1;
                }
            }
        }

        Ok(report)
    }

    async fn resolve_stale(&self, reservation: &Reservation) -> PaymentResolution {
        let Some(correlation_id) = reservation.correlation_id.as_deref() else {
            return PaymentResolution::failed("payment initiation unresolved past settlement window");
        };

        match timeout(
            self.config.status_query_timeout,
            self.gateway.query_status(correlation_id),
        )
        .await
        {
            Ok(Ok(GatewayStatus::Succeeded { receipt_id })) => {
                PaymentResolution::Succeeded { receipt_id }
            }
            Ok(Ok(GatewayStatus::Failed { reason })) => PaymentResolution::failed(reason),
            Ok(Ok(GatewayStatus::Pending)) => {
                PaymentResolution::failed("payment not confirmed within settlement window")
            }
            Ok(Err(e)) => {
                warn!("Status query for {} failed: {}", correlation_id, e);
                PaymentResolution::failed(format!("status query failed: {}", e))
            }
            Err(_) => PaymentResolution::failed("status query timed out"),
        }
    }
}

type InitiateTask = JoinHandle<ReserveResult<(GatewayAck, bool)>>;

/// Log how an initiate call that missed its deadline ended
async fn watch_late_initiation(id: Uuid, attempt: InitiateTask) {
    match attempt.await {
        Ok(Ok((ack, true))) => info!(
            "Late acknowledgement for {} recorded: correlation_id={}",
            id, ack.correlation_id
        ),
        Ok(Ok((ack, false))) => warn!(
            "Late acknowledgement {} for {} arrived after settlement",
            ack.correlation_id, id
        ),
        Ok(Err(e)) => warn!("Late initiation for {} failed: {}", id, e),
        Err(e) => error!("Initiate task for {} failed: {}", id, e),
    }
}

/// Outcome for a repeated idempotency key, provided the payload is the same
fn replay(
    existing: &Reservation,
    request: &BookingRequest,
    key: &str,
) -> ReserveResult<BookingOutcome> {
    if !existing.matches_request(request) {
        warn!(
            "Idempotency key {} reused with a different booking than {}",
            key, existing.id
        );
        return Err(ReserveError::DuplicateBooking {
            key: key.to_string(),
            reservation_id: existing.id.to_string(),
        });
    }

    info!("Replaying booking {} for idempotency key {}", existing.id, key);
    Ok(BookingOutcome::from_existing(existing))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::{MockBehavior, MockGateway};
    use crate::ledger::{InMemoryLedger, InventoryLedger};
    use crate::offering::Offering;
    use crate::store::{InMemoryReservationStore, ReservationStore};
    use async_trait::async_trait;
    use chrono::NaiveDate;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    const OFFERING: &str = "evt-jazz-night";

    struct Harness {
        orchestrator: Arc<Orchestrator>,
        gateway: Arc<MockGateway>,
        store: SharedReservationStore,
    }

    async fn harness(capacity: u32, behavior: MockBehavior) -> Harness {
        let gateway = Arc::new(MockGateway::new(behavior));
        let store = InMemoryReservationStore::shared();
        let orchestrator = Arc::new(Orchestrator::new(
            store.clone(),
            InMemoryLedger::shared(),
            gateway.clone(),
            OrchestratorConfig {
                initiate_timeout: Duration::from_millis(100),
                ..Default::default()
            },
        ));
        orchestrator
            .publish_offering(&Offering::event(OFFERING, "Jazz Night", capacity))
            .await
            .unwrap();
        Harness {
            orchestrator,
            gateway,
            store,
        }
    }

    fn booking(party_size: u32) -> BookingRequest {
        BookingRequest {
            offering_id: OFFERING.into(),
            requester_id: "user-1".into(),
            payer_phone: Some("0712345678".into()),
            amount: 1500,
            date: NaiveDate::from_ymd_opt(2026, 12, 24).unwrap(),
            time: "19:00".into(),
            party_size,
            special_requests: Some("window seat".into()),
            idempotency_key: None,
        }
    }

    async fn remaining(h: &Harness) -> u32 {
        h.orchestrator.inventory(OFFERING).await.unwrap().remaining
    }

    fn success(correlation_id: &str) -> PaymentNotification {
        PaymentNotification {
            correlation_id: correlation_id.into(),
            resolution: PaymentResolution::succeeded("NLJ7RT61SV"),
        }
    }

    fn expect_initiated(outcome: &BookingOutcome) -> (Uuid, String) {
        match outcome {
            BookingOutcome::Initiated {
                reservation_id,
                correlation_id,
                ..
            } => (*reservation_id, correlation_id.clone()),
            other => panic!("expected initiated, got {:?}", other),
        }
    }

    fn after_window(h: &Harness) -> DateTime<Utc> {
        Utc::now()
            + chrono::Duration::from_std(h.orchestrator.config().settle_window).unwrap()
            + chrono::Duration::seconds(1)
    }

    #[tokio::test]
    async fn test_book_initiates_payment() {
        let h = harness(10, MockBehavior::Accept).await;

        let outcome = h.orchestrator.book(booking(3)).await.unwrap();
        let (id, correlation_id) = expect_initiated(&outcome);

        let reservation = h.orchestrator.reservation(id).await.unwrap();
        assert_eq!(reservation.payment_status, PaymentStatus::Processing);
        assert_eq!(reservation.status, ReservationStatus::Pending);
        assert_eq!(reservation.correlation_id, Some(correlation_id));
        assert_eq!(reservation.special_requests.as_deref(), Some("window seat"));
        assert_eq!(remaining(&h).await, 7);

        let sent = h.gateway.initiated();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].reservation_id, id);
        assert_eq!(sent[0].amount, 1500);
        assert_eq!(sent[0].idempotency_key, reservation.payment_key);
        assert_eq!(sent[0].account_reference, reservation.account_reference());
    }

    #[tokio::test]
    async fn test_sold_out_creates_no_reservation() {
        let h = harness(1, MockBehavior::Accept).await;

        let outcome = h.orchestrator.book(booking(2)).await.unwrap();

        assert_eq!(
            outcome,
            BookingOutcome::SoldOut {
                offering_id: OFFERING.into()
            }
        );
        assert_eq!(h.gateway.initiate_count(), 0);
        assert_eq!(remaining(&h).await, 1);
        assert!(h
            .store
            .list_stale(after_window(&h), 10)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_unknown_offering_is_an_error() {
        let h = harness(1, MockBehavior::Accept).await;
        let mut request = booking(1);
        request.offering_id = "evt-missing".into();

        assert!(matches!(
            h.orchestrator.book(request).await,
            Err(ReserveError::OfferingNotFound { .. })
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_last_ticket_race_then_confirmation() {
        let h = harness(1, MockBehavior::Accept).await;

        let a = tokio::spawn({
            let orchestrator = h.orchestrator.clone();
            async move { orchestrator.book(booking(1)).await.unwrap() }
        });
        let b = tokio::spawn({
            let orchestrator = h.orchestrator.clone();
            async move { orchestrator.book(booking(1)).await.unwrap() }
        });
        let outcomes = [a.await.unwrap(), b.await.unwrap()];

        let sold_out = outcomes
            .iter()
            .filter(|o| matches!(o, BookingOutcome::SoldOut { .. }))
            .count();
        assert_eq!(sold_out, 1);

        let initiated = outcomes
            .iter()
            .find(|o| matches!(o, BookingOutcome::Initiated { .. }))
            .unwrap();
        let (id, correlation_id) = expect_initiated(initiated);

        let result = h
            .orchestrator
            .handle_notification(success(&correlation_id))
            .await
            .unwrap();
        assert!(matches!(result, NotificationResult::Applied(_)));

        let reservation = h.orchestrator.reservation(id).await.unwrap();
        assert_eq!(reservation.status, ReservationStatus::Confirmed);
        assert_eq!(reservation.payment_status, PaymentStatus::Completed);
        assert_eq!(reservation.receipt_id.as_deref(), Some("NLJ7RT61SV"));
        assert_eq!(remaining(&h).await, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_bookings_never_oversell() {
        let capacity = 5;
        let extra = 7;
        let h = harness(capacity, MockBehavior::Accept).await;

        let mut handles = Vec::new();
        for _ in 0..(capacity + extra) {
            let orchestrator = h.orchestrator.clone();
            handles.push(tokio::spawn(async move {
                orchestrator.book(booking(1)).await.unwrap()
            }));
        }

        let mut initiated = 0;
        let mut sold_out = 0;
        for handle in handles {
            match handle.await.unwrap() {
                BookingOutcome::Initiated { .. } => initiated += 1,
                BookingOutcome::SoldOut { .. } => sold_out += 1,
                other => panic!("unexpected outcome {:?}", other),
            }
        }

        assert_eq!(initiated, capacity);
        assert_eq!(sold_out, extra);
        assert_eq!(remaining(&h).await, 0);
        assert_eq!(h.gateway.initiate_count(), capacity as usize);
    }

    #[tokio::test]
    async fn test_declined_gateway_rolls_back() {
        let h = harness(4, MockBehavior::Reject("Invalid PhoneNumber".into())).await;

        let outcome = h.orchestrator.book(booking(2)).await.unwrap();

        let id = match &outcome {
            BookingOutcome::Declined {
                reservation_id,
                reason,
            } => {
                assert_eq!(reason, "Invalid PhoneNumber");
                *reservation_id
            }
            other => panic!("expected declined, got {:?}", other),
        };

        let reservation = h.orchestrator.reservation(id).await.unwrap();
        assert_eq!(reservation.status, ReservationStatus::Cancelled);
        assert_eq!(reservation.payment_status, PaymentStatus::Failed);
        assert!(reservation.inventory_released);
        assert_eq!(remaining(&h).await, 4);
    }

    #[tokio::test]
    async fn test_unavailable_gateway_leaves_payment_unresolved() {
        let h = harness(4, MockBehavior::Unavailable).await;

        let outcome = h.orchestrator.book(booking(2)).await.unwrap();
        let id = outcome.reservation_id().unwrap();
        assert_eq!(
            outcome,
            BookingOutcome::PendingConfirmation { reservation_id: id }
        );

        let reservation = h.orchestrator.reservation(id).await.unwrap();
        assert_eq!(reservation.payment_status, PaymentStatus::Processing);
        assert_eq!(reservation.status, ReservationStatus::Pending);
        assert!(reservation.correlation_id.is_none());
        // the payment may still land
        assert_eq!(remaining(&h).await, 2);
    }

    #[tokio::test]
    async fn test_initiate_timeout_leaves_payment_unresolved() {
        let h = harness(4, MockBehavior::Hang).await;

        let outcome = h.orchestrator.book(booking(1)).await.unwrap();
        let id = outcome.reservation_id().unwrap();

        assert_eq!(
            outcome,
            BookingOutcome::PendingConfirmation { reservation_id: id }
        );
        let reservation = h.orchestrator.reservation(id).await.unwrap();
        assert!(reservation
            .status_reason
            .as_deref()
            .unwrap()
            .contains("timed out"));
        assert_eq!(remaining(&h).await, 3);
    }

    #[tokio::test]
    async fn test_duplicate_success_callback_is_idempotent() {
        let h = harness(5, MockBehavior::Accept).await;
        let (id, correlation_id) = expect_initiated(&h.orchestrator.book(booking(2)).await.unwrap());

        let first = h
            .orchestrator
            .handle_notification(success(&correlation_id))
            .await
            .unwrap();
        let state_after_one = h.orchestrator.reservation(id).await.unwrap();
        let remaining_after_one = remaining(&h).await;

        for _ in 0..3 {
            let again = h
                .orchestrator
                .handle_notification(success(&correlation_id))
                .await
                .unwrap();
            assert!(matches!(again, NotificationResult::Duplicate(_)));
        }

        assert!(matches!(first, NotificationResult::Applied(_)));
        assert_eq!(h.orchestrator.reservation(id).await.unwrap(), state_after_one);
        assert_eq!(remaining(&h).await, remaining_after_one);
        assert_eq!(remaining_after_one, 3);
    }

    #[tokio::test]
    async fn test_duplicate_failure_callback_restores_once() {
        let h = harness(5, MockBehavior::Accept).await;
        let (id, correlation_id) = expect_initiated(&h.orchestrator.book(booking(2)).await.unwrap());
        expect_initiated(&h.orchestrator.book(booking(2)).await.unwrap());
        assert_eq!(remaining(&h).await, 1);

        let failure = PaymentNotification {
            correlation_id: correlation_id.clone(),
            resolution: PaymentResolution::failed("Request cancelled by user"),
        };
        h.orchestrator
            .handle_notification(failure.clone())
            .await
            .unwrap();
        h.orchestrator.handle_notification(failure).await.unwrap();

        // only the first reservation's two units come back
        assert_eq!(remaining(&h).await, 3);
        let reservation = h.orchestrator.reservation(id).await.unwrap();
        assert_eq!(reservation.status, ReservationStatus::Cancelled);
        assert_eq!(
            reservation.status_reason.as_deref(),
            Some("Request cancelled by user")
        );
    }

    #[tokio::test]
    async fn test_late_success_after_decline_is_discarded() {
        let h = harness(5, MockBehavior::Accept).await;
        let (id, correlation_id) = expect_initiated(&h.orchestrator.book(booking(1)).await.unwrap());

        h.orchestrator
            .handle_notification(PaymentNotification {
                correlation_id: correlation_id.clone(),
                resolution: PaymentResolution::failed("DS timeout user cannot be reached"),
            })
            .await
            .unwrap();
        let late = h
            .orchestrator
            .handle_notification(success(&correlation_id))
            .await
            .unwrap();

        assert!(matches!(late, NotificationResult::Duplicate(_)));
        let reservation = h.orchestrator.reservation(id).await.unwrap();
        assert_eq!(reservation.payment_status, PaymentStatus::Failed);
        assert!(reservation.receipt_id.is_none());
        assert_eq!(remaining(&h).await, 5);
    }

    #[tokio::test]
    async fn test_unknown_correlation_id_is_unmatched() {
        let h = harness(5, MockBehavior::Accept).await;

        let result = h
            .orchestrator
            .handle_notification(success("ws_CO_unknown"))
            .await
            .unwrap();

        assert_eq!(
            result,
            NotificationResult::Unmatched {
                correlation_id: "ws_CO_unknown".into()
            }
        );
    }

    #[tokio::test]
    async fn test_sweep_ignores_fresh_attempts() {
        let h = harness(5, MockBehavior::Unavailable).await;
        h.orchestrator.book(booking(1)).await.unwrap();

        let report = h.orchestrator.sweep_at(Utc::now()).await.unwrap();
        assert!(report.is_empty());
        assert_eq!(remaining(&h).await, 4);
    }

    #[tokio::test]
    async fn test_sweep_expires_unresolved_attempts() {
        let h = harness(5, MockBehavior::Unavailable).await;
        let id = h
            .orchestrator
            .book(booking(2))
            .await
            .unwrap()
            .reservation_id()
            .unwrap();

        let report = h.orchestrator.sweep_at(after_window(&h)).await.unwrap();
        assert_eq!(report.examined, 1);
        assert_eq!(report.expired, 1);

        let reservation = h.orchestrator.reservation(id).await.unwrap();
        assert_eq!(reservation.status, ReservationStatus::Cancelled);
        assert_eq!(reservation.payment_status, PaymentStatus::Failed);
        assert_eq!(remaining(&h).await, 5);

        // converged: a second pass has nothing to do
        let again = h.orchestrator.sweep_at(after_window(&h)).await.unwrap();
        assert!(again.is_empty());
        assert_eq!(remaining(&h).await, 5);
    }

    #[tokio::test]
    async fn test_sweep_expires_when_gateway_cannot_confirm() {
        let h = harness(5, MockBehavior::Accept).await;
        let (id, _) = expect_initiated(&h.orchestrator.book(booking(1)).await.unwrap());

        // mock answers Pending by default
        let report = h.orchestrator.sweep_at(after_window(&h)).await.unwrap();

        assert_eq!(report.expired, 1);
        let reservation = h.orchestrator.reservation(id).await.unwrap();
        assert_eq!(reservation.status, ReservationStatus::Cancelled);
        assert_eq!(remaining(&h).await, 5);
    }

    #[tokio::test]
    async fn test_sweep_confirms_when_gateway_reports_success() {
        let h = harness(5, MockBehavior::Accept).await;
        let (id, correlation_id) = expect_initiated(&h.orchestrator.book(booking(1)).await.unwrap());
        h.gateway.set_status(
            correlation_id,
            GatewayStatus::Succeeded {
                receipt_id: Some("QKJ8XY12AB".into()),
            },
        );

        let report = h.orchestrator.sweep_at(after_window(&h)).await.unwrap();

        assert_eq!(report.confirmed, 1);
        let reservation = h.orchestrator.reservation(id).await.unwrap();
        assert_eq!(reservation.status, ReservationStatus::Confirmed);
        assert_eq!(reservation.receipt_id.as_deref(), Some("QKJ8XY12AB"));
        assert_eq!(remaining(&h).await, 4);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_callback_and_sweep_race_has_one_winner() {
        for _ in 0..20 {
            let h = harness(3, MockBehavior::Accept).await;
            let (id, correlation_id) =
                expect_initiated(&h.orchestrator.book(booking(1)).await.unwrap());
            let sweep_time = after_window(&h);

            let callback = tokio::spawn({
                let orchestrator = h.orchestrator.clone();
                async move { orchestrator.handle_notification(success(&correlation_id)).await }
            });
            let sweep = tokio::spawn({
                let orchestrator = h.orchestrator.clone();
                async move { orchestrator.sweep_at(sweep_time).await }
            });

            let callback = callback.await.unwrap().unwrap();
            let sweep = sweep.await.unwrap().unwrap();

            let callback_won = matches!(callback, NotificationResult::Applied(_));
            let sweep_won = sweep.expired == 1;
            assert!(callback_won ^ sweep_won);

            let reservation = h.orchestrator.reservation(id).await.unwrap();
            if callback_won {
                assert_eq!(reservation.status, ReservationStatus::Confirmed);
                assert_eq!(remaining(&h).await, 2);
            } else {
                assert_eq!(reservation.status, ReservationStatus::Cancelled);
                assert_eq!(remaining(&h).await, 3);
            }
        }
    }

    #[tokio::test]
    async fn test_free_booking_is_confirmed_without_gateway() {
        let h = harness(5, MockBehavior::Accept).await;
        let mut request = booking(2);
        request.amount = 0;
        request.payer_phone = None;

        let outcome = h.orchestrator.book(request).await.unwrap();
        let id = outcome.reservation_id().unwrap();

        assert_eq!(outcome, BookingOutcome::Confirmed { reservation_id: id });
        let reservation = h.orchestrator.reservation(id).await.unwrap();
        assert_eq!(reservation.payment_status, PaymentStatus::NotRequired);
        assert_eq!(reservation.status, ReservationStatus::Confirmed);
        assert_eq!(h.gateway.initiate_count(), 0);
        assert_eq!(remaining(&h).await, 3);
    }

    #[tokio::test]
    async fn test_repeated_idempotency_key_replays_booking() {
        let h = harness(5, MockBehavior::Accept).await;
        let mut request = booking(2);
        request.idempotency_key = Some("checkout-7f3a".into());

        let first = h.orchestrator.book(request.clone()).await.unwrap();
        let second = h.orchestrator.book(request).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(h.gateway.initiate_count(), 1);
        assert_eq!(remaining(&h).await, 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_idempotent_bookings_decrement_once() {
        let h = harness(100, MockBehavior::Accept).await;
        let mut request = booking(2);
        request.idempotency_key = Some("checkout-race".into());

        let mut handles = Vec::new();
        for _ in 0..8 {
            let orchestrator = h.orchestrator.clone();
            let request = request.clone();
            handles.push(tokio::spawn(async move { orchestrator.book(request).await.unwrap() }));
        }

        let mut ids = Vec::new();
        for handle in handles {
            ids.push(handle.await.unwrap().reservation_id().unwrap());
        }
        ids.dedup();

        assert_eq!(ids.len(), 1);
        assert_eq!(remaining(&h).await, 98);
        assert_eq!(h.gateway.initiate_count(), 1);
    }

    #[tokio::test]
    async fn test_sweep_releases_orphaned_cancellations() {
        let h = harness(5, MockBehavior::Accept).await;
        let (id, _) = expect_initiated(&h.orchestrator.book(booking(2)).await.unwrap());

        // cancelled behind the orchestrator's back, as after a crash between
        // the status write and the restore
        h.store
            .settle(id, &PaymentResolution::failed("expired"), Utc::now())
            .await
            .unwrap();
        assert_eq!(remaining(&h).await, 3);

        let report = h.orchestrator.sweep_at(Utc::now()).await.unwrap();
        assert_eq!(report.released, 1);
        assert_eq!(remaining(&h).await, 5);

        let again = h.orchestrator.sweep_at(Utc::now()).await.unwrap();
        assert_eq!(again.released, 0);
        assert_eq!(remaining(&h).await, 5);
    }

    /// Ledger whose first `failures` restores error out
    struct BusyLedger {
        inner: InMemoryLedger,
        failures: AtomicUsize,
    }

    impl BusyLedger {
        fn failing_restores(failures: usize) -> Self {
            Self {
                inner: InMemoryLedger::new(),
                failures: AtomicUsize::new(failures),
            }
        }
    }

    #[async_trait]
    impl InventoryLedger for BusyLedger {
        async fn publish(&self, offering: &Offering) -> ReserveResult<InventoryEntry> {
            self.inner.publish(offering).await
        }

        async fn try_decrement(&self, offering_id: &str, amount: u32) -> ReserveResult<InventoryEntry> {
            self.inner.try_decrement(offering_id, amount).await
        }

        async fn restore(&self, offering_id: &str, amount: u32) -> ReserveResult<InventoryEntry> {
            let failing = self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failing {
                return Err(ReserveError::Storage("database is locked".into()));
            }
            self.inner.restore(offering_id, amount).await
        }

        async fn get(&self, offering_id: &str) -> ReserveResult<Option<InventoryEntry>> {
            self.inner.get(offering_id).await
        }
    }

    async fn wait_for_correlation_id(h: &Harness, id: Uuid) -> String {
        for _ in 0..100 {
            let reservation = h.orchestrator.reservation(id).await.unwrap();
            if let Some(correlation_id) = reservation.correlation_id {
                return correlation_id;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("acknowledgement for {} was never recorded", id);
    }

    #[tokio::test]
    async fn test_late_acknowledgement_is_recorded_and_matched() {
        let h = harness(4, MockBehavior::AcceptAfter(Duration::from_millis(300))).await;

        let outcome = h.orchestrator.book(booking(1)).await.unwrap();
        let id = outcome.reservation_id().unwrap();
        assert_eq!(
            outcome,
            BookingOutcome::PendingConfirmation { reservation_id: id }
        );
        assert!(h
            .orchestrator
            .reservation(id)
            .await
            .unwrap()
            .correlation_id
            .is_none());

        let correlation_id = wait_for_correlation_id(&h, id).await;
        let result = h
            .orchestrator
            .handle_notification(success(&correlation_id))
            .await
            .unwrap();

        assert!(matches!(result, NotificationResult::Applied(_)));
        let reservation = h.orchestrator.reservation(id).await.unwrap();
        assert_eq!(reservation.status, ReservationStatus::Confirmed);
        assert_eq!(reservation.payment_status, PaymentStatus::Completed);
        assert_eq!(reservation.receipt_id.as_deref(), Some("NLJ7RT61SV"));
        assert_eq!(remaining(&h).await, 3);
    }

    #[tokio::test]
    async fn test_sweep_queries_late_acknowledged_payment() {
        let h = harness(4, MockBehavior::AcceptAfter(Duration::from_millis(300))).await;
        let id = h
            .orchestrator
            .book(booking(2))
            .await
            .unwrap()
            .reservation_id()
            .unwrap();

        let correlation_id = wait_for_correlation_id(&h, id).await;
        h.gateway.set_status(
            correlation_id,
            GatewayStatus::Succeeded {
                receipt_id: Some("QKJ8XY12AB".into()),
            },
        );

        let report = h.orchestrator.sweep_at(after_window(&h)).await.unwrap();

        assert_eq!(report.confirmed, 1);
        let reservation = h.orchestrator.reservation(id).await.unwrap();
        assert_eq!(reservation.status, ReservationStatus::Confirmed);
        assert_eq!(reservation.receipt_id.as_deref(), Some("QKJ8XY12AB"));
        assert_eq!(remaining(&h).await, 2);
    }

    #[tokio::test]
    async fn test_failed_restore_is_retried_by_sweep() {
        let store = InMemoryReservationStore::shared();
        let ledger = Arc::new(BusyLedger::failing_restores(1));
        let orchestrator = Orchestrator::new(
            store.clone(),
            ledger.clone(),
            Arc::new(MockGateway::accepting()),
            OrchestratorConfig::default(),
        );
        orchestrator
            .publish_offering(&Offering::event(OFFERING, "Jazz Night", 2))
            .await
            .unwrap();
        let (id, correlation_id) = expect_initiated(&orchestrator.book(booking(1)).await.unwrap());

        let result = orchestrator
            .handle_notification(PaymentNotification {
                correlation_id,
                resolution: PaymentResolution::failed("Request cancelled by user"),
            })
            .await
            .unwrap();

        assert!(matches!(result, NotificationResult::Applied(_)));
        let reservation = orchestrator.reservation(id).await.unwrap();
        assert_eq!(reservation.status, ReservationStatus::Cancelled);
        assert!(!reservation.inventory_released);
        assert_eq!(orchestrator.inventory(OFFERING).await.unwrap().remaining, 1);

        let report = orchestrator.sweep_at(Utc::now()).await.unwrap();
        assert_eq!(report.released, 1);
        assert_eq!(report.errors, 0);
        assert!(orchestrator.reservation(id).await.unwrap().inventory_released);
        assert_eq!(orchestrator.inventory(OFFERING).await.unwrap().remaining, 2);

        let again = orchestrator.sweep_at(Utc::now()).await.unwrap();
        assert_eq!(again.released, 0);
        assert_eq!(orchestrator.inventory(OFFERING).await.unwrap().remaining, 2);
    }

    #[tokio::test]
    async fn test_reused_idempotency_key_with_different_booking_is_rejected() {
        let h = harness(5, MockBehavior::Accept).await;
        let mut request = booking(2);
        request.idempotency_key = Some("checkout-7f3a".into());
        let first = h.orchestrator.book(request.clone()).await.unwrap();

        let mut changed = request.clone();
        changed.party_size = 3;
        let err = h.orchestrator.book(changed).await.unwrap_err();

        match err {
            ReserveError::DuplicateBooking {
                key,
                reservation_id,
            } => {
                assert_eq!(key, "checkout-7f3a");
                assert_eq!(reservation_id, first.reservation_id().unwrap().to_string());
            }
            other => panic!("expected duplicate booking, got {:?}", other),
        }
        assert_eq!(h.gateway.initiate_count(), 1);
        assert_eq!(remaining(&h).await, 3);

        // the original payload still replays
        assert_eq!(h.orchestrator.book(request).await.unwrap(), first);
    }
}
