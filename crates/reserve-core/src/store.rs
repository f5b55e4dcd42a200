//! # Reservation Store
//!
//! Durable record of booking attempts. State changes are conditional writes
//! that check the current status inside the same atomic step, so two
//! processes racing on one reservation cannot both apply a terminal
//! transition.

use crate::error::{ReserveError, ReserveResult};
use crate::reservation::{PaymentResolution, PaymentStatus, Reservation, ReservationStatus, Transition};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use uuid::Uuid;

/// Persistence contract for reservations.
///
/// Keys: `id` (primary), `correlation_id` (unique), `booking_key` (unique).
#[async_trait]
pub trait ReservationStore: Send + Sync {
    /// Insert a new row. Fails with `DuplicateBooking` when the booking key
    /// is already taken.
    async fn insert(&self, reservation: &Reservation) -> ReserveResult<()>;

    async fn get(&self, id: Uuid) -> ReserveResult<Option<Reservation>>;

    async fn find_by_correlation_id(&self, correlation_id: &str)
        -> ReserveResult<Option<Reservation>>;

    async fn find_by_booking_key(&self, key: &str) -> ReserveResult<Option<Reservation>>;

    /// Store the gateway correlation id and move the payment to `processing`.
    ///
    /// Also accepted after `mark_unresolved`, so an acknowledgement that
    /// arrives past the initiate deadline is still recorded. Returns false
    /// if the row was settled or already has a correlation id.
    async fn record_initiated(
        &self,
        id: Uuid,
        correlation_id: &str,
        at: DateTime<Utc>,
    ) -> ReserveResult<bool>;

    /// `pending -> processing` without a correlation id: the initiate call
    /// failed in a way that leaves its fate unknown.
    async fn mark_unresolved(&self, id: Uuid, reason: &str, at: DateTime<Utc>)
        -> ReserveResult<bool>;

    /// Apply a terminal outcome if and only if the reservation is still
    /// settleable. Exactly one concurrent caller observes `Applied`.
    async fn settle(
        &self,
        id: Uuid,
        resolution: &PaymentResolution,
        at: DateTime<Utc>,
    ) -> ReserveResult<Transition>;

    /// Flip `inventory_released` on a cancelled reservation. Returns true
    /// only for the caller that performed the flip.
    async fn mark_inventory_released(&self, id: Uuid) -> ReserveResult<bool>;

    /// Undo `mark_inventory_released` after the restore itself failed, so a
    /// later sweep retries it.
    async fn unmark_inventory_released(&self, id: Uuid) -> ReserveResult<bool>;

    /// Unsettled paid reservations last touched before `cutoff`, oldest first
    async fn list_stale(&self, cutoff: DateTime<Utc>, limit: usize)
        -> ReserveResult<Vec<Reservation>>;

    /// Cancelled reservations whose inventory was never given back
    async fn list_unreleased(&self, limit: usize) -> ReserveResult<Vec<Reservation>>;
}

/// Type alias for a shared store (dynamic dispatch)
pub type SharedReservationStore = Arc<dyn ReservationStore>;

/// Apply a resolution to a row already known to be settleable
pub fn apply_resolution(row: &mut Reservation, resolution: &PaymentResolution, at: DateTime<Utc>) {
    let (payment_status, status) = resolution.target_statuses(row.payment_status);
    row.payment_status = payment_status;
    row.status = status;
    match resolution {
        PaymentResolution::Succeeded { receipt_id } => {
            if receipt_id.is_some() {
                row.receipt_id = receipt_id.clone();
            }
        }
        PaymentResolution::Failed { reason } => {
            row.status_reason = Some(reason.clone());
        }
    }
    row.updated_at = at;
}

/// Process-local store; rows are guarded by their shard lock.
#[derive(Debug, Default)]
pub struct InMemoryReservationStore {
    rows: DashMap<Uuid, Reservation>,
    by_correlation: DashMap<String, Uuid>,
    by_booking_key: DashMap<String, Uuid>,
}

impl InMemoryReservationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an Arc-wrapped instance for sharing
    pub fn shared() -> SharedReservationStore {
        Arc::new(Self::new())
    }

    fn not_found(id: Uuid) -> ReserveError {
        ReserveError::ReservationNotFound {
            reservation_id: id.to_string(),
        }
    }
}

#[async_trait]
impl ReservationStore for InMemoryReservationStore {
    async fn insert(&self, reservation: &Reservation) -> ReserveResult<()> {
        match self.rows.entry(reservation.id) {
            Entry::Occupied(_) => {
                return Err(ReserveError::Storage(format!(
                    "reservation {} already exists",
                    reservation.id
                )))
            }
            Entry::Vacant(slot) => {
                slot.insert(reservation.clone());
            }
        }

        if let Some(key) = &reservation.booking_key {
            match self.by_booking_key.entry(key.clone()) {
                Entry::Occupied(existing) => {
                    let existing = *existing.get();
                    self.rows.remove(&reservation.id);
                    return Err(ReserveError::DuplicateBooking {
                        key: key.clone(),
                        reservation_id: existing.to_string(),
                    });
                }
                Entry::Vacant(slot) => {
                    slot.insert(reservation.id);
                }
            }
        }

        Ok(())
    }

    async fn get(&self, id: Uuid) -> ReserveResult<Option<Reservation>> {
        Ok(self.rows.get(&id).map(|r| r.clone()))
    }

    async fn find_by_correlation_id(
        &self,
        correlation_id: &str,
    ) -> ReserveResult<Option<Reservation>> {
        let id = match self.by_correlation.get(correlation_id) {
            Some(id) => *id,
            None => return Ok(None),
        };
        self.get(id).await
    }

    async fn find_by_booking_key(&self, key: &str) -> ReserveResult<Option<Reservation>> {
        let id = match self.by_booking_key.get(key) {
            Some(id) => *id,
            None => return Ok(None),
        };
        self.get(id).await
    }

    async fn record_initiated(
        &self,
        id: Uuid,
        correlation_id: &str,
        at: DateTime<Utc>,
    ) -> ReserveResult<bool> {
        let mut row = self.rows.get_mut(&id).ok_or_else(|| Self::not_found(id))?;
        if row.status != ReservationStatus::Pending
            || !row.payment_status.awaits_gateway()
            || row.correlation_id.is_some()
        {
            return Ok(false);
        }

        match self.by_correlation.entry(correlation_id.to_string()) {
            Entry::Occupied(existing) if *existing.get() != id => {
                return Err(ReserveError::Storage(format!(
                    "correlation id {} already belongs to reservation {}",
                    correlation_id,
                    existing.get()
                )));
            }
            Entry::Occupied(_) => {}
            Entry::Vacant(slot) => {
                slot.insert(id);
            }
        }

        row.correlation_id = Some(correlation_id.to_string());
        row.payment_status = PaymentStatus::Processing;
        row.updated_at = at;
        Ok(true)
    }

    async fn mark_unresolved(
        &self,
        id: Uuid,
        reason: &str,
        at: DateTime<Utc>,
    ) -> ReserveResult<bool> {
        let mut row = self.rows.get_mut(&id).ok_or_else(|| Self::not_found(id))?;
        if row.status != ReservationStatus::Pending || row.payment_status != PaymentStatus::Pending {
            return Ok(false);
        }

        row.payment_status = PaymentStatus::Processing;
        row.status_reason = Some(reason.to_string());
        row.updated_at = at;
        Ok(true)
    }

    async fn settle(
        &self,
        id: Uuid,
        resolution: &PaymentResolution,
        at: DateTime<Utc>,
    ) -> ReserveResult<Transition> {
        let mut row = self.rows.get_mut(&id).ok_or_else(|| Self::not_found(id))?;
        if !row.is_settleable() {
            return Ok(Transition::AlreadySettled(row.clone()));
        }

        apply_resolution(&mut row, resolution, at);
        Ok(Transition::Applied(row.clone()))
    }

    async fn mark_inventory_released(&self, id: Uuid) -> ReserveResult<bool> {
        let mut row = self.rows.get_mut(&id).ok_or_else(|| Self::not_found(id))?;
        if !row.needs_release() {
            return Ok(false);
        }
        row.inventory_released = true;
        Ok(true)
    }

    async fn unmark_inventory_released(&self, id: Uuid) -> ReserveResult<bool> {
        let mut row = self.rows.get_mut(&id).ok_or_else(|| Self::not_found(id))?;
        if row.status != ReservationStatus::Cancelled || !row.inventory_released {
            return Ok(false);
        }
        row.inventory_released = false;
        Ok(true)
    }

    async fn list_stale(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> ReserveResult<Vec<Reservation>> {
        let mut stale: Vec<Reservation> = self
            .rows
            .iter()
            .filter(|r| {
                r.status == ReservationStatus::Pending
                    && r.payment_status.awaits_gateway()
                    && r.updated_at < cutoff
            })
            .map(|r| r.clone())
            .collect();
        stale.sort_by_key(|r| r.updated_at);
        stale.truncate(limit);
        Ok(stale)
    }

    async fn list_unreleased(&self, limit: usize) -> ReserveResult<Vec<Reservation>> {
        Ok(self
            .rows
            .iter()
            .filter(|r| r.needs_release())
            .take(limit)
            .map(|r| r.clone())
            .collect())
    }
}
