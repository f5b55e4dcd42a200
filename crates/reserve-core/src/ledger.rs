//! # Inventory Ledger
//!
//! Remaining bookable capacity per offering. Every mutation is a single
//! conditional operation on one key: decrement only if enough remains,
//! restore clamped to the total. Application code never reads a count and
//! writes it back.

use crate::error::{ReserveError, ReserveResult};
use crate::offering::{InventoryEntry, Offering};
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::debug;

/// Atomic capacity accounting.
///
/// Implementations must make each successful mutation visible to the next
/// read of the same offering.
#[async_trait]
pub trait InventoryLedger: Send + Sync {
    /// Create the entry for a newly published offering with
    /// `remaining = total`.
    async fn publish(&self, offering: &Offering) -> ReserveResult<InventoryEntry>;

    /// Take `amount` units if at least that many remain.
    ///
    /// Fails with `InsufficientCapacity` without touching the count.
    async fn try_decrement(&self, offering_id: &str, amount: u32) -> ReserveResult<InventoryEntry>;

    /// Give back `amount` units, never exceeding the total.
    async fn restore(&self, offering_id: &str, amount: u32) -> ReserveResult<InventoryEntry>;

    /// Current entry, if the offering was published
    async fn get(&self, offering_id: &str) -> ReserveResult<Option<InventoryEntry>>;
}

/// Type alias for a shared ledger (dynamic dispatch)
pub type SharedLedger = Arc<dyn InventoryLedger>;

/// Process-local ledger; each key is guarded by its shard lock.
#[derive(Debug, Default)]
pub struct InMemoryLedger {
    entries: DashMap<String, InventoryEntry>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an Arc-wrapped instance for sharing
    pub fn shared() -> SharedLedger {
        Arc::new(Self::new())
    }
}

#[async_trait]
impl InventoryLedger for InMemoryLedger {
    async fn publish(&self, offering: &Offering) -> ReserveResult<InventoryEntry> {
        match self.entries.entry(offering.id.clone()) {
            Entry::Occupied(_) => Err(ReserveError::OfferingExists {
                offering_id: offering.id.clone(),
            }),
            Entry::Vacant(slot) => {
                let total = offering.total_capacity();
                let entry = InventoryEntry {
                    offering_id: offering.id.clone(),
                    total,
                    remaining: total,
                };
                slot.insert(entry.clone());
                Ok(entry)
            }
        }
    }

    async fn try_decrement(&self, offering_id: &str, amount: u32) -> ReserveResult<InventoryEntry> {
        if amount == 0 {
            return Err(ReserveError::InvalidRequest(
                "decrement amount must be positive".into(),
            ));
        }

        let mut entry = self
            .entries
            .get_mut(offering_id)
            .ok_or_else(|| ReserveError::OfferingNotFound {
                offering_id: offering_id.to_string(),
            })?;

        if entry.remaining < amount {
            return Err(ReserveError::InsufficientCapacity {
                offering_id: offering_id.to_string(),
                requested: amount,
                remaining: entry.remaining,
            });
        }

        entry.remaining -= amount;
        debug!(
            "Decremented {} by {}: remaining={}",
            offering_id, amount, entry.remaining
        );
        Ok(entry.clone())
    }

    async fn restore(&self, offering_id: &str, amount: u32) -> ReserveResult<InventoryEntry> {
        let mut entry = self
            .entries
            .get_mut(offering_id)
            .ok_or_else(|| ReserveError::OfferingNotFound {
                offering_id: offering_id.to_string(),
            })?;

        entry.remaining = entry.remaining.saturating_add(amount).min(entry.total);
        debug!(
            "Restored {} by {}: remaining={}",
            offering_id, amount, entry.remaining
        );
        Ok(entry.clone())
    }

    async fn get(&self, offering_id: &str) -> ReserveResult<Option<InventoryEntry>> {
        Ok(self.entries.get(offering_id).map(|e| e.clone()))
    }
}
