//! # Offering Types
//!
//! Bookable offerings (businesses and ticketed events) and the inventory
//! entry that tracks their remaining capacity.

use serde::{Deserialize, Serialize};

/// Nominal capacity for businesses published without an explicit one
pub const DEFAULT_BUSINESS_CAPACITY: u32 = 999_999;

/// Offering kind
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OfferingKind {
    /// Venue bookings (tables, rooms)
    Business,
    /// Ticketed, time-based event
    #[default]
    Event,
}

impl OfferingKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OfferingKind::Business => "business",
            OfferingKind::Event => "event",
        }
    }
}

/// An offering to publish into the inventory ledger
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Offering {
    /// Business or event id
    pub id: String,

    /// Display name
    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub kind: OfferingKind,

    /// Total bookable capacity; businesses default to a nominal maximum
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capacity: Option<u32>,
}

impl Offering {
    /// Create a ticketed event
    pub fn event(id: impl Into<String>, name: impl Into<String>, capacity: u32) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            kind: OfferingKind::Event,
            capacity: Some(capacity),
        }
    }

    /// Create a business with the nominal capacity
    pub fn business(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            kind: OfferingKind::Business,
            capacity: None,
        }
    }

    /// Capacity the ledger entry starts with
    pub fn total_capacity(&self) -> u32 {
        match (self.kind, self.capacity) {
            (_, Some(capacity)) => capacity,
            (OfferingKind::Business, None) => DEFAULT_BUSINESS_CAPACITY,
            (OfferingKind::Event, None) => 0,
        }
    }
}

/// Ledger view of an offering.
///
/// Invariant: `0 <= remaining <= total`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryEntry {
    pub offering_id: String,
    pub total: u32,
    pub remaining: u32,
}

impl InventoryEntry {
    pub fn is_sold_out(&self) -> bool {
        self.remaining == 0
    }
}

/// Offerings seeded at startup (loaded from config)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OfferingCatalog {
    #[serde(default)]
    pub offerings: Vec<Offering>,
}

impl OfferingCatalog {
    /// Load catalog from TOML string
    pub fn from_toml(toml_str: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(toml_str)
    }

    pub fn get(&self, id: &str) -> Option<&Offering> {
        self.offerings.iter().find(|o| o.id == id)
    }
}
