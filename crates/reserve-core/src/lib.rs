//! # reserve-core
//!
//! Core types and traits for the reservation payment engine.
//!
//! This crate provides:
//! - `InventoryLedger` for atomic capacity accounting per offering
//! - `ReservationStore` with compare-and-set settlement
//! - `PaymentGateway` trait for push-payment providers, plus `MockGateway`
//! - `Orchestrator` tying booking, callbacks and reconciliation together
//! - `ReserveError` for typed error handling
//!
//! ## Example
//!
//! ```rust,ignore
//! use reserve_core::{InMemoryLedger, InMemoryReservationStore, Offering, Orchestrator};
//!
//! let orchestrator = Orchestrator::new(
//!     InMemoryReservationStore::shared(),
//!     InMemoryLedger::shared(),
//!     gateway,
//!     OrchestratorConfig::default(),
//! );
//! orchestrator.publish_offering(&Offering::event("evt-jazz", "Jazz Night", 150)).await?;
//!
//! // Reserve inventory and push a payment prompt
//! let outcome = orchestrator.book(request).await?;
//!
//! // Later, from the callback endpoint
//! orchestrator.handle_notification(notification).await?;
//! ```

pub mod error;
pub mod gateway;
pub mod ledger;
pub mod offering;
pub mod orchestrator;
pub mod reservation;
pub mod store;
pub mod sweeper;

// Re-exports for convenience
pub use error::{ReserveError, ReserveResult};
pub use gateway::{
    BoxedPaymentGateway, GatewayAck, GatewayStatus, MockBehavior, MockGateway, PaymentGateway,
    PaymentRequest,
};
pub use ledger::{InMemoryLedger, InventoryLedger, SharedLedger};
pub use offering::{InventoryEntry, Offering, OfferingCatalog, OfferingKind};
pub use orchestrator::{
    BookingOutcome, NotificationResult, Orchestrator, OrchestratorConfig, SweepReport,
};
pub use reservation::{
    payment_key, BookingRequest, PaymentNotification, PaymentResolution, PaymentStatus,
    Reservation, ReservationStatus, Transition,
};
pub use store::{InMemoryReservationStore, ReservationStore, SharedReservationStore};
pub use sweeper::spawn_sweeper;
