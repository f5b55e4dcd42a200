//! # reserve-api
//!
//! HTTP API layer for reserve-pay-rs.
//!
//! This crate provides:
//! - Axum-based HTTP server
//! - REST endpoints for offerings and reservations
//! - The M-Pesa STK callback receiver
//! - SQLite persistence for reservations and inventory
//!
//! ## Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | GET | `/health` | Health check |
//! | POST | `/api/v1/offerings` | Publish offering |
//! | GET | `/api/v1/offerings/{id}` | Offering inventory |
//! | POST | `/api/v1/reservations` | Book and request payment |
//! | GET | `/api/v1/reservations/{id}` | Reservation state |
//! | POST | `/callback/mpesa` | M-Pesa STK callback |

pub mod db;
pub mod handlers;
pub mod routes;
pub mod state;

pub use db::Db;
pub use routes::create_router;
pub use state::{AppConfig, AppState};
