//! # reserve-mpesa
//!
//! M-Pesa (Safaricom Daraja) push-payment gateway for reserve-pay-rs.
//!
//! - **MpesaGateway** - `PaymentGateway` over Lipa na M-Pesa Online
//!   - STK push with a per-request password
//!   - STK push query for the reconciliation sweep
//!   - Cached OAuth token, refreshed single-flight
//! - **callback** - parsing and authentication of `stkCallback` bodies
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use reserve_mpesa::MpesaGateway;
//! use reserve_core::PaymentGateway;
//!
//! let gateway = MpesaGateway::from_env()?;
//! let ack = gateway.initiate(&PaymentRequest::for_reservation(&reservation)?).await?;
//!
//! // ack.correlation_id is echoed as CheckoutRequestID in the callback
//! ```
//!
//! ## Callback Handling
//!
//! ```rust,ignore
//! use reserve_mpesa::{parse_callback, CallbackVerifier};
//!
//! verifier.verify(query_token, signature_header, &body)?;
//! let details = parse_callback(&body)?;
//! orchestrator.handle_notification(details.notification).await?;
//! ```

pub mod auth;
pub mod callback;
pub mod client;
pub mod config;
pub mod phone;
pub mod wire;

// Re-exports
pub use auth::AccessTokenCache;
pub use callback::{
    acknowledgement, compute_hmac_sha256, parse_callback, CallbackDetails, CallbackVerifier,
    SIGNATURE_HEADER,
};
pub use client::{stk_password, timestamp_now, MpesaGateway};
pub use config::{MpesaConfig, CALLBACK_PATH, SANDBOX_API_BASE_URL};
pub use phone::normalize_phone;
