//! # STK Push Callbacks
//!
//! Authentication and parsing of the `stkCallback` notifications Daraja
//! POSTs to the callback URL.
//!
//! Daraja does not sign callbacks. A shared secret is therefore accepted in
//! either of two places:
//! - a `token` query parameter embedded in the registered callback URL
//! - an `X-Callback-Signature` header carrying the hex HMAC-SHA256 of the
//!   raw body, for deployments behind a relay that signs what it forwards

use crate::config::MpesaConfig;
use crate::wire::{CallbackEnvelope, CallbackMetadata};
use reserve_core::{PaymentNotification, PaymentResolution, ReserveError, ReserveResult};
use serde_json::{json, Value};
use tracing::{debug, warn};

/// Header checked for a relay signature
pub const SIGNATURE_HEADER: &str = "x-callback-signature";

/// A parsed callback plus the metadata worth logging
#[derive(Debug, Clone, PartialEq)]
pub struct CallbackDetails {
    pub notification: PaymentNotification,
    pub merchant_request_id: Option<String>,
    pub result_code: i64,
    pub result_desc: Option<String>,
    pub amount: Option<String>,
    pub phone: Option<String>,
    pub transaction_date: Option<String>,
}

/// Parse a raw callback body.
///
/// Result code 0 is a successful payment; every other code is a failure
/// (cancelled on the handset, insufficient funds, timeout at the payer).
pub fn parse_callback(payload: &[u8]) -> ReserveResult<CallbackDetails> {
    let envelope: CallbackEnvelope = serde_json::from_slice(payload).map_err(|e| {
        ReserveError::CallbackParseError(format!("Failed to parse callback: {}", e))
    })?;
    let callback = envelope.body.stk_callback;

    if callback.checkout_request_id.trim().is_empty() {
        return Err(ReserveError::CallbackParseError(
            "Missing CheckoutRequestID".to_string(),
        ));
    }

    let result_code = callback.result_code.as_i64().ok_or_else(|| {
        ReserveError::CallbackParseError(format!(
            "Non-numeric ResultCode: {}",
            callback.result_code
        ))
    })?;
    let metadata = callback.callback_metadata.unwrap_or_default();

    let resolution = if result_code == 0 {
        PaymentResolution::Succeeded {
            receipt_id: metadata.text("MpesaReceiptNumber"),
        }
    } else {
        PaymentResolution::failed(
            callback
                .result_desc
                .clone()
                .unwrap_or_else(|| format!("result code {}", result_code)),
        )
    };

    debug!(
        "Parsed STK callback: checkout_request_id={}, result_code={}",
        callback.checkout_request_id, result_code
    );

    Ok(CallbackDetails {
        notification: PaymentNotification {
            correlation_id: callback.checkout_request_id,
            resolution,
        },
        merchant_request_id: callback.merchant_request_id,
        result_code,
        result_desc: callback.result_desc,
        amount: metadata.text("Amount"),
        phone: metadata.text("PhoneNumber"),
        transaction_date: metadata.text("TransactionDate"),
    })
}

/// Body returned to Daraja once a callback is understood
pub fn acknowledgement() -> Value {
    json!({ "ResultCode": 0, "ResultDesc": "Accepted" })
}

/// Checks the shared callback secret
#[derive(Clone, Default)]
pub struct CallbackVerifier {
    secret: Option<String>,
}

impl CallbackVerifier {
    pub fn new(secret: Option<String>) -> Self {
        Self { secret }
    }

    pub fn from_config(config: &MpesaConfig) -> Self {
        Self::new(config.callback_secret.clone())
    }

    /// Without a secret every callback is accepted (local development)
    pub fn is_enforced(&self) -> bool {
        self.secret.is_some()
    }

    pub fn verify(
        &self,
        token: Option<&str>,
        signature: Option<&str>,
        payload: &[u8],
    ) -> ReserveResult<()> {
        let Some(secret) = &self.secret else {
            return Ok(());
        };

        if let Some(token) = token {
            if constant_time_compare(token, secret) {
                return Ok(());
            }
        }

        if let Some(signature) = signature {
            let expected = compute_hmac_sha256(secret, payload);
            if constant_time_compare(&signature.trim().to_ascii_lowercase(), &expected) {
                return Ok(());
            }
        }

        warn!("Rejected callback with missing or invalid credentials");
        Err(ReserveError::CallbackVerificationFailed(
            "Missing or invalid callback credentials".to_string(),
        ))
    }
}

pub fn compute_hmac_sha256(secret: &str, message: &[u8]) -> String {
    use hmac::{Hmac, Mac};
    use sha2::Sha256;

    type HmacSha256 = Hmac<Sha256>;

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .expect("HMAC can take key of any size");
    mac.update(message);
    hex::encode(mac.finalize().into_bytes())
}

fn constant_time_compare(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.bytes()
        .zip(b.bytes())
        .fold(0, |acc, (x, y)| acc | (x ^ y))
        == 0
}
