//! # M-Pesa STK Push Gateway
//!
//! `PaymentGateway` implementation over the Daraja Lipa na M-Pesa Online
//! API: STK push to prompt the payer, STK push query to ask about attempts
//! whose callback never arrived.

use crate::auth::{transport_error, AccessTokenCache};
use crate::config::MpesaConfig;
use crate::phone::normalize_phone;
use crate::wire::{
    DarajaError, StkPushRequest, StkPushResponse, StkQueryRequest, StkQueryResponse,
};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::Utc;
use reqwest::{Client, StatusCode};
use reserve_core::{
    GatewayAck, GatewayStatus, PaymentGateway, PaymentRequest, ReserveError, ReserveResult,
};
use serde::Serialize;
use tracing::{debug, error, info, instrument, warn};

const STK_PUSH_PATH: &str = "/mpesa/stkpush/v1/processrequest";
const STK_QUERY_PATH: &str = "/mpesa/stkpushquery/v1/query";
const TRANSACTION_TYPE: &str = "CustomerPayBillOnline";

/// Daraja error code for a query about a request still in flight
const STILL_PROCESSING_CODE: &str = "500.001.1001";

/// STK push gateway
pub struct MpesaGateway {
    config: MpesaConfig,
    client: Client,
    tokens: AccessTokenCache,
}

impl MpesaGateway {
    /// Create a new M-Pesa gateway
    pub fn new(config: MpesaConfig) -> ReserveResult<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| ReserveError::Configuration(format!("HTTP client: {}", e)))?;
        let tokens = AccessTokenCache::new(&config, client.clone());

        Ok(Self {
            config,
            client,
            tokens,
        })
    }

    /// Create from environment variables
    pub fn from_env() -> ReserveResult<Self> {
        Self::new(MpesaConfig::from_env()?)
    }

    pub fn config(&self) -> &MpesaConfig {
        &self.config
    }

    /// POST a JSON body with a bearer token, retrying once with a fresh
    /// token when the gateway answers 401
    async fn post_json<T: Serialize>(
        &self,
        path: &str,
        body: &T,
        idempotency_key: Option<&str>,
    ) -> ReserveResult<(StatusCode, String)> {
        let url = format!("{}{}", self.config.api_base_url, path);
        let mut retried = false;

        loop {
            let token = self.tokens.token().await?;
            let mut request = self.client.post(&url).bearer_auth(&token).json(body);
            if let Some(key) = idempotency_key {
                request = request.header("Idempotency-Key", key);
            }

            let response = request.send().await.map_err(transport_error)?;
            let status = response.status();

            if status == StatusCode::UNAUTHORIZED && !retried {
                self.tokens.invalidate(&token).await;
                retried = true;
                continue;
            }

            let text = response.text().await.map_err(transport_error)?;
            return Ok((status, text));
        }
    }

    fn stk_push_request(&self, request: &PaymentRequest, phone: String) -> StkPushRequest {
        let timestamp = timestamp_now();
        StkPushRequest {
            business_short_code: self.config.business_shortcode.clone(),
            password: stk_password(&self.config.business_shortcode, &self.config.passkey, &timestamp),
            timestamp,
            transaction_type: TRANSACTION_TYPE,
            amount: request.amount,
            party_a: phone.clone(),
            party_b: self.config.business_shortcode.clone(),
            phone_number: phone,
            callback_url: self.config.callback_url(),
            account_reference: request.account_reference.clone(),
            transaction_desc: self.config.transaction_desc.clone(),
        }
    }
}

#[async_trait]
impl PaymentGateway for MpesaGateway {
    #[instrument(skip(self, request), fields(reservation_id = %request.reservation_id))]
    async fn initiate(&self, request: &PaymentRequest) -> ReserveResult<GatewayAck> {
        if request.amount == 0 {
            return Err(ReserveError::GatewayRejected {
                reason: "amount must be at least 1".to_string(),
            });
        }
        let phone = normalize_phone(&request.payer_phone, &self.config.country_code)?;
        let body = self.stk_push_request(request, phone);

        debug!(
            "Sending STK push: amount={}, account_reference={}",
            body.amount, body.account_reference
        );

        let (status, text) = self
            .post_json(STK_PUSH_PATH, &body, Some(&request.idempotency_key))
            .await?;

        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            error!("Daraja STK push error: status={}, body={}", status, text);
            return Err(ReserveError::GatewayUnavailable(format!(
                "STK push returned HTTP {}",
                status.as_u16()
            )));
        }

        if !status.is_success() {
            warn!("Daraja declined STK push: status={}, body={}", status, text);
            let reason = serde_json::from_str::<DarajaError>(&text)
                .ok()
                .and_then(|e| e.error_message)
                .unwrap_or_else(|| format!("HTTP {}", status.as_u16()));
            return Err(ReserveError::GatewayRejected { reason });
        }

        // a 2xx we cannot read may still have been accepted
        let ack: StkPushResponse = serde_json::from_str(&text).map_err(|e| {
            ReserveError::GatewayUnavailable(format!("unparseable STK push response: {}", e))
        })?;

        if !ack.response_code.is_zero() {
            let reason = ack
                .response_description
                .unwrap_or_else(|| format!("response code {}", ack.response_code));
            warn!("Daraja declined STK push: {}", reason);
            return Err(ReserveError::GatewayRejected { reason });
        }

        let correlation_id = ack.checkout_request_id.ok_or_else(|| {
            ReserveError::GatewayUnavailable("STK push ack without CheckoutRequestID".to_string())
        })?;

        info!("STK push accepted: checkout_request_id={}", correlation_id);
        Ok(GatewayAck {
            correlation_id,
            merchant_request_id: ack.merchant_request_id,
            customer_message: ack.customer_message,
        })
    }

    #[instrument(skip(self))]
    async fn query_status(&self, correlation_id: &str) -> ReserveResult<GatewayStatus> {
        let timestamp = timestamp_now();
        let body = StkQueryRequest {
            business_short_code: self.config.business_shortcode.clone(),
            password: stk_password(&self.config.business_shortcode, &self.config.passkey, &timestamp),
            timestamp,
            checkout_request_id: correlation_id.to_string(),
        };

        let (status, text) = self.post_json(STK_QUERY_PATH, &body, None).await?;

        if !status.is_success() {
            let detail = serde_json::from_str::<DarajaError>(&text).ok();
            let still_processing = detail.as_ref().map_or(false, |e| {
                e.error_code.as_deref() == Some(STILL_PROCESSING_CODE)
                    || e.error_message
                        .as_deref()
                        .map_or(false, |m| m.contains("being processed"))
            });
            if still_processing {
                debug!("STK push {} still processing", correlation_id);
                return Ok(GatewayStatus::Pending);
            }

            let message = detail
                .and_then(|e| e.error_message)
                .unwrap_or_else(|| format!("HTTP {}", status.as_u16()));
            return Err(if status.is_server_error() {
                ReserveError::GatewayUnavailable(message)
            } else {
                ReserveError::GatewayRejected { reason: message }
            });
        }

        let result: StkQueryResponse = serde_json::from_str(&text).map_err(|e| {
            ReserveError::GatewayUnavailable(format!("unparseable STK query response: {}", e))
        })?;

        let Some(code) = result.result_code else {
            return Ok(GatewayStatus::Pending);
        };

        if code.is_zero() {
            // the query API does not return the receipt number
            Ok(GatewayStatus::Succeeded { receipt_id: None })
        } else {
            Ok(GatewayStatus::Failed {
                reason: result
                    .result_desc
                    .unwrap_or_else(|| format!("result code {}", code)),
            })
        }
    }

    fn provider_name(&self) -> &'static str {
        "mpesa"
    }
}

/// `YYYYMMDDHHMMSS` of the current UTC time
pub fn timestamp_now() -> String {
    Utc::now().format("%Y%m%d%H%M%S").to_string()
}

/// STK password: base64 of short code, passkey and timestamp concatenated
pub fn stk_password(shortcode: &str, passkey: &str, timestamp: &str) -> String {
    STANDARD.encode(format!("{}{}{}", shortcode, passkey, timestamp))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use uuid::Uuid;
    use wiremock::matchers::{body_partial_json, header, header_exists, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn server_with_token() -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/oauth/v1/generate"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "tok-1",
                "expires_in": "3599",
            })))
            .mount(&server)
            .await;
        server
    }

    fn gateway(server: &MockServer) -> MpesaGateway {
        let config = MpesaConfig::new("key", "secret", "174379", "passkey", "https://pay.example.com")
            .with_api_base_url(server.uri())
            .with_request_timeout(Duration::from_millis(500));
        MpesaGateway::new(config).unwrap()
    }

    fn payment(phone: &str) -> PaymentRequest {
        PaymentRequest {
            reservation_id: Uuid::new_v4(),
            payer_phone: phone.into(),
            amount: 1500,
            account_reference: "RESABCDEF12".into(),
            idempotency_key: "3f2a9c".into(),
        }
    }

    fn accepted() -> ResponseTemplate {
        ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "MerchantRequestID": "29115-34620561-1",
            "CheckoutRequestID": "ws_CO_191220191020363925",
            "ResponseCode": "0",
            "ResponseDescription": "Success. Request accepted for processing",
            "CustomerMessage": "Success. Request accepted for processing",
        }))
    }

    #[test]
    fn test_stk_password() {
        assert_eq!(
            stk_password("174379", "passkey", "20261015120000"),
            STANDARD.encode("174379passkey20261015120000")
        );
        assert_eq!(timestamp_now().len(), 14);
    }

    #[tokio::test]
    async fn test_initiate_sends_stk_push() {
        let server = server_with_token().await;
        Mock::given(method("POST"))
            .and(path(STK_PUSH_PATH))
            .and(header("Authorization", "Bearer tok-1"))
            .and(header("Idempotency-Key", "3f2a9c"))
            .and(header_exists("content-type"))
            .and(body_partial_json(serde_json::json!({
                "BusinessShortCode": "174379",
                "TransactionType": "CustomerPayBillOnline",
                "Amount": 1500,
                "PartyA": "254712345678",
                "PartyB": "174379",
                "PhoneNumber": "254712345678",
                "CallBackURL": "https://pay.example.com/callback/mpesa",
                "AccountReference": "RESABCDEF12",
                "TransactionDesc": "Reservation",
            })))
            .respond_with(accepted())
            .expect(1)
            .mount(&server)
            .await;

        let ack = gateway(&server).initiate(&payment("0712 345 678")).await.unwrap();

        assert_eq!(ack.correlation_id, "ws_CO_191220191020363925");
        assert_eq!(ack.merchant_request_id.as_deref(), Some("29115-34620561-1"));
    }

    #[tokio::test]
    async fn test_invalid_phone_never_reaches_gateway() {
        let server = server_with_token().await;
        Mock::given(method("POST"))
            .and(path(STK_PUSH_PATH))
            .respond_with(accepted())
            .expect(0)
            .mount(&server)
            .await;

        let err = gateway(&server).initiate(&payment("12ab")).await.unwrap_err();
        assert!(matches!(err, ReserveError::GatewayRejected { .. }));
    }

    #[tokio::test]
    async fn test_gateway_decline_surfaces_reason() {
        let server = server_with_token().await;
        Mock::given(method("POST"))
            .and(path(STK_PUSH_PATH))
            .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({
                "requestId": "12345-1",
                "errorCode": "400.002.02",
                "errorMessage": "Bad Request - Invalid PhoneNumber",
            })))
            .mount(&server)
            .await;

        let err = gateway(&server).initiate(&payment("0712345678")).await.unwrap_err();
        assert_eq!(
            err,
            ReserveError::GatewayRejected {
                reason: "Bad Request - Invalid PhoneNumber".into()
            }
        );
    }

    #[tokio::test]
    async fn test_nonzero_response_code_is_a_decline() {
        let server = server_with_token().await;
        Mock::given(method("POST"))
            .and(path(STK_PUSH_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "ResponseCode": "1",
                "ResponseDescription": "Merchant does not exist",
            })))
            .mount(&server)
            .await;

        let err = gateway(&server).initiate(&payment("0712345678")).await.unwrap_err();
        assert_eq!(
            err,
            ReserveError::GatewayRejected {
                reason: "Merchant does not exist".into()
            }
        );
    }

    #[tokio::test]
    async fn test_server_error_is_unavailable() {
        let server = server_with_token().await;
        Mock::given(method("POST"))
            .and(path(STK_PUSH_PATH))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let err = gateway(&server).initiate(&payment("0712345678")).await.unwrap_err();
        assert!(matches!(err, ReserveError::GatewayUnavailable(_)));
    }

    #[tokio::test]
    async fn test_slow_gateway_times_out() {
        let server = server_with_token().await;
        Mock::given(method("POST"))
            .and(path(STK_PUSH_PATH))
            .respond_with(accepted().set_delay(Duration::from_secs(5)))
            .mount(&server)
            .await;

        let err = gateway(&server).initiate(&payment("0712345678")).await.unwrap_err();
        assert!(matches!(err, ReserveError::GatewayTimeout(_)));
    }

    #[tokio::test]
    async fn test_expired_token_is_refreshed_once() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/oauth/v1/generate"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "tok-1",
                "expires_in": 3599,
            })))
            .expect(2)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path(STK_PUSH_PATH))
            .respond_with(ResponseTemplate::new(401))
            .up_to_n_times(1)
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path(STK_PUSH_PATH))
            .respond_with(accepted())
            .expect(1)
            .mount(&server)
            .await;

        let ack = gateway(&server).initiate(&payment("0712345678")).await.unwrap();
        assert_eq!(ack.correlation_id, "ws_CO_191220191020363925");
    }

    #[tokio::test]
    async fn test_query_status() {
        let server = server_with_token().await;
        Mock::given(method("POST"))
            .and(path(STK_QUERY_PATH))
            .and(body_partial_json(serde_json::json!({
                "CheckoutRequestID": "ws_CO_paid",
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "ResponseCode": "0",
                "ResultCode": "0",
                "ResultDesc": "The service request is processed successfully.",
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path(STK_QUERY_PATH))
            .and(body_partial_json(serde_json::json!({
                "CheckoutRequestID": "ws_CO_cancelled",
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "ResponseCode": "0",
                "ResultCode": "1032",
                "ResultDesc": "Request cancelled by user",
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path(STK_QUERY_PATH))
            .and(body_partial_json(serde_json::json!({
                "CheckoutRequestID": "ws_CO_inflight",
            })))
            .respond_with(ResponseTemplate::new(500).set_body_json(serde_json::json!({
                "requestId": "1",
                "errorCode": "500.001.1001",
                "errorMessage": "The transaction is being processed",
            })))
            .mount(&server)
            .await;

        let gateway = gateway(&server);
        assert_eq!(
            gateway.query_status("ws_CO_paid").await.unwrap(),
            GatewayStatus::Succeeded { receipt_id: None }
        );
        assert_eq!(
            gateway.query_status("ws_CO_cancelled").await.unwrap(),
            GatewayStatus::Failed {
                reason: "Request cancelled by user".into()
            }
        );
        assert_eq!(
            gateway.query_status("ws_CO_inflight").await.unwrap(),
            GatewayStatus::Pending
        );
    }
}
