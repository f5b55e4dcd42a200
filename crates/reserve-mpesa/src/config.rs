//! # M-Pesa Configuration
//!
//! Configuration for the Daraja API integration.
//! All secrets are loaded from environment variables.

use reqwest::Url;
use reserve_core::ReserveError;
use std::env;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Daraja sandbox host
pub const SANDBOX_API_BASE_URL: &str = "https://sandbox.safaricom.co.ke";

/// Path the callback receiver is mounted on
pub const CALLBACK_PATH: &str = "/callback/mpesa";

/// Daraja API configuration
#[derive(Clone)]
pub struct MpesaConfig {
    /// App consumer key
    pub consumer_key: String,

    /// App consumer secret
    pub consumer_secret: String,

    /// Paybill / till short code
    pub business_shortcode: String,

    /// Lipa na M-Pesa online passkey
    pub passkey: String,

    /// Public base URL the gateway calls back on
    pub callback_base_url: String,

    /// Shared secret required on inbound callbacks; unset disables the check
    pub callback_secret: Option<String>,

    /// API base URL (sandbox, production or a mock server)
    pub api_base_url: String,

    /// Prefix for normalized phone numbers
    pub country_code: String,

    /// Per-request HTTP timeout
    pub request_timeout: Duration,

    pub transaction_desc: String,
}

impl MpesaConfig {
    /// Load configuration from environment variables.
    ///
    /// Required env vars:
    /// - `MPESA_CONSUMER_KEY`
    /// - `MPESA_CONSUMER_SECRET`
    /// - `MPESA_BUSINESS_SHORTCODE`
    /// - `MPESA_PASSKEY`
    /// - `MPESA_CALLBACK_BASE_URL`
    pub fn from_env() -> Result<Self, ReserveError> {
        dotenvy::dotenv().ok();

        let mut config = Self::new(
            required("MPESA_CONSUMER_KEY")?,
            required("MPESA_CONSUMER_SECRET")?,
            required("MPESA_BUSINESS_SHORTCODE")?,
            required("MPESA_PASSKEY")?,
            required("MPESA_CALLBACK_BASE_URL")?,
        );

        config.callback_secret = env::var("MPESA_CALLBACK_SECRET")
            .ok()
            .filter(|s| !s.is_empty());
        if let Ok(url) = env::var("MPESA_API_BASE_URL") {
            config.api_base_url = url.trim_end_matches('/').to_string();
        }
        if let Ok(code) = env::var("MPESA_COUNTRY_CODE") {
            config.country_code = code;
        }
        config.request_timeout =
            Duration::from_secs(parsed("MPESA_REQUEST_TIMEOUT_SECS", 10u64)?);
        if let Ok(desc) = env::var("MPESA_TRANSACTION_DESC") {
            config.transaction_desc = desc;
        }

        config.validate()?;
        Ok(config)
    }

    /// Create config with explicit values (for testing)
    pub fn new(
        consumer_key: impl Into<String>,
        consumer_secret: impl Into<String>,
        business_shortcode: impl Into<String>,
        passkey: impl Into<String>,
        callback_base_url: impl Into<String>,
    ) -> Self {
        Self {
            consumer_key: consumer_key.into(),
            consumer_secret: consumer_secret.into(),
            business_shortcode: business_shortcode.into(),
            passkey: passkey.into(),
            callback_base_url: callback_base_url.into().trim_end_matches('/').to_string(),
            callback_secret: None,
            api_base_url: SANDBOX_API_BASE_URL.to_string(),
            country_code: "254".to_string(),
            request_timeout: Duration::from_secs(10),
            transaction_desc: "Reservation".to_string(),
        }
    }

    pub fn validate(&self) -> Result<(), ReserveError> {
        if self.business_shortcode.is_empty()
            || !self.business_shortcode.chars().all(|c| c.is_ascii_digit())
        {
            return Err(ReserveError::Configuration(
                "MPESA_BUSINESS_SHORTCODE must be numeric".to_string(),
            ));
        }

        if !self.callback_base_url.starts_with("https://")
            && !self.callback_base_url.starts_with("http://")
        {
            return Err(ReserveError::Configuration(
                "MPESA_CALLBACK_BASE_URL must be an http(s) URL".to_string(),
            ));
        }

        if Url::parse(&self.callback_base_url).is_err() {
            return Err(ReserveError::Configuration(
                "MPESA_CALLBACK_BASE_URL is not a valid URL".to_string(),
            ));
        }

        if matches!(&self.callback_secret, Some(secret) if secret.is_empty()) {
            return Err(ReserveError::Configuration(
                "MPESA_CALLBACK_SECRET must not be empty".to_string(),
            ));
        }

        if self.country_code.is_empty() || !self.country_code.chars().all(|c| c.is_ascii_digit()) {
            return Err(ReserveError::Configuration(
                "MPESA_COUNTRY_CODE must be numeric".to_string(),
            ));
        }

        Ok(())
    }

    /// Check if pointed at the sandbox
    pub fn is_sandbox(&self) -> bool {
        self.api_base_url == SANDBOX_API_BASE_URL
    }

    /// Full callback URL registered with each STK push
    pub fn callback_url(&self) -> String {
        let base = format!("{}{}", self.callback_base_url, CALLBACK_PATH);
        let Some(secret) = &self.callback_secret else {
            return base;
        };

        // the token is percent-encoded so any secret survives the round trip
        match Url::parse(&base) {
            Ok(mut url) => {
                url.query_pairs_mut().append_pair("token", secret);
                url.to_string()
            }
            Err(_) => base,
        }
    }

    /// Builder: set custom API base URL (for testing)
    pub fn with_api_base_url(mut self, url: impl Into<String>) -> Self {
        self.api_base_url = url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_callback_secret(mut self, secret: impl Into<String>) -> Self {
        self.callback_secret = Some(secret.into());
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}

impl fmt::Debug for MpesaConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MpesaConfig")
            .field("consumer_key", &"<redacted>")
            .field("consumer_secret", &"<redacted>")
            .field("business_shortcode", &self.business_shortcode)
            .field("passkey", &"<redacted>")
            .field("callback_base_url", &self.callback_base_url)
            .field("callback_secret", &self.callback_secret.as_ref().map(|_| "<redacted>"))
            .field("api_base_url", &self.api_base_url)
            .field("country_code", &self.country_code)
            .field("request_timeout", &self.request_timeout)
            .field("transaction_desc", &self.transaction_desc)
            .finish()
    }
}

fn required(key: &str) -> Result<String, ReserveError> {
    env::var(key)
        .ok()
        .filter(|v| !v.is_empty())
        .ok_or_else(|| ReserveError::Configuration(format!("{} not set", key)))
}

fn parsed<T: FromStr>(key: &str, default: T) -> Result<T, ReserveError> {
    match env::var(key) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| ReserveError::Configuration(format!("{} is not valid: {}", key, raw))),
        Err(_) => Ok(default),
    }
}
