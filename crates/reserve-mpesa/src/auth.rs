//! # Access Token Cache
//!
//! Daraja OAuth tokens live for about an hour. One token is shared by every
//! request in the process and refreshed shortly before expiry, after a 401,
//! or on first use.
//!
//! Refresh is single-flight: concurrent callers that find the cache stale
//! queue on one mutex and the first one through fetches. The rest re-check
//! the cache after acquiring it and reuse the fresh token.

use crate::config::MpesaConfig;
use crate::wire::TokenResponse;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use reqwest::{Client, StatusCode};
use reserve_core::{ReserveError, ReserveResult};
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

/// Refresh this long before the gateway-reported expiry
const EXPIRY_MARGIN: Duration = Duration::from_secs(60);

#[derive(Clone)]
struct CachedToken {
    value: String,
    refresh_at: Instant,
}

impl CachedToken {
    fn is_fresh(&self) -> bool {
        Instant::now() < self.refresh_at
    }
}

/// Process-wide OAuth token with single-flight refresh
pub struct AccessTokenCache {
    client: Client,
    token_url: String,
    basic_auth: String,
    cached: RwLock<Option<CachedToken>>,
    refresh: Mutex<()>,
}

impl AccessTokenCache {
    pub fn new(config: &MpesaConfig, client: Client) -> Self {
        let credentials = format!("{}:{}", config.consumer_key, config.consumer_secret);
        Self {
            client,
            token_url: format!(
                "{}/oauth/v1/generate?grant_type=client_credentials",
                config.api_base_url
            ),
            basic_auth: format!("Basic {}", STANDARD.encode(credentials)),
            cached: RwLock::new(None),
            refresh: Mutex::new(()),
        }
    }

    /// A token valid for at least the expiry margin
    pub async fn token(&self) -> ReserveResult<String> {
        if let Some(value) = self.fresh().await {
            return Ok(value);
        }

        let _guard = self.refresh.lock().await;
        if let Some(value) = self.fresh().await {
            return Ok(value);
        }

        let token = self.fetch().await?;
        let value = token.value.clone();
        *self.cached.write().await = Some(token);
        Ok(value)
    }

    /// Drop `rejected` if it is still the cached token.
    ///
    /// A token another caller has already replaced is left alone.
    pub async fn invalidate(&self, rejected: &str) {
        let mut cached = self.cached.write().await;
        if cached.as_ref().map(|t| t.value.as_str()) == Some(rejected) {
            warn!("Access token rejected, dropping cached token");
            *cached = None;
        }
    }

    async fn fresh(&self) -> Option<String> {
        self.cached
            .read()
            .await
            .as_ref()
            .filter(|t| t.is_fresh())
            .map(|t| t.value.clone())
    }

    #[instrument(skip(self))]
    async fn fetch(&self) -> ReserveResult<CachedToken> {
        debug!("Requesting Daraja access token");

        let response = self
            .client
            .get(&self.token_url)
            .header("Authorization", &self.basic_auth)
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        let body = response.text().await.map_err(transport_error)?;

        if matches!(
            status,
            StatusCode::BAD_REQUEST | StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN
        ) {
            return Err(ReserveError::GatewayRejected {
                reason: format!("gateway authentication failed: HTTP {}", status.as_u16()),
            });
        }
        if !status.is_success() {
            return Err(ReserveError::GatewayUnavailable(format!(
                "token endpoint returned HTTP {}",
                status.as_u16()
            )));
        }

        let parsed: TokenResponse = serde_json::from_str(&body).map_err(|e| {
            ReserveError::GatewayUnavailable(format!("unparseable token response: {}", e))
        })?;

        let lifetime = parsed
            .expires_in
            .as_i64()
            .filter(|secs| *secs > 0)
            .map(|secs| Duration::from_secs(secs as u64))
            .unwrap_or(Duration::from_secs(3599));
        let usable = if lifetime > EXPIRY_MARGIN * 2 {
            lifetime - EXPIRY_MARGIN
        } else {
            lifetime / 2
        };

        info!("Obtained Daraja access token: valid for {}s", lifetime.as_secs());
        Ok(CachedToken {
            value: parsed.access_token,
            refresh_at: Instant::now() + usable,
        })
    }
}

/// Map a reqwest transport failure onto the gateway error kinds
pub(crate) fn transport_error(e: reqwest::Error) -> ReserveError {
    if e.is_timeout() {
        ReserveError::GatewayTimeout(e.to_string())
    } else {
        ReserveError::GatewayUnavailable(e.to_string())
    }
}
