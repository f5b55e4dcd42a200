//! # Application State
//!
//! Shared state for the Axum application.
//! Wires the stores, the payment gateway and the orchestrator from config.

use crate::db::Db;
use anyhow::Context;
use reserve_core::{
    BoxedPaymentGateway, InMemoryLedger, InMemoryReservationStore, MockGateway, OfferingCatalog,
    Orchestrator, OrchestratorConfig, ReserveError, SharedLedger, SharedReservationStore,
};
use reserve_mpesa::{CallbackVerifier, MpesaConfig, MpesaGateway};
use std::env;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Which gateway implementation to wire in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayKind {
    Mpesa,
    Mock,
}

impl FromStr for GatewayKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "mpesa" => Ok(GatewayKind::Mpesa),
            "mock" => Ok(GatewayKind::Mock),
            other => anyhow::bail!("Unknown PAYMENT_GATEWAY: {}", other),
        }
    }
}

/// Application configuration
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Host to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
    /// Environment (development, staging, production)
    pub environment: String,
    /// SQLite URL; in-memory stores when unset
    pub database_url: Option<String>,
    /// Offering seed file
    pub offerings_file: Option<String>,
    pub gateway: GatewayKind,
    pub initiate_timeout: Duration,
    pub settle_window: Duration,
    pub status_query_timeout: Duration,
    pub sweep_interval: Duration,
    pub sweep_batch_size: usize,
}

impl AppConfig {
    /// Load from environment variables
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let config = Self {
            host: env::var("HOST").unwrap_or_else(|_| "127.0.0.1".to_string()),
            port: parsed("PORT", 8080)?,
            environment: env::var("ENVIRONMENT").unwrap_or_else(|_| "development".to_string()),
            database_url: env::var("DATABASE_URL").ok().filter(|v| !v.is_empty()),
            offerings_file: env::var("OFFERINGS_FILE").ok().filter(|v| !v.is_empty()),
            gateway: env::var("PAYMENT_GATEWAY")
                .unwrap_or_else(|_| "mpesa".to_string())
                .parse()?,
            initiate_timeout: Duration::from_secs(parsed("INITIATE_TIMEOUT_SECS", 10)?),
            settle_window: Duration::from_secs(parsed("SETTLE_WINDOW_SECS", 300)?),
            status_query_timeout: Duration::from_secs(parsed("STATUS_QUERY_TIMEOUT_SECS", 10)?),
            sweep_interval: Duration::from_secs(parsed("SWEEP_INTERVAL_SECS", 60)?),
            sweep_batch_size: parsed("SWEEP_BATCH_SIZE", 100)?,
        };

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the orchestrator cannot run with
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.is_production() && self.gateway == GatewayKind::Mock {
            anyhow::bail!("PAYMENT_GATEWAY=mock is not allowed in production");
        }
        if self.initiate_timeout.is_zero() {
            anyhow::bail!("INITIATE_TIMEOUT_SECS must be positive");
        }
        // a sweep must never expire an attempt whose initiate call is still running
        if self.initiate_timeout >= self.settle_window {
            anyhow::bail!(
                "INITIATE_TIMEOUT_SECS ({}s) must be shorter than SETTLE_WINDOW_SECS ({}s)",
                self.initiate_timeout.as_secs(),
                self.settle_window.as_secs()
            );
        }
        if self.sweep_interval.is_zero() {
            anyhow::bail!("SWEEP_INTERVAL_SECS must be positive");
        }
        if self.sweep_batch_size == 0 {
            anyhow::bail!("SWEEP_BATCH_SIZE must be positive");
        }
        Ok(())
    }

    /// Get the socket address to bind to
    pub fn socket_addr(&self) -> anyhow::Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid socket address {}:{}", self.host, self.port))
    }

    /// Check if running in production
    pub fn is_production(&self) -> bool {
        self.environment == "production"
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            initiate_timeout: self.initiate_timeout,
            settle_window: self.settle_window,
            status_query_timeout: self.status_query_timeout,
            sweep_batch_size: self.sweep_batch_size,
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            environment: "development".to_string(),
            database_url: None,
            offerings_file: None,
            gateway: GatewayKind::Mock,
            initiate_timeout: Duration::from_secs(10),
            settle_window: Duration::from_secs(300),
            status_query_timeout: Duration::from_secs(10),
            sweep_interval: Duration::from_secs(60),
            sweep_batch_size: 100,
        }
    }
}

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    /// Booking, settlement and reconciliation
    pub orchestrator: Arc<Orchestrator>,
    /// Callback authentication
    pub verifier: CallbackVerifier,
    /// Application config
    pub config: AppConfig,
}

impl AppState {
    /// Build the full application from the environment
    pub async fn new() -> anyhow::Result<Self> {
        let config = AppConfig::from_env()?;

        let (store, ledger): (SharedReservationStore, SharedLedger) = match &config.database_url {
            Some(url) => {
                let db = Db::connect(url)
                    .await
                    .with_context(|| format!("Failed to open database {}", url))?;
                db.migrate().await.context("Failed to migrate database")?;
                info!("Using SQLite storage: {}", url);
                let store: SharedReservationStore = Arc::new(db.reservations());
                let ledger: SharedLedger = Arc::new(db.ledger());
                (store, ledger)
            }
            None => {
                warn!("DATABASE_URL not set, reservations are kept in memory");
                (InMemoryReservationStore::shared(), InMemoryLedger::shared())
            }
        };

        let (gateway, verifier): (BoxedPaymentGateway, CallbackVerifier) = match config.gateway {
            GatewayKind::Mpesa => {
                let mpesa = MpesaConfig::from_env()
                    .map_err(|e| anyhow::anyhow!("Failed to initialize M-Pesa: {}", e))?;
                let verifier = CallbackVerifier::from_config(&mpesa);
                info!(
                    "M-Pesa gateway: shortcode={}, sandbox={}",
                    mpesa.business_shortcode,
                    mpesa.is_sandbox()
                );
                let gateway = MpesaGateway::new(mpesa)
                    .map_err(|e| anyhow::anyhow!("Failed to initialize M-Pesa: {}", e))?;
                let gateway: BoxedPaymentGateway = Arc::new(gateway);
                (gateway, verifier)
            }
            GatewayKind::Mock => {
                warn!("Using the mock payment gateway");
                let secret = env::var("MPESA_CALLBACK_SECRET").ok().filter(|s| !s.is_empty());
                let gateway: BoxedPaymentGateway = Arc::new(MockGateway::accepting());
                (gateway, CallbackVerifier::new(secret))
            }
        };

        if !verifier.is_enforced() {
            warn!("MPESA_CALLBACK_SECRET not set, callbacks are accepted unauthenticated");
        }

        let orchestrator = Arc::new(Orchestrator::new(
            store,
            ledger,
            gateway,
            config.orchestrator_config(),
        ));

        let catalog = load_offering_catalog(config.offerings_file.as_deref())?;
        seed_offerings(&orchestrator, &catalog).await?;

        Ok(Self::from_parts(orchestrator, verifier, config))
    }

    pub fn from_parts(
        orchestrator: Arc<Orchestrator>,
        verifier: CallbackVerifier,
        config: AppConfig,
    ) -> Self {
        Self {
            orchestrator,
            verifier,
            config,
        }
    }
}

/// Publish every catalog offering; ones already in the ledger are kept as is
pub async fn seed_offerings(
    orchestrator: &Orchestrator,
    catalog: &OfferingCatalog,
) -> anyhow::Result<usize> {
    let mut published = 0;
    for offering in &catalog.offerings {
        match orchestrator.publish_offering(offering).await {
            Ok(_) => published += 1,
            Err(ReserveError::OfferingExists { .. }) => {
                debug!("Offering {} already published", offering.id)
            }
            Err(e) => return Err(anyhow::anyhow!("Failed to seed {}: {}", offering.id, e)),
        }
    }
    Ok(published)
}

/// Load offering seeds from config file
fn load_offering_catalog(explicit: Option<&str>) -> anyhow::Result<OfferingCatalog> {
    if let Some(path) = explicit {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path))?;
        return parse_catalog(&content, path);
    }

    let config_paths = [
        "config/offerings.toml",
        "../config/offerings.toml",
        "../../config/offerings.toml",
    ];

    for path in config_paths {
        if let Ok(content) = std::fs::read_to_string(path) {
            return parse_catalog(&content, path);
        }
    }

    warn!("No offering catalog found, starting with an empty ledger");
    Ok(OfferingCatalog::default())
}

fn parse_catalog(content: &str, path: &str) -> anyhow::Result<OfferingCatalog> {
    let catalog = OfferingCatalog::from_toml(content)
        .map_err(|e| anyhow::anyhow!("Failed to parse {}: {}", path, e))?;
    info!("Loaded {} offerings from {}", catalog.offerings.len(), path);
    Ok(catalog)
}

fn parsed<T: FromStr>(key: &str, default: T) -> anyhow::Result<T> {
    match env::var(key) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| anyhow::anyhow!("{} is not valid: {}", key, raw)),
        Err(_) => Ok(default),
    }
}
