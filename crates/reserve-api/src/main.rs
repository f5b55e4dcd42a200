//! # Reserve-Pay RS
//!
//! Reservation booking with M-Pesa push payments.
//!
//! ## Usage
//!
//! ```bash
//! # Set environment variables
//! export MPESA_CONSUMER_KEY=...
//! export MPESA_CONSUMER_SECRET=...
//! export MPESA_BUSINESS_SHORTCODE=174379
//! export MPESA_PASSKEY=...
//! export MPESA_CALLBACK_BASE_URL=https://example.com
//! export DATABASE_URL=sqlite://reserve.db
//!
//! # Run the server
//! reserve-pay
//! ```

use reserve_api::{routes, state::AppState};
use reserve_core::spawn_sweeper;
use tracing::{info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    // Initialize logging
    init_tracing();

    // Print banner
    print_banner();

    // Initialize application state
    let state = AppState::new().await?;

    let addr = state.config.socket_addr()?;
    let is_prod = state.config.is_production();

    info!("Environment: {}", state.config.environment);
    info!("Payment gateway: {}", state.orchestrator.provider_name());
    info!(
        "Settle window: {:?}, sweep every {:?}",
        state.config.settle_window, state.config.sweep_interval
    );

    // Reconciliation runs for the life of the process
    let sweeper = spawn_sweeper(state.orchestrator.clone(), state.config.sweep_interval);

    // Create router
    let app = routes::create_router(state);

    // Start server
    info!("Reserve-Pay starting on http://{}", addr);

    if !is_prod {
        info!("Health: http://{}/health", addr);
        info!("Booking: POST http://{}/api/v1/reservations", addr);
        info!("Callback: POST http://{}/callback/mpesa", addr);
    }

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    sweeper.abort();
    info!("Shut down");

    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::builder()
        .with_default_directive(Level::INFO.into())
        .from_env_lossy();

    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    if json {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer())
            .with(filter)
            .init();
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
    }
}

fn print_banner() {
    println!(
        r#"
  Reserve-Pay RS
  ━━━━━━━━━━━━━━━━━━━━━━━
  Bookings with M-Pesa push payments
  Version: {}

"#,
        env!("CARGO_PKG_VERSION")
    );
}
