//! Raffle Keeper
//!
//! Off-chain service that operates an interval raffle end-to-end. Runs four
//! concurrent subsystems:
//!
//! - **Scheduler** — polls the raffle's settlement trigger and submits
//!   `perform_trigger` transactions when a round becomes eligible.
//! - **Listener** — WebSocket subscription to coordinator events + startup
//!   catch-up scan for pending randomness requests.
//! - **Fulfiller** — consumes request events and submits fulfillment
//!   transactions that deliver the settlement callback.
//! - **HTTP server** — liveness (`/health`), readiness (`/status`), and
//!   counter (`/metrics`) probes.

use actix_web::{web, App, HttpResponse, HttpServer};
use solana_sdk::signature::Signer;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

mod config;
mod fulfiller;
mod listener;
mod metrics;
mod raffle_state;
mod scheduler;
mod vrf;

use config::AppConfig;
use metrics::Metrics;

/// Shared application state accessible from HTTP handlers.
struct AppState {
    /// Number of fulfillment transactions currently in-flight.
    pending_count: Arc<AtomicU64>,
    /// Aggregated operational counters.
    metrics: Arc<Metrics>,
}

/// Liveness probe — returns 200 if the process is running.
async fn health() -> HttpResponse {
    HttpResponse::Ok().json(serde_json::json!({"status": "ok"}))
}

/// Readiness / status probe — reports the number of in-flight fulfillments.
async fn status(data: web::Data<AppState>) -> HttpResponse {
    let pending = data.pending_count.load(Ordering::Relaxed);
    HttpResponse::Ok().json(serde_json::json!({
        "status": "running",
        "pending_fulfillments": pending
    }))
}

/// Counter dump for scraping.
async fn metrics_endpoint(data: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(data.metrics.to_json())
}

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    dotenvy::dotenv().ok();

    fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,solana_client=warn,solana_rpc_client=warn,hyper=warn")),
        )
        .with_target(true)
        .with_ansi(true)
        .init();

    let config = AppConfig::from_env().expect("invalid configuration");

    info!(
        coordinator = %config.coordinator_program_id,
        raffle = %config.raffle_program_id,
        authority = %config.authority_keypair.pubkey(),
        "Starting raffle keeper"
    );
    info!(rpc = %config.rpc_url, ws = %config.ws_url, "Endpoints configured");

    let pending_count = Arc::new(AtomicU64::new(0));
    let metrics = Arc::new(Metrics::new());
    let (tx, rx) = mpsc::channel(256);

    // Scan for any requests that arrived while the keeper was offline.
    listener::catch_up_pending_requests(&config, &tx, &metrics).await;

    // Background: stream coordinator events and forward to the fulfiller.
    let listener_config = config.clone();
    let listener_tx = tx.clone();
    let listener_metrics = metrics.clone();
    tokio::spawn(async move {
        listener::listen_for_events(listener_config, listener_tx, listener_metrics).await;
    });

    // Background: consume events and submit fulfillment transactions.
    let fulfiller_config = config.clone();
    let fulfiller_pending = pending_count.clone();
    let fulfiller_metrics = metrics.clone();
    tokio::spawn(async move {
        fulfiller::run_fulfiller(fulfiller_config, rx, fulfiller_pending, fulfiller_metrics).await;
    });

    // Background: poll the settlement trigger and crank eligible rounds.
    let scheduler_config = config.clone();
    let scheduler_metrics = metrics.clone();
    tokio::spawn(async move {
        scheduler::run_scheduler(scheduler_config, scheduler_metrics).await;
    });

    let state = web::Data::new(AppState {
        pending_count: pending_count.clone(),
        metrics: metrics.clone(),
    });

    let bind_addr = format!("0.0.0.0:{}", config.http_port);
    info!(addr = %bind_addr, "Starting HTTP server");

    HttpServer::new(move || {
        App::new()
            .app_data(state.clone())
            .route("/health", web::get().to(health))
            .route("/status", web::get().to(status))
            .route("/metrics", web::get().to(metrics_endpoint))
    })
    .bind(bind_addr)?
    .run()
    .await
}
