//! Application configuration loaded from environment variables.
//!
//! Required: `HMAC_SECRET`, `COORDINATOR_PROGRAM_ID`, `RAFFLE_PROGRAM_ID`
//! Optional: `RPC_URL`, `WS_URL`, `AUTHORITY_KEYPAIR_PATH`, `CLUSTER`,
//!           `HTTP_PORT`, `MAX_RETRIES`, `INITIAL_RETRY_DELAY_MS`,
//!           `PRIORITY_FEE_MICRO_LAMPORTS`, `FULFILLMENT_CONCURRENCY`,
//!           `TRIGGER_POLL_SECS`

use anyhow::{Context, Result};
use solana_sdk::pubkey::Pubkey;
use solana_sdk::signature::{read_keypair_file, Keypair};
use std::str::FromStr;
use std::sync::Arc;

/// Application configuration for the raffle keeper.
#[derive(Clone)]
pub struct AppConfig {
    /// Solana JSON-RPC endpoint (HTTP).
    pub rpc_url: String,
    /// Solana PubSub endpoint (WebSocket) for log subscriptions.
    pub ws_url: String,
    /// Keypair that signs fulfillments and pays for trigger transactions.
    pub authority_keypair: Arc<Keypair>,
    /// Secret key for HMAC-SHA256 randomness generation.
    pub hmac_secret: Vec<u8>,
    /// The deployed VRF coordinator program ID.
    pub coordinator_program_id: Pubkey,
    /// The deployed raffle program ID (callback consumer and trigger target).
    pub raffle_program_id: Pubkey,
    /// Cluster name for explorer URLs.
    pub cluster: String,
    /// HTTP server port.
    pub http_port: u16,
    /// Maximum retry attempts per fulfillment.
    pub max_retries: u32,
    /// Initial retry delay in milliseconds.
    pub initial_retry_delay_ms: u64,
    /// Priority fee in micro-lamports per compute unit.
    pub priority_fee_micro_lamports: u64,
    /// Maximum concurrent fulfillment tasks.
    pub fulfillment_concurrency: usize,
    /// Seconds between trigger eligibility polls.
    pub trigger_poll_secs: u64,
}

impl AppConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let rpc_url = std::env::var("RPC_URL").unwrap_or_else(|_| "http://127.0.0.1:8899".into());
        let ws_url = std::env::var("WS_URL").unwrap_or_else(|_| "ws://127.0.0.1:8900".into());

        let keypair_path = std::env::var("AUTHORITY_KEYPAIR_PATH")
            .unwrap_or_else(|_| "~/.config/solana/id.json".into());
        let keypair_path = shellexpand::tilde(&keypair_path).to_string();
        let authority_keypair = read_keypair_file(&keypair_path)
            .map_err(|e| anyhow::anyhow!("{e}"))
            .with_context(|| format!("failed to read keypair from {keypair_path}"))?;

        let hmac_secret = std::env::var("HMAC_SECRET")
            .context("HMAC_SECRET env var must be set")?
            .into_bytes();

        let coordinator_program_id = parse_pubkey_env("COORDINATOR_PROGRAM_ID")?;
        let raffle_program_id = parse_pubkey_env("RAFFLE_PROGRAM_ID")?;

        let cluster = std::env::var("CLUSTER").unwrap_or_else(|_| "devnet".into());

        let http_port = std::env::var("HTTP_PORT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(8080);

        let max_retries = std::env::var("MAX_RETRIES")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(5);

        let initial_retry_delay_ms = std::env::var("INITIAL_RETRY_DELAY_MS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(500);

        let priority_fee_micro_lamports = std::env::var("PRIORITY_FEE_MICRO_LAMPORTS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);

        let fulfillment_concurrency = std::env::var("FULFILLMENT_CONCURRENCY")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(4);

        let trigger_poll_secs = std::env::var("TRIGGER_POLL_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(10);

        Ok(Self {
            rpc_url,
            ws_url,
            authority_keypair: Arc::new(authority_keypair),
            hmac_secret,
            coordinator_program_id,
            raffle_program_id,
            cluster,
            http_port,
            max_retries,
            initial_retry_delay_ms,
            priority_fee_micro_lamports,
            fulfillment_concurrency,
            trigger_poll_secs,
        })
    }

    /// Return the Solscan explorer URL for a given transaction signature.
    pub fn explorer_url(&self, signature: &str) -> String {
        match self.cluster.as_str() {
            "mainnet-beta" => format!("https://solscan.io/tx/{signature}"),
            cluster => format!("https://solscan.io/tx/{signature}?cluster={cluster}"),
        }
    }
}

fn parse_pubkey_env(name: &str) -> Result<Pubkey> {
    let value = std::env::var(name).with_context(|| format!("{name} env var must be set"))?;
    Pubkey::from_str(&value).with_context(|| format!("invalid {name}: {value}"))
}
