//! On-chain event listener for the VRF coordinator program.
//!
//! Two complementary strategies ensure no requests are missed:
//!
//! 1. **Catch-up scan** ([`catch_up_pending_requests`]) — on startup, queries
//!    `getProgramAccounts` for any existing `Pending` requests that arrived
//!    while the keeper was offline.
//!
//! 2. **Live stream** ([`listen_for_events`]) — subscribes to program log
//!    events via WebSocket, parses `RandomWordsRequested` Anchor events in
//!    real-time, and auto-reconnects on disconnection.

use base64::Engine;
use solana_account_decoder::UiAccountEncoding;
use solana_client::nonblocking::pubsub_client::PubsubClient;
use solana_client::rpc_config::{
    RpcAccountInfoConfig, RpcProgramAccountsConfig, RpcTransactionLogsConfig,
    RpcTransactionLogsFilter,
};
use solana_client::rpc_filter::{Memcmp, RpcFilterType};
use solana_commitment_config::CommitmentConfig;
use solana_sdk::pubkey::Pubkey;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::config::AppConfig;
use crate::metrics::Metrics;
use crate::raffle_state::account_discriminator;

/// Parsed representation of the on-chain `RandomWordsRequested` Anchor event.
#[derive(Debug, Clone)]
pub struct RandomWordsRequestedEvent {
    pub request_id: u64,
    pub subscription_id: u64,
    pub consumer_program: Pubkey,
    pub requester: Pubkey,
    pub key_hash: [u8; 32],
    pub num_words: u32,
    pub seed: [u8; 32],
    pub request_slot: u64,
    pub min_confirmation_slots: u64,
    pub callback_compute_limit: u32,
}

/// Compute the Anchor event discriminator: `sha256("event:<Name>")[..8]`.
fn event_discriminator(event_name: &str) -> [u8; 8] {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(format!("event:{event_name}"));
    let hash = hasher.finalize();
    let mut disc = [0u8; 8];
    disc.copy_from_slice(&hash[..8]);
    disc
}

/// Delay before reconnecting to the WebSocket after a disconnect or error.
const WS_RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Byte offset of the status field in a `RandomnessRequest` account,
/// including the 8-byte discriminator.
const REQUEST_STATUS_OFFSET: usize = 176;

/// Minimum expected account data length for a `RandomnessRequest`.
///
/// Layout: discriminator (8) + request_id (8) + subscription_id (8) +
/// consumer_program (32) + requester (32) + key_hash (32) + num_words (4) +
/// min_confirmation_slots (8) + seed (32) + request_slot (8) +
/// callback_compute_limit (4) + status (1) + bump (1) = 178 bytes.
const MIN_ACCOUNT_DATA_LEN: usize = 178;

/// Scan for any existing unfulfilled (Pending) requests on startup.
///
/// Uses `getProgramAccounts` with Memcmp filters to find request PDAs where:
/// - The account discriminator matches `RandomnessRequest`.
/// - The status byte is `0` (Pending).
///
/// Each found request is sent through the channel for fulfillment.
pub async fn catch_up_pending_requests(
    config: &AppConfig,
    tx: &mpsc::Sender<RandomWordsRequestedEvent>,
    metrics: &Metrics,
) {
    info!("Scanning for pending requests");

    let client = solana_client::nonblocking::rpc_client::RpcClient::new(config.rpc_url.clone());

    let disc = account_discriminator("RandomnessRequest");

    let filters = vec![
        RpcFilterType::Memcmp(Memcmp::new_raw_bytes(0, disc.to_vec())),
        RpcFilterType::Memcmp(Memcmp::new_raw_bytes(REQUEST_STATUS_OFFSET, vec![0u8])),
    ];

    let account_config = RpcProgramAccountsConfig {
        filters: Some(filters),
        account_config: RpcAccountInfoConfig {
            encoding: Some(UiAccountEncoding::Base64),
            commitment: Some(CommitmentConfig::confirmed()),
            ..Default::default()
        },
        ..Default::default()
    };

    match client
        .get_program_ui_accounts_with_config(&config.coordinator_program_id, account_config)
        .await
    {
        Ok(accounts) => {
            info!(count = accounts.len(), "Found pending requests");
            for (pubkey, ui_account) in accounts {
                let data = match ui_account.data.decode() {
                    Some(d) => d,
                    None => {
                        warn!(account = %pubkey, "Failed to decode account data, skipping");
                        continue;
                    }
                };

                if data.len() < MIN_ACCOUNT_DATA_LEN {
                    warn!(
                        account = %pubkey,
                        len = data.len(),
                        "Account data too short, skipping"
                    );
                    continue;
                }

                let Some(event) = parse_request_account(&data[8..]) else {
                    warn!(account = %pubkey, "Failed to parse request account, skipping");
                    continue;
                };

                info!(
                    request_id = event.request_id,
                    consumer = %event.consumer_program,
                    slot = event.request_slot,
                    "Queued pending request"
                );

                metrics.record_request();
                if tx.send(event).await.is_err() {
                    error!("Channel closed while catching up pending requests");
                    return;
                }
            }
        }
        Err(e) => {
            error!(error = %e, "Failed to fetch program accounts");
        }
    }
}

/// Parse a `RandomnessRequest` account body (after the 8-byte discriminator).
fn parse_request_account(body: &[u8]) -> Option<RandomWordsRequestedEvent> {
    if body.len() < MIN_ACCOUNT_DATA_LEN - 8 {
        return None;
    }

    let request_id = u64::from_le_bytes(body[0..8].try_into().ok()?);
    let subscription_id = u64::from_le_bytes(body[8..16].try_into().ok()?);
    let consumer_program = Pubkey::try_from(&body[16..48]).ok()?;
    let requester = Pubkey::try_from(&body[48..80]).ok()?;
    let mut key_hash = [0u8; 32];
    key_hash.copy_from_slice(&body[80..112]);
    let num_words = u32::from_le_bytes(body[112..116].try_into().ok()?);
    let min_confirmation_slots = u64::from_le_bytes(body[116..124].try_into().ok()?);
    let mut seed = [0u8; 32];
    seed.copy_from_slice(&body[124..156]);
    let request_slot = u64::from_le_bytes(body[156..164].try_into().ok()?);
    let callback_compute_limit = u32::from_le_bytes(body[164..168].try_into().ok()?);

    Some(RandomWordsRequestedEvent {
        request_id,
        subscription_id,
        consumer_program,
        requester,
        key_hash,
        num_words,
        seed,
        request_slot,
        min_confirmation_slots,
        callback_compute_limit,
    })
}

/// Subscribe to program logs via WebSocket and forward `RandomWordsRequested`
/// events to the fulfiller. Automatically reconnects on disconnection.
pub async fn listen_for_events(
    config: AppConfig,
    tx: mpsc::Sender<RandomWordsRequestedEvent>,
    metrics: std::sync::Arc<Metrics>,
) {
    let discriminator = event_discriminator("RandomWordsRequested");

    loop {
        info!(url = %config.ws_url, "Connecting to WebSocket");

        match PubsubClient::new(&config.ws_url).await {
            Ok(pubsub) => {
                info!("WebSocket connected");

                let filter = RpcTransactionLogsFilter::Mentions(vec![
                    config.coordinator_program_id.to_string(),
                ]);
                let logs_config = RpcTransactionLogsConfig {
                    commitment: Some(CommitmentConfig::confirmed()),
                };

                match pubsub.logs_subscribe(filter, logs_config).await {
                    Ok((mut stream, _unsub)) => {
                        use futures_util::StreamExt;
                        while let Some(log_result) = stream.next().await {
                            process_log_lines(
                                &log_result.value.logs,
                                &discriminator,
                                &tx,
                                &metrics,
                            )
                            .await;
                        }
                        warn!("WebSocket stream ended, reconnecting");
                    }
                    Err(e) => {
                        error!(error = %e, "Failed to subscribe to logs");
                    }
                }
            }
            Err(e) => {
                error!(error = %e, "Failed to connect to WebSocket");
            }
        }

        info!(delay = ?WS_RECONNECT_DELAY, "Reconnecting");
        tokio::time::sleep(WS_RECONNECT_DELAY).await;
    }
}

/// Scan transaction log lines for `Program data:` entries that match the
/// `RandomWordsRequested` event discriminator.
///
/// Anchor emits events as base64-encoded `Program data:` log entries. Each
/// entry is decoded, the first 8 bytes are compared against the expected
/// discriminator, and matching entries are parsed into events.
async fn process_log_lines(
    logs: &[String],
    discriminator: &[u8; 8],
    tx: &mpsc::Sender<RandomWordsRequestedEvent>,
    metrics: &Metrics,
) {
    for log_line in logs {
        let Some(data_str) = log_line.strip_prefix("Program data: ") else {
            continue;
        };

        let decoded = match base64::engine::general_purpose::STANDARD.decode(data_str.trim()) {
            Ok(d) => d,
            Err(e) => {
                debug!(error = %e, "Failed to decode base64 log data");
                continue;
            }
        };

        if decoded.len() < 8 || decoded[..8] != *discriminator {
            continue;
        }

        let Some(event) = parse_random_words_requested_event(&decoded[8..]) else {
            warn!("Failed to parse RandomWordsRequested event payload");
            continue;
        };

        info!(
            request_id = event.request_id,
            consumer = %event.consumer_program,
            num_words = event.num_words,
            slot = event.request_slot,
            "Received RandomWordsRequested event"
        );

        metrics.record_request();
        if tx.send(event).await.is_err() {
            error!("Channel closed, stopping listener");
            return;
        }
    }
}

/// Deserialize a `RandomWordsRequested` event from its Borsh-encoded body
/// (after the 8-byte discriminator has been stripped).
///
/// Layout: `request_id (8) + subscription_id (8) + consumer_program (32) +
/// requester (32) + key_hash (32) + num_words (4) + seed (32) +
/// request_slot (8) + min_confirmation_slots (8) +
/// callback_compute_limit (4) = 168 bytes`.
fn parse_random_words_requested_event(data: &[u8]) -> Option<RandomWordsRequestedEvent> {
    if data.len() < 168 {
        return None;
    }

    let request_id = u64::from_le_bytes(data[0..8].try_into().ok()?);
    let subscription_id = u64::from_le_bytes(data[8..16].try_into().ok()?);
    let consumer_program = Pubkey::try_from(&data[16..48]).ok()?;
    let requester = Pubkey::try_from(&data[48..80]).ok()?;
    let mut key_hash = [0u8; 32];
    key_hash.copy_from_slice(&data[80..112]);
    let num_words = u32::from_le_bytes(data[112..116].try_into().ok()?);
    let mut seed = [0u8; 32];
    seed.copy_from_slice(&data[116..148]);
    let request_slot = u64::from_le_bytes(data[148..156].try_into().ok()?);
    let min_confirmation_slots = u64::from_le_bytes(data[156..164].try_into().ok()?);
    let callback_compute_limit = u32::from_le_bytes(data[164..168].try_into().ok()?);

    Some(RandomWordsRequestedEvent {
        request_id,
        subscription_id,
        consumer_program,
        requester,
        key_hash,
        num_words,
        seed,
        request_slot,
        min_confirmation_slots,
        callback_compute_limit,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_event_round_trip() {
        let consumer = Pubkey::new_unique();
        let requester = Pubkey::new_unique();

        let mut data = Vec::new();
        data.extend_from_slice(&42u64.to_le_bytes());
        data.extend_from_slice(&3u64.to_le_bytes());
        data.extend_from_slice(consumer.as_ref());
        data.extend_from_slice(requester.as_ref());
        data.extend_from_slice(&[5u8; 32]);
        data.extend_from_slice(&1u32.to_le_bytes());
        data.extend_from_slice(&[6u8; 32]);
        data.extend_from_slice(&9_999u64.to_le_bytes());
        data.extend_from_slice(&3u64.to_le_bytes());
        data.extend_from_slice(&200_000u32.to_le_bytes());

        let event = parse_random_words_requested_event(&data).expect("parses");
        assert_eq!(event.request_id, 42);
        assert_eq!(event.subscription_id, 3);
        assert_eq!(event.consumer_program, consumer);
        assert_eq!(event.requester, requester);
        assert_eq!(event.key_hash, [5u8; 32]);
        assert_eq!(event.num_words, 1);
        assert_eq!(event.seed, [6u8; 32]);
        assert_eq!(event.request_slot, 9_999);
        assert_eq!(event.min_confirmation_slots, 3);
        assert_eq!(event.callback_compute_limit, 200_000);
    }

    #[test]
    fn rejects_short_event_payload() {
        assert!(parse_random_words_requested_event(&[0u8; 167]).is_none());
    }
}
