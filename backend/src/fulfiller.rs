//! Fulfillment engine — consumes randomness request events and submits
//! on-chain fulfillment transactions with automatic callback delivery via
//! the coordinator.
//!
//! Each fulfillment transaction contains:
//! 1. (Optional) A `set_compute_unit_price` instruction for priority fees.
//! 2. The `fulfill_random_words` coordinator instruction (verifies the
//!    authority signature, expands randomness, CPIs the settlement callback
//!    into the raffle, closes the request PDA).
//!
//! Because the raffle's callback requires the winner's account to be
//! writable, the fulfiller computes the randomness first, reads the current
//! entry list, and derives the winner exactly as the program will.

use anyhow::{bail, Context, Result};
use solana_client::nonblocking::rpc_client::RpcClient;
use solana_commitment_config::CommitmentConfig;
use solana_sdk::instruction::{AccountMeta, Instruction};
use solana_sdk::pubkey::Pubkey;
use solana_sdk::signature::Signer;
use solana_sdk_ids::system_program;
use solana_sdk::transaction::Transaction;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Semaphore};
use tracing::{error, info, instrument, warn};

use crate::config::AppConfig;
use crate::listener::RandomWordsRequestedEvent;
use crate::metrics::Metrics;
use crate::raffle_state::{parse_raffle_account, winner_index};
use crate::vrf::{compute_randomness, expand_words};

/// Known non-retryable Anchor error codes (coordinator).
const ERROR_REQUEST_NOT_PENDING: u32 = 6000;
const ERROR_UNAUTHORIZED: u32 = 6004;

/// Poll interval while waiting out a request's confirmation depth.
const CONFIRMATION_POLL: Duration = Duration::from_millis(400);

/// Compute an Anchor instruction discriminator: `sha256("global:<name>")[..8]`.
pub fn instruction_discriminator(name: &str) -> [u8; 8] {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(format!("global:{name}"));
    let hash = hasher.finalize();
    let mut disc = [0u8; 8];
    disc.copy_from_slice(&hash[..8]);
    disc
}

/// Check if an error string contains a known non-retryable error.
fn is_non_retryable(err_str: &str) -> bool {
    let non_retryable_codes = [
        format!("0x{ERROR_REQUEST_NOT_PENDING:x}"),
        format!("0x{ERROR_UNAUTHORIZED:x}"),
    ];
    for code in &non_retryable_codes {
        if err_str.contains(code) {
            return true;
        }
    }
    err_str.contains("RequestNotPending")
        || err_str.contains("Unauthorized")
        || err_str.contains("AccountNotInitialized")
        || err_str.contains("already in use")
}

/// Main fulfiller loop.
pub async fn run_fulfiller(
    config: AppConfig,
    mut rx: mpsc::Receiver<RandomWordsRequestedEvent>,
    pending_count: Arc<AtomicU64>,
    metrics: Arc<Metrics>,
) {
    let rpc_client = Arc::new(RpcClient::new_with_commitment(
        config.rpc_url.clone(),
        CommitmentConfig::confirmed(),
    ));

    let semaphore = Arc::new(Semaphore::new(config.fulfillment_concurrency));

    while let Some(event) = rx.recv().await {
        pending_count.fetch_add(1, Ordering::Relaxed);

        let permit = match semaphore.clone().acquire_owned().await {
            Ok(p) => p,
            Err(_) => {
                error!("Semaphore closed, stopping fulfiller");
                break;
            }
        };
        let rpc = rpc_client.clone();
        let cfg = config.clone();
        let pending = pending_count.clone();
        let met = metrics.clone();

        tokio::spawn(async move {
            let _permit = permit;
            let start = Instant::now();

            info!(
                request_id = event.request_id,
                consumer = %event.consumer_program,
                num_words = event.num_words,
                slot = event.request_slot,
                "Fulfilling randomness request"
            );

            match fulfill_request(&rpc, &cfg, &event).await {
                Ok(sig) => {
                    let latency_ms = start.elapsed().as_millis() as u64;
                    met.record_fulfillment(latency_ms);
                    info!(
                        request_id = event.request_id,
                        signature = %sig,
                        latency_ms,
                        explorer = %cfg.explorer_url(&sig),
                        "Fulfilled successfully"
                    );
                }
                Err(e) => handle_fulfillment_error(event.request_id, e, &met),
            }

            pending.fetch_sub(1, Ordering::Relaxed);
        });
    }

    info!("Fulfiller channel closed, shutting down");
}

fn handle_fulfillment_error(request_id: u64, error: anyhow::Error, metrics: &Metrics) {
    let err_str = format!("{error:#}");
    if is_non_retryable(&err_str) {
        warn!(
            request_id,
            reason = %err_str,
            "Skipping request (non-retryable)"
        );
    } else {
        metrics.record_failure();
        error!(
            request_id,
            error = %err_str,
            "Failed to fulfill"
        );
    }
}

/// Build, sign, and submit a fulfillment transaction with callback.
#[instrument(skip_all, fields(request_id = event.request_id))]
async fn fulfill_request(
    rpc_client: &RpcClient,
    config: &AppConfig,
    event: &RandomWordsRequestedEvent,
) -> Result<String> {
    let randomness = compute_randomness(
        &config.hmac_secret,
        &event.seed,
        event.request_slot,
        event.request_id,
    );

    wait_for_confirmation_depth(rpc_client, event).await?;

    // The callback needs the winner account writable; derive it the same way
    // the raffle program will.
    let callback_remaining = derive_raffle_callback_accounts(
        rpc_client,
        &config.raffle_program_id,
        event,
        &randomness,
    )
    .await?;

    let fulfill_ix = build_fulfill_instruction(
        &config.coordinator_program_id,
        &config.authority_keypair.pubkey(),
        event,
        &randomness,
        &callback_remaining,
    );

    let mut instructions = Vec::with_capacity(2);
    if config.priority_fee_micro_lamports > 0 {
        instructions.push(build_set_compute_unit_price_instruction(
            config.priority_fee_micro_lamports,
        ));
    }
    instructions.push(fulfill_ix);

    send_with_retries(rpc_client, config, &instructions, event.request_id).await
}

/// Wait until the request's confirmation depth has elapsed on-chain. The
/// coordinator rejects early fulfillments, so submitting sooner only burns
/// a transaction.
async fn wait_for_confirmation_depth(
    rpc_client: &RpcClient,
    event: &RandomWordsRequestedEvent,
) -> Result<()> {
    let target_slot = event
        .request_slot
        .saturating_add(event.min_confirmation_slots);

    loop {
        let current = rpc_client
            .get_slot()
            .await
            .context("failed to fetch current slot")?;
        if current >= target_slot {
            return Ok(());
        }
        tokio::time::sleep(CONFIRMATION_POLL).await;
    }
}

/// Derive the remaining accounts for the raffle's settlement callback.
///
/// The raffle `on_random_words_ready` instruction expects, after the
/// coordinator-config signer the coordinator prepends automatically:
/// 1. raffle PDA `["raffle"]` (writable)
/// 2. vault PDA `["vault"]` (writable)
/// 3. winner (writable) — `players[word mod players.len()]`
/// 4. system program
async fn derive_raffle_callback_accounts(
    rpc_client: &RpcClient,
    raffle_program_id: &Pubkey,
    event: &RandomWordsRequestedEvent,
    randomness: &[u8; 32],
) -> Result<Vec<AccountMeta>> {
    let (raffle_pda, _) = Pubkey::find_program_address(&[b"raffle"], raffle_program_id);
    let (vault_pda, _) = Pubkey::find_program_address(&[b"vault"], raffle_program_id);

    let account = rpc_client
        .get_account(&raffle_pda)
        .await
        .with_context(|| format!("failed to fetch raffle account {raffle_pda}"))?;
    let raffle = parse_raffle_account(&account.data)
        .context("raffle account data did not parse")?;

    if !raffle.has_pending_request || raffle.pending_request_id != event.request_id {
        bail!(
            "raffle is not awaiting request_id={} (pending={}, id={})",
            event.request_id,
            raffle.has_pending_request,
            raffle.pending_request_id
        );
    }

    let words = expand_words(randomness, event.num_words.max(1));
    let index = winner_index(&words[0], raffle.players.len() as u64)
        .context("raffle has no entrants to settle")?;
    let winner = raffle.players[index as usize];

    info!(
        request_id = event.request_id,
        winner = %winner,
        entrants = raffle.players.len(),
        "Derived settlement winner"
    );

    Ok(vec![
        AccountMeta::new(raffle_pda, false),
        AccountMeta::new(vault_pda, false),
        AccountMeta::new(winner, false),
        AccountMeta::new_readonly(system_program::ID, false),
    ])
}

/// Send a transaction with exponential backoff on BlockhashNotFound.
async fn send_with_retries(
    rpc_client: &RpcClient,
    config: &AppConfig,
    instructions: &[Instruction],
    request_id: u64,
) -> Result<String> {
    let mut retry_delay = Duration::from_millis(config.initial_retry_delay_ms);

    for attempt in 0..config.max_retries {
        let blockhash = rpc_client
            .get_latest_blockhash()
            .await
            .context("failed to fetch latest blockhash")?;

        let tx = Transaction::new_signed_with_payer(
            instructions,
            Some(&config.authority_keypair.pubkey()),
            &[config.authority_keypair.as_ref()],
            blockhash,
        );

        match rpc_client.send_and_confirm_transaction(&tx).await {
            Ok(sig) => return Ok(sig.to_string()),
            Err(e)
                if e.to_string().contains("BlockhashNotFound")
                    && attempt < config.max_retries - 1 =>
            {
                warn!(
                    attempt = attempt + 1,
                    delay = ?retry_delay,
                    "BlockhashNotFound, retrying"
                );
                tokio::time::sleep(retry_delay).await;
                retry_delay = retry_delay.saturating_mul(2).min(Duration::from_secs(60));
            }
            Err(e) => return Err(e).context("send_and_confirm_transaction failed"),
        }
    }

    bail!(
        "max retries ({}) exceeded for request_id={}",
        config.max_retries,
        request_id
    )
}

/// Build a `SetComputeUnitPrice` instruction.
fn build_set_compute_unit_price_instruction(micro_lamports: u64) -> Instruction {
    let compute_budget_id: Pubkey = "ComputeBudget111111111111111111111111111111"
        .parse()
        .expect("static program id");
    let mut data = Vec::with_capacity(9);
    data.push(3u8);
    data.extend_from_slice(&micro_lamports.to_le_bytes());
    Instruction {
        program_id: compute_budget_id,
        accounts: vec![],
        data,
    }
}

/// Build the `fulfill_random_words` coordinator instruction.
fn build_fulfill_instruction(
    program_id: &Pubkey,
    authority: &Pubkey,
    event: &RandomWordsRequestedEvent,
    randomness: &[u8; 32],
    callback_remaining: &[AccountMeta],
) -> Instruction {
    let (config_pda, _) = Pubkey::find_program_address(&[b"coordinator-config"], program_id);
    let (request_pda, _) =
        Pubkey::find_program_address(&[b"request", &event.request_id.to_le_bytes()], program_id);

    // Instruction data: discriminator + request_id + randomness
    let mut data = Vec::with_capacity(8 + 8 + 32);
    data.extend_from_slice(&instruction_discriminator("fulfill_random_words"));
    data.extend_from_slice(&event.request_id.to_le_bytes());
    data.extend_from_slice(randomness);

    // Core accounts
    let mut accounts = vec![
        AccountMeta::new(*authority, true),                       // authority (signer, payer)
        AccountMeta::new_readonly(config_pda, false),             // coordinator config PDA
        AccountMeta::new(request_pda, false),                     // randomness request PDA
        AccountMeta::new(event.requester, false),                 // requester (rent refund)
        AccountMeta::new_readonly(event.consumer_program, false), // consumer program
    ];

    // Append consumer callback remaining_accounts
    accounts.extend_from_slice(callback_remaining);

    Instruction {
        program_id: *program_id,
        accounts,
        data,
    }
}
