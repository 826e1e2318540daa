//! Trigger scheduler — the external agent that starts settlement rounds.
//!
//! Polls the raffle and vault accounts at a fixed cadence, evaluates the
//! same eligibility conjunction the program enforces (interval elapsed,
//! state open, pool funded, entrants present), and submits a
//! `perform_trigger` transaction when it observes the predicate true.
//! The program re-validates on-chain, so a stale observation costs at most
//! one rejected transaction.

use anyhow::{Context, Result};
use solana_client::nonblocking::rpc_client::RpcClient;
use solana_commitment_config::CommitmentConfig;
use solana_sdk::instruction::{AccountMeta, Instruction};
use solana_sdk::pubkey::Pubkey;
use solana_sdk::signature::Signer;
use solana_sdk_ids::system_program;
use solana_sdk::transaction::Transaction;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, error, info, warn};

use crate::config::AppConfig;
use crate::metrics::Metrics;
use crate::raffle_state::{parse_raffle_account, trigger_ready, RaffleAccount};

/// Offset of `request_counter` in the coordinator config account,
/// including the 8-byte discriminator.
///
/// Layout: discriminator (8) + admin (32) + authority (32) +
/// fee_per_word (8) + max_num_words (4) = 84.
const REQUEST_COUNTER_OFFSET: usize = 84;

/// Run the trigger scheduler loop. Never returns.
pub async fn run_scheduler(config: AppConfig, metrics: Arc<Metrics>) {
    let rpc_client = RpcClient::new_with_commitment(
        config.rpc_url.clone(),
        CommitmentConfig::confirmed(),
    );

    let poll = Duration::from_secs(config.trigger_poll_secs);
    let (raffle_pda, _) = Pubkey::find_program_address(&[b"raffle"], &config.raffle_program_id);
    let (vault_pda, _) = Pubkey::find_program_address(&[b"vault"], &config.raffle_program_id);

    info!(
        raffle = %raffle_pda,
        poll_secs = config.trigger_poll_secs,
        "Starting trigger scheduler"
    );

    loop {
        tokio::time::sleep(poll).await;
        metrics.record_trigger_check();

        match check_and_trigger(&rpc_client, &config, &raffle_pda, &vault_pda).await {
            Ok(Some(sig)) => {
                metrics.record_trigger_performed();
                info!(
                    signature = %sig,
                    explorer = %config.explorer_url(&sig),
                    "Trigger performed"
                );
            }
            Ok(None) => {}
            Err(e) => {
                let err_str = format!("{e:#}");
                // A concurrent crank or a clock race loses benignly; the
                // program rejected our transaction and nothing changed.
                if err_str.contains("TriggerNotSatisfied") {
                    warn!(reason = %err_str, "Trigger rejected on-chain, skipping");
                } else {
                    error!(error = %err_str, "Trigger check failed");
                }
            }
        }
    }
}

/// Evaluate the trigger predicate off-chain and submit `perform_trigger`
/// when it holds. Returns the transaction signature if one was sent.
async fn check_and_trigger(
    rpc_client: &RpcClient,
    config: &AppConfig,
    raffle_pda: &Pubkey,
    vault_pda: &Pubkey,
) -> Result<Option<String>> {
    let account = rpc_client
        .get_account(raffle_pda)
        .await
        .with_context(|| format!("failed to fetch raffle account {raffle_pda}"))?;
    let raffle = parse_raffle_account(&account.data)
        .context("raffle account data did not parse")?;

    let pool_lamports = rpc_client
        .get_balance(vault_pda)
        .await
        .context("failed to fetch vault balance")?;

    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .context("system clock before unix epoch")?
        .as_secs() as i64;

    if !trigger_ready(
        now,
        raffle.last_timestamp,
        raffle.interval,
        raffle.state,
        pool_lamports,
        raffle.players.len() as u64,
    ) {
        debug!(
            state = raffle.state,
            entrants = raffle.players.len(),
            pool_lamports,
            elapsed = now - raffle.last_timestamp,
            interval = raffle.interval,
            "Trigger not ready"
        );
        return Ok(None);
    }

    info!(
        entrants = raffle.players.len(),
        pool_lamports,
        "Trigger ready, submitting perform_trigger"
    );

    let ix = build_perform_trigger_instruction(
        rpc_client,
        config,
        &raffle,
        raffle_pda,
        vault_pda,
    )
    .await?;

    let blockhash = rpc_client
        .get_latest_blockhash()
        .await
        .context("failed to fetch latest blockhash")?;
    let tx = Transaction::new_signed_with_payer(
        &[ix],
        Some(&config.authority_keypair.pubkey()),
        &[config.authority_keypair.as_ref()],
        blockhash,
    );

    let sig = rpc_client
        .send_and_confirm_transaction(&tx)
        .await
        .context("perform_trigger transaction failed")?;

    Ok(Some(sig.to_string()))
}

/// Build the raffle `perform_trigger` instruction.
///
/// The request PDA seed depends on the coordinator's live `request_counter`,
/// so the config account is fetched and the counter read by offset.
async fn build_perform_trigger_instruction(
    rpc_client: &RpcClient,
    config: &AppConfig,
    raffle: &RaffleAccount,
    raffle_pda: &Pubkey,
    vault_pda: &Pubkey,
) -> Result<Instruction> {
    let coordinator = &config.coordinator_program_id;
    let (config_pda, _) = Pubkey::find_program_address(&[b"coordinator-config"], coordinator);
    let (subscription_pda, _) = Pubkey::find_program_address(
        &[b"subscription", &raffle.subscription_id.to_le_bytes()],
        coordinator,
    );
    let (registration_pda, _) = Pubkey::find_program_address(
        &[
            b"consumer",
            &raffle.subscription_id.to_le_bytes(),
            config.raffle_program_id.as_ref(),
        ],
        coordinator,
    );

    let config_account = rpc_client
        .get_account(&config_pda)
        .await
        .context("failed to fetch coordinator config")?;
    if config_account.data.len() < REQUEST_COUNTER_OFFSET + 8 {
        anyhow::bail!("coordinator config account too short");
    }
    let request_counter = u64::from_le_bytes(
        config_account.data[REQUEST_COUNTER_OFFSET..REQUEST_COUNTER_OFFSET + 8]
            .try_into()
            .expect("8-byte slice"),
    );

    let (request_pda, _) = Pubkey::find_program_address(
        &[b"request", &request_counter.to_le_bytes()],
        coordinator,
    );

    let mut data = Vec::with_capacity(8);
    data.extend_from_slice(&crate::fulfiller::instruction_discriminator("perform_trigger"));

    Ok(Instruction {
        program_id: config.raffle_program_id,
        accounts: vec![
            AccountMeta::new(config.authority_keypair.pubkey(), true), // payer
            AccountMeta::new(*raffle_pda, false),
            AccountMeta::new_readonly(*vault_pda, false),
            AccountMeta::new(config_pda, false),
            AccountMeta::new(subscription_pda, false),
            AccountMeta::new_readonly(registration_pda, false),
            AccountMeta::new_readonly(config.raffle_program_id, false), // callback target
            AccountMeta::new(request_pda, false),
            AccountMeta::new_readonly(*coordinator, false),
            AccountMeta::new_readonly(system_program::ID, false),
        ],
        data,
    })
}
