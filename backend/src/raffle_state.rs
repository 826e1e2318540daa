//! Off-chain mirror of the raffle account layout and settlement math.
//!
//! The keeper does not link against the on-chain crates; it parses account
//! data by fixed Borsh offsets, the same way it parses coordinator request
//! accounts. The trigger predicate and winner-index computation here must
//! stay in lockstep with the raffle program, which re-validates both.

use sha2::{Digest, Sha256};
use solana_sdk::pubkey::Pubkey;

/// `RaffleState::Open` discriminant byte.
pub const STATE_OPEN: u8 = 0;
/// `RaffleState::Calculating` discriminant byte.
pub const STATE_CALCULATING: u8 = 1;

/// Parsed raffle singleton account.
///
/// Account data layout (offsets include the 8-byte discriminator):
///
/// ```text
/// [0..8]      discriminator
/// [8..40]     admin                  (Pubkey)
/// [40..72]    coordinator            (Pubkey)
/// [72..80]    entry_fee              (u64)
/// [80..88]    interval               (i64)
/// [88..96]    subscription_id        (u64)
/// [96..128]   key_hash               ([u8; 32])
/// [128..132]  callback_compute_limit (u32)
/// [132]       state                  (u8)
/// [133..141]  last_timestamp         (i64)
/// [141..173]  recent_winner          (Pubkey)
/// [173..181]  pending_request_id     (u64)
/// [181]       has_pending_request    (bool)
/// [182..186]  players length         (u32)
/// [186..]     players                (Pubkey * length), then bumps
/// ```
#[derive(Debug, Clone)]
pub struct RaffleAccount {
    pub coordinator: Pubkey,
    pub entry_fee: u64,
    pub interval: i64,
    pub subscription_id: u64,
    pub state: u8,
    pub last_timestamp: i64,
    pub pending_request_id: u64,
    pub has_pending_request: bool,
    pub players: Vec<Pubkey>,
}

/// Offset of the players length field, including the discriminator.
const PLAYERS_LEN_OFFSET: usize = 182;

/// Compute the Anchor account discriminator: `sha256("account:<Name>")[..8]`.
pub fn account_discriminator(account_name: &str) -> [u8; 8] {
    let mut hasher = Sha256::new();
    hasher.update(format!("account:{account_name}"));
    let hash = hasher.finalize();
    let mut disc = [0u8; 8];
    disc.copy_from_slice(&hash[..8]);
    disc
}

/// Parse a raffle account from raw account data. Returns `None` on a
/// discriminator mismatch or truncated data.
pub fn parse_raffle_account(data: &[u8]) -> Option<RaffleAccount> {
    if data.len() < PLAYERS_LEN_OFFSET + 4 || data[..8] != account_discriminator("Raffle") {
        return None;
    }

    let body = &data[8..];
    let coordinator = Pubkey::try_from(&body[32..64]).ok()?;
    let entry_fee = u64::from_le_bytes(body[64..72].try_into().ok()?);
    let interval = i64::from_le_bytes(body[72..80].try_into().ok()?);
    let subscription_id = u64::from_le_bytes(body[80..88].try_into().ok()?);
    let state = body[124];
    let last_timestamp = i64::from_le_bytes(body[125..133].try_into().ok()?);
    let pending_request_id = u64::from_le_bytes(body[165..173].try_into().ok()?);
    let has_pending_request = body[173] != 0;

    let players_len = u32::from_le_bytes(body[174..178].try_into().ok()?) as usize;
    let players_end = 178 + players_len * 32;
    if body.len() < players_end {
        return None;
    }
    let mut players = Vec::with_capacity(players_len);
    for i in 0..players_len {
        let start = 178 + i * 32;
        players.push(Pubkey::try_from(&body[start..start + 32]).ok()?);
    }

    Some(RaffleAccount {
        coordinator,
        entry_fee,
        interval,
        subscription_id,
        state,
        last_timestamp,
        pending_request_id,
        has_pending_request,
        players,
    })
}

/// Settlement eligibility predicate, mirrored from the raffle program.
pub fn trigger_ready(
    now: i64,
    last_timestamp: i64,
    interval: i64,
    state: u8,
    pool_lamports: u64,
    entrant_count: u64,
) -> bool {
    now.saturating_sub(last_timestamp) >= interval
        && state == STATE_OPEN
        && pool_lamports > 0
        && entrant_count > 0
}

/// Map a random word onto an entrant index, mirrored from the raffle program.
pub fn winner_index(word: &[u8; 32], entrant_count: u64) -> Option<u64> {
    if entrant_count == 0 {
        return None;
    }
    let value = u64::from_le_bytes(word[0..8].try_into().expect("8-byte slice"));
    Some(value % entrant_count)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn synthetic_raffle_data(state: u8, players: &[Pubkey]) -> Vec<u8> {
        let mut data = Vec::new();
        data.extend_from_slice(&account_discriminator("Raffle"));
        data.extend_from_slice(Pubkey::new_unique().as_ref()); // admin
        data.extend_from_slice(Pubkey::new_unique().as_ref()); // coordinator
        data.extend_from_slice(&25_000u64.to_le_bytes()); // entry_fee
        data.extend_from_slice(&100i64.to_le_bytes()); // interval
        data.extend_from_slice(&3u64.to_le_bytes()); // subscription_id
        data.extend_from_slice(&[0u8; 32]); // key_hash
        data.extend_from_slice(&200_000u32.to_le_bytes()); // callback_compute_limit
        data.push(state);
        data.extend_from_slice(&1_000i64.to_le_bytes()); // last_timestamp
        data.extend_from_slice(&[0u8; 32]); // recent_winner
        data.extend_from_slice(&9u64.to_le_bytes()); // pending_request_id
        data.push(u8::from(state == STATE_CALCULATING)); // has_pending_request
        data.extend_from_slice(&(players.len() as u32).to_le_bytes());
        for player in players {
            data.extend_from_slice(player.as_ref());
        }
        data.push(254); // bump
        data.push(253); // vault_bump
        data
    }

    #[test]
    fn parses_synthetic_raffle_account() {
        let players = vec![Pubkey::new_unique(), Pubkey::new_unique()];
        let data = synthetic_raffle_data(STATE_CALCULATING, &players);

        let raffle = parse_raffle_account(&data).expect("parses");
        assert_eq!(raffle.entry_fee, 25_000);
        assert_eq!(raffle.interval, 100);
        assert_eq!(raffle.subscription_id, 3);
        assert_eq!(raffle.state, STATE_CALCULATING);
        assert_eq!(raffle.last_timestamp, 1_000);
        assert_eq!(raffle.pending_request_id, 9);
        assert!(raffle.has_pending_request);
        assert_eq!(raffle.players, players);
    }

    #[test]
    fn rejects_wrong_discriminator() {
        let mut data = synthetic_raffle_data(STATE_OPEN, &[]);
        data[0] ^= 0xFF;
        assert!(parse_raffle_account(&data).is_none());
    }

    #[test]
    fn rejects_truncated_players() {
        let players = vec![Pubkey::new_unique(), Pubkey::new_unique()];
        let mut data = synthetic_raffle_data(STATE_OPEN, &players);
        data.truncate(data.len() - 40);
        assert!(parse_raffle_account(&data).is_none());
    }

    #[test]
    fn trigger_mirrors_onchain_conjunction() {
        assert!(trigger_ready(1_101, 1_000, 100, STATE_OPEN, 3, 3));
        assert!(!trigger_ready(1_050, 1_000, 100, STATE_OPEN, 3, 3));
        assert!(!trigger_ready(1_101, 1_000, 100, STATE_CALCULATING, 3, 3));
        assert!(!trigger_ready(1_101, 1_000, 100, STATE_OPEN, 0, 3));
        assert!(!trigger_ready(1_101, 1_000, 100, STATE_OPEN, 3, 0));
    }

    #[test]
    fn winner_index_matches_word_mod_count() {
        let mut word = [0u8; 32];
        word[0..8].copy_from_slice(&7u64.to_le_bytes());
        assert_eq!(winner_index(&word, 3), Some(1));
        assert_eq!(winner_index(&word, 0), None);
    }
}
