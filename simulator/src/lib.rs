//! In-process backend for veilmatch: round accounts, confidential pair
//! verification, event delivery, and per-handle logs, behind the same HTTP/WS
//! surface the production backend exposes. Fault-injection knobs let tests
//! exercise the client's recovery paths.

use commonware_cryptography::ed25519::PublicKey;
use rand::rngs::OsRng;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use veilmatch_types::api::{Event, Instruction, RoundStateView, TxStatus};
use veilmatch_types::commitment::{open_card, seal_match_flag, SharedSecret, Slot};
use veilmatch_types::round::{derive_computation_handle, derive_storage_handle};
use veilmatch_types::{RoundId, StorageHandle, CARD_COUNT, CIPHERTEXT_LEN, NONCE_LEN};
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};

mod api;
pub use api::Api;

fn parse_env_u64(var: &str) -> Option<u64> {
    std::env::var(var).ok().and_then(|v| v.parse().ok())
}

const EVENTS_BROADCAST_CAPACITY: usize = 1024;

/// Why an instruction was rejected.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ApplyError {
    #[error("submissions are disabled")]
    SubmissionsRejected,
    #[error("invalid card count: {got}")]
    InvalidCardCount { got: usize },
    #[error("round {0} already registered")]
    DuplicateRound(RoundId),
    #[error("unknown round {0}")]
    UnknownRound(RoundId),
    #[error("round {0} is owned by another player")]
    UnauthorizedRoundOwner(RoundId),
    #[error("slot B already set for round {0}")]
    SlotBAlreadySet(RoundId),
    #[error("slot B missing for round {0}")]
    MissingSlotB(RoundId),
    #[error("card index {0} out of bounds")]
    CardIndexOutOfBounds(u8),
    #[error("round {0} is already completed")]
    RoundCompleted(RoundId),
    #[error("round {0} is already settled")]
    AlreadySettled(RoundId),
}

/// Stored state of one round.
struct RoundAccount {
    player: PublicKey,
    round_id: RoundId,
    ephemeral_public_key: [u8; 32],
    board_nonce: [u8; NONCE_LEN],
    slot_a: Vec<[u8; CIPHERTEXT_LEN]>,
    slot_b: Option<Vec<[u8; CIPHERTEXT_LEN]>>,
    turns_used: u16,
    pairs_found: u8,
    completed: bool,
}

#[derive(Default)]
struct State {
    rounds: HashMap<StorageHandle, RoundAccount>,
    rounds_by_id: HashMap<RoundId, StorageHandle>,
    logs: HashMap<StorageHandle, Vec<Event>>,
    computations: HashMap<u64, TxStatus>,
}

pub struct Simulator {
    program_id: [u8; 32],
    mxe_secret: StaticSecret,
    mxe_public: [u8; 32],
    state: Mutex<State>,
    events: broadcast::Sender<Event>,
    // Fault injection: exercised by client tests and load tooling.
    key_delay_queries: AtomicU32,
    drop_event_delivery: AtomicBool,
    reject_submissions: AtomicBool,
    stall_verifications: AtomicBool,
    abort_verifications: AtomicBool,
    verification_delay_ms: AtomicU64,
}

impl Simulator {
    pub fn new(program_id: [u8; 32]) -> Self {
        let mxe_secret = StaticSecret::random_from_rng(OsRng);
        let mxe_public = X25519Public::from(&mxe_secret).to_bytes();
        let (events, _) = broadcast::channel(EVENTS_BROADCAST_CAPACITY);
        Self {
            program_id,
            mxe_secret,
            mxe_public,
            state: Mutex::new(State::default()),
            events,
            key_delay_queries: AtomicU32::new(0),
            drop_event_delivery: AtomicBool::new(false),
            reject_submissions: AtomicBool::new(false),
            stall_verifications: AtomicBool::new(false),
            abort_verifications: AtomicBool::new(false),
            verification_delay_ms: AtomicU64::new(
                parse_env_u64("VERIFICATION_DELAY_MS").unwrap_or(0),
            ),
        }
    }

    pub fn program_id(&self) -> [u8; 32] {
        self.program_id
    }

    /// The compute environment's x25519 public key.
    pub fn mxe_public_key(&self) -> [u8; 32] {
        self.mxe_public
    }

    /// One key query as the HTTP surface sees it; consumes a delayed query if
    /// any are configured.
    pub(crate) fn query_mxe_key(&self) -> Option<[u8; 32]> {
        let delayed = self
            .key_delay_queries
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| v.checked_sub(1))
            .is_ok();
        if delayed {
            None
        } else {
            Some(self.mxe_public)
        }
    }

    /// Make the next `queries` key lookups miss, as after a cluster restart.
    pub fn set_key_delay_queries(&self, queries: u32) {
        self.key_delay_queries.store(queries, Ordering::SeqCst);
    }

    /// Log and finalize verifications without broadcasting their events.
    pub fn set_drop_event_delivery(&self, drop: bool) {
        self.drop_event_delivery.store(drop, Ordering::SeqCst);
    }

    /// Reject every submitted instruction.
    pub fn set_reject_submissions(&self, reject: bool) {
        self.reject_submissions.store(reject, Ordering::SeqCst);
    }

    /// Accept verifications but never process them; their status stays
    /// pending forever.
    pub fn set_stall_verifications(&self, stall: bool) {
        self.stall_verifications.store(stall, Ordering::SeqCst);
    }

    /// Abort every verification instead of processing it.
    pub fn set_abort_verifications(&self, abort: bool) {
        self.abort_verifications.store(abort, Ordering::SeqCst);
    }

    /// Delay each verification by `delay` milliseconds before it resolves.
    pub fn set_verification_delay_ms(&self, delay: u64) {
        self.verification_delay_ms.store(delay, Ordering::SeqCst);
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<Event> {
        self.events.subscribe()
    }

    pub fn round_view(&self, handle: &StorageHandle) -> Option<RoundStateView> {
        let state = self.state.lock().unwrap();
        state.rounds.get(handle).map(|account| RoundStateView {
            player: account.player.clone(),
            round_id: account.round_id,
            turns_used: account.turns_used,
            pairs_found: account.pairs_found,
            completed: account.completed,
            slot_b_present: account.slot_b.is_some(),
        })
    }

    pub fn computation_status(&self, computation_offset: u64) -> Option<TxStatus> {
        let state = self.state.lock().unwrap();
        state.computations.get(&computation_offset).copied()
    }

    /// The last `limit` events logged under a handle, oldest first.
    pub fn log(&self, handle: &StorageHandle, limit: usize) -> Vec<Event> {
        let state = self.state.lock().unwrap();
        let Some(entries) = state.logs.get(handle) else {
            return Vec::new();
        };
        let skip = entries.len().saturating_sub(limit);
        entries[skip..].to_vec()
    }

    fn ensure_accepting(&self) -> Result<(), ApplyError> {
        if self.reject_submissions.load(Ordering::SeqCst) {
            return Err(ApplyError::SubmissionsRejected);
        }
        Ok(())
    }

    /// Resolve the round a request targets and enforce ownership.
    fn lookup(&self, player: &PublicKey, round_id: RoundId) -> Result<StorageHandle, ApplyError> {
        let state = self.state.lock().unwrap();
        let handle = *state
            .rounds_by_id
            .get(&round_id)
            .ok_or(ApplyError::UnknownRound(round_id))?;
        let account = state
            .rounds
            .get(&handle)
            .ok_or(ApplyError::UnknownRound(round_id))?;
        if &account.player != player {
            return Err(ApplyError::UnauthorizedRoundOwner(round_id));
        }
        Ok(handle)
    }

    /// Apply one submitted instruction.
    pub fn apply(self: &Arc<Self>, instruction: Instruction) -> Result<(), ApplyError> {
        match instruction {
            Instruction::RegisterRound {
                player,
                round_id,
                slot_a,
                ephemeral_public_key,
                board_nonce,
            } => {
                self.ensure_accepting()?;
                if slot_a.len() != CARD_COUNT {
                    return Err(ApplyError::InvalidCardCount { got: slot_a.len() });
                }
                let handle = derive_storage_handle(&self.program_id, &player, round_id);
                let mut state = self.state.lock().unwrap();
                if state.rounds_by_id.contains_key(&round_id) {
                    return Err(ApplyError::DuplicateRound(round_id));
                }
                state.rounds.insert(
                    handle,
                    RoundAccount {
                        player,
                        round_id,
                        ephemeral_public_key,
                        board_nonce,
                        slot_a,
                        slot_b: None,
                        turns_used: 0,
                        pairs_found: 0,
                        completed: false,
                    },
                );
                state.rounds_by_id.insert(round_id, handle);
                info!(%round_id, %handle, "round registered");
                Ok(())
            }

            Instruction::SetRoundSlotB {
                player,
                round_id,
                slot_b,
            } => {
                self.ensure_accepting()?;
                if slot_b.len() != CARD_COUNT {
                    return Err(ApplyError::InvalidCardCount { got: slot_b.len() });
                }
                let handle = self.lookup(&player, round_id)?;
                let mut state = self.state.lock().unwrap();
                let account = state
                    .rounds
                    .get_mut(&handle)
                    .ok_or(ApplyError::UnknownRound(round_id))?;
                if account.slot_b.is_some() {
                    return Err(ApplyError::SlotBAlreadySet(round_id));
                }
                account.slot_b = Some(slot_b);
                debug!(%round_id, "slot B committed");
                Ok(())
            }

            Instruction::VerifyPair {
                player,
                round_id,
                card_a,
                card_b,
                computation_offset,
                turn_nonce,
            } => {
                self.ensure_accepting()?;
                let handle = self.lookup(&player, round_id)?;
                let (ephemeral_public_key, board_nonce, cipher_a, cipher_b) = {
                    let state = self.state.lock().unwrap();
                    let account = state
                        .rounds
                        .get(&handle)
                        .ok_or(ApplyError::UnknownRound(round_id))?;
                    if account.completed {
                        return Err(ApplyError::RoundCompleted(round_id));
                    }
                    let slot_b = account
                        .slot_b
                        .as_ref()
                        .ok_or(ApplyError::MissingSlotB(round_id))?;
                    if card_a as usize >= CARD_COUNT {
                        return Err(ApplyError::CardIndexOutOfBounds(card_a));
                    }
                    if card_b as usize >= CARD_COUNT {
                        return Err(ApplyError::CardIndexOutOfBounds(card_b));
                    }
                    (
                        account.ephemeral_public_key,
                        account.board_nonce,
                        account.slot_a[card_a as usize],
                        slot_b[card_b as usize],
                    )
                };

                {
                    let mut state = self.state.lock().unwrap();
                    state
                        .computations
                        .insert(computation_offset, TxStatus::Pending);
                }
                if self.stall_verifications.load(Ordering::SeqCst) {
                    debug!(computation_offset, "verification stalled by fault injection");
                    return Ok(());
                }
                if self.abort_verifications.load(Ordering::SeqCst) {
                    let mut state = self.state.lock().unwrap();
                    state
                        .computations
                        .insert(computation_offset, TxStatus::Aborted);
                    return Ok(());
                }
                self.spawn_verification(
                    player,
                    round_id,
                    handle,
                    ephemeral_public_key,
                    board_nonce,
                    card_a,
                    card_b,
                    cipher_a,
                    cipher_b,
                    computation_offset,
                    turn_nonce,
                );
                Ok(())
            }

            Instruction::SettleRoundScore {
                player,
                round_id,
                turns_used,
                pairs_found,
                completed,
                solve_ms,
                points_delta,
                nonce_hash,
            } => {
                self.ensure_accepting()?;
                let handle = self.lookup(&player, round_id)?;
                let event = {
                    let mut state = self.state.lock().unwrap();
                    let account = state
                        .rounds
                        .get_mut(&handle)
                        .ok_or(ApplyError::UnknownRound(round_id))?;
                    if account.completed {
                        return Err(ApplyError::AlreadySettled(round_id));
                    }
                    account.completed = true;
                    account.pairs_found = pairs_found;
                    let event = Event::RoundSettled {
                        player,
                        round_id,
                        turns_used,
                        pairs_found,
                        completed,
                        solve_ms,
                        points_delta,
                        nonce_hash,
                    };
                    state.logs.entry(handle).or_default().push(event.clone());
                    event
                };
                info!(%round_id, completed, points_delta, "round settled");
                if !self.drop_event_delivery.load(Ordering::SeqCst) {
                    let _ = self.events.send(event);
                }
                Ok(())
            }
        }
    }

    /// Resolve one verification asynchronously: re-derive the symmetric key,
    /// open one card from each slot, compare, and seal the outcome under the
    /// request's turn nonce.
    #[allow(clippy::too_many_arguments)]
    fn spawn_verification(
        self: &Arc<Self>,
        player: PublicKey,
        round_id: RoundId,
        handle: StorageHandle,
        ephemeral_public_key: [u8; 32],
        board_nonce: [u8; NONCE_LEN],
        card_a: u8,
        card_b: u8,
        cipher_a: [u8; CIPHERTEXT_LEN],
        cipher_b: [u8; CIPHERTEXT_LEN],
        computation_offset: u64,
        turn_nonce: [u8; NONCE_LEN],
    ) {
        let simulator = self.clone();
        tokio::spawn(async move {
            let delay = simulator.verification_delay_ms.load(Ordering::SeqCst);
            if delay > 0 {
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }

            let shared = SharedSecret::agree(&simulator.mxe_secret, &ephemeral_public_key);
            let sealed = open_card(&shared, &board_nonce, Slot::A, card_a, &cipher_a)
                .and_then(|a| {
                    open_card(&shared, &board_nonce, Slot::B, card_b, &cipher_b).map(|b| a == b)
                })
                .and_then(|is_match| seal_match_flag(&shared, &turn_nonce, is_match));
            let sealed = match sealed {
                Ok(sealed) => sealed,
                Err(err) => {
                    warn!(%round_id, computation_offset, error = %err, "failed to open commitment");
                    let mut state = simulator.state.lock().unwrap();
                    state
                        .computations
                        .insert(computation_offset, TxStatus::Aborted);
                    return;
                }
            };

            let event = {
                let mut state = simulator.state.lock().unwrap();
                let (turns_used, pairs_found) = {
                    let Some(account) = state.rounds.get_mut(&handle) else {
                        return;
                    };
                    // The server counts turns itself; pair totals are only
                    // recorded at settlement.
                    account.turns_used = account.turns_used.saturating_add(1);
                    (account.turns_used, account.pairs_found)
                };
                let event = Event::PairVerified {
                    player,
                    round_id,
                    turns_used,
                    pairs_found,
                    is_match_cipher: sealed,
                    nonce: turn_nonce,
                };
                let computation_handle =
                    derive_computation_handle(&simulator.program_id, computation_offset);
                state.logs.entry(handle).or_default().push(event.clone());
                state
                    .logs
                    .entry(computation_handle)
                    .or_default()
                    .push(event.clone());
                state
                    .computations
                    .insert(computation_offset, TxStatus::Finalized);
                event
            };

            if simulator.drop_event_delivery.load(Ordering::SeqCst) {
                debug!(%round_id, computation_offset, "event delivery dropped by fault injection");
                return;
            }
            let _ = simulator.events.send(event);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use commonware_cryptography::{ed25519::PrivateKey, Signer};
    use commonware_math::algebra::Random;
    use rand::{rngs::StdRng, SeedableRng};
    use std::time::Duration;
    use veilmatch_types::commitment::{open_match_flag, BoardCommitment};
    use veilmatch_types::Deck;

    const PROGRAM_ID: [u8; 32] = [3u8; 32];

    fn keypair(seed: u64) -> PublicKey {
        PrivateKey::random(&mut StdRng::seed_from_u64(seed)).public_key()
    }

    struct Registered {
        simulator: Arc<Simulator>,
        player: PublicKey,
        round_id: RoundId,
        handle: StorageHandle,
        deck: Deck,
        shared: SharedSecret,
    }

    fn register(seed: u64) -> Registered {
        let simulator = Arc::new(Simulator::new(PROGRAM_ID));
        let mut rng = StdRng::seed_from_u64(seed);
        let player = keypair(seed);
        let deck = Deck::shuffled(&mut rng);
        let (shared, commitment) =
            BoardCommitment::prepare(&deck, &simulator.mxe_public_key(), &mut rng).unwrap();
        let round_id = RoundId::generate(&mut rng);
        let handle = derive_storage_handle(&PROGRAM_ID, &player, round_id);

        simulator
            .apply(Instruction::RegisterRound {
                player: player.clone(),
                round_id,
                slot_a: commitment.slot_a,
                ephemeral_public_key: commitment.ephemeral_public_key,
                board_nonce: commitment.board_nonce,
            })
            .unwrap();
        simulator
            .apply(Instruction::SetRoundSlotB {
                player: player.clone(),
                round_id,
                slot_b: commitment.slot_b,
            })
            .unwrap();

        Registered {
            simulator,
            player,
            round_id,
            handle,
            deck,
            shared,
        }
    }

    #[tokio::test]
    async fn register_creates_queryable_account() {
        let ctx = register(1);
        let view = ctx.simulator.round_view(&ctx.handle).unwrap();
        assert_eq!(view.round_id, ctx.round_id);
        assert_eq!(view.turns_used, 0);
        assert!(view.slot_b_present);
        assert!(!view.completed);
    }

    #[tokio::test]
    async fn duplicate_round_is_rejected() {
        let ctx = register(2);
        let err = ctx
            .simulator
            .apply(Instruction::RegisterRound {
                player: ctx.player.clone(),
                round_id: ctx.round_id,
                slot_a: vec![[0u8; CIPHERTEXT_LEN]; CARD_COUNT],
                ephemeral_public_key: [0u8; 32],
                board_nonce: [0u8; NONCE_LEN],
            })
            .unwrap_err();
        assert_eq!(err, ApplyError::DuplicateRound(ctx.round_id));
    }

    #[tokio::test]
    async fn verification_requires_slot_b() {
        let simulator = Arc::new(Simulator::new(PROGRAM_ID));
        let mut rng = StdRng::seed_from_u64(3);
        let player = keypair(3);
        let deck = Deck::shuffled(&mut rng);
        let (_, commitment) =
            BoardCommitment::prepare(&deck, &simulator.mxe_public_key(), &mut rng).unwrap();
        let round_id = RoundId(5);
        simulator
            .apply(Instruction::RegisterRound {
                player: player.clone(),
                round_id,
                slot_a: commitment.slot_a,
                ephemeral_public_key: commitment.ephemeral_public_key,
                board_nonce: commitment.board_nonce,
            })
            .unwrap();

        let err = simulator
            .apply(Instruction::VerifyPair {
                player,
                round_id,
                card_a: 0,
                card_b: 1,
                computation_offset: 1,
                turn_nonce: [0u8; NONCE_LEN],
            })
            .unwrap_err();
        assert_eq!(err, ApplyError::MissingSlotB(round_id));
    }

    #[tokio::test]
    async fn verification_rejects_bad_indexes_and_foreign_players() {
        let ctx = register(4);

        let err = ctx
            .simulator
            .apply(Instruction::VerifyPair {
                player: ctx.player.clone(),
                round_id: ctx.round_id,
                card_a: 16,
                card_b: 1,
                computation_offset: 1,
                turn_nonce: [0u8; NONCE_LEN],
            })
            .unwrap_err();
        assert_eq!(err, ApplyError::CardIndexOutOfBounds(16));

        let intruder = keypair(99);
        let err = ctx
            .simulator
            .apply(Instruction::VerifyPair {
                player: intruder,
                round_id: ctx.round_id,
                card_a: 0,
                card_b: 1,
                computation_offset: 1,
                turn_nonce: [0u8; NONCE_LEN],
            })
            .unwrap_err();
        assert_eq!(err, ApplyError::UnauthorizedRoundOwner(ctx.round_id));
    }

    #[tokio::test]
    async fn verification_seals_a_correct_outcome() {
        let ctx = register(5);
        let mut events = ctx.simulator.subscribe_events();

        // Two cards with the same pair id, from the known layout.
        let ids = ctx.deck.pair_ids();
        let (a, b) = (0..ids.len())
            .flat_map(|i| ((i + 1)..ids.len()).map(move |j| (i, j)))
            .find(|&(i, j)| ids[i] == ids[j])
            .unwrap();

        let turn_nonce = [7u8; NONCE_LEN];
        ctx.simulator
            .apply(Instruction::VerifyPair {
                player: ctx.player.clone(),
                round_id: ctx.round_id,
                card_a: a as u8,
                card_b: b as u8,
                computation_offset: 42,
                turn_nonce,
            })
            .unwrap();

        let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .unwrap()
            .unwrap();
        let Event::PairVerified {
            turns_used,
            is_match_cipher,
            nonce,
            ..
        } = event
        else {
            panic!("expected PairVerified");
        };
        assert_eq!(turns_used, 1);
        assert_eq!(nonce, turn_nonce);
        // Only the player's copy of the key can open the outcome.
        assert_eq!(
            open_match_flag(&ctx.shared, &is_match_cipher, &turn_nonce),
            Ok(true)
        );
        assert_eq!(
            ctx.simulator.computation_status(42),
            Some(TxStatus::Finalized)
        );
        // Logged under both the round and the computation.
        assert_eq!(ctx.simulator.log(&ctx.handle, 10).len(), 1);
        let computation_handle = derive_computation_handle(&PROGRAM_ID, 42);
        assert_eq!(ctx.simulator.log(&computation_handle, 10).len(), 1);
    }

    #[tokio::test]
    async fn settle_is_one_shot() {
        let ctx = register(6);
        let settle = Instruction::SettleRoundScore {
            player: ctx.player.clone(),
            round_id: ctx.round_id,
            turns_used: 9,
            pairs_found: 8,
            completed: true,
            solve_ms: 30_000,
            points_delta: 120,
            nonce_hash: [1u8; 32],
        };
        ctx.simulator.apply(settle.clone()).unwrap();
        let err = ctx.simulator.apply(settle).unwrap_err();
        assert_eq!(err, ApplyError::AlreadySettled(ctx.round_id));

        let view = ctx.simulator.round_view(&ctx.handle).unwrap();
        assert!(view.completed);
        assert_eq!(view.pairs_found, 8);

        // A settled round rejects further verification.
        let err = ctx
            .simulator
            .apply(Instruction::VerifyPair {
                player: ctx.player.clone(),
                round_id: ctx.round_id,
                card_a: 0,
                card_b: 1,
                computation_offset: 1,
                turn_nonce: [0u8; NONCE_LEN],
            })
            .unwrap_err();
        assert_eq!(err, ApplyError::RoundCompleted(ctx.round_id));
    }

    #[tokio::test]
    async fn log_keeps_newest_entries() {
        let ctx = register(7);
        ctx.simulator
            .apply(Instruction::SettleRoundScore {
                player: ctx.player.clone(),
                round_id: ctx.round_id,
                turns_used: 1,
                pairs_found: 0,
                completed: false,
                solve_ms: 1,
                points_delta: 0,
                nonce_hash: [0u8; 32],
            })
            .unwrap();
        assert_eq!(ctx.simulator.log(&ctx.handle, 10).len(), 1);
        assert_eq!(ctx.simulator.log(&ctx.handle, 0).len(), 0);
        assert!(ctx
            .simulator
            .log(&derive_storage_handle(&PROGRAM_ID, &ctx.player, RoundId(0)), 10)
            .is_empty());
    }

    #[tokio::test]
    async fn key_delay_consumes_queries() {
        let simulator = Arc::new(Simulator::new(PROGRAM_ID));
        simulator.set_key_delay_queries(2);
        assert_eq!(simulator.query_mxe_key(), None);
        assert_eq!(simulator.query_mxe_key(), None);
        assert_eq!(simulator.query_mxe_key(), Some(simulator.mxe_public_key()));
    }
}
