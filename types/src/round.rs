use crate::codec::{read_bytes, write_bytes};
use crate::commitment::SharedSecret;
use crate::deck::Deck;
use crate::{CARD_COUNT, PAIR_COUNT};
use bytes::{Buf, BufMut};
use commonware_codec::{Error, FixedSize, Read, ReadExt, Write};
use commonware_cryptography::ed25519::PublicKey;
use commonware_cryptography::{Hasher, Sha256};
use rand::Rng;
use std::time::Duration;
use thiserror::Error as ThisError;

/// Domain separator for storage handle derivation.
const ROUND_STATE_SEED: &[u8] = b"round_state";

/// Domain separator for computation handle derivation.
const COMPUTATION_SEED: &[u8] = b"computation";

/// Opaque random identity of one round; the correlation key for every
/// downstream message (verification requests, settlement, log recovery).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RoundId(pub u64);

impl RoundId {
    pub fn generate<R: Rng>(rng: &mut R) -> Self {
        Self(rng.gen())
    }
}

impl std::fmt::Display for RoundId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Write for RoundId {
    fn write(&self, writer: &mut impl BufMut) {
        self.0.write(writer);
    }
}

impl Read for RoundId {
    type Cfg = ();

    fn read_cfg(reader: &mut impl Buf, _: &Self::Cfg) -> Result<Self, Error> {
        Ok(Self(u64::read(reader)?))
    }
}

impl FixedSize for RoundId {
    const SIZE: usize = 8;
}

/// Deterministic address of a round's persisted state, bound to
/// (program id, player, round id).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct StorageHandle(pub [u8; 32]);

impl StorageHandle {
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Option<Self> {
        let bytes = hex::decode(s).ok()?;
        let bytes: [u8; 32] = bytes.try_into().ok()?;
        Some(Self(bytes))
    }
}

impl std::fmt::Display for StorageHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl Write for StorageHandle {
    fn write(&self, writer: &mut impl BufMut) {
        write_bytes(&self.0, writer);
    }
}

impl Read for StorageHandle {
    type Cfg = ();

    fn read_cfg(reader: &mut impl Buf, _: &Self::Cfg) -> Result<Self, Error> {
        Ok(Self(read_bytes(reader)?))
    }
}

impl FixedSize for StorageHandle {
    const SIZE: usize = 32;
}

fn derive_handle(seed: &[u8], parts: &[&[u8]]) -> StorageHandle {
    let mut hasher = Sha256::new();
    hasher.update(seed);
    for part in parts {
        hasher.update(part);
    }
    let digest = hasher.finalize();
    let mut out = [0u8; 32];
    out.copy_from_slice(digest.as_ref());
    StorageHandle(out)
}

/// Derive the storage handle for a round's persisted state.
pub fn derive_storage_handle(
    program_id: &[u8; 32],
    player: &PublicKey,
    round_id: RoundId,
) -> StorageHandle {
    derive_handle(
        ROUND_STATE_SEED,
        &[program_id, player.as_ref(), &round_id.0.to_le_bytes()],
    )
}

/// Derive the handle of one queued computation.
pub fn derive_computation_handle(program_id: &[u8; 32], computation_offset: u64) -> StorageHandle {
    derive_handle(
        COMPUTATION_SEED,
        &[program_id, &computation_offset.to_le_bytes()],
    )
}

/// Lifecycle of a round.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Playing,
    Won,
    TimedOut,
}

/// Why a two-card selection was rejected.
#[derive(ThisError, Clone, Copy, Debug, PartialEq, Eq)]
pub enum TurnError {
    #[error("round is no longer playing ({0:?})")]
    RoundOver(Phase),
    #[error("both selections are card {0}")]
    SameCard(u8),
    #[error("card index {0} out of range")]
    OutOfRange(u8),
    #[error("card {0} is already matched")]
    AlreadyMatched(u8),
    #[error("round is already settled")]
    Settled,
}

/// The aggregate root for one round: identity, account binding, the symmetric
/// key (memory only), and the accumulated turn counters. Created once at
/// registration, mutated by each resolved turn, logically destroyed at
/// settlement.
#[derive(Debug)]
pub struct RoundSession {
    pub id: RoundId,
    pub player: PublicKey,
    pub storage_handle: StorageHandle,
    shared_secret: SharedSecret,
    deck: Deck,
    pub turns_used: u16,
    pub pairs_found: u8,
    pub phase: Phase,
    /// Set once the final tally has been accepted; a settled round takes no
    /// further turns.
    pub settled: bool,
}

impl RoundSession {
    pub fn new(
        id: RoundId,
        player: PublicKey,
        storage_handle: StorageHandle,
        shared_secret: SharedSecret,
        deck: Deck,
    ) -> Self {
        Self {
            id,
            player,
            storage_handle,
            shared_secret,
            deck,
            turns_used: 0,
            pairs_found: 0,
            phase: Phase::Playing,
            settled: false,
        }
    }

    pub fn shared_secret(&self) -> &SharedSecret {
        &self.shared_secret
    }

    pub fn deck(&self) -> &Deck {
        &self.deck
    }

    /// Check the preconditions for a two-card turn without mutating anything.
    pub fn validate_turn(&self, card_a: u8, card_b: u8) -> Result<(), TurnError> {
        if self.settled {
            return Err(TurnError::Settled);
        }
        if self.phase != Phase::Playing {
            return Err(TurnError::RoundOver(self.phase));
        }
        if card_a == card_b {
            return Err(TurnError::SameCard(card_a));
        }
        for index in [card_a, card_b] {
            let card = self
                .deck
                .card(index)
                .ok_or(TurnError::OutOfRange(index))?;
            if card.matched {
                return Err(TurnError::AlreadyMatched(index));
            }
        }
        Ok(())
    }

    /// Apply one resolved turn. On a match both cards stay face up and the
    /// pair counter advances; otherwise both revert to hidden. Reaching
    /// [`PAIR_COUNT`] pairs wins the round.
    pub fn apply_turn(&mut self, card_a: u8, card_b: u8, is_match: bool) {
        self.turns_used = self.turns_used.saturating_add(1);
        for index in [card_a, card_b] {
            if let Some(card) = self.deck.card_mut(index) {
                card.revealed = is_match;
                card.matched = is_match;
            }
        }
        if is_match {
            self.pairs_found = self.pairs_found.saturating_add(1);
            if self.pairs_found as usize >= PAIR_COUNT {
                self.phase = Phase::Won;
            }
        }
    }

    /// Clock tick for time-budgeted play; a playing round whose budget is
    /// exhausted times out.
    pub fn tick(&mut self, elapsed: Duration, budget: Duration) {
        if self.phase == Phase::Playing && elapsed >= budget {
            self.phase = Phase::TimedOut;
        }
    }

    /// Whether the deck this session was registered with has the required
    /// size.
    pub fn deck_len_valid(deck: &Deck) -> bool {
        deck.len() == CARD_COUNT
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use commonware_cryptography::{ed25519::PrivateKey, Signer};
    use commonware_math::algebra::Random;
    use rand::{rngs::StdRng, SeedableRng};

    fn session(pair_ids: Vec<u8>) -> RoundSession {
        let mut rng = StdRng::seed_from_u64(1);
        let player = PrivateKey::random(&mut rng).public_key();
        let id = RoundId::generate(&mut rng);
        let handle = derive_storage_handle(&[0u8; 32], &player, id);
        RoundSession::new(
            id,
            player,
            handle,
            SharedSecret::from_bytes([0u8; 32]),
            Deck::from_pair_ids(pair_ids),
        )
    }

    fn full_deck() -> Vec<u8> {
        (0..PAIR_COUNT as u8).flat_map(|p| [p, p]).collect()
    }

    #[test]
    fn storage_handles_are_deterministic_and_distinct() {
        let mut rng = StdRng::seed_from_u64(3);
        let player = PrivateKey::random(&mut rng).public_key();
        let other = PrivateKey::random(&mut rng).public_key();
        let program = [7u8; 32];

        let a = derive_storage_handle(&program, &player, RoundId(1));
        let b = derive_storage_handle(&program, &player, RoundId(1));
        assert_eq!(a, b);
        assert_ne!(a, derive_storage_handle(&program, &player, RoundId(2)));
        assert_ne!(a, derive_storage_handle(&program, &other, RoundId(1)));
        assert_ne!(a, derive_computation_handle(&program, 1));
    }

    #[test]
    fn storage_handle_hex_roundtrip() {
        let handle = derive_computation_handle(&[1u8; 32], 99);
        assert_eq!(StorageHandle::from_hex(&handle.to_hex()), Some(handle));
        assert_eq!(StorageHandle::from_hex("zz"), None);
    }

    #[test]
    fn turn_accounting_invariant() {
        let mut session = session(full_deck());
        // Three turns: one match, two misses.
        session.apply_turn(0, 1, true);
        session.apply_turn(2, 4, false);
        session.apply_turn(3, 5, false);
        assert_eq!(session.turns_used, 3);
        assert_eq!(session.pairs_found, 1);
        assert!(session.pairs_found as u16 <= session.turns_used);
        assert_eq!(session.phase, Phase::Playing);
    }

    #[test]
    fn unmatched_cards_revert_to_hidden() {
        let mut session = session(full_deck());
        session.apply_turn(0, 2, false);
        assert!(!session.deck().card(0).unwrap().revealed);
        assert!(!session.deck().card(2).unwrap().revealed);
        session.apply_turn(0, 1, true);
        assert!(session.deck().card(0).unwrap().matched);
        assert!(session.deck().card(1).unwrap().matched);
    }

    #[test]
    fn validate_turn_rejections() {
        let mut session = session(full_deck());
        assert_eq!(session.validate_turn(3, 3), Err(TurnError::SameCard(3)));
        assert_eq!(session.validate_turn(0, 16), Err(TurnError::OutOfRange(16)));
        session.apply_turn(0, 1, true);
        assert_eq!(session.validate_turn(0, 2), Err(TurnError::AlreadyMatched(0)));
        assert_eq!(session.validate_turn(2, 3), Ok(()));
    }

    #[test]
    fn winning_closes_the_round() {
        let mut session = session(full_deck());
        for pair in 0..PAIR_COUNT as u8 {
            session.apply_turn(pair * 2, pair * 2 + 1, true);
        }
        assert_eq!(session.pairs_found as usize, PAIR_COUNT);
        assert_eq!(session.phase, Phase::Won);
        assert_eq!(
            session.validate_turn(0, 1),
            Err(TurnError::RoundOver(Phase::Won))
        );
    }

    #[test]
    fn settled_round_rejects_turns() {
        // An abandoned round can be settled while still in the playing
        // phase; from then on turns are refused locally.
        let mut session = session(full_deck());
        session.settled = true;
        assert_eq!(session.phase, Phase::Playing);
        assert_eq!(session.validate_turn(0, 1), Err(TurnError::Settled));
    }

    #[test]
    fn tick_times_out_playing_rounds_only() {
        let mut session = session(full_deck());
        session.tick(Duration::from_secs(1), Duration::from_secs(2));
        assert_eq!(session.phase, Phase::Playing);
        session.tick(Duration::from_secs(2), Duration::from_secs(2));
        assert_eq!(session.phase, Phase::TimedOut);

        let mut won = self::session(full_deck());
        for pair in 0..PAIR_COUNT as u8 {
            won.apply_turn(pair * 2, pair * 2 + 1, true);
        }
        won.tick(Duration::from_secs(10), Duration::from_secs(2));
        assert_eq!(won.phase, Phase::Won);
    }
}
