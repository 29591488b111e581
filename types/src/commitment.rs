//! Board commitment cryptography.
//!
//! The board is committed as two "slots" of per-card ciphertexts: each card's
//! pair id is sealed once into slot A and once into slot B under a symmetric
//! key agreed with the confidential compute environment. The verifier opens
//! `slot_a[a]` and `slot_b[b]` and compares the two pair ids for equality
//! without learning anything else about the layout, then seals the single-bit
//! outcome back to the player.

use crate::deck::Deck;
use crate::{CIPHERTEXT_LEN, NONCE_LEN};
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use rand::{CryptoRng, Rng};
use thiserror::Error;
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};

/// Width of the AEAD nonce consumed by the cipher. Wire nonces are
/// [`NONCE_LEN`] bytes and are truncated with domain-separating tail bytes
/// so no (key, nonce) pair repeats within a round.
const AEAD_NONCE_LEN: usize = 12;

/// Plaintext block width; the pair id (or match flag) sits in byte 0 and the
/// remainder is zero padding, giving 32-byte ciphertexts with the tag.
const BLOCK_LEN: usize = 16;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum CipherError {
    #[error("aead seal/open failed")]
    Aead,
    #[error("decrypted match flag out of range: {0}")]
    UnexpectedOutput(u8),
}

/// Which half of the commitment a ciphertext belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Slot {
    A,
    B,
}

impl Slot {
    fn tag(self) -> u8 {
        match self {
            Slot::A => 0,
            Slot::B => 1,
        }
    }
}

/// Symmetric key derived once per round by x25519 key agreement between an
/// ephemeral player keypair and the compute environment's public key. Held in
/// memory only; never persisted alongside the encrypted board.
#[derive(Clone)]
pub struct SharedSecret([u8; 32]);

impl SharedSecret {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Derive the shared secret from one side's x25519 secret and the other
    /// side's public key. Both the player and the compute environment land on
    /// the same key.
    pub fn agree(secret: &StaticSecret, their_public: &[u8; 32]) -> Self {
        let their_public = X25519Public::from(*their_public);
        Self(secret.diffie_hellman(&their_public).to_bytes())
    }

    fn cipher(&self) -> ChaCha20Poly1305 {
        ChaCha20Poly1305::new(Key::from_slice(&self.0))
    }
}

impl std::fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SharedSecret(..)")
    }
}

/// The encrypted board: one ciphertext per card in each slot, aligned with
/// deck order, plus the material the compute environment needs to re-derive
/// the symmetric key.
#[derive(Clone, Debug)]
pub struct BoardCommitment {
    pub ephemeral_public_key: [u8; 32],
    pub board_nonce: [u8; NONCE_LEN],
    pub slot_a: Vec<[u8; CIPHERTEXT_LEN]>,
    pub slot_b: Vec<[u8; CIPHERTEXT_LEN]>,
}

impl BoardCommitment {
    /// Generate an ephemeral keypair, agree on a shared secret with the
    /// compute environment, and seal every card's pair id into both slots.
    ///
    /// Sealing the pair id (not the card id) is deliberate: it lets the
    /// verifier compare two decrypted values for equality without learning
    /// the deck layout.
    pub fn prepare<R: Rng + CryptoRng>(
        deck: &Deck,
        mxe_public_key: &[u8; 32],
        rng: &mut R,
    ) -> Result<(SharedSecret, Self), CipherError> {
        let ephemeral = StaticSecret::random_from_rng(&mut *rng);
        let ephemeral_public_key = X25519Public::from(&ephemeral).to_bytes();
        let shared = SharedSecret::agree(&ephemeral, mxe_public_key);

        let mut board_nonce = [0u8; NONCE_LEN];
        rng.fill(&mut board_nonce);

        let mut slot_a = Vec::with_capacity(deck.len());
        let mut slot_b = Vec::with_capacity(deck.len());
        for card in deck.cards() {
            slot_a.push(seal_card(&shared, &board_nonce, Slot::A, card.id, card.pair_id)?);
            slot_b.push(seal_card(&shared, &board_nonce, Slot::B, card.id, card.pair_id)?);
        }

        Ok((
            shared,
            Self {
                ephemeral_public_key,
                board_nonce,
                slot_a,
                slot_b,
            },
        ))
    }
}

/// AEAD nonce for one card ciphertext: board nonce prefix plus a slot tag and
/// the card index, so every (slot, card) position seals under a distinct nonce.
fn card_nonce(board_nonce: &[u8; NONCE_LEN], slot: Slot, index: u8) -> [u8; AEAD_NONCE_LEN] {
    let mut nonce = [0u8; AEAD_NONCE_LEN];
    nonce.copy_from_slice(&board_nonce[..AEAD_NONCE_LEN]);
    nonce[AEAD_NONCE_LEN - 2] = slot.tag();
    nonce[AEAD_NONCE_LEN - 1] = index;
    nonce
}

/// AEAD nonce for a match-flag ciphertext, taken from the request's fresh
/// turn nonce.
fn flag_nonce(turn_nonce: &[u8; NONCE_LEN]) -> [u8; AEAD_NONCE_LEN] {
    let mut nonce = [0u8; AEAD_NONCE_LEN];
    nonce.copy_from_slice(&turn_nonce[..AEAD_NONCE_LEN]);
    nonce
}

fn seal_block(
    secret: &SharedSecret,
    nonce: &[u8; AEAD_NONCE_LEN],
    value: u8,
) -> Result<[u8; CIPHERTEXT_LEN], CipherError> {
    let mut block = [0u8; BLOCK_LEN];
    block[0] = value;
    let cipher = secret.cipher();
    let sealed = cipher
        .encrypt(Nonce::from_slice(nonce), block.as_ref())
        .map_err(|_| CipherError::Aead)?;
    sealed.try_into().map_err(|_| CipherError::Aead)
}

fn open_block(
    secret: &SharedSecret,
    nonce: &[u8; AEAD_NONCE_LEN],
    sealed: &[u8; CIPHERTEXT_LEN],
) -> Result<u8, CipherError> {
    let cipher = secret.cipher();
    let block = cipher
        .decrypt(Nonce::from_slice(nonce), sealed.as_ref())
        .map_err(|_| CipherError::Aead)?;
    if block.len() != BLOCK_LEN {
        return Err(CipherError::Aead);
    }
    Ok(block[0])
}

/// Seal one card's pair id into the given slot.
pub fn seal_card(
    secret: &SharedSecret,
    board_nonce: &[u8; NONCE_LEN],
    slot: Slot,
    index: u8,
    pair_id: u8,
) -> Result<[u8; CIPHERTEXT_LEN], CipherError> {
    seal_block(secret, &card_nonce(board_nonce, slot, index), pair_id)
}

/// Open one card ciphertext. Used by the compute side of verification and by
/// round-trip tests; the player never needs it after sealing.
pub fn open_card(
    secret: &SharedSecret,
    board_nonce: &[u8; NONCE_LEN],
    slot: Slot,
    index: u8,
    sealed: &[u8; CIPHERTEXT_LEN],
) -> Result<u8, CipherError> {
    open_block(secret, &card_nonce(board_nonce, slot, index), sealed)
}

/// Seal the single-bit verification outcome under the request's turn nonce.
pub fn seal_match_flag(
    secret: &SharedSecret,
    turn_nonce: &[u8; NONCE_LEN],
    is_match: bool,
) -> Result<[u8; CIPHERTEXT_LEN], CipherError> {
    seal_block(secret, &flag_nonce(turn_nonce), is_match as u8)
}

/// Open a verification result. Any decrypted value outside {0, 1} is a
/// protocol violation, not coerced to a boolean.
pub fn open_match_flag(
    secret: &SharedSecret,
    sealed: &[u8; CIPHERTEXT_LEN],
    turn_nonce: &[u8; NONCE_LEN],
) -> Result<bool, CipherError> {
    match open_block(secret, &flag_nonce(turn_nonce), sealed)? {
        0 => Ok(false),
        1 => Ok(true),
        other => Err(CipherError::UnexpectedOutput(other)),
    }
}
