pub mod api;
mod codec;
pub mod commitment;
pub mod deck;
pub mod handles;
pub mod practice;
pub mod round;

pub use commitment::{BoardCommitment, CipherError, SharedSecret};
pub use deck::{Card, Deck};
pub use round::{Phase, RoundId, RoundSession, StorageHandle, TurnError};

/// Number of cards on the board.
pub const CARD_COUNT: usize = 16;

/// Number of distinct pair ids; each appears on exactly two cards.
pub const PAIR_COUNT: usize = CARD_COUNT / 2;

/// Width of wire nonces (board nonce, turn nonce).
pub const NONCE_LEN: usize = 16;

/// Width of one sealed card or match-flag ciphertext.
pub const CIPHERTEXT_LEN: usize = 32;
