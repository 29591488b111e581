//! Wire types exchanged with the ledger backend: submitted instructions,
//! emitted events, and query responses. Binary layouts are fixed so clients
//! in other languages can interoperate.

use crate::codec::{read_bytes, write_bytes};
use crate::round::RoundId;
use crate::{CARD_COUNT, CIPHERTEXT_LEN, NONCE_LEN};
use bytes::{Buf, BufMut};
use commonware_codec::{EncodeSize, Error, FixedSize, Read, ReadExt, Write};
use commonware_cryptography::ed25519::PublicKey;

/// Encoded size of one commitment slot (one ciphertext per card).
const SLOT_SIZE: usize = CARD_COUNT * CIPHERTEXT_LEN;

fn write_slot(slot: &[[u8; CIPHERTEXT_LEN]], writer: &mut impl BufMut) {
    for cipher in slot {
        write_bytes(cipher, writer);
    }
}

fn read_slot(reader: &mut impl Buf) -> Result<Vec<[u8; CIPHERTEXT_LEN]>, Error> {
    let mut slot = Vec::with_capacity(CARD_COUNT);
    for _ in 0..CARD_COUNT {
        slot.push(read_bytes(reader)?);
    }
    Ok(slot)
}

/// Instructions accepted by the round program.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Instruction {
    /// First half of the two-phase board commitment; creates the round
    /// account.
    /// Binary: [0] [player:32] [roundId:u64 BE] [slotA:16*32] [ephemeralPubkey:32] [boardNonce:16]
    RegisterRound {
        player: PublicKey,
        round_id: RoundId,
        slot_a: Vec<[u8; CIPHERTEXT_LEN]>,
        ephemeral_public_key: [u8; 32],
        board_nonce: [u8; NONCE_LEN],
    },

    /// Second half of the commitment; verification is rejected until this
    /// lands.
    /// Binary: [1] [player:32] [roundId:u64 BE] [slotB:16*32]
    SetRoundSlotB {
        player: PublicKey,
        round_id: RoundId,
        slot_b: Vec<[u8; CIPHERTEXT_LEN]>,
    },

    /// Queue one confidential pair check.
    /// Binary: [2] [player:32] [roundId:u64 BE] [cardA:u8] [cardB:u8] [offset:u64 BE] [turnNonce:16]
    VerifyPair {
        player: PublicKey,
        round_id: RoundId,
        card_a: u8,
        card_b: u8,
        computation_offset: u64,
        turn_nonce: [u8; NONCE_LEN],
    },

    /// Record the final tally for the round, exactly once.
    /// Binary: [3] [player:32] [roundId:u64 BE] [turns:u16 BE] [pairs:u8] [completed:u8]
    ///         [solveMs:u64 BE] [pointsDelta:i64 BE] [nonceHash:32]
    SettleRoundScore {
        player: PublicKey,
        round_id: RoundId,
        turns_used: u16,
        pairs_found: u8,
        completed: bool,
        solve_ms: u64,
        points_delta: i64,
        nonce_hash: [u8; 32],
    },
}

impl Instruction {
    pub fn round_id(&self) -> RoundId {
        match self {
            Self::RegisterRound { round_id, .. }
            | Self::SetRoundSlotB { round_id, .. }
            | Self::VerifyPair { round_id, .. }
            | Self::SettleRoundScore { round_id, .. } => *round_id,
        }
    }

    pub fn player(&self) -> &PublicKey {
        match self {
            Self::RegisterRound { player, .. }
            | Self::SetRoundSlotB { player, .. }
            | Self::VerifyPair { player, .. }
            | Self::SettleRoundScore { player, .. } => player,
        }
    }
}

impl Write for Instruction {
    fn write(&self, writer: &mut impl BufMut) {
        match self {
            Self::RegisterRound {
                player,
                round_id,
                slot_a,
                ephemeral_public_key,
                board_nonce,
            } => {
                0u8.write(writer);
                player.write(writer);
                round_id.write(writer);
                write_slot(slot_a, writer);
                write_bytes(ephemeral_public_key, writer);
                write_bytes(board_nonce, writer);
            }
            Self::SetRoundSlotB {
                player,
                round_id,
                slot_b,
            } => {
                1u8.write(writer);
                player.write(writer);
                round_id.write(writer);
                write_slot(slot_b, writer);
            }
            Self::VerifyPair {
                player,
                round_id,
                card_a,
                card_b,
                computation_offset,
                turn_nonce,
            } => {
                2u8.write(writer);
                player.write(writer);
                round_id.write(writer);
                card_a.write(writer);
                card_b.write(writer);
                computation_offset.write(writer);
                write_bytes(turn_nonce, writer);
            }
            Self::SettleRoundScore {
                player,
                round_id,
                turns_used,
                pairs_found,
                completed,
                solve_ms,
                points_delta,
                nonce_hash,
            } => {
                3u8.write(writer);
                player.write(writer);
                round_id.write(writer);
                turns_used.write(writer);
                pairs_found.write(writer);
                completed.write(writer);
                solve_ms.write(writer);
                points_delta.write(writer);
                write_bytes(nonce_hash, writer);
            }
        }
    }
}

impl Read for Instruction {
    type Cfg = ();

    fn read_cfg(reader: &mut impl Buf, _: &Self::Cfg) -> Result<Self, Error> {
        let tag = u8::read(reader)?;
        match tag {
            0 => Ok(Self::RegisterRound {
                player: PublicKey::read(reader)?,
                round_id: RoundId::read(reader)?,
                slot_a: read_slot(reader)?,
                ephemeral_public_key: read_bytes(reader)?,
                board_nonce: read_bytes(reader)?,
            }),
            1 => Ok(Self::SetRoundSlotB {
                player: PublicKey::read(reader)?,
                round_id: RoundId::read(reader)?,
                slot_b: read_slot(reader)?,
            }),
            2 => Ok(Self::VerifyPair {
                player: PublicKey::read(reader)?,
                round_id: RoundId::read(reader)?,
                card_a: u8::read(reader)?,
                card_b: u8::read(reader)?,
                computation_offset: u64::read(reader)?,
                turn_nonce: read_bytes(reader)?,
            }),
            3 => Ok(Self::SettleRoundScore {
                player: PublicKey::read(reader)?,
                round_id: RoundId::read(reader)?,
                turns_used: u16::read(reader)?,
                pairs_found: u8::read(reader)?,
                completed: bool::read(reader)?,
                solve_ms: u64::read(reader)?,
                points_delta: i64::read(reader)?,
                nonce_hash: read_bytes(reader)?,
            }),
            i => Err(Error::InvalidEnum(i)),
        }
    }
}

impl EncodeSize for Instruction {
    fn encode_size(&self) -> usize {
        1 + PublicKey::SIZE
            + RoundId::SIZE
            + match self {
                Self::RegisterRound { .. } => SLOT_SIZE + 32 + NONCE_LEN,
                Self::SetRoundSlotB { .. } => SLOT_SIZE,
                Self::VerifyPair { .. } => 1 + 1 + 8 + NONCE_LEN,
                Self::SettleRoundScore { .. } => 2 + 1 + 1 + 8 + 8 + 32,
            }
    }
}

/// Events emitted by the round program.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Event {
    /// One pair check resolved; the outcome is sealed to the player.
    /// Counters are the server-side values at emission time.
    PairVerified {
        player: PublicKey,
        round_id: RoundId,
        turns_used: u16,
        pairs_found: u8,
        is_match_cipher: [u8; CIPHERTEXT_LEN],
        nonce: [u8; NONCE_LEN],
    },

    /// The round's final tally was recorded.
    RoundSettled {
        player: PublicKey,
        round_id: RoundId,
        turns_used: u16,
        pairs_found: u8,
        completed: bool,
        solve_ms: u64,
        points_delta: i64,
        nonce_hash: [u8; 32],
    },
}

impl Event {
    pub fn round_id(&self) -> RoundId {
        match self {
            Self::PairVerified { round_id, .. } | Self::RoundSettled { round_id, .. } => *round_id,
        }
    }
}

impl Write for Event {
    fn write(&self, writer: &mut impl BufMut) {
        match self {
            Self::PairVerified {
                player,
                round_id,
                turns_used,
                pairs_found,
                is_match_cipher,
                nonce,
            } => {
                0u8.write(writer);
                player.write(writer);
                round_id.write(writer);
                turns_used.write(writer);
                pairs_found.write(writer);
                write_bytes(is_match_cipher, writer);
                write_bytes(nonce, writer);
            }
            Self::RoundSettled {
                player,
                round_id,
                turns_used,
                pairs_found,
                completed,
                solve_ms,
                points_delta,
                nonce_hash,
            } => {
                1u8.write(writer);
                player.write(writer);
                round_id.write(writer);
                turns_used.write(writer);
                pairs_found.write(writer);
                completed.write(writer);
                solve_ms.write(writer);
                points_delta.write(writer);
                write_bytes(nonce_hash, writer);
            }
        }
    }
}

impl Read for Event {
    type Cfg = ();

    fn read_cfg(reader: &mut impl Buf, _: &Self::Cfg) -> Result<Self, Error> {
        let tag = u8::read(reader)?;
        match tag {
            0 => Ok(Self::PairVerified {
                player: PublicKey::read(reader)?,
                round_id: RoundId::read(reader)?,
                turns_used: u16::read(reader)?,
                pairs_found: u8::read(reader)?,
                is_match_cipher: read_bytes(reader)?,
                nonce: read_bytes(reader)?,
            }),
            1 => Ok(Self::RoundSettled {
                player: PublicKey::read(reader)?,
                round_id: RoundId::read(reader)?,
                turns_used: u16::read(reader)?,
                pairs_found: u8::read(reader)?,
                completed: bool::read(reader)?,
                solve_ms: u64::read(reader)?,
                points_delta: i64::read(reader)?,
                nonce_hash: read_bytes(reader)?,
            }),
            i => Err(Error::InvalidEnum(i)),
        }
    }
}

impl EncodeSize for Event {
    fn encode_size(&self) -> usize {
        1 + PublicKey::SIZE
            + RoundId::SIZE
            + match self {
                Self::PairVerified { .. } => 2 + 1 + CIPHERTEXT_LEN + NONCE_LEN,
                Self::RoundSettled { .. } => 2 + 1 + 1 + 8 + 8 + 32,
            }
    }
}

/// Snapshot of a round account as stored by the program.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RoundStateView {
    pub player: PublicKey,
    pub round_id: RoundId,
    pub turns_used: u16,
    pub pairs_found: u8,
    pub completed: bool,
    pub slot_b_present: bool,
}

impl Write for RoundStateView {
    fn write(&self, writer: &mut impl BufMut) {
        self.player.write(writer);
        self.round_id.write(writer);
        self.turns_used.write(writer);
        self.pairs_found.write(writer);
        self.completed.write(writer);
        self.slot_b_present.write(writer);
    }
}

impl Read for RoundStateView {
    type Cfg = ();

    fn read_cfg(reader: &mut impl Buf, _: &Self::Cfg) -> Result<Self, Error> {
        Ok(Self {
            player: PublicKey::read(reader)?,
            round_id: RoundId::read(reader)?,
            turns_used: u16::read(reader)?,
            pairs_found: u8::read(reader)?,
            completed: bool::read(reader)?,
            slot_b_present: bool::read(reader)?,
        })
    }
}

impl FixedSize for RoundStateView {
    const SIZE: usize = PublicKey::SIZE + RoundId::SIZE + 2 + 1 + 1 + 1;
}

/// Finalization state of one queued computation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum TxStatus {
    Pending = 0,
    Finalized = 1,
    Aborted = 2,
}

impl Write for TxStatus {
    fn write(&self, writer: &mut impl BufMut) {
        (*self as u8).write(writer);
    }
}

impl Read for TxStatus {
    type Cfg = ();

    fn read_cfg(reader: &mut impl Buf, _: &Self::Cfg) -> Result<Self, Error> {
        match u8::read(reader)? {
            0 => Ok(Self::Pending),
            1 => Ok(Self::Finalized),
            2 => Ok(Self::Aborted),
            i => Err(Error::InvalidEnum(i)),
        }
    }
}

impl FixedSize for TxStatus {
    const SIZE: usize = 1;
}
