//! Offline practice mode: the same turn-accounting state machine as an
//! on-ledger round, with match resolution done synchronously against the
//! plaintext deck instead of through confidential verification.

use crate::deck::Deck;
use crate::round::{Phase, TurnError};
use crate::PAIR_COUNT;
use std::time::Duration;

/// Default time budget for a practice round.
pub const PRACTICE_TIME_BUDGET: Duration = Duration::from_secs(120);

pub struct PracticeRound {
    deck: Deck,
    pub turns_used: u16,
    pub pairs_found: u8,
    pub phase: Phase,
    elapsed: Duration,
    budget: Duration,
}

impl PracticeRound {
    pub fn new(deck: Deck) -> Self {
        Self::with_budget(deck, PRACTICE_TIME_BUDGET)
    }

    pub fn with_budget(deck: Deck, budget: Duration) -> Self {
        Self {
            deck,
            turns_used: 0,
            pairs_found: 0,
            phase: Phase::Playing,
            elapsed: Duration::ZERO,
            budget,
        }
    }

    pub fn deck(&self) -> &Deck {
        &self.deck
    }

    /// Resolve one two-card turn locally.
    pub fn flip_pair(&mut self, card_a: u8, card_b: u8) -> Result<bool, TurnError> {
        if self.phase != Phase::Playing {
            return Err(TurnError::RoundOver(self.phase));
        }
        if card_a == card_b {
            return Err(TurnError::SameCard(card_a));
        }
        let mut pair_ids = [0u8; 2];
        for (slot, index) in [card_a, card_b].into_iter().enumerate() {
            let card = self
                .deck
                .card(index)
                .ok_or(TurnError::OutOfRange(index))?;
            if card.matched {
                return Err(TurnError::AlreadyMatched(index));
            }
            pair_ids[slot] = card.pair_id;
        }

        let is_match = pair_ids[0] == pair_ids[1];
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
        Ok(is_match)
    }

    /// Advance the practice clock; an exhausted budget times the round out.
    pub fn tick(&mut self, dt: Duration) {
        self.elapsed += dt;
        if self.phase == Phase::Playing && self.elapsed >= self.budget {
            self.phase = Phase::TimedOut;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn example_deck() -> Deck {
        Deck::from_pair_ids(vec![0, 1, 0, 1, 2, 2, 3, 3, 4, 4, 5, 5, 6, 6, 7, 7])
    }

    #[test]
    fn example_scenario() {
        let mut round = PracticeRound::new(example_deck());

        // Cards 0 and 2 both carry pair id 0.
        assert_eq!(round.flip_pair(0, 2), Ok(true));
        assert_eq!(round.turns_used, 1);
        assert_eq!(round.pairs_found, 1);

        // Card 0 is matched now, so reselecting it is rejected.
        assert_eq!(round.flip_pair(0, 1), Err(TurnError::AlreadyMatched(0)));

        // Cards 1 and 3 carry pair ids 1 and 1.
        assert_eq!(round.flip_pair(1, 3), Ok(true));
        // Cards 4 and 6 carry pair ids 2 and 3.
        assert_eq!(round.flip_pair(4, 6), Ok(false));
        assert_eq!(round.turns_used, 3);
        assert_eq!(round.pairs_found, 2);
    }

    #[test]
    fn mismatch_keeps_counters_consistent() {
        let mut round = PracticeRound::new(example_deck());
        assert_eq!(round.flip_pair(0, 1), Ok(false));
        assert_eq!(round.turns_used, 1);
        assert_eq!(round.pairs_found, 0);
        assert!(!round.deck().card(0).unwrap().revealed);
    }

    #[test]
    fn full_clear_wins() {
        let mut round = PracticeRound::new(example_deck());
        let pairs = [(0, 2), (1, 3), (4, 5), (6, 7), (8, 9), (10, 11), (12, 13), (14, 15)];
        for (a, b) in pairs {
            assert_eq!(round.flip_pair(a, b), Ok(true));
        }
        assert_eq!(round.phase, Phase::Won);
        assert_eq!(
            round.flip_pair(0, 1),
            Err(TurnError::RoundOver(Phase::Won))
        );
    }

    #[test]
    fn budget_exhaustion_times_out() {
        let mut round =
            PracticeRound::with_budget(example_deck(), Duration::from_secs(30));
        round.tick(Duration::from_secs(29));
        assert_eq!(round.phase, Phase::Playing);
        round.tick(Duration::from_secs(1));
        assert_eq!(round.phase, Phase::TimedOut);
        assert_eq!(
            round.flip_pair(0, 2),
            Err(TurnError::RoundOver(Phase::TimedOut))
        );
    }
}
