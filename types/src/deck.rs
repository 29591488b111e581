use crate::{CARD_COUNT, PAIR_COUNT};
use rand::seq::SliceRandom;
use rand::Rng;

/// One card on the board. Owned exclusively by the deck; card ids are the
/// positions in presentation order, pair ids are the hidden symbol identity.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Card {
    pub id: u8,
    pub pair_id: u8,
    pub revealed: bool,
    pub matched: bool,
}

/// An ordered board of cards. Every pair id in `[0, PAIR_COUNT)` appears on
/// exactly two cards when built via [`Deck::shuffled`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Deck {
    cards: Vec<Card>,
}

impl Deck {
    /// Build a uniformly shuffled deck from the supplied random source.
    /// Tests inject a seeded RNG; production uses the system RNG.
    pub fn shuffled<R: Rng>(rng: &mut R) -> Self {
        let mut pair_ids: Vec<u8> = (0..PAIR_COUNT as u8).flat_map(|p| [p, p]).collect();
        pair_ids.shuffle(rng);
        Self::from_pair_ids(pair_ids)
    }

    /// Build a deck with an explicit layout. Length is validated at
    /// registration, not here, so tests can construct malformed boards.
    pub fn from_pair_ids(pair_ids: Vec<u8>) -> Self {
        let cards = pair_ids
            .into_iter()
            .enumerate()
            .map(|(id, pair_id)| Card {
                id: id as u8,
                pair_id,
                revealed: false,
                matched: false,
            })
            .collect();
        Self { cards }
    }

    pub fn len(&self) -> usize {
        self.cards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cards.is_empty()
    }

    pub fn card(&self, index: u8) -> Option<&Card> {
        self.cards.get(index as usize)
    }

    pub fn cards(&self) -> &[Card] {
        &self.cards
    }

    pub fn pair_ids(&self) -> Vec<u8> {
        self.cards.iter().map(|c| c.pair_id).collect()
    }

    pub(crate) fn card_mut(&mut self, index: u8) -> Option<&mut Card> {
        self.cards.get_mut(index as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, SeedableRng};

    #[test]
    fn shuffled_deck_has_every_pair_twice() {
        for seed in 0..32u64 {
            let mut rng = StdRng::seed_from_u64(seed);
            let deck = Deck::shuffled(&mut rng);
            assert_eq!(deck.len(), CARD_COUNT);
            for pair in 0..PAIR_COUNT as u8 {
                let count = deck.cards().iter().filter(|c| c.pair_id == pair).count();
                assert_eq!(count, 2, "pair {pair} appeared {count} times (seed {seed})");
            }
        }
    }

    #[test]
    fn shuffled_deck_assigns_sequential_ids() {
        let mut rng = StdRng::seed_from_u64(7);
        let deck = Deck::shuffled(&mut rng);
        for (i, card) in deck.cards().iter().enumerate() {
            assert_eq!(card.id as usize, i);
            assert!(!card.revealed);
            assert!(!card.matched);
        }
    }

    #[test]
    fn same_seed_same_deck() {
        let a = Deck::shuffled(&mut StdRng::seed_from_u64(42));
        let b = Deck::shuffled(&mut StdRng::seed_from_u64(42));
        assert_eq!(a, b);
    }
}
