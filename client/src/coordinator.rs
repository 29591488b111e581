//! Round lifecycle coordination: registration, turn verification, and
//! settlement against the backend.
//!
//! Verification results arrive asynchronously. The coordinator subscribes to
//! the round's event stream before submitting each request, then races three
//! outcomes: the event arriving, the computation's status resolving without a
//! delivered event (recovered by scanning the round's and the request's
//! logs), and a deadline.

use crate::client::Client;
use crate::resolve::{resolve_with_retry, RetrySchedule};
use crate::{Error, Result};
use commonware_cryptography::ed25519::PublicKey;
use rand::{CryptoRng, Rng};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use veilmatch_types::api::{Event, Instruction, TxStatus};
use veilmatch_types::commitment::{open_match_flag, BoardCommitment};
use veilmatch_types::round::{derive_computation_handle, derive_storage_handle};
use veilmatch_types::{
    Deck, Phase, RoundId, RoundSession, CARD_COUNT, CIPHERTEXT_LEN, NONCE_LEN,
};

#[derive(Clone, Debug)]
pub struct CoordinatorConfig {
    /// How long a submitted verification may stay unresolved before the turn
    /// is abandoned.
    pub verification_timeout: Duration,
    /// How long to keep watching for finalization after a result has already
    /// been applied.
    pub finalization_timeout: Duration,
    /// Schedule for resolving the compute environment's public key.
    pub key_resolution: RetrySchedule,
    /// How many recent log entries to scan when recovering a missed event.
    pub log_lookback: usize,
    /// Interval between computation status polls.
    pub poll_interval: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            verification_timeout: Duration::from_secs(45),
            finalization_timeout: Duration::from_secs(45),
            key_resolution: RetrySchedule::default(),
            log_lookback: 30,
            poll_interval: Duration::from_secs(1),
        }
    }
}

/// Drives rounds for one player against one backend.
pub struct Coordinator {
    client: Arc<Client>,
    config: CoordinatorConfig,
    program_id: [u8; 32],
    player: PublicKey,
    /// Anti-replay markers for settlements that have been generated but not
    /// yet accepted; entries are dropped once the backend takes them.
    pending_settlements: Mutex<HashMap<u64, [u8; 32]>>,
}

impl Coordinator {
    pub fn new(
        client: Arc<Client>,
        program_id: [u8; 32],
        player: PublicKey,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            client,
            config,
            program_id,
            player,
            pending_settlements: Mutex::new(HashMap::new()),
        }
    }

    /// Register a new round: agree on a key with the compute environment,
    /// seal the board, and submit the commitment in its two phases.
    pub async fn register_round<R: Rng + CryptoRng>(
        &self,
        deck: Deck,
        rng: &mut R,
    ) -> Result<RoundSession> {
        if deck.len() != CARD_COUNT {
            return Err(Error::InvalidDeckSize { got: deck.len() });
        }

        let started = Instant::now();
        let client = &self.client;
        let mxe_key = resolve_with_retry(&self.config.key_resolution, "mxe public key", || {
            client.mxe_public_key()
        })
        .await?;
        let Some(mxe_key) = mxe_key else {
            return Err(Error::KeyAgreementUnavailable {
                attempts: self.config.key_resolution.attempts,
                elapsed_ms: started.elapsed().as_millis() as u64,
            });
        };

        let round_id = RoundId::generate(rng);
        let storage_handle = derive_storage_handle(&self.program_id, &self.player, round_id);
        let (shared_secret, commitment) = BoardCommitment::prepare(&deck, &mxe_key, rng)?;
        let BoardCommitment {
            ephemeral_public_key,
            board_nonce,
            slot_a,
            slot_b,
        } = commitment;

        // Phase one creates the round; the board is not playable until
        // phase two lands.
        self.client
            .submit(&Instruction::RegisterRound {
                player: self.player.clone(),
                round_id,
                slot_a,
                ephemeral_public_key,
                board_nonce,
            })
            .await
            .map_err(|cause| Error::RegistrationRejected {
                round_id,
                cause: cause.to_string(),
            })?;
        self.client
            .submit(&Instruction::SetRoundSlotB {
                player: self.player.clone(),
                round_id,
                slot_b,
            })
            .await
            .map_err(|cause| Error::RegistrationRejected {
                round_id,
                cause: cause.to_string(),
            })?;

        info!(%round_id, handle = %storage_handle, "round registered");
        Ok(RoundSession::new(
            round_id,
            self.player.clone(),
            storage_handle,
            shared_secret,
            deck,
        ))
    }

    /// Submit one pair-verification request and wait for its result, applying
    /// the outcome to the session.
    pub async fn verify_pair<R: Rng + CryptoRng>(
        &self,
        session: &mut RoundSession,
        card_a: u8,
        card_b: u8,
        rng: &mut R,
    ) -> Result<bool> {
        session.validate_turn(card_a, card_b)?;

        let computation_offset: u64 = rng.gen();
        let mut turn_nonce = [0u8; NONCE_LEN];
        rng.fill(&mut turn_nonce);

        // Subscribe before submitting so the result cannot slip between
        // submission and subscription.
        let mut events = self.client.connect_events(session.id).await?;

        self.client
            .submit(&Instruction::VerifyPair {
                player: session.player.clone(),
                round_id: session.id,
                card_a,
                card_b,
                computation_offset,
                turn_nonce,
            })
            .await
            .map_err(|cause| Error::RequestSubmissionFailed {
                round_id: session.id,
                computation_offset,
                cause: cause.to_string(),
            })?;

        let started = Instant::now();
        let deadline = tokio::time::sleep(self.config.verification_timeout);
        tokio::pin!(deadline);
        let mut poll = tokio::time::interval(self.config.poll_interval);
        let mut stream_open = true;

        let cipher = loop {
            tokio::select! {
                event = events.next(), if stream_open => {
                    match event {
                        Some(Ok(event)) => {
                            if let Some(cipher) =
                                Self::matches_turn(&event, session.id, &turn_nonce)
                            {
                                break cipher;
                            }
                            // Stale or foreign result; keep waiting.
                        }
                        Some(Err(err)) => {
                            debug!(error = %err, "event stream error; relying on polling");
                            stream_open = false;
                        }
                        None => {
                            debug!("event stream ended; relying on polling");
                            stream_open = false;
                        }
                    }
                }
                _ = poll.tick() => {
                    match self.client.computation_status(computation_offset).await {
                        Ok(Some(TxStatus::Aborted)) => {
                            return Err(Error::ComputationAborted {
                                round_id: session.id,
                                computation_offset,
                            });
                        }
                        Ok(Some(TxStatus::Finalized)) => {
                            // The event may never have been delivered;
                            // recover the result from the logs.
                            if let Some(cipher) = self
                                .recover_from_log(session, computation_offset, &turn_nonce)
                                .await?
                            {
                                break cipher;
                            }
                        }
                        Ok(_) => {}
                        Err(err) => debug!(error = %err, "status poll failed"),
                    }
                }
                _ = &mut deadline => {
                    // One last scan before declaring the turn lost.
                    if let Some(cipher) = self
                        .recover_from_log(session, computation_offset, &turn_nonce)
                        .await?
                    {
                        break cipher;
                    }
                    return Err(Error::VerificationTimedOut {
                        round_id: session.id,
                        computation_offset,
                        elapsed_ms: started.elapsed().as_millis() as u64,
                    });
                }
            }
        };

        let is_match = open_match_flag(session.shared_secret(), &cipher, &turn_nonce)?;
        session.apply_turn(card_a, card_b, is_match);
        self.spawn_finalization_watch(session.id, computation_offset);
        debug!(
            round_id = %session.id,
            card_a,
            card_b,
            is_match,
            turns_used = session.turns_used,
            pairs_found = session.pairs_found,
            "turn resolved"
        );
        Ok(is_match)
    }

    /// Record the round's final tally. Safe to call more than once: a tally
    /// already submitted is a no-op, and a failed attempt reuses the same
    /// anti-replay marker on retry.
    pub async fn settle_round<R: Rng + CryptoRng>(
        &self,
        session: &mut RoundSession,
        solve_ms: u64,
        points_delta: i64,
        rng: &mut R,
    ) -> Result<()> {
        if session.settled {
            debug!(round_id = %session.id, "settlement already submitted; ignoring duplicate");
            return Ok(());
        }
        let completed = session.phase == Phase::Won;
        // The marker is fresh randomness, not a digest of the round's
        // inputs, so no two settlements can ever carry the same one.
        let nonce_hash = {
            let mut pending = self.pending_settlements.lock().await;
            *pending.entry(session.id.0).or_insert_with(|| rng.gen())
        };

        let instruction = Instruction::SettleRoundScore {
            player: session.player.clone(),
            round_id: session.id,
            turns_used: session.turns_used,
            pairs_found: session.pairs_found,
            completed,
            solve_ms,
            points_delta,
            nonce_hash,
        };
        match self.client.submit(&instruction).await {
            Ok(()) => {
                session.settled = true;
                self.pending_settlements.lock().await.remove(&session.id.0);
                info!(round_id = %session.id, completed, points_delta, "round settled");
                Ok(())
            }
            Err(cause) => Err(Error::SettlementFailed {
                round_id: session.id,
                cause: cause.to_string(),
            }),
        }
    }

    /// Extract this turn's sealed outcome from an event, ignoring results for
    /// other rounds or other turns.
    fn matches_turn(
        event: &Event,
        round_id: RoundId,
        turn_nonce: &[u8; NONCE_LEN],
    ) -> Option<[u8; CIPHERTEXT_LEN]> {
        match event {
            Event::PairVerified {
                round_id: event_round,
                nonce,
                is_match_cipher,
                ..
            } if *event_round == round_id && nonce == turn_nonce => Some(*is_match_cipher),
            _ => None,
        }
    }

    /// Scan the round's log and the request's computation log for the turn's
    /// outcome. The round log fills with every later turn; the computation
    /// log only ever holds this request's entry, so a turn pushed out of the
    /// round log's lookback window is still recoverable.
    async fn recover_from_log(
        &self,
        session: &RoundSession,
        computation_offset: u64,
        turn_nonce: &[u8; NONCE_LEN],
    ) -> Result<Option<[u8; CIPHERTEXT_LEN]>> {
        let round_events = self
            .client
            .scan_log(&session.storage_handle, self.config.log_lookback)
            .await?;
        let computation_handle = derive_computation_handle(&self.program_id, computation_offset);
        let computation_events = self
            .client
            .scan_log(&computation_handle, self.config.log_lookback)
            .await?;
        Ok(Self::find_turn(
            &round_events,
            &computation_events,
            session.id,
            turn_nonce,
        ))
    }

    /// Newest-first search across both logs. The same entry may appear under
    /// both handles; the first hit wins.
    fn find_turn(
        round_events: &[Event],
        computation_events: &[Event],
        round_id: RoundId,
        turn_nonce: &[u8; NONCE_LEN],
    ) -> Option<[u8; CIPHERTEXT_LEN]> {
        computation_events
            .iter()
            .rev()
            .chain(round_events.iter().rev())
            .find_map(|event| Self::matches_turn(event, round_id, turn_nonce))
    }

    /// Keep watching the computation after its result has been applied, so a
    /// late abort is at least surfaced in the logs.
    fn spawn_finalization_watch(&self, round_id: RoundId, computation_offset: u64) {
        let client = self.client.clone();
        let timeout = self.config.finalization_timeout;
        let interval = self.config.poll_interval;
        tokio::spawn(async move {
            let outcome = client
                .await_finalization(computation_offset, timeout, interval)
                .await;
            if outcome.timed_out {
                warn!(%round_id, computation_offset, "gave up waiting for finalization");
            } else if !outcome.ok {
                warn!(
                    %round_id,
                    computation_offset,
                    "verification aborted after its result was applied"
                );
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use commonware_cryptography::{ed25519::PrivateKey, Signer};
    use commonware_math::algebra::Random;
    use rand::{rngs::StdRng, SeedableRng};

    fn player() -> PublicKey {
        PrivateKey::random(&mut StdRng::seed_from_u64(0)).public_key()
    }

    fn verified(round_id: RoundId, nonce: [u8; NONCE_LEN], cipher: u8) -> Event {
        Event::PairVerified {
            player: player(),
            round_id,
            turns_used: 1,
            pairs_found: 0,
            is_match_cipher: [cipher; CIPHERTEXT_LEN],
            nonce,
        }
    }

    #[test]
    fn stale_results_are_ignored() {
        let round = RoundId(7);
        let nonce = [1u8; NONCE_LEN];

        // The matching event is accepted.
        let event = verified(round, nonce, 9);
        assert_eq!(
            Coordinator::matches_turn(&event, round, &nonce),
            Some([9u8; CIPHERTEXT_LEN])
        );

        // Same round, different turn nonce: a stale retry of an earlier turn.
        let stale = verified(round, [2u8; NONCE_LEN], 9);
        assert_eq!(Coordinator::matches_turn(&stale, round, &nonce), None);

        // Different round entirely.
        let foreign = verified(RoundId(8), nonce, 9);
        assert_eq!(Coordinator::matches_turn(&foreign, round, &nonce), None);

        // Settlement events never resolve a turn.
        let settled = Event::RoundSettled {
            player: player(),
            round_id: round,
            turns_used: 1,
            pairs_found: 0,
            completed: false,
            solve_ms: 1,
            points_delta: 0,
            nonce_hash: [0u8; 32],
        };
        assert_eq!(Coordinator::matches_turn(&settled, round, &nonce), None);
    }

    #[test]
    fn recovery_falls_back_to_the_computation_log() {
        let round = RoundId(7);
        let nonce = [3u8; NONCE_LEN];

        // Later turns have pushed this one out of the round log's window;
        // only the per-request log still holds the outcome.
        let round_events = vec![
            verified(round, [4u8; NONCE_LEN], 1),
            verified(round, [5u8; NONCE_LEN], 2),
        ];
        let computation_events = vec![verified(round, nonce, 9)];
        assert_eq!(
            Coordinator::find_turn(&round_events, &computation_events, round, &nonce),
            Some([9u8; CIPHERTEXT_LEN])
        );

        // Nothing to recover when neither log holds the turn.
        assert_eq!(
            Coordinator::find_turn(&round_events, &[], round, &nonce),
            None
        );

        // The entry appearing under both handles resolves to the same value.
        assert_eq!(
            Coordinator::find_turn(&computation_events, &computation_events, round, &nonce),
            Some([9u8; CIPHERTEXT_LEN])
        );
    }
}
