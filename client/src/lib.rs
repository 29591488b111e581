pub mod client;
pub mod coordinator;
pub mod events;
pub mod resolve;

pub use client::Client;
pub use client::{FinalizationOutcome, RetryPolicy};
pub use coordinator::{Coordinator, CoordinatorConfig};
pub use events::Stream;
pub use resolve::RetrySchedule;

use thiserror::Error;
use veilmatch_types::{CipherError, RoundId, TurnError};

/// Error type for client operations.
#[derive(Error, Debug)]
pub enum Error {
    #[error("reqwest error: {0}")]
    Reqwest(#[from] reqwest::Error),
    #[error("tungstenite error: {0}")]
    Tungstenite(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("failed: {0}")]
    Failed(reqwest::StatusCode),
    #[error("failed: {status}: {body}")]
    FailedWithBody {
        status: reqwest::StatusCode,
        body: String,
    },
    #[error("invalid data: {0}")]
    InvalidData(#[from] commonware_codec::Error),
    #[error("unexpected response")]
    UnexpectedResponse,
    #[error("connection closed")]
    ConnectionClosed,
    #[error("URL parse error: {0}")]
    Url(#[from] url::ParseError),
    #[error("invalid URL scheme: {0} (expected http or https)")]
    InvalidScheme(String),
    #[error("invalid deck size: {got} cards")]
    InvalidDeckSize { got: usize },
    #[error("invalid turn: {0}")]
    InvalidTurn(#[from] TurnError),
    #[error("compute key unavailable after {attempts} attempts ({elapsed_ms}ms)")]
    KeyAgreementUnavailable { attempts: u32, elapsed_ms: u64 },
    #[error("registration rejected for round {round_id}: {cause}")]
    RegistrationRejected { round_id: RoundId, cause: String },
    #[error(
        "verification request for round {round_id} (offset {computation_offset}) failed: {cause}"
    )]
    RequestSubmissionFailed {
        round_id: RoundId,
        computation_offset: u64,
        cause: String,
    },
    #[error(
        "verification for round {round_id} (offset {computation_offset}) timed out after {elapsed_ms}ms"
    )]
    VerificationTimedOut {
        round_id: RoundId,
        computation_offset: u64,
        elapsed_ms: u64,
    },
    #[error("verification for round {round_id} (offset {computation_offset}) was aborted")]
    ComputationAborted {
        round_id: RoundId,
        computation_offset: u64,
    },
    #[error("cipher failure: {0}")]
    Cipher(#[from] CipherError),
    #[error("settlement failed for round {round_id}: {cause}")]
    SettlementFailed { round_id: RoundId, cause: String },
}

/// Result type for client operations.
pub type Result<T> = std::result::Result<T, Error>;
