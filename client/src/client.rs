use crate::events::Stream;
use crate::{Error, Result};
use bytes::Bytes;
use commonware_codec::{Encode, ReadExt};
use reqwest::StatusCode;
use std::time::{Duration, Instant};
use tokio_tungstenite::connect_async;
use tracing::{debug, warn};
use url::Url;
use veilmatch_types::api::{Event, Instruction, RoundStateView, TxStatus};
use veilmatch_types::{RoundId, StorageHandle};

/// Retry behavior for HTTP requests.
#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// POSTs are not idempotent; only retry them when explicitly enabled.
    pub retry_non_idempotent: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(2),
            retry_non_idempotent: false,
        }
    }
}

/// Outcome of waiting for a queued computation to finalize.
#[derive(Clone, Copy, Debug)]
pub struct FinalizationOutcome {
    pub ok: bool,
    pub timed_out: bool,
    /// Last status observed, `None` if the computation was never seen.
    pub status: Option<TxStatus>,
}

/// HTTP/WebSocket transport to one backend.
pub struct Client {
    pub base_url: Url,
    http: reqwest::Client,
    retry: RetryPolicy,
}

fn retryable(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

impl Client {
    pub fn new(base_url: &str) -> Result<Self> {
        let mut base_url = Url::parse(base_url)?;
        match base_url.scheme() {
            "http" | "https" => {}
            scheme => return Err(Error::InvalidScheme(scheme.to_string())),
        }
        // Trailing slash so join() appends instead of replacing the last
        // path segment.
        if !base_url.path().ends_with('/') {
            base_url.set_path(&format!("{}/", base_url.path()));
        }
        Ok(Self {
            base_url,
            http: reqwest::Client::new(),
            retry: RetryPolicy::default(),
        })
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    async fn backoff(&self, attempt: u32) {
        let exp = self
            .retry
            .initial_backoff
            .saturating_mul(1u32 << attempt.min(16));
        tokio::time::sleep(exp.min(self.retry.max_backoff)).await;
    }

    /// GET with retries on 429 and 5xx responses.
    pub async fn get_with_retry(&self, url: Url) -> Result<reqwest::Response> {
        let mut attempt = 0;
        loop {
            let response = self.http.get(url.clone()).send().await;
            match response {
                Ok(response) if !retryable(response.status()) => return Ok(response),
                Ok(response) => {
                    if attempt + 1 >= self.retry.max_attempts {
                        return Ok(response);
                    }
                    debug!(%url, status = %response.status(), attempt, "retrying GET");
                }
                Err(err) => {
                    if attempt + 1 >= self.retry.max_attempts {
                        return Err(err.into());
                    }
                    debug!(%url, error = %err, attempt, "retrying GET after transport error");
                }
            }
            self.backoff(attempt).await;
            attempt += 1;
        }
    }

    /// POST bytes, retrying only when the policy allows retrying
    /// non-idempotent requests.
    pub async fn post_bytes_with_retry(&self, url: Url, body: Bytes) -> Result<reqwest::Response> {
        let mut attempt = 0;
        loop {
            let response = self.http.post(url.clone()).body(body.clone()).send().await;
            match response {
                Ok(response) if !retryable(response.status()) => return Ok(response),
                Ok(response) => {
                    if !self.retry.retry_non_idempotent || attempt + 1 >= self.retry.max_attempts {
                        let status = response.status();
                        let detail = response.text().await.unwrap_or_default();
                        return Err(Error::FailedWithBody {
                            status,
                            body: format!("POST {url}: {detail}"),
                        });
                    }
                    warn!(%url, status = %response.status(), attempt, "retrying POST");
                }
                Err(err) => {
                    if !self.retry.retry_non_idempotent || attempt + 1 >= self.retry.max_attempts {
                        return Err(err.into());
                    }
                    warn!(%url, error = %err, attempt, "retrying POST after transport error");
                }
            }
            self.backoff(attempt).await;
            attempt += 1;
        }
    }

    /// Submit one instruction to the backend.
    pub async fn submit(&self, instruction: &Instruction) -> Result<()> {
        let url = self.base_url.join("submit")?;
        let body = Bytes::from(instruction.encode().to_vec());
        let response = self.post_bytes_with_retry(url, body).await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::FailedWithBody { status, body });
        }
        Ok(())
    }

    /// Fetch the compute environment's x25519 public key. `None` while the
    /// environment has not published one yet.
    pub async fn mxe_public_key(&self) -> Result<Option<[u8; 32]>> {
        let url = self.base_url.join("mxe")?;
        let response = self.get_with_retry(url).await?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => {
                let bytes = response.bytes().await?;
                let key: [u8; 32] = bytes
                    .as_ref()
                    .try_into()
                    .map_err(|_| Error::UnexpectedResponse)?;
                Ok(Some(key))
            }
            status => Err(Error::Failed(status)),
        }
    }

    /// Fetch the stored state of one round, if the account exists.
    pub async fn query_round(&self, handle: &StorageHandle) -> Result<Option<RoundStateView>> {
        let url = self.base_url.join(&format!("round/{}", handle.to_hex()))?;
        let response = self.get_with_retry(url).await?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => {
                let bytes = response.bytes().await?;
                let view = RoundStateView::read(&mut bytes.as_ref())?;
                Ok(Some(view))
            }
            status => Err(Error::Failed(status)),
        }
    }

    /// Fetch the finalization status of one queued computation.
    pub async fn computation_status(&self, computation_offset: u64) -> Result<Option<TxStatus>> {
        let url = self
            .base_url
            .join(&format!("computation/{computation_offset}/status"))?;
        let response = self.get_with_retry(url).await?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => {
                let bytes = response.bytes().await?;
                let status = TxStatus::read(&mut bytes.as_ref())?;
                Ok(Some(status))
            }
            status => Err(Error::Failed(status)),
        }
    }

    /// Poll a computation until it reaches a terminal status or the timeout
    /// elapses. Transport errors are swallowed and retried on the next poll.
    pub async fn await_finalization(
        &self,
        computation_offset: u64,
        timeout: Duration,
        poll_interval: Duration,
    ) -> FinalizationOutcome {
        let started = Instant::now();
        let mut last = None;
        loop {
            match self.computation_status(computation_offset).await {
                Ok(Some(TxStatus::Finalized)) => {
                    return FinalizationOutcome {
                        ok: true,
                        timed_out: false,
                        status: Some(TxStatus::Finalized),
                    };
                }
                Ok(Some(TxStatus::Aborted)) => {
                    return FinalizationOutcome {
                        ok: false,
                        timed_out: false,
                        status: Some(TxStatus::Aborted),
                    };
                }
                Ok(status) => last = status,
                Err(err) => {
                    debug!(error = %err, computation_offset, "finalization poll failed");
                }
            }
            if started.elapsed() >= timeout {
                return FinalizationOutcome {
                    ok: false,
                    timed_out: true,
                    status: last,
                };
            }
            tokio::time::sleep(poll_interval).await;
        }
    }

    /// Fetch the most recent events logged under a storage handle, newest
    /// last. The response is a u32 count followed by that many events.
    pub async fn scan_log(&self, handle: &StorageHandle, limit: usize) -> Result<Vec<Event>> {
        let url = self
            .base_url
            .join(&format!("log/{}?limit={limit}", handle.to_hex()))?;
        let response = self.get_with_retry(url).await?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        if !status.is_success() {
            return Err(Error::Failed(status));
        }
        let bytes = response.bytes().await?;
        let mut buf = bytes.as_ref();
        let count = u32::read(&mut buf)? as usize;
        // A hostile count must not reserve more than the requested window.
        let mut events = Vec::with_capacity(count.min(limit));
        for _ in 0..count {
            events.push(Event::read(&mut buf)?);
        }
        Ok(events)
    }

    /// Open an event stream scoped to one round.
    pub async fn connect_events(
        &self,
        round_id: RoundId,
    ) -> Result<Stream<Event>> {
        let mut url = self.base_url.join(&format!("events/{round_id}"))?;
        let ws_scheme = match url.scheme() {
            "http" => "ws",
            "https" => "wss",
            scheme => return Err(Error::InvalidScheme(scheme.to_string())),
        };
        url.set_scheme(ws_scheme)
            .map_err(|_| Error::InvalidScheme(url.scheme().to_string()))?;
        let (ws, _) = connect_async(url.as_str()).await?;
        Ok(Stream::new(ws))
    }
}
