use axum::extract::{Path, Query, State as AxumState};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use commonware_codec::{DecodeExt, Encode, Write};
use serde::Deserialize;
use std::sync::Arc;
use veilmatch_types::api::Instruction;
use veilmatch_types::StorageHandle;

use crate::Simulator;

const DEFAULT_LOG_LIMIT: usize = 30;
const MAX_LOG_LIMIT: usize = 1024;

pub(super) async fn healthz() -> &'static str {
    "ok"
}

pub(super) async fn mxe_key(AxumState(simulator): AxumState<Arc<Simulator>>) -> Response {
    match simulator.query_mxe_key() {
        Some(key) => key.to_vec().into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

pub(super) async fn submit(
    AxumState(simulator): AxumState<Arc<Simulator>>,
    body: Bytes,
) -> Response {
    let instruction = match Instruction::decode(&mut body.as_ref()) {
        Ok(instruction) => instruction,
        Err(err) => {
            tracing::debug!(error = %err, "failed to decode instruction");
            return (StatusCode::BAD_REQUEST, format!("invalid instruction: {err}"))
                .into_response();
        }
    };
    match simulator.apply(instruction) {
        Ok(()) => StatusCode::OK.into_response(),
        Err(err) => (StatusCode::BAD_REQUEST, err.to_string()).into_response(),
    }
}

pub(super) async fn query_round(
    AxumState(simulator): AxumState<Arc<Simulator>>,
    Path(handle): Path<String>,
) -> Response {
    let Some(handle) = StorageHandle::from_hex(&handle) else {
        return (StatusCode::BAD_REQUEST, "invalid handle").into_response();
    };
    match simulator.round_view(&handle) {
        Some(view) => view.encode().to_vec().into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

pub(super) async fn computation_status(
    AxumState(simulator): AxumState<Arc<Simulator>>,
    Path(offset): Path<u64>,
) -> Response {
    match simulator.computation_status(offset) {
        Some(status) => status.encode().to_vec().into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

#[derive(Deserialize)]
pub(super) struct LogQuery {
    limit: Option<usize>,
}

pub(super) async fn scan_log(
    AxumState(simulator): AxumState<Arc<Simulator>>,
    Path(handle): Path<String>,
    Query(query): Query<LogQuery>,
) -> Response {
    let Some(handle) = StorageHandle::from_hex(&handle) else {
        return (StatusCode::BAD_REQUEST, "invalid handle").into_response();
    };
    let limit = query.limit.unwrap_or(DEFAULT_LOG_LIMIT).min(MAX_LOG_LIMIT);
    let events = simulator.log(&handle, limit);

    // u32 count followed by that many events.
    let mut buf = Vec::new();
    (events.len() as u32).write(&mut buf);
    for event in &events {
        event.write(&mut buf);
    }
    buf.into_response()
}
