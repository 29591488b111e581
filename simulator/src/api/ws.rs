use axum::extract::{
    ws::{Message, WebSocket, WebSocketUpgrade},
    Path, State as AxumState,
};
use axum::response::IntoResponse;
use commonware_codec::Encode;
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::broadcast;
use veilmatch_types::RoundId;

use crate::Simulator;

pub(super) async fn events_ws(
    AxumState(simulator): AxumState<Arc<Simulator>>,
    Path(round_id): Path<u64>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_events_ws(socket, simulator, RoundId(round_id)))
}

async fn handle_events_ws(socket: WebSocket, simulator: Arc<Simulator>, round_id: RoundId) {
    tracing::debug!(%round_id, "events WebSocket connected");
    let (mut sender, mut receiver) = socket.split();
    let mut events = simulator.subscribe_events();

    loop {
        tokio::select! {
            // Handle incoming WebSocket messages (ping/pong/close)
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Close(_))) | None => {
                        tracing::debug!(%round_id, "client closed events WebSocket");
                        break;
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Err(e)) => {
                        tracing::warn!(%round_id, "events WebSocket error: {:?}", e);
                        break;
                    }
                    _ => {} // Ignore other message types
                }
            }
            // Forward broadcast events scoped to this round
            event = events.recv() => {
                match event {
                    Ok(event) if event.round_id() == round_id => {
                        if sender.send(Message::Binary(event.encode().to_vec())).await.is_err() {
                            tracing::warn!(%round_id, "failed to send event, client disconnected");
                            break;
                        }
                    }
                    Ok(_) => {} // Another round's event
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(%round_id, skipped, "events subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        break;
                    }
                }
            }
        }
    }
    tracing::debug!(%round_id, "events WebSocket handler exiting");
    let _ = sender.close().await;
}
