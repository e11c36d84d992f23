//! Legacy `/attach/{id}` socket: raw process I/O for one exec session.

use std::sync::Arc;

use axum::extract::ws::{rejection::WebSocketUpgradeRejection, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use futures_util::{SinkExt as _, StreamExt as _};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

use crate::admission::admit;
use crate::app_state::AppState;
use crate::exec::{ExecSession, SessionId};
use crate::responses;

pub(crate) async fn attach(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    if let Err(rejection) = admit(&state, &headers, "attach").await {
        return rejection;
    }
    let Some(session) = state.sessions().get(&SessionId::from(id.as_str())) else {
        return responses::not_found(&format!("exec session '{id}' not found"));
    };
    match ws {
        Ok(ws) => ws
            .on_failed_upgrade(|err| warn!(%err, "attach upgrade failed"))
            .on_upgrade(move |socket| pump(session, socket)),
        Err(rejection) => rejection.into_response(),
    }
}

async fn pump(session: Arc<ExecSession>, socket: WebSocket) {
    let (mut sink, mut stream) = socket.split();
    let (replay, mut output) = session.attach_output();
    info!(session = %session.id(), replayed = replay.len(), "attached to exec session");

    for chunk in replay {
        if sink.send(Message::Text(chunk.into())).await.is_err() {
            return;
        }
    }

    loop {
        tokio::select! {
            chunk = output.recv() => match chunk {
                Ok(chunk) => {
                    if sink.send(Message::Text(chunk.into())).await.is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(session = %session.id(), skipped, "attach reader lagged; output dropped");
                }
                Err(RecvError::Closed) => break,
            },
            inbound = stream.next() => match inbound {
                Some(Ok(Message::Text(text))) => {
                    if let Err(err) = session.send_input(text.to_string()).await {
                        debug!(session = %session.id(), %err, "input rejected");
                    }
                }
                Some(Ok(Message::Binary(bytes))) => {
                    let text = String::from_utf8_lossy(&bytes).into_owned();
                    if let Err(err) = session.send_input(text).await {
                        debug!(session = %session.id(), %err, "input rejected");
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    debug!(session = %session.id(), %err, "attach read failed");
                    break;
                }
            },
            _ = session.finished() => {
                // pumps are joined before the status flips, so whatever is
                // still queued here is the tail of the output
                while let Ok(chunk) = output.try_recv() {
                    if sink.send(Message::Text(chunk.into())).await.is_err() {
                        return;
                    }
                }
                break;
            }
        }
    }
    let _ = sink.close().await;
    debug!(session = %session.id(), "detached from exec session");
}
