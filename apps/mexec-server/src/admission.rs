//! `/connect`: credential admission and the per-tunnel serve loop.
//!
//! Admission runs before the WebSocket upgrade. A refused request never
//! allocates a tunnel and never reaches the route table.

use std::sync::Arc;

use axum::extract::ws::{rejection::WebSocketUpgradeRejection, Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use futures_util::stream::SplitStream;
use futures_util::StreamExt as _;
use mexec_otel::AUDIT_TARGET;
use mexec_topics::{ATTR_BEARER_TOKEN, HEADER_ACCESS_TOKEN, HEADER_FORWARDED_USER};
use tracing::{debug, info, trace, warn};

use crate::app_state::AppState;
use crate::bridge::EventBridge;
use crate::responses;
use crate::rpc::{CallContext, RouteTable};
use crate::tunnel::Tunnel;

/// Non-empty header value, if present and valid UTF-8.
fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

/// Forwarded username as sent by the proxy.
enum ForwardedUser {
    Absent,
    Named(String),
    /// Present but not representable as a username; never verifiable.
    Unreadable,
}

fn forwarded_user(headers: &HeaderMap) -> ForwardedUser {
    let Some(raw) = headers.get(HEADER_FORWARDED_USER) else {
        return ForwardedUser::Absent;
    };
    if raw.as_bytes().iter().all(u8::is_ascii_whitespace) {
        return ForwardedUser::Absent;
    }
    match raw.to_str() {
        Ok(name) => ForwardedUser::Named(name.trim().to_string()),
        Err(_) => ForwardedUser::Unreadable,
    }
}

fn deny_user(route: &'static str, user: &str) -> Response {
    info!(
        target: AUDIT_TARGET,
        route,
        user,
        outcome = "denied",
        reason = "not_owner",
        "admission"
    );
    metrics::counter!("mexec_admission_denied_total", "reason" => "not_owner").increment(1);
    responses::forbidden()
}

/// Credential check shared by `/connect` and `/attach`.
///
/// Returns the access token to attach to the connection, or the rejection to
/// send back. With enforcement off every request is admitted.
pub(crate) async fn admit(state: &AppState, headers: &HeaderMap, route: &'static str) -> Result<Option<String>, Response> {
    metrics::counter!("mexec_admission_total", "route" => route).increment(1);
    let token = header_value(headers, HEADER_ACCESS_TOKEN);
    if !state.config().use_bearer_token {
        return Ok(token);
    }

    let Some(token) = token else {
        info!(target: AUDIT_TARGET, route, outcome = "denied", reason = "missing_token", "admission");
        metrics::counter!("mexec_admission_denied_total", "reason" => "missing_token").increment(1);
        return Err(responses::unauthorized());
    };

    match forwarded_user(headers) {
        ForwardedUser::Absent => {
            warn!(route, "access token present without forwarded user; admitting on token alone");
        }
        ForwardedUser::Unreadable => return Err(deny_user(route, "<non-utf8>")),
        ForwardedUser::Named(username) => {
            let verified = match state.verifier() {
                Some(verifier) => verifier.verify(&username).await,
                None => false,
            };
            if !verified {
                return Err(deny_user(route, &username));
            }
            info!(target: AUDIT_TARGET, route, user = %username, outcome = "granted", "admission");
        }
    }
    Ok(Some(token))
}

pub(crate) async fn connect(
    State(state): State<AppState>,
    headers: HeaderMap,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let token = match admit(&state, &headers, "connect").await {
        Ok(token) => token,
        Err(rejection) => return rejection,
    };
    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => {
            debug!(%rejection, "connect request is not a websocket upgrade");
            return rejection.into_response();
        }
    };
    ws.on_failed_upgrade(|err| warn!(%err, "websocket upgrade failed"))
        .on_upgrade(move |socket| run_tunnel(state, socket, token))
}

async fn run_tunnel(state: AppState, socket: WebSocket, token: Option<String>) {
    let (sink, stream) = socket.split();
    let tunnel = Tunnel::establish(Box::new(sink));
    if let Some(token) = token {
        if let Err(err) = tunnel.set_attribute(ATTR_BEARER_TOKEN, token) {
            warn!(tunnel = %tunnel.id(), %err, "failed to attach credential");
        }
    }
    state.tunnels().register(&tunnel);
    EventBridge::attach(state.bus(), &tunnel);

    if let Err(err) = tunnel.say_hello().await {
        debug!(tunnel = %tunnel.id(), %err, "handshake failed");
        tunnel.close().await;
        return;
    }
    tunnel.seal();
    info!(tunnel = %tunnel.id(), "tunnel established");

    serve(state.routes(), tunnel.clone(), stream).await;
    tunnel.close().await;
    info!(tunnel = %tunnel.id(), "tunnel closed");
}

/// Reads frames until the peer goes away or the tunnel is closed locally.
/// Each request is handled on its own task; responses may be reordered.
async fn serve(routes: Arc<RouteTable>, tunnel: Arc<Tunnel>, mut stream: SplitStream<WebSocket>) {
    loop {
        let next = tokio::select! {
            _ = tunnel.closed() => break,
            next = stream.next() => next,
        };
        match next {
            None | Some(Ok(Message::Close(_))) => break,
            Some(Err(err)) => {
                debug!(tunnel = %tunnel.id(), %err, "websocket read failed");
                break;
            }
            Some(Ok(Message::Text(text))) => {
                let routes = routes.clone();
                let tunnel = tunnel.clone();
                tokio::spawn(async move {
                    let ctx = CallContext {
                        tunnel: tunnel.clone(),
                    };
                    if let Some(response) = routes.handle_frame(ctx, text.as_str()).await {
                        if let Err(err) = tunnel.send_response(&response).await {
                            debug!(tunnel = %tunnel.id(), %err, "response dropped");
                        }
                    }
                });
            }
            Some(Ok(Message::Binary(_))) => {
                debug!(tunnel = %tunnel.id(), "ignoring binary frame");
            }
            Some(Ok(_)) => trace!(tunnel = %tunnel.id(), "control frame"),
        }
    }
}
