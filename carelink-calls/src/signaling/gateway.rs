use std::borrow::Cow;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::response::Response;
use futures::{Sink, SinkExt, Stream, StreamExt};
use metrics::counter;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};

use carelink_shared::auth::TokenVerifier;

use super::envelope::ServerMessage;
use super::hub::{Frame, Outbound};
use crate::AppState;

const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectParams {
    pub user_id: Option<String>,
    pub token: Option<String>,
}

/// Why a connection was refused before admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    MissingToken,
    InvalidToken,
    /// The participant id is registered in this room under another token subject.
    ParticipantIdInUse,
}

impl Rejection {
    pub fn reason(self) -> &'static str {
        match self {
            Rejection::MissingToken => "Authentication required",
            Rejection::InvalidToken => "Authentication failed",
            Rejection::ParticipantIdInUse => "Participant id in use",
        }
    }

    pub fn close_code(self) -> u16 {
        match self {
            Rejection::MissingToken | Rejection::InvalidToken => close_code::UNSUPPORTED,
            Rejection::ParticipantIdInUse => close_code::POLICY,
        }
    }

    fn as_label(self) -> &'static str {
        match self {
            Rejection::MissingToken => "missing_token",
            Rejection::InvalidToken => "invalid_token",
            Rejection::ParticipantIdInUse => "participant_id_in_use",
        }
    }
}

/// Who a verified connection is: the id it is known by in the room, and the token subject
/// that owns that id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Admission {
    pub participant_id: String,
    pub subject: String,
}

/// Verify the token and pick the participant id. A missing `userId` falls back to the token subject.
pub fn authenticate(verifier: &TokenVerifier, params: &ConnectParams) -> Result<Admission, Rejection> {
    let token = params
        .token
        .as_deref()
        .filter(|t| !t.trim().is_empty())
        .ok_or(Rejection::MissingToken)?;

    let user = verifier.verify(token).map_err(|e| {
        tracing::debug!(error = %e, "signaling token rejected");
        Rejection::InvalidToken
    })?;

    let participant_id = params
        .user_id
        .clone()
        .filter(|id| !id.trim().is_empty())
        .unwrap_or_else(|| user.subject.clone());
    Ok(Admission {
        participant_id,
        subject: user.subject,
    })
}

// ---------------------------------------------------------------------------
// GET /ws/webrtc/:call_id?userId=..&token=..
// ---------------------------------------------------------------------------

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Path(call_id): Path<String>,
    Query(params): Query<ConnectParams>,
    State(state): State<Arc<AppState>>,
) -> Response {
    let max_message_bytes = state.config.ws_max_message_bytes;
    ws.max_message_size(max_message_bytes)
        .max_frame_size(max_message_bytes)
        .on_upgrade(move |socket| handle_socket(socket, state, call_id, params))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>, call_id: String, params: ConnectParams) {
    let (sink, stream) = socket.split();
    serve_connection(state, call_id, params, sink, stream).await;
}

/// Run one signaling connection to completion: admission, the reader loop on this task and
/// a writer task draining the connection's outbound queue.
pub(crate) async fn serve_connection<W, R>(
    state: Arc<AppState>,
    call_id: String,
    params: ConnectParams,
    mut sink: W,
    mut stream: R,
) where
    W: Sink<Message> + Unpin + Send + 'static,
    W::Error: fmt::Display,
    R: Stream<Item = Result<Message, axum::Error>> + Unpin,
{
    let admission = match authenticate(&state.verifier, &params) {
        Ok(admission) => admission,
        Err(rejection) => return reject(&mut sink, &call_id, rejection).await,
    };
    let participant_id = admission.participant_id.as_str();

    let (tx, rx) = mpsc::channel::<Frame>(state.config.ws_outbound_buffer.max(1));
    let connection_id = match state.hub.join(&call_id, participant_id, &admission.subject, tx.clone()) {
        Ok(id) => id,
        Err(e) => {
            tracing::debug!(call_id = %call_id, error = %e, "signaling join refused");
            return reject(&mut sink, &call_id, Rejection::ParticipantIdInUse).await;
        }
    };
    counter!("signaling_connections_total", "outcome" => "admitted").increment(1);

    // Frames queued by the hub during join wait in the channel until the writer starts.
    let writer = tokio::spawn(write_frames(sink, rx, state.config.ws_ping_interval()));
    let idle_timeout = state.config.ws_idle_timeout();

    loop {
        // Any inbound frame counts as activity, including pongs to our pings.
        let msg = match tokio::time::timeout(idle_timeout, stream.next()).await {
            Err(_) => {
                tracing::info!(call_id = %call_id, participant_id, "signaling connection idle, closing");
                let _ = tx.try_send(Frame::Close {
                    code: close_code::AWAY,
                    reason: "idle timeout",
                });
                break;
            }
            Ok(None) => break,
            Ok(Some(Err(e))) => {
                tracing::debug!(call_id = %call_id, participant_id, error = %e, "signaling socket error");
                break;
            }
            Ok(Some(Ok(msg))) => msg,
        };

        match msg {
            Message::Text(text) => {
                if let Err(e) = state.hub.relay(&call_id, participant_id, &text) {
                    tracing::debug!(call_id = %call_id, participant_id, error = %e, "invalid signaling envelope");
                    send_to_self(&tx, &e.to_server_message());
                }
            }
            Message::Binary(_) => {
                send_to_self(
                    &tx,
                    &ServerMessage::Error {
                        code: "UNSUPPORTED_FRAME",
                        message: "binary frames are not supported".into(),
                    },
                );
            }
            Message::Close(_) => break,
            // Pings are answered by the websocket layer.
            Message::Ping(_) | Message::Pong(_) => {}
        }
    }

    state.hub.leave(&call_id, participant_id, connection_id);
    drop(tx);
    if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, writer).await.is_err() {
        tracing::debug!(call_id = %call_id, participant_id, "writer did not drain in time");
    }
}

async fn reject<W>(sink: &mut W, call_id: &str, rejection: Rejection)
where
    W: Sink<Message> + Unpin,
{
    counter!(
        "signaling_connections_total",
        "outcome" => "rejected",
        "reason" => rejection.as_label()
    )
    .increment(1);
    tracing::warn!(call_id = %call_id, reason = rejection.reason(), "signaling connection rejected");
    let _ = sink
        .send(Message::Close(Some(CloseFrame {
            code: rejection.close_code(),
            reason: Cow::Borrowed(rejection.reason()),
        })))
        .await;
    let _ = sink.close().await;
}

fn send_to_self(tx: &Outbound, message: &ServerMessage) {
    match message.encode() {
        Ok(text) => {
            let _ = tx.try_send(Frame::Text(text.into()));
        }
        Err(e) => tracing::error!(error = %e, "failed to encode server message"),
    }
}

/// Drain the connection's outbound queue onto the socket, pinging the client every
/// `ping_every` so a quiet call keeps producing pongs. Stops after a close frame or once
/// every sender is gone.
async fn write_frames<W>(mut sink: W, mut rx: mpsc::Receiver<Frame>, ping_every: Duration)
where
    W: Sink<Message> + Unpin,
    W::Error: fmt::Display,
{
    let mut ping = tokio::time::interval_at(Instant::now() + ping_every, ping_every);
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let frame = tokio::select! {
            frame = rx.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
            _ = ping.tick() => Frame::Ping,
        };

        let result = match frame {
            Frame::Text(text) => sink.send(Message::Text(text.to_string())).await,
            Frame::Ping => sink.send(Message::Ping(Vec::new())).await,
            Frame::Close { code, reason } => {
                let _ = sink
                    .send(Message::Close(Some(CloseFrame {
                        code,
                        reason: Cow::Borrowed(reason),
                    })))
                    .await;
                break;
            }
        };
        if let Err(e) = result {
            tracing::debug!(error = %e, "signaling socket write failed");
            break;
        }
    }
    let _ = sink.close().await;
}
