//! WebSocket endpoint of the broadcast-log relay

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    response::Response,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tracing::{debug, error, info, warn};

use crate::app::AppState;
use crate::http::auth::verify_session_token;
use crate::http::AppError;
use crate::protocol::{Envelope, RecordKind};
use crate::util::rate_limit::ConnectionRateLimiter;

use super::registry::{Attachment, SessionHandle};

/// Query parameters for a log connection
#[derive(Debug, Deserialize)]
pub struct LogQuery {
    pub player: String,
    pub token: String,
    /// Replay everything after this sequence before going live
    #[serde(default)]
    pub since: u64,
}

/// Authenticate, then upgrade to a session log connection
pub async fn session_ws_handler(
    ws: WebSocketUpgrade,
    Path(session_id): Path<String>,
    Query(query): Query<LogQuery>,
    State(state): State<AppState>,
) -> Result<Response, AppError> {
    verify_session_token(&state.config.relay_secret, &session_id, &query.player, &query.token)
        .map_err(|e| {
            warn!(session_id = %session_id, player_id = %query.player, error = %e, "Log connection refused");
            AppError::Unauthorized(e)
        })?;

    let (session, attachment) = state.sessions.join(&session_id).map_err(|e| {
        error!(session_id = %session_id, error = %e, "Failed to open session log");
        AppError::Internal(e.to_string())
    })?;
    // Covers upgrades that never complete as well as finished connections
    let departure = Departure {
        state: state.clone(),
        session_id: session_id.clone(),
        attachment: Some(attachment),
    };

    info!(session_id = %session_id, player_id = %query.player, since = query.since, "Log connection upgrading");
    Ok(ws.on_upgrade(move |socket| {
        handle_socket(socket, session, departure, query.player, query.since)
    }))
}

/// Detaches a participant and schedules the session's eviction once dropped
struct Departure {
    state: AppState,
    session_id: String,
    attachment: Option<Attachment>,
}

impl Drop for Departure {
    fn drop(&mut self) {
        drop(self.attachment.take());
        self.state
            .sessions
            .evict_when_idle(std::mem::take(&mut self.session_id), self.state.config.session_grace);
    }
}

/// Serve one participant: replay, live fan-out, and appends
async fn handle_socket(
    socket: WebSocket,
    session: SessionHandle,
    _departure: Departure,
    player_id: String,
    since: u64,
) {
    let session_id = session.log.session_id().to_string();
    let (mut ws_sink, mut ws_stream) = socket.split();

    // Follow before announcing the join so the participant sees it too
    let mut cursor = session.log.follow(since);
    append(&session, Envelope::bare(RecordKind::Join, &player_id), &player_id);

    let writer_player = player_id.clone();
    let writer = tokio::spawn(async move {
        while let Some((_, bytes)) = cursor.next().await {
            let text = String::from_utf8_lossy(&bytes).into_owned();
            if let Err(e) = ws_sink.send(Message::Text(text)).await {
                debug!(player_id = %writer_player, error = %e, "Log send failed");
                break;
            }
        }
    });

    let rate_limiter = ConnectionRateLimiter::new();
    while let Some(result) = ws_stream.next().await {
        let payload = match result {
            Ok(Message::Text(text)) => text.into_bytes(),
            Ok(Message::Binary(data)) => data,
            Ok(Message::Close(_)) => {
                info!(session_id = %session_id, player_id = %player_id, "Participant closed the connection");
                break;
            }
            Ok(_) => continue,
            Err(e) => {
                warn!(session_id = %session_id, player_id = %player_id, error = %e, "WebSocket error");
                break;
            }
        };

        if !rate_limiter.check_record() {
            debug!(session_id = %session_id, player_id = %player_id, "Throttling participant");
            rate_limiter.until_record_allowed().await;
        }

        match Envelope::decode(&payload) {
            Ok(envelope) => append(&session, envelope, &player_id),
            Err(e) => warn!(session_id = %session_id, player_id = %player_id, error = %e, "Malformed record dropped"),
        }
    }

    append(&session, Envelope::bare(RecordKind::Leave, &player_id), &player_id);
    writer.abort();
    info!(session_id = %session_id, player_id = %player_id, "Log connection closed");
}

/// Append as the authenticated participant; the log stamps sequence and time
fn append(session: &SessionHandle, mut envelope: Envelope, player_id: &str) {
    envelope.sender_id = player_id.to_string();
    envelope.sequence = None;
    envelope.server_timestamp = None;
    if let Err(e) = session.log.append(envelope) {
        error!(session_id = %session.log.session_id(), error = %e, "Failed to append record");
    }
}
