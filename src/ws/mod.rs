//! Change-notification feed.
//!
//! Each socket is scoped to one session and relays that session's row-level
//! change events. Clients refetch their view on every event; nothing game
//! related is sent over the socket itself.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::HeaderMap,
    response::{IntoResponse, Response},
};
use futures::{sink::SinkExt, stream::StreamExt};
use serde::Deserialize;
use std::sync::Arc;

use crate::auth::{token_from_headers, Actor};
use crate::error::{AuthFailure, GameError};
use crate::protocol::ServerMessage;
use crate::state::AppState;
use crate::store::{ChangeFilter, ChangeKind, Notification, Subscription, Table};

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    pub session_id: String,
}

/// WebSocket upgrade handler
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<WsQuery>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Response {
    let token = token_from_headers(&headers);
    let viewer = match state.viewer(token.as_deref(), &params.session_id).await {
        Ok(viewer) => viewer,
        Err(e) => return e.into_response(),
    };

    tracing::info!(
        session_id = %params.session_id,
        player_id = ?viewer.as_ref().map(|a| &a.player_id),
        "Change feed requested"
    );

    // Subscribe before the upgrade so no change slips between view and feed
    let subscription = state
        .store
        .subscribe(ChangeFilter::session(&params.session_id));
    ws.on_upgrade(move |socket| handle_socket(socket, params.session_id, viewer, subscription))
}

async fn send(sender: &mut futures::stream::SplitSink<WebSocket, Message>, msg: &ServerMessage) -> bool {
    match serde_json::to_string(msg) {
        Ok(json) => sender.send(Message::Text(json.into())).await.is_ok(),
        Err(e) => {
            tracing::error!("Failed to serialize feed message: {}", e);
            true
        }
    }
}

/// Handle individual WebSocket connection
async fn handle_socket(
    socket: WebSocket,
    session_id: String,
    viewer: Option<Actor>,
    mut subscription: Subscription,
) {
    let (mut sender, mut receiver) = socket.split();
    let me = viewer.map(|a| a.player_id);

    let welcome = ServerMessage::Welcome {
        session_id: session_id.clone(),
        server_now: chrono::Utc::now().to_rfc3339(),
    };
    if !send(&mut sender, &welcome).await {
        tracing::error!("Failed to send welcome message");
        return;
    }

    loop {
        tokio::select! {
            note = subscription.next() => {
                let msg = match note {
                    Some(Notification::Change(event)) => {
                        let removed_me = event.table == Table::Players
                            && event.kind == ChangeKind::Delete
                            && me.as_deref() == Some(event.row_id.as_str());
                        if removed_me {
                            let gone = GameError::Unauthorized(AuthFailure::NotAMember);
                            let _ = send(&mut sender, &ServerMessage::from(&gone)).await;
                            tracing::info!(%session_id, "Feed member removed, closing");
                            break;
                        }
                        tracing::debug!(%session_id, table = ?event.table, kind = ?event.kind, "Relaying change");
                        ServerMessage::Change { event }
                    }
                    Some(Notification::Lagged(missed)) => ServerMessage::Resync { missed },
                    None => break,
                };
                if !send(&mut sender, &msg).await {
                    break;
                }
            }

            ws_msg = receiver.next() => {
                match ws_msg {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Text(text))) => {
                        tracing::debug!("Ignoring client message on change feed: {}", text);
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::warn!("WebSocket error: {}", e);
                        break;
                    }
                }
            }
        }
    }

    tracing::info!(%session_id, "Change feed closed");
}
