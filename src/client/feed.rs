//! Push producers for the reconciliation loop.
//!
//! A feed only says "something changed"; the coordinator decides when to
//! refetch. Both feeds stop when their cancellation token fires or the
//! coordinator goes away.

use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::{client::IntoClientRequest, http::HeaderValue, Message};
use tokio_util::sync::CancellationToken;

use super::api::{ClientResult, HttpSessionApi};
use crate::protocol::ServerMessage;
use crate::store::{ChangeFilter, Notification, Store};

const BACKOFF_MIN: Duration = Duration::from_millis(250);
const BACKOFF_MAX: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedEvent {
    /// Rows changed; refetch
    Change,
    /// The feed dropped and came back; events may be missing and the
    /// stored identity must be re-verified
    Reconnected,
}

/// What a feed message means for the coordinator
fn classify(msg: &ServerMessage) -> Option<FeedEvent> {
    match msg {
        ServerMessage::Welcome { .. } => None,
        ServerMessage::Change { .. } | ServerMessage::Resync { .. } => Some(FeedEvent::Change),
        // Usually our membership ended; identity needs checking
        ServerMessage::Error { .. } => Some(FeedEvent::Reconnected),
    }
}

/// Follow the server's change feed over WebSocket, reconnecting with backoff
pub fn spawn_ws_feed(
    api: Arc<HttpSessionApi>,
    session_id: String,
    events: mpsc::Sender<FeedEvent>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut backoff = BACKOFF_MIN;
        let mut connected_before = false;

        while !cancel.is_cancelled() {
            match follow(&api, &session_id, &events, &cancel, connected_before).await {
                Ok(()) => {
                    connected_before = true;
                    backoff = BACKOFF_MIN;
                }
                Err(e) => tracing::warn!(%session_id, "Change feed error: {}", e),
            }
            if events.is_closed() {
                break;
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(backoff) => {}
            }
            backoff = (backoff * 2).min(BACKOFF_MAX);
        }
        tracing::debug!(%session_id, "Change feed stopped");
    })
}

/// One connection's lifetime. Errors only if the socket never opened.
async fn follow(
    api: &HttpSessionApi,
    session_id: &str,
    events: &mpsc::Sender<FeedEvent>,
    cancel: &CancellationToken,
    reconnect: bool,
) -> ClientResult<()> {
    let mut request = api.feed_url(session_id).into_client_request()?;
    if let Some(cookie) = api.cookie_header().await {
        if let Ok(value) = HeaderValue::from_str(&cookie) {
            request.headers_mut().insert("cookie", value);
        }
    }

    let (mut stream, _) = tokio_tungstenite::connect_async(request).await?;
    tracing::debug!(session_id, reconnect, "Change feed connected");

    // Anything may have happened while we were away
    let caught_up = if reconnect {
        FeedEvent::Reconnected
    } else {
        FeedEvent::Change
    };
    if events.send(caught_up).await.is_err() {
        return Ok(());
    }

    loop {
        let msg = tokio::select! {
            _ = cancel.cancelled() => {
                let _ = stream.close(None).await;
                return Ok(());
            }
            msg = stream.next() => msg,
        };

        let text = match msg {
            Some(Ok(Message::Text(text))) => text,
            Some(Ok(Message::Close(_))) | None => return Ok(()),
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                tracing::warn!(session_id, "Change feed read failed: {}", e);
                return Ok(());
            }
        };

        let event = match serde_json::from_str::<ServerMessage>(&text) {
            Ok(msg) => classify(&msg),
            Err(e) => {
                tracing::warn!("Unparseable feed message: {}", e);
                Some(FeedEvent::Change)
            }
        };
        if let Some(event) = event {
            if events.send(event).await.is_err() {
                return Ok(());
            }
        }
    }
}

/// In-process feed straight off a store subscription
pub fn spawn_store_feed(
    store: Arc<dyn Store>,
    session_id: &str,
    events: mpsc::Sender<FeedEvent>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    let mut subscription = store.subscribe(ChangeFilter::session(session_id));
    tokio::spawn(async move {
        loop {
            let note = tokio::select! {
                _ = cancel.cancelled() => break,
                note = subscription.next() => note,
            };
            let event = match note {
                Some(Notification::Change(_)) | Some(Notification::Lagged(_)) => FeedEvent::Change,
                None => break,
            };
            if events.send(event).await.is_err() {
                break;
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{ChangeEvent, ChangeKind, MemoryStore, Table};
    use crate::types::Player;

    #[test]
    fn test_classify() {
        let welcome = ServerMessage::Welcome {
            session_id: "s".into(),
            server_now: String::new(),
        };
        assert_eq!(classify(&welcome), None);

        let change = ServerMessage::Change {
            event: ChangeEvent::new(Table::Players, ChangeKind::Insert, Some("s"), "p"),
        };
        assert_eq!(classify(&change), Some(FeedEvent::Change));
        assert_eq!(
            classify(&ServerMessage::Resync { missed: 3 }),
            Some(FeedEvent::Change)
        );
        let error = ServerMessage::Error {
            code: "UNAUTHORIZED".into(),
            msg: String::new(),
        };
        assert_eq!(classify(&error), Some(FeedEvent::Reconnected));
    }

    #[tokio::test]
    async fn test_store_feed_scoped_to_session() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let (tx, mut rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        let task = spawn_store_feed(store.clone(), "s1", tx, cancel.clone());

        store
            .insert_player(Player::new("s2", "Elsewhere".into(), String::new()))
            .await
            .unwrap();
        store
            .insert_player(Player::new("s1", "Here".into(), String::new()))
            .await
            .unwrap();

        let event = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap();
        assert_eq!(event, Some(FeedEvent::Change));
        assert!(rx.try_recv().is_err());

        cancel.cancel();
        task.await.unwrap();
    }
}
