//! Client-side reconciliation.
//!
//! A [`Coordinator`] keeps one client's picture of a session current. Push
//! events from a feed and a bounded poll are two producers; a single loop
//! consumes them, coalesces bursts, and never has more than one refetch in
//! flight. Identity comes only from the server and is re-verified on every
//! (re)connect.

pub mod api;
pub mod feed;

pub use api::{ClientError, ClientResult, HttpSessionApi, SessionApi};
pub use feed::{spawn_store_feed, spawn_ws_feed, FeedEvent};

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::protocol::{Identity, SessionView};
use crate::types::{Phase, Role};

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Quiet period that folds a burst of events into one refetch
    pub debounce: Duration,
    /// Refetch interval while a transition is running or the last refetch failed
    pub poll_interval: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(150),
            poll_interval: Duration::from_secs(1),
        }
    }
}

/// What the client should render
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    pub identity: Option<Identity>,
    pub view: Option<SessionView>,
    /// Last refetch failure, cleared by the next success
    pub error: Option<String>,
    /// Successful refetches so far
    pub refreshes: u64,
}

impl Snapshot {
    pub fn phase(&self) -> Option<Phase> {
        self.view.as_ref().map(|v| v.session.phase)
    }

    pub fn role(&self) -> Role {
        self.view
            .as_ref()
            .filter(|_| self.identity.is_some())
            .map(|v| v.my_role)
            .unwrap_or(Role::Spectator)
    }

    fn busy(&self) -> bool {
        self.view
            .as_ref()
            .is_some_and(|v| !v.session.transition.is_idle())
    }
}

/// Handle to a running coordinator
pub struct CoordinatorHandle {
    events: mpsc::Sender<FeedEvent>,
    snapshots: watch::Receiver<Snapshot>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl CoordinatorHandle {
    /// Sender for a feed to push into
    pub fn feed(&self) -> mpsc::Sender<FeedEvent> {
        self.events.clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Snapshot> {
        self.snapshots.clone()
    }

    pub fn snapshot(&self) -> Snapshot {
        self.snapshots.borrow().clone()
    }

    /// Child token for feeds that should die with the coordinator
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.child_token()
    }

    /// Ask for a refetch, e.g. after a local action
    pub async fn nudge(&self) {
        let _ = self.events.send(FeedEvent::Change).await;
    }

    /// Ask for identity re-verification and a refetch, e.g. after joining
    pub async fn reverify(&self) {
        let _ = self.events.send(FeedEvent::Reconnected).await;
    }

    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            tracing::error!("Coordinator task failed: {}", e);
        }
    }
}

pub struct Coordinator {
    api: Arc<dyn SessionApi>,
    session_id: String,
    config: CoordinatorConfig,
    events: mpsc::Receiver<FeedEvent>,
    snapshot: Snapshot,
    publish: watch::Sender<Snapshot>,
    failed: bool,
}

impl Coordinator {
    /// Start the reconciliation loop for one session
    pub fn spawn(
        api: Arc<dyn SessionApi>,
        session_id: impl Into<String>,
        config: CoordinatorConfig,
    ) -> CoordinatorHandle {
        let (events_tx, events) = mpsc::channel(64);
        let (publish, snapshots) = watch::channel(Snapshot::default());
        let cancel = CancellationToken::new();

        let coordinator = Coordinator {
            api,
            session_id: session_id.into(),
            config,
            events,
            snapshot: Snapshot::default(),
            publish,
            failed: false,
        };
        let task = tokio::spawn(coordinator.run(cancel.clone()));

        CoordinatorHandle {
            events: events_tx,
            snapshots,
            cancel,
            task,
        }
    }

    async fn run(mut self, cancel: CancellationToken) {
        let mut due: Option<Instant> = Some(Instant::now());
        let mut verify = true;
        let mut feed_open = true;
        let mut last_refresh = Instant::now();

        tracing::debug!(session_id = %self.session_id, "Coordinator started");

        loop {
            let poll_at = (self.failed || self.snapshot.busy())
                .then(|| last_refresh + self.config.poll_interval);
            let wake = match (due, poll_at) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            };

            tokio::select! {
                biased;

                _ = cancel.cancelled() => break,

                event = self.events.recv(), if feed_open => match event {
                    Some(event) => {
                        if event == FeedEvent::Reconnected {
                            verify = true;
                        }
                        // Later events in a burst ride along with the first
                        due.get_or_insert_with(|| Instant::now() + self.config.debounce);
                    }
                    None => feed_open = false,
                },

                _ = sleep_until(wake), if wake.is_some() => {
                    due = None;
                    let outcome = tokio::select! {
                        _ = cancel.cancelled() => break,
                        outcome = self.refresh(verify) => outcome,
                    };
                    last_refresh = Instant::now();
                    match outcome {
                        Ok(()) => verify = false,
                        Err(e) => tracing::warn!(session_id = %self.session_id, "Refresh failed: {}", e),
                    }
                }
            }
        }

        tracing::debug!(session_id = %self.session_id, "Coordinator stopped");
    }

    /// One refetch. Identity is checked against `/me` when asked and always
    /// against the fresh roster.
    async fn refresh(&mut self, verify: bool) -> ClientResult<()> {
        let result = self.fetch(verify).await;
        match &result {
            Ok(()) => {
                self.failed = false;
                self.snapshot.error = None;
                self.snapshot.refreshes += 1;
            }
            Err(e) => {
                self.failed = true;
                self.snapshot.error = Some(e.to_string());
            }
        }
        self.publish.send_replace(self.snapshot.clone());
        result
    }

    async fn fetch(&mut self, verify: bool) -> ClientResult<()> {
        if verify {
            self.snapshot.identity = match self.api.me().await {
                Ok(identity) if identity.session_id == self.session_id => Some(identity),
                Ok(identity) => {
                    tracing::debug!(other = %identity.session_id, "Identity belongs to another session");
                    None
                }
                Err(e) if e.is_unauthorized() => None,
                Err(e) => return Err(e),
            };
        }

        let view = self.api.view(&self.session_id).await?;

        let stale = self
            .snapshot
            .identity
            .as_ref()
            .is_some_and(|me| view.player(&me.player_id).is_none());
        if stale {
            tracing::info!(session_id = %self.session_id, "No longer in the roster, dropping identity");
            self.snapshot.identity = None;
        }
        self.snapshot.view = Some(view);
        Ok(())
    }
}

async fn sleep_until(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}
