//! Persistence contract for the game.
//!
//! The engine only talks to a [`Store`]: keyed reads and writes per entity,
//! filtered queries scoped by session/round/category, atomic single-row
//! updates for sessions and players, and a row-level change stream.
//! [`MemoryStore`] is the in-process implementation used by the server and tests.

mod memory;
pub mod pack;

pub use memory::MemoryStore;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tokio::sync::broadcast;

use crate::error::{GameResult, StoreResult};
use crate::types::*;

/// Validated mutation applied to the latest persisted session row.
/// Returning an error aborts the write; nothing is persisted.
pub type SessionMutation = Box<dyn FnOnce(&mut Session) -> GameResult<()> + Send>;

/// Precondition checked against the latest persisted session row before a
/// dependent write. Returning an error rejects the write.
pub type SessionGuard = Box<dyn FnOnce(&Session) -> GameResult<()> + Send>;

/// Validated mutation applied to the latest persisted player row
pub type PlayerMutation = Box<dyn FnOnce(&mut Player) -> GameResult<()> + Send>;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Table {
    Sessions,
    Players,
    Hands,
    Submissions,
    Winners,
    Cards,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// A row-level change notification
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChangeEvent {
    pub table: Table,
    pub kind: ChangeKind,
    /// None for global rows (the shared card pool)
    pub session_id: Option<SessionId>,
    pub row_id: String,
}

impl ChangeEvent {
    pub fn new(table: Table, kind: ChangeKind, session_id: Option<&str>, row_id: &str) -> Self {
        Self {
            table,
            kind,
            session_id: session_id.map(str::to_string),
            row_id: row_id.to_string(),
        }
    }
}

/// Scopes a subscription by session and, optionally, by table
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeFilter {
    pub session_id: Option<SessionId>,
    pub tables: Option<HashSet<Table>>,
}

impl ChangeFilter {
    pub fn session(session_id: &str) -> Self {
        Self {
            session_id: Some(session_id.to_string()),
            tables: None,
        }
    }

    pub fn with_tables(mut self, tables: impl IntoIterator<Item = Table>) -> Self {
        self.tables = Some(tables.into_iter().collect());
        self
    }

    pub fn matches(&self, event: &ChangeEvent) -> bool {
        if let Some(tables) = &self.tables {
            if !tables.contains(&event.table) {
                return false;
            }
        }
        match &self.session_id {
            Some(id) => event.session_id.as_deref() == Some(id.as_str()),
            None => true,
        }
    }
}

/// What a subscriber receives
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    Change(ChangeEvent),
    /// The subscriber fell behind and missed this many events; refetch everything
    Lagged(u64),
}

/// Filtered view over the store's change stream
pub struct Subscription {
    rx: broadcast::Receiver<ChangeEvent>,
    filter: ChangeFilter,
}

impl Subscription {
    pub fn new(rx: broadcast::Receiver<ChangeEvent>, filter: ChangeFilter) -> Self {
        Self { rx, filter }
    }

    /// Wait for the next matching notification. None once the store is gone.
    pub async fn next(&mut self) -> Option<Notification> {
        loop {
            match self.rx.recv().await {
                Ok(event) if self.filter.matches(&event) => {
                    return Some(Notification::Change(event))
                }
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    tracing::warn!(missed, "Change subscriber lagged");
                    return Some(Notification::Lagged(missed));
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

#[async_trait]
pub trait Store: Send + Sync {
    // ----- sessions -----

    /// Insert a new session. Fails with `Duplicate` if the room code is taken.
    async fn insert_session(&self, session: Session) -> StoreResult<()>;
    async fn get_session(&self, id: &str) -> StoreResult<Option<Session>>;
    async fn find_session_by_code(&self, room_code: &str) -> StoreResult<Option<Session>>;
    async fn list_sessions(&self) -> StoreResult<Vec<Session>>;
    /// Atomically apply `mutation` to the latest row and bump its version
    async fn update_session(&self, id: &str, mutation: SessionMutation) -> GameResult<Session>;
    /// Delete a session together with every row scoped to it
    async fn delete_session(&self, id: &str) -> StoreResult<bool>;

    // ----- players -----

    async fn insert_player(&self, player: Player) -> StoreResult<()>;
    async fn get_player(&self, id: &str) -> StoreResult<Option<Player>>;
    /// Live roster ordered by join time
    async fn list_players(&self, session_id: &str) -> StoreResult<Vec<Player>>;
    async fn update_player(&self, id: &str, mutation: PlayerMutation) -> GameResult<Player>;
    /// Delete a player together with their hand and submissions
    async fn delete_player(&self, id: &str) -> StoreResult<bool>;
    async fn delete_players(&self, session_id: &str) -> StoreResult<usize>;

    // ----- hands -----

    async fn insert_hand_cards(&self, cards: Vec<HandCard>) -> StoreResult<()>;
    async fn list_hand(&self, player_id: &str) -> StoreResult<Vec<HandCard>>;
    async fn list_hands(&self, session_id: &str) -> StoreResult<Vec<HandCard>>;
    async fn remove_hand_card(&self, player_id: &str, card_id: &str) -> StoreResult<bool>;
    async fn clear_new_flags(&self, player_id: &str) -> StoreResult<()>;
    async fn delete_hands(&self, session_id: &str) -> StoreResult<usize>;

    // ----- response card pool -----

    async fn insert_card(&self, card: ResponseCard) -> StoreResult<()>;
    async fn get_cards(&self, ids: &[CardId]) -> StoreResult<Vec<ResponseCard>>;
    /// Random sample of active cards outside `excluded`, at most `limit` long
    async fn sample_active_cards(
        &self,
        excluded: &HashSet<CardId>,
        limit: usize,
    ) -> StoreResult<Vec<ResponseCard>>;

    // ----- scenarios -----

    async fn insert_scenario(&self, scenario: Scenario) -> StoreResult<()>;
    async fn get_scenario(&self, id: &str) -> StoreResult<Option<Scenario>>;
    async fn list_scenarios(&self, category: &str) -> StoreResult<Vec<Scenario>>;
    async fn list_categories(&self) -> StoreResult<Vec<String>>;

    // ----- submissions -----

    /// Insert a submission if `guard` accepts the owning session as it stands.
    /// No session write can land between the check and the insert. Fails with
    /// `Duplicate` if the player already submitted this round.
    async fn insert_submission(
        &self,
        submission: Submission,
        guard: SessionGuard,
    ) -> GameResult<()>;
    async fn list_submissions(&self, session_id: &str, round: u32) -> StoreResult<Vec<Submission>>;
    /// Delete a session's submissions, optionally only those of one round
    async fn delete_submissions(&self, session_id: &str, round: Option<u32>)
        -> StoreResult<usize>;

    // ----- winners -----

    async fn append_winner(&self, record: WinnerRecord) -> StoreResult<()>;
    async fn list_winners(&self, session_id: &str) -> StoreResult<Vec<WinnerRecord>>;
    async fn delete_winners(&self, session_id: &str) -> StoreResult<usize>;

    // ----- notifications -----

    fn subscribe(&self, filter: ChangeFilter) -> Subscription;
}
