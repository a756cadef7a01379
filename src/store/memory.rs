use async_trait::async_trait;
use rand::seq::SliceRandom;
use std::collections::{BTreeSet, HashMap, HashSet};
use tokio::sync::{broadcast, RwLock};

use super::{
    ChangeEvent, ChangeFilter, ChangeKind, PlayerMutation, SessionGuard, SessionMutation, Store,
    Subscription, Table,
};
use crate::error::{GameError, GameResult, StoreError, StoreResult};
use crate::types::*;

const CHANGE_CHANNEL_CAPACITY: usize = 256;

/// In-process store. Each table sits behind its own lock; single-row updates
/// run their mutation while holding the table's write lock.
pub struct MemoryStore {
    sessions: RwLock<HashMap<SessionId, Session>>,
    players: RwLock<HashMap<PlayerId, Player>>,
    hands: RwLock<Vec<HandCard>>,
    cards: RwLock<HashMap<CardId, ResponseCard>>,
    scenarios: RwLock<HashMap<ScenarioId, Scenario>>,
    submissions: RwLock<HashMap<SubmissionId, Submission>>,
    winners: RwLock<Vec<WinnerRecord>>,
    changes: broadcast::Sender<ChangeEvent>,
}

impl MemoryStore {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            sessions: RwLock::new(HashMap::new()),
            players: RwLock::new(HashMap::new()),
            hands: RwLock::new(Vec::new()),
            cards: RwLock::new(HashMap::new()),
            scenarios: RwLock::new(HashMap::new()),
            submissions: RwLock::new(HashMap::new()),
            winners: RwLock::new(Vec::new()),
            changes: tx,
        }
    }

    fn emit(&self, table: Table, kind: ChangeKind, session_id: Option<&str>, row_id: &str) {
        // No subscribers is fine
        let _ = self
            .changes
            .send(ChangeEvent::new(table, kind, session_id, row_id));
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Hand events name the owner only; the feed is visible to the whole table
fn hand_row_id(card: &HandCard) -> &str {
    &card.player_id
}

#[async_trait]
impl Store for MemoryStore {
    async fn insert_session(&self, session: Session) -> StoreResult<()> {
        {
            let mut sessions = self.sessions.write().await;
            if sessions
                .values()
                .any(|s| s.room_code == session.room_code && s.id != session.id)
            {
                return Err(StoreError::Duplicate(format!(
                    "room code {}",
                    session.room_code
                )));
            }
            sessions.insert(session.id.clone(), session.clone());
        }
        self.emit(
            Table::Sessions,
            ChangeKind::Insert,
            Some(&session.id),
            &session.id,
        );
        Ok(())
    }

    async fn get_session(&self, id: &str) -> StoreResult<Option<Session>> {
        Ok(self.sessions.read().await.get(id).cloned())
    }

    async fn find_session_by_code(&self, room_code: &str) -> StoreResult<Option<Session>> {
        Ok(self
            .sessions
            .read()
            .await
            .values()
            .find(|s| s.room_code == room_code)
            .cloned())
    }

    async fn list_sessions(&self) -> StoreResult<Vec<Session>> {
        let mut sessions: Vec<Session> = self.sessions.read().await.values().cloned().collect();
        sessions.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(sessions)
    }

    async fn update_session(&self, id: &str, mutation: SessionMutation) -> GameResult<Session> {
        let updated = {
            let mut sessions = self.sessions.write().await;
            let current = sessions
                .get(id)
                .ok_or_else(|| GameError::session_not_found(id))?;
            let mut next = current.clone();
            mutation(&mut next)?;
            next.id = current.id.clone();
            next.version = current.version + 1;
            next.updated_at = chrono::Utc::now();
            sessions.insert(id.to_string(), next.clone());
            next
        };
        self.emit(Table::Sessions, ChangeKind::Update, Some(id), id);
        Ok(updated)
    }

    async fn delete_session(&self, id: &str) -> StoreResult<bool> {
        if self.sessions.write().await.remove(id).is_none() {
            return Ok(false);
        }
        self.delete_players(id).await?;
        self.delete_hands(id).await?;
        self.delete_submissions(id, None).await?;
        self.delete_winners(id).await?;
        self.emit(Table::Sessions, ChangeKind::Delete, Some(id), id);
        Ok(true)
    }

    async fn insert_player(&self, player: Player) -> StoreResult<()> {
        self.players
            .write()
            .await
            .insert(player.id.clone(), player.clone());
        self.emit(
            Table::Players,
            ChangeKind::Insert,
            Some(&player.session_id),
            &player.id,
        );
        Ok(())
    }

    async fn get_player(&self, id: &str) -> StoreResult<Option<Player>> {
        Ok(self.players.read().await.get(id).cloned())
    }

    async fn list_players(&self, session_id: &str) -> StoreResult<Vec<Player>> {
        let mut players: Vec<Player> = self
            .players
            .read()
            .await
            .values()
            .filter(|p| p.session_id == session_id)
            .cloned()
            .collect();
        players.sort_by(|a, b| a.joined_at.cmp(&b.joined_at).then_with(|| a.id.cmp(&b.id)));
        Ok(players)
    }

    async fn update_player(&self, id: &str, mutation: PlayerMutation) -> GameResult<Player> {
        let updated = {
            let mut players = self.players.write().await;
            let current = players
                .get(id)
                .ok_or_else(|| GameError::player_not_found(id))?;
            let mut next = current.clone();
            mutation(&mut next)?;
            next.id = current.id.clone();
            next.session_id = current.session_id.clone();
            players.insert(id.to_string(), next.clone());
            next
        };
        self.emit(
            Table::Players,
            ChangeKind::Update,
            Some(&updated.session_id),
            id,
        );
        Ok(updated)
    }

    async fn delete_player(&self, id: &str) -> StoreResult<bool> {
        let Some(player) = self.players.write().await.remove(id) else {
            return Ok(false);
        };

        let removed_hand: Vec<HandCard> = {
            let mut hands = self.hands.write().await;
            let (gone, kept): (Vec<_>, Vec<_>) =
                hands.drain(..).partition(|h| h.player_id == player.id);
            *hands = kept;
            gone
        };

        let removed_submissions: Vec<SubmissionId> = {
            let mut submissions = self.submissions.write().await;
            let ids: Vec<_> = submissions
                .values()
                .filter(|s| s.player_id == player.id)
                .map(|s| s.id.clone())
                .collect();
            for sid in &ids {
                submissions.remove(sid);
            }
            ids
        };

        let session = Some(player.session_id.as_str());
        for card in &removed_hand {
            self.emit(Table::Hands, ChangeKind::Delete, session, hand_row_id(card));
        }
        for sid in &removed_submissions {
            self.emit(Table::Submissions, ChangeKind::Delete, session, sid);
        }
        self.emit(Table::Players, ChangeKind::Delete, session, &player.id);
        Ok(true)
    }

    async fn delete_players(&self, session_id: &str) -> StoreResult<usize> {
        let ids: Vec<PlayerId> = self
            .players
            .read()
            .await
            .values()
            .filter(|p| p.session_id == session_id)
            .map(|p| p.id.clone())
            .collect();
        let mut removed = 0;
        for id in ids {
            if self.delete_player(&id).await? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn insert_hand_cards(&self, cards: Vec<HandCard>) -> StoreResult<()> {
        let inserted: Vec<HandCard> = {
            let mut hands = self.hands.write().await;
            let mut inserted = Vec::with_capacity(cards.len());
            for card in cards {
                let exists = hands
                    .iter()
                    .any(|h| h.player_id == card.player_id && h.card_id == card.card_id);
                if !exists {
                    hands.push(card.clone());
                    inserted.push(card);
                }
            }
            inserted
        };
        for card in &inserted {
            self.emit(
                Table::Hands,
                ChangeKind::Insert,
                Some(&card.session_id),
                hand_row_id(card),
            );
        }
        Ok(())
    }

    async fn list_hand(&self, player_id: &str) -> StoreResult<Vec<HandCard>> {
        Ok(self
            .hands
            .read()
            .await
            .iter()
            .filter(|h| h.player_id == player_id)
            .cloned()
            .collect())
    }

    async fn list_hands(&self, session_id: &str) -> StoreResult<Vec<HandCard>> {
        Ok(self
            .hands
            .read()
            .await
            .iter()
            .filter(|h| h.session_id == session_id)
            .cloned()
            .collect())
    }

    async fn remove_hand_card(&self, player_id: &str, card_id: &str) -> StoreResult<bool> {
        let removed = {
            let mut hands = self.hands.write().await;
            let position = hands
                .iter()
                .position(|h| h.player_id == player_id && h.card_id == card_id);
            position.map(|i| hands.remove(i))
        };
        match removed {
            Some(card) => {
                self.emit(
                    Table::Hands,
                    ChangeKind::Delete,
                    Some(&card.session_id),
                    hand_row_id(&card),
                );
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn clear_new_flags(&self, player_id: &str) -> StoreResult<()> {
        let cleared: Vec<HandCard> = {
            let mut hands = self.hands.write().await;
            hands
                .iter_mut()
                .filter(|h| h.player_id == player_id && h.is_new)
                .map(|h| {
                    h.is_new = false;
                    h.clone()
                })
                .collect()
        };
        for card in &cleared {
            self.emit(
                Table::Hands,
                ChangeKind::Update,
                Some(&card.session_id),
                hand_row_id(card),
            );
        }
        Ok(())
    }

    async fn delete_hands(&self, session_id: &str) -> StoreResult<usize> {
        let removed = {
            let mut hands = self.hands.write().await;
            let before = hands.len();
            hands.retain(|h| h.session_id != session_id);
            before - hands.len()
        };
        if removed > 0 {
            self.emit(Table::Hands, ChangeKind::Delete, Some(session_id), "*");
        }
        Ok(removed)
    }

    async fn insert_card(&self, card: ResponseCard) -> StoreResult<()> {
        let id = card.id.clone();
        self.cards.write().await.insert(id.clone(), card);
        self.emit(Table::Cards, ChangeKind::Insert, None, &id);
        Ok(())
    }

    async fn get_cards(&self, ids: &[CardId]) -> StoreResult<Vec<ResponseCard>> {
        let cards = self.cards.read().await;
        Ok(ids.iter().filter_map(|id| cards.get(id).cloned()).collect())
    }

    async fn sample_active_cards(
        &self,
        excluded: &HashSet<CardId>,
        limit: usize,
    ) -> StoreResult<Vec<ResponseCard>> {
        let mut candidates: Vec<ResponseCard> = self
            .cards
            .read()
            .await
            .values()
            .filter(|c| c.active && !excluded.contains(&c.id))
            .cloned()
            .collect();
        {
            let mut rng = rand::rng();
            candidates.shuffle(&mut rng);
        }
        candidates.truncate(limit);
        Ok(candidates)
    }

    async fn insert_scenario(&self, scenario: Scenario) -> StoreResult<()> {
        self.scenarios
            .write()
            .await
            .insert(scenario.id.clone(), scenario);
        Ok(())
    }

    async fn get_scenario(&self, id: &str) -> StoreResult<Option<Scenario>> {
        Ok(self.scenarios.read().await.get(id).cloned())
    }

    async fn list_scenarios(&self, category: &str) -> StoreResult<Vec<Scenario>> {
        let mut scenarios: Vec<Scenario> = self
            .scenarios
            .read()
            .await
            .values()
            .filter(|s| s.category == category)
            .cloned()
            .collect();
        scenarios.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(scenarios)
    }

    async fn list_categories(&self) -> StoreResult<Vec<String>> {
        let categories: BTreeSet<String> = self
            .scenarios
            .read()
            .await
            .values()
            .map(|s| s.category.clone())
            .collect();
        Ok(categories.into_iter().collect())
    }

    async fn insert_submission(
        &self,
        submission: Submission,
        guard: SessionGuard,
    ) -> GameResult<()> {
        {
            // Held until the row is in, so session updates queue behind us
            let sessions = self.sessions.read().await;
            let session = sessions
                .get(&submission.session_id)
                .ok_or_else(|| GameError::session_not_found(&submission.session_id))?;
            guard(session)?;

            let mut submissions = self.submissions.write().await;
            let duplicate = submissions.values().any(|s| {
                s.session_id == submission.session_id
                    && s.player_id == submission.player_id
                    && s.round == submission.round
            });
            if duplicate {
                return Err(StoreError::Duplicate(format!(
                    "submission by {} in round {}",
                    submission.player_id, submission.round
                ))
                .into());
            }
            submissions.insert(submission.id.clone(), submission.clone());
        }
        self.emit(
            Table::Submissions,
            ChangeKind::Insert,
            Some(&submission.session_id),
            &submission.id,
        );
        Ok(())
    }

    async fn list_submissions(&self, session_id: &str, round: u32) -> StoreResult<Vec<Submission>> {
        let mut list: Vec<Submission> = self
            .submissions
            .read()
            .await
            .values()
            .filter(|s| s.session_id == session_id && s.round == round)
            .cloned()
            .collect();
        list.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(list)
    }

    async fn delete_submissions(
        &self,
        session_id: &str,
        round: Option<u32>,
    ) -> StoreResult<usize> {
        let removed = {
            let mut submissions = self.submissions.write().await;
            let before = submissions.len();
            submissions.retain(|_, s| {
                !(s.session_id == session_id && round.is_none_or(|r| s.round == r))
            });
            before - submissions.len()
        };
        if removed > 0 {
            self.emit(Table::Submissions, ChangeKind::Delete, Some(session_id), "*");
        }
        Ok(removed)
    }

    async fn append_winner(&self, record: WinnerRecord) -> StoreResult<()> {
        let (session_id, id) = (record.session_id.clone(), record.id.clone());
        self.winners.write().await.push(record);
        self.emit(Table::Winners, ChangeKind::Insert, Some(&session_id), &id);
        Ok(())
    }

    async fn list_winners(&self, session_id: &str) -> StoreResult<Vec<WinnerRecord>> {
        Ok(self
            .winners
            .read()
            .await
            .iter()
            .filter(|w| w.session_id == session_id)
            .cloned()
            .collect())
    }

    async fn delete_winners(&self, session_id: &str) -> StoreResult<usize> {
        let removed = {
            let mut winners = self.winners.write().await;
            let before = winners.len();
            winners.retain(|w| w.session_id != session_id);
            before - winners.len()
        };
        if removed > 0 {
            self.emit(Table::Winners, ChangeKind::Delete, Some(session_id), "*");
        }
        Ok(removed)
    }

    fn subscribe(&self, filter: ChangeFilter) -> Subscription {
        Subscription::new(self.changes.subscribe(), filter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Notification;

    fn session(code: &str) -> Session {
        Session::new(code.to_string(), Visibility::Public, 8)
    }

    #[tokio::test]
    async fn test_room_codes_are_unique() {
        let store = MemoryStore::new();
        store.insert_session(session("ABCDEF")).await.unwrap();

        let result = store.insert_session(session("ABCDEF")).await;
        assert!(matches!(result, Err(StoreError::Duplicate(_))));
        assert!(store.find_session_by_code("ABCDEF").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_update_session_bumps_version() {
        let store = MemoryStore::new();
        let s = session("ABCDEF");
        let id = s.id.clone();
        store.insert_session(s).await.unwrap();

        let updated = store
            .update_session(&id, Box::new(|s: &mut Session| {
                s.round = 1;
                Ok(())
            }))
            .await
            .unwrap();
        assert_eq!(updated.version, 2);
        assert_eq!(updated.round, 1);
    }

    #[tokio::test]
    async fn test_failed_mutation_writes_nothing() {
        let store = MemoryStore::new();
        let s = session("ABCDEF");
        let id = s.id.clone();
        store.insert_session(s).await.unwrap();

        let result = store
            .update_session(&id, Box::new(|s: &mut Session| {
                s.round = 9;
                Err(GameError::NotAllReady)
            }))
            .await;
        assert_eq!(result.unwrap_err(), GameError::NotAllReady);

        let stored = store.get_session(&id).await.unwrap().unwrap();
        assert_eq!(stored.round, 0);
        assert_eq!(stored.version, 1);
    }

    fn accept_any() -> SessionGuard {
        Box::new(|_: &Session| Ok(()))
    }

    #[tokio::test]
    async fn test_submission_uniqueness_per_round() {
        let store = MemoryStore::new();
        let s = session("ABCDEF");
        let sid = s.id.clone();
        store.insert_session(s).await.unwrap();
        let make = |round| Submission {
            id: ulid::Ulid::new().to_string(),
            session_id: sid.clone(),
            player_id: "p1".into(),
            round,
            content: SubmissionContent::Custom { text: "hi".into() },
        };

        store.insert_submission(make(1), accept_any()).await.unwrap();
        assert!(matches!(
            store.insert_submission(make(1), accept_any()).await,
            Err(GameError::Persistence(StoreError::Duplicate(_)))
        ));
        store.insert_submission(make(2), accept_any()).await.unwrap();
        assert_eq!(store.list_submissions(&sid, 1).await.unwrap().len(), 1);

        assert_eq!(store.delete_submissions(&sid, Some(2)).await.unwrap(), 1);
        assert_eq!(store.list_submissions(&sid, 1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_submission_guard_sees_latest_session() {
        let store = MemoryStore::new();
        let s = session("ABCDEF");
        let sid = s.id.clone();
        store.insert_session(s).await.unwrap();
        store
            .update_session(&sid, Box::new(|s: &mut Session| {
                s.phase = Phase::CategorySelection;
                Ok(())
            }))
            .await
            .unwrap();

        let submission = Submission {
            id: "sub1".into(),
            session_id: sid.clone(),
            player_id: "p1".into(),
            round: 0,
            content: SubmissionContent::Custom { text: "late".into() },
        };
        let result = store
            .insert_submission(
                submission.clone(),
                Box::new(|s: &Session| {
                    if s.phase != Phase::PlayerSubmission {
                        return Err(GameError::wrong_phase("submit a response", s.phase));
                    }
                    Ok(())
                }),
            )
            .await;
        assert_eq!(
            result.unwrap_err(),
            GameError::wrong_phase("submit a response", Phase::CategorySelection)
        );
        assert!(store.list_submissions(&sid, 0).await.unwrap().is_empty());

        let orphan = Submission {
            session_id: "gone".into(),
            ..submission
        };
        assert_eq!(
            store.insert_submission(orphan, accept_any()).await.unwrap_err(),
            GameError::session_not_found("gone")
        );
    }

    #[tokio::test]
    async fn test_delete_player_cascades() {
        let store = MemoryStore::new();
        let s = session("ABCDEF");
        let sid = s.id.clone();
        store.insert_session(s).await.unwrap();
        let player = Player::new(&sid, "Ada".into(), "owl".into());
        let pid = player.id.clone();
        store.insert_player(player).await.unwrap();
        store
            .insert_hand_cards(vec![HandCard {
                session_id: sid.clone(),
                player_id: pid.clone(),
                card_id: "c1".into(),
                is_new: false,
            }])
            .await
            .unwrap();
        store
            .insert_submission(
                Submission {
                    id: "sub1".into(),
                    session_id: sid.clone(),
                    player_id: pid.clone(),
                    round: 1,
                    content: SubmissionContent::Card {
                        card_id: "c0".into(),
                    },
                },
                accept_any(),
            )
            .await
            .unwrap();

        assert!(store.delete_player(&pid).await.unwrap());
        assert!(store.list_hand(&pid).await.unwrap().is_empty());
        assert!(store.list_submissions(&sid, 1).await.unwrap().is_empty());
        assert!(!store.delete_player(&pid).await.unwrap());
    }

    #[tokio::test]
    async fn test_sample_respects_exclusions_and_limit() {
        let store = MemoryStore::new();
        let mut ids = Vec::new();
        for i in 0..10 {
            let card = ResponseCard::new(format!("card {i}"), None);
            ids.push(card.id.clone());
            store.insert_card(card).await.unwrap();
        }
        let excluded: HashSet<CardId> = ids[..8].iter().cloned().collect();

        let sample = store.sample_active_cards(&excluded, 5).await.unwrap();
        assert_eq!(sample.len(), 2);
        assert!(sample.iter().all(|c| !excluded.contains(&c.id)));

        let sample = store.sample_active_cards(&HashSet::new(), 3).await.unwrap();
        assert_eq!(sample.len(), 3);
    }

    #[tokio::test]
    async fn test_subscription_filters_by_session() {
        let store = MemoryStore::new();
        let mut sub = store.subscribe(ChangeFilter::session("s1"));

        store
            .insert_player(Player::new("s2", "Other".into(), "cat".into()))
            .await
            .unwrap();
        let mine = Player::new("s1", "Mine".into(), "dog".into());
        store.insert_player(mine.clone()).await.unwrap();

        match sub.next().await {
            Some(Notification::Change(event)) => {
                assert_eq!(event.table, Table::Players);
                assert_eq!(event.row_id, mine.id);
            }
            other => panic!("Expected player change, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_delete_session_cascades() {
        let store = MemoryStore::new();
        let s = session("ABCDEF");
        let sid = s.id.clone();
        store.insert_session(s).await.unwrap();
        let player = Player::new(&sid, "Ada".into(), "owl".into());
        let pid = player.id.clone();
        store.insert_player(player).await.unwrap();
        store
            .insert_hand_cards(vec![HandCard {
                session_id: sid.clone(),
                player_id: pid.clone(),
                card_id: "c1".into(),
                is_new: false,
            }])
            .await
            .unwrap();
        store
            .append_winner(WinnerRecord {
                id: "w1".into(),
                session_id: sid.clone(),
                round: 1,
                winner_id: pid.clone(),
                winning_card_id: None,
                recorded_at: chrono::Utc::now(),
            })
            .await
            .unwrap();

        assert!(store.delete_session(&sid).await.unwrap());
        assert!(store.get_session(&sid).await.unwrap().is_none());
        assert!(store.find_session_by_code("ABCDEF").await.unwrap().is_none());
        assert!(store.list_players(&sid).await.unwrap().is_empty());
        assert!(store.list_hands(&sid).await.unwrap().is_empty());
        assert!(store.list_winners(&sid).await.unwrap().is_empty());
        assert!(!store.delete_session(&sid).await.unwrap());

        // The freed room code can be reused
        store.insert_session(session("ABCDEF")).await.unwrap();
    }

    #[tokio::test]
    async fn test_hand_events_hide_card_ids() {
        let store = MemoryStore::new();
        let mut sub = store.subscribe(ChangeFilter::session("s1").with_tables([Table::Hands]));
        store
            .insert_hand_cards(vec![HandCard {
                session_id: "s1".into(),
                player_id: "p1".into(),
                card_id: "secret-card".into(),
                is_new: true,
            }])
            .await
            .unwrap();
        store.remove_hand_card("p1", "secret-card").await.unwrap();

        for kind in [ChangeKind::Insert, ChangeKind::Delete] {
            match sub.next().await {
                Some(Notification::Change(event)) => {
                    assert_eq!(event.kind, kind);
                    assert_eq!(event.row_id, "p1");
                }
                other => panic!("Expected hand change, got {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_players_listed_in_join_order() {
        let store = MemoryStore::new();
        let mut first = Player::new("s1", "First".into(), "a".into());
        let mut second = Player::new("s1", "Second".into(), "b".into());
        second.joined_at = first.joined_at + chrono::Duration::seconds(1);
        first.score = 2;
        store.insert_player(second.clone()).await.unwrap();
        store.insert_player(first.clone()).await.unwrap();

        let names: Vec<_> = store
            .list_players("s1")
            .await
            .unwrap()
            .into_iter()
            .map(|p| p.name)
            .collect();
        assert_eq!(names, vec!["First", "Second"]);
    }
}
