mod judging;
mod lobby;
mod reset;
mod round;
mod submission;
mod view;

pub use lobby::Joined;

use chrono::Utc;
use std::sync::Arc;

use crate::auth::{self, Actor, AuthConfig};
use crate::error::{GameError, GameResult};
use crate::store::{MemoryStore, Store};
use crate::types::*;

/// Shared application state.
///
/// Holds no game data of its own: every operation reads the latest rows from
/// the store and writes back through validated atomic updates, so any number
/// of `AppState` handles over the same store stay consistent.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub rules: GameRules,
    pub auth: AuthConfig,
}

impl AppState {
    pub fn new(store: Arc<dyn Store>, rules: GameRules, auth: AuthConfig) -> Self {
        Self { store, rules, auth }
    }

    /// Fresh state over an empty in-memory store
    pub fn in_memory(rules: GameRules, auth: AuthConfig) -> Self {
        Self::new(Arc::new(MemoryStore::new()), rules, auth)
    }

    /// Validate a session token for an operation on `session_id`
    pub async fn authorize(&self, token: Option<&str>, session_id: &str) -> GameResult<Actor> {
        auth::authorize(self.store.as_ref(), &self.auth, token, session_id).await
    }

    /// Mint a token carrying the actor's current role
    pub fn token_for(&self, actor: &Actor) -> GameResult<String> {
        auth::issue_token(
            &self.auth,
            &actor.player_id,
            &actor.session_id,
            actor.role,
            Utc::now(),
        )
    }

    pub async fn get_session(&self, session_id: &str) -> GameResult<Session> {
        self.store
            .get_session(session_id)
            .await?
            .ok_or_else(|| GameError::session_not_found(session_id))
    }

    /// Live roster in join order
    pub async fn roster(&self, session_id: &str) -> GameResult<Vec<Player>> {
        Ok(self.store.list_players(session_id).await?)
    }

    /// Read-validate-write on the latest session row
    async fn update_session<F>(&self, session_id: &str, mutation: F) -> GameResult<Session>
    where
        F: FnOnce(&mut Session) -> GameResult<()> + Send + 'static,
    {
        self.store.update_session(session_id, Box::new(mutation)).await
    }

    async fn update_player<F>(&self, player_id: &str, mutation: F) -> GameResult<Player>
    where
        F: FnOnce(&mut Player) -> GameResult<()> + Send + 'static,
    {
        self.store.update_player(player_id, Box::new(mutation)).await
    }
}

/// Move to `to` if the phase table allows it
fn enter(session: &mut Session, action: &'static str, to: Phase) -> GameResult<()> {
    if !session.phase.can_transition_to(to) {
        return Err(GameError::wrong_phase(action, session.phase));
    }
    session.phase = to;
    Ok(())
}

fn require_phase(session: &Session, action: &'static str, expected: Phase) -> GameResult<()> {
    if session.phase != expected {
        return Err(GameError::wrong_phase(action, session.phase));
    }
    Ok(())
}

fn require_judge(session: &Session, player_id: &str, action: &'static str) -> GameResult<()> {
    if !session.is_judge(player_id) {
        return Err(GameError::NotCurrentJudge(action));
    }
    Ok(())
}

fn require_host(session: &Session, player_id: &str, action: &'static str) -> GameResult<()> {
    if !session.is_host(player_id) {
        return Err(GameError::NotHost(action));
    }
    Ok(())
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;

    #[test]
    fn test_enter_respects_phase_table() {
        let mut session = Session::new("ENTERA".into(), Visibility::Public, 8);
        assert!(enter(&mut session, "start the game", Phase::CategorySelection).is_ok());
        assert_eq!(session.phase, Phase::CategorySelection);

        let err = enter(&mut session, "pick a winner", Phase::WinnerAnnouncement).unwrap_err();
        assert_eq!(
            err,
            GameError::wrong_phase("pick a winner", Phase::CategorySelection)
        );
        assert_eq!(session.phase, Phase::CategorySelection);
    }

    #[tokio::test]
    async fn test_handles_share_one_store() {
        let table = lobby(2).await;
        let other = AppState::new(
            table.state.store.clone(),
            table.state.rules.clone(),
            table.state.auth.clone(),
        );

        let actor = other
            .authorize(Some(&table.tokens[1]), &table.session_id)
            .await
            .unwrap();
        assert_eq!(actor.player_id, table.players[1].id);
        assert_eq!(other.roster(&table.session_id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_token_for_reflects_current_role() {
        let table = started(3).await;
        let judge = table.judge().await;
        assert_eq!(judge.role, Role::Judge);

        let token = table.state.token_for(&judge).unwrap();
        let claims = auth::verify_token(&table.state.auth, &token).unwrap();
        assert_eq!(claims.role, Role::Judge);
        assert_eq!(claims.sub, judge.player_id);
    }
}
