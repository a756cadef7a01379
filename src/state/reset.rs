use super::{enter, require_host, AppState};
use crate::auth::Actor;
use crate::error::{GameError, GameResult};
use crate::rotation::next_judge;
use crate::types::*;

impl AppState {
    /// Move past a finished round (judge or host).
    ///
    /// From the winner announcement the judge seat rotates and the next round
    /// begins. From game over the whole session is reset and emptied.
    pub async fn advance_round(&self, actor: &Actor) -> GameResult<Session> {
        let session = self.get_session(&actor.session_id).await?;
        if !session.is_judge(&actor.player_id) && !session.is_host(&actor.player_id) {
            return Err(GameError::NotCurrentJudge("advance the round"));
        }

        match session.phase {
            Phase::GameOver => self.full_reset(actor).await,
            Phase::WinnerAnnouncement => self.next_round(actor, &session).await,
            other => Err(GameError::wrong_phase("advance the round", other)),
        }
    }

    async fn next_round(&self, actor: &Actor, session: &Session) -> GameResult<Session> {
        let roster = self.roster(&session.id).await?;
        let rotated = next_judge(&roster, session.current_judge_id.as_deref());

        let round = session.round;
        let caller = actor.player_id.clone();
        let session = self
            .update_session(&session.id, move |s| {
                if !s.is_judge(&caller) && !s.is_host(&caller) {
                    return Err(GameError::NotCurrentJudge("advance the round"));
                }
                if s.round != round {
                    return Err(GameError::wrong_phase("advance the round", s.phase));
                }
                enter(s, "advance the round", Phase::CategorySelection)?;
                s.round += 1;
                if !s.judge_seat_inherited || s.current_judge_id.is_none() {
                    s.current_judge_id = rotated;
                }
                s.judge_seat_inherited = false;
                s.current_scenario_id = None;
                s.last_winner = None;
                s.pending_approval = None;
                Ok(())
            })
            .await?;

        tracing::info!(
            session_id = %session.id,
            round = session.round,
            judge = ?session.current_judge_id,
            "Next round"
        );
        Ok(session)
    }

    /// Tear the finished game down to an empty lobby. Everyone must rejoin;
    /// the first to do so becomes host.
    async fn full_reset(&self, actor: &Actor) -> GameResult<Session> {
        let caller = actor.player_id.clone();
        let session = self
            .update_session(&actor.session_id, move |s| {
                if !s.is_judge(&caller) && !s.is_host(&caller) {
                    return Err(GameError::NotCurrentJudge("advance the round"));
                }
                if s.phase != Phase::GameOver {
                    return Err(GameError::wrong_phase("reset the game", s.phase));
                }
                enter(s, "reset the game", Phase::Lobby)?;
                s.return_to_lobby();
                s.created_by_player_id = None;
                Ok(())
            })
            .await?;

        self.store.delete_hands(&session.id).await?;
        self.store.delete_submissions(&session.id, None).await?;
        self.store.delete_winners(&session.id).await?;
        let removed = self.store.delete_players(&session.id).await?;

        tracing::info!(session_id = %session.id, removed, "Game over, session reset");
        Ok(session)
    }

    /// Return to the lobby keeping the roster (host only)
    pub async fn reset_game(&self, actor: &Actor) -> GameResult<Session> {
        let host_id = actor.player_id.clone();
        let session = self
            .update_session(&actor.session_id, move |s| {
                require_host(s, &host_id, "reset the game")?;
                enter(s, "reset the game", Phase::Lobby)?;
                s.return_to_lobby();
                Ok(())
            })
            .await?;

        self.clear_game_rows(&session.id).await?;
        tracing::info!(session_id = %session.id, "Host reset the game");
        Ok(session)
    }

    /// Drop per-game rows after a return to the lobby; players stay, unready
    /// and back at zero.
    pub(crate) async fn clear_game_rows(&self, session_id: &str) -> GameResult<()> {
        self.store.delete_hands(session_id).await?;
        self.store.delete_submissions(session_id, None).await?;
        for player in self.roster(session_id).await? {
            self.update_player(&player.id, |p| {
                p.score = 0;
                p.is_ready = false;
                Ok(())
            })
            .await?;
        }
        Ok(())
    }
}
