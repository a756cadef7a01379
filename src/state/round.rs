use rand::seq::IndexedRandom;
use std::collections::HashSet;

use super::{enter, require_host, require_judge, require_phase, AppState};
use crate::auth::Actor;
use crate::deck;
use crate::error::{GameError, GameResult, Resource};
use crate::types::*;

impl AppState {
    /// Start the game (host only).
    ///
    /// The first player to ready up judges round one. Every player is topped
    /// up to a full hand while the session reports itself busy.
    pub async fn start_game(&self, actor: &Actor) -> GameResult<Session> {
        let session = self.get_session(&actor.session_id).await?;
        require_host(&session, &actor.player_id, "start the game")?;
        require_phase(&session, "start the game", Phase::Lobby)?;

        let roster = self.roster(&session.id).await?;
        if roster.len() < self.rules.min_players {
            return Err(GameError::InsufficientPlayers {
                required: self.rules.min_players,
                actual: roster.len(),
            });
        }
        if roster.iter().any(|p| !p.is_ready) {
            return Err(GameError::NotAllReady);
        }

        let live: HashSet<&str> = roster.iter().map(|p| p.id.as_str()).collect();
        let judge = session
            .ready_player_order
            .iter()
            .find(|id| live.contains(id.as_str()))
            .cloned()
            .unwrap_or_else(|| roster[0].id.clone());

        let host_id = actor.player_id.clone();
        let first_judge = judge.clone();
        let session = self
            .update_session(&session.id, move |s| {
                require_host(s, &host_id, "start the game")?;
                enter(s, "start the game", Phase::CategorySelection)?;
                s.round = 1;
                s.current_judge_id = Some(first_judge);
                s.current_scenario_id = None;
                s.last_winner = None;
                s.pending_approval = None;
                s.overall_winner_id = None;
                s.transition = TransitionState::busy("Dealing cards");
                Ok(())
            })
            .await?;

        tracing::info!(
            session_id = %session.id,
            players = roster.len(),
            judge = %judge,
            "Game started"
        );

        if let Err(e) = self.deal_opening_hands(&session, &roster).await {
            tracing::error!(session_id = %session.id, "Dealing failed, back to lobby: {}", e);
            self.abort_start(&session.id).await?;
            return Err(e);
        }

        self.update_session(&session.id, |s| {
            s.transition = TransitionState::Idle;
            Ok(())
        })
        .await
    }

    /// Undo a start whose deal failed. Ready flags and order survive so the
    /// host can simply try again.
    async fn abort_start(&self, session_id: &str) -> GameResult<()> {
        self.update_session(session_id, |s| {
            if s.phase != Phase::Lobby {
                let ready_order = std::mem::take(&mut s.ready_player_order);
                enter(s, "abort the start", Phase::Lobby)?;
                s.return_to_lobby();
                s.ready_player_order = ready_order;
            }
            Ok(())
        })
        .await?;
        self.store.delete_hands(session_id).await?;
        Ok(())
    }

    async fn deal_opening_hands(&self, session: &Session, roster: &[Player]) -> GameResult<()> {
        let mut excluded = session.used_response_card_ids.clone();
        for player in roster {
            let held = self.store.list_hand(&player.id).await?.len();
            let need = self.rules.hand_size.saturating_sub(held);
            let deal = deck::deal(self.store.as_ref(), &session.id, need, &excluded).await?;
            excluded = deal.excluded;

            let cards = deal
                .dealt
                .into_iter()
                .map(|card_id| HandCard {
                    session_id: session.id.clone(),
                    player_id: player.id.clone(),
                    card_id,
                    is_new: false,
                })
                .collect();
            self.store.insert_hand_cards(cards).await?;
        }
        Ok(())
    }

    /// Judge picks the round's category; a scenario is drawn from it.
    ///
    /// Scenarios don't repeat within a session until the category runs dry,
    /// at which point the category's pool is recycled.
    pub async fn select_category(&self, actor: &Actor, category: &str) -> GameResult<Session> {
        let session = self.get_session(&actor.session_id).await?;
        require_judge(&session, &actor.player_id, "select a category")?;
        require_phase(&session, "select a category", Phase::CategorySelection)?;

        let scenarios = self.store.list_scenarios(category.trim()).await?;
        if scenarios.is_empty() {
            return Err(GameError::ResourceNotFound(Resource::Category(
                category.to_string(),
            )));
        }

        let unused: Vec<&Scenario> = scenarios
            .iter()
            .filter(|s| !session.used_scenario_ids.contains(&s.id))
            .collect();
        let recycled = unused.is_empty();
        let scenario = {
            let mut rng = rand::rng();
            if recycled {
                scenarios.choose(&mut rng).cloned()
            } else {
                unused.choose(&mut rng).map(|s| (*s).clone())
            }
        }
        .ok_or_else(|| GameError::ResourceNotFound(Resource::Category(category.to_string())))?;

        if recycled {
            tracing::info!(
                session_id = %session.id,
                category,
                "Category exhausted, recycling its scenarios"
            );
        }

        let judge_id = actor.player_id.clone();
        let category_ids: Vec<ScenarioId> = scenarios.iter().map(|s| s.id.clone()).collect();
        let chosen = scenario.id.clone();
        let session = self
            .update_session(&session.id, move |s| {
                require_judge(s, &judge_id, "select a category")?;
                enter(s, "select a category", Phase::PlayerSubmission)?;
                if recycled {
                    for id in &category_ids {
                        s.used_scenario_ids.remove(id);
                    }
                }
                s.used_scenario_ids.insert(chosen.clone());
                s.current_scenario_id = Some(chosen);
                Ok(())
            })
            .await?;

        tracing::info!(
            session_id = %session.id,
            round = session.round,
            scenario = %scenario.text,
            "Scenario drawn"
        );
        Ok(session)
    }
}
