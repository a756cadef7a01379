use std::collections::{HashMap, HashSet};

use super::AppState;
use crate::auth::Actor;
use crate::error::{GameError, GameResult};
use crate::protocol::{HandCardView, PlayerView, SessionState, SessionView};
use crate::types::*;

/// Phases in which the judge (and everyone else) sees the answers
fn answers_revealed(phase: Phase) -> bool {
    matches!(
        phase,
        Phase::Judging | Phase::JudgeApprovalPending | Phase::WinnerAnnouncement | Phase::GameOver
    )
}

impl AppState {
    /// Work out who is looking at a session.
    ///
    /// Members get their actor back. Anyone else may watch a public session
    /// as a spectator; a private session turns them away.
    pub async fn viewer(&self, token: Option<&str>, session_id: &str) -> GameResult<Option<Actor>> {
        let session = self.get_session(session_id).await?;
        match self.authorize(token, session_id).await {
            Ok(actor) => Ok(Some(actor)),
            Err(GameError::Unauthorized(reason)) if session.visibility == Visibility::Public => {
                tracing::debug!(session_id, %reason, "Spectating");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Compose everything a client renders for `viewer`
    pub async fn view(&self, session_id: &str, viewer: Option<&Actor>) -> GameResult<SessionView> {
        let session = self.get_session(session_id).await?;
        let roster = self.roster(session_id).await?;

        let scenario = match &session.current_scenario_id {
            Some(id) => self.store.get_scenario(id).await?,
            None => None,
        };

        let entries = if session.phase.in_round() {
            self.submission_texts(&session).await?
        } else {
            Vec::new()
        };
        let submitted: HashSet<&str> = entries.iter().map(|(s, _)| s.player_id.as_str()).collect();

        let players = roster
            .iter()
            .map(|p| PlayerView {
                id: p.id.clone(),
                name: p.name.clone(),
                avatar: p.avatar.clone(),
                score: p.score,
                is_ready: p.is_ready,
                is_host: session.is_host(&p.id),
                is_judge: session.is_judge(&p.id),
                has_submitted: submitted.contains(p.id.as_str()),
            })
            .collect();

        let me = viewer
            .map(|a| a.player_id.clone())
            .filter(|id| roster.iter().any(|p| p.id == *id));
        let my_role = viewer
            .filter(|_| me.is_some())
            .map(|a| a.role)
            .unwrap_or(Role::Spectator);

        let hand = match &me {
            Some(player_id) => self.hand_view(player_id).await?,
            None => Vec::new(),
        };

        let mut submissions: Vec<String> = if answers_revealed(session.phase) {
            entries.iter().map(|(_, text)| text.clone()).collect()
        } else {
            Vec::new()
        };
        submissions.sort();

        Ok(SessionView {
            session: SessionState {
                id: session.id.clone(),
                version: session.version,
                room_code: session.room_code.clone(),
                phase: session.phase,
                round: session.round,
                current_judge_id: session.current_judge_id.clone(),
                host_id: session.created_by_player_id.clone(),
                scenario,
                last_winner: session.last_winner.clone(),
                overall_winner_id: session.overall_winner_id.clone(),
                transition: session.transition.clone(),
                visibility: session.visibility,
                max_players: session.max_players,
            },
            players,
            me,
            my_role,
            hand,
            submission_count: entries.len(),
            submissions,
            pending_approval_text: session.pending_approval.map(|p| p.text),
        })
    }

    async fn hand_view(&self, player_id: &str) -> GameResult<Vec<HandCardView>> {
        let hand = self.store.list_hand(player_id).await?;
        let ids: Vec<CardId> = hand.iter().map(|h| h.card_id.clone()).collect();
        let texts: HashMap<CardId, String> = self
            .store
            .get_cards(&ids)
            .await?
            .into_iter()
            .map(|c| (c.id, c.text))
            .collect();

        Ok(hand
            .into_iter()
            .filter_map(|h| {
                texts.get(&h.card_id).map(|text| HandCardView {
                    text: text.clone(),
                    card_id: h.card_id,
                    is_new: h.is_new,
                })
            })
            .collect())
    }
}
