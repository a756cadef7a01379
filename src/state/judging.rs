use chrono::Utc;
use std::collections::HashMap;

use super::{enter, require_judge, require_phase, AppState};
use crate::auth::Actor;
use crate::error::{GameError, GameResult, Resource};
use crate::scoring::{apply_win, is_game_over};
use crate::types::*;

/// The round's result, ready to be written
struct Award {
    round: u32,
    winner_id: PlayerId,
    text: String,
    winning_card_id: Option<CardId>,
    /// Approved custom answer joining the pool
    new_card: Option<ResponseCard>,
}

impl AppState {
    /// Current-round submissions paired with the text they show. Rows from
    /// the seated judge never count as answers.
    pub(crate) async fn submission_texts(
        &self,
        session: &Session,
    ) -> GameResult<Vec<(Submission, String)>> {
        let mut submissions = self
            .store
            .list_submissions(&session.id, session.round)
            .await?;
        submissions.retain(|s| !session.is_judge(&s.player_id));
        let card_ids: Vec<CardId> = submissions
            .iter()
            .filter_map(|s| match &s.content {
                SubmissionContent::Card { card_id } => Some(card_id.clone()),
                SubmissionContent::Custom { .. } => None,
            })
            .collect();
        let cards: HashMap<CardId, String> = self
            .store
            .get_cards(&card_ids)
            .await?
            .into_iter()
            .map(|c| (c.id, c.text))
            .collect();

        Ok(submissions
            .into_iter()
            .filter_map(|s| {
                let text = match &s.content {
                    SubmissionContent::Custom { text } => Some(text.clone()),
                    SubmissionContent::Card { card_id } => cards.get(card_id).cloned(),
                }?;
                Some((s, text))
            })
            .collect())
    }

    /// Judge picks the winning answer by its text.
    ///
    /// Custom answers are matched before dealt cards when texts collide. A
    /// dealt card wins outright; a custom answer first waits for the judge to
    /// approve or reject it as a permanent card.
    pub async fn select_winner(&self, actor: &Actor, text: &str) -> GameResult<Session> {
        let session = self.get_session(&actor.session_id).await?;
        require_judge(&session, &actor.player_id, "select a winner")?;
        require_phase(&session, "select a winner", Phase::Judging)?;

        let wanted = text.trim();
        let entries = self.submission_texts(&session).await?;
        let is_custom = |s: &Submission| matches!(s.content, SubmissionContent::Custom { .. });
        let (winner, winning_text) = entries
            .iter()
            .find(|(s, t)| is_custom(s) && t.trim() == wanted)
            .or_else(|| {
                entries
                    .iter()
                    .find(|(s, t)| !is_custom(s) && t.trim() == wanted)
            })
            .cloned()
            .ok_or_else(|| GameError::ResourceNotFound(Resource::Submission(wanted.to_string())))?;

        match winner.content {
            SubmissionContent::Custom { .. } => {
                let judge_id = actor.player_id.clone();
                let pending = PendingApproval {
                    player_id: winner.player_id.clone(),
                    submission_id: winner.id.clone(),
                    text: winning_text,
                };
                let round = session.round;
                let session = self
                    .update_session(&session.id, move |s| {
                        require_judge(s, &judge_id, "select a winner")?;
                        if s.round != round {
                            return Err(GameError::wrong_phase("select a winner", s.phase));
                        }
                        enter(s, "select a winner", Phase::JudgeApprovalPending)?;
                        s.pending_approval = Some(pending);
                        Ok(())
                    })
                    .await?;
                tracing::info!(
                    session_id = %session.id,
                    round,
                    winner = %winner.player_id,
                    "Custom answer won, awaiting approval"
                );
                Ok(session)
            }
            SubmissionContent::Card { card_id } => {
                let award = Award {
                    round: session.round,
                    winner_id: winner.player_id,
                    text: winning_text,
                    winning_card_id: Some(card_id),
                    new_card: None,
                };
                self.award_round(actor, Phase::Judging, award).await
            }
        }
    }

    /// Judge approves or rejects a winning custom answer as a permanent card.
    /// The winner scores either way.
    pub async fn resolve_approval(&self, actor: &Actor, approve: bool) -> GameResult<Session> {
        let session = self.get_session(&actor.session_id).await?;
        require_judge(&session, &actor.player_id, "resolve the approval")?;
        require_phase(&session, "resolve the approval", Phase::JudgeApprovalPending)?;
        let pending = session.pending_approval.clone().ok_or_else(|| {
            GameError::ResourceNotFound(Resource::Submission("pending approval".into()))
        })?;

        let new_card =
            approve.then(|| ResponseCard::new(pending.text.clone(), Some(pending.player_id.clone())));
        let award = Award {
            round: session.round,
            winner_id: pending.player_id,
            text: pending.text,
            winning_card_id: new_card.as_ref().map(|c| c.id.clone()),
            new_card,
        };
        self.award_round(actor, Phase::JudgeApprovalPending, award).await
    }

    /// Close the round: flip the phase, then score, then record.
    ///
    /// The phase flip is the claim. Only the caller whose conditional update
    /// lands goes on to touch the score, so a retried or duplicated request
    /// cannot score twice.
    async fn award_round(&self, actor: &Actor, from: Phase, award: Award) -> GameResult<Session> {
        let winner = self.store.get_player(&award.winner_id).await?;
        let new_score = winner.as_ref().map(|p| apply_win(p.score));
        let game_over = new_score.is_some_and(|score| is_game_over(score, self.rules.win_threshold));
        let to = if game_over {
            Phase::GameOver
        } else {
            Phase::WinnerAnnouncement
        };

        let judge_id = actor.player_id.clone();
        let round = award.round;
        let last_winner = LastWinner {
            player_id: award.winner_id.clone(),
            text: award.text.clone(),
        };
        let overall = game_over.then(|| award.winner_id.clone());
        let session = self
            .update_session(&actor.session_id, move |s| {
                require_judge(s, &judge_id, "close the round")?;
                if s.phase != from || s.round != round {
                    return Err(GameError::wrong_phase("close the round", s.phase));
                }
                enter(s, "close the round", to)?;
                s.last_winner = Some(last_winner);
                s.pending_approval = None;
                s.overall_winner_id = overall;
                Ok(())
            })
            .await?;

        if let Some(card) = award.new_card {
            tracing::info!(session_id = %session.id, card_id = %card.id, "Custom answer joins the deck");
            self.store.insert_card(card).await?;
        }

        let scored = match winner {
            Some(_) => {
                let scoring = self
                    .update_player(&award.winner_id, |p| {
                        p.score = apply_win(p.score);
                        Ok(())
                    })
                    .await;
                match scoring {
                    Ok(_) => true,
                    // Left after the claim; the round still gets its record
                    Err(GameError::ResourceNotFound(Resource::Player(_))) => false,
                    Err(e) => return Err(e),
                }
            }
            None => false,
        };
        if !scored {
            tracing::warn!(
                session_id = %session.id,
                winner = %award.winner_id,
                "Round winner already left, score skipped"
            );
        }

        self.store
            .append_winner(WinnerRecord {
                id: ulid::Ulid::new().to_string(),
                session_id: session.id.clone(),
                round,
                winner_id: award.winner_id.clone(),
                winning_card_id: award.winning_card_id,
                recorded_at: Utc::now(),
            })
            .await?;

        tracing::info!(
            session_id = %session.id,
            round,
            winner = %award.winner_id,
            score = ?new_score,
            game_over,
            "Round closed"
        );
        Ok(session)
    }
}
