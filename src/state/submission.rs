use super::{enter, require_phase, AppState};
use crate::auth::Actor;
use crate::deck;
use crate::error::{GameError, GameResult, Resource, StoreError};
use crate::protocol::SubmitRequest;
use crate::store::SessionGuard;
use crate::types::*;

/// The round the submitter saw must still be the one taking answers, and
/// they must not have inherited the judge seat since.
fn still_open(seen: &Session, player_id: &str) -> SessionGuard {
    let round = seen.round;
    let scenario = seen.current_scenario_id.clone();
    let player_id = player_id.to_string();
    Box::new(move |s: &Session| {
        require_phase(s, "submit a response", Phase::PlayerSubmission)?;
        if s.round != round || s.current_scenario_id != scenario {
            return Err(GameError::wrong_phase("submit a response", s.phase));
        }
        if s.is_judge(&player_id) {
            return Err(GameError::JudgeCannotSubmit);
        }
        Ok(())
    })
}

impl AppState {
    /// Submit a card from the hand or a custom answer for the current round
    pub async fn submit_response(
        &self,
        actor: &Actor,
        request: SubmitRequest,
    ) -> GameResult<Submission> {
        let session = self.get_session(&actor.session_id).await?;
        require_phase(&session, "submit a response", Phase::PlayerSubmission)?;
        if session.is_judge(&actor.player_id) {
            return Err(GameError::JudgeCannotSubmit);
        }

        let content = match request.into_content()? {
            SubmissionContent::Custom { text } => {
                let text = text.trim().to_string();
                if text.is_empty() {
                    return Err(GameError::InvalidInput("answer cannot be empty".into()));
                }
                if text.chars().count() > self.rules.max_custom_text_chars {
                    return Err(GameError::InvalidInput(format!(
                        "answer is longer than {} characters",
                        self.rules.max_custom_text_chars
                    )));
                }
                SubmissionContent::Custom { text }
            }
            SubmissionContent::Card { card_id } => {
                let hand = self.store.list_hand(&actor.player_id).await?;
                if !hand.iter().any(|h| h.card_id == card_id) {
                    return Err(GameError::ResourceNotFound(Resource::Card(card_id)));
                }
                SubmissionContent::Card { card_id }
            }
        };

        let already = self
            .store
            .list_submissions(&session.id, session.round)
            .await?
            .iter()
            .any(|s| s.player_id == actor.player_id);
        if already {
            return Err(GameError::AlreadySubmitted(session.round));
        }

        let submission = Submission {
            id: ulid::Ulid::new().to_string(),
            session_id: session.id.clone(),
            player_id: actor.player_id.clone(),
            round: session.round,
            content,
        };
        match self
            .store
            .insert_submission(submission.clone(), still_open(&session, &actor.player_id))
            .await
        {
            Ok(()) => {}
            // A concurrent submit from the same player won
            Err(GameError::Persistence(StoreError::Duplicate(_))) => {
                return Err(GameError::AlreadySubmitted(session.round))
            }
            Err(e) => return Err(e),
        }

        self.store.clear_new_flags(&actor.player_id).await?;
        if let SubmissionContent::Card { card_id } = &submission.content {
            self.store.remove_hand_card(&actor.player_id, card_id).await?;
            self.deal_replacement(&session, &actor.player_id).await?;
        }

        tracing::info!(
            session_id = %session.id,
            round = session.round,
            player_id = %actor.player_id,
            "Response submitted"
        );

        self.maybe_advance_to_judging(&session.id).await?;
        Ok(submission)
    }

    async fn deal_replacement(&self, session: &Session, player_id: &str) -> GameResult<()> {
        let deal = deck::deal(
            self.store.as_ref(),
            &session.id,
            1,
            &session.used_response_card_ids,
        )
        .await?;

        let cards = deal
            .dealt
            .into_iter()
            .map(|card_id| HandCard {
                session_id: session.id.clone(),
                player_id: player_id.to_string(),
                card_id,
                is_new: true,
            })
            .collect();
        self.store.insert_hand_cards(cards).await?;
        Ok(())
    }

    /// Move to judging once every live non-judge player has submitted.
    ///
    /// Counts are re-queried here rather than trusted from the caller, so
    /// concurrent submitters cannot both miss the last submission. Returns the
    /// session once it sits in judging.
    pub(crate) async fn maybe_advance_to_judging(
        &self,
        session_id: &str,
    ) -> GameResult<Option<Session>> {
        let session = self.get_session(session_id).await?;
        if session.phase != Phase::PlayerSubmission {
            return Ok(None);
        }

        let roster = self.roster(session_id).await?;
        let expected = roster
            .iter()
            .filter(|p| !session.is_judge(&p.id))
            .count();
        let submitted = self
            .store
            .list_submissions(session_id, session.round)
            .await?
            .iter()
            .filter(|s| !session.is_judge(&s.player_id))
            .filter(|s| roster.iter().any(|p| p.id == s.player_id))
            .count();

        if expected == 0 || submitted < expected {
            return Ok(None);
        }

        let round = session.round;
        let updated = self
            .update_session(session_id, move |s| {
                // Someone else already moved it on
                if s.phase != Phase::PlayerSubmission || s.round != round {
                    return Ok(());
                }
                enter(s, "start judging", Phase::Judging)
            })
            .await?;

        if updated.phase == Phase::Judging && session.phase == Phase::PlayerSubmission {
            tracing::info!(session_id, round, submitted, "All responses in, judging");
            return Ok(Some(updated));
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use super::*;
    use std::collections::HashSet;

    async fn submitting(size: usize) -> Table {
        let table = started(size).await;
        let judge = table.judge().await;
        table.state.select_category(&judge, "Animals").await.unwrap();
        table
    }

    async fn first_card(table: &Table, actor: &Actor) -> CardId {
        table.state.store.list_hand(&actor.player_id).await.unwrap()[0]
            .card_id
            .clone()
    }

    #[tokio::test]
    async fn test_judge_cannot_submit() {
        let table = submitting(3).await;
        let judge = table.judge().await;
        assert_eq!(
            table
                .state
                .submit_response(&judge, SubmitRequest::custom("hi"))
                .await
                .unwrap_err(),
            GameError::JudgeCannotSubmit
        );
    }

    #[tokio::test]
    async fn test_card_submit_replaces_card() {
        let table = submitting(3).await;
        let player = table.non_judges().await.remove(0);
        let card = first_card(&table, &player).await;

        table
            .state
            .submit_response(&player, SubmitRequest::card(card.clone()))
            .await
            .unwrap();

        let hand = table.state.store.list_hand(&player.player_id).await.unwrap();
        assert_eq!(hand.len(), table.state.rules.hand_size);
        assert!(!hand.iter().any(|h| h.card_id == card));
        assert_eq!(hand.iter().filter(|h| h.is_new).count(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_submit_rejected() {
        let table = submitting(4).await;
        let player = table.non_judges().await.remove(0);

        table
            .state
            .submit_response(&player, SubmitRequest::custom("first"))
            .await
            .unwrap();
        assert_eq!(
            table
                .state
                .submit_response(&player, SubmitRequest::custom("second"))
                .await
                .unwrap_err(),
            GameError::AlreadySubmitted(1)
        );

        let submissions = table
            .state
            .store
            .list_submissions(&table.session_id, 1)
            .await
            .unwrap();
        assert_eq!(submissions.len(), 1);
        assert_eq!(
            submissions[0].content,
            SubmissionContent::Custom {
                text: "first".into()
            }
        );
    }

    #[tokio::test]
    async fn test_card_must_be_in_hand() {
        let table = submitting(3).await;
        let players = table.non_judges().await;
        let foreign = first_card(&table, &players[1]).await;

        assert_eq!(
            table
                .state
                .submit_response(&players[0], SubmitRequest::card(foreign.clone()))
                .await
                .unwrap_err(),
            GameError::ResourceNotFound(Resource::Card(foreign))
        );
    }

    #[tokio::test]
    async fn test_custom_text_validation() {
        let table = submitting(3).await;
        let player = table.non_judges().await.remove(0);

        let long = "x".repeat(41);
        for text in ["   ", long.as_str()] {
            assert!(matches!(
                table
                    .state
                    .submit_response(&player, SubmitRequest::custom(text))
                    .await,
                Err(GameError::InvalidInput(_))
            ));
        }
    }

    #[tokio::test]
    async fn test_new_flags_clear_on_next_submit() {
        let table = submitting(3).await;
        let player = table.non_judges().await.remove(0);
        let card = first_card(&table, &player).await;
        table
            .state
            .submit_response(&player, SubmitRequest::card(card))
            .await
            .unwrap();
        assert!(table
            .state
            .store
            .list_hand(&player.player_id)
            .await
            .unwrap()
            .iter()
            .any(|h| h.is_new));

        // Next round: a custom answer still clears the flag
        table.state.store.delete_submissions(&table.session_id, None).await.unwrap();
        table
            .state
            .submit_response(&player, SubmitRequest::custom("fresh"))
            .await
            .unwrap();
        assert!(table
            .state
            .store
            .list_hand(&player.player_id)
            .await
            .unwrap()
            .iter()
            .all(|h| !h.is_new));
    }

    #[tokio::test]
    async fn test_last_submission_advances_to_judging() {
        let table = submitting(4).await;
        let players = table.non_judges().await;

        for (i, player) in players.iter().enumerate() {
            assert_eq!(table.session().await.phase, Phase::PlayerSubmission);
            table
                .state
                .submit_response(player, SubmitRequest::custom(format!("answer {i}")))
                .await
                .unwrap();
        }
        assert_eq!(table.session().await.phase, Phase::Judging);
    }

    #[tokio::test]
    async fn test_concurrent_submissions_advance_once() {
        let table = submitting(5).await;
        let mut handles = Vec::new();
        for (i, player) in table.non_judges().await.into_iter().enumerate() {
            let state = table.state.clone();
            handles.push(tokio::spawn(async move {
                state
                    .submit_response(&player, SubmitRequest::custom(format!("racing {i}")))
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let session = table.session().await;
        assert_eq!(session.phase, Phase::Judging);
        let submissions = table
            .state
            .store
            .list_submissions(&table.session_id, session.round)
            .await
            .unwrap();
        let submitters: HashSet<_> = submissions.iter().map(|s| &s.player_id).collect();
        assert_eq!(submitters.len(), 4);
    }

    #[tokio::test]
    async fn test_leaving_straggler_triggers_judging() {
        let table = submitting(4).await;
        let players = table.non_judges().await;
        for player in &players[..2] {
            table
                .state
                .submit_response(player, SubmitRequest::custom("done"))
                .await
                .unwrap();
        }
        table.state.leave(&players[2]).await.unwrap();
        assert_eq!(table.session().await.phase, Phase::Judging);
    }

    #[tokio::test]
    async fn test_judge_restart_shuts_out_stale_submissions() {
        let table = submitting(4).await;
        let stale = table.session().await;
        let old_judge = table.judge().await;

        table.state.leave(&old_judge).await.unwrap();
        let new_judge = table.judge().await;
        assert_eq!(table.session().await.phase, Phase::CategorySelection);
        assert_eq!(table.session().await.round, stale.round);

        table.state.select_category(&new_judge, "Food").await.unwrap();

        // A submit that read the session before the restart cannot land
        let late = Submission {
            id: ulid::Ulid::new().to_string(),
            session_id: table.session_id.clone(),
            player_id: new_judge.player_id.clone(),
            round: stale.round,
            content: SubmissionContent::Custom {
                text: "judge's own".into(),
            },
        };
        assert!(table
            .state
            .store
            .insert_submission(late.clone(), still_open(&stale, &new_judge.player_id))
            .await
            .is_err());

        // Even a row that slipped in is neither counted nor shown
        table
            .state
            .store
            .insert_submission(late, Box::new(|_: &Session| Ok(())))
            .await
            .unwrap();

        let players = table.non_judges().await;
        assert_eq!(players.len(), 2);
        table
            .state
            .submit_response(&players[0], SubmitRequest::custom("first"))
            .await
            .unwrap();
        assert_eq!(table.session().await.phase, Phase::PlayerSubmission);
        table
            .state
            .submit_response(&players[1], SubmitRequest::custom("second"))
            .await
            .unwrap();

        let view = table
            .state
            .view(&table.session_id, Some(&new_judge))
            .await
            .unwrap();
        assert_eq!(view.session.phase, Phase::Judging);
        assert_eq!(view.submission_count, 2);
        assert_eq!(view.submissions, vec!["first", "second"]);
        assert!(!view.player(&new_judge.player_id).unwrap().has_submitted);
    }
}
