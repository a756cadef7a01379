//! Dealing response cards out of the shared pool.
//!
//! A session's `used_response_card_ids` is the only record of which cards are
//! out. Every deal claims its picks by writing them into the *latest*
//! persisted set inside one atomic row update, and that update refuses picks
//! another deal claimed in the meantime. Two hands can therefore never end up
//! holding the same card, even when deals race on stale reads.

use rand::seq::SliceRandom;
use std::collections::HashSet;

use crate::error::{GameError, GameResult, StoreError};
use crate::store::Store;
use crate::types::{CardId, Session};

/// Candidates fetched per requested card
const OVERFETCH_FACTOR: usize = 4;
/// Floor on the candidate fetch so small deals still get a varied sample
const MIN_FETCH: usize = 16;
/// Redraws after losing a claim race before giving up
const CLAIM_ATTEMPTS: u32 = 5;

/// Outcome of a deal
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Deal {
    pub dealt: Vec<CardId>,
    /// The persisted exclusion set after the claim
    pub excluded: HashSet<CardId>,
}

impl Deal {
    /// How many requested cards could not be dealt
    pub fn shortfall(&self, requested: usize) -> usize {
        requested.saturating_sub(self.dealt.len())
    }
}

fn fetch_limit(count: usize) -> usize {
    (count * OVERFETCH_FACTOR).max(MIN_FETCH)
}

/// Deal `count` cards that are not in `excluded`.
///
/// An exhausted pool is not an error: the result simply holds fewer cards
/// (possibly none) and a warning is logged.
pub async fn deal(
    store: &dyn Store,
    session_id: &str,
    count: usize,
    excluded: &HashSet<CardId>,
) -> GameResult<Deal> {
    let mut excluded = excluded.clone();
    if count == 0 {
        return Ok(Deal {
            dealt: Vec::new(),
            excluded,
        });
    }

    for attempt in 1..=CLAIM_ATTEMPTS {
        let mut candidates: Vec<CardId> = store
            .sample_active_cards(&excluded, fetch_limit(count))
            .await?
            .into_iter()
            .map(|c| c.id)
            .collect();

        if candidates.is_empty() {
            tracing::warn!(session_id, requested = count, "Deck starvation: no cards left to deal");
            return Ok(Deal {
                dealt: Vec::new(),
                excluded,
            });
        }

        {
            let mut rng = rand::rng();
            candidates.shuffle(&mut rng);
        }
        candidates.truncate(count);

        let picked = candidates.clone();
        let claim = store
            .update_session(
                session_id,
                Box::new(move |session: &mut Session| -> GameResult<()> {
                    if picked
                        .iter()
                        .any(|id| session.used_response_card_ids.contains(id))
                    {
                        return Err(
                            StoreError::Conflict("response card already dealt".into()).into()
                        );
                    }
                    session.used_response_card_ids.extend(picked);
                    Ok(())
                }),
            )
            .await;

        match claim {
            Ok(session) => {
                if candidates.len() < count {
                    tracing::warn!(
                        session_id,
                        requested = count,
                        dealt = candidates.len(),
                        "Deck starvation: hand comes up short"
                    );
                }
                return Ok(Deal {
                    dealt: candidates,
                    excluded: session.used_response_card_ids,
                });
            }
            // Nothing was written; redraw against the fresh set
            Err(GameError::Persistence(StoreError::Conflict(_))) => {
                tracing::debug!(session_id, attempt, "Card claim collided, redrawing");
                excluded = store
                    .get_session(session_id)
                    .await?
                    .ok_or_else(|| GameError::session_not_found(session_id))?
                    .used_response_card_ids;
            }
            Err(e) => return Err(e),
        }
    }

    Err(StoreError::Conflict(format!(
        "could not claim cards for session {session_id} after {CLAIM_ATTEMPTS} attempts"
    ))
    .into())
}
