use chrono::Utc;
use std::time::Duration;

use super::{enter, require_host, require_phase, AppState};
use crate::auth::{self, resolve_role, Actor};
use crate::error::{GameError, GameResult, Resource};
use crate::protocol::{CreateSessionRequest, Identity, JoinSessionRequest, SessionSummary};
use crate::room_code::{
    generate_room_code, insert_with_unique_code, is_valid_room_code, normalize_room_code,
};
use crate::rotation::next_judge;
use crate::types::*;

const MAX_NAME_CHARS: usize = 24;
const MAX_AVATAR_CHARS: usize = 16;

/// A player who just entered a session, with their fresh token
#[derive(Debug, Clone)]
pub struct Joined {
    pub session: Session,
    pub player: Player,
    pub role: Role,
    pub token: String,
}

/// Trim and cap a display name; blank names get a generated one
fn display_name(raw: &str) -> String {
    let name: String = raw.trim().chars().take(MAX_NAME_CHARS).collect();
    if !name.is_empty() {
        return name;
    }
    petname::petname(2, " ").unwrap_or_else(|| "Mystery Guest".to_string())
}

fn avatar(raw: &str) -> String {
    raw.trim().chars().take(MAX_AVATAR_CHARS).collect()
}

impl AppState {
    /// Create a session with the caller as its host
    pub async fn create_session(&self, req: CreateSessionRequest) -> GameResult<Joined> {
        let floor = (self.rules.min_players as u32).min(MAX_PLAYERS_LIMIT);
        let max_players = req
            .max_players
            .unwrap_or(self.rules.default_max_players)
            .clamp(floor, MAX_PLAYERS_LIMIT);

        let mut session = Session::new(
            String::new(),
            req.visibility.unwrap_or_default(),
            max_players,
        );
        let host = Player::new(&session.id, display_name(&req.name), avatar(&req.avatar));
        session.created_by_player_id = Some(host.id.clone());

        let session =
            insert_with_unique_code(self.store.as_ref(), session, generate_room_code).await?;
        self.store.insert_player(host.clone()).await?;

        tracing::info!(
            session_id = %session.id,
            room_code = %session.room_code,
            host = %host.name,
            "Session created"
        );
        self.joined(session, host)
    }

    /// Join a lobby by room code
    pub async fn join_session(&self, req: JoinSessionRequest) -> GameResult<Joined> {
        let code = normalize_room_code(&req.room_code);
        if !is_valid_room_code(&code) {
            return Err(GameError::InvalidInput(format!(
                "{:?} is not a room code",
                req.room_code
            )));
        }
        let session = self
            .store
            .find_session_by_code(&code)
            .await?
            .ok_or_else(|| GameError::ResourceNotFound(Resource::Session(code.clone())))?;
        require_phase(&session, "join", Phase::Lobby)?;

        let roster = self.roster(&session.id).await?;
        if roster.len() >= session.max_players as usize {
            return Err(GameError::SessionFull(session.max_players));
        }

        let player = Player::new(&session.id, display_name(&req.name), avatar(&req.avatar));
        self.store.insert_player(player.clone()).await?;

        // Concurrent joins can overshoot the pre-check
        let roster = self.roster(&session.id).await?;
        let seat = roster.iter().position(|p| p.id == player.id);
        if seat.is_none_or(|seat| seat >= session.max_players as usize) {
            self.store.delete_player(&player.id).await?;
            return Err(GameError::SessionFull(session.max_players));
        }

        // A session emptied by a full reset adopts its first newcomer as host
        let candidate = player.id.clone();
        let session = self
            .update_session(&session.id, move |s| {
                if s.created_by_player_id.is_none() {
                    s.created_by_player_id = Some(candidate);
                }
                Ok(())
            })
            .await?;

        tracing::info!(
            session_id = %session.id,
            player_id = %player.id,
            name = %player.name,
            "Player joined"
        );
        self.joined(session, player)
    }

    fn joined(&self, session: Session, player: Player) -> GameResult<Joined> {
        let role = resolve_role(&session, Some(&player));
        let token = auth::issue_token(&self.auth, &player.id, &session.id, role, Utc::now())?;
        Ok(Joined {
            session,
            player,
            role,
            token,
        })
    }

    /// Server-verified identity behind a token
    pub async fn identity(&self, token: Option<&str>) -> GameResult<(Identity, Actor)> {
        let (actor, player, session) =
            auth::identify(self.store.as_ref(), &self.auth, token).await?;
        let identity = Identity {
            player_id: player.id,
            session_id: session.id,
            room_code: session.room_code,
            name: player.name,
            avatar: player.avatar,
            role: actor.role,
        };
        Ok((identity, actor))
    }

    /// Mark a player ready or not. Ready order seeds the first judge.
    pub async fn set_ready(&self, actor: &Actor, player_id: &str, ready: bool) -> GameResult<Player> {
        if actor.player_id != player_id {
            return Err(GameError::NotSelf("change readiness"));
        }

        let id = player_id.to_string();
        self.update_session(&actor.session_id, move |s| {
            require_phase(s, "change readiness", Phase::Lobby)?;
            s.ready_player_order.retain(|p| *p != id);
            if ready {
                s.ready_player_order.push(id);
            }
            Ok(())
        })
        .await?;

        let player = self
            .update_player(player_id, move |p| {
                p.is_ready = ready;
                Ok(())
            })
            .await?;

        tracing::debug!(session_id = %actor.session_id, player_id, ready, "Readiness changed");
        Ok(player)
    }

    /// Leave the session
    pub async fn leave(&self, actor: &Actor) -> GameResult<()> {
        self.remove_player(&actor.session_id, &actor.player_id).await?;
        tracing::info!(session_id = %actor.session_id, player_id = %actor.player_id, "Player left");
        Ok(())
    }

    /// Remove another player (host only)
    pub async fn kick(&self, actor: &Actor, player_id: &str) -> GameResult<()> {
        let session = self.get_session(&actor.session_id).await?;
        require_host(&session, &actor.player_id, "kick players")?;
        if actor.player_id == player_id {
            return Err(GameError::InvalidInput(
                "the host cannot kick themselves; leave instead".into(),
            ));
        }
        let target = self
            .store
            .get_player(player_id)
            .await?
            .filter(|p| p.session_id == session.id)
            .ok_or_else(|| GameError::player_not_found(player_id))?;

        self.remove_player(&session.id, &target.id).await?;
        tracing::info!(session_id = %session.id, player_id, name = %target.name, "Player kicked");
        Ok(())
    }

    /// Drop a player and repair everything that pointed at them.
    ///
    /// The store cascades the hand and submissions. Host and judge duties move
    /// on, and a roster that falls below the minimum mid-game collapses the
    /// session back to the lobby.
    async fn remove_player(&self, session_id: &str, player_id: &str) -> GameResult<()> {
        let before = self.roster(session_id).await?;
        if !self.store.delete_player(player_id).await? {
            return Err(GameError::player_not_found(player_id));
        }
        let after = self.roster(session_id).await?;

        let departed = player_id.to_string();
        let next_host = after.first().map(|p| p.id.clone());
        let next_judge = next_judge(&before, Some(player_id)).filter(|id| *id != departed);
        let min_players = self.rules.min_players;
        let remaining = after.len();

        let prior = self.get_session(session_id).await?;
        let session = self
            .update_session(session_id, move |s| {
                s.ready_player_order.retain(|p| *p != departed);
                if s.is_host(&departed) {
                    s.created_by_player_id = next_host;
                }

                if s.phase.in_round() && remaining < min_players {
                    enter(s, "continue with too few players", Phase::Lobby)?;
                    s.return_to_lobby();
                } else if s.is_judge(&departed) {
                    s.current_judge_id = next_judge;
                    s.judge_seat_inherited =
                        matches!(s.phase, Phase::WinnerAnnouncement | Phase::GameOver);
                    if matches!(
                        s.phase,
                        Phase::PlayerSubmission | Phase::Judging | Phase::JudgeApprovalPending
                    ) {
                        enter(s, "restart the round", Phase::CategorySelection)?;
                        s.current_scenario_id = None;
                        s.pending_approval = None;
                    }
                }
                Ok(())
            })
            .await?;

        if prior.phase.in_round() && session.phase == Phase::Lobby {
            tracing::info!(session_id, remaining, "Roster below minimum, back to lobby");
            self.clear_game_rows(session_id).await?;
        } else if prior.is_judge(player_id) && session.phase == Phase::CategorySelection {
            tracing::info!(
                session_id,
                next_judge = ?session.current_judge_id,
                "Judge left, round restarts"
            );
            self.store
                .delete_submissions(session_id, Some(session.round))
                .await?;
        } else if session.phase == Phase::PlayerSubmission {
            // The departed player may have been the last one we were waiting on
            self.maybe_advance_to_judging(session_id).await?;
        }
        Ok(())
    }

    /// Public sessions still accepting players
    pub async fn list_public_sessions(&self) -> GameResult<Vec<SessionSummary>> {
        let mut summaries = Vec::new();
        for session in self.store.list_sessions().await? {
            if session.visibility != Visibility::Public || session.phase != Phase::Lobby {
                continue;
            }
            let player_count = self.store.list_players(&session.id).await?.len();
            summaries.push(SessionSummary {
                id: session.id,
                room_code: session.room_code,
                player_count,
                max_players: session.max_players,
                created_at: session.created_at,
            });
        }
        Ok(summaries)
    }

    pub async fn categories(&self) -> GameResult<Vec<String>> {
        Ok(self.store.list_categories().await?)
    }

    /// Evict sessions nobody is using.
    ///
    /// A session with an empty roster goes once it has been quiet for
    /// `empty_ttl`; any other session goes after `idle_ttl` without a state
    /// change. Returns how many were removed.
    pub async fn prune_idle_sessions(
        &self,
        empty_ttl: Duration,
        idle_ttl: Duration,
    ) -> GameResult<usize> {
        let now = Utc::now();
        let mut evicted = 0;
        for session in self.store.list_sessions().await? {
            let idle = (now - session.updated_at).to_std().unwrap_or_default();
            let expired = if idle >= idle_ttl {
                true
            } else if idle >= empty_ttl {
                self.store.list_players(&session.id).await?.is_empty()
            } else {
                false
            };
            if !expired {
                continue;
            }

            if self.store.delete_session(&session.id).await? {
                evicted += 1;
                tracing::info!(
                    session_id = %session.id,
                    room_code = %session.room_code,
                    idle_secs = idle.as_secs(),
                    "Session evicted"
                );
            }
        }
        Ok(evicted)
    }
}
