use crate::error::{GameError, GameResult};
use crate::store::ChangeEvent;
use crate::types::*;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Error payload shared by the HTTP API and the WebSocket feed
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorBody {
    pub code: String,
    pub msg: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateSessionRequest {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub avatar: String,
    #[serde(default)]
    pub visibility: Option<Visibility>,
    #[serde(default)]
    pub max_players: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinSessionRequest {
    pub room_code: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub avatar: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadyRequest {
    pub ready: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KickRequest {
    pub player_id: PlayerId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CategoryRequest {
    pub category: String,
}

/// Either a card from the hand or a custom answer, never both
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubmitRequest {
    #[serde(default)]
    pub card_id: Option<CardId>,
    #[serde(default)]
    pub custom_text: Option<String>,
}

impl SubmitRequest {
    pub fn card(card_id: impl Into<CardId>) -> Self {
        Self {
            card_id: Some(card_id.into()),
            custom_text: None,
        }
    }

    pub fn custom(text: impl Into<String>) -> Self {
        Self {
            card_id: None,
            custom_text: Some(text.into()),
        }
    }

    pub fn into_content(self) -> GameResult<SubmissionContent> {
        match (self.card_id, self.custom_text) {
            (Some(card_id), None) => Ok(SubmissionContent::Card { card_id }),
            (None, Some(text)) => Ok(SubmissionContent::Custom { text }),
            (Some(_), Some(_)) => Err(GameError::InvalidInput(
                "submit either a card or a custom answer, not both".into(),
            )),
            (None, None) => Err(GameError::InvalidInput(
                "submission needs a card_id or custom_text".into(),
            )),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WinnerRequest {
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub approve: bool,
}

/// Server-verified identity of the caller
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Identity {
    pub player_id: PlayerId,
    pub session_id: SessionId,
    pub room_code: String,
    pub name: String,
    pub avatar: String,
    pub role: Role,
}

/// Lobby listing entry
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionSummary {
    pub id: SessionId,
    pub room_code: String,
    pub player_count: usize,
    pub max_players: u32,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionState {
    pub id: SessionId,
    pub version: u64,
    pub room_code: String,
    pub phase: Phase,
    pub round: u32,
    pub current_judge_id: Option<PlayerId>,
    pub host_id: Option<PlayerId>,
    /// Resolved current scenario
    pub scenario: Option<Scenario>,
    pub last_winner: Option<LastWinner>,
    pub overall_winner_id: Option<PlayerId>,
    pub transition: TransitionState,
    pub visibility: Visibility,
    pub max_players: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PlayerView {
    pub id: PlayerId,
    pub name: String,
    pub avatar: String,
    pub score: u32,
    pub is_ready: bool,
    pub is_host: bool,
    pub is_judge: bool,
    pub has_submitted: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HandCardView {
    pub card_id: CardId,
    pub text: String,
    pub is_new: bool,
}

/// Everything a client renders, composed from the session's rows
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionView {
    pub session: SessionState,
    pub players: Vec<PlayerView>,
    pub me: Option<PlayerId>,
    pub my_role: Role,
    pub hand: Vec<HandCardView>,
    pub submission_count: usize,
    /// Unattributed answer texts, sorted; empty before judging
    pub submissions: Vec<String>,
    pub pending_approval_text: Option<String>,
}

impl SessionView {
    pub fn player(&self, id: &str) -> Option<&PlayerView> {
        self.players.iter().find(|p| p.id == id)
    }
}

/// Messages pushed over the change feed
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "t", rename_all = "snake_case")]
pub enum ServerMessage {
    Welcome {
        session_id: SessionId,
        server_now: String,
    },
    Change {
        event: ChangeEvent,
    },
    /// Events were dropped; refetch everything
    Resync {
        missed: u64,
    },
    Error {
        code: String,
        msg: String,
    },
}

impl From<&GameError> for ServerMessage {
    fn from(err: &GameError) -> Self {
        ServerMessage::Error {
            code: err.code().to_string(),
            msg: err.to_string(),
        }
    }
}
