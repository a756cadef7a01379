//! Error taxonomy shared by the store, the engine and the HTTP surface.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use std::fmt;

use crate::protocol::ErrorBody;
use crate::types::Phase;

pub type GameResult<T> = Result<T, GameError>;
pub type StoreResult<T> = Result<T, StoreError>;

/// Failures raised by a [`crate::store::Store`] implementation
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// A conditional write lost against a concurrent writer; nothing was written
    #[error("write conflict on {0}")]
    Conflict(String),

    /// A uniqueness constraint rejected the row
    #[error("duplicate row: {0}")]
    Duplicate(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Why an authorization check failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthFailure {
    MissingToken,
    Malformed,
    InvalidSignature,
    Expired,
    SessionMismatch,
    NotAMember,
}

impl AuthFailure {
    pub fn as_str(self) -> &'static str {
        match self {
            AuthFailure::MissingToken => "missing_token",
            AuthFailure::Malformed => "malformed_token",
            AuthFailure::InvalidSignature => "invalid_signature",
            AuthFailure::Expired => "token_expired",
            AuthFailure::SessionMismatch => "session_mismatch",
            AuthFailure::NotAMember => "not_a_member",
        }
    }
}

impl fmt::Display for AuthFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Missing resource kinds
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resource {
    Session(String),
    Player(String),
    Card(String),
    Category(String),
    Submission(String),
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Resource::Session(id) => write!(f, "session {id}"),
            Resource::Player(id) => write!(f, "player {id}"),
            Resource::Card(id) => write!(f, "card {id}"),
            Resource::Category(name) => write!(f, "category {name:?}"),
            Resource::Submission(what) => write!(f, "submission {what:?}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum GameError {
    #[error("unauthorized: {0}")]
    Unauthorized(AuthFailure),

    #[error("cannot {action} during {actual:?}")]
    WrongPhase { action: &'static str, actual: Phase },

    #[error("only the current judge can {0}")]
    NotCurrentJudge(&'static str),

    #[error("only the host can {0}")]
    NotHost(&'static str),

    #[error("players can only {0} for themselves")]
    NotSelf(&'static str),

    #[error("the judge does not submit a response")]
    JudgeCannotSubmit,

    #[error("already submitted for round {0}")]
    AlreadySubmitted(u32),

    #[error("need at least {required} players, have {actual}")]
    InsufficientPlayers { required: usize, actual: usize },

    #[error("not all players are ready")]
    NotAllReady,

    #[error("session is full ({0} players)")]
    SessionFull(u32),

    #[error("{0} not found")]
    ResourceNotFound(Resource),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Fatal: the room code space is too crowded for the retry budget
    #[error("no unique room code after {0} attempts")]
    RoomCodeExhausted(u32),

    #[error(transparent)]
    Persistence(#[from] StoreError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl GameError {
    pub fn wrong_phase(action: &'static str, actual: Phase) -> Self {
        Self::WrongPhase { action, actual }
    }

    pub fn session_not_found(id: &str) -> Self {
        Self::ResourceNotFound(Resource::Session(id.to_string()))
    }

    pub fn player_not_found(id: &str) -> Self {
        Self::ResourceNotFound(Resource::Player(id.to_string()))
    }

    /// Stable machine-readable code sent to clients
    pub fn code(&self) -> &'static str {
        match self {
            GameError::Unauthorized(_) => "UNAUTHORIZED",
            GameError::WrongPhase { .. } => "WRONG_PHASE",
            GameError::NotCurrentJudge(_) => "NOT_CURRENT_JUDGE",
            GameError::NotHost(_) => "NOT_HOST",
            GameError::NotSelf(_) => "NOT_SELF",
            GameError::JudgeCannotSubmit => "JUDGE_CANNOT_SUBMIT",
            GameError::AlreadySubmitted(_) => "ALREADY_SUBMITTED",
            GameError::InsufficientPlayers { .. } => "INSUFFICIENT_PLAYERS",
            GameError::NotAllReady => "NOT_ALL_READY",
            GameError::SessionFull(_) => "SESSION_FULL",
            GameError::ResourceNotFound(_) => "NOT_FOUND",
            GameError::InvalidInput(_) => "INVALID_INPUT",
            GameError::RoomCodeExhausted(_) => "ROOM_CODE_EXHAUSTED",
            GameError::Persistence(_) => "PERSISTENCE_ERROR",
            GameError::Internal(_) => "INTERNAL",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            GameError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            GameError::NotCurrentJudge(_) | GameError::NotHost(_) | GameError::NotSelf(_) => {
                StatusCode::FORBIDDEN
            }
            GameError::WrongPhase { .. }
            | GameError::JudgeCannotSubmit
            | GameError::AlreadySubmitted(_)
            | GameError::InsufficientPlayers { .. }
            | GameError::NotAllReady
            | GameError::SessionFull(_) => StatusCode::CONFLICT,
            GameError::ResourceNotFound(_) => StatusCode::NOT_FOUND,
            GameError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            GameError::RoomCodeExhausted(_) => StatusCode::SERVICE_UNAVAILABLE,
            GameError::Persistence(StoreError::Conflict(_)) => StatusCode::CONFLICT,
            GameError::Persistence(_) | GameError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for GameError {
    fn into_response(self) -> Response {
        if self.status().is_server_error() {
            tracing::error!(code = self.code(), "Request failed: {}", self);
        } else {
            tracing::debug!(code = self.code(), "Request rejected: {}", self);
        }
        let body = ErrorBody {
            code: self.code().to_string(),
            msg: self.to_string(),
        };
        (self.status(), Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes_and_statuses() {
        let err = GameError::Unauthorized(AuthFailure::Expired);
        assert_eq!(err.code(), "UNAUTHORIZED");
        assert_eq!(err.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(err.to_string(), "unauthorized: token_expired");

        let err = GameError::wrong_phase("select a category", Phase::Lobby);
        assert_eq!(err.status(), StatusCode::CONFLICT);
        assert!(err.to_string().contains("Lobby"));

        let err = GameError::from(StoreError::Unavailable("disk".into()));
        assert_eq!(err.code(), "PERSISTENCE_ERROR");
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_resource_display() {
        let err = GameError::ResourceNotFound(Resource::Category("Movies".into()));
        assert_eq!(err.to_string(), "category \"Movies\" not found");
    }
}
