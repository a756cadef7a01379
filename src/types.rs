use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Opaque ID types for type safety
pub type SessionId = String;
pub type PlayerId = String;
pub type CardId = String;
pub type ScenarioId = String;
pub type SubmissionId = String;
pub type WinnerId = String;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Lobby,
    CategorySelection,
    PlayerSubmission,
    Judging,
    JudgeApprovalPending,
    WinnerAnnouncement,
    GameOver,
}

impl Phase {
    /// Check if a phase transition is legal
    pub fn can_transition_to(self, to: Phase) -> bool {
        use Phase::*;

        match (self, to) {
            (Lobby, CategorySelection) => true,
            (CategorySelection, PlayerSubmission) => true,
            (PlayerSubmission, Judging) => true,

            // Judging resolves straight to a result unless the winner wrote custom text
            (Judging, WinnerAnnouncement) => true,
            (Judging, JudgeApprovalPending) => true,
            (Judging, GameOver) => true,
            (JudgeApprovalPending, WinnerAnnouncement) => true,
            (JudgeApprovalPending, GameOver) => true,

            // Next round
            (WinnerAnnouncement, CategorySelection) => true,

            // Judge left mid-round: the round restarts under the next judge
            (PlayerSubmission, CategorySelection) => true,
            (Judging, CategorySelection) => true,
            (JudgeApprovalPending, CategorySelection) => true,

            // Resets and roster collapse
            (from, Lobby) => from != Lobby,

            _ => false,
        }
    }

    /// Phases in which a round is in progress (a judge must exist)
    pub fn in_round(self) -> bool {
        !matches!(self, Phase::Lobby)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum TransitionState {
    #[default]
    Idle,
    Busy {
        message: String,
    },
}

impl TransitionState {
    pub fn busy(message: impl Into<String>) -> Self {
        Self::Busy {
            message: message.into(),
        }
    }

    pub fn is_idle(&self) -> bool {
        matches!(self, TransitionState::Idle)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    #[default]
    Public,
    Private,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LastWinner {
    pub player_id: PlayerId,
    pub text: String,
}

/// A custom-text winner waiting for the judge to approve it as a permanent card
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PendingApproval {
    pub player_id: PlayerId,
    pub submission_id: SubmissionId,
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub version: u64,
    pub room_code: String,
    pub phase: Phase,
    pub round: u32,
    pub current_judge_id: Option<PlayerId>,
    /// The judge left after their round was decided and the seat passed on.
    /// The next round keeps the inheritor instead of rotating past them.
    #[serde(default)]
    pub judge_seat_inherited: bool,
    pub current_scenario_id: Option<ScenarioId>,
    /// Order in which players marked themselves ready; seeds the first judge
    pub ready_player_order: Vec<PlayerId>,
    pub last_winner: Option<LastWinner>,
    pub pending_approval: Option<PendingApproval>,
    pub overall_winner_id: Option<PlayerId>,
    pub used_scenario_ids: HashSet<ScenarioId>,
    pub used_response_card_ids: HashSet<CardId>,
    pub transition: TransitionState,
    pub visibility: Visibility,
    pub max_players: u32,
    /// Authoritative host. None only after a full reset emptied the roster.
    pub created_by_player_id: Option<PlayerId>,
    pub created_at: DateTime<Utc>,
    /// Stamped by the store on every update
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

impl Session {
    pub fn new(room_code: String, visibility: Visibility, max_players: u32) -> Self {
        Self {
            id: ulid::Ulid::new().to_string(),
            version: 1,
            room_code,
            phase: Phase::Lobby,
            round: 0,
            current_judge_id: None,
            judge_seat_inherited: false,
            current_scenario_id: None,
            ready_player_order: Vec::new(),
            last_winner: None,
            pending_approval: None,
            overall_winner_id: None,
            used_scenario_ids: HashSet::new(),
            used_response_card_ids: HashSet::new(),
            transition: TransitionState::Idle,
            visibility,
            max_players,
            created_by_player_id: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    pub fn is_judge(&self, player_id: &str) -> bool {
        self.current_judge_id.as_deref() == Some(player_id)
    }

    pub fn is_host(&self, player_id: &str) -> bool {
        self.created_by_player_id.as_deref() == Some(player_id)
    }

    /// Clear all round pointers and return to the lobby.
    /// Roster-level cleanup (hands, submissions, scores) is the caller's job.
    pub fn return_to_lobby(&mut self) {
        self.phase = Phase::Lobby;
        self.round = 0;
        self.current_judge_id = None;
        self.judge_seat_inherited = false;
        self.current_scenario_id = None;
        self.ready_player_order.clear();
        self.last_winner = None;
        self.pending_approval = None;
        self.overall_winner_id = None;
        self.used_scenario_ids.clear();
        self.used_response_card_ids.clear();
        self.transition = TransitionState::Idle;
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Player {
    pub id: PlayerId,
    pub session_id: SessionId,
    pub name: String,
    pub avatar: String,
    pub score: u32,
    pub is_ready: bool,
    pub joined_at: DateTime<Utc>,
}

impl Player {
    pub fn new(session_id: &str, name: String, avatar: String) -> Self {
        Self {
            id: ulid::Ulid::new().to_string(),
            session_id: session_id.to_string(),
            name,
            avatar,
            score: 0,
            is_ready: false,
            joined_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HandCard {
    pub session_id: SessionId,
    pub player_id: PlayerId,
    pub card_id: CardId,
    /// UI hint only: set on replacement deals, cleared on the player's next submit
    pub is_new: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResponseCard {
    pub id: CardId,
    pub text: String,
    /// Set for cards promoted from an approved custom answer
    pub author_player_id: Option<PlayerId>,
    pub active: bool,
}

impl ResponseCard {
    pub fn new(text: String, author_player_id: Option<PlayerId>) -> Self {
        Self {
            id: ulid::Ulid::new().to_string(),
            text,
            author_player_id,
            active: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Scenario {
    pub id: ScenarioId,
    pub category: String,
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SubmissionContent {
    Card { card_id: CardId },
    Custom { text: String },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Submission {
    pub id: SubmissionId,
    pub session_id: SessionId,
    pub player_id: PlayerId,
    pub round: u32,
    pub content: SubmissionContent,
}

/// Append-only audit row for every resolved round
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WinnerRecord {
    pub id: WinnerId,
    pub session_id: SessionId,
    pub round: u32,
    pub winner_id: PlayerId,
    /// None when a custom answer won but the judge rejected it as a card
    pub winning_card_id: Option<CardId>,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Host,
    Judge,
    Player,
    Spectator,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GameRules {
    pub min_players: usize,
    pub win_threshold: u32,
    pub hand_size: usize,
    pub default_max_players: u32,
    pub max_custom_text_chars: usize,
}

impl Default for GameRules {
    fn default() -> Self {
        Self {
            min_players: 3,
            win_threshold: 3,
            hand_size: 7,
            default_max_players: 8,
            max_custom_text_chars: 200,
        }
    }
}

/// Hard upper bound on a session roster regardless of configuration
pub const MAX_PLAYERS_LIMIT: u32 = 16;

impl GameRules {
    /// Load rules from environment variables, falling back to defaults
    pub fn from_env() -> Self {
        let defaults = Self::default();

        fn var<T: std::str::FromStr>(key: &str, fallback: T) -> T {
            std::env::var(key)
                .ok()
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(fallback)
        }

        let min_players =
            var("MIN_PLAYERS", defaults.min_players).clamp(2, MAX_PLAYERS_LIMIT as usize);
        let default_max_players = var("MAX_PLAYERS", defaults.default_max_players)
            .clamp(3, MAX_PLAYERS_LIMIT)
            .max(min_players as u32);

        Self {
            min_players,
            win_threshold: var("WIN_THRESHOLD", defaults.win_threshold).max(1),
            hand_size: var("HAND_SIZE", defaults.hand_size).max(1),
            default_max_players,
            max_custom_text_chars: var("MAX_CUSTOM_TEXT_CHARS", defaults.max_custom_text_chars),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_forward_transitions() {
        assert!(Phase::Lobby.can_transition_to(Phase::CategorySelection));
        assert!(Phase::CategorySelection.can_transition_to(Phase::PlayerSubmission));
        assert!(Phase::PlayerSubmission.can_transition_to(Phase::Judging));
        assert!(Phase::Judging.can_transition_to(Phase::JudgeApprovalPending));
        assert!(Phase::JudgeApprovalPending.can_transition_to(Phase::GameOver));
        assert!(Phase::WinnerAnnouncement.can_transition_to(Phase::CategorySelection));
    }

    #[test]
    fn test_invalid_transitions() {
        assert!(!Phase::Lobby.can_transition_to(Phase::Judging));
        assert!(!Phase::Lobby.can_transition_to(Phase::Lobby));
        assert!(!Phase::PlayerSubmission.can_transition_to(Phase::WinnerAnnouncement));
        assert!(!Phase::GameOver.can_transition_to(Phase::CategorySelection));
        assert!(!Phase::CategorySelection.can_transition_to(Phase::Judging));
        assert!(!Phase::CategorySelection.can_transition_to(Phase::CategorySelection));
    }

    #[test]
    fn test_round_restart_transitions() {
        assert!(Phase::Judging.can_transition_to(Phase::CategorySelection));
        assert!(Phase::JudgeApprovalPending.can_transition_to(Phase::CategorySelection));
        assert!(!Phase::WinnerAnnouncement.can_transition_to(Phase::Judging));
    }

    #[test]
    fn test_everything_can_collapse_to_lobby() {
        for phase in [
            Phase::CategorySelection,
            Phase::PlayerSubmission,
            Phase::Judging,
            Phase::JudgeApprovalPending,
            Phase::WinnerAnnouncement,
            Phase::GameOver,
        ] {
            assert!(phase.can_transition_to(Phase::Lobby), "{phase:?}");
        }
    }

    #[test]
    fn test_return_to_lobby_clears_pointers() {
        let mut session = Session::new("ABCDEF".into(), Visibility::Public, 8);
        session.phase = Phase::Judging;
        session.round = 4;
        session.current_judge_id = Some("p1".into());
        session.current_scenario_id = Some("s1".into());
        session.used_response_card_ids.insert("c1".into());
        session.created_by_player_id = Some("p1".into());

        session.return_to_lobby();

        assert_eq!(session.phase, Phase::Lobby);
        assert_eq!(session.round, 0);
        assert!(session.current_judge_id.is_none());
        assert!(session.current_scenario_id.is_none());
        assert!(session.used_response_card_ids.is_empty());
        // Host survives a soft reset
        assert_eq!(session.created_by_player_id.as_deref(), Some("p1"));
    }

    #[test]
    fn test_transition_state_serialization() {
        let json = serde_json::to_string(&TransitionState::busy("Dealing")).unwrap();
        assert_eq!(json, r#"{"state":"busy","message":"Dealing"}"#);
        let idle: TransitionState = serde_json::from_str(r#"{"state":"idle"}"#).unwrap();
        assert!(idle.is_idle());
    }

    #[test]
    #[serial]
    fn test_rules_from_env() {
        std::env::set_var("WIN_THRESHOLD", "5");
        std::env::set_var("HAND_SIZE", "not-a-number");
        std::env::set_var("MAX_PLAYERS", "99");

        let rules = GameRules::from_env();
        assert_eq!(rules.win_threshold, 5);
        assert_eq!(rules.hand_size, GameRules::default().hand_size);
        assert_eq!(rules.default_max_players, MAX_PLAYERS_LIMIT);

        std::env::remove_var("WIN_THRESHOLD");
        std::env::remove_var("HAND_SIZE");
        std::env::remove_var("MAX_PLAYERS");
    }

    #[test]
    #[serial]
    fn test_rules_from_env_keep_player_bounds_consistent() {
        std::env::set_var("MIN_PLAYERS", "17");
        std::env::set_var("MAX_PLAYERS", "4");

        let rules = GameRules::from_env();
        assert_eq!(rules.min_players, MAX_PLAYERS_LIMIT as usize);
        assert_eq!(rules.default_max_players, MAX_PLAYERS_LIMIT);

        std::env::set_var("MIN_PLAYERS", "5");
        let rules = GameRules::from_env();
        assert_eq!(rules.min_players, 5);
        assert_eq!(rules.default_max_players, 5);

        std::env::remove_var("MIN_PLAYERS");
        std::env::remove_var("MAX_PLAYERS");
    }
}
