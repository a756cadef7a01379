//! Session tokens, cookie transport and role resolution.
//!
//! Tokens are stateless HS256 JWTs naming a player, a session and the role
//! the player had when the token was minted. The role is only a hint: every
//! check re-derives it from the live session row.

use axum::http::{header, HeaderMap};
use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{decode, encode, errors::ErrorKind, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{AuthFailure, GameError, GameResult};
use crate::store::Store;
use crate::types::{Player, PlayerId, Role, Session, SessionId};

pub const SESSION_COOKIE: &str = "partycards_session";

const DEFAULT_TTL_SECS: i64 = 12 * 60 * 60;

/// Token signing and cookie configuration
#[derive(Clone)]
pub struct AuthConfig {
    secret: Vec<u8>,
    pub token_ttl: Duration,
    /// Add `Secure` to the session cookie (set behind TLS)
    pub cookie_secure: bool,
}

impl fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthConfig")
            .field("secret", &"<redacted>")
            .field("token_ttl", &self.token_ttl)
            .field("cookie_secure", &self.cookie_secure)
            .finish()
    }
}

impl AuthConfig {
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        Self {
            secret: secret.into(),
            token_ttl: Duration::seconds(DEFAULT_TTL_SECS),
            cookie_secure: false,
        }
    }

    /// Load auth config from environment variables.
    /// SESSION_SECRET should be set; otherwise tokens die with the process.
    pub fn from_env() -> Self {
        let secret = std::env::var("SESSION_SECRET")
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());

        let mut config = match secret {
            Some(secret) => {
                tracing::info!("Session signing secret loaded");
                Self::new(secret.into_bytes())
            }
            None => {
                tracing::warn!(
                    "SESSION_SECRET not set - using a random per-process secret, sessions will not survive a restart!"
                );
                let bytes: [u8; 32] = rand::rng().random();
                Self::new(bytes.to_vec())
            }
        };

        if let Some(ttl) = std::env::var("SESSION_TTL_SECS")
            .ok()
            .and_then(|v| v.trim().parse::<i64>().ok())
            .filter(|ttl| *ttl > 0)
        {
            config.token_ttl = Duration::seconds(ttl);
        }
        config.cookie_secure = std::env::var("COOKIE_SECURE")
            .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
            .unwrap_or(false);

        config
    }
}

/// Claims carried by a session token
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionClaims {
    /// Player id
    pub sub: PlayerId,
    pub sid: SessionId,
    pub role: Role,
    pub iat: i64,
    pub exp: i64,
}

pub fn issue_token(
    config: &AuthConfig,
    player_id: &str,
    session_id: &str,
    role: Role,
    now: DateTime<Utc>,
) -> GameResult<String> {
    let claims = SessionClaims {
        sub: player_id.to_string(),
        sid: session_id.to_string(),
        role,
        iat: now.timestamp(),
        exp: (now + config.token_ttl).timestamp(),
    };

    encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(&config.secret),
    )
    .map_err(|e| GameError::Internal(format!("failed to encode session token: {e}")))
}

pub fn verify_token(config: &AuthConfig, token: &str) -> Result<SessionClaims, AuthFailure> {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.leeway = 0;

    decode::<SessionClaims>(
        token,
        &DecodingKey::from_secret(&config.secret),
        &validation,
    )
    .map(|data| data.claims)
    .map_err(|e| match e.kind() {
        ErrorKind::ExpiredSignature => AuthFailure::Expired,
        ErrorKind::InvalidSignature => AuthFailure::InvalidSignature,
        _ => AuthFailure::Malformed,
    })
}

/// Derive a role from live state. Judge wins over host for display.
pub fn resolve_role(session: &Session, member: Option<&Player>) -> Role {
    match member {
        Some(player) if player.session_id == session.id => {
            if session.is_judge(&player.id) {
                Role::Judge
            } else if session.is_host(&player.id) {
                Role::Host
            } else {
                Role::Player
            }
        }
        _ => Role::Spectator,
    }
}

/// A caller whose token checked out against live state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Actor {
    pub player_id: PlayerId,
    pub session_id: SessionId,
    /// Role derived from the current session row
    pub role: Role,
    /// Role the token was minted with
    pub token_role: Role,
}

impl Actor {
    /// The cookie carries a stale role and should be re-issued
    pub fn needs_reissue(&self) -> bool {
        self.role != self.token_role
    }
}

/// Validate a token for a mutation on `session_id`.
///
/// Checks in order: signature and expiry, session match, live membership,
/// then re-derives the role from the session row.
pub async fn authorize(
    store: &dyn Store,
    config: &AuthConfig,
    token: Option<&str>,
    session_id: &str,
) -> GameResult<Actor> {
    let token = token.ok_or(GameError::Unauthorized(AuthFailure::MissingToken))?;
    let claims = verify_token(config, token).map_err(GameError::Unauthorized)?;
    if claims.sid != session_id {
        return Err(GameError::Unauthorized(AuthFailure::SessionMismatch));
    }
    let (actor, _) = load_member(store, claims).await?;
    Ok(actor)
}

/// Resolve the caller's identity from the token alone (no target session)
pub async fn identify(
    store: &dyn Store,
    config: &AuthConfig,
    token: Option<&str>,
) -> GameResult<(Actor, Player, Session)> {
    let token = token.ok_or(GameError::Unauthorized(AuthFailure::MissingToken))?;
    let claims = verify_token(config, token).map_err(GameError::Unauthorized)?;
    let (actor, player) = load_member(store, claims).await?;
    let session = store
        .get_session(&actor.session_id)
        .await?
        .ok_or_else(|| GameError::session_not_found(&actor.session_id))?;
    Ok((actor, player, session))
}

async fn load_member(store: &dyn Store, claims: SessionClaims) -> GameResult<(Actor, Player)> {
    let player = store
        .get_player(&claims.sub)
        .await?
        .filter(|p| p.session_id == claims.sid)
        .ok_or_else(|| {
            tracing::debug!(player_id = %claims.sub, session_id = %claims.sid, "Token for a departed player");
            GameError::Unauthorized(AuthFailure::NotAMember)
        })?;

    let session = store
        .get_session(&claims.sid)
        .await?
        .ok_or(GameError::Unauthorized(AuthFailure::NotAMember))?;

    let actor = Actor {
        player_id: player.id.clone(),
        session_id: session.id.clone(),
        role: resolve_role(&session, Some(&player)),
        token_role: claims.role,
    };
    Ok((actor, player))
}

// ----- cookie transport -----

pub fn session_cookie(config: &AuthConfig, token: &str) -> String {
    let mut cookie = format!(
        "{SESSION_COOKIE}={token}; HttpOnly; SameSite=Lax; Path=/; Max-Age={}",
        config.token_ttl.num_seconds()
    );
    if config.cookie_secure {
        cookie.push_str("; Secure");
    }
    cookie
}

pub fn clear_cookie(config: &AuthConfig) -> String {
    let mut cookie = format!("{SESSION_COOKIE}=; HttpOnly; SameSite=Lax; Path=/; Max-Age=0");
    if config.cookie_secure {
        cookie.push_str("; Secure");
    }
    cookie
}

/// Extract the session token from the request's Cookie headers
pub fn token_from_headers(headers: &HeaderMap) -> Option<String> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, value)| *name == SESSION_COOKIE && !value.is_empty())
        .map(|(_, value)| value.to_string())
}
