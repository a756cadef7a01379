use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::store::pack::{CardPack, PackError};

const DEFAULT_BIND_ADDR: &str = "0.0.0.0:3000";
const DEFAULT_EMPTY_SESSION_TTL: Duration = Duration::from_secs(10 * 60);
const DEFAULT_IDLE_SESSION_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Process-level settings
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: SocketAddr,
    /// Card pack to seed with; the built-in pack when unset
    pub card_pack_path: Option<PathBuf>,
    /// How long a session with nobody in it survives
    pub empty_session_ttl: Duration,
    /// How long any session survives without a state change
    pub idle_session_ttl: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 3000)),
            card_pack_path: None,
            empty_session_ttl: DEFAULT_EMPTY_SESSION_TTL,
            idle_session_ttl: DEFAULT_IDLE_SESSION_TTL,
        }
    }
}

fn secs_var(key: &str, fallback: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(fallback)
}

impl ServerConfig {
    /// Load from BIND_ADDR, CARD_PACK_PATH, EMPTY_SESSION_TTL_SECS and
    /// IDLE_SESSION_TTL_SECS
    pub fn from_env() -> Self {
        let mut config = Self::default();

        let raw = std::env::var("BIND_ADDR").unwrap_or_else(|_| DEFAULT_BIND_ADDR.to_string());
        match raw.trim().parse::<SocketAddr>() {
            Ok(addr) => config.bind_addr = addr,
            Err(e) => tracing::warn!(
                "Invalid BIND_ADDR {:?} ({}), using {}",
                raw,
                e,
                config.bind_addr
            ),
        }

        config.card_pack_path = std::env::var("CARD_PACK_PATH")
            .ok()
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty())
            .map(PathBuf::from);

        config.empty_session_ttl = secs_var("EMPTY_SESSION_TTL_SECS", config.empty_session_ttl);
        config.idle_session_ttl = secs_var("IDLE_SESSION_TTL_SECS", config.idle_session_ttl);

        config
    }

    pub fn load_pack(&self) -> Result<CardPack, PackError> {
        match &self.card_pack_path {
            Some(path) => {
                tracing::info!("Loading card pack from {}", path.display());
                CardPack::from_file(path)
            }
            None => CardPack::builtin(),
        }
    }
}
