//! Room code generation.

use rand::Rng;

use crate::error::{GameError, GameResult, StoreError};
use crate::store::Store;
use crate::types::Session;

/// Uppercase alphanumerics without the ambiguous 0/O and 1/I
const CODE_CHARS: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";
pub const CODE_LENGTH: usize = 6;
/// Attempts before giving up; hitting this means the code space is misconfigured
pub const MAX_ATTEMPTS: u32 = 32;

/// Generate a random room code
pub fn generate_room_code() -> String {
    let mut rng = rand::rng();
    (0..CODE_LENGTH)
        .map(|_| CODE_CHARS[rng.random_range(0..CODE_CHARS.len())] as char)
        .collect()
}

/// Normalize user input for lookup (case-insensitive, surrounding whitespace ignored)
pub fn normalize_room_code(input: &str) -> String {
    input.trim().to_ascii_uppercase()
}

pub fn is_valid_room_code(code: &str) -> bool {
    code.len() == CODE_LENGTH && code.bytes().all(|b| CODE_CHARS.contains(&b))
}

/// Insert `session` under a fresh unique room code.
///
/// Rejection-samples codes until the store accepts one. `generate` is the
/// code source so tests can force collisions.
pub async fn insert_with_unique_code<F>(
    store: &dyn Store,
    mut session: Session,
    mut generate: F,
) -> GameResult<Session>
where
    F: FnMut() -> String + Send,
{
    for attempt in 1..=MAX_ATTEMPTS {
        let code = generate();
        if store.find_session_by_code(&code).await?.is_some() {
            tracing::debug!(attempt, "Room code collision");
            continue;
        }
        session.room_code = code;
        match store.insert_session(session.clone()).await {
            Ok(()) => return Ok(session),
            // Lost a race for the same code
            Err(StoreError::Duplicate(_)) => continue,
            Err(e) => return Err(e.into()),
        }
    }
    tracing::error!(
        attempts = MAX_ATTEMPTS,
        "Room code space exhausted; check CODE_LENGTH against session volume"
    );
    Err(GameError::RoomCodeExhausted(MAX_ATTEMPTS))
}
