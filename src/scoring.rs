//! Round scoring and win detection. Pure and stateless.

/// Score after winning a round
pub fn apply_win(score: u32) -> u32 {
    score.saturating_add(1)
}

/// Whether a score ends the game
pub fn is_game_over(score: u32, win_threshold: u32) -> bool {
    score >= win_threshold
}
