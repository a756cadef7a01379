//! Judge rotation.

use crate::types::{Player, PlayerId};

/// Pick the judge for the next round from the live roster.
///
/// The roster shrinks when players leave or get kicked, so this is computed
/// fresh from whatever list the caller just read. A judge who is no longer in
/// the list falls back to the first player.
pub fn next_judge(players: &[Player], current_judge_id: Option<&str>) -> Option<PlayerId> {
    if players.is_empty() {
        return None;
    }
    let next = current_judge_id
        .and_then(|current| players.iter().position(|p| p.id == current))
        .map(|index| (index + 1) % players.len())
        .unwrap_or(0);
    Some(players[next].id.clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roster(ids: &[&str]) -> Vec<Player> {
        ids.iter()
            .map(|id| {
                let mut p = Player::new("s1", id.to_string(), "owl".into());
                p.id = id.to_string();
                p
            })
            .collect()
    }

    #[test]
    fn test_rotates_to_next_player() {
        let players = roster(&["p1", "p2", "p3"]);
        assert_eq!(next_judge(&players, Some("p1")).as_deref(), Some("p2"));
        assert_eq!(next_judge(&players, Some("p2")).as_deref(), Some("p3"));
    }

    #[test]
    fn test_wraps_around() {
        let players = roster(&["p1", "p2", "p3"]);
        assert_eq!(next_judge(&players, Some("p3")).as_deref(), Some("p1"));
    }

    #[test]
    fn test_missing_judge_falls_back_to_first() {
        let players = roster(&["p1", "p2"]);
        assert_eq!(next_judge(&players, Some("gone")).as_deref(), Some("p1"));
        assert_eq!(next_judge(&players, None).as_deref(), Some("p1"));
    }

    #[test]
    fn test_empty_roster() {
        assert_eq!(next_judge(&[], Some("p1")), None);
    }
}
