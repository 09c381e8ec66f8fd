//! Ranked view of the players.

use std::cmp::{Ordering, Reverse};

use serde::{Deserialize, Serialize};

use crate::agent::{PlayerId, PlayerRecord};

/// One line of the standings table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StandingsEntry {
    /// 1-based, unique.
    pub rank: u32,
    pub player_id: PlayerId,
    pub display_name: String,
    pub score: u32,
    pub wins: u32,
    pub draws: u32,
    pub losses: u32,
    pub matches_played: u32,
}

impl std::fmt::Display for StandingsEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:>2}. {} ({}) {} pts, win: {}, draw: {}, loss: {}",
            self.rank,
            self.player_id,
            self.display_name,
            self.score,
            self.wins,
            self.draws,
            self.losses
        )
    }
}

/// Score desc, then wins desc, then player id asc.
pub fn standings_order(a: &PlayerRecord, b: &PlayerRecord) -> Ordering {
    let key = |p: &PlayerRecord| (Reverse(p.score), Reverse(p.wins), p.player_id);
    key(a).cmp(&key(b))
}

/// Ranks `players`. Never ties: player ids are unique.
pub fn compute_standings<'a>(players: impl IntoIterator<Item = &'a PlayerRecord>) -> Vec<StandingsEntry> {
    let mut players: Vec<&PlayerRecord> = players.into_iter().collect();
    players.sort_by(|a, b| standings_order(a, b));
    players
        .into_iter()
        .zip(1..)
        .map(|(p, rank)| StandingsEntry {
            rank,
            player_id: p.player_id,
            display_name: p.display_name.clone(),
            score: p.score,
            wins: p.wins,
            draws: p.draws,
            losses: p.losses,
            matches_played: p.matches_played,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::Endpoint;

    fn player(id: u32, score: u32, wins: u32) -> PlayerRecord {
        let mut p = PlayerRecord::new(PlayerId(id), format!("p{id}"), Endpoint::from("x"));
        p.score = score;
        p.wins = wins;
        p
    }

    #[test]
    fn sorted_by_score_then_wins_then_id() {
        let players = [
            player(4, 6, 2),
            player(2, 6, 1),
            player(3, 7, 1),
            player(1, 6, 2),
            player(10, 0, 0),
            player(9, 0, 0),
        ];
        let order: Vec<_> = compute_standings(&players)
            .iter()
            .map(|e| (e.rank, e.player_id.0))
            .collect();
        assert_eq!(order, [(1, 3), (2, 1), (3, 4), (4, 2), (5, 9), (6, 10)]);
    }

    #[test]
    fn empty_league_has_empty_standings() {
        assert!(compute_standings(Vec::<&PlayerRecord>::new()).is_empty());
    }

    #[test]
    fn display_line() {
        let entry = &compute_standings(&[player(1, 3, 1)])[0];
        assert_eq!(entry.to_string(), " 1. P01 (p1) 3 pts, win: 1, draw: 0, loss: 0");
    }
}
