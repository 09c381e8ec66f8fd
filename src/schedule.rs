//! Round-robin schedule generation (circle method).
//!
//! The first player stays in place while the others rotate one seat per round. With an odd
//! number of players an empty seat is added: whoever faces it has a bye that round.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::agent::PlayerId;

/// One match to be played.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pairing {
    /// `R{round}M{index}`.
    pub match_id: String,
    pub player_a: PlayerId,
    pub player_b: PlayerId,
}

impl Pairing {
    pub fn involves(&self, player: PlayerId) -> bool {
        self.player_a == player || self.player_b == player
    }
}

/// Matches played at the same time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduledRound {
    /// 1-based.
    pub round_number: u32,
    pub pairings: Vec<Pairing>,
    pub bye: Option<PlayerId>,
}

/// Every round of a league, generated once at league start.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schedule {
    rounds: Vec<ScheduledRound>,
}

/// Id of the `index`th (1-based) match of round `round`.
pub fn match_id(round: u32, index: usize) -> String {
    format!("R{round}M{index}")
}

impl Schedule {
    /// Every unordered pair of `players` exactly once.
    ///
    /// `players` is expected in registration order; the result only depends on that order.
    pub fn round_robin(players: &[PlayerId]) -> Schedule {
        if players.len() < 2 {
            return Schedule::default();
        }
        let mut seats: Vec<Option<PlayerId>> = players.iter().copied().map(Some).collect();
        if seats.len() % 2 == 1 {
            seats.push(None);
        }
        let n = seats.len();

        let rounds = (0..n - 1)
            .map(|r| {
                let round_number = r as u32 + 1;
                let mut pairings = Vec::with_capacity(n / 2);
                let mut bye = None;
                for i in 0..n / 2 {
                    let (mut a, mut b) = (seats[i], seats[n - 1 - i]);
                    // Fixed seat alternates sides.
                    if i == 0 && r % 2 == 1 {
                        std::mem::swap(&mut a, &mut b);
                    }
                    match (a, b) {
                        (Some(player_a), Some(player_b)) => pairings.push(Pairing {
                            match_id: match_id(round_number, pairings.len() + 1),
                            player_a,
                            player_b,
                        }),
                        (Some(p), None) | (None, Some(p)) => bye = Some(p),
                        (None, None) => {}
                    }
                }
                seats[1..].rotate_right(1);
                ScheduledRound {
                    round_number,
                    pairings,
                    bye,
                }
            })
            .collect();
        Schedule { rounds }
    }

    pub fn rounds(&self) -> &[ScheduledRound] {
        &self.rounds
    }

    /// Round `round_number` (1-based).
    pub fn round(&self, round_number: u32) -> Option<&ScheduledRound> {
        round_number
            .checked_sub(1)
            .and_then(|i| self.rounds.get(i as usize))
    }

    pub fn len(&self) -> u32 {
        self.rounds.len() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.rounds.is_empty()
    }

    pub fn total_matches(&self) -> usize {
        self.rounds.iter().map(|r| r.pairings.len()).sum()
    }

    /// True if every unordered pair of distinct players appears exactly once.
    pub fn is_complete_for(&self, players: &[PlayerId]) -> bool {
        let mut seen = HashSet::new();
        for pairing in self.rounds.iter().flat_map(|r| &r.pairings) {
            let key = (
                pairing.player_a.min(pairing.player_b),
                pairing.player_a.max(pairing.player_b),
            );
            if key.0 == key.1 || !seen.insert(key) {
                return false;
            }
        }
        let n = players.len();
        seen.len() == n * n.saturating_sub(1) / 2
            && seen
                .iter()
                .all(|(a, b)| players.contains(a) && players.contains(b))
    }
}
