//! Progress of the round being played: which pairings wait for a referee, which matches are
//! out, and which results are already counted.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use tracing::trace;

use crate::agent::{PlayerId, PlayerRecord, RefereeId, RefereeRecord};
use crate::protocol::{MatchAssignment, MatchRules, Participant};
use crate::schedule::{Pairing, ScheduledRound};

/// A match handed to a referee and not reported yet.
#[derive(Debug, Clone)]
pub(crate) struct InFlight {
    pub assignment: MatchAssignment,
    /// Times the assignment was sent again after a silent referee.
    pub resends: u32,
    /// Bumped on every (re)send so that old watchdogs know they are stale.
    pub generation: u64,
}

/// Where a match id stands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum MatchStatus<'a> {
    InFlight(&'a MatchAssignment),
    /// Scheduled in the current round but not handed out yet.
    Pending,
    Applied,
    Unknown,
}

/// Progress of the current round: pairings waiting for a referee slot, matches in flight, and
/// every result applied so far.
#[derive(Debug, Default)]
pub(crate) struct RoundScheduler {
    round_number: u32,
    pending: VecDeque<Pairing>,
    in_flight: HashMap<String, InFlight>,
    applied: HashSet<String>,
    next_generation: u64,
}

impl RoundScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn round_number(&self) -> u32 {
        self.round_number
    }

    /// Queues every pairing of `round`.
    pub fn begin_round(&mut self, round: &ScheduledRound) {
        trace!(round = round.round_number, "next round");
        self.round_number = round.round_number;
        self.pending = round.pairings.iter().cloned().collect();
        self.in_flight.clear();
    }

    /// Hands as many pending pairings as possible to referees with a free slot.
    ///
    /// The least busy referee supporting `game_type` gets the next pairing, lowest id first on
    /// ties. Pairings that do not fit stay queued for the next call.
    pub fn advance(
        &mut self,
        referees: &mut BTreeMap<RefereeId, RefereeRecord>,
        players: &BTreeMap<PlayerId, PlayerRecord>,
        game_type: &str,
        rules: MatchRules,
    ) -> Vec<MatchAssignment> {
        let mut to_send = vec![];
        let mut remaining = VecDeque::new();
        for pairing in self.pending.drain(..) {
            let (Some(a), Some(b)) = (players.get(&pairing.player_a), players.get(&pairing.player_b))
            else {
                remaining.push_back(pairing);
                continue;
            };
            let Some(referee) = referees
                .values_mut()
                .filter(|r| r.can_take(game_type))
                .min_by_key(|r| (r.active_match_count, r.referee_id))
            else {
                remaining.push_back(pairing);
                continue;
            };
            referee.active_match_count += 1;
            let assignment = MatchAssignment {
                match_id: pairing.match_id.clone(),
                round_number: self.round_number,
                game_type: game_type.to_owned(),
                referee_id: referee.referee_id,
                player_a: Participant {
                    player_id: a.player_id,
                    endpoint: a.endpoint.clone(),
                },
                player_b: Participant {
                    player_id: b.player_id,
                    endpoint: b.endpoint.clone(),
                },
                rules,
            };
            self.next_generation += 1;
            self.in_flight.insert(
                pairing.match_id,
                InFlight {
                    assignment: assignment.clone(),
                    resends: 0,
                    generation: self.next_generation,
                },
            );
            to_send.push(assignment);
        }
        self.pending = remaining;
        to_send
    }

    pub fn status(&self, match_id: &str) -> MatchStatus<'_> {
        if self.applied.contains(match_id) {
            MatchStatus::Applied
        } else if let Some(m) = self.in_flight.get(match_id) {
            MatchStatus::InFlight(&m.assignment)
        } else if self.pending.iter().any(|p| p.match_id == match_id) {
            MatchStatus::Pending
        } else {
            MatchStatus::Unknown
        }
    }

    pub fn in_flight(&self, match_id: &str) -> Option<&InFlight> {
        self.in_flight.get(match_id)
    }

    /// Marks a watchdog expiry as a resend, returns the new generation.
    pub fn mark_resent(&mut self, match_id: &str) -> Option<u64> {
        let next = self.next_generation + 1;
        let entry = self.in_flight.get_mut(match_id)?;
        entry.resends += 1;
        entry.generation = next;
        self.next_generation = next;
        Some(next)
    }

    /// Records the result of `match_id`. `None` if it was not in flight.
    pub fn complete(&mut self, match_id: &str) -> Option<InFlight> {
        let done = self.in_flight.remove(match_id)?;
        self.applied.insert(match_id.to_owned());
        Some(done)
    }

    pub fn is_round_complete(&self) -> bool {
        self.pending.is_empty() && self.in_flight.is_empty()
    }

    #[cfg(test)]
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schedule::Schedule;
    use crate::transport::Endpoint;

    fn league(
        players: u32,
        referee_slots: &[u32],
    ) -> (
        BTreeMap<PlayerId, PlayerRecord>,
        BTreeMap<RefereeId, RefereeRecord>,
    ) {
        let players = (1..=players)
            .map(|i| {
                let id = PlayerId(i);
                (
                    id,
                    PlayerRecord::new(id, format!("p{i}"), Endpoint::from(format!("p{i}"))),
                )
            })
            .collect();
        let referees = referee_slots
            .iter()
            .zip(1..)
            .map(|(&slots, i)| {
                let id = RefereeId(i);
                (
                    id,
                    RefereeRecord::new(id, Endpoint::from(format!("r{i}")), vec!["g".into()], slots),
                )
            })
            .collect();
        (players, referees)
    }

    #[test]
    fn spreads_matches_over_least_loaded_referees() {
        let (players, mut referees) = league(8, &[2, 2, 2]);
        let schedule = Schedule::round_robin(&players.keys().copied().collect::<Vec<_>>());
        let mut scheduler = RoundScheduler::new();
        scheduler.begin_round(&schedule.rounds()[0]);
        let sent = scheduler.advance(&mut referees, &players, "g", MatchRules::best_of(3));
        let by_referee: Vec<_> = sent.iter().map(|a| a.referee_id.0).collect();
        assert_eq!(by_referee, [1, 2, 3, 1]);
        assert!(scheduler.pending_len() == 0);
        assert_eq!(referees[&RefereeId(1)].active_match_count, 2);
    }

    #[test]
    fn waits_for_free_slots() {
        let (players, mut referees) = league(6, &[1]);
        let schedule = Schedule::round_robin(&players.keys().copied().collect::<Vec<_>>());
        let mut scheduler = RoundScheduler::new();
        scheduler.begin_round(&schedule.rounds()[0]);

        let first = scheduler.advance(&mut referees, &players, "g", MatchRules::best_of(3));
        assert_eq!(first.len(), 1);
        assert_eq!(scheduler.pending_len(), 2);
        assert_eq!(scheduler.status("R1M2"), MatchStatus::Pending);

        assert!(scheduler.complete(&first[0].match_id).is_some());
        referees.get_mut(&RefereeId(1)).unwrap().active_match_count -= 1;
        let second = scheduler.advance(&mut referees, &players, "g", MatchRules::best_of(3));
        assert_eq!(second[0].match_id, "R1M2");
        assert!(!scheduler.is_round_complete());
    }

    #[test]
    fn unsupported_game_never_dispatches() {
        let (players, mut referees) = league(2, &[4]);
        let schedule = Schedule::round_robin(&players.keys().copied().collect::<Vec<_>>());
        let mut scheduler = RoundScheduler::new();
        scheduler.begin_round(&schedule.rounds()[0]);
        assert!(scheduler
            .advance(&mut referees, &players, "chess", MatchRules::best_of(3))
            .is_empty());
        assert_eq!(scheduler.pending_len(), 1);
    }

    #[test]
    fn completion_is_recorded_once() {
        let (players, mut referees) = league(2, &[1]);
        let schedule = Schedule::round_robin(&players.keys().copied().collect::<Vec<_>>());
        let mut scheduler = RoundScheduler::new();
        scheduler.begin_round(&schedule.rounds()[0]);
        scheduler.advance(&mut referees, &players, "g", MatchRules::best_of(3));

        let generation = scheduler.in_flight("R1M1").unwrap().generation;
        let resent = scheduler.mark_resent("R1M1").unwrap();
        assert!(resent > generation);
        assert_eq!(scheduler.in_flight("R1M1").unwrap().resends, 1);

        assert!(scheduler.complete("R1M1").is_some());
        assert!(scheduler.complete("R1M1").is_none());
        assert_eq!(scheduler.status("R1M1"), MatchStatus::Applied);
        assert_eq!(scheduler.status("R9M9"), MatchStatus::Unknown);
        assert!(scheduler.is_round_complete());
    }
}
