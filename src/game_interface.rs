//! Traits a game and a player strategy implement to take part in a league.
//!
//! The league never knows the rules of what is being played: the referee asks its [`Game`] for
//! the legal moves, the fallback move and the outcome of each round, and the player asks its
//! [`Strategy`] for the next move.

use std::{fmt::Debug, time::Instant};

use serde::{de::DeserializeOwned, Deserialize, Serialize};

/// Side of a match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Role {
    /// First player of the pairing.
    PlayerA,
    /// Second player of the pairing.
    PlayerB,
}

impl Role {
    /// The other side.
    pub fn opponent(self) -> Role {
        match self {
            Role::PlayerA => Role::PlayerB,
            Role::PlayerB => Role::PlayerA,
        }
    }
}

/// Outcome of a round, or verdict of a match that ran out of rounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Outcome {
    /// Player A wins.
    PlayerA,
    /// Player B wins.
    PlayerB,
    /// Nobody wins.
    Draw,
}

impl Outcome {
    /// Winning side, `None` on a draw.
    pub fn winner(self) -> Option<Role> {
        match self {
            Outcome::PlayerA => Some(Role::PlayerA),
            Outcome::PlayerB => Some(Role::PlayerB),
            Outcome::Draw => None,
        }
    }

    /// Outcome won by `role`.
    pub fn won_by(role: Role) -> Outcome {
        match role {
            Role::PlayerA => Outcome::PlayerA,
            Role::PlayerB => Outcome::PlayerB,
        }
    }
}

/// Where in a match a move is asked for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GameContext {
    /// Match being played.
    pub match_id: String,
    /// 1-based round number.
    pub round_number: u32,
    /// Side whose move is considered.
    pub role: Role,
}

/// What the game should implement.
///
/// Used by the referee only. Implementations must be deterministic: the referee is the sole
/// authority over round outcomes, so the same two moves must always resolve the same way.
pub trait Game: Send + Sync + 'static {
    /// What a player plays in one round. Travels as JSON.
    type Move: Clone + Debug + PartialEq + Serialize + DeserializeOwned + Send + Sync + 'static;

    /// Identifier matched against the game types referees announce.
    fn game_type(&self) -> &str;

    /// Every move allowed in `context`.
    fn legal_moves(&self, context: &GameContext) -> Vec<Self::Move>;

    /// True if `candidate` may be played in `context`.
    fn is_legal(&self, context: &GameContext, candidate: &Self::Move) -> bool {
        self.legal_moves(context).contains(candidate)
    }

    /// Played in place of a player who did not answer in time, or answered with garbage.
    ///
    /// Should be legal in `context`.
    fn default_move(&self, context: &GameContext) -> Self::Move;

    /// Decide a round.
    fn resolve(&self, move_a: &Self::Move, move_b: &Self::Move) -> Outcome;

    /// Verdict of a match that reached its round cap without a winner.
    fn exhausted(&self, wins_a: u32, wins_b: u32) -> Outcome {
        match wins_a.cmp(&wins_b) {
            std::cmp::Ordering::Greater => Outcome::PlayerA,
            std::cmp::Ordering::Less => Outcome::PlayerB,
            std::cmp::Ordering::Equal => Outcome::Draw,
        }
    }
}

/// One finished round, from the deciding player's point of view.
#[derive(Debug, Clone, PartialEq)]
pub struct PastRound<M> {
    /// 1-based round number.
    pub round_number: u32,
    /// What this player ended up playing.
    pub own_move: M,
    /// What the opponent ended up playing.
    pub opponent_move: M,
    /// Win, loss or draw for this player.
    pub verdict: crate::protocol::Verdict,
}

/// Everything a strategy gets to decide a move.
#[derive(Debug, Clone)]
pub struct DecisionContext<M> {
    /// Match being played.
    pub match_id: String,
    /// Round about to be played.
    pub round_number: u32,
    /// Side of the deciding player.
    pub role: Role,
    /// Rounds won so far.
    pub own_score: u32,
    /// Rounds lost so far.
    pub opponent_score: u32,
    /// Previous rounds of this match, oldest first.
    pub history: Vec<PastRound<M>>,
    /// After this instant the answer will not be used.
    pub deadline: Instant,
}

/// What the player agent should implement.
///
/// Called on a blocking worker thread, so it may compute for a while, but an answer after
/// `context.deadline` is thrown away.
pub trait Strategy: Send + Sync + 'static {
    /// Must match the move type of the game being played.
    type Move: Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static;

    /// Pick the next move.
    fn decide_move(&self, context: &DecisionContext<Self::Move>) -> Self::Move;
}

#[cfg(test)]
mod interface_tests {
    use super::*;

    struct HighCard;

    impl Game for HighCard {
        type Move = u8;

        fn game_type(&self) -> &str {
            "high_card"
        }

        fn legal_moves(&self, _context: &GameContext) -> Vec<u8> {
            (1..=13).collect()
        }

        fn default_move(&self, _context: &GameContext) -> u8 {
            1
        }

        fn resolve(&self, a: &u8, b: &u8) -> Outcome {
            match a.cmp(b) {
                std::cmp::Ordering::Greater => Outcome::PlayerA,
                std::cmp::Ordering::Less => Outcome::PlayerB,
                std::cmp::Ordering::Equal => Outcome::Draw,
            }
        }
    }

    fn context() -> GameContext {
        GameContext {
            match_id: "R1M1".into(),
            round_number: 1,
            role: Role::PlayerA,
        }
    }

    #[test]
    fn legality_defaults_to_membership() {
        let game = HighCard;
        assert!(game.is_legal(&context(), &13));
        assert!(!game.is_legal(&context(), &0));
        assert!(game.is_legal(&context(), &game.default_move(&context())));
    }

    #[test]
    fn exhausted_match_goes_to_most_wins() {
        let game = HighCard;
        assert_eq!(game.exhausted(2, 1), Outcome::PlayerA);
        assert_eq!(game.exhausted(0, 1), Outcome::PlayerB);
        assert_eq!(game.exhausted(2, 2), Outcome::Draw);
    }

    #[test]
    fn outcome_and_roles() {
        assert_eq!(Outcome::won_by(Role::PlayerB).winner(), Some(Role::PlayerB));
        assert_eq!(Outcome::Draw.winner(), None);
        assert_eq!(Role::PlayerA.opponent(), Role::PlayerB);
        assert_eq!(serde_json::to_string(&Role::PlayerA).unwrap(), "\"PLAYER_A\"");
    }

    struct AlwaysKing;

    impl Strategy for AlwaysKing {
        type Move = u8;

        fn decide_move(&self, _context: &DecisionContext<u8>) -> u8 {
            13
        }
    }

    #[test]
    fn strategy_sees_its_context() {
        let ctx = DecisionContext {
            match_id: "R1M1".into(),
            round_number: 2,
            role: Role::PlayerB,
            own_score: 1,
            opponent_score: 0,
            history: vec![],
            deadline: Instant::now(),
        };
        assert_eq!(AlwaysKing.decide_move(&ctx), 13);
    }
}
