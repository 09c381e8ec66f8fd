#![allow(dead_code)]

use std::time::Duration;

use agent_league::prelude::*;

/// Both players pick 1 to 10, player A wins the round when the sum is odd.
pub struct SumParity;

impl Game for SumParity {
    type Move = u8;

    fn game_type(&self) -> &str {
        "sum_parity"
    }

    fn legal_moves(&self, _context: &GameContext) -> Vec<u8> {
        (1..=10).collect()
    }

    fn default_move(&self, _context: &GameContext) -> u8 {
        1
    }

    fn resolve(&self, a: &u8, b: &u8) -> Outcome {
        if (a + b) % 2 == 1 {
            Outcome::PlayerA
        } else {
            Outcome::PlayerB
        }
    }
}

/// Always plays the same number, legal or not.
pub struct Fixed(pub u8);

impl Strategy for Fixed {
    type Move = u8;

    fn decide_move(&self, _context: &DecisionContext<u8>) -> u8 {
        self.0
    }
}

/// Makes the sum odd when playing A and even when playing B.
pub struct Parity;

impl Strategy for Parity {
    type Move = u8;

    fn decide_move(&self, context: &DecisionContext<u8>) -> u8 {
        let last_opponent = context
            .history
            .last()
            .map(|r| r.opponent_move)
            .unwrap_or(1);
        match (context.role, last_opponent % 2) {
            (Role::PlayerA, 1) | (Role::PlayerB, 0) => 2,
            _ => 1,
        }
    }
}

/// Thinks longer than any deadline.
pub struct Sleepy(pub Duration);

impl Strategy for Sleepy {
    type Move = u8;

    fn decide_move(&self, _context: &DecisionContext<u8>) -> u8 {
        std::thread::sleep(self.0);
        2
    }
}
