//! # Agent League
//!
//! Runs a round-robin league between autonomous agents talking JSON-RPC to each other.
//!
//! Three kinds of agents take part:
//! - the [`LeagueManager`](crate::league_manager::LeagueManager) registers everybody, builds the
//!   schedule, hands matches to referees and keeps the standings
//! - a [`Referee`](crate::referee::Referee) runs the matches it is assigned, move by move, and
//!   reports each result
//! - a [`Player`](crate::player::Player) accepts invitations and answers move requests with its
//!   [`Strategy`](crate::game_interface::Strategy)
//!
//! The league knows nothing about the game being played. The rules live behind the
//! [`Game`](crate::game_interface::Game) trait used by the referees.
//!
//! Every agent is a [`MessageHandler`](crate::rpc::MessageHandler). Wrapping one in a
//! [`Dispatcher`](crate::rpc::Dispatcher) makes it reachable, either over TCP through an
//! [`AgentServer`](crate::server::AgentServer) or in-process through a
//! [`LocalNetwork`](crate::transport::LocalNetwork).
//!
//! A player that misses a deadline, sends an illegal move or cannot be reached does not stall
//! its match: the referee plays the game's default move for it. A player that never joins
//! forfeits. A result the League Manager never receives ends as a double forfeit after a few
//! reminders, so a league always completes.
//!
//! # Usage Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use agent_league::prelude::*;
//!
//! struct EvenOdd;
//!
//! impl Game for EvenOdd {
//!     type Move = u8;
//!
//!     fn game_type(&self) -> &str {
//!         "even_odd"
//!     }
//!
//!     fn legal_moves(&self, _context: &GameContext) -> Vec<u8> {
//!         (1..=5).collect()
//!     }
//!
//!     fn default_move(&self, _context: &GameContext) -> u8 {
//!         1
//!     }
//!
//!     fn resolve(&self, a: &u8, b: &u8) -> Outcome {
//!         if (a + b) % 2 == 1 {
//!             Outcome::PlayerA
//!         } else {
//!             Outcome::PlayerB
//!         }
//!     }
//! }
//!
//! struct AlwaysThree;
//!
//! impl Strategy for AlwaysThree {
//!     type Move = u8;
//!
//!     fn decide_move(&self, _context: &DecisionContext<u8>) -> u8 {
//!         3
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let network = LocalNetwork::new();
//!     let transport: Arc<dyn Transport> = Arc::new(network.clone());
//!     let config = Configuration::new();
//!
//!     let league_endpoint = Endpoint::from("league");
//!     let league = LeagueManager::new(
//!         "demo",
//!         "even_odd",
//!         transport.clone(),
//!         league_endpoint.clone(),
//!         config,
//!     );
//!     network.attach(
//!         league_endpoint.clone(),
//!         Arc::new(Dispatcher::new(Arc::new(league.clone()))),
//!     );
//!
//!     let referee = Referee::new(
//!         EvenOdd,
//!         transport.clone(),
//!         Endpoint::from("referee"),
//!         league_endpoint.clone(),
//!         config,
//!     );
//!     network.attach(
//!         referee.endpoint().clone(),
//!         Arc::new(Dispatcher::new(Arc::new(referee.clone()))),
//!     );
//!     referee.register_with_league().await?;
//!
//!     for name in ["alice", "bob", "carol"] {
//!         let player = Player::new(
//!             name,
//!             AlwaysThree,
//!             transport.clone(),
//!             Endpoint::from(name),
//!             league_endpoint.clone(),
//!             config,
//!         );
//!         network.attach(
//!             player.endpoint().clone(),
//!             Arc::new(Dispatcher::new(Arc::new(player.clone()))),
//!         );
//!         player.register_with_league().await?;
//!     }
//!
//!     league.start_league(2).await?;
//!     league.start_next_round().await?;
//!
//!     if let Some(done) = league.wait_for_completion().await {
//!         for entry in done.standings {
//!             println!("{entry}");
//!         }
//!     }
//!     Ok(())
//! }
//! ```

pub use anyhow;
pub mod agent;
pub mod configuration;
pub mod error;
pub mod game_interface;
pub mod journal;
pub mod league_manager;
mod logger;
pub mod match_runner;
pub mod middleware;
pub mod player;
pub mod protocol;
pub mod referee;
pub mod retry;
mod round_scheduler;
pub mod rpc;
pub mod schedule;
pub mod server;
pub mod standings;
pub mod transport;

pub use logger::init_logger;

/// Commonly used types and traits for quick access.
///
/// ```rust
/// use agent_league::prelude::*;
/// ```
pub mod prelude {
    pub use crate::agent::{PlayerId, RefereeId};
    pub use crate::configuration::Configuration;
    pub use crate::error::{AgentError, ErrorCode, LeagueError};
    pub use crate::game_interface::{
        DecisionContext, Game, GameContext, Outcome, Role, Strategy,
    };
    pub use crate::league_manager::{LeagueManager, LeagueState};
    pub use crate::player::{Player, PlayerState};
    pub use crate::referee::Referee;
    pub use crate::rpc::Dispatcher;
    pub use crate::server::AgentServer;
    pub use crate::standings::StandingsEntry;
    pub use crate::transport::{Endpoint, LocalNetwork, TcpTransport, Transport};
}
