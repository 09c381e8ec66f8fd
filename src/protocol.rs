//! Wire messages exchanged between the League Manager, referees and players.
//!
//! Every request travels inside an [`Envelope`]: protocol version, sender, timestamp,
//! conversation id, an optional auth token, and the [`Message`] itself flattened next to them
//! and tagged by `message_type`:
//!
//! ```json
//! {
//!   "protocol": "league.v2",
//!   "sender": "referee:REF01",
//!   "timestamp": "2025-01-01T12:00:00Z",
//!   "conversation_id": "5f0c...",
//!   "message_type": "CHOOSE_MOVE_CALL",
//!   "game_id": "R1M1",
//!   "round_id": 2,
//!   "deadline_ms": 30000,
//!   "current_scores": { "own": 1, "opponent": 0 }
//! }
//! ```
//!
//! Moves are carried as raw JSON values: only the referee decodes them, against its own
//! [`Game`](crate::game_interface::Game), so a player cannot smuggle anything past it.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::{format_description::well_known::Rfc3339, OffsetDateTime};

use crate::agent::{PlayerCredentials, PlayerId, RefereeCredentials, RefereeId};
use crate::error::AgentError;
use crate::game_interface::{Outcome, Role};
use crate::standings::StandingsEntry;
use crate::transport::Endpoint;

/// Version every envelope must carry.
pub const PROTOCOL_VERSION: &str = "league.v2";

/// Common header + message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub protocol: String,
    /// `league_manager`, `referee:REF01`, `player:P03`, ...
    pub sender: String,
    pub timestamp: String,
    pub conversation_id: String,
    /// Token of the sender. Kept apart from `auth_token`, which registration responses carry.
    #[serde(rename = "sender_token", default, skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
    #[serde(flatten)]
    pub message: Message,
}

impl Envelope {
    /// Wraps `message` with a fresh timestamp and conversation id.
    pub fn new(sender: impl Into<String>, message: Message) -> Envelope {
        Envelope {
            protocol: PROTOCOL_VERSION.to_owned(),
            sender: sender.into(),
            timestamp: now_rfc3339(),
            conversation_id: uuid::Uuid::new_v4().to_string(),
            auth_token: None,
            message,
        }
    }

    #[must_use]
    pub fn with_auth(mut self, token: Option<String>) -> Envelope {
        self.auth_token = token;
        self
    }

    /// Used for responses, which keep the conversation id of the request.
    #[must_use]
    pub fn in_conversation(mut self, conversation_id: &str) -> Envelope {
        self.conversation_id = conversation_id.to_owned();
        self
    }
}

fn now_rfc3339() -> String {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_else(|_| OffsetDateTime::now_utc().unix_timestamp().to_string())
}

/// The closed set of messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "message_type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Message {
    RefereeRegisterRequest(RefereeRegisterRequest),
    RefereeRegisterResponse(RefereeCredentials),
    PlayerRegisterRequest(PlayerRegisterRequest),
    PlayerRegisterResponse(PlayerCredentials),
    RoundAnnouncement(RoundAnnouncement),
    GameInvite(GameInvite),
    GameJoinAck(GameJoinAck),
    GameStart(GameStart),
    ChooseMoveCall(ChooseMoveCall),
    ChooseMoveResponse(ChooseMoveResponse),
    RoundResult(RoundResult),
    GameOver(GameOver),
    MatchResultReport(MatchResultReport),
    LeagueStandingsUpdate(LeagueStandingsUpdate),
    LeagueCompleted(LeagueCompleted),
    Ack(Ack),
}

impl Message {
    /// Wire name, also used as the RPC method.
    pub fn message_type(&self) -> &'static str {
        match self {
            Message::RefereeRegisterRequest(_) => "REFEREE_REGISTER_REQUEST",
            Message::RefereeRegisterResponse(_) => "REFEREE_REGISTER_RESPONSE",
            Message::PlayerRegisterRequest(_) => "PLAYER_REGISTER_REQUEST",
            Message::PlayerRegisterResponse(_) => "PLAYER_REGISTER_RESPONSE",
            Message::RoundAnnouncement(_) => "ROUND_ANNOUNCEMENT",
            Message::GameInvite(_) => "GAME_INVITE",
            Message::GameJoinAck(_) => "GAME_JOIN_ACK",
            Message::GameStart(_) => "GAME_START",
            Message::ChooseMoveCall(_) => "CHOOSE_MOVE_CALL",
            Message::ChooseMoveResponse(_) => "CHOOSE_MOVE_RESPONSE",
            Message::RoundResult(_) => "ROUND_RESULT",
            Message::GameOver(_) => "GAME_OVER",
            Message::MatchResultReport(_) => "MATCH_RESULT_REPORT",
            Message::LeagueStandingsUpdate(_) => "LEAGUE_STANDINGS_UPDATE",
            Message::LeagueCompleted(_) => "LEAGUE_COMPLETED",
            Message::Ack(_) => "ACK",
        }
    }

    pub fn ack() -> Message {
        Message::Ack(Ack {
            accepted: true,
            applied: None,
            detail: None,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefereeRegisterRequest {
    pub endpoint: Endpoint,
    pub game_types: Vec<String>,
    pub max_concurrent_matches: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerRegisterRequest {
    pub display_name: String,
    pub endpoint: Endpoint,
}

/// A player as the referee needs to see it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub player_id: PlayerId,
    pub endpoint: Endpoint,
}

/// How a match is won.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchRules {
    pub rounds_to_win: u32,
    pub max_rounds: u32,
}

impl MatchRules {
    /// Rules of a best-of-`n` match.
    pub fn best_of(n: u32) -> MatchRules {
        MatchRules {
            rounds_to_win: n.div_ceil(2),
            max_rounds: n,
        }
    }

    /// A match must be winnable within its round cap.
    ///
    /// # Errors
    /// [`AgentError::InvalidRules`] when `rounds_to_win` is 0 or above `max_rounds`.
    pub fn validate(&self) -> Result<(), AgentError> {
        if self.rounds_to_win == 0 || self.rounds_to_win > self.max_rounds {
            return Err(AgentError::InvalidRules {
                rounds_to_win: self.rounds_to_win,
                max_rounds: self.max_rounds,
            });
        }
        Ok(())
    }
}

/// One scheduled match handed to a referee.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchAssignment {
    pub match_id: String,
    pub round_number: u32,
    pub game_type: String,
    pub referee_id: RefereeId,
    pub player_a: Participant,
    pub player_b: Participant,
    pub rules: MatchRules,
}

impl MatchAssignment {
    pub fn participant(&self, role: Role) -> &Participant {
        match role {
            Role::PlayerA => &self.player_a,
            Role::PlayerB => &self.player_b,
        }
    }
}

impl fmt::Display for MatchAssignment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{} {} VS {}]",
            self.match_id, self.player_a.player_id, self.player_b.player_id
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundAnnouncement {
    pub round_number: u32,
    pub match_assignments: Vec<MatchAssignment>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GameInvite {
    pub game_id: String,
    pub game_type: String,
    pub player_id: PlayerId,
    pub opponent_id: PlayerId,
    pub role: Role,
    pub rounds_to_win: u32,
    pub max_rounds: u32,
    /// Time the player has to answer, in milliseconds.
    pub deadline_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GameJoinAck {
    pub game_id: String,
    pub player_id: PlayerId,
    pub accept: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GameStart {
    pub game_id: String,
}

/// Round wins, from the receiving player's point of view.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Scores {
    pub own: u32,
    pub opponent: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChooseMoveCall {
    pub game_id: String,
    pub round_id: u32,
    pub deadline_ms: u64,
    pub current_scores: Scores,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChooseMoveResponse {
    pub game_id: String,
    pub round_id: u32,
    pub player_id: PlayerId,
    #[serde(rename = "move")]
    pub chosen: Value,
}

/// Result of a round or a match, seen by one player.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Verdict {
    Win,
    Loss,
    Draw,
}

impl Verdict {
    /// `outcome` seen from `role`.
    pub fn for_role(outcome: Outcome, role: Role) -> Verdict {
        match outcome.winner() {
            None => Verdict::Draw,
            Some(winner) if winner == role => Verdict::Win,
            Some(_) => Verdict::Loss,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoundResult {
    pub game_id: String,
    pub round_number: u32,
    pub own_move: Value,
    pub opponent_move: Value,
    pub own_defaulted: bool,
    pub opponent_defaulted: bool,
    pub outcome: Verdict,
    pub current_scores: Scores,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GameOver {
    pub game_id: String,
    pub outcome: Verdict,
    /// Set when the match ended without being played out.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub forfeit: Option<ForfeitReason>,
    pub score: Scores,
}

/// Why a move was substituted by the game's default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DefaultReason {
    /// No answer before the deadline.
    Timeout,
    /// Connection failed.
    Unreachable,
    /// Player answered with an error.
    Rejected,
    /// Answer was not a move of this game.
    MalformedMove,
    /// Move outside of the legal set.
    IllegalMove,
}

/// What one player played in one round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerMove {
    /// As received, `None` when nothing usable arrived.
    pub submitted: Option<Value>,
    /// What the round was resolved with.
    pub effective: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_reason: Option<DefaultReason>,
}

impl PlayerMove {
    pub fn is_default(&self) -> bool {
        self.default_reason.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoundRecord {
    pub round_number: u32,
    pub player_a: PlayerMove,
    pub player_b: PlayerMove,
    pub outcome: Outcome,
}

impl RoundRecord {
    pub fn for_role(&self, role: Role) -> (&PlayerMove, &PlayerMove) {
        match role {
            Role::PlayerA => (&self.player_a, &self.player_b),
            Role::PlayerB => (&self.player_b, &self.player_a),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ForfeitReason {
    /// Player declined the invitation.
    Declined,
    /// Player did not acknowledge the invitation in time.
    NoResponse,
    /// Referee never reported the match.
    ResultNotReported,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForfeitNotice {
    pub player_id: PlayerId,
    pub reason: ForfeitReason,
}

/// Final result of a match as reported to the League Manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MatchOutcome {
    Winner { player_id: PlayerId },
    Draw,
    /// Both players lose.
    DoubleForfeit,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchResultReport {
    pub match_id: String,
    pub round_number: u32,
    pub referee_id: RefereeId,
    pub player_a: PlayerId,
    pub player_b: PlayerId,
    pub outcome: MatchOutcome,
    /// Round wins of player A and player B.
    pub score_a: u32,
    pub score_b: u32,
    pub rounds: Vec<RoundRecord>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub forfeits: Vec<ForfeitNotice>,
}

impl MatchResultReport {
    pub fn is_forfeit(&self) -> bool {
        !self.forfeits.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeagueStandingsUpdate {
    pub round_number: u32,
    pub standings: Vec<StandingsEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeagueCompleted {
    pub league_id: String,
    pub champion: Option<PlayerId>,
    pub standings: Vec<StandingsEntry>,
}

/// Answer to notifications.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    pub accepted: bool,
    /// For result reports: `false` when the result had already been applied.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub applied: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}
