//! Error taxonomy shared by every agent.
//!
//! Failures are split by where they are settled:
//! - [`TransportError`]: the call never produced a response. Always retryable.
//! - [`ProtocolError`]: a response arrived but is malformed, unexpected, or a rejection.
//! - [`LeagueError`]: a League Manager operation was refused. Surfaced to the caller.
//! - [`AgentError`]: terminal failures of a referee or player agent.
//!
//! Illegal moves are not errors: the referee turns them into default moves.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::transport::Endpoint;

/// Machine readable reason attached to every error response on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Operation attempted outside of its valid state.
    InvalidState,
    /// Player cap reached.
    LeagueFull,
    /// Not enough players to start the league.
    InsufficientPlayers,
    /// No referee can take the next match.
    NoAvailableReferee,
    /// The match id is not part of the current round.
    UnknownMatch,
    /// The result has already been applied.
    DuplicateResult,
    /// Missing or wrong auth token.
    Unauthorized,
    /// Request could not be decoded.
    MalformedMessage,
    /// Message type not handled by the receiving agent.
    UnexpectedMessage,
    /// Envelope protocol version differs from ours.
    UnsupportedProtocol,
    /// Game type not supported by the receiver.
    UnsupportedGame,
    /// Referee has no free match slot.
    CapacityExceeded,
    /// Player received a match message for a match it is not playing.
    NotInMatch,
    /// Player strategy missed its client-side deadline.
    DecisionTimeout,
    /// Anything else.
    Internal,
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = serde_json::to_value(self)
            .ok()
            .and_then(|v| v.as_str().map(str::to_owned))
            .unwrap_or_else(|| format!("{self:?}"));
        f.write_str(&s)
    }
}

/// Error payload of an RPC response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{code}: {message}")]
pub struct RpcError {
    pub code: ErrorCode,
    /// Human readable detail (entity ids included).
    pub message: String,
}

impl RpcError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// The call did not produce a response.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// No response before the deadline.
    #[error("call to {endpoint} timed out after {timeout:?}")]
    Timeout {
        endpoint: Endpoint,
        timeout: Duration,
    },
    /// Connection refused or unreachable.
    #[error("could not connect to {endpoint}: {reason}")]
    Connect {
        endpoint: Endpoint,
        reason: String,
    },
    /// Read or write failed mid-call.
    #[error("I/O error with {endpoint}: {reason}")]
    Io {
        endpoint: Endpoint,
        reason: String,
    },
    /// Length prefix above the frame limit.
    #[error("frame of {size} bytes exceeds the {max} bytes limit")]
    FrameTooLarge {
        size: usize,
        max: usize,
    },
    /// Zero length prefix.
    #[error("empty frame")]
    EmptyFrame,
    /// Frame payload is not valid JSON for the expected envelope.
    #[error("codec error: {0}")]
    Codec(String),
    /// In-memory network has nobody listening there.
    #[error("no agent listening on {0}")]
    UnknownEndpoint(Endpoint),
}

/// A response arrived but cannot be used.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// Payload could not be decoded.
    #[error("malformed message: {0}")]
    Malformed(String),
    /// Decoded fine, but not the message we asked for.
    #[error("expected {expected}, got {got}")]
    UnexpectedMessage {
        expected: &'static str,
        got: String,
    },
    /// Remote agent answered with an error.
    #[error("rejected by peer: {0}")]
    Rejected(RpcError),
}

impl ProtocolError {
    /// Reason code of a rejection, if any.
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            Self::Rejected(e) => Some(e.code),
            _ => None,
        }
    }
}

/// Outcome of an outbound call that went wrong.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CallError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

impl CallError {
    /// Transport failures are worth retrying, protocol failures are not.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport(_))
    }

    /// Reason code when the peer rejected the call.
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            Self::Protocol(p) => p.code(),
            Self::Transport(_) => None,
        }
    }
}

/// League Manager operation refused.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LeagueError {
    /// Operation not allowed in the current league state.
    #[error("{operation} is not allowed while the league is {state}")]
    InvalidState {
        operation: &'static str,
        state: String,
    },
    /// Player cap reached.
    #[error("league is full ({cap} players)")]
    LeagueFull { cap: usize },
    /// Fewer players than required.
    #[error("{registered} players registered, {required} required")]
    InsufficientPlayers {
        registered: usize,
        required: usize,
    },
    /// No referee qualifies for the match.
    #[error("no available referee for round {round} (match {match_id})")]
    NoAvailableReferee {
        round: u32,
        match_id: String,
    },
    /// Match id not in flight in the current round.
    #[error("unknown match {0}")]
    UnknownMatch(String),
    /// Report content is inconsistent with the assignment.
    #[error("invalid result for match {match_id}: {reason}")]
    InvalidResult {
        match_id: String,
        reason: String,
    },
    /// Token does not belong to the caller it claims to be.
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    /// Game type not supported by this league.
    #[error("unsupported game type {0}")]
    UnsupportedGame(String),
    /// The league cannot be played with its configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),
}

impl LeagueError {
    /// Wire reason code.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::InvalidState { .. } => ErrorCode::InvalidState,
            Self::LeagueFull { .. } => ErrorCode::LeagueFull,
            Self::InsufficientPlayers { .. } => ErrorCode::InsufficientPlayers,
            Self::NoAvailableReferee { .. } => ErrorCode::NoAvailableReferee,
            Self::UnknownMatch(_) => ErrorCode::UnknownMatch,
            Self::InvalidResult { .. } => ErrorCode::MalformedMessage,
            Self::Unauthorized(_) => ErrorCode::Unauthorized,
            Self::UnsupportedGame(_) => ErrorCode::UnsupportedGame,
            Self::InvalidConfiguration(_) => ErrorCode::InvalidState,
        }
    }
}

impl From<LeagueError> for RpcError {
    fn from(e: LeagueError) -> Self {
        RpcError::new(e.code(), e.to_string())
    }
}

/// Terminal failures of a referee or player.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AgentError {
    /// Registration rejected or retries exhausted.
    #[error("registration failed after {attempts} attempt(s): {reason}")]
    RegistrationFailed {
        attempts: u32,
        reason: String,
    },
    /// Operation needs credentials the agent does not have yet.
    #[error("agent is not registered")]
    NotRegistered,
    /// Match rules cannot produce a winner.
    #[error("invalid rules: {rounds_to_win} wins needed in at most {max_rounds} rounds")]
    InvalidRules {
        rounds_to_win: u32,
        max_rounds: u32,
    },
    /// Outbound call failed.
    #[error(transparent)]
    Call(#[from] CallError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_code_renders_as_wire_name() {
        assert_eq!(ErrorCode::NoAvailableReferee.to_string(), "NO_AVAILABLE_REFEREE");
        let rpc = RpcError::new(ErrorCode::LeagueFull, "league is full (2 players)");
        assert_eq!(rpc.to_string(), "LEAGUE_FULL: league is full (2 players)");
    }

    #[test]
    fn only_transport_failures_are_retryable() {
        let timeout = CallError::from(TransportError::Timeout {
            endpoint: Endpoint::from("lm"),
            timeout: Duration::from_secs(1),
        });
        assert!(timeout.is_retryable());

        let rejected = CallError::from(ProtocolError::Rejected(RpcError::new(
            ErrorCode::InvalidState,
            "nope",
        )));
        assert!(!rejected.is_retryable());
        assert_eq!(rejected.code(), Some(ErrorCode::InvalidState));
    }

    #[test]
    fn league_errors_map_to_codes() {
        let e = LeagueError::InsufficientPlayers {
            registered: 1,
            required: 2,
        };
        let rpc: RpcError = e.into();
        assert_eq!(rpc.code, ErrorCode::InsufficientPlayers);
        assert!(rpc.message.contains("1 players registered"));
    }
}
