use std::{fmt, str::FromStr};

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::transport::Endpoint;

macro_rules! agent_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(pub u32);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "{:02}"), self.0)
            }
        }

        impl FromStr for $name {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                s.strip_prefix($prefix)
                    .and_then(|n| n.parse().ok())
                    .map($name)
                    .ok_or_else(|| format!(concat!("'{}' is not a valid ", $prefix, "NN id"), s))
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.collect_str(self)
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let s = String::deserialize(deserializer)?;
                s.parse().map_err(serde::de::Error::custom)
            }
        }
    };
}

agent_id!(
    /// Player identifier, `P01`, `P02`, ... in registration order.
    ///
    /// Ordering is numeric, so standings tie-breaks follow registration order.
    PlayerId,
    "P"
);

agent_id!(
    /// Referee identifier, `REF01`, `REF02`, ...
    RefereeId,
    "REF"
);

/// What an agent gets back from a successful registration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials<Id> {
    /// Assigned id, `player_id` or `referee_id` on the wire.
    #[serde(alias = "player_id", alias = "referee_id")]
    pub id: Id,
    /// Token to present on every authenticated call.
    pub auth_token: String,
    /// League the credentials belong to.
    pub league_id: String,
}

/// Player credentials.
pub type PlayerCredentials = Credentials<PlayerId>;
/// Referee credentials.
pub type RefereeCredentials = Credentials<RefereeId>;

/// Everything the League Manager knows about a player.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerRecord {
    pub player_id: PlayerId,
    pub display_name: String,
    pub endpoint: Endpoint,
    #[serde(skip)]
    pub auth_token: String,
    pub score: u32,
    pub wins: u32,
    pub draws: u32,
    pub losses: u32,
    pub matches_played: u32,
    /// Cleared after too many consecutive failed notifications.
    pub active: bool,
    pub consecutive_failures: u32,
}

impl PlayerRecord {
    pub fn new(player_id: PlayerId, display_name: String, endpoint: Endpoint) -> PlayerRecord {
        PlayerRecord {
            player_id,
            display_name,
            endpoint,
            auth_token: new_auth_token(),
            score: 0,
            wins: 0,
            draws: 0,
            losses: 0,
            matches_played: 0,
            active: true,
            consecutive_failures: 0,
        }
    }

    pub(crate) fn record_win(&mut self, points: u32) {
        self.wins += 1;
        self.score += points;
        self.matches_played += 1;
    }

    pub(crate) fn record_draw(&mut self, points: u32) {
        self.draws += 1;
        self.score += points;
        self.matches_played += 1;
    }

    pub(crate) fn record_loss(&mut self, points: u32) {
        self.losses += 1;
        self.score += points;
        self.matches_played += 1;
    }

    /// Returns true when this failure crossed `threshold` and deactivated the player.
    pub(crate) fn record_unreachable(&mut self, threshold: u32) -> bool {
        self.consecutive_failures += 1;
        if self.active && self.consecutive_failures >= threshold {
            self.active = false;
            return true;
        }
        false
    }

    pub(crate) fn record_reachable(&mut self) {
        self.consecutive_failures = 0;
    }
}

/// Everything the League Manager knows about a referee.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefereeRecord {
    pub referee_id: RefereeId,
    pub endpoint: Endpoint,
    #[serde(skip)]
    pub auth_token: String,
    pub game_types: Vec<String>,
    pub max_concurrent_matches: u32,
    pub active_match_count: u32,
}

impl RefereeRecord {
    pub fn new(
        referee_id: RefereeId,
        endpoint: Endpoint,
        game_types: Vec<String>,
        max_concurrent_matches: u32,
    ) -> RefereeRecord {
        RefereeRecord {
            referee_id,
            endpoint,
            auth_token: new_auth_token(),
            game_types,
            max_concurrent_matches,
            active_match_count: 0,
        }
    }

    pub fn supports(&self, game_type: &str) -> bool {
        self.game_types.iter().any(|g| g == game_type)
    }

    pub fn has_free_slot(&self) -> bool {
        self.active_match_count < self.max_concurrent_matches
    }

    pub fn can_take(&self, game_type: &str) -> bool {
        self.supports(game_type) && self.has_free_slot()
    }
}

fn new_auth_token() -> String {
    format!("tok_{}", uuid::Uuid::new_v4().simple())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_render_and_parse() {
        assert_eq!(PlayerId(3).to_string(), "P03");
        assert_eq!(RefereeId(12).to_string(), "REF12");
        assert_eq!("P07".parse::<PlayerId>(), Ok(PlayerId(7)));
        assert_eq!("REF01".parse::<RefereeId>(), Ok(RefereeId(1)));
        assert!("REF01".parse::<PlayerId>().is_err());
        assert!("P".parse::<PlayerId>().is_err());
    }

    #[test]
    fn ids_order_numerically() {
        assert!(PlayerId(9) < PlayerId(10));
        let json = serde_json::to_string(&PlayerId(10)).unwrap();
        assert_eq!(json, "\"P10\"");
        assert_eq!(serde_json::from_str::<PlayerId>(&json).unwrap(), PlayerId(10));
    }

    #[test]
    fn unreachable_player_is_deactivated_once() {
        let mut p = PlayerRecord::new(PlayerId(1), "alice".into(), Endpoint::from("a"));
        assert!(!p.record_unreachable(2));
        assert!(p.record_unreachable(2));
        assert!(!p.active);
        assert!(!p.record_unreachable(2));
        p.record_reachable();
        assert_eq!(p.consecutive_failures, 0);
    }

    #[test]
    fn referee_capacity() {
        let mut r = RefereeRecord::new(RefereeId(1), Endpoint::from("r"), vec!["sum".into()], 1);
        assert!(r.can_take("sum"));
        assert!(!r.can_take("chess"));
        r.active_match_count = 1;
        assert!(!r.can_take("sum"));
    }

    #[test]
    fn tokens_are_unique() {
        let a = PlayerRecord::new(PlayerId(1), "a".into(), Endpoint::from("a"));
        let b = PlayerRecord::new(PlayerId(2), "b".into(), Endpoint::from("b"));
        assert_ne!(a.auth_token, b.auth_token);
        assert!(a.auth_token.starts_with("tok_"));
    }
}
