//! Config for the league agents behaviors
//!
//! This module provides configuration options shared by the League Manager, referees and
//! players: timeouts for every kind of outbound call, retry policy, scoring and scheduling.
//!
//! Configuration can be created programmatically using [`Configuration::new()`] or by reading
//! environment variables using [`Configuration::from_env()`].
//!
//! # Environment Variables
//!
//! All values are optional. Flags are case-insensitive and enabled by `"true"`; durations are
//! given in milliseconds.
//!
//! - `LEAGUE_LOG` — Enable logging to a file (default: `false`)
//! - `LEAGUE_AUTO_ADVANCE` — Start the next round as soon as one completes (default: `true`)
//! - `LEAGUE_MAX_PLAYERS` — Player cap (default: `64`)
//! - `LEAGUE_BEST_OF` — Rounds per match, majority wins (default: `5`)
//! - `LEAGUE_POINTS_WIN`, `LEAGUE_POINTS_DRAW`, `LEAGUE_POINTS_LOSS` — (default: `3`, `1`, `0`)
//! - `LEAGUE_REGISTRATION_TIMEOUT_MS` — (default: `10000`)
//! - `LEAGUE_INVITE_TIMEOUT_MS` — (default: `5000`)
//! - `LEAGUE_MOVE_TIMEOUT_MS` — (default: `30000`)
//! - `LEAGUE_NOTIFY_TIMEOUT_MS` — (default: `5000`)
//! - `LEAGUE_REPORT_TIMEOUT_MS` — (default: `10000`)
//! - `LEAGUE_RESULT_TIMEOUT_MS` — How long the League Manager waits for a referee report
//!   (default: `600000`)
//! - `LEAGUE_ASSIGNMENT_RETRIES` — Re-sent assignments before a double forfeit (default: `2`)
//! - `LEAGUE_RETRY_ATTEMPTS` — Attempts for retried calls (default: `5`)
//! - `LEAGUE_BACKOFF_BASE_MS`, `LEAGUE_BACKOFF_MAX_MS` — (default: `100`, `5000`)
//! - `LEAGUE_DECISION_MARGIN_MS` — Player side safety margin (default: `500`)
//! - `LEAGUE_MATCH_IDLE_TIMEOUT_MS` — (default: `120000`)
//! - `LEAGUE_UNREACHABLE_THRESHOLD` — (default: `3`)
//! - `LEAGUE_SUSPEND_THRESHOLD` — (default: `3`)

use std::time::Duration;

use anyhow::bail;

use crate::retry::RetryPolicy;

/// Configuration for league agents behaviors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Configuration {
    pub(crate) log: bool,
    pub(crate) auto_advance: bool,
    pub(crate) max_players: usize,
    pub(crate) best_of: u32,
    pub(crate) points_for_win: u32,
    pub(crate) points_for_draw: u32,
    pub(crate) points_for_loss: u32,
    pub(crate) registration_timeout: Duration,
    pub(crate) invite_timeout: Duration,
    pub(crate) move_timeout: Duration,
    pub(crate) notify_timeout: Duration,
    pub(crate) report_timeout: Duration,
    pub(crate) result_timeout: Duration,
    pub(crate) max_assignment_retries: u32,
    pub(crate) retry_attempts: u32,
    pub(crate) backoff_base: Duration,
    pub(crate) backoff_max: Duration,
    pub(crate) decision_margin: Duration,
    pub(crate) match_idle_timeout: Duration,
    pub(crate) unreachable_threshold: u32,
    pub(crate) suspend_threshold: u32,
}

impl Configuration {
    /// Create a new configuration with default parameters.
    ///
    /// By default:
    /// - Logging to file is disabled.
    /// - Rounds advance automatically.
    /// - Matches are best of 5, scored 3/1/0.
    /// - Invitations wait 5s, moves 30s, notifications 5s, reports 10s.
    /// - A referee has 10 minutes to report, and two more chances before a double forfeit.
    pub fn new() -> Self {
        Self {
            log: false,
            auto_advance: true,
            max_players: 64,
            best_of: 5,
            points_for_win: 3,
            points_for_draw: 1,
            points_for_loss: 0,
            registration_timeout: Duration::from_secs(10),
            invite_timeout: Duration::from_secs(5),
            move_timeout: Duration::from_secs(30),
            notify_timeout: Duration::from_secs(5),
            report_timeout: Duration::from_secs(10),
            result_timeout: Duration::from_secs(600),
            max_assignment_retries: 2,
            retry_attempts: 5,
            backoff_base: Duration::from_millis(100),
            backoff_max: Duration::from_secs(5),
            decision_margin: Duration::from_millis(500),
            match_idle_timeout: Duration::from_secs(120),
            unreachable_threshold: 3,
            suspend_threshold: 3,
        }
    }

    /// Create configuration from environment variables.
    ///
    /// See the module documentation for the recognized variables. Any unset or unparsable
    /// variable keeps its default value.
    pub fn from_env() -> Self {
        fn get_env_flag(var: &str, default: bool) -> bool {
            match std::env::var(var) {
                Ok(val) => val.eq_ignore_ascii_case("true"),
                Err(_) => default,
            }
        }

        fn get_env_u32(var: &str, default: u32) -> u32 {
            std::env::var(var)
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default)
        }

        fn get_env_millis(var: &str, default: Duration) -> Duration {
            std::env::var(var)
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_millis)
                .unwrap_or(default)
        }

        let d = Self::new();
        Self {
            log: get_env_flag("LEAGUE_LOG", d.log),
            auto_advance: get_env_flag("LEAGUE_AUTO_ADVANCE", d.auto_advance),
            max_players: get_env_u32("LEAGUE_MAX_PLAYERS", d.max_players as u32) as usize,
            best_of: get_env_u32("LEAGUE_BEST_OF", d.best_of),
            points_for_win: get_env_u32("LEAGUE_POINTS_WIN", d.points_for_win),
            points_for_draw: get_env_u32("LEAGUE_POINTS_DRAW", d.points_for_draw),
            points_for_loss: get_env_u32("LEAGUE_POINTS_LOSS", d.points_for_loss),
            registration_timeout: get_env_millis(
                "LEAGUE_REGISTRATION_TIMEOUT_MS",
                d.registration_timeout,
            ),
            invite_timeout: get_env_millis("LEAGUE_INVITE_TIMEOUT_MS", d.invite_timeout),
            move_timeout: get_env_millis("LEAGUE_MOVE_TIMEOUT_MS", d.move_timeout),
            notify_timeout: get_env_millis("LEAGUE_NOTIFY_TIMEOUT_MS", d.notify_timeout),
            report_timeout: get_env_millis("LEAGUE_REPORT_TIMEOUT_MS", d.report_timeout),
            result_timeout: get_env_millis("LEAGUE_RESULT_TIMEOUT_MS", d.result_timeout),
            max_assignment_retries: get_env_u32(
                "LEAGUE_ASSIGNMENT_RETRIES",
                d.max_assignment_retries,
            ),
            retry_attempts: get_env_u32("LEAGUE_RETRY_ATTEMPTS", d.retry_attempts),
            backoff_base: get_env_millis("LEAGUE_BACKOFF_BASE_MS", d.backoff_base),
            backoff_max: get_env_millis("LEAGUE_BACKOFF_MAX_MS", d.backoff_max),
            decision_margin: get_env_millis("LEAGUE_DECISION_MARGIN_MS", d.decision_margin),
            match_idle_timeout: get_env_millis(
                "LEAGUE_MATCH_IDLE_TIMEOUT_MS",
                d.match_idle_timeout,
            ),
            unreachable_threshold: get_env_u32(
                "LEAGUE_UNREACHABLE_THRESHOLD",
                d.unreachable_threshold,
            ),
            suspend_threshold: get_env_u32("LEAGUE_SUSPEND_THRESHOLD", d.suspend_threshold),
        }
    }

    /// Checks that the configuration can actually run a league.
    ///
    /// # Errors
    /// Returned when values contradict each other, e.g. a decision margin longer than the
    /// move timeout.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.best_of == 0 {
            bail!("best_of must be at least 1");
        }
        if self.max_players < 2 {
            bail!("max_players must be at least 2, got {}", self.max_players);
        }
        if !(self.points_for_win >= self.points_for_draw
            && self.points_for_draw >= self.points_for_loss)
        {
            bail!(
                "points must satisfy win >= draw >= loss, got {}/{}/{}",
                self.points_for_win,
                self.points_for_draw,
                self.points_for_loss
            );
        }
        if self.decision_margin >= self.move_timeout {
            bail!(
                "decision margin ({:?}) must be shorter than the move timeout ({:?})",
                self.decision_margin,
                self.move_timeout
            );
        }
        if self.retry_attempts == 0 {
            bail!("retry_attempts must be at least 1");
        }
        if self.backoff_base > self.backoff_max {
            bail!("backoff base is greater than backoff max");
        }
        Ok(())
    }

    /// Wins needed to take a match: the majority of `best_of`.
    pub fn rounds_to_win(&self) -> u32 {
        self.best_of.div_ceil(2)
    }

    pub(crate) fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.retry_attempts, self.backoff_base, self.backoff_max)
    }

    /// Enable or disable logging to file.
    pub fn with_log(mut self, value: bool) -> Self {
        self.log = value;
        self
    }

    /// Enable or disable starting the next round automatically.
    ///
    /// When disabled, the operator calls `start_next_round` after each round.
    pub fn with_auto_advance(mut self, value: bool) -> Self {
        self.auto_advance = value;
        self
    }

    /// Sets the player cap.
    pub fn with_max_players(mut self, value: usize) -> Self {
        self.max_players = value;
        self
    }

    /// Sets the number of rounds per match. The first to the majority wins.
    pub fn with_best_of(mut self, value: u32) -> Self {
        self.best_of = value;
        self
    }

    /// Sets league points for a match win, draw and loss.
    pub fn with_points(mut self, win: u32, draw: u32, loss: u32) -> Self {
        self.points_for_win = win;
        self.points_for_draw = draw;
        self.points_for_loss = loss;
        self
    }

    /// Sets the timeout of registration calls.
    pub fn with_registration_timeout(mut self, value: Duration) -> Self {
        self.registration_timeout = value;
        self
    }

    /// Sets the deadline players have to acknowledge an invitation.
    pub fn with_invite_timeout(mut self, value: Duration) -> Self {
        self.invite_timeout = value;
        self
    }

    /// Sets the deadline players have to submit a move.
    pub fn with_move_timeout(mut self, value: Duration) -> Self {
        self.move_timeout = value;
        self
    }

    /// Sets the timeout of one-way notifications (round results, standings...).
    pub fn with_notify_timeout(mut self, value: Duration) -> Self {
        self.notify_timeout = value;
        self
    }

    /// Sets the timeout of a single result report attempt.
    pub fn with_report_timeout(mut self, value: Duration) -> Self {
        self.report_timeout = value;
        self
    }

    /// Sets how long the League Manager waits for a referee to report a match.
    pub fn with_result_timeout(mut self, value: Duration) -> Self {
        self.result_timeout = value;
        self
    }

    /// Sets how many times an unreported assignment is re-sent before a double forfeit.
    pub fn with_max_assignment_retries(mut self, value: u32) -> Self {
        self.max_assignment_retries = value;
        self
    }

    /// Sets the retry policy of retried calls (registration, result report).
    pub fn with_retry(mut self, attempts: u32, base: Duration, max: Duration) -> Self {
        self.retry_attempts = attempts;
        self.backoff_base = base;
        self.backoff_max = max;
        self
    }

    /// Sets the player side margin subtracted from the move deadline.
    pub fn with_decision_margin(mut self, value: Duration) -> Self {
        self.decision_margin = value;
        self
    }

    /// Sets how long a player waits for referee traffic before a match is considered stale.
    pub fn with_match_idle_timeout(mut self, value: Duration) -> Self {
        self.match_idle_timeout = value;
        self
    }

    /// Sets the number of consecutive failed notifications before a player is marked inactive.
    pub fn with_unreachable_threshold(mut self, value: u32) -> Self {
        self.unreachable_threshold = value;
        self
    }

    /// Sets the number of consecutive transport errors before a player suspends itself.
    pub fn with_suspend_threshold(mut self, value: u32) -> Self {
        self.suspend_threshold = value;
        self
    }
}

impl Default for Configuration {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = Configuration::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.rounds_to_win(), 3);
    }

    #[test]
    fn majority_threshold() {
        assert_eq!(Configuration::new().with_best_of(1).rounds_to_win(), 1);
        assert_eq!(Configuration::new().with_best_of(4).rounds_to_win(), 2);
        assert_eq!(Configuration::new().with_best_of(7).rounds_to_win(), 4);
    }

    #[test]
    fn rejects_impossible_values() {
        assert!(Configuration::new().with_best_of(0).validate().is_err());
        assert!(Configuration::new().with_points(1, 3, 0).validate().is_err());
        assert!(Configuration::new()
            .with_move_timeout(Duration::from_millis(100))
            .with_decision_margin(Duration::from_millis(200))
            .validate()
            .is_err());
        assert!(Configuration::new().with_max_players(1).validate().is_err());
    }

    #[test]
    fn env_overrides_defaults() {
        std::env::set_var("LEAGUE_BEST_OF", "7");
        std::env::set_var("LEAGUE_MOVE_TIMEOUT_MS", "1500");
        std::env::set_var("LEAGUE_AUTO_ADVANCE", "FALSE");
        let config = Configuration::from_env();
        std::env::remove_var("LEAGUE_BEST_OF");
        std::env::remove_var("LEAGUE_MOVE_TIMEOUT_MS");
        std::env::remove_var("LEAGUE_AUTO_ADVANCE");

        assert_eq!(config.best_of, 7);
        assert_eq!(config.move_timeout, Duration::from_millis(1500));
        assert!(!config.auto_advance);
        assert_eq!(config.invite_timeout, Duration::from_secs(5));
    }
}
