//! League Manager: registrations, round-robin schedule, result application and standings.
//!
//! ```text
//! REGISTRATION -> READY -> IN_PROGRESS -> COMPLETED
//! ```
//!
//! Everything the league knows lives in one registry behind an async mutex. Every mutation is
//! one critical section that never waits on the network: what has to be sent afterwards is
//! collected while the lock is held and sent once it is released.

use std::{collections::BTreeMap, fmt, sync::Arc};

use async_trait::async_trait;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Mutex};
use tracing::{error, info, instrument, warn};

use crate::agent::{
    PlayerCredentials, PlayerId, PlayerRecord, RefereeCredentials, RefereeId, RefereeRecord,
};
use crate::configuration::Configuration;
use crate::error::{ErrorCode, LeagueError, RpcError};
use crate::logger::init_logger;
use crate::protocol::{
    Ack, Envelope, ForfeitNotice, ForfeitReason, LeagueCompleted, LeagueStandingsUpdate,
    MatchAssignment, MatchOutcome, MatchResultReport, MatchRules, Message, RoundAnnouncement,
};
use crate::round_scheduler::{MatchStatus, RoundScheduler};
use crate::rpc::{MessageHandler, RpcClient};
use crate::schedule::Schedule;
use crate::standings::{compute_standings, StandingsEntry};
use crate::transport::{Endpoint, Transport};

/// Lifecycle of a league.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LeagueState {
    /// Agents may register.
    Registration,
    /// Schedule generated, first round not started.
    Ready,
    InProgress,
    Completed,
}

impl fmt::Display for LeagueState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Registration => "REGISTRATION",
            Self::Ready => "READY",
            Self::InProgress => "IN_PROGRESS",
            Self::Completed => "COMPLETED",
        };
        f.write_str(s)
    }
}

struct LeagueRegistry {
    state: LeagueState,
    players: BTreeMap<PlayerId, PlayerRecord>,
    referees: BTreeMap<RefereeId, RefereeRecord>,
    schedule: Schedule,
    scheduler: RoundScheduler,
    champion: Option<PlayerId>,
}

impl LeagueRegistry {
    fn expect_state(&self, expected: LeagueState, operation: &'static str) -> Result<(), LeagueError> {
        if self.state != expected {
            return Err(LeagueError::InvalidState {
                operation,
                state: self.state.to_string(),
            });
        }
        Ok(())
    }
}

/// Announcement to send to one referee.
struct Dispatch {
    endpoint: Endpoint,
    round_number: u32,
    /// Assignments with the generation their watchdog checks.
    assignments: Vec<(MatchAssignment, u64)>,
}

/// What to send once the registry is unlocked.
#[derive(Default)]
struct FollowUp {
    dispatch: Vec<Dispatch>,
    standings: Option<LeagueStandingsUpdate>,
    completed: Option<LeagueCompleted>,
    advance: bool,
    players: Vec<(PlayerId, Endpoint)>,
    referees: Vec<Endpoint>,
}

struct Inner {
    league_id: String,
    game_type: String,
    endpoint: Endpoint,
    config: Configuration,
    client: RpcClient,
    registry: Mutex<LeagueRegistry>,
    outcome: watch::Sender<Option<LeagueCompleted>>,
}

/// Handle on a league. Cheap to clone: clones drive the same league.
#[derive(Clone)]
pub struct LeagueManager {
    inner: Arc<Inner>,
}

impl LeagueManager {
    pub fn new(
        league_id: impl Into<String>,
        game_type: impl Into<String>,
        transport: Arc<dyn Transport>,
        endpoint: Endpoint,
        config: Configuration,
    ) -> LeagueManager {
        if config.log {
            if let Err(e) = init_logger("league_manager") {
                warn!("file logging disabled: {e:#}");
            }
        }
        LeagueManager {
            inner: Arc::new(Inner {
                league_id: league_id.into(),
                game_type: game_type.into(),
                endpoint,
                config,
                client: RpcClient::new(transport, "league_manager"),
                registry: Mutex::new(LeagueRegistry {
                    state: LeagueState::Registration,
                    players: BTreeMap::new(),
                    referees: BTreeMap::new(),
                    schedule: Schedule::default(),
                    scheduler: RoundScheduler::new(),
                    champion: None,
                }),
                outcome: watch::channel(None).0,
            }),
        }
    }

    pub fn league_id(&self) -> &str {
        &self.inner.league_id
    }

    pub fn game_type(&self) -> &str {
        &self.inner.game_type
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.inner.endpoint
    }

    fn rules(&self) -> MatchRules {
        MatchRules::best_of(self.inner.config.best_of)
    }

    /// Registers a referee. The same endpoint always gets the same credentials back.
    #[instrument(skip(self, game_types), fields(league = %self.inner.league_id))]
    pub async fn register_referee(
        &self,
        endpoint: Endpoint,
        game_types: Vec<String>,
        max_concurrent_matches: u32,
    ) -> Result<RefereeCredentials, LeagueError> {
        let mut reg = self.inner.registry.lock().await;
        if let Some(known) = reg.referees.values().find(|r| r.endpoint == endpoint) {
            return Ok(RefereeCredentials {
                id: known.referee_id,
                auth_token: known.auth_token.clone(),
                league_id: self.inner.league_id.clone(),
            });
        }
        reg.expect_state(LeagueState::Registration, "register_referee")?;
        if !game_types.iter().any(|g| *g == self.inner.game_type) {
            return Err(LeagueError::UnsupportedGame(game_types.join(", ")));
        }

        let referee_id = RefereeId(reg.referees.len() as u32 + 1);
        let record = RefereeRecord::new(
            referee_id,
            endpoint,
            game_types,
            max_concurrent_matches.max(1),
        );
        let credentials = RefereeCredentials {
            id: referee_id,
            auth_token: record.auth_token.clone(),
            league_id: self.inner.league_id.clone(),
        };
        reg.referees.insert(referee_id, record);
        info!(%referee_id, max_concurrent_matches, "referee registered");
        Ok(credentials)
    }

    /// Registers a player.
    ///
    /// A known endpoint gets its credentials back in any state, which is how a suspended player
    /// reconnects.
    #[instrument(skip(self), fields(league = %self.inner.league_id))]
    pub async fn register_player(
        &self,
        display_name: String,
        endpoint: Endpoint,
    ) -> Result<PlayerCredentials, LeagueError> {
        let mut reg = self.inner.registry.lock().await;
        if let Some(known) = reg.players.values_mut().find(|p| p.endpoint == endpoint) {
            if !known.active {
                info!(player_id = %known.player_id, "inactive player is back");
            }
            known.active = true;
            known.record_reachable();
            return Ok(PlayerCredentials {
                id: known.player_id,
                auth_token: known.auth_token.clone(),
                league_id: self.inner.league_id.clone(),
            });
        }
        reg.expect_state(LeagueState::Registration, "register_player")?;
        let cap = self.inner.config.max_players;
        if reg.players.len() >= cap {
            return Err(LeagueError::LeagueFull { cap });
        }

        let player_id = PlayerId(reg.players.len() as u32 + 1);
        let record = PlayerRecord::new(player_id, display_name, endpoint);
        let credentials = PlayerCredentials {
            id: player_id,
            auth_token: record.auth_token.clone(),
            league_id: self.inner.league_id.clone(),
        };
        reg.players.insert(player_id, record);
        info!(%player_id, "player registered");
        Ok(credentials)
    }

    /// Closes registrations and generates the schedule.
    #[instrument(skip(self), fields(league = %self.inner.league_id))]
    pub async fn start_league(&self, min_players: usize) -> Result<(), LeagueError> {
        let mut reg = self.inner.registry.lock().await;
        reg.expect_state(LeagueState::Registration, "start_league")?;
        self.inner
            .config
            .validate()
            .map_err(|e| LeagueError::InvalidConfiguration(format!("{e:#}")))?;
        let required = min_players.max(2);
        if reg.players.len() < required {
            return Err(LeagueError::InsufficientPlayers {
                registered: reg.players.len(),
                required,
            });
        }
        let ids: Vec<PlayerId> = reg.players.keys().copied().collect();
        reg.schedule = Schedule::round_robin(&ids);
        reg.state = LeagueState::Ready;
        info!(
            players = ids.len(),
            rounds = reg.schedule.len(),
            matches = reg.schedule.total_matches(),
            "league ready"
        );
        Ok(())
    }

    /// Starts the next round and announces its matches to the referees. Returns its number.
    #[instrument(skip(self), fields(league = %self.inner.league_id))]
    pub async fn start_next_round(&self) -> Result<u32, LeagueError> {
        let (next, dispatch) = {
            let mut reg = self.inner.registry.lock().await;
            let startable = match reg.state {
                LeagueState::Ready => true,
                LeagueState::InProgress => reg.scheduler.is_round_complete(),
                _ => false,
            };
            if !startable {
                return Err(LeagueError::InvalidState {
                    operation: "start_next_round",
                    state: reg.state.to_string(),
                });
            }
            let next = reg.scheduler.round_number() + 1;
            let Some(round) = reg.schedule.round(next).cloned() else {
                return Err(LeagueError::InvalidState {
                    operation: "start_next_round",
                    state: reg.state.to_string(),
                });
            };
            let game_type = &self.inner.game_type;
            if !reg.referees.values().any(|r| r.can_take(game_type)) {
                let match_id = round
                    .pairings
                    .first()
                    .map(|p| p.match_id.clone())
                    .unwrap_or_default();
                return Err(LeagueError::NoAvailableReferee {
                    round: next,
                    match_id,
                });
            }

            reg.scheduler.begin_round(&round);
            reg.state = LeagueState::InProgress;
            if let Some(bye) = round.bye {
                info!(round = next, player_id = %bye, "bye");
            }
            info!(round = next, matches = round.pairings.len(), "round started");
            (next, self.hand_out(&mut reg))
        };
        self.dispatch(dispatch).await;
        Ok(next)
    }

    /// Applies a referee's report. Reporting an already applied match is a no-op acknowledged
    /// with `applied: false`.
    #[instrument(skip_all, fields(match_id = %report.match_id))]
    pub async fn report_match_result(
        &self,
        report: MatchResultReport,
        auth_token: Option<&str>,
    ) -> Result<Ack, LeagueError> {
        let follow_up = {
            let mut reg = self.inner.registry.lock().await;
            match reg.scheduler.status(&report.match_id) {
                MatchStatus::Applied => {
                    let known = reg
                        .referees
                        .values()
                        .any(|r| Some(r.auth_token.as_str()) == auth_token);
                    if !known {
                        return Err(LeagueError::Unauthorized(format!(
                            "token does not belong to a referee of {}",
                            self.inner.league_id
                        )));
                    }
                    info!("duplicate result ignored");
                    return Ok(Ack {
                        accepted: true,
                        applied: Some(false),
                        detail: Some(ErrorCode::DuplicateResult.to_string()),
                    });
                }
                MatchStatus::Pending | MatchStatus::Unknown => {
                    return Err(LeagueError::UnknownMatch(report.match_id));
                }
                MatchStatus::InFlight(assignment) => {
                    let assigned = reg.referees.get(&assignment.referee_id);
                    if assigned.is_none()
                        || assigned.map(|r| r.auth_token.as_str()) != auth_token
                    {
                        return Err(LeagueError::Unauthorized(format!(
                            "{} was assigned to {}",
                            assignment.match_id, assignment.referee_id
                        )));
                    }
                    validate_report(assignment, &report)?;
                }
            }
            self.apply(&mut reg, &report)
        };
        self.follow_up(follow_up);
        Ok(Ack {
            accepted: true,
            applied: Some(true),
            detail: None,
        })
    }

    /// Current standings, best first.
    pub async fn get_standings(&self) -> Vec<StandingsEntry> {
        let reg = self.inner.registry.lock().await;
        compute_standings(reg.players.values())
    }

    pub async fn state(&self) -> LeagueState {
        self.inner.registry.lock().await.state
    }

    pub async fn schedule(&self) -> Schedule {
        self.inner.registry.lock().await.schedule.clone()
    }

    /// Last started round, 0 before the first one.
    pub async fn current_round(&self) -> u32 {
        self.inner.registry.lock().await.scheduler.round_number()
    }

    pub async fn champion(&self) -> Option<PlayerId> {
        self.inner.registry.lock().await.champion
    }

    pub async fn player(&self, player_id: PlayerId) -> Option<PlayerRecord> {
        self.inner.registry.lock().await.players.get(&player_id).cloned()
    }

    pub async fn players(&self) -> Vec<PlayerRecord> {
        self.inner
            .registry
            .lock()
            .await
            .players
            .values()
            .cloned()
            .collect()
    }

    pub async fn referee(&self, referee_id: RefereeId) -> Option<RefereeRecord> {
        self.inner
            .registry
            .lock()
            .await
            .referees
            .get(&referee_id)
            .cloned()
    }

    /// Resolves with the final standings once the league is over and everybody was told.
    pub async fn wait_for_completion(&self) -> Option<LeagueCompleted> {
        let mut rx = self.inner.outcome.subscribe();
        let done = rx.wait_for(Option::is_some).await.ok()?;
        done.clone()
    }

    /// Hands waiting pairings to referees with a free slot.
    fn hand_out(&self, reg: &mut LeagueRegistry) -> Vec<Dispatch> {
        let rules = self.rules();
        let LeagueRegistry {
            scheduler,
            referees,
            players,
            ..
        } = reg;
        let assignments = scheduler.advance(referees, players, &self.inner.game_type, rules);

        let mut by_referee: BTreeMap<RefereeId, Dispatch> = BTreeMap::new();
        for assignment in assignments {
            let Some(referee) = referees.get(&assignment.referee_id) else {
                continue;
            };
            let generation = scheduler
                .in_flight(&assignment.match_id)
                .map(|m| m.generation)
                .unwrap_or_default();
            by_referee
                .entry(referee.referee_id)
                .or_insert_with(|| Dispatch {
                    endpoint: referee.endpoint.clone(),
                    round_number: assignment.round_number,
                    assignments: vec![],
                })
                .assignments
                .push((assignment, generation));
        }
        by_referee.into_values().collect()
    }

    /// Updates records for `report`, then figures out what comes next.
    fn apply(&self, reg: &mut LeagueRegistry, report: &MatchResultReport) -> FollowUp {
        let Some(done) = reg.scheduler.complete(&report.match_id) else {
            return FollowUp::default();
        };
        if let Some(referee) = reg.referees.get_mut(&done.assignment.referee_id) {
            referee.active_match_count = referee.active_match_count.saturating_sub(1);
        }

        let config = &self.inner.config;
        let (a, b) = (done.assignment.player_a.player_id, done.assignment.player_b.player_id);
        for player_id in [a, b] {
            let Some(player) = reg.players.get_mut(&player_id) else {
                continue;
            };
            match report.outcome {
                MatchOutcome::Winner { player_id: winner } if winner == player_id => {
                    player.record_win(config.points_for_win)
                }
                MatchOutcome::Winner { .. } | MatchOutcome::DoubleForfeit => {
                    player.record_loss(config.points_for_loss)
                }
                MatchOutcome::Draw => player.record_draw(config.points_for_draw),
            }
        }
        info!(
            outcome = ?report.outcome,
            score = %format!("{}-{}", report.score_a, report.score_b),
            forfeit = report.is_forfeit(),
            "result applied"
        );

        let mut follow_up = FollowUp {
            dispatch: self.hand_out(reg),
            ..FollowUp::default()
        };
        if reg.scheduler.is_round_complete() {
            let round_number = reg.scheduler.round_number();
            let standings = compute_standings(reg.players.values());
            info!(round = round_number, "round complete");
            follow_up.standings = Some(LeagueStandingsUpdate {
                round_number,
                standings: standings.clone(),
            });
            if round_number >= reg.schedule.len() {
                reg.state = LeagueState::Completed;
                reg.champion = standings.first().map(|e| e.player_id);
                info!(champion = ?reg.champion, "league completed");
                follow_up.completed = Some(LeagueCompleted {
                    league_id: self.inner.league_id.clone(),
                    champion: reg.champion,
                    standings,
                });
            } else {
                follow_up.advance = config.auto_advance;
            }
        }
        follow_up.players = reg
            .players
            .values()
            .map(|p| (p.player_id, p.endpoint.clone()))
            .collect();
        follow_up.referees = reg.referees.values().map(|r| r.endpoint.clone()).collect();
        follow_up
    }

    fn follow_up(&self, follow_up: FollowUp) {
        let this = self.clone();
        tokio::spawn(async move {
            this.dispatch(follow_up.dispatch).await;
            if let Some(update) = follow_up.standings {
                this.broadcast_to_players(
                    &follow_up.players,
                    Message::LeagueStandingsUpdate(update),
                )
                .await;
            }
            if let Some(done) = follow_up.completed {
                let message = Message::LeagueCompleted(done.clone());
                this.broadcast_to_players(&follow_up.players, message.clone())
                    .await;
                join_all(follow_up.referees.iter().map(|endpoint| {
                    this.inner.client.notify(
                        endpoint,
                        message.clone(),
                        None,
                        this.inner.config.notify_timeout,
                    )
                }))
                .await;
                this.inner.outcome.send_replace(Some(done));
            } else if follow_up.advance {
                if let Err(e) = this.start_next_round().await {
                    error!(code = %e.code(), "could not start the next round: {e}");
                }
            }
        });
    }

    /// Sends announcements and arms one watchdog per assignment.
    async fn dispatch(&self, dispatch: Vec<Dispatch>) {
        let sends = dispatch.into_iter().map(|d| {
            let Dispatch {
                endpoint,
                round_number,
                assignments,
            } = d;
            for (assignment, generation) in &assignments {
                self.arm_watchdog(assignment.match_id.clone(), *generation);
            }
            let announcement = RoundAnnouncement {
                round_number,
                match_assignments: assignments.into_iter().map(|(a, _)| a).collect(),
            };
            async move {
                let result = self
                    .inner
                    .client
                    .notify(
                        &endpoint,
                        Message::RoundAnnouncement(announcement),
                        None,
                        self.inner.config.notify_timeout,
                    )
                    .await;
                match result {
                    Ok(ack) if !ack.accepted => {
                        warn!(%endpoint, detail = ?ack.detail, "announcement partly refused")
                    }
                    Ok(_) => {}
                    Err(e) => warn!(%endpoint, "announcement not delivered: {e}"),
                }
            }
        });
        join_all(sends).await;
    }

    fn arm_watchdog(&self, match_id: String, generation: u64) {
        let this = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(this.inner.config.result_timeout).await;
            this.on_watchdog(match_id, generation).await;
        });
    }

    /// No report for `match_id` in time: send the assignment again, or give up with a double
    /// forfeit.
    #[instrument(skip(self))]
    async fn on_watchdog(&self, match_id: String, generation: u64) {
        let mut reg = self.inner.registry.lock().await;
        let Some(in_flight) = reg.scheduler.in_flight(&match_id) else {
            return;
        };
        if in_flight.generation != generation {
            return;
        }
        let assignment = in_flight.assignment.clone();

        if in_flight.resends < self.inner.config.max_assignment_retries {
            let resends = in_flight.resends + 1;
            let Some(next_generation) = reg.scheduler.mark_resent(&match_id) else {
                return;
            };
            let Some(endpoint) = reg
                .referees
                .get(&assignment.referee_id)
                .map(|r| r.endpoint.clone())
            else {
                return;
            };
            drop(reg);
            warn!(referee_id = %assignment.referee_id, resends, "no result yet, sending the assignment again");
            self.dispatch(vec![Dispatch {
                endpoint,
                round_number: assignment.round_number,
                assignments: vec![(assignment, next_generation)],
            }])
            .await;
            return;
        }

        error!(referee_id = %assignment.referee_id, "result never reported, double forfeit");
        let report = MatchResultReport {
            match_id: assignment.match_id.clone(),
            round_number: assignment.round_number,
            referee_id: assignment.referee_id,
            player_a: assignment.player_a.player_id,
            player_b: assignment.player_b.player_id,
            outcome: MatchOutcome::DoubleForfeit,
            score_a: 0,
            score_b: 0,
            rounds: vec![],
            forfeits: [assignment.player_a.player_id, assignment.player_b.player_id]
                .into_iter()
                .map(|player_id| ForfeitNotice {
                    player_id,
                    reason: ForfeitReason::ResultNotReported,
                })
                .collect(),
        };
        let follow_up = self.apply(&mut reg, &report);
        drop(reg);
        self.follow_up(follow_up);
    }

    /// Notifies every player, counting failures toward deactivation.
    async fn broadcast_to_players(&self, players: &[(PlayerId, Endpoint)], message: Message) {
        let results = join_all(players.iter().map(|(player_id, endpoint)| {
            let message = message.clone();
            async move {
                let result = self
                    .inner
                    .client
                    .notify(endpoint, message, None, self.inner.config.notify_timeout)
                    .await;
                (*player_id, result)
            }
        }))
        .await;

        let threshold = self.inner.config.unreachable_threshold;
        let mut reg = self.inner.registry.lock().await;
        for (player_id, result) in results {
            let Some(player) = reg.players.get_mut(&player_id) else {
                continue;
            };
            match result {
                Ok(_) => player.record_reachable(),
                Err(e) => {
                    warn!(%player_id, "notification failed: {e}");
                    if player.record_unreachable(threshold) {
                        warn!(%player_id, failures = player.consecutive_failures, "player marked inactive");
                    }
                }
            }
        }
    }
}

/// A report must be about the players of its assignment.
fn validate_report(
    assignment: &MatchAssignment,
    report: &MatchResultReport,
) -> Result<(), LeagueError> {
    let invalid = |reason: String| LeagueError::InvalidResult {
        match_id: report.match_id.clone(),
        reason,
    };
    let expected = (assignment.player_a.player_id, assignment.player_b.player_id);
    if (report.player_a, report.player_b) != expected {
        return Err(invalid(format!(
            "players {} and {} do not match the assignment",
            report.player_a, report.player_b
        )));
    }
    if report.round_number != assignment.round_number {
        return Err(invalid(format!("reported for round {}", report.round_number)));
    }
    if let MatchOutcome::Winner { player_id } = report.outcome {
        if player_id != expected.0 && player_id != expected.1 {
            return Err(invalid(format!("winner {player_id} did not play")));
        }
    }
    Ok(())
}

#[async_trait]
impl MessageHandler for LeagueManager {
    fn identity(&self) -> String {
        "league_manager".to_owned()
    }

    async fn handle(&self, envelope: Envelope) -> Result<Message, RpcError> {
        let auth_token = envelope.auth_token;
        match envelope.message {
            Message::RefereeRegisterRequest(request) => self
                .register_referee(
                    request.endpoint,
                    request.game_types,
                    request.max_concurrent_matches,
                )
                .await
                .map(Message::RefereeRegisterResponse)
                .map_err(RpcError::from),
            Message::PlayerRegisterRequest(request) => self
                .register_player(request.display_name, request.endpoint)
                .await
                .map(Message::PlayerRegisterResponse)
                .map_err(RpcError::from),
            Message::MatchResultReport(report) => self
                .report_match_result(report, auth_token.as_deref())
                .await
                .map(Message::Ack)
                .map_err(RpcError::from),
            other => Err(RpcError::new(
                ErrorCode::UnexpectedMessage,
                format!("league manager does not handle {}", other.message_type()),
            )),
        }
    }
}
