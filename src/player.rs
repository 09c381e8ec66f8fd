//! Player agent.
//!
//! ```text
//! INIT -> REGISTERING -> REGISTERED -> INVITED -> ACCEPTED -> IN_MATCH -> REGISTERED ... -> SHUTDOWN
//!                             \______________________ SUSPENDED _____________________/
//! ```
//!
//! Moves come from an injected [`Strategy`], run on a blocking worker and raced against a
//! deadline slightly shorter than the referee's.

use std::{
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};

use crate::agent::{PlayerCredentials, PlayerId};
use crate::configuration::Configuration;
use crate::error::{AgentError, CallError, ErrorCode, RpcError, TransportError};
use crate::game_interface::{DecisionContext, PastRound, Role, Strategy};
use crate::logger::init_logger;
use crate::protocol::{
    ChooseMoveCall, ChooseMoveResponse, Envelope, GameInvite, GameJoinAck, GameOver,
    LeagueCompleted, Message, PlayerRegisterRequest, RoundResult, Verdict,
};
use crate::retry::retry_call;
use crate::rpc::{unexpected, MessageHandler, RpcClient};
use crate::standings::StandingsEntry;
use crate::transport::{Endpoint, Transport};

/// Lifecycle of a player.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PlayerState {
    Init,
    Registering,
    Registered,
    Invited,
    Accepted,
    InMatch,
    /// Too many broken connections during a match, trying to register again.
    Suspended,
    Shutdown,
}

/// Results of this player, as told by referees.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerStats {
    pub matches_played: u32,
    pub wins: u32,
    pub draws: u32,
    pub losses: u32,
    /// Wins where the opponent never showed up.
    pub forfeit_wins: u32,
}

struct CurrentMatch<M> {
    game_id: String,
    role: Role,
    opponent: PlayerId,
    own_score: u32,
    opponent_score: u32,
    history: Vec<PastRound<M>>,
    last_activity: Instant,
}

impl<M> CurrentMatch<M> {
    fn is_stale(&self, idle_timeout: Duration) -> bool {
        self.last_activity.elapsed() > idle_timeout
    }
}

struct PlayerBook<M> {
    credentials: Option<PlayerCredentials>,
    current: Option<CurrentMatch<M>>,
    stats: PlayerStats,
    standings: Vec<StandingsEntry>,
    league_result: Option<LeagueCompleted>,
    transport_errors: u32,
}

/// A player driven by strategy `S`. Cheap to clone: clones share their state.
pub struct Player<S: Strategy> {
    strategy: Arc<S>,
    client: RpcClient,
    config: Configuration,
    display_name: String,
    endpoint: Endpoint,
    league_endpoint: Endpoint,
    book: Arc<Mutex<PlayerBook<S::Move>>>,
    state: Arc<watch::Sender<PlayerState>>,
}

impl<S: Strategy> Clone for Player<S> {
    fn clone(&self) -> Self {
        Self {
            strategy: self.strategy.clone(),
            client: self.client.clone(),
            config: self.config,
            display_name: self.display_name.clone(),
            endpoint: self.endpoint.clone(),
            league_endpoint: self.league_endpoint.clone(),
            book: self.book.clone(),
            state: self.state.clone(),
        }
    }
}

impl<S: Strategy> Player<S> {
    pub fn new(
        display_name: impl Into<String>,
        strategy: S,
        transport: Arc<dyn Transport>,
        endpoint: Endpoint,
        league_endpoint: Endpoint,
        config: Configuration,
    ) -> Self {
        let display_name = display_name.into();
        if config.log {
            if let Err(e) = init_logger("player") {
                warn!("file logging disabled: {e:#}");
            }
        }
        Self {
            strategy: Arc::new(strategy),
            client: RpcClient::new(transport, format!("player@{endpoint}")),
            config,
            display_name,
            endpoint,
            league_endpoint,
            book: Arc::new(Mutex::new(PlayerBook {
                credentials: None,
                current: None,
                stats: PlayerStats::default(),
                standings: vec![],
                league_result: None,
                transport_errors: 0,
            })),
            state: Arc::new(watch::channel(PlayerState::Init).0),
        }
    }

    fn book(&self) -> std::sync::MutexGuard<'_, PlayerBook<S::Move>> {
        self.book.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, state: PlayerState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!(?previous, ?state, "player state changed");
        }
    }

    pub fn state(&self) -> PlayerState {
        *self.state.borrow()
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn credentials(&self) -> Option<PlayerCredentials> {
        self.book().credentials.clone()
    }

    pub fn stats(&self) -> PlayerStats {
        self.book().stats
    }

    /// Last standings received from the League Manager.
    pub fn standings(&self) -> Vec<StandingsEntry> {
        self.book().standings.clone()
    }

    pub fn current_match(&self) -> Option<String> {
        self.book().current.as_ref().map(|m| m.game_id.clone())
    }

    pub fn league_result(&self) -> Option<LeagueCompleted> {
        self.book().league_result.clone()
    }

    /// Resolves once the league is over and this player shut down.
    pub async fn wait_for_shutdown(&self) {
        let mut rx = self.state.subscribe();
        let _ = rx.wait_for(|s| *s == PlayerState::Shutdown).await;
    }

    /// Registers with the League Manager. Safe to call again: the same credentials come back.
    #[instrument(skip_all, fields(name = %self.display_name))]
    pub async fn register_with_league(&self) -> Result<PlayerCredentials, AgentError> {
        self.set_state(PlayerState::Registering);
        let request = PlayerRegisterRequest {
            display_name: self.display_name.clone(),
            endpoint: self.endpoint.clone(),
        };
        let result = retry_call(self.config.retry_policy(), "player registration", || async {
            let reply = self
                .client
                .call(
                    &self.league_endpoint,
                    Message::PlayerRegisterRequest(request.clone()),
                    None,
                    self.config.registration_timeout,
                )
                .await?;
            match reply {
                Message::PlayerRegisterResponse(credentials) => Ok(credentials),
                other => Err(CallError::from(unexpected("PLAYER_REGISTER_RESPONSE", &other))),
            }
        })
        .await;

        match result {
            Ok(credentials) => {
                info!(player_id = %credentials.id, "registered");
                self.client.set_sender(format!("player:{}", credentials.id));
                {
                    let mut book = self.book();
                    book.credentials = Some(credentials.clone());
                    book.current = None;
                    book.transport_errors = 0;
                }
                self.set_state(PlayerState::Registered);
                Ok(credentials)
            }
            Err(e) => {
                error!(attempts = e.attempts, "registration failed: {}", e.last);
                self.set_state(PlayerState::Init);
                Err(AgentError::RegistrationFailed {
                    attempts: e.attempts,
                    reason: e.last.to_string(),
                })
            }
        }
    }

    fn on_invite(&self, invite: GameInvite) -> GameJoinAck {
        let decline = |invite: &GameInvite, why: &str| {
            info!(game_id = %invite.game_id, "invitation declined: {why}");
            GameJoinAck {
                game_id: invite.game_id.clone(),
                player_id: invite.player_id,
                accept: false,
            }
        };

        let mut book = self.book();
        let Some(me) = book.credentials.as_ref().map(|c| c.id) else {
            return decline(&invite, "not registered");
        };
        if invite.player_id != me {
            return decline(&invite, "addressed to another player");
        }
        if let Some(current) = &book.current {
            if current.game_id == invite.game_id {
                return GameJoinAck {
                    game_id: invite.game_id,
                    player_id: me,
                    accept: true,
                };
            }
            if !current.is_stale(self.config.match_idle_timeout) {
                return decline(&invite, "already in a match");
            }
            warn!(game_id = %current.game_id, "abandoning stale match");
            book.current = None;
            self.set_state(PlayerState::Registered);
        }
        if self.state() != PlayerState::Registered {
            return decline(&invite, "not available");
        }

        self.set_state(PlayerState::Invited);
        book.current = Some(CurrentMatch {
            game_id: invite.game_id.clone(),
            role: invite.role,
            opponent: invite.opponent_id,
            own_score: 0,
            opponent_score: 0,
            history: vec![],
            last_activity: Instant::now(),
        });
        self.set_state(PlayerState::Accepted);
        info!(game_id = %invite.game_id, opponent = %invite.opponent_id, role = ?invite.role, "invitation accepted");
        GameJoinAck {
            game_id: invite.game_id,
            player_id: me,
            accept: true,
        }
    }

    fn not_in_match(game_id: &str) -> RpcError {
        RpcError::new(ErrorCode::NotInMatch, format!("not playing {game_id}"))
    }

    fn on_game_start(&self, game_id: &str) -> Result<Message, RpcError> {
        let mut book = self.book();
        match book.current.as_mut() {
            Some(current) if current.game_id == game_id => {
                current.last_activity = Instant::now();
                self.set_state(PlayerState::InMatch);
                Ok(Message::ack())
            }
            _ => Err(Self::not_in_match(game_id)),
        }
    }

    async fn on_choose_move(&self, call: ChooseMoveCall) -> Result<Message, RpcError> {
        let allowed = Duration::from_millis(call.deadline_ms);
        let budget = if self.config.decision_margin < allowed {
            allowed - self.config.decision_margin
        } else {
            allowed / 2
        };
        let (context, player_id) = {
            let mut book = self.book();
            let player_id = book
                .credentials
                .as_ref()
                .map(|c| c.id)
                .ok_or_else(|| Self::not_in_match(&call.game_id))?;
            let current = match book.current.as_mut() {
                Some(current) if current.game_id == call.game_id => current,
                _ => return Err(Self::not_in_match(&call.game_id)),
            };
            current.last_activity = Instant::now();
            let context = DecisionContext {
                match_id: call.game_id.clone(),
                round_number: call.round_id,
                role: current.role,
                own_score: call.current_scores.own,
                opponent_score: call.current_scores.opponent,
                history: current.history.clone(),
                deadline: Instant::now() + budget,
            };
            (context, player_id)
        };
        self.set_state(PlayerState::InMatch);

        let strategy = self.strategy.clone();
        let decision = tokio::task::spawn_blocking(move || strategy.decide_move(&context));
        let chosen = match tokio::time::timeout(budget, decision).await {
            Ok(Ok(chosen)) => chosen,
            Ok(Err(e)) => {
                error!(game_id = %call.game_id, "strategy failed: {e}");
                return Err(RpcError::new(ErrorCode::Internal, "strategy failed"));
            }
            Err(_) => {
                warn!(game_id = %call.game_id, round = call.round_id, ?budget, "no decision in time");
                return Err(RpcError::new(
                    ErrorCode::DecisionTimeout,
                    format!("no decision within {budget:?}"),
                ));
            }
        };
        let chosen = serde_json::to_value(&chosen)
            .map_err(|e| RpcError::new(ErrorCode::Internal, e.to_string()))?;
        debug!(game_id = %call.game_id, round = call.round_id, %chosen, "move chosen");
        Ok(Message::ChooseMoveResponse(ChooseMoveResponse {
            game_id: call.game_id,
            round_id: call.round_id,
            player_id,
            chosen,
        }))
    }

    fn on_round_result(&self, result: RoundResult) -> Result<Message, RpcError> {
        let mut book = self.book();
        let Some(current) = book
            .current
            .as_mut()
            .filter(|c| c.game_id == result.game_id)
        else {
            return Err(Self::not_in_match(&result.game_id));
        };
        current.last_activity = Instant::now();
        current.own_score = result.current_scores.own;
        current.opponent_score = result.current_scores.opponent;
        let own = serde_json::from_value(result.own_move.clone());
        let opponent = serde_json::from_value(result.opponent_move.clone());
        match (own, opponent) {
            (Ok(own_move), Ok(opponent_move)) => current.history.push(PastRound {
                round_number: result.round_number,
                own_move,
                opponent_move,
                verdict: result.outcome,
            }),
            _ => warn!(game_id = %result.game_id, "round moves do not fit the strategy"),
        }
        debug!(
            game_id = %result.game_id,
            round = result.round_number,
            outcome = ?result.outcome,
            own_defaulted = result.own_defaulted,
            "round result"
        );
        Ok(Message::ack())
    }

    fn on_game_over(&self, over: GameOver) -> Result<Message, RpcError> {
        let mut book = self.book();
        if !book
            .current
            .as_ref()
            .is_some_and(|c| c.game_id == over.game_id)
        {
            return Err(Self::not_in_match(&over.game_id));
        }
        let opponent = book.current.take().map(|c| c.opponent);
        let stats = &mut book.stats;
        stats.matches_played += 1;
        match over.outcome {
            Verdict::Win => {
                stats.wins += 1;
                if over.forfeit.is_some() {
                    stats.forfeit_wins += 1;
                }
            }
            Verdict::Draw => stats.draws += 1,
            Verdict::Loss => stats.losses += 1,
        }
        info!(game_id = %over.game_id, outcome = ?over.outcome, ?opponent, "match over");
        drop(book);
        self.set_state(PlayerState::Registered);
        Ok(Message::ack())
    }

    /// Tries to register again until it works or the league is over.
    async fn reconnect(&self) {
        while self.state() == PlayerState::Suspended {
            match self.register_with_league().await {
                Ok(_) => {
                    info!("reconnected");
                    return;
                }
                Err(e) => {
                    warn!("reconnection failed: {e}");
                    self.set_state(PlayerState::Suspended);
                    tokio::time::sleep(self.config.backoff_max).await;
                }
            }
        }
    }
}

#[async_trait]
impl<S: Strategy> MessageHandler for Player<S> {
    fn identity(&self) -> String {
        self.client.sender()
    }

    async fn handle(&self, envelope: Envelope) -> Result<Message, RpcError> {
        self.book().transport_errors = 0;
        match envelope.message {
            Message::GameInvite(invite) => Ok(Message::GameJoinAck(self.on_invite(invite))),
            Message::GameStart(start) => self.on_game_start(&start.game_id),
            Message::ChooseMoveCall(call) => self.on_choose_move(call).await,
            Message::RoundResult(result) => self.on_round_result(result),
            Message::GameOver(over) => self.on_game_over(over),
            Message::LeagueStandingsUpdate(update) => {
                debug!(round = update.round_number, "standings received");
                self.book().standings = update.standings;
                Ok(Message::ack())
            }
            Message::LeagueCompleted(done) => {
                info!(champion = ?done.champion, "league completed, shutting down");
                {
                    let mut book = self.book();
                    book.standings = done.standings.clone();
                    book.league_result = Some(done);
                    book.current = None;
                }
                self.set_state(PlayerState::Shutdown);
                Ok(Message::ack())
            }
            other => Err(RpcError::new(
                ErrorCode::UnexpectedMessage,
                format!("player does not handle {}", other.message_type()),
            )),
        }
    }

    fn on_transport_error(&self, error: &TransportError) {
        if !matches!(self.state(), PlayerState::Accepted | PlayerState::InMatch) {
            return;
        }
        let errors = {
            let mut book = self.book();
            book.transport_errors += 1;
            book.transport_errors
        };
        warn!(errors, "transport error during a match: {error}");
        if errors >= self.config.suspend_threshold {
            warn!("suspended, reconnecting");
            self.set_state(PlayerState::Suspended);
            let this = self.clone();
            tokio::spawn(async move { this.reconnect().await });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::league_manager::LeagueManager;
    use crate::rpc::Dispatcher;
    use crate::transport::LocalNetwork;

    struct Two;

    impl Strategy for Two {
        type Move = u8;

        fn decide_move(&self, _context: &DecisionContext<u8>) -> u8 {
            2
        }
    }

    fn broken_link() -> TransportError {
        TransportError::Io {
            endpoint: Endpoint::from("referee"),
            reason: "connection reset".into(),
        }
    }

    async fn registered_player(config: Configuration) -> Player<Two> {
        let network = LocalNetwork::new();
        let transport: Arc<dyn Transport> = Arc::new(network.clone());
        let league = Endpoint::from("league");
        let manager = LeagueManager::new("test", "sum", transport.clone(), league.clone(), config);
        network.attach(league.clone(), Arc::new(Dispatcher::new(Arc::new(manager))));
        let player = Player::new("p", Two, transport, Endpoint::from("p"), league, config);
        player.register_with_league().await.unwrap();
        player
    }

    #[tokio::test]
    async fn errors_outside_a_match_are_ignored() {
        let player = registered_player(Configuration::new().with_suspend_threshold(1)).await;
        player.on_transport_error(&broken_link());
        assert_eq!(player.state(), PlayerState::Registered);
    }

    #[tokio::test]
    async fn broken_match_suspends_then_reconnects() {
        let player = registered_player(Configuration::new().with_suspend_threshold(2)).await;
        let id = player.credentials().unwrap().id;

        player.set_state(PlayerState::InMatch);
        player.on_transport_error(&broken_link());
        assert_eq!(player.state(), PlayerState::InMatch);
        player.on_transport_error(&broken_link());

        let mut state = player.state.subscribe();
        tokio::time::timeout(
            Duration::from_secs(5),
            state.wait_for(|s| *s == PlayerState::Registered),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(player.credentials().unwrap().id, id);
        assert!(player.current_match().is_none());
    }
}
