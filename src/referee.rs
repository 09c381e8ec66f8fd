//! Referee agent: registers with the league, runs the matches it is assigned and reports them.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, RwLock},
};

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::{error, info, instrument, warn};

use crate::agent::RefereeCredentials;
use crate::configuration::Configuration;
use crate::error::{AgentError, CallError, ErrorCode, RpcError};
use crate::game_interface::Game;
use crate::journal::ResultJournal;
use crate::logger::init_logger;
use crate::match_runner::{MatchRunner, MatchState};
use crate::protocol::{
    Ack, Envelope, LeagueCompleted, MatchAssignment, MatchResultReport, Message,
    RefereeRegisterRequest, RoundAnnouncement,
};
use crate::retry::retry_call;
use crate::rpc::{expect_ack, unexpected, MessageHandler, RpcClient};
use crate::transport::{Endpoint, Transport};

#[derive(Default)]
struct MatchBook {
    running: HashMap<String, watch::Receiver<MatchState>>,
    /// Reports of finished matches, delivered or journaled.
    completed: HashMap<String, MatchResultReport>,
}

/// A referee for game `G`.
///
/// Cheap to clone: clones share their state. Reachable through a
/// [`Dispatcher`](crate::rpc::Dispatcher) wrapping it.
pub struct Referee<G: Game> {
    game: Arc<G>,
    client: RpcClient,
    config: Configuration,
    endpoint: Endpoint,
    league_endpoint: Endpoint,
    max_concurrent_matches: u32,
    journal: Arc<ResultJournal>,
    credentials: Arc<RwLock<Option<RefereeCredentials>>>,
    matches: Arc<Mutex<MatchBook>>,
    league_completed: Arc<watch::Sender<Option<LeagueCompleted>>>,
}

impl<G: Game> Clone for Referee<G> {
    fn clone(&self) -> Self {
        Self {
            game: self.game.clone(),
            client: self.client.clone(),
            config: self.config,
            endpoint: self.endpoint.clone(),
            league_endpoint: self.league_endpoint.clone(),
            max_concurrent_matches: self.max_concurrent_matches,
            journal: self.journal.clone(),
            credentials: self.credentials.clone(),
            matches: self.matches.clone(),
            league_completed: self.league_completed.clone(),
        }
    }
}

impl<G: Game> Referee<G> {
    /// Matches run at once unless told otherwise.
    pub const DEFAULT_MAX_CONCURRENT_MATCHES: u32 = 4;

    /// Referee listening on `endpoint`, reporting to the League Manager at `league_endpoint`.
    pub fn new(
        game: G,
        transport: Arc<dyn Transport>,
        endpoint: Endpoint,
        league_endpoint: Endpoint,
        config: Configuration,
    ) -> Self {
        if config.log {
            if let Err(e) = init_logger("referee") {
                warn!("file logging disabled: {e:#}");
            }
        }
        let client = RpcClient::new(transport, format!("referee@{endpoint}"));
        Self {
            game: Arc::new(game),
            client,
            config,
            endpoint,
            league_endpoint,
            max_concurrent_matches: Self::DEFAULT_MAX_CONCURRENT_MATCHES,
            journal: Arc::new(ResultJournal::in_memory()),
            credentials: Arc::new(RwLock::new(None)),
            matches: Arc::new(Mutex::new(MatchBook::default())),
            league_completed: Arc::new(watch::channel(None).0),
        }
    }

    pub fn with_max_concurrent_matches(mut self, value: u32) -> Self {
        self.max_concurrent_matches = value.max(1);
        self
    }

    /// Where undeliverable results go, in memory by default.
    pub fn with_journal(mut self, journal: ResultJournal) -> Self {
        self.journal = Arc::new(journal);
        self
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn credentials(&self) -> Option<RefereeCredentials> {
        self.credentials
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn journal(&self) -> &ResultJournal {
        &self.journal
    }

    /// State of a running match, `None` once it is over.
    pub fn match_state(&self, match_id: &str) -> Option<MatchState> {
        self.book().running.get(match_id).map(|rx| *rx.borrow())
    }

    pub fn active_matches(&self) -> usize {
        self.book().running.len()
    }

    pub fn completed_report(&self, match_id: &str) -> Option<MatchResultReport> {
        self.book().completed.get(match_id).cloned()
    }

    fn book(&self) -> std::sync::MutexGuard<'_, MatchBook> {
        self.matches.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Registers with the League Manager, retrying transport failures.
    ///
    /// Registering again returns the same credentials.
    #[instrument(skip_all, fields(endpoint = %self.endpoint))]
    pub async fn register_with_league(&self) -> Result<RefereeCredentials, AgentError> {
        let request = RefereeRegisterRequest {
            endpoint: self.endpoint.clone(),
            game_types: vec![self.game.game_type().to_owned()],
            max_concurrent_matches: self.max_concurrent_matches,
        };
        let result = retry_call(self.config.retry_policy(), "referee registration", || async {
            let reply = self
                .client
                .call(
                    &self.league_endpoint,
                    Message::RefereeRegisterRequest(request.clone()),
                    None,
                    self.config.registration_timeout,
                )
                .await?;
            match reply {
                Message::RefereeRegisterResponse(credentials) => Ok(credentials),
                other => Err(CallError::from(unexpected("REFEREE_REGISTER_RESPONSE", &other))),
            }
        })
        .await;

        match result {
            Ok(credentials) => {
                info!(referee_id = %credentials.id, "registered");
                self.client.set_sender(format!("referee:{}", credentials.id));
                *self.credentials.write().unwrap_or_else(|e| e.into_inner()) =
                    Some(credentials.clone());
                Ok(credentials)
            }
            Err(e) => {
                error!(attempts = e.attempts, "registration failed: {}", e.last);
                Err(AgentError::RegistrationFailed {
                    attempts: e.attempts,
                    reason: e.last.to_string(),
                })
            }
        }
    }

    /// Resolves once the League Manager announced the end of the league.
    pub async fn wait_for_league_end(&self) -> Option<LeagueCompleted> {
        let mut rx = self.league_completed.subscribe();
        let done = rx.wait_for(Option::is_some).await.ok()?;
        done.clone()
    }

    fn on_round_announcement(&self, announcement: RoundAnnouncement) -> Result<Ack, AgentError> {
        let credentials = self.credentials().ok_or(AgentError::NotRegistered)?;
        let mut refused = vec![];
        let mut book = self.book();
        for assignment in announcement
            .match_assignments
            .into_iter()
            .filter(|a| a.referee_id == credentials.id)
        {
            if let Some(report) = book.completed.get(&assignment.match_id) {
                info!(match_id = %assignment.match_id, "already played, delivering the report again");
                let this = self.clone();
                let report = report.clone();
                tokio::spawn(async move { this.deliver(report).await });
                continue;
            }
            if book.running.contains_key(&assignment.match_id) {
                continue;
            }
            let refusal = if let Err(e) = assignment.rules.validate() {
                Some(format!("{e}"))
            } else if assignment.game_type != self.game.game_type() {
                Some(format!("{}: game {}", ErrorCode::UnsupportedGame, assignment.game_type))
            } else if book.running.len() as u32 >= self.max_concurrent_matches {
                Some(ErrorCode::CapacityExceeded.to_string())
            } else {
                None
            };
            if let Some(reason) = refusal {
                warn!(match_id = %assignment.match_id, "assignment refused: {reason}");
                refused.push(format!("{} ({reason})", assignment.match_id));
                continue;
            }

            let (tx, rx) = watch::channel(MatchState::Idle);
            book.running.insert(assignment.match_id.clone(), rx);
            let this = self.clone();
            tokio::spawn(async move { this.run_match(assignment, tx).await });
        }

        Ok(Ack {
            accepted: refused.is_empty(),
            applied: None,
            detail: (!refused.is_empty()).then(|| format!("refused: {}", refused.join(", "))),
        })
    }

    async fn run_match(&self, assignment: MatchAssignment, state: watch::Sender<MatchState>) {
        let match_id = assignment.match_id.clone();
        let runner = MatchRunner::new(self.game.clone(), self.client.clone(), self.config, state);
        let report = runner.run(assignment).await;
        {
            let mut book = self.book();
            book.running.remove(&match_id);
            book.completed.insert(match_id, report.clone());
        }
        self.deliver(report).await;
    }

    /// Sends `report` to the League Manager, journals it if that fails for good.
    #[instrument(skip_all, fields(match_id = %report.match_id))]
    async fn deliver(&self, report: MatchResultReport) {
        let token = self.credentials().map(|c| c.auth_token);
        let result = retry_call(self.config.retry_policy(), "result report", || async {
            let reply = self
                .client
                .call(
                    &self.league_endpoint,
                    Message::MatchResultReport(report.clone()),
                    token.as_deref(),
                    self.config.report_timeout,
                )
                .await?;
            expect_ack(reply).map_err(CallError::from)
        })
        .await;
        match result {
            Ok(ack) if ack.applied == Some(false) => info!("result already known to the league"),
            Ok(_) => info!("result delivered"),
            Err(e) => {
                error!(
                    attempts = e.attempts,
                    code = ?e.last.code(),
                    "result not delivered: {}", e.last
                );
                if let Err(e) = self.journal.persist(&report).await {
                    error!("result lost: {e:#}");
                }
            }
        }
    }
}

#[async_trait]
impl<G: Game> MessageHandler for Referee<G> {
    fn identity(&self) -> String {
        self.client.sender()
    }

    async fn handle(&self, envelope: Envelope) -> Result<Message, RpcError> {
        match envelope.message {
            Message::RoundAnnouncement(announcement) => self
                .on_round_announcement(announcement)
                .map(Message::Ack)
                .map_err(|e| RpcError::new(ErrorCode::InvalidState, e.to_string())),
            Message::LeagueCompleted(done) => {
                info!(champion = ?done.champion, "league completed");
                self.league_completed.send_replace(Some(done));
                Ok(Message::ack())
            }
            other => Err(RpcError::new(
                ErrorCode::UnexpectedMessage,
                format!("referee does not handle {}", other.message_type()),
            )),
        }
    }
}
