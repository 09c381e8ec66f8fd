//! One match, from invitations to the final report.
//!
//! ```text
//! IDLE -> WAITING_FOR_PLAYERS -> COLLECTING_MOVES -> RESOLVING_ROUND -> (loop) -> FINISHED
//! ```
//!
//! The referee is the only authority over outcomes: it asks for moves, replaces anything
//! missing, late or illegal by the game's default move, and resolves rounds itself.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::{
    sync::watch,
    time::{timeout_at, Instant},
};
use tracing::{debug, info, instrument, warn};

use crate::configuration::Configuration;
use crate::error::{CallError, ProtocolError, TransportError};
use crate::game_interface::{Game, GameContext, Outcome, Role};
use crate::protocol::{
    ChooseMoveCall, DefaultReason, ForfeitNotice, ForfeitReason, GameInvite, GameOver, GameStart,
    MatchAssignment, MatchOutcome, MatchResultReport, Message, Participant, PlayerMove,
    RoundRecord, RoundResult, Scores, Verdict,
};
use crate::rpc::{unexpected, RpcClient};

/// Where a match stands on the referee side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MatchState {
    Idle,
    WaitingForPlayers,
    CollectingMoves,
    ResolvingRound,
    Finished,
}

/// Rounds played so far in one match.
#[derive(Debug, Clone)]
pub struct MatchSession {
    pub assignment: MatchAssignment,
    pub rounds: Vec<RoundRecord>,
    pub wins_a: u32,
    pub wins_b: u32,
}

impl MatchSession {
    pub fn new(assignment: MatchAssignment) -> MatchSession {
        MatchSession {
            assignment,
            rounds: Vec::new(),
            wins_a: 0,
            wins_b: 0,
        }
    }

    /// A player reached the wins needed, or the round cap is hit.
    pub fn is_over(&self) -> bool {
        let rules = &self.assignment.rules;
        self.wins_a >= rules.rounds_to_win
            || self.wins_b >= rules.rounds_to_win
            || self.rounds.len() as u32 >= rules.max_rounds
    }

    pub fn next_round(&self) -> u32 {
        self.rounds.len() as u32 + 1
    }

    pub fn record(&mut self, round: RoundRecord) {
        match round.outcome {
            Outcome::PlayerA => self.wins_a += 1,
            Outcome::PlayerB => self.wins_b += 1,
            Outcome::Draw => {}
        }
        self.rounds.push(round);
    }

    pub fn scores_for(&self, role: Role) -> Scores {
        match role {
            Role::PlayerA => Scores {
                own: self.wins_a,
                opponent: self.wins_b,
            },
            Role::PlayerB => Scores {
                own: self.wins_b,
                opponent: self.wins_a,
            },
        }
    }

    /// Final outcome, asking `game` only when nobody reached the wins needed.
    pub fn verdict<G: Game>(&self, game: &G) -> Outcome {
        let needed = self.assignment.rules.rounds_to_win;
        if self.wins_a >= needed {
            Outcome::PlayerA
        } else if self.wins_b >= needed {
            Outcome::PlayerB
        } else {
            game.exhausted(self.wins_a, self.wins_b)
        }
    }

    fn report(&self, outcome: MatchOutcome, forfeits: Vec<ForfeitNotice>) -> MatchResultReport {
        let a = &self.assignment;
        MatchResultReport {
            match_id: a.match_id.clone(),
            round_number: a.round_number,
            referee_id: a.referee_id,
            player_a: a.player_a.player_id,
            player_b: a.player_b.player_id,
            outcome,
            score_a: self.wins_a,
            score_b: self.wins_b,
            rounds: self.rounds.clone(),
            forfeits,
        }
    }
}

fn match_outcome(outcome: Outcome, assignment: &MatchAssignment) -> MatchOutcome {
    match outcome.winner() {
        Some(role) => MatchOutcome::Winner {
            player_id: assignment.participant(role).player_id,
        },
        None => MatchOutcome::Draw,
    }
}

/// Runs one match for a referee.
pub struct MatchRunner<G: Game> {
    game: Arc<G>,
    client: RpcClient,
    config: Configuration,
    state: watch::Sender<MatchState>,
}

impl<G: Game> MatchRunner<G> {
    pub fn new(
        game: Arc<G>,
        client: RpcClient,
        config: Configuration,
        state: watch::Sender<MatchState>,
    ) -> Self {
        Self {
            game,
            client,
            config,
            state,
        }
    }

    fn set_state(&self, state: MatchState) {
        self.state.send_replace(state);
    }

    /// Plays `assignment` to the end. Never fails: whatever goes wrong on the player side ends
    /// up as default moves or forfeits in the report.
    #[instrument(skip_all, fields(match_id = %assignment.match_id))]
    pub async fn run(&self, assignment: MatchAssignment) -> MatchResultReport {
        self.set_state(MatchState::WaitingForPlayers);
        info!("starting match {assignment}");
        let mut session = MatchSession::new(assignment);

        let deadline = Instant::now() + self.config.invite_timeout;
        let a = &session.assignment;
        let (joined_a, joined_b) = tokio::join!(
            self.invite(a, Role::PlayerA, deadline),
            self.invite(a, Role::PlayerB, deadline)
        );

        let report = match (joined_a, joined_b) {
            (Ok(()), Ok(())) => self.play(&mut session).await,
            (Ok(()), Err(reason)) => self.forfeit(&session, Role::PlayerA, reason).await,
            (Err(reason), Ok(())) => self.forfeit(&session, Role::PlayerB, reason).await,
            (Err(reason_a), Err(reason_b)) => {
                warn!("no player joined, double forfeit");
                session.report(
                    MatchOutcome::DoubleForfeit,
                    vec![
                        ForfeitNotice {
                            player_id: session.assignment.player_a.player_id,
                            reason: reason_a,
                        },
                        ForfeitNotice {
                            player_id: session.assignment.player_b.player_id,
                            reason: reason_b,
                        },
                    ],
                )
            }
        };
        self.set_state(MatchState::Finished);
        report
    }

    async fn invite(
        &self,
        assignment: &MatchAssignment,
        role: Role,
        deadline: Instant,
    ) -> Result<(), ForfeitReason> {
        let me = assignment.participant(role);
        let opponent = assignment.participant(role.opponent());
        let invite = Message::GameInvite(GameInvite {
            game_id: assignment.match_id.clone(),
            game_type: assignment.game_type.clone(),
            player_id: me.player_id,
            opponent_id: opponent.player_id,
            role,
            rounds_to_win: assignment.rules.rounds_to_win,
            max_rounds: assignment.rules.max_rounds,
            deadline_ms: self.config.invite_timeout.as_millis() as u64,
        });
        let call = self
            .client
            .call(&me.endpoint, invite, None, self.config.invite_timeout);
        match timeout_at(deadline, call).await {
            Ok(Ok(Message::GameJoinAck(ack))) if ack.accept && ack.player_id == me.player_id => {
                debug!(player_id = %me.player_id, "joined");
                Ok(())
            }
            Ok(Ok(Message::GameJoinAck(_))) => {
                warn!(player_id = %me.player_id, "invitation declined");
                Err(ForfeitReason::Declined)
            }
            Ok(Err(CallError::Protocol(e))) => {
                warn!(player_id = %me.player_id, "invitation refused: {e}");
                Err(ForfeitReason::Declined)
            }
            Ok(Ok(other)) => {
                warn!(player_id = %me.player_id, "{}", unexpected("GAME_JOIN_ACK", &other));
                Err(ForfeitReason::Declined)
            }
            Ok(Err(e)) => {
                warn!(player_id = %me.player_id, "invitation failed: {e}");
                Err(ForfeitReason::NoResponse)
            }
            Err(_) => {
                warn!(player_id = %me.player_id, "invitation not acknowledged in time");
                Err(ForfeitReason::NoResponse)
            }
        }
    }

    async fn forfeit(
        &self,
        session: &MatchSession,
        present: Role,
        reason: ForfeitReason,
    ) -> MatchResultReport {
        let winner = session.assignment.participant(present);
        let absent = session.assignment.participant(present.opponent());
        warn!(winner = %winner.player_id, absent = %absent.player_id, ?reason, "forfeit");
        self.notify(
            winner,
            Message::GameOver(GameOver {
                game_id: session.assignment.match_id.clone(),
                outcome: Verdict::Win,
                forfeit: Some(reason),
                score: Scores::default(),
            }),
        )
        .await;
        session.report(
            MatchOutcome::Winner {
                player_id: winner.player_id,
            },
            vec![ForfeitNotice {
                player_id: absent.player_id,
                reason,
            }],
        )
    }

    async fn play(&self, session: &mut MatchSession) -> MatchResultReport {
        let a = session.assignment.player_a.clone();
        let b = session.assignment.player_b.clone();
        let game_id = session.assignment.match_id.clone();
        let start = || {
            Message::GameStart(GameStart {
                game_id: game_id.clone(),
            })
        };
        tokio::join!(self.notify(&a, start()), self.notify(&b, start()));

        while !session.is_over() {
            self.set_state(MatchState::CollectingMoves);
            let round_number = session.next_round();
            let deadline = Instant::now() + self.config.move_timeout;
            let (move_a, move_b) = tokio::join!(
                self.collect_move(session, Role::PlayerA, deadline),
                self.collect_move(session, Role::PlayerB, deadline)
            );

            self.set_state(MatchState::ResolvingRound);
            let outcome = self.game.resolve(&move_a.1, &move_b.1);
            debug!(round = round_number, ?outcome, "round resolved");
            session.record(RoundRecord {
                round_number,
                player_a: move_a.0,
                player_b: move_b.0,
                outcome,
            });

            let round_result = |role: Role| {
                let record = session.rounds.last()?;
                let (own, opponent) = record.for_role(role);
                Some(Message::RoundResult(RoundResult {
                    game_id: game_id.clone(),
                    round_number,
                    own_move: own.effective.clone(),
                    opponent_move: opponent.effective.clone(),
                    own_defaulted: own.is_default(),
                    opponent_defaulted: opponent.is_default(),
                    outcome: Verdict::for_role(outcome, role),
                    current_scores: session.scores_for(role),
                }))
            };
            if let (Some(for_a), Some(for_b)) = (round_result(Role::PlayerA), round_result(Role::PlayerB)) {
                tokio::join!(self.notify(&a, for_a), self.notify(&b, for_b));
            }
        }

        let outcome = session.verdict(self.game.as_ref());
        info!(
            score_a = session.wins_a,
            score_b = session.wins_b,
            ?outcome,
            "match finished"
        );
        let game_over = |role: Role| {
            Message::GameOver(GameOver {
                game_id: game_id.clone(),
                outcome: Verdict::for_role(outcome, role),
                forfeit: None,
                score: session.scores_for(role),
            })
        };
        tokio::join!(
            self.notify(&a, game_over(Role::PlayerA)),
            self.notify(&b, game_over(Role::PlayerB))
        );
        session.report(match_outcome(outcome, &session.assignment), vec![])
    }

    /// Move of `role` for the next round, and what gets recorded about it.
    async fn collect_move(
        &self,
        session: &MatchSession,
        role: Role,
        deadline: Instant,
    ) -> (PlayerMove, G::Move) {
        let player = session.assignment.participant(role);
        let context = GameContext {
            match_id: session.assignment.match_id.clone(),
            round_number: session.next_round(),
            role,
        };
        let call = self.client.call(
            &player.endpoint,
            Message::ChooseMoveCall(ChooseMoveCall {
                game_id: context.match_id.clone(),
                round_id: context.round_number,
                deadline_ms: self.config.move_timeout.as_millis() as u64,
                current_scores: session.scores_for(role),
            }),
            None,
            self.config.move_timeout,
        );

        let (submitted, reason) = match timeout_at(deadline, call).await {
            Ok(Ok(Message::ChooseMoveResponse(response)))
                if response.game_id == context.match_id
                    && response.round_id == context.round_number =>
            {
                match serde_json::from_value::<G::Move>(response.chosen.clone()) {
                    Ok(chosen) if self.game.is_legal(&context, &chosen) => {
                        let effective = serde_json::to_value(&chosen).unwrap_or(response.chosen);
                        return (
                            PlayerMove {
                                submitted: Some(effective.clone()),
                                effective,
                                default_reason: None,
                            },
                            chosen,
                        );
                    }
                    Ok(_) => (Some(response.chosen), DefaultReason::IllegalMove),
                    Err(_) => (Some(response.chosen), DefaultReason::MalformedMove),
                }
            }
            Ok(Ok(_)) => (None, DefaultReason::MalformedMove),
            Ok(Err(CallError::Transport(TransportError::Timeout { .. }))) | Err(_) => {
                (None, DefaultReason::Timeout)
            }
            Ok(Err(CallError::Transport(_))) => (None, DefaultReason::Unreachable),
            Ok(Err(CallError::Protocol(ProtocolError::Rejected(_)))) => {
                (None, DefaultReason::Rejected)
            }
            Ok(Err(CallError::Protocol(_))) => (None, DefaultReason::MalformedMove),
        };

        let fallback = self.game.default_move(&context);
        warn!(
            player_id = %player.player_id,
            round = context.round_number,
            ?reason,
            "default move applied"
        );
        (
            PlayerMove {
                submitted,
                effective: serde_json::to_value(&fallback).unwrap_or(Value::Null),
                default_reason: Some(reason),
            },
            fallback,
        )
    }

    async fn notify(&self, player: &Participant, message: Message) {
        let kind = message.message_type();
        if let Err(e) = self
            .client
            .notify(&player.endpoint, message, None, self.config.notify_timeout)
            .await
        {
            warn!(player_id = %player.player_id, "{kind} not delivered: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::json;

    use super::*;
    use crate::agent::{PlayerId, RefereeId};
    use crate::error::{ErrorCode, RpcError};
    use crate::protocol::{ChooseMoveResponse, Envelope, GameJoinAck, MatchRules};
    use crate::rpc::{Dispatcher, MessageHandler};
    use crate::transport::{Endpoint, LinkBehavior, LocalNetwork};

    struct SumParity;

    impl Game for SumParity {
        type Move = u32;

        fn game_type(&self) -> &str {
            "sum_parity"
        }

        fn legal_moves(&self, _context: &GameContext) -> Vec<u32> {
            (1..=10).collect()
        }

        fn default_move(&self, _context: &GameContext) -> u32 {
            1
        }

        fn resolve(&self, a: &u32, b: &u32) -> Outcome {
            if (a + b) % 2 == 1 {
                Outcome::PlayerA
            } else {
                Outcome::PlayerB
            }
        }
    }

    /// Answers every invite with `accept` and always plays `chosen`, after `think`.
    struct Scripted {
        id: PlayerId,
        accept: bool,
        chosen: Value,
        think: Duration,
    }

    #[async_trait]
    impl MessageHandler for Scripted {
        fn identity(&self) -> String {
            format!("player:{}", self.id)
        }

        async fn handle(&self, envelope: Envelope) -> Result<Message, RpcError> {
            match envelope.message {
                Message::GameInvite(invite) => Ok(Message::GameJoinAck(GameJoinAck {
                    game_id: invite.game_id,
                    player_id: self.id,
                    accept: self.accept,
                })),
                Message::ChooseMoveCall(call) => {
                    tokio::time::sleep(self.think).await;
                    Ok(Message::ChooseMoveResponse(ChooseMoveResponse {
                        game_id: call.game_id,
                        round_id: call.round_id,
                        player_id: self.id,
                        chosen: self.chosen.clone(),
                    }))
                }
                Message::GameStart(_) | Message::RoundResult(_) | Message::GameOver(_) => {
                    Ok(Message::ack())
                }
                other => Err(RpcError::new(
                    ErrorCode::UnexpectedMessage,
                    other.message_type(),
                )),
            }
        }
    }

    fn assignment(best_of: u32) -> MatchAssignment {
        MatchAssignment {
            match_id: "R1M1".into(),
            round_number: 1,
            game_type: "sum_parity".into(),
            referee_id: RefereeId(1),
            player_a: Participant {
                player_id: PlayerId(1),
                endpoint: Endpoint::from("p1"),
            },
            player_b: Participant {
                player_id: PlayerId(2),
                endpoint: Endpoint::from("p2"),
            },
            rules: MatchRules::best_of(best_of),
        }
    }

    fn setup(a: Scripted, b: Scripted) -> (LocalNetwork, MatchRunner<SumParity>, watch::Receiver<MatchState>) {
        let network = LocalNetwork::new();
        network.attach(Endpoint::from("p1"), Arc::new(Dispatcher::new(Arc::new(a))));
        network.attach(Endpoint::from("p2"), Arc::new(Dispatcher::new(Arc::new(b))));
        let config = Configuration::new()
            .with_invite_timeout(Duration::from_millis(200))
            .with_move_timeout(Duration::from_millis(200))
            .with_notify_timeout(Duration::from_millis(200))
            .with_decision_margin(Duration::from_millis(50));
        let (tx, rx) = watch::channel(MatchState::Idle);
        let runner = MatchRunner::new(
            Arc::new(SumParity),
            RpcClient::new(Arc::new(network.clone()), "referee:REF01"),
            config,
            tx,
        );
        (network, runner, rx)
    }

    fn player(id: u32, chosen: Value) -> Scripted {
        Scripted {
            id: PlayerId(id),
            accept: true,
            chosen,
            think: Duration::ZERO,
        }
    }

    #[tokio::test]
    async fn odd_sums_win_for_player_a() {
        let (_network, runner, state) = setup(player(1, json!(2)), player(2, json!(3)));
        let report = runner.run(assignment(5)).await;
        assert_eq!(
            report.outcome,
            MatchOutcome::Winner {
                player_id: PlayerId(1)
            }
        );
        assert_eq!((report.score_a, report.score_b), (3, 0));
        assert_eq!(report.rounds.len(), 3);
        assert!(report.forfeits.is_empty());
        assert_eq!(*state.borrow(), MatchState::Finished);
    }

    #[tokio::test]
    async fn illegal_move_is_replaced_by_default() {
        let (_network, runner, _state) = setup(player(1, json!(0)), player(2, json!(2)));
        let report = runner.run(assignment(1)).await;
        let round = &report.rounds[0];
        assert_eq!(round.player_a.submitted, Some(json!(0)));
        assert_eq!(round.player_a.effective, json!(1));
        assert_eq!(round.player_a.default_reason, Some(DefaultReason::IllegalMove));
        // 1 + 2 is odd
        assert_eq!(round.outcome, Outcome::PlayerA);
    }

    #[tokio::test]
    async fn garbage_move_is_malformed() {
        let (_network, runner, _state) = setup(player(1, json!("seven")), player(2, json!(2)));
        let report = runner.run(assignment(1)).await;
        assert_eq!(
            report.rounds[0].player_a.default_reason,
            Some(DefaultReason::MalformedMove)
        );
    }

    #[tokio::test]
    async fn slow_player_gets_default_after_timeout() {
        let mut slow = player(2, json!(4));
        slow.think = Duration::from_secs(2);
        let (_network, runner, _state) = setup(player(1, json!(2)), slow);
        let report = runner.run(assignment(1)).await;
        let b = &report.rounds[0].player_b;
        assert_eq!(b.default_reason, Some(DefaultReason::Timeout));
        assert_eq!(b.submitted, None);
        assert_eq!(b.effective, json!(1));
        // 2 + 1 is odd
        assert_eq!(report.outcome, MatchOutcome::Winner { player_id: PlayerId(1) });
    }

    #[tokio::test]
    async fn one_absent_player_forfeits() {
        let (network, runner, _state) = setup(player(1, json!(2)), player(2, json!(2)));
        network.set_behavior(&Endpoint::from("p2"), LinkBehavior::Refuse);
        let report = runner.run(assignment(3)).await;
        assert_eq!(
            report.outcome,
            MatchOutcome::Winner {
                player_id: PlayerId(1)
            }
        );
        assert_eq!(report.forfeits.len(), 1);
        assert_eq!(report.forfeits[0].player_id, PlayerId(2));
        assert_eq!(report.forfeits[0].reason, ForfeitReason::NoResponse);
        assert!(report.rounds.is_empty());
    }

    #[tokio::test]
    async fn nobody_joining_is_a_double_forfeit() {
        let mut a = player(1, json!(2));
        a.accept = false;
        let (network, runner, _state) = setup(a, player(2, json!(2)));
        network.set_behavior(&Endpoint::from("p2"), LinkBehavior::Blackhole);
        let report = runner.run(assignment(3)).await;
        assert_eq!(report.outcome, MatchOutcome::DoubleForfeit);
        let reasons: Vec<_> = report.forfeits.iter().map(|f| f.reason).collect();
        assert_eq!(reasons, [ForfeitReason::Declined, ForfeitReason::NoResponse]);
    }

    #[test]
    fn exhausted_session_asks_the_game() {
        let mut session = MatchSession::new(assignment(3));
        let draw = || RoundRecord {
            round_number: 1,
            player_a: PlayerMove {
                submitted: None,
                effective: json!(1),
                default_reason: None,
            },
            player_b: PlayerMove {
                submitted: None,
                effective: json!(1),
                default_reason: None,
            },
            outcome: Outcome::Draw,
        };
        for _ in 0..3 {
            assert!(!session.is_over());
            session.record(draw());
        }
        assert!(session.is_over());
        assert_eq!(session.verdict(&SumParity), Outcome::Draw);
    }
}
