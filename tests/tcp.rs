use std::{sync::Arc, time::Duration};

use agent_league::{
    prelude::*,
    rpc::{MessageHandler, RpcResponse},
    transport::{read_json_frame, write_frame},
};
use serde_json::json;
use tokio::{net::TcpStream, sync::watch};

use crate::games::{Fixed, Parity, SumParity};

mod games;

/// Binds a server, builds the agent knowing its endpoint, then serves it.
async fn serve<H, F>(shutdown: &watch::Receiver<bool>, build: F) -> H
where
    H: MessageHandler + Clone,
    F: FnOnce(Endpoint) -> H,
{
    let server = AgentServer::bind("127.0.0.1:0").await.unwrap();
    let agent = build(server.endpoint());
    let dispatcher = Arc::new(Dispatcher::new(Arc::new(agent.clone())));
    tokio::spawn(server.run(dispatcher, shutdown.clone()));
    agent
}

#[tokio::test]
async fn league_over_tcp() {
    let (stop, shutdown) = watch::channel(false);
    let transport: Arc<dyn Transport> = Arc::new(TcpTransport::new());
    let config = Configuration::new()
        .with_best_of(3)
        .with_invite_timeout(Duration::from_secs(1))
        .with_move_timeout(Duration::from_secs(1))
        .with_notify_timeout(Duration::from_secs(1))
        .with_retry(3, Duration::from_millis(10), Duration::from_millis(100));

    let manager = serve(&shutdown, |endpoint| {
        LeagueManager::new("tcp-league", "sum_parity", transport.clone(), endpoint, config)
    })
    .await;
    let league = manager.endpoint().clone();

    let referee = serve(&shutdown, |endpoint| {
        Referee::new(SumParity, transport.clone(), endpoint, league.clone(), config)
    })
    .await;
    let even = serve(&shutdown, |endpoint| {
        Player::new("even", Fixed(2), transport.clone(), endpoint, league.clone(), config)
    })
    .await;
    let parity = serve(&shutdown, |endpoint| {
        Player::new("parity", Parity, transport.clone(), endpoint, league.clone(), config)
    })
    .await;

    let referee_id = referee.register_with_league().await.unwrap().id;
    assert_eq!(referee_id, RefereeId(1));
    assert_eq!(even.register_with_league().await.unwrap().id, PlayerId(1));
    assert_eq!(parity.register_with_league().await.unwrap().id, PlayerId(2));

    manager.start_league(2).await.unwrap();
    manager.start_next_round().await.unwrap();
    let done = tokio::time::timeout(Duration::from_secs(20), manager.wait_for_completion())
        .await
        .expect("league did not complete in time")
        .expect("league outcome");

    assert_eq!(done.standings.len(), 2);
    assert!(done.champion.is_some());
    assert_eq!(even.league_result(), Some(done.clone()));
    assert_eq!(parity.league_result(), Some(done.clone()));
    assert_eq!(even.stats().matches_played + parity.stats().matches_played, 2);
    let report = referee.completed_report("R1M1").unwrap();
    assert!(report.score_a.max(report.score_b) >= 2);

    // Anything that is not a request is answered, not dropped.
    let mut stream = TcpStream::connect(league.as_str()).await.unwrap();
    write_frame(&mut stream, &json!({ "hello": "league" }), &league)
        .await
        .unwrap();
    let response: RpcResponse = read_json_frame(&mut stream, &league).await.unwrap();
    assert_eq!(response.error.unwrap().code, ErrorCode::MalformedMessage);

    let _ = stop.send(true);
}
