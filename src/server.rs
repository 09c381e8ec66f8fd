//! TCP front door of an agent.
//!
//! [`AgentServer`] accepts connections and spawns one task per connection. Each connection
//! carries exactly one request frame and one response frame, then gets closed.
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use agent_league::rpc::{Dispatcher, MessageHandler};
//! # async fn serve(handler: Arc<dyn MessageHandler>) -> anyhow::Result<()> {
//! use agent_league::server::AgentServer;
//!
//! let server = AgentServer::bind("127.0.0.1:0").await?;
//! let endpoint = server.endpoint();
//! let (stop, stopped) = tokio::sync::watch::channel(false);
//! let task = tokio::spawn(server.run(Arc::new(Dispatcher::new(handler)), stopped));
//! // ... tell the league about `endpoint` ...
//! stop.send(true)?;
//! task.await?;
//! # Ok(())
//! # }
//! ```

use std::{sync::Arc, time::Duration};

use anyhow::Context;
use tokio::{
    net::{TcpListener, TcpStream},
    sync::watch,
};
use tracing::{debug, info, instrument, warn};

use crate::error::TransportError;
use crate::rpc::Dispatcher;
use crate::transport::{read_frame, write_frame, Endpoint};

/// Accepts connections and hands their request to a [`Dispatcher`].
pub struct AgentServer {
    listener: TcpListener,
    endpoint: Endpoint,
}

impl AgentServer {
    /// A connection has this long to send its request.
    const READ_TIMEOUT: Duration = Duration::from_secs(30);

    /// Binds a listener, `127.0.0.1:0` picks a free port.
    pub async fn bind(addr: &str) -> anyhow::Result<AgentServer> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("could not bind {addr}"))?;
        let endpoint = Endpoint::from(
            listener
                .local_addr()
                .context("listener has no local address")?,
        );
        Ok(AgentServer { listener, endpoint })
    }

    /// Where this server can be reached.
    pub fn endpoint(&self) -> Endpoint {
        self.endpoint.clone()
    }

    /// Serves until `shutdown` turns true or its sender is dropped.
    #[instrument(skip_all, fields(endpoint = %self.endpoint))]
    pub async fn run(self, dispatcher: Arc<Dispatcher>, mut shutdown: watch::Receiver<bool>) {
        info!("listening");
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let dispatcher = dispatcher.clone();
                        tokio::spawn(async move {
                            let peer = Endpoint::from(peer);
                            if let Err(e) = serve_connection(stream, &peer, &dispatcher).await {
                                debug!(%peer, "connection dropped: {e}");
                                dispatcher.on_transport_error(&e);
                            }
                        });
                    }
                    Err(e) => warn!("accept failed: {e}"),
                },
            }
        }
        info!("stopped");
    }
}

async fn serve_connection(
    mut stream: TcpStream,
    peer: &Endpoint,
    dispatcher: &Dispatcher,
) -> Result<(), TransportError> {
    let payload = tokio::time::timeout(AgentServer::READ_TIMEOUT, read_frame(&mut stream, peer))
        .await
        .map_err(|_| TransportError::Timeout {
            endpoint: peer.clone(),
            timeout: AgentServer::READ_TIMEOUT,
        })??;
    let response = dispatcher.dispatch_bytes(&payload).await;
    write_frame(&mut stream, &response, peer).await
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use tokio::io::AsyncWriteExt;

    use super::*;
    use crate::error::{ErrorCode, RpcError};
    use crate::protocol::{Envelope, GameStart, Message};
    use crate::rpc::{MessageHandler, RpcClient, RpcResponse};
    use crate::transport::{read_json_frame, TcpTransport};

    struct AlwaysAck;

    #[async_trait]
    impl MessageHandler for AlwaysAck {
        fn identity(&self) -> String {
            "ack".into()
        }

        async fn handle(&self, _envelope: Envelope) -> Result<Message, RpcError> {
            Ok(Message::ack())
        }
    }

    #[tokio::test]
    async fn serves_requests_and_survives_garbage() {
        let server = AgentServer::bind("127.0.0.1:0").await.unwrap();
        let endpoint = server.endpoint();
        let (stop, stopped) = watch::channel(false);
        let task = tokio::spawn(server.run(Arc::new(Dispatcher::new(Arc::new(AlwaysAck))), stopped));

        // Valid frame, invalid JSON.
        let mut raw = TcpStream::connect(endpoint.as_str()).await.unwrap();
        raw.write_all(&5u32.to_be_bytes()).await.unwrap();
        raw.write_all(b"hello").await.unwrap();
        let response: RpcResponse = read_json_frame(&mut raw, &endpoint).await.unwrap();
        assert_eq!(response.error.unwrap().code, ErrorCode::MalformedMessage);

        let client = RpcClient::new(Arc::new(TcpTransport::new()), "test");
        let reply = client
            .call(
                &endpoint,
                Message::GameStart(GameStart {
                    game_id: "R1M1".into(),
                }),
                None,
                Duration::from_secs(2),
            )
            .await
            .unwrap();
        assert_eq!(reply, Message::ack());

        stop.send(true).unwrap();
        task.await.unwrap();
    }
}
