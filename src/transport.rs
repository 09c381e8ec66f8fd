//! How requests reach other agents.
//!
//! Two implementations of [`Transport`]:
//! - [`TcpTransport`]: one TCP connection per call, length-prefixed JSON frames.
//! - [`LocalNetwork`]: agents living in the same process, with per-endpoint fault injection.
//!
//! A frame is a 4-byte big-endian length followed by that many bytes of JSON. Frames above
//! [`MAX_FRAME_SIZE`] and empty frames are rejected on both sides.

use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::TcpStream,
};
use tracing::trace;

use crate::error::TransportError;
use crate::rpc::{Dispatcher, RpcRequest, RpcResponse};

/// Largest accepted payload, in bytes.
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

const LENGTH_PREFIX_SIZE: usize = 4;

/// Address of an agent: `host:port` over TCP, any unique name on a [`LocalNetwork`].
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Endpoint(String);

impl Endpoint {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Endpoint {
    fn from(s: &str) -> Self {
        Endpoint(s.to_owned())
    }
}

impl From<String> for Endpoint {
    fn from(s: String) -> Self {
        Endpoint(s)
    }
}

impl From<std::net::SocketAddr> for Endpoint {
    fn from(addr: std::net::SocketAddr) -> Self {
        Endpoint(addr.to_string())
    }
}

/// Sends one request and waits for its response.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Fails with [`TransportError::Timeout`] when no response arrives within `timeout`.
    async fn call(
        &self,
        endpoint: &Endpoint,
        request: RpcRequest,
        timeout: Duration,
    ) -> Result<RpcResponse, TransportError>;
}

/// Serializes `value` and writes it as one frame.
pub async fn write_frame<W, T>(
    writer: &mut W,
    value: &T,
    peer: &Endpoint,
) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let payload = serde_json::to_vec(value).map_err(|e| TransportError::Codec(e.to_string()))?;
    if payload.is_empty() {
        return Err(TransportError::EmptyFrame);
    }
    if payload.len() > MAX_FRAME_SIZE {
        return Err(TransportError::FrameTooLarge {
            size: payload.len(),
            max: MAX_FRAME_SIZE,
        });
    }
    let io = |e: std::io::Error| TransportError::Io {
        endpoint: peer.clone(),
        reason: e.to_string(),
    };
    let length_prefix = (payload.len() as u32).to_be_bytes();
    writer.write_all(&length_prefix).await.map_err(io)?;
    writer.write_all(&payload).await.map_err(io)?;
    writer.flush().await.map_err(io)?;
    Ok(())
}

/// Reads the payload of one frame, undecoded.
pub async fn read_frame<R>(reader: &mut R, peer: &Endpoint) -> Result<Vec<u8>, TransportError>
where
    R: AsyncRead + Unpin,
{
    let io = |e: std::io::Error| TransportError::Io {
        endpoint: peer.clone(),
        reason: e.to_string(),
    };
    let mut length_prefix = [0u8; LENGTH_PREFIX_SIZE];
    reader.read_exact(&mut length_prefix).await.map_err(io)?;
    let size = u32::from_be_bytes(length_prefix) as usize;
    if size == 0 {
        return Err(TransportError::EmptyFrame);
    }
    if size > MAX_FRAME_SIZE {
        return Err(TransportError::FrameTooLarge {
            size,
            max: MAX_FRAME_SIZE,
        });
    }
    let mut payload = vec![0u8; size];
    reader.read_exact(&mut payload).await.map_err(io)?;
    Ok(payload)
}

/// Reads one frame and decodes it as `T`.
pub async fn read_json_frame<R, T>(reader: &mut R, peer: &Endpoint) -> Result<T, TransportError>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let payload = read_frame(reader, peer).await?;
    serde_json::from_slice(&payload).map_err(|e| TransportError::Codec(e.to_string()))
}

/// One TCP connection per call.
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpTransport;

impl TcpTransport {
    pub fn new() -> TcpTransport {
        TcpTransport
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn call(
        &self,
        endpoint: &Endpoint,
        request: RpcRequest,
        timeout: Duration,
    ) -> Result<RpcResponse, TransportError> {
        let exchange = async {
            let mut stream = TcpStream::connect(endpoint.as_str()).await.map_err(|e| {
                TransportError::Connect {
                    endpoint: endpoint.clone(),
                    reason: e.to_string(),
                }
            })?;
            write_frame(&mut stream, &request, endpoint).await?;
            read_json_frame(&mut stream, endpoint).await
        };
        tokio::time::timeout(timeout, exchange)
            .await
            .map_err(|_| TransportError::Timeout {
                endpoint: endpoint.clone(),
                timeout,
            })?
    }
}

/// How the [`LocalNetwork`] treats calls toward one endpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LinkBehavior {
    /// Calls go through.
    #[default]
    Deliver,
    /// Calls go through after this long.
    Delay(Duration),
    /// Calls never get an answer and time out.
    Blackhole,
    /// Calls fail right away as if the connection was refused.
    Refuse,
}

#[derive(Default)]
struct Links {
    agents: HashMap<Endpoint, Arc<Dispatcher>>,
    behaviors: HashMap<Endpoint, LinkBehavior>,
}

/// In-process network: each endpoint maps to a [`Dispatcher`].
///
/// Requests and responses are still turned into JSON and back, so what works here works over
/// TCP. Every call is handled on its own task, like a connection on a real server: a caller
/// giving up does not cancel the handler.
#[derive(Clone, Default)]
pub struct LocalNetwork {
    links: Arc<Mutex<Links>>,
}

impl LocalNetwork {
    pub fn new() -> LocalNetwork {
        LocalNetwork::default()
    }

    /// Makes `dispatcher` reachable at `endpoint`, replacing whoever was there.
    pub fn attach(&self, endpoint: Endpoint, dispatcher: Arc<Dispatcher>) {
        self.lock().agents.insert(endpoint, dispatcher);
    }

    pub fn detach(&self, endpoint: &Endpoint) {
        self.lock().agents.remove(endpoint);
    }

    pub fn set_behavior(&self, endpoint: &Endpoint, behavior: LinkBehavior) {
        self.lock().behaviors.insert(endpoint.clone(), behavior);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Links> {
        self.links.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn route(&self, endpoint: &Endpoint) -> (Option<Arc<Dispatcher>>, LinkBehavior) {
        let links = self.lock();
        (
            links.agents.get(endpoint).cloned(),
            links.behaviors.get(endpoint).copied().unwrap_or_default(),
        )
    }
}

fn through_json<T: Serialize + DeserializeOwned>(value: &T) -> Result<T, TransportError> {
    let bytes = serde_json::to_vec(value).map_err(|e| TransportError::Codec(e.to_string()))?;
    if bytes.len() > MAX_FRAME_SIZE {
        return Err(TransportError::FrameTooLarge {
            size: bytes.len(),
            max: MAX_FRAME_SIZE,
        });
    }
    serde_json::from_slice(&bytes).map_err(|e| TransportError::Codec(e.to_string()))
}

#[async_trait]
impl Transport for LocalNetwork {
    async fn call(
        &self,
        endpoint: &Endpoint,
        request: RpcRequest,
        timeout: Duration,
    ) -> Result<RpcResponse, TransportError> {
        let exchange = async {
            let (dispatcher, behavior) = self.route(endpoint);
            match behavior {
                LinkBehavior::Deliver => {}
                LinkBehavior::Delay(delay) => tokio::time::sleep(delay).await,
                LinkBehavior::Blackhole => std::future::pending::<()>().await,
                LinkBehavior::Refuse => {
                    return Err(TransportError::Connect {
                        endpoint: endpoint.clone(),
                        reason: "connection refused".to_owned(),
                    })
                }
            }
            let dispatcher =
                dispatcher.ok_or_else(|| TransportError::UnknownEndpoint(endpoint.clone()))?;
            let request = through_json(&request)?;
            trace!(%endpoint, method = %request.method, "local call");
            let response = tokio::spawn(async move { dispatcher.dispatch(request).await })
                .await
                .map_err(|e| TransportError::Io {
                    endpoint: endpoint.clone(),
                    reason: e.to_string(),
                })?;
            through_json(&response)
        };
        tokio::time::timeout(timeout, exchange)
            .await
            .map_err(|_| TransportError::Timeout {
                endpoint: endpoint.clone(),
                timeout,
            })?
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::error::RpcError;
    use crate::protocol::{Envelope, GameStart, Message};
    use crate::rpc::MessageHandler;

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

    fn request() -> RpcRequest {
        RpcRequest::new(&Envelope::new(
            "test",
            Message::GameStart(GameStart {
                game_id: "R1M1".into(),
            }),
        ))
        .unwrap()
    }

    #[tokio::test]
    async fn frames_round_trip_through_a_pipe() {
        let (mut a, mut b) = tokio::io::duplex(64 * 1024);
        let peer = Endpoint::from("pipe");
        let sent = request();
        write_frame(&mut a, &sent, &peer).await.unwrap();
        let received: RpcRequest = read_json_frame(&mut b, &peer).await.unwrap();
        assert_eq!(received, sent);
    }

    #[tokio::test]
    async fn empty_and_oversized_frames_are_rejected() {
        let peer = Endpoint::from("pipe");
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&0u32.to_be_bytes()).await.unwrap();
        assert_eq!(read_frame(&mut b, &peer).await, Err(TransportError::EmptyFrame));

        let (mut a, mut b) = tokio::io::duplex(64);
        let too_big = (MAX_FRAME_SIZE as u32 + 1).to_be_bytes();
        a.write_all(&too_big).await.unwrap();
        assert!(matches!(
            read_frame(&mut b, &peer).await,
            Err(TransportError::FrameTooLarge { .. })
        ));
    }

    #[tokio::test]
    async fn truncated_frame_is_an_io_error() {
        let peer = Endpoint::from("pipe");
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&10u32.to_be_bytes()).await.unwrap();
        a.write_all(b"abc").await.unwrap();
        drop(a);
        assert!(matches!(
            read_frame(&mut b, &peer).await,
            Err(TransportError::Io { .. })
        ));
    }

    #[tokio::test]
    async fn local_network_delivers_and_injects_faults() {
        let network = LocalNetwork::new();
        let endpoint = Endpoint::from("agent");
        network.attach(endpoint.clone(), Arc::new(Dispatcher::new(Arc::new(AlwaysAck))));
        let timeout = Duration::from_millis(200);

        let response = network.call(&endpoint, request(), timeout).await.unwrap();
        assert_eq!(response.into_message().unwrap(), Message::ack());

        network.set_behavior(&endpoint, LinkBehavior::Refuse);
        assert!(matches!(
            network.call(&endpoint, request(), timeout).await,
            Err(TransportError::Connect { .. })
        ));

        network.set_behavior(&endpoint, LinkBehavior::Blackhole);
        assert!(matches!(
            network
                .call(&endpoint, request(), Duration::from_millis(20))
                .await,
            Err(TransportError::Timeout { .. })
        ));

        network.set_behavior(&endpoint, LinkBehavior::Delay(Duration::from_millis(10)));
        assert!(network.call(&endpoint, request(), timeout).await.is_ok());

        assert_eq!(
            network
                .call(&Endpoint::from("nobody"), request(), timeout)
                .await,
            Err(TransportError::UnknownEndpoint(Endpoint::from("nobody")))
        );
    }
}
