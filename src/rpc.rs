//! JSON-RPC 2.0 shaped request/response plumbing.
//!
//! The `method` of a request is the message type of the [`Envelope`] in its `params`.
//! [`RpcClient`] sends envelopes through a [`Transport`] and [`Dispatcher`] turns incoming
//! requests into calls to a [`MessageHandler`], going through the [`middleware`](crate::middleware)
//! chain on the way.

use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, RwLock,
    },
    time::Duration,
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::error::{CallError, ErrorCode, ProtocolError, RpcError, TransportError};
use crate::middleware::{Middleware, MiddlewareChain};
use crate::protocol::{Ack, Envelope, Message};
use crate::transport::{Endpoint, Transport};

/// Value of the `jsonrpc` field.
pub const JSONRPC_VERSION: &str = "2.0";

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

/// An outgoing call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcRequest {
    pub jsonrpc: String,
    pub id: u64,
    pub method: String,
    pub params: Value,
}

impl RpcRequest {
    /// Wraps `envelope`, using its message type as method.
    pub fn new(envelope: &Envelope) -> Result<RpcRequest, TransportError> {
        let params =
            serde_json::to_value(envelope).map_err(|e| TransportError::Codec(e.to_string()))?;
        Ok(RpcRequest {
            jsonrpc: JSONRPC_VERSION.to_owned(),
            id: NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed),
            method: envelope.message.message_type().to_owned(),
            params,
        })
    }
}

/// Answer to an [`RpcRequest`]: exactly one of `result` and `error` is set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcResponse {
    pub jsonrpc: String,
    /// Id of the request, 0 when the request could not even be parsed.
    #[serde(default)]
    pub id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

impl RpcResponse {
    pub fn success(id: u64, envelope: &Envelope) -> RpcResponse {
        match serde_json::to_value(envelope) {
            Ok(result) => RpcResponse {
                jsonrpc: JSONRPC_VERSION.to_owned(),
                id,
                result: Some(result),
                error: None,
            },
            Err(e) => RpcResponse::failure(id, RpcError::new(ErrorCode::Internal, e.to_string())),
        }
    }

    pub fn failure(id: u64, error: RpcError) -> RpcResponse {
        RpcResponse {
            jsonrpc: JSONRPC_VERSION.to_owned(),
            id,
            result: None,
            error: Some(error),
        }
    }

    /// The message carried by a successful response.
    ///
    /// # Errors
    /// [`ProtocolError::Rejected`] for error responses, [`ProtocolError::Malformed`] when the
    /// result is not an envelope.
    pub fn into_message(self) -> Result<Message, ProtocolError> {
        if let Some(error) = self.error {
            return Err(ProtocolError::Rejected(error));
        }
        let Some(result) = self.result else {
            return Err(ProtocolError::Malformed(
                "response has neither result nor error".to_owned(),
            ));
        };
        let envelope: Envelope =
            serde_json::from_value(result).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
        Ok(envelope.message)
    }
}

/// Application logic of an agent.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    /// `sender` field of the responses.
    fn identity(&self) -> String;

    /// Handles one request. Errors are sent back as error responses.
    async fn handle(&self, envelope: Envelope) -> Result<Message, RpcError>;

    /// A connection broke before a request could be answered.
    fn on_transport_error(&self, _error: &TransportError) {}
}

/// Routes decoded requests to a [`MessageHandler`] through the middleware chain.
pub struct Dispatcher {
    handler: Arc<dyn MessageHandler>,
    chain: MiddlewareChain,
}

impl Dispatcher {
    /// Dispatcher with the default middleware chain.
    pub fn new(handler: Arc<dyn MessageHandler>) -> Dispatcher {
        Dispatcher {
            handler,
            chain: MiddlewareChain::default(),
        }
    }

    #[must_use]
    pub fn with_middleware(mut self, middleware: Arc<dyn Middleware>) -> Dispatcher {
        self.chain.push(middleware);
        self
    }

    /// Parses raw bytes first. Never fails: bad input becomes an error response.
    pub async fn dispatch_bytes(&self, bytes: &[u8]) -> RpcResponse {
        match serde_json::from_slice::<RpcRequest>(bytes) {
            Ok(request) => self.dispatch(request).await,
            Err(e) => RpcResponse::failure(
                0,
                RpcError::new(ErrorCode::MalformedMessage, format!("invalid request: {e}")),
            ),
        }
    }

    /// Never fails: bad input becomes an error response.
    pub async fn dispatch(&self, request: RpcRequest) -> RpcResponse {
        let id = request.id;
        let envelope: Envelope = match serde_json::from_value(request.params) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(method = %request.method, "undecodable request: {e}");
                return RpcResponse::failure(
                    id,
                    RpcError::new(ErrorCode::MalformedMessage, e.to_string()),
                );
            }
        };
        if envelope.message.message_type() != request.method {
            return RpcResponse::failure(
                id,
                RpcError::new(
                    ErrorCode::UnexpectedMessage,
                    format!(
                        "method {} does not match message type {}",
                        request.method,
                        envelope.message.message_type()
                    ),
                ),
            );
        }

        let result = match self.chain.before(&envelope) {
            Ok(()) => self.handler.handle(envelope.clone()).await,
            Err(e) => Err(e),
        };
        self.chain.after(&envelope, &result);

        match result {
            Ok(message) => {
                let reply = Envelope::new(self.handler.identity(), message)
                    .in_conversation(&envelope.conversation_id);
                RpcResponse::success(id, &reply)
            }
            Err(e) => RpcResponse::failure(id, e),
        }
    }

    pub fn on_transport_error(&self, error: &TransportError) {
        self.handler.on_transport_error(error);
    }
}

/// Sends envelopes on behalf of one agent.
#[derive(Clone)]
pub struct RpcClient {
    transport: Arc<dyn Transport>,
    sender: Arc<RwLock<String>>,
}

impl RpcClient {
    pub fn new(transport: Arc<dyn Transport>, sender: impl Into<String>) -> RpcClient {
        RpcClient {
            transport,
            sender: Arc::new(RwLock::new(sender.into())),
        }
    }

    /// Changes the `sender` of later envelopes, once an id has been assigned.
    pub fn set_sender(&self, sender: impl Into<String>) {
        *self.sender.write().unwrap_or_else(|e| e.into_inner()) = sender.into();
    }

    pub fn sender(&self) -> String {
        self.sender.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Sends `message` and returns the message of the response.
    pub async fn call(
        &self,
        endpoint: &Endpoint,
        message: Message,
        auth_token: Option<&str>,
        timeout: Duration,
    ) -> Result<Message, CallError> {
        let envelope = Envelope::new(self.sender(), message).with_auth(auth_token.map(str::to_owned));
        let request = RpcRequest::new(&envelope)?;
        let response = self.transport.call(endpoint, request, timeout).await?;
        Ok(response.into_message()?)
    }

    /// Sends a notification and expects an [`Ack`].
    pub async fn notify(
        &self,
        endpoint: &Endpoint,
        message: Message,
        auth_token: Option<&str>,
        timeout: Duration,
    ) -> Result<Ack, CallError> {
        let reply = self.call(endpoint, message, auth_token, timeout).await?;
        Ok(expect_ack(reply)?)
    }
}

pub(crate) fn expect_ack(message: Message) -> Result<Ack, ProtocolError> {
    match message {
        Message::Ack(ack) => Ok(ack),
        other => Err(unexpected("ACK", &other)),
    }
}

pub(crate) fn unexpected(expected: &'static str, got: &Message) -> ProtocolError {
    ProtocolError::UnexpectedMessage {
        expected,
        got: got.message_type().to_owned(),
    }
}
