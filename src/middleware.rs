//! Ordered hooks run around every handled request.
//!
//! `before` hooks run by ascending priority and may refuse the request, the handler runs, then
//! `after` hooks run by descending priority. Equal priorities keep insertion order.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::{ErrorCode, RpcError};
use crate::protocol::{Envelope, Message, PROTOCOL_VERSION};

/// A hook around request handling.
pub trait Middleware: Send + Sync + 'static {
    /// Lower runs first on the way in, last on the way out.
    fn priority(&self) -> i32;

    /// An error stops the request here and is sent back as the response.
    fn before(&self, _envelope: &Envelope) -> Result<(), RpcError> {
        Ok(())
    }

    fn after(&self, _envelope: &Envelope, _result: &Result<Message, RpcError>) {}
}

/// Refuses envelopes of another protocol version.
#[derive(Debug, Default)]
pub struct ProtocolVersionCheck;

impl Middleware for ProtocolVersionCheck {
    fn priority(&self) -> i32 {
        0
    }

    fn before(&self, envelope: &Envelope) -> Result<(), RpcError> {
        if envelope.protocol != PROTOCOL_VERSION {
            return Err(RpcError::new(
                ErrorCode::UnsupportedProtocol,
                format!(
                    "expected protocol {PROTOCOL_VERSION}, got {}",
                    envelope.protocol
                ),
            ));
        }
        Ok(())
    }
}

/// Logs every request and how it went.
#[derive(Debug, Default)]
pub struct CallTracing;

impl Middleware for CallTracing {
    fn priority(&self) -> i32 {
        100
    }

    fn before(&self, envelope: &Envelope) -> Result<(), RpcError> {
        debug!(
            message_type = envelope.message.message_type(),
            sender = %envelope.sender,
            conversation_id = %envelope.conversation_id,
            "request received"
        );
        Ok(())
    }

    fn after(&self, envelope: &Envelope, result: &Result<Message, RpcError>) {
        match result {
            Ok(reply) => debug!(
                message_type = envelope.message.message_type(),
                reply = reply.message_type(),
                "request handled"
            ),
            Err(e) => warn!(
                message_type = envelope.message.message_type(),
                sender = %envelope.sender,
                code = %e.code,
                "request refused: {}",
                e.message
            ),
        }
    }
}

/// Middlewares sorted by priority.
#[derive(Clone)]
pub struct MiddlewareChain {
    items: Vec<Arc<dyn Middleware>>,
}

impl MiddlewareChain {
    pub fn empty() -> MiddlewareChain {
        MiddlewareChain { items: Vec::new() }
    }

    pub fn push(&mut self, middleware: Arc<dyn Middleware>) {
        let at = self
            .items
            .partition_point(|m| m.priority() <= middleware.priority());
        self.items.insert(at, middleware);
    }

    pub fn before(&self, envelope: &Envelope) -> Result<(), RpcError> {
        self.items.iter().try_for_each(|m| m.before(envelope))
    }

    pub fn after(&self, envelope: &Envelope, result: &Result<Message, RpcError>) {
        self.items
            .iter()
            .rev()
            .for_each(|m| m.after(envelope, result));
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

impl Default for MiddlewareChain {
    /// [`ProtocolVersionCheck`] and [`CallTracing`].
    fn default() -> Self {
        let mut chain = MiddlewareChain::empty();
        chain.push(Arc::new(ProtocolVersionCheck));
        chain.push(Arc::new(CallTracing));
        chain
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::protocol::GameStart;

    struct Recorder {
        name: &'static str,
        priority: i32,
        refuse: bool,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl Middleware for Recorder {
        fn priority(&self) -> i32 {
            self.priority
        }

        fn before(&self, _envelope: &Envelope) -> Result<(), RpcError> {
            self.log.lock().unwrap().push(format!("before {}", self.name));
            if self.refuse {
                return Err(RpcError::new(ErrorCode::Unauthorized, self.name));
            }
            Ok(())
        }

        fn after(&self, _envelope: &Envelope, _result: &Result<Message, RpcError>) {
            self.log.lock().unwrap().push(format!("after {}", self.name));
        }
    }

    fn envelope() -> Envelope {
        Envelope::new(
            "test",
            Message::GameStart(GameStart {
                game_id: "R1M1".into(),
            }),
        )
    }

    fn recorder(
        name: &'static str,
        priority: i32,
        refuse: bool,
        log: &Arc<Mutex<Vec<String>>>,
    ) -> Arc<dyn Middleware> {
        Arc::new(Recorder {
            name,
            priority,
            refuse,
            log: log.clone(),
        })
    }

    #[test]
    fn runs_in_priority_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut chain = MiddlewareChain::empty();
        chain.push(recorder("late", 50, false, &log));
        chain.push(recorder("early", -10, false, &log));
        chain.push(recorder("late-too", 50, false, &log));

        let env = envelope();
        chain.before(&env).unwrap();
        chain.after(&env, &Ok(Message::ack()));
        assert_eq!(
            *log.lock().unwrap(),
            vec![
                "before early",
                "before late",
                "before late-too",
                "after late-too",
                "after late",
                "after early",
            ]
        );
    }

    #[test]
    fn refusal_short_circuits() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut chain = MiddlewareChain::empty();
        chain.push(recorder("gate", 1, true, &log));
        chain.push(recorder("never", 2, false, &log));

        let err = chain.before(&envelope()).unwrap_err();
        assert_eq!(err.code, ErrorCode::Unauthorized);
        assert_eq!(*log.lock().unwrap(), vec!["before gate"]);
    }

    #[test]
    fn default_chain_checks_version() {
        let chain = MiddlewareChain::default();
        assert_eq!(chain.len(), 2);
        let mut env = envelope();
        assert!(chain.before(&env).is_ok());
        env.protocol = "league.v1".into();
        assert_eq!(
            chain.before(&env).unwrap_err().code,
            ErrorCode::UnsupportedProtocol
        );
    }
}
