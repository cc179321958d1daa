use std::{net::SocketAddr, sync::Arc};

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use crate::tunnelgate::gateway::wire::WireError;

pub mod mux;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("bad magic")]
    BadMagic,
    #[error("unsupported version {0}")]
    BadVersion(u8),
    #[error("unauthorized")]
    Unauthorized,
    #[error("handshake timeout")]
    Timeout,
    /// The peer went away.
    #[error("eof")]
    Eof,
    #[error("closed")]
    Closed,
    #[error("mux: {0}")]
    Mux(String),
    #[error("wire: {0}")]
    Wire(WireError),
    #[error("io: {0}")]
    Io(std::io::Error),
}

impl TransportError {
    pub fn is_eof(&self) -> bool {
        matches!(self, TransportError::Eof)
    }
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind::*;
        match err.kind() {
            UnexpectedEof | BrokenPipe | ConnectionReset | ConnectionAborted | NotConnected => {
                TransportError::Eof
            }
            _ => TransportError::Io(err),
        }
    }
}

impl From<WireError> for TransportError {
    fn from(err: WireError) -> Self {
        match err {
            WireError::Io(e) => e.into(),
            other => TransportError::Wire(other),
        }
    }
}

/// The negotiated control connection. Closing drains in-flight transport
/// work, then closes the secure channel and the underlying connection.
#[async_trait]
pub trait ControlSession: Send + Sync {
    fn remote_addr(&self) -> Option<SocketAddr>;
    async fn close(&self);
}

/// A session-wide request. Dropping it unanswered replies negatively.
#[derive(Debug)]
pub struct GlobalRequest {
    pub kind: String,
    pub payload: Bytes,
    reply: Option<oneshot::Sender<bool>>,
}

impl GlobalRequest {
    pub fn no_reply(kind: impl Into<String>, payload: Bytes) -> Self {
        Self {
            kind: kind.into(),
            payload,
            reply: None,
        }
    }

    pub fn with_reply(kind: impl Into<String>, payload: Bytes) -> (Self, oneshot::Receiver<bool>) {
        let (tx, rx) = oneshot::channel();
        let req = Self {
            kind: kind.into(),
            payload,
            reply: Some(tx),
        };
        (req, rx)
    }

    pub fn want_reply(&self) -> bool {
        self.reply.is_some()
    }

    pub fn reply(&mut self, ok: bool) -> Result<(), TransportError> {
        match self.reply.take() {
            Some(tx) => tx.send(ok).map_err(|_| TransportError::Closed),
            None => Ok(()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelRequest {
    pub kind: String,
    pub payload: Bytes,
}

#[async_trait]
pub trait DataChannel: Send + Sync {
    /// Sends a request that expects no reply.
    async fn send_request(&self, kind: &str, payload: &[u8]) -> Result<(), TransportError>;
}

#[async_trait]
pub trait NewChannel: Send {
    async fn accept(
        self: Box<Self>,
    ) -> Result<(Arc<dyn DataChannel>, mpsc::Receiver<ChannelRequest>), TransportError>;
}

/// Everything a successful server handshake yields.
pub struct Handshake {
    pub session: Arc<dyn ControlSession>,
    pub global_requests: mpsc::Receiver<GlobalRequest>,
    pub new_channels: mpsc::Receiver<Box<dyn NewChannel>>,
}
