//! Duplex text channel a session talks through

use async_trait::async_trait;
use tokio::sync::mpsc;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Connection closed")]
    Closed,
    #[error("No heartbeat reply for {0} intervals")]
    HeartbeatTimeout(u32),
    #[error("WebSocket error: {0}")]
    WebSocket(String),
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// One inbound event from the transport
#[derive(Debug)]
pub enum Frame {
    Text(String),
    /// Peer closed, with its close code if it sent one
    Closed(Option<u16>),
    Error(TransportError),
}

#[async_trait]
pub trait Connection: Send {
    /// Next inbound frame. Must be cancel safe: dropping the future loses nothing.
    async fn recv(&mut self) -> Frame;

    async fn send(&mut self, text: &str) -> Result<(), TransportError>;

    /// Close from our side with a close code and reason
    async fn close(&mut self, code: u16, reason: &str) -> Result<(), TransportError>;
}

/// Something the server side sent to the peer of a [`ChannelConnection`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Text(String),
    Close { code: u16, reason: String },
}

/// In-process connection backed by tokio channels
pub struct ChannelConnection {
    inbound: mpsc::UnboundedReceiver<Frame>,
    outbound: mpsc::UnboundedSender<Outbound>,
}

/// Client side of a [`ChannelConnection`]
pub struct ChannelPeer {
    inbound: mpsc::UnboundedSender<Frame>,
    outbound: mpsc::UnboundedReceiver<Outbound>,
}

/// Create a connected in-process pair
pub fn channel() -> (ChannelConnection, ChannelPeer) {
    let (in_tx, in_rx) = mpsc::unbounded_channel();
    let (out_tx, out_rx) = mpsc::unbounded_channel();
    (
        ChannelConnection {
            inbound: in_rx,
            outbound: out_tx,
        },
        ChannelPeer {
            inbound: in_tx,
            outbound: out_rx,
        },
    )
}

#[async_trait]
impl Connection for ChannelConnection {
    async fn recv(&mut self) -> Frame {
        self.inbound.recv().await.unwrap_or(Frame::Closed(None))
    }

    async fn send(&mut self, text: &str) -> Result<(), TransportError> {
        self.outbound
            .send(Outbound::Text(text.to_string()))
            .map_err(|_| TransportError::Closed)
    }

    async fn close(&mut self, code: u16, reason: &str) -> Result<(), TransportError> {
        self.inbound.close();
        self.outbound
            .send(Outbound::Close {
                code,
                reason: reason.to_string(),
            })
            .map_err(|_| TransportError::Closed)
    }
}

impl ChannelPeer {
    /// Send a text message. Returns `false` once the server side is gone.
    pub fn send(&self, text: &str) -> bool {
        self.inbound.send(Frame::Text(text.to_string())).is_ok()
    }

    /// Close from the client side
    pub fn close(&self, code: Option<u16>) -> bool {
        self.inbound.send(Frame::Closed(code)).is_ok()
    }

    /// Report a transport failure to the server side
    pub fn fail(&self, error: TransportError) -> bool {
        self.inbound.send(Frame::Error(error)).is_ok()
    }

    /// Next thing the server sent, `None` once the server side is dropped
    pub async fn recv(&mut self) -> Option<Outbound> {
        self.outbound.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Outbound> {
        self.outbound.try_recv().ok()
    }
}
