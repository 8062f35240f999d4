use std::fmt;

use thiserror::Error;

/// Category of a failure reported on a peer's error channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PeerErrorKind {
    /// The host transport supports neither data nor media sessions.
    Incompatible,
    /// Missing identity, or a connection id that does not name a live entity.
    InvalidId,
    /// The signaling socket went away after the peer was open.
    Network,
    /// The signaling socket closed before the server ever confirmed us.
    SocketClosed,
    /// The signaling socket failed or delivered an invalid envelope.
    SocketError,
    /// Description or candidate handling failed inside the transport.
    WebRtc,
    /// The signaling server rejected or failed an HTTP request.
    ServerError,
    /// An operation was attempted after disconnect or destroy.
    Disconnected,
}

impl PeerErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            PeerErrorKind::Incompatible => "incompatible",
            PeerErrorKind::InvalidId => "invalid-id",
            PeerErrorKind::Network => "network",
            PeerErrorKind::SocketClosed => "socket-closed",
            PeerErrorKind::SocketError => "socket-error",
            PeerErrorKind::WebRtc => "webrtc",
            PeerErrorKind::ServerError => "server-error",
            PeerErrorKind::Disconnected => "disconnected",
        }
    }

    /// Whether the registry escalates this failure to disconnect/destroy.
    pub fn is_fatal(self) -> bool {
        matches!(
            self,
            PeerErrorKind::Incompatible
                | PeerErrorKind::SocketClosed
                | PeerErrorKind::SocketError
        )
    }
}

impl fmt::Display for PeerErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("{kind}: {message}")]
pub struct PeerError {
    pub kind: PeerErrorKind,
    pub message: String,
}

impl PeerError {
    pub fn new(kind: PeerErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl From<TransportError> for PeerError {
    fn from(err: TransportError) -> Self {
        PeerError::new(PeerErrorKind::WebRtc, err.to_string())
    }
}

impl From<ApiError> for PeerError {
    fn from(err: ApiError) -> Self {
        PeerError::new(PeerErrorKind::ServerError, err.to_string())
    }
}

/// Failures raised by the host transport engine.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("transport setup failed: {0}")]
    Setup(String),
    #[error("invalid session description: {0}")]
    Description(String),
    #[error("invalid ice candidate: {0}")]
    Candidate(String),
    #[error("transport channel closed")]
    ChannelClosed,
    #[error("operation not supported by transport: {0}")]
    Unsupported(&'static str),
}

/// Failures raised by the outbound HTTP signaling capability.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ApiError {
    #[error("could not join group {group}: {reason}")]
    Join { group: String, reason: String },
    #[error("error sending answer to the server: {0}")]
    Answer(String),
    #[error("error trickling candidates for {connection_id}: {reason}")]
    Trickle {
        connection_id: String,
        reason: String,
    },
    #[error("could not present: {0}")]
    Present(String),
    #[error("invalid signaling url: {0}")]
    Url(String),
}

/// Failures raised while opening the signaling socket.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum SignalingError {
    #[error("invalid signaling url: {0}")]
    Url(String),
    #[error("websocket connect failed: {0}")]
    Connect(String),
    #[error("websocket send failed: {0}")]
    Send(String),
    #[error("websocket closed by server")]
    Closed,
}
