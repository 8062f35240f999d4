//! Application-facing peer: a cloneable handle over the registry task.

mod registry;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

use crate::api::{HttpSignalingApi, SignalingApi};
use crate::config::PeerConfig;
use crate::connection::{
    ConnectionKey, DataConnection, DataPayload, MediaConnection, Serialization, StreamSource,
};
use crate::error::{PeerError, PeerErrorKind};
use crate::negotiation::{NegotiationState, Role, SdpTransform};
use crate::protocol::{ConnectionKind, Participant, SignalingMessage};
use crate::rtc::{LocalStream, RemoteTrack, RtcEngine, WebRtcEngine};
use crate::signaling::{SocketConnector, WsConnector};
use crate::telemetry;

use registry::Registry;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PeerState {
    Unopened,
    Open,
    Disconnected,
    Destroyed,
}

impl PeerState {
    pub fn as_str(self) -> &'static str {
        match self {
            PeerState::Unopened => "unopened",
            PeerState::Open => "open",
            PeerState::Disconnected => "disconnected",
            PeerState::Destroyed => "destroyed",
        }
    }
}

impl fmt::Display for PeerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug)]
pub enum PeerEvent {
    /// The server confirmed our identity.
    Open(String),
    /// A remote participant opened a data connection to us.
    Connection(DataConnection),
    /// A remote participant is sending us media; already answered.
    Call(MediaConnection),
    Participant(Participant),
    Tracks(Vec<RemoteTrack>),
    Disconnected(Option<String>),
    Close,
    Error(PeerError),
}

#[derive(Clone, Default)]
pub struct ConnectOptions {
    pub label: Option<String>,
    pub metadata: Option<Value>,
    pub serialization: Serialization,
    pub reliable: bool,
    pub sdp_transform: Option<SdpTransform>,
}

impl fmt::Debug for ConnectOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectOptions")
            .field("label", &self.label)
            .field("metadata", &self.metadata)
            .field("serialization", &self.serialization)
            .field("reliable", &self.reliable)
            .field("sdp_transform", &self.sdp_transform.is_some())
            .finish()
    }
}

impl ConnectOptions {
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn with_serialization(mut self, serialization: Serialization) -> Self {
        self.serialization = serialization;
        self
    }

    pub fn reliable(mut self, reliable: bool) -> Self {
        self.reliable = reliable;
        self
    }

    pub fn with_sdp_transform(mut self, transform: SdpTransform) -> Self {
        self.sdp_transform = Some(transform);
        self
    }
}

#[derive(Clone, Default)]
pub struct PublishOptions {
    /// Sent to the server as `media_config`.
    pub metadata: Option<Value>,
    pub source: StreamSource,
    pub sdp_transform: Option<SdpTransform>,
}

impl fmt::Debug for PublishOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PublishOptions")
            .field("metadata", &self.metadata)
            .field("source", &self.source)
            .field("sdp_transform", &self.sdp_transform.is_some())
            .finish()
    }
}

impl PublishOptions {
    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn screen(mut self) -> Self {
        self.source = StreamSource::Screen;
        self
    }

    pub fn with_sdp_transform(mut self, transform: SdpTransform) -> Self {
        self.sdp_transform = Some(transform);
        self
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ConnectionSnapshot {
    pub key: ConnectionKey,
    pub connection_id: String,
    pub kind: ConnectionKind,
    pub role: Role,
    pub open: bool,
    pub negotiation: NegotiationState,
}

#[derive(Clone, Debug, PartialEq)]
pub struct PeerSnapshot {
    pub state: PeerState,
    pub identity: Option<String>,
    pub last_known_identity: Option<String>,
    pub connections: Vec<ConnectionSnapshot>,
    /// Buffered message count per connection id.
    pub pending: BTreeMap<String, usize>,
    pub participants: Vec<Participant>,
    /// Track ids per remote stream id.
    pub tracks: BTreeMap<String, Vec<String>>,
    pub queued_signals: usize,
}

pub(crate) type Reply<T> = oneshot::Sender<Result<T, PeerError>>;

#[derive(Debug)]
pub(crate) enum Command {
    Connect {
        options: ConnectOptions,
        reply: Reply<DataConnection>,
    },
    Publish {
        stream: LocalStream,
        options: PublishOptions,
        reply: Reply<MediaConnection>,
    },
    Disconnect,
    Destroy,
    Reconnect {
        reply: Reply<()>,
    },
    Remap {
        old: String,
        new: String,
        reply: Reply<()>,
    },
    SendSignal(SignalingMessage),
    Snapshot(oneshot::Sender<PeerSnapshot>),
    Send {
        key: ConnectionKey,
        payload: DataPayload,
    },
    Close {
        key: ConnectionKey,
        flush: bool,
    },
}

/// Receiving side of a peer's events.
#[derive(Debug)]
pub struct PeerEvents {
    rx: mpsc::UnboundedReceiver<PeerEvent>,
}

impl PeerEvents {
    /// `None` once the peer task has exited.
    pub async fn recv(&mut self) -> Option<PeerEvent> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<PeerEvent> {
        self.rx.try_recv().ok()
    }
}

/// Cloneable handle to one peer's registry task.
///
/// Construction spawns the task and starts initialization; the outcome
/// arrives on [`PeerEvents`] as `Open` or an `Error`. The task exits once
/// every `Peer` and connection handle has been dropped.
#[derive(Clone, Debug)]
pub struct Peer {
    commands: mpsc::UnboundedSender<Command>,
}

impl Peer {
    /// Must be called from within a tokio runtime.
    pub fn new(
        config: PeerConfig,
        engine: Arc<dyn RtcEngine>,
        api: Arc<dyn SignalingApi>,
        connector: Arc<dyn SocketConnector>,
    ) -> (Peer, PeerEvents) {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let registry = Registry::new(
            config,
            engine,
            api,
            connector,
            commands_tx.downgrade(),
            events_tx,
        );
        tokio::spawn(registry.run(commands_rx));
        (
            Peer {
                commands: commands_tx,
            },
            PeerEvents { rx: events_rx },
        )
    }

    /// Production capabilities: `webrtc`, HTTP over `reqwest`, websocket
    /// over `tokio-tungstenite`.
    pub fn with_defaults(config: PeerConfig) -> Result<(Peer, PeerEvents), PeerError> {
        match config.init_logging() {
            Ok(installed) => {
                tracing::debug!(target = "peer", ?installed, level = config.log_level.as_str(), "logging ready")
            }
            Err(err) => {
                let fallback = telemetry::install(&config.log_settings().with_file(None));
                tracing::warn!(target = "peer", error = %err, ?fallback, "log file unavailable; logging to stderr");
            }
        }
        let engine = WebRtcEngine::new()?;
        let api = HttpSignalingApi::new(&config)?;
        Ok(Self::new(
            config,
            Arc::new(engine),
            Arc::new(api),
            Arc::new(WsConnector),
        ))
    }

    /// Open a data connection to the group.
    pub async fn connect(&self, options: ConnectOptions) -> Result<DataConnection, PeerError> {
        self.request(|reply| Command::Connect { options, reply }).await
    }

    /// Publish a local stream to the group.
    pub async fn publish(
        &self,
        stream: LocalStream,
        options: PublishOptions,
    ) -> Result<MediaConnection, PeerError> {
        self.request(|reply| Command::Publish {
            stream,
            options,
            reply,
        })
        .await
    }

    pub async fn reconnect(&self) -> Result<(), PeerError> {
        self.request(|reply| Command::Reconnect { reply }).await
    }

    /// Move an entity to a server-assigned id. Unknown `old` ids fail with
    /// `InvalidId`, which is also reported on the event stream.
    pub async fn remap_connection(
        &self,
        old: impl Into<String>,
        new: impl Into<String>,
    ) -> Result<(), PeerError> {
        let (old, new) = (old.into(), new.into());
        self.request(|reply| Command::Remap { old, new, reply }).await
    }

    pub fn disconnect(&self) {
        self.post(Command::Disconnect);
    }

    pub fn destroy(&self) {
        self.post(Command::Destroy);
    }

    /// Send a raw envelope over the signaling socket.
    pub fn send_signal(&self, message: SignalingMessage) {
        self.post(Command::SendSignal(message));
    }

    pub async fn snapshot(&self) -> Result<PeerSnapshot, PeerError> {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(Command::Snapshot(tx)).is_err() {
            return Err(gone());
        }
        rx.await.map_err(|_| gone())
    }

    async fn request<T>(&self, build: impl FnOnce(Reply<T>) -> Command) -> Result<T, PeerError> {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(build(tx)).is_err() {
            return Err(gone());
        }
        rx.await.map_err(|_| gone())?
    }

    fn post(&self, command: Command) {
        if self.commands.send(command).is_err() {
            tracing::debug!(target = "peer", "peer task gone; command dropped");
        }
    }
}

fn gone() -> PeerError {
    PeerError::new(PeerErrorKind::Disconnected, "The peer has been destroyed.")
}
