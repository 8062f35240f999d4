//! Connection entities: one per negotiated link with a remote participant.
//!
//! The peer task owns every [`Connection`]. Applications hold
//! [`DataConnection`] / [`MediaConnection`] handles that read shared state and
//! post commands back to the peer task.

mod data;
mod media;

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::RwLock;
use rand::Rng;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::{PeerError, PeerErrorKind};
use crate::negotiation::{NegotiationEvent, NegotiationSession, StepCtx};
use crate::protocol::{ConnectionKind, MessageType, SignalingMessage};
use crate::rtc::{DataPath, IceConnectionState, RemoteTrack, TransportEvent};

pub use data::{DataConnection, DataPayload, Serialization};
pub use media::{MediaConnection, StreamSource};

pub(crate) use data::DataState;
pub(crate) use media::MediaState;

/// Stable arena key. Unlike the connection id it never changes and is never
/// reused within a peer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionKey(u64);

impl ConnectionKey {
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

const ID_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
const ID_TOKEN_LEN: usize = 11;

/// Provisional id for a locally originated connection, e.g. `dc_k3j9x0c1ab2`.
pub fn provisional_id(kind: ConnectionKind) -> String {
    let mut rng = rand::thread_rng();
    let token: String = (0..ID_TOKEN_LEN)
        .map(|_| ID_ALPHABET[rng.gen_range(0..ID_ALPHABET.len())] as char)
        .collect();
    format!("{}{}", kind.id_prefix(), token)
}

/// Delivered on a connection handle.
#[derive(Debug)]
pub enum ConnectionEvent {
    Open,
    Data(DataPayload),
    Track(RemoteTrack),
    IceStateChanged(IceConnectionState),
    Error(PeerError),
    Close,
}

/// State both the peer task and application handles can see.
#[derive(Debug)]
pub(crate) struct ConnectionShared {
    id: RwLock<String>,
    kind: ConnectionKind,
    label: String,
    metadata: Option<Value>,
    open: AtomicBool,
    closed: AtomicBool,
}

impl ConnectionShared {
    pub fn new(id: String, kind: ConnectionKind, label: String, metadata: Option<Value>) -> Self {
        Self {
            id: RwLock::new(id),
            kind,
            label,
            metadata,
            open: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> String {
        self.id.read().clone()
    }

    pub fn set_id(&self, id: &str) {
        *self.id.write() = id.to_string();
    }

    pub fn kind(&self) -> ConnectionKind {
        self.kind
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn metadata(&self) -> Option<&Value> {
        self.metadata.as_ref()
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    /// Returns true if this call flipped the flag.
    pub fn set_open(&self, open: bool) -> bool {
        self.open.swap(open, Ordering::AcqRel) != open
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn mark_closed(&self) -> bool {
        !self.closed.swap(true, Ordering::AcqRel)
    }
}

pub(crate) enum Variant {
    Data(DataState),
    Media(MediaState),
}

/// Work the registry has to carry out on behalf of an entity.
#[derive(Debug)]
pub(crate) enum Effect {
    Report(PeerError),
    Close,
    Answered(SignalingMessage),
    Track(RemoteTrack),
}

pub(crate) struct Connection {
    pub key: ConnectionKey,
    pub shared: Arc<ConnectionShared>,
    pub negotiation: NegotiationSession,
    pub variant: Variant,
    events: mpsc::UnboundedSender<ConnectionEvent>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("key", &self.key)
            .field("id", &self.shared.id())
            .field("kind", &self.shared.kind())
            .field("open", &self.shared.is_open())
            .field("negotiation", &self.negotiation)
            .finish()
    }
}

impl Connection {
    pub fn new(
        key: ConnectionKey,
        shared: Arc<ConnectionShared>,
        negotiation: NegotiationSession,
        variant: Variant,
        events: mpsc::UnboundedSender<ConnectionEvent>,
    ) -> Self {
        Self {
            key,
            shared,
            negotiation,
            variant,
            events,
        }
    }

    pub fn id(&self) -> String {
        self.shared.id()
    }

    pub fn kind(&self) -> ConnectionKind {
        self.shared.kind()
    }

    pub fn emit(&self, event: ConnectionEvent) {
        if self.events.send(event).is_err() {
            tracing::trace!(target = "peer", connection = %self.key, "connection handle dropped");
        }
    }

    pub fn mark_open(&self) {
        if self.shared.set_open(true) {
            self.emit(ConnectionEvent::Open);
        }
    }

    /// Emit an error on this entity's handle.
    pub fn error(&self, err: PeerError) {
        tracing::warn!(target = "peer", connection = %self.shared.id(), kind = %err.kind, message = %err.message, "connection error");
        self.emit(ConnectionEvent::Error(err));
    }

    /// Translate a negotiation step result into registry effects.
    pub fn absorb(&mut self, event: Option<NegotiationEvent>) -> Vec<Effect> {
        match event {
            None => Vec::new(),
            Some(NegotiationEvent::Established) => {
                tracing::debug!(target = "peer", connection = %self.shared.id(), "negotiation established");
                Vec::new()
            }
            Some(NegotiationEvent::Answered(response)) => vec![Effect::Answered(response)],
            Some(NegotiationEvent::Error(err)) => {
                self.error(err.clone());
                vec![Effect::Report(err)]
            }
            Some(NegotiationEvent::Failed(err)) => {
                self.negotiation.mark_failed();
                self.error(err.clone());
                vec![Effect::Report(err), Effect::Close]
            }
        }
    }

    /// Entity-level handling for a message routed to this connection.
    pub fn handle_message(&mut self, message: SignalingMessage, ctx: &mut StepCtx<'_>) -> Vec<Effect> {
        match message.kind {
            MessageType::Answer => {
                let sdp = match message.payload.session_description() {
                    Ok(Some(sdp)) => sdp,
                    Ok(None) => {
                        tracing::warn!(target = "peer", connection = ctx.connection_id, "answer without sdp dropped");
                        return Vec::new();
                    }
                    Err(err) => return self.reject_field("sdp", &err),
                };
                if let Variant::Media(_) = self.variant {
                    self.mark_open();
                }
                self.negotiation.handle_remote_description(sdp, ctx);
                Vec::new()
            }
            MessageType::Candidate => {
                match message.payload.ice_candidate() {
                    Ok(Some(candidate)) => self.negotiation.add_remote_candidate(candidate, ctx),
                    Ok(None) => {
                        tracing::warn!(target = "peer", connection = ctx.connection_id, "candidate message without candidate dropped")
                    }
                    Err(err) => return self.reject_field("candidate", &err),
                }
                Vec::new()
            }
            other => {
                tracing::warn!(target = "peer", connection = ctx.connection_id, kind = %other, "unrecognized message for connection");
                Vec::new()
            }
        }
    }

    /// A misshapen field fails this message only; the connection stays up.
    fn reject_field(&self, field: &str, err: &serde_json::Error) -> Vec<Effect> {
        let err = PeerError::new(PeerErrorKind::WebRtc, format!("Invalid {field} in signaling message: {err}"));
        self.error(err.clone());
        vec![Effect::Report(err)]
    }

    pub fn handle_transport(&mut self, event: TransportEvent, ctx: &mut StepCtx<'_>) -> Vec<Effect> {
        match event {
            TransportEvent::IceCandidate(candidate) => {
                self.negotiation.on_local_candidate(candidate, ctx.connection_id);
                Vec::new()
            }
            TransportEvent::GatheringState(state) => {
                let step = self.negotiation.on_gathering_state(state, ctx);
                self.absorb(step)
            }
            TransportEvent::IceConnectionState(state) => {
                self.emit(ConnectionEvent::IceStateChanged(state));
                let step = self.negotiation.on_ice_state(state, ctx.connection_id);
                self.absorb(step)
            }
            TransportEvent::Track(track) => match &mut self.variant {
                Variant::Media(media) => {
                    if media.has_track(&track.id) {
                        return Vec::new();
                    }
                    media.remote_tracks.push(track.clone());
                    self.emit(ConnectionEvent::Track(track.clone()));
                    vec![Effect::Track(track)]
                }
                Variant::Data(_) => {
                    tracing::debug!(target = "peer", connection = ctx.connection_id, "ignoring track on data connection");
                    Vec::new()
                }
            },
            TransportEvent::DataChannel(path) => {
                self.attach_data_path(path);
                Vec::new()
            }
            TransportEvent::DataOpen => {
                if let Variant::Data(_) = self.variant {
                    self.mark_open();
                }
                Vec::new()
            }
            TransportEvent::DataMessage(bytes) => {
                let Variant::Data(data) = &self.variant else {
                    return Vec::new();
                };
                match data.decode(bytes) {
                    Ok(Some(payload)) => {
                        self.emit(ConnectionEvent::Data(payload));
                        Vec::new()
                    }
                    // close notice from the remote side
                    Ok(None) => vec![Effect::Close],
                    Err(err) => {
                        self.error(err);
                        Vec::new()
                    }
                }
            }
            TransportEvent::DataClosed => vec![Effect::Close],
        }
    }

    pub fn attach_data_path(&mut self, path: Arc<dyn DataPath>) {
        match &mut self.variant {
            Variant::Data(data) if data.path.is_none() => data.path = Some(path),
            Variant::Data(_) => {
                tracing::debug!(target = "peer", connection = %self.shared.id(), label = path.label(), "extra data channel ignored");
                path.close();
            }
            Variant::Media(_) => path.close(),
        }
    }

    /// Serialize and transmit application data.
    pub fn send(&self, payload: DataPayload) -> Result<(), PeerError> {
        let Variant::Data(data) = &self.variant else {
            return Err(PeerError::new(
                PeerErrorKind::WebRtc,
                "Media connections cannot send data.",
            ));
        };
        if !self.shared.is_open() {
            return Err(PeerError::new(
                PeerErrorKind::WebRtc,
                "Connection is not open. You should listen for the `open` event before sending messages.",
            ));
        }
        data.transmit(&payload)
    }

    /// Detach transport state. Returns false if already closed.
    pub fn close(&mut self) -> bool {
        if !self.shared.mark_closed() {
            return false;
        }
        self.shared.set_open(false);
        if let Variant::Data(data) = &mut self.variant {
            if let Some(path) = data.path.take() {
                path.close();
            }
        }
        self.negotiation.cleanup();
        self.emit(ConnectionEvent::Close);
        true
    }
}
