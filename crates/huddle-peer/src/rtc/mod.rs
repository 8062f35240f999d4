//! Capability seam to the real-time transport engine.
//!
//! The peer never touches peer connections directly: it asks an [`RtcEngine`]
//! for sessions and receives everything the engine observes as
//! [`TransportEvent`]s tagged with the owning connection.

mod engine;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use crate::connection::ConnectionKey;
use crate::error::TransportError;
use crate::protocol::{IceCandidate, SessionDescription};

pub use engine::WebRtcEngine;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Capabilities {
    pub data: bool,
    pub media: bool,
}

impl Capabilities {
    pub fn any(self) -> bool {
        self.data || self.media
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SessionConfig {
    pub ice_servers: Vec<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GatheringState {
    New,
    Gathering,
    Complete,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IceConnectionState {
    New,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

impl IceConnectionState {
    pub fn as_str(self) -> &'static str {
        match self {
            IceConnectionState::New => "new",
            IceConnectionState::Checking => "checking",
            IceConnectionState::Connected => "connected",
            IceConnectionState::Completed => "completed",
            IceConnectionState::Disconnected => "disconnected",
            IceConnectionState::Failed => "failed",
            IceConnectionState::Closed => "closed",
        }
    }
}

impl fmt::Display for IceConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TrackKind {
    Audio,
    Video,
    Unknown,
}

impl From<RTPCodecType> for TrackKind {
    fn from(kind: RTPCodecType) -> Self {
        match kind {
            RTPCodecType::Audio => TrackKind::Audio,
            RTPCodecType::Video => TrackKind::Video,
            _ => TrackKind::Unknown,
        }
    }
}

/// Media the local side publishes.
#[derive(Clone)]
pub struct LocalStream {
    pub id: String,
    pub tracks: Vec<Arc<dyn TrackLocal + Send + Sync>>,
}

impl LocalStream {
    pub fn new(id: impl Into<String>, tracks: Vec<Arc<dyn TrackLocal + Send + Sync>>) -> Self {
        Self {
            id: id.into(),
            tracks,
        }
    }
}

impl fmt::Debug for LocalStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ids: Vec<&str> = self.tracks.iter().map(|track| track.id()).collect();
        f.debug_struct("LocalStream")
            .field("id", &self.id)
            .field("tracks", &ids)
            .finish()
    }
}

/// A track received from the remote side.
#[derive(Clone)]
pub struct RemoteTrack {
    pub id: String,
    pub stream_id: String,
    pub kind: TrackKind,
    /// Engine handle for reading RTP; absent for engines without one.
    pub handle: Option<Arc<TrackRemote>>,
}

impl fmt::Debug for RemoteTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteTrack")
            .field("id", &self.id)
            .field("stream_id", &self.stream_id)
            .field("kind", &self.kind)
            .finish()
    }
}

/// Data-path handle for one negotiated data channel.
pub trait DataPath: Send + Sync {
    fn label(&self) -> &str;
    fn send(&self, data: Bytes) -> Result<(), TransportError>;
    fn close(&self);
}

pub enum TransportEvent {
    IceCandidate(IceCandidate),
    GatheringState(GatheringState),
    IceConnectionState(IceConnectionState),
    Track(RemoteTrack),
    /// The remote opened a data channel on this session.
    DataChannel(Arc<dyn DataPath>),
    DataOpen,
    DataMessage(Bytes),
    DataClosed,
}

impl fmt::Debug for TransportEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportEvent::IceCandidate(candidate) => {
                f.debug_tuple("IceCandidate").field(candidate).finish()
            }
            TransportEvent::GatheringState(state) => {
                f.debug_tuple("GatheringState").field(state).finish()
            }
            TransportEvent::IceConnectionState(state) => {
                f.debug_tuple("IceConnectionState").field(state).finish()
            }
            TransportEvent::Track(track) => f.debug_tuple("Track").field(track).finish(),
            TransportEvent::DataChannel(path) => {
                f.debug_tuple("DataChannel").field(&path.label()).finish()
            }
            TransportEvent::DataOpen => f.write_str("DataOpen"),
            TransportEvent::DataMessage(data) => {
                f.debug_tuple("DataMessage").field(&data.len()).finish()
            }
            TransportEvent::DataClosed => f.write_str("DataClosed"),
        }
    }
}

pub type TaggedTransportEvent = (ConnectionKey, TransportEvent);

/// Sink the engine reports into, bound to one connection.
#[derive(Clone, Debug)]
pub struct TransportEvents {
    key: ConnectionKey,
    tx: mpsc::UnboundedSender<TaggedTransportEvent>,
}

impl TransportEvents {
    pub fn new(key: ConnectionKey, tx: mpsc::UnboundedSender<TaggedTransportEvent>) -> Self {
        Self { key, tx }
    }

    pub fn key(&self) -> ConnectionKey {
        self.key
    }

    /// Returns false once the peer has gone away.
    pub fn emit(&self, event: TransportEvent) -> bool {
        self.tx.send((self.key, event)).is_ok()
    }
}

#[async_trait]
pub trait RtcSession: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDescription, TransportError>;
    async fn create_answer(&self) -> Result<SessionDescription, TransportError>;
    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), TransportError>;
    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), TransportError>;
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError>;
    async fn add_track(&self, track: Arc<dyn TrackLocal + Send + Sync>) -> Result<(), TransportError>;
    async fn create_data_channel(
        &self,
        label: &str,
        reliable: bool,
    ) -> Result<Arc<dyn DataPath>, TransportError>;
    /// Stop reporting events and release the session.
    async fn close(&self) -> Result<(), TransportError>;
}

#[async_trait]
pub trait RtcEngine: Send + Sync {
    fn capabilities(&self) -> Capabilities;
    async fn create_session(
        &self,
        config: &SessionConfig,
        events: TransportEvents,
    ) -> Result<Arc<dyn RtcSession>, TransportError>;
}
