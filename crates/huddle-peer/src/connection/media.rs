use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

use super::{ConnectionEvent, ConnectionKey, ConnectionShared};
use crate::peer::Command;
use crate::rtc::{LocalStream, RemoteTrack};

/// What a published stream carries. Screen shares go through `present`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamSource {
    #[default]
    Camera,
    Screen,
}

pub(crate) struct MediaState {
    pub stream: Option<LocalStream>,
    pub source: StreamSource,
    pub remote_tracks: Vec<RemoteTrack>,
}

impl MediaState {
    pub fn new(stream: Option<LocalStream>, source: StreamSource) -> Self {
        Self {
            stream,
            source,
            remote_tracks: Vec::new(),
        }
    }

    pub fn has_track(&self, id: &str) -> bool {
        self.remote_tracks.iter().any(|track| track.id == id)
    }
}

/// Application handle for a media connection.
#[derive(Debug)]
pub struct MediaConnection {
    key: ConnectionKey,
    shared: Arc<ConnectionShared>,
    source: StreamSource,
    commands: mpsc::UnboundedSender<Command>,
    events: mpsc::UnboundedReceiver<ConnectionEvent>,
}

impl MediaConnection {
    pub(crate) fn new(
        key: ConnectionKey,
        shared: Arc<ConnectionShared>,
        source: StreamSource,
        commands: mpsc::UnboundedSender<Command>,
        events: mpsc::UnboundedReceiver<ConnectionEvent>,
    ) -> Self {
        Self {
            key,
            shared,
            source,
            commands,
            events,
        }
    }

    pub fn key(&self) -> ConnectionKey {
        self.key
    }

    pub fn connection_id(&self) -> String {
        self.shared.id()
    }

    pub fn metadata(&self) -> Option<&Value> {
        self.shared.metadata()
    }

    pub fn source(&self) -> StreamSource {
        self.source
    }

    pub fn is_open(&self) -> bool {
        self.shared.is_open()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    pub fn close(&self) {
        let command = Command::Close {
            key: self.key,
            flush: false,
        };
        if self.commands.send(command).is_err() {
            tracing::debug!(target = "peer", connection = %self.key, "peer task gone; close dropped");
        }
    }

    pub async fn next_event(&mut self) -> Option<ConnectionEvent> {
        self.events.recv().await
    }

    pub fn try_next_event(&mut self) -> Option<ConnectionEvent> {
        self.events.try_recv().ok()
    }
}
