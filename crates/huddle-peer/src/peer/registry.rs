//! The registry task. Owns every connection entity, the signaling channel
//! and all bookkeeping; everything else talks to it through channels.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::Instant;
use webrtc::track::track_local::TrackLocal;

use super::{
    Command, ConnectOptions, ConnectionSnapshot, PeerEvent, PeerSnapshot, PeerState,
    PublishOptions,
};
use crate::api::SignalingApi;
use crate::config::PeerConfig;
use crate::connection::{
    Connection, ConnectionEvent, ConnectionKey, ConnectionShared, DataConnection, DataState,
    Effect, MediaConnection, MediaState, Serialization, StreamSource, Variant, provisional_id,
};
use crate::error::{PeerError, PeerErrorKind};
use crate::negotiation::{
    Completion, Jobs, NegotiationEvent, NegotiationSession, Outcome, Role, StepCtx, Submit,
};
use crate::protocol::{ConnectionKind, MessageType, Participant, SignalingMessage};
use crate::rtc::{
    LocalStream, RemoteTrack, RtcEngine, RtcSession, SessionConfig, TaggedTransportEvent,
    TransportEvent, TransportEvents,
};
use crate::signaling::{ChannelEvent, RawSocketEvent, SignalingChannel, SocketConnector};

const DISCONNECTED_CONNECT: &str = "Cannot connect to new Peer after disconnecting from server.";

#[derive(Debug, Default)]
struct Identity {
    requested: Option<String>,
    current: Option<String>,
    last_known: Option<String>,
}

#[derive(Debug)]
struct Pending {
    seq: u64,
    message: SignalingMessage,
}

struct NewEntity {
    id: String,
    kind: ConnectionKind,
    label: String,
    metadata: Option<Value>,
    negotiation: NegotiationSession,
    variant: Variant,
}

struct EntityParts {
    key: ConnectionKey,
    shared: Arc<ConnectionShared>,
    events: mpsc::UnboundedReceiver<ConnectionEvent>,
    commands: mpsc::UnboundedSender<Command>,
}

pub(super) struct Registry {
    config: PeerConfig,
    session_config: SessionConfig,
    engine: Arc<dyn RtcEngine>,
    api: Arc<dyn SignalingApi>,
    commands: mpsc::WeakUnboundedSender<Command>,
    events: mpsc::UnboundedSender<PeerEvent>,
    channel: SignalingChannel,
    socket_rx: mpsc::UnboundedReceiver<RawSocketEvent>,
    transport_tx: mpsc::UnboundedSender<TaggedTransportEvent>,
    transport_rx: mpsc::UnboundedReceiver<TaggedTransportEvent>,
    jobs: Jobs,
    state: PeerState,
    identity: Identity,
    connections: HashMap<ConnectionKey, Connection>,
    index: HashMap<String, ConnectionKey>,
    next_key: u64,
    pending: HashMap<String, Vec<Pending>>,
    next_seq: u64,
    participants: BTreeMap<String, Participant>,
    tracks: HashMap<String, Vec<RemoteTrack>>,
    /// Streams that gained tracks since the last announcement.
    grown_streams: BTreeSet<String>,
}

impl Registry {
    pub(super) fn new(
        config: PeerConfig,
        engine: Arc<dyn RtcEngine>,
        api: Arc<dyn SignalingApi>,
        connector: Arc<dyn SocketConnector>,
        commands: mpsc::WeakUnboundedSender<Command>,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Self {
        let (socket_tx, socket_rx) = mpsc::unbounded_channel();
        let (transport_tx, transport_rx) = mpsc::unbounded_channel();
        let session_config = SessionConfig {
            ice_servers: config.ice_servers.clone(),
        };
        let channel = SignalingChannel::new(config.clone(), connector, socket_tx);
        Self {
            config,
            session_config,
            engine,
            api,
            commands,
            events,
            channel,
            socket_rx,
            transport_tx,
            transport_rx,
            jobs: Jobs::default(),
            state: PeerState::Unopened,
            identity: Identity::default(),
            connections: HashMap::new(),
            index: HashMap::new(),
            next_key: 1,
            pending: HashMap::new(),
            next_seq: 0,
            participants: BTreeMap::new(),
            tracks: HashMap::new(),
            grown_streams: BTreeSet::new(),
        }
    }

    pub(super) async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        self.initialize();
        loop {
            tokio::select! {
                biased;
                Some(raw) = self.socket_rx.recv() => self.on_socket(raw),
                Some((key, event)) = self.transport_rx.recv() => {
                    self.on_transport(key, event);
                    while let Ok((key, event)) = self.transport_rx.try_recv() {
                        self.on_transport(key, event);
                    }
                }
                Some(done) = self.jobs.next(), if !self.jobs.is_empty() => self.on_completion(done),
                _ = heartbeat(self.channel.heartbeat_deadline()) => self.channel.heartbeat_due(),
                command = commands.recv() => match command {
                    Some(command) => self.on_command(command),
                    None => break,
                },
            }
            self.announce_tracks();
        }
        self.destroy();
        tracing::debug!(target = "peer", "registry task exiting");
    }

    fn initialize(&mut self) {
        if !self.engine.capabilities().any() {
            self.abort(
                PeerErrorKind::Incompatible,
                "The current platform does not support WebRTC",
            );
            return;
        }
        let Some(group) = self.config.group_id.clone().filter(|group| !group.is_empty()) else {
            self.abort(PeerErrorKind::InvalidId, "No groupId was specified");
            return;
        };
        self.open_channel(group);
    }

    fn open_channel(&mut self, identity: String) {
        tracing::info!(target = "peer", identity = %identity, "connecting to signaling server");
        self.channel.connect(&identity);
        self.identity.requested = Some(identity);
    }

    fn emit(&self, event: PeerEvent) {
        if self.events.send(event).is_err() {
            tracing::trace!(target = "peer", "peer event receiver dropped");
        }
    }

    fn emit_error(&self, err: PeerError) {
        if err.kind.is_fatal() {
            tracing::error!(target = "peer", kind = %err.kind, message = %err.message, "peer error");
        } else {
            tracing::warn!(target = "peer", kind = %err.kind, message = %err.message, "peer error");
        }
        self.emit(PeerEvent::Error(err));
    }

    fn abort(&mut self, kind: PeerErrorKind, message: impl Into<String>) {
        self.emit_error(PeerError::new(kind, message));
        if self.identity.last_known.is_some() {
            self.disconnect();
        } else {
            self.destroy();
        }
    }

    fn disconnect(&mut self) {
        if matches!(self.state, PeerState::Disconnected | PeerState::Destroyed) {
            return;
        }
        let current = self.identity.current.take();
        if current.is_some() {
            self.identity.last_known = current.clone();
        }
        match self.channel.close() {
            Some(ChannelEvent::Disconnected) => {
                tracing::debug!(target = "peer", "signaling socket closed")
            }
            Some(other) => tracing::debug!(target = "peer", event = ?other, "unexpected close event"),
            None => tracing::debug!(target = "peer", "signaling socket was already down"),
        }
        self.state = PeerState::Disconnected;
        tracing::info!(target = "peer", identity = ?current, "disconnected from signaling server");
        self.emit(PeerEvent::Disconnected(current));
    }

    fn destroy(&mut self) {
        if self.state == PeerState::Destroyed {
            return;
        }
        self.disconnect();
        let keys: Vec<ConnectionKey> = self.connections.keys().copied().collect();
        for key in keys {
            self.close_connection(key);
        }
        self.pending.clear();
        self.index.clear();
        self.state = PeerState::Destroyed;
        tracing::info!(target = "peer", "peer destroyed");
        self.emit(PeerEvent::Close);
    }

    fn usable(&self) -> Result<(), PeerError> {
        if matches!(self.state, PeerState::Disconnected | PeerState::Destroyed) {
            let err = PeerError::new(PeerErrorKind::Disconnected, DISCONNECTED_CONNECT);
            self.emit_error(err.clone());
            return Err(err);
        }
        Ok(())
    }

    // signaling

    fn on_socket(&mut self, raw: RawSocketEvent) {
        let Some(event) = self.channel.on_raw(raw) else {
            return;
        };
        match event {
            ChannelEvent::Message(message) => self.route_inbound(message),
            ChannelEvent::Error(reason) => self.abort(PeerErrorKind::SocketError, reason),
            ChannelEvent::Disconnected => match self.state {
                PeerState::Open => {
                    self.emit_error(PeerError::new(
                        PeerErrorKind::Network,
                        "Lost connection to server.",
                    ));
                    self.disconnect();
                }
                PeerState::Unopened => self.abort(
                    PeerErrorKind::SocketClosed,
                    "Underlying socket is already closed.",
                ),
                PeerState::Disconnected | PeerState::Destroyed => {}
            },
        }
    }

    fn route_inbound(&mut self, message: SignalingMessage) {
        tracing::trace!(target = "signaling", kind = %message.kind, connection = ?message.connection_id(), "inbound message");
        match message.kind {
            MessageType::Open => self.on_open(),
            MessageType::Offer => self.on_offer(message),
            MessageType::Participant => self.on_participant(message),
            MessageType::Heartbeat => {}
            _ => self.dispatch(message),
        }
    }

    fn on_open(&mut self) {
        if self.state != PeerState::Unopened {
            tracing::debug!(target = "peer", state = %self.state, "unexpected OPEN ignored");
            return;
        }
        let identity = self.identity.requested.clone().unwrap_or_default();
        self.identity.current = Some(identity.clone());
        self.identity.last_known = Some(identity.clone());
        self.state = PeerState::Open;
        self.channel.confirm_identity(identity.clone());
        tracing::info!(target = "peer", identity = %identity, "peer open");
        self.emit(PeerEvent::Open(identity));
    }

    fn on_participant(&mut self, message: SignalingMessage) {
        let Some(data) = message.payload.data else {
            tracing::warn!(target = "peer", "participant message without data dropped");
            return;
        };
        let participant = match serde_json::from_value::<Participant>(data) {
            Ok(participant) => participant,
            Err(err) => {
                tracing::warn!(target = "peer", error = %err, "invalid participant dropped");
                return;
            }
        };
        if self.participants.contains_key(&participant.participant_id) {
            tracing::debug!(target = "peer", participant = %participant.participant_id, "participant already known");
            return;
        }
        self.participants
            .insert(participant.participant_id.clone(), participant.clone());
        self.emit(PeerEvent::Participant(participant));
    }

    fn on_offer(&mut self, message: SignalingMessage) {
        let Some(id) = message.connection_id().map(str::to_string) else {
            tracing::warn!(target = "peer", "offer without connection id dropped");
            return;
        };
        let Some(kind) = message.payload.connection_kind() else {
            tracing::warn!(target = "peer", connection = %id, kind = ?message.payload.kind, "offer of unknown type dropped");
            return;
        };
        let offer = match message.payload.session_description() {
            Ok(Some(offer)) => offer,
            Ok(None) => {
                tracing::warn!(target = "peer", connection = %id, "offer without sdp dropped");
                return;
            }
            Err(err) => {
                tracing::warn!(target = "peer", connection = %id, error = %err, "offer with invalid sdp dropped");
                self.emit_error(PeerError::new(
                    PeerErrorKind::WebRtc,
                    format!("Invalid sdp in offer for {id}: {err}"),
                ));
                return;
            }
        };
        if let Some(existing) = self.index.get(&id).copied() {
            tracing::warn!(target = "peer", connection = %id, "offer for live connection; replacing it");
            self.close_connection(existing);
        }

        let metadata = message.payload.metadata.clone();
        let extra = &message.payload.extra;
        let negotiation = NegotiationSession::answerer(offer, None);
        match kind {
            ConnectionKind::Data => {
                let label = extra
                    .get("label")
                    .and_then(Value::as_str)
                    .map_or_else(|| id.clone(), str::to_string);
                let serialization = extra
                    .get("serialization")
                    .and_then(Value::as_str)
                    .and_then(Serialization::parse)
                    .unwrap_or_default();
                let reliable = extra.get("reliable").and_then(Value::as_bool).unwrap_or(false);
                let created = self.create_entity(NewEntity {
                    id: id.clone(),
                    kind,
                    label,
                    metadata,
                    negotiation,
                    variant: Variant::Data(DataState::new(
                        serialization,
                        reliable,
                        self.config.max_message_size,
                    )),
                });
                match created {
                    Ok(parts) => {
                        let handle = DataConnection::new(
                            parts.key,
                            parts.shared,
                            serialization,
                            reliable,
                            parts.commands,
                            parts.events,
                        );
                        self.emit(PeerEvent::Connection(handle));
                        self.replay(parts.key);
                    }
                    Err(err) => self.emit_error(err),
                }
            }
            ConnectionKind::Media => {
                let created = self.create_entity(NewEntity {
                    id: id.clone(),
                    kind,
                    label: id.clone(),
                    metadata,
                    negotiation,
                    variant: Variant::Media(MediaState::new(None, StreamSource::Camera)),
                });
                match created {
                    Ok(parts) => {
                        let key = parts.key;
                        let handle = MediaConnection::new(
                            key,
                            parts.shared,
                            StreamSource::Camera,
                            parts.commands,
                            parts.events,
                        );
                        self.emit(PeerEvent::Call(handle));
                        self.answer(key);
                    }
                    Err(err) => self.emit_error(err),
                }
            }
        }
    }

    /// Accept an inbound media offer.
    fn answer(&mut self, key: ConnectionKey) {
        if let Some(conn) = self.connections.get(&key) {
            conn.mark_open();
        }
        self.replay(key);
    }

    fn dispatch(&mut self, message: SignalingMessage) {
        let Some(id) = message.connection_id().map(str::to_string) else {
            tracing::warn!(target = "peer", kind = %message.kind, "message without connection id dropped");
            return;
        };
        let ready = self
            .index
            .get(&id)
            .copied()
            .filter(|key| {
                self.connections
                    .get(key)
                    .is_some_and(|conn| conn.negotiation.has_session())
            });
        match ready {
            Some(key) => self.deliver(key, message),
            None => {
                let seq = self.next_seq;
                self.next_seq += 1;
                tracing::debug!(target = "peer", connection = %id, kind = %message.kind, seq, "buffering message");
                self.pending.entry(id).or_default().push(Pending { seq, message });
            }
        }
    }

    fn deliver(&mut self, key: ConnectionKey, message: SignalingMessage) {
        let Some(conn) = self.connections.get_mut(&key) else {
            return;
        };
        let id = conn.id();
        let mut ctx = StepCtx {
            key,
            connection_id: &id,
            api: &self.api,
            jobs: &mut self.jobs,
        };
        let effects = conn.handle_message(message, &mut ctx);
        self.apply(key, effects);
    }

    /// Deliver everything buffered for this entity, oldest first.
    fn replay(&mut self, key: ConnectionKey) {
        let Some(conn) = self.connections.get(&key) else {
            return;
        };
        if !conn.negotiation.has_session() {
            return;
        }
        let Some(queue) = self.pending.remove(&conn.id()) else {
            return;
        };
        tracing::debug!(target = "peer", connection = %conn.id(), count = queue.len(), "replaying buffered messages");
        for entry in queue {
            if !self.connections.contains_key(&key) {
                break;
            }
            self.deliver(key, entry.message);
        }
    }

    // entities

    fn create_entity(&mut self, entity: NewEntity) -> Result<EntityParts, PeerError> {
        if self.index.contains_key(&entity.id) {
            return Err(PeerError::new(
                PeerErrorKind::InvalidId,
                format!("Connection {} is already registered.", entity.id),
            ));
        }
        let Some(commands) = self.commands.upgrade() else {
            return Err(PeerError::new(
                PeerErrorKind::Disconnected,
                "The peer has been destroyed.",
            ));
        };
        let key = ConnectionKey::from_raw(self.next_key);
        self.next_key += 1;
        let shared = Arc::new(ConnectionShared::new(
            entity.id.clone(),
            entity.kind,
            entity.label,
            entity.metadata,
        ));
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let conn = Connection::new(
            key,
            Arc::clone(&shared),
            entity.negotiation,
            entity.variant,
            events_tx,
        );
        tracing::debug!(target = "peer", connection = %entity.id, %key, kind = %entity.kind, role = ?conn.negotiation.role(), "connection registered");
        self.connections.insert(key, conn);
        self.index.insert(entity.id, key);

        let engine = Arc::clone(&self.engine);
        let config = self.session_config.clone();
        let transport = TransportEvents::new(key, self.transport_tx.clone());
        self.jobs.spawn(key, async move {
            Outcome::SessionCreated(engine.create_session(&config, transport).await)
        });

        Ok(EntityParts {
            key,
            shared,
            events: events_rx,
            commands,
        })
    }

    fn close_connection(&mut self, key: ConnectionKey) {
        let Some(mut conn) = self.connections.remove(&key) else {
            return;
        };
        let id = conn.id();
        if self.index.get(&id) == Some(&key) {
            self.index.remove(&id);
        }
        if let Some(dropped) = self.pending.remove(&id) {
            tracing::debug!(target = "peer", connection = %id, count = dropped.len(), "dropping buffered messages");
        }
        if conn.close() {
            tracing::debug!(target = "peer", connection = %id, %key, "connection closed");
        }
    }

    fn remap(&mut self, old: &str, new: &str) -> Result<(), PeerError> {
        let Some(key) = self.index.get(old).copied() else {
            let err = PeerError::new(
                PeerErrorKind::InvalidId,
                format!("Cannot remap unknown connection {old}."),
            );
            self.emit_error(err.clone());
            return Err(err);
        };
        self.remap_key(key, new);
        Ok(())
    }

    fn remap_key(&mut self, key: ConnectionKey, new: &str) {
        let Some(old) = self.connections.get(&key).map(Connection::id) else {
            return;
        };
        if old != new {
            let mut merged = self.pending.remove(&old).unwrap_or_default();
            merged.extend(self.pending.remove(new).unwrap_or_default());
            merged.sort_by_key(|entry| entry.seq);

            if let Some(other) = self.index.get(new).copied().filter(|other| *other != key) {
                tracing::warn!(target = "peer", connection = %new, "remap target is live; closing it");
                self.close_connection(other);
            }
            self.index.remove(&old);
            self.index.insert(new.to_string(), key);
            if let Some(conn) = self.connections.get(&key) {
                conn.shared.set_id(new);
            }
            if !merged.is_empty() {
                self.pending.insert(new.to_string(), merged);
            }
            tracing::debug!(target = "peer", from = %old, to = %new, "connection remapped");
        }
        self.replay(key);
    }

    fn apply(&mut self, key: ConnectionKey, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::Report(err) => self.emit_error(err),
                Effect::Close => self.close_connection(key),
                Effect::Answered(response) => self.on_answered(key, response),
                Effect::Track(track) => self.add_track(track),
            }
        }
    }

    fn on_answered(&mut self, key: ConnectionKey, response: SignalingMessage) {
        if let Some(id) = response.connection_id().map(str::to_string) {
            self.remap_key(key, &id);
        }
        self.deliver(key, response);

        let Some(conn) = self.connections.get_mut(&key) else {
            return;
        };
        let id = conn.id();
        let mut ctx = StepCtx {
            key,
            connection_id: &id,
            api: &self.api,
            jobs: &mut self.jobs,
        };
        let step = conn.negotiation.resume(&mut ctx);
        let effects = conn.absorb(step);
        self.apply(key, effects);
    }

    fn add_track(&mut self, track: RemoteTrack) {
        let tracks = self.tracks.entry(track.stream_id.clone()).or_default();
        if tracks.iter().any(|known| known.id == track.id) {
            return;
        }
        tracing::debug!(target = "peer", stream = %track.stream_id, track = %track.id, "remote track added");
        self.grown_streams.insert(track.stream_id.clone());
        tracks.push(track);
    }

    /// One `Tracks` event per grown stream, carrying the stream's whole set.
    fn announce_tracks(&mut self) {
        for stream in std::mem::take(&mut self.grown_streams) {
            if let Some(tracks) = self.tracks.get(&stream) {
                self.emit(PeerEvent::Tracks(tracks.clone()));
            }
        }
    }

    fn on_transport(&mut self, key: ConnectionKey, event: TransportEvent) {
        let Some(conn) = self.connections.get_mut(&key) else {
            tracing::trace!(target = "webrtc", %key, ?event, "event for closed connection ignored");
            return;
        };
        let id = conn.id();
        let mut ctx = StepCtx {
            key,
            connection_id: &id,
            api: &self.api,
            jobs: &mut self.jobs,
        };
        let effects = conn.handle_transport(event, &mut ctx);
        self.apply(key, effects);
    }

    fn on_completion(&mut self, done: Completion) {
        let Completion { key, outcome } = done;
        let Some(conn) = self.connections.get_mut(&key) else {
            if let Outcome::SessionCreated(Ok(session)) = outcome {
                release(session);
            }
            tracing::trace!(target = "peer", %key, "completion for closed connection ignored");
            return;
        };
        let id = conn.id();
        let mut ctx = StepCtx {
            key,
            connection_id: &id,
            api: &self.api,
            jobs: &mut self.jobs,
        };
        let mut session_ready = false;
        let effects = match outcome {
            Outcome::SessionCreated(Err(err)) => {
                conn.absorb(Some(NegotiationEvent::Failed(err.into())))
            }
            Outcome::SessionCreated(Ok(session)) => {
                let handle = Arc::clone(&session);
                match conn.negotiation.attach(session) {
                    Err(session) => {
                        release(session);
                        Vec::new()
                    }
                    Ok(()) => {
                        session_ready = true;
                        prepare(conn, handle, &mut ctx)
                    }
                }
            }
            Outcome::Prepared(Err(err)) => {
                conn.absorb(Some(NegotiationEvent::Failed(err.into())))
            }
            Outcome::Prepared(Ok(path)) => {
                if let Some(path) = path {
                    conn.attach_data_path(path);
                }
                let step = conn.negotiation.start(&mut ctx);
                conn.absorb(step)
            }
            Outcome::LocalDescribed(result) => {
                let step = conn.negotiation.on_local_described(result, &mut ctx);
                conn.absorb(step)
            }
            Outcome::RemoteApplied(result) => {
                let step = conn.negotiation.on_remote_applied(result, &mut ctx);
                conn.absorb(step)
            }
            Outcome::Submitted(result) => {
                let step = conn.negotiation.on_submitted(result, &mut ctx);
                conn.absorb(step)
            }
            Outcome::Trickled(result) => {
                let step = conn.negotiation.on_trickled(result);
                conn.absorb(step)
            }
            Outcome::CandidateApplied(result) => {
                let step = conn.negotiation.on_candidate_applied(result);
                conn.absorb(step)
            }
        };
        self.apply(key, effects);
        if session_ready {
            self.replay(key);
        }
    }

    // commands

    fn on_command(&mut self, command: Command) {
        match command {
            Command::Connect { options, reply } => {
                let result = self.connect(options);
                let _ = reply.send(result);
            }
            Command::Publish {
                stream,
                options,
                reply,
            } => {
                let result = self.publish(stream, options);
                let _ = reply.send(result);
            }
            Command::Disconnect => self.disconnect(),
            Command::Destroy => self.destroy(),
            Command::Reconnect { reply } => {
                let result = self.reconnect();
                let _ = reply.send(result);
            }
            Command::Remap { old, new, reply } => {
                let _ = reply.send(self.remap(&old, &new));
            }
            Command::SendSignal(message) => {
                if self.state == PeerState::Destroyed {
                    tracing::debug!(target = "signaling", kind = %message.kind, "peer destroyed; signal dropped");
                    return;
                }
                self.channel.send(message);
            }
            Command::Snapshot(reply) => {
                let _ = reply.send(self.snapshot());
            }
            Command::Send { key, payload } => {
                let Some(conn) = self.connections.get(&key) else {
                    tracing::debug!(target = "peer", %key, "send on closed connection dropped");
                    return;
                };
                if let Err(err) = conn.send(payload) {
                    conn.error(err);
                }
            }
            Command::Close { key, flush } => self.close_requested(key, flush),
        }
    }

    fn close_requested(&mut self, key: ConnectionKey, flush: bool) {
        let Some(conn) = self.connections.get(&key) else {
            return;
        };
        if flush && conn.shared.is_open() {
            if let Variant::Data(data) = &conn.variant {
                match data.send_close_notice() {
                    // the remote closes the path, which closes us
                    Ok(()) => return,
                    Err(err) => conn.error(err),
                }
            }
        }
        self.close_connection(key);
    }

    fn connect(&mut self, options: ConnectOptions) -> Result<DataConnection, PeerError> {
        self.usable()?;
        let id = provisional_id(ConnectionKind::Data);
        let label = options.label.clone().unwrap_or_else(|| id.clone());
        let negotiation = NegotiationSession::originator(
            Submit::Join {
                media_config: options.metadata.clone(),
                pin: self.config.pin.clone(),
            },
            options.sdp_transform.clone(),
        );
        let parts = self.create_entity(NewEntity {
            id,
            kind: ConnectionKind::Data,
            label,
            metadata: options.metadata,
            negotiation,
            variant: Variant::Data(DataState::new(
                options.serialization,
                options.reliable,
                self.config.max_message_size,
            )),
        })?;
        Ok(DataConnection::new(
            parts.key,
            parts.shared,
            options.serialization,
            options.reliable,
            parts.commands,
            parts.events,
        ))
    }

    fn publish(
        &mut self,
        stream: LocalStream,
        options: PublishOptions,
    ) -> Result<MediaConnection, PeerError> {
        self.usable()?;
        let id = provisional_id(ConnectionKind::Media);
        let submit = match options.source {
            StreamSource::Screen => Submit::Present {
                media_config: options.metadata.clone(),
            },
            StreamSource::Camera => Submit::Join {
                media_config: options.metadata.clone(),
                pin: self.config.pin.clone(),
            },
        };
        let mut negotiation = NegotiationSession::originator(submit, None);
        negotiation.set_sdp_transform(options.sdp_transform.clone());
        let parts = self.create_entity(NewEntity {
            id: id.clone(),
            kind: ConnectionKind::Media,
            label: id,
            metadata: options.metadata,
            negotiation,
            variant: Variant::Media(MediaState::new(Some(stream), options.source)),
        })?;
        Ok(MediaConnection::new(
            parts.key,
            parts.shared,
            options.source,
            parts.commands,
            parts.events,
        ))
    }

    fn reconnect(&mut self) -> Result<(), PeerError> {
        match self.state {
            PeerState::Destroyed => Err(PeerError::new(
                PeerErrorKind::Disconnected,
                "This peer cannot reconnect to the server. It has already been destroyed.",
            )),
            PeerState::Disconnected => {
                let identity = self
                    .identity
                    .last_known
                    .clone()
                    .or_else(|| self.config.group_id.clone());
                let Some(identity) = identity else {
                    let err = PeerError::new(PeerErrorKind::InvalidId, "No groupId was specified");
                    self.emit_error(err.clone());
                    return Err(err);
                };
                tracing::info!(target = "peer", identity = %identity, "reconnecting");
                self.state = PeerState::Unopened;
                self.open_channel(identity);
                Ok(())
            }
            PeerState::Unopened | PeerState::Open => {
                tracing::debug!(target = "peer", state = %self.state, "reconnect ignored; not disconnected");
                Ok(())
            }
        }
    }

    fn snapshot(&self) -> PeerSnapshot {
        let mut connections: Vec<ConnectionSnapshot> = self
            .connections
            .values()
            .map(|conn| ConnectionSnapshot {
                key: conn.key,
                connection_id: conn.id(),
                kind: conn.kind(),
                role: conn.negotiation.role(),
                open: conn.shared.is_open(),
                negotiation: conn.negotiation.state(),
            })
            .collect();
        connections.sort_by_key(|conn| conn.key);
        PeerSnapshot {
            state: self.state,
            identity: self.identity.current.clone(),
            last_known_identity: self.identity.last_known.clone(),
            connections,
            pending: self
                .pending
                .iter()
                .map(|(id, queue)| (id.clone(), queue.len()))
                .collect(),
            participants: self.participants.values().cloned().collect(),
            tracks: self
                .tracks
                .iter()
                .map(|(stream, tracks)| {
                    (stream.clone(), tracks.iter().map(|track| track.id.clone()).collect())
                })
                .collect(),
            queued_signals: self.channel.queued(),
        }
    }
}

enum Preparation {
    DataChannel { label: String, reliable: bool },
    Tracks(Vec<Arc<dyn TrackLocal + Send + Sync>>),
}

/// Queue whatever has to exist on the session before the first description.
fn prepare(conn: &mut Connection, session: Arc<dyn RtcSession>, ctx: &mut StepCtx<'_>) -> Vec<Effect> {
    let originator = conn.negotiation.role() == Role::Originator;
    let preparation = match &conn.variant {
        Variant::Data(data) if originator => Some(Preparation::DataChannel {
            label: conn.shared.label().to_string(),
            reliable: data.reliable,
        }),
        Variant::Media(MediaState {
            stream: Some(stream),
            ..
        }) => Some(Preparation::Tracks(stream.tracks.clone())),
        _ => None,
    };
    match preparation {
        Some(Preparation::DataChannel { label, reliable }) => {
            ctx.jobs.spawn(ctx.key, async move {
                Outcome::Prepared(session.create_data_channel(&label, reliable).await.map(Some))
            });
            Vec::new()
        }
        Some(Preparation::Tracks(tracks)) => {
            ctx.jobs.spawn(ctx.key, async move {
                for track in tracks {
                    if let Err(err) = session.add_track(track).await {
                        return Outcome::Prepared(Err(err));
                    }
                }
                Outcome::Prepared(Ok(None))
            });
            Vec::new()
        }
        None => {
            let step = conn.negotiation.start(ctx);
            conn.absorb(step)
        }
    }
}

fn release(session: Arc<dyn RtcSession>) {
    tokio::spawn(async move {
        if let Err(err) = session.close().await {
            tracing::debug!(target = "webrtc", error = %err, "orphaned session close failed");
        }
    });
}

async fn heartbeat(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}
