#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::channel::mpsc as fmpsc;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::{Semaphore, mpsc};
use tokio::time::{Instant, sleep, timeout};
use tracing_subscriber::{EnvFilter, fmt::SubscriberBuilder};
use url::Url;
use webrtc::track::track_local::TrackLocal;

use huddle_peer::api::{AnswerRequest, JoinRequest, PresentRequest, SignalingApi};
use huddle_peer::error::{ApiError, SignalingError, TransportError};
use huddle_peer::protocol::{IceCandidate, SessionDescription};
use huddle_peer::rtc::{
    Capabilities, DataPath, GatheringState, RtcEngine, RtcSession, SessionConfig, TransportEvent,
    TransportEvents,
};
use huddle_peer::signaling::{SocketConnector, SocketSink, SocketStream};
use huddle_peer::{MessageType, Peer, PeerConfig, PeerEvent, PeerEvents, SignalingMessage};

pub const GROUP: &str = "standup";
pub const REMOTE_ANSWER: &str = "v=0 remote-answer";
pub const WAIT: Duration = Duration::from_secs(2);

pub fn init_tracing() {
    let _ = SubscriberBuilder::default()
        .with_test_writer()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}

pub fn config() -> PeerConfig {
    PeerConfig::new(GROUP).with_ice_servers(Vec::new())
}

pub async fn eventually(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + WAIT;
    while !condition() {
        if Instant::now() >= deadline {
            panic!("timed out waiting for {what}");
        }
        sleep(Duration::from_millis(5)).await;
    }
}

pub fn server_answer(connection_id: &str) -> SignalingMessage {
    SignalingMessage::for_connection(MessageType::Answer, connection_id)
        .with_sdp(SessionDescription::answer(REMOTE_ANSWER))
}

pub fn remote_candidate(connection_id: &str, candidate: &str) -> SignalingMessage {
    SignalingMessage::for_connection(MessageType::Candidate, connection_id)
        .with_candidate(IceCandidate::new(candidate))
}

pub fn remote_offer(connection_id: &str, kind: &str) -> SignalingMessage {
    let mut message = SignalingMessage::for_connection(MessageType::Offer, connection_id)
        .with_sdp(SessionDescription::offer(format!("v=0 offer-{connection_id}")));
    message.payload.kind = Some(kind.to_string());
    message
}

// transport

pub struct FakeDataPath {
    label: String,
    pub sent: Mutex<Vec<Bytes>>,
    pub closed: AtomicBool,
}

impl FakeDataPath {
    pub fn new(label: &str) -> Arc<Self> {
        Arc::new(Self {
            label: label.to_string(),
            sent: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        })
    }

    pub fn sent_text(&self) -> Vec<String> {
        self.sent
            .lock()
            .iter()
            .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
            .collect()
    }
}

impl DataPath for FakeDataPath {
    fn label(&self) -> &str {
        &self.label
    }

    fn send(&self, data: Bytes) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::ChannelClosed);
        }
        self.sent.lock().push(data);
        Ok(())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

pub struct FakeSession {
    events: TransportEvents,
    calls: Mutex<Vec<String>>,
    pub channels: Mutex<Vec<Arc<FakeDataPath>>>,
    pub closed: AtomicBool,
}

impl FakeSession {
    pub fn emit(&self, event: TransportEvent) {
        assert!(self.events.emit(event), "peer task gone");
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub fn has_call(&self, call: &str) -> bool {
        self.calls.lock().iter().any(|seen| seen == call)
    }

    pub fn gather(&self, candidates: &[&str]) {
        for candidate in candidates {
            self.emit(TransportEvent::IceCandidate(IceCandidate::new(*candidate)));
        }
        self.emit(TransportEvent::GatheringState(GatheringState::Complete));
    }

    pub fn channel(&self) -> Arc<FakeDataPath> {
        self.channels
            .lock()
            .first()
            .cloned()
            .expect("no data channel created")
    }

    fn record(&self, call: String) {
        self.calls.lock().push(call);
    }
}

#[async_trait]
impl RtcSession for FakeSession {
    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        self.record("create_offer".into());
        Ok(SessionDescription::offer("v=0 local-offer"))
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        self.record("create_answer".into());
        Ok(SessionDescription::answer("v=0 local-answer"))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), TransportError> {
        self.record(format!("local:{}", desc.sdp));
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), TransportError> {
        self.record(format!("remote:{}", desc.sdp));
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        self.record(format!("candidate:{}", candidate.candidate));
        Ok(())
    }

    async fn add_track(&self, track: Arc<dyn TrackLocal + Send + Sync>) -> Result<(), TransportError> {
        self.record(format!("track:{}", track.id()));
        Ok(())
    }

    async fn create_data_channel(
        &self,
        label: &str,
        reliable: bool,
    ) -> Result<Arc<dyn DataPath>, TransportError> {
        self.record(format!("channel:{label}:{reliable}"));
        let path = FakeDataPath::new(label);
        self.channels.lock().push(Arc::clone(&path));
        Ok(path)
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.closed.store(true, Ordering::SeqCst);
        self.record("close".into());
        Ok(())
    }
}

pub struct FakeEngine {
    capabilities: Capabilities,
    gate: Option<Arc<Semaphore>>,
    sessions: Mutex<Vec<Arc<FakeSession>>>,
}

impl FakeEngine {
    pub fn new() -> Arc<Self> {
        Self::build(Capabilities { data: true, media: true }, None)
    }

    pub fn incompatible() -> Arc<Self> {
        Self::build(Capabilities { data: false, media: false }, None)
    }

    /// Session creation blocks until `release` is called once per session.
    pub fn gated() -> Arc<Self> {
        Self::build(
            Capabilities { data: true, media: true },
            Some(Arc::new(Semaphore::new(0))),
        )
    }

    fn build(capabilities: Capabilities, gate: Option<Arc<Semaphore>>) -> Arc<Self> {
        Arc::new(Self {
            capabilities,
            gate,
            sessions: Mutex::new(Vec::new()),
        })
    }

    pub fn release(&self) {
        if let Some(gate) = &self.gate {
            gate.add_permits(1);
        }
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn session(&self, index: usize) -> Arc<FakeSession> {
        Arc::clone(&self.sessions.lock()[index])
    }

    pub async fn wait_session(&self, index: usize) -> Arc<FakeSession> {
        eventually("transport session", || self.session_count() > index).await;
        self.session(index)
    }
}

#[async_trait]
impl RtcEngine for FakeEngine {
    fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    async fn create_session(
        &self,
        _config: &SessionConfig,
        events: TransportEvents,
    ) -> Result<Arc<dyn RtcSession>, TransportError> {
        if let Some(gate) = &self.gate {
            gate.acquire()
                .await
                .map_err(|_| TransportError::Setup("gate closed".into()))?
                .forget();
        }
        let session = Arc::new(FakeSession {
            events,
            calls: Mutex::new(Vec::new()),
            channels: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        });
        self.sessions.lock().push(Arc::clone(&session));
        Ok(session)
    }
}

// http signaling

#[derive(Default)]
pub struct FakeApi {
    pub joins: Mutex<Vec<JoinRequest>>,
    pub answers: Mutex<Vec<AnswerRequest>>,
    pub presents: Mutex<Vec<PresentRequest>>,
    pub trickles: Mutex<Vec<(String, Vec<IceCandidate>)>>,
    join_replies: Mutex<VecDeque<Result<SignalingMessage, ApiError>>>,
    issued: AtomicU64,
}

impl FakeApi {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn reply_to_join(&self, reply: Result<SignalingMessage, ApiError>) {
        self.join_replies.lock().push_back(reply);
    }

    pub fn trickles(&self) -> Vec<(String, Vec<String>)> {
        self.trickles
            .lock()
            .iter()
            .map(|(id, candidates)| {
                (
                    id.clone(),
                    candidates.iter().map(|c| c.candidate.clone()).collect(),
                )
            })
            .collect()
    }

    fn next_reply(&self) -> Result<SignalingMessage, ApiError> {
        self.join_replies.lock().pop_front().unwrap_or_else(|| {
            let n = self.issued.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(server_answer(&format!("srv-{n}")))
        })
    }
}

#[async_trait]
impl SignalingApi for FakeApi {
    async fn join(&self, request: JoinRequest) -> Result<SignalingMessage, ApiError> {
        self.joins.lock().push(request);
        self.next_reply()
    }

    async fn send_answer(&self, request: AnswerRequest) -> Result<SignalingMessage, ApiError> {
        self.answers.lock().push(request);
        Ok(SignalingMessage::new(MessageType::Other("ANSWER_ACCEPTED".into())))
    }

    async fn trickle_candidates(
        &self,
        connection_id: &str,
        candidates: Vec<IceCandidate>,
    ) -> Result<(), ApiError> {
        self.trickles
            .lock()
            .push((connection_id.to_string(), candidates));
        Ok(())
    }

    async fn present(&self, request: PresentRequest) -> Result<SignalingMessage, ApiError> {
        self.presents.lock().push(request);
        self.next_reply()
    }
}

// socket

/// Server end of one accepted socket.
pub struct ServerSocket {
    pub url: String,
    incoming: fmpsc::UnboundedReceiver<String>,
    outgoing: fmpsc::UnboundedSender<String>,
}

impl ServerSocket {
    pub fn send(&self, message: &SignalingMessage) {
        let text = serde_json::to_string(message).expect("encode message");
        self.send_raw(&text);
    }

    pub fn send_raw(&self, text: &str) {
        self.outgoing
            .unbounded_send(text.to_string())
            .expect("client socket gone");
    }

    pub async fn recv_within(&mut self, limit: Duration) -> SignalingMessage {
        let text = timeout(limit, self.incoming.next())
            .await
            .expect("timed out waiting for client frame")
            .expect("client socket closed");
        serde_json::from_str(&text).expect("client sent invalid json")
    }

    pub async fn recv(&mut self) -> SignalingMessage {
        self.recv_within(WAIT).await
    }

    /// Wait for the client to drop its end, skipping frames already in flight.
    pub async fn closed(&mut self) {
        timeout(WAIT, async {
            while self.incoming.next().await.is_some() {}
        })
        .await
        .expect("client kept the socket open");
    }
}

pub struct FakeConnector {
    urls: Mutex<Vec<String>>,
    accepted_tx: mpsc::UnboundedSender<ServerSocket>,
    accepted_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<ServerSocket>>,
}

impl FakeConnector {
    pub fn new() -> Arc<Self> {
        let (accepted_tx, accepted_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            urls: Mutex::new(Vec::new()),
            accepted_tx,
            accepted_rx: tokio::sync::Mutex::new(accepted_rx),
        })
    }

    pub fn urls(&self) -> Vec<String> {
        self.urls.lock().clone()
    }

    pub async fn accept(&self) -> ServerSocket {
        let mut rx = self.accepted_rx.lock().await;
        timeout(WAIT, rx.recv())
            .await
            .expect("timed out waiting for socket connect")
            .expect("connector dropped")
    }
}

#[async_trait]
impl SocketConnector for FakeConnector {
    async fn connect(&self, url: &Url) -> Result<(SocketSink, SocketStream), SignalingError> {
        self.urls.lock().push(url.to_string());
        let (client_tx, server_rx) = fmpsc::unbounded::<String>();
        let (server_tx, client_rx) = fmpsc::unbounded::<String>();
        let _ = self.accepted_tx.send(ServerSocket {
            url: url.to_string(),
            incoming: server_rx,
            outgoing: server_tx,
        });
        let sink = client_tx.sink_map_err(|err| SignalingError::Send(err.to_string()));
        let stream = client_rx.map(Ok::<String, SignalingError>);
        Ok((Box::pin(sink), Box::pin(stream)))
    }
}

// peer

pub struct Harness {
    pub peer: Peer,
    pub events: PeerEvents,
    pub engine: Arc<FakeEngine>,
    pub api: Arc<FakeApi>,
    pub connector: Arc<FakeConnector>,
}

impl Harness {
    pub fn start(config: PeerConfig, engine: Arc<FakeEngine>) -> Self {
        init_tracing();
        let api = FakeApi::new();
        let connector = FakeConnector::new();
        let (peer, events) = Peer::new(
            config,
            engine.clone(),
            api.clone(),
            connector.clone(),
        );
        Self {
            peer,
            events,
            engine,
            api,
            connector,
        }
    }

    /// Start a peer and let the server confirm it.
    pub async fn open(config: PeerConfig, engine: Arc<FakeEngine>) -> (Self, ServerSocket) {
        let mut harness = Self::start(config, engine);
        let server = harness.connector.accept().await;
        server.send(&SignalingMessage::new(MessageType::Open));
        match harness.next_event().await {
            PeerEvent::Open(identity) => assert_eq!(identity, GROUP),
            other => panic!("expected open, got {other:?}"),
        }
        (harness, server)
    }

    pub async fn next_event(&mut self) -> PeerEvent {
        timeout(WAIT, self.events.recv())
            .await
            .expect("timed out waiting for peer event")
            .expect("peer task exited")
    }

    /// Round-trip through the registry so earlier commands have been applied.
    pub async fn settle(&self) -> huddle_peer::PeerSnapshot {
        self.peer.snapshot().await.expect("snapshot")
    }

    pub async fn wait_for(
        &self,
        what: &str,
        condition: impl Fn(&huddle_peer::PeerSnapshot) -> bool,
    ) -> huddle_peer::PeerSnapshot {
        let deadline = Instant::now() + WAIT;
        loop {
            let snapshot = self.settle().await;
            if condition(&snapshot) {
                return snapshot;
            }
            if Instant::now() >= deadline {
                panic!("timed out waiting for {what}: {snapshot:?}");
            }
            sleep(Duration::from_millis(5)).await;
        }
    }

    pub fn drain(&mut self) -> Vec<PeerEvent> {
        let mut events = Vec::new();
        while let Some(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }
}
