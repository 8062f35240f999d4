mod support;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{
    Path, State,
    ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use reqwest::Client;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use url::Url;

use huddle_peer::api::{AnswerRequest, HttpSignalingApi, JoinRequest, PresentRequest, SignalingApi};
use huddle_peer::error::ApiError;
use huddle_peer::protocol::{IceCandidate, SessionDescription};
use huddle_peer::signaling::WsConnector;
use huddle_peer::{ConnectOptions, MessageType, Peer, PeerConfig, PeerEvent};

use support::{FakeEngine, GROUP, REMOTE_ANSWER, WAIT, eventually, init_tracing};

#[derive(Clone, Default)]
struct Recorder {
    requests: Arc<Mutex<Vec<(String, Value)>>>,
    socket_frames: Arc<Mutex<Option<mpsc::UnboundedSender<String>>>>,
}

impl Recorder {
    fn record(&self, route: String, body: Value) {
        self.requests.lock().push((route, body));
    }

    fn requests(&self) -> Vec<(String, Value)> {
        self.requests.lock().clone()
    }
}

async fn join(
    State(recorder): State<Recorder>,
    Path(group): Path<String>,
    Json(body): Json<Value>,
) -> Json<Value> {
    recorder.record(format!("join:{group}"), body);
    Json(json!({
        "type": "ANSWER",
        "payload": {
            "connectionId": "srv-http",
            "sdp": {"type": "answer", "sdp": REMOTE_ANSWER},
        },
    }))
}

async fn answer(State(recorder): State<Recorder>, Json(body): Json<Value>) -> Json<Value> {
    recorder.record("answer".into(), body);
    Json(json!({"type": "ANSWER_ACCEPTED"}))
}

async fn trickle(
    State(recorder): State<Recorder>,
    Path(connection_id): Path<String>,
    Json(body): Json<Value>,
) -> StatusCode {
    recorder.record(format!("trickle:{connection_id}"), body);
    StatusCode::OK
}

async fn present(State(recorder): State<Recorder>, Json(body): Json<Value>) -> impl IntoResponse {
    recorder.record("present".into(), body);
    (StatusCode::SERVICE_UNAVAILABLE, "busy")
}

async fn socket(
    ws: WebSocketUpgrade,
    State(recorder): State<Recorder>,
    Path(identity): Path<String>,
) -> impl IntoResponse {
    tracing::debug!("stub: websocket upgrade for {identity}");
    ws.on_upgrade(move |socket| handle_socket(socket, recorder))
}

async fn handle_socket(socket: WebSocket, recorder: Recorder) {
    let (mut sender, mut receiver) = socket.split();
    let open = json!({"type": "OPEN"}).to_string();
    if sender.send(WsMessage::Text(open)).await.is_err() {
        return;
    }
    while let Some(Ok(message)) = receiver.next().await {
        if let WsMessage::Text(text) = message {
            if let Some(frames) = recorder.socket_frames.lock().as_ref() {
                let _ = frames.send(text);
            }
        }
    }
}

async fn serve(recorder: Recorder) -> SocketAddr {
    let router = Router::new()
        .route("/groups/:group/join/", post(join))
        .route("/participants/answer/", post(answer))
        .route("/participants/:connection_id/trickle/", post(trickle))
        .route("/participants/present/", post(present))
        .route("/ws/:identity/server", get(socket))
        .with_state(recorder);
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind signaling stub");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, router).await.ok();
    });
    addr
}

fn api_for(addr: SocketAddr, group: Option<&str>) -> HttpSignalingApi {
    let base = Url::parse(&format!("http://{addr}")).expect("base url");
    HttpSignalingApi::with_client(Client::new(), base, group.map(str::to_string))
}

#[test_timeout::tokio_timeout_test]
async fn join_posts_offer_and_parses_reply() {
    init_tracing();
    let recorder = Recorder::default();
    let addr = serve(recorder.clone()).await;
    let api = api_for(addr, Some(GROUP));

    let reply = api
        .join(JoinRequest::new(
            &SessionDescription::offer("v=0 offer"),
            Some(json!({"bitrate": "500"})),
            Some("1234".into()),
        ))
        .await
        .expect("join");
    assert_eq!(reply.kind, MessageType::Answer);
    assert_eq!(reply.connection_id(), Some("srv-http"));
    assert_eq!(
        reply.payload.session_description().expect("well-formed sdp"),
        Some(SessionDescription::answer(REMOTE_ANSWER))
    );
    assert_eq!(
        recorder.requests(),
        [(
            format!("join:{GROUP}"),
            json!({
                "sdp_sdp": "v=0 offer",
                "sdp_type": "offer",
                "media_config": {"bitrate": "500"},
                "pin": "1234",
            })
        )]
    );
}

#[test_timeout::tokio_timeout_test]
async fn answer_and_trickle_hit_participant_routes() {
    init_tracing();
    let recorder = Recorder::default();
    let addr = serve(recorder.clone()).await;
    let api = api_for(addr, Some(GROUP));

    let ack = api
        .send_answer(AnswerRequest::new(&SessionDescription::answer("v=0 a"), "c-7"))
        .await
        .expect("answer");
    assert_eq!(ack.kind, MessageType::Other("ANSWER_ACCEPTED".into()));

    let mut candidate = IceCandidate::new("candidate:1 1 udp 2130706431 10.0.0.2 5000 typ host");
    candidate.sdp_mid = Some("0".into());
    api.trickle_candidates("c-7", vec![candidate])
        .await
        .expect("trickle");

    let requests = recorder.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0].0, "answer");
    assert_eq!(requests[0].1["connection_id"], "c-7");
    assert_eq!(requests[1].0, "trickle:c-7");
    assert_eq!(
        requests[1].1,
        json!([{
            "candidate": "candidate:1 1 udp 2130706431 10.0.0.2 5000 typ host",
            "sdpMid": "0",
        }])
    );
}

#[test_timeout::tokio_timeout_test]
async fn non_ok_status_becomes_an_api_error() {
    init_tracing();
    let recorder = Recorder::default();
    let addr = serve(recorder.clone()).await;
    let api = api_for(addr, Some(GROUP));

    let err = api
        .present(PresentRequest::new(&SessionDescription::offer("v=0 screen"), None))
        .await
        .unwrap_err();
    match err {
        ApiError::Present(reason) => assert!(reason.contains("503"), "{reason}"),
        other => panic!("expected present error, got {other:?}"),
    }
    assert_eq!(recorder.requests().len(), 1);
}

#[test_timeout::tokio_timeout_test]
async fn unreachable_server_is_reported() {
    init_tracing();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let err = api_for(addr, None)
        .trickle_candidates("c-1", Vec::new())
        .await
        .unwrap_err();
    assert!(matches!(err, ApiError::Trickle { connection_id, .. } if connection_id == "c-1"));
}

#[test_timeout::tokio_timeout_test]
async fn peer_negotiates_against_live_signaling_stub() {
    init_tracing();
    let recorder = Recorder::default();
    let (frames_tx, mut frames_rx) = mpsc::unbounded_channel();
    *recorder.socket_frames.lock() = Some(frames_tx);
    let addr = serve(recorder.clone()).await;

    let config = PeerConfig::new(GROUP)
        .with_host("127.0.0.1", addr.port())
        .with_ice_servers(Vec::new());
    let api = HttpSignalingApi::new(&config).expect("api");
    let engine = FakeEngine::new();
    let (peer, mut events) = Peer::new(config, engine.clone(), Arc::new(api), Arc::new(WsConnector));

    match tokio::time::timeout(WAIT, events.recv()).await.expect("open") {
        Some(PeerEvent::Open(identity)) => assert_eq!(identity, GROUP),
        other => panic!("expected open, got {other:?}"),
    }

    let conn = peer.connect(ConnectOptions::default()).await.expect("connect");
    let session = engine.wait_session(0).await;
    session.gather(&["candidate:host-a"]);
    eventually("trickle posted", || {
        recorder
            .requests()
            .iter()
            .any(|(route, _)| route == "trickle:srv-http")
    })
    .await;
    assert_eq!(conn.connection_id(), "srv-http");
    assert!(session.has_call(&format!("remote:{REMOTE_ANSWER}")));

    let routes: Vec<String> = recorder.requests().into_iter().map(|(route, _)| route).collect();
    assert_eq!(routes, [format!("join:{GROUP}"), "trickle:srv-http".to_string()]);

    peer.send_signal(huddle_peer::SignalingMessage::new(MessageType::Leave));
    let frame = tokio::time::timeout(WAIT, frames_rx.recv())
        .await
        .expect("socket frame")
        .expect("socket open");
    assert_eq!(frame, r#"{"type":"LEAVE"}"#);
}
