//! Persistent control socket to the signaling server.
//!
//! The channel itself is plain state owned by the peer task. Socket I/O runs
//! in one spawned task per connection attempt, which reports back through
//! [`RawSocketEvent`]s tagged with the attempt's generation.

mod websocket;

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config::PeerConfig;
use crate::protocol::SignalingMessage;

pub use websocket::{SocketConnector, SocketSink, SocketStream, WsConnector};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChannelState {
    Idle,
    Connecting,
    Ready,
    Closed,
}

#[derive(Debug)]
pub enum SocketEvent {
    Opened,
    Text(String),
    Closed,
    Failed(String),
}

#[derive(Debug)]
pub struct RawSocketEvent {
    pub generation: u64,
    pub event: SocketEvent,
}

/// What the owner of the channel gets to see.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    Message(SignalingMessage),
    Error(String),
    Disconnected,
}

pub struct SignalingChannel {
    config: PeerConfig,
    connector: Arc<dyn SocketConnector>,
    events_tx: mpsc::UnboundedSender<RawSocketEvent>,
    state: ChannelState,
    generation: u64,
    identity: Option<String>,
    queue: VecDeque<SignalingMessage>,
    outbound: Option<mpsc::UnboundedSender<String>>,
    heartbeat_at: Option<Instant>,
    task: Option<JoinHandle<()>>,
}

impl SignalingChannel {
    pub fn new(
        config: PeerConfig,
        connector: Arc<dyn SocketConnector>,
        events_tx: mpsc::UnboundedSender<RawSocketEvent>,
    ) -> Self {
        Self {
            config,
            connector,
            events_tx,
            state: ChannelState::Idle,
            generation: 0,
            identity: None,
            queue: VecDeque::new(),
            outbound: None,
            heartbeat_at: None,
            task: None,
        }
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    pub fn identity(&self) -> Option<&str> {
        self.identity.as_deref()
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    pub fn ping_interval(&self) -> Duration {
        self.config.ping_interval
    }

    /// Open the socket for `identity`. A no-op while connecting or connected.
    /// Failures arrive later as [`ChannelEvent::Error`].
    pub fn connect(&mut self, identity: &str) {
        if matches!(self.state, ChannelState::Connecting | ChannelState::Ready) {
            return;
        }
        self.generation += 1;
        let generation = self.generation;
        self.state = ChannelState::Connecting;

        let events = self.events_tx.clone();
        let url = match self.config.socket_url(identity) {
            Ok(url) => url,
            Err(err) => {
                let _ = events.send(RawSocketEvent {
                    generation,
                    event: SocketEvent::Failed(format!("invalid signaling url: {err}")),
                });
                return;
            }
        };
        tracing::debug!(target = "signaling", url = %url, generation, "opening signaling socket");

        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<String>();
        self.outbound = Some(outbound_tx);
        let connector = Arc::clone(&self.connector);
        self.task = Some(tokio::spawn(async move {
            let (mut sink, mut stream) = match connector.connect(&url).await {
                Ok(pair) => pair,
                Err(err) => {
                    let _ = events.send(RawSocketEvent {
                        generation,
                        event: SocketEvent::Failed(err.to_string()),
                    });
                    return;
                }
            };
            let _ = events.send(RawSocketEvent {
                generation,
                event: SocketEvent::Opened,
            });

            let writer = async {
                while let Some(text) = outbound_rx.recv().await {
                    if let Err(err) = sink.send(text).await {
                        tracing::warn!(target = "signaling", "signaling send failed: {err}");
                        break;
                    }
                }
            };
            let reader = async {
                while let Some(item) = stream.next().await {
                    match item {
                        Ok(text) => {
                            let _ = events.send(RawSocketEvent {
                                generation,
                                event: SocketEvent::Text(text),
                            });
                        }
                        Err(err) => {
                            tracing::debug!(target = "signaling", "signaling socket ended: {err}");
                            break;
                        }
                    }
                }
            };
            tokio::select! {
                _ = writer => {}
                _ = reader => {}
            }
            let _ = events.send(RawSocketEvent {
                generation,
                event: SocketEvent::Closed,
            });
        }));
    }

    /// Messages sent before the server confirmed our identity are queued;
    /// afterwards they go straight out when the socket is ready, or are dropped.
    pub fn send(&mut self, message: SignalingMessage) {
        if matches!(self.state, ChannelState::Idle | ChannelState::Closed) {
            tracing::debug!(
                target = "signaling",
                kind = %message.kind,
                "dropping message on closed signaling channel"
            );
            return;
        }
        if self.identity.is_none() {
            self.queue.push_back(message);
            return;
        }
        self.transmit(&message);
    }

    pub fn confirm_identity(&mut self, identity: impl Into<String>) {
        self.identity = Some(identity.into());
        let queued: Vec<_> = self.queue.drain(..).collect();
        if !queued.is_empty() {
            tracing::debug!(target = "signaling", count = queued.len(), "flushing queued signaling messages");
        }
        for message in queued {
            self.transmit(&message);
        }
    }

    fn transmit(&mut self, message: &SignalingMessage) {
        if self.state != ChannelState::Ready {
            tracing::debug!(target = "signaling", kind = %message.kind, "socket not ready; message dropped");
            return;
        }
        let text = match serde_json::to_string(message) {
            Ok(text) => text,
            Err(err) => {
                tracing::warn!(target = "signaling", "failed to encode signaling message: {err}");
                return;
            }
        };
        if let Some(outbound) = &self.outbound {
            let _ = outbound.send(text);
        }
    }

    pub fn heartbeat_deadline(&self) -> Option<Instant> {
        self.heartbeat_at
    }

    /// Fire the heartbeat timer: send a keep-alive if ready, then re-arm.
    pub fn heartbeat_due(&mut self) {
        if self.heartbeat_at.is_none() {
            return;
        }
        if self.state == ChannelState::Ready {
            self.transmit(&SignalingMessage::heartbeat());
        } else {
            tracing::debug!(target = "signaling", "cannot send heartbeat, socket not ready");
        }
        self.heartbeat_at = Some(Instant::now() + self.config.ping_interval);
    }

    /// Idempotent. Returns the disconnect notification the first time.
    pub fn close(&mut self) -> Option<ChannelEvent> {
        if matches!(self.state, ChannelState::Idle | ChannelState::Closed) {
            return None;
        }
        self.teardown();
        Some(ChannelEvent::Disconnected)
    }

    fn teardown(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.outbound = None;
        self.heartbeat_at = None;
        self.identity = None;
        self.state = ChannelState::Closed;
        // anything still in flight from this socket is now stale
        self.generation += 1;
    }

    pub fn on_raw(&mut self, raw: RawSocketEvent) -> Option<ChannelEvent> {
        if raw.generation != self.generation {
            tracing::trace!(
                target = "signaling",
                generation = raw.generation,
                current = self.generation,
                "ignoring stale socket event"
            );
            return None;
        }
        match raw.event {
            SocketEvent::Opened => {
                tracing::debug!(target = "signaling", "signaling socket open");
                self.state = ChannelState::Ready;
                self.heartbeat_at = Some(Instant::now() + self.config.ping_interval);
                None
            }
            SocketEvent::Text(text) => decode(&text),
            SocketEvent::Closed => {
                tracing::debug!(target = "signaling", "signaling socket closed");
                self.teardown();
                Some(ChannelEvent::Disconnected)
            }
            SocketEvent::Failed(reason) => {
                tracing::warn!(target = "signaling", %reason, "signaling socket failed");
                self.teardown();
                Some(ChannelEvent::Error(reason))
            }
        }
    }
}

impl Drop for SignalingChannel {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

fn decode(text: &str) -> Option<ChannelEvent> {
    let value: serde_json::Value = match serde_json::from_str(text) {
        Ok(value) => value,
        Err(err) => {
            tracing::warn!(target = "signaling", "dropping undecodable signaling frame: {err}");
            return None;
        }
    };
    match serde_json::from_value::<SignalingMessage>(value) {
        Ok(message) => Some(ChannelEvent::Message(message)),
        Err(err) => Some(ChannelEvent::Error(format!("invalid message envelope: {err}"))),
    }
}
