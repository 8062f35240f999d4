use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

use super::{ConnectionEvent, ConnectionKey, ConnectionShared};
use crate::error::{PeerError, PeerErrorKind};
use crate::peer::Command;
use crate::rtc::DataPath;
use crate::telemetry::hexdump;

/// Sent over the data path by `close_flush` so the remote closes too.
pub(crate) const CLOSE_NOTICE: &str = r#"{"__peerData":{"type":"close"}}"#;

/// How application payloads are encoded on the wire.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Serialization {
    /// Bytes pass through untouched.
    Raw,
    /// UTF-8 JSON, bounded by the configured message size.
    #[default]
    Json,
}

impl Serialization {
    pub fn as_str(self) -> &'static str {
        match self {
            Serialization::Raw => "raw",
            Serialization::Json => "json",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "raw" | "binary" => Some(Serialization::Raw),
            "json" => Some(Serialization::Json),
            _ => None,
        }
    }

    pub fn encode(self, payload: &DataPayload, max_message_size: usize) -> Result<Bytes, PeerError> {
        match self {
            Serialization::Raw => match payload {
                DataPayload::Binary(bytes) => Ok(bytes.clone()),
                DataPayload::Text(text) => Ok(Bytes::from(text.clone())),
                DataPayload::Json(value) => to_json_bytes(value),
            },
            Serialization::Json => {
                let encoded = match payload {
                    DataPayload::Json(value) => to_json_bytes(value)?,
                    DataPayload::Text(text) => to_json_bytes(&Value::String(text.clone()))?,
                    DataPayload::Binary(_) => {
                        return Err(PeerError::new(
                            PeerErrorKind::WebRtc,
                            "Binary payloads require raw serialization.",
                        ));
                    }
                };
                if encoded.len() > max_message_size {
                    return Err(PeerError::new(
                        PeerErrorKind::WebRtc,
                        "Message too big for JSON channel",
                    ));
                }
                Ok(encoded)
            }
        }
    }

    /// `Ok(None)` means the remote asked us to close.
    pub fn decode(self, bytes: Bytes) -> Result<Option<DataPayload>, PeerError> {
        match self {
            Serialization::Raw => {
                if bytes.first() == Some(&b'{') && is_close_notice_bytes(&bytes) {
                    return Ok(None);
                }
                Ok(Some(DataPayload::Binary(bytes)))
            }
            Serialization::Json => {
                let value: Value = serde_json::from_slice(&bytes).map_err(|err| {
                    PeerError::new(PeerErrorKind::WebRtc, format!("Invalid JSON message: {err}"))
                })?;
                if is_close_notice(&value) {
                    return Ok(None);
                }
                Ok(Some(DataPayload::Json(value)))
            }
        }
    }
}

fn to_json_bytes(value: &Value) -> Result<Bytes, PeerError> {
    serde_json::to_vec(value)
        .map(Bytes::from)
        .map_err(|err| PeerError::new(PeerErrorKind::WebRtc, format!("Unserializable message: {err}")))
}

fn is_close_notice(value: &Value) -> bool {
    value
        .get("__peerData")
        .and_then(|inner| inner.get("type"))
        .and_then(Value::as_str)
        == Some("close")
}

fn is_close_notice_bytes(bytes: &[u8]) -> bool {
    serde_json::from_slice::<Value>(bytes)
        .map(|value| is_close_notice(&value))
        .unwrap_or(false)
}

#[derive(Clone, Debug, PartialEq)]
pub enum DataPayload {
    Binary(Bytes),
    Text(String),
    Json(Value),
}

impl From<Bytes> for DataPayload {
    fn from(bytes: Bytes) -> Self {
        DataPayload::Binary(bytes)
    }
}

impl From<Vec<u8>> for DataPayload {
    fn from(bytes: Vec<u8>) -> Self {
        DataPayload::Binary(Bytes::from(bytes))
    }
}

impl From<String> for DataPayload {
    fn from(text: String) -> Self {
        DataPayload::Text(text)
    }
}

impl From<&str> for DataPayload {
    fn from(text: &str) -> Self {
        DataPayload::Text(text.to_string())
    }
}

impl From<Value> for DataPayload {
    fn from(value: Value) -> Self {
        DataPayload::Json(value)
    }
}

pub(crate) struct DataState {
    pub path: Option<Arc<dyn DataPath>>,
    pub serialization: Serialization,
    pub reliable: bool,
    pub max_message_size: usize,
}

impl DataState {
    pub fn new(serialization: Serialization, reliable: bool, max_message_size: usize) -> Self {
        Self {
            path: None,
            serialization,
            reliable,
            max_message_size,
        }
    }

    pub fn decode(&self, bytes: Bytes) -> Result<Option<DataPayload>, PeerError> {
        tracing::trace!(
            target = "peer",
            len = bytes.len(),
            dump = %hexdump(&bytes[..bytes.len().min(64)]),
            "data received"
        );
        self.serialization.decode(bytes)
    }

    pub fn transmit(&self, payload: &DataPayload) -> Result<(), PeerError> {
        let encoded = self.serialization.encode(payload, self.max_message_size)?;
        self.send_bytes(encoded)
    }

    pub fn send_close_notice(&self) -> Result<(), PeerError> {
        self.send_bytes(Bytes::from_static(CLOSE_NOTICE.as_bytes()))
    }

    fn send_bytes(&self, encoded: Bytes) -> Result<(), PeerError> {
        let Some(path) = &self.path else {
            return Err(PeerError::new(
                PeerErrorKind::WebRtc,
                "Connection is not open. You should listen for the `open` event before sending messages.",
            ));
        };
        tracing::trace!(
            target = "peer",
            label = path.label(),
            len = encoded.len(),
            dump = %hexdump(&encoded[..encoded.len().min(64)]),
            "data sent"
        );
        path.send(encoded).map_err(PeerError::from)
    }
}

/// Application handle for a data connection.
#[derive(Debug)]
pub struct DataConnection {
    key: ConnectionKey,
    shared: Arc<ConnectionShared>,
    serialization: Serialization,
    reliable: bool,
    commands: mpsc::UnboundedSender<Command>,
    events: mpsc::UnboundedReceiver<ConnectionEvent>,
}

impl DataConnection {
    pub(crate) fn new(
        key: ConnectionKey,
        shared: Arc<ConnectionShared>,
        serialization: Serialization,
        reliable: bool,
        commands: mpsc::UnboundedSender<Command>,
        events: mpsc::UnboundedReceiver<ConnectionEvent>,
    ) -> Self {
        Self {
            key,
            shared,
            serialization,
            reliable,
            commands,
            events,
        }
    }

    pub fn key(&self) -> ConnectionKey {
        self.key
    }

    /// Current id; changes if the server remaps the connection.
    pub fn connection_id(&self) -> String {
        self.shared.id()
    }

    pub fn label(&self) -> &str {
        self.shared.label()
    }

    pub fn metadata(&self) -> Option<&Value> {
        self.shared.metadata()
    }

    pub fn serialization(&self) -> Serialization {
        self.serialization
    }

    pub fn reliable(&self) -> bool {
        self.reliable
    }

    pub fn is_open(&self) -> bool {
        self.shared.is_open()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Queue a payload for sending. Failures arrive as [`ConnectionEvent::Error`].
    pub fn send(&self, payload: impl Into<DataPayload>) {
        self.post(Command::Send {
            key: self.key,
            payload: payload.into(),
        });
    }

    pub fn close(&self) {
        self.post(Command::Close {
            key: self.key,
            flush: false,
        });
    }

    /// Tell the remote side to close before closing locally.
    pub fn close_flush(&self) {
        self.post(Command::Close {
            key: self.key,
            flush: true,
        });
    }

    pub async fn next_event(&mut self) -> Option<ConnectionEvent> {
        self.events.recv().await
    }

    pub fn try_next_event(&mut self) -> Option<ConnectionEvent> {
        self.events.try_recv().ok()
    }

    fn post(&self, command: Command) {
        if self.commands.send(command).is_err() {
            tracing::debug!(target = "peer", connection = %self.key, "peer task gone; command dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn json_rejects_oversized_messages() {
        let big = DataPayload::Text("x".repeat(64));
        let err = Serialization::Json.encode(&big, 32).unwrap_err();
        assert_eq!(err.message, "Message too big for JSON channel");
        assert!(Serialization::Json.encode(&big, 1024).is_ok());
        // raw ignores the ceiling
        assert!(Serialization::Raw.encode(&big, 32).is_ok());
    }

    #[test]
    fn json_refuses_binary_payloads() {
        let payload = DataPayload::Binary(Bytes::from_static(b"\x00\x01"));
        assert!(Serialization::Json.encode(&payload, 1024).is_err());
        assert_eq!(
            Serialization::Raw.encode(&payload, 1).unwrap(),
            Bytes::from_static(b"\x00\x01")
        );
    }

    #[test]
    fn close_notice_is_recognized_by_both_strategies() {
        let notice = Bytes::from_static(CLOSE_NOTICE.as_bytes());
        assert_eq!(Serialization::Json.decode(notice.clone()).unwrap(), None);
        assert_eq!(Serialization::Raw.decode(notice).unwrap(), None);
        assert_eq!(
            Serialization::Json
                .decode(Bytes::from_static(br#"{"hello":1}"#))
                .unwrap(),
            Some(DataPayload::Json(json!({"hello": 1})))
        );
    }

    #[test]
    fn invalid_json_is_an_error() {
        let err = Serialization::Json
            .decode(Bytes::from_static(b"not json"))
            .unwrap_err();
        assert!(err.message.starts_with("Invalid JSON message"));
    }

    #[test]
    fn sending_without_a_path_reports_not_open() {
        let state = DataState::new(Serialization::Json, true, 1024);
        let err = state.transmit(&DataPayload::from("hi")).unwrap_err();
        assert!(err.message.starts_with("Connection is not open"));
    }
}
