//! JSON envelopes exchanged with the signaling server.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Envelope `type`. Unknown strings survive a round trip through `Other`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum MessageType {
    Open,
    Offer,
    Answer,
    Candidate,
    Participant,
    Heartbeat,
    Leave,
    Expire,
    Error,
    Other(String),
}

impl MessageType {
    pub fn as_str(&self) -> &str {
        match self {
            MessageType::Open => "OPEN",
            MessageType::Offer => "OFFER",
            MessageType::Answer => "ANSWER",
            MessageType::Candidate => "CANDIDATE",
            MessageType::Participant => "PARTICIPANT",
            MessageType::Heartbeat => "HEARTBEAT",
            MessageType::Leave => "LEAVE",
            MessageType::Expire => "EXPIRE",
            MessageType::Error => "ERROR",
            MessageType::Other(other) => other,
        }
    }
}

impl From<String> for MessageType {
    fn from(raw: String) -> Self {
        match raw.as_str() {
            "OPEN" => MessageType::Open,
            "OFFER" => MessageType::Offer,
            "ANSWER" => MessageType::Answer,
            "CANDIDATE" => MessageType::Candidate,
            "PARTICIPANT" => MessageType::Participant,
            "HEARTBEAT" => MessageType::Heartbeat,
            "LEAVE" => MessageType::Leave,
            "EXPIRE" => MessageType::Expire,
            "ERROR" => MessageType::Error,
            _ => MessageType::Other(raw),
        }
    }
}

impl From<MessageType> for String {
    fn from(kind: MessageType) -> Self {
        match kind {
            MessageType::Other(other) => other,
            known => known.as_str().to_string(),
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionKind {
    Data,
    Media,
}

impl ConnectionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionKind::Data => "data",
            ConnectionKind::Media => "media",
        }
    }

    /// Prefix of locally generated provisional connection ids.
    pub fn id_prefix(self) -> &'static str {
        match self {
            ConnectionKind::Data => "dc_",
            ConnectionKind::Media => "mc_",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "data" => Some(ConnectionKind::Data),
            "media" => Some(ConnectionKind::Media),
            _ => None,
        }
    }
}

impl fmt::Display for ConnectionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
    Pranswer,
    Rollback,
}

impl SdpType {
    pub fn as_str(self) -> &'static str {
        match self {
            SdpType::Offer => "offer",
            SdpType::Answer => "answer",
            SdpType::Pranswer => "pranswer",
            SdpType::Rollback => "rollback",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,
    #[serde(
        rename = "usernameFragment",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
            username_fragment: None,
        }
    }
}

/// Message body. The registry reads `connectionId` and `type`; the rest is
/// interpreted by the entity that receives it, so `sdp` and `candidate` stay
/// raw until [`Payload::session_description`] / [`Payload::ice_candidate`].
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Payload {
    #[serde(rename = "connectionId", default, skip_serializing_if = "Option::is_none")]
    pub connection_id: Option<String>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub candidate: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Payload {
    pub fn is_empty(&self) -> bool {
        *self == Payload::default()
    }

    pub fn connection_kind(&self) -> Option<ConnectionKind> {
        self.kind.as_deref().and_then(ConnectionKind::parse)
    }

    pub fn session_description(&self) -> Result<Option<SessionDescription>, serde_json::Error> {
        self.sdp.clone().map(serde_json::from_value).transpose()
    }

    pub fn ice_candidate(&self) -> Result<Option<IceCandidate>, serde_json::Error> {
        self.candidate.clone().map(serde_json::from_value).transpose()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SignalingMessage {
    #[serde(rename = "type")]
    pub kind: MessageType,
    #[serde(default, skip_serializing_if = "Payload::is_empty")]
    pub payload: Payload,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub src: Option<String>,
}

impl SignalingMessage {
    pub fn new(kind: MessageType) -> Self {
        Self {
            kind,
            payload: Payload::default(),
            src: None,
        }
    }

    pub fn heartbeat() -> Self {
        Self::new(MessageType::Heartbeat)
    }

    pub fn for_connection(kind: MessageType, connection_id: impl Into<String>) -> Self {
        let mut message = Self::new(kind);
        message.payload.connection_id = Some(connection_id.into());
        message
    }

    pub fn with_sdp(mut self, sdp: SessionDescription) -> Self {
        self.payload.sdp = Some(serde_json::to_value(sdp).unwrap_or(Value::Null));
        self
    }

    pub fn with_candidate(mut self, candidate: IceCandidate) -> Self {
        self.payload.candidate = Some(serde_json::to_value(candidate).unwrap_or(Value::Null));
        self
    }

    pub fn connection_id(&self) -> Option<&str> {
        self.payload.connection_id.as_deref()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct User {
    pub username: String,
    pub email: String,
    pub full_name: String,
    pub image: String,
    pub first_name: String,
    pub last_name: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub id: String,
    #[serde(default)]
    pub user: User,
    #[serde(default)]
    pub co_host: bool,
    pub participant_id: String,
}

/// Encoder settings a publisher hands to the media server as `media_config`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bitrate: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audiocodec: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub videocodec: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub opus_fec: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub opus_dtx: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audiolevel_event: Option<bool>,
}

impl MediaConfig {
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}
