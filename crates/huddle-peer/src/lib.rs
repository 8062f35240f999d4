//! Huddle peer: signaling and connection negotiation for group calls.
//!
//! Responsibilities:
//! - holding the control socket to the signaling server
//! - driving the offer/answer/candidate exchange for every connection
//! - reconciling provisional connection ids with server-assigned ones
//! - buffering out-of-order signaling until the target connection exists

pub mod api;
pub mod config;
pub mod connection;
pub mod error;
pub mod negotiation;
pub mod peer;
pub mod protocol;
pub mod rtc;
pub mod signaling;
pub mod telemetry;

pub use config::PeerConfig;
pub use connection::{
    ConnectionEvent, ConnectionKey, DataConnection, DataPayload, MediaConnection, Serialization,
    StreamSource,
};
pub use error::{PeerError, PeerErrorKind};
pub use peer::{
    ConnectOptions, ConnectionSnapshot, Peer, PeerEvent, PeerEvents, PeerSnapshot, PeerState,
    PublishOptions,
};
pub use protocol::{MessageType, SignalingMessage};
