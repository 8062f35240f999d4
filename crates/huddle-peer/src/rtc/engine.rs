use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::{API, APIBuilder};
use webrtc::data_channel::RTCDataChannel;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_gatherer_state::RTCIceGathererState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use super::{
    Capabilities, DataPath, GatheringState, IceConnectionState, RemoteTrack, RtcEngine,
    RtcSession, SessionConfig, TransportEvent, TransportEvents,
};
use crate::error::TransportError;
use crate::protocol::{IceCandidate, SdpType, SessionDescription};

/// Transport engine backed by the `webrtc` crate.
pub struct WebRtcEngine {
    api: API,
}

impl WebRtcEngine {
    pub fn new() -> Result<Self, TransportError> {
        Self::with_settings(SettingEngine::default())
    }

    pub fn with_settings(setting: SettingEngine) -> Result<Self, TransportError> {
        Ok(Self {
            api: build_api(setting)?,
        })
    }
}

fn build_api(setting: SettingEngine) -> Result<API, TransportError> {
    let mut media_engine = MediaEngine::default();
    media_engine
        .register_default_codecs()
        .map_err(to_setup_error)?;

    let mut registry = Registry::new();
    registry =
        register_default_interceptors(registry, &mut media_engine).map_err(to_setup_error)?;

    Ok(APIBuilder::new()
        .with_setting_engine(setting)
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build())
}

#[async_trait]
impl RtcEngine for WebRtcEngine {
    fn capabilities(&self) -> Capabilities {
        Capabilities {
            data: true,
            media: true,
        }
    }

    async fn create_session(
        &self,
        config: &SessionConfig,
        events: TransportEvents,
    ) -> Result<Arc<dyn RtcSession>, TransportError> {
        let ice_servers = if config.ice_servers.is_empty() {
            Vec::new()
        } else {
            vec![RTCIceServer {
                urls: config.ice_servers.clone(),
                ..Default::default()
            }]
        };
        let rtc_config = RTCConfiguration {
            ice_servers,
            ..Default::default()
        };
        let pc = self
            .api
            .new_peer_connection(rtc_config)
            .await
            .map_err(to_setup_error)?;
        let pc = Arc::new(pc);
        tracing::debug!(target = "webrtc", key = %events.key(), "peer connection created");
        listen(&pc, &events);
        Ok(Arc::new(WebRtcSession { pc, events }))
    }
}

fn listen(pc: &Arc<RTCPeerConnection>, events: &TransportEvents) {
    let sink = events.clone();
    pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        let sink = sink.clone();
        Box::pin(async move {
            let Some(candidate) = candidate else {
                return;
            };
            match candidate.to_json() {
                Ok(init) if !init.candidate.is_empty() => {
                    sink.emit(TransportEvent::IceCandidate(IceCandidate {
                        candidate: init.candidate,
                        sdp_mid: init.sdp_mid,
                        sdp_mline_index: init.sdp_mline_index,
                        username_fragment: init.username_fragment,
                    }));
                }
                Ok(_) => {}
                Err(err) => {
                    tracing::warn!(target = "webrtc", error = %err, "failed to serialize local candidate");
                }
            }
        })
    }));

    let sink = events.clone();
    pc.on_ice_gathering_state_change(Box::new(move |state: RTCIceGathererState| {
        let sink = sink.clone();
        Box::pin(async move {
            let mapped = match state {
                RTCIceGathererState::New => Some(GatheringState::New),
                RTCIceGathererState::Gathering => Some(GatheringState::Gathering),
                RTCIceGathererState::Complete => Some(GatheringState::Complete),
                _ => None,
            };
            if let Some(state) = mapped {
                sink.emit(TransportEvent::GatheringState(state));
            }
        })
    }));

    let sink = events.clone();
    pc.on_ice_connection_state_change(Box::new(move |state: RTCIceConnectionState| {
        let sink = sink.clone();
        Box::pin(async move {
            let mapped = match state {
                RTCIceConnectionState::New => Some(IceConnectionState::New),
                RTCIceConnectionState::Checking => Some(IceConnectionState::Checking),
                RTCIceConnectionState::Connected => Some(IceConnectionState::Connected),
                RTCIceConnectionState::Completed => Some(IceConnectionState::Completed),
                RTCIceConnectionState::Disconnected => Some(IceConnectionState::Disconnected),
                RTCIceConnectionState::Failed => Some(IceConnectionState::Failed),
                RTCIceConnectionState::Closed => Some(IceConnectionState::Closed),
                _ => None,
            };
            if let Some(state) = mapped {
                sink.emit(TransportEvent::IceConnectionState(state));
            }
        })
    }));

    let sink = events.clone();
    pc.on_track(Box::new(
        move |track: Arc<TrackRemote>,
              _receiver: Arc<RTCRtpReceiver>,
              _transceiver: Arc<RTCRtpTransceiver>| {
            let sink = sink.clone();
            Box::pin(async move {
                tracing::debug!(
                    target = "webrtc",
                    track = %track.id(),
                    stream = %track.stream_id(),
                    "received remote track"
                );
                sink.emit(TransportEvent::Track(RemoteTrack {
                    id: track.id(),
                    stream_id: track.stream_id(),
                    kind: track.kind().into(),
                    handle: Some(track),
                }));
            })
        },
    ));

    let sink = events.clone();
    pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
        let sink = sink.clone();
        Box::pin(async move {
            tracing::debug!(target = "webrtc", label = %dc.label(), "remote opened data channel");
            let path = WebRtcDataPath::attach(dc, &sink);
            sink.emit(TransportEvent::DataChannel(path));
        })
    }));
}

fn silence(pc: &RTCPeerConnection) {
    pc.on_ice_candidate(Box::new(|_| Box::pin(async {})));
    pc.on_ice_gathering_state_change(Box::new(|_| Box::pin(async {})));
    pc.on_ice_connection_state_change(Box::new(|_| Box::pin(async {})));
    pc.on_track(Box::new(|_, _, _| Box::pin(async {})));
    pc.on_data_channel(Box::new(|_| Box::pin(async {})));
}

struct WebRtcSession {
    pc: Arc<RTCPeerConnection>,
    events: TransportEvents,
}

#[async_trait]
impl RtcSession for WebRtcSession {
    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|err| TransportError::Description(err.to_string()))?;
        Ok(description_from_rtc(&offer))
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|err| TransportError::Description(err.to_string()))?;
        Ok(description_from_rtc(&answer))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), TransportError> {
        let desc = rtc_from_description(&desc)?;
        self.pc
            .set_local_description(desc)
            .await
            .map_err(|err| TransportError::Description(err.to_string()))
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), TransportError> {
        let desc = rtc_from_description(&desc)?;
        self.pc
            .set_remote_description(desc)
            .await
            .map_err(|err| TransportError::Description(err.to_string()))
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        };
        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(|err| TransportError::Candidate(err.to_string()))
    }

    async fn add_track(&self, track: Arc<dyn TrackLocal + Send + Sync>) -> Result<(), TransportError> {
        self.pc.add_track(track).await.map_err(to_setup_error)?;
        Ok(())
    }

    async fn create_data_channel(
        &self,
        label: &str,
        reliable: bool,
    ) -> Result<Arc<dyn DataPath>, TransportError> {
        let init = if reliable {
            RTCDataChannelInit {
                ordered: Some(true),
                ..Default::default()
            }
        } else {
            RTCDataChannelInit {
                ordered: Some(false),
                max_retransmits: Some(0),
                ..Default::default()
            }
        };
        let dc = self
            .pc
            .create_data_channel(label, Some(init))
            .await
            .map_err(to_setup_error)?;
        Ok(WebRtcDataPath::attach(dc, &self.events))
    }

    async fn close(&self) -> Result<(), TransportError> {
        silence(&self.pc);
        self.pc.close().await.map_err(to_setup_error)
    }
}

struct WebRtcDataPath {
    label: String,
    dc: Arc<RTCDataChannel>,
    outbound_tx: mpsc::UnboundedSender<Bytes>,
}

impl WebRtcDataPath {
    fn attach(dc: Arc<RTCDataChannel>, events: &TransportEvents) -> Arc<dyn DataPath> {
        let sink = events.clone();
        dc.on_open(Box::new(move || {
            let sink = sink.clone();
            Box::pin(async move {
                tracing::debug!(target = "webrtc", key = %sink.key(), "data channel opened");
                sink.emit(TransportEvent::DataOpen);
            })
        }));

        let sink = events.clone();
        dc.on_message(Box::new(move |msg: DataChannelMessage| {
            let sink = sink.clone();
            Box::pin(async move {
                tracing::trace!(target = "webrtc", key = %sink.key(), frame_len = msg.data.len(), "received frame");
                sink.emit(TransportEvent::DataMessage(msg.data));
            })
        }));

        let sink = events.clone();
        dc.on_close(Box::new(move || {
            let sink = sink.clone();
            Box::pin(async move {
                tracing::debug!(target = "webrtc", key = %sink.key(), "data channel closed");
                sink.emit(TransportEvent::DataClosed);
            })
        }));

        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Bytes>();
        let dc_sender = Arc::clone(&dc);
        let key = events.key();
        tokio::spawn(async move {
            while let Some(data) = outbound_rx.recv().await {
                if let Err(err) = dc_sender.send(&data).await {
                    tracing::warn!(target = "webrtc", key = %key, error = %err, "data channel send failed");
                    break;
                }
            }
        });

        Arc::new(WebRtcDataPath {
            label: dc.label().to_string(),
            dc,
            outbound_tx,
        })
    }
}

impl DataPath for WebRtcDataPath {
    fn label(&self) -> &str {
        &self.label
    }

    fn send(&self, data: Bytes) -> Result<(), TransportError> {
        self.outbound_tx
            .send(data)
            .map_err(|_| TransportError::ChannelClosed)
    }

    fn close(&self) {
        self.dc.on_open(Box::new(|| Box::pin(async {})));
        self.dc.on_message(Box::new(|_| Box::pin(async {})));
        self.dc.on_close(Box::new(|| Box::pin(async {})));
        let dc = Arc::clone(&self.dc);
        tokio::spawn(async move {
            if let Err(err) = dc.close().await {
                tracing::debug!(target = "webrtc", label = dc.label(), error = %err, "data channel close failed");
            }
        });
    }
}

fn description_from_rtc(desc: &RTCSessionDescription) -> SessionDescription {
    let sdp_type = match desc.sdp_type {
        RTCSdpType::Offer => SdpType::Offer,
        RTCSdpType::Pranswer => SdpType::Pranswer,
        RTCSdpType::Rollback => SdpType::Rollback,
        _ => SdpType::Answer,
    };
    SessionDescription {
        sdp_type,
        sdp: desc.sdp.clone(),
    }
}

fn rtc_from_description(desc: &SessionDescription) -> Result<RTCSessionDescription, TransportError> {
    let sdp = desc.sdp.clone();
    let description = match desc.sdp_type {
        SdpType::Offer => RTCSessionDescription::offer(sdp),
        SdpType::Answer => RTCSessionDescription::answer(sdp),
        SdpType::Pranswer => RTCSessionDescription::pranswer(sdp),
        SdpType::Rollback => {
            return Err(TransportError::Description(format!(
                "unsupported sdp type {}",
                desc.sdp_type.as_str()
            )));
        }
    };
    description.map_err(|err| TransportError::Description(err.to_string()))
}

fn to_setup_error<E: std::fmt::Display>(err: E) -> TransportError {
    TransportError::Setup(err.to_string())
}
