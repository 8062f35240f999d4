//! Outbound HTTP half of signaling: offers, answers and candidate batches are
//! posted to the server, which relays them to the other side.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Serialize;
use serde_json::Value;
use url::Url;

use crate::config::PeerConfig;
use crate::error::ApiError;
use crate::protocol::{IceCandidate, SdpType, SessionDescription, SignalingMessage};

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct JoinRequest {
    pub sdp_sdp: String,
    pub sdp_type: SdpType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media_config: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pin: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct AnswerRequest {
    pub sdp_sdp: String,
    pub sdp_type: SdpType,
    pub connection_id: String,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PresentRequest {
    pub sdp_sdp: String,
    pub sdp_type: SdpType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media_config: Option<Value>,
}

impl JoinRequest {
    pub fn new(offer: &SessionDescription, media_config: Option<Value>, pin: Option<String>) -> Self {
        Self {
            sdp_sdp: offer.sdp.clone(),
            sdp_type: offer.sdp_type,
            media_config,
            pin,
        }
    }
}

impl AnswerRequest {
    pub fn new(answer: &SessionDescription, connection_id: impl Into<String>) -> Self {
        Self {
            sdp_sdp: answer.sdp.clone(),
            sdp_type: answer.sdp_type,
            connection_id: connection_id.into(),
        }
    }
}

impl PresentRequest {
    pub fn new(offer: &SessionDescription, media_config: Option<Value>) -> Self {
        Self {
            sdp_sdp: offer.sdp.clone(),
            sdp_type: offer.sdp_type,
            media_config,
        }
    }
}

#[async_trait]
pub trait SignalingApi: Send + Sync {
    /// Submit a local offer to the group; the reply carries the remote answer
    /// and the server-assigned connection id.
    async fn join(&self, request: JoinRequest) -> Result<SignalingMessage, ApiError>;
    async fn send_answer(&self, request: AnswerRequest) -> Result<SignalingMessage, ApiError>;
    async fn trickle_candidates(
        &self,
        connection_id: &str,
        candidates: Vec<IceCandidate>,
    ) -> Result<(), ApiError>;
    /// Like `join`, for a screen share.
    async fn present(&self, request: PresentRequest) -> Result<SignalingMessage, ApiError>;
}

pub struct HttpSignalingApi {
    client: Client,
    base: Url,
    group_id: Option<String>,
}

impl HttpSignalingApi {
    pub fn new(config: &PeerConfig) -> Result<Self, ApiError> {
        let base = config
            .api_base_url()
            .map_err(|err| ApiError::Url(err.to_string()))?;
        Ok(Self::with_client(Client::new(), base, config.group_id.clone()))
    }

    pub fn with_client(client: Client, base: Url, group_id: Option<String>) -> Self {
        Self {
            client,
            base,
            group_id,
        }
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, ApiError> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| ApiError::Url(self.base.to_string()))?
            .pop_if_empty()
            .extend(segments)
            // trailing slash
            .push("");
        Ok(url)
    }

    async fn post<B: Serialize + ?Sized>(&self, url: Url, body: &B) -> Result<reqwest::Response, String> {
        tracing::trace!(
            target = "signaling",
            phase = "post",
            url = %url,
            state = "start"
        );
        let attempt = self.client.post(url.clone()).json(body).send().await;
        tracing::trace!(
            target = "signaling",
            phase = "post",
            url = %url,
            state = "end",
            result = ?attempt.as_ref().map(reqwest::Response::status)
        );
        let response = attempt.map_err(|err| err.to_string())?;
        match response.status() {
            StatusCode::OK => Ok(response),
            status => Err(format!("unexpected signaling status {status}")),
        }
    }

    async fn post_for_message<B: Serialize + ?Sized>(
        &self,
        url: Url,
        body: &B,
    ) -> Result<SignalingMessage, String> {
        let response = self.post(url, body).await?;
        response
            .json::<SignalingMessage>()
            .await
            .map_err(|err| format!("invalid signaling response: {err}"))
    }
}

#[async_trait]
impl SignalingApi for HttpSignalingApi {
    async fn join(&self, request: JoinRequest) -> Result<SignalingMessage, ApiError> {
        let group = self.group_id.clone().unwrap_or_default();
        let join_error = |reason: String| ApiError::Join {
            group: group.clone(),
            reason,
        };
        if group.is_empty() {
            return Err(join_error("no group configured".into()));
        }
        let url = self.endpoint(&["groups", &group, "join"])?;
        self.post_for_message(url, &request).await.map_err(join_error)
    }

    async fn send_answer(&self, request: AnswerRequest) -> Result<SignalingMessage, ApiError> {
        let url = self.endpoint(&["participants", "answer"])?;
        self.post_for_message(url, &request)
            .await
            .map_err(ApiError::Answer)
    }

    async fn trickle_candidates(
        &self,
        connection_id: &str,
        candidates: Vec<IceCandidate>,
    ) -> Result<(), ApiError> {
        let url = self.endpoint(&["participants", connection_id, "trickle"])?;
        self.post(url, &candidates)
            .await
            .map(|_| ())
            .map_err(|reason| ApiError::Trickle {
                connection_id: connection_id.to_string(),
                reason,
            })
    }

    async fn present(&self, request: PresentRequest) -> Result<SignalingMessage, ApiError> {
        let url = self.endpoint(&["participants", "present"])?;
        self.post_for_message(url, &request)
            .await
            .map_err(ApiError::Present)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn api() -> HttpSignalingApi {
        let config = PeerConfig::new("weekly sync").with_host("signal.test", 8443);
        HttpSignalingApi::new(&config).unwrap()
    }

    #[test]
    fn endpoints_end_with_slash_and_escape_segments() {
        let api = api();
        assert_eq!(
            api.endpoint(&["groups", "weekly sync", "join"]).unwrap().as_str(),
            "https://signal.test:8443/groups/weekly%20sync/join/"
        );
        assert_eq!(
            api.endpoint(&["participants", "c1", "trickle"]).unwrap().as_str(),
            "https://signal.test:8443/participants/c1/trickle/"
        );
    }

    #[test]
    fn join_request_omits_absent_pin() {
        let request = JoinRequest::new(&SessionDescription::offer("v=0"), Some(json!({"bitrate": "1"})), None);
        assert_eq!(
            serde_json::to_value(&request).unwrap(),
            json!({"sdp_sdp": "v=0", "sdp_type": "offer", "media_config": {"bitrate": "1"}})
        );
    }

    #[test]
    fn answer_request_names_connection() {
        let request = AnswerRequest::new(&SessionDescription::answer("v=0"), "c-9");
        assert_eq!(
            serde_json::to_value(&request).unwrap(),
            json!({"sdp_sdp": "v=0", "sdp_type": "answer", "connection_id": "c-9"})
        );
    }

    #[test_timeout::tokio_timeout_test]
    async fn join_without_group_is_rejected_locally() {
        let api = HttpSignalingApi::with_client(
            Client::new(),
            Url::parse("http://127.0.0.1:9").unwrap(),
            None,
        );
        let err = api
            .join(JoinRequest::new(&SessionDescription::offer("v=0"), None, None))
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Join { reason, .. } if reason == "no group configured"));
    }
}
