//! Per-connection offer/answer/candidate exchange.
//!
//! A [`NegotiationSession`] never awaits. Every call into the transport or the
//! signaling API is queued on [`Jobs`] and its result comes back as an
//! [`Outcome`], which the owner feeds into the matching `on_*` method. Each
//! of those is a single synchronous step.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use serde_json::Value;

use crate::api::{AnswerRequest, JoinRequest, PresentRequest, SignalingApi};
use crate::connection::ConnectionKey;
use crate::error::{ApiError, PeerError, PeerErrorKind, TransportError};
use crate::protocol::{IceCandidate, SessionDescription, SignalingMessage};
use crate::rtc::{DataPath, GatheringState, IceConnectionState, RtcSession};

/// Rewrites a local description's SDP before it is installed.
pub type SdpTransform = Arc<dyn Fn(String) -> String + Send + Sync>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Originator,
    Answerer,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NegotiationState {
    Idle,
    LocalDescribing,
    AwaitingRemote,
    RemoteApplied,
    GatheringCandidates,
    Established,
    Failed,
}

impl NegotiationState {
    pub fn as_str(self) -> &'static str {
        match self {
            NegotiationState::Idle => "idle",
            NegotiationState::LocalDescribing => "local-describing",
            NegotiationState::AwaitingRemote => "awaiting-remote",
            NegotiationState::RemoteApplied => "remote-applied",
            NegotiationState::GatheringCandidates => "gathering-candidates",
            NegotiationState::Established => "established",
            NegotiationState::Failed => "failed",
        }
    }
}

impl fmt::Display for NegotiationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the local description reaches the server.
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum Submit {
    Join {
        media_config: Option<Value>,
        pin: Option<String>,
    },
    Present {
        media_config: Option<Value>,
    },
    Answer,
}

pub(crate) enum Outcome {
    SessionCreated(Result<Arc<dyn RtcSession>, TransportError>),
    Prepared(Result<Option<Arc<dyn DataPath>>, TransportError>),
    LocalDescribed(Result<SessionDescription, TransportError>),
    RemoteApplied(Result<(), TransportError>),
    Submitted(Result<SignalingMessage, ApiError>),
    Trickled(Result<(), ApiError>),
    CandidateApplied(Result<(), TransportError>),
}

pub(crate) struct Completion {
    pub key: ConnectionKey,
    pub outcome: Outcome,
}

/// In-flight suspension points, polled by the peer task.
#[derive(Default)]
pub(crate) struct Jobs {
    pending: FuturesUnordered<BoxFuture<'static, Completion>>,
}

impl Jobs {
    pub fn spawn<F>(&mut self, key: ConnectionKey, step: F)
    where
        F: Future<Output = Outcome> + Send + 'static,
    {
        self.pending.push(Box::pin(async move {
            Completion {
                key,
                outcome: step.await,
            }
        }));
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub async fn next(&mut self) -> Option<Completion> {
        self.pending.next().await
    }
}

pub(crate) struct StepCtx<'a> {
    pub key: ConnectionKey,
    pub connection_id: &'a str,
    pub api: &'a Arc<dyn SignalingApi>,
    pub jobs: &'a mut Jobs,
}

/// What a step wants the owning entity to do.
#[derive(Debug)]
pub(crate) enum NegotiationEvent {
    /// The server replied to our offer; the reply carries the answer.
    Answered(SignalingMessage),
    Established,
    /// Entity-scoped failure that leaves the connection alone.
    Error(PeerError),
    /// Terminal; the entity must close.
    Failed(PeerError),
}

pub struct NegotiationSession {
    submit: Submit,
    state: NegotiationState,
    session: Option<Arc<dyn RtcSession>>,
    released: bool,
    remote_offer: Option<SessionDescription>,
    early_answer: Option<SessionDescription>,
    remote_requested: bool,
    remote_described: bool,
    submitted: bool,
    queued_remote: Vec<IceCandidate>,
    candidates: Vec<IceCandidate>,
    collecting: bool,
    gathering_complete: bool,
    trickled: bool,
    sdp_transform: Option<SdpTransform>,
}

impl fmt::Debug for NegotiationSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NegotiationSession")
            .field("role", &self.role())
            .field("state", &self.state)
            .field("candidates", &self.candidates.len())
            .field("gathering_complete", &self.gathering_complete)
            .field("trickled", &self.trickled)
            .finish()
    }
}

impl NegotiationSession {
    pub(crate) fn originator(submit: Submit, sdp_transform: Option<SdpTransform>) -> Self {
        Self::new(submit, None, sdp_transform)
    }

    pub(crate) fn answerer(offer: SessionDescription, sdp_transform: Option<SdpTransform>) -> Self {
        Self::new(Submit::Answer, Some(offer), sdp_transform)
    }

    fn new(
        submit: Submit,
        remote_offer: Option<SessionDescription>,
        sdp_transform: Option<SdpTransform>,
    ) -> Self {
        Self {
            submit,
            state: NegotiationState::Idle,
            session: None,
            released: false,
            remote_offer,
            early_answer: None,
            remote_requested: false,
            remote_described: false,
            submitted: false,
            queued_remote: Vec::new(),
            candidates: Vec::new(),
            collecting: true,
            gathering_complete: false,
            trickled: false,
            sdp_transform,
        }
    }

    pub fn role(&self) -> Role {
        match self.submit {
            Submit::Answer => Role::Answerer,
            _ => Role::Originator,
        }
    }

    pub fn state(&self) -> NegotiationState {
        self.state
    }

    pub fn has_session(&self) -> bool {
        self.session.is_some()
    }

    pub(crate) fn session(&self) -> Option<&Arc<dyn RtcSession>> {
        self.session.as_ref()
    }

    pub(crate) fn set_sdp_transform(&mut self, transform: Option<SdpTransform>) {
        if transform.is_some() {
            self.sdp_transform = transform;
        }
    }

    pub fn collected_candidates(&self) -> &[IceCandidate] {
        &self.candidates
    }

    fn is_terminal(&self) -> bool {
        self.released || self.state == NegotiationState::Failed
    }

    /// Hand over the transport session. Returns it back if this negotiation
    /// was already released, so the caller can close it.
    pub(crate) fn attach(
        &mut self,
        session: Arc<dyn RtcSession>,
    ) -> Result<(), Arc<dyn RtcSession>> {
        if self.released {
            return Err(session);
        }
        self.session = Some(session);
        Ok(())
    }

    pub(crate) fn start(&mut self, ctx: &mut StepCtx<'_>) -> Option<NegotiationEvent> {
        if self.is_terminal() || self.state != NegotiationState::Idle {
            return None;
        }
        let Some(session) = self.session.clone() else {
            return None;
        };
        match self.role() {
            Role::Originator => {
                self.describe_local(session, ctx);
                None
            }
            Role::Answerer => {
                let Some(offer) = self.remote_offer.take() else {
                    return self.fail(format!(
                        "Offer for {} carried no session description.",
                        ctx.connection_id
                    ));
                };
                tracing::debug!(target = "webrtc", connection = ctx.connection_id, "setting remote offer");
                self.remote_requested = true;
                ctx.jobs.spawn(ctx.key, async move {
                    Outcome::RemoteApplied(session.set_remote_description(offer).await)
                });
                None
            }
        }
    }

    fn describe_local(&mut self, session: Arc<dyn RtcSession>, ctx: &mut StepCtx<'_>) {
        self.state = NegotiationState::LocalDescribing;
        let offer = self.role() == Role::Originator;
        let transform = self.sdp_transform.clone();
        ctx.jobs.spawn(ctx.key, async move {
            let created = if offer {
                session.create_offer().await
            } else {
                session.create_answer().await
            };
            let mut desc = match created {
                Ok(desc) => desc,
                Err(err) => return Outcome::LocalDescribed(Err(err)),
            };
            if let Some(transform) = transform {
                desc.sdp = transform(desc.sdp);
            }
            let installed = session.set_local_description(desc.clone()).await;
            Outcome::LocalDescribed(installed.map(|_| desc))
        });
    }

    pub(crate) fn on_local_described(
        &mut self,
        result: Result<SessionDescription, TransportError>,
        ctx: &mut StepCtx<'_>,
    ) -> Option<NegotiationEvent> {
        if self.is_terminal() {
            return None;
        }
        let desc = match result {
            Ok(desc) => desc,
            Err(err) => return Some(NegotiationEvent::Failed(err.into())),
        };
        tracing::debug!(
            target = "webrtc",
            connection = ctx.connection_id,
            sdp_type = desc.sdp_type.as_str(),
            "local description installed"
        );
        self.state = NegotiationState::AwaitingRemote;

        let api = Arc::clone(ctx.api);
        match &self.submit {
            Submit::Join { media_config, pin } => {
                let request = JoinRequest::new(&desc, media_config.clone(), pin.clone());
                ctx.jobs
                    .spawn(ctx.key, async move { Outcome::Submitted(api.join(request).await) });
            }
            Submit::Present { media_config } => {
                let request = PresentRequest::new(&desc, media_config.clone());
                ctx.jobs
                    .spawn(ctx.key, async move { Outcome::Submitted(api.present(request).await) });
            }
            Submit::Answer => {
                let request = AnswerRequest::new(&desc, ctx.connection_id);
                ctx.jobs.spawn(ctx.key, async move {
                    Outcome::Submitted(api.send_answer(request).await)
                });
            }
        }

        if let Some(answer) = self.early_answer.take() {
            self.apply_remote(answer, ctx);
        }
        None
    }

    pub(crate) fn on_submitted(
        &mut self,
        result: Result<SignalingMessage, ApiError>,
        ctx: &mut StepCtx<'_>,
    ) -> Option<NegotiationEvent> {
        if self.is_terminal() {
            return None;
        }
        let response = match result {
            Ok(response) => response,
            Err(err) => {
                tracing::warn!(target = "webrtc", connection = ctx.connection_id, error = %err, "signaling server rejected description");
                return Some(NegotiationEvent::Error(err.into()));
            }
        };
        self.submitted = true;
        match self.role() {
            Role::Originator => Some(NegotiationEvent::Answered(response)),
            Role::Answerer => {
                tracing::debug!(target = "webrtc", connection = ctx.connection_id, "answer accepted by server");
                self.try_gather(ctx)
            }
        }
    }

    /// Continue once the server's reply has been applied under its final id.
    pub(crate) fn resume(&mut self, ctx: &mut StepCtx<'_>) -> Option<NegotiationEvent> {
        if self.is_terminal() {
            return None;
        }
        self.try_gather(ctx)
    }

    /// Install the remote answer. Early answers wait for the local offer.
    pub(crate) fn handle_remote_description(
        &mut self,
        desc: SessionDescription,
        ctx: &mut StepCtx<'_>,
    ) {
        if self.is_terminal() {
            return;
        }
        if self.remote_requested {
            tracing::debug!(target = "webrtc", connection = ctx.connection_id, "remote description already applied; ignoring");
            return;
        }
        match self.state {
            NegotiationState::Idle | NegotiationState::LocalDescribing => {
                self.early_answer = Some(desc);
            }
            _ => self.apply_remote(desc, ctx),
        }
    }

    fn apply_remote(&mut self, desc: SessionDescription, ctx: &mut StepCtx<'_>) {
        let Some(session) = self.session.clone() else {
            return;
        };
        tracing::debug!(target = "webrtc", connection = ctx.connection_id, sdp_type = desc.sdp_type.as_str(), "setting remote description");
        self.remote_requested = true;
        ctx.jobs.spawn(ctx.key, async move {
            Outcome::RemoteApplied(session.set_remote_description(desc).await)
        });
    }

    pub(crate) fn on_remote_applied(
        &mut self,
        result: Result<(), TransportError>,
        ctx: &mut StepCtx<'_>,
    ) -> Option<NegotiationEvent> {
        if self.is_terminal() {
            return None;
        }
        if let Err(err) = result {
            return Some(NegotiationEvent::Failed(err.into()));
        }
        self.remote_described = true;
        if self.state != NegotiationState::GatheringCandidates {
            self.state = NegotiationState::RemoteApplied;
        }
        for candidate in std::mem::take(&mut self.queued_remote) {
            self.apply_candidate(candidate, ctx);
        }
        match self.role() {
            Role::Answerer => {
                if let Some(session) = self.session.clone() {
                    self.describe_local(session, ctx);
                }
                None
            }
            Role::Originator => self.try_gather(ctx),
        }
    }

    fn try_gather(&mut self, ctx: &mut StepCtx<'_>) -> Option<NegotiationEvent> {
        if !(self.remote_described && self.submitted) {
            return None;
        }
        if matches!(
            self.state,
            NegotiationState::GatheringCandidates | NegotiationState::Established
        ) {
            return None;
        }
        self.state = NegotiationState::GatheringCandidates;
        self.maybe_trickle(ctx)
    }

    pub(crate) fn add_remote_candidate(&mut self, candidate: IceCandidate, ctx: &mut StepCtx<'_>) {
        if self.is_terminal() {
            return;
        }
        if !self.remote_described {
            self.queued_remote.push(candidate);
            return;
        }
        self.apply_candidate(candidate, ctx);
    }

    fn apply_candidate(&mut self, candidate: IceCandidate, ctx: &mut StepCtx<'_>) {
        let Some(session) = self.session.clone() else {
            return;
        };
        ctx.jobs.spawn(ctx.key, async move {
            Outcome::CandidateApplied(session.add_ice_candidate(candidate).await)
        });
    }

    pub(crate) fn on_candidate_applied(
        &mut self,
        result: Result<(), TransportError>,
    ) -> Option<NegotiationEvent> {
        match result {
            Err(err) if !self.is_terminal() => Some(NegotiationEvent::Error(err.into())),
            _ => None,
        }
    }

    pub(crate) fn on_local_candidate(&mut self, candidate: IceCandidate, connection_id: &str) {
        if !self.collecting || self.trickled {
            tracing::debug!(target = "webrtc", connection = connection_id, "late local candidate dropped");
            return;
        }
        tracing::trace!(target = "webrtc", connection = connection_id, candidate = %candidate.candidate, "collected local candidate");
        self.candidates.push(candidate);
    }

    pub(crate) fn on_gathering_state(
        &mut self,
        state: GatheringState,
        ctx: &mut StepCtx<'_>,
    ) -> Option<NegotiationEvent> {
        match state {
            GatheringState::Complete => {
                self.gathering_complete = true;
                self.maybe_trickle(ctx)
            }
            GatheringState::Gathering => {
                tracing::debug!(target = "webrtc", connection = ctx.connection_id, "gathering ice");
                None
            }
            GatheringState::New => None,
        }
    }

    // Candidates go out in one batch once gathering is over.
    fn maybe_trickle(&mut self, ctx: &mut StepCtx<'_>) -> Option<NegotiationEvent> {
        if self.is_terminal()
            || self.trickled
            || !self.gathering_complete
            || self.state != NegotiationState::GatheringCandidates
        {
            return None;
        }
        self.trickled = true;
        let candidates = std::mem::take(&mut self.candidates);
        tracing::debug!(
            target = "webrtc",
            connection = ctx.connection_id,
            count = candidates.len(),
            "trickling gathered candidates"
        );
        let api = Arc::clone(ctx.api);
        let connection_id = ctx.connection_id.to_string();
        ctx.jobs.spawn(ctx.key, async move {
            Outcome::Trickled(api.trickle_candidates(&connection_id, candidates).await)
        });
        self.state = NegotiationState::Established;
        Some(NegotiationEvent::Established)
    }

    pub(crate) fn on_trickled(&mut self, result: Result<(), ApiError>) -> Option<NegotiationEvent> {
        match result {
            Err(err) if !self.released => Some(NegotiationEvent::Error(err.into())),
            _ => None,
        }
    }

    pub(crate) fn on_ice_state(
        &mut self,
        state: IceConnectionState,
        connection_id: &str,
    ) -> Option<NegotiationEvent> {
        if self.is_terminal() {
            return None;
        }
        match state {
            IceConnectionState::Failed => {
                tracing::debug!(target = "webrtc", connection = connection_id, "ice connection failed, closing");
                self.fail(format!("Negotiation of connection to {connection_id} failed."))
            }
            IceConnectionState::Closed => {
                tracing::debug!(target = "webrtc", connection = connection_id, "ice connection closed, closing");
                self.fail(format!("Connection to {connection_id} closed."))
            }
            IceConnectionState::Disconnected => {
                tracing::debug!(target = "webrtc", connection = connection_id, "ice connection disconnected");
                None
            }
            IceConnectionState::Completed => {
                self.collecting = false;
                None
            }
            _ => None,
        }
    }

    fn fail(&mut self, message: String) -> Option<NegotiationEvent> {
        self.state = NegotiationState::Failed;
        Some(NegotiationEvent::Failed(PeerError::new(
            PeerErrorKind::WebRtc,
            message,
        )))
    }

    pub(crate) fn mark_failed(&mut self) {
        if !self.released {
            self.state = NegotiationState::Failed;
        }
    }

    /// Release the transport session. Safe to call repeatedly.
    pub fn cleanup(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        self.queued_remote.clear();
        self.early_answer = None;
        if let Some(session) = self.session.take() {
            tokio::spawn(async move {
                if let Err(err) = session.close().await {
                    tracing::debug!(target = "webrtc", error = %err, "transport session close failed");
                }
            });
        }
    }
}
