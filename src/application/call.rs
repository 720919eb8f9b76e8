//! Call state machine: outgoing and incoming INVITE handling, in-call
//! controls and teardown

use super::engine::{cancel, EngineState, Internal, SdpPurpose};
use super::events::EngineEvent;
use super::registration::ChallengeOutcome;
use crate::domain::{CallDirection, CallInfo, CallState, EndReason, RegistrationState};
use crate::infrastructure::protocols::sip::message::{extract_display_name, extract_uri, extract_user};
use crate::infrastructure::protocols::sip::dialog::generate_tag;
use crate::infrastructure::protocols::sip::{builder, DialogContext, ParsedMessage};
use crate::infrastructure::protocols::webrtc::session_manager::DEFAULT_STUN_SERVERS;
use crate::infrastructure::protocols::webrtc::{
    fallback_sdp, media_direction, mutate_for_hold, MediaConfig, MediaConnectionState, MediaError,
    MediaEvent, MediaFactory, MediaSession, SdpKind,
};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

const DTMF_DIGITS: &str = "0123456789*#ABCD";

/// Local SDP ready to send
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedSdp {
    pub sdp: String,
    /// True when media was unavailable and the static SDP is used
    pub fallback: bool,
}

/// Build the local offer (or the answer to `remote_offer`).
///
/// Creation is bounded by `sdp_timeout`, ICE gathering by `ice_timeout`.
/// Any failure yields the static fallback SDP so signaling can proceed.
pub async fn prepare_local_sdp(
    media: Option<&dyn MediaSession>,
    remote_offer: Option<&str>,
    sdp_timeout: Duration,
    ice_timeout: Duration,
    codecs: &[String],
) -> PreparedSdp {
    let Some(media) = media else {
        return fallback(codecs);
    };

    let created = match tokio::time::timeout(sdp_timeout, create_description(media, remote_offer)).await
    {
        Ok(Ok(sdp)) => sdp,
        Ok(Err(e)) => {
            warn!("Failed to create local SDP: {}", e);
            return fallback(codecs);
        }
        Err(_) => {
            warn!("Local SDP not created within {:?}", sdp_timeout);
            return fallback(codecs);
        }
    };

    let sdp = media
        .wait_ice_gathering(ice_timeout)
        .await
        .filter(|sdp| !sdp.trim().is_empty())
        .unwrap_or(created);
    PreparedSdp {
        sdp,
        fallback: false,
    }
}

async fn create_description(
    media: &dyn MediaSession,
    remote_offer: Option<&str>,
) -> Result<String, MediaError> {
    match remote_offer {
        Some(offer) => {
            media.set_remote(offer, SdpKind::Offer).await?;
            media.create_answer().await
        }
        None => media.create_offer().await,
    }
}

fn fallback(codecs: &[String]) -> PreparedSdp {
    let session_id = Utc::now().timestamp_millis().unsigned_abs();
    PreparedSdp {
        sdp: fallback_sdp(codecs, session_id),
        fallback: true,
    }
}

pub(crate) enum MediaOp {
    Prepare {
        purpose: SdpPurpose,
        remote_offer: Option<String>,
    },
    ApplyRemote {
        sdp: String,
        kind: SdpKind,
    },
    SetTrackEnabled(bool),
    Dispose,
}

/// Handle to the per-call media worker. Operations run in order; dropping
/// the handle disposes the session.
pub(crate) struct MediaHandle {
    ops: mpsc::UnboundedSender<MediaOp>,
}

impl MediaHandle {
    fn send(&self, op: MediaOp) {
        if self.ops.send(op).is_err() {
            debug!("Media worker already stopped");
        }
    }
}

struct MediaWorker {
    factory: Arc<dyn MediaFactory>,
    config: MediaConfig,
    session: Option<Arc<dyn MediaSession>>,
    setup_failed: bool,
    sdp_timeout: Duration,
    ice_timeout: Duration,
    codecs: Vec<String>,
    internal: mpsc::UnboundedSender<Internal>,
}

impl MediaWorker {
    async fn run(mut self, mut ops: mpsc::UnboundedReceiver<MediaOp>) {
        while let Some(op) = ops.recv().await {
            match op {
                MediaOp::Prepare {
                    purpose,
                    remote_offer,
                } => {
                    let session = self.session().await;
                    let prepared = prepare_local_sdp(
                        session.as_deref(),
                        remote_offer.as_deref(),
                        self.sdp_timeout,
                        self.ice_timeout,
                        &self.codecs,
                    )
                    .await;
                    let _ = self.internal.send(Internal::LocalSdpReady {
                        call_generation: self.config.call_generation,
                        purpose,
                        sdp: prepared.sdp,
                        fallback: prepared.fallback,
                    });
                }
                MediaOp::ApplyRemote { sdp, kind } => {
                    if let Some(session) = self.session.as_ref() {
                        if let Err(e) = session.set_remote(&sdp, kind).await {
                            warn!("Failed to apply remote SDP: {}", e);
                        }
                    }
                }
                MediaOp::SetTrackEnabled(enabled) => {
                    if let Some(session) = self.session.as_ref() {
                        if let Err(e) = session.set_track_enabled(enabled).await {
                            warn!("Failed to switch local track: {}", e);
                        }
                    }
                }
                MediaOp::Dispose => break,
            }
        }
        if let Some(session) = self.session.take() {
            session.dispose().await;
        }
        debug!(
            "Media worker for call {} stopped",
            self.config.call_generation
        );
    }

    /// Created lazily on first use; a failed setup is not retried
    async fn session(&mut self) -> Option<Arc<dyn MediaSession>> {
        if self.session.is_none() && !self.setup_failed {
            match tokio::time::timeout(self.sdp_timeout, self.factory.setup(&self.config)).await {
                Ok(Ok(session)) => self.session = Some(session),
                Ok(Err(e)) => {
                    error!("Media setup failed: {}", e);
                    self.setup_failed = true;
                }
                Err(_) => {
                    error!("Media setup timed out");
                    self.setup_failed = true;
                }
            }
        }
        self.session.clone()
    }
}

/// The single call the engine tracks
pub(crate) struct ActiveCall {
    pub generation: u64,
    pub dialog: DialogContext,
    pub media: Option<MediaHandle>,
    pub local_sdp: Option<String>,
    pub remote_sdp: Option<String>,
    /// Body of the last INVITE we sent, reused for authenticated resends
    pub last_offer: Option<String>,
    pub invite_sent: bool,
    /// Peer's initial INVITE, answered by `answer_call` or hangup
    pub pending_invite: Option<ParsedMessage>,
    /// Peer's re-INVITE waiting for our answer SDP
    pub pending_reinvite: Option<ParsedMessage>,
    /// CSeq of the last INVITE whose 2xx we ACKed
    pub acked_cseq: Option<u32>,
    pub answered_nonce: Option<String>,
    pub answering: bool,
    pub connected_at: Option<Instant>,
    pub remote_hold: bool,
    /// CSeq and target of an outstanding REFER
    pub pending_refer: Option<(u32, String)>,
}

impl ActiveCall {
    fn new(generation: u64, dialog: DialogContext) -> Self {
        Self {
            generation,
            dialog,
            media: None,
            local_sdp: None,
            remote_sdp: None,
            last_offer: None,
            invite_sent: false,
            pending_invite: None,
            pending_reinvite: None,
            acked_cseq: None,
            answered_nonce: None,
            answering: false,
            connected_at: None,
            remote_hold: false,
            pending_refer: None,
        }
    }

    fn media(&self, op: MediaOp) {
        if let Some(media) = self.media.as_ref() {
            media.send(op);
        }
    }

    pub fn dispose_media(&mut self) {
        if let Some(media) = self.media.take() {
            media.send(MediaOp::Dispose);
        }
    }
}

fn end_reason_for(code: u16) -> EndReason {
    match code {
        300..=399 => EndReason::Redirected(code),
        486 | 600 => EndReason::Busy,
        487 => EndReason::Canceled,
        _ => EndReason::Rejected(code),
    }
}

impl EngineState {
    fn media_handle(&self, call_generation: u64) -> MediaHandle {
        let stun_servers = self
            .config
            .as_ref()
            .and_then(|c| c.stun_server.clone())
            .filter(|s| !s.trim().is_empty())
            .map(|s| vec![s])
            .unwrap_or_else(|| DEFAULT_STUN_SERVERS.iter().map(|s| s.to_string()).collect());
        let codecs = self
            .config
            .as_ref()
            .map(|c| c.codec_preferences())
            .unwrap_or_default();

        let (tx, rx) = mpsc::unbounded_channel();
        let worker = MediaWorker {
            factory: Arc::clone(&self.media_factory),
            config: MediaConfig {
                stun_servers,
                call_generation,
                events: self.media_tx.clone(),
            },
            session: None,
            setup_failed: false,
            sdp_timeout: self.timings.sdp_timeout(),
            ice_timeout: self.timings.ice_gathering_timeout(),
            codecs,
            internal: self.internal_tx.clone(),
        };
        self.spawn_detached(worker.run(rx));
        MediaHandle { ops: tx }
    }

    fn begin_call(&mut self, call: ActiveCall, info: CallInfo) {
        cancel(&mut self.idle_timer);
        self.canceled_dialog = self
            .canceled_dialog
            .take()
            .filter(|d| d.call_id != call.dialog.call_id);
        self.call = Some(call);
        self.call_info = Some(info);
    }

    pub(crate) fn make_call(&mut self, number: String) {
        let number = number.trim().to_string();
        if !self.call_state.is_resting() {
            debug!("make_call ignored in state {}", self.call_state);
            return;
        }
        if self.registration_state != RegistrationState::Registered {
            warn!("make_call ignored: not registered ({})", self.registration_state);
            return;
        }
        if number.is_empty() {
            warn!("make_call ignored: empty number");
            return;
        }
        let Some(local) = self.local.as_ref() else {
            return;
        };

        let dialog = DialogContext::outgoing(
            local.caller_identity(),
            format!("<{}>", local.target_uri(&number)),
            &local.via_host,
        );
        self.call_generation += 1;
        let generation = self.call_generation;
        info!("Calling {} (Call-ID {})", number, dialog.call_id);

        let mut call = ActiveCall::new(generation, dialog);
        let media = self.media_handle(generation);
        media.send(MediaOp::Prepare {
            purpose: SdpPurpose::InitialOffer,
            remote_offer: None,
        });
        call.media = Some(media);

        let info = CallInfo::outgoing(uuid::Uuid::new_v4().to_string(), number.clone());
        let call_id = info.id.clone();
        self.begin_call(call, info);

        self.audio.in_call_audio = true;
        self.publish_audio();
        self.set_call_state(CallState::Calling);
        self.emit(EngineEvent::CallStarted {
            call_id,
            number,
            direction: CallDirection::Outgoing,
        });
    }

    pub(crate) fn on_local_sdp_ready(
        &mut self,
        call_generation: u64,
        purpose: SdpPurpose,
        sdp: String,
        fallback: bool,
    ) {
        if call_generation != self.call_generation || self.call.is_none() {
            debug!("Discarding local SDP of a finished call");
            return;
        }
        if fallback {
            self.warn_event("Media unavailable, using static SDP".to_string());
        }
        match purpose {
            SdpPurpose::InitialOffer => self.send_initial_invite(sdp),
            SdpPurpose::InitialAnswer => self.send_answer(sdp),
            SdpPurpose::ReinviteAnswer => self.send_reinvite_answer(sdp),
        }
    }

    fn send_initial_invite(&mut self, sdp: String) {
        if self.call_state != CallState::Calling {
            return;
        }
        let cseq = self.call_cseq.next();
        let (Some(local), Some(call)) = (self.local.as_ref(), self.call.as_mut()) else {
            return;
        };
        if call.invite_sent {
            return;
        }
        call.dialog.start_invite(cseq);
        call.local_sdp = Some(sdp.clone());
        call.last_offer = Some(sdp.clone());
        call.invite_sent = true;
        let invite = builder::invite(local, &call.dialog, &sdp, None);
        if !self.send_message(&invite) {
            self.cleanup(EndReason::TransportFailure);
        }
    }

    fn send_answer(&mut self, sdp: String) {
        if self.call_state != CallState::Incoming {
            return;
        }
        let Some(local) = self.local.as_ref() else {
            return;
        };
        let contact = local.contact();
        let Some(call) = self.call.as_mut() else {
            return;
        };
        let Some(invite) = call.pending_invite.take() else {
            return;
        };
        call.local_sdp = Some(sdp.clone());
        call.connected_at = Some(Instant::now());
        let local_tag = call.dialog.local_tag.clone();

        let ok = builder::response(&invite, 200, Some(&local_tag), &self.timings.user_agent)
            .header("Contact", contact)
            .header("Allow", builder::ALLOW)
            .body("application/sdp", sdp);
        if !self.send_message(&ok) {
            self.cleanup(EndReason::TransportFailure);
            return;
        }
        self.set_call_state(CallState::Connected);
        self.start_duration_timer();
    }

    fn send_reinvite_answer(&mut self, sdp: String) {
        let Some(local) = self.local.as_ref() else {
            return;
        };
        let contact = local.contact();
        let Some(call) = self.call.as_mut() else {
            return;
        };
        let Some(reinvite) = call.pending_reinvite.take() else {
            return;
        };
        call.local_sdp = Some(sdp.clone());
        let local_tag = call.dialog.local_tag.clone();
        let ok = builder::response(&reinvite, 200, Some(&local_tag), &self.timings.user_agent)
            .header("Contact", contact)
            .body("application/sdp", sdp);
        self.send_message(&ok);
    }

    pub(crate) fn on_invite_response(&mut self, response: &ParsedMessage, cseq: u32) {
        let call_id = response.call_id().unwrap_or_default();
        if self
            .canceled_dialog
            .as_ref()
            .is_some_and(|d| d.call_id == call_id)
        {
            self.on_canceled_invite_response(response);
            return;
        }
        let Some(call) = self.call.as_ref() else {
            debug!("INVITE response without a call");
            return;
        };
        if call.dialog.call_id != call_id {
            debug!("INVITE response for unknown Call-ID {}", call_id);
            return;
        }

        let code = response.status_code;
        if (200..300).contains(&code) {
            if call.acked_cseq == Some(cseq) {
                debug!("2xx retransmission, re-sending ACK");
                self.send_ack(cseq);
                return;
            }
            if cseq != call.dialog.invite_cseq {
                debug!("2xx for superseded INVITE (CSeq {}), ACK only", cseq);
                self.send_ack(cseq);
                return;
            }
        }
        if cseq != call.dialog.invite_cseq {
            debug!("Response for an old INVITE transaction (CSeq {})", cseq);
            return;
        }

        let initial = matches!(self.call_state, CallState::Calling | CallState::Ringing);
        match code {
            100..=199 => {
                if initial {
                    self.on_provisional(response);
                }
            }
            200..=299 => self.on_invite_success(response, cseq, initial),
            401 | 407 => self.on_invite_challenge(response, initial),
            _ => {
                self.ack_failure(response, initial);
                if initial {
                    info!("Call failed: {} {}", code, response.reason);
                    self.cleanup(end_reason_for(code));
                } else {
                    error!("re-INVITE failed: {} {}", code, response.reason);
                    self.send_bye();
                    self.cleanup(EndReason::ReinviteFailed(code));
                }
            }
        }
    }

    fn on_provisional(&mut self, response: &ParsedMessage) {
        if !matches!(response.status_code, 180 | 183) {
            return;
        }
        if let Some(call) = self.call.as_mut() {
            if response.has_body() {
                call.remote_sdp = Some(response.body.clone());
                call.media(MediaOp::ApplyRemote {
                    sdp: response.body.clone(),
                    kind: SdpKind::ProvisionalAnswer,
                });
            }
        }
        self.set_call_state(CallState::Ringing);
    }

    fn on_invite_success(&mut self, response: &ParsedMessage, cseq: u32, initial: bool) {
        let Some(call) = self.call.as_mut() else {
            return;
        };
        call.dialog.update_from_peer(response);
        call.acked_cseq = Some(cseq);
        call.answered_nonce = None;
        if response.has_body() {
            call.remote_sdp = Some(response.body.clone());
            call.media(MediaOp::ApplyRemote {
                sdp: response.body.clone(),
                kind: SdpKind::Answer,
            });
        }
        self.send_ack(cseq);

        if initial {
            if let Some(call) = self.call.as_mut() {
                call.connected_at = Some(Instant::now());
            }
            self.set_call_state(CallState::Connected);
            self.start_duration_timer();
        }
    }

    fn on_invite_challenge(&mut self, response: &ParsedMessage, initial: bool) {
        self.ack_failure(response, initial);
        let Some(call) = self.call.as_ref() else {
            return;
        };
        let uri = call.dialog.request_uri();
        let answered = call.answered_nonce.clone();
        match self.answer_challenge(response, "INVITE", &uri, answered.as_deref()) {
            ChallengeOutcome::Answer(auth, nonce) => {
                let cseq = self.call_cseq.next();
                let (Some(local), Some(call)) = (self.local.as_ref(), self.call.as_mut()) else {
                    return;
                };
                call.answered_nonce = Some(nonce);
                call.dialog.start_invite(cseq);
                let sdp = call.last_offer.clone().unwrap_or_default();
                info!("INVITE challenged, resending with credentials (CSeq {})", cseq);
                let invite = builder::invite(local, &call.dialog, &sdp, Some(&auth));
                if !self.send_message(&invite) && initial {
                    self.cleanup(EndReason::TransportFailure);
                }
            }
            ChallengeOutcome::Rejected(reason) => {
                error!("INVITE authentication failed: {}", reason);
                if !initial {
                    self.send_bye();
                }
                self.cleanup(EndReason::AuthenticationFailed);
            }
        }
    }

    /// ACK a non-2xx final response on the INVITE's branch
    fn ack_failure(&mut self, response: &ParsedMessage, initial: bool) {
        let (Some(local), Some(call)) = (self.local.as_ref(), self.call.as_ref()) else {
            return;
        };
        let mut dialog = call.dialog.clone();
        if initial {
            // The To-tag of a rejected initial INVITE does not create a dialog
            dialog.remote_tag = response.to_tag();
        }
        let ack = builder::ack_non_2xx(local, &dialog);
        self.send_message(&ack);
    }

    fn send_ack(&mut self, cseq: u32) {
        let (Some(local), Some(call)) = (self.local.as_ref(), self.call.as_ref()) else {
            return;
        };
        let ack = builder::ack_for_cseq(local, &call.dialog, cseq);
        self.send_message(&ack);
    }

    fn send_bye(&mut self) {
        let cseq = self.call_cseq.next();
        let (Some(local), Some(call)) = (self.local.as_ref(), self.call.as_ref()) else {
            return;
        };
        let bye = builder::bye(local, &call.dialog, cseq);
        self.send_message(&bye);
    }

    /// Final response to an INVITE we already gave up on
    fn on_canceled_invite_response(&mut self, response: &ParsedMessage) {
        let code = response.status_code;
        if code < 200 {
            return;
        }
        let Some(mut dialog) = self.canceled_dialog.take() else {
            return;
        };
        let Some(local) = self.local.as_ref() else {
            return;
        };
        if code < 300 {
            // 2xx raced our CANCEL: confirm and end the dialog
            dialog.update_from_peer(response);
            let ack = builder::ack(local, &dialog);
            let bye = builder::bye(local, &dialog, self.call_cseq.next());
            self.send_message(&ack);
            self.send_message(&bye);
        } else {
            dialog.remote_tag = response.to_tag();
            let ack = builder::ack_non_2xx(local, &dialog);
            self.send_message(&ack);
        }
    }

    pub(crate) fn on_refer_response(&mut self, response: &ParsedMessage, cseq: u32) {
        let code = response.status_code;
        if code < 200 {
            return;
        }
        let Some(call) = self.call.as_mut() else {
            return;
        };
        let Some((refer_cseq, target)) = call.pending_refer.take() else {
            return;
        };
        if refer_cseq != cseq {
            call.pending_refer = Some((refer_cseq, target));
            return;
        }
        let call_id = self
            .call_info
            .as_ref()
            .map(|i| i.id.clone())
            .unwrap_or_default();
        if code < 300 {
            info!("Transfer to {} accepted", target);
            self.emit(EngineEvent::TransferAccepted { call_id, target });
        } else {
            self.warn_event(format!("Transfer to {} failed: {}", target, code));
            self.emit(EngineEvent::TransferFailed {
                call_id,
                target,
                status: code,
            });
        }
    }

    pub(crate) fn on_incoming_invite(&mut self, request: &ParsedMessage) {
        let Some(call_id) = request.call_id().map(str::to_string) else {
            self.respond(request, 400, None);
            return;
        };

        if let Some(call) = self.call.as_ref() {
            if call.dialog.call_id == call_id {
                let local_tag = call.dialog.local_tag.clone();
                match request.to_tag() {
                    None if self.call_state == CallState::Incoming => {
                        debug!("INVITE retransmission, re-sending 180");
                        self.respond(request, 180, Some(&local_tag));
                    }
                    Some(tag) if tag == local_tag && self.call_state.is_established() => {
                        self.on_incoming_reinvite(request);
                    }
                    _ => debug!("Ignoring INVITE retransmission for {}", call_id),
                }
                return;
            }
        }

        if !self.call_state.is_resting() || self.call.is_some() {
            info!("Busy: rejecting INVITE {}", call_id);
            let tag = generate_tag();
            self.respond(request, 486, Some(&tag));
            return;
        }

        let Some(dialog) = DialogContext::incoming(request) else {
            self.respond(request, 400, None);
            return;
        };
        let from = request.header("from").unwrap_or_default();
        let number = extract_user(&extract_uri(from));
        let name = extract_display_name(from);

        self.call_generation += 1;
        let mut call = ActiveCall::new(self.call_generation, dialog);
        if request.has_body() {
            call.remote_sdp = Some(request.body.clone());
        }
        call.pending_invite = Some(request.clone());
        let local_tag = call.dialog.local_tag.clone();

        let info = CallInfo::incoming(uuid::Uuid::new_v4().to_string(), number.clone(), name.clone());
        let id = info.id.clone();
        info!("Incoming call from {} ({})", number, call_id);
        self.begin_call(call, info);

        self.respond(request, 180, Some(&local_tag));
        self.set_call_state(CallState::Incoming);
        self.emit(EngineEvent::IncomingCall {
            call_id: id,
            number,
            name,
        });
    }

    fn on_incoming_reinvite(&mut self, request: &ParsedMessage) {
        let Some(call) = self.call.as_mut() else {
            return;
        };
        if call.pending_reinvite.is_some() {
            debug!("re-INVITE already being answered");
            return;
        }
        call.dialog.update_from_peer(request);

        let mut hold_change = None;
        if request.has_body() {
            call.remote_sdp = Some(request.body.clone());
            let on_hold = media_direction(&request.body).is_remote_hold();
            if on_hold != call.remote_hold {
                call.remote_hold = on_hold;
                hold_change = Some(on_hold);
            }
        }

        if request.has_body() && call.media.is_some() {
            call.pending_reinvite = Some(request.clone());
            call.media(MediaOp::Prepare {
                purpose: SdpPurpose::ReinviteAnswer,
                remote_offer: Some(request.body.clone()),
            });
        } else {
            call.pending_reinvite = Some(request.clone());
            let sdp = match call.local_sdp.clone() {
                Some(sdp) => sdp,
                None => {
                    let codecs = self
                        .config
                        .as_ref()
                        .map(|c| c.codec_preferences())
                        .unwrap_or_default();
                    fallback(&codecs).sdp
                }
            };
            self.send_reinvite_answer(sdp);
        }

        if let Some(on_hold) = hold_change {
            info!("Peer {} the call", if on_hold { "held" } else { "resumed" });
            let call_id = self
                .call_info
                .as_ref()
                .map(|i| i.id.clone())
                .unwrap_or_default();
            self.emit(EngineEvent::RemoteHold { call_id, on_hold });
        }
    }

    pub(crate) fn on_incoming_ack(&mut self, request: &ParsedMessage) {
        let Some(call) = self.call.as_mut() else {
            return;
        };
        if request.call_id() != Some(call.dialog.call_id.as_str()) {
            return;
        }
        debug!("ACK received for {}", call.dialog.call_id);
        // Offerless INVITE: the answer arrives in the ACK
        if request.has_body() && call.remote_sdp.is_none() {
            call.remote_sdp = Some(request.body.clone());
            call.media(MediaOp::ApplyRemote {
                sdp: request.body.clone(),
                kind: SdpKind::Answer,
            });
        }
    }

    pub(crate) fn on_incoming_bye(&mut self, request: &ParsedMessage) {
        let matches = match (self.call.as_ref(), request.dialog_id()) {
            (Some(call), Some(id)) => call.dialog.matches(&id),
            _ => false,
        };
        if !matches {
            self.respond(request, 481, None);
            return;
        }
        self.respond(request, 200, None);
        info!("Peer hung up");
        self.cleanup(EndReason::RemoteHangup);
    }

    pub(crate) fn on_incoming_cancel(&mut self, request: &ParsedMessage) {
        let Some(call) = self.call.as_mut() else {
            self.respond(request, 481, None);
            return;
        };
        if request.call_id() != Some(call.dialog.call_id.as_str()) {
            self.respond(request, 481, None);
            return;
        }
        let local_tag = call.dialog.local_tag.clone();
        let pending = call.pending_invite.take();
        self.respond(request, 200, Some(&local_tag));

        if self.call_state != CallState::Incoming {
            debug!("CANCEL after answer, ignoring");
            return;
        }
        if let Some(invite) = pending {
            self.respond(&invite, 487, Some(&local_tag));
        }
        info!("Caller canceled");
        self.cleanup(EndReason::Canceled);
    }

    pub(crate) fn answer_call(&mut self) {
        if self.call_state != CallState::Incoming {
            debug!("answer_call ignored in state {}", self.call_state);
            return;
        }
        let generation = self.call_generation;
        let needs_media = match self.call.as_ref() {
            Some(call) if !call.answering => call.media.is_none(),
            _ => return,
        };
        let media = needs_media.then(|| self.media_handle(generation));
        let Some(call) = self.call.as_mut() else {
            return;
        };
        call.answering = true;
        if let Some(media) = media {
            call.media = Some(media);
        }
        call.media(MediaOp::Prepare {
            purpose: SdpPurpose::InitialAnswer,
            remote_offer: call.remote_sdp.clone(),
        });
        info!("Answering call {}", call.dialog.call_id);
        self.audio.in_call_audio = true;
        self.publish_audio();
    }

    pub(crate) fn hangup_call(&mut self) {
        if self.call_state.is_resting() {
            debug!("hangup_call ignored in state {}", self.call_state);
            return;
        }
        self.end_call_locally(EndReason::LocalHangup);
    }

    /// Send whatever ends the call in its current state, then clean up
    /// without waiting for the peer
    pub(crate) fn end_call_locally(&mut self, reason: EndReason) {
        match self.call_state {
            CallState::Calling | CallState::Ringing => {
                let (Some(local), Some(call)) = (self.local.as_ref(), self.call.as_ref()) else {
                    self.cleanup(reason);
                    return;
                };
                if call.invite_sent {
                    let message = builder::cancel(local, &call.dialog);
                    let dialog = call.dialog.clone();
                    self.send_message(&message);
                    self.canceled_dialog = Some(dialog);
                }
            }
            CallState::Incoming => {
                let pending = self.call.as_mut().and_then(|call| {
                    call.pending_invite
                        .take()
                        .map(|invite| (invite, call.dialog.local_tag.clone()))
                });
                if let Some((invite, tag)) = pending {
                    self.respond(&invite, 486, Some(&tag));
                }
            }
            CallState::Connected | CallState::Holding => self.send_bye(),
            CallState::Idle | CallState::Disconnected => return,
        }
        self.cleanup(reason);
    }

    pub(crate) fn hold_call(&mut self) {
        if self.call_state != CallState::Connected {
            debug!("hold_call ignored in state {}", self.call_state);
            return;
        }
        if let Some(call) = self.call.as_ref() {
            call.media(MediaOp::SetTrackEnabled(false));
        }
        self.audio.on_hold = true;
        self.publish_audio();
        self.send_reinvite(true);
        self.set_call_state(CallState::Holding);
    }

    pub(crate) fn unhold_call(&mut self) {
        if self.call_state != CallState::Holding {
            debug!("unhold_call ignored in state {}", self.call_state);
            return;
        }
        let muted = self.audio.muted;
        if let Some(call) = self.call.as_ref() {
            call.media(MediaOp::SetTrackEnabled(!muted));
        }
        self.audio.on_hold = false;
        self.publish_audio();
        self.send_reinvite(false);
        self.set_call_state(CallState::Connected);
    }

    fn send_reinvite(&mut self, hold: bool) {
        let cseq = self.call_cseq.next();
        let codecs = self
            .config
            .as_ref()
            .map(|c| c.codec_preferences())
            .unwrap_or_default();
        let (Some(local), Some(call)) = (self.local.as_ref(), self.call.as_mut()) else {
            return;
        };
        let base = call
            .local_sdp
            .clone()
            .unwrap_or_else(|| fallback(&codecs).sdp);
        let sdp = mutate_for_hold(&base, hold);
        call.dialog.start_invite(cseq);
        call.last_offer = Some(sdp.clone());
        call.answered_nonce = None;
        let invite = builder::invite(local, &call.dialog, &sdp, None);
        if !self.send_message(&invite) {
            warn!("re-INVITE could not be sent");
        }
    }

    pub(crate) fn mute_call(&mut self) {
        if !self.call_state.is_established() || self.audio.muted {
            debug!("mute_call ignored in state {}", self.call_state);
            return;
        }
        self.audio.muted = true;
        if let Some(call) = self.call.as_ref() {
            call.media(MediaOp::SetTrackEnabled(false));
        }
        self.publish_audio();
    }

    pub(crate) fn unmute_call(&mut self) {
        if !self.call_state.is_established() || !self.audio.muted {
            debug!("unmute_call ignored in state {}", self.call_state);
            return;
        }
        self.audio.muted = false;
        if !self.audio.on_hold {
            if let Some(call) = self.call.as_ref() {
                call.media(MediaOp::SetTrackEnabled(true));
            }
        }
        self.publish_audio();
    }

    pub(crate) fn toggle_speaker(&mut self) {
        self.audio.speaker_on = !self.audio.speaker_on;
        debug!("Speaker {}", if self.audio.speaker_on { "on" } else { "off" });
        self.publish_audio();
    }

    pub(crate) fn send_dtmf(&mut self, digit: char) {
        if self.call_state != CallState::Connected {
            debug!("send_dtmf ignored in state {}", self.call_state);
            return;
        }
        let digit = digit.to_ascii_uppercase();
        if !DTMF_DIGITS.contains(digit) {
            warn!("Invalid DTMF digit {:?}", digit);
            return;
        }
        let cseq = self.call_cseq.next();
        let (Some(local), Some(call)) = (self.local.as_ref(), self.call.as_ref()) else {
            return;
        };
        let info = builder::dtmf_info(local, &call.dialog, cseq, digit);
        if self.send_message(&info) {
            let call_id = self
                .call_info
                .as_ref()
                .map(|i| i.id.clone())
                .unwrap_or_default();
            self.emit(EngineEvent::DtmfSent { call_id, digit });
        }
    }

    pub(crate) fn transfer_call(&mut self, number: String) {
        let number = number.trim().to_string();
        if !self.call_state.is_established() || number.is_empty() {
            debug!("transfer_call ignored in state {}", self.call_state);
            return;
        }
        let cseq = self.call_cseq.next();
        let (Some(local), Some(call)) = (self.local.as_ref(), self.call.as_mut()) else {
            return;
        };
        let refer = builder::refer(local, &call.dialog, cseq, &number);
        call.pending_refer = Some((cseq, number.clone()));
        info!("Transferring call to {}", number);
        self.send_message(&refer);
    }

    /// Local end of a call: media gone, flags reset, Disconnected now and
    /// Idle after the grace window
    pub(crate) fn cleanup(&mut self, reason: EndReason) {
        cancel(&mut self.duration_timer);
        if let Some(mut call) = self.call.take() {
            call.dispose_media();
        }
        self.audio = Default::default();
        self.publish_audio();

        let (call_id, duration) = self
            .call_info
            .as_ref()
            .map(|i| (i.id.clone(), i.duration))
            .unwrap_or_default();
        info!("Call {} ended: {}", call_id, reason);
        self.set_call_state(CallState::Disconnected);
        self.emit(EngineEvent::CallEnded {
            call_id,
            duration,
            reason: reason.to_string(),
        });

        cancel(&mut self.idle_timer);
        let call_generation = self.call_generation;
        self.idle_timer = Some(self.spawn_after(
            self.timings.disconnect_grace(),
            Internal::IdleDecay { call_generation },
        ));
    }

    fn start_duration_timer(&mut self) {
        cancel(&mut self.duration_timer);
        let call_generation = self.call_generation;
        self.duration_timer = Some(self.spawn_interval(Duration::from_secs(1), move || {
            Internal::DurationTick { call_generation }
        }));
    }

    pub(crate) fn on_duration_tick(&mut self, call_generation: u64) {
        if call_generation != self.call_generation || !self.call_state.is_established() {
            return;
        }
        let Some(connected_at) = self.call.as_ref().and_then(|c| c.connected_at) else {
            return;
        };
        if let Some(info) = self.call_info.as_mut() {
            info.duration = connected_at.elapsed().as_secs() as u32;
        }
        self.publish_call_info();
    }

    pub(crate) fn on_idle_decay(&mut self, call_generation: u64) {
        if call_generation != self.call_generation || self.call_state != CallState::Disconnected {
            return;
        }
        self.idle_timer = None;
        self.set_call_state(CallState::Idle);
    }

    pub(crate) fn handle_media_event(&mut self, event: MediaEvent) {
        let current = self
            .call
            .as_ref()
            .is_some_and(|c| c.generation == event.call_generation);
        if !current {
            return;
        }
        let call_id = self
            .call_info
            .as_ref()
            .map(|i| i.id.clone())
            .unwrap_or_default();
        debug!("Media state for call {}: {}", call_id, event.state.as_str());
        if event.state == MediaConnectionState::Failed {
            self.warn_event("Media connection failed".to_string());
        }
        self.emit(EngineEvent::MediaStateChanged {
            call_id,
            state: event.state.as_str().to_string(),
        });
    }
}
