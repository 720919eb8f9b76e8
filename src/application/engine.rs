//! Phone engine: one serialized actor owning all signaling and call state
//!
//! The public [`PhoneEngine`] handle only sends commands and exposes
//! observable state. Transport events, timers and media completions all
//! funnel into the same task, so no two transitions ever run concurrently.

use super::call::ActiveCall;
use super::events::{EngineEvent, EventBroadcaster};
use super::registration::RegistrationSession;
use crate::config::{EngineTimings, SipAccountConfig};
use crate::domain::{CallInfo, CallState, EndReason, RegistrationState};
use crate::infrastructure::protocols::sip::{
    builder, CSeqCounter, DialogContext, DialogId, DigestAuthenticator, LocalEndpoint,
    ParsedMessage, SipConnection, SipConnector, SipMessage, SipMethod, TransportEvent,
};
use crate::infrastructure::protocols::webrtc::{MediaEvent, MediaFactory};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const SIP_LOG_LIMIT: usize = 500;

/// Audio-related flags for the platform audio layer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioFlags {
    pub muted: bool,
    pub speaker_on: bool,
    pub on_hold: bool,
    /// Request for the platform's in-call audio mode
    pub in_call_audio: bool,
}

/// Point-in-time view of the engine for diagnostics and tests
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineSnapshot {
    pub initialized: bool,
    pub registration_state: RegistrationState,
    pub call_state: CallState,
    pub call_info: Option<CallInfo>,
    pub audio: AudioFlags,
    pub connected: bool,
    pub connection_generation: u64,
    pub reconnect_attempts: u32,
    pub keepalive_active: bool,
    pub reconnect_pending: bool,
    pub unregister_pending: bool,
    pub duration_timer_active: bool,
    pub idle_decay_pending: bool,
    pub media_active: bool,
    pub dialog: Option<DialogId>,
}

impl EngineSnapshot {
    /// Number of background loops and timers still alive
    pub fn background_tasks(&self) -> usize {
        [
            self.keepalive_active,
            self.reconnect_pending,
            self.unregister_pending,
            self.duration_timer_active,
            self.idle_decay_pending,
            self.media_active,
        ]
        .iter()
        .filter(|active| **active)
        .count()
    }
}

pub(crate) enum Command {
    Initialize(Box<SipAccountConfig>),
    Register,
    Unregister,
    MakeCall(String),
    Answer,
    Hangup,
    Hold,
    Unhold,
    Mute,
    Unmute,
    ToggleSpeaker,
    SendDtmf(char),
    Transfer(String),
    Snapshot(oneshot::Sender<EngineSnapshot>),
    Shutdown(oneshot::Sender<()>),
}

/// What a locally prepared SDP is for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SdpPurpose {
    InitialOffer,
    InitialAnswer,
    ReinviteAnswer,
}

pub(crate) enum Internal {
    KeepaliveTick {
        generation: u64,
    },
    ReconnectDue {
        attempt: u32,
    },
    UnregisterComplete {
        generation: u64,
    },
    DurationTick {
        call_generation: u64,
    },
    IdleDecay {
        call_generation: u64,
    },
    LocalSdpReady {
        call_generation: u64,
        purpose: SdpPurpose,
        sdp: String,
        fallback: bool,
    },
}

/// Senders behind every observable value
pub(crate) struct Published {
    pub registration: watch::Sender<RegistrationState>,
    pub call_state: watch::Sender<CallState>,
    pub call_info: watch::Sender<Option<CallInfo>>,
    pub audio: watch::Sender<AudioFlags>,
    pub events: EventBroadcaster,
}

/// Handle to a running engine. Every command is fire-and-forget; effects
/// are observed through the watch receivers and the event stream.
pub struct PhoneEngine {
    commands: mpsc::UnboundedSender<Command>,
    registration_state: watch::Receiver<RegistrationState>,
    call_state: watch::Receiver<CallState>,
    call_info: watch::Receiver<Option<CallInfo>>,
    audio_flags: watch::Receiver<AudioFlags>,
    events: EventBroadcaster,
}

impl PhoneEngine {
    /// Start the engine actor on the current tokio runtime
    pub fn spawn(
        connector: Arc<dyn SipConnector>,
        media_factory: Arc<dyn MediaFactory>,
        timings: EngineTimings,
    ) -> Self {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (transport_tx, transport_rx) = mpsc::unbounded_channel();
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let (media_tx, media_rx) = mpsc::unbounded_channel();

        let (registration_tx, registration_rx) = watch::channel(RegistrationState::default());
        let (call_state_tx, call_state_rx) = watch::channel(CallState::default());
        let (call_info_tx, call_info_rx) = watch::channel(None);
        let (audio_tx, audio_rx) = watch::channel(AudioFlags::default());
        let events = EventBroadcaster::new();

        let state = EngineState::new(
            connector,
            media_factory,
            timings,
            Published {
                registration: registration_tx,
                call_state: call_state_tx,
                call_info: call_info_tx,
                audio: audio_tx,
                events: events.clone(),
            },
            transport_tx,
            internal_tx,
            media_tx,
        );

        tokio::spawn(state.run(command_rx, transport_rx, internal_rx, media_rx));

        Self {
            commands: command_tx,
            registration_state: registration_rx,
            call_state: call_state_rx,
            call_info: call_info_rx,
            audio_flags: audio_rx,
            events,
        }
    }

    fn send(&self, command: Command) {
        if self.commands.send(command).is_err() {
            warn!("Engine task is not running, command dropped");
        }
    }

    pub fn initialize(&self, config: SipAccountConfig) {
        self.send(Command::Initialize(Box::new(config)));
    }

    pub fn register(&self) {
        self.send(Command::Register);
    }

    pub fn unregister(&self) {
        self.send(Command::Unregister);
    }

    pub fn make_call(&self, number: impl Into<String>) {
        self.send(Command::MakeCall(number.into()));
    }

    pub fn answer_call(&self) {
        self.send(Command::Answer);
    }

    pub fn hangup_call(&self) {
        self.send(Command::Hangup);
    }

    pub fn hold_call(&self) {
        self.send(Command::Hold);
    }

    pub fn unhold_call(&self) {
        self.send(Command::Unhold);
    }

    pub fn mute_call(&self) {
        self.send(Command::Mute);
    }

    pub fn unmute_call(&self) {
        self.send(Command::Unmute);
    }

    pub fn toggle_speaker(&self) {
        self.send(Command::ToggleSpeaker);
    }

    pub fn send_dtmf(&self, digit: char) {
        self.send(Command::SendDtmf(digit));
    }

    pub fn transfer_call(&self, number: impl Into<String>) {
        self.send(Command::Transfer(number.into()));
    }

    /// Hang up, un-register and close everything. Safe to call repeatedly
    /// and before `initialize`.
    pub async fn shutdown(&self) {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(Command::Shutdown(tx)).is_ok() {
            let _ = rx.await;
        }
    }

    /// `None` once the engine task has stopped
    pub async fn snapshot(&self) -> Option<EngineSnapshot> {
        let (tx, rx) = oneshot::channel();
        self.commands.send(Command::Snapshot(tx)).ok()?;
        rx.await.ok()
    }

    pub fn registration_state(&self) -> watch::Receiver<RegistrationState> {
        self.registration_state.clone()
    }

    pub fn call_state(&self) -> watch::Receiver<CallState> {
        self.call_state.clone()
    }

    pub fn call_info(&self) -> watch::Receiver<Option<CallInfo>> {
        self.call_info.clone()
    }

    pub fn audio_flags(&self) -> watch::Receiver<AudioFlags> {
        self.audio_flags.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }
}

/// Everything the actor owns
pub(crate) struct EngineState {
    pub connector: Arc<dyn SipConnector>,
    pub media_factory: Arc<dyn MediaFactory>,
    pub timings: EngineTimings,
    pub authenticator: DigestAuthenticator,
    pub published: Published,
    pub transport_tx: mpsc::UnboundedSender<TransportEvent>,
    pub internal_tx: mpsc::UnboundedSender<Internal>,
    pub media_tx: mpsc::UnboundedSender<MediaEvent>,

    pub config: Option<SipAccountConfig>,

    // Connection
    pub generation: u64,
    pub connection: Option<Arc<dyn SipConnection>>,
    pub intentional_disconnect: bool,
    pub local: Option<LocalEndpoint>,

    // Registration
    pub registration_state: RegistrationState,
    pub registration: Option<RegistrationSession>,
    pub reconnect_attempts: u32,
    pub reconnect_suppressed: bool,
    pub keepalive_timer: Option<JoinHandle<()>>,
    pub reconnect_timer: Option<JoinHandle<()>>,
    pub unregister_timer: Option<JoinHandle<()>>,

    // Call
    pub call_cseq: CSeqCounter,
    pub call_generation: u64,
    pub call_state: CallState,
    pub call_info: Option<CallInfo>,
    pub call: Option<ActiveCall>,
    /// Dialog of a call we canceled, kept to ACK the final response
    pub canceled_dialog: Option<DialogContext>,
    pub duration_timer: Option<JoinHandle<()>>,
    pub idle_timer: Option<JoinHandle<()>>,
    pub audio: AudioFlags,
}

impl EngineState {
    #[allow(clippy::too_many_arguments)]
    fn new(
        connector: Arc<dyn SipConnector>,
        media_factory: Arc<dyn MediaFactory>,
        timings: EngineTimings,
        published: Published,
        transport_tx: mpsc::UnboundedSender<TransportEvent>,
        internal_tx: mpsc::UnboundedSender<Internal>,
        media_tx: mpsc::UnboundedSender<MediaEvent>,
    ) -> Self {
        Self {
            connector,
            media_factory,
            timings,
            authenticator: DigestAuthenticator::new(),
            published,
            transport_tx,
            internal_tx,
            media_tx,
            config: None,
            generation: 0,
            connection: None,
            intentional_disconnect: false,
            local: None,
            registration_state: RegistrationState::Unregistered,
            registration: None,
            reconnect_attempts: 0,
            reconnect_suppressed: false,
            keepalive_timer: None,
            reconnect_timer: None,
            unregister_timer: None,
            call_cseq: CSeqCounter::new(),
            call_generation: 0,
            call_state: CallState::Idle,
            call_info: None,
            call: None,
            canceled_dialog: None,
            duration_timer: None,
            idle_timer: None,
            audio: AudioFlags::default(),
        }
    }

    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut transport: mpsc::UnboundedReceiver<TransportEvent>,
        mut internal: mpsc::UnboundedReceiver<Internal>,
        mut media: mpsc::UnboundedReceiver<MediaEvent>,
    ) {
        info!("Phone engine started");
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => break,
                },
                Some(event) = transport.recv() => self.handle_transport(event),
                Some(event) = internal.recv() => self.handle_internal(event),
                Some(event) = media.recv() => self.handle_media_event(event),
            }
        }
        self.shutdown_now();
        info!("Phone engine stopped");
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Initialize(config) => self.initialize(*config),
            Command::Register => self.register(),
            Command::Unregister => self.unregister(),
            Command::MakeCall(number) => self.make_call(number),
            Command::Answer => self.answer_call(),
            Command::Hangup => self.hangup_call(),
            Command::Hold => self.hold_call(),
            Command::Unhold => self.unhold_call(),
            Command::Mute => self.mute_call(),
            Command::Unmute => self.unmute_call(),
            Command::ToggleSpeaker => self.toggle_speaker(),
            Command::SendDtmf(digit) => self.send_dtmf(digit),
            Command::Transfer(number) => self.transfer_call(number),
            Command::Snapshot(reply) => {
                let _ = reply.send(self.snapshot());
            }
            Command::Shutdown(reply) => {
                self.shutdown_now();
                let _ = reply.send(());
            }
        }
    }

    fn handle_transport(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Opened {
                generation,
                connection,
            } => {
                if generation != self.generation || self.intentional_disconnect {
                    debug!("Ignoring stale connection (generation {})", generation);
                    connection.close();
                    return;
                }
                self.on_transport_opened(connection);
            }
            TransportEvent::Message { generation, text } => {
                if generation != self.generation {
                    debug!("Ignoring message from stale connection {}", generation);
                    return;
                }
                self.handle_incoming_text(&text);
            }
            TransportEvent::Closed { generation, reason } => {
                if generation != self.generation {
                    debug!("Ignoring close of stale connection {}: {}", generation, reason);
                    return;
                }
                self.on_transport_closed(&reason);
            }
        }
    }

    fn handle_internal(&mut self, event: Internal) {
        match event {
            Internal::KeepaliveTick { generation } => self.on_keepalive_tick(generation),
            Internal::ReconnectDue { attempt } => self.on_reconnect_due(attempt),
            Internal::UnregisterComplete { generation } => self.on_unregister_complete(generation),
            Internal::DurationTick { call_generation } => self.on_duration_tick(call_generation),
            Internal::IdleDecay { call_generation } => self.on_idle_decay(call_generation),
            Internal::LocalSdpReady {
                call_generation,
                purpose,
                sdp,
                fallback,
            } => self.on_local_sdp_ready(call_generation, purpose, sdp, fallback),
        }
    }

    fn handle_incoming_text(&mut self, text: &str) {
        if text.trim().is_empty() {
            // CRLF keepalive
            return;
        }
        debug!("<<< SIP IN\n{}", truncate(text, SIP_LOG_LIMIT));

        let message = match ParsedMessage::parse(text) {
            Ok(message) => message,
            Err(e) => {
                warn!("Dropping unparseable SIP message: {}", e);
                return;
            }
        };

        if message.is_response {
            self.handle_response(&message);
        } else {
            self.handle_request(&message);
        }
    }

    fn handle_response(&mut self, response: &ParsedMessage) {
        let Some((cseq, method)) = response.cseq() else {
            warn!("Response without CSeq: {}", response.start_line);
            return;
        };
        match method.parse::<SipMethod>() {
            Ok(SipMethod::Register) => self.on_register_response(response),
            Ok(SipMethod::Invite) => self.on_invite_response(response, cseq),
            Ok(SipMethod::Refer) => self.on_refer_response(response, cseq),
            Ok(SipMethod::Bye) | Ok(SipMethod::Cancel) | Ok(SipMethod::Info) => {
                if response.status_code >= 300 {
                    warn!(
                        "{} {} for {} (CSeq {})",
                        response.status_code, response.reason, method, cseq
                    );
                } else {
                    debug!("{} {} for {}", response.status_code, response.reason, method);
                }
            }
            _ => debug!("Ignoring response for {}: {}", method, response.start_line),
        }
    }

    fn handle_request(&mut self, request: &ParsedMessage) {
        match request.sip_method() {
            Some(SipMethod::Invite) => self.on_incoming_invite(request),
            Some(SipMethod::Ack) => self.on_incoming_ack(request),
            Some(SipMethod::Bye) => self.on_incoming_bye(request),
            Some(SipMethod::Cancel) => self.on_incoming_cancel(request),
            Some(SipMethod::Options) | Some(SipMethod::Notify) | Some(SipMethod::Message) => {
                debug!("Answering {} with 200 OK", request.method);
                self.respond(request, 200, None);
            }
            _ => {
                info!("Unsupported request {}, answering 501", request.method);
                self.respond(request, 501, None);
            }
        }
    }

    /// Send a response copied from `request`
    pub(crate) fn respond(&mut self, request: &ParsedMessage, code: u16, to_tag: Option<&str>) {
        let response = builder::response(request, code, to_tag, &self.timings.user_agent);
        self.send_message(&response);
    }

    /// Send over the current connection; false if nothing was sent
    pub(crate) fn send_message(&mut self, message: &SipMessage) -> bool {
        let Some(connection) = self.connection.as_ref() else {
            warn!("No SIP connection, dropping {:?}", message.start);
            return false;
        };
        let wire = message.to_wire();
        debug!(">>> SIP OUT\n{}", truncate(&wire, SIP_LOG_LIMIT));
        match connection.send(wire) {
            Ok(()) => true,
            Err(e) => {
                error!("Failed to send SIP message: {}", e);
                false
            }
        }
    }

    pub(crate) fn set_registration_state(&mut self, new_state: RegistrationState) {
        let old_state = self.registration_state;
        if old_state == new_state {
            return;
        }
        info!("Registration state: {} -> {}", old_state, new_state);
        self.registration_state = new_state;
        self.published.registration.send_replace(new_state);
        self.published
            .events
            .publish(EngineEvent::RegistrationStateChanged {
                old_state,
                new_state,
            });
    }

    pub(crate) fn set_call_state(&mut self, new_state: CallState) {
        let old_state = self.call_state;
        if old_state == new_state {
            return;
        }
        if !old_state.can_transition_to(&new_state) {
            warn!("Refusing call state transition {} -> {}", old_state, new_state);
            return;
        }
        info!("Call state: {} -> {}", old_state, new_state);
        self.call_state = new_state;

        let call_id = match self.call_info.as_mut() {
            Some(info) => {
                if let Err(e) = info.transition(new_state) {
                    warn!("Call info out of sync: {}", e);
                    info.state = new_state;
                }
                info.id.clone()
            }
            None => String::new(),
        };
        if new_state == CallState::Idle {
            self.call_info = None;
        }

        self.published.call_state.send_replace(new_state);
        self.publish_call_info();
        self.published.events.publish(EngineEvent::CallStateChanged {
            call_id,
            old_state,
            new_state,
        });
    }

    pub(crate) fn publish_call_info(&self) {
        self.published.call_info.send_replace(self.call_info.clone());
    }

    pub(crate) fn publish_audio(&self) {
        self.published.audio.send_replace(self.audio);
    }

    pub(crate) fn emit(&self, event: EngineEvent) {
        self.published.events.publish(event);
    }

    pub(crate) fn warn_event(&self, message: String) {
        warn!("{}", message);
        self.emit(EngineEvent::Warning { message });
    }

    /// Post `event` to the actor after `delay`
    pub(crate) fn spawn_after(&self, delay: Duration, event: Internal) -> JoinHandle<()> {
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(event);
        })
    }

    /// Post an event every `period`, first one after one period
    pub(crate) fn spawn_interval<F>(&self, period: Duration, make: F) -> JoinHandle<()>
    where
        F: Fn() -> Internal + Send + 'static,
    {
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                interval.tick().await;
                if tx.send(make()).is_err() {
                    break;
                }
            }
        })
    }

    /// Run `work` off the actor; used for media operations
    pub(crate) fn spawn_detached<F>(&self, work: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        tokio::spawn(work);
    }

    fn snapshot(&self) -> EngineSnapshot {
        EngineSnapshot {
            initialized: self.config.is_some(),
            registration_state: self.registration_state,
            call_state: self.call_state,
            call_info: self.call_info.clone(),
            audio: self.audio,
            connected: self.connection.is_some(),
            connection_generation: self.generation,
            reconnect_attempts: self.reconnect_attempts,
            keepalive_active: is_running(&self.keepalive_timer),
            reconnect_pending: is_running(&self.reconnect_timer),
            unregister_pending: is_running(&self.unregister_timer),
            duration_timer_active: is_running(&self.duration_timer),
            idle_decay_pending: is_running(&self.idle_timer),
            media_active: self.call.as_ref().is_some_and(|call| call.media.is_some()),
            dialog: self.call.as_ref().map(|call| call.dialog.id()),
        }
    }

    /// Tear everything down; idempotent
    fn shutdown_now(&mut self) {
        info!("Shutting down phone engine");

        if !self.call_state.is_resting() {
            self.end_call_locally(EndReason::Shutdown);
        }
        cancel(&mut self.idle_timer);
        cancel(&mut self.duration_timer);
        if let Some(mut call) = self.call.take() {
            call.dispose_media();
        }
        self.canceled_dialog = None;
        if self.call_state == CallState::Disconnected {
            self.set_call_state(CallState::Idle);
        }
        self.call_info = None;
        self.publish_call_info();
        self.audio = AudioFlags::default();
        self.publish_audio();

        cancel(&mut self.keepalive_timer);
        cancel(&mut self.reconnect_timer);
        cancel(&mut self.unregister_timer);

        if self.registration_state == RegistrationState::Registered {
            self.send_unregister_request();
        }
        self.disconnect();
        self.reconnect_attempts = 0;
        self.set_registration_state(RegistrationState::Unregistered);
        self.config = None;
    }
}

/// Abort a background task if present
pub(crate) fn cancel(handle: &mut Option<JoinHandle<()>>) {
    if let Some(handle) = handle.take() {
        handle.abort();
    }
}

fn is_running(handle: &Option<JoinHandle<()>>) -> bool {
    handle.as_ref().is_some_and(|h| !h.is_finished())
}

fn truncate(text: &str, limit: usize) -> String {
    if text.len() <= limit {
        return text.to_string();
    }
    let mut end = limit;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &text[..end])
}
