//! Registration state machine: REGISTER, digest retries, keepalive and
//! reconnect with backoff

use super::engine::{cancel, EngineState, Internal};
use super::events::EngineEvent;
use crate::config::SipAccountConfig;
use crate::domain::{EndReason, RegistrationState};
use crate::infrastructure::protocols::sip::dialog::generate_via_host;
use crate::infrastructure::protocols::sip::{
    builder, AuthorizationHeader, ChallengeKind, Credentials, DigestChallenge, LocalEndpoint,
    ParsedMessage, ReconnectPolicy, RegistrationContext, SipConnection, TransportSink,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Per-connection registration bookkeeping
#[derive(Debug, Clone)]
pub(crate) struct RegistrationSession {
    pub context: RegistrationContext,
    /// Expiry requested by the last REGISTER sent
    pub expires: u32,
    /// Expiry used for refreshes, raised by 423 Min-Expires
    pub refresh_expires: u32,
    pub in_flight: bool,
    /// Nonce already answered; a repeat challenge means bad credentials
    pub answered_nonce: Option<String>,
}

impl RegistrationSession {
    fn new(via_host: &str, expires: u32) -> Self {
        Self {
            context: RegistrationContext::new(via_host),
            expires,
            refresh_expires: expires,
            in_flight: false,
            answered_nonce: None,
        }
    }
}

pub(crate) fn credentials(config: &SipAccountConfig) -> Credentials {
    Credentials {
        username: config.sip_username().to_string(),
        password: config.password.clone().unwrap_or_default(),
        realm: config.effective_realm().to_string(),
    }
}

/// Outcome of checking a challenge against the nonce answered before
pub(crate) enum ChallengeOutcome {
    Answer(AuthorizationHeader, String),
    Rejected(String),
}

impl EngineState {
    pub(crate) fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            base: Duration::from_millis(self.timings.reconnect_base_ms),
            cap: Duration::from_millis(self.timings.reconnect_max_ms),
            max_attempts: self.timings.reconnect_max_attempts,
        }
    }

    /// Answer a 401/407 unless it repeats a nonce we already answered
    pub(crate) fn answer_challenge(
        &self,
        response: &ParsedMessage,
        method: &str,
        uri: &str,
        answered_nonce: Option<&str>,
    ) -> ChallengeOutcome {
        let Some(config) = self.config.as_ref() else {
            return ChallengeOutcome::Rejected("no account configured".to_string());
        };
        let Some(kind) = ChallengeKind::from_status(response.status_code) else {
            return ChallengeOutcome::Rejected(format!("status {} is not a challenge", response.status_code));
        };
        let Some(header) = response.header(kind.challenge_header()) else {
            return ChallengeOutcome::Rejected(format!(
                "{} without {} header",
                response.status_code,
                kind.challenge_header()
            ));
        };
        let challenge = match DigestChallenge::parse(header) {
            Ok(challenge) => challenge,
            Err(e) => return ChallengeOutcome::Rejected(e.to_string()),
        };
        if answered_nonce == Some(challenge.nonce.as_str()) && !challenge.stale {
            return ChallengeOutcome::Rejected("credentials rejected".to_string());
        }

        let auth = self
            .authenticator
            .authorize(&challenge, kind, method, uri, &credentials(config));
        ChallengeOutcome::Answer(auth, challenge.nonce)
    }

    pub(crate) fn initialize(&mut self, config: SipAccountConfig) {
        if self.connection.is_some() || self.reconnect_timer.is_some() {
            info!("Re-initializing: tearing down the current registration");
            if !self.call_state.is_resting() {
                self.end_call_locally(EndReason::Shutdown);
            }
            cancel(&mut self.reconnect_timer);
            cancel(&mut self.unregister_timer);
            self.disconnect();
        }
        if let Err(e) = config.validate() {
            warn!("Account configuration is not usable yet: {}", e);
        }
        info!(
            "Initialized account {}@{}:{} ({} via {})",
            config.sip_username(),
            config.effective_realm(),
            config.effective_port(),
            config.transport_label(),
            config.effective_ws_url()
        );
        self.config = Some(config);
        self.reconnect_attempts = 0;
        self.reconnect_suppressed = false;
        self.set_registration_state(RegistrationState::Unregistered);
    }

    pub(crate) fn register(&mut self) {
        let Some(config) = self.config.as_ref() else {
            error!("register() before initialize()");
            self.set_registration_state(RegistrationState::Failed);
            return;
        };
        if let Err(e) = config.validate() {
            error!("Cannot register: {}", e);
            self.set_registration_state(RegistrationState::Failed);
            return;
        }

        cancel(&mut self.reconnect_timer);
        cancel(&mut self.unregister_timer);
        self.reconnect_attempts = 0;
        self.reconnect_suppressed = false;
        if self.connection.is_some() {
            self.disconnect();
        }
        self.set_registration_state(RegistrationState::Registering);
        self.connect();
    }

    /// Open a fresh connection under a new generation
    fn connect(&mut self) {
        let Some(config) = self.config.as_ref() else {
            return;
        };
        self.generation += 1;
        self.intentional_disconnect = false;
        self.connection = None;

        let url = config.effective_ws_url();
        let sink = TransportSink::new(self.generation, self.transport_tx.clone());
        let connector = Arc::clone(&self.connector);
        info!("Connecting to {} (generation {})", url, self.generation);

        tokio::spawn(async move {
            if let Err(e) = connector.connect(&url, sink.clone()).await {
                error!("Connection to {} failed: {}", url, e);
                sink.closed(e.to_string());
            }
        });
    }

    /// Close the connection on purpose; later events from it are ignored
    pub(crate) fn disconnect(&mut self) {
        self.intentional_disconnect = true;
        self.generation += 1;
        cancel(&mut self.keepalive_timer);
        if let Some(connection) = self.connection.take() {
            info!("Closing SIP connection");
            connection.close();
        }
        self.registration = None;
        self.local = None;
    }

    pub(crate) fn on_transport_opened(&mut self, connection: Arc<dyn SipConnection>) {
        let Some(config) = self.config.as_ref() else {
            connection.close();
            return;
        };
        info!("SIP connection open (generation {})", self.generation);

        let local = LocalEndpoint {
            username: config.sip_username().to_string(),
            domain: config.effective_realm().to_string(),
            display_name: config.caller_display_name().to_string(),
            via_host: generate_via_host(),
            user_agent: self.timings.user_agent.clone(),
        };
        self.registration = Some(RegistrationSession::new(
            &local.via_host,
            self.timings.register_expires_secs,
        ));
        self.local = Some(local);
        self.connection = Some(connection);
        // A call kept across the reconnect still owns its dialog's CSeq space
        if self.call.is_none() {
            self.call_cseq.reset();
        }

        if self.registration_state != RegistrationState::Registering {
            self.set_registration_state(RegistrationState::Registering);
        }
        let expires = self.timings.register_expires_secs;
        if !self.send_register(expires, None) {
            self.on_transport_failure("initial REGISTER could not be sent");
        }
    }

    /// Build and send REGISTER with the next CSeq and a fresh branch
    fn send_register(&mut self, expires: u32, auth: Option<&AuthorizationHeader>) -> bool {
        let (Some(local), Some(session)) = (self.local.as_ref(), self.registration.as_mut()) else {
            return false;
        };
        let cseq = session.context.cseq.next();
        session.expires = expires;
        session.in_flight = true;
        let message = builder::register(local, &session.context, cseq, expires, auth);
        debug!("Sending REGISTER (CSeq {}, expires {})", cseq, expires);
        self.send_message(&message)
    }

    /// Best-effort expires=0 REGISTER
    pub(crate) fn send_unregister_request(&mut self) {
        if self.connection.is_some() && self.registration.is_some() {
            self.send_register(0, None);
        }
    }

    pub(crate) fn on_register_response(&mut self, response: &ParsedMessage) {
        let Some(session) = self.registration.as_mut() else {
            debug!("REGISTER response without a registration session");
            return;
        };
        if response.call_id() != Some(session.context.call_id.as_str()) {
            debug!("REGISTER response for another Call-ID, ignoring");
            return;
        }
        let code = response.status_code;
        if code < 200 {
            return;
        }
        session.in_flight = false;
        let unregistering = self.registration_state == RegistrationState::Unregistering;

        match code {
            200..=299 => {
                session.answered_nonce = None;
                if unregistering {
                    info!("Un-REGISTER acknowledged");
                    return;
                }
                self.reconnect_attempts = 0;
                self.set_registration_state(RegistrationState::Registered);
                self.start_keepalive();
            }
            401 | 407 => {
                let expires = session.expires;
                let answered = session.answered_nonce.clone();
                let uri = match self.local.as_ref() {
                    Some(local) => local.registrar_uri(),
                    None => return,
                };
                match self.answer_challenge(response, "REGISTER", &uri, answered.as_deref()) {
                    ChallengeOutcome::Answer(auth, nonce) => {
                        if let Some(session) = self.registration.as_mut() {
                            session.answered_nonce = Some(nonce);
                        }
                        info!("REGISTER challenged ({}), resending with credentials", code);
                        if !self.send_register(expires, Some(&auth)) {
                            self.on_transport_failure("authenticated REGISTER could not be sent");
                        }
                    }
                    ChallengeOutcome::Rejected(reason) => {
                        if unregistering {
                            warn!("Un-REGISTER challenge not answered: {}", reason);
                            return;
                        }
                        error!("Registration authentication failed: {}", reason);
                        self.registration_failed();
                    }
                }
            }
            423 => {
                let min_expires = response
                    .header("min-expires")
                    .and_then(|v| v.trim().parse::<u32>().ok());
                match min_expires {
                    Some(min) if !unregistering => {
                        info!("Registrar requires expires >= {}", min);
                        session.refresh_expires = min;
                        if !self.send_register(min, None) {
                            self.on_transport_failure("REGISTER could not be sent");
                        }
                    }
                    _ => {
                        warn!("423 without usable Min-Expires");
                        if !unregistering {
                            self.registration_failed();
                        }
                    }
                }
            }
            403 => {
                error!("Registration forbidden (403), not retrying");
                self.reconnect_suppressed = true;
                if !unregistering {
                    self.registration_failed();
                }
            }
            _ => {
                error!("Registration failed: {} {}", code, response.reason);
                if !unregistering {
                    self.registration_failed();
                }
            }
        }
    }

    fn registration_failed(&mut self) {
        cancel(&mut self.keepalive_timer);
        self.set_registration_state(RegistrationState::Failed);
    }

    fn start_keepalive(&mut self) {
        if self.keepalive_timer.is_some() {
            return;
        }
        let generation = self.generation;
        debug!("Keepalive every {:?}", self.timings.keepalive_interval());
        self.keepalive_timer = Some(self.spawn_interval(self.timings.keepalive_interval(), move || {
            Internal::KeepaliveTick { generation }
        }));
    }

    pub(crate) fn on_keepalive_tick(&mut self, generation: u64) {
        if generation != self.generation
            || self.registration_state != RegistrationState::Registered
        {
            return;
        }
        let Some(session) = self.registration.as_ref() else {
            return;
        };
        if session.in_flight {
            debug!("REGISTER in flight, skipping keepalive");
            return;
        }
        let expires = session.refresh_expires;
        debug!("Keepalive re-REGISTER");
        if !self.send_register(expires, None) {
            self.on_transport_failure("keepalive REGISTER could not be sent");
        }
    }

    pub(crate) fn on_transport_closed(&mut self, reason: &str) {
        if self.intentional_disconnect {
            debug!("Connection closed on purpose: {}", reason);
            return;
        }
        self.on_transport_failure(reason);
    }

    /// Unexpected loss of the connection: fail and maybe reconnect
    fn on_transport_failure(&mut self, reason: &str) {
        warn!("SIP transport failure: {}", reason);
        cancel(&mut self.keepalive_timer);
        if let Some(connection) = self.connection.take() {
            connection.close();
        }
        // Stragglers from the dead socket must not count
        self.generation += 1;
        self.registration = None;
        self.local = None;

        if !self.call_state.is_resting() {
            warn!("Transport lost during a call; the call is kept until hangup");
        }

        self.set_registration_state(RegistrationState::Failed);
        if self.reconnect_suppressed {
            info!("Automatic reconnect suppressed");
            return;
        }
        self.schedule_reconnect();
    }

    fn schedule_reconnect(&mut self) {
        if self.reconnect_timer.is_some() {
            return;
        }
        let attempt = self.reconnect_attempts + 1;
        match self.reconnect_policy().delay_for(attempt) {
            Some(delay) => {
                self.reconnect_attempts = attempt;
                info!("Reconnect attempt {} in {:?}", attempt, delay);
                self.reconnect_timer =
                    Some(self.spawn_after(delay, Internal::ReconnectDue { attempt }));
                self.emit(EngineEvent::ReconnectScheduled {
                    attempt,
                    delay_ms: delay.as_millis() as u64,
                });
            }
            None => {
                error!(
                    "Giving up after {} reconnect attempts",
                    self.reconnect_attempts
                );
                self.emit(EngineEvent::ReconnectAbandoned {
                    attempts: self.reconnect_attempts,
                });
            }
        }
    }

    pub(crate) fn on_reconnect_due(&mut self, attempt: u32) {
        if attempt != self.reconnect_attempts || self.reconnect_timer.take().is_none() {
            return;
        }
        if self.config.is_none() || self.reconnect_suppressed {
            return;
        }
        info!("Reconnecting (attempt {})", attempt);
        self.set_registration_state(RegistrationState::Registering);
        self.connect();
    }

    pub(crate) fn unregister(&mut self) {
        cancel(&mut self.reconnect_timer);
        cancel(&mut self.keepalive_timer);
        if !self.call_state.is_resting() {
            self.end_call_locally(EndReason::Shutdown);
        }

        let registered = matches!(
            self.registration_state,
            RegistrationState::Registered | RegistrationState::Registering
        );
        if self.connection.is_none() || !registered {
            self.disconnect();
            self.set_registration_state(RegistrationState::Unregistered);
            return;
        }
        if self.unregister_timer.is_some() {
            return;
        }

        self.set_registration_state(RegistrationState::Unregistering);
        self.send_unregister_request();
        let generation = self.generation;
        self.unregister_timer = Some(self.spawn_after(
            self.timings.unregister_grace(),
            Internal::UnregisterComplete { generation },
        ));
    }

    pub(crate) fn on_unregister_complete(&mut self, generation: u64) {
        if self.unregister_timer.take().is_none() || generation != self.generation {
            return;
        }
        self.disconnect();
        self.set_registration_state(RegistrationState::Unregistered);
    }
}
