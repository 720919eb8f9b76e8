//! In-memory transport and media fakes for driving the engine in tests

#![allow(dead_code)]

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use wsphone::config::{EngineTimings, SipAccountConfig};
use wsphone::domain::{CallState, RegistrationState};
use wsphone::infrastructure::protocols::sip::{
    builder, ParsedMessage, SipConnection, SipConnector, SipError, SipMessage, TransportSink,
};
use wsphone::infrastructure::protocols::webrtc::{
    MediaConfig, MediaError, MediaFactory, MediaSession, SdpKind,
};
use wsphone::{EngineEvent, PhoneEngine};

pub const WAIT: Duration = Duration::from_secs(10);
pub const PEER_TAG: &str = "peer-tag-1";
pub const PEER_CONTACT: &str = "<sip:1001@10.0.0.2:5060;transport=ws>";

pub const FAKE_OFFER: &str = "v=0\r\no=- 10 10 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\nm=audio 9 UDP/TLS/RTP/SAVPF 111\r\na=rtpmap:111 opus/48000/2\r\na=sendrecv\r\na=candidate:1 1 udp 1 10.0.0.1 5000 typ host\r\n";
pub const FAKE_ANSWER: &str = "v=0\r\no=- 20 20 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\nm=audio 9 UDP/TLS/RTP/SAVPF 111\r\na=rtpmap:111 opus/48000/2\r\na=sendrecv\r\n";
pub const PEER_SDP: &str = "v=0\r\no=- 30 30 IN IP4 10.0.0.2\r\ns=-\r\nt=0 0\r\nm=audio 9 UDP/TLS/RTP/SAVPF 111\r\na=rtpmap:111 opus/48000/2\r\na=sendrecv\r\n";

pub fn account() -> SipAccountConfig {
    SipAccountConfig {
        server: "pbx.example.com".to_string(),
        username: Some("alice".to_string()),
        password: Some("secret".to_string()),
        display_name: Some("Alice".to_string()),
        ..Default::default()
    }
}

/// Shared state behind the fake connector
#[derive(Default)]
struct NetworkState {
    sink: Option<TransportSink>,
    connects: usize,
    refuse: bool,
}

pub struct FakeNetwork {
    state: Mutex<NetworkState>,
    sent: mpsc::UnboundedSender<String>,
}

impl FakeNetwork {
    pub fn connects(&self) -> usize {
        self.state.lock().unwrap().connects
    }

    pub fn refuse_connections(&self, refuse: bool) {
        self.state.lock().unwrap().refuse = refuse;
    }

    fn sink(&self) -> TransportSink {
        self.state
            .lock()
            .unwrap()
            .sink
            .clone()
            .expect("no connection opened")
    }

    /// Deliver raw text from the "server"
    pub fn inject(&self, text: impl Into<String>) {
        self.sink().message(text.into());
    }

    /// Simulate the server dropping the socket
    pub fn drop_connection(&self) {
        self.sink().closed("connection reset");
    }
}

struct FakeConnector(Arc<FakeNetwork>);

#[async_trait]
impl SipConnector for FakeConnector {
    async fn connect(&self, _url: &str, sink: TransportSink) -> Result<(), SipError> {
        {
            let mut state = self.0.state.lock().unwrap();
            state.connects += 1;
            if state.refuse {
                return Err(SipError::TransportError("connection refused".to_string()));
            }
            state.sink = Some(sink.clone());
        }
        sink.opened(Arc::new(FakeConnection {
            sent: self.0.sent.clone(),
            open: AtomicBool::new(true),
        }));
        Ok(())
    }
}

struct FakeConnection {
    sent: mpsc::UnboundedSender<String>,
    open: AtomicBool,
}

impl SipConnection for FakeConnection {
    fn send(&self, text: String) -> Result<(), SipError> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(SipError::TransportError("closed".to_string()));
        }
        self.sent
            .send(text)
            .map_err(|_| SipError::TransportError("receiver gone".to_string()))
    }

    fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
    }
}

/// What the fake media sessions were asked to do
#[derive(Default)]
pub struct MediaLog {
    pub sessions: AtomicUsize,
    pub disposed: AtomicUsize,
    pub track_enabled: Mutex<Vec<bool>>,
    pub remote: Mutex<Vec<(String, SdpKind)>>,
}

pub struct FakeMediaFactory {
    pub log: Arc<MediaLog>,
}

#[async_trait]
impl MediaFactory for FakeMediaFactory {
    async fn setup(&self, _config: &MediaConfig) -> Result<Arc<dyn MediaSession>, MediaError> {
        self.log.sessions.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(FakeMediaSession {
            log: Arc::clone(&self.log),
            local: Mutex::new(None),
        }))
    }
}

struct FakeMediaSession {
    log: Arc<MediaLog>,
    local: Mutex<Option<String>>,
}

#[async_trait]
impl MediaSession for FakeMediaSession {
    async fn create_offer(&self) -> Result<String, MediaError> {
        *self.local.lock().unwrap() = Some(FAKE_OFFER.to_string());
        Ok(FAKE_OFFER.to_string())
    }

    async fn create_answer(&self) -> Result<String, MediaError> {
        *self.local.lock().unwrap() = Some(FAKE_ANSWER.to_string());
        Ok(FAKE_ANSWER.to_string())
    }

    async fn set_remote(&self, sdp: &str, kind: SdpKind) -> Result<(), MediaError> {
        self.log.remote.lock().unwrap().push((sdp.to_string(), kind));
        Ok(())
    }

    async fn wait_ice_gathering(&self, _timeout: Duration) -> Option<String> {
        self.local.lock().unwrap().clone()
    }

    async fn set_track_enabled(&self, enabled: bool) -> Result<(), MediaError> {
        self.log.track_enabled.lock().unwrap().push(enabled);
        Ok(())
    }

    async fn dispose(&self) {
        self.log.disposed.fetch_add(1, Ordering::SeqCst);
    }
}

/// Media that can never be set up, as without an audio device
pub struct FailingMediaFactory;

#[async_trait]
impl MediaFactory for FailingMediaFactory {
    async fn setup(&self, _config: &MediaConfig) -> Result<Arc<dyn MediaSession>, MediaError> {
        Err(MediaError::InvalidState("no audio device".to_string()))
    }
}

pub struct Harness {
    pub engine: PhoneEngine,
    pub network: Arc<FakeNetwork>,
    pub media: Arc<MediaLog>,
    pub events: broadcast::Receiver<EngineEvent>,
    sent: mpsc::UnboundedReceiver<String>,
}

impl Harness {
    pub fn new() -> Self {
        let log = Arc::new(MediaLog::default());
        let factory = Arc::new(FakeMediaFactory {
            log: Arc::clone(&log),
        });
        Self::build(factory, log)
    }

    pub fn without_media() -> Self {
        Self::build(Arc::new(FailingMediaFactory), Arc::new(MediaLog::default()))
    }

    fn build(factory: Arc<dyn MediaFactory>, log: Arc<MediaLog>) -> Self {
        let (sent_tx, sent_rx) = mpsc::unbounded_channel();
        let network = Arc::new(FakeNetwork {
            state: Mutex::new(NetworkState::default()),
            sent: sent_tx,
        });
        let engine = PhoneEngine::spawn(
            Arc::new(FakeConnector(Arc::clone(&network))),
            factory,
            EngineTimings::default(),
        );
        let events = engine.subscribe();
        Self {
            engine,
            network,
            media: log,
            events,
            sent: sent_rx,
        }
    }

    /// Initialized, registered and with the REGISTER exchange consumed
    pub async fn registered() -> Self {
        let mut harness = Self::new();
        harness.register().await;
        harness
    }

    pub async fn register(&mut self) {
        self.engine.initialize(account());
        self.engine.register();
        let register = self.expect_request("REGISTER").await;
        self.reply(&register, 200);
        self.wait_registration(RegistrationState::Registered).await;
    }

    /// Next message the engine sent, parsed
    pub async fn next_sent_within(&mut self, limit: Duration) -> Option<ParsedMessage> {
        match tokio::time::timeout(limit, self.sent.recv()).await {
            Ok(Some(text)) => Some(ParsedMessage::parse(&text).expect("engine sent invalid SIP")),
            _ => None,
        }
    }

    pub async fn next_sent(&mut self) -> ParsedMessage {
        self.next_sent_within(WAIT)
            .await
            .expect("engine sent nothing")
    }

    pub async fn expect_request(&mut self, method: &str) -> ParsedMessage {
        let message = self.next_sent().await;
        assert!(!message.is_response, "expected {}, got {}", method, message.start_line);
        assert_eq!(message.method, method, "unexpected {}", message.start_line);
        message
    }

    pub async fn expect_response(&mut self, code: u16) -> ParsedMessage {
        let message = self.next_sent().await;
        assert!(message.is_response, "expected {}, got {}", code, message.start_line);
        assert_eq!(message.status_code, code, "unexpected {}", message.start_line);
        message
    }

    /// Nothing is sent for a while
    pub async fn assert_quiet(&mut self) {
        if let Some(message) = self.next_sent_within(Duration::from_secs(1)).await {
            panic!("unexpected message: {}", message.start_line);
        }
    }

    pub fn response(&self, request: &ParsedMessage, code: u16) -> SipMessage {
        builder::response(request, code, Some(PEER_TAG), "FakePBX/1.0")
    }

    pub fn reply(&self, request: &ParsedMessage, code: u16) {
        self.send(self.response(request, code));
    }

    pub fn send(&self, message: SipMessage) {
        self.network.inject(message.to_wire());
    }

    pub async fn wait_registration(&self, expected: RegistrationState) {
        let mut rx = self.engine.registration_state();
        tokio::time::timeout(WAIT, rx.wait_for(|state| *state == expected))
            .await
            .unwrap_or_else(|_| panic!("registration never reached {}", expected))
            .expect("engine stopped");
    }

    pub async fn wait_call_state(&self, expected: CallState) {
        let mut rx = self.engine.call_state();
        tokio::time::timeout(WAIT, rx.wait_for(|state| *state == expected))
            .await
            .unwrap_or_else(|_| panic!("call never reached {}", expected))
            .expect("engine stopped");
    }

    /// First event matching `predicate` within `limit`
    pub async fn wait_event<F>(&mut self, limit: Duration, predicate: F) -> EngineEvent
    where
        F: Fn(&EngineEvent) -> bool,
    {
        let deadline = tokio::time::Instant::now() + limit;
        loop {
            let event = tokio::time::timeout_at(deadline, self.events.recv())
                .await
                .expect("event never arrived")
                .expect("event stream closed");
            if predicate(&event) {
                return event;
            }
        }
    }

    /// Outgoing call answered by the peer, with the INVITE/ACK consumed
    pub async fn connected_outgoing_call(&mut self, number: &str) -> ParsedMessage {
        self.engine.make_call(number);
        let invite = self.expect_request("INVITE").await;
        self.send(
            self.response(&invite, 200)
                .header("Contact", PEER_CONTACT)
                .body("application/sdp", PEER_SDP),
        );
        self.expect_request("ACK").await;
        self.wait_call_state(CallState::Connected).await;
        invite
    }

    /// INVITE from the peer, as received over the socket
    pub fn inject_invite(&self, call_id: &str, from_tag: &str, cseq: u32) -> String {
        let text = peer_invite(call_id, from_tag, cseq, None);
        self.network.inject(text.clone());
        text
    }
}

pub fn peer_invite(call_id: &str, from_tag: &str, cseq: u32, to_tag: Option<&str>) -> String {
    let to = match to_tag {
        Some(tag) => format!("<sip:alice@pbx.example.com>;tag={}", tag),
        None => "<sip:alice@pbx.example.com>".to_string(),
    };
    SipMessage::request(
        wsphone::infrastructure::protocols::sip::SipMethod::Invite,
        "sip:alice@abc.invalid;transport=ws",
    )
    .header("Via", "SIP/2.0/WSS 10.0.0.2;branch=z9hG4bKpeer1")
    .header("Max-Forwards", "70")
    .header("From", format!("\"Bob\" <sip:2002@pbx.example.com>;tag={}", from_tag))
    .header("To", to)
    .header("Call-ID", call_id)
    .header("CSeq", format!("{} INVITE", cseq))
    .header("Contact", "<sip:2002@10.0.0.2:5060;transport=ws>")
    .body("application/sdp", PEER_SDP)
    .to_wire()
}

/// In-dialog request from the peer (BYE, CANCEL, ...)
pub fn peer_request(method: &str, call_id: &str, from_tag: &str, to_tag: Option<&str>, cseq: u32) -> String {
    let to = match to_tag {
        Some(tag) => format!("<sip:alice@pbx.example.com>;tag={}", tag),
        None => "<sip:alice@pbx.example.com>".to_string(),
    };
    format!(
        "{method} sip:alice@abc.invalid;transport=ws SIP/2.0\r\n\
         Via: SIP/2.0/WSS 10.0.0.2;branch=z9hG4bKpeer{cseq}\r\n\
         Max-Forwards: 70\r\n\
         From: \"Bob\" <sip:2002@pbx.example.com>;tag={from_tag}\r\n\
         To: {to}\r\n\
         Call-ID: {call_id}\r\n\
         CSeq: {cseq} {method}\r\n\
         Content-Length: 0\r\n\r\n"
    )
}
