//! WebRTC media session
//!
//! Wraps one peer connection with a single local audio track. SDP goes in
//! and out as plain strings; the SIP side never sees `webrtc` types.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS};
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_gathering_state::RTCIceGatheringState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::policy::bundle_policy::RTCBundlePolicy;
use webrtc::peer_connection::policy::rtcp_mux_policy::RTCRtcpMuxPolicy;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

pub const DEFAULT_STUN_SERVERS: [&str; 2] = [
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
];

#[derive(Error, Debug)]
pub enum MediaError {
    #[error("WebRTC error: {0}")]
    WebRtc(#[from] webrtc::Error),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Session disposed")]
    Disposed,
}

/// Role of a remote description
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdpKind {
    Offer,
    Answer,
    /// Early media in 180/183
    ProvisionalAnswer,
}

/// Connection state reported by the peer connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl MediaConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaConnectionState::New => "new",
            MediaConnectionState::Connecting => "connecting",
            MediaConnectionState::Connected => "connected",
            MediaConnectionState::Disconnected => "disconnected",
            MediaConnectionState::Failed => "failed",
            MediaConnectionState::Closed => "closed",
        }
    }
}

impl From<RTCPeerConnectionState> for MediaConnectionState {
    fn from(state: RTCPeerConnectionState) -> Self {
        match state {
            RTCPeerConnectionState::Connecting => MediaConnectionState::Connecting,
            RTCPeerConnectionState::Connected => MediaConnectionState::Connected,
            RTCPeerConnectionState::Disconnected => MediaConnectionState::Disconnected,
            RTCPeerConnectionState::Failed => MediaConnectionState::Failed,
            RTCPeerConnectionState::Closed => MediaConnectionState::Closed,
            _ => MediaConnectionState::New,
        }
    }
}

/// Event forwarded from WebRTC callbacks into the engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaEvent {
    /// Call the session was created for
    pub call_generation: u64,
    pub state: MediaConnectionState,
}

/// Per-call session parameters
#[derive(Debug, Clone)]
pub struct MediaConfig {
    pub stun_servers: Vec<String>,
    pub call_generation: u64,
    pub events: mpsc::UnboundedSender<MediaEvent>,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MediaSession: Send + Sync {
    /// Create an offer and set it as local description
    async fn create_offer(&self) -> Result<String, MediaError>;

    /// Create an answer to the applied remote offer and set it locally
    async fn create_answer(&self) -> Result<String, MediaError>;

    async fn set_remote(&self, sdp: &str, kind: SdpKind) -> Result<(), MediaError>;

    /// Wait for ICE gathering, then return the local description with the
    /// candidates gathered so far
    async fn wait_ice_gathering(&self, timeout: Duration) -> Option<String>;

    /// Mute is a disabled track
    async fn set_track_enabled(&self, enabled: bool) -> Result<(), MediaError>;

    /// Close the peer connection; safe to call more than once
    async fn dispose(&self);
}

#[async_trait]
pub trait MediaFactory: Send + Sync {
    async fn setup(&self, config: &MediaConfig) -> Result<Arc<dyn MediaSession>, MediaError>;
}

/// Factory backed by the `webrtc` crate
#[derive(Debug, Clone, Default)]
pub struct WebRtcMediaFactory;

impl WebRtcMediaFactory {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl MediaFactory for WebRtcMediaFactory {
    async fn setup(&self, config: &MediaConfig) -> Result<Arc<dyn MediaSession>, MediaError> {
        let session = WebRtcMediaSession::new(config).await?;
        Ok(Arc::new(session))
    }
}

pub struct WebRtcMediaSession {
    peer: Arc<RTCPeerConnection>,
    track: Arc<TrackLocalStaticSample>,
    sender: Arc<RTCRtpSender>,
    /// Armed before every `set_local_description`
    gathering: Mutex<Option<mpsc::Receiver<()>>>,
    disposed: Mutex<bool>,
}

impl WebRtcMediaSession {
    pub async fn new(config: &MediaConfig) -> Result<Self, MediaError> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;

        let registry = register_default_interceptors(Registry::new(), &mut media_engine)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let urls = if config.stun_servers.is_empty() {
            DEFAULT_STUN_SERVERS.iter().map(|s| s.to_string()).collect()
        } else {
            config.stun_servers.clone()
        };

        let rtc_config = RTCConfiguration {
            ice_servers: vec![RTCIceServer {
                urls,
                ..Default::default()
            }],
            bundle_policy: RTCBundlePolicy::MaxBundle,
            rtcp_mux_policy: RTCRtcpMuxPolicy::Require,
            ..Default::default()
        };

        let peer = Arc::new(api.new_peer_connection(rtc_config).await?);

        let track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                clock_rate: 48000,
                channels: 2,
                ..Default::default()
            },
            "audio".to_owned(),
            "wsphone".to_owned(),
        ));

        let sender = peer
            .add_track(Arc::clone(&track) as Arc<dyn TrackLocal + Send + Sync>)
            .await?;

        // Drain RTCP so interceptors keep working
        let rtcp_sender = Arc::clone(&sender);
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            while rtcp_sender.read(&mut buf).await.is_ok() {}
        });

        let events = config.events.clone();
        let call_generation = config.call_generation;
        peer.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            info!("Peer connection state: {}", state);
            let _ = events.send(MediaEvent {
                call_generation,
                state: state.into(),
            });
            Box::pin(async {})
        }));

        debug!("Media session created for call generation {}", call_generation);

        Ok(Self {
            peer,
            track,
            sender,
            gathering: Mutex::new(None),
            disposed: Mutex::new(false),
        })
    }

    async fn ensure_open(&self) -> Result<(), MediaError> {
        if *self.disposed.lock().await {
            return Err(MediaError::Disposed);
        }
        Ok(())
    }

    async fn apply_local(&self, description: RTCSessionDescription) -> Result<String, MediaError> {
        let sdp = description.sdp.clone();
        let gathering = self.peer.gathering_complete_promise().await;
        *self.gathering.lock().await = Some(gathering);
        self.peer.set_local_description(description).await?;
        Ok(sdp)
    }
}

#[async_trait]
impl MediaSession for WebRtcMediaSession {
    async fn create_offer(&self) -> Result<String, MediaError> {
        self.ensure_open().await?;
        let offer = self.peer.create_offer(None).await?;
        self.apply_local(offer).await
    }

    async fn create_answer(&self) -> Result<String, MediaError> {
        self.ensure_open().await?;
        if self.peer.remote_description().await.is_none() {
            return Err(MediaError::InvalidState(
                "no remote offer to answer".to_string(),
            ));
        }
        let answer = self.peer.create_answer(None).await?;
        self.apply_local(answer).await
    }

    async fn set_remote(&self, sdp: &str, kind: SdpKind) -> Result<(), MediaError> {
        self.ensure_open().await?;
        let sdp = sdp.to_string();
        let description = match kind {
            SdpKind::Offer => RTCSessionDescription::offer(sdp)?,
            SdpKind::Answer => RTCSessionDescription::answer(sdp)?,
            SdpKind::ProvisionalAnswer => RTCSessionDescription::pranswer(sdp)?,
        };
        self.peer.set_remote_description(description).await?;
        Ok(())
    }

    async fn wait_ice_gathering(&self, timeout: Duration) -> Option<String> {
        if self.peer.ice_gathering_state() != RTCIceGatheringState::Complete {
            let receiver = self.gathering.lock().await.take();
            if let Some(mut receiver) = receiver {
                if tokio::time::timeout(timeout, receiver.recv()).await.is_err() {
                    warn!(
                        "ICE gathering not complete after {:?}, using candidates so far",
                        timeout
                    );
                }
            }
        }
        self.peer.local_description().await.map(|d| d.sdp)
    }

    async fn set_track_enabled(&self, enabled: bool) -> Result<(), MediaError> {
        self.ensure_open().await?;
        let track = if enabled {
            Some(Arc::clone(&self.track) as Arc<dyn TrackLocal + Send + Sync>)
        } else {
            None
        };
        self.sender.replace_track(track).await?;
        debug!("Local audio track {}", if enabled { "enabled" } else { "disabled" });
        Ok(())
    }

    async fn dispose(&self) {
        let mut disposed = self.disposed.lock().await;
        if *disposed {
            return;
        }
        *disposed = true;
        if let Err(e) = self.peer.close().await {
            warn!("Error closing peer connection: {}", e);
        }
        info!("Media session disposed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_state_mapping() {
        assert_eq!(
            MediaConnectionState::from(RTCPeerConnectionState::Connected),
            MediaConnectionState::Connected
        );
        assert_eq!(
            MediaConnectionState::from(RTCPeerConnectionState::Failed),
            MediaConnectionState::Failed
        );
        assert_eq!(
            MediaConnectionState::from(RTCPeerConnectionState::Unspecified),
            MediaConnectionState::New
        );
        assert_eq!(MediaConnectionState::Disconnected.as_str(), "disconnected");
    }

    #[tokio::test]
    async fn test_offer_then_dispose() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let config = MediaConfig {
            stun_servers: Vec::new(),
            call_generation: 1,
            events: tx,
        };
        let session = WebRtcMediaFactory::new().setup(&config).await.unwrap();

        let offer = session.create_offer().await.unwrap();
        assert!(offer.contains("m=audio"));
        assert!(offer.contains("opus/48000/2"));

        session.set_track_enabled(false).await.unwrap();
        session.set_track_enabled(true).await.unwrap();

        session.dispose().await;
        session.dispose().await;
        assert!(matches!(
            session.create_offer().await,
            Err(MediaError::Disposed)
        ));
    }

    #[tokio::test]
    async fn test_answer_requires_remote_offer() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let config = MediaConfig {
            stun_servers: vec!["stun:stun.l.google.com:19302".to_string()],
            call_generation: 2,
            events: tx,
        };
        let session = WebRtcMediaSession::new(&config).await.unwrap();
        assert!(matches!(
            session.create_answer().await,
            Err(MediaError::InvalidState(_))
        ));
        session.dispose().await;
    }
}
