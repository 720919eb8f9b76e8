//! WebRTC media for calls
pub mod sdp;
pub mod session_manager;

pub use sdp::{fallback_sdp, media_direction, mutate_for_hold, MediaDirection};
pub use session_manager::{
    MediaConfig, MediaConnectionState, MediaError, MediaEvent, MediaFactory, MediaSession,
    SdpKind, WebRtcMediaFactory, WebRtcMediaSession,
};
