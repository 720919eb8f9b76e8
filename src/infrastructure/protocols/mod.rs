//! Signaling and media protocols
pub mod sip;
pub mod webrtc;
