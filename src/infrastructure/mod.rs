//! Infrastructure layer - Technical implementations
//!
//! This layer contains:
//! - SIP signaling over WebSocket
//! - WebRTC media sessions

pub mod protocols;
