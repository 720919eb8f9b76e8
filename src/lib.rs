//! WsPhone - a SIP user agent over WebSocket with WebRTC media
//!
//! The crate follows a layered layout: `domain` holds call and
//! registration state, `infrastructure` the SIP codec, transport and media
//! session, and `application` the engine that ties them together.

pub mod application;
pub mod config;
pub mod domain;
pub mod infrastructure;

// Re-export commonly used types
pub use application::{AudioFlags, EngineEvent, EngineSnapshot, PhoneEngine};
pub use domain::shared::{DomainError, Result};
