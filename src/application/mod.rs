//! Application layer - the phone engine
//!
//! This layer drives the SIP and media infrastructure on behalf of the
//! user. It's responsible for:
//! - Serializing every state transition in one actor task
//! - The registration and call state machines
//! - Publishing observable state and events

pub mod call;
pub mod engine;
pub mod events;
pub mod registration;

pub use call::{prepare_local_sdp, PreparedSdp};
pub use engine::{AudioFlags, EngineSnapshot, PhoneEngine};
pub use events::{EngineEvent, EventBroadcaster};
