//! Domain layer - call and registration state
//!
//! This layer contains the value objects and entities observed by the
//! surrounding application. It has no knowledge of SIP wire formats.

pub mod call;
pub mod registration;
pub mod shared;

// Re-export commonly used types
pub use call::{CallDirection, CallInfo, CallState, EndReason};
pub use registration::RegistrationState;
pub use shared::{DomainError, Result};
