//! SIP user agent protocol layer (RFC 3261 over RFC 7118 WebSocket)
//!
//! ```text
//! ┌─────────────────────────┐
//! │   Engine (application)  │
//! └───────────┬─────────────┘
//!             │
//! ┌───────────▼─────────────┐
//! │  Builders / Dialogs     │
//! │  Digest authentication  │
//! └───────────┬─────────────┘
//!             │
//! ┌───────────▼─────────────┐
//! │    Message codec        │
//! └───────────┬─────────────┘
//!             │
//! ┌───────────▼─────────────┐
//! │   WebSocket transport   │
//! └─────────────────────────┘
//! ```

pub mod auth;
pub mod builder;
pub mod dialog;
pub mod message;
pub mod transport;

pub use auth::{AuthorizationHeader, ChallengeKind, Credentials, DigestAuthenticator, DigestChallenge};
pub use builder::LocalEndpoint;
pub use dialog::{CSeqCounter, DialogContext, DialogId, RegistrationContext};
pub use message::{HeaderMap, ParsedMessage, SipError, SipMessage, SipMethod};
pub use transport::{
    ReconnectPolicy, SipConnection, SipConnector, TransportEvent, TransportSink, WsConnector,
};
