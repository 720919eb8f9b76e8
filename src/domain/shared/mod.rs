//! Shared kernel - types used by every layer

pub mod error;

pub use error::{DomainError, Result};
