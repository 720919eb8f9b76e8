//! Call bounded context - the single active call and its lifecycle

pub mod entity;
pub mod value_object;

pub use entity::CallInfo;
pub use value_object::{CallDirection, CallState, EndReason};
