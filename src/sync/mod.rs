//! Real-time synchronization for the shared pad.
//!
//! This module owns the wire protocol, the session registry mapping logical
//! users to live connections, the caret presence relay, and the hub that
//! routes inbound messages to the document store and fans results back out.

pub mod presence;
pub mod protocol;
pub mod registry;
pub mod server;

pub use server::CollabServer;

/// Client-chosen logical user identifier.
pub type UserId = String;

/// Transport-assigned connection identifier.
pub type ConnId = String;

/// Minimum length of a client-chosen user id, in characters.
pub const MIN_USER_ID_LEN: usize = 5;
