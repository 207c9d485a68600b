//! Caret presence relay.
//!
//! Cursor frames are ephemeral: validated, annotated with the sender's
//! identity, fanned out to peers, and never stored. Coordinates are
//! client-pixel-relative to the editor container; the server makes no
//! geometry assumptions and performs no rate limiting (clients debounce
//! locally).

use super::protocol::{ServerMessage, UserSummary};

/// A caret report from a client, in editor-local pixel space.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CursorFrame {
    pub x: f64,
    pub y: f64,
    pub height: f64,
    pub is_image: bool,
}

impl CursorFrame {
    /// Accept only finite coordinates; NaN and infinities are dropped
    /// before they reach peers.
    pub fn validate(x: f64, y: f64, height: f64, is_image: bool) -> Option<Self> {
        if x.is_finite() && y.is_finite() && height.is_finite() {
            Some(Self {
                x,
                y,
                height,
                is_image,
            })
        } else {
            None
        }
    }

    /// Stamp the frame with the sender's identity for rebroadcast.
    pub fn annotate(&self, user_id: &str, who: &UserSummary) -> ServerMessage {
        ServerMessage::CursorMove {
            user_id: user_id.to_string(),
            name: who.name.clone(),
            color: who.color.clone(),
            x: self.x,
            y: self.y,
            height: self.height,
            is_image: self.is_image,
        }
    }
}
