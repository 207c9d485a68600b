//! JSON wire protocol between the editor shell and the pad server.
//!
//! Messages travel as WebSocket text frames. The variant tag rides in a
//! `"type"` field and all names are camelCase so they line up with the
//! client shell's dispatch table. Both directions enforce a per-frame size
//! ceiling; the codec never panics on hostile input.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::UserId;

/// Per-frame payload ceiling (2 MiB), matching the transport limit the
/// client shell assumes.
pub const MAX_FRAME_SIZE: usize = 2 * 1024 * 1024;

#[derive(Debug, Clone, Error)]
pub enum ProtocolError {
    #[error("frame too large: {0} bytes")]
    FrameTooLarge(usize),

    #[error("malformed frame: {0}")]
    Malformed(String),
}

/// Messages sent from client to server.
///
/// Identification fields are optional at the wire level so that an
/// incomplete `userJoined` still parses and can be answered with a
/// disconnect instead of being silently dropped.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    /// Identify this connection as a logical user.
    UserJoined {
        user_id: Option<String>,
        name: Option<String>,
        color: Option<String>,
    },

    /// Apply a textual patch to the shared document.
    ApplyPatch { patch: Option<String> },

    /// Submit an inline image for optimization.
    UploadImage {
        placeholder_id: String,
        base64_data: String,
    },

    /// Report the local caret position.
    CursorMove {
        x: f64,
        y: f64,
        height: f64,
        #[serde(default)]
        is_image: bool,
    },

    /// Ask for a fresh copy of the whole document.
    RequestFullSync { reason: Option<String> },
}

/// Messages sent from server to client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    /// Full document state plus the other connected users.
    Init {
        content: String,
        users: HashMap<UserId, UserSummary>,
    },

    /// A peer's accepted patch, relayed to everyone but the sender.
    ApplyPatch { patch: String, sender_id: UserId },

    /// The submitter's last patch is committed server-side.
    ContentAcknowledged,

    /// The submitter's patch violated a hard limit.
    PatchRejected { reason: String },

    /// The submitter should request a full resync.
    RequestFullSync { reason: String },

    /// Outcome of one image submission, keyed by the placeholder id.
    ImageProcessed {
        placeholder_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        optimized_base64: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    /// A peer's caret, annotated with their identity.
    CursorMove {
        user_id: UserId,
        name: String,
        color: String,
        x: f64,
        y: f64,
        height: f64,
        is_image: bool,
    },

    /// A peer joined the pad.
    UserJoined {
        user_id: UserId,
        name: String,
        color: String,
    },

    /// A peer left the pad.
    UserLeft { user_id: UserId },

    /// The server is going away.
    ServerShutdown { message: String },
}

/// Identity summary of a connected user, as carried in `init`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserSummary {
    pub name: String,
    pub color: String,
}

/// Decode one inbound text frame.
pub fn decode_client(text: &str) -> Result<ClientMessage, ProtocolError> {
    if text.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(text.len()));
    }
    serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))
}

/// Encode one outbound message as a text frame.
pub fn encode_server(msg: &ServerMessage) -> Result<String, ProtocolError> {
    let text = serde_json::to_string(msg).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
    if text.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(text.len()));
    }
    Ok(text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_user_joined() {
        let msg = decode_client(
            r##"{"type":"userJoined","userId":"u00001","name":"Alice","color":"#f00"}"##,
        )
        .unwrap();
        match msg {
            ClientMessage::UserJoined {
                user_id,
                name,
                color,
            } => {
                assert_eq!(user_id.as_deref(), Some("u00001"));
                assert_eq!(name.as_deref(), Some("Alice"));
                assert_eq!(color.as_deref(), Some("#f00"));
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn user_joined_fields_may_be_missing() {
        let msg = decode_client(r#"{"type":"userJoined","userId":"u00001"}"#).unwrap();
        match msg {
            ClientMessage::UserJoined { name, color, .. } => {
                assert!(name.is_none());
                assert!(color.is_none());
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn cursor_move_defaults_is_image() {
        let msg =
            decode_client(r#"{"type":"cursorMove","x":10.5,"y":20.0,"height":18.0}"#).unwrap();
        match msg {
            ClientMessage::CursorMove { is_image, .. } => assert!(!is_image),
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn rejects_unknown_type() {
        assert!(matches!(
            decode_client(r#"{"type":"teleport","x":1}"#),
            Err(ProtocolError::Malformed(_))
        ));
    }

    #[test]
    fn rejects_oversize_frame() {
        let huge = format!(
            r#"{{"type":"applyPatch","patch":"{}"}}"#,
            "a".repeat(MAX_FRAME_SIZE)
        );
        assert!(matches!(
            decode_client(&huge),
            Err(ProtocolError::FrameTooLarge(_))
        ));
    }

    #[test]
    fn encodes_wire_names() {
        let text = encode_server(&ServerMessage::ApplyPatch {
            patch: "@@ -1 +1 @@".to_string(),
            sender_id: "u00001".to_string(),
        })
        .unwrap();
        assert!(text.contains(r#""type":"applyPatch""#));
        assert!(text.contains(r#""senderId":"u00001""#));

        let text = encode_server(&ServerMessage::ContentAcknowledged).unwrap();
        assert_eq!(text, r#"{"type":"contentAcknowledged"}"#);
    }

    #[test]
    fn image_reply_omits_absent_fields() {
        let text = encode_server(&ServerMessage::ImageProcessed {
            placeholder_id: "p1".to_string(),
            optimized_base64: Some("data:image/jpeg;base64,xx".to_string()),
            error: None,
        })
        .unwrap();
        assert!(text.contains(r#""placeholderId":"p1""#));
        assert!(!text.contains("error"));
    }

    #[test]
    fn init_carries_user_map() {
        let mut users = HashMap::new();
        users.insert(
            "u00002".to_string(),
            UserSummary {
                name: "Bob".to_string(),
                color: "#0f0".to_string(),
            },
        );
        let text = encode_server(&ServerMessage::Init {
            content: "<p>hi</p>".to_string(),
            users,
        })
        .unwrap();
        assert!(text.contains(r#""type":"init""#));
        assert!(text.contains(r#""u00002""#));
        assert!(text.contains(r#""name":"Bob""#));
    }
}
