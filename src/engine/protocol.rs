//! Wire frames for the conversation subscription protocol.
//!
//! Frames are newline-delimited JSON objects with a `type` discriminator. The
//! client sends `subscribe`; the server answers `subscribed`, exactly one
//! `snapshot`, then `event` frames until the connection closes. `error` frames
//! may arrive at any point.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::error::TransportError;
use super::events::ConversationEvent;
use super::model::{ConversationId, ConversationSnapshot};

/// Frames sent by the client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientFrame {
    /// Request a snapshot plus live events for one conversation
    #[serde(rename_all = "camelCase")]
    Subscribe {
        /// Conversation to follow
        conversation_id: ConversationId,
        /// Subscribing user
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user_id: Option<String>,
    },
}

/// Frames sent by the server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerFrame {
    /// Subscription acknowledgment
    #[serde(rename_all = "camelCase")]
    Subscribed {
        /// Acknowledged conversation
        #[serde(default, skip_serializing_if = "Option::is_none")]
        conversation_id: Option<ConversationId>,
    },

    /// Full conversation state at subscribe time
    #[serde(rename_all = "camelCase")]
    Snapshot {
        /// Conversation the snapshot belongs to (defaults to the snapshot's own id)
        #[serde(default, skip_serializing_if = "Option::is_none")]
        conversation_id: Option<ConversationId>,
        /// Snapshot payload
        snapshot: ConversationSnapshot,
    },

    /// One vocabulary event, kept raw until the adapter decodes it
    #[serde(rename_all = "camelCase")]
    Event {
        /// Conversation the event belongs to
        #[serde(default, skip_serializing_if = "Option::is_none")]
        conversation_id: Option<ConversationId>,
        /// Undecoded event
        event: Value,
    },

    /// Server-side failure
    #[serde(rename_all = "camelCase")]
    Error {
        /// Conversation the error concerns, unset for connection-wide errors
        #[serde(default, skip_serializing_if = "Option::is_none")]
        conversation_id: Option<ConversationId>,
        /// Human-readable message
        message: String,
    },
}

impl ServerFrame {
    /// Build an event frame from a typed event
    pub fn event(
        conversation_id: &ConversationId,
        event: &ConversationEvent,
    ) -> Result<Self, serde_json::Error> {
        Ok(ServerFrame::Event {
            conversation_id: Some(conversation_id.clone()),
            event: serde_json::to_value(event)?,
        })
    }

    /// Frame type name
    pub fn name(&self) -> &'static str {
        match self {
            ServerFrame::Subscribed { .. } => "subscribed",
            ServerFrame::Snapshot { .. } => "snapshot",
            ServerFrame::Event { .. } => "event",
            ServerFrame::Error { .. } => "error",
        }
    }

    /// Conversation this frame is addressed to, when it says
    pub fn conversation_id(&self) -> Option<&ConversationId> {
        match self {
            ServerFrame::Snapshot {
                conversation_id,
                snapshot,
            } => conversation_id
                .as_ref()
                .or(Some(&snapshot.conversation.id)),
            ServerFrame::Subscribed { conversation_id }
            | ServerFrame::Event {
                conversation_id, ..
            }
            | ServerFrame::Error {
                conversation_id, ..
            } => conversation_id.as_ref(),
        }
    }

    /// True when this frame belongs to `target` on a shared transport
    ///
    /// Frames that do not name a conversation are addressed to every
    /// subscriber on the connection.
    pub fn is_for(&self, target: &ConversationId) -> bool {
        self.conversation_id().is_none_or(|id| id == target)
    }
}

/// Parse one NDJSON line into a server frame
pub fn decode_server_frame(line: &str) -> Result<ServerFrame, TransportError> {
    serde_json::from_str(line).map_err(|err| TransportError::MalformedFrame(err.to_string()))
}

/// Serialize a frame as one NDJSON line, newline included
pub fn encode_frame<T: Serialize>(frame: &T) -> Result<Vec<u8>, serde_json::Error> {
    let mut payload = serde_json::to_vec(frame)?;
    payload.push(b'\n');
    Ok(payload)
}
