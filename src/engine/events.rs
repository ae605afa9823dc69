//! Closed event vocabulary
//!
//! Each event carries only the fields its state transition needs. Decoding
//! fails closed: an unknown `type` is an error, never a silently dropped
//! event, because a dropped event would desynchronize client and server for
//! the rest of the conversation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use super::error::VocabularyError;
use super::model::{
    BlockId, BlockType, ConversationId, Message, MessageId, Prompt, ToolCall, ToolCallId,
};

/// One incremental update to materialize on top of a snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ConversationEvent {
    /// A message was created
    MessageCreated {
        /// Full message
        message: Message,
    },

    /// A message changed; carries the full message
    MessageUpdated {
        /// Full message
        message: Message,
    },

    /// A prompt started generating
    PromptStarted {
        /// Prompt record
        prompt: Prompt,
    },

    /// A prompt finished
    PromptCompleted {
        /// Prompt record
        prompt: Prompt,
    },

    /// A prompt failed
    #[serde(rename_all = "camelCase")]
    PromptFailed {
        /// Prompt record
        prompt: Prompt,
        /// Failure message
        #[serde(default)]
        error: Option<String>,
    },

    /// A block opened
    #[serde(rename_all = "camelCase")]
    BlockStart {
        /// Owning message
        message_id: MessageId,
        /// New block
        block_id: BlockId,
        /// Block type, `text` when omitted
        #[serde(default)]
        block_type: Option<BlockType>,
    },

    /// Content appended to a block
    #[serde(rename_all = "camelCase")]
    BlockDelta {
        /// Owning message
        message_id: MessageId,
        /// Target block
        block_id: BlockId,
        /// Fragment to append
        delta: String,
    },

    /// A block closed (framing only)
    #[serde(rename_all = "camelCase")]
    BlockEnd {
        /// Owning message
        message_id: MessageId,
        /// Closed block
        block_id: BlockId,
    },

    /// A tool call started executing
    #[serde(rename_all = "camelCase")]
    ToolCallStarted {
        /// Tool call record
        tool_call: ToolCall,
        /// Raw tool input
        #[serde(default)]
        input: Option<Value>,
    },

    /// A tool call produced output
    #[serde(rename_all = "camelCase")]
    ToolCallProgress {
        /// Tool call the output belongs to
        tool_call_id: ToolCallId,
        /// Output fragment to append
        output: String,
    },

    /// A tool call finished
    #[serde(rename_all = "camelCase")]
    ToolCallCompleted {
        /// Tool call record with final output
        tool_call: ToolCall,
    },

    /// A tool call failed
    #[serde(rename_all = "camelCase")]
    ToolCallFailed {
        /// Tool call record
        tool_call: ToolCall,
        /// Failure message
        #[serde(default)]
        error: Option<String>,
    },

    /// Conversation header changed
    #[serde(rename_all = "camelCase")]
    ConversationUpdated {
        /// Conversation the patch targets
        #[serde(default)]
        conversation_id: Option<ConversationId>,
        /// New title
        #[serde(default)]
        title: Option<String>,
        /// New update time
        #[serde(default)]
        updated_at: Option<DateTime<Utc>>,
    },
}

/// Discriminator of [`ConversationEvent`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// `message-created`
    MessageCreated,
    /// `message-updated`
    MessageUpdated,
    /// `prompt-started`
    PromptStarted,
    /// `prompt-completed`
    PromptCompleted,
    /// `prompt-failed`
    PromptFailed,
    /// `block-start`
    BlockStart,
    /// `block-delta`
    BlockDelta,
    /// `block-end`
    BlockEnd,
    /// `tool-call-started`
    ToolCallStarted,
    /// `tool-call-progress`
    ToolCallProgress,
    /// `tool-call-completed`
    ToolCallCompleted,
    /// `tool-call-failed`
    ToolCallFailed,
    /// `conversation-updated`
    ConversationUpdated,
}

impl EventKind {
    /// Every kind in the vocabulary
    pub const ALL: [EventKind; 13] = [
        EventKind::MessageCreated,
        EventKind::MessageUpdated,
        EventKind::PromptStarted,
        EventKind::PromptCompleted,
        EventKind::PromptFailed,
        EventKind::BlockStart,
        EventKind::BlockDelta,
        EventKind::BlockEnd,
        EventKind::ToolCallStarted,
        EventKind::ToolCallProgress,
        EventKind::ToolCallCompleted,
        EventKind::ToolCallFailed,
        EventKind::ConversationUpdated,
    ];

    /// Wire name of the kind
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::MessageCreated => "message-created",
            EventKind::MessageUpdated => "message-updated",
            EventKind::PromptStarted => "prompt-started",
            EventKind::PromptCompleted => "prompt-completed",
            EventKind::PromptFailed => "prompt-failed",
            EventKind::BlockStart => "block-start",
            EventKind::BlockDelta => "block-delta",
            EventKind::BlockEnd => "block-end",
            EventKind::ToolCallStarted => "tool-call-started",
            EventKind::ToolCallProgress => "tool-call-progress",
            EventKind::ToolCallCompleted => "tool-call-completed",
            EventKind::ToolCallFailed => "tool-call-failed",
            EventKind::ConversationUpdated => "conversation-updated",
        }
    }

    /// Parse a wire name
    pub fn parse(name: &str) -> Option<EventKind> {
        EventKind::ALL.into_iter().find(|kind| kind.as_str() == name)
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl ConversationEvent {
    /// Decode one event, failing closed on kinds outside the vocabulary
    pub fn decode(value: Value) -> Result<Self, VocabularyError> {
        let kind = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or(VocabularyError::MissingKind)?;

        let kind = EventKind::parse(kind)
            .ok_or_else(|| VocabularyError::UnknownKind(kind.to_string()))?;

        serde_json::from_value(value).map_err(|err| VocabularyError::Malformed {
            kind: kind.as_str().to_string(),
            detail: err.to_string(),
        })
    }

    /// Discriminator of this event
    pub fn kind(&self) -> EventKind {
        match self {
            ConversationEvent::MessageCreated { .. } => EventKind::MessageCreated,
            ConversationEvent::MessageUpdated { .. } => EventKind::MessageUpdated,
            ConversationEvent::PromptStarted { .. } => EventKind::PromptStarted,
            ConversationEvent::PromptCompleted { .. } => EventKind::PromptCompleted,
            ConversationEvent::PromptFailed { .. } => EventKind::PromptFailed,
            ConversationEvent::BlockStart { .. } => EventKind::BlockStart,
            ConversationEvent::BlockDelta { .. } => EventKind::BlockDelta,
            ConversationEvent::BlockEnd { .. } => EventKind::BlockEnd,
            ConversationEvent::ToolCallStarted { .. } => EventKind::ToolCallStarted,
            ConversationEvent::ToolCallProgress { .. } => EventKind::ToolCallProgress,
            ConversationEvent::ToolCallCompleted { .. } => EventKind::ToolCallCompleted,
            ConversationEvent::ToolCallFailed { .. } => EventKind::ToolCallFailed,
            ConversationEvent::ConversationUpdated { .. } => EventKind::ConversationUpdated,
        }
    }

    /// Message this event names directly, if any
    pub fn message_id(&self) -> Option<&MessageId> {
        match self {
            ConversationEvent::MessageCreated { message }
            | ConversationEvent::MessageUpdated { message } => Some(&message.id),
            ConversationEvent::PromptStarted { prompt }
            | ConversationEvent::PromptCompleted { prompt }
            | ConversationEvent::PromptFailed { prompt, .. } => Some(&prompt.message_id),
            ConversationEvent::BlockStart { message_id, .. }
            | ConversationEvent::BlockDelta { message_id, .. }
            | ConversationEvent::BlockEnd { message_id, .. } => Some(message_id),
            ConversationEvent::ToolCallStarted { .. }
            | ConversationEvent::ToolCallProgress { .. }
            | ConversationEvent::ToolCallCompleted { .. }
            | ConversationEvent::ToolCallFailed { .. }
            | ConversationEvent::ConversationUpdated { .. } => None,
        }
    }
}
