//! Conversation data model and snapshot schema
//!
//! These are the wire-shaped records shared by producer and consumer. Field
//! names are camelCase on the wire; timestamps are RFC 3339.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

macro_rules! string_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(
            Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Wrap an identifier received from the server
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Get the inner string
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// True when the identifier is empty or whitespace
            pub fn is_blank(&self) -> bool {
                self.0.trim().is_empty()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                Self(id.to_string())
            }
        }

        impl From<String> for $name {
            fn from(id: String) -> Self {
                Self(id)
            }
        }
    };
}

string_id!(
    /// Conversation identifier
    ConversationId
);
string_id!(
    /// Message identifier
    MessageId
);
string_id!(
    /// Block identifier, unique within a message
    BlockId
);
string_id!(
    /// Prompt identifier used to correlate prompt and tool-call events
    PromptId
);
string_id!(
    /// Tool call identifier
    ToolCallId
);

/// Message author
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Human user
    User,
    /// Model output
    Assistant,
    /// System instructions or notices
    System,
}

/// Message lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    /// Created, not yet scheduled
    Pending,
    /// Waiting behind another prompt
    Queued,
    /// A response is being generated
    Processing,
    /// Response finished
    Completed,
    /// Response failed
    Failed,
}

impl MessageStatus {
    /// Wire name of the status
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageStatus::Pending => "pending",
            MessageStatus::Queued => "queued",
            MessageStatus::Processing => "processing",
            MessageStatus::Completed => "completed",
            MessageStatus::Failed => "failed",
        }
    }
}

/// Kind of renderable content a block holds
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockType {
    /// Plain assistant or user text
    #[default]
    Text,
    /// A tool invocation
    ToolUse,
    /// The result of a tool invocation
    ToolResult,
    /// Hidden reasoning
    Thinking,
}

/// Conversation header record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    /// Conversation identifier
    pub id: ConversationId,
    /// Title, unset until the server names the conversation
    #[serde(default)]
    pub title: Option<String>,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Last update time
    pub updated_at: DateTime<Utc>,
}

/// Structured block metadata
///
/// Keys the engine does not interpret are kept in `extra` so they survive a
/// round trip through the reducer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockMetadata {
    /// Tool name for tool-bearing blocks
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    /// Identifier of the tool call this block carries
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<ToolCallId>,
    /// Tool input parameters
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,
    /// Final tool output
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    /// Tool error message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Tool status (`pending`, `executing`, `completed`, `error`, ...)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    /// Uninterpreted keys
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// One tool invocation, reached through its owning block
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCall {
    /// Tool call identifier
    pub id: ToolCallId,
    /// Owning block, unset until the producer resolves it
    #[serde(default)]
    pub block_id: Option<BlockId>,
    /// Prompt that requested the call
    pub prompt_id: PromptId,
    /// Tool name
    pub tool_name: String,
    /// Producer-defined lifecycle state
    #[serde(default)]
    pub state: String,
    /// Accumulated output
    #[serde(default)]
    pub output: Option<String>,
    /// Input parameters
    #[serde(default)]
    pub input: Value,
    /// Error message for failed calls
    #[serde(default)]
    pub error: Option<String>,
    /// Creation time
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    /// Execution start time
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    /// Completion time
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    /// Deadline after which the sandbox gives up
    #[serde(default)]
    pub timeout_at: Option<DateTime<Utc>>,
}

/// Unit of renderable content within a message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Block {
    /// Block identifier
    pub id: BlockId,
    /// Owning message (nested blocks may omit it)
    #[serde(default)]
    pub message_id: MessageId,
    /// Block type
    #[serde(rename = "type", default)]
    pub block_type: BlockType,
    /// Accumulated content
    #[serde(default)]
    pub content: String,
    /// Server-side order key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<i64>,
    /// Structured metadata
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<BlockMetadata>,
    /// Embedded tool call
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call: Option<ToolCall>,
}

impl Block {
    /// Create an empty block of the given type
    pub fn empty(id: BlockId, message_id: MessageId, block_type: BlockType) -> Self {
        Self {
            id,
            message_id,
            block_type,
            content: String::new(),
            position: None,
            metadata: None,
            tool_call: None,
        }
    }
}

/// Chat message with its ordered blocks
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Message identifier
    pub id: MessageId,
    /// Parent conversation
    pub conversation_id: ConversationId,
    /// Author role
    pub role: Role,
    /// Lifecycle status, unset for plain snapshot messages
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<MessageStatus>,
    /// Prompt that produced this message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_id: Option<PromptId>,
    /// Model that produced this message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Last update time
    pub updated_at: DateTime<Utc>,
    /// Ordered blocks
    #[serde(default)]
    pub blocks: Vec<Block>,
}

/// Prompt lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PromptStatus {
    /// Waiting for a worker
    Queued,
    /// Response is streaming
    Streaming,
    /// Response finished
    Completed,
    /// Response failed
    Failed,
}

/// Transient prompt record used only for correlation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Prompt {
    /// Prompt identifier
    pub id: PromptId,
    /// Owning conversation
    pub conversation_id: ConversationId,
    /// Message the prompt answers into
    pub message_id: MessageId,
    /// Prompt status
    pub status: PromptStatus,
    /// Model selected for the prompt
    #[serde(default)]
    pub model: Option<String>,
    /// Failure message
    #[serde(default)]
    pub error: Option<String>,
}

/// Complete materialization of a conversation at subscribe time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationSnapshot {
    /// Conversation header
    pub conversation: Conversation,
    /// Messages in any order
    #[serde(default)]
    pub messages: Vec<Message>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn snapshot_decodes_camel_case_wire_shape() {
        let snapshot: ConversationSnapshot = serde_json::from_value(json!({
            "conversation": {
                "id": "c1",
                "title": null,
                "createdAt": "2024-05-01T10:00:00Z",
                "updatedAt": "2024-05-01T10:00:00Z"
            },
            "messages": [{
                "id": "m1",
                "conversationId": "c1",
                "role": "user",
                "createdAt": "2024-05-01T10:00:01Z",
                "updatedAt": "2024-05-01T10:00:01Z",
                "blocks": [{ "id": "b1", "type": "text", "content": "Hello" }]
            }]
        }))
        .unwrap();

        assert_eq!(snapshot.conversation.id.as_str(), "c1");
        assert!(snapshot.conversation.title.is_none());
        let message = &snapshot.messages[0];
        assert_eq!(message.role, Role::User);
        assert!(message.status.is_none());
        assert_eq!(message.blocks[0].content, "Hello");
        assert_eq!(message.blocks[0].block_type, BlockType::Text);
    }

    #[test]
    fn block_metadata_keeps_unknown_keys() {
        let metadata: BlockMetadata = serde_json::from_value(json!({
            "toolName": "bash",
            "toolCallId": "t1",
            "exitCode": 0
        }))
        .unwrap();

        assert_eq!(metadata.tool_name.as_deref(), Some("bash"));
        assert_eq!(metadata.tool_call_id, Some(ToolCallId::new("t1")));
        assert_eq!(metadata.extra.get("exitCode"), Some(&json!(0)));

        let encoded = serde_json::to_value(&metadata).unwrap();
        assert_eq!(encoded["exitCode"], json!(0));
        assert!(encoded.get("output").is_none());
    }

    #[test]
    fn blank_ids_are_detected() {
        assert!(ConversationId::new("  ").is_blank());
        assert!(!ConversationId::new("c1").is_blank());
    }
}
