//! Projection from reducer state to the immutable view model.
//!
//! Recomputed in full on every transition. Tool-bearing blocks surface as
//! [`BlockView::Tool`] with their metadata lifted into typed fields.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::fmt::Write as _;

use super::model::{
    Block, BlockId, BlockType, Conversation, MessageId, MessageStatus, PromptId, Role, ToolCallId,
};
use super::reducer::{ConversationState, MessageRecord};

/// Read-only conversation view
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConversationView {
    /// Conversation header
    pub conversation: Conversation,
    /// Messages in display order
    pub messages: Vec<MessageView>,
}

/// Read-only message view
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageView {
    /// Message identifier
    pub id: MessageId,
    /// Author role
    pub role: Role,
    /// Lifecycle status
    pub status: Option<MessageStatus>,
    /// Correlated prompt
    pub prompt_id: Option<PromptId>,
    /// Producing model
    pub model: Option<String>,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Last update time
    pub updated_at: DateTime<Utc>,
    /// Blocks in display order
    pub blocks: Vec<BlockView>,
}

/// Read-only block view
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BlockView {
    /// Plain text
    Text {
        /// Block identifier
        id: BlockId,
        /// Text content
        content: String,
    },
    /// Hidden reasoning
    Thinking {
        /// Block identifier
        id: BlockId,
        /// Reasoning content
        content: String,
    },
    /// Tool invocation or result
    Tool(ToolView),
}

/// Tool-bearing block
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolView {
    /// Block identifier
    pub id: BlockId,
    /// `tool_use` or `tool_result` (or text that gained tool metadata)
    pub block_type: BlockType,
    /// Tool name, once known
    pub tool_name: Option<String>,
    /// Tool call identifier, once known
    pub tool_call_id: Option<ToolCallId>,
    /// Input parameters
    pub input: Option<Value>,
    /// Output accumulated so far, or the final output
    pub output: String,
    /// Error message for failed calls
    pub error: Option<String>,
    /// Tool status
    pub status: Option<String>,
}

impl BlockView {
    /// Block identifier
    pub fn id(&self) -> &BlockId {
        match self {
            BlockView::Text { id, .. } | BlockView::Thinking { id, .. } => id,
            BlockView::Tool(tool) => &tool.id,
        }
    }
}

impl ConversationView {
    /// Look up a message view
    pub fn message(&self, id: &MessageId) -> Option<&MessageView> {
        self.messages.iter().find(|message| &message.id == id)
    }

    /// True while any assistant message is processing
    pub fn is_streaming(&self) -> bool {
        self.messages.iter().any(|message| {
            message.role == Role::Assistant && message.status == Some(MessageStatus::Processing)
        })
    }

    /// Plain-text transcript
    pub fn render_plain(&self) -> String {
        let mut out = String::new();
        let title = self
            .conversation
            .title
            .as_deref()
            .unwrap_or("(untitled)");
        let _ = writeln!(out, "# {title}");

        for message in &self.messages {
            let role = match message.role {
                Role::User => "user",
                Role::Assistant => "assistant",
                Role::System => "system",
            };
            match message.status {
                Some(status) => {
                    let _ = writeln!(out, "\n[{role}, {}]", status.as_str());
                }
                None => {
                    let _ = writeln!(out, "\n[{role}]");
                }
            }

            for block in &message.blocks {
                match block {
                    BlockView::Text { content, .. } => {
                        let _ = writeln!(out, "{content}");
                    }
                    BlockView::Thinking { content, .. } => {
                        for line in content.lines() {
                            let _ = writeln!(out, "> {line}");
                        }
                    }
                    BlockView::Tool(tool) => {
                        let name = tool.tool_name.as_deref().unwrap_or("tool");
                        let status = tool.status.as_deref().unwrap_or("pending");
                        let input = tool
                            .input
                            .as_ref()
                            .map(Value::to_string)
                            .unwrap_or_default();
                        let _ = writeln!(out, "$ {name} {input} [{status}]");
                        for line in tool.output.lines() {
                            let _ = writeln!(out, "  {line}");
                        }
                        if let Some(error) = &tool.error {
                            let _ = writeln!(out, "  error: {error}");
                        }
                    }
                }
            }
        }

        out
    }
}

/// Project reducer state into a view
pub fn project(state: &ConversationState) -> ConversationView {
    ConversationView {
        conversation: state.conversation().clone(),
        messages: state
            .messages()
            .iter()
            .map(|message| project_message(message))
            .collect(),
    }
}

fn project_message(message: &MessageRecord) -> MessageView {
    MessageView {
        id: message.id.clone(),
        role: message.role,
        status: message.status,
        prompt_id: message.prompt_id.clone(),
        model: message.model.clone(),
        created_at: message.created_at,
        updated_at: message.updated_at,
        blocks: message.blocks().map(project_block).collect(),
    }
}

fn is_tool_bearing(block: &Block) -> bool {
    matches!(block.block_type, BlockType::ToolUse | BlockType::ToolResult)
        || block.tool_call.is_some()
        || block
            .metadata
            .as_ref()
            .is_some_and(|metadata| metadata.tool_name.is_some())
}

fn project_block(block: &Block) -> BlockView {
    if is_tool_bearing(block) {
        return BlockView::Tool(project_tool(block));
    }

    match block.block_type {
        BlockType::Thinking => BlockView::Thinking {
            id: block.id.clone(),
            content: block.content.clone(),
        },
        _ => BlockView::Text {
            id: block.id.clone(),
            content: block.content.clone(),
        },
    }
}

fn project_tool(block: &Block) -> ToolView {
    let metadata = block.metadata.as_ref();
    let call = block.tool_call.as_ref();

    let output = if block.content.is_empty() {
        metadata
            .and_then(|metadata| metadata.output.clone())
            .or_else(|| call.and_then(|call| call.output.clone()))
            .unwrap_or_default()
    } else {
        block.content.clone()
    };

    ToolView {
        id: block.id.clone(),
        block_type: block.block_type,
        tool_name: metadata
            .and_then(|metadata| metadata.tool_name.clone())
            .or_else(|| call.map(|call| call.tool_name.clone())),
        tool_call_id: metadata
            .and_then(|metadata| metadata.tool_call_id.clone())
            .or_else(|| call.map(|call| call.id.clone())),
        input: metadata
            .and_then(|metadata| metadata.input.clone())
            .or_else(|| call.map(|call| call.input.clone()).filter(|input| !input.is_null())),
        output,
        error: metadata
            .and_then(|metadata| metadata.error.clone())
            .or_else(|| call.and_then(|call| call.error.clone())),
        status: metadata
            .and_then(|metadata| metadata.status.clone())
            .or_else(|| call.map(|call| call.state.clone()).filter(|state| !state.is_empty())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::model::{BlockMetadata, ConversationId, ConversationSnapshot, Message};
    use chrono::TimeZone;
    use serde_json::json;
    use std::sync::Arc;

    fn snapshot_with(blocks: Vec<Block>) -> ConversationSnapshot {
        let at = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        ConversationSnapshot {
            conversation: Conversation {
                id: ConversationId::new("c1"),
                title: Some("Files".to_string()),
                created_at: at,
                updated_at: at,
            },
            messages: vec![Message {
                id: MessageId::new("m1"),
                conversation_id: ConversationId::new("c1"),
                role: Role::Assistant,
                status: Some(MessageStatus::Completed),
                prompt_id: None,
                model: None,
                created_at: at,
                updated_at: at,
                blocks,
            }],
        }
    }

    #[test]
    fn tool_metadata_becomes_a_tool_view() {
        let mut block = Block::empty(BlockId::new("b1"), MessageId::new("m1"), BlockType::ToolUse);
        block.content = "file.txt\n".to_string();
        block.metadata = Some(BlockMetadata {
            tool_name: Some("bash".to_string()),
            tool_call_id: Some(ToolCallId::new("t1")),
            input: Some(json!({ "command": "ls" })),
            status: Some("completed".to_string()),
            ..BlockMetadata::default()
        });

        let view = project(&ConversationState::from_snapshot(&snapshot_with(vec![block])));
        let BlockView::Tool(tool) = &view.messages[0].blocks[0] else {
            panic!("expected a tool view");
        };
        assert_eq!(tool.tool_name.as_deref(), Some("bash"));
        assert_eq!(tool.output, "file.txt\n");
        assert_eq!(tool.status.as_deref(), Some("completed"));
        assert_eq!(tool.input, Some(json!({ "command": "ls" })));

        let text = view.render_plain();
        assert!(text.contains("$ bash {\"command\":\"ls\"} [completed]"));
        assert!(text.contains("  file.txt"));
    }

    #[test]
    fn dangling_order_keys_are_skipped() {
        let mut block = Block::empty(BlockId::new("b1"), MessageId::new("m1"), BlockType::Text);
        block.content = "kept".to_string();
        let mut state = ConversationState::from_snapshot(&snapshot_with(vec![block]));

        let message = state.messages()[0].clone();
        let mut record = (*message).clone();
        record.block_order.push(BlockId::new("gone"));
        state =
            ConversationState::from_records(state.conversation().clone(), vec![Arc::new(record)]);

        let view = project(&state);
        assert_eq!(view.messages[0].blocks.len(), 1);
        assert_eq!(view.messages[0].blocks[0].id().as_str(), "b1");
    }

    #[test]
    fn thinking_blocks_stay_distinct() {
        let mut block = Block::empty(BlockId::new("b1"), MessageId::new("m1"), BlockType::Thinking);
        block.content = "hmm".to_string();
        let view = project(&ConversationState::from_snapshot(&snapshot_with(vec![block])));
        assert!(matches!(
            &view.messages[0].blocks[0],
            BlockView::Thinking { content, .. } if content == "hmm"
        ));
        assert!(view.render_plain().contains("> hmm"));
        assert!(!view.is_streaming());
    }
}
