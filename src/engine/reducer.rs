//! Reconciliation reducer
//!
//! `apply_event` is a pure transition from one [`ConversationState`] to the
//! next. Messages are held behind `Arc`s: a transition copies only the
//! message it touches, so every other message subtree stays pointer-equal
//! between the input and output states. Events that reference a message,
//! block, prompt or tool call the state does not know are no-ops.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;

use super::events::ConversationEvent;
use super::model::{
    Block, BlockId, BlockMetadata, BlockType, Conversation, ConversationId, ConversationSnapshot,
    Message, MessageId, MessageStatus, Prompt, PromptId, Role, ToolCall, ToolCallId,
};

/// Canonical state of one message
#[derive(Debug, Clone, PartialEq)]
pub struct MessageRecord {
    /// Message identifier
    pub id: MessageId,
    /// Parent conversation
    pub conversation_id: ConversationId,
    /// Author role
    pub role: Role,
    /// Lifecycle status
    pub status: Option<MessageStatus>,
    /// Prompt correlated with this message
    pub prompt_id: Option<PromptId>,
    /// Model that produced the message
    pub model: Option<String>,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Last update time
    pub updated_at: DateTime<Utc>,
    pub(crate) block_order: Vec<BlockId>,
    pub(crate) blocks: HashMap<BlockId, Block>,
}

impl MessageRecord {
    /// Build a record from a full message
    pub fn from_message(message: &Message) -> Self {
        let mut record = Self {
            id: message.id.clone(),
            conversation_id: message.conversation_id.clone(),
            role: message.role,
            status: message.status,
            prompt_id: message.prompt_id.clone(),
            model: message.model.clone(),
            created_at: message.created_at,
            updated_at: message.updated_at,
            block_order: Vec::new(),
            blocks: HashMap::new(),
        };
        record.replace_blocks(&message.blocks);
        record
    }

    /// Block ids in display order
    pub fn block_order(&self) -> &[BlockId] {
        &self.block_order
    }

    /// Look up a block
    pub fn block(&self, id: &BlockId) -> Option<&Block> {
        self.blocks.get(id)
    }

    /// Blocks in display order, skipping order keys that do not resolve
    pub fn blocks(&self) -> impl Iterator<Item = &Block> {
        self.block_order.iter().filter_map(|id| self.blocks.get(id))
    }

    /// Number of blocks
    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    fn sort_key(&self) -> (DateTime<Utc>, &MessageId) {
        (self.created_at, &self.id)
    }

    fn merge_scalars(&mut self, message: &Message) {
        if let Some(status) = message.status {
            self.status = Some(status);
        }
        if let Some(prompt_id) = &message.prompt_id {
            self.prompt_id = Some(prompt_id.clone());
        }
        if let Some(model) = &message.model {
            self.model = Some(model.clone());
        }
        self.updated_at = message.updated_at;
    }

    fn replace_blocks(&mut self, blocks: &[Block]) {
        let mut ordered: Vec<&Block> = blocks.iter().collect();
        ordered.sort_by_key(|block| block.position.unwrap_or(i64::MAX));

        self.block_order.clear();
        self.blocks.clear();
        for block in ordered {
            let mut block = block.clone();
            block.message_id = self.id.clone();
            if self.blocks.insert(block.id.clone(), block.clone()).is_none() {
                self.block_order.push(block.id);
            }
        }
    }

    fn open_block(&mut self, id: &BlockId, block_type: BlockType) -> &mut Block {
        if !self.blocks.contains_key(id) {
            self.block_order.push(id.clone());
        }
        self.blocks
            .entry(id.clone())
            .or_insert_with(|| Block::empty(id.clone(), self.id.clone(), block_type))
    }

    fn tool_block_id(&self, tool_call_id: &ToolCallId) -> Option<BlockId> {
        self.blocks()
            .find(|block| carries_tool_call(block, tool_call_id))
            .map(|block| block.id.clone())
    }
}

fn carries_tool_call(block: &Block, tool_call_id: &ToolCallId) -> bool {
    let in_metadata = block
        .metadata
        .as_ref()
        .and_then(|metadata| metadata.tool_call_id.as_ref())
        == Some(tool_call_id);
    let embedded = block.tool_call.as_ref().map(|call| &call.id) == Some(tool_call_id);
    in_metadata || embedded
}

/// What a full-message update does to the blocks of an existing message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockMerge {
    /// Take the incoming blocks wholesale
    ReplaceBlocks,
    /// Keep the blocks built so far
    KeepBlocks,
}

/// Decide how a full-message update treats the blocks of `existing`
///
/// Blocks are replaced only while the message has none. Once streaming has
/// built at least one block, a coarser message snapshot must not clobber it.
pub fn decide_block_merge(existing: &MessageRecord) -> BlockMerge {
    if existing.blocks.is_empty() {
        BlockMerge::ReplaceBlocks
    } else {
        BlockMerge::KeepBlocks
    }
}

/// Why an event left the state unchanged
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Skip {
    /// Event names a message the state does not hold
    UnknownMessage,
    /// Event names a block the message does not hold
    UnknownBlock,
    /// No message is correlated with the prompt
    UnknownPrompt,
    /// No block carries the tool call
    UnknownToolCall,
    /// Tool call has no owning block yet
    MissingBlockId,
    /// `block-start` for a block that already exists
    DuplicateBlock,
    /// Event targets a different conversation
    OtherConversation,
    /// Framing-only event
    Framing,
}

/// Result of applying one event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// State changed
    Applied,
    /// State left as it was
    Skipped(Skip),
}

/// Canonical reconciliation state for one conversation
#[derive(Debug, Clone, PartialEq)]
pub struct ConversationState {
    conversation: Conversation,
    messages: Vec<Arc<MessageRecord>>,
}

impl ConversationState {
    /// Install a snapshot as initial state
    pub fn from_snapshot(snapshot: &ConversationSnapshot) -> Self {
        let mut state = Self {
            conversation: snapshot.conversation.clone(),
            messages: Vec::with_capacity(snapshot.messages.len()),
        };
        for message in &snapshot.messages {
            state.upsert_message(message);
        }
        state
    }

    #[cfg(test)]
    pub(crate) fn from_records(
        conversation: Conversation,
        messages: Vec<Arc<MessageRecord>>,
    ) -> Self {
        Self {
            conversation,
            messages,
        }
    }

    /// Conversation header
    pub fn conversation(&self) -> &Conversation {
        &self.conversation
    }

    /// Messages sorted by creation time, then id
    pub fn messages(&self) -> &[Arc<MessageRecord>] {
        &self.messages
    }

    /// Look up a message
    pub fn message(&self, id: &MessageId) -> Option<&Arc<MessageRecord>> {
        self.messages.iter().find(|message| &message.id == id)
    }

    /// True while any assistant message is processing
    pub fn is_streaming(&self) -> bool {
        self.messages.iter().any(|message| {
            message.role == Role::Assistant && message.status == Some(MessageStatus::Processing)
        })
    }

    fn position_of(&self, id: &MessageId) -> Option<usize> {
        self.messages.iter().rposition(|message| &message.id == id)
    }

    fn position_by_prompt(&self, prompt_id: &PromptId) -> Option<usize> {
        let mut matches = self
            .messages
            .iter()
            .enumerate()
            .rev()
            .filter(|(_, message)| message.prompt_id.as_ref() == Some(prompt_id));
        let (index, _) = matches.next()?;
        if matches.next().is_some() {
            tracing::warn!(
                prompt = %prompt_id,
                "prompt id shared by several messages; using the latest"
            );
        }
        Some(index)
    }

    fn locate_tool_call(&self, tool_call_id: &ToolCallId) -> Option<(usize, BlockId)> {
        self.messages
            .iter()
            .enumerate()
            .rev()
            .find_map(|(index, message)| {
                message
                    .tool_block_id(tool_call_id)
                    .map(|block_id| (index, block_id))
            })
    }

    fn message_mut(&mut self, index: usize) -> &mut MessageRecord {
        Arc::make_mut(&mut self.messages[index])
    }

    fn insert_sorted(&mut self, record: MessageRecord) {
        let index = self
            .messages
            .partition_point(|existing| existing.sort_key() <= record.sort_key());
        self.messages.insert(index, Arc::new(record));
    }

    fn upsert_message(&mut self, message: &Message) -> Outcome {
        if !message.conversation_id.is_blank() && message.conversation_id != self.conversation.id {
            return Outcome::Skipped(Skip::OtherConversation);
        }

        let Some(index) = self.position_of(&message.id) else {
            self.insert_sorted(MessageRecord::from_message(message));
            return Outcome::Applied;
        };

        let record = self.message_mut(index);
        record.merge_scalars(message);
        match decide_block_merge(record) {
            BlockMerge::ReplaceBlocks => record.replace_blocks(&message.blocks),
            BlockMerge::KeepBlocks => {}
        }
        Outcome::Applied
    }

    fn start_block(
        &mut self,
        message_id: &MessageId,
        block_id: &BlockId,
        block_type: Option<BlockType>,
    ) -> Outcome {
        let Some(index) = self.position_of(message_id) else {
            return Outcome::Skipped(Skip::UnknownMessage);
        };
        if self.messages[index].blocks.contains_key(block_id) {
            return Outcome::Skipped(Skip::DuplicateBlock);
        }
        self.message_mut(index)
            .open_block(block_id, block_type.unwrap_or_default());
        Outcome::Applied
    }

    fn append_delta(&mut self, message_id: &MessageId, block_id: &BlockId, delta: &str) -> Outcome {
        let Some(index) = self.position_of(message_id) else {
            return Outcome::Skipped(Skip::UnknownMessage);
        };
        if !self.messages[index].blocks.contains_key(block_id) {
            tracing::debug!(
                message = %message_id,
                block = %block_id,
                "delta for unknown block; opening it"
            );
        }
        self.message_mut(index)
            .open_block(block_id, BlockType::Text)
            .content
            .push_str(delta);
        Outcome::Applied
    }

    fn apply_prompt(&mut self, prompt: &Prompt, status: MessageStatus) -> Outcome {
        let index = self
            .position_by_prompt(&prompt.id)
            .or_else(|| self.position_of(&prompt.message_id));
        let Some(index) = index else {
            return Outcome::Skipped(Skip::UnknownPrompt);
        };

        let record = self.message_mut(index);
        record.status = Some(status);
        if let Some(model) = &prompt.model {
            record.model = Some(model.clone());
        }
        if record.prompt_id.is_none() {
            record.prompt_id = Some(prompt.id.clone());
        }
        Outcome::Applied
    }

    fn start_tool_call(
        &mut self,
        tool_call: &ToolCall,
        input: Option<&serde_json::Value>,
    ) -> Outcome {
        let Some(block_id) = &tool_call.block_id else {
            return Outcome::Skipped(Skip::MissingBlockId);
        };
        let Some(index) = self.position_by_prompt(&tool_call.prompt_id) else {
            return Outcome::Skipped(Skip::UnknownPrompt);
        };
        if !self.messages[index].blocks.contains_key(block_id) {
            return Outcome::Skipped(Skip::UnknownBlock);
        }

        let Some(block) = self.message_mut(index).blocks.get_mut(block_id) else {
            return Outcome::Skipped(Skip::UnknownBlock);
        };

        let input = input
            .cloned()
            .or_else(|| (!tool_call.input.is_null()).then(|| tool_call.input.clone()));

        block.block_type = BlockType::ToolUse;
        let metadata = block.metadata.get_or_insert_with(BlockMetadata::default);
        metadata.tool_name = Some(tool_call.tool_name.clone());
        metadata.tool_call_id = Some(tool_call.id.clone());
        if let Some(input) = &input {
            metadata.input = Some(input.clone());
        }
        if !tool_call.state.is_empty() {
            metadata.status = Some(tool_call.state.clone());
        }

        let mut embedded = tool_call.clone();
        if let Some(input) = input {
            embedded.input = input;
        }
        block.tool_call = Some(embedded);
        Outcome::Applied
    }

    fn append_tool_output(&mut self, tool_call_id: &ToolCallId, output: &str) -> Outcome {
        let Some((index, block_id)) = self.locate_tool_call(tool_call_id) else {
            return Outcome::Skipped(Skip::UnknownToolCall);
        };
        let Some(block) = self.message_mut(index).blocks.get_mut(&block_id) else {
            return Outcome::Skipped(Skip::UnknownBlock);
        };

        block.content.push_str(output);
        if let Some(call) = block.tool_call.as_mut() {
            call.output.get_or_insert_with(String::new).push_str(output);
        }
        Outcome::Applied
    }

    fn finish_tool_call(&mut self, tool_call: &ToolCall, failure: Option<Option<&str>>) -> Outcome {
        let by_prompt = self.position_by_prompt(&tool_call.prompt_id).and_then(|index| {
            let message = &self.messages[index];
            tool_call
                .block_id
                .clone()
                .filter(|block_id| message.blocks.contains_key(block_id))
                .or_else(|| message.tool_block_id(&tool_call.id))
                .map(|block_id| (index, block_id))
        });
        let Some((index, block_id)) = by_prompt.or_else(|| self.locate_tool_call(&tool_call.id))
        else {
            return Outcome::Skipped(Skip::UnknownToolCall);
        };
        let Some(block) = self.message_mut(index).blocks.get_mut(&block_id) else {
            return Outcome::Skipped(Skip::UnknownBlock);
        };

        if let Some(output) = &tool_call.output {
            block.content = output.clone();
        }

        let metadata = block.metadata.get_or_insert_with(BlockMetadata::default);
        metadata
            .tool_name
            .get_or_insert_with(|| tool_call.tool_name.clone());
        metadata
            .tool_call_id
            .get_or_insert_with(|| tool_call.id.clone());
        if let Some(output) = &tool_call.output {
            metadata.output = Some(output.clone());
        }
        match failure {
            None => metadata.status = Some("completed".to_string()),
            Some(error) => {
                metadata.status = Some("error".to_string());
                let error = error
                    .map(str::to_string)
                    .or_else(|| tool_call.error.clone());
                if error.is_some() {
                    metadata.error = error;
                }
            }
        }

        let mut embedded = tool_call.clone();
        if let Some(previous) = block.tool_call.take() {
            if embedded.output.is_none() {
                embedded.output = previous.output;
            }
            if embedded.input.is_null() {
                embedded.input = previous.input;
            }
        }
        block.tool_call = Some(embedded);
        Outcome::Applied
    }

    fn patch_conversation(
        &mut self,
        conversation_id: Option<&ConversationId>,
        title: Option<&String>,
        updated_at: Option<DateTime<Utc>>,
    ) -> Outcome {
        if conversation_id.is_some_and(|id| id != &self.conversation.id) {
            return Outcome::Skipped(Skip::OtherConversation);
        }
        if let Some(title) = title {
            self.conversation.title = Some(title.clone());
        }
        if let Some(updated_at) = updated_at {
            self.conversation.updated_at = updated_at;
        }
        Outcome::Applied
    }
}

/// Apply `event` to `state` in place, reporting what happened
///
/// Lookups run before any message is copied, but a caller that needs the
/// untouched input must clone first; [`apply_event`] does that.
pub fn reduce(state: &mut ConversationState, event: &ConversationEvent) -> Outcome {
    match event {
        ConversationEvent::MessageCreated { message }
        | ConversationEvent::MessageUpdated { message } => state.upsert_message(message),
        ConversationEvent::BlockStart {
            message_id,
            block_id,
            block_type,
        } => state.start_block(message_id, block_id, *block_type),
        ConversationEvent::BlockDelta {
            message_id,
            block_id,
            delta,
        } => state.append_delta(message_id, block_id, delta),
        ConversationEvent::BlockEnd { .. } => Outcome::Skipped(Skip::Framing),
        ConversationEvent::PromptStarted { prompt } => {
            state.apply_prompt(prompt, MessageStatus::Processing)
        }
        ConversationEvent::PromptCompleted { prompt } => {
            state.apply_prompt(prompt, MessageStatus::Completed)
        }
        ConversationEvent::PromptFailed { prompt, error } => {
            if let Some(error) = error {
                tracing::debug!(prompt = %prompt.id, %error, "prompt failed");
            }
            state.apply_prompt(prompt, MessageStatus::Failed)
        }
        ConversationEvent::ToolCallStarted { tool_call, input } => {
            state.start_tool_call(tool_call, input.as_ref())
        }
        ConversationEvent::ToolCallProgress {
            tool_call_id,
            output,
        } => state.append_tool_output(tool_call_id, output),
        ConversationEvent::ToolCallCompleted { tool_call } => {
            state.finish_tool_call(tool_call, None)
        }
        ConversationEvent::ToolCallFailed { tool_call, error } => {
            state.finish_tool_call(tool_call, Some(error.as_deref()))
        }
        ConversationEvent::ConversationUpdated {
            conversation_id,
            title,
            updated_at,
        } => state.patch_conversation(conversation_id.as_ref(), title.as_ref(), *updated_at),
    }
}

/// Pure transition: the state after applying `event` to `state`
///
/// When the event is skipped the result is a clone whose message subtrees
/// are all pointer-equal to the input's.
pub fn apply_event(state: &ConversationState, event: &ConversationEvent) -> ConversationState {
    let mut next = state.clone();
    match reduce(&mut next, event) {
        Outcome::Applied => next,
        Outcome::Skipped(Skip::Framing) => state.clone(),
        Outcome::Skipped(reason) => {
            tracing::debug!(
                kind = %event.kind(),
                message = ?event.message_id(),
                ?reason,
                "event left state unchanged"
            );
            state.clone()
        }
    }
}

/// Apply events in order
pub fn fold<'a, I>(state: &ConversationState, events: I) -> ConversationState
where
    I: IntoIterator<Item = &'a ConversationEvent>,
{
    events
        .into_iter()
        .fold(state.clone(), |state, event| apply_event(&state, event))
}
