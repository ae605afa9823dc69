//! Conversation stream engine
//!
//! The pieces line up as a pipeline: the transport adapter turns a socket
//! into a snapshot plus an ordered event stream, the reducer folds events into
//! [`ConversationState`], the projection turns that state into a
//! [`ConversationView`], and the [`StreamController`] drives the loop for
//! whichever conversation is currently selected.

pub mod config;
pub mod connection;
pub mod controller;
pub mod directory;
pub mod error;
pub mod events;
pub mod model;
pub mod projection;
pub mod protocol;
pub mod reducer;
pub mod transport;

pub use config::ClientConfig;
pub use connection::{ConnectionLease, ConnectionManager, ConnectionState};
pub use controller::{ControllerSnapshot, ControllerStatus, StreamController};
pub use directory::{ConversationDirectory, InMemoryDirectory};
pub use error::{
    ConfigError, DirectoryError, EngineError, Result, TransportError, TransportResult,
    VocabularyError,
};
pub use events::{ConversationEvent, EventKind};
pub use model::{
    Block, BlockId, BlockMetadata, BlockType, Conversation, ConversationId, ConversationSnapshot,
    Message, MessageId, MessageStatus, Prompt, PromptId, PromptStatus, Role, ToolCall, ToolCallId,
};
pub use projection::{BlockView, ConversationView, MessageView, ToolView, project};
pub use protocol::{ClientFrame, ServerFrame};
pub use reducer::{
    BlockMerge, ConversationState, MessageRecord, Outcome, Skip, apply_event, decide_block_merge,
    fold, reduce,
};
pub use transport::{
    CloseHandle, ConversationStream, EventStream, StreamSource, Subscriber, TcpSource,
    stream_conversation,
};
