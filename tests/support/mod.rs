//! Shared fixtures: wire records and a scripted NDJSON server over duplex pipes.

#![allow(dead_code)]

use chatsync::engine::{
    Block, BlockId, BlockType, ClientFrame, CloseHandle, Conversation, ConversationEvent,
    ConversationId, ConversationSnapshot, ConversationStream, Message, MessageId, Prompt, PromptId,
    PromptStatus, Role, ServerFrame, StreamSource, Subscriber, ToolCall, ToolCallId,
    TransportResult,
};
use chrono::{DateTime, TimeZone, Utc};
use futures::future::BoxFuture;
use serde_json::Value;
use std::time::Duration;
use tokio::io::{
    AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, Lines, ReadHalf, WriteHalf,
};
use tokio::sync::mpsc;

/// Generous bound for anything that should happen promptly
pub const STEP: Duration = Duration::from_secs(5);

pub fn at(seconds: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + seconds, 0).unwrap()
}

pub fn conversation(id: &str) -> Conversation {
    Conversation {
        id: ConversationId::new(id),
        title: None,
        created_at: at(0),
        updated_at: at(0),
    }
}

pub fn message(conversation_id: &str, id: &str, role: Role, created: i64) -> Message {
    Message {
        id: MessageId::new(id),
        conversation_id: ConversationId::new(conversation_id),
        role,
        status: None,
        prompt_id: None,
        model: None,
        created_at: at(created),
        updated_at: at(created),
        blocks: Vec::new(),
    }
}

pub fn text_block(id: &str, content: &str) -> Block {
    let mut block = Block::empty(BlockId::new(id), MessageId::default(), BlockType::Text);
    block.content = content.to_string();
    block
}

pub fn snapshot(conversation_id: &str, messages: Vec<Message>) -> ConversationSnapshot {
    ConversationSnapshot {
        conversation: conversation(conversation_id),
        messages,
    }
}

pub fn prompt(conversation_id: &str, id: &str, message_id: &str, status: PromptStatus) -> Prompt {
    Prompt {
        id: PromptId::new(id),
        conversation_id: ConversationId::new(conversation_id),
        message_id: MessageId::new(message_id),
        status,
        model: None,
        error: None,
    }
}

pub fn tool_call(id: &str, prompt_id: &str, block_id: Option<&str>, tool_name: &str) -> ToolCall {
    ToolCall {
        id: ToolCallId::new(id),
        block_id: block_id.map(BlockId::new),
        prompt_id: PromptId::new(prompt_id),
        tool_name: tool_name.to_string(),
        state: String::new(),
        output: None,
        input: Value::Null,
        error: None,
        created_at: None,
        started_at: None,
        completed_at: None,
        timeout_at: None,
    }
}

pub fn block_start(message_id: &str, block_id: &str, block_type: BlockType) -> ConversationEvent {
    ConversationEvent::BlockStart {
        message_id: MessageId::new(message_id),
        block_id: BlockId::new(block_id),
        block_type: Some(block_type),
    }
}

pub fn block_delta(message_id: &str, block_id: &str, delta: &str) -> ConversationEvent {
    ConversationEvent::BlockDelta {
        message_id: MessageId::new(message_id),
        block_id: BlockId::new(block_id),
        delta: delta.to_string(),
    }
}

/// Server end of a duplex pipe speaking the subscription protocol
pub struct ScriptedServer {
    lines: Lines<BufReader<ReadHalf<DuplexStream>>>,
    writer: WriteHalf<DuplexStream>,
}

impl ScriptedServer {
    /// Client socket plus the server that answers on it
    pub fn pair() -> (DuplexStream, ScriptedServer) {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let (reader, writer) = tokio::io::split(server);
        (
            client,
            ScriptedServer {
                lines: BufReader::new(reader).lines(),
                writer,
            },
        )
    }

    /// Read the client's subscribe frame
    pub async fn expect_subscribe(&mut self) -> ClientFrame {
        let line = tokio::time::timeout(STEP, self.lines.next_line())
            .await
            .expect("subscribe frame in time")
            .expect("readable pipe")
            .expect("subscribe frame before EOF");
        serde_json::from_str(&line).expect("valid subscribe frame")
    }

    pub async fn send(&mut self, frame: &ServerFrame) {
        let mut line = serde_json::to_string(frame).unwrap();
        line.push('\n');
        self.send_raw(&line).await;
    }

    /// Write raw bytes, newline not added
    pub async fn send_raw(&mut self, line: &str) {
        self.writer.write_all(line.as_bytes()).await.unwrap();
        self.writer.flush().await.unwrap();
    }

    pub async fn send_snapshot(&mut self, snapshot: ConversationSnapshot) {
        self.send(&ServerFrame::Snapshot {
            conversation_id: Some(snapshot.conversation.id.clone()),
            snapshot,
        })
        .await;
    }

    pub async fn send_event(&mut self, conversation_id: &str, event: &ConversationEvent) {
        let frame = ServerFrame::event(&ConversationId::new(conversation_id), event).unwrap();
        self.send(&frame).await;
    }

    /// Subscribe handshake: read the request, acknowledge, send the snapshot
    pub async fn accept(&mut self, snapshot: ConversationSnapshot) -> ClientFrame {
        let request = self.expect_subscribe().await;
        self.send(&ServerFrame::Subscribed {
            conversation_id: Some(snapshot.conversation.id.clone()),
        })
        .await;
        self.send_snapshot(snapshot).await;
        request
    }

    /// Wait until the client shuts its write side down
    pub async fn expect_eof(&mut self) {
        let line = tokio::time::timeout(STEP, self.lines.next_line())
            .await
            .expect("client shut down in time")
            .expect("readable pipe");
        assert_eq!(line, None, "client sent more frames after subscribing");
    }

    /// Close the server's write side
    pub async fn hang_up(&mut self) {
        self.writer.shutdown().await.unwrap();
    }
}

/// Stream source handing the server end of every subscription to the test
pub struct DuplexSource {
    servers: mpsc::UnboundedSender<(ConversationId, ScriptedServer)>,
    honor_close: bool,
}

pub type Servers = mpsc::UnboundedReceiver<(ConversationId, ScriptedServer)>;

impl DuplexSource {
    pub fn new() -> (Self, Servers) {
        let (servers, rx) = mpsc::unbounded_channel();
        (
            Self {
                servers,
                honor_close: true,
            },
            rx,
        )
    }

    /// Source whose opens only finish once the server answers
    pub fn uncancellable() -> (Self, Servers) {
        let (mut source, rx) = Self::new();
        source.honor_close = false;
        (source, rx)
    }
}

impl StreamSource for DuplexSource {
    fn open(
        &self,
        conversation_id: ConversationId,
        user_id: String,
        closer: CloseHandle,
    ) -> BoxFuture<'static, TransportResult<Option<ConversationStream>>> {
        let (client, server) = ScriptedServer::pair();
        let _ = self.servers.send((conversation_id.clone(), server));
        let mut subscriber = Subscriber::new(client);
        if self.honor_close {
            subscriber = subscriber.with_closer(closer);
        }
        Box::pin(async move {
            subscriber
                .stream(Some(&conversation_id), Some(&user_id))
                .await
        })
    }
}

/// Next server handed out by a [`DuplexSource`]
pub async fn next_server(servers: &mut Servers) -> (ConversationId, ScriptedServer) {
    tokio::time::timeout(STEP, servers.recv())
        .await
        .expect("subscription in time")
        .expect("source alive")
}
