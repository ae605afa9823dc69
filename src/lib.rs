//! Chatsync – incremental conversation stream reconciliation
//!
//! This crate keeps a client-side copy of an AI assistant conversation in
//! sync with the server:
//! - A transport adapter that subscribes over NDJSON and yields a snapshot
//!   followed by an ordered, cancellable event stream
//! - A pure reducer folding the closed event vocabulary into conversation state
//! - A projection into an immutable view model for rendering
//! - A stream controller that survives conversation switches without leaking
//!   events from one conversation into another

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

/// Stream engine: vocabulary, transport, reducer, projection and controller
pub mod engine;

// Re-export key types for convenience
pub use engine::{
    ClientConfig, ConversationEvent, ConversationState, ConversationView, StreamController,
    TcpSource,
};

/// Current version of the chatsync crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
