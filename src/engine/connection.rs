//! Process-wide connection state
//!
//! Tracks whether the client currently holds a live socket to the server,
//! independently of which conversation the stream controller follows. A
//! conversation stream ending is not the same thing as the transport being
//! down, so the two are kept apart.

use parking_lot::Mutex;
use std::sync::{Arc, OnceLock};
use tokio::sync::watch;

/// Connection state machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    /// No live socket; carries the last failure if there was one
    Disconnected {
        /// Last connection failure
        reason: Option<String>,
    },
    /// A connect attempt is in flight and no socket is live
    Connecting,
    /// At least one socket is live
    Connected,
}

#[derive(Debug, Default)]
struct Counters {
    live: usize,
    connecting: usize,
}

/// Connection manager shared by every transport source in the process
#[derive(Debug)]
pub struct ConnectionManager {
    counters: Mutex<Counters>,
    state: watch::Sender<ConnectionState>,
}

static GLOBAL: OnceLock<Arc<ConnectionManager>> = OnceLock::new();

impl ConnectionManager {
    /// Create a manager in the disconnected state
    pub fn new() -> Arc<Self> {
        let (state, _) = watch::channel(ConnectionState::Disconnected { reason: None });
        Arc::new(Self {
            counters: Mutex::new(Counters::default()),
            state,
        })
    }

    /// The process-wide manager
    pub fn global() -> Arc<Self> {
        GLOBAL.get_or_init(ConnectionManager::new).clone()
    }

    /// Current state
    pub fn state(&self) -> ConnectionState {
        self.state.borrow().clone()
    }

    /// Watch state changes
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Number of live sockets
    pub fn live_connections(&self) -> usize {
        self.counters.lock().live
    }

    /// Record the start of a connect attempt
    pub fn begin_connect(&self) {
        let mut counters = self.counters.lock();
        counters.connecting += 1;
        self.publish(&counters, None);
    }

    /// Record a failed connect attempt
    pub fn connect_failed(&self, reason: impl Into<String>) {
        let reason = reason.into();
        tracing::warn!(%reason, "connection attempt failed");
        let mut counters = self.counters.lock();
        counters.connecting = counters.connecting.saturating_sub(1);
        self.publish(&counters, Some(reason));
    }

    /// Record a successful connect; the socket counts as live until the lease drops
    pub fn register(self: &Arc<Self>) -> ConnectionLease {
        let mut counters = self.counters.lock();
        counters.connecting = counters.connecting.saturating_sub(1);
        counters.live += 1;
        self.publish(&counters, None);
        ConnectionLease {
            manager: Arc::clone(self),
        }
    }

    fn release(&self) {
        let mut counters = self.counters.lock();
        counters.live = counters.live.saturating_sub(1);
        self.publish(&counters, None);
    }

    fn publish(&self, counters: &Counters, reason: Option<String>) {
        let next = if counters.live > 0 {
            ConnectionState::Connected
        } else if counters.connecting > 0 {
            ConnectionState::Connecting
        } else {
            ConnectionState::Disconnected { reason }
        };

        self.state.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            tracing::info!(from = ?current, to = ?next, "connection state changed");
            *current = next;
            true
        });
    }
}

/// Keeps one socket counted as live
#[derive(Debug)]
pub struct ConnectionLease {
    manager: Arc<ConnectionManager>,
}

impl Drop for ConnectionLease {
    fn drop(&mut self) {
        self.manager.release();
    }
}
