//! Stream controller: owns the pull loop for the active conversation.
//!
//! Every target change bumps an epoch. A pull loop is tagged with the epoch it
//! was started for and re-checks it under the lock after each suspension
//! point, so results that resolve after a switch are dropped instead of being
//! folded into the new conversation. Each epoch gets its [`CloseHandle`]
//! before the open starts, so a switch during loading abandons the pending
//! subscription instead of waiting for its snapshot. The controller closes
//! every handle it created exactly once.

use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::watch;

use super::model::ConversationId;
use super::projection::{ConversationView, project};
use super::reducer::{ConversationState, apply_event};
use super::transport::{CloseHandle, ConversationStream, StreamSource};

/// Controller lifecycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControllerStatus {
    /// No conversation selected
    Idle,
    /// Waiting for the snapshot
    Loading,
    /// Snapshot installed; events are being folded
    Ready,
    /// The stream could not be opened or failed
    Error(String),
}

/// Published after every controller transition
#[derive(Debug, Clone, PartialEq)]
pub struct ControllerSnapshot {
    /// Epoch the snapshot belongs to
    pub epoch: u64,
    /// Lifecycle status
    pub status: ControllerStatus,
    /// Current view, once a snapshot is installed
    pub view: Option<Arc<ConversationView>>,
    /// True while an assistant message is processing
    pub is_streaming: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Target {
    conversation_id: ConversationId,
    user_id: String,
}

struct Shared {
    epoch: u64,
    target: Option<Target>,
    status: ControllerStatus,
    state: Option<ConversationState>,
    view: Option<Arc<ConversationView>>,
    is_streaming: bool,
    closer: Option<CloseHandle>,
}

impl Shared {
    fn install(&mut self, state: ConversationState) {
        self.is_streaming = state.is_streaming();
        self.view = Some(Arc::new(project(&state)));
        self.state = Some(state);
    }

    fn snapshot(&self) -> ControllerSnapshot {
        ControllerSnapshot {
            epoch: self.epoch,
            status: self.status.clone(),
            view: self.view.clone(),
            is_streaming: self.is_streaming,
        }
    }
}

struct Inner {
    shared: Mutex<Shared>,
    published: watch::Sender<ControllerSnapshot>,
}

impl Inner {
    fn publish(&self, shared: &Shared) {
        self.published.send_replace(shared.snapshot());
    }
}

/// Drives one conversation stream at a time
///
/// Methods that start a pull loop spawn onto the current Tokio runtime and
/// must be called from within one.
pub struct StreamController {
    source: Arc<dyn StreamSource>,
    inner: Arc<Inner>,
}

impl StreamController {
    /// Create an idle controller
    pub fn new(source: Arc<dyn StreamSource>) -> Self {
        let shared = Shared {
            epoch: 0,
            target: None,
            status: ControllerStatus::Idle,
            state: None,
            view: None,
            is_streaming: false,
            closer: None,
        };
        let (published, _) = watch::channel(shared.snapshot());
        Self {
            source,
            inner: Arc::new(Inner {
                shared: Mutex::new(shared),
                published,
            }),
        }
    }

    /// Follow `conversation_id` as `user_id`
    ///
    /// Starts loading once both ids are present. Changing either id tears the
    /// current stream down and starts over; passing the current ids again is a
    /// no-op; passing a missing id returns the controller to idle.
    pub fn set_target(&self, conversation_id: Option<ConversationId>, user_id: Option<String>) {
        let target = match (conversation_id, user_id) {
            (Some(conversation_id), Some(user_id))
                if !conversation_id.is_blank() && !user_id.trim().is_empty() =>
            {
                Some(Target {
                    conversation_id,
                    user_id,
                })
            }
            _ => None,
        };
        self.retarget(target, false);
    }

    /// Re-subscribe to the current target from a fresh snapshot
    ///
    /// This is the hook for an outer retry policy; the controller never
    /// retries by itself.
    pub fn reload(&self) {
        let target = self.inner.shared.lock().target.clone();
        if target.is_some() {
            self.retarget(target, true);
        }
    }

    /// Stop following any conversation
    pub fn teardown(&self) {
        self.retarget(None, false);
    }

    /// Current lifecycle status
    pub fn status(&self) -> ControllerStatus {
        self.inner.shared.lock().status.clone()
    }

    /// Current epoch
    pub fn epoch(&self) -> u64 {
        self.inner.shared.lock().epoch
    }

    /// Current view, once a snapshot is installed
    pub fn view(&self) -> Option<Arc<ConversationView>> {
        self.inner.shared.lock().view.clone()
    }

    /// Current reducer state, once a snapshot is installed
    pub fn state(&self) -> Option<ConversationState> {
        self.inner.shared.lock().state.clone()
    }

    /// True while an assistant message is processing
    pub fn is_streaming(&self) -> bool {
        self.inner.shared.lock().is_streaming
    }

    /// Watch controller transitions
    pub fn subscribe(&self) -> watch::Receiver<ControllerSnapshot> {
        self.inner.published.subscribe()
    }

    fn retarget(&self, target: Option<Target>, force: bool) {
        let (previous, next, epoch) = {
            let mut shared = self.inner.shared.lock();
            if !force && shared.target == target {
                return;
            }

            shared.epoch += 1;
            shared.target = target.clone();
            shared.state = None;
            shared.view = None;
            shared.is_streaming = false;
            shared.status = if target.is_some() {
                ControllerStatus::Loading
            } else {
                ControllerStatus::Idle
            };
            tracing::info!(
                epoch = shared.epoch,
                conversation = ?target.as_ref().map(|t| t.conversation_id.as_str()),
                "stream target changed"
            );
            self.inner.publish(&shared);

            let next = target
                .as_ref()
                .map(|target| CloseHandle::new(target.conversation_id.clone()));
            let previous = std::mem::replace(&mut shared.closer, next.clone());
            (previous, next, shared.epoch)
        };

        if let Some(previous) = previous {
            previous.close();
        }

        if let (Some(target), Some(closer)) = (target, next) {
            tokio::spawn(pull_loop(
                Arc::clone(&self.inner),
                Arc::clone(&self.source),
                epoch,
                target,
                closer,
            ));
        }
    }
}

impl Drop for StreamController {
    fn drop(&mut self) {
        let closer = {
            let mut shared = self.inner.shared.lock();
            shared.epoch += 1;
            shared.target = None;
            shared.state = None;
            shared.view = None;
            shared.is_streaming = false;
            shared.status = ControllerStatus::Idle;
            self.inner.publish(&shared);
            shared.closer.take()
        };
        if let Some(closer) = closer {
            closer.close();
        }
    }
}

async fn pull_loop(
    inner: Arc<Inner>,
    source: Arc<dyn StreamSource>,
    epoch: u64,
    target: Target,
    closer: CloseHandle,
) {
    let opened = source
        .open(
            target.conversation_id.clone(),
            target.user_id.clone(),
            closer.clone(),
        )
        .await;

    let mut events = {
        let mut shared = inner.shared.lock();
        if shared.epoch != epoch {
            tracing::debug!(epoch, current = shared.epoch, "discarding stale subscription");
            if let Ok(Some(stream)) = opened {
                stream.events.close();
            }
            return;
        }

        match opened {
            Ok(Some(ConversationStream { snapshot, events })) => {
                shared.install(ConversationState::from_snapshot(&snapshot));
                let installed = events.closer();
                if !installed.is_same(&closer) {
                    // The source built its own handle; ours is unused.
                    closer.close();
                }
                shared.closer = Some(installed);
                shared.status = ControllerStatus::Ready;
                inner.publish(&shared);
                events
            }
            Ok(None) => {
                tracing::warn!(
                    conversation = %target.conversation_id,
                    "conversation cannot be streamed"
                );
                shared.closer = None;
                closer.close();
                shared.status =
                    ControllerStatus::Error("conversation cannot be streamed".to_string());
                inner.publish(&shared);
                return;
            }
            Err(err) => {
                tracing::warn!(
                    conversation = %target.conversation_id,
                    error = %err,
                    "subscription failed"
                );
                shared.closer = None;
                closer.close();
                shared.status = ControllerStatus::Error(err.to_string());
                inner.publish(&shared);
                return;
            }
        }
    };

    loop {
        let next = events.next().await;

        let mut shared = inner.shared.lock();
        if shared.epoch != epoch {
            tracing::debug!(epoch, current = shared.epoch, "discarding stale event");
            return;
        }

        match next {
            Some(Ok(event)) => {
                let Some(state) = shared.state.as_ref() else {
                    return;
                };
                let state = apply_event(state, &event);
                shared.install(state);
                inner.publish(&shared);
            }
            Some(Err(err)) => {
                tracing::warn!(
                    conversation = %target.conversation_id,
                    error = %err,
                    "event stream failed"
                );
                shared.status = ControllerStatus::Error(err.to_string());
                inner.publish(&shared);
                return;
            }
            None => {
                tracing::info!(conversation = %target.conversation_id, "event stream finished");
                return;
            }
        }
    }
}
