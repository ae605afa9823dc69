//! Transport adapter: duplex socket to ordered conversation events.
//!
//! A pump task owns the socket. It writes nothing after the subscribe frame,
//! reads NDJSON frames, drops frames addressed to other conversations and
//! pushes the rest into an unbounded single-producer/single-consumer channel.
//! [`EventStream`] is the consumer end. Closing is an explicit flag shared by
//! the stream, its [`CloseHandle`]s and the pump: once set, the pump shuts the
//! socket down and the stream yields nothing more, even frames that were
//! already buffered. A handle can be created before the subscription starts,
//! so the open itself is cancellable while it waits for the snapshot.

use futures::future::BoxFuture;
use futures::stream::{self, Stream};
use std::io;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};

use super::connection::{ConnectionLease, ConnectionManager};
use super::error::{TransportError, TransportResult};
use super::events::ConversationEvent;
use super::model::{ConversationId, ConversationSnapshot};
use super::protocol::{ClientFrame, ServerFrame, decode_server_frame, encode_frame};

type Inbound = TransportResult<ServerFrame>;

/// Result of a successful subscription
#[derive(Debug)]
pub struct ConversationStream {
    /// State of the conversation at subscribe time
    pub snapshot: ConversationSnapshot,
    /// Live events following the snapshot
    pub events: EventStream,
}

/// Cloneable handle that cancels an [`EventStream`]
#[derive(Debug, Clone)]
pub struct CloseHandle {
    conversation_id: ConversationId,
    flag: Arc<watch::Sender<bool>>,
}

impl CloseHandle {
    /// Fresh, open handle for a subscription to `conversation_id`
    pub fn new(conversation_id: ConversationId) -> Self {
        let (flag, _) = watch::channel(false);
        Self {
            conversation_id,
            flag: Arc::new(flag),
        }
    }

    /// Close the stream and shut the socket down
    ///
    /// Never fails and may be called any number of times. Returns true only
    /// for the call that actually closed the stream.
    pub fn close(&self) -> bool {
        let was_closed = self.flag.send_replace(true);
        if !was_closed {
            tracing::debug!(conversation = %self.conversation_id, "event stream closed");
        }
        !was_closed
    }

    /// True once the stream has been closed
    pub fn is_closed(&self) -> bool {
        *self.flag.borrow()
    }

    pub(crate) fn is_same(&self, other: &CloseHandle) -> bool {
        Arc::ptr_eq(&self.flag, &other.flag)
    }

    /// Resolve once the stream has been closed
    pub async fn closed(&self) {
        let mut flag = self.flag.subscribe();
        let _ = flag.wait_for(|closed| *closed).await;
    }
}

/// Ordered, lazily pulled sequence of events for one conversation
#[derive(Debug)]
pub struct EventStream {
    rx: mpsc::UnboundedReceiver<Inbound>,
    closer: CloseHandle,
    finished: bool,
}

impl EventStream {
    /// Wait for the next event
    ///
    /// Returns `None` once the server closed the connection or the stream was
    /// closed. A protocol failure is yielded once as `Some(Err(_))`, after
    /// which the stream is closed and ends.
    pub async fn next(&mut self) -> Option<TransportResult<ConversationEvent>> {
        loop {
            if self.finished || self.closer.is_closed() {
                return None;
            }

            let inbound = tokio::select! {
                biased;
                _ = self.closer.closed() => return None,
                inbound = self.rx.recv() => inbound,
            };

            match inbound {
                None => {
                    tracing::debug!(
                        conversation = %self.closer.conversation_id,
                        "event stream ended"
                    );
                    self.finished = true;
                    return None;
                }
                Some(Ok(ServerFrame::Event { event, .. })) => {
                    return match ConversationEvent::decode(event) {
                        Ok(event) => Some(Ok(event)),
                        Err(err) => Some(Err(self.fail(err.into()))),
                    };
                }
                Some(Ok(ServerFrame::Subscribed { .. })) => continue,
                Some(Ok(ServerFrame::Error { message, .. })) => {
                    return Some(Err(self.fail(TransportError::Remote(message))));
                }
                Some(Ok(ServerFrame::Snapshot { .. })) => {
                    return Some(Err(self.fail(TransportError::UnexpectedFrame("snapshot"))));
                }
                Some(Err(err)) => return Some(Err(self.fail(err))),
            }
        }
    }

    /// Close the stream; see [`CloseHandle::close`]
    pub fn close(&self) -> bool {
        self.closer.close()
    }

    /// Handle that can close this stream from elsewhere
    pub fn closer(&self) -> CloseHandle {
        self.closer.clone()
    }

    /// Conversation this stream follows
    pub fn conversation_id(&self) -> &ConversationId {
        &self.closer.conversation_id
    }

    /// Adapt into a [`futures::Stream`]
    pub fn into_stream(self) -> impl Stream<Item = TransportResult<ConversationEvent>> + Send {
        stream::unfold(self, |mut events| async move {
            let item = events.next().await?;
            Some((item, events))
        })
    }

    async fn recv_snapshot(&mut self) -> TransportResult<ConversationSnapshot> {
        loop {
            let inbound = tokio::select! {
                biased;
                _ = self.closer.closed() => None,
                inbound = self.rx.recv() => Some(inbound),
            };
            let Some(inbound) = inbound else {
                tracing::debug!(
                    conversation = %self.closer.conversation_id,
                    "subscription cancelled"
                );
                self.finished = true;
                return Err(TransportError::Cancelled);
            };

            match inbound {
                Some(Ok(ServerFrame::Subscribed { .. })) => continue,
                Some(Ok(ServerFrame::Snapshot { snapshot, .. })) => return Ok(snapshot),
                Some(Ok(ServerFrame::Error { message, .. })) => {
                    return Err(self.fail(TransportError::Remote(message)));
                }
                Some(Ok(ServerFrame::Event { .. })) => {
                    return Err(self.fail(TransportError::UnexpectedFrame("event")));
                }
                Some(Err(err)) => return Err(self.fail(err)),
                None => return Err(self.fail(TransportError::ClosedBeforeSnapshot)),
            }
        }
    }

    fn fail(&mut self, err: TransportError) -> TransportError {
        tracing::warn!(
            conversation = %self.closer.conversation_id,
            error = %err,
            "event stream failed"
        );
        self.finished = true;
        self.closer.close();
        err
    }
}

impl Drop for EventStream {
    fn drop(&mut self) {
        if !self.finished && !self.closer.is_closed() {
            tracing::warn!(
                conversation = %self.closer.conversation_id,
                "event stream dropped without close; closing it now"
            );
        }
        self.closer.close();
    }
}

/// Subscribes to one conversation over a duplex byte stream
pub struct Subscriber<S> {
    socket: S,
    lease: Option<ConnectionLease>,
    closer: Option<CloseHandle>,
}

impl<S> Subscriber<S>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    /// Wrap a connected socket
    pub fn new(socket: S) -> Self {
        Self {
            socket,
            lease: None,
            closer: None,
        }
    }

    /// Keep `lease` alive for as long as the socket is open
    pub fn with_lease(mut self, lease: ConnectionLease) -> Self {
        self.lease = Some(lease);
        self
    }

    /// Close the resulting stream through `closer`
    ///
    /// Closing it before the snapshot arrives abandons the subscription: the
    /// socket is shut down and [`Subscriber::stream`] fails with
    /// [`TransportError::Cancelled`].
    pub fn with_closer(mut self, closer: CloseHandle) -> Self {
        self.closer = Some(closer);
        self
    }

    /// Send the subscribe request and wait for the snapshot
    ///
    /// Returns `Ok(None)` without touching the socket when either id is
    /// missing or blank; that outcome is terminal for this call.
    pub async fn stream(
        self,
        conversation_id: Option<&ConversationId>,
        user_id: Option<&str>,
    ) -> TransportResult<Option<ConversationStream>> {
        let Some((conversation_id, user_id)) = streamable(conversation_id, user_id) else {
            return Ok(None);
        };

        let closer = self
            .closer
            .unwrap_or_else(|| CloseHandle::new(conversation_id.clone()));
        if closer.is_closed() {
            return Err(TransportError::Cancelled);
        }

        let (reader, mut writer) = tokio::io::split(self.socket);
        let subscribe = ClientFrame::Subscribe {
            conversation_id: conversation_id.clone(),
            user_id: Some(user_id),
        };
        let frame = encode_frame(&subscribe).map_err(io::Error::from)?;
        let written = tokio::select! {
            biased;
            _ = closer.closed() => None,
            written = async {
                writer.write_all(&frame).await?;
                writer.flush().await?;
                Ok::<_, io::Error>(())
            } => Some(written),
        };
        match written {
            Some(written) => written?,
            None => return Err(TransportError::Cancelled),
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let closed = closer.flag.subscribe();
        tokio::spawn(pump(
            BufReader::new(reader),
            writer,
            conversation_id.clone(),
            tx,
            closed,
            self.lease,
        ));

        let mut events = EventStream {
            rx,
            closer,
            finished: false,
        };
        let snapshot = events.recv_snapshot().await?;
        tracing::info!(
            conversation = %conversation_id,
            messages = snapshot.messages.len(),
            "subscribed"
        );

        Ok(Some(ConversationStream { snapshot, events }))
    }
}

/// Subscribe to a conversation over `socket`
///
/// Shorthand for [`Subscriber::new`] followed by [`Subscriber::stream`].
pub async fn stream_conversation<S>(
    socket: S,
    conversation_id: Option<&ConversationId>,
    user_id: Option<&str>,
) -> TransportResult<Option<ConversationStream>>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    Subscriber::new(socket)
        .stream(conversation_id, user_id)
        .await
}

fn streamable(
    conversation_id: Option<&ConversationId>,
    user_id: Option<&str>,
) -> Option<(ConversationId, String)> {
    let conversation_id = conversation_id.filter(|id| !id.is_blank())?;
    let user_id = user_id.map(str::trim).filter(|id| !id.is_empty())?;
    Some((conversation_id.clone(), user_id.to_string()))
}

async fn pump<R, W>(
    reader: BufReader<R>,
    mut writer: W,
    conversation_id: ConversationId,
    tx: mpsc::UnboundedSender<Inbound>,
    mut closed: watch::Receiver<bool>,
    lease: Option<ConnectionLease>,
) where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = reader.lines();

    loop {
        let line = tokio::select! {
            biased;
            _ = closed.wait_for(|closed| *closed) => break,
            line = lines.next_line() => line,
        };

        match line {
            Ok(Some(line)) => {
                if line.trim().is_empty() {
                    continue;
                }
                match decode_server_frame(&line) {
                    Ok(frame) if !frame.is_for(&conversation_id) => {
                        tracing::trace!(
                            conversation = %conversation_id,
                            frame = frame.name(),
                            "skipping frame for another conversation"
                        );
                    }
                    Ok(frame) => {
                        if tx.send(Ok(frame)).is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        let _ = tx.send(Err(err));
                        break;
                    }
                }
            }
            Ok(None) => {
                tracing::debug!(conversation = %conversation_id, "server closed connection");
                break;
            }
            Err(err) => {
                let _ = tx.send(Err(err.into()));
                break;
            }
        }
    }

    if let Err(err) = writer.shutdown().await {
        tracing::debug!(conversation = %conversation_id, error = %err, "socket shutdown failed");
    }
    drop(lease);
}

/// Opens conversation streams on behalf of the stream controller
pub trait StreamSource: Send + Sync + 'static {
    /// Open a subscription; `Ok(None)` means the conversation cannot be streamed
    ///
    /// The returned stream must be closed through `closer`. Closing it while
    /// the open is still pending cancels the open and releases the socket.
    fn open(
        &self,
        conversation_id: ConversationId,
        user_id: String,
        closer: CloseHandle,
    ) -> BoxFuture<'static, TransportResult<Option<ConversationStream>>>;
}

/// Opens one TCP connection per subscription
#[derive(Debug, Clone)]
pub struct TcpSource {
    endpoint: String,
    connection: Arc<ConnectionManager>,
}

impl TcpSource {
    /// Connect to `endpoint` (`host:port`), reporting to the global connection manager
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self::with_connection(endpoint, ConnectionManager::global())
    }

    /// Connect to `endpoint`, reporting to `connection`
    pub fn with_connection(
        endpoint: impl Into<String>,
        connection: Arc<ConnectionManager>,
    ) -> Self {
        Self {
            endpoint: endpoint.into(),
            connection,
        }
    }

    /// Endpoint this source connects to
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

impl StreamSource for TcpSource {
    fn open(
        &self,
        conversation_id: ConversationId,
        user_id: String,
        closer: CloseHandle,
    ) -> BoxFuture<'static, TransportResult<Option<ConversationStream>>> {
        let endpoint = self.endpoint.clone();
        let connection = Arc::clone(&self.connection);

        Box::pin(async move {
            if streamable(Some(&conversation_id), Some(&user_id)).is_none() {
                return Ok(None);
            }

            connection.begin_connect();
            let connected = tokio::select! {
                biased;
                _ = closer.closed() => None,
                connected = TcpStream::connect(&endpoint) => Some(connected),
            };
            let socket = match connected {
                Some(Ok(socket)) => socket,
                Some(Err(err)) => {
                    connection.connect_failed(err.to_string());
                    return Err(err.into());
                }
                None => {
                    connection.connect_failed("cancelled");
                    return Err(TransportError::Cancelled);
                }
            };
            socket.set_nodelay(true).ok();

            Subscriber::new(socket)
                .with_lease(connection.register())
                .with_closer(closer)
                .stream(Some(&conversation_id), Some(&user_id))
                .await
        })
    }
}
