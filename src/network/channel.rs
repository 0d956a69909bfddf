//! Channel transport
//!
//! One WebSocket per channel, driven by a dedicated task. Requests queue on an
//! unbounded mpsc and the task only pulls the next one after the previous one
//! has settled, so at most one request is ever in flight and replies reach
//! callers in issue order.

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::error::{ChannelError, Error, Result};
use crate::protocol::{decode_incoming, ChannelKind, Command, Incoming, Reply};
use crate::session::events::{ChannelEvent, CloseReason, Lifecycle};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Time allowed for a polite close handshake
const CLOSE_GRACE: Duration = Duration::from_millis(500);

/// Socket status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelStatus {
    Closed,
    Connecting,
    Open,
    Closing,
}

/// A request waiting for its turn or its reply
struct PendingRequest {
    command: &'static str,
    payload: String,
    reply: oneshot::Sender<Result<Reply>>,
}

impl PendingRequest {
    fn settle(self, result: Result<Reply>) {
        // The caller may have stopped waiting
        let _ = self.reply.send(result);
    }
}

/// Handle to a running socket task
struct Link {
    requests: mpsc::UnboundedSender<PendingRequest>,
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

/// One engine socket with a FIFO request queue
pub struct Channel {
    kind: ChannelKind,
    connect_timeout: Duration,
    request_timeout: Duration,
    status: Arc<Mutex<ChannelStatus>>,
    link: Mutex<Option<Link>>,
    events: mpsc::UnboundedSender<ChannelEvent>,
}

impl Channel {
    /// Create a closed channel; lifecycle notifications go to `events`
    pub fn new(
        kind: ChannelKind,
        connect_timeout: Duration,
        request_timeout: Duration,
        events: mpsc::UnboundedSender<ChannelEvent>,
    ) -> Self {
        Self {
            kind,
            connect_timeout,
            request_timeout,
            status: Arc::new(Mutex::new(ChannelStatus::Closed)),
            link: Mutex::new(None),
            events,
        }
    }

    pub fn kind(&self) -> ChannelKind {
        self.kind
    }

    pub fn status(&self) -> ChannelStatus {
        *self.status.lock()
    }

    pub fn is_open(&self) -> bool {
        self.status() == ChannelStatus::Open
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    /// Open the socket, replacing any previous one.
    ///
    /// Resolves once the WebSocket handshake completes, or fails after the
    /// connect timeout.
    pub async fn open(&self, url: &str) -> std::result::Result<(), ChannelError> {
        self.close().await;

        *self.status.lock() = ChannelStatus::Connecting;
        info!("Opening {} channel to {}", self.kind, url);

        let socket = match tokio::time::timeout(self.connect_timeout, connect_async(url)).await {
            Ok(Ok((socket, _response))) => socket,
            Ok(Err(e)) => {
                return Err(self.open_failed(ChannelError::ConnectFailed {
                    url: url.to_string(),
                    reason: e.to_string(),
                }))
            }
            Err(_) => return Err(self.open_failed(ChannelError::ConnectTimeout(url.to_string()))),
        };

        let (request_tx, request_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let worker = LinkWorker {
            kind: self.kind,
            socket,
            requests: request_rx,
            shutdown: shutdown_rx,
            request_timeout: self.request_timeout,
            status: Arc::clone(&self.status),
            events: self.events.clone(),
        };

        *self.status.lock() = ChannelStatus::Open;
        self.emit(Lifecycle::Opened);

        let task = tokio::spawn(worker.run());
        *self.link.lock() = Some(Link {
            requests: request_tx,
            shutdown: shutdown_tx,
            task,
        });

        info!("{} channel open", self.kind);
        Ok(())
    }

    /// Issue a command and wait for its reply.
    ///
    /// Queues behind any request already in flight. A timeout rejects only
    /// this request; the channel stays open for the next one.
    pub async fn send<C: Command>(&self, command: &C) -> Result<Reply> {
        debug_assert_eq!(C::CHANNEL, self.kind);

        let payload = command.encode()?;
        let (reply_tx, reply_rx) = oneshot::channel();
        let request = PendingRequest {
            command: command.name(),
            payload,
            reply: reply_tx,
        };

        let queued = {
            let link = self.link.lock();
            match link.as_ref() {
                Some(link) => link.requests.send(request).is_ok(),
                None => false,
            }
        };
        if !queued {
            return Err(ChannelError::NotOpen(self.kind).into());
        }

        reply_rx
            .await
            .unwrap_or_else(|_| Err(ChannelError::Closed.into()))
    }

    /// Reject everything queued or in flight and tear the socket down.
    ///
    /// No-op on a channel that is already closed.
    pub async fn close(&self) {
        let link = self.link.lock().take();
        let Some(link) = link else {
            return;
        };

        {
            let mut status = self.status.lock();
            if *status == ChannelStatus::Open {
                *status = ChannelStatus::Closing;
            }
        }

        let _ = link.shutdown.send(());
        if let Err(e) = link.task.await {
            warn!("{} channel task ended abnormally: {}", self.kind, e);
            *self.status.lock() = ChannelStatus::Closed;
        }
    }

    fn open_failed(&self, error: ChannelError) -> ChannelError {
        warn!("{} channel failed to open: {}", self.kind, error);
        *self.status.lock() = ChannelStatus::Closed;
        self.emit(Lifecycle::OpenFailed(error.to_string()));
        error
    }

    fn emit(&self, lifecycle: Lifecycle) {
        let _ = self.events.send(ChannelEvent::new(self.kind, lifecycle));
    }
}

/// Outcome of reading one frame from the socket
enum Frame {
    Text(String),
    Ignored,
    End(CloseReason),
}

fn classify(frame: Option<std::result::Result<Message, tungstenite::Error>>) -> Frame {
    match frame {
        Some(Ok(Message::Text(text))) => Frame::Text(text),
        Some(Ok(Message::Close(_))) | None => Frame::End(CloseReason::Remote),
        Some(Ok(_)) => Frame::Ignored,
        Some(Err(tungstenite::Error::ConnectionClosed)) => Frame::End(CloseReason::Remote),
        Some(Err(e)) => Frame::End(CloseReason::Error(e.to_string())),
    }
}

fn close_error(reason: &CloseReason) -> Error {
    match reason {
        CloseReason::Error(e) => ChannelError::Transport(e.clone()).into(),
        CloseReason::Requested | CloseReason::Remote => ChannelError::Closed.into(),
    }
}

/// Task that owns the socket while the channel is open
struct LinkWorker {
    kind: ChannelKind,
    socket: Socket,
    requests: mpsc::UnboundedReceiver<PendingRequest>,
    shutdown: oneshot::Receiver<()>,
    request_timeout: Duration,
    status: Arc<Mutex<ChannelStatus>>,
    events: mpsc::UnboundedSender<ChannelEvent>,
}

impl LinkWorker {
    async fn run(mut self) {
        let reason = self.serve().await;
        self.teardown(reason).await;
    }

    async fn serve(&mut self) -> CloseReason {
        loop {
            let request = tokio::select! {
                biased;
                _ = &mut self.shutdown => return CloseReason::Requested,
                request = self.requests.recv() => match request {
                    Some(request) => request,
                    None => return CloseReason::Requested,
                },
                frame = self.socket.next() => match classify(frame) {
                    Frame::Text(text) => {
                        warn!("Discarding unsolicited {} frame: {}", self.kind, text);
                        continue;
                    }
                    Frame::Ignored => continue,
                    Frame::End(reason) => return reason,
                },
            };

            if let Some(reason) = self.exchange(request).await {
                return reason;
            }
        }
    }

    /// Send one request and wait for its reply, its deadline, or shutdown.
    ///
    /// Returns a close reason if the socket can no longer be used.
    ///
    /// Replies carry no request id, so they are matched by command name only:
    /// a late reply to a timed-out request settles the next queued request
    /// with the same name.
    async fn exchange(&mut self, request: PendingRequest) -> Option<CloseReason> {
        let command = request.command;
        debug!(channel = %self.kind, command, "-> {}", request.payload);

        if let Err(e) = self.socket.send(Message::Text(request.payload.clone())).await {
            let reason = CloseReason::Error(e.to_string());
            request.settle(Err(close_error(&reason)));
            return Some(reason);
        }

        let deadline = tokio::time::sleep(self.request_timeout);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                biased;
                _ = &mut self.shutdown => {
                    request.settle(Err(ChannelError::Closed.into()));
                    return Some(CloseReason::Requested);
                }
                _ = &mut deadline => {
                    warn!("{} request {} timed out", self.kind, command);
                    request.settle(Err(ChannelError::Timeout {
                        command: command.to_string(),
                        timeout_ms: self.request_timeout.as_millis() as u64,
                    }
                    .into()));
                    return None;
                }
                frame = self.socket.next() => match classify(frame) {
                    Frame::Text(text) => match decode_incoming(&text) {
                        Ok(Incoming::Reply { command: name, reply }) if name == command => {
                            debug!(channel = %self.kind, command, "<- {}", reply.result);
                            request.settle(Ok(reply));
                            return None;
                        }
                        Ok(Incoming::Reply { command: name, .. }) => {
                            warn!("Discarding stale {} reply while waiting for {}", name, command);
                        }
                        Ok(Incoming::Invalid(reason)) => {
                            request.settle(Err(Error::Rejected {
                                command: command.to_string(),
                                result: format!("Invalid: {}", reason),
                            }));
                            return None;
                        }
                        Err(e) => {
                            request.settle(Err(e.into()));
                            return None;
                        }
                    },
                    Frame::Ignored => {}
                    Frame::End(reason) => {
                        request.settle(Err(close_error(&reason)));
                        return Some(reason);
                    }
                },
            }
        }
    }

    async fn teardown(mut self, reason: CloseReason) {
        *self.status.lock() = ChannelStatus::Closing;

        self.requests.close();
        let mut rejected = 0usize;
        while let Ok(request) = self.requests.try_recv() {
            request.settle(Err(ChannelError::Closed.into()));
            rejected += 1;
        }

        if reason == CloseReason::Requested {
            let _ = tokio::time::timeout(CLOSE_GRACE, self.socket.close(None)).await;
        }

        *self.status.lock() = ChannelStatus::Closed;
        match &reason {
            CloseReason::Requested => info!("{} channel closed ({} queued rejected)", self.kind, rejected),
            other => warn!("{} channel lost: {:?} ({} queued rejected)", self.kind, other, rejected),
        }
        let _ = self
            .events
            .send(ChannelEvent::new(self.kind, Lifecycle::Closed(reason)));
    }
}
