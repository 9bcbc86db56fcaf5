//! Connection lifecycle and frame dispatch.
//!
//! One background driver task owns the socket halves, the pending-request
//! store, and the keepalive state; everything else talks to it over channels.
//! Concurrency on the wire comes from interleaving request ids, not from
//! parallel protocol logic.
//!
//! The driver opens the socket lazily on the first command (or an explicit
//! [`AgentClient::connect`]), retries failed attempts per the configured
//! [`ReconnectPolicy`](crate::config::ReconnectPolicy) while the desired
//! state is open, and stops only on [`AgentClient::disconnect`] or when every
//! handle is dropped.

use std::{
    collections::VecDeque,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{
    SinkExt, Stream, StreamExt,
    stream::{SplitSink, SplitStream},
};
use serde::Serialize;
use serde_json::{Value, json};
use tokio::{
    net::TcpStream,
    sync::{mpsc, oneshot, watch},
    time::{Sleep, sleep, timeout},
};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use crate::{
    codec::{self, Frame},
    config::AgentConfig,
    endpoint::EndpointProvider,
    error::{AgentError, AgentResult},
    pending::{Completion, FrameHandler, PendingStore},
};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

/// Connection state machine states. Only [`Open`](ConnectionState::Open)
/// permits transmitting frames.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    /// No socket and no desire for one.
    Idle,
    /// Attempting to open a socket (including retry waits).
    Connecting,
    /// Socket established; traffic flows.
    Open,
    /// Graceful teardown in progress.
    Closing,
}

impl ConnectionState {
    /// Check if the connection is ready for traffic.
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Open)
    }
}

/// Generation counter distinguishing successive underlying sockets of one
/// logical connection.
///
/// Work captured under epoch N must not touch the connection once the epoch
/// is N+1; stream chunks carry their epoch and stale ones are discarded.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionEpoch(pub u64);

impl ConnectionEpoch {
    fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

/// Lifecycle notifications emitted by the driver.
#[derive(Clone, Debug)]
pub enum Event {
    /// A new underlying socket reached the open state.
    Connected {
        /// Epoch of the new socket.
        epoch: ConnectionEpoch,
    },
    /// The underlying socket was lost or closed.
    Disconnected {
        /// Epoch of the socket that went away.
        epoch: ConnectionEpoch,
        /// Human-readable cause.
        reason: String,
    },
}

pub(crate) enum ControlCommand {
    Connect {
        reply_tx: oneshot::Sender<AgentResult<()>>,
    },
    Disconnect {
        reply_tx: oneshot::Sender<()>,
    },
}

pub(crate) enum DataCommand {
    Request {
        message: Value,
        handler: FrameHandler,
        reply_tx: oneshot::Sender<AgentResult<(u32, ConnectionEpoch)>>,
    },
    Chunk {
        id: u32,
        payload: Bytes,
        epoch: ConnectionEpoch,
    },
}

/// Stream of lifecycle [`Event`]s for one logical connection.
pub struct EventStream {
    rx: mpsc::Receiver<Event>,
}

impl EventStream {
    /// Receive the next event.
    pub async fn next(&mut self) -> Option<Event> {
        self.rx.recv().await
    }
}

impl Stream for EventStream {
    type Item = Event;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().rx.poll_recv(cx)
    }
}

/// Clonable handle to one logical device-channel connection.
///
/// All clones share the same driver task, socket, and request id space. A
/// caller that needs an indefinite subscription alongside ordinary blocking
/// commands should create a second client: the subscription permanently
/// occupies one id on its connection (see [`crate::crash`]).
#[derive(Clone)]
pub struct AgentClient {
    ctrl_tx: mpsc::Sender<ControlCommand>,
    cmd_tx: mpsc::Sender<DataCommand>,
    pending: Arc<PendingStore>,
    state_rx: watch::Receiver<ConnectionState>,
}

impl AgentClient {
    /// Create the client and spawn its driver task.
    ///
    /// The socket is opened lazily on the first command or an explicit
    /// [`connect`](Self::connect); `provider` is re-invoked for the URL on
    /// every attempt.
    pub fn new<P: EndpointProvider>(
        provider: P,
        config: AgentConfig,
    ) -> AgentResult<(Self, EventStream)> {
        config.validate().map_err(AgentError::config)?;

        let config = Arc::new(config);
        let (ctrl_tx, ctrl_rx) = mpsc::channel(config.command_channel_capacity);
        let (cmd_tx, cmd_rx) = mpsc::channel(config.command_channel_capacity);
        let (event_tx, event_rx) = mpsc::channel(config.event_channel_capacity);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Idle);
        let pending = Arc::new(PendingStore::new());

        tokio::spawn(connection_driver(
            config,
            Arc::new(provider) as Arc<dyn EndpointProvider>,
            ctrl_rx,
            cmd_rx,
            event_tx,
            state_tx,
            Arc::clone(&pending),
        ));

        Ok((
            Self {
                ctrl_tx,
                cmd_tx,
                pending,
                state_rx,
            },
            EventStream { rx: event_rx },
        ))
    }

    /// Open the connection, resolving once it is usable.
    ///
    /// Idempotent: concurrent callers share the in-flight attempt, and a
    /// call on an open connection returns immediately.
    pub async fn connect(&self) -> AgentResult<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.ctrl_tx
            .send(ControlCommand::Connect { reply_tx })
            .await
            .map_err(|_| AgentError::connection("driver task shut down"))?;
        reply_rx
            .await
            .map_err(|_| AgentError::connection("driver task shut down"))?
    }

    /// Close the connection, cancel retries, and fail every pending request
    /// with [`AgentError::Cancelled`]. Safe to call repeatedly; a second
    /// call on an idle connection is a no-op.
    pub async fn disconnect(&self) -> AgentResult<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .ctrl_tx
            .send(ControlCommand::Disconnect { reply_tx })
            .await
            .is_err()
        {
            // driver already gone; nothing to tear down
            return Ok(());
        }
        let _ = reply_rx.await;
        Ok(())
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        self.state_rx.borrow().clone()
    }

    /// Check if the connection is ready for traffic.
    pub fn is_open(&self) -> bool {
        self.state().is_open()
    }

    /// Number of requests currently awaiting frames.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Register `handler` under a fresh request id, merge the id into
    /// `message`, and transmit it once the connection is open.
    ///
    /// The handler sees every frame that arrives for the id, in arrival
    /// order, until it returns a terminal [`Completion`]. Commands issued
    /// while the connection is down wait in the driver's queue; there is no
    /// built-in per-command timeout.
    pub async fn send(&self, message: Value, handler: FrameHandler) -> AgentResult<u32> {
        self.send_with_epoch(message, handler)
            .await
            .map(|(id, _)| id)
    }

    pub(crate) async fn send_with_epoch(
        &self,
        message: Value,
        handler: FrameHandler,
    ) -> AgentResult<(u32, ConnectionEpoch)> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(DataCommand::Request {
                message,
                handler,
                reply_tx,
            })
            .await
            .map_err(|_| AgentError::connection("driver task shut down"))?;
        reply_rx
            .await
            .map_err(|_| AgentError::connection("driver task shut down"))?
    }

    /// Forward one binary chunk for an in-flight streaming request.
    pub(crate) async fn send_chunk(
        &self,
        id: u32,
        payload: Bytes,
        epoch: ConnectionEpoch,
    ) -> AgentResult<()> {
        self.cmd_tx
            .send(DataCommand::Chunk { id, payload, epoch })
            .await
            .map_err(|_| AgentError::connection("driver task shut down"))
    }

    /// Issue a `(type, op, params)` command and resolve on its first
    /// response frame, with the `id` member stripped from the resolved
    /// value. A frame carrying an `error` member rejects with
    /// [`AgentError::Command`].
    pub async fn command<P: Serialize>(
        &self,
        kind: &str,
        op: &str,
        params: P,
    ) -> AgentResult<Value> {
        self.run_command(kind, op, params, None).await
    }

    /// Like [`command`](Self::command), but frames lacking both `success`
    /// and `error` members are progress notifications: each one is handed to
    /// `on_progress` and the command stays pending until a terminal frame.
    pub async fn command_with_progress<P, F>(
        &self,
        kind: &str,
        op: &str,
        params: P,
        on_progress: F,
    ) -> AgentResult<Value>
    where
        P: Serialize,
        F: FnMut(Value) + Send + Sync + 'static,
    {
        self.run_command(kind, op, params, Some(Box::new(on_progress)))
            .await
    }

    async fn run_command<P: Serialize>(
        &self,
        kind: &str,
        op: &str,
        params: P,
        progress: Option<Box<dyn FnMut(Value) + Send + Sync>>,
    ) -> AgentResult<Value> {
        let message = build_command(kind, op, params)?;
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(message, command_handler(reply_tx, progress))
            .await?;
        reply_rx
            .await
            .map_err(|_| AgentError::internal("response channel dropped"))?
    }
}

/// Build the control message for a `(type, op, params)` command. `params`
/// must serialize to a JSON object (or null for none).
fn build_command<P: Serialize>(kind: &str, op: &str, params: P) -> AgentResult<Value> {
    let mut message = serde_json::to_value(params)?;
    if message.is_null() {
        message = json!({});
    }
    let Some(object) = message.as_object_mut() else {
        return Err(AgentError::protocol(
            "command params must serialize to a JSON object",
        ));
    };
    object.insert("type".to_string(), Value::from(kind));
    object.insert("op".to_string(), Value::from(op));
    Ok(message)
}

fn strip_id(mut value: Value) -> Value {
    if let Some(object) = value.as_object_mut() {
        object.remove("id");
    }
    value
}

/// Handler implementing the command completion rules of
/// [`AgentClient::command`] and [`AgentClient::command_with_progress`].
fn command_handler(
    reply_tx: oneshot::Sender<AgentResult<Value>>,
    mut progress: Option<Box<dyn FnMut(Value) + Send + Sync>>,
) -> FrameHandler {
    let mut reply_tx = Some(reply_tx);
    Box::new(move |event| {
        let frame = match event {
            Ok(frame) => frame,
            Err(err) => {
                if let Some(tx) = reply_tx.take() {
                    let _ = tx.send(Err(err.clone()));
                }
                return Completion::Failed(err);
            }
        };
        let Frame::Control(value) = frame else {
            // binary frames carry no meaning for a plain command
            return Completion::Pending;
        };
        if let Some(error) = value.get("error") {
            let err = AgentError::Command(error.clone());
            if let Some(tx) = reply_tx.take() {
                let _ = tx.send(Err(err.clone()));
            }
            return Completion::Failed(err);
        }
        if let Some(on_progress) = progress.as_mut()
            && value.get("success").is_none()
        {
            on_progress(strip_id(value));
            return Completion::Pending;
        }
        let value = strip_id(value);
        if let Some(tx) = reply_tx.take() {
            let _ = tx.send(Ok(value.clone()));
        }
        Completion::Done(value)
    })
}

/// Write half of the socket, as a seam so the driver loop can be exercised
/// against in-memory transports in tests.
#[async_trait]
pub(crate) trait WsWriter: Send {
    async fn send_frame(&mut self, message: Message) -> AgentResult<()>;
    async fn shutdown(&mut self);
}

#[async_trait]
impl WsWriter for WsSink {
    async fn send_frame(&mut self, message: Message) -> AgentResult<()> {
        self.send(message)
            .await
            .map_err(|e| AgentError::connection(e.to_string()))
    }

    async fn shutdown(&mut self) {
        let _ = self.close().await;
    }
}

enum TaskExit {
    /// `disconnect()` was requested; reply once teardown is finished.
    Disconnect(oneshot::Sender<()>),
    /// Every handle was dropped.
    Shutdown,
    /// The transport failed.
    Failed(AgentError),
}

enum ConnectOutcome {
    Ready(WsSink, WsSource),
    Failed(AgentError),
    Aborted(oneshot::Sender<()>),
    Shutdown,
}

async fn connection_driver(
    config: Arc<AgentConfig>,
    provider: Arc<dyn EndpointProvider>,
    mut ctrl_rx: mpsc::Receiver<ControlCommand>,
    mut cmd_rx: mpsc::Receiver<DataCommand>,
    event_tx: mpsc::Sender<Event>,
    state_tx: watch::Sender<ConnectionState>,
    pending: Arc<PendingStore>,
) {
    let mut epoch = ConnectionEpoch(0);
    let mut desired_open = false;
    let mut attempt: u32 = 0;
    let mut connect_waiters: Vec<oneshot::Sender<AgentResult<()>>> = Vec::new();
    let mut queued: VecDeque<DataCommand> = VecDeque::new();

    loop {
        if !desired_open {
            state_tx.send_replace(ConnectionState::Idle);
            // park until something wants the connection open
            tokio::select! {
                ctrl = ctrl_rx.recv() => match ctrl {
                    Some(ControlCommand::Connect { reply_tx }) => {
                        connect_waiters.push(reply_tx);
                        desired_open = true;
                        attempt = 0;
                    }
                    Some(ControlCommand::Disconnect { reply_tx }) => {
                        let _ = reply_tx.send(());
                    }
                    None => return,
                },
                cmd = cmd_rx.recv() => match cmd {
                    Some(cmd @ DataCommand::Request { .. }) => {
                        queued.push_back(cmd);
                        desired_open = true;
                        attempt = 0;
                    }
                    Some(DataCommand::Chunk { id, .. }) => {
                        debug!(id, "dropping stream chunk with no connection");
                    }
                    None => return,
                },
            }
            continue;
        }

        state_tx.send_replace(ConnectionState::Connecting);
        let (ws_write, ws_read) = match attempt_connect(
            &config,
            provider.as_ref(),
            &mut ctrl_rx,
            &mut connect_waiters,
        )
        .await
        {
            ConnectOutcome::Ready(write, read) => (write, read),
            ConnectOutcome::Failed(err) => {
                warn!(error = %err, attempt, "connection attempt failed");
                // requests already on the wire die with the transport; queued
                // ones wait for the next attempt
                pending.fail_all(|| AgentError::connection(err.to_string()));
                if config.reconnect.max_attempts.is_some_and(|max| attempt >= max) {
                    state_tx.send_replace(ConnectionState::Idle);
                    abort_open(&mut desired_open, &mut connect_waiters, &mut queued, || {
                        AgentError::connection(format!("giving up after {attempt} attempts: {err}"))
                    });
                    continue;
                }
                let delay = config.reconnect.delay_for(attempt);
                attempt = attempt.saturating_add(1);
                if let Some(reply_tx) =
                    sleep_responsive(delay, &mut ctrl_rx, &mut connect_waiters).await
                {
                    abort_open(&mut desired_open, &mut connect_waiters, &mut queued, || {
                        AgentError::Cancelled
                    });
                    state_tx.send_replace(ConnectionState::Idle);
                    let _ = reply_tx.send(());
                }
                continue;
            }
            ConnectOutcome::Aborted(reply_tx) => {
                abort_open(&mut desired_open, &mut connect_waiters, &mut queued, || {
                    AgentError::Cancelled
                });
                state_tx.send_replace(ConnectionState::Idle);
                let _ = reply_tx.send(());
                continue;
            }
            ConnectOutcome::Shutdown => return,
        };

        attempt = 0;
        epoch = epoch.next();
        state_tx.send_replace(ConnectionState::Open);
        info!(epoch = epoch.0, "device channel open");
        for waiter in connect_waiters.drain(..) {
            let _ = waiter.send(Ok(()));
        }
        notify(&event_tx, Event::Connected { epoch });

        let mut ws_write = ws_write;
        let ws_read = ws_read.map(|r| r.map_err(|e| AgentError::connection(e.to_string())));
        let exit = connection_task(
            &config,
            &mut ctrl_rx,
            &mut cmd_rx,
            &pending,
            epoch,
            &mut queued,
            ws_read,
            &mut ws_write,
        )
        .await;

        match exit {
            TaskExit::Disconnect(reply_tx) => {
                state_tx.send_replace(ConnectionState::Closing);
                ws_write.shutdown().await;
                pending.fail_all(|| AgentError::Cancelled);
                drain_queued(&mut cmd_rx, &mut queued, || AgentError::Cancelled);
                desired_open = false;
                notify(
                    &event_tx,
                    Event::Disconnected {
                        epoch,
                        reason: "disconnect requested".to_string(),
                    },
                );
                state_tx.send_replace(ConnectionState::Idle);
                let _ = reply_tx.send(());
            }
            TaskExit::Shutdown => {
                ws_write.shutdown().await;
                pending.fail_all(|| AgentError::Cancelled);
                state_tx.send_replace(ConnectionState::Idle);
                return;
            }
            TaskExit::Failed(err) => {
                warn!(error = %err, epoch = epoch.0, "connection lost");
                ws_write.shutdown().await;
                pending.fail_all(|| AgentError::connection(err.to_string()));
                notify(
                    &event_tx,
                    Event::Disconnected {
                        epoch,
                        reason: err.to_string(),
                    },
                );
                state_tx.send_replace(ConnectionState::Connecting);
                let delay = config.reconnect.delay_for(attempt);
                attempt = attempt.saturating_add(1);
                if let Some(reply_tx) =
                    sleep_responsive(delay, &mut ctrl_rx, &mut connect_waiters).await
                {
                    abort_open(&mut desired_open, &mut connect_waiters, &mut queued, || {
                        AgentError::Cancelled
                    });
                    state_tx.send_replace(ConnectionState::Idle);
                    let _ = reply_tx.send(());
                }
            }
        }
    }
}

/// Fail connect waiters and queued requests, and drop the desire to be open.
fn abort_open(
    desired_open: &mut bool,
    connect_waiters: &mut Vec<oneshot::Sender<AgentResult<()>>>,
    queued: &mut VecDeque<DataCommand>,
    make_error: impl Fn() -> AgentError,
) {
    *desired_open = false;
    for waiter in connect_waiters.drain(..) {
        let _ = waiter.send(Err(make_error()));
    }
    for cmd in queued.drain(..) {
        if let DataCommand::Request { reply_tx, .. } = cmd {
            let _ = reply_tx.send(Err(make_error()));
        }
    }
}

/// Fail everything still waiting in the command channel. Used on explicit
/// disconnect so queued requests reject instead of resurrecting the
/// connection.
fn drain_queued(
    cmd_rx: &mut mpsc::Receiver<DataCommand>,
    queued: &mut VecDeque<DataCommand>,
    make_error: impl Fn() -> AgentError,
) {
    while let Ok(cmd) = cmd_rx.try_recv() {
        queued.push_back(cmd);
    }
    for cmd in queued.drain(..) {
        if let DataCommand::Request { reply_tx, .. } = cmd {
            let _ = reply_tx.send(Err(make_error()));
        }
    }
}

fn notify(event_tx: &mpsc::Sender<Event>, event: Event) {
    if let Err(err) = event_tx.try_send(event) {
        debug!(error = %err, "dropping lifecycle event");
    }
}

/// Resolve the endpoint and open the socket, staying responsive to control
/// commands so a blocked provider cannot wedge `disconnect()`.
async fn attempt_connect(
    config: &AgentConfig,
    provider: &dyn EndpointProvider,
    ctrl_rx: &mut mpsc::Receiver<ControlCommand>,
    connect_waiters: &mut Vec<oneshot::Sender<AgentResult<()>>>,
) -> ConnectOutcome {
    let open = open_socket(config, provider);
    tokio::pin!(open);
    loop {
        tokio::select! {
            result = &mut open => {
                return match result {
                    Ok((write, read)) => ConnectOutcome::Ready(write, read),
                    Err(err) => ConnectOutcome::Failed(err),
                };
            }
            ctrl = ctrl_rx.recv() => match ctrl {
                Some(ControlCommand::Connect { reply_tx }) => connect_waiters.push(reply_tx),
                Some(ControlCommand::Disconnect { reply_tx }) => {
                    return ConnectOutcome::Aborted(reply_tx);
                }
                None => return ConnectOutcome::Shutdown,
            },
        }
    }
}

async fn open_socket(
    config: &AgentConfig,
    provider: &dyn EndpointProvider,
) -> AgentResult<(WsSink, WsSource)> {
    // the provider may block while the remote assigns an endpoint; only the
    // socket dial itself is bounded
    let url = provider.websocket_url().await?;
    debug!(url = %url, "dialing device channel");

    let (ws, _response) = timeout(config.connect_timeout, connect_async(url.as_str()))
        .await
        .map_err(|_| AgentError::timeout(config.connect_timeout))?
        .map_err(|e| AgentError::connection(e.to_string()))?;

    let (write, read) = ws.split();
    Ok((write, read))
}

/// Sleep between attempts while servicing control commands. Returns the
/// disconnect reply sender if a disconnect arrived mid-sleep.
async fn sleep_responsive(
    delay: Duration,
    ctrl_rx: &mut mpsc::Receiver<ControlCommand>,
    connect_waiters: &mut Vec<oneshot::Sender<AgentResult<()>>>,
) -> Option<oneshot::Sender<()>> {
    debug!(delay_ms = delay.as_millis(), "waiting before reconnect");
    let wait = sleep(delay);
    tokio::pin!(wait);
    loop {
        tokio::select! {
            () = &mut wait => return None,
            ctrl = ctrl_rx.recv() => match ctrl {
                Some(ControlCommand::Connect { reply_tx }) => connect_waiters.push(reply_tx),
                Some(ControlCommand::Disconnect { reply_tx }) => return Some(reply_tx),
                None => {
                    // handles gone; a dummy sender lets the caller share the
                    // abort path
                    let (reply_tx, _reply_rx) = oneshot::channel();
                    return Some(reply_tx);
                }
            },
        }
    }
}

/// The event loop for one open socket.
#[allow(clippy::too_many_arguments)]
async fn connection_task<R, W>(
    config: &AgentConfig,
    ctrl_rx: &mut mpsc::Receiver<ControlCommand>,
    cmd_rx: &mut mpsc::Receiver<DataCommand>,
    pending: &PendingStore,
    epoch: ConnectionEpoch,
    queued: &mut VecDeque<DataCommand>,
    mut ws_read: R,
    ws_write: &mut W,
) -> TaskExit
where
    R: Stream<Item = AgentResult<Message>> + Unpin,
    W: WsWriter,
{
    // commands that arrived while the connection was down go out first
    while let Some(cmd) = queued.pop_front() {
        if let Err(err) = handle_data_command(cmd, pending, epoch, ws_write).await {
            return TaskExit::Failed(err);
        }
    }

    let mut ping_timer = tokio::time::interval(config.ping_interval);
    ping_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut watchdog: Option<Pin<Box<Sleep>>> = None;

    loop {
        tokio::select! {
            biased;
            ctrl = ctrl_rx.recv() => match ctrl {
                Some(ControlCommand::Connect { reply_tx }) => {
                    // already open
                    let _ = reply_tx.send(Ok(()));
                }
                Some(ControlCommand::Disconnect { reply_tx }) => {
                    return TaskExit::Disconnect(reply_tx);
                }
                None => return TaskExit::Shutdown,
            },
            cmd = cmd_rx.recv() => match cmd {
                Some(cmd) => {
                    if let Err(err) = handle_data_command(cmd, pending, epoch, ws_write).await {
                        return TaskExit::Failed(err);
                    }
                }
                None => return TaskExit::Shutdown,
            },
            message = ws_read.next() => match message {
                Some(Ok(message)) => {
                    if let Some(exit) =
                        handle_message(config, pending, ws_write, &mut watchdog, message).await
                    {
                        return exit;
                    }
                }
                Some(Err(err)) => return TaskExit::Failed(err),
                None => {
                    return TaskExit::Failed(AgentError::connection("connection closed by server"));
                }
            },
            _ = ping_timer.tick() => {
                if let Err(err) = ws_write.send_frame(Message::Ping(Bytes::new())).await {
                    return TaskExit::Failed(err);
                }
                if watchdog.is_none() {
                    watchdog = Some(Box::pin(sleep(config.pong_timeout)));
                }
            }
            () = watchdog_fired(&mut watchdog), if watchdog.is_some() => {
                return TaskExit::Failed(AgentError::timeout(config.pong_timeout));
            }
        }
    }
}

async fn watchdog_fired(watchdog: &mut Option<Pin<Box<Sleep>>>) {
    match watchdog.as_mut() {
        Some(timer) => timer.as_mut().await,
        None => std::future::pending().await,
    }
}

/// Transmit one queued command. A send failure is a transport failure that
/// tears the connection down.
async fn handle_data_command<W: WsWriter>(
    cmd: DataCommand,
    pending: &PendingStore,
    epoch: ConnectionEpoch,
    ws_write: &mut W,
) -> AgentResult<()> {
    match cmd {
        DataCommand::Request {
            message,
            handler,
            reply_tx,
        } => {
            let id = pending.allocate_id();
            let encoded = match codec::encode_control(message, id) {
                Ok(encoded) => encoded,
                Err(err) => {
                    // caller error, not a transport failure
                    let _ = reply_tx.send(Err(err));
                    return Ok(());
                }
            };
            pending.register(id, handler);
            if let Err(err) = ws_write.send_frame(encoded).await {
                pending.fail_one(id, err.clone());
                let _ = reply_tx.send(Err(err.clone()));
                return Err(err);
            }
            let _ = reply_tx.send(Ok((id, epoch)));
            Ok(())
        }
        DataCommand::Chunk {
            id,
            payload,
            epoch: chunk_epoch,
        } => {
            if chunk_epoch != epoch {
                debug!(id, "dropping stream chunk from a previous connection");
                return Ok(());
            }
            ws_write.send_frame(codec::encode_binary(id, &payload)).await
        }
    }
}

/// Process one inbound message. Returns `Some` when the task must exit.
async fn handle_message<W: WsWriter>(
    config: &AgentConfig,
    pending: &PendingStore,
    ws_write: &mut W,
    watchdog: &mut Option<Pin<Box<Sleep>>>,
    message: Message,
) -> Option<TaskExit> {
    match &message {
        Message::Pong(_) => {
            *watchdog = None;
            return None;
        }
        Message::Ping(data) => {
            let _ = ws_write.send_frame(Message::Pong(data.clone())).await;
            return None;
        }
        Message::Close(_) => {
            return Some(TaskExit::Failed(AgentError::connection(
                "connection closed by server",
            )));
        }
        _ => {}
    }

    let size = message.len();
    if config.max_message_size > 0 && size > config.max_message_size {
        warn!(
            size,
            max = config.max_message_size,
            "dropping oversized message"
        );
        return None;
    }

    let frame = match codec::decode(message) {
        Ok(frame) => frame,
        Err(err) => {
            warn!(error = %err, "dropping malformed frame");
            return None;
        }
    };

    let Some(id) = frame.id() else {
        warn!("dropping control frame without id");
        return None;
    };

    match pending.dispatch(id, frame) {
        None => debug!(id, "dropping frame for unknown request id"),
        Some(Completion::Failed(err)) => debug!(id, error = %err, "request failed"),
        Some(_) => {}
    }
    None
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use futures_util::stream;
    use serde_json::json;
    use tokio::time::Duration;

    use super::*;

    #[derive(Default)]
    struct RecordingWriter {
        sent: Vec<Message>,
    }

    #[async_trait]
    impl WsWriter for RecordingWriter {
        async fn send_frame(&mut self, message: Message) -> AgentResult<()> {
            self.sent.push(message);
            Ok(())
        }

        async fn shutdown(&mut self) {}
    }

    struct FailingWriter;

    #[async_trait]
    impl WsWriter for FailingWriter {
        async fn send_frame(&mut self, _message: Message) -> AgentResult<()> {
            Err(AgentError::connection("sink closed"))
        }

        async fn shutdown(&mut self) {}
    }

    fn quiet_config() -> AgentConfig {
        AgentConfig::default()
            .ping_interval(Duration::from_secs(60))
            .pong_timeout(Duration::from_secs(60))
    }

    fn recording_handler(seen: Arc<Mutex<Vec<Value>>>) -> FrameHandler {
        Box::new(move |event| match event {
            Ok(Frame::Control(value)) => {
                seen.lock().unwrap().push(value);
                Completion::Done(Value::Null)
            }
            Ok(Frame::Binary { .. }) => Completion::Pending,
            Err(err) => Completion::Failed(err),
        })
    }

    #[tokio::test]
    async fn test_task_routes_frames_and_exits_on_disconnect() {
        let config = quiet_config();
        let (ctrl_tx, mut ctrl_rx) = mpsc::channel(4);
        let (_cmd_tx, mut cmd_rx) = mpsc::channel(4);
        let pending = PendingStore::new();
        let mut queued = VecDeque::new();

        let seen = Arc::new(Mutex::new(Vec::new()));
        pending.register(1, recording_handler(Arc::clone(&seen)));

        let (frame_tx, frame_rx) = mpsc::channel::<AgentResult<Message>>(4);
        frame_tx
            .send(Ok(Message::text(json!({"id": 1, "path": "/tmp/x"}).to_string())))
            .await
            .expect("seed frame");

        let ws_read = stream::unfold(frame_rx, |mut rx| async move {
            rx.recv().await.map(|message| (message, rx))
        })
        .boxed();
        let mut writer = RecordingWriter::default();

        let task = async {
            connection_task(
                &config,
                &mut ctrl_rx,
                &mut cmd_rx,
                &pending,
                ConnectionEpoch(1),
                &mut queued,
                ws_read,
                &mut writer,
            )
            .await
        };

        let (disconnect_tx, _disconnect_rx) = oneshot::channel();
        let exit = tokio::join!(task, async {
            // give the frame a chance to be routed first
            tokio::time::sleep(Duration::from_millis(50)).await;
            ctrl_tx
                .send(ControlCommand::Disconnect {
                    reply_tx: disconnect_tx,
                })
                .await
                .expect("send disconnect");
        })
        .0;

        assert!(matches!(exit, TaskExit::Disconnect(_)));
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0]["path"], "/tmp/x");
    }

    #[tokio::test]
    async fn test_watchdog_without_pong_fails_task() {
        let config = AgentConfig::default()
            .ping_interval(Duration::from_millis(10))
            .pong_timeout(Duration::from_millis(20));
        let (_ctrl_tx, mut ctrl_rx) = mpsc::channel(1);
        let (_cmd_tx, mut cmd_rx) = mpsc::channel(1);
        let pending = PendingStore::new();
        let mut queued = VecDeque::new();
        let mut writer = RecordingWriter::default();

        let exit = connection_task(
            &config,
            &mut ctrl_rx,
            &mut cmd_rx,
            &pending,
            ConnectionEpoch(1),
            &mut queued,
            stream::pending::<AgentResult<Message>>(),
            &mut writer,
        )
        .await;

        assert!(matches!(
            exit,
            TaskExit::Failed(AgentError::Timeout { .. })
        ));
        // at least the initial ping went out
        assert!(
            writer
                .sent
                .iter()
                .any(|message| matches!(message, Message::Ping(_)))
        );
    }

    #[tokio::test]
    async fn test_request_send_failure_fails_handler_and_task() {
        let pending = PendingStore::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let failed = Arc::new(Mutex::new(Vec::new()));

        let failed_clone = Arc::clone(&failed);
        let handler: FrameHandler = Box::new(move |event| match event {
            Ok(Frame::Control(value)) => {
                seen.lock().unwrap().push(value);
                Completion::Pending
            }
            Ok(Frame::Binary { .. }) => Completion::Pending,
            Err(err) => {
                failed_clone.lock().unwrap().push(err.clone());
                Completion::Failed(err)
            }
        });

        let (reply_tx, reply_rx) = oneshot::channel();
        let cmd = DataCommand::Request {
            message: json!({"type": "app", "op": "list"}),
            handler,
            reply_tx,
        };

        let result =
            handle_data_command(cmd, &pending, ConnectionEpoch(1), &mut FailingWriter).await;
        assert!(result.is_err());
        assert!(matches!(
            reply_rx.await.expect("reply"),
            Err(AgentError::Connection { .. })
        ));
        assert_eq!(failed.lock().unwrap().len(), 1);
        assert_eq!(pending.len(), 0);
    }

    #[tokio::test]
    async fn test_stale_chunk_is_dropped() {
        let pending = PendingStore::new();
        let mut writer = RecordingWriter::default();

        let stale = DataCommand::Chunk {
            id: 3,
            payload: Bytes::from_static(b"old"),
            epoch: ConnectionEpoch(1),
        };
        handle_data_command(stale, &pending, ConnectionEpoch(2), &mut writer)
            .await
            .expect("stale chunk is not an error");
        assert!(writer.sent.is_empty());

        let current = DataCommand::Chunk {
            id: 3,
            payload: Bytes::from_static(b"new"),
            epoch: ConnectionEpoch(2),
        };
        handle_data_command(current, &pending, ConnectionEpoch(2), &mut writer)
            .await
            .expect("current chunk sends");
        assert_eq!(writer.sent.len(), 1);
        match &writer.sent[0] {
            Message::Binary(data) => {
                assert_eq!(&data[0..4], &3u32.to_le_bytes());
                assert_eq!(&data[8..], b"new");
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unknown_id_and_malformed_frames_survive() {
        let config = quiet_config();
        let pending = PendingStore::new();
        let mut writer = RecordingWriter::default();
        let mut watchdog = None;

        // unmatched id
        let exit = handle_message(
            &config,
            &pending,
            &mut writer,
            &mut watchdog,
            Message::text(json!({"id": 99, "success": true}).to_string()),
        )
        .await;
        assert!(exit.is_none());

        // malformed JSON
        let exit = handle_message(
            &config,
            &pending,
            &mut writer,
            &mut watchdog,
            Message::text("not json"),
        )
        .await;
        assert!(exit.is_none());

        // short binary frame
        let exit = handle_message(
            &config,
            &pending,
            &mut writer,
            &mut watchdog,
            Message::binary(vec![1, 2]),
        )
        .await;
        assert!(exit.is_none());

        // server close is fatal
        let exit = handle_message(
            &config,
            &pending,
            &mut writer,
            &mut watchdog,
            Message::Close(None),
        )
        .await;
        assert!(matches!(exit, Some(TaskExit::Failed(_))));
    }

    #[test]
    fn test_build_command() {
        let message = build_command("file", "stat", json!({"path": "/tmp/x"})).expect("build");
        assert_eq!(message["type"], "file");
        assert_eq!(message["op"], "stat");
        assert_eq!(message["path"], "/tmp/x");

        let message = build_command("app", "list", Value::Null).expect("null params");
        assert_eq!(message["type"], "app");

        let result = build_command("app", "list", json!([1]));
        assert!(matches!(result, Err(AgentError::Protocol { .. })));
    }

    #[tokio::test]
    async fn test_command_handler_resolves_on_first_frame() {
        let (reply_tx, reply_rx) = oneshot::channel();
        let mut handler = command_handler(reply_tx, None);

        let completion = handler(Ok(Frame::Control(json!({"id": 1, "path": "/tmp/x"}))));
        assert!(matches!(completion, Completion::Done(_)));

        let value = reply_rx.await.expect("reply").expect("ok");
        assert_eq!(value, json!({"path": "/tmp/x"}));
    }

    #[tokio::test]
    async fn test_command_handler_error_frame() {
        let (reply_tx, reply_rx) = oneshot::channel();
        let mut handler = command_handler(reply_tx, None);

        let completion = handler(Ok(Frame::Control(
            json!({"id": 1, "error": {"message": "denied"}}),
        )));
        assert!(matches!(completion, Completion::Failed(_)));
        assert!(matches!(
            reply_rx.await.expect("reply"),
            Err(AgentError::Command(_))
        ));
    }

    #[tokio::test]
    async fn test_command_handler_progress_frames_stay_pending() {
        let (reply_tx, reply_rx) = oneshot::channel();
        let progress = Arc::new(Mutex::new(Vec::new()));
        let progress_clone = Arc::clone(&progress);
        let mut handler = command_handler(
            reply_tx,
            Some(Box::new(move |value| {
                progress_clone.lock().unwrap().push(value);
            })),
        );

        let completion = handler(Ok(Frame::Control(json!({"id": 1, "progress": 0.3}))));
        assert!(matches!(completion, Completion::Pending));
        let completion = handler(Ok(Frame::Control(json!({"id": 1, "progress": 0.7}))));
        assert!(matches!(completion, Completion::Pending));
        let completion = handler(Ok(Frame::Control(json!({"id": 1, "success": true}))));
        assert!(matches!(completion, Completion::Done(_)));

        let progress = progress.lock().unwrap();
        assert_eq!(progress.len(), 2);
        assert_eq!(progress[0]["progress"], 0.3);
        assert_eq!(progress[1]["progress"], 0.7);

        let value = reply_rx.await.expect("reply").expect("ok");
        assert_eq!(value, json!({"success": true}));
    }
}
