use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufWriter, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
#[cfg(unix)]
use tokio::net::UnixStream;
use tokio::sync::{mpsc, oneshot, watch};

use crate::channel::{CommandChannel, ReplySender};
use crate::command::{Command, FromResp, ToArg, cmd};
use crate::config::{ClosureCallback, ConnectionConfig, ServerAddress};
use crate::error::{Error, Result};
use crate::metrics;
use crate::pubsub::{
    CountSender, MessageReceiver, PubSubMultiplexer, PubSubStream, SubscribeHandler,
    SubscriptionKind, UnsubscribeHandler, UnsubscribeSource, message_channel,
};
use crate::resp::{self, RespValue};

/// Commands the server accepts while a connection is in subscriber mode.
const PUBSUB_ALLOWED_COMMANDS: [&str; 6] = [
    "SUBSCRIBE",
    "UNSUBSCRIBE",
    "PSUBSCRIBE",
    "PUNSUBSCRIBE",
    "PING",
    "QUIT",
];

/// Lifecycle of one connection. `Open` and `PubSub` flip back and forth;
/// everything else is monotonic and `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Open,
    PubSub,
    ShuttingDown,
    Closed,
}

fn state_from_u8(v: u8) -> ConnectionState {
    match v {
        0 => ConnectionState::Open,
        1 => ConnectionState::PubSub,
        2 => ConnectionState::ShuttingDown,
        _ => ConnectionState::Closed,
    }
}

trait Transport: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> Transport for T {}

type BoxedTransport = Box<dyn Transport>;

async fn open_transport(address: &ServerAddress) -> Result<BoxedTransport> {
    match address {
        ServerAddress::Tcp { host, port } => {
            let stream = TcpStream::connect((host.as_str(), *port)).await?;
            stream.set_nodelay(true)?;
            Ok(Box::new(stream))
        }
        #[cfg(unix)]
        ServerAddress::Unix { path } => {
            let stream = UnixStream::connect(path).await?;
            Ok(Box::new(stream))
        }
        #[cfg(not(unix))]
        ServerAddress::Unix { .. } => Err(Error::InvalidConfig(
            "unix sockets are not available on this platform".into(),
        )),
    }
}

enum ConnEvent {
    Command {
        command: Command,
        reply: ReplySender,
    },
    Subscribe {
        kind: SubscriptionKind,
        targets: Vec<Bytes>,
        on_message: MessageReceiver,
        on_subscribe: Option<SubscribeHandler>,
        on_unsubscribe: Option<UnsubscribeHandler>,
        reply: CountSender,
    },
    Unsubscribe {
        kind: SubscriptionKind,
        targets: Vec<Bytes>,
        reply: CountSender,
    },
    Flush {
        reply: oneshot::Sender<Result<()>>,
    },
    Close {
        reply: oneshot::Sender<Result<()>>,
    },
}

struct ConnectionShared {
    id: u64,
    state: AtomicU8,
    auto_flush: AtomicBool,
    allow_subscriptions: AtomicBool,
    closed: watch::Receiver<bool>,
}

impl ConnectionShared {
    fn state(&self) -> ConnectionState {
        state_from_u8(self.state.load(Ordering::Relaxed))
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.store(state as u8, Ordering::Relaxed);
    }
}

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// A handle to one Redis connection.
///
/// Cheap to clone; all clones talk to the same driver task, which
/// exclusively owns the socket, the decode buffer, the response queue and
/// the pub/sub state. Commands pipeline in FIFO order across all clones.
#[derive(Clone)]
pub struct Connection {
    events: mpsc::UnboundedSender<ConnEvent>,
    shared: Arc<ConnectionShared>,
}

impl Connection {
    /// Open the transport, run the AUTH/SELECT startup sequence, and spawn
    /// the driver. The connection only becomes visible once startup
    /// succeeded.
    pub async fn connect(config: ConnectionConfig) -> Result<Self> {
        if let Some(db) = config.initial_database
            && db < 0
        {
            return Err(Error::InvalidConfig(format!("negative database index {db}")));
        }

        let mut transport = open_transport(&config.address).await?;
        let mut buf = BytesMut::with_capacity(8 * 1024);

        if let Some(password) = &config.password {
            let command = match &config.username {
                Some(username) => cmd("AUTH").arg(username.as_str()).arg(password.as_str()),
                None => cmd("AUTH").arg(password.as_str()),
            };
            handshake_step(&mut transport, &mut buf, command, "AUTH").await?;
        }
        if let Some(db) = config.initial_database {
            handshake_step(&mut transport, &mut buf, cmd("SELECT").arg(db), "SELECT").await?;
        }

        let (read, write) = tokio::io::split(transport);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (closed_tx, closed_rx) = watch::channel(false);

        let shared = Arc::new(ConnectionShared {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            state: AtomicU8::new(ConnectionState::Open as u8),
            auto_flush: AtomicBool::new(config.auto_flush),
            allow_subscriptions: AtomicBool::new(config.allow_subscriptions),
            closed: closed_rx,
        });

        metrics::global().connection_opened();
        tracing::debug!(id = shared.id, address = %config.address, "connection open");

        let driver = Driver {
            read,
            buf,
            channel: CommandChannel::new(BufWriter::new(write)),
            multiplexer: None,
            events: events_rx,
            shared: shared.clone(),
            closed_tx,
            on_unexpected_closure: config.on_unexpected_closure.clone(),
            close_replies: Vec::new(),
            shutting_down: false,
        };
        tokio::spawn(driver.run());

        Ok(Self {
            events: events_tx,
            shared,
        })
    }

    pub fn id(&self) -> u64 {
        self.shared.id
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    /// Open for traffic: `Open` or `PubSub`.
    pub fn is_live(&self) -> bool {
        matches!(
            self.state(),
            ConnectionState::Open | ConnectionState::PubSub
        )
    }

    pub fn auto_flush(&self) -> bool {
        self.shared.auto_flush.load(Ordering::Relaxed)
    }

    /// Toggle flushing the transport after every write. With auto-flush
    /// off the caller batches and calls [`flush`](Self::flush); promises
    /// still resolve in FIFO order.
    pub fn set_auto_flush(&self, on: bool) {
        self.shared.auto_flush.store(on, Ordering::Relaxed);
    }

    pub fn allow_subscriptions(&self) -> bool {
        self.shared.allow_subscriptions.load(Ordering::Relaxed)
    }

    /// Gate the subscription APIs. The pool turns this off on leased
    /// connections so pub/sub state stays centralized on one connection.
    pub fn set_allow_subscriptions(&self, on: bool) {
        self.shared.allow_subscriptions.store(on, Ordering::Relaxed);
    }

    /// Send one command and convert its reply.
    ///
    /// An `Error` reply or a conversion failure only fails this call; the
    /// connection stays usable.
    pub async fn send<T: FromResp>(&self, command: Command) -> Result<T> {
        if !self.is_live() {
            return Err(Error::ConnectionClosed);
        }
        let (tx, rx) = oneshot::channel();
        self.send_event(ConnEvent::Command { command, reply: tx })?;
        let value = rx.await.map_err(|_| Error::ConnectionClosed)??;
        T::from_resp(value)
    }

    /// Flush writes batched while auto-flush is off.
    pub async fn flush(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.send_event(ConnEvent::Flush { reply: tx })?;
        rx.await.map_err(|_| Error::ConnectionClosed)?
    }

    /// Subscribe to channels. Resolves with the server-reported
    /// subscription count once every target is acknowledged.
    pub async fn subscribe<I>(
        &self,
        channels: I,
        on_message: MessageReceiver,
        on_subscribe: Option<SubscribeHandler>,
        on_unsubscribe: Option<UnsubscribeHandler>,
    ) -> Result<i64>
    where
        I: IntoIterator,
        I::Item: ToArg,
    {
        self.request_subscribe(
            SubscriptionKind::Channel,
            collect_targets(channels),
            on_message,
            on_subscribe,
            on_unsubscribe,
        )
        .await
    }

    /// Subscribe to patterns; see [`subscribe`](Self::subscribe).
    pub async fn psubscribe<I>(
        &self,
        patterns: I,
        on_message: MessageReceiver,
        on_subscribe: Option<SubscribeHandler>,
        on_unsubscribe: Option<UnsubscribeHandler>,
    ) -> Result<i64>
    where
        I: IntoIterator,
        I::Item: ToArg,
    {
        self.request_subscribe(
            SubscriptionKind::Pattern,
            collect_targets(patterns),
            on_message,
            on_subscribe,
            on_unsubscribe,
        )
        .await
    }

    /// Subscribe and receive messages through a stream instead of a
    /// callback.
    pub async fn subscribe_stream<I>(&self, channels: I) -> Result<(i64, PubSubStream)>
    where
        I: IntoIterator,
        I::Item: ToArg,
    {
        let (receiver, stream) = message_channel();
        let count = self.subscribe(channels, receiver, None, None).await?;
        Ok((count, stream))
    }

    /// Pattern-subscribe with a stream; see
    /// [`subscribe_stream`](Self::subscribe_stream).
    pub async fn psubscribe_stream<I>(&self, patterns: I) -> Result<(i64, PubSubStream)>
    where
        I: IntoIterator,
        I::Item: ToArg,
    {
        let (receiver, stream) = message_channel();
        let count = self.psubscribe(patterns, receiver, None, None).await?;
        Ok((count, stream))
    }

    /// Unsubscribe from channels; an empty list unsubscribes from all
    /// channel subscriptions. Resolves with the post-change count.
    pub async fn unsubscribe<I>(&self, channels: I) -> Result<i64>
    where
        I: IntoIterator,
        I::Item: ToArg,
    {
        self.request_unsubscribe(SubscriptionKind::Channel, collect_targets(channels))
            .await
    }

    /// Unsubscribe from patterns; an empty list unsubscribes from all
    /// pattern subscriptions.
    pub async fn punsubscribe<I>(&self, patterns: I) -> Result<i64>
    where
        I: IntoIterator,
        I::Item: ToArg,
    {
        self.request_unsubscribe(SubscriptionKind::Pattern, collect_targets(patterns))
            .await
    }

    /// Close the connection: a final QUIT drains in-flight replies (its
    /// failure is non-fatal), then the transport shuts down. Closing an
    /// already-closed connection succeeds once the close has completed.
    pub async fn close(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        if self.events.send(ConnEvent::Close { reply: tx }).is_err() {
            self.closed().await;
            return Ok(());
        }
        match rx.await {
            Ok(result) => result,
            Err(_) => {
                self.closed().await;
                Ok(())
            }
        }
    }

    /// Resolves once the connection has fully closed, however that
    /// happened.
    pub async fn closed(&self) {
        let mut rx = self.shared.closed.clone();
        loop {
            if *rx.borrow() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    async fn request_subscribe(
        &self,
        kind: SubscriptionKind,
        targets: Vec<Bytes>,
        on_message: MessageReceiver,
        on_subscribe: Option<SubscribeHandler>,
        on_unsubscribe: Option<UnsubscribeHandler>,
    ) -> Result<i64> {
        if !self.allow_subscriptions() {
            return Err(Error::PubSubRaceCondition);
        }
        if !self.is_live() {
            return Err(Error::ConnectionClosed);
        }
        let (tx, rx) = oneshot::channel();
        self.send_event(ConnEvent::Subscribe {
            kind,
            targets,
            on_message,
            on_subscribe,
            on_unsubscribe,
            reply: tx,
        })?;
        rx.await.map_err(|_| Error::ConnectionClosed)?
    }

    async fn request_unsubscribe(&self, kind: SubscriptionKind, targets: Vec<Bytes>) -> Result<i64> {
        if !self.is_live() {
            return Err(Error::ConnectionClosed);
        }
        let (tx, rx) = oneshot::channel();
        self.send_event(ConnEvent::Unsubscribe {
            kind,
            targets,
            reply: tx,
        })?;
        rx.await.map_err(|_| Error::ConnectionClosed)?
    }

    fn send_event(&self, event: ConnEvent) -> Result<()> {
        self.events
            .send(event)
            .map_err(|_| Error::ConnectionClosed)
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.shared.id)
            .field("state", &self.state())
            .finish()
    }
}

fn collect_targets<I>(targets: I) -> Vec<Bytes>
where
    I: IntoIterator,
    I::Item: ToArg,
{
    targets.into_iter().map(|t| t.to_arg()).collect()
}

async fn handshake_step(
    transport: &mut BoxedTransport,
    buf: &mut BytesMut,
    command: Command,
    step: &str,
) -> Result<()> {
    transport.write_all(&command.to_bytes()).await?;
    transport.flush().await?;
    match resp::read_frame(transport, buf).await? {
        None => {
            tracing::warn!(step, "server closed during startup");
            Err(Error::ConnectionClosed)
        }
        Some(RespValue::Error(message)) => {
            tracing::warn!(step, error = %message, "startup command rejected");
            Err(Error::Redis(message))
        }
        Some(_) => Ok(()),
    }
}

/// The task that owns one connection's transport and all of its state.
struct Driver {
    read: ReadHalf<BoxedTransport>,
    buf: BytesMut,
    channel: CommandChannel<BufWriter<WriteHalf<BoxedTransport>>>,
    multiplexer: Option<PubSubMultiplexer>,
    events: mpsc::UnboundedReceiver<ConnEvent>,
    shared: Arc<ConnectionShared>,
    closed_tx: watch::Sender<bool>,
    on_unexpected_closure: Option<ClosureCallback>,
    close_replies: Vec<oneshot::Sender<Result<()>>>,
    shutting_down: bool,
}

impl Driver {
    async fn run(mut self) {
        let result = self.run_loop().await;
        self.finish(result).await;
    }

    async fn run_loop(&mut self) -> Result<()> {
        loop {
            tokio::select! {
                event = self.events.recv() => {
                    match event {
                        Some(event) => self.handle_event(event).await?,
                        None => {
                            // every handle is gone; nobody can observe a reply
                            self.shutting_down = true;
                            return Ok(());
                        }
                    }
                }
                read = self.read.read_buf(&mut self.buf) => {
                    let n = read?;
                    if n == 0 {
                        // EOF is the expected end of a QUIT exchange
                        return if self.shutting_down {
                            Ok(())
                        } else {
                            Err(Error::ConnectionClosed)
                        };
                    }
                    self.drain_frames()?;
                }
            }
        }
    }

    fn drain_frames(&mut self) -> Result<()> {
        loop {
            match resp::decode(&mut self.buf) {
                Ok(Some(frame)) => self.route_frame(frame),
                Ok(None) => return Ok(()),
                Err(kind) => return Err(Error::Parse(kind)),
            }
        }
    }

    /// Route one inbound frame: through the multiplexer while in
    /// subscriber mode, then whatever passes goes to the response queue.
    fn route_frame(&mut self, frame: RespValue) {
        let passed = match self.multiplexer.as_mut() {
            Some(multiplexer) => multiplexer.filter_inbound(frame),
            None => Some(frame),
        };
        if let Some(frame) = passed {
            self.channel.dispatch_reply(frame);
        }
        self.leave_pubsub_if_idle();
    }

    /// A successful unsubscribe that empties the registry flips the
    /// connection back to `Open`.
    fn leave_pubsub_if_idle(&mut self) {
        if self.shutting_down {
            return;
        }
        if self.multiplexer.as_ref().is_some_and(|m| m.is_idle()) {
            self.multiplexer = None;
            self.shared.set_state(ConnectionState::Open);
            tracing::debug!(id = self.shared.id, "left subscriber mode");
        }
    }

    async fn handle_event(&mut self, event: ConnEvent) -> Result<()> {
        match event {
            ConnEvent::Command { command, reply } => {
                if self.shutting_down {
                    let _ = reply.send(Err(Error::ConnectionClosed));
                    return Ok(());
                }
                let keyword = command.keyword_upper();
                if self.multiplexer.is_some()
                    && !PUBSUB_ALLOWED_COMMANDS.contains(&keyword.as_str())
                {
                    let _ = reply.send(Err(Error::IllegalPubSubCommand(keyword)));
                    return Ok(());
                }
                metrics::global().record_command(&keyword);
                let bytes = command.to_bytes();
                let flush = self.shared.auto_flush.load(Ordering::Relaxed);
                self.channel.write_command(&bytes, reply, flush).await
            }
            ConnEvent::Subscribe {
                kind,
                targets,
                on_message,
                on_subscribe,
                on_unsubscribe,
                reply,
            } => {
                if self.shutting_down {
                    let _ = reply.send(Err(Error::ConnectionClosed));
                    return Ok(());
                }
                if !self.shared.allow_subscriptions.load(Ordering::Relaxed) {
                    let _ = reply.send(Err(Error::PubSubRaceCondition));
                    return Ok(());
                }

                let entered = self.multiplexer.is_none();
                let multiplexer = self.multiplexer.get_or_insert_with(PubSubMultiplexer::new);
                if entered {
                    self.shared.set_state(ConnectionState::PubSub);
                    tracing::debug!(id = self.shared.id, "entered subscriber mode");
                }
                if let Some(command) = multiplexer.add_subscription(
                    kind,
                    targets,
                    on_message,
                    on_subscribe,
                    on_unsubscribe,
                    reply,
                ) {
                    metrics::global().record_command(&command.keyword_upper());
                    self.channel.write_raw(&command.to_bytes(), true).await?;
                }
                self.leave_pubsub_if_idle();
                Ok(())
            }
            ConnEvent::Unsubscribe {
                kind,
                targets,
                reply,
            } => {
                if self.shutting_down {
                    let _ = reply.send(Err(Error::ConnectionClosed));
                    return Ok(());
                }
                match self.multiplexer.as_mut() {
                    None => {
                        // nothing subscribed on this connection
                        let _ = reply.send(Ok(0));
                    }
                    Some(multiplexer) => {
                        if let Some(command) =
                            multiplexer.remove_subscription(kind, targets, reply)
                        {
                            metrics::global().record_command(&command.keyword_upper());
                            self.channel.write_raw(&command.to_bytes(), true).await?;
                        }
                        self.leave_pubsub_if_idle();
                    }
                }
                Ok(())
            }
            ConnEvent::Flush { reply } => match self.channel.flush().await {
                Ok(()) => {
                    let _ = reply.send(Ok(()));
                    Ok(())
                }
                Err(e) => {
                    let _ = reply.send(Err(e.clone()));
                    Err(e)
                }
            },
            ConnEvent::Close { reply } => {
                self.close_replies.push(reply);
                if self.shutting_down {
                    return Ok(());
                }
                self.shutting_down = true;
                self.shared.set_state(ConnectionState::ShuttingDown);
                tracing::debug!(id = self.shared.id, "closing connection");

                // final QUIT drains in-flight replies; the server answers
                // everything queued before it and then closes the stream
                let (tx, _rx) = oneshot::channel();
                let bytes = cmd("QUIT").to_bytes();
                if self.channel.write_command(&bytes, tx, true).await.is_err() {
                    // transport already broken; failing QUIT is non-fatal
                    return Err(Error::ConnectionClosed);
                }
                Ok(())
            }
        }
    }

    async fn finish(mut self, result: Result<()>) {
        let caller_initiated = self.shutting_down;
        self.shared.set_state(ConnectionState::Closed);

        let error = result.err();
        let drain_error = error.clone().unwrap_or(Error::ConnectionClosed);
        self.channel.fail_all(&drain_error);
        self.channel.shutdown().await;

        if let Some(mut multiplexer) = self.multiplexer.take() {
            let source = if caller_initiated {
                UnsubscribeSource::UserInitiated
            } else {
                UnsubscribeSource::ClientError(drain_error.clone())
            };
            multiplexer.drain(source);
        }

        metrics::global().connection_closed();
        for reply in self.close_replies.drain(..) {
            let _ = reply.send(Ok(()));
        }
        let _ = self.closed_tx.send(true);

        if caller_initiated {
            tracing::debug!(id = self.shared.id, "connection closed");
        } else {
            match &error {
                Some(e) => tracing::warn!(
                    id = self.shared.id,
                    error = %e,
                    "connection closed unexpectedly"
                ),
                None => tracing::warn!(id = self.shared.id, "connection closed unexpectedly"),
            }
            if let Some(callback) = &self.on_unexpected_closure {
                callback();
            }
        }
    }
}
