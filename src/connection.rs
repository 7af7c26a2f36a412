use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;
use futures::StreamExt;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufWriter, ReadHalf, WriteHalf};
use tokio::net::{TcpStream, UnixStream};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::oneshot;
use tokio_util::codec::FramedRead;
use tracing::{debug, error, instrument, warn};
use uuid::Uuid;

use crate::client::{ClientConfig, ServerAddr};
use crate::codec::ReplyCodec;
use crate::command::{Command, Kind};
use crate::error::{Error, Result};
use crate::frame::Reply;
use crate::subscribe::PushEvent;

/// The byte-stream transport under a connection. TCP and Unix sockets are
/// both erased behind this; the client never looks below it.
trait Transport: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> Transport for T {}

type BoxedTransport = Box<dyn Transport>;

/// Protocol mode of a connection. Transitions happen when the triggering
/// command is written; see `ConnState::apply_transition`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    Normal,
    Multi,
    Watching,
    Subscribed,
}

/// One reply slot in the FIFO queue. `Batch` slots share a collector: the
/// batch resolves once its last slot has been filled.
enum Slot {
    One(oneshot::Sender<Result<Reply>>),
    Batch(Arc<Batch>),
}

struct Batch {
    expected: usize,
    results: Mutex<Vec<Reply>>,
    tx: Mutex<Option<oneshot::Sender<Result<Vec<Reply>>>>>,
}

struct ConnState {
    // One entry per write that expects a reply; replies consume entries
    // front to back, which is what correlates them with their command.
    pending: VecDeque<Slot>,
    mode: Mode,
    channels: HashSet<String>,
    patterns: HashSet<String>,
    subscriber: Option<UnboundedSender<PushEvent>>,
    locked: bool,
    // Bumped on every lock(); handles carry the value current at their
    // creation, which is what tells the lock owner apart from stale clones.
    owner: u64,
    closed: bool,
}

impl ConnState {
    fn new() -> ConnState {
        ConnState {
            pending: VecDeque::new(),
            mode: Mode::Normal,
            channels: HashSet::new(),
            patterns: HashSet::new(),
            subscriber: None,
            // Connections are born locked: the opener has exclusive use
            // until the pool marks them shared.
            locked: true,
            owner: 1,
            closed: false,
        }
    }

    /// While the connection is locked, only the handle that took the lock
    /// may write to it.
    fn check_owner(&self, token: u64) -> Result<()> {
        if self.closed {
            return Err(Error::ConnectionClosed);
        }
        if self.locked && token != self.owner {
            return Err(Error::IllegalState(
                "connection is locked by another handle".to_string(),
            ));
        }
        Ok(())
    }

    fn check_legal(&self, kind: &Kind, token: u64) -> Result<()> {
        self.check_owner(token)?;
        if self.mode == Mode::Subscribed && !kind.is_subscriber_legal() {
            return Err(Error::IllegalState(
                "only (un)subscribe and ping are allowed while subscribed".to_string(),
            ));
        }
        if kind.is_connection_affine() && !self.locked {
            return Err(Error::IllegalState(format!(
                "{:?} requires an exclusively locked connection",
                kind
            )));
        }
        Ok(())
    }

    fn apply_transition(&mut self, kind: &Kind) {
        match kind {
            Kind::Multi => self.mode = Mode::Multi,
            Kind::Watch => {
                if self.mode == Mode::Normal {
                    self.mode = Mode::Watching;
                }
            }
            Kind::Exec | Kind::Discard | Kind::Unwatch => self.mode = Mode::Normal,
            Kind::Subscribe | Kind::Psubscribe => self.mode = Mode::Subscribed,
            _ => {}
        }
    }

    /// Channel and pattern sets mutate on acknowledgement only, never when
    /// the command is written. Leaving subscriber mode happens here too,
    /// once both sets have drained.
    fn note_subscription_event(&mut self, event: &PushEvent) {
        match event {
            PushEvent::Subscribed { channel, .. } => {
                self.channels.insert(channel.clone());
            }
            PushEvent::PSubscribed { pattern, .. } => {
                self.patterns.insert(pattern.clone());
            }
            PushEvent::Unsubscribed { channel, .. } => {
                if let Some(channel) = channel {
                    self.channels.remove(channel);
                }
                self.maybe_leave_subscriber_mode();
            }
            PushEvent::PUnsubscribed { pattern, .. } => {
                if let Some(pattern) = pattern {
                    self.patterns.remove(pattern);
                }
                self.maybe_leave_subscriber_mode();
            }
            PushEvent::Message { .. } | PushEvent::PMessage { .. } => {}
        }
    }

    fn maybe_leave_subscriber_mode(&mut self) {
        if self.channels.is_empty() && self.patterns.is_empty() {
            self.mode = Mode::Normal;
        }
    }

    fn fulfill_next(&mut self, reply: Reply) {
        match self.pending.pop_front() {
            Some(Slot::One(tx)) => {
                let _ = tx.send(Ok(reply));
            }
            Some(Slot::Batch(batch)) => {
                let done = {
                    let mut results = batch.results.lock().expect("batch lock poisoned");
                    results.push(reply);
                    results.len() == batch.expected
                };
                if done {
                    let tx = batch.tx.lock().expect("batch lock poisoned").take();
                    if let Some(tx) = tx {
                        let results = std::mem::take(
                            &mut *batch.results.lock().expect("batch lock poisoned"),
                        );
                        let _ = tx.send(Ok(results));
                    }
                }
            }
            // A reply nobody asked for, e.g. the late reply of a command
            // the caller stopped waiting on.
            None => warn!("received a reply with no pending command: {:?}", reply),
        }
    }
}

struct Inner {
    id: Uuid,
    // Commands register their reply slot while holding this lock, so slot
    // order always matches write order.
    writer: tokio::sync::Mutex<BufWriter<WriteHalf<BoxedTransport>>>,
    state: Mutex<ConnState>,
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, ConnState> {
        self.state.lock().expect("connection state lock poisoned")
    }

    /// Terminal teardown: marks the connection closed, fails every pending
    /// reply slot with `ConnectionClosed` in FIFO order and drops all
    /// subscription state. Idempotent.
    fn abort(&self) {
        let slots: Vec<Slot> = {
            let mut state = self.state();
            state.closed = true;
            state.subscriber = None;
            state.channels.clear();
            state.patterns.clear();
            state.mode = Mode::Normal;
            state.pending.drain(..).collect()
        };
        for slot in slots {
            match slot {
                Slot::One(tx) => {
                    let _ = tx.send(Err(Error::ConnectionClosed));
                }
                Slot::Batch(batch) => {
                    let tx = batch.tx.lock().expect("batch lock poisoned").take();
                    if let Some(tx) = tx {
                        let _ = tx.send(Err(Error::ConnectionClosed));
                    }
                }
            }
        }
    }

    fn route(&self, reply: Reply) {
        let mut state = self.state();
        if state.mode == Mode::Subscribed {
            if let Some(event) = PushEvent::parse(&reply) {
                state.note_subscription_event(&event);
                // One-shot replies (a subscriber-mode PING, the pool's
                // cleanup unsubscribes) take priority: push events are only
                // dispatched while nothing is due on the reply queue.
                if state.pending.is_empty() {
                    match &state.subscriber {
                        Some(sink) => {
                            let _ = sink.send(event);
                        }
                        None => warn!("push event with no subscriber registered: {:?}", event),
                    }
                    return;
                }
            }
        }
        state.fulfill_next(reply);
    }
}

/// A single connection to the server: one transport stream, the reply
/// decoder feeding a spawned read task, and the FIFO queue correlating
/// replies with the commands that produced them.
///
/// Handles are cheap to clone; all clones refer to the same connection.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
    // Matches `ConnState::owner` while this handle holds the lock.
    token: u64,
}

impl Connection {
    /// Connects to the configured address and spawns the read task. The
    /// returned connection is locked (exclusive to the caller); the pool
    /// marks it shared when it joins the available set. Runs the AUTH and
    /// SELECT handshake before returning, so a connection that makes it
    /// out of here is ready for arbitrary commands.
    pub async fn open(config: &ClientConfig) -> Result<Connection> {
        let transport: BoxedTransport = match &config.addr {
            ServerAddr::Tcp(addr) => Box::new(TcpStream::connect(addr).await?),
            ServerAddr::Unix(path) => Box::new(UnixStream::connect(path).await?),
        };
        let (read_half, write_half) = tokio::io::split(transport);

        let inner = Arc::new(Inner {
            id: Uuid::new_v4(),
            writer: tokio::sync::Mutex::new(BufWriter::new(write_half)),
            state: Mutex::new(ConnState::new()),
        });
        tokio::spawn(read_loop(Arc::clone(&inner), read_half));

        let conn = Connection { inner, token: 1 };
        debug!(connection_id = %conn.inner.id, "connection established");

        if let Some(password) = &config.auth {
            conn.send(&Command::new("AUTH").arg(password.as_str()))
                .await?
                .ok()?;
        }
        if config.db != 0 {
            conn.send(&Command::new("SELECT").arg(config.db)).await?.ok()?;
        }
        Ok(conn)
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    /// Writes one command and waits for its reply.
    ///
    /// Fails with `IllegalState` when the command is not legal for the
    /// connection's current mode: connection-affine commands (MULTI,
    /// WATCH, SELECT, ...) on a shared connection, or normal commands
    /// while subscribed. Subscription commands are rejected here outright;
    /// they go through a `Subscriber`, whose acknowledgements arrive as
    /// push events instead of one-shot replies.
    pub async fn send(&self, cmd: &Command) -> Result<Reply> {
        if cmd.kind().is_subscription() {
            return Err(Error::IllegalState(
                "subscription commands go through a Subscriber".to_string(),
            ));
        }

        let encoded = cmd.encode();
        let mut writer = self.inner.writer.lock().await;
        let rx = {
            let mut state = self.inner.state();
            state.check_legal(cmd.kind(), self.token)?;
            state.apply_transition(cmd.kind());
            let (tx, rx) = oneshot::channel();
            state.pending.push_back(Slot::One(tx));
            rx
        };
        if let Err(err) = write_flush(&mut writer, std::slice::from_ref(&encoded)).await {
            drop(writer);
            self.inner.abort();
            return Err(err.into());
        }
        drop(writer);

        rx.await.map_err(|_| Error::ConnectionClosed)?
    }

    /// Writes a batch of pre-encoded commands as one contiguous flush and
    /// resolves with exactly one reply per command, in submission order.
    ///
    /// The caller must have exclusive use of the connection for the
    /// duration of the flush; the pool guarantees this for pipelines.
    pub async fn send_batch(&self, messages: &[Bytes]) -> Result<Vec<Reply>> {
        if messages.is_empty() {
            return Ok(Vec::new());
        }

        let mut writer = self.inner.writer.lock().await;
        let rx = {
            let mut state = self.inner.state();
            state.check_owner(self.token)?;
            let (tx, rx) = oneshot::channel();
            let batch = Arc::new(Batch {
                expected: messages.len(),
                results: Mutex::new(Vec::with_capacity(messages.len())),
                tx: Mutex::new(Some(tx)),
            });
            for _ in 0..messages.len() {
                state.pending.push_back(Slot::Batch(Arc::clone(&batch)));
            }
            rx
        };
        if let Err(err) = write_flush(&mut writer, messages).await {
            drop(writer);
            self.inner.abort();
            return Err(err.into());
        }
        drop(writer);

        rx.await.map_err(|_| Error::ConnectionClosed)?
    }

    /// Writes a command that will produce no one-shot reply (the
    /// subscribe family, whose acknowledgements arrive as push events).
    async fn write_only(&self, cmd: &Command) -> Result<()> {
        let encoded = cmd.encode();
        let mut writer = self.inner.writer.lock().await;
        {
            let mut state = self.inner.state();
            state.check_legal(cmd.kind(), self.token)?;
            state.apply_transition(cmd.kind());
        }
        if let Err(err) = write_flush(&mut writer, std::slice::from_ref(&encoded)).await {
            drop(writer);
            self.inner.abort();
            return Err(err.into());
        }
        Ok(())
    }

    /// Writes a command expecting `expected` acknowledgement replies on
    /// the FIFO queue and waits for all of them. Used by the pool's
    /// cleanup unsubscribes, which run without a subscriber sink.
    async fn send_expecting(&self, cmd: &Command, expected: usize) -> Result<Vec<Reply>> {
        let encoded = cmd.encode();
        let mut writer = self.inner.writer.lock().await;
        let rx = {
            let mut state = self.inner.state();
            state.check_legal(cmd.kind(), self.token)?;
            state.apply_transition(cmd.kind());
            let (tx, rx) = oneshot::channel();
            let batch = Arc::new(Batch {
                expected,
                results: Mutex::new(Vec::with_capacity(expected)),
                tx: Mutex::new(Some(tx)),
            });
            for _ in 0..expected {
                state.pending.push_back(Slot::Batch(Arc::clone(&batch)));
            }
            rx
        };
        if let Err(err) = write_flush(&mut writer, std::slice::from_ref(&encoded)).await {
            drop(writer);
            self.inner.abort();
            return Err(err.into());
        }
        drop(writer);

        rx.await.map_err(|_| Error::ConnectionClosed)?
    }

    /// Registers the single subscriber sink for this connection. All push
    /// events are delivered to it, in arrival order, until the connection
    /// closes or the sink is cleared.
    pub fn register_subscriber(&self) -> Result<UnboundedReceiver<PushEvent>> {
        let mut state = self.inner.state();
        if state.closed {
            return Err(Error::ConnectionClosed);
        }
        if state.subscriber.is_some() {
            return Err(Error::IllegalState(
                "a subscriber is already registered on this connection".to_string(),
            ));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        state.subscriber = Some(tx);
        Ok(rx)
    }

    pub(crate) fn clear_subscriber(&self) {
        self.inner.state().subscriber = None;
    }

    /// SUBSCRIBE or PSUBSCRIBE. Requires a registered subscriber sink,
    /// since the acknowledgements have nowhere else to go.
    pub async fn subscribe_cmd(&self, kind: Kind, names: &[&str]) -> Result<()> {
        if names.is_empty() {
            return Err(Error::InvalidArgument(
                "at least one channel or pattern is required".to_string(),
            ));
        }
        if self.inner.state().subscriber.is_none() {
            return Err(Error::IllegalState(
                "no subscriber registered on this connection".to_string(),
            ));
        }
        let name = match kind {
            Kind::Psubscribe => "PSUBSCRIBE",
            _ => "SUBSCRIBE",
        };
        let cmd = Command::new(name).args(names.iter().copied());
        self.write_only(&cmd).await
    }

    /// UNSUBSCRIBE or PUNSUBSCRIBE, for the named channels or for all of
    /// them when `names` is empty.
    ///
    /// A bare unsubscribe with zero active subscriptions gets no reply
    /// from the server at all; it is completed locally (a synthetic
    /// acknowledgement on the sink, if any) without touching the wire.
    pub async fn unsubscribe_cmd(&self, kind: Kind, names: &[&str]) -> Result<()> {
        let pattern = matches!(kind, Kind::Punsubscribe);
        let name = if pattern { "PUNSUBSCRIBE" } else { "UNSUBSCRIBE" };

        let (expected, has_sink) = {
            let state = self.inner.state();
            let active = if pattern {
                state.patterns.len()
            } else {
                state.channels.len()
            };
            // The server sends one acknowledgement per named channel, or
            // one per active subscription for a bare unsubscribe.
            let expected = if names.is_empty() { active } else { names.len() };
            if expected == 0 {
                if let Some(sink) = &state.subscriber {
                    let event = if pattern {
                        PushEvent::PUnsubscribed { pattern: None, count: 0 }
                    } else {
                        PushEvent::Unsubscribed { channel: None, count: 0 }
                    };
                    let _ = sink.send(event);
                }
                return Ok(());
            }
            (expected, state.subscriber.is_some())
        };

        let cmd = Command::new(name).args(names.iter().copied());
        if has_sink {
            self.write_only(&cmd).await
        } else {
            // Pool cleanup path: no sink, so collect the acknowledgements
            // as queued replies and wait for the last one.
            self.send_expecting(&cmd, expected).await.map(|_| ())
        }
    }

    /// Marks the connection exclusively owned and returns the handle that
    /// holds the lock. While locked, commands from any other handle
    /// (including the one `lock` was called on) fail with `IllegalState`,
    /// so a clone kept from before the checkout cannot interleave its
    /// traffic with the owner's.
    pub fn lock(&self) -> Result<Connection> {
        let mut state = self.inner.state();
        if state.closed {
            return Err(Error::ConnectionClosed);
        }
        if state.locked {
            return Err(Error::AlreadyLocked);
        }
        state.locked = true;
        state.owner = state.owner.wrapping_add(1);
        Ok(Connection {
            inner: Arc::clone(&self.inner),
            token: state.owner,
        })
    }

    /// Marks the connection shared again. Only the pool does this, after
    /// cleanup has confirmed no transaction or subscription state remains.
    pub(crate) fn mark_shared(&self) {
        self.inner.state().locked = false;
    }

    pub fn is_locked(&self) -> bool {
        self.inner.state().locked
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state().closed
    }

    pub fn mode(&self) -> Mode {
        self.inner.state().mode
    }

    pub fn subscription_count(&self) -> (usize, usize) {
        let state = self.inner.state();
        (state.channels.len(), state.patterns.len())
    }

    /// Sends a best-effort QUIT and closes the transport. Every pending
    /// reply slot resolves with `ConnectionClosed`, in FIFO order. A
    /// closed connection is never returned to the pool.
    pub async fn close(&self) -> Result<()> {
        if self.inner.state().closed {
            return Ok(());
        }
        let quit = Command::new("QUIT").encode();
        let mut writer = self.inner.writer.lock().await;
        let _ = write_flush(&mut writer, std::slice::from_ref(&quit)).await;
        let _ = writer.shutdown().await;
        drop(writer);
        self.inner.abort();
        Ok(())
    }
}

async fn write_flush(
    writer: &mut BufWriter<WriteHalf<BoxedTransport>>,
    messages: &[Bytes],
) -> std::io::Result<()> {
    for message in messages {
        writer.write_all(message).await?;
    }
    writer.flush().await
}

#[instrument(name = "connection", skip_all, fields(connection_id = %inner.id))]
async fn read_loop(inner: Arc<Inner>, read_half: ReadHalf<BoxedTransport>) {
    let mut replies = FramedRead::new(read_half, ReplyCodec);
    while let Some(next) = replies.next().await {
        match next {
            Ok(reply) => inner.route(reply),
            Err(err) => {
                error!("reply stream failed: {}", err);
                break;
            }
        }
    }
    debug!("transport closed");
    inner.abort();
}
