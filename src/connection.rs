//! The connection engine.
//!
//! One [`Connection`] owns one duplex stream to a bus daemon and
//! multiplexes over it: an outgoing stream of framed messages with
//! monotonically increasing serials, an incoming stream demultiplexed
//! into method-call replies, inbound method calls and signal broadcasts,
//! and the subscription bookkeeping with the bus (match rules,
//! name-owner tracking, unique-name resolution).
//!
//! All connection state lives in a single engine task; user-facing
//! handles are cheap clones that talk to it over channels. Concurrency
//! comes from many outstanding suspensions (pending replies, pending
//! subscriptions) multiplexed over the one socket, never from shared
//! mutation, so there are no locks.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, trace, warn};

use crate::address::{self, BusAddress};
use crate::error::*;
use crate::handlers;
use crate::message::{
    Call, Message, MessageKind, MethodError, MethodReturn, Signal, BUS_IFACE, BUS_NAME, BUS_PATH,
    ERR_FAILED,
};
use crate::object::{Object, ObjectTree};
use crate::value::Value;
use crate::wire::{self, ReadBuffer};

/// Any duplex byte stream the engine can speak the protocol over.
pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> Transport for T {}

type BoxedTransport = Box<dyn Transport>;

/// Capacity of the name-acquired / name-lost broadcast channels. A
/// listener that falls further behind skips to the oldest retained event.
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Flags for [`Connection::request_name`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RequestNameFlags {
    pub allow_replacement: bool,
    pub replace_existing: bool,
    pub do_not_queue: bool,
}

impl RequestNameFlags {
    pub(crate) fn bits(self) -> u32 {
        let mut bits = 0;
        if self.allow_replacement {
            bits |= 0x1;
        }
        if self.replace_existing {
            bits |= 0x2;
        }
        if self.do_not_queue {
            bits |= 0x4;
        }
        bits
    }
}

/// Outcome of [`Connection::request_name`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequestNameReply {
    PrimaryOwner,
    InQueue,
    Exists,
    AlreadyOwner,
}

/// Outcome of [`Connection::release_name`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReleaseNameReply {
    Released,
    NonExistent,
    NotOwner,
}

/// Which broadcasts a subscription wants. Every field that is set must
/// equal the corresponding message header for a signal to be delivered.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SignalFilter {
    pub sender: Option<String>,
    pub interface: Option<String>,
    pub member: Option<String>,
    pub path: Option<String>,
    pub path_namespace: Option<String>,
}

impl SignalFilter {
    pub fn new() -> Self {
        SignalFilter::default()
    }

    pub fn sender<S: Into<String>>(mut self, sender: S) -> Self {
        self.sender = Some(sender.into());
        self
    }

    pub fn interface<S: Into<String>>(mut self, interface: S) -> Self {
        self.interface = Some(interface.into());
        self
    }

    pub fn member<S: Into<String>>(mut self, member: S) -> Self {
        self.member = Some(member.into());
        self
    }

    pub fn path<S: Into<String>>(mut self, path: S) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn path_namespace<S: Into<String>>(mut self, namespace: S) -> Self {
        self.path_namespace = Some(namespace.into());
        self
    }

    /// The bus match rule this filter derives. The rule string itself is
    /// the key for refcounting, so trivially equal subscriptions share
    /// one registration with the bus.
    pub(crate) fn match_rule(&self) -> String {
        let mut rule = String::from("type='signal'");
        let parts = [
            ("sender", &self.sender),
            ("interface", &self.interface),
            ("member", &self.member),
            ("path", &self.path),
            ("path_namespace", &self.path_namespace),
        ];
        for (key, value) in parts {
            if let Some(value) = value {
                rule.push_str(&format!(",{}='{}'", key, value));
            }
        }
        rule
    }

    fn matches(&self, signal: &Signal, owners: &HashMap<String, String>) -> bool {
        if let Some(want) = &self.interface {
            if signal.interface != *want {
                return false;
            }
        }
        if let Some(want) = &self.member {
            if signal.member != *want {
                return false;
            }
        }
        if let Some(want) = &self.path {
            if signal.path != *want {
                return false;
            }
        }
        if let Some(ns) = &self.path_namespace {
            let matched = signal.path == *ns
                || (ns == "/" && signal.path.starts_with('/'))
                || signal
                    .path
                    .strip_prefix(ns.as_str())
                    .map_or(false, |rest| rest.starts_with('/'));
            if !matched {
                return false;
            }
        }
        if let Some(want) = &self.sender {
            let got = match &signal.sender {
                Some(sender) => sender.as_str(),
                None => return false,
            };
            // A well-known sender filter is compared against the signal's
            // unique-name sender through the owner cache; while the cache
            // is cold the raw value is compared instead.
            let resolved = if want.starts_with(':') {
                want.as_str()
            } else {
                owners.get(want).map(String::as_str).unwrap_or(want.as_str())
            };
            if resolved != got {
                return false;
            }
        }
        true
    }
}

enum Command {
    Call {
        msg: Message,
        reply: oneshot::Sender<Result<MethodReturn>>,
    },
    Send {
        msg: Message,
        done: oneshot::Sender<Result<()>>,
    },
    Subscribe {
        id: u64,
        filter: SignalFilter,
        tx: mpsc::UnboundedSender<Signal>,
        done: oneshot::Sender<Result<()>>,
    },
    Unsubscribe {
        id: u64,
    },
    RequestName {
        name: String,
        flags: u32,
        done: oneshot::Sender<Result<RequestNameReply>>,
    },
    ReleaseName {
        name: String,
        done: oneshot::Sender<Result<ReleaseNameReply>>,
    },
    RegisterObject {
        object: Box<dyn Object>,
        done: oneshot::Sender<Result<()>>,
    },
    UniqueName {
        done: oneshot::Sender<Result<String>>,
    },
    OwnedNames {
        done: oneshot::Sender<Result<Vec<String>>>,
    },
    Close {
        done: oneshot::Sender<Result<()>>,
    },
}

/// Where a correlated reply goes once it arrives.
enum ReplySlot {
    /// A user-visible method call.
    Call(oneshot::Sender<Result<MethodReturn>>),
    /// The AddMatch acknowledging a new subscription.
    AddMatch {
        rule: String,
        sub_id: u64,
        done: oneshot::Sender<Result<()>>,
    },
    RequestName {
        name: String,
        done: oneshot::Sender<Result<RequestNameReply>>,
    },
    ReleaseName {
        name: String,
        done: oneshot::Sender<Result<ReleaseNameReply>>,
    },
    /// Fire-and-forget GetNameOwner priming the owner cache.
    PrimeNameOwner { name: String },
}

fn fail_slot(slot: ReplySlot, err: Error) {
    match slot {
        ReplySlot::Call(tx) => {
            let _ = tx.send(Err(err));
        }
        ReplySlot::AddMatch { done, .. } => {
            let _ = done.send(Err(err));
        }
        ReplySlot::RequestName { done, .. } => {
            let _ = done.send(Err(err));
        }
        ReplySlot::ReleaseName { done, .. } => {
            let _ = done.send(Err(err));
        }
        ReplySlot::PrimeNameOwner { .. } => {}
    }
}

struct Subscription {
    id: u64,
    filter: SignalFilter,
    rule: String,
    tx: mpsc::UnboundedSender<Signal>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ConnState {
    Disconnected,
    Ready,
    Closed,
}

/// A handle to one bus connection.
///
/// The handle is cheap to clone; all clones drive the same connection.
/// The connection is opened lazily by the first operation that needs the
/// wire, and a second operation arriving while the handshake is in
/// flight simply queues behind it.
///
/// ```rust,no_run
/// use minibus::Connection;
///
/// # async fn demo() -> minibus::Result<()> {
/// let conn = Connection::session();
/// let reply = conn
///     .call_method(
///         Some("org.freedesktop.Notifications"),
///         "/org/freedesktop/Notifications",
///         Some("org.freedesktop.DBus.Peer"),
///         "Ping",
///         vec![],
///     )
///     .await?;
/// assert!(reply.values.is_empty());
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Connection {
    cmd: mpsc::UnboundedSender<Command>,
    name_acquired: broadcast::Sender<String>,
    name_lost: broadcast::Sender<String>,
    next_sub_id: Arc<AtomicU64>,
}

impl Connection {
    /// A connection to the bus at `address`. The address is validated
    /// when the connection is first used.
    ///
    /// Must be called from within a tokio runtime: the engine task is
    /// spawned here.
    pub fn new(address: &str) -> Self {
        Connection::start(Some(address.to_owned()), None)
    }

    /// A connection to the user's session bus.
    pub fn session() -> Self {
        Connection::start(Some(address::session_address()), None)
    }

    /// A connection to the system-wide bus.
    pub fn system() -> Self {
        Connection::start(Some(address::system_address()), None)
    }

    /// A connection over an already-established duplex stream. The full
    /// handshake is still performed over it. Useful for custom
    /// transports and for tests.
    pub fn with_transport<T: Transport + 'static>(io: T) -> Self {
        Connection::start(None, Some(Box::new(io)))
    }

    fn start(address: Option<String>, preset: Option<BoxedTransport>) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (name_acquired_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (name_lost_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        let engine = Engine {
            address,
            preset,
            state: ConnState::Disconnected,
            transport: None,
            read_buf: ReadBuffer::new(),
            serial: 0,
            hello_serial: None,
            unique_name: None,
            pending: HashMap::new(),
            subscriptions: Vec::new(),
            match_rules: HashMap::new(),
            internal_rules: Vec::new(),
            name_owners: HashMap::new(),
            owned_names: HashSet::new(),
            objects: ObjectTree::new(),
            cmd_rx,
            name_acquired_tx: name_acquired_tx.clone(),
            name_lost_tx: name_lost_tx.clone(),
        };
        tokio::spawn(engine.run());

        Connection {
            cmd: cmd_tx,
            name_acquired: name_acquired_tx,
            name_lost: name_lost_tx,
            next_sub_id: Arc::new(AtomicU64::new(1)),
        }
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<Result<T>>) -> Command,
    ) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.cmd
            .send(make(tx))
            .map_err(|_| context!(ErrorKind::ConnectionClosed))?;
        match rx.await {
            Ok(result) => result,
            Err(_) => Err(context!(ErrorKind::ConnectionClosed)),
        }
    }

    /// Call a method on a remote object and await its reply.
    ///
    /// A remote error reply surfaces as [`ErrorKind::MethodError`]; the
    /// engine imposes no timeout (wrap the call if one is wanted).
    pub async fn call_method(
        &self,
        destination: Option<&str>,
        path: &str,
        interface: Option<&str>,
        member: &str,
        values: Vec<Value>,
    ) -> Result<MethodReturn> {
        let msg = Message::method_call(destination, path, interface, member, values);
        self.request(|reply| Command::Call { msg, reply }).await
    }

    /// Emit a signal broadcast.
    pub async fn emit_signal(
        &self,
        destination: Option<&str>,
        path: &str,
        interface: &str,
        member: &str,
        values: Vec<Value>,
    ) -> Result<()> {
        let msg = Message::signal(destination, path, interface, member, values);
        self.request(|done| Command::Send { msg, done }).await
    }

    /// Subscribe to signal broadcasts matching `filter`.
    ///
    /// The derived match rule is registered with the bus the first time
    /// any live subscription needs it; identical filters share one
    /// registration. Dropping the returned stream cancels the
    /// subscription.
    ///
    /// When the filter names a well-known sender, the owner cache is
    /// primed by a background lookup; signals arriving before the lookup
    /// completes may be missed.
    pub async fn subscribe_signals(&self, filter: SignalFilter) -> Result<SignalStream> {
        let id = self.next_sub_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.request(|done| Command::Subscribe { id, filter, tx, done })
            .await?;
        Ok(SignalStream { rx, id, cmd: self.cmd.clone() })
    }

    /// Expose an object on this connection. Fails if an object is
    /// already registered at the same path.
    pub async fn register_object(&self, object: Box<dyn Object>) -> Result<()> {
        self.request(|done| Command::RegisterObject { object, done })
            .await
    }

    /// Ask the bus for ownership of a well-known name.
    pub async fn request_name(&self, name: &str, flags: RequestNameFlags) -> Result<RequestNameReply> {
        let name = name.to_owned();
        let flags = flags.bits();
        self.request(|done| Command::RequestName { name, flags, done })
            .await
    }

    /// Give a well-known name back to the bus.
    pub async fn release_name(&self, name: &str) -> Result<ReleaseNameReply> {
        let name = name.to_owned();
        self.request(|done| Command::ReleaseName { name, done }).await
    }

    /// The unique name the bus assigned to this connection.
    pub async fn unique_name(&self) -> Result<String> {
        self.request(|done| Command::UniqueName { done }).await
    }

    /// The well-known names this connection currently owns.
    pub async fn owned_names(&self) -> Result<Vec<String>> {
        self.request(|done| Command::OwnedNames { done }).await
    }

    /// Events for names this connection acquires.
    pub fn name_acquired(&self) -> NameEvents {
        NameEvents { rx: self.name_acquired.subscribe() }
    }

    /// Events for names this connection loses.
    pub fn name_lost(&self) -> NameEvents {
        NameEvents { rx: self.name_lost.subscribe() }
    }

    /// Close the connection: the internal name-tracking subscriptions
    /// are cancelled, every pending call fails and all subscription
    /// channels close. Further operations fail with
    /// [`ErrorKind::ConnectionClosed`].
    pub async fn close(&self) -> Result<()> {
        self.request(|done| Command::Close { done }).await
    }

    async fn bus_call(&self, member: &str, values: Vec<Value>) -> Result<MethodReturn> {
        self.call_method(Some(BUS_NAME), BUS_PATH, Some(BUS_IFACE), member, values)
            .await
    }

    /// All names currently on the bus.
    pub async fn list_names(&self) -> Result<Vec<String>> {
        self.bus_call("ListNames", vec![]).await?.string_list(0)
    }

    /// All names the bus could activate a service for.
    pub async fn list_activatable_names(&self) -> Result<Vec<String>> {
        self.bus_call("ListActivatableNames", vec![])
            .await?
            .string_list(0)
    }

    /// The unique names queued for ownership of `name`.
    pub async fn list_queued_owners(&self, name: &str) -> Result<Vec<String>> {
        self.bus_call("ListQueuedOwners", vec![name.into()])
            .await?
            .string_list(0)
    }

    pub async fn name_has_owner(&self, name: &str) -> Result<bool> {
        self.bus_call("NameHasOwner", vec![name.into()]).await?.bool(0)
    }

    /// The unique name currently owning `name`.
    pub async fn get_name_owner(&self, name: &str) -> Result<String> {
        Ok(self
            .bus_call("GetNameOwner", vec![name.into()])
            .await?
            .string(0)?
            .to_owned())
    }

    /// The bus daemon's globally unique id.
    pub async fn get_id(&self) -> Result<String> {
        Ok(self.bus_call("GetId", vec![]).await?.string(0)?.to_owned())
    }

    /// Ping a peer through its `org.freedesktop.DBus.Peer` interface.
    pub async fn ping(&self, destination: &str) -> Result<()> {
        self.call_method(Some(destination), "/", Some(handlers::PEER_IFACE), "Ping", vec![])
            .await?;
        Ok(())
    }

    /// The machine id of the host a peer runs on.
    pub async fn get_machine_id(&self, destination: &str) -> Result<String> {
        Ok(self
            .call_method(
                Some(destination),
                "/",
                Some(handlers::PEER_IFACE),
                "GetMachineId",
                vec![],
            )
            .await?
            .string(0)?
            .to_owned())
    }
}

/// Signals delivered to one subscription, in arrival order.
pub struct SignalStream {
    rx: mpsc::UnboundedReceiver<Signal>,
    id: u64,
    cmd: mpsc::UnboundedSender<Command>,
}

impl SignalStream {
    /// The next matching signal, or `None` once the connection closed.
    pub async fn next(&mut self) -> Option<Signal> {
        self.rx.recv().await
    }
}

impl Drop for SignalStream {
    fn drop(&mut self) {
        let _ = self.cmd.send(Command::Unsubscribe { id: self.id });
    }
}

/// Name-acquired / name-lost events.
pub struct NameEvents {
    rx: broadcast::Receiver<String>,
}

impl NameEvents {
    /// The next event, or `None` once the connection is gone. A lagging
    /// listener skips ahead to the oldest retained event.
    pub async fn next(&mut self) -> Option<String> {
        loop {
            match self.rx.recv().await {
                Ok(name) => return Some(name),
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

struct Engine {
    address: Option<String>,
    /// Transport injected via [`Connection::with_transport`], consumed
    /// by the first connect.
    preset: Option<BoxedTransport>,
    state: ConnState,
    transport: Option<BoxedTransport>,
    read_buf: ReadBuffer,
    /// Last used serial; the first allocated value is 1.
    serial: u32,
    hello_serial: Option<u32>,
    unique_name: Option<String>,
    pending: HashMap<u32, ReplySlot>,
    subscriptions: Vec<Subscription>,
    /// rule string -> number of live subscriptions deriving it
    match_rules: HashMap<String, u32>,
    /// rules owned by the engine's own name-tracking subscriptions
    internal_rules: Vec<String>,
    /// well-known name -> unique name
    name_owners: HashMap<String, String>,
    owned_names: HashSet<String>,
    objects: ObjectTree,
    cmd_rx: mpsc::UnboundedReceiver<Command>,
    name_acquired_tx: broadcast::Sender<String>,
    name_lost_tx: broadcast::Sender<String>,
}

async fn read_some(
    transport: &mut Option<BoxedTransport>,
    buf: &mut [u8],
) -> std::io::Result<usize> {
    match transport.as_mut() {
        Some(t) => t.read(buf).await,
        // the select guard keeps this arm disabled without a transport
        None => std::future::pending().await,
    }
}

fn io_error(e: std::io::Error) -> Error {
    <ErrorKind as ChainErrorFrom<std::io::Error>>::chain_error_from(e, None)
}

fn is_transport_error(e: &Error) -> bool {
    matches!(e.kind(), ErrorKind::Io(_) | ErrorKind::ConnectionClosed)
}

fn reply_result(msg: Message) -> Result<MethodReturn> {
    match msg.kind {
        MessageKind::Error => {
            let name = match msg.error_name {
                Some(name) => name,
                None => {
                    return Err(context!(ErrorKind::Protocol(
                        "error reply without an error name".into()
                    )))
                }
            };
            Err(context!(ErrorKind::MethodError(MethodError {
                name,
                values: msg.body,
            })))
        }
        _ => Ok(MethodReturn { values: msg.body }),
    }
}

impl Engine {
    async fn run(mut self) {
        let mut chunk = [0u8; 4096];
        loop {
            let connected = self.transport.is_some();
            tokio::select! {
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd).await,
                    // every handle is gone
                    None => break,
                },
                read = read_some(&mut self.transport, &mut chunk), if connected => match read {
                    Ok(0) => {
                        debug!("bus closed the connection");
                        self.fail_all();
                    }
                    Ok(n) => {
                        self.read_buf.extend(&chunk[..n]);
                        if let Err(e) = self.drain_inbound().await {
                            self.transport_failure(e);
                        }
                    }
                    Err(e) => self.transport_failure(io_error(e)),
                },
            }
        }
    }

    fn next_serial(&mut self) -> u32 {
        self.serial += 1;
        self.serial
    }

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Call { msg, reply } => {
                if let Err(e) = self.ensure_connected().await {
                    let _ = reply.send(Err(e));
                    return;
                }
                if let Err(e) = self.send_tracked(msg, ReplySlot::Call(reply)).await {
                    self.transport_failure(e);
                }
            }
            Command::Send { msg, done } => {
                if let Err(e) = self.ensure_connected().await {
                    let _ = done.send(Err(e));
                    return;
                }
                match self.send_message(msg).await {
                    Ok(()) => {
                        let _ = done.send(Ok(()));
                    }
                    Err(e) => {
                        let fatal = is_transport_error(&e);
                        let _ = done.send(Err(e));
                        if fatal {
                            warn!("transport failure, failing all pending calls");
                            self.fail_all();
                        }
                    }
                }
            }
            Command::Subscribe { id, filter, tx, done } => {
                if let Err(e) = self.ensure_connected().await {
                    let _ = done.send(Err(e));
                    return;
                }
                if let Err(e) = self.add_subscription(id, filter, tx, done).await {
                    self.transport_failure(e);
                }
            }
            Command::Unsubscribe { id } => {
                if let Err(e) = self.unsubscribe(id).await {
                    self.transport_failure(e);
                }
            }
            Command::RequestName { name, flags, done } => {
                if let Err(e) = self.ensure_connected().await {
                    let _ = done.send(Err(e));
                    return;
                }
                let msg = Message::request_name(&name, flags);
                if let Err(e) = self
                    .send_tracked(msg, ReplySlot::RequestName { name, done })
                    .await
                {
                    self.transport_failure(e);
                }
            }
            Command::ReleaseName { name, done } => {
                if let Err(e) = self.ensure_connected().await {
                    let _ = done.send(Err(e));
                    return;
                }
                let msg = Message::release_name(&name);
                if let Err(e) = self
                    .send_tracked(msg, ReplySlot::ReleaseName { name, done })
                    .await
                {
                    self.transport_failure(e);
                }
            }
            Command::RegisterObject { object, done } => {
                let result = if self.state == ConnState::Closed {
                    Err(context!(ErrorKind::ConnectionClosed))
                } else {
                    self.objects.register(object)
                };
                let _ = done.send(result);
            }
            Command::UniqueName { done } => {
                let result = match self.ensure_connected().await {
                    Ok(()) => self
                        .unique_name
                        .clone()
                        .ok_or_else(|| context!(ErrorKind::ConnectionClosed)),
                    Err(e) => Err(e),
                };
                let _ = done.send(result);
            }
            Command::OwnedNames { done } => {
                let result = match self.ensure_connected().await {
                    Ok(()) => {
                        let mut names: Vec<String> = self.owned_names.iter().cloned().collect();
                        names.sort();
                        Ok(names)
                    }
                    Err(e) => Err(e),
                };
                let _ = done.send(result);
            }
            Command::Close { done } => {
                let result = self.shutdown().await;
                let _ = done.send(result);
            }
        }
    }

    async fn ensure_connected(&mut self) -> Result<()> {
        match self.state {
            ConnState::Ready => Ok(()),
            ConnState::Closed => Err(context!(ErrorKind::ConnectionClosed)),
            ConnState::Disconnected => match self.connect().await {
                Ok(()) => Ok(()),
                // configuration, handshake and transport errors are all
                // fatal at connect
                Err(e) => {
                    warn!(error = %e, "connect failed");
                    self.fail_all();
                    Err(e)
                }
            },
        }
    }

    /// Open the socket, authenticate, say Hello, and start tracking
    /// names. Commands arriving while this runs queue behind it, which
    /// makes concurrent connect attempts await the first one.
    async fn connect(&mut self) -> Result<()> {
        debug!("connecting to bus");
        let mut transport: BoxedTransport = match self.preset.take() {
            Some(preset) => preset,
            None => {
                let raw = self.address.clone().unwrap_or_default();
                let addr = BusAddress::parse(&raw)?;
                let stream = UnixStream::connect(&addr.path).await.map_err(map_context!())?;
                Box::new(stream)
            }
        };

        // Credential byte, then EXTERNAL authentication: the uid's
        // decimal digits, each as two lowercase hex chars of its ASCII
        // code.
        let mut line = String::from("AUTH EXTERNAL ");
        for digit in unsafe { libc::getuid() }.to_string().bytes() {
            line.push_str(&format!("{:02x}", digit));
        }
        line.push_str("\r\n");
        transport.write_all(b"\0").await.map_err(map_context!())?;
        transport.write_all(line.as_bytes()).await.map_err(map_context!())?;
        transport.flush().await.map_err(map_context!())?;

        let mut chunk = [0u8; 256];
        let status = loop {
            if let Some(line) = self.read_buf.read_line()? {
                break line;
            }
            let n = transport.read(&mut chunk).await.map_err(map_context!())?;
            if n == 0 {
                return Err(context!(ErrorKind::Handshake(
                    "server closed the stream during authentication".into()
                )));
            }
            self.read_buf.extend(&chunk[..n]);
        };
        if !status.starts_with("OK ") {
            return Err(context!(ErrorKind::Handshake(status)));
        }

        transport.write_all(b"BEGIN\r\n").await.map_err(map_context!())?;
        transport.flush().await.map_err(map_context!())?;
        self.transport = Some(transport);

        // Hello is the one call that skips the connect gate. Its reply
        // is correlated by serial like any other.
        let mut hello = Message::hello();
        hello.serial = self.next_serial();
        self.hello_serial = Some(hello.serial);
        let data = wire::encode_message(&hello)?;
        self.write_bytes(&data).await?;

        // Internal subscriptions that keep the name caches current.
        for member in ["NameAcquired", "NameLost", "NameOwnerChanged"] {
            let rule = SignalFilter::new()
                .sender(BUS_NAME)
                .interface(BUS_IFACE)
                .path(BUS_PATH)
                .member(member)
                .match_rule();
            self.acquire_rule(rule.clone(), None).await?;
            self.internal_rules.push(rule);
        }

        // The unique name gates readiness.
        while self.unique_name.is_none() {
            self.read_chunk().await?;
            self.drain_inbound().await?;
        }
        self.state = ConnState::Ready;
        debug!(unique_name = %self.unique_name.as_deref().unwrap_or(""), "connected");
        Ok(())
    }

    async fn read_chunk(&mut self) -> Result<()> {
        let mut chunk = [0u8; 4096];
        let transport = match self.transport.as_mut() {
            Some(t) => t,
            None => return Err(context!(ErrorKind::ConnectionClosed)),
        };
        let n = transport.read(&mut chunk).await.map_err(map_context!())?;
        if n == 0 {
            return Err(context!(ErrorKind::ConnectionClosed));
        }
        self.read_buf.extend(&chunk[..n]);
        Ok(())
    }

    async fn write_bytes(&mut self, data: &[u8]) -> Result<()> {
        match self.transport.as_mut() {
            Some(t) => {
                t.write_all(data).await.map_err(map_context!())?;
                t.flush().await.map_err(map_context!())?;
                Ok(())
            }
            None => Err(context!(ErrorKind::ConnectionClosed)),
        }
    }

    /// Send a message whose reply is wanted: the slot is in the pending
    /// table before the bytes reach the transport.
    async fn send_tracked(&mut self, mut msg: Message, slot: ReplySlot) -> Result<()> {
        msg.serial = self.next_serial();
        let data = match wire::encode_message(&msg) {
            Ok(data) => data,
            Err(e) => {
                fail_slot(slot, e);
                return Ok(());
            }
        };
        self.pending.insert(msg.serial, slot);
        self.write_bytes(&data).await
    }

    /// Send a message without tracking a reply; if one arrives anyway it
    /// is dropped by the serial lookup.
    async fn send_untracked(&mut self, mut msg: Message) -> Result<()> {
        msg.serial = self.next_serial();
        let data = wire::encode_message(&msg)?;
        self.write_bytes(&data).await
    }

    async fn send_message(&mut self, mut msg: Message) -> Result<()> {
        msg.serial = self.next_serial();
        let data = wire::encode_message(&msg)?;
        self.write_bytes(&data).await
    }

    async fn add_subscription(
        &mut self,
        id: u64,
        filter: SignalFilter,
        tx: mpsc::UnboundedSender<Signal>,
        done: oneshot::Sender<Result<()>>,
    ) -> Result<()> {
        // Prime the owner cache for a well-known sender. The
        // subscription must not wait for the lookup; until it lands,
        // matching falls back to the raw sender value.
        if let Some(sender) = &filter.sender {
            if !sender.starts_with(':')
                && sender != BUS_NAME
                && !self.name_owners.contains_key(sender)
            {
                let name = sender.clone();
                let msg = Message::get_name_owner(&name);
                self.send_tracked(msg, ReplySlot::PrimeNameOwner { name }).await?;
            }
        }

        let rule = filter.match_rule();
        self.subscriptions.push(Subscription {
            id,
            filter,
            rule: rule.clone(),
            tx,
        });
        self.acquire_rule(rule, Some((id, done))).await
    }

    async fn unsubscribe(&mut self, id: u64) -> Result<()> {
        let pos = match self.subscriptions.iter().position(|s| s.id == id) {
            Some(pos) => pos,
            None => return Ok(()),
        };
        let sub = self.subscriptions.remove(pos);
        if self.state == ConnState::Ready {
            self.release_rule(&sub.rule).await
        } else {
            Ok(())
        }
    }

    /// Count one more user of `rule`; 0 -> 1 tells the bus.
    async fn acquire_rule(
        &mut self,
        rule: String,
        waiter: Option<(u64, oneshot::Sender<Result<()>>)>,
    ) -> Result<()> {
        let count = self.match_rules.entry(rule.clone()).or_insert(0);
        *count += 1;
        if *count > 1 {
            if let Some((_, done)) = waiter {
                let _ = done.send(Ok(()));
            }
            return Ok(());
        }
        let msg = Message::add_match(&rule);
        match waiter {
            Some((sub_id, done)) => {
                self.send_tracked(msg, ReplySlot::AddMatch { rule, sub_id, done })
                    .await
            }
            None => self.send_untracked(msg).await,
        }
    }

    /// Count one user of `rule` gone; 1 -> 0 tells the bus.
    async fn release_rule(&mut self, rule: &str) -> Result<()> {
        match self.match_rules.get_mut(rule) {
            Some(count) if *count > 1 => {
                *count -= 1;
                Ok(())
            }
            Some(_) => {
                self.match_rules.remove(rule);
                self.send_untracked(Message::remove_match(rule)).await
            }
            None => Ok(()),
        }
    }

    /// Undo an acquire whose AddMatch the bus rejected.
    fn rollback_rule(&mut self, rule: &str) {
        if let Some(count) = self.match_rules.get_mut(rule) {
            if *count > 1 {
                *count -= 1;
            } else {
                self.match_rules.remove(rule);
            }
        }
    }

    async fn drain_inbound(&mut self) -> Result<()> {
        loop {
            let msg = match self.read_buf.read_message()? {
                Some(msg) => msg,
                None => return Ok(()),
            };
            self.dispatch(msg).await?;
        }
    }

    async fn dispatch(&mut self, msg: Message) -> Result<()> {
        trace!(kind = ?msg.kind, serial = msg.serial, "inbound message");
        match msg.kind {
            MessageKind::MethodReturn | MessageKind::Error => self.dispatch_reply(msg),
            MessageKind::Signal => self.dispatch_signal(msg).await,
            MessageKind::MethodCall => self.dispatch_call(msg).await,
        }
    }

    fn dispatch_reply(&mut self, msg: Message) -> Result<()> {
        let reply_serial = match msg.reply_serial {
            Some(serial) => serial,
            None => {
                warn!("reply without a reply serial");
                return Ok(());
            }
        };

        if self.hello_serial == Some(reply_serial) {
            self.hello_serial = None;
            return self.finish_hello(msg);
        }

        let slot = match self.pending.remove(&reply_serial) {
            Some(slot) => slot,
            None => {
                trace!(reply_serial, "dropping reply with no pending call");
                return Ok(());
            }
        };

        match slot {
            ReplySlot::Call(tx) => {
                let _ = tx.send(reply_result(msg));
            }
            ReplySlot::AddMatch { rule, sub_id, done } => match reply_result(msg) {
                Ok(_) => {
                    let _ = done.send(Ok(()));
                }
                Err(e) => {
                    self.subscriptions.retain(|s| s.id != sub_id);
                    self.rollback_rule(&rule);
                    let _ = done.send(Err(e));
                }
            },
            ReplySlot::RequestName { name, done } => {
                let result = reply_result(msg).and_then(|ret| match ret.u32(0)? {
                    1 => Ok(RequestNameReply::PrimaryOwner),
                    2 => Ok(RequestNameReply::InQueue),
                    3 => Ok(RequestNameReply::Exists),
                    4 => Ok(RequestNameReply::AlreadyOwner),
                    other => Err(context!(ErrorKind::Protocol(format!(
                        "unknown RequestName result code {}",
                        other
                    )))),
                });
                if matches!(
                    result,
                    Ok(RequestNameReply::PrimaryOwner | RequestNameReply::AlreadyOwner)
                ) {
                    self.owned_names.insert(name.clone());
                    if let Some(unique) = &self.unique_name {
                        self.name_owners.insert(name, unique.clone());
                    }
                }
                if let Err(e) = &result {
                    if !matches!(e.kind(), ErrorKind::MethodError(_)) {
                        warn!(error = %e, "RequestName reply malformed");
                    }
                }
                let _ = done.send(result);
            }
            ReplySlot::ReleaseName { name, done } => {
                let result = reply_result(msg).and_then(|ret| match ret.u32(0)? {
                    1 => Ok(ReleaseNameReply::Released),
                    2 => Ok(ReleaseNameReply::NonExistent),
                    3 => Ok(ReleaseNameReply::NotOwner),
                    other => Err(context!(ErrorKind::Protocol(format!(
                        "unknown ReleaseName result code {}",
                        other
                    )))),
                });
                if matches!(result, Ok(ReleaseNameReply::Released)) {
                    self.owned_names.remove(&name);
                    self.name_owners.remove(&name);
                }
                if let Err(e) = &result {
                    if !matches!(e.kind(), ErrorKind::MethodError(_)) {
                        warn!(error = %e, "ReleaseName reply malformed");
                    }
                }
                let _ = done.send(result);
            }
            ReplySlot::PrimeNameOwner { name } => match reply_result(msg) {
                Ok(ret) => match ret.string(0) {
                    Ok(owner) => {
                        trace!(name = %name, owner = %owner, "owner cache primed");
                        self.name_owners.insert(name, owner.to_owned());
                    }
                    Err(e) => warn!(error = %e, "GetNameOwner reply malformed"),
                },
                // the name has no owner yet; matching keeps comparing the
                // raw value until NameOwnerChanged says otherwise
                Err(e) => debug!(error = %e, "name owner lookup failed"),
            },
        }
        Ok(())
    }

    fn finish_hello(&mut self, msg: Message) -> Result<()> {
        if msg.kind == MessageKind::Error {
            let name = msg.error_name.unwrap_or_default();
            return Err(context!(ErrorKind::Handshake(format!("Hello failed: {}", name))));
        }
        match msg.body.first().and_then(Value::as_str) {
            Some(name) => {
                self.unique_name = Some(name.to_owned());
                Ok(())
            }
            None => Err(context!(ErrorKind::Protocol(
                "Hello reply did not carry a name".into()
            ))),
        }
    }

    async fn dispatch_signal(&mut self, msg: Message) -> Result<()> {
        let (path, interface, member) = match (msg.path, msg.interface, msg.member) {
            (Some(path), Some(interface), Some(member)) => (path, interface, member),
            _ => {
                warn!("signal without path, interface or member");
                return Ok(());
            }
        };
        let signal = Signal {
            sender: msg.sender,
            path,
            interface,
            member,
            values: msg.body,
        };

        if signal.sender.as_deref() == Some(BUS_NAME) && signal.interface == BUS_IFACE {
            self.track_name_signal(&signal);
        }

        let mut dead = Vec::new();
        for sub in &self.subscriptions {
            if sub.filter.matches(&signal, &self.name_owners)
                && sub.tx.send(signal.clone()).is_err()
            {
                dead.push(sub.id);
            }
        }
        for id in dead {
            self.unsubscribe(id).await?;
        }
        Ok(())
    }

    fn track_name_signal(&mut self, signal: &Signal) {
        match signal.member.as_str() {
            "NameAcquired" => match signal.values.first().and_then(Value::as_str) {
                Some(name) => {
                    if let Some(unique) = &self.unique_name {
                        self.name_owners.insert(name.to_owned(), unique.clone());
                    }
                    self.owned_names.insert(name.to_owned());
                    let _ = self.name_acquired_tx.send(name.to_owned());
                }
                None => warn!("NameAcquired signal without a name"),
            },
            "NameLost" => match signal.values.first().and_then(Value::as_str) {
                Some(name) => {
                    self.name_owners.remove(name);
                    self.owned_names.remove(name);
                    let _ = self.name_lost_tx.send(name.to_owned());
                }
                None => warn!("NameLost signal without a name"),
            },
            "NameOwnerChanged" => {
                let name = signal.values.first().and_then(Value::as_str);
                let new_owner = signal.values.get(2).and_then(Value::as_str);
                match (name, new_owner) {
                    (Some(name), Some("")) => {
                        self.name_owners.remove(name);
                    }
                    (Some(name), Some(new_owner)) => {
                        self.name_owners.insert(name.to_owned(), new_owner.to_owned());
                    }
                    _ => warn!("NameOwnerChanged signal with unexpected arguments"),
                }
            }
            _ => {}
        }
    }

    async fn dispatch_call(&mut self, msg: Message) -> Result<()> {
        let serial = msg.serial;
        let no_reply = msg.no_reply;
        let sender = msg.sender.clone();

        let result = self.route_call(msg).await;
        if no_reply {
            return Ok(());
        }

        let mut reply = match result {
            Ok(values) => Message::method_return(serial, sender.as_deref(), values),
            Err(err) => Message::error(&err.name, serial, sender.as_deref(), err.values),
        };
        reply.serial = self.next_serial();
        let data = match wire::encode_message(&reply) {
            Ok(data) => data,
            Err(e) => {
                warn!(error = %e, "hosted object produced an unencodable reply");
                let mut failed = Message::error(ERR_FAILED, serial, sender.as_deref(), vec![]);
                failed.serial = reply.serial;
                wire::encode_message(&failed)?
            }
        };
        self.write_bytes(&data).await
    }

    async fn route_call(&mut self, msg: Message) -> std::result::Result<Vec<Value>, MethodError> {
        let path = match msg.path {
            Some(path) => path,
            None => return Err(MethodError::unknown_object("")),
        };
        let member = match msg.member {
            Some(member) => member,
            None => return Err(MethodError::unknown_method("")),
        };

        match msg.interface.as_deref() {
            Some(handlers::INTROSPECTABLE_IFACE) => {
                handlers::introspectable(&self.objects, &path, &member, &msg.body)
            }
            Some(handlers::PEER_IFACE) => handlers::peer(&path, &member, &msg.body),
            Some(handlers::PROPERTIES_IFACE) => {
                handlers::properties(&mut self.objects, &path, &member, &msg.body)
            }
            _ => {
                let call = Call {
                    sender: msg.sender,
                    path: path.clone(),
                    interface: msg.interface,
                    member,
                    values: msg.body,
                };
                match self.objects.get_mut(&path) {
                    Some(object) => object.call(&call).await,
                    None => Err(MethodError::unknown_object(&path)),
                }
            }
        }
    }

    async fn shutdown(&mut self) -> Result<()> {
        if self.state == ConnState::Ready {
            // cancel the internal name-tracking subscriptions before the
            // socket goes away
            let rules = std::mem::take(&mut self.internal_rules);
            for rule in rules {
                if let Err(e) = self.release_rule(&rule).await {
                    debug!(error = %e, "RemoveMatch failed during close");
                    break;
                }
            }
        }
        self.fail_all();
        Ok(())
    }

    fn transport_failure(&mut self, e: Error) {
        warn!(error = %e, "transport failure, failing all pending calls");
        self.fail_all();
    }

    /// Abandon every pending call, close all subscription channels and
    /// drop the socket. The connection never leaves the closed state.
    fn fail_all(&mut self) {
        for (_, slot) in self.pending.drain() {
            fail_slot(slot, context!(ErrorKind::ConnectionClosed));
        }
        self.subscriptions.clear();
        self.match_rules.clear();
        self.internal_rules.clear();
        self.transport = None;
        self.state = ConnState::Closed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn match_rule_includes_only_set_filters() {
        let filter = SignalFilter::new()
            .sender("com.example.Svc")
            .member("Changed");
        assert_eq!(
            filter.match_rule(),
            "type='signal',sender='com.example.Svc',member='Changed'"
        );
        assert_eq!(SignalFilter::new().match_rule(), "type='signal'");
        let full = SignalFilter::new()
            .sender("a")
            .interface("b")
            .member("c")
            .path("/d")
            .path_namespace("/e");
        assert_eq!(
            full.match_rule(),
            "type='signal',sender='a',interface='b',member='c',path='/d',path_namespace='/e'"
        );
    }

    fn signal(sender: &str, path: &str, interface: &str, member: &str) -> Signal {
        Signal {
            sender: Some(sender.to_owned()),
            path: path.to_owned(),
            interface: interface.to_owned(),
            member: member.to_owned(),
            values: Vec::new(),
        }
    }

    #[test]
    fn filter_resolves_well_known_sender_through_cache() {
        let mut owners = HashMap::new();
        owners.insert("com.example.Svc".to_owned(), ":1.7".to_owned());

        let filter = SignalFilter::new().sender("com.example.Svc");
        assert!(filter.matches(&signal(":1.7", "/o", "i.f", "M"), &owners));
        assert!(!filter.matches(&signal(":1.8", "/o", "i.f", "M"), &owners));

        // cold cache: the raw value is compared
        let cold = HashMap::new();
        assert!(!filter.matches(&signal(":1.7", "/o", "i.f", "M"), &cold));
        assert!(filter.matches(&signal("com.example.Svc", "/o", "i.f", "M"), &cold));
    }

    #[test]
    fn filter_path_namespace_matches_descendants() {
        let owners = HashMap::new();
        let filter = SignalFilter::new().path_namespace("/com/example");
        assert!(filter.matches(&signal(":1.1", "/com/example", "i.f", "M"), &owners));
        assert!(filter.matches(&signal(":1.1", "/com/example/child", "i.f", "M"), &owners));
        assert!(!filter.matches(&signal(":1.1", "/com/examples", "i.f", "M"), &owners));

        let root = SignalFilter::new().path_namespace("/");
        assert!(root.matches(&signal(":1.1", "/anything", "i.f", "M"), &owners));
    }

    #[test]
    fn request_name_flag_bits() {
        assert_eq!(RequestNameFlags::default().bits(), 0);
        let flags = RequestNameFlags { do_not_queue: true, ..Default::default() };
        assert_eq!(flags.bits(), 0x4);
        let all = RequestNameFlags {
            allow_replacement: true,
            replace_existing: true,
            do_not_queue: true,
        };
        assert_eq!(all.bits(), 0x7);
    }
}
