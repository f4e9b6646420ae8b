//! # Reactor
//!
//! One dedicated thread per reactor drives every connection through a
//! non-blocking loop on a current-thread tokio runtime. Each pass:
//!
//! 1. drains commands (outbound connects, shutdown)
//! 2. accepts new peers and completes pending connects
//! 3. reads, decodes and handles what every socket holds, then writes the
//!    pending frame or combines new ones
//! 4. tears down connections that faulted during the I/O pass
//! 5. runs the timers and reports to the listeners with no lock held
//! 6. drops connections that are closed and drained
//!
//! and then waits for a wake-up or the poll interval, never longer.
//!
//! [`Reactor`] is the owner's handle to that thread; [`ConnectionHandle`]
//! sends on and inspects one connection from any thread.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, OnceLock, PoisonError, RwLock};
use std::thread::{JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, Notify};
use tracing::{debug, error, info, instrument, warn};

use crate::config::NetworkConfig;
use crate::core::registry::TypeRegistry;
use crate::error::{constants, ProtocolError, Result};
use crate::protocol::envelope::{ConnectionId, Envelope};
use crate::protocol::message::MessageType;
use crate::protocol::negotiation::{ConnectionFilter, NegotiationStrategy, TypeTableNegotiation};
use crate::transport::channel::{Channels, Fault};
use crate::transport::connection::{
    CloseReason, Connection, ConnectionInfo, FailureReason, LifecycleEvent, Status,
};
use crate::transport::datagram::DatagramChannels;
use crate::transport::engine::Engine;
use crate::transport::framer::Framer;
use crate::transport::listener::{ConnectionListener, Listeners, MessageListener};
use crate::transport::stream::StreamChannels;
use crate::utils::buffer_pool::BufferPool;
use crate::utils::metrics::Metrics;

/// A connection plus the condition variable signalled on its status changes
pub struct ConnectionCell {
    state: Mutex<Connection>,
    changed: Condvar,
}

impl ConnectionCell {
    fn new(conn: Connection) -> Self {
        Self {
            state: Mutex::new(conn),
            changed: Condvar::new(),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, Connection> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn notify_changed(&self) {
        self.changed.notify_all();
    }
}

enum Command {
    Connect { id: ConnectionId, address: SocketAddr },
    Shutdown,
}

/// State shared between the reactor thread and its handles
pub struct Shared {
    engine: Engine,
    connections: RwLock<HashMap<ConnectionId, Arc<ConnectionCell>>>,
    commands: mpsc::UnboundedSender<Command>,
    wake: Notify,
    listeners: Listeners,
    next_connection_id: AtomicU32,
    reactor_thread: OnceLock<ThreadId>,
    local_addr: Option<SocketAddr>,
}

impl fmt::Debug for Shared {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Shared")
            .field("engine", &self.engine)
            .field("connections", &self.connection_count())
            .field("local_addr", &self.local_addr)
            .finish()
    }
}

impl Shared {
    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub fn connection_count(&self) -> usize {
        self.connections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn cell(&self, id: ConnectionId) -> Option<Arc<ConnectionCell>> {
        self.connections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
    }

    fn cells(&self) -> Vec<Arc<ConnectionCell>> {
        self.connections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    fn next_id(&self) -> ConnectionId {
        self.next_connection_id.fetch_add(1, Ordering::Relaxed)
    }

    fn insert(&self, conn: Connection) -> Arc<ConnectionCell> {
        let id = conn.id;
        let cell = Arc::new(ConnectionCell::new(conn));
        self.connections
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, cell.clone());
        cell
    }

    /// Opens a connection for a peer that reached us
    pub fn accept(&self, address: SocketAddr, linger: bool, now: Instant) -> Result<ConnectionId> {
        let id = self.next_id();
        let mut conn = Connection::new(id, address, self.engine.config(), now);
        conn.linger = linger;
        self.engine.open(&mut conn, false, now)?;
        self.engine.established(&mut conn, now);
        self.insert(conn);
        Ok(id)
    }

    fn remove_closed(&self) {
        let mut connections = self.connections.write().unwrap_or_else(PoisonError::into_inner);
        connections.retain(|id, cell| {
            let conn = cell.lock();
            let keep = conn.status() != Status::Disconnected || !conn.is_drained();
            if !keep {
                debug!(connection = id, "Connection removed");
            }
            keep
        });
    }

    fn is_reactor_thread(&self) -> bool {
        self.reactor_thread.get() == Some(&std::thread::current().id())
    }

    fn ensure_caller_thread(&self) -> Result<()> {
        if self.is_reactor_thread() {
            warn!("{}", constants::ERR_REACTOR_THREAD);
            return Err(ProtocolError::ReactorThread);
        }
        Ok(())
    }

    fn handle(self: &Arc<Self>, cell: &Arc<ConnectionCell>, id: ConnectionId, address: SocketAddr) -> ConnectionHandle {
        ConnectionHandle {
            id,
            address,
            cell: cell.clone(),
            shared: self.clone(),
        }
    }
}

/// Sends on and inspects one connection; cheap to clone
#[derive(Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    address: SocketAddr,
    cell: Arc<ConnectionCell>,
    shared: Arc<Shared>,
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.id)
            .field("address", &self.address)
            .finish()
    }
}

impl ConnectionHandle {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    pub fn status(&self) -> Status {
        self.cell.lock().status()
    }

    pub fn info(&self) -> ConnectionInfo {
        self.cell.lock().info()
    }

    /// Latest clock offset sample, remote minus local, in milliseconds
    pub fn clock_offset(&self) -> Option<i64> {
        self.cell.lock().clock_offset
    }

    /// Reason given by the peer if it kicked us
    pub fn kick_reason(&self) -> Option<String> {
        self.cell.lock().kick_reason.clone()
    }

    /// Queues `message` and returns its unique id (0 unless the type carries one).
    ///
    /// Fails with [`ProtocolError::QueueFull`] when the send queue is at
    /// capacity and [`ProtocolError::ConnectionClosed`] once the connection is
    /// disconnecting.
    pub fn send<T: MessageType>(&self, message: T) -> Result<u32> {
        self.send_envelope(Envelope::of(message))
    }

    /// Like [`send`](Self::send) for a prepared envelope (group, route, tries)
    pub fn send_envelope(&self, envelope: Envelope) -> Result<u32> {
        let unique_id = {
            let mut conn = self.cell.lock();
            self.shared.engine.enqueue(&mut conn, envelope)?
        };
        self.shared.wake.notify_one();
        Ok(unique_id)
    }

    /// Starts a graceful disconnect; `false` if the connection was not open
    pub fn disconnect(&self) -> bool {
        let started = {
            let mut conn = self.cell.lock();
            self.shared
                .engine
                .disconnect(&mut conn, CloseReason::ClosedByUser, Instant::now())
        };
        self.shared.wake.notify_one();
        started
    }

    /// Tells the peer why and disconnects
    pub fn kick(&self, reason: &str) -> bool {
        let started = {
            let mut conn = self.cell.lock();
            self.shared.engine.kick(&mut conn, reason, Instant::now())
        };
        self.shared.wake.notify_one();
        started
    }

    /// Disconnects and blocks until the connection is closed
    pub fn disconnect_and_wait(&self, timeout: Duration) -> Result<CloseReason> {
        self.shared.ensure_caller_thread()?;
        self.disconnect();
        self.wait_for(timeout, CloseReason::DisconnectTimeout, |conn| {
            (conn.status() == Status::Disconnected)
                .then(|| Ok(conn.close_reason().unwrap_or(CloseReason::ClosedByUser)))
        })
    }

    /// Blocks until negotiation completed
    pub fn wait_negotiated(&self, timeout: Duration) -> Result<()> {
        self.shared.ensure_caller_thread()?;
        self.wait_for(timeout, CloseReason::NegotiationTimeout, |conn| match conn.status() {
            Status::Connected => Some(Ok(())),
            Status::Disconnecting | Status::Disconnected => Some(Err(ProtocolError::ConnectionClosed)),
            Status::NotConnected | Status::Negotiating => None,
        })
    }

    /// Exchanges clock samples with the peer and returns the estimated offset
    /// of its clock relative to ours, in milliseconds
    pub fn synchronize_time_and_wait(&self, timeout: Duration) -> Result<i64> {
        self.shared.ensure_caller_thread()?;
        let samples = {
            let mut conn = self.cell.lock();
            self.shared.engine.request_time(&mut conn)?;
            conn.clock_samples
        };
        self.shared.wake.notify_one();
        self.wait_for(timeout, CloseReason::ReadTimeout, |conn| {
            if conn.clock_samples > samples {
                Some(Ok(conn.clock_offset.unwrap_or(0)))
            } else if conn.status() == Status::Disconnected {
                Some(Err(ProtocolError::ConnectionClosed))
            } else {
                None
            }
        })
    }

    /// Waits on the connection's condition variable until `ready` yields.
    ///
    /// On expiry the connection is closed with `on_timeout`.
    fn wait_for<R, F>(&self, timeout: Duration, on_timeout: CloseReason, mut ready: F) -> Result<R>
    where
        F: FnMut(&Connection) -> Option<Result<R>>,
    {
        let deadline = Instant::now() + timeout;
        let mut conn = self.cell.lock();
        loop {
            if let Some(outcome) = ready(&*conn) {
                return outcome;
            }
            let now = Instant::now();
            if now >= deadline {
                warn!(connection = self.id, reason = %on_timeout, "Wait timed out, closing connection");
                conn.override_close_reason(on_timeout);
                self.shared.engine.close(&mut conn, on_timeout, now);
                drop(conn);
                self.cell.notify_changed();
                self.shared.wake.notify_one();
                return Err(ProtocolError::Timeout);
            }
            conn = self
                .cell
                .changed
                .wait_timeout(conn, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }
}

/// Configures and starts a [`Reactor`]
pub struct ReactorBuilder {
    registry: Arc<TypeRegistry>,
    config: NetworkConfig,
    negotiation: Arc<dyn NegotiationStrategy>,
    filter: Option<Arc<dyn ConnectionFilter>>,
    connection_listeners: Vec<Arc<dyn ConnectionListener>>,
    message_listeners: Vec<Arc<dyn MessageListener>>,
}

impl ReactorBuilder {
    pub fn negotiation(mut self, strategy: impl NegotiationStrategy + 'static) -> Self {
        self.negotiation = Arc::new(strategy);
        self
    }

    pub fn filter(mut self, filter: impl ConnectionFilter + 'static) -> Self {
        self.filter = Some(Arc::new(filter));
        self
    }

    /// Registered before the first pass, so no early event is missed
    pub fn connection_listener(mut self, listener: Arc<dyn ConnectionListener>) -> Self {
        self.connection_listeners.push(listener);
        self
    }

    pub fn message_listener(mut self, listener: Arc<dyn MessageListener>) -> Self {
        self.message_listeners.push(listener);
        self
    }

    /// Listens for stream peers on `addr` and allows outbound connects
    #[instrument(skip(self), fields(address = %addr))]
    pub fn bind_stream(self, addr: SocketAddr) -> Result<Reactor> {
        let listener = std::net::TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;
        info!(%local_addr, "Stream reactor listening");
        self.spawn(Some(local_addr), Io::Stream(Some(listener)))
    }

    /// Outbound stream connections only
    #[instrument(skip(self))]
    pub fn client_stream(self) -> Result<Reactor> {
        self.spawn(None, Io::Stream(None))
    }

    /// Serves datagram peers on `addr`; also used for outbound datagram connections
    #[instrument(skip(self), fields(address = %addr))]
    pub fn bind_datagram(self, addr: SocketAddr) -> Result<Reactor> {
        let socket = std::net::UdpSocket::bind(addr)?;
        socket.set_nonblocking(true)?;
        let local_addr = socket.local_addr()?;
        info!(%local_addr, "Datagram reactor bound");
        self.spawn(Some(local_addr), Io::Datagram(socket))
    }

    fn spawn(self, local_addr: Option<SocketAddr>, io: Io) -> Result<Reactor> {
        self.config.validate_strict()?;

        let buffers = &self.config.buffers;
        let frame_size = match io {
            Io::Stream(_) => buffers.scratch_buffer_size,
            Io::Datagram(_) => buffers.datagram_payload_size,
        };
        let framer = Framer::new(BufferPool::new(buffers.pool_size, frame_size));
        let receive_chunk = buffers.receive_buffer_size;
        let max_frame = buffers.scratch_buffer_size;
        let poll_interval = self.config.transport.poll_interval;

        let (commands, command_rx) = mpsc::unbounded_channel();
        let listeners = Listeners::default();
        for listener in self.connection_listeners {
            listeners.add_connection_listener(listener);
        }
        for listener in self.message_listeners {
            listeners.add_message_listener(listener);
        }
        let metrics = Arc::new(Metrics::new());
        let shared = Arc::new(Shared {
            engine: Engine::new(self.registry, self.config, self.negotiation, self.filter, metrics),
            connections: RwLock::new(HashMap::new()),
            commands,
            wake: Notify::new(),
            listeners,
            next_connection_id: AtomicU32::new(1),
            reactor_thread: OnceLock::new(),
            local_addr,
        });

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let thread_shared = shared.clone();
        let thread = std::thread::Builder::new()
            .name("msgwire-reactor".to_string())
            .spawn(move || {
                let _ = thread_shared.reactor_thread.set(std::thread::current().id());
                runtime.block_on(async move {
                    let channels: Box<dyn Channels> = match io {
                        Io::Stream(listener) => {
                            match StreamChannels::new(listener, receive_chunk, max_frame) {
                                Ok(channels) => Box::new(channels),
                                Err(e) => {
                                    error!(error = %e, "Failed to register stream listener");
                                    return;
                                }
                            }
                        }
                        Io::Datagram(socket) => match DatagramChannels::new(socket) {
                            Ok(channels) => Box::new(channels),
                            Err(e) => {
                                error!(error = %e, "Failed to register datagram socket");
                                return;
                            }
                        },
                    };
                    EventLoop {
                        shared: thread_shared,
                        commands: command_rx,
                        channels,
                        framer,
                        poll_interval,
                        shutting_down: false,
                    }
                    .run()
                    .await;
                });
            })?;

        Ok(Reactor {
            shared,
            thread: Some(thread),
        })
    }
}

enum Io {
    Stream(Option<std::net::TcpListener>),
    Datagram(std::net::UdpSocket),
}

/// Handle to a running reactor thread
pub struct Reactor {
    shared: Arc<Shared>,
    thread: Option<JoinHandle<()>>,
}

impl fmt::Debug for Reactor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reactor")
            .field("shared", &self.shared)
            .field("running", &self.thread.is_some())
            .finish()
    }
}

impl Reactor {
    pub fn builder(registry: Arc<TypeRegistry>, config: NetworkConfig) -> ReactorBuilder {
        ReactorBuilder {
            registry,
            config,
            negotiation: Arc::new(TypeTableNegotiation),
            filter: None,
            connection_listeners: Vec::new(),
            message_listeners: Vec::new(),
        }
    }

    pub fn bind_stream(addr: SocketAddr, registry: Arc<TypeRegistry>, config: NetworkConfig) -> Result<Self> {
        Self::builder(registry, config).bind_stream(addr)
    }

    pub fn client_stream(registry: Arc<TypeRegistry>, config: NetworkConfig) -> Result<Self> {
        Self::builder(registry, config).client_stream()
    }

    pub fn bind_datagram(addr: SocketAddr, registry: Arc<TypeRegistry>, config: NetworkConfig) -> Result<Self> {
        Self::builder(registry, config).bind_datagram(addr)
    }

    /// Bound address, if this reactor listens
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.shared.local_addr
    }

    /// Session id this reactor announces in its registrations
    pub fn session_id(&self) -> u32 {
        self.shared.engine.session_id()
    }

    pub fn metrics(&self) -> &Metrics {
        self.shared.engine.metrics()
    }

    pub fn add_connection_listener(&self, listener: Arc<dyn ConnectionListener>) {
        self.shared.listeners.add_connection_listener(listener);
    }

    pub fn add_message_listener(&self, listener: Arc<dyn MessageListener>) {
        self.shared.listeners.add_message_listener(listener);
    }

    /// Starts connecting to `address`; negotiation follows automatically
    pub fn connect(&self, address: SocketAddr) -> Result<ConnectionHandle> {
        let shared = &self.shared;
        if shared.connection_count() >= shared.engine.config().transport.max_connections {
            return Err(ProtocolError::Custom(constants::ERR_CONNECTION_LIMIT.to_string()));
        }

        let id = shared.next_id();
        let now = Instant::now();
        let mut conn = Connection::new(id, address, shared.engine.config(), now);
        shared.engine.open(&mut conn, true, now)?;
        let cell = shared.insert(conn);

        shared
            .commands
            .send(Command::Connect { id, address })
            .map_err(|_| ProtocolError::ConnectionClosed)?;
        shared.wake.notify_one();
        Ok(shared.handle(&cell, id, address))
    }

    /// Connects and blocks until negotiation completed
    pub fn connect_and_wait(&self, address: SocketAddr, timeout: Duration) -> Result<ConnectionHandle> {
        self.shared.ensure_caller_thread()?;
        let handle = self.connect(address)?;
        handle.wait_negotiated(timeout)?;
        Ok(handle)
    }

    pub fn connection(&self, id: ConnectionId) -> Option<ConnectionHandle> {
        let cell = self.shared.cell(id)?;
        let address = cell.lock().address;
        Some(self.shared.handle(&cell, id, address))
    }

    pub fn connections(&self) -> Vec<ConnectionHandle> {
        self.shared
            .cells()
            .iter()
            .map(|cell| {
                let (id, address) = {
                    let conn = cell.lock();
                    (conn.id, conn.address)
                };
                self.shared.handle(cell, id, address)
            })
            .collect()
    }

    /// Kicks connection `id` with `reason`
    pub fn kick(&self, id: ConnectionId, reason: &str) -> Result<()> {
        let handle = self
            .connection(id)
            .ok_or(ProtocolError::UnknownConnection(id))?;
        handle.kick(reason);
        Ok(())
    }

    /// Disconnects every connection with [`CloseReason::Shutdown`] and joins the
    /// reactor thread once all of them closed or the disconnect timeout forced them
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        let Some(thread) = self.thread.take() else {
            return;
        };
        let _ = self.shared.commands.send(Command::Shutdown);
        self.shared.wake.notify_one();
        if self.shared.is_reactor_thread() {
            warn!("Reactor dropped from its own thread, not joining");
            return;
        }
        if thread.join().is_err() {
            error!("Reactor thread panicked");
        }
    }
}

impl Drop for Reactor {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Listener work collected under a connection lock and run after it is released
struct Report {
    events: Vec<LifecycleEvent>,
    sent: Vec<Envelope>,
    certified: Vec<Envelope>,
    received: Vec<Envelope>,
    failed: Vec<(Envelope, FailureReason)>,
}

impl Report {
    fn collect(conn: &mut Connection) -> Option<Self> {
        let mut received = Vec::with_capacity(conn.incoming.len());
        while let Some(envelope) = conn.incoming.poll() {
            received.push(envelope);
        }
        let report = Self {
            events: conn.events.drain(..).collect(),
            sent: conn.outgoing_dispatch.drain(..).collect(),
            certified: conn.certified.drain(..).collect(),
            received,
            failed: conn.failed.drain(..).collect(),
        };
        let empty = report.events.is_empty()
            && report.sent.is_empty()
            && report.certified.is_empty()
            && report.received.is_empty()
            && report.failed.is_empty();
        (!empty).then_some(report)
    }

    fn deliver(self, handle: &ConnectionHandle, listeners: &Listeners, metrics: &Metrics) {
        let connection_listeners = listeners.connection_listeners();
        let message_listeners = listeners.message_listeners();

        let mut closed = None;
        for event in &self.events {
            match event {
                LifecycleEvent::Connected => connection_listeners.iter().for_each(|l| l.on_connected(handle)),
                LifecycleEvent::Negotiated => connection_listeners.iter().for_each(|l| l.on_negotiated(handle)),
                LifecycleEvent::Kicked(reason) => connection_listeners.iter().for_each(|l| l.on_kicked(handle, reason)),
                LifecycleEvent::Disconnected(reason) => closed = Some(*reason),
            }
        }

        for envelope in &self.sent {
            message_listeners.iter().for_each(|l| l.on_sent(handle, envelope));
        }
        for envelope in &self.certified {
            metrics.certified();
            message_listeners.iter().for_each(|l| l.on_certified(handle, envelope));
        }
        for envelope in &self.received {
            message_listeners.iter().for_each(|l| l.on_received(handle, envelope));
        }
        for (envelope, reason) in &self.failed {
            metrics.failed();
            message_listeners
                .iter()
                .for_each(|l| l.on_failed(handle, envelope, *reason));
        }

        if let Some(reason) = closed {
            connection_listeners
                .iter()
                .for_each(|l| l.on_disconnected(handle, reason));
        }
    }
}

/// Reactor-thread state
struct EventLoop {
    shared: Arc<Shared>,
    commands: mpsc::UnboundedReceiver<Command>,
    channels: Box<dyn Channels>,
    framer: Framer,
    poll_interval: Duration,
    shutting_down: bool,
}

impl EventLoop {
    async fn run(mut self) {
        info!(session_id = self.shared.engine.session_id(), "Reactor started");
        loop {
            self.pass(Instant::now());

            if self.shutting_down && self.shared.connection_count() == 0 {
                break;
            }
            if self.channels.take_backlog() {
                tokio::task::yield_now().await;
                continue;
            }

            tokio::select! {
                _ = self.shared.wake.notified() => {}
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
        self.shared.engine.metrics().log_metrics();
        info!("Reactor stopped");
    }

    fn pass(&mut self, now: Instant) {
        self.drain_commands(now);
        self.channels.poll_incoming(&self.shared, now);

        let cells = self.shared.cells();
        let engine = &self.shared.engine;

        let mut problems = Vec::new();
        for cell in &cells {
            let mut conn = cell.lock();
            if conn.status() == Status::Disconnected {
                continue;
            }
            let mut io = self.channels.read(&mut conn, engine, now);
            if io.is_ok() {
                io = self.channels.write(&mut conn, &mut self.framer, engine, now);
            }
            if let Err(fault) = io {
                problems.push((cell.clone(), fault));
            }
        }

        for (cell, fault) in problems {
            let mut conn = cell.lock();
            match fault {
                Fault::EndOfStream => engine.end_of_stream(&mut conn, now),
                Fault::Close(reason) => engine.close(&mut conn, reason, now),
            }
        }

        let mut reports = Vec::new();
        for cell in &cells {
            let mut conn = cell.lock();
            engine.tick(&mut conn, now);
            if conn.status() == Status::Disconnected {
                self.channels.release(&conn);
            }
            if let Some(report) = Report::collect(&mut conn) {
                reports.push((self.shared.handle(cell, conn.id, conn.address), report));
            }
            if conn.take_changed() {
                cell.notify_changed();
            }
        }

        for (handle, report) in reports {
            report.deliver(&handle, &self.shared.listeners, engine.metrics());
        }

        self.shared.remove_closed();
    }

    fn drain_commands(&mut self, now: Instant) {
        while let Ok(command) = self.commands.try_recv() {
            match command {
                Command::Connect { id, address } => {
                    if self.shutting_down {
                        if let Some(cell) = self.shared.cell(id) {
                            self.shared.engine.close(&mut cell.lock(), CloseReason::Shutdown, now);
                        }
                        continue;
                    }
                    self.channels.connect(&self.shared, id, address);
                }
                Command::Shutdown => {
                    info!(connections = self.shared.connection_count(), "Shutting down reactor");
                    self.shutting_down = true;
                    self.channels.stop_accepting();
                    for cell in self.shared.cells() {
                        let mut conn = cell.lock();
                        self.shared.engine.disconnect(&mut conn, CloseReason::Shutdown, now);
                    }
                }
            }
        }
    }
}
