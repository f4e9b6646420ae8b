//! Datagram (UDP) channels.
//!
//! One socket serves every peer; connections are told apart by remote
//! address. A datagram carries one whole frame, so frames are capped at the
//! configured datagram payload size. The first datagram from an unknown
//! address opens a `Negotiating` connection. There is no delivery guarantee
//! below the certification layer.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

use crate::protocol::envelope::ConnectionId;
use crate::transport::channel::{decode_buffered, write_frames, Channels, IoResult};
use crate::transport::connection::{Connection, Status};
use crate::transport::engine::Engine;
use crate::transport::framer::Framer;
use crate::transport::reactor::Shared;

/// Largest UDP payload over IPv4
const MAX_DATAGRAM: usize = 65_507;

pub struct DatagramChannels {
    socket: UdpSocket,
    peers: HashMap<SocketAddr, ConnectionId>,
    accepting: bool,
    scratch: Vec<u8>,
}

impl DatagramChannels {
    /// Must run inside the reactor's runtime
    pub fn new(socket: std::net::UdpSocket) -> io::Result<Self> {
        Ok(Self {
            socket: UdpSocket::from_std(socket)?,
            peers: HashMap::new(),
            accepting: true,
            scratch: vec![0; MAX_DATAGRAM],
        })
    }

    fn peer_for(&mut self, shared: &Arc<Shared>, address: SocketAddr, now: Instant) -> Option<ConnectionId> {
        if let Some(&id) = self.peers.get(&address) {
            return Some(id);
        }
        if !self.accepting {
            debug!(peer = %address, "Ignoring datagram from unknown peer");
            return None;
        }
        if shared.connection_count() >= shared.engine().config().transport.max_connections {
            warn!(peer = %address, "Connection limit reached, ignoring peer");
            return None;
        }
        match shared.accept(address, false, now) {
            Ok(id) => {
                info!(connection = id, peer = %address, "New datagram peer");
                self.peers.insert(address, id);
                Some(id)
            }
            Err(e) => {
                warn!(peer = %address, error = %e, "Failed to open datagram peer");
                None
            }
        }
    }

    fn deliver(&self, shared: &Arc<Shared>, id: ConnectionId, len: usize, now: Instant) {
        let Some(cell) = shared.cell(id) else {
            return;
        };
        let engine = shared.engine();
        let mut conn = cell.lock();
        if conn.status() == Status::Disconnected {
            return;
        }
        engine.metrics().bytes_read(len);
        conn.read_buffer.extend_from_slice(&self.scratch[..len]);

        // Decode errors are counted by `decode_buffered`
        let decoded = decode_buffered(&mut conn, engine, len, now);
        if decoded.is_ok() && !conn.read_buffer.is_empty() {
            engine.metrics().protocol_error();
        }
        if decoded.is_err() || !conn.read_buffer.is_empty() {
            // A datagram is self-contained; leftovers cannot be completed later
            warn!(connection = id, bytes = len, "Dropping malformed datagram");
            conn.read_buffer.clear();
        }
        let changed = conn.take_changed();
        drop(conn);
        if changed {
            cell.notify_changed();
        }
    }
}

impl Channels for DatagramChannels {
    fn poll_incoming(&mut self, shared: &Arc<Shared>, now: Instant) {
        loop {
            let (len, address) = match self.socket.try_recv_from(&mut self.scratch) {
                Ok(received) => received,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    // ICMP unreachable surfaces here on some platforms
                    debug!(error = %e, "Datagram receive failed");
                    break;
                }
            };
            if let Some(id) = self.peer_for(shared, address, now) {
                self.deliver(shared, id, len, now);
            }
        }
    }

    fn connect(&mut self, shared: &Arc<Shared>, id: ConnectionId, address: SocketAddr) {
        let Some(cell) = shared.cell(id) else {
            return;
        };
        self.peers.insert(address, id);
        let mut conn = cell.lock();
        shared.engine().established(&mut conn, Instant::now());
        drop(conn);
        cell.notify_changed();
    }

    fn read(&mut self, _conn: &mut Connection, _engine: &Engine, _now: Instant) -> IoResult {
        Ok(())
    }

    fn write(&mut self, conn: &mut Connection, framer: &mut Framer, engine: &Engine, now: Instant) -> IoResult {
        let socket = &self.socket;
        let address = conn.address;
        write_frames(conn, framer, engine, now, |bytes| socket.try_send_to(bytes, address))
    }

    fn release(&mut self, conn: &Connection) {
        if self.peers.get(&conn.address) == Some(&conn.id) {
            self.peers.remove(&conn.address);
            debug!(connection = conn.id, "Datagram peer released");
        }
    }

    fn stop_accepting(&mut self) {
        self.accepting = false;
    }
}
