//! Stream (TCP) channels: one socket per connection, bytes framed by length.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;

use futures::FutureExt;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, trace, warn};

use crate::protocol::envelope::ConnectionId;
use crate::transport::channel::{
    decode_buffered, reserve_read_space, write_frames, Channels, Fault, IoResult,
};
use crate::transport::connection::{CloseReason, Connection, Status};
use crate::transport::engine::Engine;
use crate::transport::framer::{Framer, LENGTH_PREFIX};
use crate::transport::reactor::Shared;

type PendingConnect = Pin<Box<dyn Future<Output = io::Result<TcpStream>> + Send>>;

pub struct StreamChannels {
    listener: Option<TcpListener>,
    streams: HashMap<ConnectionId, TcpStream>,
    connecting: Vec<(ConnectionId, PendingConnect)>,
    /// Connections whose write side is shut down
    half_closed: HashSet<ConnectionId>,
    receive_chunk: usize,
    max_frame: usize,
    /// A read stopped at its budget with bytes still waiting
    backlog: bool,
}

impl StreamChannels {
    /// Must run inside the reactor's runtime
    pub fn new(listener: Option<std::net::TcpListener>, receive_chunk: usize, max_frame: usize) -> io::Result<Self> {
        let listener = listener.map(TcpListener::from_std).transpose()?;
        Ok(Self {
            listener,
            streams: HashMap::new(),
            connecting: Vec::new(),
            half_closed: HashSet::new(),
            receive_chunk,
            max_frame,
            backlog: false,
        })
    }

    fn accept_all(&mut self, shared: &Arc<Shared>, now: Instant) {
        let Some(listener) = &self.listener else {
            return;
        };
        while let Some(accepted) = listener.accept().now_or_never() {
            let (stream, address) = match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(error = %e, "Accept failed");
                    break;
                }
            };
            if shared.connection_count() >= shared.engine().config().transport.max_connections {
                warn!(peer = %address, "Connection limit reached, refusing peer");
                continue;
            }
            if let Err(e) = stream.set_nodelay(true) {
                debug!(peer = %address, error = %e, "Failed to set TCP_NODELAY");
            }
            match shared.accept(address, true, now) {
                Ok(id) => {
                    info!(connection = id, peer = %address, "Accepted connection");
                    self.streams.insert(id, stream);
                }
                Err(e) => warn!(peer = %address, error = %e, "Failed to open accepted connection"),
            }
        }
    }

    fn complete_connects(&mut self, shared: &Arc<Shared>, now: Instant) {
        let mut still_pending = Vec::with_capacity(self.connecting.len());
        for (id, mut connect) in self.connecting.drain(..) {
            let Some(result) = connect.as_mut().now_or_never() else {
                still_pending.push((id, connect));
                continue;
            };
            let Some(cell) = shared.cell(id) else {
                continue;
            };
            let mut conn = cell.lock();
            match result {
                Ok(stream) if conn.status() != Status::Disconnected => {
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!(connection = id, error = %e, "Failed to set TCP_NODELAY");
                    }
                    conn.linger = true;
                    shared.engine().established(&mut conn, now);
                    self.streams.insert(id, stream);
                }
                Ok(_) => debug!(connection = id, "Connect completed after close"),
                Err(e) => {
                    warn!(connection = id, address = %conn.address, error = %e, "Connect failed");
                    shared.engine().close(&mut conn, CloseReason::ChannelConnectError, now);
                }
            }
            drop(conn);
            cell.notify_changed();
        }
        self.connecting = still_pending;
    }
}

impl Channels for StreamChannels {
    fn poll_incoming(&mut self, shared: &Arc<Shared>, now: Instant) {
        self.accept_all(shared, now);
        self.complete_connects(shared, now);
    }

    fn connect(&mut self, _shared: &Arc<Shared>, id: ConnectionId, address: SocketAddr) {
        debug!(connection = id, %address, "Connecting");
        self.connecting.push((id, Box::pin(TcpStream::connect(address))));
    }

    fn read(&mut self, conn: &mut Connection, engine: &Engine, now: Instant) -> IoResult {
        let Some(stream) = self.streams.get(&conn.id) else {
            return Ok(());
        };

        // One full frame per pass at least; the rest waits for the next pass
        let budget = self.receive_chunk.max(self.max_frame + LENGTH_PREFIX);
        let mut read = 0;
        let mut end_of_stream = false;
        loop {
            if read >= budget {
                trace!(connection = conn.id, read, "Read budget used up");
                self.backlog = true;
                break;
            }
            reserve_read_space(&mut conn.read_buffer, self.receive_chunk);
            match stream.try_read_buf(&mut conn.read_buffer) {
                Ok(0) => {
                    end_of_stream = true;
                    break;
                }
                Ok(n) => {
                    read += n;
                    engine.metrics().bytes_read(n);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!(connection = conn.id, error = %e, "Read failed");
                    return Err(Fault::Close(CloseReason::ChannelReadError));
                }
            }
        }

        decode_buffered(conn, engine, self.max_frame, now)?;
        if end_of_stream {
            return Err(Fault::EndOfStream);
        }
        Ok(())
    }

    fn write(&mut self, conn: &mut Connection, framer: &mut Framer, engine: &Engine, now: Instant) -> IoResult {
        let Some(stream) = self.streams.get_mut(&conn.id) else {
            return Ok(());
        };
        write_frames(conn, framer, engine, now, |bytes| stream.try_write(bytes))?;

        // Everything is out: signal end of stream and wait for the peer's
        if conn.status() == Status::Disconnecting && conn.is_flushed() && self.half_closed.insert(conn.id) {
            debug!(connection = conn.id, "Shutting down write side");
            if let Some(Err(e)) = stream.shutdown().now_or_never() {
                debug!(connection = conn.id, error = %e, "Write shutdown failed");
                return Err(Fault::Close(CloseReason::ChannelWriteError));
            }
        }
        Ok(())
    }

    fn release(&mut self, conn: &Connection) {
        self.half_closed.remove(&conn.id);
        if self.streams.remove(&conn.id).is_some() {
            debug!(connection = conn.id, "Stream released");
        }
    }

    fn stop_accepting(&mut self) {
        self.listener = None;
    }

    fn take_backlog(&mut self) -> bool {
        std::mem::take(&mut self.backlog)
    }
}
