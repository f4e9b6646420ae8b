//! Socket side of the reactor.
//!
//! A [`Channels`] implementation owns every socket of one reactor and moves
//! bytes between them and the connections. Stream and datagram transports
//! differ only here.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use bytes::BytesMut;
use tracing::{debug, warn};

use crate::core::registry::TypeContext;
use crate::protocol::envelope::ConnectionId;
use crate::transport::connection::{CloseReason, Connection, Status};
use crate::transport::engine::Engine;
use crate::transport::framer::{read_frame, Framer};
use crate::transport::reactor::Shared;

/// Why the I/O pass gave up on a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Orderly end of the peer's byte stream
    EndOfStream,
    Close(CloseReason),
}

pub type IoResult = std::result::Result<(), Fault>;

/// Sockets of one reactor
pub trait Channels: Send {
    /// Accepts new peers, completes pending connects and, for datagrams,
    /// receives everything that arrived
    fn poll_incoming(&mut self, shared: &Arc<Shared>, now: Instant);

    /// Starts an outbound connect for a connection already in `Negotiating`
    fn connect(&mut self, shared: &Arc<Shared>, id: ConnectionId, address: SocketAddr);

    /// Reads and decodes whatever the connection's socket holds
    fn read(&mut self, conn: &mut Connection, engine: &Engine, now: Instant) -> IoResult;

    /// Writes the pending frame and as many new frames as the socket takes
    fn write(&mut self, conn: &mut Connection, framer: &mut Framer, engine: &Engine, now: Instant) -> IoResult;

    /// Drops the socket state of a closed connection
    fn release(&mut self, conn: &Connection);

    /// Stops accepting new peers
    fn stop_accepting(&mut self);

    /// Whether the last pass left readable data behind; clears the flag
    fn take_backlog(&mut self) -> bool {
        false
    }
}

/// Decodes every complete message in the receive buffer.
///
/// The type context is rebuilt per message so a registration takes effect
/// for the messages behind it.
pub fn decode_buffered(conn: &mut Connection, engine: &Engine, max_len: usize, now: Instant) -> IoResult {
    while conn.status() != Status::Disconnected {
        let next = read_frame(
            &mut conn.read_buffer,
            TypeContext::negotiated(engine.registry(), &conn.types),
            max_len,
        );
        match next {
            Ok(Some(envelope)) => engine.receive(conn, envelope, now),
            Ok(None) => break,
            Err(e) => {
                warn!(connection = conn.id, error = %e, "Undecodable frame");
                engine.metrics().protocol_error();
                return Err(Fault::Close(CloseReason::BadMessage));
            }
        }
    }
    Ok(())
}

/// Makes room for the next read
pub fn reserve_read_space(buffer: &mut BytesMut, chunk: usize) {
    if buffer.capacity() == buffer.len() {
        buffer.reserve(chunk.max(1));
    }
}

/// Drives frame writes through `send` until it would block.
///
/// `send` returns the number of bytes the socket accepted.
pub fn write_frames<F>(
    conn: &mut Connection,
    framer: &mut Framer,
    engine: &Engine,
    now: Instant,
    mut send: F,
) -> IoResult
where
    F: FnMut(&[u8]) -> io::Result<usize>,
{
    loop {
        if conn.pending_write.is_none() {
            conn.pending_write = framer.combine(conn, engine.registry(), now);
        }
        let Some(frame) = conn.pending_write.as_mut() else {
            return Ok(());
        };

        match send(frame.unwritten()) {
            Ok(0) => {
                warn!(connection = conn.id, "Socket accepted no bytes");
                return Err(Fault::Close(CloseReason::ChannelWriteError));
            }
            Ok(n) => {
                engine.metrics().bytes_written(n);
                let flushed = frame.advance(n);
                if frame.is_complete() {
                    engine.metrics().frame_sent(frame.flushed_count());
                    conn.pending_write = None;
                }
                engine.flushed(conn, flushed, now);
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                debug!(connection = conn.id, error = %e, "Write failed");
                return Err(Fault::Close(CloseReason::ChannelWriteError));
            }
        }
    }
}
