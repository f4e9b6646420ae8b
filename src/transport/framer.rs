//! # Framer
//!
//! Packs a connection's outgoing queue into frames and splits received bytes
//! back into envelopes.
//!
//! Every message on the wire is `[i32 length][envelope]`, the length excluding
//! itself. A [`Frame`] is a run of such messages inside one pooled buffer, plus
//! the boundary where each message ends, so a partially written frame still
//! tells which messages are fully flushed.

use std::collections::VecDeque;
use std::time::Instant;

use bytes::{Buf, BytesMut};
use tracing::{debug, trace, warn};

use crate::core::registry::{TypeContext, TypeRegistry};
use crate::core::wire::{WireReader, WireWriter};
use crate::error::{constants, ProtocolError, Result};
use crate::protocol::envelope::{read_envelope, write_envelope, Envelope};
use crate::transport::connection::{Connection, FailureReason};
use crate::utils::buffer_pool::{BufferPool, PooledBuffer};

/// Size of the length prefix
pub const LENGTH_PREFIX: usize = 4;

/// End offset of one message inside a frame
#[derive(Debug)]
pub struct Boundary {
    pub envelope: Envelope,
    pub end: usize,
}

/// Messages packed into one pooled buffer, returned to the pool on drop
#[derive(Debug)]
pub struct Frame {
    buffer: PooledBuffer,
    boundaries: VecDeque<Boundary>,
    written: usize,
    flushed: usize,
}

impl Frame {
    fn new(buffer: PooledBuffer) -> Self {
        Self {
            buffer,
            boundaries: VecDeque::new(),
            written: 0,
            flushed: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn bytes(&self) -> &[u8] {
        &self.buffer
    }

    /// Bytes not yet handed to the socket
    pub fn unwritten(&self) -> &[u8] {
        &self.buffer[self.written..]
    }

    pub fn is_complete(&self) -> bool {
        self.written == self.buffer.len()
    }

    /// Boundaries of the messages not yet fully flushed, in frame order
    pub fn boundaries(&self) -> impl Iterator<Item = &Boundary> {
        self.boundaries.iter()
    }

    /// Messages not yet fully flushed
    pub fn message_count(&self) -> usize {
        self.boundaries.len()
    }

    /// Messages fully flushed so far
    pub fn flushed_count(&self) -> usize {
        self.flushed
    }

    /// Records `n` more bytes written and returns the envelopes now fully flushed
    pub fn advance(&mut self, n: usize) -> Vec<Envelope> {
        self.written = (self.written + n).min(self.buffer.len());
        let mut flushed = Vec::new();
        while self
            .boundaries
            .front()
            .is_some_and(|boundary| boundary.end <= self.written)
        {
            if let Some(boundary) = self.boundaries.pop_front() {
                flushed.push(boundary.envelope);
            }
        }
        self.flushed += flushed.len();
        flushed
    }

    /// Envelopes whose bytes were not completely written
    pub fn into_unflushed(mut self) -> Vec<Envelope> {
        self.boundaries.drain(..).map(|b| b.envelope).collect()
    }

    fn push(&mut self, envelope: Envelope) {
        let end = self.buffer.len();
        self.boundaries.push_back(Boundary { envelope, end });
    }
}

/// Builds frames from outgoing queues
#[derive(Debug)]
pub struct Framer {
    pool: BufferPool,
    /// Encoding area of the message in progress
    staging: Vec<u8>,
}

impl Framer {
    pub fn new(pool: BufferPool) -> Self {
        Self {
            pool,
            staging: Vec::new(),
        }
    }

    /// Largest message that fits into an empty frame
    pub fn max_message_size(&self) -> usize {
        self.pool.buffer_size()
    }

    /// Drains `conn.outgoing` into a new frame.
    ///
    /// The overhang of the previous call goes first. Non-handshake messages are
    /// withheld until the connection allows payload. A message that does not
    /// fit becomes the new overhang; one that would not even fit an empty frame
    /// fails with [`FailureReason::TooLarge`]. Certified messages are counted
    /// as one more try and copied into the certifiable queue.
    pub fn combine(
        &mut self,
        conn: &mut Connection,
        registry: &TypeRegistry,
        now: Instant,
    ) -> Option<Frame> {
        let mut frame: Option<Frame> = None;

        loop {
            let mut envelope = match conn.overhang.take() {
                Some(envelope) => envelope,
                None => {
                    let withheld = match conn.outgoing.peek() {
                        None => break,
                        Some(next) => !conn.status().allows_payload() && !next.is_handshake(),
                    };
                    if withheld {
                        trace!(connection = conn.id, "Withholding payload until negotiated");
                        break;
                    }
                    match conn.outgoing.poll() {
                        Some(envelope) => envelope,
                        None => break,
                    }
                }
            };

            let certified = envelope.is_certified();
            if certified {
                envelope.tries = envelope.tries.saturating_add(1);
            }

            if let Err(e) = self.stage(conn, registry, &envelope) {
                warn!(connection = conn.id, type_name = envelope.payload.type_name(), error = %e, "Failed to encode message");
                conn.failed.push_back((envelope, FailureReason::Unencodable));
                continue;
            }

            let target = frame.get_or_insert_with(|| Frame::new(self.pool.acquire()));
            if !target.buffer.try_extend(&self.staging) {
                if certified {
                    envelope.tries -= 1;
                }
                if target.is_empty() {
                    warn!(
                        connection = conn.id,
                        type_name = envelope.payload.type_name(),
                        size = self.staging.len(),
                        limit = self.pool.buffer_size(),
                        "Message larger than a frame buffer"
                    );
                    conn.failed.push_back((envelope, FailureReason::TooLarge));
                    continue;
                }
                debug!(connection = conn.id, "Frame full, deferring message");
                conn.overhang = Some(envelope);
                break;
            }

            if certified {
                conn.certifiable.push(envelope.clone(), now);
            }
            target.push(envelope);
        }

        frame.filter(|frame| !frame.is_empty())
    }

    /// Encodes `[length][envelope]` into the staging area
    fn stage(&mut self, conn: &Connection, registry: &TypeRegistry, envelope: &Envelope) -> Result<()> {
        self.staging.clear();
        self.staging.extend_from_slice(&[0; LENGTH_PREFIX]);
        let types = TypeContext::negotiated(registry, &conn.types);
        write_envelope(&mut WireWriter::new(&mut self.staging, types), envelope)?;

        let body = self.staging.len() - LENGTH_PREFIX;
        let len = i32::try_from(body).map_err(|_| ProtocolError::OversizedMessage(body))?;
        self.staging[..LENGTH_PREFIX].copy_from_slice(&len.to_be_bytes());
        Ok(())
    }
}

/// Splits the next complete message off `buf`.
///
/// Returns `Ok(None)` while the message is incomplete; the partial bytes stay
/// in `buf` and room for the rest is reserved.
pub fn read_frame(buf: &mut BytesMut, types: TypeContext<'_>, max_len: usize) -> Result<Option<Envelope>> {
    if buf.len() < LENGTH_PREFIX {
        return Ok(None);
    }

    let len = (&buf[..LENGTH_PREFIX]).get_i32();
    let len = usize::try_from(len).map_err(|_| ProtocolError::Malformed(format!("negative frame length {len}")))?;
    if len > max_len {
        return Err(ProtocolError::OversizedMessage(len));
    }

    let total = LENGTH_PREFIX + len;
    if buf.len() < total {
        buf.reserve(total - buf.len());
        return Ok(None);
    }

    let message = buf.split_to(total);
    let mut reader = WireReader::new(&message[LENGTH_PREFIX..], types);
    let envelope = read_envelope(&mut reader)?;
    if reader.remaining() != 0 {
        return Err(ProtocolError::Malformed(constants::ERR_TRAILING_BYTES.to_string()));
    }
    Ok(Some(envelope))
}
