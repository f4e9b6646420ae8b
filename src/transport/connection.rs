//! # Connection State Machine
//!
//! Per-peer state: lifecycle status, negotiated type table, the six queues and
//! the read/write cursors.
//!
//! ```text
//! NotConnected ──► Negotiating ──► Connected
//!                       │              │
//!                       └──► Disconnecting ◄┘
//!                                  │
//!                                  ▼
//!                            Disconnected
//! ```
//!
//! A connection leaves `Disconnecting` once everything it holds is drained, or
//! when the disconnect timeout forces it. Only a `Disconnected` connection with
//! empty queues may be dropped by the reactor.

use std::collections::VecDeque;
use std::fmt;
use std::net::SocketAddr;
use std::time::Instant;

use bytes::BytesMut;
use tracing::debug;

use crate::config::NetworkConfig;
use crate::core::registry::NegotiatedTypes;
use crate::error::{ProtocolError, Result};
use crate::protocol::envelope::{ConnectionId, Envelope};
use crate::queue::{CertifiableQueue, MultiQueue, Sequencer};
use crate::transport::framer::Frame;
use crate::utils::dedup::DedupCache;

/// Lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    NotConnected,
    Negotiating,
    Connected,
    Disconnecting,
    Disconnected,
}

impl Status {
    pub fn name(self) -> &'static str {
        match self {
            Status::NotConnected => "NotConnected",
            Status::Negotiating => "Negotiating",
            Status::Connected => "Connected",
            Status::Disconnecting => "Disconnecting",
            Status::Disconnected => "Disconnected",
        }
    }

    /// Whether application messages may be written
    pub fn allows_payload(self) -> bool {
        matches!(self, Status::Connected | Status::Disconnecting)
    }

    fn can_move_to(self, to: Status) -> bool {
        matches!(
            (self, to),
            (Status::NotConnected, Status::Negotiating)
                | (Status::Negotiating, Status::Connected)
                | (Status::Negotiating, Status::Disconnecting)
                | (Status::Connected, Status::Disconnecting)
                | (Status::Disconnecting, Status::Disconnected)
        )
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Why a connection closed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CloseReason {
    ClosedByUser,
    ClosedByServer,
    ClosedByRemote,
    Kicked,
    ChannelReadError,
    ChannelWriteError,
    ChannelConnectError,
    BadMessage,
    Filtered,
    ReadTimeout,
    NegotiationTimeout,
    DisconnectTimeout,
    Shutdown,
}

impl CloseReason {
    /// Initiated by one of the parties rather than caused by a fault
    pub const fn is_graceful(self) -> bool {
        matches!(
            self,
            CloseReason::ClosedByUser
                | CloseReason::ClosedByServer
                | CloseReason::ClosedByRemote
                | CloseReason::Kicked
                | CloseReason::Shutdown
        )
    }

    /// The socket can no longer carry a disconnect notice
    pub const fn is_channel_fault(self) -> bool {
        matches!(
            self,
            CloseReason::ChannelReadError
                | CloseReason::ChannelWriteError
                | CloseReason::ChannelConnectError
        )
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            CloseReason::ClosedByUser => "closed by user",
            CloseReason::ClosedByServer => "closed by server",
            CloseReason::ClosedByRemote => "closed by remote",
            CloseReason::Kicked => "kicked",
            CloseReason::ChannelReadError => "channel read error",
            CloseReason::ChannelWriteError => "channel write error",
            CloseReason::ChannelConnectError => "channel connect error",
            CloseReason::BadMessage => "bad message",
            CloseReason::Filtered => "filtered",
            CloseReason::ReadTimeout => "read timeout",
            CloseReason::NegotiationTimeout => "negotiation timeout",
            CloseReason::DisconnectTimeout => "disconnect timeout",
            CloseReason::Shutdown => "shutdown",
        };
        f.write_str(text)
    }
}

/// Why a message will never be delivered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureReason {
    /// Larger than an empty frame buffer
    TooLarge,
    /// The message could not be encoded
    Unencodable,
    /// Not acknowledged after the last try
    CertificationExpired,
    /// The connection closed before delivery
    ConnectionClosed,
    /// Replaced by a newer message for the same realtime slot
    Superseded,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            FailureReason::TooLarge => "too large",
            FailureReason::Unencodable => "unencodable",
            FailureReason::CertificationExpired => "certification expired",
            FailureReason::ConnectionClosed => "connection closed",
            FailureReason::Superseded => "superseded",
        };
        f.write_str(text)
    }
}

/// Lifecycle notifications queued for the connection listeners
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    Connected,
    Negotiated,
    Kicked(String),
    Disconnected(CloseReason),
}

/// Read-only view of a connection handed to filters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub id: ConnectionId,
    pub address: SocketAddr,
    pub status: Status,
    pub close_reason: Option<CloseReason>,
    /// Session id the peer announced in its registration
    pub remote_session_id: Option<u32>,
}

impl ConnectionInfo {
    /// Info for a connection that is not attached to a reactor
    pub fn detached(id: ConnectionId, address: SocketAddr) -> Self {
        Self {
            id,
            address,
            status: Status::NotConnected,
            close_reason: None,
            remote_session_id: None,
        }
    }
}

/// State of one peer
#[derive(Debug)]
pub struct Connection {
    pub id: ConnectionId,
    pub address: SocketAddr,
    status: Status,
    status_since: Instant,
    close_reason: Option<CloseReason>,
    /// Set by every status change or clock sample until taken by the reactor
    changed: bool,

    pub types: NegotiatedTypes,
    pub registration_sent: bool,
    pub remote_session_id: Option<u32>,

    pub last_sent: Instant,
    pub last_received: Instant,

    pub outgoing: MultiQueue,
    pub incoming: MultiQueue,
    /// Fully flushed envelopes awaiting `on_sent`
    pub outgoing_dispatch: VecDeque<Envelope>,
    pub certifiable: CertifiableQueue,
    pub certified: VecDeque<Envelope>,
    pub failed: VecDeque<(Envelope, FailureReason)>,
    pub sequencer: Sequencer,
    pub seen: DedupCache,

    /// Stay in `Disconnecting` after flushing until the peer closes its side
    pub linger: bool,
    pub read_buffer: BytesMut,
    pub pending_write: Option<Frame>,
    pub overhang: Option<Envelope>,

    pub events: VecDeque<LifecycleEvent>,
    pub kick_reason: Option<String>,
    /// Estimated remote clock minus local clock, in milliseconds
    pub clock_offset: Option<i64>,
    /// Number of completed clock samples
    pub clock_samples: u64,
}

impl Connection {
    pub fn new(id: ConnectionId, address: SocketAddr, config: &NetworkConfig, now: Instant) -> Self {
        let reliability = &config.reliability;
        Self {
            id,
            address,
            status: Status::NotConnected,
            status_since: now,
            close_reason: None,
            changed: false,
            types: NegotiatedTypes::new(),
            registration_sent: false,
            remote_session_id: None,
            last_sent: now,
            last_received: now,
            outgoing: MultiQueue::sending(reliability.queue_capacity),
            incoming: MultiQueue::new(reliability.queue_capacity),
            outgoing_dispatch: VecDeque::new(),
            certifiable: CertifiableQueue::new(),
            certified: VecDeque::new(),
            failed: VecDeque::new(),
            sequencer: Sequencer::new(),
            seen: DedupCache::with_settings(reliability.dedup_ttl, reliability.dedup_capacity),
            linger: false,
            read_buffer: BytesMut::with_capacity(config.buffers.receive_buffer_size),
            pending_write: None,
            overhang: None,
            events: VecDeque::new(),
            kick_reason: None,
            clock_offset: None,
            clock_samples: 0,
        }
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn status_since(&self) -> Instant {
        self.status_since
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        self.close_reason
    }

    /// Moves along a legal edge or fails with [`ProtocolError::InvalidTransition`]
    pub fn transition(&mut self, to: Status, now: Instant) -> Result<()> {
        if !self.status.can_move_to(to) {
            return Err(ProtocolError::InvalidTransition {
                from: self.status.name(),
                to: to.name(),
            });
        }
        debug!(connection = self.id, from = %self.status, %to, "Status change");
        self.status = to;
        self.status_since = now;
        self.changed = true;
        Ok(())
    }

    /// Enters `Disconnecting` with `reason`.
    ///
    /// Returns `false` when the connection is not open, in which case the
    /// first close reason is kept.
    pub fn begin_disconnect(&mut self, reason: CloseReason, now: Instant) -> bool {
        if !matches!(self.status, Status::Negotiating | Status::Connected) {
            return false;
        }
        self.close_reason = Some(reason);
        self.transition(Status::Disconnecting, now).is_ok()
    }

    /// Replaces the close reason of a connection that is already closing
    pub fn override_close_reason(&mut self, reason: CloseReason) {
        if self.status == Status::Disconnecting {
            self.close_reason = Some(reason);
        }
    }

    /// Moves every undelivered envelope to the failed queue
    pub fn fail_undelivered(&mut self) {
        let mut undelivered = Vec::new();
        if let Some(frame) = self.pending_write.take() {
            undelivered.extend(frame.into_unflushed());
        }
        undelivered.extend(self.overhang.take());
        undelivered.extend(self.outgoing.drain());
        undelivered.extend(self.certifiable.drain().map(|pending| pending.envelope));

        self.failed.extend(
            undelivered
                .into_iter()
                .filter(|envelope| !envelope.is_system())
                .map(|envelope| (envelope, FailureReason::ConnectionClosed)),
        );
    }

    /// Nothing left to write, acknowledge or report
    pub fn is_drained(&self) -> bool {
        self.outgoing.is_empty()
            && self.incoming.is_empty()
            && self.outgoing_dispatch.is_empty()
            && self.certifiable.is_empty()
            && self.certified.is_empty()
            && self.failed.is_empty()
            && self.events.is_empty()
            && self.pending_write.is_none()
            && self.overhang.is_none()
    }

    /// Nothing left on the sending side
    pub fn is_flushed(&self) -> bool {
        self.outgoing.is_empty()
            && self.certifiable.is_empty()
            && self.pending_write.is_none()
            && self.overhang.is_none()
    }

    /// Returns and clears the change marker
    pub fn take_changed(&mut self) -> bool {
        std::mem::take(&mut self.changed)
    }

    pub fn record_clock_sample(&mut self, offset: i64) {
        self.clock_offset = Some(offset);
        self.clock_samples += 1;
        self.changed = true;
    }

    pub fn info(&self) -> ConnectionInfo {
        ConnectionInfo {
            id: self.id,
            address: self.address,
            status: self.status,
            close_reason: self.close_reason,
            remote_session_id: self.remote_session_id,
        }
    }
}
