//! # Protocol Engine
//!
//! Socket-independent protocol logic applied to a [`Connection`]: opening and
//! negotiation, stamping outgoing envelopes, handling received system messages,
//! timers, certification retries and teardown.
//!
//! The reactor owns the sockets and calls into the engine with the connection
//! locked; the engine only mutates connection state and queues lifecycle
//! events for the listeners.

use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info, warn};

use crate::config::NetworkConfig;
use crate::core::registry::TypeRegistry;
use crate::error::{ProtocolError, Result};
use crate::protocol::envelope::{Envelope, UniqueIds};
use crate::protocol::message::{
    AckMessage, Capabilities, DisconnectMessage, KeepAliveMessage, KickMessage,
    RegistrationMessage, TimeSyncRequest, TimeSyncResponse,
};
use crate::protocol::negotiation::{ConnectionFilter, NegotiationStrategy};
use crate::transport::connection::{
    CloseReason, Connection, FailureReason, LifecycleEvent, Status,
};
use crate::utils::metrics::Metrics;
use crate::utils::time::{clock_offset, current_time_millis};

/// Protocol state shared by all connections of one reactor
pub struct Engine {
    registry: Arc<TypeRegistry>,
    config: NetworkConfig,
    negotiation: Arc<dyn NegotiationStrategy>,
    filter: Option<Arc<dyn ConnectionFilter>>,
    metrics: Arc<Metrics>,
    unique_ids: UniqueIds,
    session_id: u32,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("registry", &self.registry)
            .field("session_id", &self.session_id)
            .field("filtered", &self.filter.is_some())
            .finish()
    }
}

impl Engine {
    pub fn new(
        registry: Arc<TypeRegistry>,
        config: NetworkConfig,
        negotiation: Arc<dyn NegotiationStrategy>,
        filter: Option<Arc<dyn ConnectionFilter>>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            registry,
            config,
            negotiation,
            filter,
            metrics,
            unique_ids: UniqueIds::new(),
            session_id: rand::random(),
        }
    }

    pub fn registry(&self) -> &TypeRegistry {
        &self.registry
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// Session id announced in our registrations
    pub fn session_id(&self) -> u32 {
        self.session_id
    }

    /// Starts negotiation. The initiating side announces its vocabulary first.
    pub fn open(&self, conn: &mut Connection, initiator: bool, now: Instant) -> Result<()> {
        conn.transition(Status::Negotiating, now)?;
        self.metrics.connection_opened();
        if initiator {
            self.send_registration(conn)?;
        }
        Ok(())
    }

    /// The socket is usable; queues `on_connected`
    pub fn established(&self, conn: &mut Connection, now: Instant) {
        conn.last_received = now;
        conn.last_sent = now;
        conn.events.push_back(LifecycleEvent::Connected);
        info!(connection = conn.id, address = %conn.address, "Connection established");
    }

    fn send_registration(&self, conn: &mut Connection) -> Result<()> {
        let registration = self.negotiation.registration(&self.registry, self.session_id);
        conn.types.announce(registration.ids.iter().copied());
        conn.registration_sent = true;
        conn.outgoing.offer(Envelope::of(registration))?;
        Ok(())
    }

    /// Stamps `envelope` and queues it for sending; returns its unique id
    pub fn enqueue(&self, conn: &mut Connection, mut envelope: Envelope) -> Result<u32> {
        if matches!(conn.status(), Status::Disconnecting | Status::Disconnected) {
            return Err(ProtocolError::ConnectionClosed);
        }

        let caps = envelope.capabilities();
        if caps.has_unique_id() && envelope.unique_id == 0 {
            envelope.unique_id = self.unique_ids.next_id();
        }
        if caps.contains(Capabilities::TIMESTAMPED) && envelope.timestamp == 0 {
            envelope.timestamp = current_time_millis();
        }
        if caps.contains(Capabilities::CERTIFIED) && envelope.max_tries == 0 {
            envelope.max_tries = self.config.reliability.max_tries;
        }
        if caps.contains(Capabilities::ORDERED) {
            conn.sequencer.assign(&mut envelope);
        }
        envelope.connection = Some(conn.id);

        let unique_id = envelope.unique_id;
        if let Some(superseded) = conn.outgoing.offer(envelope)? {
            self.displaced(conn, superseded);
        }
        Ok(unique_id)
    }

    /// Queues a disconnect notice and enters `Disconnecting`
    pub fn disconnect(&self, conn: &mut Connection, reason: CloseReason, now: Instant) -> bool {
        if !conn.begin_disconnect(reason, now) {
            return false;
        }
        info!(connection = conn.id, %reason, "Disconnecting");
        self.queue_system(conn, Envelope::of(DisconnectMessage));
        true
    }

    /// Sends `reason` to the peer and disconnects with [`CloseReason::ClosedByServer`]
    pub fn kick(&self, conn: &mut Connection, reason: &str, now: Instant) -> bool {
        if !conn.begin_disconnect(CloseReason::ClosedByServer, now) {
            return false;
        }
        info!(connection = conn.id, reason, "Kicking connection");
        self.queue_system(
            conn,
            Envelope::of(KickMessage {
                reason: reason.to_string(),
            }),
        );
        true
    }

    /// Asks the peer for its clock
    pub fn request_time(&self, conn: &mut Connection) -> Result<()> {
        if conn.status() != Status::Connected {
            return Err(ProtocolError::ConnectionClosed);
        }
        conn.outgoing.offer(Envelope::of(TimeSyncRequest {
            client_time: current_time_millis(),
        }))?;
        Ok(())
    }

    /// Closes at once: undelivered messages fail and the status becomes terminal
    pub fn close(&self, conn: &mut Connection, reason: CloseReason, now: Instant) {
        match conn.status() {
            Status::NotConnected | Status::Disconnected => return,
            Status::Disconnecting => {}
            Status::Negotiating | Status::Connected => {
                conn.begin_disconnect(reason, now);
            }
        }
        conn.fail_undelivered();
        self.finish(conn, now);
    }

    fn finish(&self, conn: &mut Connection, now: Instant) {
        if conn.transition(Status::Disconnected, now).is_err() {
            return;
        }
        let reason = conn.close_reason().unwrap_or(CloseReason::ClosedByUser);
        self.metrics.connection_closed(!reason.is_graceful());
        if reason.is_graceful() {
            info!(connection = conn.id, %reason, "Connection closed");
        } else {
            warn!(connection = conn.id, %reason, "Connection closed");
        }
        conn.events.push_back(LifecycleEvent::Disconnected(reason));
    }

    /// The peer closed its side of the channel
    pub fn end_of_stream(&self, conn: &mut Connection, now: Instant) {
        if conn.status() == Status::Disconnecting {
            conn.fail_undelivered();
            self.finish(conn, now);
        } else {
            self.close(conn, CloseReason::ChannelReadError, now);
        }
    }

    /// Handles one decoded envelope
    pub fn receive(&self, conn: &mut Connection, envelope: Envelope, now: Instant) {
        if conn.status() == Status::Disconnected {
            return;
        }
        conn.last_received = now;
        self.metrics.message_received();

        let payload = &envelope.payload;
        if let Some(registration) = payload.downcast_ref::<RegistrationMessage>() {
            self.on_registration(conn, registration, now);
        } else if payload.is::<DisconnectMessage>() {
            if conn.begin_disconnect(CloseReason::ClosedByRemote, now) {
                info!(connection = conn.id, "Peer disconnected");
            }
        } else if let Some(kick) = payload.downcast_ref::<KickMessage>() {
            warn!(connection = conn.id, reason = %kick.reason, "Kicked by peer");
            conn.kick_reason = Some(kick.reason.clone());
            conn.events.push_back(LifecycleEvent::Kicked(kick.reason.clone()));
            self.close(conn, CloseReason::Kicked, now);
        } else if payload.is::<KeepAliveMessage>() {
            debug!(connection = conn.id, "Keep-alive received");
        } else if let Some(ack) = payload.downcast_ref::<AckMessage>() {
            match conn.certifiable.acknowledge(ack.unique_id) {
                Some(certified) => conn.certified.push_back(certified),
                None => debug!(connection = conn.id, unique_id = ack.unique_id, "Acknowledgement for unknown message"),
            }
        } else if let Some(request) = payload.downcast_ref::<TimeSyncRequest>() {
            let response = TimeSyncResponse {
                client_time: request.client_time,
                server_time: current_time_millis(),
            };
            self.queue_system(conn, Envelope::of(response));
        } else if let Some(response) = payload.downcast_ref::<TimeSyncResponse>() {
            let offset = clock_offset(response.client_time, response.server_time, current_time_millis());
            debug!(connection = conn.id, offset_ms = offset, "Clock sample");
            conn.record_clock_sample(offset);
        } else {
            self.receive_payload(conn, envelope);
        }
    }

    fn receive_payload(&self, conn: &mut Connection, envelope: Envelope) {
        if !conn.status().allows_payload() {
            warn!(
                connection = conn.id,
                type_name = envelope.payload.type_name(),
                status = %conn.status(),
                "Dropping message received before negotiation"
            );
            self.metrics.protocol_error();
            return;
        }

        let certified = envelope.is_certified();
        let unique_id = envelope.unique_id;
        if certified && conn.seen.contains(unique_id) {
            // The first acknowledgement may have been lost
            debug!(connection = conn.id, unique_id, "Duplicate dropped");
            self.metrics.duplicate();
            self.queue_system(conn, Envelope::of(AckMessage { unique_id }));
            return;
        }

        let type_name = envelope.payload.type_name();
        // Realtime hands back the envelope it superseded, anything else hands back itself
        let realtime = envelope.capabilities().contains(Capabilities::REALTIME);
        match conn.incoming.offer(envelope) {
            // Stale, so it stays unacknowledged
            Ok(Some(rejected)) if !realtime => {
                debug!(connection = conn.id, type_name, sequence = rejected.sequence, "Stale ordered message dropped");
            }
            Ok(_) => {
                if certified {
                    conn.seen.insert(unique_id);
                    self.queue_system(conn, Envelope::of(AckMessage { unique_id }));
                }
            }
            // Unacknowledged, so the sender retries
            Err(e) => warn!(connection = conn.id, type_name, error = %e, "Incoming queue full, dropping message"),
        }
    }

    fn on_registration(&self, conn: &mut Connection, registration: &RegistrationMessage, now: Instant) {
        if conn.status() != Status::Negotiating {
            debug!(connection = conn.id, status = %conn.status(), "Ignoring repeated registration");
            return;
        }
        conn.remote_session_id = Some(registration.session_id);

        if let Err(e) = self
            .negotiation
            .resolve(&self.registry, registration, &mut conn.types)
        {
            warn!(connection = conn.id, error = %e, "Negotiation failed");
            self.metrics.protocol_error();
            self.close(conn, CloseReason::BadMessage, now);
            return;
        }

        if let Some(filter) = &self.filter {
            if let Some(reason) = filter.filter(&conn.info()) {
                info!(connection = conn.id, %reason, "Connection rejected by filter");
                self.kick(conn, &reason, now);
                conn.override_close_reason(CloseReason::Filtered);
                return;
            }
        }

        if !conn.registration_sent {
            if let Err(e) = self.send_registration(conn) {
                warn!(connection = conn.id, error = %e, "Failed to queue registration");
                self.close(conn, CloseReason::BadMessage, now);
                return;
            }
        }

        if conn.transition(Status::Connected, now).is_ok() {
            self.metrics.negotiated();
            conn.events.push_back(LifecycleEvent::Negotiated);
            info!(
                connection = conn.id,
                remote_session = registration.session_id,
                remote_types = conn.types.remote_len(),
                "Negotiation complete"
            );
        }
    }

    /// Runs the timers of one connection
    pub fn tick(&self, conn: &mut Connection, now: Instant) {
        let transport = &self.config.transport;
        let in_status = now.saturating_duration_since(conn.status_since());

        match conn.status() {
            Status::Negotiating if in_status >= transport.sub_timeout() => {
                self.close(conn, CloseReason::NegotiationTimeout, now);
                return;
            }
            Status::Connected => {
                if now.saturating_duration_since(conn.last_received) >= transport.timeout {
                    self.close(conn, CloseReason::ReadTimeout, now);
                    return;
                }
                if now.saturating_duration_since(conn.last_sent) >= transport.keep_alive_after()
                    && conn.outgoing.is_empty()
                    && conn.pending_write.is_none()
                {
                    debug!(connection = conn.id, "Sending keep-alive");
                    self.queue_system(conn, Envelope::of(KeepAliveMessage));
                }
            }
            _ => {}
        }

        self.expire_certifications(conn, now);

        if conn.status() == Status::Disconnecting {
            if in_status >= transport.sub_timeout() {
                conn.override_close_reason(CloseReason::DisconnectTimeout);
                self.close(conn, CloseReason::DisconnectTimeout, now);
            } else if conn.is_flushed() && !conn.linger {
                self.finish(conn, now);
            }
        }
    }

    /// Retransmits or fails certified messages whose acknowledgement is overdue
    pub fn expire_certifications(&self, conn: &mut Connection, now: Instant) {
        let reliability = &self.config.reliability;
        for pending in conn
            .certifiable
            .take_expired(now, reliability.certification_timeout)
        {
            let envelope = pending.envelope;
            let max_tries = if envelope.max_tries == 0 {
                reliability.max_tries
            } else {
                envelope.max_tries
            };

            if envelope.tries < max_tries && conn.status().allows_payload() {
                debug!(
                    connection = conn.id,
                    unique_id = envelope.unique_id,
                    tries = envelope.tries,
                    "Retransmitting certified message"
                );
                match conn.outgoing.retry(envelope.clone()) {
                    Ok(None) => self.metrics.retransmitted(),
                    Ok(Some(superseded)) => self.displaced(conn, superseded),
                    Err(e) => {
                        warn!(connection = conn.id, unique_id = envelope.unique_id, error = %e, "Retransmission not queued");
                        conn.failed
                            .push_back((envelope, FailureReason::CertificationExpired));
                    }
                }
            } else {
                warn!(
                    connection = conn.id,
                    unique_id = envelope.unique_id,
                    tries = envelope.tries,
                    "Certification expired"
                );
                conn.failed
                    .push_back((envelope, FailureReason::CertificationExpired));
            }
        }
    }

    /// Records fully written envelopes for `on_sent`
    pub fn flushed(&self, conn: &mut Connection, envelopes: Vec<Envelope>, now: Instant) {
        if envelopes.is_empty() {
            return;
        }
        conn.last_sent = now;
        conn.outgoing_dispatch
            .extend(envelopes.into_iter().filter(|envelope| !envelope.is_system()));
    }

    /// Reports a certified envelope that lost its realtime slot to a newer one
    fn displaced(&self, conn: &mut Connection, envelope: Envelope) {
        if envelope.is_certified() {
            debug!(connection = conn.id, unique_id = envelope.unique_id, "Certified message superseded");
            conn.failed.push_back((envelope, FailureReason::Superseded));
        }
    }

    fn queue_system(&self, conn: &mut Connection, envelope: Envelope) {
        let type_name = envelope.payload.type_name();
        if let Err(e) = conn.outgoing.offer(envelope) {
            warn!(connection = conn.id, type_name, error = %e, "Failed to queue system message");
        }
    }
}
