//! Sans-I/O connection state machine.
//!
//! [`Connection`] owns all protocol state for one client: the connection
//! state, the in-flight tracker, keep-alive bookkeeping and the reconnect
//! schedule. It performs no I/O and never reads the clock. The driver feeds
//! it inbound bytes, transport notifications and timer ticks, each stamped
//! with the current [`Instant`], and collects:
//! - bytes to write ([`take_outgoing`](Connection::take_outgoing))
//! - events for the application ([`next_event`](Connection::next_event))
//! - when to tick next ([`next_deadline`](Connection::next_deadline))
//! - whether to open ([`wants_transport`](Connection::wants_transport)) or
//!   close ([`should_close_transport`](Connection::should_close_transport))
//!   the transport

use std::collections::VecDeque;
use std::io;
use std::time::{Duration, Instant};

use bytes::{Buf, Bytes, BytesMut};
use log::{debug, error, info, warn};
use qmqtt_core::{
    decode, encode, Connack, ConnackCode, Connect, Packet, ProtocolError, Publish, QoS, Subscribe,
    Unsubscribe,
};

use crate::config::ClientConfig;
use crate::error::{ClientError, Result};
use crate::events::{ConnectionState, DisconnectReason, Event};
use crate::inflight::{Inbound, InflightTracker};
use crate::reconnect;

/// Protocol state for a single client connection.
#[derive(Debug)]
pub struct Connection {
    config: ClientConfig,
    state: ConnectionState,
    tracker: InflightTracker,
    read_buf: BytesMut,
    outgoing: Vec<u8>,
    events: VecDeque<Event>,
    /// A connection attempt should start as soon as a transport is open.
    connect_requested: bool,
    /// Why the connection is closing while in `Disconnecting`.
    closing: Option<DisconnectReason>,
    connack_deadline: Option<Instant>,
    keepalive_check: Option<Instant>,
    last_sent: Option<Instant>,
    last_received: Option<Instant>,
    ping_sent: Option<Instant>,
    reconnect_at: Option<Instant>,
    /// Consecutive reconnect attempts since the last accepted CONNACK.
    attempts: u32,
}

impl Connection {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            state: ConnectionState::Disconnected,
            tracker: InflightTracker::new(),
            read_buf: BytesMut::with_capacity(4096),
            outgoing: Vec::with_capacity(4096),
            events: VecDeque::new(),
            connect_requested: false,
            closing: None,
            connack_deadline: None,
            keepalive_check: None,
            last_sent: None,
            last_received: None,
            ping_sent: None,
            reconnect_at: None,
            attempts: 0,
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    /// Outbound QoS 1/2 messages not yet fully acknowledged.
    pub fn pending_count(&self) -> usize {
        self.tracker.pending_count()
    }

    /// Subscriptions granted by the broker.
    pub fn active_subscriptions(&self) -> Vec<(String, QoS)> {
        self.tracker.active_subscriptions()
    }

    // === Driver inputs ===

    /// Ask for a connection. The driver opens a transport once
    /// [`wants_transport`](Self::wants_transport) reports it, then calls
    /// [`connect`](Self::connect).
    ///
    /// A pending reconnect delay is skipped.
    pub fn request_connect(&mut self) -> Result<()> {
        match self.state {
            ConnectionState::Disconnected => {
                self.connect_requested = true;
                self.reconnect_at = None;
                self.attempts = 0;
                Ok(())
            }
            ConnectionState::Connecting | ConnectionState::Connected => {
                Err(ClientError::InvalidState("already connected".to_string()))
            }
            ConnectionState::Disconnecting => Err(ClientError::InvalidState(
                "disconnect in progress".to_string(),
            )),
        }
    }

    /// A fresh transport is open: send CONNECT and wait for CONNACK.
    pub fn connect(&mut self, now: Instant) -> Result<()> {
        if self.state != ConnectionState::Disconnected {
            return Err(ClientError::InvalidState(format!(
                "cannot connect while {:?}",
                self.state
            )));
        }
        self.connect_requested = false;
        self.reconnect_at = None;
        self.read_buf.clear();
        self.outgoing.clear();
        if self.config.clean_session {
            self.tracker.clear_inbound();
        }

        info!(
            "Connecting to {} as {:?}",
            self.config.address, self.config.client_id
        );
        self.state = ConnectionState::Connecting;
        self.connack_deadline = Some(now + self.config.connack_timeout);
        self.last_received = Some(now);

        let packet = Packet::Connect(self.connect_packet());
        if let Err(e) = encode(&packet, &mut self.outgoing) {
            error!("Cannot encode CONNECT: {}", e);
            let reason = DisconnectReason::Protocol(format!("invalid CONNECT: {}", e));
            self.events.push_back(Event::Error(ClientError::Encoding(e)));
            self.begin_close(reason);
            return Ok(());
        }
        debug!("Sent CONNECT");
        self.last_sent = Some(now);
        Ok(())
    }

    /// Bytes read from the transport.
    pub fn handle_incoming(&mut self, data: &[u8], now: Instant) {
        if !self.is_live() {
            return;
        }
        self.read_buf.extend_from_slice(data);

        while self.is_live() {
            match decode(&self.read_buf) {
                Ok(Some((packet, consumed))) => {
                    self.read_buf.advance(consumed);
                    self.last_received = Some(now);
                    debug!("Received {:?}", packet.packet_type());
                    self.dispatch(packet, now);
                }
                Ok(None) => break,
                Err(e) => {
                    self.protocol_violation(e);
                    break;
                }
            }
        }
    }

    /// Timer tick. Checks the CONNACK timeout, keep-alive and the reconnect
    /// schedule against `now`.
    pub fn handle_tick(&mut self, now: Instant) {
        match self.state {
            ConnectionState::Connecting => {
                if self.connack_deadline.is_some_and(|deadline| now >= deadline) {
                    warn!(
                        "No CONNACK within {:?}",
                        self.config.connack_timeout
                    );
                    self.events.push_back(Event::Error(ClientError::ConnectTimeout));
                    self.begin_close(DisconnectReason::ConnectTimeout);
                }
            }
            ConnectionState::Connected => self.check_keepalive(now),
            ConnectionState::Disconnected => {
                if self.reconnect_at.is_some_and(|at| now >= at) {
                    debug!("Reconnect attempt {} due", self.attempts);
                    self.reconnect_at = None;
                    self.connect_requested = true;
                }
            }
            ConnectionState::Disconnecting => {}
        }
    }

    /// The transport reached end of stream, or the driver closed it.
    pub fn transport_closed(&mut self, now: Instant) {
        match self.state {
            ConnectionState::Disconnecting => {
                let reason = self
                    .closing
                    .take()
                    .unwrap_or(DisconnectReason::ConnectionLost);
                self.finish(reason, now);
            }
            ConnectionState::Connecting | ConnectionState::Connected => {
                self.events
                    .push_back(Event::Error(ClientError::ConnectionLost));
                self.lost(now);
            }
            ConnectionState::Disconnected => {}
        }
    }

    /// The transport failed to open, read or write.
    pub fn transport_error(&mut self, err: io::Error, now: Instant) {
        warn!("Transport error: {}", err);
        self.events.push_back(Event::Error(ClientError::Io(err)));
        if self.state == ConnectionState::Disconnected {
            if self.connect_requested {
                self.connect_requested = false;
                self.finish(DisconnectReason::ConnectionLost, now);
            }
        } else if self.state == ConnectionState::Disconnecting {
            self.transport_closed(now);
        } else {
            self.lost(now);
        }
    }

    // === Application commands ===

    /// Queue a PUBLISH. Returns the packet identifier for QoS 1 and 2.
    pub fn publish(
        &mut self,
        topic: impl Into<String>,
        payload: impl Into<Bytes>,
        qos: QoS,
        retain: bool,
        now: Instant,
    ) -> Result<Option<u16>> {
        self.ensure_connected()?;
        let packet_id = match qos {
            QoS::AtMostOnce => None,
            _ => Some(
                self.tracker
                    .allocate_id()
                    .ok_or(ClientError::IdentifiersExhausted)?,
            ),
        };
        let publish = Publish {
            dup: false,
            qos,
            retain,
            topic: topic.into(),
            packet_id,
            payload: payload.into(),
        };

        if let Err(e) = encode(&Packet::Publish(publish.clone()), &mut self.outgoing) {
            if let Some(id) = packet_id {
                self.tracker.release_id(id);
            }
            return Err(e.into());
        }
        debug!("Sent PUBLISH to {} ({:?}, id {:?})", publish.topic, qos, packet_id);
        self.last_sent = Some(now);
        self.tracker.track_publish(publish, now);
        Ok(packet_id)
    }

    /// Queue a SUBSCRIBE for one filter.
    pub fn subscribe(&mut self, filter: impl Into<String>, qos: QoS, now: Instant) -> Result<u16> {
        self.ensure_connected()?;
        let packet_id = self
            .tracker
            .allocate_id()
            .ok_or(ClientError::IdentifiersExhausted)?;
        let filters = vec![(filter.into(), qos)];
        let packet = Packet::Subscribe(Subscribe {
            packet_id,
            filters: filters.clone(),
        });
        if let Err(e) = encode(&packet, &mut self.outgoing) {
            self.tracker.release_id(packet_id);
            return Err(e.into());
        }
        debug!("Sent SUBSCRIBE {}", packet_id);
        self.last_sent = Some(now);
        self.tracker.track_subscribe(packet_id, filters);
        Ok(packet_id)
    }

    /// Queue an UNSUBSCRIBE for one filter.
    pub fn unsubscribe(&mut self, filter: impl Into<String>, now: Instant) -> Result<u16> {
        self.ensure_connected()?;
        let packet_id = self
            .tracker
            .allocate_id()
            .ok_or(ClientError::IdentifiersExhausted)?;
        let filters = vec![filter.into()];
        let packet = Packet::Unsubscribe(Unsubscribe {
            packet_id,
            filters: filters.clone(),
        });
        if let Err(e) = encode(&packet, &mut self.outgoing) {
            self.tracker.release_id(packet_id);
            return Err(e.into());
        }
        debug!("Sent UNSUBSCRIBE {}", packet_id);
        self.last_sent = Some(now);
        self.tracker.track_unsubscribe(packet_id, filters);
        Ok(packet_id)
    }

    /// Close the connection on request. Safe in any state: a pending
    /// reconnect is cancelled and no further attempts are made.
    pub fn disconnect(&mut self, now: Instant) {
        match self.state {
            ConnectionState::Connected => {
                info!("Disconnecting from {}", self.config.address);
                self.send(&Packet::Disconnect, now);
                self.begin_close(DisconnectReason::Requested);
            }
            ConnectionState::Connecting => {
                self.begin_close(DisconnectReason::Requested);
            }
            ConnectionState::Disconnecting => {
                if matches!(
                    self.closing,
                    Some(DisconnectReason::ConnectionLost | DisconnectReason::ConnectTimeout)
                ) {
                    self.closing = Some(DisconnectReason::Requested);
                }
            }
            ConnectionState::Disconnected => {
                let was_pending = self.connect_requested || self.reconnect_at.is_some();
                self.connect_requested = false;
                self.reconnect_at = None;
                self.attempts = 0;
                if was_pending {
                    self.events.push_back(Event::Disconnected {
                        reason: DisconnectReason::Requested,
                    });
                }
                self.settle_session();
            }
        }
    }

    // === Driver outputs ===

    /// Take every byte queued for the transport.
    pub fn take_outgoing(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.outgoing)
    }

    pub fn has_outgoing(&self) -> bool {
        !self.outgoing.is_empty()
    }

    pub fn next_event(&mut self) -> Option<Event> {
        self.events.pop_front()
    }

    /// When [`handle_tick`](Self::handle_tick) should next run.
    pub fn next_deadline(&self) -> Option<Instant> {
        match self.state {
            ConnectionState::Connecting => self.connack_deadline,
            ConnectionState::Connected => self.keepalive_check,
            ConnectionState::Disconnected => self.reconnect_at,
            ConnectionState::Disconnecting => None,
        }
    }

    /// A transport should be opened and handed to [`connect`](Self::connect).
    pub fn wants_transport(&self) -> bool {
        self.state == ConnectionState::Disconnected && self.connect_requested
    }

    /// The transport should be closed once queued bytes are flushed,
    /// followed by [`transport_closed`](Self::transport_closed).
    pub fn should_close_transport(&self) -> bool {
        self.state == ConnectionState::Disconnecting
    }

    // === Internals ===

    fn is_live(&self) -> bool {
        matches!(
            self.state,
            ConnectionState::Connecting | ConnectionState::Connected
        )
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.state == ConnectionState::Connected {
            Ok(())
        } else {
            Err(ClientError::NotConnected)
        }
    }

    fn connect_packet(&self) -> Connect {
        Connect {
            clean_session: self.config.clean_session,
            keep_alive: self.config.keep_alive,
            client_id: self.config.client_id.clone(),
            will: self.config.will.clone(),
            username: self.config.username.clone(),
            password: self.config.password.clone().map(Bytes::from),
        }
    }

    /// Queue a packet built by the client itself.
    fn send(&mut self, packet: &Packet, now: Instant) {
        match encode(packet, &mut self.outgoing) {
            Ok(()) => {
                debug!("Sent {:?}", packet.packet_type());
                self.last_sent = Some(now);
            }
            Err(e) => error!("Failed to encode {:?}: {}", packet.packet_type(), e),
        }
    }

    fn dispatch(&mut self, packet: Packet, now: Instant) {
        match (self.state, packet) {
            (ConnectionState::Connecting, Packet::Connack(connack)) => {
                self.on_connack(connack, now)
            }
            (ConnectionState::Connecting, other) => {
                self.protocol_violation(ProtocolError::UnexpectedPacket(format!(
                    "{:?} before CONNACK",
                    other.packet_type()
                )))
            }
            (ConnectionState::Connected, Packet::Publish(publish)) => self.on_publish(publish, now),
            (ConnectionState::Connected, Packet::Puback { packet_id }) => {
                if let Some(done) = self.tracker.on_puback(packet_id) {
                    self.events.push_back(Event::Published {
                        packet_id: done.packet_id,
                    });
                }
            }
            (ConnectionState::Connected, Packet::Pubrec { packet_id }) => {
                if self.tracker.on_pubrec(packet_id, now) {
                    self.send(&Packet::Pubrel { packet_id }, now);
                }
            }
            (ConnectionState::Connected, Packet::Pubcomp { packet_id }) => {
                if let Some(done) = self.tracker.on_pubcomp(packet_id) {
                    self.events.push_back(Event::Published {
                        packet_id: done.packet_id,
                    });
                }
            }
            (ConnectionState::Connected, Packet::Pubrel { packet_id }) => {
                if let Some(publish) = self.tracker.on_pubrel(packet_id) {
                    self.deliver(publish);
                }
                self.send(&Packet::Pubcomp { packet_id }, now);
            }
            (ConnectionState::Connected, Packet::Suback(suback)) => {
                match self
                    .tracker
                    .on_suback(suback.packet_id, &suback.return_codes)
                {
                    Ok(Some(results)) => {
                        for (topic_filter, granted_qos) in results {
                            if granted_qos.is_none() {
                                warn!("Broker refused subscription to {}", topic_filter);
                            }
                            self.events.push_back(Event::Subscribed {
                                topic_filter,
                                granted_qos,
                            });
                        }
                    }
                    Ok(None) => {}
                    Err(e) => self.protocol_violation(e),
                }
            }
            (ConnectionState::Connected, Packet::Unsuback { packet_id }) => {
                for topic_filter in self.tracker.on_unsuback(packet_id).unwrap_or_default() {
                    self.events.push_back(Event::Unsubscribed { topic_filter });
                }
            }
            (ConnectionState::Connected, Packet::Pingresp) => {
                self.ping_sent = None;
            }
            (ConnectionState::Connected, other) => {
                self.protocol_violation(ProtocolError::UnexpectedPacket(format!(
                    "{:?} from broker",
                    other.packet_type()
                )))
            }
            _ => {}
        }
    }

    fn on_connack(&mut self, connack: Connack, now: Instant) {
        if connack.code != ConnackCode::Accepted {
            warn!("Connection refused: {}", connack.code);
            self.events
                .push_back(Event::Error(ClientError::ConnectionRefused(connack.code)));
            self.begin_close(DisconnectReason::Refused(connack.code));
            return;
        }

        info!(
            "Connected to {} (session present: {})",
            self.config.address, connack.session_present
        );
        self.state = ConnectionState::Connected;
        self.attempts = 0;
        self.connack_deadline = None;
        self.ping_sent = None;
        self.keepalive_check = self.config.keep_alive_interval().map(|ka| now + ka / 2);
        self.events.push_back(Event::Connected {
            session_present: connack.session_present,
        });

        if !connack.session_present {
            self.tracker.clear_inbound();
            self.resubscribe(now);
        }

        if self.tracker.pending_count() > 0 {
            if self.config.clean_session {
                self.cancel_pending();
            } else {
                let packets = self.tracker.resend_packets(now);
                info!("Resending {} unacknowledged packets", packets.len());
                for packet in &packets {
                    self.send(packet, now);
                }
            }
        }
    }

    fn resubscribe(&mut self, now: Instant) {
        let filters = self.tracker.active_subscriptions();
        if filters.is_empty() {
            return;
        }
        let Some(packet_id) = self.tracker.allocate_id() else {
            warn!("No packet identifier free to restore subscriptions");
            return;
        };
        info!("Restoring {} subscriptions", filters.len());
        self.send(
            &Packet::Subscribe(Subscribe {
                packet_id,
                filters: filters.clone(),
            }),
            now,
        );
        self.tracker.track_subscribe(packet_id, filters);
    }

    fn on_publish(&mut self, publish: Publish, now: Instant) {
        let packet_id = publish.packet_id;
        let qos = publish.qos;
        match self.tracker.on_inbound_publish(publish) {
            Inbound::Deliver(publish) => {
                self.deliver(publish);
                if let (QoS::AtLeastOnce, Some(packet_id)) = (qos, packet_id) {
                    self.send(&Packet::Puback { packet_id }, now);
                }
            }
            Inbound::Held | Inbound::Duplicate => {
                if let Some(packet_id) = packet_id {
                    self.send(&Packet::Pubrec { packet_id }, now);
                }
            }
        }
    }

    fn deliver(&mut self, publish: Publish) {
        if !self.tracker.is_subscribed(&publish.topic) {
            debug!("Message on {} matches no active subscription", publish.topic);
        }
        self.events.push_back(Event::MessageReceived {
            topic: publish.topic,
            payload: publish.payload,
            qos: publish.qos,
            retain: publish.retain,
        });
    }

    fn check_keepalive(&mut self, now: Instant) {
        let (Some(ka), Some(check)) = (self.config.keep_alive_interval(), self.keepalive_check)
        else {
            return;
        };
        if now < check {
            return;
        }
        self.keepalive_check = Some(now + ka / 2);

        let since_received = now.saturating_duration_since(self.last_received.unwrap_or(now));
        if self.ping_sent.is_some() {
            if since_received >= ka * 3 / 2 {
                warn!(
                    "No response from {} for {:?}, keep-alive expired",
                    self.config.address, since_received
                );
                self.events
                    .push_back(Event::Error(ClientError::ConnectionLost));
                self.begin_close(DisconnectReason::ConnectionLost);
            }
            return;
        }

        let since_sent = now.saturating_duration_since(self.last_sent.unwrap_or(now));
        if since_sent >= ka || since_received >= ka {
            self.send(&Packet::Pingreq, now);
            self.ping_sent = Some(now);
        }
    }

    fn protocol_violation(&mut self, err: ProtocolError) {
        error!("Protocol violation from {}: {}", self.config.address, err);
        let reason = DisconnectReason::Protocol(err.to_string());
        self.events.push_back(Event::Error(ClientError::Decode(err)));
        self.begin_close(reason);
    }

    /// The open transport failed without a close being requested.
    fn lost(&mut self, now: Instant) {
        warn!("Connection to {} lost", self.config.address);
        self.finish(DisconnectReason::ConnectionLost, now);
    }

    /// Stop processing and wait for the driver to close the transport.
    fn begin_close(&mut self, reason: DisconnectReason) {
        self.state = ConnectionState::Disconnecting;
        self.closing = Some(reason);
        self.connack_deadline = None;
        self.keepalive_check = None;
        self.ping_sent = None;
        self.read_buf.clear();
    }

    /// The transport is gone: report, then either schedule a reconnect or
    /// settle the session.
    fn finish(&mut self, reason: DisconnectReason, now: Instant) {
        let was_open = self.state != ConnectionState::Disconnected;
        self.state = ConnectionState::Disconnected;
        self.closing = None;
        self.connack_deadline = None;
        self.keepalive_check = None;
        self.ping_sent = None;
        self.read_buf.clear();
        self.outgoing.clear();

        let dropped = self.tracker.drop_requests();
        if dropped > 0 {
            debug!("Dropped {} unacknowledged subscription requests", dropped);
        }

        let retryable = reason.is_retryable();
        let policy = &self.config.reconnect;
        let retry = policy.enabled
            && retryable
            && (policy.max_attempts == 0 || self.attempts < policy.max_attempts);

        if was_open || !retry {
            self.events.push_back(Event::Disconnected {
                reason: reason.clone(),
            });
        }

        if retry {
            self.attempts += 1;
            let delay = reconnect::next_delay(&self.config.reconnect, self.attempts);
            info!(
                "Reconnecting to {} in {:?} (attempt {})",
                self.config.address, delay, self.attempts
            );
            self.reconnect_at = Some(now + delay);
            self.events.push_back(Event::Reconnecting {
                attempt: self.attempts,
                delay,
            });
        } else {
            if policy.enabled && retryable {
                warn!(
                    "Giving up on {} after {} reconnect attempts",
                    self.config.address, self.attempts
                );
            }
            self.attempts = 0;
            self.settle_session();
        }
    }

    /// No reconnect is coming: abort in-flight messages unless they are kept
    /// for a resumed session.
    fn settle_session(&mut self) {
        if self.config.reconnect.enabled && !self.config.clean_session {
            if self.tracker.pending_count() > 0 {
                debug!(
                    "Keeping {} messages for the next session",
                    self.tracker.pending_count()
                );
            }
            return;
        }
        self.cancel_pending();
        self.tracker.clear();
    }

    fn cancel_pending(&mut self) {
        for pending in self.tracker.drain_pending() {
            self.events.push_back(Event::PublishFailed {
                packet_id: pending.packet_id,
                error: ClientError::Cancelled,
            });
        }
    }
}

/// Time until `deadline`, zero if already passed.
pub(crate) fn until(deadline: Instant, now: Instant) -> Duration {
    deadline.saturating_duration_since(now)
}
