//! Async MQTT client using tokio.
//!
//! Split architecture: `AsyncClient` (cloneable) + `EventLoop` (owns the
//! transport and all protocol state).
//!
//! ```ignore
//! let (client, mut eventloop) = AsyncClient::new(config, 10);
//!
//! tokio::spawn(async move {
//!     client.subscribe("sensors/#", QoS::AtLeastOnce).await?;
//!     client.publish("sensors/temp", "23.5", QoS::AtLeastOnce, false).await?;
//!     Ok::<_, ClientError>(())
//! });
//!
//! // Must poll the eventloop to drive I/O
//! while let Ok(event) = eventloop.poll().await {
//!     if let Event::MessageReceived { topic, payload, .. } = event {
//!         println!("{}: {:?}", topic, payload);
//!     }
//! }
//! ```

use std::future::pending;
use std::io;
use std::time::{Duration, Instant};

use bytes::Bytes;
use log::{debug, warn};
use qmqtt_core::QoS;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};

use crate::config::ClientConfig;
use crate::connection::{until, Connection};
use crate::error::{ClientError, Result};
use crate::events::{ConnectionState, Event};
use crate::transport::{Connector, TcpConnector};

const READ_BUFFER_SIZE: usize = 8192;

/// Commands sent from AsyncClient to EventLoop.
enum Command {
    Connect {
        resp: oneshot::Sender<Result<()>>,
    },
    Publish {
        topic: String,
        payload: Bytes,
        qos: QoS,
        retain: bool,
        resp: oneshot::Sender<Result<Option<u16>>>,
    },
    Subscribe {
        filter: String,
        qos: QoS,
        resp: oneshot::Sender<Result<u16>>,
    },
    Unsubscribe {
        filter: String,
        resp: oneshot::Sender<Result<u16>>,
    },
    Disconnect {
        resp: oneshot::Sender<Result<()>>,
    },
}

/// Async MQTT client handle.
///
/// This is the user-facing API. It's `Clone` and can be shared across tasks.
/// Calls are queued to the `EventLoop`, which applies them one at a time
/// and answers each with its result.
#[derive(Clone)]
pub struct AsyncClient {
    tx: mpsc::Sender<Command>,
}

impl AsyncClient {
    /// Create a new client and eventloop pair connecting over TCP.
    ///
    /// `cap` is the command channel capacity (10 is usually fine). The
    /// eventloop connects on its first `poll()`.
    pub fn new(config: ClientConfig, cap: usize) -> (Self, EventLoop<TcpConnector>) {
        let connector = TcpConnector::new(config.address.clone(), config.connect_timeout);
        Self::with_connector(config, connector, cap)
    }

    /// Create a client and eventloop pair using a custom transport.
    pub fn with_connector<C: Connector>(
        config: ClientConfig,
        connector: C,
        cap: usize,
    ) -> (Self, EventLoop<C>) {
        let (tx, rx) = mpsc::channel(cap.max(1));
        let client = Self { tx };
        let eventloop = EventLoop::new(config, connector, rx);
        (client, eventloop)
    }

    /// Start connecting again after the client ended up disconnected.
    pub async fn connect(&self) -> Result<()> {
        self.request(|resp| Command::Connect { resp }).await
    }

    /// Publish a message.
    ///
    /// Returns the packet ID for QoS > 0, or None for QoS 0. Completion is
    /// reported later as `Event::Published`.
    pub async fn publish(
        &self,
        topic: &str,
        payload: impl Into<Bytes>,
        qos: QoS,
        retain: bool,
    ) -> Result<Option<u16>> {
        let topic = topic.to_string();
        let payload = payload.into();
        self.request(|resp| Command::Publish {
            topic,
            payload,
            qos,
            retain,
            resp,
        })
        .await
    }

    /// Subscribe to a topic filter. Returns the SUBSCRIBE packet ID.
    pub async fn subscribe(&self, filter: &str, qos: QoS) -> Result<u16> {
        let filter = filter.to_string();
        self.request(|resp| Command::Subscribe { filter, qos, resp })
            .await
    }

    /// Unsubscribe from a topic filter. Returns the UNSUBSCRIBE packet ID.
    pub async fn unsubscribe(&self, filter: &str) -> Result<u16> {
        let filter = filter.to_string();
        self.request(|resp| Command::Unsubscribe { filter, resp })
            .await
    }

    /// Disconnect from the broker. Cancels any scheduled reconnect.
    pub async fn disconnect(&self) -> Result<()> {
        self.request(|resp| Command::Disconnect { resp }).await
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<Result<T>>) -> Command,
    ) -> Result<T> {
        let (resp_tx, resp_rx) = oneshot::channel();
        self.tx
            .send(command(resp_tx))
            .await
            .map_err(|_| ClientError::NotConnected)?;
        resp_rx.await.map_err(|_| ClientError::NotConnected)?
    }
}

/// The event loop that drives MQTT I/O.
///
/// You must call `poll()` repeatedly to process packets, timers and client
/// commands.
pub struct EventLoop<C: Connector = TcpConnector> {
    conn: Connection,
    connector: C,
    transport: Option<C::Transport>,
    rx: mpsc::Receiver<Command>,
    /// Every `AsyncClient` handle has been dropped.
    commands_closed: bool,
    write_timeout: Duration,
    read_buf: Box<[u8]>,
}

impl<C: Connector> EventLoop<C> {
    fn new(config: ClientConfig, connector: C, rx: mpsc::Receiver<Command>) -> Self {
        let write_timeout = config.write_timeout;
        let mut conn = Connection::new(config);
        // Connect on the first poll
        let _ = conn.request_connect();

        Self {
            conn,
            connector,
            transport: None,
            rx,
            commands_closed: false,
            write_timeout,
            read_buf: vec![0u8; READ_BUFFER_SIZE].into_boxed_slice(),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.conn.state()
    }

    pub fn is_connected(&self) -> bool {
        self.conn.is_connected()
    }

    /// The protocol state machine driven by this loop.
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Poll for the next event.
    ///
    /// This drives all I/O. You must call this in a loop. When reconnection
    /// is enabled, lost connections are re-established here with backoff,
    /// reported through `Event::Reconnecting`.
    ///
    /// Returns `Err(NotConnected)` once every `AsyncClient` handle is gone
    /// and the connection is closed.
    pub async fn poll(&mut self) -> Result<Event> {
        loop {
            if let Some(event) = self.conn.next_event() {
                return Ok(event);
            }

            if self.transport.is_some() && self.conn.has_outgoing() {
                self.flush().await;
                continue;
            }
            if self.conn.should_close_transport() {
                self.close_transport().await;
                continue;
            }
            if self.transport.is_none() && self.conn.wants_transport() {
                self.open_transport().await;
                continue;
            }
            if self.commands_closed
                && self.transport.is_none()
                && self.conn.next_deadline().is_none()
            {
                return Err(ClientError::NotConnected);
            }

            self.wait().await;
        }
    }

    /// Wait for one of: inbound bytes, a command, or the next deadline.
    async fn wait(&mut self) {
        enum Action {
            Read(io::Result<usize>),
            Command(Option<Command>),
            Tick,
        }

        let sleep = self
            .conn
            .next_deadline()
            .map(|deadline| until(deadline, now()));
        let commands_open = !self.commands_closed;
        let transport = &mut self.transport;
        let read_buf = &mut self.read_buf;
        let rx = &mut self.rx;

        let action = tokio::select! {
            result = async move {
                match transport.as_mut() {
                    Some(t) => t.read(&mut read_buf[..]).await,
                    None => pending().await,
                }
            } => Action::Read(result),
            cmd = rx.recv(), if commands_open => Action::Command(cmd),
            _ = async move {
                match sleep {
                    Some(d) => tokio::time::sleep(d).await,
                    None => pending().await,
                }
            } => Action::Tick,
        };

        let now = now();
        match action {
            Action::Read(Ok(0)) => {
                debug!("Transport closed by peer");
                self.transport = None;
                self.conn.transport_closed(now);
            }
            Action::Read(Ok(n)) => self.conn.handle_incoming(&self.read_buf[..n], now),
            Action::Read(Err(e)) => {
                self.transport = None;
                self.conn.transport_error(e, now);
            }
            Action::Command(Some(cmd)) => self.handle_command(cmd, now),
            Action::Command(None) => {
                // Client handles dropped - clean disconnect
                self.commands_closed = true;
                self.conn.disconnect(now);
            }
            Action::Tick => self.conn.handle_tick(now),
        }
    }

    fn handle_command(&mut self, cmd: Command, now: Instant) {
        match cmd {
            Command::Connect { resp } => {
                let _ = resp.send(self.conn.request_connect());
            }
            Command::Publish {
                topic,
                payload,
                qos,
                retain,
                resp,
            } => {
                let _ = resp.send(self.conn.publish(topic, payload, qos, retain, now));
            }
            Command::Subscribe { filter, qos, resp } => {
                let _ = resp.send(self.conn.subscribe(filter, qos, now));
            }
            Command::Unsubscribe { filter, resp } => {
                let _ = resp.send(self.conn.unsubscribe(filter, now));
            }
            Command::Disconnect { resp } => {
                self.conn.disconnect(now);
                let _ = resp.send(Ok(()));
            }
        }
    }

    /// Write queued bytes. Bounded by the write timeout so a stalled peer
    /// cannot hold up keep-alive and timers indefinitely.
    async fn flush(&mut self) {
        let bytes = self.conn.take_outgoing();
        let Some(transport) = self.transport.as_mut() else {
            return;
        };
        let result = tokio::time::timeout(self.write_timeout, async {
            transport.write_all(&bytes).await?;
            transport.flush().await
        })
        .await;

        let err = match result {
            Ok(Ok(())) => return,
            Ok(Err(e)) => e,
            Err(_) => {
                warn!("Write blocked for more than {:?}", self.write_timeout);
                io::Error::new(io::ErrorKind::TimedOut, "write timed out")
            }
        };
        self.transport = None;
        self.conn.transport_error(err, now());
    }

    async fn close_transport(&mut self) {
        if let Some(mut transport) = self.transport.take() {
            match tokio::time::timeout(self.write_timeout, transport.shutdown()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => debug!("Error shutting down transport: {}", e),
                Err(_) => debug!("Transport shutdown timed out"),
            }
        }
        self.conn.transport_closed(now());
    }

    async fn open_transport(&mut self) {
        let result = self.connector.connect().await;
        let now = now();
        match result {
            Ok(transport) => {
                self.transport = Some(transport);
                if let Err(e) = self.conn.connect(now) {
                    warn!("Cannot start connection: {}", e);
                    self.transport = None;
                }
            }
            Err(e) => self.conn.transport_error(e, now),
        }
    }
}

/// Current time on tokio's clock, which tests can pause and advance.
fn now() -> Instant {
    tokio::time::Instant::now().into_std()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::future::Future;

    use crate::config::ReconnectConfig;
    use crate::events::DisconnectReason;
    use qmqtt_core::{decode, encode, Connack, ConnackCode, Packet};
    use tokio::io::DuplexStream;

    /// Hands out prepared in-memory streams, then refuses.
    struct DuplexConnector {
        streams: VecDeque<DuplexStream>,
    }

    impl Connector for DuplexConnector {
        type Transport = DuplexStream;

        fn connect(&mut self) -> impl Future<Output = io::Result<DuplexStream>> + Send {
            let next = self.streams.pop_front();
            async move { next.ok_or_else(|| io::ErrorKind::ConnectionRefused.into()) }
        }
    }

    /// Broker side of a duplex stream.
    struct Broker {
        stream: DuplexStream,
        buf: Vec<u8>,
    }

    impl Broker {
        async fn recv(&mut self) -> Packet {
            loop {
                if let Some((packet, used)) = decode(&self.buf).unwrap() {
                    self.buf.drain(..used);
                    return packet;
                }
                let mut chunk = [0u8; 1024];
                let n = self.stream.read(&mut chunk).await.unwrap();
                assert!(n > 0, "client closed the connection");
                self.buf.extend_from_slice(&chunk[..n]);
            }
        }

        async fn send(&mut self, packet: Packet) {
            let mut bytes = Vec::new();
            encode(&packet, &mut bytes).unwrap();
            self.stream.write_all(&bytes).await.unwrap();
        }

        async fn accept(&mut self, session_present: bool) {
            match self.recv().await {
                Packet::Connect(_) => {}
                other => panic!("expected CONNECT, got {:?}", other),
            }
            self.send(Packet::Connack(Connack {
                session_present,
                code: ConnackCode::Accepted,
            }))
            .await;
        }
    }

    /// Spawn the eventloop, forwarding its events to a channel.
    fn start(
        config: ClientConfig,
        sessions: usize,
    ) -> (AsyncClient, mpsc::UnboundedReceiver<Event>, Vec<Broker>) {
        start_with_buffer(config, sessions, 4096)
    }

    fn start_with_buffer(
        config: ClientConfig,
        sessions: usize,
        buffer: usize,
    ) -> (
        AsyncClient,
        mpsc::UnboundedReceiver<Event>,
        Vec<Broker>,
    ) {
        let mut streams = VecDeque::new();
        let mut brokers = Vec::new();
        for _ in 0..sessions {
            let (client_end, broker_end) = tokio::io::duplex(buffer);
            streams.push_back(client_end);
            brokers.push(Broker {
                stream: broker_end,
                buf: Vec::new(),
            });
        }
        let (client, mut eventloop) =
            AsyncClient::with_connector(config, DuplexConnector { streams }, 10);
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Ok(event) = eventloop.poll().await {
                if tx.send(event).is_err() {
                    break;
                }
            }
        });
        (client, rx, brokers)
    }

    fn config() -> ClientConfig {
        ClientConfig::new("broker:1883")
            .client_id("loop-test")
            .keep_alive(60)
            .clean_session(true)
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_scenario() {
        let (_client, mut events, mut brokers) = start(config(), 1);
        let broker = &mut brokers[0];

        match broker.recv().await {
            Packet::Connect(connect) => {
                assert!(connect.clean_session);
                assert_eq!(connect.keep_alive, 60);
                assert_eq!(connect.client_id, "loop-test");
            }
            other => panic!("expected CONNECT, got {:?}", other),
        }
        broker
            .send(Packet::Connack(Connack {
                session_present: false,
                code: ConnackCode::Accepted,
            }))
            .await;

        assert!(matches!(
            events.recv().await,
            Some(Event::Connected {
                session_present: false
            })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_publish_before_connack_is_rejected() {
        let (client, _events, mut brokers) = start(config(), 1);
        assert!(matches!(brokers[0].recv().await, Packet::Connect(_)));
        assert!(matches!(
            client.publish("a", "x", QoS::AtLeastOnce, false).await,
            Err(ClientError::NotConnected)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_qos1_publish_scenario() {
        let (client, mut events, mut brokers) = start(config(), 1);
        let broker = &mut brokers[0];
        broker.accept(false).await;
        assert!(matches!(events.recv().await, Some(Event::Connected { .. })));

        let id = client
            .publish("topic/a", "hello", QoS::AtLeastOnce, false)
            .await
            .unwrap()
            .unwrap();
        match broker.recv().await {
            Packet::Publish(p) => {
                assert_eq!(p.topic, "topic/a");
                assert_eq!(p.payload.as_ref(), b"hello");
                assert_eq!(p.qos, QoS::AtLeastOnce);
                assert_eq!(p.packet_id, Some(id));
            }
            other => panic!("expected PUBLISH, got {:?}", other),
        }
        broker.send(Packet::Puback { packet_id: id }).await;

        assert!(matches!(
            events.recv().await,
            Some(Event::Published { packet_id }) if packet_id == id
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unexpected_close_scenario() {
        let (client, mut events, mut brokers) = start(config(), 1);
        let mut broker = brokers.remove(0);
        broker.accept(false).await;
        assert!(matches!(events.recv().await, Some(Event::Connected { .. })));

        let id = client
            .publish("topic/a", "hello", QoS::AtLeastOnce, false)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(broker.recv().await, Packet::Publish(_)));
        drop(broker);

        assert!(matches!(
            events.recv().await,
            Some(Event::Error(ClientError::ConnectionLost))
        ));
        assert!(matches!(
            events.recv().await,
            Some(Event::Disconnected {
                reason: DisconnectReason::ConnectionLost
            })
        ));
        assert!(matches!(
            events.recv().await,
            Some(Event::PublishFailed {
                packet_id,
                error: ClientError::Cancelled
            }) if packet_id == id
        ));
        assert!(matches!(
            client.publish("topic/a", "again", QoS::AtMostOnce, false).await,
            Err(ClientError::NotConnected)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_write_times_out() {
        let config = config().write_timeout(Duration::from_secs(3));
        let (client, mut events, mut brokers) = start_with_buffer(config, 1, 64);
        // Kept open but never read again
        let broker = &mut brokers[0];
        broker.accept(false).await;
        assert!(matches!(events.recv().await, Some(Event::Connected { .. })));

        let start = tokio::time::Instant::now();
        let id = client
            .publish("bulk", vec![0u8; 10 * 1024], QoS::AtLeastOnce, false)
            .await
            .unwrap()
            .unwrap();

        match events.recv().await {
            Some(Event::Error(ClientError::Io(e))) => {
                assert_eq!(e.kind(), io::ErrorKind::TimedOut)
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(start.elapsed() >= Duration::from_secs(3));
        assert!(matches!(
            events.recv().await,
            Some(Event::Disconnected {
                reason: DisconnectReason::ConnectionLost
            })
        ));
        assert!(matches!(
            events.recv().await,
            Some(Event::PublishFailed {
                packet_id,
                error: ClientError::Cancelled
            }) if packet_id == id
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscribe_and_receive() {
        let (client, mut events, mut brokers) = start(config(), 1);
        let broker = &mut brokers[0];
        broker.accept(false).await;
        events.recv().await;

        let id = client.subscribe("sensors/+", QoS::AtLeastOnce).await.unwrap();
        match broker.recv().await {
            Packet::Subscribe(s) => {
                assert_eq!(s.packet_id, id);
                assert_eq!(s.filters, vec![("sensors/+".to_string(), QoS::AtLeastOnce)]);
            }
            other => panic!("expected SUBSCRIBE, got {:?}", other),
        }
        broker
            .send(Packet::Suback(qmqtt_core::Suback {
                packet_id: id,
                return_codes: vec![qmqtt_core::SubackCode::Granted(QoS::AtLeastOnce)],
            }))
            .await;
        assert!(matches!(
            events.recv().await,
            Some(Event::Subscribed { granted_qos: Some(QoS::AtLeastOnce), .. })
        ));

        broker
            .send(Packet::Publish(qmqtt_core::Publish {
                dup: false,
                qos: QoS::AtLeastOnce,
                retain: false,
                topic: "sensors/temp".to_string(),
                packet_id: Some(77),
                payload: Bytes::from_static(b"21.5"),
            }))
            .await;
        match events.recv().await {
            Some(Event::MessageReceived { topic, payload, .. }) => {
                assert_eq!(topic, "sensors/temp");
                assert_eq!(payload.as_ref(), b"21.5");
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(broker.recv().await, Packet::Puback { packet_id: 77 });
    }

    #[tokio::test(start_paused = true)]
    async fn test_keepalive_ping() {
        let (_client, mut events, mut brokers) = start(config().keep_alive(10), 1);
        let broker = &mut brokers[0];
        broker.accept(false).await;
        events.recv().await;

        let start = tokio::time::Instant::now();
        assert_eq!(broker.recv().await, Packet::Pingreq);
        let waited = start.elapsed();
        assert!(waited >= Duration::from_secs(10), "pinged after {:?}", waited);
        assert!(waited < Duration::from_secs(15), "pinged after {:?}", waited);
        broker.send(Packet::Pingresp).await;

        // Next ping only after another idle interval
        let start = tokio::time::Instant::now();
        assert_eq!(broker.recv().await, Packet::Pingreq);
        assert!(start.elapsed() >= Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_connack_timeout() {
        let (_client, mut events, mut brokers) =
            start(config().connack_timeout(Duration::from_secs(5)), 1);
        assert!(matches!(brokers[0].recv().await, Packet::Connect(_)));

        let start = tokio::time::Instant::now();
        assert!(matches!(
            events.recv().await,
            Some(Event::Error(ClientError::ConnectTimeout))
        ));
        assert!(start.elapsed() >= Duration::from_secs(5));
        assert!(matches!(
            events.recv().await,
            Some(Event::Disconnected {
                reason: DisconnectReason::ConnectTimeout
            })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_after_loss() {
        let reconnect = ReconnectConfig {
            jitter: 0.0,
            ..ReconnectConfig::enabled()
        };
        let (_client, mut events, mut brokers) = start(config().reconnect(reconnect), 2);
        let mut second = brokers.pop().unwrap();
        let mut first = brokers.pop().unwrap();

        first.accept(false).await;
        assert!(matches!(events.recv().await, Some(Event::Connected { .. })));
        drop(first);

        assert!(matches!(
            events.recv().await,
            Some(Event::Error(ClientError::ConnectionLost))
        ));
        assert!(matches!(
            events.recv().await,
            Some(Event::Disconnected {
                reason: DisconnectReason::ConnectionLost
            })
        ));
        assert!(matches!(
            events.recv().await,
            Some(Event::Reconnecting { attempt: 1, delay }) if delay == Duration::from_secs(1)
        ));

        second.accept(true).await;
        assert!(matches!(
            events.recv().await,
            Some(Event::Connected {
                session_present: true
            })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_and_reconnect_on_request() {
        let (client, mut events, mut brokers) = start(config(), 2);
        let mut second = brokers.pop().unwrap();
        let mut first = brokers.pop().unwrap();
        first.accept(false).await;
        events.recv().await;

        client.disconnect().await.unwrap();
        assert_eq!(first.recv().await, Packet::Disconnect);
        assert!(matches!(
            events.recv().await,
            Some(Event::Disconnected {
                reason: DisconnectReason::Requested
            })
        ));

        client.connect().await.unwrap();
        second.accept(false).await;
        assert!(matches!(events.recv().await, Some(Event::Connected { .. })));
        assert!(client.connect().await.is_err());
    }
}
