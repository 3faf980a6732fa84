//! Async MQTT client using tokio.
//!
//! Split architecture: `AsyncClient` (cloneable) + `EventLoop` (owns the
//! transport and the protocol [`Engine`]).
//!
//! ## Basic usage (raw events)
//!
//! ```ignore
//! let (client, mut eventloop) = AsyncClient::new(config, 10);
//!
//! loop {
//!     match eventloop.poll().await? {
//!         Event::Connected { .. } => {
//!             client.subscribe(&[("sensors/#", QoS::AtLeastOnce)]).await?;
//!         }
//!         Event::Message(msg) => println!("{}: {:?}", msg.topic, msg.payload),
//!         _ => {}
//!     }
//! }
//! ```
//!
//! ## Per-subscription streams
//!
//! ```ignore
//! let mut sensors = client.subscribe_stream("sensors/#", QoS::AtLeastOnce).await?;
//! tokio::spawn(async move {
//!     while let Some(msg) = sensors.recv().await {
//!         println!("Sensor: {} = {:?}", msg.topic, msg.payload);
//!     }
//! });
//!
//! // Must still poll eventloop to drive I/O
//! while eventloop.poll().await.is_ok() {}
//! ```
//!
//! ## Reconnection
//!
//! With `auto_reconnect` the event loop reconnects by itself after a lost
//! connection, waiting out the configured backoff and resuming the session
//! while it has not expired. Without it, the next `poll()` after
//! `Event::ConnectionLost` makes a single attempt.

use std::collections::VecDeque;
use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};
use mqfive_core::packet::{reason_code, Publish, QoS, SubscriptionOptions};
use mqfive_core::property::Properties;
use mqfive_core::topic;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, oneshot};

use crate::config::ClientConfig;
use crate::engine::Engine;
use crate::error::{ClientError, Result};
use crate::events::{Event, Message};
use crate::session::SessionState;
use crate::transport::{BoxedTransport, Connector, TcpConnector};

const READ_BUFFER_SIZE: usize = 4096;
const DEFAULT_STREAM_CAPACITY: usize = 100;
/// Sleep used when the engine has no timer armed.
const IDLE_TICK: Duration = Duration::from_secs(3600);
/// How long a closing connection may spend flushing before it is dropped.
const CLOSE_GRACE: Duration = Duration::from_secs(5);

fn now() -> std::time::Instant {
    tokio::time::Instant::now().into_std()
}

/// A stream of messages for a specific subscription.
///
/// Messages matching the subscription's topic filter are delivered here
/// instead of as `Event::Message`.
pub struct MessageStream {
    rx: mpsc::Receiver<Message>,
    filter: String,
}

impl MessageStream {
    /// Receive the next message.
    ///
    /// Returns `None` once the event loop is dropped or the filter is
    /// unsubscribed.
    pub async fn recv(&mut self) -> Option<Message> {
        self.rx.recv().await
    }

    /// Try to receive a message without blocking.
    pub fn try_recv(&mut self) -> Option<Message> {
        self.rx.try_recv().ok()
    }

    /// Get the topic filter this stream is subscribed to.
    pub fn filter(&self) -> &str {
        &self.filter
    }
}

/// Commands sent from AsyncClient to EventLoop.
enum Command {
    Publish {
        publish: Publish,
        resp: oneshot::Sender<Result<Option<u16>>>,
    },
    Subscribe {
        filters: Vec<(String, SubscriptionOptions)>,
        properties: Properties,
        stream: Option<mpsc::Sender<Message>>,
        resp: oneshot::Sender<Result<u16>>,
    },
    Unsubscribe {
        filters: Vec<String>,
        properties: Properties,
        resp: oneshot::Sender<Result<u16>>,
    },
    Auth {
        reason_code: u8,
        properties: Properties,
        resp: oneshot::Sender<Result<()>>,
    },
    Disconnect {
        reason_code: u8,
        properties: Properties,
        resp: oneshot::Sender<Result<()>>,
    },
}

/// Async MQTT client handle.
///
/// This is the user-facing API. It's `Clone` and can be shared across tasks.
/// Commands are sent to the `EventLoop` via a channel; each call returns once
/// the packet is queued, not when it is acknowledged. Watch for the matching
/// `Event::PubAck`, `Event::SubAck` ... on the event loop.
#[derive(Clone)]
pub struct AsyncClient {
    tx: mpsc::Sender<Command>,
}

impl AsyncClient {
    /// Create a new client and eventloop pair connecting over TCP/TLS.
    ///
    /// `cap` is the command channel capacity (10 is usually fine).
    pub fn new(config: ClientConfig, cap: usize) -> (Self, EventLoop) {
        let connector = TcpConnector::new(&config);
        Self::with_connector(config, connector, cap)
    }

    /// Create a client that opens its transports through `connector`.
    pub fn with_connector(
        config: ClientConfig,
        connector: impl Connector + 'static,
        cap: usize,
    ) -> (Self, EventLoop) {
        let (tx, rx) = mpsc::channel(cap);
        let client = Self { tx };
        let eventloop = EventLoop::new(config, Box::new(connector), rx);
        (client, eventloop)
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<Result<T>>) -> Command,
    ) -> Result<T> {
        let (resp_tx, resp_rx) = oneshot::channel();
        self.tx
            .send(make(resp_tx))
            .await
            .map_err(|_| ClientError::ConnectionClosed)?;
        resp_rx.await.map_err(|_| ClientError::ConnectionClosed)?
    }

    /// Publish a message.
    ///
    /// Returns the packet ID for QoS > 0, or None for QoS 0.
    pub async fn publish(
        &self,
        topic: &str,
        payload: impl Into<Bytes>,
        qos: QoS,
        retain: bool,
    ) -> Result<Option<u16>> {
        self.publish_with_properties(topic, payload, qos, retain, Properties::new())
            .await
    }

    /// Publish with PUBLISH properties (message expiry, content type,
    /// response topic, correlation data, user properties ...).
    pub async fn publish_with_properties(
        &self,
        topic: &str,
        payload: impl Into<Bytes>,
        qos: QoS,
        retain: bool,
        properties: Properties,
    ) -> Result<Option<u16>> {
        let mut publish = Publish::new(topic, payload, qos);
        publish.retain = retain;
        publish.properties = properties;
        self.request(|resp| Command::Publish { publish, resp }).await
    }

    /// Subscribe to topics with default options.
    pub async fn subscribe(&self, topics: &[(&str, QoS)]) -> Result<u16> {
        let filters = topics
            .iter()
            .map(|(t, q)| (t.to_string(), SubscriptionOptions::new(*q)))
            .collect();
        self.subscribe_with_options(filters, Properties::new()).await
    }

    /// Subscribe with full MQTT 5.0 subscription options and SUBSCRIBE
    /// properties (Subscription Identifier, User Property).
    pub async fn subscribe_with_options(
        &self,
        filters: Vec<(String, SubscriptionOptions)>,
        properties: Properties,
    ) -> Result<u16> {
        self.request(|resp| Command::Subscribe {
            filters,
            properties,
            stream: None,
            resp,
        })
        .await
    }

    /// Subscribe and get a dedicated message stream.
    ///
    /// Each subscription gets its own stream, so you can handle different
    /// topics in different tasks without manual topic matching.
    pub async fn subscribe_stream(&self, filter: &str, qos: QoS) -> Result<MessageStream> {
        let (msg_tx, msg_rx) = mpsc::channel(DEFAULT_STREAM_CAPACITY);
        self.request(|resp| Command::Subscribe {
            filters: vec![(filter.to_string(), SubscriptionOptions::new(qos))],
            properties: Properties::new(),
            stream: Some(msg_tx),
            resp,
        })
        .await?;

        Ok(MessageStream {
            rx: msg_rx,
            filter: filter.to_string(),
        })
    }

    /// Unsubscribe from topics.
    pub async fn unsubscribe(&self, topics: &[&str]) -> Result<u16> {
        let filters = topics.iter().map(|t| t.to_string()).collect();
        self.unsubscribe_with_properties(filters, Properties::new())
            .await
    }

    pub async fn unsubscribe_with_properties(
        &self,
        filters: Vec<String>,
        properties: Properties,
    ) -> Result<u16> {
        self.request(|resp| Command::Unsubscribe {
            filters,
            properties,
            resp,
        })
        .await
    }

    /// Send an AUTH packet (enhanced authentication or re-authentication).
    pub async fn auth(&self, reason_code: u8, properties: Properties) -> Result<()> {
        self.request(|resp| Command::Auth {
            reason_code,
            properties,
            resp,
        })
        .await
    }

    /// Disconnect normally. The server discards the will message.
    pub async fn disconnect(&self) -> Result<()> {
        self.disconnect_with(reason_code::NORMAL_DISCONNECTION, Properties::new())
            .await
    }

    /// Disconnect with a reason code and DISCONNECT properties, e.g.
    /// `0x04` to have the server publish the will anyway.
    pub async fn disconnect_with(&self, reason_code: u8, properties: Properties) -> Result<()> {
        self.request(|resp| Command::Disconnect {
            reason_code,
            properties,
            resp,
        })
        .await
    }
}

/// Registered subscription stream.
struct StreamSubscription {
    filter: String,
    tx: mpsc::Sender<Message>,
}

/// An open transport, split so reads and writes can wait side by side.
struct Connection {
    reader: ReadHalf<BoxedTransport>,
    writer: WriteHalf<BoxedTransport>,
    /// Bytes taken from the engine that the transport has not accepted yet.
    write_buf: BytesMut,
    needs_flush: bool,
    /// Set once the engine asks to close; the rest of `write_buf` must be
    /// written by then.
    close_deadline: Option<std::time::Instant>,
}

impl Connection {
    fn new(transport: BoxedTransport) -> Self {
        let (reader, writer) = tokio::io::split(transport);
        Self {
            reader,
            writer,
            write_buf: BytesMut::new(),
            needs_flush: false,
            close_deadline: None,
        }
    }

    fn is_flushed(&self) -> bool {
        self.write_buf.is_empty() && !self.needs_flush
    }
}

/// The event loop that drives MQTT I/O.
///
/// You must call `poll()` repeatedly to process packets. It connects on the
/// first call.
pub struct EventLoop {
    engine: Engine,
    rx: mpsc::Receiver<Command>,
    connector: Box<dyn Connector>,
    connection: Option<Connection>,
    /// Registered subscription streams for message routing.
    streams: Vec<StreamSubscription>,
    pending: VecDeque<Event>,
    /// Set by a local disconnect or when every client handle is dropped.
    stopped: bool,
    clients_gone: bool,
    /// CONNACK refusal to report from the next `poll()`.
    refused: Option<u8>,
    /// Consecutive connections that ended without a recoverable session.
    failures: u32,
}

impl EventLoop {
    fn new(
        config: ClientConfig,
        connector: Box<dyn Connector>,
        rx: mpsc::Receiver<Command>,
    ) -> Self {
        Self {
            engine: Engine::new(config),
            rx,
            connector,
            connection: None,
            streams: Vec::new(),
            pending: VecDeque::new(),
            stopped: false,
            clients_gone: false,
            refused: None,
            failures: 0,
        }
    }

    /// Poll for the next event.
    ///
    /// This drives all I/O. You must call this in a loop.
    ///
    /// Messages matching a `subscribe_stream()` filter are routed to that
    /// stream and do not appear as `Event::Message`.
    ///
    /// Returns `Err(ClientError::ConnectionClosed)` after a local disconnect
    /// has completed or once every `AsyncClient` is dropped.
    pub async fn poll(&mut self) -> Result<Event> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Ok(event);
            }
            if let Some(reason_code) = self.refused.take() {
                return Err(ClientError::ConnectionRefused { reason_code });
            }

            if self.connection.is_none() {
                if self.stopped {
                    return Err(ClientError::ConnectionClosed);
                }
                self.establish().await?;
                continue;
            }

            self.step().await;
        }
    }

    /// Open a transport and start the CONNECT handshake, waiting out any
    /// reconnect delay first.
    async fn establish(&mut self) -> Result<()> {
        let auto_reconnect = self.engine.config().auto_reconnect;
        match self.engine.state() {
            SessionState::Reconnecting if auto_reconnect && !self.engine.reconnect_due(now()) => {
                // Reconnect delay or session expiry, whichever comes first
                let deadline = self.engine.next_tick_at().unwrap_or_else(|| now() + IDLE_TICK);
                self.wait_until(deadline).await;
                self.engine.handle_tick(now());
                self.collect_events().await;
                return Ok(());
            }
            SessionState::Disconnected if auto_reconnect && self.failures > 0 => {
                let delay = self.engine.config().reconnect_backoff.delay(self.failures);
                log::info!("Reconnecting in {:?} (attempt {})", delay, self.failures);
                let deadline = now() + delay;
                if !self.wait_until(deadline).await {
                    return Ok(());
                }
            }
            _ => {}
        }

        self.engine.connect(now())?;
        match self.connector.connect().await {
            Ok(transport) => {
                self.connection = Some(Connection::new(transport));
                Ok(())
            }
            Err(e) => {
                log::warn!("Connection attempt failed: {}", e);
                self.engine.handle_transport_closed(now());
                let initial = self.engine.state() == SessionState::Disconnected;
                if initial {
                    self.failures += 1;
                }
                self.collect_events().await;
                if initial && !auto_reconnect {
                    // The error itself reports the failure
                    if matches!(self.pending.back(), Some(Event::ConnectionFailed { .. })) {
                        self.pending.pop_back();
                    }
                    return Err(e);
                }
                Ok(())
            }
        }
    }

    /// Sleep until `deadline` while still serving commands.
    ///
    /// Returns false when a command changed the state and the caller should
    /// re-evaluate instead of connecting.
    async fn wait_until(&mut self, deadline: std::time::Instant) -> bool {
        let deadline = tokio::time::Instant::from_std(deadline);
        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => return true,
                cmd = self.rx.recv(), if !self.clients_gone => {
                    let state = self.engine.state();
                    self.handle_command(cmd);
                    self.collect_events().await;
                    if self.stopped || self.engine.state() != state {
                        return false;
                    }
                }
            }
        }
    }

    /// One round of I/O on the open transport.
    ///
    /// Writing, reading, commands and the engine's next tick are raced in a
    /// single `select!`, so a peer that stops reading cannot stall commands
    /// or keepalive.
    async fn step(&mut self) {
        let Some(conn) = self.connection.as_mut() else {
            return;
        };

        let out = self.engine.take_outgoing();
        if !out.is_empty() {
            conn.write_buf.extend_from_slice(&out);
        }

        if self.engine.wants_close() {
            if conn.is_flushed() {
                self.close_transport().await;
                return;
            }
            if conn.close_deadline.is_none() {
                conn.close_deadline = Some(now() + CLOSE_GRACE);
            }
        }

        self.collect_events().await;
        if !self.pending.is_empty() {
            return;
        }

        let Some(Connection {
            reader,
            writer,
            write_buf,
            needs_flush,
            close_deadline,
        }) = self.connection.as_mut()
        else {
            return;
        };
        let deadline = match *close_deadline {
            Some(deadline) => deadline,
            None => self
                .engine
                .next_tick_at()
                .unwrap_or_else(|| now() + IDLE_TICK),
        };
        let mut buf = [0u8; READ_BUFFER_SIZE];

        enum Action {
            Read(std::io::Result<usize>),
            /// Bytes written, or `None` after a flush.
            Wrote(std::io::Result<Option<usize>>),
            Command(Option<Command>),
            Tick,
        }

        let pending_write = !write_buf.is_empty() || *needs_flush;
        let write = async {
            if write_buf.is_empty() {
                writer.flush().await.map(|_| None)
            } else {
                writer.write(&write_buf[..]).await.map(Some)
            }
        };

        let action = tokio::select! {
            result = write, if pending_write => Action::Wrote(result),
            result = reader.read(&mut buf) => Action::Read(result),
            cmd = self.rx.recv(), if !self.clients_gone => Action::Command(cmd),
            _ = tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)) => Action::Tick,
        };

        match action {
            Action::Wrote(Ok(Some(0))) => {
                log::warn!("Write failed: transport accepts no more bytes");
                self.close_transport().await;
            }
            Action::Wrote(Ok(Some(n))) => {
                write_buf.advance(n);
                *needs_flush = true;
            }
            Action::Wrote(Ok(None)) => *needs_flush = false,
            Action::Wrote(Err(e)) => {
                log::warn!("Write failed: {}", e);
                self.close_transport().await;
            }
            Action::Read(Ok(0)) => {
                log::debug!("Connection closed by peer");
                self.close_transport().await;
            }
            Action::Read(Ok(n)) => self.engine.handle_incoming(&buf[..n], now()),
            Action::Read(Err(e)) => {
                log::warn!("Read failed: {}", e);
                self.close_transport().await;
            }
            Action::Command(cmd) => self.handle_command(cmd),
            Action::Tick if close_deadline.is_some() => {
                log::warn!(
                    "Peer did not take the last {} bytes within {:?}, closing",
                    write_buf.len(),
                    CLOSE_GRACE
                );
                self.close_transport().await;
            }
            Action::Tick => self.engine.handle_tick(now()),
        }
        self.collect_events().await;
    }

    async fn close_transport(&mut self) {
        if let Some(mut conn) = self.connection.take() {
            let _ = tokio::time::timeout(CLOSE_GRACE, conn.writer.shutdown()).await;
        }
        self.engine.handle_transport_closed(now());
        if self.engine.state() == SessionState::Disconnected && !self.stopped {
            self.failures += 1;
        }
        self.collect_events().await;
    }

    fn handle_command(&mut self, cmd: Option<Command>) {
        let Some(cmd) = cmd else {
            // Client handles dropped - clean disconnect
            self.clients_gone = true;
            self.stopped = true;
            if matches!(
                self.engine.state(),
                SessionState::Connected | SessionState::Connecting | SessionState::Reconnecting
            ) {
                let _ = self
                    .engine
                    .disconnect(reason_code::NORMAL_DISCONNECTION, Properties::new());
            }
            return;
        };

        let now = now();
        match cmd {
            Command::Publish { publish, resp } => {
                let _ = resp.send(self.engine.publish(publish, now));
            }
            Command::Subscribe {
                filters,
                properties,
                stream,
                resp,
            } => {
                let stream_filter = filters.first().map(|(f, _)| f.clone());
                let result = self.engine.subscribe(filters, properties, now);
                if let (Ok(_), Some(tx), Some(filter)) = (&result, stream, stream_filter) {
                    self.streams.push(StreamSubscription { filter, tx });
                }
                let _ = resp.send(result);
            }
            Command::Unsubscribe {
                filters,
                properties,
                resp,
            } => {
                self.streams.retain(|s| !filters.contains(&s.filter));
                let _ = resp.send(self.engine.unsubscribe(filters, properties, now));
            }
            Command::Auth {
                reason_code,
                properties,
                resp,
            } => {
                let _ = resp.send(self.engine.auth(reason_code, properties, now));
            }
            Command::Disconnect {
                reason_code,
                properties,
                resp,
            } => {
                let result = self.engine.disconnect(reason_code, properties);
                if result.is_ok() {
                    self.stopped = true;
                }
                let _ = resp.send(result);
            }
        }
    }

    /// Move engine events to the pending queue, routing messages to streams.
    async fn collect_events(&mut self) {
        let auto_reconnect = self.engine.config().auto_reconnect;
        for event in self.engine.take_events() {
            match event {
                Event::Message(msg) => {
                    if let Some(msg) = self.route_to_stream(msg).await {
                        self.pending.push_back(Event::Message(msg));
                    }
                }
                Event::Connected { session_present } => {
                    self.failures = 0;
                    self.pending.push_back(Event::Connected { session_present });
                }
                Event::ConnectionFailed {
                    reason_code: Some(code),
                    reason,
                } => {
                    if !auto_reconnect {
                        self.refused = Some(code);
                    }
                    self.pending.push_back(Event::ConnectionFailed {
                        reason_code: Some(code),
                        reason,
                    });
                }
                other => self.pending.push_back(other),
            }
        }
    }

    /// Route a message to the first matching stream.
    ///
    /// Returns the message back when no stream matched.
    async fn route_to_stream(&mut self, msg: Message) -> Option<Message> {
        self.streams.retain(|s| !s.tx.is_closed());
        for sub in &self.streams {
            if topic::matches(&sub.filter, &msg.topic) {
                // Receiver dropped between the retain and here is fine
                let _ = sub.tx.send(msg).await;
                return None;
            }
        }
        Some(msg)
    }

    /// Check if connected to broker.
    pub fn is_connected(&self) -> bool {
        self.engine.is_connected()
    }

    /// The protocol engine, for inspecting session state.
    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Allow `poll()` to connect again after a local disconnect.
    pub fn restart(&mut self) {
        if !self.clients_gone {
            self.stopped = false;
            self.failures = 0;
        }
    }
}
