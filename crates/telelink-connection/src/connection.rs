//! Connection facade: the single object applications register with, send
//! through and pump.
//!
//! A connection is either a server accepting any number of peers, a client
//! linked to one server, or a replay of a log file. All I/O, decoding and
//! handler dispatch happen inside [`Connection::pump`], which does, in order:
//!
//! 1. accept new peers and read whatever both channels of every peer hold,
//!    waiting at most `poll_timeout` when nothing is available
//! 2. decode complete frames, translate ids and dispatch handlers
//! 3. flush the outbound queues of every peer
//!
//! [`Connection::send`] never blocks; it dispatches local handlers and queues
//! the frame for the next flush.

use crate::dispatch::{HandlerGuard, HandlerRegistry};
use crate::logger::{FileLogger, FilterVerdict, LogEntry};
use crate::peer::{description_frame, LinkPhase, PeerInfo, PeerLink};
use crate::registry::{NameRegistry, TranslationTable};
use crate::replay::LogReplay;
use crate::target::Target;
use bytes::Bytes;
use futures::future::{self, BoxFuture};
use futures::FutureExt;
use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Instant;
use telelink_types::{
    DeliveryClass, HandlerError, IdKind, LogConfig, LogMode, Message, MessageTypeId, Scope,
    SenderId, SystemType, TextSeverity, TimeVal, TransportConfig, TransportError,
    TransportResult,
};
use telelink_wire::frame::{decode_datagram, frame_limit, max_payload, try_decode, Frame};
use telelink_wire::system::{
    decode_description, encode_description, LogDescription, PingPayload, PongPayload,
    ReplayControl, TextMessage, UdpDescription,
};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Overall state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    /// Server without a ready peer.
    Listening,
    /// Client whose link is handshaking or waiting to reconnect.
    Connecting,
    /// At least one peer finished the handshake.
    Connected,
    /// Client without a link and without reconnects.
    Disconnected,
    /// Playing a log file.
    Replaying,
    Closed,
}

/// Queues messages for the next pump from anywhere, including handlers.
#[derive(Debug, Clone)]
pub struct MessageSender {
    tx: mpsc::UnboundedSender<Message>,
}

impl MessageSender {
    pub fn send(&self, message: Message) -> TransportResult<()> {
        self.tx.send(message).map_err(|_| TransportError::Closed)
    }
}

struct ReplaySession {
    replay: LogReplay,
    translation: TranslationTable,
    backlog: VecDeque<LogEntry>,
    last_tick: Instant,
}

enum Role {
    Server {
        listener: TcpListener,
    },
    Client {
        target: Target,
        next_attempt: Option<Instant>,
    },
    Replay(ReplaySession),
    Closed,
}

fn local_event(kind: SystemType) -> Message {
    Message::new(kind.id(), SenderId::CONTROL, Bytes::new()).local_only()
}

fn text_event(severity: TextSeverity, text: String) -> TransportResult<Message> {
    let payload = TextMessage::new(severity, text).encode()?;
    Ok(Message::new(SystemType::TextMessage.id(), SenderId::CONTROL, payload).local_only())
}

pub struct Connection {
    config: TransportConfig,
    role: Role,
    peers: Vec<PeerLink>,
    registry: NameRegistry,
    handlers: HandlerRegistry,
    /// Local events waiting for the next dispatch point.
    events: VecDeque<Message>,
    logger: Option<FileLogger>,
    outbox_tx: mpsc::UnboundedSender<Message>,
    outbox_rx: mpsc::UnboundedReceiver<Message>,
}

impl Connection {
    fn with_role(config: TransportConfig, role: Role) -> TransportResult<Self> {
        let (outbox_tx, outbox_rx) = mpsc::unbounded_channel();
        let log = config.log.clone();
        let mut connection = Self {
            config,
            role,
            peers: Vec::new(),
            registry: NameRegistry::new(),
            handlers: HandlerRegistry::new(),
            events: VecDeque::new(),
            logger: None,
            outbox_tx,
            outbox_rx,
        };
        if let Some(log) = log {
            connection.start_logging_with(&log)?;
        }
        Ok(connection)
    }

    /// Listen for peers on `bind_host:port`.
    pub async fn listen(config: TransportConfig) -> TransportResult<Self> {
        config.validate()?;
        let listener = TcpListener::bind((config.bind_host.as_str(), config.port)).await?;
        info!(addr = %listener.local_addr()?, "Listening for peers");
        Self::with_role(config, Role::Server { listener })
    }

    /// Connect to a remote server given as `[service@]host[:port]`.
    ///
    /// If the first attempt fails and `reconnect_interval_ms` is set, the
    /// connection is returned anyway and keeps retrying from `pump`.
    pub async fn connect(target: &str, config: TransportConfig) -> TransportResult<Self> {
        config.validate()?;
        let target: Target = target.parse()?;
        if let Target::File(_) = target {
            return Err(TransportError::InvalidTarget(target.to_string()));
        }
        let mut connection = Self::with_role(
            config,
            Role::Client {
                target,
                next_attempt: None,
            },
        )?;
        if let Err(e) = connection.try_connect().await {
            if connection.config.reconnect_interval().is_none() {
                return Err(e);
            }
            warn!(error = %e, "Initial connect failed, will retry");
            connection.schedule_reconnect();
        }
        Ok(connection)
    }

    /// Connect to a remote target, or replay a `file:` target.
    pub async fn open(target: &str, config: TransportConfig) -> TransportResult<Self> {
        match target.parse::<Target>()? {
            Target::File(path) => Self::open_replay(&path, config),
            _ => Self::connect(target, config).await,
        }
    }

    /// Replay a log file as if it were live traffic.
    pub fn open_replay(path: &Path, config: TransportConfig) -> TransportResult<Self> {
        config.validate()?;
        let replay = LogReplay::open(path)?;
        info!(path = %path.display(), entries = replay.len(), "Replaying log");
        Self::with_role(
            config,
            Role::Replay(ReplaySession {
                replay,
                translation: TranslationTable::new(),
                backlog: VecDeque::new(),
                last_tick: Instant::now(),
            }),
        )
    }

    // -----------------------------------------------------------------------
    // Registration
    // -----------------------------------------------------------------------

    /// Register a sender name. New names are described to every peer.
    pub fn register_sender(&mut self, name: &str) -> SenderId {
        let reg = self.registry.register_sender(name);
        if reg.is_new {
            self.announce(SystemType::SenderDescription, reg.id.0, name);
        }
        reg.id
    }

    /// Register a message type name. New names are described to every peer.
    pub fn register_type(&mut self, name: &str) -> MessageTypeId {
        let reg = self.registry.register_type(name);
        if reg.is_new {
            self.announce(SystemType::TypeDescription, reg.id.0, name);
        }
        reg.id
    }

    pub fn type_id(&self, name: &str) -> Option<MessageTypeId> {
        self.registry.type_id(name)
    }

    pub fn sender_id(&self, name: &str) -> Option<SenderId> {
        self.registry.sender_id(name)
    }

    pub fn registry(&self) -> &NameRegistry {
        &self.registry
    }

    fn announce(&mut self, kind: SystemType, id: i32, name: &str) {
        let frame = match description_frame(kind, id, name) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, name, "Cannot encode description");
                return;
            }
        };
        for peer in self.peers.iter_mut().filter(|p| !p.is_failed()) {
            peer.queue_frame(&frame, DeliveryClass::Reliable);
        }
        self.log_description(kind, id, name);
    }

    /// Register a handler for `(type, sender)`; either may be a wildcard.
    /// The handler stays registered while the returned guard is alive.
    pub fn register_handler<F>(
        &mut self,
        type_id: MessageTypeId,
        sender: SenderId,
        callback: F,
    ) -> HandlerGuard
    where
        F: FnMut(&Message) -> Result<(), HandlerError> + Send + 'static,
    {
        self.handlers.register(type_id, sender, Box::new(callback))
    }

    // -----------------------------------------------------------------------
    // Sending
    // -----------------------------------------------------------------------

    /// Dispatch `message` to local handlers and queue it for every peer
    /// unless it is local-only. Never blocks.
    pub fn send(&mut self, message: Message) -> TransportResult<()> {
        if matches!(self.role, Role::Closed) {
            return Err(TransportError::Closed);
        }
        self.validate_outgoing(&message)?;
        let limit = frame_limit(message.class);
        let frame = Frame::from_message(&message);
        if frame.encoded_len() > limit {
            return Err(TransportError::PayloadTooLarge {
                size: message.payload.len(),
                max: max_payload(limit),
            });
        }

        self.apply_replay_control(&message)?;
        self.handlers.dispatch(&message)?;
        if message.scope == Scope::LocalOnly {
            return Ok(());
        }
        self.log_message(&message, false);
        if self.peers.is_empty() {
            return Ok(());
        }
        let bytes = frame.encode(limit)?;
        for peer in self.peers.iter_mut().filter(|p| !p.is_failed()) {
            peer.queue_frame(&bytes, message.class);
        }
        Ok(())
    }

    /// Send a severity-tagged text message from `sender`.
    pub fn send_text(
        &mut self,
        sender: SenderId,
        severity: TextSeverity,
        text: &str,
    ) -> TransportResult<()> {
        let payload = TextMessage::new(severity, text).encode()?;
        self.send(Message::new(SystemType::TextMessage.id(), sender, payload))
    }

    /// Handle for queuing messages from handlers or other code.
    pub fn message_sender(&self) -> MessageSender {
        MessageSender {
            tx: self.outbox_tx.clone(),
        }
    }

    fn validate_outgoing(&self, message: &Message) -> TransportResult<()> {
        let type_known = if message.type_id.is_user() {
            self.registry.type_name(message.type_id).is_some()
        } else {
            message.type_id == SystemType::TextMessage.id()
        };
        if !type_known {
            return Err(TransportError::UnknownLocalId {
                kind: IdKind::Type,
                id: message.type_id.0,
            });
        }
        let sender_known = if message.sender.is_user() {
            self.registry.sender_name(message.sender).is_some()
        } else {
            message.sender == SenderId::CONTROL && !message.type_id.is_user()
        };
        if !sender_known {
            return Err(TransportError::UnknownLocalId {
                kind: IdKind::Sender,
                id: message.sender.0,
            });
        }
        Ok(())
    }

    fn apply_replay_control(&mut self, message: &Message) -> TransportResult<()> {
        let Role::Replay(session) = &mut self.role else {
            return Ok(());
        };
        let Some(name) = self.registry.type_name(message.type_id) else {
            return Ok(());
        };
        if let Some(control) = ReplayControl::decode(name, &message.payload)? {
            debug!(?control, "Applying replay control");
            if control == ReplayControl::Reset {
                session.backlog.clear();
            }
            let due = session.replay.apply(control)?;
            session.backlog.extend(due);
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Logging
    // -----------------------------------------------------------------------

    /// Start logging to a new file.
    pub fn start_logging(&mut self, path: impl Into<PathBuf>, mode: LogMode) -> TransportResult<()> {
        self.start_logging_with(&LogConfig::new(path, mode))
    }

    fn start_logging_with(&mut self, config: &LogConfig) -> TransportResult<()> {
        if self.logger.is_some() {
            return Err(TransportError::Log("logging is already active".into()));
        }
        self.logger = Some(FileLogger::create(config)?);

        let senders: Vec<(i32, String)> = self
            .registry
            .senders()
            .map(|(id, name)| (id.0, name.to_string()))
            .collect();
        let types: Vec<(i32, String)> = self
            .registry
            .types()
            .map(|(id, name)| (id.0, name.to_string()))
            .collect();
        for (id, name) in senders {
            self.log_description(SystemType::SenderDescription, id, &name);
        }
        for (id, name) in types {
            self.log_description(SystemType::TypeDescription, id, &name);
        }
        Ok(())
    }

    /// Flush and close the active log, if any.
    pub fn stop_logging(&mut self) -> TransportResult<()> {
        if let Some(mut logger) = self.logger.take() {
            logger.flush()?;
            info!(path = %logger.path().display(), entries = logger.recorded(), "Logging stopped");
        }
        Ok(())
    }

    pub fn is_logging(&self) -> bool {
        self.logger.is_some()
    }

    /// Add a filter to the active log. Filters only see user messages.
    pub fn register_log_filter<F>(&mut self, filter: F) -> TransportResult<()>
    where
        F: FnMut(MessageTypeId, SenderId) -> FilterVerdict + Send + 'static,
    {
        let logger = self
            .logger
            .as_mut()
            .ok_or_else(|| TransportError::Log("logging is not active".into()))?;
        logger.add_filter(Box::new(filter));
        Ok(())
    }

    /// Ask every ready peer to log its traffic to `path` on its side.
    pub fn request_remote_logging(&mut self, path: &str, mode: LogMode) -> TransportResult<()> {
        let payload = LogDescription {
            mode,
            path: path.to_string(),
        }
        .encode()?;
        for peer in self.peers.iter_mut().filter(|p| p.is_ready()) {
            peer.queue_system(SystemType::LogDescription, SenderId::CONTROL, payload.clone())?;
        }
        Ok(())
    }

    fn log_description(&mut self, kind: SystemType, id: i32, name: &str) {
        let Some(logger) = self.logger.as_mut() else {
            return;
        };
        let payload = match encode_description(name) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, name, "Cannot encode description for log");
                return;
            }
        };
        if let Err(e) = logger.record(&Message::new(kind.id(), SenderId(id), payload)) {
            warn!(error = %e, path = %logger.path().display(), "Failed to record description");
        }
    }

    fn log_message(&mut self, message: &Message, incoming: bool) {
        let Some(logger) = self.logger.as_mut() else {
            return;
        };
        let wanted = if incoming {
            logger.mode().logs_incoming()
        } else {
            logger.mode().logs_outgoing()
        };
        if !wanted {
            return;
        }
        if let Err(e) = logger.record(message) {
            warn!(error = %e, path = %logger.path().display(), "Failed to record message");
        }
    }

    // -----------------------------------------------------------------------
    // Status
    // -----------------------------------------------------------------------

    pub fn status(&self) -> ConnectionStatus {
        match &self.role {
            Role::Closed => ConnectionStatus::Closed,
            Role::Replay(_) => ConnectionStatus::Replaying,
            _ if self.peers.iter().any(|p| p.is_ready() && !p.is_failed()) => {
                ConnectionStatus::Connected
            }
            Role::Server { .. } => ConnectionStatus::Listening,
            Role::Client { .. } if !self.peers.is_empty() => ConnectionStatus::Connecting,
            Role::Client {
                next_attempt: Some(_),
                ..
            } => ConnectionStatus::Connecting,
            Role::Client { .. } => ConnectionStatus::Disconnected,
        }
    }

    /// Address the server listens on.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match &self.role {
            Role::Server { listener } => listener.local_addr().ok(),
            _ => None,
        }
    }

    pub fn peers(&self) -> Vec<PeerInfo> {
        self.peers.iter().map(PeerLink::info).collect()
    }

    pub fn replay(&self) -> Option<&LogReplay> {
        match &self.role {
            Role::Replay(session) => Some(&session.replay),
            _ => None,
        }
    }

    /// File time played so far, for log-backed connections.
    pub fn elapsed_replay_time(&self) -> Option<std::time::Duration> {
        self.replay().map(LogReplay::elapsed)
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// Drop every peer and stop. Queued outbound data is discarded; drop
    /// events are dispatched by the next `pump`.
    pub fn close(&mut self) {
        if matches!(self.role, Role::Closed) {
            return;
        }
        let had_ready = self.peers.iter().any(PeerLink::is_ready);
        for mut link in self.peers.drain(..) {
            link.discard_outbound();
            if link.is_ready() {
                self.events
                    .push_back(local_event(SystemType::DroppedConnection));
            }
        }
        if had_ready {
            self.events
                .push_back(local_event(SystemType::DroppedLastConnection));
        }
        if let Err(e) = self.stop_logging() {
            warn!(error = %e, "Failed to flush log on close");
        }
        self.role = Role::Closed;
        info!("Connection closed");
    }

    // -----------------------------------------------------------------------
    // Pump
    // -----------------------------------------------------------------------

    /// Advance I/O, decoding and dispatch by one step.
    ///
    /// A handler error stops processing and is returned; undecoded input
    /// stays buffered for the next call.
    pub async fn pump(&mut self) -> TransportResult<()> {
        self.drain_outbox()?;
        self.dispatch_events()?;
        match self.role {
            Role::Closed => return Ok(()),
            Role::Replay(_) => return self.pump_replay().await,
            _ => {}
        }
        self.maintain_client().await;

        if !self.read_all() && !self.has_pending_work() {
            self.wait_for_input().await;
            self.read_all();
        }
        let processed = self.process_inbound();
        self.check_clocks();
        self.flush_all().await;
        self.reap_failed();
        processed?;
        self.dispatch_events()
    }

    fn drain_outbox(&mut self) -> TransportResult<()> {
        while let Ok(message) = self.outbox_rx.try_recv() {
            match self.send(message) {
                Ok(()) => {}
                Err(TransportError::Handler(e)) => return Err(e.into()),
                Err(e) => warn!(error = %e, "Dropping queued message"),
            }
        }
        Ok(())
    }

    fn dispatch_events(&mut self) -> TransportResult<()> {
        while let Some(event) = self.events.pop_front() {
            self.handlers.dispatch(&event)?;
        }
        Ok(())
    }

    fn dispatch_now(&mut self, message: Message) -> TransportResult<()> {
        self.handlers.dispatch(&message)?;
        Ok(())
    }

    fn has_pending_work(&self) -> bool {
        self.peers
            .iter()
            .any(|p| {
                p.has_outbound() || !p.datagrams_in.is_empty() || !p.datagram_frames.is_empty()
            })
    }

    async fn try_connect(&mut self) -> TransportResult<()> {
        let Role::Client { target, .. } = &self.role else {
            return Ok(());
        };
        let addr = target
            .socket_addr_string()
            .ok_or_else(|| TransportError::InvalidTarget(target.to_string()))?;
        let stream =
            match tokio::time::timeout(self.config.connect_timeout(), TcpStream::connect(&addr))
                .await
            {
                Ok(result) => result?,
                Err(_) => {
                    return Err(TransportError::Io(io::Error::new(
                        io::ErrorKind::TimedOut,
                        format!("connect to {addr} timed out"),
                    )))
                }
            };
        let link = PeerLink::open(stream, &self.config, &self.registry)?;
        info!(peer = %link.addr, "Connected to server");
        self.peers.push(link);
        Ok(())
    }

    fn schedule_reconnect(&mut self) {
        let interval = self.config.reconnect_interval();
        if let Role::Client { next_attempt, .. } = &mut self.role {
            *next_attempt = interval.map(|d| Instant::now() + d);
        }
    }

    async fn maintain_client(&mut self) {
        let due = match &self.role {
            Role::Client {
                next_attempt: Some(at),
                ..
            } => self.peers.is_empty() && Instant::now() >= *at,
            _ => false,
        };
        if !due {
            return;
        }
        match self.try_connect().await {
            Ok(()) => {
                if let Role::Client { next_attempt, .. } = &mut self.role {
                    *next_attempt = None;
                }
            }
            Err(e) => {
                debug!(error = %e, "Reconnect attempt failed");
                self.schedule_reconnect();
            }
        }
    }

    /// Accept pending peers and read every channel without waiting.
    fn read_all(&mut self) -> bool {
        let mut accepted = Vec::new();
        if let Role::Server { listener } = &self.role {
            while let Some(result) = listener.accept().now_or_never() {
                match result {
                    Ok(conn) => accepted.push(conn),
                    Err(e) => {
                        warn!(error = %e, "Accept failed");
                        break;
                    }
                }
            }
        }
        let mut progressed = !accepted.is_empty();
        for (stream, addr) in accepted {
            self.adopt(stream, addr);
        }
        for peer in self.peers.iter_mut() {
            progressed |= peer.read_available();
        }
        progressed
    }

    fn adopt(&mut self, stream: TcpStream, addr: SocketAddr) {
        match PeerLink::open(stream, &self.config, &self.registry) {
            Ok(link) => {
                info!(peer = %addr, "Accepted peer");
                self.peers.push(link);
            }
            Err(e) => warn!(peer = %addr, error = %e, "Failed to set up peer link"),
        }
    }

    /// The pump's only suspension point: wait up to `poll_timeout` for a new
    /// peer or for any channel to become readable.
    async fn wait_for_input(&mut self) {
        let timeout = self.config.poll_timeout();
        let accepted = {
            let mut waits: Vec<BoxFuture<'_, Option<(TcpStream, SocketAddr)>>> = Vec::new();
            if let Role::Server { listener } = &self.role {
                waits.push(Box::pin(async move { listener.accept().await.ok() }));
            }
            for peer in self.peers.iter().filter(|p| !p.is_failed()) {
                waits.push(Box::pin(async move {
                    peer.readable().await;
                    None::<(TcpStream, SocketAddr)>
                }));
            }
            if waits.is_empty() {
                tokio::time::sleep(timeout).await;
                return;
            }
            match tokio::time::timeout(timeout, future::select_all(waits)).await {
                Ok((accepted, _, _)) => accepted,
                Err(_) => None,
            }
        };
        if let Some((stream, addr)) = accepted {
            self.adopt(stream, addr);
        }
    }

    fn process_inbound(&mut self) -> TransportResult<()> {
        for idx in 0..self.peers.len() {
            if self.peers[idx].is_failed() {
                continue;
            }
            match self.peers[idx].take_cookie() {
                Ok(true) => {}
                Ok(false) => continue,
                Err(e) => {
                    warn!(peer = %self.peers[idx].addr, error = %e, "Handshake rejected");
                    self.peers[idx].fail(e);
                    continue;
                }
            }
            self.release_held(idx)?;

            while !self.peers[idx].is_failed() {
                let frame = match try_decode(&mut self.peers[idx].reliable.inbound) {
                    Ok(Some(frame)) => frame,
                    Ok(None) => break,
                    Err(e) => {
                        warn!(peer = %self.peers[idx].addr, error = %e, "Corrupt stream");
                        self.peers[idx].fail(e);
                        break;
                    }
                };
                self.handle_frame(idx, frame)?;
            }

            // Frames left over when a handler failed are handled first.
            loop {
                if let Some(frame) = self.peers[idx].datagram_frames.pop_front() {
                    self.handle_frame(idx, frame)?;
                    continue;
                }
                let Some(datagram) = self.peers[idx].next_datagram() else {
                    break;
                };
                match decode_datagram(&datagram) {
                    Ok(frames) => self.peers[idx].datagram_frames.extend(frames),
                    Err(e) => {
                        warn!(peer = %self.peers[idx].addr, error = %e, "Dropping malformed datagram")
                    }
                }
            }
        }
        Ok(())
    }

    fn handle_frame(&mut self, idx: usize, frame: Frame) -> TransportResult<()> {
        self.peers[idx].stats.frames_in += 1;
        let Some(kind) = SystemType::from_id(frame.type_id) else {
            if !frame.type_id.is_user() {
                warn!(peer = %self.peers[idx].addr, type_id = frame.type_id.0, "Dropping frame with reserved type id");
                return Ok(());
            }
            if self.peers[idx].is_ready() {
                return self.deliver_user_frame(idx, frame);
            }
            self.peers[idx].held.push_back(frame);
            return Ok(());
        };
        match self.handle_system_frame(idx, kind, frame) {
            Err(TransportError::Codec(e)) => {
                warn!(peer = %self.peers[idx].addr, kind = ?kind, error = %e, "Dropping malformed system message");
                Ok(())
            }
            other => other,
        }
    }

    fn handle_system_frame(
        &mut self,
        idx: usize,
        kind: SystemType,
        frame: Frame,
    ) -> TransportResult<()> {
        let peer_addr = self.peers[idx].addr;
        match kind {
            SystemType::SenderDescription => {
                let name = decode_description(&frame.payload)?;
                let reg = self.peers[idx].translation.learn_sender(
                    frame.sender_id,
                    &name,
                    &mut self.registry,
                );
                debug!(peer = %peer_addr, remote_id = frame.sender_id.0, local_id = reg.id.0, name = %name, "Learned sender");
                if reg.is_new {
                    self.announce(kind, reg.id.0, &name);
                }
                self.dispatch_now(Message {
                    sender: reg.id,
                    ..frame.into_message()
                })
            }
            SystemType::TypeDescription => {
                let name = decode_description(&frame.payload)?;
                let reg = self.peers[idx].translation.learn_type(
                    MessageTypeId(frame.sender_id.0),
                    &name,
                    &mut self.registry,
                );
                debug!(peer = %peer_addr, remote_id = frame.sender_id.0, local_id = reg.id.0, name = %name, "Learned type");
                if reg.is_new {
                    self.announce(kind, reg.id.0, &name);
                }
                self.dispatch_now(Message {
                    sender: SenderId(reg.id.0),
                    ..frame.into_message()
                })
            }
            SystemType::UdpDescription => {
                let desc = UdpDescription::decode(frame.sender_id, &frame.payload)?;
                self.peers[idx].set_datagram_remote(&desc);
                debug!(peer = %peer_addr, host = %desc.host, port = desc.port, "Peer datagram channel advertised");
                Ok(())
            }
            SystemType::LogDescription => {
                let desc = LogDescription::decode(&frame.payload)?;
                if self.logger.is_some() {
                    warn!(peer = %peer_addr, path = %desc.path, "Ignoring log request, already logging");
                    return Ok(());
                }
                info!(peer = %peer_addr, path = %desc.path, "Peer requested logging");
                if let Err(e) = self.start_logging(desc.path.as_str(), desc.mode) {
                    warn!(error = %e, path = %desc.path, "Could not start requested log");
                    let text = format!("could not start log {}: {e}", desc.path);
                    self.dispatch_now(text_event(TextSeverity::Warning, text)?)?;
                }
                Ok(())
            }
            SystemType::TextMessage => {
                TextMessage::decode(&frame.payload)?;
                let Some(sender) = self.peers[idx].translation.translate_sender(frame.sender_id)
                else {
                    return self.report_unknown(idx, IdKind::Sender, frame.sender_id.0);
                };
                let message = Message {
                    sender,
                    ..frame.into_message()
                };
                self.log_message(&message, true);
                self.dispatch_now(message)
            }
            SystemType::Ping => {
                let ping = PingPayload::decode(&frame.payload)?;
                let pong = PongPayload::reply_to(&ping, TimeVal::now());
                self.peers[idx].queue_system(SystemType::Pong, SenderId::CONTROL, pong.encode()?)
            }
            SystemType::Pong => {
                let pong = PongPayload::decode(&frame.payload)?;
                let Some(trip) = self.peers[idx].clock.on_pong(&pong, Instant::now()) else {
                    debug!(peer = %peer_addr, nonce = pong.nonce, "Ignoring stale pong");
                    return Ok(());
                };
                debug!(
                    peer = %peer_addr,
                    rtt_us = trip.rtt.as_micros() as u64,
                    offset_us = trip.clock_offset_micros,
                    "Round trip measured"
                );
                if self.peers[idx].phase == LinkPhase::Handshaking {
                    self.link_ready(idx)?;
                }
                Ok(())
            }
            SystemType::GotConnection
            | SystemType::GotFirstConnection
            | SystemType::DroppedConnection
            | SystemType::DroppedLastConnection => {
                debug!(peer = %peer_addr, kind = ?kind, "Ignoring connection event sent by peer");
                Ok(())
            }
        }
    }

    fn link_ready(&mut self, idx: usize) -> TransportResult<()> {
        self.peers[idx].phase = LinkPhase::Ready;
        let ready = self
            .peers
            .iter()
            .filter(|p| p.is_ready() && !p.is_failed())
            .count();
        info!(peer = %self.peers[idx].addr, peers = ready, "Peer handshake complete");
        if ready == 1 {
            self.dispatch_now(local_event(SystemType::GotFirstConnection))?;
        }
        self.dispatch_now(local_event(SystemType::GotConnection))?;
        self.release_held(idx)
    }

    fn release_held(&mut self, idx: usize) -> TransportResult<()> {
        if !self.peers[idx].is_ready() {
            return Ok(());
        }
        while let Some(frame) = self.peers[idx].held.pop_front() {
            self.deliver_user_frame(idx, frame)?;
        }
        Ok(())
    }

    fn deliver_user_frame(&mut self, idx: usize, frame: Frame) -> TransportResult<()> {
        let (type_id, sender) = match self.peers[idx].translate(&frame) {
            Ok(ids) => ids,
            Err((kind, remote_id)) => return self.report_unknown(idx, kind, remote_id),
        };
        let message = Message {
            type_id,
            sender,
            ..frame.into_message()
        };
        self.log_message(&message, true);
        self.dispatch_now(message)
    }

    /// Drop a frame that uses an undescribed id and tell the handlers once.
    fn report_unknown(&mut self, idx: usize, kind: IdKind, remote_id: i32) -> TransportResult<()> {
        let peer = &mut self.peers[idx];
        peer.stats.unknown_ids += 1;
        let err = TransportError::UnknownRemoteId { kind, remote_id };
        warn!(peer = %peer.addr, error = %err, "Dropping frame with undescribed id");
        let text = format!("{err} from {}", peer.addr);
        self.dispatch_now(text_event(TextSeverity::Error, text)?)
    }

    fn check_clocks(&mut self) {
        let now = Instant::now();
        for peer in self.peers.iter_mut().filter(|p| !p.is_failed()) {
            if let Err(e) = peer.clock.check(now) {
                warn!(peer = %peer.addr, error = %e, "Peer missed its pong");
                peer.fail(e);
                continue;
            }
            if peer.is_ready() && peer.clock.ping_due(now) {
                if let Err(e) = peer.send_ping(now) {
                    warn!(peer = %peer.addr, error = %e, "Failed to queue ping");
                }
            }
        }
    }

    async fn flush_all(&mut self) {
        let wait = self.config.poll_timeout();
        for peer in self.peers.iter_mut() {
            peer.flush(wait).await;
        }
    }

    /// Remove failed links and queue the matching connection events.
    fn reap_failed(&mut self) {
        if !self.peers.iter().any(PeerLink::is_failed) {
            return;
        }
        let (failed, live): (Vec<PeerLink>, Vec<PeerLink>) =
            std::mem::take(&mut self.peers)
                .into_iter()
                .partition(PeerLink::is_failed);
        self.peers = live;

        let mut dropped_ready = false;
        for mut link in failed {
            link.discard_outbound();
            link.translation.clear();
            let reason = link
                .failure
                .take()
                .map(|e| e.to_string())
                .unwrap_or_default();
            if link.is_ready() {
                info!(peer = %link.addr, reason = %reason, "Peer dropped");
                self.events
                    .push_back(local_event(SystemType::DroppedConnection));
                dropped_ready = true;
            } else {
                warn!(peer = %link.addr, reason = %reason, "Handshake failed");
                match text_event(
                    TextSeverity::Error,
                    format!("handshake with {} failed: {reason}", link.addr),
                ) {
                    Ok(event) => self.events.push_back(event),
                    Err(e) => warn!(error = %e, "Cannot encode handshake failure notice"),
                }
            }
        }
        if dropped_ready && !self.peers.iter().any(PeerLink::is_ready) {
            self.events
                .push_back(local_event(SystemType::DroppedLastConnection));
        }
        if self.peers.is_empty() {
            self.schedule_reconnect();
        }
    }

    // -----------------------------------------------------------------------
    // Replay
    // -----------------------------------------------------------------------

    fn advance_replay(&mut self) -> bool {
        let Role::Replay(session) = &mut self.role else {
            return false;
        };
        let now = Instant::now();
        let wall = now.saturating_duration_since(session.last_tick);
        session.last_tick = now;
        let due = session.replay.advance(wall);
        session.backlog.extend(due);
        !session.backlog.is_empty()
    }

    async fn pump_replay(&mut self) -> TransportResult<()> {
        if !self.advance_replay() {
            let poll = self.config.poll_timeout();
            let wait = match &self.role {
                Role::Replay(session) => session
                    .replay
                    .time_to_next()
                    .map_or(poll, |d| d.min(poll)),
                _ => poll,
            };
            tokio::time::sleep(wait).await;
            self.advance_replay();
        }
        loop {
            let entry = match &mut self.role {
                Role::Replay(session) => session.backlog.pop_front(),
                _ => None,
            };
            let Some(entry) = entry else {
                break;
            };
            self.deliver_replayed(entry.message)?;
        }
        Ok(())
    }

    fn deliver_replayed(&mut self, message: Message) -> TransportResult<()> {
        let Role::Replay(session) = &mut self.role else {
            return Ok(());
        };
        let translation = &mut session.translation;
        match SystemType::from_id(message.type_id) {
            Some(kind) if kind.is_description() => {
                let name = match decode_description(&message.payload) {
                    Ok(name) => name,
                    Err(e) => {
                        warn!(error = %e, "Skipping malformed description in log");
                        return Ok(());
                    }
                };
                let local = if kind == SystemType::SenderDescription {
                    translation
                        .learn_sender(message.sender, &name, &mut self.registry)
                        .id
                        .0
                } else {
                    translation
                        .learn_type(MessageTypeId(message.sender.0), &name, &mut self.registry)
                        .id
                        .0
                };
                self.dispatch_now(Message {
                    sender: SenderId(local),
                    ..message
                })
            }
            Some(SystemType::TextMessage) => match translation.translate_sender(message.sender) {
                Some(sender) => self.dispatch_now(Message { sender, ..message }),
                None => self.report_unknown_in_log(IdKind::Sender, message.sender.0),
            },
            Some(_) => Ok(()),
            None => {
                let type_id = translation.translate_type(message.type_id);
                let sender = translation.translate_sender(message.sender);
                match (type_id, sender) {
                    (Some(type_id), Some(sender)) => self.dispatch_now(Message {
                        type_id,
                        sender,
                        ..message
                    }),
                    (None, _) => self.report_unknown_in_log(IdKind::Type, message.type_id.0),
                    (_, None) => self.report_unknown_in_log(IdKind::Sender, message.sender.0),
                }
            }
        }
    }

    fn report_unknown_in_log(&mut self, kind: IdKind, remote_id: i32) -> TransportResult<()> {
        let err = TransportError::UnknownRemoteId { kind, remote_id };
        warn!(error = %err, "Dropping logged message with undescribed id");
        self.dispatch_now(text_event(TextSeverity::Error, format!("{err} in log"))?)
    }
}
