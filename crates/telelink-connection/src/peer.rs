//! One live link to a remote peer.
//!
//! A link owns its two channels, its translation table and its clock
//! synchronizer. Opening a link queues, in order: the cookie, our UDP
//! description, a description for every locally registered name, and the
//! first ping. Inbound user frames are held until that ping is answered.

use crate::channel::{DatagramChannel, ReadOutcome, ReliableChannel};
use crate::clock::{ClockSync, RoundTrip};
use crate::registry::{NameRegistry, TranslationTable};
use bytes::Bytes;
use std::collections::VecDeque;
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};
use telelink_types::{
    DeliveryClass, IdKind, MessageTypeId, SenderId, SystemType, TimeVal, TransportConfig,
    TransportError, TransportResult,
};
use telelink_wire::cookie::{check_cookie, cookie, COOKIE_LEN};
use telelink_wire::frame::{Frame, MAX_FRAME_LEN};
use telelink_wire::system::{encode_description, UdpDescription};
use tokio::net::TcpStream;
use tracing::debug;

/// Handshake progress of a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkPhase {
    /// Waiting for the peer's cookie.
    AwaitingCookie,
    /// Cookie accepted, waiting for the first pong.
    Handshaking,
    /// User traffic flows.
    Ready,
}

/// Per-link counters. A new link starts from zero.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LinkStats {
    pub frames_in: u64,
    pub frames_out: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub datagrams_in: u64,
    pub datagrams_dropped: u64,
    /// Datagrams ignored because they did not come from the advertised address.
    pub datagrams_rejected: u64,
    pub unknown_ids: u64,
}

/// Snapshot of a link for status reporting.
#[derive(Debug, Clone)]
pub struct PeerInfo {
    pub addr: SocketAddr,
    pub phase: LinkPhase,
    pub stats: LinkStats,
    pub round_trip: Option<RoundTrip>,
    pub datagram_remote: Option<SocketAddr>,
}

/// Encode a sender or type description frame.
pub(crate) fn description_frame(kind: SystemType, id: i32, name: &str) -> TransportResult<Bytes> {
    system_frame(kind, SenderId(id), encode_description(name)?)
}

/// Encode a reliable system frame stamped now.
pub(crate) fn system_frame(
    kind: SystemType,
    sender_field: SenderId,
    payload: Bytes,
) -> TransportResult<Bytes> {
    Frame {
        type_id: kind.id(),
        sender_id: sender_field,
        time: TimeVal::now(),
        class: DeliveryClass::Reliable,
        payload,
    }
    .encode(MAX_FRAME_LEN)
}

pub(crate) struct PeerLink {
    pub addr: SocketAddr,
    pub phase: LinkPhase,
    pub reliable: ReliableChannel,
    pub datagram: DatagramChannel,
    pub translation: TranslationTable,
    pub clock: ClockSync,
    /// User frames received before the handshake completed.
    pub held: VecDeque<Frame>,
    /// Datagrams read but not yet decoded, with their source.
    pub datagrams_in: VecDeque<(SocketAddr, Bytes)>,
    /// Frames decoded from a datagram but not yet handled.
    pub datagram_frames: VecDeque<Frame>,
    pub stats: LinkStats,
    pub failure: Option<TransportError>,
}

impl PeerLink {
    /// Wrap a freshly connected stream and queue the opening handshake.
    pub fn open(
        stream: TcpStream,
        config: &TransportConfig,
        registry: &NameRegistry,
    ) -> TransportResult<Self> {
        let addr = stream.peer_addr()?;
        let local = stream.local_addr()?;
        let reliable = ReliableChannel::new(stream)?;
        let datagram = DatagramChannel::bind(local, config.low_latency_backlog)?;
        let udp = UdpDescription {
            host: local.ip().to_string(),
            port: datagram.local_addr()?.port(),
        };

        let mut link = Self {
            addr,
            phase: LinkPhase::AwaitingCookie,
            reliable,
            datagram,
            translation: TranslationTable::new(),
            clock: ClockSync::new(config.ping_timeout(), config.ping_interval()),
            held: VecDeque::new(),
            datagrams_in: VecDeque::new(),
            datagram_frames: VecDeque::new(),
            stats: LinkStats::default(),
            failure: None,
        };

        link.reliable.queue(&cookie());
        let (port_field, payload) = udp.encode()?;
        link.queue_system(SystemType::UdpDescription, port_field, payload)?;
        for (id, name) in registry.senders() {
            let frame = description_frame(SystemType::SenderDescription, id.0, name)?;
            link.queue_frame(&frame, DeliveryClass::Reliable);
        }
        for (id, name) in registry.types() {
            let frame = description_frame(SystemType::TypeDescription, id.0, name)?;
            link.queue_frame(&frame, DeliveryClass::Reliable);
        }
        link.send_ping(Instant::now())?;
        debug!(peer = %addr, udp_port = udp.port, "Link opened, handshake queued");
        Ok(link)
    }

    /// Queue an encoded frame. Low-latency frames fall back to the reliable
    /// stream until the peer has told us where its datagram socket is.
    pub fn queue_frame(&mut self, bytes: &[u8], class: DeliveryClass) {
        match class {
            DeliveryClass::LowLatency if self.datagram.remote().is_some() => {
                self.datagram.queue(bytes)
            }
            _ => self.reliable.queue(bytes),
        }
        self.stats.frames_out += 1;
        self.stats.bytes_out += bytes.len() as u64;
    }

    pub fn queue_system(
        &mut self,
        kind: SystemType,
        sender_field: SenderId,
        payload: Bytes,
    ) -> TransportResult<()> {
        let bytes = system_frame(kind, sender_field, payload)?;
        self.queue_frame(&bytes, DeliveryClass::Reliable);
        Ok(())
    }

    pub fn send_ping(&mut self, now: Instant) -> TransportResult<()> {
        let ping = self.clock.begin(now, TimeVal::now());
        self.queue_system(SystemType::Ping, SenderId::CONTROL, ping.encode()?)
    }

    /// Record the first failure. The link is removed at the end of the pump.
    pub fn fail(&mut self, err: TransportError) {
        if self.failure.is_none() {
            self.failure = Some(err);
        }
    }

    pub fn is_failed(&self) -> bool {
        self.failure.is_some()
    }

    pub fn is_ready(&self) -> bool {
        self.phase == LinkPhase::Ready
    }

    /// Pull everything available from both channels. Returns whether any
    /// bytes arrived.
    pub fn read_available(&mut self) -> bool {
        if self.is_failed() {
            return false;
        }
        let mut progressed = false;
        match self.reliable.read_available() {
            Ok(ReadOutcome::Data(n)) => {
                self.stats.bytes_in += n as u64;
                progressed = true;
            }
            Ok(ReadOutcome::Idle) => {}
            Ok(ReadOutcome::Closed) => {
                self.fail(TransportError::Disconnected);
                return true;
            }
            Err(e) => {
                self.fail(TransportError::Io(e));
                return true;
            }
        }
        match self.datagram.recv_available() {
            Ok(datagrams) => {
                progressed |= !datagrams.is_empty();
                self.stats.datagrams_in += datagrams.len() as u64;
                self.datagrams_in.extend(datagrams);
            }
            Err(e) => self.fail(TransportError::Io(e)),
        }
        progressed
    }

    /// Consume the peer's cookie once enough bytes have arrived.
    pub fn take_cookie(&mut self) -> TransportResult<bool> {
        if self.phase != LinkPhase::AwaitingCookie {
            return Ok(true);
        }
        if self.reliable.inbound.len() < COOKIE_LEN {
            return Ok(false);
        }
        let remote = self.reliable.inbound.split_to(COOKIE_LEN);
        check_cookie(&remote)?;
        self.phase = LinkPhase::Handshaking;
        Ok(true)
    }

    /// Point the datagram channel at the address the peer advertised. An
    /// unusable host falls back to the stream's peer address.
    pub fn set_datagram_remote(&mut self, desc: &UdpDescription) {
        let ip = desc
            .host
            .parse::<IpAddr>()
            .ok()
            .filter(|ip| !ip.is_unspecified())
            .unwrap_or_else(|| self.addr.ip());
        self.datagram.set_remote(SocketAddr::new(ip, desc.port));
    }

    /// Next datagram sent from the peer's advertised address. Datagrams
    /// from anywhere else, or from before the address is known, are dropped.
    pub fn next_datagram(&mut self) -> Option<Bytes> {
        while let Some((from, datagram)) = self.datagrams_in.pop_front() {
            if self.datagram.remote() == Some(from) {
                return Some(datagram);
            }
            self.stats.datagrams_rejected += 1;
            debug!(peer = %self.addr, %from, "Ignoring datagram from unexpected source");
        }
        None
    }

    /// Map a user frame's ids to local ids, or report the first unknown one.
    /// Both ids must be user ids the peer has described; wildcards and
    /// reserved ids are never accepted on user traffic.
    pub fn translate(&self, frame: &Frame) -> Result<(MessageTypeId, SenderId), (IdKind, i32)> {
        let type_id = Some(frame.type_id)
            .filter(|id| id.is_user())
            .and_then(|id| self.translation.translate_type(id))
            .ok_or((IdKind::Type, frame.type_id.0))?;
        let sender = Some(frame.sender_id)
            .filter(|id| id.is_user())
            .and_then(|id| self.translation.translate_sender(id))
            .ok_or((IdKind::Sender, frame.sender_id.0))?;
        Ok((type_id, sender))
    }

    /// Write queued data on both channels.
    pub async fn flush(&mut self, wait: Duration) {
        if self.is_failed() {
            return;
        }
        if let Err(e) = self.reliable.flush(wait).await {
            self.fail(TransportError::Io(e));
            return;
        }
        let dropped_before = self.datagram.dropped();
        if let Err(e) = self.datagram.flush(wait).await {
            self.fail(TransportError::Io(e));
        }
        self.stats.datagrams_dropped += self.datagram.dropped() - dropped_before;
    }

    pub fn has_outbound(&self) -> bool {
        self.reliable.pending_out() > 0 || self.datagram.pending_out() > 0
    }

    /// Drop everything still queued for this peer.
    pub fn discard_outbound(&mut self) {
        self.reliable.discard_outbound();
        self.datagram.discard_outbound();
    }

    /// Resolves when either channel may have data.
    pub async fn readable(&self) {
        tokio::select! {
            _ = self.reliable.readable() => {}
            _ = self.datagram.readable() => {}
        }
    }

    pub fn info(&self) -> PeerInfo {
        PeerInfo {
            addr: self.addr,
            phase: self.phase,
            stats: self.stats.clone(),
            round_trip: self.clock.last_round_trip(),
            datagram_remote: self.datagram.remote(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;
    use telelink_wire::frame::try_decode;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    async fn make_link(registry: &NameRegistry) -> (PeerLink, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        let config = TransportConfig::default();
        (PeerLink::open(server, &config, registry).unwrap(), client)
    }

    #[tokio::test]
    async fn test_open_queues_handshake_in_order() {
        let mut registry = NameRegistry::new();
        registry.register_sender("Tracker0");
        registry.register_type("Pose");
        let (mut link, mut client) = make_link(&registry).await;
        link.flush(Duration::from_secs(1)).await;
        assert!(!link.is_failed());

        let mut cookie_buf = [0u8; COOKIE_LEN];
        client.read_exact(&mut cookie_buf).await.unwrap();
        assert!(check_cookie(&cookie_buf).is_ok());

        let mut buf = BytesMut::new();
        let mut kinds = Vec::new();
        while kinds.len() < 4 {
            match try_decode(&mut buf).unwrap() {
                Some(frame) => kinds.push(SystemType::from_id(frame.type_id).unwrap()),
                None => {
                    client.read_buf(&mut buf).await.unwrap();
                }
            }
        }
        assert_eq!(
            kinds,
            vec![
                SystemType::UdpDescription,
                SystemType::SenderDescription,
                SystemType::TypeDescription,
                SystemType::Ping,
            ]
        );
        assert!(link.clock.is_waiting());
    }

    #[tokio::test]
    async fn test_cookie_gates_handshake() {
        let registry = NameRegistry::new();
        let (mut link, mut client) = make_link(&registry).await;
        assert_eq!(link.phase, LinkPhase::AwaitingCookie);

        client.write_all(&cookie()[..10]).await.unwrap();
        while link.reliable.inbound.len() < 10 {
            link.readable().await;
            link.read_available();
        }
        assert!(!link.take_cookie().unwrap());

        client.write_all(&cookie()[10..]).await.unwrap();
        while link.reliable.inbound.len() < COOKIE_LEN {
            link.readable().await;
            link.read_available();
        }
        assert!(link.take_cookie().unwrap());
        assert_eq!(link.phase, LinkPhase::Handshaking);
    }

    #[tokio::test]
    async fn test_bad_cookie_rejected() {
        let registry = NameRegistry::new();
        let (mut link, mut client) = make_link(&registry).await;
        client.write_all(&[b'x'; COOKIE_LEN]).await.unwrap();
        while link.reliable.inbound.len() < COOKIE_LEN {
            link.readable().await;
            link.read_available();
        }
        assert!(matches!(
            link.take_cookie(),
            Err(TransportError::Handshake(_))
        ));
    }

    #[tokio::test]
    async fn test_low_latency_falls_back_to_stream() {
        let registry = NameRegistry::new();
        let (mut link, _client) = make_link(&registry).await;
        let before = link.reliable.pending_out();
        link.queue_frame(&[0u8; 32], DeliveryClass::LowLatency);
        assert_eq!(link.reliable.pending_out(), before + 32);

        link.set_datagram_remote(&UdpDescription {
            host: "0.0.0.0".into(),
            port: 40000,
        });
        assert_eq!(
            link.datagram.remote(),
            Some(SocketAddr::new(link.addr.ip(), 40000))
        );
        link.queue_frame(&[0u8; 32], DeliveryClass::LowLatency);
        assert_eq!(link.reliable.pending_out(), before + 32);
        assert_eq!(link.datagram.pending_out(), 1);
    }

    fn user_frame(type_id: i32, sender_id: i32) -> Frame {
        Frame {
            type_id: MessageTypeId(type_id),
            sender_id: SenderId(sender_id),
            time: TimeVal::now(),
            class: DeliveryClass::Reliable,
            payload: Bytes::from_static(b"x"),
        }
    }

    #[tokio::test]
    async fn test_translate_accepts_only_described_user_ids() {
        let mut registry = NameRegistry::new();
        let (mut link, _client) = make_link(&registry).await;
        let sender = link.translation.learn_sender(SenderId(0), "Raw0", &mut registry).id;
        let blob = link.translation.learn_type(MessageTypeId(0), "Blob", &mut registry).id;

        assert_eq!(link.translate(&user_frame(0, 0)), Ok((blob, sender)));
        assert_eq!(link.translate(&user_frame(0, 1)), Err((IdKind::Sender, 1)));
        assert_eq!(link.translate(&user_frame(0, -1)), Err((IdKind::Sender, -1)));
        assert_eq!(link.translate(&user_frame(0, -2)), Err((IdKind::Sender, -2)));
        assert_eq!(link.translate(&user_frame(-1, 0)), Err((IdKind::Type, -1)));
    }

    #[tokio::test]
    async fn test_datagrams_only_accepted_from_advertised_source() {
        let registry = NameRegistry::new();
        let (mut link, _client) = make_link(&registry).await;
        let peer_socket = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let stranger = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let target = link.datagram.local_addr().unwrap();

        stranger.send_to(b"early", target).unwrap();
        while link.datagrams_in.is_empty() {
            link.readable().await;
            link.read_available();
        }
        assert_eq!(link.next_datagram(), None);
        assert_eq!(link.stats.datagrams_rejected, 1);

        link.set_datagram_remote(&UdpDescription {
            host: "127.0.0.1".into(),
            port: peer_socket.local_addr().unwrap().port(),
        });
        stranger.send_to(b"forged", target).unwrap();
        peer_socket.send_to(b"genuine", target).unwrap();
        while link.datagrams_in.len() < 2 {
            link.readable().await;
            link.read_available();
        }
        let mut accepted = Vec::new();
        while let Some(datagram) = link.next_datagram() {
            accepted.push(datagram);
        }
        assert_eq!(accepted, vec![Bytes::from_static(b"genuine")]);
        assert_eq!(link.stats.datagrams_rejected, 2);
    }
}
