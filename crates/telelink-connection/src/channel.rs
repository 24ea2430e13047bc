//! The two physical channels of a peer link.
//!
//! Both channels are non-blocking: reads drain whatever the socket already
//! holds. Writes wait a bounded time for the socket to become writable and
//! keep the rest for the next pump.

use bytes::{Buf, Bytes, BytesMut};
use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use telelink_wire::MAX_DATAGRAM_LEN;
use tokio::net::{TcpStream, UdpSocket};

const READ_CHUNK: usize = 16 * 1024;

/// What a non-blocking read found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    /// Bytes were appended to the inbound buffer.
    Data(usize),
    /// Nothing available right now.
    Idle,
    /// The peer closed the stream.
    Closed,
}

/// Ordered, reliable byte stream.
#[derive(Debug)]
pub struct ReliableChannel {
    stream: TcpStream,
    pub(crate) inbound: BytesMut,
    outbound: BytesMut,
}

impl ReliableChannel {
    pub fn new(stream: TcpStream) -> io::Result<Self> {
        stream.set_nodelay(true)?;
        Ok(Self {
            stream,
            inbound: BytesMut::with_capacity(READ_CHUNK),
            outbound: BytesMut::new(),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.stream.local_addr()
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.stream.peer_addr()
    }

    /// Append already-encoded bytes to the outbound queue.
    pub fn queue(&mut self, bytes: &[u8]) {
        self.outbound.extend_from_slice(bytes);
    }

    pub fn pending_out(&self) -> usize {
        self.outbound.len()
    }

    /// Drop everything not yet written.
    pub fn discard_outbound(&mut self) {
        self.outbound.clear();
    }

    /// Read everything currently available without waiting.
    pub fn read_available(&mut self) -> io::Result<ReadOutcome> {
        let mut total = 0;
        loop {
            self.inbound.reserve(READ_CHUNK);
            match self.stream.try_read_buf(&mut self.inbound) {
                Ok(0) => {
                    return Ok(if total > 0 {
                        ReadOutcome::Data(total)
                    } else {
                        ReadOutcome::Closed
                    });
                }
                Ok(n) => total += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(if total > 0 {
            ReadOutcome::Data(total)
        } else {
            ReadOutcome::Idle
        })
    }

    /// Write queued bytes. Waits at most `wait` for the socket to become
    /// writable; whatever does not fit stays queued.
    pub async fn flush(&mut self, wait: Duration) -> io::Result<usize> {
        let mut written = 0;
        while !self.outbound.is_empty() {
            match self.stream.try_write(&self.outbound) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => {
                    self.outbound.advance(n);
                    written += n;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if tokio::time::timeout(wait, self.stream.writable())
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(written)
    }

    pub async fn readable(&self) -> io::Result<()> {
        self.stream.readable().await
    }
}

/// Best-effort datagram socket. Frames are packed into datagrams of at most
/// [`MAX_DATAGRAM_LEN`] bytes; the oldest datagrams are dropped once the
/// backlog is full.
#[derive(Debug)]
pub struct DatagramChannel {
    socket: UdpSocket,
    remote: Option<SocketAddr>,
    building: BytesMut,
    queued: VecDeque<Bytes>,
    backlog: usize,
    dropped: u64,
    scratch: Vec<u8>,
}

impl DatagramChannel {
    /// Bind an ephemeral datagram socket on `local`'s address.
    pub fn bind(local: SocketAddr, backlog: usize) -> io::Result<Self> {
        let std_socket = std::net::UdpSocket::bind(SocketAddr::new(local.ip(), 0))?;
        std_socket.set_nonblocking(true)?;
        Ok(Self {
            socket: UdpSocket::from_std(std_socket)?,
            remote: None,
            building: BytesMut::with_capacity(MAX_DATAGRAM_LEN),
            queued: VecDeque::new(),
            backlog,
            dropped: 0,
            scratch: vec![0u8; MAX_DATAGRAM_LEN],
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Where to send datagrams, learned from the peer's UDP description.
    pub fn set_remote(&mut self, remote: SocketAddr) {
        self.remote = Some(remote);
    }

    pub fn remote(&self) -> Option<SocketAddr> {
        self.remote
    }

    /// Datagrams dropped because the backlog was full.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Add one encoded frame (at most [`MAX_DATAGRAM_LEN`] bytes).
    pub fn queue(&mut self, frame: &[u8]) {
        if self.building.len() + frame.len() > MAX_DATAGRAM_LEN {
            self.seal();
        }
        self.building.extend_from_slice(frame);
    }

    fn seal(&mut self) {
        if self.building.is_empty() {
            return;
        }
        let datagram = self.building.split().freeze();
        self.queued.push_back(datagram);
        while self.queued.len() > self.backlog {
            self.queued.pop_front();
            self.dropped += 1;
        }
    }

    pub fn pending_out(&self) -> usize {
        self.queued.len() + usize::from(!self.building.is_empty())
    }

    pub fn discard_outbound(&mut self) {
        self.building.clear();
        self.queued.clear();
    }

    /// Receive every datagram currently available, with its source address.
    pub fn recv_available(&mut self) -> io::Result<Vec<(SocketAddr, Bytes)>> {
        let mut datagrams = Vec::new();
        loop {
            match self.socket.try_recv_from(&mut self.scratch) {
                Ok((n, from)) => {
                    datagrams.push((from, Bytes::copy_from_slice(&self.scratch[..n])))
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                // ICMP port unreachable from an earlier send; not a channel failure.
                Err(e) if e.kind() == io::ErrorKind::ConnectionRefused => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(datagrams)
    }

    /// Send queued datagrams. Waits at most `wait` for the socket to become
    /// writable; unsent datagrams stay queued. Returns the number sent.
    pub async fn flush(&mut self, wait: Duration) -> io::Result<usize> {
        self.seal();
        let Some(remote) = self.remote else {
            return Ok(0);
        };
        let mut sent = 0;
        while let Some(datagram) = self.queued.front() {
            match self.socket.try_send_to(datagram, remote) {
                Ok(_) => {
                    self.queued.pop_front();
                    sent += 1;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if tokio::time::timeout(wait, self.socket.writable())
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::ConnectionRefused => {
                    self.queued.pop_front();
                    self.dropped += 1;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(sent)
    }

    pub async fn readable(&self) -> io::Result<()> {
        self.socket.readable().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    async fn make_pair() -> (ReliableChannel, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (ReliableChannel::new(server).unwrap(), client)
    }

    #[tokio::test]
    async fn test_reliable_read_and_close() {
        let (mut chan, mut client) = make_pair().await;
        assert_eq!(chan.read_available().unwrap(), ReadOutcome::Idle);

        client.write_all(b"abcdef").await.unwrap();
        chan.readable().await.unwrap();
        let mut got = 0;
        while got < 6 {
            if let ReadOutcome::Data(n) = chan.read_available().unwrap() {
                got += n;
            } else {
                chan.readable().await.unwrap();
            }
        }
        assert_eq!(&chan.inbound[..], b"abcdef");

        drop(client);
        let mut outcome = ReadOutcome::Idle;
        while outcome == ReadOutcome::Idle {
            chan.readable().await.unwrap();
            outcome = chan.read_available().unwrap();
        }
        assert_eq!(outcome, ReadOutcome::Closed);
    }

    #[tokio::test]
    async fn test_reliable_flush_and_discard() {
        let (mut chan, mut client) = make_pair().await;
        chan.queue(b"hello");
        assert_eq!(chan.pending_out(), 5);
        chan.flush(Duration::from_secs(1)).await.unwrap();
        assert_eq!(chan.pending_out(), 0);
        let mut buf = [0u8; 5];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");

        chan.queue(b"never sent");
        chan.discard_outbound();
        assert_eq!(chan.pending_out(), 0);
    }

    #[tokio::test]
    async fn test_datagram_batching_and_backlog() {
        let local: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let mut chan = DatagramChannel::bind(local, 2).unwrap();
        let frame = vec![7u8; 600];
        for _ in 0..8 {
            chan.queue(&frame);
        }
        // Two frames fit per datagram; only the newest two sealed datagrams remain.
        assert_eq!(chan.flush(Duration::from_millis(10)).await.unwrap(), 0);
        assert_eq!(chan.pending_out(), 2);
        assert_eq!(chan.dropped(), 2);
    }

    #[tokio::test]
    async fn test_datagram_delivery() {
        let local: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let mut a = DatagramChannel::bind(local, 16).unwrap();
        let mut b = DatagramChannel::bind(local, 16).unwrap();
        a.set_remote(b.local_addr().unwrap());

        // First send right after bind, before the socket reported writable.
        a.queue(b"ping-frame");
        assert_eq!(a.flush(Duration::from_secs(1)).await.unwrap(), 1);
        assert_eq!(a.pending_out(), 0);

        let mut received = Vec::new();
        while received.is_empty() {
            b.readable().await.unwrap();
            received = b.recv_available().unwrap();
        }
        assert_eq!(received[0].0, a.local_addr().unwrap());
        assert_eq!(&received[0].1[..], b"ping-frame");
    }
}
