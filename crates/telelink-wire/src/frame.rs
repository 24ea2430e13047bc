//! Frame layout shared by the reliable stream, datagrams and log files.
//!
//! ```text
//! 0       4       8       12      16      20      24
//! | len   | sec   | usec  | type  | sender| class | payload ... | pad to 8 |
//! ```
//!
//! All header words are big-endian. `class` occupies the alignment padding of
//! the five-word header: `0` reliable, `1` low latency.

use crate::codec::{WireReader, WireWriter};
use bytes::{Bytes, BytesMut};
use telelink_types::{
    CodecError, DeliveryClass, Message, MessageTypeId, Scope, SenderId, TimeVal, TransportError,
    TransportResult,
};

/// Alignment of every header and payload.
pub const ALIGN: usize = 8;

/// Header size in bytes.
pub const HEADER_LEN: usize = 24;

/// Largest frame (header + padded payload) accepted on the reliable stream.
pub const MAX_FRAME_LEN: usize = 64_000;

/// Largest datagram sent on the low-latency channel.
pub const MAX_DATAGRAM_LEN: usize = 1_472;

/// Round `n` up to the next multiple of [`ALIGN`].
pub const fn padded_len(n: usize) -> usize {
    (n + ALIGN - 1) / ALIGN * ALIGN
}

/// Largest payload that fits in one frame of `limit` bytes.
pub const fn max_payload(limit: usize) -> usize {
    limit - HEADER_LEN
}

/// Frame size limit for a delivery class.
pub fn frame_limit(class: DeliveryClass) -> usize {
    match class {
        DeliveryClass::Reliable => MAX_FRAME_LEN,
        DeliveryClass::LowLatency => MAX_DATAGRAM_LEN,
    }
}

/// One message as it appears on the wire.
///
/// Ids are whatever the writer put in the header: the sender's local ids for
/// user messages, the described id for description messages, the UDP port for
/// UDP descriptions.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub type_id: MessageTypeId,
    pub sender_id: SenderId,
    pub time: TimeVal,
    pub class: DeliveryClass,
    pub payload: Bytes,
}

impl Frame {
    pub fn from_message(message: &Message) -> Self {
        Self {
            type_id: message.type_id,
            sender_id: message.sender,
            time: message.timestamp,
            class: message.class,
            payload: message.payload.clone(),
        }
    }

    /// Rebuild a message, keeping the header ids unchanged.
    pub fn into_message(self) -> Message {
        Message {
            type_id: self.type_id,
            sender: self.sender_id,
            timestamp: self.time,
            payload: self.payload,
            class: self.class,
            scope: Scope::Any,
        }
    }

    pub fn encoded_len(&self) -> usize {
        HEADER_LEN + padded_len(self.payload.len())
    }

    /// Append the encoded frame to `out`.
    ///
    /// Fails with `PayloadTooLarge` without touching `out` if the frame would
    /// exceed `limit` bytes.
    pub fn encode_into(&self, out: &mut BytesMut, limit: usize) -> TransportResult<()> {
        let len = self.encoded_len();
        if len > limit {
            return Err(TransportError::PayloadTooLarge {
                size: self.payload.len(),
                max: max_payload(limit),
            });
        }
        let start = out.len();
        out.resize(start + len, 0);
        let mut w = WireWriter::new(&mut out[start..]);
        w.put(self.payload.len() as u32)?;
        w.put(self.time)?;
        w.put(self.type_id.0)?;
        w.put(self.sender_id.0)?;
        w.put(match self.class {
            DeliveryClass::Reliable => 0u32,
            DeliveryClass::LowLatency => 1u32,
        })?;
        w.put_bytes(&self.payload)?;
        w.pad_to(ALIGN)?;
        Ok(())
    }

    pub fn encode(&self, limit: usize) -> TransportResult<Bytes> {
        let mut out = BytesMut::with_capacity(self.encoded_len());
        self.encode_into(&mut out, limit)?;
        Ok(out.freeze())
    }
}

/// Decoded header fields.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Header {
    payload_len: usize,
    time: TimeVal,
    type_id: MessageTypeId,
    sender_id: SenderId,
    class: DeliveryClass,
}

fn decode_header(buf: &[u8]) -> Result<Header, CodecError> {
    let mut r = WireReader::new(buf);
    let payload_len = r.get::<u32>()? as usize;
    let time = r.get::<TimeVal>()?;
    let type_id = MessageTypeId(r.get::<i32>()?);
    let sender_id = SenderId(r.get::<i32>()?);
    let class = match r.get::<u32>()? {
        0 => DeliveryClass::Reliable,
        _ => DeliveryClass::LowLatency,
    };
    Ok(Header {
        payload_len,
        time,
        type_id,
        sender_id,
        class,
    })
}

/// Take one complete frame off the front of a stream buffer.
///
/// Returns `Ok(None)` while the buffer holds only part of a frame. A header
/// announcing more than [`MAX_FRAME_LEN`] means the stream is corrupt.
pub fn try_decode(buf: &mut BytesMut) -> TransportResult<Option<Frame>> {
    if buf.len() < HEADER_LEN {
        return Ok(None);
    }
    let header = decode_header(&buf[..HEADER_LEN])?;
    if header.payload_len > max_payload(MAX_FRAME_LEN) {
        return Err(TransportError::PayloadTooLarge {
            size: header.payload_len,
            max: max_payload(MAX_FRAME_LEN),
        });
    }
    let total = HEADER_LEN + padded_len(header.payload_len);
    if buf.len() < total {
        return Ok(None);
    }
    let bytes = buf.split_to(total).freeze();
    Ok(Some(Frame {
        type_id: header.type_id,
        sender_id: header.sender_id,
        time: header.time,
        class: header.class,
        payload: bytes.slice(HEADER_LEN..HEADER_LEN + header.payload_len),
    }))
}

/// Decode every frame in a datagram. A trailing partial frame is an error.
pub fn decode_datagram(datagram: &[u8]) -> TransportResult<Vec<Frame>> {
    let mut buf = BytesMut::from(datagram);
    let mut frames = Vec::new();
    while let Some(frame) = try_decode(&mut buf)? {
        frames.push(frame);
    }
    if !buf.is_empty() {
        let needed = match decode_header(&buf) {
            Ok(header) => HEADER_LEN + padded_len(header.payload_len),
            Err(_) => HEADER_LEN,
        };
        return Err(CodecError::BufferUnderflow {
            needed,
            available: buf.len(),
        }
        .into());
    }
    Ok(frames)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_frame(payload: &[u8]) -> Frame {
        Frame {
            type_id: MessageTypeId(3),
            sender_id: SenderId(1),
            time: TimeVal::new(100, 250),
            class: DeliveryClass::Reliable,
            payload: Bytes::copy_from_slice(payload),
        }
    }

    #[test]
    fn test_header_layout() {
        let frame = make_frame(&[9, 9, 9]);
        let bytes = frame.encode(MAX_FRAME_LEN).unwrap();
        assert_eq!(bytes.len(), 32);
        assert_eq!(&bytes[0..4], &3u32.to_be_bytes());
        assert_eq!(&bytes[4..8], &100i32.to_be_bytes());
        assert_eq!(&bytes[8..12], &250i32.to_be_bytes());
        assert_eq!(&bytes[12..16], &3i32.to_be_bytes());
        assert_eq!(&bytes[16..20], &1i32.to_be_bytes());
        assert_eq!(&bytes[20..24], &0u32.to_be_bytes());
        assert_eq!(&bytes[24..27], &[9, 9, 9]);
        assert_eq!(&bytes[27..], &[0; 5]);
    }

    #[test]
    fn test_stream_decode_handles_partial_input() {
        let mut low = make_frame(b"hello");
        low.class = DeliveryClass::LowLatency;
        let a = make_frame(&[1; 24]).encode(MAX_FRAME_LEN).unwrap();
        let b = low.encode(MAX_FRAME_LEN).unwrap();

        let mut buf = BytesMut::new();
        buf.extend_from_slice(&a[..10]);
        assert!(try_decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(&a[10..]);
        buf.extend_from_slice(&b[..HEADER_LEN + 2]);

        let first = try_decode(&mut buf).unwrap().unwrap();
        assert_eq!(first.payload.len(), 24);
        assert!(try_decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(&b[HEADER_LEN + 2..]);
        let second = try_decode(&mut buf).unwrap().unwrap();
        assert_eq!(&second.payload[..], b"hello");
        assert_eq!(second.class, DeliveryClass::LowLatency);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_oversized_frame_rejected_without_writing() {
        let frame = make_frame(&vec![0u8; max_payload(MAX_DATAGRAM_LEN) + 1]);
        let mut out = BytesMut::new();
        let err = frame.encode_into(&mut out, MAX_DATAGRAM_LEN).unwrap_err();
        assert!(matches!(
            err,
            TransportError::PayloadTooLarge { size: 1449, max: 1448 }
        ));
        assert!(out.is_empty());
        assert!(frame.encode_into(&mut out, MAX_FRAME_LEN).is_ok());
    }

    #[test]
    fn test_corrupt_length_rejected() {
        let mut buf = BytesMut::from(&make_frame(b"x").encode(MAX_FRAME_LEN).unwrap()[..]);
        buf[0..4].copy_from_slice(&(MAX_FRAME_LEN as u32).to_be_bytes());
        assert!(matches!(
            try_decode(&mut buf),
            Err(TransportError::PayloadTooLarge { .. })
        ));
    }

    #[test]
    fn test_datagram_with_several_frames() {
        let mut out = BytesMut::new();
        make_frame(b"one").encode_into(&mut out, MAX_DATAGRAM_LEN).unwrap();
        make_frame(b"two!").encode_into(&mut out, MAX_DATAGRAM_LEN).unwrap();
        let frames = decode_datagram(&out).unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(&frames[1].payload[..], b"two!");

        assert!(decode_datagram(&out[..out.len() - 3]).is_err());
    }

    #[test]
    fn test_message_conversion_keeps_ids() {
        let msg = Message::new(MessageTypeId(4), SenderId(2), vec![1u8, 2]);
        let frame = Frame::from_message(&msg);
        assert_eq!(frame.clone().into_message(), msg);
    }
}
