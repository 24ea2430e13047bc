//! Payloads of the reserved system messages and of the replay controls.

use crate::codec::{StrLen, WireReader, WireWriter};
use bytes::Bytes;
use telelink_types::{CodecError, LogMode, SenderId, TextSeverity, TimeVal};

/// Longest text message, including its terminating NUL.
pub const MAX_TEXT_LEN: usize = 1024;

/// Encode into an exactly-sized buffer.
fn encode_with<F>(capacity: usize, f: F) -> Result<Bytes, CodecError>
where
    F: FnOnce(&mut WireWriter<'_>) -> Result<(), CodecError>,
{
    let mut buf = vec![0u8; capacity];
    let mut w = WireWriter::new(&mut buf);
    f(&mut w)?;
    let len = w.position();
    buf.truncate(len);
    Ok(Bytes::from(buf))
}

// ---------------------------------------------------------------------------
// Descriptions
// ---------------------------------------------------------------------------

/// Payload of a sender or type description. The described id travels in the
/// header's sender field.
pub fn encode_description(name: &str) -> Result<Bytes, CodecError> {
    encode_with(4 + name.len(), |w| w.put_str(name, StrLen::Prefixed))
}

pub fn decode_description(payload: &[u8]) -> Result<String, CodecError> {
    WireReader::new(payload).get_str(StrLen::Prefixed)
}

/// Address of a peer's datagram socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdpDescription {
    pub host: String,
    pub port: u16,
}

impl UdpDescription {
    /// Header sender field and payload. The port rides in the sender field.
    pub fn encode(&self) -> Result<(SenderId, Bytes), CodecError> {
        let payload = encode_with(self.host.len() + 1, |w| {
            w.put_str(&self.host, StrLen::NulTerminated)
        })?;
        Ok((SenderId(self.port as i32), payload))
    }

    pub fn decode(sender_field: SenderId, payload: &[u8]) -> Result<Self, CodecError> {
        let port = u16::try_from(sender_field.0).map_err(|_| CodecError::InvalidValue {
            field: "udp port",
            value: sender_field.0 as u32,
        })?;
        let host = WireReader::new(payload).get_str(StrLen::NulTerminated)?;
        Ok(Self { host, port })
    }
}

// ---------------------------------------------------------------------------
// Text messages
// ---------------------------------------------------------------------------

/// Severity-tagged text surfaced through the handler path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextMessage {
    pub severity: TextSeverity,
    pub level: u32,
    pub text: String,
}

impl TextMessage {
    pub fn new(severity: TextSeverity, text: impl Into<String>) -> Self {
        Self {
            severity,
            level: 0,
            text: text.into(),
        }
    }

    /// Encode, truncating the text to fit [`MAX_TEXT_LEN`].
    pub fn encode(&self) -> Result<Bytes, CodecError> {
        let mut end = self.text.len().min(MAX_TEXT_LEN - 1);
        while !self.text.is_char_boundary(end) {
            end -= 1;
        }
        let text = &self.text[..end];
        encode_with(8 + text.len() + 1, |w| {
            w.put(self.severity.as_u32())?;
            w.put(self.level)?;
            w.put_str(text, StrLen::NulTerminated)
        })
    }

    pub fn decode(payload: &[u8]) -> Result<Self, CodecError> {
        let mut r = WireReader::new(payload);
        let raw = r.get::<u32>()?;
        let severity = TextSeverity::from_u32(raw).ok_or(CodecError::InvalidValue {
            field: "text severity",
            value: raw,
        })?;
        let level = r.get::<u32>()?;
        let text = r.get_str(StrLen::NulTerminated)?;
        Ok(Self {
            severity,
            level,
            text,
        })
    }
}

// ---------------------------------------------------------------------------
// Clock synchronization
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PingPayload {
    pub nonce: u32,
    pub sent: TimeVal,
}

impl PingPayload {
    pub fn encode(&self) -> Result<Bytes, CodecError> {
        encode_with(12, |w| {
            w.put(self.nonce)?;
            w.put(self.sent)
        })
    }

    pub fn decode(payload: &[u8]) -> Result<Self, CodecError> {
        let mut r = WireReader::new(payload);
        Ok(Self {
            nonce: r.get()?,
            sent: r.get()?,
        })
    }
}

/// Reply to a ping: echoes the nonce and request time, adds the responder's
/// clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PongPayload {
    pub nonce: u32,
    pub request_sent: TimeVal,
    pub responded: TimeVal,
}

impl PongPayload {
    pub fn reply_to(ping: &PingPayload, responded: TimeVal) -> Self {
        Self {
            nonce: ping.nonce,
            request_sent: ping.sent,
            responded,
        }
    }

    pub fn encode(&self) -> Result<Bytes, CodecError> {
        encode_with(20, |w| {
            w.put(self.nonce)?;
            w.put(self.request_sent)?;
            w.put(self.responded)
        })
    }

    pub fn decode(payload: &[u8]) -> Result<Self, CodecError> {
        let mut r = WireReader::new(payload);
        Ok(Self {
            nonce: r.get()?,
            request_sent: r.get()?,
            responded: r.get()?,
        })
    }
}

// ---------------------------------------------------------------------------
// Remote logging
// ---------------------------------------------------------------------------

/// Request that the receiving side log traffic to `path`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogDescription {
    pub mode: LogMode,
    pub path: String,
}

impl LogDescription {
    pub fn encode(&self) -> Result<Bytes, CodecError> {
        encode_with(8 + self.path.len(), |w| {
            w.put(self.mode.to_bits())?;
            w.put_str(&self.path, StrLen::Prefixed)
        })
    }

    pub fn decode(payload: &[u8]) -> Result<Self, CodecError> {
        let mut r = WireReader::new(payload);
        let bits = r.get::<u32>()?;
        let mode = LogMode::from_bits(bits).ok_or(CodecError::InvalidValue {
            field: "log mode",
            value: bits,
        })?;
        let path = r.get_str(StrLen::Prefixed)?;
        Ok(Self { mode, path })
    }
}

// ---------------------------------------------------------------------------
// Replay control
// ---------------------------------------------------------------------------

/// Sender name used by replay controllers.
pub const REPLAY_CONTROLLER_SENDER: &str = "telelink replay controller";

/// Commands understood by a log-backed connection. Each travels as an
/// ordinary user message whose type name identifies the command.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ReplayControl {
    SetRate(f32),
    Reset,
    PlayToTime(TimeVal),
    Stop,
    Play,
}

impl ReplayControl {
    pub const SET_RATE: &'static str = "telelink replay set_rate";
    pub const RESET: &'static str = "telelink replay reset";
    pub const PLAY_TO_TIME: &'static str = "telelink replay play_to_time";
    pub const STOP: &'static str = "telelink replay stop";
    pub const PLAY: &'static str = "telelink replay play";

    pub const TYPE_NAMES: [&'static str; 5] = [
        Self::SET_RATE,
        Self::RESET,
        Self::PLAY_TO_TIME,
        Self::STOP,
        Self::PLAY,
    ];

    pub fn type_name(&self) -> &'static str {
        match self {
            ReplayControl::SetRate(_) => Self::SET_RATE,
            ReplayControl::Reset => Self::RESET,
            ReplayControl::PlayToTime(_) => Self::PLAY_TO_TIME,
            ReplayControl::Stop => Self::STOP,
            ReplayControl::Play => Self::PLAY,
        }
    }

    pub fn encode(&self) -> Result<Bytes, CodecError> {
        match self {
            ReplayControl::SetRate(rate) => encode_with(4, |w| w.put(*rate)),
            ReplayControl::PlayToTime(t) => encode_with(8, |w| w.put(*t)),
            ReplayControl::Reset | ReplayControl::Stop | ReplayControl::Play => Ok(Bytes::new()),
        }
    }

    /// Decode a control given the name of the message's type. Returns
    /// `Ok(None)` for types that are not replay controls.
    pub fn decode(type_name: &str, payload: &[u8]) -> Result<Option<Self>, CodecError> {
        let mut r = WireReader::new(payload);
        let control = match type_name {
            Self::SET_RATE => ReplayControl::SetRate(r.get()?),
            Self::RESET => ReplayControl::Reset,
            Self::PLAY_TO_TIME => ReplayControl::PlayToTime(r.get()?),
            Self::STOP => ReplayControl::Stop,
            Self::PLAY => ReplayControl::Play,
            _ => return Ok(None),
        };
        Ok(Some(control))
    }
}
