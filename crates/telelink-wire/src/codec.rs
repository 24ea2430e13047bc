//! Canonical scalar codec.
//!
//! Every multi-byte scalar is written big-endian. The codec models the host's
//! in-memory representation explicitly through [`HostOrder`], so the same
//! code path can be exercised as if it ran on a big-endian, little-endian or
//! mixed-endian (word-swapped doubles) processor.

use std::sync::OnceLock;
use telelink_types::{CodecError, TimeVal};

/// How the host lays out multi-byte values in memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostOrder {
    BigEndian,
    LittleEndian,
    /// Little-endian integers, but 64-bit floats stored high word first.
    LittleEndianSwappedDoubleWords,
}

static HOST_ORDER: OnceLock<HostOrder> = OnceLock::new();

impl HostOrder {
    /// Byte order of the running process, detected once.
    pub fn current() -> HostOrder {
        *HOST_ORDER.get_or_init(|| {
            if u32::from_ne_bytes([0, 0, 0, 1]) == 1 {
                HostOrder::BigEndian
            } else {
                HostOrder::LittleEndian
            }
        })
    }

    fn is_little(self) -> bool {
        !matches!(self, HostOrder::BigEndian)
    }

    /// Host memory image of `v`.
    fn f64_image(self, v: f64) -> [u8; 8] {
        match self {
            HostOrder::BigEndian => v.to_be_bytes(),
            HostOrder::LittleEndian => v.to_le_bytes(),
            HostOrder::LittleEndianSwappedDoubleWords => {
                let b = v.to_le_bytes();
                [b[4], b[5], b[6], b[7], b[0], b[1], b[2], b[3]]
            }
        }
    }

    fn f64_from_image(self, b: [u8; 8]) -> f64 {
        match self {
            HostOrder::BigEndian => f64::from_be_bytes(b),
            HostOrder::LittleEndian => f64::from_le_bytes(b),
            HostOrder::LittleEndianSwappedDoubleWords => {
                f64::from_le_bytes([b[4], b[5], b[6], b[7], b[0], b[1], b[2], b[3]])
            }
        }
    }
}

/// A fixed-width value with a canonical wire encoding.
pub trait WireScalar: Sized + Copy {
    const WIRE_SIZE: usize;

    /// Write `self` into `out`, which is exactly `WIRE_SIZE` bytes long.
    fn encode(self, order: HostOrder, out: &mut [u8]);

    /// Read a value from `src`, which is exactly `WIRE_SIZE` bytes long.
    fn decode(order: HostOrder, src: &[u8]) -> Self;
}

macro_rules! impl_int_scalar {
    ($($t:ty),*) => {$(
        impl WireScalar for $t {
            const WIRE_SIZE: usize = std::mem::size_of::<$t>();

            fn encode(self, order: HostOrder, out: &mut [u8]) {
                let mut image = match order {
                    HostOrder::BigEndian => self.to_be_bytes(),
                    _ => self.to_le_bytes(),
                };
                if order.is_little() {
                    image.reverse();
                }
                out.copy_from_slice(&image);
            }

            fn decode(order: HostOrder, src: &[u8]) -> Self {
                let mut image = [0u8; std::mem::size_of::<$t>()];
                image.copy_from_slice(src);
                if order.is_little() {
                    image.reverse();
                    <$t>::from_le_bytes(image)
                } else {
                    <$t>::from_be_bytes(image)
                }
            }
        }
    )*};
}

impl_int_scalar!(u8, i8, u16, i16, u32, i32, f32);

impl WireScalar for f64 {
    const WIRE_SIZE: usize = 8;

    fn encode(self, order: HostOrder, out: &mut [u8]) {
        let mut image = order.f64_image(self);
        match order {
            HostOrder::BigEndian => {}
            HostOrder::LittleEndian => image.reverse(),
            HostOrder::LittleEndianSwappedDoubleWords => {
                // High word is already first; only the bytes in each word swap.
                image[..4].reverse();
                image[4..].reverse();
            }
        }
        out.copy_from_slice(&image);
    }

    fn decode(order: HostOrder, src: &[u8]) -> Self {
        let mut image = [0u8; 8];
        image.copy_from_slice(src);
        match order {
            HostOrder::BigEndian => {}
            HostOrder::LittleEndian => image.reverse(),
            HostOrder::LittleEndianSwappedDoubleWords => {
                image[..4].reverse();
                image[4..].reverse();
            }
        }
        order.f64_from_image(image)
    }
}

impl WireScalar for TimeVal {
    const WIRE_SIZE: usize = 8;

    fn encode(self, order: HostOrder, out: &mut [u8]) {
        self.sec.encode(order, &mut out[..4]);
        self.usec.encode(order, &mut out[4..]);
    }

    fn decode(order: HostOrder, src: &[u8]) -> Self {
        TimeVal {
            sec: i32::decode(order, &src[..4]),
            usec: i32::decode(order, &src[4..]),
        }
    }
}

/// How a string's length is delimited on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrLen {
    /// `u32` byte count followed by the bytes.
    Prefixed,
    /// Bytes followed by a single NUL.
    NulTerminated,
}

/// Cursor that encodes values into a caller-owned buffer.
pub struct WireWriter<'a> {
    buf: &'a mut [u8],
    pos: usize,
    order: HostOrder,
}

impl<'a> WireWriter<'a> {
    pub fn new(buf: &'a mut [u8]) -> Self {
        Self::with_order(buf, HostOrder::current())
    }

    pub fn with_order(buf: &'a mut [u8], order: HostOrder) -> Self {
        Self { buf, pos: 0, order }
    }

    /// Bytes written so far.
    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn check(&self, needed: usize) -> Result<(), CodecError> {
        if needed > self.remaining() {
            return Err(CodecError::BufferTooSmall {
                needed,
                available: self.remaining(),
            });
        }
        Ok(())
    }

    fn take(&mut self, n: usize) -> Result<&mut [u8], CodecError> {
        self.check(n)?;
        let start = self.pos;
        self.pos += n;
        Ok(&mut self.buf[start..start + n])
    }

    pub fn put<T: WireScalar>(&mut self, value: T) -> Result<(), CodecError> {
        let order = self.order;
        let out = self.take(T::WIRE_SIZE)?;
        value.encode(order, out);
        Ok(())
    }

    /// Raw bytes, copied without any swapping.
    pub fn put_bytes(&mut self, bytes: &[u8]) -> Result<(), CodecError> {
        self.take(bytes.len())?.copy_from_slice(bytes);
        Ok(())
    }

    pub fn put_str(&mut self, s: &str, len: StrLen) -> Result<(), CodecError> {
        match len {
            StrLen::Prefixed => {
                self.check(4 + s.len())?;
                self.put(s.len() as u32)?;
                self.put_bytes(s.as_bytes())
            }
            StrLen::NulTerminated => {
                self.check(s.len() + 1)?;
                self.put_bytes(s.as_bytes())?;
                self.put(0u8)
            }
        }
    }

    /// Zero-fill up to the next multiple of `align`.
    pub fn pad_to(&mut self, align: usize) -> Result<(), CodecError> {
        let pad = (align - self.pos % align) % align;
        self.take(pad)?.fill(0);
        Ok(())
    }
}

/// Cursor that decodes values from a byte slice.
pub struct WireReader<'a> {
    buf: &'a [u8],
    pos: usize,
    order: HostOrder,
}

impl<'a> WireReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self::with_order(buf, HostOrder::current())
    }

    pub fn with_order(buf: &'a [u8], order: HostOrder) -> Self {
        Self { buf, pos: 0, order }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn check(&self, needed: usize) -> Result<(), CodecError> {
        if needed > self.remaining() {
            return Err(CodecError::BufferUnderflow {
                needed,
                available: self.remaining(),
            });
        }
        Ok(())
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        self.check(n)?;
        let start = self.pos;
        self.pos += n;
        Ok(&self.buf[start..start + n])
    }

    pub fn get<T: WireScalar>(&mut self) -> Result<T, CodecError> {
        let order = self.order;
        Ok(T::decode(order, self.take(T::WIRE_SIZE)?))
    }

    pub fn get_bytes(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        self.take(n)
    }

    /// Decode a string. Trailing NULs inside a prefixed string are dropped.
    pub fn get_str(&mut self, len: StrLen) -> Result<String, CodecError> {
        let bytes = match len {
            StrLen::Prefixed => {
                self.check(4)?;
                let n = u32::decode(self.order, &self.buf[self.pos..self.pos + 4]) as usize;
                self.check(4 + n)?;
                self.pos += 4;
                let raw = self.take(n)?;
                let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
                &raw[..end]
            }
            StrLen::NulTerminated => {
                let rest = &self.buf[self.pos..];
                let end = rest
                    .iter()
                    .position(|&b| b == 0)
                    .ok_or(CodecError::MissingTerminator)?;
                let raw = self.take(end + 1)?;
                &raw[..end]
            }
        };
        std::str::from_utf8(bytes)
            .map(str::to_owned)
            .map_err(|_| CodecError::InvalidUtf8)
    }

    /// Skip padding up to the next multiple of `align`.
    pub fn skip_to(&mut self, align: usize) -> Result<(), CodecError> {
        let pad = (align - self.pos % align) % align;
        self.take(pad).map(|_| ())
    }
}
