//! Telelink wire format.
//!
//! ## Layout
//!
//! - **codec**: bounds-checked cursors that write scalars in canonical
//!   big-endian order regardless of host byte order
//! - **frame**: the 24-byte frame header, payload padding and streaming decode
//! - **cookie**: the magic/version exchange that opens every reliable stream
//!   and every log file
//! - **system**: payloads of the reserved system messages and replay controls

pub mod codec;
pub mod cookie;
pub mod frame;
pub mod system;

pub use codec::{HostOrder, StrLen, WireReader, WireScalar, WireWriter};
pub use frame::{Frame, ALIGN, HEADER_LEN, MAX_DATAGRAM_LEN, MAX_FRAME_LEN};
