//! Magic cookie exchanged at the start of every stream and log file.
//!
//! The cookie is the text `telelink: ver. MM.mm` NUL-padded to
//! [`COOKIE_LEN`] bytes. Everything up to the last `.` is the major version
//! and must match exactly; a different minor version is only reported.

use telelink_types::{TransportError, TransportResult};
use tracing::warn;

pub const MAGIC: &str = "telelink: ver. 01.00";

/// Cookie length on the wire (multiple of the frame alignment).
pub const COOKIE_LEN: usize = 24;

/// Result of comparing a remote cookie with ours.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CookieCheck {
    Match,
    MinorMismatch { remote: String },
}

/// Our cookie, ready to write.
pub fn cookie() -> [u8; COOKIE_LEN] {
    let mut out = [0u8; COOKIE_LEN];
    out[..MAGIC.len()].copy_from_slice(MAGIC.as_bytes());
    out
}

/// Validate a cookie received from a peer or read from a log file.
pub fn check_cookie(bytes: &[u8]) -> TransportResult<CookieCheck> {
    if bytes.len() < COOKIE_LEN {
        return Err(TransportError::Handshake(format!(
            "cookie is {} bytes, expected {COOKIE_LEN}",
            bytes.len()
        )));
    }
    let end = bytes[..COOKIE_LEN]
        .iter()
        .position(|&b| b == 0)
        .unwrap_or(COOKIE_LEN);
    let remote = String::from_utf8_lossy(&bytes[..end]).into_owned();

    let major_len = MAGIC.rfind('.').map(|i| i + 1).unwrap_or(MAGIC.len());
    if remote.len() < major_len || remote.as_bytes()[..major_len] != MAGIC.as_bytes()[..major_len] {
        return Err(TransportError::Handshake(format!(
            "incompatible cookie '{remote}', expected '{MAGIC}'"
        )));
    }
    if remote != MAGIC {
        warn!(remote = %remote, local = MAGIC, "Peer uses a different minor protocol version");
        return Ok(CookieCheck::MinorMismatch { remote });
    }
    Ok(CookieCheck::Match)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cookie_from(text: &str) -> [u8; COOKIE_LEN] {
        let mut out = [0u8; COOKIE_LEN];
        out[..text.len()].copy_from_slice(text.as_bytes());
        out
    }

    #[test]
    fn test_own_cookie_matches() {
        assert_eq!(check_cookie(&cookie()).unwrap(), CookieCheck::Match);
    }

    #[test]
    fn test_minor_mismatch_accepted() {
        let remote = cookie_from("telelink: ver. 01.07");
        assert_eq!(
            check_cookie(&remote).unwrap(),
            CookieCheck::MinorMismatch {
                remote: "telelink: ver. 01.07".into()
            }
        );
    }

    #[test]
    fn test_major_mismatch_rejected() {
        let remote = cookie_from("telelink: ver. 02.00");
        assert!(matches!(
            check_cookie(&remote),
            Err(TransportError::Handshake(_))
        ));
        let other = cookie_from("telemetry: ver. 01.00");
        assert!(check_cookie(&other).is_err());
    }

    #[test]
    fn test_short_cookie_rejected() {
        assert!(check_cookie(b"telelink").is_err());
    }
}
