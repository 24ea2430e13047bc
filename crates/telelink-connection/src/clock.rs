//! Round-trip clock synchronization over the ping/pong system messages.
//!
//! [`ClockSync`] is a pure state machine: the caller supplies the current
//! monotonic instant and wall-clock time, and sends/receives the payloads.

use std::time::{Duration, Instant};
use telelink_types::{TimeVal, TransportError, TransportResult};
use telelink_wire::system::{PingPayload, PongPayload};

/// One outstanding ping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClockSample {
    pub nonce: u32,
    /// Our wall clock when the ping was sent.
    pub request_time: TimeVal,
    /// Monotonic instant the ping was sent.
    pub sent_at: Instant,
}

/// Result of one completed ping/pong exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoundTrip {
    pub rtt: Duration,
    /// Estimated `peer clock - our clock`, in microseconds.
    pub clock_offset_micros: i64,
}

#[derive(Debug)]
pub struct ClockSync {
    timeout: Duration,
    interval: Option<Duration>,
    next_nonce: u32,
    outstanding: Option<ClockSample>,
    last: Option<RoundTrip>,
    last_ping_at: Option<Instant>,
    completed: u64,
}

impl ClockSync {
    pub fn new(timeout: Duration, interval: Option<Duration>) -> Self {
        Self {
            timeout,
            interval,
            next_nonce: rand::random(),
            outstanding: None,
            last: None,
            last_ping_at: None,
            completed: 0,
        }
    }

    /// Start a ping. Replaces any ping still outstanding.
    pub fn begin(&mut self, now: Instant, wall: TimeVal) -> PingPayload {
        let nonce = self.next_nonce;
        self.next_nonce = self.next_nonce.wrapping_add(1);
        self.outstanding = Some(ClockSample {
            nonce,
            request_time: wall,
            sent_at: now,
        });
        self.last_ping_at = Some(now);
        PingPayload { nonce, sent: wall }
    }

    /// Complete the outstanding ping. Pongs for other nonces are ignored.
    pub fn on_pong(&mut self, pong: &PongPayload, now: Instant) -> Option<RoundTrip> {
        let sample = self.outstanding?;
        if sample.nonce != pong.nonce {
            return None;
        }
        self.outstanding = None;
        let rtt = now.saturating_duration_since(sample.sent_at);
        let midpoint = sample.request_time.as_micros() + rtt.as_micros() as i64 / 2;
        let offset = pong.responded.as_micros() - midpoint;
        let trip = RoundTrip {
            rtt,
            clock_offset_micros: offset,
        };
        self.last = Some(trip);
        self.completed += 1;
        Some(trip)
    }

    /// Fails with `PingTimeout` once an outstanding ping is older than the
    /// timeout.
    pub fn check(&self, now: Instant) -> TransportResult<()> {
        match self.outstanding {
            Some(sample) if now.saturating_duration_since(sample.sent_at) > self.timeout => {
                Err(TransportError::PingTimeout(self.timeout))
            }
            _ => Ok(()),
        }
    }

    /// True when the periodic interval has elapsed and no ping is in flight.
    pub fn ping_due(&self, now: Instant) -> bool {
        match (self.interval, self.last_ping_at) {
            (Some(interval), Some(last)) => {
                self.outstanding.is_none() && now.saturating_duration_since(last) >= interval
            }
            _ => false,
        }
    }

    pub fn is_waiting(&self) -> bool {
        self.outstanding.is_some()
    }

    pub fn last_round_trip(&self) -> Option<RoundTrip> {
        self.last
    }

    /// Number of completed exchanges.
    pub fn completed(&self) -> u64 {
        self.completed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_sync() -> ClockSync {
        ClockSync::new(Duration::from_millis(500), Some(Duration::from_secs(1)))
    }

    #[test]
    fn test_round_trip_measured() {
        let mut sync = make_sync();
        let t0 = Instant::now();
        let ping = sync.begin(t0, TimeVal::new(100, 0));
        assert!(sync.is_waiting());

        let pong = PongPayload::reply_to(&ping, TimeVal::new(100, 60_000));
        let trip = sync
            .on_pong(&pong, t0 + Duration::from_millis(20))
            .unwrap();
        assert_eq!(trip.rtt, Duration::from_millis(20));
        assert_eq!(trip.clock_offset_micros, 50_000);
        assert_eq!(sync.completed(), 1);
        assert!(!sync.is_waiting());
    }

    #[test]
    fn test_rtt_never_negative() {
        let mut sync = make_sync();
        let t0 = Instant::now();
        let ping = sync.begin(t0 + Duration::from_millis(5), TimeVal::now());
        let pong = PongPayload::reply_to(&ping, TimeVal::now());
        let trip = sync.on_pong(&pong, t0).unwrap();
        assert_eq!(trip.rtt, Duration::ZERO);
    }

    #[test]
    fn test_stale_pong_ignored() {
        let mut sync = make_sync();
        let t0 = Instant::now();
        let ping = sync.begin(t0, TimeVal::now());
        let mut pong = PongPayload::reply_to(&ping, TimeVal::now());
        pong.nonce = pong.nonce.wrapping_add(7);
        assert!(sync.on_pong(&pong, t0).is_none());
        assert!(sync.is_waiting());
    }

    #[test]
    fn test_timeout_detected() {
        let mut sync = make_sync();
        let t0 = Instant::now();
        assert!(sync.check(t0 + Duration::from_secs(10)).is_ok());
        sync.begin(t0, TimeVal::now());
        assert!(sync.check(t0 + Duration::from_millis(400)).is_ok());
        assert!(matches!(
            sync.check(t0 + Duration::from_millis(600)),
            Err(TransportError::PingTimeout(_))
        ));
    }

    #[test]
    fn test_periodic_ping_due() {
        let mut sync = make_sync();
        let t0 = Instant::now();
        assert!(!sync.ping_due(t0));
        let ping = sync.begin(t0, TimeVal::now());
        assert!(!sync.ping_due(t0 + Duration::from_secs(2)));
        let pong = PongPayload::reply_to(&ping, TimeVal::now());
        sync.on_pong(&pong, t0);
        assert!(!sync.ping_due(t0 + Duration::from_millis(500)));
        assert!(sync.ping_due(t0 + Duration::from_secs(1)));

        let once = ClockSync::new(Duration::from_secs(1), None);
        assert!(!once.ping_due(t0 + Duration::from_secs(60)));
    }
}
