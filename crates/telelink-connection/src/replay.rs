//! Log replay and its remote controller.
//!
//! A [`LogReplay`] plays a preloaded log against a virtual clock that
//! advances by `wall time * rate`. Entries keep their file order: an entry
//! stamped earlier than its predecessor becomes due right after it.

use crate::connection::Connection;
use crate::logger::{read_log, LogEntry};
use std::path::Path;
use std::time::Duration;
use telelink_types::{
    Message, MessageTypeId, SenderId, TimeVal, TransportError, TransportResult,
};
use telelink_wire::system::{ReplayControl, REPLAY_CONTROLLER_SENDER};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayState {
    Idle,
    Playing,
}

#[derive(Debug)]
pub struct LogReplay {
    entries: Vec<LogEntry>,
    /// Due time of each entry relative to the first, never decreasing.
    offsets: Vec<Duration>,
    cursor: usize,
    rate: f32,
    state: ReplayState,
    played: Duration,
}

impl LogReplay {
    pub fn open(path: &Path) -> TransportResult<Self> {
        Ok(Self::from_entries(read_log(path)?))
    }

    pub fn from_entries(entries: Vec<LogEntry>) -> Self {
        let first = entries.first().map(|e| e.message.timestamp);
        let mut floor = Duration::ZERO;
        let offsets = entries
            .iter()
            .map(|e| {
                if let Some(first) = first {
                    floor = floor.max(e.message.timestamp.saturating_duration_since(first));
                }
                floor
            })
            .collect();
        let state = if entries.is_empty() {
            ReplayState::Idle
        } else {
            ReplayState::Playing
        };
        Self {
            entries,
            offsets,
            cursor: 0,
            rate: 1.0,
            state,
            played: Duration::ZERO,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Index of the next entry to play.
    pub fn position(&self) -> usize {
        self.cursor
    }

    pub fn state(&self) -> ReplayState {
        self.state
    }

    pub fn rate(&self) -> f32 {
        self.rate
    }

    pub fn is_finished(&self) -> bool {
        self.cursor >= self.entries.len()
    }

    /// Log time played so far.
    pub fn elapsed(&self) -> Duration {
        self.played
    }

    pub fn start_time(&self) -> Option<TimeVal> {
        self.entries.first().map(|e| e.message.timestamp)
    }

    /// Span between the first entry and the last entry's due time.
    pub fn duration(&self) -> Duration {
        self.offsets.last().copied().unwrap_or_default()
    }

    /// Scale playback speed. `rate` must be positive and finite.
    pub fn set_rate(&mut self, rate: f32) -> TransportResult<()> {
        if !(rate > 0.0 && rate.is_finite()) {
            return Err(TransportError::InvalidReplayRate(rate));
        }
        self.rate = rate;
        Ok(())
    }

    /// Seek back to the first entry and play again. The rate is kept.
    pub fn reset(&mut self) {
        self.cursor = 0;
        self.played = Duration::ZERO;
        self.state = if self.entries.is_empty() {
            ReplayState::Idle
        } else {
            ReplayState::Playing
        };
    }

    pub fn stop(&mut self) {
        self.state = ReplayState::Idle;
    }

    pub fn play(&mut self) {
        if !self.is_finished() {
            self.state = ReplayState::Playing;
        }
    }

    /// Advance the virtual clock by `wall` real time and return the entries
    /// that became due.
    pub fn advance(&mut self, wall: Duration) -> Vec<LogEntry> {
        if self.state != ReplayState::Playing {
            return Vec::new();
        }
        self.played += wall.mul_f64(self.rate as f64);
        let start = self.cursor;
        while self.cursor < self.entries.len() && self.offsets[self.cursor] <= self.played {
            self.cursor += 1;
        }
        self.finish_if_done();
        self.entries[start..self.cursor].to_vec()
    }

    /// Play immediately every entry before the first user message stamped at
    /// or after `t`. System entries on the way are always played. Paced
    /// playback, if running, continues from `t`.
    pub fn play_to_time(&mut self, t: TimeVal) -> Vec<LogEntry> {
        let start = self.cursor;
        while let Some(entry) = self.entries.get(self.cursor) {
            if entry.message.type_id.is_user() && entry.message.timestamp >= t {
                break;
            }
            self.cursor += 1;
        }
        if let Some(first) = self.start_time() {
            self.played = self.played.max(t.saturating_duration_since(first));
        }
        self.finish_if_done();
        self.entries[start..self.cursor].to_vec()
    }

    /// Real time until the next entry is due at the current rate.
    pub fn time_to_next(&self) -> Option<Duration> {
        if self.state != ReplayState::Playing {
            return None;
        }
        let due = *self.offsets.get(self.cursor)?;
        Some(due.saturating_sub(self.played).div_f64(self.rate as f64))
    }

    fn finish_if_done(&mut self) {
        if self.is_finished() {
            self.state = ReplayState::Idle;
        }
    }

    pub(crate) fn apply(&mut self, control: ReplayControl) -> TransportResult<Vec<LogEntry>> {
        match control {
            ReplayControl::SetRate(rate) => self.set_rate(rate)?,
            ReplayControl::Reset => self.reset(),
            ReplayControl::PlayToTime(t) => return Ok(self.play_to_time(t)),
            ReplayControl::Stop => self.stop(),
            ReplayControl::Play => self.play(),
        }
        Ok(Vec::new())
    }
}

/// Drives a log-backed connection through ordinary messages.
///
/// The controller registers its own sender and one type per command on the
/// connection; the connection recognizes those types and applies them to its
/// replay.
#[derive(Debug, Clone, Copy)]
pub struct ReplayController {
    sender: SenderId,
    set_rate: MessageTypeId,
    reset: MessageTypeId,
    play_to_time: MessageTypeId,
    stop: MessageTypeId,
    play: MessageTypeId,
}

impl ReplayController {
    pub fn new(connection: &mut Connection) -> Self {
        Self {
            sender: connection.register_sender(REPLAY_CONTROLLER_SENDER),
            set_rate: connection.register_type(ReplayControl::SET_RATE),
            reset: connection.register_type(ReplayControl::RESET),
            play_to_time: connection.register_type(ReplayControl::PLAY_TO_TIME),
            stop: connection.register_type(ReplayControl::STOP),
            play: connection.register_type(ReplayControl::PLAY),
        }
    }

    fn send(
        &self,
        connection: &mut Connection,
        type_id: MessageTypeId,
        control: ReplayControl,
    ) -> TransportResult<()> {
        connection.send(Message::new(type_id, self.sender, control.encode()?))
    }

    /// Change playback speed. Non-positive rates are rejected before anything
    /// is sent.
    pub fn set_replay_rate(&self, connection: &mut Connection, rate: f32) -> TransportResult<()> {
        if !(rate > 0.0 && rate.is_finite()) {
            return Err(TransportError::InvalidReplayRate(rate));
        }
        self.send(connection, self.set_rate, ReplayControl::SetRate(rate))
    }

    pub fn reset(&self, connection: &mut Connection) -> TransportResult<()> {
        self.send(connection, self.reset, ReplayControl::Reset)
    }

    pub fn play_to_time(&self, connection: &mut Connection, t: TimeVal) -> TransportResult<()> {
        self.send(connection, self.play_to_time, ReplayControl::PlayToTime(t))
    }

    pub fn stop(&self, connection: &mut Connection) -> TransportResult<()> {
        self.send(connection, self.stop, ReplayControl::Stop)
    }

    pub fn play(&self, connection: &mut Connection) -> TransportResult<()> {
        self.send(connection, self.play, ReplayControl::Play)
    }
}
