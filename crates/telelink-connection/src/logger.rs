//! Persistent message log.
//!
//! A log file is the 24-byte cookie followed by frames in the exact wire
//! layout, all ids in the recording process's local id space. Descriptions
//! for every name are recorded before the first message that uses it, so a
//! log can always be replayed on its own.

use bytes::BytesMut;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use telelink_types::{
    LogConfig, LogMode, Message, MessageTypeId, SenderId, TransportError, TransportResult,
};
use telelink_wire::cookie::{check_cookie, cookie, COOKIE_LEN};
use telelink_wire::frame::{try_decode, Frame, MAX_FRAME_LEN};
use tracing::{info, warn};

/// One logged message and its position in the log.
#[derive(Debug, Clone, PartialEq)]
pub struct LogEntry {
    pub message: Message,
    pub sequence: u64,
}

/// Decision of a log filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterVerdict {
    Keep,
    Suppress,
}

/// Predicate deciding whether a user message is logged. Receives local ids.
pub type LogFilter = Box<dyn FnMut(MessageTypeId, SenderId) -> FilterVerdict + Send>;

pub struct FileLogger {
    path: PathBuf,
    mode: LogMode,
    writer: BufWriter<File>,
    pending: Vec<LogEntry>,
    flush_threshold: usize,
    filters: Vec<LogFilter>,
    next_sequence: u64,
    suppressed: u64,
}

impl FileLogger {
    /// Create a new log file. Refuses to overwrite an existing file.
    pub fn create(config: &LogConfig) -> TransportResult<Self> {
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&config.path)
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::AlreadyExists => TransportError::Log(format!(
                    "log file {} already exists",
                    config.path.display()
                )),
                _ => TransportError::Io(e),
            })?;
        let mut writer = BufWriter::new(file);
        writer.write_all(&cookie())?;
        info!(path = %config.path.display(), mode = ?config.mode, "Logging started");
        Ok(Self {
            path: config.path.clone(),
            mode: config.mode,
            writer,
            pending: Vec::new(),
            flush_threshold: config.flush_threshold.max(1),
            filters: Vec::new(),
            next_sequence: 0,
            suppressed: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn mode(&self) -> LogMode {
        self.mode
    }

    pub fn add_filter(&mut self, filter: LogFilter) {
        self.filters.push(filter);
    }

    /// Append a message. User messages pass through the filters first;
    /// system messages are always kept. Returns whether it was logged.
    pub fn record(&mut self, message: &Message) -> TransportResult<bool> {
        if message.type_id.is_user() {
            for filter in self.filters.iter_mut() {
                if filter(message.type_id, message.sender) == FilterVerdict::Suppress {
                    self.suppressed += 1;
                    return Ok(false);
                }
            }
        }
        self.pending.push(LogEntry {
            message: message.clone(),
            sequence: self.next_sequence,
        });
        self.next_sequence += 1;
        if self.pending.len() >= self.flush_threshold {
            self.flush()?;
        }
        Ok(true)
    }

    /// Write buffered entries to disk.
    pub fn flush(&mut self) -> TransportResult<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let mut out = BytesMut::new();
        for entry in self.pending.drain(..) {
            Frame::from_message(&entry.message).encode_into(&mut out, MAX_FRAME_LEN)?;
        }
        self.writer.write_all(&out)?;
        self.writer.flush()?;
        Ok(())
    }

    /// Entries accepted so far.
    pub fn recorded(&self) -> u64 {
        self.next_sequence
    }

    pub fn suppressed(&self) -> u64 {
        self.suppressed
    }
}

impl Drop for FileLogger {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            warn!(error = %e, path = %self.path.display(), "Failed to flush log on close");
        }
    }
}

/// Read a whole log file into memory.
pub fn read_log(path: &Path) -> TransportResult<Vec<LogEntry>> {
    let data = std::fs::read(path)?;
    if data.len() < COOKIE_LEN {
        return Err(TransportError::Log(format!(
            "{} is too short to be a log",
            path.display()
        )));
    }
    check_cookie(&data[..COOKIE_LEN])
        .map_err(|e| TransportError::Log(format!("{}: {e}", path.display())))?;

    let mut buf = BytesMut::from(&data[COOKIE_LEN..]);
    let mut entries = Vec::new();
    while let Some(frame) = try_decode(&mut buf)? {
        entries.push(LogEntry {
            message: frame.into_message(),
            sequence: entries.len() as u64,
        });
    }
    if !buf.is_empty() {
        warn!(
            path = %path.display(),
            trailing = buf.len(),
            "Log ends with a partial frame, ignoring it"
        );
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use telelink_types::{SystemType, TimeVal};

    fn make_config(dir: &tempfile::TempDir, threshold: usize) -> LogConfig {
        LogConfig {
            path: dir.path().join("session.tlog"),
            mode: LogMode::Both,
            flush_threshold: threshold,
        }
    }

    fn user(type_id: i32, sender: i32, byte: u8) -> Message {
        Message::new(MessageTypeId(type_id), SenderId(sender), vec![byte; 3])
            .with_timestamp(TimeVal::new(50, byte as i32))
    }

    #[test]
    fn test_log_written_and_read_back_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let config = make_config(&dir, 2);
        {
            let mut logger = FileLogger::create(&config).unwrap();
            for i in 0..5u8 {
                assert!(logger.record(&user(0, 0, i)).unwrap());
            }
            assert_eq!(logger.recorded(), 5);
        }
        let entries = read_log(&config.path).unwrap();
        assert_eq!(entries.len(), 5);
        for (i, entry) in entries.iter().enumerate() {
            assert_eq!(entry.sequence, i as u64);
            assert_eq!(&entry.message.payload[..], &[i as u8; 3]);
            assert_eq!(entry.message.timestamp, TimeVal::new(50, i as i32));
        }
    }

    #[test]
    fn test_filters_never_suppress_system_messages() {
        let dir = tempfile::tempdir().unwrap();
        let config = make_config(&dir, 64);
        let mut logger = FileLogger::create(&config).unwrap();
        logger.add_filter(Box::new(|type_id, _sender| {
            if type_id == MessageTypeId(1) {
                FilterVerdict::Suppress
            } else {
                FilterVerdict::Keep
            }
        }));
        logger.add_filter(Box::new(|_type_id, _sender| FilterVerdict::Suppress));

        let description = Message::new(SystemType::TypeDescription.id(), SenderId(1), vec![0u8; 4]);
        assert!(logger.record(&description).unwrap());
        assert!(!logger.record(&user(1, 0, 1)).unwrap());
        assert!(!logger.record(&user(2, 0, 2)).unwrap());
        assert_eq!(logger.suppressed(), 2);
        drop(logger);

        let entries = read_log(&config.path).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].message.type_id, SystemType::TypeDescription.id());
    }

    #[test]
    fn test_existing_log_not_overwritten() {
        let dir = tempfile::tempdir().unwrap();
        let config = make_config(&dir, 1);
        std::fs::write(&config.path, b"keep me").unwrap();
        assert!(matches!(
            FileLogger::create(&config),
            Err(TransportError::Log(_))
        ));
        assert_eq!(std::fs::read(&config.path).unwrap(), b"keep me");
    }

    #[test]
    fn test_read_rejects_foreign_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("foreign.bin");
        std::fs::write(&path, [0x42u8; 64]).unwrap();
        assert!(matches!(read_log(&path), Err(TransportError::Log(_))));
    }

    #[test]
    fn test_truncated_tail_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let config = make_config(&dir, 1);
        {
            let mut logger = FileLogger::create(&config).unwrap();
            logger.record(&user(0, 0, 1)).unwrap();
            logger.record(&user(0, 0, 2)).unwrap();
        }
        let mut data = std::fs::read(&config.path).unwrap();
        data.truncate(data.len() - 4);
        std::fs::write(&config.path, &data).unwrap();
        assert_eq!(read_log(&config.path).unwrap().len(), 1);
    }
}
