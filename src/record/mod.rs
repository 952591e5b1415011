//! Log Records
//!
//! The three record kinds stored in chunks and their binary form. Every
//! record starts with a kind tag, a format version and its own log position.
//! Inside a chunk each record is framed by its length before and after the
//! body so that it can be found scanning in either direction.

mod codec;
mod commit;
mod prepare;
mod system;

pub use commit::CommitLogRecord;
pub use prepare::{
    PrepareFlags, PrepareLogRecord, EXPECTED_VERSION_ANY, EXPECTED_VERSION_NO_STREAM,
    STREAM_DELETED_EVENT_TYPE,
};
pub use system::{EpochRecord, SystemLogRecord, SystemRecordKind};

use std::io::Cursor;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::error::{Error, Result};

/// Current record format version
pub const RECORD_VERSION: u8 = 1;

/// Length prefix plus length suffix
pub const FRAME_OVERHEAD: usize = 8;

/// Record kind tag
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordKind {
    Prepare = 0,
    Commit = 1,
    System = 2,
}

/// A record of the transaction log
#[derive(Debug, Clone, PartialEq)]
pub enum LogRecord {
    Prepare(PrepareLogRecord),
    Commit(CommitLogRecord),
    System(SystemLogRecord),
}

impl LogRecord {
    pub fn kind(&self) -> RecordKind {
        match self {
            LogRecord::Prepare(_) => RecordKind::Prepare,
            LogRecord::Commit(_) => RecordKind::Commit,
            LogRecord::System(_) => RecordKind::System,
        }
    }

    /// Absolute position of the record in the log
    pub fn log_position(&self) -> i64 {
        match self {
            LogRecord::Prepare(p) => p.log_position,
            LogRecord::Commit(c) => c.log_position,
            LogRecord::System(s) => s.log_position,
        }
    }

    /// Move the record to a new log position. A prepare that opens its own
    /// transaction and an epoch that points at itself move along.
    pub fn relocate(&mut self, new_position: i64) -> Result<()> {
        if new_position < 0 {
            return Err(Error::InvalidArgument(format!(
                "log position must be non-negative, got {}",
                new_position
            )));
        }

        match self {
            LogRecord::Prepare(p) => {
                if p.transaction_position == p.log_position {
                    p.transaction_position = new_position;
                }
                p.log_position = new_position;
            }
            LogRecord::Commit(c) => {
                c.log_position = new_position;
            }
            LogRecord::System(s) => {
                let mut epoch = s.epoch_record()?;
                if epoch.epoch_position == s.log_position {
                    epoch.epoch_position = new_position;
                    s.data = bincode::serialize(&epoch)?;
                }
                s.log_position = new_position;
            }
        }
        Ok(())
    }

    /// Append the unframed record body to `out`
    pub fn encode(&self, out: &mut Vec<u8>) -> Result<()> {
        out.write_u8(self.kind() as u8)?;
        out.write_u8(RECORD_VERSION)?;
        out.write_i64::<LittleEndian>(self.log_position())?;
        match self {
            LogRecord::Prepare(p) => p.write_body(out)?,
            LogRecord::Commit(c) => c.write_body(out)?,
            LogRecord::System(s) => s.write_body(out)?,
        }
        Ok(())
    }

    /// Append `[len][body][len]` to `out`, returning the framed length
    pub fn encode_framed(&self, out: &mut Vec<u8>) -> Result<usize> {
        let start = out.len();
        out.write_i32::<LittleEndian>(0)?;
        self.encode(out)?;

        let body_len = out.len() - start - 4;
        let len = i32::try_from(body_len)
            .map_err(|_| Error::InvalidRecord(format!("record body of {} bytes", body_len)))?;
        out[start..start + 4].copy_from_slice(&len.to_le_bytes());
        out.write_i32::<LittleEndian>(len)?;

        Ok(out.len() - start)
    }

    /// Size of the record including its length prefix and suffix
    pub fn framed_size(&self) -> Result<usize> {
        let mut buf = Vec::new();
        self.encode_framed(&mut buf)
    }

    /// Decode an unframed record body
    pub fn decode(bytes: &[u8]) -> Result<LogRecord> {
        let mut cursor = Cursor::new(bytes);
        let record = Self::decode_from(&mut cursor)
            .map_err(|e| Error::InvalidRecord(e.to_string()))?;

        if cursor.position() as usize != bytes.len() {
            return Err(Error::InvalidRecord(format!(
                "{} trailing bytes after record",
                bytes.len() - cursor.position() as usize
            )));
        }
        Ok(record)
    }

    fn decode_from(cursor: &mut Cursor<&[u8]>) -> std::io::Result<LogRecord> {
        let kind = cursor.read_u8()?;
        let version = cursor.read_u8()?;
        if version != RECORD_VERSION {
            return Err(codec::invalid(format!(
                "unsupported record version {}",
                version
            )));
        }
        let log_position = cursor.read_i64::<LittleEndian>()?;

        match kind {
            k if k == RecordKind::Prepare as u8 => Ok(LogRecord::Prepare(
                PrepareLogRecord::read_body(cursor, log_position)?,
            )),
            k if k == RecordKind::Commit as u8 => Ok(LogRecord::Commit(
                CommitLogRecord::read_body(cursor, log_position)?,
            )),
            k if k == RecordKind::System as u8 => Ok(LogRecord::System(
                SystemLogRecord::read_body(cursor, log_position)?,
            )),
            other => Err(codec::invalid(format!("unknown record kind {}", other))),
        }
    }

    pub fn as_prepare(&self) -> Option<&PrepareLogRecord> {
        match self {
            LogRecord::Prepare(p) => Some(p),
            _ => None,
        }
    }

    pub fn as_commit(&self) -> Option<&CommitLogRecord> {
        match self {
            LogRecord::Commit(c) => Some(c),
            _ => None,
        }
    }
}

impl From<PrepareLogRecord> for LogRecord {
    fn from(record: PrepareLogRecord) -> Self {
        LogRecord::Prepare(record)
    }
}

impl From<CommitLogRecord> for LogRecord {
    fn from(record: CommitLogRecord) -> Self {
        LogRecord::Commit(record)
    }
}

impl From<SystemLogRecord> for LogRecord {
    fn from(record: SystemLogRecord) -> Self {
        LogRecord::System(record)
    }
}
