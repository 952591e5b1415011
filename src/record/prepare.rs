//! Prepare records: one event of a (possibly multi-event) transaction.

use std::io::{self, Read, Write};
use std::ops::BitOr;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::codec::{
    read_blob, read_str, read_timestamp, read_uuid, to_millis_precision, write_blob, write_str,
    write_timestamp, write_uuid,
};
use crate::error::{Error, Result};

/// Expected version meaning "no particular version"
pub const EXPECTED_VERSION_ANY: i64 = -2;
/// Expected version meaning "the stream must not exist"
pub const EXPECTED_VERSION_NO_STREAM: i64 = -1;

/// Event type written by stream tombstones
pub const STREAM_DELETED_EVENT_TYPE: &str = "$streamDeleted";

/// Prepare record flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct PrepareFlags(u16);

impl PrepareFlags {
    pub const NONE: Self = Self(0x00);
    /// The prepare carries an event
    pub const DATA: Self = Self(0x01);
    pub const TRANSACTION_BEGIN: Self = Self(0x02);
    pub const TRANSACTION_END: Self = Self(0x04);
    /// Stream tombstone
    pub const STREAM_DELETE: Self = Self(0x08);
    /// Committed inline, no separate commit record follows
    pub const IS_COMMITTED: Self = Self(0x20);
    pub const IS_JSON: Self = Self(0x100);

    /// A self-contained single-event transaction
    pub const SINGLE_WRITE: Self = Self(0x01 | 0x02 | 0x04);

    pub const fn bits(self) -> u16 {
        self.0
    }

    pub const fn from_bits(bits: u16) -> Self {
        Self(bits)
    }

    /// All of `other`'s bits are set
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Any of `other`'s bits are set
    pub const fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }
}

impl BitOr for PrepareFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// A prepare log record
#[derive(Debug, Clone, PartialEq)]
pub struct PrepareLogRecord {
    pub log_position: i64,
    pub flags: PrepareFlags,
    /// Position of the first prepare of the transaction
    pub transaction_position: i64,
    /// Index of this prepare among the transaction's events, -1 for none
    pub transaction_offset: i32,
    pub expected_version: i64,
    pub event_stream_id: String,
    pub event_id: Uuid,
    pub correlation_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    pub data: Vec<u8>,
    pub metadata: Vec<u8>,
}

impl PrepareLogRecord {
    /// Build a prepare, rejecting malformed arguments
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        log_position: i64,
        correlation_id: Uuid,
        event_id: Uuid,
        transaction_position: i64,
        transaction_offset: i32,
        event_stream_id: impl Into<String>,
        expected_version: i64,
        timestamp: DateTime<Utc>,
        flags: PrepareFlags,
        event_type: impl Into<String>,
        data: Vec<u8>,
        metadata: Vec<u8>,
    ) -> Result<Self> {
        let event_stream_id = event_stream_id.into();
        let event_type = event_type.into();

        if log_position < 0 {
            return Err(Error::InvalidArgument(format!(
                "log position must be non-negative, got {}",
                log_position
            )));
        }
        if transaction_position < 0 || transaction_position > log_position {
            return Err(Error::InvalidArgument(format!(
                "transaction position {} must be in [0, {}]",
                transaction_position, log_position
            )));
        }
        if transaction_offset < -1 {
            return Err(Error::InvalidArgument(format!(
                "transaction offset must be >= -1, got {}",
                transaction_offset
            )));
        }
        if expected_version < EXPECTED_VERSION_ANY {
            return Err(Error::InvalidArgument(format!(
                "expected version must be >= {}, got {}",
                EXPECTED_VERSION_ANY, expected_version
            )));
        }
        if event_stream_id.is_empty() {
            return Err(Error::InvalidArgument("event stream id is empty".into()));
        }
        if flags.contains(PrepareFlags::DATA) && event_type.is_empty() {
            return Err(Error::InvalidArgument(
                "event type is empty on a data prepare".into(),
            ));
        }

        Ok(Self {
            log_position,
            flags,
            transaction_position,
            transaction_offset,
            expected_version,
            event_stream_id,
            event_id,
            correlation_id,
            timestamp: to_millis_precision(timestamp),
            event_type,
            data,
            metadata,
        })
    }

    /// A single event committed inline
    pub fn single_write(
        log_position: i64,
        event_stream_id: impl Into<String>,
        expected_version: i64,
        event_type: impl Into<String>,
        data: Vec<u8>,
        metadata: Vec<u8>,
    ) -> Result<Self> {
        Self::new(
            log_position,
            Uuid::new_v4(),
            Uuid::new_v4(),
            log_position,
            0,
            event_stream_id,
            expected_version,
            Utc::now(),
            PrepareFlags::SINGLE_WRITE | PrepareFlags::IS_COMMITTED,
            event_type,
            data,
            metadata,
        )
    }

    /// A stream tombstone committed inline
    pub fn delete_tombstone(
        log_position: i64,
        event_stream_id: impl Into<String>,
        expected_version: i64,
    ) -> Result<Self> {
        Self::new(
            log_position,
            Uuid::new_v4(),
            Uuid::new_v4(),
            log_position,
            0,
            event_stream_id,
            expected_version,
            Utc::now(),
            PrepareFlags::STREAM_DELETE
                | PrepareFlags::SINGLE_WRITE
                | PrepareFlags::IS_COMMITTED,
            STREAM_DELETED_EVENT_TYPE,
            Vec::new(),
            Vec::new(),
        )
    }

    pub fn is_committed_inline(&self) -> bool {
        self.flags.contains(PrepareFlags::IS_COMMITTED)
    }

    pub(super) fn write_body<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_u16::<LittleEndian>(self.flags.bits())?;
        w.write_i64::<LittleEndian>(self.transaction_position)?;
        w.write_i32::<LittleEndian>(self.transaction_offset)?;
        w.write_i64::<LittleEndian>(self.expected_version)?;
        write_str(w, &self.event_stream_id)?;
        write_uuid(w, &self.event_id)?;
        write_uuid(w, &self.correlation_id)?;
        write_timestamp(w, &self.timestamp)?;
        write_str(w, &self.event_type)?;
        write_blob(w, &self.data)?;
        write_blob(w, &self.metadata)
    }

    pub(super) fn read_body<R: Read>(r: &mut R, log_position: i64) -> io::Result<Self> {
        Ok(Self {
            log_position,
            flags: PrepareFlags::from_bits(r.read_u16::<LittleEndian>()?),
            transaction_position: r.read_i64::<LittleEndian>()?,
            transaction_offset: r.read_i32::<LittleEndian>()?,
            expected_version: r.read_i64::<LittleEndian>()?,
            event_stream_id: read_str(r)?,
            event_id: read_uuid(r)?,
            correlation_id: read_uuid(r)?,
            timestamp: read_timestamp(r)?,
            event_type: read_str(r)?,
            data: read_blob(r)?,
            metadata: read_blob(r)?,
        })
    }
}
