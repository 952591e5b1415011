//! Commit records

use std::io::{self, Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::codec::{read_timestamp, read_uuid, to_millis_precision, write_timestamp, write_uuid};
use crate::error::{Error, Result};

/// Finalizes the prepares starting at `transaction_position`, assigning
/// event numbers from `first_event_number` upwards.
#[derive(Debug, Clone, PartialEq)]
pub struct CommitLogRecord {
    pub log_position: i64,
    pub transaction_position: i64,
    pub first_event_number: i64,
    pub correlation_id: Uuid,
    pub timestamp: DateTime<Utc>,
}

impl CommitLogRecord {
    pub fn new(
        log_position: i64,
        correlation_id: Uuid,
        transaction_position: i64,
        timestamp: DateTime<Utc>,
        first_event_number: i64,
    ) -> Result<Self> {
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
        if first_event_number < 0 {
            return Err(Error::InvalidArgument(format!(
                "first event number must be non-negative, got {}",
                first_event_number
            )));
        }

        Ok(Self {
            log_position,
            transaction_position,
            first_event_number,
            correlation_id,
            timestamp: to_millis_precision(timestamp),
        })
    }

    pub(super) fn write_body<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_i64::<LittleEndian>(self.transaction_position)?;
        w.write_i64::<LittleEndian>(self.first_event_number)?;
        write_uuid(w, &self.correlation_id)?;
        write_timestamp(w, &self.timestamp)
    }

    pub(super) fn read_body<R: Read>(r: &mut R, log_position: i64) -> io::Result<Self> {
        Ok(Self {
            log_position,
            transaction_position: r.read_i64::<LittleEndian>()?,
            first_event_number: r.read_i64::<LittleEndian>()?,
            correlation_id: read_uuid(r)?,
            timestamp: read_timestamp(r)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_commit_validation() {
        assert!(CommitLogRecord::new(100, Uuid::new_v4(), 40, Utc::now(), 3).is_ok());
        assert!(CommitLogRecord::new(100, Uuid::new_v4(), 140, Utc::now(), 3).is_err());
        assert!(CommitLogRecord::new(-5, Uuid::new_v4(), 0, Utc::now(), 3).is_err());
        assert!(CommitLogRecord::new(100, Uuid::new_v4(), 40, Utc::now(), -1).is_err());
    }
}
