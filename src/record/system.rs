//! System records (epochs)

use std::io::{self, Read, Write};

use byteorder::{ReadBytesExt, WriteBytesExt};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::codec::{
    invalid, read_blob, read_timestamp, to_millis_precision, write_blob, write_timestamp,
};
use crate::error::{Error, Result};

/// Kind of payload carried by a system record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SystemRecordKind {
    Epoch = 0,
}

impl SystemRecordKind {
    fn from_u8(value: u8) -> io::Result<Self> {
        match value {
            0 => Ok(SystemRecordKind::Epoch),
            other => Err(invalid(format!("unknown system record kind {}", other))),
        }
    }
}

/// Leadership epoch marker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochRecord {
    pub epoch_position: i64,
    pub epoch_number: i32,
    pub epoch_id: Uuid,
    /// Position of the previous epoch record, -1 for the first epoch
    pub prev_epoch_position: i64,
    pub time_stamp: DateTime<Utc>,
}

/// A system log record
#[derive(Debug, Clone, PartialEq)]
pub struct SystemLogRecord {
    pub log_position: i64,
    pub timestamp: DateTime<Utc>,
    pub kind: SystemRecordKind,
    pub data: Vec<u8>,
}

impl SystemLogRecord {
    /// Wrap an epoch written at `log_position`
    pub fn epoch(log_position: i64, epoch: &EpochRecord) -> Result<Self> {
        if log_position < 0 {
            return Err(Error::InvalidArgument(format!(
                "log position must be non-negative, got {}",
                log_position
            )));
        }

        Ok(Self {
            log_position,
            timestamp: to_millis_precision(Utc::now()),
            kind: SystemRecordKind::Epoch,
            data: bincode::serialize(epoch)?,
        })
    }

    /// Decode the epoch payload
    pub fn epoch_record(&self) -> Result<EpochRecord> {
        match self.kind {
            SystemRecordKind::Epoch => Ok(bincode::deserialize(&self.data)?),
        }
    }

    pub(super) fn write_body<W: Write>(&self, w: &mut W) -> io::Result<()> {
        write_timestamp(w, &self.timestamp)?;
        w.write_u8(self.kind as u8)?;
        write_blob(w, &self.data)
    }

    pub(super) fn read_body<R: Read>(r: &mut R, log_position: i64) -> io::Result<Self> {
        Ok(Self {
            log_position,
            timestamp: read_timestamp(r)?,
            kind: SystemRecordKind::from_u8(r.read_u8()?)?,
            data: read_blob(r)?,
        })
    }
}
