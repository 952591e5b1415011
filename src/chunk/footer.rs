//! Chunk file footer and position map entries

use std::io::{Read, Seek, SeekFrom};

use byteorder::{ByteOrder, LittleEndian};

use super::header::FILE_TYPE_FOOTER;
use crate::error::{Error, Result};

/// Footer size in bytes
pub const FOOTER_SIZE: usize = 128;

/// Width of the checksum stored in the last bytes of the footer
pub const CHECKSUM_SIZE: usize = 32;

/// Offset of the checksum inside the footer
pub const CHECKSUM_OFFSET: usize = FOOTER_SIZE - CHECKSUM_SIZE;

/// Size of one position map entry
pub const POS_MAP_SIZE: usize = 12;

const FLAG_COMPLETED: u8 = 0x01;

/// Chunk file footer, written once when the chunk becomes read-only
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkFooter {
    pub is_completed: bool,
    /// Bytes of framed records in the data region
    pub physical_data_size: i32,
    /// Extent of log positions covered; equals the physical size unless scavenged
    pub logical_data_size: i64,
    /// Bytes of position map between the data region and the footer
    pub map_size: i32,
    pub checksum: [u8; CHECKSUM_SIZE],
}

impl ChunkFooter {
    pub fn new(
        physical_data_size: i32,
        logical_data_size: i64,
        map_size: i32,
        checksum: [u8; CHECKSUM_SIZE],
    ) -> Self {
        Self {
            is_completed: true,
            physical_data_size,
            logical_data_size,
            map_size,
            checksum,
        }
    }

    /// Number of position map entries
    pub fn map_count(&self) -> usize {
        self.map_size as usize / POS_MAP_SIZE
    }

    /// Serialize footer to bytes
    pub fn to_bytes(&self) -> [u8; FOOTER_SIZE] {
        let mut bytes = [0u8; FOOTER_SIZE];
        bytes[0] = FILE_TYPE_FOOTER;
        bytes[1] = if self.is_completed { FLAG_COMPLETED } else { 0 };
        LittleEndian::write_i32(&mut bytes[2..6], self.physical_data_size);
        LittleEndian::write_i64(&mut bytes[6..14], self.logical_data_size);
        LittleEndian::write_i32(&mut bytes[14..18], self.map_size);
        bytes[CHECKSUM_OFFSET..].copy_from_slice(&self.checksum);
        bytes
    }

    /// Parse footer from bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < FOOTER_SIZE {
            return Err(Error::InvalidFormat("chunk footer too short".into()));
        }
        if bytes[0] != FILE_TYPE_FOOTER {
            return Err(Error::InvalidFormat(format!(
                "expected footer file type {}, found {}",
                FILE_TYPE_FOOTER, bytes[0]
            )));
        }

        let mut checksum = [0u8; CHECKSUM_SIZE];
        checksum.copy_from_slice(&bytes[CHECKSUM_OFFSET..FOOTER_SIZE]);

        let footer = Self {
            is_completed: bytes[1] & FLAG_COMPLETED != 0,
            physical_data_size: LittleEndian::read_i32(&bytes[2..6]),
            logical_data_size: LittleEndian::read_i64(&bytes[6..14]),
            map_size: LittleEndian::read_i32(&bytes[14..18]),
            checksum,
        };

        if footer.physical_data_size < 0
            || footer.logical_data_size < footer.physical_data_size as i64
            || footer.map_size < 0
            || footer.map_size as usize % POS_MAP_SIZE != 0
        {
            return Err(Error::InvalidFormat(format!(
                "inconsistent chunk footer: physical {}, logical {}, map {}",
                footer.physical_data_size, footer.logical_data_size, footer.map_size
            )));
        }

        Ok(footer)
    }

    /// Read the footer occupying the last bytes of a file. Returns `None`
    /// when no footer has been written yet.
    pub fn read_from<R: Read + Seek>(reader: &mut R) -> Result<Option<Self>> {
        let len = reader.seek(SeekFrom::End(0))?;
        if len < FOOTER_SIZE as u64 {
            return Err(Error::InvalidFormat(format!(
                "file of {} bytes cannot hold a footer",
                len
            )));
        }

        let mut bytes = [0u8; FOOTER_SIZE];
        reader.seek(SeekFrom::Start(len - FOOTER_SIZE as u64))?;
        reader.read_exact(&mut bytes)?;

        if bytes[0] != FILE_TYPE_FOOTER {
            return Ok(None);
        }
        Self::from_bytes(&bytes).map(Some)
    }
}

/// Maps the logical position of a record that survived scavenging to
/// where it now physically lives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PosMap {
    /// Chunk-relative logical position
    pub log_pos: i64,
    /// Offset within the data region
    pub actual_pos: i32,
}

impl PosMap {
    pub fn new(log_pos: i64, actual_pos: i32) -> Self {
        Self { log_pos, actual_pos }
    }

    pub fn to_bytes(&self) -> [u8; POS_MAP_SIZE] {
        let mut bytes = [0u8; POS_MAP_SIZE];
        LittleEndian::write_i64(&mut bytes[0..8], self.log_pos);
        LittleEndian::write_i32(&mut bytes[8..12], self.actual_pos);
        bytes
    }

    pub fn from_bytes(bytes: &[u8; POS_MAP_SIZE]) -> Self {
        Self {
            log_pos: LittleEndian::read_i64(&bytes[0..8]),
            actual_pos: LittleEndian::read_i32(&bytes[8..12]),
        }
    }
}
