//! Chunk file header

use std::io::{Read, Seek, SeekFrom};

use byteorder::{ByteOrder, LittleEndian};
use uuid::Uuid;

use crate::error::{Error, Result};

/// Header size in bytes
pub const HEADER_SIZE: usize = 128;

/// Chunk file format version
pub const CHUNK_FORMAT_VERSION: u8 = 3;

/// File type tags
pub(crate) const FILE_TYPE_HEADER: u8 = 1;
pub(crate) const FILE_TYPE_FOOTER: u8 = 2;

/// Transform applied to the data region
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TransformType {
    Identity = 0,
}

impl TransformType {
    fn from_u8(value: u8) -> Result<Self> {
        match value {
            0 => Ok(TransformType::Identity),
            other => Err(Error::InvalidFormat(format!(
                "unsupported data transform {}",
                other
            ))),
        }
    }
}

/// Chunk file header. Written once when the file is created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkHeader {
    pub version: u8,
    /// Size of the data region of a single chunk number
    pub chunk_size: i32,
    pub chunk_start_number: i32,
    /// Greater than the start number only for merged chunks
    pub chunk_end_number: i32,
    /// 0 for chunks written by the writer, incremented by every scavenge
    pub scavenge_version: i32,
    /// Identifies the physical file independently of its number and version
    pub chunk_id: Uuid,
    pub transform: TransformType,
}

impl ChunkHeader {
    /// Create header for a new chunk file
    pub fn new(
        chunk_size: i32,
        chunk_start_number: i32,
        chunk_end_number: i32,
        scavenge_version: i32,
    ) -> Result<Self> {
        if chunk_size <= 0 {
            return Err(Error::InvalidArgument(format!(
                "chunk size must be positive, got {}",
                chunk_size
            )));
        }
        if chunk_start_number < 0 || chunk_end_number < chunk_start_number {
            return Err(Error::InvalidArgument(format!(
                "invalid chunk range {}-{}",
                chunk_start_number, chunk_end_number
            )));
        }
        if scavenge_version < 0 {
            return Err(Error::InvalidArgument(format!(
                "scavenge version must be non-negative, got {}",
                scavenge_version
            )));
        }

        Ok(Self {
            version: CHUNK_FORMAT_VERSION,
            chunk_size,
            chunk_start_number,
            chunk_end_number,
            scavenge_version,
            chunk_id: Uuid::new_v4(),
            transform: TransformType::Identity,
        })
    }

    pub fn is_scavenged(&self) -> bool {
        self.scavenge_version > 0
    }

    /// Number of chunk numbers covered by this file
    pub fn chunk_span(&self) -> i64 {
        (self.chunk_end_number - self.chunk_start_number) as i64 + 1
    }

    /// First log position covered by the chunk
    pub fn chunk_start_position(&self) -> i64 {
        self.chunk_start_number as i64 * self.chunk_size as i64
    }

    /// First log position after the chunk
    pub fn chunk_end_position(&self) -> i64 {
        (self.chunk_end_number as i64 + 1) * self.chunk_size as i64
    }

    /// Chunk-relative logical position of a global log position
    pub fn local_position(&self, global_position: i64) -> i64 {
        global_position - self.chunk_start_position()
    }

    /// Serialize header to bytes
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut bytes = [0u8; HEADER_SIZE];
        bytes[0] = FILE_TYPE_HEADER;
        bytes[1] = self.version;
        LittleEndian::write_i32(&mut bytes[2..6], self.chunk_size);
        LittleEndian::write_i32(&mut bytes[6..10], self.chunk_start_number);
        LittleEndian::write_i32(&mut bytes[10..14], self.chunk_end_number);
        LittleEndian::write_i32(&mut bytes[14..18], self.scavenge_version);
        bytes[18..34].copy_from_slice(self.chunk_id.as_bytes());
        bytes[34] = self.transform as u8;
        bytes
    }

    /// Parse header from bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_SIZE {
            return Err(Error::InvalidFormat("chunk header too short".into()));
        }
        if bytes[0] != FILE_TYPE_HEADER {
            return Err(Error::InvalidFormat(format!(
                "expected header file type {}, found {}",
                FILE_TYPE_HEADER, bytes[0]
            )));
        }
        if bytes[1] != CHUNK_FORMAT_VERSION {
            return Err(Error::InvalidFormat(format!(
                "unsupported chunk version {}",
                bytes[1]
            )));
        }

        let mut id = [0u8; 16];
        id.copy_from_slice(&bytes[18..34]);

        let header = Self {
            version: bytes[1],
            chunk_size: LittleEndian::read_i32(&bytes[2..6]),
            chunk_start_number: LittleEndian::read_i32(&bytes[6..10]),
            chunk_end_number: LittleEndian::read_i32(&bytes[10..14]),
            scavenge_version: LittleEndian::read_i32(&bytes[14..18]),
            chunk_id: Uuid::from_bytes(id),
            transform: TransformType::from_u8(bytes[34])?,
        };

        if header.chunk_size <= 0
            || header.chunk_start_number < 0
            || header.chunk_end_number < header.chunk_start_number
            || header.scavenge_version < 0
        {
            return Err(Error::InvalidFormat(format!(
                "inconsistent chunk header: size {}, range {}-{}, scavenge version {}",
                header.chunk_size,
                header.chunk_start_number,
                header.chunk_end_number,
                header.scavenge_version
            )));
        }

        Ok(header)
    }

    /// Read the header at the start of a file
    pub fn read_from<R: Read + Seek>(reader: &mut R) -> Result<Self> {
        let mut bytes = [0u8; HEADER_SIZE];
        reader.seek(SeekFrom::Start(0))?;
        reader.read_exact(&mut bytes)?;
        Self::from_bytes(&bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_header_layout() {
        let header = ChunkHeader::new(4096, 3, 5, 2).unwrap();
        let bytes = header.to_bytes();
        assert_eq!(bytes[0], FILE_TYPE_HEADER);
        assert_eq!(bytes[1], CHUNK_FORMAT_VERSION);
        assert_eq!(&bytes[2..6], &4096i32.to_le_bytes());
        assert_eq!(&bytes[18..34], header.chunk_id.as_bytes());

        let parsed = ChunkHeader::read_from(&mut Cursor::new(bytes.to_vec())).unwrap();
        assert_eq!(parsed, header);
        assert!(parsed.is_scavenged());
        assert_eq!(parsed.chunk_span(), 3);
        assert_eq!(parsed.chunk_start_position(), 3 * 4096);
        assert_eq!(parsed.chunk_end_position(), 6 * 4096);
        assert_eq!(parsed.local_position(3 * 4096 + 10), 10);
    }

    #[test]
    fn test_header_rejects_invalid() {
        assert!(ChunkHeader::new(4096, 2, 1, 0).is_err());
        assert!(ChunkHeader::new(0, 0, 0, 0).is_err());

        let mut bytes = ChunkHeader::new(4096, 0, 0, 0).unwrap().to_bytes();
        bytes[0] = FILE_TYPE_FOOTER;
        assert!(matches!(
            ChunkHeader::from_bytes(&bytes),
            Err(Error::InvalidFormat(_))
        ));

        let mut bytes = ChunkHeader::new(4096, 0, 0, 0).unwrap().to_bytes();
        bytes[34] = 7;
        assert!(ChunkHeader::from_bytes(&bytes).is_err());

        assert!(ChunkHeader::from_bytes(&[1u8; 10]).is_err());
    }
}
