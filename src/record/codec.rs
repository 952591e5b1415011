//! Little-endian field encoding shared by the record kinds.

use std::io::{self, Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use chrono::{DateTime, Utc};
use uuid::Uuid;

pub(crate) fn invalid(msg: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.into())
}

pub(crate) fn write_blob<W: Write>(w: &mut W, bytes: &[u8]) -> io::Result<()> {
    let len = i32::try_from(bytes.len()).map_err(|_| invalid("field longer than i32::MAX"))?;
    w.write_i32::<LittleEndian>(len)?;
    w.write_all(bytes)
}

pub(crate) fn read_blob<R: Read>(r: &mut R) -> io::Result<Vec<u8>> {
    let len = r.read_i32::<LittleEndian>()?;
    if len < 0 {
        return Err(invalid(format!("negative field length {}", len)));
    }
    let mut buf = Vec::new();
    r.take(len as u64).read_to_end(&mut buf)?;
    if buf.len() != len as usize {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "field extends past end of record",
        ));
    }
    Ok(buf)
}

pub(crate) fn write_str<W: Write>(w: &mut W, s: &str) -> io::Result<()> {
    write_blob(w, s.as_bytes())
}

pub(crate) fn read_str<R: Read>(r: &mut R) -> io::Result<String> {
    String::from_utf8(read_blob(r)?).map_err(|e| invalid(e.to_string()))
}

pub(crate) fn write_uuid<W: Write>(w: &mut W, id: &Uuid) -> io::Result<()> {
    w.write_all(id.as_bytes())
}

pub(crate) fn read_uuid<R: Read>(r: &mut R) -> io::Result<Uuid> {
    let mut bytes = [0u8; 16];
    r.read_exact(&mut bytes)?;
    Ok(Uuid::from_bytes(bytes))
}

pub(crate) fn write_timestamp<W: Write>(w: &mut W, ts: &DateTime<Utc>) -> io::Result<()> {
    w.write_i64::<LittleEndian>(ts.timestamp_millis())
}

pub(crate) fn read_timestamp<R: Read>(r: &mut R) -> io::Result<DateTime<Utc>> {
    let millis = r.read_i64::<LittleEndian>()?;
    DateTime::from_timestamp_millis(millis)
        .ok_or_else(|| invalid(format!("timestamp {} out of range", millis)))
}

/// Timestamps are stored with millisecond precision
pub(crate) fn to_millis_precision(ts: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ts.timestamp_millis()).unwrap_or(ts)
}
