//! Record framing shared by both file formats
//!
//! File layout:
//! ```text
//! +--------+---------+---------------------+--------+---------+
//! | Magic  | Version | Records ...         | Footer | Trailer |
//! | 8B     | 4B      |                     | var    | 24B     |
//! +--------+---------+---------------------+--------+---------+
//! ```
//!
//! Record format:
//! ```text
//! +-------+------+--------+-------------+-----------+--------+---------+--------+
//! | Magic | Kind | Column | First entry | N entries | Length | Payload | CRC32C |
//! | 4B    | 1B   | 4B     | 8B          | 4B        | 4B     | var     | 4B     |
//! +-------+------+--------+-------------+-----------+--------+---------+--------+
//! ```
//!
//! Trailer format:
//! ```text
//! +---------------+------------+------------+-------+
//! | Footer offset | Footer len | Footer CRC | Magic |
//! | 8B            | 4B         | 4B         | 8B    |
//! +---------------+------------+------------+-------+
//! ```
//!
//! The footer is the bincode-encoded directory of the file.

use auxcol_common::checksum::Crc32cState;
use auxcol_common::{Error, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};

/// Record magic number
const RECORD_MAGIC: u32 = 0x4155_5852; // "AUXR"

/// Format version written to new files
pub const FORMAT_VERSION: u32 = 1;

/// File header size (magic + version)
pub const FILE_HEADER_SIZE: u64 = 12;

/// Record header size (magic + kind + column + first_entry + n_entries + length)
pub const RECORD_HEADER_SIZE: usize = 25;

/// Trailer size (footer offset + footer length + footer crc + magic)
pub const TRAILER_SIZE: u64 = 24;

/// Record kind enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordKind {
    /// Entries of one legacy branch
    Basket = 1,
    /// Entries of one native field within one cluster
    Page = 2,
}

impl RecordKind {
    fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(Self::Basket),
            2 => Some(Self::Page),
            _ => None,
        }
    }
}

/// One framed block of column entries
#[derive(Debug, Clone)]
pub struct Record {
    pub kind: RecordKind,
    /// Index of the column within the file directory
    pub column: u32,
    /// Row number of the first entry in the payload
    pub first_entry: u64,
    /// Number of entries in the payload
    pub n_entries: u32,
    /// Entry table followed by entry bytes, see [`pack_entries`]
    pub payload: Bytes,
}

impl Record {
    /// Serialize the record including its trailing CRC
    #[allow(clippy::cast_possible_truncation)]
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(RECORD_HEADER_SIZE + self.payload.len() + 4);
        buf.put_u32_le(RECORD_MAGIC);
        buf.put_u8(self.kind as u8);
        buf.put_u32_le(self.column);
        buf.put_u64_le(self.first_entry);
        buf.put_u32_le(self.n_entries);
        buf.put_u32_le(self.payload.len() as u32);
        buf.put_slice(&self.payload);

        let crc = crc32c::crc32c(&buf);
        buf.put_u32_le(crc);
        buf.freeze()
    }

    /// Deserialize and verify a record
    pub fn from_bytes(data: Bytes) -> Result<Self> {
        if data.len() < RECORD_HEADER_SIZE + 4 {
            return Err(Error::format("record too small"));
        }

        let mut header = &data[..RECORD_HEADER_SIZE];
        let magic = header.get_u32_le();
        if magic != RECORD_MAGIC {
            return Err(Error::format(format!("invalid record magic: {magic:#x}")));
        }
        let kind_raw = header.get_u8();
        let kind = RecordKind::from_u8(kind_raw)
            .ok_or_else(|| Error::format(format!("invalid record kind: {kind_raw}")))?;
        let column = header.get_u32_le();
        let first_entry = header.get_u64_le();
        let n_entries = header.get_u32_le();
        let len = header.get_u32_le() as usize;

        let total = RECORD_HEADER_SIZE + len + 4;
        if data.len() < total {
            return Err(Error::format("record truncated"));
        }

        let stored_crc = (&data[RECORD_HEADER_SIZE + len..total]).get_u32_le();
        let computed_crc = crc32c::crc32c(&data[..RECORD_HEADER_SIZE + len]);
        if stored_crc != computed_crc {
            return Err(Error::format(format!(
                "record checksum mismatch: stored {stored_crc:#x}, computed {computed_crc:#x}"
            )));
        }

        Ok(Self {
            kind,
            column,
            first_entry,
            n_entries,
            payload: data.slice(RECORD_HEADER_SIZE..RECORD_HEADER_SIZE + len),
        })
    }
}

/// Concatenate entries behind a table of their lengths
#[allow(clippy::cast_possible_truncation)]
pub fn pack_entries(entries: &[Bytes]) -> Bytes {
    let body: usize = entries.iter().map(Bytes::len).sum();
    let mut buf = BytesMut::with_capacity(entries.len() * 4 + body);
    for entry in entries {
        buf.put_u32_le(entry.len() as u32);
    }
    for entry in entries {
        buf.put_slice(entry);
    }
    buf.freeze()
}

/// Split a payload written by [`pack_entries`] back into its entries
pub fn unpack_entries(payload: &Bytes, n_entries: u32) -> Result<Vec<Bytes>> {
    let n = n_entries as usize;
    let table_len = n * 4;
    if payload.len() < table_len {
        return Err(Error::format("entry table truncated"));
    }

    let mut table = &payload[..table_len];
    let mut entries = Vec::with_capacity(n);
    let mut pos = table_len;
    for _ in 0..n {
        let len = table.get_u32_le() as usize;
        let end = pos + len;
        if end > payload.len() {
            return Err(Error::format("entry data truncated"));
        }
        entries.push(payload.slice(pos..end));
        pos = end;
    }
    Ok(entries)
}

/// Write the file header
pub fn write_header<W: Write>(out: &mut W, magic: &[u8; 8]) -> Result<()> {
    out.write_all(magic)?;
    out.write_all(&FORMAT_VERSION.to_le_bytes())?;
    Ok(())
}

/// Read and check the file header
pub fn read_header(file: &mut File, magic: &[u8; 8]) -> Result<u32> {
    let mut buf = [0u8; FILE_HEADER_SIZE as usize];
    file.seek(SeekFrom::Start(0))?;
    file.read_exact(&mut buf)?;
    if &buf[..8] != magic {
        return Err(Error::format("invalid file magic"));
    }
    let version = (&buf[8..]).get_u32_le();
    if version != FORMAT_VERSION {
        return Err(Error::format(format!("unsupported format version: {version}")));
    }
    Ok(version)
}

/// Serialize `directory` as the footer followed by the trailer.
///
/// Returns the number of bytes written.
#[allow(clippy::cast_possible_truncation)]
pub fn write_footer<W: Write, T: Serialize>(
    out: &mut W,
    footer_offset: u64,
    directory: &T,
    magic: &[u8; 8],
) -> Result<u64> {
    let footer =
        bincode::serialize(directory).map_err(|e| Error::Serialization(e.to_string()))?;
    let mut crc = Crc32cState::new();
    crc.update(&footer);

    out.write_all(&footer)?;

    let mut trailer = BytesMut::with_capacity(TRAILER_SIZE as usize);
    trailer.put_u64_le(footer_offset);
    trailer.put_u32_le(footer.len() as u32);
    trailer.put_u32_le(crc.value());
    trailer.put_slice(magic);
    out.write_all(&trailer)?;

    Ok(footer.len() as u64 + TRAILER_SIZE)
}

/// Locate, verify and deserialize the footer of a file
pub fn read_footer<T: DeserializeOwned>(file: &mut File, magic: &[u8; 8]) -> Result<T> {
    let file_len = file.metadata()?.len();
    if file_len < FILE_HEADER_SIZE + TRAILER_SIZE {
        return Err(Error::format("file too small"));
    }

    let mut trailer = [0u8; TRAILER_SIZE as usize];
    file.seek(SeekFrom::Start(file_len - TRAILER_SIZE))?;
    file.read_exact(&mut trailer)?;
    if &trailer[16..] != magic {
        return Err(Error::format("missing trailer, file was not closed"));
    }

    let mut cursor = &trailer[..16];
    let footer_offset = cursor.get_u64_le();
    let footer_len = u64::from(cursor.get_u32_le());
    let footer_crc = cursor.get_u32_le();
    if footer_offset < FILE_HEADER_SIZE || footer_offset + footer_len + TRAILER_SIZE != file_len {
        return Err(Error::format("footer location out of bounds"));
    }

    #[allow(clippy::cast_possible_truncation)]
    let mut footer = vec![0u8; footer_len as usize];
    file.seek(SeekFrom::Start(footer_offset))?;
    file.read_exact(&mut footer)?;
    if crc32c::crc32c(&footer) != footer_crc {
        return Err(Error::format("footer checksum mismatch"));
    }

    bincode::deserialize(&footer).map_err(|e| Error::Serialization(e.to_string()))
}

/// Read and verify the record at `offset`
pub fn read_record(file: &mut File, offset: u64, len: u32) -> Result<Record> {
    let mut buf = vec![0u8; len as usize];
    file.seek(SeekFrom::Start(offset))?;
    file.read_exact(&mut buf)?;
    Record::from_bytes(Bytes::from(buf))
}
