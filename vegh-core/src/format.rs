//! On-disk container layout.
//!
//! ```text
//! [header: 68 bytes][metadata JSON][manifest JSON][compressed payload][sha256: 32 bytes]
//! ```
//!
//! The header carries absolute offsets and lengths of every block, so the
//! metadata and manifest are read with two seeks and no decompression. All
//! integers are little-endian.
//!
//! The decompressed payload is a sequence of entry frames:
//! `u32 path_len, path, u64 size, content`.

use crate::compression::CompressionKind;
use crate::{Result, SnapError};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::io::{self, Read, Write};

pub const MAGIC: [u8; 8] = *b"VEGHSNAP";
pub const FORMAT_VERSION: u16 = 1;
pub const HEADER_LEN: u64 = 68;
pub const DIGEST_LEN: u64 = 32;

/// Upper bound for metadata and manifest blocks, guards against absurd allocations
pub const MAX_BLOCK_LEN: u64 = 256 * 1024 * 1024;

/// Longest entry path in bytes, enforced when writing and reading frames
pub const MAX_PATH_LEN: u32 = 64 * 1024;

/// Fixed-size container header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub format_version: u16,
    pub compression: CompressionKind,
    pub metadata_offset: u64,
    pub metadata_len: u64,
    pub manifest_offset: u64,
    pub manifest_len: u64,
    pub payload_offset: u64,
    /// Compressed length
    pub payload_len: u64,
    /// Decompressed length
    pub payload_raw_len: u64,
}

impl Header {
    /// Lay out blocks back to back after the header
    pub fn layout(
        compression: CompressionKind,
        metadata_len: u64,
        manifest_len: u64,
        payload_len: u64,
        payload_raw_len: u64,
    ) -> Self {
        let metadata_offset = HEADER_LEN;
        let manifest_offset = metadata_offset + metadata_len;
        let payload_offset = manifest_offset + manifest_len;
        Self {
            format_version: FORMAT_VERSION,
            compression,
            metadata_offset,
            metadata_len,
            manifest_offset,
            manifest_len,
            payload_offset,
            payload_len,
            payload_raw_len,
        }
    }

    pub fn digest_offset(&self) -> u64 {
        self.payload_offset + self.payload_len
    }

    pub fn expected_file_len(&self) -> u64 {
        self.digest_offset() + DIGEST_LEN
    }

    pub fn write_to<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        writer.write_all(&MAGIC)?;
        writer.write_u16::<LittleEndian>(self.format_version)?;
        writer.write_u8(self.compression.id())?;
        writer.write_u8(0)?;
        for value in [
            self.metadata_offset,
            self.metadata_len,
            self.manifest_offset,
            self.manifest_len,
            self.payload_offset,
            self.payload_len,
            self.payload_raw_len,
        ] {
            writer.write_u64::<LittleEndian>(value)?;
        }
        Ok(())
    }

    /// Parse and check magic and version
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let mut magic = [0u8; 8];
        reader.read_exact(&mut magic).map_err(truncated("header"))?;
        if magic != MAGIC {
            return Err(SnapError::corrupt("bad magic, not a vegh snapshot"));
        }

        let format_version = reader.read_u16::<LittleEndian>().map_err(truncated("header"))?;
        if format_version == 0 || format_version > FORMAT_VERSION {
            return Err(SnapError::corrupt(format!(
                "unsupported format version {format_version} (current: {FORMAT_VERSION})"
            )));
        }
        let compression = CompressionKind::from_id(reader.read_u8().map_err(truncated("header"))?)?;
        let _reserved = reader.read_u8().map_err(truncated("header"))?;

        let mut fields = [0u64; 7];
        for field in fields.iter_mut() {
            *field = reader.read_u64::<LittleEndian>().map_err(truncated("header"))?;
        }

        Ok(Self {
            format_version,
            compression,
            metadata_offset: fields[0],
            metadata_len: fields[1],
            manifest_offset: fields[2],
            manifest_len: fields[3],
            payload_offset: fields[4],
            payload_len: fields[5],
            payload_raw_len: fields[6],
        })
    }

    /// Check that every block lies inside a file of `file_len` bytes
    pub fn validate(&self, file_len: u64) -> Result<()> {
        let blocks = [
            ("metadata", self.metadata_offset, self.metadata_len),
            ("manifest", self.manifest_offset, self.manifest_len),
            ("payload", self.payload_offset, self.payload_len),
        ];
        // Blocks must follow the header in order without overlapping
        let mut previous_end = HEADER_LEN;
        for (name, offset, len) in blocks {
            let end = offset
                .checked_add(len)
                .ok_or_else(|| SnapError::corrupt(format!("{name} block offset overflows")))?;
            if offset < HEADER_LEN || end > file_len {
                return Err(SnapError::corrupt(format!(
                    "{name} block [{offset}, {end}) outside file of {file_len} bytes"
                )));
            }
            if offset < previous_end {
                return Err(SnapError::corrupt(format!(
                    "{name} block at {offset} overlaps the preceding block ending at {previous_end}"
                )));
            }
            previous_end = end;
        }
        if self.metadata_len > MAX_BLOCK_LEN || self.manifest_len > MAX_BLOCK_LEN {
            return Err(SnapError::corrupt("metadata or manifest block too large"));
        }

        let expected = self
            .payload_offset
            .checked_add(self.payload_len)
            .and_then(|end| end.checked_add(DIGEST_LEN))
            .ok_or_else(|| SnapError::corrupt("payload length overflows"))?;
        if file_len != expected {
            return Err(SnapError::corrupt(format!(
                "file is {file_len} bytes, header describes {expected} (truncated or padded)"
            )));
        }
        Ok(())
    }
}

fn truncated(what: &'static str) -> impl Fn(io::Error) -> SnapError {
    move |e| read_error(what, e)
}

/// Map a read failure inside `what` to a corrupt-archive error where the
/// bytes themselves are at fault
pub(crate) fn read_error(what: &str, e: io::Error) -> SnapError {
    match e.kind() {
        io::ErrorKind::UnexpectedEof => SnapError::corrupt(format!("truncated {what}")),
        io::ErrorKind::InvalidData | io::ErrorKind::InvalidInput => {
            SnapError::corrupt(format!("undecodable {what}: {e}"))
        }
        _ => SnapError::Io(e),
    }
}

/// One file described by the manifest
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    /// '/'-separated path relative to the snapshot root
    pub relative_path: String,

    pub size_bytes: u64,

    /// Permission bits
    pub mode: u32,

    /// Offset of the content inside the decompressed payload
    pub payload_offset: u64,
}

impl Entry {
    pub fn content_end(&self) -> Option<u64> {
        self.payload_offset.checked_add(self.size_bytes)
    }
}

/// Ordered entry list, in payload order
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct Manifest {
    pub entries: Vec<Entry>,
}

impl Manifest {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Sum of entry sizes
    pub fn total_size(&self) -> u64 {
        self.entries.iter().map(|e| e.size_bytes).sum()
    }

    pub fn to_block(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_block(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes)
            .map_err(|e| SnapError::corrupt(format!("unreadable manifest block: {e}")))
    }

    /// Check manifest/payload consistency
    ///
    /// Paths must be unique, and every entry must sit exactly where the
    /// framing puts it, inside `payload_raw_len`.
    pub fn validate(&self, payload_raw_len: u64) -> Result<()> {
        let mut seen = HashSet::with_capacity(self.entries.len());
        let mut cursor = 0u64;

        for entry in &self.entries {
            if !seen.insert(entry.relative_path.as_str()) {
                return Err(SnapError::corrupt(format!(
                    "duplicate manifest entry '{}'",
                    entry.relative_path
                )));
            }

            let expected_offset = cursor + frame_header_len(&entry.relative_path);
            let end = entry.content_end().ok_or_else(|| {
                SnapError::corrupt(format!("entry '{}' size overflows", entry.relative_path))
            })?;
            if entry.payload_offset != expected_offset || end > payload_raw_len {
                return Err(SnapError::corrupt(format!(
                    "entry '{}' at [{}, {end}) does not fit payload of {payload_raw_len} bytes",
                    entry.relative_path, entry.payload_offset
                )));
            }
            cursor = end;
        }

        if cursor != payload_raw_len {
            return Err(SnapError::corrupt(format!(
                "manifest covers {cursor} payload bytes, header declares {payload_raw_len}"
            )));
        }
        Ok(())
    }
}

/// Size of the frame header that precedes an entry's content
pub fn frame_header_len(relative_path: &str) -> u64 {
    4 + relative_path.len() as u64 + 8
}

pub fn write_frame_header<W: Write>(writer: &mut W, relative_path: &str, size: u64) -> io::Result<()> {
    writer.write_u32::<LittleEndian>(relative_path.len() as u32)?;
    writer.write_all(relative_path.as_bytes())?;
    writer.write_u64::<LittleEndian>(size)
}

/// Read the next frame header: `(path, size)`
pub fn read_frame_header<R: Read>(reader: &mut R) -> Result<(String, u64)> {
    let path_len = reader.read_u32::<LittleEndian>().map_err(truncated("payload"))?;
    if path_len > MAX_PATH_LEN {
        return Err(SnapError::corrupt(format!("frame path length {path_len} too large")));
    }
    let mut path = vec![0u8; path_len as usize];
    reader.read_exact(&mut path).map_err(truncated("payload"))?;
    let path = String::from_utf8(path)
        .map_err(|_| SnapError::corrupt("frame path is not valid UTF-8"))?;
    let size = reader.read_u64::<LittleEndian>().map_err(truncated("payload"))?;
    Ok((path, size))
}
