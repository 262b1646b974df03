//! Streaming container writer.
//!
//! Entries are framed and compressed into an anonymous spool file while the
//! compressed bytes are hashed. [`WriteSession::finish`] then lays out the
//! header, metadata and manifest in front of the spooled payload inside a
//! temporary file next to the output, and renames it into place. A failed or
//! abandoned session leaves nothing at the output path.

use super::check_relative_path;
use crate::collector::CollectedFile;
use crate::compression::{CompressionAdapter, CompressionKind, PayloadEncoder};
use crate::format::{frame_header_len, write_frame_header, Entry, Header, Manifest, MAX_PATH_LEN};
use crate::integrity::{digest_hex, HashingWriter};
use crate::metadata::SnapshotMetadata;
use crate::{Result, SnapError};
use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{self, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, info};

const SPOOL_BUF: usize = 256 * 1024;

/// Header of one entry handed to [`WriteSession::write_entry`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryHeader {
    pub relative_path: String,
    /// Exact number of bytes the content reader must yield
    pub size: u64,
    pub mode: u32,
}

impl From<&CollectedFile> for EntryHeader {
    fn from(file: &CollectedFile) -> Self {
        Self {
            relative_path: file.relative_path.clone(),
            size: file.size,
            mode: file.mode,
        }
    }
}

/// Result of a finished session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteSummary {
    pub path: PathBuf,
    /// Lowercase hex SHA-256 of the compressed payload
    pub digest: String,
    pub entry_count: usize,
    /// Sum of entry sizes
    pub total_bytes: u64,
    pub payload_len: u64,
    pub file_len: u64,
}

/// An in-progress snapshot
pub struct WriteSession {
    output: PathBuf,
    metadata: SnapshotMetadata,
    kind: CompressionKind,
    encoder: PayloadEncoder<HashingWriter<BufWriter<File>>>,
    manifest: Manifest,
    seen: HashSet<String>,
    raw_len: u64,
    poisoned: bool,
}

/// Start a snapshot that will be written to `output`
///
/// The metadata's compression fields are overwritten from `compressor`; its
/// entry count is filled in by [`WriteSession::finish`].
pub fn begin<C: CompressionAdapter>(
    mut metadata: SnapshotMetadata,
    compressor: &C,
    output: &Path,
) -> Result<WriteSession> {
    metadata.validate()?;
    metadata.compression = compressor.algorithm_name().to_string();
    metadata.compression_level = compressor.level();

    let spool = tempfile::tempfile().map_err(|e| SnapError::resource(std::env::temp_dir(), e))?;
    let encoder = compressor.encoder(HashingWriter::new(BufWriter::with_capacity(SPOOL_BUF, spool)));

    debug!(output = %output.display(), compression = compressor.algorithm_name(), "write session started");

    Ok(WriteSession {
        output: output.to_path_buf(),
        metadata,
        kind: compressor.kind(),
        encoder,
        manifest: Manifest::default(),
        seen: HashSet::new(),
        raw_len: 0,
        poisoned: false,
    })
}

impl WriteSession {
    /// Append one entry; `content` must yield exactly `header.size` bytes
    ///
    /// Content that is shorter or longer than declared means the file changed
    /// after it was collected and fails with a resource error.
    ///
    /// A failed call poisons the session: the payload stream is mid-frame,
    /// so [`finish`](Self::finish) will refuse to produce a snapshot.
    pub fn write_entry<R: Read>(&mut self, header: EntryHeader, content: R) -> Result<()> {
        if self.poisoned {
            return Err(SnapError::configuration("write session failed earlier and cannot continue"));
        }
        let result = self.append(header, content);
        if result.is_err() {
            self.poisoned = true;
        }
        result
    }

    fn append<R: Read>(&mut self, header: EntryHeader, mut content: R) -> Result<()> {
        check_relative_path(&header.relative_path)?;
        if header.relative_path.len() > MAX_PATH_LEN as usize {
            return Err(SnapError::configuration(format!(
                "entry path is {} bytes, the limit is {MAX_PATH_LEN}",
                header.relative_path.len()
            )));
        }
        if !self.seen.insert(header.relative_path.clone()) {
            return Err(SnapError::configuration(format!(
                "duplicate entry path '{}'",
                header.relative_path
            )));
        }

        write_frame_header(&mut self.encoder, &header.relative_path, header.size)
            .map_err(spool_error)?;
        let payload_offset = self.raw_len + frame_header_len(&header.relative_path);

        let copied = io::copy(&mut (&mut content).take(header.size), &mut self.encoder)
            .map_err(|e| SnapError::resource(&header.relative_path, e))?;
        if copied != header.size {
            return Err(size_changed(&header, format!("read {copied}")));
        }
        let mut extra = [0u8; 1];
        let grown = content
            .read(&mut extra)
            .map_err(|e| SnapError::resource(&header.relative_path, e))?;
        if grown > 0 {
            return Err(size_changed(&header, "found more".to_string()));
        }

        self.raw_len = payload_offset + header.size;
        self.manifest.entries.push(Entry {
            relative_path: header.relative_path,
            size_bytes: header.size,
            mode: header.mode,
            payload_offset,
        });
        Ok(())
    }

    /// Entries written so far
    pub fn entry_count(&self) -> usize {
        self.manifest.len()
    }

    /// Complete the payload, assemble the container and move it into place
    pub fn finish(self) -> Result<WriteSummary> {
        if self.poisoned {
            return Err(SnapError::configuration("write session failed earlier and cannot be finished"));
        }

        let hashing = self.encoder.finish().map_err(spool_error)?;
        let (spool, hasher) = hashing.into_parts();
        let payload_len = hasher.bytes();
        let digest = hasher.finalize_raw();
        let mut spool = spool
            .into_inner()
            .map_err(|e| spool_error(e.into_error()))?;

        let mut metadata = self.metadata;
        metadata.entry_count = self.manifest.len() as u64;
        let metadata_block = metadata.to_block()?;
        let manifest_block = self.manifest.to_block()?;

        let header = Header::layout(
            self.kind,
            metadata_block.len() as u64,
            manifest_block.len() as u64,
            payload_len,
            self.raw_len,
        );

        let output = &self.output;
        let parent = match output.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        if !parent.exists() {
            fs::create_dir_all(&parent).map_err(|e| SnapError::resource(&parent, e))?;
        }

        let mut staged = NamedTempFile::new_in(&parent).map_err(|e| SnapError::resource(&parent, e))?;
        let blocks = [metadata_block.as_slice(), manifest_block.as_slice()];
        assemble(staged.as_file_mut(), &header, &blocks, &mut spool, &digest)
            .map_err(|e| SnapError::resource(output, e))?;
        staged
            .as_file()
            .sync_all()
            .map_err(|e| SnapError::resource(output, e))?;
        staged
            .persist(output)
            .map_err(|e| SnapError::resource(output, e.error))?;

        let summary = WriteSummary {
            path: output.clone(),
            digest: digest_hex(&digest),
            entry_count: self.manifest.len(),
            total_bytes: self.manifest.total_size(),
            payload_len,
            file_len: header.expected_file_len(),
        };

        info!(
            path = %summary.path.display(),
            entries = summary.entry_count,
            raw_bytes = self.raw_len,
            compressed_bytes = payload_len,
            digest = %summary.digest,
            "snapshot written"
        );
        Ok(summary)
    }
}

fn size_changed(header: &EntryHeader, found: String) -> SnapError {
    SnapError::resource(
        &header.relative_path,
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("expected {} bytes, {found}; file changed while packing", header.size),
        ),
    )
}

fn spool_error(e: io::Error) -> SnapError {
    SnapError::resource(std::env::temp_dir(), e)
}

/// Write header, leading blocks, spooled payload and digest to `out`
fn assemble(
    out: &mut File,
    header: &Header,
    blocks: &[&[u8]],
    spool: &mut File,
    digest: &[u8; 32],
) -> io::Result<()> {
    let mut out = BufWriter::with_capacity(SPOOL_BUF, out);
    header.write_to(&mut out)?;
    for block in blocks {
        out.write_all(block)?;
    }

    spool.seek(SeekFrom::Start(0))?;
    let copied = io::copy(&mut spool.take(header.payload_len), &mut out)?;
    if copied != header.payload_len {
        return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "payload spool shrank"));
    }
    out.write_all(digest)?;
    out.flush()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compression::{GzipCompressor, NoCompression};

    fn header(path: &str, size: u64) -> EntryHeader {
        EntryHeader {
            relative_path: path.to_string(),
            size,
            mode: 0o644,
        }
    }

    #[test]
    fn test_finish_writes_consistent_layout() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let output = temp_dir.path().join("out.snap");

        let mut session = begin(SnapshotMetadata::new("tester"), &GzipCompressor::new(), &output).unwrap();
        session.write_entry(header("a.txt", 5), &b"hello"[..]).unwrap();
        session.write_entry(header("dir/b.txt", 0), io::empty()).unwrap();
        assert_eq!(session.entry_count(), 2);
        let summary = session.finish().unwrap();

        assert_eq!(summary.entry_count, 2);
        assert_eq!(summary.total_bytes, 5);
        assert_eq!(summary.digest.len(), 64);
        assert_eq!(fs::metadata(&output).unwrap().len(), summary.file_len);
    }

    #[test]
    fn test_short_content_poisons_session() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let output = temp_dir.path().join("out.snap");

        let mut session = begin(SnapshotMetadata::new("tester"), &NoCompression::new(), &output).unwrap();
        let err = session.write_entry(header("a.txt", 10), &b"short"[..]).unwrap_err();
        assert!(matches!(err, SnapError::Resource { .. }));

        assert!(session.write_entry(header("b.txt", 1), &b"x"[..]).is_err());
        assert!(session.finish().is_err());
        assert!(!output.exists());
    }

    #[test]
    fn test_grown_content_poisons_session() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let output = temp_dir.path().join("out.snap");

        let mut session = begin(SnapshotMetadata::new("tester"), &NoCompression::new(), &output).unwrap();
        let err = session.write_entry(header("a.txt", 3), &b"abcdef"[..]).unwrap_err();
        match err {
            SnapError::Resource { source, .. } => assert!(source.to_string().contains("file changed")),
            other => panic!("expected resource error, got {other:?}"),
        }
        assert!(session.finish().is_err());
        assert!(!output.exists());
    }

    #[test]
    fn test_overlong_path_rejected_on_write() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let output = temp_dir.path().join("out.snap");

        let mut session = begin(SnapshotMetadata::new("tester"), &NoCompression::new(), &output).unwrap();
        let long_path = "a".repeat(MAX_PATH_LEN as usize + 1);
        assert!(matches!(
            session.write_entry(header(&long_path, 1), &b"x"[..]),
            Err(SnapError::Configuration(_))
        ));

        let mut session = begin(SnapshotMetadata::new("tester"), &NoCompression::new(), &output).unwrap();
        let at_limit = "b".repeat(MAX_PATH_LEN as usize);
        session.write_entry(header(&at_limit, 1), &b"x"[..]).unwrap();
        session.finish().unwrap();
    }

    #[test]
    fn test_duplicate_and_unsafe_paths_rejected() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let output = temp_dir.path().join("out.snap");

        let mut session = begin(SnapshotMetadata::new("tester"), &GzipCompressor::new(), &output).unwrap();
        session.write_entry(header("a.txt", 1), &b"a"[..]).unwrap();
        assert!(matches!(
            session.write_entry(header("a.txt", 1), &b"a"[..]),
            Err(SnapError::Configuration(_))
        ));

        let mut session = begin(SnapshotMetadata::new("tester"), &GzipCompressor::new(), &output).unwrap();
        assert!(matches!(
            session.write_entry(header("../evil", 1), &b"a"[..]),
            Err(SnapError::Traversal(_))
        ));
    }

    #[test]
    fn test_dropped_session_leaves_no_output() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let output = temp_dir.path().join("out.snap");
        {
            let mut session = begin(SnapshotMetadata::new("tester"), &GzipCompressor::new(), &output).unwrap();
            session.write_entry(header("a.txt", 1), &b"a"[..]).unwrap();
        }
        assert!(!output.exists());
        assert_eq!(fs::read_dir(temp_dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_output_parent_is_created() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let output = temp_dir.path().join("nested/dir/out.snap");
        let session = begin(SnapshotMetadata::new("tester"), &GzipCompressor::new(), &output).unwrap();
        session.finish().unwrap();
        assert!(output.exists());
    }
}
