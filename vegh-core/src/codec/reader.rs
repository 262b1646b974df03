//! Container reader: open, stream and restore.
//!
//! [`open`] reads only the header, metadata and manifest. Payload access goes
//! through [`SnapshotHandle::stream_entries`], which decodes the payload
//! lazily and checks every frame against its manifest entry.

use super::safe_join;
use crate::compression::payload_decoder;
use crate::format::{frame_header_len, read_error, read_frame_header, Entry, Header, Manifest};
use crate::metadata::SnapshotMetadata;
use crate::{Result, SnapError};
use rayon::prelude::*;
use std::fs::{self, File};
use std::io::{self, BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

const READ_BUF: usize = 256 * 1024;

/// Decoded content buffered before a parallel restore flush
const RESTORE_BATCH_BYTES: u64 = 64 * 1024 * 1024;

/// An opened snapshot: parsed header, metadata and manifest
#[derive(Debug, Clone)]
pub struct SnapshotHandle {
    path: PathBuf,
    header: Header,
    metadata: SnapshotMetadata,
    manifest: Manifest,
    file_len: u64,
}

/// Counts reported by [`SnapshotHandle::extract_all`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RestoreSummary {
    pub files: usize,
    pub bytes: u64,
}

/// Open the snapshot at `path` without decompressing the payload
///
/// # Errors
/// * `SnapError::Resource` - the file cannot be opened or read
/// * `SnapError::CorruptArchive` - bad magic or version, truncated file, or a
///   manifest that does not fit the payload
pub fn open(path: &Path) -> Result<SnapshotHandle> {
    let mut file = File::open(path).map_err(|e| SnapError::resource(path, e))?;
    let file_len = file
        .metadata()
        .map_err(|e| SnapError::resource(path, e))?
        .len();

    let header = Header::read_from(&mut file)?;
    header.validate(file_len)?;

    let metadata_block = read_block(&mut file, path, header.metadata_offset, header.metadata_len)?;
    let metadata = SnapshotMetadata::from_block(&metadata_block)?;
    let manifest_block = read_block(&mut file, path, header.manifest_offset, header.manifest_len)?;
    let manifest = Manifest::from_block(&manifest_block)?;

    manifest.validate(header.payload_raw_len)?;
    if metadata.entry_count != manifest.len() as u64 {
        return Err(SnapError::corrupt(format!(
            "metadata declares {} entries, manifest holds {}",
            metadata.entry_count,
            manifest.len()
        )));
    }

    debug!(path = %path.display(), entries = manifest.len(), "snapshot opened");

    Ok(SnapshotHandle {
        path: path.to_path_buf(),
        header,
        metadata,
        manifest,
        file_len,
    })
}

fn read_block(file: &mut File, path: &Path, offset: u64, len: u64) -> Result<Vec<u8>> {
    file.seek(SeekFrom::Start(offset))
        .map_err(|e| SnapError::resource(path, e))?;
    let mut block = vec![0u8; len as usize];
    file.read_exact(&mut block).map_err(|e| match e.kind() {
        io::ErrorKind::UnexpectedEof => SnapError::corrupt("truncated block"),
        _ => SnapError::resource(path, e),
    })?;
    Ok(block)
}

impl SnapshotHandle {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    pub fn metadata(&self) -> &SnapshotMetadata {
        &self.metadata
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    pub fn entries(&self) -> &[Entry] {
        &self.manifest.entries
    }

    /// Size of the container file
    pub fn file_len(&self) -> u64 {
        self.file_len
    }

    /// Start decoding the payload from the first entry
    pub fn stream_entries(&self) -> Result<EntryStream<'_>> {
        let mut file = File::open(&self.path).map_err(|e| SnapError::resource(&self.path, e))?;
        file.seek(SeekFrom::Start(self.header.payload_offset))
            .map_err(|e| SnapError::resource(&self.path, e))?;
        let compressed = BufReader::with_capacity(READ_BUF, file.take(self.header.payload_len));

        Ok(EntryStream {
            handle: self,
            decoder: payload_decoder(self.header.compression, compressed),
            next_index: 0,
            position: 0,
            remaining: 0,
        })
    }

    /// Materialize every entry below `destination`
    ///
    /// All manifest paths are checked before anything is written; one bad
    /// path rejects the whole restore. Existing files at entry paths are
    /// overwritten, other files in `destination` are left alone.
    pub fn extract_all(&self, destination: &Path) -> Result<RestoreSummary> {
        let targets = self
            .entries()
            .iter()
            .map(|entry| safe_join(destination, &entry.relative_path))
            .collect::<Result<Vec<PathBuf>>>()?;

        fs::create_dir_all(destination).map_err(|e| SnapError::resource(destination, e))?;

        let mut summary = RestoreSummary::default();
        let mut batch = RestoreBatch::default();
        let mut stream = self.stream_entries()?;
        let mut targets = targets.into_iter();

        while let Some((entry, mut content)) = stream.next_entry()? {
            let target = targets
                .next()
                .ok_or_else(|| SnapError::corrupt("payload holds more entries than the manifest"))?;

            if entry.size_bytes >= RESTORE_BATCH_BYTES {
                // Large entries stream straight to disk instead of being buffered
                batch.flush(destination)?;
                write_streamed(destination, &target, entry.mode, &mut content)?;
            } else {
                let mut data = Vec::with_capacity(entry.size_bytes as usize);
                content
                    .read_to_end(&mut data)
                    .map_err(|e| read_error("payload", e))?;
                batch.push(PendingFile {
                    target,
                    data,
                    mode: entry.mode,
                });
                if batch.bytes >= RESTORE_BATCH_BYTES {
                    batch.flush(destination)?;
                }
            }

            summary.files += 1;
            summary.bytes += entry.size_bytes;
        }
        batch.flush(destination)?;

        info!(
            snapshot = %self.path.display(),
            destination = %destination.display(),
            files = summary.files,
            bytes = summary.bytes,
            "snapshot restored"
        );
        Ok(summary)
    }
}

/// Lazy, manifest-ordered view over the decoded payload
pub struct EntryStream<'h> {
    handle: &'h SnapshotHandle,
    decoder: Box<dyn Read>,
    next_index: usize,
    /// Decoded bytes consumed so far
    position: u64,
    /// Unread content bytes of the current entry
    remaining: u64,
}

impl<'h> EntryStream<'h> {
    /// Advance to the next entry
    ///
    /// Unread content of the previous entry is skipped. Returns `None` once
    /// the manifest is exhausted and the payload is fully consumed.
    pub fn next_entry(&mut self) -> Result<Option<(&'h Entry, EntryReader<'_>)>> {
        if self.remaining > 0 {
            let skipped = io::copy(&mut EntryReader {
                decoder: &mut self.decoder,
                remaining: &mut self.remaining,
                position: &mut self.position,
            }, &mut io::sink())
            .map_err(|e| read_error("payload", e))?;
            debug!(skipped, "skipped unread entry content");
        }

        let handle = self.handle;
        let Some(entry) = handle.manifest.entries.get(self.next_index) else {
            self.expect_end()?;
            return Ok(None);
        };

        let (path, size) = read_frame_header(&mut self.decoder)?;
        self.position += frame_header_len(&path);
        if path != entry.relative_path || size != entry.size_bytes || self.position != entry.payload_offset {
            return Err(SnapError::corrupt(format!(
                "payload frame '{path}' ({size} bytes at {}) does not match manifest entry '{}' ({} bytes at {})",
                self.position, entry.relative_path, entry.size_bytes, entry.payload_offset
            )));
        }

        self.next_index += 1;
        self.remaining = size;
        Ok(Some((
            entry,
            EntryReader {
                decoder: &mut self.decoder,
                remaining: &mut self.remaining,
                position: &mut self.position,
            },
        )))
    }

    fn expect_end(&mut self) -> Result<()> {
        let mut probe = [0u8; 1];
        let read = self
            .decoder
            .read(&mut probe)
            .map_err(|e| read_error("payload", e))?;
        if read != 0 {
            return Err(SnapError::corrupt("payload has data past the last manifest entry"));
        }
        Ok(())
    }
}

/// Content of one entry, bounded to its declared size
pub struct EntryReader<'s> {
    decoder: &'s mut Box<dyn Read>,
    remaining: &'s mut u64,
    position: &'s mut u64,
}

impl EntryReader<'_> {
    /// Bytes left in this entry
    pub fn remaining(&self) -> u64 {
        *self.remaining
    }
}

impl Read for EntryReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if *self.remaining == 0 || buf.is_empty() {
            return Ok(0);
        }
        let max = buf.len().min(usize::try_from(*self.remaining).unwrap_or(usize::MAX));
        let read = self.decoder.read(&mut buf[..max])?;
        if read == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "payload ended inside an entry",
            ));
        }
        *self.remaining -= read as u64;
        *self.position += read as u64;
        Ok(read)
    }
}

struct PendingFile {
    target: PathBuf,
    data: Vec<u8>,
    mode: u32,
}

#[derive(Default)]
struct RestoreBatch {
    files: Vec<PendingFile>,
    bytes: u64,
}

impl RestoreBatch {
    fn push(&mut self, file: PendingFile) {
        self.bytes += file.data.len() as u64;
        self.files.push(file);
    }

    /// Write buffered files in parallel
    fn flush(&mut self, destination: &Path) -> Result<()> {
        if self.files.is_empty() {
            return Ok(());
        }
        let files = std::mem::take(&mut self.files);
        self.bytes = 0;
        files.par_iter().try_for_each(|file| write_buffered(destination, file))
    }
}

/// Create the parent directories of `target` below `destination`
///
/// Every directory between the two must be a real directory: a symbolic
/// link anywhere on the way would redirect the write outside `destination`.
fn prepare_target(destination: &Path, target: &Path) -> Result<()> {
    let relative = target.strip_prefix(destination).map_err(|_| {
        SnapError::traversal(format!("'{}' is outside the destination", target.display()))
    })?;
    let mut current = destination.to_path_buf();
    if let Some(parent) = relative.parent() {
        for component in parent.components() {
            current.push(component);
            ensure_real_dir(&current)?;
        }
    }

    // Never write through a link left at the destination
    if let Ok(existing) = fs::symlink_metadata(target) {
        if existing.file_type().is_symlink() {
            fs::remove_file(target).map_err(|e| SnapError::resource(target, e))?;
        }
    }
    Ok(())
}

fn ensure_real_dir(dir: &Path) -> Result<()> {
    match fs::symlink_metadata(dir) {
        Ok(meta) if meta.file_type().is_symlink() => Err(SnapError::traversal(format!(
            "restore path passes through symbolic link '{}'",
            dir.display()
        ))),
        Ok(meta) if meta.is_dir() => Ok(()),
        Ok(_) => Err(SnapError::resource(
            dir,
            io::Error::new(io::ErrorKind::AlreadyExists, "not a directory"),
        )),
        Err(e) if e.kind() == io::ErrorKind::NotFound => match fs::create_dir(dir) {
            Ok(()) => Ok(()),
            // Another restore worker created it first
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => ensure_real_dir(dir),
            Err(e) => Err(SnapError::resource(dir, e)),
        },
        Err(e) => Err(SnapError::resource(dir, e)),
    }
}

fn write_buffered(destination: &Path, file: &PendingFile) -> Result<()> {
    prepare_target(destination, &file.target)?;
    fs::write(&file.target, &file.data).map_err(|e| SnapError::resource(&file.target, e))?;
    apply_mode(&file.target, file.mode)
}

fn write_streamed(destination: &Path, target: &Path, mode: u32, content: &mut EntryReader<'_>) -> Result<()> {
    prepare_target(destination, target)?;
    let mut out = File::create(target).map_err(|e| SnapError::resource(target, e))?;
    io::copy(content, &mut out).map_err(|e| match e.kind() {
        io::ErrorKind::UnexpectedEof | io::ErrorKind::InvalidData | io::ErrorKind::InvalidInput => {
            read_error("payload", e)
        }
        _ => SnapError::resource(target, e),
    })?;
    apply_mode(target, mode)
}

#[cfg(unix)]
fn apply_mode(target: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(target, fs::Permissions::from_mode(mode & 0o7777))
        .map_err(|e| SnapError::resource(target, e))
}

#[cfg(not(unix))]
fn apply_mode(_target: &Path, _mode: u32) -> Result<()> {
    Ok(())
}
