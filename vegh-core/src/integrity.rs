/*!
SHA-256 integrity layer.

The payload digest is accumulated while the compressed bytes are written, so
packing never re-reads the payload. Verification reads the stored payload
back through the same hasher and compares it with the trailing digest.
*/

use crate::format::{Header, DIGEST_LEN};
use crate::{Result, SnapError};
use sha2::digest::Output;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{self, BufReader, Read, Seek, SeekFrom, Write};
use std::path::Path;
use tracing::{debug, warn};

const READ_BUF: usize = 64 * 1024;

/// Streaming SHA-256 accumulator
#[derive(Debug, Clone, Default)]
pub struct PayloadHasher {
    inner: Sha256,
    bytes: u64,
}

impl PayloadHasher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, data: &[u8]) {
        self.inner.update(data);
        self.bytes += data.len() as u64;
    }

    /// Bytes fed so far
    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    /// Raw 32-byte digest
    pub fn finalize_raw(self) -> [u8; 32] {
        self.inner.finalize().into()
    }

    /// Lowercase hex digest
    pub fn finalize(self) -> String {
        format!("{:x}", self.inner.finalize())
    }
}

/// Create a new streaming hasher
pub fn hasher() -> PayloadHasher {
    PayloadHasher::new()
}

/// Writer adapter that hashes every byte passing through it
pub struct HashingWriter<W: Write> {
    inner: W,
    hasher: PayloadHasher,
}

impl<W: Write> HashingWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: PayloadHasher::new(),
        }
    }

    pub fn bytes_written(&self) -> u64 {
        self.hasher.bytes()
    }

    pub fn into_parts(self) -> (W, PayloadHasher) {
        (self.inner, self.hasher)
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let written = self.inner.write(buf)?;
        self.hasher.update(&buf[..written]);
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Reader adapter that hashes every byte read through it
pub struct HashingReader<R: Read> {
    inner: R,
    hasher: PayloadHasher,
}

impl<R: Read> HashingReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            hasher: PayloadHasher::new(),
        }
    }

    pub fn into_parts(self) -> (R, PayloadHasher) {
        (self.inner, self.hasher)
    }
}

impl<R: Read> Read for HashingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let read = self.inner.read(buf)?;
        self.hasher.update(&buf[..read]);
        Ok(read)
    }
}

/// Compute the SHA-256 hash of a byte slice
///
/// # Example
/// ```rust
/// use vegh_core::integrity::compute_hash;
///
/// let hash = compute_hash(b"hello world");
/// assert_eq!(hash.len(), 64);
/// ```
pub fn compute_hash(data: &[u8]) -> String {
    let mut hasher = PayloadHasher::new();
    hasher.update(data);
    hasher.finalize()
}

/// SHA-256 of an entire file
pub fn sha256_file(path: &Path) -> Result<String> {
    let file = File::open(path).map_err(|e| SnapError::resource(path, e))?;
    let mut reader = HashingReader::new(BufReader::with_capacity(READ_BUF, file));
    io::copy(&mut reader, &mut io::sink()).map_err(|e| SnapError::resource(path, e))?;
    Ok(reader.into_parts().1.finalize())
}

/// Recompute the payload digest of the snapshot at `path`
///
/// Returns the lowercase hex digest on success. The file is opened read-only.
///
/// # Errors
/// * `SnapError::Resource` - the file cannot be opened or read
/// * `SnapError::CorruptArchive` - bad header or truncated file
/// * `SnapError::IntegrityCheckFailed` - the payload does not match the stored digest
pub fn verify(path: &Path) -> Result<String> {
    let mut file = File::open(path).map_err(|e| SnapError::resource(path, e))?;
    let file_len = file
        .metadata()
        .map_err(|e| SnapError::resource(path, e))?
        .len();

    let header = Header::read_from(&mut file)?;
    header.validate(file_len)?;

    file.seek(SeekFrom::Start(header.payload_offset))
        .map_err(|e| SnapError::resource(path, e))?;
    let mut payload = HashingReader::new(BufReader::with_capacity(
        READ_BUF,
        (&mut file).take(header.payload_len),
    ));
    let copied = io::copy(&mut payload, &mut io::sink()).map_err(|e| SnapError::resource(path, e))?;
    if copied != header.payload_len {
        return Err(SnapError::corrupt("truncated payload"));
    }
    let actual = payload.into_parts().1.finalize();

    let mut stored = [0u8; DIGEST_LEN as usize];
    file.read_exact(&mut stored).map_err(|e| match e.kind() {
        io::ErrorKind::UnexpectedEof => SnapError::corrupt("truncated digest"),
        _ => SnapError::resource(path, e),
    })?;
    let expected = digest_hex(&stored);

    if actual != expected {
        warn!(path = %path.display(), %expected, %actual, "payload digest mismatch");
        return Err(SnapError::IntegrityCheckFailed { expected, actual });
    }

    debug!(path = %path.display(), digest = %actual, "payload digest verified");
    Ok(actual)
}

/// Lowercase hex form of a raw digest
pub(crate) fn digest_hex(digest: &[u8; 32]) -> String {
    format!("{:x}", Output::<Sha256>::from_slice(digest))
}
