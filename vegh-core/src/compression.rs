/*!
Compression adapters for the snapshot payload.

The payload is compressed as one continuous stream. The adapter chosen at
pack time is recorded in the container header, so readers pick the matching
decoder without being configured.
*/

use crate::{Result, SnapError};
use flate2::{read::GzDecoder, write::GzEncoder, Compression};
use std::io::{self, Read, Write};

/// Payload compression algorithm as stored in the header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionKind {
    None,
    Gzip,
}

impl CompressionKind {
    pub fn id(self) -> u8 {
        match self {
            CompressionKind::None => 0,
            CompressionKind::Gzip => 1,
        }
    }

    pub fn from_id(id: u8) -> Result<Self> {
        match id {
            0 => Ok(CompressionKind::None),
            1 => Ok(CompressionKind::Gzip),
            other => Err(SnapError::corrupt(format!("unknown compression id {other}"))),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            CompressionKind::None => "none",
            CompressionKind::Gzip => "gzip",
        }
    }
}

/// Compression abstraction for the payload stream
///
/// Implementations wrap a writer; everything written through the returned
/// encoder ends up compressed in `inner`.
pub trait CompressionAdapter {
    /// Algorithm recorded in the header
    fn kind(&self) -> CompressionKind;

    /// Level recorded in the metadata block
    fn level(&self) -> u32;

    /// Wrap `inner` in a streaming encoder
    fn encoder<W: Write>(&self, inner: W) -> PayloadEncoder<W>;

    /// Get the name of the compression algorithm
    fn algorithm_name(&self) -> &str {
        self.kind().name()
    }
}

/// Gzip compression adapter
///
/// # Example
/// ```rust
/// use vegh_core::{CompressionAdapter, GzipCompressor};
///
/// let compressor = GzipCompressor::with_level(9);
/// assert_eq!(compressor.algorithm_name(), "gzip");
/// assert_eq!(compressor.level(), 9);
/// ```
#[derive(Debug, Clone)]
pub struct GzipCompressor {
    compression_level: Compression,
}

impl GzipCompressor {
    /// Create a new gzip compressor with default compression level (6)
    pub fn new() -> Self {
        Self {
            compression_level: Compression::default(),
        }
    }

    /// Create a new gzip compressor with the specified compression level (0-9)
    pub fn with_level(level: u32) -> Self {
        Self {
            compression_level: Compression::new(level.min(9)),
        }
    }

    /// Create a compressor for fast compression (level 1)
    pub fn fast() -> Self {
        Self::with_level(1)
    }

    /// Create a compressor for maximum compression (level 9)
    pub fn max() -> Self {
        Self::with_level(9)
    }
}

impl Default for GzipCompressor {
    fn default() -> Self {
        Self::new()
    }
}

impl CompressionAdapter for GzipCompressor {
    fn kind(&self) -> CompressionKind {
        CompressionKind::Gzip
    }

    fn level(&self) -> u32 {
        self.compression_level.level()
    }

    fn encoder<W: Write>(&self, inner: W) -> PayloadEncoder<W> {
        PayloadEncoder::Gzip(GzEncoder::new(inner, self.compression_level))
    }
}

/// No-compression adapter, mostly useful in tests
#[derive(Debug, Clone)]
pub struct NoCompression;

impl NoCompression {
    pub fn new() -> Self {
        Self
    }
}

impl Default for NoCompression {
    fn default() -> Self {
        Self::new()
    }
}

impl CompressionAdapter for NoCompression {
    fn kind(&self) -> CompressionKind {
        CompressionKind::None
    }

    fn level(&self) -> u32 {
        0
    }

    fn encoder<W: Write>(&self, inner: W) -> PayloadEncoder<W> {
        PayloadEncoder::Plain(inner)
    }
}

/// Streaming encoder returned by [`CompressionAdapter::encoder`]
pub enum PayloadEncoder<W: Write> {
    Plain(W),
    Gzip(GzEncoder<W>),
}

impl<W: Write> PayloadEncoder<W> {
    /// Flush trailing compressed data and return the inner writer
    pub fn finish(self) -> io::Result<W> {
        match self {
            PayloadEncoder::Plain(mut inner) => {
                inner.flush()?;
                Ok(inner)
            }
            PayloadEncoder::Gzip(encoder) => encoder.finish(),
        }
    }
}

impl<W: Write> Write for PayloadEncoder<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            PayloadEncoder::Plain(inner) => inner.write(buf),
            PayloadEncoder::Gzip(encoder) => encoder.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            PayloadEncoder::Plain(inner) => inner.flush(),
            PayloadEncoder::Gzip(encoder) => encoder.flush(),
        }
    }
}

/// Streaming decoder for a payload compressed with `kind`
pub fn payload_decoder<'a, R: Read + 'a>(kind: CompressionKind, reader: R) -> Box<dyn Read + 'a> {
    match kind {
        CompressionKind::None => Box::new(reader),
        CompressionKind::Gzip => Box::new(GzDecoder::new(reader)),
    }
}
