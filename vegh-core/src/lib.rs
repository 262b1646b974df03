/*!
# Vegh Core Engine

Verifiable, partially-inspectable directory snapshots.

A snapshot is a single file holding a fixed header, a JSON metadata block, a
JSON manifest, one gzip-compressed payload stream and a trailing SHA-256 of
that payload. Metadata and manifest are readable without decompressing
anything, and the payload digest is computed while packing.

The crate provides:

- Ignore-aware, deterministic collection of a source tree
- Streaming pack / restore with atomic output and traversal protection
- Integrity verification of the compressed payload
- Lines-of-code analysis straight from the compressed form
- Single-shot or chunked HTTP upload with retries, timeout and cancellation

## Usage

```rust,no_run
use std::path::Path;
use vegh_core::{create_default_engine, PackOptions};

let engine = create_default_engine();
engine.pack(Path::new("./project"), Path::new("project.snap"), &PackOptions::default())?;

let report = engine.check(Path::new("project.snap"))?;
println!("{} files, sha256 {}", report.entry_count, report.digest);

engine.restore(Path::new("project.snap"), Path::new("./restored"))?;
# Ok::<(), vegh_core::SnapError>(())
```
*/

pub mod codec;
pub mod collector;
pub mod compression;
pub mod config;
pub mod error;
pub mod format;
pub mod ignore_rules;
pub mod integrity;
pub mod loc;
pub mod metadata;
pub mod observability;
pub mod snapshot;
pub mod transport;


pub use codec::{RestoreSummary, SnapshotHandle, WriteSummary};
pub use collector::{CollectOptions, CollectedFile, FileCollector};
pub use compression::{CompressionAdapter, CompressionKind, GzipCompressor, NoCompression};
pub use config::{IgnoreConfig, PackConfig, TransferConfig, VeghConfig};
pub use error::{NetworkError, Result, SnapError};
pub use format::{Entry, Manifest};
pub use ignore_rules::{IgnoreMatcher, RuleSet};
pub use loc::{LocReport, LocStats};
pub use metadata::SnapshotMetadata;
pub use observability::init_observability;
pub use snapshot::{
    create_default_engine, create_engine_from_config, CheckReport, PackOptions, PackReport, SnapshotEngine,
};
pub use transport::{ChunkSink, ChunkState, TransferOptions, TransferResult};
