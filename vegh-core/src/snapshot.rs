/*!
Snapshot engine orchestrating pack, inspect, restore, analyze and send.

The engine ties the collector, ignore rules, codec, integrity layer and
transport together under one [`VeghConfig`]. Each operation opens the files
it needs and holds no state between calls.
*/

use crate::codec::{self, EntryHeader, RestoreSummary, SnapshotHandle, WriteSummary};
use crate::collector::{CollectOptions, FileCollector};
use crate::compression::{CompressionAdapter, GzipCompressor};
use crate::config::VeghConfig;
use crate::format::Entry;
use crate::ignore_rules::{ignore_file_names, load_rule_sets, IgnoreMatcher, RuleSet};
use crate::integrity;
use crate::loc::{self, LocReport};
use crate::observability;
use crate::transport::{self, TransferOptions, TransferResult};
use crate::{Result, SnapError, SnapshotMetadata};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Per-call options for [`SnapshotEngine::pack`]
#[derive(Debug, Clone, Default)]
pub struct PackOptions {
    pub comment: Option<String>,
    /// Overrides the configured author
    pub author: Option<String>,
    /// Patterns forced in, above every ignore file
    pub include: Vec<String>,
    /// Patterns forced out, above every ignore file
    pub exclude: Vec<String>,
}

/// Result of [`SnapshotEngine::pack`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackReport {
    pub summary: WriteSummary,
    pub source: PathBuf,
}

impl PackReport {
    /// Number of files packed
    pub fn file_count(&self) -> usize {
        self.summary.entry_count
    }
}

/// Result of [`SnapshotEngine::check`]
#[derive(Debug, Clone)]
pub struct CheckReport {
    /// Verified payload digest
    pub digest: String,
    pub metadata: SnapshotMetadata,
    pub entry_count: usize,
    pub total_bytes: u64,
    pub file_len: u64,
}

/// Main engine for snapshot operations
///
/// # Example
/// ```rust,no_run
/// use std::path::Path;
/// use vegh_core::{create_default_engine, PackOptions};
///
/// let engine = create_default_engine();
/// let report = engine.pack(Path::new("./project"), Path::new("project.snap"), &PackOptions::default())?;
/// println!("packed {} files", report.file_count());
///
/// let check = engine.check(Path::new("project.snap"))?;
/// println!("sha256 {}", check.digest);
/// # Ok::<(), vegh_core::SnapError>(())
/// ```
pub struct SnapshotEngine<C>
where
    C: CompressionAdapter,
{
    config: VeghConfig,
    compressor: C,
}

impl<C> SnapshotEngine<C>
where
    C: CompressionAdapter,
{
    /// Create a new snapshot engine with the given configuration and compression adapter
    pub fn new(config: VeghConfig, compressor: C) -> Self {
        Self { config, compressor }
    }

    pub fn config(&self) -> &VeghConfig {
        &self.config
    }

    /// Pack `source` into a snapshot at `output`
    ///
    /// Files are collected in sorted order after applying `.gitignore` and
    /// `.veghignore` files (each scoped to its directory), configured patterns
    /// and `options` overrides, in that order of precedence. `output` itself
    /// is never collected.
    ///
    /// # Errors
    /// * `SnapError::Resource` - `source` is missing or unreadable, or `output` cannot be written
    /// * `SnapError::Configuration` - a malformed ignore pattern
    pub fn pack(&self, source: &Path, output: &Path, options: &PackOptions) -> Result<PackReport> {
        let overrides = RuleSet::overrides(&options.include, &options.exclude);
        let rule_sets = load_rule_sets(&self.config.ignore, Some(overrides));
        let matcher = IgnoreMatcher::compile(source, &rule_sets)?;

        let collector = FileCollector::new(
            matcher,
            CollectOptions {
                include_hidden: self.config.pack.include_hidden,
                workers: self.config.pack.workers,
                exclude_files: vec![output.to_path_buf()],
                ignore_files: ignore_file_names(&self.config.ignore),
            },
        );
        let files = collector.collect(source)?;
        info!(source = %source.display(), files = files.len(), "collected files");

        let author = options
            .author
            .clone()
            .or_else(|| self.config.pack.author.clone())
            .unwrap_or_else(SnapshotMetadata::default_author);
        let mut metadata = SnapshotMetadata::new(author);
        if let Some(comment) = &options.comment {
            metadata = metadata.with_comment(comment.as_str());
        }

        let mut session = codec::begin(metadata, &self.compressor, output)?;
        for file in &files {
            let handle = File::open(&file.absolute_path)
                .map_err(|e| SnapError::resource(&file.absolute_path, e))?;
            session.write_entry(EntryHeader::from(file), BufReader::new(handle))?;
            debug!(path = %file.relative_path, size = file.size, "packed");
        }
        let summary = session.finish()?;
        observability::record_packed(summary.entry_count, summary.total_bytes);

        Ok(PackReport {
            summary,
            source: source.to_path_buf(),
        })
    }

    /// Open a snapshot, reading metadata and manifest only
    pub fn open(&self, path: &Path) -> Result<SnapshotHandle> {
        codec::open(path)
    }

    /// Recompute the payload digest and report the snapshot's metadata
    ///
    /// # Errors
    /// * `SnapError::IntegrityCheckFailed` - stored and recomputed digests differ
    /// * `SnapError::CorruptArchive` - unreadable container
    pub fn check(&self, path: &Path) -> Result<CheckReport> {
        let handle = codec::open(path)?;
        let digest = integrity::verify(path)?;
        info!(path = %path.display(), %digest, "snapshot verified");

        Ok(CheckReport {
            digest,
            metadata: handle.metadata().clone(),
            entry_count: handle.manifest().len(),
            total_bytes: handle.manifest().total_size(),
            file_len: handle.file_len(),
        })
    }

    /// Manifest entries in payload order
    pub fn list(&self, path: &Path) -> Result<Vec<Entry>> {
        Ok(codec::open(path)?.entries().to_vec())
    }

    /// Metadata block, without touching the payload
    pub fn metadata(&self, path: &Path) -> Result<SnapshotMetadata> {
        Ok(codec::open(path)?.metadata().clone())
    }

    /// Materialize the snapshot below `destination`
    ///
    /// # Errors
    /// * `SnapError::Traversal` - a manifest path escapes `destination`; nothing is written
    pub fn restore(&self, path: &Path, destination: &Path) -> Result<RestoreSummary> {
        codec::open(path)?.extract_all(destination)
    }

    /// Per-category line counts computed from the compressed snapshot
    pub fn loc(&self, path: &Path) -> Result<LocReport> {
        loc::count(&codec::open(path)?)
    }

    /// Upload the snapshot to `endpoint`
    ///
    /// The container is opened first so that a corrupt file is never sent.
    pub async fn send(
        &self,
        path: &Path,
        endpoint: &str,
        auth_token: Option<&str>,
        force_chunk: bool,
        cancel: CancellationToken,
    ) -> Result<TransferResult> {
        codec::open(path)?;
        let options = TransferOptions::from_config(&self.config.transfer).with_force_chunk(force_chunk);
        transport::send(path, endpoint, auth_token, &options, cancel).await
    }
}

/// Engine with default configuration and gzip compression
pub fn create_default_engine() -> SnapshotEngine<GzipCompressor> {
    SnapshotEngine::new(VeghConfig::default(), GzipCompressor::new())
}

/// Engine whose gzip level comes from `config`
pub fn create_engine_from_config(config: VeghConfig) -> Result<SnapshotEngine<GzipCompressor>> {
    config.validate()?;
    let compressor = GzipCompressor::with_level(config.pack.compression_level);
    Ok(SnapshotEngine::new(config, compressor))
}
