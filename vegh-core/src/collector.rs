//! Directory traversal producing the ordered snapshot manifest.
//!
//! Subtrees are walked on a bounded pool of worker threads. Ignore rules are
//! applied before descending, so an excluded directory is never read. Each
//! accepted directory's own ignore files are loaded before its children are
//! filtered. The
//! results are sorted by relative path once the walk completes, which makes
//! the manifest independent of thread scheduling.
//!
//! Symbolic links are never followed into directories. A link to a regular
//! file is collected as a regular file with the target's content and
//! permissions; links to directories and dangling links are skipped.

use crate::ignore_rules::{read_ignore_files, IgnoreMatcher};
use crate::{Result, SnapError};
use ignore::{DirEntry, WalkBuilder, WalkState};
use std::fs::Metadata;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use tracing::{debug, info};

/// Directory names that are never collected
const ALWAYS_SKIPPED: &[&str] = &[".git"];

/// Options for directory walking
#[derive(Debug, Clone)]
pub struct CollectOptions {
    /// Collect dot-files and dot-directories
    pub include_hidden: bool,

    /// Worker threads for the walk
    pub workers: usize,

    /// Files that must never be collected, e.g. the snapshot being written
    pub exclude_files: Vec<PathBuf>,

    /// Ignore file names read from every visited directory, lowest precedence first
    pub ignore_files: Vec<&'static str>,
}

impl Default for CollectOptions {
    fn default() -> Self {
        Self {
            include_hidden: false,
            workers: num_cpus::get().max(1),
            exclude_files: vec![],
            ignore_files: vec![],
        }
    }
}

/// A file selected for packing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectedFile {
    /// '/'-separated path relative to the collection root
    pub relative_path: String,

    /// Path the content is read from
    pub absolute_path: PathBuf,

    pub size: u64,

    /// Permission bits
    pub mode: u32,
}

/// Walks a tree and applies ignore rules
#[derive(Debug, Clone)]
pub struct FileCollector {
    matcher: Arc<IgnoreMatcher>,
    options: CollectOptions,
}

impl FileCollector {
    pub fn new(matcher: IgnoreMatcher, options: CollectOptions) -> Self {
        Self {
            matcher: Arc::new(matcher),
            options,
        }
    }

    /// Collect every included regular file under `root`, sorted by relative path
    ///
    /// # Errors
    /// * `SnapError::Resource` - root missing, not a directory, or unreadable entry
    /// * `SnapError::Configuration` - malformed pattern in an ignore file
    pub fn collect(&self, root: &Path) -> Result<Vec<CollectedFile>> {
        let root_meta = std::fs::metadata(root).map_err(|e| SnapError::resource(root, e))?;
        if !root_meta.is_dir() {
            return Err(SnapError::resource(
                root,
                std::io::Error::new(std::io::ErrorKind::InvalidInput, "not a directory"),
            ));
        }

        let root = root.to_path_buf();
        let excluded: Arc<Vec<PathBuf>> = Arc::new(
            self.options
                .exclude_files
                .iter()
                .filter_map(|p| std::fs::canonicalize(p).ok())
                .collect(),
        );

        let mut builder = WalkBuilder::new(&root);
        builder
            .standard_filters(false)
            .follow_links(false)
            .threads(self.options.workers.max(1));

        let mut matcher = (*self.matcher).clone();
        matcher.set_root(&std::fs::canonicalize(&root).unwrap_or_else(|_| root.clone()));
        let root_rules = read_ignore_files(&root, Path::new(""), &self.options.ignore_files)?;
        matcher.add_ignore_files(Path::new(""), &root_rules)?;

        let failure: Arc<Mutex<Option<SnapError>>> = Arc::new(Mutex::new(None));
        let filter = EntryFilter {
            root: root.clone(),
            matcher: RwLock::new(matcher),
            ignore_files: self.options.ignore_files.clone(),
            include_hidden: self.options.include_hidden,
            failure: Arc::clone(&failure),
        };
        builder.filter_entry(move |entry| filter.keep(entry));

        let files: Arc<Mutex<Vec<CollectedFile>>> = Arc::new(Mutex::new(Vec::new()));

        builder.build_parallel().run(|| {
            let files = Arc::clone(&files);
            let failure = Arc::clone(&failure);
            let excluded = Arc::clone(&excluded);
            let root = root.clone();

            Box::new(move |result| {
                let outcome = result
                    .map_err(|e| walk_error(&root, e))
                    .and_then(|entry| to_collected(&entry, &root, &excluded));

                match outcome {
                    Ok(Some(file)) => {
                        if let Ok(mut files) = files.lock() {
                            files.push(file);
                        }
                        WalkState::Continue
                    }
                    Ok(None) => WalkState::Continue,
                    Err(e) => {
                        if let Ok(mut slot) = failure.lock() {
                            slot.get_or_insert(e);
                        }
                        WalkState::Quit
                    }
                }
            })
        });
        // The entry filter holds a handle on the failure slot
        drop(builder);

        if let Some(err) = take_inner(failure)? {
            return Err(err);
        }

        let mut files = take_inner(files)?;
        files.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));

        info!(root = %root.display(), files = files.len(), "Collected files");
        Ok(files)
    }
}

fn take_inner<T: Default>(shared: Arc<Mutex<T>>) -> Result<T> {
    let mutex = Arc::try_unwrap(shared)
        .map_err(|_| SnapError::configuration("walker still holds collection state"))?;
    mutex
        .into_inner()
        .map_err(|_| SnapError::configuration("walker thread panicked"))
}

/// Pruning state shared by the walker threads
struct EntryFilter {
    root: PathBuf,
    matcher: RwLock<IgnoreMatcher>,
    ignore_files: Vec<&'static str>,
    include_hidden: bool,
    failure: Arc<Mutex<Option<SnapError>>>,
}

impl EntryFilter {
    /// Evaluated before the walker descends into a directory
    fn keep(&self, entry: &DirEntry) -> bool {
        if entry.depth() == 0 {
            return true;
        }

        let name = entry.file_name().to_string_lossy();
        let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);

        if is_dir && ALWAYS_SKIPPED.contains(&name.as_ref()) {
            return false;
        }
        if !self.include_hidden && name.starts_with('.') {
            return false;
        }

        let Ok(relative) = entry.path().strip_prefix(&self.root) else {
            return true;
        };
        let excluded = match self.matcher.read() {
            Ok(matcher) => matcher.is_excluded(relative, is_dir),
            Err(_) => {
                self.fail(SnapError::configuration("ignore rules lock poisoned"));
                return false;
            }
        };
        if excluded {
            return false;
        }

        if is_dir && !self.ignore_files.is_empty() {
            if let Err(e) = self.load_directory(relative) {
                self.fail(e);
                return false;
            }
        }
        true
    }

    /// Attach the ignore files of an accepted directory before its children are filtered
    fn load_directory(&self, relative: &Path) -> Result<()> {
        let rules = read_ignore_files(&self.root, relative, &self.ignore_files)?;
        if rules.is_empty() {
            return Ok(());
        }
        debug!(dir = %relative.display(), files = rules.len(), "Loaded nested ignore files");
        self.matcher
            .write()
            .map_err(|_| SnapError::configuration("ignore rules lock poisoned"))?
            .add_ignore_files(relative, &rules)
    }

    fn fail(&self, err: SnapError) {
        if let Ok(mut slot) = self.failure.lock() {
            slot.get_or_insert(err);
        }
    }
}

fn walk_error(root: &Path, err: ignore::Error) -> SnapError {
    match err.into_io_error() {
        Some(io) => SnapError::resource(root, io),
        None => SnapError::resource(
            root,
            std::io::Error::new(std::io::ErrorKind::Other, "directory walk failed"),
        ),
    }
}

fn to_collected(entry: &DirEntry, root: &Path, excluded: &[PathBuf]) -> Result<Option<CollectedFile>> {
    let Some(file_type) = entry.file_type() else {
        return Ok(None);
    };
    let path = entry.path();

    let metadata = if file_type.is_symlink() {
        match std::fs::metadata(path) {
            Ok(target) if target.is_file() => target,
            Ok(_) => {
                debug!(path = %path.display(), "Skipping symlink to directory");
                return Ok(None);
            }
            Err(_) => {
                debug!(path = %path.display(), "Skipping dangling symlink");
                return Ok(None);
            }
        }
    } else if file_type.is_file() {
        entry
            .metadata()
            .map_err(|e| walk_error(path, e))?
    } else {
        return Ok(None);
    };

    if !excluded.is_empty() {
        if let Ok(canonical) = std::fs::canonicalize(path) {
            if excluded.contains(&canonical) {
                debug!(path = %path.display(), "Skipping output file");
                return Ok(None);
            }
        }
    }

    let relative = path.strip_prefix(root).unwrap_or(path);
    Ok(Some(CollectedFile {
        relative_path: relative_to_string(relative)?,
        absolute_path: path.to_path_buf(),
        size: metadata.len(),
        mode: permission_bits(&metadata),
    }))
}

/// Join normal components with '/'; anything else cannot be stored in a manifest
pub fn relative_to_string(relative: &Path) -> Result<String> {
    let mut parts = Vec::new();
    for component in relative.components() {
        match component {
            Component::Normal(part) => {
                let part = part.to_str().ok_or_else(|| {
                    SnapError::resource(
                        relative,
                        std::io::Error::new(std::io::ErrorKind::InvalidData, "path is not valid UTF-8"),
                    )
                })?;
                parts.push(part);
            }
            Component::CurDir => {}
            _ => {
                return Err(SnapError::traversal(format!(
                    "'{}' is not a plain relative path",
                    relative.display()
                )))
            }
        }
    }
    Ok(parts.join("/"))
}

#[cfg(unix)]
pub(crate) fn permission_bits(metadata: &Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
pub(crate) fn permission_bits(_metadata: &Metadata) -> u32 {
    0o644
}
