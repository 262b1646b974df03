//! Snapshot container codec.
//!
//! [`writer`] streams entries into a new container and [`reader`] opens,
//! streams and restores existing ones. Both sides share the path rules
//! defined here.

pub mod reader;
pub mod writer;

pub use reader::{open, EntryReader, EntryStream, RestoreSummary, SnapshotHandle};
pub use writer::{begin, EntryHeader, WriteSession, WriteSummary};

use crate::{Result, SnapError};
use std::path::{Component, Path, PathBuf};

/// Resolve a manifest path below `root`
///
/// Only plain '/'-separated segments are accepted. Absolute paths, `..`,
/// `.`, empty segments and drive prefixes are rejected with a traversal error.
pub fn safe_join(root: &Path, relative_path: &str) -> Result<PathBuf> {
    check_relative_path(relative_path)?;
    let mut joined = root.to_path_buf();
    for segment in relative_path.split('/') {
        joined.push(segment);
    }
    Ok(joined)
}

/// Validate the shape of a manifest path without touching the filesystem
pub fn check_relative_path(relative_path: &str) -> Result<()> {
    if relative_path.is_empty() {
        return Err(SnapError::traversal("empty entry path"));
    }
    if relative_path.contains('\\') || relative_path.contains('\0') {
        return Err(SnapError::traversal(format!(
            "entry path '{relative_path}' contains a forbidden character"
        )));
    }

    for segment in relative_path.split('/') {
        let mut components = Path::new(segment).components();
        match (components.next(), components.next()) {
            (Some(Component::Normal(_)), None) => {}
            _ => {
                return Err(SnapError::traversal(format!(
                    "entry path '{relative_path}' escapes the destination"
                )))
            }
        }
    }
    Ok(())
}
