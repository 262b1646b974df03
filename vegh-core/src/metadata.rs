/*!
Snapshot metadata block.

The metadata is stored as plain JSON at a header-addressed location so that
`check`, `list` and other inspections can read it without touching the
compressed payload.
*/

use crate::{Result, SnapError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Tool identifier written into every snapshot
pub const TOOL_VERSION: &str = concat!("vegh ", env!("CARGO_PKG_VERSION"));

/// Descriptive information about one snapshot
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SnapshotMetadata {
    /// Who created the snapshot
    pub author: String,

    /// Creation time (UTC)
    pub created_at: DateTime<Utc>,

    /// Optional human-readable comment
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,

    /// Name and version of the tool that wrote the snapshot
    pub tool_version: String,

    /// Number of manifest entries, filled in when the snapshot is finished
    pub entry_count: u64,

    /// Payload compression algorithm name
    pub compression: String,

    /// Level the payload was compressed with
    pub compression_level: u32,
}

impl SnapshotMetadata {
    /// Create metadata for a new snapshot
    ///
    /// # Example
    /// ```rust
    /// use vegh_core::SnapshotMetadata;
    ///
    /// let metadata = SnapshotMetadata::new("alice").with_comment("before refactor");
    /// assert_eq!(metadata.author, "alice");
    /// assert_eq!(metadata.entry_count, 0);
    /// ```
    pub fn new<S: Into<String>>(author: S) -> Self {
        Self {
            author: author.into(),
            created_at: Utc::now(),
            comment: None,
            tool_version: TOOL_VERSION.to_string(),
            entry_count: 0,
            compression: "gzip".to_string(),
            compression_level: 6,
        }
    }

    /// Author from the environment (`USER` / `USERNAME`), falling back to "unknown"
    pub fn default_author() -> String {
        std::env::var("USER")
            .or_else(|_| std::env::var("USERNAME"))
            .unwrap_or_else(|_| "unknown".to_string())
    }

    /// Set optional comment; blank comments are dropped
    pub fn with_comment<S: Into<String>>(mut self, comment: S) -> Self {
        let comment = comment.into();
        self.comment = if comment.trim().is_empty() { None } else { Some(comment) };
        self
    }

    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }

    /// Validate that required fields are set
    pub fn validate(&self) -> Result<()> {
        if self.author.trim().is_empty() {
            return Err(SnapError::configuration("author cannot be empty"));
        }
        if self.tool_version.is_empty() {
            return Err(SnapError::configuration("tool_version cannot be empty"));
        }
        Ok(())
    }

    /// Serialize to the bytes stored in the metadata block
    pub fn to_block(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Parse the metadata block; malformed JSON means a corrupt archive
    pub fn from_block(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes)
            .map_err(|e| SnapError::corrupt(format!("unreadable metadata block: {e}")))
    }

    /// Suggested file name: `<folder>.snap`, or `backup.snap` without a folder name
    pub fn suggested_filename(source_dir: &std::path::Path) -> String {
        let name = source_dir
            .canonicalize()
            .ok()
            .and_then(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| "backup".to_string());
        format!("{name}.snap")
    }
}
