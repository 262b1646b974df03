/*!
Lines-of-code analysis straight from a snapshot.

Entries are decoded in manifest order and classified line by line as blank,
comment or code using per-language comment rules. Nothing is written to
disk.

```rust,no_run
use std::path::Path;

let handle = vegh_core::codec::open(Path::new("project.snap"))?;
let report = vegh_core::loc::count(&handle)?;
for (category, stats) in report.sorted() {
    println!("{category}: {} files, {} lines", stats.files, stats.lines);
}
# Ok::<(), vegh_core::SnapError>(())
```
*/

use crate::codec::SnapshotHandle;
use crate::collector::CollectedFile;
use crate::format::read_error;
use crate::{Result, SnapError};
use once_cell::sync::Lazy;
use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::{self, BufRead, BufReader, Cursor, Read};
use tracing::debug;

/// Bytes inspected for NUL when deciding whether an entry is binary
const BINARY_PROBE: usize = 8 * 1024;

/// Category for unrecognized files
pub const OTHER: &str = "other";

/// Comment rules for one language
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Language {
    pub category: &'static str,
    pub line_comments: &'static [&'static str],
    pub block_comment: Option<(&'static str, &'static str)>,
}

const fn lang(
    category: &'static str,
    line_comments: &'static [&'static str],
    block_comment: Option<(&'static str, &'static str)>,
) -> Language {
    Language {
        category,
        line_comments,
        block_comment,
    }
}

const C_BLOCK: Option<(&str, &str)> = Some(("/*", "*/"));
const MARKUP_BLOCK: Option<(&str, &str)> = Some(("<!--", "-->"));

static RUST: Language = lang("rust", &["//"], C_BLOCK);
static PYTHON: Language = lang("python", &["#"], Some(("\"\"\"", "\"\"\"")));
static JAVASCRIPT: Language = lang("javascript", &["//"], C_BLOCK);
static TYPESCRIPT: Language = lang("typescript", &["//"], C_BLOCK);
static HTML: Language = lang("html", &[], MARKUP_BLOCK);
static CSS: Language = lang("css", &[], C_BLOCK);
static SCSS: Language = lang("scss", &["//"], C_BLOCK);
static C: Language = lang("c", &["//"], C_BLOCK);
static C_HEADER: Language = lang("c/c++", &["//"], C_BLOCK);
static CPP: Language = lang("c++", &["//"], C_BLOCK);
static GO: Language = lang("go", &["//"], C_BLOCK);
static JAVA: Language = lang("java", &["//"], C_BLOCK);
static RUBY: Language = lang("ruby", &["#"], Some(("=begin", "=end")));
static PHP: Language = lang("php", &["//", "#"], C_BLOCK);
static SHELL: Language = lang("shell", &["#"], None);
static JSON: Language = lang("json", &[], None);
static TOML: Language = lang("toml", &["#"], None);
static YAML: Language = lang("yaml", &["#"], None);
static MARKDOWN: Language = lang("markdown", &[], MARKUP_BLOCK);
static TEXT: Language = lang("text", &[], None);
static SQL: Language = lang("sql", &["--"], C_BLOCK);
static DOCKERFILE: Language = lang("dockerfile", &["#"], None);
static MAKEFILE: Language = lang("makefile", &["#"], None);
static CARGO: Language = lang("cargo", &["#"], None);
static PYTHON_CONFIG: Language = lang("python config", &["#"], None);
static NPM_CONFIG: Language = lang("npm config", &[], None);
static OTHER_LANGUAGE: Language = lang(OTHER, &[], None);

static BY_EXTENSION: Lazy<HashMap<&'static str, &'static Language>> = Lazy::new(|| {
    let table: &[(&str, &'static Language)] = &[
        ("rs", &RUST),
        ("py", &PYTHON),
        ("pyi", &PYTHON),
        ("js", &JAVASCRIPT),
        ("jsx", &JAVASCRIPT),
        ("mjs", &JAVASCRIPT),
        ("ts", &TYPESCRIPT),
        ("tsx", &TYPESCRIPT),
        ("html", &HTML),
        ("css", &CSS),
        ("scss", &SCSS),
        ("c", &C),
        ("h", &C_HEADER),
        ("cpp", &CPP),
        ("hpp", &CPP),
        ("cc", &CPP),
        ("go", &GO),
        ("java", &JAVA),
        ("rb", &RUBY),
        ("php", &PHP),
        ("sh", &SHELL),
        ("bash", &SHELL),
        ("zsh", &SHELL),
        ("json", &JSON),
        ("toml", &TOML),
        ("yaml", &YAML),
        ("yml", &YAML),
        ("md", &MARKDOWN),
        ("txt", &TEXT),
        ("sql", &SQL),
        ("dockerfile", &DOCKERFILE),
    ];
    table.iter().copied().collect()
});

static BY_FILENAME: Lazy<HashMap<&'static str, &'static Language>> = Lazy::new(|| {
    let table: &[(&str, &'static Language)] = &[
        ("dockerfile", &DOCKERFILE),
        ("makefile", &MAKEFILE),
        ("cargo.toml", &CARGO),
        ("pyproject.toml", &PYTHON_CONFIG),
        ("package.json", &NPM_CONFIG),
    ];
    table.iter().copied().collect()
});

/// Pick comment rules for a '/'-separated path
///
/// Well-known file names win over extensions; matching is case-insensitive.
pub fn classify(relative_path: &str) -> &'static Language {
    let name = relative_path
        .rsplit('/')
        .next()
        .unwrap_or(relative_path)
        .to_ascii_lowercase();

    if let Some(language) = BY_FILENAME.get(name.as_str()).copied() {
        return language;
    }
    name.rsplit_once('.')
        .filter(|(stem, _)| !stem.is_empty())
        .and_then(|(_, ext)| BY_EXTENSION.get(ext))
        .copied()
        .unwrap_or(&OTHER_LANGUAGE)
}

/// Line breakdown of a single file
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LineCounts {
    pub blank: u64,
    pub comment: u64,
    pub code: u64,
}

impl LineCounts {
    pub fn total(&self) -> u64 {
        self.blank + self.comment + self.code
    }
}

/// Aggregate for one category
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LocStats {
    pub files: u64,
    /// Total lines (blank + comment + code)
    pub lines: u64,
    pub blank: u64,
    pub comment: u64,
    pub code: u64,
}

impl LocStats {
    fn add(&mut self, counts: LineCounts) {
        self.files += 1;
        self.lines += counts.total();
        self.blank += counts.blank;
        self.comment += counts.comment;
        self.code += counts.code;
    }
}

/// Category -> statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LocReport {
    pub categories: BTreeMap<String, LocStats>,
    /// Entries skipped because they look binary
    pub binary_files: u64,
}

impl LocReport {
    /// Record one text file; files without any line are not counted
    pub fn record(&mut self, language: &Language, counts: LineCounts) {
        if counts.total() == 0 {
            return;
        }
        self.categories
            .entry(language.category.to_string())
            .or_default()
            .add(counts);
    }

    pub fn get(&self, category: &str) -> Option<&LocStats> {
        self.categories.get(category)
    }

    /// Categories by line count, largest first
    pub fn sorted(&self) -> Vec<(&str, &LocStats)> {
        let mut rows: Vec<(&str, &LocStats)> = self
            .categories
            .iter()
            .map(|(category, stats)| (category.as_str(), stats))
            .collect();
        rows.sort_by(|a, b| b.1.lines.cmp(&a.1.lines).then_with(|| a.0.cmp(b.0)));
        rows
    }

    pub fn total_files(&self) -> u64 {
        self.categories.values().map(|s| s.files).sum()
    }

    pub fn total_lines(&self) -> u64 {
        self.categories.values().map(|s| s.lines).sum()
    }
}

/// Count lines of `reader`; `None` when the content looks binary
pub fn count_reader<R: Read>(language: &Language, mut reader: R) -> io::Result<Option<LineCounts>> {
    let mut head = Vec::with_capacity(BINARY_PROBE);
    (&mut reader).take(BINARY_PROBE as u64).read_to_end(&mut head)?;
    if head.contains(&0) {
        return Ok(None);
    }

    let mut lines = BufReader::new(Cursor::new(head).chain(reader));
    let mut counter = LineClassifier::new(language);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        if lines.read_until(b'\n', &mut buf)? == 0 {
            break;
        }
        counter.push(&String::from_utf8_lossy(&buf));
    }
    Ok(Some(counter.counts))
}

struct LineClassifier<'l> {
    language: &'l Language,
    /// Closing delimiter of the block comment we are inside
    open_block: Option<&'static str>,
    counts: LineCounts,
}

impl<'l> LineClassifier<'l> {
    fn new(language: &'l Language) -> Self {
        Self {
            language,
            open_block: None,
            counts: LineCounts::default(),
        }
    }

    fn push(&mut self, line: &str) {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            self.counts.blank += 1;
            return;
        }

        if let Some(end) = self.open_block {
            if trimmed.contains(end) {
                self.open_block = None;
            }
            self.counts.comment += 1;
            return;
        }

        if self.language.line_comments.iter().any(|p| trimmed.starts_with(p)) {
            self.counts.comment += 1;
            return;
        }

        if let Some((start, end)) = self.language.block_comment {
            if let Some(rest) = trimmed.strip_prefix(start) {
                if !rest.contains(end) {
                    self.open_block = Some(end);
                }
                self.counts.comment += 1;
                return;
            }
        }

        self.counts.code += 1;
    }
}

/// Count every entry of an opened snapshot
pub fn count(handle: &SnapshotHandle) -> Result<LocReport> {
    let mut report = LocReport::default();
    let mut stream = handle.stream_entries()?;

    while let Some((entry, content)) = stream.next_entry()? {
        let language = classify(&entry.relative_path);
        match count_reader(language, content).map_err(|e| read_error("payload", e))? {
            Some(counts) => report.record(language, counts),
            None => {
                debug!(path = %entry.relative_path, "skipping binary entry");
                report.binary_files += 1;
            }
        }
    }
    Ok(report)
}

/// Count collected files from disk, with the same rules as [`count`]
pub fn count_files(files: &[CollectedFile]) -> Result<LocReport> {
    let mut report = LocReport::default();
    for file in files {
        let language = classify(&file.relative_path);
        let reader = File::open(&file.absolute_path)
            .map_err(|e| SnapError::resource(&file.absolute_path, e))?;
        match count_reader(language, reader).map_err(|e| SnapError::resource(&file.absolute_path, e))? {
            Some(counts) => report.record(language, counts),
            None => report.binary_files += 1,
        }
    }
    Ok(report)
}
