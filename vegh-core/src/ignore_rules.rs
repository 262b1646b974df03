//! Ignore rule compilation for snapshot collection
//!
//! Rules come from these sources, lowest priority first:
//! 1. `.gitignore` files, in any directory
//! 2. `.veghignore` files, in any directory
//! 3. configured extra patterns
//! 4. caller overrides (`--exclude` / `--include`)
//!
//! An ignore file applies to its own directory and everything below it, and
//! a deeper file overrides a shallower one. Inside a set the last matching
//! pattern wins, with the usual gitignore syntax (`*`, `**`, leading `!`,
//! trailing `/`).

use crate::config::IgnoreConfig;
use crate::{Result, SnapError};
use ignore::gitignore::{Gitignore, GitignoreBuilder};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Project-specific ignore file name
pub const VEGHIGNORE: &str = ".veghignore";

/// General-purpose ignore file name
pub const GITIGNORE: &str = ".gitignore";

/// One source of patterns, in declaration order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleSet {
    /// Label used in error messages (usually a file name)
    pub source: String,
    pub patterns: Vec<String>,
}

impl RuleSet {
    pub fn new<S: Into<String>>(source: S, patterns: Vec<String>) -> Self {
        Self {
            source: source.into(),
            patterns,
        }
    }

    /// Parse an ignore file; `Ok(None)` when it does not exist
    pub fn from_file(path: &Path) -> Result<Option<Self>> {
        if !path.is_file() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(path).map_err(|e| SnapError::resource(path, e))?;
        let patterns = content.lines().map(|line| line.to_string()).collect();
        let source = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        Ok(Some(Self::new(source, patterns)))
    }

    /// Caller overrides: excludes are plain patterns, includes are negated
    /// and come last so a forced include beats a forced exclude.
    pub fn overrides(include: &[String], exclude: &[String]) -> Self {
        let mut patterns: Vec<String> = exclude.to_vec();
        patterns.extend(include.iter().map(|p| format!("!{p}")));
        Self::new("overrides", patterns)
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.iter().all(|p| p.trim().is_empty())
    }
}

/// Outcome of matching one path against the compiled rules
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Excluded,
    /// Explicitly re-included by a negated pattern
    Included,
    Unmatched,
}

/// Compiled rules for one collection root
///
/// Ignore files are scoped to the directory holding them and only match
/// paths below it. Config patterns and caller overrides apply to the whole
/// tree and sit above every ignore file.
#[derive(Debug, Clone, Default)]
pub struct IgnoreMatcher {
    root: PathBuf,
    /// Config patterns then overrides, lowest precedence first
    global: Vec<Gitignore>,
    /// Ignore files keyed by their directory relative to the root ("" for the root)
    scoped: HashMap<PathBuf, Vec<Gitignore>>,
}

impl IgnoreMatcher {
    /// Compile tree-wide rule sets anchored at `root`
    ///
    /// A pattern that fails to parse is a configuration error naming its
    /// source and line.
    pub fn compile(root: &Path, rule_sources: &[RuleSet]) -> Result<Self> {
        Ok(Self {
            root: root.to_path_buf(),
            global: compile_sets(root, rule_sources)?,
            scoped: HashMap::new(),
        })
    }

    /// Matcher that excludes nothing
    pub fn empty() -> Self {
        Self::default()
    }

    /// Directory that ignore files added later are anchored below
    pub fn set_root(&mut self, root: &Path) {
        self.root = root.to_path_buf();
    }

    /// Attach the ignore files found in `dir` (relative to the root)
    ///
    /// `rule_sources` are ordered lowest precedence first, i.e. `.gitignore`
    /// before `.veghignore`.
    pub fn add_ignore_files(&mut self, dir: &Path, rule_sources: &[RuleSet]) -> Result<()> {
        if rule_sources.is_empty() {
            return Ok(());
        }
        let compiled = compile_sets(&self.root.join(dir), rule_sources)?;
        self.scoped.insert(dir.to_path_buf(), compiled);
        Ok(())
    }

    /// Decide a single path (relative to the root) without looking at parents
    ///
    /// Tree-wide sets are consulted first, then ignore files from the
    /// deepest enclosing directory up to the root.
    pub fn decision(&self, relative: &Path, is_dir: bool) -> Decision {
        if let Some(decision) = first_match(&self.global, relative, is_dir) {
            return decision;
        }
        if self.scoped.is_empty() {
            return Decision::Unmatched;
        }

        for dir in relative.ancestors().skip(1) {
            let Some(sets) = self.scoped.get(dir) else {
                continue;
            };
            let local = relative.strip_prefix(dir).unwrap_or(relative);
            if let Some(decision) = first_match(sets, local, is_dir) {
                return decision;
            }
        }
        Decision::Unmatched
    }

    /// True when the path itself is excluded
    pub fn is_excluded(&self, relative: &Path, is_dir: bool) -> bool {
        self.decision(relative, is_dir) == Decision::Excluded
    }

    /// True when `relative` would not be collected
    ///
    /// Ancestors are checked first: once a directory is excluded the walk
    /// never descends into it, so nothing below it can be re-included.
    pub fn matches(&self, relative: &Path) -> bool {
        let mut ancestor = PathBuf::new();
        let components: Vec<_> = relative.components().collect();
        if let Some((_, parents)) = components.split_last() {
            for component in parents {
                ancestor.push(component);
                if self.is_excluded(&ancestor, true) {
                    return true;
                }
            }
        }
        self.is_excluded(relative, false)
    }
}

fn compile_sets(root: &Path, rule_sources: &[RuleSet]) -> Result<Vec<Gitignore>> {
    let mut sets = Vec::with_capacity(rule_sources.len());

    for rules in rule_sources {
        let mut builder = GitignoreBuilder::new(root);
        for (lineno, pattern) in rules.patterns.iter().enumerate() {
            builder
                .add_line(Some(PathBuf::from(&rules.source)), pattern)
                .map_err(|e| {
                    SnapError::configuration(format!(
                        "invalid ignore pattern '{}' in {} line {}: {e}",
                        pattern,
                        rules.source,
                        lineno + 1
                    ))
                })?;
        }
        let compiled = builder.build().map_err(|e| {
            SnapError::configuration(format!("failed to compile {}: {e}", rules.source))
        })?;
        debug!(source = %rules.source, patterns = compiled.num_ignores() + compiled.num_whitelists(), "Compiled ignore rules");
        sets.push(compiled);
    }

    Ok(sets)
}

/// Last set wins, and inside a set the last matching pattern wins
fn first_match(sets: &[Gitignore], relative: &Path, is_dir: bool) -> Option<Decision> {
    for set in sets.iter().rev() {
        let matched = set.matched(relative, is_dir);
        if matched.is_ignore() {
            return Some(Decision::Excluded);
        }
        if matched.is_whitelist() {
            return Some(Decision::Included);
        }
    }
    None
}

/// Ignore file names honored in every directory, lowest precedence first
pub fn ignore_file_names(config: &IgnoreConfig) -> Vec<&'static str> {
    let mut names = Vec::new();
    if config.use_gitignore {
        names.push(GITIGNORE);
    }
    if config.use_veghignore {
        names.push(VEGHIGNORE);
    }
    names
}

/// Read the ignore files sitting directly in `root/dir`, in `names` order
///
/// Each set is labelled with its path relative to `root`.
pub fn read_ignore_files(root: &Path, dir: &Path, names: &[&str]) -> Result<Vec<RuleSet>> {
    let mut sets = Vec::new();
    for name in names {
        if let Some(mut rules) = RuleSet::from_file(&root.join(dir).join(name))? {
            rules.source = dir.join(name).display().to_string();
            sets.push(rules);
        }
    }
    Ok(sets)
}

/// Tree-wide rule sets from `config` and caller overrides, lowest precedence first
pub fn load_rule_sets(config: &IgnoreConfig, overrides: Option<RuleSet>) -> Vec<RuleSet> {
    let mut sets = Vec::new();
    if !config.extra_patterns.is_empty() {
        sets.push(RuleSet::new("config", config.extra_patterns.clone()));
    }
    if let Some(rules) = overrides.filter(|r| !r.is_empty()) {
        sets.push(rules);
    }
    sets
}
