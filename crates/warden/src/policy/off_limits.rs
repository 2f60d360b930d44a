//! Role-independent path blocklist read from the project's off-limits document.

use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use super::pattern::{PathPattern, normalize_path};

/// One glob from the off-limits document.
#[derive(Clone, Debug)]
pub struct OffLimitsPattern {
    /// Glob as written
    pub glob: String,
    /// 1-based line number in the source document
    pub line: usize,
    matcher: PathPattern,
}

impl OffLimitsPattern {
    /// Check a normalized path.
    pub fn matches(&self, path: &str) -> bool {
        self.matcher.matches(path)
    }
}

impl fmt::Display for OffLimitsPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "`{}` (line {})", self.glob, self.line)
    }
}

/// A line of the off-limits document that is not a valid glob.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InvalidPattern {
    /// Text of the line
    pub glob: String,
    /// 1-based line number
    pub line: usize,
    /// Parser message
    pub reason: String,
}

/// Ordered set of off-limits globs. The first match wins.
#[derive(Clone, Debug, Default)]
pub struct OffLimitsPolicy {
    source: Option<PathBuf>,
    patterns: Vec<OffLimitsPattern>,
    invalid: Vec<InvalidPattern>,
}

impl OffLimitsPolicy {
    /// A policy with no patterns.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Parse the first fenced code block of a markdown document.
    ///
    /// Blank lines and `#` comments inside the block are skipped. Lines that
    /// fail to compile are kept aside and reported by
    /// [`OffLimitsPolicy::invalid_patterns`].
    pub fn parse(doc: &str) -> Self {
        let mut policy = Self::default();
        let mut in_block = false;

        for (idx, raw) in doc.lines().enumerate() {
            let line = raw.trim();
            if line.starts_with("```") || line.starts_with("~~~") {
                if in_block {
                    break;
                }
                in_block = true;
                continue;
            }
            if !in_block || line.is_empty() || line.starts_with('#') {
                continue;
            }

            match PathPattern::unanchored(line) {
                Ok(matcher) => policy.patterns.push(OffLimitsPattern {
                    glob: line.to_string(),
                    line: idx + 1,
                    matcher,
                }),
                Err(e) => {
                    tracing::warn!(line = idx + 1, glob = %line, error = %e, "skipping invalid off-limits pattern");
                    policy.invalid.push(InvalidPattern {
                        glob: line.to_string(),
                        line: idx + 1,
                        reason: e.msg.to_string(),
                    });
                }
            }
        }
        policy
    }

    /// Load the document at `path`. A missing document yields an empty
    /// policy.
    pub fn load(path: &Path) -> io::Result<Self> {
        match fs::read_to_string(path) {
            Ok(doc) => {
                let mut policy = Self::parse(&doc);
                policy.source = Some(path.to_path_buf());
                tracing::debug!(path = %path.display(), patterns = policy.patterns.len(), "loaded off-limits policy");
                Ok(policy)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                tracing::warn!(path = %path.display(), "off-limits document not found; no paths are off limits");
                Ok(Self::empty())
            }
            Err(e) => Err(e),
        }
    }

    /// The first pattern matching `path`, if any.
    ///
    /// `path` may be relative or absolute; it is normalized against
    /// `project_root` before matching.
    pub fn is_off_limits(&self, path: &str, project_root: Option<&Path>) -> Option<&OffLimitsPattern> {
        let normalized = normalize_path(path, project_root);
        self.patterns.iter().find(|p| p.matches(&normalized))
    }

    /// The first pattern `path` could reach when it is a glob, or a
    /// directory whose tree is touched (`through_dirs`).
    ///
    /// This is a superset of [`OffLimitsPolicy::is_off_limits`].
    pub fn may_reach(&self, path: &str, project_root: Option<&Path>, through_dirs: bool) -> Option<&OffLimitsPattern> {
        let normalized = normalize_path(path, project_root);
        self.patterns
            .iter()
            .find(|p| p.matcher.may_reach(&normalized, through_dirs))
    }

    /// Compiled patterns in document order.
    pub fn patterns(&self) -> &[OffLimitsPattern] {
        &self.patterns
    }

    /// Lines that could not be compiled.
    pub fn invalid_patterns(&self) -> &[InvalidPattern] {
        &self.invalid
    }

    /// The document the policy was loaded from.
    pub fn source(&self) -> Option<&Path> {
        self.source.as_deref()
    }
}
