//! Path normalization and glob matching shared by the policy layers.

use std::path::Path;

use glob::{MatchOptions, Pattern, PatternError};

/// Separators must be matched literally so `*` stays inside one directory
/// and `**` is the only way to cross levels.
const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: false,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

/// Normalize a path for policy comparison.
///
/// Backslashes become `/`, a leading `project_root` prefix is stripped
/// (case-insensitively), `.` segments and duplicate separators are dropped and
/// `..` is resolved lexically. The result never starts with `/` or `./`.
/// Letter case is preserved; matching is case-insensitive instead.
pub fn normalize_path(path: &str, project_root: Option<&Path>) -> String {
    let mut unified = path.trim().replace('\\', "/");

    if let Some(root) = project_root {
        let root = root.to_string_lossy().replace('\\', "/");
        let root = root.trim_end_matches('/');
        if !root.is_empty()
            && let Some(rest) = strip_prefix_ignore_case(&unified, root)
            && (rest.is_empty() || rest.starts_with('/'))
        {
            unified = rest.to_string();
        }
    }

    let mut segments: Vec<&str> = Vec::new();
    for segment in unified.split('/') {
        match segment {
            "" | "." => {}
            ".." => match segments.last() {
                Some(last) if *last != ".." => {
                    segments.pop();
                }
                _ => segments.push(".."),
            },
            other => segments.push(other),
        }
    }
    segments.join("/")
}

fn strip_prefix_ignore_case<'a>(value: &'a str, prefix: &str) -> Option<&'a str> {
    let head = value.get(..prefix.len())?;
    if head.eq_ignore_ascii_case(prefix) {
        value.get(prefix.len()..)
    } else {
        None
    }
}

/// Substitute `{self}` with an agent name.
pub fn substitute_self(pattern: &str, agent: &str) -> String {
    pattern.replace("{self}", agent)
}

/// A compiled path glob.
///
/// Patterns are anchored at the project root. A pattern ending in `/**` also
/// matches the directory itself, so `secrets/**` covers `rm -r secrets`.
#[derive(Clone, Debug)]
pub struct PathPattern {
    source: String,
    normalized: String,
    pattern: Pattern,
    base: Option<Pattern>,
    match_file_name: bool,
}

impl PathPattern {
    /// Compile an anchored pattern.
    pub fn new(glob: &str) -> Result<Self, PatternError> {
        let normalized = normalize_pattern(glob);
        let pattern = Pattern::new(&normalized)?;
        let base = match normalized.strip_suffix("/**") {
            Some(base) if !base.is_empty() => Some(Pattern::new(base)?),
            _ => None,
        };
        Ok(Self {
            source: glob.to_string(),
            normalized,
            pattern,
            base,
            match_file_name: false,
        })
    }

    /// Compile a pattern with gitignore-like semantics: when the glob has no
    /// `/`, it also matches the file name at any depth (`*.pem`, `.env`).
    pub fn unanchored(glob: &str) -> Result<Self, PatternError> {
        let mut compiled = Self::new(glob)?;
        compiled.match_file_name = !compiled.normalized.contains('/');
        Ok(compiled)
    }

    /// The pattern text as written.
    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Check a normalized path against this pattern.
    pub fn matches(&self, path: &str) -> bool {
        if self.pattern.matches_with(path, MATCH_OPTIONS) {
            return true;
        }
        if let Some(base) = &self.base
            && base.matches_with(path, MATCH_OPTIONS)
        {
            return true;
        }
        if self.match_file_name
            && let Some(name) = path.rsplit('/').next()
        {
            return self.pattern.matches_with(name, MATCH_OPTIONS);
        }
        false
    }

    /// Whether an operand that may itself be a glob could name a path this
    /// pattern matches. With `through_dirs`, the operand is also taken as a
    /// directory whose whole tree is touched, so anchored patterns below it
    /// count. Undecidable cases count as overlapping.
    ///
    /// Name-only patterns are compared against the operand's file name and
    /// are not looked for inside directories.
    pub fn may_reach(&self, operand: &str, through_dirs: bool) -> bool {
        if self.matches(operand) {
            return true;
        }
        let operand: Vec<&str> = operand.split('/').filter(|s| !s.is_empty()).collect();
        if self.match_file_name {
            return operand
                .last()
                .is_some_and(|name| has_wildcard(name) && segment_may_overlap(name, &self.normalized));
        }
        let pattern: Vec<&str> = self.normalized.split('/').filter(|s| !s.is_empty()).collect();
        segments_may_overlap(&operand, &pattern, through_dirs)
    }
}

fn has_wildcard(segment: &str) -> bool {
    segment.contains(['*', '?', '['])
}

/// Segment-wise overlap. A pattern `**` may absorb operand segments, but
/// a directory operand only reaches below itself before the first `**`.
fn segments_may_overlap(operand: &[&str], pattern: &[&str], through_dirs: bool) -> bool {
    match (operand.split_first(), pattern.split_first()) {
        (None, None) => true,
        (None, Some(_)) => through_dirs,
        (Some((&"**", _)), _) => true,
        (Some((_, o_rest)), Some((&"**", p_rest))) => {
            p_rest.is_empty()
                || segments_may_overlap(operand, p_rest, false)
                || segments_may_overlap(o_rest, pattern, false)
        }
        (Some(_), None) => false,
        (Some((o, o_rest)), Some((p, p_rest))) => {
            segment_may_overlap(o, p) && segments_may_overlap(o_rest, p_rest, through_dirs)
        }
    }
}

/// Whether two single path segments, either of which may be a glob, could
/// match the same name.
fn segment_may_overlap(a: &str, b: &str) -> bool {
    match (has_wildcard(a), has_wildcard(b)) {
        (false, false) => a.eq_ignore_ascii_case(b),
        (true, false) => Pattern::new(a).ok().is_none_or(|p| p.matches_with(b, MATCH_OPTIONS)),
        (false, true) => Pattern::new(b).ok().is_none_or(|p| p.matches_with(a, MATCH_OPTIONS)),
        (true, true) => {
            let (a, b) = (a.to_ascii_lowercase(), b.to_ascii_lowercase());
            let (a_head, b_head) = (literal_head(&a), literal_head(&b));
            let (a_tail, b_tail) = (literal_tail(&a), literal_tail(&b));
            (a_head.starts_with(b_head) || b_head.starts_with(a_head))
                && (a_tail.ends_with(b_tail) || b_tail.ends_with(a_tail))
        }
    }
}

/// Literal text before the first wildcard.
fn literal_head(glob: &str) -> &str {
    &glob[..glob.find(['*', '?', '[']).unwrap_or(glob.len())]
}

/// Literal text after the last wildcard or character class.
fn literal_tail(glob: &str) -> &str {
    &glob[glob.rfind(['*', '?', ']']).map_or(0, |i| i + 1)..]
}

fn normalize_pattern(glob: &str) -> String {
    let mut pattern = glob.trim().replace('\\', "/");
    while let Some(rest) = pattern.strip_prefix("./") {
        pattern = rest.to_string();
    }
    pattern.trim_start_matches('/').to_string()
}
