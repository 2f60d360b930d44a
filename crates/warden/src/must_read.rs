//! Mandatory reading before the first write.
//!
//! Role templates list files under a "Must read" heading. When an agent takes
//! a role those files become its `unread_must_reads`, and every write is
//! blocked until each of them has been read through the guard.

use std::collections::HashSet;
use std::path::Path;

use crate::policy::{BlockReason, BlockRule, normalize_path};
use crate::state::{AgentState, StateStore, StoreError};

/// Extract the raw entries listed under every "must read" heading.
///
/// Items may be bare paths, `` `code` `` spans or `[text](target)` links.
/// Placeholders are returned untouched.
pub fn parse_must_reads(template: &str) -> Vec<String> {
    let mut entries = Vec::new();
    let mut in_section = false;
    let mut in_fence = false;

    for line in template.lines() {
        let trimmed = line.trim();
        if trimmed.starts_with("```") {
            in_fence = !in_fence;
            continue;
        }
        if in_fence {
            continue;
        }
        if let Some(heading) = trimmed.strip_prefix('#') {
            let heading = heading.trim_start_matches('#').to_ascii_lowercase().replace('-', " ");
            in_section = heading.contains("must read");
            continue;
        }
        if !in_section {
            continue;
        }
        if let Some(item) = list_item(trimmed)
            && let Some(entry) = item_target(item)
        {
            entries.push(entry);
        }
    }
    entries
}

fn list_item(line: &str) -> Option<&str> {
    for bullet in ["- ", "* ", "+ "] {
        if let Some(rest) = line.strip_prefix(bullet) {
            return Some(rest.trim());
        }
    }
    let digits = line.find(|c: char| !c.is_ascii_digit())?;
    if digits == 0 {
        return None;
    }
    line[digits..]
        .strip_prefix(". ")
        .or_else(|| line[digits..].strip_prefix(") "))
        .map(str::trim)
}

fn item_target(item: &str) -> Option<String> {
    let item = item
        .strip_prefix("[ ] ")
        .or_else(|| item.strip_prefix("[x] "))
        .unwrap_or(item);

    if let Some(open) = item.find("](") {
        let rest = &item[open + 2..];
        let close = rest.find(')')?;
        return Some(rest[..close].trim().to_string()).filter(|s| !s.is_empty());
    }
    if let Some(start) = item.find('`') {
        let rest = &item[start + 1..];
        let end = rest.find('`')?;
        return Some(rest[..end].trim().to_string()).filter(|s| !s.is_empty());
    }
    item.split_whitespace().next().map(str::to_string)
}

/// The normalized, de-duplicated must-read list for an agent and task.
pub fn required_files(template: &str, agent: &str, task: &str, project_root: Option<&Path>) -> Vec<String> {
    let mut seen = HashSet::new();
    parse_must_reads(template)
        .into_iter()
        .map(|entry| entry.replace("{self}", agent).replace("{task}", task))
        .map(|entry| normalize_path(&entry, project_root))
        .filter(|entry| !entry.is_empty())
        .filter(|entry| seen.insert(entry.to_ascii_lowercase()))
        .collect()
}

/// Whether the agent has finished its mandatory reading.
pub fn check_write_allowed(state: &AgentState) -> bool {
    state.unread_must_reads.is_empty()
}

/// Block reason listing the files still to read, `None` if there are none.
pub fn write_block_reason(state: &AgentState) -> Option<BlockReason> {
    if check_write_allowed(state) {
        return None;
    }
    Some(BlockReason::new(
        BlockRule::MustRead,
        format!(
            "agent '{}' must read {} file(s) before writing: {}",
            state.name,
            state.unread_must_reads.len(),
            state.unread_must_reads.join(", ")
        ),
    ))
}

/// Tracks reads against an agent's must-read list.
#[derive(Debug)]
pub struct MustReadGate<'a, S> {
    store: &'a S,
    project_root: &'a Path,
}

impl<'a, S: StateStore> MustReadGate<'a, S> {
    /// Create a gate for a project.
    pub fn new(store: &'a S, project_root: &'a Path) -> Self {
        Self { store, project_root }
    }

    /// Mark `path` as read by `agent`.
    ///
    /// Returns true if the path was on the list. The path may be relative or
    /// absolute; matching is case-insensitive.
    pub fn record_read(&self, agent: &str, path: &str) -> Result<bool, StoreError> {
        self.record_reads(agent, std::slice::from_ref(&path))
            .map(|removed| removed > 0)
    }

    /// Mark several paths as read, saving the agent at most once. Returns
    /// how many list entries were removed.
    pub fn record_reads(&self, agent: &str, paths: &[&str]) -> Result<usize, StoreError> {
        let Some(mut state) = self.store.load_agent(agent)? else {
            return Ok(0);
        };
        if state.unread_must_reads.is_empty() {
            return Ok(0);
        }

        let read: HashSet<String> = paths
            .iter()
            .map(|p| normalize_path(p, Some(self.project_root)).to_ascii_lowercase())
            .collect();
        let before = state.unread_must_reads.len();
        state
            .unread_must_reads
            .retain(|entry| !read.contains(&entry.to_ascii_lowercase()));
        let removed = before - state.unread_must_reads.len();

        if removed > 0 {
            self.store.save_agent(&state)?;
            tracing::info!(
                agent = %agent,
                removed,
                remaining = state.unread_must_reads.len(),
                "must-read progress"
            );
        }
        Ok(removed)
    }

    /// Files `agent` still has to read.
    pub fn unread(&self, agent: &str) -> Result<Vec<String>, StoreError> {
        Ok(self
            .store
            .load_agent(agent)?
            .map(|state| state.unread_must_reads)
            .unwrap_or_default())
    }
}
