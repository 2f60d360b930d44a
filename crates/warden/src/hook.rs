//! Adapter for pre-tool-use hooks.
//!
//! The hook host writes one JSON object to stdin before a tool runs:
//!
//! ```json
//! {
//!   "session_id": "6f1c…",
//!   "tool_name": "Edit",
//!   "tool_input": { "file_path": "/repo/src/code.cs", "old_string": "…" },
//!   "cwd": "/repo"
//! }
//! ```
//!
//! [`HookInput::to_request`] maps it onto a [`GuardRequest`]. Fields the
//! guard does not need are ignored.

use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::Deserialize;
use thiserror::Error;

use crate::guard::GuardRequest;
use crate::identity::SessionHint;

/// Errors turning hook input into a guard request.
#[derive(Debug, Error)]
pub enum HookError {
    /// Input is not a hook JSON object
    #[error("malformed hook input: {0}")]
    Malformed(#[from] serde_json::Error),
    /// The tool is not one the guard understands
    #[error("unsupported tool '{0}'")]
    UnsupportedTool(String),
    /// A required `tool_input` field is missing
    #[error("tool '{tool}' is missing tool_input.{field}")]
    MissingField {
        /// Tool name
        tool: String,
        /// Missing field
        field: &'static str,
    },
}

/// Tools the guard evaluates.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HookTool {
    /// Create or overwrite a file
    Write,
    /// Replace text in a file
    Edit,
    /// Several replacements in one file
    MultiEdit,
    /// Read a file
    Read,
    /// Run a shell command
    Bash,
    /// List files by pattern
    Glob,
    /// Search file contents
    Grep,
    /// Edit a notebook cell
    NotebookEdit,
}

impl HookTool {
    /// Whether the tool can change the repository.
    pub fn is_mutating(&self) -> bool {
        !matches!(self, HookTool::Read | HookTool::Glob | HookTool::Grep)
    }
}

impl FromStr for HookTool {
    type Err = HookError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "Write" => HookTool::Write,
            "Edit" => HookTool::Edit,
            "MultiEdit" => HookTool::MultiEdit,
            "Read" => HookTool::Read,
            "Bash" => HookTool::Bash,
            "Glob" => HookTool::Glob,
            "Grep" => HookTool::Grep,
            "NotebookEdit" => HookTool::NotebookEdit,
            other => return Err(HookError::UnsupportedTool(other.to_string())),
        })
    }
}

/// Whether a tool name denotes a mutating (or unknown) tool.
///
/// Unknown tools count as mutating so that errors about them fail closed.
pub fn is_mutating_tool(name: &str) -> bool {
    name.parse::<HookTool>().map_or(true, |tool| tool.is_mutating())
}

/// `tool_input` fields the guard reads.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct ToolInput {
    /// Write, Edit, MultiEdit, Read
    #[serde(default)]
    pub file_path: Option<String>,
    /// NotebookEdit
    #[serde(default)]
    pub notebook_path: Option<String>,
    /// Glob, Grep
    #[serde(default)]
    pub path: Option<String>,
    /// Bash
    #[serde(default)]
    pub command: Option<String>,
}

/// One hook invocation.
#[derive(Clone, Debug, Deserialize)]
pub struct HookInput {
    /// Host session id
    #[serde(default)]
    pub session_id: Option<String>,
    /// Tool about to run
    pub tool_name: String,
    /// Tool arguments
    #[serde(default)]
    pub tool_input: ToolInput,
    /// Working directory of the host
    #[serde(default)]
    pub cwd: Option<String>,
}

impl HookInput {
    /// Parse hook JSON.
    pub fn parse(json: &str) -> Result<Self, HookError> {
        Ok(serde_json::from_str(json)?)
    }

    /// The tool, if supported.
    pub fn tool(&self) -> Result<HookTool, HookError> {
        self.tool_name.parse()
    }

    /// How to identify the caller.
    pub fn session_hint(&self) -> SessionHint {
        SessionHint::from_session_id(self.session_id.as_deref())
    }

    /// Directory to search for the project from.
    pub fn working_dir(&self) -> Option<PathBuf> {
        self.cwd.as_deref().filter(|c| !c.is_empty()).map(PathBuf::from)
    }

    /// The guard request this tool call amounts to.
    pub fn to_request(&self) -> Result<GuardRequest, HookError> {
        let input = &self.tool_input;
        let request = match self.tool()? {
            HookTool::Write => GuardRequest::write(self.path_field(input.file_path.as_deref(), "file_path")?),
            HookTool::Edit | HookTool::MultiEdit => {
                GuardRequest::edit(self.path_field(input.file_path.as_deref(), "file_path")?)
            }
            HookTool::NotebookEdit => GuardRequest::edit(self.path_field(
                input.notebook_path.as_deref().or(input.file_path.as_deref()),
                "notebook_path",
            )?),
            HookTool::Read => GuardRequest::read(self.path_field(input.file_path.as_deref(), "file_path")?),
            HookTool::Glob | HookTool::Grep => {
                GuardRequest::read(self.path_field(Some(input.path.as_deref().unwrap_or(".")), "path")?)
            }
            HookTool::Bash => match input.command.as_deref() {
                Some(command) if !command.trim().is_empty() => match self.working_dir() {
                    Some(cwd) => GuardRequest::command_in(command, cwd.to_string_lossy()),
                    None => GuardRequest::command(command),
                },
                _ => return Err(self.missing("command")),
            },
        };
        Ok(request)
    }

    fn path_field(&self, value: Option<&str>, field: &'static str) -> Result<String, HookError> {
        let value = value.filter(|v| !v.trim().is_empty()).ok_or_else(|| self.missing(field))?;
        Ok(self.absolutize(value))
    }

    /// Relative paths are relative to the host's working directory.
    fn absolutize(&self, path: &str) -> String {
        match self.working_dir() {
            Some(cwd) if Path::new(path).is_relative() => cwd.join(path).to_string_lossy().into_owned(),
            _ => path.to_string(),
        }
    }

    fn missing(&self, field: &'static str) -> HookError {
        HookError::MissingField {
            tool: self.tool_name.clone(),
            field,
        }
    }
}
