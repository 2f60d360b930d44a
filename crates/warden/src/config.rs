//! Project configuration and on-disk layout.
//!
//! A project is any directory containing `.warden/config.toml`:
//!
//! ```toml
//! [project]
//! name = "shop"
//! workspace_dir = "workspace"
//! off_limits_doc = "OFF-LIMITS.md"
//!
//! [[agents]]
//! name = "agent-1"
//! human = "alice"
//!
//! [roles.tester]
//! allow = ["tests/**", "qa/**"]
//!
//! [guard]
//! off_limits_blocks_reads = true
//! audit = true
//! ```
//!
//! Every section is optional.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::policy::{RoleTable, normalize_path};
use crate::state::Role;

/// Name of the state directory at the project root.
pub const STATE_DIR: &str = ".warden";

/// Name of the configuration file inside [`STATE_DIR`].
pub const CONFIG_FILE: &str = "config.toml";

/// Errors from loading or saving configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// No project was found above the start directory
    #[error("no warden project found at or above {0} (run `warden init`)")]
    NotFound(PathBuf),
    /// Reading or writing the file failed
    #[error("failed to access {path}: {source}")]
    Io {
        /// File path
        path: PathBuf,
        /// Underlying error
        #[source]
        source: io::Error,
    },
    /// The file is not valid TOML for this schema
    #[error("invalid configuration in {path}: {source}")]
    Parse {
        /// File path
        path: PathBuf,
        /// Parser error
        #[source]
        source: toml::de::Error,
    },
    /// The configuration could not be serialized
    #[error("failed to serialize configuration: {0}")]
    Serialize(#[from] toml::ser::Error),
}

/// `[project]` section.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectSection {
    /// Display name
    #[serde(default)]
    pub name: String,
    /// Shared agent workspace, relative to the project root
    #[serde(default = "default_workspace_dir")]
    pub workspace_dir: String,
    /// Off-limits document, relative to the project root
    #[serde(default = "default_off_limits_doc")]
    pub off_limits_doc: String,
}

fn default_workspace_dir() -> String {
    "workspace".into()
}

fn default_off_limits_doc() -> String {
    "OFF-LIMITS.md".into()
}

impl Default for ProjectSection {
    fn default() -> Self {
        Self {
            name: String::new(),
            workspace_dir: default_workspace_dir(),
            off_limits_doc: default_off_limits_doc(),
        }
    }
}

/// One `[[agents]]` entry: a pool agent and its human.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolAgent {
    /// Agent name
    pub name: String,
    /// Responsible human
    #[serde(default)]
    pub human: String,
}

/// `[roles.<role>]` overrides of the built-in role table.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleOverride {
    /// Replaces the built-in allow patterns
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allow: Option<Vec<String>>,
    /// Added to the built-in deny patterns
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deny: Option<Vec<String>>,
    /// Replaces the template path
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<String>,
}

/// `[guard]` section.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuardSettings {
    /// Off-limits patterns also block reads
    #[serde(default = "bool_true")]
    pub off_limits_blocks_reads: bool,
    /// Append every decision to `.warden/audit.jsonl`
    #[serde(default = "bool_true")]
    pub audit: bool,
}

fn bool_true() -> bool {
    true
}

impl Default for GuardSettings {
    fn default() -> Self {
        Self {
            off_limits_blocks_reads: true,
            audit: true,
        }
    }
}

/// Contents of `.warden/config.toml`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectConfig {
    /// `[project]`
    #[serde(default)]
    pub project: ProjectSection,
    /// `[[agents]]`
    #[serde(default)]
    pub agents: Vec<PoolAgent>,
    /// `[roles.<role>]`
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub roles: BTreeMap<Role, RoleOverride>,
    /// `[guard]`
    #[serde(default)]
    pub guard: GuardSettings,
}

impl ProjectConfig {
    /// Load a configuration file.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Write the configuration file, creating its directory.
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|source| ConfigError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        fs::write(path, content).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    /// The configured pool agent named `name`.
    pub fn pool_agent(&self, name: &str) -> Option<&PoolAgent> {
        self.agents.iter().find(|a| a.name == name)
    }

    /// The role table with this configuration's overrides applied.
    ///
    /// The off-limits document is denied to every role.
    pub fn role_table(&self) -> RoleTable {
        RoleTable::defaults(&self.project.workspace_dir)
            .deny_everywhere(&glob::Pattern::escape(&self.project.off_limits_doc))
            .with_overrides(&self.roles)
    }
}

/// Well-known paths of a project.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProjectLayout {
    root: PathBuf,
}

impl ProjectLayout {
    /// Layout rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Find the nearest directory at or above `start` that holds a
    /// configuration file.
    pub fn discover(start: &Path) -> Result<Self, ConfigError> {
        start
            .ancestors()
            .find(|dir| dir.join(STATE_DIR).join(CONFIG_FILE).is_file())
            .map(Self::new)
            .ok_or_else(|| ConfigError::NotFound(start.to_path_buf()))
    }

    /// Project root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `.warden/`
    pub fn state_dir(&self) -> PathBuf {
        self.root.join(STATE_DIR)
    }

    /// `.warden/config.toml`
    pub fn config_path(&self) -> PathBuf {
        self.state_dir().join(CONFIG_FILE)
    }

    /// `.warden/audit.jsonl`
    pub fn audit_path(&self) -> PathBuf {
        self.state_dir().join("audit.jsonl")
    }

    /// `.warden/roles/`
    pub fn roles_dir(&self) -> PathBuf {
        self.state_dir().join("roles")
    }

    /// Absolute path of the off-limits document.
    pub fn off_limits_path(&self, config: &ProjectConfig) -> PathBuf {
        self.root.join(&config.project.off_limits_doc)
    }

    /// Absolute path of the shared workspace.
    pub fn workspace_path(&self, config: &ProjectConfig) -> PathBuf {
        self.root.join(&config.project.workspace_dir)
    }

    /// Absolute path of an agent's folder in the workspace.
    pub fn agent_dir(&self, config: &ProjectConfig, agent: &str) -> PathBuf {
        self.workspace_path(config).join("agents").join(agent)
    }

    /// Resolve a project-relative path to an absolute one.
    pub fn resolve(&self, relative: &str) -> PathBuf {
        self.root.join(relative)
    }

    /// Project-relative, normalized form of `path`.
    pub fn relative(&self, path: &str) -> String {
        normalize_path(path, Some(&self.root))
    }

    /// Load the project's configuration.
    pub fn load_config(&self) -> Result<ProjectConfig, ConfigError> {
        ProjectConfig::load_from(&self.config_path())
    }
}
