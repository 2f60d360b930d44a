//! Per-agent state and claim sessions.
//!
//! Every pool agent has one [`AgentState`] record and, while a process holds
//! it, one [`AgentSession`] record. Both live behind the [`StateStore`] trait:
//! [`FsStateStore`] keeps them as JSON documents under `.warden/`, and
//! [`MemoryStateStore`] keeps them in memory for tests.
//!
//! ```text
//! .warden/
//! ├── agents/<name>.json     - AgentState (role, task, history, must-reads)
//! └── sessions/<name>.json   - AgentSession (who holds the agent)
//! ```

mod memory;
mod store;

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use memory::MemoryStateStore;
pub use store::{FsStateStore, StateStore, StoreError, validate_agent_name};

/// A named permission profile.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Role {
    /// Implements changes in source and tests
    CodeWriter,
    /// Reviews another agent's work
    Reviewer,
    /// Breaks work into tasks
    Planner,
    /// Writes and runs tests
    Tester,
    /// Maintains documentation
    DocsWriter,
    /// Discusses designs without changing code
    CoThinker,
    /// Gathers requirements from the human
    Interviewer,
}

impl Role {
    /// All roles, in declaration order.
    pub const ALL: [Role; 7] = [
        Role::CodeWriter,
        Role::Reviewer,
        Role::Planner,
        Role::Tester,
        Role::DocsWriter,
        Role::CoThinker,
        Role::Interviewer,
    ];

    /// Kebab-case role name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::CodeWriter => "code-writer",
            Role::Reviewer => "reviewer",
            Role::Planner => "planner",
            Role::Tester => "tester",
            Role::DocsWriter => "docs-writer",
            Role::CoThinker => "co-thinker",
            Role::Interviewer => "interviewer",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when a role name is not recognized.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown role '{0}' (expected one of: code-writer, reviewer, planner, tester, docs-writer, co-thinker, interviewer)")]
pub struct ParseRoleError(pub String);

impl FromStr for Role {
    type Err = ParseRoleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase().replace('_', "-");
        Role::ALL
            .into_iter()
            .find(|role| role.as_str() == wanted)
            .ok_or_else(|| ParseRoleError(s.to_string()))
    }
}

/// Whether an agent is currently working on something.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    /// No role assigned
    Free,
    /// A role is assigned
    Working,
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            AgentStatus::Free => "free",
            AgentStatus::Working => "working",
        })
    }
}

/// Roles held per task, in the order they were taken.
pub type TaskRoleHistory = BTreeMap<String, Vec<Role>>;

/// Persistent record for one pool agent.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentState {
    /// Unique agent name
    pub name: String,
    /// Current role, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<Role>,
    /// Task the current role was taken for
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task: Option<String>,
    /// Human responsible for this agent
    #[serde(default)]
    pub assigned_human: String,
    /// Globs the agent may write; `{self}` is the agent name
    #[serde(default)]
    pub allowed_path_patterns: Vec<String>,
    /// Globs the agent may never write
    #[serde(default)]
    pub denied_path_patterns: Vec<String>,
    /// Every role ever held, per task
    #[serde(default)]
    pub task_role_history: TaskRoleHistory,
    /// Mandatory files not yet read
    #[serde(default)]
    pub unread_must_reads: Vec<String>,
}

impl AgentState {
    /// Create a free agent with no history.
    pub fn new(name: impl Into<String>, assigned_human: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            role: None,
            task: None,
            assigned_human: assigned_human.into(),
            allowed_path_patterns: Vec::new(),
            denied_path_patterns: Vec::new(),
            task_role_history: TaskRoleHistory::new(),
            unread_must_reads: Vec::new(),
        }
    }

    /// Status derived from the role.
    pub fn status(&self) -> AgentStatus {
        if self.role.is_some() {
            AgentStatus::Working
        } else {
            AgentStatus::Free
        }
    }

    /// Roles this agent has held on `task`.
    pub fn roles_on(&self, task: &str) -> &[Role] {
        self.task_role_history
            .get(task)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Append `role` to the task history unless it is already listed.
    pub fn record_role(&mut self, task: &str, role: Role) {
        let roles = self.task_role_history.entry(task.to_string()).or_default();
        if !roles.contains(&role) {
            roles.push(role);
        }
    }
}

/// Identifies the process (or hook session) that claims an agent.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SessionOwner {
    /// Session id supplied by the hook host
    pub session_id: Option<String>,
    /// Long-lived process that owns the claim
    pub pid: Option<u32>,
}

impl SessionOwner {
    /// Owner identified by a hook session id.
    pub fn session(id: impl Into<String>) -> Self {
        Self {
            session_id: Some(id.into()),
            pid: None,
        }
    }

    /// Owner identified by a process id.
    pub fn process(pid: u32) -> Self {
        Self {
            session_id: None,
            pid: Some(pid),
        }
    }
}

impl fmt::Display for SessionOwner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.session_id, self.pid) {
            (Some(id), Some(pid)) => write!(f, "session {} (pid {})", id, pid),
            (Some(id), None) => write!(f, "session {}", id),
            (None, Some(pid)) => write!(f, "pid {}", pid),
            (None, None) => f.write_str("unknown owner"),
        }
    }
}

/// Ephemeral claim record: which owner currently holds an agent.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentSession {
    /// Claimed agent name
    pub agent: String,
    /// Hook session id, when claimed from a hook session
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// Owner process id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_pid: Option<u32>,
    /// When the claim was made
    pub claimed_at: DateTime<Utc>,
}

impl AgentSession {
    /// Create a session for `agent` held by `owner`.
    pub fn new(agent: impl Into<String>, owner: &SessionOwner) -> Self {
        Self {
            agent: agent.into(),
            session_id: owner.session_id.clone(),
            owner_pid: owner.pid,
            claimed_at: Utc::now(),
        }
    }

    /// The owner recorded in this session.
    pub fn owner(&self) -> SessionOwner {
        SessionOwner {
            session_id: self.session_id.clone(),
            pid: self.owner_pid,
        }
    }

    /// Whether `owner` is the holder of this session.
    ///
    /// Session ids are compared when both sides have one; otherwise the
    /// owner PIDs are compared.
    pub fn is_owned_by(&self, owner: &SessionOwner) -> bool {
        match (&self.session_id, &owner.session_id) {
            (Some(mine), Some(theirs)) => mine == theirs,
            _ => matches!((self.owner_pid, owner.pid), (Some(a), Some(b)) if a == b),
        }
    }
}
