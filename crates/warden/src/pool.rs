//! Managing the pool of agent identities.
//!
//! [`AgentPool`] is what the management commands drive: scaffolding a
//! project, adding and removing agents, claiming and releasing them,
//! assigning roles and reporting on the whole pool.

use std::collections::BTreeSet;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::audit::{AuditEvent, AuditKind, AuditSink, JsonlAuditLog, NullAuditSink};
use crate::config::{ConfigError, PoolAgent, ProjectConfig, ProjectLayout};
use crate::identity::{ClaimError, IdentityResolver, IdentitySource, SessionHint};
use crate::must_read::required_files;
use crate::policy::{OffLimitsPolicy, RoleTable, SelfReviewError, can_take_role};
use crate::state::{
    AgentSession, AgentState, FsStateStore, Role, SessionOwner, StateStore, StoreError,
    validate_agent_name,
};

/// Errors from pool management.
#[derive(Debug, Error)]
pub enum PoolError {
    /// State storage failed
    #[error(transparent)]
    Store(#[from] StoreError),
    /// Configuration failed to load or save
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// The agent could not be claimed
    #[error(transparent)]
    Claim(#[from] ClaimError),
    /// The role would mean reviewing one's own code
    #[error(transparent)]
    SelfReview(#[from] SelfReviewError),
    /// No such agent in the pool
    #[error("unknown agent '{0}'")]
    UnknownAgent(String),
    /// The agent already exists
    #[error("agent '{0}' already exists")]
    AgentExists(String),
    /// The agent is claimed and cannot be removed
    #[error("agent '{0}' is claimed; release it first")]
    AgentClaimed(String),
    /// `init` found an existing project
    #[error("project already initialized at {0} (use --force to overwrite)")]
    AlreadyInitialized(PathBuf),
    /// A scaffold file could not be written
    #[error("failed to write {path}: {source}")]
    Io {
        /// File path
        path: PathBuf,
        /// Underlying error
        #[source]
        source: io::Error,
    },
}

/// Options for [`init`].
#[derive(Clone, Debug)]
pub struct InitOptions {
    /// Number of pool agents
    pub agents: usize,
    /// Human assigned to every agent
    pub human: String,
    /// Project display name
    pub name: String,
    /// Overwrite an existing configuration and scaffold files
    pub force: bool,
}

impl Default for InitOptions {
    fn default() -> Self {
        Self {
            agents: 3,
            human: String::new(),
            name: String::new(),
            force: false,
        }
    }
}

/// Scaffold a project at `root`.
///
/// Writes `.warden/config.toml` with agents `agent-1` … `agent-N`, one
/// template per role under `.warden/roles/`, an `OFF-LIMITS.md`, the
/// workspace guide and each agent's `AGENT.md`. Existing scaffold files are
/// kept unless `force` is set.
pub fn init(root: &Path, options: &InitOptions) -> Result<ProjectLayout, PoolError> {
    let layout = ProjectLayout::new(root);
    let config_path = layout.config_path();
    if config_path.exists() && !options.force {
        return Err(PoolError::AlreadyInitialized(root.to_path_buf()));
    }

    let mut config = ProjectConfig::default();
    config.project.name = if options.name.is_empty() {
        root.file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    } else {
        options.name.clone()
    };
    config.agents = (1..=options.agents)
        .map(|n| PoolAgent {
            name: format!("agent-{}", n),
            human: options.human.clone(),
        })
        .collect();
    config.save_to(&config_path)?;

    for dir in [layout.state_dir().join("agents"), layout.state_dir().join("sessions")] {
        fs::create_dir_all(&dir).map_err(|source| PoolError::Io { path: dir.clone(), source })?;
    }

    let table = config.role_table();
    let w = config.project.workspace_dir.clone();
    for role in Role::ALL {
        let profile = table.profile(role);
        scaffold(&layout.resolve(&profile.template), &role_template(role, &w, &profile.allow), options.force)?;
        scaffold(
            &layout.workspace_path(&config).join("guides").join(format!("{}.md", role)),
            &role_guide(role),
            options.force,
        )?;
    }

    scaffold(&layout.off_limits_path(&config), OFF_LIMITS_TEMPLATE, options.force)?;
    scaffold(&layout.workspace_path(&config).join("GUIDE.md"), &workspace_guide(&w), options.force)?;
    for agent in &config.agents {
        scaffold(
            &layout.agent_dir(&config, &agent.name).join("AGENT.md"),
            &agent_entry(&agent.name, &agent.human, &w),
            options.force,
        )?;
    }
    let tasks = layout.workspace_path(&config).join("tasks");
    fs::create_dir_all(&tasks).map_err(|source| PoolError::Io { path: tasks, source })?;

    tracing::info!(root = %root.display(), agents = options.agents, "project initialized");
    Ok(layout)
}

fn scaffold(path: &Path, content: &str, force: bool) -> Result<(), PoolError> {
    if path.exists() && !force {
        tracing::debug!(path = %path.display(), "keeping existing file");
        return Ok(());
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|source| PoolError::Io {
            path: parent.to_path_buf(),
            source,
        })?;
    }
    fs::write(path, content).map_err(|source| PoolError::Io {
        path: path.to_path_buf(),
        source,
    })
}

const OFF_LIMITS_TEMPLATE: &str = "\
# Off limits

No agent may read, write or delete anything matching these patterns,
whatever its role. Patterns without a `/` match a file name at any depth.

```
# credentials
.env
.env.*
*.pem
*.key
secrets/**
```
";

fn role_summary(role: Role) -> &'static str {
    match role {
        Role::CodeWriter => "Implements the task in source and tests.",
        Role::Reviewer => "Reviews another agent's change and writes findings.",
        Role::Planner => "Breaks requests into tasks and plans.",
        Role::Tester => "Writes and runs tests, and reports results.",
        Role::DocsWriter => "Keeps documentation accurate.",
        Role::CoThinker => "Discusses designs with the human without changing code.",
        Role::Interviewer => "Gathers requirements from the human.",
    }
}

fn role_template(role: Role, workspace: &str, allow: &[String]) -> String {
    let mut doc = format!(
        "# {}\n\n{}\n\n## Must Read\n\n- `{w}/GUIDE.md`\n- `{w}/guides/{role}.md`\n- `{w}/agents/{{self}}/AGENT.md`\n\n## Writable paths\n\n",
        role,
        role_summary(role),
        w = workspace,
        role = role,
    );
    for pattern in allow {
        doc.push_str(&format!("- `{}`\n", pattern));
    }
    doc
}

fn role_guide(role: Role) -> String {
    format!(
        "# Working as {}\n\n{}\n\nRecord progress in your agent folder and keep changes inside your writable paths.\n",
        role,
        role_summary(role)
    )
}

fn workspace_guide(workspace: &str) -> String {
    format!(
        "# Workspace\n\n\
         Every agent works through the same steps:\n\n\
         1. Claim an identity: `warden claim <agent>`.\n\
         2. Read `{w}/agents/<agent>/AGENT.md`.\n\
         3. Take a role for a task: `warden role <role> --task <task>`.\n\
         4. Read everything `warden must-read` lists before the first write.\n\
         5. Release the identity when done: `warden release`.\n",
        w = workspace
    )
}

fn agent_entry(name: &str, human: &str, workspace: &str) -> String {
    let owner = if human.is_empty() { "unassigned" } else { human };
    format!(
        "# {name}\n\nHuman: {owner}\n\nStart with `{w}/GUIDE.md`. Notes and scratch files for this agent live in `{w}/agents/{name}/`.\n",
        name = name,
        owner = owner,
        w = workspace
    )
}

/// One row of `warden status`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AgentReport {
    /// Agent record (a default one if never claimed)
    pub state: AgentState,
    /// Current claim, if any
    pub session: Option<AgentSession>,
    /// Whether the claim's owner process is gone
    pub stale: bool,
    /// Listed in the configuration
    pub configured: bool,
}

/// A problem found by [`AgentPool::check`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConsistencyIssue {
    /// The off-limits document does not exist
    MissingOffLimits(PathBuf),
    /// An off-limits line is not a valid glob
    InvalidOffLimitsPattern {
        /// Line number
        line: usize,
        /// Line text
        glob: String,
        /// Parser message
        reason: String,
    },
    /// A role template does not exist
    MissingTemplate {
        /// Role
        role: Role,
        /// Expected path
        path: String,
    },
    /// A claim whose owner process has exited
    StaleSession {
        /// Agent
        agent: String,
        /// Former owner
        pid: Option<u32>,
    },
    /// A session for an agent that is not in the pool
    OrphanSession {
        /// Agent
        agent: String,
    },
    /// A state document for an agent missing from the configuration
    UnlistedAgent {
        /// Agent
        agent: String,
    },
    /// The same agent is listed twice in the configuration
    DuplicateAgent {
        /// Agent
        agent: String,
    },
    /// The agent is working but has no task
    RoleWithoutTask {
        /// Agent
        agent: String,
    },
    /// State documents could not be read
    UnreadableState(String),
}

impl fmt::Display for ConsistencyIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConsistencyIssue::MissingOffLimits(path) => {
                write!(f, "off-limits document {} is missing; no paths are off limits", path.display())
            }
            ConsistencyIssue::InvalidOffLimitsPattern { line, glob, reason } => {
                write!(f, "off-limits line {}: `{}` is not a valid pattern ({})", line, glob, reason)
            }
            ConsistencyIssue::MissingTemplate { role, path } => {
                write!(f, "role '{}' has no template at {}; it will have no must-reads", role, path)
            }
            ConsistencyIssue::StaleSession { agent, pid } => match pid {
                Some(pid) => write!(f, "agent '{}' is claimed by pid {}, which is no longer running", agent, pid),
                None => write!(f, "agent '{}' has a stale claim", agent),
            },
            ConsistencyIssue::OrphanSession { agent } => {
                write!(f, "session exists for unknown agent '{}'", agent)
            }
            ConsistencyIssue::UnlistedAgent { agent } => {
                write!(f, "agent '{}' has state but is not listed in config.toml", agent)
            }
            ConsistencyIssue::DuplicateAgent { agent } => {
                write!(f, "agent '{}' is listed more than once in config.toml", agent)
            }
            ConsistencyIssue::RoleWithoutTask { agent } => {
                write!(f, "agent '{}' has a role but no task", agent)
            }
            ConsistencyIssue::UnreadableState(err) => write!(f, "agent state is unreadable: {}", err),
        }
    }
}

/// The agent pool of one project.
pub struct AgentPool<S, I> {
    layout: ProjectLayout,
    config: ProjectConfig,
    table: RoleTable,
    store: S,
    identity: I,
    audit: Box<dyn AuditSink>,
}

impl<S, I> fmt::Debug for AgentPool<S, I> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentPool")
            .field("layout", &self.layout)
            .field("agents", &self.config.agents.len())
            .finish_non_exhaustive()
    }
}

impl<I: IdentitySource> AgentPool<FsStateStore, I> {
    /// Open the pool of a project on disk.
    pub fn open(layout: ProjectLayout, identity: I) -> Result<Self, PoolError> {
        let config = layout.load_config()?;
        let store = FsStateStore::new(layout.state_dir());
        Ok(Self::new(layout, config, store, identity))
    }
}

impl<S: StateStore, I: IdentitySource> AgentPool<S, I> {
    /// Create a pool over an explicit store.
    pub fn new(layout: ProjectLayout, config: ProjectConfig, store: S, identity: I) -> Self {
        let audit: Box<dyn AuditSink> = if config.guard.audit {
            Box::new(JsonlAuditLog::new(layout.audit_path()))
        } else {
            Box::new(NullAuditSink)
        };
        Self {
            table: config.role_table(),
            layout,
            config,
            store,
            identity,
            audit,
        }
    }

    /// Replace the audit sink.
    pub fn with_audit(mut self, audit: impl AuditSink + 'static) -> Self {
        self.audit = Box::new(audit);
        self
    }

    /// The project layout.
    pub fn layout(&self) -> &ProjectLayout {
        &self.layout
    }

    /// The loaded configuration.
    pub fn config(&self) -> &ProjectConfig {
        &self.config
    }

    /// The state store.
    pub fn store(&self) -> &S {
        &self.store
    }

    fn resolver(&self) -> IdentityResolver<'_, S, I> {
        IdentityResolver::new(&self.store, &self.identity)
    }

    fn record(&self, event: AuditEvent) {
        if let Err(e) = self.audit.record(&event) {
            tracing::warn!(error = %e, "failed to write audit event");
        }
    }

    /// Whether `name` is a pool agent (configured or with state).
    pub fn is_known(&self, name: &str) -> Result<bool, PoolError> {
        Ok(self.config.pool_agent(name).is_some() || self.store.load_agent(name)?.is_some())
    }

    /// Load an agent, creating its record if it is configured but new.
    fn load_or_create(&self, name: &str) -> Result<AgentState, PoolError> {
        if let Some(state) = self.store.load_agent(name)? {
            return Ok(state);
        }
        let Some(agent) = self.config.pool_agent(name) else {
            return Err(PoolError::UnknownAgent(name.to_string()));
        };
        let state = AgentState::new(name, agent.human.clone());
        self.store.save_agent(&state)?;
        Ok(state)
    }

    /// Add an agent to the configuration and create its record.
    pub fn new_agent(&mut self, name: &str, human: &str) -> Result<AgentState, PoolError> {
        validate_agent_name(name)?;
        if self.is_known(name)? {
            return Err(PoolError::AgentExists(name.to_string()));
        }

        self.config.agents.push(PoolAgent {
            name: name.to_string(),
            human: human.to_string(),
        });
        self.config.save_to(&self.layout.config_path())?;

        let state = AgentState::new(name, human);
        self.store.save_agent(&state)?;
        scaffold(
            &self.layout.agent_dir(&self.config, name).join("AGENT.md"),
            &agent_entry(name, human, &self.config.project.workspace_dir),
            false,
        )?;
        tracing::info!(agent = %name, "agent added");
        Ok(state)
    }

    /// Remove an unclaimed agent from the configuration and delete its
    /// record. Its workspace folder is kept.
    pub fn remove_agent(&mut self, name: &str) -> Result<(), PoolError> {
        if !self.is_known(name)? {
            return Err(PoolError::UnknownAgent(name.to_string()));
        }
        if self.store.load_session(name)?.is_some() {
            return Err(PoolError::AgentClaimed(name.to_string()));
        }

        let before = self.config.agents.len();
        self.config.agents.retain(|a| a.name != name);
        if self.config.agents.len() != before {
            self.config.save_to(&self.layout.config_path())?;
        }
        self.store.remove_agent(name)?;
        tracing::info!(agent = %name, "agent removed");
        Ok(())
    }

    /// Claim `name` for `owner`, creating its record on first claim.
    pub fn claim(&self, name: &str, owner: &SessionOwner) -> Result<AgentSession, PoolError> {
        validate_agent_name(name)?;
        if !self.is_known(name)? {
            return Err(PoolError::UnknownAgent(name.to_string()));
        }
        let result = self.resolver().claim(name, owner);
        let event = AuditEvent::new(AuditKind::Claim, "claim", name).agent(Some(name));
        match result {
            Ok(session) => {
                self.load_or_create(name)?;
                self.record(event);
                Ok(session)
            }
            Err(e) => {
                self.record(event.blocked(e.to_string()));
                Err(e.into())
            }
        }
    }

    /// The owner a claim made by the caller would record.
    pub fn current_owner(&self, hint: &SessionHint) -> SessionOwner {
        self.resolver().current_owner(hint)
    }

    /// The agent the caller holds, if any.
    pub fn current_agent(&self, hint: &SessionHint) -> Option<String> {
        self.resolver().resolve(hint)
    }

    /// Release `name`. Returns false if it was not claimed.
    pub fn release(&self, name: &str) -> Result<bool, PoolError> {
        let released = self.resolver().release(name)?;
        if released {
            self.record(AuditEvent::new(AuditKind::Release, "release", name).agent(Some(name)));
        }
        Ok(released)
    }

    /// Give `name` a role on `task`.
    ///
    /// Refuses a reviewer role on a task the agent wrote code for. Records
    /// the role in the task history, stores the role's write patterns and
    /// loads the role template's must-read list.
    pub fn assign_role(&self, name: &str, role: Role, task: &str) -> Result<AgentState, PoolError> {
        let mut state = self.load_or_create(name)?;
        if let Err(e) = can_take_role(&state.task_role_history, role, task) {
            self.record(
                AuditEvent::new(AuditKind::RoleAssigned, role.as_str(), task)
                    .agent(Some(name))
                    .blocked(e.to_string()),
            );
            return Err(e.into());
        }

        let profile = self.table.profile(role);
        let template_path = self.layout.resolve(&profile.template);
        let must_reads = match fs::read_to_string(&template_path) {
            Ok(template) => required_files(&template, name, task, Some(self.layout.root())),
            Err(e) => {
                tracing::warn!(
                    role = %role,
                    path = %template_path.display(),
                    error = %e,
                    "role template unreadable; no must-reads assigned"
                );
                Vec::new()
            }
        };

        state.role = Some(role);
        state.task = Some(task.to_string());
        state.record_role(task, role);
        state.allowed_path_patterns = profile.allow;
        state.denied_path_patterns = profile.deny;
        state.unread_must_reads = must_reads;
        self.store.save_agent(&state)?;

        tracing::info!(
            agent = %name,
            role = %role,
            task = %task,
            must_reads = state.unread_must_reads.len(),
            "role assigned"
        );
        self.record(AuditEvent::new(AuditKind::RoleAssigned, role.as_str(), task).agent(Some(name)));
        Ok(state)
    }

    /// Drop the agent's role. The task history is kept.
    pub fn clear_role(&self, name: &str) -> Result<AgentState, PoolError> {
        let mut state = self
            .store
            .load_agent(name)?
            .ok_or_else(|| PoolError::UnknownAgent(name.to_string()))?;
        let previous = state.role;
        state.role = None;
        state.task = None;
        state.allowed_path_patterns.clear();
        state.denied_path_patterns.clear();
        state.unread_must_reads.clear();
        self.store.save_agent(&state)?;

        let action = previous.map_or("none", |r| r.as_str());
        self.record(AuditEvent::new(AuditKind::RoleCleared, action, "").agent(Some(name)));
        Ok(state)
    }

    /// The caller's agent record.
    pub fn whoami(&self, hint: &SessionHint) -> Result<Option<AgentState>, PoolError> {
        let Some(name) = self.current_agent(hint) else {
            return Ok(None);
        };
        Ok(Some(
            self.store
                .load_agent(&name)?
                .unwrap_or_else(|| AgentState::new(name, "")),
        ))
    }

    /// Every agent in the configuration or with a record, sorted by name.
    pub fn status(&self) -> Result<Vec<AgentReport>, PoolError> {
        let states = self.store.list_agents()?;
        let sessions = self.store.list_sessions()?;

        let mut names: BTreeSet<String> = self.config.agents.iter().map(|a| a.name.clone()).collect();
        names.extend(states.iter().map(|s| s.name.clone()));

        Ok(names
            .into_iter()
            .map(|name| {
                let configured = self.config.pool_agent(&name);
                let state = states.iter().find(|s| s.name == name).cloned().unwrap_or_else(|| {
                    AgentState::new(name.as_str(), configured.map(|a| a.human.clone()).unwrap_or_default())
                });
                let session = sessions.iter().find(|s| s.agent == name).cloned();
                let stale = session
                    .as_ref()
                    .and_then(|s| s.owner_pid)
                    .is_some_and(|pid| !self.identity.is_alive(pid));
                AgentReport {
                    state,
                    session,
                    stale,
                    configured: configured.is_some(),
                }
            })
            .collect())
    }

    /// Look for configuration and state problems.
    pub fn check(&self) -> Result<Vec<ConsistencyIssue>, PoolError> {
        let mut issues = Vec::new();

        let off_limits_path = self.layout.off_limits_path(&self.config);
        if off_limits_path.exists() {
            let policy = OffLimitsPolicy::load(&off_limits_path).map_err(|source| PoolError::Io {
                path: off_limits_path.clone(),
                source,
            })?;
            issues.extend(policy.invalid_patterns().iter().map(|p| {
                ConsistencyIssue::InvalidOffLimitsPattern {
                    line: p.line,
                    glob: p.glob.clone(),
                    reason: p.reason.clone(),
                }
            }));
        } else {
            issues.push(ConsistencyIssue::MissingOffLimits(off_limits_path));
        }

        for role in Role::ALL {
            let template = self.table.profile(role).template;
            if !self.layout.resolve(&template).is_file() {
                issues.push(ConsistencyIssue::MissingTemplate { role, path: template });
            }
        }

        let mut seen = BTreeSet::new();
        for agent in &self.config.agents {
            if !seen.insert(agent.name.as_str()) {
                issues.push(ConsistencyIssue::DuplicateAgent {
                    agent: agent.name.clone(),
                });
            }
        }

        match self.store.list_agents() {
            Ok(states) => {
                for state in &states {
                    if self.config.pool_agent(&state.name).is_none() {
                        issues.push(ConsistencyIssue::UnlistedAgent {
                            agent: state.name.clone(),
                        });
                    }
                    if state.role.is_some() && state.task.is_none() {
                        issues.push(ConsistencyIssue::RoleWithoutTask {
                            agent: state.name.clone(),
                        });
                    }
                }
            }
            Err(e) => issues.push(ConsistencyIssue::UnreadableState(e.to_string())),
        }

        for session in self.store.list_sessions()? {
            if !self.is_known(&session.agent).unwrap_or(true) {
                issues.push(ConsistencyIssue::OrphanSession {
                    agent: session.agent.clone(),
                });
            }
        }
        for session in self.resolver().stale_sessions()? {
            issues.push(ConsistencyIssue::StaleSession {
                agent: session.agent,
                pid: session.owner_pid,
            });
        }

        Ok(issues)
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::identity::FixedIdentitySource;

    fn project(agents: usize) -> (tempfile::TempDir, AgentPool<FsStateStore, FixedIdentitySource>) {
        let dir = tempfile::tempdir().unwrap();
        let layout = init(
            dir.path(),
            &InitOptions {
                agents,
                human: "alice".into(),
                ..InitOptions::default()
            },
        )
        .unwrap();
        let pool = AgentPool::open(layout, FixedIdentitySource::new([4242])).unwrap();
        (dir, pool)
    }

    #[test]
    fn test_init_scaffolds_project() {
        let (dir, pool) = project(3);
        let root = dir.path();
        assert_eq!(pool.config().agents.len(), 3);
        assert_eq!(pool.config().agents[2].name, "agent-3");
        assert!(root.join("OFF-LIMITS.md").is_file());
        assert!(root.join(".warden/roles/reviewer.md").is_file());
        assert!(root.join("workspace/GUIDE.md").is_file());
        assert!(root.join("workspace/guides/tester.md").is_file());
        assert!(root.join("workspace/agents/agent-2/AGENT.md").is_file());
        assert!(pool.check().unwrap().is_empty());
    }

    #[test]
    fn test_init_refuses_existing_project() {
        let (dir, _pool) = project(1);
        let err = init(dir.path(), &InitOptions::default()).unwrap_err();
        assert!(matches!(err, PoolError::AlreadyInitialized(_)));

        let forced = InitOptions {
            force: true,
            agents: 5,
            ..InitOptions::default()
        };
        let layout = init(dir.path(), &forced).unwrap();
        assert_eq!(layout.load_config().unwrap().agents.len(), 5);
    }

    #[test]
    fn test_claim_creates_state_and_blocks_second_agent() {
        let (_dir, pool) = project(3);
        let owner = SessionOwner::process(4242);

        pool.claim("agent-1", &owner).unwrap();
        let state = pool.store().load_agent("agent-1").unwrap().unwrap();
        assert_eq!(state.assigned_human, "alice");

        let err = pool.claim("agent-2", &owner).unwrap_err();
        assert!(matches!(err, PoolError::Claim(ClaimError::AlreadyClaimed { .. })));

        assert!(matches!(
            pool.claim("agent-99", &owner),
            Err(PoolError::UnknownAgent(_))
        ));
        assert_eq!(pool.current_agent(&SessionHint::ProcessTree).as_deref(), Some("agent-1"));
    }

    #[test]
    fn test_assign_role_loads_must_reads() {
        let (_dir, pool) = project(3);
        let state = pool.assign_role("agent-1", Role::Reviewer, "T1").unwrap();
        assert_eq!(state.role, Some(Role::Reviewer));
        assert_eq!(state.task.as_deref(), Some("T1"));
        assert_eq!(
            state.unread_must_reads,
            vec![
                "workspace/GUIDE.md",
                "workspace/guides/reviewer.md",
                "workspace/agents/agent-1/AGENT.md",
            ]
        );
        assert!(state.allowed_path_patterns.contains(&"src/**".to_string()));
        assert_eq!(state.roles_on("T1"), &[Role::Reviewer]);
    }

    #[test]
    fn test_self_review_is_refused() {
        let (_dir, pool) = project(2);
        pool.assign_role("agent-1", Role::CodeWriter, "T1").unwrap();
        pool.clear_role("agent-1").unwrap();

        let err = pool.assign_role("agent-1", Role::Reviewer, "T1").unwrap_err();
        assert!(err.to_string().contains("code-writer"));
        assert!(pool.assign_role("agent-1", Role::Reviewer, "T2").is_ok());
        assert!(pool.assign_role("agent-2", Role::Reviewer, "T1").is_ok());
    }

    #[test]
    fn test_clear_role_keeps_history() {
        let (_dir, pool) = project(1);
        pool.assign_role("agent-1", Role::Planner, "T1").unwrap();
        let state = pool.clear_role("agent-1").unwrap();
        assert!(state.role.is_none());
        assert!(state.unread_must_reads.is_empty());
        assert_eq!(state.roles_on("T1"), &[Role::Planner]);
    }

    #[test]
    fn test_new_and_remove_agent() {
        let (dir, mut pool) = project(1);
        pool.new_agent("reviewer-bot", "bob").unwrap();
        assert!(dir.path().join("workspace/agents/reviewer-bot/AGENT.md").is_file());
        assert!(matches!(
            pool.new_agent("reviewer-bot", "bob"),
            Err(PoolError::AgentExists(_))
        ));
        assert!(matches!(pool.new_agent("bad name", ""), Err(PoolError::Store(_))));

        pool.claim("reviewer-bot", &SessionOwner::session("s")).unwrap();
        assert!(matches!(
            pool.remove_agent("reviewer-bot"),
            Err(PoolError::AgentClaimed(_))
        ));
        pool.release("reviewer-bot").unwrap();
        pool.remove_agent("reviewer-bot").unwrap();
        assert!(pool.config().pool_agent("reviewer-bot").is_none());
        assert!(pool.store().load_agent("reviewer-bot").unwrap().is_none());
    }

    #[test]
    fn test_status_reports_every_agent() {
        let (_dir, pool) = project(2);
        pool.claim("agent-2", &SessionOwner::process(4242)).unwrap();
        let report = pool.status().unwrap();
        assert_eq!(report.len(), 2);
        assert!(report[0].session.is_none());
        assert!(report[1].session.is_some());
        assert!(!report[1].stale);
    }

    #[test]
    fn test_check_reports_problems() {
        let dir = tempfile::tempdir().unwrap();
        let layout = init(dir.path(), &InitOptions::default()).unwrap();
        fs::write(dir.path().join("OFF-LIMITS.md"), "```\nsrc/[bad\n```\n").unwrap();
        fs::remove_file(dir.path().join(".warden/roles/tester.md")).unwrap();

        let identity = FixedIdentitySource::new([1]).with_dead(999);
        let pool = AgentPool::open(layout, identity).unwrap();
        pool.claim("agent-1", &SessionOwner::process(999)).unwrap();
        pool.store().save_agent(&AgentState::new("ghost", "")).unwrap();

        let issues = pool.check().unwrap();
        assert!(issues.iter().any(|i| matches!(i, ConsistencyIssue::InvalidOffLimitsPattern { line: 2, .. })));
        assert!(issues.iter().any(|i| matches!(i, ConsistencyIssue::MissingTemplate { role: Role::Tester, .. })));
        assert!(issues.iter().any(|i| matches!(i, ConsistencyIssue::StaleSession { pid: Some(999), .. })));
        assert!(issues.iter().any(|i| matches!(i, ConsistencyIssue::UnlistedAgent { agent } if agent == "ghost")));

        // Stale sessions are reported, not cleared.
        assert!(pool.store().load_session("agent-1").unwrap().is_some());
    }
}
