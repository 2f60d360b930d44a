//! Staged, role-based access control.
//!
//! What a caller may touch depends on how far it has got in its workflow:
//!
//! - [`IdentityStage::NoIdentity`]: only bootstrap files can be read.
//! - [`IdentityStage::IdentityNoRole`]: bootstrap files, the agent's own
//!   folder and the role templates can be read. Nothing can be written.
//! - [`IdentityStage::IdentityWithRole`]: everything can be read; writes are
//!   limited to the role's allow patterns minus its deny patterns.
//!
//! Program invocations ([`OperationKind::Execute`]) are not gated once a
//! role is held. Before that only [`BOOTSTRAP_PROGRAMS`] may run; any other
//! program is treated as an unclassified, mutating operation.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

use super::handler::{BlockReason, BlockRule, FileOperation, OperationKind};
use super::pattern::{PathPattern, normalize_path, substitute_self};
use crate::config::RoleOverride;
use crate::state::{AgentState, Role, TaskRoleHistory};

/// Denied for every role, whatever the configuration says.
pub const ALWAYS_DENIED: &str = ".warden/**";

/// Programs that may run before a role is held.
pub const BOOTSTRAP_PROGRAMS: &[&str] = &[
    "warden", "ls", "dir", "pwd", "whoami", "which", "date", "true", "false", "get-childitem",
    "get-location",
];

/// Where role templates live unless configured otherwise.
pub const ROLE_TEMPLATE_DIR: &str = ".warden/roles";

/// Write permissions and must-read template for one role.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RoleProfile {
    /// Globs the role may write (`{self}` is the agent name)
    pub allow: Vec<String>,
    /// Globs the role may never write
    pub deny: Vec<String>,
    /// Project-relative path of the role template
    pub template: String,
}

/// Built-in role profiles, optionally overridden by configuration.
#[derive(Clone, Debug)]
pub struct RoleTable {
    workspace_dir: String,
    always_denied: Vec<String>,
    profiles: BTreeMap<Role, RoleProfile>,
}

impl RoleTable {
    /// The built-in table for a workspace directory.
    pub fn defaults(workspace_dir: &str) -> Self {
        let w = workspace_dir.trim_matches('/');
        let own = format!("{}/agents/{{self}}/**", w);
        let profiles = Role::ALL
            .into_iter()
            .map(|role| {
                let allow: Vec<String> = match role {
                    Role::CodeWriter => vec![
                        "src/**".into(),
                        "tests/**".into(),
                        own.clone(),
                        format!("{}/tasks/**", w),
                    ],
                    Role::Reviewer => vec![
                        "src/**".into(),
                        "tests/**".into(),
                        own.clone(),
                        format!("{}/reviews/**", w),
                    ],
                    Role::Planner => vec![
                        own.clone(),
                        format!("{}/tasks/**", w),
                        format!("{}/plans/**", w),
                    ],
                    Role::Tester => vec![
                        "tests/**".into(),
                        own.clone(),
                        format!("{}/test-reports/**", w),
                    ],
                    Role::DocsWriter => vec!["docs/**".into(), "*.md".into(), own.clone()],
                    Role::CoThinker => vec![own.clone(), format!("{}/notes/**", w)],
                    Role::Interviewer => vec![own.clone(), format!("{}/interviews/**", w)],
                };
                let profile = RoleProfile {
                    allow,
                    deny: vec![ALWAYS_DENIED.to_string()],
                    template: format!("{}/{}.md", ROLE_TEMPLATE_DIR, role.as_str()),
                };
                (role, profile)
            })
            .collect();

        Self {
            workspace_dir: w.to_string(),
            always_denied: vec![ALWAYS_DENIED.to_string()],
            profiles,
        }
    }

    /// Deny `pattern` to every role, on top of [`ALWAYS_DENIED`].
    ///
    /// Overrides applied later cannot lift it.
    pub fn deny_everywhere(mut self, pattern: &str) -> Self {
        let pattern = pattern.trim();
        if pattern.is_empty() || self.always_denied.iter().any(|p| p == pattern) {
            return self;
        }
        self.always_denied.push(pattern.to_string());
        for profile in self.profiles.values_mut() {
            if !profile.deny.iter().any(|p| p == pattern) {
                profile.deny.push(pattern.to_string());
            }
        }
        self
    }

    /// Apply configured overrides.
    ///
    /// `allow` and `template` replace the built-in values; `deny` adds to
    /// them, so [`ALWAYS_DENIED`] can never be lifted.
    pub fn with_overrides(mut self, overrides: &BTreeMap<Role, RoleOverride>) -> Self {
        for (role, over) in overrides {
            let Some(profile) = self.profiles.get_mut(role) else {
                continue;
            };
            if let Some(allow) = &over.allow {
                profile.allow = allow.clone();
            }
            if let Some(deny) = &over.deny {
                for pattern in deny {
                    if !profile.deny.contains(pattern) {
                        profile.deny.push(pattern.clone());
                    }
                }
            }
            if let Some(template) = &over.template {
                profile.template = template.clone();
            }
        }
        self
    }

    /// Profile for `role`.
    pub fn profile(&self, role: Role) -> RoleProfile {
        self.profiles
            .get(&role)
            .cloned()
            .unwrap_or_else(|| RoleProfile {
                allow: Vec::new(),
                deny: self.always_denied.clone(),
                template: format!("{}/{}.md", ROLE_TEMPLATE_DIR, role.as_str()),
            })
    }

    /// Workspace directory, relative to the project root.
    pub fn workspace_dir(&self) -> &str {
        &self.workspace_dir
    }
}

/// How far the caller has progressed: identity, then role.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum IdentityStage {
    /// No agent is claimed by the caller
    NoIdentity,
    /// An agent is claimed but has no role
    IdentityNoRole {
        /// The claimed agent
        agent: AgentState,
    },
    /// An agent is claimed and working in a role
    IdentityWithRole {
        /// The claimed agent
        agent: AgentState,
        /// Its current role
        role: Role,
    },
}

impl IdentityStage {
    /// Derive the stage from an optional agent record.
    pub fn from_agent(agent: Option<AgentState>) -> Self {
        match agent {
            None => IdentityStage::NoIdentity,
            Some(agent) => match agent.role {
                Some(role) => IdentityStage::IdentityWithRole { agent, role },
                None => IdentityStage::IdentityNoRole { agent },
            },
        }
    }

    /// The claimed agent, if any.
    pub fn agent(&self) -> Option<&AgentState> {
        match self {
            IdentityStage::NoIdentity => None,
            IdentityStage::IdentityNoRole { agent } | IdentityStage::IdentityWithRole { agent, .. } => {
                Some(agent)
            }
        }
    }

    /// Short name used in logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            IdentityStage::NoIdentity => "no-identity",
            IdentityStage::IdentityNoRole { .. } => "identity-no-role",
            IdentityStage::IdentityWithRole { .. } => "identity-with-role",
        }
    }
}

impl fmt::Display for IdentityStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Staged access policy.
#[derive(Clone, Debug)]
pub struct RoleAccessPolicy {
    table: RoleTable,
    project_root: PathBuf,
}

impl RoleAccessPolicy {
    /// Create a policy for a project.
    pub fn new(table: RoleTable, project_root: impl Into<PathBuf>) -> Self {
        Self {
            table,
            project_root: project_root.into(),
        }
    }

    /// The role table in use.
    pub fn table(&self) -> &RoleTable {
        &self.table
    }

    /// Evaluate one operation at the given stage.
    pub fn evaluate(&self, stage: &IdentityStage, op: &FileOperation) -> Result<(), BlockReason> {
        if op.kind == OperationKind::Execute {
            return self.evaluate_program(stage, &op.path);
        }
        let path = normalize_path(&op.path, Some(&self.project_root));
        match stage {
            IdentityStage::NoIdentity => self.evaluate_no_identity(&path, op.kind),
            IdentityStage::IdentityNoRole { agent } => self.evaluate_no_role(agent, &path, op.kind),
            IdentityStage::IdentityWithRole { agent, role } => {
                self.evaluate_with_role(agent, *role, &path, op.kind)
            }
        }
    }

    fn evaluate_program(&self, stage: &IdentityStage, program: &str) -> Result<(), BlockReason> {
        if matches!(stage, IdentityStage::IdentityWithRole { .. })
            || BOOTSTRAP_PROGRAMS.contains(&program_name(program).as_str())
        {
            return Ok(());
        }
        let (rule, holder, next) = match stage {
            IdentityStage::IdentityNoRole { agent } => (
                BlockRule::NoRole,
                format!("agent '{}' has no role", agent.name),
                "run `warden role <role> --task <task>` first",
            ),
            _ => (
                BlockRule::NoIdentity,
                "no agent identity is claimed by this session".to_string(),
                "run `warden claim <agent>` first",
            ),
        };
        Err(BlockReason::new(
            rule,
            format!(
                "{}, so running '{}' is not allowed. Only {} can run; {}",
                holder,
                program,
                BOOTSTRAP_PROGRAMS.join(", "),
                next
            ),
        ))
    }

    fn evaluate_no_identity(&self, path: &str, kind: OperationKind) -> Result<(), BlockReason> {
        if kind.is_read() && self.is_bootstrap(path) {
            return Ok(());
        }
        Err(BlockReason::new(
            BlockRule::NoIdentity,
            format!(
                "no agent identity is claimed by this session, so {} of '{}' is not allowed. \
                 Only bootstrap files can be read; run `warden claim <agent>` first",
                kind, path
            ),
        ))
    }

    fn evaluate_no_role(&self, agent: &AgentState, path: &str, kind: OperationKind) -> Result<(), BlockReason> {
        if kind.is_read() && (self.is_bootstrap(path) || self.is_onboarding(agent, path)) {
            return Ok(());
        }
        let what = if kind.is_read() {
            format!("reading '{}' outside the agent's own files", path)
        } else {
            format!("{} of '{}'", kind, path)
        };
        Err(BlockReason::new(
            BlockRule::NoRole,
            format!(
                "agent '{}' has no role, so {} is not allowed; \
                 run `warden role <role> --task <task>` first",
                agent.name, what
            ),
        ))
    }

    fn evaluate_with_role(
        &self,
        agent: &AgentState,
        role: Role,
        path: &str,
        kind: OperationKind,
    ) -> Result<(), BlockReason> {
        if kind.is_read() {
            return Ok(());
        }

        let profile = self.table.profile(role);

        let mut deny: Vec<&str> = agent.denied_path_patterns.iter().map(String::as_str).collect();
        deny.extend(profile.deny.iter().map(String::as_str));
        for raw in deny {
            let glob = substitute_self(raw, &agent.name);
            match PathPattern::new(&glob) {
                Ok(pattern) if pattern.matches(path) => {
                    return Err(BlockReason::new(
                        BlockRule::RoleWrite,
                        format!(
                            "role '{}' of agent '{}' may not {} '{}': denied by `{}`",
                            role, agent.name, kind, path, glob
                        ),
                    ));
                }
                Ok(_) => {}
                Err(e) => {
                    return Err(BlockReason::new(
                        BlockRule::RoleWrite,
                        format!("deny pattern `{}` of agent '{}' is invalid: {}", glob, agent.name, e),
                    ));
                }
            }
        }

        let allow = if agent.allowed_path_patterns.is_empty() {
            profile.allow
        } else {
            agent.allowed_path_patterns.clone()
        };
        let allowed = allow.iter().any(|raw| {
            let glob = substitute_self(raw, &agent.name);
            match PathPattern::new(&glob) {
                Ok(pattern) => pattern.matches(path),
                Err(e) => {
                    tracing::warn!(agent = %agent.name, pattern = %glob, error = %e, "ignoring invalid allow pattern");
                    false
                }
            }
        });
        if allowed {
            return Ok(());
        }

        let listed: Vec<String> = allow.iter().map(|p| substitute_self(p, &agent.name)).collect();
        Err(BlockReason::new(
            BlockRule::RoleWrite,
            format!(
                "role '{}' of agent '{}' may not {} '{}'; writable paths: {}",
                role,
                agent.name,
                kind,
                path,
                if listed.is_empty() {
                    "none".to_string()
                } else {
                    listed.join(", ")
                }
            ),
        ))
    }

    /// The project root listing, root-level files, workspace root files and
    /// every agent's workflow entry file.
    fn is_bootstrap(&self, path: &str) -> bool {
        if path.starts_with("..") {
            return false;
        }
        if path.is_empty() || !path.contains('/') {
            return true;
        }
        let w = self.table.workspace_dir();
        [format!("{}/*", w), format!("{}/agents/*/AGENT.md", w)]
            .iter()
            .filter_map(|glob| PathPattern::new(glob).ok())
            .any(|p| p.matches(path))
    }

    fn is_onboarding(&self, agent: &AgentState, path: &str) -> bool {
        let w = self.table.workspace_dir();
        [
            format!("{}/agents/{}/**", w, agent.name),
            format!("{}/*", ROLE_TEMPLATE_DIR),
        ]
        .iter()
        .filter_map(|glob| PathPattern::new(glob).ok())
        .any(|p| p.matches(path))
    }
}

/// Refusal to let an agent review a task it wrote code for.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("cannot take role 'reviewer' on task '{task}': this agent already held 'code-writer' on it, and nobody reviews their own code")]
pub struct SelfReviewError {
    /// The task in question
    pub task: String,
}

/// Check whether an agent with `history` may take `role` on `task`.
pub fn can_take_role(history: &TaskRoleHistory, role: Role, task: &str) -> Result<(), SelfReviewError> {
    let wrote_code = history
        .get(task)
        .is_some_and(|roles| roles.contains(&Role::CodeWriter));
    if role == Role::Reviewer && wrote_code {
        return Err(SelfReviewError {
            task: task.to_string(),
        });
    }
    Ok(())
}

/// Lowercased file name of a program, without a Windows extension.
fn program_name(program: &str) -> String {
    let mut name = program.rsplit(['/', '\\']).next().unwrap_or(program).to_ascii_lowercase();
    if let Some(len) = [".exe", ".cmd", ".bat"]
        .iter()
        .find_map(|ext| name.strip_suffix(*ext).map(str::len))
    {
        name.truncate(len);
    }
    name
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn policy() -> RoleAccessPolicy {
        RoleAccessPolicy::new(RoleTable::defaults("workspace"), "/repo")
    }

    fn read(path: &str) -> FileOperation {
        FileOperation::new(path, OperationKind::Read)
    }

    fn write(path: &str) -> FileOperation {
        FileOperation::new(path, OperationKind::Write)
    }

    fn with_role(role: Role) -> IdentityStage {
        let mut agent = AgentState::new("agent-1", "alice");
        agent.role = Some(role);
        agent.task = Some("T1".into());
        IdentityStage::from_agent(Some(agent))
    }

    #[test]
    fn test_no_identity_reads_bootstrap_only() {
        let p = policy();
        let stage = IdentityStage::NoIdentity;
        assert!(p.evaluate(&stage, &read("README.md")).is_ok());
        assert!(p.evaluate(&stage, &read("/repo/AGENTS.md")).is_ok());
        assert!(p.evaluate(&stage, &read("workspace/GUIDE.md")).is_ok());
        assert!(p.evaluate(&stage, &read("workspace/agents/agent-3/AGENT.md")).is_ok());

        let blocked = p.evaluate(&stage, &read("src/main.rs")).unwrap_err();
        assert_eq!(blocked.rule, BlockRule::NoIdentity);
        assert!(blocked.message.contains("warden claim"));
        assert!(p.evaluate(&stage, &read("workspace/agents/agent-3/notes.md")).is_err());
        assert!(p.evaluate(&stage, &write("README.md")).is_err());
    }

    #[test]
    fn test_no_role_reads_own_files_and_templates() {
        let p = policy();
        let stage = IdentityStage::from_agent(Some(AgentState::new("agent-1", "alice")));
        assert!(p.evaluate(&stage, &read("workspace/agents/agent-1/notes/today.md")).is_ok());
        assert!(p.evaluate(&stage, &read(".warden/roles/reviewer.md")).is_ok());
        assert!(p.evaluate(&stage, &read("README.md")).is_ok());

        assert!(p.evaluate(&stage, &read("workspace/agents/agent-2/notes.md")).is_err());
        assert!(p.evaluate(&stage, &read("src/lib.rs")).is_err());

        let blocked = p.evaluate(&stage, &write("workspace/agents/agent-1/x.md")).unwrap_err();
        assert_eq!(blocked.rule, BlockRule::NoRole);
        assert!(blocked.message.contains("warden role"));
    }

    #[test]
    fn test_with_role_reads_everywhere() {
        let p = policy();
        let stage = with_role(Role::Planner);
        assert!(p.evaluate(&stage, &read("src/deep/module.rs")).is_ok());
        assert!(p.evaluate(&stage, &read("workspace/agents/agent-7/notes.md")).is_ok());
    }

    #[test]
    fn test_with_role_writes_follow_table() {
        let p = policy();
        let writer = with_role(Role::CodeWriter);
        assert!(p.evaluate(&writer, &write("src/code.cs")).is_ok());
        assert!(p.evaluate(&writer, &write("workspace/agents/agent-1/log.md")).is_ok());
        assert!(p.evaluate(&writer, &write("docs/guide.md")).is_err());
        assert!(p.evaluate(&writer, &write("workspace/agents/agent-2/log.md")).is_err());

        let docs = with_role(Role::DocsWriter);
        assert!(p.evaluate(&docs, &write("docs/guide.md")).is_ok());
        assert!(p.evaluate(&docs, &write("CHANGELOG.md")).is_ok());
        let blocked = p.evaluate(&docs, &write("src/code.cs")).unwrap_err();
        assert_eq!(blocked.rule, BlockRule::RoleWrite);
        assert!(blocked.message.contains("docs-writer"));
        assert!(blocked.message.contains("src/code.cs"));
    }

    #[test]
    fn test_state_dir_always_denied() {
        let p = policy();
        let mut agent = AgentState::new("agent-1", "");
        agent.role = Some(Role::CodeWriter);
        agent.allowed_path_patterns = vec!["**".into()];
        let stage = IdentityStage::from_agent(Some(agent));

        assert!(p.evaluate(&stage, &write("anything/at/all.txt")).is_ok());
        let blocked = p
            .evaluate(&stage, &write(".warden/agents/agent-1.json"))
            .unwrap_err();
        assert!(blocked.message.contains(".warden/**"));
    }

    #[test]
    fn test_stored_patterns_replace_defaults() {
        let p = policy();
        let mut agent = AgentState::new("agent-1", "");
        agent.role = Some(Role::CodeWriter);
        agent.allowed_path_patterns = vec!["scratch/{self}/**".into()];
        agent.denied_path_patterns = vec!["scratch/{self}/frozen/**".into()];
        let stage = IdentityStage::from_agent(Some(agent));

        assert!(p.evaluate(&stage, &write("scratch/agent-1/a.txt")).is_ok());
        assert!(p.evaluate(&stage, &write("scratch/agent-1/frozen/a.txt")).is_err());
        assert!(p.evaluate(&stage, &write("src/main.rs")).is_err());
    }

    #[test]
    fn test_delete_and_unknown_are_writes() {
        let p = policy();
        let stage = with_role(Role::Tester);
        assert!(
            p.evaluate(&stage, &FileOperation::new("src/lib.rs", OperationKind::Delete))
                .is_err()
        );
        assert!(
            p.evaluate(&stage, &FileOperation::new("src/lib.rs", OperationKind::Unknown))
                .is_err()
        );
    }

    #[test]
    fn test_programs_gated_until_role() {
        let p = policy();
        let run = |program: &str| FileOperation::new(program, OperationKind::Execute);
        let no_role = IdentityStage::from_agent(Some(AgentState::new("agent-1", "alice")));

        let blocked = p.evaluate(&IdentityStage::NoIdentity, &run("bash")).unwrap_err();
        assert_eq!(blocked.rule, BlockRule::NoIdentity);
        assert!(blocked.message.contains("running 'bash'"));
        assert_eq!(
            p.evaluate(&no_role, &run("python3")).unwrap_err().rule,
            BlockRule::NoRole
        );

        assert!(p.evaluate(&IdentityStage::NoIdentity, &run("warden")).is_ok());
        assert!(p.evaluate(&IdentityStage::NoIdentity, &run("/usr/local/bin/warden")).is_ok());
        assert!(p.evaluate(&no_role, &run("LS.EXE")).is_ok());
        assert!(p.evaluate(&with_role(Role::Planner), &run("cargo")).is_ok());
    }

    #[test]
    fn test_deny_everywhere_survives_overrides() {
        let mut overrides = BTreeMap::new();
        overrides.insert(
            Role::DocsWriter,
            RoleOverride {
                allow: Some(vec!["**".into()]),
                deny: None,
                template: None,
            },
        );
        let table = RoleTable::defaults("workspace")
            .deny_everywhere("OFF-LIMITS.md")
            .with_overrides(&overrides);
        for role in Role::ALL {
            assert!(table.profile(role).deny.contains(&"OFF-LIMITS.md".to_string()));
        }

        let p = RoleAccessPolicy::new(table, "/repo");
        let stage = with_role(Role::DocsWriter);
        assert!(p.evaluate(&stage, &write("docs/guide.md")).is_ok());
        let blocked = p.evaluate(&stage, &write("/repo/OFF-LIMITS.md")).unwrap_err();
        assert_eq!(blocked.rule, BlockRule::RoleWrite);
        assert!(blocked.message.contains("OFF-LIMITS.md"));
    }

    #[test]
    fn test_invalid_deny_pattern_blocks() {
        let p = policy();
        let mut agent = AgentState::new("agent-1", "");
        agent.role = Some(Role::CodeWriter);
        agent.denied_path_patterns = vec!["src/[oops".into()];
        let stage = IdentityStage::from_agent(Some(agent));
        assert!(p.evaluate(&stage, &write("src/main.rs")).is_err());
    }

    #[test]
    fn test_overrides() {
        let mut overrides = BTreeMap::new();
        overrides.insert(
            Role::Tester,
            RoleOverride {
                allow: Some(vec!["qa/**".into()]),
                deny: Some(vec!["qa/golden/**".into()]),
                template: Some("docs/roles/tester.md".into()),
            },
        );
        let table = RoleTable::defaults("workspace").with_overrides(&overrides);
        let tester = table.profile(Role::Tester);
        assert_eq!(tester.allow, vec!["qa/**"]);
        assert_eq!(tester.deny, vec![ALWAYS_DENIED, "qa/golden/**"]);
        assert_eq!(tester.template, "docs/roles/tester.md");
        assert_eq!(table.profile(Role::Planner).template, ".warden/roles/planner.md");
    }

    #[test]
    fn test_self_review_prevention() {
        let mut history = TaskRoleHistory::new();
        history.insert("T1".into(), vec![Role::CodeWriter]);

        let err = can_take_role(&history, Role::Reviewer, "T1").unwrap_err();
        assert!(err.to_string().contains("code-writer"));
        assert!(err.to_string().contains("T1"));

        assert!(can_take_role(&history, Role::Reviewer, "T2").is_ok());
        assert!(can_take_role(&history, Role::Tester, "T1").is_ok());
        assert!(can_take_role(&history, Role::CodeWriter, "T1").is_ok());
    }
}
