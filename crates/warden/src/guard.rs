//! The guard: one decision per attempted action.
//!
//! ```text
//! request ──► resolve identity stage
//!         ──► (command) analyze ──► dangerous? ──► Block
//!         ──► for each operation:
//!                 off-limits ──► role access ──► must-read (mutating only)
//!             first block wins
//!         ──► Allow: consume must-reads for every read target
//! ```
//!
//! Every decision is written to the audit sink. Audit failures are logged
//! and never change the decision.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use thiserror::Error;

use crate::audit::{AuditEvent, AuditKind, AuditSink, JsonlAuditLog, NullAuditSink};
use crate::bash::analyze;
use crate::config::{GuardSettings, ProjectConfig, ProjectLayout};
use crate::identity::{IdentityResolver, IdentitySource, SessionHint};
use crate::must_read::{MustReadGate, write_block_reason};
use crate::policy::{
    BlockReason, BlockRule, FileOperation, GuardDecision, IdentityStage, OffLimitsPolicy,
    OperationKind, RoleAccessPolicy,
};
use crate::state::{AgentState, StateStore};

/// Action named by a guard request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GuardAction {
    /// Read a file
    Read,
    /// Create or overwrite a file
    Write,
    /// Modify a file in place
    Edit,
    /// Run a shell command
    Execute,
}

impl GuardAction {
    /// Lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            GuardAction::Read => "read",
            GuardAction::Write => "write",
            GuardAction::Edit => "edit",
            GuardAction::Execute => "execute",
        }
    }

    /// Whether the action may change the repository.
    pub fn is_mutating(&self) -> bool {
        matches!(self, GuardAction::Write | GuardAction::Edit | GuardAction::Execute)
    }
}

impl fmt::Display for GuardAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned for an unknown action name.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown action '{0}' (expected read, write, edit or execute)")]
pub struct ParseActionError(pub String);

impl FromStr for GuardAction {
    type Err = ParseActionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "read" => Ok(GuardAction::Read),
            "write" => Ok(GuardAction::Write),
            "edit" => Ok(GuardAction::Edit),
            "execute" | "exec" => Ok(GuardAction::Execute),
            _ => Err(ParseActionError(s.to_string())),
        }
    }
}

/// One attempted action.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GuardRequest {
    /// A direct file operation
    File {
        /// `Read`, `Write` or `Edit`
        action: GuardAction,
        /// Target path, relative to the project root or absolute
        path: String,
    },
    /// A shell command line
    Command {
        /// The raw command line
        command: String,
        /// Directory the command runs in; relative operands resolve against it
        cwd: Option<String>,
    },
}

impl GuardRequest {
    /// Read `path`.
    pub fn read(path: impl Into<String>) -> Self {
        GuardRequest::File {
            action: GuardAction::Read,
            path: path.into(),
        }
    }

    /// Write `path`.
    pub fn write(path: impl Into<String>) -> Self {
        GuardRequest::File {
            action: GuardAction::Write,
            path: path.into(),
        }
    }

    /// Edit `path`.
    pub fn edit(path: impl Into<String>) -> Self {
        GuardRequest::File {
            action: GuardAction::Edit,
            path: path.into(),
        }
    }

    /// Run `command` from the project root.
    pub fn command(command: impl Into<String>) -> Self {
        GuardRequest::Command {
            command: command.into(),
            cwd: None,
        }
    }

    /// Run `command` from the directory `cwd`.
    pub fn command_in(command: impl Into<String>, cwd: impl Into<String>) -> Self {
        GuardRequest::Command {
            command: command.into(),
            cwd: Some(cwd.into()),
        }
    }

    /// The action of this request.
    pub fn action(&self) -> GuardAction {
        match self {
            GuardRequest::File { action, .. } => *action,
            GuardRequest::Command { .. } => GuardAction::Execute,
        }
    }

    /// The path or command line.
    pub fn target(&self) -> &str {
        match self {
            GuardRequest::File { path, .. } => path,
            GuardRequest::Command { command, .. } => command,
        }
    }
}

/// Decides whether attempted actions may proceed.
pub struct Guard<S, I> {
    layout: ProjectLayout,
    store: S,
    identity: I,
    off_limits: OffLimitsPolicy,
    access: RoleAccessPolicy,
    settings: GuardSettings,
    audit: Box<dyn AuditSink>,
}

impl<S, I> fmt::Debug for Guard<S, I> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Guard")
            .field("layout", &self.layout)
            .field("off_limits", &self.off_limits.patterns().len())
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl<S: StateStore, I: IdentitySource> Guard<S, I> {
    /// Create a guard for a project with no off-limits patterns.
    ///
    /// Decisions are audited to `.warden/audit.jsonl` unless the
    /// configuration turns auditing off.
    pub fn new(layout: ProjectLayout, config: &ProjectConfig, store: S, identity: I) -> Self {
        let access = RoleAccessPolicy::new(config.role_table(), layout.root());
        let audit: Box<dyn AuditSink> = if config.guard.audit {
            Box::new(JsonlAuditLog::new(layout.audit_path()))
        } else {
            Box::new(NullAuditSink)
        };
        Self {
            layout,
            store,
            identity,
            off_limits: OffLimitsPolicy::empty(),
            access,
            settings: config.guard.clone(),
            audit,
        }
    }

    /// Create a guard and load the project's off-limits document.
    pub fn open(layout: ProjectLayout, config: &ProjectConfig, store: S, identity: I) -> std::io::Result<Self> {
        let off_limits = OffLimitsPolicy::load(&layout.off_limits_path(config))?;
        Ok(Self::new(layout, config, store, identity).with_off_limits(off_limits))
    }

    /// Replace the off-limits policy.
    pub fn with_off_limits(mut self, off_limits: OffLimitsPolicy) -> Self {
        self.off_limits = off_limits;
        self
    }

    /// Replace the audit sink.
    pub fn with_audit(mut self, audit: impl AuditSink + 'static) -> Self {
        self.audit = Box::new(audit);
        self
    }

    /// The state store.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// The project layout.
    pub fn layout(&self) -> &ProjectLayout {
        &self.layout
    }

    /// Decide whether `request` may proceed for the caller described by
    /// `hint`.
    pub fn check(&self, request: &GuardRequest, hint: &SessionHint) -> GuardDecision {
        let agent = IdentityResolver::new(&self.store, &self.identity).resolve(hint);
        let stage = self.stage_for(agent.as_deref());

        let operations = match request {
            GuardRequest::File { action, path } => {
                let kind = match action {
                    GuardAction::Read => OperationKind::Read,
                    GuardAction::Write | GuardAction::Edit => OperationKind::Write,
                    GuardAction::Execute => OperationKind::Unknown,
                };
                Ok(vec![FileOperation::new(path.as_str(), kind)])
            }
            GuardRequest::Command { command, cwd } => {
                let analysis = analyze(command);
                for warning in &analysis.warnings {
                    tracing::info!(command = %command, warning = %warning, "command not fully analyzable");
                }
                match analysis.danger_reason {
                    Some(reason) if analysis.dangerous => Err(BlockReason::new(
                        BlockRule::DangerousCommand,
                        format!("command refused: {}", reason),
                    )),
                    _ => Ok(analysis
                        .operations
                        .into_iter()
                        .map(|op| resolve_operand(op, cwd.as_deref()))
                        .collect()),
                }
            }
        };

        let decision: GuardDecision = operations
            .and_then(|ops| {
                for op in &ops {
                    self.evaluate(&stage, op)?;
                }
                Ok(ops)
            })
            .map(|ops| {
                if let Some(agent) = stage.agent() {
                    self.consume_reads(&agent.name, &ops);
                }
            })
            .into();

        tracing::debug!(
            agent = agent.as_deref().unwrap_or("-"),
            stage = %stage,
            action = %request.action(),
            target = request.target(),
            allowed = decision.is_allowed(),
            "guard decision"
        );
        self.audit_decision(agent.as_deref(), request, &decision);
        decision
    }

    /// Identity stage of the caller.
    ///
    /// A session without a state document counts as a fresh agent with no
    /// role. An unreadable state document counts as no identity.
    pub fn stage_for(&self, agent: Option<&str>) -> IdentityStage {
        let Some(name) = agent else {
            return IdentityStage::NoIdentity;
        };
        match self.store.load_agent(name) {
            Ok(Some(state)) => IdentityStage::from_agent(Some(state)),
            Ok(None) => IdentityStage::from_agent(Some(AgentState::new(name, ""))),
            Err(e) => {
                tracing::warn!(agent = %name, error = %e, "cannot load agent state; treating caller as unidentified");
                IdentityStage::NoIdentity
            }
        }
    }

    /// Evaluate one operation through every layer.
    fn evaluate(&self, stage: &IdentityStage, op: &FileOperation) -> Result<(), BlockReason> {
        let skip_off_limits = op.kind.is_read() && !self.settings.off_limits_blocks_reads;
        if !skip_off_limits {
            self.check_off_limits(op)?;
        }

        self.access.evaluate(stage, op)?;

        if op.kind.is_mutating()
            && let IdentityStage::IdentityWithRole { agent, .. } = stage
            && let Some(reason) = write_block_reason(agent)
        {
            return Err(reason);
        }
        Ok(())
    }

    /// Block `op` if it names an off-limits path, or if its target is a glob
    /// or a directory that could reach one.
    fn check_off_limits(&self, op: &FileOperation) -> Result<(), BlockReason> {
        let root = Some(self.layout.root());
        let mut rel = self.layout.relative(&op.path);
        if rel.is_empty() {
            rel.push('.');
        }
        if let Some(pattern) = self.off_limits.is_off_limits(&op.path, root) {
            return Err(BlockReason::new(
                BlockRule::OffLimits,
                format!("'{}' is off limits for every agent ({} matches {})", rel, op.kind, pattern),
            ));
        }
        if op.kind == OperationKind::Execute {
            return Ok(());
        }
        let through_dirs = matches!(op.kind, OperationKind::Read | OperationKind::Delete);
        if let Some(pattern) = self.off_limits.may_reach(&op.path, root, through_dirs) {
            return Err(BlockReason::new(
                BlockRule::OffLimits,
                format!(
                    "'{}' could reach paths that are off limits for every agent ({} may cover {}); \
                     name the files explicitly",
                    rel, op.kind, pattern
                ),
            ));
        }
        Ok(())
    }

    fn consume_reads(&self, agent: &str, ops: &[FileOperation]) {
        let reads: Vec<&str> = ops
            .iter()
            .filter(|op| op.kind.is_read())
            .map(|op| op.path.as_str())
            .collect();
        if reads.is_empty() {
            return;
        }
        let gate = MustReadGate::new(&self.store, self.layout.root());
        if let Err(e) = gate.record_reads(agent, &reads) {
            tracing::warn!(agent = %agent, error = %e, "failed to record must-read progress");
        }
    }

    fn audit_decision(&self, agent: Option<&str>, request: &GuardRequest, decision: &GuardDecision) {
        let mut event = AuditEvent::new(AuditKind::Guard, request.action().as_str(), request.target()).agent(agent);
        if let Some(reason) = decision.block_reason() {
            event = event.blocked(reason.to_string());
        }
        if let Err(e) = self.audit.record(&event) {
            tracing::warn!(error = %e, "failed to write audit event");
        }
    }
}

/// Resolve a relative operand of a command against the directory it runs
/// in. Bare program names are looked up on `PATH` and stay as they are.
fn resolve_operand(mut op: FileOperation, cwd: Option<&str>) -> FileOperation {
    let Some(cwd) = cwd.filter(|c| !c.is_empty()) else {
        return op;
    };
    let bare_program = op.kind == OperationKind::Execute && !op.path.contains(['/', '\\']);
    if bare_program || is_rooted(&op.path) {
        return op;
    }
    op.path = Path::new(cwd).join(&op.path).to_string_lossy().into_owned();
    op
}

/// Absolute, home-relative or variable-prefixed operands.
fn is_rooted(path: &str) -> bool {
    Path::new(path).is_absolute()
        || path.starts_with(['/', '\\', '~', '$'])
        || path.as_bytes().get(1) == Some(&b':')
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::audit::MemoryAuditSink;
    use crate::identity::FixedIdentitySource;
    use crate::state::{MemoryStateStore, Role, SessionOwner};

    const SESSION: &str = "sess-1";

    fn guard(store: MemoryStateStore) -> (Guard<MemoryStateStore, FixedIdentitySource>, Arc<MemoryAuditSink>) {
        let audit = Arc::new(MemoryAuditSink::new());
        let guard = Guard::new(
            ProjectLayout::new("/repo"),
            &ProjectConfig::default(),
            store,
            FixedIdentitySource::new([]),
        )
        .with_off_limits(OffLimitsPolicy::parse("```\n.env\nsecrets/**\n```\n"))
        .with_audit(Arc::clone(&audit));
        (guard, audit)
    }

    fn claimed(state: AgentState) -> MemoryStateStore {
        let store = MemoryStateStore::new();
        let name = state.name.clone();
        store.save_agent(&state).unwrap();
        store
            .create_session(&crate::state::AgentSession::new(name, &SessionOwner::session(SESSION)))
            .unwrap();
        store
    }

    fn hint() -> SessionHint {
        SessionHint::Session(SESSION.into())
    }

    fn rule(decision: &GuardDecision) -> Option<BlockRule> {
        decision.block_reason().map(|r| r.rule)
    }

    #[test]
    fn test_off_limits_blocks_every_stage_and_kind() {
        let mut writer = AgentState::new("agent-1", "");
        writer.role = Some(Role::CodeWriter);
        writer.allowed_path_patterns = vec!["**".into()];

        for store in [MemoryStateStore::new(), claimed(AgentState::new("agent-1", "")), claimed(writer)] {
            let (guard, _) = guard(store);
            for request in [
                GuardRequest::read(".env"),
                GuardRequest::write("config/.env"),
                GuardRequest::edit("/repo/secrets/api.key"),
                GuardRequest::command("cat secrets/api.key"),
                GuardRequest::command("rm -r secrets"),
            ] {
                let decision = guard.check(&request, &hint());
                assert_eq!(rule(&decision), Some(BlockRule::OffLimits), "{:?}", request);
            }
        }
    }

    #[test]
    fn test_dangerous_command_blocked_before_identity() {
        let (guard, _) = guard(MemoryStateStore::new());
        let decision = guard.check(&GuardRequest::command("rm -rf /"), &hint());
        assert_eq!(rule(&decision), Some(BlockRule::DangerousCommand));
    }

    #[test]
    fn test_no_identity_stage() {
        let (guard, _) = guard(MemoryStateStore::new());
        assert!(guard.check(&GuardRequest::read("README.md"), &hint()).is_allowed());
        assert_eq!(
            rule(&guard.check(&GuardRequest::read("src/lib.rs"), &hint())),
            Some(BlockRule::NoIdentity)
        );
        assert_eq!(
            rule(&guard.check(&GuardRequest::write("README.md"), &hint())),
            Some(BlockRule::NoIdentity)
        );
        assert!(guard.check(&GuardRequest::command("warden claim agent-1"), &hint()).is_allowed());
        assert_eq!(
            rule(&guard.check(&GuardRequest::command("cargo --version"), &hint())),
            Some(BlockRule::NoIdentity)
        );
        assert_eq!(
            rule(&guard.check(&GuardRequest::command("bash -c 'echo pwned > src/a.rs'"), &hint())),
            Some(BlockRule::NoIdentity)
        );
    }

    #[test]
    fn test_session_without_state_is_no_role() {
        let store = MemoryStateStore::new();
        store
            .create_session(&crate::state::AgentSession::new("agent-9", &SessionOwner::session(SESSION)))
            .unwrap();
        let (guard, _) = guard(store);
        assert_eq!(
            rule(&guard.check(&GuardRequest::write("src/a.rs"), &hint())),
            Some(BlockRule::NoRole)
        );
        assert!(
            guard
                .check(&GuardRequest::read("workspace/agents/agent-9/AGENT.md"), &hint())
                .is_allowed()
        );
    }

    #[test]
    fn test_must_read_gate_then_write() {
        let mut state = AgentState::new("agent-1", "alice");
        state.role = Some(Role::Reviewer);
        state.task = Some("T1".into());
        state.unread_must_reads = vec!["README.md".into(), "docs/review.md".into()];
        let (guard, audit) = guard(claimed(state));

        let blocked = guard.check(&GuardRequest::edit("src/code.cs"), &hint());
        let reason = blocked.block_reason().unwrap();
        assert_eq!(reason.rule, BlockRule::MustRead);
        assert!(reason.message.contains("docs/review.md"));

        assert!(guard.check(&GuardRequest::read("/repo/README.md"), &hint()).is_allowed());
        let left = guard.store().load_agent("agent-1").unwrap().unwrap();
        assert_eq!(left.unread_must_reads, vec!["docs/review.md"]);

        assert!(guard.check(&GuardRequest::command("cat docs/review.md"), &hint()).is_allowed());
        assert!(guard.check(&GuardRequest::edit("src/code.cs"), &hint()).is_allowed());

        let events = audit.events();
        assert_eq!(events.len(), 4);
        assert!(!events[0].allowed);
        assert!(events[3].allowed);
        assert_eq!(events[3].agent.as_deref(), Some("agent-1"));
    }

    #[test]
    fn test_blocked_command_does_not_consume_reads() {
        let mut state = AgentState::new("agent-1", "");
        state.role = Some(Role::Reviewer);
        state.unread_must_reads = vec!["README.md".into()];
        let (guard, _) = guard(claimed(state));

        let decision = guard.check(&GuardRequest::command("cat README.md > docs/out.md"), &hint());
        assert_eq!(rule(&decision), Some(BlockRule::RoleWrite));
        let left = guard.store().load_agent("agent-1").unwrap().unwrap();
        assert_eq!(left.unread_must_reads, vec!["README.md"]);
    }

    #[test]
    fn test_first_block_wins_in_command_order() {
        let mut state = AgentState::new("agent-1", "");
        state.role = Some(Role::DocsWriter);
        let (guard, _) = guard(claimed(state));

        let decision = guard.check(&GuardRequest::command("touch src/a.rs; cat .env"), &hint());
        assert_eq!(rule(&decision), Some(BlockRule::RoleWrite));
    }

    #[test]
    fn test_off_limits_reads_can_be_allowed() {
        let mut config = ProjectConfig::default();
        config.guard.off_limits_blocks_reads = false;
        config.guard.audit = false;
        let mut state = AgentState::new("agent-1", "");
        state.role = Some(Role::CodeWriter);
        let guard = Guard::new(
            ProjectLayout::new("/repo"),
            &config,
            claimed(state),
            FixedIdentitySource::new([]),
        )
        .with_off_limits(OffLimitsPolicy::parse("```\nsrc/secret.rs\n```\n"));

        assert!(guard.check(&GuardRequest::read("src/secret.rs"), &hint()).is_allowed());
        assert_eq!(
            rule(&guard.check(&GuardRequest::write("src/secret.rs"), &hint())),
            Some(BlockRule::OffLimits)
        );
    }

    #[test]
    fn test_command_operands_resolve_against_cwd() {
        let mut writer = AgentState::new("agent-1", "");
        writer.role = Some(Role::CodeWriter);
        let (guard, _) = guard(claimed(writer));

        let decision = guard.check(&GuardRequest::command_in("cat api.key", "/repo/secrets"), &hint());
        assert_eq!(rule(&decision), Some(BlockRule::OffLimits));
        let decision = guard.check(&GuardRequest::command_in("cat ../secrets/api.key", "/repo/src"), &hint());
        assert_eq!(rule(&decision), Some(BlockRule::OffLimits));

        assert!(
            guard
                .check(&GuardRequest::command_in("touch lib.rs", "/repo/src"), &hint())
                .is_allowed()
        );
        let decision = guard.check(&GuardRequest::command_in("touch lib.rs", "/repo/docs"), &hint());
        assert_eq!(rule(&decision), Some(BlockRule::RoleWrite));
    }

    #[test]
    fn test_directory_and_glob_operands_reach_off_limits() {
        let mut planner = AgentState::new("agent-1", "");
        planner.role = Some(Role::Planner);
        let (guard, _) = guard(claimed(planner));

        for command in ["grep -r password .", "cat secrets/*", "cat s*/api.key", "cat config/.e*"] {
            let decision = guard.check(&GuardRequest::command(command), &hint());
            assert_eq!(rule(&decision), Some(BlockRule::OffLimits), "{}", command);
        }
        let decision = guard.check(&GuardRequest::read("/repo"), &hint());
        assert!(decision.block_reason().unwrap().message.contains("could reach"));

        assert!(guard.check(&GuardRequest::command("grep -r password src"), &hint()).is_allowed());
        assert!(guard.check(&GuardRequest::command("cat src/*.rs"), &hint()).is_allowed());
    }

    #[test]
    fn test_action_parsing() {
        assert_eq!("Edit".parse::<GuardAction>().unwrap(), GuardAction::Edit);
        assert_eq!("execute".parse::<GuardAction>().unwrap(), GuardAction::Execute);
        assert!("delete".parse::<GuardAction>().is_err());
        assert!(!GuardAction::Read.is_mutating());
    }
}
