//! Warden: a repository guard for multiple coding agents
//!
//! Several autonomous agents share one working copy. Before any of them
//! reads, writes or runs something, a pre-tool-use hook asks the [`Guard`]
//! whether the operation may proceed. The decision combines:
//!
//! - an off-limits document that applies to every agent,
//! - the identity the caller has claimed from the agent pool,
//! - the role that identity holds on a task and its write patterns,
//! - the role's must-read list, which gates the first write,
//! - static analysis of shell commands into file operations.

mod audit;
mod config;
mod guard;
mod hook;
mod identity;
mod must_read;
mod pool;

pub mod bash;
pub mod policy;
pub mod state;

pub use audit::{AuditError, AuditEvent, AuditKind, AuditSink, JsonlAuditLog, MemoryAuditSink, NullAuditSink};
pub use config::{
    CONFIG_FILE, ConfigError, GuardSettings, PoolAgent, ProjectConfig, ProjectLayout, ProjectSection, RoleOverride,
    STATE_DIR,
};
pub use guard::{Guard, GuardAction, GuardRequest, ParseActionError};
pub use hook::{HookError, HookInput, HookTool, ToolInput, is_mutating_tool};
pub use identity::{
    ClaimError, FixedIdentitySource, IdentityError, IdentityResolver, IdentitySource, ProcIdentitySource,
    SessionHint,
};
pub use must_read::{MustReadGate, check_write_allowed, parse_must_reads, required_files, write_block_reason};
pub use pool::{AgentPool, AgentReport, ConsistencyIssue, InitOptions, PoolError, init};
