//! Operation and decision types shared by every guard layer.

use std::fmt;

use serde::{Deserialize, Serialize};

/// The kind of file operation being attempted.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    /// Reading file contents
    Read,
    /// Creating or modifying a file
    Write,
    /// Removing a file or directory
    Delete,
    /// Running a program
    Execute,
    /// Could not be classified; evaluated like a write
    Unknown,
}

impl OperationKind {
    /// Returns true if this is a read-only operation.
    pub fn is_read(&self) -> bool {
        matches!(self, OperationKind::Read)
    }

    /// Returns true if the operation may change the repository.
    ///
    /// `Unknown` counts as mutating so that anything the guard cannot
    /// classify fails closed.
    pub fn is_mutating(&self) -> bool {
        matches!(
            self,
            OperationKind::Write | OperationKind::Delete | OperationKind::Unknown
        )
    }

    /// Lowercase name used in messages and audit events.
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Read => "read",
            OperationKind::Write => "write",
            OperationKind::Delete => "delete",
            OperationKind::Execute => "execute",
            OperationKind::Unknown => "unknown",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One `(path, kind)` pair the guard evaluates.
///
/// For [`OperationKind::Execute`] the path is the program being run.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileOperation {
    /// Target path as written by the caller
    pub path: String,
    /// What the caller wants to do with it
    pub kind: OperationKind,
}

impl FileOperation {
    /// Create a new file operation.
    pub fn new(path: impl Into<String>, kind: OperationKind) -> Self {
        Self {
            path: path.into(),
            kind,
        }
    }
}

/// The rule that produced a block.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BlockRule {
    /// Path matched an off-limits pattern
    OffLimits,
    /// Command matched the hazard table
    DangerousCommand,
    /// No agent identity is claimed by the caller
    NoIdentity,
    /// Identity claimed but no role assigned
    NoRole,
    /// Role does not permit writing the path
    RoleWrite,
    /// Mandatory reading is still outstanding
    MustRead,
}

impl BlockRule {
    /// Kebab-case name of the rule.
    pub fn as_str(&self) -> &'static str {
        match self {
            BlockRule::OffLimits => "off-limits",
            BlockRule::DangerousCommand => "dangerous-command",
            BlockRule::NoIdentity => "no-identity",
            BlockRule::NoRole => "no-role",
            BlockRule::RoleWrite => "role-write",
            BlockRule::MustRead => "must-read",
        }
    }
}

/// Why an action was blocked.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockReason {
    /// The violated rule
    pub rule: BlockRule,
    /// User-facing explanation
    pub message: String,
}

impl BlockReason {
    /// Create a new block reason.
    pub fn new(rule: BlockRule, message: impl Into<String>) -> Self {
        Self {
            rule,
            message: message.into(),
        }
    }
}

impl fmt::Display for BlockReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.rule.as_str(), self.message)
    }
}

/// The result of a guard check.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GuardDecision {
    /// The action is allowed.
    Allow,
    /// The action is blocked with a reason.
    Block(BlockReason),
}

impl GuardDecision {
    /// Returns true if the action is allowed.
    pub fn is_allowed(&self) -> bool {
        matches!(self, GuardDecision::Allow)
    }

    /// Returns the block reason if blocked, None if allowed.
    pub fn block_reason(&self) -> Option<&BlockReason> {
        match self {
            GuardDecision::Allow => None,
            GuardDecision::Block(reason) => Some(reason),
        }
    }
}

impl From<Result<(), BlockReason>> for GuardDecision {
    fn from(result: Result<(), BlockReason>) -> Self {
        match result {
            Ok(()) => GuardDecision::Allow,
            Err(reason) => GuardDecision::Block(reason),
        }
    }
}
