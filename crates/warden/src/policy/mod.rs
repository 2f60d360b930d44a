//! Path policy for the guard.
//!
//! Two independent layers decide whether a path may be touched:
//!
//! - **Off-limits**: a project-wide blocklist read from `OFF-LIMITS.md`. It
//!   applies to everyone, before identity is even looked at.
//! - **Role access**: a staged check that depends on whether the caller has
//!   claimed an agent and taken a role, and on that role's write patterns.
//!
//! Both layers work on normalized, project-relative paths and compare them
//! with [`glob`] patterns case-insensitively.
//!
//! ## Example
//!
//! ```rust,ignore
//! use warden::policy::{OffLimitsPolicy, RoleAccessPolicy, RoleTable, IdentityStage};
//!
//! let off_limits = OffLimitsPolicy::parse("```\n.env\nsecrets/**\n```\n");
//! assert!(off_limits.is_off_limits("config/.env", None).is_some());
//!
//! let roles = RoleAccessPolicy::new(RoleTable::defaults("workspace"), "/repo");
//! let op = FileOperation::new("src/main.rs", OperationKind::Write);
//! assert!(roles.evaluate(&IdentityStage::NoIdentity, &op).is_err());
//! ```

mod handler;
mod off_limits;
mod pattern;
mod roles;

pub use handler::{BlockReason, BlockRule, FileOperation, GuardDecision, OperationKind};
pub use off_limits::{InvalidPattern, OffLimitsPattern, OffLimitsPolicy};
pub use pattern::{PathPattern, normalize_path, substitute_self};
pub use roles::{
    ALWAYS_DENIED, IdentityStage, ROLE_TEMPLATE_DIR, RoleAccessPolicy, RoleProfile, RoleTable,
    SelfReviewError, can_take_role,
};
