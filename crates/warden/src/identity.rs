//! Mapping the calling process to a claimed agent.
//!
//! A hook host passes a session id, which is matched against stored
//! sessions. A terminal invocation has no session id, so the resolver walks
//! the caller's ancestor processes and matches their PIDs against session
//! owner PIDs instead.
//!
//! Process introspection sits behind [`IdentitySource`] so tests can supply
//! a fixed ancestor chain. Any failure to read the process table resolves to
//! "no identity", which the guard treats as the most restricted stage.

use std::collections::HashSet;
use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::state::{AgentSession, SessionOwner, StateStore, StoreError};

/// Maximum number of ancestors inspected.
pub const MAX_ANCESTOR_DEPTH: usize = 64;

/// `/proc/<pid>/status` is well under this size.
const MAX_PROC_READ_SIZE: u64 = 4096;

const DEFAULT_PROC_ROOT: &str = "/proc";

/// Errors from an [`IdentitySource`].
#[derive(Debug, Error)]
pub enum IdentityError {
    /// The process table cannot be inspected on this platform
    #[error("process ancestry is not available on this platform")]
    Unsupported,
    /// Reading a process record failed
    #[error("failed to read process {pid}: {reason}")]
    ProcRead {
        /// Process being inspected
        pid: u32,
        /// What went wrong
        reason: String,
    },
}

/// Errors from claiming an agent.
#[derive(Debug, Error)]
pub enum ClaimError {
    /// The agent is held by someone else, or the caller already holds a
    /// different agent
    #[error("cannot claim '{agent}': {detail}")]
    AlreadyClaimed {
        /// Agent that was requested
        agent: String,
        /// Who holds what
        detail: String,
    },
    /// Storage error
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Source of OS process identity.
pub trait IdentitySource {
    /// Ancestor PIDs of the calling process, nearest first (parent,
    /// grandparent, …). The calling process itself is not included.
    fn ancestors(&self) -> Result<Vec<u32>, IdentityError>;

    /// Best-effort check whether a process still exists.
    fn is_alive(&self, pid: u32) -> bool;
}

impl<T: IdentitySource + ?Sized> IdentitySource for &T {
    fn ancestors(&self) -> Result<Vec<u32>, IdentityError> {
        (**self).ancestors()
    }

    fn is_alive(&self, pid: u32) -> bool {
        (**self).is_alive(pid)
    }
}

/// Reads process ancestry from a procfs mount.
#[derive(Clone, Debug)]
pub struct ProcIdentitySource {
    proc_root: PathBuf,
    start_pid: u32,
}

impl Default for ProcIdentitySource {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcIdentitySource {
    /// Inspect the real `/proc`, starting from the current process.
    pub fn new() -> Self {
        Self {
            proc_root: PathBuf::from(DEFAULT_PROC_ROOT),
            start_pid: std::process::id(),
        }
    }

    /// Inspect a procfs-shaped directory, starting from `start_pid`.
    pub fn with_root(proc_root: impl Into<PathBuf>, start_pid: u32) -> Self {
        Self {
            proc_root: proc_root.into(),
            start_pid,
        }
    }

    fn is_system_proc(&self) -> bool {
        self.proc_root == Path::new(DEFAULT_PROC_ROOT)
    }

    fn read_ppid(&self, pid: u32) -> Result<u32, IdentityError> {
        let status_path = self.proc_root.join(pid.to_string()).join("status");
        let content = read_bounded(&status_path).map_err(|e| IdentityError::ProcRead {
            pid,
            reason: e.to_string(),
        })?;

        for line in content.lines() {
            if let Some(rest) = line.strip_prefix("PPid:") {
                let trimmed = rest.trim();
                return trimmed.parse::<u32>().map_err(|_| IdentityError::ProcRead {
                    pid,
                    reason: format!("invalid PPid value: '{}'", trimmed),
                });
            }
        }

        Err(IdentityError::ProcRead {
            pid,
            reason: "PPid field not found".to_string(),
        })
    }
}

impl IdentitySource for ProcIdentitySource {
    fn ancestors(&self) -> Result<Vec<u32>, IdentityError> {
        if self.is_system_proc() && !cfg!(target_os = "linux") {
            return Err(IdentityError::Unsupported);
        }

        let mut chain = Vec::new();
        let mut pid = self.start_pid;
        while chain.len() < MAX_ANCESTOR_DEPTH {
            let parent = self.read_ppid(pid)?;
            if parent == 0 || parent == pid {
                break;
            }
            chain.push(parent);
            if parent == 1 {
                break;
            }
            pid = parent;
        }
        Ok(chain)
    }

    fn is_alive(&self, pid: u32) -> bool {
        if self.is_system_proc() {
            pid_alive(pid)
        } else {
            self.proc_root.join(pid.to_string()).exists()
        }
    }
}

fn read_bounded(path: &Path) -> io::Result<String> {
    let mut content = String::new();
    File::open(path)?
        .take(MAX_PROC_READ_SIZE)
        .read_to_string(&mut content)?;
    Ok(content)
}

#[cfg(unix)]
fn pid_alive(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    if pid <= 0 {
        return false;
    }
    // SAFETY: signal 0 performs only the existence and permission check.
    let rc = unsafe { libc::kill(pid, 0) };
    rc == 0 || io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
fn pid_alive(_pid: u32) -> bool {
    // Unknown on this platform; never report a session as stale.
    true
}

/// A fixed ancestor chain, for tests and for hosts that know their lineage.
#[derive(Clone, Debug, Default)]
pub struct FixedIdentitySource {
    ancestors: Vec<u32>,
    dead: HashSet<u32>,
    unavailable: bool,
}

impl FixedIdentitySource {
    /// Use `ancestors` (nearest first) as the caller's lineage.
    pub fn new(ancestors: impl IntoIterator<Item = u32>) -> Self {
        Self {
            ancestors: ancestors.into_iter().collect(),
            dead: HashSet::new(),
            unavailable: false,
        }
    }

    /// A source whose process table cannot be read.
    pub fn unavailable() -> Self {
        Self {
            unavailable: true,
            ..Self::default()
        }
    }

    /// Report `pid` as no longer running.
    pub fn with_dead(mut self, pid: u32) -> Self {
        self.dead.insert(pid);
        self
    }
}

impl IdentitySource for FixedIdentitySource {
    fn ancestors(&self) -> Result<Vec<u32>, IdentityError> {
        if self.unavailable {
            return Err(IdentityError::Unsupported);
        }
        Ok(self.ancestors.clone())
    }

    fn is_alive(&self, pid: u32) -> bool {
        !self.dead.contains(&pid)
    }
}

/// What the caller can tell us about itself.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionHint {
    /// Hook invocation with a host session id
    Session(String),
    /// Terminal invocation; use process ancestry
    ProcessTree,
}

impl SessionHint {
    /// Build a hint from an optional, possibly blank, session id.
    pub fn from_session_id(id: Option<&str>) -> Self {
        match id.map(str::trim) {
            Some(id) if !id.is_empty() => SessionHint::Session(id.to_string()),
            _ => SessionHint::ProcessTree,
        }
    }

    /// The session id, if any.
    pub fn session_id(&self) -> Option<&str> {
        match self {
            SessionHint::Session(id) => Some(id),
            SessionHint::ProcessTree => None,
        }
    }
}

/// Resolves, claims and releases agent identities.
#[derive(Debug)]
pub struct IdentityResolver<'a, S, I> {
    store: &'a S,
    source: &'a I,
}

impl<'a, S: StateStore, I: IdentitySource> IdentityResolver<'a, S, I> {
    /// Create a resolver over a store and an identity source.
    pub fn new(store: &'a S, source: &'a I) -> Self {
        Self { store, source }
    }

    /// The agent claimed by the caller, if any.
    ///
    /// Never fails: storage or process-table errors resolve to `None`.
    pub fn resolve(&self, hint: &SessionHint) -> Option<String> {
        let sessions = match self.store.list_sessions() {
            Ok(sessions) => sessions,
            Err(e) => {
                tracing::warn!(error = %e, "cannot read sessions; treating caller as unidentified");
                return None;
            }
        };
        if sessions.is_empty() {
            return None;
        }

        if let SessionHint::Session(id) = hint
            && let Some(session) = sessions
                .iter()
                .find(|s| s.session_id.as_deref() == Some(id.as_str()))
        {
            return Some(session.agent.clone());
        }

        let ancestors = match self.source.ancestors() {
            Ok(ancestors) => ancestors,
            Err(e) => {
                tracing::debug!(error = %e, "process ancestry unavailable");
                return None;
            }
        };
        ancestors.iter().find_map(|pid| {
            sessions
                .iter()
                .find(|s| s.owner_pid == Some(*pid))
                .map(|s| s.agent.clone())
        })
    }

    /// The owner a claim made now would record: the hint's session id and
    /// the caller's parent process.
    pub fn current_owner(&self, hint: &SessionHint) -> SessionOwner {
        let pid = self
            .source
            .ancestors()
            .ok()
            .and_then(|ancestors| ancestors.first().copied());
        SessionOwner {
            session_id: hint.session_id().map(str::to_string),
            pid,
        }
    }

    /// Claim `agent` for `owner`.
    ///
    /// Re-claiming an agent the owner already holds returns the existing
    /// session. Claiming an agent held by another owner, or a second agent
    /// while one is held, fails with [`ClaimError::AlreadyClaimed`].
    pub fn claim(&self, agent: &str, owner: &SessionOwner) -> Result<AgentSession, ClaimError> {
        if let Some(held) = self
            .store
            .list_sessions()?
            .into_iter()
            .find(|s| s.agent != agent && s.is_owned_by(owner))
        {
            return Err(ClaimError::AlreadyClaimed {
                agent: agent.to_string(),
                detail: format!(
                    "{} already holds agent '{}'; release it first",
                    owner, held.agent
                ),
            });
        }

        let session = AgentSession::new(agent, owner);
        match self.store.create_session(&session) {
            Ok(()) => {
                tracing::info!(agent = %agent, owner = %owner, "agent claimed");
                Ok(session)
            }
            Err(StoreError::SessionExists(_)) => match self.store.load_session(agent)? {
                Some(existing) if existing.is_owned_by(owner) => Ok(existing),
                Some(existing) => Err(ClaimError::AlreadyClaimed {
                    agent: agent.to_string(),
                    detail: format!(
                        "held by {} since {}",
                        existing.owner(),
                        existing.claimed_at.to_rfc3339()
                    ),
                }),
                None => Err(ClaimError::AlreadyClaimed {
                    agent: agent.to_string(),
                    detail: "a concurrent claim or release is in progress".to_string(),
                }),
            },
            Err(e) => Err(e.into()),
        }
    }

    /// Release the session for `agent`. Returns false if it was not claimed.
    pub fn release(&self, agent: &str) -> Result<bool, StoreError> {
        let released = self.store.delete_session(agent)?;
        if released {
            tracing::info!(agent = %agent, "agent released");
        }
        Ok(released)
    }

    /// Sessions whose owner process no longer exists.
    ///
    /// Advisory only: PID reuse can hide a stale session, and nothing here
    /// clears a claim.
    pub fn stale_sessions(&self) -> Result<Vec<AgentSession>, StoreError> {
        Ok(self
            .store
            .list_sessions()?
            .into_iter()
            .filter(|s| s.owner_pid.is_some_and(|pid| !self.source.is_alive(pid)))
            .collect())
    }
}
