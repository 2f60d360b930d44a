//! The state store trait and its filesystem implementation.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use serde::Serialize;
use thiserror::Error;

use super::{AgentSession, AgentState, AgentStatus};

/// Errors from a [`StateStore`].
#[derive(Debug, Error)]
pub enum StoreError {
    /// Agent names become file names, so they are restricted
    #[error("invalid agent name '{0}': use letters, digits, '-' or '_'")]
    InvalidName(String),
    /// A session already exists for the agent
    #[error("agent '{0}' already has a session")]
    SessionExists(String),
    /// IO error
    #[error("IO error on {}: {source}", path.display())]
    Io {
        /// File or directory involved
        path: PathBuf,
        /// Underlying error
        #[source]
        source: io::Error,
    },
    /// Malformed JSON document
    #[error("malformed document {}: {source}", path.display())]
    Parse {
        /// Offending document
        path: PathBuf,
        /// Underlying error
        #[source]
        source: serde_json::Error,
    },
    /// In-memory store lock poisoned
    #[error("state store lock poisoned")]
    Poisoned,
}

/// Check that `name` is usable as an agent name.
pub fn validate_agent_name(name: &str) -> Result<(), StoreError> {
    let valid = !name.is_empty()
        && name.len() <= 64
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidName(name.to_string()))
    }
}

/// Storage for agent state and claim sessions.
///
/// Implementations hold no cached copies: every `load_*` reflects the
/// latest `save_*` from any process.
pub trait StateStore {
    /// Load an agent record, `None` if it does not exist.
    fn load_agent(&self, name: &str) -> Result<Option<AgentState>, StoreError>;

    /// Replace (or create) an agent record.
    fn save_agent(&self, state: &AgentState) -> Result<(), StoreError>;

    /// Delete an agent record. Returns false if it did not exist.
    fn remove_agent(&self, name: &str) -> Result<bool, StoreError>;

    /// All agent records, sorted by name.
    fn list_agents(&self) -> Result<Vec<AgentState>, StoreError>;

    /// Create a session only if the agent has none.
    ///
    /// Fails with [`StoreError::SessionExists`] otherwise. This is the only
    /// cross-process synchronization point and must be atomic.
    fn create_session(&self, session: &AgentSession) -> Result<(), StoreError>;

    /// Load the session for an agent, `None` if unclaimed.
    fn load_session(&self, agent: &str) -> Result<Option<AgentSession>, StoreError>;

    /// Delete the session for an agent. Returns false if there was none.
    fn delete_session(&self, agent: &str) -> Result<bool, StoreError>;

    /// All live session records, sorted by agent name.
    fn list_sessions(&self) -> Result<Vec<AgentSession>, StoreError>;

    /// Load, modify and replace an agent record in one step.
    ///
    /// Returns `None` without calling `f` if the agent does not exist.
    fn update_agent<F>(&self, name: &str, f: F) -> Result<Option<AgentState>, StoreError>
    where
        F: FnOnce(&mut AgentState),
        Self: Sized,
    {
        let Some(mut state) = self.load_agent(name)? else {
            return Ok(None);
        };
        f(&mut state);
        self.save_agent(&state)?;
        Ok(Some(state))
    }
}

impl<T: StateStore + ?Sized> StateStore for &T {
    fn load_agent(&self, name: &str) -> Result<Option<AgentState>, StoreError> {
        (**self).load_agent(name)
    }

    fn save_agent(&self, state: &AgentState) -> Result<(), StoreError> {
        (**self).save_agent(state)
    }

    fn remove_agent(&self, name: &str) -> Result<bool, StoreError> {
        (**self).remove_agent(name)
    }

    fn list_agents(&self) -> Result<Vec<AgentState>, StoreError> {
        (**self).list_agents()
    }

    fn create_session(&self, session: &AgentSession) -> Result<(), StoreError> {
        (**self).create_session(session)
    }

    fn load_session(&self, agent: &str) -> Result<Option<AgentSession>, StoreError> {
        (**self).load_session(agent)
    }

    fn delete_session(&self, agent: &str) -> Result<bool, StoreError> {
        (**self).delete_session(agent)
    }

    fn list_sessions(&self) -> Result<Vec<AgentSession>, StoreError> {
        (**self).list_sessions()
    }
}

/// On-disk form of an agent record: the state plus its derived status,
/// which is written for humans and ignored when read back.
#[derive(Serialize)]
struct AgentDocument<'a> {
    #[serde(flatten)]
    state: &'a AgentState,
    status: AgentStatus,
}

/// JSON-document store rooted at a state directory (normally `.warden/`).
#[derive(Clone, Debug)]
pub struct FsStateStore {
    agents_dir: PathBuf,
    sessions_dir: PathBuf,
}

impl FsStateStore {
    /// Create a store rooted at `state_dir`.
    pub fn new(state_dir: impl AsRef<Path>) -> Self {
        let state_dir = state_dir.as_ref();
        Self {
            agents_dir: state_dir.join("agents"),
            sessions_dir: state_dir.join("sessions"),
        }
    }

    fn agent_path(&self, name: &str) -> Result<PathBuf, StoreError> {
        validate_agent_name(name)?;
        Ok(self.agents_dir.join(format!("{}.json", name)))
    }

    fn session_path(&self, agent: &str) -> Result<PathBuf, StoreError> {
        validate_agent_name(agent)?;
        Ok(self.sessions_dir.join(format!("{}.json", agent)))
    }

    fn ensure_dir(dir: &Path) -> Result<(), StoreError> {
        fs::create_dir_all(dir).map_err(|source| StoreError::Io {
            path: dir.to_path_buf(),
            source,
        })
    }

    /// Write `bytes` to a process-unique temp file next to `path`.
    fn write_temp(path: &Path, bytes: &[u8]) -> Result<PathBuf, StoreError> {
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let temp = path.with_file_name(format!(".{}.{}.tmp", file_name, std::process::id()));
        let io_err = |source| StoreError::Io {
            path: temp.clone(),
            source,
        };
        let mut file = fs::File::create(&temp).map_err(io_err)?;
        file.write_all(bytes).map_err(io_err)?;
        file.sync_all().map_err(io_err)?;
        Ok(temp)
    }

    fn read_document<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Option<T>, StoreError> {
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(StoreError::Io {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };
        serde_json::from_str(&content)
            .map(Some)
            .map_err(|source| StoreError::Parse {
                path: path.to_path_buf(),
                source,
            })
    }

    fn list_documents<T: serde::de::DeserializeOwned>(dir: &Path) -> Result<Vec<T>, StoreError> {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(StoreError::Io {
                    path: dir.to_path_buf(),
                    source,
                });
            }
        };

        let mut paths: Vec<PathBuf> = entries
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .filter(|path| {
                path.extension().is_some_and(|ext| ext == "json")
                    && !path
                        .file_name()
                        .is_some_and(|n| n.to_string_lossy().starts_with('.'))
            })
            .collect();
        paths.sort();

        let mut documents = Vec::with_capacity(paths.len());
        for path in paths {
            if let Some(doc) = Self::read_document(&path)? {
                documents.push(doc);
            }
        }
        Ok(documents)
    }

    fn remove_file(path: &Path) -> Result<bool, StoreError> {
        match fs::remove_file(path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(source) => Err(StoreError::Io {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    fn to_json<T: Serialize>(value: &T, path: &Path) -> Result<Vec<u8>, StoreError> {
        let mut bytes = serde_json::to_vec_pretty(value).map_err(|source| StoreError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        bytes.push(b'\n');
        Ok(bytes)
    }
}

impl StateStore for FsStateStore {
    fn load_agent(&self, name: &str) -> Result<Option<AgentState>, StoreError> {
        Self::read_document(&self.agent_path(name)?)
    }

    fn save_agent(&self, state: &AgentState) -> Result<(), StoreError> {
        let path = self.agent_path(&state.name)?;
        Self::ensure_dir(&self.agents_dir)?;

        let document = AgentDocument {
            state,
            status: state.status(),
        };
        let temp = Self::write_temp(&path, &Self::to_json(&document, &path)?)?;
        fs::rename(&temp, &path).map_err(|source| StoreError::Io { path, source })
    }

    fn remove_agent(&self, name: &str) -> Result<bool, StoreError> {
        Self::remove_file(&self.agent_path(name)?)
    }

    fn list_agents(&self) -> Result<Vec<AgentState>, StoreError> {
        Self::list_documents(&self.agents_dir)
    }

    fn create_session(&self, session: &AgentSession) -> Result<(), StoreError> {
        let path = self.session_path(&session.agent)?;
        Self::ensure_dir(&self.sessions_dir)?;

        // Write the full document first, then link it into place: link(2)
        // fails if the target exists, so readers never see a partial session.
        let temp = Self::write_temp(&path, &Self::to_json(session, &path)?)?;
        let linked = fs::hard_link(&temp, &path);
        let _ = fs::remove_file(&temp);

        match linked {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                Err(StoreError::SessionExists(session.agent.clone()))
            }
            Err(_) => {
                // Filesystems without hard links: fall back to create_new.
                let mut file = match OpenOptions::new().write(true).create_new(true).open(&path) {
                    Ok(file) => file,
                    Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                        return Err(StoreError::SessionExists(session.agent.clone()));
                    }
                    Err(source) => return Err(StoreError::Io { path, source }),
                };
                let bytes = Self::to_json(session, &path)?;
                file.write_all(&bytes)
                    .map_err(|source| StoreError::Io { path, source })
            }
        }
    }

    fn load_session(&self, agent: &str) -> Result<Option<AgentSession>, StoreError> {
        Self::read_document(&self.session_path(agent)?)
    }

    fn delete_session(&self, agent: &str) -> Result<bool, StoreError> {
        Self::remove_file(&self.session_path(agent)?)
    }

    fn list_sessions(&self) -> Result<Vec<AgentSession>, StoreError> {
        Self::list_documents(&self.sessions_dir)
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::state::{Role, SessionOwner};

    fn store() -> (tempfile::TempDir, FsStateStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = FsStateStore::new(dir.path().join(".warden"));
        (dir, store)
    }

    #[test]
    fn test_agent_save_and_load() {
        let (_dir, store) = store();
        assert!(store.load_agent("agent-1").unwrap().is_none());

        let mut state = AgentState::new("agent-1", "alice");
        state.role = Some(Role::CodeWriter);
        state.task = Some("T1".into());
        state.record_role("T1", Role::CodeWriter);
        store.save_agent(&state).unwrap();

        assert_eq!(store.load_agent("agent-1").unwrap(), Some(state));
    }

    #[test]
    fn test_agent_document_carries_status() {
        let (dir, store) = store();
        let mut state = AgentState::new("agent-1", "alice");
        state.role = Some(Role::Reviewer);
        store.save_agent(&state).unwrap();

        let raw =
            fs::read_to_string(dir.path().join(".warden/agents/agent-1.json")).unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value["status"], "working");
        assert_eq!(value["role"], "reviewer");
    }

    #[test]
    fn test_stale_status_field_is_ignored_on_load() {
        let (dir, store) = store();
        let agents = dir.path().join(".warden/agents");
        fs::create_dir_all(&agents).unwrap();
        fs::write(
            agents.join("agent-9.json"),
            r#"{"name":"agent-9","status":"working","assigned_human":"bob"}"#,
        )
        .unwrap();

        let state = store.load_agent("agent-9").unwrap().unwrap();
        assert_eq!(state.status(), AgentStatus::Free);
    }

    #[test]
    fn test_list_and_remove_agents() {
        let (_dir, store) = store();
        store.save_agent(&AgentState::new("b", "")).unwrap();
        store.save_agent(&AgentState::new("a", "")).unwrap();

        let names: Vec<_> = store
            .list_agents()
            .unwrap()
            .into_iter()
            .map(|s| s.name)
            .collect();
        assert_eq!(names, vec!["a", "b"]);

        assert!(store.remove_agent("a").unwrap());
        assert!(!store.remove_agent("a").unwrap());
        assert_eq!(store.list_agents().unwrap().len(), 1);
    }

    #[test]
    fn test_create_session_is_exclusive() {
        let (_dir, store) = store();
        let first = AgentSession::new("agent-1", &SessionOwner::process(100));
        let second = AgentSession::new("agent-1", &SessionOwner::process(200));

        store.create_session(&first).unwrap();
        match store.create_session(&second) {
            Err(StoreError::SessionExists(agent)) => assert_eq!(agent, "agent-1"),
            other => panic!("expected SessionExists, got {:?}", other),
        }

        let loaded = store.load_session("agent-1").unwrap().unwrap();
        assert_eq!(loaded.owner_pid, Some(100));

        assert!(store.delete_session("agent-1").unwrap());
        assert!(!store.delete_session("agent-1").unwrap());
        store.create_session(&second).unwrap();
    }

    #[test]
    fn test_invalid_names_rejected() {
        let (_dir, store) = store();
        assert!(matches!(
            store.load_agent("../escape"),
            Err(StoreError::InvalidName(_))
        ));
        assert!(matches!(
            store.save_agent(&AgentState::new("a/b", "")),
            Err(StoreError::InvalidName(_))
        ));
    }

    #[test]
    fn test_malformed_document_is_an_error() {
        let (dir, store) = store();
        let agents = dir.path().join(".warden/agents");
        fs::create_dir_all(&agents).unwrap();
        fs::write(agents.join("broken.json"), "{not json").unwrap();
        assert!(matches!(
            store.load_agent("broken"),
            Err(StoreError::Parse { .. })
        ));
    }

    #[test]
    fn test_update_agent() {
        let (_dir, store) = store();
        assert!(store.update_agent("ghost", |_| {}).unwrap().is_none());

        store.save_agent(&AgentState::new("agent-1", "")).unwrap();
        let updated = store
            .update_agent("agent-1", |s| s.task = Some("T9".into()))
            .unwrap()
            .unwrap();
        assert_eq!(updated.task.as_deref(), Some("T9"));
        assert_eq!(
            store.load_agent("agent-1").unwrap().unwrap().task.as_deref(),
            Some("T9")
        );
    }
}
