//! In-memory state store.

use std::collections::BTreeMap;
use std::sync::RwLock;

use super::store::{StateStore, StoreError, validate_agent_name};
use super::{AgentSession, AgentState};

/// A [`StateStore`] kept entirely in memory.
///
/// Useful for tests and for embedding the guard in a long-running host that
/// persists state elsewhere.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    agents: RwLock<BTreeMap<String, AgentState>>,
    sessions: RwLock<BTreeMap<String, AgentSession>>,
}

impl MemoryStateStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store pre-populated with agent records.
    pub fn with_agents(agents: impl IntoIterator<Item = AgentState>) -> Self {
        let store = Self::new();
        if let Ok(mut guard) = store.agents.write() {
            for agent in agents {
                guard.insert(agent.name.clone(), agent);
            }
        }
        store
    }
}

impl StateStore for MemoryStateStore {
    fn load_agent(&self, name: &str) -> Result<Option<AgentState>, StoreError> {
        validate_agent_name(name)?;
        let agents = self.agents.read().map_err(|_| StoreError::Poisoned)?;
        Ok(agents.get(name).cloned())
    }

    fn save_agent(&self, state: &AgentState) -> Result<(), StoreError> {
        validate_agent_name(&state.name)?;
        let mut agents = self.agents.write().map_err(|_| StoreError::Poisoned)?;
        agents.insert(state.name.clone(), state.clone());
        Ok(())
    }

    fn remove_agent(&self, name: &str) -> Result<bool, StoreError> {
        let mut agents = self.agents.write().map_err(|_| StoreError::Poisoned)?;
        Ok(agents.remove(name).is_some())
    }

    fn list_agents(&self) -> Result<Vec<AgentState>, StoreError> {
        let agents = self.agents.read().map_err(|_| StoreError::Poisoned)?;
        Ok(agents.values().cloned().collect())
    }

    fn create_session(&self, session: &AgentSession) -> Result<(), StoreError> {
        validate_agent_name(&session.agent)?;
        let mut sessions = self.sessions.write().map_err(|_| StoreError::Poisoned)?;
        if sessions.contains_key(&session.agent) {
            return Err(StoreError::SessionExists(session.agent.clone()));
        }
        sessions.insert(session.agent.clone(), session.clone());
        Ok(())
    }

    fn load_session(&self, agent: &str) -> Result<Option<AgentSession>, StoreError> {
        let sessions = self.sessions.read().map_err(|_| StoreError::Poisoned)?;
        Ok(sessions.get(agent).cloned())
    }

    fn delete_session(&self, agent: &str) -> Result<bool, StoreError> {
        let mut sessions = self.sessions.write().map_err(|_| StoreError::Poisoned)?;
        Ok(sessions.remove(agent).is_some())
    }

    fn list_sessions(&self) -> Result<Vec<AgentSession>, StoreError> {
        let sessions = self.sessions.read().map_err(|_| StoreError::Poisoned)?;
        Ok(sessions.values().cloned().collect())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::state::SessionOwner;

    #[test]
    fn test_memory_store_sessions_are_exclusive() {
        let store = MemoryStateStore::new();
        let session = AgentSession::new("agent-1", &SessionOwner::session("s1"));
        store.create_session(&session).unwrap();
        assert!(matches!(
            store.create_session(&session),
            Err(StoreError::SessionExists(_))
        ));
        assert_eq!(store.list_sessions().unwrap().len(), 1);
        assert!(store.delete_session("agent-1").unwrap());
        assert!(store.list_sessions().unwrap().is_empty());
    }

    #[test]
    fn test_with_agents() {
        let store = MemoryStateStore::with_agents([
            AgentState::new("agent-2", "bob"),
            AgentState::new("agent-1", "alice"),
        ]);
        let names: Vec<_> = store
            .list_agents()
            .unwrap()
            .into_iter()
            .map(|a| a.name)
            .collect();
        assert_eq!(names, vec!["agent-1", "agent-2"]);
        assert_eq!(
            store.load_agent("agent-2").unwrap().unwrap().assigned_human,
            "bob"
        );
    }
}
