use super::state::AgentStatus;
use crate::agent::Capability;
use crate::config::AgentConfig;
use dashmap::mapref::entry::Entry;
use dashmap::mapref::one::RefMut;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// A spawned run of an agent
pub(crate) struct RunHandle {
    pub cancel: CancellationToken,
    pub join: JoinHandle<()>,
    pub generation: u64,
}

pub(crate) struct AgentSlot {
    pub config: AgentConfig,
    pub capability: Arc<dyn Capability>,
    pub status: Arc<RwLock<AgentStatus>>,
    pub run: Option<RunHandle>,
}

/// Registered agents keyed by id.
///
/// Guards from this map are never held across an `.await`; callers copy out
/// what they need first.
pub struct AgentRegistry {
    agents: DashMap<String, AgentSlot>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self {
            agents: DashMap::new(),
        }
    }

    /// Returns false if the id is already taken
    pub fn register(&self, config: AgentConfig, capability: Arc<dyn Capability>) -> bool {
        match self.agents.entry(config.id.clone()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(vacant) => {
                let status = AgentStatus::new(&config.id, &config.kind, config.retry_budget);
                vacant.insert(AgentSlot {
                    config,
                    capability,
                    status: Arc::new(RwLock::new(status)),
                    run: None,
                });
                true
            }
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.agents.contains_key(id)
    }

    /// Sorted agent ids
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.agents.iter().map(|entry| entry.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn status(&self, id: &str) -> Option<AgentStatus> {
        self.agents.get(id).map(|slot| slot.status.read().clone())
    }

    /// Status of every agent, sorted by id
    pub fn statuses(&self) -> Vec<AgentStatus> {
        let mut statuses: Vec<AgentStatus> = self
            .agents
            .iter()
            .map(|entry| entry.value().status.read().clone())
            .collect();
        statuses.sort_by(|a, b| a.id.cmp(&b.id));
        statuses
    }

    pub(crate) fn get_mut(&self, id: &str) -> Option<RefMut<'_, String, AgentSlot>> {
        self.agents.get_mut(id)
    }
}

impl Default for AgentRegistry {
    fn default() -> Self {
        Self::new()
    }
}
