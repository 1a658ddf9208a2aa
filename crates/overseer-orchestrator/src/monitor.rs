use crate::types::{AgentCapabilities, AgentRegistration, AgentStatus, TaskId};
use chrono::Utc;
use overseer_core::{OverseerError, OverseerResult};
use std::collections::{BTreeSet, HashMap};
use tracing::{debug, info};

/// Registry of agents known to the orchestrator, with their reservations
/// and outcome metrics.
///
/// Not synchronized on its own; the orchestrator keeps it inside its state
/// lock so that reservations and task transitions change together.
#[derive(Debug, Default)]
pub struct AgentMonitor {
    agents: HashMap<String, AgentRegistration>,
}

impl AgentMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, caps: AgentCapabilities) -> OverseerResult<()> {
        if self.agents.contains_key(&caps.agent_id) {
            return Err(OverseerError::AgentAlreadyRegistered(caps.agent_id));
        }
        info!(
            agent_id = %caps.agent_id,
            role = %caps.role,
            capabilities = ?caps.capabilities,
            "Agent registered"
        );
        let reg = AgentRegistration::new(caps);
        self.agents.insert(reg.agent_id.clone(), reg);
        Ok(())
    }

    pub fn unregister(&mut self, agent_id: &str) -> Option<AgentRegistration> {
        let removed = self.agents.remove(agent_id);
        if removed.is_some() {
            info!(agent_id = %agent_id, "Agent unregistered");
        }
        removed
    }

    pub fn contains(&self, agent_id: &str) -> bool {
        self.agents.contains_key(agent_id)
    }

    pub fn get(&self, agent_id: &str) -> Option<&AgentRegistration> {
        self.agents.get(agent_id)
    }

    /// Pick an eligible agent for `required`, preferring the one that has
    /// been assigned the fewest tasks.
    pub fn find_eligible(&self, required: &BTreeSet<String>) -> Option<String> {
        self.agents
            .values()
            .filter(|a| a.is_eligible(required))
            .min_by(|a, b| {
                a.metrics
                    .tasks_assigned
                    .cmp(&b.metrics.tasks_assigned)
                    .then_with(|| a.agent_id.cmp(&b.agent_id))
            })
            .map(|a| a.agent_id.clone())
    }

    /// Whether any registered agent declares `required`, regardless of status.
    pub fn any_declares(&self, required: &BTreeSet<String>) -> bool {
        self.agents.values().any(|a| a.declares(required))
    }

    pub fn reserve(&mut self, agent_id: &str, task_id: TaskId) {
        if let Some(agent) = self.agents.get_mut(agent_id) {
            agent.current_task = Some(task_id);
            agent.metrics.tasks_assigned += 1;
        }
    }

    /// Drop a reservation without counting an outcome.
    pub fn cancel_reservation(&mut self, agent_id: &str, task_id: TaskId) {
        if let Some(agent) = self.agents.get_mut(agent_id) {
            if agent.current_task == Some(task_id) {
                agent.current_task = None;
                agent.metrics.tasks_assigned = agent.metrics.tasks_assigned.saturating_sub(1);
            }
        }
    }

    /// Release a reservation and record how the task ended.
    pub fn release(&mut self, agent_id: &str, task_id: TaskId, succeeded: bool, latency_ms: u64) {
        let Some(agent) = self.agents.get_mut(agent_id) else {
            return;
        };
        if agent.current_task == Some(task_id) {
            agent.current_task = None;
        }
        if succeeded {
            agent.metrics.tasks_completed += 1;
        } else {
            agent.metrics.tasks_failed += 1;
        }
        agent.metrics.total_latency_ms += latency_ms;
        agent.last_seen = Utc::now();
        debug!(
            agent_id = %agent_id,
            task_id = %task_id,
            succeeded,
            latency_ms,
            "Agent reservation released"
        );
    }

    /// Clear a reservation whose task left the agent without an outcome
    /// (cancelled or reaped).
    pub fn clear(&mut self, agent_id: &str, task_id: TaskId) {
        if let Some(agent) = self.agents.get_mut(agent_id) {
            if agent.current_task == Some(task_id) {
                agent.current_task = None;
            }
        }
    }

    pub fn set_status(&mut self, agent_id: &str, status: AgentStatus) -> bool {
        match self.agents.get_mut(agent_id) {
            Some(agent) => {
                if agent.status != status {
                    debug!(agent_id = %agent_id, from = ?agent.status, to = ?status, "Agent status");
                }
                agent.status = status;
                agent.last_seen = Utc::now();
                true
            }
            None => false,
        }
    }

    /// Registrations sorted by agent id.
    pub fn snapshot(&self) -> Vec<AgentRegistration> {
        let mut list: Vec<AgentRegistration> = self.agents.values().cloned().collect();
        list.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        list
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }
}
