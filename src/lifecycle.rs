//! Lifecycle manager: handle state machine for one system
//!
//! Every handle moves `Uninitialized -> Active -> Released` and never back.
//! All checks happen here, before the proxy issues a native call, so a
//! released or unknown handle is rejected instead of dereferenced.
//!
//! Only active agents are tracked. A released agent's record is dropped at
//! release or shutdown; whether it was released explicitly is remembered by
//! its owning `BiddingAgent` handle.

use crate::error::{BridgeError, Result};
use crate::types::{AgentId, HandleState, RawHandle, SystemId};
use std::collections::HashMap;

/// Why an agent handle reached `Released`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseCause {
    /// The host released it
    Explicit,
    /// Its system shut down while it was still active
    Shutdown,
}

#[derive(Debug)]
struct AgentRecord {
    name: String,
    raw: RawHandle,
}

/// An agent invalidated by shutdown that still needs its native release
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrphanedAgent {
    pub id: AgentId,
    pub name: String,
    pub raw: RawHandle,
}

/// State machine for a system handle and the agents active under it
#[derive(Debug)]
pub struct LifecycleManager {
    system: SystemId,
    state: HandleState,
    agents: HashMap<AgentId, AgentRecord>,
    active_by_name: HashMap<String, AgentId>,
    active_by_raw: HashMap<RawHandle, AgentId>,
    warnings: Vec<String>,
}

impl LifecycleManager {
    pub fn new(system: SystemId) -> Self {
        Self {
            system,
            state: HandleState::Uninitialized,
            agents: HashMap::new(),
            active_by_name: HashMap::new(),
            active_by_raw: HashMap::new(),
            warnings: Vec::new(),
        }
    }

    pub fn system_id(&self) -> &SystemId {
        &self.system
    }

    pub fn system_state(&self) -> HandleState {
        self.state
    }

    /// Move the system to `Active` once the native bootstrap succeeded
    pub fn activate(&mut self) -> Result<()> {
        if self.state != HandleState::Uninitialized {
            return Err(BridgeError::InvalidHandle(format!(
                "system {} cannot be activated from state {}",
                self.system, self.state
            )));
        }
        self.state = HandleState::Active;
        Ok(())
    }

    /// Fail unless the system accepts operations
    pub fn ensure_system_active(&self) -> Result<()> {
        match self.state {
            HandleState::Active => Ok(()),
            HandleState::Released => Err(BridgeError::UseAfterFree(format!(
                "system {} has been shut down",
                self.system
            ))),
            HandleState::Uninitialized => Err(BridgeError::InvalidHandle(format!(
                "system {} is not initialized",
                self.system
            ))),
        }
    }

    /// Check that a new agent named `name` may be created
    pub fn check_agent_name(&self, name: &str) -> Result<()> {
        self.ensure_system_active()?;
        if self.active_by_name.contains_key(name) {
            return Err(BridgeError::DuplicateAgentName(name.to_string()));
        }
        Ok(())
    }

    /// Record a freshly created native agent as `Active`
    pub fn admit_agent(&mut self, name: &str, raw: RawHandle) -> Result<AgentId> {
        self.check_agent_name(name)?;

        let id = AgentId::generate();
        self.agents.insert(
            id.clone(),
            AgentRecord {
                name: name.to_string(),
                raw,
            },
        );
        self.active_by_name.insert(name.to_string(), id.clone());
        self.active_by_raw.insert(raw, id.clone());
        Ok(id)
    }

    /// Whether `id` is an active agent of this system
    pub fn is_active_agent(&self, id: &AgentId) -> bool {
        self.state == HandleState::Active && self.agents.contains_key(id)
    }

    /// Number of agents currently tracked
    pub fn agent_count(&self) -> usize {
        self.agents.len()
    }

    /// Native handle of an agent that is still `Active`
    ///
    /// Every agent of a shut-down system fails with `UseAfterFree`; an id the
    /// system does not track as active fails with `InvalidHandle`.
    pub fn require_active_agent(&self, id: &AgentId) -> Result<RawHandle> {
        self.ensure_system_active()?;
        self.agents.get(id).map(|record| record.raw).ok_or_else(|| {
            BridgeError::InvalidHandle(format!(
                "agent {} is not active in system {}",
                id, self.system
            ))
        })
    }

    /// Forget an agent after its native release succeeded
    ///
    /// Returns the agent name.
    pub fn complete_release(&mut self, id: &AgentId) -> Option<String> {
        let record = self.agents.remove(id)?;
        self.active_by_name.remove(&record.name);
        if self.active_by_raw.get(&record.raw) == Some(id) {
            self.active_by_raw.remove(&record.raw);
        }
        Some(record.name)
    }

    /// Active agent behind a native event subject
    pub fn subject_agent(&self, raw: RawHandle) -> Option<(&AgentId, &str)> {
        let id = self.active_by_raw.get(&raw)?;
        self.agents.get(id).map(|r| (id, r.name.as_str()))
    }

    /// Name of the active agent behind a native event subject
    pub fn resolve_subject(&self, raw: RawHandle) -> Option<&str> {
        self.subject_agent(raw).map(|(_, name)| name)
    }

    /// Whether an active agent of this name exists
    pub fn is_active_name(&self, name: &str) -> bool {
        self.active_by_name.contains_key(name)
    }

    /// Active agent names, sorted
    pub fn active_agents(&self) -> Vec<String> {
        let mut names: Vec<String> = self.active_by_name.keys().cloned().collect();
        names.sort();
        names
    }

    /// Move the system to `Released` and hand back every active agent
    ///
    /// Never blocked by un-released agents: they are invalidated, a warning
    /// is recorded for each, and they are returned so their native handles
    /// can be freed before the system itself. A second call fails with
    /// `InvalidHandle`.
    pub fn begin_shutdown(&mut self) -> Result<Vec<OrphanedAgent>> {
        match self.state {
            HandleState::Active => {}
            HandleState::Released => {
                return Err(BridgeError::InvalidHandle(format!(
                    "system {} already shut down",
                    self.system
                )))
            }
            HandleState::Uninitialized => {
                return Err(BridgeError::InvalidHandle(format!(
                    "system {} is not initialized",
                    self.system
                )))
            }
        }
        self.state = HandleState::Released;

        let mut orphaned = Vec::with_capacity(self.agents.len());
        for (id, record) in self.agents.drain() {
            tracing::warn!(
                agent = %record.name,
                system = %self.system,
                "Agent implicitly released at shutdown"
            );
            self.warnings.push(format!(
                "agent '{}' ({}) was not released before shutdown of {}",
                record.name, id, self.system
            ));
            orphaned.push(OrphanedAgent {
                id,
                name: record.name,
                raw: record.raw,
            });
        }
        self.active_by_name.clear();
        self.active_by_raw.clear();

        orphaned.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(orphaned)
    }

    /// Warnings recorded for implicit releases
    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }
}
