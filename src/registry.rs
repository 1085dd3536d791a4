//! Agent registry: agent name → handler, scoped to one system

use crate::error::{BridgeError, Result};
use crate::handler::BiddingAgentHandler;
use std::collections::HashMap;
use std::sync::Arc;

/// Handlers keyed by agent name
///
/// Not synchronized on its own; the owning system serializes access
/// together with the lifecycle state.
#[derive(Default)]
pub struct AgentRegistry {
    handlers: HashMap<String, Arc<dyn BiddingAgentHandler>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a handler for `name`
    pub fn register(&mut self, name: &str, handler: Arc<dyn BiddingAgentHandler>) -> Result<()> {
        if self.handlers.contains_key(name) {
            return Err(BridgeError::DuplicateAgentName(format!(
                "handler already registered for agent '{}'",
                name
            )));
        }
        self.handlers.insert(name.to_string(), handler);
        Ok(())
    }

    /// Remove and return the handler for `name`
    pub fn unregister(&mut self, name: &str) -> Result<Arc<dyn BiddingAgentHandler>> {
        self.handlers.remove(name).ok_or_else(|| {
            BridgeError::NotFound(format!("no handler registered for agent '{}'", name))
        })
    }

    /// Handler for `name`, cloned out so it can be invoked without the lock
    pub fn get(&self, name: &str) -> Option<Arc<dyn BiddingAgentHandler>> {
        self.handlers.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Registered agent names, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }

    /// Drop every handler
    pub fn clear(&mut self) {
        self.handlers.clear();
    }
}

impl std::fmt::Debug for AgentRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentRegistry")
            .field("agents", &self.names())
            .finish()
    }
}
