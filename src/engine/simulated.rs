//! In-process engine for tests and host development
//!
//! Behaves like the native engine at the ABI level: handles are opaque
//! addresses, nulls signal failure, and events queue per system until
//! polled. Events are injected by name so a test can script a stream
//! without a running exchange.

use super::{EngineFailure, NativeEngine};
use crate::types::{EventKind, OutboundEvent, RawEvent, RawHandle};
use bytes::Bytes;
use std::collections::{HashMap, VecDeque};
use std::num::NonZeroUsize;
use std::path::Path;
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

const FIRST_ADDR: usize = 0x1000;
const ADDR_STRIDE: usize = 0x10;

/// Call counters, including calls made with dead handles
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SimulatedStats {
    pub initialized: usize,
    pub shutdowns: usize,
    pub agents_created: usize,
    pub releases: usize,
    pub polls: usize,
    pub events_sent: usize,
    /// Calls that passed a handle the engine did not consider live
    pub misuse: usize,
}

/// An outbound event as received by the simulator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentEvent {
    pub agent: String,
    pub event: OutboundEvent,
}

struct SimSystem {
    bootstrap: String,
    queue: VecDeque<RawEvent>,
}

struct SimAgent {
    name: String,
    system: RawHandle,
}

#[derive(Default)]
struct SimState {
    allocated: usize,
    systems: HashMap<RawHandle, SimSystem>,
    agents: HashMap<RawHandle, SimAgent>,
    // Latest handle per name and its owner; survives release so tests can
    // script events that were in flight when an agent went away.
    names: HashMap<String, (RawHandle, RawHandle)>,
    sent: Vec<SentEvent>,
    fail_next_initialize: Option<EngineFailure>,
    fail_next_create: Option<EngineFailure>,
    last_error: Option<EngineFailure>,
    stats: SimulatedStats,
}

impl SimState {
    fn allocate(&mut self) -> RawHandle {
        let addr = FIRST_ADDR + self.allocated * ADDR_STRIDE;
        self.allocated += 1;
        RawHandle::from(NonZeroUsize::MIN.saturating_add(addr - 1))
    }
}

/// Deterministic in-memory `NativeEngine`
#[derive(Default)]
pub struct SimulatedEngine {
    state: Mutex<SimState>,
    ready: Condvar,
    check_bootstrap: bool,
}

impl SimulatedEngine {
    /// Engine that accepts any bootstrap path
    pub fn new() -> Self {
        Self::default()
    }

    /// Engine that requires the bootstrap path to name a readable JSON file
    pub fn with_bootstrap_check() -> Self {
        Self {
            check_bootstrap: true,
            ..Self::default()
        }
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Make the next `initialize` return null with this failure
    pub fn fail_next_initialize(&self, failure: EngineFailure) {
        self.lock().fail_next_initialize = Some(failure);
    }

    /// Make the next `create_bidding_agent` return null with this failure
    pub fn fail_next_create(&self, failure: EngineFailure) {
        self.lock().fail_next_create = Some(failure);
    }

    /// Queue an event with an arbitrary kind tag for the named agent
    ///
    /// Returns false if no agent of that name was ever created or its
    /// system has shut down.
    pub fn inject_tag(&self, agent: &str, tag: i32, id: i64, payload: impl Into<Bytes>) -> bool {
        let mut state = self.lock();
        let Some(&(subject, system)) = state.names.get(agent) else {
            return false;
        };
        let Some(sys) = state.systems.get_mut(&system) else {
            return false;
        };

        sys.queue.push_back(RawEvent {
            kind: tag,
            subject,
            id,
            payload: payload.into(),
        });
        drop(state);
        self.ready.notify_all();
        true
    }

    /// Queue an event of a known kind for the named agent
    pub fn inject(&self, agent: &str, kind: EventKind, id: i64, payload: impl Into<Bytes>) -> bool {
        self.inject_tag(agent, kind as i32, id, payload)
    }

    /// Queue a bid request for the named agent
    pub fn inject_bid_request(&self, agent: &str, id: i64, payload: impl Into<Bytes>) -> bool {
        self.inject(agent, EventKind::BidRequest, id, payload)
    }

    /// Events still queued across all systems
    pub fn pending(&self) -> usize {
        self.lock().systems.values().map(|s| s.queue.len()).sum()
    }

    /// Outbound events received so far, oldest first
    pub fn sent_events(&self) -> Vec<SentEvent> {
        self.lock().sent.clone()
    }

    /// Names of the agents the engine currently holds
    pub fn live_agents(&self) -> Vec<String> {
        let state = self.lock();
        let mut names: Vec<String> = state.agents.values().map(|a| a.name.clone()).collect();
        names.sort();
        names
    }

    /// Number of live system instances
    pub fn live_systems(&self) -> usize {
        self.lock().systems.len()
    }

    /// Bootstrap path a live system was created from
    pub fn bootstrap_of(&self, system: RawHandle) -> Option<String> {
        self.lock().systems.get(&system).map(|s| s.bootstrap.clone())
    }

    pub fn stats(&self) -> SimulatedStats {
        self.lock().stats
    }

    fn check_bootstrap_file(path: &str) -> Result<(), EngineFailure> {
        let content = std::fs::read_to_string(Path::new(path))
            .map_err(|e| EngineFailure::new(2, format!("cannot read bootstrap {}: {}", path, e)))?;
        serde_json::from_str::<serde_json::Value>(&content)
            .map_err(|e| EngineFailure::new(22, format!("invalid bootstrap {}: {}", path, e)))?;
        Ok(())
    }
}

impl NativeEngine for SimulatedEngine {
    fn initialize(&self, bootstrap: &str) -> Option<RawHandle> {
        let mut state = self.lock();
        if let Some(failure) = state.fail_next_initialize.take() {
            state.last_error = Some(failure);
            return None;
        }
        if self.check_bootstrap {
            if let Err(failure) = Self::check_bootstrap_file(bootstrap) {
                state.last_error = Some(failure);
                return None;
            }
        }

        let handle = state.allocate();
        state.systems.insert(
            handle,
            SimSystem {
                bootstrap: bootstrap.to_string(),
                queue: VecDeque::new(),
            },
        );
        state.stats.initialized += 1;
        Some(handle)
    }

    unsafe fn shutdown(&self, system: RawHandle) {
        let mut state = self.lock();
        if state.systems.remove(&system).is_none() {
            state.stats.misuse += 1;
            return;
        }
        // Agents still alive here leak in the real engine; count it.
        let leaked = state.agents.values().filter(|a| a.system == system).count();
        state.stats.misuse += leaked;
        state.agents.retain(|_, a| a.system != system);
        state.names.retain(|_, (_, owner)| *owner != system);
        state.stats.shutdowns += 1;
        drop(state);
        self.ready.notify_all();
    }

    unsafe fn create_bidding_agent(&self, system: RawHandle, name: &str) -> Option<RawHandle> {
        let mut state = self.lock();
        if !state.systems.contains_key(&system) {
            state.stats.misuse += 1;
            state.last_error = Some(EngineFailure::new(9, "unknown system handle"));
            return None;
        }
        if let Some(failure) = state.fail_next_create.take() {
            state.last_error = Some(failure);
            return None;
        }

        let handle = state.allocate();
        state.agents.insert(
            handle,
            SimAgent {
                name: name.to_string(),
                system,
            },
        );
        state.names.insert(name.to_string(), (handle, system));
        state.stats.agents_created += 1;
        Some(handle)
    }

    unsafe fn release(&self, agent: RawHandle) {
        let mut state = self.lock();
        if state.agents.remove(&agent).is_none() {
            state.stats.misuse += 1;
            return;
        }
        state.stats.releases += 1;
    }

    unsafe fn poll_next_event(&self, system: RawHandle, timeout: Duration) -> Option<RawEvent> {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock();
        state.stats.polls += 1;

        loop {
            let Some(sys) = state.systems.get_mut(&system) else {
                state.stats.misuse += 1;
                return None;
            };
            if let Some(event) = sys.queue.pop_front() {
                return Some(event);
            }

            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            state = self
                .ready
                .wait_timeout(state, deadline - now)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|e| e.into_inner().0);
        }
    }

    unsafe fn send_event(&self, agent: RawHandle, event: &OutboundEvent) {
        let mut state = self.lock();
        let Some(name) = state.agents.get(&agent).map(|a| a.name.clone()) else {
            state.stats.misuse += 1;
            return;
        };
        state.sent.push(SentEvent {
            agent: name,
            event: event.clone(),
        });
        state.stats.events_sent += 1;
    }

    fn last_error(&self) -> Option<EngineFailure> {
        self.lock().last_error.clone()
    }

    fn name(&self) -> &str {
        "simulated"
    }
}
