//! Host-facing system and agent handles
//!
//! `RtbSystem` owns one native engine instance together with its lifecycle
//! state and agent registry. Both live under a single mutex so lifecycle
//! mutations are serialized and the dispatcher never sees a torn registry.
//! `BiddingAgent` is an owned handle that releases its native agent on drop
//! unless it was released explicitly or invalidated by shutdown.

use crate::config::BridgeConfig;
use crate::dispatch::{DispatchStats, Dispatcher};
use crate::engine::NativeEngine;
use crate::error::{BridgeError, Result};
use crate::handler::BiddingAgentHandler;
use crate::lifecycle::{LifecycleManager, ReleaseCause};
use crate::proxy::EngineProxy;
use crate::registry::AgentRegistry;
use crate::skipped::{MemorySkippedEvents, SkippedEventSink};
use crate::types::{AgentId, Bid, HandleState, OutboundEvent, SystemId};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;

/// Lifecycle state and handlers, guarded together
pub(crate) struct SystemState {
    pub(crate) lifecycle: LifecycleManager,
    pub(crate) registry: AgentRegistry,
}

/// State shared by the system, its agents, and the dispatch loop
pub(crate) struct SystemShared {
    pub(crate) id: SystemId,
    pub(crate) proxy: EngineProxy,
    pub(crate) config: BridgeConfig,
    pub(crate) skipped: Arc<dyn SkippedEventSink>,
    state: Mutex<SystemState>,
}

impl SystemShared {
    pub(crate) fn lock(&self) -> Result<MutexGuard<'_, SystemState>> {
        self.state
            .lock()
            .map_err(|e| BridgeError::Lock(format!("system {}: {}", self.id, e)))
    }

    fn create_agent(self: &Arc<Self>, name: &str) -> Result<BiddingAgent> {
        if name.is_empty() {
            return Err(BridgeError::Config("agent name must not be empty".to_string()));
        }

        let mut state = self.lock()?;
        state.lifecycle.check_agent_name(name)?;

        let raw = self.proxy.create_bidding_agent(name)?;
        let id = match state.lifecycle.admit_agent(name, raw) {
            Ok(id) => id,
            Err(e) => {
                // Unreachable while the lock is held, but never leak the native agent.
                if let Err(release_err) = self.proxy.release(raw) {
                    tracing::warn!(
                        agent = %name,
                        error = %release_err,
                        "Failed to release rejected agent"
                    );
                }
                return Err(e);
            }
        };
        drop(state);

        tracing::info!(
            system = %self.id,
            agent = %name,
            agent_id = %id,
            "Bidding agent created"
        );

        Ok(BiddingAgent {
            id,
            name: name.to_string(),
            system: Arc::clone(self),
            released: AtomicBool::new(false),
        })
    }

    /// Release an agent, recording the explicit release in `released`
    ///
    /// The flag is read and written only under the state lock.
    fn release_agent(&self, id: &AgentId, released: &AtomicBool) -> Result<()> {
        let mut state = self.lock()?;
        if released.load(Ordering::SeqCst) {
            return Err(BridgeError::InvalidHandle(format!("agent {} already released", id)));
        }
        let raw = state.lifecycle.require_active_agent(id)?;
        self.proxy.release(raw)?;
        released.store(true, Ordering::SeqCst);

        let handler = match state.lifecycle.complete_release(id) {
            Some(name) => {
                tracing::info!(
                    system = %self.id,
                    agent = %name,
                    agent_id = %id,
                    "Bidding agent released"
                );
                state.registry.unregister(&name).ok()
            }
            None => None,
        };
        drop(state);

        // Handler destructors run outside the lock.
        drop(handler);
        Ok(())
    }

    /// Release path for `Drop`: silent if the agent is no longer active
    fn release_on_drop(&self, id: &AgentId, released: &AtomicBool) {
        let active = match self.lock() {
            Ok(state) => {
                !released.load(Ordering::SeqCst) && state.lifecycle.is_active_agent(id)
            }
            Err(e) => {
                tracing::warn!(agent_id = %id, error = %e, "Cannot release dropped agent");
                return;
            }
        };
        if !active {
            return;
        }

        tracing::debug!(system = %self.id, agent_id = %id, "Releasing dropped agent");
        if let Err(e) = self.release_agent(id, released) {
            tracing::warn!(agent_id = %id, error = %e, "Failed to release dropped agent");
        }
    }

    /// Send on behalf of an agent known only by id
    pub(crate) fn send(&self, id: &AgentId, event: &OutboundEvent) -> Result<()> {
        self.send_checked(id, None, event)
    }

    fn send_checked(
        &self,
        id: &AgentId,
        released: Option<&AtomicBool>,
        event: &OutboundEvent,
    ) -> Result<()> {
        let state = self.lock()?;
        if released.is_some_and(|flag| flag.load(Ordering::SeqCst)) {
            return Err(BridgeError::UseAfterFree(format!("agent {} has been released", id)));
        }
        let raw = state.lifecycle.require_active_agent(id)?;
        self.proxy.send_event(raw, event)?;
        drop(state);

        tracing::debug!(agent_id = %id, kind = ?event.kind(), "Event sent");
        Ok(())
    }

    fn shutdown(&self) -> Result<()> {
        let mut state = self.lock()?;
        let orphaned = state.lifecycle.begin_shutdown()?;

        for agent in &orphaned {
            if let Err(e) = self.proxy.release(agent.raw) {
                tracing::warn!(
                    agent = %agent.name,
                    error = %e,
                    "Failed to release agent at shutdown"
                );
            }
        }
        let result = self.proxy.shutdown();
        let registry = std::mem::take(&mut state.registry);
        drop(state);
        drop(registry);

        tracing::info!(
            system = %self.id,
            implicit_releases = orphaned.len(),
            "System shut down"
        );
        result
    }
}

struct DispatchTask {
    cancel: CancellationToken,
    handle: tokio::task::JoinHandle<Result<DispatchStats>>,
}

/// One native engine instance and everything created under it
pub struct RtbSystem {
    shared: Arc<SystemShared>,
    dispatch: Mutex<Option<DispatchTask>>,
}

impl RtbSystem {
    /// Bootstrap an engine with the default configuration
    pub fn initialize(engine: Arc<dyn NativeEngine>, bootstrap: &str) -> Result<Self> {
        Self::initialize_with_config(engine, bootstrap, BridgeConfig::default())
    }

    /// Bootstrap an engine with explicit dispatch settings
    pub fn initialize_with_config(
        engine: Arc<dyn NativeEngine>,
        bootstrap: &str,
        config: BridgeConfig,
    ) -> Result<Self> {
        let sink = Arc::new(MemorySkippedEvents::new(config.skipped_capacity));
        Self::initialize_with_sink(engine, bootstrap, config, sink)
    }

    /// Bootstrap an engine, routing undelivered events to `skipped`
    pub fn initialize_with_sink(
        engine: Arc<dyn NativeEngine>,
        bootstrap: &str,
        config: BridgeConfig,
        skipped: Arc<dyn SkippedEventSink>,
    ) -> Result<Self> {
        config.validate()?;

        let id = SystemId::generate();
        let mut lifecycle = LifecycleManager::new(id.clone());
        let proxy = EngineProxy::initialize(engine, bootstrap)?;
        lifecycle.activate()?;

        tracing::info!(system = %id, engine = proxy.engine_name(), "System initialized");

        Ok(Self {
            shared: Arc::new(SystemShared {
                id,
                proxy,
                config,
                skipped,
                state: Mutex::new(SystemState {
                    lifecycle,
                    registry: AgentRegistry::new(),
                }),
            }),
            dispatch: Mutex::new(None),
        })
    }

    pub fn id(&self) -> &SystemId {
        &self.shared.id
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.shared.config
    }

    pub fn engine_name(&self) -> &str {
        self.shared.proxy.engine_name()
    }

    /// Lifecycle state of the system handle
    pub fn state(&self) -> Result<HandleState> {
        Ok(self.shared.lock()?.lifecycle.system_state())
    }

    /// Create a bidding agent; names are unique among active agents
    pub fn create_agent(&self, name: &str) -> Result<BiddingAgent> {
        self.shared.create_agent(name)
    }

    /// Release an agent explicitly
    ///
    /// A second release fails with `InvalidHandle`; an agent invalidated by
    /// shutdown fails with `UseAfterFree`.
    pub fn release_agent(&self, agent: &BiddingAgent) -> Result<()> {
        if agent.system.id != self.shared.id {
            return Err(BridgeError::InvalidHandle(format!(
                "agent '{}' belongs to system {}, not {}",
                agent.name, agent.system.id, self.shared.id
            )));
        }
        agent.release()
    }

    /// Register the handler for an active agent
    pub fn register_handler(
        &self,
        name: &str,
        handler: Arc<dyn BiddingAgentHandler>,
    ) -> Result<()> {
        let mut state = self.shared.lock()?;
        state.lifecycle.ensure_system_active()?;
        if !state.lifecycle.is_active_name(name) {
            return Err(BridgeError::NotFound(format!("no active agent named '{}'", name)));
        }
        state.registry.register(name, handler)?;

        tracing::info!(system = %self.shared.id, agent = %name, "Handler registered");
        Ok(())
    }

    /// Remove and return the handler for an agent
    pub fn unregister_handler(&self, name: &str) -> Result<Arc<dyn BiddingAgentHandler>> {
        let handler = self.shared.lock()?.registry.unregister(name)?;
        tracing::info!(system = %self.shared.id, agent = %name, "Handler unregistered");
        Ok(handler)
    }

    /// Agent names with a registered handler
    pub fn registered_handlers(&self) -> Result<Vec<String>> {
        Ok(self.shared.lock()?.registry.names())
    }

    /// Names of the agents currently active
    pub fn active_agents(&self) -> Result<Vec<String>> {
        Ok(self.shared.lock()?.lifecycle.active_agents())
    }

    /// Warnings recorded for agents implicitly released at shutdown
    pub fn warnings(&self) -> Result<Vec<String>> {
        Ok(self.shared.lock()?.lifecycle.warnings().to_vec())
    }

    /// Sink receiving undelivered events
    pub fn skipped(&self) -> &Arc<dyn SkippedEventSink> {
        &self.shared.skipped
    }

    /// Dispatcher for driving the event loop on the caller's thread
    pub fn dispatcher(&self) -> Dispatcher {
        Dispatcher::new(Arc::clone(&self.shared))
    }

    /// Start the dispatch loop on the tokio blocking pool
    ///
    /// Must be called from within a tokio runtime. Fails if a loop is
    /// already running for this system.
    pub fn run_dispatch_loop(&self) -> Result<()> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| BridgeError::Dispatch(format!("no tokio runtime: {}", e)))?;

        let mut slot = self
            .dispatch
            .lock()
            .map_err(|e| BridgeError::Lock(format!("dispatch slot: {}", e)))?;
        if let Some(task) = slot.as_ref() {
            if !task.handle.is_finished() {
                return Err(BridgeError::Dispatch(format!(
                    "dispatch loop already running for system {}",
                    self.shared.id
                )));
            }
        }
        self.shared.lock()?.lifecycle.ensure_system_active()?;

        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let dispatcher = self.dispatcher();
        let handle = runtime.spawn_blocking(move || dispatcher.run(&token));

        tracing::info!(system = %self.shared.id, "Dispatch loop started");
        *slot = Some(DispatchTask { cancel, handle });
        Ok(())
    }

    /// Whether a spawned dispatch loop is still running
    pub fn is_dispatching(&self) -> bool {
        self.dispatch
            .lock()
            .map(|slot| slot.as_ref().is_some_and(|t| !t.handle.is_finished()))
            .unwrap_or(false)
    }

    /// Signal the spawned loop to stop and wait for it
    ///
    /// Returns the loop's totals. Retrieved-but-undelivered events are
    /// handled per the configured `StopPolicy`.
    pub async fn stop_dispatch_loop(&self) -> Result<DispatchStats> {
        let task = self
            .dispatch
            .lock()
            .map_err(|e| BridgeError::Lock(format!("dispatch slot: {}", e)))?
            .take()
            .ok_or_else(|| {
                BridgeError::NotFound(format!("no dispatch loop for system {}", self.shared.id))
            })?;

        task.cancel.cancel();
        let stats = task
            .handle
            .await
            .map_err(|e| BridgeError::Dispatch(format!("dispatch loop failed: {}", e)))??;

        tracing::info!(system = %self.shared.id, ?stats, "Dispatch loop stopped");
        Ok(stats)
    }

    /// Shut the engine down
    ///
    /// Active agents are invalidated and released natively first. Not
    /// idempotent: a second call fails with `InvalidHandle`.
    pub fn shutdown(&self) -> Result<()> {
        if let Ok(slot) = self.dispatch.lock() {
            if let Some(task) = slot.as_ref() {
                task.cancel.cancel();
            }
        }
        self.shared.shutdown()
    }
}

impl Drop for RtbSystem {
    fn drop(&mut self) {
        if let Ok(mut slot) = self.dispatch.lock() {
            if let Some(task) = slot.take() {
                task.cancel.cancel();
            }
        }

        let active = self
            .shared
            .lock()
            .map(|state| state.lifecycle.system_state() == HandleState::Active)
            .unwrap_or(false);
        if active {
            tracing::warn!(system = %self.shared.id, "System dropped without shutdown");
            if let Err(e) = self.shared.shutdown() {
                tracing::warn!(system = %self.shared.id, error = %e, "Shutdown on drop failed");
            }
        }
    }
}

impl std::fmt::Debug for RtbSystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RtbSystem")
            .field("id", &self.shared.id)
            .field("proxy", &self.shared.proxy)
            .finish()
    }
}

/// Owned handle to a native bidding agent
///
/// Dropping an agent that is still active releases it. The handle remembers
/// an explicit release, so a second release is told apart from use after
/// shutdown without the system keeping a record of every agent it ever had.
pub struct BiddingAgent {
    id: AgentId,
    name: String,
    system: Arc<SystemShared>,
    released: AtomicBool,
}

impl BiddingAgent {
    pub fn id(&self) -> &AgentId {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn system_id(&self) -> &SystemId {
        &self.system.id
    }

    /// Current lifecycle state of this handle
    pub fn state(&self) -> Result<HandleState> {
        let state = self.system.lock()?;
        if self.released.load(Ordering::SeqCst) {
            return Ok(HandleState::Released);
        }
        if state.lifecycle.is_active_agent(&self.id) {
            return Ok(HandleState::Active);
        }
        if state.lifecycle.system_state() == HandleState::Released {
            return Ok(HandleState::Released);
        }
        Err(BridgeError::InvalidHandle(format!("agent {} unknown to its system", self.id)))
    }

    /// How this handle was released, if it was
    pub fn release_cause(&self) -> Result<Option<ReleaseCause>> {
        let state = self.system.lock()?;
        if self.released.load(Ordering::SeqCst) {
            return Ok(Some(ReleaseCause::Explicit));
        }
        if state.lifecycle.system_state() == HandleState::Released {
            return Ok(Some(ReleaseCause::Shutdown));
        }
        Ok(None)
    }

    /// Push agent configuration to the engine
    pub fn set_config(&self, config: &str) -> Result<()> {
        let event = OutboundEvent::Config {
            config: config.to_string(),
        };
        self.system.send_checked(&self.id, Some(&self.released), &event)
    }

    /// Submit a bid for a request
    pub fn send_bid(&self, bid: Bid) -> Result<()> {
        let event = OutboundEvent::BidResponse { bid };
        self.system.send_checked(&self.id, Some(&self.released), &event)
    }

    /// Release this agent explicitly; see `RtbSystem::release_agent`
    pub fn release(&self) -> Result<()> {
        self.system.release_agent(&self.id, &self.released)
    }
}

impl Drop for BiddingAgent {
    fn drop(&mut self) {
        self.system.release_on_drop(&self.id, &self.released);
    }
}

impl std::fmt::Debug for BiddingAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BiddingAgent")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("system", &self.system.id)
            .finish()
    }
}
