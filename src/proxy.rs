//! Native engine proxy: typed wrapper around the foreign calls
//!
//! Converts null returns into `BridgeError`s and owns the raw system handle
//! behind a reader/writer gate. Polls, agent creation, and sends hold the
//! gate shared; release and shutdown hold it exclusively, so a destructive
//! native call never overlaps an in-flight poll and nothing reaches the
//! engine once the system handle is gone.

use crate::engine::NativeEngine;
use crate::error::{BridgeError, Result};
use crate::types::{OutboundEvent, RawEvent, RawHandle};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

/// Code reported when the engine returns null without error details
pub const UNKNOWN_ENGINE_ERROR: i32 = -1;

/// Typed proxy for one native system instance
pub struct EngineProxy {
    engine: Arc<dyn NativeEngine>,
    bootstrap: String,
    system: RwLock<Option<RawHandle>>,
}

impl EngineProxy {
    /// Bootstrap a native system from the given path
    ///
    /// The path is passed through verbatim; its content belongs to the engine.
    pub fn initialize(engine: Arc<dyn NativeEngine>, bootstrap: &str) -> Result<Self> {
        if bootstrap.is_empty() {
            return Err(BridgeError::Initialization {
                bootstrap: String::new(),
                reason: "empty bootstrap path".to_string(),
            });
        }
        if bootstrap.contains('\0') {
            return Err(BridgeError::Initialization {
                bootstrap: bootstrap.replace('\0', "\\0"),
                reason: "bootstrap path contains a NUL byte".to_string(),
            });
        }

        let system = engine.initialize(bootstrap).ok_or_else(|| {
            let reason = match engine.last_error() {
                Some(failure) => format!("engine error {}: {}", failure.code, failure.message),
                None => "engine returned null".to_string(),
            };
            BridgeError::Initialization {
                bootstrap: bootstrap.to_string(),
                reason,
            }
        })?;

        tracing::info!(
            engine = engine.name(),
            bootstrap = %bootstrap,
            system = %system,
            "Engine initialized"
        );

        Ok(Self {
            engine,
            bootstrap: bootstrap.to_string(),
            system: RwLock::new(Some(system)),
        })
    }

    /// Backend name of the underlying engine
    pub fn engine_name(&self) -> &str {
        self.engine.name()
    }

    /// Bootstrap path this system was created from
    pub fn bootstrap(&self) -> &str {
        &self.bootstrap
    }

    /// Whether the native system handle is still held
    pub fn is_live(&self) -> bool {
        self.read_gate().map(|gate| gate.is_some()).unwrap_or(false)
    }

    /// Destroy the native system
    ///
    /// Not idempotent: a second call fails with `InvalidHandle`.
    pub fn shutdown(&self) -> Result<()> {
        let mut gate = self.write_gate()?;
        let system = gate.take().ok_or_else(|| {
            BridgeError::InvalidHandle("system handle already shut down".to_string())
        })?;

        // SAFETY: the handle came from `initialize` and was just taken out of
        // the gate, so no other call can observe it again.
        unsafe { self.engine.shutdown(system) };

        tracing::info!(engine = self.engine.name(), system = %system, "Engine shut down");
        Ok(())
    }

    /// Create a native bidding agent under this system
    pub(crate) fn create_bidding_agent(&self, name: &str) -> Result<RawHandle> {
        if name.contains('\0') {
            return Err(BridgeError::Config(format!(
                "agent name {:?} contains a NUL byte",
                name
            )));
        }

        let gate = self.read_gate()?;
        let system = (*gate).ok_or_else(|| {
            BridgeError::UseAfterFree("system handle has been shut down".to_string())
        })?;

        // SAFETY: `system` is live while the gate is held.
        let agent = unsafe { self.engine.create_bidding_agent(system, name) };
        agent.ok_or_else(|| self.engine_error())
    }

    /// Destroy a native bidding agent
    ///
    /// The caller guarantees `agent` came from `create_bidding_agent` on this
    /// proxy and has not been released.
    pub(crate) fn release(&self, agent: RawHandle) -> Result<()> {
        let gate = self.write_gate()?;
        if gate.is_none() {
            return Err(BridgeError::UseAfterFree(
                "system handle has been shut down".to_string(),
            ));
        }

        // SAFETY: the agent is live per the caller's contract and no poll is
        // in flight while the exclusive gate is held.
        unsafe { self.engine.release(agent) };
        Ok(())
    }

    /// Retrieve the next native event, waiting at most `timeout`
    ///
    /// `Ok(None)` means no event was available.
    pub fn poll_next_event(&self, timeout: Duration) -> Result<Option<RawEvent>> {
        let gate = self.read_gate()?;
        let system = (*gate).ok_or_else(|| {
            BridgeError::UseAfterFree("system handle has been shut down".to_string())
        })?;

        // SAFETY: `system` stays live until the shared gate is dropped.
        Ok(unsafe { self.engine.poll_next_event(system, timeout) })
    }

    /// Send a host notification on behalf of an agent
    ///
    /// Same contract on `agent` as `release`.
    pub(crate) fn send_event(&self, agent: RawHandle, event: &OutboundEvent) -> Result<()> {
        match event {
            OutboundEvent::Config { config } if config.contains('\0') => {
                return Err(BridgeError::Config(
                    "agent config contains a NUL byte".to_string(),
                ));
            }
            OutboundEvent::BidResponse { bid } => {
                check_c_int("bid requestId", bid.request_id)?;
                check_c_int("bid price", bid.price)?;
            }
            _ => {}
        }

        let gate = self.read_gate()?;
        if gate.is_none() {
            return Err(BridgeError::UseAfterFree(
                "system handle has been shut down".to_string(),
            ));
        }

        // SAFETY: the agent is live per the caller's contract.
        unsafe { self.engine.send_event(agent, event) };
        Ok(())
    }

    fn engine_error(&self) -> BridgeError {
        match self.engine.last_error() {
            Some(failure) => BridgeError::Engine {
                code: failure.code,
                message: failure.message,
            },
            None => BridgeError::Engine {
                code: UNKNOWN_ENGINE_ERROR,
                message: "engine returned null".to_string(),
            },
        }
    }

    fn read_gate(&self) -> Result<RwLockReadGuard<'_, Option<RawHandle>>> {
        self.system
            .read()
            .map_err(|e| BridgeError::Lock(format!("engine gate: {}", e)))
    }

    fn write_gate(&self) -> Result<RwLockWriteGuard<'_, Option<RawHandle>>> {
        self.system
            .write()
            .map_err(|e| BridgeError::Lock(format!("engine gate: {}", e)))
    }
}

impl std::fmt::Debug for EngineProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineProxy")
            .field("engine", &self.engine.name())
            .field("bootstrap", &self.bootstrap)
            .field("live", &self.is_live())
            .finish()
    }
}

/// Bid fields are `int` across the C ABI
fn check_c_int(field: &str, value: i64) -> Result<()> {
    if i32::try_from(value).is_err() {
        return Err(BridgeError::Config(format!(
            "{} {} does not fit a C int",
            field, value
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::simulated::SimulatedEngine;
    use crate::engine::EngineFailure;
    use crate::types::Bid;

    fn proxy() -> (Arc<SimulatedEngine>, EngineProxy) {
        let engine = Arc::new(SimulatedEngine::new());
        let proxy = EngineProxy::initialize(engine.clone(), "bootstrap.json").unwrap();
        (engine, proxy)
    }

    #[test]
    fn test_initialize_rejects_bad_paths() {
        let engine = Arc::new(SimulatedEngine::new());
        let err = EngineProxy::initialize(engine.clone(), "").unwrap_err();
        assert!(matches!(err, BridgeError::Initialization { .. }));

        let err = EngineProxy::initialize(engine.clone(), "boot\0strap.json").unwrap_err();
        assert!(matches!(err, BridgeError::Initialization { .. }));
        assert_eq!(engine.stats().initialized, 0);
    }

    #[test]
    fn test_initialize_null_carries_engine_error() {
        let engine = Arc::new(SimulatedEngine::new());
        engine.fail_next_initialize(EngineFailure::new(3, "zookeeper unreachable"));

        let err = EngineProxy::initialize(engine, "bootstrap.json").unwrap_err();
        match err {
            BridgeError::Initialization { bootstrap, reason } => {
                assert_eq!(bootstrap, "bootstrap.json");
                assert!(reason.contains("zookeeper unreachable"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_shutdown_is_not_idempotent() {
        let (engine, proxy) = proxy();
        assert!(proxy.is_live());
        proxy.shutdown().unwrap();
        assert!(!proxy.is_live());

        let err = proxy.shutdown().unwrap_err();
        assert!(matches!(err, BridgeError::InvalidHandle(_)));
        assert_eq!(engine.stats().shutdowns, 1);
        assert_eq!(engine.stats().misuse, 0);
    }

    #[test]
    fn test_create_null_becomes_engine_error() {
        let (engine, proxy) = proxy();
        engine.fail_next_create(EngineFailure::new(11, "agent init failed"));

        let err = proxy.create_bidding_agent("a").unwrap_err();
        match err {
            BridgeError::Engine { code, message } => {
                assert_eq!(code, 11);
                assert_eq!(message, "agent init failed");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_calls_after_shutdown_never_reach_engine() {
        let (engine, proxy) = proxy();
        let agent = proxy.create_bidding_agent("a").unwrap();
        proxy.release(agent).unwrap();
        proxy.shutdown().unwrap();

        assert!(matches!(
            proxy.create_bidding_agent("b").unwrap_err(),
            BridgeError::UseAfterFree(_)
        ));
        assert!(matches!(
            proxy.poll_next_event(Duration::ZERO).unwrap_err(),
            BridgeError::UseAfterFree(_)
        ));
        assert!(matches!(
            proxy
                .send_event(agent, &OutboundEvent::BidResponse { bid: Bid::new(1, 1) })
                .unwrap_err(),
            BridgeError::UseAfterFree(_)
        ));
        assert!(matches!(
            proxy.release(agent).unwrap_err(),
            BridgeError::UseAfterFree(_)
        ));
        assert_eq!(engine.stats().misuse, 0);
    }

    #[test]
    fn test_nul_strings_rejected_before_native_call() {
        let (engine, proxy) = proxy();
        assert!(matches!(
            proxy.create_bidding_agent("a\0b").unwrap_err(),
            BridgeError::Config(_)
        ));

        let agent = proxy.create_bidding_agent("a").unwrap();
        let out = OutboundEvent::Config {
            config: "x\0y".to_string(),
        };
        assert!(matches!(
            proxy.send_event(agent, &out).unwrap_err(),
            BridgeError::Config(_)
        ));
        assert!(engine.sent_events().is_empty());
    }

    #[test]
    fn test_out_of_range_bid_rejected_before_native_call() {
        let (engine, proxy) = proxy();
        let agent = proxy.create_bidding_agent("a").unwrap();

        for bid in [Bid::new(1, i64::MAX), Bid::new(i64::from(i32::MIN) - 1, 10)] {
            let err = proxy
                .send_event(agent, &OutboundEvent::BidResponse { bid })
                .unwrap_err();
            assert!(matches!(err, BridgeError::Config(_)));
        }
        assert!(engine.sent_events().is_empty());

        let edge = Bid::new(i64::from(i32::MAX), i64::from(i32::MIN));
        proxy
            .send_event(agent, &OutboundEvent::BidResponse { bid: edge })
            .unwrap();
        assert_eq!(engine.sent_events().len(), 1);
    }

    #[test]
    fn test_poll_returns_none_when_idle() {
        let (_engine, proxy) = proxy();
        assert!(proxy.poll_next_event(Duration::ZERO).unwrap().is_none());
    }
}
