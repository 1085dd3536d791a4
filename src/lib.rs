//! # rtb-bridge
//!
//! Safe host bindings for a native real-time-bidding engine.
//!
//! ## Overview
//!
//! `rtb-bridge` owns the opaque handles the engine hands out, rejects
//! double-release and use-after-free before they reach native code, keeps a
//! per-system registry of bidding-agent handlers, and runs the loop that
//! pulls engine events and routes them to those handlers.
//!
//! ## Quick Start
//!
//! ```rust
//! use rtb_bridge::{Bid, BidRequest, FnHandler, RtbSystem, SimulatedEngine};
//! use std::sync::Arc;
//!
//! # fn example() -> rtb_bridge::Result<()> {
//! let engine = Arc::new(SimulatedEngine::new());
//! let system = RtbSystem::initialize(engine.clone(), "bootstrap.json")?;
//!
//! let agent = system.create_agent("agent-1")?;
//! system.register_handler(
//!     "agent-1",
//!     Arc::new(FnHandler::new(|_agent: &str, req: &BidRequest| {
//!         Some(Bid::new(req.id, 1000))
//!     })),
//! )?;
//!
//! engine.inject_bid_request("agent-1", 1, "request body");
//! let stats = system.dispatcher().dispatch_once()?;
//! assert_eq!(stats.bids_sent, 1);
//!
//! agent.release()?;
//! system.shutdown()?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Engines
//!
//! - **simulated**: in-process engine for tests and host development
//! - **native**: `librtbkit_api` over the C ABI (feature `native`)
//!
//! ## Architecture
//!
//! - **NativeEngine** trait: the raw foreign-call seam
//! - **EngineProxy**: gates every native call on a live system handle
//! - **LifecycleManager**: handle state machine, checked before native calls
//! - **AgentRegistry**: agent name to handler, per system
//! - **Dispatcher**: retrieves, decodes and routes engine events

pub mod config;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod handler;
pub mod lifecycle;
pub mod proxy;
pub mod registry;
pub mod skipped;
pub mod system;
pub mod types;

// Re-export core types
pub use config::{BridgeConfig, StopPolicy};
pub use dispatch::{decode_event, DispatchStats, Dispatcher};
pub use engine::{EngineFailure, NativeEngine};
pub use error::{BridgeError, Result};
pub use handler::{BiddingAgentHandler, FnHandler};
pub use lifecycle::{LifecycleManager, OrphanedAgent, ReleaseCause};
pub use proxy::EngineProxy;
pub use registry::AgentRegistry;
pub use skipped::{MemorySkippedEvents, SkipReason, SkippedEvent, SkippedEventSink};
pub use system::{BiddingAgent, RtbSystem};
pub use types::{
    AgentId, Bid, BidRequest, EngineEvent, EventKind, HandleState, OutboundEvent, RawEvent,
    RawHandle, SystemId,
};

// Re-export engines for convenience
#[cfg(feature = "native")]
pub use engine::native::RtbkitEngine;
pub use engine::simulated::{SentEvent, SimulatedEngine, SimulatedStats};
