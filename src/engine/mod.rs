//! Native engine seam: the fixed ABI the bridge consumes
//!
//! Every engine backend (the linked `librtbkit_api`, the in-process
//! simulator) implements `NativeEngine`. The trait mirrors the native calls
//! one to one: nullable returns are `Option`, void returns are `()`, and
//! failure details are fetched separately through `last_error`.

use crate::types::{OutboundEvent, RawEvent, RawHandle};
use std::time::Duration;

#[cfg(feature = "native")]
pub mod native;
pub mod simulated;

/// Failure details reported by the engine after a null return
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineFailure {
    pub code: i32,
    pub message: String,
}

impl EngineFailure {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Core trait for native engine backends
///
/// Methods taking a handle are `unsafe`: the caller must pass a handle the
/// engine returned and has not yet destroyed. `EngineProxy` is the only
/// caller inside this crate and upholds that with its lifecycle gate.
pub trait NativeEngine: Send + Sync {
    /// Bootstrap an engine instance; `None` is the native null return
    fn initialize(&self, bootstrap: &str) -> Option<RawHandle>;

    /// Destroy an engine instance
    ///
    /// # Safety
    ///
    /// `system` must be live and must not be used again afterwards.
    unsafe fn shutdown(&self, system: RawHandle);

    /// Create a bidding agent under a system; `None` is the native null return
    ///
    /// # Safety
    ///
    /// `system` must be live.
    unsafe fn create_bidding_agent(&self, system: RawHandle, name: &str) -> Option<RawHandle>;

    /// Destroy a bidding agent
    ///
    /// # Safety
    ///
    /// `agent` must be live and must not be used again afterwards.
    unsafe fn release(&self, agent: RawHandle);

    /// Retrieve the next pending event, waiting at most `timeout`
    ///
    /// `None` means no event was available within the wait.
    ///
    /// # Safety
    ///
    /// `system` must be live for the whole call.
    unsafe fn poll_next_event(&self, system: RawHandle, timeout: Duration) -> Option<RawEvent>;

    /// Send a host notification on behalf of an agent
    ///
    /// # Safety
    ///
    /// `agent` must be live.
    unsafe fn send_event(&self, agent: RawHandle, event: &OutboundEvent);

    /// Details of the most recent failed call, if the engine exposes them
    fn last_error(&self) -> Option<EngineFailure> {
        None
    }

    /// Backend name (e.g., "rtbkit", "simulated")
    fn name(&self) -> &str;
}
