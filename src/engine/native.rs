//! `librtbkit_api` over the C ABI
//!
//! The library exposes a blocking `rtbkit_next_event` per agent and a file
//! descriptor per agent for readiness. `RtbkitEngine` turns that into a
//! system-wide poll by waiting on every agent descriptor of the system with
//! `poll(2)` and reading from the first ready one.
//!
//! Only the wait for readiness is bounded by the timeout. Once a descriptor
//! is readable, `rtbkit_next_event` spins inside the library until it yields
//! an event. If the readable message does not produce one, that call blocks
//! past the timeout with the proxy's read gate held, which also delays
//! release and shutdown of the system until the library returns.

#![allow(non_camel_case_types)]

use super::{EngineFailure, NativeEngine};
use crate::types::{EventKind, OutboundEvent, RawEvent, RawHandle};
use bytes::Bytes;
use std::collections::HashMap;
use std::ffi::{c_char, c_int, CStr, CString};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

#[repr(C)]
struct rtbkit_handle {
    _private: [u8; 0],
}

#[repr(C)]
struct rtbkit_object {
    _private: [u8; 0],
}

#[repr(C)]
struct rtbkit_event {
    subject: *mut rtbkit_object,
    kind: c_int,
}

#[repr(C)]
#[derive(Clone, Copy)]
struct rtbkit_bid_request {
    id: c_int,
}

#[repr(C)]
#[derive(Clone, Copy)]
struct rtbkit_bid {
    id: c_int,
    price: c_int,
}

#[repr(C)]
struct rtbkit_bidding_agent_config {
    base: rtbkit_event,
    config: *const c_char,
}

#[repr(C)]
struct rtbkit_event_bid_request {
    base: rtbkit_event,
    request: rtbkit_bid_request,
}

#[repr(C)]
struct rtbkit_event_bid_response {
    base: rtbkit_event,
    bid: rtbkit_bid,
}

#[link(name = "rtbkit_api")]
extern "C" {
    fn rtbkit_initialize(bootstrap: *const c_char) -> *mut rtbkit_handle;
    fn rtbkit_shutdown(handle: *mut rtbkit_handle);
    fn rtbkit_create_bidding_agent(
        handle: *mut rtbkit_handle,
        name: *const c_char,
    ) -> *mut rtbkit_object;
    fn rtbkit_release(handle: *mut rtbkit_object);
    fn rtbkit_next_event(handle: *mut rtbkit_object, event: *mut *mut rtbkit_event);
    fn rtbkit_free_event(event: *mut rtbkit_event);
    fn rtbkit_send_event(event: *mut rtbkit_event);
    fn rtbkit_fd(handle: *mut rtbkit_object) -> c_int;
}

#[derive(Default)]
struct Registry {
    // Agents per system, in creation order
    agents: HashMap<RawHandle, Vec<RawHandle>>,
    // Where the next poll starts, so one busy agent cannot starve the rest
    cursor: HashMap<RawHandle, usize>,
    last_error: Option<EngineFailure>,
}

/// Engine backed by the native `librtbkit_api`
#[derive(Default)]
pub struct RtbkitEngine {
    registry: Mutex<Registry>,
}

impl RtbkitEngine {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn fail(&self, code: i32, message: impl Into<String>) {
        self.lock().last_error = Some(EngineFailure::new(code, message));
    }

    /// Read and free one event from a ready agent
    ///
    /// # Safety
    ///
    /// `agent` must be a live agent whose descriptor reported readable.
    unsafe fn read_event(agent: RawHandle) -> Option<RawEvent> {
        let mut event: *mut rtbkit_event = std::ptr::null_mut();
        rtbkit_next_event(agent.addr() as *mut rtbkit_object, &mut event);
        if event.is_null() {
            return None;
        }

        let kind = (*event).kind;
        let subject = RawHandle::from_addr((*event).subject as usize).unwrap_or(agent);
        let (id, payload) = match EventKind::try_from(kind) {
            Ok(EventKind::BidRequest) => {
                let request = &*(event as *const rtbkit_event_bid_request);
                (i64::from(request.request.id), Bytes::new())
            }
            Ok(EventKind::Config) => {
                let config = &*(event as *const rtbkit_bidding_agent_config);
                let payload = if config.config.is_null() {
                    Bytes::new()
                } else {
                    Bytes::copy_from_slice(CStr::from_ptr(config.config).to_bytes())
                };
                (0, payload)
            }
            _ => (0, Bytes::new()),
        };
        rtbkit_free_event(event);

        Some(RawEvent {
            kind,
            subject,
            id,
            payload,
        })
    }
}

impl NativeEngine for RtbkitEngine {
    fn initialize(&self, bootstrap: &str) -> Option<RawHandle> {
        let path = match CString::new(bootstrap) {
            Ok(path) => path,
            Err(e) => {
                self.fail(22, format!("bootstrap path: {}", e));
                return None;
            }
        };

        // SAFETY: `path` is a valid NUL-terminated string for the call.
        let handle = unsafe { rtbkit_initialize(path.as_ptr()) };
        let Some(system) = RawHandle::from_addr(handle as usize) else {
            self.fail(-1, format!("rtbkit_initialize({}) returned null", bootstrap));
            return None;
        };

        self.lock().agents.insert(system, Vec::new());
        Some(system)
    }

    unsafe fn shutdown(&self, system: RawHandle) {
        {
            let mut registry = self.lock();
            registry.agents.remove(&system);
            registry.cursor.remove(&system);
        }
        rtbkit_shutdown(system.addr() as *mut rtbkit_handle);
    }

    unsafe fn create_bidding_agent(&self, system: RawHandle, name: &str) -> Option<RawHandle> {
        let name_c = match CString::new(name) {
            Ok(name_c) => name_c,
            Err(e) => {
                self.fail(22, format!("agent name: {}", e));
                return None;
            }
        };

        let handle =
            rtbkit_create_bidding_agent(system.addr() as *mut rtbkit_handle, name_c.as_ptr());
        let Some(agent) = RawHandle::from_addr(handle as usize) else {
            self.fail(-1, format!("rtbkit_create_bidding_agent({}) returned null", name));
            return None;
        };

        self.lock().agents.entry(system).or_default().push(agent);
        Some(agent)
    }

    unsafe fn release(&self, agent: RawHandle) {
        {
            let mut registry = self.lock();
            for agents in registry.agents.values_mut() {
                agents.retain(|a| *a != agent);
            }
        }
        rtbkit_release(agent.addr() as *mut rtbkit_object);
    }

    unsafe fn poll_next_event(&self, system: RawHandle, timeout: Duration) -> Option<RawEvent> {
        let (agents, start) = {
            let registry = self.lock();
            let agents = registry.agents.get(&system).cloned().unwrap_or_default();
            let start = registry.cursor.get(&system).copied().unwrap_or(0);
            (agents, start)
        };
        if agents.is_empty() {
            std::thread::sleep(timeout);
            return None;
        }

        let mut fds: Vec<libc::pollfd> = agents
            .iter()
            .map(|agent| libc::pollfd {
                fd: rtbkit_fd(agent.addr() as *mut rtbkit_object),
                events: libc::POLLIN,
                revents: 0,
            })
            .collect();
        let timeout_ms = c_int::try_from(timeout.as_millis()).unwrap_or(c_int::MAX);

        let ready = libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout_ms);
        if ready <= 0 {
            if ready < 0 {
                let err = std::io::Error::last_os_error();
                if err.kind() != std::io::ErrorKind::Interrupted {
                    tracing::warn!(system = %system, error = %err, "poll(2) failed");
                }
            }
            return None;
        }

        let n = fds.len();
        let index = (0..n)
            .map(|offset| (start + offset) % n)
            .find(|&i| fds[i].revents & libc::POLLIN != 0)?;
        self.lock().cursor.insert(system, (index + 1) % n);

        Self::read_event(agents[index])
    }

    unsafe fn send_event(&self, agent: RawHandle, event: &OutboundEvent) {
        let subject = agent.addr() as *mut rtbkit_object;
        match event {
            OutboundEvent::Config { config } => {
                let Ok(config) = CString::new(config.as_str()) else {
                    self.fail(22, "agent config contains a NUL byte");
                    return;
                };
                let mut cfg = rtbkit_bidding_agent_config {
                    base: rtbkit_event {
                        subject,
                        kind: EventKind::Config as c_int,
                    },
                    config: config.as_ptr(),
                };
                rtbkit_send_event(&mut cfg.base);
            }
            OutboundEvent::BidResponse { bid } => {
                // EngineProxy rejects these first; direct trait callers land here.
                let id = c_int::try_from(bid.request_id);
                let price = c_int::try_from(bid.price);
                let (Ok(id), Ok(price)) = (id, price) else {
                    self.fail(75, "bid out of range for the native ABI");
                    return;
                };
                let mut response = rtbkit_event_bid_response {
                    base: rtbkit_event {
                        subject,
                        kind: EventKind::BidResponse as c_int,
                    },
                    bid: rtbkit_bid { id, price },
                };
                rtbkit_send_event(&mut response.base);
            }
        }
    }

    fn last_error(&self) -> Option<EngineFailure> {
        self.lock().last_error.clone()
    }

    fn name(&self) -> &str {
        "rtbkit"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_layouts_extend_base() {
        let base = std::mem::size_of::<rtbkit_event>();
        assert!(std::mem::size_of::<rtbkit_event_bid_request>() > base);
        assert!(std::mem::size_of::<rtbkit_event_bid_response>() > base);
        assert_eq!(std::mem::offset_of!(rtbkit_event_bid_request, base), 0);
        assert_eq!(std::mem::offset_of!(rtbkit_bidding_agent_config, base), 0);
    }

    #[test]
    fn test_engine_name() {
        assert_eq!(RtbkitEngine::new().name(), "rtbkit");
        assert!(RtbkitEngine::new().last_error().is_none());
    }
}
