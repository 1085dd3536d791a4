//! Core handle and event types for the rtb-bridge system
//!
//! Host-facing types use camelCase JSON serialization so they can be
//! marshalled to a host runtime unchanged.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::num::NonZeroUsize;

/// Opaque non-null reference to a native-side resource
///
/// `Option<RawHandle>` is how a nullable native pointer is modelled at the
/// engine seam. The host never dereferences it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RawHandle(NonZeroUsize);

impl RawHandle {
    /// Wrap a native address, returning `None` for null
    pub fn from_addr(addr: usize) -> Option<Self> {
        NonZeroUsize::new(addr).map(Self)
    }

    /// The native address
    pub fn addr(self) -> usize {
        self.0.get()
    }
}

impl From<NonZeroUsize> for RawHandle {
    fn from(addr: NonZeroUsize) -> Self {
        Self(addr)
    }
}

impl fmt::Display for RawHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0.get())
    }
}

/// Host-side identity of a system handle (sys-<uuid>)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SystemId(String);

impl SystemId {
    pub(crate) fn generate() -> Self {
        Self(format!("sys-{}", uuid::Uuid::new_v4()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SystemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Host-side identity of an agent handle (agt-<uuid>)
///
/// Never reused, unlike native addresses which may be recycled after release.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AgentId(String);

impl AgentId {
    pub(crate) fn generate() -> Self {
        Self(format!("agt-{}", uuid::Uuid::new_v4()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle state of a system or agent handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum HandleState {
    Uninitialized,
    Active,
    Released,
}

impl fmt::Display for HandleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HandleState::Uninitialized => "uninitialized",
            HandleState::Active => "active",
            HandleState::Released => "released",
        };
        f.write_str(s)
    }
}

/// Native event kind tags, as laid out by the engine ABI
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[repr(i32)]
pub enum EventKind {
    Config = 0,
    BidRequest = 1,
    BidResponse = 2,
    BidResult = 3,
    Win = 4,
    Error = 5,
}

impl TryFrom<i32> for EventKind {
    type Error = i32;

    fn try_from(tag: i32) -> std::result::Result<Self, i32> {
        match tag {
            0 => Ok(EventKind::Config),
            1 => Ok(EventKind::BidRequest),
            2 => Ok(EventKind::BidResponse),
            3 => Ok(EventKind::BidResult),
            4 => Ok(EventKind::Win),
            5 => Ok(EventKind::Error),
            other => Err(other),
        }
    }
}

/// An undecoded notification as yielded by the engine
///
/// `subject` is the native agent handle the event belongs to. `id` carries
/// the request id for bid-related kinds and the error code for `Error`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEvent {
    pub kind: i32,
    pub subject: RawHandle,
    pub id: i64,
    pub payload: Bytes,
}

impl RawEvent {
    pub fn new(kind: EventKind, subject: RawHandle, id: i64, payload: impl Into<Bytes>) -> Self {
        Self {
            kind: kind as i32,
            subject,
            id,
            payload: payload.into(),
        }
    }
}

/// An auction opportunity delivered to one agent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BidRequest {
    /// Engine-assigned request id, echoed back in the bid
    pub id: i64,

    /// Opaque request body as produced by the engine
    pub payload: Bytes,
}

/// A bid in response to a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Bid {
    pub request_id: i64,
    pub price: i64,
}

impl Bid {
    pub fn new(request_id: i64, price: i64) -> Self {
        Self { request_id, price }
    }
}

/// A decoded engine notification, routed by agent name
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "kind")]
pub enum EngineEvent {
    Config {
        agent: String,
        config: String,
    },
    BidRequest {
        agent: String,
        request: BidRequest,
    },
    #[serde(rename_all = "camelCase")]
    BidResult {
        agent: String,
        request_id: i64,
        payload: Bytes,
    },
    #[serde(rename_all = "camelCase")]
    Win {
        agent: String,
        request_id: i64,
        payload: Bytes,
    },
    Error {
        agent: String,
        code: i64,
        message: String,
    },
}

impl EngineEvent {
    /// Name of the agent this event is addressed to
    pub fn agent(&self) -> &str {
        match self {
            EngineEvent::Config { agent, .. }
            | EngineEvent::BidRequest { agent, .. }
            | EngineEvent::BidResult { agent, .. }
            | EngineEvent::Win { agent, .. }
            | EngineEvent::Error { agent, .. } => agent,
        }
    }

    pub fn kind(&self) -> EventKind {
        match self {
            EngineEvent::Config { .. } => EventKind::Config,
            EngineEvent::BidRequest { .. } => EventKind::BidRequest,
            EngineEvent::BidResult { .. } => EventKind::BidResult,
            EngineEvent::Win { .. } => EventKind::Win,
            EngineEvent::Error { .. } => EventKind::Error,
        }
    }
}

/// Host-to-engine notification sent on behalf of one agent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "kind")]
pub enum OutboundEvent {
    Config { config: String },
    BidResponse { bid: Bid },
}

impl OutboundEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            OutboundEvent::Config { .. } => EventKind::Config,
            OutboundEvent::BidResponse { .. } => EventKind::BidResponse,
        }
    }
}

/// Current time in Unix milliseconds
pub(crate) fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
