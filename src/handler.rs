//! Host-side handler capability
//!
//! A handler is registered per agent name and invoked synchronously by the
//! dispatcher, one event at a time, in engine order for that agent.

use crate::types::{Bid, BidRequest};
use bytes::Bytes;

/// Receives the events addressed to one bidding agent
///
/// Only `on_bid_request` is required. Returning a `Bid` sends it back to the
/// engine as that agent's response.
pub trait BiddingAgentHandler: Send + Sync {
    /// An auction opportunity for this agent
    fn on_bid_request(&self, agent: &str, request: &BidRequest) -> Option<Bid>;

    /// Configuration pushed by the engine
    fn on_config(&self, _agent: &str, _config: &str) {}

    /// Outcome of a previously submitted bid
    fn on_bid_result(&self, _agent: &str, _request_id: i64, _payload: &Bytes) {}

    /// A submitted bid won its auction
    fn on_win(&self, _agent: &str, _request_id: i64, _payload: &Bytes) {}

    /// The engine reported an agent-level error
    fn on_error(&self, agent: &str, code: i64, message: &str) {
        tracing::warn!(agent = %agent, code, message = %message, "Engine reported agent error");
    }
}

/// Adapter turning a closure into a handler that only cares about bid requests
pub struct FnHandler<F> {
    f: F,
}

impl<F> FnHandler<F>
where
    F: Fn(&str, &BidRequest) -> Option<Bid> + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

impl<F> BiddingAgentHandler for FnHandler<F>
where
    F: Fn(&str, &BidRequest) -> Option<Bid> + Send + Sync,
{
    fn on_bid_request(&self, agent: &str, request: &BidRequest) -> Option<Bid> {
        (self.f)(agent, request)
    }
}
