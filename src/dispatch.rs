//! Event dispatcher
//!
//! Pulls raw events from the engine, decodes them once into `EngineEvent`,
//! resolves the subject to an active agent and invokes its handler. Events
//! that cannot be delivered go to the system's skipped-event sink.
//!
//! Lock discipline: the state mutex is never held while polling the engine
//! or while a handler runs.

use crate::config::StopPolicy;
use crate::error::{BridgeError, Result};
use crate::handler::BiddingAgentHandler;
use crate::skipped::{SkipReason, SkippedEvent};
use crate::system::SystemShared;
use crate::types::{AgentId, BidRequest, EngineEvent, EventKind, OutboundEvent, RawEvent};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Totals accumulated by a dispatcher run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchStats {
    pub iterations: u64,
    pub retrieved: u64,
    pub delivered: u64,
    pub skipped: u64,
    pub bids_sent: u64,
    pub send_failures: u64,
}

impl DispatchStats {
    fn absorb(&mut self, other: DispatchStats) {
        self.iterations += other.iterations;
        self.retrieved += other.retrieved;
        self.delivered += other.delivered;
        self.skipped += other.skipped;
        self.bids_sent += other.bids_sent;
        self.send_failures += other.send_failures;
    }
}

/// Decode a raw event addressed to `agent`
///
/// Config and error payloads are read as UTF-8, lossily. `BID_RESPONSE` only
/// travels host-to-engine and is rejected inbound.
pub fn decode_event(raw: &RawEvent, agent: &str) -> std::result::Result<EngineEvent, SkipReason> {
    let kind = EventKind::try_from(raw.kind).map_err(|tag| SkipReason::UnknownKind { tag })?;
    let agent = agent.to_string();

    let event = match kind {
        EventKind::Config => EngineEvent::Config {
            agent,
            config: String::from_utf8_lossy(&raw.payload).into_owned(),
        },
        EventKind::BidRequest => EngineEvent::BidRequest {
            agent,
            request: BidRequest {
                id: raw.id,
                payload: raw.payload.clone(),
            },
        },
        EventKind::BidResult => EngineEvent::BidResult {
            agent,
            request_id: raw.id,
            payload: raw.payload.clone(),
        },
        EventKind::Win => EngineEvent::Win {
            agent,
            request_id: raw.id,
            payload: raw.payload.clone(),
        },
        EventKind::Error => EngineEvent::Error {
            agent,
            code: raw.id,
            message: String::from_utf8_lossy(&raw.payload).into_owned(),
        },
        EventKind::BidResponse => return Err(SkipReason::Unsupported { tag: raw.kind }),
    };
    Ok(event)
}

enum Route {
    Deliver {
        id: AgentId,
        handler: Arc<dyn BiddingAgentHandler>,
        event: EngineEvent,
    },
    Skip {
        agent: Option<String>,
        reason: SkipReason,
    },
}

/// Drives event delivery for one system
#[derive(Clone)]
pub struct Dispatcher {
    shared: Arc<SystemShared>,
}

impl Dispatcher {
    pub(crate) fn new(shared: Arc<SystemShared>) -> Self {
        Self { shared }
    }

    /// Retrieve the next deliverable event without invoking any handler
    ///
    /// Waits at most the configured poll timeout for the first event.
    /// Events with no active subject or an undecodable kind are recorded as
    /// skipped and the next pending one is tried. `Ok(None)` means nothing
    /// deliverable was pending.
    pub fn next_event(&self) -> Result<Option<EngineEvent>> {
        let mut timeout = self.shared.config.poll_timeout();
        loop {
            let Some(raw) = self.shared.proxy.poll_next_event(timeout)? else {
                return Ok(None);
            };
            timeout = Duration::ZERO;

            let resolved = {
                let state = self.shared.lock()?;
                state
                    .lifecycle
                    .resolve_subject(raw.subject)
                    .map(|name| name.to_string())
            };
            let Some(agent) = resolved else {
                self.skip(raw, None, SkipReason::UnknownSubject)?;
                continue;
            };
            match decode_event(&raw, &agent) {
                Ok(event) => return Ok(Some(event)),
                Err(reason) => self.skip(raw, Some(agent), reason)?,
            }
        }
    }

    /// Run one iteration: retrieve up to `max_batch` events and deliver them
    pub fn dispatch_once(&self) -> Result<DispatchStats> {
        self.iteration(None)
    }

    /// Dispatch until `cancel` fires or the system shuts down
    pub fn run(&self, cancel: &CancellationToken) -> Result<DispatchStats> {
        let mut total = DispatchStats::default();
        tracing::debug!(system = %self.shared.id, "Dispatch loop running");

        while !cancel.is_cancelled() {
            match self.iteration(Some(cancel)) {
                Ok(stats) => total.absorb(stats),
                Err(BridgeError::UseAfterFree(_)) => {
                    tracing::info!(
                        system = %self.shared.id,
                        "System shut down, dispatch loop exiting"
                    );
                    break;
                }
                Err(e) => {
                    tracing::error!(system = %self.shared.id, error = %e, "Dispatch loop failed");
                    return Err(e);
                }
            }
        }

        tracing::debug!(system = %self.shared.id, ?total, "Dispatch loop finished");
        Ok(total)
    }

    fn iteration(&self, cancel: Option<&CancellationToken>) -> Result<DispatchStats> {
        let batch = self.collect_batch(|timeout| self.shared.proxy.poll_next_event(timeout))?;
        self.process_batch(batch, cancel)
    }

    /// Poll up to `max_batch` events, waiting only for the first
    ///
    /// A poll error with nothing retrieved is returned. Once events have
    /// been retrieved they are owned by the host, so a later poll error ends
    /// the batch early and the events already held are still processed. A
    /// persistent error resurfaces on the next iteration's first poll.
    fn collect_batch<F>(&self, mut poll: F) -> Result<Vec<RawEvent>>
    where
        F: FnMut(Duration) -> Result<Option<RawEvent>>,
    {
        let config = &self.shared.config;
        let mut batch = Vec::new();
        let mut timeout = config.poll_timeout();
        while batch.len() < config.max_batch {
            match poll(timeout) {
                Ok(Some(raw)) => batch.push(raw),
                Ok(None) => break,
                Err(e) if batch.is_empty() => return Err(e),
                Err(e) => {
                    tracing::warn!(
                        system = %self.shared.id,
                        retrieved = batch.len(),
                        error = %e,
                        "Poll failed mid-batch, processing retrieved events"
                    );
                    break;
                }
            }
            timeout = Duration::ZERO;
        }
        Ok(batch)
    }

    fn process_batch(
        &self,
        batch: Vec<RawEvent>,
        cancel: Option<&CancellationToken>,
    ) -> Result<DispatchStats> {
        let config = &self.shared.config;
        let mut stats = DispatchStats {
            iterations: 1,
            retrieved: batch.len() as u64,
            ..DispatchStats::default()
        };

        for raw in batch {
            let stopping = cancel.is_some_and(|c| c.is_cancelled());
            if stopping && config.stop_policy == StopPolicy::Skip {
                let agent = self
                    .shared
                    .lock()?
                    .lifecycle
                    .resolve_subject(raw.subject)
                    .map(|name| name.to_string());
                self.skip(raw, agent, SkipReason::Cancelled)?;
                stats.skipped += 1;
                continue;
            }
            self.deliver(raw, &mut stats)?;
        }

        Ok(stats)
    }

    fn route(&self, raw: &RawEvent) -> Result<Route> {
        let state = self.shared.lock()?;
        let Some((id, name)) = state.lifecycle.subject_agent(raw.subject) else {
            return Ok(Route::Skip {
                agent: None,
                reason: SkipReason::UnknownSubject,
            });
        };
        let Some(handler) = state.registry.get(name) else {
            return Ok(Route::Skip {
                agent: Some(name.to_string()),
                reason: SkipReason::NoHandler,
            });
        };

        Ok(match decode_event(raw, name) {
            Ok(event) => Route::Deliver {
                id: id.clone(),
                handler,
                event,
            },
            Err(reason) => Route::Skip {
                agent: Some(name.to_string()),
                reason,
            },
        })
    }

    fn deliver(&self, raw: RawEvent, stats: &mut DispatchStats) -> Result<()> {
        match self.route(&raw)? {
            Route::Skip { agent, reason } => {
                self.skip(raw, agent, reason)?;
                stats.skipped += 1;
            }
            Route::Deliver { id, handler, event } => {
                tracing::debug!(agent = %event.agent(), kind = ?event.kind(), "Delivering event");
                self.invoke(&id, handler.as_ref(), event, stats);
                stats.delivered += 1;
            }
        }
        Ok(())
    }

    fn invoke(
        &self,
        id: &AgentId,
        handler: &dyn BiddingAgentHandler,
        event: EngineEvent,
        stats: &mut DispatchStats,
    ) {
        match event {
            EngineEvent::Config { agent, config } => handler.on_config(&agent, &config),
            EngineEvent::BidRequest { agent, request } => {
                let Some(bid) = handler.on_bid_request(&agent, &request) else {
                    return;
                };
                match self.shared.send(id, &OutboundEvent::BidResponse { bid }) {
                    Ok(()) => stats.bids_sent += 1,
                    Err(e) => {
                        stats.send_failures += 1;
                        tracing::warn!(
                            agent = %agent,
                            request_id = request.id,
                            error = %e,
                            "Failed to send bid"
                        );
                    }
                }
            }
            EngineEvent::BidResult {
                agent,
                request_id,
                payload,
            } => handler.on_bid_result(&agent, request_id, &payload),
            EngineEvent::Win {
                agent,
                request_id,
                payload,
            } => handler.on_win(&agent, request_id, &payload),
            EngineEvent::Error {
                agent,
                code,
                message,
            } => handler.on_error(&agent, code, &message),
        }
    }

    fn skip(&self, raw: RawEvent, agent: Option<String>, reason: SkipReason) -> Result<()> {
        self.shared.skipped.record(SkippedEvent::new(raw, agent, reason))
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("system", &self.shared.id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BridgeConfig;
    use crate::engine::simulated::SimulatedEngine;
    use crate::handler::FnHandler;
    use crate::system::RtbSystem;
    use crate::types::{Bid, RawHandle};
    use bytes::Bytes;
    use std::sync::Mutex;

    /// Records every callback as "<agent>:<kind>:<id>"
    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<String>>,
        bid_price: Option<i64>,
    }

    impl Recorder {
        fn bidding(price: i64) -> Self {
            Self {
                bid_price: Some(price),
                ..Self::default()
            }
        }

        fn push(&self, entry: String) {
            self.seen.lock().unwrap().push(entry);
        }

        fn seen(&self) -> Vec<String> {
            self.seen.lock().unwrap().clone()
        }
    }

    impl BiddingAgentHandler for Recorder {
        fn on_bid_request(&self, agent: &str, request: &BidRequest) -> Option<Bid> {
            self.push(format!("{}:request:{}", agent, request.id));
            self.bid_price.map(|price| Bid::new(request.id, price))
        }

        fn on_config(&self, agent: &str, config: &str) {
            self.push(format!("{}:config:{}", agent, config));
        }

        fn on_win(&self, agent: &str, request_id: i64, _payload: &Bytes) {
            self.push(format!("{}:win:{}", agent, request_id));
        }

        fn on_bid_result(&self, agent: &str, request_id: i64, _payload: &Bytes) {
            self.push(format!("{}:result:{}", agent, request_id));
        }

        fn on_error(&self, agent: &str, code: i64, message: &str) {
            self.push(format!("{}:error:{}:{}", agent, code, message));
        }
    }

    fn fast_config() -> BridgeConfig {
        BridgeConfig {
            poll_timeout_ms: 1,
            ..BridgeConfig::default()
        }
    }

    fn system() -> (Arc<SimulatedEngine>, RtbSystem) {
        let engine = Arc::new(SimulatedEngine::new());
        let system =
            RtbSystem::initialize_with_config(engine.clone(), "bootstrap.json", fast_config())
                .unwrap();
        (engine, system)
    }

    fn raw(kind: i32, id: i64, payload: &'static str) -> RawEvent {
        RawEvent {
            kind,
            subject: RawHandle::from_addr(0x20).unwrap(),
            id,
            payload: Bytes::from_static(payload.as_bytes()),
        }
    }

    #[test]
    fn test_decode_event_kinds() {
        let config = decode_event(&raw(0, 0, "{\"a\":1}"), "a").unwrap();
        assert_eq!(
            config,
            EngineEvent::Config {
                agent: "a".to_string(),
                config: "{\"a\":1}".to_string()
            }
        );

        let request = decode_event(&raw(1, 7, "req"), "a").unwrap();
        assert_eq!(request.kind(), EventKind::BidRequest);
        assert_eq!(request.agent(), "a");

        let error = decode_event(&raw(5, 42, "boom"), "a").unwrap();
        assert_eq!(
            error,
            EngineEvent::Error {
                agent: "a".to_string(),
                code: 42,
                message: "boom".to_string()
            }
        );
    }

    #[test]
    fn test_decode_event_rejects() {
        assert_eq!(
            decode_event(&raw(2, 1, ""), "a").unwrap_err(),
            SkipReason::Unsupported { tag: 2 }
        );
        assert_eq!(
            decode_event(&raw(17, 1, ""), "a").unwrap_err(),
            SkipReason::UnknownKind { tag: 17 }
        );
    }

    #[test]
    fn test_per_agent_routing_in_order() {
        let (engine, system) = system();
        let _a = system.create_agent("A").unwrap();
        let _b = system.create_agent("B").unwrap();
        let ha = Arc::new(Recorder::default());
        let hb = Arc::new(Recorder::default());
        system.register_handler("A", ha.clone()).unwrap();
        system.register_handler("B", hb.clone()).unwrap();

        engine.inject_bid_request("A", 1, "p1");
        engine.inject_bid_request("B", 2, "p2");
        engine.inject_bid_request("A", 3, "p3");

        let stats = system.dispatcher().dispatch_once().unwrap();
        assert_eq!(stats.retrieved, 3);
        assert_eq!(stats.delivered, 3);
        assert_eq!(ha.seen(), vec!["A:request:1", "A:request:3"]);
        assert_eq!(hb.seen(), vec!["B:request:2"]);
    }

    #[test]
    fn test_unregistered_and_released_are_skipped() {
        let (engine, system) = system();
        let a = system.create_agent("A").unwrap();
        let _b = system.create_agent("B").unwrap();
        let ha = Arc::new(Recorder::default());
        system.register_handler("A", ha.clone()).unwrap();

        // B has no handler
        engine.inject_bid_request("B", 1, "");
        // A's event is still queued when A goes away
        engine.inject_bid_request("A", 2, "");
        a.release().unwrap();

        let stats = system.dispatcher().dispatch_once().unwrap();
        assert_eq!(stats.retrieved, 2);
        assert_eq!(stats.delivered, 0);
        assert_eq!(stats.skipped, 2);
        assert!(ha.seen().is_empty());

        let skipped = system.skipped().list(10).unwrap();
        assert_eq!(skipped[0].reason, SkipReason::UnknownSubject);
        assert_eq!(skipped[1].reason, SkipReason::NoHandler);
        assert_eq!(skipped[1].agent.as_deref(), Some("B"));
    }

    #[test]
    fn test_unknown_kind_is_skipped() {
        let (engine, system) = system();
        let _a = system.create_agent("A").unwrap();
        let ha = Arc::new(Recorder::default());
        system.register_handler("A", ha.clone()).unwrap();

        engine.inject_tag("A", 99, 1, "");
        engine.inject("A", EventKind::Win, 4, "");

        let stats = system.dispatcher().dispatch_once().unwrap();
        assert_eq!(stats.skipped, 1);
        assert_eq!(stats.delivered, 1);
        assert_eq!(ha.seen(), vec!["A:win:4"]);
        assert_eq!(
            system.skipped().list(1).unwrap()[0].reason,
            SkipReason::UnknownKind { tag: 99 }
        );
    }

    #[test]
    fn test_every_kind_reaches_handler() {
        let (engine, system) = system();
        let _a = system.create_agent("A").unwrap();
        let ha = Arc::new(Recorder::default());
        system.register_handler("A", ha.clone()).unwrap();

        engine.inject("A", EventKind::Config, 0, "cfg");
        engine.inject("A", EventKind::BidRequest, 1, "");
        engine.inject("A", EventKind::BidResult, 1, "");
        engine.inject("A", EventKind::Win, 1, "");
        engine.inject("A", EventKind::Error, 3, "late");

        system.dispatcher().dispatch_once().unwrap();
        assert_eq!(
            ha.seen(),
            vec![
                "A:config:cfg",
                "A:request:1",
                "A:result:1",
                "A:win:1",
                "A:error:3:late"
            ]
        );
    }

    #[test]
    fn test_returned_bid_is_sent() {
        let (engine, system) = system();
        let _a = system.create_agent("A").unwrap();
        system
            .register_handler("A", Arc::new(Recorder::bidding(250)))
            .unwrap();

        engine.inject_bid_request("A", 11, "");
        let stats = system.dispatcher().dispatch_once().unwrap();
        assert_eq!(stats.bids_sent, 1);

        let sent = engine.sent_events();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].agent, "A");
        assert_eq!(
            sent[0].event,
            OutboundEvent::BidResponse {
                bid: Bid::new(11, 250)
            }
        );
    }

    #[test]
    fn test_end_to_end_single_iteration() {
        let (engine, system) = system();
        let agent = system.create_agent("agent-1").unwrap();
        let calls = Arc::new(Mutex::new(Vec::new()));
        let seen = calls.clone();
        system
            .register_handler(
                "agent-1",
                Arc::new(FnHandler::new(move |_: &str, req: &BidRequest| {
                    seen.lock().unwrap().push(req.clone());
                    None
                })),
            )
            .unwrap();

        engine.inject_bid_request("agent-1", 9, "payload");
        system.dispatcher().dispatch_once().unwrap();

        let calls = calls.lock().unwrap().clone();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].id, 9);
        assert_eq!(calls[0].payload, Bytes::from_static(b"payload"));

        agent.release().unwrap();
        system.shutdown().unwrap();
        assert_eq!(engine.stats().misuse, 0);
    }

    #[test]
    fn test_next_event_decodes_without_delivering() {
        let (engine, system) = system();
        let _a = system.create_agent("A").unwrap();
        let ha = Arc::new(Recorder::default());
        system.register_handler("A", ha.clone()).unwrap();

        engine.inject_tag("A", 42, 0, "");
        engine.inject_bid_request("A", 5, "");

        let event = system.dispatcher().next_event().unwrap().unwrap();
        assert_eq!(event.kind(), EventKind::BidRequest);
        assert!(ha.seen().is_empty());
        assert_eq!(system.skipped().count().unwrap(), 1);

        assert!(system.dispatcher().next_event().unwrap().is_none());
    }

    #[test]
    fn test_max_batch_bounds_iteration() {
        let engine = Arc::new(SimulatedEngine::new());
        let config = BridgeConfig {
            max_batch: 2,
            ..fast_config()
        };
        let system = RtbSystem::initialize_with_config(engine.clone(), "b.json", config).unwrap();
        let _a = system.create_agent("A").unwrap();
        system
            .register_handler("A", Arc::new(Recorder::default()))
            .unwrap();
        for id in 0..5 {
            engine.inject_bid_request("A", id, "");
        }

        let stats = system.dispatcher().dispatch_once().unwrap();
        assert_eq!(stats.retrieved, 2);
        assert_eq!(engine.pending(), 3);
    }

    #[test]
    fn test_run_skip_policy_on_cancel() {
        let engine = Arc::new(SimulatedEngine::new());
        let config = BridgeConfig {
            stop_policy: StopPolicy::Skip,
            ..fast_config()
        };
        let system = RtbSystem::initialize_with_config(engine.clone(), "b.json", config).unwrap();
        let _a = system.create_agent("A").unwrap();
        let cancel = CancellationToken::new();

        // The handler stops the loop mid-batch
        let stopper = cancel.clone();
        system
            .register_handler(
                "A",
                Arc::new(FnHandler::new(move |_: &str, _: &BidRequest| {
                    stopper.cancel();
                    None
                })),
            )
            .unwrap();
        for id in 0..3 {
            engine.inject_bid_request("A", id, "");
        }

        let stats = system.dispatcher().run(&cancel).unwrap();
        assert_eq!(stats.delivered, 1);
        assert_eq!(stats.skipped, 2);
        let skipped = system.skipped().list(10).unwrap();
        assert!(skipped.iter().all(|s| s.reason == SkipReason::Cancelled));
    }

    #[test]
    fn test_run_drain_policy_on_cancel() {
        let (engine, system) = system();
        let _a = system.create_agent("A").unwrap();
        let cancel = CancellationToken::new();
        let stopper = cancel.clone();
        system
            .register_handler(
                "A",
                Arc::new(FnHandler::new(move |_: &str, _: &BidRequest| {
                    stopper.cancel();
                    None
                })),
            )
            .unwrap();
        for id in 0..3 {
            engine.inject_bid_request("A", id, "");
        }

        let stats = system.dispatcher().run(&cancel).unwrap();
        assert_eq!(stats.delivered, 3);
        assert_eq!(stats.skipped, 0);
        assert_eq!(system.skipped().count().unwrap(), 0);
    }

    #[test]
    fn test_poll_error_keeps_retrieved_events() {
        let (engine, system) = system();
        let _a = system.create_agent("A").unwrap();
        let ha = Arc::new(Recorder::default());
        system.register_handler("A", ha.clone()).unwrap();
        engine.inject_bid_request("A", 1, "");
        engine.inject_bid_request("A", 2, "");

        // The system goes away between the first and second poll
        let dispatcher = system.dispatcher();
        let mut polls = 0;
        let batch = dispatcher
            .collect_batch(|timeout| {
                polls += 1;
                if polls == 2 {
                    system.shutdown()?;
                }
                dispatcher.shared.proxy.poll_next_event(timeout)
            })
            .unwrap();
        assert_eq!(polls, 2);
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].id, 1);

        let stats = dispatcher.process_batch(batch, None).unwrap();
        assert_eq!(stats.retrieved, 1);
        assert_eq!(stats.skipped, 1);
        assert!(ha.seen().is_empty());
        let skipped = system.skipped().list(10).unwrap();
        assert_eq!(skipped.len(), 1);
        assert_eq!(skipped[0].raw.id, 1);
        assert_eq!(skipped[0].reason, SkipReason::UnknownSubject);

        assert!(matches!(
            dispatcher.dispatch_once().unwrap_err(),
            BridgeError::UseAfterFree(_)
        ));
    }

    #[test]
    fn test_poll_error_on_empty_batch_is_returned() {
        let (_engine, system) = system();
        let dispatcher = system.dispatcher();
        let closed = || BridgeError::Engine {
            code: 9,
            message: "socket closed".to_string(),
        };
        let err = dispatcher.collect_batch(|_| Err(closed())).unwrap_err();
        assert!(matches!(err, BridgeError::Engine { code: 9, .. }));
    }

    #[test]
    fn test_out_of_range_bid_counts_as_send_failure() {
        let (engine, system) = system();
        let _a = system.create_agent("A").unwrap();
        system
            .register_handler("A", Arc::new(Recorder::bidding(i64::MAX)))
            .unwrap();

        engine.inject_bid_request("A", 3, "");
        let stats = system.dispatcher().dispatch_once().unwrap();
        assert_eq!(stats.delivered, 1);
        assert_eq!(stats.bids_sent, 0);
        assert_eq!(stats.send_failures, 1);
        assert!(engine.sent_events().is_empty());
    }

    #[test]
    fn test_run_exits_after_shutdown() {
        let (_engine, system) = system();
        system.shutdown().unwrap();

        let stats = system.dispatcher().run(&CancellationToken::new()).unwrap();
        assert_eq!(stats.iterations, 0);
        assert!(matches!(
            system.dispatcher().dispatch_once().unwrap_err(),
            BridgeError::UseAfterFree(_)
        ));
    }
}
