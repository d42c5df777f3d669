//! The engine façade: classifies requests into reject / forward / hold and
//! accepts published events.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use metrics::counter;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::backend::{BackendFetcher, BackendResponse, FetchReply, HoldInstruction, Transport};
use crate::config::EngineConfig;
use crate::cursor::{ArrivalOrder, ChannelCursorStore, IdOrdering};
use crate::dispatch::{DispatchConfig, PublishDispatcher, PublishEvent};
use crate::error::{CloseReason, EngineError, FetchError};
use crate::hold::{HeldConnection, HoldRegistry};
use crate::inspect::{InspectionResult, Inspector, ProxyRequest};
use crate::sharing::{Acquired, RequestSharingRegistry};
use crate::types::HoldHandle;

/// What the transport should do with a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandleOutcome {
    /// Not proxied; the caller answers the client itself.
    Rejected,
    /// Relay this origin response unmodified.
    Forwarded(BackendResponse),
    /// Keep the connection open. `initial_response`, when present, is written
    /// before the connection starts waiting for publishes.
    Held {
        handle: HoldHandle,
        initial_response: Option<BackendResponse>,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EngineStats {
    pub held_connections: usize,
    pub subscribed_channels: usize,
    pub in_flight_fetches: usize,
    pub cursor_entries: usize,
    pub channel_workers: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub expired: usize,
    pub evicted_cursors: usize,
}

#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    config: EngineConfig,
    holds: Arc<HoldRegistry>,
    cursors: Arc<ChannelCursorStore>,
    sharing: RequestSharingRegistry<Arc<FetchReply>>,
    dispatcher: PublishDispatcher,
    fetcher: Arc<dyn BackendFetcher>,
    inspector: Option<Arc<dyn Inspector>>,
    shutting_down: AtomicBool,
}

pub struct EngineBuilder {
    config: EngineConfig,
    fetcher: Arc<dyn BackendFetcher>,
    transport: Arc<dyn Transport>,
    inspector: Option<Arc<dyn Inspector>>,
    ordering: Arc<dyn IdOrdering>,
}

impl EngineBuilder {
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn inspector(mut self, inspector: Arc<dyn Inspector>) -> Self {
        self.inspector = Some(inspector);
        self
    }

    /// Backend ordering of message ids. Defaults to [`ArrivalOrder`].
    pub fn ordering(mut self, ordering: Arc<dyn IdOrdering>) -> Self {
        self.ordering = ordering;
        self
    }

    /// Assembles the engine. Channel workers and shared-fetch supervisors are
    /// spawned on demand, so the engine must be used inside a Tokio runtime.
    pub fn build(self) -> Engine {
        let holds = Arc::new(HoldRegistry::new(self.config.max_held_connections));
        let cursors = Arc::new(ChannelCursorStore::new(self.ordering));
        let dispatcher = PublishDispatcher::new(
            Arc::clone(&holds),
            Arc::clone(&cursors),
            self.transport,
            DispatchConfig {
                queue_depth: self.config.channel_queue_depth,
                idle_timeout: self.config.channel_idle_timeout,
                write_timeout: self.config.write_timeout,
            },
        );

        Engine {
            inner: Arc::new(EngineInner {
                sharing: RequestSharingRegistry::new(self.config.shared_fetch_timeout),
                config: self.config,
                holds,
                cursors,
                dispatcher,
                fetcher: self.fetcher,
                inspector: self.inspector,
                shutting_down: AtomicBool::new(false),
            }),
        }
    }
}

impl Engine {
    pub fn builder(fetcher: Arc<dyn BackendFetcher>, transport: Arc<dyn Transport>) -> EngineBuilder {
        EngineBuilder {
            config: EngineConfig::default(),
            fetcher,
            transport,
            inspector: None,
            ordering: Arc::new(ArrivalOrder),
        }
    }

    pub fn new(
        config: EngineConfig,
        fetcher: Arc<dyn BackendFetcher>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self::builder(fetcher, transport).config(config).build()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn holds(&self) -> &HoldRegistry {
        &self.inner.holds
    }

    pub fn cursors(&self) -> &ChannelCursorStore {
        &self.inner.cursors
    }

    pub fn dispatcher(&self) -> &PublishDispatcher {
        &self.inner.dispatcher
    }

    /// Runs the configured [`Inspector`] and handles the request. Any
    /// inspection failure rejects the request.
    pub async fn inspect_and_handle(
        &self,
        request: &ProxyRequest,
    ) -> Result<HandleOutcome, EngineError> {
        let inspection = match &self.inner.inspector {
            Some(inspector) => inspector.inspect(request).await,
            None => Err(EngineError::InspectionUnavailable(
                "no inspector configured".into(),
            )),
        };

        match inspection {
            Ok(inspection) => self.handle(request, &inspection).await,
            Err(err) => {
                warn!(
                    target: "hold.engine",
                    uri = %request.uri,
                    error = %err,
                    "inspection failed; rejecting request"
                );
                counter!("hold_engine_requests_total", 1, "outcome" => err.metric_label());
                Ok(HandleOutcome::Rejected)
            }
        }
    }

    pub async fn handle(
        &self,
        request: &ProxyRequest,
        inspection: &InspectionResult,
    ) -> Result<HandleOutcome, EngineError> {
        if !inspection.do_proxy || self.inner.shutting_down.load(Ordering::Acquire) {
            counter!("hold_engine_requests_total", 1, "outcome" => "rejected");
            return Ok(HandleOutcome::Rejected);
        }

        let reply = match self.fetch(request, inspection).await {
            Ok(reply) => reply,
            Err(err) => {
                let err = EngineError::from(err);
                counter!("hold_engine_requests_total", 1, "outcome" => err.metric_label());
                debug!(target: "hold.engine", uri = %request.uri, error = %err, "fetch failed");
                return Err(err);
            }
        };

        let outcome = match reply.as_ref() {
            FetchReply::Response(response) => {
                counter!("hold_engine_requests_total", 1, "outcome" => "forwarded");
                HandleOutcome::Forwarded(response.clone())
            }
            FetchReply::Hold(instruction) => {
                let handle = self.hold(inspection, instruction).map_err(|err| {
                    counter!("hold_engine_requests_total", 1, "outcome" => err.metric_label());
                    err
                })?;
                // Shutdown may have swept the registry while the fetch was
                // pending. The caller never learned the handle, so it is
                // released without a transport close.
                if self.inner.shutting_down.load(Ordering::Acquire) {
                    if let Some(connection) = self.inner.holds.unregister(handle) {
                        connection.mark_closing();
                    }
                    debug!(target: "hold.engine", handle = %handle, "hold dropped during shutdown");
                    counter!("hold_engine_requests_total", 1, "outcome" => "rejected");
                    return Ok(HandleOutcome::Rejected);
                }
                counter!("hold_engine_requests_total", 1, "outcome" => "held");
                HandleOutcome::Held {
                    handle,
                    initial_response: instruction.initial_response.clone(),
                }
            }
        };
        Ok(outcome)
    }

    /// Hands `event` to its channel worker. Never blocks the caller; delivery
    /// problems are logged and counted, not returned.
    pub fn ingest_publish(&self, event: PublishEvent) {
        self.inner.dispatcher.ingest(event);
    }

    /// The transport reports a client that went away. Safe to call for a
    /// handle the engine already closed.
    pub fn on_disconnect(&self, handle: HoldHandle) -> bool {
        match self.inner.holds.unregister(handle) {
            Some(connection) => {
                connection.mark_closing();
                debug!(target: "hold.engine", handle = %handle, "client disconnected");
                true
            }
            None => false,
        }
    }

    /// Closes expired holds and evicts idle session cursors.
    pub async fn sweep(&self) -> SweepReport {
        let mut report = SweepReport::default();
        for handle in self.inner.holds.expired(Instant::now()) {
            if self
                .inner
                .dispatcher
                .close(handle, CloseReason::HoldTimeout)
                .await
            {
                report.expired += 1;
            }
        }
        report.evicted_cursors = self
            .inner
            .cursors
            .evict_older_than(self.inner.config.cursor_idle_ttl);

        if report.expired > 0 || report.evicted_cursors > 0 {
            debug!(
                target: "hold.engine",
                expired = report.expired,
                evicted_cursors = report.evicted_cursors,
                "housekeeping sweep"
            );
        }
        report
    }

    pub fn spawn_housekeeping(&self) -> JoinHandle<()> {
        let engine = self.clone();
        let mut interval = tokio::time::interval(self.inner.config.sweep_interval);
        tokio::spawn(async move {
            loop {
                interval.tick().await;
                if engine.inner.shutting_down.load(Ordering::Acquire) {
                    break;
                }
                engine.sweep().await;
            }
        })
    }

    /// Stops accepting requests and publishes, then closes every held
    /// connection with [`CloseReason::Shutdown`].
    pub async fn shutdown(&self) -> usize {
        if self.inner.shutting_down.swap(true, Ordering::AcqRel) {
            return 0;
        }
        self.inner.dispatcher.shutdown();

        let mut closed = 0;
        for handle in self.inner.holds.handles() {
            if self
                .inner
                .dispatcher
                .close(handle, CloseReason::Shutdown)
                .await
            {
                closed += 1;
            }
        }
        info!(target: "hold.engine", closed, "engine shut down");
        closed
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            held_connections: self.inner.holds.len(),
            subscribed_channels: self.inner.holds.channel_count(),
            in_flight_fetches: self.inner.sharing.in_flight(),
            cursor_entries: self.inner.cursors.len(),
            channel_workers: self.inner.dispatcher.worker_count(),
        }
    }

    /// Every caller, leader or follower, takes its outcome from the shared
    /// wait so all of them observe the same result. The leader's fetch runs
    /// on its own task, so a leader whose client goes away only withdraws
    /// its own wait.
    async fn fetch(
        &self,
        request: &ProxyRequest,
        inspection: &InspectionResult,
    ) -> Result<Arc<FetchReply>, FetchError> {
        match self.inner.sharing.acquire(&inspection.sharing_key) {
            Acquired::Leader { leader, wait } => {
                let fetcher = Arc::clone(&self.inner.fetcher);
                let timeout = self.inner.config.shared_fetch_timeout;
                let request = request.clone();
                let user_data = inspection.user_data.clone();
                tokio::spawn(async move {
                    let fetched =
                        tokio::time::timeout(timeout, fetcher.fetch(&request, &user_data)).await;
                    let outcome = match fetched {
                        Ok(result) => result.map(Arc::new),
                        Err(_) => Err(FetchError::Timeout),
                    };
                    leader.resolve(outcome);
                });
                wait.wait().await
            }
            Acquired::Follower(wait) => wait.wait().await,
        }
    }

    fn hold(
        &self,
        inspection: &InspectionResult,
        instruction: &HoldInstruction,
    ) -> Result<HoldHandle, EngineError> {
        let session = &inspection.session_id;
        let mut connection = HeldConnection::new(
            session.clone(),
            instruction.channels.iter().map(|channel| channel.name.clone()),
            instruction.close_policy,
        );

        // Client-declared ids win, then the backend's, then the session's
        // durable cursor.
        for channel in &instruction.channels {
            let cursor = inspection
                .last_ids
                .get(&channel.name)
                .cloned()
                .or_else(|| channel.prev_id.clone())
                .or_else(|| self.inner.cursors.get(session, &channel.name));
            if let Some(id) = cursor {
                connection = connection.with_cursor(channel.name.clone(), id);
            }
        }

        if let Some(timeout) = self.inner.config.effective_hold_timeout(instruction.timeout) {
            connection = connection.with_deadline(Instant::now() + timeout);
        }

        self.inner.holds.register(connection)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::backend::HoldChannel;
    use crate::hold::ClosePolicy;
    use crate::testing::{RecordingTransport, ScriptedFetcher, TransportEvent};
    use crate::types::{ChannelName, MessageId, SessionId};
    use bytes::Bytes;

    fn engine_with(
        reply: Result<FetchReply, FetchError>,
        config: EngineConfig,
    ) -> (Engine, Arc<ScriptedFetcher>, Arc<RecordingTransport>) {
        let fetcher = Arc::new(ScriptedFetcher::new(reply).with_delay(Duration::from_millis(50)));
        let transport = Arc::new(RecordingTransport::default());
        let engine = Engine::new(config, fetcher.clone(), transport.clone());
        (engine, fetcher, transport)
    }

    fn hold_reply(channels: &[&'static str]) -> Result<FetchReply, FetchError> {
        Ok(FetchReply::Hold(HoldInstruction::new(
            channels.iter().map(|name| HoldChannel::new(*name)),
        )))
    }

    async fn held(engine: &Engine, inspection: &InspectionResult) -> HoldHandle {
        match engine
            .handle(&ProxyRequest::get("/stream"), inspection)
            .await
            .expect("handle")
        {
            HandleOutcome::Held { handle, .. } => handle,
            other => panic!("expected hold, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn do_proxy_false_is_rejected_without_fetching() {
        let (engine, fetcher, _) =
            engine_with(Ok(FetchReply::Response(BackendResponse::ok("x"))), EngineConfig::default());
        let inspection = InspectionResult::reject().with_sharing_key("k1").with_session("s1");

        let outcome = engine
            .handle(&ProxyRequest::get("/"), &inspection)
            .await
            .expect("handle");
        assert_eq!(outcome, HandleOutcome::Rejected);
        assert_eq!(fetcher.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn shared_key_fetches_once_for_concurrent_requests() {
        let (engine, fetcher, _) = engine_with(
            Ok(FetchReply::Response(BackendResponse::ok("shared body"))),
            EngineConfig::default(),
        );
        let request = ProxyRequest::get("/feed");
        let a = InspectionResult::proxy().with_sharing_key("k1").with_session("a");
        let b = InspectionResult::proxy().with_sharing_key("k1").with_session("b");

        let (first, second) = tokio::join!(engine.handle(&request, &a), engine.handle(&request, &b));

        let expected = HandleOutcome::Forwarded(BackendResponse::ok("shared body"));
        assert_eq!(first.expect("first"), expected);
        assert_eq!(second.expect("second"), expected);
        assert_eq!(fetcher.calls(), 1);
        assert_eq!(engine.stats().in_flight_fetches, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_leader_does_not_fail_followers() {
        let (engine, fetcher, _) = engine_with(
            Ok(FetchReply::Response(BackendResponse::ok("shared body"))),
            EngineConfig::default(),
        );
        let spawn_request = |session: &'static str| {
            let engine = engine.clone();
            tokio::spawn(async move {
                let inspection = InspectionResult::proxy()
                    .with_sharing_key("k1")
                    .with_session(session);
                engine.handle(&ProxyRequest::get("/feed"), &inspection).await
            })
        };

        let leader = spawn_request("leader");
        tokio::time::sleep(Duration::from_millis(10)).await;
        let follower = spawn_request("follower");
        tokio::time::sleep(Duration::from_millis(10)).await;
        leader.abort();

        let outcome = follower.await.expect("join").expect("handle");
        assert_eq!(outcome, HandleOutcome::Forwarded(BackendResponse::ok("shared body")));
        assert_eq!(fetcher.calls(), 1);
        assert_eq!(engine.stats().in_flight_fetches, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn unshared_requests_fetch_independently() {
        let (engine, fetcher, _) = engine_with(
            Ok(FetchReply::Response(BackendResponse::ok("x"))),
            EngineConfig::default(),
        );
        let request = ProxyRequest::get("/");
        let inspection = InspectionResult::proxy();

        let (first, second) = tokio::join!(
            engine.handle(&request, &inspection),
            engine.handle(&request, &inspection)
        );
        assert!(first.is_ok() && second.is_ok());
        assert_eq!(fetcher.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_backend_times_out() {
        let config = EngineConfig {
            shared_fetch_timeout: Duration::from_millis(10),
            ..EngineConfig::default()
        };
        let (engine, _, _) =
            engine_with(Ok(FetchReply::Response(BackendResponse::ok("late"))), config);

        let err = engine
            .handle(&ProxyRequest::get("/"), &InspectionResult::proxy().with_sharing_key("k1"))
            .await
            .expect_err("timeout");
        assert!(matches!(err, EngineError::SharedFetchTimeout));
    }

    #[tokio::test(start_paused = true)]
    async fn backend_failure_reaches_caller() {
        let (engine, _, _) = engine_with(
            Err(FetchError::Backend("connection refused".into())),
            EngineConfig::default(),
        );
        let err = engine
            .handle(&ProxyRequest::get("/"), &InspectionResult::proxy())
            .await
            .expect_err("backend error");
        assert!(matches!(err, EngineError::Fetch(FetchError::Backend(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn initial_cursors_prefer_client_then_backend_then_session() {
        let instruction = HoldInstruction::new([
            HoldChannel::new("a").with_prev_id("backend-a"),
            HoldChannel::new("b").with_prev_id("backend-b"),
            HoldChannel::new("c"),
            HoldChannel::new("d"),
        ]);
        let (engine, _, _) =
            engine_with(Ok(FetchReply::Hold(instruction)), EngineConfig::default());
        engine
            .cursors()
            .set(&SessionId::from("s1"), &ChannelName::from("c"), &MessageId::from("stored-c"));

        let inspection = InspectionResult::proxy()
            .with_session("s1")
            .with_last_id("a", "client-a");
        let handle = held(&engine, &inspection).await;

        let connection = engine.holds().get(handle).expect("held");
        let cursor = |name: &'static str| connection.cursor(&ChannelName::from(name));
        assert_eq!(cursor("a"), Some(MessageId::from("client-a")));
        assert_eq!(cursor("b"), Some(MessageId::from("backend-b")));
        assert_eq!(cursor("c"), Some(MessageId::from("stored-c")));
        assert_eq!(cursor("d"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_hold_is_invalid_subscription() {
        let (engine, _, _) = engine_with(hold_reply(&[]), EngineConfig::default());
        let err = engine
            .handle(&ProxyRequest::get("/"), &InspectionResult::proxy())
            .await
            .expect_err("no channels");
        assert!(matches!(err, EngineError::InvalidSubscription));
        assert_eq!(engine.stats().held_connections, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn capacity_is_reported_to_the_caller() {
        let config = EngineConfig {
            max_held_connections: 1,
            ..EngineConfig::default()
        };
        let (engine, _, _) = engine_with(hold_reply(&["c1"]), config);
        held(&engine, &InspectionResult::proxy()).await;

        let err = engine
            .handle(&ProxyRequest::get("/"), &InspectionResult::proxy())
            .await
            .expect_err("full");
        assert!(matches!(err, EngineError::CapacityExceeded { limit: 1 }));
    }

    #[tokio::test(start_paused = true)]
    async fn publish_delivers_then_gap_forces_reconnect() {
        let (engine, _, transport) = engine_with(hold_reply(&["c1"]), EngineConfig::default());
        let handle = held(&engine, &InspectionResult::proxy().with_session("s1")).await;

        engine.ingest_publish(PublishEvent::new("c1", "5", "five"));
        transport.wait_for_events(1).await;
        assert_eq!(
            engine.cursors().get(&SessionId::from("s1"), &ChannelName::from("c1")),
            Some(MessageId::from("5"))
        );

        engine.ingest_publish(PublishEvent::new("c1", "7", "seven").with_previous_id("6"));
        let events = transport.wait_for_events(2).await;
        assert_eq!(
            events,
            vec![
                TransportEvent::Write(handle, Bytes::from_static(b"five")),
                TransportEvent::Close(handle, CloseReason::GapDetected),
            ]
        );
        assert!(engine.holds().get(handle).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_resumes_from_session_cursor() {
        let (engine, _, transport) = engine_with(hold_reply(&["c1"]), EngineConfig::default());
        let inspection = InspectionResult::proxy().with_session("s1");

        let first = held(&engine, &inspection).await;
        engine.ingest_publish(PublishEvent::new("c1", "1", "one"));
        transport.wait_for_events(1).await;
        assert!(engine.on_disconnect(first));

        let second = held(&engine, &inspection).await;
        engine.ingest_publish(PublishEvent::new("c1", "1", "one"));
        engine.ingest_publish(PublishEvent::new("c1", "2", "two").with_previous_id("1"));
        transport.wait_for_events(2).await;

        assert_eq!(transport.writes_to(second), vec![Bytes::from_static(b"two")]);
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_is_idempotent_and_silent() {
        let (engine, _, transport) = engine_with(hold_reply(&["c1"]), EngineConfig::default());
        let a = held(&engine, &InspectionResult::proxy()).await;
        let b = held(&engine, &InspectionResult::proxy()).await;

        assert!(engine.on_disconnect(a));
        assert!(!engine.on_disconnect(a));
        assert!(engine.holds().get(b).is_some());
        assert!(transport.events().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn expired_holds_close_on_sweep() {
        let instruction = HoldInstruction::new([HoldChannel::new("c1")])
            .with_timeout(Duration::from_secs(10))
            .with_initial_response(BackendResponse::ok("waiting"));
        let (engine, _, transport) =
            engine_with(Ok(FetchReply::Hold(instruction)), EngineConfig::default());

        let outcome = engine
            .handle(&ProxyRequest::get("/"), &InspectionResult::proxy())
            .await
            .expect("handle");
        let HandleOutcome::Held {
            handle,
            initial_response,
        } = outcome
        else {
            panic!("expected hold");
        };
        assert_eq!(initial_response, Some(BackendResponse::ok("waiting")));

        assert_eq!(engine.sweep().await.expired, 0);
        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(engine.sweep().await.expired, 1);
        assert_eq!(transport.close_reason(handle), Some(CloseReason::HoldTimeout));
    }

    #[tokio::test(start_paused = true)]
    async fn housekeeping_task_runs_sweeps() {
        let instruction =
            HoldInstruction::new([HoldChannel::new("c1")]).with_timeout(Duration::from_secs(2));
        let (engine, _, transport) =
            engine_with(Ok(FetchReply::Hold(instruction)), EngineConfig::default());
        let handle = held(&engine, &InspectionResult::proxy()).await;

        let task = engine.spawn_housekeeping();
        transport.wait_for_events(1).await;
        assert_eq!(transport.close_reason(handle), Some(CloseReason::HoldTimeout));
        task.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_closes_everything_and_rejects_new_requests() {
        let (engine, fetcher, transport) = engine_with(hold_reply(&["c1", "c2"]), EngineConfig::default());
        let a = held(&engine, &InspectionResult::proxy()).await;
        let b = held(&engine, &InspectionResult::proxy()).await;

        assert_eq!(engine.shutdown().await, 2);
        assert_eq!(transport.close_reason(a), Some(CloseReason::Shutdown));
        assert_eq!(transport.close_reason(b), Some(CloseReason::Shutdown));
        assert_eq!(engine.stats(), EngineStats::default());

        let outcome = engine
            .handle(&ProxyRequest::get("/"), &InspectionResult::proxy())
            .await
            .expect("handle");
        assert_eq!(outcome, HandleOutcome::Rejected);
        assert_eq!(fetcher.calls(), 2);
        assert_eq!(engine.shutdown().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn hold_completing_after_shutdown_is_rejected() {
        let (engine, fetcher, transport) = engine_with(hold_reply(&["c1"]), EngineConfig::default());
        let pending = {
            let engine = engine.clone();
            tokio::spawn(async move {
                engine
                    .handle(&ProxyRequest::get("/stream"), &InspectionResult::proxy())
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(fetcher.calls(), 1);
        assert_eq!(engine.shutdown().await, 0);

        let outcome = pending.await.expect("join").expect("handle");
        assert_eq!(outcome, HandleOutcome::Rejected);
        assert_eq!(engine.stats().held_connections, 0);
        assert!(transport.events().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn failing_inspector_rejects() {
        let fetcher = Arc::new(ScriptedFetcher::new(Ok(FetchReply::Response(
            BackendResponse::ok("x"),
        ))));
        let transport = Arc::new(RecordingTransport::default());
        let inspector = Arc::new(
            |_: &ProxyRequest| -> Result<InspectionResult, EngineError> {
                Err(EngineError::InspectionUnavailable("inspector down".into()))
            },
        );
        let engine = Engine::builder(fetcher.clone(), transport)
            .inspector(inspector)
            .build();

        let outcome = engine
            .inspect_and_handle(&ProxyRequest::get("/"))
            .await
            .expect("fail-safe");
        assert_eq!(outcome, HandleOutcome::Rejected);
        assert_eq!(fetcher.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn stats_serialize() {
        let (engine, _, _) = engine_with(hold_reply(&["c1", "c2"]), EngineConfig::default());
        held(&engine, &InspectionResult::proxy()).await;

        let json = serde_json::to_value(engine.stats()).expect("serialize");
        assert_eq!(json["held_connections"], 1);
        assert_eq!(json["subscribed_channels"], 2);
    }
}
