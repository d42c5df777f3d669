//! Fan-out of published events to held connections.
//!
//! Every channel gets its own worker task fed by a bounded queue, so events
//! on one channel are delivered in publish order while unrelated channels
//! proceed independently. Within one event, writes to the matched
//! connections run concurrently and a failure on one connection never
//! affects the others.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::future::join_all;
use metrics::counter;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, trace, warn};

use crate::backend::Transport;
use crate::cursor::{ChannelCursorStore, IdOrdering};
use crate::display::payload_preview;
use crate::error::CloseReason;
use crate::hold::{HeldConnection, HoldRegistry};
use crate::types::{ChannelName, HoldHandle, MessageId, Payload};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Message,
    /// Closes connections held with [`crate::ClosePolicy::CloseOnControl`]
    /// after any payload is written.
    Control,
}

#[derive(Debug, Clone)]
pub struct PublishEvent {
    pub channel: ChannelName,
    pub id: MessageId,
    pub payload: Payload,
    /// Id this event directly follows; used to detect gaps.
    pub previous_id: Option<MessageId>,
    pub kind: EventKind,
}

impl PublishEvent {
    pub fn new(
        channel: impl Into<ChannelName>,
        id: impl Into<MessageId>,
        payload: impl Into<Payload>,
    ) -> Self {
        Self {
            channel: channel.into(),
            id: id.into(),
            payload: payload.into(),
            previous_id: None,
            kind: EventKind::Message,
        }
    }

    pub fn with_previous_id(mut self, previous_id: impl Into<MessageId>) -> Self {
        self.previous_id = Some(previous_id.into());
        self
    }

    pub fn control(mut self) -> Self {
        self.kind = EventKind::Control;
        self
    }

    pub fn is_control(&self) -> bool {
        self.kind == EventKind::Control
    }
}

/// Decision for one connection and one event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Deliver,
    /// Already delivered (or older than what was delivered); skip silently.
    Duplicate,
    /// The event follows an id the connection never saw.
    Gap {
        expected: MessageId,
        stored: MessageId,
    },
}

/// Applies the cursor rules for an event against a connection's cursor.
pub fn classify(
    cursor: Option<&MessageId>,
    event: &PublishEvent,
    ordering: &dyn IdOrdering,
) -> Verdict {
    let Some(stored) = cursor else {
        return Verdict::Deliver;
    };

    if *stored == event.id || !ordering.follows(&event.id, stored) {
        return Verdict::Duplicate;
    }

    match &event.previous_id {
        Some(previous) if previous != stored => Verdict::Gap {
            expected: previous.clone(),
            stored: stored.clone(),
        },
        _ => Verdict::Deliver,
    }
}

/// Tally of one event's fan-out.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    pub matched: usize,
    pub delivered: usize,
    pub duplicates: usize,
    pub gaps: usize,
    pub failed: usize,
    pub closed: usize,
}

enum Outcome {
    Delivered { closed: bool },
    Duplicate,
    Gap,
    Failed,
    Skipped,
}

#[derive(Clone)]
pub struct PublishDispatcher {
    inner: Arc<DispatchInner>,
}

struct DispatchInner {
    holds: Arc<HoldRegistry>,
    cursors: Arc<ChannelCursorStore>,
    transport: Arc<dyn Transport>,
    workers: DashMap<ChannelName, ChannelWorker>,
    next_worker_id: AtomicU64,
    queue_depth: usize,
    idle_timeout: Duration,
    write_timeout: Duration,
    shutting_down: AtomicBool,
}

struct ChannelWorker {
    id: u64,
    sender: mpsc::Sender<PublishEvent>,
    overflowed: Arc<AtomicBool>,
}

#[derive(Debug, Clone)]
pub struct DispatchConfig {
    pub queue_depth: usize,
    pub idle_timeout: Duration,
    pub write_timeout: Duration,
}

impl PublishDispatcher {
    pub fn new(
        holds: Arc<HoldRegistry>,
        cursors: Arc<ChannelCursorStore>,
        transport: Arc<dyn Transport>,
        config: DispatchConfig,
    ) -> Self {
        Self {
            inner: Arc::new(DispatchInner {
                holds,
                cursors,
                transport,
                workers: DashMap::new(),
                next_worker_id: AtomicU64::new(1),
                queue_depth: config.queue_depth.max(1),
                idle_timeout: config.idle_timeout,
                write_timeout: config.write_timeout,
                shutting_down: AtomicBool::new(false),
            }),
        }
    }

    /// Queues `event` on its channel's worker without waiting.
    ///
    /// A full queue drops the event and marks the channel overflowed; the
    /// next event the worker handles forces every matched connection to
    /// resynchronize, since continuity can no longer be proven.
    pub fn ingest(&self, event: PublishEvent) {
        if self.inner.shutting_down.load(Ordering::Acquire) {
            debug!(target: "hold.dispatch", channel = %event.channel, "dropping publish during shutdown");
            return;
        }

        counter!("hold_engine_publish_events_total", 1);
        let channel = event.channel.clone();

        // The send happens under the map guard so a worker can never retire
        // between being looked up and being handed the event.
        let event = match self.inner.workers.get(&channel) {
            Some(worker) => match worker.sender.try_send(event) {
                Ok(()) => return,
                Err(TrySendError::Full(event)) => {
                    self.inner.note_overflow(&worker, &event);
                    return;
                }
                Err(TrySendError::Closed(event)) => event,
            },
            None => event,
        };

        let mut worker = self.inner.workers.entry(channel.clone()).or_insert_with(|| {
            DispatchInner::spawn_worker(&self.inner, channel.clone())
        });
        if worker.sender.is_closed() {
            *worker = DispatchInner::spawn_worker(&self.inner, channel.clone());
        }
        match worker.sender.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => self.inner.note_overflow(&worker, &event),
            Err(TrySendError::Closed(event)) => {
                warn!(
                    target: "hold.dispatch",
                    channel = %channel,
                    id = %event.id,
                    "channel worker unavailable; event dropped"
                );
                worker.overflowed.store(true, Ordering::Release);
            }
        }
    }

    /// Delivers `event` on the caller's task and waits for every write.
    ///
    /// Callers must not run two of these concurrently for one channel;
    /// [`PublishDispatcher::ingest`] provides that ordering through the
    /// channel workers.
    pub async fn dispatch(&self, event: &PublishEvent) -> DeliveryReport {
        self.inner.deliver(event, false).await
    }

    /// Marks every live channel as overflowed, forcing a resync of all
    /// connections on each channel's next event.
    pub fn mark_all_overflowed(&self) {
        if self.inner.shutting_down.load(Ordering::Acquire) {
            return;
        }
        // Channels with subscribers but no live worker get one. A flagged
        // worker does not retire while its channel has subscribers, so the
        // flag survives until the next event.
        for channel in self.inner.holds.channel_names() {
            self.inner
                .workers
                .entry(channel.clone())
                .or_insert_with(|| DispatchInner::spawn_worker(&self.inner, channel))
                .overflowed
                .store(true, Ordering::Release);
        }
        for worker in self.inner.workers.iter() {
            worker.overflowed.store(true, Ordering::Release);
        }
        counter!("hold_engine_resyncs_forced_total", 1);
    }

    /// Closes `handle` with `reason` unless something else already is.
    /// Returns whether this call closed it.
    pub async fn close(&self, handle: HoldHandle, reason: CloseReason) -> bool {
        match self.inner.holds.get(handle) {
            Some(connection) => self.inner.close(&connection, reason).await,
            None => false,
        }
    }

    pub fn worker_count(&self) -> usize {
        self.inner.workers.len()
    }

    /// Stops accepting events and lets channel workers drain and exit.
    pub fn shutdown(&self) {
        self.inner.shutting_down.store(true, Ordering::Release);
        self.inner.workers.clear();
    }
}

impl DispatchInner {
    fn spawn_worker(inner: &Arc<Self>, channel: ChannelName) -> ChannelWorker {
        let id = inner.next_worker_id.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = mpsc::channel(inner.queue_depth);
        let overflowed = Arc::new(AtomicBool::new(false));

        let task_inner = Arc::clone(inner);
        let task_overflowed = Arc::clone(&overflowed);
        tokio::spawn(async move {
            task_inner
                .run_worker(channel, id, receiver, task_overflowed)
                .await;
        });

        ChannelWorker {
            id,
            sender,
            overflowed,
        }
    }

    async fn run_worker(
        self: Arc<Self>,
        channel: ChannelName,
        id: u64,
        mut receiver: mpsc::Receiver<PublishEvent>,
        overflowed: Arc<AtomicBool>,
    ) {
        trace!(target: "hold.dispatch", channel = %channel, worker = id, "channel worker started");
        loop {
            let event = match tokio::time::timeout(self.idle_timeout, receiver.recv()).await {
                Ok(Some(event)) => event,
                Ok(None) => break,
                Err(_) => {
                    // Retire only with an empty queue and no resync owed to
                    // current subscribers. Sends and `mark_all_overflowed`
                    // hold the map guard, so neither can race this check.
                    let retired = self
                        .workers
                        .remove_if(&channel, |_, worker| {
                            worker.id == id
                                && worker.sender.capacity() == worker.sender.max_capacity()
                                && !(worker.overflowed.load(Ordering::Acquire)
                                    && self.holds.has_subscribers(&channel))
                        })
                        .is_some();
                    if retired {
                        break;
                    }
                    continue;
                }
            };

            let force_resync = overflowed.swap(false, Ordering::AcqRel);
            self.deliver(&event, force_resync).await;
        }
        trace!(target: "hold.dispatch", channel = %channel, worker = id, "channel worker stopped");
    }

    fn note_overflow(&self, worker: &ChannelWorker, event: &PublishEvent) {
        worker.overflowed.store(true, Ordering::Release);
        counter!("hold_engine_publish_overflow_total", 1);
        warn!(
            target: "hold.dispatch",
            channel = %event.channel,
            id = %event.id,
            depth = self.queue_depth,
            "channel queue full; event dropped and subscribers will resync"
        );
    }

    async fn deliver(&self, event: &PublishEvent, force_resync: bool) -> DeliveryReport {
        let handles = self.holds.matching(&event.channel);
        let mut report = DeliveryReport {
            matched: handles.len(),
            ..DeliveryReport::default()
        };
        if handles.is_empty() {
            trace!(target: "hold.dispatch", channel = %event.channel, id = %event.id, "no subscribers");
            return report;
        }

        debug!(
            target: "hold.dispatch",
            channel = %event.channel,
            id = %event.id,
            subscribers = handles.len(),
            payload = %payload_preview(&event.payload),
            "fanning out event"
        );

        // A handle that vanished between lookup and here was unregistered
        // concurrently; it is simply skipped.
        let deliveries = handles
            .into_iter()
            .filter_map(|handle| self.holds.get(handle))
            .map(|connection| async move {
                self.deliver_one(&connection, event, force_resync).await
            });

        for outcome in join_all(deliveries).await {
            match outcome {
                Outcome::Delivered { closed } => {
                    report.delivered += 1;
                    report.closed += usize::from(closed);
                }
                Outcome::Duplicate => report.duplicates += 1,
                Outcome::Gap => {
                    report.gaps += 1;
                    report.closed += 1;
                }
                Outcome::Failed => {
                    report.failed += 1;
                    report.closed += 1;
                }
                Outcome::Skipped => {}
            }
        }

        counter!("hold_engine_messages_delivered_total", report.delivered as u64);
        if report.duplicates > 0 {
            counter!("hold_engine_duplicates_skipped_total", report.duplicates as u64);
        }
        if report.gaps > 0 {
            counter!("hold_engine_gaps_detected_total", report.gaps as u64);
        }
        if report.failed > 0 {
            counter!("hold_engine_delivery_failures_total", report.failed as u64);
        }
        report
    }

    async fn deliver_one(
        &self,
        connection: &HeldConnection,
        event: &PublishEvent,
        force_resync: bool,
    ) -> Outcome {
        if connection.is_closing() {
            return Outcome::Skipped;
        }
        let handle = connection.handle();

        if force_resync {
            debug!(
                target: "hold.dispatch",
                handle = %handle,
                channel = %event.channel,
                "forcing resync after dropped events"
            );
            return if self.close(connection, CloseReason::GapDetected).await {
                Outcome::Gap
            } else {
                Outcome::Skipped
            };
        }

        let cursor = connection.cursor(&event.channel);
        match classify(cursor.as_ref(), event, self.cursors.ordering().as_ref()) {
            Verdict::Duplicate => {
                trace!(
                    target: "hold.dispatch",
                    handle = %handle,
                    channel = %event.channel,
                    id = %event.id,
                    "duplicate skipped"
                );
                Outcome::Duplicate
            }
            Verdict::Gap { expected, stored } => {
                warn!(
                    target: "hold.dispatch",
                    handle = %handle,
                    channel = %event.channel,
                    id = %event.id,
                    expected_previous = %expected,
                    stored = %stored,
                    "gap detected; forcing reconnect"
                );
                if self.close(connection, CloseReason::GapDetected).await {
                    Outcome::Gap
                } else {
                    Outcome::Skipped
                }
            }
            Verdict::Deliver => {
                let wrote = !event.payload.is_empty() || !event.is_control();
                if !connection.reserve_delivery(event.is_control(), wrote) {
                    trace!(
                        target: "hold.dispatch",
                        handle = %handle,
                        channel = %event.channel,
                        id = %event.id,
                        "close policy already claimed; event not written"
                    );
                    return Outcome::Skipped;
                }
                if wrote {
                    let write = self
                        .transport
                        .write_message(handle, event.payload.clone());
                    let failure = match tokio::time::timeout(self.write_timeout, write).await {
                        Ok(Ok(())) => None,
                        Ok(Err(err)) => Some(err.to_string()),
                        Err(_) => Some(format!(
                            "write exceeded {} ms",
                            self.write_timeout.as_millis()
                        )),
                    };
                    if let Some(error) = failure {
                        warn!(
                            target: "hold.dispatch",
                            handle = %handle,
                            channel = %event.channel,
                            id = %event.id,
                            error = %error,
                            "delivery failed"
                        );
                        self.close(connection, CloseReason::DeliveryFailed).await;
                        return Outcome::Failed;
                    }
                }

                self.cursors
                    .set(connection.session_id(), &event.channel, &event.id);
                match connection.record_delivery(&event.channel, &event.id, event.is_control(), wrote)
                {
                    Some(reason) => {
                        self.retire(handle, reason).await;
                        Outcome::Delivered { closed: true }
                    }
                    None => Outcome::Delivered { closed: false },
                }
            }
        }
    }

    async fn close(&self, connection: &HeldConnection, reason: CloseReason) -> bool {
        if !connection.mark_closing() {
            return false;
        }
        self.retire(connection.handle(), reason).await;
        true
    }

    async fn retire(&self, handle: HoldHandle, reason: CloseReason) {
        self.holds.unregister(handle);
        self.transport.close_connection(handle, reason).await;
        counter!("hold_engine_connections_closed_total", 1, "reason" => reason.code());
        debug!(target: "hold.dispatch", handle = %handle, reason = reason.code(), "connection closed");
    }
}
