//! Collaborator doubles shared by the unit and integration tests.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::backend::{BackendFetcher, FetchReply, Transport};
use crate::error::{CloseReason, FetchError, TransportError};
use crate::inspect::ProxyRequest;
use crate::types::{HoldHandle, Payload, UserData};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Write(HoldHandle, Payload),
    Close(HoldHandle, CloseReason),
}

/// Records every write and close in order.
#[derive(Default)]
pub struct RecordingTransport {
    events: Mutex<Vec<TransportEvent>>,
    failing: Mutex<HashSet<HoldHandle>>,
    stalled: Mutex<HashSet<HoldHandle>>,
    write_delay: Mutex<Duration>,
    notify: Notify,
}

impl RecordingTransport {
    pub fn fail_writes_to(&self, handle: HoldHandle) {
        self.failing.lock().insert(handle);
    }

    /// Writes to `handle` never complete.
    pub fn stall_writes_to(&self, handle: HoldHandle) {
        self.stalled.lock().insert(handle);
    }

    /// Every write takes `delay` before it is recorded.
    pub fn delay_writes(&self, delay: Duration) {
        *self.write_delay.lock() = delay;
    }

    pub fn events(&self) -> Vec<TransportEvent> {
        self.events.lock().clone()
    }

    pub fn writes_to(&self, handle: HoldHandle) -> Vec<Payload> {
        self.events
            .lock()
            .iter()
            .filter_map(|event| match event {
                TransportEvent::Write(h, payload) if *h == handle => Some(payload.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn close_reason(&self, handle: HoldHandle) -> Option<CloseReason> {
        self.events.lock().iter().find_map(|event| match event {
            TransportEvent::Close(h, reason) if *h == handle => Some(*reason),
            _ => None,
        })
    }

    pub async fn wait_for_events(&self, count: usize) -> Vec<TransportEvent> {
        loop {
            let notified = self.notify.notified();
            {
                let events = self.events.lock();
                if events.len() >= count {
                    return events.clone();
                }
            }
            notified.await;
        }
    }

    fn push(&self, event: TransportEvent) {
        self.events.lock().push(event);
        self.notify.notify_waiters();
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn write_message(&self, handle: HoldHandle, payload: Payload) -> Result<(), TransportError> {
        if self.failing.lock().contains(&handle) {
            return Err(TransportError::Write("broken pipe".into()));
        }
        if self.stalled.lock().contains(&handle) {
            std::future::pending::<()>().await;
        }
        let delay = *self.write_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.push(TransportEvent::Write(handle, payload));
        Ok(())
    }

    async fn close_connection(&self, handle: HoldHandle, reason: CloseReason) {
        self.push(TransportEvent::Close(handle, reason));
    }
}

/// Returns a replaceable reply after an optional delay, counting calls.
pub struct ScriptedFetcher {
    reply: Mutex<Result<FetchReply, FetchError>>,
    delay: Duration,
    calls: AtomicUsize,
}

impl ScriptedFetcher {
    pub fn new(reply: Result<FetchReply, FetchError>) -> Self {
        Self {
            reply: Mutex::new(reply),
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Replaces the reply for later fetches.
    pub fn set_reply(&self, reply: Result<FetchReply, FetchError>) {
        *self.reply.lock() = reply;
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BackendFetcher for ScriptedFetcher {
    async fn fetch(
        &self,
        _request: &ProxyRequest,
        _user_data: &UserData,
    ) -> Result<FetchReply, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.reply.lock().clone()
    }
}
