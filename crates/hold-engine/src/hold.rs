//! Registry of held client connections, indexed by channel.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use metrics::gauge;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;
use tracing::debug;

use crate::display::{trim_for_display, LOG_METADATA_MAX};
use crate::error::{CloseReason, EngineError};
use crate::types::{ChannelName, HoldHandle, MessageId, SessionId};

/// When the engine closes a held connection on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ClosePolicy {
    /// Stay open until the client leaves, the hold times out, or shutdown.
    KeepOpen,
    /// Close once this many messages have been delivered. Zero behaves as one.
    CloseAfterMessages(u32),
    /// Close when a control event is published on any subscribed channel.
    CloseOnControl,
}

pub struct HeldConnection {
    handle: HoldHandle,
    session_id: SessionId,
    channels: Vec<ChannelName>,
    close_policy: ClosePolicy,
    registered_at: Instant,
    deadline: Option<Instant>,
    state: Mutex<ConnectionState>,
}

#[derive(Default)]
struct ConnectionState {
    cursors: HashMap<ChannelName, MessageId>,
    delivered: u64,
    /// Writes reserved but not yet recorded.
    in_flight: u64,
    /// A reservation already used up the close policy.
    last_reserved: bool,
    /// Policy close waiting for in-flight writes to finish.
    pending_close: Option<CloseReason>,
    closing: bool,
}

impl HeldConnection {
    /// Duplicate channel names are collapsed, keeping first-seen order.
    pub fn new(
        session_id: SessionId,
        channels: impl IntoIterator<Item = ChannelName>,
        close_policy: ClosePolicy,
    ) -> Self {
        let mut unique = Vec::new();
        for channel in channels {
            if !unique.contains(&channel) {
                unique.push(channel);
            }
        }

        Self {
            handle: HoldHandle::next(),
            session_id,
            channels: unique,
            close_policy,
            registered_at: Instant::now(),
            deadline: None,
            state: Mutex::new(ConnectionState::default()),
        }
    }

    /// Seeds the cursor for `channel`. Ignored for channels the connection is
    /// not subscribed to.
    pub fn with_cursor(self, channel: ChannelName, id: MessageId) -> Self {
        if self.channels.contains(&channel) {
            self.state.lock().cursors.insert(channel, id);
        }
        self
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn handle(&self) -> HoldHandle {
        self.handle
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn channels(&self) -> &[ChannelName] {
        &self.channels
    }

    pub fn close_policy(&self) -> ClosePolicy {
        self.close_policy
    }

    pub fn registered_at(&self) -> Instant {
        self.registered_at
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn cursor(&self, channel: &ChannelName) -> Option<MessageId> {
        self.state.lock().cursors.get(channel).cloned()
    }

    pub fn delivered(&self) -> u64 {
        self.state.lock().delivered
    }

    pub fn is_closing(&self) -> bool {
        self.state.lock().closing
    }

    /// Claims the right to close this connection. Only the first caller gets
    /// `true`, so racing closers (publish, sweep, disconnect) close it once.
    pub(crate) fn mark_closing(&self) -> bool {
        let mut state = self.state.lock();
        !std::mem::replace(&mut state.closing, true)
    }

    /// Claims a delivery slot before an event is written. Refused once the
    /// connection is closing or an earlier claim already used up the close
    /// policy, so channel workers racing on one connection never write past
    /// a message limit or after a control event.
    pub(crate) fn reserve_delivery(&self, control: bool, wrote: bool) -> bool {
        let mut state = self.state.lock();
        if state.closing || state.last_reserved {
            return false;
        }
        state.last_reserved = match self.close_policy {
            ClosePolicy::KeepOpen => false,
            ClosePolicy::CloseAfterMessages(limit) => {
                wrote && state.delivered + state.in_flight + 1 >= u64::from(limit.max(1))
            }
            ClosePolicy::CloseOnControl => control,
        };
        if wrote {
            state.in_flight += 1;
        }
        true
    }

    /// Advances the live cursor once an event has been handled and applies
    /// the close policy. `wrote` is false for payload-less control events,
    /// which advance the cursor but do not count toward a message limit.
    /// Returns the reason to close with once the policy fired and no other
    /// reserved write is still in flight; the connection is then already
    /// marked closing.
    pub(crate) fn record_delivery(
        &self,
        channel: &ChannelName,
        id: &MessageId,
        control: bool,
        wrote: bool,
    ) -> Option<CloseReason> {
        let mut state = self.state.lock();
        state.cursors.insert(channel.clone(), id.clone());
        if wrote {
            state.in_flight = state.in_flight.saturating_sub(1);
            state.delivered += 1;
        }

        if state.closing {
            return None;
        }

        let fired = match self.close_policy {
            ClosePolicy::KeepOpen => None,
            ClosePolicy::CloseAfterMessages(limit) => (wrote
                && state.delivered >= u64::from(limit.max(1)))
            .then_some(CloseReason::MessageLimit),
            ClosePolicy::CloseOnControl => control.then_some(CloseReason::ControlMessage),
        };
        let reason = state.pending_close.take().or(fired);
        if reason.is_some() && state.in_flight > 0 {
            state.pending_close = reason;
            return None;
        }
        if reason.is_some() {
            state.closing = true;
        }
        reason
    }
}

pub struct HoldRegistry {
    connections: DashMap<HoldHandle, Arc<HeldConnection>>,
    channels: DashMap<ChannelName, BTreeSet<HoldHandle>>,
    held: AtomicUsize,
    capacity: usize,
}

impl HoldRegistry {
    pub fn new(capacity: usize) -> Self {
        Self {
            connections: DashMap::new(),
            channels: DashMap::new(),
            held: AtomicUsize::new(0),
            capacity,
        }
    }

    /// Adds `connection` to the channel index. Fails without registering
    /// anything when it has no channels or the registry is full.
    pub fn register(&self, connection: HeldConnection) -> Result<HoldHandle, EngineError> {
        if connection.channels.is_empty() {
            return Err(EngineError::InvalidSubscription);
        }

        let capacity = self.capacity;
        if self
            .held
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |held| {
                (held < capacity).then_some(held + 1)
            })
            .is_err()
        {
            return Err(EngineError::CapacityExceeded { limit: capacity });
        }

        let handle = connection.handle;
        let connection = Arc::new(connection);
        // Insert before indexing so a lookup through the index always finds
        // the connection.
        self.connections.insert(handle, Arc::clone(&connection));
        for channel in &connection.channels {
            self.channels
                .entry(channel.clone())
                .or_default()
                .insert(handle);
        }

        let held = self.connections.len();
        gauge!("hold_engine_connections_held", held as f64);
        debug!(
            target: "hold.registry",
            handle = %handle,
            session = %connection.session_id,
            channels = %trim_for_display(&channel_list(&connection.channels), LOG_METADATA_MAX),
            held,
            "connection held"
        );
        Ok(handle)
    }

    /// Removes the connection. Idempotent: a handle that is already gone
    /// yields `None`.
    pub fn unregister(&self, handle: HoldHandle) -> Option<Arc<HeldConnection>> {
        let (_, connection) = self.connections.remove(&handle)?;
        self.held.fetch_sub(1, Ordering::AcqRel);

        for channel in &connection.channels {
            if let Some(mut subscribers) = self.channels.get_mut(channel) {
                subscribers.remove(&handle);
            }
            self.channels
                .remove_if(channel, |_, subscribers| subscribers.is_empty());
        }

        gauge!("hold_engine_connections_held", self.connections.len() as f64);
        debug!(target: "hold.registry", handle = %handle, "connection released");
        Some(connection)
    }

    /// Handles subscribed to `channel`, in registration order.
    pub fn matching(&self, channel: &ChannelName) -> Vec<HoldHandle> {
        self.channels
            .get(channel)
            .map(|subscribers| subscribers.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn get(&self, handle: HoldHandle) -> Option<Arc<HeldConnection>> {
        self.connections
            .get(&handle)
            .map(|entry| Arc::clone(entry.value()))
    }

    /// Handles whose deadline is at or before `now`.
    pub fn expired(&self, now: Instant) -> Vec<HoldHandle> {
        let mut expired: Vec<HoldHandle> = self
            .connections
            .iter()
            .filter(|entry| entry.value().deadline.is_some_and(|deadline| deadline <= now))
            .map(|entry| *entry.key())
            .collect();
        expired.sort_unstable();
        expired
    }

    pub fn handles(&self) -> Vec<HoldHandle> {
        let mut handles: Vec<HoldHandle> =
            self.connections.iter().map(|entry| *entry.key()).collect();
        handles.sort_unstable();
        handles
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn channel_names(&self) -> Vec<ChannelName> {
        self.channels.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn has_subscribers(&self, channel: &ChannelName) -> bool {
        self.channels.contains_key(channel)
    }

    /// Number of channels with at least one held connection.
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }
}

fn channel_list(channels: &[ChannelName]) -> String {
    channels
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(",")
}
