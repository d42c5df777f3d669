//! Durable per-session delivery cursors.
//!
//! A cursor records the last message id delivered to a session on a channel.
//! Cursors outlive individual held connections so a reconnecting client that
//! does not declare its own last ids still resumes without gaps. They are
//! evicted after an idle period; losing one only means the next hold starts
//! fresh.

use std::sync::Arc;
use std::time::Duration;

use dashmap::{mapref::entry::Entry, DashMap};
use tokio::time::Instant;
use tracing::trace;

use crate::types::{ChannelName, MessageId, SessionId};

/// Backend-defined ordering of message ids.
///
/// The engine only ever asks whether one id comes after another; it never
/// assumes ids are numeric or lexicographically ordered.
pub trait IdOrdering: Send + Sync {
    /// Returns true when `candidate` is newer than `current`.
    fn follows(&self, candidate: &MessageId, current: &MessageId) -> bool;
}

/// Treats every id other than the current one as newer.
///
/// Correct whenever ids for a channel reach the engine in publish order,
/// which the per-channel dispatcher guarantees.
#[derive(Debug, Default, Clone, Copy)]
pub struct ArrivalOrder;

impl IdOrdering for ArrivalOrder {
    fn follows(&self, candidate: &MessageId, current: &MessageId) -> bool {
        candidate != current
    }
}

/// Ordering supplied by the backend as a closure.
pub struct FnOrdering<F>(pub F);

impl<F> IdOrdering for FnOrdering<F>
where
    F: Fn(&MessageId, &MessageId) -> bool + Send + Sync,
{
    fn follows(&self, candidate: &MessageId, current: &MessageId) -> bool {
        (self.0)(candidate, current)
    }
}

struct CursorEntry {
    id: MessageId,
    touched: Instant,
}

pub struct ChannelCursorStore {
    entries: DashMap<(SessionId, ChannelName), CursorEntry>,
    ordering: Arc<dyn IdOrdering>,
}

impl ChannelCursorStore {
    pub fn new(ordering: Arc<dyn IdOrdering>) -> Self {
        Self {
            entries: DashMap::new(),
            ordering,
        }
    }

    pub fn ordering(&self) -> &Arc<dyn IdOrdering> {
        &self.ordering
    }

    pub fn get(&self, session_id: &SessionId, channel: &ChannelName) -> Option<MessageId> {
        if session_id.is_empty() {
            return None;
        }
        self.entries
            .get(&(session_id.clone(), channel.clone()))
            .map(|entry| entry.id.clone())
    }

    /// Records `id` as delivered. The stored cursor only moves forward; an id
    /// that does not follow the stored one leaves it untouched. Returns
    /// whether the cursor changed.
    pub fn set(&self, session_id: &SessionId, channel: &ChannelName, id: &MessageId) -> bool {
        if session_id.is_empty() {
            return false;
        }

        let now = Instant::now();
        match self.entries.entry((session_id.clone(), channel.clone())) {
            Entry::Vacant(vacant) => {
                vacant.insert(CursorEntry {
                    id: id.clone(),
                    touched: now,
                });
                true
            }
            Entry::Occupied(mut occupied) => {
                let entry = occupied.get_mut();
                entry.touched = now;
                if self.ordering.follows(id, &entry.id) {
                    entry.id = id.clone();
                    true
                } else {
                    trace!(
                        target: "hold.cursor",
                        session = %session_id,
                        channel = %channel,
                        stored = %entry.id,
                        rejected = %id,
                        "cursor not advanced"
                    );
                    false
                }
            }
        }
    }

    /// Drops cursors not written within `max_idle`. Returns how many were removed.
    pub fn evict_older_than(&self, max_idle: Duration) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries
            .retain(|_, entry| now.saturating_duration_since(entry.touched) <= max_idle);
        before.saturating_sub(self.entries.len())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for ChannelCursorStore {
    fn default() -> Self {
        Self::new(Arc::new(ArrivalOrder))
    }
}
