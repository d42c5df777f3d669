//! Coalescing of concurrent equivalent requests into one backend fetch.
//!
//! The first request for a sharing key becomes the leader and performs the
//! fetch; requests arriving while that fetch is pending become followers.
//! Resolving delivers one outcome to every waiter (the leader's own caller
//! included) and then drops the entry, all under the key's shard lock, so a
//! request either joins a pending fetch or starts a new one and is never left
//! waiting on an entry that already resolved.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::{mapref::entry::Entry, DashMap};
use metrics::counter;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::FetchError;
use crate::types::SharingKey;

pub type SharedOutcome<T> = Result<T, FetchError>;

pub struct RequestSharingRegistry<T> {
    inner: Arc<SharingInner<T>>,
}

impl<T> Clone for RequestSharingRegistry<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct SharingInner<T> {
    fetches: DashMap<SharingKey, SharedFetch<T>>,
    next_id: AtomicU64,
    timeout: Duration,
}

struct SharedFetch<T> {
    generation: u64,
    waiters: Vec<Waiter<T>>,
    supervisor: Option<JoinHandle<()>>,
}

struct Waiter<T> {
    id: u64,
    sender: oneshot::Sender<SharedOutcome<T>>,
}

/// Result of [`RequestSharingRegistry::acquire`].
pub enum Acquired<T: Clone> {
    /// The caller must perform the fetch and resolve `leader`. Its own outcome
    /// arrives on `wait` like any follower's.
    Leader {
        leader: Leader<T>,
        wait: SharedWait<T>,
    },
    /// A fetch is already pending; the caller must not fetch.
    Follower(SharedWait<T>),
}

impl<T: Clone> Acquired<T> {
    pub fn is_leader(&self) -> bool {
        matches!(self, Acquired::Leader { .. })
    }
}

impl<T> RequestSharingRegistry<T>
where
    T: Clone + Send + 'static,
{
    /// `timeout` bounds how long a fetch may stay pending before every waiter
    /// is resolved with [`FetchError::Timeout`].
    pub fn new(timeout: Duration) -> Self {
        Self {
            inner: Arc::new(SharingInner {
                fetches: DashMap::new(),
                next_id: AtomicU64::new(1),
                timeout,
            }),
        }
    }

    /// Joins the pending fetch for `key`, or starts one with the caller as
    /// leader. An empty key bypasses sharing: the caller always leads alone.
    ///
    /// Must be called from within a Tokio runtime; the supervising timeout
    /// runs as a spawned task.
    pub fn acquire(&self, key: &SharingKey) -> Acquired<T> {
        if key.is_empty() {
            let (sender, receiver) = oneshot::channel();
            return Acquired::Leader {
                leader: Leader {
                    inner: Arc::clone(&self.inner),
                    key: key.clone(),
                    generation: 0,
                    solo: Some(sender),
                    resolved: false,
                },
                wait: SharedWait {
                    receiver,
                    registration: None,
                },
            };
        }

        let waiter_id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = oneshot::channel();

        match self.inner.fetches.entry(key.clone()) {
            Entry::Occupied(mut occupied) => {
                let fetch = occupied.get_mut();
                fetch.waiters.push(Waiter {
                    id: waiter_id,
                    sender,
                });
                let generation = fetch.generation;
                debug!(
                    target: "hold.sharing",
                    key = %key,
                    waiters = fetch.waiters.len(),
                    "joined pending fetch"
                );
                counter!("hold_engine_shared_fetch_followers_total", 1);
                Acquired::Follower(SharedWait {
                    receiver,
                    registration: Some(Registration {
                        inner: Arc::clone(&self.inner),
                        key: key.clone(),
                        generation,
                        waiter_id,
                    }),
                })
            }
            Entry::Vacant(vacant) => {
                let generation = waiter_id;
                let supervisor = self.spawn_supervisor(key.clone(), generation);
                vacant.insert(SharedFetch {
                    generation,
                    waiters: vec![Waiter {
                        id: waiter_id,
                        sender,
                    }],
                    supervisor: Some(supervisor),
                });
                debug!(target: "hold.sharing", key = %key, "started shared fetch");
                counter!("hold_engine_shared_fetch_leaders_total", 1);
                Acquired::Leader {
                    leader: Leader {
                        inner: Arc::clone(&self.inner),
                        key: key.clone(),
                        generation,
                        solo: None,
                        resolved: false,
                    },
                    wait: SharedWait {
                        receiver,
                        registration: Some(Registration {
                            inner: Arc::clone(&self.inner),
                            key: key.clone(),
                            generation,
                            waiter_id,
                        }),
                    },
                }
            }
        }
    }

    /// Resolves whatever fetch is pending for `key`. Returns the number of
    /// waiters the outcome reached; zero if nothing was pending.
    pub fn resolve(&self, key: &SharingKey, outcome: SharedOutcome<T>) -> usize {
        self.inner.resolve(key, None, outcome).unwrap_or(0)
    }

    /// Number of fetches currently pending.
    pub fn in_flight(&self) -> usize {
        self.inner.fetches.len()
    }

    pub fn waiter_count(&self, key: &SharingKey) -> usize {
        self.inner
            .fetches
            .get(key)
            .map(|fetch| fetch.waiters.len())
            .unwrap_or(0)
    }

    fn spawn_supervisor(&self, key: SharingKey, generation: u64) -> JoinHandle<()> {
        let inner = Arc::clone(&self.inner);
        let timeout = self.inner.timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(delivered) =
                inner.resolve(&key, Some(generation), Err(FetchError::Timeout))
            {
                warn!(
                    target: "hold.sharing",
                    key = %key,
                    timeout_ms = timeout.as_millis() as u64,
                    delivered,
                    "shared fetch timed out"
                );
                counter!("hold_engine_shared_fetch_timeouts_total", 1);
            }
        })
    }
}

impl<T: Clone> SharingInner<T> {
    /// Delivers `outcome` to every waiter of the pending fetch for `key`, then
    /// removes the entry. With `generation` set, only that specific fetch is
    /// resolved; a newer fetch reusing the key is left alone. Returns `None`
    /// when there was nothing to resolve.
    fn resolve(
        &self,
        key: &SharingKey,
        generation: Option<u64>,
        outcome: SharedOutcome<T>,
    ) -> Option<usize> {
        let Entry::Occupied(mut occupied) = self.fetches.entry(key.clone()) else {
            return None;
        };
        if generation.is_some_and(|generation| occupied.get().generation != generation) {
            return None;
        }

        let fetch = occupied.get_mut();
        let mut delivered = 0usize;
        for waiter in fetch.waiters.drain(..) {
            if waiter.sender.send(outcome.clone()).is_ok() {
                delivered += 1;
            }
        }
        if let Some(supervisor) = fetch.supervisor.take() {
            supervisor.abort();
        }
        occupied.remove();
        Some(delivered)
    }

    fn forget_waiter(&self, key: &SharingKey, generation: u64, waiter_id: u64) {
        if let Some(mut fetch) = self.fetches.get_mut(key) {
            if fetch.generation == generation {
                fetch.waiters.retain(|waiter| waiter.id != waiter_id);
            }
        }
    }
}

/// Obligation to resolve a shared fetch. Dropping it unresolved resolves
/// every waiter with [`FetchError::LeaderAbandoned`].
pub struct Leader<T: Clone> {
    inner: Arc<SharingInner<T>>,
    key: SharingKey,
    generation: u64,
    solo: Option<oneshot::Sender<SharedOutcome<T>>>,
    resolved: bool,
}

impl<T: Clone> Leader<T> {
    pub fn key(&self) -> &SharingKey {
        &self.key
    }

    pub fn is_shared(&self) -> bool {
        self.solo.is_none()
    }

    /// Hands `outcome` to every waiter. Returns how many received it; zero
    /// when the supervising timeout already resolved this fetch.
    pub fn resolve(mut self, outcome: SharedOutcome<T>) -> usize {
        self.finish(outcome)
    }

    fn finish(&mut self, outcome: SharedOutcome<T>) -> usize {
        if self.resolved {
            return 0;
        }
        self.resolved = true;

        match self.solo.take() {
            Some(sender) => usize::from(sender.send(outcome).is_ok()),
            None => self
                .inner
                .resolve(&self.key, Some(self.generation), outcome)
                .unwrap_or(0),
        }
    }
}

impl<T: Clone> Drop for Leader<T> {
    fn drop(&mut self) {
        if !self.resolved {
            let delivered = self.finish(Err(FetchError::LeaderAbandoned));
            if delivered > 0 {
                warn!(
                    target: "hold.sharing",
                    key = %self.key,
                    delivered,
                    "fetch leader dropped without resolving"
                );
            }
        }
    }
}

struct Registration<T> {
    inner: Arc<SharingInner<T>>,
    key: SharingKey,
    generation: u64,
    waiter_id: u64,
}

/// A pending request's view of a shared fetch. Dropping it before the outcome
/// arrives withdraws the request without affecting other waiters.
pub struct SharedWait<T: Clone> {
    receiver: oneshot::Receiver<SharedOutcome<T>>,
    registration: Option<Registration<T>>,
}

impl<T: Clone> SharedWait<T> {
    pub async fn wait(mut self) -> SharedOutcome<T> {
        let outcome = (&mut self.receiver).await;
        self.registration = None;
        match outcome {
            Ok(outcome) => outcome,
            Err(_) => Err(FetchError::LeaderAbandoned),
        }
    }
}

impl<T: Clone> Drop for SharedWait<T> {
    fn drop(&mut self) {
        if let Some(registration) = self.registration.take() {
            registration.inner.forget_waiter(
                &registration.key,
                registration.generation,
                registration.waiter_id,
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(value: &'static str) -> SharingKey {
        SharingKey::from(value)
    }

    #[tokio::test]
    async fn second_request_follows_pending_fetch() {
        let registry = RequestSharingRegistry::<String>::new(Duration::from_secs(30));

        let Acquired::Leader { leader, wait: leader_wait } = registry.acquire(&key("k1")) else {
            panic!("first request should lead");
        };
        let Acquired::Follower(follower_wait) = registry.acquire(&key("k1")) else {
            panic!("second request should follow");
        };
        assert_eq!(registry.waiter_count(&key("k1")), 2);

        assert_eq!(leader.resolve(Ok("body".to_string())), 2);
        assert_eq!(registry.in_flight(), 0);
        assert_eq!(leader_wait.wait().await, Ok("body".to_string()));
        assert_eq!(follower_wait.wait().await, Ok("body".to_string()));

        // The key is free again; the next request leads a new fetch.
        assert!(registry.acquire(&key("k1")).is_leader());
    }

    #[tokio::test]
    async fn empty_key_never_shares() {
        let registry = RequestSharingRegistry::<u32>::new(Duration::from_secs(30));
        let first = registry.acquire(&SharingKey::default());
        let second = registry.acquire(&SharingKey::default());
        assert!(first.is_leader());
        assert!(second.is_leader());
        assert_eq!(registry.in_flight(), 0);

        let Acquired::Leader { leader, wait } = first else {
            unreachable!()
        };
        assert!(!leader.is_shared());
        assert_eq!(leader.resolve(Ok(7)), 1);
        assert_eq!(wait.wait().await, Ok(7));
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_leader_is_timed_out() {
        let registry = RequestSharingRegistry::<u32>::new(Duration::from_secs(5));
        let Acquired::Leader { leader, wait } = registry.acquire(&key("slow")) else {
            panic!("expected leader");
        };
        let Acquired::Follower(follower) = registry.acquire(&key("slow")) else {
            panic!("expected follower");
        };

        assert_eq!(follower.wait().await, Err(FetchError::Timeout));
        assert_eq!(wait.wait().await, Err(FetchError::Timeout));
        assert_eq!(registry.in_flight(), 0);

        // The late resolution reaches nobody.
        assert_eq!(leader.resolve(Ok(1)), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn late_leader_does_not_resolve_newer_fetch() {
        let registry = RequestSharingRegistry::<u32>::new(Duration::from_secs(5));
        let Acquired::Leader { leader: stale, .. } = registry.acquire(&key("k")) else {
            panic!("expected leader");
        };
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(registry.in_flight(), 0);

        let Acquired::Leader { leader: fresh, wait } = registry.acquire(&key("k")) else {
            panic!("expected new leader");
        };
        assert_eq!(stale.resolve(Ok(1)), 0);
        assert_eq!(registry.in_flight(), 1);
        assert_eq!(fresh.resolve(Ok(2)), 1);
        assert_eq!(wait.wait().await, Ok(2));
    }

    #[tokio::test]
    async fn dropped_leader_releases_followers() {
        let registry = RequestSharingRegistry::<u32>::new(Duration::from_secs(30));
        let leader = registry.acquire(&key("k"));
        let Acquired::Follower(follower) = registry.acquire(&key("k")) else {
            panic!("expected follower");
        };

        drop(leader);
        assert_eq!(follower.wait().await, Err(FetchError::LeaderAbandoned));
        assert_eq!(registry.in_flight(), 0);
    }

    #[tokio::test]
    async fn cancelled_follower_leaves_others_untouched() {
        let registry = RequestSharingRegistry::<u32>::new(Duration::from_secs(30));
        let Acquired::Leader { leader, wait } = registry.acquire(&key("k")) else {
            panic!("expected leader");
        };
        let cancelled = registry.acquire(&key("k"));
        let Acquired::Follower(kept) = registry.acquire(&key("k")) else {
            panic!("expected follower");
        };
        assert_eq!(registry.waiter_count(&key("k")), 3);

        drop(cancelled);
        assert_eq!(registry.waiter_count(&key("k")), 2);

        assert_eq!(leader.resolve(Ok(3)), 2);
        assert_eq!(wait.wait().await, Ok(3));
        assert_eq!(kept.wait().await, Ok(3));
    }

    #[test_timeout::tokio_timeout_test(secs = 10, flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_acquires_elect_one_leader() {
        let registry = RequestSharingRegistry::<u32>::new(Duration::from_secs(30));
        let mut tasks = Vec::new();
        for _ in 0..64 {
            let registry = registry.clone();
            tasks.push(tokio::spawn(async move { registry.acquire(&key("hot")) }));
        }

        let mut leaders = Vec::new();
        let mut waits = Vec::new();
        for task in tasks {
            match task.await.expect("task") {
                Acquired::Leader { leader, wait } => {
                    leaders.push(leader);
                    waits.push(wait);
                }
                Acquired::Follower(wait) => waits.push(wait),
            }
        }

        assert_eq!(leaders.len(), 1);
        let leader = leaders.pop().expect("one leader");
        assert_eq!(leader.resolve(Ok(42)), 64);
        for wait in waits {
            assert_eq!(wait.wait().await, Ok(42));
        }
    }
}
