use std::env;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Upper bound on how long followers wait for a sharing leader.
    pub shared_fetch_timeout: Duration,
    /// Maximum hold duration. `None` leaves holds open until closed by a
    /// publish, the client, or shutdown.
    pub hold_timeout: Option<Duration>,
    /// Session cursors untouched for this long are evicted.
    pub cursor_idle_ttl: Duration,
    /// Period of the housekeeping sweep (hold expiry, cursor eviction).
    pub sweep_interval: Duration,
    /// Bound of each channel worker's publish queue.
    pub channel_queue_depth: usize,
    /// A channel worker with no events for this long shuts down.
    pub channel_idle_timeout: Duration,
    /// A transport write slower than this counts as a failed delivery.
    pub write_timeout: Duration,
    pub max_held_connections: usize,
}

impl EngineConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let hold_timeout = match env_u64("HOLD_ENGINE_HOLD_TIMEOUT_SECS") {
            Some(0) => None,
            Some(secs) => Some(Duration::from_secs(secs)),
            None => defaults.hold_timeout,
        };

        Self {
            shared_fetch_timeout: env_u64("HOLD_ENGINE_SHARED_FETCH_TIMEOUT_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.shared_fetch_timeout),
            hold_timeout,
            cursor_idle_ttl: env_u64("HOLD_ENGINE_CURSOR_IDLE_TTL_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.cursor_idle_ttl),
            sweep_interval: env_u64("HOLD_ENGINE_SWEEP_INTERVAL_MS")
                .filter(|ms| *ms > 0)
                .map(Duration::from_millis)
                .unwrap_or(defaults.sweep_interval),
            channel_queue_depth: env_u64("HOLD_ENGINE_CHANNEL_QUEUE_DEPTH")
                .filter(|depth| *depth > 0)
                .map(|depth| depth as usize)
                .unwrap_or(defaults.channel_queue_depth),
            channel_idle_timeout: env_u64("HOLD_ENGINE_CHANNEL_IDLE_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.channel_idle_timeout),
            write_timeout: env_u64("HOLD_ENGINE_WRITE_TIMEOUT_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.write_timeout),
            max_held_connections: env_u64("HOLD_ENGINE_MAX_HELD_CONNECTIONS")
                .map(|max| max as usize)
                .unwrap_or(defaults.max_held_connections),
        }
    }

    /// Effective hold deadline given an optional per-hold timeout.
    pub fn effective_hold_timeout(&self, requested: Option<Duration>) -> Option<Duration> {
        match (requested, self.hold_timeout) {
            (Some(requested), Some(max)) => Some(requested.min(max)),
            (Some(requested), None) => Some(requested),
            (None, max) => max,
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            shared_fetch_timeout: Duration::from_secs(30),
            hold_timeout: Some(Duration::from_secs(55)),
            cursor_idle_ttl: Duration::from_secs(300),
            sweep_interval: Duration::from_secs(1),
            channel_queue_depth: 1_024,
            channel_idle_timeout: Duration::from_secs(60),
            write_timeout: Duration::from_secs(5),
            max_held_connections: 100_000,
        }
    }
}

fn env_u64(key: &str) -> Option<u64> {
    env::var(key).ok().and_then(|val| val.trim().parse().ok())
}
