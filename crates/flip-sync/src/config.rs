use crate::backoff::BackoffPolicy;
use flip_core::DEFAULT_MAX_FRAME_BYTES;
use std::env;
use std::time::Duration;
use url::Url;

pub const DEFAULT_FEED_CAPACITY: usize = 5;
pub const DEFAULT_FEED_TTL: Duration = Duration::from_secs(12);

/// Resolved settings for one synchronization session.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub endpoint: Url,
    pub max_frame_bytes: usize,
    pub backoff: BackoffPolicy,
    pub feed_capacity: usize,
    pub feed_ttl: Duration,
}

impl SyncConfig {
    pub fn new(endpoint: Url) -> Self {
        Self {
            endpoint,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            backoff: BackoffPolicy::default(),
            feed_capacity: DEFAULT_FEED_CAPACITY,
            feed_ttl: DEFAULT_FEED_TTL,
        }
    }

    /// Apply `FLIP_*` environment overrides on top of the defaults.
    /// Unparseable values are ignored.
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(capacity) = env_u64("FLIP_FEED_CAPACITY") {
            if capacity > 0 {
                self.feed_capacity = capacity as usize;
            }
        }
        if let Some(secs) = env_u64("FLIP_FEED_TTL_SECS") {
            self.feed_ttl = Duration::from_secs(secs);
        }
        if let Some(bytes) = env_u64("FLIP_MAX_FRAME_BYTES") {
            self.max_frame_bytes = bytes as usize;
        }
        let initial = env_u64("FLIP_BACKOFF_INITIAL_MS")
            .map(Duration::from_millis)
            .unwrap_or(self.backoff.initial_delay);
        let max = env_u64("FLIP_BACKOFF_MAX_MS")
            .map(Duration::from_millis)
            .unwrap_or(self.backoff.max_delay);
        let jitter = env::var("FLIP_BACKOFF_JITTER")
            .ok()
            .and_then(|value| value.trim().parse::<f64>().ok())
            .unwrap_or(self.backoff.jitter);
        self.backoff = BackoffPolicy::new(initial, max, self.backoff.factor, jitter);
        self
    }
}

fn env_u64(key: &str) -> Option<u64> {
    env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
}
