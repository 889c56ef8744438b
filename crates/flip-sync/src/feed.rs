//! Bounded, self-expiring feed of recently discovered items.
//!
//! Newest first. Each entry owns a timer task that removes it after the
//! feed's TTL; evicting or dismissing an entry aborts its timer. Timers only
//! hold a weak reference, so a dropped feed never outlives its handles.

use crate::config::SyncConfig;
use crate::dispatch::{handler, EventDispatcher, Subscription};
use chrono::{DateTime, Utc};
use flip_core::{DiscoveredItem, SyncEvent, EVENT_NEW_ITEM_DISCOVERED};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq)]
pub struct LiveItem {
    /// Unique per received event, even when the source repeats an `item_id`.
    pub id: String,
    pub received_at: DateTime<Utc>,
    pub item: DiscoveredItem,
}

struct Slot {
    entry: LiveItem,
    expires_at: Instant,
    timer: AbortHandle,
}

#[derive(Default)]
struct FeedState {
    slots: VecDeque<Slot>,
    seq: u64,
}

struct FeedInner {
    capacity: usize,
    ttl: Duration,
    state: Mutex<FeedState>,
}

impl FeedInner {
    fn lock(&self) -> MutexGuard<'_, FeedState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn remove(&self, id: &str) -> Option<Slot> {
        let mut state = self.lock();
        let idx = state.slots.iter().position(|slot| slot.entry.id == id)?;
        state.slots.remove(idx)
    }
}

impl Drop for FeedInner {
    fn drop(&mut self) {
        let state = self
            .state
            .get_mut()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        for slot in state.slots.drain(..) {
            slot.timer.abort();
        }
    }
}

/// Shared handle to the feed. Cloning yields another handle to the same feed.
#[derive(Clone)]
pub struct LiveFeed {
    inner: Arc<FeedInner>,
}

impl LiveFeed {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            inner: Arc::new(FeedInner {
                capacity: capacity.max(1),
                ttl,
                state: Mutex::new(FeedState::default()),
            }),
        }
    }

    pub fn from_config(config: &SyncConfig) -> Self {
        Self::new(config.feed_capacity, config.feed_ttl)
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    pub fn ttl(&self) -> Duration {
        self.inner.ttl
    }

    /// Add an item at the front, evicting the oldest past capacity, and
    /// schedule its expiry. Returns the synthesized entry id.
    /// Must be called from within a tokio runtime.
    pub fn push(&self, item: DiscoveredItem) -> String {
        let received_at = Utc::now();
        let expires_at = Instant::now() + self.inner.ttl;
        let mut state = self.inner.lock();
        state.seq += 1;
        let id = format!(
            "{}-{}-{}",
            item.item_id,
            received_at.timestamp_millis(),
            state.seq
        );

        let weak: Weak<FeedInner> = Arc::downgrade(&self.inner);
        let timer_id = id.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep_until(expires_at).await;
            if let Some(inner) = weak.upgrade() {
                if inner.remove(&timer_id).is_some() {
                    debug!(event = "feed_item_expired", id = %timer_id);
                }
            }
        })
        .abort_handle();

        info!(
            event = "feed_item_received",
            id = %id,
            title = %item.title,
            instant_notify = item.instant_notify
        );
        state.slots.push_front(Slot {
            entry: LiveItem {
                id: id.clone(),
                received_at,
                item,
            },
            expires_at,
            timer,
        });
        while state.slots.len() > self.inner.capacity {
            if let Some(evicted) = state.slots.pop_back() {
                evicted.timer.abort();
                debug!(event = "feed_item_evicted", id = %evicted.entry.id);
            }
        }
        id
    }

    /// Remove an entry early. Returns `false` if it already expired or was
    /// evicted.
    pub fn dismiss(&self, id: &str) -> bool {
        match self.inner.remove(id) {
            Some(slot) => {
                slot.timer.abort();
                debug!(event = "feed_item_dismissed", id);
                true
            }
            None => false,
        }
    }

    /// Current entries, newest first. Never returns an entry past its TTL,
    /// even if its timer has not run yet.
    pub fn entries(&self) -> Vec<LiveItem> {
        let now = Instant::now();
        self.inner
            .lock()
            .slots
            .iter()
            .filter(|slot| slot.expires_at > now)
            .map(|slot| slot.entry.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        let mut state = self.inner.lock();
        for slot in state.slots.drain(..) {
            slot.timer.abort();
        }
    }

    /// Feed every `new_item_discovered` event into this feed until the
    /// returned subscription is dropped.
    pub fn bind(&self, dispatcher: &EventDispatcher) -> Subscription {
        let feed = self.clone();
        dispatcher.subscribe(
            EVENT_NEW_ITEM_DISCOVERED,
            handler(move |event| {
                if let SyncEvent::NewItemDiscovered(item) = event {
                    feed.push(item.clone());
                }
            }),
        )
    }
}
