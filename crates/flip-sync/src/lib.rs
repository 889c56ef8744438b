//! Real-time synchronization core for the flip dashboard: the push-channel
//! connection, event fan-out, optimistic task control, and the live feed.

pub mod api;
pub mod backoff;
pub mod config;
pub mod dispatch;
pub mod feed;
pub mod tasks;
pub mod transport;

pub use api::{ApiError, HttpTaskApi, MutationAck, TaskApi};
pub use backoff::BackoffPolicy;
pub use config::{SyncConfig, DEFAULT_FEED_CAPACITY, DEFAULT_FEED_TTL};
pub use dispatch::{handler, EventDispatcher, Handler, Subscription};
pub use feed::{LiveFeed, LiveItem};
pub use tasks::{
    MutationError, MutationOutcome, MutationTicket, PendingOperation, Resolution, TaskAction,
    TaskBindings, TaskBoard, TaskCoordinator, TaskView,
};
pub use transport::{ConnectionState, SyncService};
