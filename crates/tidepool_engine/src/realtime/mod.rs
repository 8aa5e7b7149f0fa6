//! Realtime channels.
//!
//! [`RealtimeChannelManager`] keeps one channel per topic on top of a
//! [`ChannelTransport`], with per-topic rate limiting, batching, bounded
//! offline queues and reconnect backoff.

mod backoff;
mod batch;
mod channel;
mod limiter;
mod manager;
mod outbox;
mod transport;

pub use backoff::ReconnectBackoff;
pub use batch::BatchBuffer;
pub use channel::{ChannelCallbacks, ChannelState, SubscriptionHandle};
pub use limiter::TokenBucket;
pub use manager::{RealtimeChannelManager, RealtimeMetrics, SendOutcome};
pub use outbox::BoundedQueue;
pub use transport::{ChannelTransport, MockChannelTransport};
