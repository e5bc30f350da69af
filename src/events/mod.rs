//! Pub/sub bridge between worker processes.
//!
//! - `publisher`: best-effort lifecycle event sends
//! - `consumer`: reconnecting receive loop and local event fan-out
//! - `commands`: command consumer with request-id deduplication

pub mod backoff;
pub mod commands;
pub mod consumer;
pub mod publisher;

pub use backoff::{ReconnectBackoff, ReconnectState};
pub use commands::{CommandConsumer, CommandHandler, CommandProcessor, DedupeSet};
pub use consumer::{
    BroadcastSink, ConsumerConfig, EventConsumer, EventProcessor, EventSink, MessageProcessor,
    Settlement, SubscriptionLoop,
};
pub use publisher::{BrokerPublisher, EventPublisher};
