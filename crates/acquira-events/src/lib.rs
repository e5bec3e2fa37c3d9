//! Event pipeline: schema-validated envelopes on a partitioned, ordered bus
//! with an idempotent producer and idempotently-consuming groups.
//!
//! Events for one payment always land on the same partition, so each
//! consumer group observes them in publication order.

pub mod bus;
pub mod consumer;
pub mod message;
pub mod publisher;

pub use bus::{EventBus, StoredEvent, TOPIC_PAYMENT_EVENTS, TOPIC_PAYMENT_EVENTS_DLQ};
pub use consumer::{spawn_consumer, EventHandler};
pub use message::{EventEnvelope, EventPayload};
pub use publisher::{EventPublisher, PublishOutcome};
