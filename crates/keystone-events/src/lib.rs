//! # keystone-events
//!
//! Event bus for Keystone. Provides:
//!
//! - Publish/subscribe with priority-ordered, filterable subscriptions
//! - A single-drain FIFO queue with sequential per-event dispatch
//! - Retry with linear backoff and per-handler fault isolation
//! - A durable append-only event log with time-ranged replay
//! - Running delivery statistics

pub mod bus;
pub mod error;
pub mod event;
pub mod filter;
pub mod handler;
pub mod stats;
pub mod store;
pub mod subscription;

pub use bus::{BusState, EventBus};
pub use error::{BusError, HandlerError};
pub use event::{Event, EventMetadata, SCHEMA_VERSION};
pub use filter::EventFilter;
pub use handler::{EventHandler, FnHandler, handler_fn};
pub use stats::EventStats;
pub use store::{EventStore, FileEventStore, MemoryEventStore};
pub use subscription::{SubscribeOptions, SubscriptionId};
