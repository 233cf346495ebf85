//! Durable event plumbing: a partitioned append-only log and the bus on top of it.
//!
//! The [`EventLog`] owns the on-disk segments of every partition. The
//! [`EventBus`] routes topics to partitions, assigns sequence numbers and
//! offsets, batches writes, runs transactions, and delivers committed events
//! to subscriptions with retry, backoff, and dead-lettering.

pub mod bus;
pub mod entry;
pub mod index;
pub mod log;
pub mod partition;
pub mod segment;
pub mod subscription;
pub mod transaction;

pub use bus::EventBus;
pub use entry::{EventDraft, EventLogEntry};
pub use index::{EventIndex, IndexStats};
pub use log::{EventLog, WriteMark};
pub use subscription::{
    handler_fn, AckMode, Backoff, EventHandler, SubscribeOptions, SubscriptionStats,
};
pub use transaction::TransactionStatus;
