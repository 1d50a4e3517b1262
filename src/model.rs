//! Core data model.
//!
//! Two independent backlogs share one item shape: the data backlog of
//! tagged work items, and the control queues whose items are encoded
//! [`WorkerInvocation`]s.

pub mod invocation;
pub mod item;

pub use invocation::{InvocationKind, LeaseParams, RetryPolicy, WorkerInvocation};
pub use item::{DeliveryMethod, ItemId, NewItem, Payload, WorkItem};
