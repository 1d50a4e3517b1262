//! # pullq
//!
//! Lease-based work distribution over tagged pull queues.
//!
//! A producer seeds a shared backlog of tagged items; a self-rearming worker
//! population leases small batches, retires items once they have been leased
//! enough times, and reschedules itself through a separate control queue.
//! Postgres with pgmq is the production backend; [`store::memory::MemoryStore`]
//! is the in-process one.

pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod model;
pub mod store;
pub mod telemetry;
