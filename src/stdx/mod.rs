//! Small, self-contained lock-free structures backing the trace data path.
//!
//! # Scope
//! `stdx` hosts the two primitives everything else is built from. They are
//! tuned for bounded memory and wait-free fast paths rather than
//! general-purpose ergonomics.
//!
//! # Module map
//! - `index_queue`: bounded MPMC queue of ring indices with observable
//!   head/tail counters (backs a lane's free and submitted queues).
//! - `record_ring`: SPSC byte ring of fixed-size records with the one-slot
//!   reserve layout (the unit of hand-off between producers and the drain).
//!
//! # Safety
//! Both types use `unsafe` internally and rely on invariants called out in
//! their module docs. Read those before extending or reusing the internals.

pub mod index_queue;
pub mod record_ring;

pub use index_queue::{IndexQueue, INVALID_INDEX};
pub use record_ring::{RecordRing, RingHeader};
