//! A lock-free FIFO queue for Rust.
//!
//! This crate provides a multi-producer, multi-consumer queue built on the
//! Michael-Scott non-blocking algorithm, together with the lock-free memory
//! management it needs. Nodes unlinked from the queue are reclaimed through
//! hazard pointers rather than freed in place, and every shared pointer
//! carries a generation counter so compare-and-swap cannot be fooled by a
//! recycled address.

pub mod memory;
pub mod structures;
