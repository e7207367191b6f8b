//! A module for lock-free memory management.
//!
//! The struct in this module allows for lock-free memory management, meaning
//! that it can be used in the development of lock-free data structures. It
//! ensures that no piece of data is freed while another thread can still
//! access it, which combined with pointer tagging prevents the
//! [ABA problem](https://en.wikipedia.org/wiki/ABA_problem).

pub use self::hazardpointers::HPBRManager;
mod hazardpointers;
