pub use self::queue::Queue;

pub mod atomic_tagged;
mod queue;
