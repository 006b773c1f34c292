//! Native scheduler primitives.
//!
//! The threading layer consumes the underlying kernel only through what this
//! module exposes: preemptible tasks, binary/counting semaphores and bounded
//! FIFO queues. This implementation runs on a hosted OS using `std::thread`
//! and `parking_lot`; a port to a real RTOS replaces these three files and
//! nothing else.

pub mod queue;
pub mod semaphore;
pub mod task;

pub use queue::Queue;
pub use semaphore::{Semaphore, TakeError};
pub use task::{Task, TaskConfig, TaskId, current_task, sleep, spawn};
