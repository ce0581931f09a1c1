//! Task-aware synchronization primitives

mod permit;
mod semaphore;

pub use permit::SemaphorePermit;
pub use semaphore::{Acquire, Semaphore};
