//! Event-loop thread pool
//!
//! A fixed set of OS threads, each running one event loop that owns its own
//! timer registrations and loop-bound callbacks. Collaborators that want
//! per-thread resources (one connection multiplexer per loop, say) take sticky
//! [`ThreadHandle`]s from [`EventThreadPool::next_threads`]; the task
//! scheduler uses the loops for sleeps, wait deadlines and task deadlines.

mod pool;
mod thread;
mod timer;

pub use pool::{distribute_evenly, EventThreadPool};
pub use thread::ThreadHandle;
pub use timer::{TimerHandle, TimerId};
