//! RCU snapshot variables
//!
//! Readers pin an immutable snapshot without blocking; writers work on a
//! private copy and publish it atomically. Replaced snapshots are reclaimed
//! once no reader still holds them.

mod guards;
mod hazard;
mod variable;

pub use guards::{ReadablePtr, SharedReadablePtr, WritablePtr};
pub use variable::{DestructionType, Variable};
