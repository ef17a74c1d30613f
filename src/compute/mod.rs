//! Compute module - Scheduling, population storage and evolution.

mod population;
mod queue;
mod scheduler;

pub mod evolution;

pub use population::*;
pub use queue::*;
pub use scheduler::*;
