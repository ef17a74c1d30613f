//! Schema module - Data, task and configuration types for prompt evolution.

mod candidate;
mod config;
mod diversity;
mod run;
mod task;

pub use candidate::*;
pub use config::*;
pub use diversity::*;
pub use run::*;
pub use task::*;
