#[macro_use]
mod id;

pub mod agent;
pub mod backoff;
pub mod config;
pub mod core;
pub mod error;
pub mod events;
pub mod log;
pub mod orchestration;
pub mod transport;
pub mod util;

pub use error::{Error, Result};
pub use orchestration::Orchestrator;
