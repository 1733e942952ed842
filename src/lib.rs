//! pipewright: coordination core for agent-assisted ETL pipelines.
//!
//! Events from the channel become tasks, tasks go to agents, agent
//! decisions are arbitrated and applied, and failed pipeline executions are
//! healed or escalated.

pub mod actors;
pub mod agent;
pub mod catalog;
pub mod channel;
pub mod config;
pub mod core;
pub mod error;
pub mod healing;
pub mod log;
pub mod orchestration;
pub mod pipeline;
pub mod store;
pub mod util;

pub use error::{Error, Result};
