//! Slack AI bot: intent-driven multi-task orchestration over generative backends.

pub mod channels;
pub mod config;
pub mod context;
pub mod error;
pub mod llm;
pub mod pipeline;
pub mod server;
pub mod store;
