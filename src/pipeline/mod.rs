//! Request orchestration pipeline.
//!
//! Every user request flows through:
//! 1. `IntentClassifier::classify()`: LLM intent analysis, keyword fallback
//! 2. `scheduler::schedule()`: dependency-ordered task list
//! 3. `TaskExecutor::execute()`: one task at a time against the backends
//! 4. `ResponseDispatcher::deliver()`: streamed or uploaded result
//!
//! `Orchestrator` drives the loop and keeps the shared progress message.

pub mod classifier;
pub mod dispatcher;
pub mod executor;
pub mod orchestrator;
pub mod rules;
pub mod scheduler;
pub mod types;

pub use classifier::IntentClassifier;
pub use dispatcher::ResponseDispatcher;
pub use executor::TaskExecutor;
pub use orchestrator::{Orchestrator, OrchestratorDeps, UserRequest};
pub use rules::FallbackClassifier;
pub use types::{Intent, RunReport, ScheduledTask, TaskKind, TaskResult, TaskSpec};
