pub mod condition;
pub mod context;
pub mod engine;
pub mod mapper;
pub mod registry;
pub mod step;
pub mod sweeper;
pub mod tracker;

pub use condition::Condition;
pub use context::ExecutionContext;
pub use engine::WorkflowEngine;
pub use registry::{AgentRegistry, WorkflowRegistry};
pub use step::StepExecutor;
pub use sweeper::ExecutionSweeper;
pub use tracker::ExecutionTracker;
