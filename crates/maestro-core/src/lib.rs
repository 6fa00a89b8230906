pub mod config;
pub mod error;
pub mod event;
pub mod traits;
pub mod types;
pub mod workflow;

pub use config::AppConfig;
pub use error::{MaestroError, Result};
pub use event::EventBus;
pub use traits::Agent;
pub use types::*;
pub use workflow::{ErrorHandlingPolicy, OnError, RetryPolicy, WorkflowDefinition, WorkflowStep};
