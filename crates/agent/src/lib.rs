//! The agent control loop and everything wrapped around it.
//!
//! [`Agent`] drives one run: query the model, parse and validate the
//! action, execute it in the sandbox, record the step, repeat until a
//! submission or a forced exit. [`run_instance`] drives one task instance,
//! optionally sampling several attempts under a [`ReviewLoop`] that judges
//! and compares submissions. Configuration for all of it deserializes from
//! one TOML file into [`RunConfig`].

pub mod agent;
pub mod config;
pub mod history;
pub mod reviewer;
pub mod runner;
pub mod templates;

pub use agent::{Agent, RunResult};
pub use config::{AgentConfig, ModelConfig, RetryConfig, RunConfig, SubroutineConfig};
pub use history::HistoryProcessor;
pub use reviewer::{ComparisonResult, ReviewConfig, ReviewLoop, ReviewSubmission, ReviewerResult};
pub use runner::{run_instance, InstanceResult, RunOptions};
pub use templates::{TemplateConfig, TemplateSet};
