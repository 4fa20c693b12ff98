pub mod app;
pub mod cli;
pub mod config;
pub mod error;
pub mod instance;
pub mod logging;
pub mod orchestrator;

pub use config::OrchestratorConfig;
pub use error::{CreateError, Error, Result};
pub use instance::{Instance, InstanceConfig, InstanceStatus, StartOutcome};
pub use orchestrator::{CollectionReport, InstanceOverrides, Orchestrator};
