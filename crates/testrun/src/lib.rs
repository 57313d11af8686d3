//! testrun - test-run orchestrator.
//!
//! Provisions an isolated environment per suite, runs test files as
//! time-bounded cancellable jobs, parses their output and aggregates the
//! results of the run.

pub mod discovery;
pub mod environment;
pub mod executor;
pub mod logging;
pub mod orchestrator;
pub mod render;
pub mod runner;

pub use discovery::{discover, DiscoveryError};
pub use environment::{EnvironmentError, EnvironmentManager, TeardownReport, TestEnvironment};
pub use executor::{Executor, ExecutorConfig, ExecutorError, RunningTest};
pub use logging::{LogError, LogRecorder, TestLog};
pub use orchestrator::{Orchestrator, OrchestratorError, RunContext, RunOutcome};
pub use runner::{RunnerConfig, TimeoutRunner};
