//! scatter: a weight-balanced parallel test suite runner.
//!
//! This crate splits a suite of independent test files across a fixed
//! pool of worker processes, balancing load by learned per-suite cost
//! estimates, then reassembles the per-worker results into one aggregate
//! report for CI gating.
//!
//! # Architecture
//!
//! The main components are:
//!
//! - **Discovery**: Find the suites to run (glob pattern or explicit list)
//! - **Weights**: Load learned cost estimates, fall back to line counts
//! - **Executor**: Partition suites (LPT), supervise worker processes
//! - **Results**: The durable worker-to-coordinator result protocol
//! - **Report**: Console summary and reporter configuration generation
//!
//! # Example
//!
//! ```no_run
//! use scatter::config::RunConfig;
//! use scatter::discovery::ExplicitSource;
//! use scatter::executor::Orchestrator;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let mut config = RunConfig::default();
//!     config.runner.script = Some("cy:run".to_string());
//!     config.validate()?;
//!
//!     let source = ExplicitSource::new(vec!["cypress/e2e/login.cy.js".to_string()]);
//!     let result = Orchestrator::new(config, source).run().await?;
//!
//!     std::process::exit(result.exit_code());
//! }
//! ```

pub mod config;
pub mod discovery;
pub mod executor;
pub mod report;
pub mod results;
pub mod weights;

// Re-export commonly used types
pub use config::{RunConfig, load_config};
pub use discovery::{ExplicitSource, GlobSource, SuiteSource};
pub use executor::{Orchestrator, Partition, RunResult, Scheduler, WorkItem};
pub use results::{AggregateResult, RecordWriter, ResultCollector, SuiteRecord};
