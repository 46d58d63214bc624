//! Configuration schema definitions for scatter.
//!
//! This module defines all configuration types that can be deserialized from
//! TOML configuration files. Every section has full defaults, so an empty
//! (or absent) configuration file is valid as long as a runner script is
//! supplied on the command line.
//!
//! # Schema Overview
//!
//! ```text
//! RunConfig (root)
//! ├── ScatterConfig          - Core settings (workers, bail, strict, weights)
//! ├── RunnerConfig           - External test-framework invocation
//! ├── DiscoveryConfig        - Tagged enum selecting suite discovery
//! │   ├── Glob               - Glob pattern matching
//! │   └── List               - Explicit suite list
//! └── ReportConfig           - Results area and reporter wiring
//! ```

use std::path::PathBuf;

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};

/// Root configuration structure for scatter.
///
/// Represents the complete configuration loaded from a TOML file, merged
/// with command-line overrides before a run starts. The resulting value is
/// passed by reference into every component; no component reads ambient
/// global state.
///
/// # TOML Structure
///
/// ```toml
/// [scatter]
/// workers = 4
/// bail = false
/// strict = true
///
/// [runner]
/// program = "npm"
/// script = "cy:run"
///
/// [discovery]
/// type = "glob"
/// pattern = "cypress/e2e/**/*.cy.js"
///
/// [report]
/// results_dir = "runner-results"
/// ```
///
/// # Example
///
/// ```
/// use scatter::config::RunConfig;
///
/// let config: RunConfig = toml::from_str(r#"
///     [scatter]
///     workers = 2
///
///     [runner]
///     script = "cy:run"
/// "#).unwrap();
/// assert_eq!(config.scatter.workers, 2);
/// ```
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RunConfig {
    /// Core scatter settings (worker count, bail, strict mode, weights).
    #[serde(default)]
    pub scatter: ScatterConfig,

    /// External test-framework invocation settings.
    #[serde(default)]
    pub runner: RunnerConfig,

    /// Suite discovery configuration.
    #[serde(default)]
    pub discovery: DiscoveryConfig,

    /// Results area and reporter configuration.
    #[serde(default)]
    pub report: ReportConfig,
}

impl RunConfig {
    /// Checks the configuration for errors that must abort the run before
    /// any worker is spawned.
    pub fn validate(&self) -> Result<()> {
        if self.runner.script.as_deref().unwrap_or("").is_empty() {
            bail!("no runner script configured; set [runner] script or pass --script");
        }
        if self.scatter.workers == 0 {
            bail!("worker count must be at least 1");
        }
        if self.scatter.retry.max_attempts == 0 {
            bail!("retry max_attempts must be at least 1");
        }
        Ok(())
    }
}

/// Core scatter execution settings.
///
/// # Defaults
///
/// | Field | Default |
/// |-------|---------|
/// | `workers` | 2 |
/// | `bail` | false |
/// | `strict` | true |
/// | `weights_file` | `scatter-weights.json` |
/// | `weight_target_per_test` | 10 |
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ScatterConfig {
    /// Number of worker processes to run in parallel.
    ///
    /// Clamped down to the number of discovered suites, since a worker
    /// with no suites only adds process-spawn overhead.
    ///
    /// Default: 2
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Terminate the entire run as soon as any worker exits non-zero.
    ///
    /// Faster feedback at the cost of losing timing data for in-flight
    /// workers. Default: false
    #[serde(default)]
    pub bail: bool,

    /// Fail the run if the collected result count does not match the
    /// number of discovered suites.
    ///
    /// Without this check a CI gate could silently pass on incomplete
    /// data. Default: true
    #[serde(default = "default_strict")]
    pub strict: bool,

    /// Path of the learned per-suite weight table.
    ///
    /// Default: `scatter-weights.json`
    #[serde(default = "default_weights_file")]
    pub weights_file: PathBuf,

    /// Weight units granted per executed test when rescaling learned
    /// weights, keeping the table in a stable numeric range across runs.
    ///
    /// Default: 10
    #[serde(default = "default_weight_target_per_test")]
    pub weight_target_per_test: u64,

    /// Retry policy for transient I/O failures in the result protocol.
    #[serde(default)]
    pub retry: RetryConfig,
}

impl Default for ScatterConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            bail: false,
            strict: default_strict(),
            weights_file: default_weights_file(),
            weight_target_per_test: default_weight_target_per_test(),
            retry: RetryConfig::default(),
        }
    }
}

fn default_workers() -> usize {
    2
}

fn default_strict() -> bool {
    true
}

fn default_weights_file() -> PathBuf {
    PathBuf::from("scatter-weights.json")
}

fn default_weight_target_per_test() -> u64 {
    10
}

/// Bounded retry policy with linear backoff.
///
/// Passed explicitly into the components that need it instead of
/// hard-coding attempt counts at call sites.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RetryConfig {
    /// Maximum write attempts before giving up. Default: 3
    #[serde(default = "default_max_attempts")]
    pub max_attempts: usize,

    /// Delay between attempts, multiplied by the attempt number.
    /// Default: 50ms
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_ms: default_backoff_ms(),
        }
    }
}

fn default_max_attempts() -> usize {
    3
}

fn default_backoff_ms() -> u64 {
    50
}

/// External test-framework invocation settings.
///
/// The runner is invoked npm-style: `<program> run <script> -- <args...>`
/// with the suite list, reporter module, and reporter configuration path
/// appended. The worker index is injected through the environment.
///
/// # Example
///
/// ```toml
/// [runner]
/// program = "npm"
/// script = "cy:run"
/// args = "--browser chrome"
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RunnerConfig {
    /// Executable used to launch the test framework. Default: `npm`
    #[serde(default = "default_program")]
    pub program: String,

    /// Script name passed to the program (e.g. an npm script).
    ///
    /// Required; the run aborts before spawning anything if unset.
    pub script: Option<String>,

    /// Extra arguments appended to the worker command line, split with
    /// shell quoting rules.
    #[serde(default)]
    pub args: String,

    /// Additional environment variables for worker processes.
    #[serde(default)]
    pub env: Vec<(String, String)>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            program: default_program(),
            script: None,
            args: String::new(),
            env: Vec::new(),
        }
    }
}

fn default_program() -> String {
    "npm".to_string()
}

/// Suite discovery configuration.
///
/// Tagged enum selecting how test suite paths are found.
///
/// # Example
///
/// ```toml
/// # Glob pattern discovery
/// [discovery]
/// type = "glob"
/// pattern = "cypress/e2e/**/*.cy.js"
///
/// # Explicit suite list
/// [discovery]
/// type = "list"
/// suites = ["cypress/e2e/login.cy.js", "cypress/e2e/cart.cy.js"]
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum DiscoveryConfig {
    /// Match suite files against a glob pattern.
    Glob(GlobDiscoveryConfig),

    /// Use an explicit, ordered list of suite paths.
    List(ListDiscoveryConfig),
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        DiscoveryConfig::Glob(GlobDiscoveryConfig::default())
    }
}

/// Glob pattern discovery settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GlobDiscoveryConfig {
    /// Glob pattern matched against suite file paths.
    ///
    /// Default: `cypress/e2e/**/*.cy.js`
    #[serde(default = "default_pattern")]
    pub pattern: String,
}

impl Default for GlobDiscoveryConfig {
    fn default() -> Self {
        Self {
            pattern: default_pattern(),
        }
    }
}

fn default_pattern() -> String {
    "cypress/e2e/**/*.cy.js".to_string()
}

/// Explicit suite list discovery settings.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ListDiscoveryConfig {
    /// Ordered suite paths, used verbatim.
    #[serde(default)]
    pub suites: Vec<String>,
}

/// Results area and reporter configuration.
///
/// The results directory is the shared area where workers durably record
/// per-suite outcomes; its lifetime is scoped to exactly one run.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ReportConfig {
    /// Directory where workers write result records and completion
    /// markers. Created before the run, deleted after collection.
    ///
    /// Default: `runner-results`
    #[serde(default = "default_results_dir")]
    pub results_dir: PathBuf,

    /// Reporter multiplexer module passed to the test framework.
    ///
    /// Default: `cypress-multi-reporters`
    #[serde(default = "default_reporter_module")]
    pub reporter_module: String,

    /// Extra reporter enabled alongside the built-in stream reporter,
    /// replacing the default spec reporter.
    pub reporter: Option<String>,

    /// User-supplied reporter options file merged over the generated
    /// reporter configuration.
    pub reporter_options_path: Option<PathBuf>,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            results_dir: default_results_dir(),
            reporter_module: default_reporter_module(),
            reporter: None,
            reporter_options_path: None,
        }
    }
}

fn default_results_dir() -> PathBuf {
    PathBuf::from("runner-results")
}

fn default_reporter_module() -> String {
    "cypress-multi-reporters".to_string()
}
