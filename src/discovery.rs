//! Test suite discovery.
//!
//! Discovery produces the ordered list of suite file paths that one run
//! will execute. The rest of the pipeline treats the list as opaque
//! identities; no file content is interpreted here beyond existing on disk.
//!
//! Two sources are built in:
//!
//! | Source | Selection |
//! |--------|-----------|
//! | [`GlobSource`] | Files matching a glob pattern |
//! | [`ExplicitSource`] | A caller-supplied list, used verbatim |
//!
//! Custom sources implement [`SuiteSource`]:
//!
//! ```no_run
//! use async_trait::async_trait;
//! use scatter::discovery::{DiscoveryResult, SuiteSource};
//!
//! struct ChangedFilesSource;
//!
//! #[async_trait]
//! impl SuiteSource for ChangedFilesSource {
//!     async fn discover(&self) -> DiscoveryResult<Vec<String>> {
//!         // e.g. ask the VCS which suites changed
//!         todo!()
//!     }
//!
//!     fn name(&self) -> &'static str {
//!         "changed-files"
//!     }
//! }
//! ```

use async_trait::async_trait;
use tracing::{debug, info};

/// Result type for discovery operations.
pub type DiscoveryResult<T> = Result<T, DiscoveryError>;

/// Errors that can occur while locating test suites.
#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    /// The configured glob pattern is malformed.
    #[error("Invalid suite pattern: {0}")]
    Pattern(#[from] glob::PatternError),

    /// A matched path could not be read while walking the glob.
    #[error("Failed to read matched path: {0}")]
    Glob(#[from] glob::GlobError),

    /// I/O error reading files or directories.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A source of test suite paths.
///
/// Implementations return suites in a stable order; the scheduler uses
/// that order to break ties deterministically.
#[async_trait]
pub trait SuiteSource: Send + Sync {
    /// Produce the ordered list of suite paths for this run.
    async fn discover(&self) -> DiscoveryResult<Vec<String>>;

    /// Short name used in logs.
    fn name(&self) -> &'static str;
}

/// Discovers suites by matching a glob pattern against the filesystem.
///
/// Matches under `node_modules` are skipped. Results come back in the
/// glob walker's alphabetical order, which is stable across runs.
pub struct GlobSource {
    pattern: String,
}

impl GlobSource {
    /// Create a glob source for the given pattern.
    pub fn new(pattern: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
        }
    }
}

#[async_trait]
impl SuiteSource for GlobSource {
    async fn discover(&self) -> DiscoveryResult<Vec<String>> {
        info!("Using pattern {} to find test suites", self.pattern);

        let mut suites = Vec::new();
        for entry in glob::glob(&self.pattern)? {
            let path = entry?;
            if !path.is_file() {
                continue;
            }
            let path = path.to_string_lossy().to_string();
            if path.split('/').any(|part| part == "node_modules") {
                continue;
            }
            suites.push(path);
        }

        info!("{} test suite(s) found.", suites.len());
        debug!("Paths to found suites: {:?}", suites);

        Ok(suites)
    }

    fn name(&self) -> &'static str {
        "glob"
    }
}

/// Uses an explicit, ordered list of suite paths verbatim.
///
/// No existence check is performed; a listed suite that is missing on
/// disk surfaces later as a missing result record.
pub struct ExplicitSource {
    suites: Vec<String>,
}

impl ExplicitSource {
    /// Create a source returning exactly the given paths.
    pub fn new(suites: Vec<String>) -> Self {
        Self { suites }
    }
}

#[async_trait]
impl SuiteSource for ExplicitSource {
    async fn discover(&self) -> DiscoveryResult<Vec<String>> {
        info!("{} test suite(s) listed.", self.suites.len());
        Ok(self.suites.clone())
    }

    fn name(&self) -> &'static str {
        "list"
    }
}
