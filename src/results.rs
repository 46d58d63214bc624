//! The durable result protocol between workers and the coordinator.
//!
//! Each worker persists one JSON record per completed suite into a shared
//! results area, then writes a completion marker. The coordinator scans
//! the area once after all workers settle and reassembles a consistent
//! global result set. The protocol tolerates partial failures: a missing
//! marker degrades to a warning and partial results, never a crash.
//!
//! # Write path
//!
//! Records are written to a uniquely-suffixed temporary file and then
//! renamed into place, so a concurrent reader can never observe a
//! half-written record. Record file names are derived from the sanitized
//! suite identity plus the worker index, which keeps workers collision-free
//! by construction and needs no cross-process locking.
//!
//! # Ordering
//!
//! The only cross-write ordering constraint in the system: a worker writes
//! all of its records before its completion marker. [`RecordWriter`]
//! enforces this by construction (`finish` consumes the writer).

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use futures::future::join_all;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::RetryConfig;

/// File-name suffix of completion markers.
pub const MARKER_SUFFIX: &str = ".done";

/// Environment variable carrying the worker index into worker processes.
pub const WORKER_ENV: &str = "SCATTER_WORKER";

/// The durable outcome of one test suite.
///
/// Written by a worker, read-only to the coordinator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuiteRecord {
    /// Suite identity (the path the suite was discovered under).
    pub file: String,

    /// Index of the worker that executed the suite.
    #[serde(default)]
    pub worker: usize,

    /// Passing test count.
    pub passes: u64,

    /// Failing test count.
    pub failures: u64,

    /// Pending (skipped) test count.
    pub pending: u64,

    /// Suite duration in milliseconds.
    pub duration: u64,

    /// Completion timestamp, ISO-8601.
    pub timestamp: String,
}

impl SuiteRecord {
    /// Create an empty record for the given suite, stamped now.
    pub fn new(file: impl Into<String>, worker: usize) -> Self {
        Self {
            file: file.into(),
            worker,
            passes: 0,
            failures: 0,
            pending: 0,
            duration: 0,
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }

    /// Set the per-outcome test counts.
    pub fn with_counts(mut self, passes: u64, failures: u64, pending: u64) -> Self {
        self.passes = passes;
        self.failures = failures;
        self.pending = pending;
        self
    }

    /// Set the measured duration in milliseconds.
    pub fn with_duration(mut self, duration_ms: u64) -> Self {
        self.duration = duration_ms;
        self
    }

    /// Total number of tests in the suite.
    pub fn tests(&self) -> u64 {
        self.passes + self.failures + self.pending
    }
}

/// Signals that a worker has finished writing all of its records.
///
/// Without this, "zero records from worker N" is ambiguous between a
/// worker with nothing to report and a worker that crashed before writing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionMarker {
    /// Index of the worker that completed.
    pub worker: usize,

    /// How many records the worker wrote.
    pub records: usize,

    /// Completion timestamp, ISO-8601.
    pub timestamp: String,
}

/// Collapses a suite identity into a filesystem-safe record name.
pub fn sanitize_identity(identity: &str) -> String {
    let re = Regex::new(r"[^a-z0-9]+").unwrap();
    re.replace_all(&identity.to_lowercase(), "_").to_string()
}

fn marker_name(worker: usize) -> String {
    format!("worker-{worker}{MARKER_SUFFIX}")
}

/// Writer half of the result protocol, used inside a worker process.
///
/// Writes are atomic (temp file plus rename) and retried with a fresh
/// unique suffix on transient I/O errors, so an aborted attempt can never
/// clobber a good record.
pub struct RecordWriter {
    dir: PathBuf,
    worker: usize,
    retry: RetryConfig,
    written: usize,
}

impl RecordWriter {
    /// Create a writer for the given results area and worker index.
    pub fn new(dir: impl Into<PathBuf>, worker: usize, retry: RetryConfig) -> Self {
        Self {
            dir: dir.into(),
            worker,
            retry,
            written: 0,
        }
    }

    /// Durably persist one suite record.
    pub async fn write(&mut self, record: &SuiteRecord) -> std::io::Result<()> {
        let name = format!("{}-{}.json", sanitize_identity(&record.file), self.worker);
        let payload = serde_json::to_vec_pretty(record)?;

        atomic_write(&self.dir, &name, &payload, &self.retry).await?;
        self.written += 1;
        Ok(())
    }

    /// Write the completion marker, consuming the writer.
    ///
    /// Consuming `self` makes it impossible to append records after the
    /// marker.
    pub async fn finish(self) -> std::io::Result<()> {
        write_marker(&self.dir, self.worker, self.written, &self.retry).await
    }
}

/// Writes a worker's completion marker.
///
/// Exposed separately from [`RecordWriter`] for reporter integrations
/// that record each result from a fresh process and cannot carry a
/// writer across invocations.
pub async fn write_marker(
    dir: &Path,
    worker: usize,
    records: usize,
    retry: &RetryConfig,
) -> std::io::Result<()> {
    let marker = CompletionMarker {
        worker,
        records,
        timestamp: chrono::Utc::now().to_rfc3339(),
    };
    let payload = serde_json::to_vec_pretty(&marker)?;

    atomic_write(dir, &marker_name(worker), &payload, retry).await
}

/// Write-to-temp then rename, retried with a fresh unique suffix.
async fn atomic_write(
    dir: &Path,
    name: &str,
    payload: &[u8],
    retry: &RetryConfig,
) -> std::io::Result<()> {
    tokio::fs::create_dir_all(dir).await?;
    let final_path = dir.join(name);

    let mut attempt = 0;
    loop {
        attempt += 1;
        let tmp = dir.join(format!(".{}-{}.tmp", name, Uuid::new_v4()));

        let outcome = async {
            tokio::fs::write(&tmp, payload).await?;
            tokio::fs::rename(&tmp, &final_path).await
        }
        .await;

        match outcome {
            Ok(()) => return Ok(()),
            Err(e) => {
                tokio::fs::remove_file(&tmp).await.ok();
                if attempt >= retry.max_attempts.max(1) {
                    return Err(e);
                }
                warn!(
                    "Write attempt {attempt} for {} failed, retrying: {e}",
                    final_path.display()
                );
                tokio::time::sleep(Duration::from_millis(retry.backoff_ms * attempt as u64)).await;
            }
        }
    }
}

/// Per-run totals accumulated over all collected records.
#[derive(Debug, Clone, Copy, Default)]
pub struct Totals {
    /// Total tests across all suites.
    pub tests: u64,
    /// Passing tests.
    pub passes: u64,
    /// Failing tests.
    pub failures: u64,
    /// Pending tests.
    pub pending: u64,
    /// Sum of suite durations in milliseconds.
    pub duration_ms: u64,
}

/// The merged, in-memory view of everything the workers reported.
#[derive(Debug, Default)]
pub struct AggregateResult {
    /// One record per suite identity.
    pub records: BTreeMap<String, SuiteRecord>,

    /// Workers whose completion marker was found.
    pub completed_workers: BTreeSet<usize>,

    /// Expected workers with no completion marker. Reported as a
    /// reliability warning; their records (if any) are still included.
    pub missing_markers: Vec<usize>,

    /// Suite identities observed in more than one record file. Last
    /// write wins, but a duplicate is a defect signal worth surfacing.
    pub duplicates: Vec<String>,
}

impl AggregateResult {
    /// Sums counts and durations over all records.
    pub fn totals(&self) -> Totals {
        let mut totals = Totals::default();
        for record in self.records.values() {
            totals.tests += record.tests();
            totals.passes += record.passes;
            totals.failures += record.failures;
            totals.pending += record.pending;
            totals.duration_ms += record.duration;
        }
        totals
    }
}

/// Errors surfaced while reassembling worker results.
#[derive(Debug, thiserror::Error)]
pub enum CollectError {
    /// The results area could not be scanned.
    #[error("IO error in results area: {0}")]
    Io(#[from] std::io::Error),

    /// Collected records do not cover every discovered suite.
    #[error(
        "test suites found ({expected}) do not match results ({found}); missing: {missing:?}"
    )]
    IncompleteResults {
        /// Number of suites discovered at run start.
        expected: usize,
        /// Number of distinct suite records collected.
        found: usize,
        /// Discovered suites with no record.
        missing: Vec<String>,
    },
}

enum ScannedEntry {
    Record(SuiteRecord),
    Marker(CompletionMarker),
    Skipped,
}

/// Reader half of the result protocol, run once after all workers settle.
pub struct ResultCollector {
    dir: PathBuf,
    expected_workers: usize,
}

impl ResultCollector {
    /// Create a collector over the given results area.
    pub fn new(dir: impl Into<PathBuf>, expected_workers: usize) -> Self {
        Self {
            dir: dir.into(),
            expected_workers,
        }
    }

    /// Scans the results area and merges every record by suite identity.
    ///
    /// Individual unreadable or unparsable files are logged and skipped;
    /// the collector favors returning partial results over losing the
    /// whole run's signal. Only a failure to scan the area itself is an
    /// error.
    pub async fn collect(&self) -> Result<AggregateResult, CollectError> {
        let mut paths = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            paths.push(entry.path());
        }

        let scanned = join_all(paths.iter().map(|path| scan_entry(path))).await;

        let mut aggregate = AggregateResult::default();
        for (entry, path) in scanned.into_iter().zip(paths.iter()) {
            match entry {
                ScannedEntry::Record(record) => {
                    let identity = record.file.clone();
                    if aggregate.records.insert(identity.clone(), record).is_some() {
                        warn!("Duplicate result record for {identity}; keeping the last one read");
                        aggregate.duplicates.push(identity);
                    }
                }
                ScannedEntry::Marker(marker) => {
                    aggregate.completed_workers.insert(marker.worker);
                }
                ScannedEntry::Skipped => {
                    debug!("Skipping non-record entry {}", path.display());
                }
            }
        }

        for worker in 1..=self.expected_workers {
            if !aggregate.completed_workers.contains(&worker) {
                warn!(
                    "Worker {worker} left no completion marker; its results may be incomplete"
                );
                aggregate.missing_markers.push(worker);
            }
        }

        Ok(aggregate)
    }

    /// Deletes the results area once all records are in memory.
    ///
    /// The area's lifetime is scoped to one run; deletion failures are
    /// logged, not fatal.
    pub async fn cleanup(&self) {
        if let Err(e) = tokio::fs::remove_dir_all(&self.dir).await {
            warn!("Failed to remove results area {}: {e}", self.dir.display());
        }
    }
}

async fn scan_entry(path: &Path) -> ScannedEntry {
    let name = match path.file_name().and_then(|n| n.to_str()) {
        Some(name) => name,
        None => return ScannedEntry::Skipped,
    };

    if name.ends_with(MARKER_SUFFIX) {
        match read_json::<CompletionMarker>(path).await {
            Ok(marker) => ScannedEntry::Marker(marker),
            Err(e) => {
                warn!("Error reading or parsing marker {name}: {e}");
                ScannedEntry::Skipped
            }
        }
    } else if name.ends_with(".json") {
        match read_json::<SuiteRecord>(path).await {
            Ok(record) => ScannedEntry::Record(record),
            Err(e) => {
                warn!("Error reading or parsing file {name}: {e}");
                ScannedEntry::Skipped
            }
        }
    } else {
        ScannedEntry::Skipped
    }
}

async fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> anyhow::Result<T> {
    let content = tokio::fs::read_to_string(path).await?;
    Ok(serde_json::from_str(&content)?)
}

/// Checks that the collected records cover every discovered suite.
///
/// The caller decides whether a mismatch is fatal (strict mode) or only
/// reported.
pub fn verify_complete(
    aggregate: &AggregateResult,
    discovered: &[String],
) -> Result<(), CollectError> {
    if aggregate.records.len() == discovered.len() {
        return Ok(());
    }

    let missing: Vec<String> = discovered
        .iter()
        .filter(|suite| !aggregate.records.contains_key(*suite))
        .cloned()
        .collect();

    Err(CollectError::IncompleteResults {
        expected: discovered.len(),
        found: aggregate.records.len(),
        missing,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(file: &str, worker: usize, failures: u64) -> SuiteRecord {
        SuiteRecord::new(file, worker)
            .with_counts(3, failures, 1)
            .with_duration(1200)
    }

    #[tokio::test]
    async fn write_then_collect_round_trips() {
        let dir = tempfile::tempdir().unwrap();

        let mut writer = RecordWriter::new(dir.path(), 1, RetryConfig::default());
        writer.write(&record("a.cy.js", 1, 0)).await.unwrap();
        writer.write(&record("b.cy.js", 1, 2)).await.unwrap();
        writer.finish().await.unwrap();

        let collector = ResultCollector::new(dir.path(), 1);
        let aggregate = collector.collect().await.unwrap();

        assert_eq!(aggregate.records.len(), 2);
        assert!(aggregate.missing_markers.is_empty());
        assert!(aggregate.duplicates.is_empty());
        assert_eq!(aggregate.records["a.cy.js"].passes, 3);

        let totals = aggregate.totals();
        assert_eq!(totals.tests, 8);
        assert_eq!(totals.failures, 2);
        assert_eq!(totals.duration_ms, 2400);
    }

    #[tokio::test]
    async fn three_workers_six_suites_aggregate_cleanly() {
        let dir = tempfile::tempdir().unwrap();

        let assignments: [&[&str]; 3] = [
            &["a.cy.js", "f.cy.js"],
            &["b.cy.js", "e.cy.js"],
            &["c.cy.js", "d.cy.js"],
        ];
        for (idx, suites) in assignments.iter().enumerate() {
            let mut writer = RecordWriter::new(dir.path(), idx + 1, RetryConfig::default());
            for suite in *suites {
                writer.write(&record(suite, idx + 1, 0)).await.unwrap();
            }
            writer.finish().await.unwrap();
        }

        let aggregate = ResultCollector::new(dir.path(), 3).collect().await.unwrap();

        assert_eq!(aggregate.records.len(), 6);
        assert!(aggregate.missing_markers.is_empty());
        assert!(aggregate.duplicates.is_empty());
        assert_eq!(
            aggregate.completed_workers.iter().copied().collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
    }

    #[tokio::test]
    async fn missing_marker_is_flagged_but_not_fatal() {
        let dir = tempfile::tempdir().unwrap();

        let mut done = RecordWriter::new(dir.path(), 1, RetryConfig::default());
        done.write(&record("a.cy.js", 1, 0)).await.unwrap();
        done.finish().await.unwrap();

        // Worker 2 writes a record but never completes.
        let mut crashed = RecordWriter::new(dir.path(), 2, RetryConfig::default());
        crashed.write(&record("b.cy.js", 2, 0)).await.unwrap();

        let aggregate = ResultCollector::new(dir.path(), 2).collect().await.unwrap();

        assert_eq!(aggregate.records.len(), 2);
        assert_eq!(aggregate.missing_markers, vec![2]);
    }

    #[tokio::test]
    async fn duplicate_identity_keeps_one_record_and_flags_it() {
        let dir = tempfile::tempdir().unwrap();

        let mut first = RecordWriter::new(dir.path(), 1, RetryConfig::default());
        first.write(&record("dup.cy.js", 1, 0)).await.unwrap();
        first.finish().await.unwrap();

        let mut second = RecordWriter::new(dir.path(), 2, RetryConfig::default());
        second.write(&record("dup.cy.js", 2, 1)).await.unwrap();
        second.finish().await.unwrap();

        let aggregate = ResultCollector::new(dir.path(), 2).collect().await.unwrap();

        assert_eq!(aggregate.records.len(), 1);
        assert_eq!(aggregate.duplicates, vec!["dup.cy.js"]);
    }

    #[tokio::test]
    async fn partial_and_garbled_files_are_skipped() {
        let dir = tempfile::tempdir().unwrap();

        let mut writer = RecordWriter::new(dir.path(), 1, RetryConfig::default());
        writer.write(&record("good.cy.js", 1, 0)).await.unwrap();
        writer.finish().await.unwrap();

        std::fs::write(dir.path().join(".partial-123.tmp"), "{\"file\":").unwrap();
        std::fs::write(dir.path().join("garbled.json"), "not json at all").unwrap();

        let aggregate = ResultCollector::new(dir.path(), 1).collect().await.unwrap();

        assert_eq!(aggregate.records.len(), 1);
        assert!(aggregate.records.contains_key("good.cy.js"));
    }

    #[tokio::test]
    async fn write_gives_up_after_bounded_retries() {
        let dir = tempfile::tempdir().unwrap();
        let rec = record("blocked.cy.js", 1, 0);

        // Occupy the record's final path with a non-empty directory so
        // every rename attempt fails.
        let final_name = format!("{}-1.json", sanitize_identity(&rec.file));
        std::fs::create_dir(dir.path().join(&final_name)).unwrap();
        std::fs::write(dir.path().join(&final_name).join("x"), "x").unwrap();

        let retry = RetryConfig {
            max_attempts: 2,
            backoff_ms: 1,
        };
        let mut writer = RecordWriter::new(dir.path(), 1, retry);
        assert!(writer.write(&rec).await.is_err());

        // Failed attempts must not leave temporary files behind.
        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn cleanup_removes_results_area() {
        let dir = tempfile::tempdir().unwrap();
        let area = dir.path().join("runner-results");

        let mut writer = RecordWriter::new(&area, 1, RetryConfig::default());
        writer.write(&record("a.cy.js", 1, 0)).await.unwrap();
        writer.finish().await.unwrap();

        let collector = ResultCollector::new(&area, 1);
        collector.collect().await.unwrap();
        collector.cleanup().await;

        assert!(!area.exists());
    }

    #[test]
    fn verify_reports_missing_suites() {
        let mut aggregate = AggregateResult::default();
        for suite in ["a.cy.js", "b.cy.js", "c.cy.js", "d.cy.js"] {
            aggregate
                .records
                .insert(suite.to_string(), record(suite, 1, 0));
        }

        let discovered: Vec<String> = ["a.cy.js", "b.cy.js", "c.cy.js", "d.cy.js", "e.cy.js"]
            .iter()
            .map(|s| s.to_string())
            .collect();

        match verify_complete(&aggregate, &discovered) {
            Err(CollectError::IncompleteResults {
                expected,
                found,
                missing,
            }) => {
                assert_eq!(expected, 5);
                assert_eq!(found, 4);
                assert_eq!(missing, vec!["e.cy.js"]);
            }
            other => panic!("expected IncompleteResults, got {other:?}"),
        }
    }

    #[test]
    fn verify_accepts_exact_coverage() {
        let mut aggregate = AggregateResult::default();
        aggregate
            .records
            .insert("a.cy.js".to_string(), record("a.cy.js", 1, 0));

        assert!(verify_complete(&aggregate, &["a.cy.js".to_string()]).is_ok());
    }

    #[test]
    fn sanitize_collapses_special_characters() {
        assert_eq!(
            sanitize_identity("cypress/e2e/Login Flow.cy.js"),
            "cypress_e2e_login_flow_cy_js"
        );
        assert_eq!(sanitize_identity("ABC"), "abc");
    }
}
