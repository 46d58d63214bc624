//! Run orchestration.
//!
//! This module contains the coordinating control flow for one run:
//! weigh the discovered suites, partition them across workers, fan the
//! workers out as OS processes, join on their completion, reassemble the
//! durably-written results, and learn weights for the next run.
//!
//! # Execution Flow
//!
//! ```text
//!  SuiteSource          WeightStore            Scheduler
//!      │                     │                     │
//!      │ discover()          │ load()              │
//!      ▼                     ▼                     │
//!  Vec<String> ──────► Vec<WorkItem> ────────────► │ partition() (LPT)
//!                                                  ▼
//!                                          Vec<Partition>
//!                                                  │
//!                            one WorkerSupervisor per partition
//!                                  (parallel OS processes)
//!                                                  │
//!            workers append records + markers to the results area
//!                                                  │
//!                                                  ▼
//!                                          ResultCollector
//!                                                  │
//!                                                  ▼
//!                               AggregateResult ──► summary, WeightWriter
//! ```
//!
//! The coordinator itself is single-threaded; the only fan-out/fan-in
//! point is the join over worker process exits.

pub mod scheduler;
pub mod supervisor;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use console::style;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::RunConfig;
use crate::discovery::SuiteSource;
use crate::report::{self, reporter_config};
use crate::results::{self, ResultCollector, Totals};
use crate::weights::{self, WeightStore, WeightWriter};

pub use scheduler::{MIN_WEIGHT, Partition, Scheduler, WorkItem, sanitize_weight};
pub use supervisor::{ExecutionOutcome, WorkerCommand, WorkerStatus, WorkerSupervisor};

/// Aggregated outcome of an entire run.
///
/// # Exit Codes
///
/// | Code | Meaning |
/// |------|---------|
/// | 0 | All suites passed |
/// | 1 | At least one test failed |
/// | worker's code | Bail mode terminated the run early |
#[derive(Debug, Clone, Copy)]
pub struct RunResult {
    /// Number of suites discovered at run start.
    pub total_suites: usize,

    /// Number of distinct suite records collected.
    pub collected: usize,

    /// Test counts and summed durations across all records.
    pub totals: Totals,

    /// Wall-clock time of the whole run.
    pub wall_time: Duration,

    /// The failing worker's exit code when bail mode ended the run early.
    pub bailed: Option<i32>,
}

impl RunResult {
    /// Returns `true` if the run completed with no failing tests.
    pub fn success(&self) -> bool {
        self.bailed.is_none() && self.totals.failures == 0
    }

    /// Process exit code for this result: a boolean CI gate, not a
    /// failure count.
    pub fn exit_code(&self) -> i32 {
        if let Some(code) = self.bailed {
            code
        } else if self.totals.failures > 0 {
            1
        } else {
            0
        }
    }
}

/// Coordinates one complete run.
///
/// Construction wires together a configuration value and a suite source;
/// everything else (weights, scheduling, supervision, collection) is
/// created inside [`run`](Self::run) with lifetimes scoped to that run.
pub struct Orchestrator<S> {
    config: RunConfig,
    source: S,
}

impl<S: SuiteSource> Orchestrator<S> {
    /// Creates an orchestrator from a validated configuration and a
    /// suite source.
    pub fn new(config: RunConfig, source: S) -> Self {
        Self { config, source }
    }

    /// Runs the full pipeline and returns the aggregated result.
    ///
    /// # Errors
    ///
    /// Returns an error before any worker is spawned when no suites are
    /// found or the results area cannot be prepared; afterwards only for
    /// integrity failures (strict-mode count mismatch) or infrastructure
    /// errors (spawn failure, unreadable results area).
    pub async fn run(&self) -> Result<RunResult> {
        let start = std::time::Instant::now();
        let results_dir = &self.config.report.results_dir;

        // Start from a clean results area so stale records from an
        // interrupted run can never leak into this one.
        if results_dir.exists() {
            std::fs::remove_dir_all(results_dir).ok();
        }
        std::fs::create_dir_all(results_dir).with_context(|| {
            format!("Failed to create results area: {}", results_dir.display())
        })?;

        info!("Discovering test suites ({})...", self.source.name());
        let suites = self.source.discover().await?;
        if suites.is_empty() {
            bail!("No test suites found; nothing to run");
        }

        let store = WeightStore::new(&self.config.scatter.weights_file);
        let table = store.load();
        let items = weights::estimate(&table, &suites).await;

        let scheduler = Scheduler::new(self.config.scatter.workers);
        let partitions = scheduler.partition(&items);
        let workers = partitions.len();
        if workers < self.config.scatter.workers {
            warn!("Limiting worker count to {workers} due to fewer test suites.");
        }
        info!(
            "Scheduled {} suite(s) across {} worker(s)",
            suites.len(),
            workers
        );

        let reporter_config_path = reporter_config_path(results_dir);
        reporter_config::write(&self.config.report, results_dir, &reporter_config_path)?;

        let cancel = CancellationToken::new();
        let mut running = JoinSet::new();
        for (idx, partition) in partitions.into_iter().enumerate() {
            let command = WorkerCommand::build(
                &self.config.runner,
                &self.config.report,
                &partition.suites,
                &reporter_config_path,
            )?;
            let supervisor = WorkerSupervisor::new(idx + 1, partition, command, cancel.clone());
            running.spawn(supervisor.run());
        }

        while let Some(joined) = running.join_next().await {
            let outcome = joined.context("worker task panicked")??;
            if !outcome.failed() {
                continue;
            }

            warn!("Worker {} exited with errors", outcome.worker);
            if self.config.scatter.bail {
                error!("Bail enabled and a worker exited with errors, exiting early with error");
                cancel.cancel();
                while let Some(res) = running.join_next().await {
                    res.ok();
                }

                let code = match outcome.status {
                    WorkerStatus::Exited(code) => code,
                    WorkerStatus::Cancelled => 1,
                };
                return Ok(RunResult {
                    total_suites: suites.len(),
                    collected: 0,
                    totals: Totals::default(),
                    wall_time: start.elapsed(),
                    bailed: Some(code),
                });
            }
        }
        let wall_time = start.elapsed();

        let collector = ResultCollector::new(results_dir, workers);
        let aggregate = collector.collect().await?;
        collector.cleanup().await;

        report::print_summary(&aggregate);

        if let Err(e) = results::verify_complete(&aggregate, &suites) {
            if self.config.scatter.strict {
                return Err(e.into());
            }
            warn!("{e}");
        }

        let totals = aggregate.totals();
        report::print_time_saved(totals.duration_ms, wall_time);

        let measured: BTreeMap<String, u64> = aggregate
            .records
            .iter()
            .map(|(suite, record)| (suite.clone(), record.duration))
            .collect();
        let target = totals.tests * self.config.scatter.weight_target_per_test;
        let updated = WeightWriter::update(&table, &measured, totals.duration_ms, target);
        WeightWriter::new(&self.config.scatter.weights_file).persist(&updated);

        if totals.failures > 0 {
            eprintln!(
                "{}",
                style(format!("{} test failure(s)", totals.failures)).red()
            );
        }

        Ok(RunResult {
            total_suites: suites.len(),
            collected: aggregate.records.len(),
            totals,
            wall_time,
            bailed: None,
        })
    }
}

/// The generated reporter configuration lives next to the results area,
/// so workers and the coordinator agree on its location without any
/// shared ambient state.
fn reporter_config_path(results_dir: &std::path::Path) -> PathBuf {
    match results_dir.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => {
            parent.join(reporter_config::REPORTER_CONFIG_FILE)
        }
        _ => PathBuf::from(reporter_config::REPORTER_CONFIG_FILE),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DiscoveryConfig, ListDiscoveryConfig};
    use crate::discovery::ExplicitSource;
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;

    /// Writes an executable stub standing in for the external test
    /// framework. Workers are invoked npm-style, so `$5` is the
    /// comma-separated suite list.
    fn write_stub(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    /// Stub body that records one passing suite record per assigned
    /// suite, then the completion marker.
    fn recording_stub_body(results_dir: &Path, skip: &str) -> String {
        format!(
            r#"dir="{dir}"
i=0
IFS=','
for f in $5; do
  case "$f" in *{skip}*) continue;; esac
  i=$((i+1))
  printf '{{"file":"%s","worker":%s,"passes":2,"failures":0,"pending":0,"duration":100,"timestamp":"2024-01-01T00:00:00Z"}}' "$f" "$SCATTER_WORKER" > "$dir/w$SCATTER_WORKER-$i.json"
done
printf '{{"worker":%s,"records":%s,"timestamp":"2024-01-01T00:00:00Z"}}' "$SCATTER_WORKER" "$i" > "$dir/worker-$SCATTER_WORKER.done"
"#,
            dir = results_dir.display(),
            skip = skip,
        )
    }

    fn test_config(dir: &Path, program: &Path, suites: Vec<String>) -> RunConfig {
        let mut config = RunConfig::default();
        config.runner.program = program.to_string_lossy().to_string();
        config.runner.script = Some("stub".to_string());
        config.discovery = DiscoveryConfig::List(ListDiscoveryConfig {
            suites: suites.clone(),
        });
        config.report.results_dir = dir.join("runner-results");
        config.scatter.weights_file = dir.join("scatter-weights.json");
        config
    }

    fn suite_files(dir: &Path, names: &[&str]) -> Vec<String> {
        names
            .iter()
            .map(|name| {
                let path = dir.join(name);
                std::fs::write(&path, "describe()\nit()\n").unwrap();
                path.to_string_lossy().to_string()
            })
            .collect()
    }

    #[tokio::test]
    async fn empty_suite_list_aborts_before_spawning() {
        let dir = tempfile::tempdir().unwrap();
        let stub = write_stub(dir.path(), "worker.sh", "exit 0");
        let config = test_config(dir.path(), &stub, Vec::new());

        let orchestrator = Orchestrator::new(config, ExplicitSource::new(Vec::new()));
        let err = orchestrator.run().await.unwrap_err();
        assert!(err.to_string().contains("No test suites found"));
    }

    #[tokio::test]
    async fn full_run_collects_results_and_learns_weights() {
        let dir = tempfile::tempdir().unwrap();
        let suites = suite_files(dir.path(), &["alpha.cy.js", "beta.cy.js"]);

        let results_dir = dir.path().join("runner-results");
        let stub = write_stub(
            dir.path(),
            "worker.sh",
            &recording_stub_body(&results_dir, "no-skip"),
        );
        let config = test_config(dir.path(), &stub, suites.clone());

        let orchestrator = Orchestrator::new(config.clone(), ExplicitSource::new(suites));
        let result = orchestrator.run().await.unwrap();

        assert!(result.success());
        assert_eq!(result.exit_code(), 0);
        assert_eq!(result.total_suites, 2);
        assert_eq!(result.collected, 2);
        assert_eq!(result.totals.passes, 4);

        // The results area is consumed by collection.
        assert!(!results_dir.exists());

        // Weights were learned for the next run.
        let table = WeightStore::new(&config.scatter.weights_file).load();
        assert_eq!(table.len(), 2);
    }

    #[tokio::test]
    async fn strict_mode_rejects_missing_records() {
        let dir = tempfile::tempdir().unwrap();
        let suites = suite_files(dir.path(), &["alpha.cy.js", "dropped.cy.js"]);

        let results_dir = dir.path().join("runner-results");
        let stub = write_stub(
            dir.path(),
            "worker.sh",
            &recording_stub_body(&results_dir, "dropped"),
        );
        let config = test_config(dir.path(), &stub, suites.clone());

        let orchestrator = Orchestrator::new(config, ExplicitSource::new(suites));
        let err = orchestrator.run().await.unwrap_err();
        assert!(err.to_string().contains("do not match results"));
    }

    #[tokio::test]
    async fn lenient_mode_tolerates_missing_records() {
        let dir = tempfile::tempdir().unwrap();
        let suites = suite_files(dir.path(), &["alpha.cy.js", "dropped.cy.js"]);

        let results_dir = dir.path().join("runner-results");
        let stub = write_stub(
            dir.path(),
            "worker.sh",
            &recording_stub_body(&results_dir, "dropped"),
        );
        let mut config = test_config(dir.path(), &stub, suites.clone());
        config.scatter.strict = false;

        let orchestrator = Orchestrator::new(config, ExplicitSource::new(suites));
        let result = orchestrator.run().await.unwrap();

        assert_eq!(result.collected, 1);
        assert_eq!(result.exit_code(), 0);
    }

    #[tokio::test]
    async fn bail_terminates_without_waiting_for_slow_workers() {
        let dir = tempfile::tempdir().unwrap();
        let suites = suite_files(dir.path(), &["bad.cy.js", "slow.cy.js"]);

        let stub = write_stub(
            dir.path(),
            "worker.sh",
            r#"case "$5" in *bad*) exit 7;; esac
sleep 30"#,
        );
        let mut config = test_config(dir.path(), &stub, suites.clone());
        config.scatter.bail = true;

        let started = std::time::Instant::now();
        let orchestrator = Orchestrator::new(config, ExplicitSource::new(suites));
        let result = orchestrator.run().await.unwrap();

        assert_eq!(result.bailed, Some(7));
        assert_eq!(result.exit_code(), 7);
        assert!(started.elapsed() < Duration::from_secs(20));
    }
}
