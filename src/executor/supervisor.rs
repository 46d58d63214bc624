//! Worker process supervision.
//!
//! One supervisor owns one partition and drives exactly one external
//! test-framework process over it: spawn, await exit, surface the exit
//! status. The coordinator never parses worker output; workers inherit
//! stdio and report durably through the result protocol instead.
//!
//! Cancellation is coarse. When the run-wide token fires (bail mode),
//! the supervisor kills its child and resolves; children are also spawned
//! with `kill_on_drop` so coordinator teardown cannot leak processes.

use std::path::Path;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::scheduler::Partition;
use crate::config::{ReportConfig, RunnerConfig};
use crate::results::WORKER_ENV;

/// How one worker process finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerStatus {
    /// The process exited on its own with the given code (-1 when
    /// terminated by a signal).
    Exited(i32),

    /// The supervisor killed the process after run-wide cancellation.
    Cancelled,
}

/// Terminal state of one supervised worker.
#[derive(Debug, Clone, Copy)]
pub struct ExecutionOutcome {
    /// Worker index (1-based, stable for the run).
    pub worker: usize,

    /// How the process finished.
    pub status: WorkerStatus,

    /// Wall-clock time from spawn to termination.
    pub duration: Duration,
}

impl ExecutionOutcome {
    /// Returns `true` if the worker exited with a non-zero code.
    ///
    /// A cancelled worker is not a failure of its own; the failure that
    /// triggered cancellation is reported elsewhere.
    pub fn failed(&self) -> bool {
        matches!(self.status, WorkerStatus::Exited(code) if code != 0)
    }
}

/// The fully resolved command line and environment for one worker.
///
/// Built once per worker from the runner configuration; keeping it a
/// plain value makes supervisors constructible with arbitrary commands
/// in tests.
#[derive(Debug, Clone)]
pub struct WorkerCommand {
    /// Executable to spawn.
    pub program: String,

    /// Argument vector.
    pub args: Vec<String>,

    /// Extra environment variables beyond the worker index.
    pub env: Vec<(String, String)>,
}

impl WorkerCommand {
    /// Builds the npm-style invocation for a partition's suites:
    /// `<program> run <script> -- --spec <files> --reporter <module>
    /// --reporter-options configFile=<path> <extra args...>`.
    pub fn build(
        runner: &RunnerConfig,
        report: &ReportConfig,
        suites: &[String],
        reporter_config: &Path,
    ) -> Result<Self> {
        let script = runner
            .script
            .as_deref()
            .context("runner script not configured")?;

        let mut args = vec![
            "run".to_string(),
            script.to_string(),
            "--".to_string(),
            "--spec".to_string(),
            suites.join(","),
            "--reporter".to_string(),
            report.reporter_module.clone(),
            "--reporter-options".to_string(),
            format!("configFile={}", reporter_config.display()),
        ];

        let extra = shell_words::split(&runner.args)
            .with_context(|| format!("Failed to parse runner args: {}", runner.args))?;
        args.extend(extra);

        Ok(Self {
            program: runner.program.clone(),
            args,
            env: runner.env.clone(),
        })
    }
}

/// Supervises a single worker process for one partition.
pub struct WorkerSupervisor {
    worker: usize,
    partition: Partition,
    command: WorkerCommand,
    cancel: CancellationToken,
}

impl WorkerSupervisor {
    /// Create a supervisor for the given worker index and partition.
    pub fn new(
        worker: usize,
        partition: Partition,
        command: WorkerCommand,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            worker,
            partition,
            command,
            cancel,
        }
    }

    /// Spawns the worker process and waits for it to terminate.
    ///
    /// Resolves only when the process has exited (or been killed after
    /// cancellation), never early. The worker index is injected through
    /// the environment so the worker's reporter can namespace its
    /// records.
    pub async fn run(self) -> Result<ExecutionOutcome> {
        info!(
            "Worker {} starting: {} suite(s), total weight {:.0}",
            self.worker,
            self.partition.suites.len(),
            self.partition.total_weight
        );

        let mut cmd = tokio::process::Command::new(&self.command.program);
        cmd.args(&self.command.args);
        cmd.env(WORKER_ENV, self.worker.to_string());
        for (key, value) in &self.command.env {
            cmd.env(key, value);
        }
        cmd.kill_on_drop(true);

        let start = Instant::now();
        let mut child = cmd.spawn().with_context(|| {
            format!(
                "Failed to spawn worker {} ({})",
                self.worker, self.command.program
            )
        })?;

        tokio::select! {
            status = child.wait() => {
                let status = status
                    .with_context(|| format!("Failed to wait on worker {}", self.worker))?;
                let code = status.code().unwrap_or(-1);
                debug!("Worker {} exited with code {}", self.worker, code);

                Ok(ExecutionOutcome {
                    worker: self.worker,
                    status: WorkerStatus::Exited(code),
                    duration: start.elapsed(),
                })
            }
            _ = self.cancel.cancelled() => {
                debug!("Worker {} cancelled, killing process", self.worker);
                let _ = child.kill().await;

                Ok(ExecutionOutcome {
                    worker: self.worker,
                    status: WorkerStatus::Cancelled,
                    duration: start.elapsed(),
                })
            }
        }
    }
}
