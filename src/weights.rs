//! Learned per-suite weight estimates.
//!
//! The weight table is the only state that survives across runs. It maps
//! each suite identity to a cost estimate learned from measured durations,
//! so the next run can balance partitions by real cost instead of suite
//! count. The table is advisory: any failure to read or write it degrades
//! to the static line-count estimate and never fails the run.
//!
//! On disk the table is a JSON object:
//!
//! ```json
//! {
//!   "cypress/e2e/login.cy.js": { "weight": 120, "time": 38250 }
//! }
//! ```

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::executor::WorkItem;

/// One learned entry: the rescaled weight plus the measured duration that
/// produced it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WeightEntry {
    /// Cost estimate in arbitrary units.
    pub weight: f64,

    /// Measured duration in milliseconds from the run that produced this
    /// entry.
    #[serde(default)]
    pub time: u64,
}

/// Mapping from suite identity to learned weight.
///
/// A `BTreeMap` keeps the persisted file diff-stable between runs.
pub type WeightTable = BTreeMap<String, WeightEntry>;

/// Loads prior-run weight estimates and turns suites into weighted work
/// items.
pub struct WeightStore {
    path: PathBuf,
}

impl WeightStore {
    /// Create a store reading from the given weight file path.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Load the weight table from disk.
    ///
    /// A missing or unparsable file is not an error: the run proceeds
    /// with an empty table and every suite falls back to the static
    /// estimate.
    pub fn load(&self) -> WeightTable {
        match std::fs::read_to_string(&self.path) {
            Ok(content) => match serde_json::from_str(&content) {
                Ok(table) => table,
                Err(e) => {
                    warn!(
                        "Ignoring unparsable weight file {}: {}",
                        self.path.display(),
                        e
                    );
                    WeightTable::new()
                }
            },
            Err(_) => {
                warn!(
                    "Weight file not found: {}. Using line count as weight.",
                    self.path.display()
                );
                WeightTable::new()
            }
        }
    }
}

/// Builds weighted work items for the given suites, preserving their
/// discovery order.
///
/// Suites present in the table use the learned weight; the rest fall back
/// to the file's line count, read concurrently. A suite that cannot be
/// read weighs in at the scheduler's minimum.
pub async fn estimate(table: &WeightTable, suites: &[String]) -> Vec<WorkItem> {
    let items = suites.iter().map(|suite| async move {
        let weight = match table.get(suite) {
            Some(entry) => entry.weight,
            None => line_count_estimate(suite).await,
        };
        WorkItem::new(suite.clone(), weight)
    });

    join_all(items).await
}

/// Static fallback estimate: the suite file's line count.
async fn line_count_estimate(path: &str) -> f64 {
    match tokio::fs::read_to_string(path).await {
        Ok(content) => content.lines().count().max(1) as f64,
        Err(e) => {
            warn!("Error reading file {path}: {e}");
            crate::executor::MIN_WEIGHT
        }
    }
}

/// Derives updated weights from measured durations and persists them for
/// the next run.
pub struct WeightWriter {
    path: PathBuf,
}

impl WeightWriter {
    /// Create a writer persisting to the given weight file path.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Rescales each measured suite's weight to its share of the total
    /// measured duration, scaled to `target_total_weight`.
    ///
    /// Entries from `previous` that were not measured this run are kept
    /// unchanged, so a partial run (explicit suite list) does not erase
    /// estimates for the rest of the project.
    pub fn update(
        previous: &WeightTable,
        measured: &BTreeMap<String, u64>,
        total_duration_ms: u64,
        target_total_weight: u64,
    ) -> WeightTable {
        let mut table = previous.clone();

        for (suite, duration_ms) in measured {
            let weight = if total_duration_ms == 0 {
                0.0
            } else {
                (*duration_ms as f64 / total_duration_ms as f64 * target_total_weight as f64)
                    .floor()
            };

            table.insert(
                suite.clone(),
                WeightEntry {
                    weight,
                    time: *duration_ms,
                },
            );
        }

        table
    }

    /// Persists the table, replacing the previous file atomically.
    ///
    /// Weight learning is a performance optimization, so a write failure
    /// is logged and swallowed rather than failing the run.
    pub fn persist(&self, table: &WeightTable) {
        if let Err(e) = self.try_persist(table) {
            warn!(
                "Failed to write weight file {}: {}",
                self.path.display(),
                e
            );
        } else {
            info!("Weights file generated.");
        }
    }

    fn try_persist(&self, table: &WeightTable) -> anyhow::Result<()> {
        let parent = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };

        let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
        serde_json::to_writer_pretty(&mut tmp, table)?;
        tmp.flush()?;
        tmp.persist(&self.path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_file_gives_empty_table() {
        let dir = tempfile::tempdir().unwrap();
        let store = WeightStore::new(dir.path().join("absent.json"));
        assert!(store.load().is_empty());
    }

    #[test]
    fn load_garbled_file_gives_empty_table() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("weights.json");
        std::fs::write(&path, "{not json").unwrap();

        let store = WeightStore::new(&path);
        assert!(store.load().is_empty());
    }

    #[tokio::test]
    async fn estimate_prefers_table_over_line_count() {
        let dir = tempfile::tempdir().unwrap();
        let suite = dir.path().join("login.cy.js");
        std::fs::write(&suite, "line\nline\nline\n").unwrap();
        let suite = suite.to_string_lossy().to_string();

        let mut table = WeightTable::new();
        table.insert(
            suite.clone(),
            WeightEntry {
                weight: 42.0,
                time: 1000,
            },
        );

        let items = estimate(&table, std::slice::from_ref(&suite)).await;
        assert_eq!(items[0].weight, 42.0);
    }

    #[tokio::test]
    async fn estimate_falls_back_to_line_count() {
        let dir = tempfile::tempdir().unwrap();
        let suite = dir.path().join("cart.cy.js");
        std::fs::write(&suite, "a\nb\nc\nd\n").unwrap();
        let suite = suite.to_string_lossy().to_string();

        let items = estimate(&WeightTable::new(), std::slice::from_ref(&suite)).await;
        assert_eq!(items[0].weight, 4.0);
    }

    #[tokio::test]
    async fn estimate_handles_unreadable_suite() {
        let suites = vec!["does/not/exist.cy.js".to_string()];
        let items = estimate(&WeightTable::new(), &suites).await;

        assert_eq!(items.len(), 1);
        assert_eq!(items[0].weight, crate::executor::MIN_WEIGHT);
    }

    #[test]
    fn update_rescales_to_target_total() {
        let mut measured = BTreeMap::new();
        measured.insert("a.cy.js".to_string(), 100u64);
        measured.insert("b.cy.js".to_string(), 300u64);

        let table = WeightWriter::update(&WeightTable::new(), &measured, 400, 40);

        assert_eq!(table["a.cy.js"].weight, 10.0);
        assert_eq!(table["b.cy.js"].weight, 30.0);
        assert_eq!(table["a.cy.js"].time, 100);
    }

    #[test]
    fn update_keeps_unmeasured_entries() {
        let mut previous = WeightTable::new();
        previous.insert(
            "legacy.cy.js".to_string(),
            WeightEntry {
                weight: 7.0,
                time: 900,
            },
        );

        let mut measured = BTreeMap::new();
        measured.insert("fresh.cy.js".to_string(), 200u64);

        let table = WeightWriter::update(&previous, &measured, 200, 10);

        assert_eq!(table["legacy.cy.js"].weight, 7.0);
        assert_eq!(table["fresh.cy.js"].weight, 10.0);
    }

    #[test]
    fn update_handles_zero_total_duration() {
        let mut measured = BTreeMap::new();
        measured.insert("a.cy.js".to_string(), 0u64);

        let table = WeightWriter::update(&WeightTable::new(), &measured, 0, 10);
        assert_eq!(table["a.cy.js"].weight, 0.0);
    }

    #[test]
    fn round_trip_reproduces_weights_for_unchanged_durations() {
        let mut measured = BTreeMap::new();
        measured.insert("a.cy.js".to_string(), 150u64);
        measured.insert("b.cy.js".to_string(), 450u64);
        measured.insert("c.cy.js".to_string(), 600u64);

        let first = WeightWriter::update(&WeightTable::new(), &measured, 1200, 120);
        let second = WeightWriter::update(&first, &measured, 1200, 120);

        assert_eq!(first, second);
    }

    #[test]
    fn persist_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("weights.json");

        let mut measured = BTreeMap::new();
        measured.insert("a.cy.js".to_string(), 500u64);
        let table = WeightWriter::update(&WeightTable::new(), &measured, 500, 10);

        WeightWriter::new(&path).persist(&table);
        let loaded = WeightStore::new(&path).load();

        assert_eq!(loaded, table);
    }
}
