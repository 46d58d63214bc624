//! Console reporting for completed runs.
//!
//! Renders the per-suite statistics table, the run totals, and the
//! time-saved line. Everything here is presentation over an already
//! assembled [`AggregateResult`]; nothing feeds back into scheduling or
//! exit codes.

pub mod reporter_config;

use std::time::Duration;

use console::style;

use crate::results::AggregateResult;

const MIN_SPEC_COLUMN: usize = 10;

/// Formats a millisecond duration as `Xm Ys` (or `Ys` under a minute),
/// rounding seconds up.
pub fn format_time(ms: u64) -> String {
    let seconds = ms.div_ceil(1000);
    let min = seconds / 60;
    let sec = seconds % 60;

    if min > 0 {
        format!("{min}m {sec}s")
    } else {
        format!("{sec}s")
    }
}

/// Prints the per-suite statistics table and totals row.
pub fn print_summary(aggregate: &AggregateResult) {
    println!("{}", render_summary(aggregate));
}

pub(crate) fn render_summary(aggregate: &AggregateResult) -> String {
    let spec_width = aggregate
        .records
        .keys()
        .map(String::len)
        .max()
        .unwrap_or(0)
        .max(MIN_SPEC_COLUMN)
        + 3;

    let mut out = String::new();
    out.push_str(&format!(
        "{:<spec_width$} {:>10} {:>8} {:>9} {:>9} {:>9}\n",
        style("Spec").blue(),
        "Time",
        "Tests",
        "Passing",
        "Failing",
        "Pending",
    ));

    for (suite, record) in &aggregate.records {
        out.push_str(&format!(
            "{:<spec_width$} {:>10} {:>8} {:>9} {:>9} {:>9}\n",
            suite,
            format_time(record.duration),
            record.tests(),
            paint_passes(record.passes),
            paint_failures(record.failures),
            record.pending,
        ));
    }

    let totals = aggregate.totals();
    out.push_str(&format!(
        "{:<spec_width$} {:>10} {:>8} {:>9} {:>9} {:>9}",
        "Results",
        format_time(totals.duration_ms),
        totals.tests,
        paint_passes(totals.passes),
        paint_failures(totals.failures),
        totals.pending,
    ));

    out
}

fn paint_passes(passes: u64) -> String {
    if passes > 0 {
        style(passes).green().to_string()
    } else {
        passes.to_string()
    }
}

fn paint_failures(failures: u64) -> String {
    if failures > 0 {
        style(failures).red().to_string()
    } else {
        failures.to_string()
    }
}

/// Prints how much wall-clock time parallel execution saved over the
/// summed suite durations.
pub fn print_time_saved(total_duration_ms: u64, wall: Duration) {
    let wall_ms = wall.as_millis() as u64;
    let saved_ms = total_duration_ms.saturating_sub(wall_ms);
    let percent = if total_duration_ms > 0 {
        (saved_ms as f64 / total_duration_ms as f64 * 100.0).round()
    } else {
        0.0
    };

    println!(
        "Total run time: {}s, executed in: {}s, saved {}s (~{}%)",
        total_duration_ms / 1000,
        wall_ms / 1000,
        saved_ms / 1000,
        percent
    );
}
