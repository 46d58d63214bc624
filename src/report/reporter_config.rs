//! Reporter configuration file generation.
//!
//! The external test framework is pointed at a reporter multiplexer whose
//! behavior is driven by a JSON configuration file. The coordinator
//! generates that file once per run and passes its path to every worker
//! as a process argument, so workers need no out-of-band settings.
//!
//! The generated object has a `reporterEnabled` string (comma-separated
//! reporter identifiers) and one `<camelCasedReporter>ReporterOptions`
//! object per enabled reporter carrying at least `reportDir`, the shared
//! results area. A user-supplied override file is merged in: enabled
//! lists are unioned, option objects are shallow-merged with user values
//! winning.

use std::path::Path;

use anyhow::{Context, Result};
use regex::Regex;
use serde_json::{Map, Value, json};
use tracing::debug;

use crate::config::ReportConfig;

/// Reporter that streams per-suite result records into the results area.
pub const STREAM_REPORTER: &str = "scatter/json-stream.reporter.js";

/// Default human-readable console reporter.
pub const SPEC_REPORTER: &str = "scatter/simple-spec.reporter.js";

/// File name of the generated reporter configuration.
pub const REPORTER_CONFIG_FILE: &str = "multi-reporter-config.json";

/// The reporters enabled for this run: the record stream reporter plus
/// either the user's reporter or the default spec reporter.
pub fn enabled_reporters(report: &ReportConfig) -> Vec<String> {
    vec![
        STREAM_REPORTER.to_string(),
        report
            .reporter
            .clone()
            .unwrap_or_else(|| SPEC_REPORTER.to_string()),
    ]
}

/// Lodash-style camelCase over the alphanumeric runs of `input`.
fn camel_case(input: &str) -> String {
    let re = Regex::new(r"[A-Za-z0-9]+").unwrap();
    let mut out = String::new();

    for token in re.find_iter(input) {
        let token = token.as_str().to_lowercase();
        if out.is_empty() {
            out.push_str(&token);
        } else {
            let mut chars = token.chars();
            if let Some(first) = chars.next() {
                out.extend(first.to_uppercase());
                out.push_str(chars.as_str());
            }
        }
    }

    out
}

/// Name of a reporter's options object in the configuration file.
pub fn reporter_options_key(reporter: &str) -> String {
    format!("{}ReporterOptions", camel_case(reporter))
}

/// Builds the reporter configuration object for this run.
///
/// Each enabled reporter gets an options object pointing `reportDir` at
/// the shared results area. If the configuration names a user override
/// file, its content is merged in.
pub fn build(report: &ReportConfig, results_dir: &Path) -> Result<Value> {
    let mut enabled = enabled_reporters(report);
    let mut content = Map::new();

    for reporter in &enabled {
        content.insert(
            reporter_options_key(reporter),
            json!({ "reportDir": results_dir.to_string_lossy() }),
        );
    }

    if let Some(path) = &report.reporter_options_path
        && path.exists()
    {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read reporter options: {}", path.display()))?;
        let user: Value = serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse reporter options: {}", path.display()))?;

        if let Some(overrides) = user.as_object() {
            merge_overrides(&mut content, &mut enabled, overrides);
        }
    }

    content.insert(
        "reporterEnabled".to_string(),
        Value::String(enabled.join(", ")),
    );

    Ok(Value::Object(content))
}

fn merge_overrides(content: &mut Map<String, Value>, enabled: &mut Vec<String>, user: &Map<String, Value>) {
    for (key, value) in user {
        if key == "reporterEnabled" {
            let Some(list) = value.as_str() else { continue };
            for reporter in list.split(',').map(str::trim).filter(|r| !r.is_empty()) {
                if !enabled.iter().any(|r| r == reporter) {
                    enabled.push(reporter.to_string());
                }
            }
        } else if let (Some(existing), Some(incoming)) = (
            content.get_mut(key).and_then(Value::as_object_mut),
            value.as_object(),
        ) {
            // Shallow merge, user values win on conflicting keys.
            for (option, option_value) in incoming {
                existing.insert(option.clone(), option_value.clone());
            }
        } else {
            content.insert(key.clone(), value.clone());
        }
    }
}

/// Writes the reporter configuration for this run and returns nothing;
/// the caller decides the path and hands it to workers.
pub fn write(report: &ReportConfig, results_dir: &Path, out_path: &Path) -> Result<()> {
    let content = build(report, results_dir)?;
    std::fs::write(out_path, serde_json::to_string_pretty(&content)?).with_context(|| {
        format!(
            "Failed to write reporter configuration: {}",
            out_path.display()
        )
    })?;

    debug!("Reporter configuration written to {}", out_path.display());
    Ok(())
}
