//! Progress reporting.
//!
//! Spec.md §6 describes `ProgressReporter` (`notify`, `format`, `update`,
//! `set_total`) as a consumed interface — the CLI/display surface proper is
//! out of scope. [`LoggingProgressReporter`] is the default implementation
//! this crate ships, narrating through the `log` crate exactly as the
//! teacher narrates mount/unmount events (`src/sys.rs`, `src/session.rs`).

use std::collections::HashMap;
use std::sync::Mutex;

use log::info;

/// Progress narration consumed by the Scanner and DedupPipeline.
pub trait ProgressReporter {
    /// Emits a one-off human-readable message.
    fn notify(&self, msg: &str);

    /// Sets (or clears, with `None`) the in-progress display template.
    /// Ignored by reporters that don't render a template, such as the
    /// logging default.
    fn format(&self, template: Option<&str>);

    /// Updates one or more named progress fields.
    fn update(&self, fields: &[(&str, String)]);

    /// Declares the total expected count for a named counter.
    fn set_total(&self, key: &str, total: u64);
}

/// Adapts the spec's notify/format/update/set_total vocabulary onto `log`
/// macros plus an in-memory counter table, so progress is visible through
/// whatever logging sink the embedding binary configures.
#[derive(Debug, Default)]
pub struct LoggingProgressReporter {
    totals: Mutex<HashMap<String, u64>>,
}

impl LoggingProgressReporter {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ProgressReporter for LoggingProgressReporter {
    fn notify(&self, msg: &str) {
        info!("{msg}");
    }

    fn format(&self, _template: Option<&str>) {
        // No terminal widget to configure; narration always goes through
        // `notify`/`update`.
    }

    fn update(&self, fields: &[(&str, String)]) {
        if log::log_enabled!(log::Level::Debug) {
            let rendered: Vec<String> =
                fields.iter().map(|(k, v)| format!("{k}={v}")).collect();
            log::debug!("{}", rendered.join(" "));
        }
    }

    fn set_total(&self, key: &str, total: u64) {
        self.totals.lock().unwrap().insert(key.to_string(), total);
    }
}

/// A `ProgressReporter` that does nothing, for tests and for callers who
/// genuinely want silence.
#[derive(Debug, Default)]
pub struct NullProgressReporter;

impl ProgressReporter for NullProgressReporter {
    fn notify(&self, _msg: &str) {}
    fn format(&self, _template: Option<&str>) {}
    fn update(&self, _fields: &[(&str, String)]) {}
    fn set_total(&self, _key: &str, _total: u64) {}
}
