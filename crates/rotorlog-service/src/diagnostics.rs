// Copyright (c) Walrus Foundation
// SPDX-License-Identifier: Apache-2.0

//! Keyed component status, aggregated and published at 1 Hz.

use std::{
    collections::BTreeMap,
    fmt,
    sync::{Arc, Mutex},
    time::Duration,
};

use serde::{Deserialize, Serialize};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::bus::MessageBus;

const PUBLISH_INTERVAL: Duration = Duration::from_secs(1);

/// Severity of a reported status; the aggregate takes the maximum over all components.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusLevel {
    /// The component is healthy.
    Ok,
    /// The component works but needs attention.
    Warn,
    /// The component is failing.
    Error,
}

/// A single component's entry in the status report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyValue {
    /// Component key.
    pub key: String,
    /// Human-readable component status.
    pub value: String,
}

/// The aggregated status message published on the diagnostics topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusReport {
    /// Name of the reporting node.
    pub name: String,
    /// Aggregate level: the maximum over all component levels.
    pub level: StatusLevel,
    /// Aggregate message: the failing component, an error count, or "no problems".
    pub message: String,
    /// Per-component statuses, ordered by key.
    pub values: Vec<KeyValue>,
}

#[derive(Debug, Clone)]
struct Diagnostic {
    level: StatusLevel,
    value: String,
}

/// Cheap-to-clone handle through which components report their status.
#[derive(Debug, Clone, Default)]
pub struct DiagnosticsHandle {
    diagnostics: Arc<Mutex<BTreeMap<String, Diagnostic>>>,
}

impl DiagnosticsHandle {
    fn set(&self, key: &str, level: StatusLevel, value: String) {
        let mut diagnostics = self.diagnostics.lock().expect("lock is not poisoned");
        diagnostics.insert(key.to_owned(), Diagnostic { level, value });
    }

    /// Marks `key` as healthy.
    pub fn report_success(&self, key: &str, value: impl fmt::Display) {
        self.set(key, StatusLevel::Ok, value.to_string());
    }

    /// Marks `key` as failing.
    pub fn report_error(&self, key: &str, value: impl fmt::Display) {
        self.set(key, StatusLevel::Error, value.to_string());
    }

    /// Flattens the current component map into a publishable report.
    ///
    /// The map is keyed by a `BTreeMap`, so the emitted order is deterministic.
    pub fn build_report(&self, name: &str) -> StatusReport {
        let diagnostics = self.diagnostics.lock().expect("lock is not poisoned");
        let mut level = StatusLevel::Ok;
        let mut failing: Option<String> = None;
        let mut error_count = 0usize;
        let mut values = Vec::with_capacity(diagnostics.len());
        for (key, diagnostic) in diagnostics.iter() {
            values.push(KeyValue {
                key: key.clone(),
                value: diagnostic.value.clone(),
            });
            if diagnostic.level > StatusLevel::Ok {
                error_count += 1;
                failing = Some(format!("{key}: {}", diagnostic.value));
            }
            level = level.max(diagnostic.level);
        }
        let message = match error_count {
            0 => "no problems".to_owned(),
            1 => failing.expect("a failing component was recorded"),
            _ => format!("{error_count} errors"),
        };
        StatusReport {
            name: name.to_owned(),
            level,
            message,
            values,
        }
    }
}

/// Periodically publishes the aggregated status on the message bus.
#[derive(Debug)]
pub struct DiagnosticsMonitor {
    name: String,
    handle: DiagnosticsHandle,
    bus: Arc<dyn MessageBus>,
}

impl DiagnosticsMonitor {
    /// Creates a monitor publishing under the node name `name`.
    pub fn new(name: String, handle: DiagnosticsHandle, bus: Arc<dyn MessageBus>) -> Self {
        Self { name, handle, bus }
    }

    /// Publishes the aggregate once a second until cancelled. Publish failures are logged but
    /// do not stop the monitor.
    pub async fn run(self, cancel: CancellationToken) -> anyhow::Result<()> {
        let mut ticker = tokio::time::interval(PUBLISH_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = ticker.tick() => {
                    let report = self.handle.build_report(&self.name);
                    if let Err(error) = self.bus.publish_status(&report).await {
                        tracing::warn!(%error, "failed to publish diagnostics");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_handle_reports_no_problems() {
        let handle = DiagnosticsHandle::default();
        let report = handle.build_report("rotorlog");
        assert_eq!(report.level, StatusLevel::Ok);
        assert_eq!(report.message, "no problems");
        assert!(report.values.is_empty());
    }

    #[test]
    fn single_failure_names_the_component() {
        let handle = DiagnosticsHandle::default();
        handle.report_success("recorder", "running");
        handle.report_error("bag uploader", "failing: connection refused");

        let report = handle.build_report("rotorlog");
        assert_eq!(report.level, StatusLevel::Error);
        assert_eq!(report.message, "bag uploader: failing: connection refused");
    }

    #[test]
    fn multiple_failures_are_counted() {
        let handle = DiagnosticsHandle::default();
        handle.report_error("recorder", "failed: exit status 1");
        handle.report_error("config", "failed to parse");

        let report = handle.build_report("rotorlog");
        assert_eq!(report.level, StatusLevel::Error);
        assert_eq!(report.message, "2 errors");
    }

    #[test]
    fn reports_are_ordered_and_reflect_the_latest_value() {
        let handle = DiagnosticsHandle::default();
        handle.report_error("recorder", "failed: exit status 1");
        handle.report_success("config", "applied");
        handle.report_success("recorder", "running");

        let report = handle.build_report("rotorlog");
        assert_eq!(report.level, StatusLevel::Ok);
        assert_eq!(report.message, "no problems");
        let keys: Vec<&str> = report.values.iter().map(|kv| kv.key.as_str()).collect();
        assert_eq!(keys, ["config", "recorder"]);
        assert_eq!(report.values[1].value, "running");
    }
}
