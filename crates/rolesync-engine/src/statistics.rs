//! Run statistics.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::execute::ExecutionReport;
use crate::plan::ActionKind;

/// Counters and timings collected over one run.
#[derive(Debug, Clone, Serialize)]
pub struct RunStatistics {
    pub started_at: DateTime<Utc>,
    pub inspected_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub ldap_searches: usize,
    pub ldap_entries: usize,
    pub skipped_items: usize,
    pub wanted_roles: usize,
    pub wanted_grants: usize,
    pub privilege_queries: usize,
    /// Planned actions by kind.
    pub actions: BTreeMap<ActionKind, usize>,
    pub applied: usize,
    pub failed: usize,
}

impl Default for RunStatistics {
    fn default() -> Self {
        Self::start()
    }
}

impl RunStatistics {
    #[must_use]
    pub fn start() -> Self {
        Self {
            started_at: Utc::now(),
            inspected_at: None,
            finished_at: None,
            ldap_searches: 0,
            ldap_entries: 0,
            skipped_items: 0,
            wanted_roles: 0,
            wanted_grants: 0,
            privilege_queries: 0,
            actions: BTreeMap::new(),
            applied: 0,
            failed: 0,
        }
    }

    pub fn mark_inspected(&mut self) {
        self.inspected_at = Some(Utc::now());
    }

    /// Fold an execution report in and stop the clock.
    pub fn finish(&mut self, report: &ExecutionReport) {
        self.actions.clear();
        for outcome in &report.outcomes {
            *self.actions.entry(outcome.action.kind()).or_default() += 1;
        }
        self.applied = report.applied();
        self.failed = report.failed();
        self.finished_at = Some(Utc::now());
    }

    #[must_use]
    pub fn total_actions(&self) -> usize {
        self.actions.values().sum()
    }

    /// Wall time in milliseconds, once finished.
    #[must_use]
    pub fn elapsed_ms(&self) -> Option<i64> {
        self.finished_at
            .map(|end| (end - self.started_at).num_milliseconds())
    }
}
