//! Runner status table and capability-based selection.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use serde::Deserialize;
use tokio::time::Instant;

use crate::error::{Result, TaskwireError};
use crate::runner::{StatusKind, StatusRecord};

/// What an application requires of a runner. Empty fields match anything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RunnerFilter {
    /// Acceptable platforms. Empty = any.
    pub platforms: Vec<String>,
    /// Exact label, if set.
    pub label: Option<String>,
    /// At least one of these tags, if non-empty.
    pub tags: Vec<String>,
}

impl RunnerFilter {
    pub fn with_platform(mut self, platform: impl Into<String>) -> Self {
        self.platforms.push(platform.into());
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    pub fn matches(&self, record: &StatusRecord) -> bool {
        if !self.platforms.is_empty() && !self.platforms.iter().any(|p| *p == record.platform) {
            return false;
        }
        if let Some(label) = &self.label {
            if record.label.as_deref() != Some(label.as_str()) {
                return false;
            }
        }
        if !self.tags.is_empty() && !self.tags.iter().any(|t| record.tags.contains(t)) {
            return false;
        }
        true
    }
}

struct Entry {
    record: StatusRecord,
    last_seen: Instant,
}

impl Entry {
    fn is_alive(&self, staleness: Duration, now: Instant) -> bool {
        now.duration_since(self.last_seen) < staleness
    }
}

/// Newest status per runner, keyed by runner id.
pub struct StatusTable {
    entries: Mutex<HashMap<String, Entry>>,
    staleness: Duration,
}

impl StatusTable {
    pub fn new(staleness: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            staleness,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Entry>> {
        // The map is always left consistent, so a poisoned lock is still usable.
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Record a status report. `Stopping` forgets the runner.
    pub fn update(&self, record: StatusRecord) {
        let mut entries = self.lock();
        if record.status == StatusKind::Stopping {
            if entries.remove(&record.runner_id).is_some() {
                tracing::info!(runner_id = %record.runner_id, "Runner stopped");
            }
            return;
        }
        if !entries.contains_key(&record.runner_id) {
            tracing::info!(
                runner_id = %record.runner_id,
                endpoint = %record.endpoint,
                platform = %record.platform,
                slots = record.available_slots,
                "Runner registered"
            );
        }
        entries.insert(
            record.runner_id.clone(),
            Entry {
                record,
                last_seen: Instant::now(),
            },
        );
    }

    /// Forget runners that have not reported within the staleness window.
    pub fn evict_stale(&self) -> Vec<String> {
        let now = Instant::now();
        let mut evicted = Vec::new();
        self.lock().retain(|id, entry| {
            let alive = entry.is_alive(self.staleness, now);
            if !alive {
                evicted.push(id.clone());
            }
            alive
        });
        for id in &evicted {
            tracing::warn!(runner_id = %id, "Evicted stale runner");
        }
        evicted
    }

    /// Pick the best live runner matching `filter`.
    ///
    /// Most available slots wins, then the shortest queue, then the most
    /// recent report.
    pub fn select(&self, filter: &RunnerFilter) -> Result<StatusRecord> {
        let now = Instant::now();
        let entries = self.lock();
        entries
            .values()
            .filter(|e| e.is_alive(self.staleness, now))
            .filter(|e| filter.matches(&e.record))
            .max_by(|a, b| {
                a.record
                    .available_slots
                    .cmp(&b.record.available_slots)
                    .then_with(|| b.record.queue_length.cmp(&a.record.queue_length))
                    .then_with(|| a.last_seen.cmp(&b.last_seen))
            })
            .map(|e| e.record.clone())
            .ok_or_else(|| {
                TaskwireError::NoAvailableRunner(format!(
                    "no runner among {} matches {:?}",
                    entries.len(),
                    filter
                ))
            })
    }

    pub fn get(&self, runner_id: &str) -> Option<StatusRecord> {
        self.lock().get(runner_id).map(|e| e.record.clone())
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}
