//! Per-job cursors deciding which builds still need recording.

use std::collections::{BTreeMap, BTreeSet};

use log::{debug, info};

/// Progress marker for one monitored job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobCursor {
    pub job_name: String,
    /// Highest build number recorded so far; never decreases
    pub last_processed_build: u64,
    /// Builds that were offered but could not be recorded yet
    pub deferred: BTreeSet<u64>,
}

impl JobCursor {
    fn new(job_name: &str, last_processed_build: u64) -> Self {
        Self {
            job_name: job_name.to_string(),
            last_processed_build,
            deferred: BTreeSet::new(),
        }
    }

    fn wants(&self, build_number: u64) -> bool {
        build_number > self.last_processed_build || self.deferred.contains(&build_number)
    }
}

/// In-memory owner of every job cursor.
///
/// Cursors are never persisted. After a restart each job is checkpointed
/// again at whatever the orchestrator reports as its latest build.
#[derive(Debug, Default)]
pub struct BuildTracker {
    cursors: BTreeMap<String, JobCursor>,
}

impl BuildTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_initialized(&self, job_name: &str) -> bool {
        self.cursors.contains_key(job_name)
    }

    #[cfg(test)]
    pub fn cursor(&self, job_name: &str) -> Option<&JobCursor> {
        self.cursors.get(job_name)
    }

    pub fn last_processed(&self, job_name: &str) -> Option<u64> {
        self.cursors.get(job_name).map(|c| c.last_processed_build)
    }

    /// Checkpoints a job the first time it is seen.
    ///
    /// Builds up to and including `upstream_latest` are treated as already
    /// processed. Returns `false` when the job already had a cursor, in which
    /// case nothing changes.
    pub fn initialize(&mut self, job_name: &str, upstream_latest: u64) -> bool {
        if self.cursors.contains_key(job_name) {
            return false;
        }

        info!("Initial state for '{job_name}': last processed build is {upstream_latest}");
        self.cursors
            .insert(job_name.to_string(), JobCursor::new(job_name, upstream_latest));
        true
    }

    /// Returns the candidates that still need recording, oldest first.
    ///
    /// A candidate qualifies when it is above the cursor or was deferred in an
    /// earlier cycle. Missing numbers in `candidates` are simply skipped. An
    /// uninitialized job yields nothing.
    pub fn builds_to_process(&self, job_name: &str, candidates: &[u64]) -> Vec<u64> {
        let Some(cursor) = self.cursors.get(job_name) else {
            return Vec::new();
        };

        candidates
            .iter()
            .copied()
            .filter(|&n| cursor.wants(n))
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Marks `build_number` as recorded. Idempotent; the cursor only moves up.
    pub fn advance(&mut self, job_name: &str, build_number: u64) {
        let cursor = self
            .cursors
            .entry(job_name.to_string())
            .or_insert_with(|| JobCursor::new(job_name, build_number));

        cursor.deferred.remove(&build_number);
        cursor.last_processed_build = cursor.last_processed_build.max(build_number);
    }

    /// Keeps `build_number` on offer for the next cycle.
    ///
    /// Builds at or below the cursor that were never deferred are already
    /// recorded and are ignored.
    pub fn defer(&mut self, job_name: &str, build_number: u64) {
        if let Some(cursor) = self.cursors.get_mut(job_name) {
            if build_number > cursor.last_processed_build {
                cursor.deferred.insert(build_number);
            }
        }
    }

    /// Forgets deferred builds the orchestrator no longer lists.
    ///
    /// Upstream retention or manual deletion removes builds; once gone they
    /// are a gap like any other. An empty listing prunes nothing.
    pub fn retain_listed(&mut self, job_name: &str, listed: &[u64]) {
        if listed.is_empty() {
            return;
        }
        let Some(cursor) = self.cursors.get_mut(job_name) else {
            return;
        };

        let listed: BTreeSet<u64> = listed.iter().copied().collect();
        let before = cursor.deferred.len();
        cursor.deferred.retain(|n| listed.contains(n));

        let dropped = before - cursor.deferred.len();
        if dropped > 0 {
            debug!(
                "Dropped {dropped} deferred builds no longer listed for '{}'",
                cursor.job_name
            );
        }
    }
}
