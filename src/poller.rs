//! The polling cycle tying client, tracker, extractor and recorder together.
//!
//! A cycle walks every monitored job once. Within a job, builds are handled
//! one at a time in ascending order and a build's cursor only moves after its
//! metrics are recorded. Recording and advancing share no await point, so a
//! shutdown can only take effect between builds.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, error, info, warn};
use tokio::sync::watch;
use tokio::time::{Interval, MissedTickBehavior};

use crate::error::{FlowMetrixError, Result};
use crate::extractor;
use crate::orchestrator::{BuildList, Orchestrator};
use crate::recorder::MetricRecorder;
use crate::records::BuildRecord;
use crate::tracker::BuildTracker;

/// Polling state of a single job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    /// No successful build listing yet, so no cursor exists
    Uninitialized,
    Polling,
    /// The last build listing failed; retried on the next tick
    Backoff,
}

impl JobState {
    /// Numeric value exposed on the job state gauge.
    pub fn code(self) -> i64 {
        match self {
            Self::Uninitialized => 0,
            Self::Polling => 1,
            Self::Backoff => 2,
        }
    }
}

/// Source of polling ticks.
#[async_trait]
pub trait Ticker: Send {
    /// Waits until the next cycle is due.
    async fn tick(&mut self);
}

/// Fixed-period ticker; the first tick fires immediately.
pub struct IntervalTicker {
    interval: Interval,
}

impl IntervalTicker {
    pub fn new(period: Duration) -> Self {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self { interval }
    }
}

#[async_trait]
impl Ticker for IntervalTicker {
    async fn tick(&mut self) {
        self.interval.tick().await;
    }
}

/// Outcome counts of one polling cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub recorded: usize,
    pub deferred: usize,
    pub failed: usize,
    pub jobs_in_backoff: usize,
    /// Shutdown was requested before the cycle finished
    pub interrupted: bool,
}

pub struct Poller<O> {
    orchestrator: O,
    tracker: BuildTracker,
    recorder: Arc<MetricRecorder>,
    jobs: Vec<String>,
    states: HashMap<String, JobState>,
    shutdown: watch::Receiver<bool>,
}

impl<O: Orchestrator> Poller<O> {
    pub fn new(
        orchestrator: O,
        recorder: Arc<MetricRecorder>,
        jobs: Vec<String>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let states = jobs
            .iter()
            .map(|job| {
                recorder.set_job_state(job, JobState::Uninitialized);
                (job.clone(), JobState::Uninitialized)
            })
            .collect();

        Self {
            orchestrator,
            tracker: BuildTracker::new(),
            recorder,
            jobs,
            states,
            shutdown,
        }
    }

    #[cfg(test)]
    pub fn job_state(&self, job_name: &str) -> JobState {
        self.states
            .get(job_name)
            .copied()
            .unwrap_or(JobState::Uninitialized)
    }

    #[cfg(test)]
    pub fn tracker(&self) -> &BuildTracker {
        &self.tracker
    }

    fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    fn set_state(&mut self, job_name: &str, state: JobState) {
        let previous = self.states.insert(job_name.to_string(), state);
        if previous != Some(state) {
            debug!("Job '{job_name}' is now {state:?}");
            self.recorder.set_job_state(job_name, state);
        }
    }

    /// Drives cycles from `ticker` until shutdown is signalled.
    pub async fn run<T: Ticker>(&mut self, mut ticker: T) {
        info!("Starting main collection loop for {} jobs", self.jobs.len());

        loop {
            tokio::select! {
                () = ticker.tick() => {}
                changed = self.shutdown.changed() => {
                    if changed.is_err() {
                        warn!("Shutdown channel closed, stopping polling loop");
                        break;
                    }
                }
            }

            if self.is_shutting_down() {
                break;
            }

            let report = self.tick().await;
            info!(
                "Collection cycle complete: {} recorded, {} deferred, {} failed, {} jobs in backoff",
                report.recorded, report.deferred, report.failed, report.jobs_in_backoff
            );

            if report.interrupted {
                break;
            }
        }

        info!("Polling loop stopped");
    }

    /// Runs one polling cycle over every monitored job.
    pub async fn tick(&mut self) -> CycleReport {
        let mut report = CycleReport::default();

        for index in 0..self.jobs.len() {
            if self.is_shutting_down() {
                report.interrupted = true;
                break;
            }

            let job = self.jobs[index].clone();
            self.poll_job(&job, &mut report).await;

            if report.interrupted {
                break;
            }
        }

        report
    }

    async fn poll_job(&mut self, job: &str, report: &mut CycleReport) {
        let list = match self.orchestrator.list_builds(job).await {
            Ok(list) => list,
            Err(e) => {
                self.on_listing_failure(job, &e, report);
                return;
            }
        };

        if self.tracker.initialize(job, list.latest_build_number) {
            self.recorder.set_last_processed(job, list.latest_build_number);
        }
        self.set_state(job, JobState::Polling);

        let listed = list.build_numbers();
        self.tracker.retain_listed(job, &listed);
        let pending = self.tracker.builds_to_process(job, &listed);

        if pending.is_empty() {
            debug!(
                "No new completed builds for '{job}'. Last processed: {}",
                self.tracker.last_processed(job).unwrap_or_default()
            );
            return;
        }

        info!(
            "Found {} builds to process for '{job}': {pending:?}",
            pending.len()
        );

        for build_number in pending {
            if self.is_shutting_down() {
                report.interrupted = true;
                return;
            }
            self.process_build(job, build_number, &list, report).await;
        }
    }

    async fn process_build(
        &mut self,
        job: &str,
        build_number: u64,
        list: &BuildList,
        report: &mut CycleReport,
    ) {
        if list.is_in_progress(build_number) {
            debug!("{job} #{build_number} is still running, deferring");
            self.tracker.defer(job, build_number);
            report.deferred += 1;
            return;
        }

        match self.fetch_build(job, build_number).await {
            Ok(record) => {
                self.recorder.record(&record);
                self.tracker.advance(job, build_number);
                if let Some(last) = self.tracker.last_processed(job) {
                    self.recorder.set_last_processed(job, last);
                }
                report.recorded += 1;
                info!(
                    "Successfully processed {job} #{build_number} ({})",
                    record.overall_status
                );
            }
            Err(e) if e.is_deferral() => {
                debug!("{e}; retrying next cycle");
                self.tracker.defer(job, build_number);
                report.deferred += 1;
            }
            Err(e) => {
                if e.is_job_level() {
                    error!("Failed to process build {job} #{build_number}: {e}");
                } else {
                    warn!("Failed to process build {job} #{build_number}: {e}");
                }
                self.recorder.record_poll_error(job, e.kind());
                self.tracker.defer(job, build_number);
                report.failed += 1;
            }
        }
    }

    async fn fetch_build(&self, job: &str, build_number: u64) -> Result<BuildRecord> {
        let document = self
            .orchestrator
            .fetch_stage_breakdown(job, build_number)
            .await?;
        extractor::parse_build(job, build_number, &document)
    }

    fn on_listing_failure(&mut self, job: &str, e: &FlowMetrixError, report: &mut CycleReport) {
        self.recorder.record_poll_error(job, e.kind());

        if !self.tracker.is_initialized(job) {
            error!("Could not initialize '{job}': {e}");
            self.set_state(job, JobState::Uninitialized);
            return;
        }

        error!("Failed to list builds for '{job}', backing off: {e}");
        self.set_state(job, JobState::Backoff);
        report.jobs_in_backoff += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::BuildSummary;
    use crate::recorder::Buckets;
    use serde_json::{json, Value};
    use std::collections::VecDeque;
    use std::sync::Mutex;

    #[derive(Clone)]
    enum FakeList {
        Builds(BuildList),
        Unavailable,
        NotFound,
    }

    #[derive(Clone)]
    enum FakeDoc {
        Ready(Value),
        Running,
        Malformed,
        Missing,
        Unavailable,
    }

    /// In-memory orchestrator with scripted responses.
    #[derive(Default)]
    struct FakeOrchestrator {
        lists: Mutex<HashMap<String, VecDeque<FakeList>>>,
        docs: Mutex<HashMap<(String, u64), VecDeque<FakeDoc>>>,
        fetches: Mutex<Vec<(String, u64)>>,
        listings: Mutex<usize>,
        shutdown_after: Mutex<Option<(u64, Arc<watch::Sender<bool>>)>>,
    }

    /// Pops the next scripted response, repeating the last one forever.
    fn next<T: Clone>(queue: &mut VecDeque<T>) -> Option<T> {
        if queue.len() > 1 {
            queue.pop_front()
        } else {
            queue.front().cloned()
        }
    }

    impl FakeOrchestrator {
        fn script_list(&self, job: &str, responses: Vec<FakeList>) {
            self.lists
                .lock()
                .unwrap()
                .insert(job.to_string(), responses.into());
        }

        fn script_doc(&self, job: &str, build: u64, responses: Vec<FakeDoc>) {
            self.docs
                .lock()
                .unwrap()
                .insert((job.to_string(), build), responses.into());
        }

        fn fetched(&self) -> Vec<u64> {
            self.fetches.lock().unwrap().iter().map(|(_, n)| *n).collect()
        }

        fn listings(&self) -> usize {
            *self.listings.lock().unwrap()
        }
    }

    #[async_trait]
    impl Orchestrator for FakeOrchestrator {
        async fn list_builds(&self, job_name: &str) -> Result<BuildList> {
            *self.listings.lock().unwrap() += 1;
            let response = self
                .lists
                .lock()
                .unwrap()
                .get_mut(job_name)
                .and_then(next)
                .unwrap_or(FakeList::NotFound);

            match response {
                FakeList::Builds(list) => Ok(list),
                FakeList::Unavailable => Err(FlowMetrixError::UpstreamUnavailable(
                    "connection refused".to_string(),
                )),
                FakeList::NotFound => Err(FlowMetrixError::JobNotFound(job_name.to_string())),
            }
        }

        async fn fetch_stage_breakdown(&self, job_name: &str, build_number: u64) -> Result<Value> {
            self.fetches
                .lock()
                .unwrap()
                .push((job_name.to_string(), build_number));

            if let Some((trigger, tx)) = self.shutdown_after.lock().unwrap().as_ref() {
                if *trigger == build_number {
                    let _ = tx.send(true);
                }
            }

            let response = self
                .docs
                .lock()
                .unwrap()
                .get_mut(&(job_name.to_string(), build_number))
                .and_then(next);

            match response {
                Some(FakeDoc::Ready(doc)) => Ok(doc),
                Some(FakeDoc::Running) => Err(FlowMetrixError::BuildNotFinished {
                    job: job_name.to_string(),
                    build: build_number,
                }),
                Some(FakeDoc::Malformed) => Ok(json!({"stages": "garbage"})),
                Some(FakeDoc::Unavailable) => Err(FlowMetrixError::UpstreamUnavailable(
                    "read timed out".to_string(),
                )),
                Some(FakeDoc::Missing) | None => Err(FlowMetrixError::BuildNotFound {
                    job: job_name.to_string(),
                    build: build_number,
                }),
            }
        }
    }

    fn builds(latest: u64, numbers: &[u64]) -> FakeList {
        FakeList::Builds(BuildList {
            latest_build_number: latest,
            builds: numbers
                .iter()
                .map(|&number| BuildSummary {
                    number,
                    in_progress: false,
                })
                .collect(),
        })
    }

    fn success_doc() -> FakeDoc {
        FakeDoc::Ready(json!({
            "status": "SUCCESS",
            "durationMillis": 60000,
            "stages": [
                {"name": "Build", "status": "SUCCESS", "durationMillis": 20000},
                {"name": "Test", "status": "SUCCESS", "durationMillis": 40000}
            ]
        }))
    }

    struct Harness {
        fake: Arc<FakeOrchestrator>,
        recorder: Arc<MetricRecorder>,
        poller: Poller<Arc<FakeOrchestrator>>,
        shutdown_tx: Arc<watch::Sender<bool>>,
    }

    fn harness(jobs: &[&str]) -> Harness {
        let fake = Arc::new(FakeOrchestrator::default());
        let recorder = Arc::new(MetricRecorder::new(&Buckets::default()).unwrap());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let poller = Poller::new(
            Arc::clone(&fake),
            Arc::clone(&recorder),
            jobs.iter().map(ToString::to_string).collect(),
            shutdown_rx,
        );

        Harness {
            fake,
            recorder,
            poller,
            shutdown_tx: Arc::new(shutdown_tx),
        }
    }

    #[tokio::test]
    async fn test_first_run_checkpoints_without_backfill() {
        let mut h = harness(&["app"]);
        h.fake.script_list("app", vec![builds(42, &[42, 41, 40])]);

        let report = h.poller.tick().await;

        assert_eq!(report.recorded, 0);
        assert!(h.fake.fetched().is_empty());
        assert_eq!(h.poller.tracker().last_processed("app"), Some(42));
        assert_eq!(h.poller.job_state("app"), JobState::Polling);
    }

    #[tokio::test]
    async fn test_only_builds_after_checkpoint_are_processed() {
        let mut h = harness(&["app"]);
        h.fake.script_list(
            "app",
            vec![builds(42, &[42, 41]), builds(43, &[43, 42, 41])],
        );
        h.fake.script_doc("app", 43, vec![success_doc()]);

        h.poller.tick().await;
        let report = h.poller.tick().await;

        assert_eq!(report.recorded, 1);
        assert_eq!(h.fake.fetched(), vec![43]);
        assert_eq!(h.recorder.builds_counted("app", "SUCCESS"), 1);
        assert_eq!(h.recorder.stage_observations("app", "Test"), 1);
    }

    #[tokio::test]
    async fn test_builds_recorded_in_chronological_order() {
        let mut h = harness(&["app"]);
        h.fake
            .script_list("app", vec![builds(4, &[4]), builds(7, &[7, 6, 5, 4])]);
        for n in 5..=7 {
            h.fake.script_doc("app", n, vec![success_doc()]);
        }

        h.poller.tick().await;
        h.poller.tick().await;

        assert_eq!(h.fake.fetched(), vec![5, 6, 7]);
        assert_eq!(h.poller.tracker().last_processed("app"), Some(7));
    }

    #[tokio::test]
    async fn test_repeated_cycle_is_idempotent() {
        let mut h = harness(&["app"]);
        h.fake
            .script_list("app", vec![builds(4, &[4]), builds(6, &[6, 5, 4])]);
        h.fake.script_doc("app", 5, vec![success_doc()]);
        h.fake.script_doc("app", 6, vec![success_doc()]);

        h.poller.tick().await;
        h.poller.tick().await;
        let before = h.recorder.encode().unwrap();

        let report = h.poller.tick().await;

        assert_eq!(report, CycleReport::default());
        assert_eq!(h.recorder.builds_counted("app", "SUCCESS"), 2);
        assert_eq!(h.recorder.encode().unwrap(), before);
    }

    #[tokio::test]
    async fn test_failed_build_retried_without_rerecording_earlier_ones() {
        let mut h = harness(&["app"]);
        h.fake
            .script_list("app", vec![builds(4, &[4]), builds(6, &[6, 5, 4])]);
        h.fake.script_doc("app", 5, vec![success_doc()]);
        h.fake
            .script_doc("app", 6, vec![FakeDoc::Malformed, success_doc()]);

        h.poller.tick().await;
        let first = h.poller.tick().await;
        assert_eq!(first.recorded, 1);
        assert_eq!(first.failed, 1);
        assert_eq!(h.poller.tracker().last_processed("app"), Some(5));

        let retry = h.poller.tick().await;
        assert_eq!(retry.recorded, 1);
        assert_eq!(h.fake.fetched(), vec![5, 6, 6]);
        assert_eq!(h.recorder.builds_counted("app", "SUCCESS"), 2);
        assert_eq!(h.poller.tracker().last_processed("app"), Some(6));
    }

    #[tokio::test]
    async fn test_failure_does_not_block_later_builds() {
        let mut h = harness(&["app"]);
        h.fake
            .script_list("app", vec![builds(4, &[4]), builds(7, &[7, 6, 5, 4])]);
        h.fake.script_doc("app", 5, vec![success_doc()]);
        h.fake
            .script_doc("app", 6, vec![FakeDoc::Malformed, success_doc()]);
        h.fake.script_doc("app", 7, vec![success_doc()]);

        h.poller.tick().await;
        let report = h.poller.tick().await;
        assert_eq!((report.recorded, report.failed), (2, 1));
        assert_eq!(h.poller.tracker().last_processed("app"), Some(7));

        let retry = h.poller.tick().await;
        assert_eq!(retry.recorded, 1);
        assert_eq!(h.fake.fetched(), vec![5, 6, 7, 6]);
        assert_eq!(h.recorder.builds_counted("app", "SUCCESS"), 3);
    }

    #[tokio::test]
    async fn test_fetch_failures_are_counted_and_retried() {
        let mut h = harness(&["app"]);
        h.fake
            .script_list("app", vec![builds(4, &[4]), builds(7, &[7, 6, 5, 4])]);
        h.fake
            .script_doc("app", 5, vec![FakeDoc::Unavailable, success_doc()]);
        h.fake
            .script_doc("app", 6, vec![FakeDoc::Missing, success_doc()]);
        h.fake.script_doc("app", 7, vec![success_doc()]);

        h.poller.tick().await;
        let report = h.poller.tick().await;
        assert_eq!((report.recorded, report.failed), (1, 2));
        assert_eq!(h.recorder.poll_errors("app", "upstream_unavailable"), 1);
        assert_eq!(h.recorder.poll_errors("app", "build_not_found"), 1);
        assert_eq!(h.poller.job_state("app"), JobState::Polling);

        let retry = h.poller.tick().await;
        assert_eq!((retry.recorded, retry.failed), (2, 0));
        assert_eq!(h.fake.fetched(), vec![5, 6, 7, 5, 6]);
        assert_eq!(h.recorder.builds_counted("app", "SUCCESS"), 3);
        assert_eq!(h.poller.tracker().last_processed("app"), Some(7));
    }

    #[tokio::test]
    async fn test_finished_not_executed_build_is_recorded_as_unknown() {
        let mut h = harness(&["app"]);
        h.fake
            .script_list("app", vec![builds(4, &[4]), builds(5, &[5, 4])]);
        h.fake.script_doc(
            "app",
            5,
            vec![FakeDoc::Ready(json!({
                "status": "NOT_EXECUTED",
                "durationMillis": 0,
                "stages": []
            }))],
        );

        h.poller.tick().await;
        let report = h.poller.tick().await;
        assert_eq!((report.recorded, report.deferred), (1, 0));
        assert_eq!(h.recorder.builds_counted("app", "UNKNOWN"), 1);

        let again = h.poller.tick().await;
        assert_eq!(again.recorded, 0);
        assert_eq!(h.fake.fetched(), vec![5]);
    }

    #[tokio::test]
    async fn test_running_builds_are_deferred() {
        let mut h = harness(&["app"]);
        let mut running = match builds(5, &[7, 6, 5]) {
            FakeList::Builds(list) => list,
            _ => unreachable!(),
        };
        running.builds[0].in_progress = true;
        h.fake.script_list(
            "app",
            vec![
                builds(5, &[5]),
                FakeList::Builds(running),
                builds(7, &[7, 6, 5]),
            ],
        );
        h.fake
            .script_doc("app", 6, vec![FakeDoc::Running, success_doc()]);
        h.fake.script_doc("app", 7, vec![success_doc()]);

        h.poller.tick().await;
        let report = h.poller.tick().await;
        assert_eq!(report.deferred, 2);
        assert_eq!(report.recorded, 0);
        // build 7 was reported running, so only 6 was fetched
        assert_eq!(h.fake.fetched(), vec![6]);

        let report = h.poller.tick().await;
        assert_eq!(report.recorded, 2);
        assert_eq!(h.fake.fetched(), vec![6, 6, 7]);
    }

    #[tokio::test]
    async fn test_unknown_job_stays_uninitialized() {
        let mut h = harness(&["ghost", "app"]);
        h.fake.script_list("ghost", vec![FakeList::NotFound]);
        h.fake.script_list("app", vec![builds(1, &[1])]);

        h.poller.tick().await;
        h.poller.tick().await;

        assert_eq!(h.poller.job_state("ghost"), JobState::Uninitialized);
        assert!(!h.poller.tracker().is_initialized("ghost"));
        assert_eq!(h.poller.job_state("app"), JobState::Polling);
        assert_eq!(h.fake.listings(), 4);
    }

    #[tokio::test]
    async fn test_upstream_outage_enters_backoff_and_recovers() {
        let mut h = harness(&["app"]);
        h.fake.script_list(
            "app",
            vec![
                builds(3, &[3]),
                FakeList::Unavailable,
                builds(4, &[4, 3]),
            ],
        );
        h.fake.script_doc("app", 4, vec![success_doc()]);

        h.poller.tick().await;
        let report = h.poller.tick().await;
        assert_eq!(report.jobs_in_backoff, 1);
        assert_eq!(h.poller.job_state("app"), JobState::Backoff);
        assert_eq!(h.poller.tracker().last_processed("app"), Some(3));

        let report = h.poller.tick().await;
        assert_eq!(report.recorded, 1);
        assert_eq!(h.poller.job_state("app"), JobState::Polling);
    }

    #[tokio::test]
    async fn test_cursor_never_decreases() {
        let mut h = harness(&["app"]);
        h.fake.script_list(
            "app",
            vec![builds(10, &[10]), builds(8, &[8, 7]), builds(10, &[10, 9])],
        );

        let mut last = 0;
        for _ in 0..3 {
            h.poller.tick().await;
            let current = h.poller.tracker().last_processed("app").unwrap();
            assert!(current >= last);
            last = current;
        }
        assert!(h.fake.fetched().is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_stops_between_builds() {
        let mut h = harness(&["app"]);
        h.fake
            .script_list("app", vec![builds(4, &[4]), builds(7, &[7, 6, 5, 4])]);
        for n in 5..=7 {
            h.fake.script_doc("app", n, vec![success_doc()]);
        }

        h.poller.tick().await;
        *h.fake.shutdown_after.lock().unwrap() = Some((5, Arc::clone(&h.shutdown_tx)));
        let report = h.poller.tick().await;

        // build 5 was mid-flight when shutdown arrived and still completes
        assert!(report.interrupted);
        assert_eq!(report.recorded, 1);
        assert_eq!(h.fake.fetched(), vec![5]);
        assert_eq!(h.poller.tracker().last_processed("app"), Some(5));
    }

    struct CountingTicker {
        ticks: usize,
        limit: usize,
        shutdown: Arc<watch::Sender<bool>>,
    }

    #[async_trait]
    impl Ticker for CountingTicker {
        async fn tick(&mut self) {
            self.ticks += 1;
            if self.ticks > self.limit {
                let _ = self.shutdown.send(true);
            }
        }
    }

    #[tokio::test]
    async fn test_run_ticks_until_shutdown() {
        let mut h = harness(&["app"]);
        h.fake.script_list("app", vec![builds(1, &[1])]);

        let ticker = CountingTicker {
            ticks: 0,
            limit: 3,
            shutdown: Arc::clone(&h.shutdown_tx),
        };
        h.poller.run(ticker).await;

        assert_eq!(h.fake.listings(), 3);
    }

    #[tokio::test]
    async fn test_run_returns_immediately_when_already_shut_down() {
        let mut h = harness(&["app"]);
        h.shutdown_tx.send(true).unwrap();

        let ticker = CountingTicker {
            ticks: 0,
            limit: 100,
            shutdown: Arc::clone(&h.shutdown_tx),
        };
        h.poller.run(ticker).await;

        assert_eq!(h.fake.listings(), 0);
    }

    #[test]
    fn test_job_state_codes() {
        assert_eq!(JobState::Uninitialized.code(), 0);
        assert_eq!(JobState::Polling.code(), 1);
        assert_eq!(JobState::Backoff.code(), 2);
    }
}
