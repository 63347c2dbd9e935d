//! Prometheus series fed from recorded builds.
//!
//! The recorder owns its own [`Registry`] instead of using the process-global
//! default, so several recorders can coexist in tests.

use log::debug;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder,
};

use crate::error::{FlowMetrixError, Result};
use crate::poller::JobState;
use crate::records::{millis_to_seconds, BuildRecord, StageStatus};

pub const DEFAULT_BUILD_BUCKETS: [f64; 8] =
    [30.0, 60.0, 120.0, 300.0, 600.0, 1200.0, 1800.0, 3600.0];
pub const DEFAULT_STAGE_BUCKETS: [f64; 8] = [5.0, 10.0, 30.0, 60.0, 120.0, 300.0, 600.0, 1200.0];

/// Histogram bucket boundaries, in seconds.
#[derive(Debug, Clone, PartialEq)]
pub struct Buckets {
    pub build: Vec<f64>,
    pub stage: Vec<f64>,
}

impl Buckets {
    /// Checks that both bucket lists are non-empty, finite and strictly increasing.
    ///
    /// # Errors
    ///
    /// Returns a `Config` error naming the offending list.
    pub fn validate(&self) -> Result<()> {
        for (name, list) in [("build", &self.build), ("stage", &self.stage)] {
            let increasing = list.windows(2).all(|w| w[0] < w[1]);
            if list.is_empty() || !increasing || list.iter().any(|b| !b.is_finite()) {
                return Err(FlowMetrixError::Config(format!(
                    "{name} duration buckets must be finite and strictly increasing"
                )));
            }
        }
        Ok(())
    }
}

impl Default for Buckets {
    fn default() -> Self {
        Self {
            build: DEFAULT_BUILD_BUCKETS.to_vec(),
            stage: DEFAULT_STAGE_BUCKETS.to_vec(),
        }
    }
}

pub struct MetricRecorder {
    registry: Registry,
    build_duration: HistogramVec,
    build_count: IntCounterVec,
    stage_duration: HistogramVec,
    stage_failures: IntCounterVec,
    last_processed: IntGaugeVec,
    poll_errors: IntCounterVec,
    job_state: IntGaugeVec,
}

impl MetricRecorder {
    /// Creates every series and registers it with a fresh registry.
    ///
    /// # Errors
    ///
    /// Returns an error if the bucket lists are invalid or a series definition
    /// is rejected by the registry.
    pub fn new(buckets: &Buckets) -> Result<Self> {
        buckets.validate()?;
        let registry = Registry::new();

        let build_duration = HistogramVec::new(
            HistogramOpts::new(
                "pipeline_build_duration_seconds",
                "Histogram of pipeline build durations in seconds",
            )
            .buckets(buckets.build.clone()),
            &["job", "status"],
        )?;

        let build_count = IntCounterVec::new(
            Opts::new("pipeline_build_count_total", "Total number of pipeline builds"),
            &["job", "status"],
        )?;

        let stage_duration = HistogramVec::new(
            HistogramOpts::new(
                "pipeline_stage_duration_seconds",
                "Histogram of pipeline stage durations in seconds",
            )
            .buckets(buckets.stage.clone()),
            &["job", "stage_name"],
        )?;

        let stage_failures = IntCounterVec::new(
            Opts::new(
                "pipeline_stage_failure_count_total",
                "Total number of failed pipeline stages",
            ),
            &["job", "stage_name"],
        )?;

        let last_processed = IntGaugeVec::new(
            Opts::new(
                "pipeline_last_processed_build_number",
                "The last build number processed by the exporter",
            ),
            &["job"],
        )?;

        let poll_errors = IntCounterVec::new(
            Opts::new(
                "pipeline_poll_errors_total",
                "Errors raised while polling the orchestrator",
            ),
            &["job", "kind"],
        )?;

        let job_state = IntGaugeVec::new(
            Opts::new(
                "pipeline_job_state",
                "Polling state per job (0=uninitialized, 1=polling, 2=backoff)",
            ),
            &["job"],
        )?;

        registry.register(Box::new(build_duration.clone()))?;
        registry.register(Box::new(build_count.clone()))?;
        registry.register(Box::new(stage_duration.clone()))?;
        registry.register(Box::new(stage_failures.clone()))?;
        registry.register(Box::new(last_processed.clone()))?;
        registry.register(Box::new(poll_errors.clone()))?;
        registry.register(Box::new(job_state.clone()))?;

        Ok(Self {
            registry,
            build_duration,
            build_count,
            stage_duration,
            stage_failures,
            last_processed,
            poll_errors,
            job_state,
        })
    }

    /// Applies one build to the exposed series.
    ///
    /// Performs no deduplication: calling this twice for the same build counts
    /// it twice. The poller calls it at most once per build number.
    pub fn record(&self, build: &BuildRecord) {
        let job = build.job_name.as_str();
        let status = build.overall_status.as_label();

        self.build_count.with_label_values(&[job, status]).inc();
        self.build_duration
            .with_label_values(&[job, status])
            .observe(millis_to_seconds(build.overall_duration_ms));

        for stage in build.stages.iter().filter(|s| s.status.is_terminal()) {
            let labels = [job, stage.name.as_str()];
            self.stage_duration
                .with_label_values(&labels)
                .observe(millis_to_seconds(stage.duration_ms));

            if stage.status == StageStatus::Failure {
                self.stage_failures.with_label_values(&labels).inc();
            }
        }

        debug!(
            "Recorded {} #{} ({status}) with {} stages",
            job,
            build.build_number,
            build.stages.len()
        );
    }

    #[allow(clippy::cast_possible_wrap)]
    pub fn set_last_processed(&self, job_name: &str, build_number: u64) {
        self.last_processed
            .with_label_values(&[job_name])
            .set(build_number as i64);
    }

    pub fn record_poll_error(&self, job_name: &str, kind: &str) {
        self.poll_errors.with_label_values(&[job_name, kind]).inc();
    }

    pub fn set_job_state(&self, job_name: &str, state: JobState) {
        self.job_state
            .with_label_values(&[job_name])
            .set(state.code());
    }

    #[cfg(test)]
    pub fn builds_counted(&self, job_name: &str, status: &str) -> u64 {
        self.build_count.with_label_values(&[job_name, status]).get()
    }

    #[cfg(test)]
    pub fn poll_errors(&self, job_name: &str, kind: &str) -> u64 {
        self.poll_errors.with_label_values(&[job_name, kind]).get()
    }

    #[cfg(test)]
    pub fn stage_observations(&self, job_name: &str, stage_name: &str) -> u64 {
        self.stage_duration
            .with_label_values(&[job_name, stage_name])
            .get_sample_count()
    }

    /// Renders every series in the Prometheus text exposition format.
    ///
    /// # Errors
    ///
    /// Returns an error if the encoder fails to write the snapshot.
    pub fn encode(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }
}
