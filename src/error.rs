use thiserror::Error;

#[derive(Error, Debug)]
pub enum FlowMetrixError {
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("Job not found upstream: {0}")]
    JobNotFound(String),

    #[error("Build {job} #{build} not found upstream")]
    BuildNotFound { job: String, build: u64 },

    #[error("Build {job} #{build} has not finished yet")]
    BuildNotFinished { job: String, build: u64 },

    #[error("Malformed response from {url}: {reason}")]
    MalformedResponse { url: String, reason: String },

    #[error("Malformed stage document: {0}")]
    MalformedStageDocument(String),

    #[error("Metrics registry error: {0}")]
    Metrics(#[from] prometheus::Error),
}

impl FlowMetrixError {
    /// Whether the failure concerns the whole job rather than a single build.
    ///
    /// Job-level failures come out of `list_builds` and move the job into
    /// backoff; everything else is scoped to the build being processed.
    pub fn is_job_level(&self) -> bool {
        matches!(self, Self::UpstreamUnavailable(_) | Self::JobNotFound(_))
    }

    /// An expected condition that only postpones the build to a later cycle.
    pub fn is_deferral(&self) -> bool {
        matches!(self, Self::BuildNotFinished { .. })
    }

    /// Stable, low-cardinality label used for the poll error counter.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Config(_) => "config",
            Self::UpstreamUnavailable(_) => "upstream_unavailable",
            Self::JobNotFound(_) => "job_not_found",
            Self::BuildNotFound { .. } => "build_not_found",
            Self::BuildNotFinished { .. } => "build_not_finished",
            Self::MalformedResponse { .. } => "malformed_response",
            Self::MalformedStageDocument(_) => "malformed_stage_document",
            Self::Metrics(_) => "metrics",
        }
    }
}

pub type Result<T> = std::result::Result<T, FlowMetrixError>;
