mod jenkins;

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::Result;

pub use jenkins::JenkinsClient;

/// A build as it appears in a job's build list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildSummary {
    pub number: u64,
    pub in_progress: bool,
}

/// Snapshot of a job's recent builds.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildList {
    /// Latest completed build, or 0 when the job has never completed one
    pub latest_build_number: u64,
    /// Recent builds, in whatever order upstream lists them
    pub builds: Vec<BuildSummary>,
}

impl BuildList {
    pub fn build_numbers(&self) -> Vec<u64> {
        self.builds.iter().map(|b| b.number).collect()
    }

    pub fn is_in_progress(&self, build_number: u64) -> bool {
        self.builds
            .iter()
            .any(|b| b.number == build_number && b.in_progress)
    }
}

/// Read-only access to the build orchestrator.
///
/// Implementations perform no retries; retry policy lives in the poller.
#[async_trait]
pub trait Orchestrator: Send + Sync {
    /// Lists the latest build number and recent builds of `job_name`.
    ///
    /// # Errors
    ///
    /// `UpstreamUnavailable` on network or auth failures, `JobNotFound` when the
    /// job does not exist upstream.
    async fn list_builds(&self, job_name: &str) -> Result<BuildList>;

    /// Fetches the raw stage-breakdown document of one build.
    ///
    /// # Errors
    ///
    /// `BuildNotFinished` while the build is still running,
    /// `BuildNotFound` for unknown builds, `UpstreamUnavailable` on transient
    /// failures and `MalformedResponse` when the body is not a JSON document.
    async fn fetch_stage_breakdown(&self, job_name: &str, build_number: u64) -> Result<Value>;
}

#[async_trait]
impl<T: Orchestrator + ?Sized> Orchestrator for Arc<T> {
    async fn list_builds(&self, job_name: &str) -> Result<BuildList> {
        (**self).list_builds(job_name).await
    }

    async fn fetch_stage_breakdown(&self, job_name: &str, build_number: u64) -> Result<Value> {
        (**self).fetch_stage_breakdown(job_name, build_number).await
    }
}
