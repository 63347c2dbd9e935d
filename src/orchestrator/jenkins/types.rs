use serde::Deserialize;

use crate::orchestrator::{BuildList, BuildSummary};

/// `tree` filter limiting the job document to what the tracker needs.
pub const JOB_TREE: &str =
    "lastBuild[number],lastCompletedBuild[number],builds[number,building]{0,100}";

/// Reference to a build inside a job document.
#[derive(Debug, Clone, Deserialize)]
pub struct BuildRef {
    pub number: u64,
}

/// A Jenkins job as returned by `job/<path>/api/json`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JenkinsJob {
    pub last_build: Option<BuildRef>,
    pub last_completed_build: Option<BuildRef>,
    pub builds: Option<Vec<JenkinsBuild>>,
}

/// A build entry of a Jenkins job.
#[derive(Debug, Clone, Deserialize)]
pub struct JenkinsBuild {
    pub number: u64,
    #[serde(default)]
    pub building: bool,
}

impl From<JenkinsJob> for BuildList {
    fn from(job: JenkinsJob) -> Self {
        let latest_build_number = job
            .last_completed_build
            .or(job.last_build)
            .map_or(0, |b| b.number);

        let builds = job
            .builds
            .unwrap_or_default()
            .into_iter()
            .map(|b| BuildSummary {
                number: b.number,
                in_progress: b.building,
            })
            .collect();

        Self {
            latest_build_number,
            builds,
        }
    }
}

/// Splits a folder-style job name into URL path segments.
///
/// `team/app` becomes `job/team/job/app`.
pub fn job_segments(job_name: &str) -> Vec<&str> {
    job_name
        .split('/')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .flat_map(|s| ["job", s])
        .collect()
}
