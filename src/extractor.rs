//! Turns a stage-breakdown document into flat, validated stage records.
//!
//! Parsing happens in two steps. The document is first read into a loose
//! schema where every field is optional, then validated into [`StageNode`]
//! trees. Only a fully validated tree is flattened, so a document is either
//! accepted as a whole or rejected with
//! [`FlowMetrixError::MalformedStageDocument`].
//!
//! Parallel and nested containers are replaced by their leaf stages. A
//! container's own duration already covers its children's wall-clock time, so
//! emitting both would count the same time twice.

use chrono::{DateTime, Utc};
use log::trace;
use serde::Deserialize;
use serde_json::Value;

use crate::error::{FlowMetrixError, Result};
use crate::records::{BuildRecord, BuildStatus, StageRecord, StageStatus};

const UNNAMED_STAGE: &str = "Unnamed Stage";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawBuildDocument {
    status: Option<String>,
    duration_millis: Option<u64>,
    start_time_millis: Option<i64>,
    stages: Option<Vec<RawStage>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawStage {
    name: Option<String>,
    status: Option<String>,
    duration_millis: Option<u64>,
    #[serde(alias = "branches")]
    parallel: Option<Vec<RawStage>>,
    #[serde(alias = "children")]
    stages: Option<Vec<RawStage>>,
}

/// A validated stage tree node.
#[derive(Debug, Clone, PartialEq)]
pub enum StageNode {
    Leaf {
        name: String,
        status: StageStatus,
        duration_ms: u64,
    },
    Parallel {
        name: String,
        branches: Vec<StageNode>,
    },
    Sequential {
        name: String,
        stages: Vec<StageNode>,
    },
}

/// Build-level fields plus the validated stage tree.
#[derive(Debug, Clone, PartialEq)]
pub struct StageDocument {
    pub status: BuildStatus,
    pub duration_ms: u64,
    pub started_at: Option<DateTime<Utc>>,
    pub stages: Vec<StageNode>,
}

fn malformed(reason: impl Into<String>) -> FlowMetrixError {
    FlowMetrixError::MalformedStageDocument(reason.into())
}

fn non_empty(list: Option<Vec<RawStage>>) -> Option<Vec<RawStage>> {
    list.filter(|l| !l.is_empty())
}

fn validate_stages(raw: Vec<RawStage>) -> Result<Vec<StageNode>> {
    raw.into_iter().map(validate_stage).collect()
}

fn validate_stage(raw: RawStage) -> Result<StageNode> {
    let name = raw
        .name
        .filter(|n| !n.trim().is_empty())
        .unwrap_or_else(|| UNNAMED_STAGE.to_string());

    if let Some(branches) = non_empty(raw.parallel) {
        return Ok(StageNode::Parallel {
            name,
            branches: validate_stages(branches)?,
        });
    }

    if let Some(stages) = non_empty(raw.stages) {
        return Ok(StageNode::Sequential {
            name,
            stages: validate_stages(stages)?,
        });
    }

    let reported = raw
        .status
        .as_deref()
        .map(StageStatus::from_upstream)
        .ok_or_else(|| malformed(format!("stage '{name}' has no status")))?;

    // A stage without a duration is still running, whatever upstream says
    let (status, duration_ms) = match raw.duration_millis {
        Some(_) if reported == StageStatus::InProgress => (StageStatus::InProgress, 0),
        Some(ms) => (reported, ms),
        None => (StageStatus::InProgress, 0),
    };

    Ok(StageNode::Leaf {
        name,
        status,
        duration_ms,
    })
}

/// Validates a raw stage-breakdown document.
///
/// # Errors
///
/// Returns `MalformedStageDocument` when the document is not an object, has no
/// build status, lacks a duration for a finished build, or contains a stage
/// without a status.
pub fn validate(document: &Value) -> Result<StageDocument> {
    if !document.is_object() {
        return Err(malformed("document is not a JSON object"));
    }

    let raw = RawBuildDocument::deserialize(document)
        .map_err(|e| malformed(format!("unexpected document shape: {e}")))?;

    let status = raw
        .status
        .as_deref()
        .map(BuildStatus::from_upstream)
        .ok_or_else(|| malformed("missing build status"))?;

    let duration_ms = match (status, raw.duration_millis) {
        (BuildStatus::InProgress, _) => 0,
        (_, Some(ms)) => ms,
        (_, None) => return Err(malformed("missing build duration")),
    };

    let started_at = raw
        .start_time_millis
        .filter(|&ms| ms > 0)
        .and_then(DateTime::<Utc>::from_timestamp_millis);

    Ok(StageDocument {
        status,
        duration_ms,
        started_at,
        stages: validate_stages(raw.stages.unwrap_or_default())?,
    })
}

fn flatten_into(nodes: &[StageNode], out: &mut Vec<StageRecord>) {
    for (sequence_index, node) in nodes.iter().enumerate() {
        match node {
            StageNode::Leaf {
                name,
                status,
                duration_ms,
            } => out.push(StageRecord {
                name: name.clone(),
                status: *status,
                duration_ms: *duration_ms,
                sequence_index,
            }),
            StageNode::Parallel { name, branches } => {
                trace!("Replacing parallel stage '{name}' with {} branches", branches.len());
                flatten_into(branches, out);
            }
            StageNode::Sequential { name, stages } => {
                trace!("Replacing stage group '{name}' with {} stages", stages.len());
                flatten_into(stages, out);
            }
        }
    }
}

/// Flattens a validated stage tree in declaration order.
fn flatten(nodes: &[StageNode]) -> Vec<StageRecord> {
    let mut out = Vec::new();
    flatten_into(nodes, &mut out);
    out
}

impl StageDocument {
    /// The stages as a flat sequence in declaration order.
    pub fn normalize(&self) -> Vec<StageRecord> {
        flatten(&self.stages)
    }
}

/// Builds the full record for one build of `job_name`.
///
/// # Errors
///
/// See [`validate`].
pub fn parse_build(job_name: &str, build_number: u64, document: &Value) -> Result<BuildRecord> {
    let doc = validate(document)?;

    Ok(BuildRecord {
        job_name: job_name.to_string(),
        build_number,
        overall_status: doc.status,
        overall_duration_ms: doc.duration_ms,
        started_at: doc.started_at,
        stages: doc.normalize(),
    })
}
