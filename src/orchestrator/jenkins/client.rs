use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use reqwest::{Client, Response, StatusCode};
use serde_json::Value;
use url::Url;

use super::types::{job_segments, JenkinsJob, JOB_TREE};
use crate::auth::Credentials;
use crate::error::{FlowMetrixError, Result};
use crate::orchestrator::{BuildList, Orchestrator};
use crate::records::BuildStatus;

/// Jenkins REST client covering the job API and the pipeline (`wfapi`) API.
pub struct JenkinsClient {
    client: Client,
    base_url: Url,
    credentials: Credentials,
}

impl JenkinsClient {
    /// Creates a client for the Jenkins instance at `base_url`.
    ///
    /// Every request made by the client is bounded by `timeout`.
    ///
    /// # Errors
    ///
    /// Returns a `Config` error if the URL cannot be parsed or cannot carry
    /// path segments, or if the HTTP client cannot be built.
    pub fn new(base_url: &str, credentials: Credentials, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .user_agent(concat!("flowmetrix/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()
            .map_err(|e| FlowMetrixError::Config(format!("Failed to create HTTP client: {e}")))?;

        let base_url = Url::parse(base_url)
            .map_err(|e| FlowMetrixError::Config(format!("Invalid Jenkins URL: {e}")))?;

        if base_url.cannot_be_a_base() {
            return Err(FlowMetrixError::Config(format!(
                "Invalid Jenkins URL: {base_url} cannot carry a path"
            )));
        }

        Ok(Self {
            client,
            base_url,
            credentials,
        })
    }

    fn endpoint(&self, segments: &[&str], query: Option<&str>) -> Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|()| {
                FlowMetrixError::Config(format!("Invalid Jenkins URL: {}", self.base_url))
            })?
            .pop_if_empty()
            .extend(segments);
        url.set_query(query);
        Ok(url)
    }

    fn job_url(&self, job_name: &str, tail: &[&str], query: Option<&str>) -> Result<Url> {
        let mut segments = job_segments(job_name);
        segments.extend_from_slice(tail);
        self.endpoint(&segments, query)
    }

    async fn get(&self, url: &Url) -> Result<Response> {
        debug!("GET {url}");
        self.credentials
            .apply(self.client.get(url.clone()))
            .send()
            .await
            .map_err(|e| FlowMetrixError::UpstreamUnavailable(format!("GET {url}: {e}")))
    }

    async fn read_body(url: &Url, response: Response) -> Result<Value> {
        let body = response
            .text()
            .await
            .map_err(|e| FlowMetrixError::UpstreamUnavailable(format!("GET {url}: {e}")))?;

        serde_json::from_str(&body).map_err(|e| FlowMetrixError::MalformedResponse {
            url: url.to_string(),
            reason: e.to_string(),
        })
    }

    fn unavailable(url: &Url, status: StatusCode) -> FlowMetrixError {
        FlowMetrixError::UpstreamUnavailable(format!("GET {url} returned {status}"))
    }

    /// Reads the Jenkins version from the `X-Jenkins` response header.
    ///
    /// # Errors
    ///
    /// Returns `UpstreamUnavailable` if the instance cannot be reached or
    /// rejects the credentials.
    pub async fn version(&self) -> Result<Option<String>> {
        let url = self.endpoint(&["api", "json"], Some("tree=mode"))?;
        let response = self.get(&url).await?;

        let status = response.status();
        if !status.is_success() {
            return Err(Self::unavailable(&url, status));
        }

        Ok(response
            .headers()
            .get("X-Jenkins")
            .and_then(|v| v.to_str().ok())
            .map(ToString::to_string))
    }
}

#[async_trait]
impl Orchestrator for JenkinsClient {
    async fn list_builds(&self, job_name: &str) -> Result<BuildList> {
        let query = format!("tree={JOB_TREE}");
        let url = self.job_url(job_name, &["api", "json"], Some(query.as_str()))?;
        let response = self.get(&url).await?;

        match response.status() {
            StatusCode::NOT_FOUND => return Err(FlowMetrixError::JobNotFound(job_name.to_string())),
            status if !status.is_success() => return Err(Self::unavailable(&url, status)),
            _ => {}
        }

        let body = Self::read_body(&url, response).await?;
        let job: JenkinsJob =
            serde_json::from_value(body).map_err(|e| FlowMetrixError::MalformedResponse {
                url: url.to_string(),
                reason: e.to_string(),
            })?;

        Ok(job.into())
    }

    async fn fetch_stage_breakdown(&self, job_name: &str, build_number: u64) -> Result<Value> {
        let build = build_number.to_string();
        let url = self.job_url(job_name, &[build.as_str(), "wfapi", "describe"], None)?;
        let response = self.get(&url).await?;

        match response.status() {
            StatusCode::NOT_FOUND => {
                return Err(FlowMetrixError::BuildNotFound {
                    job: job_name.to_string(),
                    build: build_number,
                })
            }
            status if !status.is_success() => return Err(Self::unavailable(&url, status)),
            _ => {}
        }

        let document = Self::read_body(&url, response).await?;
        if !document.is_object() {
            return Err(FlowMetrixError::MalformedResponse {
                url: url.to_string(),
                reason: "expected a JSON object".to_string(),
            });
        }

        let unfinished = document
            .get("status")
            .and_then(Value::as_str)
            .is_some_and(|s| BuildStatus::from_upstream(s) == BuildStatus::InProgress);
        if unfinished {
            return Err(FlowMetrixError::BuildNotFinished {
                job: job_name.to_string(),
                build: build_number,
            });
        }

        Ok(document)
    }
}
