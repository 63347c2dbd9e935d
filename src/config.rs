use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::auth::{Credentials, Token};
use crate::error::FlowMetrixError;
use crate::recorder::{Buckets, DEFAULT_BUILD_BUCKETS, DEFAULT_STAGE_BUCKETS};

const DEFAULT_CONFIG_FILES: [&str; 4] = [
    "flowmetrix.toml",
    "flowmetrix.json",
    "flowmetrix.yaml",
    "flowmetrix.yml",
];

/// Configuration file structure for FlowMetrix.
///
/// Every value can also be given on the command line or through the
/// environment, which take precedence over the file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    #[serde(default)]
    pub jenkins: JenkinsConfig,

    #[serde(default)]
    pub exporter: ExporterConfig,

    #[serde(default)]
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct JenkinsConfig {
    /// Jenkins instance base URL
    #[serde(default = "default_jenkins_url")]
    pub url: String,

    /// User name for basic auth; bearer auth is used when absent
    pub user: Option<String>,

    /// API token
    pub token: Option<String>,

    /// Jobs to monitor, folder jobs as `folder/job`
    #[serde(default)]
    pub jobs: Vec<String>,

    /// Per-request timeout in seconds
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ExporterConfig {
    /// Seconds between polling cycles
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,

    /// Address the metrics endpoint binds to
    #[serde(default = "default_listen_address")]
    pub listen_address: IpAddr,

    /// Port the metrics endpoint listens on
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct MetricsConfig {
    /// Build duration histogram buckets, in seconds
    #[serde(default = "default_build_buckets")]
    pub build_buckets: Vec<f64>,

    /// Stage duration histogram buckets, in seconds
    #[serde(default = "default_stage_buckets")]
    pub stage_buckets: Vec<f64>,
}

impl Default for JenkinsConfig {
    fn default() -> Self {
        Self {
            url: default_jenkins_url(),
            user: None,
            token: None,
            jobs: Vec::new(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl Default for ExporterConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval_secs(),
            listen_address: default_listen_address(),
            listen_port: default_listen_port(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            build_buckets: default_build_buckets(),
            stage_buckets: default_stage_buckets(),
        }
    }
}

fn default_jenkins_url() -> String {
    "http://localhost:8080".to_string()
}

fn default_request_timeout_secs() -> u64 {
    10
}

fn default_poll_interval_secs() -> u64 {
    60
}

fn default_listen_address() -> IpAddr {
    IpAddr::from([0, 0, 0, 0])
}

fn default_listen_port() -> u16 {
    8000
}

fn default_build_buckets() -> Vec<f64> {
    DEFAULT_BUILD_BUCKETS.to_vec()
}

fn default_stage_buckets() -> Vec<f64> {
    DEFAULT_STAGE_BUCKETS.to_vec()
}

/// Values given on the command line or through the environment.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub url: Option<String>,
    pub user: Option<String>,
    pub token: Option<String>,
    pub jobs: Option<Vec<String>>,
    pub poll_interval_secs: Option<u64>,
    pub listen_port: Option<u16>,
    pub request_timeout_secs: Option<u64>,
}

/// Fully resolved and validated runtime settings.
#[derive(Debug, Clone)]
pub struct Settings {
    pub jenkins_url: String,
    pub credentials: Credentials,
    pub jobs: Vec<String>,
    pub poll_interval: Duration,
    pub request_timeout: Duration,
    pub listen_addr: SocketAddr,
    pub buckets: Buckets,
}

impl Config {
    /// Reads the exporter configuration.
    ///
    /// `--config` wins when given and must exist. Otherwise the first of
    /// `flowmetrix.toml`, `.json`, `.yaml`, `.yml` in the working directory is
    /// used, and built-in defaults apply when none is present.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        if let Some(path) = path {
            return Self::load_from_path(path);
        }

        match DEFAULT_CONFIG_FILES
            .iter()
            .map(Path::new)
            .find(|candidate| candidate.exists())
        {
            Some(found) => Self::load_from_path(found),
            None => Ok(Self::default()),
        }
    }

    /// Parses one file, choosing the format by extension and trying each
    /// format in turn for unknown extensions.
    fn load_from_path(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let extension = path.extension().and_then(|ext| ext.to_str()).unwrap_or("");

        match extension {
            "toml" => toml::from_str(&contents)
                .with_context(|| format!("Failed to parse TOML config: {}", path.display())),
            "json" => serde_json::from_str(&contents)
                .with_context(|| format!("Failed to parse JSON config: {}", path.display())),
            "yaml" | "yml" => serde_yaml::from_str(&contents)
                .with_context(|| format!("Failed to parse YAML config: {}", path.display())),
            _ => toml::from_str(&contents)
                .or_else(|_| serde_json::from_str(&contents))
                .or_else(|_| serde_yaml::from_str(&contents))
                .with_context(|| format!("Failed to parse config file: {}", path.display())),
        }
    }

    /// Applies command-line overrides and validates the result.
    ///
    /// # Errors
    ///
    /// Fails on a missing token, an empty or malformed job list, duplicate
    /// job names, a zero polling interval or timeout, or invalid buckets.
    pub fn resolve(self, overrides: Overrides) -> Result<Settings> {
        let Config {
            jenkins,
            exporter,
            metrics,
        } = self;

        let token = overrides
            .token
            .or(jenkins.token)
            .map(Token::from)
            .filter(|t| !t.is_blank())
            .ok_or_else(|| config_error("a Jenkins API token is required (JENKINS_TOKEN)"))?;

        let jobs = parse_jobs(overrides.jobs.unwrap_or(jenkins.jobs))?;

        let poll_interval_secs = overrides
            .poll_interval_secs
            .unwrap_or(exporter.poll_interval_secs);
        if poll_interval_secs == 0 {
            return Err(config_error("poll interval must be at least one second").into());
        }

        let request_timeout_secs = overrides
            .request_timeout_secs
            .unwrap_or(jenkins.request_timeout_secs);
        if request_timeout_secs == 0 {
            return Err(config_error("request timeout must be at least one second").into());
        }

        let buckets = Buckets {
            build: metrics.build_buckets,
            stage: metrics.stage_buckets,
        };
        buckets.validate()?;

        let jenkins_url = overrides.url.unwrap_or(jenkins.url);
        url::Url::parse(&jenkins_url)
            .map_err(|e| config_error(format!("invalid Jenkins URL '{jenkins_url}': {e}")))?;

        Ok(Settings {
            jenkins_url,
            credentials: Credentials::new(overrides.user.or(jenkins.user), token),
            jobs,
            poll_interval: Duration::from_secs(poll_interval_secs),
            request_timeout: Duration::from_secs(request_timeout_secs),
            listen_addr: SocketAddr::new(
                exporter.listen_address,
                overrides.listen_port.unwrap_or(exporter.listen_port),
            ),
            buckets,
        })
    }
}

fn config_error(message: impl Into<String>) -> FlowMetrixError {
    FlowMetrixError::Config(message.into())
}

/// Trims job names and rejects empty lists, blank entries and duplicates.
fn parse_jobs(raw: Vec<String>) -> Result<Vec<String>, FlowMetrixError> {
    let jobs: Vec<String> = raw.iter().map(|j| j.trim().to_string()).collect();

    if jobs.is_empty() {
        return Err(config_error(
            "at least one job to monitor is required (JOBS_TO_MONITOR)",
        ));
    }
    if jobs.iter().any(String::is_empty) {
        return Err(config_error(format!(
            "job list contains an empty name: {raw:?}"
        )));
    }

    let mut seen = HashSet::new();
    if let Some(duplicate) = jobs.iter().find(|j| !seen.insert(j.as_str())) {
        return Err(config_error(format!("job '{duplicate}' is listed twice")));
    }

    Ok(jobs)
}
