use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use log::{error, info, warn};
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;

use crate::config::{Config, Overrides, Settings};
use crate::extractor;
use crate::orchestrator::{JenkinsClient, Orchestrator};
use crate::output;
use crate::poller::{IntervalTicker, Poller};
use crate::recorder::MetricRecorder;
use crate::server::{self, HttpState};

#[derive(Parser)]
#[command(name = "flowmetrix")]
#[command(author, version, about = "Pipeline stage metrics exporter", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file; defaults to ./flowmetrix.{toml,json,yaml,yml} when present
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Poll Jenkins and serve the collected metrics
    Serve {
        #[command(flatten)]
        jenkins: JenkinsArgs,

        /// Comma-separated jobs to monitor, folder jobs as `folder/job`
        #[arg(short, long, env = "JOBS_TO_MONITOR", value_delimiter = ',')]
        jobs: Option<Vec<String>>,

        /// Seconds between polling cycles
        #[arg(short = 'i', long, env = "POLL_INTERVAL")]
        poll_interval: Option<u64>,

        /// Port the metrics endpoint listens on
        #[arg(short = 'p', long, env = "LISTEN_PORT")]
        listen_port: Option<u16>,
    },
    /// Print the normalized stages of a single build
    Inspect {
        #[command(flatten)]
        jenkins: JenkinsArgs,

        #[arg(short, long)]
        job: String,

        #[arg(short, long)]
        build: u64,
    },
}

#[derive(Args)]
struct JenkinsArgs {
    #[arg(short, long, env = "JENKINS_URL")]
    url: Option<String>,

    #[arg(long, env = "JENKINS_USER")]
    user: Option<String>,

    #[arg(short, long, env = "JENKINS_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Per-request timeout in seconds
    #[arg(long, env = "REQUEST_TIMEOUT")]
    request_timeout: Option<u64>,
}

impl JenkinsArgs {
    fn overrides(&self) -> Overrides {
        Overrides {
            url: self.url.clone(),
            user: self.user.clone(),
            token: self.token.clone(),
            request_timeout_secs: self.request_timeout,
            ..Overrides::default()
        }
    }
}

/// Flips `shutdown` once `signal` resolves.
///
/// If the signal handler cannot be installed the sender is held for the life
/// of the process. Dropping it would close the channel, which the poller and
/// the server both treat as a stop request.
async fn forward_shutdown<F>(signal: F, shutdown: watch::Sender<bool>)
where
    F: Future<Output = std::io::Result<()>>,
{
    match signal.await {
        Ok(()) => {
            info!("Shutdown requested, finishing current build");
            let _ = shutdown.send(true);
        }
        Err(e) => {
            error!("Failed to listen for Ctrl-C, exporter keeps running: {e}");
            std::future::pending::<()>().await;
        }
    }
}

fn connect(settings: &Settings) -> Result<JenkinsClient> {
    JenkinsClient::new(
        &settings.jenkins_url,
        settings.credentials.clone(),
        settings.request_timeout,
    )
    .context("Failed to create Jenkins client")
}

impl Cli {
    async fn execute_serve(&self, settings: Settings) -> Result<()> {
        info!(
            "Monitoring {} jobs on {} every {}s",
            settings.jobs.len(),
            settings.jenkins_url,
            settings.poll_interval.as_secs()
        );

        let client = connect(&settings)?;
        match client.version().await {
            Ok(Some(version)) => info!("Connected to Jenkins {version}"),
            Ok(None) => info!("Connected to Jenkins at {}", settings.jenkins_url),
            Err(e) => warn!("Jenkins is not reachable yet, polling anyway: {e}"),
        }

        let recorder = Arc::new(
            MetricRecorder::new(&settings.buckets).context("Failed to create metric series")?,
        );

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(forward_shutdown(tokio::signal::ctrl_c(), shutdown_tx));

        let mut server = tokio::spawn(server::serve(
            settings.listen_addr,
            HttpState::new(Arc::clone(&recorder)),
            shutdown_rx.clone(),
        ));

        let mut poller = Poller::new(client, recorder, settings.jobs, shutdown_rx);

        // A server that fails to bind ends the process instead of polling blind.
        let finished = tokio::select! {
            () = poller.run(IntervalTicker::new(settings.poll_interval)) => None,
            result = &mut server => Some(result),
        };
        let result = match finished {
            Some(result) => result,
            None => server.await,
        };

        result
            .context("Metrics server task panicked")?
            .with_context(|| format!("Metrics server failed on {}", settings.listen_addr))?;

        info!("FlowMetrix stopped");
        Ok(())
    }

    async fn execute_inspect(&self, settings: &Settings, job: &str, build: u64) -> Result<()> {
        info!("Inspecting {job} #{build}");

        let client = connect(settings)?;
        let document = client
            .fetch_stage_breakdown(job, build)
            .await
            .with_context(|| format!("Failed to fetch {job} #{build}"))?;
        let record = extractor::parse_build(job, build, &document)
            .with_context(|| format!("Failed to parse stages of {job} #{build}"))?;

        output::print_build(&record);
        Ok(())
    }

    pub async fn execute(&self) -> Result<()> {
        let config = Config::load(self.config.as_deref())?;

        match &self.command {
            Commands::Serve {
                jenkins,
                jobs,
                poll_interval,
                listen_port,
            } => {
                let settings = config.resolve(Overrides {
                    jobs: jobs.clone(),
                    poll_interval_secs: *poll_interval,
                    listen_port: *listen_port,
                    ..jenkins.overrides()
                })?;
                self.execute_serve(settings).await
            }
            Commands::Inspect {
                jenkins,
                job,
                build,
            } => {
                // The job list only matters to `serve`; inspect targets one job.
                let settings = config.resolve(Overrides {
                    jobs: Some(vec![job.clone()]),
                    ..jenkins.overrides()
                })?;
                self.execute_inspect(&settings, job, *build).await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use std::time::Duration;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_serve_with_job_list() {
        let cli = Cli::try_parse_from([
            "flowmetrix",
            "serve",
            "--token",
            "secret",
            "--jobs",
            "app,team/api",
            "--poll-interval",
            "30",
        ])
        .unwrap();

        match cli.command {
            Commands::Serve {
                jenkins,
                jobs,
                poll_interval,
                ..
            } => {
                assert_eq!(jenkins.token.as_deref(), Some("secret"));
                assert_eq!(jobs.unwrap(), vec!["app", "team/api"]);
                assert_eq!(poll_interval, Some(30));
            }
            Commands::Inspect { .. } => panic!("expected serve"),
        }
    }

    #[test]
    fn test_parse_inspect() {
        let cli = Cli::try_parse_from([
            "flowmetrix",
            "inspect",
            "--job",
            "nightly",
            "--build",
            "42",
            "--config",
            "custom.toml",
        ])
        .unwrap();

        assert_eq!(cli.config, Some(PathBuf::from("custom.toml")));
        assert!(matches!(
            cli.command,
            Commands::Inspect { ref job, build: 42, .. } if job == "nightly"
        ));
    }

    #[tokio::test]
    async fn test_signal_failure_keeps_shutdown_channel_open() {
        let (tx, mut rx) = watch::channel(false);
        tokio::spawn(forward_shutdown(
            async { Err(std::io::Error::new(std::io::ErrorKind::Other, "no signals")) },
            tx,
        ));

        let waited = tokio::time::timeout(Duration::from_millis(50), rx.changed()).await;
        assert!(waited.is_err(), "channel changed or closed: {waited:?}");
        assert!(!*rx.borrow());
    }

    #[tokio::test]
    async fn test_signal_requests_shutdown() {
        let (tx, mut rx) = watch::channel(false);
        tokio::spawn(forward_shutdown(async { Ok(()) }, tx));

        tokio::time::timeout(Duration::from_secs(1), rx.changed())
            .await
            .unwrap()
            .unwrap();
        assert!(*rx.borrow());
    }

    #[test]
    fn test_inspect_requires_build_number() {
        let result = Cli::try_parse_from(["flowmetrix", "inspect", "--job", "nightly"]);
        assert!(result.is_err());
    }
}
