//! CLI for toonpdf
//!
//! - fetch <url> [out_dir] [pdf_name] - Harvest one episode into a PDF
//! - job <url> - Run a harvest as a tracked background job
//! - status <job_id> - Show the recorded state of a job

use std::fs::create_dir_all;
use std::io::IsTerminal;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use toonpdf_config::Config;
use tracing::{debug, error, info};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    EnvFilter,
    fmt::{format::FmtSpan, time::UtcTime},
    prelude::*,
};

use toonpdf_harvest::job::{self, ChildCommand, JobEvent, JobStatus, JobStore};
use toonpdf_harvest::{HarvestConfig, HarvestOptions, HarvestRequest};

/// toonpdf - Webtoon episode to PDF
#[derive(Parser)]
#[clap(author, version, about, long_about = None)]
struct Cli {
    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Harvest one episode into a PDF
    Fetch {
        /// Episode URL
        #[clap(required = true)]
        url: String,

        /// Output directory and/or PDF file name, in either order
        #[clap(num_args = 0..=2)]
        targets: Vec<String>,

        /// Extra wait after page load, in milliseconds
        #[clap(long, default_value_t = 0)]
        wait: u64,

        /// Verbose logging
        #[clap(long)]
        debug: bool,
    },

    /// Run a harvest as a tracked job
    Job {
        /// Episode URL
        #[clap(required = true)]
        url: String,

        /// Extra wait after page load, in milliseconds
        #[clap(long, default_value_t = 0)]
        wait: u64,

        /// Verbose logging in the harvest process
        #[clap(long)]
        debug: bool,
    },

    /// Show the state of a job
    Status {
        /// Job identifier
        #[clap(required = true)]
        job_id: String,
    },
}

impl Commands {
    fn debug(&self) -> bool {
        match self {
            Commands::Fetch { debug, .. } | Commands::Job { debug, .. } => *debug,
            Commands::Status { .. } => false,
        }
    }
}

/// Console and file logging. The returned guards must outlive the program.
fn init_logging(config: &HarvestConfig, debug: bool) -> Result<Vec<WorkerGuard>> {
    let log_dir = config.logs_path.clone();
    create_dir_all(&log_dir)
        .with_context(|| format!("Failed to create log directory: {}", log_dir.display()))?;

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if debug || cfg!(debug_assertions) {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("info")
        }
    });

    let file_appender = tracing_appender::rolling::daily(&log_dir, "toonpdf.log");
    let (file_writer, file_guard) = tracing_appender::non_blocking(file_appender);
    let (stdout_writer, stdout_guard) = tracing_appender::non_blocking(std::io::stdout());

    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(stdout_writer)
                .with_ansi(std::io::stdout().is_terminal())
                .with_target(false),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(file_writer)
                .with_ansi(false)
                .with_timer(UtcTime::rfc_3339())
                .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
                .with_thread_ids(true)
                .with_file(true)
                .with_line_number(true),
        )
        .try_init()
        .context("Failed to set up tracing subscriber")?;

    debug!("Logging to {}", log_dir.display());
    Ok(vec![file_guard, stdout_guard])
}

/// Reports a failed run, then drops the log guards so buffered lines reach
/// their writers before the process ends.
fn finish(result: Result<ExitCode>, guards: Vec<WorkerGuard>) -> ExitCode {
    let code = match result {
        Ok(code) => code,
        Err(e) => {
            error!("{:#}", e);
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    };
    drop(guards);
    code
}

async fn run(command: Commands, config: &HarvestConfig) -> Result<ExitCode> {
    match command {
        Commands::Fetch {
            url,
            targets,
            wait,
            debug,
        } => {
            let options = HarvestOptions {
                wait_millis: wait,
                debug,
            };
            let request = HarvestRequest::resolve(&url, &targets, options, &config.default_site)?;
            let pdf_path = toonpdf_harvest::harvest_episode(&request, config).await?;
            println!("PDF generated: {}", pdf_path.display());
            Ok(ExitCode::SUCCESS)
        }

        Commands::Job { url, wait, debug } => {
            let options = HarvestOptions {
                wait_millis: wait,
                debug,
            };
            let mut store = JobStore::new(&config.jobs_path);
            let record = job::prepare_job(&mut store, &url, config)?;
            println!("Job {}: {}", record.id, record.file_name);

            let (tx, mut rx) = mpsc::unbounded_channel();
            let printer = tokio::spawn(async move {
                while let Some(event) = rx.recv().await {
                    match event {
                        JobEvent::Line(line) => println!("{line}"),
                        JobEvent::Done { .. } => println!("__DONE__"),
                        JobEvent::Error { message } => {
                            println!("ERR: {message}");
                            println!("__ERROR__");
                        }
                    }
                }
            });

            let command = ChildCommand::current_exe()?;
            let finished = job::run_job(&mut store, &record, &options, &command, &tx).await;
            drop(tx);
            let _ = printer.await;

            Ok(match finished?.status {
                JobStatus::Done => ExitCode::SUCCESS,
                _ => ExitCode::FAILURE,
            })
        }

        Commands::Status { job_id } => {
            let mut store = JobStore::new(&config.jobs_path);
            let Some(record) = store.status(&job_id)? else {
                println!("{}", serde_json::to_string_pretty(&serde_json::json!({ "status": "unknown" }))?);
                return Ok(ExitCode::FAILURE);
            };
            let summary = serde_json::json!({
                "status": record.status,
                "fileName": record.file_name,
                "errorMessage": record.error_message,
            });
            println!("{}", serde_json::to_string_pretty(&summary)?);
            Ok(ExitCode::SUCCESS)
        }
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    let config = Config::<HarvestConfig>::load_or_default()?.data;
    let guards = init_logging(&config, cli.command.debug())?;

    info!("Starting toonpdf v{}", env!("CARGO_PKG_VERSION"));
    debug!("Using configuration: {:#?}", config);

    let result = run(cli.command, &config).await;
    Ok(finish(result, guards))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_is_logged_before_exit() {
        let dir = tempfile::tempdir().unwrap();
        let log_path = dir.path().join("run.log");
        let (writer, guard) =
            tracing_appender::non_blocking(std::fs::File::create(&log_path).unwrap());
        let subscriber = tracing_subscriber::fmt()
            .with_writer(writer)
            .with_ansi(false)
            .finish();

        let code = tracing::subscriber::with_default(subscriber, || {
            finish(Err(anyhow::anyhow!("browser went away")), vec![guard])
        });

        assert_eq!(code, ExitCode::FAILURE);
        let logged = std::fs::read_to_string(&log_path).unwrap();
        assert!(logged.contains("browser went away"));
    }

    #[test]
    fn test_success_keeps_exit_code() {
        assert_eq!(finish(Ok(ExitCode::SUCCESS), Vec::new()), ExitCode::SUCCESS);
    }
}
