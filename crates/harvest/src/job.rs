//! Out-of-process harvest jobs.
//!
//! A job runs `toonpdf fetch` as a child process, forwards its output line by
//! line and records the outcome. Job records live in an explicit [`JobStore`]
//! and every change is snapshotted to `meta.json` in the job's output
//! directory, so status queries survive a restart.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::LazyLock;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, warn};

use crate::{HarvestConfig, HarvestError, HarvestOptions, naming};

pub const META_FILE: &str = "meta.json";
pub const STDERR_LOG: &str = "stderr.log";
const FAILURE_TAIL_LINES: usize = 15;

static BROWSER_MISSING: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)could not (find|auto detect)[a-z ]*chrom|failed to launch browser").unwrap()
});
static NETWORK_FAILURE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)ERR_NAME_NOT_RESOLVED|ERR_BLOCKED_BY_CLIENT|ERR_CONNECTION").unwrap()
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Started,
    Done,
    Error,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::Error)
    }

    /// Only `started -> done | error` is allowed.
    pub fn can_become(self, next: JobStatus) -> bool {
        self == JobStatus::Started && next.is_terminal()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Started => "started",
            JobStatus::Done => "done",
            JobStatus::Error => "error",
        }
    }
}

/// Bookkeeping for one job, also its `meta.json` snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRecord {
    pub id: String,
    pub url: String,
    pub status: JobStatus,
    pub pdf_path: PathBuf,
    pub out_dir: PathBuf,
    pub file_name: String,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobRecord {
    pub fn new(id: String, url: String, out_dir: PathBuf, file_name: String) -> Self {
        let now = Utc::now();
        Self {
            id,
            url,
            status: JobStatus::Started,
            pdf_path: out_dir.join(&file_name),
            out_dir,
            file_name,
            error_message: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn advance(&mut self, next: JobStatus, error_message: Option<String>) -> Result<()> {
        if !self.status.can_become(next) {
            bail!(
                "job {} cannot go from {} to {}",
                self.id,
                self.status.as_str(),
                next.as_str()
            );
        }
        self.status = next;
        self.error_message = error_message;
        self.updated_at = Utc::now();
        Ok(())
    }

    pub fn stderr_log(&self) -> PathBuf {
        self.out_dir.join(STDERR_LOG)
    }

    fn save_snapshot(&self) -> Result<()> {
        let path = self.out_dir.join(META_FILE);
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(&path, json).map_err(|e| HarvestError::io(&path, e))?;
        Ok(())
    }
}

/// In-memory job records keyed by id, each persisted under `root`.
#[derive(Debug)]
pub struct JobStore {
    root: PathBuf,
    jobs: HashMap<String, JobRecord>,
}

impl JobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            jobs: HashMap::new(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn get(&self, id: &str) -> Option<&JobRecord> {
        self.jobs.get(id)
    }

    pub fn insert(&mut self, record: JobRecord) -> Result<()> {
        record.save_snapshot()?;
        self.jobs.insert(record.id.clone(), record);
        Ok(())
    }

    /// Moves a started job to `done`.
    pub fn complete(&mut self, id: &str) -> Result<&JobRecord> {
        self.transition(id, JobStatus::Done, None)
    }

    /// Moves a started job to `error` with a message.
    pub fn fail(&mut self, id: &str, message: impl Into<String>) -> Result<&JobRecord> {
        self.transition(id, JobStatus::Error, Some(message.into()))
    }

    fn transition(
        &mut self,
        id: &str,
        next: JobStatus,
        error_message: Option<String>,
    ) -> Result<&JobRecord> {
        let record = self
            .jobs
            .get_mut(id)
            .with_context(|| format!("Unknown job {id}"))?;
        record.advance(next, error_message)?;
        record.save_snapshot()?;
        Ok(record)
    }

    /// Looks a job up in memory, then in its snapshot on disk.
    pub fn status(&mut self, id: &str) -> Result<Option<&JobRecord>> {
        if !self.jobs.contains_key(id) {
            match load_snapshot(&self.root, id)? {
                Some(record) => {
                    debug!("Rehydrated job {} from disk", id);
                    self.jobs.insert(id.to_string(), record);
                }
                None => return Ok(None),
            }
        }
        Ok(self.jobs.get(id))
    }
}

/// Reads `<root>/<id>/*/meta.json`, if any.
pub fn load_snapshot(root: &Path, id: &str) -> Result<Option<JobRecord>> {
    let job_root = root.join(id);
    if !job_root.is_dir() {
        return Ok(None);
    }

    let mut dirs: Vec<PathBuf> = std::fs::read_dir(&job_root)
        .map_err(|e| HarvestError::io(&job_root, e))?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_dir())
        .collect();
    dirs.sort();

    for dir in dirs {
        let meta = dir.join(META_FILE);
        if meta.is_file() {
            let text = std::fs::read_to_string(&meta).map_err(|e| HarvestError::io(&meta, e))?;
            let record = serde_json::from_str(&text)
                .with_context(|| format!("Corrupt job snapshot {}", meta.display()))?;
            return Ok(Some(record));
        }
    }
    Ok(None)
}

/// Progress of a running job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobEvent {
    /// A line of child output; stderr lines carry an `ERR: ` prefix
    Line(String),
    Done { pdf_path: PathBuf },
    Error { message: String },
}

/// Turns a failed child's stderr into a short explanation.
pub fn summarize_failure(stderr: &str, exit_code: Option<i32>) -> String {
    if BROWSER_MISSING.is_match(stderr) {
        return "Chromium not found: install Chrome or Chromium, or set CHROME_PATH".to_string();
    }
    if NETWORK_FAILURE.is_match(stderr) {
        return "Network or loading error (check the URL, cookie consent or ad blocking)"
            .to_string();
    }

    let lines: Vec<&str> = stderr.lines().filter(|l| !l.trim().is_empty()).collect();
    let tail = lines[lines.len().saturating_sub(FAILURE_TAIL_LINES)..].join("\n");
    if !tail.trim().is_empty() {
        return tail.trim().to_string();
    }

    match exit_code {
        Some(code) => format!("Process exited with code={code}"),
        None => "Process exited with code=none (terminated by signal)".to_string(),
    }
}

/// How to start the harvest child process.
#[derive(Debug, Clone)]
pub struct ChildCommand {
    pub program: PathBuf,
    /// Arguments placed before `fetch`
    pub leading_args: Vec<String>,
}

impl ChildCommand {
    /// This executable, re-invoked with the `fetch` subcommand.
    pub fn current_exe() -> Result<Self> {
        Ok(Self {
            program: std::env::current_exe().context("Cannot locate own executable")?,
            leading_args: Vec::new(),
        })
    }

    fn fetch_args(&self, url: &str, record: &JobRecord, options: &HarvestOptions) -> Vec<String> {
        let mut args = self.leading_args.clone();
        args.extend([
            "fetch".to_string(),
            url.to_string(),
            record.out_dir.display().to_string(),
            record.file_name.clone(),
        ]);
        if options.debug {
            args.push("--debug".to_string());
        }
        if options.wait_millis > 0 {
            args.push(format!("--wait={}", options.wait_millis));
        }
        args
    }
}

/// Creates a job record for `url` and its output directory.
pub fn prepare_job(store: &mut JobStore, url: &str, config: &HarvestConfig) -> Result<JobRecord> {
    let url = url.trim();
    if url.is_empty() {
        return Err(HarvestError::Input("missing URL".to_string()).into());
    }

    let id = Utc::now().timestamp_millis().to_string();
    let named_from = naming::normalize_url(url, &config.default_site).unwrap_or_else(|_| url.to_string());
    let series = naming::series_dir_from_url(&named_from);
    let out_dir = store.root().join(&id).join(&series);
    std::fs::create_dir_all(&out_dir).map_err(|e| HarvestError::io(&out_dir, e))?;

    let record = JobRecord::new(id, url.to_string(), out_dir, format!("{series}.pdf"));
    let log = record.stderr_log();
    std::fs::write(&log, b"").map_err(|e| HarvestError::io(&log, e))?;

    store.insert(record.clone())?;
    Ok(record)
}

/// Runs a prepared job to completion and returns its final record.
///
/// The job is `done` only when the child exits successfully and the PDF
/// exists.
pub async fn run_job(
    store: &mut JobStore,
    record: &JobRecord,
    options: &HarvestOptions,
    command: &ChildCommand,
    events: &UnboundedSender<JobEvent>,
) -> Result<JobRecord> {
    let args = command.fetch_args(&record.url, record, options);
    info!("Spawning {} {}", command.program.display(), args.join(" "));

    let spawned = Command::new(&command.program)
        .args(&args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn();

    let mut child = match spawned {
        Ok(child) => child,
        Err(e) => {
            let message = format!("Spawn error: {e}");
            let _ = events.send(JobEvent::Error {
                message: message.clone(),
            });
            return Ok(store.fail(&record.id, message)?.clone());
        }
    };

    let stdout = child.stdout.take().context("Child stdout not captured")?;
    let stderr = child.stderr.take().context("Child stderr not captured")?;
    let log_path = record.stderr_log();

    let forward_stdout = async {
        let mut lines = BufReader::new(stdout).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let _ = events.send(JobEvent::Line(line));
        }
    };

    let forward_stderr = async {
        let mut collected = String::new();
        let mut log = match tokio::fs::OpenOptions::new().append(true).create(true).open(&log_path).await {
            Ok(file) => Some(file),
            Err(e) => {
                warn!("Cannot open {}: {}", log_path.display(), e);
                None
            }
        };
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if let Some(file) = log.as_mut() {
                let _ = file.write_all(format!("{line}\n").as_bytes()).await;
            }
            if !line.trim().is_empty() {
                let _ = events.send(JobEvent::Line(format!("ERR: {line}")));
            }
            collected.push_str(&line);
            collected.push('\n');
        }
        if let Some(file) = log.as_mut() {
            let _ = file.flush().await;
        }
        collected
    };

    let ((), stderr_text, status) = tokio::join!(forward_stdout, forward_stderr, child.wait());
    let status = status.context("Failed to wait for child process")?;

    if status.success() && record.pdf_path.exists() {
        let done = store.complete(&record.id)?.clone();
        let _ = events.send(JobEvent::Line(format!("PDF generated: {}", done.pdf_path.display())));
        let _ = events.send(JobEvent::Done {
            pdf_path: done.pdf_path.clone(),
        });
        return Ok(done);
    }

    let message = summarize_failure(&stderr_text, status.code());
    let failed = store.fail(&record.id, message.clone())?.clone();
    let _ = events.send(JobEvent::Line(format!("ERR: See log: {}", log_path.display())));
    let _ = events.send(JobEvent::Error { message });
    Ok(failed)
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;

    use super::*;

    fn record_in(root: &Path, id: &str) -> JobRecord {
        let out_dir = root.join(id).join("tower-ep1");
        std::fs::create_dir_all(&out_dir).unwrap();
        JobRecord::new(
            id.to_string(),
            "https://example.com/tower/ep1".to_string(),
            out_dir,
            "tower-ep1.pdf".to_string(),
        )
    }

    #[test]
    fn test_status_only_moves_forward() {
        assert!(JobStatus::Started.can_become(JobStatus::Done));
        assert!(JobStatus::Started.can_become(JobStatus::Error));
        assert!(!JobStatus::Started.can_become(JobStatus::Started));
        assert!(!JobStatus::Done.can_become(JobStatus::Error));
        assert!(!JobStatus::Error.can_become(JobStatus::Done));
        assert!(!JobStatus::Done.can_become(JobStatus::Started));
    }

    #[test]
    fn test_terminal_job_cannot_change() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = JobStore::new(dir.path());
        store.insert(record_in(dir.path(), "1")).unwrap();

        store.complete("1").unwrap();
        assert!(store.fail("1", "late failure").is_err());
        assert_eq!(store.get("1").unwrap().status, JobStatus::Done);
        assert!(store.complete("missing").is_err());
    }

    #[test]
    fn test_status_rehydrates_from_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = JobStore::new(dir.path());
        store.insert(record_in(dir.path(), "42")).unwrap();
        store.fail("42", "boom").unwrap();

        let mut fresh = JobStore::new(dir.path());
        let record = fresh.status("42").unwrap().unwrap();
        assert_eq!(record.status, JobStatus::Error);
        assert_eq!(record.error_message.as_deref(), Some("boom"));
        assert_eq!(record.file_name, "tower-ep1.pdf");
        assert!(fresh.get("42").is_some());

        assert!(fresh.status("nope").unwrap().is_none());
    }

    #[test]
    fn test_snapshot_uses_camel_case_fields() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = JobStore::new(dir.path());
        let record = record_in(dir.path(), "7");
        let meta = record.out_dir.join(META_FILE);
        store.insert(record).unwrap();

        let json: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(meta).unwrap()).unwrap();
        assert_eq!(json["status"], "started");
        assert_eq!(json["fileName"], "tower-ep1.pdf");
        assert!(json["errorMessage"].is_null());
    }

    #[test]
    fn test_failure_summary_recognizes_missing_browser() {
        let msg = summarize_failure("Error: failed to launch browser: Could not auto detect a chrome executable", Some(1));
        assert!(msg.starts_with("Chromium not found"));
    }

    #[test]
    fn test_failure_summary_recognizes_network_errors() {
        let msg = summarize_failure("failed to load https://x: net::ERR_NAME_NOT_RESOLVED", Some(1));
        assert!(msg.starts_with("Network or loading error"));
        let msg = summarize_failure("net::ERR_CONNECTION_REFUSED", Some(1));
        assert!(msg.starts_with("Network or loading error"));
    }

    #[test]
    fn test_failure_summary_keeps_last_lines() {
        let stderr: String = (1..=20).map(|i| format!("line {i}\n\n")).collect();
        let msg = summarize_failure(&stderr, Some(1));
        let lines: Vec<&str> = msg.lines().collect();
        assert_eq!(lines.len(), 15);
        assert_eq!(lines[0], "line 6");
        assert_eq!(lines[14], "line 20");
    }

    #[test]
    fn test_failure_summary_falls_back_to_exit_code() {
        assert_eq!(summarize_failure("", Some(3)), "Process exited with code=3");
        assert!(summarize_failure("  \n", None).contains("code=none"));
    }

    #[test]
    fn test_prepare_rejects_blank_url() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = JobStore::new(dir.path());
        let err = prepare_job(&mut store, "  ", &HarvestConfig::default()).unwrap_err();
        assert!(matches!(err.downcast_ref::<HarvestError>(), Some(HarvestError::Input(_))));
    }

    #[test]
    fn test_prepare_lays_out_job_directory() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = JobStore::new(dir.path());
        let record = prepare_job(
            &mut store,
            "https://www.webtoons.com/en/fantasy/tower-of-god/season-3-ep-180/viewer?title_no=95",
            &HarvestConfig::default(),
        )
        .unwrap();

        assert_eq!(record.status, JobStatus::Started);
        assert_eq!(record.file_name, "fantasy-tower-of-god-ep180.pdf");
        assert_eq!(
            record.out_dir,
            dir.path().join(&record.id).join("fantasy-tower-of-god-ep180")
        );
        assert!(record.stderr_log().is_file());
        assert!(record.out_dir.join(META_FILE).is_file());
    }

    #[test]
    fn test_fetch_args_carry_options() {
        let dir = tempfile::tempdir().unwrap();
        let record = record_in(dir.path(), "9");
        let command = ChildCommand {
            program: PathBuf::from("toonpdf"),
            leading_args: Vec::new(),
        };
        let options = HarvestOptions {
            wait_millis: 2000,
            debug: true,
        };

        let args = command.fetch_args(&record.url, &record, &options);
        assert_eq!(args[0], "fetch");
        assert_eq!(args[3], "tower-ep1.pdf");
        assert!(args.contains(&"--debug".to_string()));
        assert!(args.contains(&"--wait=2000".to_string()));
    }

    #[cfg(unix)]
    fn shell(dir: &Path, script: &str) -> ChildCommand {
        let path = dir.join("fake-fetch.sh");
        std::fs::write(&path, script).unwrap();
        ChildCommand {
            program: PathBuf::from("/bin/sh"),
            leading_args: vec![path.display().to_string()],
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_successful_child_marks_job_done() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = JobStore::new(dir.path().join("jobs"));
        let record = prepare_job(&mut store, "https://example.com/comic/ep-3", &HarvestConfig::default()).unwrap();
        let command = shell(
            dir.path(),
            "echo \"3 images found\"\necho \"slow image\" >&2\n: > \"$3/$4\"\nexit 0\n",
        );

        let (tx, mut rx) = mpsc::unbounded_channel();
        let done = run_job(&mut store, &record, &HarvestOptions::default(), &command, &tx)
            .await
            .unwrap();
        drop(tx);

        assert_eq!(done.status, JobStatus::Done);
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        assert!(events.contains(&JobEvent::Line("3 images found".to_string())));
        assert!(events.contains(&JobEvent::Line("ERR: slow image".to_string())));
        assert_eq!(
            events.last(),
            Some(&JobEvent::Done {
                pdf_path: record.pdf_path.clone()
            })
        );
        let log = std::fs::read_to_string(record.stderr_log()).unwrap();
        assert_eq!(log, "slow image\n");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failing_child_marks_job_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = JobStore::new(dir.path().join("jobs"));
        let record = prepare_job(&mut store, "https://example.com/comic/ep-4", &HarvestConfig::default()).unwrap();
        let command = shell(dir.path(), "echo \"net::ERR_NAME_NOT_RESOLVED\" >&2\nexit 1\n");

        let (tx, _rx) = mpsc::unbounded_channel();
        let failed = run_job(&mut store, &record, &HarvestOptions::default(), &command, &tx)
            .await
            .unwrap();

        assert_eq!(failed.status, JobStatus::Error);
        assert!(failed.error_message.unwrap().starts_with("Network or loading error"));
        let snapshot = load_snapshot(store.root(), &record.id).unwrap().unwrap();
        assert_eq!(snapshot.status, JobStatus::Error);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_success_without_pdf_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = JobStore::new(dir.path().join("jobs"));
        let record = prepare_job(&mut store, "https://example.com/comic/ep-5", &HarvestConfig::default()).unwrap();
        let command = shell(dir.path(), "exit 0\n");

        let (tx, _rx) = mpsc::unbounded_channel();
        let failed = run_job(&mut store, &record, &HarvestOptions::default(), &command, &tx)
            .await
            .unwrap();
        assert_eq!(failed.status, JobStatus::Error);
        assert_eq!(failed.error_message.as_deref(), Some("Process exited with code=0"));
    }

    #[tokio::test]
    async fn test_spawn_failure_marks_job_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = JobStore::new(dir.path().join("jobs"));
        let record = prepare_job(&mut store, "https://example.com/comic/ep-6", &HarvestConfig::default()).unwrap();
        let command = ChildCommand {
            program: dir.path().join("does-not-exist"),
            leading_args: Vec::new(),
        };

        let (tx, mut rx) = mpsc::unbounded_channel();
        let failed = run_job(&mut store, &record, &HarvestOptions::default(), &command, &tx)
            .await
            .unwrap();
        assert_eq!(failed.status, JobStatus::Error);
        assert!(failed.error_message.unwrap().starts_with("Spawn error:"));
        assert!(matches!(rx.recv().await, Some(JobEvent::Error { .. })));
    }
}
